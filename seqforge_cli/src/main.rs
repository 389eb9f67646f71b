use seqforge_core::campaign::run_campaign;
use seqforge_core::config::{CorpusType, RunnerType, SeqforgeConfig};
use seqforge_core::corpus::{Corpus, InMemoryCorpus, OnDiskCorpus};
use seqforge_core::runner::{CommandRunner, Runner, SimulatedRunner};
use seqforge_core::surface::SurfaceRegistry;

use clap::Parser;
use std::path::PathBuf;
use std::time::Instant;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,
    /// Target library id, e.g. "cjson" or "sqlite3". Overrides the config.
    #[clap(short, long)]
    library: Option<String>,
    #[clap(short, long)]
    batches: Option<u64>,
    #[clap(long)]
    base_seed: Option<u64>,
    /// Append a deliberate double-finalize to every sequence.
    #[clap(long)]
    negative: bool,
}

fn main() -> Result<(), anyhow::Error> {
    env_logger::init();
    let cli = Cli::parse();

    let config = match cli.config_file {
        Some(config_path) => {
            println!("Loading configuration from specified path: {config_path:?}");
            SeqforgeConfig::load_from_file(&config_path)?
        }
        None => {
            let default_config_path = PathBuf::from("seqforge.toml");
            if default_config_path.exists() {
                println!(
                    "No config file specified via CLI, loading default: {default_config_path:?}"
                );
                SeqforgeConfig::load_from_file(&default_config_path)?
            } else {
                println!(
                    "No config file specified and default 'seqforge.toml' not found, using built-in defaults."
                );
                SeqforgeConfig::default()
            }
        }
    };

    let registry = SurfaceRegistry::with_builtin();
    let library = cli
        .library
        .or_else(|| config.campaign.as_ref().and_then(|c| c.library.clone()))
        .ok_or_else(|| {
            anyhow::anyhow!(
                "No target library selected. Pass --library or set campaign.library. Known libraries: {}",
                registry.library_ids().join(", ")
            )
        })?;
    let surface = registry.describe(&library)?;

    let mut settings = config.campaign_settings();
    if let Some(batches) = cli.batches {
        settings.batches = batches;
    }
    if let Some(base_seed) = cli.base_seed {
        settings.base_seed = base_seed;
    }
    if cli.negative {
        settings.synthesis.negative_double_finalize = true;
    }

    let runner: Box<dyn Runner> = match config.runner.runner_type {
        RunnerType::Simulated => Box::new(SimulatedRunner::new()),
        RunnerType::Command => {
            let cmd_settings = config.runner.command_settings.clone().ok_or_else(|| {
                anyhow::anyhow!("Runner type is 'command' but [runner.command-settings] is missing")
            })?;
            Box::new(CommandRunner::new(
                cmd_settings.command,
                cmd_settings.working_dir,
            )?)
        }
    };

    let corpus_config = config.corpus.clone().unwrap_or_default();
    let mut corpus: Box<dyn Corpus> = match corpus_config.corpus_type {
        CorpusType::OnDisk => {
            println!("Using on-disk corpus at {:?}", corpus_config.on_disk_path);
            Box::new(OnDiskCorpus::new(corpus_config.on_disk_path)?)
        }
        CorpusType::InMemory => Box::new(InMemoryCorpus::new()),
    };

    println!(
        "Starting campaign against '{library}': {} batches of {} across {} workers...",
        settings.batches, settings.batch_size, settings.workers
    );
    let start_time = Instant::now();
    let stats = run_campaign(&surface, runner.as_ref(), corpus.as_mut(), &settings)?;
    let elapsed = start_time.elapsed();

    println!("\nCampaign finished in {elapsed:.2?}.");
    println!(
        "Batches: {}{}, Executions: {}, Accepted: {}, Duplicates: {}",
        stats.batches_run,
        if stats.converged { " (converged)" } else { "" },
        stats.executions,
        stats.accepted,
        stats.duplicates
    );
    println!(
        "Outcomes: {} completed, {} crashes, {} timeouts, {} assertion failures",
        stats.completed, stats.crashes, stats.timeouts, stats.assertion_failures
    );
    println!(
        "Coverage: {} distinct branches, corpus size {}",
        stats.final_coverage,
        corpus.len()
    );

    Ok(())
}
