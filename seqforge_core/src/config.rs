use crate::campaign::CampaignSettings;
use crate::synthesizer::SynthesisSettings;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RunnerType {
    #[default]
    Simulated,
    Command,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CommandRunnerSettings {
    /// Harness command line. `{seed}` and `{trace}` placeholders are
    /// substituted with the staged file paths.
    pub command: Vec<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    pub working_dir: Option<PathBuf>,
}

fn default_timeout_ms() -> u64 {
    2000
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct RunnerConfig {
    #[serde(default)]
    pub runner_type: RunnerType,
    #[serde(default)]
    pub command_settings: Option<CommandRunnerSettings>,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CorpusType {
    #[default]
    InMemory,
    OnDisk,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CorpusConfig {
    #[serde(default)]
    pub corpus_type: CorpusType,
    #[serde(default = "default_on_disk_path")]
    pub on_disk_path: PathBuf,
}

pub fn default_on_disk_path() -> PathBuf {
    PathBuf::from("./.seqforge_corpus")
}

impl Default for CorpusConfig {
    fn default() -> Self {
        Self {
            corpus_type: CorpusType::default(),
            on_disk_path: default_on_disk_path(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CampaignConfig {
    /// Target library id; may be overridden on the command line.
    pub library: Option<String>,
    #[serde(default = "default_batches")]
    pub batches: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: u64,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default)]
    pub base_seed: u64,
    #[serde(default = "default_quiet_round_limit")]
    pub quiet_round_limit: u64,
}

pub fn default_batches() -> u64 {
    8
}
pub fn default_batch_size() -> u64 {
    16
}
pub fn default_workers() -> usize {
    2
}
fn default_quiet_round_limit() -> u64 {
    3
}

impl Default for CampaignConfig {
    fn default() -> Self {
        Self {
            library: None,
            batches: default_batches(),
            batch_size: default_batch_size(),
            workers: default_workers(),
            base_seed: 0,
            quiet_round_limit: default_quiet_round_limit(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct SynthesisConfig {
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    #[serde(default = "default_min_calls")]
    pub min_calls: usize,
    #[serde(default = "default_true")]
    pub cleanup_tail: bool,
    #[serde(default)]
    pub negative_double_finalize: bool,
}

fn default_max_steps() -> usize {
    12
}
fn default_min_calls() -> usize {
    3
}
fn default_true() -> bool {
    true
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            min_calls: default_min_calls(),
            cleanup_tail: true,
            negative_double_finalize: false,
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct SeqforgeConfig {
    #[serde(default)]
    pub campaign: Option<CampaignConfig>,
    #[serde(default)]
    pub synthesis: Option<SynthesisConfig>,
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub corpus: Option<CorpusConfig>,
}

impl SeqforgeConfig {
    pub fn load_from_file(path: &PathBuf) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: SeqforgeConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        Ok(config)
    }

    /// Folds the config sections into runtime campaign settings. The
    /// execution timeout comes from the runner section since the harness
    /// owns the wall clock budget.
    pub fn campaign_settings(&self) -> CampaignSettings {
        let campaign = self.campaign.clone().unwrap_or_default();
        let synthesis = self.synthesis.clone().unwrap_or_default();
        let timeout_ms = self
            .runner
            .command_settings
            .as_ref()
            .map_or_else(default_timeout_ms, |s| s.timeout_ms);

        CampaignSettings {
            batches: campaign.batches,
            batch_size: campaign.batch_size,
            workers: campaign.workers,
            base_seed: campaign.base_seed,
            timeout: Duration::from_millis(timeout_ms),
            quiet_round_limit: campaign.quiet_round_limit,
            synthesis: SynthesisSettings {
                max_steps: synthesis.max_steps,
                min_calls: synthesis.min_calls,
                cleanup_tail: synthesis.cleanup_tail,
                negative_double_finalize: synthesis.negative_double_finalize,
            },
            ..CampaignSettings::default()
        }
    }
}
