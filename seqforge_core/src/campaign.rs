use crate::corpus::{Corpus, CorpusEntry, CorpusError};
use crate::runner::{ExecutionOutcome, RunReport, Runner, RunnerError};
use crate::scorer::{score, CoverageRecord, ScoreWeights};
use crate::seed::{BodyEmitError, SeedEntry};
use crate::sequence::CallSequence;
use crate::surface::ApiSurface;
use crate::synthesizer::{SynthesisError, SynthesisSettings, Synthesizer};
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use std::sync::mpsc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CampaignError {
    #[error(transparent)]
    Corpus(#[from] CorpusError),

    #[error(transparent)]
    Runner(#[from] RunnerError),

    #[error(transparent)]
    Synthesis(#[from] SynthesisError),

    #[error(transparent)]
    Seed(#[from] BodyEmitError),
}

/// Knobs for one campaign over a single library surface.
#[derive(Debug, Clone)]
pub struct CampaignSettings {
    /// Upper bound on batches; the quiet-round rule may stop earlier.
    pub batches: u64,
    /// Sequences synthesized and executed per batch.
    pub batch_size: u64,
    /// Worker threads per batch.
    pub workers: usize,
    /// Base RNG seed; worker rngs are derived from it, so a fixed seed
    /// reproduces the same set of synthesized sequences.
    pub base_seed: u64,
    /// Per-execution wall clock budget.
    pub timeout: Duration,
    /// Stop after this many consecutive batches with no coverage growth.
    /// Zero disables early stopping.
    pub quiet_round_limit: u64,
    pub weights: ScoreWeights,
    pub synthesis: SynthesisSettings,
}

impl Default for CampaignSettings {
    fn default() -> Self {
        Self {
            batches: 8,
            batch_size: 16,
            workers: 2,
            base_seed: 0,
            timeout: Duration::from_secs(2),
            quiet_round_limit: 3,
            weights: ScoreWeights::default(),
            synthesis: SynthesisSettings::default(),
        }
    }
}

/// Counters reported at the end of a campaign.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CampaignStats {
    pub executions: u64,
    pub accepted: u64,
    pub duplicates: u64,
    pub completed: u64,
    pub crashes: u64,
    pub timeouts: u64,
    pub assertion_failures: u64,
    pub batches_run: u64,
    /// True when the quiet-round rule ended the campaign.
    pub converged: bool,
    /// Distinct branches in the final corpus snapshot.
    pub final_coverage: usize,
}

enum WorkerMessage {
    Executed(CallSequence, RunReport),
    SynthesisFailed(SynthesisError),
    RunnerFailed(RunnerError),
}

fn worker_quotas(batch_size: u64, workers: usize) -> Vec<u64> {
    let workers = workers.max(1) as u64;
    (0..workers)
        .map(|w| batch_size / workers + u64::from(w < batch_size % workers))
        .collect()
}

/// Drives synthesize/execute/score/append batches until the batch budget
/// is spent or coverage goes quiet.
///
/// Workers synthesize and execute against the snapshot taken at the start
/// of their batch; the supervisor owns the corpus, deduplicates by content
/// hash and accepts a run when it brings unseen coverage or ends in
/// anything other than a clean completion.
pub fn run_campaign(
    surface: &ApiSurface,
    runner: &dyn Runner,
    corpus: &mut dyn Corpus,
    settings: &CampaignSettings,
) -> Result<CampaignStats, CampaignError> {
    let mut stats = CampaignStats::default();
    let mut quiet_rounds = 0u64;

    for batch in 0..settings.batches {
        let batch_snapshot = corpus.snapshot();
        let coverage_before = batch_snapshot.len();
        let quotas = worker_quotas(settings.batch_size, settings.workers);

        let mut first_error: Option<CampaignError> = None;
        std::thread::scope(|scope| {
            let (tx, rx) = mpsc::channel::<WorkerMessage>();

            for (worker, quota) in quotas.iter().copied().enumerate() {
                let tx = tx.clone();
                let snapshot = batch_snapshot.clone();
                let synthesis = settings.synthesis.clone();
                let timeout = settings.timeout;
                let base_seed = settings.base_seed;
                scope.spawn(move || {
                    let mut rng = ChaCha8Rng::seed_from_u64(
                        base_seed ^ (batch << 16) ^ worker as u64,
                    );
                    let synthesizer = Synthesizer::new(surface, synthesis);
                    for _ in 0..quota {
                        let message = match synthesizer.synthesize(&mut rng, &snapshot) {
                            Ok(sequence) => match runner.run(&sequence, surface, timeout) {
                                Ok(report) => WorkerMessage::Executed(sequence, report),
                                Err(e) => WorkerMessage::RunnerFailed(e),
                            },
                            Err(e) => WorkerMessage::SynthesisFailed(e),
                        };
                        if tx.send(message).is_err() {
                            return;
                        }
                    }
                });
            }
            drop(tx);

            for message in rx {
                let (sequence, report) = match message {
                    WorkerMessage::Executed(sequence, report) => (sequence, report),
                    WorkerMessage::SynthesisFailed(e) => {
                        // A dead end discards only that sequence.
                        log::debug!("discarded sequence: {e}");
                        continue;
                    }
                    WorkerMessage::RunnerFailed(e) => {
                        if first_error.is_none() {
                            first_error = Some(e.into());
                        }
                        continue;
                    }
                };

                stats.executions += 1;
                match report.outcome {
                    ExecutionOutcome::Completed => stats.completed += 1,
                    ExecutionOutcome::Crashed(_) => stats.crashes += 1,
                    ExecutionOutcome::TimedOut => stats.timeouts += 1,
                    ExecutionOutcome::AssertionFailed => stats.assertion_failures += 1,
                }

                let content_hash = sequence.content_hash();
                if corpus.contains_hash(&content_hash) {
                    stats.duplicates += 1;
                    continue;
                }

                let record = CoverageRecord::from_trace(report.branches, &sequence, surface);
                let current = corpus.snapshot();
                let brings_coverage = record.branches.iter().any(|b| !current.contains(b));
                if !brings_coverage && report.outcome.is_completed() {
                    continue;
                }

                let quality = score(&sequence, &record, &batch_snapshot, &settings.weights, surface);
                let seed = match SeedEntry::from_sequence(
                    corpus.len() as u64,
                    format!("{} batch {batch}", surface.library),
                    &sequence,
                    quality,
                    surface,
                ) {
                    Ok(seed) => seed,
                    Err(e) => {
                        if first_error.is_none() {
                            first_error = Some(e.into());
                        }
                        continue;
                    }
                };
                let append = corpus.append(CorpusEntry {
                    seed,
                    sequence,
                    outcome: report.outcome,
                });
                match append {
                    Ok(_) => stats.accepted += 1,
                    Err(e) => {
                        if first_error.is_none() {
                            first_error = Some(e.into());
                        }
                    }
                }
            }
        });
        if let Some(e) = first_error {
            return Err(e);
        }

        stats.batches_run += 1;
        let coverage_after = corpus.snapshot().len();
        log::info!(
            "{}: batch {batch} done, coverage {coverage_before} -> {coverage_after}, corpus {}",
            surface.library,
            corpus.len()
        );

        if coverage_after == coverage_before {
            quiet_rounds += 1;
            if settings.quiet_round_limit > 0 && quiet_rounds >= settings.quiet_round_limit {
                stats.converged = true;
                break;
            }
        } else {
            quiet_rounds = 0;
        }
    }

    stats.final_coverage = corpus.snapshot().len();
    Ok(stats)
}
