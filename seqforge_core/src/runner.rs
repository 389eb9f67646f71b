use crate::seed::{emit_body, BodyEmitError};
use crate::sequence::{CallSequence, SequenceError};
use crate::surface::ApiSurface;
use crate::tracker::TrackerError;
use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};
use thiserror::Error;

/// How one execution of a sequence harness ended.
///
/// `Completed` means the harness ran every call and returned the fixed
/// completion sentinel (exit code 66). Any other normal exit is an
/// assertion failure; signal deaths carry the signal number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub enum ExecutionOutcome {
    Completed,
    Crashed(i32),
    TimedOut,
    AssertionFailed,
}

impl ExecutionOutcome {
    pub fn is_completed(self) -> bool {
        self == ExecutionOutcome::Completed
    }
}

/// Outcome plus the branch identifiers observed during the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub outcome: ExecutionOutcome,
    pub branches: Vec<String>,
}

#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("I/O failure while staging the target run: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to spawn target command {command:?}: {source}")]
    Spawn {
        command: Vec<String>,
        source: std::io::Error,
    },

    #[error("Target runner was given an empty command line")]
    EmptyCommand,

    #[error("Temporary path is not valid UTF-8")]
    NonUtf8Path,

    #[error("Cannot emit a runnable body: {0}")]
    Emit(#[from] BodyEmitError),
}

/// Executes a sequence and reports the outcome together with the observed
/// branch trace. Implementations must be deterministic for a fixed
/// sequence, up to target wall-clock behavior.
pub trait Runner: Send + Sync {
    fn run(
        &self,
        sequence: &CallSequence,
        surface: &ApiSurface,
        timeout: Duration,
    ) -> Result<RunReport, RunnerError>;
}

/// Runs a sequence through an external harness command.
///
/// The emitted C body is written to a temporary seed file and the harness
/// is expected to write one branch identifier per line into the trace
/// file. `{seed}` and `{trace}` placeholders in the configured arguments
/// are substituted with those paths.
pub struct CommandRunner {
    command: Vec<String>,
    working_dir: Option<PathBuf>,
}

impl CommandRunner {
    pub fn new(command: Vec<String>, working_dir: Option<PathBuf>) -> Result<Self, RunnerError> {
        if command.is_empty() {
            return Err(RunnerError::EmptyCommand);
        }
        Ok(Self {
            command,
            working_dir,
        })
    }

    fn wait_with_timeout(
        &self,
        mut child: Child,
        timeout: Duration,
    ) -> Result<Option<std::process::ExitStatus>, RunnerError> {
        let start_time = Instant::now();
        loop {
            match child.try_wait()? {
                Some(status) => return Ok(Some(status)),
                None => {
                    if start_time.elapsed() > timeout {
                        log::warn!("target exceeded {timeout:?}, killing");
                        child.kill()?;
                        let _ = child.wait();
                        return Ok(None);
                    }
                    std::thread::sleep(Duration::from_millis(20));
                }
            }
        }
    }
}

impl Runner for CommandRunner {
    fn run(
        &self,
        sequence: &CallSequence,
        surface: &ApiSurface,
        timeout: Duration,
    ) -> Result<RunReport, RunnerError> {
        // A zero budget cannot finish any non-trivial run; report the
        // timeout without spawning.
        if timeout.is_zero() && !sequence.is_empty() {
            return Ok(RunReport {
                outcome: ExecutionOutcome::TimedOut,
                branches: Vec::new(),
            });
        }

        let seed_file = tempfile::NamedTempFile::new()?;
        std::fs::write(seed_file.path(), emit_body(sequence, surface)?)?;
        let trace_file = tempfile::NamedTempFile::new()?;

        let seed_path = seed_file
            .path()
            .to_str()
            .ok_or(RunnerError::NonUtf8Path)?
            .to_string();
        let trace_path = trace_file
            .path()
            .to_str()
            .ok_or(RunnerError::NonUtf8Path)?
            .to_string();

        let mut cmd = Command::new(&self.command[0]);
        for arg in &self.command[1..] {
            cmd.arg(arg.replace("{seed}", &seed_path).replace("{trace}", &trace_path));
        }
        if let Some(cwd) = &self.working_dir {
            cmd.current_dir(cwd);
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::null());

        log::debug!("running {:?} for sequence {}", self.command, sequence.content_hash());
        let child = cmd.spawn().map_err(|source| RunnerError::Spawn {
            command: self.command.clone(),
            source,
        })?;

        let outcome = match self.wait_with_timeout(child, timeout)? {
            None => ExecutionOutcome::TimedOut,
            Some(status) => match status.code() {
                Some(66) => ExecutionOutcome::Completed,
                Some(_) => ExecutionOutcome::AssertionFailed,
                None => {
                    #[cfg(unix)]
                    {
                        use std::os::unix::process::ExitStatusExt;
                        match status.signal() {
                            Some(signal) => ExecutionOutcome::Crashed(signal),
                            None => ExecutionOutcome::AssertionFailed,
                        }
                    }
                    #[cfg(not(unix))]
                    {
                        ExecutionOutcome::AssertionFailed
                    }
                }
            },
        };

        // Partial traces from crashed or killed targets are still coverage.
        let branches: Vec<String> = std::fs::read_to_string(&trace_path)?
            .lines()
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        Ok(RunReport { outcome, branches })
    }
}

/// Harness-free runner that replays the sequence against the lifecycle
/// rules and derives a deterministic branch subset per call.
///
/// A clean replay completes; a deliberate double-finalize surfaces as a
/// signal-6 crash, the way an allocator abort would. Other lifecycle
/// violations surface as assertion failures.
#[derive(Debug, Default)]
pub struct SimulatedRunner;

impl SimulatedRunner {
    pub fn new() -> Self {
        Self
    }

    fn branches_for(sequence: &CallSequence, surface: &ApiSurface) -> Vec<String> {
        let mut branches = BTreeSet::new();
        for &idx in &sequence.distinct_descriptors() {
            let desc = surface.descriptor(idx);
            if desc.branch_weight == 0 {
                continue;
            }
            // Stable per (library, call) so repeated runs agree; never more
            // than the call's own branch pool.
            let digest = md5::compute(format!("{}|{}", sequence.library, desc.name));
            let take = (u32::from(digest.0[0]) % desc.branch_weight) + 1;
            branches.extend(desc.branch_ids().take(take as usize));
        }
        branches.into_iter().collect()
    }
}

impl Runner for SimulatedRunner {
    fn run(
        &self,
        sequence: &CallSequence,
        surface: &ApiSurface,
        timeout: Duration,
    ) -> Result<RunReport, RunnerError> {
        if timeout.is_zero() && !sequence.is_empty() {
            return Ok(RunReport {
                outcome: ExecutionOutcome::TimedOut,
                branches: Vec::new(),
            });
        }

        let outcome = match sequence.validate(surface) {
            Ok(()) => ExecutionOutcome::Completed,
            Err(SequenceError::Lifecycle(TrackerError::DoubleFinalize(_))) => {
                ExecutionOutcome::Crashed(6)
            }
            Err(_) => ExecutionOutcome::AssertionFailed,
        };

        Ok(RunReport {
            outcome,
            branches: Self::branches_for(sequence, surface),
        })
    }
}

#[cfg(test)]
mod simulated_runner_tests {
    use super::*;
    use crate::scorer::CoverageSnapshot;
    use crate::surface::builtin_surfaces;
    use crate::synthesizer::{SynthesisSettings, Synthesizer};
    use rand_chacha::ChaCha8Rng;
    use rand_core::SeedableRng;

    fn surface_for(lib: &str) -> ApiSurface {
        builtin_surfaces().into_iter().find(|s| s.library == lib).unwrap()
    }

    fn synthesize(lib: &str, seed: u8, settings: SynthesisSettings) -> (CallSequence, ApiSurface) {
        let surface = surface_for(lib);
        let synth = Synthesizer::new(&surface, settings);
        let mut rng = ChaCha8Rng::from_seed([seed; 32]);
        let seq = synth.synthesize(&mut rng, &CoverageSnapshot::new()).unwrap();
        (seq, surface)
    }

    #[test]
    fn valid_sequences_complete() {
        for (lib, seed) in [("cjson", 1u8), ("zlib", 2), ("sqlite3", 3), ("libpng", 4)] {
            let (seq, surface) = synthesize(lib, seed, SynthesisSettings::default());
            let report = SimulatedRunner::new()
                .run(&seq, &surface, Duration::from_secs(1))
                .unwrap();
            assert_eq!(report.outcome, ExecutionOutcome::Completed, "{lib}");
            assert!(!report.branches.is_empty(), "{lib}: empty branch trace");
        }
    }

    #[test]
    fn observed_branches_never_exceed_static_estimate() {
        for seed in 0..16u8 {
            let (seq, surface) = synthesize("sqlite3", seed, SynthesisSettings::default());
            let report = SimulatedRunner::new()
                .run(&seq, &surface, Duration::from_secs(1))
                .unwrap();
            assert!(report.branches.len() as u64 <= seq.reachable_branches(&surface));
        }
    }

    #[test]
    fn reports_are_deterministic() {
        let (seq, surface) = synthesize("zlib", 7, SynthesisSettings::default());
        let runner = SimulatedRunner::new();
        let a = runner.run(&seq, &surface, Duration::from_secs(1)).unwrap();
        let b = runner.run(&seq, &surface, Duration::from_secs(1)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn deliberate_double_finalize_crashes() {
        let settings = SynthesisSettings {
            negative_double_finalize: true,
            ..SynthesisSettings::default()
        };
        let (seq, surface) = synthesize("cjson", 9, settings);
        assert!(seq.deliberate_violation);

        let report = SimulatedRunner::new()
            .run(&seq, &surface, Duration::from_secs(1))
            .unwrap();
        assert_eq!(report.outcome, ExecutionOutcome::Crashed(6));
    }

    #[test]
    fn zero_timeout_times_out_without_running() {
        let (seq, surface) = synthesize("cjson", 11, SynthesisSettings::default());
        let report = SimulatedRunner::new()
            .run(&seq, &surface, Duration::ZERO)
            .unwrap();
        assert_eq!(report.outcome, ExecutionOutcome::TimedOut);
        assert!(report.branches.is_empty());

        // An empty sequence trivially completes even with no budget.
        let empty = CallSequence::new("cjson");
        let report = SimulatedRunner::new()
            .run(&empty, &surface, Duration::ZERO)
            .unwrap();
        assert_eq!(report.outcome, ExecutionOutcome::Completed);
    }
}
