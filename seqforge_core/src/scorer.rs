use crate::sequence::CallSequence;
use crate::surface::ApiSurface;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Branch and call observations from one execution of a sequence.
///
/// `branches` is the raw stream of hit branch identifiers, deduplicated.
/// The call sets are derived from the sequence itself: every distinct
/// target-API call, and the subset flagged critical by its descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoverageRecord {
    pub branches: BTreeSet<String>,
    pub library_calls: BTreeSet<String>,
    pub critical_calls: BTreeSet<String>,
}

impl CoverageRecord {
    /// Builds a record from a raw branch trace plus the originating
    /// sequence, classifying its calls against the surface.
    pub fn from_trace(
        branches: impl IntoIterator<Item = String>,
        sequence: &CallSequence,
        surface: &ApiSurface,
    ) -> Self {
        let mut library_calls = BTreeSet::new();
        let mut critical_calls = BTreeSet::new();
        for call in &sequence.calls {
            library_calls.insert(call.name.clone());
            if let Some(desc) = surface.calls.get(call.descriptor) {
                if desc.critical {
                    critical_calls.insert(call.name.clone());
                }
            }
        }
        Self {
            branches: branches.into_iter().collect(),
            library_calls,
            critical_calls,
        }
    }
}

/// A versioned, explicitly passed view of the corpus-wide branch coverage.
///
/// Refreshed per batch by whoever owns the corpus; scoring never consults
/// ambient global state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoverageSnapshot {
    version: u64,
    branches: BTreeSet<String>,
}

impl CoverageSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn branches(&self) -> &BTreeSet<String> {
        &self.branches
    }

    pub fn contains(&self, branch: &str) -> bool {
        self.branches.contains(branch)
    }

    pub fn len(&self) -> usize {
        self.branches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.branches.is_empty()
    }

    /// Folds newly observed branches in and bumps the version once.
    pub fn merge<I: IntoIterator<Item = String>>(&mut self, branches: I) {
        self.branches.extend(branches);
        self.version += 1;
    }
}

/// The persisted quality metrics of one accepted sequence.
///
/// `unique_branches` maps each observed branch id to its hit flag, which
/// keeps the serialized form an ordinary JSON object with deterministic
/// key order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityScore {
    pub score: f64,
    pub density: f64,
    pub unique_branches: BTreeMap<String, u32>,
    pub library_calls: Vec<String>,
    pub critical_calls: Vec<String>,
    pub visited: u64,
}

/// Weights of the monotone scoring combination. Each term only ever adds,
/// so a strictly better record can never score lower.
#[derive(Debug, Clone, Copy)]
pub struct ScoreWeights {
    pub density: f64,
    pub critical: f64,
    pub length: f64,
    pub marginal: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            density: 40.0,
            critical: 3.0,
            length: 0.5,
            marginal: 1.0,
        }
    }
}

/// Quantizes to four decimal places so rendered scores parse back to the
/// exact same value.
fn quantize(x: f64) -> f64 {
    (x * 10_000.0).round() / 10_000.0
}

/// Scores one `(sequence, record)` pair against a coverage snapshot.
///
/// Pure function: identical inputs always yield bit-identical scores,
/// independent of execution timing. A record observing more branches than
/// the static reachable estimate is a scoring inconsistency; it is clamped
/// and logged, never fatal.
pub fn score(
    sequence: &CallSequence,
    record: &CoverageRecord,
    snapshot: &CoverageSnapshot,
    weights: &ScoreWeights,
    surface: &ApiSurface,
) -> QualityScore {
    let reachable = sequence.reachable_branches(surface);
    let observed = record.branches.len() as u64;
    if observed > reachable {
        log::warn!(
            "scoring inconsistency for {}: observed {} unique branches, static estimate {}",
            sequence.content_hash(),
            observed,
            reachable
        );
    }
    let density = quantize((observed as f64 / reachable as f64).clamp(0.0, 1.0));

    let marginal = record
        .branches
        .iter()
        .filter(|b| !snapshot.contains(b))
        .count() as f64;

    let library_calls: Vec<String> = record.library_calls.iter().cloned().collect();
    let critical_calls: Vec<String> = record.critical_calls.iter().cloned().collect();

    let score = quantize(
        weights.density * density
            + weights.critical * critical_calls.len() as f64
            + weights.length * sequence.len() as f64
            + weights.marginal * marginal,
    );

    QualityScore {
        score,
        density,
        unique_branches: record.branches.iter().map(|b| (b.clone(), 1)).collect(),
        library_calls,
        critical_calls,
        visited: 1,
    }
}
