use crate::scorer::CoverageSnapshot;
use crate::sequence::{BoundArg, BoundCall, CallSequence, ScalarValue, CONSUMABLE_STATES};
use crate::surface::{
    ApiCallDescriptor, ApiSurface, CallClass, HandleSemantics, HandleTypeId, ParamRole,
    ReturnRole, ScalarKind,
};
use crate::tracker::{InstanceId, LifecycleState, ResourceTracker, TrackerError};
use rand::Rng;
use std::collections::BTreeSet;
use thiserror::Error;

/// Knobs of one synthesis run.
#[derive(Debug, Clone)]
pub struct SynthesisSettings {
    /// Step budget for the whole sequence, cleanup tail included.
    pub max_steps: usize,
    /// A dead end before this many calls discards the sequence.
    pub min_calls: usize,
    /// Finalize every still-live instance at the end of the sequence.
    pub cleanup_tail: bool,
    /// Negative-testing mode: append one deliberate double-finalize after
    /// the cleanup tail and mark the sequence as violating.
    pub negative_double_finalize: bool,
}

impl Default for SynthesisSettings {
    fn default() -> Self {
        Self {
            max_steps: 12,
            min_calls: 3,
            cleanup_tail: true,
            negative_double_finalize: false,
        }
    }
}

#[derive(Error, Debug)]
pub enum SynthesisError {
    /// Dead end: no satisfiable call remains and the sequence is still
    /// below its minimum length. The in-progress sequence is discarded.
    #[error("No satisfiable call after {after_steps} steps (minimum length {min_calls})")]
    NoSatisfiableCall { after_steps: usize, min_calls: usize },

    /// A lifecycle violation during construction is a synthesizer defect,
    /// never silently corrected.
    #[error(transparent)]
    Lifecycle(#[from] TrackerError),
}

/// Scalar pools, one per kind. Small and fixed on purpose; representative
/// literals keep synthesized sequences reproducible across runs.
fn scalar_pool(kind: ScalarKind) -> Vec<ScalarValue> {
    match kind {
        ScalarKind::Int => vec![
            ScalarValue::Int(0),
            ScalarValue::Int(1),
            ScalarValue::Int(-1),
            ScalarValue::Int(9),
            ScalarValue::Int(65535),
        ],
        ScalarKind::Size => vec![
            ScalarValue::Size(0),
            ScalarValue::Size(1),
            ScalarValue::Size(8),
            ScalarValue::Size(4096),
        ],
        ScalarKind::CString => vec![
            ScalarValue::CString(String::new()),
            ScalarValue::CString("k0".to_string()),
            ScalarValue::CString("alpha".to_string()),
            ScalarValue::CString("v1".to_string()),
        ],
        ScalarKind::Buffer => vec![
            ScalarValue::Buffer(String::new()),
            ScalarValue::Buffer("A".to_string()),
            ScalarValue::Buffer("AAAAAAAAAAAAAAAA".to_string()),
        ],
        ScalarKind::Double => vec![
            ScalarValue::Double(0.0),
            ScalarValue::Double(1.5),
            ScalarValue::Double(-2.25),
            ScalarValue::Double(1e6),
        ],
    }
}

/// Builds lifecycle-valid call sequences for one API surface.
///
/// The frontier at each step is the set of satisfiable descriptors: calls
/// whose every handle-consuming parameter can bind to a live instance.
/// Selection favors candidates estimated to reach the most branches not yet
/// in the coverage snapshot, with a uniform pick among the ties; when every
/// candidate estimate is zero the choice degenerates to uniform random,
/// preserving exploration.
pub struct Synthesizer<'a> {
    surface: &'a ApiSurface,
    settings: SynthesisSettings,
}

impl<'a> Synthesizer<'a> {
    pub fn new(surface: &'a ApiSurface, settings: SynthesisSettings) -> Self {
        Self { surface, settings }
    }

    pub fn settings(&self) -> &SynthesisSettings {
        &self.settings
    }

    /// A call is satisfiable when every handle-consuming parameter can bind
    /// a live instance; unique handles need one distinct instance per
    /// parameter, aliased ones may share.
    fn is_satisfiable(&self, desc: &ApiCallDescriptor, tracker: &ResourceTracker) -> bool {
        let mut demand: Vec<(HandleTypeId, usize)> = Vec::new();
        for ht in desc.consumed_types() {
            match demand.iter_mut().find(|(t, _)| *t == ht) {
                Some((_, n)) => *n += 1,
                None => demand.push((ht, 1)),
            }
        }
        demand.iter().all(|(ht, n)| {
            let available = tracker.consumable_of_type(*ht).len();
            match self.surface.handle_type(*ht).semantics {
                HandleSemantics::Unique => available >= *n,
                HandleSemantics::Aliased => available >= 1,
            }
        })
    }

    /// Estimated previously-uncovered branches reachable through `desc`,
    /// relative to the snapshot plus everything already picked this run.
    fn marginal_estimate(&self, desc: &ApiCallDescriptor, covered: &BTreeSet<String>) -> usize {
        desc.branch_ids().filter(|id| !covered.contains(id)).count()
    }

    /// Binds one descriptor: draws scalar values, picks consumed instances,
    /// allocates produced ones, and applies the lifecycle transition the
    /// descriptor class implies.
    fn bind_call<R: Rng + ?Sized>(
        &self,
        desc_index: usize,
        tracker: &mut ResourceTracker,
        seq: &mut CallSequence,
        rng: &mut R,
    ) -> Result<(), SynthesisError> {
        let desc = self.surface.descriptor(desc_index);
        let mut args = Vec::with_capacity(desc.params.len());
        let mut consumed = Vec::new();

        for param in &desc.params {
            match param {
                ParamRole::ConsumesHandle(ht) => {
                    let mut pool = tracker.consumable_of_type(*ht);
                    if self.surface.handle_type(*ht).semantics == HandleSemantics::Unique {
                        pool.retain(|id| !consumed.contains(id));
                    }
                    debug_assert!(!pool.is_empty(), "unsatisfiable call reached binding");
                    let id = pool[rng.random_range(0..pool.len())];
                    consumed.push(id);
                    args.push(BoundArg::Handle(id));
                }
                ParamRole::ProducesHandle(ht) => {
                    let id = tracker.create(*ht);
                    seq.instance_types.push(*ht);
                    args.push(BoundArg::OutHandle(id));
                }
                ParamRole::Scalar(kind) => {
                    let pool = scalar_pool(*kind);
                    args.push(BoundArg::Scalar(pool[rng.random_range(0..pool.len())].clone()));
                }
                ParamRole::Fixed(text) => args.push(BoundArg::Fixed((*text).to_string())),
            }
        }

        let ret_handle = match desc.ret {
            ReturnRole::ProducesHandle(ht) => {
                let id = tracker.create(ht);
                seq.instance_types.push(ht);
                Some(id)
            }
            ReturnRole::Status | ReturnRole::Void => None,
        };

        match desc.class {
            CallClass::Configure => {
                for id in &consumed {
                    tracker.transition(*id, &CONSUMABLE_STATES, LifecycleState::Configured)?;
                }
            }
            CallClass::Operate => {
                for id in &consumed {
                    tracker.transition(*id, &CONSUMABLE_STATES, LifecycleState::Operated)?;
                }
            }
            CallClass::Cleanup => {
                for id in &consumed {
                    tracker.finalize(*id)?;
                }
            }
            CallClass::Create | CallClass::Validate => {}
        }

        seq.calls.push(BoundCall {
            descriptor: desc_index,
            name: desc.name.to_string(),
            args,
            ret_handle,
        });
        Ok(())
    }

    /// Synthesizes one lifecycle-valid sequence.
    ///
    /// The main phase never emits cleanup-class calls; the cleanup tail
    /// finalizes every live instance so each handle is finalized at most
    /// once. Budget accounting reserves one step per live instance for that
    /// tail.
    pub fn synthesize<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        snapshot: &CoverageSnapshot,
    ) -> Result<CallSequence, SynthesisError> {
        let mut tracker = ResourceTracker::new();
        let mut seq = CallSequence::new(self.surface.library);
        let mut covered: BTreeSet<String> = snapshot.branches().clone();

        loop {
            let satisfiable: Vec<usize> = self
                .surface
                .calls
                .iter()
                .enumerate()
                .filter(|(_, d)| d.class != CallClass::Cleanup && self.is_satisfiable(d, &tracker))
                .map(|(i, _)| i)
                .collect();

            if satisfiable.is_empty() {
                if seq.len() < self.settings.min_calls {
                    return Err(SynthesisError::NoSatisfiableCall {
                        after_steps: seq.len(),
                        min_calls: self.settings.min_calls,
                    });
                }
                break;
            }

            // A pick must leave room to finalize everything alive after it,
            // its own produced instances included.
            let cleanup_cost = if self.settings.cleanup_tail {
                tracker.live_instances().len()
            } else {
                0
            };
            let candidates: Vec<usize> = satisfiable
                .into_iter()
                .filter(|&i| {
                    let produced = if self.settings.cleanup_tail {
                        self.surface.descriptor(i).produced_types().len()
                    } else {
                        0
                    };
                    seq.len() + 1 + cleanup_cost + produced <= self.settings.max_steps
                })
                .collect();

            // Budget exhausted: a shorter but valid sequence.
            if candidates.is_empty() {
                break;
            }

            let estimates: Vec<usize> = candidates
                .iter()
                .map(|&i| self.marginal_estimate(self.surface.descriptor(i), &covered))
                .collect();
            let best = estimates.iter().copied().max().unwrap_or(0);
            let pool: Vec<usize> = if best > 0 {
                candidates
                    .iter()
                    .zip(&estimates)
                    .filter(|(_, e)| **e == best)
                    .map(|(i, _)| *i)
                    .collect()
            } else {
                candidates
            };

            let pick = pool[rng.random_range(0..pool.len())];
            self.bind_call(pick, &mut tracker, &mut seq, rng)?;
            covered.extend(self.surface.descriptor(pick).branch_ids());
        }

        if self.settings.cleanup_tail {
            self.append_cleanup_tail(&mut tracker, &mut seq)?;
        } else {
            let leaked = tracker.live_instances();
            if !leaked.is_empty() {
                log::debug!(
                    "sequence {} leaks {} instance(s)",
                    seq.content_hash(),
                    leaked.len()
                );
            }
        }

        if self.settings.negative_double_finalize {
            self.append_double_finalize(&mut tracker, &mut seq)?;
        }

        Ok(seq)
    }

    /// The cleanup invocation for one instance, if the surface declares a
    /// destroyer for its type.
    fn destroyer_call(&self, id: InstanceId, ht: HandleTypeId) -> Option<BoundCall> {
        let &destroyer = self.surface.destroyers_of(ht).first()?;
        let desc = self.surface.descriptor(destroyer);
        let args = desc
            .params
            .iter()
            .map(|p| match p {
                ParamRole::ConsumesHandle(_) => BoundArg::Handle(id),
                ParamRole::Fixed(text) => BoundArg::Fixed((*text).to_string()),
                ParamRole::Scalar(kind) => BoundArg::Scalar(scalar_pool(*kind)[0].clone()),
                ParamRole::ProducesHandle(_) => {
                    unreachable!("cleanup descriptors do not produce handles")
                }
            })
            .collect();
        Some(BoundCall {
            descriptor: destroyer,
            name: desc.name.to_string(),
            args,
            ret_handle: None,
        })
    }

    /// Finalizes every live instance, most recently created first, matching
    /// the teardown order of the seed corpus shape.
    fn append_cleanup_tail(
        &self,
        tracker: &mut ResourceTracker,
        seq: &mut CallSequence,
    ) -> Result<(), SynthesisError> {
        let mut live = tracker.live_instances();
        live.reverse();
        for id in live {
            let ht = tracker.handle_type(id)?;
            let Some(call) = self.destroyer_call(id, ht) else {
                log::warn!(
                    "no cleanup descriptor for handle type {:?} in {}, leaking {}",
                    ht,
                    self.surface.library,
                    id
                );
                continue;
            };
            tracker.finalize(id)?;
            seq.calls.push(call);
        }
        Ok(())
    }

    /// Appends a second finalize on an already-finalized instance. When no
    /// instance was finalized yet (no cleanup tail), a live one is
    /// finalized first so the repeat still lands. Only for negative
    /// testing; the sequence is marked so it never passes validation
    /// unnoticed.
    fn append_double_finalize(
        &self,
        tracker: &mut ResourceTracker,
        seq: &mut CallSequence,
    ) -> Result<(), SynthesisError> {
        let finalized = (0..tracker.len())
            .map(InstanceId)
            .find(|id| matches!(tracker.state(*id), Ok(LifecycleState::Finalized)));
        let (target, needs_first_finalize) = match finalized {
            Some(id) => (id, false),
            None => match tracker.live_instances().first().copied() {
                Some(id) => (id, true),
                None => {
                    log::warn!(
                        "negative mode requested but the sequence holds no instances"
                    );
                    return Ok(());
                }
            },
        };
        let ht = tracker.handle_type(target)?;
        let Some(call) = self.destroyer_call(target, ht) else {
            log::warn!(
                "negative mode requested but handle type {:?} has no cleanup call in {}",
                ht,
                self.surface.library
            );
            return Ok(());
        };
        if needs_first_finalize {
            tracker.finalize(target)?;
            seq.calls.push(call.clone());
        }
        seq.calls.push(call);
        seq.deliberate_violation = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence::SequenceError;
    use crate::surface::{
        builtin_surfaces, ApiSurface, CallClass, HandleSemantics, HandleStorage, HandleType,
        HandleTypeId, ReturnRole,
    };
    use rand_chacha::ChaCha8Rng;
    use rand_core::SeedableRng;

    fn surface(lib: &str) -> ApiSurface {
        builtin_surfaces().into_iter().find(|s| s.library == lib).unwrap()
    }

    /// A surface with exactly one creator, one consumer, and one destroyer.
    fn minimal_surface() -> ApiSurface {
        let h = HandleTypeId(0);
        ApiSurface {
            library: "minimal",
            header: "minimal.h",
            handle_types: vec![HandleType {
                name: "thing",
                c_type: "thing_t",
                semantics: HandleSemantics::Unique,
                storage: HandleStorage::Pointer,
            }],
            calls: vec![
                ApiCallDescriptor {
                    name: "thing_new",
                    params: vec![],
                    ret: ReturnRole::ProducesHandle(h),
                    class: CallClass::Create,
                    critical: false,
                    branch_weight: 4,
                },
                ApiCallDescriptor {
                    name: "thing_use",
                    params: vec![ParamRole::ConsumesHandle(h)],
                    ret: ReturnRole::Status,
                    class: CallClass::Operate,
                    critical: false,
                    branch_weight: 8,
                },
                ApiCallDescriptor {
                    name: "thing_free",
                    params: vec![ParamRole::ConsumesHandle(h)],
                    ret: ReturnRole::Void,
                    class: CallClass::Cleanup,
                    critical: true,
                    branch_weight: 2,
                },
            ],
        }
    }

    #[test]
    fn budget_three_always_yields_create_use_destroy() {
        let surface = minimal_surface();
        let settings = SynthesisSettings {
            max_steps: 3,
            min_calls: 1,
            cleanup_tail: true,
            negative_double_finalize: false,
        };
        let synth = Synthesizer::new(&surface, settings);
        for seed in 0..64u8 {
            let mut rng = ChaCha8Rng::from_seed([seed; 32]);
            let seq = synth.synthesize(&mut rng, &CoverageSnapshot::new()).unwrap();
            let names: Vec<&str> = seq.calls.iter().map(|c| c.name.as_str()).collect();
            assert_eq!(names, vec!["thing_new", "thing_use", "thing_free"]);
            seq.validate(&surface).unwrap();
        }
    }

    #[test]
    fn synthesized_sequences_are_lifecycle_valid_for_every_builtin_library() {
        for lib in ["cjson", "zlib", "sqlite3", "re2", "libpng", "lcms2", "libpcap"] {
            let surface = surface(lib);
            let synth = Synthesizer::new(&surface, SynthesisSettings::default());
            for seed in 0..16u8 {
                let mut rng = ChaCha8Rng::from_seed([seed; 32]);
                let seq = synth.synthesize(&mut rng, &CoverageSnapshot::new()).unwrap();
                assert!(!seq.is_empty(), "{lib} produced an empty sequence");
                seq.validate(&surface)
                    .unwrap_or_else(|e| panic!("{lib} seed {seed}: {e}"));
                assert!(!seq.deliberate_violation);
            }
        }
    }

    #[test]
    fn synthesis_is_deterministic_for_a_fixed_seed() {
        let surface = surface("sqlite3");
        let synth = Synthesizer::new(&surface, SynthesisSettings::default());
        let mut rng_a = ChaCha8Rng::from_seed([7; 32]);
        let mut rng_b = ChaCha8Rng::from_seed([7; 32]);
        let a = synth.synthesize(&mut rng_a, &CoverageSnapshot::new()).unwrap();
        let b = synth.synthesize(&mut rng_b, &CoverageSnapshot::new()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn cleanup_tail_finalizes_every_instance() {
        let surface = surface("sqlite3");
        let synth = Synthesizer::new(&surface, SynthesisSettings::default());
        let mut rng = ChaCha8Rng::from_seed([3; 32]);
        let seq = synth.synthesize(&mut rng, &CoverageSnapshot::new()).unwrap();
        assert!(
            seq.leaked_instances(&surface).is_empty(),
            "cleanup tail left live instances"
        );
    }

    #[test]
    fn negative_mode_marks_the_sequence_and_fails_validation() {
        let surface = minimal_surface();
        let settings = SynthesisSettings {
            max_steps: 4,
            min_calls: 1,
            cleanup_tail: true,
            negative_double_finalize: true,
        };
        let synth = Synthesizer::new(&surface, settings);
        let mut rng = ChaCha8Rng::from_seed([11; 32]);
        let seq = synth.synthesize(&mut rng, &CoverageSnapshot::new()).unwrap();
        assert!(seq.deliberate_violation);
        assert!(seq.validate(&surface).is_err());
    }

    /// A creator producing one handle through an out-parameter and a second
    /// through its return value, pipe-style.
    fn dual_producer_surface() -> ApiSurface {
        let h = HandleTypeId(0);
        ApiSurface {
            library: "duplex",
            header: "duplex.h",
            handle_types: vec![HandleType {
                name: "endpoint",
                c_type: "duplex_end",
                semantics: HandleSemantics::Unique,
                storage: HandleStorage::Pointer,
            }],
            calls: vec![
                ApiCallDescriptor {
                    name: "duplex_open",
                    params: vec![ParamRole::ProducesHandle(h)],
                    ret: ReturnRole::ProducesHandle(h),
                    class: CallClass::Create,
                    critical: false,
                    branch_weight: 4,
                },
                ApiCallDescriptor {
                    name: "duplex_send",
                    params: vec![ParamRole::ConsumesHandle(h)],
                    ret: ReturnRole::Status,
                    class: CallClass::Operate,
                    critical: false,
                    branch_weight: 6,
                },
                ApiCallDescriptor {
                    name: "duplex_close",
                    params: vec![ParamRole::ConsumesHandle(h)],
                    ret: ReturnRole::Void,
                    class: CallClass::Cleanup,
                    critical: true,
                    branch_weight: 1,
                },
            ],
        }
    }

    #[test]
    fn dual_producer_output_passes_validation() {
        let surface = dual_producer_surface();
        let settings = SynthesisSettings { max_steps: 6, min_calls: 1, ..Default::default() };
        let synth = Synthesizer::new(&surface, settings);
        for seed in 0..32u8 {
            let mut rng = ChaCha8Rng::from_seed([seed; 32]);
            let seq = synth.synthesize(&mut rng, &CoverageSnapshot::new()).unwrap();
            seq.validate(&surface)
                .unwrap_or_else(|e| panic!("seed {seed}: {e}"));
        }
        // The out-parameter id is allocated before the return id.
        let mut rng = ChaCha8Rng::from_seed([1; 32]);
        let seq = synth.synthesize(&mut rng, &CoverageSnapshot::new()).unwrap();
        let open = seq.calls.iter().find(|c| c.name == "duplex_open").unwrap();
        assert_eq!(open.args, vec![BoundArg::OutHandle(InstanceId(0))]);
        assert_eq!(open.ret_handle, Some(InstanceId(1)));
    }

    #[test]
    fn produced_handles_stay_within_the_step_budget() {
        let surface = dual_producer_surface();
        for max_steps in [3usize, 4, 5, 6] {
            let settings = SynthesisSettings { max_steps, min_calls: 1, ..Default::default() };
            let synth = Synthesizer::new(&surface, settings);
            for seed in 0..16u8 {
                let mut rng = ChaCha8Rng::from_seed([seed; 32]);
                let seq = synth.synthesize(&mut rng, &CoverageSnapshot::new()).unwrap();
                assert!(
                    seq.len() <= max_steps,
                    "max {max_steps}: sequence ran to {} calls",
                    seq.len()
                );
                seq.validate(&surface).unwrap();
                assert!(seq.leaked_instances(&surface).is_empty());
            }
        }
    }

    #[test]
    fn negative_mode_without_cleanup_tail_still_violates() {
        let surface = minimal_surface();
        let settings = SynthesisSettings {
            max_steps: 4,
            min_calls: 1,
            cleanup_tail: false,
            negative_double_finalize: true,
        };
        let synth = Synthesizer::new(&surface, settings);
        let mut rng = ChaCha8Rng::from_seed([5; 32]);
        let seq = synth.synthesize(&mut rng, &CoverageSnapshot::new()).unwrap();
        assert!(seq.deliberate_violation);
        // One legitimate finalize plus the deliberate repeat.
        let frees = seq.calls.iter().filter(|c| c.name == "thing_free").count();
        assert_eq!(frees, 2);
        assert!(matches!(
            seq.validate(&surface),
            Err(SequenceError::Lifecycle(TrackerError::DoubleFinalize(_)))
        ));
    }

    #[test]
    fn unique_consumers_bind_distinct_instances() {
        let h = HandleTypeId(0);
        let surface = ApiSurface {
            library: "mixer",
            header: "mixer.h",
            handle_types: vec![HandleType {
                name: "track",
                c_type: "track_t",
                semantics: HandleSemantics::Unique,
                storage: HandleStorage::Pointer,
            }],
            calls: vec![
                ApiCallDescriptor {
                    name: "track_new",
                    params: vec![],
                    ret: ReturnRole::ProducesHandle(h),
                    class: CallClass::Create,
                    critical: false,
                    branch_weight: 2,
                },
                ApiCallDescriptor {
                    name: "track_mix",
                    params: vec![ParamRole::ConsumesHandle(h), ParamRole::ConsumesHandle(h)],
                    ret: ReturnRole::Status,
                    class: CallClass::Operate,
                    critical: false,
                    branch_weight: 4,
                },
                ApiCallDescriptor {
                    name: "track_free",
                    params: vec![ParamRole::ConsumesHandle(h)],
                    ret: ReturnRole::Void,
                    class: CallClass::Cleanup,
                    critical: true,
                    branch_weight: 1,
                },
            ],
        };
        let settings = SynthesisSettings { max_steps: 10, min_calls: 2, ..Default::default() };
        let synth = Synthesizer::new(&surface, settings);
        for seed in 0..32u8 {
            let mut rng = ChaCha8Rng::from_seed([seed; 32]);
            let seq = synth.synthesize(&mut rng, &CoverageSnapshot::new()).unwrap();
            seq.validate(&surface).unwrap();
            for call in seq.calls.iter().filter(|c| c.name == "track_mix") {
                assert_ne!(call.args[0], call.args[1], "seed {seed} aliased a unique track");
            }
        }
    }

    #[test]
    fn guided_selection_prefers_uncovered_descriptors() {
        // With the consumer's branch pool already covered, the synthesizer
        // should still produce a valid sequence and not get stuck.
        let surface = minimal_surface();
        let mut snapshot = CoverageSnapshot::new();
        snapshot.merge(surface.descriptor(1).branch_ids().collect::<Vec<_>>());
        let synth = Synthesizer::new(
            &surface,
            SynthesisSettings { max_steps: 3, min_calls: 1, ..Default::default() },
        );
        let mut rng = ChaCha8Rng::from_seed([9; 32]);
        let seq = synth.synthesize(&mut rng, &snapshot).unwrap();
        seq.validate(&surface).unwrap();
        assert_eq!(seq.calls.first().unwrap().name, "thing_new");
    }
}
