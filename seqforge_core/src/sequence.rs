use crate::surface::{ApiSurface, CallClass, HandleSemantics, HandleTypeId};
use crate::tracker::{InstanceId, LifecycleState, ResourceTracker, TrackerError};
use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Source states accepted when a consumed handle is moved by a call.
pub const CONSUMABLE_STATES: [LifecycleState; 3] = [
    LifecycleState::Created,
    LifecycleState::Configured,
    LifecycleState::Operated,
];

/// A concrete scalar argument value. Drawn from a small fixed pool per
/// [`crate::surface::ScalarKind`]; the pools govern reproducibility more
/// than the handle graph does.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub enum ScalarValue {
    Int(i64),
    Size(u64),
    CString(String),
    /// Byte-buffer payload, including zero-length and boundary-sized ones.
    Buffer(String),
    Double(f64),
}

impl ScalarValue {
    /// Renders the value as a C expression.
    pub fn render_c(&self) -> String {
        match self {
            ScalarValue::Int(v) => v.to_string(),
            ScalarValue::Size(v) => v.to_string(),
            ScalarValue::CString(s) => format!("\"{s}\""),
            ScalarValue::Buffer(s) => format!("\"{s}\""),
            ScalarValue::Double(v) => format!("{v:?}"),
        }
    }
}

/// One bound argument of a call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub enum BoundArg {
    /// A live instance passed to a handle-consuming parameter.
    Handle(InstanceId),
    /// An out-parameter producing a fresh instance.
    OutHandle(InstanceId),
    Scalar(ScalarValue),
    /// Fixed creation argument emitted verbatim.
    Fixed(String),
}

/// One invocation of an [`crate::surface::ApiCallDescriptor`] with all
/// arguments bound.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct BoundCall {
    /// Index into the owning surface's descriptor table.
    pub descriptor: usize,
    /// Denormalized function name, kept so a persisted sequence can be
    /// rendered and inspected without the surface at hand.
    pub name: String,
    pub args: Vec<BoundArg>,
    /// Instance produced through the return value, if any.
    pub ret_handle: Option<InstanceId>,
}

impl BoundCall {
    /// All instances this call produces, in allocation order: out-parameter
    /// handles in argument order, then the return handle. Replay depends on
    /// this matching the order synthesis allocates ids in.
    pub fn produced_instances(&self) -> Vec<InstanceId> {
        let mut out = Vec::new();
        for arg in &self.args {
            if let BoundArg::OutHandle(id) = arg {
                out.push(*id);
            }
        }
        if let Some(id) = self.ret_handle {
            out.push(id);
        }
        out
    }

    /// All instances this call consumes.
    pub fn consumed_instances(&self) -> Vec<InstanceId> {
        self.args
            .iter()
            .filter_map(|arg| match arg {
                BoundArg::Handle(id) => Some(*id),
                _ => None,
            })
            .collect()
    }
}

/// Errors found when replaying a sequence against a fresh tracker.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SequenceError {
    #[error(transparent)]
    Lifecycle(#[from] TrackerError),

    /// The produced-instance ids recorded in the sequence do not match the
    /// ids a fresh replay allocates. Indicates a corrupted or hand-edited
    /// sequence.
    #[error("Replay allocated {got} where the sequence recorded {expected}")]
    InstanceMismatch { expected: InstanceId, got: InstanceId },

    #[error("Call '{0}' references descriptor index {1} outside the surface")]
    UnknownDescriptor(String, usize),

    #[error("Instance {0} records handle type {1:?} outside the surface")]
    UnknownHandleType(InstanceId, HandleTypeId),

    #[error("Call '{call}' binds unique handle {id} to more than one parameter")]
    UniqueHandleAliased { call: String, id: InstanceId },
}

/// An ordered, bound list of API invocations forming one test case.
///
/// The sequence owns the full set of instances it creates;
/// `instance_types[i]` is the handle type of `InstanceId(i)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct CallSequence {
    pub library: String,
    pub calls: Vec<BoundCall>,
    pub instance_types: Vec<HandleTypeId>,
    /// Set only by negative-testing synthesis. A sequence carrying a
    /// deliberate lifecycle violation fails `validate` by construction and
    /// is routed straight to the runner instead of the corpus.
    pub deliberate_violation: bool,
}

impl CallSequence {
    pub fn new(library: impl Into<String>) -> Self {
        Self {
            library: library.into(),
            calls: Vec::new(),
            instance_types: Vec::new(),
            deliberate_violation: false,
        }
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Distinct descriptor indices invoked, in first-use order.
    pub fn distinct_descriptors(&self) -> Vec<usize> {
        let mut seen = Vec::new();
        for call in &self.calls {
            if !seen.contains(&call.descriptor) {
                seen.push(call.descriptor);
            }
        }
        seen
    }

    /// Static upper bound on instrumented branches reachable by this
    /// sequence: the sum of the branch weights of its distinct descriptors.
    /// An approximation, never below 1 so density stays well-defined.
    pub fn reachable_branches(&self, surface: &ApiSurface) -> u64 {
        let total: u64 = self
            .distinct_descriptors()
            .iter()
            .map(|&i| u64::from(surface.descriptor(i).branch_weight))
            .sum();
        total.max(1)
    }

    /// Stable content hash used for corpus dedup.
    pub fn content_hash(&self) -> String {
        let mut canonical = self.library.clone();
        for call in &self.calls {
            canonical.push('|');
            canonical.push_str(&call.name);
            for arg in &call.args {
                canonical.push(',');
                match arg {
                    BoundArg::Handle(id) => canonical.push_str(&id.to_string()),
                    BoundArg::OutHandle(id) => canonical.push_str(&format!("&{id}")),
                    BoundArg::Scalar(v) => canonical.push_str(&v.render_c()),
                    BoundArg::Fixed(f) => canonical.push_str(f),
                }
            }
            if let Some(ret) = call.ret_handle {
                canonical.push_str(&format!("->{ret}"));
            }
        }
        format!("{:x}", md5::compute(canonical.as_bytes()))
    }

    /// Replays every call against a fresh tracker, applying the lifecycle
    /// transition its descriptor class implies. Proves the use-after-free
    /// and double-free invariants for the whole sequence.
    pub fn validate(&self, surface: &ApiSurface) -> Result<(), SequenceError> {
        let mut tracker = ResourceTracker::new();
        for call in &self.calls {
            if call.descriptor >= surface.calls.len() {
                return Err(SequenceError::UnknownDescriptor(
                    call.name.clone(),
                    call.descriptor,
                ));
            }
            let desc = surface.descriptor(call.descriptor);
            let consumed = call.consumed_instances();

            // A unique handle may appear in at most one parameter slot.
            for (i, id) in consumed.iter().enumerate() {
                if !consumed[..i].contains(id) {
                    continue;
                }
                let ht = self
                    .instance_types
                    .get(id.0)
                    .copied()
                    .ok_or(TrackerError::UnknownInstance(*id))?;
                let handle_type = surface
                    .try_handle_type(ht)
                    .ok_or(SequenceError::UnknownHandleType(*id, ht))?;
                if handle_type.semantics == HandleSemantics::Unique {
                    return Err(SequenceError::UniqueHandleAliased {
                        call: call.name.clone(),
                        id: *id,
                    });
                }
            }

            match desc.class {
                // Finalize reports a repeat as DoubleFinalize; a consumable
                // pre-check here would mask it as NotConsumable.
                CallClass::Cleanup => {
                    for id in consumed {
                        tracker.finalize(id)?;
                    }
                }
                CallClass::Configure => {
                    for id in consumed {
                        tracker.ensure_consumable(id)?;
                        tracker.transition(id, &CONSUMABLE_STATES, LifecycleState::Configured)?;
                    }
                }
                CallClass::Operate => {
                    for id in consumed {
                        tracker.ensure_consumable(id)?;
                        tracker.transition(id, &CONSUMABLE_STATES, LifecycleState::Operated)?;
                    }
                }
                // Creation and validation leave consumed handles as-is.
                CallClass::Create | CallClass::Validate => {
                    for id in consumed {
                        tracker.ensure_consumable(id)?;
                    }
                }
            }

            for recorded in call.produced_instances() {
                let ht = self
                    .instance_types
                    .get(recorded.0)
                    .copied()
                    .ok_or(TrackerError::UnknownInstance(recorded))?;
                let got = tracker.create(ht);
                if got != recorded {
                    return Err(SequenceError::InstanceMismatch {
                        expected: recorded,
                        got,
                    });
                }
            }
        }
        Ok(())
    }

    /// Instances never finalized by the sequence. A leak, tolerated but
    /// reported.
    pub fn leaked_instances(&self, surface: &ApiSurface) -> Vec<InstanceId> {
        let mut tracker = ResourceTracker::new();
        for call in &self.calls {
            let Some(desc) = surface.calls.get(call.descriptor) else {
                continue;
            };
            if desc.class == CallClass::Cleanup {
                for id in call.consumed_instances() {
                    let _ = tracker.finalize(id);
                }
            }
            for id in call.produced_instances() {
                let ht = self.instance_types.get(id.0).copied().unwrap_or(HandleTypeId(0));
                let _ = tracker.create(ht);
            }
        }
        tracker.live_instances()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::surface::{
        builtin_surfaces, ApiCallDescriptor, HandleStorage, HandleType, ParamRole, ReturnRole,
    };

    fn cjson() -> ApiSurface {
        builtin_surfaces().into_iter().find(|s| s.library == "cjson").unwrap()
    }

    /// create -> configure -> operate -> cleanup on a single node.
    fn well_formed() -> CallSequence {
        let mut seq = CallSequence::new("cjson");
        let h0 = InstanceId(0);
        seq.instance_types.push(HandleTypeId(0));
        seq.calls.push(BoundCall {
            descriptor: 0,
            name: "cJSON_CreateObject".into(),
            args: vec![],
            ret_handle: Some(h0),
        });
        seq.calls.push(BoundCall {
            descriptor: 1,
            name: "cJSON_AddNumberToObject".into(),
            args: vec![
                BoundArg::Handle(h0),
                BoundArg::Scalar(ScalarValue::CString("width".into())),
                BoundArg::Scalar(ScalarValue::Double(1.5)),
            ],
            ret_handle: None,
        });
        seq.calls.push(BoundCall {
            descriptor: 3,
            name: "cJSON_PrintUnformatted".into(),
            args: vec![BoundArg::Handle(h0)],
            ret_handle: None,
        });
        seq.calls.push(BoundCall {
            descriptor: 5,
            name: "cJSON_Delete".into(),
            args: vec![BoundArg::Handle(h0)],
            ret_handle: None,
        });
        seq
    }

    #[test]
    fn well_formed_sequence_validates() {
        let surface = cjson();
        well_formed().validate(&surface).unwrap();
    }

    #[test]
    fn use_after_finalize_is_rejected() {
        let surface = cjson();
        let mut seq = well_formed();
        // Reference h0 again after cJSON_Delete.
        seq.calls.push(BoundCall {
            descriptor: 4,
            name: "cJSON_IsObject".into(),
            args: vec![BoundArg::Handle(InstanceId(0))],
            ret_handle: None,
        });
        match seq.validate(&surface).unwrap_err() {
            SequenceError::Lifecycle(TrackerError::NotConsumable(id, state)) => {
                assert_eq!(id, InstanceId(0));
                assert_eq!(state, LifecycleState::Finalized);
            }
            other => panic!("expected NotConsumable, got {other:?}"),
        }
    }

    #[test]
    fn double_finalize_is_rejected() {
        let surface = cjson();
        let mut seq = well_formed();
        seq.calls.push(BoundCall {
            descriptor: 5,
            name: "cJSON_Delete".into(),
            args: vec![BoundArg::Handle(InstanceId(0))],
            ret_handle: None,
        });
        match seq.validate(&surface).unwrap_err() {
            SequenceError::Lifecycle(TrackerError::DoubleFinalize(id)) => {
                assert_eq!(id, InstanceId(0));
            }
            other => panic!("expected DoubleFinalize, got {other:?}"),
        }
    }

    #[test]
    fn reachable_branch_estimate_counts_distinct_descriptors_once() {
        let surface = cjson();
        let mut seq = well_formed();
        let before = seq.reachable_branches(&surface);
        // Repeating a call must not inflate the estimate.
        let repeat = seq.calls[1].clone();
        seq.calls.insert(2, repeat);
        assert_eq!(seq.reachable_branches(&surface), before);
    }

    #[test]
    fn content_hash_is_stable_and_distinguishes_sequences() {
        let a = well_formed();
        let b = well_formed();
        assert_eq!(a.content_hash(), b.content_hash());

        let mut c = well_formed();
        c.calls[1].args[2] = BoundArg::Scalar(ScalarValue::Double(2.0));
        assert_ne!(a.content_hash(), c.content_hash());
    }

    /// One handle type whose operate call takes two handle parameters.
    fn two_input_surface(semantics: HandleSemantics) -> ApiSurface {
        let h = HandleTypeId(0);
        ApiSurface {
            library: "mixer",
            header: "mixer.h",
            handle_types: vec![HandleType {
                name: "track",
                c_type: "track_t",
                semantics,
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
        }
    }

    fn mix_same_track_twice() -> CallSequence {
        let mut seq = CallSequence::new("mixer");
        seq.instance_types.push(HandleTypeId(0));
        seq.calls.push(BoundCall {
            descriptor: 0,
            name: "track_new".into(),
            args: vec![],
            ret_handle: Some(InstanceId(0)),
        });
        seq.calls.push(BoundCall {
            descriptor: 1,
            name: "track_mix".into(),
            args: vec![
                BoundArg::Handle(InstanceId(0)),
                BoundArg::Handle(InstanceId(0)),
            ],
            ret_handle: None,
        });
        seq
    }

    #[test]
    fn unique_handle_bound_twice_in_one_call_is_rejected() {
        let surface = two_input_surface(HandleSemantics::Unique);
        match mix_same_track_twice().validate(&surface).unwrap_err() {
            SequenceError::UniqueHandleAliased { call, id } => {
                assert_eq!(call, "track_mix");
                assert_eq!(id, InstanceId(0));
            }
            other => panic!("expected UniqueHandleAliased, got {other:?}"),
        }
    }

    #[test]
    fn aliased_handle_may_fill_both_parameters() {
        let surface = two_input_surface(HandleSemantics::Aliased);
        mix_same_track_twice().validate(&surface).unwrap();
    }

    #[test]
    fn produced_instances_follow_allocation_order() {
        // Out-parameter handles are allocated while binding arguments, the
        // return handle afterwards; replay must see the same order.
        let call = BoundCall {
            descriptor: 0,
            name: "duplex_open".into(),
            args: vec![BoundArg::OutHandle(InstanceId(0))],
            ret_handle: Some(InstanceId(1)),
        };
        assert_eq!(call.produced_instances(), vec![InstanceId(0), InstanceId(1)]);
    }

    #[test]
    fn leaked_instances_reports_unfinalized_handles() {
        let surface = cjson();
        let mut seq = well_formed();
        seq.calls.pop(); // drop the cJSON_Delete
        assert_eq!(seq.leaked_instances(&surface), vec![InstanceId(0)]);
        assert!(well_formed().leaked_instances(&surface).is_empty());
    }
}
