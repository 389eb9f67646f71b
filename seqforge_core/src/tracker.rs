use crate::surface::HandleTypeId;
use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lifecycle states of a handle instance within one sequence.
///
/// Legal flow is `Uninitialized -> Created -> Configured <-> Operated ->
/// Finalized`. No call may reference a `Finalized` or `Uninitialized`
/// instance; a never-finalized instance is a leak, tracked but not fatal.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Encode, Decode,
)]
pub enum LifecycleState {
    Uninitialized,
    Created,
    Configured,
    Operated,
    Finalized,
}

impl LifecycleState {
    /// True for states in which the instance may be passed to a
    /// handle-consuming parameter.
    pub fn is_consumable(self) -> bool {
        matches!(
            self,
            LifecycleState::Created | LifecycleState::Configured | LifecycleState::Operated
        )
    }
}

/// Identifier of one handle instance inside a sequence. Instances are kept
/// in an arena keyed by this id; the core never stores raw native pointers.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Encode, Decode,
)]
pub struct InstanceId(pub usize);

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "h{}", self.0)
    }
}

/// Lifecycle violations. These indicate a synthesizer defect when reached
/// from sequence construction and are never silently corrected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TrackerError {
    #[error("Invalid lifecycle transition for {id}: {from:?} is not in the allowed source states for {to:?}")]
    InvalidLifecycleTransition {
        id: InstanceId,
        from: LifecycleState,
        to: LifecycleState,
    },

    #[error("Instance {0} finalized more than once")]
    DoubleFinalize(InstanceId),

    #[error("Instance {0} referenced while not in a consumable state ({1:?})")]
    NotConsumable(InstanceId, LifecycleState),

    #[error("Instance {0} is not tracked")]
    UnknownInstance(InstanceId),
}

/// One tracked occurrence of a handle type within a sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandleInstance {
    pub id: InstanceId,
    pub handle_type: HandleTypeId,
    pub state: LifecycleState,
}

/// Per-sequence state machine over every handle instance introduced so far.
///
/// This is the enforcement point that keeps the synthesizer from emitting a
/// call on a freed or never-created handle. Purely in-memory; no external
/// calls.
#[derive(Debug, Default)]
pub struct ResourceTracker {
    instances: Vec<HandleInstance>,
}

impl ResourceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Introduces a fresh instance in the `Created` state. Always succeeds.
    pub fn create(&mut self, handle_type: HandleTypeId) -> InstanceId {
        let id = InstanceId(self.instances.len());
        self.instances.push(HandleInstance {
            id,
            handle_type,
            state: LifecycleState::Created,
        });
        id
    }

    pub fn state(&self, id: InstanceId) -> Result<LifecycleState, TrackerError> {
        self.instances
            .get(id.0)
            .map(|inst| inst.state)
            .ok_or(TrackerError::UnknownInstance(id))
    }

    pub fn handle_type(&self, id: InstanceId) -> Result<HandleTypeId, TrackerError> {
        self.instances
            .get(id.0)
            .map(|inst| inst.handle_type)
            .ok_or(TrackerError::UnknownInstance(id))
    }

    /// Moves the instance to `to`, failing if the current state is not in
    /// `from_states`.
    pub fn transition(
        &mut self,
        id: InstanceId,
        from_states: &[LifecycleState],
        to: LifecycleState,
    ) -> Result<(), TrackerError> {
        let current = self.state(id)?;
        if !from_states.contains(&current) {
            return Err(TrackerError::InvalidLifecycleTransition {
                id,
                from: current,
                to,
            });
        }
        self.instances[id.0].state = to;
        Ok(())
    }

    /// True iff the instance exists and is in a consumable state.
    pub fn can_consume(&self, id: InstanceId) -> bool {
        self.state(id).map(|s| s.is_consumable()).unwrap_or(false)
    }

    /// Errors unless the instance may be passed to a handle-consuming
    /// parameter right now. Used when replaying a sequence for validation.
    pub fn ensure_consumable(&self, id: InstanceId) -> Result<(), TrackerError> {
        let state = self.state(id)?;
        if state.is_consumable() {
            Ok(())
        } else {
            Err(TrackerError::NotConsumable(id, state))
        }
    }

    /// Transitions the instance to `Finalized`. A second finalize on the
    /// same instance is reported as `DoubleFinalize`, not as a generic
    /// transition failure.
    pub fn finalize(&mut self, id: InstanceId) -> Result<(), TrackerError> {
        let current = self.state(id)?;
        if current == LifecycleState::Finalized {
            return Err(TrackerError::DoubleFinalize(id));
        }
        if current == LifecycleState::Uninitialized {
            return Err(TrackerError::InvalidLifecycleTransition {
                id,
                from: current,
                to: LifecycleState::Finalized,
            });
        }
        self.instances[id.0].state = LifecycleState::Finalized;
        Ok(())
    }

    /// Instances that are live (created and not finalized), in creation
    /// order. Used by the cleanup phase and for leak reporting.
    pub fn live_instances(&self) -> Vec<InstanceId> {
        self.instances
            .iter()
            .filter(|inst| inst.state.is_consumable())
            .map(|inst| inst.id)
            .collect()
    }

    /// Consumable instances of the given handle type.
    pub fn consumable_of_type(&self, handle_type: HandleTypeId) -> Vec<InstanceId> {
        self.instances
            .iter()
            .filter(|inst| inst.handle_type == handle_type && inst.state.is_consumable())
            .map(|inst| inst.id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}
