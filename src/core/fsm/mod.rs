// src/core/fsm/mod.rs

//! The per-subarray state machines and the instance role sets they share.

pub mod freesub;
pub mod recproc;

pub use freesub::{FreeSubState, FreeSubscribedMachine};
pub use recproc::{RecProcMachine, RecProcState};

use crate::core::instance::InstanceSet;

/// The instance role sets for one subarray, shared between its
/// Free/Subscribed and Rec/Proc machines. `ready`, `recording` and
/// `processing` partition the working subset of `subscribed`; state
/// mutations happen only inside entry actions, under the subarray worker's
/// event serialization.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SubarrayData {
    pub subscribed: InstanceSet,
    pub ready: InstanceSet,
    pub recording: InstanceSet,
    pub processing: InstanceSet,
}

impl SubarrayData {
    pub fn new() -> Self {
        Self::default()
    }

    /// The cold-start population: every configured instance ready, nothing
    /// subscribed yet.
    pub fn with_ready(ready: InstanceSet) -> Self {
        Self {
            ready,
            ..Self::default()
        }
    }
}
