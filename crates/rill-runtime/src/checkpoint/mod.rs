//! Barrier checkpointing
//!
//! The [`Coordinator`] injects a [`Barrier`] into every source on each tick.
//! Barriers flow through the node channels in order with the data. Every
//! node acknowledges a barrier once it has seen it on all of its inputs,
//! attaching its state (operators) or its offset (sources). When every node
//! of the rule has acknowledged, the checkpoint is complete and written to
//! the [`StateStore`](crate::persistence::StateStore).
//!
//! How a multi-input node waits for barriers depends on the rule's QoS:
//! - at least once: [`BarrierTracker`] counts barriers, data keeps flowing
//! - exactly once: [`BarrierAligner`] holds back inputs that already
//!   delivered the barrier until the others catch up

mod barrier;
mod coordinator;

pub use barrier::{barrier_handler, Aligned, BarrierAligner, BarrierHandler, BarrierTracker};
pub use coordinator::{CheckpointHandle, Coordinator, MAX_COMPLETED};

use serde::{Deserialize, Serialize};

/// Checkpoint marker flowing through the topology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Barrier {
    pub checkpoint_id: i64,
}

impl Barrier {
    pub fn new(checkpoint_id: i64) -> Self {
        Self { checkpoint_id }
    }
}
