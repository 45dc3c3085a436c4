//! Barrier handling at node inputs

use super::Barrier;
use crate::config::Qos;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use tracing::{debug, info};

/// A barrier seen on every input, with the items held back while aligning.
#[derive(Debug)]
pub struct Aligned<T> {
    pub barrier: Barrier,
    /// Items to process again, in arrival order, after the node has
    /// acknowledged and forwarded the barrier.
    pub replay: Vec<(usize, T)>,
}

/// Per-node barrier bookkeeping.
///
/// The node passes every data item through [`hold`](Self::hold) and every
/// barrier through [`on_barrier`](Self::on_barrier).
pub trait BarrierHandler<T>: Send {
    /// `Some(item)` if the item should be processed now, `None` if held.
    fn hold(&mut self, input: usize, item: T) -> Option<T>;

    /// `Some` once `barrier` has arrived on every input.
    fn on_barrier(&mut self, input: usize, barrier: Barrier) -> Option<Aligned<T>>;
}

/// Handler for a node with `inputs` upstream edges, or `None` when the QoS
/// does not checkpoint.
pub fn barrier_handler<T: Send + 'static>(
    qos: Qos,
    inputs: usize,
) -> Option<Box<dyn BarrierHandler<T>>> {
    match qos {
        Qos::AtMostOnce => None,
        Qos::AtLeastOnce => Some(Box::new(BarrierTracker::new(inputs))),
        Qos::ExactlyOnce => Some(Box::new(BarrierAligner::new(inputs))),
    }
}

// =============================================================================
// Tracker
// =============================================================================

/// Counts barriers per checkpoint without blocking any input.
#[derive(Debug)]
pub struct BarrierTracker {
    inputs: usize,
    pending: BTreeMap<i64, usize>,
}

impl BarrierTracker {
    pub fn new(inputs: usize) -> Self {
        Self {
            inputs: inputs.max(1),
            pending: BTreeMap::new(),
        }
    }
}

impl<T> BarrierHandler<T> for BarrierTracker {
    fn hold(&mut self, _input: usize, item: T) -> Option<T> {
        Some(item)
    }

    fn on_barrier(&mut self, _input: usize, barrier: Barrier) -> Option<Aligned<T>> {
        let id = barrier.checkpoint_id;
        let seen = self.pending.entry(id).or_insert(0);
        *seen += 1;
        if *seen < self.inputs {
            return None;
        }
        // Older checkpoints can no longer complete.
        self.pending = self.pending.split_off(&(id + 1));
        Some(Aligned {
            barrier,
            replay: Vec::new(),
        })
    }
}

// =============================================================================
// Aligner
// =============================================================================

/// Blocks each input after its barrier until every input has delivered it.
#[derive(Debug)]
pub struct BarrierAligner<T> {
    inputs: usize,
    current: i64,
    blocked: BTreeSet<usize>,
    buffer: VecDeque<(usize, T)>,
}

impl<T> BarrierAligner<T> {
    pub fn new(inputs: usize) -> Self {
        Self {
            inputs: inputs.max(1),
            current: 0,
            blocked: BTreeSet::new(),
            buffer: VecDeque::new(),
        }
    }

    /// Number of items held back.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn release(&mut self) -> Vec<(usize, T)> {
        self.blocked.clear();
        self.buffer.drain(..).collect()
    }
}

impl<T: Send> BarrierHandler<T> for BarrierAligner<T> {
    fn hold(&mut self, input: usize, item: T) -> Option<T> {
        if self.inputs > 1 && self.blocked.contains(&input) {
            self.buffer.push_back((input, item));
            return None;
        }
        Some(item)
    }

    fn on_barrier(&mut self, input: usize, barrier: Barrier) -> Option<Aligned<T>> {
        let id = barrier.checkpoint_id;
        if self.inputs == 1 {
            if id <= self.current {
                return None;
            }
            self.current = id;
            return Some(Aligned {
                barrier,
                replay: Vec::new(),
            });
        }

        let mut replay = Vec::new();
        if !self.blocked.is_empty() {
            if id < self.current {
                return None;
            }
            if id > self.current {
                info!(
                    checkpoint = id,
                    current = self.current,
                    "barrier of a newer checkpoint before alignment finished, skipping current"
                );
                replay = self.release();
                self.current = id;
            }
        } else if id > self.current {
            debug!(checkpoint = id, "start barrier alignment");
            self.current = id;
        } else {
            return None;
        }
        self.blocked.insert(input);

        if self.blocked.len() < self.inputs {
            // Items held for a skipped alignment wait for the new one.
            for (i, item) in replay {
                self.buffer.push_back((i, item));
            }
            return None;
        }
        debug!(checkpoint = id, "barrier aligned");
        replay.extend(self.release());
        Some(Aligned { barrier, replay })
    }
}
