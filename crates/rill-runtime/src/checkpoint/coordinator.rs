//! Checkpoint coordinator of one rule

use super::Barrier;
use crate::clock::{next_aligned, SharedClock};
use crate::error::{TopologyError, TopologyResult};
use crate::persistence::{Checkpoint, StateStore};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use prometheus::IntCounter;
use tracing::{debug, error, info, warn};

/// Number of completed checkpoints remembered by the coordinator.
pub const MAX_COMPLETED: usize = 3;

const ACTIVATE_RETRIES: usize = 50;
const ACTIVATE_BACKOFF: Duration = Duration::from_millis(20);

enum Signal {
    Ack {
        checkpoint_id: i64,
        op_id: String,
        state: AckState,
    },
    Decline {
        checkpoint_id: i64,
        op_id: String,
        reason: String,
    },
    Save(oneshot::Sender<TopologyResult<i64>>),
    Stop,
}

enum AckState {
    Operator(Option<serde_json::Value>),
    Source(Option<serde_json::Value>),
}

#[derive(Default)]
struct Shared {
    activated: AtomicBool,
    ready: AtomicUsize,
    saving: AtomicUsize,
    failed: AtomicUsize,
    completed: Mutex<VecDeque<i64>>,
}

/// Handle given to every node of the rule for acknowledging barriers.
#[derive(Clone)]
pub struct CheckpointHandle {
    signal: mpsc::UnboundedSender<Signal>,
    shared: Arc<Shared>,
}

impl CheckpointHandle {
    /// Acknowledge a barrier with the operator's state.
    pub fn ack(&self, checkpoint_id: i64, op_id: &str, state: Option<serde_json::Value>) {
        self.send(checkpoint_id, op_id, AckState::Operator(state));
    }

    /// Acknowledge a barrier with the source's read offset.
    pub fn ack_source(&self, checkpoint_id: i64, op_id: &str, offset: Option<serde_json::Value>) {
        self.send(checkpoint_id, op_id, AckState::Source(offset));
    }

    /// Abort a checkpoint the node cannot take part in.
    pub fn decline(&self, checkpoint_id: i64, op_id: &str, reason: impl Into<String>) {
        let _ = self.signal.send(Signal::Decline {
            checkpoint_id,
            op_id: op_id.to_string(),
            reason: reason.into(),
        });
    }

    /// Mark one source as subscribed.
    pub fn source_ready(&self) {
        self.shared.ready.fetch_add(1, Ordering::SeqCst);
    }

    fn send(&self, checkpoint_id: i64, op_id: &str, state: AckState) {
        let _ = self.signal.send(Signal::Ack {
            checkpoint_id,
            op_id: op_id.to_string(),
            state,
        });
    }
}

/// Schedules checkpoints and assembles them from node acknowledgements.
///
/// Register every node with [`add_source`](Self::add_source) or
/// [`add_responder`](Self::add_responder) before [`activate`](Self::activate).
pub struct Coordinator {
    rule_id: String,
    interval: i64,
    clock: SharedClock,
    store: Arc<dyn StateStore>,
    sources: Vec<(String, mpsc::UnboundedSender<Barrier>)>,
    responders: Vec<String>,
    signal: mpsc::UnboundedSender<Signal>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Signal>>>,
    task: tokio::sync::Mutex<Option<JoinHandle<mpsc::UnboundedReceiver<Signal>>>>,
    shared: Arc<Shared>,
    failures: Option<IntCounter>,
}

impl Coordinator {
    pub fn new(
        rule_id: impl Into<String>,
        interval: i64,
        clock: SharedClock,
        store: Arc<dyn StateStore>,
    ) -> Self {
        let rule_id = rule_id.into();
        info!("create new coordinator for rule {}", rule_id);
        let (signal, receiver) = mpsc::unbounded_channel();
        Self {
            rule_id,
            interval: if interval > 0 { interval } else { 300_000 },
            clock,
            store,
            sources: Vec::new(),
            responders: Vec::new(),
            signal,
            receiver: Mutex::new(Some(receiver)),
            task: tokio::sync::Mutex::new(None),
            shared: Arc::new(Shared::default()),
            failures: None,
        }
    }

    /// Counter bumped whenever a completed checkpoint cannot be persisted.
    pub fn with_failure_counter(mut self, counter: IntCounter) -> Self {
        self.failures = Some(counter);
        self
    }

    /// Register a source. The returned channel yields the barriers to inject.
    pub fn add_source(&mut self, op_id: &str) -> mpsc::UnboundedReceiver<Barrier> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.sources.push((op_id.to_string(), tx));
        self.responders.push(op_id.to_string());
        rx
    }

    /// Register an operator or sink that must acknowledge every barrier.
    pub fn add_responder(&mut self, op_id: &str) {
        self.responders.push(op_id.to_string());
    }

    pub fn handle(&self) -> CheckpointHandle {
        CheckpointHandle {
            signal: self.signal.clone(),
            shared: self.shared.clone(),
        }
    }

    pub fn is_activated(&self) -> bool {
        self.shared.activated.load(Ordering::SeqCst)
    }

    /// Whether a forced save is waiting for its checkpoint to complete.
    pub fn is_saving(&self) -> bool {
        self.shared.saving.load(Ordering::SeqCst) > 0
    }

    /// Number of completed checkpoints, at most [`MAX_COMPLETED`].
    pub fn get_complete_count(&self) -> usize {
        self.shared.completed.lock().map(|c| c.len()).unwrap_or(0)
    }

    /// Number of checkpoints the store failed to persist.
    pub fn get_failed_count(&self) -> usize {
        self.shared.failed.load(Ordering::SeqCst)
    }

    /// Id of the latest completed checkpoint.
    pub fn latest(&self) -> Option<i64> {
        self.shared
            .completed
            .lock()
            .ok()
            .and_then(|c| c.back().copied())
    }

    /// Wait for every source to subscribe, then start the checkpoint ticker.
    pub async fn activate(&self) -> TopologyResult<()> {
        let mut ready = false;
        for _ in 0..ACTIVATE_RETRIES {
            if self.shared.ready.load(Ordering::SeqCst) >= self.sources.len() {
                ready = true;
                break;
            }
            tokio::time::sleep(ACTIVATE_BACKOFF).await;
        }
        if !ready {
            warn!(rule = %self.rule_id, "sources are not ready, coordinator not activated");
            return Err(TopologyError::ActivationTimeout(self.rule_id.clone()));
        }

        let mut task = self.task.lock().await;
        if task.is_some() {
            return Ok(());
        }
        let receiver = self
            .receiver
            .lock()
            .ok()
            .and_then(|mut r| r.take())
            .ok_or_else(|| TopologyError::NotActivated(self.rule_id.clone()))?;

        info!(
            "Start checkpoint coordinator for rule {} at {}",
            self.rule_id,
            self.clock.now_ms()
        );
        let scheduler = Scheduler {
            rule_id: self.rule_id.clone(),
            interval: self.interval,
            clock: self.clock.clone(),
            store: self.store.clone(),
            sources: self.sources.clone(),
            responders: self.responders.clone(),
            shared: self.shared.clone(),
            failures: self.failures.clone(),
            pending: BTreeMap::new(),
            waiters: BTreeMap::new(),
            last_id: 0,
            next_tick: next_aligned(self.clock.now_ms(), self.interval),
        };
        self.shared.activated.store(true, Ordering::SeqCst);
        *task = Some(tokio::spawn(scheduler.run(receiver)));
        Ok(())
    }

    /// Stop the ticker. Pending checkpoints are dropped.
    pub async fn deactivate(&self) {
        let Some(task) = self.task.lock().await.take() else {
            return;
        };
        let _ = self.signal.send(Signal::Stop);
        match task.await {
            Ok(receiver) => {
                if let Ok(mut r) = self.receiver.lock() {
                    *r = Some(receiver);
                }
            }
            Err(e) => warn!(rule = %self.rule_id, "checkpoint scheduler failed: {}", e),
        }
        self.shared.activated.store(false, Ordering::SeqCst);
        debug!(rule = %self.rule_id, "coordinator deactivated");
    }

    /// Take a checkpoint now and wait until it completes.
    pub async fn force_save(&self) -> TopologyResult<i64> {
        if !self.is_activated() {
            return Err(TopologyError::NotActivated(self.rule_id.clone()));
        }
        let (tx, rx) = oneshot::channel();
        self.shared.saving.fetch_add(1, Ordering::SeqCst);
        let result = match self.signal.send(Signal::Save(tx)) {
            Ok(()) => rx
                .await
                .unwrap_or_else(|_| Err(TopologyError::NotActivated(self.rule_id.clone()))),
            Err(_) => Err(TopologyError::NotActivated(self.rule_id.clone())),
        };
        self.shared.saving.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

// =============================================================================
// Scheduler task
// =============================================================================

struct PendingCheckpoint {
    not_yet_acked: BTreeSet<String>,
    checkpoint: Checkpoint,
}

struct Scheduler {
    rule_id: String,
    interval: i64,
    clock: SharedClock,
    store: Arc<dyn StateStore>,
    sources: Vec<(String, mpsc::UnboundedSender<Barrier>)>,
    responders: Vec<String>,
    shared: Arc<Shared>,
    failures: Option<IntCounter>,
    pending: BTreeMap<i64, PendingCheckpoint>,
    waiters: BTreeMap<i64, oneshot::Sender<TopologyResult<i64>>>,
    last_id: i64,
    next_tick: i64,
}

impl Scheduler {
    async fn run(
        mut self,
        mut receiver: mpsc::UnboundedReceiver<Signal>,
    ) -> mpsc::UnboundedReceiver<Signal> {
        loop {
            let tick = self.clock.sleep_until(self.next_tick);
            tokio::select! {
                biased;

                signal = receiver.recv() => match signal {
                    None | Some(Signal::Stop) => {
                        debug!(rule = %self.rule_id, "Stop checkpoint scheduler");
                        break;
                    }
                    Some(Signal::Ack { checkpoint_id, op_id, state }) => {
                        self.on_ack(checkpoint_id, op_id, state);
                    }
                    Some(Signal::Decline { checkpoint_id, op_id, reason }) => {
                        info!(
                            "Receive dec from {} for checkpoint {}: {}, cancel it",
                            op_id, checkpoint_id, reason
                        );
                        self.cancel(checkpoint_id);
                    }
                    Some(Signal::Save(reply)) => {
                        self.trigger(self.clock.now_ms(), Some(reply));
                    }
                },

                _ = tick => {
                    self.trigger(self.next_tick, None);
                    self.next_tick = next_aligned(self.clock.now_ms(), self.interval);
                }
            }
        }
        for (id, reply) in std::mem::take(&mut self.waiters) {
            let _ = reply.send(Err(TopologyError::CheckpointDeclined(id)));
        }
        receiver
    }

    fn trigger(&mut self, at: i64, reply: Option<oneshot::Sender<TopologyResult<i64>>>) {
        let id = at.max(self.last_id + 1);
        self.last_id = id;
        debug!("Create checkpoint {}", id);
        self.pending.insert(
            id,
            PendingCheckpoint {
                not_yet_acked: self.responders.iter().cloned().collect(),
                checkpoint: Checkpoint::new(id),
            },
        );
        if let Some(reply) = reply {
            self.waiters.insert(id, reply);
        }
        let mut failed = false;
        for (name, tx) in &self.sources {
            if tx.send(Barrier::new(id)).is_err() {
                info!(
                    "Fail to trigger checkpoint for source {}, cancel it",
                    name
                );
                failed = true;
            }
        }
        if failed {
            self.cancel(id);
        }
    }

    fn on_ack(&mut self, id: i64, op_id: String, state: AckState) {
        let Some(pending) = self.pending.get_mut(&id) else {
            debug!("Receive ack from {} for non existing checkpoint {}", op_id, id);
            return;
        };
        debug!("Receive ack from {} for checkpoint {}", op_id, id);
        match state {
            AckState::Operator(Some(s)) => {
                pending.checkpoint.op_states.insert(op_id.clone(), s);
            }
            AckState::Source(Some(offset)) => {
                pending.checkpoint.offsets.insert(op_id.clone(), offset);
            }
            AckState::Operator(None) | AckState::Source(None) => {}
        }
        pending.not_yet_acked.remove(&op_id);
        if pending.not_yet_acked.is_empty() {
            self.complete(id);
        }
    }

    fn complete(&mut self, id: i64) {
        let Some(pending) = self.pending.remove(&id) else {
            return;
        };
        let mut checkpoint = pending.checkpoint;
        checkpoint.timestamp_ms = self.clock.now_ms();
        let saved = self
            .store
            .save_checkpoint(&checkpoint)
            .and_then(|_| self.store.prune_checkpoints(1).map(|_| ()));
        if let Err(e) = saved {
            error!(
                rule = %self.rule_id,
                "Cannot save checkpoint {} due to storage error: {}", id, e
            );
            self.shared.failed.fetch_add(1, Ordering::SeqCst);
            if let Some(counter) = &self.failures {
                counter.inc();
            }
            if let Some(reply) = self.waiters.remove(&id) {
                let _ = reply.send(Err(e.into()));
            }
            return;
        }

        if let Ok(mut completed) = self.shared.completed.lock() {
            completed.push_back(id);
            while completed.len() > MAX_COMPLETED {
                completed.pop_front();
            }
        }
        // Older checkpoints can no longer complete.
        let stale: Vec<i64> = self.pending.range(..id).map(|(k, _)| *k).collect();
        for old in stale {
            self.cancel(old);
        }
        if let Some(reply) = self.waiters.remove(&id) {
            let _ = reply.send(Ok(id));
        }
        debug!(rule = %self.rule_id, "Totally complete checkpoint {}", id);
    }

    fn cancel(&mut self, id: i64) {
        if self.pending.remove(&id).is_none() {
            debug!("Cancel for non existing checkpoint {}. Just ignored", id);
        }
        if let Some(reply) = self.waiters.remove(&id) {
            let _ = reply.send(Err(TopologyError::CheckpointDeclined(id)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::error::StoreError;
    use crate::persistence::MemoryStore;
    use serde_json::json;

    /// Store whose writes always fail.
    struct ReadOnlyStore;

    impl StateStore for ReadOnlyStore {
        fn list_checkpoints(&self) -> Result<Vec<i64>, StoreError> {
            Ok(Vec::new())
        }

        fn put(&self, _key: &str, _value: &[u8]) -> Result<(), StoreError> {
            Err(StoreError::Io("read-only file system".into()))
        }

        fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, StoreError> {
            Ok(None)
        }

        fn delete(&self, _key: &str) -> Result<(), StoreError> {
            Ok(())
        }
    }

    const START: i64 = 1_541_152_486_000;

    fn coordinator(clock: SharedClock, store: Arc<MemoryStore>) -> Coordinator {
        Coordinator::new("rule1", 1000, clock, store)
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_tick_completes_after_every_ack() {
        let clock = MockClock::new(START);
        let store = Arc::new(MemoryStore::new());
        let mut coord = coordinator(clock.clone(), store.clone());
        let mut barriers = coord.add_source("source_demo_0");
        coord.add_responder("op_1_window_0");
        let handle = coord.handle();
        handle.source_ready();
        coord.activate().await.unwrap();
        assert!(coord.is_activated());

        clock.set(START + 1000);
        let barrier = tokio::time::timeout(Duration::from_secs(1), barriers.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(barrier.checkpoint_id, START + 1000);

        handle.ack_source(barrier.checkpoint_id, "source_demo_0", Some(json!(3)));
        settle().await;
        assert_eq!(coord.get_complete_count(), 0);

        handle.ack(barrier.checkpoint_id, "op_1_window_0", Some(json!({"inputs": []})));
        settle().await;
        assert_eq!(coord.get_complete_count(), 1);
        assert_eq!(coord.latest(), Some(START + 1000));

        let saved = store.load_latest_checkpoint().unwrap().unwrap();
        assert_eq!(saved.offsets["source_demo_0"], json!(3));
        assert!(saved.op_states.contains_key("op_1_window_0"));
        coord.deactivate().await;
        assert!(!coord.is_activated());
    }

    #[tokio::test]
    async fn test_completed_history_is_bounded() {
        let clock = MockClock::new(START);
        let store = Arc::new(MemoryStore::new());
        let mut coord = coordinator(clock.clone(), store.clone());
        let mut barriers = coord.add_source("source_demo_0");
        let handle = coord.handle();
        handle.source_ready();
        coord.activate().await.unwrap();

        for i in 1..=5 {
            clock.set(START + i * 1000);
            let b = barriers.recv().await.unwrap();
            handle.ack_source(b.checkpoint_id, "source_demo_0", None);
            settle().await;
        }
        assert_eq!(coord.get_complete_count(), MAX_COMPLETED);
        assert_eq!(store.list_checkpoints().unwrap(), vec![START + 5000]);
        coord.deactivate().await;
    }

    #[tokio::test]
    async fn test_force_save_waits_for_completion() {
        let clock = MockClock::new(START);
        let store = Arc::new(MemoryStore::new());
        let mut coord = coordinator(clock.clone(), store.clone());
        let mut barriers = coord.add_source("source_demo_0");
        let handle = coord.handle();
        handle.source_ready();
        coord.activate().await.unwrap();

        let coord = Arc::new(coord);
        let saver = tokio::spawn({
            let coord = coord.clone();
            async move { coord.force_save().await }
        });
        let b = barriers.recv().await.unwrap();
        assert!(coord.is_saving());
        handle.ack_source(b.checkpoint_id, "source_demo_0", Some(json!(1)));
        assert_eq!(saver.await.unwrap().unwrap(), b.checkpoint_id);
        assert!(!coord.is_saving());
        assert_eq!(coord.get_complete_count(), 1);
    }

    #[tokio::test]
    async fn test_decline_fails_force_save() {
        let clock = MockClock::new(START);
        let mut coord = coordinator(clock, Arc::new(MemoryStore::new()));
        let mut barriers = coord.add_source("source_demo_0");
        let handle = coord.handle();
        handle.source_ready();
        coord.activate().await.unwrap();

        let coord = Arc::new(coord);
        let saver = tokio::spawn({
            let coord = coord.clone();
            async move { coord.force_save().await }
        });
        let b = barriers.recv().await.unwrap();
        handle.decline(b.checkpoint_id, "source_demo_0", "snapshot failed");
        let err = saver.await.unwrap().unwrap_err();
        assert!(matches!(err, TopologyError::CheckpointDeclined(id) if id == b.checkpoint_id));
        assert_eq!(coord.get_complete_count(), 0);
    }

    #[tokio::test]
    async fn test_storage_error_is_counted() {
        let clock = MockClock::new(START);
        let counter = IntCounter::new("failures", "failures").unwrap();
        let mut coord = Coordinator::new("rule1", 1000, clock.clone(), Arc::new(ReadOnlyStore))
            .with_failure_counter(counter.clone());
        let mut barriers = coord.add_source("source_demo_0");
        let handle = coord.handle();
        handle.source_ready();
        coord.activate().await.unwrap();

        clock.set(START + 1000);
        let b = barriers.recv().await.unwrap();
        handle.ack_source(b.checkpoint_id, "source_demo_0", Some(json!(1)));
        settle().await;
        assert_eq!(coord.get_complete_count(), 0);
        assert_eq!(coord.get_failed_count(), 1);
        assert_eq!(counter.get(), 1);

        let coord = Arc::new(coord);
        let saver = tokio::spawn({
            let coord = coord.clone();
            async move { coord.force_save().await }
        });
        let b = barriers.recv().await.unwrap();
        handle.ack_source(b.checkpoint_id, "source_demo_0", Some(json!(2)));
        let err = saver.await.unwrap().unwrap_err();
        assert!(matches!(err, TopologyError::Store(StoreError::Io(_))));
        assert_eq!(counter.get(), 2);
        coord.deactivate().await;
    }

    #[tokio::test]
    async fn test_activation_times_out_without_ready_sources() {
        let clock = MockClock::new(START);
        let mut coord = coordinator(clock, Arc::new(MemoryStore::new()));
        let _barriers = coord.add_source("source_demo_0");
        let err = coord.activate().await.unwrap_err();
        assert!(matches!(err, TopologyError::ActivationTimeout(_)));
        assert!(!coord.is_activated());
        assert!(matches!(
            coord.force_save().await,
            Err(TopologyError::NotActivated(_))
        ));
    }
}
