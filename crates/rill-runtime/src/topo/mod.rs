//! Running topology of one rule
//!
//! A [`Topology`] wires the planned nodes together with bounded channels
//! (`bufferLength` items each) and runs every node as its own tokio task:
//!
//! ```text
//! source -> preprocessor -+
//! source -> preprocessor -+-> stage -> ... -> stage -+-> sink
//!                                                    +-> sink
//! ```
//!
//! With a checkpointing QoS a [`Coordinator`] injects barriers at the
//! sources; `open` restores operator state and source offsets from the
//! latest checkpoint in the store.
//!
//! # Example
//!
//! ```rust,no_run
//! use rill_runtime::{MemorySink, MemorySource, RuleDef, SystemClock, TopologyBuilder};
//!
//! # async fn run() -> Result<(), rill_runtime::TopologyError> {
//! let stream = rill_parser::parse_stream(
//!     r#"CREATE STREAM demo (color STRING, size BIGINT) WITH (DATASOURCE="demo", FORMAT="json")"#,
//! )?;
//! let sink = MemorySink::new();
//! let mut topo = TopologyBuilder::new(RuleDef::new("rule1", "SELECT color FROM demo"))
//!     .stream(stream)
//!     .source("demo", MemorySource::new("demo", vec![], SystemClock::shared()))
//!     .sink(sink.clone())
//!     .build()?;
//! topo.open().await?;
//! topo.sources_done().await;
//! topo.cancel().await?;
//! topo.wait_close().await;
//! # Ok(())
//! # }
//! ```

mod node;

pub use node::StreamItem;

use crate::checkpoint::{CheckpointHandle, Coordinator};
use crate::clock::{SharedClock, SystemClock};
use crate::config::RuleDef;
use crate::connector::{ConnectorConfig, Source};
use crate::error::{TopologyError, TopologyResult};
use crate::metrics::Metrics;
use crate::persistence::{Checkpoint, MemoryStore, StateStore};
use crate::planner::{self, Plan, Stage};
use crate::sink::Sink;
use crate::window::WindowState;
use node::{NodeContext, OperatorNode, Outputs, SinkNode, SourceNode, WindowNode};
use rill_core::StreamStmt;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Collects the streams, connectors and services of a rule.
pub struct TopologyBuilder {
    rule: RuleDef,
    streams: Vec<StreamStmt>,
    sources: Vec<(String, Box<dyn Source>)>,
    sinks: Vec<Box<dyn Sink>>,
    clock: SharedClock,
    store: Arc<dyn StateStore>,
}

impl TopologyBuilder {
    pub fn new(rule: RuleDef) -> Self {
        Self {
            rule,
            streams: Vec::new(),
            sources: Vec::new(),
            sinks: Vec::new(),
            clock: SystemClock::shared(),
            store: Arc::new(MemoryStore::new()),
        }
    }

    /// Register a stream definition the rule may read.
    pub fn stream(mut self, stream: StreamStmt) -> Self {
        self.streams.push(stream);
        self
    }

    /// Connector feeding the stream `stream`.
    pub fn source(mut self, stream: impl Into<String>, source: impl Source + 'static) -> Self {
        self.sources.push((stream.into(), Box::new(source)));
        self
    }

    pub fn sink(mut self, sink: impl Sink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Checkpoint store, shared across restarts of the rule.
    pub fn store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = store;
        self
    }

    /// Plan the rule and pair every planned stream with its source.
    pub fn build(mut self) -> TopologyResult<Topology> {
        let plan = planner::plan(&self.rule, &self.streams)?;
        let mut sources = Vec::with_capacity(plan.sources.len());
        for planned in &plan.sources {
            let pos = self
                .sources
                .iter()
                .position(|(name, _)| name.eq_ignore_ascii_case(&planned.stream.name))
                .ok_or_else(|| TopologyError::MissingSource(planned.stream.name.clone()))?;
            sources.push(self.sources.remove(pos).1);
        }
        if self.sinks.is_empty() {
            warn!(rule = %self.rule.id, "rule has no sink, results are discarded");
        }
        let metrics = Metrics::new(&self.rule.id)?;
        let (cancel, _) = watch::channel(false);
        let (done, done_rx) = watch::channel(0);
        let source_count = sources.len();
        Ok(Topology {
            rule: self.rule,
            clock: self.clock,
            store: self.store,
            metrics,
            parts: Some(Parts {
                plan,
                sources,
                sinks: self.sinks,
            }),
            source_count,
            coordinator: None,
            cancel,
            done: Arc::new(done),
            done_rx,
            tasks: Vec::new(),
        })
    }
}

struct Parts {
    plan: Plan,
    sources: Vec<Box<dyn Source>>,
    sinks: Vec<Box<dyn Sink>>,
}

/// A rule wired into node tasks
pub struct Topology {
    rule: RuleDef,
    clock: SharedClock,
    store: Arc<dyn StateStore>,
    metrics: Metrics,
    parts: Option<Parts>,
    source_count: usize,
    coordinator: Option<Arc<Coordinator>>,
    cancel: watch::Sender<bool>,
    done: Arc<watch::Sender<usize>>,
    done_rx: watch::Receiver<usize>,
    tasks: Vec<JoinHandle<()>>,
}

impl Topology {
    pub fn rule(&self) -> &RuleDef {
        &self.rule
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Checkpoint coordinator, present once a checkpointing rule is open.
    pub fn get_coordinator(&self) -> Option<&Arc<Coordinator>> {
        self.coordinator.as_ref()
    }

    /// Operator ids in plan order, sinks last.
    pub fn op_ids(&self) -> Vec<String> {
        match &self.parts {
            Some(parts) => {
                let mut ids: Vec<String> =
                    parts.plan.op_ids().into_iter().map(String::from).collect();
                ids.extend(sink_ids(&parts.sinks));
                ids
            }
            None => Vec::new(),
        }
    }

    /// Connect every connector and start the node tasks.
    pub async fn open(&mut self) -> TopologyResult<()> {
        let Some(parts) = self.parts.take() else {
            return Err(TopologyError::AlreadyOpen(self.rule.id.clone()));
        };
        info!(rule = %self.rule.id, "open topology");
        let options = self.rule.options.clone();
        let qos = options.qos;

        let checkpoint = if qos.checkpointing() {
            self.store.load_latest_checkpoint()?
        } else {
            None
        };
        if let Some(cp) = &checkpoint {
            info!(rule = %self.rule.id, "restore from checkpoint {}", cp.id);
        }
        let checkpoint = checkpoint.unwrap_or_default();

        let Parts {
            plan,
            mut sources,
            mut sinks,
        } = parts;
        let mut restored = restore_states(&plan, &checkpoint)?;

        let mut coordinator = qos.checkpointing().then(|| {
            Coordinator::new(
                self.rule.id.clone(),
                options.checkpoint_interval,
                self.clock.clone(),
                self.store.clone(),
            )
            .with_failure_counter(self.metrics.checkpoint_failures())
        });
        let handle: Option<CheckpointHandle> = coordinator.as_ref().map(Coordinator::handle);
        let ctx = |op_id: &str| NodeContext {
            op_id: op_id.to_string(),
            metrics: self.metrics.op(op_id),
            checkpoint: handle.clone(),
            send_error: options.send_error,
            cancel: self.cancel.subscribe(),
        };
        let capacity = options.buffer_length.max(1);

        for (planned, source) in plan.sources.iter().zip(sources.iter_mut()) {
            source.provision(&connector_config(&planned.stream)).await?;
            if let Some(offset) = checkpoint.offsets.get(&planned.id) {
                source.rewind(offset)?;
            }
        }
        for sink in sinks.iter_mut() {
            sink.connect().await?;
        }

        // Edges from the last stage to each sink
        let sink_ids = sink_ids(&sinks);
        let mut last_outputs = Vec::with_capacity(sinks.len());
        let mut sink_nodes = Vec::with_capacity(sinks.len());
        for (sink, id) in sinks.into_iter().zip(sink_ids) {
            let (tx, rx) = mpsc::channel(capacity);
            last_outputs.push(tx);
            if let Some(c) = coordinator.as_mut() {
                c.add_responder(&id);
            }
            sink_nodes.push(SinkNode::new(ctx(&id), sink, qos, vec![rx]));
        }

        // Stages, wired back to front
        let Plan {
            sources: planned_sources,
            stages,
            ..
        } = plan;
        let mut outputs = last_outputs;
        let mut stage_tasks = Vec::with_capacity(stages.len());
        let mut first_inputs = Vec::new();
        for (i, stage) in stages.into_iter().enumerate().rev() {
            let fan_in = if i == 0 { planned_sources.len() } else { 1 };
            let mut senders = Vec::with_capacity(fan_in);
            let mut receivers = Vec::with_capacity(fan_in);
            for _ in 0..fan_in {
                let (tx, rx) = mpsc::channel(capacity);
                senders.push(tx);
                receivers.push(rx);
            }
            if let Some(c) = coordinator.as_mut() {
                c.add_responder(&stage.id);
            }
            let out = Outputs::new(std::mem::take(&mut outputs));
            let task: JoinHandle<()> = match stage.stage {
                Stage::Operator(op) => {
                    let node = OperatorNode::new(ctx(&stage.id), op, qos, receivers, out);
                    tokio::spawn(node.run())
                }
                Stage::Window(mut window) => {
                    if let Some(state) = restored.remove(&stage.id) {
                        window.restore(state);
                    }
                    let node = WindowNode::new(
                        ctx(&stage.id),
                        window,
                        self.clock.clone(),
                        qos,
                        receivers,
                        out,
                    );
                    tokio::spawn(node.run())
                }
            };
            stage_tasks.push(task);
            if i == 0 {
                first_inputs = senders;
            } else {
                outputs = senders;
            }
        }

        // Sources and their preprocessors
        let mut source_nodes = Vec::with_capacity(planned_sources.len());
        let mut pre_nodes = Vec::with_capacity(planned_sources.len());
        for ((planned, source), to_stage) in planned_sources
            .into_iter()
            .zip(sources)
            .zip(first_inputs)
        {
            let (tx, rx) = mpsc::channel(capacity);
            let barriers = coordinator.as_mut().map(|c| c.add_source(&planned.id));
            if let Some(c) = coordinator.as_mut() {
                c.add_responder(&planned.preprocessor.id);
            }
            let Stage::Operator(pre) = planned.preprocessor.stage else {
                continue;
            };
            pre_nodes.push(OperatorNode::new(
                ctx(&planned.preprocessor.id),
                pre,
                qos,
                vec![rx],
                Outputs::new(vec![to_stage]),
            ));
            source_nodes.push(SourceNode {
                ctx: ctx(&planned.id),
                source,
                emitter: planned.ref_name,
                clock: self.clock.clone(),
                buffer_length: capacity,
                barriers,
                outputs: Outputs::new(vec![tx]),
                done: self.done.clone(),
            });
        }

        self.tasks.extend(stage_tasks);
        self.tasks
            .extend(sink_nodes.into_iter().map(|n| tokio::spawn(n.run())));
        self.tasks
            .extend(pre_nodes.into_iter().map(|n| tokio::spawn(n.run())));
        self.tasks
            .extend(source_nodes.into_iter().map(|n| tokio::spawn(n.run())));

        if let Some(coordinator) = coordinator {
            let coordinator = Arc::new(coordinator);
            self.coordinator = Some(coordinator.clone());
            if let Err(e) = coordinator.activate().await {
                self.cancel.send_replace(true);
                return Err(e);
            }
        }
        info!(rule = %self.rule.id, "topology opened");
        Ok(())
    }

    /// Stop the rule. With `enableSaveStateBeforeStop` a final checkpoint is
    /// taken first; the rule stops even when that save fails, and the save
    /// error is returned.
    pub async fn cancel(&self) -> TopologyResult<()> {
        let mut saved = Ok(());
        if let Some(coordinator) = &self.coordinator {
            if coordinator.is_saving() {
                return Err(TopologyError::SaveInProgress(self.rule.id.clone()));
            }
            if self.rule.options.enable_save_state_before_stop && coordinator.is_activated() {
                match coordinator.force_save().await {
                    Ok(id) => info!(rule = %self.rule.id, "saved state {} before stop", id),
                    Err(e) => {
                        error!(rule = %self.rule.id, "save state before stop failed: {}", e);
                        saved = Err(e);
                    }
                }
            }
            coordinator.deactivate().await;
        }
        info!(rule = %self.rule.id, "cancel topology");
        self.cancel.send_replace(true);
        saved
    }

    /// Take a checkpoint now and wait for it to complete.
    pub async fn force_save(&self) -> TopologyResult<i64> {
        match &self.coordinator {
            Some(coordinator) => coordinator.force_save().await,
            None => Err(TopologyError::NotActivated(self.rule.id.clone())),
        }
    }

    /// Resolves once every source has reached the end of its input.
    pub async fn sources_done(&self) {
        let mut rx = self.done_rx.clone();
        loop {
            if *rx.borrow_and_update() >= self.source_count {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Wait for every node task to finish after [`cancel`](Self::cancel).
    pub async fn wait_close(&mut self) {
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!(rule = %self.rule.id, "node task failed: {}", e);
            }
        }
        info!(rule = %self.rule.id, "topology closed");
    }

    /// Latest complete checkpoint in the store.
    pub fn latest_checkpoint(&self) -> TopologyResult<Option<Checkpoint>> {
        Ok(self.store.load_latest_checkpoint()?)
    }
}

/// Reload operator states of the checkpoint and decode its window
/// snapshots, before any node starts.
fn restore_states(
    plan: &Plan,
    checkpoint: &Checkpoint,
) -> TopologyResult<HashMap<String, WindowState>> {
    let mut windows = HashMap::new();
    for stage in &plan.stages {
        let Some(value) = checkpoint.op_states.get(&stage.id) else {
            continue;
        };
        let restore_error = |message: String| TopologyError::Restore {
            op: stage.id.clone(),
            message,
        };
        match &stage.stage {
            Stage::Window(_) => {
                let state = serde_json::from_value::<WindowState>(value.clone())
                    .map_err(|e| restore_error(e.to_string()))?;
                windows.insert(stage.id.clone(), state);
            }
            Stage::Operator(op) => op.restore(value.clone()).map_err(restore_error)?,
        }
    }
    Ok(windows)
}

fn sink_ids(sinks: &[Box<dyn Sink>]) -> Vec<String> {
    sinks
        .iter()
        .enumerate()
        .map(|(i, s)| format!("sink_{}_{}", s.name(), i))
        .collect()
}

/// Connector settings from the `WITH` options of a stream.
fn connector_config(stream: &StreamStmt) -> ConnectorConfig {
    let opts = &stream.options;
    let mut config = ConnectorConfig::new(
        opts.source_type.as_deref().unwrap_or("memory"),
        opts.datasource.as_deref().unwrap_or(&stream.name),
    );
    for (key, value) in [
        ("format", &opts.format),
        ("key", &opts.key),
        ("confKey", &opts.conf_key),
        ("timestamp", &opts.timestamp),
        ("timestampFormat", &opts.timestamp_format),
    ] {
        if let Some(v) = value {
            config = config.with_property(key, v);
        }
    }
    config
}
