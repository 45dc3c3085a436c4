//! Node tasks of a running topology

use crate::checkpoint::{barrier_handler, Aligned, Barrier, BarrierHandler, CheckpointHandle};
use crate::clock::SharedClock;
use crate::config::Qos;
use crate::connector::{Source, SourceEvent};
use crate::metrics::OpMetrics;
use crate::operators::Operation;
use crate::sink::{Sink, SinkItem};
use crate::tuple::{Data, Tuple, WindowTuplesSet};
use crate::window::WindowOperator;
use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, SelectAll, StreamExt};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Item on an edge between two nodes
#[derive(Debug, Clone)]
pub enum StreamItem {
    Data(Data),
    /// Evaluation error travelling to the sinks
    Error(String),
    Barrier(Barrier),
}

type Inputs = SelectAll<BoxStream<'static, (usize, StreamItem)>>;

/// Merge the input edges of a node, tagging each item with its input index.
fn merge(inputs: Vec<mpsc::Receiver<StreamItem>>) -> Inputs {
    stream::select_all(inputs.into_iter().enumerate().map(|(i, rx)| {
        stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) })
            .map(move |item| (i, item))
            .boxed()
    }))
}

/// Resolves once the topology is cancelled or dropped.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            return;
        }
    }
}

/// Fan-out edges of a node
pub(crate) struct Outputs(Vec<mpsc::Sender<StreamItem>>);

impl Outputs {
    pub fn new(senders: Vec<mpsc::Sender<StreamItem>>) -> Self {
        Self(senders)
    }

    async fn send(&self, item: StreamItem) {
        let Some((last, rest)) = self.0.split_last() else {
            return;
        };
        for tx in rest {
            if tx.send(item.clone()).await.is_err() {
                debug!("downstream closed");
            }
        }
        if last.send(item).await.is_err() {
            debug!("downstream closed");
        }
    }
}

/// What every node needs besides its own work
pub(crate) struct NodeContext {
    pub op_id: String,
    pub metrics: OpMetrics,
    pub checkpoint: Option<CheckpointHandle>,
    pub send_error: bool,
    pub cancel: watch::Receiver<bool>,
}

impl NodeContext {
    fn ack(&self, barrier: Barrier, state: Option<serde_json::Value>) {
        if let Some(handle) = &self.checkpoint {
            handle.ack(barrier.checkpoint_id, &self.op_id, state);
        }
    }

    /// Count a failed item and turn it into an error item if errors are sent.
    fn fail(&self, message: String) -> Option<StreamItem> {
        self.metrics.inc_exception();
        if self.send_error {
            Some(StreamItem::Error(message))
        } else {
            warn!(op = %self.op_id, "{}", message);
            None
        }
    }
}

fn aligned_or_pass(
    handler: &mut Option<Box<dyn BarrierHandler<StreamItem>>>,
    input: usize,
    barrier: Barrier,
) -> Option<Aligned<StreamItem>> {
    match handler {
        Some(h) => h.on_barrier(input, barrier),
        None => Some(Aligned {
            barrier,
            replay: Vec::new(),
        }),
    }
}

fn held(
    handler: &mut Option<Box<dyn BarrierHandler<StreamItem>>>,
    input: usize,
    item: StreamItem,
) -> Option<StreamItem> {
    match handler {
        Some(h) => h.hold(input, item),
        None => Some(item),
    }
}

// =============================================================================
// Source
// =============================================================================

pub(crate) struct SourceNode {
    pub ctx: NodeContext,
    pub source: Box<dyn Source>,
    /// Reference name of the stream, stamped on every tuple
    pub emitter: String,
    pub clock: SharedClock,
    pub buffer_length: usize,
    pub barriers: Option<mpsc::UnboundedReceiver<Barrier>>,
    pub outputs: Outputs,
    pub done: Arc<watch::Sender<usize>>,
}

impl SourceNode {
    pub async fn run(self) {
        let SourceNode {
            ctx,
            mut source,
            emitter,
            clock,
            buffer_length,
            mut barriers,
            outputs,
            done,
        } = self;
        let mut offset = source.get_offset();
        let (ingest, mut events) = mpsc::channel(buffer_length.max(1));
        let mut reader_cancel = ctx.cancel.clone();
        let op_id = ctx.op_id.clone();
        tokio::spawn(async move {
            tokio::select! {
                result = source.subscribe(ingest.clone()) => {
                    if let Err(e) = result {
                        let _ = ingest.send(SourceEvent::Error(e.to_string())).await;
                    }
                }
                _ = cancelled(&mut reader_cancel) => {}
            }
            if let Err(e) = source.close().await {
                warn!(op = %op_id, "close source error: {}", e);
            }
        });
        if let Some(handle) = &ctx.checkpoint {
            handle.source_ready();
        }
        info!(op = %ctx.op_id, "source {} started", emitter);

        let mut cancel = ctx.cancel.clone();
        let mut reading = true;
        let mut finished = false;
        loop {
            tokio::select! {
                biased;
                _ = cancelled(&mut cancel) => break,
                Some(barrier) = next_barrier(&mut barriers) => {
                    if let Some(handle) = &ctx.checkpoint {
                        handle.ack_source(barrier.checkpoint_id, &ctx.op_id, offset.clone());
                    }
                    outputs.send(StreamItem::Barrier(barrier)).await;
                }
                event = events.recv(), if reading => match event {
                    Some(SourceEvent::Message(msg)) => {
                        ctx.metrics.inc_in();
                        let started = Instant::now();
                        let ts = msg.timestamp.unwrap_or_else(|| clock.now_ms());
                        let tuple = Tuple::new(emitter.as_str(), msg.message, ts)
                            .with_metadata(msg.metadata);
                        if msg.offset.is_some() {
                            offset = msg.offset;
                        }
                        outputs.send(StreamItem::Data(Data::Tuple(tuple))).await;
                        ctx.metrics.inc_out(1);
                        ctx.metrics.observe(started);
                    }
                    Some(SourceEvent::Error(e)) => {
                        if let Some(item) = ctx.fail(e) {
                            outputs.send(item).await;
                        }
                    }
                    Some(SourceEvent::Eof) => mark_done(&ctx.op_id, &mut finished, &done),
                    None => {
                        reading = false;
                        mark_done(&ctx.op_id, &mut finished, &done);
                    }
                },
            }
        }
        debug!(op = %ctx.op_id, "source node stopped");
    }
}

fn mark_done(op_id: &str, finished: &mut bool, done: &watch::Sender<usize>) {
    if !*finished {
        *finished = true;
        debug!(op = %op_id, "source exhausted");
        done.send_modify(|n| *n += 1);
    }
}

fn next_barrier(
    barriers: &mut Option<mpsc::UnboundedReceiver<Barrier>>,
) -> BoxFuture<'_, Option<Barrier>> {
    match barriers {
        Some(rx) => Box::pin(rx.recv()),
        None => Box::pin(futures::future::pending()),
    }
}

// =============================================================================
// Operator
// =============================================================================

pub(crate) struct OperatorNode {
    pub ctx: NodeContext,
    pub op: Box<dyn Operation>,
    pub inputs: Vec<mpsc::Receiver<StreamItem>>,
    pub outputs: Outputs,
    pub barriers: Option<Box<dyn BarrierHandler<StreamItem>>>,
}

impl OperatorNode {
    pub fn new(
        ctx: NodeContext,
        op: Box<dyn Operation>,
        qos: Qos,
        inputs: Vec<mpsc::Receiver<StreamItem>>,
        outputs: Outputs,
    ) -> Self {
        let barriers = barrier_handler(qos, inputs.len());
        Self {
            ctx,
            op,
            inputs,
            outputs,
            barriers,
        }
    }

    /// Runs until every input is closed.
    pub async fn run(mut self) {
        let mut merged = merge(std::mem::take(&mut self.inputs));
        while let Some((input, item)) = merged.next().await {
            match item {
                StreamItem::Barrier(barrier) => {
                    let Some(aligned) = aligned_or_pass(&mut self.barriers, input, barrier)
                    else {
                        continue;
                    };
                    self.ctx.ack(aligned.barrier, self.op.snapshot());
                    self.outputs.send(StreamItem::Barrier(aligned.barrier)).await;
                    for (_, item) in aligned.replay {
                        self.process(item).await;
                    }
                }
                item => {
                    if let Some(item) = held(&mut self.barriers, input, item) {
                        self.process(item).await;
                    }
                }
            }
        }
        debug!(op = %self.ctx.op_id, "operator node stopped");
    }

    async fn process(&mut self, item: StreamItem) {
        let data = match item {
            StreamItem::Data(data) => data,
            other => return self.outputs.send(other).await,
        };
        self.ctx.metrics.inc_in();
        let started = Instant::now();
        let result = self.op.apply(data);
        self.ctx.metrics.observe(started);
        match result {
            Ok(Some(out)) => {
                self.outputs.send(StreamItem::Data(out)).await;
                self.ctx.metrics.inc_out(1);
            }
            Ok(None) => {}
            Err(e) => {
                if let Some(item) = self.ctx.fail(e.to_string()) {
                    self.outputs.send(item).await;
                }
            }
        }
    }
}

// =============================================================================
// Window
// =============================================================================

pub(crate) struct WindowNode {
    pub ctx: NodeContext,
    pub window: WindowOperator,
    pub clock: SharedClock,
    pub inputs: Vec<mpsc::Receiver<StreamItem>>,
    pub outputs: Outputs,
    pub barriers: Option<Box<dyn BarrierHandler<StreamItem>>>,
}

impl WindowNode {
    pub fn new(
        ctx: NodeContext,
        window: WindowOperator,
        clock: SharedClock,
        qos: Qos,
        inputs: Vec<mpsc::Receiver<StreamItem>>,
        outputs: Outputs,
    ) -> Self {
        let barriers = barrier_handler(qos, inputs.len());
        Self {
            ctx,
            window,
            clock,
            inputs,
            outputs,
            barriers,
        }
    }

    /// Runs until cancelled. Timers keep firing after the inputs close.
    pub async fn run(mut self) {
        let sets = self.window.start(self.clock.now_ms());
        self.emit(sets).await;

        let mut merged = merge(std::mem::take(&mut self.inputs));
        let mut cancel = self.ctx.cancel.clone();
        let mut open = true;
        loop {
            let timer: BoxFuture<'static, ()> = match self.window.next_deadline() {
                Some(deadline) => self.clock.sleep_until(deadline),
                None => Box::pin(futures::future::pending()),
            };
            tokio::select! {
                biased;
                _ = cancelled(&mut cancel) => break,
                _ = timer => {
                    let sets = self.window.on_timer(self.clock.now_ms());
                    self.emit(sets).await;
                }
                next = merged.next(), if open => match next {
                    Some((input, item)) => self.on_item(input, item).await,
                    None => open = false,
                },
            }
        }
        debug!(op = %self.ctx.op_id, "window node stopped");
    }

    async fn on_item(&mut self, input: usize, item: StreamItem) {
        match item {
            StreamItem::Barrier(barrier) => {
                let Some(aligned) = aligned_or_pass(&mut self.barriers, input, barrier) else {
                    return;
                };
                self.snapshot(aligned.barrier);
                self.outputs.send(StreamItem::Barrier(aligned.barrier)).await;
                for (_, item) in aligned.replay {
                    self.process(item).await;
                }
            }
            item => {
                if let Some(item) = held(&mut self.barriers, input, item) {
                    self.process(item).await;
                }
            }
        }
    }

    fn snapshot(&self, barrier: Barrier) {
        let Some(handle) = &self.ctx.checkpoint else {
            return;
        };
        match serde_json::to_value(self.window.snapshot()) {
            Ok(state) => handle.ack(barrier.checkpoint_id, &self.ctx.op_id, Some(state)),
            Err(e) => handle.decline(barrier.checkpoint_id, &self.ctx.op_id, e.to_string()),
        }
    }

    async fn process(&mut self, item: StreamItem) {
        let tuple = match item {
            StreamItem::Data(Data::Tuple(tuple)) => tuple,
            StreamItem::Data(other) => {
                let message = format!("window accepts tuples only, got {}", other.kind());
                if let Some(item) = self.ctx.fail(message) {
                    self.outputs.send(item).await;
                }
                return;
            }
            other => return self.outputs.send(other).await,
        };
        self.ctx.metrics.inc_in();
        let started = Instant::now();
        let result = self.window.on_tuple(tuple);
        self.ctx.metrics.observe(started);
        match result {
            Ok(sets) => self.emit(sets).await,
            Err(e) => {
                if let Some(item) = self.ctx.fail(e.to_string()) {
                    self.outputs.send(item).await;
                }
            }
        }
    }

    async fn emit(&mut self, sets: Vec<WindowTuplesSet>) {
        for set in sets {
            self.outputs.send(StreamItem::Data(Data::Window(set))).await;
            self.ctx.metrics.inc_out(1);
        }
    }
}

// =============================================================================
// Sink
// =============================================================================

pub(crate) struct SinkNode {
    pub ctx: NodeContext,
    pub sink: Box<dyn Sink>,
    pub inputs: Vec<mpsc::Receiver<StreamItem>>,
    pub barriers: Option<Box<dyn BarrierHandler<StreamItem>>>,
}

impl SinkNode {
    pub fn new(
        ctx: NodeContext,
        sink: Box<dyn Sink>,
        qos: Qos,
        inputs: Vec<mpsc::Receiver<StreamItem>>,
    ) -> Self {
        let barriers = barrier_handler(qos, inputs.len());
        Self {
            ctx,
            sink,
            inputs,
            barriers,
        }
    }

    /// Runs until every input is closed, then closes the sink.
    pub async fn run(mut self) {
        let mut merged = merge(std::mem::take(&mut self.inputs));
        while let Some((input, item)) = merged.next().await {
            match item {
                StreamItem::Barrier(barrier) => {
                    let Some(aligned) = aligned_or_pass(&mut self.barriers, input, barrier)
                    else {
                        continue;
                    };
                    self.ctx.ack(aligned.barrier, None);
                    for (_, item) in aligned.replay {
                        self.collect(item).await;
                    }
                }
                item => {
                    if let Some(item) = held(&mut self.barriers, input, item) {
                        self.collect(item).await;
                    }
                }
            }
        }
        if let Err(e) = self.sink.close().await {
            warn!(op = %self.ctx.op_id, "close sink error: {}", e);
        }
        debug!(op = %self.ctx.op_id, "sink node stopped");
    }

    async fn collect(&mut self, item: StreamItem) {
        let item = match item {
            StreamItem::Data(Data::Rows(rows)) => SinkItem::Rows(rows),
            StreamItem::Error(e) => SinkItem::Error(e),
            StreamItem::Data(other) => {
                warn!(op = %self.ctx.op_id, "sink dropped unprojected {}", other.kind());
                return;
            }
            StreamItem::Barrier(_) => return,
        };
        self.ctx.metrics.inc_in();
        let started = Instant::now();
        if let Err(e) = self.sink.collect(&item).await {
            warn!(op = %self.ctx.op_id, "collect error: {}, resending", e);
            if let Err(e) = self.sink.collect_resend(&item).await {
                error!(op = %self.ctx.op_id, "resend error: {}", e);
                self.ctx.metrics.inc_exception();
                return;
            }
        }
        self.ctx.metrics.observe(started);
        self.ctx.metrics.inc_out(1);
    }
}
