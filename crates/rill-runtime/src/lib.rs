//! Rill Runtime - execution engine for rill rules
//!
//! A rule is one streaming `SELECT` over streams declared with
//! `CREATE STREAM`. This crate plans the statement into a chain of
//! operators and runs it as a [`Topology`] of tokio tasks:
//!
//! - [`planner`]: resolves streams and fields and orders the operators
//! - [`operators`], [`window`], [`join`]: per-record and per-window work
//! - [`evaluator`], [`functions`], [`aggregation`]: expression semantics
//! - [`checkpoint`], [`persistence`]: barrier checkpoints and restore
//! - [`connector`], [`sink`]: the edges of a rule
//! - [`metrics`]: Prometheus counters per operator

pub mod aggregation;
pub mod checkpoint;
pub mod clock;
pub mod config;
pub mod connector;
pub mod error;
pub mod evaluator;
pub mod functions;
pub mod join;
pub mod metrics;
pub mod operators;
pub mod persistence;
pub mod planner;
pub mod sink;
pub mod topo;
pub mod tuple;
pub mod valuer;
pub mod watermark;
pub mod window;

pub use checkpoint::{Barrier, Coordinator};
pub use clock::{Clock, MockClock, SharedClock, SystemClock};
pub use config::{PlanOptimizeStrategy, Qos, RuleDef, RuleOption};
pub use connector::{ConnectorConfig, FileSource, MemorySource, Source, SourceMessage};
pub use error::{EvalError, EvalResult, StoreError, TopologyError, TopologyResult};
pub use metrics::Metrics;
pub use persistence::{Checkpoint, FileStore, MemoryStore, StateStore};
pub use sink::{ConsoleSink, FileSink, MemorySink, Sink, SinkItem};
pub use topo::{Topology, TopologyBuilder};
pub use tuple::{Data, Tuple};
