//! Prometheus metrics for rule topologies
//!
//! Every node of a topology (source, operator, sink) owns an [`OpMetrics`]
//! handle labelled with its operator id, e.g. `op_2_window_0`. The topology
//! calls it after every apply. [`Metrics::snapshot`] flattens the counters to
//! `<opId>_records_in_total` style keys.

use prometheus::{IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

pub const RECORDS_IN_TOTAL: &str = "records_in_total";
pub const RECORDS_OUT_TOTAL: &str = "records_out_total";
pub const EXCEPTIONS_TOTAL: &str = "exceptions_total";
pub const PROCESS_LATENCY_US: &str = "process_latency_us";
pub const CHECKPOINT_FAILURES_TOTAL: &str = "checkpoint_failures_total";

/// Metrics registry of one rule
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,
    records_in: IntCounterVec,
    records_out: IntCounterVec,
    exceptions: IntCounterVec,
    process_latency: IntGaugeVec,
    checkpoint_failures: IntCounter,
    ops: Arc<RwLock<Vec<(String, OpMetrics)>>>,
}

impl Metrics {
    pub fn new(rule_id: &str) -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let opts = |name: &str, help: &str| {
            Opts::new(format!("rill_{}", name), help).const_label("rule", rule_id)
        };

        let records_in = IntCounterVec::new(
            opts(RECORDS_IN_TOTAL, "Records received by the operator"),
            &["op"],
        )?;
        let records_out = IntCounterVec::new(
            opts(RECORDS_OUT_TOTAL, "Records emitted by the operator"),
            &["op"],
        )?;
        let exceptions = IntCounterVec::new(
            opts(EXCEPTIONS_TOTAL, "Records that failed in the operator"),
            &["op"],
        )?;
        let process_latency = IntGaugeVec::new(
            opts(PROCESS_LATENCY_US, "Latency of the last apply in microseconds"),
            &["op"],
        )?;

        let checkpoint_failures = IntCounter::with_opts(opts(
            CHECKPOINT_FAILURES_TOTAL,
            "Completed checkpoints the state store failed to persist",
        ))?;

        registry.register(Box::new(records_in.clone()))?;
        registry.register(Box::new(records_out.clone()))?;
        registry.register(Box::new(exceptions.clone()))?;
        registry.register(Box::new(process_latency.clone()))?;
        registry.register(Box::new(checkpoint_failures.clone()))?;

        Ok(Self {
            registry: Arc::new(registry),
            records_in,
            records_out,
            exceptions,
            process_latency,
            checkpoint_failures,
            ops: Arc::new(RwLock::new(Vec::new())),
        })
    }

    /// Handle for one operator. Repeated calls with the same id share counters.
    pub fn op(&self, op_id: &str) -> OpMetrics {
        if let Ok(ops) = self.ops.read() {
            if let Some((_, m)) = ops.iter().find(|(id, _)| id == op_id) {
                return m.clone();
            }
        }
        let m = OpMetrics {
            records_in: self.records_in.with_label_values(&[op_id]),
            records_out: self.records_out.with_label_values(&[op_id]),
            exceptions: self.exceptions.with_label_values(&[op_id]),
            process_latency: self.process_latency.with_label_values(&[op_id]),
        };
        if let Ok(mut ops) = self.ops.write() {
            if !ops.iter().any(|(id, _)| id == op_id) {
                ops.push((op_id.to_string(), m.clone()));
            }
        }
        m
    }

    /// Rule-level counter of checkpoints lost to storage errors.
    pub fn checkpoint_failures(&self) -> IntCounter {
        self.checkpoint_failures.clone()
    }

    /// Counter values keyed `<opId>_<metric>`, plus the rule-level
    /// `checkpoint_failures_total`.
    pub fn snapshot(&self) -> BTreeMap<String, i64> {
        let mut out = BTreeMap::new();
        out.insert(
            CHECKPOINT_FAILURES_TOTAL.to_string(),
            self.checkpoint_failures.get() as i64,
        );
        if let Ok(ops) = self.ops.read() {
            for (id, m) in ops.iter() {
                out.insert(format!("{}_{}", id, RECORDS_IN_TOTAL), m.records_in.get() as i64);
                out.insert(format!("{}_{}", id, RECORDS_OUT_TOTAL), m.records_out.get() as i64);
                out.insert(format!("{}_{}", id, EXCEPTIONS_TOTAL), m.exceptions.get() as i64);
                out.insert(format!("{}_{}", id, PROCESS_LATENCY_US), m.process_latency.get());
            }
        }
        out
    }

    /// Get Prometheus text output
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if encoder.encode(&metric_families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

/// Counters of one operator
#[derive(Clone)]
pub struct OpMetrics {
    records_in: IntCounter,
    records_out: IntCounter,
    exceptions: IntCounter,
    process_latency: IntGauge,
}

impl OpMetrics {
    pub fn inc_in(&self) {
        self.records_in.inc();
    }

    pub fn inc_out(&self, n: u64) {
        self.records_out.inc_by(n);
    }

    pub fn inc_exception(&self) {
        self.exceptions.inc();
    }

    /// Record the latency of an apply that started at `started`.
    pub fn observe(&self, started: Instant) {
        self.process_latency
            .set(started.elapsed().as_micros().min(i64::MAX as u128) as i64);
    }
}
