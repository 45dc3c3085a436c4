//! Error types for the rill runtime
//!
//! [`EvalError`] is the per-record error that flows through the pipeline as
//! data. Its `Display` output is exactly what a sink receives inside
//! `{"error": "..."}`, so variant formats are part of the user-visible
//! contract. [`TopologyError`] and [`StoreError`] are infrastructure errors
//! reported to the owner of a rule.

use rill_core::Value;
use rill_parser::ParseError;
use thiserror::Error;

/// Evaluation error of a single record
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvalError {
    /// Operator applied to operands of incompatible dynamic types.
    #[error("invalid operation {lhs} {op} {rhs}")]
    InvalidOperation {
        lhs: String,
        op: String,
        rhs: String,
    },

    #[error("divided by zero")]
    DividedByZero,

    /// A builtin function returned an error.
    #[error("call func {name} error: {message}")]
    Call { name: String, message: String },

    /// Sort keys of different types.
    #[error("incompatible types for comparison: {0} and {1}")]
    Incomparable(&'static str, &'static str),

    /// An error wrapped by the clause or operator that hit it.
    #[error("{context}: {source}")]
    Context {
        context: String,
        source: Box<EvalError>,
    },

    #[error("{0}")]
    Message(String),
}

impl EvalError {
    pub fn msg(message: impl Into<String>) -> Self {
        EvalError::Message(message.into())
    }

    pub fn invalid_operation(lhs: &Value, op: impl ToString, rhs: &Value) -> Self {
        EvalError::InvalidOperation {
            lhs: lhs.describe(),
            op: op.to_string(),
            rhs: rhs.describe(),
        }
    }

    pub fn call(name: impl Into<String>, message: impl Into<String>) -> Self {
        EvalError::Call {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Prefix the error, e.g. `run Where error: <self>`.
    pub fn context(self, context: impl Into<String>) -> Self {
        EvalError::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }
}

pub type EvalResult<T> = Result<T, EvalError>;

/// Error of the state store
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Key not found: {0}")]
    NotFound(String),
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Error creating, starting or stopping a topology
#[derive(Debug, Error)]
pub enum TopologyError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// The statement cannot be planned against the known streams.
    #[error("{0}")]
    Plan(String),

    #[error("fail to get stream {0}, please check if stream is created")]
    StreamNotFound(String),

    #[error("no source provided for stream {0}")]
    MissingSource(String),

    #[error("checkpoint coordinator of rule {0} fails to activate")]
    ActivationTimeout(String),

    #[error("checkpoint coordinator of rule {0} is not running")]
    NotActivated(String),

    #[error("rule {0} is saving state, cancel it later")]
    SaveInProgress(String),

    #[error("checkpoint {0} is declined")]
    CheckpointDeclined(i64),

    /// A checkpointed operator snapshot cannot be decoded.
    #[error("fail to restore state of {op}: {message}")]
    Restore { op: String, message: String },

    #[error("topology {0} is already running")]
    AlreadyOpen(String),

    #[error("connector error: {0}")]
    Connector(#[from] crate::connector::ConnectorError),

    #[error("state store error: {0}")]
    Store(#[from] StoreError),

    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

pub type TopologyResult<T> = Result<T, TopologyError>;
