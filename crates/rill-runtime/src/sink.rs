//! Sink implementations for rule results
//!
//! Each item that reaches a sink is either a batch of projected rows or an
//! evaluation error. Both render to a JSON array, so consumers see errors
//! positionally between good results:
//!
//! ```text
//! [{"color":"red","size":3}]
//! [{"error":"run Where error: invalid operation string(string) >= int64(3)"}]
//! ```

use crate::connector::ConnectorError;
use async_trait::async_trait;
use rill_core::{Value, ValueMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::debug;

/// Payload delivered to sinks
#[derive(Debug, Clone, PartialEq)]
pub enum SinkItem {
    Rows(Vec<ValueMap>),
    Error(String),
}

impl SinkItem {
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            SinkItem::Rows(rows) => serde_json::Value::Array(
                rows.iter()
                    .map(|r| Value::Map(r.clone()).to_json())
                    .collect(),
            ),
            SinkItem::Error(e) => serde_json::json!([{ "error": e }]),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, SinkItem::Error(_))
    }
}

/// Trait for result sinks
#[async_trait]
pub trait Sink: Send {
    /// Name of this sink, used in its operator id
    fn name(&self) -> &str;

    /// Open connections before the first item.
    async fn connect(&mut self) -> Result<(), ConnectorError> {
        Ok(())
    }

    /// Deliver one item.
    async fn collect(&mut self, item: &SinkItem) -> Result<(), ConnectorError>;

    /// Deliver an item again after a failed `collect`.
    async fn collect_resend(&mut self, item: &SinkItem) -> Result<(), ConnectorError> {
        self.collect(item).await
    }

    async fn close(&mut self) -> Result<(), ConnectorError> {
        Ok(())
    }
}

// =============================================================================
// Memory sink
// =============================================================================

/// Collects items in memory and optionally forwards them to a channel.
///
/// Clones share the same result buffer, so a test can keep one clone and
/// hand the other to the topology.
#[derive(Clone, Default)]
pub struct MemorySink {
    results: Arc<Mutex<Vec<SinkItem>>>,
    notify: Option<mpsc::UnboundedSender<SinkItem>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sink plus a receiver that yields every collected item.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SinkItem>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = Self {
            results: Arc::default(),
            notify: Some(tx),
        };
        (sink, rx)
    }

    pub fn results(&self) -> Vec<SinkItem> {
        self.results.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Sink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    async fn collect(&mut self, item: &SinkItem) -> Result<(), ConnectorError> {
        self.results
            .lock()
            .map_err(|e| ConnectorError::SendFailed(e.to_string()))?
            .push(item.clone());
        if let Some(tx) = &self.notify {
            let _ = tx.send(item.clone());
        }
        Ok(())
    }
}

// =============================================================================
// Console sink
// =============================================================================

/// Console sink - prints one JSON array per item to stdout
pub struct ConsoleSink {
    pretty: bool,
}

impl ConsoleSink {
    pub fn new() -> Self {
        Self { pretty: false }
    }

    pub fn pretty(mut self) -> Self {
        self.pretty = true;
        self
    }
}

impl Default for ConsoleSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Sink for ConsoleSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn collect(&mut self, item: &SinkItem) -> Result<(), ConnectorError> {
        let json = item.to_json();
        let text = if self.pretty {
            serde_json::to_string_pretty(&json)
        } else {
            serde_json::to_string(&json)
        }
        .map_err(|e| ConnectorError::SendFailed(e.to_string()))?;
        println!("{}", text);
        Ok(())
    }
}

// =============================================================================
// File sink
// =============================================================================

/// File sink - appends one JSON array per line
pub struct FileSink {
    path: PathBuf,
    file: Option<tokio::fs::File>,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: None,
        }
    }
}

#[async_trait]
impl Sink for FileSink {
    fn name(&self) -> &str {
        "file"
    }

    async fn connect(&mut self) -> Result<(), ConnectorError> {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| {
                ConnectorError::ConnectionFailed(format!("{}: {}", self.path.display(), e))
            })?;
        debug!("file sink opened {}", self.path.display());
        self.file = Some(file);
        Ok(())
    }

    async fn collect(&mut self, item: &SinkItem) -> Result<(), ConnectorError> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| ConnectorError::SendFailed("file sink is not connected".into()))?;
        let mut line = item.to_json().to_string();
        line.push('\n');
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| ConnectorError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), ConnectorError> {
        if let Some(mut file) = self.file.take() {
            file.flush()
                .await
                .map_err(|e| ConnectorError::SendFailed(e.to_string()))?;
        }
        Ok(())
    }
}
