//! Source connectors
//!
//! A source feeds one stream of a rule. The topology drives it through a
//! fixed lifecycle:
//!
//! ```text
//! provision(config) -> [rewind(offset)] -> subscribe(ingest) ... -> close()
//! ```
//!
//! `subscribe` pushes [`SourceEvent`]s into the ingest channel until the input
//! is exhausted or the channel is closed. Bounded sources end with
//! [`SourceEvent::Eof`]. I/O problems are reported in-band with
//! [`SourceEvent::Error`] so one bad read does not stop the rule.
//!
//! Every message carries the offset to resume *after* it. The source node of
//! the topology stores the last offset in each checkpoint and hands it back
//! to [`Source::rewind`] on restart.
//!
//! # Available Sources
//!
//! | Source         | Description                                           |
//! |----------------|-------------------------------------------------------|
//! | `MemorySource` | Preloaded messages released as the clock reaches them |
//! | `FileSource`   | JSON lines file, one message per line                 |

use crate::clock::SharedClock;
use async_trait::async_trait;
use indexmap::IndexMap;
use rill_core::{Value, ValueMap};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Generic connector configuration.
///
/// Built from the `WITH` options of a stream: `DATASOURCE` becomes `url`,
/// the remaining options land in `properties`.
///
/// # Example
///
/// ```rust
/// use rill_runtime::connector::ConnectorConfig;
///
/// let config = ConnectorConfig::new("file", "data/demo.jsonl")
///     .with_property("format", "json");
/// assert_eq!(config.properties["format"], "json");
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectorConfig {
    /// Connector type identifier (e.g., "memory", "file")
    pub connector_type: String,
    /// Connection URL, address or file path
    pub url: String,
    /// Additional connector-specific properties
    #[serde(default)]
    pub properties: IndexMap<String, String>,
}

impl ConnectorConfig {
    pub fn new(connector_type: &str, url: &str) -> Self {
        Self {
            connector_type: connector_type.to_string(),
            url: url.to_string(),
            properties: IndexMap::new(),
        }
    }

    pub fn with_property(mut self, key: &str, value: &str) -> Self {
        self.properties.insert(key.to_string(), value.to_string());
        self
    }
}

/// Errors that can occur during connector operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConnectorError {
    /// Failed to open or reach the external system.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to write an item to a sink.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to read from a source.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// Invalid or incomplete configuration.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// The offset handed to `rewind` is not one this source produced.
    #[error("Invalid offset: {0}")]
    InvalidOffset(String),
}

// =============================================================================
// Contract
// =============================================================================

/// One record read by a source
#[derive(Debug, Clone, PartialEq)]
pub struct SourceMessage {
    pub message: ValueMap,
    pub metadata: ValueMap,
    /// Timestamp assigned by the source, `None` to use the processing time.
    pub timestamp: Option<i64>,
    /// Offset to rewind to in order to continue after this message.
    pub offset: Option<serde_json::Value>,
}

impl SourceMessage {
    pub fn new(message: ValueMap) -> Self {
        Self {
            message,
            metadata: ValueMap::new(),
            timestamp: None,
            offset: None,
        }
    }

    pub fn at(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_metadata(mut self, metadata: ValueMap) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Item pushed into the ingest channel
#[derive(Debug, Clone, PartialEq)]
pub enum SourceEvent {
    Message(SourceMessage),
    /// A read failed; the source keeps running.
    Error(String),
    /// Bounded input is exhausted.
    Eof,
}

pub type Ingest = mpsc::Sender<SourceEvent>;

/// Trait for sources that feed a stream.
#[async_trait]
pub trait Source: Send {
    /// Returns the name/identifier of this source instance.
    fn name(&self) -> &str;

    /// Apply configuration before the first subscribe.
    async fn provision(&mut self, _config: &ConnectorConfig) -> Result<(), ConnectorError> {
        Ok(())
    }

    /// Push events into `ingest` until the input ends or `ingest` is closed.
    async fn subscribe(&mut self, ingest: Ingest) -> Result<(), ConnectorError>;

    /// Current read position, `None` for sources that cannot replay.
    fn get_offset(&self) -> Option<serde_json::Value> {
        None
    }

    /// Continue reading from `offset` on the next subscribe.
    fn rewind(&mut self, offset: &serde_json::Value) -> Result<(), ConnectorError> {
        Err(ConnectorError::InvalidOffset(format!(
            "source {} cannot rewind to {}",
            self.name(),
            offset
        )))
    }

    async fn close(&mut self) -> Result<(), ConnectorError> {
        Ok(())
    }
}

fn index_offset(offset: &serde_json::Value, len: usize) -> Result<usize, ConnectorError> {
    offset
        .as_u64()
        .map(|n| n as usize)
        .filter(|n| *n <= len)
        .ok_or_else(|| ConnectorError::InvalidOffset(offset.to_string()))
}

// =============================================================================
// Memory source
// =============================================================================

/// Preloaded messages released in order.
///
/// A message with a timestamp is held back until the clock reaches it, which
/// lets tests replay recorded data against a `MockClock`. The offset is the
/// index of the next message.
pub struct MemorySource {
    name: String,
    messages: Vec<SourceMessage>,
    position: usize,
    clock: SharedClock,
}

impl MemorySource {
    pub fn new(name: impl Into<String>, messages: Vec<SourceMessage>, clock: SharedClock) -> Self {
        Self {
            name: name.into(),
            messages,
            position: 0,
            clock,
        }
    }
}

#[async_trait]
impl Source for MemorySource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn subscribe(&mut self, ingest: Ingest) -> Result<(), ConnectorError> {
        while self.position < self.messages.len() {
            let mut msg = self.messages[self.position].clone();
            if let Some(ts) = msg.timestamp {
                self.clock.sleep_until(ts).await;
            }
            self.position += 1;
            msg.offset = Some(serde_json::Value::from(self.position));
            if ingest.send(SourceEvent::Message(msg)).await.is_err() {
                return Ok(());
            }
        }
        debug!("memory source {} exhausted", self.name);
        let _ = ingest.send(SourceEvent::Eof).await;
        Ok(())
    }

    fn get_offset(&self) -> Option<serde_json::Value> {
        Some(serde_json::Value::from(self.position))
    }

    fn rewind(&mut self, offset: &serde_json::Value) -> Result<(), ConnectorError> {
        self.position = index_offset(offset, self.messages.len())?;
        info!("memory source {} rewound to {}", self.name, self.position);
        Ok(())
    }
}

// =============================================================================
// File source
// =============================================================================

/// JSON lines file source.
///
/// Each non-empty line must be a JSON object. Lines that fail to parse are
/// reported as errors and skipped. The offset is the number of lines consumed.
pub struct FileSource {
    name: String,
    path: PathBuf,
    /// Field holding the event timestamp in epoch milliseconds.
    timestamp_field: Option<String>,
    line: usize,
}

impl FileSource {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            timestamp_field: None,
            line: 0,
        }
    }

    pub fn with_timestamp_field(mut self, field: impl Into<String>) -> Self {
        self.timestamp_field = Some(field.into());
        self
    }

    fn decode(&self, line: &str) -> Result<SourceMessage, String> {
        let json: serde_json::Value =
            serde_json::from_str(line).map_err(|e| format!("invalid json: {}", e))?;
        let map = match Value::from_json(json) {
            Value::Map(m) => m,
            other => return Err(format!("expect a json object but found {}", other.type_name())),
        };
        let timestamp = self
            .timestamp_field
            .as_deref()
            .and_then(|f| map.get(f))
            .and_then(|v| v.as_int());
        let mut msg = SourceMessage::new(map);
        msg.timestamp = timestamp;
        Ok(msg)
    }
}

#[async_trait]
impl Source for FileSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn provision(&mut self, config: &ConnectorConfig) -> Result<(), ConnectorError> {
        if config.connector_type == "file" && !config.url.is_empty() {
            self.path = PathBuf::from(&config.url);
        }
        if let Some(ts) = config.properties.get("timestamp") {
            self.timestamp_field = Some(ts.clone());
        }
        if !self.path.exists() {
            return Err(ConnectorError::ConfigError(format!(
                "file {} does not exist",
                self.path.display()
            )));
        }
        Ok(())
    }

    async fn subscribe(&mut self, ingest: Ingest) -> Result<(), ConnectorError> {
        let file = tokio::fs::File::open(&self.path)
            .await
            .map_err(|e| ConnectorError::ConnectionFailed(format!("{}: {}", self.path.display(), e)))?;
        let mut lines = BufReader::new(file).lines();
        let mut n = 0usize;
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => return Err(ConnectorError::ReceiveFailed(e.to_string())),
            };
            n += 1;
            if n <= self.line {
                continue;
            }
            self.line = n;
            if line.trim().is_empty() {
                continue;
            }
            let event = match self.decode(&line) {
                Ok(mut msg) => {
                    msg.offset = Some(serde_json::Value::from(n));
                    SourceEvent::Message(msg)
                }
                Err(e) => {
                    warn!("{}:{}: {}", self.path.display(), n, e);
                    SourceEvent::Error(e)
                }
            };
            if ingest.send(event).await.is_err() {
                return Ok(());
            }
        }
        let _ = ingest.send(SourceEvent::Eof).await;
        Ok(())
    }

    fn get_offset(&self) -> Option<serde_json::Value> {
        Some(serde_json::Value::from(self.line))
    }

    fn rewind(&mut self, offset: &serde_json::Value) -> Result<(), ConnectorError> {
        self.line = index_offset(offset, usize::MAX)?;
        Ok(())
    }
}
