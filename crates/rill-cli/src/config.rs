//! Rule file support for the rill CLI
//!
//! A rule file bundles everything `rill run` needs: the stream definitions,
//! the rule itself and one JSON lines input file per stream. Both YAML and
//! TOML are accepted.
//!
//! # Example YAML rule file:
//! ```yaml
//! streams:
//!   - CREATE STREAM demo (color STRING, size BIGINT, ts BIGINT) WITH (DATASOURCE="demo", FORMAT="json", TIMESTAMP="ts")
//!
//! rule:
//!   id: rule1
//!   sql: SELECT color, count(*) FROM demo GROUP BY color, TUMBLINGWINDOW(ss, 10)
//!   options:
//!     qos: 1
//!     checkpointInterval: 5s
//!
//! # Relative paths resolve against the rule file's directory
//! inputs:
//!   demo: data/demo.jsonl
//!
//! # Results go to stdout when no output file is set
//! output: results.jsonl
//! state_dir: state
//!
//! logging:
//!   level: debug
//! ```

use rill_core::StreamStmt;
use rill_runtime::RuleDef;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Contents of a rule file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleFile {
    /// `CREATE STREAM` statements
    #[serde(default)]
    pub streams: Vec<String>,

    pub rule: RuleDef,

    /// Input file per stream name
    #[serde(default)]
    pub inputs: BTreeMap<String, PathBuf>,

    /// Output file, stdout when unset
    #[serde(default)]
    pub output: Option<PathBuf>,

    /// Directory of the checkpoint store, in memory when unset
    #[serde(default)]
    pub state_dir: Option<PathBuf>,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl RuleFile {
    /// Load a rule file (YAML or TOML, auto-detected by extension).
    ///
    /// Relative paths in the file are resolved against its directory.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e.to_string()))?;

        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();

        let mut file = match extension.as_str() {
            "yaml" | "yml" => Self::from_yaml(&content),
            "toml" => Self::from_toml(&content),
            _ => {
                // Try YAML first, then TOML
                Self::from_yaml(&content).or_else(|_| Self::from_toml(&content))
            }
        }?;
        if let Some(dir) = path.parent() {
            file.resolve_paths(dir);
        }
        Ok(file)
    }

    /// Parse a rule file from YAML string
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Parse a rule file from TOML string
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    fn resolve_paths(&mut self, dir: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = dir.join(&*p);
            }
        };
        self.inputs.values_mut().for_each(resolve);
        self.output.iter_mut().for_each(resolve);
        self.state_dir.iter_mut().for_each(resolve);
    }

    /// Parse every stream definition.
    pub fn stream_defs(&self) -> Result<Vec<StreamStmt>, ConfigError> {
        self.streams
            .iter()
            .map(|sql| {
                rill_parser::parse_stream(sql)
                    .map_err(|e| ConfigError::InvalidStream(sql.clone(), e.to_string()))
            })
            .collect()
    }

    /// Input file of `stream`, matched case-insensitively.
    pub fn input(&self, stream: &str) -> Option<&Path> {
        self.inputs
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(stream))
            .map(|(_, p)| p.as_path())
    }

    /// Create an example rule file
    pub fn example() -> Self {
        Self {
            streams: vec![r#"CREATE STREAM demo (color STRING, size BIGINT, ts BIGINT) WITH (DATASOURCE="demo", FORMAT="json", TIMESTAMP="ts")"#.to_string()],
            rule: RuleDef::new(
                "rule1",
                "SELECT color, count(*) AS c FROM demo GROUP BY color, TUMBLINGWINDOW(ss, 10)",
            ),
            inputs: BTreeMap::from([("demo".to_string(), PathBuf::from("data/demo.jsonl"))]),
            output: None,
            state_dir: None,
            logging: LoggingConfig::default(),
        }
    }

    /// Generate example YAML rule file
    pub fn example_yaml() -> String {
        serde_yaml::to_string(&Self::example()).unwrap_or_default()
    }

    /// Generate example TOML rule file
    pub fn example_toml() -> String {
        toml::to_string_pretty(&Self::example()).unwrap_or_default()
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read rule file {0}: {1}")]
    IoError(PathBuf, String),

    #[error("Failed to parse rule file: {0}")]
    ParseError(String),

    #[error("Invalid stream definition {0}: {1}")]
    InvalidStream(String, String),
}
