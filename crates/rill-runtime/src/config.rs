//! Rule definitions and options
//!
//! Options use the camelCase names of rule JSON/YAML documents:
//!
//! ```yaml
//! id: rule1
//! sql: SELECT * FROM demo GROUP BY TUMBLINGWINDOW(ss, 10)
//! options:
//!   qos: 1
//!   checkpointInterval: 5s
//!   isEventTime: true
//!   lateTol: 1000
//! ```
//!
//! Durations accept integer milliseconds or a string with a `ms`, `s`, `m`
//! or `h` suffix.

use serde::{Deserialize, Deserializer, Serialize};

/// Delivery guarantee of a rule
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum Qos {
    /// No checkpointing.
    #[default]
    AtMostOnce,
    /// Checkpoint and replay sources from the last complete checkpoint.
    AtLeastOnce,
    /// As `AtLeastOnce`, with barrier alignment on multi-input operators.
    ExactlyOnce,
}

impl Qos {
    pub fn from_level(level: u64) -> Option<Self> {
        match level {
            0 => Some(Qos::AtMostOnce),
            1 => Some(Qos::AtLeastOnce),
            2 => Some(Qos::ExactlyOnce),
            _ => None,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        let normalized: String = name
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        match normalized.as_str() {
            "atmostonce" => Some(Qos::AtMostOnce),
            "atleastonce" => Some(Qos::AtLeastOnce),
            "exactlyonce" => Some(Qos::ExactlyOnce),
            _ => None,
        }
    }

    pub fn checkpointing(&self) -> bool {
        *self > Qos::AtMostOnce
    }
}

impl<'de> Deserialize<'de> for Qos {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Level(u64),
            Name(String),
        }
        match Repr::deserialize(deserializer)? {
            Repr::Level(n) => Qos::from_level(n)
                .ok_or_else(|| serde::de::Error::custom(format!("invalid qos level {}", n))),
            Repr::Name(s) => Qos::from_name(&s)
                .ok_or_else(|| serde::de::Error::custom(format!("invalid qos {}", s))),
        }
    }
}

/// Planner switches
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PlanOptimizeStrategy {
    /// Request the incremental window engine. Recorded only; rules run on
    /// the buffered window engine.
    pub enable_incremental_window: bool,
}

/// Options of one rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RuleOption {
    /// Capacity of every channel between nodes
    pub buffer_length: usize,
    /// Deliver evaluation errors to the sinks instead of dropping them
    pub send_error: bool,
    pub qos: Qos,
    /// Milliseconds between checkpoints
    #[serde(deserialize_with = "duration_ms")]
    pub checkpoint_interval: i64,
    pub is_event_time: bool,
    /// Watermark lateness tolerance in milliseconds
    #[serde(deserialize_with = "duration_ms")]
    pub late_tol: i64,
    pub enable_save_state_before_stop: bool,
    pub plan_optimize_strategy: PlanOptimizeStrategy,
}

impl Default for RuleOption {
    fn default() -> Self {
        Self {
            buffer_length: 1024,
            send_error: true,
            qos: Qos::AtMostOnce,
            checkpoint_interval: 300_000,
            is_event_time: false,
            late_tol: 1000,
            enable_save_state_before_stop: false,
            plan_optimize_strategy: PlanOptimizeStrategy::default(),
        }
    }
}

/// A rule: an id, one SELECT statement and its options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleDef {
    pub id: String,
    pub sql: String,
    #[serde(default)]
    pub options: RuleOption,
}

impl RuleDef {
    pub fn new(id: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            sql: sql.into(),
            options: RuleOption::default(),
        }
    }

    pub fn with_options(mut self, options: RuleOption) -> Self {
        self.options = options;
        self
    }
}

/// Parse `1500`, `"1500ms"`, `"5s"`, `"2m"` or `"1h"` to milliseconds.
pub fn parse_duration_ms(s: &str) -> Option<i64> {
    let s = s.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    let (num, unit) = s.split_at(split);
    let n: i64 = num.parse().ok()?;
    let factor = match unit.trim() {
        "" | "ms" => 1,
        "s" => 1000,
        "m" => 60_000,
        "h" => 3_600_000,
        _ => return None,
    };
    n.checked_mul(factor)
}

fn duration_ms<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Millis(i64),
        Text(String),
    }
    match Repr::deserialize(deserializer)? {
        Repr::Millis(n) => Ok(n),
        Repr::Text(s) => parse_duration_ms(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid duration {}", s))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opt: RuleOption = serde_json::from_str("{}").unwrap();
        assert_eq!(opt, RuleOption::default());
        assert_eq!(opt.buffer_length, 1024);
        assert!(opt.send_error);
        assert_eq!(opt.checkpoint_interval, 300_000);
        assert!(!opt.qos.checkpointing());
    }

    #[test]
    fn test_camel_case_and_qos_forms() {
        let opt: RuleOption = serde_json::from_str(
            r#"{"qos": 1, "isEventTime": true, "lateTol": "2s", "checkpointInterval": 500,
                "planOptimizeStrategy": {"enableIncrementalWindow": true}}"#,
        )
        .unwrap();
        assert_eq!(opt.qos, Qos::AtLeastOnce);
        assert!(opt.is_event_time);
        assert_eq!(opt.late_tol, 2000);
        assert_eq!(opt.checkpoint_interval, 500);
        assert!(opt.plan_optimize_strategy.enable_incremental_window);

        let named: RuleOption = serde_json::from_str(r#"{"qos": "ExactlyOnce"}"#).unwrap();
        assert_eq!(named.qos, Qos::ExactlyOnce);
        assert!(serde_json::from_str::<RuleOption>(r#"{"qos": 3}"#).is_err());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration_ms("1500"), Some(1500));
        assert_eq!(parse_duration_ms("5m"), Some(300_000));
        assert_eq!(parse_duration_ms("1h"), Some(3_600_000));
        assert_eq!(parse_duration_ms("fast"), None);
        assert_eq!(parse_duration_ms("3d"), None);
    }

    #[test]
    fn test_rule_def() {
        let rule: RuleDef =
            serde_json::from_str(r#"{"id": "r1", "sql": "SELECT * FROM demo"}"#).unwrap();
        assert_eq!(rule.options, RuleOption::default());
    }
}
