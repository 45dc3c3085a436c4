//! Source-side preprocessing
//!
//! Runs on every tuple right after a source emits it:
//!
//! 1. Coerce declared fields to their `CREATE STREAM` types and drop
//!    undeclared ones. Schemaless streams pass through untouched.
//! 2. Evaluate aliased select expressions that can be computed per tuple, so
//!    later clauses may refer to them by alias.
//! 3. In event-time mode, take the tuple timestamp from the stream's
//!    `TIMESTAMP` field.

use super::Operation;
use crate::error::{EvalError, EvalResult};
use crate::evaluator::ValuerEval;
use crate::functions::pattern_runs;
use crate::tuple::{Data, Message, Tuple};
use crate::valuer::{MultiValuer, Valuer, FUNCTIONS};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{NaiveDateTime, TimeZone, Utc};
use rill_core::{Field, FieldType, StreamField, StreamStmt, Value, ValueMap};

pub struct Preprocessor {
    stream: StreamStmt,
    alias_fields: Vec<Field>,
    is_event_time: bool,
    timestamp_format: Option<String>,
}

impl Preprocessor {
    pub fn new(
        stream: &StreamStmt,
        alias_fields: Vec<Field>,
        is_event_time: bool,
    ) -> Result<Self, String> {
        if is_event_time && stream.options.timestamp.is_none() {
            return Err(
                "preprocessor is set to be event time but stream option TIMESTAMP not found"
                    .to_string(),
            );
        }
        Ok(Self {
            stream: stream.clone(),
            alias_fields,
            is_event_time,
            timestamp_format: stream.options.timestamp_format.as_deref().map(chrono_format),
        })
    }

    fn process(&self, mut tuple: Tuple) -> EvalResult<Tuple> {
        if !self.stream.is_schemaless() {
            let map = coerce_fields(
                &self.stream.fields,
                tuple.message.as_map(),
                self.stream.options.strict_validation,
                self.timestamp_format.as_deref(),
            )
            .map_err(|e| EvalError::msg(e).context("error in preprocessor"))?;
            tuple.message = Message::from(map);
        }

        if !self.alias_fields.is_empty() {
            let mut computed = Vec::with_capacity(self.alias_fields.len());
            {
                let valuer = MultiValuer::new(vec![&tuple as &dyn Valuer, &FUNCTIONS]);
                let eval = ValuerEval::new(&valuer);
                for f in &self.alias_fields {
                    let v = eval
                        .eval(&f.expr)
                        .map_err(|e| e.context("run Select error"))?;
                    computed.push((f.output_name().to_string(), v));
                }
            }
            for (k, v) in computed {
                tuple.message.insert(k, v);
            }
        }

        if self.is_event_time {
            tuple.timestamp = self.event_time(&tuple)?;
        }
        Ok(tuple)
    }

    fn event_time(&self, tuple: &Tuple) -> EvalResult<i64> {
        let field = self.stream.options.timestamp.as_deref().unwrap_or_default();
        let v = tuple.message.value(field).ok_or_else(|| {
            EvalError::msg(format!("cannot find timestamp field {} in tuple", field))
        })?;
        match v {
            Value::Int(ms) => Ok(*ms),
            Value::Float(ms) => Ok(*ms as i64),
            Value::Time(t) => Ok(t.timestamp_millis()),
            Value::Str(s) => parse_time(s, self.timestamp_format.as_deref())
                .map(|t| t.timestamp_millis())
                .ok_or_else(|| {
                    EvalError::msg(format!(
                        "cannot convert timestamp field {} to timestamp with value {}",
                        field, s
                    ))
                }),
            other => Err(EvalError::msg(format!(
                "cannot convert timestamp field {} to timestamp with value {}",
                field,
                other.describe()
            ))),
        }
    }
}

impl Operation for Preprocessor {
    fn name(&self) -> &'static str {
        "preprocessor"
    }

    fn apply(&self, data: Data) -> EvalResult<Option<Data>> {
        match data {
            Data::Tuple(t) => self.process(t).map(|t| Some(Data::Tuple(t))),
            other => Err(EvalError::msg(format!(
                "error in preprocessor: unsupported input {}",
                other.kind()
            ))),
        }
    }
}

// ============================================================================
// Type coercion
// ============================================================================

fn coerce_fields(
    fields: &[StreamField],
    input: &ValueMap,
    strict: bool,
    format: Option<&str>,
) -> Result<ValueMap, String> {
    let mut out = ValueMap::with_capacity(fields.len());
    for f in fields {
        let found = input.get(&f.name).or_else(|| {
            input
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(&f.name))
                .map(|(_, v)| v)
        });
        match found {
            Some(v) => {
                out.insert(f.name.clone(), coerce(&f.name, &f.field_type, v, format)?);
            }
            None if strict => return Err(format!("field {} is not found", f.name)),
            None => {}
        }
    }
    Ok(out)
}

fn mismatch(name: &str, expect: &str, v: &Value) -> String {
    format!(
        "invalid data type for {}, expect {} but found {}",
        name,
        expect,
        v.describe()
    )
}

fn coerce(name: &str, ty: &FieldType, v: &Value, format: Option<&str>) -> Result<Value, String> {
    if v.is_null() {
        return Ok(Value::Null);
    }
    match ty {
        FieldType::Bigint => match v {
            Value::Int(n) => Ok(Value::Int(*n)),
            Value::Float(f) => Ok(Value::Int(*f as i64)),
            Value::Str(s) => s
                .trim()
                .parse::<i64>()
                .map(Value::Int)
                .map_err(|_| mismatch(name, "bigint", v)),
            _ => Err(mismatch(name, "bigint", v)),
        },
        FieldType::Float => match v {
            Value::Float(f) => Ok(Value::Float(*f)),
            Value::Int(n) => Ok(Value::Float(*n as f64)),
            Value::Str(s) => s
                .trim()
                .parse::<f64>()
                .map(Value::Float)
                .map_err(|_| mismatch(name, "float", v)),
            _ => Err(mismatch(name, "float", v)),
        },
        FieldType::String => match v {
            Value::Str(s) => Ok(Value::Str(s.clone())),
            _ => Err(mismatch(name, "string", v)),
        },
        FieldType::Boolean => match v {
            Value::Bool(b) => Ok(Value::Bool(*b)),
            Value::Str(s) => parse_bool(s)
                .map(Value::Bool)
                .ok_or_else(|| mismatch(name, "boolean", v)),
            _ => Err(mismatch(name, "boolean", v)),
        },
        FieldType::Datetime => match v {
            Value::Time(t) => Ok(Value::Time(*t)),
            Value::Int(_) | Value::Float(_) => v
                .to_time()
                .map(Value::Time)
                .ok_or_else(|| mismatch(name, "datetime", v)),
            Value::Str(s) => parse_time(s, format)
                .map(Value::Time)
                .ok_or_else(|| mismatch(name, "datetime", v)),
            _ => Err(mismatch(name, "datetime", v)),
        },
        FieldType::Bytea => match v {
            Value::Str(s) if STANDARD.decode(s).is_ok() => Ok(Value::Str(s.clone())),
            _ => Err(mismatch(name, "bytea", v)),
        },
        FieldType::Array(elem) => {
            let items = match v {
                Value::Array(items) => items.clone(),
                Value::Str(s) => match from_json_str(s) {
                    Some(Value::Array(items)) => items,
                    _ => return Err(mismatch(name, "array", v)),
                },
                _ => return Err(mismatch(name, "array", v)),
            };
            items
                .iter()
                .map(|item| coerce(name, elem, item, format))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array)
        }
        FieldType::Struct(fields) => {
            let map = match v {
                Value::Map(m) => m.clone(),
                Value::Str(s) => match from_json_str(s) {
                    Some(Value::Map(m)) => m,
                    _ => return Err(mismatch(name, "struct", v)),
                },
                _ => return Err(mismatch(name, "struct", v)),
            };
            coerce_fields(fields, &map, false, format).map(Value::Map)
        }
    }
}

fn from_json_str(s: &str) -> Option<Value> {
    serde_json::from_str::<serde_json::Value>(s)
        .ok()
        .map(Value::from_json)
}

fn parse_bool(s: &str) -> Option<bool> {
    match s {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}

fn parse_time(s: &str, format: Option<&str>) -> Option<chrono::DateTime<Utc>> {
    match format {
        Some(fmt) => NaiveDateTime::parse_from_str(s, fmt)
            .ok()
            .and_then(|t| Utc.from_local_datetime(&t).single()),
        None => Value::Str(s.to_string()).to_time(),
    }
}

/// Translate a `yyyy-MM-dd HH:mm:ss` style pattern to chrono syntax.
pub(crate) fn chrono_format(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() + 8);
    for (c, n) in pattern_runs(pattern) {
        let token = match (c, n) {
            ('y', 4) => Some("%Y"),
            ('y', 2) => Some("%y"),
            ('M', 2) => Some("%m"),
            ('d', 2) => Some("%d"),
            ('H', 2) => Some("%H"),
            ('m', 2) => Some("%M"),
            ('s', 2) => Some("%S"),
            ('S', 3) => Some("%3f"),
            _ => None,
        };
        match token {
            Some(t) => out.push_str(t),
            None => {
                for _ in 0..n {
                    if c == '%' {
                        out.push_str("%%");
                    } else {
                        out.push(c);
                    }
                }
            }
        }
    }
    out
}
