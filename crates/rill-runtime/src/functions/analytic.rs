//! Analytic functions
//!
//! `lag`, `latest`, `changed_col` and `had_changed` look back at earlier
//! records. Every call site has its own slot, named by a key that the
//! planner appends as the last argument. The operator that evaluates the
//! calls owns an [`AnalyticFunctions`] and checkpoints its slots.

use crate::valuer::{CallValuer, Valuer};
use rill_core::validate::builtins::is_analytic_function;
use rill_core::Value;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, PoisonError};

/// Remembered state of one call site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Slot {
    /// Last value seen by `latest`, `changed_col` or one `had_changed` column.
    Value { value: Value },
    /// Pending values of `lag`, oldest first, at most `size` long.
    Lag { size: usize, items: VecDeque<Value> },
}

#[derive(Debug, Default)]
pub struct AnalyticFunctions {
    slots: Mutex<BTreeMap<String, Slot>>,
}

impl AnalyticFunctions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every slot, `None` before the first call.
    pub fn snapshot(&self) -> Option<BTreeMap<String, Slot>> {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        (!slots.is_empty()).then(|| slots.clone())
    }

    pub fn restore(&self, state: BTreeMap<String, Slot>) {
        *self.slots.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn eval(&self, name: &str, args: &[Value]) -> Result<Value, String> {
        let (key, args) = match args.split_last() {
            Some((Value::Str(key), rest)) => (key.as_str(), rest),
            _ => return Err(format!("{} is called without a state key", name)),
        };
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        match name {
            "lag" => lag(&mut slots, key, args),
            "latest" => latest(&mut slots, key, args),
            "changed_col" => changed_col(&mut slots, key, args),
            "had_changed" => had_changed(&mut slots, key, args),
            _ => Err(format!("unknown function {}", name)),
        }
    }
}

impl Valuer for AnalyticFunctions {
    fn value(&self, _key: &str, _table: Option<&str>) -> Option<Value> {
        None
    }

    fn as_call(&self) -> Option<&dyn CallValuer> {
        Some(self)
    }
}

impl CallValuer for AnalyticFunctions {
    fn call(&self, name: &str, args: &[Value]) -> Option<Result<Value, String>> {
        if !is_analytic_function(name) {
            return None;
        }
        Some(self.eval(&name.to_ascii_lowercase(), args))
    }
}

type Slots = BTreeMap<String, Slot>;

fn stored<'a>(slots: &'a Slots, key: &str) -> Option<&'a Value> {
    match slots.get(key) {
        Some(Slot::Value { value }) => Some(value),
        _ => None,
    }
}

fn store(slots: &mut Slots, key: &str, value: Value) {
    slots.insert(key.to_string(), Slot::Value { value });
}

fn ignore_null(v: Option<&Value>) -> Result<bool, String> {
    match v {
        Some(Value::Bool(b)) => Ok(*b),
        Some(other) => Err(format!("first arg is not a bool but got {}", other.describe())),
        None => Err("first arg is not a bool but got <nil>".to_string()),
    }
}

/// `lag(v[, offset[, default]])`: the value `offset` calls back, `default`
/// until that many calls have been made.
fn lag(slots: &mut Slots, key: &str, args: &[Value]) -> Result<Value, String> {
    if !(1..=3).contains(&args.len()) {
        return Err(format!("expect one two or three args but got {}", args.len()));
    }
    if !slots.contains_key(key) {
        let size = match args.get(1) {
            None => 1,
            Some(Value::Int(n)) if *n >= 0 => *n as usize,
            Some(other) => {
                return Err(format!(
                    "error converting second arg {} to int",
                    other.describe()
                ))
            }
        };
        let default = args.get(2).cloned().unwrap_or(Value::Null);
        let items = std::iter::repeat(default).take(size).collect();
        slots.insert(key.to_string(), Slot::Lag { size, items });
    }
    match slots.get_mut(key) {
        Some(Slot::Lag { size, items }) => {
            let out = items.pop_front().unwrap_or(Value::Null);
            if items.len() < *size {
                items.push_back(args[0].clone());
            }
            Ok(out)
        }
        _ => Err(format!("state {} does not hold a lag queue", key)),
    }
}

/// `latest(v[, default])`: `v`, or the last non-null `v` when it is null.
fn latest(slots: &mut Slots, key: &str, args: &[Value]) -> Result<Value, String> {
    if !(1..=2).contains(&args.len()) {
        return Err(format!("expect one or two args but got {}", args.len()));
    }
    match &args[0] {
        Value::Null => Ok(stored(slots, key)
            .or(args.get(1))
            .cloned()
            .unwrap_or(Value::Null)),
        v => {
            store(slots, key, v.clone());
            Ok(v.clone())
        }
    }
}

/// `changed_col(ignore_null, v)`: `v` when it differs from the last call,
/// null otherwise.
fn changed_col(slots: &mut Slots, key: &str, args: &[Value]) -> Result<Value, String> {
    let ignore = ignore_null(args.first())?;
    let v = args.get(1).cloned().unwrap_or(Value::Null);
    if ignore && v.is_null() {
        return Ok(Value::Null);
    }
    let last = stored(slots, key).cloned().unwrap_or(Value::Null);
    if v == last {
        return Ok(Value::Null);
    }
    store(slots, key, v.clone());
    Ok(v)
}

/// `had_changed(ignore_null, v1, v2, ...)`: true when any value differs from
/// the last call. Each position is tracked on its own.
fn had_changed(slots: &mut Slots, key: &str, args: &[Value]) -> Result<Value, String> {
    if args.len() <= 1 {
        return Err(format!("expect more than one arg but got {}", args.len()));
    }
    let ignore = ignore_null(args.first())?;
    let mut changed = false;
    for (i, v) in args.iter().enumerate().skip(1) {
        if ignore && v.is_null() {
            continue;
        }
        let k = format!("{}{}", key, i);
        if stored(slots, &k).unwrap_or(&Value::Null) != v {
            store(slots, &k, v.clone());
            changed = true;
        }
    }
    Ok(Value::Bool(changed))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(f: &AnalyticFunctions, name: &str, mut args: Vec<Value>, key: &str) -> Value {
        args.push(Value::from(key));
        f.call(name, &args).unwrap().unwrap()
    }

    #[test]
    fn test_lag_defaults_then_trails() {
        let f = AnalyticFunctions::new();
        let seen: Vec<_> = [1, 2, 3]
            .into_iter()
            .map(|n| run(&f, "lag", vec![Value::Int(n)], "lag_0"))
            .collect();
        assert_eq!(seen, vec![Value::Null, Value::Int(1), Value::Int(2)]);

        let seen: Vec<_> = [1, 2, 3, 4]
            .into_iter()
            .map(|n| {
                run(
                    &f,
                    "lag",
                    vec![Value::Int(n), Value::Int(2), Value::Int(0)],
                    "lag_1",
                )
            })
            .collect();
        assert_eq!(
            seen,
            vec![Value::Int(0), Value::Int(0), Value::Int(1), Value::Int(2)]
        );
    }

    #[test]
    fn test_lag_zero_offset_is_always_null() {
        let f = AnalyticFunctions::new();
        for n in 0..3 {
            assert_eq!(
                run(&f, "lag", vec![Value::Int(n), Value::Int(0)], "lag_0"),
                Value::Null
            );
        }
    }

    #[test]
    fn test_latest_fills_nulls() {
        let f = AnalyticFunctions::new();
        let call = |v: Value| run(&f, "latest", vec![v, Value::from("none")], "latest_0");
        assert_eq!(call(Value::Null), Value::from("none"));
        assert_eq!(call(Value::from("red")), Value::from("red"));
        assert_eq!(call(Value::Null), Value::from("red"));
    }

    #[test]
    fn test_changed_col() {
        let f = AnalyticFunctions::new();
        let call = |ignore: bool, v: Value| {
            run(&f, "changed_col", vec![Value::Bool(ignore), v], "changed_col_0")
        };
        assert_eq!(call(true, Value::Int(1)), Value::Int(1));
        assert_eq!(call(true, Value::Int(1)), Value::Null);
        assert_eq!(call(true, Value::Null), Value::Null);
        assert_eq!(call(true, Value::Int(1)), Value::Null);
        // Null is a change when nulls count.
        assert_eq!(call(false, Value::Null), Value::Null);
        assert_eq!(call(false, Value::Int(1)), Value::Int(1));
    }

    #[test]
    fn test_had_changed_tracks_each_column() {
        let f = AnalyticFunctions::new();
        let call = |a: Value, b: Value| {
            run(&f, "had_changed", vec![Value::Bool(true), a, b], "had_changed_0")
        };
        assert_eq!(call(Value::Int(1), Value::from("x")), Value::Bool(true));
        assert_eq!(call(Value::Int(1), Value::from("x")), Value::Bool(false));
        assert_eq!(call(Value::Null, Value::from("x")), Value::Bool(false));
        assert_eq!(call(Value::Int(1), Value::from("y")), Value::Bool(true));
    }

    #[test]
    fn test_call_sites_do_not_share_state() {
        let f = AnalyticFunctions::new();
        run(&f, "latest", vec![Value::Int(1)], "latest_0");
        assert_eq!(run(&f, "latest", vec![Value::Null], "latest_1"), Value::Null);
    }

    #[test]
    fn test_snapshot_restores_into_fresh_instance() {
        let f = AnalyticFunctions::new();
        assert!(f.snapshot().is_none());
        run(&f, "lag", vec![Value::Int(7)], "lag_0");
        run(&f, "latest", vec![Value::from("red")], "latest_1");

        let json = serde_json::to_value(f.snapshot().unwrap()).unwrap();
        let restored = AnalyticFunctions::new();
        restored.restore(serde_json::from_value(json).unwrap());
        assert_eq!(run(&restored, "lag", vec![Value::Int(8)], "lag_0"), Value::Int(7));
        assert_eq!(
            run(&restored, "latest", vec![Value::Null], "latest_1"),
            Value::from("red")
        );
    }

    #[test]
    fn test_missing_key_and_other_names() {
        let f = AnalyticFunctions::new();
        assert_eq!(f.call("lower", &[]), None);
        let err = f.call("latest", &[Value::Int(1)]).unwrap().unwrap_err();
        assert_eq!(err, "latest is called without a state key");
        let err = f
            .call("changed_col", &[Value::Int(1), Value::Int(1), Value::from("k")])
            .unwrap()
            .unwrap_err();
        assert_eq!(err, "first arg is not a bool but got int64(1)");
    }
}
