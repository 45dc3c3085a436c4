//! Aggregate functions over a group.
//!
//! Every argument of an aggregate call arrives as one array holding the
//! argument evaluated against each member of the group, in order. Null
//! members are skipped by every function except `collect`.
//!
//! # Available Aggregations
//!
//! | Function        | Empty group         | All-null group |
//! |-----------------|---------------------|----------------|
//! | [`Count`]       | `0`                 | `0`            |
//! | [`Sum`]         | `0`                 | `null`         |
//! | [`Avg`]         | `0`                 | `null`         |
//! | [`Max`]/[`Min`] | error `empty data`  | `null`         |
//! | [`Collect`]     | `[]`                | array of nulls |
//! | [`Deduplicate`] | `[]` / `null`       | per `all` flag |
//!
//! The element type of a group is taken from its first non-null member.
//! Integer groups aggregate exactly (`avg` uses integer division); float
//! groups also accept integer members.

use rill_core::Value;
use std::cmp::Ordering;
use std::collections::HashSet;

pub type AggResult = Result<Value, String>;

/// An aggregate function.
pub trait AggregateFunc: Send + Sync {
    /// Returns the name of this aggregation function (e.g., "sum", "avg").
    fn name(&self) -> &str;

    /// Apply the aggregation to per-argument value arrays.
    fn apply(&self, args: &[Vec<Value>]) -> AggResult;
}

static REGISTRY: &[&dyn AggregateFunc] = &[
    &Avg,
    &Count,
    &Max,
    &Min,
    &Sum,
    &Collect,
    &Deduplicate,
];

/// Find an aggregate by its lower-case name.
pub fn lookup(name: &str) -> Option<&'static dyn AggregateFunc> {
    REGISTRY.iter().copied().find(|f| f.name() == name)
}

/// Dispatch an aggregate call whose arguments are arrays. `None` when
/// `name` is not an aggregate.
pub fn call(name: &str, args: &[Value]) -> Option<AggResult> {
    let func = lookup(name)?;
    let arrays = args
        .iter()
        .map(|a| match a {
            Value::Array(items) => items.clone(),
            other => vec![other.clone()],
        })
        .collect::<Vec<_>>();
    Some(func.apply(&arrays))
}

fn first_arg(args: &[Vec<Value>]) -> &[Value] {
    args.first().map(Vec::as_slice).unwrap_or(&[])
}

fn first_valid(values: &[Value]) -> Option<&Value> {
    values.iter().find(|v| !v.is_null())
}

fn non_null_count(values: &[Value]) -> i64 {
    values.iter().filter(|v| !v.is_null()).count() as i64
}

fn int_total(values: &[Value]) -> Result<i64, String> {
    values.iter().try_fold(0i64, |acc, v| match v {
        Value::Int(n) => Ok(acc.wrapping_add(*n)),
        Value::Null => Ok(acc),
        other => Err(format!("requires int but found {}", other.describe())),
    })
}

fn float_total(values: &[Value]) -> Result<f64, String> {
    values.iter().try_fold(0f64, |acc, v| match v {
        Value::Float(f) => Ok(acc + f),
        Value::Int(n) => Ok(acc + *n as f64),
        Value::Null => Ok(acc),
        other => Err(format!("requires float64 but found {}", other.describe())),
    })
}

/// Keep the non-null member that orders `want` against every other one.
fn extreme(values: &[Value], first: &Value, want: Ordering) -> Result<Value, String> {
    let mut best = first.clone();
    for v in values.iter().filter(|v| !v.is_null()) {
        let ord = match (v, &best) {
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Float(_) | Value::Int(_), Value::Float(b)) => {
                let a = v.as_float().unwrap_or(f64::NAN);
                a.partial_cmp(b).unwrap_or(Ordering::Equal)
            }
            (Value::Str(a), Value::Str(b)) => a.cmp(b),
            (other, Value::Int(_)) => {
                return Err(format!("requires int but found {}", other.describe()))
            }
            (other, Value::Float(_)) => {
                return Err(format!("requires float64 but found {}", other.describe()))
            }
            (other, _) => {
                return Err(format!("requires string but found {}", other.describe()))
            }
        };
        if ord == want {
            best = match (v, &best) {
                (Value::Int(n), Value::Float(_)) => Value::Float(*n as f64),
                _ => v.clone(),
            };
        }
    }
    Ok(best)
}

// ============================================================================
// Functions
// ============================================================================

/// Count of non-null members
pub struct Count;

impl AggregateFunc for Count {
    fn name(&self) -> &str {
        "count"
    }

    fn apply(&self, args: &[Vec<Value>]) -> AggResult {
        Ok(Value::Int(non_null_count(first_arg(args))))
    }
}

/// Sum of non-null members
pub struct Sum;

impl AggregateFunc for Sum {
    fn name(&self) -> &str {
        "sum"
    }

    fn apply(&self, args: &[Vec<Value>]) -> AggResult {
        let values = first_arg(args);
        if values.is_empty() {
            return Ok(Value::Int(0));
        }
        match first_valid(values) {
            Some(Value::Int(_)) => int_total(values).map(Value::Int),
            Some(Value::Float(_)) => float_total(values).map(Value::Float),
            None => Ok(Value::Null),
            Some(other) => Err(format!(
                "run sum function error: found invalid arg {}",
                other.describe()
            )),
        }
    }
}

/// Mean of non-null members
pub struct Avg;

impl AggregateFunc for Avg {
    fn name(&self) -> &str {
        "avg"
    }

    fn apply(&self, args: &[Vec<Value>]) -> AggResult {
        let values = first_arg(args);
        if values.is_empty() {
            return Ok(Value::Int(0));
        }
        let count = non_null_count(values);
        match first_valid(values) {
            Some(Value::Int(_)) => int_total(values).map(|t| Value::Int(t / count)),
            Some(Value::Float(_)) => float_total(values).map(|t| Value::Float(t / count as f64)),
            None => Ok(Value::Null),
            Some(other) => Err(format!(
                "run avg function error: found invalid arg {}",
                other.describe()
            )),
        }
    }
}

/// Largest member
pub struct Max;

impl AggregateFunc for Max {
    fn name(&self) -> &str {
        "max"
    }

    fn apply(&self, args: &[Vec<Value>]) -> AggResult {
        extreme_of("max", first_arg(args), Ordering::Greater)
    }
}

/// Smallest member
pub struct Min;

impl AggregateFunc for Min {
    fn name(&self) -> &str {
        "min"
    }

    fn apply(&self, args: &[Vec<Value>]) -> AggResult {
        extreme_of("min", first_arg(args), Ordering::Less)
    }
}

fn extreme_of(name: &str, values: &[Value], want: Ordering) -> AggResult {
    if values.is_empty() {
        return Err(format!("run {} function error: empty data", name));
    }
    match first_valid(values) {
        None => Ok(Value::Null),
        Some(first @ (Value::Int(_) | Value::Float(_) | Value::Str(_))) => {
            extreme(values, first, want)
        }
        Some(other) => Err(format!(
            "run {} function error: found invalid arg {}",
            name,
            other.describe()
        )),
    }
}

/// All members, nulls included
pub struct Collect;

impl AggregateFunc for Collect {
    fn name(&self) -> &str {
        "collect"
    }

    fn apply(&self, args: &[Vec<Value>]) -> AggResult {
        Ok(Value::Array(first_arg(args).to_vec()))
    }
}

/// `deduplicate(col, all)`
///
/// With `all` the distinct values in first-seen order. Without it the last
/// member if its value was not seen before, otherwise null.
pub struct Deduplicate;

impl AggregateFunc for Deduplicate {
    fn name(&self) -> &str {
        "deduplicate"
    }

    fn apply(&self, args: &[Vec<Value>]) -> AggResult {
        const INVALID: &str = "Invalid argument type found.";
        let (values, flags) = match args {
            [values, flags, ..] => (values, flags),
            _ => return Err(INVALID.to_string()),
        };
        let all = match first_valid(flags) {
            Some(Value::Bool(b)) => *b,
            _ => return Err(INVALID.to_string()),
        };

        let mut seen = HashSet::new();
        let mut result = Vec::new();
        let last = values.len().saturating_sub(1);
        for (i, v) in values.iter().enumerate() {
            if seen.insert(v.to_string()) && (all || i == last) {
                result.push(v.clone());
            }
        }
        if all {
            Ok(Value::Array(result))
        } else {
            Ok(result.into_iter().next().unwrap_or(Value::Null))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arr(values: Vec<Value>) -> Value {
        Value::Array(values)
    }

    #[test]
    fn test_count_skips_nulls() {
        let r = call("count", &[arr(vec![1.into(), Value::Null, 3.into()])]);
        assert_eq!(r, Some(Ok(Value::Int(2))));
    }

    #[test]
    fn test_sum_and_avg_empty_versus_all_null() {
        assert_eq!(call("sum", &[arr(vec![])]), Some(Ok(Value::Int(0))));
        assert_eq!(call("avg", &[arr(vec![])]), Some(Ok(Value::Int(0))));
        assert_eq!(call("sum", &[arr(vec![Value::Null])]), Some(Ok(Value::Null)));
        assert_eq!(call("avg", &[arr(vec![Value::Null])]), Some(Ok(Value::Null)));
    }

    #[test]
    fn test_avg_is_sum_over_count() {
        let ints = arr(vec![3.into(), Value::Null, 6.into(), 2.into()]);
        assert_eq!(call("avg", &[ints.clone()]), Some(Ok(Value::Int(3))));
        assert_eq!(call("sum", &[ints]), Some(Ok(Value::Int(11))));

        let floats = arr(vec![1.5.into(), 2.into()]);
        assert_eq!(call("avg", &[floats]), Some(Ok(Value::Float(1.75))));
    }

    #[test]
    fn test_type_errors_carry_value() {
        let mixed = arr(vec![1.into(), 2.5.into()]);
        assert_eq!(
            call("sum", &[mixed]),
            Some(Err("requires int but found float64(2.5)".to_string()))
        );
        let bad = arr(vec![Value::Bool(true)]);
        assert_eq!(
            call("avg", &[bad]),
            Some(Err("run avg function error: found invalid arg bool(true)".to_string()))
        );
    }

    #[test]
    fn test_max_min() {
        let v = arr(vec![3.into(), 6.into(), Value::Null, 2.into()]);
        assert_eq!(call("max", &[v.clone()]), Some(Ok(Value::Int(6))));
        assert_eq!(call("min", &[v]), Some(Ok(Value::Int(2))));

        let s = arr(vec!["blue".into(), "red".into()]);
        assert_eq!(call("max", &[s]), Some(Ok("red".into())));

        assert_eq!(
            call("max", &[arr(vec![])]),
            Some(Err("run max function error: empty data".to_string()))
        );
        assert_eq!(call("min", &[arr(vec![Value::Null])]), Some(Ok(Value::Null)));
    }

    #[test]
    fn test_collect_and_deduplicate() {
        let v = arr(vec![1.into(), 2.into(), 1.into()]);
        assert_eq!(call("collect", &[v.clone()]), Some(Ok(v.clone())));

        let all = arr(vec![true.into(), true.into(), true.into()]);
        assert_eq!(
            call("deduplicate", &[v.clone(), all]),
            Some(Ok(arr(vec![1.into(), 2.into()])))
        );

        let last_only = arr(vec![false.into(); 3]);
        assert_eq!(call("deduplicate", &[v, last_only.clone()]), Some(Ok(Value::Null)));
        let fresh = arr(vec![1.into(), 2.into(), 3.into()]);
        assert_eq!(call("deduplicate", &[fresh, last_only]), Some(Ok(Value::Int(3))));

        assert_eq!(
            call("deduplicate", &[arr(vec![1.into()]), arr(vec![1.into()])]),
            Some(Err("Invalid argument type found.".to_string()))
        );
    }

    #[test]
    fn test_unknown_is_not_handled() {
        assert!(call("upper", &[]).is_none());
        assert_eq!(lookup("sum").map(|f| f.name()), Some("sum"));
    }
}
