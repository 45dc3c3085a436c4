//! Builtin scalar functions
//!
//! Arity and literal argument types are checked when a rule is created
//! (`rill_core::validate::validate_funcs`). At runtime each function still
//! checks the dynamic type of its arguments and reports a plain message; the
//! evaluator wraps it as `call func <name> error: <message>`.

mod analytic;
mod datetime;
mod math;
mod misc;
mod strings;

pub use analytic::{AnalyticFunctions, Slot};
pub use datetime::format_time;
pub(crate) use datetime::pattern_runs;

use rill_core::validate::builtins::{func_type, FuncType};
use rill_core::Value;

pub type FuncResult = Result<Value, String>;

/// Dispatch a scalar builtin. `None` when `name` is not a scalar builtin.
pub fn call(name: &str, args: &[Value]) -> Option<FuncResult> {
    let result = match func_type(name)? {
        FuncType::Math => math::call(name, args),
        FuncType::Str => strings::call(name, args),
        FuncType::Conv => misc::conv_call(name, args),
        FuncType::Hash => misc::hash_call(name, args),
        FuncType::Other => misc::other_call(name, args),
        FuncType::DateTime => datetime::call(&name.to_ascii_lowercase(), args),
        FuncType::Analytic | FuncType::Agg => return None,
    };
    Some(result)
}

static NULL: Value = Value::Null;

/// Positional argument, `Null` when absent.
fn arg(args: &[Value], i: usize) -> &Value {
    args.get(i).unwrap_or(&NULL)
}

/// String rendering used by string and hash functions; null is empty.
fn to_string_always(v: &Value) -> String {
    match v {
        Value::Null => String::new(),
        v => v.to_string(),
    }
}

fn to_int(v: &Value) -> Result<i64, String> {
    match v {
        Value::Int(n) => Ok(*n),
        other => Err(format!("cannot convert {} to int", other.describe())),
    }
}
