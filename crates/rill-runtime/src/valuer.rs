//! Value resolution capabilities used by the evaluator
//!
//! A [`Valuer`] answers field, metadata and wildcard lookups for one logical
//! record. Extra capabilities are exposed through `as_*` accessors instead
//! of a single concrete type:
//!
//! - [`CallValuer`]: resolves function calls
//! - [`AggregateData`]: evaluates an expression over every member of a group
//!
//! Operators compose the capabilities they need with [`MultiValuer`] and
//! [`MultiAggregateValuer`]; lookups are first-match-wins in composition
//! order.

use crate::aggregation;
use crate::error::EvalResult;
use crate::evaluator::ValuerEval;
use crate::functions;
use crate::tuple::WindowRange;
use rill_core::{Expr, Value, ValueMap};

/// Field lookup for one logical record.
///
/// `table` is the stream qualifier of the reference, `None` when the
/// reference is unqualified.
pub trait Valuer {
    fn value(&self, key: &str, table: Option<&str>) -> Option<Value>;

    fn meta(&self, _key: &str, _table: Option<&str>) -> Option<Value> {
        None
    }

    /// All fields, for `*` and `stream.*`.
    fn all(&self, _table: Option<&str>) -> Option<ValueMap> {
        None
    }

    fn window_range(&self) -> Option<WindowRange> {
        None
    }

    fn as_call(&self) -> Option<&dyn CallValuer> {
        None
    }

    fn as_aggregate(&self) -> Option<&dyn AggregateData> {
        None
    }
}

/// Function dispatch. Returns `None` when the name is not handled here.
pub trait CallValuer {
    fn call(&self, name: &str, args: &[Value]) -> Option<Result<Value, String>>;
}

/// A group of records that aggregate arguments are evaluated over.
pub trait AggregateData {
    /// Evaluate `expr` against every member, in order.
    fn aggregate_eval(&self, expr: &Expr) -> EvalResult<Vec<Value>>;
}

/// Evaluate `expr` against each row with scalar functions available.
pub fn aggregate_over<'a, I>(rows: I, expr: &Expr) -> EvalResult<Vec<Value>>
where
    I: IntoIterator<Item = &'a dyn Valuer>,
{
    rows.into_iter()
        .map(|row| {
            let valuer = MultiValuer::new(vec![row, &FUNCTIONS]);
            ValuerEval::new(&valuer).eval(expr)
        })
        .collect()
}

// ============================================================================
// Compositions
// ============================================================================

/// First-match composition of several valuers.
pub struct MultiValuer<'a> {
    valuers: Vec<&'a dyn Valuer>,
}

impl<'a> MultiValuer<'a> {
    pub fn new(valuers: Vec<&'a dyn Valuer>) -> Self {
        Self { valuers }
    }
}

impl Valuer for MultiValuer<'_> {
    fn value(&self, key: &str, table: Option<&str>) -> Option<Value> {
        self.valuers.iter().find_map(|v| v.value(key, table))
    }

    fn meta(&self, key: &str, table: Option<&str>) -> Option<Value> {
        self.valuers.iter().find_map(|v| v.meta(key, table))
    }

    fn all(&self, table: Option<&str>) -> Option<ValueMap> {
        self.valuers.iter().find_map(|v| v.all(table))
    }

    fn window_range(&self) -> Option<WindowRange> {
        self.valuers.iter().find_map(|v| v.window_range())
    }

    fn as_call(&self) -> Option<&dyn CallValuer> {
        if self.valuers.iter().any(|v| v.as_call().is_some()) {
            Some(self)
        } else {
            None
        }
    }

    fn as_aggregate(&self) -> Option<&dyn AggregateData> {
        self.valuers.iter().find_map(|v| v.as_aggregate())
    }
}

impl CallValuer for MultiValuer<'_> {
    fn call(&self, name: &str, args: &[Value]) -> Option<Result<Value, String>> {
        self.valuers
            .iter()
            .filter_map(|v| v.as_call())
            .find_map(|c| c.call(name, args))
    }
}

/// Composition that also evaluates aggregate arguments over `data`.
pub struct MultiAggregateValuer<'a> {
    data: &'a dyn AggregateData,
    inner: MultiValuer<'a>,
}

impl<'a> MultiAggregateValuer<'a> {
    pub fn new(data: &'a dyn AggregateData, valuers: Vec<&'a dyn Valuer>) -> Self {
        Self {
            data,
            inner: MultiValuer::new(valuers),
        }
    }
}

impl Valuer for MultiAggregateValuer<'_> {
    fn value(&self, key: &str, table: Option<&str>) -> Option<Value> {
        self.inner.value(key, table)
    }

    fn meta(&self, key: &str, table: Option<&str>) -> Option<Value> {
        self.inner.meta(key, table)
    }

    fn all(&self, table: Option<&str>) -> Option<ValueMap> {
        self.inner.all(table)
    }

    fn window_range(&self) -> Option<WindowRange> {
        self.inner.window_range()
    }

    fn as_call(&self) -> Option<&dyn CallValuer> {
        self.inner.as_call()
    }

    fn as_aggregate(&self) -> Option<&dyn AggregateData> {
        Some(self.data)
    }
}

/// Resolves the `*` key to every field of the wrapped record.
pub struct WildcardValuer<'a> {
    data: &'a dyn Valuer,
}

impl<'a> WildcardValuer<'a> {
    pub fn new(data: &'a dyn Valuer) -> Self {
        Self { data }
    }
}

impl Valuer for WildcardValuer<'_> {
    fn value(&self, key: &str, table: Option<&str>) -> Option<Value> {
        if key == "*" {
            self.data.all(table).map(Value::Map)
        } else {
            None
        }
    }

    fn all(&self, table: Option<&str>) -> Option<ValueMap> {
        self.data.all(table)
    }
}

/// Supplies `window_start()` / `window_end()` for a window batch.
pub struct RangeValuer(pub Option<WindowRange>);

impl Valuer for RangeValuer {
    fn value(&self, _key: &str, _table: Option<&str>) -> Option<Value> {
        None
    }

    fn window_range(&self) -> Option<WindowRange> {
        self.0
    }
}

// ============================================================================
// Function valuers
// ============================================================================

/// Scalar builtin functions.
#[derive(Debug, Default, Clone, Copy)]
pub struct FunctionValuer;

pub static FUNCTIONS: FunctionValuer = FunctionValuer;

impl Valuer for FunctionValuer {
    fn value(&self, _key: &str, _table: Option<&str>) -> Option<Value> {
        None
    }

    fn as_call(&self) -> Option<&dyn CallValuer> {
        Some(self)
    }
}

impl CallValuer for FunctionValuer {
    fn call(&self, name: &str, args: &[Value]) -> Option<Result<Value, String>> {
        functions::call(name, args)
    }
}

/// Aggregate builtin functions; arguments arrive as one array per argument.
#[derive(Debug, Default, Clone, Copy)]
pub struct AggregateFunctionValuer;

pub static AGGREGATE_FUNCTIONS: AggregateFunctionValuer = AggregateFunctionValuer;

impl Valuer for AggregateFunctionValuer {
    fn value(&self, _key: &str, _table: Option<&str>) -> Option<Value> {
        None
    }

    fn as_call(&self) -> Option<&dyn CallValuer> {
        Some(self)
    }
}

impl CallValuer for AggregateFunctionValuer {
    fn call(&self, name: &str, args: &[Value]) -> Option<Result<Value, String>> {
        aggregation::call(name, args)
    }
}
