//! ORDER BY
//!
//! Sorting works on any container implementing [`SortingData`]: the tuples of
//! one stream in a window, join results, or groups. Sort keys are evaluated
//! once per row, then rows are stably reordered. Nulls sort last in either
//! direction.

use super::Operation;
use crate::error::{EvalError, EvalResult};
use crate::evaluator::ValuerEval;
use crate::tuple::{Data, GroupedTuples, JoinTuple, Tuple};
use crate::valuer::{MultiAggregateValuer, MultiValuer, Valuer, AGGREGATE_FUNCTIONS, FUNCTIONS};
use rill_core::{Expr, SortField, Value};
use std::cmp::Ordering;

/// A sortable sequence of rows.
pub trait SortingData {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evaluate `expr` against row `i`.
    fn eval_at(&self, i: usize, expr: &Expr) -> EvalResult<Value>;

    /// Rearrange rows so that row `k` becomes the old row `order[k]`.
    fn reorder(&mut self, order: &[usize]);
}

fn permute<T>(rows: &mut Vec<T>, order: &[usize]) {
    let mut old: Vec<Option<T>> = std::mem::take(rows).into_iter().map(Some).collect();
    *rows = order.iter().filter_map(|&i| old[i].take()).collect();
}

fn eval_row(row: &dyn Valuer, expr: &Expr) -> EvalResult<Value> {
    let valuer = MultiValuer::new(vec![row, &FUNCTIONS]);
    ValuerEval::new(&valuer).eval(expr)
}

impl SortingData for Vec<Tuple> {
    fn len(&self) -> usize {
        self.as_slice().len()
    }

    fn eval_at(&self, i: usize, expr: &Expr) -> EvalResult<Value> {
        eval_row(&self[i], expr)
    }

    fn reorder(&mut self, order: &[usize]) {
        permute(self, order)
    }
}

impl SortingData for Vec<JoinTuple> {
    fn len(&self) -> usize {
        self.as_slice().len()
    }

    fn eval_at(&self, i: usize, expr: &Expr) -> EvalResult<Value> {
        eval_row(&self[i], expr)
    }

    fn reorder(&mut self, order: &[usize]) {
        permute(self, order)
    }
}

impl SortingData for Vec<GroupedTuples> {
    fn len(&self) -> usize {
        self.as_slice().len()
    }

    fn eval_at(&self, i: usize, expr: &Expr) -> EvalResult<Value> {
        let g = &self[i];
        let valuer =
            MultiAggregateValuer::new(g, vec![g as &dyn Valuer, &FUNCTIONS, &AGGREGATE_FUNCTIONS]);
        ValuerEval::new(&valuer).eval(expr)
    }

    fn reorder(&mut self, order: &[usize]) {
        permute(self, order)
    }
}

fn compare_values(a: &Value, b: &Value) -> EvalResult<Ordering> {
    let ord = match (a, b) {
        (Value::Int(x), Value::Int(y)) => x.cmp(y),
        (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
            let x = a.as_float().unwrap_or(f64::NAN);
            let y = b.as_float().unwrap_or(f64::NAN);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::Str(x), Value::Str(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Time(x), Value::Time(y)) => x.cmp(y),
        _ => return Err(EvalError::Incomparable(a.type_tag(), b.type_tag())),
    };
    Ok(ord)
}

fn compare_keys(a: &[Value], b: &[Value], fields: &[SortField]) -> EvalResult<Ordering> {
    for ((x, y), field) in a.iter().zip(b).zip(fields) {
        let ord = match (x.is_null(), y.is_null()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) => {
                let ord = compare_values(x, y)?;
                if field.ascending {
                    ord
                } else {
                    ord.reverse()
                }
            }
        };
        if ord != Ordering::Equal {
            return Ok(ord);
        }
    }
    Ok(Ordering::Equal)
}

/// Stable multi-key sort of `data`.
pub fn sort_data(data: &mut dyn SortingData, fields: &[SortField]) -> EvalResult<()> {
    if data.len() < 2 || fields.is_empty() {
        return Ok(());
    }
    let keys = (0..data.len())
        .map(|i| {
            fields
                .iter()
                .map(|f| data.eval_at(i, &f.expr))
                .collect::<EvalResult<Vec<_>>>()
        })
        .collect::<EvalResult<Vec<_>>>()?;

    let mut order: Vec<usize> = (0..keys.len()).collect();
    let mut failure = None;
    order.sort_by(|&i, &j| match compare_keys(&keys[i], &keys[j], fields) {
        Ok(ord) => ord,
        Err(e) => {
            failure.get_or_insert(e);
            Ordering::Equal
        }
    });
    if let Some(e) = failure {
        return Err(e);
    }
    data.reorder(&order);
    Ok(())
}

pub struct OrderOperator {
    fields: Vec<SortField>,
}

impl OrderOperator {
    pub fn new(fields: Vec<SortField>) -> Self {
        Self { fields }
    }

    fn sort(&self, mut data: Data) -> EvalResult<Data> {
        match &mut data {
            Data::Tuple(_) | Data::Rows(_) => {}
            Data::Window(set) => {
                for w in &mut set.content {
                    sort_data(&mut w.tuples, &self.fields)?;
                }
            }
            Data::Join(sets) => sort_data(&mut sets.content, &self.fields)?,
            Data::Group(set) => sort_data(&mut set.groups, &self.fields)?,
        }
        Ok(data)
    }
}

impl Operation for OrderOperator {
    fn name(&self) -> &'static str {
        "order"
    }

    fn apply(&self, data: Data) -> EvalResult<Option<Data>> {
        self.sort(data)
            .map(Some)
            .map_err(|e| e.context("run Order By error"))
    }
}
