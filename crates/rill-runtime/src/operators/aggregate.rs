//! GROUP BY
//!
//! Rows are keyed by the concatenated display form of every non-window
//! dimension, each followed by a comma. Groups keep first-seen order.

use super::Operation;
use crate::error::{EvalError, EvalResult};
use crate::evaluator::ValuerEval;
use crate::tuple::{Data, GroupedTuples, GroupedTuplesSet, Row, WindowRange};
use crate::valuer::{MultiValuer, Valuer, FUNCTIONS};
use indexmap::IndexMap;
use rill_core::Expr;
use rustc_hash::FxBuildHasher;
use std::fmt::Write as _;

pub struct AggregateOperator {
    dimensions: Vec<Expr>,
}

impl AggregateOperator {
    /// `dimensions` excludes the window dimension.
    pub fn new(dimensions: Vec<Expr>) -> Self {
        Self { dimensions }
    }

    fn key(&self, row: &dyn Valuer) -> EvalResult<String> {
        let valuer = MultiValuer::new(vec![row, &FUNCTIONS]);
        let eval = ValuerEval::new(&valuer);
        let mut key = String::new();
        for d in &self.dimensions {
            let v = eval.eval(d)?;
            let _ = write!(key, "{},", v);
        }
        Ok(key)
    }

    fn group(&self, rows: Vec<Row>, range: Option<WindowRange>) -> EvalResult<GroupedTuplesSet> {
        let mut groups: IndexMap<String, GroupedTuples, FxBuildHasher> = IndexMap::default();
        for row in rows {
            let key = self.key(&row)?;
            groups
                .entry(key)
                .or_insert_with(|| GroupedTuples {
                    content: Vec::new(),
                    range,
                })
                .content
                .push(row);
        }
        Ok(GroupedTuplesSet {
            groups: groups.into_values().collect(),
        })
    }
}

impl Operation for AggregateOperator {
    fn name(&self) -> &'static str {
        "aggregate"
    }

    fn apply(&self, data: Data) -> EvalResult<Option<Data>> {
        let (rows, range) = match data {
            Data::Tuple(t) => (vec![Row::Tuple(t)], None),
            Data::Window(set) => {
                let range = set.range;
                let rows = set
                    .content
                    .into_iter()
                    .flat_map(|w| w.tuples)
                    .map(Row::Tuple)
                    .collect();
                (rows, range)
            }
            Data::Join(sets) => (sets.content.into_iter().map(Row::Join).collect(), sets.range),
            other => {
                return Err(EvalError::msg(format!(
                    "run Group By error: unsupported input {}",
                    other.kind()
                )))
            }
        };
        self.group(rows, range)
            .map(|set| Some(Data::Group(set)))
            .map_err(|e| e.context("run Group By error"))
    }
}
