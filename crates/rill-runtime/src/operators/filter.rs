//! WHERE

use super::{restore_analytic, snapshot_analytic, Operation};
use crate::error::{EvalError, EvalResult};
use crate::evaluator::{as_condition, ValuerEval};
use crate::functions::AnalyticFunctions;
use crate::tuple::{Data, JoinTupleSets, WindowTuplesSet};
use crate::valuer::{MultiValuer, Valuer, FUNCTIONS};
use rill_core::Expr;

pub struct FilterOperator {
    condition: Expr,
    analytic: AnalyticFunctions,
}

impl FilterOperator {
    pub fn new(condition: Expr) -> Self {
        Self {
            condition,
            analytic: AnalyticFunctions::new(),
        }
    }

    fn matches(&self, row: &dyn Valuer) -> EvalResult<bool> {
        let valuer = MultiValuer::new(vec![row, &self.analytic, &FUNCTIONS]);
        let v = ValuerEval::new(&valuer).eval(&self.condition)?;
        as_condition(&v).ok_or_else(|| {
            EvalError::msg(format!(
                "invalid condition that returns non-bool value {}",
                v.describe()
            ))
        })
    }

    fn filter(&self, data: Data) -> EvalResult<Option<Data>> {
        match data {
            Data::Tuple(t) => Ok(self.matches(&t)?.then_some(Data::Tuple(t))),
            Data::Window(set) => {
                let mut out = WindowTuplesSet {
                    content: Vec::with_capacity(set.content.len()),
                    range: set.range,
                };
                for w in set.content {
                    for t in w.tuples {
                        if self.matches(&t)? {
                            out.add_tuple(t);
                        }
                    }
                }
                Ok((!out.is_empty()).then_some(Data::Window(out)))
            }
            Data::Join(sets) => {
                let mut content = Vec::with_capacity(sets.content.len());
                for j in sets.content {
                    if self.matches(&j)? {
                        content.push(j);
                    }
                }
                Ok((!content.is_empty()).then_some(Data::Join(JoinTupleSets {
                    content,
                    range: sets.range,
                })))
            }
            other => Err(EvalError::msg(format!(
                "unsupported input {} for filter",
                other.kind()
            ))),
        }
    }
}

impl Operation for FilterOperator {
    fn name(&self) -> &'static str {
        "filter"
    }

    fn apply(&self, data: Data) -> EvalResult<Option<Data>> {
        self.filter(data).map_err(|e| e.context("run Where error"))
    }

    fn snapshot(&self) -> Option<serde_json::Value> {
        snapshot_analytic(&self.analytic)
    }

    fn restore(&self, state: serde_json::Value) -> Result<(), String> {
        restore_analytic(&self.analytic, state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuple::{Message, Tuple};
    use rill_core::{BinOp, Value};

    fn demo(size: Value) -> Tuple {
        let message: Message = [("size", size)].into_iter().collect();
        Tuple::new("demo", message, 0)
    }

    fn size_above(n: i64) -> FilterOperator {
        FilterOperator::new(Expr::binary(BinOp::Gt, Expr::field("size"), Expr::Integer(n)))
    }

    #[test]
    fn test_tuple_kept_or_dropped() {
        let op = size_above(3);
        assert!(op.apply(Data::Tuple(demo(Value::Int(6)))).unwrap().is_some());
        assert!(op.apply(Data::Tuple(demo(Value::Int(2)))).unwrap().is_none());
        // Missing field compares as null, which is false.
        let empty = Tuple::new("demo", Message::new(), 0);
        assert!(op.apply(Data::Tuple(empty)).unwrap().is_none());
    }

    #[test]
    fn test_window_keeps_matching_tuples() {
        let mut set = WindowTuplesSet::new();
        for n in [1, 5, 7] {
            set.add_tuple(demo(Value::Int(n)));
        }
        match size_above(3).apply(Data::Window(set)).unwrap() {
            Some(Data::Window(out)) => assert_eq!(out.len(), 2),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_type_error_is_prefixed() {
        let err = size_above(3)
            .apply(Data::Tuple(demo(Value::from("big"))))
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "run Where error: invalid operation string(big) > int64(3)"
        );
    }

    #[test]
    fn test_non_bool_condition() {
        let op = FilterOperator::new(Expr::field("size"));
        let err = op.apply(Data::Tuple(demo(Value::Int(3)))).unwrap_err();
        assert_eq!(
            err.to_string(),
            "run Where error: invalid condition that returns non-bool value int64(3)"
        );
    }
}
