//! HAVING

use super::{restore_analytic, snapshot_analytic, Operation};
use crate::error::{EvalError, EvalResult};
use crate::evaluator::{as_condition, ValuerEval};
use crate::functions::AnalyticFunctions;
use crate::tuple::{Data, GroupedTuples, GroupedTuplesSet, Row};
use crate::valuer::{AggregateData, MultiAggregateValuer, Valuer, AGGREGATE_FUNCTIONS, FUNCTIONS};
use rill_core::Expr;

pub struct HavingOperator {
    condition: Expr,
    analytic: AnalyticFunctions,
}

impl HavingOperator {
    pub fn new(condition: Expr) -> Self {
        Self {
            condition,
            analytic: AnalyticFunctions::new(),
        }
    }

    /// Evaluate against a whole group so aggregate calls see every member.
    fn matches<T: Valuer + AggregateData>(&self, group: &T) -> EvalResult<bool> {
        let valuer = MultiAggregateValuer::new(
            group,
            vec![
                group as &dyn Valuer,
                &self.analytic,
                &FUNCTIONS,
                &AGGREGATE_FUNCTIONS,
            ],
        );
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
            Data::Group(set) => {
                let mut groups = Vec::with_capacity(set.groups.len());
                for g in set.groups {
                    if self.matches(&g)? {
                        groups.push(g);
                    }
                }
                Ok((!groups.is_empty()).then_some(Data::Group(GroupedTuplesSet { groups })))
            }
            Data::Window(set) => Ok(self.matches(&set)?.then_some(Data::Window(set))),
            Data::Join(sets) => Ok(self.matches(&sets)?.then_some(Data::Join(sets))),
            Data::Tuple(t) => {
                let single = GroupedTuples {
                    content: vec![Row::Tuple(t)],
                    range: None,
                };
                if !self.matches(&single)? {
                    return Ok(None);
                }
                match single.content.into_iter().next() {
                    Some(Row::Tuple(t)) => Ok(Some(Data::Tuple(t))),
                    _ => Ok(None),
                }
            }
            other => Err(EvalError::msg(format!(
                "unsupported input {} for having",
                other.kind()
            ))),
        }
    }
}

impl Operation for HavingOperator {
    fn name(&self) -> &'static str {
        "having"
    }

    fn apply(&self, data: Data) -> EvalResult<Option<Data>> {
        self.filter(data).map_err(|e| e.context("run Having error"))
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

    fn group(sizes: &[i64]) -> GroupedTuples {
        GroupedTuples {
            content: sizes
                .iter()
                .map(|s| {
                    let message: Message = [("size", Value::Int(*s))].into_iter().collect();
                    Row::Tuple(Tuple::new("demo", message, 0))
                })
                .collect(),
            range: None,
        }
    }

    fn avg_above(n: i64) -> HavingOperator {
        HavingOperator::new(Expr::binary(
            BinOp::Gt,
            Expr::call("avg", vec![Expr::field("size")]),
            Expr::Integer(n),
        ))
    }

    #[test]
    fn test_groups_filtered_by_aggregate() {
        let set = GroupedTuplesSet {
            groups: vec![group(&[1, 3]), group(&[6, 8])],
        };
        match avg_above(3).apply(Data::Group(set)).unwrap() {
            Some(Data::Group(out)) => {
                assert_eq!(out.groups.len(), 1);
                assert_eq!(out.groups[0].content.len(), 2);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_all_groups_dropped_yields_nothing() {
        let set = GroupedTuplesSet {
            groups: vec![group(&[1])],
        };
        assert!(avg_above(3).apply(Data::Group(set)).unwrap().is_none());
    }

    #[test]
    fn test_non_bool_is_error() {
        let op = HavingOperator::new(Expr::call("count", vec![Expr::field("size")]));
        let set = GroupedTuplesSet {
            groups: vec![group(&[1])],
        };
        assert_eq!(
            op.apply(Data::Group(set)).unwrap_err().to_string(),
            "run Having error: invalid condition that returns non-bool value int64(1)"
        );
    }
}
