//! Join operator
//!
//! Correlates the tuples of one window emission across streams. Joins are
//! evaluated left to right: the first join pairs the FROM stream with the
//! first JOIN target, every later join pairs the running result with its
//! target. Merged rows hold shared references to the window's tuples.

use crate::error::{EvalError, EvalResult};
use crate::evaluator::{as_condition, ValuerEval};
use crate::tuple::{JoinTuple, JoinTupleSets, Tuple, WindowTuplesSet};
use crate::valuer::{MultiValuer, FUNCTIONS};
use rill_core::{Join, JoinType, Table};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct JoinOperator {
    from: String,
    joins: Vec<Join>,
}

impl JoinOperator {
    pub fn new(from: &Table, joins: Vec<Join>) -> Self {
        Self {
            from: from.ref_name().to_string(),
            joins,
        }
    }

    /// Join one window emission. `None` when nothing joined.
    ///
    /// The window's tuples move into shared references once; every joined
    /// row points at them.
    pub fn apply(&self, input: WindowTuplesSet) -> EvalResult<Option<JoinTupleSets>> {
        let range = input.range;
        let streams: Vec<SharedTuples> = input
            .content
            .into_iter()
            .map(|w| (w.emitter, w.tuples.into_iter().map(Arc::new).collect()))
            .collect();
        self.eval(&streams)
            .map_err(|e| e.context("run Join error"))
            .map(|content| {
                if content.is_empty() {
                    debug!("join yields nothing");
                    return None;
                }
                Some(JoinTupleSets { content, range })
            })
    }

    fn eval(&self, input: &[SharedTuples]) -> EvalResult<Vec<JoinTuple>> {
        let mut result = Vec::new();
        for (i, join) in self.joins.iter().enumerate() {
            result = if i == 0 {
                let (left, right) = self.stream_names(join);
                let lefts = shared(input, &left)
                    .into_iter()
                    .map(|t| {
                        let mut j = JoinTuple::new();
                        j.add_tuple(t);
                        j
                    })
                    .collect();
                join_rows(lefts, &shared(input, &right), join)?
            } else {
                join_rows(result, &shared(input, join.ref_name()), join)?
            };
        }
        Ok(result)
    }

    /// Left and right stream of the first join: the two streams qualified in
    /// the ON condition. CROSS joins and joins without ON use FROM and the
    /// join target; the planner rejects any other ON shape.
    fn stream_names(&self, join: &Join) -> (String, String) {
        if join.join_type != JoinType::Cross {
            if let Some(expr) = &join.expr {
                let mut streams = expr.referenced_streams();
                if streams.len() == 2 {
                    let right = streams.pop().unwrap_or_default();
                    let left = streams.pop().unwrap_or_default();
                    return (left, right);
                }
            }
        }
        (self.from.clone(), join.ref_name().to_string())
    }
}

/// Tuples of one stream in a window emission
type SharedTuples = (String, Vec<Arc<Tuple>>);

fn shared(input: &[SharedTuples], src: &str) -> Vec<Arc<Tuple>> {
    input
        .iter()
        .find(|(emitter, _)| emitter.eq_ignore_ascii_case(src))
        .map(|(_, tuples)| tuples.clone())
        .unwrap_or_default()
}

fn eval_on(join: &Join, merged: &JoinTuple) -> EvalResult<bool> {
    let Some(expr) = &join.expr else {
        return Ok(true);
    };
    let valuer = MultiValuer::new(vec![merged, &FUNCTIONS]);
    let v = ValuerEval::new(&valuer).eval(expr)?;
    as_condition(&v).ok_or_else(|| {
        EvalError::msg(format!(
            "invalid join condition that returns non-bool value {}",
            v.describe()
        ))
    })
}

fn join_rows(lefts: Vec<JoinTuple>, rights: &[Arc<Tuple>], join: &Join) -> EvalResult<Vec<JoinTuple>> {
    if join.join_type == JoinType::Right {
        return right_pass(&lefts, rights, join, false);
    }
    let keeps_left = matches!(
        join.join_type,
        JoinType::Left | JoinType::Full | JoinType::Cross
    );

    let mut sets = Vec::new();
    for left in &lefts {
        let mut left_joined = false;
        for (index, right) in rights.iter().enumerate() {
            let mut tuple_joined = false;
            let mut merged = JoinTuple::new();
            if keeps_left {
                merged.add_tuples(&left.tuples);
            }
            if join.join_type == JoinType::Cross {
                tuple_joined = true;
                merged.add_tuple(right.clone());
            } else {
                let mut temp = left.clone();
                temp.add_tuple(right.clone());
                if eval_on(join, &temp)? {
                    left_joined = true;
                    tuple_joined = true;
                    if join.join_type == JoinType::Inner {
                        merged.add_tuples(&left.tuples);
                    }
                    merged.add_tuple(right.clone());
                }
            }
            let unmatched_last =
                !left_joined && index == rights.len() - 1 && !merged.tuples.is_empty();
            if tuple_joined || unmatched_last {
                left_joined = true;
                sets.push(merged);
            }
        }
        if !left_joined && keeps_left && join.join_type != JoinType::Cross {
            sets.push(left.clone());
        }
    }

    if join.join_type == JoinType::Full {
        sets.extend(right_pass(&lefts, rights, join, true)?);
    }
    Ok(sets)
}

/// Right-driven pass. With `exclude_joint` only the right rows that matched
/// nothing are produced.
fn right_pass(
    lefts: &[JoinTuple],
    rights: &[Arc<Tuple>],
    join: &Join,
    exclude_joint: bool,
) -> EvalResult<Vec<JoinTuple>> {
    let mut sets = Vec::new();
    for right in rights {
        let mut is_joint = false;
        for (index, left) in lefts.iter().enumerate() {
            let mut tuple_joined = false;
            let mut merged = JoinTuple::new();
            merged.add_tuple(right.clone());

            let mut temp = JoinTuple::new();
            temp.add_tuple(right.clone());
            temp.add_tuples(&left.tuples);
            if eval_on(join, &temp)? {
                merged.add_tuples(&left.tuples);
                is_joint = true;
                tuple_joined = true;
            }
            let unmatched_last = !is_joint && index == lefts.len() - 1;
            if !exclude_joint && (tuple_joined || unmatched_last) {
                is_joint = true;
                sets.push(merged);
            }
        }
        if !is_joint {
            let mut merged = JoinTuple::new();
            merged.add_tuple(right.clone());
            sets.push(merged);
        }
    }
    Ok(sets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuple::Message;
    use crate::valuer::Valuer;
    use rill_core::{BinOp, Expr, Value};

    fn tuple(emitter: &str, id: i64, name: &str) -> Tuple {
        let message: Message = [("id", Value::Int(id)), ("name", Value::from(name))]
            .into_iter()
            .collect();
        Tuple::new(emitter, message, 0)
    }

    fn window() -> WindowTuplesSet {
        let mut set = WindowTuplesSet::new();
        for (id, name) in [(1, "a1"), (2, "a2"), (3, "a3")] {
            set.add_tuple(tuple("a", id, name));
        }
        for (id, name) in [(1, "b1"), (1, "b1x"), (4, "b4")] {
            set.add_tuple(tuple("b", id, name));
        }
        set
    }

    fn on(left: &str, right: &str) -> Option<Expr> {
        Some(Expr::binary(
            BinOp::Eq,
            Expr::qualified(left, "id"),
            Expr::qualified(right, "id"),
        ))
    }

    fn op(join_type: JoinType, expr: Option<Expr>) -> JoinOperator {
        let from = Table {
            name: "a".into(),
            alias: None,
        };
        JoinOperator::new(
            &from,
            vec![Join {
                name: "b".into(),
                alias: None,
                join_type,
                expr,
            }],
        )
    }

    fn count(join_type: JoinType) -> usize {
        op(join_type, on("a", "b"))
            .apply(window())
            .unwrap()
            .map(|s| s.len())
            .unwrap_or(0)
    }

    #[test]
    fn test_emission_counts_per_join_type() {
        assert_eq!(count(JoinType::Inner), 2);
        assert_eq!(count(JoinType::Left), 4);
        assert_eq!(count(JoinType::Right), 3);
        assert_eq!(count(JoinType::Full), 5);
        assert_eq!(op(JoinType::Cross, None).apply(window()).unwrap().unwrap().len(), 9);
    }

    #[test]
    fn test_rows_share_window_tuples() {
        let sets = op(JoinType::Cross, None).apply(window()).unwrap().unwrap();
        let rows = &sets.content;
        // a1 pairs with every b; b1 pairs with every a.
        assert!(Arc::ptr_eq(&rows[0].tuples[0], &rows[1].tuples[0]));
        assert!(Arc::ptr_eq(&rows[0].tuples[1], &rows[3].tuples[1]));
        assert_eq!(Arc::strong_count(&rows[0].tuples[0]), 3);
    }

    #[test]
    fn test_left_join_keeps_unmatched_left_alone() {
        let sets = op(JoinType::Left, on("a", "b")).apply(window()).unwrap().unwrap();
        let last = &sets.content[3];
        assert_eq!(last.tuples.len(), 1);
        assert_eq!(last.value("name", Some("a")), Some(Value::from("a3")));
        assert_eq!(last.value("name", Some("b")), None);
    }

    #[test]
    fn test_qualified_lookup_after_inner_join() {
        let sets = op(JoinType::Inner, on("a", "b")).apply(window()).unwrap().unwrap();
        let first = &sets.content[0];
        assert_eq!(first.value("name", Some("a")), Some(Value::from("a1")));
        assert_eq!(first.value("name", Some("b")), Some(Value::from("b1")));
        // Unqualified lookups take the first stream that has the field.
        assert_eq!(first.value("name", None), Some(Value::from("a1")));
    }

    #[test]
    fn test_chained_joins() {
        let mut input = window();
        input.add_tuple(tuple("c", 1, "c1"));
        let from = Table {
            name: "a".into(),
            alias: None,
        };
        let join = |name: &str, join_type, expr| Join {
            name: name.into(),
            alias: None,
            join_type,
            expr,
        };
        let op = JoinOperator::new(
            &from,
            vec![
                join("b", JoinType::Inner, on("a", "b")),
                join("c", JoinType::Inner, on("a", "c")),
            ],
        );
        let sets = op.apply(input).unwrap().unwrap();
        assert_eq!(sets.len(), 2);
        assert_eq!(sets.content[0].tuples.len(), 3);
    }

    #[test]
    fn test_non_bool_condition_is_an_error() {
        let err = op(JoinType::Inner, Some(Expr::qualified("a", "id")))
            .apply(window())
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "run Join error: invalid join condition that returns non-bool value int64(1)"
        );
    }

    #[test]
    fn test_no_match_yields_nothing() {
        let mut input = WindowTuplesSet::new();
        input.add_tuple(tuple("a", 1, "a1"));
        input.add_tuple(tuple("b", 2, "b2"));
        assert!(op(JoinType::Inner, on("a", "b")).apply(input).unwrap().is_none());
    }
}
