//! SELECT list projection
//!
//! Turns the final pipeline item into flat output rows. Aggregate statements
//! produce one row per group (or per window when there is no GROUP BY);
//! other statements produce one row per tuple or join result.

use super::{restore_analytic, snapshot_analytic, Operation};
use crate::error::EvalResult;
use crate::evaluator::ValuerEval;
use crate::functions::AnalyticFunctions;
use crate::tuple::{Data, GroupedTuples, Row, WindowRange};
use crate::valuer::{
    AggregateData, MultiAggregateValuer, MultiValuer, RangeValuer, Valuer, WildcardValuer,
    AGGREGATE_FUNCTIONS, FUNCTIONS,
};
use rill_core::{Expr, Field, Value, ValueMap};
use rustc_hash::FxHashSet;

struct Column {
    name: String,
    field: Field,
    /// Already computed by the preprocessor and stored under `name`.
    precomputed: bool,
}

pub struct ProjectOperator {
    columns: Vec<Column>,
    is_aggregate: bool,
    analytic: AnalyticFunctions,
}

impl ProjectOperator {
    /// `precomputed` names the aliases the preprocessor materializes.
    pub fn new(fields: Vec<Field>, is_aggregate: bool, precomputed: &[String]) -> Self {
        let names = output_names(&fields);
        let columns = fields
            .into_iter()
            .zip(names)
            .map(|(field, name)| Column {
                precomputed: !is_aggregate
                    && field.alias.is_some()
                    && precomputed.iter().any(|p| p == &name),
                name,
                field,
            })
            .collect();
        Self {
            columns,
            is_aggregate,
            analytic: AnalyticFunctions::new(),
        }
    }

    /// Output column names in select order, empty for wildcards.
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    fn row(&self, valuer: &dyn Valuer) -> EvalResult<ValueMap> {
        let eval = ValuerEval::new(valuer);
        let mut out = ValueMap::new();
        for c in &self.columns {
            if let Expr::Wildcard { stream } = &c.field.expr {
                let all = WildcardValuer::new(valuer).value("*", stream.as_deref());
                if let Some(Value::Map(m)) = all {
                    for (k, v) in m {
                        out.entry(k).or_insert(v);
                    }
                }
                continue;
            }
            let v = if c.precomputed {
                valuer.value(&c.name, None).unwrap_or(Value::Null)
            } else {
                eval.eval(&c.field.expr)?
            };
            out.insert(c.name.clone(), v);
        }
        Ok(out)
    }

    fn scalar_row(&self, row: &dyn Valuer, range: Option<WindowRange>) -> EvalResult<ValueMap> {
        let range = RangeValuer(range);
        let valuer = MultiValuer::new(vec![
            row,
            &range,
            &self.analytic,
            &FUNCTIONS,
            &AGGREGATE_FUNCTIONS,
        ]);
        self.row(&valuer)
    }

    fn aggregate_row<T: Valuer + AggregateData>(&self, group: &T) -> EvalResult<ValueMap> {
        let valuer = MultiAggregateValuer::new(
            group,
            vec![
                group as &dyn Valuer,
                &self.analytic,
                &FUNCTIONS,
                &AGGREGATE_FUNCTIONS,
            ],
        );
        self.row(&valuer)
    }

    fn project(&self, data: Data) -> EvalResult<Vec<ValueMap>> {
        match data {
            Data::Rows(rows) => Ok(rows),
            Data::Tuple(t) => {
                if self.is_aggregate {
                    let single = GroupedTuples {
                        content: vec![Row::Tuple(t)],
                        range: None,
                    };
                    Ok(vec![self.aggregate_row(&single)?])
                } else {
                    Ok(vec![self.scalar_row(&t, None)?])
                }
            }
            Data::Window(set) => {
                if self.is_aggregate {
                    Ok(vec![self.aggregate_row(&set)?])
                } else {
                    set.tuples()
                        .map(|t| self.scalar_row(t, set.range))
                        .collect()
                }
            }
            Data::Join(sets) => {
                if self.is_aggregate {
                    Ok(vec![self.aggregate_row(&sets)?])
                } else {
                    sets.content
                        .iter()
                        .map(|j| self.scalar_row(j, sets.range))
                        .collect()
                }
            }
            Data::Group(set) => set.groups.iter().map(|g| self.aggregate_row(g)).collect(),
        }
    }
}

impl Operation for ProjectOperator {
    fn name(&self) -> &'static str {
        "project"
    }

    fn apply(&self, data: Data) -> EvalResult<Option<Data>> {
        let rows = self
            .project(data)
            .map_err(|e| e.context("run Select error"))?;
        if rows.is_empty() {
            return Ok(None);
        }
        Ok(Some(Data::Rows(rows)))
    }

    fn snapshot(&self) -> Option<serde_json::Value> {
        snapshot_analytic(&self.analytic)
    }

    fn restore(&self, state: serde_json::Value) -> Result<(), String> {
        restore_analytic(&self.analytic, state)
    }
}

/// Resolve the output name of every field. Unnamed expressions get
/// `field0`, `field1`, ... skipping names taken explicitly.
pub(crate) fn output_names(fields: &[Field]) -> Vec<String> {
    let taken: FxHashSet<&str> = fields
        .iter()
        .map(|f| f.output_name())
        .filter(|n| !n.is_empty())
        .collect();
    let mut next = 0usize;
    fields
        .iter()
        .map(|f| {
            if f.is_wildcard() {
                return String::new();
            }
            let name = f.output_name();
            if !name.is_empty() {
                return name.to_string();
            }
            loop {
                let candidate = format!("field{}", next);
                next += 1;
                if !taken.contains(candidate.as_str()) {
                    return candidate;
                }
            }
        })
        .collect()
}

impl std::fmt::Debug for ProjectOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectOperator")
            .field("columns", &self.column_names())
            .field("is_aggregate", &self.is_aggregate)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuple::{GroupedTuplesSet, Message, Tuple, WindowTuplesSet};
    use rill_core::BinOp;

    fn demo(color: &str, size: i64, ts: i64) -> Tuple {
        let message: Message = [("color", Value::from(color)), ("size", Value::Int(size))]
            .into_iter()
            .collect();
        Tuple::new("demo", message, ts)
    }

    fn field(name: &str, alias: Option<&str>, expr: Expr) -> Field {
        Field {
            name: name.into(),
            alias: alias.map(Into::into),
            expr,
        }
    }

    fn rows(out: Option<Data>) -> Vec<ValueMap> {
        match out {
            Some(Data::Rows(rows)) => rows,
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unnamed_fields_are_numbered() {
        let fields = vec![
            field("", None, Expr::Integer(1)),
            field("", Some("field1"), Expr::Integer(2)),
            field("", None, Expr::Integer(3)),
            field("color", None, Expr::field("color")),
        ];
        assert_eq!(output_names(&fields), vec!["field0", "field1", "field2", "color"]);
    }

    #[test]
    fn test_wildcard_is_first_wins() {
        let op = ProjectOperator::new(
            vec![
                field(
                    "",
                    Some("color"),
                    Expr::binary(BinOp::Mul, Expr::field("size"), Expr::Integer(2)),
                ),
                field("", None, Expr::Wildcard { stream: None }),
            ],
            false,
            &[],
        );
        let out = rows(op.apply(Data::Tuple(demo("red", 3, 0))).unwrap());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].get("color"), Some(&Value::Int(6)));
        assert_eq!(out[0].get("size"), Some(&Value::Int(3)));
    }

    #[test]
    fn test_lag_state_survives_restore() {
        let lag = || {
            ProjectOperator::new(
                vec![field(
                    "lag",
                    Some("prev"),
                    Expr::call("lag", vec![Expr::field("size"), Expr::Str("lag_0".into())]),
                )],
                false,
                &[],
            )
        };
        let op = lag();
        assert!(op.snapshot().is_none());
        let first = rows(op.apply(Data::Tuple(demo("red", 3, 0))).unwrap());
        assert_eq!(first[0].get("prev"), Some(&Value::Null));
        let second = rows(op.apply(Data::Tuple(demo("red", 5, 0))).unwrap());
        assert_eq!(second[0].get("prev"), Some(&Value::Int(3)));

        let restored = lag();
        restored.restore(op.snapshot().unwrap()).unwrap();
        let third = rows(restored.apply(Data::Tuple(demo("red", 8, 0))).unwrap());
        assert_eq!(third[0].get("prev"), Some(&Value::Int(5)));
        assert!(restored.restore(serde_json::json!([1, 2])).is_err());
    }

    #[test]
    fn test_window_rows_with_range() {
        let mut set = WindowTuplesSet::new().with_range(WindowRange::new(1000, 2000));
        set.add_tuple(demo("red", 3, 1100));
        set.add_tuple(demo("blue", 6, 1200));
        let op = ProjectOperator::new(
            vec![
                field("color", None, Expr::field("color")),
                field("window_end", None, Expr::call("window_end", vec![])),
            ],
            false,
            &[],
        );
        let out = rows(op.apply(Data::Window(set)).unwrap());
        assert_eq!(out.len(), 2);
        assert_eq!(out[1].get("color"), Some(&Value::from("blue")));
        assert_eq!(out[1].get("window_end"), Some(&Value::Int(2000)));
    }

    #[test]
    fn test_group_rows() {
        let group = |tuples: Vec<Tuple>| GroupedTuples {
            content: tuples.into_iter().map(Row::Tuple).collect(),
            range: None,
        };
        let set = GroupedTuplesSet {
            groups: vec![
                group(vec![demo("red", 3, 0), demo("red", 5, 0)]),
                group(vec![demo("blue", 6, 0)]),
            ],
        };
        let op = ProjectOperator::new(
            vec![
                field("color", None, Expr::field("color")),
                field("sum", Some("total"), Expr::call("sum", vec![Expr::field("size")])),
                field("count", None, Expr::call("count", vec![Expr::Wildcard { stream: None }])),
            ],
            true,
            &[],
        );
        let out = rows(op.apply(Data::Group(set)).unwrap());
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].get("total"), Some(&Value::Int(8)));
        assert_eq!(out[0].get("count"), Some(&Value::Int(2)));
        assert_eq!(out[1].get("color"), Some(&Value::from("blue")));
    }

    #[test]
    fn test_precomputed_alias_is_not_reevaluated() {
        let mut t = demo("red", 3, 0);
        t.message.insert("id", Value::from("fixed"));
        let op = ProjectOperator::new(
            vec![field("newuuid", Some("id"), Expr::call("newuuid", vec![]))],
            false,
            &["id".to_string()],
        );
        let out = rows(op.apply(Data::Tuple(t)).unwrap());
        assert_eq!(out[0].get("id"), Some(&Value::from("fixed")));
    }

    #[test]
    fn test_call_error_is_prefixed() {
        let op = ProjectOperator::new(
            vec![field("round", None, Expr::call("round", vec![Expr::field("color")]))],
            false,
            &[],
        );
        let err = op.apply(Data::Tuple(demo("red", 3, 0))).unwrap_err();
        assert!(err.to_string().starts_with("run Select error: call func round error:"));
    }
}
