//! Rule planner
//!
//! Turns the SQL of a rule plus the known stream definitions into a linear
//! plan. Every stream gets a source and a preprocessor; their outputs meet
//! at the first stage:
//!
//! ```text
//! source_demo_0 -> op_1_preprocessor_demo_0 -+
//! source_ext_0  -> op_2_preprocessor_ext_0  -+-> op_3_window_0 -> op_4_join_0
//!     -> op_5_filter_0 -> op_6_aggregate_0 -> op_7_having_0 -> op_8_order_0
//!     -> op_9_project_0 -> sinks
//! ```
//!
//! Without a join the WHERE filter runs before the window so filtered tuples
//! are never buffered. Operator ids number the nodes in plan order.

use crate::config::{RuleDef, RuleOption};
use crate::error::{TopologyError, TopologyResult};
use crate::join::JoinOperator;
use crate::operators::{
    AggregateOperator, FilterOperator, HavingOperator, Operation, OrderOperator, Preprocessor,
    ProjectOperator,
};
use crate::window::WindowOperator;
use rill_core::validate::builtins::is_analytic_function;
use rill_core::validate::{self, alias_map, is_aggregate, AliasMap};
use rill_core::{BinOp, Expr, Field, JoinType, SelectStatement, StreamStmt};
use tracing::info;

/// Node kind of a planned stage
pub enum Stage {
    Operator(Box<dyn Operation>),
    Window(WindowOperator),
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Operator(op) => op.name(),
            Stage::Window(_) => "window",
        }
    }
}

/// One operator node with its id
pub struct PlannedStage {
    pub id: String,
    pub stage: Stage,
}

/// A stream read by the rule
pub struct PlannedSource {
    pub id: String,
    pub stream: StreamStmt,
    /// Name the rule refers to the stream by, used as the tuple emitter.
    pub ref_name: String,
    pub preprocessor: PlannedStage,
}

pub struct Plan {
    pub stmt: SelectStatement,
    pub sources: Vec<PlannedSource>,
    pub stages: Vec<PlannedStage>,
}

impl Plan {
    /// Ids of every operator node, sources first.
    pub fn op_ids(&self) -> Vec<&str> {
        self.sources
            .iter()
            .flat_map(|s| [s.id.as_str(), s.preprocessor.id.as_str()])
            .chain(self.stages.iter().map(|s| s.id.as_str()))
            .collect()
    }
}

/// Parse the rule's SQL and plan it against `streams`.
pub fn plan(rule: &RuleDef, streams: &[StreamStmt]) -> TopologyResult<Plan> {
    info!(rule = %rule.id, "Init rule with options {:?}", rule.options);
    let stmt = rill_parser::parse_select(&rule.sql)?;
    plan_statement(stmt, streams, &rule.options)
}

pub fn plan_statement(
    mut stmt: SelectStatement,
    streams: &[StreamStmt],
    options: &RuleOption,
) -> TopologyResult<Plan> {
    let result = validate::validate(&stmt);
    if let Some(d) = result.first_error() {
        return Err(TopologyError::Plan(d.message.clone()));
    }
    key_analytic_calls(&mut stmt);
    if options.plan_optimize_strategy.enable_incremental_window {
        info!("incremental window is not available, falling back to the buffered window engine");
    }

    let refs: Vec<(String, StreamStmt)> = stmt
        .sources
        .iter()
        .map(|t| (t.ref_name().to_string(), t.name.as_str()))
        .chain(stmt.joins.iter().map(|j| (j.ref_name().to_string(), j.name.as_str())))
        .map(|(r, name)| {
            streams
                .iter()
                .find(|s| s.name.eq_ignore_ascii_case(name))
                .map(|s| (r, s.clone()))
                .ok_or_else(|| TopologyError::StreamNotFound(name.to_string()))
        })
        .collect::<TopologyResult<_>>()?;
    if refs.is_empty() {
        return Err(TopologyError::Plan("no stream in the statement".into()));
    }

    let aliases = alias_map(&stmt);
    check_fields(&stmt, &refs, &aliases)?;

    let window = stmt.window().cloned();
    let has_join = !stmt.joins.is_empty();
    if has_join && window.is_none() {
        return Err(TopologyError::Plan("need to run stream join in windows".into()));
    }
    check_join_streams(&stmt)?;

    let (alias_fields, precomputed) = if has_join {
        (Vec::new(), Vec::new())
    } else {
        precomputable_aliases(&stmt, &refs[0].1, &aliases)
    };

    let mut index = 0;
    let mut next_id = |name: &str| {
        index += 1;
        format!("op_{}_{}_0", index, name)
    };

    let mut sources = Vec::with_capacity(refs.len());
    for (i, (ref_name, stream)) in refs.iter().enumerate() {
        let fields = if i == 0 { alias_fields.clone() } else { Vec::new() };
        let pp = Preprocessor::new(stream, fields, options.is_event_time)
            .map_err(TopologyError::Plan)?;
        sources.push(PlannedSource {
            id: format!("source_{}_0", stream.name),
            stream: stream.clone(),
            ref_name: ref_name.clone(),
            preprocessor: PlannedStage {
                id: next_id(&format!("preprocessor_{}", stream.name)),
                stage: Stage::Operator(Box::new(pp)),
            },
        });
    }

    let mut stages = Vec::new();
    let mut push = |stage: Stage, stages: &mut Vec<PlannedStage>| {
        let id = next_id(stage.name());
        stages.push(PlannedStage { id, stage });
    };

    let condition = stmt.condition.clone();
    if let (Some(cond), false) = (&condition, has_join) {
        push(Stage::Operator(Box::new(FilterOperator::new(cond.clone()))), &mut stages);
    }
    if let Some(w) = window {
        let inputs = refs.iter().map(|(r, _)| r.clone()).collect();
        let op = WindowOperator::new(w, options.is_event_time, inputs, options.late_tol);
        push(Stage::Window(op), &mut stages);
    }
    if has_join {
        let join = JoinOperator::new(&stmt.sources[0], stmt.joins.clone());
        push(Stage::Operator(Box::new(join)), &mut stages);
        if let Some(cond) = condition {
            push(Stage::Operator(Box::new(FilterOperator::new(cond))), &mut stages);
        }
    }
    if stmt.has_group_dimensions() {
        let dims = stmt.group_dimensions().map(|d| d.expr.clone()).collect();
        push(Stage::Operator(Box::new(AggregateOperator::new(dims))), &mut stages);
    }
    if let Some(having) = &stmt.having {
        push(Stage::Operator(Box::new(HavingOperator::new(having.clone()))), &mut stages);
    }
    if !stmt.sort_fields.is_empty() {
        let order = OrderOperator::new(stmt.sort_fields.clone());
        push(Stage::Operator(Box::new(order)), &mut stages);
    }
    let aggregate = is_aggregate_statement(&stmt, &aliases);
    let project = ProjectOperator::new(stmt.fields.clone(), aggregate, &precomputed);
    push(Stage::Operator(Box::new(project)), &mut stages);

    Ok(Plan {
        stmt,
        sources,
        stages,
    })
}

/// GROUP BY dimensions or an aggregate call in the select list.
fn is_aggregate_statement(stmt: &SelectStatement, aliases: &AliasMap<'_>) -> bool {
    stmt.has_group_dimensions() || stmt.fields.iter().any(|f| is_aggregate(&f.expr, aliases))
}

/// Append a state key to every analytic call in the select list, WHERE and
/// HAVING. Keys are `<name>_<n>` in that clause order and must stay stable
/// across restarts of the rule.
fn key_analytic_calls(stmt: &mut SelectStatement) {
    let mut index = 0;
    let mut key = |e: &mut Expr| {
        if let Expr::Call(c) = e {
            if is_analytic_function(&c.name) {
                c.args
                    .push(Expr::Str(format!("{}_{}", c.name.to_ascii_lowercase(), index)));
                index += 1;
            }
        }
    };
    for f in &mut stmt.fields {
        f.expr.walk_mut(&mut key);
    }
    if let Some(cond) = &mut stmt.condition {
        cond.walk_mut(&mut key);
    }
    if let Some(having) = &mut stmt.having {
        having.walk_mut(&mut key);
    }
}

/// The ON condition of the first join names its left and right streams, so
/// it must qualify fields of exactly two streams.
fn check_join_streams(stmt: &SelectStatement) -> TopologyResult<()> {
    let Some(join) = stmt.joins.first() else {
        return Ok(());
    };
    if join.join_type == JoinType::Cross {
        return Ok(());
    }
    if let Some(expr) = &join.expr {
        let streams = expr.referenced_streams();
        if streams.len() != 2 {
            return Err(TopologyError::Plan(format!(
                "join condition {} should reference exactly 2 streams but found {}",
                expr,
                streams.len()
            )));
        }
    }
    Ok(())
}

/// Aliased select expressions the preprocessor can evaluate per tuple.
///
/// An alias qualifies when it is not an aggregate, calls no analytic
/// function, does not read the window range and does not shadow a field of
/// the stream.
fn precomputable_aliases(
    stmt: &SelectStatement,
    stream: &StreamStmt,
    aliases: &AliasMap<'_>,
) -> (Vec<Field>, Vec<String>) {
    let mut fields = Vec::new();
    let mut names = Vec::new();
    for f in &stmt.fields {
        let Some(alias) = &f.alias else { continue };
        if f.is_wildcard()
            || is_aggregate(&f.expr, aliases)
            || reads_window(&f.expr)
            || calls_analytic(&f.expr)
        {
            continue;
        }
        if stream.field(alias).is_some() || shadows(alias, stmt) {
            continue;
        }
        fields.push(f.clone());
        names.push(alias.clone());
    }
    (fields, names)
}

fn reads_window(expr: &Expr) -> bool {
    let mut found = false;
    expr.walk(&mut |e| {
        if let Expr::Call(c) = e {
            if c.name == "window_start" || c.name == "window_end" {
                found = true;
            }
        }
    });
    found
}

fn calls_analytic(expr: &Expr) -> bool {
    let mut found = false;
    expr.walk(&mut |e| {
        if let Expr::Call(c) = e {
            found |= is_analytic_function(&c.name);
        }
    });
    found
}

/// True if an alias expression reads a field with the alias' own name.
fn shadows(alias: &str, stmt: &SelectStatement) -> bool {
    stmt.fields
        .iter()
        .filter(|f| f.alias.is_some())
        .any(|f| {
            let mut refs = Vec::new();
            field_refs(&f.expr, &mut refs);
            refs.iter().any(|(_, name)| name.eq_ignore_ascii_case(alias))
        })
}

// =============================================================================
// Field resolution
// =============================================================================

/// Field references of an expression. The right side of `->` is a key of
/// the left value, not a field.
fn field_refs<'a>(expr: &'a Expr, out: &mut Vec<(Option<&'a str>, &'a str)>) {
    match expr {
        Expr::FieldRef { stream, name } => out.push((stream.as_deref(), name.as_str())),
        Expr::Binary {
            op: BinOp::Arrow,
            lhs,
            ..
        } => field_refs(lhs, out),
        Expr::Binary { lhs, rhs, .. } => {
            field_refs(lhs, out);
            field_refs(rhs, out);
        }
        Expr::Paren(e) | Expr::Unary { expr: e, .. } => field_refs(e, out),
        Expr::Call(c) => c.args.iter().for_each(|a| field_refs(a, out)),
        Expr::Case(c) => {
            if let Some(v) = &c.value {
                field_refs(v, out);
            }
            for w in &c.when_clauses {
                field_refs(&w.expr, out);
                field_refs(&w.result, out);
            }
            if let Some(e) = &c.else_clause {
                field_refs(e, out);
            }
        }
        Expr::Window(w) => {
            if let Some(e) = &w.filter {
                field_refs(e, out);
            }
            if let Some(e) = &w.trigger_condition {
                field_refs(e, out);
            }
        }
        _ => {}
    }
}

fn check_fields(
    stmt: &SelectStatement,
    refs: &[(String, StreamStmt)],
    aliases: &AliasMap<'_>,
) -> TopologyResult<()> {
    let find = |name: &str| refs.iter().find(|(r, _)| r.eq_ignore_ascii_case(name));
    let any_schemaless = refs.iter().any(|(_, s)| s.is_schemaless());

    let mut all = Vec::new();
    stmt.walk_exprs(&mut |e| {
        if let Expr::Wildcard { stream: Some(s) } = e {
            if find(s).is_none() {
                all.push((Some(s.as_str()), "*"));
            }
        }
    });
    for f in &stmt.fields {
        field_refs(&f.expr, &mut all);
    }
    for j in &stmt.joins {
        if let Some(e) = &j.expr {
            field_refs(e, &mut all);
        }
    }
    for e in stmt
        .condition
        .iter()
        .chain(stmt.dimensions.iter().map(|d| &d.expr))
        .chain(stmt.having.iter())
        .chain(stmt.sort_fields.iter().map(|s| &s.expr))
    {
        field_refs(e, &mut all);
    }

    for (stream, name) in all {
        match stream {
            Some(s) => {
                let known = match find(s) {
                    Some((_, def)) => def.is_schemaless() || def.field(name).is_some(),
                    None => false,
                };
                if !known {
                    return Err(TopologyError::Plan(format!("unknown field {}.{}", s, name)));
                }
            }
            None => {
                if aliases.contains_key(&name.to_lowercase()) {
                    continue;
                }
                let declared = refs.iter().filter(|(_, s)| s.field(name).is_some()).count();
                if declared > 1 {
                    return Err(TopologyError::Plan(format!("ambiguous field {}", name)));
                }
                if declared == 0 && !any_schemaless {
                    return Err(TopologyError::Plan(format!("unknown field {}", name)));
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Qos;

    fn stream(sql: &str) -> StreamStmt {
        rill_parser::parse_stream(sql).unwrap()
    }

    fn streams() -> Vec<StreamStmt> {
        vec![
            stream(r#"CREATE STREAM demo (color STRING, size BIGINT, ts BIGINT) WITH (DATASOURCE="demo", FORMAT="json", TIMESTAMP="ts")"#),
            stream(r#"CREATE STREAM demo1 (temp FLOAT, hum BIGINT, ts BIGINT) WITH (DATASOURCE="demo1", FORMAT="json", TIMESTAMP="ts")"#),
            stream(r#"CREATE STREAM ext () WITH (DATASOURCE="ext", FORMAT="json")"#),
        ]
    }

    fn plan_sql(sql: &str) -> TopologyResult<Plan> {
        plan(&RuleDef::new("rule1", sql), &streams())
    }

    fn ids(plan: &Plan) -> Vec<&str> {
        plan.op_ids()
    }

    #[test]
    fn test_hopping_plan_ids() {
        let p = plan_sql("SELECT * FROM demo GROUP BY HOPPINGWINDOW(ss, 2, 1)").unwrap();
        assert_eq!(
            ids(&p),
            vec![
                "source_demo_0",
                "op_1_preprocessor_demo_0",
                "op_2_window_0",
                "op_3_project_0"
            ]
        );
    }

    #[test]
    fn test_filter_runs_before_window_without_join() {
        let p = plan_sql(
            "SELECT color, count(*) FROM demo WHERE size > 2 GROUP BY color, TUMBLINGWINDOW(ss, 10) HAVING count(*) > 1 ORDER BY color",
        )
        .unwrap();
        let names: Vec<&str> = p.stages.iter().map(|s| s.stage.name()).collect();
        assert_eq!(names, vec!["filter", "window", "aggregate", "having", "order", "project"]);
    }

    #[test]
    fn test_join_plan_filters_after_join() {
        let p = plan_sql(
            "SELECT color, temp FROM demo INNER JOIN demo1 ON demo.ts = demo1.ts WHERE size > 2 GROUP BY TUMBLINGWINDOW(ss, 10)",
        )
        .unwrap();
        assert_eq!(p.sources.len(), 2);
        assert_eq!(p.sources[1].preprocessor.id, "op_2_preprocessor_demo1_0");
        let names: Vec<&str> = p.stages.iter().map(|s| s.stage.name()).collect();
        assert_eq!(names, vec!["window", "join", "filter", "project"]);
    }

    #[test]
    fn test_join_requires_window() {
        let err = plan_sql("SELECT color FROM demo INNER JOIN demo1 ON demo.ts = demo1.ts")
            .err()
            .unwrap();
        assert_eq!(err.to_string(), "need to run stream join in windows");
    }

    #[test]
    fn test_join_condition_names_two_streams() {
        let err = plan_sql(
            "SELECT color FROM demo INNER JOIN demo1 ON demo.ts = 1 GROUP BY TUMBLINGWINDOW(ss, 1)",
        )
        .err()
        .unwrap();
        assert!(matches!(err, TopologyError::Plan(_)));
        assert!(err
            .to_string()
            .ends_with("should reference exactly 2 streams but found 1"));

        let err = plan_sql(
            "SELECT color FROM demo LEFT JOIN demo1 ON 1 = 1 GROUP BY TUMBLINGWINDOW(ss, 1)",
        )
        .err()
        .unwrap();
        assert!(err.to_string().ends_with("but found 0"));

        assert!(plan_sql(
            "SELECT color, temp FROM demo CROSS JOIN demo1 GROUP BY TUMBLINGWINDOW(ss, 1)"
        )
        .is_ok());
    }

    #[test]
    fn test_unknown_stream() {
        let err = plan_sql("SELECT * FROM nope").err().unwrap();
        assert_eq!(
            err.to_string(),
            "fail to get stream nope, please check if stream is created"
        );
    }

    #[test]
    fn test_field_resolution() {
        let err = plan_sql("SELECT abc FROM demo").err().unwrap();
        assert_eq!(err.to_string(), "unknown field abc");

        let err = plan_sql(
            "SELECT ts FROM demo INNER JOIN demo1 ON demo.ts = demo1.ts GROUP BY TUMBLINGWINDOW(ss, 10)",
        )
        .err()
        .unwrap();
        assert_eq!(err.to_string(), "ambiguous field ts");

        let err = plan_sql(
            "SELECT demo2.ts FROM demo INNER JOIN demo1 ON demo.ts = demo1.ts GROUP BY TUMBLINGWINDOW(ss, 10)",
        )
        .err()
        .unwrap();
        assert_eq!(err.to_string(), "unknown field demo2.ts");

        // Schemaless streams accept any field, json keys are not fields.
        assert!(plan_sql("SELECT anything->inner FROM ext").is_ok());
        // Aliases resolve in later clauses.
        assert!(plan_sql("SELECT size * 2 AS twice FROM demo WHERE twice > 4").is_ok());
    }

    #[test]
    fn test_validation_errors_fail_planning() {
        let err = plan_sql("SELECT abs(size, 1) FROM demo").err().unwrap();
        assert_eq!(err.to_string(), "The arguments for abs should be 1.");
    }

    #[test]
    fn test_event_time_requires_timestamp() {
        let mut rule = RuleDef::new("rule1", "SELECT * FROM ext GROUP BY TUMBLINGWINDOW(ss, 1)");
        rule.options.is_event_time = true;
        let err = plan(&rule, &streams()).err().unwrap();
        assert_eq!(
            err.to_string(),
            "preprocessor is set to be event time but stream option TIMESTAMP not found"
        );
        rule.options.qos = Qos::AtLeastOnce;
        rule.sql = "SELECT * FROM demo GROUP BY TUMBLINGWINDOW(ss, 1)".into();
        assert!(plan(&rule, &streams()).is_ok());
    }

    #[test]
    fn test_precomputed_aliases() {
        let stmt = rill_parser::parse_select(
            "SELECT size * 2 AS twice, count(*) AS c, window_end() AS we, color AS color, newuuid() AS id FROM demo GROUP BY TUMBLINGWINDOW(ss, 1)",
        )
        .unwrap();
        let aliases = alias_map(&stmt);
        let (fields, names) = precomputable_aliases(&stmt, &streams()[0], &aliases);
        assert_eq!(names, vec!["twice", "id"]);
        assert_eq!(fields.len(), 2);
    }

    #[test]
    fn test_analytic_calls_get_state_keys() {
        let plan = plan_sql(
            "SELECT lag(size) AS prev, LATEST(color) AS last_color FROM demo WHERE had_changed(true, size)",
        )
        .unwrap();
        let mut keys = Vec::new();
        plan.stmt.walk_exprs(&mut |e| {
            if let Expr::Call(c) = e {
                if let Some(Expr::Str(k)) = c.args.last() {
                    keys.push(k.clone());
                }
            }
        });
        assert_eq!(keys, vec!["lag_0", "latest_1", "had_changed_2"]);

        let stmt = rill_parser::parse_select("SELECT lag(size) AS prev FROM demo").unwrap();
        let aliases = alias_map(&stmt);
        let (_, names) = precomputable_aliases(&stmt, &streams()[0], &aliases);
        assert!(names.is_empty());
    }
}
