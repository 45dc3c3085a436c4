//! Individual validation checks: function signatures and clause rules.

use super::builtins::{self, FuncType, CAST_TYPES};
use super::suggest::suggest;
use super::{Diagnostic, Severity};
use crate::ast::{BinOp, Expr, SelectStatement};
use std::collections::HashMap;

// ============================================================================
// Function signatures
// ============================================================================

/// Literal class of an argument; non-literals have no class and pass every check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArgClass {
    Int,
    Float,
    Str,
    Bool,
}

fn arg_class(arg: &Expr) -> Option<ArgClass> {
    match arg {
        Expr::Integer(_) => Some(ArgClass::Int),
        Expr::Number(_) => Some(ArgClass::Float),
        Expr::Str(_) => Some(ArgClass::Str),
        Expr::Bool(_) => Some(ArgClass::Bool),
        _ => None,
    }
}

/// Expected argument kind, named the way the message renders it.
#[derive(Debug, Clone, Copy)]
enum Expect {
    Number,
    Int,
    Float,
    Str,
    Bool,
    /// No literal is a datetime.
    DateTime,
}

impl Expect {
    fn label(self) -> &'static str {
        match self {
            Expect::Number => "number - float or int",
            Expect::Int => "int",
            Expect::Float => "float",
            Expect::Str => "string",
            Expect::Bool => "bool",
            Expect::DateTime => "datetime",
        }
    }

    fn accepts(self, class: ArgClass) -> bool {
        match self {
            Expect::Number => matches!(class, ArgClass::Int | ArgClass::Float),
            Expect::Int => class == ArgClass::Int,
            Expect::Float => class == ArgClass::Float,
            Expect::Str => class == ArgClass::Str,
            Expect::Bool => class == ArgClass::Bool,
            Expect::DateTime => false,
        }
    }
}

fn expect_len(name: &str, expected: usize, args: &[Expr]) -> Result<(), String> {
    if args.len() != expected {
        return Err(format!(
            "The arguments for {} should be {}.",
            name, expected
        ));
    }
    Ok(())
}

/// `index` is 0-based; the message is 1-based.
fn expect_arg(name: &str, args: &[Expr], index: usize, expect: Expect) -> Result<(), String> {
    match args.get(index).and_then(arg_class) {
        Some(class) if !expect.accepts(class) => Err(format!(
            "Expect {} type for {} parameter of function {}.",
            expect.label(),
            index + 1,
            name
        )),
        _ => Ok(()),
    }
}

fn expect_all(name: &str, args: &[Expr], expects: &[Expect]) -> Result<(), String> {
    expect_len(name, expects.len(), args)?;
    for (i, e) in expects.iter().enumerate() {
        expect_arg(name, args, i, *e)?;
    }
    Ok(())
}

/// Check arity and literal argument types of a builtin call.
///
/// Unknown names pass; callers decide whether an unknown function is an error.
pub fn validate_funcs(name: &str, args: &[Expr]) -> Result<(), String> {
    let lower = name.to_ascii_lowercase();
    match builtins::func_type(&lower) {
        Some(FuncType::Math) => validate_math_func(&lower, args),
        Some(FuncType::Str) => validate_str_func(&lower, args),
        Some(FuncType::Conv) => validate_conv_func(&lower, args),
        Some(FuncType::Hash) => expect_all(&lower, args, &[Expect::Str]),
        Some(FuncType::Other) => validate_other_func(&lower, args),
        Some(FuncType::DateTime) => validate_datetime_func(&lower, args),
        Some(FuncType::Analytic) => validate_analytic_func(&lower, args),
        Some(FuncType::Agg) => validate_agg_func(&lower, args),
        None => Ok(()),
    }
}

fn validate_math_func(name: &str, args: &[Expr]) -> Result<(), String> {
    use Expect::*;
    match name {
        "bitand" | "bitor" | "bitxor" => expect_all(name, args, &[Int, Int]),
        "bitnot" => expect_all(name, args, &[Int]),
        "atan2" | "mod" | "power" => expect_all(name, args, &[Number, Number]),
        "rand" => expect_len(name, 0, args),
        _ => expect_all(name, args, &[Number]),
    }
}

fn validate_str_func(name: &str, args: &[Expr]) -> Result<(), String> {
    use Expect::*;
    match name {
        "concat" => {
            if args.is_empty() {
                return Err("The arguments for concat should be at least one.".to_string());
            }
            for i in 0..args.len() {
                expect_arg(name, args, i, Str)?;
            }
            Ok(())
        }
        "endswith" | "indexof" | "regexp_matches" | "startswith" => {
            expect_all(name, args, &[Str, Str])
        }
        "regexp_replace" => expect_all(name, args, &[Str, Str, Str]),
        "lpad" | "rpad" => expect_all(name, args, &[Str, Int]),
        "substring" => {
            if args.len() != 2 && args.len() != 3 {
                return Err("the arguments for substring should be 2 or 3".to_string());
            }
            expect_arg(name, args, 0, Str)?;
            for i in 1..args.len() {
                expect_arg(name, args, i, Int)?;
            }
            if let Expr::Integer(start) = args[1] {
                if start < 0 {
                    return Err("The start index should not be a negative integer.".to_string());
                }
                if let Some(Expr::Integer(end)) = args.get(2) {
                    if *end < start {
                        return Err(
                            "The end index should be larger than start index.".to_string()
                        );
                    }
                }
            }
            Ok(())
        }
        "split_value" => {
            if args.len() != 3 {
                return Err("the arguments for split_value should be 3".to_string());
            }
            expect_arg(name, args, 0, Str)?;
            expect_arg(name, args, 1, Str)?;
            expect_arg(name, args, 2, Int)?;
            if let Expr::Integer(idx) = args[2] {
                if idx < 0 {
                    return Err("The index should not be a negative integer.".to_string());
                }
            }
            Ok(())
        }
        _ => expect_all(name, args, &[Str]),
    }
}

fn validate_conv_func(name: &str, args: &[Expr]) -> Result<(), String> {
    use Expect::*;
    match name {
        "cast" => {
            expect_len(name, 2, args)?;
            match &args[1] {
                Expr::Str(t) if CAST_TYPES.contains(&t.as_str()) => Ok(()),
                Expr::Str(_) => Err("Expect one of following value for the 2nd parameter: bigint, float, string, boolean, datetime.".to_string()),
                _ => Err(format!(
                    "Expect {} type for 2 parameter of function {}.",
                    Str.label(),
                    name
                )),
            }
        }
        "chr" => {
            expect_len(name, 1, args)?;
            match args[0] {
                Expr::Number(_) | Expr::Bool(_) => Err(format!(
                    "Expect {} type for 1 parameter of function {}.",
                    Int.label(),
                    name
                )),
                _ => Ok(()),
            }
        }
        "encode" => {
            expect_len(name, 2, args)?;
            expect_arg(name, args, 0, Str)?;
            match &args[1] {
                Expr::Str(s) if s == "base64" => Ok(()),
                Expr::Str(_) => Err("Only base64 is supported for the 2nd parameter.".to_string()),
                _ => Err(format!(
                    "Expect {} type for 2 parameter of function {}.",
                    Str.label(),
                    name
                )),
            }
        }
        "trunc" => expect_all(name, args, &[Number, Int]),
        _ => Ok(()),
    }
}

fn validate_other_func(name: &str, args: &[Expr]) -> Result<(), String> {
    match name {
        "isnull" => expect_len(name, 1, args),
        "nanvl" => {
            expect_len(name, 2, args)?;
            expect_arg(name, args, 0, Expect::Float)
        }
        _ => expect_len(name, 0, args),
    }
}

fn validate_datetime_func(name: &str, args: &[Expr]) -> Result<(), String> {
    use Expect::*;
    match name {
        "now" | "current_timestamp" | "local_time" | "local_timestamp" | "cur_time"
        | "current_time" => match args {
            [] => Ok(()),
            [Expr::Integer(fsp)] if (0..=6).contains(fsp) => Ok(()),
            [Expr::Integer(_)] => Err(format!(
                "The fsp argument for {} should be between 0 and 6.",
                name
            )),
            [_] => Err(format!(
                "Expect {} type for 1 parameter of function {}.",
                Int.label(),
                name
            )),
            _ => Err(format!("The arguments for {} should be 0 or 1.", name)),
        },
        "cur_date" | "current_date" => expect_len(name, 0, args),
        "format_time" => expect_all(name, args, &[DateTime, Str]),
        "date_calc" => {
            expect_all(name, args, &[DateTime, Str])?;
            match &args[1] {
                Expr::Str(_) => Ok(()),
                _ => Err(format!(
                    "Expect {} type for 2 parameter of function {}.",
                    Str.label(),
                    name
                )),
            }
        }
        "date_diff" => expect_all(name, args, &[DateTime, DateTime]),
        "from_days" | "from_unix_time" => expect_all(name, args, &[Int]),
        _ => expect_all(name, args, &[DateTime]),
    }
}

/// Arity checks run before the planner appends the state key.
fn validate_analytic_func(name: &str, args: &[Expr]) -> Result<(), String> {
    use Expect::*;
    match name {
        "changed_col" => {
            expect_len(name, 2, args)?;
            expect_arg(name, args, 0, Bool)
        }
        "had_changed" => {
            if args.len() <= 1 {
                return Err(format!(
                    "expect more than one arg but got {}",
                    args.len()
                ));
            }
            expect_arg(name, args, 0, Bool)
        }
        "lag" => {
            if !(1..=3).contains(&args.len()) {
                return Err(format!(
                    "expect one two or three args but got {}",
                    args.len()
                ));
            }
            match args.get(1) {
                None | Some(Expr::Integer(0..)) => Ok(()),
                Some(Expr::Integer(_)) => {
                    Err("the index should not be a negative integer".to_string())
                }
                Some(_) => Err(format!(
                    "Expect {} type for 2 parameter of function {}.",
                    Int.label(),
                    name
                )),
            }
        }
        _ => {
            if !(1..=2).contains(&args.len()) {
                return Err(format!("expect one or two args but got {}", args.len()));
            }
            Ok(())
        }
    }
}

fn validate_agg_func(name: &str, args: &[Expr]) -> Result<(), String> {
    match name {
        "deduplicate" => {
            expect_len(name, 2, args)?;
            expect_arg(name, args, 1, Expect::Bool)
        }
        "count" | "collect" => expect_len(name, 1, args),
        _ => {
            expect_len(name, 1, args)?;
            match args[0] {
                Expr::Str(_) | Expr::Bool(_) => Err(format!(
                    "Expect {} type for 1 parameter of function {}.",
                    Expect::Number.label(),
                    name
                )),
                _ => Ok(()),
            }
        }
    }
}

// ============================================================================
// Clause rules
// ============================================================================

/// Select aliases keyed by lower-cased name.
pub type AliasMap<'a> = HashMap<String, &'a Expr>;

pub fn alias_map(stmt: &SelectStatement) -> AliasMap<'_> {
    stmt.fields
        .iter()
        .filter_map(|f| f.alias.as_ref().map(|a| (a.to_lowercase(), &f.expr)))
        .collect()
}

/// True if the expression calls an aggregate, directly or through an alias.
pub fn is_aggregate(expr: &Expr, aliases: &AliasMap<'_>) -> bool {
    is_aggregate_depth(expr, aliases, 0)
}

fn is_aggregate_depth(expr: &Expr, aliases: &AliasMap<'_>, depth: usize) -> bool {
    if depth > aliases.len() {
        return false;
    }
    let mut found = false;
    expr.walk(&mut |e| {
        if found {
            return;
        }
        match e {
            Expr::Call(c) if builtins::is_aggregate_function(&c.name) => found = true,
            Expr::FieldRef { stream: None, name } => {
                if let Some(target) = aliases.get(&name.to_lowercase()) {
                    found = is_aggregate_depth(target, aliases, depth + 1);
                }
            }
            _ => {}
        }
    });
    found
}

/// True if every operand of the expression is an aggregate or a literal.
pub fn all_aggregate(expr: &Expr, aliases: &AliasMap<'_>) -> bool {
    match expr {
        Expr::Binary { op, lhs, rhs } if !matches!(op, BinOp::Arrow | BinOp::Subset) => {
            all_aggregate(lhs, aliases) && all_aggregate(rhs, aliases)
        }
        Expr::Paren(e) | Expr::Unary { expr: e, .. } => all_aggregate(e, aliases),
        Expr::Call(_) | Expr::FieldRef { .. } | Expr::Binary { .. } => {
            is_aggregate(expr, aliases)
        }
        _ => true,
    }
}

fn error(message: impl Into<String>, code: &'static str) -> Diagnostic {
    Diagnostic {
        severity: Severity::Error,
        message: message.into(),
        code: Some(code),
        hint: None,
    }
}

/// Every call must name a known function and satisfy its signature.
pub(crate) fn check_calls(stmt: &SelectStatement, diags: &mut Vec<Diagnostic>) {
    let mut calls = Vec::new();
    stmt.walk_exprs(&mut |e| {
        if let Expr::Call(c) = e {
            calls.push(c);
        }
    });
    for call in calls {
        if builtins::func_type(&call.name).is_none() {
            let mut d = error(format!("unknown function {}", call.name), "E101");
            d.hint = suggest(&call.name, builtins::all_functions())
                .map(|s| format!("did you mean '{}'?", s));
            diags.push(d);
        } else if let Err(msg) = validate_funcs(&call.name, &call.args) {
            diags.push(error(msg, "E102"));
        }
    }
}

/// Aggregate placement rules for WHERE, HAVING and GROUP BY.
pub(crate) fn check_aggregates(stmt: &SelectStatement, diags: &mut Vec<Diagnostic>) {
    let aliases = alias_map(stmt);

    if let Some(cond) = &stmt.condition {
        if is_aggregate(cond, &aliases) {
            diags.push(error(
                "Not allowed to call aggregate functions in WHERE clause.",
                "E201",
            ));
        }
    }
    if let Some(having) = &stmt.having {
        if !all_aggregate(having, &aliases) {
            diags.push(error(
                "Not allowed to call non-aggregate functions in HAVING clause.",
                "E202",
            ));
        }
    }
    if stmt
        .group_dimensions()
        .any(|d| is_aggregate(&d.expr, &aliases))
    {
        diags.push(error(
            "Not allowed to call aggregate functions in GROUP BY clause.",
            "E203",
        ));
    }

    let mut nested = None;
    stmt.walk_exprs(&mut |e| {
        if nested.is_some() {
            return;
        }
        if let Expr::Call(c) = e {
            if builtins::is_aggregate_function(&c.name)
                && c.args.iter().any(|a| is_aggregate(a, &aliases))
            {
                nested = Some(c.name.clone());
            }
        }
    });
    if let Some(name) = nested {
        diags.push(error(
            format!(
                "invalid argument for func {}: aggregate argument is not allowed",
                name
            ),
            "E204",
        ));
    }
}

fn calls_analytic(expr: &Expr) -> bool {
    let mut found = false;
    expr.walk(&mut |e| {
        if let Expr::Call(c) = e {
            found |= builtins::is_analytic_function(&c.name);
        }
    });
    found
}

/// Analytic functions may only appear in the select list, WHERE and HAVING.
pub(crate) fn check_analytic(stmt: &SelectStatement, diags: &mut Vec<Diagnostic>) {
    let clauses = [
        (
            "GROUP BY",
            stmt.dimensions.iter().any(|d| calls_analytic(&d.expr)),
        ),
        (
            "ORDER BY",
            stmt.sort_fields.iter().any(|s| calls_analytic(&s.expr)),
        ),
        (
            "JOIN",
            stmt.joins
                .iter()
                .filter_map(|j| j.expr.as_ref())
                .any(calls_analytic),
        ),
    ];
    for (clause, found) in clauses {
        if found {
            diags.push(error(
                format!("Not allowed to call analytic functions in {} clause.", clause),
                "E205",
            ));
        }
    }

    let mut in_aggregate = false;
    stmt.walk_exprs(&mut |e| {
        if let Expr::Call(c) = e {
            in_aggregate |=
                builtins::is_aggregate_function(&c.name) && c.args.iter().any(calls_analytic);
        }
    });
    if in_aggregate {
        diags.push(error(
            "Not allowed to call analytic functions in aggregate arguments.",
            "E205",
        ));
    }
}

/// Aliases must be unique (case-insensitive) and at most one window is allowed.
pub(crate) fn check_fields(stmt: &SelectStatement, diags: &mut Vec<Diagnostic>) {
    let mut seen: Vec<String> = Vec::new();
    for alias in stmt.fields.iter().filter_map(|f| f.alias.as_ref()) {
        let lower = alias.to_lowercase();
        if seen.contains(&lower) {
            diags.push(error(format!("duplicate alias {}", alias), "E301"));
        } else {
            seen.push(lower);
        }
    }

    let windows = stmt
        .dimensions
        .iter()
        .filter(|d| matches!(d.expr, Expr::Window(_)))
        .count();
    if windows > 1 {
        diags.push(error(
            "There should be only one window in GROUP BY clause.",
            "E302",
        ));
    }
}
