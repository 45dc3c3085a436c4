//! Abstract Syntax Tree for rill SQL
//!
//! The parser produces these nodes and the planner and evaluator consume
//! them directly. Function names are stored lower-cased; stream and field
//! names keep the case they were written with.

use crate::types::FieldType;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stream name used for field references without a `stream.` qualifier.
pub const DEFAULT_STREAM: &str = "$$default";

/// Top-level statement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Statement {
    Select(SelectStatement),
    CreateStream(StreamStmt),
}

/// `SELECT fields FROM sources [JOIN ...] [WHERE ..] [GROUP BY ..] [HAVING ..] [ORDER BY ..]`
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SelectStatement {
    pub fields: Vec<Field>,
    pub sources: Vec<Table>,
    pub joins: Vec<Join>,
    pub condition: Option<Expr>,
    pub dimensions: Vec<Dimension>,
    pub having: Option<Expr>,
    pub sort_fields: Vec<SortField>,
}

impl SelectStatement {
    /// The window dimension of the GROUP BY clause, if any.
    pub fn window(&self) -> Option<&Window> {
        self.dimensions.iter().find_map(|d| match &d.expr {
            Expr::Window(w) => Some(w.as_ref()),
            _ => None,
        })
    }

    /// GROUP BY dimensions other than the window.
    pub fn group_dimensions(&self) -> impl Iterator<Item = &Dimension> {
        self.dimensions
            .iter()
            .filter(|d| !matches!(d.expr, Expr::Window(_)))
    }

    pub fn has_group_dimensions(&self) -> bool {
        self.group_dimensions().next().is_some()
    }

    /// Names of all streams read by the statement, FROM first then joins.
    pub fn stream_names(&self) -> Vec<&str> {
        self.sources
            .iter()
            .map(|t| t.name.as_str())
            .chain(self.joins.iter().map(|j| j.name.as_str()))
            .collect()
    }

    /// Visit every expression of the statement in clause order.
    pub fn walk_exprs<'a>(&'a self, f: &mut dyn FnMut(&'a Expr)) {
        for field in &self.fields {
            field.expr.walk(f);
        }
        for join in &self.joins {
            if let Some(e) = &join.expr {
                e.walk(f);
            }
        }
        if let Some(c) = &self.condition {
            c.walk(f);
        }
        for d in &self.dimensions {
            d.expr.walk(f);
        }
        if let Some(h) = &self.having {
            h.walk(f);
        }
        for s in &self.sort_fields {
            s.expr.walk(f);
        }
    }
}

/// Projected field: `expr [AS alias]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    /// Name derived from the expression: the field name for references, the
    /// function name for calls, empty otherwise.
    pub name: String,
    pub alias: Option<String>,
    pub expr: Expr,
}

impl Field {
    /// Name the field takes in the output row, empty when one must be generated.
    pub fn output_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }

    pub fn is_wildcard(&self) -> bool {
        matches!(self.expr, Expr::Wildcard { .. })
    }
}

/// Stream referenced in FROM
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub name: String,
    pub alias: Option<String>,
}

impl Table {
    /// Name used to qualify fields of this table.
    pub fn ref_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinType {
    Left,
    Inner,
    Right,
    Full,
    Cross,
}

impl fmt::Display for JoinType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JoinType::Left => "LEFT",
            JoinType::Inner => "INNER",
            JoinType::Right => "RIGHT",
            JoinType::Full => "FULL",
            JoinType::Cross => "CROSS",
        };
        write!(f, "{}", s)
    }
}

/// `[LEFT|INNER|RIGHT|FULL|CROSS] JOIN name [AS alias] [ON expr]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Join {
    pub name: String,
    pub alias: Option<String>,
    pub join_type: JoinType,
    pub expr: Option<Expr>,
}

impl Join {
    pub fn ref_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dimension {
    pub expr: Expr,
}

/// ORDER BY item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortField {
    pub name: String,
    pub stream: Option<String>,
    pub ascending: bool,
    pub expr: Expr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WindowType {
    Tumbling,
    Hopping,
    Sliding,
    Session,
    Count,
}

impl WindowType {
    /// SQL function name that declares a window of this type.
    pub fn func_name(&self) -> &'static str {
        match self {
            WindowType::Tumbling => "tumblingwindow",
            WindowType::Hopping => "hoppingwindow",
            WindowType::Sliding => "slidingwindow",
            WindowType::Session => "sessionwindow",
            WindowType::Count => "countwindow",
        }
    }

    pub fn from_func_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "tumblingwindow" => Some(WindowType::Tumbling),
            "hoppingwindow" => Some(WindowType::Hopping),
            "slidingwindow" => Some(WindowType::Sliding),
            "sessionwindow" => Some(WindowType::Session),
            "countwindow" => Some(WindowType::Count),
            _ => None,
        }
    }
}

impl fmt::Display for WindowType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.func_name())
    }
}

/// Time unit literal of a window declaration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeUnit {
    Day,
    Hour,
    Minute,
    Second,
    Millisecond,
}

impl TimeUnit {
    pub fn from_literal(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "dd" => Some(TimeUnit::Day),
            "hh" => Some(TimeUnit::Hour),
            "mi" => Some(TimeUnit::Minute),
            "ss" => Some(TimeUnit::Second),
            "ms" => Some(TimeUnit::Millisecond),
            _ => None,
        }
    }

    pub fn as_millis(&self) -> i64 {
        match self {
            TimeUnit::Day => 24 * 3600 * 1000,
            TimeUnit::Hour => 3600 * 1000,
            TimeUnit::Minute => 60 * 1000,
            TimeUnit::Second => 1000,
            TimeUnit::Millisecond => 1,
        }
    }
}

impl fmt::Display for TimeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TimeUnit::Day => "dd",
            TimeUnit::Hour => "hh",
            TimeUnit::Minute => "mi",
            TimeUnit::Second => "ss",
            TimeUnit::Millisecond => "ms",
        };
        write!(f, "{}", s)
    }
}

/// Window declared in GROUP BY.
///
/// Lengths are normalized to milliseconds for time windows and to tuple
/// counts for count windows. For session windows `length` is the upper bound
/// on a session's lifetime and `interval` is the inactivity gap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Window {
    pub window_type: WindowType,
    pub time_unit: Option<TimeUnit>,
    pub length: i64,
    pub interval: i64,
    /// Sliding windows only: emit this long after the triggering tuple.
    pub delay: i64,
    /// `FILTER(WHERE ...)`
    pub filter: Option<Box<Expr>>,
    /// `OVER(WHEN ...)`
    pub trigger_condition: Option<Box<Expr>>,
}

impl Window {
    pub fn new(window_type: WindowType, time_unit: Option<TimeUnit>, length: i64) -> Self {
        Self {
            window_type,
            time_unit,
            length,
            interval: 0,
            delay: 0,
            filter: None,
            trigger_condition: None,
        }
    }
}

/// Binary operators, including the access operators `->` and `[]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinOp {
    Eq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    BitAnd,
    BitOr,
    BitXor,
    And,
    Or,
    Arrow,
    Subset,
}

impl BinOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            BinOp::Eq => "=",
            BinOp::NotEq => "!=",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Mod => "%",
            BinOp::BitAnd => "&",
            BinOp::BitOr => "|",
            BinOp::BitXor => "^",
            BinOp::And => "AND",
            BinOp::Or => "OR",
            BinOp::Arrow => "->",
            BinOp::Subset => "[]",
        }
    }

    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinOp::Eq | BinOp::NotEq | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge
        )
    }
}

impl fmt::Display for BinOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    Not,
    Neg,
}

/// Function call: `name(args)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Call {
    pub name: String,
    pub args: Vec<Expr>,
}

/// `CASE [value] WHEN cond THEN result ... [ELSE result] END`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseExpr {
    pub value: Option<Box<Expr>>,
    pub when_clauses: Vec<WhenClause>,
    pub else_clause: Option<Box<Expr>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WhenClause {
    pub expr: Expr,
    pub result: Expr,
}

/// Expressions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Integer(i64),
    Number(f64),
    Str(String),
    Bool(bool),
    /// `[stream.]name`
    FieldRef {
        stream: Option<String>,
        name: String,
    },
    /// `meta([stream.]key)`, key `*` selects the whole metadata map
    MetaRef {
        stream: Option<String>,
        name: String,
    },
    /// `*` or `stream.*`
    Wildcard {
        stream: Option<String>,
    },
    Paren(Box<Expr>),
    Unary {
        op: UnaryOp,
        expr: Box<Expr>,
    },
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    /// Right-hand side of `[i]`
    Index(i64),
    /// Right-hand side of `[start:end]`, an absent end reads through the end
    Colon {
        start: i64,
        end: Option<i64>,
    },
    Call(Call),
    Case(CaseExpr),
    Window(Box<Window>),
}

impl Expr {
    pub fn field(name: impl Into<String>) -> Self {
        Expr::FieldRef {
            stream: None,
            name: name.into(),
        }
    }

    pub fn qualified(stream: impl Into<String>, name: impl Into<String>) -> Self {
        Expr::FieldRef {
            stream: Some(stream.into()),
            name: name.into(),
        }
    }

    pub fn binary(op: BinOp, lhs: Expr, rhs: Expr) -> Self {
        Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    pub fn call(name: impl Into<String>, args: Vec<Expr>) -> Self {
        Expr::Call(Call {
            name: name.into(),
            args,
        })
    }

    pub fn is_literal(&self) -> bool {
        matches!(
            self,
            Expr::Integer(_) | Expr::Number(_) | Expr::Str(_) | Expr::Bool(_)
        )
    }

    /// Pre-order traversal over this expression and all of its children.
    pub fn walk<'a>(&'a self, f: &mut dyn FnMut(&'a Expr)) {
        f(self);
        match self {
            Expr::Paren(e) | Expr::Unary { expr: e, .. } => e.walk(f),
            Expr::Binary { lhs, rhs, .. } => {
                lhs.walk(f);
                rhs.walk(f);
            }
            Expr::Call(c) => {
                for a in &c.args {
                    a.walk(f);
                }
            }
            Expr::Case(c) => {
                if let Some(v) = &c.value {
                    v.walk(f);
                }
                for w in &c.when_clauses {
                    w.expr.walk(f);
                    w.result.walk(f);
                }
                if let Some(e) = &c.else_clause {
                    e.walk(f);
                }
            }
            Expr::Window(w) => {
                if let Some(e) = &w.filter {
                    e.walk(f);
                }
                if let Some(e) = &w.trigger_condition {
                    e.walk(f);
                }
            }
            _ => {}
        }
    }

    /// Pre-order mutable traversal over the same children as [`Expr::walk`].
    pub fn walk_mut(&mut self, f: &mut dyn FnMut(&mut Expr)) {
        f(self);
        match self {
            Expr::Paren(e) | Expr::Unary { expr: e, .. } => e.walk_mut(f),
            Expr::Binary { lhs, rhs, .. } => {
                lhs.walk_mut(f);
                rhs.walk_mut(f);
            }
            Expr::Call(c) => {
                for a in &mut c.args {
                    a.walk_mut(f);
                }
            }
            Expr::Case(c) => {
                if let Some(v) = &mut c.value {
                    v.walk_mut(f);
                }
                for w in &mut c.when_clauses {
                    w.expr.walk_mut(f);
                    w.result.walk_mut(f);
                }
                if let Some(e) = &mut c.else_clause {
                    e.walk_mut(f);
                }
            }
            Expr::Window(w) => {
                if let Some(e) = &mut w.filter {
                    e.walk_mut(f);
                }
                if let Some(e) = &mut w.trigger_condition {
                    e.walk_mut(f);
                }
            }
            _ => {}
        }
    }

    /// Stream qualifiers of all field references, in first-seen order.
    pub fn referenced_streams(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        self.walk(&mut |e| {
            if let Expr::FieldRef {
                stream: Some(s), ..
            } = e
            {
                if s != DEFAULT_STREAM && !out.iter().any(|o| o == s) {
                    out.push(s.clone());
                }
            }
        });
        out
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Integer(n) => write!(f, "{}", n),
            Expr::Number(n) => write!(f, "{}", n),
            Expr::Str(s) => write!(f, "\"{}\"", s),
            Expr::Bool(b) => write!(f, "{}", b),
            Expr::FieldRef { stream, name } => match stream {
                Some(s) => write!(f, "{}.{}", s, name),
                None => write!(f, "{}", name),
            },
            Expr::MetaRef { stream, name } => match stream {
                Some(s) => write!(f, "meta({}.{})", s, name),
                None => write!(f, "meta({})", name),
            },
            Expr::Wildcard { stream } => match stream {
                Some(s) => write!(f, "{}.*", s),
                None => write!(f, "*"),
            },
            Expr::Paren(e) => write!(f, "({})", e),
            Expr::Unary { op, expr } => match op {
                UnaryOp::Not => write!(f, "NOT {}", expr),
                UnaryOp::Neg => write!(f, "-{}", expr),
            },
            Expr::Binary { op, lhs, rhs } => match op {
                BinOp::Subset => write!(f, "{}[{}]", lhs, rhs),
                BinOp::Arrow => write!(f, "{}->{}", lhs, rhs),
                _ => write!(f, "{} {} {}", lhs, op, rhs),
            },
            Expr::Index(i) => write!(f, "{}", i),
            Expr::Colon { start, end } => match end {
                Some(e) => write!(f, "{}:{}", start, e),
                None => write!(f, "{}:", start),
            },
            Expr::Call(c) => {
                write!(f, "{}(", c.name)?;
                for (i, a) in c.args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", a)?;
                }
                write!(f, ")")
            }
            Expr::Case(c) => {
                write!(f, "CASE")?;
                if let Some(v) = &c.value {
                    write!(f, " {}", v)?;
                }
                for w in &c.when_clauses {
                    write!(f, " WHEN {} THEN {}", w.expr, w.result)?;
                }
                if let Some(e) = &c.else_clause {
                    write!(f, " ELSE {}", e)?;
                }
                write!(f, " END")
            }
            Expr::Window(w) => match w.time_unit {
                Some(unit) if w.interval > 0 => write!(
                    f,
                    "{}({}, {}, {})",
                    w.window_type,
                    unit,
                    w.length / unit.as_millis(),
                    w.interval / unit.as_millis()
                ),
                Some(unit) => write!(
                    f,
                    "{}({}, {})",
                    w.window_type,
                    unit,
                    w.length / unit.as_millis()
                ),
                None if w.interval > 0 => {
                    write!(f, "{}({}, {})", w.window_type, w.length, w.interval)
                }
                None => write!(f, "{}({})", w.window_type, w.length),
            },
        }
    }
}

// ============================================================================
// DDL
// ============================================================================

/// `CREATE STREAM name (fields) WITH (options)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamStmt {
    pub name: String,
    /// Empty for schemaless streams
    pub fields: Vec<StreamField>,
    pub options: StreamOptions,
}

impl StreamStmt {
    pub fn is_schemaless(&self) -> bool {
        self.fields.is_empty()
    }

    /// Case-insensitive lookup of a declared field.
    pub fn field(&self, name: &str) -> Option<&StreamField> {
        self.fields
            .iter()
            .find(|f| f.name.eq_ignore_ascii_case(name))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamField {
    pub name: String,
    pub field_type: FieldType,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StreamOptions {
    pub datasource: Option<String>,
    pub format: Option<String>,
    pub key: Option<String>,
    pub conf_key: Option<String>,
    pub timestamp: Option<String>,
    pub timestamp_format: Option<String>,
    pub strict_validation: bool,
    pub source_type: Option<String>,
}
