//! Semantic validation for rill SQL statements.
//!
//! Runs after parsing and before planning:
//! - builtin function arity and literal argument types
//! - aggregate placement in WHERE, HAVING and GROUP BY
//! - alias uniqueness and a single window per statement
//!
//! Checks that need stream schemas (field resolution, join stream names)
//! belong to the planner.

pub mod builtins;
mod checks;
mod suggest;

pub use checks::{alias_map, all_aggregate, is_aggregate, validate_funcs, AliasMap};

use crate::ast::SelectStatement;

/// Severity of a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

/// A single diagnostic produced by semantic validation.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    pub code: Option<&'static str>,
    pub hint: Option<String>,
}

/// Result of semantic validation.
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub diagnostics: Vec<Diagnostic>,
}

impl ValidationResult {
    /// Returns true if there are errors (warnings are OK).
    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.severity == Severity::Error)
    }

    /// The first error, which is what rule creation reports.
    pub fn first_error(&self) -> Option<&Diagnostic> {
        self.diagnostics
            .iter()
            .find(|d| d.severity == Severity::Error)
    }

    /// Format all diagnostics, one per line with an optional hint line.
    pub fn format(&self) -> String {
        let mut out = String::new();
        for d in &self.diagnostics {
            let prefix = match d.severity {
                Severity::Error => "error",
                Severity::Warning => "warning",
            };
            let code_str = d.code.map(|c| format!("[{}] ", c)).unwrap_or_default();
            out.push_str(&format!("{}: {}{}\n", prefix, code_str, d.message));
            if let Some(ref hint) = d.hint {
                out.push_str(&format!("  hint: {}\n", hint));
            }
        }
        out
    }
}

/// Validate a parsed SELECT statement.
pub fn validate(stmt: &SelectStatement) -> ValidationResult {
    let mut diagnostics = Vec::new();
    checks::check_calls(stmt, &mut diagnostics);
    checks::check_fields(stmt, &mut diagnostics);
    checks::check_aggregates(stmt, &mut diagnostics);
    checks::check_analytic(stmt, &mut diagnostics);
    ValidationResult { diagnostics }
}
