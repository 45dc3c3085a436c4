//! # Rill Core
//!
//! Foundational types for the rill streaming SQL engine.
//!
//! This crate holds the data structures shared by the parser and the
//! runtime:
//!
//! - **Values**: the closed set of runtime value variants carried by tuples
//! - **AST**: the semantic model of `SELECT` and `CREATE STREAM` statements
//! - **Field types**: declared stream schema types
//! - **Validation**: builtin function signatures and clause rules
//! - **Source Spans**: byte ranges used by parse errors
//!
//! ## Quick Start
//!
//! ```rust
//! use rill_core::{Expr, BinOp, Value};
//!
//! let cond = Expr::binary(BinOp::Ge, Expr::field("size"), Expr::Integer(3));
//! assert_eq!(cond.to_string(), "size >= 3");
//!
//! let v = Value::Str("string".into());
//! assert_eq!(v.describe(), "string(string)");
//! ```
//!
//! ## See Also
//!
//! - [`rill_parser`](../rill_parser): Parsing SQL text into this AST
//! - [`rill_runtime`](../rill_runtime): Planning and executing rules

pub mod ast;
pub mod span;
pub mod types;
pub mod validate;
pub mod value;

pub use ast::*;
pub use span::Span;
pub use types::FieldType;
pub use value::{Value, ValueMap};
