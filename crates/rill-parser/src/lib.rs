//! rill SQL parser
//!
//! Hand-written recursive descent over a logos token stream. The entry
//! points are [`parse`] for any statement, [`parse_select`] for rule
//! queries and [`parse_stream`] for `CREATE STREAM` definitions.
//!
//! `parse_select` also runs the semantic checks of
//! [`rill_core::validate`], so a statement it returns is ready for planning.

pub mod error;
pub mod lexer;
pub mod parser;

pub use error::{ParseError, ParseResult};
pub use lexer::Token;
pub use parser::{parse, parse_select, parse_stream};
