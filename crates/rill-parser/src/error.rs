//! Parser error types

use rill_core::Span;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParseError {
    #[error("Unexpected token at position {position}: expected {expected}, found {found}")]
    UnexpectedToken {
        position: usize,
        expected: String,
        found: String,
    },

    #[error("Unexpected end of input")]
    UnexpectedEof,

    #[error("Invalid number literal: {0}")]
    InvalidNumber(String),

    /// Grammar and validation errors whose text is shown to users as-is.
    #[error("{message}")]
    Custom { span: Span, message: String },
}

impl ParseError {
    pub fn custom(span: Span, message: impl Into<String>) -> Self {
        ParseError::Custom {
            span,
            message: message.into(),
        }
    }

    /// Byte offset the error points at, if known.
    pub fn position(&self) -> Option<usize> {
        match self {
            ParseError::UnexpectedToken { position, .. } => Some(*position),
            ParseError::Custom { span, .. } => Some(span.start),
            _ => None,
        }
    }
}

pub type ParseResult<T> = Result<T, ParseError>;
