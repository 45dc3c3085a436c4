//! Stream field types declared in `CREATE STREAM`

use crate::ast::StreamField;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Declared type of a stream field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldType {
    Bigint,
    Float,
    String,
    Datetime,
    Boolean,
    Bytea,
    Array(Box<FieldType>),
    Struct(Vec<StreamField>),
}

impl FieldType {
    /// Parse a simple type keyword such as `BIGINT`.
    pub fn from_keyword(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "bigint" => Some(FieldType::Bigint),
            "float" => Some(FieldType::Float),
            "string" => Some(FieldType::String),
            "datetime" => Some(FieldType::Datetime),
            "boolean" => Some(FieldType::Boolean),
            "bytea" => Some(FieldType::Bytea),
            _ => None,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, FieldType::Bigint | FieldType::Float)
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::Bigint => write!(f, "bigint"),
            FieldType::Float => write!(f, "float"),
            FieldType::String => write!(f, "string"),
            FieldType::Datetime => write!(f, "datetime"),
            FieldType::Boolean => write!(f, "boolean"),
            FieldType::Bytea => write!(f, "bytea"),
            FieldType::Array(t) => write!(f, "array({})", t),
            FieldType::Struct(fields) => {
                write!(f, "struct(")?;
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{} {}", field.name, field.field_type)?;
                }
                write!(f, ")")
            }
        }
    }
}
