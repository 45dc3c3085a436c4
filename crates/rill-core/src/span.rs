//! Source location tracking for SQL text

use serde::{Deserialize, Serialize};

/// Byte range in the SQL source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn merge(self, other: Span) -> Span {
        Span {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }

    /// 1-based line and column of the span start within `source`.
    pub fn line_col(&self, source: &str) -> (usize, usize) {
        let upto = &source[..self.start.min(source.len())];
        let line = upto.matches('\n').count() + 1;
        let col = match upto.rfind('\n') {
            Some(nl) => upto[nl + 1..].chars().count() + 1,
            None => upto.chars().count() + 1,
        };
        (line, col)
    }

    /// Source text covered by the span, empty when out of range.
    pub fn text<'a>(&self, source: &'a str) -> &'a str {
        source.get(self.start..self.end).unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_col_single_line() {
        let sql = "SELECT a FROM demo";
        assert_eq!(Span::new(9, 13).line_col(sql), (1, 10));
        assert_eq!(Span::new(9, 13).text(sql), "FROM");
    }

    #[test]
    fn test_line_col_multi_line() {
        let sql = "SELECT a\nFROM demo\nWHERE a > 1";
        let start = sql.find("WHERE").unwrap();
        assert_eq!(Span::new(start, start + 5).line_col(sql), (3, 1));
    }

    #[test]
    fn test_merge() {
        assert_eq!(Span::new(4, 6).merge(Span::new(1, 5)), Span::new(1, 6));
    }
}
