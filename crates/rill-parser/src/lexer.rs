//! Lexer for rill SQL using Logos

use logos::Logos;
use std::fmt;

/// Token type for rill SQL. Keywords are case-insensitive.
#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r\n\f]+")]
#[logos(skip r"--[^\n]*")]
#[logos(skip r"/\*([^*]|\*[^/])*\*/")]
pub enum Token {
    // === Keywords ===
    #[token("select", ignore(ascii_case))]
    Select,
    #[token("from", ignore(ascii_case))]
    From,
    #[token("where", ignore(ascii_case))]
    Where,
    #[token("group", ignore(ascii_case))]
    Group,
    #[token("by", ignore(ascii_case))]
    By,
    #[token("having", ignore(ascii_case))]
    Having,
    #[token("order", ignore(ascii_case))]
    Order,
    #[token("asc", ignore(ascii_case))]
    Asc,
    #[token("desc", ignore(ascii_case))]
    Desc,
    #[token("as", ignore(ascii_case))]
    As,

    #[token("join", ignore(ascii_case))]
    Join,
    #[token("inner", ignore(ascii_case))]
    Inner,
    #[token("left", ignore(ascii_case))]
    Left,
    #[token("right", ignore(ascii_case))]
    Right,
    #[token("full", ignore(ascii_case))]
    Full,
    #[token("cross", ignore(ascii_case))]
    Cross,
    #[token("on", ignore(ascii_case))]
    On,

    #[token("and", ignore(ascii_case))]
    And,
    #[token("or", ignore(ascii_case))]
    Or,
    #[token("not", ignore(ascii_case))]
    Not,
    #[token("true", ignore(ascii_case))]
    True,
    #[token("false", ignore(ascii_case))]
    False,

    #[token("case", ignore(ascii_case))]
    Case,
    #[token("when", ignore(ascii_case))]
    When,
    #[token("then", ignore(ascii_case))]
    Then,
    #[token("else", ignore(ascii_case))]
    Else,
    #[token("end", ignore(ascii_case))]
    End,

    #[token("filter", ignore(ascii_case))]
    Filter,
    #[token("over", ignore(ascii_case))]
    Over,

    #[token("create", ignore(ascii_case))]
    Create,
    #[token("stream", ignore(ascii_case))]
    Stream,
    #[token("with", ignore(ascii_case))]
    With,

    // === Operators ===
    #[token("=")]
    Eq,
    #[token("!=")]
    #[token("<>")]
    NotEq,
    #[token("<")]
    Lt,
    #[token("<=")]
    Le,
    #[token(">")]
    Gt,
    #[token(">=")]
    Ge,
    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,
    #[token("%")]
    Percent,
    #[token("&")]
    Ampersand,
    #[token("|")]
    Pipe,
    #[token("^")]
    Caret,
    #[token("->")]
    Arrow,
    #[token(".")]
    Dot,

    // === Delimiters ===
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    #[token(",")]
    Comma,
    #[token(":")]
    Colon,
    #[token(";")]
    Semicolon,

    // === Literals ===
    #[regex(r"[0-9]+", |lex| lex.slice().parse::<i64>().ok())]
    Integer(i64),

    #[regex(r"[0-9]+\.[0-9]+([eE][+-]?[0-9]+)?", |lex| lex.slice().parse::<f64>().ok())]
    Float(f64),

    #[regex(r#""([^"\\]|\\.)*""#, |lex| {
        let s = lex.slice();
        Some(unescape(&s[1..s.len()-1]))
    })]
    #[regex(r#"'([^'\\]|\\.)*'"#, |lex| {
        let s = lex.slice();
        Some(unescape(&s[1..s.len()-1]))
    })]
    String(String),

    // === Identifiers ===
    #[regex(r"[a-zA-Z_][a-zA-Z0-9_]*", |lex| Some(lex.slice().to_string()))]
    Ident(String),

    /// Backtick-quoted identifier, may contain any character but a backtick
    #[regex(r"`[^`]*`", |lex| {
        let s = lex.slice();
        Some(s[1..s.len()-1].to_string())
    })]
    QuotedIdent(String),

    // === Special ===
    Eof,
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Select => write!(f, "SELECT"),
            Token::From => write!(f, "FROM"),
            Token::Where => write!(f, "WHERE"),
            Token::Group => write!(f, "GROUP"),
            Token::By => write!(f, "BY"),
            Token::Having => write!(f, "HAVING"),
            Token::Order => write!(f, "ORDER"),
            Token::Asc => write!(f, "ASC"),
            Token::Desc => write!(f, "DESC"),
            Token::As => write!(f, "AS"),
            Token::Join => write!(f, "JOIN"),
            Token::Inner => write!(f, "INNER"),
            Token::Left => write!(f, "LEFT"),
            Token::Right => write!(f, "RIGHT"),
            Token::Full => write!(f, "FULL"),
            Token::Cross => write!(f, "CROSS"),
            Token::On => write!(f, "ON"),
            Token::And => write!(f, "AND"),
            Token::Or => write!(f, "OR"),
            Token::Not => write!(f, "NOT"),
            Token::True => write!(f, "TRUE"),
            Token::False => write!(f, "FALSE"),
            Token::Case => write!(f, "CASE"),
            Token::When => write!(f, "WHEN"),
            Token::Then => write!(f, "THEN"),
            Token::Else => write!(f, "ELSE"),
            Token::End => write!(f, "END"),
            Token::Filter => write!(f, "FILTER"),
            Token::Over => write!(f, "OVER"),
            Token::Create => write!(f, "CREATE"),
            Token::Stream => write!(f, "STREAM"),
            Token::With => write!(f, "WITH"),
            Token::Eq => write!(f, "="),
            Token::NotEq => write!(f, "!="),
            Token::Lt => write!(f, "<"),
            Token::Le => write!(f, "<="),
            Token::Gt => write!(f, ">"),
            Token::Ge => write!(f, ">="),
            Token::Plus => write!(f, "+"),
            Token::Minus => write!(f, "-"),
            Token::Star => write!(f, "*"),
            Token::Slash => write!(f, "/"),
            Token::Percent => write!(f, "%"),
            Token::Ampersand => write!(f, "&"),
            Token::Pipe => write!(f, "|"),
            Token::Caret => write!(f, "^"),
            Token::Arrow => write!(f, "->"),
            Token::Dot => write!(f, "."),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
            Token::LBracket => write!(f, "["),
            Token::RBracket => write!(f, "]"),
            Token::Comma => write!(f, ","),
            Token::Colon => write!(f, ":"),
            Token::Semicolon => write!(f, ";"),
            Token::Integer(n) => write!(f, "{}", n),
            Token::Float(n) => write!(f, "{}", n),
            Token::String(s) => write!(f, "\"{}\"", s),
            Token::Ident(s) => write!(f, "{}", s),
            Token::QuotedIdent(s) => write!(f, "`{}`", s),
            Token::Eof => write!(f, "EOF"),
        }
    }
}

/// Spanned token with position information
#[derive(Debug, Clone, PartialEq)]
pub struct SpannedToken {
    pub token: Token,
    pub start: usize,
    pub end: usize,
}

/// Lexer wrapper that produces spanned tokens
pub struct Lexer<'source> {
    inner: logos::Lexer<'source, Token>,
    peeked: Option<SpannedToken>,
    eof_emitted: bool,
}

impl<'source> Lexer<'source> {
    pub fn new(source: &'source str) -> Self {
        Self {
            inner: Token::lexer(source),
            peeked: None,
            eof_emitted: false,
        }
    }

    pub fn peek(&mut self) -> Option<&SpannedToken> {
        if self.peeked.is_none() {
            self.peeked = self.next_token();
        }
        self.peeked.as_ref()
    }

    fn next_token(&mut self) -> Option<SpannedToken> {
        match self.inner.next() {
            Some(Ok(token)) => {
                let span = self.inner.span();
                Some(SpannedToken {
                    token,
                    start: span.start,
                    end: span.end,
                })
            }
            // Unknown characters surface as identifiers so the parser reports them in context
            Some(Err(_)) => {
                let span = self.inner.span();
                Some(SpannedToken {
                    token: Token::Ident(self.inner.slice().to_string()),
                    start: span.start,
                    end: span.end,
                })
            }
            None if !self.eof_emitted => {
                self.eof_emitted = true;
                let pos = self.inner.span().end;
                Some(SpannedToken {
                    token: Token::Eof,
                    start: pos,
                    end: pos,
                })
            }
            None => None,
        }
    }
}

impl<'source> Iterator for Lexer<'source> {
    type Item = SpannedToken;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(peeked) = self.peeked.take() {
            return Some(peeked);
        }
        self.next_token()
    }
}

/// Tokenize a source string into a vector of spanned tokens
pub fn tokenize(source: &str) -> Vec<SpannedToken> {
    Lexer::new(source).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(src: &str) -> Vec<Token> {
        tokenize(src).into_iter().map(|t| t.token).collect()
    }

    #[test]
    fn test_keywords_ignore_case() {
        assert_eq!(
            tokens("SELECT select SeLeCt from WHERE"),
            vec![
                Token::Select,
                Token::Select,
                Token::Select,
                Token::From,
                Token::Where,
                Token::Eof
            ]
        );
    }

    #[test]
    fn test_identifiers_are_not_keywords() {
        assert_eq!(
            tokens("selection fromage"),
            vec![
                Token::Ident("selection".into()),
                Token::Ident("fromage".into()),
                Token::Eof
            ]
        );
    }

    #[test]
    fn test_literals() {
        assert_eq!(
            tokens(r#"42 3.5 "red" 'blue' `a.b.c`"#),
            vec![
                Token::Integer(42),
                Token::Float(3.5),
                Token::String("red".into()),
                Token::String("blue".into()),
                Token::QuotedIdent("a.b.c".into()),
                Token::Eof
            ]
        );
    }

    #[test]
    fn test_operators() {
        assert_eq!(
            tokens("= != <> < <= > >= -> & | ^ %"),
            vec![
                Token::Eq,
                Token::NotEq,
                Token::NotEq,
                Token::Lt,
                Token::Le,
                Token::Gt,
                Token::Ge,
                Token::Arrow,
                Token::Ampersand,
                Token::Pipe,
                Token::Caret,
                Token::Percent,
                Token::Eof
            ]
        );
    }

    #[test]
    fn test_comments_are_skipped() {
        assert_eq!(
            tokens("select -- trailing\n a /* block */ from"),
            vec![
                Token::Select,
                Token::Ident("a".into()),
                Token::From,
                Token::Eof
            ]
        );
    }

    #[test]
    fn test_string_escapes() {
        assert_eq!(
            tokens(r#""say \"hi\"\n""#),
            vec![Token::String("say \"hi\"\n".into()), Token::Eof]
        );
    }

    #[test]
    fn test_spanned_positions() {
        let toks = tokenize("select a");
        assert_eq!((toks[0].start, toks[0].end), (0, 6));
        assert_eq!((toks[1].start, toks[1].end), (7, 8));
        assert_eq!(toks[2].token, Token::Eof);
    }

    #[test]
    fn test_lexer_peek() {
        let mut lexer = Lexer::new("a b");
        assert_eq!(
            lexer.peek().map(|t| t.token.clone()),
            Some(Token::Ident("a".into()))
        );
        assert_eq!(lexer.next().map(|t| t.token), Some(Token::Ident("a".into())));
        assert_eq!(lexer.next().map(|t| t.token), Some(Token::Ident("b".into())));
    }
}
