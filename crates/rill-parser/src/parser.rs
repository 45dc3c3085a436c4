//! Recursive descent parser for rill SQL
//!
//! One token of lookahead plus the logos peek buffer is enough for the
//! whole grammar. Binary operators use precedence climbing with the levels
//! `OR` < `AND` < comparison < `+ - | ^` < `* / % &`; the access operators
//! `->` and `[]` are postfix and bind tightest.

use crate::error::{ParseError, ParseResult};
use crate::lexer::{Lexer, SpannedToken, Token};
use rill_core::ast::*;
use rill_core::span::Span;
use rill_core::types::FieldType;
use rill_core::validate;

const MAX_NESTING: usize = 64;

/// Parse a single SQL statement.
pub fn parse(source: &str) -> ParseResult<Statement> {
    let mut parser = Parser::new(source);
    parser.parse_statement()
}

/// Parse a `SELECT` statement.
pub fn parse_select(source: &str) -> ParseResult<SelectStatement> {
    let mut parser = Parser::new(source);
    if !parser.check(&Token::Select) {
        return Err(parser.unexpected("SELECT"));
    }
    parser.parse_select_stmt()
}

/// Parse a `CREATE STREAM` statement.
pub fn parse_stream(source: &str) -> ParseResult<StreamStmt> {
    let mut parser = Parser::new(source);
    if !parser.check(&Token::Create) {
        return Err(parser.unexpected("CREATE"));
    }
    parser.parse_create_stream()
}

/// Parser state
pub struct Parser<'source> {
    lexer: Lexer<'source>,
    current: SpannedToken,
    previous: SpannedToken,
    depth: usize,
}

impl<'source> Parser<'source> {
    pub fn new(source: &'source str) -> Self {
        let mut lexer = Lexer::new(source);
        let current = lexer.next().unwrap_or(SpannedToken {
            token: Token::Eof,
            start: 0,
            end: 0,
        });
        Self {
            lexer,
            current: current.clone(),
            previous: current,
            depth: 0,
        }
    }

    fn span(&self) -> Span {
        Span::new(self.current.start, self.current.end)
    }

    fn prev_span(&self) -> Span {
        Span::new(self.previous.start, self.previous.end)
    }

    fn advance(&mut self) {
        self.previous = self.current.clone();
        self.current = self.lexer.next().unwrap_or(SpannedToken {
            token: Token::Eof,
            start: self.previous.end,
            end: self.previous.end,
        });
    }

    fn check(&self, token: &Token) -> bool {
        std::mem::discriminant(&self.current.token) == std::mem::discriminant(token)
    }

    fn peek_is(&mut self, token: &Token) -> bool {
        self.lexer
            .peek()
            .map(|t| std::mem::discriminant(&t.token) == std::mem::discriminant(token))
            .unwrap_or(false)
    }

    fn is_at_end(&self) -> bool {
        matches!(self.current.token, Token::Eof)
    }

    fn unexpected(&self, expected: &str) -> ParseError {
        if self.is_at_end() {
            return ParseError::UnexpectedEof;
        }
        ParseError::UnexpectedToken {
            position: self.current.start,
            expected: expected.to_string(),
            found: format!("{}", self.current.token),
        }
    }

    fn consume(&mut self, expected: &Token, msg: &str) -> ParseResult<SpannedToken> {
        if self.check(expected) {
            let tok = self.current.clone();
            self.advance();
            Ok(tok)
        } else {
            Err(self.unexpected(msg))
        }
    }

    fn match_token(&mut self, token: &Token) -> bool {
        if self.check(token) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn custom(&self, message: impl Into<String>) -> ParseError {
        ParseError::custom(self.span(), message)
    }

    fn parse_identifier(&mut self, what: &str) -> ParseResult<String> {
        match &self.current.token {
            Token::Ident(name) | Token::QuotedIdent(name) => {
                let name = name.clone();
                self.advance();
                Ok(name)
            }
            _ => Err(self.unexpected(what)),
        }
    }

    /// Optional trailing semicolon, then end of input.
    fn finish_statement(&mut self) -> ParseResult<()> {
        self.match_token(&Token::Semicolon);
        if !self.is_at_end() {
            return Err(self.custom(format!(
                "found \"{}\", expected EOF.",
                self.current.token
            )));
        }
        Ok(())
    }

    // ========================================================================
    // Statements
    // ========================================================================

    fn parse_statement(&mut self) -> ParseResult<Statement> {
        match &self.current.token {
            Token::Select => Ok(Statement::Select(self.parse_select_stmt()?)),
            Token::Create => Ok(Statement::CreateStream(self.parse_create_stream()?)),
            _ => Err(self.unexpected("SELECT or CREATE STREAM")),
        }
    }

    fn parse_select_stmt(&mut self) -> ParseResult<SelectStatement> {
        let start = self.span();
        self.consume(&Token::Select, "SELECT")?;
        let fields = self.parse_fields()?;
        self.consume(&Token::From, "FROM")?;
        let sources = vec![self.parse_table()?];
        let joins = self.parse_joins()?;

        let condition = if self.match_token(&Token::Where) {
            Some(self.parse_expr()?)
        } else {
            None
        };

        let dimensions = if self.match_token(&Token::Group) {
            self.consume(&Token::By, "BY")?;
            self.parse_dimensions()?
        } else {
            Vec::new()
        };

        let having = if self.match_token(&Token::Having) {
            Some(self.parse_expr()?)
        } else {
            None
        };

        let sort_fields = if self.match_token(&Token::Order) {
            self.consume(&Token::By, "BY")?;
            self.parse_sort_fields()?
        } else {
            Vec::new()
        };

        self.finish_statement()?;

        let stmt = SelectStatement {
            fields,
            sources,
            joins,
            condition,
            dimensions,
            having,
            sort_fields,
        };
        let result = validate::validate(&stmt);
        if let Some(d) = result.first_error() {
            return Err(ParseError::custom(
                start.merge(self.prev_span()),
                d.message.clone(),
            ));
        }
        Ok(stmt)
    }

    // ========================================================================
    // SELECT clauses
    // ========================================================================

    fn parse_fields(&mut self) -> ParseResult<Vec<Field>> {
        let mut fields = vec![self.parse_field()?];
        while self.match_token(&Token::Comma) {
            fields.push(self.parse_field()?);
        }
        Ok(fields)
    }

    fn parse_field(&mut self) -> ParseResult<Field> {
        let expr = if self.match_token(&Token::Star) {
            Expr::Wildcard { stream: None }
        } else {
            self.parse_expr()?
        };
        let alias = if self.match_token(&Token::As) {
            Some(self.parse_identifier("alias")?)
        } else {
            None
        };
        Ok(Field {
            name: derived_name(&expr),
            alias,
            expr,
        })
    }

    fn parse_table(&mut self) -> ParseResult<Table> {
        let name = self.parse_identifier("stream name")?;
        let alias = self.parse_optional_alias()?;
        Ok(Table { name, alias })
    }

    fn parse_optional_alias(&mut self) -> ParseResult<Option<String>> {
        if self.match_token(&Token::As) {
            return Ok(Some(self.parse_identifier("alias")?));
        }
        if let Token::Ident(name) = &self.current.token {
            let name = name.clone();
            self.advance();
            return Ok(Some(name));
        }
        Ok(None)
    }

    fn parse_joins(&mut self) -> ParseResult<Vec<Join>> {
        let mut joins = Vec::new();
        loop {
            let join_type = match &self.current.token {
                Token::Join => {
                    self.advance();
                    JoinType::Inner
                }
                Token::Inner | Token::Left | Token::Right | Token::Full | Token::Cross => {
                    let jt = match self.current.token {
                        Token::Left => JoinType::Left,
                        Token::Right => JoinType::Right,
                        Token::Full => JoinType::Full,
                        Token::Cross => JoinType::Cross,
                        _ => JoinType::Inner,
                    };
                    self.advance();
                    if !self.match_token(&Token::Join) {
                        return Err(self.custom(format!(
                            "found \"{}\", expected JOIN key word.",
                            self.current.token
                        )));
                    }
                    jt
                }
                _ => break,
            };

            let name = self.parse_identifier("stream name")?;
            let alias = self.parse_optional_alias()?;
            let expr = if self.match_token(&Token::On) {
                if join_type == JoinType::Cross {
                    return Err(ParseError::custom(
                        self.prev_span(),
                        "On expression is not required for cross join type.",
                    ));
                }
                Some(self.parse_expr()?)
            } else {
                None
            };
            joins.push(Join {
                name,
                alias,
                join_type,
                expr,
            });
        }
        Ok(joins)
    }

    fn parse_dimensions(&mut self) -> ParseResult<Vec<Dimension>> {
        let mut dims = vec![self.parse_dimension()?];
        while self.match_token(&Token::Comma) {
            dims.push(self.parse_dimension()?);
        }
        Ok(dims)
    }

    fn parse_dimension(&mut self) -> ParseResult<Dimension> {
        let start = self.span();
        let expr = self.parse_expr()?;
        let window_type = match &expr {
            Expr::Call(c) => WindowType::from_func_name(&c.name),
            _ => None,
        };
        let (Some(window_type), Expr::Call(call)) = (window_type, &expr) else {
            return Ok(Dimension { expr });
        };

        let mut window = convert_window(window_type, &call.args)
            .map_err(|msg| ParseError::custom(start.merge(self.prev_span()), msg))?;

        loop {
            if self.match_token(&Token::Filter) {
                if !self.match_token(&Token::LParen) {
                    return Err(self.custom(format!(
                        "Found \"{}\" after FILTER, expect parentheses.",
                        self.current.token
                    )));
                }
                if !self.match_token(&Token::Where) {
                    return Err(self.custom(format!(
                        "Found \"{}\" after FILTER(, expect WHERE.",
                        self.current.token
                    )));
                }
                let cond = self.parse_expr()?;
                if !self.match_token(&Token::RParen) {
                    return Err(self.custom(format!(
                        "Found \"{}\" after FILTER, expect right parentheses.",
                        self.current.token
                    )));
                }
                window.filter = Some(Box::new(cond));
            } else if self.match_token(&Token::Over) {
                self.consume(&Token::LParen, "( after OVER")?;
                self.consume(&Token::When, "WHEN")?;
                let cond = self.parse_expr()?;
                self.consume(&Token::RParen, ")")?;
                window.trigger_condition = Some(Box::new(cond));
            } else {
                break;
            }
        }

        Ok(Dimension {
            expr: Expr::Window(Box::new(window)),
        })
    }

    fn parse_sort_fields(&mut self) -> ParseResult<Vec<SortField>> {
        let mut fields = Vec::new();
        loop {
            let expr = self.parse_expr()?;
            let ascending = if self.match_token(&Token::Desc) {
                false
            } else {
                self.match_token(&Token::Asc);
                true
            };
            let stream = match &expr {
                Expr::FieldRef { stream, .. } => stream.clone(),
                _ => None,
            };
            fields.push(SortField {
                name: derived_name(&expr),
                stream,
                ascending,
                expr,
            });
            if !self.match_token(&Token::Comma) {
                break;
            }
        }
        Ok(fields)
    }

    // ========================================================================
    // Expressions
    // ========================================================================

    pub fn parse_expr(&mut self) -> ParseResult<Expr> {
        self.parse_binary(1)
    }

    fn binary_op(&self) -> Option<(BinOp, u8)> {
        let op = match self.current.token {
            Token::Or => (BinOp::Or, 1),
            Token::And => (BinOp::And, 2),
            Token::Eq => (BinOp::Eq, 3),
            Token::NotEq => (BinOp::NotEq, 3),
            Token::Lt => (BinOp::Lt, 3),
            Token::Le => (BinOp::Le, 3),
            Token::Gt => (BinOp::Gt, 3),
            Token::Ge => (BinOp::Ge, 3),
            Token::Plus => (BinOp::Add, 4),
            Token::Minus => (BinOp::Sub, 4),
            Token::Pipe => (BinOp::BitOr, 4),
            Token::Caret => (BinOp::BitXor, 4),
            Token::Star => (BinOp::Mul, 5),
            Token::Slash => (BinOp::Div, 5),
            Token::Percent => (BinOp::Mod, 5),
            Token::Ampersand => (BinOp::BitAnd, 5),
            _ => return None,
        };
        Some(op)
    }

    fn parse_binary(&mut self, min_prec: u8) -> ParseResult<Expr> {
        let mut lhs = self.parse_unary()?;
        while let Some((op, prec)) = self.binary_op() {
            if prec < min_prec {
                break;
            }
            self.advance();
            let rhs = self.parse_binary(prec + 1)?;
            lhs = Expr::binary(op, lhs, rhs);
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> ParseResult<Expr> {
        if self.depth >= MAX_NESTING {
            return Err(self.custom("expression is nested too deeply"));
        }
        self.depth += 1;
        let result = self.parse_unary_inner();
        self.depth -= 1;
        result
    }

    fn parse_unary_inner(&mut self) -> ParseResult<Expr> {
        if self.match_token(&Token::Not) {
            let expr = self.parse_binary(3)?;
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                expr: Box::new(expr),
            });
        }
        if self.match_token(&Token::Minus) {
            let expr = self.parse_unary()?;
            return Ok(match expr {
                Expr::Integer(n) => Expr::Integer(-n),
                Expr::Number(n) => Expr::Number(-n),
                other => Expr::Unary {
                    op: UnaryOp::Neg,
                    expr: Box::new(other),
                },
            });
        }
        let primary = self.parse_primary()?;
        self.parse_postfix(primary)
    }

    fn parse_postfix(&mut self, mut expr: Expr) -> ParseResult<Expr> {
        loop {
            if self.match_token(&Token::Arrow) {
                let name = self.parse_identifier("field name after ->")?;
                expr = Expr::binary(BinOp::Arrow, expr, Expr::field(name));
            } else if self.match_token(&Token::LBracket) {
                let access = self.parse_bracket()?;
                expr = Expr::binary(BinOp::Subset, expr, access);
            } else {
                return Ok(expr);
            }
        }
    }

    fn parse_signed_int(&mut self) -> Option<i64> {
        let negative = if self.check(&Token::Minus) {
            self.advance();
            true
        } else {
            false
        };
        match self.current.token {
            Token::Integer(n) => {
                self.advance();
                Some(if negative { -n } else { n })
            }
            _ => None,
        }
    }

    /// Body of `[i]`, `[start:end]`, `[:end]` or `[start:]`; the `[` is consumed.
    fn parse_bracket(&mut self) -> ParseResult<Expr> {
        let start = if self.check(&Token::Colon) {
            0
        } else {
            match self.parse_signed_int() {
                Some(n) => n,
                None => {
                    return Err(self.custom(format!(
                        "The start index {} is not an int value in bracket expression.",
                        self.current.token
                    )))
                }
            }
        };

        if self.match_token(&Token::RBracket) {
            return Ok(Expr::Index(start));
        }
        if !self.match_token(&Token::Colon) {
            return Err(self.custom(format!(
                "Unexpected token \"{}\". when parsing bracket expressions.",
                self.current.token
            )));
        }
        if self.match_token(&Token::RBracket) {
            return Ok(Expr::Colon { start, end: None });
        }
        let end = match self.parse_signed_int() {
            Some(n) => n,
            None => {
                return Err(self.custom(format!(
                    "The end index {} is not an int value in bracket expression.",
                    self.current.token
                )))
            }
        };
        if !self.match_token(&Token::RBracket) {
            return Err(self.custom(format!(
                "Found \"{}\", expected right bracket.",
                self.current.token
            )));
        }
        Ok(Expr::Colon {
            start,
            end: Some(end),
        })
    }

    fn parse_primary(&mut self) -> ParseResult<Expr> {
        match &self.current.token {
            Token::Integer(n) => {
                let n = *n;
                self.advance();
                Ok(Expr::Integer(n))
            }
            Token::Float(n) => {
                let n = *n;
                if !n.is_finite() {
                    return Err(ParseError::InvalidNumber(n.to_string()));
                }
                self.advance();
                Ok(Expr::Number(n))
            }
            Token::String(s) => {
                let s = s.clone();
                self.advance();
                Ok(Expr::Str(s))
            }
            Token::True => {
                self.advance();
                Ok(Expr::Bool(true))
            }
            Token::False => {
                self.advance();
                Ok(Expr::Bool(false))
            }
            Token::LParen => {
                self.advance();
                let inner = self.parse_expr()?;
                if !self.match_token(&Token::RParen) {
                    return Err(self.custom(format!(
                        "found \"{}\", expected right paren.",
                        self.current.token
                    )));
                }
                Ok(Expr::Paren(Box::new(inner)))
            }
            Token::Case => self.parse_case(),
            Token::QuotedIdent(name) => {
                let name = name.clone();
                self.advance();
                Ok(Expr::field(name))
            }
            Token::Ident(name) => {
                let name = name.clone();
                self.advance();
                if self.check(&Token::LParen) {
                    return self.parse_call(name);
                }
                if self.check(&Token::Dot) {
                    self.advance();
                    if self.match_token(&Token::Star) {
                        return Ok(Expr::Wildcard { stream: Some(name) });
                    }
                    let field = self.parse_identifier("field name")?;
                    return Ok(Expr::qualified(name, field));
                }
                Ok(Expr::field(name))
            }
            Token::Eof => Err(ParseError::UnexpectedEof),
            _ => Err(self.custom(format!(
                "found \"{}\", expected expression.",
                self.current.token
            ))),
        }
    }

    /// Call arguments; the function name is consumed and `(` is current.
    fn parse_call(&mut self, name: String) -> ParseResult<Expr> {
        let name = name.to_ascii_lowercase();
        self.consume(&Token::LParen, "(")?;

        if name == "meta" {
            let meta = if self.match_token(&Token::Star) {
                Expr::MetaRef {
                    stream: None,
                    name: "*".to_string(),
                }
            } else {
                let first = self.parse_identifier("metadata key")?;
                if self.match_token(&Token::Dot) {
                    let key = self.parse_identifier("metadata key")?;
                    Expr::MetaRef {
                        stream: Some(first),
                        name: key,
                    }
                } else {
                    Expr::MetaRef {
                        stream: None,
                        name: first,
                    }
                }
            };
            self.consume(&Token::RParen, ")")?;
            return Ok(meta);
        }

        let mut args = Vec::new();
        if !self.check(&Token::RParen) {
            loop {
                if self.check(&Token::Star)
                    && (self.peek_is(&Token::RParen) || self.peek_is(&Token::Comma))
                {
                    self.advance();
                    args.push(Expr::Wildcard { stream: None });
                } else {
                    args.push(self.parse_expr()?);
                }
                if !self.match_token(&Token::Comma) {
                    break;
                }
            }
        }
        if !self.match_token(&Token::RParen) {
            return Err(self.custom(format!(
                "found function call \"{}\", expected ), but with \"{}\".",
                name, self.current.token
            )));
        }
        Ok(Expr::Call(Call { name, args }))
    }

    fn parse_case(&mut self) -> ParseResult<Expr> {
        self.consume(&Token::Case, "CASE")?;
        let value = if self.check(&Token::When) {
            None
        } else {
            Some(Box::new(self.parse_expr()?))
        };

        let mut when_clauses = Vec::new();
        while self.match_token(&Token::When) {
            let expr = self.parse_expr()?;
            if value.is_none() && matches!(expr, Expr::Integer(_) | Expr::Number(_) | Expr::Str(_))
            {
                return Err(ParseError::custom(
                    self.prev_span(),
                    "invalid CASE expression, WHEN expression must be a bool condition",
                ));
            }
            if !self.match_token(&Token::Then) {
                return Err(self.custom("invalid CASE expression, THEN expected after WHEN"));
            }
            let result = self.parse_expr()?;
            when_clauses.push(WhenClause { expr, result });
        }

        let else_clause = if self.check(&Token::Else) {
            if when_clauses.is_empty() {
                return Err(self.custom("invalid CASE expression, WHEN expected before ELSE"));
            }
            self.advance();
            Some(Box::new(self.parse_expr()?))
        } else {
            None
        };

        if !self.check(&Token::End) {
            return Err(self.custom("invalid CASE expression, END expected"));
        }
        if when_clauses.is_empty() {
            return Err(self.custom("invalid CASE expression, WHEN expected before END"));
        }
        self.advance();

        Ok(Expr::Case(CaseExpr {
            value,
            when_clauses,
            else_clause,
        }))
    }

    // ========================================================================
    // CREATE STREAM
    // ========================================================================

    fn parse_create_stream(&mut self) -> ParseResult<StreamStmt> {
        self.consume(&Token::Create, "CREATE")?;
        if !self.match_token(&Token::Stream) {
            return Err(self.custom(format!(
                "found \"{}\", expected keyword stream.",
                self.current.token
            )));
        }
        let name = self.parse_identifier("stream name")?;
        if !self.match_token(&Token::LParen) {
            return Err(self.custom(format!(
                "found \"{}\", expected lparen after stream name.",
                self.current.token
            )));
        }
        let fields = self.parse_stream_fields()?;

        let options = if self.match_token(&Token::With) {
            self.parse_stream_options()?
        } else {
            StreamOptions::default()
        };
        self.finish_statement()?;

        let stmt = StreamStmt {
            name,
            fields,
            options,
        };
        validate_stream(&stmt).map_err(|msg| ParseError::custom(self.prev_span(), msg))?;
        Ok(stmt)
    }

    /// Field list up to and including the closing paren.
    fn parse_stream_fields(&mut self) -> ParseResult<Vec<StreamField>> {
        let mut fields = Vec::new();
        if self.match_token(&Token::RParen) {
            return Ok(fields);
        }
        loop {
            let name = self.parse_identifier("stream field name")?;
            let field_type = self.parse_field_type()?;
            fields.push(StreamField { name, field_type });
            if self.match_token(&Token::Comma) {
                continue;
            }
            if self.match_token(&Token::RParen) {
                return Ok(fields);
            }
            return Err(self.custom(format!(
                "found \"{}\", expect comma or rparen.",
                self.current.token
            )));
        }
    }

    fn parse_field_type(&mut self) -> ParseResult<FieldType> {
        let keyword = match &self.current.token {
            Token::Ident(s) => s.to_ascii_lowercase(),
            _ => return Err(self.invalid_field_type()),
        };
        match keyword.as_str() {
            "array" => {
                self.advance();
                self.consume(&Token::LParen, "( in array type definition")?;
                let inner = self.parse_field_type()?;
                self.consume(&Token::RParen, ") in array type definition")?;
                Ok(FieldType::Array(Box::new(inner)))
            }
            "struct" => {
                self.advance();
                self.consume(&Token::LParen, "( in struct type definition")?;
                Ok(FieldType::Struct(self.parse_stream_fields()?))
            }
            other => match FieldType::from_keyword(other) {
                Some(t) => {
                    self.advance();
                    Ok(t)
                }
                None => Err(self.invalid_field_type()),
            },
        }
    }

    fn invalid_field_type(&self) -> ParseError {
        self.custom(format!(
            "found \"{}\", expect valid stream field types(BIGINT | FLOAT | STRING | DATETIME | BOOLEAN | BYTEA | ARRAY | STRUCT).",
            self.current.token
        ))
    }

    fn parse_stream_options(&mut self) -> ParseResult<StreamOptions> {
        self.consume(&Token::LParen, "( after WITH")?;
        let mut options = StreamOptions::default();
        loop {
            let key = self.parse_identifier("option key")?.to_ascii_uppercase();
            if !self.match_token(&Token::Eq) {
                return Err(self.custom(format!(
                    "found \"{}\", expect equals(=) in options.",
                    self.current.token
                )));
            }
            let value = match &self.current.token {
                Token::String(s) => s.clone(),
                _ => {
                    return Err(self.custom(format!(
                        "found \"{}\", expect string value in option.",
                        self.current.token
                    )))
                }
            };
            self.advance();

            match key.as_str() {
                "DATASOURCE" => options.datasource = Some(value),
                "FORMAT" => options.format = Some(value),
                "KEY" => options.key = Some(value),
                "CONF_KEY" => options.conf_key = Some(value),
                "TYPE" => options.source_type = Some(value),
                "TIMESTAMP" => options.timestamp = Some(value),
                "TIMESTAMP_FORMAT" => options.timestamp_format = Some(value),
                "STRICT_VALIDATION" => {
                    options.strict_validation = match value.to_ascii_lowercase().as_str() {
                        "true" => true,
                        "false" => false,
                        _ => {
                            return Err(ParseError::custom(
                                self.prev_span(),
                                format!(
                                    "found \"{}\", expect TRUE/FALSE value in STRICT_VALIDATION option.",
                                    value
                                ),
                            ))
                        }
                    }
                }
                _ => {
                    return Err(ParseError::custom(
                        self.prev_span(),
                        format!(
                            "found \"{}\", unknown option keys(DATASOURCE|FORMAT|KEY|CONF_KEY|STRICT_VALIDATION|TYPE|TIMESTAMP|TIMESTAMP_FORMAT).",
                            key
                        ),
                    ))
                }
            }

            if self.match_token(&Token::Comma) {
                continue;
            }
            if self.match_token(&Token::RParen) {
                return Ok(options);
            }
            return Err(self.custom("Parenthesis is not matched in options definition."));
        }
    }
}

/// Output name a projected expression takes when it has no alias.
fn derived_name(expr: &Expr) -> String {
    match expr {
        Expr::FieldRef { name, .. } => name.clone(),
        Expr::Call(c) => c.name.clone(),
        Expr::MetaRef { .. } => "meta".to_string(),
        Expr::Binary {
            op: BinOp::Arrow,
            rhs,
            ..
        } => derived_name(rhs),
        _ => String::new(),
    }
}

/// Turn a window function call from GROUP BY into a [`Window`].
fn convert_window(window_type: WindowType, args: &[Expr]) -> Result<Window, String> {
    let name = window_type.func_name();

    if window_type == WindowType::Count {
        return match args {
            [Expr::Integer(len)] if *len > 0 => Ok(Window::new(WindowType::Count, None, *len)),
            [a] => Err(format!("Invalid parameter value {}.", a)),
            [Expr::Integer(len), Expr::Integer(interval)] => {
                if len < interval {
                    Err(format!(
                        "The second parameter value {} should be less than the first parameter {}.",
                        interval, len
                    ))
                } else if *interval <= 0 {
                    Err(format!("Invalid parameter value {}, {}.", len, interval))
                } else {
                    let mut w = Window::new(WindowType::Count, None, *len);
                    w.interval = *interval;
                    Ok(w)
                }
            }
            [a, b] => Err(format!("Invalid parameter value {}, {}.", a, b)),
            _ => Err("Invalid parameter count.".to_string()),
        };
    }

    let arity_ok = match window_type {
        WindowType::Tumbling => args.len() == 2,
        WindowType::Sliding => args.len() == 2 || args.len() == 3,
        _ => args.len() == 3,
    };
    if !arity_ok {
        let expected = match window_type {
            WindowType::Tumbling => "2",
            WindowType::Sliding => "2 or 3",
            _ => "3",
        };
        return Err(format!("The arguments for {} should be {}.", name, expected));
    }

    let unit = match &args[0] {
        Expr::FieldRef { stream: None, name } => TimeUnit::from_literal(name),
        _ => None,
    }
    .ok_or_else(|| {
        format!(
            "The 1st argument for {} is expecting timer literal expression. One value of [dd|hh|mi|ss|ms].",
            name
        )
    })?;

    let mut values = Vec::with_capacity(args.len() - 1);
    for (i, arg) in args.iter().enumerate().skip(1) {
        match arg {
            Expr::Integer(n) if *n > 0 => {
                let ms = n.checked_mul(unit.as_millis()).ok_or_else(|| {
                    format!(
                        "The {} argument for {} is too large: {} {} overflows milliseconds.",
                        i, name, n, unit
                    )
                })?;
                values.push(ms);
            }
            Expr::Integer(_) if i > 1 && window_type == WindowType::Sliding => values.push(0),
            _ => {
                return Err(format!(
                    "The {} argument for {} is expecting a positive integer literal expression.",
                    i, name
                ))
            }
        }
    }

    let mut window = Window::new(window_type, Some(unit), values[0]);
    match window_type {
        WindowType::Hopping | WindowType::Session => window.interval = values[1],
        WindowType::Sliding => window.delay = values.get(1).copied().unwrap_or(0),
        _ => {}
    }
    Ok(window)
}

fn validate_stream(stmt: &StreamStmt) -> Result<(), String> {
    let format = stmt
        .options
        .format
        .as_deref()
        .unwrap_or("json")
        .to_ascii_lowercase();
    match format.as_str() {
        "json" => Ok(()),
        "binary" => match stmt.fields.as_slice() {
            [] => Ok(()),
            [f] if f.field_type == FieldType::Bytea => Ok(()),
            [_] => Err("'binary' format stream can have only 'bytea' type field".to_string()),
            _ => Err("'binary' format stream can have only one field".to_string()),
        },
        other => Err(format!("option 'format={}' is invalid", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn select(sql: &str) -> SelectStatement {
        parse_select(sql).unwrap()
    }

    fn err(sql: &str) -> String {
        parse(sql).unwrap_err().to_string()
    }

    // ==========================================================================
    // SELECT basics
    // ==========================================================================

    #[test]
    fn test_simple_select() {
        let stmt = select("SELECT color, ts FROM ldemo WHERE size >= 3");
        assert_eq!(stmt.fields.len(), 2);
        assert_eq!(stmt.fields[0].name, "color");
        assert_eq!(stmt.sources[0].name, "ldemo");
        assert_eq!(
            stmt.condition,
            Some(Expr::binary(BinOp::Ge, Expr::field("size"), Expr::Integer(3)))
        );
    }

    #[test]
    fn test_wildcards() {
        let stmt = select("SELECT *, src1.* FROM src1");
        assert_eq!(stmt.fields[0].expr, Expr::Wildcard { stream: None });
        assert_eq!(
            stmt.fields[1].expr,
            Expr::Wildcard {
                stream: Some("src1".into())
            }
        );
    }

    #[test]
    fn test_alias_and_derived_names() {
        let stmt = select("SELECT avg(size) AS a, count(*), a->b, 3 * 4 FROM demo");
        assert_eq!(stmt.fields[0].output_name(), "a");
        assert_eq!(stmt.fields[1].name, "count");
        assert_eq!(
            stmt.fields[1].expr,
            Expr::call("count", vec![Expr::Wildcard { stream: None }])
        );
        assert_eq!(stmt.fields[2].name, "b");
        assert_eq!(stmt.fields[3].name, "");
    }

    #[test]
    fn test_precedence() {
        let stmt = select("SELECT a FROM t WHERE a + 2 * 3 > 12 AND b = 1 OR c");
        let expected = Expr::binary(
            BinOp::Or,
            Expr::binary(
                BinOp::And,
                Expr::binary(
                    BinOp::Gt,
                    Expr::binary(
                        BinOp::Add,
                        Expr::field("a"),
                        Expr::binary(BinOp::Mul, Expr::Integer(2), Expr::Integer(3)),
                    ),
                    Expr::Integer(12),
                ),
                Expr::binary(BinOp::Eq, Expr::field("b"), Expr::Integer(1)),
            ),
            Expr::field("c"),
        );
        assert_eq!(stmt.condition, Some(expected));
    }

    #[test]
    fn test_negative_literals_fold() {
        let stmt = select("SELECT a FROM t WHERE a > -3");
        assert_eq!(
            stmt.condition,
            Some(Expr::binary(BinOp::Gt, Expr::field("a"), Expr::Integer(-3)))
        );
    }

    #[test]
    fn test_bracket_forms() {
        let stmt = select("SELECT a[0], a[2:4], a[2:], a[:4], a[-1] FROM t");
        let rhs: Vec<_> = stmt
            .fields
            .iter()
            .map(|f| match &f.expr {
                Expr::Binary { op: BinOp::Subset, rhs, .. } => (**rhs).clone(),
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(
            rhs,
            vec![
                Expr::Index(0),
                Expr::Colon { start: 2, end: Some(4) },
                Expr::Colon { start: 2, end: None },
                Expr::Colon { start: 0, end: Some(4) },
                Expr::Index(-1),
            ]
        );
    }

    #[test]
    fn test_arrow_chain() {
        let stmt = select("SELECT a->c->d AS f1 FROM t");
        assert_eq!(
            stmt.fields[0].expr,
            Expr::binary(
                BinOp::Arrow,
                Expr::binary(BinOp::Arrow, Expr::field("a"), Expr::field("c")),
                Expr::field("d"),
            )
        );
    }

    #[test]
    fn test_meta_refs() {
        let stmt = select("SELECT meta(topic), meta(*), meta(src.device) FROM src");
        assert_eq!(
            stmt.fields[0].expr,
            Expr::MetaRef {
                stream: None,
                name: "topic".into()
            }
        );
        assert_eq!(
            stmt.fields[1].expr,
            Expr::MetaRef {
                stream: None,
                name: "*".into()
            }
        );
        assert_eq!(
            stmt.fields[2].expr,
            Expr::MetaRef {
                stream: Some("src".into()),
                name: "device".into()
            }
        );
    }

    #[test]
    fn test_case_expression() {
        let stmt = select(r#"SELECT CASE a WHEN 10 THEN "true" ELSE "false" END AS b FROM test"#);
        match &stmt.fields[0].expr {
            Expr::Case(c) => {
                assert!(c.value.is_some());
                assert_eq!(c.when_clauses.len(), 1);
                assert!(c.else_clause.is_some());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_case_errors() {
        assert_eq!(
            err("SELECT CASE WHEN 1 THEN 2 END FROM t"),
            "invalid CASE expression, WHEN expression must be a bool condition"
        );
        assert_eq!(
            err("SELECT CASE a ELSE 2 END FROM t"),
            "invalid CASE expression, WHEN expected before ELSE"
        );
        assert_eq!(
            err("SELECT CASE a WHEN 1 THEN 2 FROM t"),
            "invalid CASE expression, END expected"
        );
    }

    // ==========================================================================
    // Joins
    // ==========================================================================

    #[test]
    fn test_join_types() {
        let stmt = select(
            "SELECT * FROM src1 LEFT JOIN src2 ON src1.id = src2.id \
             INNER JOIN src3 ON src1.id = src3.id CROSS JOIN src4 JOIN src5 ON src1.id = src5.id",
        );
        let types: Vec<_> = stmt.joins.iter().map(|j| j.join_type).collect();
        assert_eq!(
            types,
            vec![
                JoinType::Left,
                JoinType::Inner,
                JoinType::Cross,
                JoinType::Inner
            ]
        );
        assert!(stmt.joins[2].expr.is_none());
    }

    #[test]
    fn test_cross_join_rejects_on() {
        assert_eq!(
            err("SELECT * FROM a CROSS JOIN b ON a.id = b.id"),
            "On expression is not required for cross join type."
        );
    }

    #[test]
    fn test_table_alias() {
        let stmt = select("SELECT d.color FROM demo AS d");
        assert_eq!(stmt.sources[0].ref_name(), "d");
        assert_eq!(stmt.fields[0].expr, Expr::qualified("d", "color"));
    }

    // ==========================================================================
    // Windows
    // ==========================================================================

    #[test]
    fn test_hopping_window() {
        let stmt = select("SELECT * FROM demo GROUP BY HOPPINGWINDOW(ss, 2, 1)");
        let w = stmt.window().unwrap();
        assert_eq!(w.window_type, WindowType::Hopping);
        assert_eq!((w.length, w.interval), (2000, 1000));
    }

    #[test]
    fn test_session_and_sliding_windows() {
        let w = select("SELECT * FROM demo GROUP BY SESSIONWINDOW(mi, 10, 2)")
            .window()
            .cloned()
            .unwrap();
        assert_eq!((w.length, w.interval), (600_000, 120_000));

        let w = select("SELECT * FROM demo GROUP BY SLIDINGWINDOW(ss, 10, 1)")
            .window()
            .cloned()
            .unwrap();
        assert_eq!((w.length, w.delay), (10_000, 1000));
    }

    #[test]
    fn test_count_window() {
        let w = select("SELECT * FROM demo GROUP BY COUNTWINDOW(5, 2)")
            .window()
            .cloned()
            .unwrap();
        assert_eq!((w.length, w.interval), (5, 2));
        assert_eq!(
            err("SELECT * FROM demo GROUP BY COUNTWINDOW(2, 5)"),
            "The second parameter value 5 should be less than the first parameter 2."
        );
        assert_eq!(
            err("SELECT * FROM demo GROUP BY COUNTWINDOW(1, 2, 3)"),
            "Invalid parameter count."
        );
    }

    #[test]
    fn test_window_argument_errors() {
        assert_eq!(
            err("SELECT * FROM demo GROUP BY TUMBLINGWINDOW(ss)"),
            "The arguments for tumblingwindow should be 2."
        );
        assert_eq!(
            err("SELECT * FROM demo GROUP BY TUMBLINGWINDOW(yy, 10)"),
            "The 1st argument for tumblingwindow is expecting timer literal expression. One value of [dd|hh|mi|ss|ms]."
        );
        assert_eq!(
            err("SELECT * FROM demo GROUP BY TUMBLINGWINDOW(dd, 9223372036854775807)"),
            "The 1 argument for tumblingwindow is too large: 9223372036854775807 dd overflows milliseconds."
        );
        assert_eq!(
            err("SELECT * FROM demo GROUP BY HOPPINGWINDOW(ss, 10, 9223372036854776)"),
            "The 2 argument for hoppingwindow is too large: 9223372036854776 ss overflows milliseconds."
        );
        let stmt = select("SELECT * FROM demo GROUP BY TUMBLINGWINDOW(dd, 106751991167)");
        assert_eq!(stmt.window().unwrap().length, 106_751_991_167 * 86_400_000);
    }

    #[test]
    fn test_window_filter_and_over() {
        let stmt = select(
            "SELECT * FROM demo GROUP BY TUMBLINGWINDOW(ss, 10) FILTER(WHERE size > 2) OVER(WHEN color = \"red\"), color",
        );
        let w = stmt.window().unwrap();
        assert!(w.filter.is_some());
        assert!(w.trigger_condition.is_some());
        assert_eq!(stmt.group_dimensions().count(), 1);
    }

    // ==========================================================================
    // Validation surfaced through the parser
    // ==========================================================================

    #[test]
    fn test_function_validation() {
        assert_eq!(
            err("SELECT abs(1, 2) FROM demo"),
            "The arguments for abs should be 1."
        );
        assert_eq!(
            err("SELECT lower(1) FROM demo"),
            "Expect string type for 1 parameter of function lower."
        );
    }

    #[test]
    fn test_aggregate_misuse() {
        assert_eq!(
            err("SELECT color FROM demo WHERE avg(size) > 2"),
            "Not allowed to call aggregate functions in WHERE clause."
        );
        assert_eq!(
            err("SELECT color FROM demo GROUP BY color HAVING size > 2"),
            "Not allowed to call non-aggregate functions in HAVING clause."
        );
    }

    #[test]
    fn test_order_by() {
        let stmt = select("SELECT * FROM demo ORDER BY size DESC, demo.color");
        assert_eq!(stmt.sort_fields.len(), 2);
        assert!(!stmt.sort_fields[0].ascending);
        assert_eq!(stmt.sort_fields[1].name, "color");
        assert_eq!(stmt.sort_fields[1].stream.as_deref(), Some("demo"));
        assert!(stmt.sort_fields[1].ascending);
    }

    #[test]
    fn test_trailing_tokens() {
        assert_eq!(
            err("SELECT a FROM demo extra tokens"),
            "found \"tokens\", expected EOF."
        );
    }

    // ==========================================================================
    // CREATE STREAM
    // ==========================================================================

    #[test]
    fn test_create_stream() {
        let stmt = parse_stream(
            r#"CREATE STREAM demo (color STRING, size BIGINT, ts BIGINT, tags ARRAY(STRING), loc STRUCT(lat FLOAT, lng FLOAT))
               WITH (DATASOURCE="demo", FORMAT="json", TIMESTAMP="ts");"#,
        )
        .unwrap();
        assert_eq!(stmt.name, "demo");
        assert_eq!(stmt.fields.len(), 5);
        assert_eq!(stmt.fields[1].field_type, FieldType::Bigint);
        assert_eq!(
            stmt.fields[3].field_type,
            FieldType::Array(Box::new(FieldType::String))
        );
        assert_eq!(stmt.options.timestamp.as_deref(), Some("ts"));
    }

    #[test]
    fn test_schemaless_stream() {
        let stmt = parse_stream(r#"CREATE STREAM demo () WITH (FORMAT="JSON")"#).unwrap();
        assert!(stmt.is_schemaless());
    }

    #[test]
    fn test_stream_errors() {
        assert!(err(r#"CREATE STREAM demo (a INT) WITH (FORMAT="json")"#)
            .starts_with("found \"INT\", expect valid stream field types"));
        assert_eq!(
            err(r#"CREATE STREAM demo (a BIGINT) WITH (FORMAT="xml")"#),
            "option 'format=xml' is invalid"
        );
        assert!(err(r#"CREATE STREAM demo (a BIGINT) WITH (COLOR="red")"#)
            .contains("unknown option keys"));
    }
}
