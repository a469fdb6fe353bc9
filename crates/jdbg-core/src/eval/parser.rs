//! Recursive-descent parser for Java-like debugger expressions.
//!
//! Precedence, lowest first: `||`, `&&`, `==`/`!=`, relational and
//! `instanceof`, `+`/`-`, `*`/`/`/`%`, unary (`!`, `-`, `+`, casts), postfix
//! (`.field`, `.method(args)`, `[index]`), primary.

use thiserror::Error;

use super::ast::{BinaryOp, Expr, Literal, UnaryOp};

/// A syntax error; `position` is a character offset into the source.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("parse error at position {position}: {message}")]
pub struct ParseError {
    pub message: String,
    pub position: usize,
}

pub fn parse(source: &str) -> Result<Expr, ParseError> {
    let mut parser = Parser::new(source);
    let expr = parser.parse_or()?;
    parser.skip_whitespace();
    if let Some(ch) = parser.peek() {
        return Err(parser.error(format!("Unexpected character: '{ch}'")));
    }
    Ok(expr)
}

const RESERVED_WORDS: &[&str] = &["true", "false", "null", "this", "new"];

struct Parser {
    chars: Vec<char>,
    pos: usize,
}

type PResult<T> = Result<T, ParseError>;

impl Parser {
    fn new(source: &str) -> Self {
        Self {
            chars: source.chars().collect(),
            pos: 0,
        }
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        ParseError {
            message: message.into(),
            position: self.pos,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let ch = self.peek()?;
        self.pos += 1;
        Some(ch)
    }

    fn skip_whitespace(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.pos += 1;
        }
    }

    fn starts_with(&self, token: &str) -> bool {
        token
            .chars()
            .enumerate()
            .all(|(i, ch)| self.peek_at(i) == Some(ch))
    }

    /// Consume `token` (after whitespace) if it is next.
    fn eat(&mut self, token: &str) -> bool {
        self.skip_whitespace();
        if self.starts_with(token) {
            self.pos += token.chars().count();
            true
        } else {
            false
        }
    }

    /// Like [`Parser::eat`] for an operator that must not be the prefix of a
    /// longer one (`<` vs `<=`, `&` vs `&&`).
    fn eat_operator(&mut self, token: &str, not_followed_by: &[char]) -> bool {
        self.skip_whitespace();
        if !self.starts_with(token) {
            return false;
        }
        let next = self.peek_at(token.chars().count());
        if next.is_some_and(|ch| not_followed_by.contains(&ch)) {
            return false;
        }
        self.pos += token.chars().count();
        true
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        self.skip_whitespace();
        let len = keyword.chars().count();
        if self.starts_with(keyword) && !self.peek_at(len).is_some_and(is_ident_part) {
            self.pos += len;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, ch: char) -> PResult<()> {
        self.skip_whitespace();
        match self.peek() {
            Some(found) if found == ch => {
                self.pos += 1;
                Ok(())
            }
            Some(found) => Err(self.error(format!("Expected '{ch}', got '{found}'"))),
            None => Err(self.error(format!("Expected '{ch}', got end of input"))),
        }
    }

    fn parse_or(&mut self) -> PResult<Expr> {
        let mut left = self.parse_and()?;
        while self.eat("||") {
            let right = self.parse_and()?;
            left = binary(BinaryOp::Or, left, right);
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> PResult<Expr> {
        let mut left = self.parse_equality()?;
        while self.eat("&&") {
            let right = self.parse_equality()?;
            left = binary(BinaryOp::And, left, right);
        }
        Ok(left)
    }

    fn parse_equality(&mut self) -> PResult<Expr> {
        let mut left = self.parse_relational()?;
        loop {
            let op = if self.eat("==") {
                BinaryOp::Eq
            } else if self.eat("!=") {
                BinaryOp::Ne
            } else {
                break;
            };
            let right = self.parse_relational()?;
            left = binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_relational(&mut self) -> PResult<Expr> {
        let mut left = self.parse_additive()?;
        loop {
            if self.eat_keyword("instanceof") {
                let type_name = self.parse_type_name()?;
                left = Expr::InstanceOf {
                    operand: Box::new(left),
                    type_name,
                };
                continue;
            }
            let op = if self.eat("<=") {
                BinaryOp::Le
            } else if self.eat(">=") {
                BinaryOp::Ge
            } else if self.eat("<") {
                BinaryOp::Lt
            } else if self.eat(">") {
                BinaryOp::Gt
            } else {
                break;
            };
            let right = self.parse_additive()?;
            left = binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_additive(&mut self) -> PResult<Expr> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = if self.eat_operator("+", &['=']) {
                BinaryOp::Add
            } else if self.eat_operator("-", &['=']) {
                BinaryOp::Sub
            } else {
                break;
            };
            let right = self.parse_multiplicative()?;
            left = binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> PResult<Expr> {
        let mut left = self.parse_unary()?;
        loop {
            let op = if self.eat_operator("*", &['=']) {
                BinaryOp::Mul
            } else if self.eat_operator("/", &['=']) {
                BinaryOp::Div
            } else if self.eat_operator("%", &['=']) {
                BinaryOp::Rem
            } else {
                break;
            };
            let right = self.parse_unary()?;
            left = binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> PResult<Expr> {
        if self.eat_operator("!", &['=']) {
            let operand = self.parse_unary()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                operand: Box::new(operand),
            });
        }
        if self.eat("-") {
            if let Some(literal) = self.min_value_literal() {
                return Ok(Expr::Literal(literal));
            }
            let operand = self.parse_unary()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Neg,
                operand: Box::new(operand),
            });
        }
        if self.eat("+") {
            return self.parse_unary();
        }
        if let Some(type_name) = self.cast_prefix()? {
            let operand = self.parse_unary()?;
            return Ok(Expr::Cast {
                type_name,
                operand: Box::new(operand),
            });
        }
        self.parse_postfix()
    }

    /// Parse `(TypeName)` if the upcoming tokens form a cast.
    ///
    /// `(` followed by a type name (dotted identifiers, optional `[]`) and
    /// `)` is always a cast prefix, so `(a) - b` casts `-b` to `a`. Anything
    /// else inside the parentheses, e.g. `(a + b)` or `(this)`, is grouping.
    fn cast_prefix(&mut self) -> PResult<Option<String>> {
        self.skip_whitespace();
        if self.peek() != Some('(') {
            return Ok(None);
        }
        let saved = self.pos;
        self.pos += 1;
        self.skip_whitespace();
        if !self.peek().is_some_and(is_ident_start) {
            self.pos = saved;
            return Ok(None);
        }
        let type_name = match self.parse_type_name() {
            Ok(name) if !RESERVED_WORDS.contains(&name.as_str()) => name,
            _ => {
                self.pos = saved;
                return Ok(None);
            }
        };
        self.skip_whitespace();
        if self.peek() != Some(')') {
            self.pos = saved;
            return Ok(None);
        }
        self.pos += 1;
        Ok(Some(type_name))
    }

    fn parse_postfix(&mut self) -> PResult<Expr> {
        let mut expr = self.parse_primary()?;
        loop {
            if self.eat(".") {
                let name = self.parse_identifier()?;
                if self.peek() == Some('(') {
                    let args = self.parse_arguments()?;
                    expr = Expr::MethodCall {
                        target: Some(Box::new(expr)),
                        name,
                        args,
                    };
                } else {
                    expr = Expr::FieldAccess {
                        target: Box::new(expr),
                        name,
                    };
                }
            } else if self.eat("[") {
                let index = self.parse_or()?;
                self.expect(']')?;
                expr = Expr::ArrayAccess {
                    array: Box::new(expr),
                    index: Box::new(index),
                };
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> PResult<Expr> {
        self.skip_whitespace();
        let Some(ch) = self.peek() else {
            return Err(self.error("Expected expression, got end of input"));
        };

        if ch == '(' {
            self.pos += 1;
            let expr = self.parse_or()?;
            self.expect(')')?;
            return Ok(expr);
        }
        if ch == '"' {
            return Ok(Expr::Literal(Literal::String(self.parse_string_literal()?)));
        }
        if ch == '\'' {
            return Ok(Expr::Literal(Literal::Char(self.parse_char_literal()?)));
        }
        if ch.is_ascii_digit() || (ch == '.' && self.peek_at(1).is_some_and(|c| c.is_ascii_digit()))
        {
            return self.parse_number();
        }
        if is_ident_start(ch) {
            let name = self.parse_identifier()?;
            return match name.as_str() {
                "true" => Ok(Expr::Literal(Literal::Boolean(true))),
                "false" => Ok(Expr::Literal(Literal::Boolean(false))),
                "null" => Ok(Expr::Literal(Literal::Null)),
                "this" => Ok(Expr::This),
                "new" => self.parse_new(),
                _ => {
                    if self.peek() == Some('(') {
                        let args = self.parse_arguments()?;
                        Ok(Expr::MethodCall {
                            target: None,
                            name,
                            args,
                        })
                    } else {
                        Ok(Expr::Variable(name))
                    }
                }
            };
        }
        Err(self.error(format!("Expected expression, got '{ch}'")))
    }

    fn parse_new(&mut self) -> PResult<Expr> {
        let type_name = self.parse_type_name()?;
        self.skip_whitespace();
        match self.peek() {
            Some('[') => {
                self.pos += 1;
                let size = self.parse_or()?;
                self.expect(']')?;
                Ok(Expr::NewArray {
                    element_type: type_name,
                    size: Box::new(size),
                })
            }
            Some('(') => {
                let args = self.parse_arguments()?;
                Ok(Expr::NewObject { type_name, args })
            }
            _ => Err(self.error(format!("Expected '(' or '[' after new {type_name}"))),
        }
    }

    fn parse_arguments(&mut self) -> PResult<Vec<Expr>> {
        self.expect('(')?;
        let mut args = Vec::new();
        self.skip_whitespace();
        if self.peek() == Some(')') {
            self.pos += 1;
            return Ok(args);
        }
        loop {
            args.push(self.parse_or()?);
            if !self.eat(",") {
                break;
            }
        }
        self.expect(')')?;
        Ok(args)
    }

    fn parse_identifier(&mut self) -> PResult<String> {
        self.skip_whitespace();
        if !self.peek().is_some_and(is_ident_start) {
            return Err(self.error("Expected identifier"));
        }
        let start = self.pos;
        while self.peek().is_some_and(is_ident_part) {
            self.pos += 1;
        }
        Ok(self.chars[start..self.pos].iter().collect())
    }

    /// `ident(.ident)*([])*`
    fn parse_type_name(&mut self) -> PResult<String> {
        let mut name = self.parse_identifier()?;
        loop {
            let saved = self.pos;
            self.skip_whitespace();
            if self.peek() != Some('.') {
                self.pos = saved;
                break;
            }
            self.pos += 1;
            self.skip_whitespace();
            if !self.peek().is_some_and(is_ident_start) {
                self.pos = saved;
                break;
            }
            name.push('.');
            name.push_str(&self.parse_identifier()?);
        }
        loop {
            let saved = self.pos;
            self.skip_whitespace();
            if self.peek() != Some('[') {
                self.pos = saved;
                break;
            }
            self.pos += 1;
            self.skip_whitespace();
            if self.peek() != Some(']') {
                // `new int[3]`: the bracket belongs to the caller.
                self.pos = saved;
                break;
            }
            self.pos += 1;
            name.push_str("[]");
        }
        Ok(name)
    }

    fn parse_string_literal(&mut self) -> PResult<String> {
        let start = self.pos;
        self.pos += 1;
        let mut out = String::new();
        loop {
            match self.bump() {
                None => {
                    return Err(ParseError {
                        message: "Unterminated string literal".to_string(),
                        position: start,
                    })
                }
                Some('"') => return Ok(out),
                Some('\\') => out.push(self.parse_escape(start)?),
                Some(ch) => out.push(ch),
            }
        }
    }

    fn parse_char_literal(&mut self) -> PResult<u16> {
        let start = self.pos;
        self.pos += 1;
        let unterminated = || ParseError {
            message: "Unterminated character literal".to_string(),
            position: start,
        };
        let ch = match self.bump() {
            None => return Err(unterminated()),
            Some('\\') => self.parse_escape(start)?,
            Some('\'') => return Err(self.error("Empty character literal")),
            Some(ch) => ch,
        };
        if self.bump() != Some('\'') {
            return Err(unterminated());
        }
        let mut units = [0u16; 2];
        match ch.encode_utf16(&mut units) {
            [unit] => Ok(*unit),
            _ => Err(ParseError {
                message: format!("Character literal '{ch}' does not fit in a char"),
                position: start,
            }),
        }
    }

    fn parse_escape(&mut self, literal_start: usize) -> PResult<char> {
        let Some(ch) = self.bump() else {
            return Err(ParseError {
                message: "Unterminated escape sequence".to_string(),
                position: literal_start,
            });
        };
        Ok(match ch {
            'n' => '\n',
            't' => '\t',
            'r' => '\r',
            '0' => '\0',
            // `\\`, `\"`, `\'` and unknown escapes yield the character itself.
            other => other,
        })
    }

    /// `2147483648` and `9223372036854775808L` only fit once negated.
    fn min_value_literal(&mut self) -> Option<Literal> {
        self.skip_whitespace();
        let start = self.pos;
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.pos += 1;
        }
        let digits: String = self.chars[start..self.pos].iter().collect();
        let long = matches!(self.peek(), Some('l' | 'L'));
        if long {
            self.pos += 1;
        }
        let literal = match (digits.as_str(), long) {
            ("2147483648", false) => Some(Literal::Int(i32::MIN)),
            ("9223372036854775808", true) => Some(Literal::Long(i64::MIN)),
            _ => None,
        };
        let ends_here = !self
            .peek()
            .is_some_and(|c| is_ident_part(c) || c == '.');
        if literal.is_some() && ends_here {
            return literal;
        }
        self.pos = start;
        None
    }

    fn parse_hex_number(&mut self) -> PResult<Expr> {
        let start = self.pos;
        self.pos += 2;
        let digits_start = self.pos;
        while self.peek().is_some_and(|c| c.is_ascii_hexdigit()) {
            self.pos += 1;
        }
        let digits: String = self.chars[digits_start..self.pos].iter().collect();
        let invalid = |kind: &str| ParseError {
            message: format!("Invalid {kind} literal: 0x{digits}"),
            position: start,
        };
        let literal = if matches!(self.peek(), Some('l' | 'L')) {
            self.pos += 1;
            // Hex literals cover the full unsigned range, like Java's.
            let bits = u64::from_str_radix(&digits, 16).map_err(|_| invalid("long"))?;
            Literal::Long(bits as i64)
        } else {
            let bits = u32::from_str_radix(&digits, 16).map_err(|_| invalid("int"))?;
            Literal::Int(bits as i32)
        };
        if self.peek().is_some_and(is_ident_part) {
            return Err(self.error(format!("Invalid number literal: 0x{digits}")));
        }
        Ok(Expr::Literal(literal))
    }

    fn parse_number(&mut self) -> PResult<Expr> {
        if self.peek() == Some('0') && matches!(self.peek_at(1), Some('x' | 'X')) {
            return self.parse_hex_number();
        }
        let start = self.pos;
        let mut fractional = false;
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.pos += 1;
        }
        if self.peek() == Some('.') && !self.peek_at(1).is_some_and(is_ident_start) {
            fractional = true;
            self.pos += 1;
            while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                self.pos += 1;
            }
        }
        if matches!(self.peek(), Some('e' | 'E')) {
            fractional = true;
            self.pos += 1;
            if matches!(self.peek(), Some('+' | '-')) {
                self.pos += 1;
            }
            if !self.peek().is_some_and(|c| c.is_ascii_digit()) {
                return Err(self.error("Malformed exponent"));
            }
            while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                self.pos += 1;
            }
        }
        let text: String = self.chars[start..self.pos].iter().collect();
        let suffix = self.peek().map(|c| c.to_ascii_lowercase());
        let invalid = |kind: &str| ParseError {
            message: format!("Invalid {kind} literal: {text}"),
            position: start,
        };

        let literal = match suffix {
            Some('l') if !fractional => {
                self.pos += 1;
                Literal::Long(text.parse().map_err(|_| invalid("long"))?)
            }
            Some('f') => {
                self.pos += 1;
                Literal::Float(text.parse().map_err(|_| invalid("float"))?)
            }
            Some('d') => {
                self.pos += 1;
                Literal::Double(text.parse().map_err(|_| invalid("double"))?)
            }
            _ if fractional => Literal::Double(text.parse().map_err(|_| invalid("double"))?),
            _ => Literal::Int(text.parse().map_err(|_| invalid("int"))?),
        };
        if self.peek().is_some_and(is_ident_part) {
            return Err(self.error(format!("Invalid number literal: {text}")));
        }
        Ok(Expr::Literal(literal))
    }
}

fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
    Expr::Binary {
        op,
        left: Box::new(left),
        right: Box::new(right),
    }
}

fn is_ident_start(ch: char) -> bool {
    ch.is_alphabetic() || ch == '_' || ch == '$'
}

fn is_ident_part(ch: char) -> bool {
    ch.is_alphanumeric() || ch == '_' || ch == '$'
}
