//! Restricted boolean/arithmetic expression language for business rules.
//!
//! Expressions are tokenized, parsed into an AST and walked against a JSON
//! scope. There is no assignment, no loops and no user-defined functions;
//! only the whitelisted functions below can be called.
//!
//! ```text
//! expr     := or
//! or       := and (("||" | "or") and)*
//! and      := cmp (("&&" | "and") cmp)*
//! cmp      := sum (("==" | "!=" | "<" | "<=" | ">" | ">=" | "in") sum)?
//! sum      := product (("+" | "-") product)*
//! product  := unary (("*" | "/") unary)*
//! unary    := ("!" | "not" | "-") unary | primary
//! primary  := number | string | true | false | null | list | call | path | "(" expr ")"
//! ```

use std::fmt;

use ontos_protocol::loose_eq;
use serde_json::{Number, Value};
use thiserror::Error;

const FUNCTIONS: &[&str] = &["len", "lower", "upper", "is_null", "abs", "min", "max"];

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExprError {
    #[error("parse error at {position}: {message}")]
    Parse { position: usize, message: String },
    #[error("unknown variable: {0}")]
    UnknownVariable(String),
    #[error("unknown function: {0}")]
    UnknownFunction(String),
    #[error("type mismatch: {0}")]
    TypeMismatch(String),
    #[error("division by zero")]
    DivisionByZero,
    #[error("expression did not produce a boolean")]
    NotBoolean,
}

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    Number(f64),
    Str(String),
    Ident(String),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Dot,
    Not,
    And,
    Or,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    Plus,
    Minus,
    Star,
    Slash,
    Eof,
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    position: usize,
}

struct Tokenizer<'a> {
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
    len: usize,
}

impl<'a> Tokenizer<'a> {
    fn tokenize(input: &'a str) -> Result<Vec<Token>, ExprError> {
        let mut tokenizer = Tokenizer {
            chars: input.char_indices().peekable(),
            len: input.len(),
        };
        let mut tokens = Vec::new();
        loop {
            let token = tokenizer.next_token()?;
            let is_eof = token.kind == TokenKind::Eof;
            tokens.push(token);
            if is_eof {
                return Ok(tokens);
            }
        }
    }

    fn peek_char(&mut self) -> Option<char> {
        self.chars.peek().map(|&(_, c)| c)
    }

    fn position(&mut self) -> usize {
        self.chars.peek().map_or(self.len, |&(i, _)| i)
    }

    fn next_if(&mut self, expected: char) -> bool {
        if self.peek_char() == Some(expected) {
            self.chars.next();
            true
        } else {
            false
        }
    }

    fn next_token(&mut self) -> Result<Token, ExprError> {
        while self.peek_char().is_some_and(char::is_whitespace) {
            self.chars.next();
        }
        let position = self.position();
        let Some((_, c)) = self.chars.next() else {
            return Ok(Token {
                kind: TokenKind::Eof,
                position,
            });
        };

        let kind = match c {
            '(' => TokenKind::LParen,
            ')' => TokenKind::RParen,
            '[' => TokenKind::LBracket,
            ']' => TokenKind::RBracket,
            ',' => TokenKind::Comma,
            '.' => TokenKind::Dot,
            '+' => TokenKind::Plus,
            '-' => TokenKind::Minus,
            '*' => TokenKind::Star,
            '/' => TokenKind::Slash,
            '!' if self.next_if('=') => TokenKind::Ne,
            '!' => TokenKind::Not,
            '=' if self.next_if('=') => TokenKind::Eq,
            '<' if self.next_if('=') => TokenKind::Le,
            '<' => TokenKind::Lt,
            '>' if self.next_if('=') => TokenKind::Ge,
            '>' => TokenKind::Gt,
            '&' if self.next_if('&') => TokenKind::And,
            '|' if self.next_if('|') => TokenKind::Or,
            '"' | '\'' => TokenKind::Str(self.read_string(c, position)?),
            c if c.is_ascii_digit() => TokenKind::Number(self.read_number(c, position)?),
            c if c.is_alphabetic() || c == '_' => {
                let mut ident = String::from(c);
                while let Some(next) = self.peek_char() {
                    if next.is_alphanumeric() || next == '_' {
                        ident.push(next);
                        self.chars.next();
                    } else {
                        break;
                    }
                }
                match ident.as_str() {
                    "and" => TokenKind::And,
                    "or" => TokenKind::Or,
                    "not" => TokenKind::Not,
                    "in" => TokenKind::In,
                    _ => TokenKind::Ident(ident),
                }
            }
            other => {
                return Err(ExprError::Parse {
                    position,
                    message: format!("unexpected character '{other}'"),
                });
            }
        };
        Ok(Token { kind, position })
    }

    fn read_string(&mut self, quote: char, position: usize) -> Result<String, ExprError> {
        let mut value = String::new();
        loop {
            match self.chars.next() {
                None => {
                    return Err(ExprError::Parse {
                        position,
                        message: "unterminated string".into(),
                    });
                }
                Some((_, c)) if c == quote => return Ok(value),
                Some((_, '\\')) => match self.chars.next() {
                    Some((_, 'n')) => value.push('\n'),
                    Some((_, escaped)) => value.push(escaped),
                    None => {
                        return Err(ExprError::Parse {
                            position,
                            message: "unterminated escape".into(),
                        });
                    }
                },
                Some((_, c)) => value.push(c),
            }
        }
    }

    fn read_number(&mut self, first: char, position: usize) -> Result<f64, ExprError> {
        let mut text = String::from(first);
        while let Some(c) = self.peek_char() {
            if c.is_ascii_digit() || c == '.' {
                text.push(c);
                self.chars.next();
            } else {
                break;
            }
        }
        text.parse().map_err(|_| ExprError::Parse {
            position,
            message: format!("invalid number '{text}'"),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    And,
    Or,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    List(Vec<Expr>),
    Path(Vec<String>),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
}

struct Parser {
    tokens: Vec<Token>,
    cursor: usize,
}

impl Parser {
    fn peek(&self) -> &TokenKind {
        self.tokens
            .get(self.cursor)
            .map_or(&TokenKind::Eof, |t| &t.kind)
    }

    fn position(&self) -> usize {
        self.tokens.get(self.cursor).map_or(0, |t| t.position)
    }

    fn advance(&mut self) -> TokenKind {
        let kind = self.peek().clone();
        self.cursor += 1;
        kind
    }

    fn expect(&mut self, expected: TokenKind, what: &str) -> Result<(), ExprError> {
        if *self.peek() == expected {
            self.cursor += 1;
            Ok(())
        } else {
            Err(self.error(format!("expected {what}")))
        }
    }

    fn error(&self, message: String) -> ExprError {
        ExprError::Parse {
            position: self.position(),
            message,
        }
    }

    fn parse_or(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_and()?;
        while *self.peek() == TokenKind::Or {
            self.advance();
            let right = self.parse_and()?;
            left = Expr::Binary(BinaryOp::Or, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_comparison()?;
        while *self.peek() == TokenKind::And {
            self.advance();
            let right = self.parse_comparison()?;
            left = Expr::Binary(BinaryOp::And, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_comparison(&mut self) -> Result<Expr, ExprError> {
        let left = self.parse_sum()?;
        let op = match self.peek() {
            TokenKind::Eq => BinaryOp::Eq,
            TokenKind::Ne => BinaryOp::Ne,
            TokenKind::Lt => BinaryOp::Lt,
            TokenKind::Le => BinaryOp::Le,
            TokenKind::Gt => BinaryOp::Gt,
            TokenKind::Ge => BinaryOp::Ge,
            TokenKind::In => BinaryOp::In,
            _ => return Ok(left),
        };
        self.advance();
        let right = self.parse_sum()?;
        Ok(Expr::Binary(op, Box::new(left), Box::new(right)))
    }

    fn parse_sum(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_product()?;
        loop {
            let op = match self.peek() {
                TokenKind::Plus => BinaryOp::Add,
                TokenKind::Minus => BinaryOp::Sub,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.parse_product()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn parse_product(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                TokenKind::Star => BinaryOp::Mul,
                TokenKind::Slash => BinaryOp::Div,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.parse_unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn parse_unary(&mut self) -> Result<Expr, ExprError> {
        match self.peek() {
            TokenKind::Not => {
                self.advance();
                Ok(Expr::Unary(UnaryOp::Not, Box::new(self.parse_unary()?)))
            }
            TokenKind::Minus => {
                self.advance();
                Ok(Expr::Unary(UnaryOp::Neg, Box::new(self.parse_unary()?)))
            }
            _ => self.parse_primary(),
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, ExprError> {
        match self.advance() {
            TokenKind::Number(n) => Ok(Expr::Literal(number(n))),
            TokenKind::Str(s) => Ok(Expr::Literal(Value::String(s))),
            TokenKind::LParen => {
                let inner = self.parse_or()?;
                self.expect(TokenKind::RParen, "')'")?;
                Ok(inner)
            }
            TokenKind::LBracket => {
                let items = self.parse_items(TokenKind::RBracket, "']'")?;
                Ok(Expr::List(items))
            }
            TokenKind::Ident(name) => match name.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "null" => Ok(Expr::Literal(Value::Null)),
                _ if *self.peek() == TokenKind::LParen => {
                    if !FUNCTIONS.contains(&name.as_str()) {
                        return Err(ExprError::UnknownFunction(name));
                    }
                    self.advance();
                    let args = self.parse_items(TokenKind::RParen, "')'")?;
                    Ok(Expr::Call(name, args))
                }
                _ => {
                    let mut segments = vec![name];
                    while *self.peek() == TokenKind::Dot {
                        self.advance();
                        match self.advance() {
                            TokenKind::Ident(segment) => segments.push(segment),
                            TokenKind::Number(n) if n.fract() == 0.0 => {
                                segments.push(format!("{}", n as i64));
                            }
                            _ => return Err(self.error("expected field name after '.'".into())),
                        }
                    }
                    Ok(Expr::Path(segments))
                }
            },
            other => Err(ExprError::Parse {
                position: self.tokens.get(self.cursor.saturating_sub(1)).map_or(0, |t| t.position),
                message: format!("unexpected token {other:?}"),
            }),
        }
    }

    fn parse_items(&mut self, close: TokenKind, what: &str) -> Result<Vec<Expr>, ExprError> {
        let mut items = Vec::new();
        if *self.peek() == close {
            self.advance();
            return Ok(items);
        }
        loop {
            items.push(self.parse_or()?);
            if *self.peek() == TokenKind::Comma {
                self.advance();
                continue;
            }
            self.expect(close, what)?;
            return Ok(items);
        }
    }
}

fn number(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < 9.0e15 {
        Value::Number(Number::from(n as i64))
    } else {
        Number::from_f64(n).map_or(Value::Null, Value::Number)
    }
}

fn as_number(value: &Value, context: &str) -> Result<f64, ExprError> {
    match value {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| ExprError::TypeMismatch(format!("{context}: number out of range"))),
        Value::String(s) => s
            .trim()
            .parse()
            .map_err(|_| ExprError::TypeMismatch(format!("{context}: '{s}' is not a number"))),
        other => Err(ExprError::TypeMismatch(format!("{context}: {other} is not a number"))),
    }
}

fn as_bool(value: &Value, context: &str) -> Result<bool, ExprError> {
    value
        .as_bool()
        .ok_or_else(|| ExprError::TypeMismatch(format!("{context}: {value} is not a boolean")))
}

/// A parsed rule expression, reusable across evaluations.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    source: String,
    ast: Expr,
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl Expression {
    pub fn parse(source: &str) -> Result<Self, ExprError> {
        let tokens = Tokenizer::tokenize(source)?;
        let mut parser = Parser { tokens, cursor: 0 };
        let ast = parser.parse_or()?;
        if *parser.peek() != TokenKind::Eof {
            return Err(parser.error("trailing input".into()));
        }
        Ok(Self {
            source: source.to_owned(),
            ast,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn ast(&self) -> &Expr {
        &self.ast
    }

    /// Evaluates against `scope`, a JSON object whose keys are the root
    /// variables. Unknown roots are an error; missing nested fields are null.
    pub fn evaluate(&self, scope: &Value) -> Result<Value, ExprError> {
        eval(&self.ast, scope)
    }

    pub fn evaluate_bool(&self, scope: &Value) -> Result<bool, ExprError> {
        match self.evaluate(scope)? {
            Value::Bool(b) => Ok(b),
            _ => Err(ExprError::NotBoolean),
        }
    }
}

fn lookup(segments: &[String], scope: &Value) -> Result<Value, ExprError> {
    let Some((root, rest)) = segments.split_first() else {
        return Err(ExprError::UnknownVariable(String::new()));
    };
    let mut current = scope
        .get(root)
        .ok_or_else(|| ExprError::UnknownVariable(root.clone()))?;
    for segment in rest {
        let next = match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        };
        match next {
            Some(value) => current = value,
            None => return Ok(Value::Null),
        }
    }
    Ok(current.clone())
}

fn eval(expr: &Expr, scope: &Value) -> Result<Value, ExprError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::List(items) => Ok(Value::Array(
            items
                .iter()
                .map(|item| eval(item, scope))
                .collect::<Result<_, _>>()?,
        )),
        Expr::Path(segments) => lookup(segments, scope),
        Expr::Unary(UnaryOp::Not, inner) => Ok(Value::Bool(!as_bool(&eval(inner, scope)?, "not")?)),
        Expr::Unary(UnaryOp::Neg, inner) => Ok(number(-as_number(&eval(inner, scope)?, "negation")?)),
        Expr::Binary(BinaryOp::And, left, right) => {
            if !as_bool(&eval(left, scope)?, "and")? {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(as_bool(&eval(right, scope)?, "and")?))
        }
        Expr::Binary(BinaryOp::Or, left, right) => {
            if as_bool(&eval(left, scope)?, "or")? {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(as_bool(&eval(right, scope)?, "or")?))
        }
        Expr::Binary(op, left, right) => {
            let left = eval(left, scope)?;
            let right = eval(right, scope)?;
            binary(*op, &left, &right)
        }
        Expr::Call(name, args) => {
            let args = args
                .iter()
                .map(|arg| eval(arg, scope))
                .collect::<Result<Vec<_>, _>>()?;
            call(name, &args)
        }
    }
}

fn binary(op: BinaryOp, left: &Value, right: &Value) -> Result<Value, ExprError> {
    match op {
        BinaryOp::Eq => Ok(Value::Bool(loose_eq(left, right))),
        BinaryOp::Ne => Ok(Value::Bool(!loose_eq(left, right))),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ordering = match (left, right) {
                (Value::String(a), Value::String(b)) => a.cmp(b),
                _ => {
                    let a = as_number(left, "comparison")?;
                    let b = as_number(right, "comparison")?;
                    a.partial_cmp(&b)
                        .ok_or_else(|| ExprError::TypeMismatch("comparison: NaN".into()))?
                }
            };
            Ok(Value::Bool(match op {
                BinaryOp::Lt => ordering.is_lt(),
                BinaryOp::Le => ordering.is_le(),
                BinaryOp::Gt => ordering.is_gt(),
                _ => ordering.is_ge(),
            }))
        }
        BinaryOp::In => match right {
            Value::Array(items) => Ok(Value::Bool(items.iter().any(|item| loose_eq(left, item)))),
            Value::String(haystack) => match left {
                Value::String(needle) => Ok(Value::Bool(haystack.contains(needle.as_str()))),
                other => Err(ExprError::TypeMismatch(format!("in: {other} is not a string"))),
            },
            Value::Object(map) => match left {
                Value::String(key) => Ok(Value::Bool(map.contains_key(key))),
                other => Err(ExprError::TypeMismatch(format!("in: {other} is not a key"))),
            },
            other => Err(ExprError::TypeMismatch(format!("in: {other} is not a collection"))),
        },
        BinaryOp::Add => match (left, right) {
            (Value::String(a), Value::String(b)) => Ok(Value::String(format!("{a}{b}"))),
            _ => Ok(number(as_number(left, "+")? + as_number(right, "+")?)),
        },
        BinaryOp::Sub => Ok(number(as_number(left, "-")? - as_number(right, "-")?)),
        BinaryOp::Mul => Ok(number(as_number(left, "*")? * as_number(right, "*")?)),
        BinaryOp::Div => {
            let divisor = as_number(right, "/")?;
            if divisor == 0.0 {
                return Err(ExprError::DivisionByZero);
            }
            Ok(number(as_number(left, "/")? / divisor))
        }
        BinaryOp::And => Ok(Value::Bool(as_bool(left, "and")? && as_bool(right, "and")?)),
        BinaryOp::Or => Ok(Value::Bool(as_bool(left, "or")? || as_bool(right, "or")?)),
    }
}

fn call(name: &str, args: &[Value]) -> Result<Value, ExprError> {
    let single = || {
        args.first()
            .filter(|_| args.len() == 1)
            .ok_or_else(|| ExprError::TypeMismatch(format!("{name} takes one argument")))
    };
    match name {
        "len" => match single()? {
            Value::String(s) => Ok(Value::from(s.chars().count())),
            Value::Array(items) => Ok(Value::from(items.len())),
            Value::Object(map) => Ok(Value::from(map.len())),
            Value::Null => Ok(Value::from(0)),
            other => Err(ExprError::TypeMismatch(format!("len: {other}"))),
        },
        "lower" | "upper" => match single()? {
            Value::String(s) if name == "lower" => Ok(Value::String(s.to_lowercase())),
            Value::String(s) => Ok(Value::String(s.to_uppercase())),
            other => Err(ExprError::TypeMismatch(format!("{name}: {other} is not a string"))),
        },
        "is_null" => Ok(Value::Bool(single()?.is_null())),
        "abs" => Ok(number(as_number(single()?, "abs")?.abs())),
        "min" | "max" => {
            let mut values = args.iter().map(|v| as_number(v, name));
            let first = values
                .next()
                .ok_or_else(|| ExprError::TypeMismatch(format!("{name} needs arguments")))??;
            values
                .try_fold(first, |acc, v| -> Result<f64, ExprError> {
                    let v = v?;
                    Ok(if name == "min" { acc.min(v) } else { acc.max(v) })
                })
                .map(number)
        }
        other => Err(ExprError::UnknownFunction(other.to_owned())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn check(source: &str, scope: &Value) -> Result<bool, ExprError> {
        Expression::parse(source)?.evaluate_bool(scope)
    }

    #[test]
    fn precedence_and_short_circuit() {
        let scope = json!({"params": {"amount": 50}, "before": {"bill": {"outstanding": 80}}});
        assert_eq!(
            check("params.amount > 0 && params.amount <= before.bill.outstanding", &scope),
            Ok(true)
        );
        assert_eq!(check("1 + 2 * 3 == 7", &scope), Ok(true));
        assert_eq!(check("(1 + 2) * 3 == 9", &scope), Ok(true));
        // right side would fail (missing root) but is never evaluated
        assert_eq!(check("true or nothing.here", &scope), Ok(true));
    }

    #[test]
    fn membership_and_functions() {
        let scope = json!({"after": {"status": "vacant_clean", "name": "Alice"}});
        assert_eq!(
            check("after.status in ['vacant_clean', 'vacant_dirty']", &scope),
            Ok(true)
        );
        assert_eq!(check("lower(after.name) == \"alice\"", &scope), Ok(true));
        assert_eq!(check("len(after.name) == 5 and not is_null(after.status)", &scope), Ok(true));
        assert_eq!(check("max(1, 7, 3) == 7 && min(4, -2) == -2", &scope), Ok(true));
    }

    #[test]
    fn unknown_root_is_an_error_but_missing_field_is_null() {
        let scope = json!({"params": {}});
        assert!(matches!(
            check("ghost == 1", &scope),
            Err(ExprError::UnknownVariable(name)) if name == "ghost"
        ));
        assert_eq!(check("is_null(params.room_id)", &scope), Ok(true));
    }

    #[test]
    fn comparing_null_with_number_is_a_type_error() {
        let scope = json!({"before": {}});
        assert!(matches!(
            check("before.bill.outstanding <= 0", &scope),
            Err(ExprError::TypeMismatch(_))
        ));
    }

    #[test]
    fn non_boolean_result_is_rejected() {
        assert_eq!(check("1 + 1", &json!({})), Err(ExprError::NotBoolean));
    }

    #[test]
    fn arbitrary_calls_are_rejected_at_parse_time() {
        assert!(matches!(
            Expression::parse("system('rm -rf /')"),
            Err(ExprError::UnknownFunction(name)) if name == "system"
        ));
        assert!(matches!(Expression::parse("a ="), Err(ExprError::Parse { .. })));
        assert!(matches!(Expression::parse("1 2"), Err(ExprError::Parse { .. })));
    }

    #[test]
    fn division_by_zero_fails() {
        assert_eq!(check("10 / 0 > 1", &json!({})), Err(ExprError::DivisionByZero));
    }
}
