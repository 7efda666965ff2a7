//! Custom PID formulas
//!
//! A formula such as `(A*256+B)/4` is parsed once into an [`Expr`] tree over
//! the byte variables `A`..`D` and interpreted for every reading. Only the
//! operators listed in [`BinaryOp`] exist; nothing else can be expressed.

use crate::pid::{hex_string, PidValue};
use std::fmt;
use std::iter::Peekable;
use std::str::CharIndices;
use thiserror::Error;
use tracing::debug;

/// Highest number of byte variables (`A`..`D`)
pub const MAX_VARIABLES: usize = 4;

const UNARY_BINDING_POWER: u8 = 6;

/// Errors from compiling or evaluating a formula
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FormulaError {
    #[error("formula is empty")]
    Empty,

    #[error("unexpected character '{ch}' at offset {offset}")]
    UnexpectedChar { ch: char, offset: usize },

    #[error("unknown identifier '{0}', expected one of A, B, C, D")]
    UnknownIdentifier(String),

    #[error("invalid number literal '{0}'")]
    InvalidNumber(String),

    #[error("unexpected {0}")]
    UnexpectedToken(String),

    #[error("unexpected end of formula")]
    UnexpectedEnd,

    #[error("variable {0} is not available for this reading")]
    MissingByte(char),

    #[error("division by zero")]
    DivisionByZero,

    #[error("arithmetic overflow")]
    Overflow,

    #[error("operator '{0}' needs integer operands")]
    NonIntegerOperand(BinaryOp),
}

/// Intermediate numeric value; integers stay integers until a division
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Number {
    Int(i64),
    Float(f64),
}

impl Number {
    fn as_f64(self) -> f64 {
        match self {
            Number::Int(i) => i as f64,
            Number::Float(f) => f,
        }
    }

    fn is_zero(self) -> bool {
        match self {
            Number::Int(i) => i == 0,
            Number::Float(f) => f == 0.0,
        }
    }
}

impl From<Number> for PidValue {
    fn from(number: Number) -> Self {
        match number {
            Number::Int(i) => PidValue::Integer(i),
            Number::Float(f) => PidValue::Float(f),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    BitAnd,
    BitOr,
    Shl,
    Shr,
}

impl BinaryOp {
    fn binding_power(self) -> u8 {
        match self {
            BinaryOp::BitOr => 1,
            BinaryOp::BitAnd => 2,
            BinaryOp::Shl | BinaryOp::Shr => 3,
            BinaryOp::Add | BinaryOp::Sub => 4,
            BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => 5,
        }
    }

    fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Rem => "%",
            BinaryOp::BitAnd => "&",
            BinaryOp::BitOr => "|",
            BinaryOp::Shl => "<<",
            BinaryOp::Shr => ">>",
        }
    }
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// Parsed formula
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Number),
    /// Index into the data bytes (`A` = 0)
    Var(usize),
    Neg(Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(Number),
    Var(usize),
    Op(BinaryOp),
    LParen,
    RParen,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Num(Number::Int(i)) => write!(f, "number {i}"),
            Token::Num(Number::Float(x)) => write!(f, "number {x}"),
            Token::Var(i) => write!(f, "variable {}", variable_name(*i)),
            Token::Op(op) => write!(f, "operator '{op}'"),
            Token::LParen => f.write_str("'('"),
            Token::RParen => f.write_str("')'"),
        }
    }
}

fn variable_name(index: usize) -> char {
    (b'A' + index as u8) as char
}

fn tokenize(source: &str) -> Result<Vec<Token>, FormulaError> {
    let mut tokens = Vec::new();
    let mut chars = source.char_indices().peekable();

    while let Some(&(offset, ch)) = chars.peek() {
        match ch {
            c if c.is_whitespace() => {
                chars.next();
            }
            '0'..='9' | '.' => tokens.push(Token::Num(lex_number(source, &mut chars)?)),
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = offset;
                let mut end = offset;
                while let Some(&(i, c)) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        end = i + c.len_utf8();
                        chars.next();
                    } else {
                        break;
                    }
                }
                let ident = &source[start..end];
                match ident {
                    "A" | "B" | "C" | "D" => tokens.push(Token::Var((ident.as_bytes()[0] - b'A') as usize)),
                    _ => return Err(FormulaError::UnknownIdentifier(ident.to_string())),
                }
            }
            '<' | '>' => {
                chars.next();
                match chars.next() {
                    Some((_, next)) if next == ch => tokens.push(Token::Op(if ch == '<' {
                        BinaryOp::Shl
                    } else {
                        BinaryOp::Shr
                    })),
                    _ => return Err(FormulaError::UnexpectedChar { ch, offset }),
                }
            }
            _ => {
                let token = match ch {
                    '+' => Token::Op(BinaryOp::Add),
                    '-' => Token::Op(BinaryOp::Sub),
                    '*' => Token::Op(BinaryOp::Mul),
                    '/' => Token::Op(BinaryOp::Div),
                    '%' => Token::Op(BinaryOp::Rem),
                    '&' => Token::Op(BinaryOp::BitAnd),
                    '|' => Token::Op(BinaryOp::BitOr),
                    '(' => Token::LParen,
                    ')' => Token::RParen,
                    _ => return Err(FormulaError::UnexpectedChar { ch, offset }),
                };
                chars.next();
                tokens.push(token);
            }
        }
    }

    Ok(tokens)
}

fn lex_number(source: &str, chars: &mut Peekable<CharIndices<'_>>) -> Result<Number, FormulaError> {
    let start = match chars.peek() {
        Some(&(i, _)) => i,
        None => return Err(FormulaError::UnexpectedEnd),
    };
    let mut end = start;
    while let Some(&(i, c)) = chars.peek() {
        if c.is_ascii_alphanumeric() || c == '.' {
            end = i + c.len_utf8();
            chars.next();
        } else {
            break;
        }
    }

    let literal = &source[start..end];
    let invalid = || FormulaError::InvalidNumber(literal.to_string());

    if let Some(hex) = literal.strip_prefix("0x").or_else(|| literal.strip_prefix("0X")) {
        return i64::from_str_radix(hex, 16).map(Number::Int).map_err(|_| invalid());
    }
    if literal.contains('.') {
        return literal.parse::<f64>().map(Number::Float).map_err(|_| invalid());
    }
    literal.parse::<i64>().map(Number::Int).map_err(|_| invalid())
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn parse_expr(&mut self, min_power: u8) -> Result<Expr, FormulaError> {
        let mut lhs = self.parse_prefix()?;

        while let Some(Token::Op(op)) = self.peek() {
            let op = *op;
            let power = op.binding_power();
            if power < min_power {
                break;
            }
            self.next();
            let rhs = self.parse_expr(power + 1)?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }

        Ok(lhs)
    }

    fn parse_prefix(&mut self) -> Result<Expr, FormulaError> {
        match self.next() {
            Some(Token::Num(n)) => Ok(Expr::Literal(n)),
            Some(Token::Var(i)) => Ok(Expr::Var(i)),
            Some(Token::Op(BinaryOp::Sub)) => Ok(Expr::Neg(Box::new(self.parse_expr(UNARY_BINDING_POWER)?))),
            Some(Token::Op(BinaryOp::Add)) => self.parse_expr(UNARY_BINDING_POWER),
            Some(Token::LParen) => {
                let inner = self.parse_expr(0)?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    Some(other) => Err(FormulaError::UnexpectedToken(other.to_string())),
                    None => Err(FormulaError::UnexpectedEnd),
                }
            }
            Some(other) => Err(FormulaError::UnexpectedToken(other.to_string())),
            None => Err(FormulaError::UnexpectedEnd),
        }
    }
}

/// Python-style modulo: the result takes the sign of the divisor
fn floor_rem_i64(a: i64, b: i64) -> Option<i64> {
    let r = a.checked_rem(b)?;
    if r != 0 && ((r < 0) != (b < 0)) {
        r.checked_add(b)
    } else {
        Some(r)
    }
}

fn floor_rem_f64(a: f64, b: f64) -> f64 {
    let r = a % b;
    if r != 0.0 && ((r < 0.0) != (b < 0.0)) {
        r + b
    } else {
        r
    }
}

fn apply(op: BinaryOp, lhs: Number, rhs: Number) -> Result<Number, FormulaError> {
    use Number::{Float, Int};

    let result = match (op, lhs, rhs) {
        (BinaryOp::Add, Int(a), Int(b)) => Int(a.checked_add(b).ok_or(FormulaError::Overflow)?),
        (BinaryOp::Sub, Int(a), Int(b)) => Int(a.checked_sub(b).ok_or(FormulaError::Overflow)?),
        (BinaryOp::Mul, Int(a), Int(b)) => Int(a.checked_mul(b).ok_or(FormulaError::Overflow)?),
        (BinaryOp::Add, a, b) => Float(a.as_f64() + b.as_f64()),
        (BinaryOp::Sub, a, b) => Float(a.as_f64() - b.as_f64()),
        (BinaryOp::Mul, a, b) => Float(a.as_f64() * b.as_f64()),
        (BinaryOp::Div, _, b) | (BinaryOp::Rem, _, b) if b.is_zero() => {
            return Err(FormulaError::DivisionByZero)
        }
        (BinaryOp::Div, a, b) => Float(a.as_f64() / b.as_f64()),
        (BinaryOp::Rem, Int(a), Int(b)) => Int(floor_rem_i64(a, b).ok_or(FormulaError::Overflow)?),
        (BinaryOp::Rem, a, b) => Float(floor_rem_f64(a.as_f64(), b.as_f64())),
        (BinaryOp::BitAnd, Int(a), Int(b)) => Int(a & b),
        (BinaryOp::BitOr, Int(a), Int(b)) => Int(a | b),
        (BinaryOp::Shl, Int(a), Int(b)) => {
            let shift = u32::try_from(b).ok().filter(|s| *s < 63).ok_or(FormulaError::Overflow)?;
            let shifted = a << shift;
            if shifted >> shift != a {
                return Err(FormulaError::Overflow);
            }
            Int(shifted)
        }
        (BinaryOp::Shr, Int(a), Int(b)) => {
            let shift = u32::try_from(b).map_err(|_| FormulaError::Overflow)?;
            Int(if shift >= 64 { if a < 0 { -1 } else { 0 } } else { a >> shift })
        }
        (op, _, _) => return Err(FormulaError::NonIntegerOperand(op)),
    };

    match result {
        Float(f) if !f.is_finite() => Err(FormulaError::Overflow),
        other => Ok(other),
    }
}

fn evaluate(expr: &Expr, bytes: &[u8], num_bytes: usize) -> Result<Number, FormulaError> {
    match expr {
        Expr::Literal(n) => Ok(*n),
        Expr::Var(i) => {
            if *i >= num_bytes {
                return Err(FormulaError::MissingByte(variable_name(*i)));
            }
            bytes
                .get(*i)
                .map(|b| Number::Int(i64::from(*b)))
                .ok_or(FormulaError::MissingByte(variable_name(*i)))
        }
        Expr::Neg(inner) => match evaluate(inner, bytes, num_bytes)? {
            Number::Int(i) => i.checked_neg().map(Number::Int).ok_or(FormulaError::Overflow),
            Number::Float(f) => Ok(Number::Float(-f)),
        },
        Expr::Binary(op, lhs, rhs) => {
            let lhs = evaluate(lhs, bytes, num_bytes)?;
            let rhs = evaluate(rhs, bytes, num_bytes)?;
            apply(*op, lhs, rhs)
        }
    }
}

/// Compiled custom PID formula
#[derive(Debug, Clone, PartialEq)]
pub struct Formula {
    source: String,
    num_bytes: usize,
    expr: Expr,
}

impl Formula {
    /// Parse `source`; variables past `num_bytes` compile but fail at
    /// evaluation time
    pub fn compile(source: &str, num_bytes: usize) -> Result<Self, FormulaError> {
        let tokens = tokenize(source)?;
        if tokens.is_empty() {
            return Err(FormulaError::Empty);
        }

        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.parse_expr(0)?;
        if let Some(extra) = parser.next() {
            return Err(FormulaError::UnexpectedToken(extra.to_string()));
        }

        Ok(Self {
            source: source.to_string(),
            num_bytes: num_bytes.min(MAX_VARIABLES),
            expr,
        })
    }

    /// Text the formula was compiled from
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn num_bytes(&self) -> usize {
        self.num_bytes
    }

    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    pub fn evaluate(&self, bytes: &[u8]) -> Result<Number, FormulaError> {
        evaluate(&self.expr, bytes, self.num_bytes)
    }

    /// Evaluate, rendering the raw bytes as hex when evaluation fails
    pub fn decode(&self, bytes: &[u8]) -> PidValue {
        match self.evaluate(bytes) {
            Ok(number) => number.into(),
            Err(e) => {
                debug!("Formula '{}' failed on {:02X?}: {}", self.source, bytes, e);
                hex_string(bytes)
            }
        }
    }
}
