//! Evaluator for the vendor's register formula language.
//!
//! Register maps describe the raw to display conversion (and back) with small
//! infix expressions such as `# / 2`, `(# - 30) x 10` or `IF(#>50,1,0)`, where
//! `#` stands for the value being converted. The grammar is a fixed arithmetic
//! and conditional subset:
//!
//! ```text
//! expr    := compare
//! compare := sum (("<" | ">" | "<=" | ">=" | "==" | "!=") sum)*
//! sum     := product (("+" | "-") product)*
//! product := unary (("*" | "x" | "/" | "%" | "Mod") unary)*
//! unary   := ("+" | "-") unary | primary
//! primary := number | "#" | "(" expr ")" | ("IF" | "int") "(" expr ("," expr)* ")"
//! ```
//!
//! Formulas are parsed into an expression tree once and never executed as host
//! code. Integer arithmetic stays integral, `/` always produces a float.
//!
//! ```
//! use aguaiot_lib::formula::{self, Number};
//!
//! assert_eq!(formula::evaluate("IF(#>50,1,0)", Number::Int(75)).unwrap(), Number::Int(1));
//! assert_eq!(formula::evaluate("# / 2", Number::Int(43)).unwrap(), Number::Float(21.5));
//! assert_eq!(formula::evaluate_raw("# x 2", Number::Float(21.5)).unwrap(), 43);
//! ```

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Errors raised while parsing or evaluating a formula.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EvaluationError {
    #[error("unexpected character '{ch}' at position {pos} in '{formula}'")]
    UnexpectedChar {
        formula: String,
        pos: usize,
        ch: char,
    },
    #[error("unexpected {found} in '{formula}'")]
    UnexpectedToken { formula: String, found: String },
    #[error("unexpected end of '{0}'")]
    UnexpectedEnd(String),
    #[error("unknown name '{name}' in '{formula}'")]
    UnknownName { formula: String, name: String },
    #[error("{name}() takes {expected} argument(s), {found} given")]
    Arity {
        name: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("division by zero")]
    DivisionByZero,
    #[error("integer overflow")]
    Overflow,
    #[error("result is not a finite number")]
    NotFinite,
}

type Result<T> = std::result::Result<T, EvaluationError>;

/// A formula operand or result.
///
/// Keeps track of whether a value is integral so `# x 10` of a raw register
/// stays an integer while `# / 10` becomes a float.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Number {
    Int(i64),
    Float(f64),
}

impl Number {
    pub fn as_f64(self) -> f64 {
        match self {
            Number::Int(v) => v as f64,
            Number::Float(v) => v,
        }
    }

    /// Truncates toward zero, like the formula's `int()`.
    pub fn trunc(self) -> Result<i64> {
        match self {
            Number::Int(v) => Ok(v),
            Number::Float(v) if v.is_finite() => {
                let t = v.trunc();
                if t < i64::MIN as f64 || t > i64::MAX as f64 {
                    Err(EvaluationError::Overflow)
                } else {
                    Ok(t as i64)
                }
            }
            Number::Float(_) => Err(EvaluationError::NotFinite),
        }
    }

    pub fn is_truthy(self) -> bool {
        self.as_f64() != 0.0
    }

    fn from_bool(b: bool) -> Self {
        Number::Int(b as i64)
    }

    fn checked(v: f64) -> Result<Self> {
        if v.is_finite() {
            Ok(Number::Float(v))
        } else {
            Err(EvaluationError::NotFinite)
        }
    }
}

impl PartialEq for Number {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Number::Int(a), Number::Int(b)) => a == b,
            _ => self.as_f64() == other.as_f64(),
        }
    }
}

impl PartialOrd for Number {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Number::Int(a), Number::Int(b)) => Some(a.cmp(b)),
            _ => self.as_f64().partial_cmp(&other.as_f64()),
        }
    }
}

impl From<i64> for Number {
    fn from(v: i64) -> Self {
        Number::Int(v)
    }
}

impl From<f64> for Number {
    fn from(v: f64) -> Self {
        Number::Float(v)
    }
}

impl fmt::Display for Number {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Number::Int(v) => write!(f, "{v}"),
            // Debug keeps the trailing ".0" of integral floats.
            Number::Float(v) => write!(f, "{v:?}"),
        }
    }
}

impl FromStr for Number {
    type Err = std::num::ParseFloatError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        match s.parse::<i64>() {
            Ok(v) => Ok(Number::Int(v)),
            Err(_) => s.parse::<f64>().map(Number::Float),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Lt,
    Gt,
    Le,
    Ge,
    Eq,
    Ne,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(Number),
    Placeholder,
    Op(BinOp),
    LParen,
    RParen,
    Comma,
    Ident(String),
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Num(n) => write!(f, "number {n}"),
            Token::Placeholder => f.write_str("'#'"),
            Token::Op(op) => write!(f, "operator {op:?}"),
            Token::LParen => f.write_str("'('"),
            Token::RParen => f.write_str("')'"),
            Token::Comma => f.write_str("','"),
            Token::Ident(name) => write!(f, "'{name}'"),
        }
    }
}

fn tokenize(src: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            ' ' | '\t' | '\r' | '\n' => {}
            '#' => tokens.push(Token::Placeholder),
            '+' => tokens.push(Token::Op(BinOp::Add)),
            '-' => tokens.push(Token::Op(BinOp::Sub)),
            '*' => tokens.push(Token::Op(BinOp::Mul)),
            '/' => tokens.push(Token::Op(BinOp::Div)),
            '%' => tokens.push(Token::Op(BinOp::Mod)),
            '(' => tokens.push(Token::LParen),
            ')' => tokens.push(Token::RParen),
            ',' => tokens.push(Token::Comma),
            '<' | '>' | '=' | '!' => {
                let (op, len) = match (c, next) {
                    ('<', Some('=')) => (BinOp::Le, 2),
                    ('>', Some('=')) => (BinOp::Ge, 2),
                    ('=', Some('=')) => (BinOp::Eq, 2),
                    ('!', Some('=')) => (BinOp::Ne, 2),
                    ('<', _) => (BinOp::Lt, 1),
                    ('>', _) => (BinOp::Gt, 1),
                    _ => {
                        return Err(EvaluationError::UnexpectedChar {
                            formula: src.to_string(),
                            pos: i,
                            ch: c,
                        })
                    }
                };
                tokens.push(Token::Op(op));
                i += len;
                continue;
            }
            c if c.is_ascii_digit() || c == '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let literal: String = chars[start..i].iter().collect();
                let number = literal
                    .parse::<Number>()
                    .map_err(|_| EvaluationError::UnexpectedToken {
                        formula: src.to_string(),
                        found: format!("literal '{literal}'"),
                    })?;
                tokens.push(Token::Num(number));
                continue;
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "x" => Token::Op(BinOp::Mul),
                    "Mod" => Token::Op(BinOp::Mod),
                    _ => Token::Ident(word),
                });
                continue;
            }
            _ => {
                return Err(EvaluationError::UnexpectedChar {
                    formula: src.to_string(),
                    pos: i,
                    ch: c,
                })
            }
        }
        i += 1;
    }
    Ok(tokens)
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Function {
    If,
    Int,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Num(Number),
    Placeholder,
    Neg(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    /// Chained comparison, `a < b < c` holds when every link holds.
    Compare(Box<Expr>, Vec<(BinOp, Expr)>),
    Call(Function, Vec<Expr>),
}

struct Parser<'a> {
    src: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Result<Token> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or_else(|| EvaluationError::UnexpectedEnd(self.src.to_string()))?;
        self.pos += 1;
        Ok(token)
    }

    fn unexpected(&self, token: &Token) -> EvaluationError {
        EvaluationError::UnexpectedToken {
            formula: self.src.to_string(),
            found: token.to_string(),
        }
    }

    fn expect(&mut self, expected: Token) -> Result<()> {
        let token = self.next()?;
        if token == expected {
            Ok(())
        } else {
            Err(self.unexpected(&token))
        }
    }

    fn expr(&mut self) -> Result<Expr> {
        let first = self.sum()?;
        let mut links = Vec::new();
        while let Some(Token::Op(
            op @ (BinOp::Lt | BinOp::Gt | BinOp::Le | BinOp::Ge | BinOp::Eq | BinOp::Ne),
        )) = self.peek()
        {
            let op = *op;
            self.pos += 1;
            links.push((op, self.sum()?));
        }
        if links.is_empty() {
            Ok(first)
        } else {
            Ok(Expr::Compare(Box::new(first), links))
        }
    }

    fn sum(&mut self) -> Result<Expr> {
        let mut lhs = self.product()?;
        while let Some(Token::Op(op @ (BinOp::Add | BinOp::Sub))) = self.peek() {
            let op = *op;
            self.pos += 1;
            let rhs = self.product()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn product(&mut self) -> Result<Expr> {
        let mut lhs = self.unary()?;
        while let Some(Token::Op(op @ (BinOp::Mul | BinOp::Div | BinOp::Mod))) = self.peek() {
            let op = *op;
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr> {
        match self.peek() {
            Some(Token::Op(BinOp::Sub)) => {
                self.pos += 1;
                Ok(Expr::Neg(Box::new(self.unary()?)))
            }
            Some(Token::Op(BinOp::Add)) => {
                self.pos += 1;
                self.unary()
            }
            _ => self.primary(),
        }
    }

    fn primary(&mut self) -> Result<Expr> {
        match self.next()? {
            Token::Num(n) => Ok(Expr::Num(n)),
            Token::Placeholder => Ok(Expr::Placeholder),
            Token::LParen => {
                let inner = self.expr()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Token::Ident(name) => {
                let (function, arity, label) = match name.as_str() {
                    "IF" => (Function::If, 3, "IF"),
                    "int" => (Function::Int, 1, "int"),
                    _ => {
                        return Err(EvaluationError::UnknownName {
                            formula: self.src.to_string(),
                            name,
                        })
                    }
                };
                self.expect(Token::LParen)?;
                let mut args = vec![self.expr()?];
                while let Some(Token::Comma) = self.peek() {
                    self.pos += 1;
                    args.push(self.expr()?);
                }
                self.expect(Token::RParen)?;
                if args.len() != arity {
                    return Err(EvaluationError::Arity {
                        name: label,
                        expected: arity,
                        found: args.len(),
                    });
                }
                Ok(Expr::Call(function, args))
            }
            token => Err(self.unexpected(&token)),
        }
    }
}

fn floored_mod_int(a: i64, b: i64) -> Result<i64> {
    if b == 0 {
        return Err(EvaluationError::DivisionByZero);
    }
    let r = a.checked_rem(b).ok_or(EvaluationError::Overflow)?;
    Ok(if r != 0 && ((r < 0) != (b < 0)) { r + b } else { r })
}

fn floored_mod_float(a: f64, b: f64) -> Result<f64> {
    if b == 0.0 {
        return Err(EvaluationError::DivisionByZero);
    }
    let r = a % b;
    Ok(if r != 0.0 && ((r < 0.0) != (b < 0.0)) { r + b } else { r })
}

fn apply(op: BinOp, lhs: Number, rhs: Number) -> Result<Number> {
    use Number::{Float, Int};
    let int_op = |r: Option<i64>| r.map(Int).ok_or(EvaluationError::Overflow);
    match (op, lhs, rhs) {
        (BinOp::Add, Int(a), Int(b)) => int_op(a.checked_add(b)),
        (BinOp::Sub, Int(a), Int(b)) => int_op(a.checked_sub(b)),
        (BinOp::Mul, Int(a), Int(b)) => int_op(a.checked_mul(b)),
        (BinOp::Mod, Int(a), Int(b)) => floored_mod_int(a, b).map(Int),
        (BinOp::Add, a, b) => Number::checked(a.as_f64() + b.as_f64()),
        (BinOp::Sub, a, b) => Number::checked(a.as_f64() - b.as_f64()),
        (BinOp::Mul, a, b) => Number::checked(a.as_f64() * b.as_f64()),
        (BinOp::Mod, a, b) => Ok(Float(floored_mod_float(a.as_f64(), b.as_f64())?)),
        (BinOp::Div, a, b) => {
            if b.as_f64() == 0.0 {
                Err(EvaluationError::DivisionByZero)
            } else {
                Number::checked(a.as_f64() / b.as_f64())
            }
        }
        (BinOp::Lt, a, b) => Ok(Number::from_bool(a < b)),
        (BinOp::Gt, a, b) => Ok(Number::from_bool(a > b)),
        (BinOp::Le, a, b) => Ok(Number::from_bool(a <= b)),
        (BinOp::Ge, a, b) => Ok(Number::from_bool(a >= b)),
        (BinOp::Eq, a, b) => Ok(Number::from_bool(a == b)),
        (BinOp::Ne, a, b) => Ok(Number::from_bool(a != b)),
    }
}

impl Expr {
    fn eval(&self, input: Number) -> Result<Number> {
        match self {
            Expr::Num(n) => Ok(*n),
            Expr::Placeholder => Ok(input),
            Expr::Neg(inner) => match inner.eval(input)? {
                Number::Int(v) => v.checked_neg().map(Number::Int).ok_or(EvaluationError::Overflow),
                Number::Float(v) => Ok(Number::Float(-v)),
            },
            Expr::Binary(op, lhs, rhs) => apply(*op, lhs.eval(input)?, rhs.eval(input)?),
            Expr::Compare(first, links) => {
                let mut lhs = first.eval(input)?;
                for (op, rhs) in links {
                    let rhs = rhs.eval(input)?;
                    if !apply(*op, lhs, rhs)?.is_truthy() {
                        return Ok(Number::Int(0));
                    }
                    lhs = rhs;
                }
                Ok(Number::Int(1))
            }
            Expr::Call(Function::If, args) => {
                if args[0].eval(input)?.is_truthy() {
                    args[1].eval(input)
                } else {
                    args[2].eval(input)
                }
            }
            Expr::Call(Function::Int, args) => args[0].eval(input)?.trunc().map(Number::Int),
        }
    }
}

/// A parsed register formula.
#[derive(Debug, Clone, PartialEq)]
pub struct Formula {
    source: String,
    expr: Expr,
}

impl Formula {
    pub fn parse(source: &str) -> Result<Self> {
        let mut parser = Parser {
            src: source,
            tokens: tokenize(source)?,
            pos: 0,
        };
        let expr = parser.expr()?;
        if let Some(token) = parser.peek() {
            return Err(parser.unexpected(token));
        }
        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluates the formula with `#` bound to `input`.
    pub fn evaluate(&self, input: Number) -> Result<Number> {
        self.expr.eval(input)
    }
}

impl FromStr for Formula {
    type Err = EvaluationError;

    fn from_str(s: &str) -> Result<Self> {
        Formula::parse(s)
    }
}

/// Parses `formula` and evaluates it with `#` bound to `input`.
pub fn evaluate(formula: &str, input: Number) -> Result<Number> {
    Formula::parse(formula)?.evaluate(input)
}

/// Like [`evaluate`], with the result truncated to an integer register value.
pub fn evaluate_raw(formula: &str, input: Number) -> Result<i64> {
    evaluate(formula, input)?.trunc()
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn eval(formula: &str, input: i64) -> Number {
        evaluate(formula, Number::Int(input)).unwrap()
    }

    #[test]
    fn placeholder_and_precedence() {
        assert_eq!(eval("#", 3), Number::Int(3));
        assert_eq!(eval("2 + # * 3", 4), Number::Int(14));
        assert_eq!(eval("(2 + #) * 3", 4), Number::Int(18));
        assert_eq!(eval("10 - 4 - 3", 0), Number::Int(3));
        assert_eq!(eval("# x 10", 7), Number::Int(70));
        assert_eq!(eval("-# + 1", 7), Number::Int(-6));
    }

    #[test]
    fn division_is_float() {
        assert_matches!(eval("# / 2", 43), Number::Float(v) if v == 21.5);
        assert_matches!(eval("# / 2", 42), Number::Float(v) if v == 21.0);
        assert_eq!(eval("# / 2", 42).to_string(), "21.0");
        assert_matches!(
            evaluate("# / 0", Number::Int(1)),
            Err(EvaluationError::DivisionByZero)
        );
    }

    #[test]
    fn modulo() {
        assert_eq!(eval("# Mod 256", 513), Number::Int(1));
        assert_eq!(eval("# % 256", 513), Number::Int(1));
        assert_eq!(eval("# Mod 3", -7), Number::Int(2));
        assert_eq!(eval("2 * # Mod 5", 4), Number::Int(3));
        assert_matches!(
            evaluate("# Mod 0", Number::Int(1)),
            Err(EvaluationError::DivisionByZero)
        );
    }

    #[test]
    fn conditionals() {
        assert_eq!(eval("IF(#>50,1,0)", 75), Number::Int(1));
        assert_eq!(eval("IF(#>50,1,0)", 10), Number::Int(0));
        assert_eq!(eval("IF(# == 0, 100, # / 4)", 0), Number::Int(100));
        assert_eq!(eval("IF(#, 1, 1/0)", 5), Number::Int(1));
        assert_eq!(eval("IF(# > 127, # - 256, #)", 250), Number::Int(-6));
        assert_eq!(eval("1 < # < 5", 3), Number::Int(1));
        assert_eq!(eval("1 < # < 5", 6), Number::Int(0));
    }

    #[test]
    fn int_truncates() {
        assert_eq!(eval("int(# / 2)", 43), Number::Int(21));
        assert_eq!(eval("int(-# / 2)", 43), Number::Int(-21));
        assert_eq!(evaluate_raw("# * 2", Number::Float(21.5)).unwrap(), 43);
        assert_eq!(evaluate_raw("# / 3", Number::Int(10)).unwrap(), 3);
    }

    #[test]
    fn rejects_unknown_and_malformed() {
        assert_matches!(
            evaluate("__import__(#)", Number::Int(1)),
            Err(EvaluationError::UnknownName { .. })
        );
        assert_matches!(
            evaluate("pow(#, 2)", Number::Int(1)),
            Err(EvaluationError::UnknownName { .. })
        );
        assert_matches!(
            evaluate("# +", Number::Int(1)),
            Err(EvaluationError::UnexpectedEnd(..))
        );
        assert_matches!(
            evaluate("(# + 1", Number::Int(1)),
            Err(EvaluationError::UnexpectedEnd(..))
        );
        assert_matches!(
            evaluate("# 1", Number::Int(1)),
            Err(EvaluationError::UnexpectedToken { .. })
        );
        assert_matches!(
            evaluate("# ** 2", Number::Int(1)),
            Err(EvaluationError::UnexpectedToken { .. })
        );
        assert_matches!(
            evaluate("# ; 2", Number::Int(1)),
            Err(EvaluationError::UnexpectedChar { ch: ';', .. })
        );
        assert_matches!(
            evaluate("IF(#, 1)", Number::Int(1)),
            Err(EvaluationError::Arity { name: "IF", .. })
        );
        assert_matches!(
            evaluate("1.2.3", Number::Int(1)),
            Err(EvaluationError::UnexpectedToken { .. })
        );
    }

    #[test]
    fn inverse_round_trip() {
        // Half degree temperature register.
        let forward = Formula::parse("# / 2").unwrap();
        let inverse = Formula::parse("# x 2").unwrap();
        let mut display = 7.0;
        while display <= 30.0 {
            let raw = inverse.evaluate(Number::Float(display)).unwrap().trunc().unwrap();
            assert_eq!(forward.evaluate(Number::Int(raw)).unwrap(), Number::Float(display));
            display += 0.5;
        }

        // Offset encoded register.
        let forward = Formula::parse("# - 40").unwrap();
        let inverse = Formula::parse("# + 40").unwrap();
        for display in -20..=80 {
            let raw = inverse.evaluate(Number::Int(display)).unwrap().trunc().unwrap();
            assert_eq!(forward.evaluate(Number::Int(raw)).unwrap(), Number::Int(display));
        }
    }

    #[test]
    fn number_parsing_and_display() {
        assert_eq!("4".parse::<Number>().unwrap(), Number::Int(4));
        assert_matches!("4.5".parse::<Number>(), Ok(Number::Float(v)) if v == 4.5);
        assert!("four".parse::<Number>().is_err());
        assert_eq!(Number::Int(4), Number::Float(4.0));
        assert_eq!(Number::Float(0.1).to_string(), "0.1");
        assert_eq!(Number::Int(-3).to_string(), "-3");
    }
}
