//! Calculator module
//!
//! Evaluates prefix expressions of the form `<op> <a> <b>` over 64-bit
//! integers. Tokens are separated by runs of spaces; anything after the
//! second operand is ignored.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Evaluation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EvalError {
    #[error("Not enough arguments")]
    OperationIncomplete,

    #[error("Operation not supported: {0}")]
    InvalidOperation(String),

    #[error("One of the operands is not an integer")]
    NotAnInteger,

    #[error("Division by zero not allowed")]
    DivisionByZero,

    #[error("Result does not fit in a 64-bit integer")]
    Overflow,
}

pub type EvalResult<T> = Result<T, EvalError>;

/// Supported binary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Add,
    Subtract,
    Multiply,
    Divide,
}

impl Operator {
    /// Apply the operator. Exact quotients stay integers.
    pub fn apply(&self, a: i64, b: i64) -> EvalResult<Value> {
        let integer = |v: Option<i64>| v.map(Value::Integer).ok_or(EvalError::Overflow);

        match self {
            Operator::Add => integer(a.checked_add(b)),
            Operator::Subtract => integer(a.checked_sub(b)),
            Operator::Multiply => integer(a.checked_mul(b)),
            Operator::Divide => {
                if b == 0 {
                    return Err(EvalError::DivisionByZero);
                }
                match a.checked_rem(b) {
                    Some(0) => integer(a.checked_div(b)),
                    Some(_) => Ok(Value::Real(a as f64 / b as f64)),
                    None => Err(EvalError::Overflow),
                }
            }
        }
    }
}

impl FromStr for Operator {
    type Err = EvalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "+" => Ok(Operator::Add),
            "-" => Ok(Operator::Subtract),
            "*" => Ok(Operator::Multiply),
            "/" => Ok(Operator::Divide),
            other => Err(EvalError::InvalidOperation(other.to_string())),
        }
    }
}

/// Result of an evaluation
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Integer(i64),
    /// Only produced by a division that doesn't come out even
    Real(f64),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Integer(v) => write!(f, "{}", v),
            Value::Real(v) => write!(f, "{}", v),
        }
    }
}

/// Split an expression into tokens, collapsing repeated spaces
pub fn tokenize(expression: &str) -> Vec<&str> {
    expression
        .trim()
        .split(' ')
        .filter(|token| !token.is_empty())
        .collect()
}

/// Evaluate a prefix expression such as `+ 1 2`
pub fn evaluate(expression: &str) -> EvalResult<Value> {
    let tokens = tokenize(expression);
    if tokens.len() < 3 {
        return Err(EvalError::OperationIncomplete);
    }

    let operator: Operator = tokens[0].parse()?;
    let a = parse_operand(tokens[1])?;
    let b = parse_operand(tokens[2])?;

    operator.apply(a, b)
}

fn parse_operand(token: &str) -> EvalResult<i64> {
    token.parse().map_err(|_| EvalError::NotAnInteger)
}
