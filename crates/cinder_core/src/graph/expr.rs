use std::collections::HashMap;
use std::fmt;

use cinder_error::{DbError, Result};

/// Variables visible to expressions in a single fork.
pub type Variables = HashMap<String, i64>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOperator {
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
}

impl fmt::Display for BinaryOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::Eq => "=",
            Self::NotEq => "!=",
            Self::Lt => "<",
            Self::LtEq => "<=",
            Self::Gt => ">",
            Self::GtEq => ">=",
            Self::And => "AND",
            Self::Or => "OR",
        };
        write!(f, "{s}")
    }
}

/// Expressions used by control flow and assignment nodes.
///
/// Everything evaluates to an i64. Booleans are represented as 0 (false) and
/// anything non-zero (true).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    Literal(i64),
    Variable(String),
    Not(Box<Expr>),
    Binary {
        op: BinaryOperator,
        left: Box<Expr>,
        right: Box<Expr>,
    },
}

impl Expr {
    pub fn lit(v: i64) -> Self {
        Expr::Literal(v)
    }

    pub fn var(name: impl Into<String>) -> Self {
        Expr::Variable(name.into())
    }

    pub fn binary(op: BinaryOperator, left: Expr, right: Expr) -> Self {
        Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn add(self, other: Expr) -> Self {
        Self::binary(BinaryOperator::Add, self, other)
    }

    pub fn sub(self, other: Expr) -> Self {
        Self::binary(BinaryOperator::Sub, self, other)
    }

    pub fn lt(self, other: Expr) -> Self {
        Self::binary(BinaryOperator::Lt, self, other)
    }

    pub fn eq(self, other: Expr) -> Self {
        Self::binary(BinaryOperator::Eq, self, other)
    }

    pub fn eval(&self, vars: &Variables) -> Result<i64> {
        match self {
            Self::Literal(v) => Ok(*v),
            Self::Variable(name) => vars
                .get(name)
                .copied()
                .ok_or_else(|| DbError::new("Unknown variable").with_field("name", name)),
            Self::Not(expr) => Ok((expr.eval(vars)? == 0) as i64),
            Self::Binary { op, left, right } => {
                let left = left.eval(vars)?;
                let right = right.eval(vars)?;
                let overflow = || {
                    DbError::new("Integer overflow")
                        .with_field("left", left)
                        .with_field("op", op)
                        .with_field("right", right)
                };

                Ok(match op {
                    BinaryOperator::Add => left.checked_add(right).ok_or_else(overflow)?,
                    BinaryOperator::Sub => left.checked_sub(right).ok_or_else(overflow)?,
                    BinaryOperator::Mul => left.checked_mul(right).ok_or_else(overflow)?,
                    BinaryOperator::Div => {
                        if right == 0 {
                            return Err(DbError::new("Division by zero"));
                        }
                        left.checked_div(right).ok_or_else(overflow)?
                    }
                    BinaryOperator::Eq => (left == right) as i64,
                    BinaryOperator::NotEq => (left != right) as i64,
                    BinaryOperator::Lt => (left < right) as i64,
                    BinaryOperator::LtEq => (left <= right) as i64,
                    BinaryOperator::Gt => (left > right) as i64,
                    BinaryOperator::GtEq => (left >= right) as i64,
                    BinaryOperator::And => (left != 0 && right != 0) as i64,
                    BinaryOperator::Or => (left != 0 || right != 0) as i64,
                })
            }
        }
    }

    pub fn eval_bool(&self, vars: &Variables) -> Result<bool> {
        Ok(self.eval(vars)? != 0)
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal(v) => write!(f, "{v}"),
            Self::Variable(name) => write!(f, "{name}"),
            Self::Not(expr) => write!(f, "NOT {expr}"),
            Self::Binary { op, left, right } => write!(f, "({left} {op} {right})"),
        }
    }
}
