//! Operator rule table.
//!
//! Binary operators dispatch on the pair of operand kinds. Int pairs stay
//! int (checked), any pair with a float promotes to float, `/` always
//! yields a float. Pairs without a rule are `UnsupportedOperand`.

use crate::bytecode::BinOp;
use crate::runtime::runtime_error::{RuntimeError, RuntimeErrorKind};
use crate::runtime::value::Value;

fn unsupported(op: BinOp, l: &Value, r: &Value) -> RuntimeError {
    RuntimeErrorKind::UnsupportedOperand(format!(
        "{} {} {}",
        l.describe(),
        op.symbol(),
        r.describe()
    ))
    .into()
}

fn as_float(v: &Value) -> Option<f64> {
    match v {
        Value::Int(n) => Some(*n as f64),
        Value::Float(n) => Some(*n),
        _ => None,
    }
}

fn is_numeric(v: &Value) -> bool {
    matches!(v, Value::Int(_) | Value::Float(_))
}

/// Truthiness used by conditions, `&`, `|` and `!`.
pub fn truthy(v: &Value) -> bool {
    match v {
        Value::Nil => false,
        Value::Bool(b) => *b,
        Value::Int(n) => *n != 0,
        Value::Float(n) => *n != 0.0,
        Value::Char(c) => *c != '\0',
        Value::Str(s) => !s.is_empty(),
        _ => true,
    }
}

pub fn binary(op: BinOp, l: &Value, r: &Value) -> Result<Value, RuntimeError> {
    match op {
        BinOp::Add | BinOp::Sub | BinOp::Mul => arithmetic(op, l, r),
        BinOp::Div => divide(l, r),
        BinOp::Mod => match (l, r) {
            (Value::Int(_), Value::Int(0)) => Err(RuntimeErrorKind::DivisionByZero.into()),
            (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a.wrapping_rem(*b))),
            _ => Err(unsupported(op, l, r)),
        },
        BinOp::Gt | BinOp::Lt | BinOp::Ge | BinOp::Le => compare(op, l, r),
        BinOp::Eq => equals(l, r).map(Value::Bool),
        BinOp::Ne => equals(l, r).map(|eq| Value::Bool(!eq)),
        BinOp::And => Ok(Value::Bool(truthy(l) && truthy(r))),
        BinOp::Or => Ok(Value::Bool(truthy(l) || truthy(r))),
    }
}

fn arithmetic(op: BinOp, l: &Value, r: &Value) -> Result<Value, RuntimeError> {
    match (l, r) {
        (Value::Int(a), Value::Int(b)) => {
            let result = match op {
                BinOp::Add => a.checked_add(*b),
                BinOp::Sub => a.checked_sub(*b),
                _ => a.checked_mul(*b),
            };
            result
                .map(Value::Int)
                .ok_or_else(|| RuntimeErrorKind::Overflow.into())
        }
        (Value::Str(a), Value::Str(b)) if op == BinOp::Add => Ok(Value::Str(format!("{}{}", a, b))),
        _ => match (as_float(l), as_float(r)) {
            (Some(a), Some(b)) => Ok(Value::Float(match op {
                BinOp::Add => a + b,
                BinOp::Sub => a - b,
                _ => a * b,
            })),
            _ => Err(unsupported(op, l, r)),
        },
    }
}

fn divide(l: &Value, r: &Value) -> Result<Value, RuntimeError> {
    match (as_float(l), as_float(r)) {
        (Some(_), Some(b)) if b == 0.0 => Err(RuntimeErrorKind::DivisionByZero.into()),
        (Some(a), Some(b)) => Ok(Value::Float(a / b)),
        _ => Err(unsupported(BinOp::Div, l, r)),
    }
}

fn compare(op: BinOp, l: &Value, r: &Value) -> Result<Value, RuntimeError> {
    let ordering = match (l, r) {
        (Value::Int(a), Value::Int(b)) => a.partial_cmp(b),
        (Value::Char(a), Value::Char(b)) => a.partial_cmp(b),
        _ => match (as_float(l), as_float(r)) {
            (Some(a), Some(b)) => a.partial_cmp(&b),
            _ => return Err(unsupported(op, l, r)),
        },
    };
    let Some(ordering) = ordering else {
        // NaN compares false both ways
        return Ok(Value::Bool(false));
    };
    Ok(Value::Bool(match op {
        BinOp::Gt => ordering.is_gt(),
        BinOp::Lt => ordering.is_lt(),
        BinOp::Ge => ordering.is_ge(),
        _ => ordering.is_le(),
    }))
}

fn equals(l: &Value, r: &Value) -> Result<bool, RuntimeError> {
    match (l, r) {
        (Value::Int(a), Value::Int(b)) => Ok(a == b),
        (Value::Nil, Value::Nil) => Ok(true),
        (Value::Nil, _) | (_, Value::Nil) => Ok(false),
        (Value::Bool(a), Value::Bool(b)) => Ok(a == b),
        (Value::Bool(b), n) | (n, Value::Bool(b)) if is_numeric(n) => Ok(*b == truthy(n)),
        (Value::Str(a), Value::Str(b)) => Ok(a == b),
        (Value::Char(a), Value::Char(b)) => Ok(a == b),
        _ => match (as_float(l), as_float(r)) {
            (Some(a), Some(b)) => Ok(a == b),
            _ => Err(unsupported(BinOp::Eq, l, r)),
        },
    }
}

pub fn negate(v: &Value) -> Result<Value, RuntimeError> {
    match v {
        Value::Int(n) => n
            .checked_neg()
            .map(Value::Int)
            .ok_or_else(|| RuntimeErrorKind::Overflow.into()),
        Value::Float(n) => Ok(Value::Float(-n)),
        other => Err(RuntimeErrorKind::UnsupportedOperand(format!("-{}", other.describe())).into()),
    }
}

pub fn not(v: &Value) -> Value {
    match v {
        Value::Nil | Value::Bool(_) | Value::Int(_) | Value::Float(_) => Value::Bool(!truthy(v)),
        _ => Value::Bool(false),
    }
}
