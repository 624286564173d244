//! Dynamically-typed binary operators.
//!
//! Coercion is decided per operation from the operand types:
//! any string operand allows only `+` (concatenation of display forms) and
//! `*` (repetition by an integer count); otherwise any float operand widens
//! both sides to `f64`; otherwise the operation is integer arithmetic.

use super::error::{Result, VmError};
use super::{ArithOp, Value};

/// Longest string repetition may build, in bytes.
pub const MAX_STRING_LEN: usize = 1 << 28;

/// Compute `left OP right`.
pub fn apply(op: ArithOp, left: Value, right: Value) -> Result<Value> {
    match (&left, &right) {
        (Value::Str(_), _) | (_, Value::Str(_)) => string_op(op, left, right),
        (Value::Float(_), _) | (_, Value::Float(_)) => {
            let (a, b) = match (left.as_float(), right.as_float()) {
                (Some(a), Some(b)) => (a, b),
                _ => return Err(unsupported(op, &left, &right)),
            };
            float_op(op, a, b).ok_or_else(|| unsupported(op, &left, &right))
        }
        (Value::Int(a), Value::Int(b)) => int_op(op, *a, *b),
    }
}

fn unsupported(op: ArithOp, left: &Value, right: &Value) -> VmError {
    VmError::UnsupportedOperandTypes {
        op,
        left: left.type_name(),
        right: right.type_name(),
    }
}

fn string_op(op: ArithOp, left: Value, right: Value) -> Result<Value> {
    match (op, &left, &right) {
        (ArithOp::Add, _, _) => Ok(Value::Str(format!("{}{}", left, right))),
        (ArithOp::Mul, Value::Str(s), Value::Int(n)) | (ArithOp::Mul, Value::Int(n), Value::Str(s)) => {
            let count = usize::try_from(*n).unwrap_or(0);
            let len = s.len().saturating_mul(count);
            if len > MAX_STRING_LEN {
                return Err(VmError::StringTooLong {
                    len,
                    limit: MAX_STRING_LEN,
                });
            }
            Ok(Value::Str(s.repeat(count)))
        }
        _ => Err(unsupported(op, &left, &right)),
    }
}

/// `None` for the integer-only bitwise operators.
fn float_op(op: ArithOp, a: f64, b: f64) -> Option<Value> {
    let result = match op {
        ArithOp::Add => Value::Float(a + b),
        ArithOp::Sub => Value::Float(a - b),
        ArithOp::Mul => Value::Float(a * b),
        ArithOp::Div => Value::Float(a / b),
        ArithOp::Mod => Value::Float(a % b),
        ArithOp::Pow => Value::Float(a.powf(b)),
        ArithOp::Eq => Value::bool(a == b),
        ArithOp::Lt => Value::bool(a < b),
        ArithOp::Gt => Value::bool(a > b),
        ArithOp::Le => Value::bool(a <= b),
        ArithOp::Ge => Value::bool(a >= b),
        ArithOp::And | ArithOp::Or | ArithOp::Xor => return None,
    };
    Some(result)
}

fn int_op(op: ArithOp, a: i64, b: i64) -> Result<Value> {
    let result = match op {
        ArithOp::Add => Value::Int(a.wrapping_add(b)),
        ArithOp::Sub => Value::Int(a.wrapping_sub(b)),
        ArithOp::Mul => Value::Int(a.wrapping_mul(b)),
        ArithOp::Div => {
            if b == 0 {
                return Err(VmError::DivisionByZero);
            }
            Value::Int(a.wrapping_div(b))
        }
        ArithOp::Mod => {
            if b == 0 {
                return Err(VmError::DivisionByZero);
            }
            Value::Int(a.wrapping_rem(b))
        }
        ArithOp::Pow => match u32::try_from(b) {
            Ok(exp) => Value::Int(a.wrapping_pow(exp)),
            // Exponents past u32::MAX only matter for |a| <= 1
            Err(_) if b > 0 => Value::Int(match a {
                0 | 1 => a,
                -1 => if b % 2 == 0 { 1 } else { -1 },
                _ => a.wrapping_pow(u32::MAX),
            }),
            Err(_) => Value::Float((a as f64).powf(b as f64)),
        },
        ArithOp::Eq => Value::bool(a == b),
        ArithOp::Lt => Value::bool(a < b),
        ArithOp::Gt => Value::bool(a > b),
        ArithOp::Le => Value::bool(a <= b),
        ArithOp::Ge => Value::bool(a >= b),
        ArithOp::And => Value::Int(a & b),
        ArithOp::Or => Value::Int(a | b),
        ArithOp::Xor => Value::Int(a ^ b),
    };
    Ok(result)
}
