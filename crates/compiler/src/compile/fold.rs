//! Compile-time evaluation of literal operator expressions
//!
//! Arithmetic, comparison, bitwise, unary, and string concatenation over
//! literal operands fold to a single constant. Division and modulo by
//! zero do not fold (they must throw at runtime with a source line), and
//! short-circuit operators never fold.

use crate::ast::{BinaryOp, Expr, UnaryOp};
use lattice_core::value::{LatValue, ValueKind};

/// The value of a pure literal (no operators). Used for parameter
/// defaults, which live in the chunk's default-value vector.
pub(crate) fn literal_value(expr: &Expr) -> Option<LatValue> {
    match expr {
        Expr::Int(n) => Some(LatValue::int(*n)),
        Expr::Float(x) => Some(LatValue::float(*x)),
        Expr::Bool(b) => Some(LatValue::boolean(*b)),
        Expr::Str(s) => Some(LatValue::string(s.clone())),
        Expr::Unit => Some(LatValue::unit()),
        Expr::Nil => Some(LatValue::nil()),
        Expr::Range { start, end } => match (literal_value(start)?, literal_value(end)?) {
            (a, b) => match (&a.kind, &b.kind) {
                (ValueKind::Int(s), ValueKind::Int(e)) => Some(LatValue::range(*s, *e)),
                _ => None,
            },
        },
        _ => None,
    }
}

/// Fold an expression to a constant, when every operand is literal.
pub(crate) fn fold(expr: &Expr) -> Option<LatValue> {
    match expr {
        Expr::Unary { op, operand } => {
            let v = fold(operand)?;
            match (op, &v.kind) {
                (UnaryOp::Neg, ValueKind::Int(n)) => Some(LatValue::int(-n)),
                (UnaryOp::Neg, ValueKind::Float(x)) => Some(LatValue::float(-x)),
                (UnaryOp::Not, _) => Some(LatValue::boolean(!v.is_truthy())),
                (UnaryOp::BitNot, ValueKind::Int(n)) => Some(LatValue::int(!n)),
                _ => None,
            }
        }
        Expr::Binary { op, lhs, rhs } => {
            let a = fold(lhs)?;
            let b = fold(rhs)?;
            fold_binary(*op, &a, &b)
        }
        _ => literal_value(expr),
    }
}

fn fold_binary(op: BinaryOp, a: &LatValue, b: &LatValue) -> Option<LatValue> {
    use ValueKind::*;
    match (&a.kind, &b.kind) {
        (Int(x), Int(y)) => {
            let (x, y) = (*x, *y);
            Some(match op {
                BinaryOp::Add => LatValue::int(x.wrapping_add(y)),
                BinaryOp::Sub => LatValue::int(x.wrapping_sub(y)),
                BinaryOp::Mul => LatValue::int(x.wrapping_mul(y)),
                // Division and modulo by zero throw at runtime
                BinaryOp::Div if y != 0 => LatValue::int(x.wrapping_div(y)),
                BinaryOp::Mod if y != 0 => LatValue::int(x.wrapping_rem(y)),
                BinaryOp::Div | BinaryOp::Mod => return None,
                BinaryOp::Eq => LatValue::boolean(x == y),
                BinaryOp::Neq => LatValue::boolean(x != y),
                BinaryOp::Lt => LatValue::boolean(x < y),
                BinaryOp::Gt => LatValue::boolean(x > y),
                BinaryOp::LtEq => LatValue::boolean(x <= y),
                BinaryOp::GtEq => LatValue::boolean(x >= y),
                BinaryOp::BitAnd => LatValue::int(x & y),
                BinaryOp::BitOr => LatValue::int(x | y),
                BinaryOp::BitXor => LatValue::int(x ^ y),
                BinaryOp::Shl => LatValue::int(x.wrapping_shl(y as u32)),
                BinaryOp::Shr => LatValue::int(x.wrapping_shr(y as u32)),
            })
        }
        (Float(_), Float(_)) | (Int(_), Float(_)) | (Float(_), Int(_)) => {
            let x = as_f64(a)?;
            let y = as_f64(b)?;
            Some(match op {
                BinaryOp::Add => LatValue::float(x + y),
                BinaryOp::Sub => LatValue::float(x - y),
                BinaryOp::Mul => LatValue::float(x * y),
                BinaryOp::Div => LatValue::float(x / y),
                BinaryOp::Mod => LatValue::float(x % y),
                BinaryOp::Eq => LatValue::boolean(x == y),
                BinaryOp::Neq => LatValue::boolean(x != y),
                BinaryOp::Lt => LatValue::boolean(x < y),
                BinaryOp::Gt => LatValue::boolean(x > y),
                BinaryOp::LtEq => LatValue::boolean(x <= y),
                BinaryOp::GtEq => LatValue::boolean(x >= y),
                BinaryOp::BitAnd
                | BinaryOp::BitOr
                | BinaryOp::BitXor
                | BinaryOp::Shl
                | BinaryOp::Shr => return None,
            })
        }
        (Str(x), Str(y)) => match op {
            BinaryOp::Add => {
                let mut s = x.as_str().to_string();
                s.push_str(y.as_str());
                Some(LatValue::string(s))
            }
            BinaryOp::Eq => Some(LatValue::boolean(x == y)),
            BinaryOp::Neq => Some(LatValue::boolean(x != y)),
            BinaryOp::Lt => Some(LatValue::boolean(x.as_str() < y.as_str())),
            BinaryOp::Gt => Some(LatValue::boolean(x.as_str() > y.as_str())),
            BinaryOp::LtEq => Some(LatValue::boolean(x.as_str() <= y.as_str())),
            BinaryOp::GtEq => Some(LatValue::boolean(x.as_str() >= y.as_str())),
            _ => None,
        },
        (Bool(x), Bool(y)) => match op {
            BinaryOp::Eq => Some(LatValue::boolean(x == y)),
            BinaryOp::Neq => Some(LatValue::boolean(x != y)),
            _ => None,
        },
        (Nil, Nil) => match op {
            BinaryOp::Eq => Some(LatValue::boolean(true)),
            BinaryOp::Neq => Some(LatValue::boolean(false)),
            _ => None,
        },
        _ => None,
    }
}

fn as_f64(v: &LatValue) -> Option<f64> {
    match v.kind {
        ValueKind::Int(n) => Some(n as f64),
        ValueKind::Float(x) => Some(x),
        _ => None,
    }
}
