//! Constant folding pass.
//!
//! Evaluates unary, binary, select and cast nodes whose operands are
//! literals (or broadcasts of literals), with the same wrapping and rounding
//! rules the reference interpreter uses.

use vira_ir::eval::{Lane, binary_lane, round_float, wrap_int};
use vira_ir::{BinaryOp, Expr, Function, Literal, Scalar, UnaryOp};

use crate::{LoweringError, Pass, PassContext};

/// Folds constant expressions at compile time.
#[derive(Debug)]
pub struct FoldConstant;

impl Pass for FoldConstant {
    fn name(&self) -> &'static str {
        "fold-constant"
    }

    fn run_on_function(
        &self,
        mut func: Function,
        _cx: &PassContext<'_>,
    ) -> Result<Function, LoweringError> {
        func.body = func.body.map_exprs(&mut |e| e.transform(&mut fold_expr));
        Ok(func)
    }
}

/// Folds one node whose children are already folded.
pub(crate) fn fold_expr(e: Expr) -> Expr {
    match e {
        Expr::Binary { op, lhs, rhs } => match (&*lhs, &*rhs) {
            (Expr::Literal(l), Expr::Literal(r)) => match fold_binary(op, *l, *r) {
                Some(lit) => Expr::Literal(lit),
                None => Expr::Binary { op, lhs, rhs },
            },
            (
                Expr::Broadcast { value: a, lanes },
                Expr::Broadcast { value: b, lanes: n },
            ) if lanes == n => match (a.as_literal(), b.as_literal()) {
                (Some(l), Some(r)) => match fold_binary(op, *l, *r) {
                    Some(lit) => Expr::broadcast(Expr::Literal(lit), *lanes),
                    None => Expr::Binary { op, lhs, rhs },
                },
                _ => Expr::Binary { op, lhs, rhs },
            },
            _ => Expr::Binary { op, lhs, rhs },
        },
        Expr::Unary { op, operand } => match operand.as_literal().and_then(|l| fold_unary(op, *l)) {
            Some(lit) => Expr::Literal(lit),
            None => Expr::Unary { op, operand },
        },
        Expr::Select {
            condition,
            accept,
            reject,
        } => match condition.as_literal() {
            Some(Literal::Bool(true)) => *accept,
            Some(Literal::Bool(false)) => *reject,
            _ => Expr::Select {
                condition,
                accept,
                reject,
            },
        },
        Expr::Cast { value, dtype } if dtype.is_scalar() => match value.as_literal() {
            Some(lit) => to_literal(to_lane(*lit).convert(dtype.scalar), dtype.scalar),
            None => Expr::Cast { value, dtype },
        },
        other => other,
    }
}

/// Folds `left op right`. Operands must have the same type; division by zero
/// is left for run time.
pub(crate) fn fold_binary(op: BinaryOp, left: Literal, right: Literal) -> Option<Literal> {
    let scalar = left.scalar();
    if scalar != right.scalar() && !matches!(op, BinaryOp::Shl | BinaryOp::Shr) {
        return None;
    }
    let result = binary_lane(op, to_lane(left), to_lane(right), scalar).ok()?;
    let result_scalar = if op.is_comparison() { Scalar::BOOL } else { scalar };
    match to_literal(result, result_scalar) {
        Expr::Literal(lit) => Some(lit),
        _ => None,
    }
}

fn fold_unary(op: UnaryOp, lit: Literal) -> Option<Literal> {
    Some(match (op, lit) {
        (UnaryOp::Negate, Literal::Int { value, scalar }) => Literal::Int {
            value: wrap_int(value.wrapping_neg(), scalar),
            scalar,
        },
        (UnaryOp::Negate, Literal::Float { value, scalar }) => Literal::Float {
            value: -value,
            scalar,
        },
        (UnaryOp::Not, Literal::Bool(b)) => Literal::Bool(!b),
        (UnaryOp::Not, Literal::Int { value, scalar }) => Literal::Int {
            value: wrap_int(!value, scalar),
            scalar,
        },
        _ => return None,
    })
}

fn to_lane(lit: Literal) -> Lane {
    match lit {
        Literal::Bool(b) => Lane::Bool(b),
        Literal::Int { value, scalar } => Lane::Int(wrap_int(value, scalar)),
        Literal::Float { value, scalar } => Lane::Float(round_float(value, scalar)),
    }
}

fn to_literal(lane: Lane, scalar: Scalar) -> Expr {
    match lane {
        Lane::Bool(b) => Expr::bool(b),
        Lane::Int(value) => Expr::int(value, scalar),
        Lane::Float(value) => Expr::float(value, scalar),
    }
}
