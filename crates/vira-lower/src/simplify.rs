//! Simplify pass.
//!
//! Runs constant folding together with algebraic identities and statement
//! cleanups until nothing changes, bounded by
//! [`PipelineConfig::simplify_max_iterations`](crate::PipelineConfig).

use vira_ir::{BinaryOp, Expr, Function, Literal, Stmt, UnaryOp};

use crate::fold_constant::fold_expr;
use crate::util::{is_pure, seq};
use crate::{LoweringError, Pass, PassContext};

#[derive(Debug)]
pub struct Simplify;

impl Pass for Simplify {
    fn name(&self) -> &'static str {
        "simplify"
    }

    fn run_on_function(
        &self,
        mut func: Function,
        cx: &PassContext<'_>,
    ) -> Result<Function, LoweringError> {
        let max = cx.config.simplify_max_iterations.max(1);
        for iteration in 1..=max {
            let before = func.body.clone();
            func.body = simplify_stmt(before.clone());
            if func.body == before {
                log::trace!("simplify `{}`: fixpoint after {iteration} iteration(s)", func.name);
                return Ok(func);
            }
        }
        log::debug!(
            "simplify `{}`: no fixpoint within {max} iterations",
            func.name
        );
        Ok(func)
    }
}

/// One simplification round over a statement tree.
pub(crate) fn simplify_stmt(stmt: Stmt) -> Stmt {
    stmt.map_exprs(&mut simplify_expr).transform(&mut simplify_node)
}

/// Folds and simplifies an expression bottom-up.
pub(crate) fn simplify_expr(e: Expr) -> Expr {
    e.transform(&mut |e| identity(fold_expr(e)))
}

/// The literal an expression evaluates to in every lane.
fn splat(e: &Expr) -> Option<Literal> {
    match e {
        Expr::Literal(lit) => Some(*lit),
        Expr::Broadcast { value, .. } => splat(value),
        _ => None,
    }
}

fn identity(e: Expr) -> Expr {
    use BinaryOp as B;
    match e {
        Expr::Binary { op, lhs, rhs } => {
            let l = lhs.dtype();
            let lanes = l.lanes.max(rhs.lanes());
            let ty = if op.is_comparison() {
                l.to_bool().with_lanes(lanes)
            } else {
                l.with_lanes(lanes)
            };
            let keeps_type = l == ty;
            let is_int = ty.scalar.is_int();
            let r = splat(&rhs);
            match (op, r) {
                (B::Add | B::Sub | B::BitOr | B::BitXor | B::Shl | B::Shr, Some(lit))
                    if is_int && lit.is_zero() && keeps_type =>
                {
                    *lhs
                }
                (B::Mul | B::Div, Some(lit)) if lit.is_one() && keeps_type && !ty.scalar.is_bool() => {
                    *lhs
                }
                (B::Mul | B::BitAnd, Some(lit)) if is_int && lit.is_zero() && is_pure(&lhs) => {
                    Expr::typed_const(0, ty)
                }
                (B::And, Some(Literal::Bool(true))) | (B::Or, Some(Literal::Bool(false)))
                    if keeps_type =>
                {
                    *lhs
                }
                (B::And, Some(Literal::Bool(false))) if is_pure(&lhs) => {
                    Expr::typed_const(0, ty)
                }
                (B::Or, Some(Literal::Bool(true))) if is_pure(&lhs) => Expr::typed_const(1, ty),
                _ => Expr::Binary { op, lhs, rhs },
            }
        }
        Expr::Select {
            condition,
            accept,
            reject,
        } => match splat(&condition) {
            Some(Literal::Bool(true)) if accept.lanes() >= condition.lanes() => *accept,
            Some(Literal::Bool(false)) if reject.lanes() >= condition.lanes() => *reject,
            _ if accept == reject && is_pure(&condition) => *accept,
            _ => Expr::Select {
                condition,
                accept,
                reject,
            },
        },
        Expr::Unary {
            op: UnaryOp::Not,
            operand,
        } => match *operand {
            Expr::Unary {
                op: UnaryOp::Not,
                operand: inner,
            } => *inner,
            other => Expr::not(other),
        },
        other => other,
    }
}

fn simplify_node(stmt: Stmt) -> Stmt {
    match stmt {
        Stmt::Seq(stmts) => seq(stmts),
        Stmt::If {
            condition,
            then_case,
            else_case,
        } => match splat(&condition) {
            Some(Literal::Bool(true)) => *then_case,
            Some(Literal::Bool(false)) => else_case.map_or_else(Stmt::empty, |e| *e),
            _ if then_case.is_empty() && else_case.as_ref().is_none_or(|e| e.is_empty()) => {
                Stmt::empty()
            }
            _ => Stmt::If {
                condition,
                then_case,
                else_case: else_case.filter(|e| !e.is_empty()),
            },
        },
        Stmt::For(l) if l.const_extent().is_some_and(|n| n <= 0) || l.body.is_empty() => {
            Stmt::empty()
        }
        Stmt::Let { var, value, body } if is_pure(&value) && !body.uses_var(&var) => *body,
        Stmt::Evaluate(e) if is_pure(&e) => Stmt::empty(),
        other => other,
    }
}
