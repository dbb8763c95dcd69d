//! Exchange-constant-to-right pass.
//!
//! Moves literal operands to the right-hand side of commutative operators
//! and mirrors comparisons with a literal on the left.

use vira_ir::{Expr, Function};

use crate::{LoweringError, Pass, PassContext};

/// Moves constants to the right operand.
#[derive(Debug)]
pub struct ExchangeConstantToRight;

impl Pass for ExchangeConstantToRight {
    fn name(&self) -> &'static str {
        "exchange-constant-to-right"
    }

    fn run_on_function(
        &self,
        mut func: Function,
        _cx: &PassContext<'_>,
    ) -> Result<Function, LoweringError> {
        func.body = func.body.map_exprs(&mut |e| e.transform(&mut exchange));
        Ok(func)
    }
}

fn exchange(e: Expr) -> Expr {
    match e {
        Expr::Binary { op, lhs, rhs } if lhs.is_const() && !rhs.is_const() => {
            match op.mirrored() {
                Some(mirrored) => Expr::Binary {
                    op: mirrored,
                    lhs: rhs,
                    rhs: lhs,
                },
                None => Expr::Binary { op, lhs, rhs },
            }
        }
        other => other,
    }
}
