//! Canonicalize-ramp pass: puts ramp and broadcast arithmetic into a single
//! ramp or broadcast node wherever the lanes line up.

use vira_ir::{BinaryOp, Expr, Function};

use crate::util::{add, mul, sub};
use crate::{LoweringError, Pass, PassContext};

#[derive(Debug)]
pub struct CanonicalizeRamp;

impl Pass for CanonicalizeRamp {
    fn name(&self) -> &'static str {
        "canonicalize-ramp"
    }

    fn run_on_function(
        &self,
        mut func: Function,
        _cx: &PassContext<'_>,
    ) -> Result<Function, LoweringError> {
        func.body = func.body.map_exprs(&mut |e| e.transform(&mut canonicalize));
        Ok(func)
    }
}

/// Applies rewrite rules at one node until none fires.
pub(crate) fn canonicalize(e: Expr) -> Expr {
    let mut e = e;
    loop {
        match step(e) {
            Ok(next) => e = next,
            Err(done) => return done,
        }
    }
}

/// One rewrite at the root, or the expression back unchanged.
fn step(e: Expr) -> Result<Expr, Expr> {
    match e {
        Expr::Ramp { base, lanes: 1, .. } => Ok(*base),
        Expr::Broadcast { value, lanes: 1 } => Ok(*value),
        Expr::Ramp {
            base,
            stride,
            lanes,
        } if stride.as_literal().is_some_and(|l| l.is_zero()) => Ok(Expr::broadcast(*base, lanes)),
        Expr::Broadcast { value, lanes } if matches!(*value, Expr::Broadcast { .. }) => {
            match *value {
                Expr::Broadcast { value: inner, .. } => Ok(Expr::broadcast(*inner, lanes)),
                other => Err(Expr::broadcast(other, lanes)),
            }
        }
        Expr::Binary { op, lhs, rhs } => fold_binary(op, *lhs, *rhs),
        other => Err(other),
    }
}

fn fold_binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Result<Expr, Expr> {
    use BinaryOp as B;
    match (op, lhs, rhs) {
        (
            B::Add | B::Sub,
            Expr::Ramp {
                base,
                stride,
                lanes,
            },
            Expr::Broadcast { value, lanes: n },
        ) if lanes == n && value.lanes() == 1 => {
            let base = if op == B::Add {
                add(*base, *value)
            } else {
                sub(*base, *value)
            };
            Ok(Expr::ramp(base, *stride, lanes))
        }
        (
            B::Add | B::Sub,
            Expr::Broadcast { value, lanes: n },
            Expr::Ramp {
                base,
                stride,
                lanes,
            },
        ) if lanes == n && value.lanes() == 1 => Ok(if op == B::Add {
            Expr::ramp(add(*value, *base), *stride, lanes)
        } else {
            let stride = sub(Expr::typed_const(0, stride.dtype()), *stride);
            Expr::ramp(sub(*value, *base), stride, lanes)
        }),
        (
            B::Add | B::Sub,
            Expr::Ramp {
                base: b1,
                stride: s1,
                lanes,
            },
            Expr::Ramp {
                base: b2,
                stride: s2,
                lanes: n,
            },
        ) if lanes == n => Ok(if op == B::Add {
            Expr::ramp(add(*b1, *b2), add(*s1, *s2), lanes)
        } else {
            Expr::ramp(sub(*b1, *b2), sub(*s1, *s2), lanes)
        }),
        (
            B::Mul,
            Expr::Ramp {
                base,
                stride,
                lanes,
            },
            Expr::Broadcast { value, lanes: n },
        )
        | (
            B::Mul,
            Expr::Broadcast { value, lanes: n },
            Expr::Ramp {
                base,
                stride,
                lanes,
            },
        ) if lanes == n && value.lanes() == 1 => Ok(Expr::ramp(
            mul(*base, (*value).clone()),
            mul(*stride, *value),
            lanes,
        )),
        (
            op,
            Expr::Broadcast { value: a, lanes },
            Expr::Broadcast { value: b, lanes: n },
        ) if lanes == n && a.lanes() == 1 && b.lanes() == 1 => {
            Ok(Expr::broadcast(Expr::binary(op, *a, *b), lanes))
        }
        (op, lhs, rhs) => Err(Expr::binary(op, lhs, rhs)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::run_pass;
    use vira_ir::{AddressSpace, Buffer, DataType, Scalar, Stmt, Var};

    fn canon(e: Expr) -> Expr {
        e.transform(&mut canonicalize)
    }

    #[test]
    fn degenerate_ramps() {
        let x = Var::new("x", DataType::I32);
        assert_eq!(
            canon(Expr::ramp(Expr::var(&x), Expr::i32(0), 8)),
            Expr::broadcast(Expr::var(&x), 8)
        );
        assert_eq!(canon(Expr::ramp(Expr::var(&x), Expr::i32(3), 1)), Expr::var(&x));
        assert_eq!(canon(Expr::broadcast(Expr::var(&x), 1)), Expr::var(&x));
        assert_eq!(
            canon(Expr::broadcast(Expr::broadcast(Expr::var(&x), 4), 4)),
            Expr::broadcast(Expr::var(&x), 4)
        );
    }

    #[test]
    fn ramp_plus_broadcast() {
        let x = Var::new("x", DataType::I32);
        let e = Expr::add(
            Expr::ramp(Expr::i32(0), Expr::i32(1), 8),
            Expr::broadcast(Expr::var(&x), 8),
        );
        assert_eq!(canon(e), Expr::ramp(Expr::var(&x), Expr::i32(1), 8));
    }

    #[test]
    fn broadcast_minus_ramp_negates_stride() {
        let e = Expr::sub(
            Expr::broadcast(Expr::i32(10), 4),
            Expr::ramp(Expr::i32(2), Expr::i32(3), 4),
        );
        assert_eq!(canon(e), Expr::ramp(Expr::i32(8), Expr::i32(-3), 4));
    }

    #[test]
    fn ramp_minus_itself_becomes_broadcast() {
        let r = Expr::ramp(Expr::i32(4), Expr::i32(1), 8);
        assert_eq!(
            canon(Expr::sub(r.clone(), r)),
            Expr::broadcast(Expr::i32(0), 8)
        );
    }

    #[test]
    fn scaled_ramp() {
        let x = Var::new("x", DataType::I32);
        let e = Expr::mul(
            Expr::ramp(Expr::var(&x), Expr::i32(1), 8),
            Expr::broadcast(Expr::i32(4), 8),
        );
        assert_eq!(
            canon(e),
            Expr::ramp(Expr::mul(Expr::var(&x), Expr::i32(4)), Expr::i32(4), 8)
        );
    }

    #[test]
    fn broadcast_arithmetic_moves_inside() {
        let x = Var::new("x", DataType::F32);
        let e = Expr::mul(
            Expr::broadcast(Expr::var(&x), 8),
            Expr::broadcast(Expr::f32(2.0), 8),
        );
        assert_eq!(
            canon(e),
            Expr::broadcast(Expr::mul(Expr::var(&x), Expr::f32(2.0)), 8)
        );
    }

    #[test]
    fn mismatched_lanes_are_kept() {
        let e = Expr::add(
            Expr::ramp(Expr::i32(0), Expr::i32(1), 8),
            Expr::broadcast(Expr::i32(1), 4),
        );
        assert_eq!(canon(e.clone()), e);
    }

    #[test]
    fn pass_is_idempotent() {
        let mut func = Function::new("k");
        let a = func.add_buffer_param(Buffer::fixed("a", DataType::F32, &[64], AddressSpace::Global));
        let o = Var::new("o", DataType::I32);
        let idx = Expr::add(
            Expr::mul(
                Expr::ramp(Expr::var(&o), Expr::i32(1), 8),
                Expr::broadcast(Expr::i32(2), 8),
            ),
            Expr::broadcast(Expr::i32(1), 8),
        );
        func.body = Stmt::store(
            a,
            vec![idx.clone()],
            Expr::load(a, vec![idx], DataType::vector(Scalar::F32, 8)),
        );
        let once = run_pass(&CanonicalizeRamp, func).unwrap();
        let twice = run_pass(&CanonicalizeRamp, once.clone()).unwrap();
        assert_eq!(once, twice);
        let Stmt::Store { indices, .. } = &once.body else {
            panic!("expected store");
        };
        assert!(matches!(indices[0], Expr::Ramp { .. }));
    }
}
