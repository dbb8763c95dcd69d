//! Canonicalize-div-mod pass.
//!
//! Rewrites integer division and modulo by positive constants into forms
//! the vector unit has instructions for. No `%`, `floordiv` or `floormod` by
//! a positive constant survives:
//!
//! ```text
//! r              = x - (x / c) * c      (x % c)
//! floordiv(x, c) = x / c - select(r < 0, 1, 0)
//! floormod(x, c) = r + select(r < 0, c, 0)
//! ```
//!
//! Floor forms by a power of two are an arithmetic shift and a mask for any
//! sign. Truncating forms use the shift and mask only when the dividend is
//! provably non-negative: its value range, computed with wrapping taken into
//! account, must lie at or above zero.

use std::collections::HashMap;

use vira_ir::{BinaryOp, Dim, Expr, Function, Intrinsic, Literal, Scalar, ScalarKind, Stmt, StmtPath};

use crate::util::const_int;
use crate::{LoweringError, Pass, PassContext};

#[derive(Debug)]
pub struct CanonicalizeDivMod;

impl Pass for CanonicalizeDivMod {
    fn name(&self) -> &'static str {
        "canonicalize-div-mod"
    }

    fn run_on_function(
        &self,
        mut func: Function,
        cx: &PassContext<'_>,
    ) -> Result<Function, LoweringError> {
        let mut facts = Facts::default();
        for (_, buf) in func.buffers.iter() {
            for dim in &buf.shape {
                if let Dim::Size(v) = dim {
                    let (_, hi) = type_range(v.dtype.scalar);
                    facts.ranges.insert(v.id, (0, hi));
                }
            }
        }
        let body = std::mem::replace(&mut func.body, Stmt::empty());
        func.body = rewrite_stmt(body, &mut facts, &mut StmtPath::root(), cx)?;
        Ok(func)
    }
}

/// Inclusive bounds of an integer value.
type Range = (i128, i128);

fn type_range(scalar: Scalar) -> Range {
    let bits = scalar.bits().clamp(1, 64);
    match scalar.kind {
        ScalarKind::Uint => (0, (1i128 << bits) - 1),
        _ => (-(1i128 << (bits - 1)), (1i128 << (bits - 1)) - 1),
    }
}

/// Known ranges of the variables in scope.
#[derive(Default)]
struct Facts {
    ranges: HashMap<u32, Range>,
}

impl Facts {
    /// Bounds on the value `e` takes after wrapping. Arithmetic that could
    /// leave the type's range yields the whole range.
    fn range(&self, e: &Expr) -> Range {
        use BinaryOp as B;
        let full = type_range(e.dtype().scalar);
        let r = match e {
            Expr::Literal(Literal::Int { value, .. }) => (i128::from(*value), i128::from(*value)),
            Expr::Var(v) => self.ranges.get(&v.id).copied().unwrap_or(full),
            Expr::Binary { op, lhs, rhs } => {
                let (a, b) = (self.range(lhs), self.range(rhs));
                let konst = (b.0 == b.1).then_some(b.0);
                match (op, konst) {
                    (B::Add, _) => (a.0 + b.0, a.1 + b.1),
                    (B::Sub, _) => (a.0 - b.1, a.1 - b.0),
                    (B::Mul, _) => {
                        let p = [a.0 * b.0, a.0 * b.1, a.1 * b.0, a.1 * b.1];
                        (p.into_iter().min().unwrap_or(0), p.into_iter().max().unwrap_or(0))
                    }
                    (B::Min, _) => (a.0.min(b.0), a.1.min(b.1)),
                    (B::Max, _) => (a.0.max(b.0), a.1.max(b.1)),
                    (B::Div, Some(c)) if c > 0 => (a.0 / c, a.1 / c),
                    (B::FloorDiv, Some(c)) if c > 0 => (a.0.div_euclid(c), a.1.div_euclid(c)),
                    (B::FloorMod, Some(c)) if c > 0 => (0, c - 1),
                    (B::Mod, Some(c)) if c > 0 && a.0 >= 0 => (0, a.1.min(c - 1)),
                    (B::Mod, Some(c)) if c > 0 => (1 - c, c - 1),
                    (B::Shr, Some(k)) if (0..64).contains(&k) => (a.0 >> k, a.1 >> k),
                    (B::BitAnd, _) if a.0 >= 0 && b.0 >= 0 => (0, a.1.min(b.1)),
                    (B::BitAnd, _) if a.0 >= 0 => (0, a.1),
                    (B::BitAnd, _) if b.0 >= 0 => (0, b.1),
                    _ => full,
                }
            }
            Expr::Ramp {
                base,
                stride,
                lanes,
            } => {
                let (b, s) = (self.range(base), self.range(stride));
                let last = i128::from(lanes.saturating_sub(1));
                (b.0 + (s.0 * last).min(0), b.1 + (s.1 * last).max(0))
            }
            Expr::Broadcast { value, .. } => self.range(value),
            Expr::Call {
                intrinsic: Intrinsic::GetLocalId,
                ..
            } => (0, full.1),
            _ => full,
        };
        if r.0 >= full.0 && r.1 <= full.1 {
            r
        } else {
            full
        }
    }

    fn non_negative(&self, e: &Expr) -> bool {
        self.range(e).0 >= 0
    }

    /// Range of the binder `stmt` introduces for its children.
    fn binder(&self, stmt: &Stmt) -> Option<(u32, Range)> {
        match stmt {
            Stmt::For(l) => {
                let full = type_range(l.var.dtype.scalar);
                let (min, extent) = (self.range(&l.min), self.range(&l.extent));
                let r = (min.0, min.1 + extent.1 - 1);
                let r = if extent.1 >= 1 && r.1 <= full.1 { r } else { (min.0, full.1) };
                Some((l.var.id, r))
            }
            Stmt::Let { var, value, .. } => Some((var.id, self.range(value))),
            _ => None,
        }
    }
}

fn rewrite_stmt(
    stmt: Stmt,
    facts: &mut Facts,
    path: &mut StmtPath,
    cx: &PassContext<'_>,
) -> Result<Stmt, LoweringError> {
    let mut stmt = stmt;
    for e in stmt.exprs_mut() {
        let old = std::mem::replace(e, Expr::bool(false));
        *e = old.try_transform(&mut |e| rewrite_expr(e, facts, path, cx))?;
    }
    let shadowed = facts
        .binder(&stmt)
        .map(|(id, range)| (id, facts.ranges.insert(id, range)));
    let mut result = Ok(());
    for (i, child) in stmt.children_mut().into_iter().enumerate() {
        path.push(i as u32);
        let old = std::mem::replace(child, Stmt::empty());
        match rewrite_stmt(old, facts, path, cx) {
            Ok(new) => *child = new,
            Err(err) => result = Err(err),
        }
        path.pop();
        if result.is_err() {
            break;
        }
    }
    match shadowed {
        Some((id, Some(prev))) => {
            facts.ranges.insert(id, prev);
        }
        Some((id, None)) => {
            facts.ranges.remove(&id);
        }
        None => {}
    }
    result.map(|()| stmt)
}

fn rewrite_expr(
    e: Expr,
    facts: &Facts,
    path: &StmtPath,
    cx: &PassContext<'_>,
) -> Result<Expr, LoweringError> {
    use BinaryOp as B;
    let Expr::Binary { op, lhs, rhs } = e else {
        return Ok(e);
    };
    let is_div_mod = matches!(op, B::Div | B::Mod | B::FloorDiv | B::FloorMod);
    let divisor = const_int(&rhs);
    let (Some(c), true) = (divisor, is_div_mod && lhs.dtype().scalar.is_int()) else {
        return Ok(Expr::Binary { op, lhs, rhs });
    };
    if c == 0 {
        return Err(cx.unsupported(path, format!("`{op}` by constant zero")));
    }
    if c < 0 {
        return Ok(Expr::Binary { op, lhs, rhs });
    }

    let x = *lhs;
    let c_expr = *rhs;
    let ty = x.dtype();
    let konst = |v: i64| Expr::typed_const(v, ty);
    let is_div = matches!(op, B::Div | B::FloorDiv);

    if c == 1 {
        return Ok(if is_div { x } else { konst(0) });
    }
    let is_floor = matches!(op, B::FloorDiv | B::FloorMod);
    let non_negative = facts.non_negative(&x);
    if c.count_ones() == 1 && (is_floor || non_negative) {
        let k = i64::from(c.trailing_zeros());
        return Ok(if is_div {
            Expr::binary(B::Shr, x, konst(k))
        } else {
            Expr::binary(B::BitAnd, x, konst(c - 1))
        });
    }
    if op == B::Div || (op == B::FloorDiv && non_negative) {
        return Ok(Expr::binary(B::Div, x, c_expr));
    }

    let quotient = Expr::binary(B::Div, x.clone(), c_expr.clone());
    let rem = Expr::sub(x, Expr::binary(B::Mul, quotient.clone(), c_expr.clone()));
    if op == B::Mod || non_negative {
        return Ok(rem);
    }
    let negative = |then: Expr| Expr::Select {
        condition: Box::new(Expr::lt(rem.clone(), konst(0))),
        accept: Box::new(then),
        reject: Box::new(konst(0)),
    };
    Ok(match op {
        B::FloorDiv => Expr::sub(quotient, negative(konst(1))),
        _ => Expr::add(rem.clone(), negative(c_expr)),
    })
}
