//! Expression helpers shared by the passes.

use vira_ir::eval::wrap_int;
use vira_ir::{Expr, Function, Intrinsic, Literal, Scalar, Stmt, Var};
use vira_target::TargetDescriptor;

/// Value and type of a scalar integer literal.
pub(crate) fn int_lit(e: &Expr) -> Option<(i64, Scalar)> {
    match e {
        Expr::Literal(Literal::Int { value, scalar }) => Some((*value, *scalar)),
        _ => None,
    }
}

/// Integer literal value, looking through broadcasts.
pub(crate) fn const_int(e: &Expr) -> Option<i64> {
    match e {
        Expr::Literal(Literal::Int { value, .. }) => Some(*value),
        Expr::Broadcast { value, .. } => const_int(value),
        _ => None,
    }
}

/// `a + b`, folding integer literals and adding zero.
pub(crate) fn add(a: Expr, b: Expr) -> Expr {
    match (int_lit(&a), int_lit(&b)) {
        (Some((x, s)), Some((y, t))) if s == t => Expr::int(wrap_int(x.wrapping_add(y), s), s),
        (Some((0, s)), _) if b.dtype().scalar == s => b,
        (_, Some((0, _))) => a,
        _ => Expr::add(a, b),
    }
}

/// `a - b`, folding integer literals and subtracting zero.
pub(crate) fn sub(a: Expr, b: Expr) -> Expr {
    match (int_lit(&a), int_lit(&b)) {
        (Some((x, s)), Some((y, t))) if s == t => Expr::int(wrap_int(x.wrapping_sub(y), s), s),
        (_, Some((0, _))) => a,
        _ => Expr::sub(a, b),
    }
}

/// `a * b`, folding integer literals, ones and zeros.
pub(crate) fn mul(a: Expr, b: Expr) -> Expr {
    match (int_lit(&a), int_lit(&b)) {
        (Some((x, s)), Some((y, t))) if s == t => Expr::int(wrap_int(x.wrapping_mul(y), s), s),
        (Some((1, s)), _) if b.dtype().scalar == s => b,
        (_, Some((1, _))) => a,
        (Some((0, s)), _) if b.lanes() == 1 && b.dtype().scalar == s => Expr::int(0, s),
        (_, Some((0, s))) if a.lanes() == 1 && a.dtype().scalar == s => Expr::int(0, s),
        _ => Expr::mul(a, b),
    }
}

/// Broadcasts a scalar expression to `lanes` lanes; vectors are returned as-is.
pub(crate) fn broadcast_to(e: Expr, lanes: u16) -> Expr {
    if lanes > 1 && e.lanes() == 1 {
        Expr::broadcast(e, lanes)
    } else {
        e
    }
}

/// Returns `true` if evaluating the expression has no effect besides its value.
pub(crate) fn is_pure(e: &Expr) -> bool {
    !e.any(&mut |e| match e {
        Expr::Call { intrinsic, .. } => intrinsic.has_side_effects(),
        Expr::Isa(inst) => inst.opcode.is_store(),
        _ => false,
    })
}

/// Pre-order walk over the data positions of an expression. Index and
/// address arithmetic (load indices, byte offsets, tail-mask counts, strided
/// access strides) is skipped.
pub(crate) fn visit_data(e: &Expr, f: &mut dyn FnMut(&Expr)) {
    f(e);
    match e {
        Expr::Load { predicate, .. } => {
            if let Some(p) = predicate {
                visit_data(p, f);
            }
        }
        Expr::Address { .. } | Expr::Mask(_) => {}
        Expr::Isa(inst) if inst.opcode.is_load() || inst.opcode.is_store() => {
            if inst.opcode.is_store()
                && let Some(value) = inst.args.last()
            {
                visit_data(value, f);
            }
            if let Some(mask) = &inst.mask {
                visit_data(mask, f);
            }
        }
        _ => {
            for child in e.children() {
                visit_data(child, f);
            }
        }
    }
}

/// Data expressions held directly by a statement.
pub(crate) fn stmt_data(stmt: &Stmt) -> Vec<&Expr> {
    match stmt {
        Stmt::Store {
            value, predicate, ..
        } => std::iter::once(value).chain(predicate.as_ref()).collect(),
        Stmt::Let { value, .. } => vec![value],
        Stmt::Evaluate(e) => vec![e],
        Stmt::If { condition, .. } => vec![condition],
        _ => Vec::new(),
    }
}

/// Widest non-bool element, in bits, among the vector data of a statement.
pub(crate) fn vector_data_bits(stmt: &Stmt, func: &Function) -> u32 {
    let mut bits = 0;
    if let Stmt::Store { buffer, value, .. } = stmt
        && value.lanes() > 1
        && let Some(buf) = func.buffers.try_get(*buffer)
    {
        bits = buf.dtype.scalar.bits();
    }
    for e in stmt_data(stmt) {
        visit_data(e, &mut |e| {
            let ty = e.dtype();
            if ty.is_vector() && !ty.scalar.is_bool() && !ty.is_void() {
                bits = bits.max(ty.scalar.bits());
            }
        });
    }
    bits
}

/// Largest lane count among the vector data and store indices of a statement.
pub(crate) fn vector_lanes(stmt: &Stmt) -> u16 {
    let mut lanes = 1;
    if let Stmt::Store { indices, .. } = stmt {
        for idx in indices {
            lanes = lanes.max(idx.lanes());
        }
    }
    for e in stmt_data(stmt) {
        visit_data(e, &mut |e| {
            let ty = e.dtype();
            if !ty.is_void() {
                lanes = lanes.max(ty.lanes);
            }
        });
    }
    lanes
}

/// Widest element, in bits, loaded, stored or cast anywhere inside `stmt`.
pub(crate) fn accessed_bits(stmt: &Stmt, func: &Function) -> u32 {
    let mut bits = 0;
    let _ = stmt.walk::<()>(&mut vira_ir::StmtPath::root(), &mut |s, _| {
        if let Stmt::Store { buffer, .. } = s
            && let Some(buf) = func.buffers.try_get(*buffer)
        {
            bits = bits.max(buf.dtype.scalar.bits());
        }
        Ok(())
    });
    stmt.visit_exprs(&mut |e| {
        e.visit(&mut |e| match e {
            Expr::Load { dtype, .. } => bits = bits.max(dtype.scalar.bits()),
            Expr::Cast { value, dtype } => {
                for s in [value.dtype().scalar, dtype.scalar] {
                    if !s.is_bool() {
                        bits = bits.max(s.bits());
                    }
                }
            }
            Expr::Call {
                intrinsic: Intrinsic::Widen | Intrinsic::Narrow | Intrinsic::Convert,
                dtype,
                ..
            } => bits = bits.max(dtype.scalar.bits()),
            _ => {}
        })
    });
    bits
}

/// Lanes of `bits`-wide elements in one native vector.
pub(crate) fn native_lanes(target: &TargetDescriptor, bits: u32) -> u16 {
    if bits == 0 {
        return 1;
    }
    u16::try_from(target.native_vector_bits / bits)
        .unwrap_or(u16::MAX)
        .max(1)
}

/// Splits a scalar integer expression into `sum(coeffs[k] * vars[k]) + rest`
/// where `rest` uses none of `vars`.
pub(crate) fn affine(e: &Expr, vars: &[Var]) -> Option<(Vec<i64>, Expr)> {
    if !vars.iter().any(|v| e.uses_var(v)) {
        return Some((vec![0; vars.len()], e.clone()));
    }
    if e.lanes() != 1 || !e.dtype().scalar.is_int() {
        return None;
    }
    match e {
        Expr::Var(v) => {
            let k = vars.iter().position(|x| x.same(v))?;
            let mut coeffs = vec![0; vars.len()];
            coeffs[k] = 1;
            Some((coeffs, Expr::typed_const(0, e.dtype())))
        }
        Expr::Binary { op, lhs, rhs } => {
            let (lc, lr) = affine(lhs, vars)?;
            let (rc, rr) = affine(rhs, vars)?;
            match op {
                vira_ir::BinaryOp::Add => Some((zip(&lc, &rc, |a, b| a + b), add(lr, rr))),
                vira_ir::BinaryOp::Sub => Some((zip(&lc, &rc, |a, b| a - b), sub(lr, rr))),
                vira_ir::BinaryOp::Mul => {
                    if lc.iter().all(|&c| c == 0) {
                        let c = lhs.as_int()?;
                        Some((rc.iter().map(|x| x * c).collect(), mul(lr, rr)))
                    } else if rc.iter().all(|&c| c == 0) {
                        let c = rhs.as_int()?;
                        Some((lc.iter().map(|x| x * c).collect(), mul(lr, rr)))
                    } else {
                        None
                    }
                }
                _ => None,
            }
        }
        Expr::Unary {
            op: vira_ir::UnaryOp::Negate,
            operand,
        } => {
            let (c, r) = affine(operand, vars)?;
            Some((
                c.iter().map(|x| -x).collect(),
                sub(Expr::typed_const(0, r.dtype()), r),
            ))
        }
        _ => None,
    }
}

fn zip(a: &[i64], b: &[i64], f: impl Fn(i64, i64) -> i64) -> Vec<i64> {
    a.iter().zip(b).map(|(&x, &y)| f(x, y)).collect()
}

/// Splits a vector index into a scalar base and a per-lane step, so that
/// lane `j` is `base + j * step`.
pub(crate) fn lane_affine(e: &Expr) -> Option<(Expr, Expr)> {
    let zero = || Expr::typed_const(0, e.dtype().with_lanes(1));
    if e.lanes() == 1 {
        return Some((e.clone(), zero()));
    }
    match e {
        Expr::Ramp { base, stride, .. } if base.lanes() == 1 && stride.lanes() == 1 => {
            Some(((**base).clone(), (**stride).clone()))
        }
        Expr::Broadcast { value, .. } if value.lanes() == 1 => Some(((**value).clone(), zero())),
        Expr::Binary { op, lhs, rhs } => {
            let (lb, ls) = lane_affine(lhs)?;
            let (rb, rs) = lane_affine(rhs)?;
            match op {
                vira_ir::BinaryOp::Add => Some((add(lb, rb), add(ls, rs))),
                vira_ir::BinaryOp::Sub => Some((sub(lb, rb), sub(ls, rs))),
                vira_ir::BinaryOp::Mul if is_lit_zero(&ls) => {
                    Some((mul(lb.clone(), rb), mul(lb, rs)))
                }
                vira_ir::BinaryOp::Mul if is_lit_zero(&rs) => {
                    Some((mul(lb, rb.clone()), mul(ls, rb)))
                }
                _ => None,
            }
        }
        _ => None,
    }
}

fn is_lit_zero(e: &Expr) -> bool {
    e.as_literal().is_some_and(Literal::is_zero)
}

/// Gives every loop and let binder inside `stmt` a fresh id.
pub(crate) fn freshen_binders(stmt: Stmt) -> Stmt {
    stmt.transform(&mut |s| match s {
        Stmt::Let { var, value, body } => {
            let fresh = Var::new(var.name.clone(), var.dtype);
            let body = body.substitute(&var, &Expr::var(&fresh));
            Stmt::let_(fresh, value, body)
        }
        Stmt::For(mut l) => {
            let fresh = Var::new(l.var.name.clone(), l.var.dtype);
            l.body = Box::new(l.body.substitute(&l.var, &Expr::var(&fresh)));
            l.var = fresh;
            Stmt::For(l)
        }
        other => other,
    })
}

/// Rebuilds a sequence, dropping empty statements and unwrapping singletons.
pub(crate) fn seq(stmts: Vec<Stmt>) -> Stmt {
    let mut flat: Vec<Stmt> = stmts
        .into_iter()
        .flat_map(Stmt::into_flat)
        .filter(|s| !s.is_empty())
        .collect();
    if flat.len() == 1 {
        flat.remove(0)
    } else {
        Stmt::Seq(flat)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vira_ir::{AddressSpace, Buffer, DataType};

    #[test]
    fn folding_arithmetic() {
        let x = Var::new("x", DataType::I32);
        assert_eq!(add(Expr::i32(2), Expr::i32(3)), Expr::i32(5));
        assert_eq!(add(Expr::i32(0), Expr::var(&x)), Expr::var(&x));
        assert_eq!(sub(Expr::var(&x), Expr::i32(0)), Expr::var(&x));
        assert_eq!(mul(Expr::var(&x), Expr::i32(1)), Expr::var(&x));
        assert_eq!(mul(Expr::i32(0), Expr::var(&x)), Expr::i32(0));
        assert_eq!(
            mul(Expr::var(&x), Expr::i32(4)),
            Expr::mul(Expr::var(&x), Expr::i32(4))
        );
    }

    #[test]
    fn affine_decomposition() {
        let i = Var::new("i", DataType::I32);
        let j = Var::new("j", DataType::I32);
        let n = Var::new("n", DataType::I32);
        // 3 * i + j - 2 + n
        let e = Expr::add(
            Expr::sub(
                Expr::add(Expr::mul(Expr::i32(3), Expr::var(&i)), Expr::var(&j)),
                Expr::i32(2),
            ),
            Expr::var(&n),
        );
        let (coeffs, rest) = affine(&e, &[i.clone(), j.clone()]).unwrap();
        assert_eq!(coeffs, vec![3, 1]);
        assert_eq!(rest, Expr::add(Expr::i32(-2), Expr::var(&n)));

        let square = Expr::mul(Expr::var(&i), Expr::var(&i));
        assert!(affine(&square, &[i]).is_none());
    }

    #[test]
    fn lane_affine_of_index_arithmetic() {
        let o = Var::new("o", DataType::I32);
        // ramp(o, 1, 8) * bcast(2) + bcast(5)
        let e = Expr::add(
            Expr::mul(
                Expr::ramp(Expr::var(&o), Expr::i32(1), 8),
                Expr::broadcast(Expr::i32(2), 8),
            ),
            Expr::broadcast(Expr::i32(5), 8),
        );
        let (base, step) = lane_affine(&e).unwrap();
        assert_eq!(base, Expr::add(Expr::mul(Expr::var(&o), Expr::i32(2)), Expr::i32(5)));
        assert_eq!(step, Expr::i32(2));
    }

    #[test]
    fn data_bits_skip_index_arithmetic() {
        let mut func = Function::new("k");
        let a = func.add_buffer_param(Buffer::fixed("a", DataType::scalar(Scalar::F16), &[64], AddressSpace::Local));
        let load = Expr::load(
            a,
            vec![Expr::ramp(Expr::i32(0), Expr::i32(1), 16)],
            DataType::vector(Scalar::F16, 16),
        );
        let stmt = Stmt::store(a, vec![Expr::ramp(Expr::i32(0), Expr::i32(1), 16)], load);
        assert_eq!(vector_data_bits(&stmt, &func), 16);
        assert_eq!(vector_lanes(&stmt), 16);
        assert_eq!(accessed_bits(&stmt, &func), 16);
    }

    #[test]
    fn freshened_binders_get_new_ids() {
        let i = Var::new("i", DataType::I32);
        let body = Stmt::Evaluate(Expr::var(&i));
        let l = Stmt::For(vira_ir::Loop::serial(i.clone(), Expr::i32(0), Expr::i32(4), body));
        let Stmt::For(out) = freshen_binders(l) else {
            panic!("expected loop");
        };
        assert!(!out.var.same(&i));
        assert_eq!(*out.body, Stmt::Evaluate(Expr::var(&out.var)));
    }
}
