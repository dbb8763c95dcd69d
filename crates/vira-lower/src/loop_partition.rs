//! Loop-partition pass.
//!
//! A `vectorized` loop `for i in m..m+n` is split into
//!
//! ```text
//! for io in 0..n/L          (likely, main)   i = ramp(m + io*L, 1, L)
//! for it in n/L..n/L+t      (tail)           same, every access masked by
//!                                            ramp(it*L, 1, L) < n
//! ```
//!
//! where `L` is the native vector width divided by the widest element the
//! body accesses and `t` is 1 when `n % L != 0`, else 0.

use vira_ir::{
    BinaryOp, Expr, ForKind, Function, Intrinsic, Loop, PartitionRole, PropertySet, Stmt,
    StmtPath, Var,
};

use crate::util::{accessed_bits, add, broadcast_to, freshen_binders, mul, native_lanes};
use crate::{LoweringError, Pass, PassContext};

#[derive(Debug)]
pub struct LoopPartition;

impl Pass for LoopPartition {
    fn name(&self) -> &'static str {
        "loop-partition"
    }

    fn establishes(&self) -> PropertySet {
        PropertySet::LOOPS_PARTITIONED
    }

    fn invalidates(&self) -> PropertySet {
        PropertySet::PREDICATES_LOWERED
            | PropertySet::VECTORS_WITHIN_NATIVE_WIDTH
            | PropertySet::VECTORS_NATIVE_WIDTH
            | PropertySet::VECTOR_CASTS_LOWERED
            | PropertySet::VIRTUAL_POINTERS
            | PropertySet::VIRTUAL_ISA
    }

    fn run_on_function(
        &self,
        mut func: Function,
        cx: &PassContext<'_>,
    ) -> Result<Function, LoweringError> {
        let body = std::mem::replace(&mut func.body, Stmt::empty());
        let body = body.try_transform(&mut StmtPath::root(), &mut |stmt, path| match stmt {
            Stmt::For(l) if l.kind == ForKind::Vectorized => partition(l, &func, path, cx),
            other => Ok(other),
        })?;
        func.body = body;
        Ok(func)
    }
}

fn partition(
    l: Loop,
    func: &Function,
    path: &StmtPath,
    cx: &PassContext<'_>,
) -> Result<Stmt, LoweringError> {
    if contains_loop(&l.body) {
        return Err(cx.unsupported(
            path,
            format!("vectorized loop over `{}` contains a nested loop", l.var.name),
        ));
    }
    if l.const_extent().is_some_and(|n| n <= 0) {
        return Ok(Stmt::empty());
    }

    let bits = match accessed_bits(&l.body, func) {
        0 => l.var.dtype.scalar.bits(),
        bits => bits,
    };
    let lanes = native_lanes(cx.target, bits);
    let ty = l.var.dtype;
    let width = || Expr::typed_const(i64::from(lanes), ty);
    log::debug!(
        "`{}`: partitioning loop over `{}` by {lanes} lanes",
        func.name,
        l.var.name
    );

    let (main_extent, tail_extent) = match l.const_extent() {
        Some(n) => {
            let n_lanes = i64::from(lanes);
            (
                Expr::typed_const(n / n_lanes, ty),
                Expr::typed_const(i64::from(n % n_lanes != 0), ty),
            )
        }
        None => (
            Expr::binary(BinaryOp::Div, l.extent.clone(), width()),
            Expr::binary(
                BinaryOp::Min,
                Expr::binary(BinaryOp::Mod, l.extent.clone(), width()),
                Expr::typed_const(1, ty),
            ),
        ),
    };

    let lane_ramp = |outer: &Var, base: Expr| {
        Expr::ramp(
            add(base, mul(Expr::var(outer), width())),
            Expr::typed_const(1, ty),
            lanes,
        )
    };

    let mut parts = Vec::with_capacity(2);

    if main_extent.as_int() != Some(0) {
        let io = l.var.derive("_o", ty);
        let body = l.body.clone().substitute(&l.var, &lane_ramp(&io, l.min.clone()));
        let body = vectorize(body, path, cx)?;
        parts.push(Stmt::For(Loop {
            var: io,
            min: Expr::typed_const(0, ty),
            extent: main_extent.clone(),
            kind: ForKind::Serial,
            likely: true,
            partition: Some(PartitionRole::Main),
            body: Box::new(body),
        }));
    }

    if tail_extent.as_int() != Some(0) {
        let it = l.var.derive("_t", ty);
        let body = freshen_binders((*l.body).clone());
        let body = body.substitute(&l.var, &lane_ramp(&it, l.min.clone()));
        let body = vectorize(body, path, cx)?;
        let in_range = Expr::lt(
            Expr::ramp(mul(Expr::var(&it), width()), Expr::typed_const(1, ty), lanes),
            Expr::broadcast(l.extent.clone(), lanes),
        );
        parts.push(Stmt::For(Loop {
            var: it,
            min: main_extent,
            extent: tail_extent,
            kind: ForKind::Serial,
            likely: false,
            partition: Some(PartitionRole::Tail),
            body: Box::new(predicate_accesses(body, &in_range)),
        }));
    }

    Ok(match parts.len() {
        1 => parts.remove(0),
        _ => Stmt::Seq(parts),
    })
}

fn contains_loop(stmt: &Stmt) -> bool {
    stmt.walk(&mut StmtPath::root(), &mut |s, _| match s {
        Stmt::For(_) => Err(()),
        _ => Ok(()),
    })
    .is_err()
}

/// Retypes a body whose loop variable was replaced by a ramp.
fn vectorize(body: Stmt, path: &StmtPath, cx: &PassContext<'_>) -> Result<Stmt, LoweringError> {
    match body {
        Stmt::Seq(stmts) => stmts
            .into_iter()
            .map(|s| vectorize(s, path, cx))
            .collect::<Result<_, _>>()
            .map(Stmt::Seq),
        Stmt::Let { var, value, body } => {
            let value = vectorize_expr(value);
            let (var, body) = if value.dtype() == var.dtype {
                (var, *body)
            } else {
                let retyped = Var {
                    dtype: value.dtype(),
                    ..var.clone()
                };
                let body = body.substitute(&var, &Expr::var(&retyped));
                (retyped, body)
            };
            Ok(Stmt::let_(var, value, vectorize(body, path, cx)?))
        }
        Stmt::Store {
            buffer,
            indices,
            value,
            predicate,
        } => {
            let indices: Vec<Expr> = indices.into_iter().map(vectorize_expr).collect();
            let value = vectorize_expr(value);
            let predicate = predicate.map(vectorize_expr);
            let index_lanes = indices.iter().map(Expr::lanes).max().unwrap_or(1);
            let lanes = predicate
                .iter()
                .map(Expr::lanes)
                .fold(index_lanes.max(value.lanes()), u16::max);
            if lanes > 1 && index_lanes == 1 {
                return Err(cx.unsupported(
                    path,
                    "store to a location that does not depend on the vectorized loop variable",
                ));
            }
            Ok(Stmt::Store {
                buffer,
                indices,
                value: broadcast_to(value, lanes),
                predicate: predicate.map(|p| broadcast_to(p, lanes)),
            })
        }
        Stmt::If {
            condition,
            then_case,
            else_case,
        } => Ok(Stmt::If {
            condition: vectorize_expr(condition),
            then_case: Box::new(vectorize(*then_case, path, cx)?),
            else_case: else_case
                .map(|e| vectorize(*e, path, cx).map(Box::new))
                .transpose()?,
        }),
        Stmt::Evaluate(e) => Ok(Stmt::Evaluate(vectorize_expr(e))),
        other => Ok(other),
    }
}

/// Propagates lane counts upwards, broadcasting scalar operands.
fn vectorize_expr(e: Expr) -> Expr {
    e.transform(&mut |e| match e {
        Expr::Binary { op, lhs, rhs } => {
            let lanes = lhs.lanes().max(rhs.lanes());
            Expr::binary(op, broadcast_to(*lhs, lanes), broadcast_to(*rhs, lanes))
        }
        Expr::Select {
            condition,
            accept,
            reject,
        } => {
            let lanes = condition.lanes().max(accept.lanes()).max(reject.lanes());
            Expr::Select {
                condition: Box::new(broadcast_to(*condition, lanes)),
                accept: Box::new(broadcast_to(*accept, lanes)),
                reject: Box::new(broadcast_to(*reject, lanes)),
            }
        }
        Expr::Load {
            buffer,
            indices,
            predicate,
            dtype,
        } => {
            let lanes = indices
                .iter()
                .chain(predicate.as_deref())
                .map(Expr::lanes)
                .fold(dtype.lanes, u16::max);
            Expr::Load {
                buffer,
                indices,
                predicate: predicate.map(|p| Box::new(broadcast_to(*p, lanes))),
                dtype: dtype.with_lanes(lanes),
            }
        }
        Expr::Cast { value, dtype } => {
            let lanes = value.lanes();
            Expr::Cast {
                value,
                dtype: dtype.with_lanes(lanes),
            }
        }
        Expr::Reinterpret { value, dtype } => {
            let lanes = value.lanes();
            Expr::Reinterpret {
                value,
                dtype: dtype.with_lanes(lanes),
            }
        }
        Expr::Call {
            intrinsic,
            args,
            dtype,
        } if intrinsic != Intrinsic::GetLocalId && !dtype.is_void() => {
            let lanes = args.iter().map(Expr::lanes).fold(dtype.lanes, u16::max);
            Expr::Call {
                intrinsic,
                args,
                dtype: dtype.with_lanes(lanes),
            }
        }
        other => other,
    })
}

/// Adds `mask` to every vector load and store.
fn predicate_accesses(body: Stmt, mask: &Expr) -> Stmt {
    let lanes = mask.lanes();
    let combine = |existing: Option<Expr>| match existing {
        Some(p) => Expr::and(p, mask.clone()),
        None => mask.clone(),
    };
    let body = body.map_exprs(&mut |e| {
        e.transform(&mut |e| match e {
            Expr::Load {
                buffer,
                indices,
                predicate,
                dtype,
            } if dtype.lanes == lanes => Expr::Load {
                buffer,
                indices,
                predicate: Some(Box::new(combine(predicate.map(|p| *p)))),
                dtype,
            },
            other => other,
        })
    });
    body.transform(&mut |s| match s {
        Stmt::Store {
            buffer,
            indices,
            value,
            predicate,
        } if value.lanes() == lanes => Stmt::Store {
            buffer,
            indices,
            value,
            predicate: Some(combine(predicate)),
        },
        other => other,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::run_pass;
    use vira_ir::eval::{Interpreter, Lane};
    use vira_ir::{AddressSpace, Buffer, DataType, Dim, Param, Scalar};

    fn mask_type(lanes: u16) -> DataType {
        DataType::vector(Scalar::BOOL, lanes)
    }

    /// `c[i] = a[i] + b[i]` over `n` elements, `n` literal or symbolic.
    fn add_kernel(n: Option<i64>) -> (Function, Option<Var>) {
        let mut func = Function::new("add");
        let size = Var::new("n", DataType::I32);
        let dim = match n {
            Some(n) => Dim::Fixed(n as u64),
            None => Dim::Size(size.clone()),
        };
        let mk = |name: &str| Buffer::new(name, DataType::F32, vec![dim.clone()], AddressSpace::Local);
        let a = func.add_buffer_param(mk("a"));
        let b = func.add_buffer_param(mk("b"));
        let c = func.add_buffer_param(mk("c"));
        if n.is_none() {
            func.params.push(Param::Scalar(size.clone()));
        }
        let i = Var::new("i", DataType::I32);
        let idx = || vec![Expr::var(&i)];
        let body = Stmt::store(
            c,
            idx(),
            Expr::add(
                Expr::load(a, idx(), DataType::F32),
                Expr::load(b, idx(), DataType::F32),
            ),
        );
        let extent = n.map_or_else(|| Expr::var(&size), Expr::i32);
        let mut l = Loop::serial(i, Expr::i32(0), extent, body);
        l.kind = ForKind::Vectorized;
        func.body = Stmt::For(l);
        (func, n.is_none().then_some(size))
    }

    fn run_add(func: &Function, n: usize) -> Vec<Lane> {
        let mut interp = Interpreter::new(func);
        interp.set_scalar("n", Lane::Int(n as i64));
        interp.set_buffer("a", (0..n).map(|v| Lane::Float(v as f64)).collect());
        interp.set_buffer("b", (0..n).map(|v| Lane::Float(10.0 * v as f64)).collect());
        interp.run().unwrap();
        interp.buffer("c").unwrap().to_vec()
    }

    fn loops(stmt: &Stmt) -> Vec<&Loop> {
        match stmt {
            Stmt::For(l) => vec![l],
            Stmt::Seq(s) => s.iter().flat_map(loops).collect(),
            _ => Vec::new(),
        }
    }

    #[test]
    fn main_and_tail_for_ragged_extent() {
        let (func, _) = add_kernel(Some(20));
        let out = run_pass(&LoopPartition, func.clone()).unwrap();
        let parts = loops(&out.body);
        assert_eq!(parts.len(), 2);
        let (main, tail) = (parts[0], parts[1]);
        assert!(main.likely);
        assert_eq!(main.partition, Some(PartitionRole::Main));
        assert_eq!(main.extent, Expr::i32(2));
        assert_eq!(tail.partition, Some(PartitionRole::Tail));
        assert_eq!(tail.min, Expr::i32(2));
        assert_eq!(tail.extent, Expr::i32(1));

        let Stmt::Store {
            value, predicate, ..
        } = &*tail.body
        else {
            panic!("expected store");
        };
        assert_eq!(value.dtype(), DataType::vector(Scalar::F32, 8));
        assert_eq!(predicate.as_ref().unwrap().dtype(), mask_type(8));

        assert_eq!(run_add(&func, 20), run_add(&out, 20));
    }

    #[test]
    fn exact_multiple_has_no_tail() {
        let (func, _) = add_kernel(Some(16));
        let out = run_pass(&LoopPartition, func).unwrap();
        let parts = loops(&out.body);
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].extent, Expr::i32(2));
        assert!(parts[0].body.buffer_effects().writes.len() == 1);
    }

    #[test]
    fn short_loop_is_tail_only() {
        let (func, _) = add_kernel(Some(5));
        let out = run_pass(&LoopPartition, func.clone()).unwrap();
        let parts = loops(&out.body);
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].partition, Some(PartitionRole::Tail));
        assert_eq!(run_add(&func, 5), run_add(&out, 5));
    }

    #[test]
    fn symbolic_extent_matches_reference() {
        let (func, size) = add_kernel(None);
        assert!(size.is_some());
        let out = run_pass(&LoopPartition, func.clone()).unwrap();
        assert_eq!(loops(&out.body).len(), 2);
        for n in [0, 3, 8, 13, 24] {
            assert_eq!(run_add(&func, n), run_add(&out, n), "n = {n}");
        }
    }

    #[test]
    fn lanes_follow_widest_access() {
        let mut func = Function::new("k");
        let a = func.add_buffer_param(Buffer::fixed("a", DataType::scalar(Scalar::I16), &[32], AddressSpace::Local));
        let i = Var::new("i", DataType::I32);
        let body = Stmt::store(
            a,
            vec![Expr::var(&i)],
            Expr::load(a, vec![Expr::var(&i)], DataType::scalar(Scalar::I16)),
        );
        let mut l = Loop::serial(i, Expr::i32(0), Expr::i32(32), body);
        l.kind = ForKind::Vectorized;
        func.body = Stmt::For(l);
        let out = run_pass(&LoopPartition, func).unwrap();
        let Stmt::For(main) = &out.body else { panic!("expected one loop") };
        assert_eq!(main.extent, Expr::i32(2));
    }

    #[test]
    fn reduction_is_unsupported() {
        let mut func = Function::new("sum");
        let a = func.add_buffer_param(Buffer::fixed("a", DataType::F32, &[16], AddressSpace::Local));
        let acc = func.add_buffer_param(Buffer::fixed("acc", DataType::F32, &[1], AddressSpace::Local));
        let i = Var::new("i", DataType::I32);
        let body = Stmt::store(
            acc,
            vec![Expr::i32(0)],
            Expr::add(
                Expr::load(acc, vec![Expr::i32(0)], DataType::F32),
                Expr::load(a, vec![Expr::var(&i)], DataType::F32),
            ),
        );
        let mut l = Loop::serial(i, Expr::i32(0), Expr::i32(16), body);
        l.kind = ForKind::Vectorized;
        func.body = Stmt::For(l);
        let err = run_pass(&LoopPartition, func).unwrap_err();
        assert!(matches!(err, LoweringError::UnsupportedConstruct { .. }));
    }

    #[test]
    fn nested_loop_is_unsupported() {
        let (mut func, _) = add_kernel(Some(8));
        let Stmt::For(l) = &mut func.body else { unreachable!() };
        let j = Var::new("j", DataType::I32);
        let inner = std::mem::replace(&mut *l.body, Stmt::empty());
        *l.body = Stmt::For(Loop::serial(j, Expr::i32(0), Expr::i32(2), inner));
        assert!(run_pass(&LoopPartition, func).is_err());
    }

    #[test]
    fn let_bound_values_become_vectors() {
        let mut func = Function::new("k");
        let a = func.add_buffer_param(Buffer::fixed("a", DataType::F32, &[8], AddressSpace::Local));
        let i = Var::new("i", DataType::I32);
        let t = Var::new("t", DataType::F32);
        let body = Stmt::let_(
            t.clone(),
            Expr::mul(Expr::load(a, vec![Expr::var(&i)], DataType::F32), Expr::f32(2.0)),
            Stmt::store(a, vec![Expr::var(&i)], Expr::var(&t)),
        );
        let mut l = Loop::serial(i, Expr::i32(0), Expr::i32(8), body);
        l.kind = ForKind::Vectorized;
        func.body = Stmt::For(l);
        let out = run_pass(&LoopPartition, func).unwrap();
        let Stmt::For(main) = &out.body else { panic!("expected loop") };
        let Stmt::Let { var, .. } = &*main.body else { panic!("expected let") };
        assert_eq!(var.dtype, DataType::vector(Scalar::F32, 8));
        assert_eq!(var.id, t.id);
    }
}
