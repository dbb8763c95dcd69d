//! Post-pass checks for every pipeline property.

use vira_ir::{Expr, ForKind, Function, PropertySet, Stmt, StmtPath};
use vira_target::TargetDescriptor;

use crate::util::{native_lanes, stmt_data, vector_data_bits, vector_lanes, visit_data};
use crate::{LoweringError, PassContext, dma, event_state};

type Violation = (StmtPath, String);

/// Checks every flag in `props` on `func`.
pub(crate) fn check_all(
    props: PropertySet,
    func: &Function,
    cx: &PassContext<'_>,
) -> Result<(), LoweringError> {
    for flag in props.iter() {
        check(flag, func, cx.target).map_err(|(path, message)| {
            cx.invariant(
                &path,
                format!("{} not established: {message}", flag.name().unwrap_or("?")),
            )
        })?;
    }
    Ok(())
}

/// Checks one property flag.
pub(crate) fn check(
    flag: PropertySet,
    func: &Function,
    target: &TargetDescriptor,
) -> Result<(), Violation> {
    match flag {
        PropertySet::STRIDES_COMPUTED => strides_computed(func),
        PropertySet::EVENTS_INITIALIZED => events_initialized(func),
        _ => func.body.walk(&mut StmtPath::root(), &mut |stmt, path| {
            let res = match flag {
                PropertySet::DMA_INSERTED => dma_inserted(stmt, func, target),
                PropertySet::LOOPS_PARTITIONED => loops_partitioned(stmt),
                PropertySet::PREDICATES_LOWERED => predicates_lowered(stmt),
                PropertySet::VECTORS_WITHIN_NATIVE_WIDTH => within_native(stmt, target),
                PropertySet::VECTORS_NATIVE_WIDTH => native_width(stmt, func, target),
                PropertySet::VECTOR_CASTS_LOWERED => casts_lowered(stmt),
                PropertySet::VIRTUAL_POINTERS => virtual_pointers(stmt),
                PropertySet::VIRTUAL_ISA => virtual_isa(stmt),
                PropertySet::STANDARD_FORM => standard_form(stmt),
                _ => Ok(()),
            };
            res.map_err(|message| (path.clone(), message))
        }),
    }
}

fn strides_computed(func: &Function) -> Result<(), Violation> {
    for (_, buf) in func.buffers.iter() {
        match &buf.strides {
            Some(strides) if strides.len() == buf.rank() => {}
            _ => {
                return Err((
                    StmtPath::root(),
                    format!("buffer `{}` has no strides", buf.name),
                ));
            }
        }
    }
    Ok(())
}

fn events_initialized(func: &Function) -> Result<(), Violation> {
    match &func.event_state {
        Some(state) if state.slots.len() == func.events.len() => {}
        _ => return Err((StmtPath::root(), "event table missing or incomplete".into())),
    }
    event_state::check_event_safety(func)
}

fn dma_inserted(stmt: &Stmt, func: &Function, target: &TargetDescriptor) -> Result<(), String> {
    match stmt {
        Stmt::For(l) if dma::plan_copy(l, func, target).is_some() => {
            Err("copy loop nest left for the compute unit".into())
        }
        _ => Ok(()),
    }
}

fn loops_partitioned(stmt: &Stmt) -> Result<(), String> {
    match stmt {
        Stmt::For(l) if l.kind == ForKind::Vectorized => Err(format!(
            "vectorized loop over `{}` remains",
            l.var.name
        )),
        _ => Ok(()),
    }
}

/// Every predicate must cover exactly the lanes of its operation.
fn predicates_lowered(stmt: &Stmt) -> Result<(), String> {
    if let Stmt::Store {
        indices,
        value,
        predicate: Some(p),
        ..
    } = stmt
    {
        let lanes = indices.iter().map(Expr::lanes).fold(value.lanes(), u16::max);
        if p.lanes() != lanes {
            return Err(format!("store predicate has {} lanes, store has {lanes}", p.lanes()));
        }
    }
    let mut bad = None;
    for e in stmt.exprs() {
        e.visit(&mut |e| match e {
            Expr::Load {
                predicate: Some(p),
                dtype,
                ..
            } if p.lanes() != dtype.lanes => {
                bad = Some(format!("load predicate has {} lanes, load has {}", p.lanes(), dtype.lanes));
            }
            Expr::Isa(inst) => {
                if let Some(mask) = &inst.mask {
                    let lanes = if inst.opcode.is_store() {
                        inst.args.last().map_or(0, Expr::lanes)
                    } else {
                        inst.dtype.lanes
                    };
                    if mask.lanes() != lanes {
                        bad = Some(format!(
                            "`{}` mask has {} lanes, operation has {lanes}",
                            inst.opcode,
                            mask.lanes()
                        ));
                    }
                }
            }
            _ => {}
        });
    }
    bad.map_or(Ok(()), Err)
}

fn within_native(stmt: &Stmt, target: &TargetDescriptor) -> Result<(), String> {
    let mut bad = None;
    for e in stmt_data(stmt) {
        visit_data(e, &mut |e| {
            let ty = e.dtype();
            if ty.is_vector() && !ty.scalar.is_bool() && ty.total_bits() > target.native_vector_bits
            {
                bad = Some(format!("`{ty}` is wider than {} bits", target.native_vector_bits));
            }
        });
    }
    bad.map_or(Ok(()), Err)
}

fn native_width(stmt: &Stmt, func: &Function, target: &TargetDescriptor) -> Result<(), String> {
    let bits = vector_data_bits(stmt, func);
    if bits == 0 || vector_lanes(stmt) == 1 {
        return Ok(());
    }
    let want = native_lanes(target, bits);
    let mut bad = None;
    if let Stmt::Store { indices, .. } = stmt {
        for idx in indices.iter().filter(|i| i.lanes() > 1) {
            if idx.lanes() != want {
                bad = Some(format!("store index has {} lanes, expected {want}", idx.lanes()));
            }
        }
    }
    for e in stmt_data(stmt) {
        visit_data(e, &mut |e| {
            let lanes = e.lanes();
            if lanes > 1 && lanes != want {
                bad = Some(format!("`{}` has {lanes} lanes, expected {want}", e.dtype()));
            }
        });
    }
    bad.map_or(Ok(()), Err)
}

fn any_expr(stmt: &Stmt, pred: &mut dyn FnMut(&Expr) -> bool) -> bool {
    stmt.exprs().into_iter().any(|e| e.any(pred))
}

fn casts_lowered(stmt: &Stmt) -> Result<(), String> {
    if any_expr(stmt, &mut |e| matches!(e, Expr::Cast { .. } if e.lanes() > 1)) {
        return Err("vector cast remains".into());
    }
    Ok(())
}

fn virtual_pointers(stmt: &Stmt) -> Result<(), String> {
    if let Stmt::Store { indices, value, .. } = stmt
        && (value.lanes() > 1 || indices.iter().any(|i| i.lanes() > 1))
    {
        return Err("vector store remains".into());
    }
    if any_expr(stmt, &mut |e| matches!(e, Expr::Load { dtype, .. } if dtype.is_vector())) {
        return Err("vector load remains".into());
    }
    Ok(())
}

fn virtual_isa(stmt: &Stmt) -> Result<(), String> {
    let generic = |e: &Expr| {
        e.lanes() > 1
            && matches!(
                e,
                Expr::Unary { .. }
                    | Expr::Binary { .. }
                    | Expr::Select { .. }
                    | Expr::Ramp { .. }
                    | Expr::Broadcast { .. }
                    | Expr::Cast { .. }
                    | Expr::Reinterpret { .. }
                    | Expr::Call { .. }
                    | Expr::Load { .. }
            )
    };
    let mut found = None;
    for e in stmt.exprs() {
        e.visit(&mut |e| {
            if found.is_none() && generic(e) {
                found = Some(format!("generic vector expression of type `{}` remains", e.dtype()));
            }
        });
    }
    found.map_or(Ok(()), Err)
}

fn standard_form(stmt: &Stmt) -> Result<(), String> {
    if let Stmt::For(l) = stmt {
        if l.kind == ForKind::Vectorized {
            return Err("vectorized loop remains".into());
        }
        if l.likely || l.partition.is_some() {
            return Err("loop still carries partition hints".into());
        }
    }
    if let Stmt::Store {
        predicate: Some(Expr::Mask(m)),
        ..
    } = stmt
        && m.is_all_true()
    {
        return Err("all-true store mask remains".into());
    }
    let all_true = |e: &Expr| {
        matches!(
            e,
            Expr::Isa(inst) if matches!(&inst.mask, Some(Expr::Mask(m)) if m.is_all_true())
        ) || matches!(
            e,
            Expr::Load { predicate: Some(p), .. } if matches!(&**p, Expr::Mask(m) if m.is_all_true())
        )
    };
    if any_expr(stmt, &mut |e| all_true(e)) {
        return Err("all-true mask remains".into());
    }
    Ok(())
}
