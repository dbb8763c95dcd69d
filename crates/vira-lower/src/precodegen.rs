//! Precodegen: the last gate before code generation.
//!
//! Nothing is rewritten. The function must consist solely of node kinds the
//! code generator emits, every vector must fit a register, masks must match
//! the instructions they guard, memory must be reachable by the unit that
//! touches it, and every DMA destination must be waited on before use.

use vira_ir::{Buffer, Expr, Function, Handle, Intrinsic, Opcode, PropertySet, Stmt, StmtPath};
use vira_target::TargetDescriptor;

use crate::event_state::check_event_safety;
use crate::{LoweringError, Pass, PassContext};

#[derive(Debug)]
pub struct Precodegen;

impl Pass for Precodegen {
    fn name(&self) -> &'static str {
        "precodegen"
    }

    fn requires(&self) -> PropertySet {
        PropertySet::STANDARD_FORM | PropertySet::EVENTS_INITIALIZED | PropertySet::VIRTUAL_ISA
    }

    fn run_on_function(
        &self,
        func: Function,
        cx: &PassContext<'_>,
    ) -> Result<Function, LoweringError> {
        func.body.walk(&mut StmtPath::root(), &mut |stmt, path| {
            check_stmt(stmt, &func, cx.target).map_err(|m| cx.unsupported(path, m))
        })?;
        match &func.event_state {
            Some(state) if state.slots.len() == func.events.len() => {}
            _ => {
                return Err(cx.invariant(&StmtPath::root(), "event table missing or incomplete"));
            }
        }
        check_event_safety(&func).map_err(|(path, m)| cx.unsupported(&path, m))?;
        log::debug!("`{}` is ready for code generation", func.name);
        Ok(func)
    }
}

fn check_stmt(stmt: &Stmt, func: &Function, target: &TargetDescriptor) -> Result<(), String> {
    let buffer = |h: Handle<Buffer>| {
        func.buffers
            .try_get(h)
            .ok_or_else(|| format!("unknown buffer #{}", h.index()))
    };
    match stmt {
        Stmt::For(l) if l.likely || l.partition.is_some() => {
            return Err(format!("loop over `{}` carries partition hints", l.var.name));
        }
        Stmt::Store {
            buffer: b, value, ..
        } => {
            if value.lanes() > 1 {
                return Err(format!("vector store of `{}` is not an instruction", value.dtype()));
            }
            let buf = buffer(*b)?;
            if !target.is_compute_accessible(buf.space) {
                return Err(format!("`{}` in {} is not reachable from compute", buf.name, buf.space));
            }
        }
        Stmt::Dma(dma) => {
            for end in [&dma.src, &dma.dst] {
                let buf = buffer(end.buffer)?;
                if !target.is_dma_capable(buf.space) {
                    return Err(format!("`{}` in {} is not reachable by DMA", buf.name, buf.space));
                }
            }
        }
        _ => {}
    }
    for e in stmt.exprs() {
        let mut res = Ok(());
        e.visit(&mut |e| {
            if res.is_ok() {
                res = check_expr(e, func, target);
            }
        });
        res?;
    }
    Ok(())
}

fn check_expr(e: &Expr, func: &Function, target: &TargetDescriptor) -> Result<(), String> {
    let reachable = |h: Handle<Buffer>| match func.buffers.try_get(h) {
        Some(buf) if target.is_compute_accessible(buf.space) => Ok(()),
        Some(buf) => Err(format!("`{}` in {} is not reachable from compute", buf.name, buf.space)),
        None => Err(format!("unknown buffer #{}", h.index())),
    };
    match e {
        Expr::Var(_) | Expr::Mask(_) => Ok(()),
        Expr::Isa(inst) => {
            let lanes = if inst.dtype.is_void() {
                inst.args.last().map_or(1, Expr::lanes)
            } else {
                inst.dtype.lanes
            };
            let data = match inst.opcode {
                Opcode::VStore | Opcode::VStoreStrided => {
                    inst.args.last().map_or(inst.dtype, Expr::dtype)
                }
                _ => inst.dtype,
            };
            if !data.scalar.is_bool() && data.total_bits() > target.native_vector_bits {
                return Err(format!(
                    "`{}` on `{data}` is wider than {} bits",
                    inst.opcode, target.native_vector_bits
                ));
            }
            if let Some(mask) = &inst.mask
                && mask.lanes() != lanes
            {
                return Err(format!(
                    "{}-lane mask on {lanes}-lane `{}`",
                    mask.lanes(),
                    inst.opcode
                ));
            }
            if (inst.opcode.is_load() || inst.opcode.is_store())
                && let Some(Expr::Address { buffer, .. }) = inst.args.first()
            {
                reachable(*buffer)?;
            }
            Ok(())
        }
        _ if e.lanes() > 1 => Err(format!(
            "generic vector expression of type `{}` has no instruction",
            e.dtype()
        )),
        Expr::Ramp { .. } | Expr::Broadcast { .. } => {
            Err("single-lane vector constructor".to_string())
        }
        Expr::Load { buffer, .. } => reachable(*buffer),
        Expr::Call {
            intrinsic: Intrinsic::GetLocalId,
            ..
        } => Err("core index was never resolved".to_string()),
        Expr::Call {
            intrinsic: Intrinsic::Widen | Intrinsic::Narrow | Intrinsic::Convert,
            ..
        } => Err("lane-width intrinsic on a scalar".to_string()),
        _ => Ok(()),
    }
}
