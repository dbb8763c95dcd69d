//! Lower-virtual-vector-pointer pass.
//!
//! Vector loads and stores become `vload`/`vstore` on a byte address
//! `buffer + sum(index * stride)`. Accesses whose lanes are not adjacent in
//! memory use the strided forms when the target has them. Gathers and
//! scatters are unsupported.

use vira_ir::{
    Buffer, DataType, Expr, Function, Handle, Opcode, PropertySet, Stmt, StmtPath,
};
use vira_target::InstructionSet;

use crate::util::{add, lane_affine, mul};
use crate::{LoweringError, Pass, PassContext};

#[derive(Debug)]
pub struct LowerVirtualVectorPointer;

impl Pass for LowerVirtualVectorPointer {
    fn name(&self) -> &'static str {
        "lower-virtual-vector-pointer"
    }

    fn requires(&self) -> PropertySet {
        PropertySet::STRIDES_COMPUTED | PropertySet::VECTORS_NATIVE_WIDTH
    }

    fn establishes(&self) -> PropertySet {
        PropertySet::VIRTUAL_POINTERS
    }

    fn run_on_function(
        &self,
        mut func: Function,
        cx: &PassContext<'_>,
    ) -> Result<Function, LoweringError> {
        let body = std::mem::replace(&mut func.body, Stmt::empty());
        let body = body.try_transform(&mut StmtPath::root(), &mut |mut stmt, path| {
            for e in stmt.exprs_mut() {
                let old = std::mem::replace(e, Expr::bool(false));
                *e = old.try_transform(&mut |e| lower_load(e, &func, cx, path))?;
            }
            lower_store(stmt, &func, cx, path)
        })?;
        func.body = body;
        Ok(func)
    }
}

/// Byte address of the first lane and the byte step between lanes.
struct Access {
    address: Expr,
    step: Expr,
}

impl Access {
    fn new(
        buffer: Handle<Buffer>,
        indices: &[Expr],
        func: &Function,
        cx: &PassContext<'_>,
        path: &StmtPath,
    ) -> Result<Self, LoweringError> {
        let buf = func
            .buffers
            .try_get(buffer)
            .ok_or_else(|| cx.invariant(path, "access to an unknown buffer"))?;
        let strides = buf
            .strides
            .as_ref()
            .ok_or_else(|| cx.invariant(path, format!("buffer `{}` has no strides", buf.name)))?;
        let mut offset = Expr::i32(0);
        let mut step = Expr::i32(0);
        for (index, stride) in indices.iter().zip(strides) {
            let (base, lane_step) = lane_affine(index).ok_or_else(|| {
                cx.unsupported(path, format!("gather or scatter on buffer `{}`", buf.name))
            })?;
            offset = add(offset, mul(base, stride.clone()));
            step = add(step, mul(lane_step, stride.clone()));
        }
        Ok(Self {
            address: Expr::Address {
                buffer,
                offset: Box::new(offset),
            },
            step,
        })
    }

    fn is_contiguous(&self, buf: &Buffer) -> bool {
        self.step.as_int() == Some(buf.elem_bytes() as i64)
    }
}

fn lower_load(
    e: Expr,
    func: &Function,
    cx: &PassContext<'_>,
    path: &StmtPath,
) -> Result<Expr, LoweringError> {
    let Expr::Load {
        buffer,
        indices,
        predicate,
        dtype,
    } = e
    else {
        return Ok(e);
    };
    if dtype.is_scalar() {
        return Ok(Expr::Load {
            buffer,
            indices,
            predicate,
            dtype,
        });
    }
    let access = Access::new(buffer, &indices, func, cx, path)?;
    let mask = predicate.map(|p| *p);
    if access.step.as_int() == Some(0) && mask.is_none() {
        let scalar = indices.iter().map(|i| lane_affine(i).map(|(b, _)| b)).collect::<Option<Vec<_>>>();
        if let Some(scalar) = scalar {
            let load = Expr::load(buffer, scalar, dtype.with_lanes(1));
            return Ok(Expr::broadcast(load, dtype.lanes));
        }
    }
    let buf = &func.buffers[buffer];
    if access.is_contiguous(buf) {
        return Ok(Expr::isa(Opcode::VLoad, vec![access.address], mask, dtype));
    }
    if !cx.target.supports(InstructionSet::STRIDED_LOAD) {
        return Err(cx.unsupported(
            path,
            format!("strided load from `{}` without strided-load support", buf.name),
        ));
    }
    Ok(Expr::isa(
        Opcode::VLoadStrided,
        vec![access.address, access.step],
        mask,
        dtype,
    ))
}

fn lower_store(
    stmt: Stmt,
    func: &Function,
    cx: &PassContext<'_>,
    path: &StmtPath,
) -> Result<Stmt, LoweringError> {
    let Stmt::Store {
        buffer,
        indices,
        value,
        predicate,
    } = stmt
    else {
        return Ok(stmt);
    };
    let lanes = indices.iter().map(Expr::lanes).fold(value.lanes(), u16::max);
    if lanes == 1 {
        return Ok(Stmt::Store {
            buffer,
            indices,
            value,
            predicate,
        });
    }
    let access = Access::new(buffer, &indices, func, cx, path)?;
    let value = crate::util::broadcast_to(value, lanes);
    let buf = &func.buffers[buffer];
    let inst = if access.is_contiguous(buf) {
        Expr::isa(Opcode::VStore, vec![access.address, value], predicate, DataType::VOID)
    } else if access.step.as_int() == Some(0) {
        return Err(cx.unsupported(
            path,
            format!("every lane of a store to `{}` hits one element", buf.name),
        ));
    } else if cx.target.supports(InstructionSet::STRIDED_STORE) {
        Expr::isa(
            Opcode::VStoreStrided,
            vec![access.address, access.step, value],
            predicate,
            DataType::VOID,
        )
    } else {
        return Err(cx.unsupported(
            path,
            format!("strided store to `{}` without strided-store support", buf.name),
        ));
    };
    Ok(Stmt::Evaluate(inst))
}
