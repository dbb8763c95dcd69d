//! Insert-dma pass.
//!
//! A perfect loop nest whose innermost body is `dst[f(i..)] = src[g(i..)]`,
//! with `src` and `dst` in different DMA-capable address spaces and both
//! index lists affine in the loop variables, is replaced by one DMA
//! transfer. Loop extents become per-dimension lengths; byte strides come
//! from the buffer strides. Dimensions that are contiguous on both sides are
//! coalesced and single-element dimensions are dropped.

use vira_ir::{
    Buffer, DataType, DmaDim, DmaEndpoint, DmaTransfer, Event, Expr, Function, Handle, Loop,
    PropertySet, Stmt, Var,
};
use vira_target::TargetDescriptor;

use crate::util::{add, affine, mul};
use crate::{LoweringError, Pass, PassContext};

#[derive(Debug)]
pub struct InsertDma;

impl Pass for InsertDma {
    fn name(&self) -> &'static str {
        "insert-dma"
    }

    fn requires(&self) -> PropertySet {
        PropertySet::STRIDES_COMPUTED
    }

    fn establishes(&self) -> PropertySet {
        PropertySet::DMA_INSERTED
    }

    fn run_on_function(
        &self,
        mut func: Function,
        cx: &PassContext<'_>,
    ) -> Result<Function, LoweringError> {
        let body = std::mem::replace(&mut func.body, Stmt::empty());
        let mut events = Vec::new();
        let body = rewrite(body, &func, cx.target, &mut events);
        if !events.is_empty() {
            log::debug!("`{}`: {} copy nest(s) became DMA", func.name, events.len());
        }
        for event in events {
            func.events.append(event);
        }
        func.body = body;
        Ok(func)
    }
}

/// A DMA transfer without its event.
#[derive(Debug)]
pub(crate) struct CopyPlan {
    pub src: DmaEndpoint,
    pub dst: DmaEndpoint,
    pub dims: Vec<DmaDim>,
    pub elem_bytes: u32,
}

fn rewrite(stmt: Stmt, func: &Function, target: &TargetDescriptor, events: &mut Vec<Event>) -> Stmt {
    if let Stmt::For(l) = &stmt {
        if let Some(plan) = plan_copy(l, func, target) {
            let event = Handle::new((func.events.len() + events.len()) as u32);
            events.push(Event {
                name: format!("dma{}", event.index()),
            });
            return Stmt::Dma(DmaTransfer {
                src: plan.src,
                dst: plan.dst,
                dims: plan.dims,
                elem_bytes: plan.elem_bytes,
                event,
            });
        }
        if let Some((src, dst)) = copy_buffers(l)
            && let (Some(s), Some(d)) = (func.buffers.try_get(src), func.buffers.try_get(dst))
            && s.space != d.space
        {
            log::warn!(
                "`{}`: copy loop over `{}` from `{}` to `{}` stays on the compute unit",
                func.name,
                l.var.name,
                s.name,
                d.name
            );
        }
    }
    let mut stmt = stmt;
    for child in stmt.children_mut() {
        let old = std::mem::replace(child, Stmt::empty());
        *child = rewrite(old, func, target, events);
    }
    stmt
}

/// The loops of a perfect nest starting at `l`, and its innermost body.
fn perfect_nest(l: &Loop) -> (Vec<&Loop>, &Stmt) {
    let mut loops = vec![l];
    let mut body: &Stmt = &l.body;
    loop {
        match body {
            Stmt::Seq(stmts) if stmts.len() == 1 => body = &stmts[0],
            Stmt::For(inner) => {
                loops.push(inner);
                body = &inner.body;
            }
            _ => return (loops, body),
        }
    }
}

/// `(src, dst)` if the nest body is a plain element copy.
fn copy_buffers(l: &Loop) -> Option<(Handle<Buffer>, Handle<Buffer>)> {
    match perfect_nest(l).1 {
        Stmt::Store {
            buffer: dst,
            value: Expr::Load { buffer: src, .. },
            ..
        } => Some((*src, *dst)),
        _ => None,
    }
}

/// Plans a DMA transfer for the copy nest rooted at `l`, if it is one.
pub(crate) fn plan_copy(l: &Loop, func: &Function, target: &TargetDescriptor) -> Option<CopyPlan> {
    let (loops, body) = perfect_nest(l);
    let Stmt::Store {
        buffer: dst,
        indices: dst_idx,
        value:
            Expr::Load {
                buffer: src,
                indices: src_idx,
                predicate: None,
                dtype,
            },
        predicate: None,
    } = body
    else {
        return None;
    };
    let (sb, db) = (func.buffers.try_get(*src)?, func.buffers.try_get(*dst)?);
    if dtype.is_vector() || sb.dtype != *dtype || db.dtype != *dtype || sb.space == db.space {
        return None;
    }
    if !target.is_dma_capable(sb.space) || !target.is_dma_capable(db.space) {
        return None;
    }

    let vars: Vec<Var> = loops.iter().map(|l| l.var.clone()).collect();
    for l in &loops {
        if vars.iter().any(|v| l.min.uses_var(v) || l.extent.uses_var(v)) {
            return None;
        }
    }

    let (src_base, src_coeffs) = byte_offset(sb, src_idx, &vars)?;
    let (dst_base, dst_coeffs) = byte_offset(db, dst_idx, &vars)?;
    // Every iteration must write its own element.
    if dst_coeffs.iter().any(|c| c.is_none()) {
        return None;
    }

    // Shift the offsets to the first iteration.
    let mut src_offset = src_base;
    let mut dst_offset = dst_base;
    let mut dims = Vec::with_capacity(loops.len());
    for (k, l) in loops.iter().enumerate() {
        let src_stride = src_coeffs[k].clone().unwrap_or_else(|| Expr::i32(0));
        let dst_stride = dst_coeffs[k].clone().unwrap_or_else(|| Expr::i32(0));
        src_offset = add(src_offset, mul(as_i32(l.min.clone()), src_stride.clone()));
        dst_offset = add(dst_offset, mul(as_i32(l.min.clone()), dst_stride.clone()));
        if l.extent.as_int() == Some(1) {
            continue;
        }
        dims.push(DmaDim {
            length: as_i32(l.extent.clone()),
            src_stride,
            dst_stride,
        });
    }

    Some(CopyPlan {
        src: DmaEndpoint {
            buffer: *src,
            offset: src_offset,
        },
        dst: DmaEndpoint {
            buffer: *dst,
            offset: dst_offset,
        },
        dims: coalesce(dims),
        elem_bytes: u32::from(dtype.scalar.width),
    })
}

/// Byte offset of `buf[indices]` split into a loop-invariant base and one
/// byte coefficient per loop variable (`None` for variables not used).
fn byte_offset(buf: &Buffer, indices: &[Expr], vars: &[Var]) -> Option<(Expr, Vec<Option<Expr>>)> {
    let strides = buf.strides.as_ref()?;
    if strides.len() != indices.len() || indices.len() != buf.rank() {
        return None;
    }
    let mut base = Expr::i32(0);
    let mut coeffs: Vec<Option<Expr>> = vec![None; vars.len()];
    for (idx, stride) in indices.iter().zip(strides) {
        if idx.lanes() != 1 || !idx.dtype().scalar.is_int() {
            return None;
        }
        let (c, rest) = affine(idx, vars)?;
        base = add(base, mul(as_i32(rest), stride.clone()));
        for (k, &ck) in c.iter().enumerate() {
            if ck == 0 {
                continue;
            }
            let term = mul(Expr::i32(ck), stride.clone());
            coeffs[k] = Some(match coeffs[k].take() {
                Some(prev) => add(prev, term),
                None => term,
            });
        }
    }
    Some((base, coeffs))
}

fn as_i32(e: Expr) -> Expr {
    if e.dtype() == DataType::I32 {
        e
    } else {
        Expr::cast(e, DataType::I32)
    }
}

/// Merges an outer dimension into the next inner one when it continues it
/// contiguously on both sides.
fn coalesce(dims: Vec<DmaDim>) -> Vec<DmaDim> {
    let mut out: Vec<DmaDim> = Vec::with_capacity(dims.len());
    for dim in dims.into_iter().rev() {
        if let Some(inner) = out.last_mut()
            && let Some(merged) = merge(&dim, inner)
        {
            *inner = merged;
            continue;
        }
        out.push(dim);
    }
    out.reverse();
    out
}

fn merge(outer: &DmaDim, inner: &DmaDim) -> Option<DmaDim> {
    let (ol, il) = (outer.length.as_int()?, inner.length.as_int()?);
    let (os, is) = (outer.src_stride.as_int()?, inner.src_stride.as_int()?);
    let (od, id) = (outer.dst_stride.as_int()?, inner.dst_stride.as_int()?);
    if os != is.checked_mul(il)? || od != id.checked_mul(il)? {
        return None;
    }
    Some(DmaDim {
        length: Expr::i32(ol.checked_mul(il)?),
        src_stride: inner.src_stride.clone(),
        dst_stride: inner.dst_stride.clone(),
    })
}
