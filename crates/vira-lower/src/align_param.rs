//! Align-param-with-buffer pass.
//!
//! Zero-dimension buffer parameters that the kernel only reads are really
//! scalars passed by pointer; they become scalar parameters. Uses of scalar
//! parameters whose type drifted from the declaration are re-aligned, and
//! buffer accesses are checked against the declared rank.

use std::collections::HashMap;

use vira_ir::{Buffer, Expr, Function, Handle, Param, Stmt, StmtPath, Var};

use crate::util::broadcast_to;
use crate::{LoweringError, Pass, PassContext};

#[derive(Debug)]
pub struct AlignParamWithBuffer;

impl Pass for AlignParamWithBuffer {
    fn name(&self) -> &'static str {
        "align-param-with-buffer"
    }

    fn run_on_function(
        &self,
        mut func: Function,
        cx: &PassContext<'_>,
    ) -> Result<Function, LoweringError> {
        check_ranks(&func, cx)?;

        let written = func.body.buffer_effects().writes;
        let mut scalars: HashMap<Handle<Buffer>, Var> = HashMap::new();
        for param in &mut func.params {
            let Param::Buffer(h) = *param else { continue };
            let Some(buf) = func.buffers.try_get(h) else { continue };
            if buf.rank() == 0 && !written.contains(&h) {
                let var = Var::new(buf.name.clone(), buf.dtype.with_lanes(1));
                log::debug!("`{}`: buffer parameter `{}` becomes a scalar", func.name, buf.name);
                *param = Param::Scalar(var.clone());
                scalars.insert(h, var);
            }
        }

        let declared: HashMap<u32, Var> = func
            .params
            .iter()
            .filter_map(|p| match p {
                Param::Scalar(v) => Some((v.id, v.clone())),
                Param::Buffer(_) => None,
            })
            .collect();

        func.body = func.body.map_exprs(&mut |e| {
            e.transform(&mut |e| match e {
                Expr::Load { buffer, dtype, .. } if scalars.contains_key(&buffer) => {
                    let var = &scalars[&buffer];
                    broadcast_to(convert(Expr::var(var), dtype.scalar), dtype.lanes)
                }
                Expr::Var(v) => match declared.get(&v.id) {
                    Some(decl) if decl.dtype != v.dtype => {
                        let e = convert(Expr::var(decl), v.dtype.scalar);
                        broadcast_to(e, v.dtype.lanes)
                    }
                    _ => Expr::Var(v),
                },
                other => other,
            })
        });
        Ok(func)
    }
}

/// `e` converted to `scalar` when its type differs.
fn convert(e: Expr, scalar: vira_ir::Scalar) -> Expr {
    let ty = e.dtype();
    if ty.scalar == scalar {
        e
    } else {
        Expr::cast(e, ty.with_scalar(scalar))
    }
}

fn check_ranks(func: &Function, cx: &PassContext<'_>) -> Result<(), LoweringError> {
    func.body.walk(&mut StmtPath::root(), &mut |stmt, path| {
        let mut accesses: Vec<(Handle<Buffer>, usize)> = Vec::new();
        if let Stmt::Store {
            buffer, indices, ..
        } = stmt
        {
            accesses.push((*buffer, indices.len()));
        }
        for e in stmt.exprs() {
            e.visit(&mut |e| {
                if let Expr::Load {
                    buffer, indices, ..
                } = e
                {
                    accesses.push((*buffer, indices.len()));
                }
            });
        }
        for (h, found) in accesses {
            let Some(buf) = func.buffers.try_get(h) else { continue };
            if buf.rank() != found {
                return Err(cx.unsupported(
                    path,
                    format!(
                        "buffer `{}` has {} dimension(s) but is accessed with {found} index(es)",
                        buf.name,
                        buf.rank()
                    ),
                ));
            }
        }
        Ok(())
    })
}
