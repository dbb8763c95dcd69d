//! Align-vector-width-by-pad pass.
//!
//! Statements narrower than a native register are widened with inert lanes.
//! Loads and stores get a mask that disables the padding, so padded lanes
//! are never read from or written to memory.

use vira_ir::{BinaryOp, Expr, Function, Mask, PropertySet, Stmt, StmtPath};

use crate::util::{native_lanes, vector_data_bits, vector_lanes};
use crate::{LoweringError, Pass, PassContext};

#[derive(Debug)]
pub struct AlignVectorWidthByPad;

impl Pass for AlignVectorWidthByPad {
    fn name(&self) -> &'static str {
        "align-vector-width-by-pad"
    }

    fn requires(&self) -> PropertySet {
        PropertySet::VECTORS_WITHIN_NATIVE_WIDTH
    }

    fn establishes(&self) -> PropertySet {
        PropertySet::VECTORS_NATIVE_WIDTH
    }

    fn run_on_function(
        &self,
        mut func: Function,
        cx: &PassContext<'_>,
    ) -> Result<Function, LoweringError> {
        let body = std::mem::replace(&mut func.body, Stmt::empty());
        let body = body.try_transform(&mut StmtPath::root(), &mut |stmt, path| {
            let bits = vector_data_bits(&stmt, &func);
            let lanes = vector_lanes(&stmt);
            let native = native_lanes(cx.target, bits);
            if bits == 0 || lanes == 1 || lanes >= native {
                return Ok(stmt);
            }
            log::trace!("`{}`: padding {lanes} lanes to {native} at {path}", func.name);
            let pad = Padder { lanes, native };
            pad.stmt(stmt).map_err(|m| cx.unsupported(path, m))
        })?;
        func.body = body;
        Ok(func)
    }
}

struct Padder {
    lanes: u16,
    native: u16,
}

impl Padder {
    fn stmt(&self, stmt: Stmt) -> Result<Stmt, String> {
        Ok(match stmt {
            Stmt::Store {
                buffer,
                indices,
                value,
                predicate,
            } => Stmt::Store {
                buffer,
                indices: indices.iter().map(|i| self.expr(i)).collect::<Result<_, _>>()?,
                value: self.expr(&value)?,
                predicate: Some(self.guard(predicate.as_ref())?),
            },
            Stmt::Let { var, value, body } => {
                let value = self.expr(&value)?;
                let mut var = var;
                var.dtype = value.dtype();
                Stmt::Let {
                    var,
                    value,
                    body,
                }
            }
            Stmt::Evaluate(e) => Stmt::Evaluate(self.expr(&e)?),
            other => other,
        })
    }

    /// Padded form of a memory-access predicate, with the padding disabled.
    fn guard(&self, predicate: Option<&Expr>) -> Result<Expr, String> {
        let prefix = Expr::Mask(Mask::prefix(self.lanes, self.native));
        let Some(p) = predicate else {
            return Ok(prefix);
        };
        let padded = self.expr(p)?;
        Ok(match padded {
            Expr::Mask(_) => padded,
            other => Expr::and(other, prefix),
        })
    }

    fn expr(&self, e: &Expr) -> Result<Expr, String> {
        if e.lanes() == 1 {
            return Ok(e.clone());
        }
        if e.lanes() != self.lanes {
            return Err(format!(
                "`{}` mixes {}-lane and {}-lane vectors",
                e.dtype(),
                e.lanes(),
                self.lanes
            ));
        }
        let native = self.native;
        Ok(match e {
            Expr::Ramp { base, stride, .. } => Expr::ramp((**base).clone(), (**stride).clone(), native),
            Expr::Broadcast { value, .. } => Expr::broadcast((**value).clone(), native),
            Expr::Mask(Mask::Const(bits)) => {
                let mut bits = bits.clone();
                bits.resize(usize::from(native), false);
                Expr::Mask(Mask::Const(bits))
            }
            Expr::Mask(Mask::Tail { active, .. }) => {
                let bound = Expr::typed_const(i64::from(self.lanes), active.dtype());
                let active = match active.as_int() {
                    Some(n) => Expr::typed_const(n.min(i64::from(self.lanes)), active.dtype()),
                    None => Expr::binary(BinaryOp::Min, (**active).clone(), bound),
                };
                Expr::Mask(Mask::Tail {
                    active: Box::new(active),
                    lanes: native,
                })
            }
            Expr::Var(v) => {
                let mut v = v.clone();
                v.dtype = v.dtype.with_lanes(native);
                Expr::Var(v)
            }
            Expr::Load {
                buffer,
                indices,
                predicate,
                dtype,
            } => Expr::Load {
                buffer: *buffer,
                indices: indices.iter().map(|i| self.expr(i)).collect::<Result<_, _>>()?,
                predicate: Some(Box::new(self.guard(predicate.as_deref())?)),
                dtype: dtype.with_lanes(native),
            },
            Expr::Address { .. } | Expr::Isa(_) => {
                return Err("virtual-ISA node before width legalization".into());
            }
            _ => {
                let mut out = e.clone();
                for child in out.children_mut() {
                    *child = self.expr(child)?;
                }
                match &mut out {
                    Expr::Cast { dtype, .. }
                    | Expr::Reinterpret { dtype, .. }
                    | Expr::Call { dtype, .. } => *dtype = dtype.with_lanes(native),
                    _ => {}
                }
                out
            }
        })
    }
}
