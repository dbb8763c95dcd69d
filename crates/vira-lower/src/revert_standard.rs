//! Revert-to-standard pass: strips the annotations the vector passes needed
//! and leaves plain loops the code generator can emit directly.

use vira_ir::{Expr, ForKind, Function, PropertySet, Stmt, StmtPath};

use crate::util::seq;
use crate::{LoweringError, Pass, PassContext};

#[derive(Debug)]
pub struct RevertToStandard;

impl Pass for RevertToStandard {
    fn name(&self) -> &'static str {
        "revert-to-standard"
    }

    fn requires(&self) -> PropertySet {
        PropertySet::LOOPS_PARTITIONED
    }

    fn establishes(&self) -> PropertySet {
        PropertySet::STANDARD_FORM
    }

    fn run_on_function(
        &self,
        mut func: Function,
        cx: &PassContext<'_>,
    ) -> Result<Function, LoweringError> {
        let body = std::mem::replace(&mut func.body, Stmt::empty());
        let body = body.try_transform(&mut StmtPath::root(), &mut |stmt, path| match stmt {
            Stmt::For(l) if l.kind == ForKind::Vectorized => Err(cx.unsupported(
                path,
                format!("loop over `{}` is still vectorized", l.var.name),
            )),
            Stmt::For(mut l) => match l.const_extent() {
                Some(n) if n <= 0 => Ok(Stmt::empty()),
                Some(1) => Ok(Stmt::let_(l.var, l.min, *l.body)),
                _ => {
                    l.likely = false;
                    l.partition = None;
                    Ok(Stmt::For(l))
                }
            },
            Stmt::Store {
                buffer,
                indices,
                value,
                predicate,
            } => Ok(Stmt::Store {
                buffer,
                indices,
                value,
                predicate: predicate.filter(|p| !is_all_true(p)),
            }),
            Stmt::Seq(stmts) => Ok(seq(stmts)),
            other => Ok(other),
        })?;
        func.body = body.map_exprs(&mut |e| e.transform(&mut drop_all_true_masks));
        Ok(func)
    }
}

fn is_all_true(e: &Expr) -> bool {
    matches!(e, Expr::Mask(m) if m.is_all_true())
}

fn drop_all_true_masks(e: Expr) -> Expr {
    match e {
        Expr::Isa(mut inst) => {
            if inst.mask.as_ref().is_some_and(is_all_true) {
                inst.mask = None;
            }
            Expr::Isa(inst)
        }
        Expr::Load {
            buffer,
            indices,
            predicate: Some(p),
            dtype,
        } if is_all_true(&p) => Expr::Load {
            buffer,
            indices,
            predicate: None,
            dtype,
        },
        other => other,
    }
}
