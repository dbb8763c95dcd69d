//! Eliminate-get-local-id pass: every `get_local_id()` call is replaced by
//! one variable bound at function entry.

use vira_ir::{DataType, Expr, Function, Intrinsic, Stmt, Var};

use crate::{LoweringError, Pass, PassContext};

#[derive(Debug)]
pub struct EliminateGetLocalId;

impl Pass for EliminateGetLocalId {
    fn name(&self) -> &'static str {
        "eliminate-get-local-id"
    }

    fn run_on_function(
        &self,
        mut func: Function,
        _cx: &PassContext<'_>,
    ) -> Result<Function, LoweringError> {
        let body = std::mem::replace(&mut func.body, Stmt::empty());
        // Reuse an entry binding left by an earlier run.
        let (var, inner) = match body {
            Stmt::Let { var, value, body } if is_local_id(&value) => (Some(var), *body),
            other => (None, other),
        };

        let mut first_dtype = None;
        inner.visit_exprs(&mut |e| {
            e.visit(&mut |e| {
                if first_dtype.is_none() && is_local_id(e) {
                    first_dtype = Some(e.dtype());
                }
            })
        });

        let var = match (var, first_dtype) {
            (Some(var), _) => var,
            (None, Some(dtype)) => Var::new("local_id", dtype),
            (None, None) => {
                func.body = inner;
                return Ok(func);
            }
        };

        let inner = inner.map_exprs(&mut |e| {
            e.transform(&mut |e| match e {
                Expr::Call {
                    intrinsic: Intrinsic::GetLocalId,
                    dtype,
                    ..
                } => use_of(&var, dtype),
                other => other,
            })
        });
        let value = Expr::call(Intrinsic::GetLocalId, Vec::new(), var.dtype);
        func.body = Stmt::let_(var, value, inner);
        Ok(func)
    }
}

fn is_local_id(e: &Expr) -> bool {
    matches!(
        e,
        Expr::Call {
            intrinsic: Intrinsic::GetLocalId,
            ..
        }
    )
}

/// The bound variable, converted when a call site asked for another type.
fn use_of(var: &Var, dtype: DataType) -> Expr {
    if var.dtype == dtype {
        Expr::var(var)
    } else {
        Expr::cast(Expr::var(var), dtype)
    }
}
