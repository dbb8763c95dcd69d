//! Uniquify-var-name pass: every loop and let binder is renamed to
//! `<base>_<id>`, making names as unique as the ids behind them.

use std::collections::HashMap;

use vira_ir::{Expr, Function, Stmt, StmtPath, Var};

use crate::{LoweringError, Pass, PassContext};

#[derive(Debug)]
pub struct UniquifyVarName;

impl Pass for UniquifyVarName {
    fn name(&self) -> &'static str {
        "uniquify-var-name"
    }

    fn run_on_function(
        &self,
        mut func: Function,
        _cx: &PassContext<'_>,
    ) -> Result<Function, LoweringError> {
        let mut names = HashMap::new();
        func.body.walk::<()>(&mut StmtPath::root(), &mut |stmt, _| {
            match stmt {
                Stmt::For(l) => {
                    names.insert(l.var.id, unique_name(&l.var));
                }
                Stmt::Let { var, .. } => {
                    names.insert(var.id, unique_name(var));
                }
                _ => {}
            }
            Ok(())
        })
        .ok();
        if names.is_empty() {
            return Ok(func);
        }

        let rename = |var: &mut Var| {
            if let Some(name) = names.get(&var.id) {
                var.name.clone_from(name);
            }
        };
        func.body = func.body.transform(&mut |stmt| match stmt {
            Stmt::For(mut l) => {
                rename(&mut l.var);
                Stmt::For(l)
            }
            Stmt::Let {
                mut var,
                value,
                body,
            } => {
                rename(&mut var);
                Stmt::Let { var, value, body }
            }
            other => other,
        });
        func.body = func.body.map_exprs(&mut |e| {
            e.transform(&mut |e| match e {
                Expr::Var(mut v) => {
                    rename(&mut v);
                    Expr::Var(v)
                }
                other => other,
            })
        });
        Ok(func)
    }
}

/// `<base>_<id>`, where an existing `_<id>` suffix is not repeated.
fn unique_name(var: &Var) -> String {
    let suffix = format!("_{}", var.id);
    let base = var.name.strip_suffix(&suffix).unwrap_or(&var.name);
    format!("{base}{suffix}")
}
