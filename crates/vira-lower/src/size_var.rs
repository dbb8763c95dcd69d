//! Substitute-size-var pass.
//!
//! Ties every symbolic buffer extent to a value the kernel can read at run
//! time. An extent named in [`PipelineConfig::size_bindings`] becomes a fixed
//! extent and its uses become literals. Any other extent must be a scalar
//! parameter; a size variable that only shares a parameter's name is
//! replaced by that parameter.
//!
//! [`PipelineConfig::size_bindings`]: crate::PipelineConfig::size_bindings

use std::collections::HashMap;

use vira_ir::{Dim, Expr, Function, Param, Stmt, StmtPath, Var};

use crate::{LoweringError, Pass, PassContext};

#[derive(Debug)]
pub struct SubstituteSizeVar;

impl Pass for SubstituteSizeVar {
    fn name(&self) -> &'static str {
        "substitute-size-var"
    }

    fn run_on_function(
        &self,
        mut func: Function,
        cx: &PassContext<'_>,
    ) -> Result<Function, LoweringError> {
        let params: HashMap<String, Var> = func
            .params
            .iter()
            .filter_map(|p| match p {
                Param::Scalar(v) => Some((v.name.clone(), v.clone())),
                Param::Buffer(_) => None,
            })
            .collect();

        let mut replace: HashMap<u32, Expr> = HashMap::new();
        for (_, buf) in func.buffers.iter_mut() {
            for dim in &mut buf.shape {
                let Dim::Size(size) = dim else { continue };
                let param = params.get(&size.name);
                if let Some(&value) = cx.config.size_bindings.get(&size.name) {
                    let Ok(extent) = u64::try_from(value) else {
                        return Err(cx.unsupported(
                            &StmtPath::root(),
                            format!("size `{}` is bound to negative value {value}", size.name),
                        ));
                    };
                    let literal = Expr::typed_const(value, size.dtype);
                    log::debug!("`{}`: `{}` fixed to {value}", func.name, size.name);
                    replace.insert(size.id, literal.clone());
                    if let Some(p) = param {
                        replace.insert(p.id, literal);
                    }
                    *dim = Dim::Fixed(extent);
                } else if let Some(p) = param {
                    if p.id != size.id {
                        replace.insert(size.id, Expr::var(p));
                        *dim = Dim::Size(p.clone());
                    }
                } else {
                    return Err(cx.unsupported(
                        &StmtPath::root(),
                        format!(
                            "size `{}` of buffer `{}` is neither a parameter nor bound",
                            size.name, buf.name
                        ),
                    ));
                }
            }
        }
        if replace.is_empty() {
            return Ok(func);
        }

        let mut subst = |e: Expr| {
            e.transform(&mut |e| match e {
                Expr::Var(v) => replace.get(&v.id).cloned().unwrap_or(Expr::Var(v)),
                other => other,
            })
        };
        for (_, buf) in func.buffers.iter_mut() {
            if let Some(strides) = buf.strides.take() {
                buf.strides = Some(strides.into_iter().map(&mut subst).collect());
            }
        }
        let body = std::mem::replace(&mut func.body, Stmt::empty());
        func.body = body.map_exprs(&mut subst);
        Ok(func)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::target;
    use crate::{PassId, PipelineConfig};
    use vira_ir::eval::{Interpreter, Lane};
    use vira_ir::{AddressSpace, Buffer, DataType, Loop, Module};

    /// `for i in 0..n { y[i] = x[i] + 1 }` with `x`, `y` of extent `size`.
    fn kernel(size: Var, n: Var) -> Function {
        let mut func = Function::new("k");
        let [x, y] = ["x", "y"].map(|name| {
            func.add_buffer_param(Buffer::new(
                name,
                DataType::I32,
                vec![Dim::Size(size.clone())],
                AddressSpace::Global,
            ))
        });
        func.params.push(Param::Scalar(n.clone()));
        let i = Var::new("i", DataType::I32);
        let body = Stmt::store(
            y,
            vec![Expr::var(&i)],
            Expr::add(Expr::load(x, vec![Expr::var(&i)], DataType::I32), Expr::i32(1)),
        );
        func.body = Stmt::For(Loop::serial(i, Expr::i32(0), Expr::var(&n), body));
        func
    }

    fn run(func: Function, config: PipelineConfig) -> Result<Function, LoweringError> {
        let config = PipelineConfig {
            passes: Some(vec![PassId::SubstituteSizeVar]),
            ..config
        };
        let mut module = Module::new();
        module.add_function(func);
        let mut out = crate::run_with_config(module, &target("v2"), &config)?;
        Ok(out.functions.shift_remove("k").unwrap())
    }

    #[test]
    fn matching_parameter_is_left_alone() {
        let n = Var::new("n", DataType::I32);
        let func = kernel(n.clone(), n);
        assert_eq!(run(func.clone(), PipelineConfig::default()).unwrap(), func);
    }

    #[test]
    fn size_is_unified_with_parameter_of_same_name() {
        let n = Var::new("n", DataType::I32);
        let size = Var::new("n", DataType::I32);
        let out = run(kernel(size, n.clone()), PipelineConfig::default()).unwrap();
        for (_, buf) in out.buffers.iter() {
            assert_eq!(buf.shape, vec![Dim::Size(n.clone())]);
        }

        let mut interp = Interpreter::new(&out);
        interp.set_scalar("n", Lane::Int(3));
        interp.set_buffer("x", vec![Lane::Int(4), Lane::Int(5), Lane::Int(6)]);
        interp.run().unwrap();
        assert_eq!(interp.buffer("y").unwrap(), [Lane::Int(5), Lane::Int(6), Lane::Int(7)]);
    }

    #[test]
    fn bound_size_becomes_fixed() {
        let n = Var::new("n", DataType::I32);
        let config = PipelineConfig {
            size_bindings: [("n".to_string(), 16)].into_iter().collect(),
            ..PipelineConfig::default()
        };
        let out = run(kernel(n.clone(), n.clone()), config).unwrap();
        for (_, buf) in out.buffers.iter() {
            assert_eq!(buf.shape, vec![Dim::Fixed(16)]);
        }
        let Stmt::For(l) = &out.body else { panic!("expected loop") };
        assert_eq!(l.extent, Expr::i32(16));
        assert!(!out.body.uses_var(&n));
    }

    #[test]
    fn unknown_size_is_rejected() {
        let m = Var::new("m", DataType::I32);
        let n = Var::new("n", DataType::I32);
        let err = run(kernel(m, n), PipelineConfig::default()).unwrap_err();
        assert!(err.to_string().contains("neither a parameter nor bound"), "{err}");
    }

    #[test]
    fn negative_binding_is_rejected() {
        let n = Var::new("n", DataType::I32);
        let config = PipelineConfig {
            size_bindings: [("n".to_string(), -2)].into_iter().collect(),
            ..PipelineConfig::default()
        };
        let err = run(kernel(n.clone(), n), config).unwrap_err();
        assert!(matches!(err, LoweringError::UnsupportedConstruct { .. }), "{err}");
    }
}
