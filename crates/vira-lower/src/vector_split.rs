//! Align-vector-width-by-split pass.
//!
//! A statement whose vectors hold more lanes than one native register is
//! rewritten into `ceil(lanes / native)` statements over consecutive lane
//! slices. Vector lets are split into one variable per slice. The last slice
//! may be short; the pad pass widens it afterwards.

use std::collections::HashMap;

use vira_ir::{Expr, Function, Mask, PropertySet, Stmt, StmtPath, Var};
use vira_target::TargetDescriptor;

use crate::util::{add, mul, native_lanes, sub, vector_data_bits, vector_lanes};
use crate::{LoweringError, Pass, PassContext};

#[derive(Debug)]
pub struct AlignVectorWidthBySplit;

impl Pass for AlignVectorWidthBySplit {
    fn name(&self) -> &'static str {
        "align-vector-width-by-split"
    }

    fn requires(&self) -> PropertySet {
        PropertySet::PREDICATES_LOWERED
    }

    fn establishes(&self) -> PropertySet {
        PropertySet::VECTORS_WITHIN_NATIVE_WIDTH
    }

    fn run_on_function(
        &self,
        mut func: Function,
        cx: &PassContext<'_>,
    ) -> Result<Function, LoweringError> {
        let body = std::mem::replace(&mut func.body, Stmt::empty());
        let mut splitter = Splitter {
            func: &func,
            target: cx.target,
            cx,
            vars: HashMap::new(),
        };
        let body = splitter.split(body, &mut StmtPath::root())?;
        func.body = body;
        Ok(func)
    }
}

/// One lane slice `[start, start + len)`.
#[derive(Clone, Copy, Debug)]
struct Piece {
    start: u16,
    len: u16,
}

fn pieces(lanes: u16, native: u16) -> Vec<Piece> {
    (0..lanes)
        .step_by(usize::from(native))
        .map(|start| Piece {
            start,
            len: native.min(lanes - start),
        })
        .collect()
}

struct Splitter<'a> {
    func: &'a Function,
    target: &'a TargetDescriptor,
    cx: &'a PassContext<'a>,
    /// Split vector lets: variable id to slice width and per-slice variables.
    vars: HashMap<u32, (u16, Vec<Var>)>,
}

impl Splitter<'_> {
    /// Native lanes for the data in `stmt`, or `None` when it fits already.
    fn native_for(&self, stmt: &Stmt) -> Option<(u16, u16)> {
        let bits = vector_data_bits(stmt, self.func);
        let lanes = vector_lanes(stmt);
        let native = native_lanes(self.target, bits);
        (bits > 0 && lanes > native).then_some((lanes, native))
    }

    fn split(&mut self, stmt: Stmt, path: &mut StmtPath) -> Result<Stmt, LoweringError> {
        let wide = self.native_for(&stmt);
        match (stmt, wide) {
            (Stmt::Seq(stmts), _) => {
                let mut out = Vec::with_capacity(stmts.len());
                for (i, s) in stmts.into_iter().enumerate() {
                    path.push(i as u32);
                    let res = self.split(s, path);
                    path.pop();
                    out.push(res?);
                }
                Ok(Stmt::Seq(out))
            }
            (Stmt::For(mut l), _) => {
                path.push(0);
                let body = self.split(*l.body, path);
                path.pop();
                l.body = Box::new(body?);
                Ok(Stmt::For(l))
            }
            (
                Stmt::If {
                    condition,
                    then_case,
                    else_case,
                },
                _,
            ) => {
                path.push(0);
                let then_case = self.split(*then_case, path);
                path.pop();
                let then_case = Box::new(then_case?);
                let else_case = match else_case {
                    Some(e) => {
                        path.push(1);
                        let res = self.split(*e, path);
                        path.pop();
                        Some(Box::new(res?))
                    }
                    None => None,
                };
                Ok(Stmt::If {
                    condition,
                    then_case,
                    else_case,
                })
            }
            (Stmt::Let { var, value, body }, wide) => {
                let mut bindings = Vec::new();
                if let Some((lanes, native)) = wide {
                    let mut slices = Vec::new();
                    for (k, piece) in pieces(lanes, native).into_iter().enumerate() {
                        let part = self
                            .slice(&value, piece, lanes)
                            .map_err(|m| self.cx.unsupported(path, m))?;
                        let v = var.derive(&format!("_{k}"), var.dtype.with_lanes(piece.len));
                        slices.push(v.clone());
                        bindings.push((v, part));
                    }
                    log::trace!(
                        "`{}`: vector let `{}` split into {} slices",
                        self.func.name,
                        var.name,
                        slices.len()
                    );
                    self.vars.insert(var.id, (native, slices));
                }
                path.push(0);
                let body = self.split(*body, path);
                path.pop();
                let body = body?;
                if bindings.is_empty() {
                    return Ok(Stmt::let_(var, value, body));
                }
                Ok(bindings
                    .into_iter()
                    .rev()
                    .fold(body, |out, (v, part)| Stmt::let_(v, part, out)))
            }
            (
                Stmt::Store {
                    buffer,
                    indices,
                    value,
                    predicate,
                },
                Some((lanes, native)),
            ) => {
                let mut parts = Vec::new();
                for piece in pieces(lanes, native) {
                    let sl = |e: &Expr| {
                        self.slice(e, piece, lanes)
                            .map_err(|m| self.cx.unsupported(path, m))
                    };
                    parts.push(Stmt::Store {
                        buffer,
                        indices: indices.iter().map(sl).collect::<Result<_, _>>()?,
                        value: sl(&value)?,
                        predicate: predicate.as_ref().map(sl).transpose()?,
                    });
                }
                Ok(Stmt::Seq(parts))
            }
            (Stmt::Evaluate(e), Some((lanes, native))) => {
                let parts = pieces(lanes, native)
                    .into_iter()
                    .map(|piece| {
                        self.slice(&e, piece, lanes)
                            .map(Stmt::Evaluate)
                            .map_err(|m| self.cx.unsupported(path, m))
                    })
                    .collect::<Result<_, _>>()?;
                Ok(Stmt::Seq(parts))
            }
            (other, _) => Ok(other),
        }
    }

    /// Lanes `piece` of `e`, a `total`-lane vector. Scalars pass through.
    fn slice(&self, e: &Expr, piece: Piece, total: u16) -> Result<Expr, String> {
        if e.lanes() == 1 {
            return Ok(e.clone());
        }
        if e.lanes() != total {
            return Err(format!(
                "`{}` mixes {}-lane and {total}-lane vectors",
                e.dtype(),
                e.lanes()
            ));
        }
        let Piece { start, len } = piece;
        Ok(match e {
            Expr::Ramp { base, stride, .. } => {
                let offset = mul((**stride).clone(), Expr::typed_const(i64::from(start), stride.dtype()));
                Expr::ramp(add((**base).clone(), offset), (**stride).clone(), len)
            }
            Expr::Broadcast { value, .. } => Expr::broadcast((**value).clone(), len),
            Expr::Mask(Mask::Const(bits)) => {
                let range = usize::from(start)..usize::from(start + len);
                Expr::Mask(Mask::Const(bits[range].to_vec()))
            }
            Expr::Mask(Mask::Tail { active, .. }) => Expr::Mask(Mask::Tail {
                active: Box::new(sub(
                    (**active).clone(),
                    Expr::typed_const(i64::from(start), active.dtype()),
                )),
                lanes: len,
            }),
            Expr::Var(v) => {
                let Some((width, slices)) = self.vars.get(&v.id) else {
                    return Err(format!("vector variable `{}` is wider than a native register", v.name));
                };
                if start % width != 0 {
                    return Err(format!(
                        "`{}` was split into {width}-lane slices but is used at lane {start}",
                        v.name
                    ));
                }
                match slices.get(usize::from(start / width)) {
                    Some(s) if s.dtype.lanes == len => Expr::var(s),
                    _ => {
                        return Err(format!(
                            "`{}` was split into {width}-lane slices but is used with {len} lanes",
                            v.name
                        ));
                    }
                }
            }
            Expr::Address { .. } | Expr::Isa(_) => {
                return Err("virtual-ISA node before width legalization".into());
            }
            _ => {
                let mut out = e.clone();
                for child in out.children_mut() {
                    *child = self.slice(child, piece, total)?;
                }
                match &mut out {
                    Expr::Load { dtype, .. }
                    | Expr::Cast { dtype, .. }
                    | Expr::Reinterpret { dtype, .. }
                    | Expr::Call { dtype, .. } => *dtype = dtype.with_lanes(len),
                    _ => {}
                }
                out
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::run_pass;
    use vira_ir::eval::{Interpreter, Lane};
    use vira_ir::{AddressSpace, Buffer, DataType, Scalar};

    fn ramp(base: i64, lanes: u16) -> Expr {
        Expr::ramp(Expr::i32(base), Expr::i32(1), lanes)
    }

    /// `c[0:16] = a[0:16] + b[0:16]` as one 16-lane f32 statement.
    fn wide_add(predicate: Option<Expr>) -> Function {
        let mut func = Function::new("k");
        let a = func.add_buffer_param(Buffer::fixed("a", DataType::F32, &[16], AddressSpace::Local));
        let b = func.add_buffer_param(Buffer::fixed("b", DataType::F32, &[16], AddressSpace::Local));
        let c = func.add_buffer_param(Buffer::fixed("c", DataType::F32, &[16], AddressSpace::Local));
        let ty = DataType::vector(Scalar::F32, 16);
        func.body = Stmt::Store {
            buffer: c,
            indices: vec![ramp(0, 16)],
            value: Expr::add(Expr::load(a, vec![ramp(0, 16)], ty), Expr::load(b, vec![ramp(0, 16)], ty)),
            predicate,
        };
        func
    }

    fn run(func: &Function) -> Vec<Lane> {
        let mut interp = Interpreter::new(func);
        interp.set_buffer("a", (0..16).map(|i| Lane::Float(f64::from(i))).collect());
        interp.set_buffer("b", (0..16).map(|i| Lane::Float(f64::from(100 * i))).collect());
        interp.set_buffer("c", vec![Lane::Float(-1.0); 16]);
        interp.run().unwrap();
        interp.buffer("c").unwrap().to_vec()
    }

    #[test]
    fn sixteen_f32_lanes_become_two_halves() {
        let func = wide_add(None);
        let out = run_pass(&AlignVectorWidthBySplit, func.clone()).unwrap();
        let Stmt::Seq(parts) = &out.body else { panic!("expected two stores") };
        assert_eq!(parts.len(), 2);
        let Stmt::Store { indices, value, .. } = &parts[1] else { panic!("expected store") };
        assert_eq!(indices[0], Expr::ramp(Expr::i32(8), Expr::i32(1), 8));
        assert_eq!(value.lanes(), 8);
        assert_eq!(run(&func), run(&out));
    }

    #[test]
    fn tail_mask_is_sliced() {
        let mask = Expr::Mask(Mask::Tail {
            active: Box::new(Expr::i32(11)),
            lanes: 16,
        });
        let func = wide_add(Some(mask));
        let out = run_pass(&AlignVectorWidthBySplit, func.clone()).unwrap();
        let Stmt::Seq(parts) = &out.body else { panic!("expected two stores") };
        let Stmt::Store { predicate: Some(p), .. } = &parts[1] else { panic!("expected predicate") };
        assert_eq!(
            p,
            &Expr::Mask(Mask::Tail {
                active: Box::new(Expr::i32(3)),
                lanes: 8
            })
        );
        let result = run(&out);
        assert_eq!(run(&func), result);
        assert_eq!(result[11], Lane::Float(-1.0));
    }

    #[test]
    fn ragged_width_leaves_a_short_slice() {
        let mut func = Function::new("k");
        let a = func.add_buffer_param(Buffer::fixed("a", DataType::F32, &[12], AddressSpace::Local));
        func.body = Stmt::store(a, vec![ramp(0, 12)], Expr::broadcast(Expr::f32(2.0), 12));
        let out = run_pass(&AlignVectorWidthBySplit, func).unwrap();
        let Stmt::Seq(parts) = &out.body else { panic!("expected stores") };
        let lanes: Vec<u16> = parts
            .iter()
            .map(|s| match s {
                Stmt::Store { value, .. } => value.lanes(),
                _ => 0,
            })
            .collect();
        assert_eq!(lanes, vec![8, 4]);
    }

    #[test]
    fn vector_let_splits_into_slices() {
        let mut func = Function::new("k");
        let a = func.add_buffer_param(Buffer::fixed("a", DataType::F32, &[16], AddressSpace::Local));
        let ty = DataType::vector(Scalar::F32, 16);
        let v = Var::new("v", ty);
        func.body = Stmt::let_(
            v.clone(),
            Expr::mul(Expr::load(a, vec![ramp(0, 16)], ty), Expr::broadcast(Expr::f32(2.0), 16)),
            Stmt::store(a, vec![ramp(0, 16)], Expr::var(&v)),
        );
        let out = run_pass(&AlignVectorWidthBySplit, func.clone()).unwrap();
        let Stmt::Let { var: v0, body, .. } = &out.body else { panic!("expected let") };
        assert_eq!(v0.dtype.lanes, 8);
        assert!(matches!(&**body, Stmt::Let { .. }));

        let run = |f: &Function| {
            let mut interp = Interpreter::new(f);
            interp.set_buffer("a", (0..16).map(|i| Lane::Float(f64::from(i))).collect());
            interp.run().unwrap();
            interp.buffer("a").unwrap().to_vec()
        };
        assert_eq!(run(&func), run(&out));
    }

    #[test]
    fn native_width_is_untouched() {
        let mut func = Function::new("k");
        let a = func.add_buffer_param(Buffer::fixed("a", DataType::scalar(Scalar::I16), &[16], AddressSpace::Local));
        func.body = Stmt::store(a, vec![ramp(0, 16)], Expr::broadcast(Expr::int(3, Scalar::I16), 16));
        let out = run_pass(&AlignVectorWidthBySplit, func.clone()).unwrap();
        assert_eq!(out, func);
    }
}
