//! Lower-vector-cast pass.
//!
//! Vector casts become chains of `widen`/`narrow`/`convert` intrinsics that
//! change the lane width one step at a time, plus a reinterpret where only
//! the signedness changes. Casts to bool compare against zero; casts from
//! bool select between one and zero.

use vira_ir::{
    BinaryOp, DataType, Expr, Function, Intrinsic, PropertySet, Scalar, ScalarKind, StmtPath,
};

use crate::{LoweringError, Pass, PassContext};

#[derive(Debug)]
pub struct LowerVectorCast;

impl Pass for LowerVectorCast {
    fn name(&self) -> &'static str {
        "lower-vector-cast"
    }

    fn establishes(&self) -> PropertySet {
        PropertySet::VECTOR_CASTS_LOWERED
    }

    fn run_on_function(
        &self,
        mut func: Function,
        cx: &PassContext<'_>,
    ) -> Result<Function, LoweringError> {
        let body = std::mem::replace(&mut func.body, vira_ir::Stmt::empty());
        func.body = body.try_map_exprs(&mut StmtPath::root(), &mut |e, path| {
            e.try_transform(&mut |e| match e {
                Expr::Cast { value, dtype } if dtype.is_vector() => {
                    lower_cast(*value, dtype).map_err(|m| cx.unsupported(path, m))
                }
                Expr::Reinterpret { value, dtype }
                    if dtype.is_vector() && value.dtype().scalar.width != dtype.scalar.width =>
                {
                    Err(cx.unsupported(
                        path,
                        format!("reinterpret of `{}` as `{dtype}` changes lane width", value.dtype()),
                    ))
                }
                other => Ok(other),
            })
        })?;
        Ok(func)
    }
}

fn call(intrinsic: Intrinsic, value: Expr, scalar: Scalar) -> Expr {
    let lanes = value.lanes();
    Expr::call(intrinsic, vec![value], DataType::vector(scalar, lanes))
}

/// Steps `value` to `width` bytes without changing its kind.
fn resize(mut value: Expr, width: u8) -> Expr {
    loop {
        let from = value.dtype().scalar;
        if from.width == width {
            return value;
        }
        value = if from.width < width {
            call(Intrinsic::Widen, value, from.with_width(from.width * 2))
        } else {
            call(Intrinsic::Narrow, value, from.with_width(from.width / 2))
        };
    }
}

fn lower_cast(value: Expr, dtype: DataType) -> Result<Expr, String> {
    let from = value.dtype().scalar;
    let to = dtype.scalar;
    let lanes = dtype.lanes;
    if from == to {
        return Ok(value);
    }
    let steppable = |w: u8| w.is_power_of_two() && (1..=8).contains(&w);
    if !(from.is_bool() || steppable(from.width)) || !(to.is_bool() || steppable(to.width)) {
        return Err(format!("cast from `{from}` to `{to}`"));
    }

    Ok(match (from.kind, to.kind) {
        (_, ScalarKind::Bool) => {
            let zero = Expr::typed_const(0, value.dtype());
            Expr::binary(BinaryOp::Ne, value, zero)
        }
        (ScalarKind::Bool, _) => Expr::Select {
            condition: Box::new(value),
            accept: Box::new(Expr::typed_const(1, dtype)),
            reject: Box::new(Expr::typed_const(0, dtype)),
        },
        (ScalarKind::Sint | ScalarKind::Uint, ScalarKind::Sint | ScalarKind::Uint) => {
            let resized = resize(value, to.width);
            if resized.dtype().scalar == to {
                resized
            } else {
                Expr::Reinterpret {
                    value: Box::new(resized),
                    dtype,
                }
            }
        }
        (ScalarKind::Sint | ScalarKind::Uint, ScalarKind::Float) => {
            if from.width <= to.width {
                call(Intrinsic::Convert, resize(value, to.width), to)
            } else {
                // Exact for every integer a narrower float can hold.
                let wide = call(Intrinsic::Convert, value, to.with_width(from.width));
                resize(wide, to.width)
            }
        }
        (ScalarKind::Float, ScalarKind::Sint | ScalarKind::Uint) => {
            if from.width <= to.width {
                let wide = resize(value, to.width);
                call(Intrinsic::Convert, wide, to)
            } else {
                let int = call(Intrinsic::Convert, value, to.with_width(from.width));
                resize(int, to.width)
            }
        }
        (ScalarKind::Float, ScalarKind::Float) => resize(value, to.width),
        _ => return Err(format!("cast from `{from}` to `{to}` over {lanes} lanes")),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::run_pass;
    use vira_ir::eval::{Interpreter, Lane};
    use vira_ir::{AddressSpace, Buffer, Stmt};

    /// `b[0:4] = cast<to>(a[0:4])`.
    fn cast_kernel(from: Scalar, to: Scalar) -> Function {
        let mut func = Function::new("k");
        let a = func.add_buffer_param(Buffer::fixed("a", DataType::scalar(from), &[4], AddressSpace::Local));
        let b = func.add_buffer_param(Buffer::fixed("b", DataType::scalar(to), &[4], AddressSpace::Local));
        let r = Expr::ramp(Expr::i32(0), Expr::i32(1), 4);
        let load = Expr::load(a, vec![r.clone()], DataType::vector(from, 4));
        func.body = Stmt::store(b, vec![r], Expr::cast(load, DataType::vector(to, 4)));
        func
    }

    fn check(from: Scalar, to: Scalar, input: Vec<Lane>) {
        let func = cast_kernel(from, to);
        let out = run_pass(&LowerVectorCast, func.clone()).unwrap();
        let mut casts = 0;
        out.body.visit_exprs(&mut |e| {
            e.visit(&mut |e| casts += usize::from(matches!(e, Expr::Cast { .. })))
        });
        assert_eq!(casts, 0, "{from} -> {to} left a cast");

        let run = |f: &Function| {
            let mut interp = Interpreter::new(f);
            interp.set_buffer("a", input.clone());
            interp.run().unwrap();
            interp.buffer("b").unwrap().to_vec()
        };
        assert_eq!(run(&func), run(&out), "{from} -> {to}");
    }

    fn ints(values: [i64; 4]) -> Vec<Lane> {
        values.map(Lane::Int).to_vec()
    }

    fn floats(values: [f64; 4]) -> Vec<Lane> {
        values.map(Lane::Float).to_vec()
    }

    #[test]
    fn integer_widths_and_signedness() {
        check(Scalar::I8, Scalar::U32, ints([-5, 0, 127, -128]));
        check(Scalar::U8, Scalar::I32, ints([250, 0, 1, 128]));
        check(Scalar::I32, Scalar::U8, ints([300, -1, 255, 70000]));
        check(Scalar::U16, Scalar::I16, ints([65535, 1, 32768, 0]));
    }

    #[test]
    fn int_float_conversions() {
        check(Scalar::U16, Scalar::F32, ints([65535, 1, 32768, 0]));
        check(Scalar::I32, Scalar::F16, ints([-7, 2048, 1, 100]));
        check(Scalar::F32, Scalar::I8, floats([-3.7, 126.9, 200.0, 0.5]));
        check(Scalar::F16, Scalar::I32, floats([-2.5, 1024.0, 3.0, 0.0]));
    }

    #[test]
    fn float_widths_and_bools() {
        check(Scalar::F16, Scalar::F32, floats([1.5, -0.25, 3.0, 0.0]));
        check(Scalar::F32, Scalar::BOOL, floats([0.0, -1.0, 0.5, 0.0]));
        check(Scalar::I16, Scalar::BOOL, ints([0, 3, -1, 0]));
    }

    #[test]
    fn widening_takes_one_step_at_a_time() {
        let r = Expr::ramp(Expr::i32(0), Expr::i32(1), 4);
        let v = Expr::cast(r, DataType::vector(Scalar::I8, 4));
        let lowered = lower_cast(v, DataType::vector(Scalar::I32, 4)).unwrap();
        let Expr::Call { intrinsic, args, dtype } = &lowered else {
            panic!("expected widen");
        };
        assert_eq!(*intrinsic, Intrinsic::Widen);
        assert_eq!(dtype.scalar, Scalar::I32);
        assert_eq!(args[0].dtype().scalar, Scalar::I16);
    }

    #[test]
    fn lane_width_changing_reinterpret_is_unsupported() {
        let mut func = cast_kernel(Scalar::I32, Scalar::I32);
        func.body = func.body.map_exprs(&mut |e| match e {
            Expr::Cast { value, .. } => Expr::Reinterpret {
                value,
                dtype: DataType::vector(Scalar::I16, 4),
            },
            other => other,
        });
        assert!(run_pass(&LowerVectorCast, func).is_err());
    }
}
