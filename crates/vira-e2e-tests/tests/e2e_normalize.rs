mod common;

use common::*;
use proptest::prelude::*;
use vira_ir::eval::{Interpreter, Lane};
use vira_ir::{
    AddressSpace, BinaryOp, Buffer, DataType, Expr, Function, Intrinsic, Param, Stmt, Var,
};
use vira_lower::PassId;

const OPS: [BinaryOp; 7] = [
    BinaryOp::Add,
    BinaryOp::Sub,
    BinaryOp::Mul,
    BinaryOp::Min,
    BinaryOp::Max,
    BinaryOp::BitAnd,
    BinaryOp::BitXor,
];

/// Applied with a positive constant divisor.
const DIV_OPS: [BinaryOp; 4] = [
    BinaryOp::Div,
    BinaryOp::Mod,
    BinaryOp::FloorDiv,
    BinaryOp::FloorMod,
];

const NORMALIZATION: [PassId; 7] = [
    PassId::ExchangeConstantToRight,
    PassId::CanonicalizeRamp,
    PassId::CanonicalizeDivMod,
    PassId::EliminateGetLocalId,
    PassId::FoldConstant,
    PassId::Simplify,
    PassId::UniquifyVarName,
];

/// `out[0] = e(x, y)` for random integer expressions `e`, which may read
/// the core index.
fn kernels() -> impl Strategy<Value = Function> {
    let x = Var::new("x", DataType::I32);
    let y = Var::new("y", DataType::I32);
    let leaf = prop_oneof![
        Just(Expr::var(&x)),
        Just(Expr::var(&y)),
        (-4i64..=4).prop_map(Expr::i32),
        Just(Expr::call(Intrinsic::GetLocalId, vec![], DataType::I32)),
    ];
    let exprs = leaf.prop_recursive(4, 24, 2, |inner| {
        prop_oneof![
            (inner.clone(), inner.clone(), 0..OPS.len())
                .prop_map(|(l, r, k)| Expr::binary(OPS[k], l, r)),
            (inner, 1i64..=9, 0..DIV_OPS.len())
                .prop_map(|(l, c, k)| Expr::binary(DIV_OPS[k], l, Expr::i32(c))),
        ]
    });
    exprs.prop_map(move |e| {
        let mut func = Function::new("k");
        let out = Buffer::fixed("out", DataType::I32, &[1], AddressSpace::Local);
        let out = func.add_buffer_param(out);
        func.params.push(Param::Scalar(x.clone()));
        func.params.push(Param::Scalar(y.clone()));
        func.body = Stmt::store(out, vec![Expr::i32(0)], e);
        func
    })
}

fn run(pass: PassId, func: Function) -> Function {
    let module = vira_lower::run_single_pass(module_of([func]), pass, &target("v2")).unwrap();
    module.functions["k"].clone()
}

fn result(func: &Function, x: i32, y: i32) -> Lane {
    let mut interp = Interpreter::new(func).with_local_id(3);
    interp.set_scalar("x", Lane::Int(i64::from(x)));
    interp.set_scalar("y", Lane::Int(i64::from(y)));
    interp.run().unwrap();
    interp.buffer("out").unwrap()[0]
}

proptest! {
    #[test]
    fn normalization_passes_are_idempotent(func in kernels()) {
        for pass in NORMALIZATION {
            let once = run(pass, func.clone());
            let twice = run(pass, once.clone());
            prop_assert_eq!(&once.body, &twice.body, "{:?}", pass);
        }
    }

    #[test]
    fn normalization_preserves_results(func in kernels(), x in any::<i32>(), y in any::<i32>()) {
        let expected = result(&func, x, y);
        for pass in NORMALIZATION {
            let out = run(pass, func.clone());
            prop_assert_eq!(result(&out, x, y), expected, "{:?}", pass);
        }
    }
}
