mod common;

use common::*;
use proptest::prelude::*;
use vira_ir::eval::Lane;
use vira_ir::{AddressSpace, Buffer, DataType, Expr, Function, Mask, Opcode, Scalar, Stmt};

const SHAPE: [u64; 3] = [5, 10, 224];

#[test]
fn add_lowers_to_native_vectors_and_whole_buffer_dma() {
    let elems = SHAPE.iter().product::<u64>();
    let a = floats((0..elems).map(|i| i as f32 * 0.5));
    let b = floats((0..elems).map(|i| 1.0 - i as f32));
    let inputs = [("a", a), ("b", b)];

    for name in ["v2", "v3"] {
        let before = add3d(&SHAPE);
        let after = lower(before.clone(), &target(name));

        for e in expressions(&after) {
            assert!(e.lanes() <= 8, "{name}: {}-lane `{}` survived", e.lanes(), e.dtype());
        }
        let f32x8 = DataType::vector(Scalar::F32, 8);
        assert!(expressions(&after).iter().any(|e| e.dtype() == f32x8));

        let dmas = dmas(&after);
        assert_eq!(dmas.len(), 3, "{name}");
        for dma in &dmas {
            assert_eq!(dma.total_bytes(), Some(elems * 4), "{name}");
        }
        assert_eq!(after.event_state.as_ref().map(|s| s.slots.len()), Some(3));

        assert_eq!(
            eval(&before, &inputs, &["c"]),
            eval(&after, &inputs, &["c"]),
            "{name}"
        );
    }
}

#[test]
fn add_uses_vector_instructions_only() {
    let after = lower(add3d(&SHAPE), &target("v2"));
    let ops = opcodes(&after);
    assert!(ops.contains(&Opcode::VLoad));
    assert!(ops.contains(&Opcode::VAdd));
    assert!(ops.contains(&Opcode::VStore));
    assert!(
        statements(&after)
            .iter()
            .all(|s| !matches!(s, Stmt::Store { .. }))
    );
}

/// `b[0..lanes] = a[0..lanes] op k` on local buffers of `len` elements.
fn strip(lanes: u16, len: u64, op: fn(Expr, Expr) -> Expr, k: f64) -> Function {
    let mut func = Function::new("strip");
    let [a, b] = ["a", "b"].map(|n| {
        func.add_buffer_param(Buffer::fixed(n, DataType::F32, &[len], AddressSpace::Local))
    });
    let ty = DataType::vector(Scalar::F32, lanes);
    let index = Expr::ramp(Expr::i32(0), Expr::i32(1), lanes);
    let value = op(
        Expr::load(a, vec![index.clone()], ty),
        Expr::broadcast(Expr::f32(k), lanes),
    );
    func.body = Stmt::store(b, vec![index], value);
    func
}

#[test]
fn sixteen_lanes_split_into_two_registers() {
    let before = strip(16, 16, Expr::mul, 2.0);
    let after = lower(before.clone(), &target("v2"));

    let stores = opcodes(&after)
        .into_iter()
        .filter(|op| *op == Opcode::VStore)
        .count();
    assert_eq!(stores, 2);
    assert!(expressions(&after).iter().all(|e| e.lanes() <= 8));

    let inputs = [("a", floats((0..16).map(|i| i as f32 - 3.0)))];
    let out = eval(&after, &inputs, &["b"]);
    assert_eq!(out, eval(&before, &inputs, &["b"]));
    assert_eq!(out[0], floats((0..16).map(|i| (i as f32 - 3.0) * 2.0)));
}

#[test]
fn five_lanes_pad_to_eight_with_masked_tail() {
    let before = strip(5, 8, Expr::add, 1.0);
    let after = lower(before.clone(), &target("v2"));

    let masked_store = expressions(&after).into_iter().any(|e| match e {
        Expr::Isa(inst) => {
            inst.opcode == Opcode::VStore && inst.mask == Some(Expr::Mask(Mask::prefix(5, 8)))
        }
        _ => false,
    });
    assert!(masked_store, "no masked 8-lane store");

    let inputs = [
        ("a", floats((0..8).map(|i| i as f32))),
        ("b", floats([-1.0; 8])),
    ];
    let out = eval(&after, &inputs, &["b"]);
    assert_eq!(out, eval(&before, &inputs, &["b"]));
    assert_eq!(out[0][..5], floats((1..6).map(|i| i as f32))[..]);
    assert_eq!(out[0][5..], floats([-1.0; 3])[..]);
}

#[test]
fn copy_into_column_major_weights_round_trips() {
    let shape = [2, 3, 4];
    let f32 = DataType::F32;
    let mut func = Function::new("transpose");
    let a = func.add_buffer_param(Buffer::fixed("a", f32, &shape, AddressSpace::Global));
    let b = func.add_buffer_param(Buffer::fixed("b", f32, &shape, AddressSpace::Global));
    let w = func.add_scratch(Buffer::fixed("weight", f32, &shape, AddressSpace::Shared));
    func.body = Stmt::seq(vec![copy(&shape, w, a, f32), copy(&shape, b, w, f32)]);

    let after = lower(func, &target("v3"));
    let dmas = dmas(&after);
    assert_eq!(dmas.len(), 2);
    // Row-major to column-major cannot coalesce.
    assert_eq!(dmas[0].dims.len(), 3);

    let inputs = [("a", floats((0..24).map(|i| i as f32)))];
    let out = eval(&after, &inputs, &["b", "weight"]);
    assert_eq!(out[0], inputs[0].1);
    // weight[1][2][3] sits at column-major element 1 + 2*2 + 3*6.
    assert_eq!(out[1][1 + 2 * 2 + 3 * 6], Lane::Float(23.0));
}

#[test]
fn lowered_module_round_trips_through_json() {
    let module = vira_lower::run(module_of([add3d(&[2, 3, 20])]), &target("v3")).unwrap();
    let json = serde_json::to_string(&module).unwrap();
    let back: vira_ir::Module = serde_json::from_str(&json).unwrap();
    assert_eq!(back, module);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn add_with_tail_matches_reference(
        a in prop::collection::vec(-1.0e3f32..1.0e3, 120),
        b in prop::collection::vec(-1.0e3f32..1.0e3, 120),
    ) {
        // 20 = 2 * 8 + 4: every row has a masked tail iteration.
        let shape = [2, 3, 20];
        let before = add3d(&shape);
        let after = lower(before.clone(), &target("v2"));
        let inputs = [("a", floats(a)), ("b", floats(b))];
        prop_assert_eq!(eval(&before, &inputs, &["c"]), eval(&after, &inputs, &["c"]));
    }
}
