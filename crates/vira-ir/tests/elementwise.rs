//! Integration test: build an element-wise kernel programmatically, dump it,
//! validate it, round-trip it through JSON and execute it.

use vira_ir::eval::{Interpreter, Lane};
use vira_ir::validate::validate_module;
use vira_ir::*;

/// Builds:
///
/// ```text
/// fn scale(x: global f32[n], y: global f32[n], k: f32) {
///   for i in (0, n) vectorized {
///     y[i] = x[i] * k
///   }
/// }
/// ```
fn build_scale() -> Module {
    let n = Var::new("n", DataType::I32);
    let k = Var::new("k", DataType::F32);
    let i = Var::new("i", DataType::I32);

    let mut func = Function::new("scale");
    let x = func.add_buffer_param(Buffer::new(
        "x",
        DataType::F32,
        vec![Dim::Size(n.clone())],
        AddressSpace::Global,
    ));
    let y = func.add_buffer_param(Buffer::new(
        "y",
        DataType::F32,
        vec![Dim::Size(n.clone())],
        AddressSpace::Global,
    ));
    func.params.push(Param::Scalar(n.clone()));
    func.params.push(Param::Scalar(k.clone()));

    let body = Stmt::store(
        y,
        vec![Expr::var(&i)],
        Expr::mul(Expr::load(x, vec![Expr::var(&i)], DataType::F32), Expr::var(&k)),
    );
    let mut l = Loop::serial(i, Expr::i32(0), Expr::var(&n), body);
    l.kind = ForKind::Vectorized;
    func.body = Stmt::For(l);

    let mut module = Module::new();
    module.add_function(func);
    module
}

#[test]
fn dump_shows_structure() {
    let module = build_scale();
    let dump = dump_module(&module);
    assert!(dump.contains("fn scale(x, y, n: i32, k: f32) {"));
    assert!(dump.contains("buffer #0 global x: f32[n]"));
    assert!(dump.contains("for i: i32 in (0, n) vectorized {"));
    assert!(dump.contains("y[i] = (x[i] * k)"));
}

#[test]
fn validates_and_round_trips() {
    let module = build_scale();
    validate_module(&module).unwrap();
    let json = serde_json::to_string_pretty(&module).unwrap();
    let back: Module = serde_json::from_str(&json).unwrap();
    assert_eq!(back, module);
    assert!(back.max_var_id() >= 3);
}

#[test]
fn executes_with_symbolic_size() {
    let module = build_scale();
    let func = &module.functions["scale"];
    let mut interp = Interpreter::new(func);
    interp.set_scalar("n", Lane::Int(3));
    interp.set_scalar("k", Lane::Float(2.0));
    interp.set_buffer("x", vec![Lane::Float(1.0), Lane::Float(-2.0), Lane::Float(0.5)]);
    interp.run().unwrap();
    assert_eq!(
        interp.buffer("y").unwrap(),
        &[Lane::Float(2.0), Lane::Float(-4.0), Lane::Float(1.0)]
    );
}

#[test]
fn missing_scalar_is_reported() {
    let module = build_scale();
    let func = &module.functions["scale"];
    let mut interp = Interpreter::new(func);
    interp.set_scalar("n", Lane::Int(3));
    let err = interp.run().unwrap_err();
    assert!(matches!(err, EvalError::UnboundVar(name) if name == "k"));
}
