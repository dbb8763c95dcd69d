use vira_ir::eval::{Interpreter, Lane};
use vira_ir::{
    AddressSpace, Buffer, DataType, DmaTransfer, Expr, ForKind, Function, Handle, Loop, Module,
    Opcode, Stmt, StmtPath, Var,
};
use vira_target::{TargetDescriptor, TargetRegistry};

/// Look up a built-in target by name.
#[allow(dead_code)]
pub fn target(name: &str) -> TargetDescriptor {
    TargetRegistry::with_builtins()
        .resolve(name)
        .unwrap_or_else(|e| panic!("no target {name}: {e}"))
        .clone()
}

/// Wrap functions into a module.
#[allow(dead_code)]
pub fn module_of(funcs: impl IntoIterator<Item = Function>) -> Module {
    let mut module = Module::new();
    for func in funcs {
        module.add_function(func);
    }
    module
}

/// Lower with the default pipeline and return the single function.
#[allow(dead_code)]
pub fn lower(func: Function, target: &TargetDescriptor) -> Function {
    let name = func.name.clone();
    let mut out = vira_lower::run(module_of([func]), target).expect("lowering failed");
    out.functions
        .shift_remove(&name)
        .unwrap_or_else(|| panic!("`{name}` missing from output"))
}

/// A loop nest over `shape` whose body is built from the loop variables.
/// The innermost loop is vectorized when `vectorize` is set.
#[allow(dead_code)]
pub fn nest(shape: &[u64], vectorize: bool, body: impl FnOnce(&[Var]) -> Stmt) -> Stmt {
    let vars: Vec<Var> = (0..shape.len())
        .map(|d| Var::new(format!("i{d}"), DataType::I32))
        .collect();
    let mut stmt = body(&vars);
    for (d, (&n, var)) in shape.iter().zip(&vars).enumerate().rev() {
        let mut l = Loop::serial(var.clone(), Expr::i32(0), Expr::i32(n as i64), stmt);
        if vectorize && d == shape.len() - 1 {
            l.kind = ForKind::Vectorized;
        }
        stmt = Stmt::For(l);
    }
    stmt
}

fn indices(vars: &[Var]) -> Vec<Expr> {
    vars.iter().map(Expr::var).collect()
}

/// `dst[i..] = src[i..]` over `shape`.
#[allow(dead_code)]
pub fn copy(shape: &[u64], dst: Handle<Buffer>, src: Handle<Buffer>, dtype: DataType) -> Stmt {
    nest(shape, false, |vars| {
        Stmt::store(dst, indices(vars), Expr::load(src, indices(vars), dtype))
    })
}

/// Builds
///
/// ```text
/// fn add3d(a: global f32[shape], b: global f32[shape], c: global f32[shape]) {
///   la = a; lb = b                      (shared scratch)
///   for .. for .. for .. vectorized { lc[..] = la[..] + lb[..] }
///   c = lc
/// }
/// ```
#[allow(dead_code)]
pub fn add3d(shape: &[u64]) -> Function {
    let f32 = DataType::F32;
    let mut func = Function::new("add3d");
    let [a, b, c] = ["a", "b", "c"]
        .map(|n| func.add_buffer_param(Buffer::fixed(n, f32, shape, AddressSpace::Global)));
    let [la, lb, lc] = ["la", "lb", "lc"]
        .map(|n| func.add_scratch(Buffer::fixed(n, f32, shape, AddressSpace::Shared)));
    let compute = nest(shape, true, |vars| {
        let value = Expr::add(
            Expr::load(la, indices(vars), f32),
            Expr::load(lb, indices(vars), f32),
        );
        Stmt::store(lc, indices(vars), value)
    });
    func.body = Stmt::seq(vec![
        copy(shape, la, a, f32),
        copy(shape, lb, b, f32),
        compute,
        copy(shape, c, lc, f32),
    ]);
    func
}

/// Runs `func` on the named inputs and returns the named buffers.
#[allow(dead_code)]
pub fn eval(func: &Function, inputs: &[(&str, Vec<Lane>)], outputs: &[&str]) -> Vec<Vec<Lane>> {
    let mut interp = Interpreter::new(func);
    for (name, data) in inputs {
        interp.set_buffer(name, data.clone());
    }
    interp
        .run()
        .unwrap_or_else(|e| panic!("`{}` failed to run: {e}", func.name));
    outputs
        .iter()
        .map(|n| {
            interp
                .buffer(n)
                .unwrap_or_else(|| panic!("no buffer `{n}`"))
                .to_vec()
        })
        .collect()
}

#[allow(dead_code)]
pub fn floats(values: impl IntoIterator<Item = f32>) -> Vec<Lane> {
    values.into_iter().map(|x| Lane::Float(f64::from(x))).collect()
}

/// Every statement of `func`, in pre-order.
#[allow(dead_code)]
pub fn statements(func: &Function) -> Vec<Stmt> {
    let mut out = Vec::new();
    let _ = func.body.walk::<()>(&mut StmtPath::root(), &mut |s, _| {
        if !matches!(s, Stmt::Seq(_)) {
            out.push(s.clone());
        }
        Ok(())
    });
    out
}

#[allow(dead_code)]
pub fn dmas(func: &Function) -> Vec<DmaTransfer> {
    statements(func)
        .into_iter()
        .filter_map(|s| match s {
            Stmt::Dma(dma) => Some(dma),
            _ => None,
        })
        .collect()
}

/// Every expression node of `func`.
#[allow(dead_code)]
pub fn expressions(func: &Function) -> Vec<Expr> {
    let mut out = Vec::new();
    func.body.visit_exprs(&mut |e| e.visit(&mut |e| out.push(e.clone())));
    out
}

/// Opcodes of every instruction in `func`, in visiting order.
#[allow(dead_code)]
pub fn opcodes(func: &Function) -> Vec<Opcode> {
    expressions(func)
        .iter()
        .filter_map(|e| match e {
            Expr::Isa(inst) => Some(inst.opcode),
            _ => None,
        })
        .collect()
}
