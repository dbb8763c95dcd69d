//! Integration test: configure the pipeline from JSON and extend it with a
//! pass defined outside the crate.

use std::sync::atomic::{AtomicUsize, Ordering};

use vira_ir::{AddressSpace, Buffer, DataType, Expr, Function, Module, PropertySet, Stmt};
use vira_lower::{LoweringError, Pass, PassContext, PassId, PassManager, PipelineConfig};
use vira_target::TargetRegistry;

fn module(names: &[&str]) -> Module {
    let mut module = Module::new();
    for name in names {
        let mut func = Function::new(*name);
        let a = Buffer::fixed("a", DataType::I32, &[2, 3], AddressSpace::Local);
        let a = func.add_buffer_param(a);
        func.body = Stmt::store(a, vec![Expr::i32(1), Expr::i32(2)], Expr::i32(7));
        module.add_function(func);
    }
    module
}

#[test]
fn config_from_json() {
    let json = r#"{ "passes": ["gen-buffer-stride", "insert-dma"], "parallel": false }"#;
    let config: PipelineConfig = serde_json::from_str(json).unwrap();
    assert_eq!(config.passes, Some(vec![PassId::GenBufferStride, PassId::InsertDma]));
    assert!(!config.parallel);
    // Unspecified knobs keep their defaults.
    assert!(config.verify_each_pass);

    let pm = PassManager::from_config(config);
    assert_eq!(pm.pass_names(), ["gen-buffer-stride", "insert-dma"]);
}

#[test]
fn size_bindings_from_json() {
    let json = r#"{ "size_bindings": { "n": 64, "m": 3 } }"#;
    let config: PipelineConfig = serde_json::from_str(json).unwrap();
    assert_eq!(config.size_bindings.get("n"), Some(&64));
    assert_eq!(config.size_bindings.len(), 2);
    assert_eq!(config.passes, None);

    let pm = PassManager::from_config(config);
    assert_eq!(pm.pass_names().first(), Some(&"substitute-size-var"));
}

#[test]
fn pass_names_match_their_serialized_form() {
    for id in PassId::ALL {
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.name()));
        assert_eq!(id.name().parse::<PassId>().unwrap(), id);
        assert_eq!(id.create().name(), id.name());
    }
}

static SEEN: AtomicUsize = AtomicUsize::new(0);

#[derive(Debug)]
struct CountFunctions;

impl Pass for CountFunctions {
    fn name(&self) -> &'static str {
        "count-functions"
    }

    fn requires(&self) -> PropertySet {
        PropertySet::STRIDES_COMPUTED
    }

    fn run_on_function(
        &self,
        func: Function,
        _cx: &PassContext<'_>,
    ) -> Result<Function, LoweringError> {
        SEEN.fetch_add(1, Ordering::Relaxed);
        Ok(func)
    }
}

#[test]
fn external_pass_runs_after_its_requirements() {
    let target = TargetRegistry::with_builtins().resolve("v1").unwrap().clone();

    let mut pm = PassManager::new(PipelineConfig::default());
    pm.add_pass(Box::new(CountFunctions));
    assert!(matches!(
        pm.run(module(&["f", "g"]), &target),
        Err(LoweringError::PreconditionViolation { .. })
    ));
    assert_eq!(SEEN.load(Ordering::Relaxed), 0);

    let mut pm = PassManager::new(PipelineConfig::default());
    pm.add_pass(PassId::GenBufferStride.create());
    pm.add_pass(Box::new(CountFunctions));
    let out = pm.run(module(&["f", "g"]), &target).unwrap();
    assert_eq!(SEEN.load(Ordering::Relaxed), 2);
    let (_, buf) = out.functions["g"].buffers.iter().next().unwrap();
    assert_eq!(buf.const_strides(), Some(vec![12, 4]));
}
