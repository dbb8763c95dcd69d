//! VIRA intermediate representation.
//!
//! A tree-shaped loop/buffer/vector IR that is progressively lowered into a
//! virtual ISA for a SIMD+DMA accelerator. Buffers and events live in
//! per-function arenas and are referenced by typed handles; statements and
//! expressions are owned trees.

pub mod arena;
mod buffer;
mod display;
mod error;
pub mod eval;
mod expr;
mod func;
mod properties;
mod stmt;
mod types;
pub mod validate;
pub mod visit;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

pub use arena::{Arena, Handle};
pub use buffer::{AddressSpace, Buffer, Dim, Event, EventSlot, EventState, Layout};
pub use display::{dump_function, dump_module};
pub use error::{EvalError, IrError};
pub use expr::{
    BinaryOp, CmpCond, Expr, Inst, Intrinsic, Literal, Mask, Opcode, UnaryOp, Var, fresh_id,
    reserve_ids_through,
};
pub use func::{Function, Param};
pub use properties::PropertySet;
pub use stmt::{DmaDim, DmaEndpoint, DmaTransfer, ForKind, Loop, PartitionRole, Stmt};
pub use types::{Bytes, DataType, Scalar, ScalarKind};
pub use visit::{BufferEffects, StmtPath};

/// A VIRA module: kernel functions in insertion order plus the pipeline
/// properties already established on them.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Module {
    pub functions: IndexMap<String, Function>,
    #[serde(default)]
    pub properties: PropertySet,
}

impl Module {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a function keyed by its name, replacing any previous one.
    pub fn add_function(&mut self, function: Function) {
        self.functions.insert(function.name.clone(), function);
    }

    /// Largest variable id used anywhere in the module.
    pub fn max_var_id(&self) -> u32 {
        let mut max = 0;
        for func in self.functions.values() {
            for param in &func.params {
                if let Param::Scalar(v) = param {
                    max = max.max(v.id);
                }
            }
            for (_, buf) in func.buffers.iter() {
                for dim in &buf.shape {
                    if let Dim::Size(v) = dim {
                        max = max.max(v.id);
                    }
                }
            }
            func.body.walk::<()>(&mut StmtPath::root(), &mut |stmt, _| {
                match stmt {
                    Stmt::For(l) => max = max.max(l.var.id),
                    Stmt::Let { var, .. } => max = max.max(var.id),
                    _ => {}
                }
                Ok(())
            })
            .ok();
            func.body.visit_exprs(&mut |e| {
                e.visit(&mut |e| {
                    if let Expr::Var(v) = e {
                        max = max.max(v.id);
                    }
                })
            });
        }
        max
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn module_keeps_insertion_order() {
        let mut module = Module::new();
        module.add_function(Function::new("second"));
        module.add_function(Function::new("first"));
        let names: Vec<_> = module.functions.keys().cloned().collect();
        assert_eq!(names, vec!["second", "first"]);
        assert!(module.properties.is_empty());
    }

    #[test]
    fn max_var_id_sees_binders_and_uses() {
        let mut func = Function::new("k");
        let i = Var::new("i", DataType::I32);
        let n = Var::new("n", DataType::I32);
        func.params.push(Param::Scalar(n.clone()));
        func.body = Stmt::For(Loop::serial(
            i.clone(),
            Expr::i32(0),
            Expr::var(&n),
            Stmt::Evaluate(Expr::var(&i)),
        ));
        let mut module = Module::new();
        module.add_function(func);
        assert_eq!(module.max_var_id(), i.id.max(n.id));
    }

    #[test]
    fn json_round_trip() {
        let mut func = Function::new("k");
        func.add_buffer_param(Buffer::fixed("a", DataType::F32, &[4], AddressSpace::Global));
        let mut module = Module::new();
        module.add_function(func);
        let json = serde_json::to_string(&module).unwrap();
        let back: Module = serde_json::from_str(&json).unwrap();
        assert_eq!(back, module);
    }
}
