//! Lowering pipeline for VIRA.
//!
//! Provides a [`Pass`] trait, a [`PassManager`] that checks pass ordering
//! through [`PropertySet`] flags, and the built-in passes that take a generic
//! loop/buffer/vector module down to the virtual ISA.

mod align_param;
mod buffer_stride;
mod canonicalize_div_mod;
mod canonicalize_ramp;
mod combine;
mod dma;
mod error;
mod event_state;
mod exchange_constant;
mod fold_constant;
mod isa_rewrite;
mod local_id;
mod loop_partition;
mod lower_pred;
mod manager;
mod merge_for_where;
mod pass_id;
mod precodegen;
mod revert_standard;
mod simplify;
mod size_var;
mod uniquify;
mod util;
mod vector_cast;
mod vector_pad;
mod vector_pointer;
mod vector_split;
mod verify;
mod virtual_isa;

pub use align_param::AlignParamWithBuffer;
pub use buffer_stride::GenBufferStride;
pub use canonicalize_div_mod::CanonicalizeDivMod;
pub use canonicalize_ramp::CanonicalizeRamp;
pub use combine::{CombineInstructions, CombineRule, Pattern, Template, TypeClass};
pub use dma::InsertDma;
pub use error::{Location, LoweringError};
pub use event_state::InitializeEventState;
pub use exchange_constant::ExchangeConstantToRight;
pub use fold_constant::FoldConstant;
pub use isa_rewrite::{IsaAwareRewrite, OperandRule, Reorder};
pub use local_id::EliminateGetLocalId;
pub use loop_partition::LoopPartition;
pub use lower_pred::LowerPred;
pub use manager::{PassManager, PipelineConfig};
pub use merge_for_where::MergeForWhere;
pub use pass_id::PassId;
pub use precodegen::Precodegen;
pub use revert_standard::RevertToStandard;
pub use simplify::Simplify;
pub use size_var::SubstituteSizeVar;
pub use uniquify::UniquifyVarName;
pub use vector_cast::LowerVectorCast;
pub use vector_pad::AlignVectorWidthByPad;
pub use vector_pointer::LowerVirtualVectorPointer;
pub use vector_split::AlignVectorWidthBySplit;
pub use virtual_isa::LowerVirtualIsa;

use std::fmt::Debug;

use vira_ir::{Function, Module, PropertySet, StmtPath};
use vira_target::TargetDescriptor;

/// A lowering pass over one function at a time.
pub trait Pass: Debug + Send + Sync {
    /// Pipeline name of the pass, e.g. `insert-dma`.
    fn name(&self) -> &'static str;

    /// Properties that must hold before the pass runs.
    fn requires(&self) -> PropertySet {
        PropertySet::EMPTY
    }

    /// Properties that hold after the pass has run.
    fn establishes(&self) -> PropertySet {
        PropertySet::EMPTY
    }

    /// Properties the pass may break.
    fn invalidates(&self) -> PropertySet {
        PropertySet::EMPTY
    }

    /// Rewrites one function.
    fn run_on_function(&self, func: Function, cx: &PassContext<'_>)
    -> Result<Function, LoweringError>;
}

/// What a pass sees besides the function it rewrites.
#[derive(Debug)]
pub struct PassContext<'a> {
    pub pass: &'static str,
    pub function: &'a str,
    pub target: &'a TargetDescriptor,
    pub config: &'a PipelineConfig,
}

impl<'a> PassContext<'a> {
    pub fn new(
        pass: &'static str,
        function: &'a str,
        target: &'a TargetDescriptor,
        config: &'a PipelineConfig,
    ) -> Self {
        Self {
            pass,
            function,
            target,
            config,
        }
    }

    pub fn location(&self, path: &StmtPath) -> Location {
        Location {
            function: self.function.to_string(),
            path: path.to_string(),
        }
    }

    /// An [`LoweringError::UnsupportedConstruct`] at `path`.
    pub fn unsupported(&self, path: &StmtPath, message: impl Into<String>) -> LoweringError {
        LoweringError::UnsupportedConstruct {
            pass: self.pass.to_string(),
            location: self.location(path),
            message: message.into(),
        }
    }

    /// An [`LoweringError::InternalInvariantFailure`] at `path`.
    pub fn invariant(&self, path: &StmtPath, message: impl Into<String>) -> LoweringError {
        LoweringError::InternalInvariantFailure {
            pass: self.pass.to_string(),
            location: self.location(path),
            message: message.into(),
        }
    }
}

/// Lowers `module` for `target` with the default pipeline.
pub fn run(module: Module, target: &TargetDescriptor) -> Result<Module, LoweringError> {
    run_with_config(module, target, &PipelineConfig::default())
}

/// Lowers `module` for `target` with an explicit configuration.
pub fn run_with_config(
    module: Module,
    target: &TargetDescriptor,
    config: &PipelineConfig,
) -> Result<Module, LoweringError> {
    PassManager::from_config(config.clone()).run(module, target)
}

/// Runs one pass over every function of `module`.
///
/// The pass still has its required properties checked against the ones
/// recorded on the module.
pub fn run_single_pass(
    module: Module,
    pass: PassId,
    target: &TargetDescriptor,
) -> Result<Module, LoweringError> {
    let config = PipelineConfig {
        passes: Some(vec![pass]),
        ..PipelineConfig::default()
    };
    PassManager::from_config(config).run(module, target)
}

#[cfg(test)]
pub(crate) mod testing {
    //! Helpers shared by the pass unit tests.

    use super::*;
    use vira_target::TargetRegistry;

    pub fn target(name: &str) -> TargetDescriptor {
        TargetRegistry::with_builtins().find(name).unwrap().clone()
    }

    /// Runs `pass` on `func` for target `v2` with the default configuration.
    pub fn run_pass(pass: &dyn Pass, func: Function) -> Result<Function, LoweringError> {
        run_pass_on(pass, func, &target("v2"))
    }

    pub fn run_pass_on(
        pass: &dyn Pass,
        func: Function,
        target: &TargetDescriptor,
    ) -> Result<Function, LoweringError> {
        let config = PipelineConfig::default();
        let name = func.name.clone();
        let cx = PassContext::new(pass.name(), &name, target, &config);
        pass.run_on_function(func, &cx)
    }
}
