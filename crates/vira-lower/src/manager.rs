//! The pass manager: ordering checks, per-function execution and
//! post-pass verification.

use std::collections::BTreeMap;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use vira_ir::validate::validate_module;
use vira_ir::{Function, Module, PropertySet, dump_function, reserve_ids_through};
use vira_target::TargetDescriptor;

use crate::{LoweringError, Pass, PassContext, PassId, verify};

/// Default bound on `simplify` rounds.
const MAX_SIMPLIFY_ITERATIONS: usize = 10;

/// Knobs for one pipeline run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Pass list to run instead of [`PassId::DEFAULT_PIPELINE`].
    pub passes: Option<Vec<PassId>>,
    /// Re-check every property a pass claims to establish.
    pub verify_each_pass: bool,
    /// Compile the functions of a module on the rayon thread pool.
    pub parallel: bool,
    pub simplify_max_iterations: usize,
    /// Concrete values for symbolic buffer extents, by size-variable name.
    pub size_bindings: BTreeMap<String, i64>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            passes: None,
            verify_each_pass: true,
            parallel: true,
            simplify_max_iterations: MAX_SIMPLIFY_ITERATIONS,
            size_bindings: BTreeMap::new(),
        }
    }
}

/// Runs an ordered list of passes over every function of a module.
#[derive(Debug)]
pub struct PassManager {
    passes: Vec<Box<dyn Pass>>,
    config: PipelineConfig,
}

impl Default for PassManager {
    fn default() -> Self {
        Self::from_config(PipelineConfig::default())
    }
}

impl PassManager {
    /// Creates a pass manager with no passes.
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            passes: Vec::new(),
            config,
        }
    }

    /// Creates a pass manager with the configured pass list, or the default
    /// pipeline when the configuration names none.
    pub fn from_config(config: PipelineConfig) -> Self {
        let ids = config
            .passes
            .clone()
            .unwrap_or_else(|| PassId::DEFAULT_PIPELINE.to_vec());
        let mut pm = Self::new(config);
        for id in ids {
            pm.add_pass(id.create());
        }
        pm
    }

    /// Adds a pass to the end of the pipeline.
    pub fn add_pass(&mut self, pass: Box<dyn Pass>) {
        self.passes.push(pass);
    }

    pub fn pass_names(&self) -> Vec<&'static str> {
        self.passes.iter().map(|p| p.name()).collect()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Walks the pipeline over the property set without running anything,
    /// returning the properties that hold at the end.
    pub fn check_order(&self, initial: PropertySet) -> Result<PropertySet, LoweringError> {
        let mut props = initial;
        for pass in &self.passes {
            let missing = pass.requires().difference(props);
            if !missing.is_empty() {
                return Err(LoweringError::PreconditionViolation {
                    pass: pass.name().to_string(),
                    missing,
                });
            }
            props = props.difference(pass.invalidates()) | pass.establishes();
        }
        Ok(props)
    }

    /// Lowers every function. Returns the first failure in module order.
    pub fn run(&self, module: Module, target: &TargetDescriptor) -> Result<Module, LoweringError> {
        let (properties, results) = self.compile(module, target)?;
        let mut out = Module::new();
        for (_, result) in results {
            out.add_function(result?);
        }
        out.properties = properties;
        Ok(out)
    }

    /// Lowers every function and reports each result separately.
    ///
    /// Module-level problems (malformed input, pass ordering) still fail the
    /// whole call.
    pub fn run_each(
        &self,
        module: Module,
        target: &TargetDescriptor,
    ) -> Result<Vec<(String, Result<Function, LoweringError>)>, LoweringError> {
        Ok(self.compile(module, target)?.1)
    }

    #[allow(clippy::type_complexity)]
    fn compile(
        &self,
        module: Module,
        target: &TargetDescriptor,
    ) -> Result<(PropertySet, Vec<(String, Result<Function, LoweringError>)>), LoweringError> {
        validate_module(&module)?;
        reserve_ids_through(module.max_var_id());
        let properties = self.check_order(module.properties)?;

        let functions: Vec<(String, Function)> = module.functions.into_iter().collect();
        let lower = |(name, func): (String, Function)| {
            let result = self.lower_function(func, target);
            (name, result)
        };
        let results: Vec<_> = if self.config.parallel {
            functions.into_par_iter().map(lower).collect()
        } else {
            functions.into_iter().map(lower).collect()
        };

        let failed = results.iter().filter(|(_, r)| r.is_err()).count();
        log::info!(
            "lowered {} function(s) through {} passes for target {} ({failed} failed)",
            results.len(),
            self.passes.len(),
            target.name,
        );
        Ok((properties, results))
    }

    fn lower_function(
        &self,
        mut func: Function,
        target: &TargetDescriptor,
    ) -> Result<Function, LoweringError> {
        let name = func.name.clone();
        for pass in &self.passes {
            log::debug!("running {} on {name}", pass.name());
            let cx = PassContext::new(pass.name(), &name, target, &self.config);
            func = pass.run_on_function(func, &cx)?;
            if self.config.verify_each_pass {
                verify::check_all(pass.establishes(), &func, &cx)?;
            }
            if log::log_enabled!(log::Level::Trace) {
                log::trace!("after {}:\n{}", pass.name(), dump_function(&func));
            }
        }
        Ok(func)
    }
}
