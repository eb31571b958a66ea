use log::{debug, info};
use thiserror::Error;

use crate::ir::Module;

pub mod canonicalize_ops;
pub mod eliminate_common_subexpr;
pub mod fold_constant;
pub mod fold_scale_axis;
pub mod remove_unused_functions;
pub mod simplify_expr;
pub mod simplify_inference;

#[derive(Error, Debug)]
pub enum OptimizerError {
    #[error("pass {pass} failed: {message}")]
    PassFailure { pass: String, message: String },
}

impl OptimizerError {
    pub fn failure(pass: &str, message: impl Into<String>) -> Self {
        Self::PassFailure {
            pass: pass.to_string(),
            message: message.into(),
        }
    }
}

/// A semantics-preserving module rewrite. Passes mutate the module in place
/// and must be idempotent.
pub trait Pass {
    fn name(&self) -> &'static str;
    fn run(&self, module: &mut Module, cx: &PassContext) -> Result<(), OptimizerError>;
}

/// Shared optimization settings for a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassContext {
    pub opt_level: u8,
}

impl PassContext {
    pub const fn with_opt_level(opt_level: u8) -> Self {
        Self { opt_level }
    }

    /// The most aggressive setting; every registered pass runs.
    pub const fn highest() -> Self {
        Self::with_opt_level(3)
    }
}

/// An ordered list of named passes sharing one context. Stages run in
/// insertion order; new passes slot in with `add_pass` without touching
/// context setup.
pub struct PassPipeline {
    cx: PassContext,
    passes: Vec<Box<dyn Pass>>,
}

impl PassPipeline {
    pub fn new(cx: PassContext) -> Self {
        Self {
            cx,
            passes: Vec::new(),
        }
    }

    pub fn add_pass(&mut self, pass: Box<dyn Pass>) {
        self.passes.push(pass);
    }

    pub fn run(&self, module: &mut Module) -> Result<(), OptimizerError> {
        for pass in &self.passes {
            info!("running pass {} (opt level {})", pass.name(), self.cx.opt_level);
            pass.run(module, &self.cx)?;
            let nodes: usize = module.functions.values().map(|f| f.nodes.len()).sum();
            debug!(
                "after {}: {} function(s), {} node(s)",
                pass.name(),
                module.functions.len(),
                nodes
            );
        }
        Ok(())
    }
}
