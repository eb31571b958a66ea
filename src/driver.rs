//! The pipeline driver: load, bind, simplify, write.

use std::path::Path;

use log::info;
use thiserror::Error;

use crate::exporter::{ExporterError, TextExporter};
use crate::loader::{self, Framework, LoaderError, ShapeDict};
use crate::optimizer::canonicalize_ops::CanonicalizeOps;
use crate::optimizer::eliminate_common_subexpr::EliminateCommonSubexpr;
use crate::optimizer::fold_constant::FoldConstant;
use crate::optimizer::fold_scale_axis::FoldScaleAxis;
use crate::optimizer::remove_unused_functions::RemoveUnusedFunctions;
use crate::optimizer::simplify_expr::SimplifyExpr;
use crate::optimizer::simplify_inference::SimplifyInference;
use crate::optimizer::{OptimizerError, PassContext, PassPipeline};

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Loader(#[from] LoaderError),
    #[error(transparent)]
    Optimizer(#[from] OptimizerError),
    #[error(transparent)]
    Exporter(#[from] ExporterError),
}

/// The fixed simplification pipeline. Dead-function removal runs first so
/// later passes never look at unreachable code; inference simplification
/// precedes CSE and constant folding so training-only constructs are gone
/// before redundancy analysis; scale-axis folding follows constant folding
/// so it sees already-folded scales; canonicalization runs last.
pub fn simplification_pipeline() -> PassPipeline {
    let mut pipeline = PassPipeline::new(PassContext::highest());
    pipeline.add_pass(Box::new(RemoveUnusedFunctions));
    pipeline.add_pass(Box::new(SimplifyInference));
    pipeline.add_pass(Box::new(EliminateCommonSubexpr));
    pipeline.add_pass(Box::new(SimplifyExpr));
    pipeline.add_pass(Box::new(FoldConstant));
    pipeline.add_pass(Box::new(FoldScaleAxis));
    pipeline.add_pass(Box::new(CanonicalizeOps));
    pipeline
}

/// Runs the whole tool once: loads the model, binds any external weights
/// into the module, applies the simplification pipeline and writes the
/// textual IR to `output`. Nothing is written unless every stage succeeds.
pub fn run(
    framework: Framework,
    model_path: &Path,
    shape_dict: Option<&ShapeDict>,
    output: &Path,
) -> Result<(), Error> {
    info!(
        "loading {} model from {}",
        framework.as_str(),
        model_path.display()
    );
    let (mut module, params) = loader::load(framework, model_path, shape_dict)?;

    if let Some(params) = params {
        info!("binding {} parameter(s) into @main", params.len());
        module.bind_params(params);
    }

    simplification_pipeline().run(&mut module)?;

    info!("writing textual IR to {}", output.display());
    TextExporter::export(&module, output)?;
    Ok(())
}
