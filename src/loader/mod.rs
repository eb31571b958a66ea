use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;

use thiserror::Error;

use crate::ir::{Module, Tensor};

pub mod relay_text;
pub mod tensorflow;
pub mod tf_proto;

/// External weights keyed by variable name. Consumed by
/// [`Module::bind_params`] once loading finishes.
pub type Params = HashMap<String, Tensor>;

/// Ordered mapping from model input name to its dimensions.
pub type ShapeDict = Vec<(String, Vec<usize>)>;

#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Parse(#[from] crate::ir::text::ParseError),
    #[error("model has no entry function `@main`")]
    MissingEntry,
    #[error("graph import error: {0}")]
    GraphImport(String),
    #[error("conversion error: {0}")]
    Conversion(String),
    #[error("unknown framework `{0}`, expected `relay` or `tensorflow`")]
    Validation(String),
}

/// Source framework tag. Constructing one is the only way to reach
/// [`load`], so an unrecognized tag is rejected before any file I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framework {
    Relay,
    Tensorflow,
}

impl Framework {
    pub fn as_str(&self) -> &'static str {
        match self {
            Framework::Relay => "relay",
            Framework::Tensorflow => "tensorflow",
        }
    }
}

impl FromStr for Framework {
    type Err = LoaderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "relay" => Ok(Framework::Relay),
            "tensorflow" => Ok(Framework::Tensorflow),
            other => Err(LoaderError::Validation(other.to_string())),
        }
    }
}

/// Loads a model into an IR module. The textual path never produces a
/// parameter table; the TensorFlow path returns the weights separately for
/// the driver to bind.
pub fn load(
    framework: Framework,
    path: &Path,
    shape_dict: Option<&ShapeDict>,
) -> Result<(Module, Option<Params>), LoaderError> {
    match framework {
        Framework::Relay => {
            let module = relay_text::load(path)?;
            Ok((module, None))
        }
        Framework::Tensorflow => {
            let empty = ShapeDict::new();
            let (module, params) =
                tensorflow::load(path, shape_dict.unwrap_or(&empty))?;
            Ok((module, Some(params)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn framework_tags_parse() {
        assert_eq!("relay".parse::<Framework>().unwrap(), Framework::Relay);
        assert_eq!(
            "tensorflow".parse::<Framework>().unwrap(),
            Framework::Tensorflow
        );
    }

    #[test]
    fn unknown_framework_is_a_validation_error() {
        let err = "caffe".parse::<Framework>().unwrap_err();
        assert!(matches!(err, LoaderError::Validation(ref tag) if tag == "caffe"));
    }
}
