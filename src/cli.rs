use std::path::PathBuf;

use clap::Parser;
use thiserror::Error;

use crate::loader::ShapeDict;

/// Converts a neural-network model into simplified textual IR.
#[derive(Parser, Debug)]
#[command(name = "relayc", version, about)]
pub struct Cli {
    /// Source framework of the model: `relay` or `tensorflow`.
    #[arg(short = 'f', long)]
    pub framework: String,

    /// Path to the input model file.
    #[arg(short = 'm', long)]
    pub model_path: PathBuf,

    /// Input shapes, e.g. "input0:[1,3,224,224] input1:[1,10]".
    /// Required for `tensorflow` models.
    #[arg(short = 's', long, required_if_eq("framework", "tensorflow"))]
    pub shape_dict: Option<String>,

    /// Output file for the textual IR.
    #[arg(short = 'o', long, default_value = "relay.rly")]
    pub output: PathBuf,
}

#[derive(Error, Debug)]
#[error("invalid shape entry `{entry}`: {message}")]
pub struct ShapeDictError {
    pub entry: String,
    pub message: String,
}

fn entry_error(entry: &str, message: impl Into<String>) -> ShapeDictError {
    ShapeDictError {
        entry: entry.to_string(),
        message: message.into(),
    }
}

/// Parses `"name0:[d0,d1,...] name1:[d0,d1]"` into an ordered shape
/// dictionary.
pub fn parse_shape_dict(s: &str) -> Result<ShapeDict, ShapeDictError> {
    let mut dict = ShapeDict::new();
    for entry in s.split_whitespace() {
        let (name, dims) = entry
            .split_once(':')
            .ok_or_else(|| entry_error(entry, "expected `name:[dims]`"))?;
        if name.is_empty() {
            return Err(entry_error(entry, "empty input name"));
        }
        let dims = dims
            .strip_prefix('[')
            .and_then(|d| d.strip_suffix(']'))
            .ok_or_else(|| entry_error(entry, "dimensions must be bracketed"))?;
        let mut shape = Vec::new();
        if !dims.is_empty() {
            for dim in dims.split(',') {
                let dim: usize = dim.trim().parse().map_err(|_| {
                    entry_error(entry, format!("invalid dimension `{}`", dim.trim()))
                })?;
                shape.push(dim);
            }
        }
        dict.push((name.to_string(), shape));
    }
    Ok(dict)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_entry_parses() {
        let dict = parse_shape_dict("x:[1,3,224,224]").unwrap();
        assert_eq!(dict, vec![("x".to_string(), vec![1, 3, 224, 224])]);
    }

    #[test]
    fn multiple_entries_keep_order() {
        let dict = parse_shape_dict("input0:[1,3] input1:[2]").unwrap();
        assert_eq!(dict[0].0, "input0");
        assert_eq!(dict[1], ("input1".to_string(), vec![2]));
    }

    #[test]
    fn scalar_shape_is_allowed() {
        let dict = parse_shape_dict("x:[]").unwrap();
        assert_eq!(dict, vec![("x".to_string(), Vec::new())]);
    }

    #[test]
    fn missing_brackets_are_rejected() {
        assert!(parse_shape_dict("x:1,2").is_err());
    }

    #[test]
    fn non_numeric_dimension_is_rejected() {
        let err = parse_shape_dict("x:[1,n]").unwrap_err();
        assert!(err.message.contains("invalid dimension"));
    }

    #[test]
    fn cli_defaults_the_output_path() {
        let cli = Cli::parse_from(["relayc", "-f", "relay", "-m", "model.rly"]);
        assert_eq!(cli.output, PathBuf::from("relay.rly"));
    }

    #[test]
    fn tensorflow_requires_a_shape_dict() {
        let result = Cli::try_parse_from(["relayc", "-f", "tensorflow", "-m", "model.pb"]);
        assert!(result.is_err());
    }
}
