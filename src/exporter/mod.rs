use std::fs::File;
use std::io::Write;
use std::path::Path;

use thiserror::Error;

use crate::ir::{text, Module};

#[derive(Error, Debug)]
pub enum ExporterError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Writes the textual serialization of a module, overwriting any existing
/// file at `path`.
pub struct TextExporter;

impl TextExporter {
    pub fn export(module: &Module, path: &Path) -> Result<(), ExporterError> {
        let rendered = text::print_module(module);
        let mut file = File::create(path)?;
        file.write_all(rendered.as_bytes())?;
        Ok(())
    }
}
