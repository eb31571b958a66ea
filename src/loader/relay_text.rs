use std::fs;
use std::path::Path;

use crate::ir::text;
use crate::ir::Module;
use crate::loader::LoaderError;

/// Reads `path` and parses its full contents as textual IR.
pub fn load(path: &Path) -> Result<Module, LoaderError> {
    let src = fs::read_to_string(path)?;
    let module = text::parse_module(&src)?;
    if module.entry().is_none() {
        return Err(LoaderError::MissingEntry);
    }
    Ok(module)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn loads_well_formed_text() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("model.rly");
        let mut file = fs::File::create(&path).unwrap();
        writeln!(file, "def @main(%x: f32[1]) {{\n  %x\n}}").unwrap();

        let module = load(&path).unwrap();
        assert!(module.entry().is_some());
    }

    #[test]
    fn malformed_text_is_a_parse_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("model.rly");
        fs::write(&path, "def main(x) { x }").unwrap();

        let err = load(&path).unwrap_err();
        assert!(matches!(err, LoaderError::Parse(_)));
    }

    #[test]
    fn module_without_main_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("model.rly");
        fs::write(&path, "def @helper(%x: f32[1]) {\n  %x\n}\n").unwrap();

        let err = load(&path).unwrap_err();
        assert!(matches!(err, LoaderError::MissingEntry));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = load(Path::new("/nonexistent/model.rly")).unwrap_err();
        assert!(matches!(err, LoaderError::Io(_)));
    }
}
