// Portable-module (OTS) layer: the file format model, the importer, the
// per-schema emitter, and the test-library exporter/merger.

pub mod emitter;
pub mod module;
pub mod reader;
pub mod test_library;

pub use emitter::ModuleEmitter;
pub use module::{
    OtsFunction, OtsGenericTest, OtsModule, OtsSingularTest, OtsTarget, OtsTestLibrary,
    OtsTransformation, ACCEPTED_VERSIONS, OTS_VERSION, TEST_LIBRARY_OTS_VERSION,
};
pub use reader::{validate_module_location, OtsConverter, OtsModuleReader};
pub use test_library::TestLibraryMerger;

use std::io::Write;
use std::path::Path;

use crate::error::{OtscError, Result};

/// Serialization format for emitted artifacts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Json,
    Yaml,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Json => "json",
            OutputFormat::Yaml => "yaml",
        }
    }

    pub fn parse(s: &str) -> Self {
        if s.eq_ignore_ascii_case("yaml") || s.eq_ignore_ascii_case("yml") {
            OutputFormat::Yaml
        } else {
            OutputFormat::Json
        }
    }
}

/// Serialize a value in the requested format
pub fn serialize<T: serde::Serialize>(value: &T, format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Json => serde_json::to_string_pretty(value)
            .map_err(|e| OtscError::Internal(format!("JSON serialization failed: {e}"))),
        OutputFormat::Yaml => serde_yaml::to_string(value)
            .map_err(|e| OtscError::Internal(format!("YAML serialization failed: {e}"))),
    }
}

/// Write a file atomically: write to a temporary sibling, then rename over
/// the destination.
pub fn write_atomic(path: &Path, content: &str) -> Result<()> {
    let parent = path.parent().ok_or_else(|| OtscError::OutputGeneration {
        path: path.to_path_buf(),
        message: "path has no parent directory".to_string(),
        source: None,
    })?;
    std::fs::create_dir_all(parent).map_err(|e| OtscError::OutputGeneration {
        path: path.to_path_buf(),
        message: "could not create output directory".to_string(),
        source: Some(e),
    })?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(|e| {
        OtscError::OutputGeneration {
            path: path.to_path_buf(),
            message: "could not create temporary file".to_string(),
            source: Some(e),
        }
    })?;
    tmp.write_all(content.as_bytes())
        .map_err(|e| OtscError::OutputGeneration {
            path: path.to_path_buf(),
            message: "could not write temporary file".to_string(),
            source: Some(e),
        })?;
    tmp.persist(path).map_err(|e| OtscError::OutputGeneration {
        path: path.to_path_buf(),
        message: "could not persist file".to_string(),
        source: Some(e.error),
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_write_atomic_overwrites() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/out.json");
        write_atomic(&path, "{\"a\": 1}").unwrap();
        write_atomic(&path, "{\"a\": 2}").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{\"a\": 2}");
    }

    #[test]
    fn test_format_parse() {
        assert_eq!(OutputFormat::parse("yaml"), OutputFormat::Yaml);
        assert_eq!(OutputFormat::parse("json"), OutputFormat::Json);
        assert_eq!(OutputFormat::parse("anything"), OutputFormat::Json);
    }
}
