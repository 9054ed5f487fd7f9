use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

use crate::error::{OtscError, Result};

/// Role a discovered file plays in the project
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileRole {
    Model,
    Function,
    Test,
}

impl FileRole {
    /// Standard sub-directory name for this role
    pub fn folder(&self) -> &'static str {
        match self {
            FileRole::Model => "models",
            FileRole::Function => "functions",
            FileRole::Test => "tests",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceLanguage {
    Sql,
    Script,
}

/// A classified source file. SQL files carry an optional same-stem script
/// companion that provides metadata only.
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub path: PathBuf,
    pub role: FileRole,
    pub language: SourceLanguage,
    pub companion: Option<PathBuf>,
}

/// Everything discovery found, grouped by role
#[derive(Debug, Default)]
pub struct DiscoveredFiles {
    pub models: Vec<SourceFile>,
    pub functions: Vec<SourceFile>,
    pub tests: Vec<SourceFile>,
    /// Pre-compiled module files found anywhere under models/
    pub imported_modules: Vec<PathBuf>,
}

/// Walks the project tree and classifies files by (role, language)
#[derive(Debug)]
pub struct FileDiscovery {
    project_root: PathBuf,
}

const SCRIPT_EXTENSION: &str = "py";
const MODULE_SUFFIXES: [&str; 2] = [".ots.json", ".ots.yaml"];

impl FileDiscovery {
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self {
            project_root: project_root.into(),
        }
    }

    /// Discover all model, function, test, and imported-module files.
    /// A missing sub-directory yields an empty set for that role.
    pub fn discover(&self) -> Result<DiscoveredFiles> {
        let mut discovered = DiscoveredFiles::default();

        for role in [FileRole::Model, FileRole::Function, FileRole::Test] {
            let folder = self.project_root.join(role.folder());
            if !folder.exists() {
                debug!(folder = %folder.display(), "role folder not present, skipping");
                continue;
            }

            let mut sources = Vec::new();
            for entry in WalkDir::new(&folder).sort_by_file_name() {
                let entry = entry.map_err(|e| OtscError::FileDiscovery {
                    path: folder.clone(),
                    message: e.to_string(),
                    source: e.into_io_error(),
                })?;
                let path = entry.path();
                if !entry.file_type().is_file() {
                    continue;
                }

                let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
                if role == FileRole::Model && is_module_file(file_name) {
                    discovered.imported_modules.push(path.to_path_buf());
                    continue;
                }

                match path.extension().and_then(|e| e.to_str()) {
                    Some("sql") => {
                        sources.push(SourceFile {
                            path: path.to_path_buf(),
                            role,
                            language: SourceLanguage::Sql,
                            companion: metadata_companion(path),
                        });
                    }
                    Some(SCRIPT_EXTENSION) => {
                        // A script next to a same-stem SQL file is metadata
                        // for that file, not an independent source.
                        if path.with_extension("sql").exists() {
                            continue;
                        }
                        sources.push(SourceFile {
                            path: path.to_path_buf(),
                            role,
                            language: SourceLanguage::Script,
                            companion: None,
                        });
                    }
                    _ => {}
                }
            }

            match role {
                FileRole::Model => discovered.models = sources,
                FileRole::Function => discovered.functions = sources,
                FileRole::Test => discovered.tests = sources,
            }
        }

        discovered.imported_modules.sort();
        debug!(
            models = discovered.models.len(),
            functions = discovered.functions.len(),
            tests = discovered.tests.len(),
            imported = discovered.imported_modules.len(),
            "file discovery complete"
        );

        Ok(discovered)
    }

    /// Schema names implied by the directory layout: every first-level
    /// sub-directory of models/ and functions/.
    pub fn known_schemas(&self) -> BTreeSet<String> {
        let mut schemas = BTreeSet::new();
        for folder in ["models", "functions"] {
            let root = self.project_root.join(folder);
            if !root.is_dir() {
                continue;
            }
            if let Ok(entries) = std::fs::read_dir(&root) {
                for entry in entries.flatten() {
                    if entry.path().is_dir() {
                        if let Some(name) = entry.file_name().to_str() {
                            schemas.insert(name.to_string());
                        }
                    }
                }
            }
        }
        schemas
    }
}

/// True for portable-module files (`*.ots.json` / `*.ots.yaml`).
/// Test-library files share the extension but are referenced from modules,
/// never imported on their own.
pub fn is_module_file(file_name: &str) -> bool {
    MODULE_SUFFIXES.iter().any(|s| file_name.ends_with(s))
        && !file_name.contains("_test_library.ots.")
}

/// Companion script file carrying metadata for a SQL source, if present
fn metadata_companion(sql_path: &Path) -> Option<PathBuf> {
    let candidate = sql_path.with_extension(SCRIPT_EXTENSION);
    candidate.exists().then_some(candidate)
}
