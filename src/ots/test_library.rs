//! Test library export and merging. The first-party library is built from
//! tests discovered under tests/; libraries referenced by imported modules
//! merge in by concatenation with first-party precedence.

use indexmap::IndexMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::module::{OtsGenericTest, OtsModule, OtsSingularTest, OtsTestLibrary};
use super::{serialize, write_atomic, OutputFormat};
use crate::error::{OtscError, Result};
use crate::testing::{ProjectTest, TestDefinition};

/// Builds, merges, and writes the project test library
pub struct TestLibraryMerger {
    project_name: String,
}

impl TestLibraryMerger {
    pub fn new(project_name: impl Into<String>) -> Self {
        Self {
            project_name: project_name.into(),
        }
    }

    /// Classify the discovered project tests into a library
    pub fn build_first_party(&self, tests: &IndexMap<String, ProjectTest>) -> OtsTestLibrary {
        let mut library = OtsTestLibrary::new(&self.project_name);
        for (name, test) in tests {
            match TestDefinition::from_project_test(test) {
                TestDefinition::Generic {
                    sql,
                    level,
                    description,
                    parameters,
                } => {
                    library.generic_tests.insert(
                        name.clone(),
                        OtsGenericTest {
                            test_type: "sql".to_string(),
                            level,
                            description,
                            sql,
                            parameters,
                        },
                    );
                }
                TestDefinition::Singular {
                    sql,
                    level,
                    description,
                    target_transformation,
                } => {
                    if target_transformation.is_none() {
                        warn!(
                            test = name.as_str(),
                            file = %test.source.display(),
                            "singular test has no identifiable target transformation"
                        );
                    }
                    library.singular_tests.insert(
                        name.clone(),
                        OtsSingularTest {
                            test_type: "sql".to_string(),
                            level,
                            description,
                            sql,
                            target_transformation,
                        },
                    );
                }
            }
        }
        library
    }

    /// Load a test library file (JSON or YAML by extension)
    pub fn load_library(&self, path: &Path) -> Result<OtsTestLibrary> {
        let content = std::fs::read_to_string(path).map_err(|e| OtscError::OtsModuleReader {
            file: path.to_path_buf(),
            message: "could not read test library".to_string(),
            source: Some(Box::new(e)),
        })?;
        if path.extension().and_then(|e| e.to_str()) == Some("yaml") {
            serde_yaml::from_str(&content).map_err(|e| OtscError::OtsModuleReader {
                file: path.to_path_buf(),
                message: format!("invalid YAML test library: {e}"),
                source: None,
            })
        } else {
            serde_json::from_str(&content).map_err(|e| OtscError::OtsModuleReader {
                file: path.to_path_buf(),
                message: format!("invalid JSON test library: {e}"),
                source: None,
            })
        }
    }

    /// Resolve and load the libraries referenced by imported modules.
    /// Paths resolve against the module file's directory first, then the
    /// project root; duplicate resolved paths load once.
    pub fn collect_imported(
        &self,
        imported_modules: &[(OtsModule, PathBuf)],
        project_root: &Path,
    ) -> Vec<(OtsTestLibrary, PathBuf)> {
        let mut libraries = Vec::new();
        let mut seen = std::collections::HashSet::new();

        for (module, module_path) in imported_modules {
            let Some(reference) = &module.test_library_path else {
                continue;
            };

            let mut candidate = module_path
                .parent()
                .map(|dir| dir.join(reference))
                .unwrap_or_else(|| PathBuf::from(reference));
            if !candidate.exists() {
                candidate = project_root.join(reference);
            }
            if !candidate.exists() {
                warn!(
                    module = %module.module_name,
                    reference = reference.as_str(),
                    "referenced test library not found"
                );
                continue;
            }

            let key = candidate
                .canonicalize()
                .unwrap_or_else(|_| candidate.clone());
            if !seen.insert(key) {
                continue;
            }

            match self.load_library(&candidate) {
                Ok(library) => {
                    info!(path = %candidate.display(), "loaded imported test library");
                    libraries.push((library, candidate));
                }
                Err(e) => {
                    warn!(path = %candidate.display(), error = %e, "failed to load imported test library");
                }
            }
        }
        libraries
    }

    /// Merge imported libraries into the first-party one. On a key
    /// collision the first-party definition wins; the conflict is
    /// reported by name.
    pub fn merge(
        &self,
        mut base: OtsTestLibrary,
        imported: Vec<(OtsTestLibrary, PathBuf)>,
    ) -> (OtsTestLibrary, Vec<String>) {
        let mut conflicts = Vec::new();

        for (library, path) in imported {
            let source = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| path.to_string_lossy().to_string());

            for (name, definition) in library.generic_tests {
                if base.generic_tests.contains_key(&name) {
                    conflicts.push(format!("generic_tests.{name} (from {source})"));
                    warn!(
                        test = name.as_str(),
                        source = source.as_str(),
                        "generic test conflict, first-party definition kept"
                    );
                } else {
                    base.generic_tests.insert(name, definition);
                }
            }
            for (name, definition) in library.singular_tests {
                if base.singular_tests.contains_key(&name) {
                    conflicts.push(format!("singular_tests.{name} (from {source})"));
                    warn!(
                        test = name.as_str(),
                        source = source.as_str(),
                        "singular test conflict, first-party definition kept"
                    );
                } else {
                    base.singular_tests.insert(name, definition);
                }
            }
        }

        (base, conflicts)
    }

    /// Write the merged library as `<project>_test_library.ots.<ext>`.
    /// An empty merge writes nothing and yields None.
    pub fn write(
        &self,
        library: &OtsTestLibrary,
        output_folder: &Path,
        format: OutputFormat,
    ) -> Result<Option<PathBuf>> {
        if library.is_empty() {
            debug!("no tests found in project or imported libraries");
            return Ok(None);
        }

        let filename = format!(
            "{}_test_library.ots.{}",
            self.project_name,
            format.extension()
        );
        let path = output_folder.join(filename);
        let content = serialize(library, format)?;
        write_atomic(&path, &content)?;
        info!(
            path = %path.display(),
            generic = library.generic_tests.len(),
            singular = library.singular_tests.len(),
            "test library written"
        );
        Ok(Some(path))
    }
}
