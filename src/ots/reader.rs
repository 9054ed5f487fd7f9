//! Importer for pre-compiled portable modules. Reads JSON or YAML module
//! files, validates the format version and structure, and converts entries
//! into the same internal representation used for first-party entities.

use indexmap::IndexMap;
use serde_json::Value;
use std::path::Path;
use tracing::{debug, warn};

use super::module::{OtsModule, OtsTransformation, ACCEPTED_VERSIONS};
use crate::error::{OtscError, Result};
use crate::types::{
    ColumnDef, Function, FunctionKind, FunctionParameter, IncrementalStrategy, Materialization,
    Provenance, SqlCode, TableSchema, TestAttachment, Transformation,
};

/// Reads and validates portable module files
#[derive(Debug, Default)]
pub struct OtsModuleReader;

impl OtsModuleReader {
    pub fn new() -> Self {
        Self
    }

    /// Read a module file, validating version and structure.
    pub fn read_module(&self, path: &Path) -> Result<OtsModule> {
        let content = std::fs::read_to_string(path).map_err(|e| OtscError::OtsModuleReader {
            file: path.to_path_buf(),
            message: "could not read module file".to_string(),
            source: Some(Box::new(e)),
        })?;

        let value: Value = if path.extension().and_then(|e| e.to_str()) == Some("yaml") {
            serde_yaml::from_str(&content).map_err(|e| OtscError::OtsModuleReader {
                file: path.to_path_buf(),
                message: format!("invalid YAML: {e}"),
                source: None,
            })?
        } else {
            serde_json::from_str(&content).map_err(|e| OtscError::OtsModuleReader {
                file: path.to_path_buf(),
                message: format!("invalid JSON: {e}"),
                source: None,
            })?
        };

        self.validate_structure(path, &value)?;

        let module: OtsModule =
            serde_json::from_value(value).map_err(|e| OtscError::OtsValidation {
                file: path.to_path_buf(),
                message: format!("module does not match the OTS schema: {e}"),
            })?;

        debug!(
            file = %path.display(),
            module = %module.module_name,
            version = %module.ots_version,
            transformations = module.transformations.len(),
            "module read"
        );
        Ok(module)
    }

    fn validate_structure(&self, path: &Path, value: &Value) -> Result<()> {
        let object = value.as_object().ok_or_else(|| OtscError::OtsValidation {
            file: path.to_path_buf(),
            message: "module file must contain a top-level object".to_string(),
        })?;

        let version = object
            .get("ots_version")
            .and_then(|v| v.as_str())
            .ok_or_else(|| OtscError::OtsValidation {
                file: path.to_path_buf(),
                message: "missing ots_version".to_string(),
            })?;
        if !ACCEPTED_VERSIONS.contains(&version) {
            return Err(OtscError::OtsValidation {
                file: path.to_path_buf(),
                message: format!(
                    "unsupported ots_version '{version}' (accepted: {})",
                    ACCEPTED_VERSIONS.join(", ")
                ),
            });
        }

        for key in ["module_name", "target", "transformations"] {
            if !object.contains_key(key) {
                return Err(OtscError::OtsValidation {
                    file: path.to_path_buf(),
                    message: format!("missing required key '{key}'"),
                });
            }
        }
        if !object["transformations"].is_array() {
            return Err(OtscError::OtsValidation {
                file: path.to_path_buf(),
                message: "'transformations' must be a list".to_string(),
            });
        }
        let target = object["target"]
            .as_object()
            .ok_or_else(|| OtscError::OtsValidation {
                file: path.to_path_buf(),
                message: "'target' must be an object".to_string(),
            })?;
        for key in ["database", "schema"] {
            if target.get(key).and_then(|v| v.as_str()).is_none() {
                return Err(OtscError::OtsValidation {
                    file: path.to_path_buf(),
                    message: format!("'target.{key}' must be a string"),
                });
            }
        }
        Ok(())
    }
}

/// Converts module entries into internal entities
#[derive(Debug, Default)]
pub struct OtsConverter;

impl OtsConverter {
    pub fn new() -> Self {
        Self
    }

    /// Convert every transformation and function in the module. Converted
    /// entities are marked imported; their declared references are taken
    /// as-is and never re-parsed.
    pub fn convert_module(
        &self,
        module: &OtsModule,
        module_path: &Path,
    ) -> Result<(IndexMap<String, Transformation>, IndexMap<String, Function>)> {
        let mut transformations = IndexMap::new();
        for entry in &module.transformations {
            let transformation = self.convert_transformation(entry, module_path)?;
            transformations.insert(transformation.id.clone(), transformation);
        }

        let mut functions = IndexMap::new();
        for entry in &module.functions {
            let function = self.convert_function(entry, module_path)?;
            functions.insert(function.id.clone(), function);
        }

        Ok((transformations, functions))
    }

    fn convert_transformation(
        &self,
        entry: &OtsTransformation,
        module_path: &Path,
    ) -> Result<Transformation> {
        if entry.transformation_type != "sql" {
            return Err(OtscError::OtsConverter {
                file: module_path.to_path_buf(),
                message: format!(
                    "transformation '{}' has unsupported type '{}'",
                    entry.transformation_id, entry.transformation_type
                ),
            });
        }

        let materialization =
            self.convert_materialization(&entry.materialization, &entry.transformation_id, module_path)?;

        // schema columns, with column tests folded back in
        let mut declared_schema = entry.schema.as_ref().map(|schema| TableSchema {
            columns: schema
                .columns
                .iter()
                .map(|col| ColumnDef {
                    name: col.name.clone(),
                    datatype: col.datatype.clone(),
                    description: col.description.clone(),
                    tests: Vec::new(),
                })
                .collect(),
            partitioning: schema
                .partitioning
                .iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect(),
            indexes: schema.indexes.clone(),
        });

        let mut table_tests = Vec::new();
        if let Some(tests) = &entry.tests {
            for (column, attachments) in &tests.columns {
                let attachments: Vec<TestAttachment> = attachments
                    .iter()
                    .filter_map(TestAttachment::from_value)
                    .collect();
                let schema = declared_schema.get_or_insert_with(TableSchema::default);
                match schema.columns.iter_mut().find(|c| &c.name == column) {
                    Some(col) => col.tests = attachments,
                    None => schema.columns.push(ColumnDef {
                        name: column.clone(),
                        datatype: "string".to_string(),
                        description: None,
                        tests: attachments,
                    }),
                }
            }
            table_tests = tests
                .table
                .iter()
                .filter_map(TestAttachment::from_value)
                .collect();
        }

        Ok(Transformation {
            id: entry.transformation_id.clone(),
            code: SqlCode {
                original_sql: entry.code.sql.original_sql.clone(),
                resolved_sql: entry.code.sql.resolved_sql.clone(),
                source_tables: entry.code.sql.source_tables.clone(),
                source_functions: entry.code.sql.source_functions.clone(),
            },
            materialization,
            declared_schema,
            table_tests,
            description: entry.description.clone(),
            tags: entry.metadata.tags.clone(),
            object_tags: entry
                .metadata
                .object_tags
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect(),
            provenance: Provenance::new(
                if entry.metadata.file_path.is_empty() {
                    module_path.to_string_lossy().to_string()
                } else {
                    entry.metadata.file_path.clone()
                },
                &entry.code.sql.original_sql,
            ),
            imported: true,
        })
    }

    fn convert_materialization(
        &self,
        value: &Value,
        transformation_id: &str,
        module_path: &Path,
    ) -> Result<Materialization> {
        let mat_type = value
            .get("type")
            .and_then(|v| v.as_str())
            .unwrap_or("table");
        match mat_type {
            "table" => Ok(Materialization::Table),
            "view" => Ok(Materialization::View),
            "incremental" => {
                let details = value
                    .get("incremental_details")
                    .cloned()
                    .unwrap_or_else(|| Value::Object(serde_json::Map::new()));
                Ok(Materialization::Incremental(IncrementalStrategy::Raw(
                    details,
                )))
            }
            "scd2" => Ok(Materialization::Scd2(
                value.get("scd2_details").cloned().unwrap_or(Value::Null),
            )),
            other => Err(OtscError::OtsConverter {
                file: module_path.to_path_buf(),
                message: format!(
                    "transformation '{transformation_id}' has unsupported materialization '{other}'"
                ),
            }),
        }
    }

    fn convert_function(
        &self,
        entry: &super::module::OtsFunction,
        module_path: &Path,
    ) -> Result<Function> {
        let parameters: Vec<FunctionParameter> = entry
            .parameters
            .iter()
            .map(|param| {
                serde_json::from_value(param.clone()).map_err(|e| OtscError::OtsConverter {
                    file: module_path.to_path_buf(),
                    message: format!(
                        "function '{}' has a malformed parameter: {e}",
                        entry.function_id
                    ),
                })
            })
            .collect::<Result<_>>()?;

        let return_table_schema = entry
            .return_table_schema
            .as_ref()
            .map(|schema| {
                serde_json::from_value::<TableSchema>(schema.clone()).map_err(|e| {
                    OtscError::OtsConverter {
                        file: module_path.to_path_buf(),
                        message: format!(
                            "function '{}' has a malformed return_table_schema: {e}",
                            entry.function_id
                        ),
                    }
                })
            })
            .transpose()?;

        Ok(Function {
            id: entry.function_id.clone(),
            kind: FunctionKind::parse(&entry.function_type),
            language: entry.language.clone(),
            code: SqlCode {
                original_sql: entry.code.generic_sql.clone(),
                resolved_sql: entry.code.generic_sql.clone(),
                source_tables: entry.dependencies.tables.clone(),
                source_functions: entry.dependencies.functions.clone(),
            },
            parameters,
            return_type: entry.return_type.clone(),
            return_table_schema,
            deterministic: entry.deterministic.unwrap_or(false),
            tests: entry
                .tests
                .iter()
                .filter_map(TestAttachment::from_value)
                .collect(),
            description: entry.description.clone(),
            tags: entry.metadata.tags.clone(),
            object_tags: entry
                .metadata
                .object_tags
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect(),
            provenance: Provenance::new(
                if entry.metadata.file_path.is_empty() {
                    module_path.to_string_lossy().to_string()
                } else {
                    entry.metadata.file_path.clone()
                },
                &entry.code.generic_sql,
            ),
            imported: true,
        })
    }
}

/// Check that a module file's target schema matches the directory under
/// `models/` it resides in. Advisory by default; fatal when the project
/// opts into strict location validation.
pub fn validate_module_location(
    module: &OtsModule,
    module_path: &Path,
    models_folder: &Path,
    strict: bool,
) -> Result<()> {
    let Ok(relative) = module_path.strip_prefix(models_folder) else {
        return Ok(());
    };
    let parts: Vec<&str> = relative
        .components()
        .filter_map(|c| c.as_os_str().to_str())
        .collect();
    if parts.len() < 2 {
        // module sits directly under models/, nothing to compare against
        return Ok(());
    }

    let directory_schema = parts[0];
    if directory_schema == module.target.schema {
        return Ok(());
    }

    let message = format!(
        "module '{}' targets schema '{}' but resides under models/{}/",
        module.module_name, module.target.schema, directory_schema
    );
    if strict {
        Err(OtscError::OtsValidation {
            file: module_path.to_path_buf(),
            message,
        })
    } else {
        warn!(file = %module_path.display(), "{message}");
        Ok(())
    }
}
