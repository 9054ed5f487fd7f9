//! Per-schema module emission. Entities are grouped by the schema
//! component of their identifier; one portable module is written per
//! schema, lexically ordered, with atomic per-file writes.

use indexmap::IndexMap;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::module::{
    OtsCode, OtsColumn, OtsDependencies, OtsFunction, OtsFunctionCode, OtsMetadata, OtsModule,
    OtsSchema, OtsSqlCode, OtsTarget, OtsTests, OtsTransformation, OTS_VERSION,
};
use super::{serialize, write_atomic, OutputFormat};
use crate::error::Result;
use crate::sql::analyzer::SqlAnalyzer;
use crate::types::{
    Function, IncrementalStrategy, Materialization, TestAttachment, Transformation,
};

/// Builds and writes per-schema portable modules
pub struct ModuleEmitter<'a> {
    database: String,
    sql_dialect: String,
    module_tags: Vec<String>,
    analyzer: &'a SqlAnalyzer,
}

impl<'a> ModuleEmitter<'a> {
    pub fn new(
        database: impl Into<String>,
        sql_dialect: impl Into<String>,
        module_tags: Vec<String>,
        analyzer: &'a SqlAnalyzer,
    ) -> Self {
        Self {
            database: database.into(),
            sql_dialect: sql_dialect.into(),
            module_tags,
            analyzer,
        }
    }

    /// Group entities by schema and build one module per schema, keyed by
    /// `<database>.<schema>` in lexical schema order.
    pub fn build_modules(
        &self,
        transformations: &IndexMap<String, Transformation>,
        functions: &IndexMap<String, Function>,
        test_library_file: Option<&str>,
    ) -> IndexMap<String, OtsModule> {
        let mut models_by_schema: BTreeMap<String, Vec<&Transformation>> = BTreeMap::new();
        for transformation in transformations.values() {
            models_by_schema
                .entry(transformation.schema().to_string())
                .or_default()
                .push(transformation);
        }
        let mut functions_by_schema: BTreeMap<String, Vec<&Function>> = BTreeMap::new();
        for function in functions.values() {
            functions_by_schema
                .entry(function.schema().to_string())
                .or_default()
                .push(function);
        }

        let mut schemas: Vec<String> = models_by_schema.keys().cloned().collect();
        for schema in functions_by_schema.keys() {
            if !schemas.contains(schema) {
                schemas.push(schema.clone());
            }
        }
        schemas.sort();

        let mut modules = IndexMap::new();
        for schema in schemas {
            let module_name = format!("{}.{}", self.database, schema);
            let models = models_by_schema.remove(&schema).unwrap_or_default();
            let funcs = functions_by_schema.remove(&schema).unwrap_or_default();
            info!(
                module = %module_name,
                transformations = models.len(),
                functions = funcs.len(),
                "building module"
            );
            let module = self.build_module(&module_name, &schema, models, funcs, test_library_file);
            modules.insert(module_name, module);
        }
        modules
    }

    /// Write the modules, one file per schema, as
    /// `<database>__<schema>.ots.<ext>`.
    pub fn emit_modules(
        &self,
        modules: &IndexMap<String, OtsModule>,
        output_folder: &Path,
        format: OutputFormat,
    ) -> Result<IndexMap<String, PathBuf>> {
        let mut paths = IndexMap::new();
        for (module_name, module) in modules {
            let filename = format!(
                "{}.ots.{}",
                module_name.replace('.', "__"),
                format.extension()
            );
            let path = output_folder.join(filename);
            let content = serialize(module, format)?;
            write_atomic(&path, &content)?;
            debug!(module = %module_name, path = %path.display(), "module written");
            paths.insert(module_name.clone(), path);
        }
        Ok(paths)
    }

    fn build_module(
        &self,
        module_name: &str,
        schema: &str,
        models: Vec<&Transformation>,
        functions: Vec<&Function>,
        test_library_file: Option<&str>,
    ) -> OtsModule {
        OtsModule {
            ots_version: OTS_VERSION.to_string(),
            module_name: module_name.to_string(),
            module_description: Some(format!("Transformations for {schema} schema")),
            target: OtsTarget {
                database: self.database.clone(),
                schema: schema.to_string(),
                sql_dialect: self.sql_dialect.clone(),
            },
            transformations: models
                .into_iter()
                .map(|t| self.build_transformation(t))
                .collect(),
            functions: functions
                .into_iter()
                .map(|f| self.build_function(f))
                .collect(),
            test_library_path: test_library_file.map(String::from),
            tags: dedupe_tags(self.module_tags.clone()),
        }
    }

    fn build_transformation(&self, transformation: &Transformation) -> OtsTransformation {
        let schema = transformation
            .declared_schema
            .as_ref()
            .map(|declared| OtsSchema {
                columns: declared
                    .columns
                    .iter()
                    .map(|col| OtsColumn {
                        name: col.name.clone(),
                        datatype: col.datatype.clone(),
                        description: col.description.clone(),
                    })
                    .collect(),
                partitioning: declared
                    .partitioning
                    .iter()
                    .map(|p| Value::String(p.clone()))
                    .collect(),
                indexes: declared.indexes.clone(),
            })
            .or_else(|| self.infer_schema(transformation));

        let tests = build_tests(transformation);

        OtsTransformation {
            transformation_id: transformation.id.clone(),
            description: transformation.description.clone(),
            transformation_type: "sql".to_string(),
            sql_dialect: self.sql_dialect.clone(),
            code: OtsCode {
                sql: OtsSqlCode {
                    original_sql: transformation.code.original_sql.clone(),
                    resolved_sql: transformation.code.resolved_sql.clone(),
                    source_tables: transformation.code.source_tables.clone(),
                    source_functions: transformation.code.source_functions.clone(),
                },
            },
            schema,
            materialization: materialization_value(&transformation.materialization),
            tests,
            metadata: OtsMetadata {
                file_path: transformation.provenance.file_path.to_string_lossy().to_string(),
                tags: self.merge_entity_tags(&transformation.tags),
                object_tags: stringify_object_tags(&transformation.object_tags),
            },
        }
    }

    fn build_function(&self, function: &Function) -> OtsFunction {
        OtsFunction {
            function_id: function.id.clone(),
            description: function.description.clone(),
            function_type: function.kind.as_str().to_string(),
            language: function.language.clone(),
            code: OtsFunctionCode {
                generic_sql: function.code.original_sql.clone(),
                database_specific: IndexMap::new(),
            },
            parameters: function
                .parameters
                .iter()
                .map(|p| serde_json::to_value(p).unwrap_or(Value::Null))
                .collect(),
            return_type: function.return_type.clone(),
            return_table_schema: function
                .return_table_schema
                .as_ref()
                .and_then(|s| serde_json::to_value(s).ok()),
            deterministic: Some(function.deterministic),
            dependencies: OtsDependencies {
                tables: function.code.source_tables.clone(),
                functions: function.code.source_functions.clone(),
            },
            tests: function.tests.iter().map(attachment_value).collect(),
            metadata: OtsMetadata {
                file_path: function.provenance.file_path.to_string_lossy().to_string(),
                tags: self.merge_entity_tags(&function.tags),
                object_tags: stringify_object_tags(&function.object_tags),
            },
        }
    }

    fn infer_schema(&self, transformation: &Transformation) -> Option<OtsSchema> {
        let inferred = self.analyzer.infer_schema(&transformation.code.original_sql)?;
        Some(OtsSchema {
            columns: inferred
                .columns
                .into_iter()
                .map(|col| OtsColumn {
                    name: col.name,
                    datatype: col.datatype,
                    description: None,
                })
                .collect(),
            partitioning: Vec::new(),
            indexes: Vec::new(),
        })
    }

    /// Module-level tags are concatenated in front of entity tags, then
    /// case-insensitively deduplicated preserving first occurrence.
    fn merge_entity_tags(&self, entity_tags: &[String]) -> Vec<String> {
        let mut all = self.module_tags.clone();
        all.extend(entity_tags.iter().cloned());
        dedupe_tags(all)
    }
}

/// Case-insensitive dedup preserving first occurrence
pub fn dedupe_tags(tags: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for tag in tags {
        if tag.is_empty() {
            continue;
        }
        if seen.insert(tag.to_lowercase()) {
            out.push(tag);
        }
    }
    out
}

/// Object tags are string-to-string; other values coerce via their
/// canonical string form
pub fn stringify_object_tags(
    object_tags: &serde_json::Map<String, Value>,
) -> IndexMap<String, String> {
    object_tags
        .iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| {
            let text = match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (k.clone(), text)
        })
        .collect()
}

/// Materialization in its emitted form; strategy details follow the fixed
/// field mapping and pre-compiled details pass through verbatim
pub fn materialization_value(materialization: &Materialization) -> Value {
    match materialization {
        Materialization::Table => json!({"type": "table"}),
        Materialization::View => json!({"type": "view"}),
        Materialization::Incremental(strategy) => {
            let details = match strategy {
                IncrementalStrategy::Append {
                    time_column,
                    start_date,
                } => json!({
                    "strategy": "append",
                    "filter_condition": format!("{time_column} >= {start_date}"),
                }),
                IncrementalStrategy::Merge {
                    unique_key,
                    update_columns,
                } => {
                    let mut details = json!({
                        "strategy": "merge",
                        "merge_key": unique_key,
                    });
                    if let Some(columns) = update_columns {
                        details["update_columns"] = json!(columns);
                    }
                    details
                }
                IncrementalStrategy::DeleteInsert { where_condition } => json!({
                    "strategy": "delete_insert",
                    "delete_condition": where_condition,
                    "filter_condition": where_condition,
                }),
                IncrementalStrategy::Raw(details) => details.clone(),
            };
            json!({"type": "incremental", "incremental_details": details})
        }
        Materialization::Scd2(details) => json!({"type": "scd2", "scd2_details": details}),
    }
}

fn build_tests(transformation: &Transformation) -> Option<OtsTests> {
    let mut tests = OtsTests::default();

    if let Some(schema) = &transformation.declared_schema {
        for col in &schema.columns {
            if !col.tests.is_empty() {
                tests.columns.insert(
                    col.name.clone(),
                    col.tests.iter().map(attachment_value).collect(),
                );
            }
        }
    }
    tests.table = transformation
        .table_tests
        .iter()
        .map(attachment_value)
        .collect();

    if tests.is_empty() {
        None
    } else {
        Some(tests)
    }
}

/// Bare attachments emit as plain strings, parameterized ones as objects
fn attachment_value(attachment: &TestAttachment) -> Value {
    if attachment.params.is_empty()
        && attachment.expected.is_none()
        && attachment.severity.is_none()
    {
        return Value::String(attachment.name.clone());
    }
    let mut map = serde_json::Map::new();
    map.insert("name".to_string(), Value::String(attachment.name.clone()));
    for (key, value) in &attachment.params {
        map.insert(key.clone(), value.clone());
    }
    if let Some(expected) = &attachment.expected {
        map.insert("expected".to_string(), expected.clone());
    }
    if let Some(severity) = &attachment.severity {
        map.insert(
            "severity".to_string(),
            serde_json::to_value(severity).unwrap_or(Value::Null),
        );
    }
    Value::Object(map)
}
