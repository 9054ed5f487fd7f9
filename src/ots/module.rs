//! Serde model of the portable module and test-library file formats.
//! Field order follows the emission order of the format; `IndexMap` keeps
//! map entries in insertion order on both read and write.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::testing::{TestLevel, TestParameter};

/// Version written by the emitter
pub const OTS_VERSION: &str = "0.2.2";

/// Versions the reader accepts; older ones upconvert silently
pub const ACCEPTED_VERSIONS: [&str; 4] = ["0.1.0", "0.2.0", "0.2.1", "0.2.2"];

/// Test libraries are part of OTS 0.2.0
pub const TEST_LIBRARY_OTS_VERSION: &str = "0.2.0";

pub const TEST_LIBRARY_VERSION: &str = "1.0";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OtsTarget {
    pub database: String,
    pub schema: String,
    pub sql_dialect: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OtsSqlCode {
    pub original_sql: String,
    pub resolved_sql: String,
    #[serde(default)]
    pub source_tables: Vec<String>,
    #[serde(default)]
    pub source_functions: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OtsCode {
    pub sql: OtsSqlCode,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OtsColumn {
    pub name: String,
    pub datatype: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OtsSchema {
    pub columns: Vec<OtsColumn>,
    #[serde(default)]
    pub partitioning: Vec<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub indexes: Vec<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OtsTests {
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub columns: IndexMap<String, Vec<Value>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub table: Vec<Value>,
}

impl OtsTests {
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty() && self.table.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OtsMetadata {
    #[serde(default)]
    pub file_path: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub object_tags: IndexMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OtsTransformation {
    pub transformation_id: String,
    pub description: Option<String>,
    pub transformation_type: String,
    pub sql_dialect: String,
    pub code: OtsCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<OtsSchema>,
    /// `{ "type": ..., ...details }`; details pass through verbatim
    pub materialization: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tests: Option<OtsTests>,
    #[serde(default)]
    pub metadata: OtsMetadata,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OtsFunctionCode {
    #[serde(default)]
    pub generic_sql: String,
    #[serde(default)]
    pub database_specific: IndexMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OtsDependencies {
    #[serde(default)]
    pub tables: Vec<String>,
    #[serde(default)]
    pub functions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OtsFunction {
    pub function_id: String,
    pub description: Option<String>,
    pub function_type: String,
    pub language: String,
    pub code: OtsFunctionCode,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_table_schema: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deterministic: Option<bool>,
    #[serde(default)]
    pub dependencies: OtsDependencies,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tests: Vec<Value>,
    #[serde(default)]
    pub metadata: OtsMetadata,
}

/// A schema-scoped portable module
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OtsModule {
    pub ots_version: String,
    pub module_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module_description: Option<String>,
    pub target: OtsTarget,
    pub transformations: Vec<OtsTransformation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub functions: Vec<OtsFunction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_library_path: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

// -- test library -----------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OtsGenericTest {
    #[serde(rename = "type")]
    pub test_type: String,
    pub level: TestLevel,
    pub description: Option<String>,
    pub sql: String,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub parameters: IndexMap<String, TestParameter>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OtsSingularTest {
    #[serde(rename = "type")]
    pub test_type: String,
    pub level: TestLevel,
    pub description: Option<String>,
    pub sql: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_transformation: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OtsTestLibrary {
    pub ots_version: String,
    pub test_library_version: String,
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub generic_tests: IndexMap<String, OtsGenericTest>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub singular_tests: IndexMap<String, OtsSingularTest>,
}

impl OtsTestLibrary {
    pub fn new(project_name: &str) -> Self {
        Self {
            ots_version: TEST_LIBRARY_OTS_VERSION.to_string(),
            test_library_version: TEST_LIBRARY_VERSION.to_string(),
            description: Some(format!("Test library for {project_name} project")),
            generic_tests: IndexMap::new(),
            singular_tests: IndexMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.generic_tests.is_empty() && self.singular_tests.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_module_round_trips_through_json() {
        let module = OtsModule {
            ots_version: OTS_VERSION.to_string(),
            module_name: "db.my_schema".to_string(),
            module_description: Some("Transformations for my_schema schema".to_string()),
            target: OtsTarget {
                database: "db".to_string(),
                schema: "my_schema".to_string(),
                sql_dialect: "duckdb".to_string(),
            },
            transformations: vec![OtsTransformation {
                transformation_id: "my_schema.orders".to_string(),
                description: None,
                transformation_type: "sql".to_string(),
                sql_dialect: "duckdb".to_string(),
                code: OtsCode {
                    sql: OtsSqlCode {
                        original_sql: "SELECT 1".to_string(),
                        resolved_sql: "SELECT 1".to_string(),
                        source_tables: vec![],
                        source_functions: vec![],
                    },
                },
                schema: None,
                materialization: json!({"type": "table"}),
                tests: None,
                metadata: OtsMetadata::default(),
            }],
            functions: vec![],
            test_library_path: None,
            tags: vec![],
        };

        let text = serde_json::to_string_pretty(&module).unwrap();
        // optional empty sections stay out of the file
        assert!(!text.contains("\"functions\""));
        assert!(!text.contains("test_library_path"));

        let back: OtsModule = serde_json::from_str(&text).unwrap();
        assert_eq!(back.module_name, "db.my_schema");
        assert_eq!(back.transformations.len(), 1);
        assert_eq!(
            back.transformations[0].materialization,
            json!({"type": "table"})
        );
    }

    #[test]
    fn test_library_empty_check() {
        let mut library = OtsTestLibrary::new("demo");
        assert!(library.is_empty());
        library.singular_tests.insert(
            "orders_positive".to_string(),
            OtsSingularTest {
                test_type: "sql".to_string(),
                level: TestLevel::Table,
                description: None,
                sql: "SELECT 1".to_string(),
                target_transformation: Some("a.orders".to_string()),
            },
        );
        assert!(!library.is_empty());
    }
}
