use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::path::PathBuf;

/// Severity attached to a data-quality test
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

impl Severity {
    pub fn parse(s: &str) -> Self {
        if s.eq_ignore_ascii_case("warning") {
            Severity::Warning
        } else {
            Severity::Error
        }
    }
}

/// The binding of a named test to a transformation, column, or function
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestAttachment {
    pub name: String,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub params: serde_json::Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
}

impl TestAttachment {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: normalize_test_name(&name.into()),
            params: serde_json::Map::new(),
            expected: None,
            severity: None,
        }
    }

    /// Parse an attachment from its metadata form: either a bare test name
    /// or an object `{name|test, expected?, severity?, ...params}`.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(name) => Some(Self::new(name.clone())),
            Value::Object(map) => {
                let name = map
                    .get("name")
                    .or_else(|| map.get("test"))
                    .and_then(|v| v.as_str())?
                    .to_string();
                let mut attachment = Self::new(name);
                for (key, val) in map {
                    match key.as_str() {
                        "name" | "test" => {}
                        "expected" => attachment.expected = Some(val.clone()),
                        "severity" => {
                            attachment.severity = val.as_str().map(Severity::parse);
                        }
                        _ => {
                            attachment.params.insert(key.clone(), val.clone());
                        }
                    }
                }
                Some(attachment)
            }
            _ => None,
        }
    }
}

/// The `no_duplicates` alias predates the `unique` table-level test
pub fn normalize_test_name(name: &str) -> String {
    if name == "no_duplicates" {
        "unique".to_string()
    } else {
        name.to_string()
    }
}

/// A single column declaration, possibly with attached tests
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub datatype: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tests: Vec<TestAttachment>,
}

/// Declared or inferred shape of a transformation's output
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub columns: Vec<ColumnDef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub partitioning: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub indexes: Vec<Value>,
}

/// Incremental strategy details, lossless with respect to the authored config
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IncrementalStrategy {
    Append {
        time_column: String,
        start_date: String,
    },
    Merge {
        unique_key: Vec<String>,
        update_columns: Option<Vec<String>>,
    },
    DeleteInsert {
        where_condition: String,
    },
    /// Pre-compiled details from an imported module, passed through verbatim
    Raw(Value),
}

/// How a transformation materializes in the target database
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Materialization {
    Table,
    View,
    Incremental(IncrementalStrategy),
    Scd2(Value),
}

impl Default for Materialization {
    fn default() -> Self {
        Materialization::Table
    }
}

impl Materialization {
    /// The `type` string as it appears in emitted modules
    pub fn type_name(&self) -> &'static str {
        match self {
            Materialization::Table => "table",
            Materialization::View => "view",
            Materialization::Incremental(_) => "incremental",
            Materialization::Scd2(_) => "scd2",
        }
    }
}

/// SQL body of an entity, before and after reference resolution
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SqlCode {
    pub original_sql: String,
    pub resolved_sql: String,
    pub source_tables: Vec<String>,
    pub source_functions: Vec<String>,
}

/// Where an entity came from
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub file_path: PathBuf,
    pub content_hash: String,
}

impl Provenance {
    pub fn new(file_path: impl Into<PathBuf>, source: &str) -> Self {
        Self {
            file_path: file_path.into(),
            content_hash: calculate_content_hash(source),
        }
    }
}

/// A declared derived dataset
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transformation {
    /// Fully-qualified identifier `schema.name`
    pub id: String,
    pub code: SqlCode,
    pub materialization: Materialization,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub declared_schema: Option<TableSchema>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub table_tests: Vec<TestAttachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub object_tags: serde_json::Map<String, Value>,
    pub provenance: Provenance,
    /// True for transformations loaded from pre-compiled modules
    #[serde(default)]
    pub imported: bool,
}

impl Transformation {
    /// Schema component of the identifier, or "default" for bare names
    pub fn schema(&self) -> &str {
        schema_of(&self.id)
    }

    /// Column-level test attachments, keyed by column name
    pub fn column_tests(&self) -> Vec<(&str, &TestAttachment)> {
        let mut out = Vec::new();
        if let Some(schema) = &self.declared_schema {
            for col in &schema.columns {
                for test in &col.tests {
                    out.push((col.name.as_str(), test));
                }
            }
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FunctionKind {
    Scalar,
    Table,
}

impl FunctionKind {
    pub fn parse(s: &str) -> Self {
        if s.eq_ignore_ascii_case("table") {
            FunctionKind::Table
        } else {
            FunctionKind::Scalar
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FunctionKind::Scalar => "scalar",
            FunctionKind::Table => "table",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionParameter {
    pub name: String,
    #[serde(rename = "type")]
    pub datatype: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
}

/// A user-defined database function
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Function {
    /// Fully-qualified identifier `schema.name`
    pub id: String,
    pub kind: FunctionKind,
    pub language: String,
    pub code: SqlCode,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<FunctionParameter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_table_schema: Option<TableSchema>,
    #[serde(default)]
    pub deterministic: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tests: Vec<TestAttachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub object_tags: serde_json::Map<String, Value>,
    pub provenance: Provenance,
    #[serde(default)]
    pub imported: bool,
}

impl Function {
    pub fn schema(&self) -> &str {
        schema_of(&self.id)
    }
}

/// Schema component of a dotted identifier, or "default" when unqualified
pub fn schema_of(id: &str) -> &str {
    match id.split_once('.') {
        Some((schema, _)) => schema,
        None => "default",
    }
}

/// Last segment of a dotted identifier
pub fn name_of(id: &str) -> &str {
    id.rsplit('.').next().unwrap_or(id)
}

/// Calculate hash for source content, for change detection.
/// Whitespace and `--` comments do not affect the hash.
pub fn calculate_content_hash(source: &str) -> String {
    let normalized = source
        .lines()
        .map(|line| line.split("--").next().unwrap_or("").trim())
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_attachment_from_bare_name() {
        let attachment = TestAttachment::from_value(&json!("not_null")).unwrap();
        assert_eq!(attachment.name, "not_null");
        assert!(attachment.params.is_empty());
        assert!(attachment.severity.is_none());
    }

    #[test]
    fn test_attachment_from_object() {
        let attachment = TestAttachment::from_value(&json!({
            "name": "accepted_values",
            "values": ["a", "b"],
            "severity": "warning",
            "expected": 0
        }))
        .unwrap();
        assert_eq!(attachment.name, "accepted_values");
        assert_eq!(attachment.params.get("values"), Some(&json!(["a", "b"])));
        assert_eq!(attachment.severity, Some(Severity::Warning));
        assert_eq!(attachment.expected, Some(json!(0)));
    }

    #[test]
    fn test_no_duplicates_normalizes_to_unique() {
        let attachment = TestAttachment::from_value(&json!("no_duplicates")).unwrap();
        assert_eq!(attachment.name, "unique");

        let attachment = TestAttachment::from_value(&json!({"name": "no_duplicates"})).unwrap();
        assert_eq!(attachment.name, "unique");
    }

    #[test]
    fn test_schema_of_identifier() {
        assert_eq!(schema_of("my_schema.users"), "my_schema");
        assert_eq!(schema_of("users"), "default");
        assert_eq!(name_of("my_schema.users"), "users");
    }

    #[test]
    fn test_content_hash_ignores_formatting() {
        let a = "SELECT 1 -- trailing comment\nFROM t";
        let b = "  select 1\n  FROM t  ";
        assert_eq!(calculate_content_hash(a), calculate_content_hash(b));
        assert_ne!(
            calculate_content_hash("SELECT 1"),
            calculate_content_hash("SELECT 2")
        );
    }

    #[test]
    fn test_materialization_type_names() {
        assert_eq!(Materialization::Table.type_name(), "table");
        assert_eq!(
            Materialization::Incremental(IncrementalStrategy::DeleteInsert {
                where_condition: "d >= '2024-01-01'".into()
            })
            .type_name(),
            "incremental"
        );
    }
}
