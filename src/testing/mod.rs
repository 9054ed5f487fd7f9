//! Data-quality test model: the standard test registry, project-defined
//! test definitions, and the classification rules that sort SQL tests
//! into generic (parameterized) and singular (hard-coded) definitions.

use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::OnceLock;

use crate::types::{Severity, TestAttachment};

/// Level a test definition applies at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestLevel {
    Table,
    Column,
    Function,
}

impl TestLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            TestLevel::Table => "table",
            TestLevel::Column => "column",
            TestLevel::Function => "function",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    Number,
    String,
    Boolean,
    Array,
}

/// Parameter schema entry of a generic test
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestParameter {
    #[serde(rename = "type")]
    pub param_type: ParamType,
    pub default: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A test discovered in the project's tests/ folder, before
/// generic/singular classification
#[derive(Debug, Clone)]
pub struct ProjectTest {
    pub name: String,
    pub sql: String,
    pub severity: Severity,
    pub description: Option<String>,
    pub tags: Vec<String>,
    pub source: PathBuf,
}

/// A definition living in the test library
#[derive(Debug, Clone, PartialEq)]
pub enum TestDefinition {
    Generic {
        sql: String,
        level: TestLevel,
        description: Option<String>,
        parameters: IndexMap<String, TestParameter>,
    },
    Singular {
        sql: String,
        level: TestLevel,
        description: Option<String>,
        target_transformation: Option<String>,
    },
}

impl TestDefinition {
    pub fn sql(&self) -> &str {
        match self {
            TestDefinition::Generic { sql, .. } => sql,
            TestDefinition::Singular { sql, .. } => sql,
        }
    }

    pub fn is_generic(&self) -> bool {
        matches!(self, TestDefinition::Generic { .. })
    }

    /// Classify a discovered project test into its library definition
    pub fn from_project_test(test: &ProjectTest) -> Self {
        let description = test
            .description
            .clone()
            .or_else(|| extract_description(&test.sql))
            .or_else(|| Some(format!("SQL test: {}", test.name)));
        let cleaned = strip_sql_comments(&test.sql).trim().to_string();
        let level = test_level_of(&cleaned);

        if is_generic_sql(&cleaned) {
            TestDefinition::Generic {
                parameters: extract_parameters(&cleaned),
                sql: cleaned,
                level,
                description,
            }
        } else {
            TestDefinition::Singular {
                target_transformation: extract_target_transformation(&cleaned),
                sql: cleaned,
                level,
                description,
            }
        }
    }
}

// -- standard tests ---------------------------------------------------------

/// Built-in test names understood without a library definition
pub const STANDARD_TESTS: [&str; 5] = [
    "not_null",
    "unique",
    "row_count_gt_0",
    "accepted_values",
    "relationships",
];

pub fn is_standard_test(name: &str) -> bool {
    STANDARD_TESTS.contains(&name)
}

/// Validate an attachment of a standard test. Returns a human-readable
/// problem description when the attachment is malformed.
pub fn validate_attachment(
    attachment: &TestAttachment,
    column: Option<&str>,
) -> Result<(), String> {
    let params = &attachment.params;
    match attachment.name.as_str() {
        "not_null" => {
            if column.is_none() {
                return Err("not_null test requires a column".to_string());
            }
            reject_unknown_params(params, &[])
        }
        "unique" => {
            if let Some(columns) = params.get("columns") {
                if column.is_some() {
                    return Err(
                        "unique test cannot use 'columns' when applied to a column".to_string()
                    );
                }
                match columns.as_array() {
                    Some(list) if !list.is_empty() => {}
                    _ => return Err("unique 'columns' must be a non-empty list".to_string()),
                }
                reject_unknown_params(params, &["columns"])
            } else {
                reject_unknown_params(params, &[])
            }
        }
        "row_count_gt_0" => {
            if column.is_some() {
                return Err("row_count_gt_0 is a table-level test".to_string());
            }
            reject_unknown_params(params, &[])
        }
        "accepted_values" => {
            if column.is_none() {
                return Err("accepted_values test requires a column".to_string());
            }
            match params.get("values").and_then(|v| v.as_array()) {
                Some(values) if !values.is_empty() => {}
                _ => {
                    return Err(
                        "accepted_values requires a non-empty 'values' list".to_string()
                    )
                }
            }
            reject_unknown_params(params, &["values"])
        }
        "relationships" => {
            if column.is_none() {
                return Err("relationships test requires a column".to_string());
            }
            if params.get("to").and_then(|v| v.as_str()).is_none() {
                return Err("relationships requires a 'to' target table".to_string());
            }
            let has_field = params.contains_key("field");
            let has_fields = params.contains_key("fields");
            if has_field == has_fields {
                return Err(
                    "relationships requires exactly one of 'field' or 'fields'".to_string()
                );
            }
            if let Some(source_fields) = params.get("source_fields").and_then(|v| v.as_array()) {
                let target_count = if has_field {
                    1
                } else {
                    params
                        .get("fields")
                        .and_then(|v| v.as_array())
                        .map(|a| a.len())
                        .unwrap_or(0)
                };
                if source_fields.len() != target_count {
                    return Err(format!(
                        "relationships: source_fields ({}) and target fields ({}) must have the same length",
                        source_fields.len(),
                        target_count
                    ));
                }
            }
            reject_unknown_params(params, &["to", "field", "fields", "source_fields"])
        }
        _ => Ok(()),
    }
}

fn reject_unknown_params(
    params: &serde_json::Map<String, Value>,
    allowed: &[&str],
) -> Result<(), String> {
    let unknown: Vec<&String> = params
        .keys()
        .filter(|k| !allowed.contains(&k.as_str()))
        .collect();
    if unknown.is_empty() {
        Ok(())
    } else {
        Err(format!(
            "unknown parameters: {}",
            unknown
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }
}

// -- classification ---------------------------------------------------------

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)@table_name|\{\{\s*table_name\s*\}\}|@column_name|\{\{\s*column_name\s*\}\}|@function_name|\{\{\s*function_name\s*\}\}",
        )
        .unwrap()
    })
}

fn column_placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)@column_name|\{\{\s*column_name\s*\}\}").unwrap())
}

fn function_placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)@function_name|\{\{\s*function_name\s*\}\}").unwrap())
}

/// A test is generic when its SQL carries host placeholders
pub fn is_generic_sql(sql: &str) -> bool {
    placeholder_re().is_match(sql)
}

/// Column placeholder makes a test column-level; function placeholder makes
/// it function-level; otherwise it applies at table level.
pub fn test_level_of(sql: &str) -> TestLevel {
    if column_placeholder_re().is_match(sql) {
        TestLevel::Column
    } else if function_placeholder_re().is_match(sql) {
        TestLevel::Function
    } else {
        TestLevel::Table
    }
}

const HOST_PLACEHOLDER_NAMES: [&str; 3] = ["table_name", "column_name", "function_name"];

/// Extract `@param:default` parameter declarations from generic test SQL
pub fn extract_parameters(sql: &str) -> IndexMap<String, TestParameter> {
    static QUOTED: OnceLock<Regex> = OnceLock::new();
    static UNQUOTED: OnceLock<Regex> = OnceLock::new();
    let quoted = QUOTED
        .get_or_init(|| Regex::new(r#"@(\w+):(['"])([^'"]*)['"]"#).unwrap());
    let unquoted =
        UNQUOTED.get_or_init(|| Regex::new(r#"@(\w+):([^\s'"`,;)]+)"#).unwrap());

    let mut parameters = IndexMap::new();

    for caps in quoted.captures_iter(sql) {
        let name = caps[1].to_string();
        if HOST_PLACEHOLDER_NAMES.contains(&name.as_str()) {
            continue;
        }
        parameters.entry(name.clone()).or_insert(TestParameter {
            param_type: ParamType::String,
            default: Value::String(caps[3].to_string()),
            description: Some(format!("Parameter {name}")),
        });
    }

    for caps in unquoted.captures_iter(sql) {
        let name = caps[1].to_string();
        if HOST_PLACEHOLDER_NAMES.contains(&name.as_str()) || parameters.contains_key(&name) {
            continue;
        }
        let raw = caps[2].to_string();
        let (param_type, default) = infer_parameter(&raw);
        parameters.insert(
            name.clone(),
            TestParameter {
                param_type,
                default,
                description: Some(format!("Parameter {name}")),
            },
        );
    }

    parameters
}

fn infer_parameter(raw: &str) -> (ParamType, Value) {
    if let Ok(n) = raw.parse::<i64>() {
        return (ParamType::Number, Value::from(n));
    }
    if let Ok(f) = raw.parse::<f64>() {
        return (
            ParamType::Number,
            serde_json::Number::from_f64(f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
        );
    }
    match raw.to_lowercase().as_str() {
        "true" => return (ParamType::Boolean, Value::Bool(true)),
        "false" => return (ParamType::Boolean, Value::Bool(false)),
        _ => {}
    }
    if raw.starts_with('[') && raw.ends_with(']') {
        let parsed = serde_json::from_str::<Value>(raw).unwrap_or(Value::Array(Vec::new()));
        return (ParamType::Array, parsed);
    }
    (ParamType::String, Value::String(raw.to_string()))
}

/// Target of a singular test: the first fully-qualified `FROM schema.table`
pub fn extract_target_transformation(sql: &str) -> Option<String> {
    static FROM_RE: OnceLock<Regex> = OnceLock::new();
    static FALLBACK_RE: OnceLock<Regex> = OnceLock::new();
    let from_re = FROM_RE.get_or_init(|| {
        Regex::new(r#"(?i)FROM\s+["']?(\w+)["']?\.["']?(\w+)["']?"#).unwrap()
    });
    let fallback_re = FALLBACK_RE.get_or_init(|| Regex::new(r"(\w+)\.(\w+)").unwrap());

    if let Some(caps) = from_re.captures(sql) {
        return Some(format!("{}.{}", &caps[1], &caps[2]));
    }

    const KEYWORDS: [&str; 8] = [
        "SELECT", "FROM", "WHERE", "JOIN", "INNER", "LEFT", "RIGHT", "GROUP",
    ];
    for caps in fallback_re.captures_iter(sql) {
        if !KEYWORDS.contains(&caps[1].to_uppercase().as_str()) {
            return Some(format!("{}.{}", &caps[1], &caps[2]));
        }
    }
    None
}

/// Description from leading `--` comment lines, skipping usage notes
pub fn extract_description(sql: &str) -> Option<String> {
    let mut lines = Vec::new();
    for line in sql.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(comment) = line.strip_prefix("--") {
            let comment = comment.trim();
            if !comment.is_empty()
                && !comment.starts_with("Usage:")
                && !comment.starts_with("Returns")
            {
                lines.push(comment.to_string());
            }
            if lines.len() == 3 {
                break;
            }
        } else {
            break;
        }
    }
    if lines.is_empty() {
        None
    } else {
        Some(lines.join(" "))
    }
}

/// Remove `--` comments, keeping comment markers inside string literals
pub fn strip_sql_comments(sql: &str) -> String {
    let mut cleaned = Vec::new();
    for line in sql.lines() {
        let stripped = line.trim();
        if stripped.starts_with("--") {
            continue;
        }
        if let Some(idx) = line.find("--") {
            let before = &line[..idx];
            let quote_count = before.matches('\'').count() + before.matches('"').count();
            if quote_count % 2 == 0 {
                cleaned.push(before.trim_end().to_string());
                continue;
            }
        }
        cleaned.push(line.to_string());
    }
    cleaned.join("\n")
}
