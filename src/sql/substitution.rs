use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

use crate::error::{OtscError, Result};

/// Variable map used for SQL substitution
pub type Variables = serde_json::Map<String, Value>;

fn at_default_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"@(\w+(?:\.\w+)*):((?:'[^']*')|(?:"[^"]*")|[^@\s,;()]+)"#).unwrap()
    })
}

fn at_plain_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"@(\w+(?:\.\w+)*)").unwrap())
}

fn jinja_default_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*(\w+(?:\.\w+)*)\s*:\s*([^}|]+?)\s*\}\}").unwrap())
}

fn jinja_filter_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"\{\{\s*(\w+(?:\.\w+)*)\s*\|\s*default\(\s*(?:'([^']*)'|"([^"]*)")\s*\)\s*\}\}"#)
            .unwrap()
    })
}

fn jinja_plain_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*(\w+(?:\.\w+)*)\s*\}\}").unwrap())
}

/// Look up a dot-separated path in the variable map
pub fn get_nested_value<'a>(variables: &'a Variables, key_path: &str) -> Option<&'a Value> {
    let mut parts = key_path.split('.');
    let mut current = variables.get(parts.next()?)?;
    for key in parts {
        current = current.as_object()?.get(key)?;
    }
    Some(current)
}

/// Format a variable value for use in SQL
fn format_sql_value(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(true) => "TRUE".to_string(),
        Value::Bool(false) => "FALSE".to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => quote_sql_string(s),
        other => quote_sql_string(&other.to_string()),
    }
}

fn quote_sql_string(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

/// Format a default token from a placeholder. Numbers and booleans keep
/// their literal form; quoted tokens are unwrapped and re-quoted; anything
/// else is treated as a string.
fn format_default_token(token: &str) -> String {
    let token = token.trim();
    if (token.starts_with('\'') && token.ends_with('\'') && token.len() >= 2)
        || (token.starts_with('"') && token.ends_with('"') && token.len() >= 2)
    {
        return quote_sql_string(&token[1..token.len() - 1]);
    }
    if token.parse::<i64>().is_ok() || token.parse::<f64>().is_ok() {
        return token.to_string();
    }
    match token.to_lowercase().as_str() {
        "true" => "TRUE".to_string(),
        "false" => "FALSE".to_string(),
        "null" => "NULL".to_string(),
        _ => quote_sql_string(token),
    }
}

/// Placeholder occurrences of the plain (default-less) forms
fn plain_placeholders(sql: &str) -> Vec<String> {
    let mut names = Vec::new();
    for m in at_plain_re().find_iter(sql) {
        // skip @name:default occurrences
        if sql[m.end()..].starts_with(':') {
            continue;
        }
        let name = &sql[m.start() + 1..m.end()];
        if !names.contains(&name.to_string()) {
            names.push(name.to_string());
        }
    }
    for caps in jinja_plain_re().captures_iter(sql) {
        let name = caps[1].to_string();
        if !names.contains(&name) {
            names.push(name);
        }
    }
    names
}

/// Substitute `@name` / `{{ name }}` placeholders in SQL content.
///
/// Recognized forms: `@name`, `@name:default`, dot-path nesting,
/// `{{ name }}`, `{{ name:default }}`, `{{ name | default('x') }}`.
/// If any plain placeholder has no value, the substitution aborts and the
/// SQL is returned unchanged.
pub fn substitute_sql_variables(sql_content: &str, variables: &Variables) -> String {
    // A single missing required placeholder aborts the whole pass
    for name in plain_placeholders(sql_content) {
        if get_nested_value(variables, &name).is_none() {
            return sql_content.to_string();
        }
    }

    let mut result = sql_content.to_string();

    result = at_default_re()
        .replace_all(&result, |caps: &regex::Captures| {
            match get_nested_value(variables, &caps[1]) {
                Some(value) => format_sql_value(value),
                None => format_default_token(&caps[2]),
            }
        })
        .into_owned();

    result = jinja_default_re()
        .replace_all(&result, |caps: &regex::Captures| {
            match get_nested_value(variables, &caps[1]) {
                Some(value) => format_sql_value(value),
                None => format_default_token(&caps[2]),
            }
        })
        .into_owned();

    result = jinja_filter_re()
        .replace_all(&result, |caps: &regex::Captures| {
            match get_nested_value(variables, &caps[1]) {
                Some(value) => format_sql_value(value),
                None => {
                    let default = caps
                        .get(2)
                        .or_else(|| caps.get(3))
                        .map(|m| m.as_str())
                        .unwrap_or("");
                    quote_sql_string(default)
                }
            }
        })
        .into_owned();

    result = jinja_plain_re()
        .replace_all(&result, |caps: &regex::Captures| {
            match get_nested_value(variables, &caps[1]) {
                Some(value) => format_sql_value(value),
                None => caps[0].to_string(),
            }
        })
        .into_owned();

    result = at_plain_re()
        .replace_all(&result, |caps: &regex::Captures| {
            match get_nested_value(variables, &caps[1]) {
                Some(value) => format_sql_value(value),
                None => caps[0].to_string(),
            }
        })
        .into_owned();

    result
}

/// Validation result for the variables referenced by a SQL source
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VariableReport {
    pub referenced: Vec<String>,
    pub missing: Vec<String>,
    pub unused: Vec<String>,
}

/// Check that every plain placeholder in `sql_content` has a value.
/// Placeholders with defaults need no validation. Missing required
/// variables are a fatal substitution error.
pub fn validate_sql_variables(sql_content: &str, variables: &Variables) -> Result<VariableReport> {
    let referenced = plain_placeholders(sql_content);

    let missing: Vec<String> = referenced
        .iter()
        .filter(|name| get_nested_value(variables, name).is_none())
        .cloned()
        .collect();

    let unused: Vec<String> = variables
        .keys()
        .filter(|key| !referenced.iter().any(|r| r == *key || r.starts_with(&format!("{key}."))))
        .cloned()
        .collect();

    if !missing.is_empty() {
        return Err(OtscError::VariableSubstitution { missing });
    }

    Ok(VariableReport {
        referenced,
        missing: Vec::new(),
        unused,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars(value: Value) -> Variables {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_at_substitution_with_string_value() {
        let variables = vars(json!({"name": "x"}));
        let sql = substitute_sql_variables("SELECT * FROM t WHERE n = @name", &variables);
        assert_eq!(sql, "SELECT * FROM t WHERE n = 'x'");
    }

    #[test]
    fn test_default_used_when_variable_missing() {
        let variables = Variables::new();
        let sql = substitute_sql_variables(
            "SELECT * FROM t WHERE n = @name:anonymous",
            &variables,
        );
        assert_eq!(sql, "SELECT * FROM t WHERE n = 'anonymous'");

        let variables = vars(json!({"name": "x"}));
        let sql = substitute_sql_variables(
            "SELECT * FROM t WHERE n = @name:anonymous",
            &variables,
        );
        assert_eq!(sql, "SELECT * FROM t WHERE n = 'x'");
    }

    #[test]
    fn test_missing_plain_variable_aborts_substitution() {
        let variables = vars(json!({"other": 1}));
        let original = "SELECT * FROM t WHERE n = @name AND m = @other";
        let sql = substitute_sql_variables(original, &variables);
        assert_eq!(sql, original);
    }

    #[test]
    fn test_nested_path_lookup() {
        let variables = vars(json!({"config": {"database": {"host": "localhost"}}}));
        let sql = substitute_sql_variables("SELECT @config.database.host", &variables);
        assert_eq!(sql, "SELECT 'localhost'");
    }

    #[test]
    fn test_jinja_forms() {
        let variables = vars(json!({"env": "prod", "limit": 10}));
        let sql = substitute_sql_variables(
            "SELECT * FROM t WHERE env = {{ env }} LIMIT {{ limit }}",
            &variables,
        );
        assert_eq!(sql, "SELECT * FROM t WHERE env = 'prod' LIMIT 10");

        let sql = substitute_sql_variables(
            "SELECT {{ region:eu }} AS region, {{ tier | default('basic') }} AS tier",
            &Variables::new(),
        );
        assert_eq!(sql, "SELECT 'eu' AS region, 'basic' AS tier");
    }

    #[test]
    fn test_value_formatting() {
        let variables = vars(json!({
            "s": "o'brien",
            "b": true,
            "n": 3.5,
            "z": null
        }));
        let sql = substitute_sql_variables("@s, @b, @n, @z", &variables);
        assert_eq!(sql, "'o''brien', TRUE, 3.5, NULL");
    }

    #[test]
    fn test_numeric_and_boolean_default_tokens() {
        let sql = substitute_sql_variables(
            "HAVING COUNT(*) < @min_rows:10 AND @enabled:true",
            &Variables::new(),
        );
        assert_eq!(sql, "HAVING COUNT(*) < 10 AND TRUE");
    }

    #[test]
    fn test_substitution_is_idempotent() {
        let variables = vars(json!({"name": "x", "limit": 5}));
        let first = substitute_sql_variables(
            "SELECT * FROM t WHERE n = @name LIMIT {{ limit }}",
            &variables,
        );
        let second = substitute_sql_variables(&first, &variables);
        assert_eq!(first, second);
    }

    #[test]
    fn test_validate_reports_referenced_and_unused() {
        let variables = vars(json!({"name": "x", "unused_one": 1}));
        let report =
            validate_sql_variables("SELECT * FROM t WHERE n = @name", &variables).unwrap();
        assert_eq!(report.referenced, vec!["name"]);
        assert_eq!(report.unused, vec!["unused_one"]);
    }

    #[test]
    fn test_validate_fails_on_missing() {
        let err = validate_sql_variables("SELECT @name", &Variables::new()).unwrap_err();
        match err {
            OtscError::VariableSubstitution { missing } => {
                assert_eq!(missing, vec!["name"]);
            }
            other => panic!("expected VariableSubstitution, got {other:?}"),
        }
    }
}
