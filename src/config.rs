use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{OtscError, Result};

/// Connection configuration; only the type is relevant to compilation
/// (it selects the SQL dialect and the naming convention).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    #[serde(rename = "type")]
    pub connection_type: String,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connection_type: "duckdb".to_string(),
        }
    }
}

/// Module-level settings from project.toml
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModuleConfig {
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Project configuration loaded from project.toml
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectConfig {
    /// Project name; falls back to `project_folder`, then the directory name
    pub name: Option<String>,

    /// Database name used for module naming (`<database>.<schema>`)
    pub project_folder: Option<String>,

    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Variables available for SQL substitution; nested tables allowed
    #[serde(default)]
    pub variables: BTreeMap<String, toml::Value>,

    /// Module-level tags at the root of the config
    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default)]
    pub module: Option<ModuleConfig>,

    /// When true, a schema/directory mismatch on an imported module is fatal
    #[serde(default)]
    pub strict_module_location: bool,
}

impl ProjectConfig {
    /// Load configuration from project.toml in the given project folder.
    /// A missing file is not an error; defaults apply.
    pub fn load(project_folder: &Path) -> Result<Self> {
        let config_path = project_folder.join("project.toml");

        if !config_path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&config_path).map_err(|e| OtscError::ConfigLoad {
            path: config_path.clone(),
            message: e.to_string(),
        })?;
        let config: ProjectConfig = toml::from_str(&content).map_err(|e| OtscError::ConfigLoad {
            path: config_path,
            message: e.to_string(),
        })?;

        Ok(config)
    }

    /// Project name for artifact naming
    pub fn project_name(&self, project_folder: &Path) -> String {
        self.name
            .clone()
            .or_else(|| self.project_folder.clone())
            .unwrap_or_else(|| {
                project_folder
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| "project".to_string())
            })
    }

    /// Database name for `module_name = <database>.<schema>`
    pub fn database_name(&self, project_folder: &Path) -> String {
        self.project_folder
            .clone()
            .or_else(|| self.name.clone())
            .unwrap_or_else(|| {
                project_folder
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| "unknown".to_string())
            })
    }

    /// Module-level tags: `[module] tags` wins over root-level `tags`
    pub fn module_tags(&self) -> Vec<String> {
        if let Some(module) = &self.module {
            if !module.tags.is_empty() {
                return module.tags.clone();
            }
        }
        self.tags.clone()
    }

    /// Variables as JSON values, for the substitutor
    pub fn variable_map(&self) -> serde_json::Map<String, Value> {
        self.variables
            .iter()
            .map(|(k, v)| (k.clone(), toml_to_json(v)))
            .collect()
    }
}

/// Convert a TOML value into the JSON value model used throughout compilation
pub fn toml_to_json(value: &toml::Value) -> Value {
    match value {
        toml::Value::String(s) => Value::String(s.clone()),
        toml::Value::Integer(i) => Value::from(*i),
        toml::Value::Float(f) => serde_json::Number::from_f64(*f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        toml::Value::Boolean(b) => Value::Bool(*b),
        toml::Value::Datetime(dt) => Value::String(dt.to_string()),
        toml::Value::Array(items) => Value::Array(items.iter().map(toml_to_json).collect()),
        toml::Value::Table(table) => Value::Object(
            table
                .iter()
                .map(|(k, v)| (k.clone(), toml_to_json(v)))
                .collect(),
        ),
    }
}

/// Where compiled artifacts land, relative to the project folder
pub fn output_folder(project_folder: &Path) -> PathBuf {
    project_folder.join("output")
}

/// Where emitted OTS modules land, relative to the project folder
pub fn modules_output_folder(project_folder: &Path) -> PathBuf {
    output_folder(project_folder).join("ots_modules")
}
