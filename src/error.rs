use std::path::PathBuf;
use thiserror::Error;

/// Main error type for otsc
#[derive(Error, Debug)]
pub enum OtscError {
    // File Discovery Errors
    #[error("Failed to walk project directory {}: {message}", .path.display())]
    FileDiscovery {
        path: PathBuf,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    // SQL Parsing Errors
    #[error("Failed to parse SQL in {}: {message}", .file.display())]
    SqlParse {
        file: PathBuf,
        message: String,
    },

    // Script Parsing Errors
    #[error("Failed to parse script file {}: {message}", .file.display())]
    ScriptParse {
        file: PathBuf,
        message: String,
    },

    #[error("Duplicate declaration '{name}' in {}", .file.display())]
    DuplicateDeclaration {
        file: PathBuf,
        name: String,
    },

    // Variable Substitution Errors
    #[error("Variable substitution failed: missing variables: {}", .missing.join(", "))]
    VariableSubstitution {
        missing: Vec<String>,
    },

    // Name Resolution Errors
    #[error("Failed to resolve name for {}: {message}", .file.display())]
    TableResolution {
        file: PathBuf,
        message: String,
    },

    // Dependency Graph Errors
    #[error("Failed to build dependency graph: {0}")]
    Dependency(String),

    // Imported Module Errors
    #[error("Invalid OTS module {}: {message}", .file.display())]
    OtsValidation {
        file: PathBuf,
        message: String,
    },

    #[error("Failed to read OTS module {}: {message}", .file.display())]
    OtsModuleReader {
        file: PathBuf,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Unsupported construct in OTS module {}: {message}", .file.display())]
    OtsConverter {
        file: PathBuf,
        message: String,
    },

    // Output Errors
    #[error("Failed to write {}: {message}", .path.display())]
    OutputGeneration {
        path: PathBuf,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    // Compilation Errors
    #[error("Compilation failed: {message}")]
    Compilation {
        message: String,
        /// Offending identifiers (duplicates, failed modules), when applicable.
        identifiers: Vec<String>,
    },

    // Configuration Errors
    #[error("Failed to load configuration from {}: {message}", .path.display())]
    ConfigLoad {
        path: PathBuf,
        message: String,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl OtscError {
    /// Build a `Compilation` error carrying the full list of offending identifiers.
    pub fn compilation(message: impl Into<String>, identifiers: Vec<String>) -> Self {
        OtscError::Compilation {
            message: message.into(),
            identifiers,
        }
    }
}

/// Result type alias for otsc operations
pub type Result<T> = std::result::Result<T, OtscError>;

/// Helper function to format an error with all its causes
pub fn format_error_chain(err: &OtscError) -> String {
    use std::error::Error;

    let mut output = format!("Error: {}", err);

    let mut current_err: &dyn Error = err;
    while let Some(source) = current_err.source() {
        output.push_str(&format!("\n  Caused by: {}", source));
        current_err = source;
    }

    output
}
