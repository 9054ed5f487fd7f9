// SQL analysis layer: AST-based reference extraction, qualification
// rewriting, projection schema inference, and variable substitution.

pub mod analyzer;
pub mod substitution;

pub use analyzer::{
    dialect_name, SqlAnalysis, SqlAnalyzer, SqlOperation, QualificationContext,
};
pub use substitution::{substitute_sql_variables, validate_sql_variables, VariableReport};
