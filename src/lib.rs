// otsc - compiler for data-transformation projects
// Public API for the library

pub mod analysis;
pub mod compiler;
pub mod config;
pub mod discovery;
pub mod error;
pub mod logging;
pub mod ots;
pub mod report;
pub mod resolve;
pub mod script;
pub mod sql;
pub mod testing;
pub mod types;

// Re-export key public APIs for convenience
pub use analysis::{DependencyGraph, DependencyGraphBuilder, GraphArtifact, NodeKind};
pub use compiler::{classify_tests, CompilationResult, Compiler};
pub use config::{ConnectionConfig, ProjectConfig};
pub use discovery::{DiscoveredFiles, FileDiscovery, FileRole, SourceFile, SourceLanguage};
pub use error::{format_error_chain, OtscError, Result};
pub use ots::{
    ModuleEmitter, OtsConverter, OtsModule, OtsModuleReader, OtsTestLibrary, OutputFormat,
    TestLibraryMerger,
};
pub use resolve::NameResolver;
pub use script::{Declaration, ScriptExtractor};
pub use sql::{SqlAnalysis, SqlAnalyzer, SqlOperation};
pub use types::{
    Function, FunctionKind, Materialization, Severity, TestAttachment, Transformation,
};
