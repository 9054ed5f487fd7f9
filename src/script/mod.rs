// Script declaration layer: a file-local front-end for the decorator,
// factory, and metadata+companion declaration shapes.

pub mod extractor;
pub mod literals;

pub use extractor::{Declaration, FunctionDecl, ModelDecl, ScriptExtractor, TestDecl};
