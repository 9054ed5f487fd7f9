// Dependency analysis over transformations, functions, and test attachments.

pub mod graph;

pub use graph::{
    substitute_host_placeholders, DependencyGraph, DependencyGraphBuilder, GraphArtifact,
    GraphNode, NodeKind,
};
