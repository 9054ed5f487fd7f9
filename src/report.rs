//! Human- and machine-readable renderings of the dependency graph: the
//! JSON artifact, a mermaid flowchart, and a markdown report.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::analysis::GraphArtifact;
use crate::error::Result;
use crate::ots::write_atomic;

pub const GRAPH_JSON_FILE: &str = "dependency_graph.json";
pub const MERMAID_FILE: &str = "dependency_graph.mmd";
pub const MARKDOWN_REPORT_FILE: &str = "dependency_report.md";
pub const PARSED_MODELS_FILE: &str = "parsed_models.json";

/// Writes graph renderings into the output folder
pub struct ReportGenerator {
    output_folder: PathBuf,
}

impl ReportGenerator {
    pub fn new(output_folder: impl Into<PathBuf>) -> Self {
        Self {
            output_folder: output_folder.into(),
        }
    }

    pub fn write_graph_json(&self, artifact: &GraphArtifact) -> Result<PathBuf> {
        let path = self.output_folder.join(GRAPH_JSON_FILE);
        let content = serde_json::to_string_pretty(artifact)
            .map_err(|e| crate::error::OtscError::Internal(e.to_string()))?;
        write_atomic(&path, &content)?;
        debug!(path = %path.display(), "dependency graph artifact written");
        Ok(path)
    }

    pub fn write_mermaid(
        &self,
        artifact: &GraphArtifact,
        function_ids: &HashSet<String>,
    ) -> Result<PathBuf> {
        let path = self.output_folder.join(MERMAID_FILE);
        write_atomic(&path, &generate_mermaid(artifact, function_ids))?;
        Ok(path)
    }

    pub fn write_markdown(
        &self,
        artifact: &GraphArtifact,
        function_ids: &HashSet<String>,
    ) -> Result<PathBuf> {
        let path = self.output_folder.join(MARKDOWN_REPORT_FILE);
        write_atomic(&path, &generate_markdown(artifact, function_ids))?;
        Ok(path)
    }

    pub fn write_parsed_models<T: serde::Serialize>(&self, models: &T) -> Result<PathBuf> {
        let path = self.output_folder.join(PARSED_MODELS_FILE);
        let content = serde_json::to_string_pretty(models)
            .map_err(|e| crate::error::OtscError::Internal(e.to_string()))?;
        write_atomic(&path, &content)?;
        Ok(path)
    }

    /// Write every rendering at once
    pub fn write_all(
        &self,
        artifact: &GraphArtifact,
        function_ids: &HashSet<String>,
    ) -> Result<Vec<PathBuf>> {
        Ok(vec![
            self.write_graph_json(artifact)?,
            self.write_mermaid(artifact, function_ids)?,
            self.write_markdown(artifact, function_ids)?,
        ])
    }
}

/// Mermaid flowchart of the graph, test and function nodes styled apart
pub fn generate_mermaid(artifact: &GraphArtifact, function_ids: &HashSet<String>) -> String {
    let mut lines = vec![
        "graph LR".to_string(),
        "    classDef testNode fill:#e1f5ff,stroke:#01579b,stroke-width:2px".to_string(),
        "    classDef functionNode fill:#fff3e0,stroke:#e65100,stroke-width:2px".to_string(),
        String::new(),
    ];

    for node in &artifact.nodes {
        let safe = escape_mermaid_node(node);
        if let Some(test_display) = node.strip_prefix("test:") {
            lines.push(format!("    {safe}[\"{test_display} (test)\"]:::testNode"));
        } else if function_ids.contains(node) {
            lines.push(format!("    {safe}[\"{node} (function)\"]:::functionNode"));
        } else {
            lines.push(format!("    {safe}[\"{node}\"]"));
        }
    }

    for (dependency, dependent) in &artifact.edges {
        lines.push(format!(
            "    {} --> {}",
            escape_mermaid_node(dependency),
            escape_mermaid_node(dependent)
        ));
    }

    if !artifact.execution_order.is_empty() {
        lines.push(String::new());
        lines.push("    %% Execution Order:".to_string());
        for (i, node) in artifact.execution_order.iter().enumerate() {
            lines.push(format!("    %% {}. {}", i + 1, node));
        }
    }

    if !artifact.cycles.is_empty() {
        lines.push(String::new());
        lines.push("    %% Circular Dependencies Detected:".to_string());
        for cycle in &artifact.cycles {
            let mut rendered = cycle.join(" -> ");
            if let Some(first) = cycle.first() {
                rendered.push_str(&format!(" -> {first}"));
            }
            lines.push(format!("    %% {rendered}"));
        }
    }

    lines.join("\n")
}

/// Markdown report: summary, diagram, execution order, per-node tables
pub fn generate_markdown(artifact: &GraphArtifact, function_ids: &HashSet<String>) -> String {
    let mut out = String::new();
    out.push_str("# Dependency Report\n\n");

    let test_count = artifact
        .nodes
        .iter()
        .filter(|n| n.starts_with("test:"))
        .count();
    let function_count = artifact
        .nodes
        .iter()
        .filter(|n| function_ids.contains(*n))
        .count();
    let transformation_count = artifact.nodes.len() - test_count - function_count;

    out.push_str("## Summary\n\n");
    out.push_str(&format!("- Transformations: {transformation_count}\n"));
    out.push_str(&format!("- Functions: {function_count}\n"));
    out.push_str(&format!("- Tests: {test_count}\n"));
    out.push_str(&format!("- Dependencies: {}\n\n", artifact.edges.len()));

    if !artifact.cycles.is_empty() {
        out.push_str("## Circular Dependencies\n\n");
        out.push_str("Execution order could not be computed.\n\n");
        for cycle in &artifact.cycles {
            out.push_str(&format!("- `{}`\n", cycle.join("` -> `")));
        }
        out.push('\n');
    }

    out.push_str("## Graph\n\n```mermaid\n");
    out.push_str(&generate_mermaid(artifact, function_ids));
    out.push_str("\n```\n\n");

    if !artifact.execution_order.is_empty() {
        out.push_str("## Execution Order\n\n");
        for (i, node) in artifact.execution_order.iter().enumerate() {
            out.push_str(&format!("{}. `{}`\n", i + 1, node));
        }
        out.push('\n');
    }

    out.push_str("## Dependencies\n\n");
    out.push_str("| Node | Depends on | Required by |\n");
    out.push_str("|---|---|---|\n");
    for node in &artifact.nodes {
        let deps = artifact
            .dependencies
            .get(node)
            .map(|d| d.join(", "))
            .unwrap_or_default();
        let dependents = artifact
            .dependents
            .get(node)
            .map(|d| d.join(", "))
            .unwrap_or_default();
        out.push_str(&format!("| `{node}` | {deps} | {dependents} |\n"));
    }

    out
}

/// Replace characters mermaid cannot carry in node identifiers
fn escape_mermaid_node(name: &str) -> String {
    let mut escaped: String = name
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if escaped
        .chars()
        .next()
        .map(|c| !c.is_alphabetic() && c != '_')
        .unwrap_or(true)
    {
        escaped.insert(0, '_');
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn artifact() -> GraphArtifact {
        let mut dependencies = BTreeMap::new();
        dependencies.insert("a.x".to_string(), vec![]);
        dependencies.insert("b.y".to_string(), vec!["a.x".to_string()]);
        dependencies.insert("test:b.y.row_count_gt_0".to_string(), vec!["b.y".to_string()]);
        let mut dependents = BTreeMap::new();
        dependents.insert("a.x".to_string(), vec!["b.y".to_string()]);
        dependents.insert("b.y".to_string(), vec!["test:b.y.row_count_gt_0".to_string()]);
        dependents.insert("test:b.y.row_count_gt_0".to_string(), vec![]);

        GraphArtifact {
            nodes: vec![
                "a.x".to_string(),
                "b.y".to_string(),
                "test:b.y.row_count_gt_0".to_string(),
            ],
            edges: vec![
                ("a.x".to_string(), "b.y".to_string()),
                ("b.y".to_string(), "test:b.y.row_count_gt_0".to_string()),
            ],
            dependencies,
            dependents,
            execution_order: vec![
                "a.x".to_string(),
                "b.y".to_string(),
                "test:b.y.row_count_gt_0".to_string(),
            ],
            cycles: vec![],
        }
    }

    #[test]
    fn test_mermaid_styles_test_nodes() {
        let mermaid = generate_mermaid(&artifact(), &HashSet::new());
        assert!(mermaid.starts_with("graph LR"));
        assert!(mermaid.contains("b.y.row_count_gt_0 (test)"));
        assert!(mermaid.contains(":::testNode"));
        assert!(mermaid.contains("a_x --> b_y"));
        assert!(mermaid.contains("%% 1. a.x"));
    }

    #[test]
    fn test_mermaid_marks_cycles() {
        let mut artifact = artifact();
        artifact.execution_order.clear();
        artifact.cycles = vec![vec!["a.x".to_string(), "b.y".to_string()]];
        let mermaid = generate_mermaid(&artifact, &HashSet::new());
        assert!(mermaid.contains("Circular Dependencies Detected"));
        assert!(mermaid.contains("a.x -> b.y -> a.x"));
    }

    #[test]
    fn test_markdown_report_sections() {
        let report = generate_markdown(&artifact(), &HashSet::new());
        assert!(report.contains("# Dependency Report"));
        assert!(report.contains("- Transformations: 2"));
        assert!(report.contains("- Tests: 1"));
        assert!(report.contains("```mermaid"));
        assert!(report.contains("## Execution Order"));
        assert!(report.contains("| `b.y` | a.x |"));
    }

    #[test]
    fn test_writes_into_output_folder() {
        let dir = tempfile::tempdir().unwrap();
        let generator = ReportGenerator::new(dir.path());
        let paths = generator.write_all(&artifact(), &HashSet::new()).unwrap();
        assert_eq!(paths.len(), 3);
        for path in paths {
            assert!(path.exists());
        }
    }
}
