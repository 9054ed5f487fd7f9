use indexmap::IndexMap;
use petgraph::algo::{tarjan_scc, toposort};
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::Direction;
use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::OnceLock;
use tracing::{debug, warn};

use crate::error::{OtscError, Result};
use crate::resolve::NameResolver;
use crate::sql::analyzer::{QualificationContext, SqlAnalyzer};
use crate::testing::TestDefinition;
use crate::types::{Function, Transformation};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Transformation,
    Function,
    Test,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphNode {
    pub id: String,
    pub kind: NodeKind,
}

/// Serializable rendering of the graph, as written to the analysis artifact
#[derive(Debug, Clone, Serialize)]
pub struct GraphArtifact {
    pub nodes: Vec<String>,
    pub edges: Vec<(String, String)>,
    pub dependencies: BTreeMap<String, Vec<String>>,
    pub dependents: BTreeMap<String, Vec<String>>,
    pub execution_order: Vec<String>,
    pub cycles: Vec<Vec<String>>,
}

/// Directed dependency graph over transformations, functions, and tests.
/// An edge `A -> B` means B depends on A; execution order is topological.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    graph: StableDiGraph<GraphNode, ()>,
    node_map: HashMap<String, NodeIndex>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, id: &str, kind: NodeKind) -> NodeIndex {
        if let Some(&index) = self.node_map.get(id) {
            return index;
        }
        let index = self.graph.add_node(GraphNode {
            id: id.to_string(),
            kind,
        });
        self.node_map.insert(id.to_string(), index);
        index
    }

    /// Add `dependency -> dependent`; both nodes must already exist
    pub fn add_edge(&mut self, dependency: &str, dependent: &str) {
        let (Some(&from), Some(&to)) = (self.node_map.get(dependency), self.node_map.get(dependent))
        else {
            return;
        };
        if from == to {
            return;
        }
        if !self.graph.contains_edge(from, to) {
            self.graph.add_edge(from, to, ());
        }
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.node_map.contains_key(id)
    }

    pub fn node_kind(&self, id: &str) -> Option<NodeKind> {
        self.node_map.get(id).map(|&ix| self.graph[ix].kind)
    }

    /// Direct predecessors: everything `id` depends on
    pub fn dependencies_of(&self, id: &str) -> Vec<String> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Direct successors: everything that depends on `id`
    pub fn dependents_of(&self, id: &str) -> Vec<String> {
        self.neighbors(id, Direction::Outgoing)
    }

    fn neighbors(&self, id: &str, direction: Direction) -> Vec<String> {
        let Some(&index) = self.node_map.get(id) else {
            return Vec::new();
        };
        let mut out: Vec<String> = self
            .graph
            .neighbors_directed(index, direction)
            .map(|ix| self.graph[ix].id.clone())
            .collect();
        out.sort();
        out
    }

    /// Transitive dependents of the given nodes, excluding the inputs
    pub fn affected_by(&self, changed: &[String]) -> Vec<String> {
        let mut affected = HashSet::new();
        let mut to_visit: Vec<String> = changed.to_vec();

        while let Some(id) = to_visit.pop() {
            if !affected.insert(id.clone()) {
                continue;
            }
            for dependent in self.dependents_of(&id) {
                if !affected.contains(&dependent) {
                    to_visit.push(dependent);
                }
            }
        }

        let mut out: Vec<String> = affected
            .into_iter()
            .filter(|id| !changed.contains(id))
            .collect();
        out.sort();
        out
    }

    /// Topological execution order; empty when the graph has cycles
    pub fn execution_order(&self) -> Vec<String> {
        match toposort(&self.graph, None) {
            Ok(order) => order.into_iter().map(|ix| self.graph[ix].id.clone()).collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Every strongly-connected component of length > 1, one list per cycle
    pub fn cycles(&self) -> Vec<Vec<String>> {
        tarjan_scc(&self.graph)
            .into_iter()
            .filter(|component| component.len() > 1)
            .map(|component| {
                component
                    .into_iter()
                    .map(|ix| self.graph[ix].id.clone())
                    .collect()
            })
            .collect()
    }

    /// Render the graph into its serializable artifact form
    pub fn to_artifact(&self) -> GraphArtifact {
        let mut nodes: Vec<String> = self.node_map.keys().cloned().collect();
        nodes.sort();

        let mut edges: Vec<(String, String)> = self
            .graph
            .edge_indices()
            .filter_map(|edge| self.graph.edge_endpoints(edge))
            .map(|(from, to)| (self.graph[from].id.clone(), self.graph[to].id.clone()))
            .collect();
        edges.sort();

        let mut dependencies = BTreeMap::new();
        let mut dependents = BTreeMap::new();
        for id in &nodes {
            dependencies.insert(id.clone(), self.dependencies_of(id));
            dependents.insert(id.clone(), self.dependents_of(id));
        }

        let cycles = self.cycles();
        let execution_order = if cycles.is_empty() {
            self.execution_order()
        } else {
            Vec::new()
        };

        GraphArtifact {
            nodes,
            edges,
            dependencies,
            dependents,
            execution_order,
            cycles,
        }
    }
}

/// Builds the dependency graph from resolved entities and discovered tests
pub struct DependencyGraphBuilder<'a> {
    analyzer: &'a SqlAnalyzer,
    resolver: &'a NameResolver,
}

impl<'a> DependencyGraphBuilder<'a> {
    pub fn new(analyzer: &'a SqlAnalyzer, resolver: &'a NameResolver) -> Self {
        Self { analyzer, resolver }
    }

    pub fn build(
        &self,
        transformations: &IndexMap<String, Transformation>,
        functions: &IndexMap<String, Function>,
        test_definitions: &IndexMap<String, TestDefinition>,
    ) -> Result<DependencyGraph> {
        let mut graph = DependencyGraph::new();

        for id in functions.keys() {
            graph.add_node(id, NodeKind::Function);
        }
        for id in transformations.keys() {
            graph.add_node(id, NodeKind::Transformation);
        }

        let transformation_ids: Vec<String> = transformations.keys().cloned().collect();
        let function_ids: Vec<String> = functions.keys().cloned().collect();

        for (id, function) in functions {
            for table_ref in &function.code.source_tables {
                if let Some(full) = self.resolver.resolve_reference(table_ref, &transformation_ids)
                {
                    graph.add_edge(&full, id);
                }
            }
            for func_ref in &function.code.source_functions {
                if let Some(full) = self.resolver.resolve_reference(func_ref, &function_ids) {
                    if &full != id {
                        graph.add_edge(&full, id);
                    }
                }
            }
        }

        for (id, transformation) in transformations {
            for table_ref in &transformation.code.source_tables {
                if let Some(full) = self.resolver.resolve_reference(table_ref, &transformation_ids)
                {
                    if &full != id {
                        graph.add_edge(&full, id);
                    }
                }
            }
            for func_ref in &transformation.code.source_functions {
                // unmatched calls are built-ins and are dropped, not errored
                if let Some(full) = self.resolver.resolve_reference(func_ref, &function_ids) {
                    graph.add_edge(&full, id);
                }
            }
        }

        self.add_test_nodes(&mut graph, transformations, functions, test_definitions)?;

        debug!(
            nodes = graph.node_count(),
            edges = graph.edge_count(),
            "dependency graph built"
        );
        Ok(graph)
    }

    /// Synthesize one node per test attachment, wired under its host
    fn add_test_nodes(
        &self,
        graph: &mut DependencyGraph,
        transformations: &IndexMap<String, Transformation>,
        functions: &IndexMap<String, Function>,
        test_definitions: &IndexMap<String, TestDefinition>,
    ) -> Result<()> {
        let transformation_ids: Vec<String> = transformations.keys().cloned().collect();

        for (host_id, transformation) in transformations {
            for (column, attachment) in transformation.column_tests() {
                let node_id = format!("test:{host_id}.{column}.{}", attachment.name);
                graph.add_node(&node_id, NodeKind::Test);
                self.wire_test(
                    graph,
                    &node_id,
                    host_id,
                    Some(column),
                    None,
                    &attachment.name,
                    test_definitions,
                    &transformation_ids,
                );
            }
            for attachment in &transformation.table_tests {
                let node_id = format!("test:{host_id}.{}", attachment.name);
                graph.add_node(&node_id, NodeKind::Test);
                self.wire_test(
                    graph,
                    &node_id,
                    host_id,
                    None,
                    None,
                    &attachment.name,
                    test_definitions,
                    &transformation_ids,
                );
            }
        }

        for (host_id, function) in functions {
            for attachment in &function.tests {
                let node_id = format!("test:{host_id}.{}", attachment.name);
                graph.add_node(&node_id, NodeKind::Test);
                self.wire_test(
                    graph,
                    &node_id,
                    host_id,
                    None,
                    Some(host_id.as_str()),
                    &attachment.name,
                    test_definitions,
                    &transformation_ids,
                );
            }
        }

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn wire_test(
        &self,
        graph: &mut DependencyGraph,
        node_id: &str,
        host_id: &str,
        column: Option<&str>,
        function: Option<&str>,
        test_name: &str,
        test_definitions: &IndexMap<String, TestDefinition>,
        transformation_ids: &[String],
    ) {
        // a test always depends on the entity it tests
        graph.add_edge(host_id, node_id);

        // standard registry tests depend on nothing else
        let Some(definition) = test_definitions.get(test_name) else {
            return;
        };

        // generic SQL tests also depend on whatever their substituted SQL
        // references; only the host placeholders are expanded here
        let substituted = substitute_host_placeholders(
            definition.sql(),
            if function.is_some() { None } else { Some(host_id) },
            column,
            function,
        );
        // remaining parameter placeholders are values, not references;
        // neutralize them so the SQL still parses
        let substituted = neutralize_value_placeholders(&substituted);
        let empty_schemas = std::collections::BTreeSet::new();
        let empty_functions = std::collections::BTreeSet::new();
        let ctx = QualificationContext {
            default_schema: None,
            known_schemas: &empty_schemas,
            known_functions: &empty_functions,
        };
        match self
            .analyzer
            .analyze(&substituted, Path::new(node_id), ctx)
        {
            Ok(analysis) => {
                for table_ref in &analysis.source_tables {
                    if let Some(full) =
                        self.resolver.resolve_reference(table_ref, transformation_ids)
                    {
                        if full != host_id {
                            graph.add_edge(&full, node_id);
                        }
                    }
                }
            }
            Err(e) => {
                // placeholders may remain; the host edge is already present
                warn!(test = node_id, error = %e, "could not analyze test SQL for dependencies");
            }
        }
    }
}

/// Replace only the host placeholders (`@table_name`, `{{ table_name }}`,
/// `@column_name`, `@function_name`) with the host identifiers. All other
/// placeholders are left for attachment-time binding.
pub fn substitute_host_placeholders(
    sql: &str,
    table: Option<&str>,
    column: Option<&str>,
    function: Option<&str>,
) -> String {
    static TABLE_RE: OnceLock<Regex> = OnceLock::new();
    static COLUMN_RE: OnceLock<Regex> = OnceLock::new();
    static FUNCTION_RE: OnceLock<Regex> = OnceLock::new();
    let table_re =
        TABLE_RE.get_or_init(|| Regex::new(r"@table_name|\{\{\s*table_name\s*\}\}").unwrap());
    let column_re =
        COLUMN_RE.get_or_init(|| Regex::new(r"@column_name|\{\{\s*column_name\s*\}\}").unwrap());
    let function_re = FUNCTION_RE
        .get_or_init(|| Regex::new(r"@function_name|\{\{\s*function_name\s*\}\}").unwrap());

    let mut out = sql.to_string();
    if let Some(table) = table {
        out = table_re.replace_all(&out, table).into_owned();
    }
    if let Some(column) = column {
        out = column_re.replace_all(&out, column).into_owned();
    }
    if let Some(function) = function {
        out = function_re.replace_all(&out, function).into_owned();
    }
    out
}

/// Replace value placeholders (`@param`, `@param:default`, `{{ param }}`)
/// with NULL so the test SQL parses for reference extraction
fn neutralize_value_placeholders(sql: &str) -> String {
    static AT_RE: OnceLock<Regex> = OnceLock::new();
    static JINJA_RE: OnceLock<Regex> = OnceLock::new();
    let at_re = AT_RE
        .get_or_init(|| Regex::new(r"@\w+(?:\.\w+)*(?::[^\s,;()]+)?").unwrap());
    let jinja_re = JINJA_RE.get_or_init(|| Regex::new(r"\{\{[^}]*\}\}").unwrap());

    let out = at_re.replace_all(sql, "NULL").into_owned();
    jinja_re.replace_all(&out, "NULL").into_owned()
}

/// Map a graph-construction failure into the typed error surface
pub fn dependency_error(message: impl Into<String>) -> OtscError {
    OtscError::Dependency(message.into())
}
