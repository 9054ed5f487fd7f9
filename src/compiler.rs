//! Compilation orchestrator. Drives the fixed pipeline: parse first-party
//! entities, load imported modules, detect conflicts, merge, build the
//! dependency graph and its renderings, emit per-schema portable modules
//! and the merged test library, then revalidate every emitted module by
//! re-importing it.

use indexmap::IndexMap;
use serde_json::Value;
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

use crate::analysis::{DependencyGraph, DependencyGraphBuilder, GraphArtifact};
use crate::config::{modules_output_folder, output_folder, ProjectConfig};
use crate::discovery::{FileDiscovery, FileRole, SourceFile, SourceLanguage};
use crate::error::{OtscError, Result};
use crate::ots::module::OtsModule;
use crate::ots::{
    validate_module_location, ModuleEmitter, OtsConverter, OtsModuleReader, OutputFormat,
    TestLibraryMerger,
};
use crate::report::ReportGenerator;
use crate::resolve::NameResolver;
use crate::script::{Declaration, ScriptExtractor};
use crate::sql::analyzer::{dialect_name, QualificationContext, SqlAnalyzer};
use crate::sql::substitution::{substitute_sql_variables, validate_sql_variables, Variables};
use crate::testing::{self, ProjectTest, TestDefinition};
use crate::types::{
    Function, FunctionKind, FunctionParameter, IncrementalStrategy, Materialization, Provenance,
    SqlCode, TableSchema, TestAttachment, Transformation,
};

/// Outcome of a full compilation
#[derive(Debug)]
pub struct CompilationResult {
    pub parsed_model_count: usize,
    pub parsed_function_count: usize,
    pub imported_count: usize,
    pub total_transformations: usize,
    pub module_count: usize,
    pub exported_paths: IndexMap<String, PathBuf>,
    pub test_library_path: Option<PathBuf>,
    pub output_folder: PathBuf,
    pub graph: GraphArtifact,
    pub execution_order: Vec<String>,
}

/// Compiles a project directory into portable modules
pub struct Compiler {
    project_root: PathBuf,
    config: ProjectConfig,
    variables: Variables,
    analyzer: SqlAnalyzer,
    resolver: NameResolver,
    discovery: FileDiscovery,

    // intermediate caches, cleared together by refresh()
    parsed_models: Option<IndexMap<String, Transformation>>,
    parsed_functions: Option<IndexMap<String, Function>>,
    project_tests: Option<IndexMap<String, ProjectTest>>,
    graph: Option<DependencyGraph>,
}

impl Compiler {
    pub fn new(project_root: impl Into<PathBuf>, config: ProjectConfig) -> Self {
        let project_root = project_root.into();
        let variables = config.variable_map();
        let analyzer = SqlAnalyzer::new(&config.connection.connection_type);
        Self {
            discovery: FileDiscovery::new(&project_root),
            resolver: NameResolver::new(),
            analyzer,
            variables,
            config,
            project_root,
            parsed_models: None,
            parsed_functions: None,
            project_tests: None,
            graph: None,
        }
    }

    /// Build a compiler from the project's project.toml
    pub fn load(project_root: impl Into<PathBuf>) -> Result<Self> {
        let project_root = project_root.into();
        let config = ProjectConfig::load(&project_root)?;
        Ok(Self::new(project_root, config))
    }

    /// Override the variable map (CLI-provided variables win over config)
    pub fn with_variables(mut self, variables: Variables) -> Self {
        for (key, value) in variables {
            self.variables.insert(key, value);
        }
        self
    }

    /// Clear every cached layer; the next call re-parses everything
    pub fn refresh(&mut self) {
        self.parsed_models = None;
        self.parsed_functions = None;
        self.project_tests = None;
        self.graph = None;
    }

    // -- parsing ------------------------------------------------------------

    /// Parse all first-party functions. A bad file is logged and skipped.
    pub fn parse_functions(&mut self) -> Result<&IndexMap<String, Function>> {
        if self.parsed_functions.is_none() {
            let discovered = self.discovery.discover()?;
            let functions = self.parse_function_files(&discovered.functions)?;
            info!(count = functions.len(), "parsed functions");
            self.parsed_functions = Some(functions);
        }
        Ok(self.parsed_functions.as_ref().unwrap())
    }

    /// Parse all first-party models. A bad file is logged and skipped.
    pub fn parse_models(&mut self) -> Result<&IndexMap<String, Transformation>> {
        if self.parsed_models.is_none() {
            self.parse_functions()?;
            let discovered = self.discovery.discover()?;
            let known_functions: BTreeSet<String> = self
                .parsed_functions
                .as_ref()
                .map(|f| f.keys().cloned().collect())
                .unwrap_or_default();
            let models = self.parse_model_files(&discovered.models, &known_functions)?;
            info!(count = models.len(), "parsed models");
            self.parsed_models = Some(models);
        }
        Ok(self.parsed_models.as_ref().unwrap())
    }

    /// Discover the data-quality tests declared under tests/
    pub fn discover_tests(&mut self) -> Result<&IndexMap<String, ProjectTest>> {
        if self.project_tests.is_none() {
            let discovered = self.discovery.discover()?;
            let mut tests: IndexMap<String, ProjectTest> = IndexMap::new();
            let extractor = ScriptExtractor::new(&self.variables);

            for source in &discovered.tests {
                match source.language {
                    SourceLanguage::Sql => {
                        let Some(test) = self.read_sql_test(source, &extractor) else {
                            continue;
                        };
                        if tests.contains_key(&test.name) {
                            warn!(
                                test = test.name.as_str(),
                                file = %source.path.display(),
                                "duplicate test name, later definition kept"
                            );
                        }
                        tests.insert(test.name.clone(), test);
                    }
                    SourceLanguage::Script => {
                        let content = match std::fs::read_to_string(&source.path) {
                            Ok(content) => content,
                            Err(e) => {
                                warn!(file = %source.path.display(), error = %e, "skipping unreadable test file");
                                continue;
                            }
                        };
                        match extractor.extract(&source.path, &content) {
                            Ok(declarations) => {
                                for decl in declarations {
                                    if let Declaration::Test(t) = decl {
                                        if tests.contains_key(&t.name) {
                                            warn!(
                                                test = t.name.as_str(),
                                                file = %source.path.display(),
                                                "duplicate test name, later definition kept"
                                            );
                                        }
                                        tests.insert(
                                            t.name.clone(),
                                            ProjectTest {
                                                name: t.name,
                                                sql: t.sql,
                                                severity: t.severity,
                                                description: t.description,
                                                tags: t.tags,
                                                source: source.path.clone(),
                                            },
                                        );
                                    }
                                }
                            }
                            Err(e) => {
                                error!(file = %source.path.display(), error = %e, "skipping test file");
                            }
                        }
                    }
                }
            }

            info!(count = tests.len(), "discovered tests");
            self.project_tests = Some(tests);
        }
        Ok(self.project_tests.as_ref().unwrap())
    }

    // -- pipeline -----------------------------------------------------------

    /// Run the full compilation in the fixed step order.
    pub fn compile(&mut self, format: OutputFormat) -> Result<CompilationResult> {
        info!(project = %self.project_root.display(), "starting compilation");
        let models_folder = self.project_root.join(FileRole::Model.folder());
        let output = output_folder(&self.project_root);
        let modules_output = modules_output_folder(&self.project_root);

        // Step 1: first-party entities
        self.parse_functions()?;
        self.parse_models()?;
        self.discover_tests()?;
        let first_party_models = self.parsed_models.clone().unwrap_or_default();
        let first_party_functions = self.parsed_functions.clone().unwrap_or_default();
        let project_tests = self.project_tests.clone().unwrap_or_default();

        // Step 2: imported modules
        let discovered = self.discovery.discover()?;
        let reader = OtsModuleReader::new();
        let converter = OtsConverter::new();
        let mut imported_modules: Vec<(OtsModule, PathBuf)> = Vec::new();
        let mut imported_transformations: IndexMap<String, Transformation> = IndexMap::new();
        let mut imported_functions: IndexMap<String, Function> = IndexMap::new();
        let mut imported_duplicates: Vec<String> = Vec::new();

        for module_path in &discovered.imported_modules {
            let module = reader.read_module(module_path)?;
            validate_module_location(
                &module,
                module_path,
                &models_folder,
                self.config.strict_module_location,
            )?;
            let (transformations, functions) = converter.convert_module(&module, module_path)?;
            for (id, transformation) in transformations {
                if imported_transformations.insert(id.clone(), transformation).is_some() {
                    imported_duplicates.push(id);
                }
            }
            for (id, function) in functions {
                if imported_functions.insert(id.clone(), function).is_some() {
                    imported_duplicates.push(id);
                }
            }
            info!(
                module = %module.module_name,
                file = %module_path.display(),
                "loaded imported module"
            );
            imported_modules.push((module, module_path.clone()));
        }
        if !imported_duplicates.is_empty() {
            return Err(OtscError::compilation(
                format!(
                    "duplicate identifiers across imported modules: {}",
                    imported_duplicates.join(", ")
                ),
                imported_duplicates,
            ));
        }

        // Step 3: conflicts between first-party and imported identifiers
        let mut conflicts: Vec<String> = first_party_models
            .keys()
            .filter(|id| imported_transformations.contains_key(*id))
            .cloned()
            .collect();
        conflicts.extend(
            first_party_functions
                .keys()
                .filter(|id| imported_functions.contains_key(*id))
                .cloned(),
        );
        if !conflicts.is_empty() {
            return Err(OtscError::compilation(
                format!(
                    "duplicate identifiers in both first-party sources and imported modules: {}",
                    conflicts.join(", ")
                ),
                conflicts,
            ));
        }

        // Step 4: merge
        let mut all_models = first_party_models.clone();
        all_models.extend(imported_transformations.clone());
        let mut all_functions = first_party_functions.clone();
        all_functions.extend(imported_functions.clone());
        info!(
            first_party = first_party_models.len(),
            imported = imported_transformations.len(),
            total = all_models.len(),
            "merged transformations"
        );

        // resolve references now that the full entity map is known
        self.resolve_entity_references(&mut all_models, &mut all_functions);

        // Step 5: dependency graph and analysis artifacts
        let test_definitions = classify_tests(&project_tests);
        let builder = DependencyGraphBuilder::new(&self.analyzer, &self.resolver);
        let graph = builder
            .build(&all_models, &all_functions, &test_definitions)
            .map_err(|e| OtscError::Dependency(e.to_string()))?;
        let artifact = graph.to_artifact();
        if !artifact.cycles.is_empty() {
            for cycle in &artifact.cycles {
                error!(cycle = %cycle.join(" -> "), "circular dependency detected");
            }
        }
        self.graph = Some(graph);

        let function_ids: HashSet<String> = all_functions.keys().cloned().collect();
        let reports = ReportGenerator::new(&output);
        reports.write_all(&artifact, &function_ids)?;
        reports.write_parsed_models(&all_models)?;

        // Step 6/7: test library, then per-schema modules referencing it
        let merger = TestLibraryMerger::new(self.config.project_name(&self.project_root));
        let first_party_library = merger.build_first_party(&project_tests);
        let imported_libraries = merger.collect_imported(&imported_modules, &self.project_root);
        let (merged_library, library_conflicts) =
            merger.merge(first_party_library, imported_libraries);
        if !library_conflicts.is_empty() {
            warn!(
                conflicts = %library_conflicts.join(", "),
                "test conflicts resolved, first-party definitions kept"
            );
        }
        let test_library_path = merger.write(&merged_library, &modules_output, format)?;
        let test_library_file = test_library_path
            .as_ref()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().to_string());

        let emitter = ModuleEmitter::new(
            self.config.database_name(&self.project_root),
            dialect_name(&self.config.connection.connection_type),
            self.config.module_tags(),
            &self.analyzer,
        );
        let modules =
            emitter.build_modules(&all_models, &all_functions, test_library_file.as_deref());
        let exported_paths = emitter.emit_modules(&modules, &modules_output, format)?;
        info!(count = exported_paths.len(), "modules exported");

        // Step 8: revalidate emitted modules by re-importing them
        for (module_name, path) in &exported_paths {
            let reread = reader.read_module(path).map_err(|e| {
                OtscError::compilation(
                    format!("revalidation failed for module {module_name}: {e}"),
                    vec![module_name.clone()],
                )
            })?;
            converter.convert_module(&reread, path).map_err(|e| {
                OtscError::compilation(
                    format!("revalidation failed for module {module_name}: {e}"),
                    vec![module_name.clone()],
                )
            })?;
        }

        self.warn_unused_tests(&project_tests, &test_definitions, &all_models, &all_functions);

        Ok(CompilationResult {
            parsed_model_count: first_party_models.len(),
            parsed_function_count: first_party_functions.len(),
            imported_count: imported_transformations.len(),
            total_transformations: all_models.len(),
            module_count: modules.len(),
            exported_paths,
            test_library_path,
            output_folder: modules_output,
            execution_order: artifact.execution_order.clone(),
            graph: artifact,
        })
    }

    /// Execution order from the last compilation's graph, building the
    /// first-party graph on demand
    pub fn execution_order(&mut self) -> Result<Vec<String>> {
        Ok(self.ensure_graph()?.execution_order())
    }

    pub fn dependencies_of(&mut self, id: &str) -> Result<Vec<String>> {
        Ok(self.ensure_graph()?.dependencies_of(id))
    }

    pub fn dependents_of(&mut self, id: &str) -> Result<Vec<String>> {
        Ok(self.ensure_graph()?.dependents_of(id))
    }

    fn ensure_graph(&mut self) -> Result<&DependencyGraph> {
        if self.graph.is_none() {
            self.parse_models()?;
            self.discover_tests()?;
            let mut models = self.parsed_models.clone().unwrap_or_default();
            let mut functions = self.parsed_functions.clone().unwrap_or_default();
            self.resolve_entity_references(&mut models, &mut functions);
            let tests = classify_tests(self.project_tests.as_ref().unwrap());
            let builder = DependencyGraphBuilder::new(&self.analyzer, &self.resolver);
            let graph = builder.build(&models, &functions, &tests)?;
            self.graph = Some(graph);
        }
        Ok(self.graph.as_ref().unwrap())
    }

    // -- reference resolution -----------------------------------------------

    /// Qualify entity references against the merged entity map. Known
    /// references become fully-qualified; unknown references stay as
    /// written (external sources are never silently dropped). Bare
    /// function calls that match no declared function are built-ins and
    /// fall away.
    fn resolve_entity_references(
        &self,
        models: &mut IndexMap<String, Transformation>,
        functions: &mut IndexMap<String, Function>,
    ) {
        let model_ids: Vec<String> = models.keys().cloned().collect();
        let function_ids: Vec<String> = functions.keys().cloned().collect();

        for transformation in models.values_mut() {
            if transformation.imported {
                continue;
            }
            transformation.code.source_tables = transformation
                .code
                .source_tables
                .iter()
                .map(|r| {
                    self.resolver
                        .resolve_reference(r, &model_ids)
                        .unwrap_or_else(|| r.clone())
                })
                .filter(|r| r != &transformation.id)
                .collect();
            transformation.code.source_functions = transformation
                .code
                .source_functions
                .iter()
                .filter_map(|r| match self.resolver.resolve_reference(r, &function_ids) {
                    Some(full) => Some(full),
                    None if r.contains('.') => Some(r.clone()),
                    None => None,
                })
                .collect();
        }

        for function in functions.values_mut() {
            if function.imported {
                continue;
            }
            let id = function.id.clone();
            function.code.source_tables = function
                .code
                .source_tables
                .iter()
                .map(|r| {
                    self.resolver
                        .resolve_reference(r, &model_ids)
                        .unwrap_or_else(|| r.clone())
                })
                .collect();
            function.code.source_functions = function
                .code
                .source_functions
                .iter()
                .filter_map(|r| match self.resolver.resolve_reference(r, &function_ids) {
                    Some(full) if full != id => Some(full),
                    Some(_) => None,
                    None if r.contains('.') => Some(r.clone()),
                    None => None,
                })
                .collect();
        }
    }

    // -- file parsing -------------------------------------------------------

    fn parse_model_files(
        &self,
        sources: &[SourceFile],
        known_functions: &BTreeSet<String>,
    ) -> Result<IndexMap<String, Transformation>> {
        let models_folder = self.project_root.join(FileRole::Model.folder());
        let known_schemas = self.discovery.known_schemas();
        let extractor = ScriptExtractor::new(&self.variables);
        let mut models: IndexMap<String, Transformation> = IndexMap::new();
        let mut duplicates: Vec<String> = Vec::new();

        for source in sources {
            match source.language {
                SourceLanguage::Sql => {
                    match self.parse_sql_model(
                        source,
                        &models_folder,
                        &known_schemas,
                        known_functions,
                        &extractor,
                    ) {
                        Ok(Some(transformation)) => {
                            insert_model(&mut models, transformation, &mut duplicates);
                        }
                        Ok(None) => {}
                        Err(e) => {
                            error!(file = %source.path.display(), error = %e, "skipping model file");
                        }
                    }
                }
                SourceLanguage::Script => {
                    let content = match std::fs::read_to_string(&source.path) {
                        Ok(content) => content,
                        Err(e) => {
                            warn!(file = %source.path.display(), error = %e, "skipping unreadable model file");
                            continue;
                        }
                    };
                    let declarations = match extractor.extract(&source.path, &content) {
                        Ok(declarations) => declarations,
                        Err(e) => {
                            error!(file = %source.path.display(), error = %e, "skipping model file");
                            continue;
                        }
                    };
                    for decl in declarations {
                        match decl {
                            Declaration::Model(model) => {
                                match self.build_script_model(
                                    source,
                                    &models_folder,
                                    &known_schemas,
                                    known_functions,
                                    model,
                                ) {
                                    Ok(transformation) => {
                                        insert_model(&mut models, transformation, &mut duplicates);
                                    }
                                    Err(e) => {
                                        error!(file = %source.path.display(), error = %e, "skipping model declaration");
                                    }
                                }
                            }
                            Declaration::Function(_) => {
                                warn!(
                                    file = %source.path.display(),
                                    "function declared under models/, move it to functions/"
                                );
                            }
                            Declaration::Test(_) => {
                                warn!(
                                    file = %source.path.display(),
                                    "test declared under models/, move it to tests/"
                                );
                            }
                        }
                    }
                }
            }
        }

        if !duplicates.is_empty() {
            duplicates.sort();
            duplicates.dedup();
            return Err(OtscError::compilation(
                format!(
                    "duplicate transformation identifiers in project sources: {}",
                    duplicates.join(", ")
                ),
                duplicates,
            ));
        }
        Ok(models)
    }

    fn parse_sql_model(
        &self,
        source: &SourceFile,
        models_folder: &Path,
        known_schemas: &BTreeSet<String>,
        known_functions: &BTreeSet<String>,
        extractor: &ScriptExtractor,
    ) -> Result<Option<Transformation>> {
        let raw_sql = std::fs::read_to_string(&source.path).map_err(|e| OtscError::SqlParse {
            file: source.path.clone(),
            message: format!("could not read file: {e}"),
        })?;
        if raw_sql.trim().is_empty() {
            debug!(file = %source.path.display(), "skipping empty SQL file");
            return Ok(None);
        }

        let metadata = match &source.companion {
            Some(companion) => {
                let content =
                    std::fs::read_to_string(companion).map_err(|e| OtscError::ScriptParse {
                        file: companion.clone(),
                        message: format!("could not read companion file: {e}"),
                    })?;
                extractor.extract_companion_metadata(companion, &content)?
            }
            None => serde_json::Map::new(),
        };

        let id = self
            .resolver
            .qualified_name(&source.path, models_folder)?;
        let transformation = self.build_transformation(
            &id,
            &raw_sql,
            &source.path,
            models_folder,
            known_schemas,
            known_functions,
            &metadata,
            metadata
                .get("description")
                .and_then(|v| v.as_str())
                .map(String::from),
        )?;
        Ok(Some(transformation))
    }

    fn build_script_model(
        &self,
        source: &SourceFile,
        models_folder: &Path,
        known_schemas: &BTreeSet<String>,
        known_functions: &BTreeSet<String>,
        model: crate::script::ModelDecl,
    ) -> Result<Transformation> {
        let id =
            self.resolver
                .qualified_name_for(&source.path, models_folder, &model.table_name)?;
        self.build_transformation(
            &id,
            &model.sql,
            &source.path,
            models_folder,
            known_schemas,
            known_functions,
            &model.metadata,
            model.description,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn build_transformation(
        &self,
        id: &str,
        raw_sql: &str,
        path: &Path,
        models_folder: &Path,
        known_schemas: &BTreeSet<String>,
        known_functions: &BTreeSet<String>,
        metadata: &serde_json::Map<String, Value>,
        description: Option<String>,
    ) -> Result<Transformation> {
        // variable substitution happens before analysis; defaults expand
        // even with an empty map, and a missing required variable is
        // fatal for this file
        validate_sql_variables(raw_sql, &self.variables)?;
        let sql = substitute_sql_variables(raw_sql, &self.variables);

        let default_schema = self.resolver.schema_for(path, models_folder)?;
        let ctx = QualificationContext {
            default_schema: default_schema.as_deref(),
            known_schemas,
            known_functions,
        };
        let analysis = self.analyzer.analyze(&sql, path, ctx)?;

        let declared_schema = schema_from_metadata(metadata);
        let table_tests = attachments_from_value(metadata.get("tests"));
        check_attachments(id, declared_schema.as_ref(), &table_tests);

        Ok(Transformation {
            id: id.to_string(),
            code: SqlCode {
                original_sql: sql,
                resolved_sql: analysis.resolved_sql,
                source_tables: analysis.source_tables,
                source_functions: analysis.source_functions,
            },
            materialization: materialization_from_metadata(metadata),
            declared_schema,
            table_tests,
            description,
            tags: string_list(metadata.get("tags")),
            object_tags: metadata
                .get("object_tags")
                .and_then(|v| v.as_object())
                .cloned()
                .unwrap_or_default(),
            provenance: Provenance::new(path, raw_sql),
            imported: false,
        })
    }

    fn parse_function_files(
        &self,
        sources: &[SourceFile],
    ) -> Result<IndexMap<String, Function>> {
        let functions_folder = self.project_root.join(FileRole::Function.folder());
        let extractor = ScriptExtractor::new(&self.variables);
        let mut functions: IndexMap<String, Function> = IndexMap::new();
        let mut duplicates: Vec<String> = Vec::new();

        for source in sources {
            match source.language {
                SourceLanguage::Sql => {
                    match self.parse_sql_function(source, &functions_folder, &extractor) {
                        Ok(Some(function)) => {
                            insert_function(&mut functions, function, &mut duplicates);
                        }
                        Ok(None) => {}
                        Err(e) => {
                            error!(file = %source.path.display(), error = %e, "skipping function file");
                        }
                    }
                }
                SourceLanguage::Script => {
                    let content = match std::fs::read_to_string(&source.path) {
                        Ok(content) => content,
                        Err(e) => {
                            warn!(file = %source.path.display(), error = %e, "skipping unreadable function file");
                            continue;
                        }
                    };
                    let declarations = match extractor.extract(&source.path, &content) {
                        Ok(declarations) => declarations,
                        Err(e) => {
                            error!(file = %source.path.display(), error = %e, "skipping function file");
                            continue;
                        }
                    };
                    for decl in declarations {
                        if let Declaration::Function(f) = decl {
                            match self.build_function(
                                &source.path,
                                &functions_folder,
                                f.sql,
                                f.language,
                                &f.metadata,
                            ) {
                                Ok(function) => {
                                    insert_function(&mut functions, function, &mut duplicates);
                                }
                                Err(e) => {
                                    error!(file = %source.path.display(), error = %e, "skipping function declaration");
                                }
                            }
                        }
                    }
                }
            }
        }

        if !duplicates.is_empty() {
            duplicates.sort();
            duplicates.dedup();
            return Err(OtscError::compilation(
                format!(
                    "duplicate function identifiers in project sources: {}",
                    duplicates.join(", ")
                ),
                duplicates,
            ));
        }
        Ok(functions)
    }

    fn parse_sql_function(
        &self,
        source: &SourceFile,
        functions_folder: &Path,
        extractor: &ScriptExtractor,
    ) -> Result<Option<Function>> {
        let sql = std::fs::read_to_string(&source.path).map_err(|e| OtscError::SqlParse {
            file: source.path.clone(),
            message: format!("could not read file: {e}"),
        })?;
        if sql.trim().is_empty() {
            return Ok(None);
        }

        let metadata = match &source.companion {
            Some(companion) => {
                let content =
                    std::fs::read_to_string(companion).map_err(|e| OtscError::ScriptParse {
                        file: companion.clone(),
                        message: format!("could not read companion file: {e}"),
                    })?;
                extractor.extract_companion_metadata(companion, &content)?
            }
            None => serde_json::Map::new(),
        };

        self.build_function(
            &source.path,
            functions_folder,
            sql,
            metadata
                .get("language")
                .and_then(|v| v.as_str())
                .unwrap_or("sql")
                .to_string(),
            &metadata,
        )
        .map(Some)
    }

    fn build_function(
        &self,
        path: &Path,
        functions_folder: &Path,
        sql: String,
        language: String,
        metadata: &serde_json::Map<String, Value>,
    ) -> Result<Function> {
        let function_name = metadata
            .get("function_name")
            .and_then(|v| v.as_str())
            .map(String::from)
            .or_else(|| {
                path.file_stem()
                    .and_then(|s| s.to_str())
                    .map(String::from)
            })
            .ok_or_else(|| OtscError::TableResolution {
                file: path.to_path_buf(),
                message: "function has no name".to_string(),
            })?;
        let id = self.resolver.function_name(
            path,
            functions_folder,
            metadata.get("schema").and_then(|v| v.as_str()),
            &function_name,
        )?;

        // extract references from the body; resolution happens at graph
        // build time against the full entity map
        let default_schema = self.resolver.schema_for(path, functions_folder)?;
        let known_schemas = self.discovery.known_schemas();
        let empty_functions = BTreeSet::new();
        let ctx = QualificationContext {
            default_schema: default_schema.as_deref(),
            known_schemas: &known_schemas,
            known_functions: &empty_functions,
        };
        let (resolved_sql, source_tables, source_functions) =
            match self.analyzer.analyze(&sql, path, ctx) {
                Ok(analysis) => (
                    analysis.resolved_sql,
                    analysis.source_tables,
                    analysis.source_functions,
                ),
                Err(e) => {
                    // non-SQL function bodies keep their code verbatim
                    debug!(file = %path.display(), error = %e, "function body not analyzable as SQL");
                    (sql.clone(), Vec::new(), Vec::new())
                }
            };

        let parameters: Vec<FunctionParameter> = metadata
            .get("parameters")
            .and_then(|v| v.as_array())
            .map(|params| {
                params
                    .iter()
                    .filter_map(|p| serde_json::from_value(p.clone()).ok())
                    .collect()
            })
            .unwrap_or_default();

        let return_table_schema = metadata
            .get("return_table_schema")
            .and_then(|v| serde_json::from_value::<TableSchema>(v.clone()).ok());

        Ok(Function {
            id,
            kind: metadata
                .get("function_type")
                .and_then(|v| v.as_str())
                .map(FunctionKind::parse)
                .unwrap_or(FunctionKind::Scalar),
            language,
            code: SqlCode {
                original_sql: sql.clone(),
                resolved_sql,
                source_tables,
                source_functions,
            },
            parameters,
            return_type: metadata
                .get("return_type")
                .and_then(|v| v.as_str())
                .map(String::from),
            return_table_schema,
            deterministic: metadata
                .get("deterministic")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
            tests: attachments_from_value(metadata.get("tests")),
            description: metadata
                .get("description")
                .and_then(|v| v.as_str())
                .map(String::from),
            tags: string_list(metadata.get("tags")),
            object_tags: metadata
                .get("object_tags")
                .and_then(|v| v.as_object())
                .cloned()
                .unwrap_or_default(),
            provenance: Provenance::new(path, &sql),
            imported: false,
        })
    }

    fn read_sql_test(
        &self,
        source: &SourceFile,
        extractor: &ScriptExtractor,
    ) -> Option<ProjectTest> {
        let sql = match std::fs::read_to_string(&source.path) {
            Ok(sql) => sql,
            Err(e) => {
                warn!(file = %source.path.display(), error = %e, "skipping unreadable test file");
                return None;
            }
        };
        if sql.trim().is_empty() {
            return None;
        }

        let stem = source.path.file_stem()?.to_str()?.to_string();
        let mut test = ProjectTest {
            name: stem,
            sql,
            severity: crate::types::Severity::Error,
            description: None,
            tags: Vec::new(),
            source: source.path.clone(),
        };

        // same-stem script carries the test metadata
        if let Some(companion) = &source.companion {
            if let Ok(content) = std::fs::read_to_string(companion) {
                if let Ok(metadata) = extractor.extract_companion_metadata(companion, &content) {
                    if let Some(name) = metadata.get("name").and_then(|v| v.as_str()) {
                        test.name = name.to_string();
                    }
                    if let Some(severity) = metadata.get("severity").and_then(|v| v.as_str()) {
                        test.severity = crate::types::Severity::parse(severity);
                    }
                    if let Some(description) =
                        metadata.get("description").and_then(|v| v.as_str())
                    {
                        test.description = Some(description.to_string());
                    }
                    test.tags = string_list(metadata.get("tags"));
                }
            }
        }
        Some(test)
    }

    /// Generic tests defined under tests/ but never attached anywhere are
    /// reported as non-fatal diagnostics.
    fn warn_unused_tests(
        &self,
        project_tests: &IndexMap<String, ProjectTest>,
        definitions: &IndexMap<String, TestDefinition>,
        models: &IndexMap<String, Transformation>,
        functions: &IndexMap<String, Function>,
    ) {
        let mut referenced: HashSet<&str> = HashSet::new();
        for transformation in models.values() {
            for (_, attachment) in transformation.column_tests() {
                referenced.insert(attachment.name.as_str());
            }
            for attachment in &transformation.table_tests {
                referenced.insert(attachment.name.as_str());
            }
        }
        for function in functions.values() {
            for attachment in &function.tests {
                referenced.insert(attachment.name.as_str());
            }
        }

        for (name, definition) in definitions {
            if definition.is_generic() && !referenced.contains(name.as_str()) {
                if let Some(test) = project_tests.get(name) {
                    warn!(
                        test = name.as_str(),
                        file = %test.source.display(),
                        "generic test is never referenced by any model or function"
                    );
                }
            }
        }
    }
}

/// Classify discovered project tests into library definitions
pub fn classify_tests(
    project_tests: &IndexMap<String, ProjectTest>,
) -> IndexMap<String, TestDefinition> {
    project_tests
        .iter()
        .map(|(name, test)| (name.clone(), TestDefinition::from_project_test(test)))
        .collect()
}

fn insert_model(
    models: &mut IndexMap<String, Transformation>,
    transformation: Transformation,
    duplicates: &mut Vec<String>,
) {
    let id = transformation.id.clone();
    if models.insert(id.clone(), transformation).is_some() {
        duplicates.push(id);
    }
}

fn insert_function(
    functions: &mut IndexMap<String, Function>,
    function: Function,
    duplicates: &mut Vec<String>,
) {
    let id = function.id.clone();
    if functions.insert(id.clone(), function).is_some() {
        duplicates.push(id);
    }
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default()
}

fn attachments_from_value(value: Option<&Value>) -> Vec<TestAttachment> {
    value
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(TestAttachment::from_value)
                .collect()
        })
        .unwrap_or_default()
}

/// Warn about malformed standard-test attachments; the execution engine
/// is out of scope, so violations never abort compilation here.
fn check_attachments(entity_id: &str, schema: Option<&TableSchema>, table_tests: &[TestAttachment]) {
    if let Some(schema) = schema {
        for col in &schema.columns {
            for attachment in &col.tests {
                if testing::is_standard_test(&attachment.name) {
                    if let Err(problem) =
                        testing::validate_attachment(attachment, Some(&col.name))
                    {
                        warn!(
                            entity = entity_id,
                            column = col.name.as_str(),
                            test = attachment.name.as_str(),
                            problem = %problem, "malformed test attachment"
                        );
                    }
                }
            }
        }
    }
    for attachment in table_tests {
        if testing::is_standard_test(&attachment.name) {
            if let Err(problem) = testing::validate_attachment(attachment, None) {
                warn!(
                    entity = entity_id,
                    test = attachment.name.as_str(),
                    problem = %problem, "malformed test attachment"
                );
            }
        }
    }
}

/// Declared schema columns from metadata, with their attached tests
fn schema_from_metadata(metadata: &serde_json::Map<String, Value>) -> Option<TableSchema> {
    let columns = metadata.get("schema")?.as_array()?;
    let columns: Vec<crate::types::ColumnDef> = columns
        .iter()
        .filter_map(|col| {
            let obj = col.as_object()?;
            let name = obj.get("name")?.as_str()?.to_string();
            Some(crate::types::ColumnDef {
                name,
                datatype: obj
                    .get("datatype")
                    .and_then(|v| v.as_str())
                    .unwrap_or("string")
                    .to_string(),
                description: obj
                    .get("description")
                    .and_then(|v| v.as_str())
                    .map(String::from),
                tests: attachments_from_value(obj.get("tests")),
            })
        })
        .collect();
    if columns.is_empty() {
        return None;
    }
    Some(TableSchema {
        columns,
        partitioning: string_list(metadata.get("partitions")),
        indexes: metadata
            .get("indexes")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default(),
    })
}

/// Materialization descriptor from declaration metadata
fn materialization_from_metadata(metadata: &serde_json::Map<String, Value>) -> Materialization {
    let mat_type = metadata
        .get("materialization")
        .and_then(|v| v.as_str())
        .unwrap_or("table");
    match mat_type {
        "view" => Materialization::View,
        "scd2" => Materialization::Scd2(
            metadata
                .get("scd2_details")
                .cloned()
                .unwrap_or(Value::Null),
        ),
        "incremental" => {
            let config = metadata
                .get("incremental")
                .and_then(|v| v.as_object())
                .cloned()
                .unwrap_or_default();
            let strategy = config
                .get("strategy")
                .and_then(|v| v.as_str())
                .unwrap_or("append");
            let details = match strategy {
                "merge" => {
                    let merge = config.get("merge").and_then(|v| v.as_object());
                    IncrementalStrategy::Merge {
                        unique_key: merge
                            .and_then(|m| m.get("unique_key"))
                            .and_then(|v| v.as_array())
                            .map(|keys| {
                                keys.iter()
                                    .filter_map(|k| k.as_str().map(String::from))
                                    .collect()
                            })
                            .unwrap_or_default(),
                        update_columns: merge
                            .and_then(|m| m.get("update_columns"))
                            .and_then(|v| v.as_array())
                            .map(|cols| {
                                cols.iter()
                                    .filter_map(|c| c.as_str().map(String::from))
                                    .collect()
                            }),
                    }
                }
                "delete_insert" => IncrementalStrategy::DeleteInsert {
                    where_condition: config
                        .get("delete_insert")
                        .and_then(|v| v.get("where_condition"))
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                },
                _ => {
                    let append = config.get("append").and_then(|v| v.as_object());
                    IncrementalStrategy::Append {
                        time_column: append
                            .and_then(|a| a.get("time_column"))
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string(),
                        start_date: append
                            .and_then(|a| a.get("start_date"))
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string(),
                    }
                }
            };
            Materialization::Incremental(details)
        }
        _ => Materialization::Table,
    }
}
