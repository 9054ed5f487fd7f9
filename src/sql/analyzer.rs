use core::ops::ControlFlow;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use sqlparser::ast::{
    visit_expressions, visit_expressions_mut, visit_relations, visit_relations_mut, Expr, Ident,
    ObjectName, SelectItem, SetExpr, Statement,
};
use sqlparser::dialect::{
    BigQueryDialect, Dialect, DuckDbDialect, GenericDialect, MySqlDialect, PostgreSqlDialect,
    SnowflakeDialect,
};
use sqlparser::parser::Parser;

use crate::error::{OtscError, Result};
use crate::types::{name_of, ColumnDef, TableSchema};

/// Fixed map from connection type to emitted SQL dialect
pub fn dialect_name(connection_type: &str) -> &'static str {
    match connection_type {
        "duckdb" => "duckdb",
        "postgres" | "postgresql" => "postgres",
        "snowflake" => "snowflake",
        "mysql" => "mysql",
        "bigquery" => "bigquery",
        "spark" => "spark",
        _ => "duckdb",
    }
}

fn parser_dialect(connection_type: &str) -> Box<dyn Dialect> {
    match dialect_name(connection_type) {
        "duckdb" => Box::new(DuckDbDialect {}),
        "postgres" => Box::new(PostgreSqlDialect {}),
        "snowflake" => Box::new(SnowflakeDialect {}),
        "mysql" => Box::new(MySqlDialect {}),
        "bigquery" => Box::new(BigQueryDialect {}),
        _ => Box::new(GenericDialect {}),
    }
}

/// What kind of statement the analyzed SQL is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlOperation {
    Select,
    CreateFunction,
    Other,
}

/// Result of analyzing a single SQL source
#[derive(Debug, Clone)]
pub struct SqlAnalysis {
    pub original_sql: String,
    /// Referenced tables, dot-qualification preserved, first-occurrence order
    pub source_tables: Vec<String>,
    /// Every function-call identifier; resolution against declared
    /// functions happens later, unmatched calls are dropped there
    pub source_functions: Vec<String>,
    pub operation: SqlOperation,
    /// SQL with unqualified references rewritten against the schema context
    pub resolved_sql: String,
}

/// Schema context used when rewriting unqualified references
#[derive(Debug, Clone, Copy)]
pub struct QualificationContext<'a> {
    /// Schema derived from the enclosing model file's parent directory
    pub default_schema: Option<&'a str>,
    /// Declared schemas; a dotted reference whose first component is one of
    /// these is already qualified and must not be touched
    pub known_schemas: &'a BTreeSet<String>,
    /// Fully-qualified identifiers of declared functions
    pub known_functions: &'a BTreeSet<String>,
}

/// Dialect-aware AST analysis of SQL sources
pub struct SqlAnalyzer {
    dialect: Box<dyn Dialect>,
}

impl SqlAnalyzer {
    pub fn new(connection_type: &str) -> Self {
        Self {
            dialect: parser_dialect(connection_type),
        }
    }

    /// Parse `sql` and extract references, the operation type, and a
    /// schema-qualified rendering. Extraction is purely syntactic.
    pub fn analyze(&self, sql: &str, file: &Path, ctx: QualificationContext) -> Result<SqlAnalysis> {
        let mut statements = self.parse(sql, file)?;

        let operation = match statements.first() {
            Some(Statement::Query(_)) => SqlOperation::Select,
            Some(Statement::CreateFunction { .. }) => SqlOperation::CreateFunction,
            _ => SqlOperation::Other,
        };

        // CTE names are local aliases, not table references
        let cte_names = collect_cte_names(&statements);

        let mut source_tables: Vec<String> = Vec::new();
        let _ = visit_relations(&statements, |relation: &ObjectName| {
            let name = object_name_to_string(relation);
            if !cte_names.contains(&name) && !source_tables.contains(&name) {
                source_tables.push(name);
            }
            ControlFlow::<()>::Continue(())
        });

        let mut source_functions: Vec<String> = Vec::new();
        let _ = visit_expressions(&statements, |expr: &Expr| {
            if let Expr::Function(func) = expr {
                let name = object_name_to_string(&func.name);
                if !source_functions.contains(&name) {
                    source_functions.push(name);
                }
            }
            ControlFlow::<()>::Continue(())
        });

        self.qualify(&mut statements, &cte_names, ctx);
        let resolved_sql = statements
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .join(";\n");

        Ok(SqlAnalysis {
            original_sql: sql.to_string(),
            source_tables,
            source_functions,
            operation,
            resolved_sql,
        })
    }

    /// Rewrite unqualified table and function references in place.
    /// References that already carry a dot are left intact, which prevents
    /// double qualification.
    fn qualify(
        &self,
        statements: &mut Vec<Statement>,
        cte_names: &BTreeSet<String>,
        ctx: QualificationContext,
    ) {
        if let Some(schema) = ctx.default_schema {
            let _ = visit_relations_mut(statements, |relation: &mut ObjectName| {
                if relation.0.len() == 1 {
                    let bare = relation.0[0].value.clone();
                    if !cte_names.contains(&bare) {
                        relation.0.insert(0, Ident::new(schema));
                    }
                }
                ControlFlow::<()>::Continue(())
            });
        }

        let _ = visit_expressions_mut(statements, |expr: &mut Expr| {
            if let Expr::Function(func) = expr {
                if func.name.0.len() == 1 {
                    let bare = func.name.0[0].value.clone();
                    if let Some(full) = unique_function_match(&bare, ctx.known_functions) {
                        func.name = ObjectName(
                            full.split('.').map(Ident::new).collect::<Vec<_>>(),
                        );
                    }
                }
            }
            ControlFlow::<()>::Continue(())
        });
    }

    /// Infer a table schema from the SELECT projection of `sql`.
    /// Returns None when the SQL is not a plain SELECT or nothing useful
    /// can be read off the projection.
    pub fn infer_schema(&self, sql: &str) -> Option<TableSchema> {
        let statements = Parser::parse_sql(&*self.dialect, sql).ok()?;
        let query = match statements.first() {
            Some(Statement::Query(query)) => query,
            _ => return None,
        };
        let select = match query.body.as_ref() {
            SetExpr::Select(select) => select,
            _ => return None,
        };

        let mut columns = Vec::new();
        for item in &select.projection {
            let (name, expr) = match item {
                SelectItem::ExprWithAlias { expr, alias } => (alias.value.clone(), expr),
                SelectItem::UnnamedExpr(expr) => (projected_name(expr)?, expr),
                _ => continue, // wildcards carry no column information
            };
            if name == "*" || name.is_empty() {
                continue;
            }
            columns.push(ColumnDef {
                name,
                datatype: infer_datatype(expr).to_string(),
                description: None,
                tests: Vec::new(),
            });
        }

        if columns.is_empty() {
            None
        } else {
            Some(TableSchema {
                columns,
                partitioning: Vec::new(),
                indexes: Vec::new(),
            })
        }
    }

    fn parse(&self, sql: &str, file: &Path) -> Result<Vec<Statement>> {
        Parser::parse_sql(&*self.dialect, sql).map_err(|e| OtscError::SqlParse {
            file: PathBuf::from(file),
            message: e.to_string(),
        })
    }
}

fn object_name_to_string(name: &ObjectName) -> String {
    name.0
        .iter()
        .map(|ident| ident.value.clone())
        .collect::<Vec<_>>()
        .join(".")
}

/// CTE names from top-level WITH clauses
fn collect_cte_names(statements: &[Statement]) -> BTreeSet<String> {
    let mut names = BTreeSet::new();
    for statement in statements {
        if let Statement::Query(query) = statement {
            if let Some(with) = &query.with {
                for cte in &with.cte_tables {
                    names.insert(cte.alias.name.value.clone());
                }
            }
        }
    }
    names
}

/// A bare function reference resolves only when exactly one declared
/// function has that name as its last segment.
fn unique_function_match(bare: &str, known_functions: &BTreeSet<String>) -> Option<String> {
    let mut matches = known_functions
        .iter()
        .filter(|full| name_of(full) == bare);
    let first = matches.next()?;
    if matches.next().is_some() {
        return None;
    }
    Some(first.clone())
}

fn projected_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.clone()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.clone()),
        Expr::Cast { expr, .. } => projected_name(expr),
        Expr::Function(func) => Some(object_name_to_string(&func.name)),
        _ => Some(expr.to_string()),
    }
}

/// Datatype heuristics over the rendered expression, substring-based
fn infer_datatype(expr: &Expr) -> &'static str {
    let rendered = match expr {
        Expr::Cast { data_type, .. } => data_type.to_string(),
        other => other.to_string(),
    };
    infer_datatype_from_str(&rendered)
}

pub fn infer_datatype_from_str(sql_type: &str) -> &'static str {
    let upper = sql_type.to_uppercase();
    if ["TEXT", "VARCHAR", "CHAR", "STRING"].iter().any(|t| upper.contains(t)) {
        "string"
    } else if ["INT", "BIGINT", "SMALLINT", "INTEGER"].iter().any(|t| upper.contains(t)) {
        "number"
    } else if ["FLOAT", "DOUBLE", "DECIMAL", "NUMERIC"].iter().any(|t| upper.contains(t)) {
        "number"
    } else if ["DATE", "TIMESTAMP", "TIME"].iter().any(|t| upper.contains(t)) {
        "date"
    } else if upper.contains("BOOL") {
        "boolean"
    } else {
        "string"
    }
}
