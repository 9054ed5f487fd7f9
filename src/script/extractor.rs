//! Front-end parser for script declaration files.
//!
//! Script files declare entities through three shapes: decorators over
//! zero-argument callables (`@model`, `@functions.sql`, `@test`), factory
//! calls (`create_model`, `create_test`, `create_function`) including the
//! single-level loop form, and metadata declarations backed by a companion
//! SQL file (`SqlTestMetadata`, `metadata = {...}`). Each file is read in
//! isolation into a file-local declaration list; there is no shared
//! registry between files.

use serde_json::Value;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::literals::{interpolate_fstring, CallArg, Cursor, Env};
use crate::error::{OtscError, Result};
use crate::sql::substitution::Variables;
use crate::types::Severity;

const FACTORY_NAMES: [&str; 3] = ["create_model", "create_test", "create_function"];

/// A model declared by a script file
#[derive(Debug, Clone)]
pub struct ModelDecl {
    pub table_name: String,
    pub sql: String,
    pub description: Option<String>,
    /// Remaining declaration arguments: schema, tests, materialization,
    /// tags, object_tags, ...
    pub metadata: serde_json::Map<String, Value>,
}

/// A function declared by a script file
#[derive(Debug, Clone)]
pub struct FunctionDecl {
    pub sql: String,
    pub language: String,
    /// function_name, schema, function_type, parameters, return_type, ...
    pub metadata: serde_json::Map<String, Value>,
}

/// A data-quality test declared by a script file
#[derive(Debug, Clone)]
pub struct TestDecl {
    pub name: String,
    pub sql: String,
    pub severity: Severity,
    pub description: Option<String>,
    pub tags: Vec<String>,
}

/// One declaration captured from a script file
#[derive(Debug, Clone)]
pub enum Declaration {
    Model(ModelDecl),
    Function(FunctionDecl),
    Test(TestDecl),
}

impl Declaration {
    pub fn name(&self) -> &str {
        match self {
            Declaration::Model(m) => &m.table_name,
            Declaration::Function(f) => f
                .metadata
                .get("function_name")
                .and_then(|v| v.as_str())
                .unwrap_or(""),
            Declaration::Test(t) => &t.name,
        }
    }
}

/// Reads script files into file-local declaration lists
pub struct ScriptExtractor<'a> {
    variables: &'a Variables,
}

impl<'a> ScriptExtractor<'a> {
    pub fn new(variables: &'a Variables) -> Self {
        Self { variables }
    }

    /// Parse one script file. All declarations are returned; a duplicate
    /// name within the file is an error for the whole file.
    pub fn extract(&self, path: &Path, source: &str) -> Result<Vec<Declaration>> {
        let mut state = FileState::new(path);

        let mut cursor = Cursor::new(source);
        loop {
            cursor.skip_trivia();
            if cursor.at_end() {
                break;
            }
            if cursor.current_indent() > 0 {
                // stray indented line outside any recognized block
                cursor.skip_line();
                continue;
            }

            if matches!(cursor.peek(), Some('\'') | Some('"')) {
                // module docstring
                if cursor.parse_string_token().is_err() {
                    cursor.skip_line();
                }
            } else if cursor.lookahead("@") {
                self.parse_decorated(&mut cursor, &mut state)?;
            } else if cursor.lookahead("from ") || cursor.lookahead("import ") {
                cursor.skip_line();
            } else if cursor.lookahead("for ") {
                self.parse_loop(&mut cursor, &mut state)?;
            } else if cursor.lookahead("def ") || cursor.lookahead("class ") {
                skip_block(&mut cursor);
            } else {
                self.parse_statement(&mut cursor, &mut state)?;
            }
        }

        debug!(
            file = %path.display(),
            declarations = state.declarations.len(),
            "script extraction complete"
        );
        Ok(state.declarations)
    }

    /// Read the `metadata = {...}` dict from a companion script file.
    pub fn extract_companion_metadata(
        &self,
        path: &Path,
        source: &str,
    ) -> Result<serde_json::Map<String, Value>> {
        let mut state = FileState::new(path);
        let mut cursor = Cursor::new(source);
        loop {
            cursor.skip_trivia();
            if cursor.at_end() {
                break;
            }
            if cursor.current_indent() > 0
                || cursor.lookahead("from ")
                || cursor.lookahead("import ")
            {
                cursor.skip_line();
                continue;
            }
            if matches!(cursor.peek(), Some('\'') | Some('"')) {
                if cursor.parse_string_token().is_err() {
                    cursor.skip_line();
                }
                continue;
            }
            if cursor.lookahead("def ") || cursor.lookahead("class ") {
                skip_block(&mut cursor);
                continue;
            }
            // assignments only; everything else is noise here
            if self.try_assignment(&mut cursor, &mut state)?.is_none() {
                cursor.skip_line();
            }
        }

        Ok(state
            .env
            .lookup("metadata")
            .and_then(|v| v.as_object())
            .cloned()
            .unwrap_or_default())
    }

    // -- statements ---------------------------------------------------------

    fn parse_statement(&self, cursor: &mut Cursor, state: &mut FileState) -> Result<()> {
        let save = cursor.pos();
        let Some(ident) = cursor.parse_ident() else {
            cursor.skip_line();
            return Ok(());
        };
        cursor.skip_spaces();

        if FACTORY_NAMES.contains(&ident.as_str()) && cursor.peek() == Some('(') {
            let args = self.call_args(cursor, &state.env, &state.path)?;
            return self.register_factory(&ident, args, state);
        }
        if ident == "SqlTestMetadata" && cursor.peek() == Some('(') {
            let args = self.call_args(cursor, &state.env, &state.path)?;
            return self.register_sql_test_metadata(args, state);
        }

        cursor.set_pos(save);
        if self.try_assignment(cursor, state)?.is_none() {
            cursor.skip_line();
        }
        Ok(())
    }

    /// `name = <literal | factory | SqlTestMetadata>`; returns the bound name
    fn try_assignment(&self, cursor: &mut Cursor, state: &mut FileState) -> Result<Option<String>> {
        let save = cursor.pos();
        let Some(name) = cursor.parse_ident() else {
            return Ok(None);
        };
        cursor.skip_spaces();
        if !cursor.eat('=') || cursor.peek() == Some('=') {
            cursor.set_pos(save);
            return Ok(None);
        }
        cursor.skip_trivia();

        let rhs_pos = cursor.pos();
        if let Some(callee) = cursor.parse_ident() {
            cursor.skip_spaces();
            if callee == "SqlTestMetadata" && cursor.peek() == Some('(') {
                let args = self.call_args(cursor, &state.env, &state.path)?;
                self.register_sql_test_metadata(args, state)?;
                return Ok(Some(name));
            }
            if FACTORY_NAMES.contains(&callee.as_str()) && cursor.peek() == Some('(') {
                let args = self.call_args(cursor, &state.env, &state.path)?;
                self.register_factory(&callee, args, state)?;
                return Ok(Some(name));
            }
            cursor.set_pos(rhs_pos);
        }

        let value_pos = cursor.pos();
        match cursor.parse_value(&state.env) {
            Ok(value) => {
                state.env.bind(&name, value);
            }
            Err(_) => {
                // not a literal right-hand side; ignore the statement
                cursor.set_pos(value_pos);
                cursor.skip_line();
            }
        }
        Ok(Some(name))
    }

    // -- decorators ---------------------------------------------------------

    fn parse_decorated(&self, cursor: &mut Cursor, state: &mut FileState) -> Result<()> {
        let mut decorators: Vec<(String, Vec<CallArg>)> = Vec::new();
        while cursor.lookahead("@") {
            cursor.eat('@');
            let mut full = cursor
                .parse_ident()
                .ok_or_else(|| script_error(&state.path, "expected decorator name after '@'"))?;
            while cursor.eat('.') {
                let part = cursor
                    .parse_ident()
                    .ok_or_else(|| script_error(&state.path, "invalid dotted decorator name"))?;
                full.push('.');
                full.push_str(&part);
            }
            cursor.skip_spaces();
            let args = if cursor.peek() == Some('(') {
                self.call_args(cursor, &state.env, &state.path)?
            } else {
                Vec::new()
            };
            decorators.push((full, args));
            cursor.skip_trivia();
        }

        if !cursor.lookahead("def ") {
            return Err(script_error(
                &state.path,
                "decorator must be attached to a function definition",
            ));
        }
        let _ = cursor.parse_ident(); // "def"
        cursor.skip_spaces();
        let callable = cursor
            .parse_ident()
            .ok_or_else(|| script_error(&state.path, "expected function name after 'def'"))?;
        cursor.skip_spaces();
        if !cursor.eat('(') {
            return Err(script_error(&state.path, "malformed function definition"));
        }
        cursor.skip_trivia();
        if !cursor.eat(')') {
            return Err(script_error(
                &state.path,
                format!("declaration callable '{callable}' must take no arguments"),
            ));
        }
        cursor.skip_spaces();
        if !cursor.eat(':') {
            return Err(script_error(&state.path, "malformed function definition"));
        }
        cursor.skip_line();

        // the first recognized decorator claims the callable body
        let known = decorators.into_iter().find(|(name, _)| {
            matches!(
                name.as_str(),
                "model" | "test" | "functions.sql" | "functions.python"
            )
        });
        match known {
            Some((decorator, args)) => match decorator.as_str() {
                "model" => self.register_model_decorator(cursor, args, &callable, state),
                "test" => self.register_test_decorator(cursor, args, &callable, state),
                _ => {
                    let language = decorator.rsplit('.').next().unwrap_or("sql").to_string();
                    self.register_function_decorator(cursor, args, &callable, language, state)
                }
            },
            None => {
                debug!(callable = %callable, "no recognized decorator, skipping block");
                skip_body(cursor);
                Ok(())
            }
        }
    }

    fn register_model_decorator(
        &self,
        cursor: &mut Cursor,
        args: Vec<CallArg>,
        callable: &str,
        state: &mut FileState,
    ) -> Result<()> {
        let mut kwargs = kwargs_map(args, &["table_name", "description", "variables"]);
        let table_name = take_string(&mut kwargs, "table_name")
            .unwrap_or_else(|| callable.to_string());
        let description = take_string(&mut kwargs, "description");

        // variables=[...] are injected into the callable's environment,
        // bound from the project variable map
        let mut body_env = state.env.clone();
        if let Some(Value::Array(names)) = kwargs.remove("variables") {
            for name in names {
                let Some(name) = name.as_str() else { continue };
                match self.variables.get(name) {
                    Some(value) => body_env.bind(name, value.clone()),
                    None => {
                        return Err(script_error(
                            &state.path,
                            format!("model '{table_name}' requires undefined variable '{name}'"),
                        ))
                    }
                }
            }
        }

        let sql = parse_callable_body(cursor, &body_env, &state.path)?;
        state.push(Declaration::Model(ModelDecl {
            table_name,
            sql,
            description,
            metadata: kwargs,
        }))
    }

    fn register_test_decorator(
        &self,
        cursor: &mut Cursor,
        args: Vec<CallArg>,
        callable: &str,
        state: &mut FileState,
    ) -> Result<()> {
        let mut kwargs = kwargs_map(args, &["name", "severity", "description"]);
        let name = take_string(&mut kwargs, "name")
            .unwrap_or_else(|| derive_test_name(&state.path, callable));
        let sql = parse_callable_body(cursor, &state.env, &state.path)?;
        if sql.trim().is_empty() {
            return Err(script_error(
                &state.path,
                format!("test '{name}' returned an empty SQL string"),
            ));
        }
        let decl = test_decl_from_parts(name, sql, &mut kwargs);
        state.push(Declaration::Test(decl))
    }

    fn register_function_decorator(
        &self,
        cursor: &mut Cursor,
        args: Vec<CallArg>,
        callable: &str,
        language: String,
        state: &mut FileState,
    ) -> Result<()> {
        let mut metadata = kwargs_map(args, &[]);
        if !metadata.contains_key("function_name") {
            metadata.insert(
                "function_name".to_string(),
                Value::String(callable.to_string()),
            );
        }
        let sql = parse_callable_body(cursor, &state.env, &state.path)?;
        state.push(Declaration::Function(FunctionDecl {
            sql,
            language,
            metadata,
        }))
    }

    // -- factories ----------------------------------------------------------

    fn register_factory(
        &self,
        factory: &str,
        args: Vec<CallArg>,
        state: &mut FileState,
    ) -> Result<()> {
        match factory {
            "create_model" => {
                let mut kwargs = kwargs_map(args, &["table_name", "sql", "description"]);
                let table_name = take_string(&mut kwargs, "table_name").ok_or_else(|| {
                    script_error(&state.path, "create_model() requires a table_name")
                })?;
                let sql = take_string(&mut kwargs, "sql").ok_or_else(|| {
                    script_error(
                        &state.path,
                        format!("create_model('{table_name}') requires sql"),
                    )
                })?;
                let description = take_string(&mut kwargs, "description");
                kwargs.remove("variables");
                state.push(Declaration::Model(ModelDecl {
                    table_name,
                    sql,
                    description,
                    metadata: kwargs,
                }))
            }
            "create_test" => {
                let mut kwargs = kwargs_map(args, &["name", "sql"]);
                let name = take_string(&mut kwargs, "name")
                    .ok_or_else(|| script_error(&state.path, "create_test() requires a name"))?;
                let sql = take_string(&mut kwargs, "sql").ok_or_else(|| {
                    script_error(&state.path, format!("create_test('{name}') requires sql"))
                })?;
                if sql.trim().is_empty() {
                    return Err(script_error(
                        &state.path,
                        format!("create_test('{name}') has an empty sql body"),
                    ));
                }
                let decl = test_decl_from_parts(name, sql.trim().to_string(), &mut kwargs);
                state.push(Declaration::Test(decl))
            }
            "create_function" => {
                let mut kwargs = kwargs_map(args, &["function_name", "sql"]);
                let sql = take_string(&mut kwargs, "sql")
                    .ok_or_else(|| script_error(&state.path, "create_function() requires sql"))?;
                let language =
                    take_string(&mut kwargs, "language").unwrap_or_else(|| "sql".to_string());
                if !kwargs.contains_key("function_name") {
                    return Err(script_error(
                        &state.path,
                        "create_function() requires a function_name",
                    ));
                }
                state.push(Declaration::Function(FunctionDecl {
                    sql,
                    language,
                    metadata: kwargs,
                }))
            }
            _ => Ok(()),
        }
    }

    fn register_sql_test_metadata(&self, args: Vec<CallArg>, state: &mut FileState) -> Result<()> {
        let mut kwargs = kwargs_map(args, &[]);
        let name = take_string(&mut kwargs, "name")
            .ok_or_else(|| script_error(&state.path, "SqlTestMetadata requires a name"))?;

        // the companion SQL file provides the body
        let companion = state.path.with_extension("sql");
        let sql = std::fs::read_to_string(&companion).map_err(|_| {
            script_error(
                &state.path,
                format!(
                    "companion SQL file not found for test '{name}': {}",
                    companion.display()
                ),
            )
        })?;
        if sql.trim().is_empty() {
            return Err(script_error(
                &state.path,
                format!("companion SQL file for test '{name}' is empty"),
            ));
        }

        let decl = test_decl_from_parts(name, sql.trim().to_string(), &mut kwargs);
        state.push(Declaration::Test(decl))
    }

    // -- loops --------------------------------------------------------------

    /// Unroll `for <var> in [<literals>]:` over factory calls.
    fn parse_loop(&self, cursor: &mut Cursor, state: &mut FileState) -> Result<()> {
        let _ = cursor.parse_ident(); // "for"
        cursor.skip_spaces();
        let var = cursor
            .parse_ident()
            .ok_or_else(|| script_error(&state.path, "expected loop variable after 'for'"))?;
        cursor.skip_spaces();
        let keyword = cursor.parse_ident();
        if keyword.as_deref() != Some("in") {
            return Err(script_error(&state.path, "expected 'in' in for statement"));
        }
        let items = cursor
            .parse_value(&state.env)
            .map_err(|e| script_error(&state.path, format!("loop iterable: {e}")))?;
        let Value::Array(items) = items else {
            return Err(script_error(
                &state.path,
                "loop iterable must be a list literal or a name bound to one",
            ));
        };
        cursor.skip_spaces();
        if !cursor.eat(':') {
            return Err(script_error(&state.path, "malformed for statement"));
        }
        cursor.skip_line();

        let body = capture_block(cursor);
        for item in items {
            let mut body_state = FileState {
                path: state.path.clone(),
                env: state.env.clone(),
                declarations: Vec::new(),
                seen_names: state.seen_names.clone(),
            };
            body_state.env.bind(&var, item);

            let mut body_cursor = Cursor::new(&body);
            loop {
                body_cursor.skip_trivia();
                if body_cursor.at_end() {
                    break;
                }
                self.parse_statement(&mut body_cursor, &mut body_state)?;
            }

            for decl in body_state.declarations {
                state.push(decl)?;
            }
        }
        Ok(())
    }

    fn call_args(&self, cursor: &mut Cursor, env: &Env, path: &Path) -> Result<Vec<CallArg>> {
        cursor.parse_call_args(env).map_err(|e| script_error(path, e))
    }
}

struct FileState {
    path: PathBuf,
    env: Env,
    declarations: Vec<Declaration>,
    seen_names: BTreeSet<String>,
}

impl FileState {
    fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            env: Env::default(),
            declarations: Vec::new(),
            seen_names: BTreeSet::new(),
        }
    }

    fn push(&mut self, decl: Declaration) -> Result<()> {
        let name = decl.name().to_string();
        if name.is_empty() {
            return Err(script_error(&self.path, "declaration is missing a name"));
        }
        if !self.seen_names.insert(name.clone()) {
            return Err(OtscError::DuplicateDeclaration {
                file: self.path.clone(),
                name,
            });
        }
        self.declarations.push(decl);
        Ok(())
    }
}

fn script_error(path: &Path, message: impl Into<String>) -> OtscError {
    OtscError::ScriptParse {
        file: path.to_path_buf(),
        message: message.into(),
    }
}

/// `{folder}__{stem}__{callable}`, collapsed when the file sits directly
/// in the top-level tests directory
fn derive_test_name(path: &Path, callable: &str) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let parent = path
        .parent()
        .and_then(|p| p.file_name())
        .map(|n| n.to_string_lossy().to_string());
    match parent.as_deref() {
        Some("tests") | None => format!("{stem}__{callable}"),
        Some(folder) => format!("{folder}__{stem}__{callable}"),
    }
}

/// Map positional then keyword arguments; `**dict` splats merge in place
fn kwargs_map(args: Vec<CallArg>, positional: &[&str]) -> serde_json::Map<String, Value> {
    let mut map = serde_json::Map::new();
    let mut position = 0usize;
    for arg in args {
        if arg.splat {
            if let Value::Object(inner) = arg.value {
                for (k, v) in inner {
                    map.insert(k, v);
                }
            }
            continue;
        }
        match arg.name {
            Some(name) => {
                map.insert(name, arg.value);
            }
            None => {
                if let Some(slot) = positional.get(position) {
                    map.insert(slot.to_string(), arg.value);
                }
                position += 1;
            }
        }
    }
    map
}

fn take_string(map: &mut serde_json::Map<String, Value>, key: &str) -> Option<String> {
    match map.remove(key) {
        Some(Value::String(s)) => Some(s),
        Some(other) => {
            map.insert(key.to_string(), other);
            None
        }
        None => None,
    }
}

fn test_decl_from_parts(
    name: String,
    sql: String,
    kwargs: &mut serde_json::Map<String, Value>,
) -> TestDecl {
    let severity = take_string(kwargs, "severity")
        .map(|s| Severity::parse(&s))
        .unwrap_or(Severity::Error);
    let description = take_string(kwargs, "description");
    let tags = kwargs
        .remove("tags")
        .and_then(|v| v.as_array().cloned())
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default();
    TestDecl {
        name,
        sql,
        severity,
        description,
        tags,
    }
}

/// Consume the body of a declaration callable and return the SQL it
/// produces: a string literal, an f-string, or a select builder chain.
/// Simple body-local assignments of such expressions are honored.
fn parse_callable_body(cursor: &mut Cursor, env: &Env, path: &Path) -> Result<String> {
    let mut body_env = env.clone();
    loop {
        cursor.skip_trivia();
        if cursor.at_end() || cursor.current_indent() == 0 {
            return Err(script_error(
                path,
                "declaration callable has no return statement",
            ));
        }
        if cursor.lookahead("return") {
            let _ = cursor.parse_ident();
            cursor.skip_spaces();
            let sql = parse_return_expr(cursor, &body_env).map_err(|e| script_error(path, e))?;
            skip_body(cursor);
            return Ok(sql.trim().to_string());
        }
        // docstrings
        if matches!(cursor.peek(), Some('\'') | Some('"')) {
            cursor
                .parse_string_token()
                .map_err(|e| script_error(path, e))?;
            continue;
        }
        // body-local assignment of a renderable expression
        let save = cursor.pos();
        if let Some(name) = cursor.parse_ident() {
            cursor.skip_spaces();
            if cursor.eat('=') && cursor.peek() != Some('=') {
                cursor.skip_spaces();
                if let Ok(sql) = parse_return_expr(cursor, &body_env) {
                    body_env.bind(&name, Value::String(sql));
                    continue;
                }
            }
        }
        cursor.set_pos(save);
        cursor.skip_line();
    }
}

fn parse_return_expr(cursor: &mut Cursor, env: &Env) -> std::result::Result<String, String> {
    cursor.skip_trivia();
    match cursor.peek() {
        Some('(') => {
            cursor.eat('(');
            let inner = parse_return_expr(cursor, env)?;
            cursor.skip_trivia();
            if !cursor.eat(')') {
                return Err("unbalanced parentheses in return expression".to_string());
            }
            Ok(inner)
        }
        Some('\'') | Some('"') => {
            let (content, _) = cursor.parse_string_token()?;
            Ok(content)
        }
        Some(c) if (c == 'f' || c == 'F') && matches!(cursor.peek_at(1), Some('\'') | Some('"')) => {
            let (content, is_fstring) = cursor.parse_string_token()?;
            if is_fstring {
                interpolate_fstring(&content, env)
            } else {
                Ok(content)
            }
        }
        Some(c) if c.is_alphabetic() || c == '_' => parse_builder_chain(cursor, env),
        other => Err(format!("unsupported return expression starting with {other:?}")),
    }
}

/// Render a `select("a").from_("t")` builder chain to SQL. A bare name
/// that resolves to a string in the environment is returned as-is.
fn parse_builder_chain(cursor: &mut Cursor, env: &Env) -> std::result::Result<String, String> {
    let mut path = cursor
        .parse_ident()
        .ok_or_else(|| "expected identifier in return expression".to_string())?;
    while cursor.peek() == Some('.') && !path.ends_with("select") {
        // stop extending the path once a call begins
        if cursor.peek_at(1) == Some('(') {
            break;
        }
        cursor.eat('.');
        let part = cursor
            .parse_ident()
            .ok_or_else(|| "invalid dotted name in return expression".to_string())?;
        path.push('.');
        path.push_str(&part);
    }

    if cursor.peek() != Some('(') {
        // plain name reference
        return match env.lookup(&path) {
            Some(Value::String(s)) => Ok(s.clone()),
            Some(other) => Err(format!("name '{path}' is not a SQL string: {other}")),
            None => Err(format!("unknown name '{path}' in return expression")),
        };
    }
    if !(path == "select" || path.ends_with(".select")) {
        return Err(format!("unsupported call expression '{path}'"));
    }

    let args = cursor.parse_call_args(env)?;
    let columns: Vec<String> = args
        .iter()
        .filter_map(|a| a.value.as_str().map(String::from))
        .collect();
    if columns.is_empty() {
        return Err("select() builder requires column arguments".to_string());
    }

    let mut from_table: Option<String> = None;
    let mut conditions: Vec<String> = Vec::new();
    loop {
        if !cursor.eat('.') {
            break;
        }
        let method = cursor
            .parse_ident()
            .ok_or_else(|| "expected builder method after '.'".to_string())?;
        let margs = cursor.parse_call_args(env)?;
        let first = margs
            .first()
            .and_then(|a| a.value.as_str())
            .map(String::from);
        match method.as_str() {
            "from_" => from_table = first,
            "where" => {
                if let Some(cond) = first {
                    conditions.push(cond);
                }
            }
            other => return Err(format!("unsupported builder method '{other}'")),
        }
    }

    let table = from_table.ok_or_else(|| "select() builder requires .from_()".to_string())?;
    let mut sql = format!("SELECT {} FROM {}", columns.join(", "), table);
    if !conditions.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&conditions.join(" AND "));
    }
    Ok(sql)
}

/// Skip the remaining indented lines of the current block
fn skip_body(cursor: &mut Cursor) {
    loop {
        let save = cursor.pos();
        cursor.skip_trivia();
        if cursor.at_end() {
            break;
        }
        if cursor.current_indent() == 0 {
            cursor.set_pos(save);
            cursor.skip_trivia();
            break;
        }
        cursor.skip_line();
    }
}

/// Skip a `def`/`class` statement and its block
fn skip_block(cursor: &mut Cursor) {
    cursor.skip_line();
    skip_body(cursor);
}

/// Capture the indented body of a block as dedented source text
fn capture_block(cursor: &mut Cursor) -> String {
    let mut statements = Vec::new();
    loop {
        let save = cursor.pos();
        cursor.skip_trivia();
        if cursor.at_end() {
            break;
        }
        if cursor.current_indent() == 0 {
            cursor.set_pos(save);
            cursor.skip_trivia();
            break;
        }
        // statements may span lines through balanced brackets or
        // triple-quoted strings
        let start = cursor.pos();
        consume_statement(cursor);
        let text = cursor.slice(start, cursor.pos());
        statements.push(text.trim().to_string());
    }
    statements.join("\n")
}

/// Advance over one (possibly multi-line) statement
fn consume_statement(cursor: &mut Cursor) {
    let mut depth: i32 = 0;
    loop {
        match cursor.peek() {
            None => break,
            Some(c @ ('(' | '[' | '{')) => {
                depth += 1;
                cursor.eat(c);
            }
            Some(c @ (')' | ']' | '}')) => {
                depth -= 1;
                cursor.eat(c);
            }
            Some('\'') | Some('"') => {
                if cursor.parse_string_token().is_err() {
                    cursor.skip_line();
                    if depth <= 0 {
                        break;
                    }
                }
            }
            Some('\n') => {
                cursor.eat('\n');
                if depth <= 0 {
                    break;
                }
            }
            Some(c) => {
                cursor.eat(c);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use serde_json::json;

    fn extract(source: &str) -> Vec<Declaration> {
        let variables = Variables::new();
        ScriptExtractor::new(&variables)
            .extract(Path::new("models/my_schema/generated.py"), source)
            .unwrap()
    }

    #[test]
    fn test_model_decorator_with_literal_body() {
        let decls = extract(indoc! {r#"
            from otsc import model

            @model(table_name="users_summary", description="Summary of user data")
            def create_users_summary():
                """Create a summary table of users."""
                return "SELECT * FROM my_first_table"
        "#});
        assert_eq!(decls.len(), 1);
        match &decls[0] {
            Declaration::Model(m) => {
                assert_eq!(m.table_name, "users_summary");
                assert_eq!(m.sql, "SELECT * FROM my_first_table");
                assert_eq!(m.description.as_deref(), Some("Summary of user data"));
            }
            other => panic!("expected model, got {other:?}"),
        }
    }

    #[test]
    fn test_model_decorator_defaults_to_callable_name() {
        let decls = extract(indoc! {r#"
            @model
            def recent_users():
                return "SELECT * FROM my_schema.my_first_table"
        "#});
        match &decls[0] {
            Declaration::Model(m) => assert_eq!(m.table_name, "recent_users"),
            other => panic!("expected model, got {other:?}"),
        }
    }

    #[test]
    fn test_model_with_injected_variables() {
        let mut variables = Variables::new();
        variables.insert("env".to_string(), json!("prod"));
        let decls = ScriptExtractor::new(&variables)
            .extract(
                Path::new("models/my_schema/envs.py"),
                indoc! {r#"
                    @model(table_name="env_table", variables=["env"])
                    def env_table():
                        return f"SELECT * FROM events WHERE environment = '{env}'"
                "#},
            )
            .unwrap();
        match &decls[0] {
            Declaration::Model(m) => {
                assert_eq!(m.sql, "SELECT * FROM events WHERE environment = 'prod'");
            }
            other => panic!("expected model, got {other:?}"),
        }
    }

    #[test]
    fn test_model_with_undefined_variable_fails() {
        let variables = Variables::new();
        let err = ScriptExtractor::new(&variables)
            .extract(
                Path::new("models/my_schema/envs.py"),
                indoc! {r#"
                    @model(table_name="env_table", variables=["env"])
                    def env_table():
                        return f"SELECT '{env}'"
                "#},
            )
            .unwrap_err();
        assert!(matches!(err, OtscError::ScriptParse { .. }));
    }

    #[test]
    fn test_builder_return_value() {
        let decls = extract(indoc! {r#"
            @model(table_name="my_auto_table_one")
            def auto_table_one():
                q = exp.select("*").from_("my_first_table")
                return q
        "#});
        match &decls[0] {
            Declaration::Model(m) => {
                assert_eq!(m.sql, "SELECT * FROM my_first_table");
            }
            other => panic!("expected model, got {other:?}"),
        }
    }

    #[test]
    fn test_factory_loop_unrolls() {
        let decls = extract(indoc! {r#"
            STAGING_TABLES = ["my_first_table", "my_second_table"]

            for table_name in STAGING_TABLES:
                create_model(
                    table_name=f"{table_name}_from_loop",
                    sql=f"SELECT * FROM {table_name}",
                    description=f"Select from staging.{table_name}",
                )
        "#});
        assert_eq!(decls.len(), 2);
        match &decls[0] {
            Declaration::Model(m) => {
                assert_eq!(m.table_name, "my_first_table_from_loop");
                assert_eq!(m.sql, "SELECT * FROM my_first_table");
            }
            other => panic!("expected model, got {other:?}"),
        }
        assert_eq!(decls[1].name(), "my_second_table_from_loop");
    }

    #[test]
    fn test_test_decorator_with_triple_quoted_body() {
        let variables = Variables::new();
        let decls = ScriptExtractor::new(&variables)
            .extract(
                Path::new("tests/check_no_null_ids.py"),
                indoc! {r#"
                    @test(name="check_no_null_ids", severity="error", description="No NULL ids")
                    def check_no_null_ids():
                        return """
                        SELECT id
                        FROM @table_name
                        WHERE id IS NULL
                        """
                "#},
            )
            .unwrap();
        match &decls[0] {
            Declaration::Test(t) => {
                assert_eq!(t.name, "check_no_null_ids");
                assert_eq!(t.severity, Severity::Error);
                assert!(t.sql.contains("FROM @table_name"));
            }
            other => panic!("expected test, got {other:?}"),
        }
    }

    #[test]
    fn test_derived_test_name_collapses_at_tests_root() {
        let variables = Variables::new();
        let decls = ScriptExtractor::new(&variables)
            .extract(
                Path::new("tests/row_checks.py"),
                indoc! {r#"
                    @test()
                    def minimum_rows():
                        return "SELECT 1 FROM @table_name HAVING COUNT(*) < @min_rows:10"
                "#},
            )
            .unwrap();
        assert_eq!(decls[0].name(), "row_checks__minimum_rows");

        let decls = ScriptExtractor::new(&variables)
            .extract(
                Path::new("tests/my_schema/row_checks.py"),
                indoc! {r#"
                    @test()
                    def minimum_rows():
                        return "SELECT 1"
                "#},
            )
            .unwrap();
        assert_eq!(decls[0].name(), "my_schema__row_checks__minimum_rows");
    }

    #[test]
    fn test_functions_decorator() {
        let decls = extract(indoc! {r#"
            @functions.sql(
                function_name="cleanup",
                schema="util",
                function_type="scalar",
                parameters=[{"name": "value", "type": "VARCHAR"}],
                return_type="VARCHAR",
                deterministic=True,
            )
            def cleanup():
                return "SELECT TRIM(LOWER(value))"
        "#});
        match &decls[0] {
            Declaration::Function(f) => {
                assert_eq!(f.language, "sql");
                assert_eq!(f.metadata["function_name"], json!("cleanup"));
                assert_eq!(f.metadata["schema"], json!("util"));
                assert_eq!(f.metadata["deterministic"], json!(true));
                assert_eq!(f.sql, "SELECT TRIM(LOWER(value))");
            }
            other => panic!("expected function, got {other:?}"),
        }
    }

    #[test]
    fn test_duplicate_names_in_file_fail() {
        let variables = Variables::new();
        let err = ScriptExtractor::new(&variables)
            .extract(
                Path::new("models/my_schema/dup.py"),
                indoc! {r#"
                    create_model(table_name="a", sql="SELECT 1")
                    create_model(table_name="a", sql="SELECT 2")
                "#},
            )
            .unwrap_err();
        assert!(matches!(err, OtscError::DuplicateDeclaration { .. }));
    }

    #[test]
    fn test_companion_metadata_dict() {
        let variables = Variables::new();
        let metadata = ScriptExtractor::new(&variables)
            .extract_companion_metadata(
                Path::new("models/my_schema/orders.py"),
                indoc! {r#"
                    metadata = {
                        "description": "Order facts",
                        "materialization": "incremental",
                        "incremental": {
                            "strategy": "append",
                            "append": {"time_column": "ts", "start_date": "2024-01-01"},
                        },
                        "schema": [
                            {"name": "id", "datatype": "number", "tests": ["not_null"]},
                        ],
                        "tests": ["row_count_gt_0"],
                        "tags": ["orders"],
                    }
                "#},
            )
            .unwrap();
        assert_eq!(metadata["description"], json!("Order facts"));
        assert_eq!(metadata["incremental"]["append"]["time_column"], json!("ts"));
        assert_eq!(metadata["schema"][0]["tests"][0], json!("not_null"));
    }

    #[test]
    fn test_sql_test_metadata_requires_companion() {
        let variables = Variables::new();
        let err = ScriptExtractor::new(&variables)
            .extract(
                Path::new("tests/missing_companion.py"),
                indoc! {r#"
                    metadata = {"name": "check_name_length", "severity": "error"}
                    test = SqlTestMetadata(**metadata)
                "#},
            )
            .unwrap_err();
        match err {
            OtscError::ScriptParse { message, .. } => {
                assert!(message.contains("companion SQL file"));
            }
            other => panic!("expected ScriptParse, got {other:?}"),
        }
    }
}
