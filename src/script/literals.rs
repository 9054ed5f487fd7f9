//! A small reader for the literal subset of the scripting language that
//! declaration files are written in: strings (plain, triple-quoted,
//! f-strings), numbers, booleans, None, lists, dicts, identifier
//! references, and keyword-argument lists.

use serde_json::Value;

/// Bindings visible while reading a script: top-level constant
/// assignments, loop variables, and injected project variables.
#[derive(Debug, Clone, Default)]
pub struct Env {
    pub bindings: serde_json::Map<String, Value>,
}

impl Env {
    pub fn bind(&mut self, name: impl Into<String>, value: Value) {
        self.bindings.insert(name.into(), value);
    }

    pub fn lookup(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let mut current = self.bindings.get(parts.next()?)?;
        for key in parts {
            current = current.as_object()?.get(key)?;
        }
        Some(current)
    }
}

/// A parsed keyword or positional argument
#[derive(Debug, Clone)]
pub struct CallArg {
    pub name: Option<String>,
    pub value: Value,
    /// Set for `**name` splat arguments; `value` holds the resolved dict
    pub splat: bool,
}

/// Character cursor over script source
pub struct Cursor {
    chars: Vec<char>,
    pos: usize,
}

impl Cursor {
    pub fn new(src: &str) -> Self {
        Self {
            chars: src.chars().collect(),
            pos: 0,
        }
    }

    pub fn at_end(&self) -> bool {
        self.pos >= self.chars.len()
    }

    pub fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn set_pos(&mut self, pos: usize) {
        self.pos = pos;
    }

    /// True when the upcoming characters match `s` exactly
    pub fn lookahead(&self, s: &str) -> bool {
        s.chars()
            .enumerate()
            .all(|(i, c)| self.chars.get(self.pos + i) == Some(&c))
    }

    pub fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    /// Source text between two cursor positions
    pub fn slice(&self, from: usize, to: usize) -> String {
        self.chars[from.min(self.chars.len())..to.min(self.chars.len())]
            .iter()
            .collect()
    }

    /// Skip spaces and tabs, but not newlines
    pub fn skip_spaces(&mut self) {
        while matches!(self.peek(), Some(' ') | Some('\t')) {
            self.pos += 1;
        }
    }

    /// Advance past the end of the current line
    pub fn skip_line(&mut self) {
        while let Some(c) = self.bump() {
            if c == '\n' {
                break;
            }
        }
    }

    /// Indentation of the line containing the cursor position
    pub fn current_indent(&self) -> usize {
        let mut start = self.pos;
        while start > 0 && self.chars[start - 1] != '\n' {
            start -= 1;
        }
        let mut indent = 0;
        while matches!(self.chars.get(start + indent), Some(' ') | Some('\t')) {
            indent += 1;
        }
        indent
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        Some(c)
    }

    /// Skip whitespace (including newlines) and `#` comments
    pub fn skip_trivia(&mut self) {
        loop {
            match self.peek() {
                Some(c) if c.is_whitespace() => {
                    self.pos += 1;
                }
                Some('#') => {
                    while let Some(c) = self.peek() {
                        self.pos += 1;
                        if c == '\n' {
                            break;
                        }
                    }
                }
                _ => break,
            }
        }
    }

    pub fn eat(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: char) -> Result<(), String> {
        if self.eat(expected) {
            Ok(())
        } else {
            Err(format!(
                "expected '{}' at offset {}, found {:?}",
                expected,
                self.pos,
                self.peek()
            ))
        }
    }

    pub fn parse_ident(&mut self) -> Option<String> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' {
                self.pos += 1;
            } else {
                break;
            }
        }
        if self.pos == start {
            None
        } else {
            Some(self.chars[start..self.pos].iter().collect())
        }
    }

    /// Dotted identifier path, e.g. `config.start_date`
    fn parse_ident_path(&mut self) -> Option<String> {
        let mut path = self.parse_ident()?;
        while self.peek() == Some('.') {
            let save = self.pos;
            self.pos += 1;
            match self.parse_ident() {
                Some(part) => {
                    path.push('.');
                    path.push_str(&part);
                }
                None => {
                    self.pos = save;
                    break;
                }
            }
        }
        Some(path)
    }

    /// Parse a string token. Returns the raw content and whether it was an
    /// f-string (interpolation deferred to the caller's env).
    pub fn parse_string_token(&mut self) -> Result<(String, bool), String> {
        let is_fstring = match self.peek() {
            Some('f') | Some('F') => {
                // only when immediately followed by a quote
                if matches!(self.chars.get(self.pos + 1), Some('\'') | Some('"')) {
                    self.pos += 1;
                    true
                } else {
                    return Err("identifier is not a string".to_string());
                }
            }
            _ => false,
        };

        let quote = match self.peek() {
            Some(q @ ('\'' | '"')) => q,
            other => return Err(format!("expected string quote, found {other:?}")),
        };

        // triple-quoted?
        let triple = self.chars.get(self.pos..self.pos + 3)
            == Some(&[quote, quote, quote][..]);
        if triple {
            self.pos += 3;
            let mut out = String::new();
            loop {
                if self.chars.get(self.pos..self.pos + 3) == Some(&[quote, quote, quote][..]) {
                    self.pos += 3;
                    return Ok((out, is_fstring));
                }
                match self.bump() {
                    Some(c) => out.push(c),
                    None => return Err("unterminated triple-quoted string".to_string()),
                }
            }
        }

        self.pos += 1;
        let mut out = String::new();
        loop {
            match self.bump() {
                Some(c) if c == quote => return Ok((out, is_fstring)),
                Some('\\') => match self.bump() {
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some(c) => out.push(c),
                    None => return Err("unterminated string escape".to_string()),
                },
                Some('\n') => return Err("unterminated string literal".to_string()),
                Some(c) => out.push(c),
                None => return Err("unterminated string literal".to_string()),
            }
        }
    }

    fn parse_number(&mut self) -> Result<Value, String> {
        let start = self.pos;
        if self.peek() == Some('-') {
            self.pos += 1;
        }
        let mut is_float = false;
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                self.pos += 1;
            } else if c == '.' && !is_float {
                is_float = true;
                self.pos += 1;
            } else {
                break;
            }
        }
        let text: String = self.chars[start..self.pos].iter().collect();
        if is_float {
            text.parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| format!("invalid number literal: {text}"))
        } else {
            text.parse::<i64>()
                .map(Value::from)
                .map_err(|_| format!("invalid number literal: {text}"))
        }
    }

    /// Parse a literal value, resolving f-strings and identifier
    /// references against `env`.
    pub fn parse_value(&mut self, env: &Env) -> Result<Value, String> {
        self.skip_trivia();
        match self.peek() {
            Some('\'') | Some('"') => {
                let (content, _) = self.parse_string_token()?;
                Ok(Value::String(content))
            }
            Some('f') | Some('F')
                if matches!(self.chars.get(self.pos + 1), Some('\'') | Some('"')) =>
            {
                let (content, _) = self.parse_string_token()?;
                Ok(Value::String(interpolate_fstring(&content, env)?))
            }
            Some('[') => {
                self.pos += 1;
                let mut items = Vec::new();
                loop {
                    self.skip_trivia();
                    if self.eat(']') {
                        break;
                    }
                    items.push(self.parse_value(env)?);
                    self.skip_trivia();
                    if !self.eat(',') {
                        self.expect(']')?;
                        break;
                    }
                }
                Ok(Value::Array(items))
            }
            Some('{') => {
                self.pos += 1;
                let mut map = serde_json::Map::new();
                loop {
                    self.skip_trivia();
                    if self.eat('}') {
                        break;
                    }
                    let key = match self.parse_value(env)? {
                        Value::String(s) => s,
                        other => other.to_string(),
                    };
                    self.skip_trivia();
                    self.expect(':')?;
                    let value = self.parse_value(env)?;
                    map.insert(key, value);
                    self.skip_trivia();
                    if !self.eat(',') {
                        self.expect('}')?;
                        break;
                    }
                }
                Ok(Value::Object(map))
            }
            Some('(') => {
                // parenthesized value
                self.pos += 1;
                let value = self.parse_value(env)?;
                self.skip_trivia();
                self.expect(')')?;
                Ok(value)
            }
            Some(c) if c.is_ascii_digit() || c == '-' => self.parse_number(),
            Some(c) if c.is_alphabetic() || c == '_' => {
                let path = self
                    .parse_ident_path()
                    .ok_or_else(|| "expected identifier".to_string())?;
                match path.as_str() {
                    "True" => Ok(Value::Bool(true)),
                    "False" => Ok(Value::Bool(false)),
                    "None" => Ok(Value::Null),
                    _ => env
                        .lookup(&path)
                        .cloned()
                        .ok_or_else(|| format!("unknown name '{path}'")),
                }
            }
            other => Err(format!("unexpected character {other:?} in literal")),
        }
    }

    /// Parse a call argument list `( ... )`, cursor positioned at `(`.
    pub fn parse_call_args(&mut self, env: &Env) -> Result<Vec<CallArg>, String> {
        self.skip_trivia();
        self.expect('(')?;
        let mut args = Vec::new();
        loop {
            self.skip_trivia();
            if self.eat(')') {
                break;
            }
            if self.peek() == Some('*') {
                self.pos += 1;
                self.expect('*')?;
                let name = self
                    .parse_ident_path()
                    .ok_or_else(|| "expected identifier after **".to_string())?;
                let value = env
                    .lookup(&name)
                    .cloned()
                    .ok_or_else(|| format!("unknown name '{name}' in ** argument"))?;
                args.push(CallArg {
                    name: None,
                    value,
                    splat: true,
                });
            } else {
                // keyword or positional
                let save = self.pos;
                let keyword = match self.parse_ident() {
                    Some(ident) => {
                        self.skip_trivia();
                        if self.eat('=') && self.peek() != Some('=') {
                            Some(ident)
                        } else {
                            self.pos = save;
                            None
                        }
                    }
                    None => None,
                };
                let value = self.parse_value(env)?;
                args.push(CallArg {
                    name: keyword,
                    value,
                    splat: false,
                });
            }
            self.skip_trivia();
            if !self.eat(',') {
                self.expect(')')?;
                break;
            }
        }
        Ok(args)
    }
}

/// Expand `{name}` interpolations in an f-string body against `env`.
/// `{{` and `}}` escape to literal braces; anything more expressive than a
/// dotted name is rejected.
pub fn interpolate_fstring(raw: &str, env: &Env) -> Result<String, String> {
    let chars: Vec<char> = raw.chars().collect();
    let mut out = String::new();
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '{' if chars.get(i + 1) == Some(&'{') => {
                out.push('{');
                i += 2;
            }
            '}' if chars.get(i + 1) == Some(&'}') => {
                out.push('}');
                i += 2;
            }
            '{' => {
                let end = chars[i + 1..]
                    .iter()
                    .position(|&c| c == '}')
                    .map(|p| i + 1 + p)
                    .ok_or_else(|| "unterminated interpolation in f-string".to_string())?;
                let expr: String = chars[i + 1..end].iter().collect();
                let expr = expr.trim();
                if expr.is_empty()
                    || !expr
                        .chars()
                        .all(|c| c.is_alphanumeric() || c == '_' || c == '.')
                {
                    return Err(format!("unsupported f-string expression '{{{expr}}}'"));
                }
                let value = env
                    .lookup(expr)
                    .ok_or_else(|| format!("unknown name '{expr}' in f-string"))?;
                out.push_str(&value_to_raw_string(value));
                i = end + 1;
            }
            c => {
                out.push(c);
                i += 1;
            }
        }
    }
    Ok(out)
}

/// String form a value takes when interpolated into an f-string
pub fn value_to_raw_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(true) => "True".to_string(),
        Value::Bool(false) => "False".to_string(),
        Value::Null => "None".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn read(src: &str) -> Value {
        Cursor::new(src).parse_value(&Env::default()).unwrap()
    }

    #[test]
    fn test_scalar_literals() {
        assert_eq!(read("'hello'"), json!("hello"));
        assert_eq!(read("\"x\""), json!("x"));
        assert_eq!(read("42"), json!(42));
        assert_eq!(read("-3.5"), json!(-3.5));
        assert_eq!(read("True"), json!(true));
        assert_eq!(read("None"), json!(null));
    }

    #[test]
    fn test_triple_quoted_string() {
        let value = read("\"\"\"SELECT *\nFROM t\"\"\"");
        assert_eq!(value, json!("SELECT *\nFROM t"));
    }

    #[test]
    fn test_collections() {
        assert_eq!(read("[1, 2, 3]"), json!([1, 2, 3]));
        assert_eq!(
            read("{'name': 'id', 'tests': ['not_null'], }"),
            json!({"name": "id", "tests": ["not_null"]})
        );
    }

    #[test]
    fn test_fstring_interpolation() {
        let mut env = Env::default();
        env.bind("table", json!("orders"));
        env.bind("n", json!(7));
        let out = interpolate_fstring("SELECT * FROM {table} LIMIT {n}", &env).unwrap();
        assert_eq!(out, "SELECT * FROM orders LIMIT 7");

        let out = interpolate_fstring("{{ table_name }}", &env).unwrap();
        assert_eq!(out, "{ table_name }");
    }

    #[test]
    fn test_fstring_rejects_expressions() {
        let env = Env::default();
        assert!(interpolate_fstring("{a + b}", &env).is_err());
    }

    #[test]
    fn test_call_args_with_keywords_and_splat() {
        let mut env = Env::default();
        env.bind("meta", json!({"name": "check", "severity": "error"}));
        let mut cursor = Cursor::new("(name='t1', limit=5, **meta)");
        let args = cursor.parse_call_args(&env).unwrap();
        assert_eq!(args.len(), 3);
        assert_eq!(args[0].name.as_deref(), Some("name"));
        assert_eq!(args[0].value, json!("t1"));
        assert!(args[2].splat);
        assert_eq!(args[2].value["severity"], json!("error"));
    }

    #[test]
    fn test_env_nested_lookup() {
        let mut env = Env::default();
        env.bind("config", json!({"db": {"host": "localhost"}}));
        assert_eq!(env.lookup("config.db.host"), Some(&json!("localhost")));
        assert_eq!(env.lookup("config.missing"), None);
    }
}
