use std::fmt;
use std::path::Path;

use serde_json::Value;

/// A fully constructed command: program plus argument vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandLine {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn path_arg(self, path: &Path) -> Self {
        self.arg(path.display().to_string())
    }

    pub fn contains(&self, arg: &str) -> bool {
        self.args.iter().any(|a| a == arg)
    }

    /// Value following `flag` in the argument vector.
    pub fn value_of(&self, flag: &str) -> Option<&str> {
        self.args
            .iter()
            .position(|a| a == flag)
            .and_then(|i| self.args.get(i + 1))
            .map(String::as_str)
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", quote(&self.program))?;
        for arg in &self.args {
            write!(f, " {}", quote(arg))?;
        }
        Ok(())
    }
}

fn quote(s: &str) -> String {
    if s.is_empty() || s.chars().any(|c| c.is_whitespace() || c == '"') {
        format!("\"{}\"", s.replace('"', "\\\""))
    } else {
        s.to_string()
    }
}

/// Splits a template on whitespace, keeping double-quoted segments together.
pub fn split_template(template: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut has_token = false;

    for c in template.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                has_token = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if has_token {
                    tokens.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            c => {
                current.push(c);
                has_token = true;
            }
        }
    }

    if has_token {
        tokens.push(current);
    }

    tokens
}

const BOARD_FLAGS: [&str; 3] = ["-b", "--board", "--fqbn"];
const VERBOSE_FLAGS: [&str; 2] = ["-v", "--verbose"];

/// The board's compiler template with the board id and verbosity pulled out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompilerTemplate {
    pub board: Option<String>,
    pub args: Vec<String>,
}

impl CompilerTemplate {
    pub fn parse(template: &str) -> Self {
        let mut board = None;
        let mut args = Vec::new();
        let mut tokens = split_template(template).into_iter();

        while let Some(token) = tokens.next() {
            if BOARD_FLAGS.contains(&token.as_str()) {
                board = tokens.next();
                continue;
            }
            if let Some(value) = BOARD_FLAGS
                .iter()
                .find_map(|flag| token.strip_prefix(&format!("{}=", flag)))
            {
                board = Some(value.to_string());
                continue;
            }
            if VERBOSE_FLAGS.contains(&token.as_str()) {
                continue;
            }
            args.push(token);
        }

        Self { board, args }
    }
}

/// Flattens a project configuration object into `key=value` pairs, one per
/// non-empty leaf. Nested objects contribute their leaves under the leaf key.
pub fn board_options(config: &Value) -> Vec<(String, String)> {
    let mut options = Vec::new();
    collect_leaves(None, config, &mut options);
    options
}

fn collect_leaves(key: Option<&str>, value: &Value, out: &mut Vec<(String, String)>) {
    match value {
        Value::Object(map) => {
            for (k, v) in map {
                collect_leaves(Some(k), v, out);
            }
        }
        Value::String(s) if !s.trim().is_empty() => {
            if let Some(key) = key {
                out.push((key.to_string(), s.trim().to_string()));
            }
        }
        Value::Number(n) => {
            if let Some(key) = key {
                out.push((key.to_string(), n.to_string()));
            }
        }
        Value::Bool(b) => {
            if let Some(key) = key {
                out.push((key.to_string(), b.to_string()));
            }
        }
        _ => {}
    }
}
