//! Selection paths given on the command line.
//!
//! A path is a dot-separated list of fields, each optionally followed by
//! arguments in parentheses: `user(id:1,role:"admin").friends[0].name`.
//! Argument values are JSON. List indices (`[0]` or a bare `0` segment) only
//! address elements and select nothing.

use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use gqlazy_core::{Argument, ChildOptions, OperationType, Schema, Selection, SelectionInput};
use serde_json::{Map, Value};

/// One field of a selection path.
#[derive(Debug, Clone, PartialEq)]
pub struct PathSegment {
    pub name: String,
    pub args: Map<String, Value>,
}

/// Parse a path into its field segments.
pub fn parse_path(path: &str) -> Result<Vec<PathSegment>> {
    let mut segments = Vec::new();
    for raw in split_top_level(path, '.')? {
        let raw = strip_indices(raw.trim());
        if raw.is_empty() {
            bail!("empty segment in '{}'", path);
        }
        if raw.chars().all(|c| c.is_ascii_digit()) {
            continue;
        }
        segments.push(parse_segment(raw).with_context(|| format!("in path '{}'", path))?);
    }
    if segments.is_empty() {
        bail!("path '{}' selects no field", path);
    }
    Ok(segments)
}

fn parse_segment(raw: &str) -> Result<PathSegment> {
    let Some(open) = raw.find('(') else {
        return Ok(PathSegment {
            name: raw.to_string(),
            args: Map::new(),
        });
    };
    let inner = raw[open + 1..]
        .strip_suffix(')')
        .ok_or_else(|| anyhow!("unclosed arguments in '{}'", raw))?;

    let mut args = Map::new();
    for pair in split_top_level(inner, ',')? {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        let (name, value) = pair
            .split_once(':')
            .ok_or_else(|| anyhow!("argument '{}' is not name:value", pair))?;
        let value: Value = serde_json::from_str(value.trim())
            .with_context(|| format!("argument '{}' is not valid JSON", name.trim()))?;
        args.insert(name.trim().to_string(), value);
    }
    Ok(PathSegment {
        name: raw[..open].trim().to_string(),
        args,
    })
}

/// Drop trailing `[n]` index suffixes.
fn strip_indices(mut raw: &str) -> &str {
    while raw.ends_with(']') {
        match raw.rfind('[') {
            Some(open) => raw = &raw[..open],
            None => break,
        }
    }
    raw
}

/// Split on `sep` outside of parentheses, brackets, braces and strings.
fn split_top_level(input: &str, sep: char) -> Result<Vec<&str>> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;
    let mut start = 0;

    for (i, c) in input.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth -= 1,
            _ if c == sep && depth == 0 => {
                parts.push(&input[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
        if depth < 0 {
            bail!("unbalanced brackets in '{}'", input);
        }
    }
    if depth != 0 || in_string {
        bail!("unbalanced brackets in '{}'", input);
    }
    parts.push(&input[start..]);
    Ok(parts)
}

/// Select `segments` under `root`, returning the leaf selection.
///
/// With a schema, fields and arguments are validated and argument types come
/// from the field definitions. Without one, argument types are inferred from
/// the JSON values.
pub fn select(
    root: &Arc<Selection>,
    operation: OperationType,
    segments: &[PathSegment],
    schema: Option<&Schema>,
) -> Result<Arc<Selection>> {
    let mut node = Arc::clone(root);
    let mut type_name = operation.as_str().to_string();

    for segment in segments {
        let def = match schema {
            Some(schema) => Some(schema.require_field(&type_name, &segment.name)?),
            None => None,
        };

        let mut input = SelectionInput::new();
        for (name, value) in &segment.args {
            let arg_type = match def {
                Some(def) => def
                    .args
                    .get(name)
                    .cloned()
                    .ok_or_else(|| anyhow!("unknown argument '{}' on '{}'", name, segment.name))?,
                None => infer_type(value).to_string(),
            };
            input.insert(name.clone(), Argument::new(arg_type, value.clone()));
        }

        node = node.get_child(segment.name.as_str(), ChildOptions::with_input(input));
        if let Some(def) = def {
            type_name = def.parsed_type().name;
        }
    }
    Ok(node)
}

fn infer_type(value: &Value) -> &'static str {
    match value {
        Value::String(_) => "String",
        Value::Bool(_) => "Boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "Int",
        Value::Number(_) => "Float",
        _ => "JSON",
    }
}
