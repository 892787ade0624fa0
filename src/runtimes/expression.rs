//! The input and output expression languages.
//!
//! **Input expressions** resolve against the running state:
//!
//! - `graph.inputs.<key>`: a run input;
//! - `node.<node_id>.<output>`: a previously recorded node output;
//! - `map.item`, `map.item.<path>`, `map.index`: bindings inside a map body;
//! - `const:<text>`: the literal text after the prefix;
//! - anything else (including non-string values): the literal itself.
//!
//! A missing path resolves to `null`, never an error.
//!
//! **Output expressions** are single-level JSONPath over the raw component
//! result: the root `$`, dotted object keys, and non-negative array indices
//! in brackets (`$.choices[0].text`). Wildcards, slices, filters, and
//! recursion are not part of the language; a missing path yields `null`.
//! Non-`$` expressions pass through as literals.

use serde_json::Value;

use crate::runtimes::context::LoopContext;
use crate::runtimes::context::RunState;

const GRAPH_INPUTS_PREFIX: &str = "graph.inputs.";
const NODE_PREFIX: &str = "node.";
const MAP_ITEM: &str = "map.item";
const MAP_ITEM_PREFIX: &str = "map.item.";
const MAP_INDEX: &str = "map.index";
const CONST_PREFIX: &str = "const:";

/// Resolve one input expression against the running state.
#[must_use]
pub fn resolve_input(expr: &Value, state: &RunState, loop_ctx: Option<&LoopContext>) -> Value {
    let Value::String(expr) = expr else {
        return expr.clone();
    };
    if let Some(key) = expr.strip_prefix(GRAPH_INPUTS_PREFIX) {
        return state.inputs().get(key).cloned().unwrap_or(Value::Null);
    }
    if let Some(rest) = expr.strip_prefix(NODE_PREFIX) {
        let mut parts = rest.splitn(2, '.');
        let (Some(node_id), Some(field)) = (parts.next(), parts.next()) else {
            return Value::Null;
        };
        // Only the first output-name segment addresses the table; deeper
        // structure belongs to output expressions.
        let field = field.split('.').next().unwrap_or(field);
        return state.output(node_id, field).unwrap_or(Value::Null);
    }
    if expr == MAP_ITEM {
        return loop_ctx.map_or(Value::Null, |ctx| ctx.item.clone());
    }
    if let Some(path) = expr.strip_prefix(MAP_ITEM_PREFIX) {
        let Some(ctx) = loop_ctx else {
            return Value::Null;
        };
        return traverse_keys(&ctx.item, path);
    }
    if expr == MAP_INDEX {
        return loop_ctx.map_or(Value::Null, |ctx| Value::from(ctx.index));
    }
    if let Some(text) = expr.strip_prefix(CONST_PREFIX) {
        return Value::String(text.to_string());
    }
    Value::String(expr.clone())
}

/// Evaluate one output expression against a raw component result.
#[must_use]
pub fn extract_output(expr: &Value, result: &Value) -> Value {
    let Value::String(expr) = expr else {
        return expr.clone();
    };
    let Some(rest) = expr.strip_prefix('$') else {
        return Value::String(expr.clone());
    };
    if rest.is_empty() {
        return result.clone();
    }
    let Some(segments) = parse_result_path(rest) else {
        return Value::Null;
    };
    let mut current = result;
    for segment in &segments {
        match (segment, current) {
            (Segment::Key(key), Value::Object(map)) => match map.get(key.as_str()) {
                Some(next) => current = next,
                None => return Value::Null,
            },
            (Segment::Index(index), Value::Array(items)) => match items.get(*index) {
                Some(next) => current = next,
                None => return Value::Null,
            },
            _ => return Value::Null,
        }
    }
    current.clone()
}

#[derive(Debug, PartialEq, Eq)]
enum Segment {
    Key(String),
    Index(usize),
}

fn parse_result_path(rest: &str) -> Option<Vec<Segment>> {
    let bytes = rest.as_bytes();
    let mut segments = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'.' => {
                i += 1;
                let start = i;
                while i < bytes.len() && bytes[i] != b'.' && bytes[i] != b'[' {
                    i += 1;
                }
                if start == i {
                    return None;
                }
                segments.push(Segment::Key(rest[start..i].to_string()));
            }
            b'[' => {
                i += 1;
                let start = i;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
                if start == i || i >= bytes.len() || bytes[i] != b']' {
                    return None;
                }
                segments.push(Segment::Index(rest[start..i].parse().ok()?));
                i += 1;
            }
            _ => return None,
        }
    }
    Some(segments)
}

/// Dotted object traversal used by `map.item.<path>` bindings.
fn traverse_keys(value: &Value, path: &str) -> Value {
    let mut current = value;
    for part in path.split('.') {
        match current {
            Value::Object(map) => match map.get(part) {
                Some(next) => current = next,
                None => return Value::Null,
            },
            _ => return Value::Null,
        }
    }
    current.clone()
}
