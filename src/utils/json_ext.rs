//! Dotted-path access into JSON values.
//!
//! The masking engine and the expression evaluator both address nested
//! payload fields with dotted paths (`inputs.api_key`, `usage.prompt_tokens`).
//! These helpers keep that traversal in one place.

use serde_json::Value;

/// Get a value by dotted path.
///
/// Object keys are split on `.`; numeric segments index into arrays.
/// Returns `None` when any segment is missing.
///
/// # Examples
///
/// ```rust
/// use graphloom::utils::json_ext::get_by_path;
/// use serde_json::json;
///
/// let data = json!({"user": {"profile": {"name": "Alice"}}, "tags": ["a", "b"]});
/// assert_eq!(get_by_path(&data, "user.profile.name"), Some(&json!("Alice")));
/// assert_eq!(get_by_path(&data, "tags.1"), Some(&json!("b")));
/// assert_eq!(get_by_path(&data, "user.missing"), None);
/// ```
#[must_use]
pub fn get_by_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for part in path.split('.').filter(|p| !p.is_empty()) {
        match current {
            Value::Object(map) => current = map.get(part)?,
            Value::Array(items) => {
                let index: usize = part.parse().ok()?;
                current = items.get(index)?;
            }
            _ => return None,
        }
    }
    Some(current)
}

/// Replace an existing value at a dotted path.
///
/// Unlike a generic setter this never creates intermediate objects: a path
/// that does not already resolve leaves the value untouched and returns
/// `false`. Masking only rewrites fields that are actually present.
pub fn replace_by_path(target: &mut Value, path: &str, value: Value) -> bool {
    let parts: Vec<&str> = path.split('.').filter(|p| !p.is_empty()).collect();
    let Some((last, parents)) = parts.split_last() else {
        return false;
    };
    let mut current = target;
    for part in parents {
        match current {
            Value::Object(map) => match map.get_mut(*part) {
                Some(next) => current = next,
                None => return false,
            },
            _ => return false,
        }
    }
    match current {
        Value::Object(map) => {
            if map.contains_key(*last) {
                map.insert((*last).to_string(), value);
                true
            } else {
                false
            }
        }
        _ => false,
    }
}
