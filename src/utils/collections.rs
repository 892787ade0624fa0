//! Collection aliases used throughout the crate.
//!
//! Node inputs, outputs, configs, and event payloads are all string-keyed
//! JSON objects; [`JsonMap`] names that shape once so signatures stay
//! readable. Internal id-keyed tables use `FxHashMap` for cheap hashing.

use serde_json::{Map, Value};

/// A string-keyed JSON object: the shape of inputs, outputs, configs, and
/// event payloads.
pub type JsonMap = Map<String, Value>;

/// Create an empty [`JsonMap`].
#[must_use]
pub fn new_json_map() -> JsonMap {
    Map::new()
}

/// Convert a JSON value into an owned object, treating any non-object as
/// empty. Used where a mapping shape has already been validated upstream.
#[must_use]
pub fn into_object(value: Value) -> JsonMap {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}
