//! Masking of event payloads before they leave the bus.
//!
//! Two rule sets:
//!
//! - `fields`: dotted paths replaced unconditionally with the mask value;
//! - `diff_fields`: the first occurrence in a run passes through, later
//!   occurrences with a *changed* value are masked. This defeats
//!   token-rotation leakage where each event carries a fresh secret.
//!
//! Masking is idempotent: running an already-masked payload through again
//! yields the same bytes.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::Value;

use crate::ir::model::MaskingIr;
use crate::utils::collections::{into_object, JsonMap};
use crate::utils::json_ext::{get_by_path, replace_by_path};

pub struct MaskingEngine {
    fields: Vec<String>,
    diff_fields: Vec<String>,
    mask_value: String,
    /// Per-run diff memory: run id → field path → last seen value.
    previous: Mutex<FxHashMap<String, FxHashMap<String, Value>>>,
}

impl Default for MaskingEngine {
    fn default() -> Self {
        Self::disabled()
    }
}

impl MaskingEngine {
    #[must_use]
    pub fn new(config: &MaskingIr) -> Self {
        Self {
            fields: config.fields.clone(),
            diff_fields: config.diff_fields.clone(),
            mask_value: config.mask_value.clone(),
            previous: Mutex::new(FxHashMap::default()),
        }
    }

    /// An engine with no rules; payloads pass through untouched.
    #[must_use]
    pub fn disabled() -> Self {
        Self::new(&MaskingIr::default())
    }

    /// Apply both rule sets to a payload in place.
    pub fn mask_payload(&self, run_id: &str, payload: &mut JsonMap) {
        if self.fields.is_empty() && self.diff_fields.is_empty() {
            return;
        }
        let mut value = Value::Object(std::mem::take(payload));
        for field in &self.fields {
            replace_by_path(&mut value, field, Value::String(self.mask_value.clone()));
        }
        if !self.diff_fields.is_empty() {
            let mut previous = self.previous.lock();
            let memory = previous.entry(run_id.to_string()).or_default();
            for field in &self.diff_fields {
                let Some(current) = get_by_path(&value, field).cloned() else {
                    continue;
                };
                if let Some(prev) = memory.get(field) {
                    if *prev != current {
                        replace_by_path(
                            &mut value,
                            field,
                            Value::String(self.mask_value.clone()),
                        );
                    }
                }
                memory.insert(field.clone(), current);
            }
        }
        *payload = into_object(value);
    }

    /// Drop a finished run's diff memory.
    pub fn forget_run(&self, run_id: &str) {
        self.previous.lock().remove(run_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn engine(fields: &[&str], diff: &[&str]) -> MaskingEngine {
        MaskingEngine::new(&MaskingIr {
            fields: fields.iter().map(|s| s.to_string()).collect(),
            diff_fields: diff.iter().map(|s| s.to_string()).collect(),
            mask_value: "***".to_string(),
        })
    }

    fn payload(value: Value) -> JsonMap {
        into_object(value)
    }

    #[test]
    fn unconditional_fields_are_replaced() {
        let engine = engine(&["inputs.api_key"], &[]);
        let mut p = payload(json!({"inputs": {"api_key": "sk-123", "q": "hi"}}));
        engine.mask_payload("r1", &mut p);
        assert_eq!(p["inputs"]["api_key"], "***");
        assert_eq!(p["inputs"]["q"], "hi");
    }

    #[test]
    fn absent_fields_are_not_invented() {
        let engine = engine(&["inputs.api_key"], &[]);
        let mut p = payload(json!({"inputs": {"q": "hi"}}));
        engine.mask_payload("r1", &mut p);
        assert_eq!(p, payload(json!({"inputs": {"q": "hi"}})));
    }

    #[test]
    fn diff_fields_mask_only_changed_values() {
        let engine = engine(&[], &["outputs.token"]);

        let mut first = payload(json!({"outputs": {"token": "aaa"}}));
        engine.mask_payload("r1", &mut first);
        assert_eq!(first["outputs"]["token"], "aaa");

        let mut same = payload(json!({"outputs": {"token": "aaa"}}));
        engine.mask_payload("r1", &mut same);
        assert_eq!(same["outputs"]["token"], "aaa");

        let mut rotated = payload(json!({"outputs": {"token": "bbb"}}));
        engine.mask_payload("r1", &mut rotated);
        assert_eq!(rotated["outputs"]["token"], "***");
    }

    #[test]
    fn diff_memory_is_per_run() {
        let engine = engine(&[], &["outputs.token"]);
        let mut first = payload(json!({"outputs": {"token": "aaa"}}));
        engine.mask_payload("r1", &mut first);
        let mut other_run = payload(json!({"outputs": {"token": "bbb"}}));
        engine.mask_payload("r2", &mut other_run);
        assert_eq!(other_run["outputs"]["token"], "bbb");

        engine.forget_run("r1");
        let mut fresh = payload(json!({"outputs": {"token": "ccc"}}));
        engine.mask_payload("r1", &mut fresh);
        assert_eq!(fresh["outputs"]["token"], "ccc");
    }

    #[test]
    fn masking_is_idempotent() {
        let engine = engine(&["inputs.api_key"], &["outputs.token"]);
        let mut once = payload(json!({
            "inputs": {"api_key": "sk-1"},
            "outputs": {"token": "t1"},
        }));
        engine.mask_payload("r1", &mut once);
        let mut twice = once.clone();
        engine.mask_payload("r1", &mut twice);
        assert_eq!(once, twice);
    }
}
