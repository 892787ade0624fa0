#![allow(dead_code)]

//! Shared fixtures: document-driven components wired through a factory set,
//! plus helpers for running a workflow and inspecting its event stream.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use graphloom::component::{Component, NodeError};
use graphloom::event_bus::{Event, EventKind, MemorySink};
use graphloom::registry::{FactorySet, Materialized, ProviderInstance};
use graphloom::runtimes::context::CallContext;
use graphloom::runtimes::{RunOptions, RunResult, Workflow};
use graphloom::JsonMap;
use std::sync::Arc;

/// Returns the configured `value` verbatim.
pub struct StaticComponent {
    pub value: Value,
}

#[async_trait]
impl Component for StaticComponent {
    async fn call(
        &self,
        _state: &Value,
        _inputs: &JsonMap,
        _ctx: &CallContext,
    ) -> Result<Value, NodeError> {
        Ok(self.value.clone())
    }
}

/// Returns the resolved inputs as the raw result.
pub struct EchoComponent;

#[async_trait]
impl Component for EchoComponent {
    async fn call(
        &self,
        _state: &Value,
        inputs: &JsonMap,
        _ctx: &CallContext,
    ) -> Result<Value, NodeError> {
        Ok(Value::Object(inputs.clone()))
    }
}

/// Reads numeric input `x` and returns `{"y": x + 1}`.
pub struct AddOneComponent;

#[async_trait]
impl Component for AddOneComponent {
    async fn call(
        &self,
        _state: &Value,
        inputs: &JsonMap,
        _ctx: &CallContext,
    ) -> Result<Value, NodeError> {
        let x = inputs
            .get("x")
            .and_then(Value::as_i64)
            .ok_or_else(|| NodeError::msg("input 'x' must be a number"))?;
        Ok(json!({"y": x + 1}))
    }
}

/// Fails the first `failures` calls with the configured status, then
/// succeeds with `value`.
pub struct FlakyComponent {
    pub remaining: AtomicU64,
    pub status: u16,
    pub value: Value,
}

#[async_trait]
impl Component for FlakyComponent {
    async fn call(
        &self,
        _state: &Value,
        _inputs: &JsonMap,
        _ctx: &CallContext,
    ) -> Result<Value, NodeError> {
        let before = self.remaining.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
            n.checked_sub(1)
        });
        if before.is_ok() {
            Err(NodeError::msg("upstream rejected the request").with_status(self.status))
        } else {
            Ok(self.value.clone())
        }
    }
}

/// Sleeps, then returns `value`.
pub struct SleepyComponent {
    pub delay: Duration,
    pub value: Value,
}

#[async_trait]
impl Component for SleepyComponent {
    async fn call(
        &self,
        _state: &Value,
        _inputs: &JsonMap,
        _ctx: &CallContext,
    ) -> Result<Value, NodeError> {
        tokio::time::sleep(self.delay).await;
        Ok(self.value.clone())
    }
}

/// Always fails with the configured message.
pub struct FailingComponent {
    pub message: String,
}

#[async_trait]
impl Component for FailingComponent {
    async fn call(
        &self,
        _state: &Value,
        _inputs: &JsonMap,
        _ctx: &CallContext,
    ) -> Result<Value, NodeError> {
        Err(NodeError::msg(self.message.clone()))
    }
}

/// Map body: doubles input `item`, failing on the configured trigger.
pub struct DoubleOrFailComponent {
    pub fail_on: i64,
}

#[async_trait]
impl Component for DoubleOrFailComponent {
    async fn call(
        &self,
        _state: &Value,
        inputs: &JsonMap,
        _ctx: &CallContext,
    ) -> Result<Value, NodeError> {
        let item = inputs
            .get("item")
            .and_then(Value::as_i64)
            .ok_or_else(|| NodeError::msg("input 'item' must be a number"))?;
        if item == self.fail_on {
            return Err(NodeError::msg(format!("element {item} is not processable")));
        }
        Ok(json!({"value": item * 2}))
    }
}

/// Returns a fresh token on every call, for diff-masking checks.
pub struct RotatingTokenComponent {
    pub counter: AtomicU64,
}

#[async_trait]
impl Component for RotatingTokenComponent {
    async fn call(
        &self,
        _state: &Value,
        _inputs: &JsonMap,
        _ctx: &CallContext,
    ) -> Result<Value, NodeError> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(json!({"token": format!("tok-{n}")}))
    }
}

/// LLM-shaped component: returns the configured text plus token usage.
pub struct FakeLlmComponent {
    pub text: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

#[async_trait]
impl Component for FakeLlmComponent {
    async fn call(
        &self,
        _state: &Value,
        _inputs: &JsonMap,
        _ctx: &CallContext,
    ) -> Result<Value, NodeError> {
        Ok(json!({
            "text": self.text,
            "usage": {
                "prompt_tokens": self.prompt_tokens,
                "completion_tokens": self.completion_tokens,
            },
        }))
    }
}

/// Tool requiring permissions declared on the instance.
pub struct GatedToolComponent;

#[async_trait]
impl Component for GatedToolComponent {
    async fn call(
        &self,
        _state: &Value,
        inputs: &JsonMap,
        _ctx: &CallContext,
    ) -> Result<Value, NodeError> {
        Ok(Value::Object(inputs.clone()))
    }

    fn permissions(&self) -> &[String] {
        static PERMS: std::sync::OnceLock<Vec<String>> = std::sync::OnceLock::new();
        PERMS.get_or_init(|| vec!["net.fetch".to_string()])
    }
}

fn config_i64(config: &JsonMap, key: &str, default: i64) -> i64 {
    config.get(key).and_then(Value::as_i64).unwrap_or(default)
}

fn config_u64(config: &JsonMap, key: &str, default: u64) -> u64 {
    config.get(key).and_then(Value::as_u64).unwrap_or(default)
}

/// Factory set covering every fixture component, all configured from the
/// document's component `config` blocks.
pub fn fixture_factories() -> FactorySet {
    FactorySet::new()
        .provider("stub", |_record| Ok(Arc::new("stub-client") as ProviderInstance))
        .component("static", |record, _provider, _tool| {
            Ok(Materialized::callable(StaticComponent {
                value: record.config.get("value").cloned().unwrap_or(Value::Null),
            }))
        })
        .component("echo", |_record, _provider, _tool| {
            Ok(Materialized::callable(EchoComponent))
        })
        .component("add_one", |_record, _provider, _tool| {
            Ok(Materialized::callable(AddOneComponent))
        })
        .component("flaky", |record, _provider, _tool| {
            Ok(Materialized::callable(FlakyComponent {
                remaining: AtomicU64::new(config_u64(&record.config, "failures", 1)),
                status: config_u64(&record.config, "status", 500) as u16,
                value: record
                    .config
                    .get("value")
                    .cloned()
                    .unwrap_or_else(|| json!({"ok": true})),
            }))
        })
        .component("sleepy", |record, _provider, _tool| {
            Ok(Materialized::callable(SleepyComponent {
                delay: Duration::from_millis(config_u64(&record.config, "delay_ms", 10)),
                value: record
                    .config
                    .get("value")
                    .cloned()
                    .unwrap_or_else(|| json!({"ok": true})),
            }))
        })
        .component("failing", |record, _provider, _tool| {
            Ok(Materialized::callable(FailingComponent {
                message: record
                    .config
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("component failed")
                    .to_string(),
            }))
        })
        .component("double_or_fail", |record, _provider, _tool| {
            Ok(Materialized::callable(DoubleOrFailComponent {
                fail_on: config_i64(&record.config, "fail_on", i64::MIN),
            }))
        })
        .component("rotating_token", |_record, _provider, _tool| {
            Ok(Materialized::callable(RotatingTokenComponent {
                counter: AtomicU64::new(0),
            }))
        })
        .component("fake_llm", |record, _provider, _tool| {
            Ok(Materialized::callable(FakeLlmComponent {
                text: record
                    .config
                    .get("response")
                    .and_then(Value::as_str)
                    .unwrap_or("ok")
                    .to_string(),
                prompt_tokens: config_u64(&record.config, "prompt_tokens", 10),
                completion_tokens: config_u64(&record.config, "completion_tokens", 5),
            }))
        })
        .tool("gated_tool", |_record, _provider| {
            Ok(Materialized::callable(GatedToolComponent))
        })
        .component("tool_wrapper", |_record, _provider, tool| {
            tool.map(Materialized::Callable)
                .ok_or_else(|| NodeError::msg("tool_wrapper requires a tool"))
        })
}

/// Build the workflow, capture its full event stream, run once, tear down.
pub async fn run_document(document: Value, options: RunOptions) -> (RunResult, Vec<Event>) {
    let workflow =
        Workflow::from_document(&document, fixture_factories()).expect("document must compile");
    let sink = MemorySink::new();
    workflow.add_sink(sink.clone());
    let result = workflow.run(options).await;
    workflow.close().await;
    (result, sink.snapshot())
}

/// Convenience: run with only graph inputs set.
pub async fn run_with_inputs(document: Value, inputs: Value) -> (RunResult, Vec<Event>) {
    let inputs = match inputs {
        Value::Object(map) => map,
        _ => JsonMap::new(),
    };
    run_document(document, RunOptions::with_inputs(inputs)).await
}

pub fn of_kind(events: &[Event], kind: EventKind) -> Vec<&Event> {
    events.iter().filter(|event| event.kind == kind).collect()
}

pub fn kinds(events: &[Event]) -> Vec<EventKind> {
    events.iter().map(|event| event.kind).collect()
}

/// node.start / node.finish counts per node id.
pub fn start_finish_counts(events: &[Event], node_id: &str) -> (usize, usize) {
    let count = |kind: EventKind| {
        events
            .iter()
            .filter(|event| {
                event.kind == kind && event.payload.get("node_id").and_then(Value::as_str) == Some(node_id)
            })
            .count()
    };
    (count(EventKind::NodeStart), count(EventKind::NodeFinish))
}

/// Assert the stream-wide invariants: `graph.start` first, `graph.finish`
/// last, sequence strictly increasing.
pub fn assert_stream_shape(events: &[Event]) {
    assert!(!events.is_empty(), "no events captured");
    assert_eq!(events.first().unwrap().kind, EventKind::GraphStart);
    assert_eq!(events.last().unwrap().kind, EventKind::GraphFinish);
    for pair in events.windows(2) {
        assert!(
            pair[1].sequence > pair[0].sequence,
            "sequence not strictly increasing: {} then {}",
            pair[0].sequence,
            pair[1].sequence
        );
    }
}
