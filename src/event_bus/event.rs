//! The event type and catalogue.
//!
//! Every event carries `event`, `run_id`, `ts` (wall-clock seconds with
//! sub-second precision), and the bus-assigned `sequence`; kind-specific
//! payload fields are flattened alongside when serialized, so a JSONL sink
//! writes one flat object per line.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::utils::collections::JsonMap;

/// The closed catalogue of runtime events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "graph.start")]
    GraphStart,
    #[serde(rename = "graph.finish")]
    GraphFinish,
    #[serde(rename = "node.start")]
    NodeStart,
    #[serde(rename = "node.finish")]
    NodeFinish,
    #[serde(rename = "llm.call")]
    LlmCall,
    #[serde(rename = "tool.call")]
    ToolCall,
    #[serde(rename = "retry.attempt")]
    RetryAttempt,
    #[serde(rename = "rate.limit.wait")]
    RateLimitWait,
    #[serde(rename = "timeout")]
    Timeout,
    #[serde(rename = "cancelled")]
    Cancelled,
    #[serde(rename = "error.raised")]
    ErrorRaised,
}

impl EventKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            EventKind::GraphStart => "graph.start",
            EventKind::GraphFinish => "graph.finish",
            EventKind::NodeStart => "node.start",
            EventKind::NodeFinish => "node.finish",
            EventKind::LlmCall => "llm.call",
            EventKind::ToolCall => "tool.call",
            EventKind::RetryAttempt => "retry.attempt",
            EventKind::RateLimitWait => "rate.limit.wait",
            EventKind::Timeout => "timeout",
            EventKind::Cancelled => "cancelled",
            EventKind::ErrorRaised => "error.raised",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One telemetry event.
///
/// `sequence` is `0` until the bus listener assigns the run-scoped value;
/// sinks always observe the assigned number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "event")]
    pub kind: EventKind,
    pub run_id: String,
    pub ts: f64,
    pub sequence: u64,
    #[serde(flatten)]
    pub payload: JsonMap,
}

impl Event {
    #[must_use]
    pub fn new(kind: EventKind, run_id: impl Into<String>, payload: JsonMap) -> Self {
        Self {
            kind,
            run_id: run_id.into(),
            ts: now_ts(),
            sequence: 0,
            payload,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}#{:04}] {}", self.run_id, self.sequence, self.kind)?;
        if !self.payload.is_empty() {
            let rendered =
                serde_json::to_string(&self.payload).unwrap_or_else(|_| "{}".to_string());
            write!(f, " {rendered}")?;
        }
        Ok(())
    }
}

/// Wall-clock seconds with microsecond precision.
#[must_use]
pub fn now_ts() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1e6
}
