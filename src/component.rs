//! The component contract: the unit of user logic bound to graph nodes.
//!
//! A [`Component`] is a callable `(state, inputs, ctx) -> result` plus four
//! optional lifecycle hooks. Tools implement the same trait and may declare
//! [`permissions`](Component::permissions); LLM components are expected to
//! report token usage under `usage.prompt_tokens` / `usage.completion_tokens`
//! in their result so cost accounting can pick it up.

use async_trait::async_trait;
use miette::Diagnostic;
use serde_json::Value;
use thiserror::Error;

use crate::errors::ErrorKind;
use crate::runtimes::context::CallContext;
use crate::utils::collections::JsonMap;

/// Error reported by component code.
///
/// `status` carries an HTTP status when the failure came from a remote call;
/// the retry policy classifies 429 and 5xx as transient. `kind` overrides the
/// default `NODE_RUNTIME` tag for failures that map to a specific policy
/// error (for example [`parse_strict_json`] tags `LLM_JSON_PARSE`).
#[derive(Debug, Error, Diagnostic)]
#[error("{message}")]
#[diagnostic(code(graphloom::component))]
pub struct NodeError {
    pub message: String,
    pub status: Option<u16>,
    pub kind: Option<ErrorKind>,
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl NodeError {
    pub fn msg(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
            kind: None,
            source: None,
        }
    }

    #[must_use]
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    #[must_use]
    pub fn with_kind(mut self, kind: ErrorKind) -> Self {
        self.kind = Some(kind);
        self
    }

    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }
}

impl From<serde_json::Error> for NodeError {
    fn from(err: serde_json::Error) -> Self {
        NodeError::msg(err.to_string()).with_source(err)
    }
}

/// A reusable logic unit invoked by node executors.
///
/// # The call
///
/// `state` is a read-only view of the run: `{"graph": {"inputs": ...},
/// "nodes": {"<node_id>": <outputs>, ...}}`. `inputs` is the node's resolved
/// input mapping. `ctx` carries the node id, merged config, the event
/// emitter, the cancel token, the deadline, history registries, and (inside
/// a map iteration) the loop element and index.
///
/// The returned value is the component's *raw result*; the node's output
/// expressions extract the declared outputs from it afterwards.
///
/// # Hooks
///
/// All four lifecycle hooks default to no-ops, so implementations add only
/// what they need:
///
/// - [`before_execute`](Self::before_execute) may replace the resolved
///   inputs (return `Some` to substitute them);
/// - [`after_execute`](Self::after_execute) may replace the raw result
///   before output extraction;
/// - [`on_error`](Self::on_error) observes every failure; it runs before
///   the retry policy, so it fires once per attempt;
/// - [`close`](Self::close) runs when the owning workflow is torn down.
///
/// # Examples
///
/// ```rust,no_run
/// use async_trait::async_trait;
/// use graphloom::component::{Component, NodeError};
/// use graphloom::runtimes::context::CallContext;
/// use graphloom::JsonMap;
/// use serde_json::{json, Value};
///
/// struct WordCount;
///
/// #[async_trait]
/// impl Component for WordCount {
///     async fn call(
///         &self,
///         _state: &Value,
///         inputs: &JsonMap,
///         _ctx: &CallContext,
///     ) -> Result<Value, NodeError> {
///         let text = inputs.get("text").and_then(Value::as_str).unwrap_or("");
///         Ok(json!({"count": text.split_whitespace().count()}))
///     }
/// }
/// ```
impl std::fmt::Debug for dyn Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn Component")
    }
}

#[async_trait]
pub trait Component: Send + Sync {
    /// Execute the component against the current run state.
    async fn call(
        &self,
        state: &Value,
        inputs: &JsonMap,
        ctx: &CallContext,
    ) -> Result<Value, NodeError>;

    /// Inspect or replace the resolved inputs before [`call`](Self::call).
    async fn before_execute(
        &self,
        _inputs: &JsonMap,
        _ctx: &CallContext,
    ) -> Result<Option<JsonMap>, NodeError> {
        Ok(None)
    }

    /// Inspect or replace the raw result before output extraction.
    async fn after_execute(
        &self,
        result: Value,
        _inputs: &JsonMap,
        _ctx: &CallContext,
    ) -> Result<Value, NodeError> {
        Ok(result)
    }

    /// Observe a failure. Runs once per attempt, before retry scheduling.
    async fn on_error(&self, _error: &NodeError, _inputs: &JsonMap, _ctx: &CallContext) {}

    /// Release held resources. Invoked at workflow teardown; failures are
    /// logged, never propagated.
    async fn close(&self) -> Result<(), NodeError> {
        Ok(())
    }

    /// Permission strings this instance requires before it may run.
    fn permissions(&self) -> &[String] {
        &[]
    }
}

/// Parse an LLM text response as strict JSON.
///
/// Malformed input fails with kind `LLM_JSON_PARSE` so the policy layer
/// treats it as final rather than transient.
pub fn parse_strict_json(text: &str) -> Result<Value, NodeError> {
    serde_json::from_str(text.trim()).map_err(|err| {
        NodeError::msg(format!(
            "malformed JSON near line {}, column {}: {err}",
            err.line(),
            err.column()
        ))
        .with_kind(ErrorKind::LlmJsonParse)
    })
}
