//! Node executors: the innermost layer of the policy stack.
//!
//! The graph builder compiles one executor per node (a component invoker
//! for `llm`/`tool`/`router`/`component`/`parallel` nodes, an iteration
//! driver for `map` nodes) and wraps it in the policy gates. The scheduler
//! only ever talks to the outermost layer through [`NodeExecutor`].

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::time::Instant;

use crate::component::{Component, NodeError};
use crate::errors::{ErrorKind, ExecutionError};
use crate::event_bus::{now_ts, EventKind};
use crate::graphs::builder::{CompiledNode, ExecutableGraph, NodeSpec};
use crate::ir::model::{MapFailureMode, NodeKind};
use crate::runtimes::context::{CallContext, CancelToken, LoopContext, NodeState, RunContext, RunState};
use crate::runtimes::expression::{extract_output, resolve_input};
use crate::utils::collections::JsonMap;

/// Everything an executor needs to reach the run: the compiled graph, the
/// node-outputs table, and the per-run context.
#[derive(Clone)]
pub struct ExecEnv {
    pub graph: Arc<ExecutableGraph>,
    pub state: Arc<RunState>,
    pub ctx: Arc<RunContext>,
}

/// Per-invocation scope: the cancel token governing this execution and, in
/// a map body, the iteration bindings.
#[derive(Clone)]
pub struct ExecScope {
    pub cancel: CancelToken,
    pub loop_ctx: Option<LoopContext>,
}

impl ExecScope {
    #[must_use]
    pub fn new(cancel: CancelToken) -> Self {
        Self {
            cancel,
            loop_ctx: None,
        }
    }
}

/// Extracted outputs plus the raw result they were read from.
#[derive(Clone, Debug, Default)]
pub struct NodeOutcome {
    pub outputs: JsonMap,
    pub result: Value,
}

/// Why an execution did not produce an outcome.
///
/// Cancellation is not an error: it flows through the stack untouched (the
/// retry layer never retries it) and surfaces as `node.finish
/// status="cancelled"`.
#[derive(Debug)]
pub enum NodeInterrupt {
    Cancelled,
    Failed(ExecutionError),
}

impl From<ExecutionError> for NodeInterrupt {
    fn from(error: ExecutionError) -> Self {
        NodeInterrupt::Failed(error)
    }
}

/// One layer of a node's execution stack.
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    async fn execute(&self, env: &ExecEnv, scope: &ExecScope) -> Result<NodeOutcome, NodeInterrupt>;
}

/// Run one compiled node with its full event envelope: `node.start`, the
/// policy-wrapped executor, state recording, and `node.finish` with the
/// appropriate status. Start/finish counts stay balanced for every path,
/// and a node whose token fired before dispatch emits nothing at all.
pub(crate) async fn execute_with_events(
    env: &ExecEnv,
    node: &CompiledNode,
    scope: &ExecScope,
) -> Result<NodeOutcome, NodeInterrupt> {
    if scope.cancel.is_cancelled() {
        return Err(NodeInterrupt::Cancelled);
    }
    let spec = &node.spec;
    let started_at = now_ts();
    let mut start = JsonMap::new();
    start.insert("node_id".to_string(), Value::from(spec.id.clone()));
    start.insert("kind".to_string(), Value::from(spec.kind.as_str()));
    start.insert("graph_name".to_string(), graph_name_value(env.ctx.as_ref()));
    start.insert("started_at".to_string(), Value::from(started_at));
    env.ctx.emitter.emit(EventKind::NodeStart, start);

    let clock = Instant::now();
    let result = node.executor.execute(env, scope).await;
    let duration_ms = clock.elapsed().as_secs_f64() * 1000.0;

    match result {
        Ok(outcome) => {
            env.state.record(
                spec.id.clone(),
                NodeState {
                    outputs: outcome.outputs.clone(),
                    result: outcome.result.clone(),
                },
            );
            emit_finish(env, spec, "success", duration_ms, started_at, &outcome.outputs);
            Ok(outcome)
        }
        Err(NodeInterrupt::Cancelled) => {
            emit_finish(env, spec, "cancelled", duration_ms, started_at, &JsonMap::new());
            Err(NodeInterrupt::Cancelled)
        }
        Err(NodeInterrupt::Failed(error)) => {
            let mut raised = JsonMap::new();
            raised.insert("node_id".to_string(), Value::from(spec.id.clone()));
            raised.insert("kind".to_string(), Value::from(spec.kind.as_str()));
            raised.insert("message".to_string(), Value::from(error.to_string()));
            env.ctx.emitter.emit(EventKind::ErrorRaised, raised);
            emit_finish(env, spec, "error", duration_ms, started_at, &JsonMap::new());
            Err(NodeInterrupt::Failed(error))
        }
    }
}

fn emit_finish(
    env: &ExecEnv,
    spec: &NodeSpec,
    status: &str,
    duration_ms: f64,
    started_at: f64,
    outputs: &JsonMap,
) {
    let mut finish = JsonMap::new();
    finish.insert("node_id".to_string(), Value::from(spec.id.clone()));
    finish.insert("kind".to_string(), Value::from(spec.kind.as_str()));
    finish.insert("status".to_string(), Value::from(status));
    finish.insert("duration_ms".to_string(), Value::from(duration_ms));
    finish.insert("outputs".to_string(), Value::Object(outputs.clone()));
    finish.insert("started_at".to_string(), Value::from(started_at));
    finish.insert("graph_name".to_string(), graph_name_value(env.ctx.as_ref()));
    env.ctx.emitter.emit(EventKind::NodeFinish, finish);
}

fn graph_name_value(ctx: &RunContext) -> Value {
    ctx.graph_name.clone().map_or(Value::Null, Value::String)
}

/// Invokes the node's materialized component: resolves inputs, runs the
/// lifecycle hooks around the call, extracts declared outputs, and emits
/// the kind-specific `llm.call` / `tool.call` event.
pub struct ComponentExecutor {
    pub(crate) spec: Arc<NodeSpec>,
    pub(crate) component: Option<Arc<dyn Component>>,
}

#[async_trait]
impl NodeExecutor for ComponentExecutor {
    async fn execute(&self, env: &ExecEnv, scope: &ExecScope) -> Result<NodeOutcome, NodeInterrupt> {
        let Some(component) = &self.component else {
            // A bare fork point (parallel without a component) produces
            // nothing; its successors carry the work.
            return Ok(NodeOutcome::default());
        };
        let spec = &self.spec;

        let mut inputs = JsonMap::new();
        for (name, expr) in &spec.inputs {
            inputs.insert(
                name.clone(),
                resolve_input(expr, &env.state, scope.loop_ctx.as_ref()),
            );
        }
        for (name, default) in &spec.defaults {
            if inputs.get(name).map_or(true, Value::is_null) {
                inputs.insert(name.clone(), default.clone());
            }
        }

        let ctx = CallContext {
            node_id: spec.id.clone(),
            graph_name: env.ctx.graph_name.clone(),
            run_id: env.ctx.run_id.clone(),
            config: spec.config.clone(),
            emitter: env.ctx.emitter.clone(),
            cancel: scope.cancel.clone(),
            deadline: env.ctx.deadline,
            registries: env.ctx.registries.clone(),
            loop_ctx: scope.loop_ctx.clone(),
        };
        let state_view = env.state.view();

        let invocation = async {
            let effective_inputs = match component.before_execute(&inputs, &ctx).await? {
                Some(replaced) => replaced,
                None => inputs.clone(),
            };
            let raw = component.call(&state_view, &effective_inputs, &ctx).await?;
            let raw = component.after_execute(raw, &effective_inputs, &ctx).await?;
            Ok::<(JsonMap, Value), NodeError>((effective_inputs, raw))
        };

        let invoked = tokio::select! {
            biased;
            _ = scope.cancel.cancelled() => return Err(NodeInterrupt::Cancelled),
            invoked = invocation => invoked,
        };
        let (effective_inputs, raw) = match invoked {
            Ok(value) => value,
            Err(error) => {
                component.on_error(&error, &inputs, &ctx).await;
                let kind = error.kind.unwrap_or(ErrorKind::NodeRuntime);
                return Err(NodeInterrupt::Failed(
                    ExecutionError::node(kind, spec.id.clone(), error.to_string())
                        .with_status(error.status),
                ));
            }
        };

        let mut outputs = JsonMap::new();
        for (name, expr) in &spec.outputs {
            outputs.insert(name.clone(), extract_output(expr, &raw));
        }

        match spec.kind {
            NodeKind::Llm => {
                let usage = raw.get("usage");
                let tokens_in = usage
                    .and_then(|u| u.get("prompt_tokens"))
                    .and_then(Value::as_u64);
                let tokens_out = usage
                    .and_then(|u| u.get("completion_tokens"))
                    .and_then(Value::as_u64);
                let mut payload = JsonMap::new();
                payload.insert("node_id".to_string(), Value::from(spec.id.clone()));
                payload.insert(
                    "provider_id".to_string(),
                    spec.provider_id.clone().map_or(Value::Null, Value::String),
                );
                payload.insert(
                    "model".to_string(),
                    spec.model.clone().map_or(Value::Null, Value::String),
                );
                payload.insert(
                    "component_id".to_string(),
                    spec.component_id.clone().map_or(Value::Null, Value::String),
                );
                payload.insert(
                    "tokens_in".to_string(),
                    tokens_in.map_or(Value::Null, Value::from),
                );
                payload.insert(
                    "tokens_out".to_string(),
                    tokens_out.map_or(Value::Null, Value::from),
                );
                payload.insert("inputs".to_string(), Value::Object(effective_inputs));
                payload.insert("outputs".to_string(), Value::Object(outputs.clone()));
                env.ctx.emitter.emit(EventKind::LlmCall, payload);

                if let Err(total) = env.ctx.cost.record(tokens_in, tokens_out) {
                    let limit = env.ctx.cost.limit().unwrap_or(0);
                    return Err(NodeInterrupt::Failed(ExecutionError::node(
                        ErrorKind::CostLimitExceeded,
                        spec.id.clone(),
                        format!(
                            "run '{}' exceeded token budget ({total} > {limit})",
                            env.ctx.run_id
                        ),
                    )));
                }
            }
            NodeKind::Tool => {
                let mut payload = JsonMap::new();
                payload.insert("node_id".to_string(), Value::from(spec.id.clone()));
                payload.insert(
                    "tool_id".to_string(),
                    spec.tool_id.clone().map_or(Value::Null, Value::String),
                );
                payload.insert(
                    "component_id".to_string(),
                    spec.component_id.clone().map_or(Value::Null, Value::String),
                );
                payload.insert(
                    "required_permissions".to_string(),
                    Value::Array(
                        spec.required_permissions
                            .iter()
                            .map(|p| Value::from(p.clone()))
                            .collect(),
                    ),
                );
                payload.insert("inputs".to_string(), Value::Object(effective_inputs));
                payload.insert("outputs".to_string(), Value::Object(outputs.clone()));
                env.ctx.emitter.emit(EventKind::ToolCall, payload);
            }
            _ => {}
        }

        Ok(NodeOutcome {
            outputs,
            result: raw,
        })
    }
}

enum IterResult {
    Done(JsonMap),
    Failed(ExecutionError),
    Cancelled,
}

/// Drives map iteration: reads the collection, runs the body node once per
/// element under a child cancel token, and publishes the result list.
pub struct MapExecutor {
    pub(crate) spec: Arc<NodeSpec>,
    pub(crate) body_id: String,
    pub(crate) collection: Value,
    pub(crate) concurrency: usize,
    pub(crate) ordered: bool,
    pub(crate) failure_mode: MapFailureMode,
    pub(crate) result_key: String,
}

#[async_trait]
impl NodeExecutor for MapExecutor {
    async fn execute(&self, env: &ExecEnv, scope: &ExecScope) -> Result<NodeOutcome, NodeInterrupt> {
        let spec = &self.spec;
        let body = env.graph.nodes.get(&self.body_id).cloned().ok_or_else(|| {
            NodeInterrupt::Failed(ExecutionError::node(
                ErrorKind::MapBodyMissing,
                spec.id.clone(),
                format!("map body '{}' is not part of the graph", self.body_id),
            ))
        })?;

        let items = resolve_input(&self.collection, &env.state, scope.loop_ctx.as_ref());
        let Value::Array(items) = items else {
            return Err(NodeInterrupt::Failed(ExecutionError::node(
                ErrorKind::MapOverNotArray,
                spec.id.clone(),
                format!("map node '{}' requires an array-like value", spec.id),
            )));
        };
        if items.is_empty() {
            // No elements, no child events: the node succeeds with an empty
            // result list.
            return Ok(self.outcome(Vec::new(), Vec::new()));
        }

        let iter_cancel = scope.cancel.child();
        let iterations = items.into_iter().enumerate().map(|(index, item)| {
            let env = env.clone();
            let body = body.clone();
            let cancel = iter_cancel.clone();
            async move {
                if cancel.is_cancelled() {
                    return (index, IterResult::Cancelled);
                }
                let iteration_scope = ExecScope {
                    cancel,
                    loop_ctx: Some(LoopContext { item, index }),
                };
                match execute_with_events(&env, &body, &iteration_scope).await {
                    Ok(outcome) => (index, IterResult::Done(outcome.outputs)),
                    Err(NodeInterrupt::Cancelled) => (index, IterResult::Cancelled),
                    Err(NodeInterrupt::Failed(error)) => (index, IterResult::Failed(error)),
                }
            }
        });

        let mut stream = futures_util::stream::iter(iterations).buffer_unordered(self.concurrency);
        let mut entries: Vec<(usize, Value)> = Vec::new();
        let mut error_objects: Vec<Value> = Vec::new();
        let mut fatal: Option<ExecutionError> = None;

        while let Some((index, result)) = stream.next().await {
            match result {
                IterResult::Done(outputs) => entries.push((index, Value::Object(outputs))),
                IterResult::Cancelled => {}
                IterResult::Failed(error) => match self.failure_mode {
                    MapFailureMode::FailFast => {
                        if fatal.is_none() {
                            fatal = Some(error);
                            // Siblings of this map die; unrelated branches
                            // only stop if the run itself aborts.
                            iter_cancel.cancel();
                        }
                    }
                    MapFailureMode::CollectErrors => {
                        let entry = json!({"index": index, "error": error.to_string()});
                        error_objects.push(entry.clone());
                        entries.push((index, entry));
                    }
                    MapFailureMode::SkipFailed => {}
                },
            }
        }
        drop(stream);

        if let Some(error) = fatal {
            return Err(NodeInterrupt::Failed(ExecutionError::node(
                ErrorKind::NodeRuntime,
                spec.id.clone(),
                format!("map iteration failed: {error}"),
            )));
        }
        if scope.cancel.is_cancelled() {
            return Err(NodeInterrupt::Cancelled);
        }

        if self.ordered {
            entries.sort_by_key(|(index, _)| *index);
        }
        let list: Vec<Value> = entries.into_iter().map(|(_, value)| value).collect();
        Ok(self.outcome(list, error_objects))
    }
}

impl MapExecutor {
    fn outcome(&self, list: Vec<Value>, error_objects: Vec<Value>) -> NodeOutcome {
        let mut outputs = JsonMap::new();
        outputs.insert(self.result_key.clone(), Value::Array(list.clone()));
        outputs.insert("errors".to_string(), Value::Array(error_objects));
        NodeOutcome {
            outputs,
            result: Value::Array(list),
        }
    }
}
