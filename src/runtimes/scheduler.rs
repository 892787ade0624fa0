//! The run loop.
//!
//! A breadth-first frontier starts at the graph entry and consumes node ids
//! until empty or a terminal condition fires. Sequential paths run in order;
//! a parallel fan-out list becomes a one-level concurrent burst that is
//! joined before the loop proceeds; router targets are selected from the
//! node's `route` output; map nodes drive their body through the map
//! executor. A visited set makes the frontier strictly additive; no node id
//! re-runs outside map iteration.
//!
//! The effective cutoff is the earlier of `now + timeout` and the absolute
//! deadline. When it fires the run token is cancelled, `timeout` is emitted
//! exactly once, and in-flight nodes are awaited so they can finish with
//! `node.finish status="cancelled"`, keeping start/finish counts balanced even
//! on the way down.

use futures_util::future::BoxFuture;
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::errors::{ErrorKind, ExecutionError};
use crate::event_bus::{EventBus, EventKind};
use crate::graphs::builder::{CompiledNode, ExecutableGraph};
use crate::graphs::edges::EdgeDescriptor;
use crate::policy::cost::CostMeter;
use crate::runtimes::context::{CancelToken, NodeState, Registries, RunContext, RunState};
use crate::runtimes::executors::{
    execute_with_events, ExecEnv, ExecScope, NodeInterrupt, NodeOutcome,
};
use crate::utils::collections::JsonMap;
use crate::utils::id_generator::IdGenerator;

/// Options for one graph execution.
#[derive(Clone, Debug)]
pub struct RunOptions {
    /// Free-form run inputs, reachable as `graph.inputs.<key>`.
    pub inputs: JsonMap,
    /// Explicit run id; generated when absent.
    pub run_id: Option<String>,
    /// Relative cutoff measured from run start.
    pub timeout: Option<Duration>,
    /// Absolute cutoff. The earlier of the two wins.
    pub deadline: Option<Instant>,
    /// External cancellation token; firing it ends the run as `cancelled`.
    pub cancel: Option<CancelToken>,
    /// Abort the whole run on the first node failure (default). With
    /// `false`, a failed node records empty outputs and its branch simply
    /// ends; structured failures (routing, policy) still abort.
    pub cancel_on_error: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            inputs: JsonMap::new(),
            run_id: None,
            timeout: None,
            deadline: None,
            cancel: None,
            cancel_on_error: true,
        }
    }
}

impl RunOptions {
    #[must_use]
    pub fn with_inputs(inputs: JsonMap) -> Self {
        Self {
            inputs,
            ..Self::default()
        }
    }
}

/// Terminal status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Success,
    Error,
    Timeout,
    Cancelled,
}

impl RunStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Error => "error",
            RunStatus::Timeout => "timeout",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

/// The first fatal failure of a non-success run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunFailure {
    pub kind: ErrorKind,
    pub message: String,
}

/// What a run hands back: terminal status, the declared graph outputs (on
/// success), the full node-outputs table for inspection, and the first
/// fatal error when there was one.
#[derive(Debug)]
pub struct RunResult {
    pub run_id: String,
    pub status: RunStatus,
    pub outputs: JsonMap,
    pub node_states: FxHashMap<String, NodeState>,
    pub error: Option<RunFailure>,
}

enum StepAbort {
    Cancelled,
    Failed(ExecutionError),
}

struct StepOutput {
    /// Node ids executed by this step (the node itself plus burst children).
    ran: Vec<String>,
    /// Successor ids to enqueue.
    next: Vec<String>,
}

/// Drives compiled graphs. Stateless: all per-run state lives in the
/// context created for each `run` call.
#[derive(Debug, Clone, Copy, Default)]
pub struct Scheduler;

impl Scheduler {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Execute the graph once.
    ///
    /// Always returns a [`RunResult`]; failures inside the run surface as
    /// `status = Error` with the first fatal kind and message, not as `Err`.
    pub async fn run(
        &self,
        graph: Arc<ExecutableGraph>,
        bus: &EventBus,
        options: RunOptions,
    ) -> RunResult {
        bus.listen();
        let RunOptions {
            inputs,
            run_id,
            timeout,
            deadline,
            cancel,
            cancel_on_error,
        } = options;

        let run_id = run_id.unwrap_or_else(|| IdGenerator::new().generate_run_id());
        let emitter = bus.emitter(run_id.clone());
        let cancel = cancel.unwrap_or_default();

        let started = Instant::now();
        let cutoff = match (timeout.map(|d| started + d), deadline) {
            (Some(relative), Some(absolute)) => Some(relative.min(absolute)),
            (relative, absolute) => relative.or(absolute),
        };

        let ctx = Arc::new(RunContext {
            run_id: run_id.clone(),
            graph_name: graph.name.clone(),
            cancel: cancel.clone(),
            deadline: cutoff,
            emitter: emitter.clone(),
            cost: CostMeter::new(graph.cost.per_run_tokens),
            registries: Registries {
                histories: graph.histories.clone(),
            },
        });
        let state = Arc::new(RunState::new(inputs));
        let env = ExecEnv {
            graph: Arc::clone(&graph),
            state: Arc::clone(&state),
            ctx: Arc::clone(&ctx),
        };

        let mut start_payload = JsonMap::new();
        start_payload.insert("graph_name".to_string(), graph_name_value(&graph));
        start_payload.insert("entrypoint".to_string(), Value::from(graph.entry.clone()));
        emitter.emit(EventKind::GraphStart, start_payload);

        let drive_fut = drive(env, cancel_on_error);
        tokio::pin!(drive_fut);
        let mut timed_out = false;
        let drive_result = match cutoff {
            Some(at) => {
                tokio::select! {
                    result = &mut drive_fut => result,
                    _ = tokio::time::sleep_until(at) => {
                        timed_out = true;
                        cancel.cancel();
                        let mut payload = JsonMap::new();
                        payload.insert("graph_name".to_string(), graph_name_value(&graph));
                        payload.insert(
                            "timeout".to_string(),
                            timeout.map_or(Value::Null, |d| Value::from(d.as_secs_f64())),
                        );
                        emitter.emit(EventKind::Timeout, payload);
                        // Let in-flight nodes observe the token and finish
                        // as cancelled before the run is closed out.
                        (&mut drive_fut).await
                    }
                }
            }
            None => (&mut drive_fut).await,
        };

        let (status, failure) = if timed_out && drive_result.is_err() {
            (RunStatus::Timeout, None)
        } else {
            match drive_result {
                Ok(()) => (RunStatus::Success, None),
                Err(StepAbort::Cancelled) => {
                    let mut payload = JsonMap::new();
                    payload.insert("graph_name".to_string(), graph_name_value(&graph));
                    emitter.emit(EventKind::Cancelled, payload);
                    (RunStatus::Cancelled, None)
                }
                Err(StepAbort::Failed(error)) => (
                    RunStatus::Error,
                    Some(RunFailure {
                        kind: error.kind,
                        message: error.to_string(),
                    }),
                ),
            }
        };

        let outputs = if status == RunStatus::Success {
            collect_outputs(&graph, &state)
        } else {
            JsonMap::new()
        };

        let mut finish = JsonMap::new();
        finish.insert("graph_name".to_string(), graph_name_value(&graph));
        finish.insert("status".to_string(), Value::from(status.as_str()));
        if status == RunStatus::Success {
            finish.insert("outputs".to_string(), Value::Object(outputs.clone()));
        }
        if let Some(failure) = &failure {
            finish.insert("error_code".to_string(), Value::from(failure.kind.as_str()));
            finish.insert("error".to_string(), Value::from(failure.message.clone()));
        }
        emitter.emit(EventKind::GraphFinish, finish);

        RunResult {
            run_id,
            status,
            outputs,
            node_states: state.snapshot(),
            error: failure,
        }
    }
}

async fn drive(env: ExecEnv, cancel_on_error: bool) -> Result<(), StepAbort> {
    let mut frontier: VecDeque<String> = VecDeque::new();
    frontier.push_back(env.graph.entry.clone());
    let mut visited: FxHashSet<String> = FxHashSet::default();

    while let Some(node_id) = frontier.pop_front() {
        if visited.contains(&node_id) {
            continue;
        }
        if env.ctx.cancel.is_cancelled() {
            return Err(StepAbort::Cancelled);
        }
        let output = match step(env.clone(), node_id, cancel_on_error).await {
            Ok(output) => output,
            Err(abort) => {
                if matches!(abort, StepAbort::Failed(_)) {
                    env.ctx.cancel.cancel();
                }
                return Err(abort);
            }
        };
        visited.extend(output.ran);
        for target in output.next {
            if !env.graph.nodes.contains_key(&target) {
                env.ctx.cancel.cancel();
                return Err(StepAbort::Failed(ExecutionError::new(
                    ErrorKind::EdgeEndpointInvalid,
                    format!("edge references undefined node '{target}'"),
                )));
            }
            if !visited.contains(&target) && !frontier.contains(&target) {
                frontier.push_back(target);
            }
        }
    }
    Ok(())
}

/// Run one node and report the ids it executed plus its successor set.
/// Fan-out bursts recurse: each child is itself a full step, so nested
/// parallel sections join inner bursts before the outer one completes.
fn step(
    env: ExecEnv,
    node_id: String,
    cancel_on_error: bool,
) -> BoxFuture<'static, Result<StepOutput, StepAbort>> {
    Box::pin(async move {
        let Some(node) = env.graph.nodes.get(&node_id).cloned() else {
            return Err(StepAbort::Failed(ExecutionError::new(
                ErrorKind::EdgeEndpointInvalid,
                format!("node '{node_id}' referenced in graph is not defined"),
            )));
        };

        if let EdgeDescriptor::Fanout(children) = &node.spec.edge {
            if children.is_empty() {
                return Err(StepAbort::Failed(ExecutionError::node(
                    ErrorKind::ParallelEmpty,
                    node_id.clone(),
                    format!("parallel node '{node_id}' defines no successors"),
                )));
            }
        }

        let scope = ExecScope::new(env.ctx.cancel.clone());
        let outcome = match execute_with_events(&env, &node, &scope).await {
            Ok(outcome) => outcome,
            Err(NodeInterrupt::Cancelled) => return Err(StepAbort::Cancelled),
            Err(NodeInterrupt::Failed(error)) => {
                if !cancel_on_error && error.kind == ErrorKind::NodeRuntime {
                    // Tolerated failure: the branch ends here, the rest of
                    // the graph keeps going.
                    env.state.record(node_id.clone(), NodeState::default());
                    return Ok(StepOutput {
                        ran: vec![node_id],
                        next: Vec::new(),
                    });
                }
                env.ctx.cancel.cancel();
                return Err(StepAbort::Failed(error));
            }
        };

        match &node.spec.edge {
            EdgeDescriptor::Terminal => Ok(StepOutput {
                ran: vec![node_id],
                next: Vec::new(),
            }),
            EdgeDescriptor::Single(target) => Ok(StepOutput {
                ran: vec![node_id],
                next: vec![target.clone()],
            }),
            EdgeDescriptor::Routes(routes) => {
                let target = select_route(&node, &outcome, routes)?;
                Ok(StepOutput {
                    ran: vec![node_id],
                    next: vec![target],
                })
            }
            EdgeDescriptor::Fanout(children) => {
                let mut burst = JoinSet::new();
                for child in children {
                    burst.spawn(step(env.clone(), child.clone(), cancel_on_error));
                }
                let mut ran = vec![node_id];
                let mut next = Vec::new();
                let mut abort: Option<StepAbort> = None;
                while let Some(joined) = burst.join_next().await {
                    match joined {
                        Ok(Ok(output)) => {
                            ran.extend(output.ran);
                            next.extend(output.next);
                        }
                        Ok(Err(child_abort)) => {
                            merge_abort(&mut abort, child_abort, &env.ctx.cancel);
                        }
                        Err(join_error) => {
                            merge_abort(
                                &mut abort,
                                StepAbort::Failed(ExecutionError::new(
                                    ErrorKind::NodeRuntime,
                                    format!("parallel branch panicked: {join_error}"),
                                )),
                                &env.ctx.cancel,
                            );
                        }
                    }
                }
                if let Some(abort) = abort {
                    return Err(abort);
                }
                let mut seen = FxHashSet::default();
                next.retain(|target| seen.insert(target.clone()));
                Ok(StepOutput { ran, next })
            }
        }
    })
}

/// A failed sibling wins over a cancelled one and fires the run token so
/// the rest of the burst observes cancellation promptly.
fn merge_abort(current: &mut Option<StepAbort>, incoming: StepAbort, cancel: &CancelToken) {
    if matches!(incoming, StepAbort::Failed(_)) {
        cancel.cancel();
    }
    let replace = match current {
        None => true,
        Some(StepAbort::Cancelled) => matches!(incoming, StepAbort::Failed(_)),
        Some(StepAbort::Failed(_)) => false,
    };
    if replace {
        *current = Some(incoming);
    }
}

fn select_route(
    node: &CompiledNode,
    outcome: &NodeOutcome,
    routes: &FxHashMap<String, String>,
) -> Result<String, StepAbort> {
    let node_id = &node.spec.id;
    let key = match outcome.outputs.get("route") {
        Some(Value::String(route)) => Some(route.clone()),
        Some(Value::Null) | None => None,
        Some(other) => Some(other.to_string()),
    };
    let Some(key) = key else {
        return Err(StepAbort::Failed(ExecutionError::node(
            ErrorKind::RouterNoMatch,
            node_id.clone(),
            format!("router node '{node_id}' did not produce a route output"),
        )));
    };
    if let Some(target) = routes.get(&key) {
        return Ok(target.clone());
    }
    routes.get("default").cloned().ok_or_else(|| {
        StepAbort::Failed(ExecutionError::node(
            ErrorKind::RouterNoMatch,
            node_id.clone(),
            format!("router node '{node_id}' produced unknown route '{key}'"),
        ))
    })
}

fn collect_outputs(graph: &ExecutableGraph, state: &RunState) -> JsonMap {
    let mut outputs = JsonMap::new();
    for declared in &graph.outputs {
        // A node a router steered away from never ran; its outputs are
        // simply absent from the result map.
        let Some(node_outputs) = state.node_outputs(&declared.node_id) else {
            continue;
        };
        outputs.insert(
            declared.key.clone(),
            node_outputs
                .get(&declared.output)
                .cloned()
                .unwrap_or(Value::Null),
        );
    }
    outputs
}

fn graph_name_value(graph: &ExecutableGraph) -> Value {
    graph.name.clone().map_or(Value::Null, Value::String)
}
