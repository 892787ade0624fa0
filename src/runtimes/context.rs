//! Run-scoped execution context: cancellation, state, component contexts.

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde_json::{json, Value};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::event_bus::RunEmitter;
use crate::policy::cost::CostMeter;
use crate::runtimes::history::HistoryBackend;
use crate::utils::collections::JsonMap;

/// One-shot cancellation signal with parent/child linkage.
///
/// Firing a token cancels it and every child derived from it; a child firing
/// never affects its parent. Map iteration scopes use children so a
/// `fail_fast` element cancels its sibling iterations without touching
/// unrelated branches of the run.
#[derive(Clone, Debug)]
pub struct CancelToken {
    shared: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {
    tx: watch::Sender<bool>,
    parent: Option<CancelToken>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            shared: Arc::new(Shared { tx, parent: None }),
        }
    }

    /// Derive a child token that also observes this token's cancellation.
    #[must_use]
    pub fn child(&self) -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                tx,
                parent: Some(self.clone()),
            }),
        }
    }

    /// Fire the token. Idempotent.
    pub fn cancel(&self) {
        self.shared.tx.send_replace(true);
    }

    /// Whether this token or any ancestor has fired.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        let mut current = Some(self);
        while let Some(token) = current {
            if *token.shared.tx.borrow() {
                return true;
            }
            current = token.shared.parent.as_ref();
        }
        false
    }

    /// Resolve when this token or any ancestor fires.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        let mut receivers = Vec::new();
        let mut current = Some(self);
        while let Some(token) = current {
            receivers.push(token.shared.tx.subscribe());
            current = token.shared.parent.as_ref();
        }
        let waits: Vec<Pin<Box<dyn Future<Output = ()> + Send>>> = receivers
            .into_iter()
            .map(|mut rx| {
                Box::pin(async move {
                    loop {
                        if *rx.borrow() {
                            return;
                        }
                        if rx.changed().await.is_err() {
                            // Sender gone without firing; nothing to observe.
                            std::future::pending::<()>().await;
                        }
                    }
                }) as Pin<Box<dyn Future<Output = ()> + Send>>
            })
            .collect();
        futures_util::future::select_all(waits).await;
    }
}

/// Captured state of a node after execution: the extracted outputs and the
/// raw component result they were read from.
#[derive(Clone, Debug, Default)]
pub struct NodeState {
    pub outputs: JsonMap,
    pub result: Value,
}

/// The node-outputs table plus the run's input mapping.
///
/// Written by the node that finished, read by its successors; the scheduler
/// guarantees happens-before through task joins, the lock only guards
/// concurrent writers inside parallel bursts and map iterations.
pub struct RunState {
    inputs: JsonMap,
    nodes: RwLock<FxHashMap<String, NodeState>>,
}

impl RunState {
    #[must_use]
    pub fn new(inputs: JsonMap) -> Self {
        Self {
            inputs,
            nodes: RwLock::new(FxHashMap::default()),
        }
    }

    #[must_use]
    pub fn inputs(&self) -> &JsonMap {
        &self.inputs
    }

    pub fn record(&self, node_id: impl Into<String>, state: NodeState) {
        self.nodes.write().insert(node_id.into(), state);
    }

    #[must_use]
    pub fn output(&self, node_id: &str, field: &str) -> Option<Value> {
        self.nodes
            .read()
            .get(node_id)
            .and_then(|state| state.outputs.get(field).cloned())
    }

    #[must_use]
    pub fn node_outputs(&self, node_id: &str) -> Option<JsonMap> {
        self.nodes.read().get(node_id).map(|s| s.outputs.clone())
    }

    /// Read-only view handed to components:
    /// `{"graph": {"inputs": ...}, "nodes": {"<id>": <outputs>, ...}}`.
    #[must_use]
    pub fn view(&self) -> Value {
        let nodes: JsonMap = self
            .nodes
            .read()
            .iter()
            .map(|(id, state)| (id.clone(), Value::Object(state.outputs.clone())))
            .collect();
        json!({
            "graph": {"inputs": Value::Object(self.inputs.clone())},
            "nodes": Value::Object(nodes),
        })
    }

    #[must_use]
    pub fn snapshot(&self) -> FxHashMap<String, NodeState> {
        self.nodes.read().clone()
    }
}

/// Handles a component can reach through its context.
#[derive(Clone, Default)]
pub struct Registries {
    pub histories: FxHashMap<String, Arc<dyn HistoryBackend>>,
}

/// Per-run mutable record shared by every node executor.
pub struct RunContext {
    pub run_id: String,
    pub graph_name: Option<String>,
    pub cancel: CancelToken,
    pub deadline: Option<Instant>,
    pub emitter: RunEmitter,
    pub cost: CostMeter,
    pub registries: Registries,
}

/// Iteration bindings inside a map body: the current element and its index.
#[derive(Clone, Debug)]
pub struct LoopContext {
    pub item: Value,
    pub index: usize,
}

/// Context handed to component code for one invocation.
#[derive(Clone)]
pub struct CallContext {
    pub node_id: String,
    pub graph_name: Option<String>,
    pub run_id: String,
    pub config: JsonMap,
    pub emitter: RunEmitter,
    pub cancel: CancelToken,
    pub deadline: Option<Instant>,
    pub registries: Registries,
    pub loop_ctx: Option<LoopContext>,
}
