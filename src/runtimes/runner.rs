//! The workflow facade: one value that owns the compiled graph, the
//! registry, and the event bus, and runs the graph on demand.
//!
//! ```rust,no_run
//! use graphloom::{FactorySet, MemorySink, RunOptions, Workflow};
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), graphloom::WorkflowError> {
//! let document = json!({
//!     "meta": {"version": 2},
//!     "runtime": {"engine": "local", "graph_name": "demo"},
//!     // providers / components / graph ...
//! });
//! let workflow = Workflow::from_document(&document, FactorySet::new())?;
//! let sink = MemorySink::new();
//! workflow.add_sink(sink.clone());
//!
//! let result = workflow.run(RunOptions::default()).await;
//! println!("status: {:?}", result.status);
//!
//! workflow.close().await;
//! # Ok(())
//! # }
//! ```

use miette::Diagnostic;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

use crate::errors::{BuildError, NormalizeError, ResolveError};
use crate::event_bus::{EventBus, EventSink};
use crate::graphs::builder::{ExecutableGraph, GraphBuilder};
use crate::ir::model::{NormalizationWarning, WorkflowIr};
use crate::ir::normalizer::normalize_document;
use crate::policy::masking::MaskingEngine;
use crate::registry::resolver::{FactorySet, Registry};
use crate::runtimes::scheduler::{RunOptions, RunResult, Scheduler};

/// Failure while turning a document into a runnable workflow.
#[derive(Debug, Error, Diagnostic)]
pub enum WorkflowError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Normalize(#[from] NormalizeError),
    #[error(transparent)]
    #[diagnostic(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    #[diagnostic(transparent)]
    Build(#[from] BuildError),
}

/// A compiled workflow ready to run.
///
/// Materialized instances live as long as this value; [`close`](Self::close)
/// runs their `close` hooks and drains the event bus.
pub struct Workflow {
    ir: Arc<WorkflowIr>,
    graph: Arc<ExecutableGraph>,
    registry: Registry,
    bus: EventBus,
    scheduler: Scheduler,
    warnings: Vec<NormalizationWarning>,
}

impl Workflow {
    /// Normalize, materialize, and compile a raw document.
    ///
    /// The document is the already-parsed mapping produced by the host's
    /// loader; no sinks are attached yet, masking is wired from the
    /// document's policies.
    pub fn from_document(document: &Value, factories: FactorySet) -> Result<Self, WorkflowError> {
        let outcome = normalize_document(document)?;
        let registry = Registry::new(factories);
        let graph = GraphBuilder::new().build(&outcome.ir, &registry)?;
        let bus = EventBus::new().with_masking(MaskingEngine::new(&graph.masking));
        Ok(Self {
            ir: Arc::new(outcome.ir),
            graph: Arc::new(graph),
            registry,
            bus,
            scheduler: Scheduler::new(),
            warnings: outcome.warnings,
        })
    }

    /// Warnings accumulated during normalization.
    #[must_use]
    pub fn warnings(&self) -> &[NormalizationWarning] {
        &self.warnings
    }

    #[must_use]
    pub fn ir(&self) -> &WorkflowIr {
        &self.ir
    }

    #[must_use]
    pub fn graph(&self) -> &ExecutableGraph {
        &self.graph
    }

    #[must_use]
    pub fn event_bus(&self) -> &EventBus {
        &self.bus
    }

    /// Attach an event sink (stdout, memory, JSONL file, channel, ...).
    pub fn add_sink<T: EventSink + 'static>(&self, sink: T) {
        self.bus.add_sink(sink);
    }

    /// Execute the graph once.
    pub async fn run(&self, options: RunOptions) -> RunResult {
        self.scheduler
            .run(Arc::clone(&self.graph), &self.bus, options)
            .await
    }

    /// Tear down: run every materialized instance's `close` hook (failures
    /// are logged, never propagated) and drain the event bus.
    pub async fn close(&self) {
        for (id, component) in self.registry.materialized_callables() {
            if let Err(error) = component.close().await {
                tracing::warn!(component = %id, error = %error, "component close hook failed");
            }
        }
        self.bus.stop().await;
    }
}
