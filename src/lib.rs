//! ```text
//! raw document ─► Normalizer ─► WorkflowIr ─► GraphBuilder ─► ExecutableGraph
//!                                  │               │                │
//!                                  │               ├─► Registry (factories,
//!                                  │               │    lazy materialization)
//!                                  │               └─► policy stack per node
//!                                  │                    (permissions → cost →
//!                                  │                     rate limit → retry)
//!                                  │
//!                                  └─► warnings            Scheduler ─► RunResult
//!                                                              │
//!                                                              └─► EventBus ─► sinks
//! ```
//!
//! Graphloom compiles a declarative workflow document into a directed graph of
//! typed nodes and executes it with concurrency, cancellation, retry, rate
//! limiting, cost accounting, masking, and an ordered telemetry stream.
//!
//! The document (an already-parsed mapping; loading and schema validation are
//! the host's concern) is normalized into an immutable [`ir::WorkflowIr`],
//! provider/tool/component references are materialized through host-supplied
//! factories in [`registry`], the [`graphs::GraphBuilder`] compiles everything
//! into an [`graphs::ExecutableGraph`] with a fixed per-node policy stack, and
//! the [`runtimes::Scheduler`] drives the graph while the [`event_bus`]
//! sequences and masks every observable decision point.

pub mod component;
pub mod errors;
pub mod event_bus;
pub mod graphs;
pub mod ir;
pub mod policy;
pub mod registry;
pub mod runtimes;
pub mod telemetry;
pub mod utils;

pub use component::{Component, NodeError};
pub use errors::{BuildError, ErrorKind, ExecutionError, NormalizeError, ResolveError};
pub use event_bus::{Event, EventBus, EventKind, EventSink, MemorySink};
pub use graphs::{EdgeDescriptor, ExecutableGraph, GraphBuilder};
pub use ir::{normalize_document, NormalizationWarning, WorkflowIr};
pub use registry::{FactorySet, Materialized, Registry};
pub use runtimes::{
    CancelToken, RunOptions, RunResult, RunStatus, Scheduler, Workflow, WorkflowError,
};
pub use utils::collections::JsonMap;
