//! Stable error taxonomy shared by every compilation and execution stage.
//!
//! Each stage has its own error type (normalization, resolution, graph
//! building, execution) so callers can match on where a failure happened,
//! but all of them carry an [`ErrorKind`] whose string form is stable across
//! releases. Operators grep logs and exporters filter event streams by these
//! strings, so variants are never renamed, only added.

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Stable machine-readable tag attached to every failure.
///
/// The [`as_str`](Self::as_str) form is what appears in `error.raised`
/// events, `graph.finish` payloads, and run results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum ErrorKind {
    // Referential failures detected while normalizing the document.
    MetaVersionUnsupported,
    ProviderDup,
    ToolDup,
    ComponentDup,
    NodeDup,
    HistoryDup,
    OutputKeyCollision,
    GraphEntryNotFound,
    EdgeEndpointInvalid,
    ComponentProviderNotFound,
    ComponentToolNotFound,
    NodeComponentNotFound,
    /// A section or field has the wrong shape (list where a mapping was
    /// expected, non-string id, and so on).
    DocShape,

    // Materialization failures raised by the registry.
    ComponentImport,
    ToolImport,
    SignatureMismatch,
    PermType,

    // Graph compilation failures.
    NodeType,
    ProviderMissing,
    RouterNoMatch,
    MapBodyMissing,

    // Runtime failures.
    NodeRuntime,
    MapOverNotArray,
    ParallelEmpty,

    // Policy failures. Never offered to the retry layer.
    RetryPredicate,
    RlPolicyParam,
    ToolPermissionDenied,
    CostLimitExceeded,
    LlmJsonParse,
}

impl ErrorKind {
    /// The stable string form used in events and run results.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            ErrorKind::MetaVersionUnsupported => "META_VERSION_UNSUPPORTED",
            ErrorKind::ProviderDup => "PROVIDER_DUP",
            ErrorKind::ToolDup => "TOOL_DUP",
            ErrorKind::ComponentDup => "COMPONENT_DUP",
            ErrorKind::NodeDup => "NODE_DUP",
            ErrorKind::HistoryDup => "HISTORY_DUP",
            ErrorKind::OutputKeyCollision => "OUTPUT_KEY_COLLISION",
            ErrorKind::GraphEntryNotFound => "GRAPH_ENTRY_NOT_FOUND",
            ErrorKind::EdgeEndpointInvalid => "EDGE_ENDPOINT_INVALID",
            ErrorKind::ComponentProviderNotFound => "COMPONENT_PROVIDER_NOT_FOUND",
            ErrorKind::ComponentToolNotFound => "COMPONENT_TOOL_NOT_FOUND",
            ErrorKind::NodeComponentNotFound => "NODE_COMPONENT_NOT_FOUND",
            ErrorKind::DocShape => "DOC_SHAPE",
            ErrorKind::ComponentImport => "COMPONENT_IMPORT",
            ErrorKind::ToolImport => "TOOL_IMPORT",
            ErrorKind::SignatureMismatch => "SIGNATURE_MISMATCH",
            ErrorKind::PermType => "PERM_TYPE",
            ErrorKind::NodeType => "NODE_TYPE",
            ErrorKind::ProviderMissing => "PROVIDER_MISSING",
            ErrorKind::RouterNoMatch => "ROUTER_NO_MATCH",
            ErrorKind::MapBodyMissing => "MAP_BODY_MISSING",
            ErrorKind::NodeRuntime => "NODE_RUNTIME",
            ErrorKind::MapOverNotArray => "MAP_OVER_NOT_ARRAY",
            ErrorKind::ParallelEmpty => "PARALLEL_EMPTY",
            ErrorKind::RetryPredicate => "RETRY_PREDICATE",
            ErrorKind::RlPolicyParam => "RL_POLICY_PARAM",
            ErrorKind::ToolPermissionDenied => "TOOL_PERMISSION_DENIED",
            ErrorKind::CostLimitExceeded => "COST_LIMIT_EXCEEDED",
            ErrorKind::LlmJsonParse => "LLM_JSON_PARSE",
        }
    }

    /// Policy-raised kinds are final: the retry layer must not touch them.
    #[must_use]
    pub const fn is_policy(self) -> bool {
        matches!(
            self,
            ErrorKind::RetryPredicate
                | ErrorKind::RlPolicyParam
                | ErrorKind::ToolPermissionDenied
                | ErrorKind::CostLimitExceeded
                | ErrorKind::LlmJsonParse
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raised when a document cannot be normalized into the IR.
///
/// The `pointer` is a json-pointer-like path (`/graph/nodes/2/next`)
/// identifying the field at fault.
#[derive(Debug, Clone, Error, Diagnostic, PartialEq, Eq)]
#[error("[{kind}] {message} at {pointer}")]
#[diagnostic(
    code(graphloom::normalize),
    help("Fix the field at the reported pointer and reload the document.")
)]
pub struct NormalizeError {
    pub kind: ErrorKind,
    pub message: String,
    pub pointer: String,
}

impl NormalizeError {
    pub fn new(kind: ErrorKind, message: impl Into<String>, pointer: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            pointer: pointer.into(),
        }
    }
}

/// Raised when a provider, tool, component, or history backend cannot be
/// materialized through the registered factories.
#[derive(Debug, Error, Diagnostic)]
#[error("[{kind}] {message} at {pointer}")]
#[diagnostic(
    code(graphloom::resolve),
    help("Check the factory registrations for the type named in the message.")
)]
pub struct ResolveError {
    pub kind: ErrorKind,
    pub message: String,
    pub pointer: String,
}

impl ResolveError {
    pub fn new(kind: ErrorKind, message: impl Into<String>, pointer: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            pointer: pointer.into(),
        }
    }
}

/// Raised when the normalized IR cannot be compiled into an executable graph.
#[derive(Debug, Error, Diagnostic)]
#[error("[{kind}] {message} at {pointer}")]
#[diagnostic(code(graphloom::build))]
pub struct BuildError {
    pub kind: ErrorKind,
    pub message: String,
    pub pointer: String,
}

impl BuildError {
    pub fn new(kind: ErrorKind, message: impl Into<String>, pointer: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            pointer: pointer.into(),
        }
    }
}

impl From<ResolveError> for BuildError {
    fn from(err: ResolveError) -> Self {
        BuildError {
            kind: err.kind,
            message: err.message,
            pointer: err.pointer,
        }
    }
}

/// A fatal failure inside a running graph.
///
/// `status` carries an HTTP-ish status when the underlying component
/// reported one; the retry layer uses it to classify transient failures.
#[derive(Debug, Clone, Error, Diagnostic)]
#[error("[{kind}] {message}")]
#[diagnostic(code(graphloom::execution))]
pub struct ExecutionError {
    pub kind: ErrorKind,
    pub message: String,
    pub node_id: Option<String>,
    pub status: Option<u16>,
}

impl ExecutionError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            node_id: None,
            status: None,
        }
    }

    pub fn node(kind: ErrorKind, node_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            node_id: Some(node_id.into()),
            status: None,
        }
    }

    #[must_use]
    pub fn with_status(mut self, status: Option<u16>) -> Self {
        self.status = status;
        self
    }
}
