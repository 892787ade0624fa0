//! IR records: immutable after normalization, consumed read-only downstream.
//!
//! Identifiers are strings unique within their kind; all cross-references
//! have been validated by the time one of these records exists. Free-form
//! configuration stays as [`JsonMap`] values; the IR types the *structure*
//! of the document, not the host-specific payloads inside `config` blocks.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::utils::collections::JsonMap;

/// Non-blocking compatibility warning emitted during normalization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizationWarning {
    pub code: String,
    pub message: String,
    pub pointer: String,
}

impl NormalizationWarning {
    pub fn new(
        code: impl Into<String>,
        message: impl Into<String>,
        pointer: impl Into<String>,
    ) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            pointer: pointer.into(),
        }
    }
}

/// An external LLM endpoint declaration, materialized lazily into an opaque
/// handle by the registry.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderIr {
    pub id: String,
    pub type_name: String,
    pub config: JsonMap,
}

/// A callable side-effecting capability, optionally provider-backed and
/// optionally gated by permissions declared in its config.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolIr {
    pub id: String,
    pub type_name: String,
    pub provider: Option<String>,
    pub config: JsonMap,
}

/// A reusable logic unit bound to graph nodes.
///
/// `inputs`/`outputs` are expression maps acting as per-component defaults;
/// node-level maps override them key by key. `defaults` fills resolved
/// `null` inputs with literal values.
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentIr {
    pub id: String,
    pub type_name: String,
    pub provider: Option<String>,
    pub tool: Option<String>,
    pub inputs: JsonMap,
    pub outputs: JsonMap,
    pub config: JsonMap,
    pub defaults: JsonMap,
}

/// The closed set of node kinds the scheduler can dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Llm,
    Tool,
    Router,
    Map,
    Parallel,
    Component,
}

impl NodeKind {
    /// Parse a document `type` tag. The generic spellings `component`,
    /// `node`, and `task` all mean a plain component-backed node.
    #[must_use]
    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "llm" => Some(NodeKind::Llm),
            "tool" => Some(NodeKind::Tool),
            "router" => Some(NodeKind::Router),
            "map" => Some(NodeKind::Map),
            "parallel" => Some(NodeKind::Parallel),
            "component" | "node" | "task" => Some(NodeKind::Component),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            NodeKind::Llm => "llm",
            NodeKind::Tool => "tool",
            NodeKind::Router => "router",
            NodeKind::Map => "map",
            NodeKind::Parallel => "parallel",
            NodeKind::Component => "component",
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The polymorphic `next` field, parsed exactly once by the normalizer.
///
/// The run loop never re-inspects the raw document shape: terminal nodes,
/// single successors, parallel fan-out lists, and route maps are all
/// distinguished here.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum NextIr {
    #[default]
    None,
    Single(String),
    Fanout(Vec<String>),
    Routes(FxHashMap<String, String>),
}

impl NextIr {
    /// Every node id this successor spec can reach.
    pub fn targets(&self) -> Vec<&str> {
        match self {
            NextIr::None => Vec::new(),
            NextIr::Single(id) => vec![id.as_str()],
            NextIr::Fanout(ids) => ids.iter().map(String::as_str).collect(),
            NextIr::Routes(routes) => routes.values().map(String::as_str).collect(),
        }
    }
}

/// A graph vertex.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeIr {
    pub id: String,
    pub kind: NodeKind,
    pub component: Option<String>,
    pub inputs: JsonMap,
    pub outputs: JsonMap,
    pub config: JsonMap,
    pub next: NextIr,
    /// Document location, kept for error reporting downstream.
    pub pointer: String,
}

/// One declared graph-level output: `key` in the result map reads
/// `output` from node `node_id`'s recorded outputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphOutputIr {
    pub key: String,
    pub node_id: String,
    pub output: String,
}

/// Conversation history declaration. The backend config is opaque to the
/// core; the registry turns it into a handle components reach through
/// `ctx.registries`.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryIr {
    pub id: String,
    pub backend: JsonMap,
    pub system_message: Option<String>,
}

/// The executable graph section of the document.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphIr {
    pub entry: String,
    pub nodes: FxHashMap<String, NodeIr>,
    pub outputs: Vec<GraphOutputIr>,
}

/// Runtime section: an opaque engine tag plus defaults the normalizer
/// already folded into the records that needed them.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeIr {
    pub engine: String,
    pub graph_name: Option<String>,
    pub defaults: JsonMap,
    pub default_provider: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    Fixed,
    Exponential,
    Jitter,
}

/// One retry policy: strategy, attempt cap, base interval, jitter width.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicyIr {
    pub strategy: RetryStrategy,
    pub max_attempts: u32,
    pub interval: f64,
    pub jitter: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetryPoliciesIr {
    pub default: Option<RetryPolicyIr>,
    pub overrides: FxHashMap<String, RetryPolicyIr>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RateLimitAlgorithm {
    TokenBucket { capacity: u32, refill_rate: f64 },
    FixedWindow { limit: u32, window: f64 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitRuleIr {
    pub target: String,
    pub algorithm: RateLimitAlgorithm,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RateLimitPoliciesIr {
    pub providers: Vec<RateLimitRuleIr>,
    pub nodes: Vec<RateLimitRuleIr>,
    /// Provider id → shared bucket alias. Several providers mapped to one
    /// alias share a single bucket.
    pub shared_providers: FxHashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MaskingIr {
    pub fields: Vec<String>,
    pub diff_fields: Vec<String>,
    pub mask_value: String,
}

impl Default for MaskingIr {
    fn default() -> Self {
        Self {
            fields: Vec::new(),
            diff_fields: Vec::new(),
            mask_value: "***".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PermissionsIr {
    pub default_allow: Vec<String>,
    pub allow: FxHashMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CostIr {
    pub per_run_tokens: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PoliciesIr {
    pub retry: RetryPoliciesIr,
    pub rate_limit: RateLimitPoliciesIr,
    pub masking: MaskingIr,
    pub permissions: PermissionsIr,
    pub cost: CostIr,
}

/// How a map node treats a failed element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MapFailureMode {
    /// First failure cancels sibling iterations and fails the map node.
    #[default]
    FailFast,
    /// Record an `{index, error}` object in the result list and keep going.
    CollectErrors,
    /// Drop the failed element from the result list.
    SkipFailed,
}

impl MapFailureMode {
    #[must_use]
    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "fail_fast" => Some(MapFailureMode::FailFast),
            "collect_errors" => Some(MapFailureMode::CollectErrors),
            "skip_failed" => Some(MapFailureMode::SkipFailed),
            _ => None,
        }
    }
}

/// The fully validated document.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowIr {
    pub meta: JsonMap,
    pub runtime: RuntimeIr,
    pub providers: FxHashMap<String, ProviderIr>,
    pub tools: FxHashMap<String, ToolIr>,
    pub components: FxHashMap<String, ComponentIr>,
    pub graph: GraphIr,
    pub policies: PoliciesIr,
    pub histories: FxHashMap<String, HistoryIr>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_kind_parses_generic_spellings() {
        assert_eq!(NodeKind::parse("llm"), Some(NodeKind::Llm));
        assert_eq!(NodeKind::parse("node"), Some(NodeKind::Component));
        assert_eq!(NodeKind::parse("task"), Some(NodeKind::Component));
        assert_eq!(NodeKind::parse("loop"), None);
    }

    #[test]
    fn next_targets_cover_every_variant() {
        assert!(NextIr::None.targets().is_empty());
        assert_eq!(NextIr::Single("b".into()).targets(), vec!["b"]);
        assert_eq!(
            NextIr::Fanout(vec!["a".into(), "b".into()]).targets(),
            vec!["a", "b"]
        );
        let mut routes = FxHashMap::default();
        routes.insert("ok".to_string(), "a".to_string());
        let routes_ir = NextIr::Routes(routes);
        let targets = routes_ir.targets();
        assert_eq!(targets, vec!["a"]);
    }

    #[test]
    fn masking_defaults_to_three_stars() {
        assert_eq!(MaskingIr::default().mask_value, "***");
    }
}
