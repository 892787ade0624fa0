//! Typed intermediate representation of a workflow document.
//!
//! [`normalizer::normalize_document`] turns the raw mapping produced by the
//! host's loader into the immutable records in [`model`], validating every
//! cross-reference on the way. Everything downstream (registry, builder,
//! scheduler) consumes the IR read-only.

pub mod model;
pub mod normalizer;

pub use model::{
    ComponentIr, CostIr, GraphIr, GraphOutputIr, HistoryIr, MapFailureMode, MaskingIr, NextIr,
    NodeIr, NodeKind, NormalizationWarning, PermissionsIr, PoliciesIr, ProviderIr,
    RateLimitAlgorithm, RateLimitPoliciesIr, RateLimitRuleIr, RetryPoliciesIr, RetryPolicyIr,
    RetryStrategy, RuntimeIr, ToolIr, WorkflowIr,
};
pub use normalizer::{normalize_document, NormalizeOutcome};
