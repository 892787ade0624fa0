//! Policy decorators installed around every node executor.
//!
//! The stack is assembled once per node by the graph builder, outermost
//! first: **permissions → cost → rate limit → retry → base executor**.
//! Masking is the fifth policy and applies on the event-bus emission path
//! rather than around the executor. Per-run state (the cost tally, diff-mask
//! memory) lives in the run context; rate-limit buckets are interned at
//! build time and shared across runs.

pub mod cost;
pub mod masking;
pub mod permissions;
pub mod rate_limit;
pub mod retry;

pub use cost::{CostGate, CostMeter};
pub use masking::MaskingEngine;
pub use permissions::{PermissionGate, PermissionManager};
pub use rate_limit::{RateLimitGate, RateLimiterManager};
pub use retry::{RetryLayer, RetryPolicy};
