//! Permission enforcement for tool- and component-backed nodes.

use async_trait::async_trait;
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::Arc;

use crate::errors::{ErrorKind, ExecutionError};
use crate::ir::model::PermissionsIr;
use crate::runtimes::executors::{ExecEnv, ExecScope, NodeExecutor, NodeInterrupt, NodeOutcome};

/// Tracks allowed permissions per target id.
///
/// A required permission is satisfied when it appears in the policy's
/// `default_allow` set or in the per-target allow list.
pub struct PermissionManager {
    default_allow: FxHashSet<String>,
    allow: FxHashMap<String, FxHashSet<String>>,
}

impl PermissionManager {
    #[must_use]
    pub fn new(config: &PermissionsIr) -> Self {
        Self {
            default_allow: config.default_allow.iter().cloned().collect(),
            allow: config
                .allow
                .iter()
                .map(|(target, values)| (target.clone(), values.iter().cloned().collect()))
                .collect(),
        }
    }

    /// Check required permissions for a target. Returns the sorted missing
    /// set on failure.
    pub fn check(&self, target: &str, required: &[String]) -> Result<(), Vec<String>> {
        let target_allow = self.allow.get(target);
        let mut missing: Vec<String> = required
            .iter()
            .filter(|perm| {
                !self.default_allow.contains(*perm)
                    && !target_allow.is_some_and(|set| set.contains(*perm))
            })
            .cloned()
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            missing.sort();
            missing.dedup();
            Err(missing)
        }
    }
}

/// Outermost stack layer: refuses execution when the materialized instance
/// declares permissions the policy does not grant. Never retried.
pub struct PermissionGate {
    pub(crate) node_id: String,
    /// The id permissions are keyed by: the component id backing the node.
    pub(crate) target: String,
    pub(crate) required: Vec<String>,
    pub(crate) manager: Arc<PermissionManager>,
    pub(crate) inner: Arc<dyn NodeExecutor>,
}

#[async_trait]
impl NodeExecutor for PermissionGate {
    async fn execute(&self, env: &ExecEnv, scope: &ExecScope) -> Result<NodeOutcome, NodeInterrupt> {
        if let Err(missing) = self.manager.check(&self.target, &self.required) {
            return Err(NodeInterrupt::Failed(ExecutionError::node(
                ErrorKind::ToolPermissionDenied,
                self.node_id.clone(),
                format!("component '{}' lacks permissions: {missing:?}", self.target),
            )));
        }
        self.inner.execute(env, scope).await
    }
}
