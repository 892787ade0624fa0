//! Run-scoped token accounting.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;

use crate::errors::{ErrorKind, ExecutionError};
use crate::runtimes::executors::{ExecEnv, ExecScope, NodeExecutor, NodeInterrupt, NodeOutcome};

/// Tallies `llm.call` token usage for one run and enforces the per-run cap.
pub struct CostMeter {
    limit: Option<u64>,
    spent: Mutex<u64>,
}

impl CostMeter {
    #[must_use]
    pub fn new(limit: Option<u64>) -> Self {
        Self {
            limit,
            spent: Mutex::new(0),
        }
    }

    /// Add one call's usage. Returns the new total, or an error carrying the
    /// total once the cap is crossed. The total is recorded either way so
    /// the tally reflects every emitted `llm.call`.
    pub fn record(&self, tokens_in: Option<u64>, tokens_out: Option<u64>) -> Result<u64, u64> {
        let used = tokens_in.unwrap_or(0) + tokens_out.unwrap_or(0);
        let mut spent = self.spent.lock();
        *spent += used;
        match self.limit {
            Some(limit) if *spent > limit => Err(*spent),
            _ => Ok(*spent),
        }
    }

    #[must_use]
    pub fn spent(&self) -> u64 {
        *self.spent.lock()
    }

    #[must_use]
    pub fn within_limit(&self) -> bool {
        match self.limit {
            Some(limit) => *self.spent.lock() <= limit,
            None => true,
        }
    }

    #[must_use]
    pub fn limit(&self) -> Option<u64> {
        self.limit
    }
}

/// Refuses to start a node once the run's tally is over budget, so an
/// exceeded cap aborts before the next node rather than mid-flight.
pub struct CostGate {
    pub(crate) node_id: String,
    pub(crate) inner: Arc<dyn NodeExecutor>,
}

#[async_trait]
impl NodeExecutor for CostGate {
    async fn execute(&self, env: &ExecEnv, scope: &ExecScope) -> Result<NodeOutcome, NodeInterrupt> {
        if !env.ctx.cost.within_limit() {
            let limit = env.ctx.cost.limit().unwrap_or(0);
            return Err(NodeInterrupt::Failed(ExecutionError::node(
                ErrorKind::CostLimitExceeded,
                self.node_id.clone(),
                format!(
                    "run '{}' exceeded token budget ({} > {limit})",
                    env.ctx.run_id,
                    env.ctx.cost.spent(),
                ),
            )));
        }
        self.inner.execute(env, scope).await
    }
}
