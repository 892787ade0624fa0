//! Retry with fixed, exponential, and jittered backoff.
//!
//! A failure is retryable when it is a plain runtime error (never a policy
//! error) and either carries HTTP status 429/5xx or mentions a transient
//! condition in its message. Each scheduled retry emits `retry.attempt`
//! with the 1-based attempt index, the computed delay, and the error text
//! (masked on the bus like every payload). Retry sleeps are cancellable.

use async_trait::async_trait;
use rand::Rng;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::errors::{ErrorKind, ExecutionError};
use crate::event_bus::EventKind;
use crate::ir::model::{RetryPolicyIr, RetryStrategy};
use crate::runtimes::executors::{ExecEnv, ExecScope, NodeExecutor, NodeInterrupt, NodeOutcome};
use crate::utils::collections::JsonMap;

/// Resolved retry policy for one node.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub strategy: RetryStrategy,
    pub max_attempts: u32,
    pub interval: f64,
    pub jitter: f64,
}

impl RetryPolicy {
    #[must_use]
    pub fn from_ir(ir: &RetryPolicyIr) -> Self {
        Self {
            strategy: ir.strategy,
            max_attempts: ir.max_attempts,
            interval: ir.interval,
            jitter: ir.jitter,
        }
    }

    /// Delay before the given 1-based retry attempt.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> f64 {
        match self.strategy {
            RetryStrategy::Fixed => self.interval,
            RetryStrategy::Exponential => {
                self.interval * 2f64.powi(attempt.saturating_sub(1) as i32)
            }
            RetryStrategy::Jitter => {
                let extra = if self.jitter > 0.0 {
                    rand::thread_rng().gen_range(0.0..=self.jitter)
                } else {
                    0.0
                };
                self.interval + extra
            }
        }
    }
}

/// Whether a failure is worth another attempt.
#[must_use]
pub fn retryable(error: &ExecutionError) -> bool {
    if error.kind != ErrorKind::NodeRuntime {
        return false;
    }
    if let Some(status) = error.status {
        if status == 429 || (500..600).contains(&status) {
            return true;
        }
    }
    let message = error.message.to_lowercase();
    message.contains("timeout") || message.contains("temporarily") || message.contains("retry")
}

/// Stack layer that re-runs the inner executor on transient failures.
///
/// `max_attempts = 1` behaves exactly like no retry. Cancellation is
/// checked before every sleep and never retried.
pub struct RetryLayer {
    pub(crate) node_id: String,
    pub(crate) policy: Option<RetryPolicy>,
    pub(crate) inner: Arc<dyn NodeExecutor>,
}

#[async_trait]
impl NodeExecutor for RetryLayer {
    async fn execute(&self, env: &ExecEnv, scope: &ExecScope) -> Result<NodeOutcome, NodeInterrupt> {
        let Some(policy) = self.policy else {
            return self.inner.execute(env, scope).await;
        };
        let mut attempt = 0u32;
        loop {
            match self.inner.execute(env, scope).await {
                Ok(outcome) => return Ok(outcome),
                Err(NodeInterrupt::Cancelled) => return Err(NodeInterrupt::Cancelled),
                Err(NodeInterrupt::Failed(error)) => {
                    attempt += 1;
                    if attempt >= policy.max_attempts
                        || !retryable(&error)
                        || scope.cancel.is_cancelled()
                    {
                        return Err(NodeInterrupt::Failed(error));
                    }
                    let delay = policy.delay_for(attempt);
                    let mut payload = JsonMap::new();
                    payload.insert("node_id".to_string(), Value::from(self.node_id.clone()));
                    payload.insert("attempt".to_string(), Value::from(attempt));
                    payload.insert(
                        "delay".to_string(),
                        serde_json::Number::from_f64(delay)
                            .map_or(Value::Null, Value::Number),
                    );
                    payload.insert("error".to_string(), Value::from(error.to_string()));
                    env.ctx.emitter.emit(EventKind::RetryAttempt, payload);
                    if delay > 0.0 {
                        tokio::select! {
                            biased;
                            _ = scope.cancel.cancelled() => return Err(NodeInterrupt::Cancelled),
                            _ = tokio::time::sleep(Duration::from_secs_f64(delay)) => {}
                        }
                    }
                }
            }
        }
    }
}
