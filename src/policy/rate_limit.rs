//! Rate limiting with per-node and per-provider scopes.
//!
//! Two algorithms: token bucket (capacity + refill per second) and fixed
//! window (at most N calls per W seconds). Buckets are interned once at
//! build time and shared by every run of the graph; each bucket guards its
//! own state with a mutex and sleeps *outside* the lock. A `shared_providers`
//! alias maps several provider ids onto one bucket.
//!
//! Every wait emits `rate.limit.wait` with the scope, target, and computed
//! wait seconds (`null` when the bucket can never refill). Waits are
//! cancellable: a fired token interrupts the sleep immediately.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use async_trait::async_trait;

use crate::event_bus::{EventKind, RunEmitter};
use crate::ir::model::{RateLimitAlgorithm, RateLimitPoliciesIr};
use crate::runtimes::context::CancelToken;
use crate::runtimes::executors::{ExecEnv, ExecScope, NodeExecutor, NodeInterrupt, NodeOutcome};
use crate::utils::collections::JsonMap;

struct TokenBucket {
    capacity: f64,
    refill_rate: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    updated_at: Instant,
}

impl TokenBucket {
    fn new(capacity: u32, refill_rate: f64) -> Self {
        Self {
            capacity: f64::from(capacity),
            refill_rate,
            state: Mutex::new(BucketState {
                tokens: f64::from(capacity),
                updated_at: Instant::now(),
            }),
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.updated_at).as_secs_f64();
        if elapsed > 0.0 {
            state.tokens = (state.tokens + elapsed * self.refill_rate).min(self.capacity);
            state.updated_at = now;
        }
    }

    async fn acquire(
        &self,
        emitter: &RunEmitter,
        scope: &str,
        target: &str,
        cancel: &CancelToken,
    ) -> Result<(), NodeInterrupt> {
        let wait_time = {
            let mut state = self.state.lock();
            self.refill(&mut state);
            if state.tokens >= 1.0 {
                state.tokens -= 1.0;
                return Ok(());
            }
            if self.refill_rate > 0.0 {
                Some((1.0 - state.tokens) / self.refill_rate)
            } else {
                None
            }
        };

        emit_wait(emitter, scope, target, wait_time);
        match wait_time {
            Some(wait) => {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(NodeInterrupt::Cancelled),
                    _ = tokio::time::sleep(Duration::from_secs_f64(wait)) => {}
                }
            }
            // Zero refill never recovers: park until the run is cut off.
            None => {
                cancel.cancelled().await;
                return Err(NodeInterrupt::Cancelled);
            }
        }

        let mut state = self.state.lock();
        self.refill(&mut state);
        state.tokens = (state.tokens - 1.0).max(0.0);
        Ok(())
    }
}

struct FixedWindow {
    limit: u32,
    window: f64,
    state: Mutex<WindowState>,
}

struct WindowState {
    window_start: Instant,
    count: u32,
}

impl FixedWindow {
    fn new(limit: u32, window: f64) -> Self {
        Self {
            limit,
            window,
            state: Mutex::new(WindowState {
                window_start: Instant::now(),
                count: 0,
            }),
        }
    }

    async fn acquire(
        &self,
        emitter: &RunEmitter,
        scope: &str,
        target: &str,
        cancel: &CancelToken,
    ) -> Result<(), NodeInterrupt> {
        let wait_time = {
            let mut state = self.state.lock();
            let now = Instant::now();
            let elapsed = now.duration_since(state.window_start).as_secs_f64();
            if elapsed >= self.window {
                state.window_start = now;
                state.count = 0;
            }
            if state.count < self.limit {
                state.count += 1;
                return Ok(());
            }
            self.window - elapsed
        };

        emit_wait(emitter, scope, target, Some(wait_time.max(0.0)));
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(NodeInterrupt::Cancelled),
            _ = tokio::time::sleep(Duration::from_secs_f64(wait_time.max(0.0))) => {}
        }

        let mut state = self.state.lock();
        state.window_start = Instant::now();
        state.count = 1;
        Ok(())
    }
}

enum Limiter {
    TokenBucket(TokenBucket),
    FixedWindow(FixedWindow),
}

impl Limiter {
    fn from_algorithm(algorithm: RateLimitAlgorithm) -> Self {
        match algorithm {
            RateLimitAlgorithm::TokenBucket {
                capacity,
                refill_rate,
            } => Limiter::TokenBucket(TokenBucket::new(capacity, refill_rate)),
            RateLimitAlgorithm::FixedWindow { limit, window } => {
                Limiter::FixedWindow(FixedWindow::new(limit, window))
            }
        }
    }

    async fn acquire(
        &self,
        emitter: &RunEmitter,
        scope: &str,
        target: &str,
        cancel: &CancelToken,
    ) -> Result<(), NodeInterrupt> {
        match self {
            Limiter::TokenBucket(bucket) => bucket.acquire(emitter, scope, target, cancel).await,
            Limiter::FixedWindow(window) => window.acquire(emitter, scope, target, cancel).await,
        }
    }
}

fn emit_wait(emitter: &RunEmitter, scope: &str, target: &str, wait_time: Option<f64>) {
    let mut payload = JsonMap::new();
    payload.insert("scope".to_string(), Value::from(scope));
    payload.insert("target".to_string(), Value::from(target));
    payload.insert(
        "wait_time".to_string(),
        wait_time
            .and_then(serde_json::Number::from_f64)
            .map_or(Value::Null, Value::Number),
    );
    emitter.emit(EventKind::RateLimitWait, payload);
}

/// The interned bucket registry: per-provider and per-node limiters plus the
/// shared-alias table, resolved once from the policy section.
#[derive(Default)]
pub struct RateLimiterManager {
    providers: FxHashMap<String, Limiter>,
    nodes: FxHashMap<String, Limiter>,
    shared_providers: FxHashMap<String, String>,
}

impl RateLimiterManager {
    #[must_use]
    pub fn new(config: &RateLimitPoliciesIr) -> Self {
        let mut providers = FxHashMap::default();
        for rule in &config.providers {
            providers.insert(rule.target.clone(), Limiter::from_algorithm(rule.algorithm));
        }
        let mut nodes = FxHashMap::default();
        for rule in &config.nodes {
            nodes.insert(rule.target.clone(), Limiter::from_algorithm(rule.algorithm));
        }
        Self {
            providers,
            nodes,
            shared_providers: config.shared_providers.clone(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty() && self.nodes.is_empty()
    }

    /// Acquire the provider-scope bucket (after alias resolution) and then
    /// the node-scope bucket. Either wait is cancellable.
    pub async fn acquire(
        &self,
        node_id: &str,
        provider_id: Option<&str>,
        emitter: &RunEmitter,
        cancel: &CancelToken,
    ) -> Result<(), NodeInterrupt> {
        if let Some(provider_id) = provider_id {
            let key = self
                .shared_providers
                .get(provider_id)
                .map_or(provider_id, String::as_str);
            if let Some(limiter) = self.providers.get(key) {
                limiter.acquire(emitter, "provider", key, cancel).await?;
            }
        }
        if let Some(limiter) = self.nodes.get(node_id) {
            limiter.acquire(emitter, "node", node_id, cancel).await?;
        }
        Ok(())
    }
}

/// Stack layer that acquires rate-limit tokens before dispatching the
/// inner layers. Sits outside retry, so one node execution acquires once
/// however many attempts the retry layer makes.
pub struct RateLimitGate {
    pub(crate) node_id: String,
    pub(crate) provider_id: Option<String>,
    pub(crate) manager: Arc<RateLimiterManager>,
    pub(crate) inner: Arc<dyn NodeExecutor>,
}

#[async_trait]
impl NodeExecutor for RateLimitGate {
    async fn execute(&self, env: &ExecEnv, scope: &ExecScope) -> Result<NodeOutcome, NodeInterrupt> {
        if !self.manager.is_empty() {
            self.manager
                .acquire(
                    &self.node_id,
                    self.provider_id.as_deref(),
                    &env.ctx.emitter,
                    &scope.cancel,
                )
                .await?;
        }
        self.inner.execute(env, scope).await
    }
}
