//! Sliding-window counter.
//!
//! Each check increments the client's current bucket and sums the trailing
//! `num_sub_windows` buckets in one store round trip. The sum approximates a
//! true sliding window to within one sub-window.
//!
//! Retrying a failed [`SlidingWindowLimiter::is_allowed`] call is safe but
//! may count the request twice if the first attempt reached the store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, trace, warn};

use super::backend::RateLimiterBackend;
use super::bucket::BucketSpan;
use super::clock::{Clock, SystemClock};
use super::identity::{IdentityHasher, Salt, StoreKey, DEFAULT_POOL_CAPACITY};
use super::policy::RateLimitPolicy;
use crate::error::{Result, StoreError};
use crate::store::{CounterBatch, CounterStore, ExpiryMode};

/// Prefix applied to every store key.
pub const DEFAULT_KEY_PREFIX: &str = "rate_limit:";
/// Default bound on one store round trip.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(250);

/// Outcome of one admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// Requests counted in the trailing window, this one included.
    pub count: u64,
    /// The configured limit.
    pub limit: u64,
    /// Time until the current sub-window closes.
    pub reset_after: Duration,
}

impl Decision {
    /// Requests still admissible in the current window.
    pub fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.count)
    }
}

/// Tunables besides the policy itself.
#[derive(Debug, Clone)]
pub struct LimiterOptions {
    pub key_prefix: String,
    pub expiry: ExpiryMode,
    pub store_timeout: Duration,
    pub pool_capacity: usize,
}

impl Default for LimiterOptions {
    fn default() -> Self {
        Self {
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            expiry: ExpiryMode::Field,
            store_timeout: DEFAULT_STORE_TIMEOUT,
            pool_capacity: DEFAULT_POOL_CAPACITY,
        }
    }
}

/// Distributed sliding-window rate limiter.
///
/// Holds only immutable state; all counts live in the store, so one instance
/// can be shared across every request task and many instances can share one
/// store.
#[derive(Debug)]
pub struct SlidingWindowLimiter<S: CounterStore> {
    policy: RateLimitPolicy,
    hasher: IdentityHasher,
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    options: LimiterOptions,
}

impl<S: CounterStore> SlidingWindowLimiter<S> {
    /// Create a limiter on the system clock with default options.
    pub fn new(policy: RateLimitPolicy, salt: Salt, store: Arc<S>) -> Self {
        Self::with_options(
            policy,
            salt,
            store,
            Arc::new(SystemClock::new()),
            LimiterOptions::default(),
        )
    }

    pub fn with_options(
        policy: RateLimitPolicy,
        salt: Salt,
        store: Arc<S>,
        clock: Arc<dyn Clock>,
        options: LimiterOptions,
    ) -> Self {
        Self {
            policy,
            hasher: IdentityHasher::with_pool_capacity(salt, options.pool_capacity),
            store,
            clock,
            options,
        }
    }

    pub fn policy(&self) -> &RateLimitPolicy {
        &self.policy
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Namespaced store key for a client.
    pub fn store_key(&self, client_key: &str) -> String {
        self.hasher
            .digest(client_key)
            .namespaced(&self.options.key_prefix)
    }

    /// Count one request for `client_key` and decide whether it may proceed.
    ///
    /// The request that brings the window total to exactly `limit` is
    /// admitted; the next one is the first rejected.
    ///
    /// # Errors
    /// Returns [`GateError::StoreUnavailable`](crate::error::GateError::StoreUnavailable)
    /// if the store fails or does not answer within the configured timeout.
    /// The error is never turned into an allow or a deny here.
    pub async fn is_allowed(&self, client_key: &str) -> Result<Decision> {
        let digest = self.hasher.digest(client_key);
        let now_ms = self.clock.now_millis();
        let span = self.span_at(now_ms);

        let batch = CounterBatch {
            key: digest.namespaced(&self.options.key_prefix),
            field: span.current_field(),
            increment: 1,
            ttl: self.policy.window_size(),
            expiry: self.options.expiry,
            reads: span.trailing_fields(),
        };

        trace!(
            store_key = %digest,
            bucket = span.current,
            buckets = span.trailing.len(),
            "Checking sliding window"
        );

        let values = self
            .bounded(&digest, self.store.record_and_read(&batch))
            .await?;

        let decision = self.decide(&values, 0, &span, now_ms);
        if !decision.allowed {
            debug!(
                store_key = %digest,
                count = decision.count,
                limit = decision.limit,
                "Sliding window limit exceeded"
            );
        }
        Ok(decision)
    }

    /// Report whether a counted check issued now would be admitted, without
    /// counting anything.
    pub async fn peek(&self, client_key: &str) -> Result<Decision> {
        let digest = self.hasher.digest(client_key);
        let now_ms = self.clock.now_millis();
        let span = self.span_at(now_ms);

        let key = digest.namespaced(&self.options.key_prefix);
        let fields = span.trailing_fields();
        let values = self
            .bounded(&digest, self.store.read(&key, &fields))
            .await?;

        let mut decision = self.decide(&values, 1, &span, now_ms);
        decision.count -= 1;
        Ok(decision)
    }

    fn span_at(&self, now_ms: u64) -> BucketSpan {
        BucketSpan::at(
            now_ms,
            self.policy.sub_window_size_ms(),
            self.policy.num_sub_windows(),
        )
    }

    /// Sum bucket reads (missing fields count as zero) plus `pending` and
    /// compare against the limit.
    fn decide(
        &self,
        values: &[Option<u64>],
        pending: u64,
        span: &BucketSpan,
        now_ms: u64,
    ) -> Decision {
        let count = values
            .iter()
            .map(|v| v.unwrap_or(0))
            .fold(pending, u64::saturating_add);

        Decision {
            allowed: count <= self.policy.limit(),
            count,
            limit: self.policy.limit(),
            reset_after: Duration::from_millis(
                span.millis_until_rollover(now_ms, self.policy.sub_window_size_ms()),
            ),
        }
    }

    async fn bounded<F>(&self, digest: &StoreKey, op: F) -> Result<Vec<Option<u64>>>
    where
        F: std::future::Future<Output = std::result::Result<Vec<Option<u64>>, StoreError>>,
    {
        let timeout = self.options.store_timeout;
        match tokio::time::timeout(timeout, op).await {
            Ok(Ok(values)) => Ok(values),
            Ok(Err(e)) => {
                warn!(store_key = %digest, error = %e, "Counter store request failed");
                Err(e.into())
            }
            Err(_) => {
                warn!(store_key = %digest, timeout = ?timeout, "Counter store request timed out");
                Err(StoreError::Timeout(Some(timeout)).into())
            }
        }
    }
}

#[async_trait]
impl<S: CounterStore + 'static> RateLimiterBackend for SlidingWindowLimiter<S> {
    async fn is_allowed(&self, client_key: &str) -> Result<Decision> {
        SlidingWindowLimiter::is_allowed(self, client_key).await
    }
}
