//! Rate limiter trait consumed by the admission layer.

use async_trait::async_trait;

use super::limiter::Decision;
use crate::error::Result;

/// Trait for rate limiter implementations.
///
/// The admission gate only depends on this trait, so tests can stand in a
/// limiter that fails or answers fixed decisions.
#[async_trait]
pub trait RateLimiterBackend: Send + Sync {
    /// Count one request for `client_key` and decide whether it may proceed.
    async fn is_allowed(&self, client_key: &str) -> Result<Decision>;
}
