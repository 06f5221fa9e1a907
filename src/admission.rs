//! Admission gate: maps limiter decisions onto request outcomes.
//!
//! The limiter reports store failures as errors and never guesses. This is
//! where the fail-open / fail-closed choice is made, explicitly, from
//! configuration.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::error::GateError;
use crate::ratelimit::{ClientKey, Decision, RateLimiterBackend};

/// What to do with a request when the counter store is unavailable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Admit every request while the store is down
    FailOpen,
    /// Answer every request with a server error while the store is down
    #[default]
    FailClosed,
}

/// Outcome of gating one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Let the request through. `decision` is `None` when admitted by
    /// fail-open.
    Proceed { decision: Option<Decision> },
    /// Over the limit.
    Reject { decision: Decision },
    /// The store could not be consulted and the gate fails closed.
    Unavailable { reason: String },
    /// The caller's address could not be turned into a client key.
    BadRequest { reason: String },
}

impl Admission {
    /// HTTP status code an HTTP layer should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            Admission::Proceed { .. } => 200,
            Admission::Reject { .. } => 429,
            Admission::Unavailable { .. } => 503,
            Admission::BadRequest { .. } => 400,
        }
    }

    pub fn is_proceed(&self) -> bool {
        matches!(self, Admission::Proceed { .. })
    }

    /// Whole seconds for a `Retry-After` header on rejection, rounded up.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Admission::Reject { decision } => Some(ceil_secs(decision.reset_after)),
            _ => None,
        }
    }
}

fn ceil_secs(d: Duration) -> u64 {
    d.as_secs() + u64::from(d.subsec_nanos() > 0)
}

/// Front door for request handlers.
pub struct AdmissionGate<R: RateLimiterBackend> {
    limiter: Arc<R>,
    failure_policy: FailurePolicy,
}

impl<R: RateLimiterBackend> AdmissionGate<R> {
    pub fn new(limiter: Arc<R>, failure_policy: FailurePolicy) -> Self {
        info!(failure_policy = ?failure_policy, "Admission gate initialized");
        Self {
            limiter,
            failure_policy,
        }
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        self.failure_policy
    }

    /// Gate a request identified by `client_key`.
    pub async fn admit(&self, client_key: &ClientKey) -> Admission {
        match self.limiter.is_allowed(client_key.as_str()).await {
            Ok(decision) if decision.allowed => Admission::Proceed {
                decision: Some(decision),
            },
            Ok(decision) => Admission::Reject { decision },
            Err(err) => self.on_error(err),
        }
    }

    /// Gate a request by remote `host:port` address and route.
    #[instrument(skip_all, fields(route = %route))]
    pub async fn admit_remote(&self, remote_addr: &str, route: &str) -> Admission {
        match ClientKey::from_remote_addr(remote_addr, route) {
            Ok(key) => {
                let admission = self.admit(&key).await;
                debug!(status = admission.status_code(), "Admission decided");
                admission
            }
            Err(err) => {
                warn!(error = %err, "Rejecting request with unusable remote address");
                Admission::BadRequest {
                    reason: err.to_string(),
                }
            }
        }
    }

    fn on_error(&self, err: GateError) -> Admission {
        match self.failure_policy {
            FailurePolicy::FailOpen => {
                warn!(error = %err, "Rate limiter unavailable, failing open");
                Admission::Proceed { decision: None }
            }
            FailurePolicy::FailClosed => {
                warn!(error = %err, "Rate limiter unavailable, failing closed");
                Admission::Unavailable {
                    reason: err.to_string(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Result, StoreError};
    use async_trait::async_trait;

    /// Backend answering from a fixed script.
    enum Scripted {
        Allow,
        Deny,
        Fail,
    }

    fn decision(allowed: bool) -> Decision {
        Decision {
            allowed,
            count: if allowed { 1 } else { 6 },
            limit: 5,
            reset_after: Duration::from_millis(4_200),
        }
    }

    #[async_trait]
    impl RateLimiterBackend for Scripted {
        async fn is_allowed(&self, _client_key: &str) -> Result<Decision> {
            match self {
                Scripted::Allow => Ok(decision(true)),
                Scripted::Deny => Ok(decision(false)),
                Scripted::Fail => Err(StoreError::Connection("refused".into()).into()),
            }
        }
    }

    #[tokio::test]
    async fn test_allow_maps_to_proceed() {
        let gate = AdmissionGate::new(Arc::new(Scripted::Allow), FailurePolicy::FailClosed);
        let admission = gate.admit(&ClientKey::new("c")).await;

        assert!(admission.is_proceed());
        assert_eq!(admission.status_code(), 200);
        assert_eq!(admission.retry_after_secs(), None);
    }

    #[tokio::test]
    async fn test_deny_maps_to_429_with_retry_after() {
        let gate = AdmissionGate::new(Arc::new(Scripted::Deny), FailurePolicy::FailOpen);
        let admission = gate.admit(&ClientKey::new("c")).await;

        assert_eq!(admission.status_code(), 429);
        assert_eq!(admission.retry_after_secs(), Some(5));
    }

    #[tokio::test]
    async fn test_store_failure_fail_closed() {
        let gate = AdmissionGate::new(Arc::new(Scripted::Fail), FailurePolicy::FailClosed);
        let admission = gate.admit(&ClientKey::new("c")).await;

        assert_eq!(admission.status_code(), 503);
        assert!(matches!(admission, Admission::Unavailable { .. }));
    }

    #[tokio::test]
    async fn test_store_failure_fail_open() {
        let gate = AdmissionGate::new(Arc::new(Scripted::Fail), FailurePolicy::FailOpen);
        let admission = gate.admit(&ClientKey::new("c")).await;

        assert_eq!(admission, Admission::Proceed { decision: None });
    }

    #[tokio::test]
    async fn test_admit_remote_rejects_bad_address() {
        let gate = AdmissionGate::new(Arc::new(Scripted::Allow), FailurePolicy::FailClosed);

        let admission = gate.admit_remote("no-port-here", "/recipe").await;
        assert_eq!(admission.status_code(), 400);

        let admission = gate.admit_remote("198.51.100.4:40000", "/recipe").await;
        assert_eq!(admission.status_code(), 200);
    }

    #[test]
    fn test_failure_policy_serde_names() {
        let policy: FailurePolicy = serde_yaml::from_str("fail_open").unwrap();
        assert_eq!(policy, FailurePolicy::FailOpen);
        assert_eq!(FailurePolicy::default(), FailurePolicy::FailClosed);
    }
}
