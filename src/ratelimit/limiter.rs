//! Core rate limiter: classifies a request and consults the window store.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, trace, warn};

use super::backend::WindowStore;
use super::classifier::LimitPolicy;
use crate::error::RateLimitError;

/// Default upper bound for a single store decision.
const DEFAULT_DECISION_TIMEOUT: Duration = Duration::from_secs(1);

/// Result of checking a request against the rate limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// No enabled limit applies to the request
    Skipped,
    /// The request is within its limit
    Allowed,
    /// The request is over its limit or its key is blocked
    Denied {
        /// Time to wait before retrying
        retry_after: Duration,
    },
}

impl Verdict {
    /// Whether the request may proceed.
    pub fn is_admitted(&self) -> bool {
        !matches!(self, Verdict::Denied { .. })
    }
}

/// The rate limiter shared by all request handlers.
///
/// It depends only on the [`WindowStore`] contract, never on which store
/// backs it. This struct is thread-safe and can be shared across tasks.
pub struct RateLimiter {
    /// Store holding window and block state
    store: Arc<dyn WindowStore>,
    /// Limits and switches
    policy: LimitPolicy,
    /// Upper bound for a single store decision
    decision_timeout: Duration,
}

impl RateLimiter {
    /// Create a new rate limiter over `store`.
    pub fn new(store: Arc<dyn WindowStore>, policy: LimitPolicy) -> Self {
        Self {
            store,
            policy,
            decision_timeout: DEFAULT_DECISION_TIMEOUT,
        }
    }

    /// Bound every store decision by `timeout`.
    pub fn with_decision_timeout(mut self, timeout: Duration) -> Self {
        self.decision_timeout = timeout;
        self
    }

    /// The policy requests are classified with.
    pub fn policy(&self) -> &LimitPolicy {
        &self.policy
    }

    /// Check a request identified by an optional API token and a client address.
    ///
    /// Store failures, including a store that does not answer within the
    /// decision timeout, are returned as errors and never turned into a
    /// verdict.
    pub async fn check(&self, token: Option<&str>, ip: &str) -> Result<Verdict, RateLimitError> {
        let Some(classification) = self.policy.classify(token, ip) else {
            trace!(ip = %ip, "No rate limit applies");
            return Ok(Verdict::Skipped);
        };

        let key = classification.key.to_string_key();

        let decision = tokio::time::timeout(
            self.decision_timeout,
            self.store
                .allow(&key, classification.limit, self.policy.block_time),
        )
        .await
        .map_err(RateLimitError::from)
        .and_then(|result| result)
        .inspect_err(|e| error!(key = %key, error = %e, "Rate limit decision failed"))?;

        if decision.allowed {
            debug!(key = %key, limit = classification.limit, "Request allowed");
            Ok(Verdict::Allowed)
        } else {
            warn!(
                key = %key,
                limit = classification.limit,
                retry_after_ms = decision.retry_after.as_millis() as u64,
                "Rate limit exceeded"
            );
            Ok(Verdict::Denied {
                retry_after: decision.retry_after,
            })
        }
    }
}
