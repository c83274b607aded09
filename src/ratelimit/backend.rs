//! Window store trait for abstracting local and shared implementations.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::RateLimitError;

/// Outcome of a single admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    /// Whether the request is admitted
    pub allowed: bool,
    /// How long the caller should wait before trying again; zero when admitted
    pub retry_after: Duration,
}

impl Decision {
    /// An admitted request.
    pub fn allowed() -> Self {
        Self {
            allowed: true,
            retry_after: Duration::ZERO,
        }
    }

    /// A denied request that may be retried after `retry_after`.
    pub fn denied(retry_after: Duration) -> Self {
        Self {
            allowed: false,
            retry_after,
        }
    }
}

/// Trait for window store implementations.
///
/// This trait abstracts over the in-process `LocalStore` and the
/// Redis-backed `RedisStore` so the limiter and the HTTP layer can work
/// with either, or with a test double.
#[async_trait]
pub trait WindowStore: Send + Sync {
    /// Record a request for `key` and decide whether it is admitted.
    ///
    /// `limit` must be at least 1. Only the state of `key` is touched.
    async fn allow(
        &self,
        key: &str,
        limit: u32,
        block: Duration,
    ) -> Result<Decision, RateLimitError>;
}
