//! Request classification into a rate limit key and limit.
//!
//! A request carrying an API token is limited by its token; otherwise it is
//! limited by its client address. Each class can be switched off, in which
//! case requests falling into it are not limited at all.

use std::time::Duration;

use super::key::RateLimitKey;
use crate::config::RateLimitingConfig;

/// The limits and switches applied to every request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitPolicy {
    /// Requests per window allowed for an IP-limited client
    pub ip_limit: u32,
    /// Requests per window allowed for a token-limited client
    pub token_limit: u32,
    /// How long a key stays blocked once it exceeded its limit
    pub block_time: Duration,
    /// Whether clients without a token are limited by address
    pub enable_ip_limit: bool,
    /// Whether clients with a token are limited by token
    pub enable_token_limit: bool,
}

/// The key and limit selected for a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    /// Namespaced identifier to count against
    pub key: RateLimitKey,
    /// Requests per window allowed for this identifier
    pub limit: u32,
}

impl Default for LimitPolicy {
    fn default() -> Self {
        Self::from(&RateLimitingConfig::default())
    }
}

impl From<&RateLimitingConfig> for LimitPolicy {
    fn from(config: &RateLimitingConfig) -> Self {
        Self {
            ip_limit: config.ip_limit,
            token_limit: config.token_limit,
            block_time: config.block_time(),
            enable_ip_limit: config.enable_ip_limit,
            enable_token_limit: config.enable_token_limit,
        }
    }
}

impl LimitPolicy {
    /// Select the key and limit for a request.
    ///
    /// A present token always shadows the address when token limiting is on.
    /// Returns `None` when no enabled class applies and the request must be
    /// admitted without touching any counter.
    pub fn classify(&self, token: Option<&str>, ip: &str) -> Option<Classification> {
        match token {
            Some(token) if !token.is_empty() && self.enable_token_limit => Some(Classification {
                key: RateLimitKey::Token(token.to_string()),
                limit: self.token_limit,
            }),
            _ if self.enable_ip_limit => Some(Classification {
                key: RateLimitKey::Ip(ip.to_string()),
                limit: self.ip_limit,
            }),
            _ => None,
        }
    }
}
