//! Rate limit key generation.

use std::fmt;

/// A key that uniquely identifies a throttled subject.
///
/// Keys are namespaced by kind, so an IP and a token with the same raw
/// value never share counters or block state.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RateLimitKey {
    /// Identifier derived from the client address
    Ip(String),
    /// Identifier derived from an API token
    Token(String),
}

impl RateLimitKey {
    /// Namespace prefix for this kind of key.
    pub fn namespace(&self) -> &'static str {
        match self {
            RateLimitKey::Ip(_) => "ip",
            RateLimitKey::Token(_) => "token",
        }
    }

    /// The raw identifier without its namespace.
    pub fn raw(&self) -> &str {
        match self {
            RateLimitKey::Ip(value) | RateLimitKey::Token(value) => value,
        }
    }

    /// Convert the key to the string used by the window stores.
    pub fn to_string_key(&self) -> String {
        format!("{}:{}", self.namespace(), self.raw())
    }
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace(), self.raw())
    }
}
