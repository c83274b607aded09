//! Configuration management for Ratewarden.
//!
//! Configuration starts from built-in defaults, is optionally replaced by a
//! YAML file, and is finally overlaid with environment variables. Malformed
//! environment values are logged and ignored.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// Main configuration for the Ratewarden service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WardenConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Window store configuration
    #[serde(default)]
    pub backend: BackendConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP server address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Requests per second allowed for a client without a token
    #[serde(default = "default_ip_limit")]
    pub ip_limit: u32,

    /// Requests per second allowed for a client with a token
    #[serde(default = "default_token_limit")]
    pub token_limit: u32,

    /// Block duration in seconds once a limit is exceeded
    #[serde(default = "default_block_time_secs")]
    pub block_time_secs: u64,

    /// Limit clients without a token by address
    #[serde(default = "default_true")]
    pub enable_ip_limit: bool,

    /// Limit clients with a token by token
    #[serde(default = "default_true")]
    pub enable_token_limit: bool,

    /// Header carrying the API token
    #[serde(default = "default_token_header")]
    pub token_header: String,

    /// Admit requests when the store fails instead of answering 500
    #[serde(default)]
    pub fail_open: bool,

    /// Upper bound for one rate limit decision in milliseconds
    #[serde(default = "default_decision_timeout_ms")]
    pub decision_timeout_ms: u64,

    /// Sweep interval for the in-process store in seconds (0 disables)
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            ip_limit: default_ip_limit(),
            token_limit: default_token_limit(),
            block_time_secs: default_block_time_secs(),
            enable_ip_limit: true,
            enable_token_limit: true,
            token_header: default_token_header(),
            fail_open: false,
            decision_timeout_ms: default_decision_timeout_ms(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

/// Longest block a key can be put under: ten years.
pub const MAX_BLOCK_TIME_SECS: u64 = 10 * 365 * 24 * 60 * 60;

impl RateLimitingConfig {
    /// Block duration, capped at [`MAX_BLOCK_TIME_SECS`].
    pub fn block_time(&self) -> Duration {
        Duration::from_secs(self.block_time_secs.min(MAX_BLOCK_TIME_SECS))
    }

    /// Replace zero limits, which would reject every request, with the defaults.
    fn reset_zero_limits(&mut self) {
        if self.ip_limit == 0 {
            warn!(field = "ip_limit", "Ignoring zero limit, using default");
            self.ip_limit = default_ip_limit();
        }
        if self.token_limit == 0 {
            warn!(field = "token_limit", "Ignoring zero limit, using default");
            self.token_limit = default_token_limit();
        }
    }

    /// Decision timeout.
    pub fn decision_timeout(&self) -> Duration {
        Duration::from_millis(self.decision_timeout_ms)
    }

    /// Sweep interval, or `None` when sweeping is disabled.
    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_secs > 0).then(|| Duration::from_secs(self.sweep_interval_secs))
    }
}

fn default_ip_limit() -> u32 {
    5
}

fn default_token_limit() -> u32 {
    10
}

fn default_block_time_secs() -> u64 {
    100
}

fn default_true() -> bool {
    true
}

fn default_token_header() -> String {
    "API_KEY".to_string()
}

fn default_decision_timeout_ms() -> u64 {
    1000
}

fn default_sweep_interval_secs() -> u64 {
    60
}

/// Which window store backs the rate limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// In-process store, for a single instance
    Memory,
    /// Redis store shared by all instances
    #[default]
    Redis,
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(BackendKind::Memory),
            "redis" => Ok(BackendKind::Redis),
            other => Err(format!("unknown backend '{}'", other)),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Memory => write!(f, "memory"),
            BackendKind::Redis => write!(f, "redis"),
        }
    }
}

/// How the Redis store executes a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreMode {
    /// Separate commands per step; may admit slightly over the limit under contention
    #[default]
    Commands,
    /// One server-side script per decision
    Script,
}

impl FromStr for StoreMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "commands" => Ok(StoreMode::Commands),
            "script" => Ok(StoreMode::Script),
            other => Err(format!("unknown redis mode '{}'", other)),
        }
    }
}

/// Window store configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Store kind
    #[serde(default)]
    pub kind: BackendKind,

    /// Redis settings, used when `kind` is `redis`
    #[serde(default)]
    pub redis: RedisConfig,
}

/// Redis connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis address, with or without a `redis://` scheme
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Prefix for every key written
    #[serde(default)]
    pub key_prefix: String,

    /// Connection timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Per-command timeout in milliseconds
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,

    /// Decision execution mode
    #[serde(default)]
    pub mode: StoreMode,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            key_prefix: String::new(),
            connect_timeout_ms: default_connect_timeout_ms(),
            command_timeout_ms: default_command_timeout_ms(),
            mode: StoreMode::default(),
        }
    }
}

impl RedisConfig {
    /// URL suitable for the Redis client.
    pub fn connection_url(&self) -> String {
        if self.url.contains("://") {
            self.url.clone()
        } else {
            format!("redis://{}", self.url)
        }
    }

    /// Connection timeout.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Per-command timeout.
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

fn default_redis_url() -> String {
    "localhost:6379".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_command_timeout_ms() -> u64 {
    500
}

impl WardenConfig {
    /// Load configuration from a file path.
    pub fn from_file(path: &str) -> crate::error::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> crate::error::Result<Self> {
        let mut config: WardenConfig = serde_yaml::from_str(yaml)
            .map_err(|e| crate::error::WardenError::Config(e.to_string()))?;
        config.rate_limiting.reset_zero_limits();
        Ok(config)
    }

    /// Overlay values from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_env_with(|name| std::env::var(name).ok());
    }

    /// Overlay values looked up by `lookup`.
    ///
    /// Empty and malformed values leave the current setting untouched.
    pub fn apply_env_with<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvSource { lookup };
        let limits = &mut self.rate_limiting;

        env.set("HTTP_ADDR", &mut self.server.http_addr, parse_from_str);
        env.set("RATE_LIMIT_IP", &mut limits.ip_limit, parse_limit);
        env.set("RATE_LIMIT_TOKEN", &mut limits.token_limit, parse_limit);
        env.set("BLOCK_TIME", &mut limits.block_time_secs, parse_from_str);
        env.set("ENABLE_IP_LIMIT", &mut limits.enable_ip_limit, parse_bool);
        env.set("ENABLE_TOKEN_LIMIT", &mut limits.enable_token_limit, parse_bool);
        env.set("TOKEN_HEADER", &mut limits.token_header, parse_string);
        env.set("FAIL_OPEN", &mut limits.fail_open, parse_bool);
        env.set("RATE_LIMIT_BACKEND", &mut self.backend.kind, parse_from_str);
        env.set("REDIS_URL", &mut self.backend.redis.url, parse_string);
        env.set("REDIS_KEY_PREFIX", &mut self.backend.redis.key_prefix, parse_string);
        env.set("REDIS_MODE", &mut self.backend.redis.mode, parse_from_str);
    }
}

struct EnvSource<F> {
    lookup: F,
}

impl<F> EnvSource<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn set<T>(&self, name: &str, target: &mut T, parse: fn(&str) -> Option<T>) {
        let Some(raw) = (self.lookup)(name).filter(|value| !value.is_empty()) else {
            return;
        };

        match parse(&raw) {
            Some(value) => *target = value,
            None => warn!(variable = name, value = %raw, "Ignoring malformed environment value"),
        }
    }
}

fn parse_from_str<T: FromStr>(raw: &str) -> Option<T> {
    raw.trim().parse().ok()
}

fn parse_limit(raw: &str) -> Option<u32> {
    parse_from_str::<u32>(raw).filter(|limit| *limit > 0)
}

fn parse_string(raw: &str) -> Option<String> {
    Some(raw.to_string())
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim() {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Some(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Some(false),
        _ => None,
    }
}
