//! Redis-backed window store shared by every instance of the service.
//!
//! Each identifier owns two keys: a counter that expires one window after
//! its first increment, and a presence-only block key whose TTL is the
//! remaining block time. Entering a block deletes the counter. Window reset
//! and block expiry are left entirely to Redis key expiry.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, RedisResult, Script};
use tracing::{debug, info};

use super::backend::{Decision, WindowStore};
use super::window::WINDOW;
use crate::config::{RedisConfig, StoreMode};
use crate::error::RateLimitError;

/// Lua script performing the whole decision in one round trip.
///
/// KEYS: block key, count key. ARGV: limit, block ms, window ms.
/// Returns `{allowed, retry_after_ms}`.
const DECIDE_SCRIPT: &str = r#"
local block_ttl = redis.call('PTTL', KEYS[1])
if block_ttl > 0 then
    return {0, block_ttl}
end

local count = tonumber(redis.call('GET', KEYS[2]) or '0')
local block_ms = tonumber(ARGV[2])
if count >= tonumber(ARGV[1]) then
    redis.call('DEL', KEYS[2])
    if block_ms > 0 then
        redis.call('SET', KEYS[1], '1', 'PX', block_ms)
    end
    return {0, block_ms}
end

local current = redis.call('INCR', KEYS[2])
if current == 1 then
    redis.call('PEXPIRE', KEYS[2], tonumber(ARGV[3]))
end
return {1, 0}
"#;

/// A window store backed by Redis.
///
/// In [`StoreMode::Commands`] the read and the write are separate round
/// trips, so concurrent callers that all read a count below the limit will
/// all be admitted. The counter can overshoot `limit` by the number of
/// in-flight requests before the block is set. Each write is a single
/// MULTI/EXEC, so a failed or timed-out write never leaves a counter without
/// its TTL. [`StoreMode::Script`] runs the same algorithm server-side and does
/// not overshoot.
pub struct RedisStore {
    /// Multiplexed connection, reconnecting on failure
    conn: ConnectionManager,
    /// Prefix prepended to both sub-keys
    key_prefix: String,
    /// Upper bound for each round trip
    command_timeout: Duration,
    /// How decisions are executed against the store
    mode: StoreMode,
    /// Compiled decision script, used in script mode
    script: Script,
}

impl RedisStore {
    /// Connect to Redis and verify it answers.
    pub async fn connect(config: &RedisConfig) -> Result<Self, RateLimitError> {
        let url = config.connection_url();
        let client = Client::open(url.as_str())?;

        let conn =
            tokio::time::timeout(config.connect_timeout(), ConnectionManager::new(client)).await??;

        let mut ping_conn = conn.clone();
        let _: String =
            tokio::time::timeout(config.connect_timeout(), redis::cmd("PING").query_async(&mut ping_conn))
                .await??;

        info!(url = %url, mode = ?config.mode, "Connected to Redis window store");

        Ok(Self {
            conn,
            key_prefix: config.key_prefix.clone(),
            command_timeout: config.command_timeout(),
            mode: config.mode,
            script: Script::new(DECIDE_SCRIPT),
        })
    }

    /// The mode this store executes decisions in.
    pub fn mode(&self) -> StoreMode {
        self.mode
    }

    /// Bound a single store round trip by the command timeout.
    async fn bounded<T, F>(&self, fut: F) -> Result<T, RateLimitError>
    where
        F: Future<Output = RedisResult<T>>,
    {
        Ok(tokio::time::timeout(self.command_timeout, fut).await??)
    }

    async fn allow_with_commands(
        &self,
        block_key: &str,
        count_key: &str,
        limit: u32,
        block: Duration,
    ) -> Result<Decision, RateLimitError> {
        let mut conn = self.conn.clone();

        let (block_ttl, count): (i64, Option<u64>) = self
            .bounded(
                redis::pipe()
                    .cmd("PTTL")
                    .arg(block_key)
                    .cmd("GET")
                    .arg(count_key)
                    .query_async(&mut conn),
            )
            .await?;

        if block_ttl > 0 {
            return Ok(Decision::denied(Duration::from_millis(block_ttl as u64)));
        }

        if count.unwrap_or(0) >= u64::from(limit) {
            // The window is dropped with the block so the key starts over once
            // the block key expires.
            let block_ms = duration_millis(block);
            let mut pipe = redis::pipe();
            pipe.atomic().cmd("DEL").arg(count_key).ignore();
            if block_ms > 0 {
                pipe.cmd("SET")
                    .arg(block_key)
                    .arg(1)
                    .arg("PX")
                    .arg(block_ms)
                    .ignore();
            }
            let _: () = self.bounded(pipe.query_async(&mut conn)).await?;
            return Ok(Decision::denied(block));
        }

        // Creating the counter with its TTL and incrementing it commit together,
        // so a counter never outlives its window.
        let _: () = self
            .bounded(
                redis::pipe()
                    .atomic()
                    .cmd("SET")
                    .arg(count_key)
                    .arg(0)
                    .arg("PX")
                    .arg(duration_millis(WINDOW))
                    .arg("NX")
                    .ignore()
                    .cmd("INCR")
                    .arg(count_key)
                    .query_async(&mut conn),
            )
            .await?;

        Ok(Decision::allowed())
    }

    async fn allow_with_script(
        &self,
        block_key: &str,
        count_key: &str,
        limit: u32,
        block: Duration,
    ) -> Result<Decision, RateLimitError> {
        let mut conn = self.conn.clone();

        let (allowed, retry_ms): (i64, i64) = self
            .bounded(
                self.script
                    .key(block_key)
                    .key(count_key)
                    .arg(limit)
                    .arg(duration_millis(block))
                    .arg(duration_millis(WINDOW))
                    .invoke_async(&mut conn),
            )
            .await?;

        if allowed == 1 {
            Ok(Decision::allowed())
        } else {
            Ok(Decision::denied(Duration::from_millis(retry_ms.max(0) as u64)))
        }
    }
}

#[async_trait]
impl WindowStore for RedisStore {
    async fn allow(
        &self,
        key: &str,
        limit: u32,
        block: Duration,
    ) -> Result<Decision, RateLimitError> {
        let (block_key, count_key) = sub_keys(&self.key_prefix, key);

        let decision = match self.mode {
            StoreMode::Commands => {
                self.allow_with_commands(&block_key, &count_key, limit, block)
                    .await?
            }
            StoreMode::Script => {
                self.allow_with_script(&block_key, &count_key, limit, block)
                    .await?
            }
        };

        debug!(
            key = %key,
            allowed = decision.allowed,
            retry_after_ms = decision.retry_after.as_millis() as u64,
            "Redis window store decision"
        );

        Ok(decision)
    }
}

/// Block and count keys for an identifier.
fn sub_keys(prefix: &str, key: &str) -> (String, String) {
    (format!("{prefix}block:{key}"), format!("{prefix}count:{key}"))
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
