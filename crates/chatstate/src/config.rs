//! Engine and storage configuration.

use std::time::Duration;

use serde::Deserialize;

/// 30 days, refreshed on every write.
pub const DEFAULT_TTL_SECS: u64 = 30 * 24 * 60 * 60;
const DEFAULT_KEY_PREFIX: &str = "chatstate";
const DEFAULT_HISTORY_LIMIT: usize = 50;
const DEFAULT_TOOL_HISTORY_LIMIT: usize = 100;
const DEFAULT_TURN_MAX_AGE_SECS: u64 = 60 * 60;
const DEFAULT_TOOL_TIMEOUT_SECS: u64 = 30;
const DEFAULT_TOOL_RETRY_ATTEMPTS: u32 = 3;
const DEFAULT_TOOL_RETRY_BASE_DELAY_MS: u64 = 100;
const DEFAULT_LOCK_TIMEOUT_SECS: u64 = 30;
const DEFAULT_LOCK_RETRY_INTERVAL_MS: u64 = 100;
const DEFAULT_STORAGE_MAX_RETRIES: u32 = 3;
const DEFAULT_STORAGE_RETRY_DELAY_MS: u64 = 100;

/// Knobs for the turn lifecycle service and tool-call executor.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Default history read size when a query gives no limit.
    pub history_limit: usize,
    /// Bound on the tool-call audit log; audit writes trim to this, which
    /// also bounds the idempotent-append duplicate scan.
    pub tool_history_limit: usize,
    /// Default for whether history reads include tool traffic.
    pub include_tool_calls_in_history: bool,
    /// Whether tool invocations are recorded to the audit log at all.
    pub store_tool_history: bool,
    /// In-memory turns older than this are force-completed by the sweep.
    pub turn_max_age_secs: u64,
    /// Per-attempt tool call timeout.
    pub tool_timeout_secs: u64,
    /// Attempts per tool call before a synthetic failure result.
    pub tool_retry_attempts: u32,
    /// Base delay between tool retries; doubles per attempt.
    pub tool_retry_base_delay_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            history_limit: DEFAULT_HISTORY_LIMIT,
            tool_history_limit: DEFAULT_TOOL_HISTORY_LIMIT,
            include_tool_calls_in_history: true,
            store_tool_history: true,
            turn_max_age_secs: DEFAULT_TURN_MAX_AGE_SECS,
            tool_timeout_secs: DEFAULT_TOOL_TIMEOUT_SECS,
            tool_retry_attempts: DEFAULT_TOOL_RETRY_ATTEMPTS,
            tool_retry_base_delay_ms: DEFAULT_TOOL_RETRY_BASE_DELAY_MS,
        }
    }
}

impl EngineConfig {
    /// Turn max age as a [`Duration`].
    pub fn turn_max_age(&self) -> Duration {
        Duration::from_secs(self.turn_max_age_secs)
    }

    /// Tool timeout as a [`Duration`].
    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }

    /// Tool retry base delay as a [`Duration`].
    pub fn tool_retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.tool_retry_base_delay_ms)
    }
}

/// Redis/Valkey backend configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedisStorageConfig {
    /// Connection url, e.g. `redis://127.0.0.1:6379/0`.
    pub url: String,
    /// Key namespace prefix.
    pub key_prefix: String,
    /// Sliding expiration applied to state and history keys.
    pub ttl_secs: u64,
    /// Lease duration and acquire budget for the distributed lock.
    pub lock_timeout_secs: u64,
    /// Fixed backoff between lock acquire attempts.
    pub lock_retry_interval_ms: u64,
    /// Attempts per storage command before surfacing a hard failure.
    pub max_retries: u32,
    /// Base delay between storage retries; doubles per attempt.
    pub retry_delay_ms: u64,
}

impl Default for RedisStorageConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            ttl_secs: DEFAULT_TTL_SECS,
            lock_timeout_secs: DEFAULT_LOCK_TIMEOUT_SECS,
            lock_retry_interval_ms: DEFAULT_LOCK_RETRY_INTERVAL_MS,
            max_retries: DEFAULT_STORAGE_MAX_RETRIES,
            retry_delay_ms: DEFAULT_STORAGE_RETRY_DELAY_MS,
        }
    }
}

impl RedisStorageConfig {
    /// Config for an explicit url, everything else at defaults.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Build from the environment; `None` when no url is configured.
    ///
    /// Reads `VALKEY_URL` (or `REDIS_URL`), `CHATSTATE_KEY_PREFIX` and
    /// `CHATSTATE_TTL_SECS`.
    pub fn from_env() -> Option<Self> {
        let url = env_nonempty("VALKEY_URL").or_else(|| env_nonempty("REDIS_URL"))?;
        let key_prefix =
            env_nonempty("CHATSTATE_KEY_PREFIX").unwrap_or_else(|| DEFAULT_KEY_PREFIX.to_string());
        let ttl_secs = match env_nonempty("CHATSTATE_TTL_SECS") {
            Some(raw) => match raw.parse::<u64>() {
                Ok(v) if v > 0 => v,
                _ => {
                    tracing::warn!(
                        env_var = "CHATSTATE_TTL_SECS",
                        value = %raw,
                        "invalid ttl env value; using default"
                    );
                    DEFAULT_TTL_SECS
                }
            },
            None => DEFAULT_TTL_SECS,
        };
        Some(Self {
            url,
            key_prefix,
            ttl_secs,
            ..Self::default()
        })
    }

    /// Lock acquire budget as a [`Duration`].
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    /// Lock retry backoff as a [`Duration`].
    pub fn lock_retry_interval(&self) -> Duration {
        Duration::from_millis(self.lock_retry_interval_ms)
    }

    /// Storage retry base delay as a [`Duration`].
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

fn env_nonempty(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
