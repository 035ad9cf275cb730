//! Engine configuration: serde-backed structs with defaults, loadable
//! from TOML.

mod defaults;

use serde::{Deserialize, Serialize};

use crate::constants;
use crate::errors::{KeelError, KeelResult};

/// Retry policy for queue entry transmission.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum transmission attempts before an entry moves to `failed`.
    pub max_attempts: u32,
    /// Base backoff delay in milliseconds, doubled per attempt.
    pub backoff_base_ms: u64,
    /// Cap on the computed backoff delay.
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: defaults::DEFAULT_MAX_ATTEMPTS,
            backoff_base_ms: defaults::DEFAULT_BACKOFF_BASE_MS,
            max_backoff_ms: defaults::DEFAULT_MAX_BACKOFF_MS,
        }
    }
}

impl RetryConfig {
    /// Backoff delay for the given attempt count (1-based), capped.
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let exp = attempt.saturating_sub(1).min(16);
        let delay = self.backoff_base_ms.saturating_mul(1u64 << exp);
        delay.min(self.max_backoff_ms)
    }
}

/// Sync coordinator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Maximum queue entries drained per run.
    pub batch_size: usize,
    /// Distinct resources transmitted concurrently during push.
    pub push_concurrency: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: defaults::DEFAULT_BATCH_SIZE,
            push_concurrency: defaults::DEFAULT_PUSH_CONCURRENCY,
        }
    }
}

/// Network monitor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Settle window after an offline→online transition before a sync run
    /// is scheduled. Flapping inside the window collapses into one run.
    pub settle_window_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            settle_window_ms: defaults::DEFAULT_SETTLE_WINDOW_MS,
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub retry: RetryConfig,
    pub sync: SyncConfig,
    pub monitor: MonitorConfig,
}

impl EngineConfig {
    /// Parse a configuration from TOML, then clamp to engine limits.
    pub fn from_toml(raw: &str) -> KeelResult<Self> {
        let mut config: EngineConfig =
            toml::from_str(raw).map_err(|e| KeelError::Config(e.to_string()))?;
        config.clamp();
        Ok(config)
    }

    /// Clamp configured values to the hard limits in `constants`.
    pub fn clamp(&mut self) {
        self.retry.max_attempts = self
            .retry
            .max_attempts
            .clamp(1, constants::MAX_CONFIGURABLE_ATTEMPTS);
        self.retry.backoff_base_ms = self
            .retry
            .backoff_base_ms
            .min(constants::MAX_CONFIGURABLE_BACKOFF_MS);
        self.retry.max_backoff_ms = self
            .retry
            .max_backoff_ms
            .min(constants::MAX_CONFIGURABLE_BACKOFF_MS);
        self.sync.batch_size = self.sync.batch_size.clamp(1, constants::MAX_BATCH_SIZE);
        self.sync.push_concurrency = self
            .sync
            .push_concurrency
            .clamp(1, constants::MAX_PUSH_CONCURRENCY);
    }
}
