//! Process-wide scheduler configuration: batching, retries, queries, sampling.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::config::PoolSettings;
use crate::core::AppResult;

/// Prefix for environment overrides read by [`SchedulerConfig::from_env`].
pub const ENV_PREFIX: &str = "QUOTA_SCHEDULER_";

/// Batch formation and commit policy for the per-pool actors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Coalescing window opened by the first operation of a batch.
    pub window_ms: u64,
    /// Maximum operations folded into one state transition.
    pub max_batch_size: usize,
    /// Reload-and-reapply attempts after a compare-and-swap conflict.
    pub max_retries: u32,
    /// Capacity of each pool actor's inbox.
    pub channel_capacity: usize,
    /// Reuse the last committed state instead of reloading before each batch.
    /// Only safe to enable when this process is the sole writer of its pools;
    /// a conflict still drops the cached copy.
    pub assume_sole_writer: bool,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            window_ms: 10,
            max_batch_size: 256,
            max_retries: 3,
            channel_capacity: 1024,
            assume_sole_writer: false,
        }
    }
}

/// Sampling rates for the callback (staleness) query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallbackConfig {
    /// Fraction of waiting requests returned per call.
    pub waiting_sample_rate: f64,
    /// Fraction of running requests returned per call.
    pub running_sample_rate: f64,
    /// Fixed seed for the sampler; `None` seeds from the OS.
    pub seed: Option<u64>,
}

impl Default for CallbackConfig {
    fn default() -> Self {
        Self {
            waiting_sample_rate: 0.1,
            running_sample_rate: 0.05,
            seed: None,
        }
    }
}

/// Root scheduler configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Batch formation policy.
    pub batch: BatchConfig,
    /// Callback sampling policy.
    pub callbacks: CallbackConfig,
    /// Upper bound for read-only queries against the node store.
    pub query_timeout_ms: u64,
    /// Settings applied to pools created without explicit settings.
    pub default_pool: PoolSettings,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            batch: BatchConfig::default(),
            callbacks: CallbackConfig::default(),
            query_timeout_ms: 5_000,
            default_pool: PoolSettings::default(),
        }
    }
}

impl BatchConfig {
    /// Coalescing window as a duration.
    pub const fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// Validate batch settings.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_batch_size == 0 {
            return Err("max_batch_size must be greater than 0".into());
        }
        if self.channel_capacity == 0 {
            return Err("channel_capacity must be greater than 0".into());
        }
        Ok(())
    }
}

impl CallbackConfig {
    /// Validate sample rates.
    pub fn validate(&self) -> Result<(), String> {
        for (name, rate) in [
            ("waiting_sample_rate", self.waiting_sample_rate),
            ("running_sample_rate", self.running_sample_rate),
        ] {
            if !(0.0..=1.0).contains(&rate) {
                return Err(format!("{name} must be within [0, 1], got {rate}"));
            }
        }
        Ok(())
    }
}

impl SchedulerConfig {
    /// Query timeout as a duration.
    pub const fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    /// Validate every section.
    pub fn validate(&self) -> Result<(), String> {
        self.batch
            .validate()
            .map_err(|e| format!("batch invalid: {e}"))?;
        self.callbacks
            .validate()
            .map_err(|e| format!("callbacks invalid: {e}"))?;
        self.default_pool
            .validate()
            .map_err(|e| format!("default_pool invalid: {e}"))?;
        if self.query_timeout_ms == 0 {
            return Err("query_timeout_ms must be greater than 0".into());
        }
        Ok(())
    }

    /// Parse scheduler configuration from a JSON string and validate.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Read and validate a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading scheduler config {}", path.display()))?;
        Self::from_json_str(&raw)
            .map_err(anyhow::Error::msg)
            .with_context(|| format!("loading scheduler config {}", path.display()))
    }

    /// Defaults overridden by `QUOTA_SCHEDULER_*` environment variables, after
    /// loading a `.env` file if one is present.
    pub fn from_env() -> AppResult<Self> {
        let _ = dotenvy::dotenv();
        let mut cfg = Self::default();
        cfg.apply_overrides(|key| std::env::var(format!("{ENV_PREFIX}{key}")).ok())?;
        cfg.validate().map_err(anyhow::Error::msg)?;
        Ok(cfg)
    }

    /// Apply overrides from a key lookup (keys without the prefix).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> AppResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(key: &str, raw: &str) -> AppResult<T>
        where
            T::Err: std::fmt::Display,
        {
            raw.trim()
                .parse::<T>()
                .map_err(|e| anyhow::anyhow!("invalid {ENV_PREFIX}{key}={raw}: {e}"))
        }

        if let Some(v) = lookup("BATCH_WINDOW_MS") {
            self.batch.window_ms = parse("BATCH_WINDOW_MS", &v)?;
        }
        if let Some(v) = lookup("MAX_BATCH_SIZE") {
            self.batch.max_batch_size = parse("MAX_BATCH_SIZE", &v)?;
        }
        if let Some(v) = lookup("MAX_RETRIES") {
            self.batch.max_retries = parse("MAX_RETRIES", &v)?;
        }
        if let Some(v) = lookup("ASSUME_SOLE_WRITER") {
            self.batch.assume_sole_writer = parse("ASSUME_SOLE_WRITER", &v)?;
        }
        if let Some(v) = lookup("QUERY_TIMEOUT_MS") {
            self.query_timeout_ms = parse("QUERY_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("WAITING_SAMPLE_RATE") {
            self.callbacks.waiting_sample_rate = parse("WAITING_SAMPLE_RATE", &v)?;
        }
        if let Some(v) = lookup("RUNNING_SAMPLE_RATE") {
            self.callbacks.running_sample_rate = parse("RUNNING_SAMPLE_RATE", &v)?;
        }
        if let Some(v) = lookup("SAMPLE_SEED") {
            self.callbacks.seed = Some(parse("SAMPLE_SEED", &v)?);
        }
        Ok(())
    }
}
