//! Configuration for the notification bus.

use crate::retry::RetryPolicy;
use crate::{PubSubError, PubSubResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default inbound fan-out capacity.
pub const DEFAULT_INBOUND_BUFFER_SIZE: usize = 2048;

/// Default number of requests per outbound batch.
pub const DEFAULT_OUTBOUND_BATCH_SIZE: usize = 256;

/// Largest accepted inbound fan-out capacity.
pub const MAX_INBOUND_BUFFER_SIZE: usize = 1 << 20;

/// Largest accepted bounded fire-and-forget queue capacity.
pub const MAX_OUTBOUND_QUEUE_CAPACITY: usize = 1 << 24;

/// Largest accepted number of concurrent fire-and-forget batches.
pub const MAX_OUTBOUND_PARALLELISM: usize = 1024;

/// Bus configuration.
///
/// Every field is optional when deserializing; missing fields take the
/// defaults below.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PubSubConfig {
    /// Capacity of the inbound fan-out buffer (per-subscriber lag limit).
    pub inbound_buffer_size: usize,
    /// First reconnect delay in milliseconds.
    pub inbound_backoff_min_ms: u64,
    /// Reconnect delay cap in milliseconds.
    pub inbound_backoff_max_ms: u64,
    /// Capacity of the fire-and-forget queue; `None` means unbounded.
    pub outbound_queue_capacity: Option<usize>,
    /// Maximum requests per outbound batch.
    pub outbound_batch_size: usize,
    /// Time window after the oldest queued request before a partial batch
    /// is flushed, in milliseconds.
    pub outbound_batch_window_ms: u64,
    /// Maximum number of fire-and-forget batches executing concurrently.
    pub outbound_parallelism: usize,
    /// Retries for a fire-and-forget batch hitting "no active connection".
    pub outbound_max_retries: u32,
    /// Base backoff for fire-and-forget batch retries, in milliseconds.
    pub outbound_backoff_ms: u64,
    /// Retries for a synchronous publish hitting "no active connection".
    pub notify_max_retries: u32,
    /// Base backoff for synchronous publish retries, in milliseconds.
    pub notify_backoff_ms: u64,
    /// Cap for batch retry backoff, in milliseconds.
    pub retry_backoff_max_ms: u64,
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            inbound_buffer_size: DEFAULT_INBOUND_BUFFER_SIZE,
            inbound_backoff_min_ms: 50,
            inbound_backoff_max_ms: 5_000,
            outbound_queue_capacity: None,
            outbound_batch_size: DEFAULT_OUTBOUND_BATCH_SIZE,
            outbound_batch_window_ms: 20,
            outbound_parallelism: 1,
            outbound_max_retries: 5,
            outbound_backoff_ms: 50,
            notify_max_retries: 3,
            notify_backoff_ms: 50,
            retry_backoff_max_ms: 1_000,
        }
    }
}

impl PubSubConfig {
    /// Create a config with default values, then override from environment.
    pub fn new() -> Self {
        let mut config = Self::default();
        config.load_from_env();
        config
    }

    /// Load configuration from a JSON file, then apply environment overrides.
    pub fn load(path: &Path) -> PubSubResult<Self> {
        let mut config = Self::load_from_file(path)?;
        config.load_from_env();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific JSON file.
    pub fn load_from_file(path: &Path) -> PubSubResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: PubSubConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration as pretty JSON.
    pub fn save(&self, path: &Path) -> PubSubResult<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Override numeric settings from `PGPUBSUB_*` environment variables.
    /// Unparseable values are ignored with a warning.
    pub fn load_from_env(&mut self) {
        override_from_env("PGPUBSUB_INBOUND_BUFFER_SIZE", &mut self.inbound_buffer_size);
        override_from_env("PGPUBSUB_INBOUND_BACKOFF_MIN_MS", &mut self.inbound_backoff_min_ms);
        override_from_env("PGPUBSUB_INBOUND_BACKOFF_MAX_MS", &mut self.inbound_backoff_max_ms);
        override_from_env("PGPUBSUB_OUTBOUND_BATCH_SIZE", &mut self.outbound_batch_size);
        override_from_env("PGPUBSUB_OUTBOUND_BATCH_WINDOW_MS", &mut self.outbound_batch_window_ms);
        override_from_env("PGPUBSUB_OUTBOUND_PARALLELISM", &mut self.outbound_parallelism);

        if let Ok(raw) = std::env::var("PGPUBSUB_OUTBOUND_QUEUE_CAPACITY") {
            match raw.trim() {
                "" | "unbounded" => self.outbound_queue_capacity = None,
                value => match value.parse() {
                    Ok(capacity) => self.outbound_queue_capacity = Some(capacity),
                    Err(_) => tracing::warn!(
                        var = "PGPUBSUB_OUTBOUND_QUEUE_CAPACITY",
                        value = %raw,
                        "Ignoring unparseable environment override"
                    ),
                },
            }
        }
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> PubSubResult<()> {
        if self.inbound_buffer_size == 0 {
            return Err(PubSubError::Config("inbound_buffer_size must be positive".into()));
        }
        if self.inbound_buffer_size > MAX_INBOUND_BUFFER_SIZE {
            return Err(PubSubError::Config(format!(
                "inbound_buffer_size must not exceed {MAX_INBOUND_BUFFER_SIZE}"
            )));
        }
        if self.outbound_batch_size == 0 {
            return Err(PubSubError::Config("outbound_batch_size must be positive".into()));
        }
        if self.outbound_parallelism == 0 {
            return Err(PubSubError::Config("outbound_parallelism must be positive".into()));
        }
        if self.outbound_parallelism > MAX_OUTBOUND_PARALLELISM {
            return Err(PubSubError::Config(format!(
                "outbound_parallelism must not exceed {MAX_OUTBOUND_PARALLELISM}"
            )));
        }
        match self.outbound_queue_capacity {
            Some(0) => {
                return Err(PubSubError::Config("outbound_queue_capacity must be positive".into()));
            }
            Some(capacity) if capacity > MAX_OUTBOUND_QUEUE_CAPACITY => {
                return Err(PubSubError::Config(format!(
                    "outbound_queue_capacity must not exceed {MAX_OUTBOUND_QUEUE_CAPACITY}"
                )));
            }
            _ => {}
        }
        if self.inbound_backoff_min_ms > self.inbound_backoff_max_ms {
            return Err(PubSubError::Config(
                "inbound_backoff_min_ms must not exceed inbound_backoff_max_ms".into(),
            ));
        }
        Ok(())
    }

    /// Reconnect policy: unbounded attempts, exponential backoff.
    pub fn reconnect_policy(&self) -> RetryPolicy {
        RetryPolicy::unbounded(
            Duration::from_millis(self.inbound_backoff_min_ms),
            Duration::from_millis(self.inbound_backoff_max_ms),
        )
    }

    /// Retry policy for fire-and-forget batches.
    pub fn outbound_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::bounded(
            self.outbound_max_retries,
            Duration::from_millis(self.outbound_backoff_ms),
            Duration::from_millis(self.retry_backoff_max_ms),
        )
    }

    /// Retry policy for synchronous publishes.
    pub fn notify_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::bounded(
            self.notify_max_retries,
            Duration::from_millis(self.notify_backoff_ms),
            Duration::from_millis(self.retry_backoff_max_ms),
        )
    }

    /// Batch flush window.
    pub fn outbound_batch_window(&self) -> Duration {
        Duration::from_millis(self.outbound_batch_window_ms)
    }
}

fn override_from_env<T: std::str::FromStr>(var: &str, target: &mut T) {
    if let Ok(raw) = std::env::var(var) {
        match raw.trim().parse() {
            Ok(value) => *target = value,
            Err(_) => {
                tracing::warn!(var = var, value = %raw, "Ignoring unparseable environment override")
            }
        }
    }
}
