//! Configuration for key-value stores and batch processors.
//!
//! All structs deserialize with serde so they can be embedded in an
//! application's own config file. Missing fields take their defaults.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::subject::validate_prefix;

/// Messages per fetch when none is configured.
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// How long a fetch waits for messages when none is configured.
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(5);

/// Options for a single fetch from a pull consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchOptions {
    /// Upper bound on how long a fetch waits for messages.
    pub max_wait: Duration,
    /// Idle heartbeat interval requested from the broker.
    pub heartbeat: Option<Duration>,
    /// Upper bound on the total payload size of a batch.
    pub max_bytes: Option<usize>,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            max_wait: DEFAULT_MAX_WAIT,
            heartbeat: None,
            max_bytes: None,
        }
    }
}

/// A single fetch setting, appended through
/// [`BatchProcessorBuilder::fetch_option`](crate::BatchProcessorBuilder::fetch_option).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOption {
    MaxWait(Duration),
    Heartbeat(Duration),
    MaxBytes(usize),
}

impl FetchOptions {
    /// Apply one option; later options override earlier ones.
    pub fn apply(&mut self, option: FetchOption) {
        match option {
            FetchOption::MaxWait(wait) => self.max_wait = wait,
            FetchOption::Heartbeat(interval) => self.heartbeat = Some(interval),
            FetchOption::MaxBytes(bytes) => self.max_bytes = Some(bytes),
        }
    }

    /// Reject zero waits, heartbeats not shorter than `max_wait` and a zero byte limit.
    pub fn validate(&self) -> Result<()> {
        if self.max_wait.is_zero() {
            return Err(Error::InvalidConfig(
                "fetch max_wait must be greater than zero".to_string(),
            ));
        }
        if let Some(heartbeat) = self.heartbeat {
            if heartbeat.is_zero() || heartbeat >= self.max_wait {
                return Err(Error::InvalidConfig(format!(
                    "fetch heartbeat {:?} must be non-zero and shorter than max_wait {:?}",
                    heartbeat, self.max_wait
                )));
            }
        }
        if self.max_bytes == Some(0) {
            return Err(Error::InvalidConfig(
                "fetch max_bytes must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration for a [`BatchProcessor`](crate::BatchProcessor).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Maximum messages handed to the handler at once.
    pub batch_size: usize,
    pub fetch: FetchOptions,
    /// Terminate a failing message once it has been delivered this many
    /// times. `None` redelivers failures indefinitely.
    pub max_deliveries: Option<u64>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            fetch: FetchOptions::default(),
            max_deliveries: None,
        }
    }
}

impl BatchConfig {
    /// Reject a zero batch size or delivery limit, then check the fetch options.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::InvalidConfig(
                "batch_size must be greater than zero".to_string(),
            ));
        }
        if self.max_deliveries == Some(0) {
            return Err(Error::InvalidConfig(
                "max_deliveries must be greater than zero".to_string(),
            ));
        }
        self.fetch.validate()
    }
}

/// Configuration for a [`KeyValueStore`](crate::KeyValueStore).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvConfig {
    /// Subject prefix every hashed key is placed under.
    pub prefix: String,
    /// Upper bound on each broker round trip.
    #[serde(default)]
    pub request_timeout: Option<Duration>,
}

impl KvConfig {
    /// Config with no request timeout.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            request_timeout: None,
        }
    }

    /// Bound every broker round trip by `timeout`.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Check the prefix is a valid subject and the timeout is non-zero.
    pub fn validate(&self) -> Result<()> {
        validate_prefix(&self.prefix)?;
        if self.request_timeout.is_some_and(|timeout| timeout.is_zero()) {
            return Err(Error::InvalidConfig(
                "request_timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
