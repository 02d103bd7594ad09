//! Batch configuration
//!
//! `BatchConfig` is supplied once per run and never mutated while the run is in flight.

use core_config::{env_or_default, env_parse, env_parse_or, ConfigError, FromEnv};
use serde::{Deserialize, Serialize};

use crate::error::{BulkError, BulkResult};

/// `max_concurrency` value meaning "let the executor choose".
pub const AUTO_CONCURRENCY: i32 = -1;

/// Upper bound on in-flight batches when concurrency is chosen automatically.
const AUTO_CONCURRENCY_CAP: usize = 10;

/// Circuit breaker settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerOptions {
    /// Failures within the rolling window that open the circuit
    pub failure_threshold: u32,
    /// Time spent open before a trial call is allowed
    pub reset_timeout_ms: u64,
    /// Number of most recent outcomes considered
    pub rolling_window_size: usize,
}

impl Default for CircuitBreakerOptions {
    fn default() -> Self {
        Self {
            failure_threshold: 10,
            reset_timeout_ms: 30_000,
            rolling_window_size: 100,
        }
    }
}

/// Configuration for a resilient bulk run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BatchConfig {
    /// Items per bulk call
    pub batch_size: usize,

    /// Retry rounds per item after the first attempt
    pub max_retries: u32,

    /// Base delay for exponential backoff
    pub base_backoff_ms: u64,

    /// Cap on any single backoff or throttle delay
    pub max_backoff_ms: u64,

    /// Fraction (0..1] of provisioned capacity the run may consume
    pub target_utilization: f64,

    /// Batches in flight at once; `-1` lets the executor choose
    pub max_concurrency: i32,

    /// Attach deterministic operation identifiers and treat own-duplicate conflicts as success
    pub idempotency_enabled: bool,

    /// Keep failed items (with last error) in the result
    pub return_failed_items: bool,

    pub circuit_breaker_options: CircuitBreakerOptions,

    /// Top-level field holding the item identifier
    pub id_field: String,

    /// `/`-separated path of the partition key; empty for none
    pub partition_key_path: String,

    /// Cost units per second available from the store; `None` disables throttling
    pub provisioned_capacity: Option<f64>,

    /// Trailing window used to measure realized cost rate
    pub throttle_window_ms: u64,

    /// Failure ratio at which a batch reports failure to the circuit breaker
    pub batch_failure_ratio: f64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 25,
            max_retries: 5,
            base_backoff_ms: 100,
            max_backoff_ms: 10_000,
            target_utilization: 0.7,
            max_concurrency: 5,
            idempotency_enabled: true,
            return_failed_items: true,
            circuit_breaker_options: CircuitBreakerOptions::default(),
            id_field: "id".to_string(),
            partition_key_path: String::new(),
            provisioned_capacity: None,
            throttle_window_ms: 1_000,
            batch_failure_ratio: 0.5,
        }
    }
}

impl BatchConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_backoff(mut self, base_ms: u64, max_ms: u64) -> Self {
        self.base_backoff_ms = base_ms;
        self.max_backoff_ms = max_ms;
        self
    }

    pub fn with_target_utilization(mut self, target: f64) -> Self {
        self.target_utilization = target;
        self
    }

    /// Set the concurrency limit (`AUTO_CONCURRENCY` for automatic)
    pub fn with_max_concurrency(mut self, concurrency: i32) -> Self {
        self.max_concurrency = concurrency;
        self
    }

    pub fn with_idempotency(mut self, enabled: bool) -> Self {
        self.idempotency_enabled = enabled;
        self
    }

    pub fn with_return_failed_items(mut self, enabled: bool) -> Self {
        self.return_failed_items = enabled;
        self
    }

    pub fn with_circuit_breaker(mut self, options: CircuitBreakerOptions) -> Self {
        self.circuit_breaker_options = options;
        self
    }

    pub fn with_id_field(mut self, field: impl Into<String>) -> Self {
        self.id_field = field.into();
        self
    }

    pub fn with_partition_key_path(mut self, path: impl Into<String>) -> Self {
        self.partition_key_path = path.into();
        self
    }

    pub fn with_provisioned_capacity(mut self, units_per_second: f64) -> Self {
        self.provisioned_capacity = Some(units_per_second);
        self
    }

    pub fn with_throttle_window_ms(mut self, window_ms: u64) -> Self {
        self.throttle_window_ms = window_ms;
        self
    }

    pub fn with_batch_failure_ratio(mut self, ratio: f64) -> Self {
        self.batch_failure_ratio = ratio;
        self
    }

    /// Reject inconsistent settings before anything is dispatched.
    pub fn validate(&self) -> BulkResult<()> {
        let cb = &self.circuit_breaker_options;

        let problem = if self.batch_size == 0 {
            Some("batchSize must be at least 1".to_string())
        } else if !(self.target_utilization > 0.0 && self.target_utilization <= 1.0) {
            Some(format!(
                "targetUtilization must be in (0, 1], got {}",
                self.target_utilization
            ))
        } else if self.max_concurrency == 0 || self.max_concurrency < AUTO_CONCURRENCY {
            Some(format!(
                "maxConcurrency must be positive or -1, got {}",
                self.max_concurrency
            ))
        } else if self.base_backoff_ms > self.max_backoff_ms {
            Some(format!(
                "baseBackoffMs ({}) exceeds maxBackoffMs ({})",
                self.base_backoff_ms, self.max_backoff_ms
            ))
        } else if cb.failure_threshold == 0 {
            Some("failureThreshold must be at least 1".to_string())
        } else if cb.rolling_window_size == 0 {
            Some("rollingWindowSize must be at least 1".to_string())
        } else if cb.failure_threshold as usize > cb.rolling_window_size {
            Some(format!(
                "failureThreshold ({}) exceeds rollingWindowSize ({})",
                cb.failure_threshold, cb.rolling_window_size
            ))
        } else if self.id_field.trim().is_empty() {
            Some("idField must not be empty".to_string())
        } else if self.provisioned_capacity.is_some_and(|c| !(c > 0.0)) {
            Some("provisionedCapacity must be positive".to_string())
        } else if !(self.batch_failure_ratio > 0.0 && self.batch_failure_ratio <= 1.0) {
            Some(format!(
                "batchFailureRatio must be in (0, 1], got {}",
                self.batch_failure_ratio
            ))
        } else {
            None
        };

        match problem {
            Some(message) => Err(BulkError::InvalidConfig(message)),
            None => Ok(()),
        }
    }

    /// Number of batches allowed in flight for a run of `total_batches`.
    pub fn effective_concurrency(&self, total_batches: usize) -> usize {
        if self.max_concurrency == AUTO_CONCURRENCY {
            total_batches.clamp(1, AUTO_CONCURRENCY_CAP)
        } else {
            (self.max_concurrency.max(1) as usize).min(total_batches.max(1))
        }
    }
}

impl FromEnv for BatchConfig {
    /// Every variable is optional and falls back to the documented default.
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = BatchConfig::default();
        let cb_defaults = defaults.circuit_breaker_options.clone();

        Ok(Self {
            batch_size: env_parse_or("BULK_BATCH_SIZE", defaults.batch_size)?,
            max_retries: env_parse_or("BULK_MAX_RETRIES", defaults.max_retries)?,
            base_backoff_ms: env_parse_or("BULK_BASE_BACKOFF_MS", defaults.base_backoff_ms)?,
            max_backoff_ms: env_parse_or("BULK_MAX_BACKOFF_MS", defaults.max_backoff_ms)?,
            target_utilization: env_parse_or(
                "BULK_TARGET_UTILIZATION",
                defaults.target_utilization,
            )?,
            max_concurrency: env_parse_or("BULK_MAX_CONCURRENCY", defaults.max_concurrency)?,
            idempotency_enabled: env_parse_or(
                "BULK_IDEMPOTENCY_ENABLED",
                defaults.idempotency_enabled,
            )?,
            return_failed_items: env_parse_or(
                "BULK_RETURN_FAILED_ITEMS",
                defaults.return_failed_items,
            )?,
            circuit_breaker_options: CircuitBreakerOptions {
                failure_threshold: env_parse_or(
                    "BULK_CB_FAILURE_THRESHOLD",
                    cb_defaults.failure_threshold,
                )?,
                reset_timeout_ms: env_parse_or(
                    "BULK_CB_RESET_TIMEOUT_MS",
                    cb_defaults.reset_timeout_ms,
                )?,
                rolling_window_size: env_parse_or(
                    "BULK_CB_ROLLING_WINDOW_SIZE",
                    cb_defaults.rolling_window_size,
                )?,
            },
            id_field: env_or_default("BULK_ID_FIELD", &defaults.id_field),
            partition_key_path: env_or_default(
                "BULK_PARTITION_KEY_PATH",
                &defaults.partition_key_path,
            ),
            provisioned_capacity: env_parse("BULK_PROVISIONED_CAPACITY")?,
            throttle_window_ms: defaults.throttle_window_ms,
            batch_failure_ratio: defaults.batch_failure_ratio,
        })
    }
}
