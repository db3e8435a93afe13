//! Processor and host configuration.
//!
//! # Example
//!
//! ```
//! use event_serializer_runtime::config::{ApplyFailurePolicy, ProcessorConfig};
//! use event_serializer_runtime::retry::RetryPolicy;
//! use std::time::Duration;
//!
//! let config = ProcessorConfig::default()
//!     .with_generation_timeout(Duration::from_secs(600))
//!     .with_max_events_per_generation(10_000)
//!     .with_failure_policy(ApplyFailurePolicy::Retry(RetryPolicy::default()));
//!
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Environment Variables
//!
//! [`ProcessorConfig::from_env`] reads, all optional:
//!
//! | Variable | Meaning |
//! |----------|---------|
//! | `SERIALIZER_GENERATION_TIMEOUT_SECS` | retire a generation after this many seconds |
//! | `SERIALIZER_MAX_EVENTS_PER_GENERATION` | retire a generation after this many deliveries |
//! | `SERIALIZER_DRAIN_SWEEP_ATTEMPTS` | empty polls allowed during the drain sweep |
//! | `SERIALIZER_APPLY_MAX_RETRIES` | retries per failed apply (0 = skip immediately) |
//! | `SERIALIZER_COMMAND_BUFFER` | capacity of the host command channel |
//! | `SERIALIZER_SHUTDOWN_TIMEOUT_SECS` | how long host shutdown may take |

use crate::retry::RetryPolicy;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Configuration error
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable could not be parsed
    #[error("Invalid value for {var}: {value:?}")]
    InvalidValue {
        /// Variable name
        var: String,
        /// Raw value found
        value: String,
    },

    /// Configuration validation failed
    #[error("Configuration validation failed: {0}")]
    Validation(String),
}

/// What a processor does when the apply operation fails.
///
/// Either way the processor eventually advances past the event: the ordered
/// stream is never blocked indefinitely behind one failure. Making the apply
/// operation itself idempotent and retryable is the caller's concern.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum ApplyFailurePolicy {
    /// Log the failure and move on to the next event.
    #[default]
    Skip,
    /// Retry retryable failures with backoff, then move on.
    Retry(RetryPolicy),
}

/// Configuration shared by every processor generation a host starts.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessorConfig {
    /// Retire a generation after it has been running this long
    pub generation_timeout: Option<Duration>,
    /// Retire a generation after it has received this many deliveries
    pub max_events_per_generation: Option<u64>,
    /// Empty non-blocking polls allowed while draining a closed input
    pub drain_sweep_attempts: usize,
    /// Behaviour when the apply operation fails
    pub failure_policy: ApplyFailurePolicy,
    /// Capacity of the host command channel
    pub command_buffer: usize,
    /// Maximum time a host shutdown may take
    pub shutdown_timeout: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            generation_timeout: None,
            max_events_per_generation: None,
            drain_sweep_attempts: 16,
            failure_policy: ApplyFailurePolicy::Skip,
            command_buffer: 1024,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl ProcessorConfig {
    /// Set the generation lifetime
    #[must_use]
    pub const fn with_generation_timeout(mut self, timeout: Duration) -> Self {
        self.generation_timeout = Some(timeout);
        self
    }

    /// Set the per-generation delivery budget
    #[must_use]
    pub const fn with_max_events_per_generation(mut self, max: u64) -> Self {
        self.max_events_per_generation = Some(max);
        self
    }

    /// Set the drain sweep budget
    #[must_use]
    pub const fn with_drain_sweep_attempts(mut self, attempts: usize) -> Self {
        self.drain_sweep_attempts = attempts;
        self
    }

    /// Set the apply failure policy
    #[must_use]
    pub fn with_failure_policy(mut self, policy: ApplyFailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Set the host command channel capacity
    #[must_use]
    pub const fn with_command_buffer(mut self, capacity: usize) -> Self {
        self.command_buffer = capacity;
        self
    }

    /// Set the host shutdown timeout
    #[must_use]
    pub const fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Load configuration from `SERIALIZER_*` environment variables.
    ///
    /// Unset variables keep their default.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a variable cannot be parsed or the result
    /// fails [`validate`](Self::validate).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Same as [`from_env`](Self::from_env).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(secs) = parse_var::<u64, _>(&lookup, "SERIALIZER_GENERATION_TIMEOUT_SECS")? {
            config.generation_timeout = Some(Duration::from_secs(secs));
        }
        if let Some(max) = parse_var(&lookup, "SERIALIZER_MAX_EVENTS_PER_GENERATION")? {
            config.max_events_per_generation = Some(max);
        }
        if let Some(attempts) = parse_var(&lookup, "SERIALIZER_DRAIN_SWEEP_ATTEMPTS")? {
            config.drain_sweep_attempts = attempts;
        }
        if let Some(retries) = parse_var::<usize, _>(&lookup, "SERIALIZER_APPLY_MAX_RETRIES")? {
            config.failure_policy = if retries == 0 {
                ApplyFailurePolicy::Skip
            } else {
                ApplyFailurePolicy::Retry(RetryPolicy::new(retries).with_jitter(true))
            };
        }
        if let Some(capacity) = parse_var(&lookup, "SERIALIZER_COMMAND_BUFFER")? {
            config.command_buffer = capacity;
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, "SERIALIZER_SHUTDOWN_TIMEOUT_SECS")? {
            config.shutdown_timeout = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }

    /// Check that the configuration can drive a processor.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] describing the first bad field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.generation_timeout.is_some_and(|t| t.is_zero()) {
            return Err(ConfigError::Validation(
                "generation_timeout must be greater than zero".to_string(),
            ));
        }
        if self.max_events_per_generation == Some(0) {
            return Err(ConfigError::Validation(
                "max_events_per_generation must be greater than zero".to_string(),
            ));
        }
        if self.drain_sweep_attempts == 0 {
            return Err(ConfigError::Validation(
                "drain_sweep_attempts must be at least 1".to_string(),
            ));
        }
        if self.command_buffer == 0 {
            return Err(ConfigError::Validation(
                "command_buffer must be at least 1".to_string(),
            ));
        }
        if let ApplyFailurePolicy::Retry(policy) = &self.failure_policy {
            if !(policy.multiplier.is_finite() && policy.multiplier >= 1.0) {
                return Err(ConfigError::Validation(
                    "retry multiplier must be a finite value >= 1.0".to_string(),
                ));
            }
        }
        Ok(())
    }
}

fn parse_var<T, F>(lookup: &F, var: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                var: var.to_string(),
                value: raw,
            }),
    }
}
