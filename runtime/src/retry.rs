//! Bounded retries of a failing apply call.
//!
//! Used when a processor runs with [`ApplyFailurePolicy::Retry`]. Only
//! [`ApplyError::Failed`] is retried; a rejection is final. Once the retries
//! run out the processor logs the last error and moves on to the next
//! sequence id.
//!
//! [`ApplyFailurePolicy::Retry`]: crate::config::ApplyFailurePolicy::Retry
//!
//! # Example
//!
//! ```
//! use event_serializer_runtime::retry::RetryPolicy;
//! use std::time::Duration;
//!
//! let policy = RetryPolicy::new(4)
//!     .with_initial_delay(Duration::from_millis(50))
//!     .with_max_delay(Duration::from_secs(1));
//!
//! assert_eq!(policy.backoff(0), Duration::from_millis(50));
//! assert_eq!(policy.backoff(1), Duration::from_millis(100));
//! assert_eq!(policy.backoff(10), Duration::from_secs(1));
//! ```

use event_serializer_core::applier::{ApplyError, EventApplier};
use event_serializer_core::event::Event;
use event_serializer_core::stream::ResourceId;
use rand::Rng;
use std::time::Duration;

/// How often, and how patiently, a failed apply call is repeated.
///
/// Defaults: 3 retries, 100ms first backoff doubling up to 30s, no jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: usize,
    /// Backoff before the first retry
    pub initial_delay: Duration,
    /// Upper bound for any backoff
    pub max_delay: Duration,
    /// Growth factor between consecutive backoffs
    pub multiplier: f64,
    /// Scale each backoff by a random factor in `[0.5, 1.0]`
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}

impl RetryPolicy {
    /// Policy allowing `max_retries` retries with the default backoff.
    #[must_use]
    pub const fn new(max_retries: usize) -> Self {
        Self {
            max_retries,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: false,
        }
    }

    /// Set the backoff before the first retry
    #[must_use]
    pub const fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set the backoff cap
    #[must_use]
    pub const fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the growth factor
    #[must_use]
    pub const fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Enable or disable jitter
    #[must_use]
    pub const fn with_jitter(mut self, enabled: bool) -> Self {
        self.jitter = enabled;
        self
    }

    /// Backoff before retry number `retry` (0-indexed).
    #[must_use]
    pub fn backoff(&self, retry: usize) -> Duration {
        // Retries are bounded by max_retries, far below i32::MAX
        #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
        let exponent = retry.min(i32::MAX as usize) as i32;
        let secs = (self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent))
            .min(self.max_delay.as_secs_f64());

        let secs = if self.jitter {
            secs * rand::thread_rng().gen_range(0.5..=1.0)
        } else {
            secs
        };

        Duration::try_from_secs_f64(secs).unwrap_or(self.max_delay)
    }
}

/// Result of applying one event under a [`RetryPolicy`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetriedApply {
    /// Outcome of the last attempt
    pub result: Result<(), ApplyError>,
    /// Apply calls made, the first one included
    pub attempts: usize,
}

impl RetriedApply {
    /// Apply calls beyond the first.
    #[must_use]
    pub const fn retries(&self) -> usize {
        self.attempts.saturating_sub(1)
    }
}

/// Apply `event`, retrying retryable failures with backoff.
///
/// Returns after the first success, the first non-retryable error, or once
/// `policy.max_retries` retries have failed.
pub async fn apply_with_retry<P, A>(
    policy: &RetryPolicy,
    applier: &A,
    resource: &ResourceId,
    event: &Event<P>,
) -> RetriedApply
where
    A: EventApplier<P> + ?Sized,
{
    let sequence_id = event.sequence_id();
    let mut attempts = 0;

    loop {
        attempts += 1;
        let error = match applier.apply(resource, event).await {
            Ok(()) => {
                if attempts > 1 {
                    tracing::info!(sequence_id = %sequence_id, attempts, "Apply succeeded after retry");
                }
                return RetriedApply {
                    result: Ok(()),
                    attempts,
                };
            }
            Err(error) => error,
        };

        let retry = attempts - 1;
        if !error.is_retryable() || retry >= policy.max_retries {
            return RetriedApply {
                result: Err(error),
                attempts,
            };
        }

        let delay = policy.backoff(retry);
        tracing::warn!(
            sequence_id = %sequence_id,
            attempt = attempts,
            delay_ms = delay.as_millis(),
            error = %error,
            "Apply failed, retrying"
        );
        tokio::time::sleep(delay).await;
    }
}
