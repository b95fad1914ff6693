//! Retry with exponential backoff for output dispatch.
//!
//! A released output is only removed from its group once the output channel
//! accepted it, so transient channel failures are retried here before the
//! aggregator gives up and leaves the group intact.
//!
//! # Example
//!
//! ```rust
//! use message_connector_runtime::retry::{RetryPolicy, retry_with_predicate};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), String> {
//! let policy = RetryPolicy::builder()
//!     .max_retries(5)
//!     .initial_delay(Duration::from_millis(50))
//!     .max_delay(Duration::from_secs(2))
//!     .build();
//!
//! let sent = retry_with_predicate(
//!     &policy,
//!     || async { Ok::<_, String>("sent") },
//!     |err: &String| err.contains("timeout"),
//! )
//! .await?;
//! assert_eq!(sent, "sent");
//! # Ok(())
//! # }
//! ```

use crate::metrics::RetryMetrics;
use message_connector_core::ChannelError;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// Backoff configuration.
///
/// Defaults: 3 retries, 100ms initial delay, 5s cap, doubling.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: usize,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound for any delay
    pub max_delay: Duration,
    /// Growth factor between consecutive delays
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Start from the default policy.
    #[must_use]
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder {
            policy: Self::default(),
        }
    }

    /// Delay before retry number `attempt` (zero-based), capped at `max_delay`.
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_possible_wrap,
        clippy::cast_sign_loss
    )] // Millisecond delays stay far below 2^52; the cap bounds the result
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let exponent = attempt.min(i32::MAX as usize) as i32;
        let millis = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

/// Builder for [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    policy: RetryPolicy,
}

impl RetryPolicyBuilder {
    /// Set the number of retries.
    #[must_use]
    pub const fn max_retries(mut self, max_retries: usize) -> Self {
        self.policy.max_retries = max_retries;
        self
    }

    /// Set the delay before the first retry.
    #[must_use]
    pub const fn initial_delay(mut self, delay: Duration) -> Self {
        self.policy.initial_delay = delay;
        self
    }

    /// Set the delay cap.
    #[must_use]
    pub const fn max_delay(mut self, delay: Duration) -> Self {
        self.policy.max_delay = delay;
        self
    }

    /// Set the growth factor.
    #[must_use]
    pub const fn multiplier(mut self, multiplier: f64) -> Self {
        self.policy.multiplier = multiplier;
        self
    }

    /// Build the policy.
    #[must_use]
    pub fn build(self) -> RetryPolicy {
        self.policy
    }
}

/// Whether a channel failure is worth retrying.
///
/// Rejections and serialization failures are permanent; the rest are
/// treated as transport hiccups.
#[must_use]
pub const fn is_transient(err: &ChannelError) -> bool {
    !matches!(err, ChannelError::Rejected(_) | ChannelError::Serialization(_))
}

/// Run `operation`, retrying every failure per `policy`.
///
/// # Errors
///
/// Returns the error of the last attempt once retries are exhausted.
pub async fn retry_with_backoff<F, Fut, T, E>(policy: &RetryPolicy, operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    retry_with_predicate(policy, operation, |_| true).await
}

/// Run `operation`, retrying failures accepted by `is_retryable` per `policy`.
///
/// # Errors
///
/// Returns the first non-retryable error, or the error of the last attempt
/// once retries are exhausted.
pub async fn retry_with_predicate<F, Fut, T, E, P>(
    policy: &RetryPolicy,
    mut operation: F,
    is_retryable: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0;
    loop {
        let err = match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    tracing::info!(attempt, "Succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) => err,
        };

        if !is_retryable(&err) {
            tracing::warn!(error = %err, "Permanent failure, not retrying");
            return Err(err);
        }
        if attempt >= policy.max_retries {
            RetryMetrics::record_exhausted();
            tracing::error!(attempts = attempt + 1, error = %err, "Retries exhausted");
            return Err(err);
        }

        let delay = policy.delay_for_attempt(attempt);
        RetryMetrics::record_attempt();
        tracing::warn!(attempt, delay_ms = delay.as_millis(), error = %err, "Attempt failed, retrying");
        sleep(delay).await;
        attempt += 1;
    }
}
