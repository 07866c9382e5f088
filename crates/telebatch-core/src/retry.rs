//! Bounded retry with exponential backoff.
//!
//! The upload queue never retries in a tight loop: a failed request waits
//! out [`RetryPolicy::delay_for_attempt`] off-queue before it is appended
//! again, and once the attempt budget is spent (or the failure cannot
//! succeed on retry) it is dead-lettered.
//!
//! # Usage
//!
//! ```rust,ignore
//! use telebatch_core::retry::{RetryDecision, RetryPolicy};
//!
//! let policy = RetryPolicy::default();
//! match policy.decide(attempts, &error) {
//!     RetryDecision::Retry { delay } => requeue_after(delay),
//!     RetryDecision::GiveUp(reason) => dead_letter(reason),
//! }
//! ```

use std::time::Duration;

use rand::Rng;

use crate::config::RetryConfig;
use crate::error::UploadError;

/// Backoff schedule and attempt budget for failed uploads.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Wait before the first retry.
    pub initial_delay: Duration,
    /// Ceiling for any single wait, before jitter.
    pub max_delay: Duration,
    /// Growth of the wait per retry; at least 1.
    pub backoff_factor: f64,
    /// Fractional jitter in `[0, 1]`; 0.1 spreads each wait by ±10 %.
    pub jitter_percent: f64,
    /// Total attempts per request, the first included. `None` never gives up.
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self::new(
            Duration::from_millis(config.initial_delay_ms),
            Duration::from_millis(config.max_delay_ms),
            config.backoff_factor,
            config.jitter_percent,
            config.max_attempts,
        )
    }
}

/// What to do with a request after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Requeue once `delay` has elapsed.
    Retry { delay: Duration },
    /// Stop retrying; the request is dead-lettered.
    GiveUp(GiveUpReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GiveUpReason {
    /// The attempt budget is spent.
    Exhausted,
    /// The failure would repeat on every attempt.
    Permanent,
}

impl RetryPolicy {
    /// Build a policy, clamping the factor to at least 1 and jitter to `[0, 1]`.
    #[must_use]
    pub fn new(
        initial_delay: Duration,
        max_delay: Duration,
        backoff_factor: f64,
        jitter_percent: f64,
        max_attempts: Option<u32>,
    ) -> Self {
        Self {
            initial_delay,
            max_delay: max_delay.max(initial_delay),
            backoff_factor: backoff_factor.max(1.0),
            jitter_percent: jitter_percent.clamp(0.0, 1.0),
            max_attempts,
        }
    }

    /// Wait before retry number `retry` (0 = first retry), jitter applied.
    #[must_use]
    pub fn delay_for_attempt(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry.min(31)).unwrap_or(31);
        let ceiling = self.max_delay.as_millis() as f64;
        let base = (self.initial_delay.as_millis() as f64 * self.backoff_factor.powi(exponent))
            .min(ceiling);

        let spread = base * self.jitter_percent;
        let delay = if spread > 0.0 {
            base + rand::rng().random_range(-spread..=spread)
        } else {
            base
        };
        Duration::from_millis(delay.max(0.0).round() as u64)
    }

    /// Decide the fate of a request that has now failed `attempts` times.
    #[must_use]
    pub fn decide(&self, attempts: u32, error: &UploadError) -> RetryDecision {
        if !is_retryable(error) {
            return RetryDecision::GiveUp(GiveUpReason::Permanent);
        }
        if let Some(max) = self.max_attempts {
            if attempts >= max {
                return RetryDecision::GiveUp(GiveUpReason::Exhausted);
            }
        }
        RetryDecision::Retry {
            delay: self.delay_for_attempt(attempts.saturating_sub(1)),
        }
    }
}

/// Check if an upload error is worth retrying.
#[must_use]
pub fn is_retryable(error: &UploadError) -> bool {
    match error {
        UploadError::Network(_) => true,
        UploadError::Timeout(_) => true,
        // Wallet may be topped up in the meantime
        UploadError::Funding(_) => true,
        UploadError::Io(_) => true,
        // Same batch, same size
        UploadError::SizeLimit { .. } => false,
        UploadError::Encode(_) => false,
        UploadError::Decode(_) => false,
        UploadError::NotFound(_) => false,
    }
}
