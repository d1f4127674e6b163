//! Retry eligibility with exponential backoff between sync passes.

use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::config::SyncConfig;
use crate::operation::PendingOperation;

/// Upper bound for a single backoff delay.
const MAX_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

/// Backoff policy for failed operations.
///
/// The n-th failure (n >= 1) delays the next attempt by
/// `initial_delay * backoff_multiplier^(n-1)`, capped at `max_delay`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt.
    pub max_retries: u32,
    /// Delay after the first failure.
    pub initial_delay: Duration,
    /// Maximum delay (cap for exponential growth).
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
}

impl RetryPolicy {
    /// Create a policy with the given retry limit and default timing.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_delay: Duration::from_secs(5),
            max_delay: MAX_BACKOFF,
            backoff_multiplier: 2.0,
        }
    }

    /// Derive the policy from engine configuration.
    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(config.max_retries)
            .with_initial_delay(Duration::from_millis(config.throttle_ms))
            .with_backoff_multiplier(config.retry_backoff_multiplier)
    }

    /// Set initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Calculate delay for a given zero-based retry index.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let base_delay =
            self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);

        let capped_delay = base_delay.min(self.max_delay.as_millis() as f64);

        Duration::from_millis(capped_delay as u64)
    }

    /// Whether an operation with this many failures is out of retries.
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts > self.max_retries
    }

    /// Earliest instant the operation may be attempted again.
    ///
    /// `None` means the operation has never failed and is due immediately.
    pub fn next_eligible_at(&self, op: &PendingOperation) -> Option<DateTime<Utc>> {
        if op.attempts == 0 {
            return None;
        }
        let last_attempt = op.last_attempt?;
        let delay = self.delay_for_attempt(op.attempts - 1);
        let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
        Some(
            last_attempt
                .checked_add_signed(delay)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        )
    }

    /// Whether the operation may be attempted at `now`.
    pub fn is_ready(&self, op: &PendingOperation, now: DateTime<Utc>) -> bool {
        if self.is_exhausted(op.attempts) {
            return false;
        }
        self.next_eligible_at(op).map_or(true, |at| at <= now)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}
