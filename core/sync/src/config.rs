//! Engine configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use fieldsync_common::{Error, Result};

use crate::conflict::ConflictStrategy;

/// Configuration for the sync engine.
///
/// Changes take effect on the next scheduling decision; a pass already in
/// flight keeps the configuration it started with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Run passes on a periodic timer.
    pub auto_sync: bool,
    /// Period of the auto-sync timer.
    pub sync_interval_minutes: u64,
    /// Run a pass when connectivity comes back.
    pub sync_on_connect: bool,
    /// Conflict resolution strategy.
    pub conflict_strategy: ConflictStrategy,
    /// Retries allowed after the first failed attempt.
    pub max_retries: u32,
    /// Multiplier for exponential backoff.
    pub retry_backoff_multiplier: f64,
    /// Maximum operations sent per batch.
    pub batch_size: usize,
    /// Minimum gap between passes, and the base backoff delay.
    pub throttle_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            auto_sync: true,
            sync_interval_minutes: 15,
            sync_on_connect: true,
            conflict_strategy: ConflictStrategy::NewestWins,
            max_retries: 3,
            retry_backoff_multiplier: 2.0,
            batch_size: 50,
            throttle_ms: 5000,
        }
    }
}

impl SyncConfig {
    /// Set the conflict strategy.
    pub fn with_conflict_strategy(mut self, strategy: ConflictStrategy) -> Self {
        self.conflict_strategy = strategy;
        self
    }

    /// Set the retry limit.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the throttle window.
    pub fn with_throttle_ms(mut self, throttle_ms: u64) -> Self {
        self.throttle_ms = throttle_ms;
        self
    }

    /// Set the batch size.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.retry_backoff_multiplier = multiplier;
        self
    }

    /// Enable or disable the periodic timer.
    pub fn with_auto_sync(mut self, auto_sync: bool) -> Self {
        self.auto_sync = auto_sync;
        self
    }

    /// Enable or disable syncing on reconnect.
    pub fn with_sync_on_connect(mut self, sync_on_connect: bool) -> Self {
        self.sync_on_connect = sync_on_connect;
        self
    }

    /// Period of the auto-sync timer.
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_minutes.saturating_mul(60))
    }

    /// Check the configuration is usable.
    ///
    /// # Errors
    /// - `batch_size` is zero
    /// - `sync_interval_minutes` is zero
    /// - backoff multiplier is below 1.0 or not finite
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::InvalidInput("batch_size must be at least 1".to_string()));
        }
        if self.sync_interval_minutes == 0 {
            return Err(Error::InvalidInput(
                "sync_interval_minutes must be at least 1".to_string(),
            ));
        }
        if !self.retry_backoff_multiplier.is_finite() || self.retry_backoff_multiplier < 1.0 {
            return Err(Error::InvalidInput(format!(
                "retry_backoff_multiplier must be >= 1.0, got {}",
                self.retry_backoff_multiplier
            )));
        }
        Ok(())
    }
}

/// Partial configuration merged by `SyncEngine::update_config`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfigUpdate {
    pub auto_sync: Option<bool>,
    pub sync_interval_minutes: Option<u64>,
    pub sync_on_connect: Option<bool>,
    pub conflict_strategy: Option<ConflictStrategy>,
    pub max_retries: Option<u32>,
    pub retry_backoff_multiplier: Option<f64>,
    pub batch_size: Option<usize>,
    pub throttle_ms: Option<u64>,
}

impl SyncConfigUpdate {
    /// Whether the update sets nothing.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Merge into `config`, returning the merged copy.
    pub fn apply_to(&self, config: &SyncConfig) -> SyncConfig {
        let mut merged = config.clone();
        if let Some(v) = self.auto_sync {
            merged.auto_sync = v;
        }
        if let Some(v) = self.sync_interval_minutes {
            merged.sync_interval_minutes = v;
        }
        if let Some(v) = self.sync_on_connect {
            merged.sync_on_connect = v;
        }
        if let Some(v) = self.conflict_strategy {
            merged.conflict_strategy = v;
        }
        if let Some(v) = self.max_retries {
            merged.max_retries = v;
        }
        if let Some(v) = self.retry_backoff_multiplier {
            merged.retry_backoff_multiplier = v;
        }
        if let Some(v) = self.batch_size {
            merged.batch_size = v;
        }
        if let Some(v) = self.throttle_ms {
            merged.throttle_ms = v;
        }
        merged
    }
}

/// Whether moving from `old` to `new` requires restarting the periodic timer.
pub(crate) fn schedule_changed(old: &SyncConfig, new: &SyncConfig) -> bool {
    old.auto_sync != new.auto_sync || old.sync_interval_minutes != new.sync_interval_minutes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_documented_defaults() {
        let config = SyncConfig::default();
        assert!(config.auto_sync);
        assert_eq!(config.sync_interval_minutes, 15);
        assert_eq!(config.conflict_strategy, ConflictStrategy::NewestWins);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.retry_backoff_multiplier, 2.0);
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.throttle_ms, 5000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_falls_back_to_defaults() {
        let config: SyncConfig = serde_json::from_str(r#"{"batch_size": 5}"#).unwrap();
        assert_eq!(config.batch_size, 5);
        assert_eq!(config.throttle_ms, 5000);
    }

    #[test]
    fn test_update_merges_only_set_fields() {
        let base = SyncConfig::default();
        let update = SyncConfigUpdate {
            max_retries: Some(7),
            conflict_strategy: Some(ConflictStrategy::Manual),
            ..Default::default()
        };

        let merged = update.apply_to(&base);
        assert_eq!(merged.max_retries, 7);
        assert_eq!(merged.conflict_strategy, ConflictStrategy::Manual);
        assert_eq!(merged.batch_size, base.batch_size);
        assert!(!schedule_changed(&base, &merged));
    }

    #[test]
    fn test_schedule_change_detection() {
        let base = SyncConfig::default();
        let update = SyncConfigUpdate {
            sync_interval_minutes: Some(5),
            ..Default::default()
        };
        assert!(schedule_changed(&base, &update.apply_to(&base)));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(SyncConfig::default().with_batch_size(0).validate().is_err());
        assert!(SyncConfig::default()
            .with_backoff_multiplier(0.5)
            .validate()
            .is_err());
        assert!(SyncConfig::default()
            .with_backoff_multiplier(f64::NAN)
            .validate()
            .is_err());
    }

    #[test]
    fn test_empty_update() {
        assert!(SyncConfigUpdate::default().is_empty());
    }
}
