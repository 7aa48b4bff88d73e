//! Durability settings shared by the store backends and the durability agent.
//!
//! Settings deserialize from TOML with every field optional:
//!
//! ```toml
//! scheduled_job_polling_ms = 5000
//! recovery_batch_size = 100
//! dormant_node_threshold_ms = 60000
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::result::Result;

/// Tuning knobs for durable messaging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DurabilitySettings {
    /// Delay before the short-period timer first fires.
    pub scheduled_job_first_execution_ms: u64,
    /// Period of the timer driving recovery, scheduled jobs and expiry.
    pub scheduled_job_polling_ms: u64,
    /// Period of the timer driving health checks and dormant-node reassignment.
    pub node_reassignment_polling_ms: u64,
    /// Upper bound of the random delay added to each timer's first tick.
    pub first_execution_jitter_ms: u64,
    /// Maximum envelopes claimed per destination per recovery cycle.
    pub recovery_batch_size: usize,
    /// Globally-owned incoming rows younger than this are left alone.
    pub incoming_recovery_age_ms: u64,
    /// How long handled incoming envelopes are retained for duplicate detection.
    pub keep_after_message_handling_ms: u64,
    /// Retention of dead letters; `None` keeps them until purged.
    pub dead_letter_expiration_ms: Option<u64>,
    /// A node without a heartbeat for this long is dormant.
    pub dormant_node_threshold_ms: u64,
    /// A dormant node's row is deleted by the leader after this long.
    pub stale_node_row_threshold_ms: u64,
    /// Retention of node audit records.
    pub node_record_retention_ms: u64,
    /// Lease of an advisory lock held by a crashed process.
    pub lock_lease_ms: u64,
    /// Processing attempts before an envelope is dead-lettered.
    pub max_processing_attempts: u32,
    /// Base of the exponential retry backoff.
    pub retry_base_delay_ms: u64,
    /// Cap of the exponential retry backoff.
    pub retry_max_delay_ms: u64,
    /// Publish persisted counts on every short-period tick.
    pub metrics_enabled: bool,
    /// Capacity of the durability worker's action queue.
    pub action_queue_capacity: usize,
}

impl Default for DurabilitySettings {
    fn default() -> Self {
        Self {
            scheduled_job_first_execution_ms: 0,
            scheduled_job_polling_ms: 5_000,
            node_reassignment_polling_ms: 30_000,
            first_execution_jitter_ms: 1_000,
            recovery_batch_size: 100,
            incoming_recovery_age_ms: 0,
            keep_after_message_handling_ms: 5 * 60 * 1_000,
            dead_letter_expiration_ms: None,
            dormant_node_threshold_ms: 60_000,
            stale_node_row_threshold_ms: 10 * 60 * 1_000,
            node_record_retention_ms: 24 * 60 * 60 * 1_000,
            lock_lease_ms: 60_000,
            max_processing_attempts: 3,
            retry_base_delay_ms: 1_000,
            retry_max_delay_ms: 60_000,
            metrics_enabled: false,
            action_queue_capacity: 64,
        }
    }
}

impl DurabilitySettings {
    /// Settings with short intervals for tests.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            scheduled_job_polling_ms: 50,
            node_reassignment_polling_ms: 100,
            first_execution_jitter_ms: 10,
            recovery_batch_size: 10,
            retry_base_delay_ms: 10,
            retry_max_delay_ms: 100,
            ..Self::default()
        }
    }

    /// Parse settings from a TOML document.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is not valid TOML or a value is out of range.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let settings: Self =
            toml::from_str(content).map_err(|e| Error::toml_parse_failed(e.to_string()))?;
        settings.validate()
    }

    /// Load settings from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::file_read_failed(path, e.to_string()))?;
        Self::from_toml_str(&content)
    }

    /// Reject settings the agent cannot run with.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first invalid setting.
    pub fn validate(self) -> Result<Self> {
        if self.recovery_batch_size == 0 {
            return Err(Error::invalid_setting(
                "recovery_batch_size",
                "must be greater than zero",
            ));
        }
        if self.scheduled_job_polling_ms == 0 || self.node_reassignment_polling_ms == 0 {
            return Err(Error::invalid_setting(
                "polling interval",
                "timers need a non-zero period",
            ));
        }
        if self.max_processing_attempts == 0 {
            return Err(Error::invalid_setting(
                "max_processing_attempts",
                "must allow at least one attempt",
            ));
        }
        if self.action_queue_capacity == 0 {
            return Err(Error::invalid_setting(
                "action_queue_capacity",
                "must be greater than zero",
            ));
        }
        Ok(self)
    }

    #[must_use]
    pub const fn scheduled_job_first_execution(&self) -> Duration {
        Duration::from_millis(self.scheduled_job_first_execution_ms)
    }

    #[must_use]
    pub const fn scheduled_job_polling(&self) -> Duration {
        Duration::from_millis(self.scheduled_job_polling_ms)
    }

    #[must_use]
    pub const fn node_reassignment_polling(&self) -> Duration {
        Duration::from_millis(self.node_reassignment_polling_ms)
    }

    #[must_use]
    pub const fn lock_lease(&self) -> Duration {
        Duration::from_millis(self.lock_lease_ms)
    }

    /// `keep_until` watermark for an envelope handled at `now`.
    #[must_use]
    pub fn keep_until(&self, now: chrono::DateTime<chrono::Utc>) -> chrono::DateTime<chrono::Utc> {
        now + millis(self.keep_after_message_handling_ms)
    }

    /// Expiry for a dead letter captured at `now`.
    #[must_use]
    pub fn dead_letter_expiry(
        &self,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Option<chrono::DateTime<chrono::Utc>> {
        self.dead_letter_expiration_ms.map(|ms| now + millis(ms))
    }

    /// Exponential backoff before retry number `attempt` (1-based).
    #[must_use]
    pub fn retry_delay(&self, attempt: u32) -> chrono::Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let backoff = self
            .retry_base_delay_ms
            .saturating_mul(2u64.saturating_pow(exponent));
        millis(backoff.min(self.retry_max_delay_ms))
    }
}

/// Convert a millisecond setting into a `chrono::Duration`.
#[must_use]
pub fn millis(ms: u64) -> chrono::Duration {
    chrono::Duration::milliseconds(i64::try_from(ms).unwrap_or(i64::MAX))
}
