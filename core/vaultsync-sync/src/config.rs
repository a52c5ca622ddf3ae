//! Engine configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables for one engine instance. Durations are milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Worker tasks draining the notification queue.
    pub worker_count: usize,
    /// Capacity of the notification queue.
    pub queue_capacity: usize,
    /// How long a delivered id stays in the processed set (ms).
    pub dedup_ttl_ms: u64,
    /// Interval of the full processed-set sweep (ms).
    pub sweep_interval_ms: u64,
    /// Health check interval (ms).
    pub health_check_interval_ms: u64,
    /// Maximum silence before the source is assumed dead (ms).
    pub silence_threshold_ms: u64,
    /// First reconnect delay (ms).
    pub reconnect_base_ms: u64,
    /// Upper bound on any reconnect delay (ms).
    pub reconnect_cap_ms: u64,
    /// Reconnect jitter as a fraction of the delay (0.2 = ±20%).
    pub reconnect_jitter: f64,
    /// Reconnect attempts before the supervisor gives up.
    pub max_reconnect_attempts: u32,
    /// Transport errors retried before the exhaustion pause.
    pub max_transport_retries: u32,
    /// Per-retry delay step after a transport error (ms).
    pub transport_retry_delay_ms: u64,
    /// Pause after `max_transport_retries` is exceeded (ms).
    pub exhaustion_pause_ms: u64,
    /// Consistency delay for entity kinds that do not set their own (ms).
    pub default_consistency_delay_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_count: 8,
            queue_capacity: 1024,
            dedup_ttl_ms: 5_000,
            sweep_interval_ms: 30 * 60 * 1_000,
            health_check_interval_ms: 60_000,
            silence_threshold_ms: 120_000,
            reconnect_base_ms: 1_000,
            reconnect_cap_ms: 60_000,
            reconnect_jitter: 0.2,
            max_reconnect_attempts: 20,
            max_transport_retries: 10,
            transport_retry_delay_ms: 1_000,
            exhaustion_pause_ms: 5_000,
            default_consistency_delay_ms: 3_000,
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub fn dedup_ttl(&self) -> Duration {
        Duration::from_millis(self.dedup_ttl_ms)
    }

    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    #[must_use]
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    #[must_use]
    pub fn silence_threshold(&self) -> Duration {
        Duration::from_millis(self.silence_threshold_ms)
    }

    #[must_use]
    pub fn default_consistency_delay(&self) -> Duration {
        Duration::from_millis(self.default_consistency_delay_ms)
    }
}
