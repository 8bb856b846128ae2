//! Client configuration

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Settings for one [`IndiClient`](crate::IndiClient)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndiClientConfig {
    /// TCP connect timeout (default: 30 seconds)
    pub connection_timeout_secs: u64,
    /// Switch every newly defined device to connected (default: false)
    pub auto_connect_devices: bool,
    /// Warn once when a buffered fragment stays incomplete this long (default: 60 seconds)
    pub stalled_fragment_warn_secs: u64,
    /// Polling interval for property waits (default: 500ms)
    pub property_poll_interval_ms: u64,
    /// Capacity of channels handed out by `subscribe_channel` (default: 256)
    pub event_channel_capacity: usize,
    pub reconnection: ReconnectionConfig,
}

impl Default for IndiClientConfig {
    fn default() -> Self {
        Self {
            connection_timeout_secs: 30,
            auto_connect_devices: false,
            stalled_fragment_warn_secs: 60,
            property_poll_interval_ms: 500,
            event_channel_capacity: 256,
            reconnection: ReconnectionConfig::default(),
        }
    }
}

impl IndiClientConfig {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn property_poll_interval(&self) -> Duration {
        Duration::from_millis(self.property_poll_interval_ms.max(1))
    }

    pub fn stalled_fragment_warning(&self) -> Duration {
        Duration::from_secs(self.stalled_fragment_warn_secs)
    }
}

/// Reconnection configuration with jitter support
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectionConfig {
    /// Base delay for exponential backoff
    pub base_delay_secs: u64,
    /// Maximum delay cap
    pub max_delay_secs: u64,
    /// Maximum number of reconnection attempts
    pub max_attempts: u32,
    /// Randomize delays so clients restarted together do not retry in lockstep
    pub use_jitter: bool,
    /// Jitter factor (0.0 to 1.0, default 0.3 = 30% variation)
    pub jitter_factor: f64,
}

impl Default for ReconnectionConfig {
    fn default() -> Self {
        Self {
            base_delay_secs: 1,
            max_delay_secs: 30,
            max_attempts: 5,
            use_jitter: true,
            jitter_factor: 0.3,
        }
    }
}

impl ReconnectionConfig {
    /// Delay before the given attempt (1-based): `base * 2^(attempt-1)`, capped at the maximum
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let base = Duration::from_secs(self.base_delay_secs);
        let max = Duration::from_secs(self.max_delay_secs);

        let exponential_delay = 2u32
            .checked_pow(attempt.saturating_sub(1))
            .and_then(|factor| base.checked_mul(factor))
            .unwrap_or(max)
            .min(max);

        if !self.use_jitter || self.jitter_factor <= 0.0 {
            return exponential_delay;
        }

        // Spread of ±jitter_factor/2 around the exponential delay
        let jitter_range = exponential_delay.as_secs_f64() * self.jitter_factor.min(1.0);
        let offset = rand::thread_rng().gen_range(-0.5..=0.5) * jitter_range;
        let jittered_secs = (exponential_delay.as_secs_f64() + offset).max(0.1);
        Duration::from_secs_f64(jittered_secs.min(max.as_secs_f64()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = IndiClientConfig::default();
        assert_eq!(config.connection_timeout(), Duration::from_secs(30));
        assert_eq!(config.property_poll_interval(), Duration::from_millis(500));
        assert_eq!(config.stalled_fragment_warning(), Duration::from_secs(60));
        assert!(!config.auto_connect_devices);
        assert_eq!(config.reconnection.max_attempts, 5);
    }

    #[test]
    fn test_exponential_backoff() {
        let config = ReconnectionConfig {
            base_delay_secs: 1,
            max_delay_secs: 30,
            max_attempts: 5,
            use_jitter: false,
            jitter_factor: 0.0,
        };

        assert_eq!(config.calculate_delay(1), Duration::from_secs(1));
        assert_eq!(config.calculate_delay(2), Duration::from_secs(2));
        assert_eq!(config.calculate_delay(3), Duration::from_secs(4));
        assert_eq!(config.calculate_delay(5), Duration::from_secs(16));
        assert_eq!(config.calculate_delay(6), Duration::from_secs(30));
        assert_eq!(config.calculate_delay(64), Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let config = ReconnectionConfig {
            base_delay_secs: 10,
            max_delay_secs: 100,
            max_attempts: 5,
            use_jitter: true,
            jitter_factor: 0.3,
        };

        for _ in 0..50 {
            let delay = config.calculate_delay(1).as_secs_f64();
            assert!((8.5..=11.5).contains(&delay), "delay {} out of range", delay);
        }
    }
}
