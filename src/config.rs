//! # Configuration Module
//!
//! Runtime knobs for both engines. Setters clamp to their documented ranges
//! and are idempotent; engines pick changes up on the next cycle.

use serde::{Deserialize, Serialize};

/// Default per-type anomaly interval. The settable range is narrower; the
/// default is deliberately conservative so a fresh install is quiet.
pub const DEFAULT_ANOMALY_INTERVAL_SECONDS: u32 = 60;

/// Settable anomaly-interval range, seconds.
pub const ANOMALY_INTERVAL_RANGE: (u32, u32) = (1, 30);

/// Ultrasonic scan-cycle interval range, seconds.
pub const SCAN_INTERVAL_RANGE: (u32, u32) = (15, 120);

/// Ultrasonic acquisition duration range, seconds.
pub const SCAN_DURATION_RANGE: (u32, u32) = (3, 15);

/// Engine configuration shared by the suite.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectionConfig {
    pub ephemeral_mode: bool,
    anomaly_interval_seconds: u32,
    ultrasonic_scan_interval_seconds: u32,
    ultrasonic_scan_duration_seconds: u32,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            ephemeral_mode: false,
            anomaly_interval_seconds: DEFAULT_ANOMALY_INTERVAL_SECONDS,
            ultrasonic_scan_interval_seconds: 20,
            ultrasonic_scan_duration_seconds: 5,
        }
    }
}

impl DetectionConfig {
    pub fn anomaly_interval_seconds(&self) -> u32 {
        self.anomaly_interval_seconds
    }

    /// Clamped to 1..=30 seconds.
    pub fn set_anomaly_interval_seconds(&mut self, seconds: u32) {
        self.anomaly_interval_seconds =
            seconds.clamp(ANOMALY_INTERVAL_RANGE.0, ANOMALY_INTERVAL_RANGE.1);
    }

    pub fn min_anomaly_interval_ms(&self) -> i64 {
        self.anomaly_interval_seconds as i64 * 1_000
    }

    /// Half of the per-type interval.
    pub fn global_cooldown_ms(&self) -> i64 {
        self.min_anomaly_interval_ms() / 2
    }

    pub fn ultrasonic_scan_interval_seconds(&self) -> u32 {
        self.ultrasonic_scan_interval_seconds
    }

    /// Clamped to 15..=120 seconds.
    pub fn set_ultrasonic_scan_interval_seconds(&mut self, seconds: u32) {
        self.ultrasonic_scan_interval_seconds =
            seconds.clamp(SCAN_INTERVAL_RANGE.0, SCAN_INTERVAL_RANGE.1);
    }

    pub fn ultrasonic_scan_duration_seconds(&self) -> u32 {
        self.ultrasonic_scan_duration_seconds
    }

    /// Clamped to 3..=15 seconds.
    pub fn set_ultrasonic_scan_duration_seconds(&mut self, seconds: u32) {
        self.ultrasonic_scan_duration_seconds =
            seconds.clamp(SCAN_DURATION_RANGE.0, SCAN_DURATION_RANGE.1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DetectionConfig::default();
        assert!(!config.ephemeral_mode);
        assert_eq!(config.anomaly_interval_seconds(), 60);
        assert_eq!(config.global_cooldown_ms(), 30_000);
        assert_eq!(config.ultrasonic_scan_interval_seconds(), 20);
        assert_eq!(config.ultrasonic_scan_duration_seconds(), 5);
    }

    #[test]
    fn test_setters_clamp() {
        let mut config = DetectionConfig::default();
        config.set_anomaly_interval_seconds(0);
        assert_eq!(config.anomaly_interval_seconds(), 1);
        config.set_anomaly_interval_seconds(90);
        assert_eq!(config.anomaly_interval_seconds(), 30);

        config.set_ultrasonic_scan_interval_seconds(5);
        assert_eq!(config.ultrasonic_scan_interval_seconds(), 15);
        config.set_ultrasonic_scan_interval_seconds(600);
        assert_eq!(config.ultrasonic_scan_interval_seconds(), 120);

        config.set_ultrasonic_scan_duration_seconds(1);
        assert_eq!(config.ultrasonic_scan_duration_seconds(), 3);
        config.set_ultrasonic_scan_duration_seconds(60);
        assert_eq!(config.ultrasonic_scan_duration_seconds(), 15);
    }

    #[test]
    fn test_setters_idempotent() {
        let mut config = DetectionConfig::default();
        config.set_anomaly_interval_seconds(10);
        let once = config.clone();
        config.set_anomaly_interval_seconds(10);
        assert_eq!(config, once);
        assert_eq!(config.global_cooldown_ms(), 5_000);
    }
}
