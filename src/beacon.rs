//! # Beacon Lifecycle Module
//!
//! Per-frequency tracking record for ultrasonic beacons: bounded amplitude,
//! frequency, and location histories, a monotone peak amplitude, and the
//! environmental context the beacon was observed in. The ultrasonic engine
//! owns the table keyed by frequency rounded to 100 Hz.

use serde::{Deserialize, Serialize};

/// Amplitude samples kept per beacon.
const MAX_AMPLITUDE_HISTORY: usize = 50;

/// Frequency estimates kept per beacon.
const MAX_FREQUENCY_HISTORY: usize = 30;

/// Location samples kept per beacon.
const MAX_LOCATION_HISTORY: usize = 20;

/// Where the device believes it is while hearing the beacon. Supplied by the
/// embedder; scales the tracking-likelihood score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvironmentalContext {
    Home,
    Work,
    Retail,
    OutdoorRandom,
    Unknown,
}

impl EnvironmentalContext {
    pub fn base_multiplier(&self) -> f64 {
        match self {
            EnvironmentalContext::Home => 0.5,
            EnvironmentalContext::Work => 0.6,
            EnvironmentalContext::Retail => 0.7,
            EnvironmentalContext::OutdoorRandom => 1.2,
            EnvironmentalContext::Unknown => 1.0,
        }
    }
}

/// One timestamped location observation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocationSample {
    pub latitude: f64,
    pub longitude: f64,
    pub timestamp_ms: i64,
}

/// Lifecycle record for one 100 Hz frequency bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeaconDetection {
    /// Bucket key: frequency rounded to 100 Hz.
    pub bucket_hz: u32,
    /// Latest measured frequency estimate.
    pub frequency_hz: f32,
    pub first_detected_ms: i64,
    pub last_detected_ms: i64,
    /// Monotone non-decreasing over the beacon's lifetime.
    pub peak_amplitude_db: f64,
    pub detection_count: u32,
    pub amplitude_history: Vec<f64>,
    pub frequency_history: Vec<f32>,
    pub location_history: Vec<LocationSample>,
    pub environmental_context: EnvironmentalContext,
}

impl BeaconDetection {
    pub fn new(
        bucket_hz: u32,
        frequency_hz: f32,
        amplitude_db: f64,
        timestamp_ms: i64,
        context: EnvironmentalContext,
        location: Option<(f64, f64)>,
    ) -> Self {
        let mut beacon = Self {
            bucket_hz,
            frequency_hz,
            first_detected_ms: timestamp_ms,
            last_detected_ms: timestamp_ms,
            peak_amplitude_db: amplitude_db,
            detection_count: 0,
            amplitude_history: Vec::new(),
            frequency_history: Vec::new(),
            location_history: Vec::new(),
            environmental_context: context,
        };
        beacon.update(frequency_hz, amplitude_db, timestamp_ms, location);
        beacon
    }

    /// Record one per-scan observation of this beacon.
    pub fn update(
        &mut self,
        frequency_hz: f32,
        amplitude_db: f64,
        timestamp_ms: i64,
        location: Option<(f64, f64)>,
    ) {
        self.detection_count = self.detection_count.saturating_add(1);
        self.last_detected_ms = self.last_detected_ms.max(timestamp_ms);
        self.frequency_hz = frequency_hz;
        if amplitude_db > self.peak_amplitude_db {
            self.peak_amplitude_db = amplitude_db;
        }

        self.amplitude_history.push(amplitude_db);
        if self.amplitude_history.len() > MAX_AMPLITUDE_HISTORY {
            self.amplitude_history.remove(0);
        }
        self.frequency_history.push(frequency_hz);
        if self.frequency_history.len() > MAX_FREQUENCY_HISTORY {
            self.frequency_history.remove(0);
        }
        if let Some((latitude, longitude)) = location {
            self.location_history.push(LocationSample {
                latitude,
                longitude,
                timestamp_ms,
            });
            if self.location_history.len() > MAX_LOCATION_HISTORY {
                self.location_history.remove(0);
            }
        }
    }

    pub fn duration_ms(&self) -> i64 {
        self.last_detected_ms - self.first_detected_ms
    }

    /// True when `last_detected` is older than `expiry_ms` at `now_ms`.
    pub fn is_expired(&self, now_ms: i64, expiry_ms: i64) -> bool {
        now_ms - self.last_detected_ms > expiry_ms
    }
}

/// Amplitude envelope classification from the per-scan amplitude history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AmplitudeProfile {
    Steady,
    Pulsing,
    Modulated,
    Erratic,
}

/// A steady envelope stays within this standard deviation, dB.
pub const STEADY_STDEV_DB: f64 = 2.0;

/// Classify the envelope: tight stdev reads as steady, otherwise the
/// mean-crossing rate separates pulsing, erratic, and modulated shapes.
pub fn classify_amplitude_profile(amplitudes: &[f64]) -> AmplitudeProfile {
    if amplitudes.len() < 2 {
        return AmplitudeProfile::Steady;
    }
    if stdev(amplitudes) < STEADY_STDEV_DB {
        return AmplitudeProfile::Steady;
    }

    let m = mean(amplitudes);
    let crossings = amplitudes
        .windows(2)
        .filter(|w| (w[0] - m).signum() != (w[1] - m).signum())
        .count();
    let rate = crossings as f64 / (amplitudes.len() - 1) as f64;

    if rate > 0.6 {
        AmplitudeProfile::Erratic
    } else if rate >= 0.3 {
        AmplitudeProfile::Pulsing
    } else {
        AmplitudeProfile::Modulated
    }
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

pub fn stdev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let var = values.iter().map(|v| (v - m) * (v - m)).sum::<f64>() / values.len() as f64;
    var.sqrt()
}

pub fn stdev_f32(values: &[f32]) -> f64 {
    let as_f64: Vec<f64> = values.iter().map(|&v| v as f64).collect();
    stdev(&as_f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn beacon() -> BeaconDetection {
        BeaconDetection::new(
            18_000,
            18_000.0,
            35.0,
            1_000,
            EnvironmentalContext::Unknown,
            Some((40.0, -74.0)),
        )
    }

    #[test]
    fn test_new_beacon_counts_first_observation() {
        let b = beacon();
        assert_eq!(b.detection_count, 1);
        assert_eq!(b.first_detected_ms, 1_000);
        assert_eq!(b.last_detected_ms, 1_000);
        assert_eq!(b.amplitude_history.len(), 1);
        assert_eq!(b.location_history.len(), 1);
    }

    #[test]
    fn test_peak_amplitude_is_monotone() {
        let mut b = beacon();
        b.update(18_000.0, 40.0, 2_000, None);
        assert_eq!(b.peak_amplitude_db, 40.0);
        b.update(18_000.0, 20.0, 3_000, None);
        // A quieter observation never lowers the peak.
        assert_eq!(b.peak_amplitude_db, 40.0);
        assert!(b.first_detected_ms <= b.last_detected_ms);
    }

    #[test]
    fn test_histories_are_bounded() {
        let mut b = beacon();
        for i in 0..120 {
            b.update(18_000.0 + i as f32, 30.0 + i as f64, 1_000 + i, Some((40.0, -74.0)));
        }
        assert!(b.amplitude_history.len() <= 50);
        assert!(b.frequency_history.len() <= 30);
        assert!(b.location_history.len() <= 20);
        assert_eq!(b.detection_count, 121);
    }

    #[test]
    fn test_expiry_window() {
        let b = beacon();
        assert!(!b.is_expired(100_000, 120_000));
        assert!(b.is_expired(130_000, 120_000));
    }

    #[test]
    fn test_steady_profile() {
        let amplitudes = vec![30.0, 30.5, 29.8, 30.2, 30.1];
        assert_eq!(classify_amplitude_profile(&amplitudes), AmplitudeProfile::Steady);
    }

    #[test]
    fn test_erratic_profile_crosses_mean_constantly() {
        let amplitudes = vec![20.0, 36.0, 21.0, 35.0, 19.0, 37.0, 20.0, 36.0];
        assert_eq!(classify_amplitude_profile(&amplitudes), AmplitudeProfile::Erratic);
    }

    #[test]
    fn test_modulated_profile_drifts_slowly() {
        // A slow ramp: large spread, almost no mean crossings.
        let amplitudes = vec![10.0, 12.0, 15.0, 19.0, 24.0, 30.0, 37.0, 45.0];
        assert_eq!(classify_amplitude_profile(&amplitudes), AmplitudeProfile::Modulated);
    }

    #[test]
    fn test_pulsing_profile() {
        // On/off keying: every second pair crosses the mean.
        let amplitudes = vec![40.0, 40.0, 10.0, 10.0, 40.0, 40.0, 10.0, 10.0, 40.0];
        assert_eq!(classify_amplitude_profile(&amplitudes), AmplitudeProfile::Pulsing);
    }

    #[test]
    fn test_stats_helpers() {
        assert_eq!(mean(&[]), 0.0);
        assert_eq!(stdev(&[5.0]), 0.0);
        assert!((mean(&[1.0, 2.0, 3.0]) - 2.0).abs() < 1e-12);
        assert!((stdev(&[2.0, 2.0, 2.0]) - 0.0).abs() < 1e-12);
    }

    #[test]
    fn test_environment_multipliers() {
        assert_eq!(EnvironmentalContext::Home.base_multiplier(), 0.5);
        assert_eq!(EnvironmentalContext::OutdoorRandom.base_multiplier(), 1.2);
        assert_eq!(EnvironmentalContext::Unknown.base_multiplier(), 1.0);
    }
}
