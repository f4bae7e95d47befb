//! # DSP Module
//!
//! Single-bin Goertzel magnitude extraction over PCM windows and the adaptive
//! noise-floor estimator used to gate ultrasonic detections. Goertzel is O(N)
//! per frequency, which is far cheaper than a full FFT for the handful of
//! 100 Hz bins the scanner probes.

use std::f64::consts::PI;

/// Window size used by the ultrasonic scanner, in samples.
pub const FFT_SIZE: usize = 4096;

/// Floor added before log conversion so silent windows do not produce -inf.
const LOG_EPSILON: f64 = 1e-10;

/// Goertzel magnitude of `target_hz` over `samples` at `sample_rate`.
///
/// Samples are normalized to [-1, 1] before the recurrence. Returns a raw
/// magnitude >= 0; convert with [`magnitude_to_db`] for threshold checks.
pub fn goertzel_magnitude(samples: &[i16], target_hz: f64, sample_rate: u32) -> f64 {
    if samples.is_empty() || sample_rate == 0 {
        return 0.0;
    }

    let omega = 2.0 * PI * target_hz / sample_rate as f64;
    let coeff = 2.0 * omega.cos();

    let mut s_prev = 0.0f64;
    let mut s_prev2 = 0.0f64;
    for &sample in samples {
        let normalized = sample as f64 / i16::MAX as f64;
        let s = normalized + coeff * s_prev - s_prev2;
        s_prev2 = s_prev;
        s_prev = s;
    }

    (s_prev * s_prev + s_prev2 * s_prev2 - s_prev * s_prev2 * coeff)
        .abs()
        .sqrt()
}

/// Magnitude in dBFS-relative terms, floored so a zero magnitude stays finite.
pub fn magnitude_to_db(magnitude: f64) -> f64 {
    20.0 * (magnitude + LOG_EPSILON).log10()
}

/// Exponential-moving-average estimate of the ambient noise floor.
///
/// The reference band is 1-5 kHz: audible environmental noise that no
/// ultrasonic beacon occupies, so a loud room raises the floor without a
/// beacon masking itself.
#[derive(Debug, Clone)]
pub struct NoiseFloorEstimator {
    noise_floor_db: f64,
}

/// Reference band bounds and sampling step, Hz.
const REFERENCE_BAND_LOW_HZ: f64 = 1_000.0;
const REFERENCE_BAND_HIGH_HZ: f64 = 5_000.0;
const REFERENCE_BAND_STEP_HZ: f64 = 500.0;

impl NoiseFloorEstimator {
    pub fn new() -> Self {
        Self {
            noise_floor_db: -60.0,
        }
    }

    /// Current floor estimate in dB.
    pub fn noise_floor_db(&self) -> f64 {
        self.noise_floor_db
    }

    /// Update the floor from one analyzed window: mean dB across the
    /// reference band, folded in at 5%.
    pub fn update(&mut self, samples: &[i16], sample_rate: u32) {
        if let Some(avg_low) = reference_band_mean_db(samples, sample_rate) {
            self.fold(avg_low);
        }
    }

    /// Fold a precomputed reference-band average into the EMA. Lets callers
    /// measure inside a scoped buffer and update the estimator outside it.
    pub fn fold(&mut self, avg_low_db: f64) {
        self.noise_floor_db = 0.95 * self.noise_floor_db + 0.05 * avg_low_db;
    }

    /// Reset to the initial -60 dB estimate.
    pub fn reset(&mut self) {
        self.noise_floor_db = -60.0;
    }
}

impl Default for NoiseFloorEstimator {
    fn default() -> Self {
        Self::new()
    }
}

/// Mean dB over the 1-5 kHz reference band, or None for an empty window.
pub fn reference_band_mean_db(samples: &[i16], sample_rate: u32) -> Option<f64> {
    if samples.is_empty() || sample_rate == 0 {
        return None;
    }
    let mut sum_db = 0.0;
    let mut bins = 0u32;
    let mut freq = REFERENCE_BAND_LOW_HZ;
    while freq <= REFERENCE_BAND_HIGH_HZ {
        let magnitude = goertzel_magnitude(samples, freq, sample_rate);
        sum_db += magnitude_to_db(magnitude);
        bins += 1;
        freq += REFERENCE_BAND_STEP_HZ;
    }
    (bins > 0).then(|| sum_db / bins as f64)
}
