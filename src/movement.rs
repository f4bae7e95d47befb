//! # Movement Module
//!
//! Great-circle distance and coarse speed classification between consecutive
//! location fixes. The cellular engine uses the classification to decide
//! whether a cell change happened while the device was stationary, and to
//! flag physically impossible jumps.

use serde::{Deserialize, Serialize};

const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Haversine great-circle distance in meters. Non-finite inputs yield 0.
pub fn haversine_distance_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    if !(lat1.is_finite() && lon1.is_finite() && lat2.is_finite() && lon2.is_finite()) {
        return 0.0;
    }

    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_M * c
}

/// Coarse movement classification in km/h buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MovementType {
    Stationary,
    Walking,
    Running,
    Cycling,
    Vehicle,
    HighSpeedVehicle,
    /// Faster than any ground or air transport this engine models.
    Impossible,
    /// No usable previous fix; must not be treated as stationary.
    Unknown,
}

impl MovementType {
    pub fn from_speed_kmh(speed_kmh: f64) -> Self {
        match speed_kmh {
            s if s < 1.0 => MovementType::Stationary,
            s if s < 7.0 => MovementType::Walking,
            s if s < 20.0 => MovementType::Running,
            s if s < 40.0 => MovementType::Cycling,
            s if s < 150.0 => MovementType::Vehicle,
            s if s < 350.0 => MovementType::HighSpeedVehicle,
            _ => MovementType::Impossible,
        }
    }
}

/// Movement between two fixes, as consumed by the scoring layer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MovementAnalysis {
    pub distance_m: f64,
    pub speed_kmh: f64,
    pub movement_type: MovementType,
    pub impossible_speed: bool,
}

impl MovementAnalysis {
    /// No-information analysis; never upgrades stationary-specific penalties.
    pub fn unknown() -> Self {
        Self {
            distance_m: 0.0,
            speed_kmh: 0.0,
            movement_type: MovementType::Unknown,
            impossible_speed: false,
        }
    }

    /// Stationary-by-default analysis, only valid when a recent fix exists.
    pub fn stationary() -> Self {
        Self {
            distance_m: 0.0,
            speed_kmh: 0.0,
            movement_type: MovementType::Stationary,
            impossible_speed: false,
        }
    }

    /// Analyze movement between two timestamped fixes. `dt == 0` guards
    /// against division blowups and classifies as Unknown.
    pub fn between(
        prev_lat: f64,
        prev_lon: f64,
        prev_ts_ms: i64,
        lat: f64,
        lon: f64,
        ts_ms: i64,
    ) -> Self {
        let dt_ms = ts_ms.saturating_sub(prev_ts_ms);
        if dt_ms <= 0 {
            return Self::unknown();
        }

        let distance_m = haversine_distance_m(prev_lat, prev_lon, lat, lon);
        let dt_hours = dt_ms as f64 / 3_600_000.0;
        let speed_kmh = (distance_m / 1_000.0) / dt_hours;
        let movement_type = MovementType::from_speed_kmh(speed_kmh);

        Self {
            distance_m,
            speed_kmh,
            movement_type,
            impossible_speed: movement_type == MovementType::Impossible,
        }
    }

    pub fn is_stationary(&self) -> bool {
        self.movement_type == MovementType::Stationary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_haversine_identity_is_zero() {
        assert_eq!(haversine_distance_m(40.7128, -74.0060, 40.7128, -74.0060), 0.0);
    }

    #[test]
    fn test_haversine_symmetry() {
        let d1 = haversine_distance_m(40.7128, -74.0060, 34.0522, -118.2437);
        let d2 = haversine_distance_m(34.0522, -118.2437, 40.7128, -74.0060);
        assert!((d1 - d2).abs() < 1e-6);
        // NYC to LA is roughly 3,940 km
        assert!((d1 - 3_940_000.0).abs() < 50_000.0);
    }

    #[test]
    fn test_haversine_triangle_inequality() {
        let a = (40.0, -74.0);
        let b = (41.0, -75.0);
        let c = (42.0, -73.0);
        let ab = haversine_distance_m(a.0, a.1, b.0, b.1);
        let bc = haversine_distance_m(b.0, b.1, c.0, c.1);
        let ac = haversine_distance_m(a.0, a.1, c.0, c.1);
        assert!(ac <= ab + bc + 1e-6);
    }

    #[test]
    fn test_haversine_rejects_non_finite() {
        assert_eq!(haversine_distance_m(f64::NAN, 0.0, 1.0, 1.0), 0.0);
        assert_eq!(haversine_distance_m(0.0, f64::INFINITY, 1.0, 1.0), 0.0);
    }

    #[test]
    fn test_speed_buckets() {
        assert_eq!(MovementType::from_speed_kmh(0.5), MovementType::Stationary);
        assert_eq!(MovementType::from_speed_kmh(5.0), MovementType::Walking);
        assert_eq!(MovementType::from_speed_kmh(15.0), MovementType::Running);
        assert_eq!(MovementType::from_speed_kmh(30.0), MovementType::Cycling);
        assert_eq!(MovementType::from_speed_kmh(100.0), MovementType::Vehicle);
        assert_eq!(MovementType::from_speed_kmh(300.0), MovementType::HighSpeedVehicle);
        assert_eq!(MovementType::from_speed_kmh(400.0), MovementType::Impossible);
    }

    #[test]
    fn test_between_flags_impossible_jump() {
        // ~3,940 km in one minute
        let m = MovementAnalysis::between(40.7128, -74.0060, 0, 34.0522, -118.2437, 60_000);
        assert!(m.impossible_speed);
        assert_eq!(m.movement_type, MovementType::Impossible);
    }

    #[test]
    fn test_between_zero_dt_is_unknown() {
        let m = MovementAnalysis::between(40.0, -74.0, 1_000, 40.1, -74.1, 1_000);
        assert_eq!(m.movement_type, MovementType::Unknown);
        assert!(!m.impossible_speed);
    }
}
