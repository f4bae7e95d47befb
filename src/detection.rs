//! # Detection Module
//!
//! Shared boundary types: the generic `Detection` record both engines emit
//! toward storage/UI, detector status values surfaced on the status streams,
//! and the uniform supervision callback trait. No engine error ever crosses
//! an engine boundary; everything funnels through [`DetectorObserver`].

use crate::timeline::ThreatLevel;
use serde::{Deserialize, Serialize};

/// Radio protocol a detection originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolType {
    Cellular,
    Audio,
}

/// How the detection was made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DetectionMethod {
    CellularAnomaly,
    UltrasonicBeacon,
}

/// Coarse device classification for the UI layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceType {
    CellTower,
    ImsiCatcher,
    UltrasonicBeacon,
    Unknown,
}

/// Generic detection record emitted at the storage/UI boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub id: String,
    pub timestamp_ms: i64,
    pub protocol: ProtocolType,
    pub method: DetectionMethod,
    pub device_type: DeviceType,
    pub signal_dbm: i32,
    pub threat_level: ThreatLevel,
    /// 0..=100.
    pub threat_score: u8,
    /// JSON array of contributing-factor strings.
    pub factors_json: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

/// Unique detection id: epoch millis plus a random suffix.
pub fn detection_id(now_ms: i64) -> String {
    let suffix: u32 = rand::random();
    format!("{}_{}", now_ms, hex::encode(suffix.to_be_bytes()))
}

/// Detector lifecycle state surfaced on the status streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DetectorStatus {
    Idle,
    Monitoring,
    Scanning,
    /// Required platform permission is missing; scans are suppressed.
    PermissionDenied,
    /// Non-recoverable failure until the engine is restarted.
    Failed,
}

/// Identifies a detector in supervision callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DetectorId {
    Cellular,
    Ultrasonic,
}

impl DetectorId {
    pub fn name(&self) -> &'static str {
        match self {
            DetectorId::Cellular => "cellular",
            DetectorId::Ultrasonic => "ultrasonic",
        }
    }
}

/// Uniform supervision callbacks. All methods default to no-ops so embedders
/// and tests implement only what they observe.
pub trait DetectorObserver: Send + Sync {
    fn on_detector_started(&self, _detector: DetectorId) {}
    fn on_detector_stopped(&self, _detector: DetectorId) {}
    fn on_scan_success(&self, _detector: DetectorId) {}
    fn on_error(&self, _detector: DetectorId, _message: &str, _recoverable: bool) {}
}

/// Observer that drops everything. Default when the embedder registers none.
#[derive(Debug, Default)]
pub struct NullObserver;

impl DetectorObserver for NullObserver {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_detection_ids_are_unique() {
        let a = detection_id(1_000);
        let b = detection_id(1_000);
        assert_ne!(a, b);
        assert!(a.starts_with("1000_"));
    }

    #[test]
    fn test_detection_serializes() {
        let detection = Detection {
            id: detection_id(5),
            timestamp_ms: 5,
            protocol: ProtocolType::Cellular,
            method: DetectionMethod::CellularAnomaly,
            device_type: DeviceType::ImsiCatcher,
            signal_dbm: -60,
            threat_level: ThreatLevel::High,
            threat_score: 75,
            factors_json: serde_json::to_string(&["Suspicious LAC value (1)"]).unwrap(),
            latitude: Some(40.0),
            longitude: Some(-74.0),
        };
        let json = serde_json::to_string(&detection).unwrap();
        let back: Detection = serde_json::from_str(&json).unwrap();
        assert_eq!(back, detection);
    }

    #[test]
    fn test_observer_defaults_are_noops() {
        struct Counting(AtomicUsize);
        impl DetectorObserver for Counting {
            fn on_scan_success(&self, _: DetectorId) {
                self.0.fetch_add(1, Ordering::Relaxed);
            }
        }

        let observer = Counting(AtomicUsize::new(0));
        observer.on_detector_started(DetectorId::Cellular);
        observer.on_error(DetectorId::Ultrasonic, "boom", true);
        observer.on_scan_success(DetectorId::Ultrasonic);
        assert_eq!(observer.0.load(Ordering::Relaxed), 1);
    }
}
