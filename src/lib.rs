//! # Sentinel Core Library
//!
//! A Rust library implementing on-device surveillance detection for handheld
//! radio-capable devices. Two engines run side by side: a cellular anomaly
//! engine that scores IMSI-catcher (cell-site simulator) behavior from
//! serving-cell telemetry, and an ultrasonic engine that tracks inaudible
//! cross-device beacons in the 17.5-22 kHz band. Both feed a shared timeline
//! and a persistence facade and publish latest-value streams for a UI layer.
//!
//! ## Architecture Overview
//!
//! The library consists of modular components around the two engines:
//!
//! - **`CellularAnomalyEngine`**: per-snapshot decision ladder over the trust
//!   model, stationary-change patterns, and the network-generation downgrade
//!   chain; emits [`CellularAnomaly`] records scored 0-100
//! - **`UltrasonicEngine`**: periodic encrypted-buffer acquisitions, Goertzel
//!   bin sweep, per-frequency beacon lifecycle, confirmation gating, and a
//!   false-positive layer for CRTs, power supplies, pest deterrents, and EV
//!   warning tones; emits [`UltrasonicAnomaly`] records
//! - **`CellTrustModel`**: per-cell sighting history backing trust scores and
//!   the familiar-area query
//! - **`signatures`**: test-network MCC/MNC ranges, StingRay-typical LAC/TAC
//!   values, suspicious cell-id patterns, and known ultrasonic beacon vendors
//!   with modulation metadata
//! - **`SecureAudioBuffer`**: AES-256-GCM encrypted in-memory PCM staging
//!   with scoped decryption and wipe-on-drop
//! - **`EventTimeline`** / **`AnomalyRateLimiter`**: bounded newest-first
//!   event stream shared by both engines, per-type intervals plus a global
//!   cooldown
//! - **`PersistenceFacade`**: async boundary over a [`PersistenceSink`];
//!   write errors are swallowed (in-memory state is authoritative) and
//!   ephemeral mode turns writes into no-ops
//!
//! ## Data Flow
//!
//! Telephony and audio adapters push samples in; engines update their own
//! tables behind per-table locks; pure scoring functions turn analysis
//! records into integers; anomalies are rate-limited, appended to the
//! timeline, persisted (unless ephemeral), and published on `watch` streams
//! that always hold the latest value for new subscribers.
//!
//! ## Example
//!
//! ```no_run
//! use sentinel_core::{DetectionSuite, DetectionConfig, RadioCell, RadioCellIdentity};
//! use std::sync::Arc;
//!
//! # async fn example() {
//! let suite = DetectionSuite::new(Arc::new(sentinel_core::NoopPersistenceSink));
//! suite.apply_config(&DetectionConfig::default()).await;
//! suite.start_cellular().await;
//!
//! let cells = vec![RadioCell {
//!     registered: true,
//!     identity: RadioCellIdentity::Nr { nci: Some(0x1234_5678), tac: Some(310) },
//!     mcc: Some("310".into()),
//!     mnc: Some("260".into()),
//!     signal_dbm: -85,
//! }];
//! suite.on_cell_info(&cells).await;
//!
//! let mut anomalies = suite.cellular().anomalies();
//! if anomalies.borrow_and_update().is_some() {
//!     // surface to the notification layer
//! }
//! # }
//! ```

pub mod beacon;
pub mod cellular;
pub mod config;
pub mod detection;
pub mod dsp;
pub mod history;
pub mod movement;
pub mod persistence;
pub mod secure_buffer;
pub mod signatures;
pub mod telephony;
pub mod timeline;
pub mod trust;
pub mod ultrasonic;

pub use beacon::{AmplitudeProfile, BeaconDetection, EnvironmentalContext, LocationSample};
pub use cellular::{
    imsi_catcher_score, severity_from_score, CellStatus, CellularAnalysis, CellularAnomaly,
    CellularAnomalyEngine, CellularAnomalyType,
};
pub use config::DetectionConfig;
pub use detection::{
    Detection, DetectionMethod, DetectorId, DetectorObserver, DetectorStatus, DeviceType,
    NullObserver, ProtocolType,
};
pub use dsp::{goertzel_magnitude, magnitude_to_db, NoiseFloorEstimator, FFT_SIZE};
pub use history::{
    CellHistory, DowngradeChainTracker, StationaryCellChangeEvent, StationaryChangeTracker,
    StationaryPatternResult,
};
pub use movement::{haversine_distance_m, MovementAnalysis, MovementType};
pub use persistence::{
    CellularEventEntity, InMemoryPersistenceSink, NoopPersistenceSink, PersistenceError,
    PersistenceFacade, PersistenceSink, SeenCellTowerEntity, TrustedCellEntity,
};
pub use secure_buffer::{SecureAudioBuffer, SecureBufferError};
pub use signatures::{BeaconPurpose, ExpectedModulation, UltrasonicSignature};
pub use telephony::{
    CellSnapshot, DisplayOverride, EncryptionStrength, NetworkGeneration, RadioCell,
    RadioCellIdentity,
};
pub use timeline::{
    AnomalyRateLimiter, EventTimeline, ThreatLevel, TimelineEvent, TimelineEventType,
};
pub use trust::{CellTrustModel, TrustedCellInfo};
pub use ultrasonic::{
    false_positive_assessment, tracking_likelihood_score, AudioCaptureError, AudioSource,
    BeaconAnalysis, BeaconCategory, UltrasonicAnomaly, UltrasonicAnomalyType, UltrasonicEngine,
    UltrasonicStatus,
};

use std::sync::Arc;

/// Current wall-clock time as epoch milliseconds.
pub fn epoch_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Install a default `tracing` subscriber honoring `RUST_LOG`. Call once from
/// the embedding application; safe to call again (later calls are no-ops).
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

/// Both detection engines wired to one shared timeline, persistence facade,
/// and supervision observer. Thin facade; each engine stays independently
/// usable.
pub struct DetectionSuite {
    timeline: Arc<EventTimeline>,
    persistence: PersistenceFacade,
    cellular: Arc<CellularAnomalyEngine>,
    ultrasonic: Arc<UltrasonicEngine>,
}

impl DetectionSuite {
    pub fn new(sink: Arc<dyn PersistenceSink>) -> Self {
        Self::with_observer(sink, Arc::new(NullObserver))
    }

    pub fn with_observer(
        sink: Arc<dyn PersistenceSink>,
        observer: Arc<dyn DetectorObserver>,
    ) -> Self {
        let timeline = Arc::new(EventTimeline::new(cellular::CELLULAR_TIMELINE_CAP));
        let persistence = PersistenceFacade::new(sink);
        let cellular = Arc::new(CellularAnomalyEngine::with_observer(
            Arc::clone(&timeline),
            persistence.clone(),
            Arc::clone(&observer),
        ));
        let ultrasonic = Arc::new(UltrasonicEngine::with_observer(
            Arc::clone(&timeline),
            persistence.clone(),
            observer,
        ));
        Self {
            timeline,
            persistence,
            cellular,
            ultrasonic,
        }
    }

    pub fn cellular(&self) -> &Arc<CellularAnomalyEngine> {
        &self.cellular
    }

    pub fn ultrasonic(&self) -> &Arc<UltrasonicEngine> {
        &self.ultrasonic
    }

    /// Merged newest-first event stream across both engines. Arrival order;
    /// never reordered.
    pub fn timeline(&self) -> Vec<TimelineEvent> {
        self.timeline.snapshot()
    }

    /// Push the configuration into both engines. Idempotent; values apply on
    /// the next cycle.
    pub async fn apply_config(&self, config: &DetectionConfig) {
        self.cellular
            .set_min_anomaly_interval_ms(config.min_anomaly_interval_ms());
        self.ultrasonic
            .set_min_anomaly_interval_ms(config.min_anomaly_interval_ms());
        self.ultrasonic
            .set_scan_interval_seconds(config.ultrasonic_scan_interval_seconds());
        self.ultrasonic
            .set_scan_duration_seconds(config.ultrasonic_scan_duration_seconds());
        self.set_ephemeral_mode(config.ephemeral_mode).await;
    }

    pub async fn start_cellular(&self) {
        self.cellular.start_monitoring().await;
    }

    pub async fn start_ultrasonic<S: AudioSource + 'static>(&self, source: S) {
        self.ultrasonic.start_monitoring(source).await;
    }

    /// Stop both engines. Idempotent.
    pub async fn stop_all(&self) {
        self.cellular.stop_monitoring().await;
        self.ultrasonic.stop_monitoring().await;
    }

    /// Stop both engines and let in-flight persistence complete. Idempotent.
    pub async fn destroy(&self) {
        self.cellular.destroy().await;
        self.ultrasonic.destroy().await;
    }

    /// Forward a telephony callback to the cellular engine.
    pub async fn on_cell_info(&self, cells: &[RadioCell]) {
        self.cellular.on_cell_info(cells, epoch_millis()).await;
    }

    pub async fn on_display_override(&self, display_override: DisplayOverride) {
        self.cellular.set_display_override(display_override).await;
    }

    /// Feed a location fix to both engines.
    pub async fn update_location(&self, latitude: f64, longitude: f64) {
        let now = epoch_millis();
        self.cellular.update_location(latitude, longitude, now).await;
        self.ultrasonic.update_location(latitude, longitude, now).await;
    }

    /// Toggle ephemeral mode. Enabling purges the store; disabling while
    /// monitoring re-persists the in-memory tables.
    pub async fn set_ephemeral_mode(&self, enabled: bool) {
        self.cellular.set_ephemeral_mode(enabled).await;
    }

    pub fn is_ephemeral(&self) -> bool {
        self.persistence.is_ephemeral()
    }

    /// Purge all engine tables, the shared timeline, and the store.
    /// Idempotent.
    pub async fn clear_sensitive_data(&self) {
        self.cellular.clear_sensitive_data().await;
        self.ultrasonic.clear_sensitive_data().await;
    }
}
