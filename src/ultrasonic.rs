//! # Ultrasonic Engine Module
//!
//! Scan loop and per-frequency beacon state machine for inaudible tracking
//! tones in the 17.5-22 kHz band. Each acquisition window lives in an
//! encrypted buffer and is only decrypted inside a scoped closure; qualifying
//! Goertzel bins are bucketed at 100 Hz, beacons confirm after five scans,
//! and a false-positive layer separates deliberate beacons from CRTs, power
//! supplies, pest deterrents, and EV pedestrian-warning tones.

use crate::beacon::{
    classify_amplitude_profile, mean, stdev, stdev_f32, AmplitudeProfile, BeaconDetection,
    EnvironmentalContext, LocationSample, STEADY_STDEV_DB,
};
use crate::config::{SCAN_DURATION_RANGE, SCAN_INTERVAL_RANGE};
use crate::detection::{
    detection_id, Detection, DetectionMethod, DetectorId, DetectorObserver, DetectorStatus,
    DeviceType, NullObserver, ProtocolType,
};
use crate::dsp::{goertzel_magnitude, magnitude_to_db, NoiseFloorEstimator, FFT_SIZE};
use crate::movement::haversine_distance_m;
use crate::persistence::{CellularEventEntity, PersistenceFacade, PERSISTED_EVENT_KEEP};
use crate::secure_buffer::{wipe_staging, SecureAudioBuffer};
use crate::signatures::{find_ultrasonic, BeaconPurpose, ExpectedModulation};
use crate::timeline::{
    AnomalyRateLimiter, EventTimeline, ThreatLevel, TimelineEvent, TimelineEventType,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, info, warn};

/// Scanned band, Hz. The upper edge is clipped to Nyquist at runtime.
const SCAN_BAND_LOW_HZ: f64 = 17_500.0;
const SCAN_BAND_HIGH_HZ: f64 = 22_000.0;
const SCAN_BIN_STEP_HZ: f64 = 100.0;

/// A bin qualifies when it rises this far above the noise floor.
const SNR_GATE_DB: f64 = 30.0;

/// Qualifying amplitudes a bucket needs within one scan.
const MIN_QUALIFYING_PER_SCAN: usize = 3;

/// Scans a beacon must appear in before the alert gate runs.
pub const MIN_DETECTIONS_TO_CONFIRM: u32 = 5;

/// Beacons silent this long are expired.
const BEACON_EXPIRY_MS: i64 = 120_000;

/// Pause between device reads inside one acquisition.
const READ_DELAY_MS: u64 = 50;

/// Greedy clustering radius for distinct-location counting, meters.
const LOCATION_CLUSTER_RADIUS_M: f64 = 100.0;

/// Frequency history stdev at or below this reads as stable, Hz.
const FREQ_STABLE_STDEV_HZ: f64 = 10.0;

/// Minimum beacon lifetime before the alert gate passes.
const MIN_CONFIRM_DURATION_MS: i64 = 5_000;

/// Timeline capacity for the ultrasonic engine.
pub const ULTRASONIC_TIMELINE_CAP: usize = 100;

/// Band bounds, Hz: TV-ad beacons, retail presence, smart-TV ACR.
const TV_AD_BAND: (f32, f32) = (17_400.0, 18_600.0);
const RETAIL_BAND: (f32, f32) = (19_900.0, 20_300.0);
const ACR_BAND: (f32, f32) = (20_100.0, 21_600.0);

#[derive(Debug, thiserror::Error)]
pub enum AudioCaptureError {
    #[error("Microphone permission missing")]
    PermissionDenied,
    #[error("Audio device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("Audio read failed: {0}")]
    ReadFailed(String),
}

/// Capture device boundary. Implementations should size their internal
/// buffer at least max(platform minimum, 4 x FFT_SIZE) samples and block on
/// `read` until the slice is filled.
pub trait AudioSource: Send {
    fn sample_rate(&self) -> u32;
    fn read(&mut self, buf: &mut [i16]) -> Result<usize, AudioCaptureError>;
}

/// Classification a confirmed beacon is published under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UltrasonicAnomalyType {
    AdvertisingBeacon,
    TrackingBeacon,
    RetailBeacon,
    AnalyticsBeacon,
    UnknownBeacon,
}

impl UltrasonicAnomalyType {
    pub fn key(&self) -> &'static str {
        match self {
            UltrasonicAnomalyType::AdvertisingBeacon => "ADVERTISING_BEACON",
            UltrasonicAnomalyType::TrackingBeacon => "TRACKING_BEACON",
            UltrasonicAnomalyType::RetailBeacon => "RETAIL_BEACON",
            UltrasonicAnomalyType::AnalyticsBeacon => "ANALYTICS_BEACON",
            UltrasonicAnomalyType::UnknownBeacon => "UNKNOWN_BEACON",
        }
    }
}

/// Functional category, from the matched purpose or the frequency band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BeaconCategory {
    Advertising,
    Tracking,
    Retail,
    Analytics,
    Unknown,
}

impl BeaconCategory {
    fn anomaly_type(&self) -> UltrasonicAnomalyType {
        match self {
            BeaconCategory::Advertising => UltrasonicAnomalyType::AdvertisingBeacon,
            BeaconCategory::Tracking => UltrasonicAnomalyType::TrackingBeacon,
            BeaconCategory::Retail => UltrasonicAnomalyType::RetailBeacon,
            BeaconCategory::Analytics => UltrasonicAnomalyType::AnalyticsBeacon,
            BeaconCategory::Unknown => UltrasonicAnomalyType::UnknownBeacon,
        }
    }
}

/// Outcome of the signature-catalog lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceAttribution {
    /// Vendor name, or "Unknown" when nothing matched.
    pub vendor: String,
    pub purpose: BeaconPurpose,
    pub expected_modulation: Option<ExpectedModulation>,
    pub confidence: u8,
    pub matched: bool,
    pub confirmation_text: Option<String>,
    pub mitigation_text: Option<String>,
}

/// Everything the scoring functions need about one confirmed-or-candidate
/// beacon. Built from the lifecycle record plus engine context; scoring never
/// touches engine state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeaconAnalysis {
    pub bucket_hz: u32,
    pub frequency_hz: f32,
    pub timestamp_ms: i64,
    pub duration_ms: i64,
    pub detection_count: u32,
    pub amplitude_profile: AmplitudeProfile,
    pub amplitude_mean_db: f64,
    pub amplitude_stdev_db: f64,
    /// Coefficient of variation: stdev / |mean| across the amplitude history.
    pub amplitude_cv: f64,
    pub frequency_stdev_hz: f64,
    pub frequency_stable: bool,
    pub snr_db: f64,
    pub source: SourceAttribution,
    pub category: BeaconCategory,
    pub following_user: bool,
    pub distinct_locations: usize,
    pub avg_dwell_per_location_ms: i64,
    pub seen_at_home: bool,
    pub seen_elsewhere: bool,
    pub persistence_score: f64,
    pub environmental_context: EnvironmentalContext,
    pub concurrent_beacons: usize,
}

impl BeaconAnalysis {
    /// Amplitude profile consistent with the vendor's documented modulation.
    pub fn modulation_matches(&self) -> bool {
        match (self.amplitude_profile, self.source.expected_modulation) {
            (AmplitudeProfile::Pulsing, Some(ExpectedModulation::Fsk)) => true,
            (AmplitudeProfile::Modulated, Some(ExpectedModulation::Psk)) => true,
            (AmplitudeProfile::Modulated, Some(ExpectedModulation::Chirp)) => true,
            (AmplitudeProfile::Steady, Some(ExpectedModulation::Steady)) => true,
            _ => false,
        }
    }
}

/// Signature-catalog attribution for a frequency, given the observed
/// stability and envelope.
pub fn attribute_source(
    frequency_hz: f32,
    frequency_stable: bool,
    profile: AmplitudeProfile,
) -> SourceAttribution {
    if let Some(sig) = find_ultrasonic(frequency_hz, 100.0) {
        let mut confidence = sig.purpose.base_confidence() as u32;
        if frequency_stable {
            confidence += 10;
        }
        let matches_modulation = matches!(
            (profile, sig.expected_modulation),
            (AmplitudeProfile::Pulsing, ExpectedModulation::Fsk)
                | (AmplitudeProfile::Modulated, ExpectedModulation::Psk)
                | (AmplitudeProfile::Modulated, ExpectedModulation::Chirp)
                | (AmplitudeProfile::Steady, ExpectedModulation::Steady)
        );
        if matches_modulation {
            confidence += 10;
        }
        return SourceAttribution {
            vendor: sig.vendor.to_string(),
            purpose: sig.purpose,
            expected_modulation: Some(sig.expected_modulation),
            confidence: confidence.min(100) as u8,
            matched: true,
            confirmation_text: Some(sig.confirmation_text.to_string()),
            mitigation_text: Some(sig.mitigation_text.to_string()),
        };
    }

    let mut confidence: u32 = 25;
    if frequency_stable {
        confidence += 15;
    }
    if matches!(profile, AmplitudeProfile::Pulsing | AmplitudeProfile::Modulated) {
        confidence += 10;
    }
    SourceAttribution {
        vendor: "Unknown".to_string(),
        purpose: BeaconPurpose::Unknown,
        expected_modulation: None,
        confidence: confidence.min(100) as u8,
        matched: false,
        confirmation_text: None,
        mitigation_text: None,
    }
}

fn in_band(frequency_hz: f32, band: (f32, f32)) -> bool {
    frequency_hz >= band.0 && frequency_hz <= band.1
}

/// Category from the matched purpose, falling back to the frequency band.
pub fn categorize(purpose: BeaconPurpose, matched: bool, frequency_hz: f32) -> BeaconCategory {
    if matched {
        match purpose {
            BeaconPurpose::AdTracking | BeaconPurpose::TvAttribution => {
                return BeaconCategory::Advertising
            }
            BeaconPurpose::CrossDeviceLinking => return BeaconCategory::Tracking,
            BeaconPurpose::RetailAnalytics => return BeaconCategory::Retail,
            BeaconPurpose::TvViewershipAcr => return BeaconCategory::Analytics,
            _ => {}
        }
    }
    if in_band(frequency_hz, TV_AD_BAND) {
        BeaconCategory::Advertising
    } else if in_band(frequency_hz, RETAIL_BAND) {
        BeaconCategory::Retail
    } else if in_band(frequency_hz, ACR_BAND) {
        BeaconCategory::Analytics
    } else {
        BeaconCategory::Unknown
    }
}

/// Location-history summary used by the following heuristics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocationSpread {
    pub distinct_locations: usize,
    pub avg_dwell_per_location_ms: i64,
}

/// Greedy 100 m clustering over the location history.
pub fn location_spread(history: &[LocationSample]) -> LocationSpread {
    let mut clusters: Vec<Vec<&LocationSample>> = Vec::new();
    for sample in history {
        let existing = clusters.iter_mut().find(|cluster| {
            let anchor = cluster[0];
            haversine_distance_m(
                anchor.latitude,
                anchor.longitude,
                sample.latitude,
                sample.longitude,
            ) <= LOCATION_CLUSTER_RADIUS_M
        });
        match existing {
            Some(cluster) => cluster.push(sample),
            None => clusters.push(vec![sample]),
        }
    }

    let avg_dwell = if clusters.is_empty() {
        0
    } else {
        let total: i64 = clusters
            .iter()
            .map(|cluster| {
                let min = cluster.iter().map(|s| s.timestamp_ms).min().unwrap_or(0);
                let max = cluster.iter().map(|s| s.timestamp_ms).max().unwrap_or(0);
                max - min
            })
            .sum();
        total / clusters.len() as i64
    };

    LocationSpread {
        distinct_locations: clusters.len(),
        avg_dwell_per_location_ms: avg_dwell,
    }
}

/// Strict cross-location "following" test. Requires three distinct locations
/// and a band-specific consistency profile, so a street of TVs playing the
/// same ad does not read as a tracker.
pub fn is_following_user(
    frequency_hz: f32,
    spread: LocationSpread,
    amplitude_cv: f64,
    frequency_stable: bool,
) -> bool {
    if spread.distinct_locations < 3 {
        return false;
    }
    if in_band(frequency_hz, TV_AD_BAND) {
        amplitude_cv < 0.15
            && frequency_stable
            && spread.avg_dwell_per_location_ms >= 30_000
    } else if in_band(frequency_hz, RETAIL_BAND) {
        amplitude_cv < 0.25
    } else if in_band(frequency_hz, ACR_BAND) {
        amplitude_cv < 0.12 && spread.avg_dwell_per_location_ms >= 60_000
    } else {
        amplitude_cv < 0.30 || spread.avg_dwell_per_location_ms >= 20_000
    }
}

fn persistence_score(duration_ms: i64) -> f64 {
    match duration_ms {
        d if d > 5 * 60_000 => 1.0,
        d if d > 2 * 60_000 => 0.7,
        d if d > 60_000 => 0.5,
        d if d > 30_000 => 0.3,
        _ => 0.1,
    }
}

/// Tracking likelihood 0..=100. Pure function over the analysis record.
pub fn tracking_likelihood_score(analysis: &BeaconAnalysis) -> u8 {
    let mut score = 0.4 * analysis.source.confidence as f64;

    if analysis.following_user {
        score += 25.0;
    }
    if analysis.seen_at_home && analysis.seen_elsewhere {
        score += 30.0;
    }
    if analysis.persistence_score > 0.5 {
        score += 15.0;
    }
    if analysis.duration_ms >= 5_000 {
        score += 10.0;
    }
    match analysis.amplitude_profile {
        AmplitudeProfile::Pulsing => score += 10.0,
        AmplitudeProfile::Modulated => score += 8.0,
        _ => {}
    }
    if analysis.snr_db > 20.0 {
        score += 10.0;
    }
    if analysis.frequency_stable {
        score += 12.0;
    }
    if analysis.modulation_matches() {
        score += 15.0;
    }
    match analysis.category {
        BeaconCategory::Tracking => score += 10.0,
        BeaconCategory::Advertising => score += 5.0,
        _ => {}
    }

    score *= analysis.environmental_context.base_multiplier();
    if analysis.environmental_context == EnvironmentalContext::Home && !analysis.following_user {
        score *= 0.5;
    }

    score.clamp(0.0, 100.0) as u8
}

/// Frequency ranges of known innocuous ultrasound emitters.
static KNOWN_FP_RANGES: &[(f32, f32, &str)] = &[
    (15_700.0, 15_800.0, "CRT scanline whine"),
    (20_000.0, 25_000.0, "LCD panel inverter"),
    (20_000.0, 100_000.0, "switching power supply"),
    (20_000.0, 25_000.0, "ultrasonic HVAC humidifier"),
    (18_000.0, 25_000.0, "ultrasonic pest deterrent"),
    (17_000.0, 20_000.0, "hard drive resonance"),
    (20_000.0, 40_000.0, "fluorescent ballast"),
    (17_000.0, 20_000.0, "EV pedestrian warning (AVAS)"),
    (17_500.0, 22_000.0, "natural/environmental ultrasound"),
];

/// False-positive likelihood 0..=100 plus the indicator strings that fired.
pub fn false_positive_assessment(analysis: &BeaconAnalysis) -> (u8, Vec<String>) {
    let mut score: i32 = 0;
    let mut indicators = Vec::new();
    let variance = analysis.amplitude_stdev_db * analysis.amplitude_stdev_db;

    if analysis.concurrent_beacons > 4 {
        score += 35;
        indicators.push(format!(
            "{} concurrent detections suggest broadband interference",
            analysis.concurrent_beacons
        ));
    } else if analysis.concurrent_beacons >= 3 {
        score += 15;
        indicators.push(format!(
            "{} concurrent detections in the band",
            analysis.concurrent_beacons
        ));
    }
    if analysis.detection_count <= 5 {
        score += 20;
    }
    if analysis.duration_ms < 5_000 && analysis.detection_count <= 3 {
        score += 20;
    }
    if variance > 50.0 {
        score += 25;
    }
    if variance > STEADY_STDEV_DB * STEADY_STDEV_DB {
        score += 10;
    }
    if !analysis.source.matched && analysis.snr_db < 25.0 {
        score += 15;
    }
    if !analysis.frequency_stable {
        score += 20;
    }
    if analysis.duration_ms > 2 * 60_000 && analysis.distinct_locations <= 1 {
        score += 10;
    }
    if analysis.amplitude_profile == AmplitudeProfile::Erratic {
        score += 25;
        indicators.push("Erratic amplitude envelope".to_string());
    }
    if analysis.amplitude_profile == AmplitudeProfile::Steady && !analysis.source.matched {
        score += 15;
    }
    if !analysis.source.matched {
        if let Some((_, _, label)) = KNOWN_FP_RANGES
            .iter()
            .find(|(lo, hi, _)| analysis.frequency_hz >= *lo && analysis.frequency_hz <= *hi)
        {
            score += 15;
            indicators.push(format!("Frequency overlaps {label} range"));
        }
    }
    if in_band(analysis.frequency_hz, TV_AD_BAND)
        && analysis.distinct_locations >= 2
        && !analysis.following_user
        && analysis.amplitude_cv >= 0.2
    {
        score += 30;
        indicators.push(format!(
            "TV ad beacon frequency detected at {} locations with inconsistent signal",
            analysis.distinct_locations
        ));
    }
    if in_band(analysis.frequency_hz, ACR_BAND)
        && !analysis.following_user
        && analysis.amplitude_cv > 0.2
    {
        score += 25;
        indicators.push("Smart-TV ACR band with inconsistent signal across sightings".to_string());
    }
    let outdoor_likely = analysis.environmental_context == EnvironmentalContext::OutdoorRandom;
    if analysis.frequency_hz >= 17_000.0
        && analysis.frequency_hz <= 20_000.0
        && analysis.duration_ms < 15_000
        && analysis.detection_count <= 5
        && outdoor_likely
        && !analysis.following_user
    {
        score += 35;
        indicators.push("Matches EV pedestrian warning pattern".to_string());
    }

    if analysis.following_user {
        score -= 30;
    }
    if analysis.seen_at_home && analysis.seen_elsewhere {
        score -= 40;
    }
    if analysis.persistence_score > 0.7 {
        score -= 20;
    }
    if analysis.source.matched && analysis.source.confidence > 70 {
        score -= 35;
    }
    if matches!(
        analysis.amplitude_profile,
        AmplitudeProfile::Pulsing | AmplitudeProfile::Modulated
    ) {
        score -= 15;
    }
    if analysis.frequency_stable {
        score -= 20;
    }
    if analysis.modulation_matches() {
        score -= 25;
    }

    (score.clamp(0, 100) as u8, indicators)
}

/// One emitted ultrasonic anomaly with its full analysis payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UltrasonicAnomaly {
    pub id: String,
    pub timestamp_ms: i64,
    pub anomaly_type: UltrasonicAnomalyType,
    pub threat_level: ThreatLevel,
    pub confidence: ThreatLevel,
    pub tracking_likelihood: u8,
    pub false_positive_likelihood: u8,
    pub analysis: BeaconAnalysis,
    pub contributing_factors: Vec<String>,
    pub description: String,
    pub frequency_hz: f32,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl UltrasonicAnomaly {
    pub fn to_detection(&self) -> Detection {
        Detection {
            id: self.id.clone(),
            timestamp_ms: self.timestamp_ms,
            protocol: ProtocolType::Audio,
            method: DetectionMethod::UltrasonicBeacon,
            device_type: DeviceType::UltrasonicBeacon,
            signal_dbm: self.analysis.amplitude_mean_db as i32,
            threat_level: self.threat_level,
            threat_score: self.tracking_likelihood,
            factors_json: serde_json::to_string(&self.contributing_factors)
                .unwrap_or_else(|_| "[]".to_string()),
            latitude: self.latitude,
            longitude: self.longitude,
        }
    }
}

fn severity_from_tracking(score: u8) -> ThreatLevel {
    match score {
        s if s >= 90 => ThreatLevel::Critical,
        s if s >= 70 => ThreatLevel::High,
        s if s >= 50 => ThreatLevel::Medium,
        _ => ThreatLevel::Low,
    }
}

fn describe_beacon(analysis: &BeaconAnalysis) -> String {
    let source_line = if analysis.source.matched {
        format!(
            "Probable source: {} beacon ({:?}).",
            analysis.source.vendor, analysis.source.purpose
        )
    } else {
        format!(
            "Probable source: unidentified ultrasonic emitter near {:.0} Hz.",
            analysis.frequency_hz
        )
    };
    let behavior_line = match analysis.category {
        BeaconCategory::Advertising => {
            "What it does: links your device to nearby ad or TV content for attribution."
        }
        BeaconCategory::Tracking => {
            "What it does: links this device to other devices and locations across sightings."
        }
        BeaconCategory::Retail => {
            "What it does: confirms store presence for retail analytics or rewards."
        }
        BeaconCategory::Analytics => {
            "What it does: fingerprints nearby TV content for viewership measurement."
        }
        BeaconCategory::Unknown => {
            "What it does: emits a persistent inaudible tone; purpose not identified."
        }
    };
    let action_line = analysis
        .source
        .mitigation_text
        .as_deref()
        .unwrap_or("audit apps with microphone access; move away and watch whether the tone follows");
    let confirm_line = analysis
        .source
        .confirmation_text
        .as_deref()
        .unwrap_or("the tone persists across scans at the same frequency while the source device is active");

    format!(
        "{source_line}\n{behavior_line}\nRecommended action: {action_line}\nHow to confirm: {confirm_line}"
    )
}

/// Latest-engine summary published on the status stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UltrasonicStatus {
    pub status: DetectorStatus,
    pub noise_floor_db: f64,
    pub active_beacons: usize,
    pub last_scan_ms: i64,
}

impl UltrasonicStatus {
    fn idle() -> Self {
        Self {
            status: DetectorStatus::Idle,
            noise_floor_db: -60.0,
            active_beacons: 0,
            last_scan_ms: 0,
        }
    }
}

struct LocationFix {
    latitude: f64,
    longitude: f64,
    #[allow(dead_code)]
    timestamp_ms: i64,
}

/// The ultrasonic beacon engine. Owns the beacon table behind its own lock.
pub struct UltrasonicEngine {
    beacons: Arc<Mutex<HashMap<u32, BeaconDetection>>>,
    noise_floor: Arc<Mutex<NoiseFloorEstimator>>,
    timeline: Arc<EventTimeline>,
    persistence: PersistenceFacade,
    rate_limiter: AnomalyRateLimiter,
    observer: Arc<dyn DetectorObserver>,
    is_monitoring: Arc<AtomicBool>,
    scan_interval_secs: Arc<AtomicU32>,
    scan_duration_secs: Arc<AtomicU32>,
    consecutive_failures: AtomicU32,
    environment: Mutex<EnvironmentalContext>,
    home_location: Mutex<Option<(f64, f64)>>,
    location: Mutex<Option<LocationFix>>,
    scan_task: Mutex<Option<JoinHandle<()>>>,
    anomaly_tx: watch::Sender<Option<UltrasonicAnomaly>>,
    status_tx: watch::Sender<UltrasonicStatus>,
    event_tx: watch::Sender<Option<TimelineEvent>>,
    beacons_tx: watch::Sender<Vec<BeaconDetection>>,
    detection_tx: watch::Sender<Option<Detection>>,
}

impl UltrasonicEngine {
    pub fn new(timeline: Arc<EventTimeline>, persistence: PersistenceFacade) -> Self {
        Self::with_observer(timeline, persistence, Arc::new(NullObserver))
    }

    pub fn with_observer(
        timeline: Arc<EventTimeline>,
        persistence: PersistenceFacade,
        observer: Arc<dyn DetectorObserver>,
    ) -> Self {
        Self {
            beacons: Arc::new(Mutex::new(HashMap::new())),
            noise_floor: Arc::new(Mutex::new(NoiseFloorEstimator::new())),
            timeline,
            persistence,
            rate_limiter: AnomalyRateLimiter::new(60_000),
            observer,
            is_monitoring: Arc::new(AtomicBool::new(false)),
            scan_interval_secs: Arc::new(AtomicU32::new(20)),
            scan_duration_secs: Arc::new(AtomicU32::new(5)),
            consecutive_failures: AtomicU32::new(0),
            environment: Mutex::new(EnvironmentalContext::Unknown),
            home_location: Mutex::new(None),
            location: Mutex::new(None),
            scan_task: Mutex::new(None),
            anomaly_tx: watch::channel(None).0,
            status_tx: watch::channel(UltrasonicStatus::idle()).0,
            event_tx: watch::channel(None).0,
            beacons_tx: watch::channel(Vec::new()).0,
            detection_tx: watch::channel(None).0,
        }
    }

    /// Clamped to 15..=120 s; picked up on the next cycle.
    pub fn set_scan_interval_seconds(&self, seconds: u32) {
        self.scan_interval_secs.store(
            seconds.clamp(SCAN_INTERVAL_RANGE.0, SCAN_INTERVAL_RANGE.1),
            Ordering::Relaxed,
        );
    }

    /// Clamped to 3..=15 s; picked up on the next cycle.
    pub fn set_scan_duration_seconds(&self, seconds: u32) {
        self.scan_duration_secs.store(
            seconds.clamp(SCAN_DURATION_RANGE.0, SCAN_DURATION_RANGE.1),
            Ordering::Relaxed,
        );
    }

    pub fn set_min_anomaly_interval_ms(&self, interval_ms: i64) {
        self.rate_limiter.set_min_interval_ms(interval_ms);
    }

    /// Environmental context and optional home location for the scoring
    /// layer. The engine never derives "home" itself.
    pub async fn set_environment(
        &self,
        context: EnvironmentalContext,
        home_location: Option<(f64, f64)>,
    ) {
        *self.environment.lock().await = context;
        *self.home_location.lock().await = home_location;
    }

    pub async fn update_location(&self, latitude: f64, longitude: f64, timestamp_ms: i64) {
        if !latitude.is_finite() || !longitude.is_finite() {
            return;
        }
        *self.location.lock().await = Some(LocationFix {
            latitude,
            longitude,
            timestamp_ms,
        });
    }

    pub fn is_monitoring(&self) -> bool {
        self.is_monitoring.load(Ordering::SeqCst)
    }

    pub fn anomalies(&self) -> watch::Receiver<Option<UltrasonicAnomaly>> {
        self.anomaly_tx.subscribe()
    }

    pub fn status(&self) -> watch::Receiver<UltrasonicStatus> {
        self.status_tx.subscribe()
    }

    pub fn events(&self) -> watch::Receiver<Option<TimelineEvent>> {
        self.event_tx.subscribe()
    }

    /// Beacons with enough sightings to show in a UI (>= 5 detections).
    pub fn active_beacons(&self) -> watch::Receiver<Vec<BeaconDetection>> {
        self.beacons_tx.subscribe()
    }

    pub fn detections(&self) -> watch::Receiver<Option<Detection>> {
        self.detection_tx.subscribe()
    }

    /// Spawn the scan loop over `source`. Idempotent while already running.
    pub async fn start_monitoring<S: AudioSource + 'static>(self: &Arc<Self>, source: S) {
        if self.is_monitoring.swap(true, Ordering::SeqCst) {
            return;
        }
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.status_tx
            .send_modify(|s| s.status = DetectorStatus::Monitoring);
        self.observer.on_detector_started(DetectorId::Ultrasonic);
        info!("ultrasonic monitoring started");

        let engine = Arc::clone(self);
        let handle = tokio::spawn(async move {
            engine.scan_loop(source).await;
        });
        *self.scan_task.lock().await = Some(handle);
    }

    /// Stop the scan loop and release the capture device. Idempotent.
    pub async fn stop_monitoring(&self) {
        let was_monitoring = self.is_monitoring.swap(false, Ordering::SeqCst);
        if let Some(handle) = self.scan_task.lock().await.take() {
            handle.abort();
        }
        if was_monitoring {
            self.status_tx
                .send_modify(|s| s.status = DetectorStatus::Idle);
            self.observer.on_detector_stopped(DetectorId::Ultrasonic);
            info!("ultrasonic monitoring stopped");
        }
    }

    /// Stop and let in-flight persistence writes complete. Idempotent.
    pub async fn destroy(&self) {
        self.stop_monitoring().await;
    }

    /// Purge every table this engine owns. Idempotent.
    pub async fn clear_sensitive_data(&self) {
        self.beacons.lock().await.clear();
        self.noise_floor.lock().await.reset();
        self.rate_limiter.clear();
        self.timeline.clear();
        let _ = self.beacons_tx.send(Vec::new());
        self.persistence.purge_all().await;
    }

    async fn scan_loop<S: AudioSource>(&self, mut source: S) {
        loop {
            if !self.is_monitoring() {
                break;
            }
            let now_ms = chrono::Utc::now().timestamp_millis();
            self.status_tx
                .send_modify(|s| s.status = DetectorStatus::Scanning);

            let duration_ms = self.scan_duration_secs.load(Ordering::Relaxed) as u64 * 1_000;
            match self.acquire(&mut source, duration_ms).await {
                Ok(hits) => {
                    self.consecutive_failures.store(0, Ordering::Relaxed);
                    self.record_scan_result(&hits, now_ms).await;
                    self.observer.on_scan_success(DetectorId::Ultrasonic);
                }
                Err(AudioCaptureError::PermissionDenied) => {
                    self.status_tx
                        .send_modify(|s| s.status = DetectorStatus::PermissionDenied);
                    self.observer.on_error(
                        DetectorId::Ultrasonic,
                        "microphone permission missing",
                        false,
                    );
                    warn!("ultrasonic scans suppressed: permission missing");
                    break;
                }
                Err(e) => {
                    let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                    let recoverable = failures < 3;
                    self.observer
                        .on_error(DetectorId::Ultrasonic, &e.to_string(), recoverable);
                    if !recoverable {
                        self.status_tx
                            .send_modify(|s| s.status = DetectorStatus::Failed);
                        warn!(failures, "ultrasonic capture marked non-recoverable");
                        break;
                    }
                    debug!(error = %e, failures, "transient ultrasonic scan error");
                }
            }

            self.expire_stale(chrono::Utc::now().timestamp_millis()).await;
            self.status_tx.send_modify(|s| {
                s.status = DetectorStatus::Monitoring;
                s.last_scan_ms = now_ms;
            });

            let interval = self.scan_interval_secs.load(Ordering::Relaxed) as u64;
            tokio::time::sleep(Duration::from_secs(interval)).await;
        }
        self.is_monitoring.store(false, Ordering::SeqCst);
    }

    /// One acquisition: repeated encrypted-window reads for `duration_ms`,
    /// returning every qualifying (frequency, amplitude) hit.
    async fn acquire<S: AudioSource>(
        &self,
        source: &mut S,
        duration_ms: u64,
    ) -> Result<Vec<(f32, f64)>, AudioCaptureError> {
        let sample_rate = source.sample_rate();
        let started = tokio::time::Instant::now();
        let mut hits = Vec::new();
        let mut staging = vec![0i16; FFT_SIZE];

        while started.elapsed() < Duration::from_millis(duration_ms) {
            let read = source.read(&mut staging);
            let n = match read {
                Ok(n) => n,
                Err(e) => {
                    wipe_staging(&mut staging);
                    return Err(e);
                }
            };
            if n == 0 {
                break;
            }

            let buffer = SecureAudioBuffer::from_pcm(&staging[..n]).map_err(|e| {
                wipe_staging(&mut staging);
                AudioCaptureError::ReadFailed(e.to_string())
            })?;
            wipe_staging(&mut staging);

            let floor_db = self.noise_floor.lock().await.noise_floor_db();
            let window_result = buffer.with_pcm(|pcm| {
                let window_hits = analyze_window(pcm, sample_rate, floor_db);
                let reference_avg = crate::dsp::reference_band_mean_db(pcm, sample_rate);
                (window_hits, reference_avg)
            });
            match window_result {
                Ok((window_hits, reference_avg)) => {
                    hits.extend(window_hits);
                    if let Some(avg_low) = reference_avg {
                        self.noise_floor.lock().await.fold(avg_low);
                    }
                }
                Err(e) => {
                    debug!(error = %e, "secure window access failed; window skipped");
                }
            }

            tokio::time::sleep(Duration::from_millis(READ_DELAY_MS)).await;
        }

        wipe_staging(&mut staging);
        Ok(hits)
    }

    /// Aggregate one scan's qualifying hits: buckets with at least three
    /// hits update or create their beacon; a beacon reaching exactly five
    /// detections goes through the alert gate.
    pub async fn record_scan_result(&self, hits: &[(f32, f64)], timestamp_ms: i64) {
        let mut by_bucket: HashMap<u32, Vec<(f32, f64)>> = HashMap::new();
        for &(freq, amp) in hits {
            let bucket = ((freq / 100.0).round() as u32) * 100;
            by_bucket.entry(bucket).or_default().push((freq, amp));
        }

        let location = {
            let fix = self.location.lock().await;
            fix.as_ref().map(|f| (f.latitude, f.longitude))
        };
        let context = *self.environment.lock().await;

        let mut confirmed: Vec<u32> = Vec::new();
        let mut created: Vec<u32> = Vec::new();
        {
            let mut beacons = self.beacons.lock().await;
            for (bucket, bucket_hits) in by_bucket {
                if bucket_hits.len() < MIN_QUALIFYING_PER_SCAN {
                    continue;
                }
                let amp =
                    bucket_hits.iter().map(|&(_, a)| a).sum::<f64>() / bucket_hits.len() as f64;
                let freq = bucket_hits.iter().map(|&(f, _)| f).sum::<f32>()
                    / bucket_hits.len() as f32;

                match beacons.get_mut(&bucket) {
                    Some(beacon) => {
                        beacon.update(freq, amp, timestamp_ms, location);
                        if beacon.detection_count == MIN_DETECTIONS_TO_CONFIRM {
                            confirmed.push(bucket);
                        }
                    }
                    None => {
                        beacons.insert(
                            bucket,
                            BeaconDetection::new(bucket, freq, amp, timestamp_ms, context, location),
                        );
                        created.push(bucket);
                    }
                }
            }
        }

        for bucket in created {
            let event = TimelineEvent::new(
                timestamp_ms,
                TimelineEventType::PotentialBeacon,
                format!("Potential ultrasonic beacon at {bucket} Hz"),
                "Awaiting confirmation across further scans".to_string(),
            )
            .with_frequency(bucket as f32)
            .with_threat(ThreatLevel::Info)
            .with_location(location.map(|l| l.0), location.map(|l| l.1));
            self.push_event(event).await;
        }
        for bucket in confirmed {
            self.confirm_beacon(bucket, timestamp_ms).await;
        }
        self.publish_beacons().await;
    }

    /// Full analysis for a tracked bucket, or None if it is not tracked.
    pub async fn analyze_beacon(&self, bucket_hz: u32) -> Option<BeaconAnalysis> {
        let (beacon, concurrent) = {
            let beacons = self.beacons.lock().await;
            (beacons.get(&bucket_hz).cloned()?, beacons.len())
        };
        let home = *self.home_location.lock().await;
        let noise_floor_db = self.noise_floor.lock().await.noise_floor_db();
        Some(build_analysis(&beacon, concurrent, home, noise_floor_db))
    }

    /// Alert gate for a beacon that just reached the confirmation count.
    async fn confirm_beacon(&self, bucket_hz: u32, now_ms: i64) {
        let Some(analysis) = self.analyze_beacon(bucket_hz).await else {
            return;
        };
        let tracking = tracking_likelihood_score(&analysis);
        let (false_positive, fp_indicators) = false_positive_assessment(&analysis);

        let mut gate_failures = Vec::new();
        if analysis.duration_ms < MIN_CONFIRM_DURATION_MS {
            gate_failures.push(format!(
                "duration {} ms below minimum",
                analysis.duration_ms
            ));
        }
        if tracking < 40 {
            gate_failures.push(format!("tracking likelihood {tracking} below threshold"));
        }
        if false_positive > 60 {
            gate_failures.push(format!(
                "false-positive likelihood {false_positive} too high"
            ));
        }
        if !analysis.frequency_stable && !analysis.source.matched {
            gate_failures.push("frequency unstable and no known source".to_string());
        }

        if gate_failures.is_empty() {
            self.emit_anomaly(analysis, tracking, false_positive, now_ms)
                .await;
        } else {
            let mut description = format!("Suppressed: {}", gate_failures.join("; "));
            if !fp_indicators.is_empty() {
                description.push_str(&format!(
                    ". False-positive indicators: {}",
                    fp_indicators.join("; ")
                ));
            }
            info!(
                bucket_hz,
                tracking, false_positive, "beacon confirmation suppressed"
            );
            let event = TimelineEvent::new(
                now_ms,
                TimelineEventType::FalsePositive,
                format!("Beacon at {bucket_hz} Hz did not pass the alert gate"),
                description,
            )
            .with_frequency(bucket_hz as f32)
            .with_threat(ThreatLevel::Info);
            self.push_event(event).await;
        }
    }

    /// Remove beacons silent for over two minutes, logging a lifecycle event.
    /// Beacons that never confirmed get a final false-positive assessment so
    /// the timeline explains what they most likely were.
    pub async fn expire_stale(&self, now_ms: i64) {
        let expired: Vec<BeaconDetection> = {
            let mut beacons = self.beacons.lock().await;
            let stale: Vec<u32> = beacons
                .iter()
                .filter(|(_, b)| b.is_expired(now_ms, BEACON_EXPIRY_MS))
                .map(|(&bucket, _)| bucket)
                .collect();
            stale
                .into_iter()
                .filter_map(|bucket| beacons.remove(&bucket))
                .collect()
        };

        for beacon in expired {
            let mut description = format!(
                "Last heard {} s ago after {} detections",
                (now_ms - beacon.last_detected_ms) / 1_000,
                beacon.detection_count
            );
            if beacon.detection_count < MIN_DETECTIONS_TO_CONFIRM {
                let home = *self.home_location.lock().await;
                let noise_floor_db = self.noise_floor.lock().await.noise_floor_db();
                let analysis = build_analysis(&beacon, 1, home, noise_floor_db);
                let (_, indicators) = false_positive_assessment(&analysis);
                if !indicators.is_empty() {
                    description.push_str(&format!(
                        ". Likely explanation: {}",
                        indicators.join("; ")
                    ));
                }
            }
            let event = TimelineEvent::new(
                now_ms,
                TimelineEventType::BeaconEnded,
                format!("Beacon at {} Hz ended", beacon.bucket_hz),
                description,
            )
            .with_frequency(beacon.bucket_hz as f32)
            .with_threat(ThreatLevel::Info);
            self.push_event(event).await;
        }
        self.publish_beacons().await;
    }

    async fn emit_anomaly(
        &self,
        analysis: BeaconAnalysis,
        tracking: u8,
        false_positive: u8,
        now_ms: i64,
    ) {
        let anomaly_type = analysis.category.anomaly_type();
        if !self.rate_limiter.allows(anomaly_type.key(), now_ms) {
            debug!(key = anomaly_type.key(), "ultrasonic anomaly rate-limited");
            return;
        }
        self.rate_limiter.record(anomaly_type.key(), now_ms);

        let mut factors = Vec::new();
        if analysis.source.matched {
            factors.push(format!(
                "Matched {} signature at {:.0} Hz (confidence {})",
                analysis.source.vendor, analysis.frequency_hz, analysis.source.confidence
            ));
        }
        if analysis.following_user {
            factors.push(format!(
                "Followed across {} distinct locations",
                analysis.distinct_locations
            ));
        }
        if analysis.seen_at_home && analysis.seen_elsewhere {
            factors.push("Heard at home and at least one other location".to_string());
        }
        if analysis.frequency_stable {
            factors.push("Frequency stable across sightings".to_string());
        }
        if analysis.modulation_matches() {
            factors.push("Amplitude envelope matches the vendor's modulation".to_string());
        }
        factors.push(format!(
            "{:?} amplitude profile, SNR {:.0} dB",
            analysis.amplitude_profile, analysis.snr_db
        ));

        let location = {
            let fix = self.location.lock().await;
            fix.as_ref().map(|f| (f.latitude, f.longitude))
        };
        let anomaly = UltrasonicAnomaly {
            id: detection_id(now_ms),
            timestamp_ms: now_ms,
            anomaly_type,
            threat_level: severity_from_tracking(tracking),
            confidence: severity_from_tracking(analysis.source.confidence),
            tracking_likelihood: tracking,
            false_positive_likelihood: false_positive,
            description: describe_beacon(&analysis),
            frequency_hz: analysis.frequency_hz,
            latitude: location.map(|l| l.0),
            longitude: location.map(|l| l.1),
            contributing_factors: factors,
            analysis,
        };

        warn!(
            anomaly_type = anomaly.anomaly_type.key(),
            frequency_hz = anomaly.frequency_hz,
            tracking,
            false_positive,
            "ultrasonic anomaly detected"
        );
        let event = TimelineEvent::new(
            now_ms,
            TimelineEventType::Anomaly,
            format!(
                "{} ({})",
                anomaly.anomaly_type.key(),
                anomaly.threat_level.label()
            ),
            anomaly.contributing_factors.join("; "),
        )
        .with_frequency(anomaly.frequency_hz)
        .with_threat(anomaly.threat_level)
        .with_location(anomaly.latitude, anomaly.longitude);
        self.push_event(event).await;

        let _ = self.detection_tx.send(Some(anomaly.to_detection()));
        let _ = self.anomaly_tx.send(Some(anomaly));
    }

    async fn publish_beacons(&self) {
        let active: Vec<BeaconDetection> = {
            let beacons = self.beacons.lock().await;
            beacons
                .values()
                .filter(|b| b.detection_count >= MIN_DETECTIONS_TO_CONFIRM)
                .cloned()
                .collect()
        };
        let noise_floor_db = self.noise_floor.lock().await.noise_floor_db();
        self.status_tx.send_modify(|s| {
            s.noise_floor_db = noise_floor_db;
            s.active_beacons = active.len();
        });
        let _ = self.beacons_tx.send(active);
    }

    async fn push_event(&self, event: TimelineEvent) {
        self.timeline.append(event.clone());
        let _ = self.event_tx.send(Some(event.clone()));
        self.persistence
            .insert_event(CellularEventEntity::from_event(&event))
            .await;
        self.persistence.trim_events(PERSISTED_EVENT_KEEP).await;
    }
}

/// Goertzel sweep of one PCM window: every scanned bin more than 30 dB above
/// the noise floor yields a (frequency, amplitude) hit. The reported
/// frequency is the magnitude-weighted centroid of the bin and its immediate
/// neighbors, so real-world drift shows up in the frequency history.
pub fn analyze_window(samples: &[i16], sample_rate: u32, noise_floor_db: f64) -> Vec<(f32, f64)> {
    if samples.is_empty() || sample_rate == 0 {
        return Vec::new();
    }
    let nyquist = sample_rate as f64 / 2.0;
    let high = SCAN_BAND_HIGH_HZ.min(nyquist);

    let mut bins: Vec<(f64, f64)> = Vec::new();
    let mut freq = SCAN_BAND_LOW_HZ;
    while freq <= high {
        let magnitude = goertzel_magnitude(samples, freq, sample_rate);
        bins.push((freq, magnitude));
        freq += SCAN_BIN_STEP_HZ;
    }

    let mut hits = Vec::new();
    for i in 0..bins.len() {
        let (bin_freq, magnitude) = bins[i];
        // Peak-pick: spectral leakage from a strong tone must not spawn
        // phantom detections in neighboring buckets.
        let is_local_max = (i == 0 || magnitude >= bins[i - 1].1)
            && (i + 1 == bins.len() || magnitude >= bins[i + 1].1);
        if !is_local_max {
            continue;
        }
        let amplitude_db = magnitude_to_db(magnitude);
        if amplitude_db - noise_floor_db > SNR_GATE_DB {
            // Weighted centroid over [f-step, f, f+step].
            let mut weighted = bin_freq * magnitude;
            let mut total = magnitude;
            if i > 0 {
                weighted += bins[i - 1].0 * bins[i - 1].1;
                total += bins[i - 1].1;
            }
            if i + 1 < bins.len() {
                weighted += bins[i + 1].0 * bins[i + 1].1;
                total += bins[i + 1].1;
            }
            let centroid = if total > 0.0 { weighted / total } else { bin_freq };
            hits.push((centroid as f32, amplitude_db));
        }
    }
    hits
}

/// Build the analysis record for one beacon from its histories plus engine
/// context.
pub fn build_analysis(
    beacon: &BeaconDetection,
    concurrent_beacons: usize,
    home_location: Option<(f64, f64)>,
    noise_floor_db: f64,
) -> BeaconAnalysis {
    let amplitude_mean = mean(&beacon.amplitude_history);
    let amplitude_stdev = stdev(&beacon.amplitude_history);
    let amplitude_cv = if amplitude_mean.abs() < 1e-6 {
        if amplitude_stdev < 1e-6 {
            0.0
        } else {
            f64::INFINITY
        }
    } else {
        amplitude_stdev / amplitude_mean.abs()
    };
    let frequency_stdev = stdev_f32(&beacon.frequency_history);
    let frequency_stable = frequency_stdev <= FREQ_STABLE_STDEV_HZ;

    let profile = classify_amplitude_profile(&beacon.amplitude_history);
    let source = attribute_source(beacon.frequency_hz, frequency_stable, profile);
    let category = categorize(source.purpose, source.matched, beacon.frequency_hz);

    let spread = location_spread(&beacon.location_history);
    let following = is_following_user(beacon.frequency_hz, spread, amplitude_cv, frequency_stable);

    let (seen_at_home, seen_elsewhere) = match home_location {
        Some((home_lat, home_lon)) => {
            let at_home = beacon.location_history.iter().any(|s| {
                haversine_distance_m(home_lat, home_lon, s.latitude, s.longitude)
                    <= LOCATION_CLUSTER_RADIUS_M
            });
            let elsewhere = beacon.location_history.iter().any(|s| {
                haversine_distance_m(home_lat, home_lon, s.latitude, s.longitude)
                    > LOCATION_CLUSTER_RADIUS_M
            });
            (at_home, elsewhere)
        }
        None => (false, false),
    };

    let duration_ms = beacon.duration_ms();
    BeaconAnalysis {
        bucket_hz: beacon.bucket_hz,
        frequency_hz: beacon.frequency_hz,
        timestamp_ms: beacon.last_detected_ms,
        duration_ms,
        detection_count: beacon.detection_count,
        amplitude_profile: profile,
        amplitude_mean_db: amplitude_mean,
        amplitude_stdev_db: amplitude_stdev,
        amplitude_cv,
        frequency_stdev_hz: frequency_stdev,
        frequency_stable,
        snr_db: beacon.peak_amplitude_db - noise_floor_db,
        source,
        category,
        following_user: following,
        distinct_locations: spread.distinct_locations,
        avg_dwell_per_location_ms: spread.avg_dwell_per_location_ms,
        seen_at_home,
        seen_elsewhere,
        persistence_score: persistence_score(duration_ms),
        environmental_context: beacon.environmental_context,
        concurrent_beacons,
    }
}
