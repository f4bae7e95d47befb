//! # Cellular Anomaly Engine Module
//!
//! Per-snapshot analysis of the serving cell against the trust model, the
//! stationary-change pattern ring, and the downgrade chain. Scoring is a pure
//! function over a plain analysis record; the engine owns the decision ladder,
//! cooldowns, timeline wiring, and persistence. One lock per table, and the
//! history ring is snapshotted before analysis so no lock is held while
//! scoring.

use crate::detection::{
    detection_id, Detection, DetectionMethod, DetectorId, DetectorObserver, DetectorStatus,
    DeviceType, NullObserver, ProtocolType,
};
use crate::history::{
    CellHistory, DowngradeChainTracker, StationaryChangeTracker, StationaryPatternResult,
    RAPID_SWITCH_PER_MIN_MOVING, RAPID_SWITCH_PER_MIN_STATIONARY,
};
use crate::movement::{MovementAnalysis, MovementType};
use crate::persistence::{
    CellularEventEntity, EphemeralTransition, PersistenceFacade, SeenCellTowerEntity,
    TrustedCellEntity, PERSISTED_EVENT_KEEP,
};
use crate::signatures;
use crate::telephony::{
    effective_display_generation, select_serving_cell, snapshot_from_cell, CellSnapshot,
    DisplayOverride, NetworkGeneration, RadioCell,
};
use crate::timeline::{
    AnomalyRateLimiter, EventTimeline, ThreatLevel, TimelineEvent, TimelineEventType,
};
use crate::trust::{CellTrustModel, TrustedCellInfo};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

/// Location fixes older than this are stale and movement becomes unknown.
const LOCATION_STALENESS_MS: i64 = 30_000;

/// Signal jump that counts as a spike, dBm.
const SIGNAL_SPIKE_DBM: i32 = 25;

/// Spike detection window.
const SIGNAL_SPIKE_WINDOW_MS: i64 = 5_000;

/// Signal at or above this is suspiciously strong.
const STRONG_SIGNAL_DBM: i32 = -55;

/// Default global cooldown across all anomaly types.
const DEFAULT_GLOBAL_COOLDOWN_MS: i64 = 30_000;

/// Timeline capacity for the cellular engine.
pub const CELLULAR_TIMELINE_CAP: usize = 200;

/// Typed classification of a cellular anomaly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CellularAnomalyType {
    /// Serving network advertises an ITU test or reserved MCC/MNC.
    SuspiciousNetwork,
    /// Generation downgrade landed on a weak/no-encryption network.
    EncryptionDowngrade,
    /// Accumulated behavioral indicators crossed the reporting gate.
    SuspiciousCellBehavior,
}

impl CellularAnomalyType {
    pub fn key(&self) -> &'static str {
        match self {
            CellularAnomalyType::SuspiciousNetwork => "SUSPICIOUS_NETWORK",
            CellularAnomalyType::EncryptionDowngrade => "ENCRYPTION_DOWNGRADE",
            CellularAnomalyType::SuspiciousCellBehavior => "SUSPICIOUS_CELL_BEHAVIOR",
        }
    }
}

/// Everything the scoring functions need to know about one snapshot step.
/// Built once per snapshot; scoring never touches engine state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellularAnalysis {
    pub timestamp_ms: i64,
    pub cell_id: Option<i64>,
    pub previous_cell_id: Option<i64>,
    pub cell_changed: bool,
    pub generation: NetworkGeneration,
    pub previous_generation: Option<NetworkGeneration>,
    pub generation_changed: bool,
    /// Generation rank decreased this step.
    pub downgraded_this_step: bool,
    /// Chain of generation labels, oldest first.
    pub downgrade_chain: Vec<String>,
    /// Chain length >= 2, monotone non-increasing, ends at 2G.
    pub progressive_downgrade_to_2g: bool,
    pub signal_dbm: i32,
    pub signal_delta_dbm: i32,
    pub signal_spike: bool,
    /// Trust score of the serving cell before this sighting was recorded.
    pub trust_score: u8,
    /// Serving cell had never been seen before this snapshot.
    pub new_tower: bool,
    pub in_familiar_area: bool,
    pub movement: MovementAnalysis,
    pub stationary_pattern: Option<StationaryPatternResult>,
    /// Adjacent-pair changes in the last minute of history.
    pub recent_changes: usize,
    pub lac: Option<i32>,
    pub tac: Option<i32>,
    /// LAC or TAC changed while the cell id stayed constant, both nonzero.
    pub lac_tac_changed_without_cell_change: bool,
    pub operator_changed: bool,
    pub same_carrier_5g_handoff: bool,
    pub mcc: Option<String>,
    pub mnc: Option<String>,
    pub suspicious_mcc_mnc: bool,
    pub unrecognized_us_mnc: bool,
    pub suspicious_cell_id: bool,
}

/// IMSI-catcher likelihood 0..=100 over one analysis record. Pure function;
/// every contribution saturates into the clamp.
pub fn imsi_catcher_score(analysis: &CellularAnalysis) -> u8 {
    let mut score: i32 = 0;

    if analysis.progressive_downgrade_to_2g {
        score += 30;
    }
    if analysis.generation.encryption().is_weak_or_none() {
        score += 25;
    }
    if analysis.signal_dbm >= STRONG_SIGNAL_DBM {
        score += 20;
    }
    if analysis.downgraded_this_step && analysis.signal_spike {
        score += 20;
    }
    if analysis.downgraded_this_step && analysis.trust_score < 30 {
        score += 15;
    }
    if analysis.movement.impossible_speed {
        score += 15;
    }
    if analysis.cell_changed && analysis.movement.movement_type == MovementType::Stationary {
        score += 10;
    }
    if analysis.trust_score < 30 {
        score += 10;
    }
    if analysis.lac_tac_changed_without_cell_change {
        score += 10;
    }
    if analysis.operator_changed {
        score += 10;
    }
    if analysis.generation_changed {
        score += 5;
    }
    if analysis.lac.map(signatures::suspicious_lac).unwrap_or(false) {
        score += 25;
    }
    if analysis.tac.map(signatures::suspicious_tac).unwrap_or(false) {
        score += 20;
    }
    if analysis.suspicious_cell_id {
        score += 15;
    }
    if analysis.unrecognized_us_mnc {
        score += 20;
    }
    if analysis.signal_dbm >= STRONG_SIGNAL_DBM && analysis.trust_score < 30 {
        score += 15;
    }

    score.clamp(0, 100) as u8
}

/// Severity from the final score. The reporting gate sits at 30.
pub fn severity_from_score(score: u8) -> ThreatLevel {
    match score {
        s if s >= 90 => ThreatLevel::Critical,
        s if s >= 70 => ThreatLevel::High,
        s if s >= 50 => ThreatLevel::Medium,
        s if s >= 30 => ThreatLevel::Low,
        _ => ThreatLevel::Info,
    }
}

/// Human-readable contributing factors for the score components that fired.
pub fn contributing_factors(analysis: &CellularAnalysis) -> Vec<String> {
    let mut factors = Vec::new();

    if analysis.progressive_downgrade_to_2g {
        factors.push("Progressive downgrade to 2G (StingRay signature)".to_string());
    }
    if analysis.generation.encryption().is_weak_or_none() {
        factors.push(format!(
            "Weak or no encryption ({})",
            analysis.generation.label()
        ));
    }
    if analysis.signal_dbm >= STRONG_SIGNAL_DBM {
        factors.push(format!(
            "Suspiciously strong signal ({} dBm)",
            analysis.signal_dbm
        ));
    }
    if analysis.downgraded_this_step && analysis.signal_spike {
        factors.push("Downgrade coincided with signal spike".to_string());
    }
    if analysis.downgraded_this_step && analysis.trust_score < 30 {
        factors.push("Downgrade coincided with untrusted tower".to_string());
    }
    if analysis.movement.impossible_speed {
        factors.push("Physically impossible movement speed".to_string());
    }
    if analysis.cell_changed && analysis.movement.movement_type == MovementType::Stationary {
        factors.push("Cell change while stationary".to_string());
    }
    if analysis.trust_score < 30 {
        factors.push(format!("Low trust score ({})", analysis.trust_score));
    }
    if analysis.lac_tac_changed_without_cell_change {
        factors.push("LAC/TAC changed without cell change".to_string());
    }
    if analysis.operator_changed {
        factors.push("Operator changed between snapshots".to_string());
    }
    if analysis.generation_changed {
        factors.push(format!(
            "Network generation changed to {}",
            analysis.generation.label()
        ));
    }
    if let Some(lac) = analysis.lac.filter(|&l| signatures::suspicious_lac(l)) {
        factors.push(format!("Suspicious LAC value ({lac})"));
    }
    if let Some(tac) = analysis.tac.filter(|&t| signatures::suspicious_tac(t)) {
        factors.push(format!("Suspicious TAC value ({tac})"));
    }
    if analysis.suspicious_cell_id {
        if let Some(id) = analysis.cell_id {
            factors.push(format!("Suspicious cell ID pattern ({id})"));
        }
    }
    if analysis.unrecognized_us_mnc {
        factors.push("Unrecognized MNC under US MCC".to_string());
    }
    if analysis.suspicious_mcc_mnc {
        factors.push(format!(
            "Test/reserved network codes ({}/{})",
            analysis.mcc.as_deref().unwrap_or("?"),
            analysis.mnc.as_deref().unwrap_or("?")
        ));
    }

    factors
}

/// One emitted cellular anomaly with its full analysis payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellularAnomaly {
    pub id: String,
    pub timestamp_ms: i64,
    pub anomaly_type: CellularAnomalyType,
    pub threat_level: ThreatLevel,
    pub confidence: ThreatLevel,
    pub imsi_score: u8,
    pub analysis: CellularAnalysis,
    pub contributing_factors: Vec<String>,
    pub description: String,
    pub cell_id: Option<i64>,
    pub mcc: Option<String>,
    pub mnc: Option<String>,
    pub signal_dbm: i32,
    pub network_type: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl CellularAnomaly {
    /// Generic boundary record for storage and UI.
    pub fn to_detection(&self) -> Detection {
        Detection {
            id: self.id.clone(),
            timestamp_ms: self.timestamp_ms,
            protocol: ProtocolType::Cellular,
            method: DetectionMethod::CellularAnomaly,
            device_type: DeviceType::ImsiCatcher,
            signal_dbm: self.signal_dbm,
            threat_level: self.threat_level,
            threat_score: self.imsi_score,
            factors_json: serde_json::to_string(&self.contributing_factors)
                .unwrap_or_else(|_| "[]".to_string()),
            latitude: self.latitude,
            longitude: self.longitude,
        }
    }
}

/// Actionable description block rendered into every anomaly.
fn describe_anomaly(anomaly_type: CellularAnomalyType, analysis: &CellularAnalysis) -> String {
    match anomaly_type {
        CellularAnomalyType::SuspiciousNetwork => format!(
            "Probable source: cell-site simulator broadcasting test network codes {}/{}.\n\
             What it does: coerces nearby phones to attach so traffic and identifiers can be collected.\n\
             Recommended action: enable airplane mode and leave the area; avoid calls and SMS.\n\
             How to confirm: no legitimate carrier operates under ITU test codes; check whether the network vanishes a few hundred meters away.",
            analysis.mcc.as_deref().unwrap_or("?"),
            analysis.mnc.as_deref().unwrap_or("?")
        ),
        CellularAnomalyType::EncryptionDowngrade => format!(
            "Probable source: IMSI catcher forcing a downgrade toward {} to weaken encryption.\n\
             What it does: older generations use breakable or no encryption, exposing calls, SMS, and identifiers.\n\
             Recommended action: enable airplane mode or switch the modem to LTE/NR-only; avoid sensitive traffic.\n\
             How to confirm: chain {} on a network that normally serves 4G/5G here, combined with the listed factors.",
            analysis.generation.label(),
            analysis.downgrade_chain.join(" -> ")
        ),
        CellularAnomalyType::SuspiciousCellBehavior => format!(
            "Probable source: unverified tower exhibiting simulator-like behavior near your location.\n\
             What it does: unusual cell changes, signal jumps, or identity values inconsistent with the local network plan.\n\
             Recommended action: watch for repeat alerts at this location; prefer Wi-Fi calling until the pattern clears.\n\
             How to confirm: {} contributing factors listed; a legitimate tower should not reproduce them while you are stationary.",
            contributing_factors(analysis).len()
        ),
    }
}

/// Latest serving-cell summary published on the status stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellStatus {
    pub status: DetectorStatus,
    pub cell_id: Option<i64>,
    pub network_type: Option<String>,
    /// Generation after display-override promotion (NSA 5G shows as 5G).
    pub display_generation: Option<String>,
    pub signal_dbm: Option<i32>,
    pub operator: Option<String>,
}

impl CellStatus {
    fn idle() -> Self {
        Self {
            status: DetectorStatus::Idle,
            cell_id: None,
            network_type: None,
            display_generation: None,
            signal_dbm: None,
            operator: None,
        }
    }
}

struct LocationFix {
    latitude: f64,
    longitude: f64,
    timestamp_ms: i64,
}

/// The cellular anomaly engine. See module docs for the lock discipline.
pub struct CellularAnomalyEngine {
    history: Arc<Mutex<CellHistory>>,
    stationary: Arc<Mutex<StationaryChangeTracker>>,
    downgrade: Arc<Mutex<DowngradeChainTracker>>,
    trust: Arc<Mutex<CellTrustModel>>,
    previous: Arc<Mutex<Option<CellSnapshot>>>,
    location: Arc<Mutex<Option<LocationFix>>>,
    display_override: Arc<Mutex<DisplayOverride>>,
    timeline: Arc<EventTimeline>,
    persistence: PersistenceFacade,
    rate_limiter: AnomalyRateLimiter,
    observer: Arc<dyn DetectorObserver>,
    is_monitoring: AtomicBool,
    anomaly_tx: watch::Sender<Option<CellularAnomaly>>,
    status_tx: watch::Sender<CellStatus>,
    event_tx: watch::Sender<Option<TimelineEvent>>,
    towers_tx: watch::Sender<Vec<TrustedCellInfo>>,
    detection_tx: watch::Sender<Option<Detection>>,
}

impl CellularAnomalyEngine {
    pub fn new(timeline: Arc<EventTimeline>, persistence: PersistenceFacade) -> Self {
        Self::with_observer(timeline, persistence, Arc::new(NullObserver))
    }

    pub fn with_observer(
        timeline: Arc<EventTimeline>,
        persistence: PersistenceFacade,
        observer: Arc<dyn DetectorObserver>,
    ) -> Self {
        let limiter = AnomalyRateLimiter::new(60_000);
        limiter.set_global_cooldown_ms(DEFAULT_GLOBAL_COOLDOWN_MS);
        Self {
            history: Arc::new(Mutex::new(CellHistory::new())),
            stationary: Arc::new(Mutex::new(StationaryChangeTracker::new())),
            downgrade: Arc::new(Mutex::new(DowngradeChainTracker::new())),
            trust: Arc::new(Mutex::new(CellTrustModel::new())),
            previous: Arc::new(Mutex::new(None)),
            location: Arc::new(Mutex::new(None)),
            display_override: Arc::new(Mutex::new(DisplayOverride::None)),
            timeline,
            persistence,
            rate_limiter: limiter,
            observer,
            is_monitoring: AtomicBool::new(false),
            anomaly_tx: watch::channel(None).0,
            status_tx: watch::channel(CellStatus::idle()).0,
            event_tx: watch::channel(None).0,
            towers_tx: watch::channel(Vec::new()).0,
            detection_tx: watch::channel(None).0,
        }
    }

    /// Restore persisted trust state and begin accepting snapshots.
    pub async fn start_monitoring(&self) {
        if self.is_monitoring.swap(true, Ordering::SeqCst) {
            return;
        }
        let persisted = self.persistence.snapshot_trusted_cells().await;
        let mut restored = Vec::with_capacity(persisted.len());
        for entity in persisted {
            match entity.into_info() {
                Ok(info) => restored.push(info),
                Err(e) => warn!(error = %e, "dropping malformed trusted-cell row"),
            }
        }
        if !restored.is_empty() {
            let mut trust = self.trust.lock().await;
            trust.restore(restored);
            let _ = self.towers_tx.send(trust.snapshot());
        }
        self.status_tx.send_modify(|s| s.status = DetectorStatus::Monitoring);
        self.observer.on_detector_started(DetectorId::Cellular);
        info!("cellular monitoring started");
    }

    /// Stop accepting snapshots. Idempotent.
    pub async fn stop_monitoring(&self) {
        if !self.is_monitoring.swap(false, Ordering::SeqCst) {
            return;
        }
        self.status_tx.send_modify(|s| s.status = DetectorStatus::Idle);
        self.observer.on_detector_stopped(DetectorId::Cellular);
        info!("cellular monitoring stopped");
    }

    /// Stop monitoring and let in-flight persistence complete. Idempotent.
    pub async fn destroy(&self) {
        self.stop_monitoring().await;
    }

    pub fn is_monitoring(&self) -> bool {
        self.is_monitoring.load(Ordering::SeqCst)
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

    pub async fn set_display_override(&self, display_override: DisplayOverride) {
        *self.display_override.lock().await = display_override;
    }

    /// Per-type anomaly interval, clamped upstream by the config layer.
    pub fn set_min_anomaly_interval_ms(&self, interval_ms: i64) {
        self.rate_limiter.set_min_interval_ms(interval_ms);
    }

    /// Toggle ephemeral mode. Turning it off re-persists the in-memory trust
    /// table so the store catches up with what monitoring accumulated.
    pub async fn set_ephemeral_mode(&self, enabled: bool) {
        match self.persistence.set_ephemeral(enabled).await {
            EphemeralTransition::Disabled => {
                let snapshot = { self.trust.lock().await.snapshot() };
                for info in &snapshot {
                    if let Ok(entity) = TrustedCellEntity::from_info(info) {
                        self.persistence.insert_trusted_cell(entity).await;
                    }
                }
                debug!(cells = snapshot.len(), "re-persisted trust table after leaving ephemeral mode");
            }
            EphemeralTransition::Enabled => {
                debug!("ephemeral mode enabled; store purged");
            }
            EphemeralTransition::Unchanged => {}
        }
    }

    /// Purge every table this engine owns, and the store. Idempotent.
    pub async fn clear_sensitive_data(&self) {
        self.history.lock().await.clear();
        self.stationary.lock().await.clear();
        self.downgrade.lock().await.clear();
        self.trust.lock().await.clear();
        *self.previous.lock().await = None;
        self.rate_limiter.clear();
        self.timeline.clear();
        let _ = self.towers_tx.send(Vec::new());
        self.persistence.purge_all().await;
    }

    pub fn anomalies(&self) -> watch::Receiver<Option<CellularAnomaly>> {
        self.anomaly_tx.subscribe()
    }

    pub fn cell_status(&self) -> watch::Receiver<CellStatus> {
        self.status_tx.subscribe()
    }

    pub fn cellular_events(&self) -> watch::Receiver<Option<TimelineEvent>> {
        self.event_tx.subscribe()
    }

    pub fn seen_cell_towers(&self) -> watch::Receiver<Vec<TrustedCellInfo>> {
        self.towers_tx.subscribe()
    }

    pub fn detections(&self) -> watch::Receiver<Option<Detection>> {
        self.detection_tx.subscribe()
    }

    /// Telephony callback entry point: select the serving cell and analyze.
    pub async fn on_cell_info(&self, cells: &[RadioCell], timestamp_ms: i64) {
        let Some(serving) = select_serving_cell(cells) else {
            debug!("no registered cell in callback");
            return;
        };
        let location = {
            let fix = self.location.lock().await;
            fix.as_ref().map(|f| (f.latitude, f.longitude))
        };
        let snapshot = snapshot_from_cell(serving, timestamp_ms, location);
        self.process_snapshot(snapshot).await;
    }

    async fn has_recent_location_data(&self, now_ms: i64) -> bool {
        let fix = self.location.lock().await;
        fix.as_ref()
            .map(|f| now_ms - f.timestamp_ms <= LOCATION_STALENESS_MS)
            .unwrap_or(false)
    }

    /// Analyze one snapshot end to end. The decision ladder exits on the
    /// first classification hit.
    pub async fn process_snapshot(&self, snapshot: CellSnapshot) {
        if !self.is_monitoring() {
            return;
        }
        let now_ms = snapshot.timestamp_ms;

        let previous = {
            let mut prev = self.previous.lock().await;
            prev.replace(snapshot.clone())
        };

        // Trust queries reflect the state before this sighting is recorded.
        let (trust_score, new_tower, in_familiar_area) = {
            let trust = self.trust.lock().await;
            let score = snapshot.cell_id.map(|id| trust.trust_score(id)).unwrap_or(0);
            let fresh = snapshot
                .cell_id
                .map(|id| trust.get(id).is_none())
                .unwrap_or(false);
            let familiar = match (snapshot.latitude, snapshot.longitude) {
                (Some(lat), Some(lon)) => trust.is_in_familiar_area(lat, lon),
                _ => false,
            };
            (score, fresh, familiar)
        };

        {
            let mut history = self.history.lock().await;
            history.record(snapshot.clone());
        }
        let recent_changes = {
            let history = self.history.lock().await;
            history.recent_cell_changes(60_000, now_ms)
        };

        let generation = snapshot.generation();
        let (downgrade_chain, progressive) = {
            let mut chain = self.downgrade.lock().await;
            chain.record(generation, now_ms);
            (
                chain
                    .recent_chain()
                    .iter()
                    .map(|g| g.label().to_string())
                    .collect::<Vec<_>>(),
                chain.is_progressive_downgrade_to_2g(),
            )
        };

        let movement = self.movement_for(&snapshot, previous.as_ref(), now_ms).await;
        let analysis = build_analysis(
            &snapshot,
            previous.as_ref(),
            generation,
            downgrade_chain,
            progressive,
            trust_score,
            new_tower,
            in_familiar_area,
            movement,
            recent_changes,
        );

        self.publish_status(&snapshot, generation).await;
        self.observe_and_persist(&snapshot, now_ms).await;

        if self.rate_limiter.globally_suppressed(now_ms) {
            debug!("global anomaly cooldown active; snapshot analysis suppressed");
            self.observer.on_scan_success(DetectorId::Cellular);
            return;
        }

        // Decision ladder, early exit on the first hit.
        if analysis.suspicious_mcc_mnc {
            if self
                .rate_limiter
                .allows(CellularAnomalyType::SuspiciousNetwork.key(), now_ms)
            {
                let mut anomaly = self.build_anomaly(
                    CellularAnomalyType::SuspiciousNetwork,
                    100,
                    ThreatLevel::Critical,
                    &analysis,
                    &snapshot,
                );
                anomaly.contributing_factors = contributing_factors(&analysis);
                self.emit_anomaly(anomaly, now_ms).await;
            }
            self.observer.on_scan_success(DetectorId::Cellular);
            return;
        }

        let base_score = imsi_catcher_score(&analysis);

        if analysis.downgraded_this_step && analysis.generation.encryption().is_weak_or_none() {
            if self
                .rate_limiter
                .allows(CellularAnomalyType::EncryptionDowngrade.key(), now_ms)
            {
                let confidence = match base_score {
                    s if s >= 70 => ThreatLevel::Critical,
                    s if s >= 50 => ThreatLevel::High,
                    _ => ThreatLevel::Medium,
                };
                let mut anomaly = self.build_anomaly(
                    CellularAnomalyType::EncryptionDowngrade,
                    base_score,
                    confidence,
                    &analysis,
                    &snapshot,
                );
                let mut factors = contributing_factors(&analysis);
                factors.push(format!(
                    "Downgrade chain: {}",
                    analysis.downgrade_chain.join(" -> ")
                ));
                factors.push(format!("Signal spike: {}", analysis.signal_spike));
                factors.push(format!("New tower: {}", analysis.new_tower));
                anomaly.contributing_factors = factors;
                self.emit_anomaly(anomaly, now_ms).await;
            }
            self.observer.on_scan_success(DetectorId::Cellular);
            return;
        }

        let mut analysis = analysis;
        let (behavior_score, mut behavior_factors, pattern) =
            self.score_behavior(&analysis, &snapshot, now_ms).await;
        analysis.stationary_pattern = pattern;

        let total = (base_score as i32 + behavior_score).clamp(0, 100) as u8;
        let mut factors = contributing_factors(&analysis);
        factors.append(&mut behavior_factors);

        if total >= 30 {
            let anomaly_type = CellularAnomalyType::SuspiciousCellBehavior;
            if self.rate_limiter.allows(anomaly_type.key(), now_ms) {
                let mut anomaly =
                    self.build_anomaly(anomaly_type, total, severity_from_score(total), &analysis, &snapshot);
                anomaly.contributing_factors = factors;
                self.emit_anomaly(anomaly, now_ms).await;
            } else {
                debug!(score = total, "anomaly suppressed by per-type interval");
            }
        } else if total >= 15 && !factors.is_empty() {
            let event = TimelineEvent::new(
                now_ms,
                TimelineEventType::Note,
                format!("Below-threshold cellular indicators (score {total})"),
                factors.join("; "),
            )
            .with_cell(snapshot.cell_id)
            .with_threat(ThreatLevel::Info)
            .with_location(snapshot.latitude, snapshot.longitude);
            self.push_event(event).await;
        }

        self.observer.on_scan_success(DetectorId::Cellular);
    }

    /// Steps 4-9 of the ladder: behavioral contributions with their factor
    /// strings and the stationary pattern, when one was evaluated. The sum
    /// may be negative before the final clamp.
    async fn score_behavior(
        &self,
        analysis: &CellularAnalysis,
        snapshot: &CellSnapshot,
        now_ms: i64,
    ) -> (i32, Vec<String>, Option<StationaryPatternResult>) {
        let mut score: i32 = 0;
        let mut factors = Vec::new();
        let mut evaluated_pattern = None;

        if analysis.cell_changed {
            let event = TimelineEvent::new(
                now_ms,
                TimelineEventType::CellChange,
                format!(
                    "Cell change {} -> {}",
                    analysis
                        .previous_cell_id
                        .map(|id| id.to_string())
                        .unwrap_or_else(|| "?".to_string()),
                    analysis.cell_id.map(|id| id.to_string()).unwrap_or_else(|| "?".to_string())
                ),
                format!("Signal {} dBm, {}", snapshot.signal_dbm, snapshot.network_type),
            )
            .with_cell(snapshot.cell_id)
            .with_location(snapshot.latitude, snapshot.longitude);
            self.push_event(event).await;

            if analysis.movement.is_stationary() {
                if let (Some(from), Some(to)) = (analysis.previous_cell_id, analysis.cell_id) {
                    let pattern = {
                        let mut tracker = self.stationary.lock().await;
                        tracker.track(from, to, now_ms);
                        tracker.analyze(from, now_ms)
                    };
                    evaluated_pattern = Some(pattern);

                    if pattern.is_quick_return {
                        let event = TimelineEvent::new(
                            now_ms,
                            TimelineEventType::Note,
                            "Note: Quick return to original cell detected (likely network optimization)",
                            format!("{from} -> {to} within the quick-return window"),
                        )
                        .with_cell(Some(to))
                        .with_threat(ThreatLevel::Info);
                        self.push_event(event).await;
                    } else if analysis.same_carrier_5g_handoff
                        && self.is_aggressive_handoff_carrier(snapshot)
                        && imsi_catcher_score(analysis) < 40
                    {
                        debug!("5G handoff on aggressive-handoff carrier suppressed");
                    } else {
                        score += 15;
                        if pattern.recent_changes_count >= 3 {
                            score += 25;
                            factors.push(format!(
                                "{} stationary cell changes in 5 minutes",
                                pattern.recent_changes_count
                            ));
                        } else if pattern.recent_changes_count >= 2 {
                            score += 10;
                        }
                        if pattern.is_oscillating {
                            score -= 10;
                        }
                        if analysis.trust_score == 0 && !analysis.in_familiar_area {
                            score += 15;
                            factors.push("Untrusted cell outside familiar area".to_string());
                        }
                        if analysis.same_carrier_5g_handoff {
                            score -= 5;
                        }
                        if analysis.movement.impossible_speed {
                            score += 25;
                        }
                    }
                }
            }
        }

        // Rapid switching, counted over the last minute of history.
        let threshold = if analysis.movement.is_stationary() {
            RAPID_SWITCH_PER_MIN_STATIONARY
        } else {
            RAPID_SWITCH_PER_MIN_MOVING
        };
        if analysis.recent_changes > threshold {
            score += 20;
            factors.push(format!(
                "Rapid cell switching: {} changes in the last minute",
                analysis.recent_changes
            ));
            if analysis.movement.is_stationary() {
                score += 25;
            }
        }

        if analysis.signal_spike {
            score += 15;
            factors.push(format!(
                "Signal spike of {} dBm within 5 s",
                analysis.signal_delta_dbm
            ));
            if analysis.cell_changed {
                score += 15;
            }
        }

        if analysis.new_tower && analysis.in_familiar_area {
            score += 25;
            factors.push("Unknown cell appeared in a familiar area".to_string());
        }

        if analysis.lac_tac_changed_without_cell_change {
            score += 20;
        }

        if analysis.operator_changed {
            score += 20;
        }

        (score, factors, evaluated_pattern)
    }

    fn is_aggressive_handoff_carrier(&self, snapshot: &CellSnapshot) -> bool {
        match (&snapshot.mcc, &snapshot.mnc) {
            (Some(mcc), Some(mnc)) => signatures::is_aggressive_handoff_carrier(mcc, mnc),
            _ => false,
        }
    }

    async fn movement_for(
        &self,
        snapshot: &CellSnapshot,
        previous: Option<&CellSnapshot>,
        now_ms: i64,
    ) -> MovementAnalysis {
        let current = (snapshot.latitude, snapshot.longitude);
        let prev_fix = previous.and_then(|p| match (p.latitude, p.longitude) {
            (Some(lat), Some(lon)) => Some((lat, lon, p.timestamp_ms)),
            _ => None,
        });
        match (current, prev_fix) {
            ((Some(lat), Some(lon)), Some((plat, plon, pts))) => {
                MovementAnalysis::between(plat, plon, pts, lat, lon, snapshot.timestamp_ms)
            }
            _ => {
                if self.has_recent_location_data(now_ms).await {
                    MovementAnalysis::stationary()
                } else {
                    MovementAnalysis::unknown()
                }
            }
        }
    }

    async fn publish_status(&self, snapshot: &CellSnapshot, generation: NetworkGeneration) {
        let display = {
            let override_tag = *self.display_override.lock().await;
            effective_display_generation(generation, override_tag)
        };
        let _ = self.status_tx.send(CellStatus {
            status: DetectorStatus::Monitoring,
            cell_id: snapshot.cell_id,
            network_type: Some(snapshot.network_type.clone()),
            display_generation: Some(display.label().to_string()),
            signal_dbm: Some(snapshot.signal_dbm),
            operator: snapshot.operator_key(),
        });
    }

    async fn observe_and_persist(&self, snapshot: &CellSnapshot, now_ms: i64) {
        let Some(cell_id) = snapshot.cell_id else {
            return;
        };
        let location = match (snapshot.latitude, snapshot.longitude) {
            (Some(lat), Some(lon)) => Some((lat, lon)),
            _ => None,
        };
        let (info, towers) = {
            let mut trust = self.trust.lock().await;
            trust.observe(
                cell_id,
                snapshot.operator_key().as_deref(),
                &snapshot.network_type,
                location,
                now_ms,
            );
            (trust.get(cell_id).cloned(), trust.snapshot())
        };
        let _ = self.towers_tx.send(towers);

        if let Some(info) = info {
            self.persistence
                .insert_seen_cell(SeenCellTowerEntity {
                    cell_id: info.cell_id.clone(),
                    operator: info.operator.clone(),
                    network_type: info.network_type.clone(),
                    signal_dbm: snapshot.signal_dbm,
                    first_seen_ms: info.first_seen_ms,
                    last_seen_ms: info.last_seen_ms,
                    latitude: snapshot.latitude,
                    longitude: snapshot.longitude,
                })
                .await;
            if let Ok(entity) = TrustedCellEntity::from_info(&info) {
                self.persistence.insert_trusted_cell(entity).await;
            }
        }
    }

    fn build_anomaly(
        &self,
        anomaly_type: CellularAnomalyType,
        score: u8,
        confidence: ThreatLevel,
        analysis: &CellularAnalysis,
        snapshot: &CellSnapshot,
    ) -> CellularAnomaly {
        CellularAnomaly {
            id: detection_id(snapshot.timestamp_ms),
            timestamp_ms: snapshot.timestamp_ms,
            anomaly_type,
            threat_level: severity_from_score(score),
            confidence,
            imsi_score: score,
            analysis: analysis.clone(),
            contributing_factors: Vec::new(),
            description: describe_anomaly(anomaly_type, analysis),
            cell_id: snapshot.cell_id,
            mcc: snapshot.mcc.clone(),
            mnc: snapshot.mnc.clone(),
            signal_dbm: snapshot.signal_dbm,
            network_type: snapshot.network_type.clone(),
            latitude: snapshot.latitude,
            longitude: snapshot.longitude,
        }
    }

    async fn emit_anomaly(&self, anomaly: CellularAnomaly, now_ms: i64) {
        self.rate_limiter.record(anomaly.anomaly_type.key(), now_ms);
        warn!(
            anomaly_type = anomaly.anomaly_type.key(),
            score = anomaly.imsi_score,
            severity = anomaly.threat_level.label(),
            "cellular anomaly detected"
        );

        let event = TimelineEvent::new(
            now_ms,
            TimelineEventType::Anomaly,
            format!("{} ({})", anomaly.anomaly_type.key(), anomaly.threat_level.label()),
            anomaly.contributing_factors.join("; "),
        )
        .with_cell(anomaly.cell_id)
        .with_threat(anomaly.threat_level)
        .with_location(anomaly.latitude, anomaly.longitude);
        self.push_event(event).await;

        let _ = self.detection_tx.send(Some(anomaly.to_detection()));
        let _ = self.anomaly_tx.send(Some(anomaly));
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

#[allow(clippy::too_many_arguments)]
fn build_analysis(
    snapshot: &CellSnapshot,
    previous: Option<&CellSnapshot>,
    generation: NetworkGeneration,
    downgrade_chain: Vec<String>,
    progressive_downgrade_to_2g: bool,
    trust_score: u8,
    new_tower: bool,
    in_familiar_area: bool,
    movement: MovementAnalysis,
    recent_changes: usize,
) -> CellularAnalysis {
    let previous_generation = previous.map(|p| p.generation());
    let cell_changed = match previous {
        Some(prev) => prev.cell_id != snapshot.cell_id,
        None => false,
    };
    let generation_changed = previous_generation
        .map(|g| g != generation)
        .unwrap_or(false);
    let downgraded_this_step = previous_generation
        .map(|g| g.rank() > generation.rank() && generation != NetworkGeneration::Unknown)
        .unwrap_or(false);

    let (signal_delta, signal_spike) = match previous {
        Some(prev) if snapshot.timestamp_ms - prev.timestamp_ms <= SIGNAL_SPIKE_WINDOW_MS => {
            let delta = snapshot.signal_dbm - prev.signal_dbm;
            (delta, delta > SIGNAL_SPIKE_DBM)
        }
        Some(prev) => (snapshot.signal_dbm - prev.signal_dbm, false),
        None => (0, false),
    };

    let lac_tac_changed_without_cell_change = match previous {
        Some(prev) if !cell_changed => {
            let lac_changed = matches!(
                (prev.lac, snapshot.lac),
                (Some(a), Some(b)) if a != b && a != 0 && b != 0
            );
            let tac_changed = matches!(
                (prev.tac, snapshot.tac),
                (Some(a), Some(b)) if a != b && a != 0 && b != 0
            );
            lac_changed || tac_changed
        }
        _ => false,
    };

    let operator_changed = match previous {
        Some(prev) => match (prev.operator_key(), snapshot.operator_key()) {
            (Some(a), Some(b)) => a != b,
            _ => false,
        },
        None => false,
    };

    let same_carrier_5g_handoff = cell_changed
        && generation == NetworkGeneration::FiveG
        && previous_generation == Some(NetworkGeneration::FiveG)
        && !operator_changed
        && snapshot.operator_key().is_some();

    let suspicious_mcc_mnc = match (&snapshot.mcc, &snapshot.mnc) {
        (Some(mcc), Some(mnc)) => signatures::is_suspicious_mcc_mnc(mcc, mnc),
        _ => false,
    };
    let unrecognized_us_mnc = match (&snapshot.mcc, &snapshot.mnc) {
        (Some(mcc), Some(mnc)) if mcc == "310" || mcc == "311" => {
            !signatures::is_known_us_carrier_mnc(mcc, mnc)
        }
        _ => false,
    };
    let suspicious_cell_id = snapshot
        .cell_id
        .map(signatures::is_suspicious_cell_id_pattern)
        .unwrap_or(false);

    CellularAnalysis {
        timestamp_ms: snapshot.timestamp_ms,
        cell_id: snapshot.cell_id,
        previous_cell_id: previous.and_then(|p| p.cell_id),
        cell_changed,
        generation,
        previous_generation,
        generation_changed,
        downgraded_this_step,
        downgrade_chain,
        progressive_downgrade_to_2g,
        signal_dbm: snapshot.signal_dbm,
        signal_delta_dbm: signal_delta,
        signal_spike,
        trust_score,
        new_tower,
        in_familiar_area,
        movement,
        stationary_pattern: None,
        recent_changes,
        lac: snapshot.lac,
        tac: snapshot.tac,
        lac_tac_changed_without_cell_change,
        operator_changed,
        same_carrier_5g_handoff,
        mcc: snapshot.mcc.clone(),
        mnc: snapshot.mnc.clone(),
        suspicious_mcc_mnc,
        unrecognized_us_mnc,
        suspicious_cell_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryPersistenceSink;

    fn snapshot(ts: i64, cell_id: i64, network_type: &str) -> CellSnapshot {
        CellSnapshot {
            timestamp_ms: ts,
            cell_id: Some(cell_id),
            lac: None,
            tac: Some(12_345),
            mcc: Some("310".to_string()),
            mnc: Some("410".to_string()),
            signal_dbm: -95,
            network_type: network_type.to_string(),
            latitude: Some(40.7128),
            longitude: Some(-74.0060),
        }
    }

    fn engine() -> CellularAnomalyEngine {
        let timeline = Arc::new(EventTimeline::new(CELLULAR_TIMELINE_CAP));
        let persistence =
            PersistenceFacade::new(Arc::new(InMemoryPersistenceSink::new()));
        CellularAnomalyEngine::new(timeline, persistence)
    }

    async fn seed_trusted(engine: &CellularAnomalyEngine, cell_id: i64, sightings: u32) {
        let mut trust = engine.trust.lock().await;
        for i in 0..sightings {
            trust.observe(
                cell_id,
                Some("310-410"),
                "NR",
                Some((40.7128, -74.0060)),
                i as i64,
            );
        }
    }

    fn analysis_template() -> CellularAnalysis {
        CellularAnalysis {
            timestamp_ms: 0,
            cell_id: Some(1_000_003),
            previous_cell_id: None,
            cell_changed: false,
            generation: NetworkGeneration::FiveG,
            previous_generation: None,
            generation_changed: false,
            downgraded_this_step: false,
            downgrade_chain: Vec::new(),
            progressive_downgrade_to_2g: false,
            signal_dbm: -95,
            signal_delta_dbm: 0,
            signal_spike: false,
            trust_score: 100,
            new_tower: false,
            in_familiar_area: true,
            movement: MovementAnalysis::stationary(),
            stationary_pattern: None,
            recent_changes: 0,
            lac: None,
            tac: Some(12_345),
            lac_tac_changed_without_cell_change: false,
            operator_changed: false,
            same_carrier_5g_handoff: false,
            mcc: Some("310".to_string()),
            mnc: Some("410".to_string()),
            suspicious_mcc_mnc: false,
            unrecognized_us_mnc: false,
            suspicious_cell_id: false,
        }
    }

    #[test]
    fn test_imsi_score_saturates_at_100() {
        let mut analysis = analysis_template();
        analysis.progressive_downgrade_to_2g = true;
        analysis.generation = NetworkGeneration::TwoG;
        analysis.generation_changed = true;
        analysis.downgraded_this_step = true;
        analysis.signal_dbm = -40;
        analysis.signal_spike = true;
        analysis.trust_score = 0;
        analysis.cell_changed = true;
        analysis.lac = Some(1);
        analysis.operator_changed = true;
        analysis.suspicious_cell_id = true;
        assert_eq!(imsi_catcher_score(&analysis), 100);
    }

    #[test]
    fn test_severity_mapping() {
        assert_eq!(severity_from_score(95), ThreatLevel::Critical);
        assert_eq!(severity_from_score(90), ThreatLevel::Critical);
        assert_eq!(severity_from_score(75), ThreatLevel::High);
        assert_eq!(severity_from_score(55), ThreatLevel::Medium);
        assert_eq!(severity_from_score(30), ThreatLevel::Low);
        assert_eq!(severity_from_score(29), ThreatLevel::Info);
    }

    #[test]
    fn test_quiet_analysis_scores_zero() {
        let analysis = analysis_template();
        assert_eq!(imsi_catcher_score(&analysis), 0);
        assert!(contributing_factors(&analysis).is_empty());
    }

    #[tokio::test]
    async fn test_classic_stingray_scenario() {
        let engine = engine();
        engine.set_min_anomaly_interval_ms(1_000);
        engine.start_monitoring().await;
        seed_trusted(&engine, 1_000_000, 20).await;

        // 5G -> 4G -> 3G -> 2G over 20 s, cell change on every step, final
        // step lands on LAC 1 with a strong spiking signal, stationary.
        let base = 1_000_000;
        engine.process_snapshot(snapshot(base, 1_000_000, "NR")).await;
        engine
            .process_snapshot(snapshot(base + 6_700, 1_000_001, "LTE"))
            .await;
        engine
            .process_snapshot(snapshot(base + 13_400, 1_000_002, "UMTS"))
            .await;
        let mut final_snap = snapshot(base + 20_000, 1_000_003, "GSM");
        final_snap.lac = Some(1);
        final_snap.tac = None;
        final_snap.signal_dbm = -50;
        engine.process_snapshot(final_snap).await;

        let anomaly = engine.anomalies().borrow().clone().expect("anomaly expected");
        assert_eq!(anomaly.anomaly_type, CellularAnomalyType::EncryptionDowngrade);
        assert_eq!(anomaly.threat_level, ThreatLevel::Critical);
        assert!(anomaly.imsi_score >= 90);
        assert!(anomaly
            .contributing_factors
            .iter()
            .any(|f| f == "Progressive downgrade to 2G (StingRay signature)"));
        assert!(anomaly
            .contributing_factors
            .iter()
            .any(|f| f == "Suspicious LAC value (1)"));
    }

    #[tokio::test]
    async fn test_quick_return_normalization_scenario() {
        let engine = engine();
        engine.start_monitoring().await;
        seed_trusted(&engine, 100, 20).await;
        seed_trusted(&engine, 200, 20).await;

        let base = 1_000_000;
        engine.process_snapshot(snapshot(base, 100, "LTE")).await;
        engine.process_snapshot(snapshot(base + 10_000, 200, "LTE")).await;
        engine.process_snapshot(snapshot(base + 40_000, 100, "LTE")).await;

        assert!(engine.anomalies().borrow().is_none());
        let timeline = engine.timeline.snapshot();
        assert!(timeline.iter().any(|e| e
            .title
            .contains("Quick return to original cell detected (likely network optimization)")));
    }

    #[tokio::test]
    async fn test_test_network_scenario() {
        let engine = engine();
        engine.start_monitoring().await;

        let mut snap = snapshot(1_000_000, 42, "LTE");
        snap.mcc = Some("001".to_string());
        snap.mnc = Some("01".to_string());
        engine.process_snapshot(snap).await;

        let anomaly = engine.anomalies().borrow().clone().expect("anomaly expected");
        assert_eq!(anomaly.anomaly_type, CellularAnomalyType::SuspiciousNetwork);
        assert_eq!(anomaly.threat_level, ThreatLevel::Critical);
        assert_eq!(anomaly.confidence, ThreatLevel::Critical);
        // Downgrade analysis was not consulted for this snapshot.
        assert!(!anomaly.analysis.downgraded_this_step);
    }

    #[tokio::test]
    async fn test_global_cooldown_blocks_second_emission() {
        let engine = engine();
        engine.start_monitoring().await;

        let mut first = snapshot(1_000_000, 42, "LTE");
        first.mcc = Some("001".to_string());
        first.mnc = Some("01".to_string());
        engine.process_snapshot(first).await;
        let first_id = engine.anomalies().borrow().clone().unwrap().id;

        // Ten seconds later, still inside the 30 s global cooldown.
        let mut second = snapshot(1_010_000, 43, "LTE");
        second.mcc = Some("001".to_string());
        second.mnc = Some("01".to_string());
        engine.process_snapshot(second).await;
        assert_eq!(engine.anomalies().borrow().clone().unwrap().id, first_id);
    }

    #[tokio::test]
    async fn test_lac_change_without_cell_change_scores() {
        let engine = engine();
        engine.start_monitoring().await;
        seed_trusted(&engine, 77, 20).await;

        let mut first = snapshot(1_000_000, 77, "GSM");
        first.lac = Some(5_000);
        first.tac = None;
        engine.process_snapshot(first).await;

        let mut second = snapshot(1_020_000, 77, "GSM");
        second.lac = Some(6_000);
        second.tac = None;
        engine.process_snapshot(second).await;

        // Weak 2G encryption plus the LAC change crosses the reporting gate.
        let events = engine.timeline.snapshot();
        let anomaly = engine.anomalies().borrow().clone();
        let seen = anomaly
            .map(|a| a.contributing_factors)
            .into_iter()
            .flatten()
            .chain(events.into_iter().map(|e| e.description))
            .any(|text| text.contains("LAC/TAC changed without cell change"));
        assert!(seen);
    }

    #[tokio::test]
    async fn test_stop_monitoring_is_idempotent_and_blocks_processing() {
        let engine = engine();
        engine.start_monitoring().await;
        engine.stop_monitoring().await;
        engine.stop_monitoring().await;
        engine.destroy().await;

        engine.process_snapshot(snapshot(1_000, 1, "NR")).await;
        assert!(engine.anomalies().borrow().is_none());
        assert!(engine.timeline.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_clear_sensitive_data_is_idempotent() {
        let engine = engine();
        engine.start_monitoring().await;
        engine.process_snapshot(snapshot(1_000, 1, "NR")).await;
        engine.clear_sensitive_data().await;
        let towers_after_first = engine.seen_cell_towers().borrow().clone();
        engine.clear_sensitive_data().await;
        assert_eq!(engine.seen_cell_towers().borrow().clone(), towers_after_first);
        assert!(engine.timeline.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_display_override_promotes_status_generation() {
        let engine = engine();
        engine.start_monitoring().await;
        engine.set_display_override(DisplayOverride::NrNsa).await;
        engine.process_snapshot(snapshot(1_000, 1, "LTE")).await;
        let status = engine.cell_status().borrow().clone();
        assert_eq!(status.display_generation.as_deref(), Some("5G"));
        assert_eq!(status.network_type.as_deref(), Some("LTE"));
    }

    #[tokio::test]
    async fn test_ephemeral_round_trip_repersists_trust() {
        let sink = Arc::new(InMemoryPersistenceSink::new());
        let timeline = Arc::new(EventTimeline::new(CELLULAR_TIMELINE_CAP));
        let persistence = PersistenceFacade::new(sink.clone());
        let engine = CellularAnomalyEngine::new(timeline, persistence);
        engine.start_monitoring().await;

        for i in 0..6 {
            engine
                .process_snapshot(snapshot(1_000_000 + i * 40_000, 5_555_777, "NR"))
                .await;
        }
        engine.set_ephemeral_mode(true).await;
        assert!(engine.persistence.snapshot_trusted_cells().await.is_empty());

        engine.set_ephemeral_mode(false).await;
        let trusted = engine.persistence.snapshot_trusted_cells().await;
        assert_eq!(trusted.len(), 1);
        assert!(trusted[0].seen_count >= 6);
    }
}
