//! # Event Timeline Module
//!
//! Bounded, newest-first event stream shared by both detection engines, plus
//! the anomaly rate limiter (per-type minimum interval and a global cooldown
//! across all types). The timeline imposes arrival order across engines and
//! never reorders.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

/// Severity attached to anomalies and timeline entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ThreatLevel {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl ThreatLevel {
    pub fn label(&self) -> &'static str {
        match self {
            ThreatLevel::Info => "INFO",
            ThreatLevel::Low => "LOW",
            ThreatLevel::Medium => "MEDIUM",
            ThreatLevel::High => "HIGH",
            ThreatLevel::Critical => "CRITICAL",
        }
    }
}

/// What kind of entry a timeline event is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimelineEventType {
    CellChange,
    Anomaly,
    /// Informational entry (below-threshold signal, normalization note).
    Note,
    PotentialBeacon,
    BeaconEnded,
    FalsePositive,
    MonitoringStarted,
    MonitoringStopped,
}

/// One timeline entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub timestamp_ms: i64,
    pub event_type: TimelineEventType,
    pub title: String,
    pub description: String,
    pub cell_id: Option<i64>,
    pub frequency_hz: Option<f32>,
    pub threat_level: Option<ThreatLevel>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl TimelineEvent {
    /// Bare entry with no cell, frequency, or location attached.
    pub fn new(
        timestamp_ms: i64,
        event_type: TimelineEventType,
        title: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            timestamp_ms,
            event_type,
            title: title.into(),
            description: description.into(),
            cell_id: None,
            frequency_hz: None,
            threat_level: None,
            latitude: None,
            longitude: None,
        }
    }

    pub fn with_cell(mut self, cell_id: Option<i64>) -> Self {
        self.cell_id = cell_id;
        self
    }

    pub fn with_frequency(mut self, frequency_hz: f32) -> Self {
        self.frequency_hz = Some(frequency_hz);
        self
    }

    pub fn with_threat(mut self, level: ThreatLevel) -> Self {
        self.threat_level = Some(level);
        self
    }

    pub fn with_location(mut self, lat: Option<f64>, lon: Option<f64>) -> Self {
        self.latitude = lat;
        self.longitude = lon;
        self
    }
}

/// Bounded newest-first event deque. Appends are O(1) amortized; the oldest
/// entry is dropped past the cap.
pub struct EventTimeline {
    events: Mutex<VecDeque<TimelineEvent>>,
    capacity: usize,
}

impl EventTimeline {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn append(&self, event: TimelineEvent) {
        let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        events.push_front(event);
        while events.len() > self.capacity {
            events.pop_back();
        }
    }

    /// Newest-first copy of the current entries.
    pub fn snapshot(&self) -> Vec<TimelineEvent> {
        let events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        events.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

/// Rate limiter enforcing a per-type minimum interval and a global cooldown
/// between any two anomaly emissions. The per-type map only sees `get` and
/// `put` under its lock.
pub struct AnomalyRateLimiter {
    last_by_type: Mutex<HashMap<String, i64>>,
    last_any_ms: AtomicI64,
    min_interval_ms: AtomicI64,
    global_cooldown_ms: AtomicI64,
}

impl AnomalyRateLimiter {
    /// `min_interval_ms` applies per anomaly type; the global cooldown is
    /// half of it by default.
    pub fn new(min_interval_ms: i64) -> Self {
        Self {
            last_by_type: Mutex::new(HashMap::new()),
            last_any_ms: AtomicI64::new(0),
            min_interval_ms: AtomicI64::new(min_interval_ms),
            global_cooldown_ms: AtomicI64::new(min_interval_ms / 2),
        }
    }

    /// Reconfigure the per-type interval; the global cooldown follows at half
    /// of it. Idempotent, takes effect on the next check.
    pub fn set_min_interval_ms(&self, min_interval_ms: i64) {
        self.min_interval_ms.store(min_interval_ms, Ordering::Relaxed);
        self.global_cooldown_ms
            .store(min_interval_ms / 2, Ordering::Relaxed);
    }

    /// Override the global cooldown, floored to half the per-type interval.
    pub fn set_global_cooldown_ms(&self, cooldown_ms: i64) {
        let floor = self.min_interval_ms.load(Ordering::Relaxed) / 2;
        self.global_cooldown_ms
            .store(cooldown_ms.max(floor), Ordering::Relaxed);
    }

    pub fn global_cooldown_ms(&self) -> i64 {
        self.global_cooldown_ms.load(Ordering::Relaxed)
    }

    /// True when the global cooldown currently suppresses all emissions.
    pub fn globally_suppressed(&self, now_ms: i64) -> bool {
        let last = self.last_any_ms.load(Ordering::Relaxed);
        last != 0 && now_ms - last < self.global_cooldown_ms.load(Ordering::Relaxed)
    }

    /// True when an anomaly of `kind` may be emitted at `now_ms`.
    pub fn allows(&self, kind: &str, now_ms: i64) -> bool {
        if self.globally_suppressed(now_ms) {
            return false;
        }
        let map = self.last_by_type.lock().unwrap_or_else(|e| e.into_inner());
        match map.get(kind) {
            Some(&last) => now_ms - last >= self.min_interval_ms.load(Ordering::Relaxed),
            None => true,
        }
    }

    /// Record an emission of `kind` at `now_ms`.
    pub fn record(&self, kind: &str, now_ms: i64) {
        let mut map = self.last_by_type.lock().unwrap_or_else(|e| e.into_inner());
        map.insert(kind.to_string(), now_ms);
        self.last_any_ms.store(now_ms, Ordering::Relaxed);
    }

    pub fn clear(&self) {
        self.last_by_type
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.last_any_ms.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note(ts: i64, title: &str) -> TimelineEvent {
        TimelineEvent::new(ts, TimelineEventType::Note, title, "")
    }

    #[test]
    fn test_timeline_is_newest_first_and_bounded() {
        let timeline = EventTimeline::new(3);
        for i in 0..5 {
            timeline.append(note(i, &format!("e{i}")));
        }
        let events = timeline.snapshot();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].title, "e4");
        assert_eq!(events[2].title, "e2");
    }

    #[test]
    fn test_timeline_clear() {
        let timeline = EventTimeline::new(10);
        timeline.append(note(1, "a"));
        assert!(!timeline.is_empty());
        timeline.clear();
        assert!(timeline.is_empty());
    }

    #[test]
    fn test_rate_limiter_per_type_interval() {
        let limiter = AnomalyRateLimiter::new(60_000);
        assert!(limiter.allows("CELL_CHANGE", 1_000));
        limiter.record("CELL_CHANGE", 1_000);
        // Same type blocked inside the interval.
        assert!(!limiter.allows("CELL_CHANGE", 40_000));
        assert!(limiter.allows("CELL_CHANGE", 61_001));
    }

    #[test]
    fn test_rate_limiter_global_cooldown_spans_types() {
        let limiter = AnomalyRateLimiter::new(60_000);
        limiter.record("CELL_CHANGE", 1_000);
        // Different type still inside the 30 s global cooldown.
        assert!(!limiter.allows("SIGNAL_SPIKE", 20_000));
        assert!(limiter.allows("SIGNAL_SPIKE", 31_001));
    }

    #[test]
    fn test_rate_limiter_cooldown_floor() {
        let limiter = AnomalyRateLimiter::new(10_000);
        limiter.set_global_cooldown_ms(1_000);
        // Floored to min_interval / 2.
        assert_eq!(limiter.global_cooldown_ms(), 5_000);
    }

    #[test]
    fn test_rate_limiter_clear_resets_state() {
        let limiter = AnomalyRateLimiter::new(60_000);
        limiter.record("X", 1_000);
        limiter.clear();
        assert!(limiter.allows("X", 1_001));
    }
}
