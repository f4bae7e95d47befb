//! # Cell History Module
//!
//! Bounded time-ordered rings backing the cellular pattern analysis: the raw
//! snapshot history, the stationary-change ring with quick-return and
//! oscillation detection, and the network-generation downgrade chain. The
//! owning engine takes a snapshot of the ring before analysis so no lock is
//! held while scoring.

use crate::telephony::{CellSnapshot, NetworkGeneration};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};

/// Snapshots retained in the history ring.
const HISTORY_CAPACITY: usize = 100;

/// Stationary-change entries retained.
const STATIONARY_RING_CAPACITY: usize = 20;

/// Stationary-change entries and downgrade-chain entries older than this are
/// pruned on every update.
const PATTERN_WINDOW_MS: i64 = 5 * 60 * 1_000;

/// A change back to a cell seen this recently counts as a quick return.
const QUICK_RETURN_MS: i64 = 60 * 1_000;

/// Cell changes per minute considered rapid while stationary.
pub const RAPID_SWITCH_PER_MIN_STATIONARY: usize = 5;

/// Cell changes per minute considered rapid while moving.
pub const RAPID_SWITCH_PER_MIN_MOVING: usize = 12;

/// Time-ordered ring of the most recent cell snapshots.
#[derive(Debug, Default)]
pub struct CellHistory {
    snapshots: VecDeque<CellSnapshot>,
}

impl CellHistory {
    pub fn new() -> Self {
        Self {
            snapshots: VecDeque::with_capacity(HISTORY_CAPACITY),
        }
    }

    /// Insert a snapshot, keeping the ring time-ordered and bounded.
    pub fn record(&mut self, snapshot: CellSnapshot) {
        let pos = self
            .snapshots
            .iter()
            .rposition(|s| s.timestamp_ms <= snapshot.timestamp_ms)
            .map(|p| p + 1)
            .unwrap_or(0);
        self.snapshots.insert(pos, snapshot);
        while self.snapshots.len() > HISTORY_CAPACITY {
            self.snapshots.pop_front();
        }
    }

    /// Adjacent-pair cell-id differences among snapshots newer than the
    /// cutoff.
    pub fn recent_cell_changes(&self, window_ms: i64, now_ms: i64) -> usize {
        let cutoff = now_ms - window_ms;
        let recent: Vec<&CellSnapshot> = self
            .snapshots
            .iter()
            .filter(|s| s.timestamp_ms >= cutoff)
            .collect();
        recent
            .windows(2)
            .filter(|pair| pair[0].cell_id != pair[1].cell_id)
            .count()
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn latest(&self) -> Option<&CellSnapshot> {
        self.snapshots.back()
    }

    pub fn snapshot(&self) -> Vec<CellSnapshot> {
        self.snapshots.iter().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.snapshots.clear();
    }
}

/// One cell change observed while the device was stationary.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StationaryCellChangeEvent {
    pub timestamp_ms: i64,
    pub from_cell_id: i64,
    pub to_cell_id: i64,
    pub returned_to_original: bool,
}

/// Outcome of the stationary-change pattern analysis.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StationaryPatternResult {
    pub recent_changes_count: usize,
    pub is_quick_return: bool,
    pub is_oscillating: bool,
    pub unique_cells_count: usize,
    pub time_since_first_change_ms: i64,
}

/// Ring of stationary cell changes with pattern queries.
#[derive(Debug, Default)]
pub struct StationaryChangeTracker {
    events: VecDeque<StationaryCellChangeEvent>,
}

impl StationaryChangeTracker {
    pub fn new() -> Self {
        Self {
            events: VecDeque::with_capacity(STATIONARY_RING_CAPACITY),
        }
    }

    fn prune(&mut self, now_ms: i64) {
        let cutoff = now_ms - PATTERN_WINDOW_MS;
        while let Some(front) = self.events.front() {
            if front.timestamp_ms < cutoff {
                self.events.pop_front();
            } else {
                break;
            }
        }
    }

    /// Record a stationary change, marking whether it revisits a cell already
    /// involved in a recent change.
    pub fn track(&mut self, from_cell_id: i64, to_cell_id: i64, now_ms: i64) {
        self.prune(now_ms);
        let returned_to_original = self
            .events
            .iter()
            .any(|e| e.from_cell_id == to_cell_id || e.to_cell_id == from_cell_id);
        self.events.push_back(StationaryCellChangeEvent {
            timestamp_ms: now_ms,
            from_cell_id,
            to_cell_id,
            returned_to_original,
        });
        while self.events.len() > STATIONARY_RING_CAPACITY {
            self.events.pop_front();
        }
    }

    /// Pattern summary for the change `from -> to` at `now_ms`. Call after
    /// [`track`](Self::track) so the current change is included.
    pub fn analyze(&mut self, from_cell_id: i64, now_ms: i64) -> StationaryPatternResult {
        self.prune(now_ms);

        let recent_changes_count = self.events.len();
        let is_quick_return = self.events.iter().any(|e| {
            e.to_cell_id == from_cell_id
                && e.timestamp_ms < now_ms
                && now_ms - e.timestamp_ms <= QUICK_RETURN_MS
        });

        let mut unique_cells: HashSet<i64> = HashSet::new();
        for e in &self.events {
            unique_cells.insert(e.from_cell_id);
            unique_cells.insert(e.to_cell_id);
        }
        let returns = self.events.iter().filter(|e| e.returned_to_original).count();
        let is_oscillating = unique_cells.len() <= 3
            && recent_changes_count >= 3
            && returns * 2 >= recent_changes_count;

        let time_since_first_change_ms = self
            .events
            .front()
            .map(|e| now_ms - e.timestamp_ms)
            .unwrap_or(0);

        StationaryPatternResult {
            recent_changes_count,
            is_quick_return,
            is_oscillating,
            unique_cells_count: unique_cells.len(),
            time_since_first_change_ms,
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }
}

/// Rolling window of network-generation transitions. Only changes against the
/// tail are appended, so the ring reads as the actual transition chain.
#[derive(Debug, Default)]
pub struct DowngradeChainTracker {
    entries: VecDeque<(i64, NetworkGeneration)>,
}

/// Transitions retained in the chain.
const CHAIN_CAPACITY: usize = 20;

impl DowngradeChainTracker {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::with_capacity(CHAIN_CAPACITY),
        }
    }

    /// Record the current generation; appends only when it differs from the
    /// chain tail. Prunes entries older than the pattern window.
    pub fn record(&mut self, generation: NetworkGeneration, now_ms: i64) {
        let cutoff = now_ms - PATTERN_WINDOW_MS;
        while let Some(&(ts, _)) = self.entries.front() {
            if ts < cutoff {
                self.entries.pop_front();
            } else {
                break;
            }
        }

        if self.entries.back().map(|&(_, g)| g) != Some(generation) {
            self.entries.push_back((now_ms, generation));
            while self.entries.len() > CHAIN_CAPACITY {
                self.entries.pop_front();
            }
        }
    }

    /// Generations of the current chain, oldest first.
    pub fn recent_chain(&self) -> Vec<NetworkGeneration> {
        self.entries.iter().map(|&(_, g)| g).collect()
    }

    /// True for a chain of length >= 2 that is monotone non-increasing in
    /// generation rank and ends at 2G — the classic coercion signature.
    pub fn is_progressive_downgrade_to_2g(&self) -> bool {
        if self.entries.len() < 2 {
            return false;
        }
        let ranks: Vec<u8> = self.entries.iter().map(|&(_, g)| g.rank()).collect();
        let monotone = ranks.windows(2).all(|w| w[1] <= w[0]);
        monotone && self.entries.back().map(|&(_, g)| g) == Some(NetworkGeneration::TwoG)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(ts: i64, cell_id: i64) -> CellSnapshot {
        CellSnapshot {
            timestamp_ms: ts,
            cell_id: Some(cell_id),
            lac: None,
            tac: None,
            mcc: None,
            mnc: None,
            signal_dbm: -90,
            network_type: "LTE".to_string(),
            latitude: None,
            longitude: None,
        }
    }

    #[test]
    fn test_history_bounded_and_time_ordered() {
        let mut history = CellHistory::new();
        for i in 0..120 {
            history.record(snap(i * 1_000, i));
        }
        assert_eq!(history.len(), 100);

        // Out-of-order insert lands in timestamp position.
        history.record(snap(50_500, 999));
        let all = history.snapshot();
        assert!(all.windows(2).all(|w| w[0].timestamp_ms <= w[1].timestamp_ms));
    }

    #[test]
    fn test_recent_cell_changes_counts_adjacent_differences() {
        let mut history = CellHistory::new();
        history.record(snap(0, 1));
        history.record(snap(10_000, 1));
        history.record(snap(20_000, 2));
        history.record(snap(30_000, 3));
        history.record(snap(40_000, 3));
        assert_eq!(history.recent_cell_changes(60_000, 45_000), 2);
        // Narrow window only sees the last pair.
        assert_eq!(history.recent_cell_changes(16_000, 45_000), 0);
    }

    #[test]
    fn test_quick_return_detection() {
        let mut tracker = StationaryChangeTracker::new();
        tracker.track(100, 200, 10_000);
        tracker.track(200, 100, 40_000);
        // The change back to 100 sees 100 as a prior `from`.
        let pattern = tracker.analyze(200, 40_000);
        assert!(pattern.is_quick_return);
    }

    #[test]
    fn test_quick_return_expires_after_a_minute() {
        let mut tracker = StationaryChangeTracker::new();
        tracker.track(100, 200, 10_000);
        tracker.track(200, 100, 100_000);
        let pattern = tracker.analyze(200, 100_000);
        assert!(!pattern.is_quick_return);
    }

    #[test]
    fn test_oscillation_between_two_cells() {
        let mut tracker = StationaryChangeTracker::new();
        tracker.track(1, 2, 10_000);
        tracker.track(2, 1, 20_000);
        tracker.track(1, 2, 30_000);
        tracker.track(2, 1, 40_000);
        let pattern = tracker.analyze(2, 40_000);
        assert!(pattern.is_oscillating);
        assert_eq!(pattern.unique_cells_count, 2);
        assert_eq!(pattern.recent_changes_count, 4);
        assert_eq!(pattern.time_since_first_change_ms, 30_000);
    }

    #[test]
    fn test_stationary_ring_prunes_and_bounds() {
        let mut tracker = StationaryChangeTracker::new();
        tracker.track(1, 2, 0);
        // Six minutes later the old entry is pruned.
        tracker.track(3, 4, 6 * 60 * 1_000);
        assert_eq!(tracker.len(), 1);

        for i in 0..30 {
            tracker.track(i, i + 1, 6 * 60 * 1_000 + i);
        }
        assert!(tracker.len() <= 20);
    }

    #[test]
    fn test_downgrade_chain_appends_only_on_change() {
        let mut chain = DowngradeChainTracker::new();
        chain.record(NetworkGeneration::FiveG, 1_000);
        chain.record(NetworkGeneration::FiveG, 2_000);
        chain.record(NetworkGeneration::FourG, 3_000);
        assert_eq!(
            chain.recent_chain(),
            vec![NetworkGeneration::FiveG, NetworkGeneration::FourG]
        );
    }

    #[test]
    fn test_progressive_downgrade_signature() {
        let mut chain = DowngradeChainTracker::new();
        chain.record(NetworkGeneration::FiveG, 1_000);
        chain.record(NetworkGeneration::FourG, 2_000);
        chain.record(NetworkGeneration::ThreeG, 3_000);
        chain.record(NetworkGeneration::TwoG, 4_000);
        assert!(chain.is_progressive_downgrade_to_2g());

        // An upgrade in the middle breaks the signature.
        let mut chain = DowngradeChainTracker::new();
        chain.record(NetworkGeneration::FourG, 1_000);
        chain.record(NetworkGeneration::FiveG, 2_000);
        chain.record(NetworkGeneration::TwoG, 3_000);
        assert!(!chain.is_progressive_downgrade_to_2g());

        // A chain not ending at 2G is not the signature.
        let mut chain = DowngradeChainTracker::new();
        chain.record(NetworkGeneration::FiveG, 1_000);
        chain.record(NetworkGeneration::ThreeG, 2_000);
        assert!(!chain.is_progressive_downgrade_to_2g());
    }

    #[test]
    fn test_downgrade_chain_prunes_old_entries() {
        let mut chain = DowngradeChainTracker::new();
        chain.record(NetworkGeneration::FiveG, 0);
        chain.record(NetworkGeneration::TwoG, 10 * 60 * 1_000);
        // The 5G entry aged out; a single 2G entry is not a chain.
        assert!(!chain.is_progressive_downgrade_to_2g());
        assert_eq!(chain.recent_chain(), vec![NetworkGeneration::TwoG]);
    }
}
