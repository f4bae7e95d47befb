//! # Trust Model Module
//!
//! Per-cell sighting history used to tell long-lived legitimate towers apart
//! from transient simulators. Keyed by stringified cell id so 5G NCI values
//! and legacy 32-bit ids share one table. The owning engine guards the whole
//! model behind its own lock.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Sightings required before a cell counts as trusted.
pub const TRUSTED_SEEN_COUNT: u32 = 5;

/// Locations kept per cell.
const MAX_LOCATIONS_PER_CELL: usize = 10;

/// Half-side of the familiar-area square, in degrees (~200 m).
const FAMILIAR_AREA_DEGREES: f64 = 0.002;

/// Trusted cells within range required for a familiar-area match.
const FAMILIAR_AREA_MIN_CELLS: usize = 2;

/// Everything the model remembers about one cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrustedCellInfo {
    pub cell_id: String,
    pub seen_count: u32,
    pub first_seen_ms: i64,
    pub last_seen_ms: i64,
    /// (lat, lon) pairs, oldest first, capped at 10.
    pub locations: Vec<(f64, f64)>,
    pub operator: Option<String>,
    pub network_type: String,
}

impl TrustedCellInfo {
    pub fn is_trusted(&self) -> bool {
        self.seen_count >= TRUSTED_SEEN_COUNT
    }
}

/// Seen-count based trust table over all observed cells.
#[derive(Debug, Default)]
pub struct CellTrustModel {
    cells: HashMap<String, TrustedCellInfo>,
}

impl CellTrustModel {
    pub fn new() -> Self {
        Self {
            cells: HashMap::new(),
        }
    }

    /// Record a sighting of `cell_id`, updating last-seen and the bounded
    /// location list.
    pub fn observe(
        &mut self,
        cell_id: i64,
        operator: Option<&str>,
        network_type: &str,
        location: Option<(f64, f64)>,
        now_ms: i64,
    ) {
        let key = cell_id.to_string();
        let entry = self.cells.entry(key.clone()).or_insert_with(|| TrustedCellInfo {
            cell_id: key,
            seen_count: 0,
            first_seen_ms: now_ms,
            last_seen_ms: now_ms,
            locations: Vec::new(),
            operator: operator.map(str::to_string),
            network_type: network_type.to_string(),
        });

        entry.seen_count = entry.seen_count.saturating_add(1);
        entry.last_seen_ms = now_ms;
        entry.network_type = network_type.to_string();
        if let Some(op) = operator {
            entry.operator = Some(op.to_string());
        }
        if let Some(loc) = location {
            entry.locations.push(loc);
            if entry.locations.len() > MAX_LOCATIONS_PER_CELL {
                entry.locations.remove(0);
            }
        }
    }

    pub fn get(&self, cell_id: i64) -> Option<&TrustedCellInfo> {
        self.cells.get(&cell_id.to_string())
    }

    pub fn is_trusted(&self, cell_id: i64) -> bool {
        self.get(cell_id).map(TrustedCellInfo::is_trusted).unwrap_or(false)
    }

    /// Bucketed trust score 0..=100 from the sighting count.
    pub fn trust_score(&self, cell_id: i64) -> u8 {
        match self.get(cell_id) {
            Some(info) => match info.seen_count {
                c if c >= 20 => 100,
                c if c >= 10 => 80,
                c if c >= 5 => 60,
                c if c >= 2 => 30,
                _ => 10,
            },
            None => 0,
        }
    }

    /// True when at least two trusted cells have a historical location within
    /// ~200 m of the query point.
    pub fn is_in_familiar_area(&self, lat: f64, lon: f64) -> bool {
        let nearby_trusted = self
            .cells
            .values()
            .filter(|info| info.is_trusted())
            .filter(|info| {
                info.locations.iter().any(|(cell_lat, cell_lon)| {
                    (cell_lat - lat).abs() <= FAMILIAR_AREA_DEGREES
                        && (cell_lon - lon).abs() <= FAMILIAR_AREA_DEGREES
                })
            })
            .count();
        nearby_trusted >= FAMILIAR_AREA_MIN_CELLS
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Copy of the current table, for persistence and the seen-towers stream.
    pub fn snapshot(&self) -> Vec<TrustedCellInfo> {
        self.cells.values().cloned().collect()
    }

    /// Bulk load from persisted entries, replacing the current table.
    pub fn restore(&mut self, entries: Vec<TrustedCellInfo>) {
        self.cells = entries
            .into_iter()
            .map(|info| (info.cell_id.clone(), info))
            .collect();
    }

    pub fn clear(&mut self) {
        self.cells.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observe_n(model: &mut CellTrustModel, cell_id: i64, n: u32) {
        for i in 0..n {
            model.observe(cell_id, Some("310260"), "NR", None, 1_000 + i as i64);
        }
    }

    #[test]
    fn test_trust_score_buckets() {
        let mut model = CellTrustModel::new();
        assert_eq!(model.trust_score(42), 0);
        observe_n(&mut model, 42, 1);
        assert_eq!(model.trust_score(42), 10);
        observe_n(&mut model, 42, 1);
        assert_eq!(model.trust_score(42), 30);
        observe_n(&mut model, 42, 3);
        assert_eq!(model.trust_score(42), 60);
        observe_n(&mut model, 42, 5);
        assert_eq!(model.trust_score(42), 80);
        observe_n(&mut model, 42, 10);
        assert_eq!(model.trust_score(42), 100);
    }

    #[test]
    fn test_trusted_at_five_sightings() {
        let mut model = CellTrustModel::new();
        observe_n(&mut model, 7, 4);
        assert!(!model.is_trusted(7));
        observe_n(&mut model, 7, 1);
        assert!(model.is_trusted(7));
    }

    #[test]
    fn test_location_list_bounded_and_ordered() {
        let mut model = CellTrustModel::new();
        for i in 0..15 {
            model.observe(9, None, "LTE", Some((40.0 + i as f64 * 0.001, -74.0)), i);
        }
        let info = model.get(9).unwrap();
        assert_eq!(info.locations.len(), 10);
        assert!(info.seen_count >= info.locations.len() as u32);
        // Oldest entries were evicted from the front.
        assert_eq!(info.locations[0].0, 40.005);
        assert!(info.first_seen_ms <= info.last_seen_ms);
    }

    #[test]
    fn test_familiar_area_requires_two_trusted_cells() {
        let mut model = CellTrustModel::new();
        for i in 0..5 {
            model.observe(1, None, "NR", Some((40.7128, -74.0060)), i);
        }
        // One trusted cell nearby is not enough.
        assert!(!model.is_in_familiar_area(40.7128, -74.0060));
        for i in 0..5 {
            model.observe(2, None, "LTE", Some((40.7130, -74.0062)), i);
        }
        assert!(model.is_in_familiar_area(40.7128, -74.0060));
        // Far away from both.
        assert!(!model.is_in_familiar_area(40.80, -74.0060));
    }

    #[test]
    fn test_untrusted_cells_do_not_count_toward_familiar_area() {
        let mut model = CellTrustModel::new();
        for cell in [1, 2, 3] {
            model.observe(cell, None, "LTE", Some((40.0, -74.0)), 0);
        }
        assert!(!model.is_in_familiar_area(40.0, -74.0));
    }

    #[test]
    fn test_snapshot_restore_round_trip() {
        let mut model = CellTrustModel::new();
        for i in 0..6 {
            model.observe(5, Some("310260"), "NR", Some((40.0, -74.0 + i as f64 * 0.0001)), i);
        }
        let snapshot = model.snapshot();

        let mut restored = CellTrustModel::new();
        restored.restore(snapshot.clone());
        assert_eq!(restored.get(5), model.get(5));

        // Serde round-trip preserves all fields including location order.
        let json = serde_json::to_string(&snapshot[0]).unwrap();
        let back: TrustedCellInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(back, snapshot[0]);
    }
}
