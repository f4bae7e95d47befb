//! # Persistence Module
//!
//! Boundary between the engines and whatever store the host platform
//! provides. Engines only ever talk to [`PersistenceFacade`], which runs sink
//! calls on the blocking I/O pool, swallows (and logs) store errors — the
//! in-memory tables are the source of truth — and honors ephemeral mode.
//! A no-op sink serves ephemeral deployments and tests; the in-memory sink
//! backs integration tests and the ephemeral round-trip re-persist.

use crate::timeline::TimelineEvent;
use crate::trust::TrustedCellInfo;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::warn;

/// Events kept in the persisted store after a trim.
pub const PERSISTED_EVENT_KEEP: usize = 200;

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("Serialization failed: {0}")]
    Serialization(String),
    #[error("Write failed: {0}")]
    WriteFailed(String),
}

/// A cell tower the device has observed. Shape preserved across versions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeenCellTowerEntity {
    pub cell_id: String,
    pub operator: Option<String>,
    pub network_type: String,
    pub signal_dbm: i32,
    pub first_seen_ms: i64,
    pub last_seen_ms: i64,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

/// Persisted trust-model row. Locations travel as a JSON array of
/// `[lat, lon]` pairs so the column stays schema-stable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrustedCellEntity {
    pub cell_id: String,
    pub seen_count: u32,
    pub first_seen_ms: i64,
    pub last_seen_ms: i64,
    pub locations_json: String,
    pub operator: Option<String>,
    pub network_type: String,
}

impl TrustedCellEntity {
    pub fn from_info(info: &TrustedCellInfo) -> Result<Self, PersistenceError> {
        let locations_json = serde_json::to_string(&info.locations)
            .map_err(|e| PersistenceError::Serialization(e.to_string()))?;
        Ok(Self {
            cell_id: info.cell_id.clone(),
            seen_count: info.seen_count,
            first_seen_ms: info.first_seen_ms,
            last_seen_ms: info.last_seen_ms,
            locations_json,
            operator: info.operator.clone(),
            network_type: info.network_type.clone(),
        })
    }

    pub fn into_info(self) -> Result<TrustedCellInfo, PersistenceError> {
        let locations: Vec<(f64, f64)> = serde_json::from_str(&self.locations_json)
            .map_err(|e| PersistenceError::Serialization(e.to_string()))?;
        Ok(TrustedCellInfo {
            cell_id: self.cell_id,
            seen_count: self.seen_count,
            first_seen_ms: self.first_seen_ms,
            last_seen_ms: self.last_seen_ms,
            locations,
            operator: self.operator,
            network_type: self.network_type,
        })
    }
}

/// Persisted timeline row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellularEventEntity {
    pub timestamp_ms: i64,
    pub event_type: String,
    pub title: String,
    pub description: String,
    pub cell_id: Option<i64>,
    pub threat_level: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl CellularEventEntity {
    pub fn from_event(event: &TimelineEvent) -> Self {
        Self {
            timestamp_ms: event.timestamp_ms,
            event_type: format!("{:?}", event.event_type),
            title: event.title.clone(),
            description: event.description.clone(),
            cell_id: event.cell_id,
            threat_level: event.threat_level.map(|t| t.label().to_string()),
            latitude: event.latitude,
            longitude: event.longitude,
        }
    }
}

/// Store operations the engines need. Implementations may block; the facade
/// dispatches every call onto the blocking I/O pool.
pub trait PersistenceSink: Send + Sync {
    fn upsert_seen_cell(&self, entity: SeenCellTowerEntity) -> Result<(), PersistenceError>;
    fn upsert_trusted_cell(&self, entity: TrustedCellEntity) -> Result<(), PersistenceError>;
    fn insert_event(&self, entity: CellularEventEntity) -> Result<(), PersistenceError>;
    /// Drop all but the newest `keep` events.
    fn trim_events(&self, keep: usize) -> Result<(), PersistenceError>;
    fn delete_all_seen_cells(&self) -> Result<(), PersistenceError>;
    fn delete_all_trusted_cells(&self) -> Result<(), PersistenceError>;
    fn delete_all_events(&self) -> Result<(), PersistenceError>;
    fn snapshot_seen_cells(&self) -> Result<Vec<SeenCellTowerEntity>, PersistenceError>;
    fn snapshot_trusted_cells(&self) -> Result<Vec<TrustedCellEntity>, PersistenceError>;
    fn snapshot_events(&self) -> Result<Vec<CellularEventEntity>, PersistenceError>;
}

/// Sink that stores nothing. Used in ephemeral deployments and unit tests.
#[derive(Debug, Default)]
pub struct NoopPersistenceSink;

impl PersistenceSink for NoopPersistenceSink {
    fn upsert_seen_cell(&self, _: SeenCellTowerEntity) -> Result<(), PersistenceError> {
        Ok(())
    }
    fn upsert_trusted_cell(&self, _: TrustedCellEntity) -> Result<(), PersistenceError> {
        Ok(())
    }
    fn insert_event(&self, _: CellularEventEntity) -> Result<(), PersistenceError> {
        Ok(())
    }
    fn trim_events(&self, _: usize) -> Result<(), PersistenceError> {
        Ok(())
    }
    fn delete_all_seen_cells(&self) -> Result<(), PersistenceError> {
        Ok(())
    }
    fn delete_all_trusted_cells(&self) -> Result<(), PersistenceError> {
        Ok(())
    }
    fn delete_all_events(&self) -> Result<(), PersistenceError> {
        Ok(())
    }
    fn snapshot_seen_cells(&self) -> Result<Vec<SeenCellTowerEntity>, PersistenceError> {
        Ok(Vec::new())
    }
    fn snapshot_trusted_cells(&self) -> Result<Vec<TrustedCellEntity>, PersistenceError> {
        Ok(Vec::new())
    }
    fn snapshot_events(&self) -> Result<Vec<CellularEventEntity>, PersistenceError> {
        Ok(Vec::new())
    }
}

/// Sink backed by in-process maps. Keyed upserts; events appended in arrival
/// order.
#[derive(Debug, Default)]
pub struct InMemoryPersistenceSink {
    seen_cells: Mutex<HashMap<String, SeenCellTowerEntity>>,
    trusted_cells: Mutex<HashMap<String, TrustedCellEntity>>,
    events: Mutex<Vec<CellularEventEntity>>,
}

impl InMemoryPersistenceSink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PersistenceSink for InMemoryPersistenceSink {
    fn upsert_seen_cell(&self, entity: SeenCellTowerEntity) -> Result<(), PersistenceError> {
        self.seen_cells
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(entity.cell_id.clone(), entity);
        Ok(())
    }

    fn upsert_trusted_cell(&self, entity: TrustedCellEntity) -> Result<(), PersistenceError> {
        self.trusted_cells
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(entity.cell_id.clone(), entity);
        Ok(())
    }

    fn insert_event(&self, entity: CellularEventEntity) -> Result<(), PersistenceError> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(entity);
        Ok(())
    }

    fn trim_events(&self, keep: usize) -> Result<(), PersistenceError> {
        let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        if events.len() > keep {
            events.sort_by_key(|e| e.timestamp_ms);
            let excess = events.len() - keep;
            events.drain(..excess);
        }
        Ok(())
    }

    fn delete_all_seen_cells(&self) -> Result<(), PersistenceError> {
        self.seen_cells
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        Ok(())
    }

    fn delete_all_trusted_cells(&self) -> Result<(), PersistenceError> {
        self.trusted_cells
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        Ok(())
    }

    fn delete_all_events(&self) -> Result<(), PersistenceError> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        Ok(())
    }

    fn snapshot_seen_cells(&self) -> Result<Vec<SeenCellTowerEntity>, PersistenceError> {
        Ok(self
            .seen_cells
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect())
    }

    fn snapshot_trusted_cells(&self) -> Result<Vec<TrustedCellEntity>, PersistenceError> {
        Ok(self
            .trusted_cells
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect())
    }

    fn snapshot_events(&self) -> Result<Vec<CellularEventEntity>, PersistenceError> {
        Ok(self
            .events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone())
    }
}

/// Result of an ephemeral-mode toggle, so the engines know whether to
/// re-persist their in-memory tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EphemeralTransition {
    Unchanged,
    /// Just enabled: the store was purged.
    Enabled,
    /// Just disabled: callers should re-persist current in-memory state.
    Disabled,
}

/// Async facade over a [`PersistenceSink`]. Write errors are logged and
/// swallowed; ephemeral mode turns writes into no-ops.
#[derive(Clone)]
pub struct PersistenceFacade {
    sink: Arc<dyn PersistenceSink>,
    ephemeral: Arc<AtomicBool>,
}

impl PersistenceFacade {
    pub fn new(sink: Arc<dyn PersistenceSink>) -> Self {
        Self {
            sink,
            ephemeral: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn noop() -> Self {
        Self::new(Arc::new(NoopPersistenceSink))
    }

    pub fn is_ephemeral(&self) -> bool {
        self.ephemeral.load(Ordering::Relaxed)
    }

    /// Toggle ephemeral mode. Enabling purges the store immediately.
    /// Idempotent: re-setting the current mode reports `Unchanged`.
    pub async fn set_ephemeral(&self, enabled: bool) -> EphemeralTransition {
        let previous = self.ephemeral.swap(enabled, Ordering::Relaxed);
        match (previous, enabled) {
            (false, true) => {
                self.purge_all().await;
                EphemeralTransition::Enabled
            }
            (true, false) => EphemeralTransition::Disabled,
            _ => EphemeralTransition::Unchanged,
        }
    }

    async fn run<T, F>(&self, op: &'static str, f: F) -> Option<T>
    where
        T: Send + 'static,
        F: FnOnce(Arc<dyn PersistenceSink>) -> Result<T, PersistenceError> + Send + 'static,
    {
        let sink = Arc::clone(&self.sink);
        match tokio::task::spawn_blocking(move || f(sink)).await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(e)) => {
                warn!(op, error = %e, "persistence operation failed; in-memory state remains authoritative");
                None
            }
            Err(e) => {
                warn!(op, error = %e, "persistence task panicked");
                None
            }
        }
    }

    pub async fn insert_seen_cell(&self, entity: SeenCellTowerEntity) {
        if self.is_ephemeral() {
            return;
        }
        self.run("upsert_seen_cell", move |sink| sink.upsert_seen_cell(entity))
            .await;
    }

    pub async fn insert_trusted_cell(&self, entity: TrustedCellEntity) {
        if self.is_ephemeral() {
            return;
        }
        self.run("upsert_trusted_cell", move |sink| {
            sink.upsert_trusted_cell(entity)
        })
        .await;
    }

    pub async fn insert_event(&self, entity: CellularEventEntity) {
        if self.is_ephemeral() {
            return;
        }
        self.run("insert_event", move |sink| sink.insert_event(entity))
            .await;
    }

    pub async fn trim_events(&self, keep: usize) {
        if self.is_ephemeral() {
            return;
        }
        self.run("trim_events", move |sink| sink.trim_events(keep))
            .await;
    }

    /// Delete everything, regardless of ephemeral mode.
    pub async fn purge_all(&self) {
        self.run("purge_all", |sink| {
            sink.delete_all_seen_cells()?;
            sink.delete_all_trusted_cells()?;
            sink.delete_all_events()
        })
        .await;
    }

    pub async fn snapshot_seen_cells(&self) -> Vec<SeenCellTowerEntity> {
        self.run("snapshot_seen_cells", |sink| sink.snapshot_seen_cells())
            .await
            .unwrap_or_default()
    }

    pub async fn snapshot_trusted_cells(&self) -> Vec<TrustedCellEntity> {
        self.run("snapshot_trusted_cells", |sink| sink.snapshot_trusted_cells())
            .await
            .unwrap_or_default()
    }

    pub async fn snapshot_events(&self) -> Vec<CellularEventEntity> {
        self.run("snapshot_events", |sink| sink.snapshot_events())
            .await
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seen(cell_id: &str, ts: i64) -> SeenCellTowerEntity {
        SeenCellTowerEntity {
            cell_id: cell_id.to_string(),
            operator: Some("310-260".to_string()),
            network_type: "NR".to_string(),
            signal_dbm: -85,
            first_seen_ms: ts,
            last_seen_ms: ts,
            latitude: None,
            longitude: None,
        }
    }

    fn event(ts: i64) -> CellularEventEntity {
        CellularEventEntity {
            timestamp_ms: ts,
            event_type: "Note".to_string(),
            title: format!("event {ts}"),
            description: String::new(),
            cell_id: None,
            threat_level: None,
            latitude: None,
            longitude: None,
        }
    }

    #[tokio::test]
    async fn test_upserts_are_keyed() {
        let facade = PersistenceFacade::new(Arc::new(InMemoryPersistenceSink::new()));
        facade.insert_seen_cell(seen("100", 1)).await;
        facade.insert_seen_cell(seen("100", 2)).await;
        facade.insert_seen_cell(seen("200", 3)).await;
        assert_eq!(facade.snapshot_seen_cells().await.len(), 2);
    }

    #[tokio::test]
    async fn test_trim_keeps_newest_events() {
        let facade = PersistenceFacade::new(Arc::new(InMemoryPersistenceSink::new()));
        for ts in 0..10 {
            facade.insert_event(event(ts)).await;
        }
        facade.trim_events(3).await;
        let events = facade.snapshot_events().await;
        assert_eq!(events.len(), 3);
        assert!(events.iter().all(|e| e.timestamp_ms >= 7));
    }

    #[tokio::test]
    async fn test_ephemeral_writes_are_noops_and_enable_purges() {
        let facade = PersistenceFacade::new(Arc::new(InMemoryPersistenceSink::new()));
        facade.insert_seen_cell(seen("100", 1)).await;

        assert_eq!(
            facade.set_ephemeral(true).await,
            EphemeralTransition::Enabled
        );
        // Purged on enable, and new writes go nowhere.
        facade.insert_seen_cell(seen("200", 2)).await;
        assert!(facade.snapshot_seen_cells().await.is_empty());

        // Idempotent re-set.
        assert_eq!(
            facade.set_ephemeral(true).await,
            EphemeralTransition::Unchanged
        );
        assert_eq!(
            facade.set_ephemeral(false).await,
            EphemeralTransition::Disabled
        );
        facade.insert_seen_cell(seen("300", 3)).await;
        assert_eq!(facade.snapshot_seen_cells().await.len(), 1);
    }

    #[tokio::test]
    async fn test_trusted_cell_entity_round_trip() {
        use crate::trust::TrustedCellInfo;
        let info = TrustedCellInfo {
            cell_id: "12345".to_string(),
            seen_count: 7,
            first_seen_ms: 100,
            last_seen_ms: 900,
            locations: vec![(40.7128, -74.0060), (40.7130, -74.0058)],
            operator: Some("310-260".to_string()),
            network_type: "NR".to_string(),
        };
        let entity = TrustedCellEntity::from_info(&info).unwrap();
        // Locations travel as a JSON array of pairs.
        assert!(entity.locations_json.starts_with('['));
        let back = entity.into_info().unwrap();
        assert_eq!(back, info);
    }
}
