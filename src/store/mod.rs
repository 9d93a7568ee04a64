//! Realtime state storage. Everything the pipeline persists per fix goes
//! through [`RealtimeStore`] so the in-process store can be swapped for a
//! networked one without touching the engine or the fan-out layer.

pub mod memory;

pub use memory::MemoryStore;

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::broadcast;
use utoipa::ToSchema;

use crate::models::{is_valid_id, Direction, VehicleState};

/// Identity of one per-route ordering: all vehicles travelling the same
/// route in the same direction, ranked by progress.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OrderingKey {
    pub route_id: String,
    pub direction: Direction,
}

impl OrderingKey {
    pub fn new(route_id: &str, direction: Direction) -> Self {
        Self {
            route_id: route_id.to_string(),
            direction,
        }
    }

    /// Canonical storage key, also the unit the reclaimer's index tracks.
    pub fn storage_key(&self) -> String {
        format!("ordering:{}:{}", self.route_id, self.direction.as_str())
    }

    /// Parses a storage key back. Returns None for anything that does not
    /// match the canonical pattern, which the reclaimer treats as index
    /// corruption.
    pub fn parse_storage_key(raw: &str) -> Option<Self> {
        let rest = raw.strip_prefix("ordering:")?;
        let (route_id, direction) = rest.split_once(':')?;
        if !is_valid_id(route_id) {
            return None;
        }
        let direction = Direction::parse(direction)?;
        Some(Self::new(route_id, direction))
    }
}

impl std::fmt::Display for OrderingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.route_id, self.direction.as_str())
    }
}

/// One member of a route ordering.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderingEntry {
    pub bus_id: String,
    pub score: f64,
}

/// Raw inbound message retained for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub topic: String,
    pub payload: String,
    /// Server receive time, epoch milliseconds.
    pub received_at: i64,
}

/// Emitted after every committed state write; the fan-out worker re-reads
/// the fresh state by id.
#[derive(Debug, Clone)]
pub struct ChangeNotification {
    pub bus_id: String,
}

/// Everything one fix changes, committed together: the state record with
/// its liveness TTL, the ordering placement, and the audit trail entry.
#[derive(Debug, Clone)]
pub struct UpdateBatch {
    pub state: VehicleState,
    pub ttl: Duration,
    /// Ordering the vehicle must leave first, set when the fix moved it to
    /// a different route or direction.
    pub previous_ordering: Option<OrderingKey>,
    pub audit: Option<AuditRecord>,
    pub audit_limit: usize,
    pub audit_ttl: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[allow(async_fn_in_trait)]
pub trait RealtimeStore: Send + Sync + 'static {
    /// Commits one fix atomically with respect to readers, then publishes a
    /// change notification for the fan-out layer.
    async fn apply_update(&self, batch: UpdateBatch) -> Result<(), StoreError>;

    /// Current state of a vehicle; None once its TTL has lapsed.
    async fn vehicle_state(&self, bus_id: &str) -> Result<Option<VehicleState>, StoreError>;

    /// Liveness oracle: one flag per id, false for ids whose state expired.
    async fn vehicles_exist(&self, bus_ids: &[String]) -> Result<Vec<bool>, StoreError>;

    /// Retained raw messages for a vehicle, oldest first.
    async fn audit_trail(&self, bus_id: &str) -> Result<Vec<AuditRecord>, StoreError>;

    async fn ordering_score(&self, key: &OrderingKey, bus_id: &str)
        -> Result<Option<f64>, StoreError>;

    /// Zero-based position by ascending score; equal scores rank by bus id.
    async fn ordering_rank(&self, key: &OrderingKey, bus_id: &str)
        -> Result<Option<usize>, StoreError>;

    /// Members in rank order, `offset` in and at most `limit` entries.
    async fn ordering_range(
        &self,
        key: &OrderingKey,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<OrderingEntry>, StoreError>;

    async fn ordering_len(&self, key: &OrderingKey) -> Result<usize, StoreError>;

    async fn ordering_remove(&self, key: &OrderingKey, bus_id: &str) -> Result<(), StoreError>;

    /// Raw storage keys currently in the ordering index, canonical or not.
    async fn ordering_keys(&self) -> Result<Vec<String>, StoreError>;

    /// Drops an index entry and any ordering stored under it.
    async fn ordering_index_remove(&self, raw_key: &str) -> Result<(), StoreError>;

    fn subscribe_changes(&self) -> broadcast::Receiver<ChangeNotification>;

    /// Round-trip probe for health reporting.
    async fn ping(&self) -> Result<Duration, StoreError>;
}
