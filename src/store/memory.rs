//! In-process store. Liveness works like a key-value TTL: a record older
//! than its TTL is simply absent to every reader, while its ordering
//! membership lingers until the reclaimer sweeps it.

use ordered_float::OrderedFloat;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio::time::Instant;

use super::{
    AuditRecord, ChangeNotification, OrderingEntry, OrderingKey, RealtimeStore, StoreError,
    UpdateBatch,
};
use crate::models::VehicleState;

const CHANGE_CHANNEL_CAPACITY: usize = 1024;

pub struct MemoryStore {
    inner: RwLock<Inner>,
    changes: broadcast::Sender<ChangeNotification>,
}

#[derive(Default)]
struct Inner {
    vehicles: HashMap<String, ExpiringState>,
    audits: HashMap<String, AuditTrail>,
    orderings: HashMap<String, Ordering>,
    /// Storage keys of every ordering ever written, junk included; the
    /// reclaimer owns cleanup.
    index: BTreeSet<String>,
}

struct ExpiringState {
    state: VehicleState,
    expires_at: Instant,
}

struct AuditTrail {
    records: VecDeque<AuditRecord>,
    expires_at: Instant,
}

/// Score-sorted membership with the usual sorted-set tie rule: equal scores
/// order by member id.
#[derive(Default)]
struct Ordering {
    scores: HashMap<String, f64>,
    ranked: BTreeMap<(OrderedFloat<f64>, String), ()>,
}

impl Ordering {
    fn upsert(&mut self, bus_id: &str, score: f64) {
        if let Some(old) = self.scores.insert(bus_id.to_string(), score) {
            self.ranked.remove(&(OrderedFloat(old), bus_id.to_string()));
        }
        self.ranked.insert((OrderedFloat(score), bus_id.to_string()), ());
    }

    fn remove(&mut self, bus_id: &str) {
        if let Some(score) = self.scores.remove(bus_id) {
            self.ranked.remove(&(OrderedFloat(score), bus_id.to_string()));
        }
    }

    fn rank(&self, bus_id: &str) -> Option<usize> {
        if !self.scores.contains_key(bus_id) {
            return None;
        }
        self.ranked.keys().position(|(_, id)| id == bus_id)
    }

    fn range(&self, offset: usize, limit: usize) -> Vec<OrderingEntry> {
        self.ranked
            .keys()
            .skip(offset)
            .take(limit)
            .map(|(score, id)| OrderingEntry {
                bus_id: id.clone(),
                score: score.0,
            })
            .collect()
    }

    fn len(&self) -> usize {
        self.scores.len()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            inner: RwLock::new(Inner::default()),
            changes,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
impl MemoryStore {
    /// Plants a raw index entry, bypassing the canonical key format.
    pub(crate) async fn inject_index_key(&self, raw: &str) {
        self.inner.write().await.index.insert(raw.to_string());
    }
}

impl RealtimeStore for MemoryStore {
    async fn apply_update(&self, batch: UpdateBatch) -> Result<(), StoreError> {
        let bus_id = batch.state.bus_id.clone();
        let now = Instant::now();
        {
            let mut inner = self.inner.write().await;

            if let Some(prev) = &batch.previous_ordering {
                let prev_key = prev.storage_key();
                if let Some(ordering) = inner.orderings.get_mut(&prev_key) {
                    ordering.remove(&bus_id);
                }
            }

            let key = OrderingKey::new(&batch.state.route_id, batch.state.direction).storage_key();
            inner
                .orderings
                .entry(key.clone())
                .or_default()
                .upsert(&bus_id, batch.state.progress);
            inner.index.insert(key);

            if let Some(audit) = batch.audit {
                let trail = inner.audits.entry(bus_id.clone()).or_insert_with(|| AuditTrail {
                    records: VecDeque::new(),
                    expires_at: now,
                });
                trail.records.push_back(audit);
                while trail.records.len() > batch.audit_limit.max(1) {
                    trail.records.pop_front();
                }
                trail.expires_at = now + batch.audit_ttl;
            }

            inner.vehicles.insert(
                bus_id.clone(),
                ExpiringState {
                    state: batch.state,
                    expires_at: now + batch.ttl,
                },
            );
        }

        // No subscribers is fine.
        let _ = self.changes.send(ChangeNotification { bus_id });
        Ok(())
    }

    async fn vehicle_state(&self, bus_id: &str) -> Result<Option<VehicleState>, StoreError> {
        let now = Instant::now();
        let mut inner = self.inner.write().await;
        match inner.vehicles.get(bus_id) {
            Some(record) if record.expires_at > now => Ok(Some(record.state.clone())),
            Some(_) => {
                // Lazy expiry on access.
                inner.vehicles.remove(bus_id);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn vehicles_exist(&self, bus_ids: &[String]) -> Result<Vec<bool>, StoreError> {
        let now = Instant::now();
        let mut inner = self.inner.write().await;
        let mut alive = Vec::with_capacity(bus_ids.len());
        for bus_id in bus_ids {
            let live = match inner.vehicles.get(bus_id) {
                Some(record) if record.expires_at > now => true,
                Some(_) => {
                    inner.vehicles.remove(bus_id);
                    false
                }
                None => false,
            };
            alive.push(live);
        }
        Ok(alive)
    }

    async fn audit_trail(&self, bus_id: &str) -> Result<Vec<AuditRecord>, StoreError> {
        let now = Instant::now();
        let mut inner = self.inner.write().await;
        match inner.audits.get(bus_id) {
            Some(trail) if trail.expires_at > now => Ok(trail.records.iter().cloned().collect()),
            Some(_) => {
                inner.audits.remove(bus_id);
                Ok(Vec::new())
            }
            None => Ok(Vec::new()),
        }
    }

    async fn ordering_score(
        &self,
        key: &OrderingKey,
        bus_id: &str,
    ) -> Result<Option<f64>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .orderings
            .get(&key.storage_key())
            .and_then(|ordering| ordering.scores.get(bus_id).copied()))
    }

    async fn ordering_rank(
        &self,
        key: &OrderingKey,
        bus_id: &str,
    ) -> Result<Option<usize>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .orderings
            .get(&key.storage_key())
            .and_then(|ordering| ordering.rank(bus_id)))
    }

    async fn ordering_range(
        &self,
        key: &OrderingKey,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<OrderingEntry>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .orderings
            .get(&key.storage_key())
            .map(|ordering| ordering.range(offset, limit))
            .unwrap_or_default())
    }

    async fn ordering_len(&self, key: &OrderingKey) -> Result<usize, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .orderings
            .get(&key.storage_key())
            .map(Ordering::len)
            .unwrap_or(0))
    }

    async fn ordering_remove(&self, key: &OrderingKey, bus_id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if let Some(ordering) = inner.orderings.get_mut(&key.storage_key()) {
            ordering.remove(bus_id);
        }
        Ok(())
    }

    async fn ordering_keys(&self) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.index.iter().cloned().collect())
    }

    async fn ordering_index_remove(&self, raw_key: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.index.remove(raw_key);
        inner.orderings.remove(raw_key);
        Ok(())
    }

    fn subscribe_changes(&self) -> broadcast::Receiver<ChangeNotification> {
        self.changes.subscribe()
    }

    async fn ping(&self) -> Result<Duration, StoreError> {
        let start = Instant::now();
        let _ = self.inner.read().await;
        Ok(start.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Direction, TripStatus};

    fn make_state(bus_id: &str, route_id: &str, progress: f64) -> VehicleState {
        VehicleState {
            bus_id: bus_id.to_string(),
            route_id: route_id.to_string(),
            direction: Direction::Forward,
            lat: 51.05,
            lng: 13.74,
            speed: 20.0,
            progress,
            deviation_meters: Some(4.2),
            is_off_track: false,
            off_track_since_ts: None,
            trip_status: TripStatus::InRoute,
            arrival_timestamp: None,
            arrival_candidate_since_ts: None,
            arrival_outside_since_ts: None,
            arrival_zone_hit_count: 0,
            pending_auto_reset: false,
            timestamp: 1_700_000_000_000,
        }
    }

    fn make_batch(state: VehicleState) -> UpdateBatch {
        UpdateBatch {
            state,
            ttl: Duration::from_secs(120),
            previous_ordering: None,
            audit: None,
            audit_limit: 50,
            audit_ttl: Duration::from_secs(3600),
        }
    }

    #[tokio::test]
    async fn test_apply_update_then_read_back() {
        let store = MemoryStore::new();
        store
            .apply_update(make_batch(make_state("bus-1", "R1", 0.4)))
            .await
            .unwrap();

        let state = store.vehicle_state("bus-1").await.unwrap().unwrap();
        assert_eq!(state.progress, 0.4);

        let key = OrderingKey::new("R1", Direction::Forward);
        assert_eq!(store.ordering_score(&key, "bus-1").await.unwrap(), Some(0.4));
        assert_eq!(store.ordering_rank(&key, "bus-1").await.unwrap(), Some(0));
        assert_eq!(
            store.ordering_keys().await.unwrap(),
            vec!["ordering:R1:FORWARD".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_expires_but_ordering_lingers() {
        let store = MemoryStore::new();
        store
            .apply_update(make_batch(make_state("bus-1", "R1", 0.4)))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(121)).await;

        assert!(store.vehicle_state("bus-1").await.unwrap().is_none());
        assert_eq!(
            store.vehicles_exist(&["bus-1".to_string()]).await.unwrap(),
            vec![false]
        );

        // Membership persists until the reclaimer removes it.
        let key = OrderingKey::new("R1", Direction::Forward);
        assert_eq!(store.ordering_len(&key).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_rank_orders_by_score_then_id() {
        let store = MemoryStore::new();
        store
            .apply_update(make_batch(make_state("bus-b", "R1", 0.5)))
            .await
            .unwrap();
        store
            .apply_update(make_batch(make_state("bus-a", "R1", 0.5)))
            .await
            .unwrap();
        store
            .apply_update(make_batch(make_state("bus-c", "R1", 0.1)))
            .await
            .unwrap();

        let key = OrderingKey::new("R1", Direction::Forward);
        assert_eq!(store.ordering_rank(&key, "bus-c").await.unwrap(), Some(0));
        assert_eq!(store.ordering_rank(&key, "bus-a").await.unwrap(), Some(1));
        assert_eq!(store.ordering_rank(&key, "bus-b").await.unwrap(), Some(2));

        let range = store.ordering_range(&key, 1, 10).await.unwrap();
        let ids: Vec<&str> = range.iter().map(|e| e.bus_id.as_str()).collect();
        assert_eq!(ids, vec!["bus-a", "bus-b"]);
    }

    #[tokio::test]
    async fn test_upsert_replaces_previous_score() {
        let store = MemoryStore::new();
        store
            .apply_update(make_batch(make_state("bus-1", "R1", 0.2)))
            .await
            .unwrap();
        store
            .apply_update(make_batch(make_state("bus-1", "R1", 0.6)))
            .await
            .unwrap();

        let key = OrderingKey::new("R1", Direction::Forward);
        assert_eq!(store.ordering_len(&key).await.unwrap(), 1);
        assert_eq!(store.ordering_score(&key, "bus-1").await.unwrap(), Some(0.6));
    }

    #[tokio::test]
    async fn test_route_change_leaves_previous_ordering() {
        let store = MemoryStore::new();
        store
            .apply_update(make_batch(make_state("bus-1", "R1", 0.9)))
            .await
            .unwrap();

        let mut batch = make_batch(make_state("bus-1", "R2", 0.05));
        batch.previous_ordering = Some(OrderingKey::new("R1", Direction::Forward));
        store.apply_update(batch).await.unwrap();

        let old_key = OrderingKey::new("R1", Direction::Forward);
        let new_key = OrderingKey::new("R2", Direction::Forward);
        assert_eq!(store.ordering_len(&old_key).await.unwrap(), 0);
        assert_eq!(store.ordering_rank(&new_key, "bus-1").await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn test_change_notification_carries_bus_id() {
        let store = MemoryStore::new();
        let mut rx = store.subscribe_changes();
        store
            .apply_update(make_batch(make_state("bus-7", "R1", 0.3)))
            .await
            .unwrap();

        let note = rx.recv().await.unwrap();
        assert_eq!(note.bus_id, "bus-7");
    }

    #[tokio::test]
    async fn test_audit_trail_caps_length() {
        let store = MemoryStore::new();
        for i in 0..5 {
            let mut batch = make_batch(make_state("bus-1", "R1", 0.1));
            batch.audit = Some(AuditRecord {
                topic: "gps/R1/FORWARD/bus-1".to_string(),
                payload: format!("{{\"seq\":{i}}}"),
                received_at: 1_700_000_000_000 + i,
            });
            batch.audit_limit = 3;
            store.apply_update(batch).await.unwrap();
        }

        let trail = store.audit_trail("bus-1").await.unwrap();
        assert_eq!(trail.len(), 3);
        assert_eq!(trail[0].payload, "{\"seq\":2}");
        assert_eq!(trail[2].payload, "{\"seq\":4}");
    }

    #[tokio::test]
    async fn test_index_remove_drops_ordering() {
        let store = MemoryStore::new();
        store
            .apply_update(make_batch(make_state("bus-1", "R1", 0.4)))
            .await
            .unwrap();

        store
            .ordering_index_remove("ordering:R1:FORWARD")
            .await
            .unwrap();

        assert!(store.ordering_keys().await.unwrap().is_empty());
        let key = OrderingKey::new("R1", Direction::Forward);
        assert_eq!(store.ordering_len(&key).await.unwrap(), 0);
    }
}
