//! Reclaims ordering members whose state records have expired. The state
//! record TTL is the liveness oracle: membership without a live record is
//! stale. Orderings are paged so one huge route cannot monopolize the store.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::{Instant, MissedTickBehavior};
use utoipa::ToSchema;

use crate::store::{OrderingKey, RealtimeStore, StoreError};

/// Lifetime counters plus the outcome of the most recent sweep, surfaced
/// through the health endpoint.
#[derive(Debug, Clone, Default, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SweepStats {
    pub runs: u64,
    pub total_removed: u64,
    pub last_checked: usize,
    pub last_removed: usize,
    pub last_dropped_keys: usize,
    pub last_duration_ms: u64,
    /// ISO 8601 time of the last completed sweep.
    pub last_run_at: Option<String>,
    pub last_error: Option<String>,
}

/// Counters for a single sweep.
#[derive(Debug, Default, PartialEq)]
pub struct SweepOutcome {
    /// Members whose liveness was checked.
    pub checked: usize,
    /// Stale members removed from their ordering.
    pub removed: usize,
    /// Index entries dropped: emptied orderings and malformed keys.
    pub dropped_keys: usize,
}

pub struct StaleEntryReclaimer<S> {
    store: Arc<S>,
    interval: Duration,
    page_size: usize,
    stats: Arc<RwLock<SweepStats>>,
}

impl<S: RealtimeStore> StaleEntryReclaimer<S> {
    pub fn new(store: Arc<S>, interval: Duration, page_size: usize) -> Self {
        Self {
            store,
            interval,
            page_size: page_size.max(1),
            stats: Arc::new(RwLock::new(SweepStats::default())),
        }
    }

    pub fn stats_handle(&self) -> Arc<RwLock<SweepStats>> {
        self.stats.clone()
    }

    /// Runs forever. A failed sweep is recorded and retried on the next
    /// tick; it never takes the task down.
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let started = Instant::now();
            let result = self.sweep_once().await;
            let duration_ms = started.elapsed().as_millis() as u64;

            let mut stats = self.stats.write().await;
            stats.runs += 1;
            stats.last_duration_ms = duration_ms;
            stats.last_run_at = Some(chrono::Utc::now().to_rfc3339());
            match result {
                Ok(outcome) => {
                    if outcome.removed > 0 || outcome.dropped_keys > 0 {
                        tracing::info!(
                            checked = outcome.checked,
                            removed = outcome.removed,
                            dropped_keys = outcome.dropped_keys,
                            duration_ms,
                            "Sweep reclaimed stale ordering entries"
                        );
                    } else {
                        tracing::debug!(checked = outcome.checked, duration_ms, "Sweep clean");
                    }
                    stats.total_removed += outcome.removed as u64;
                    stats.last_checked = outcome.checked;
                    stats.last_removed = outcome.removed;
                    stats.last_dropped_keys = outcome.dropped_keys;
                    stats.last_error = None;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Sweep failed");
                    stats.last_error = Some(e.to_string());
                }
            }
        }
    }

    /// One full pass over the ordering index.
    pub async fn sweep_once(&self) -> Result<SweepOutcome, StoreError> {
        let mut outcome = SweepOutcome::default();
        for raw_key in self.store.ordering_keys().await? {
            match OrderingKey::parse_storage_key(&raw_key) {
                Some(key) => self.sweep_ordering(&key, &mut outcome).await?,
                None => {
                    tracing::warn!(key = %raw_key, "Dropping malformed ordering index entry");
                    self.store.ordering_index_remove(&raw_key).await?;
                    outcome.dropped_keys += 1;
                }
            }
        }
        Ok(outcome)
    }

    async fn sweep_ordering(
        &self,
        key: &OrderingKey,
        outcome: &mut SweepOutcome,
    ) -> Result<(), StoreError> {
        // Collect members up front so removals cannot shift pagination.
        let mut members = Vec::new();
        let mut offset = 0;
        loop {
            let page = self.store.ordering_range(key, offset, self.page_size).await?;
            if page.is_empty() {
                break;
            }
            offset += page.len();
            members.extend(page.into_iter().map(|entry| entry.bus_id));
        }

        for chunk in members.chunks(self.page_size) {
            let alive = self.store.vehicles_exist(chunk).await?;
            outcome.checked += chunk.len();
            for (bus_id, alive) in chunk.iter().zip(alive) {
                if !alive {
                    self.store.ordering_remove(key, bus_id).await?;
                    outcome.removed += 1;
                    tracing::debug!(bus_id = %bus_id, ordering = %key, "Removed stale ordering member");
                }
            }
        }

        if self.store.ordering_len(key).await? == 0 {
            self.store.ordering_index_remove(&key.storage_key()).await?;
            outcome.dropped_keys += 1;
        }
        Ok(())
    }
}
