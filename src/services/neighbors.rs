//! Resolves the vehicles adjacent to a given one in its route ordering and
//! prices the separation in meters and seconds.

use std::sync::Arc;

use crate::models::NeighborDetail;
use crate::store::{OrderingKey, RealtimeStore, StoreError};

/// Ids on both sides of one vehicle, nearest first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NeighborIds {
    pub ahead: Vec<String>,
    pub behind: Vec<String>,
}

pub struct NeighborResolver<S> {
    store: Arc<S>,
}

impl<S: RealtimeStore> NeighborResolver<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Looks up at most `count` members on each side of `bus_id` by rank.
    /// A vehicle absent from its ordering has no neighbors.
    pub async fn neighbor_ids(
        &self,
        key: &OrderingKey,
        bus_id: &str,
        count: usize,
    ) -> Result<NeighborIds, StoreError> {
        let Some(rank) = self.store.ordering_rank(key, bus_id).await? else {
            return Ok(NeighborIds::default());
        };

        let ahead = self
            .store
            .ordering_range(key, rank + 1, count)
            .await?
            .into_iter()
            .map(|entry| entry.bus_id)
            .collect();

        let start = rank.saturating_sub(count);
        let mut behind: Vec<String> = self
            .store
            .ordering_range(key, start, rank - start)
            .await?
            .into_iter()
            .map(|entry| entry.bus_id)
            .collect();
        behind.reverse();

        Ok(NeighborIds { ahead, behind })
    }

    /// Prices each neighbor against the subject vehicle. Scores are re-read
    /// from the ordering so a neighbor that moved since resolution is priced
    /// at its current position; one that vanished prices as unknown.
    pub async fn neighbor_details(
        &self,
        key: &OrderingKey,
        own_progress: f64,
        own_speed_kmh: f64,
        route_length: Option<f64>,
        ids: &[String],
    ) -> Result<Vec<NeighborDetail>, StoreError> {
        let mut details = Vec::with_capacity(ids.len());
        for bus_id in ids {
            let score = self.store.ordering_score(key, bus_id).await?;
            details.push(price_neighbor(
                bus_id,
                own_progress,
                own_speed_kmh,
                route_length,
                score,
            ));
        }
        Ok(details)
    }
}

/// Separation from the progress delta and route length; ETA from the subject
/// vehicle's own speed. Unknown inputs propagate as None, never as zero.
fn price_neighbor(
    bus_id: &str,
    own_progress: f64,
    own_speed_kmh: f64,
    route_length: Option<f64>,
    neighbor_progress: Option<f64>,
) -> NeighborDetail {
    let distance_meters = match (route_length, neighbor_progress) {
        (Some(length), Some(progress)) => Some((progress - own_progress).abs() * length),
        _ => None,
    };
    let eta_seconds = distance_meters.and_then(|distance| {
        if own_speed_kmh > 0.0 {
            Some((distance / (own_speed_kmh / 3.6)).round() as i64)
        } else {
            None
        }
    });

    NeighborDetail {
        bus_id: bus_id.to_string(),
        distance_meters,
        eta_seconds,
    }
}
