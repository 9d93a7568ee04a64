//! Pushes state changes out to WebSocket subscribers.
//!
//! The store publishes a bus id per committed update; the worker re-reads
//! the state, enriches it with neighbor context, and broadcasts one frame
//! per interested channel through the connection registry.

pub mod channels;
pub mod registry;

use std::sync::Arc;

use serde::Serialize;
use utoipa::ToSchema;

use crate::models::{NeighborDetail, VehicleState};
use crate::providers::RouteSource;
use crate::services::neighbors::NeighborResolver;
use crate::services::projection::RouteProjectionService;
use crate::store::{OrderingKey, RealtimeStore, StoreError};

pub use channels::Channel;
pub use registry::ConnectionRegistry;

/// Page size used when walking an ordering for snapshots.
const SNAPSHOT_PAGE_SIZE: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum FanoutError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("frame encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Nearest vehicle on each side, as shown to riders and drivers.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct NeighborSummary {
    pub ahead: Option<NeighborDetail>,
    pub behind: Option<NeighborDetail>,
}

/// Frame body for `bus:` and `route:` channels.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct VehiclePayload {
    #[serde(flatten)]
    pub state: VehicleState,
    pub neighbors: NeighborSummary,
}

/// Frame body for `admin-route:` channels. Carries the full neighbor lists
/// in rank order, nearest first.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct AdminVehiclePayload {
    #[serde(flatten)]
    pub state: VehicleState,
    pub ahead: Vec<NeighborDetail>,
    pub behind: Vec<NeighborDetail>,
}

/// Frame body for `system:alerts`.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct SystemAlert {
    pub message: String,
    pub severity: String,
    /// Epoch milliseconds at publish time.
    pub timestamp: i64,
}

/// Wraps a payload in the channel envelope clients receive.
pub fn encode_frame<T: Serialize>(channel: &Channel, data: &T) -> Result<String, serde_json::Error> {
    #[derive(Serialize)]
    struct Frame<'a, T> {
        channel: String,
        data: &'a T,
    }
    serde_json::to_string(&Frame {
        channel: channel.name(),
        data,
    })
}

/// One update, rendered for every audience at once.
pub struct EnrichedUpdate {
    pub state: VehicleState,
    pub vehicle: VehiclePayload,
    pub admin: AdminVehiclePayload,
}

/// Joins a bare state record with neighbor context from the ordering.
pub struct UpdateEnricher<S, R> {
    store: Arc<S>,
    resolver: NeighborResolver<S>,
    projection: Arc<RouteProjectionService<R>>,
    neighbor_count: usize,
}

impl<S: RealtimeStore, R: RouteSource> UpdateEnricher<S, R> {
    pub fn new(
        store: Arc<S>,
        projection: Arc<RouteProjectionService<R>>,
        neighbor_count: usize,
    ) -> Self {
        Self {
            resolver: NeighborResolver::new(store.clone()),
            store,
            projection,
            neighbor_count,
        }
    }

    /// Renders the current state of one vehicle, or None once it expired.
    pub async fn enrich(&self, bus_id: &str) -> Result<Option<EnrichedUpdate>, FanoutError> {
        let Some(state) = self.store.vehicle_state(bus_id).await? else {
            return Ok(None);
        };
        self.enrich_state(state).await.map(Some)
    }

    async fn enrich_state(&self, state: VehicleState) -> Result<EnrichedUpdate, FanoutError> {
        let key = OrderingKey::new(&state.route_id, state.direction);
        let ids = self
            .resolver
            .neighbor_ids(&key, &state.bus_id, self.neighbor_count)
            .await?;
        let route_length = self
            .projection
            .route_length(&state.route_id, state.direction)
            .await;

        let ahead = self
            .resolver
            .neighbor_details(&key, state.progress, state.speed, route_length, &ids.ahead)
            .await?;
        let behind = self
            .resolver
            .neighbor_details(&key, state.progress, state.speed, route_length, &ids.behind)
            .await?;

        let vehicle = VehiclePayload {
            state: state.clone(),
            neighbors: NeighborSummary {
                ahead: ahead.first().cloned(),
                behind: behind.first().cloned(),
            },
        };
        let admin = AdminVehiclePayload {
            state: state.clone(),
            ahead,
            behind,
        };
        Ok(EnrichedUpdate {
            state,
            vehicle,
            admin,
        })
    }

    /// Frames describing the channel's current membership, delivered to a
    /// new subscriber before any live update. Route channels replay every
    /// live vehicle in rank order; a bus channel replays that one vehicle;
    /// alerts have no history.
    pub async fn snapshot(&self, channel: &Channel) -> Result<Vec<String>, FanoutError> {
        let (key, admin_view) = match channel {
            Channel::Route {
                route_id,
                direction,
            } => (OrderingKey::new(route_id, *direction), false),
            Channel::AdminRoute {
                route_id,
                direction,
            } => (OrderingKey::new(route_id, *direction), true),
            Channel::Bus { bus_id } => {
                let Some(update) = self.enrich(bus_id).await? else {
                    return Ok(Vec::new());
                };
                return Ok(vec![encode_frame(channel, &update.vehicle)?]);
            }
            Channel::SystemAlerts => return Ok(Vec::new()),
        };

        let mut frames = Vec::new();
        let mut offset = 0;
        loop {
            let page = self
                .store
                .ordering_range(&key, offset, SNAPSHOT_PAGE_SIZE)
                .await?;
            if page.is_empty() {
                break;
            }
            offset += page.len();
            for entry in page {
                // Members whose state already expired are skipped; the
                // sweeper will reclaim them.
                if let Some(update) = self.enrich(&entry.bus_id).await? {
                    let frame = if admin_view {
                        encode_frame(channel, &update.admin)?
                    } else {
                        encode_frame(channel, &update.vehicle)?
                    };
                    frames.push(frame);
                }
            }
        }
        Ok(frames)
    }
}

/// Drains the store's change stream and broadcasts each update to its bus,
/// route, and admin channels.
pub struct FanoutWorker<S, R> {
    store: Arc<S>,
    enricher: Arc<UpdateEnricher<S, R>>,
    registry: Arc<ConnectionRegistry>,
}

impl<S: RealtimeStore, R: RouteSource> FanoutWorker<S, R> {
    pub fn new(
        store: Arc<S>,
        enricher: Arc<UpdateEnricher<S, R>>,
        registry: Arc<ConnectionRegistry>,
    ) -> Self {
        Self {
            store,
            enricher,
            registry,
        }
    }

    pub async fn run(self) {
        let mut changes = self.store.subscribe_changes();
        loop {
            match changes.recv().await {
                Ok(change) => {
                    if let Err(error) = self.publish(&change.bus_id).await {
                        tracing::warn!(bus_id = %change.bus_id, error = %error, "Failed to fan out update");
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Fan-out fell behind the change stream");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
        tracing::info!("Change stream closed; fan-out worker exiting");
    }

    async fn publish(&self, bus_id: &str) -> Result<(), FanoutError> {
        // The state may expire between the notification and this read.
        let Some(update) = self.enricher.enrich(bus_id).await? else {
            return Ok(());
        };
        let state = &update.state;

        let bus = Channel::Bus {
            bus_id: state.bus_id.clone(),
        };
        let route = Channel::Route {
            route_id: state.route_id.clone(),
            direction: state.direction,
        };
        let admin = Channel::AdminRoute {
            route_id: state.route_id.clone(),
            direction: state.direction,
        };

        self.registry
            .broadcast(&bus, &encode_frame(&bus, &update.vehicle)?)
            .await;
        self.registry
            .broadcast(&route, &encode_frame(&route, &update.vehicle)?)
            .await;
        self.registry
            .broadcast(&admin, &encode_frame(&admin, &update.admin)?)
            .await;
        Ok(())
    }
}
