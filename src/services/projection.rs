//! Maps raw coordinates onto route geometry. Lookups go through the shape
//! cache; a missing or degenerate shape degrades the result instead of
//! failing the caller, since ingestion must keep flowing while routes are
//! being configured.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;

use crate::geometry::{project_onto_polyline, Point};
use crate::models::Direction;
use crate::providers::{CachedRouteSource, RouteShape, RouteSource, RouteSourceError};

/// Where a fix landed on its route.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProjectionOutcome {
    /// 0.0 to 1.0 along the polyline; 0.0 when degraded.
    pub progress: f64,
    /// None when degraded.
    pub deviation_meters: Option<f64>,
    /// True when no usable shape existed for the route.
    pub shape_missing: bool,
}

impl ProjectionOutcome {
    fn degraded() -> Self {
        Self {
            progress: 0.0,
            deviation_meters: None,
            shape_missing: true,
        }
    }
}

pub struct RouteProjectionService<R> {
    shapes: CachedRouteSource<R>,
    /// Last usable length per route, kept past the shape cache TTL so
    /// length reads survive source outages.
    lengths: RwLock<HashMap<(String, Direction), f64>>,
}

impl<R: RouteSource> RouteProjectionService<R> {
    pub fn new(source: R, cache_ttl: Duration) -> Self {
        Self {
            shapes: CachedRouteSource::new(source, cache_ttl),
            lengths: RwLock::new(HashMap::new()),
        }
    }

    async fn remember_length(
        &self,
        route_id: &str,
        direction: Direction,
        shape: Option<&RouteShape>,
    ) {
        let current = shape.and_then(|s| (s.length_meters > 0.0).then_some(s.length_meters));
        let key = (route_id.to_string(), direction);
        let stored = self.lengths.read().await.get(&key).copied();
        if stored != current {
            let mut lengths = self.lengths.write().await;
            match current {
                Some(length) => {
                    lengths.insert(key, length);
                }
                None => {
                    lengths.remove(&key);
                }
            }
        }
    }

    /// Projects a point onto its route. Errors only when the shape source
    /// itself fails; unknown routes degrade.
    pub async fn project(
        &self,
        route_id: &str,
        direction: Direction,
        point: Point,
    ) -> Result<ProjectionOutcome, RouteSourceError> {
        let shape = self.shapes.shape(route_id, direction).await?;
        self.remember_length(route_id, direction, shape.as_deref()).await;
        let outcome = match shape {
            Some(shape) => match project_onto_polyline(point, &shape.polyline) {
                Some(projection) => ProjectionOutcome {
                    progress: projection.progress,
                    deviation_meters: Some(projection.deviation_meters),
                    shape_missing: false,
                },
                // A configured route with a degenerate polyline behaves
                // like a missing one.
                None => ProjectionOutcome::degraded(),
            },
            None => ProjectionOutcome::degraded(),
        };
        Ok(outcome)
    }

    /// Cached shape for callers that need the polygon or the length.
    pub async fn shape(
        &self,
        route_id: &str,
        direction: Direction,
    ) -> Result<Option<Arc<RouteShape>>, RouteSourceError> {
        let shape = self.shapes.shape(route_id, direction).await?;
        self.remember_length(route_id, direction, shape.as_deref()).await;
        Ok(shape)
    }

    /// Along-route length in meters; None for unknown or degenerate routes.
    /// Source failures fall back to the last remembered length, else None,
    /// so neighbor pricing degrades to null fields instead of stalling.
    pub async fn route_length(
        &self,
        route_id: &str,
        direction: Direction,
    ) -> Option<f64> {
        match self.shapes.shape(route_id, direction).await {
            Ok(shape) => {
                self.remember_length(route_id, direction, shape.as_deref()).await;
                shape.map(|s| s.length_meters).filter(|len| *len > 0.0)
            }
            Err(e) => {
                let key = (route_id.to_string(), direction);
                let remembered = self.lengths.read().await.get(&key).copied();
                tracing::debug!(
                    route_id,
                    direction = %direction,
                    error = %e,
                    remembered = remembered.is_some(),
                    "Route source unavailable for length lookup"
                );
                remembered
            }
        }
    }
}
