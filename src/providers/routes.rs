//! Route geometry loading. Shapes live in SQLite and change rarely, so a
//! TTL cache in front of the database absorbs the per-fix lookups.

use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::geometry::{polyline_length_meters, Point};
use crate::models::Direction;

#[derive(Debug, thiserror::Error)]
pub enum RouteSourceError {
    #[error("route database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Static geometry for one route/direction.
#[derive(Debug, Clone)]
pub struct RouteShape {
    pub route_id: String,
    pub direction: Direction,
    /// Ordered polyline vertices; may be degenerate for misconfigured routes.
    pub polyline: Vec<Point>,
    pub length_meters: f64,
    /// Terminal arrival polygon, when the route defines one.
    pub arrival_zone: Option<Vec<Point>>,
}

#[allow(async_fn_in_trait)]
pub trait RouteSource: Send + Sync + 'static {
    /// Loads the shape for a route/direction. Ok(None) means the route is
    /// not configured, which callers must treat as a degraded input rather
    /// than an error.
    async fn fetch_shape(
        &self,
        route_id: &str,
        direction: Direction,
    ) -> Result<Option<RouteShape>, RouteSourceError>;
}

pub struct SqliteRouteSource {
    pool: SqlitePool,
}

impl SqliteRouteSource {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct PointRow {
    lat: f64,
    lng: f64,
}

impl RouteSource for SqliteRouteSource {
    async fn fetch_shape(
        &self,
        route_id: &str,
        direction: Direction,
    ) -> Result<Option<RouteShape>, RouteSourceError> {
        let dir = direction.as_str();

        let known: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM routes WHERE route_id = ? AND direction = ?")
                .bind(route_id)
                .bind(dir)
                .fetch_optional(&self.pool)
                .await?;
        if known.is_none() {
            return Ok(None);
        }

        let point_rows: Vec<PointRow> = sqlx::query_as(
            "SELECT lat, lng FROM route_points WHERE route_id = ? AND direction = ? ORDER BY seq",
        )
        .bind(route_id)
        .bind(dir)
        .fetch_all(&self.pool)
        .await?;

        let zone_rows: Vec<PointRow> = sqlx::query_as(
            "SELECT lat, lng FROM arrival_zone_points WHERE route_id = ? AND direction = ? ORDER BY seq",
        )
        .bind(route_id)
        .bind(dir)
        .fetch_all(&self.pool)
        .await?;

        let polyline: Vec<Point> = point_rows
            .iter()
            .map(|row| Point::new(row.lat, row.lng))
            .collect();
        let length_meters = polyline_length_meters(&polyline);

        // A polygon needs at least three vertices to enclose anything.
        let arrival_zone = if zone_rows.len() >= 3 {
            Some(
                zone_rows
                    .iter()
                    .map(|row| Point::new(row.lat, row.lng))
                    .collect(),
            )
        } else {
            None
        };

        Ok(Some(RouteShape {
            route_id: route_id.to_string(),
            direction,
            polyline,
            length_meters,
            arrival_zone,
        }))
    }
}

struct CacheSlot {
    /// None caches "route not configured" so unknown routes do not hammer
    /// the database on every fix.
    shape: Option<Arc<RouteShape>>,
    fetched_at: Instant,
}

/// TTL cache over any [`RouteSource`]. Fetch errors are never cached, so a
/// recovered database is picked up on the next lookup.
pub struct CachedRouteSource<R> {
    source: R,
    ttl: Duration,
    cache: RwLock<HashMap<(String, Direction), CacheSlot>>,
}

impl<R: RouteSource> CachedRouteSource<R> {
    pub fn new(source: R, ttl: Duration) -> Self {
        Self {
            source,
            ttl,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub async fn shape(
        &self,
        route_id: &str,
        direction: Direction,
    ) -> Result<Option<Arc<RouteShape>>, RouteSourceError> {
        let cache_key = (route_id.to_string(), direction);
        {
            let cache = self.cache.read().await;
            if let Some(slot) = cache.get(&cache_key) {
                if slot.fetched_at.elapsed() < self.ttl {
                    return Ok(slot.shape.clone());
                }
            }
        }

        let shape = self.source.fetch_shape(route_id, direction).await?.map(Arc::new);
        let mut cache = self.cache.write().await;
        cache.insert(
            cache_key,
            CacheSlot {
                shape: shape.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(shape)
    }
}
