//! Turns raw broker messages into committed state updates: topic parsing,
//! payload validation, freshness checks, projection, then the state engine.
//! A message that fails any check is dropped with a stable reason; only
//! backing-service failures surface as errors.

use std::sync::Arc;

use crate::config::TrackingConfig;
use crate::geometry::Point;
use crate::models::{is_valid_id, Direction, GpsFix, NormalizedEvent, VehicleState};
use crate::providers::RouteSource;
use crate::services::engine::{EngineError, VehicleStateEngine};
use crate::services::projection::RouteProjectionService;
use crate::store::{AuditRecord, RealtimeStore};

/// Why a message was dropped. The `reason` labels are stable and appear in
/// logs; the payload carries human detail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    InvalidTopic(String),
    InvalidPayload(String),
    /// Positive skew is a fix from the past, negative from the future.
    StaleTimestamp { skew_secs: i64 },
    ProjectionError(String),
}

impl Rejection {
    pub fn reason(&self) -> &'static str {
        match self {
            Rejection::InvalidTopic(_) => "invalid_topic",
            Rejection::InvalidPayload(_) => "invalid_payload",
            Rejection::StaleTimestamp { .. } => "stale_timestamp",
            Rejection::ProjectionError(_) => "projection_error",
        }
    }

    pub fn detail(&self) -> String {
        match self {
            Rejection::InvalidTopic(detail) => detail.clone(),
            Rejection::InvalidPayload(detail) => detail.clone(),
            Rejection::StaleTimestamp { skew_secs } => format!("skew {skew_secs}s"),
            Rejection::ProjectionError(detail) => detail.clone(),
        }
    }
}

/// What happened to one inbound message.
#[derive(Debug)]
pub enum IngestOutcome {
    Processed(VehicleState),
    Rejected(Rejection),
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Engine(#[from] EngineError),
}

pub struct IngestionPipeline<S, R> {
    engine: Arc<VehicleStateEngine<S>>,
    projection: Arc<RouteProjectionService<R>>,
    topic_prefix: String,
    max_fix_age_secs: i64,
    max_future_drift_secs: i64,
}

impl<S: RealtimeStore, R: RouteSource> IngestionPipeline<S, R> {
    pub fn new(
        engine: Arc<VehicleStateEngine<S>>,
        projection: Arc<RouteProjectionService<R>>,
        topic_prefix: &str,
        tracking: &TrackingConfig,
    ) -> Self {
        Self {
            engine,
            projection,
            topic_prefix: topic_prefix.to_string(),
            max_fix_age_secs: tracking.max_fix_age_secs,
            max_future_drift_secs: tracking.max_future_drift_secs,
        }
    }

    pub async fn handle_message(
        &self,
        topic: &str,
        payload: &[u8],
    ) -> Result<IngestOutcome, PipelineError> {
        let received_at = chrono::Utc::now().timestamp_millis();

        let (route_id, direction, bus_id) = match self.parse_topic(topic) {
            Ok(parts) => parts,
            Err(rejection) => return Ok(IngestOutcome::Rejected(rejection)),
        };
        let fix = match parse_fix(payload) {
            Ok(fix) => fix,
            Err(rejection) => return Ok(IngestOutcome::Rejected(rejection)),
        };
        if let Err(rejection) = self.check_freshness(fix.timestamp, received_at) {
            return Ok(IngestOutcome::Rejected(rejection));
        }

        let point = Point::new(fix.lat, fix.lng);
        let outcome = match self.projection.project(route_id, direction, point).await {
            Ok(outcome) => outcome,
            Err(e) => {
                return Ok(IngestOutcome::Rejected(Rejection::ProjectionError(
                    e.to_string(),
                )))
            }
        };
        if outcome.shape_missing {
            // Not a drop: the vehicle keeps reporting with degraded fields
            // until the route is configured.
            tracing::debug!(
                bus_id,
                route_id,
                direction = %direction,
                reason = "missing_route_shape",
                "No usable shape for route; continuing degraded"
            );
        }
        let shape = match self.projection.shape(route_id, direction).await {
            Ok(shape) => shape,
            Err(e) => {
                return Ok(IngestOutcome::Rejected(Rejection::ProjectionError(
                    e.to_string(),
                )))
            }
        };
        let arrival_zone = shape.as_ref().and_then(|s| s.arrival_zone.as_deref());

        let event = NormalizedEvent {
            bus_id: bus_id.to_string(),
            route_id: route_id.to_string(),
            direction,
            lat: fix.lat,
            lng: fix.lng,
            speed: fix.speed,
            progress: outcome.progress,
            deviation_meters: outcome.deviation_meters,
            timestamp: fix.timestamp,
        };
        let audit = AuditRecord {
            topic: topic.to_string(),
            payload: String::from_utf8_lossy(payload).into_owned(),
            received_at,
        };

        let state = self.engine.update_state(&event, arrival_zone, Some(audit)).await?;
        Ok(IngestOutcome::Processed(state))
    }

    /// Topics are exactly {prefix}/{routeId}/{direction}/{busId}.
    fn parse_topic<'a>(&self, topic: &'a str) -> Result<(&'a str, Direction, &'a str), Rejection> {
        let mut parts = topic.split('/');
        let prefix = parts.next().unwrap_or_default();
        if prefix != self.topic_prefix {
            return Err(Rejection::InvalidTopic(format!(
                "expected prefix '{}'",
                self.topic_prefix
            )));
        }
        let (Some(route_id), Some(direction), Some(bus_id)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(Rejection::InvalidTopic("missing segments".to_string()));
        };
        if parts.next().is_some() {
            return Err(Rejection::InvalidTopic("extra segments".to_string()));
        }
        if !is_valid_id(route_id) {
            return Err(Rejection::InvalidTopic(format!("bad route id '{route_id}'")));
        }
        let Some(direction) = Direction::parse(direction) else {
            return Err(Rejection::InvalidTopic(format!(
                "bad direction '{direction}'"
            )));
        };
        if !is_valid_id(bus_id) {
            return Err(Rejection::InvalidTopic(format!("bad bus id '{bus_id}'")));
        }
        Ok((route_id, direction, bus_id))
    }

    fn check_freshness(&self, fix_ts_ms: i64, now_ms: i64) -> Result<(), Rejection> {
        let skew_secs = (now_ms - fix_ts_ms) / 1000;
        if skew_secs > self.max_fix_age_secs || -skew_secs > self.max_future_drift_secs {
            return Err(Rejection::StaleTimestamp { skew_secs });
        }
        Ok(())
    }
}

fn parse_fix(payload: &[u8]) -> Result<GpsFix, Rejection> {
    let fix: GpsFix = serde_json::from_slice(payload)
        .map_err(|e| Rejection::InvalidPayload(e.to_string()))?;

    if !fix.lat.is_finite() || !(-90.0..=90.0).contains(&fix.lat) {
        return Err(Rejection::InvalidPayload(format!(
            "latitude out of range: {}",
            fix.lat
        )));
    }
    if !fix.lng.is_finite() || !(-180.0..=180.0).contains(&fix.lng) {
        return Err(Rejection::InvalidPayload(format!(
            "longitude out of range: {}",
            fix.lng
        )));
    }
    if !fix.speed.is_finite() || fix.speed < 0.0 {
        return Err(Rejection::InvalidPayload(format!(
            "speed out of range: {}",
            fix.speed
        )));
    }
    if let Some(heading) = fix.heading {
        if !heading.is_finite() || !(0.0..=360.0).contains(&heading) {
            return Err(Rejection::InvalidPayload(format!(
                "heading out of range: {heading}"
            )));
        }
    }
    if fix.timestamp <= 0 {
        return Err(Rejection::InvalidPayload("timestamp not positive".to_string()));
    }
    Ok(fix)
}
