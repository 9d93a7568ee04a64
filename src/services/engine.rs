//! Per-vehicle state machine. Each fix is folded against the previous
//! record to produce the off-track flag with hysteresis and the trip
//! status with dwell and grace windows, then committed as one batch.
//!
//! All windows are measured in event time, so replayed or delayed feeds
//! behave the same as live ones.

use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use utoipa::ToSchema;

use crate::config::TrackingConfig;
use crate::geometry::{point_in_polygon, Point};
use crate::models::{Direction, NormalizedEvent, TripStatus, VehicleState};
use crate::store::{AuditRecord, OrderingKey, RealtimeStore, StoreError, UpdateBatch};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Body of a manual arrival override. Location and route identity are only
/// needed when the vehicle has no live record to fall back on.
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ManualArrivalRequest {
    pub lat: Option<f64>,
    pub lng: Option<f64>,
    pub route_id: Option<String>,
    pub direction: Option<Direction>,
}

#[derive(Debug, thiserror::Error)]
pub enum OverrideError {
    #[error("no realtime state available for this vehicle")]
    StateUnavailable,
    #[error("no location available for this vehicle")]
    MissingLocation,
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct VehicleStateEngine<S> {
    store: Arc<S>,
    config: TrackingConfig,
}

impl<S: RealtimeStore> VehicleStateEngine<S> {
    pub fn new(store: Arc<S>, config: TrackingConfig) -> Self {
        Self { store, config }
    }

    /// Runs one validated fix through the state machine and commits the
    /// resulting record, its ordering placement and the audit entry together.
    pub async fn update_state(
        &self,
        event: &NormalizedEvent,
        arrival_zone: Option<&[Point]>,
        audit: Option<AuditRecord>,
    ) -> Result<VehicleState, EngineError> {
        let previous = self.store.vehicle_state(&event.bus_id).await?;
        let next = transition(previous.as_ref(), event, arrival_zone, &self.config);

        // A vehicle that moved to another route leaves its old ordering.
        let previous_ordering = previous.as_ref().and_then(|prev| {
            let moved = prev.route_id != next.route_id || prev.direction != next.direction;
            moved.then(|| OrderingKey::new(&prev.route_id, prev.direction))
        });

        self.store
            .apply_update(UpdateBatch {
                state: next.clone(),
                ttl: Duration::from_secs(self.config.vehicle_ttl_secs),
                previous_ordering,
                audit,
                audit_limit: self.config.audit_trail_len,
                audit_ttl: Duration::from_secs(self.config.audit_trail_ttl_secs),
            })
            .await?;
        Ok(next)
    }

    /// Terminates a trip by hand: the record goes to ARRIVED immediately and
    /// is flagged so the next fix restarts it from a clean baseline.
    pub async fn force_arrival(
        &self,
        bus_id: &str,
        request: ManualArrivalRequest,
        now_ms: i64,
    ) -> Result<VehicleState, OverrideError> {
        let previous = self.store.vehicle_state(bus_id).await?;

        let state = match previous {
            Some(prev) => {
                let mut next = prev;
                if let (Some(lat), Some(lng)) = (request.lat, request.lng) {
                    next.lat = lat;
                    next.lng = lng;
                }
                next.speed = 0.0;
                next.trip_status = TripStatus::Arrived;
                next.arrival_timestamp = Some(now_ms);
                next.arrival_candidate_since_ts = None;
                next.arrival_outside_since_ts = None;
                next.pending_auto_reset = true;
                next.timestamp = now_ms;
                next
            }
            None => {
                let (Some(lat), Some(lng)) = (request.lat, request.lng) else {
                    return Err(OverrideError::MissingLocation);
                };
                let (Some(route_id), Some(direction)) =
                    (request.route_id.as_deref(), request.direction)
                else {
                    return Err(OverrideError::StateUnavailable);
                };
                let mut state = VehicleState::fresh(bus_id, route_id, direction, now_ms);
                state.lat = lat;
                state.lng = lng;
                state.progress = 1.0;
                state.trip_status = TripStatus::Arrived;
                state.arrival_timestamp = Some(now_ms);
                state.pending_auto_reset = true;
                state
            }
        };

        self.store
            .apply_update(UpdateBatch {
                state: state.clone(),
                ttl: Duration::from_secs(self.config.vehicle_ttl_secs),
                previous_ordering: None,
                audit: None,
                audit_limit: self.config.audit_trail_len,
                audit_ttl: Duration::from_secs(self.config.audit_trail_ttl_secs),
            })
            .await?;
        Ok(state)
    }

    /// Reverts a manual arrival without waiting for the next fix.
    pub async fn clear_arrival(
        &self,
        bus_id: &str,
        now_ms: i64,
    ) -> Result<VehicleState, OverrideError> {
        let Some(prev) = self.store.vehicle_state(bus_id).await? else {
            return Err(OverrideError::StateUnavailable);
        };

        let mut next = prev;
        next.trip_status = TripStatus::InRoute;
        next.arrival_timestamp = None;
        next.arrival_candidate_since_ts = None;
        next.arrival_outside_since_ts = None;
        next.arrival_zone_hit_count = 0;
        next.pending_auto_reset = false;
        next.timestamp = now_ms;

        self.store
            .apply_update(UpdateBatch {
                state: next.clone(),
                ttl: Duration::from_secs(self.config.vehicle_ttl_secs),
                previous_ordering: None,
                audit: None,
                audit_limit: self.config.audit_trail_len,
                audit_ttl: Duration::from_secs(self.config.audit_trail_ttl_secs),
            })
            .await?;
        Ok(next)
    }
}

/// Folds one fix into the previous record. Pure, so every rule is testable
/// without a store.
fn transition(
    previous: Option<&VehicleState>,
    event: &NormalizedEvent,
    arrival_zone: Option<&[Point]>,
    config: &TrackingConfig,
) -> VehicleState {
    // A route change or a consumed manual override starts from a clean
    // baseline; the stale record must not leak timers into the new trip.
    let baseline = previous.filter(|prev| {
        prev.route_id == event.route_id
            && prev.direction == event.direction
            && !prev.pending_auto_reset
    });

    let (is_off_track, off_track_since_ts) = off_track_transition(baseline, event, config);
    let trip = trip_transition(baseline, event, arrival_zone, config);

    VehicleState {
        bus_id: event.bus_id.clone(),
        route_id: event.route_id.clone(),
        direction: event.direction,
        lat: event.lat,
        lng: event.lng,
        speed: event.speed,
        progress: event.progress,
        deviation_meters: event.deviation_meters,
        is_off_track,
        off_track_since_ts,
        trip_status: trip.status,
        arrival_timestamp: trip.arrival_timestamp,
        arrival_candidate_since_ts: trip.candidate_since,
        arrival_outside_since_ts: trip.outside_since,
        arrival_zone_hit_count: trip.zone_hits,
        pending_auto_reset: false,
        timestamp: event.timestamp,
    }
}

/// Two-threshold hysteresis. The entry timestamp is written once on the
/// transition onto the flag and held until recovery.
fn off_track_transition(
    previous: Option<&VehicleState>,
    event: &NormalizedEvent,
    config: &TrackingConfig,
) -> (bool, Option<i64>) {
    let deviation = match event.deviation_meters {
        Some(d) if d.is_finite() => d,
        // Unknown deviation never keeps a vehicle flagged.
        _ => return (false, None),
    };

    let was_off = previous.map(|p| p.is_off_track).unwrap_or(false);
    if was_off {
        if deviation <= config.off_track_recover_meters {
            (false, None)
        } else {
            (true, previous.and_then(|p| p.off_track_since_ts))
        }
    } else if deviation >= config.off_track_enter_meters {
        (true, Some(event.timestamp))
    } else {
        (false, None)
    }
}

struct TripFields {
    status: TripStatus,
    arrival_timestamp: Option<i64>,
    candidate_since: Option<i64>,
    outside_since: Option<i64>,
    zone_hits: u32,
}

impl TripFields {
    fn in_route_cleared() -> Self {
        Self {
            status: TripStatus::InRoute,
            arrival_timestamp: None,
            candidate_since: None,
            outside_since: None,
            zone_hits: 0,
        }
    }
}

fn trip_transition(
    previous: Option<&VehicleState>,
    event: &NormalizedEvent,
    arrival_zone: Option<&[Point]>,
    config: &TrackingConfig,
) -> TripFields {
    let gate = arrival_gate(event, arrival_zone, config);
    let prev_status = previous
        .map(|p| p.trip_status)
        .unwrap_or(TripStatus::InRoute);

    match prev_status {
        TripStatus::InRoute => {
            if gate {
                let candidate_since = previous
                    .and_then(|p| p.arrival_candidate_since_ts)
                    .unwrap_or(event.timestamp);
                let zone_hits = previous
                    .map(|p| p.arrival_zone_hit_count)
                    .unwrap_or(0)
                    .saturating_add(1);
                if event.timestamp.saturating_sub(candidate_since) >= config.arrival_dwell_ms {
                    // The arrival is backdated to the tick that opened the
                    // dwell window.
                    TripFields {
                        status: TripStatus::Arrived,
                        arrival_timestamp: Some(candidate_since),
                        candidate_since: None,
                        outside_since: None,
                        zone_hits,
                    }
                } else {
                    TripFields {
                        status: TripStatus::InRoute,
                        arrival_timestamp: None,
                        candidate_since: Some(candidate_since),
                        outside_since: None,
                        zone_hits,
                    }
                }
            } else {
                TripFields::in_route_cleared()
            }
        }
        TripStatus::Arrived => {
            let arrival_timestamp = previous.and_then(|p| p.arrival_timestamp);
            if event.progress <= config.arrival_reset_progress {
                // The vehicle clearly departed; no grace period applies.
                TripFields::in_route_cleared()
            } else if gate {
                let zone_hits = previous
                    .map(|p| p.arrival_zone_hit_count)
                    .unwrap_or(0)
                    .saturating_add(1);
                TripFields {
                    status: TripStatus::Arrived,
                    arrival_timestamp,
                    candidate_since: None,
                    outside_since: None,
                    zone_hits,
                }
            } else {
                let outside_since = previous
                    .and_then(|p| p.arrival_outside_since_ts)
                    .unwrap_or(event.timestamp);
                if event.timestamp.saturating_sub(outside_since) >= config.arrival_exit_grace_ms {
                    TripFields::in_route_cleared()
                } else {
                    TripFields {
                        status: TripStatus::Arrived,
                        arrival_timestamp,
                        candidate_since: None,
                        outside_since: Some(outside_since),
                        zone_hits: 0,
                    }
                }
            }
        }
    }
}

/// A tick passes the gate only inside the polygon, near the route end, and
/// at walking speed. No polygon means the route cannot auto-arrive.
fn arrival_gate(
    event: &NormalizedEvent,
    arrival_zone: Option<&[Point]>,
    config: &TrackingConfig,
) -> bool {
    let Some(zone) = arrival_zone else {
        return false;
    };
    event.progress >= config.arrival_progress_threshold
        && event.speed <= config.arrival_max_speed_kmh
        && point_in_polygon(Point::new(event.lat, event.lng), zone)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, RealtimeStore};

    const T0: i64 = 1_700_000_000_000;

    fn make_event(bus_id: &str, route_id: &str, ts: i64) -> NormalizedEvent {
        NormalizedEvent {
            bus_id: bus_id.to_string(),
            route_id: route_id.to_string(),
            direction: Direction::Forward,
            lat: 0.001,
            lng: 0.001,
            speed: 20.0,
            progress: 0.5,
            deviation_meters: Some(5.0),
            timestamp: ts,
        }
    }

    /// Square around (0.001, 0.001), matching make_event's position.
    fn zone() -> Vec<Point> {
        vec![
            Point::new(0.0, 0.0),
            Point::new(0.0, 0.002),
            Point::new(0.002, 0.002),
            Point::new(0.002, 0.0),
        ]
    }

    fn gate_event(bus_id: &str, ts: i64) -> NormalizedEvent {
        let mut event = make_event(bus_id, "R1", ts);
        event.progress = 0.98;
        event.speed = 3.0;
        event
    }

    fn config() -> TrackingConfig {
        TrackingConfig::default()
    }

    fn step(
        previous: Option<&VehicleState>,
        event: &NormalizedEvent,
        zone: Option<&[Point]>,
    ) -> VehicleState {
        transition(previous, event, zone, &config())
    }

    #[test]
    fn test_first_fix_starts_in_route() {
        let state = step(None, &make_event("bus-1", "R1", T0), None);
        assert_eq!(state.trip_status, TripStatus::InRoute);
        assert!(!state.is_off_track);
        assert_eq!(state.off_track_since_ts, None);
        assert_eq!(state.progress, 0.5);
    }

    #[test]
    fn test_off_track_entry_records_timestamp_once() {
        let mut event = make_event("bus-1", "R1", T0);
        event.deviation_meters = Some(60.0);
        let flagged = step(None, &event, None);
        assert!(flagged.is_off_track);
        assert_eq!(flagged.off_track_since_ts, Some(T0));

        // Still beyond recovery: the entry timestamp must not move.
        let mut later = make_event("bus-1", "R1", T0 + 5_000);
        later.deviation_meters = Some(45.0);
        let held = step(Some(&flagged), &later, None);
        assert!(held.is_off_track);
        assert_eq!(held.off_track_since_ts, Some(T0));
    }

    #[test]
    fn test_off_track_band_is_sticky_both_ways() {
        // 40m: above recovery, below entry.
        let mut event = make_event("bus-1", "R1", T0);
        event.deviation_meters = Some(40.0);
        let on_track = step(None, &event, None);
        assert!(!on_track.is_off_track);

        let mut far = make_event("bus-1", "R1", T0 + 1_000);
        far.deviation_meters = Some(50.0);
        let flagged = step(Some(&on_track), &far, None);
        assert!(flagged.is_off_track);

        let mut band = make_event("bus-1", "R1", T0 + 2_000);
        band.deviation_meters = Some(40.0);
        let still_flagged = step(Some(&flagged), &band, None);
        assert!(still_flagged.is_off_track);

        let mut near = make_event("bus-1", "R1", T0 + 3_000);
        near.deviation_meters = Some(35.0);
        let recovered = step(Some(&still_flagged), &near, None);
        assert!(!recovered.is_off_track);
        assert_eq!(recovered.off_track_since_ts, None);
    }

    #[test]
    fn test_unknown_deviation_clears_off_track() {
        let mut event = make_event("bus-1", "R1", T0);
        event.deviation_meters = Some(80.0);
        let flagged = step(None, &event, None);

        let mut blind = make_event("bus-1", "R1", T0 + 1_000);
        blind.deviation_meters = None;
        let cleared = step(Some(&flagged), &blind, None);
        assert!(!cleared.is_off_track);
        assert_eq!(cleared.off_track_since_ts, None);
    }

    #[test]
    fn test_arrival_commits_after_dwell_and_backdates() {
        let zone = zone();
        let first = step(None, &gate_event("bus-1", T0), Some(&zone));
        assert_eq!(first.trip_status, TripStatus::InRoute);
        assert_eq!(first.arrival_candidate_since_ts, Some(T0));
        assert_eq!(first.arrival_zone_hit_count, 1);

        let mid = step(Some(&first), &gate_event("bus-1", T0 + 4_000), Some(&zone));
        assert_eq!(mid.trip_status, TripStatus::InRoute);
        assert_eq!(mid.arrival_candidate_since_ts, Some(T0));

        let done = step(Some(&mid), &gate_event("bus-1", T0 + 10_000), Some(&zone));
        assert_eq!(done.trip_status, TripStatus::Arrived);
        assert_eq!(done.arrival_timestamp, Some(T0));
        assert_eq!(done.arrival_candidate_since_ts, None);
    }

    #[test]
    fn test_gate_needs_zone_progress_speed_and_polygon() {
        let zone = zone();

        // No polygon configured.
        let state = step(None, &gate_event("bus-1", T0), None);
        assert_eq!(state.arrival_candidate_since_ts, None);

        // Too far from the end of the route.
        let mut early = gate_event("bus-1", T0);
        early.progress = 0.9;
        let state = step(None, &early, Some(&zone));
        assert_eq!(state.arrival_candidate_since_ts, None);

        // Still moving.
        let mut fast = gate_event("bus-1", T0);
        fast.speed = 20.0;
        let state = step(None, &fast, Some(&zone));
        assert_eq!(state.arrival_candidate_since_ts, None);

        // Outside the polygon.
        let mut outside = gate_event("bus-1", T0);
        outside.lat = 0.005;
        let state = step(None, &outside, Some(&zone));
        assert_eq!(state.arrival_candidate_since_ts, None);
    }

    #[test]
    fn test_gate_break_restarts_candidacy() {
        let zone = zone();
        let first = step(None, &gate_event("bus-1", T0), Some(&zone));

        let mut moving = gate_event("bus-1", T0 + 5_000);
        moving.speed = 30.0;
        let broken = step(Some(&first), &moving, Some(&zone));
        assert_eq!(broken.arrival_candidate_since_ts, None);
        assert_eq!(broken.arrival_zone_hit_count, 0);

        let again = step(Some(&broken), &gate_event("bus-1", T0 + 6_000), Some(&zone));
        assert_eq!(again.arrival_candidate_since_ts, Some(T0 + 6_000));

        // Not enough dwell from the new candidacy yet.
        let later = step(Some(&again), &gate_event("bus-1", T0 + 12_000), Some(&zone));
        assert_eq!(later.trip_status, TripStatus::InRoute);

        let done = step(Some(&later), &gate_event("bus-1", T0 + 16_000), Some(&zone));
        assert_eq!(done.trip_status, TripStatus::Arrived);
        assert_eq!(done.arrival_timestamp, Some(T0 + 6_000));
    }

    fn arrived_state(bus_id: &str) -> VehicleState {
        let zone = zone();
        let first = step(None, &gate_event(bus_id, T0), Some(&zone));
        step(Some(&first), &gate_event(bus_id, T0 + 10_000), Some(&zone))
    }

    #[test]
    fn test_arrived_survives_short_gate_breaks() {
        let zone = zone();
        let arrived = arrived_state("bus-1");

        let mut wander = gate_event("bus-1", T0 + 15_000);
        wander.speed = 15.0;
        let outside = step(Some(&arrived), &wander, Some(&zone));
        assert_eq!(outside.trip_status, TripStatus::Arrived);
        assert_eq!(outside.arrival_outside_since_ts, Some(T0 + 15_000));
        assert_eq!(outside.arrival_timestamp, Some(T0));

        // Back inside the gate before the grace lapses.
        let back = step(Some(&outside), &gate_event("bus-1", T0 + 18_000), Some(&zone));
        assert_eq!(back.trip_status, TripStatus::Arrived);
        assert_eq!(back.arrival_outside_since_ts, None);
    }

    #[test]
    fn test_arrived_reverts_after_grace() {
        let zone = zone();
        let arrived = arrived_state("bus-1");

        let mut wander = gate_event("bus-1", T0 + 15_000);
        wander.speed = 15.0;
        let outside = step(Some(&arrived), &wander, Some(&zone));

        let mut gone = gate_event("bus-1", T0 + 25_000);
        gone.speed = 15.0;
        let reverted = step(Some(&outside), &gone, Some(&zone));
        assert_eq!(reverted.trip_status, TripStatus::InRoute);
        assert_eq!(reverted.arrival_timestamp, None);
        assert_eq!(reverted.arrival_outside_since_ts, None);
    }

    #[test]
    fn test_low_progress_resets_arrival_immediately() {
        let zone = zone();
        let arrived = arrived_state("bus-1");

        let mut departed = make_event("bus-1", "R1", T0 + 12_000);
        departed.progress = 0.1;
        let reverted = step(Some(&arrived), &departed, Some(&zone));
        assert_eq!(reverted.trip_status, TripStatus::InRoute);
        assert_eq!(reverted.arrival_timestamp, None);
        assert_eq!(reverted.arrival_zone_hit_count, 0);
    }

    #[test]
    fn test_route_change_drops_previous_timers() {
        let mut event = make_event("bus-1", "R1", T0);
        event.deviation_meters = Some(80.0);
        let flagged = step(None, &event, None);
        assert!(flagged.is_off_track);

        let moved = step(Some(&flagged), &make_event("bus-1", "R9", T0 + 1_000), None);
        assert!(!moved.is_off_track);
        assert_eq!(moved.off_track_since_ts, None);
        assert_eq!(moved.route_id, "R9");
    }

    #[test]
    fn test_pending_auto_reset_consumed_by_next_fix() {
        let mut manual = arrived_state("bus-1");
        manual.pending_auto_reset = true;

        let next = step(Some(&manual), &make_event("bus-1", "R1", T0 + 20_000), Some(&zone()));
        assert_eq!(next.trip_status, TripStatus::InRoute);
        assert!(!next.pending_auto_reset);
        assert_eq!(next.arrival_timestamp, None);
    }

    #[tokio::test]
    async fn test_update_state_moves_vehicle_between_orderings() {
        let store = Arc::new(MemoryStore::new());
        let engine = VehicleStateEngine::new(store.clone(), config());

        engine
            .update_state(&make_event("bus-1", "R1", T0), None, None)
            .await
            .unwrap();
        engine
            .update_state(&make_event("bus-1", "R2", T0 + 1_000), None, None)
            .await
            .unwrap();

        let old_key = OrderingKey::new("R1", Direction::Forward);
        let new_key = OrderingKey::new("R2", Direction::Forward);
        assert_eq!(store.ordering_len(&old_key).await.unwrap(), 0);
        assert_eq!(store.ordering_len(&new_key).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_force_arrival_uses_last_known_location() {
        let store = Arc::new(MemoryStore::new());
        let engine = VehicleStateEngine::new(store.clone(), config());

        engine
            .update_state(&make_event("bus-1", "R1", T0), None, None)
            .await
            .unwrap();

        let state = engine
            .force_arrival("bus-1", ManualArrivalRequest::default(), T0 + 5_000)
            .await
            .unwrap();
        assert_eq!(state.trip_status, TripStatus::Arrived);
        assert!(state.pending_auto_reset);
        assert_eq!(state.arrival_timestamp, Some(T0 + 5_000));
        assert_eq!(state.lat, 0.001);
    }

    #[tokio::test]
    async fn test_force_arrival_without_state_needs_full_identity() {
        let store = Arc::new(MemoryStore::new());
        let engine = VehicleStateEngine::new(store, config());

        let err = engine
            .force_arrival("ghost", ManualArrivalRequest::default(), T0)
            .await
            .unwrap_err();
        assert!(matches!(err, OverrideError::MissingLocation));

        let located = ManualArrivalRequest {
            lat: Some(0.001),
            lng: Some(0.001),
            ..Default::default()
        };
        let err = engine.force_arrival("ghost", located, T0).await.unwrap_err();
        assert!(matches!(err, OverrideError::StateUnavailable));

        let full = ManualArrivalRequest {
            lat: Some(0.001),
            lng: Some(0.001),
            route_id: Some("R1".to_string()),
            direction: Some(Direction::Forward),
        };
        let state = engine.force_arrival("ghost", full, T0).await.unwrap();
        assert_eq!(state.trip_status, TripStatus::Arrived);
        assert_eq!(state.progress, 1.0);
    }

    #[tokio::test]
    async fn test_clear_arrival_reverts_manual_override() {
        let store = Arc::new(MemoryStore::new());
        let engine = VehicleStateEngine::new(store, config());

        engine
            .update_state(&make_event("bus-1", "R1", T0), None, None)
            .await
            .unwrap();
        engine
            .force_arrival("bus-1", ManualArrivalRequest::default(), T0 + 5_000)
            .await
            .unwrap();

        let cleared = engine.clear_arrival("bus-1", T0 + 6_000).await.unwrap();
        assert_eq!(cleared.trip_status, TripStatus::InRoute);
        assert!(!cleared.pending_auto_reset);
        assert_eq!(cleared.arrival_timestamp, None);

        let err = engine.clear_arrival("ghost", T0).await.unwrap_err();
        assert!(matches!(err, OverrideError::StateUnavailable));
    }
}
