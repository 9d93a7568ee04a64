use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::{Direction, TripStatus};

/// Full realtime record for one vehicle, as kept in the store and echoed to
/// subscribers. Timestamps are epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct VehicleState {
    pub bus_id: String,
    pub route_id: String,
    pub direction: Direction,
    pub lat: f64,
    pub lng: f64,
    /// Reported ground speed in km/h.
    pub speed: f64,
    /// Completion along the route polyline, 0.0 to 1.0.
    pub progress: f64,
    /// Perpendicular distance to the route in meters; None while the shape
    /// is unavailable.
    pub deviation_meters: Option<f64>,
    pub is_off_track: bool,
    /// Set once when the vehicle crosses the off-track threshold, held
    /// unchanged until it recovers.
    pub off_track_since_ts: Option<i64>,
    pub trip_status: TripStatus,
    /// Timestamp of the first tick of the dwell window that committed the
    /// current arrival; None while in route.
    pub arrival_timestamp: Option<i64>,
    /// First tick of the current arrival candidacy, if one is running.
    pub arrival_candidate_since_ts: Option<i64>,
    /// First tick outside the arrival gate since arriving, if any.
    pub arrival_outside_since_ts: Option<i64>,
    /// Consecutive ticks that passed the arrival gate.
    pub arrival_zone_hit_count: u32,
    /// Set by a manual arrival override; the next fix restarts the trip
    /// from a clean baseline and clears it.
    pub pending_auto_reset: bool,
    /// Timestamp of the fix this record was computed from.
    pub timestamp: i64,
}

impl VehicleState {
    /// Baseline record for a vehicle with no usable history: first fix ever,
    /// a route change, or the fix after a manual override.
    pub fn fresh(bus_id: &str, route_id: &str, direction: Direction, timestamp: i64) -> Self {
        Self {
            bus_id: bus_id.to_string(),
            route_id: route_id.to_string(),
            direction,
            lat: 0.0,
            lng: 0.0,
            speed: 0.0,
            progress: 0.0,
            deviation_meters: None,
            is_off_track: false,
            off_track_since_ts: None,
            trip_status: TripStatus::InRoute,
            arrival_timestamp: None,
            arrival_candidate_since_ts: None,
            arrival_outside_since_ts: None,
            arrival_zone_hit_count: 0,
            pending_auto_reset: false,
            timestamp,
        }
    }
}
