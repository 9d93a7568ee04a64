pub mod vehicle;

pub use vehicle::VehicleState;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Travel direction along a route. The wire format uses the uppercase
/// names verbatim in topics, channels and token claims.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
pub enum Direction {
    #[serde(rename = "FORWARD")]
    Forward,
    #[serde(rename = "BACKWARD")]
    Backward,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Forward => "FORWARD",
            Direction::Backward => "BACKWARD",
        }
    }

    /// Exact-match parse; anything but the two canonical spellings is rejected.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "FORWARD" => Some(Direction::Forward),
            "BACKWARD" => Some(Direction::Backward),
            _ => None,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trip phase of a tracked vehicle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub enum TripStatus {
    #[serde(rename = "IN_ROUTE")]
    InRoute,
    #[serde(rename = "ARRIVED")]
    Arrived,
}

impl TripStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TripStatus::InRoute => "IN_ROUTE",
            TripStatus::Arrived => "ARRIVED",
        }
    }
}

/// Raw GPS fix as published by a vehicle, before validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GpsFix {
    pub lat: f64,
    pub lng: f64,
    /// Reported ground speed in km/h.
    pub speed: f64,
    /// Compass heading in degrees, if the device reports one.
    #[serde(default)]
    pub heading: Option<f64>,
    /// Device clock at the moment of the fix, epoch milliseconds.
    pub timestamp: i64,
}

/// A validated fix bound to its route identity, ready for the state engine.
#[derive(Debug, Clone)]
pub struct NormalizedEvent {
    pub bus_id: String,
    pub route_id: String,
    pub direction: Direction,
    pub lat: f64,
    pub lng: f64,
    /// Speed in km/h, as reported.
    pub speed: f64,
    /// Normalized completion along the route polyline, 0.0 to 1.0.
    pub progress: f64,
    /// Perpendicular distance to the route, None when the shape was unavailable.
    pub deviation_meters: Option<f64>,
    pub timestamp: i64,
}

/// One resolved neighbor of a vehicle on the same route and direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct NeighborDetail {
    pub bus_id: String,
    /// Along-route separation in meters; None when the route length or the
    /// neighbor's progress is unknown.
    pub distance_meters: Option<f64>,
    /// Seconds for this vehicle to cover the separation at its current speed;
    /// None whenever the distance is None or the speed is not positive.
    pub eta_seconds: Option<i64>,
}

/// Identifiers that travel in topics, channels and claims: route ids and
/// bus ids share one charset so every layer validates them the same way.
pub fn is_valid_id(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 64
        && s.bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_parse_is_exact() {
        assert_eq!(Direction::parse("FORWARD"), Some(Direction::Forward));
        assert_eq!(Direction::parse("BACKWARD"), Some(Direction::Backward));
        assert_eq!(Direction::parse("forward"), None);
        assert_eq!(Direction::parse("Forward"), None);
        assert_eq!(Direction::parse(""), None);
    }

    #[test]
    fn test_trip_status_wire_names() {
        assert_eq!(
            serde_json::to_string(&TripStatus::InRoute).unwrap(),
            "\"IN_ROUTE\""
        );
        assert_eq!(
            serde_json::to_string(&TripStatus::Arrived).unwrap(),
            "\"ARRIVED\""
        );
    }

    #[test]
    fn test_gps_fix_accepts_missing_heading() {
        let fix: GpsFix =
            serde_json::from_str(r#"{"lat":51.05,"lng":13.74,"speed":24.5,"timestamp":1700000000000}"#)
                .unwrap();
        assert_eq!(fix.heading, None);
        assert_eq!(fix.timestamp, 1_700_000_000_000);
    }

    #[test]
    fn test_id_charset() {
        assert!(is_valid_id("bus-42"));
        assert!(is_valid_id("R12_night"));
        assert!(!is_valid_id(""));
        assert!(!is_valid_id("bus:42"));
        assert!(!is_valid_id("bus 42"));
        assert!(!is_valid_id(&"x".repeat(65)));
    }
}
