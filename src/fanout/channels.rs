//! Channel grammar and per-channel authorization rules.

use crate::auth::Claims;
use crate::models::{is_valid_id, Direction};

/// A subscribable topic. Wire forms:
///
/// - `bus:{busId}`: one vehicle's own updates
/// - `route:{routeId}:{direction}`: every vehicle on a route
/// - `admin-route:{routeId}:{direction}`: the enriched operator view
/// - `system:alerts`: operational broadcasts
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Channel {
    Bus { bus_id: String },
    Route { route_id: String, direction: Direction },
    AdminRoute { route_id: String, direction: Direction },
    SystemAlerts,
}

impl Channel {
    pub fn parse(raw: &str) -> Option<Self> {
        let mut parts = raw.split(':');
        match (parts.next()?, parts.next(), parts.next(), parts.next()) {
            ("bus", Some(bus_id), None, None) if is_valid_id(bus_id) => Some(Channel::Bus {
                bus_id: bus_id.to_string(),
            }),
            ("route", Some(route_id), Some(direction), None) if is_valid_id(route_id) => {
                Direction::parse(direction).map(|direction| Channel::Route {
                    route_id: route_id.to_string(),
                    direction,
                })
            }
            ("admin-route", Some(route_id), Some(direction), None) if is_valid_id(route_id) => {
                Direction::parse(direction).map(|direction| Channel::AdminRoute {
                    route_id: route_id.to_string(),
                    direction,
                })
            }
            ("system", Some("alerts"), None, None) => Some(Channel::SystemAlerts),
            _ => None,
        }
    }

    pub fn name(&self) -> String {
        match self {
            Channel::Bus { bus_id } => format!("bus:{bus_id}"),
            Channel::Route {
                route_id,
                direction,
            } => format!("route:{}:{}", route_id, direction.as_str()),
            Channel::AdminRoute {
                route_id,
                direction,
            } => format!("admin-route:{}:{}", route_id, direction.as_str()),
            Channel::SystemAlerts => "system:alerts".to_string(),
        }
    }

    /// Whether a set of verified claims may watch this channel.
    ///
    /// A bus channel belongs to the vehicle itself: the token subject must
    /// be the bus and carry a route assignment. Route channels require the
    /// token to be pinned to exactly that route and direction. Admin views
    /// require the admin role, narrowed by the routeScopes allowlist when
    /// one is present.
    pub fn authorized(&self, claims: &Claims) -> bool {
        match self {
            Channel::Bus { bus_id } => {
                claims.sub == *bus_id && claims.route_id.is_some() && claims.direction.is_some()
            }
            Channel::Route {
                route_id,
                direction,
            } => {
                claims.route_id.as_deref() == Some(route_id.as_str())
                    && claims.direction == Some(*direction)
            }
            Channel::AdminRoute {
                route_id,
                direction,
            } => claims.is_admin() && claims.allows_admin_route(route_id, *direction),
            Channel::SystemAlerts => claims.is_admin(),
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name())
    }
}
