pub mod routes;

pub use routes::{CachedRouteSource, RouteShape, RouteSource, RouteSourceError, SqliteRouteSource};
