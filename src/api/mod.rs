pub mod error;
pub mod health;
pub mod ops;
pub mod ws;

pub use error::{internal_error, ErrorResponse};

use std::sync::Arc;
use std::time::Instant;

use axum::routing::{get, post};
use axum::{Json, Router};
use tokio::sync::RwLock;
use utoipa::OpenApi;

use crate::auth::JwtVerifier;
use crate::config::WsConfig;
use crate::fanout::{ConnectionRegistry, UpdateEnricher};
use crate::ingest::TransportHealth;
use crate::providers::SqliteRouteSource;
use crate::services::engine::VehicleStateEngine;
use crate::services::sweeper::SweepStats;
use crate::store::MemoryStore;

/// Shared handler state. The HTTP surface binds the shipped store and route
/// source; the services underneath stay generic over their traits.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<MemoryStore>,
    pub engine: Arc<VehicleStateEngine<MemoryStore>>,
    pub enricher: Arc<UpdateEnricher<MemoryStore, SqliteRouteSource>>,
    pub registry: Arc<ConnectionRegistry>,
    pub verifier: Arc<JwtVerifier>,
    pub transport: Arc<TransportHealth>,
    pub sweep_stats: Arc<RwLock<SweepStats>>,
    pub ws: WsConfig,
    pub started_at: Instant,
}

#[derive(OpenApi)]
#[openapi(
    info(title = "Live Bus Realtime API", version = "0.1.0"),
    paths(
        health::health_check,
        health::readiness,
        ops::force_arrival,
        ops::clear_arrival,
        ops::audit_trail,
        ops::broadcast_alert,
    ),
    components(schemas(
        error::ErrorResponse,
        health::HealthResponse,
        health::MqttHealth,
        health::StoreHealth,
        health::ConnectionsHealth,
        health::ReadinessResponse,
        health::ReadinessChecks,
        ops::AlertRequest,
        ops::AlertResponse,
        ops::TrailResponse,
        crate::models::Direction,
        crate::models::TripStatus,
        crate::models::NeighborDetail,
        crate::models::VehicleState,
        crate::services::engine::ManualArrivalRequest,
        crate::services::sweeper::SweepStats,
        crate::store::AuditRecord,
        crate::fanout::VehiclePayload,
        crate::fanout::AdminVehiclePayload,
        crate::fanout::NeighborSummary,
        crate::fanout::SystemAlert,
    )),
    tags(
        (name = "health", description = "Liveness and readiness reporting"),
        (name = "ops", description = "Operator overrides and diagnostics")
    )
)]
pub struct ApiDoc;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/ready", get(health::readiness))
        .route("/ws", get(ws::ws_handler))
        .route(
            "/ops/vehicles/{bus_id}/arrival",
            post(ops::force_arrival).delete(ops::clear_arrival),
        )
        .route("/ops/vehicles/{bus_id}/trail", get(ops::audit_trail))
        .route("/ops/alerts", post(ops::broadcast_alert))
        .route("/api-docs/openapi.json", get(openapi_json))
        .with_state(state)
}

async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}
