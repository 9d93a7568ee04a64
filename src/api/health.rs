use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;
use utoipa::ToSchema;

use super::AppState;
use crate::services::sweeper::SweepStats;
use crate::store::RealtimeStore;

#[derive(Debug, Serialize, ToSchema)]
pub struct MqttHealth {
    /// Whether the broker connection is up
    pub connected: bool,
    /// Whether the GPS topic subscription is active
    pub subscribed: bool,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct StoreHealth {
    pub ok: bool,
    /// Round-trip probe latency; absent when the probe failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ConnectionsHealth {
    /// Open WebSocket connections
    pub connected: usize,
    /// Active channel subscriptions across all connections
    pub subscriptions: usize,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    /// "ok" when every dependency responds, otherwise "degraded"
    pub status: String,
    pub mqtt: MqttHealth,
    pub store: StoreHealth,
    pub stale_sweep: SweepStats,
    pub connections: ConnectionsHealth,
    pub uptime_seconds: u64,
    /// RFC 3339 server time
    pub timestamp: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ReadinessChecks {
    pub mqtt_connected: bool,
    pub mqtt_subscribed: bool,
    pub store_ok: bool,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ReadinessResponse {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checks: Option<ReadinessChecks>,
}

/// Full dependency report. Always 200; consumers inspect the sections.
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service health report", body = HealthResponse)
    ),
    tag = "health"
)]
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let store = match state.store.ping().await {
        Ok(latency) => StoreHealth {
            ok: true,
            latency_ms: Some(latency.as_millis() as u64),
        },
        Err(_) => StoreHealth {
            ok: false,
            latency_ms: None,
        },
    };
    let mqtt = MqttHealth {
        connected: state.transport.is_connected(),
        subscribed: state.transport.is_subscribed(),
    };
    let (connected, subscriptions) = state.registry.counts().await;
    let stale_sweep = state.sweep_stats.read().await.clone();

    let status = if store.ok && mqtt.connected {
        "ok"
    } else {
        "degraded"
    };

    Json(HealthResponse {
        status: status.to_string(),
        mqtt,
        store,
        stale_sweep,
        connections: ConnectionsHealth {
            connected,
            subscriptions,
        },
        uptime_seconds: state.started_at.elapsed().as_secs(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

/// Readiness gate for load balancers: ready only once telemetry flows in
/// and the store answers.
#[utoipa::path(
    get,
    path = "/ready",
    responses(
        (status = 200, description = "Service is ready", body = ReadinessResponse),
        (status = 503, description = "One or more dependencies are not ready", body = ReadinessResponse)
    ),
    tag = "health"
)]
pub async fn readiness(State(state): State<AppState>) -> (StatusCode, Json<ReadinessResponse>) {
    let checks = ReadinessChecks {
        mqtt_connected: state.transport.is_connected(),
        mqtt_subscribed: state.transport.is_subscribed(),
        store_ok: state.store.ping().await.is_ok(),
    };

    if checks.mqtt_connected && checks.mqtt_subscribed && checks.store_ok {
        (
            StatusCode::OK,
            Json(ReadinessResponse {
                status: "ready".to_string(),
                checks: None,
            }),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadinessResponse {
                status: "not_ready".to_string(),
                checks: Some(checks),
            }),
        )
    }
}
