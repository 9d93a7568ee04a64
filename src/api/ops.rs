//! Operator endpoints: manual trip overrides, audit readback, and system
//! alert broadcast. Everything here requires an admin bearer token.

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::Json;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::error::{error_response, internal_error};
use super::{AppState, ErrorResponse};
use crate::auth::Claims;
use crate::fanout::{encode_frame, Channel, SystemAlert};
use crate::models::{is_valid_id, VehicleState};
use crate::services::engine::{ManualArrivalRequest, OverrideError};
use crate::store::{AuditRecord, RealtimeStore};

#[derive(Debug, Deserialize, ToSchema)]
pub struct AlertRequest {
    pub message: String,
    /// Defaults to "info".
    pub severity: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct AlertResponse {
    /// Connections the alert was queued for.
    pub delivered: usize,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct TrailResponse {
    pub bus_id: String,
    /// Oldest first.
    pub entries: Vec<AuditRecord>,
}

fn require_admin(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<Claims, (StatusCode, Json<ErrorResponse>)> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or_else(|| error_response(StatusCode::UNAUTHORIZED, "Missing bearer token"))?;
    let claims = state
        .verifier
        .verify(token)
        .map_err(|_| error_response(StatusCode::UNAUTHORIZED, "Invalid token"))?;
    if !claims.is_admin() {
        return Err(error_response(StatusCode::FORBIDDEN, "Admin role required"));
    }
    Ok(claims)
}

fn map_override_error(error: OverrideError) -> (StatusCode, Json<ErrorResponse>) {
    match error {
        OverrideError::StateUnavailable => {
            error_response(StatusCode::NOT_FOUND, "REALTIME_STATE_UNAVAILABLE")
        }
        OverrideError::MissingLocation => {
            error_response(StatusCode::UNPROCESSABLE_ENTITY, "MISSING_BUS_LOCATION")
        }
        OverrideError::Store(error) => internal_error(error),
    }
}

/// Force a vehicle into ARRIVED. The override is consumed by the vehicle's
/// next GPS fix, which restarts the trip from a clean baseline.
#[utoipa::path(
    post,
    path = "/ops/vehicles/{bus_id}/arrival",
    params(("bus_id" = String, Path, description = "Vehicle identifier")),
    request_body = ManualArrivalRequest,
    responses(
        (status = 200, description = "Updated vehicle state", body = VehicleState),
        (status = 404, description = "No realtime state and no route identity given", body = ErrorResponse),
        (status = 422, description = "No location known for the vehicle", body = ErrorResponse),
        (status = 401, description = "Missing or invalid token", body = ErrorResponse),
        (status = 403, description = "Token lacks the admin role", body = ErrorResponse)
    ),
    tag = "ops"
)]
pub async fn force_arrival(
    State(state): State<AppState>,
    Path(bus_id): Path<String>,
    headers: HeaderMap,
    body: Option<Json<ManualArrivalRequest>>,
) -> Result<Json<VehicleState>, (StatusCode, Json<ErrorResponse>)> {
    let claims = require_admin(&state, &headers)?;
    if !is_valid_id(&bus_id) {
        return Err(error_response(
            StatusCode::NOT_FOUND,
            "REALTIME_STATE_UNAVAILABLE",
        ));
    }

    let request = body.map(|Json(body)| body).unwrap_or_default();
    let now_ms = chrono::Utc::now().timestamp_millis();
    match state.engine.force_arrival(&bus_id, request, now_ms).await {
        Ok(updated) => {
            tracing::info!(bus_id = %bus_id, admin = %claims.sub, "Manual arrival applied");
            Ok(Json(updated))
        }
        Err(error) => Err(map_override_error(error)),
    }
}

/// Revert a manual arrival without waiting for the next fix.
#[utoipa::path(
    delete,
    path = "/ops/vehicles/{bus_id}/arrival",
    params(("bus_id" = String, Path, description = "Vehicle identifier")),
    responses(
        (status = 200, description = "Updated vehicle state", body = VehicleState),
        (status = 404, description = "No realtime state for this vehicle", body = ErrorResponse),
        (status = 401, description = "Missing or invalid token", body = ErrorResponse),
        (status = 403, description = "Token lacks the admin role", body = ErrorResponse)
    ),
    tag = "ops"
)]
pub async fn clear_arrival(
    State(state): State<AppState>,
    Path(bus_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<VehicleState>, (StatusCode, Json<ErrorResponse>)> {
    let claims = require_admin(&state, &headers)?;
    if !is_valid_id(&bus_id) {
        return Err(error_response(
            StatusCode::NOT_FOUND,
            "REALTIME_STATE_UNAVAILABLE",
        ));
    }

    let now_ms = chrono::Utc::now().timestamp_millis();
    match state.engine.clear_arrival(&bus_id, now_ms).await {
        Ok(updated) => {
            tracing::info!(bus_id = %bus_id, admin = %claims.sub, "Manual arrival cleared");
            Ok(Json(updated))
        }
        Err(error) => Err(map_override_error(error)),
    }
}

/// Raw message trail retained for a vehicle.
#[utoipa::path(
    get,
    path = "/ops/vehicles/{bus_id}/trail",
    params(("bus_id" = String, Path, description = "Vehicle identifier")),
    responses(
        (status = 200, description = "Retained raw messages, oldest first", body = TrailResponse),
        (status = 401, description = "Missing or invalid token", body = ErrorResponse),
        (status = 403, description = "Token lacks the admin role", body = ErrorResponse)
    ),
    tag = "ops"
)]
pub async fn audit_trail(
    State(state): State<AppState>,
    Path(bus_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<TrailResponse>, (StatusCode, Json<ErrorResponse>)> {
    require_admin(&state, &headers)?;
    if !is_valid_id(&bus_id) {
        return Ok(Json(TrailResponse {
            bus_id,
            entries: Vec::new(),
        }));
    }

    let entries = state
        .store
        .audit_trail(&bus_id)
        .await
        .map_err(internal_error)?;
    Ok(Json(TrailResponse { bus_id, entries }))
}

///// Broadcast an operational alert to `system:alerts` subscribers.
#[utoipa::path(
    post,
    path = "/ops/alerts",
    request_body = AlertRequest,
    responses(
        (status = 200, description = "Alert queued for delivery", body = AlertResponse),
        (status = 401, description = "Missing or invalid token", body = ErrorResponse),
        (status = 403, description = "Token lacks the admin role", body = ErrorResponse)
    ),
    tag = "ops"
)]
pub async fn broadcast_alert(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<AlertRequest>,
) -> Result<Json<AlertResponse>, (StatusCode, Json<ErrorResponse>)> {
    let claims = require_admin(&state, &headers)?;

    let alert = SystemAlert {
        message: request.message,
        severity: request.severity.unwrap_or_else(|| "info".to_string()),
        timestamp: chrono::Utc::now().timestamp_millis(),
    };
    let frame = encode_frame(&Channel::SystemAlerts, &alert).map_err(internal_error)?;
    let delivered = state.registry.broadcast(&Channel::SystemAlerts, &frame).await;

    tracing::info!(admin = %claims.sub, severity = %alert.severity, delivered, "System alert broadcast");
    Ok(Json(AlertResponse { delivered }))
}
