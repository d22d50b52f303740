//! Admin HTTP API: the intake/admin surface for enrolling and monitoring
//! agents.

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::{json, Value};

use stream_agency_schemas::{now_ms, AgencyError};

use crate::auth::is_authorized;
use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/report", get(report))
        .route("/agent", get(get_agent))
        .route("/enroll", post(enroll))
        .route("/pause", post(pause))
        .route("/resume", post(resume))
        .route("/remove", post(remove))
        .route("/tick", post(tick))
        .with_state(state)
}

fn unauthorized() -> axum::response::Response {
    (StatusCode::UNAUTHORIZED, Json(json!({"ok": false, "error": "Unauthorized"}))).into_response()
}

fn require_auth(state: &AppState, headers: &HeaderMap) -> Result<(), axum::response::Response> {
    if is_authorized(headers, state.api_token.as_deref()) {
        Ok(())
    } else {
        Err(unauthorized())
    }
}

fn agency_error_response(e: AgencyError) -> axum::response::Response {
    let status = match e {
        AgencyError::NotFound(_) => StatusCode::NOT_FOUND,
        AgencyError::Validation(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::BAD_REQUEST,
    };
    (status, Json(json!({"ok": false, "error": e.to_string()}))).into_response()
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "ok": true,
        "time_ms": now_ms(),
        "billing_enabled": state.cfg.billing_enabled,
    }))
}

async fn report(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> axum::response::Response {
    if let Err(resp) = require_auth(&state, &headers) {
        return resp;
    }
    match stream_agency_core::admin::report(&state.pool).await {
        Ok(agents) => Json(json!({"ok": true, "agents": agents})).into_response(),
        Err(e) => agency_error_response(e),
    }
}

#[derive(Deserialize)]
pub struct AgentQuery {
    #[serde(default)]
    address: String,
}

async fn get_agent(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<AgentQuery>,
) -> axum::response::Response {
    if let Err(resp) = require_auth(&state, &headers) {
        return resp;
    }
    let address = query.address.trim();
    if address.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"ok": false, "error": "Missing address query parameter"})),
        )
            .into_response();
    }

    match stream_agency_core::admin::recent_attempts(&state.pool, address, 10).await {
        Ok(attempts) => Json(json!({
            "ok": true,
            "address": address,
            "recent_attempts": attempts,
        }))
        .into_response(),
        Err(e) => agency_error_response(e),
    }
}

async fn enroll(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> axum::response::Response {
    if let Err(resp) = require_auth(&state, &headers) {
        return resp;
    }

    let address = payload.get("address").and_then(Value::as_str).unwrap_or("").trim().to_string();
    let signature = payload.get("signature").and_then(Value::as_str).unwrap_or("").trim().to_string();
    let fee_bps = payload.get("fee_bps").and_then(Value::as_i64).unwrap_or(500);

    match stream_agency_core::admin::enroll(
        &state.pool,
        state.stream_client.as_ref(),
        &state.cfg,
        &address,
        &signature,
        fee_bps,
    )
    .await
    {
        Ok(agent) => Json(json!({"ok": true, "address": agent.address, "fee_bps": agent.fee_bps}))
            .into_response(),
        Err(e) => agency_error_response(e),
    }
}

#[derive(Deserialize)]
struct AddressPayload {
    #[serde(default)]
    address: String,
}

async fn pause(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<AddressPayload>,
) -> axum::response::Response {
    if let Err(resp) = require_auth(&state, &headers) {
        return resp;
    }
    let address = payload.address.trim();
    match stream_agency_core::admin::pause(&state.pool, address).await {
        Ok(()) => Json(json!({"ok": true, "address": address, "status": "paused"})).into_response(),
        Err(e) => agency_error_response(e),
    }
}

async fn resume(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<AddressPayload>,
) -> axum::response::Response {
    if let Err(resp) = require_auth(&state, &headers) {
        return resp;
    }
    let address = payload.address.trim();
    match stream_agency_core::admin::resume(&state.pool, address).await {
        Ok(()) => Json(json!({"ok": true, "address": address, "status": "active"})).into_response(),
        Err(e) => agency_error_response(e),
    }
}

async fn remove(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<AddressPayload>,
) -> axum::response::Response {
    if let Err(resp) = require_auth(&state, &headers) {
        return resp;
    }
    let address = payload.address.trim();
    match stream_agency_core::admin::remove(&state.pool, address).await {
        Ok(()) => Json(json!({"ok": true, "address": address, "removed": true})).into_response(),
        Err(e) => agency_error_response(e),
    }
}

async fn tick(State(state): State<AppState>, headers: HeaderMap) -> axum::response::Response {
    if let Err(resp) = require_auth(&state, &headers) {
        return resp;
    }
    match state.scheduler.execute_tick().await {
        Ok(report) => Json(json!({"ok": true, "report": report})).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"ok": false, "error": e.to_string()})),
        )
            .into_response(),
    }
}
