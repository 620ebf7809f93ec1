//! HTTP API endpoints
//!
//! Polled by the desktop UI. Bodies are parsed by hand from raw bytes so that
//! malformed input always gets a `400` with a small JSON error body.

use std::net::SocketAddr;

use axum::{
    body::Bytes,
    extract::{ConnectInfo, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use pairgate_core::{
    ClientIdentity, PairingAttempt, PairingError, PairingService, RequestId, RequestSummary,
    StatusOutcome,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info, warn};

#[derive(Clone)]
pub struct ApiState {
    pub service: PairingService,
}

/// Create API router
pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/daemon/pairing/requests", get(list_requests))
        .route("/daemon/pairing/approve", post(approve_request))
        .route("/daemon/pairing/dismiss", post(dismiss_request))
        .route("/daemon/pairing/status", get(request_status))
        .route("/daemon/ui/pairing", post(notify_pairing))
        .route("/daemon/health", get(health_handler))
        .with_state(state)
}

/// Wire form of a pending request.
#[derive(Serialize)]
struct PendingRequest {
    request_id: String,
    client_ip: String,
    status: &'static str,
    host_id: String,
    message: String,
    age_sec: u64,
}

impl From<RequestSummary> for PendingRequest {
    fn from(summary: RequestSummary) -> Self {
        Self {
            request_id: summary.request_id.to_string(),
            client_ip: summary.client_ip.unwrap_or_else(|| "unknown".to_string()),
            status: summary.status.as_str(),
            host_id: summary.client_identity.to_string(),
            message: summary.message,
            age_sec: summary.age_secs,
        }
    }
}

#[derive(Serialize)]
struct ListResponse {
    requests: Vec<PendingRequest>,
}

#[derive(Serialize)]
struct ActionResponse {
    ok: bool,
    request_id: String,
    status: &'static str,
}

/// GET /daemon/pairing/requests - Pending requests, oldest first
async fn list_requests(State(state): State<ApiState>) -> Response {
    let requests = state
        .service
        .list_requests()
        .await
        .into_iter()
        .map(PendingRequest::from)
        .collect();

    Json(ListResponse { requests }).into_response()
}

/// POST /daemon/pairing/approve - Approve a pending request
async fn approve_request(State(state): State<ApiState>, body: Bytes) -> Response {
    let request_id = match request_id_from_body(&body) {
        Ok(id) => id,
        Err(response) => return response,
    };

    match state.service.approve(&request_id).await {
        Ok(outcome) => Json(ActionResponse {
            ok: outcome.ok(),
            request_id: request_id.to_string(),
            status: outcome.status().map(|s| s.as_str()).unwrap_or("unknown"),
        })
        .into_response(),
        Err(e) => pairing_error_response(&e),
    }
}

/// POST /daemon/pairing/dismiss - Dismiss a request
async fn dismiss_request(State(state): State<ApiState>, body: Bytes) -> Response {
    let request_id = match request_id_from_body(&body) {
        Ok(id) => id,
        Err(response) => return response,
    };

    match state.service.dismiss(&request_id).await {
        Ok(outcome) => Json(ActionResponse {
            ok: outcome.ok(),
            request_id: request_id.to_string(),
            status: outcome.status().map(|s| s.as_str()).unwrap_or("unknown"),
        })
        .into_response(),
        Err(e) => pairing_error_response(&e),
    }
}

#[derive(Deserialize)]
struct StatusQuery {
    request_id: Option<String>,
}

/// GET /daemon/pairing/status?request_id=... - Single request lookup
async fn request_status(
    State(state): State<ApiState>,
    Query(query): Query<StatusQuery>,
) -> Response {
    let raw = match query.request_id {
        Some(raw) => raw,
        None => return error_response(StatusCode::BAD_REQUEST, "missing_request_id"),
    };
    let request_id = match RequestId::parse(&raw) {
        Ok(id) => id,
        Err(e) => return pairing_error_response(&e),
    };

    match state.service.status(&request_id).await {
        StatusOutcome::Found(request) => {
            let age_sec = request.age_secs(state.service.now());
            Json(json!({
                "request_id": request.request_id.to_string(),
                "status": request.status.as_str(),
                "host_id": request.client_identity.as_str(),
                "client_ip": request.client_ip_display(),
                "message": request.message,
                "age_sec": age_sec,
            }))
            .into_response()
        }
        StatusOutcome::NotFound => error_response(StatusCode::NOT_FOUND, "unknown_request_id"),
    }
}

#[derive(Deserialize)]
struct NotifyRequest {
    host_id: Option<String>,
    client_ip: Option<String>,
    message: Option<String>,
}

/// POST /daemon/ui/pairing - Register an inbound pairing attempt
async fn notify_pairing(
    State(state): State<ApiState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    body: Bytes,
) -> Response {
    let request: NotifyRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => {
            warn!("Failed to parse pairing notification: {}", e);
            return error_response(StatusCode::BAD_REQUEST, "invalid_json");
        }
    };

    let host_id = match request.host_id.as_deref().map(str::trim) {
        Some(host_id) if !host_id.is_empty() => host_id.to_string(),
        _ => return error_response(StatusCode::BAD_REQUEST, "missing_host_id"),
    };
    let identity = match ClientIdentity::parse(&host_id) {
        Ok(identity) => identity,
        Err(e) => return pairing_error_response(&e),
    };

    let mut attempt = PairingAttempt::new(identity);
    match request.client_ip {
        Some(ip) => attempt = attempt.with_client_ip(ip),
        None => {
            if let Some(ConnectInfo(addr)) = peer {
                attempt = attempt.with_client_ip(addr.ip().to_string());
            }
        }
    }
    if let Some(message) = request.message {
        attempt = attempt.with_message(message);
    }

    match state.service.admit(attempt).await {
        Ok(request_id) => {
            info!(request_id = %request_id, "Pairing notification accepted");
            Json(ActionResponse {
                ok: true,
                request_id: request_id.to_string(),
                status: "pending",
            })
            .into_response()
        }
        Err(e) => pairing_error_response(&e),
    }
}

/// GET /daemon/health - Health check
async fn health_handler(State(state): State<ApiState>) -> Response {
    let trusted = match state.service.trusted_clients().await {
        Ok(clients) => clients.len(),
        Err(e) => {
            error!("Health check could not read trust ledger: {}", e);
            return pairing_error_response(&e);
        }
    };

    Json(json!({
        "ok": true,
        "ts": state.service.now(),
        "pending": state.service.store().pending_count(),
        "trusted": trusted,
    }))
    .into_response()
}

/// Pull a well-formed request id out of an action body.
fn request_id_from_body(body: &[u8]) -> Result<RequestId, Response> {
    let value: serde_json::Value = serde_json::from_slice(body).map_err(|e| {
        warn!("Failed to parse action body: {}", e);
        error_response(StatusCode::BAD_REQUEST, "invalid_json")
    })?;

    let raw = match value.get("request_id") {
        Some(serde_json::Value::String(raw)) => raw,
        Some(_) => return Err(error_response(StatusCode::BAD_REQUEST, "invalid_request_id")),
        None => return Err(error_response(StatusCode::BAD_REQUEST, "missing_request_id")),
    };

    RequestId::parse(raw).map_err(|e| pairing_error_response(&e))
}

fn pairing_error_response(err: &PairingError) -> Response {
    let status = match err {
        PairingError::NotFound => StatusCode::NOT_FOUND,
        PairingError::CapacityExceeded { .. } => StatusCode::SERVICE_UNAVAILABLE,
        PairingError::LedgerWriteFailure(_) | PairingError::RandomnessUnavailable(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
        e if e.is_client_error() => StatusCode::BAD_REQUEST,
        _ => StatusCode::CONFLICT,
    };

    if status.is_server_error() {
        error!(code = err.code(), "Pairing operation failed: {}", err);
    }

    error_response(status, err.code())
}

fn error_response(status: StatusCode, code: &str) -> Response {
    (status, Json(json!({ "error": code }))).into_response()
}
