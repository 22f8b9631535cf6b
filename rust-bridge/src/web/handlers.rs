//! Gateway HTTP endpoint handlers.
//!
//! `POST /api/:service/:action` forwards the JSON body to the service's
//! request queue and answers with whatever the service replied. Bridge
//! failures (timeout, shutdown) never leak as a 500: they become
//! `503 UPSTREAM_UNAVAILABLE`.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::error::{BridgeError, BridgeResult};
use crate::gateway::RequestBroker;
use crate::queue::{codes, ErrorBody, Headers, QueueResponse};
use crate::supervisor::LinkState;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub broker: RequestBroker,
}

impl AppState {
    pub fn new(broker: RequestBroker) -> Self {
        Self { broker }
    }
}

/// HTTP header → envelope header forwarded as caller context.
const FORWARDED_HEADERS: [(&str, &str); 2] =
    [("x-user-id", "userId"), ("x-user-role", "userRole")];

// =============================================================================
// Health Check
// =============================================================================

/// Health check response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub link: LinkState,
    pub pending: usize,
    pub response_queue: String,
}

/// Health check endpoint. Reports 503 while the broker link is down.
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let link = state.broker.state();
    let (code, status) = match link {
        LinkState::Connected => (StatusCode::OK, "ok"),
        _ => (StatusCode::SERVICE_UNAVAILABLE, "degraded"),
    };

    (
        code,
        Json(HealthResponse {
            status,
            link,
            pending: state.broker.pending_count(),
            response_queue: state.broker.response_queue().to_string(),
        }),
    )
}

// =============================================================================
// RPC forwarding
// =============================================================================

/// Error body produced by the gateway itself.
#[derive(Debug, Serialize)]
pub struct EdgeError {
    pub success: bool,
    pub error: ErrorBody,
}

fn edge_error(status: StatusCode, message: impl Into<String>, code: &str) -> Response {
    (
        status,
        Json(EdgeError {
            success: false,
            error: ErrorBody::new(message, code),
        }),
    )
        .into_response()
}

/// Collect the caller context headers, if any were sent.
pub fn caller_headers(headers: &HeaderMap) -> Option<Headers> {
    let forwarded: Headers = FORWARDED_HEADERS
        .iter()
        .filter_map(|(http_name, envelope_name)| {
            let value = headers.get(*http_name)?.to_str().ok()?.trim();
            if value.is_empty() {
                return None;
            }
            Some((envelope_name.to_string(), Value::String(value.to_string())))
        })
        .collect();

    if forwarded.is_empty() {
        None
    } else {
        Some(forwarded)
    }
}

/// Decode the request body. An empty body is an empty object.
pub fn parse_payload(body: &[u8]) -> Result<Value, serde_json::Error> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Object(Map::new()));
    }
    serde_json::from_slice(body)
}

/// Map the outcome of `RequestBroker::send` to an HTTP response.
///
/// Service responses pass through with their own status code, 4xx and 5xx
/// included. Bridge errors map to 503, except an unknown service (404).
pub fn into_http(result: BridgeResult<QueueResponse>) -> Response {
    match result {
        Ok(response) => {
            let status =
                StatusCode::from_u16(response.status_code).unwrap_or(StatusCode::BAD_GATEWAY);
            (status, Json(response)).into_response()
        }
        Err(BridgeError::UnknownService(service)) => edge_error(
            StatusCode::NOT_FOUND,
            format!("Unknown service: {service}"),
            codes::SERVICE_NOT_FOUND,
        ),
        Err(e) => edge_error(
            StatusCode::SERVICE_UNAVAILABLE,
            format!("Service temporarily unavailable: {e}"),
            codes::UPSTREAM_UNAVAILABLE,
        ),
    }
}

/// Forward one call to a backend service.
pub async fn forward(
    State(state): State<AppState>,
    Path((service, action)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let payload = match parse_payload(&body) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(service = %service, action = %action, error = %e, "gateway_invalid_json");
            return edge_error(StatusCode::BAD_REQUEST, "Invalid JSON body", codes::INVALID_JSON);
        }
    };

    let caller = caller_headers(&headers);
    info!(
        service = %service,
        action = %action,
        body_length = body.len(),
        authenticated = caller.is_some(),
        "gateway_request_received"
    );

    into_http(state.broker.send(&service, &action, payload, caller).await)
}
