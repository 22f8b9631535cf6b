//! Gateway web server module.
//!
//! A thin HTTP edge in front of the `RequestBroker`:
//! - `GET /health` reports the broker link state
//! - `POST /api/:service/:action` forwards a JSON call to a backend service
//!
//! All business logic lives behind the queues.

pub mod handlers;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

pub use handlers::{
    caller_headers, forward, health, into_http, parse_payload, AppState, EdgeError,
    HealthResponse,
};

/// Build the gateway router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/:service/:action", post(forward))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
