//! Error types for the queue bridge.

use std::time::Duration;

use thiserror::Error;

pub type BridgeResult<T> = Result<T, BridgeError>;

/// Errors surfaced by the bridge.
///
/// Transport failures (`Connect`, `NotConnected`, `Channel`, `Amqp`) are
/// normally absorbed by the reconnect loop. Callers of `RequestBroker::send`
/// only ever see `Timeout`, `UnknownService`, `Encode`, `ConnectionLost`
/// (fast-fail mode) or `ShuttingDown`.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("broker connection failed: {0}")]
    Connect(String),

    #[error("not connected to broker")]
    NotConnected,

    #[error("channel error: {0}")]
    Channel(String),

    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),

    #[error("no queue configured for service `{0}`")]
    UnknownService(String),

    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("request {request_id} timed out after {timeout:?}")]
    Timeout {
        request_id: String,
        timeout: Duration,
    },

    #[error("request id {0} is already pending")]
    DuplicateRequest(String),

    #[error("connection to broker lost")]
    ConnectionLost,

    #[error("bridge is shutting down")]
    ShuttingDown,
}

impl BridgeError {
    /// True when the caller gave up waiting for a correlated response.
    pub fn is_timeout(&self) -> bool {
        matches!(self, BridgeError::Timeout { .. })
    }
}
