//! Business handler interface.
//!
//! Handlers are opaque to the bridge. Expected failures (validation,
//! conflicts, missing records) come back as a 4xx `Reply`; anything returned
//! as `Err` is treated as an unexpected failure and becomes a 500.

use std::future::Future;

use async_trait::async_trait;
use serde_json::Value;

use crate::queue::{ErrorBody, Headers, QueueResponse};

/// Everything a handler gets to see about one request.
#[derive(Debug, Clone)]
pub struct HandlerRequest {
    pub request_id: String,
    pub action: String,
    pub payload: Value,
    pub headers: Headers,
}

impl HandlerRequest {
    /// String header value, e.g. the authenticated user id.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(Value::as_str)
    }
}

/// Handler outcome, before the bridge stamps the request id on it.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub status_code: u16,
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<ErrorBody>,
}

impl Reply {
    pub fn ok(data: Value) -> Self {
        Self::success(200, data)
    }

    pub fn created(data: Value) -> Self {
        Self::success(201, data)
    }

    pub fn success(status_code: u16, data: Value) -> Self {
        Self {
            status_code,
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(status_code: u16, message: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            status_code,
            success: false,
            data: None,
            error: Some(ErrorBody::new(message, code)),
        }
    }

    pub fn into_response(self, request_id: impl Into<String>) -> QueueResponse {
        QueueResponse {
            request_id: request_id.into(),
            success: self.success,
            status_code: self.status_code,
            data: self.data,
            error: self.error,
        }
    }
}

#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, request: HandlerRequest) -> anyhow::Result<Reply>;
}

/// Adapter turning an async function into a `Handler`.
pub struct HandlerFn<F> {
    f: F,
}

pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(HandlerRequest) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Reply>> + Send + 'static,
{
    HandlerFn { f }
}

#[async_trait]
impl<F, Fut> Handler for HandlerFn<F>
where
    F: Fn(HandlerRequest) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Reply>> + Send + 'static,
{
    async fn handle(&self, request: HandlerRequest) -> anyhow::Result<Reply> {
        (self.f)(request).await
    }
}
