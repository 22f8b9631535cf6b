//! Action registry for one service.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tracing::{error, warn};

use super::handler::{Handler, HandlerRequest};
use crate::queue::{QueueMessage, QueueResponse};

/// Maps action names to handlers and turns every outcome into a response.
#[derive(Clone, Default)]
pub struct ActionRouter {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl ActionRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `action`, replacing any previous one.
    pub fn route(mut self, action: impl Into<String>, handler: impl Handler + 'static) -> Self {
        self.handlers.insert(action.into(), Arc::new(handler));
        self
    }

    pub fn contains(&self, action: &str) -> bool {
        self.handlers.contains_key(action)
    }

    pub fn actions(&self) -> Vec<&str> {
        let mut actions: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        actions.sort_unstable();
        actions
    }

    /// Run the handler for `message.action`.
    ///
    /// Never fails: an unknown action yields 404, and a handler error or
    /// panic yields 500 with the failure text in `error.details`.
    pub async fn dispatch(&self, message: QueueMessage) -> QueueResponse {
        let request_id = message.request_id;

        let Some(handler) = self.handlers.get(&message.action) else {
            warn!(
                request_id = %request_id,
                action = %message.action,
                "bridge_unknown_action"
            );
            return QueueResponse::not_found(request_id, &message.action);
        };

        let request = HandlerRequest {
            request_id: request_id.clone(),
            action: message.action.clone(),
            payload: message.payload,
            headers: message.headers.unwrap_or_default(),
        };

        match AssertUnwindSafe(handler.handle(request)).catch_unwind().await {
            Ok(Ok(reply)) => reply.into_response(request_id),
            Ok(Err(e)) => {
                error!(
                    request_id = %request_id,
                    action = %message.action,
                    error = %format!("{e:#}"),
                    "bridge_handler_failed"
                );
                QueueResponse::internal_error(request_id, format!("{e:#}"))
            }
            Err(panic) => {
                let details = panic_message(panic.as_ref());
                error!(
                    request_id = %request_id,
                    action = %message.action,
                    panic = %details,
                    "bridge_handler_panicked"
                );
                QueueResponse::internal_error(request_id, details)
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{bail, Context};
    use serde_json::{json, Value};

    use crate::queue::{codes, Service};
    use crate::service::handler::{handler_fn, Reply};

    async fn login(request: HandlerRequest) -> anyhow::Result<Reply> {
        let email = request.payload["email"].as_str().unwrap_or_default();
        Ok(Reply::ok(json!({ "id": "u1", "email": email })))
    }

    async fn broken(_request: HandlerRequest) -> anyhow::Result<Reply> {
        let raw = "not-a-number";
        let _n: u32 = raw.parse().context("parsing page size")?;
        bail!("unreachable")
    }

    async fn explode(_request: HandlerRequest) -> anyhow::Result<Reply> {
        panic!("database handle poisoned");
    }

    fn router() -> ActionRouter {
        ActionRouter::new()
            .route("login", handler_fn(login))
            .route("broken", handler_fn(broken))
            .route("explode", handler_fn(explode))
    }

    fn message(action: &str) -> QueueMessage {
        QueueMessage::new(
            "req-1",
            Service::Auth,
            action,
            json!({"email": "a@b.com", "password": "x"}),
            None,
        )
    }

    #[tokio::test]
    async fn test_dispatch_known_action() {
        let response = router().dispatch(message("login")).await;
        assert_eq!(response.request_id, "req-1");
        assert_eq!(response.status_code, 200);
        assert_eq!(response.data.unwrap()["email"], "a@b.com");
    }

    #[tokio::test]
    async fn test_unknown_action_is_404() {
        let response = router().dispatch(message("doesNotExist")).await;
        assert_eq!(response.status_code, 404);
        assert!(!response.success);
        assert_eq!(
            response.error.unwrap().code.as_deref(),
            Some(codes::ACTION_NOT_FOUND)
        );
    }

    #[tokio::test]
    async fn test_handler_error_is_500_with_details() {
        let response = router().dispatch(message("broken")).await;
        assert_eq!(response.status_code, 500);
        let details = response.error.unwrap().details.unwrap();
        assert!(details.as_str().unwrap().contains("parsing page size"));
    }

    #[tokio::test]
    async fn test_handler_panic_is_contained() {
        let router = router();
        let response = router.dispatch(message("explode")).await;
        assert_eq!(response.status_code, 500);
        assert_eq!(
            response.error.unwrap().details,
            Some(Value::String("database handle poisoned".to_string()))
        );

        // The router keeps working afterwards
        let response = router.dispatch(message("login")).await;
        assert_eq!(response.status_code, 200);
    }

    #[test]
    fn test_actions_listing() {
        let router = router();
        assert_eq!(router.actions(), vec!["broken", "explode", "login"]);
        assert!(router.contains("login"));
        assert!(!router.contains("logout"));
    }
}
