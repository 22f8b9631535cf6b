//! Wire envelopes for the request/reply protocol.
//!
//! Both envelopes travel as UTF-8 JSON with camelCase field names. The
//! reply-to address and correlation id are carried as transport properties
//! and never duplicated in the body.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Caller context forwarded with a request (e.g. the authenticated user id).
pub type Headers = HashMap<String, Value>;

/// Error codes used in synthetic responses produced by the bridge itself.
pub mod codes {
    pub const ACTION_NOT_FOUND: &str = "ACTION_NOT_FOUND";
    pub const MALFORMED_REQUEST: &str = "MALFORMED_REQUEST";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
    pub const UPSTREAM_UNAVAILABLE: &str = "UPSTREAM_UNAVAILABLE";
    pub const SERVICE_NOT_FOUND: &str = "SERVICE_NOT_FOUND";
    pub const INVALID_JSON: &str = "INVALID_JSON";
}

// =============================================================================
// Service
// =============================================================================

/// Backend service a request is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Service {
    Auth,
    User,
    Event,
    Admin,
    Upload,
}

impl Service {
    pub const ALL: [Service; 5] = [
        Service::Auth,
        Service::User,
        Service::Event,
        Service::Admin,
        Service::Upload,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Service::Auth => "auth",
            Service::User => "user",
            Service::Event => "event",
            Service::Admin => "admin",
            Service::Upload => "upload",
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Service {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auth" => Ok(Service::Auth),
            "user" | "users" | "profile" => Ok(Service::User),
            "event" | "events" => Ok(Service::Event),
            "admin" => Ok(Service::Admin),
            "upload" | "uploads" | "file" => Ok(Service::Upload),
            other => Err(other.to_string()),
        }
    }
}

// =============================================================================
// Request envelope
// =============================================================================

/// Request envelope published to a service's request queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMessage {
    /// Unique per in-flight request on the issuing gateway
    pub request_id: String,
    /// Business operation to invoke
    pub action: String,
    pub service: Service,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<Headers>,
}

impl QueueMessage {
    pub fn new(
        request_id: impl Into<String>,
        service: Service,
        action: impl Into<String>,
        payload: Value,
        headers: Option<Headers>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            action: action.into(),
            service,
            payload,
            headers,
        }
    }
}

// =============================================================================
// Response envelope
// =============================================================================

/// Structured error carried by a failed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ErrorBody {
    pub fn new(message: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: Some(code.into()),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<Value>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// Reply envelope published to the caller's reply-to queue.
///
/// Exactly one response is produced per `QueueMessage`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueResponse {
    pub request_id: String,
    pub success: bool,
    pub status_code: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl QueueResponse {
    /// Successful response with status 200.
    pub fn ok(request_id: impl Into<String>, data: Value) -> Self {
        Self {
            request_id: request_id.into(),
            success: true,
            status_code: 200,
            data: Some(data),
            error: None,
        }
    }

    /// Failed response with the given status and error.
    pub fn failure(request_id: impl Into<String>, status_code: u16, error: ErrorBody) -> Self {
        Self {
            request_id: request_id.into(),
            success: false,
            status_code,
            data: None,
            error: Some(error),
        }
    }

    /// No handler is registered for `action`.
    pub fn not_found(request_id: impl Into<String>, action: &str) -> Self {
        Self::failure(
            request_id,
            404,
            ErrorBody::new(format!("Unknown action: {action}"), codes::ACTION_NOT_FOUND),
        )
    }

    /// The inbound envelope could not be decoded.
    pub fn malformed(request_id: impl Into<String>, details: impl Into<String>) -> Self {
        Self::failure(
            request_id,
            400,
            ErrorBody::new("Malformed request message", codes::MALFORMED_REQUEST)
                .with_details(Value::String(details.into())),
        )
    }

    /// The handler failed unexpectedly.
    pub fn internal_error(request_id: impl Into<String>, details: impl Into<String>) -> Self {
        Self::failure(
            request_id,
            500,
            ErrorBody::new("Internal server error", codes::INTERNAL_ERROR)
                .with_details(Value::String(details.into())),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_uses_camel_case_fields() {
        let mut headers = Headers::new();
        headers.insert("userId".to_string(), json!("u1"));
        let msg = QueueMessage::new(
            "req-1",
            Service::Auth,
            "login",
            json!({"email": "a@b.com"}),
            Some(headers),
        );

        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["requestId"], "req-1");
        assert_eq!(value["service"], "auth");
        assert_eq!(value["action"], "login");
        assert_eq!(value["headers"]["userId"], "u1");
    }

    #[test]
    fn test_message_minimal_deserialization() {
        let json = r#"{"requestId": "r", "action": "list", "service": "event"}"#;
        let msg: QueueMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.service, Service::Event);
        assert_eq!(msg.payload, Value::Null);
        assert!(msg.headers.is_none());
    }

    #[test]
    fn test_message_rejects_unknown_service() {
        let json = r#"{"requestId": "r", "action": "list", "service": "billing"}"#;
        assert!(serde_json::from_str::<QueueMessage>(json).is_err());
    }

    #[test]
    fn test_response_omits_absent_fields() {
        let resp = QueueResponse::ok("req-1", json!({"id": "u1"}));
        let text = serde_json::to_string(&resp).unwrap();
        assert!(text.contains("\"statusCode\":200"));
        assert!(!text.contains("\"error\""));
    }

    #[test]
    fn test_response_from_service_json() {
        let json = r#"{
            "requestId": "req-9",
            "success": false,
            "statusCode": 409,
            "error": {"message": "Email already registered", "code": "CONFLICT"}
        }"#;
        let resp: QueueResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.status_code, 409);
        assert!(!resp.success);
        assert_eq!(resp.error.unwrap().code.as_deref(), Some("CONFLICT"));
    }

    #[test]
    fn test_synthetic_responses() {
        let nf = QueueResponse::not_found("r1", "doesNotExist");
        assert_eq!(nf.status_code, 404);
        assert!(!nf.success);
        assert_eq!(
            nf.error.as_ref().unwrap().code.as_deref(),
            Some(codes::ACTION_NOT_FOUND)
        );

        let ie = QueueResponse::internal_error("r2", "boom");
        assert_eq!(ie.status_code, 500);
        assert_eq!(ie.error.unwrap().details, Some(json!("boom")));
    }

    #[test]
    fn test_service_from_str() {
        assert_eq!("auth".parse::<Service>(), Ok(Service::Auth));
        assert_eq!("Events".parse::<Service>(), Ok(Service::Event));
        assert_eq!("profile".parse::<Service>(), Ok(Service::User));
        assert!("billing".parse::<Service>().is_err());
        for service in Service::ALL {
            assert_eq!(service.as_str().parse::<Service>(), Ok(service));
        }
    }
}
