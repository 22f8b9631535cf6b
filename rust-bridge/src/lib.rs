//! EventHub bridge - request/reply RPC over RabbitMQ.
//!
//! This library provides shared modules for the two EventHub binaries:
//! - `eventhub-gateway`: HTTP edge turning calls into queued requests
//! - `eventhub-service`: consumer running a service's action handlers
//!
//! ## Architecture
//!
//! ```text
//! HTTP → Gateway → RequestBroker → {service}_queue → ServiceConsumer → handler
//!                        ↑                                   │
//!                   Correlator ← gateway_response_queue.{id} ←┘
//! ```
//!
//! Both sides hold one broker connection each, driven by a `Supervisor`
//! that reconnects with capped exponential backoff.

pub mod backoff;
pub mod config;
pub mod error;
pub mod gateway;
pub mod queue;
pub mod service;
pub mod supervisor;
pub mod web;

// Re-export commonly used types
pub use config::Config;
pub use error::{BridgeError, BridgeResult};
pub use gateway::RequestBroker;
pub use queue::{
    AmqpTransport, ErrorBody, Headers, MemoryBroker, QueueMessage, QueueResponse, Service,
    Transport,
};
pub use service::{handler_fn, ActionRouter, Handler, HandlerRequest, Reply, ServiceConsumer};
pub use supervisor::LinkState;
pub use web::AppState;
