//! Queue module for RabbitMQ operations.
//!
//! This module provides:
//! - Envelope types shared by the gateway and the services
//! - The `Transport` abstraction over one broker connection
//! - A lapin-backed transport and an in-process broker for tests
//!
//! ## Architecture
//!
//! ```text
//! Gateway → {service}_queue → Service → reply_to queue → Gateway
//! ```

pub mod amqp;
pub mod memory;
pub mod transport;
pub mod types;

pub use amqp::AmqpTransport;
pub use memory::{MemoryBroker, MemoryTransport, QueuedMessage};
pub use transport::{
    Acknowledge, ConnectionEvent, Delivery, DeliveryStream, PublishOutcome, PublishProperties,
    Transport,
};
pub use types::{codes, ErrorBody, Headers, QueueMessage, QueueResponse, Service};
