//! Broker connection abstraction.
//!
//! A `Transport` owns one logical connection and one channel to the message
//! broker. The gateway and the service consumer never reach for a global
//! connection; they are handed an `Arc<dyn Transport>` and drive its
//! lifecycle through the supervisor.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio::sync::broadcast;

use crate::error::BridgeResult;

/// Message metadata carried at the transport-property level.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishProperties {
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub message_id: Option<String>,
    /// Survive a broker restart (AMQP delivery mode 2)
    pub persistent: bool,
}

impl PublishProperties {
    pub fn persistent() -> Self {
        Self {
            persistent: true,
            ..Default::default()
        }
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_reply_to(mut self, queue: impl Into<String>) -> Self {
        self.reply_to = Some(queue.into());
        self
    }

    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }
}

/// Result of handing a message to the transport.
///
/// `Backpressure` is a soft signal: the message was accepted but the
/// transport buffer is saturated and the caller should pause briefly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Accepted,
    Backpressure,
}

/// Asynchronous lifecycle notifications emitted to the owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Error(String),
    /// Emitted once per unexpected disconnection
    Closed,
}

/// Settles a single delivery with the broker.
#[async_trait]
pub trait Acknowledge: Send + Sync {
    async fn ack(&self) -> BridgeResult<()>;
    async fn nack(&self, requeue: bool) -> BridgeResult<()>;
}

/// A message received from a queue, pending acknowledgement.
pub struct Delivery {
    pub delivery_tag: u64,
    pub data: Vec<u8>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub message_id: Option<String>,
    pub redelivered: bool,
    acker: Box<dyn Acknowledge>,
}

impl Delivery {
    pub fn new(delivery_tag: u64, data: Vec<u8>, acker: Box<dyn Acknowledge>) -> Self {
        Self {
            delivery_tag,
            data,
            correlation_id: None,
            reply_to: None,
            message_id: None,
            redelivered: false,
            acker,
        }
    }

    pub fn with_properties(mut self, properties: PublishProperties) -> Self {
        self.correlation_id = properties.correlation_id;
        self.reply_to = properties.reply_to;
        self.message_id = properties.message_id;
        self
    }

    pub fn redelivered(mut self, redelivered: bool) -> Self {
        self.redelivered = redelivered;
        self
    }

    pub async fn ack(&self) -> BridgeResult<()> {
        self.acker.ack().await
    }

    pub async fn nack(&self, requeue: bool) -> BridgeResult<()> {
        self.acker.nack(requeue).await
    }

    /// First bytes of the body, for log lines.
    pub fn body_preview(&self) -> String {
        String::from_utf8_lossy(&self.data[..self.data.len().min(500)]).into_owned()
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("body_length", &self.data.len())
            .field("correlation_id", &self.correlation_id)
            .field("reply_to", &self.reply_to)
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

/// Stream of deliveries for one consumer. Ends when the channel closes.
pub type DeliveryStream = BoxStream<'static, BridgeResult<Delivery>>;

/// One connection + one channel to the broker.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Establish the connection and channel.
    ///
    /// No-op when already connected; concurrent callers wait for the attempt
    /// in progress instead of starting another.
    async fn connect(&self) -> BridgeResult<()>;

    fn is_connected(&self) -> bool;

    /// Declare a durable queue. Declaring an existing queue is a no-op.
    async fn declare_queue(&self, name: &str) -> BridgeResult<()>;

    /// Declare a durable queue the broker deletes once it has gone unused
    /// for `expires`.
    async fn declare_expiring_queue(&self, name: &str, expires: Duration) -> BridgeResult<()>;

    async fn publish(
        &self,
        queue: &str,
        body: &[u8],
        properties: PublishProperties,
    ) -> BridgeResult<PublishOutcome>;

    /// Start consuming `queue` with at most `prefetch` unacknowledged
    /// deliveries (0 = unlimited).
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> BridgeResult<DeliveryStream>;

    /// Lifecycle events for the current and future connections.
    fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent>;

    /// Close the channel and connection. No `Closed` event is emitted.
    async fn close(&self) -> BridgeResult<()>;

    async fn ack(&self, delivery: &Delivery) -> BridgeResult<()> {
        delivery.ack().await
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> BridgeResult<()> {
        delivery.nack(requeue).await
    }
}
