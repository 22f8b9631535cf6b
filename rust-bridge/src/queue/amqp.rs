//! RabbitMQ transport using lapin.
//!
//! Holds a single connection and channel, shared by every publisher and
//! consumer in the process. Connection attempts are serialized behind one
//! async mutex so concurrent callers join the attempt in progress.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    acker::Acker,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use super::transport::{
    Acknowledge, ConnectionEvent, Delivery, DeliveryStream, PublishOutcome, PublishProperties,
    Transport,
};
use crate::error::{BridgeError, BridgeResult};

/// AMQP delivery mode for messages that survive a broker restart.
const PERSISTENT: u8 = 2;

/// Queue argument that makes RabbitMQ delete an unused queue.
const X_EXPIRES: &str = "x-expires";

/// RabbitMQ transport with one connection and one channel.
#[derive(Clone)]
pub struct AmqpTransport {
    inner: Arc<AmqpInner>,
}

struct AmqpInner {
    url: String,
    session: Mutex<Option<AmqpSession>>,
    connected: Arc<AtomicBool>,
    events: broadcast::Sender<ConnectionEvent>,
}

struct AmqpSession {
    connection: Connection,
    channel: Channel,
    loss: LossSignal,
}

impl AmqpTransport {
    /// Create a transport for the given RabbitMQ URL. Does not connect.
    pub fn new(url: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            inner: Arc::new(AmqpInner {
                url: url.into(),
                session: Mutex::new(None),
                connected: Arc::new(AtomicBool::new(false)),
                events,
            }),
        }
    }

    /// Current channel, if the link is up.
    async fn channel(&self) -> BridgeResult<Channel> {
        let session = self.inner.session.lock().await;
        match session.as_ref() {
            Some(s) if s.channel.status().connected() => Ok(s.channel.clone()),
            _ => Err(BridgeError::NotConnected),
        }
    }

    async fn declare(&self, name: &str, arguments: FieldTable) -> BridgeResult<()> {
        let channel = self.channel().await?;

        channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                arguments,
            )
            .await?;

        debug!(queue = name, "rabbitmq_queue_declared");
        Ok(())
    }
}

/// Turns lapin's error callback into one `Error` + `Closed` pair per
/// connection. Disarmed signals stay silent.
#[derive(Clone)]
struct LossSignal {
    fired: Arc<AtomicBool>,
    connected: Arc<AtomicBool>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl LossSignal {
    fn new(connected: Arc<AtomicBool>, events: broadcast::Sender<ConnectionEvent>) -> Self {
        Self {
            fired: Arc::new(AtomicBool::new(false)),
            connected,
            events,
        }
    }

    fn fire(&self, error: &str) {
        if self.fired.swap(true, Ordering::SeqCst) {
            return;
        }
        self.connected.store(false, Ordering::SeqCst);
        warn!(error = error, "rabbitmq_connection_lost");
        let _ = self.events.send(ConnectionEvent::Error(error.to_string()));
        let _ = self.events.send(ConnectionEvent::Closed);
    }

    fn disarm(&self) {
        self.fired.store(true, Ordering::SeqCst);
    }
}

/// Declare arguments; `expires` becomes `x-expires` in milliseconds.
fn queue_arguments(expires: Option<Duration>) -> FieldTable {
    let mut arguments = FieldTable::default();
    if let Some(expires) = expires {
        let millis = i64::try_from(expires.as_millis()).unwrap_or(i64::MAX);
        arguments.insert(X_EXPIRES.into(), AMQPValue::LongLongInt(millis));
    }
    arguments
}

#[async_trait]
impl Transport for AmqpTransport {
    async fn connect(&self) -> BridgeResult<()> {
        let mut session = self.inner.session.lock().await;

        if let Some(s) = session.as_ref() {
            if s.channel.status().connected() {
                return Ok(());
            }
        }

        // Drop whatever is left of a dead session before replacing it
        if let Some(stale) = session.take() {
            stale.loss.disarm();
            if let Err(e) = stale.connection.close(200, "Reconnecting").await {
                debug!(error = %e, "rabbitmq_stale_connection_close_error");
            }
        }

        info!(url_length = self.inner.url.len(), "rabbitmq_connecting");

        let connection = Connection::connect(&self.inner.url, ConnectionProperties::default())
            .await
            .map_err(|e| BridgeError::Connect(e.to_string()))?;

        info!("rabbitmq_connected");

        // lapin reports connection loss through this callback; turn it into
        // exactly one Closed event per connection.
        let loss = LossSignal::new(Arc::clone(&self.inner.connected), self.inner.events.clone());
        let hook = loss.clone();
        connection.on_error(move |err| hook.fire(&err.to_string()));

        let channel = match connection.create_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                // The half-open connection never became the session, so its
                // error hook must not report a loss later.
                loss.disarm();
                if let Err(close_err) = connection.close(200, "Channel setup failed").await {
                    debug!(error = %close_err, "rabbitmq_orphan_connection_close_error");
                }
                return Err(e.into());
            }
        };

        info!("rabbitmq_channel_created");

        self.inner.connected.store(true, Ordering::SeqCst);
        *session = Some(AmqpSession {
            connection,
            channel,
            loss,
        });

        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    async fn declare_queue(&self, name: &str) -> BridgeResult<()> {
        self.declare(name, queue_arguments(None)).await
    }

    async fn declare_expiring_queue(&self, name: &str, expires: Duration) -> BridgeResult<()> {
        self.declare(name, queue_arguments(Some(expires))).await
    }

    async fn publish(
        &self,
        queue: &str,
        body: &[u8],
        properties: PublishProperties,
    ) -> BridgeResult<PublishOutcome> {
        let channel = self.channel().await?;

        channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                body,
                basic_properties(properties),
            )
            .await?
            .await?;

        // lapin buffers internally and exposes no saturation signal, so an
        // accepted publish never reports backpressure.
        Ok(PublishOutcome::Accepted)
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> BridgeResult<DeliveryStream> {
        let channel = self.channel().await?;

        channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await?;

        info!(prefetch_count = prefetch, "rabbitmq_qos_set");

        let consumer = channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        info!(queue = queue, consumer_tag = consumer_tag, "rabbitmq_consumer_started");

        let stream = consumer.map(|delivery| delivery.map(into_delivery).map_err(BridgeError::from));
        Ok(stream.boxed())
    }

    fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    async fn close(&self) -> BridgeResult<()> {
        let mut session = self.inner.session.lock().await;
        self.inner.connected.store(false, Ordering::SeqCst);

        if let Some(s) = session.take() {
            s.loss.disarm();
            if let Err(e) = s.channel.close(200, "Normal shutdown").await {
                warn!(error = %e, "rabbitmq_channel_close_error");
            }
            if let Err(e) = s.connection.close(200, "Normal shutdown").await {
                warn!(error = %e, "rabbitmq_connection_close_error");
            }
        }

        info!("rabbitmq_transport_closed");
        Ok(())
    }
}

/// Map bridge publish properties onto AMQP basic properties.
fn basic_properties(properties: PublishProperties) -> BasicProperties {
    let mut props = BasicProperties::default().with_content_type("application/json".into());

    if properties.persistent {
        props = props.with_delivery_mode(PERSISTENT);
    }
    if let Some(id) = properties.correlation_id {
        props = props.with_correlation_id(id.into());
    }
    if let Some(queue) = properties.reply_to {
        props = props.with_reply_to(queue.into());
    }
    if let Some(id) = properties.message_id {
        props = props.with_message_id(id.into());
    }

    props
}

fn into_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let properties = PublishProperties {
        correlation_id: delivery
            .properties
            .correlation_id()
            .as_ref()
            .map(|s| s.to_string()),
        reply_to: delivery
            .properties
            .reply_to()
            .as_ref()
            .map(|s| s.to_string()),
        message_id: delivery
            .properties
            .message_id()
            .as_ref()
            .map(|s| s.to_string()),
        persistent: *delivery.properties.delivery_mode() == Some(PERSISTENT),
    };

    Delivery::new(
        delivery.delivery_tag,
        delivery.data,
        Box::new(AmqpAcker(delivery.acker)),
    )
    .with_properties(properties)
    .redelivered(delivery.redelivered)
}

struct AmqpAcker(Acker);

#[async_trait]
impl Acknowledge for AmqpAcker {
    async fn ack(&self) -> BridgeResult<()> {
        self.0.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> BridgeResult<()> {
        self.0
            .nack(BasicNackOptions {
                requeue,
                ..Default::default()
            })
            .await?;
        Ok(())
    }
}
