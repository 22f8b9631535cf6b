//! Service-side request consumer.
//!
//! Consumes one service's request queue with prefetch 1, dispatches each
//! message to the `ActionRouter`, publishes the response to the message's
//! reply-to queue and only then acknowledges. Every delivery is acknowledged
//! exactly once; nothing is requeued by the consumer itself.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{error, info, warn};

use super::router::ActionRouter;
use crate::backoff::Backoff;
use crate::config::Config;
use crate::error::BridgeResult;
use crate::queue::{
    AmqpTransport, Delivery, DeliveryStream, PublishOutcome, PublishProperties, QueueMessage,
    QueueResponse, Service, Transport,
};
use crate::supervisor::{LinkState, Session, Supervisor};

/// Requests are handled strictly one at a time.
const REQUEST_PREFETCH: u16 = 1;

struct RequestSession {
    service: Service,
    queue: String,
    consumer_tag: String,
    router: ActionRouter,
    backpressure_pause: Duration,
}

impl RequestSession {
    async fn handle(&self, transport: &dyn Transport, delivery: Delivery) {
        let message: QueueMessage = match serde_json::from_slice(&delivery.data) {
            Ok(message) => message,
            Err(e) => {
                error!(
                    queue = %self.queue,
                    error = %e,
                    body_preview = %delivery.body_preview(),
                    "bridge_request_parse_failed"
                );
                if let (Some(reply_to), Some(correlation_id)) =
                    (delivery.reply_to.as_deref(), delivery.correlation_id.as_deref())
                {
                    let response = QueueResponse::malformed(correlation_id, e.to_string());
                    self.reply(transport, reply_to, correlation_id, &response).await;
                }
                self.ack(transport, &delivery).await;
                return;
            }
        };

        if message.service != self.service {
            warn!(
                request_id = %message.request_id,
                expected = %self.service,
                received = %message.service,
                "bridge_request_service_mismatch"
            );
        }

        info!(
            request_id = %message.request_id,
            action = %message.action,
            redelivered = delivery.redelivered,
            "bridge_request_received"
        );

        let request_id = message.request_id.clone();
        let response = self.router.dispatch(message).await;

        match delivery.reply_to.as_deref() {
            Some(reply_to) => {
                let correlation_id = delivery.correlation_id.as_deref().unwrap_or(&request_id);
                self.reply(transport, reply_to, correlation_id, &response).await;
            }
            None => {
                warn!(
                    request_id = %request_id,
                    status_code = response.status_code,
                    "bridge_reply_to_missing"
                );
            }
        }

        self.ack(transport, &delivery).await;
    }

    /// Best-effort publish of a response. Failures are logged, never raised.
    async fn reply(
        &self,
        transport: &dyn Transport,
        reply_to: &str,
        correlation_id: &str,
        response: &QueueResponse,
    ) {
        let body = match serde_json::to_vec(response) {
            Ok(body) => body,
            Err(e) => {
                error!(request_id = %response.request_id, error = %e, "bridge_response_encode_failed");
                return;
            }
        };

        let properties = PublishProperties::persistent().with_correlation_id(correlation_id);

        match transport.publish(reply_to, &body, properties).await {
            Ok(PublishOutcome::Accepted) => {
                info!(
                    request_id = %response.request_id,
                    reply_to = %reply_to,
                    status_code = response.status_code,
                    "bridge_response_published"
                );
            }
            Ok(PublishOutcome::Backpressure) => {
                warn!(
                    request_id = %response.request_id,
                    pause_ms = self.backpressure_pause.as_millis() as u64,
                    "bridge_publish_backpressure"
                );
                sleep(self.backpressure_pause).await;
            }
            Err(e) => {
                error!(
                    request_id = %response.request_id,
                    reply_to = %reply_to,
                    error = %e,
                    "bridge_response_publish_failed"
                );
            }
        }
    }

    async fn ack(&self, transport: &dyn Transport, delivery: &Delivery) {
        if let Err(e) = transport.ack(delivery).await {
            error!(delivery_tag = delivery.delivery_tag, error = %e, "rabbitmq_ack_failed");
        }
    }
}

#[async_trait]
impl Session for RequestSession {
    fn name(&self) -> &str {
        self.service.as_str()
    }

    async fn establish(&self, transport: &dyn Transport) -> BridgeResult<DeliveryStream> {
        transport.declare_queue(&self.queue).await?;
        let stream = transport
            .consume(&self.queue, &self.consumer_tag, REQUEST_PREFETCH)
            .await?;
        info!(queue = %self.queue, service = %self.service, "rabbitmq_consumer_started");
        Ok(stream)
    }

    async fn on_delivery(&self, transport: &dyn Transport, delivery: Delivery) {
        self.handle(transport, delivery).await;
    }
}

/// Runs one service's request queue against an `ActionRouter`.
pub struct ServiceConsumer {
    transport: Arc<dyn Transport>,
    session: Arc<RequestSession>,
    backoff: Backoff,
    state: Arc<watch::Sender<LinkState>>,
}

impl ServiceConsumer {
    pub fn new(
        config: &Config,
        service: Service,
        transport: Arc<dyn Transport>,
        router: ActionRouter,
    ) -> Self {
        let (state, _) = watch::channel(LinkState::Disconnected);

        Self {
            transport,
            session: Arc::new(RequestSession {
                service,
                queue: config.queue_for(service).to_string(),
                consumer_tag: format!("{}-service-{}", service, config.instance_id),
                router,
                backpressure_pause: config.backpressure_pause(),
            }),
            backoff: config.backoff(),
            state: Arc::new(state),
        }
    }

    /// Consumer talking to RabbitMQ at `config.rabbitmq_url`.
    pub fn amqp(config: &Config, service: Service, router: ActionRouter) -> Self {
        let transport = Arc::new(AmqpTransport::new(config.rabbitmq_url.clone()));
        Self::new(config, service, transport, router)
    }

    pub fn queue(&self) -> &str {
        &self.session.queue
    }

    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<LinkState> {
        self.state.subscribe()
    }

    /// Consume until `shutdown` flips to `true`, reconnecting as needed,
    /// then close the transport.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> BridgeResult<()> {
        info!(
            service = %self.session.service,
            queue = %self.session.queue,
            actions = ?self.session.router.actions(),
            "service_consumer_starting"
        );

        let transport = Arc::clone(&self.transport);
        Supervisor::new(
            Arc::clone(&self.transport),
            self.session,
            self.backoff,
            self.state,
        )
        .run(shutdown)
        .await;

        transport.close().await?;
        info!("service_consumer_shutdown_complete");
        Ok(())
    }
}
