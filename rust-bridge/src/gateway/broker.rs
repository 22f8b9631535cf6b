//! Gateway-side request broker.
//!
//! `RequestBroker::send` publishes a `QueueMessage` to the target service's
//! request queue and waits for the correlated `QueueResponse` on this
//! instance's response queue. Link failures are absorbed: a send issued while
//! the broker is unreachable waits for the supervisor to reconnect and gives
//! up only when its deadline passes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::correlator::{Correlator, ResponseSession, Resolution};
use crate::backoff::Backoff;
use crate::config::Config;
use crate::error::{BridgeError, BridgeResult};
use crate::queue::{
    AmqpTransport, Headers, PublishOutcome, PublishProperties, QueueMessage, QueueResponse,
    Service, Transport,
};
use crate::supervisor::{LinkState, Supervisor};

/// How often abandoned pending entries are swept.
const REAPER_INTERVAL: Duration = Duration::from_secs(1);

/// Request queue names, one per backend service.
#[derive(Debug, Clone)]
struct Routes {
    queues: Vec<(Service, String)>,
}

impl Routes {
    fn from_config(config: &Config) -> Self {
        Self {
            queues: Service::ALL
                .iter()
                .map(|s| (*s, config.queue_for(*s).to_string()))
                .collect(),
        }
    }

    fn queue_for(&self, service: Service) -> BridgeResult<&str> {
        self.queues
            .iter()
            .find(|(s, _)| *s == service)
            .map(|(_, q)| q.as_str())
            .ok_or_else(|| BridgeError::UnknownService(service.to_string()))
    }
}

struct BrokerInner {
    transport: Arc<dyn Transport>,
    correlator: Arc<Correlator>,
    routes: Routes,
    response_queue: String,
    response_queue_expiry: Option<Duration>,
    consumer_tag: String,
    response_prefetch: u16,
    fail_pending_on_disconnect: bool,
    timeout: Duration,
    backpressure_pause: Duration,
    backoff: Backoff,
    state: Arc<watch::Sender<LinkState>>,
    shutdown: watch::Sender<bool>,
    started: AtomicBool,
    closed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Handle to the gateway's request/reply bridge. Cheap to clone.
#[derive(Clone)]
pub struct RequestBroker {
    inner: Arc<BrokerInner>,
}

impl RequestBroker {
    pub fn new(config: &Config, transport: Arc<dyn Transport>) -> Self {
        let (state, _) = watch::channel(LinkState::Disconnected);
        let (shutdown, _) = watch::channel(false);

        Self {
            inner: Arc::new(BrokerInner {
                transport,
                correlator: Arc::new(Correlator::new()),
                routes: Routes::from_config(config),
                response_queue: config.response_queue_name(),
                response_queue_expiry: config.response_queue_expiry(),
                consumer_tag: format!("gateway-{}", config.instance_id),
                response_prefetch: config.response_prefetch,
                fail_pending_on_disconnect: config.fail_pending_on_disconnect,
                timeout: config.request_timeout(),
                backpressure_pause: config.backpressure_pause(),
                backoff: config.backoff(),
                state: Arc::new(state),
                shutdown,
                started: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Broker talking to RabbitMQ at `config.rabbitmq_url`.
    pub fn amqp(config: &Config) -> Self {
        Self::new(config, Arc::new(AmqpTransport::new(config.rabbitmq_url.clone())))
    }

    /// Spawn the response consumer and the reaper. Idempotent.
    ///
    /// `send` calls this lazily, so explicit use is only needed to connect
    /// eagerly at startup.
    pub fn start(&self) {
        let inner = &self.inner;
        if inner.closed.load(Ordering::SeqCst) || inner.started.swap(true, Ordering::SeqCst) {
            return;
        }

        info!(
            response_queue = %inner.response_queue,
            timeout_ms = inner.timeout.as_millis() as u64,
            "bridge_gateway_starting"
        );

        let session = Arc::new(ResponseSession {
            correlator: Arc::clone(&inner.correlator),
            queue: inner.response_queue.clone(),
            consumer_tag: inner.consumer_tag.clone(),
            prefetch: inner.response_prefetch,
            expires: inner.response_queue_expiry,
            fail_pending_on_disconnect: inner.fail_pending_on_disconnect,
        });
        let supervisor = Supervisor::new(
            Arc::clone(&inner.transport),
            session,
            inner.backoff.clone(),
            Arc::clone(&inner.state),
        );

        let supervisor_task = tokio::spawn(supervisor.run(inner.shutdown.subscribe()));
        let reaper_task = tokio::spawn(reap_expired(
            Arc::clone(&inner.correlator),
            inner.shutdown.subscribe(),
        ));

        let mut tasks = inner.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.push(supervisor_task);
        tasks.push(reaper_task);
    }

    /// Send one request and wait for its response.
    ///
    /// Resolves with whatever the service replied, including 4xx/5xx
    /// responses. Fails with `Timeout` when no response arrives within the
    /// configured timeout measured from the start of the call.
    pub async fn send(
        &self,
        service: &str,
        action: &str,
        payload: Value,
        headers: Option<Headers>,
    ) -> BridgeResult<QueueResponse> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(BridgeError::ShuttingDown);
        }

        let service: Service = service.parse().map_err(BridgeError::UnknownService)?;
        let queue = self.inner.routes.queue_for(service)?.to_string();

        self.start();

        let started = Instant::now();
        let timeout = self.inner.timeout;
        let deadline = started + timeout;

        let request_id = Uuid::new_v4().to_string();
        let message = QueueMessage::new(request_id.clone(), service, action, payload, headers);
        let body = serde_json::to_vec(&message)?;

        // Registered before publishing so a fast reply always finds its entry
        let rx = self
            .inner
            .correlator
            .register(&request_id, deadline, timeout)?;

        let exchange = self.exchange(rx, &queue, &body, &request_id);
        let result = match timeout_at(deadline, exchange).await {
            Ok(result) => result,
            Err(_) => Err(BridgeError::Timeout {
                request_id: request_id.clone(),
                timeout,
            }),
        };

        if result.is_err() {
            self.inner.correlator.remove(&request_id);
        }

        match &result {
            Ok(response) => info!(
                request_id = %request_id,
                service = %service,
                action = %action,
                status_code = response.status_code,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "bridge_request_completed"
            ),
            Err(e) => warn!(
                request_id = %request_id,
                service = %service,
                action = %action,
                error = %e,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "bridge_request_failed"
            ),
        }

        result
    }

    /// Publish, then wait for the resolution. A resolution arriving while the
    /// publish is still pending (shutdown, fast-fail) wins.
    async fn exchange(
        &self,
        mut rx: oneshot::Receiver<Resolution>,
        queue: &str,
        body: &[u8],
        request_id: &str,
    ) -> Resolution {
        tokio::select! {
            resolution = &mut rx => return settle(resolution),
            published = self.publish_when_ready(queue, body, request_id) => published?,
        }
        settle(rx.await)
    }

    /// Publish once the link is up, retrying across reconnects.
    async fn publish_when_ready(
        &self,
        queue: &str,
        body: &[u8],
        request_id: &str,
    ) -> BridgeResult<()> {
        let inner = &self.inner;

        loop {
            self.wait_until_connected().await?;

            let properties = PublishProperties::persistent()
                .with_reply_to(inner.response_queue.clone())
                .with_correlation_id(request_id)
                .with_message_id(request_id);

            let attempt = async {
                inner.transport.declare_queue(queue).await?;
                inner.transport.publish(queue, body, properties).await
            };

            match attempt.await {
                Ok(PublishOutcome::Accepted) => {
                    debug!(request_id = %request_id, queue = %queue, "bridge_request_published");
                    return Ok(());
                }
                Ok(PublishOutcome::Backpressure) => {
                    warn!(
                        request_id = %request_id,
                        queue = %queue,
                        pause_ms = inner.backpressure_pause.as_millis() as u64,
                        "bridge_publish_backpressure"
                    );
                    sleep(inner.backpressure_pause).await;
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        request_id = %request_id,
                        queue = %queue,
                        error = %e,
                        "bridge_publish_failed_retrying"
                    );
                    // The supervisor flips the state once it notices the drop
                    sleep(inner.backpressure_pause).await;
                }
            }
        }
    }

    async fn wait_until_connected(&self) -> BridgeResult<()> {
        let mut state = self.inner.state.subscribe();
        let reached = state
            .wait_for(|s| matches!(s, LinkState::Connected | LinkState::ShuttingDown))
            .await
            .map(|s| *s);

        match reached {
            Ok(LinkState::Connected) => Ok(()),
            _ => Err(BridgeError::ShuttingDown),
        }
    }

    /// Stop reconnecting, reject every pending request with `ShuttingDown`
    /// and close the transport.
    pub async fn close(&self) -> BridgeResult<()> {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        info!(pending = inner.correlator.pending_count(), "bridge_gateway_closing");

        inner.shutdown.send_replace(true);
        inner.state.send_replace(LinkState::ShuttingDown);
        let failed = inner.correlator.fail_all(|| BridgeError::ShuttingDown);

        let tasks: Vec<JoinHandle<()>> = inner
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "bridge_task_join_failed");
            }
        }
        inner.state.send_replace(LinkState::ShuttingDown);

        inner.transport.close().await?;
        info!(failed_pending = failed, "bridge_gateway_closed");
        Ok(())
    }

    pub fn state(&self) -> LinkState {
        *self.inner.state.borrow()
    }

    /// Watch link state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<LinkState> {
        self.inner.state.subscribe()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.correlator.pending_count()
    }

    pub fn response_queue(&self) -> &str {
        &self.inner.response_queue
    }

    pub fn request_timeout(&self) -> Duration {
        self.inner.timeout
    }
}

fn settle(received: Result<Resolution, oneshot::error::RecvError>) -> Resolution {
    received.unwrap_or(Err(BridgeError::ShuttingDown))
}

/// Sweep entries whose callers stopped waiting.
async fn reap_expired(correlator: Arc<Correlator>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = interval(REAPER_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let expired = correlator.expire(Instant::now());
                if expired > 0 {
                    warn!(expired = expired, "bridge_pending_expired");
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::queue::MemoryBroker;

    fn config() -> Config {
        Config {
            instance_id: "test0001".to_string(),
            request_timeout_ms: 2_000,
            ..Config::default()
        }
    }

    #[test]
    fn test_routes_cover_every_service() {
        let routes = Routes::from_config(&config());
        for service in Service::ALL {
            assert_eq!(routes.queue_for(service).unwrap(), format!("{service}_queue"));
        }
    }

    #[tokio::test]
    async fn test_unknown_service_rejected_without_connecting() {
        let memory = MemoryBroker::new();
        let broker = RequestBroker::new(&config(), Arc::new(memory.transport()));

        let err = broker
            .send("billing", "charge", json!({}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::UnknownService(ref s) if s == "billing"));
        assert_eq!(memory.connect_attempts(), 0);
        assert_eq!(broker.state(), LinkState::Disconnected);
    }

    #[tokio::test]
    async fn test_send_publishes_with_reply_properties() {
        let memory = MemoryBroker::new();
        let broker = RequestBroker::new(&config(), Arc::new(memory.transport()));
        assert_eq!(broker.response_queue(), "gateway_response_queue.test0001");

        let call = tokio::spawn({
            let broker = broker.clone();
            async move { broker.send("auth", "login", json!({"email": "a@b.com"}), None).await }
        });

        let published = loop {
            if let Some(message) = memory.pop_message("auth_queue") {
                break message;
            }
            tokio::task::yield_now().await;
        };

        let request: QueueMessage = serde_json::from_slice(&published.data).unwrap();
        assert_eq!(request.action, "login");
        assert_eq!(request.service, Service::Auth);
        assert_eq!(
            published.properties.correlation_id.as_deref(),
            Some(request.request_id.as_str())
        );
        assert_eq!(
            published.properties.reply_to.as_deref(),
            Some("gateway_response_queue.test0001")
        );
        assert!(published.properties.persistent);
        assert_eq!(broker.pending_count(), 1);

        let reply = QueueResponse::ok(request.request_id.clone(), json!({"id": "u1"}));
        let reply = serde_json::to_vec(&reply).unwrap();
        memory.inject(
            "gateway_response_queue.test0001",
            reply,
            PublishProperties::persistent().with_correlation_id(request.request_id),
        );

        let response = call.await.unwrap().unwrap();
        assert_eq!(response.status_code, 200);
        assert_eq!(broker.pending_count(), 0);

        broker.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_response_queue_expires_only_per_instance() {
        for (per_instance, queue, expected) in [
            (true, "gateway_response_queue.test0001", Some(Duration::from_secs(300))),
            (false, "gateway_response_queue", None),
        ] {
            let memory = MemoryBroker::new();
            let config = Config {
                response_queue_per_instance: per_instance,
                ..config()
            };
            let broker = RequestBroker::new(&config, Arc::new(memory.transport()));
            broker.start();

            let mut state = broker.subscribe_state();
            state
                .wait_for(|s| *s == LinkState::Connected)
                .await
                .unwrap();

            assert!(memory.has_queue(queue));
            assert_eq!(memory.queue_expiry(queue), expected);

            broker.close().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_send_after_close_is_rejected() {
        let memory = MemoryBroker::new();
        let broker = RequestBroker::new(&config(), Arc::new(memory.transport()));
        broker.start();
        broker.close().await.unwrap();

        assert_eq!(broker.state(), LinkState::ShuttingDown);
        let err = broker.send("auth", "login", json!({}), None).await.unwrap_err();
        assert!(matches!(err, BridgeError::ShuttingDown));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaper_sweeps_abandoned_requests() {
        let memory = MemoryBroker::new();
        let broker = RequestBroker::new(&config(), Arc::new(memory.transport()));

        // Caller gives up long before the deadline
        let abandoned = tokio::spawn({
            let broker = broker.clone();
            async move { broker.send("event", "list", json!({}), None).await }
        });
        while memory.queue_depth("event_queue") == 0 {
            tokio::task::yield_now().await;
        }
        abandoned.abort();
        let _ = abandoned.await;

        // Aborting drops the future before its own cleanup ran
        assert_eq!(broker.pending_count(), 1);
        sleep(Duration::from_secs(3)).await;
        assert_eq!(broker.pending_count(), 0);

        broker.close().await.unwrap();
    }
}
