//! Pending-request table and response-queue consumer.
//!
//! Every `send()` registers a `PendingRequest` before publishing; the
//! correlator resolves it when a response with the same `requestId` arrives
//! on this gateway's response queue.
//!
//! - `register(id, deadline)` hands back a oneshot receiver
//! - `resolve(response)` delivers to the waiter, or drops an unknown id
//! - `expire(now)` rejects entries whose deadline passed (abandoned callers)
//! - `fail_all(..)` rejects everything (shutdown, fast-fail on disconnect)

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::{BridgeError, BridgeResult};
use crate::queue::{Delivery, DeliveryStream, QueueResponse, Transport};
use crate::supervisor::Session;

pub type Resolution = BridgeResult<QueueResponse>;

/// Correlator entry for one in-flight request.
#[derive(Debug)]
pub struct PendingRequest {
    resolve: oneshot::Sender<Resolution>,
    deadline: Instant,
    timeout: Duration,
}

/// Process-wide table of in-flight requests.
#[derive(Debug, Default)]
pub struct Correlator {
    pending: Mutex<HashMap<String, PendingRequest>>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<String, PendingRequest>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a request. Must happen before the request is published.
    pub fn register(
        &self,
        request_id: &str,
        deadline: Instant,
        timeout: Duration,
    ) -> BridgeResult<oneshot::Receiver<Resolution>> {
        let mut pending = self.pending();
        if pending.contains_key(request_id) {
            return Err(BridgeError::DuplicateRequest(request_id.to_string()));
        }

        let (tx, rx) = oneshot::channel();
        pending.insert(
            request_id.to_string(),
            PendingRequest {
                resolve: tx,
                deadline,
                timeout,
            },
        );
        Ok(rx)
    }

    /// Deliver a response to its waiter.
    ///
    /// Returns `false` when no entry exists (duplicate, timed out, or issued
    /// by another gateway instance); the response is dropped.
    pub fn resolve(&self, response: QueueResponse) -> bool {
        let entry = self.pending().remove(&response.request_id);

        match entry {
            Some(entry) => {
                let request_id = response.request_id.clone();
                if entry.resolve.send(Ok(response)).is_err() {
                    debug!(request_id = %request_id, "bridge_response_waiter_gone");
                }
                true
            }
            None => false,
        }
    }

    /// Remove an entry without resolving it.
    pub fn remove(&self, request_id: &str) -> bool {
        self.pending().remove(request_id).is_some()
    }

    /// Reject every entry whose deadline is at or before `now`.
    pub fn expire(&self, now: Instant) -> usize {
        let expired: Vec<(String, PendingRequest)> = {
            let mut pending = self.pending();
            let ids: Vec<String> = pending
                .iter()
                .filter(|(_, entry)| entry.deadline <= now)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id).map(|entry| (id, entry)))
                .collect()
        };

        let count = expired.len();
        for (request_id, entry) in expired {
            let _ = entry.resolve.send(Err(BridgeError::Timeout {
                request_id,
                timeout: entry.timeout,
            }));
        }
        count
    }

    /// Reject every pending entry with the error built by `reason`.
    pub fn fail_all(&self, reason: impl Fn() -> BridgeError) -> usize {
        let drained: Vec<PendingRequest> = self.pending().drain().map(|(_, entry)| entry).collect();

        let count = drained.len();
        for entry in drained {
            let _ = entry.resolve.send(Err(reason()));
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.pending().len()
    }

    /// Handle one delivery from the response queue.
    ///
    /// Well-formed responses are acknowledged whether or not a waiter exists,
    /// so an orphaned response can never loop. Unparseable bodies are
    /// rejected without requeue.
    pub async fn handle_delivery(&self, transport: &dyn Transport, delivery: Delivery) {
        let mut response: QueueResponse = match serde_json::from_slice(&delivery.data) {
            Ok(response) => response,
            Err(e) => {
                error!(
                    error = %e,
                    correlation_id = ?delivery.correlation_id,
                    body_preview = %delivery.body_preview(),
                    "bridge_response_parse_failed"
                );
                if let Err(nack_err) = transport.nack(&delivery, false).await {
                    error!(error = %nack_err, "rabbitmq_nack_failed");
                }
                return;
            }
        };

        if response.request_id.is_empty() {
            if let Some(correlation_id) = delivery.correlation_id.as_deref() {
                response.request_id = correlation_id.to_string();
            }
        } else if let Some(correlation_id) = delivery.correlation_id.as_deref() {
            if correlation_id != response.request_id {
                warn!(
                    request_id = %response.request_id,
                    correlation_id = %correlation_id,
                    "bridge_response_correlation_mismatch"
                );
            }
        }

        let request_id = response.request_id.clone();
        let status_code = response.status_code;

        if self.resolve(response) {
            info!(
                request_id = %request_id,
                status_code = status_code,
                "bridge_response_resolved"
            );
        } else {
            warn!(
                request_id = %request_id,
                status_code = status_code,
                "bridge_response_unmatched_dropped"
            );
        }

        if let Err(e) = transport.ack(&delivery).await {
            error!(delivery_tag = delivery.delivery_tag, error = %e, "rabbitmq_ack_failed");
        }
    }
}

/// Supervised consumer of the gateway's response queue.
pub(crate) struct ResponseSession {
    pub(crate) correlator: Arc<Correlator>,
    pub(crate) queue: String,
    pub(crate) consumer_tag: String,
    pub(crate) prefetch: u16,
    /// Set for per-instance queues, which must not outlive the gateway
    pub(crate) expires: Option<Duration>,
    pub(crate) fail_pending_on_disconnect: bool,
}

#[async_trait]
impl Session for ResponseSession {
    fn name(&self) -> &str {
        "gateway"
    }

    async fn establish(&self, transport: &dyn Transport) -> BridgeResult<DeliveryStream> {
        match self.expires {
            Some(expires) => transport.declare_expiring_queue(&self.queue, expires).await?,
            None => transport.declare_queue(&self.queue).await?,
        }
        let stream = transport
            .consume(&self.queue, &self.consumer_tag, self.prefetch)
            .await?;
        info!(queue = %self.queue, "bridge_response_consumer_started");
        Ok(stream)
    }

    async fn on_delivery(&self, transport: &dyn Transport, delivery: Delivery) {
        self.correlator.handle_delivery(transport, delivery).await;
    }

    async fn on_disconnect(&self) {
        if self.fail_pending_on_disconnect {
            let failed = self.correlator.fail_all(|| BridgeError::ConnectionLost);
            warn!(failed = failed, "bridge_pending_failed_on_disconnect");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::queue::{MemoryBroker, PublishProperties};

    const TIMEOUT: Duration = Duration::from_secs(30);

    fn deadline() -> Instant {
        Instant::now() + TIMEOUT
    }

    #[tokio::test]
    async fn test_resolve_reaches_only_matching_waiter() {
        let correlator = Correlator::new();
        let rx_a = correlator.register("a", deadline(), TIMEOUT).unwrap();
        let mut rx_b = correlator.register("b", deadline(), TIMEOUT).unwrap();

        assert!(correlator.resolve(QueueResponse::ok("a", json!({"id": "u1"}))));

        let resolved = rx_a.await.unwrap().unwrap();
        assert_eq!(resolved.data, Some(json!({"id": "u1"})));
        assert!(rx_b.try_recv().is_err());
        assert_eq!(correlator.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_second_response_is_dropped() {
        let correlator = Correlator::new();
        let rx = correlator.register("a", deadline(), TIMEOUT).unwrap();

        assert!(correlator.resolve(QueueResponse::ok("a", json!(1))));
        assert!(!correlator.resolve(QueueResponse::ok("a", json!(2))));

        assert_eq!(rx.await.unwrap().unwrap().data, Some(json!(1)));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let correlator = Correlator::new();
        let _rx = correlator.register("a", Instant::now(), TIMEOUT).unwrap();
        assert!(matches!(
            correlator.register("a", Instant::now(), TIMEOUT),
            Err(BridgeError::DuplicateRequest(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_rejects_only_overdue_entries() {
        let correlator = Correlator::new();
        let now = Instant::now();
        let rx_old = correlator
            .register("old", now + Duration::from_secs(1), TIMEOUT)
            .unwrap();
        let _rx_new = correlator
            .register("new", now + Duration::from_secs(60), TIMEOUT)
            .unwrap();

        assert_eq!(correlator.expire(now), 0);
        assert_eq!(correlator.expire(now + Duration::from_secs(1)), 1);

        let err = rx_old.await.unwrap().unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(correlator.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_fail_all_drains_table() {
        let correlator = Correlator::new();
        let rx = correlator.register("a", deadline(), TIMEOUT).unwrap();
        let _rx2 = correlator.register("b", deadline(), TIMEOUT).unwrap();

        assert_eq!(correlator.fail_all(|| BridgeError::ShuttingDown), 2);
        assert!(matches!(rx.await.unwrap(), Err(BridgeError::ShuttingDown)));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_handle_delivery_acks_unmatched_and_rejects_garbage() {
        use futures::StreamExt;

        let broker = MemoryBroker::new();
        let transport = broker.transport();
        transport.connect().await.unwrap();
        transport.declare_queue("responses").await.unwrap();

        let correlator = Correlator::new();
        let rx = correlator.register("known", deadline(), TIMEOUT).unwrap();

        let stray = serde_json::to_vec(&QueueResponse::ok("stranger", json!(null))).unwrap();
        let known = serde_json::to_vec(&QueueResponse::ok("known", json!("hi"))).unwrap();
        let props = PublishProperties::persistent();
        transport.publish("responses", b"not json", props.clone()).await.unwrap();
        transport.publish("responses", &stray, props.clone()).await.unwrap();
        transport.publish("responses", &known, props).await.unwrap();

        let mut stream = transport.consume("responses", "test", 0).await.unwrap();
        for _ in 0..3 {
            let delivery = stream.next().await.unwrap().unwrap();
            correlator.handle_delivery(&transport, delivery).await;
        }

        assert_eq!(rx.await.unwrap().unwrap().data, Some(json!("hi")));
        assert_eq!(broker.queue_depth("responses"), 0);
        assert_eq!(broker.unacked_count(), 0);
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_empty_request_id_falls_back_to_correlation_id() {
        use futures::StreamExt;

        let broker = MemoryBroker::new();
        let transport = broker.transport();
        transport.connect().await.unwrap();
        transport.declare_queue("responses").await.unwrap();

        let correlator = Correlator::new();
        let rx = correlator.register("req-7", deadline(), TIMEOUT).unwrap();

        let body = br#"{"requestId": "", "success": true, "statusCode": 204}"#;
        transport
            .publish(
                "responses",
                body,
                PublishProperties::persistent().with_correlation_id("req-7"),
            )
            .await
            .unwrap();

        let mut stream = transport.consume("responses", "test", 0).await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();
        correlator.handle_delivery(&transport, delivery).await;

        let response = rx.await.unwrap().unwrap();
        assert_eq!(response.status_code, 204);
        assert_eq!(response.request_id, "req-7");
    }
}
