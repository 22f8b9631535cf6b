//! In-process broker with AMQP-like queue semantics.
//!
//! `MemoryBroker` stands in for RabbitMQ when both sides of the bridge run in
//! one process: durable named queues, per-consumer prefetch, ack/nack with
//! requeue, and redelivery of unacknowledged messages when a connection
//! drops. Outages and backpressure can be simulated, which is what the test
//! suite relies on.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{broadcast, mpsc, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::transport::{
    Acknowledge, ConnectionEvent, Delivery, DeliveryStream, PublishOutcome, PublishProperties,
    Transport,
};
use crate::error::{BridgeError, BridgeResult};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// A message waiting in a queue.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub data: Vec<u8>,
    pub properties: PublishProperties,
    pub redelivered: bool,
}

struct MemoryQueue {
    ready: VecDeque<QueuedMessage>,
    notify: Arc<Notify>,
    /// Recorded for inspection only; queues never actually expire here.
    expires: Option<Duration>,
}

impl MemoryQueue {
    fn new(expires: Option<Duration>) -> Self {
        Self {
            ready: VecDeque::new(),
            notify: Arc::new(Notify::new()),
            expires,
        }
    }
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, MemoryQueue>,
    connections: Vec<Weak<ConnectionInner>>,
    unavailable: bool,
    high_water_mark: Option<usize>,
    connect_attempts: u64,
}

#[derive(Default)]
struct BrokerInner {
    state: Mutex<BrokerState>,
    next_tag: AtomicU64,
}

/// Shared in-process broker. Cheap to clone.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new logical connection to this broker.
    pub fn transport(&self) -> MemoryTransport {
        let (events, _) = broadcast::channel(16);
        let conn = Arc::new(ConnectionInner {
            connected: AtomicBool::new(false),
            connect_lock: tokio::sync::Mutex::new(()),
            unacked: Mutex::new(HashMap::new()),
            pumps: Mutex::new(Vec::new()),
            events,
        });

        let mut state = lock(&self.inner.state);
        state.connections.retain(|c| c.strong_count() > 0);
        state.connections.push(Arc::downgrade(&conn));

        MemoryTransport {
            broker: self.clone(),
            conn,
        }
    }

    /// Refuse new connections while `true`. Existing connections stay up.
    pub fn set_unavailable(&self, unavailable: bool) {
        lock(&self.inner.state).unavailable = unavailable;
    }

    /// Report backpressure once a queue holds more than `limit` messages.
    pub fn set_high_water_mark(&self, limit: Option<usize>) {
        lock(&self.inner.state).high_water_mark = limit;
    }

    /// Total connection attempts seen, successful or not.
    pub fn connect_attempts(&self) -> u64 {
        lock(&self.inner.state).connect_attempts
    }

    pub fn has_queue(&self, name: &str) -> bool {
        lock(&self.inner.state).queues.contains_key(name)
    }

    /// Messages ready for delivery (excludes unacknowledged ones).
    pub fn queue_depth(&self, name: &str) -> usize {
        lock(&self.inner.state)
            .queues
            .get(name)
            .map(|q| q.ready.len())
            .unwrap_or(0)
    }

    /// Deliveries handed to consumers and not yet acked or nacked, across
    /// every open connection.
    pub fn unacked_count(&self) -> usize {
        let connections: Vec<Arc<ConnectionInner>> = lock(&self.inner.state)
            .connections
            .iter()
            .filter_map(Weak::upgrade)
            .collect();

        connections.iter().map(|c| lock(&c.unacked).len()).sum()
    }

    /// Expiry the queue was declared with, if any.
    pub fn queue_expiry(&self, name: &str) -> Option<Duration> {
        lock(&self.inner.state)
            .queues
            .get(name)
            .and_then(|q| q.expires)
    }

    /// Remove and return the next ready message, bypassing consumers.
    pub fn pop_message(&self, name: &str) -> Option<QueuedMessage> {
        self.pop(name)
    }

    /// Declare a queue without going through a connection.
    pub fn declare_queue(&self, name: &str) {
        self.declare(name, None);
    }

    /// Place a raw message on a queue, declaring it if needed.
    pub fn inject(&self, queue: &str, data: Vec<u8>, properties: PublishProperties) {
        let mut state = lock(&self.inner.state);
        let q = state
            .queues
            .entry(queue.to_string())
            .or_insert_with(|| MemoryQueue::new(None));
        q.ready.push_back(QueuedMessage {
            data,
            properties,
            redelivered: false,
        });
        q.notify.notify_one();
    }

    /// Drop every open connection as if the broker restarted.
    ///
    /// Each connection emits `ConnectionEvent::Closed` once, its consumer
    /// streams end, and its unacknowledged deliveries return to their queues.
    pub fn disconnect_all(&self) {
        let connections: Vec<Arc<ConnectionInner>> = lock(&self.inner.state)
            .connections
            .iter()
            .filter_map(Weak::upgrade)
            .collect();

        info!(connections = connections.len(), "memory_broker_disconnect_all");

        for conn in connections {
            conn.sever(self, true);
        }
    }

    /// Redeclaring keeps the original arguments.
    fn declare(&self, name: &str, expires: Option<Duration>) {
        lock(&self.inner.state)
            .queues
            .entry(name.to_string())
            .or_insert_with(|| MemoryQueue::new(expires));
    }

    /// Append (or requeue at the front). Returns the new depth, or `None`
    /// when the queue does not exist.
    fn push(&self, name: &str, message: QueuedMessage, front: bool) -> Option<usize> {
        let mut state = lock(&self.inner.state);
        let queue = state.queues.get_mut(name)?;
        if front {
            queue.ready.push_front(message);
        } else {
            queue.ready.push_back(message);
        }
        queue.notify.notify_one();
        Some(queue.ready.len())
    }

    fn pop(&self, name: &str) -> Option<QueuedMessage> {
        lock(&self.inner.state).queues.get_mut(name)?.ready.pop_front()
    }

    fn notifier(&self, name: &str) -> Option<Arc<Notify>> {
        lock(&self.inner.state)
            .queues
            .get(name)
            .map(|q| Arc::clone(&q.notify))
    }

    fn next_tag(&self) -> u64 {
        self.inner.next_tag.fetch_add(1, Ordering::SeqCst) + 1
    }
}

struct ConnectionInner {
    connected: AtomicBool,
    connect_lock: tokio::sync::Mutex<()>,
    unacked: Mutex<HashMap<u64, (String, QueuedMessage)>>,
    pumps: Mutex<Vec<JoinHandle<()>>>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl ConnectionInner {
    /// Tear the connection down. Only the first call per connection does
    /// anything, so `Closed` is emitted at most once per disconnection.
    fn sever(&self, broker: &MemoryBroker, emit_closed: bool) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }

        for pump in lock(&self.pumps).drain(..) {
            pump.abort();
        }

        let mut orphaned: Vec<(u64, (String, QueuedMessage))> =
            lock(&self.unacked).drain().collect();
        orphaned.sort_by_key(|(tag, _)| *tag);

        // Newest first so the oldest ends up at the head of its queue
        for (_, (queue, mut message)) in orphaned.into_iter().rev() {
            message.redelivered = true;
            broker.push(&queue, message, true);
        }

        if emit_closed {
            let _ = self.events.send(ConnectionEvent::Closed);
        }
    }
}

/// One logical connection to a `MemoryBroker`.
#[derive(Clone)]
pub struct MemoryTransport {
    broker: MemoryBroker,
    conn: Arc<ConnectionInner>,
}

impl MemoryTransport {
    pub fn broker(&self) -> &MemoryBroker {
        &self.broker
    }

    /// Drop only this connection, emitting `Closed`.
    pub fn sever(&self) {
        self.conn.sever(&self.broker, true);
    }

    fn ensure_connected(&self) -> BridgeResult<()> {
        if self.conn.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BridgeError::NotConnected)
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self) -> BridgeResult<()> {
        let _attempt = self.conn.connect_lock.lock().await;

        if self.conn.connected.load(Ordering::SeqCst) {
            return Ok(());
        }

        {
            let mut state = lock(&self.broker.inner.state);
            state.connect_attempts += 1;
            if state.unavailable {
                return Err(BridgeError::Connect("memory broker unavailable".to_string()));
            }
        }

        self.conn.connected.store(true, Ordering::SeqCst);
        debug!("memory_transport_connected");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.conn.connected.load(Ordering::SeqCst)
    }

    async fn declare_queue(&self, name: &str) -> BridgeResult<()> {
        self.ensure_connected()?;
        self.broker.declare(name, None);
        Ok(())
    }

    async fn declare_expiring_queue(&self, name: &str, expires: Duration) -> BridgeResult<()> {
        self.ensure_connected()?;
        self.broker.declare(name, Some(expires));
        Ok(())
    }

    async fn publish(
        &self,
        queue: &str,
        body: &[u8],
        properties: PublishProperties,
    ) -> BridgeResult<PublishOutcome> {
        self.ensure_connected()?;

        let message = QueuedMessage {
            data: body.to_vec(),
            properties,
            redelivered: false,
        };

        let Some(depth) = self.broker.push(queue, message, false) else {
            // Default-exchange semantics: unroutable messages vanish
            debug!(queue = queue, "memory_unroutable_message_dropped");
            return Ok(PublishOutcome::Accepted);
        };

        let high_water_mark = lock(&self.broker.inner.state).high_water_mark;
        match high_water_mark {
            Some(limit) if depth > limit => Ok(PublishOutcome::Backpressure),
            _ => Ok(PublishOutcome::Accepted),
        }
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> BridgeResult<DeliveryStream> {
        self.ensure_connected()?;

        let notify = self
            .broker
            .notifier(queue)
            .ok_or_else(|| BridgeError::Channel(format!("no queue '{queue}'")))?;

        let permits = match prefetch {
            0 => Semaphore::MAX_PERMITS,
            n => n as usize,
        };

        let (tx, rx) = mpsc::channel(16);
        let handle = tokio::spawn(pump(
            self.broker.clone(),
            Arc::clone(&self.conn),
            queue.to_string(),
            notify,
            Arc::new(Semaphore::new(permits)),
            tx,
        ));
        lock(&self.conn.pumps).push(handle);

        debug!(queue = queue, consumer_tag = consumer_tag, prefetch_count = prefetch, "memory_consumer_started");

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|delivery| (delivery, rx))
        });
        Ok(stream.boxed())
    }

    fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.conn.events.subscribe()
    }

    async fn close(&self) -> BridgeResult<()> {
        self.conn.sever(&self.broker, false);
        debug!("memory_transport_closed");
        Ok(())
    }
}

/// Move messages from `queue` to one consumer, holding a prefetch permit
/// per unacknowledged delivery.
async fn pump(
    broker: MemoryBroker,
    conn: Arc<ConnectionInner>,
    queue: String,
    notify: Arc<Notify>,
    permits: Arc<Semaphore>,
    tx: mpsc::Sender<BridgeResult<Delivery>>,
) {
    loop {
        let permit = tokio::select! {
            permit = Arc::clone(&permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
            _ = tx.closed() => return,
        };

        let message = loop {
            if let Some(message) = broker.pop(&queue) {
                break message;
            }
            tokio::select! {
                _ = notify.notified() => {}
                _ = tx.closed() => return,
            }
        };

        let tag = broker.next_tag();
        {
            let mut unacked = lock(&conn.unacked);
            if !conn.connected.load(Ordering::SeqCst) {
                drop(unacked);
                broker.push(&queue, message, true);
                return;
            }
            unacked.insert(tag, (queue.clone(), message.clone()));
        }

        let acker = MemoryAcker {
            broker: broker.clone(),
            conn: Arc::clone(&conn),
            tag,
            permit: Mutex::new(Some(permit)),
        };
        let delivery = Delivery::new(tag, message.data, Box::new(acker))
            .with_properties(message.properties)
            .redelivered(message.redelivered);

        if tx.send(Ok(delivery)).await.is_err() {
            let returned = lock(&conn.unacked).remove(&tag);
            if let Some((queue, message)) = returned {
                broker.push(&queue, message, true);
            }
            return;
        }
    }
}

struct MemoryAcker {
    broker: MemoryBroker,
    conn: Arc<ConnectionInner>,
    tag: u64,
    permit: Mutex<Option<OwnedSemaphorePermit>>,
}

impl MemoryAcker {
    fn settle(&self) -> BridgeResult<(String, QueuedMessage)> {
        lock(&self.permit).take();
        lock(&self.conn.unacked)
            .remove(&self.tag)
            .ok_or_else(|| BridgeError::Channel(format!("unknown delivery tag {}", self.tag)))
    }
}

#[async_trait]
impl Acknowledge for MemoryAcker {
    async fn ack(&self) -> BridgeResult<()> {
        self.settle().map(|_| ())
    }

    async fn nack(&self, requeue: bool) -> BridgeResult<()> {
        let (queue, mut message) = self.settle()?;
        if requeue {
            message.redelivered = true;
            self.broker.push(&queue, message, true);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn connected(broker: &MemoryBroker, queue: &str) -> MemoryTransport {
        let transport = broker.transport();
        transport.connect().await.unwrap();
        transport.declare_queue(queue).await.unwrap();
        transport
    }

    #[tokio::test]
    async fn test_publish_then_consume_and_ack() {
        let broker = MemoryBroker::new();
        let transport = connected(&broker, "auth_queue").await;

        let props = PublishProperties::persistent()
            .with_correlation_id("req-1")
            .with_reply_to("responses");
        let outcome = transport
            .publish("auth_queue", b"{\"hello\":1}", props.clone())
            .await
            .unwrap();
        assert_eq!(outcome, PublishOutcome::Accepted);

        let mut stream = transport.consume("auth_queue", "test", 1).await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();
        assert_eq!(delivery.data, b"{\"hello\":1}");
        assert_eq!(delivery.correlation_id.as_deref(), Some("req-1"));
        assert_eq!(delivery.reply_to.as_deref(), Some("responses"));
        assert!(!delivery.redelivered);

        delivery.ack().await.unwrap();
        assert_eq!(broker.queue_depth("auth_queue"), 0);
        assert!(delivery.ack().await.is_err());
    }

    #[tokio::test]
    async fn test_nack_requeue_redelivers() {
        let broker = MemoryBroker::new();
        let transport = connected(&broker, "q").await;
        transport
            .publish("q", b"once", PublishProperties::default())
            .await
            .unwrap();

        let mut stream = transport.consume("q", "test", 1).await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        first.nack(true).await.unwrap();

        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(second.data, b"once");
        assert!(second.redelivered);
        second.nack(false).await.unwrap();
        assert_eq!(broker.queue_depth("q"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_prefetch_limits_in_flight() {
        let broker = MemoryBroker::new();
        let transport = connected(&broker, "q").await;
        for body in [b"a", b"b"] {
            transport
                .publish("q", body, PublishProperties::default())
                .await
                .unwrap();
        }

        let mut stream = transport.consume("q", "test", 1).await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.data, b"a");

        let blocked = tokio::time::timeout(Duration::from_millis(100), stream.next()).await;
        assert!(blocked.is_err(), "second delivery must wait for the ack");

        first.ack().await.unwrap();
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(second.data, b"b");
    }

    #[tokio::test]
    async fn test_disconnect_requeues_unacked_and_emits_closed_once() {
        let broker = MemoryBroker::new();
        let transport = connected(&broker, "q").await;
        let mut events = transport.subscribe();
        transport
            .publish("q", b"work", PublishProperties::default())
            .await
            .unwrap();

        let mut stream = transport.consume("q", "test", 1).await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();

        broker.disconnect_all();
        broker.disconnect_all();

        assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Closed);
        assert!(events.try_recv().is_err());
        assert!(stream.next().await.is_none());
        assert!(!transport.is_connected());
        assert!(delivery.ack().await.is_err());
        assert_eq!(broker.queue_depth("q"), 1);

        transport.connect().await.unwrap();
        let mut stream = transport.consume("q", "test", 1).await.unwrap();
        let again = stream.next().await.unwrap().unwrap();
        assert_eq!(again.data, b"work");
        assert!(again.redelivered);
    }

    #[tokio::test]
    async fn test_unacked_count_tracks_held_deliveries() {
        let broker = MemoryBroker::new();
        let transport = connected(&broker, "q").await;
        transport
            .publish("q", b"work", PublishProperties::default())
            .await
            .unwrap();
        assert_eq!(broker.unacked_count(), 0);

        let mut stream = transport.consume("q", "test", 1).await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();
        assert_eq!(broker.queue_depth("q"), 0);
        assert_eq!(broker.unacked_count(), 1);

        delivery.ack().await.unwrap();
        assert_eq!(broker.unacked_count(), 0);
    }

    #[tokio::test]
    async fn test_expiring_declare_records_expiry() {
        let broker = MemoryBroker::new();
        let transport = broker.transport();
        transport.connect().await.unwrap();

        transport
            .declare_expiring_queue("responses.ab12cd34", Duration::from_secs(300))
            .await
            .unwrap();
        transport.declare_queue("responses.ab12cd34").await.unwrap();
        transport.declare_queue("auth_queue").await.unwrap();

        assert_eq!(
            broker.queue_expiry("responses.ab12cd34"),
            Some(Duration::from_secs(300))
        );
        assert_eq!(broker.queue_expiry("auth_queue"), None);
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let broker = MemoryBroker::new();
        let transport = broker.transport();
        transport.connect().await.unwrap();
        transport.connect().await.unwrap();
        assert_eq!(broker.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn test_unavailable_broker_refuses_connections() {
        let broker = MemoryBroker::new();
        broker.set_unavailable(true);
        let transport = broker.transport();

        assert!(matches!(
            transport.connect().await,
            Err(BridgeError::Connect(_))
        ));
        assert!(!transport.is_connected());

        broker.set_unavailable(false);
        transport.connect().await.unwrap();
        assert_eq!(broker.connect_attempts(), 2);
    }

    #[tokio::test]
    async fn test_operations_require_connection() {
        let broker = MemoryBroker::new();
        let transport = broker.transport();
        assert!(matches!(
            transport.declare_queue("q").await,
            Err(BridgeError::NotConnected)
        ));
        assert!(matches!(
            transport.publish("q", b"x", PublishProperties::default()).await,
            Err(BridgeError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_backpressure_above_high_water_mark() {
        let broker = MemoryBroker::new();
        broker.set_high_water_mark(Some(1));
        let transport = connected(&broker, "q").await;

        let first = transport.publish("q", b"1", PublishProperties::default()).await;
        let second = transport.publish("q", b"2", PublishProperties::default()).await;
        assert_eq!(first.unwrap(), PublishOutcome::Accepted);
        assert_eq!(second.unwrap(), PublishOutcome::Backpressure);
        // The message is still enqueued
        assert_eq!(broker.queue_depth("q"), 2);
    }

    #[tokio::test]
    async fn test_unroutable_publish_is_dropped() {
        let broker = MemoryBroker::new();
        let transport = broker.transport();
        transport.connect().await.unwrap();

        let outcome = transport
            .publish("nowhere", b"x", PublishProperties::default())
            .await
            .unwrap();
        assert_eq!(outcome, PublishOutcome::Accepted);
        assert!(!broker.has_queue("nowhere"));
    }

    #[tokio::test]
    async fn test_consume_unknown_queue_fails() {
        let broker = MemoryBroker::new();
        let transport = broker.transport();
        transport.connect().await.unwrap();
        assert!(matches!(
            transport.consume("missing", "test", 1).await,
            Err(BridgeError::Channel(_))
        ));
    }
}
