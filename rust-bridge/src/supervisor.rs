//! Connection state machine shared by the gateway and service sides.
//!
//! ```text
//! disconnected → connecting → connected → (closed) → disconnected
//!                    ↑                                    │
//!                    └──────────── backoff delay ─────────┘
//! ```
//!
//! `shutting-down` is terminal and only reachable through the shutdown
//! signal. A single supervising task owns the loop, so reconnection never
//! recurses through event callbacks.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::backoff::Backoff;
use crate::error::BridgeResult;
use crate::queue::{ConnectionEvent, Delivery, DeliveryStream, Transport};

/// Link state observed by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    ShuttingDown,
}

impl LinkState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkState::Disconnected => "disconnected",
            LinkState::Connecting => "connecting",
            LinkState::Connected => "connected",
            LinkState::ShuttingDown => "shutting-down",
        }
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a supervised link does once connected.
#[async_trait]
pub trait Session: Send + Sync + 'static {
    /// Name used in log lines.
    fn name(&self) -> &str;

    /// Post-connect handshake: declare queues and register the consumer.
    async fn establish(&self, transport: &dyn Transport) -> BridgeResult<DeliveryStream>;

    /// Handle one delivery. Deliveries are processed one at a time.
    async fn on_delivery(&self, transport: &dyn Transport, delivery: Delivery);

    /// Called each time an established link drops.
    async fn on_disconnect(&self) {}
}

enum Exit {
    Shutdown,
    Disconnected(&'static str),
}

/// Drives one session through connect, consume, and reconnect.
pub struct Supervisor<S: Session> {
    transport: Arc<dyn Transport>,
    session: Arc<S>,
    backoff: Backoff,
    state: Arc<watch::Sender<LinkState>>,
}

impl<S: Session> Supervisor<S> {
    pub fn new(
        transport: Arc<dyn Transport>,
        session: Arc<S>,
        backoff: Backoff,
        state: Arc<watch::Sender<LinkState>>,
    ) -> Self {
        Self {
            transport,
            session,
            backoff,
            state,
        }
    }

    /// Run until `shutdown` flips to `true` (or its sender is dropped).
    ///
    /// Connection failures never end the loop; they only schedule the next
    /// attempt through the backoff policy.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let name = self.session.name().to_string();

        loop {
            if *shutdown.borrow() {
                break;
            }

            // Subscribe before connecting so a drop during the handshake is seen
            let mut events = self.transport.subscribe();

            self.state.send_replace(LinkState::Connecting);
            info!(
                session = %name,
                attempt = self.backoff.attempt(),
                "bridge_link_connecting"
            );

            let handshake = async {
                self.transport.connect().await?;
                self.session.establish(self.transport.as_ref()).await
            };

            let established = tokio::select! {
                result = handshake => result,
                _ = shutdown.changed() => break,
            };

            match established {
                Ok(stream) => {
                    self.backoff.reset();
                    self.state.send_replace(LinkState::Connected);
                    info!(session = %name, "bridge_link_connected");

                    match self.pump(stream, &mut events, &mut shutdown).await {
                        Exit::Shutdown => break,
                        Exit::Disconnected(reason) => {
                            self.state.send_replace(LinkState::Disconnected);
                            warn!(session = %name, reason = reason, "bridge_link_lost");
                            self.session.on_disconnect().await;
                        }
                    }
                }
                Err(e) => {
                    self.state.send_replace(LinkState::Disconnected);
                    warn!(session = %name, error = %e, "bridge_link_connect_failed");
                }
            }

            let delay = self.backoff.next_delay();
            info!(
                session = %name,
                delay_ms = delay.as_millis() as u64,
                attempt = self.backoff.attempt(),
                "bridge_link_reconnect_scheduled"
            );

            tokio::select! {
                _ = sleep(delay) => {}
                _ = shutdown.changed() => break,
            }
        }

        self.state.send_replace(LinkState::ShuttingDown);
        info!(session = %name, "bridge_link_stopped");
    }

    async fn pump(
        &self,
        mut stream: DeliveryStream,
        events: &mut broadcast::Receiver<ConnectionEvent>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Exit {
        loop {
            tokio::select! {
                _ = shutdown.changed() => return Exit::Shutdown,
                event = events.recv() => match event {
                    Ok(ConnectionEvent::Closed) => return Exit::Disconnected("connection_closed"),
                    Ok(ConnectionEvent::Error(message)) => {
                        warn!(session = %self.session.name(), error = %message, "bridge_link_error");
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped = skipped, "bridge_link_events_lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Exit::Disconnected("event_channel_closed");
                    }
                },
                delivery = stream.next() => match delivery {
                    Some(Ok(delivery)) => {
                        self.session.on_delivery(self.transport.as_ref(), delivery).await;
                    }
                    Some(Err(e)) => {
                        error!(session = %self.session.name(), error = %e, "rabbitmq_delivery_error");
                    }
                    None => return Exit::Disconnected("consumer_closed"),
                },
            }
        }
    }
}
