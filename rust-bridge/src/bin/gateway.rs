//! EventHub Gateway - HTTP edge for the queue bridge.
//!
//! This binary provides a thin web server that:
//! - Accepts `POST /api/:service/:action` calls
//! - Forwards them to the service's request queue via the `RequestBroker`
//! - Answers with the correlated response, or 503 when the upstream is gone
//!
//! All business logic runs in the services behind the queues.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use tokio::{net::TcpListener, signal};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use eventhub::web::{router, AppState};
use eventhub::{Config, RequestBroker};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    info!("gateway_starting");

    // Load configuration
    let config = Config::from_env();
    info!(
        port = config.port,
        instance_id = %config.instance_id,
        response_queue = %config.response_queue_name(),
        request_timeout_ms = config.request_timeout_ms,
        fail_pending_on_disconnect = config.fail_pending_on_disconnect,
        "config_loaded"
    );

    // Connect eagerly so /health turns green before the first call
    let broker = RequestBroker::amqp(&config);
    broker.start();

    let app = router(AppState::new(broker.clone()));

    // Bind to address
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    info!(address = %addr, "gateway_listening");

    // Run server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    // Reject whatever is still in flight and close the connection
    if let Err(e) = broker.close().await {
        warn!(error = %e, "rabbitmq_close_failed");
    }

    info!("gateway_shutdown_complete");

    Ok(())
}

/// Create a future that completes when a shutdown signal is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "signal_handler_failed");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "signal_handler_failed");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }

    info!("gateway_shutting_down");
}
