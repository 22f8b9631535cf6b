//! EventHub Service - queue consumer for one backend service.
//!
//! Runs a `ServiceConsumer` on `SERVICE_NAME`'s request queue with two
//! built-in actions for smoke-testing a deployment:
//! - `ping` replies `{"pong": true, "requestId": ...}`
//! - `echo` replies with the payload and caller headers it received
//!
//! Real services embed the library and register their own handlers.

use anyhow::{anyhow, Context, Result};
use serde_json::json;
use tokio::{signal, sync::watch};
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use eventhub::{handler_fn, ActionRouter, Config, HandlerRequest, Reply, Service, ServiceConsumer};

async fn ping(request: HandlerRequest) -> Result<Reply> {
    Ok(Reply::ok(json!({ "pong": true, "requestId": request.request_id })))
}

async fn echo(request: HandlerRequest) -> Result<Reply> {
    Ok(Reply::ok(json!({
        "payload": request.payload,
        "headers": request.headers,
    })))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    info!("service_starting");

    // Load configuration from environment
    let config = Config::from_env();
    let service: Service = config
        .service_name
        .parse()
        .map_err(|name| anyhow!("unknown SERVICE_NAME `{name}`"))?;

    info!(
        service = %service,
        queue = %config.queue_for(service),
        instance_id = %config.instance_id,
        "config_loaded"
    );

    let router = ActionRouter::new()
        .route("ping", handler_fn(ping))
        .route("echo", handler_fn(echo));

    let consumer = ServiceConsumer::amqp(&config, service, router);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        shutdown_tx.send_replace(true);
    });

    consumer
        .run(shutdown_rx)
        .await
        .context("Service consumer failed")?;

    Ok(())
}

/// Completes when SIGINT or SIGTERM is received.
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

    info!("service_stopping");
}
