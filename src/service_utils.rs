use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::Config;
use crate::models::InboundMessage;
use crate::mqtt_service::BrokerSession;
use crate::pipeline::IngestionPipeline;

/// Initialize tracing with a max level taken from configuration.
pub fn init_logging(level: &str) {
    let lvl = match level.to_lowercase().as_str() {
        "error" => tracing::Level::ERROR,
        "warn" | "warning" => tracing::Level::WARN,
        "debug" => tracing::Level::DEBUG,
        "trace" => tracing::Level::TRACE,
        _ => tracing::Level::INFO,
    };

    let _ = tracing_subscriber::fmt().with_max_level(lvl).try_init();
}

/// Log the effective configuration and the persisted subscription intent.
pub fn log_startup(config: &Config, subscriptions: &[String]) {
    info!("Starting the application...");
    info!("Broker address: {}:{}", config.mqtt_host, config.mqtt_port);
    info!("Registry database: {}", config.registry_db_path);
    info!("Message database: {}", config.store_db_path);

    if subscriptions.is_empty() {
        info!("No subscribed topics");
    } else {
        info!("Subscribed topics:");
        for topic in subscriptions {
            info!("- {}", topic);
        }
    }
}

/// Start the MQTT service
pub fn start_mqtt_service(
    session: Arc<BrokerSession>,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        session.run(shutdown).await;
    })
}

/// Start the ingestion worker draining the inbound queue
pub fn start_ingestion(
    pipeline: Arc<IngestionPipeline>,
    inbound: mpsc::Receiver<InboundMessage>,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(pipeline.run(inbound, shutdown))
}

/// Start re-subscribing registry topics on every connect
pub fn start_reconciler(
    pipeline: Arc<IngestionPipeline>,
    session: &BrokerSession,
) -> JoinHandle<()> {
    tokio::spawn(pipeline.run_reconciler(session.watch_state()))
}

/// Wait for Ctrl-C, then tell every service to stop.
pub async fn handle_shutdown(shutdown: watch::Sender<bool>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to handle termination signal: {:?}", e);
    } else {
        info!("Received Ctrl-C; shutting down...");
    }
    let _ = shutdown.send(true);
}

/// Resolves once shutdown has been requested.
pub async fn shutdown_requested(mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            break;
        }
    }
}
