use mqtt2db::bridge::Bridge;
use mqtt2db::config::Config;
use mqtt2db::db::{MessageStore, SqliteStore};
use mqtt2db::mqtt_service::BrokerSession;
use mqtt2db::parser::{PayloadParser, SegmentOffset};
use mqtt2db::pipeline::{IngestionPipeline, RetryPolicy};
use mqtt2db::registry::SubscriptionRegistry;
use mqtt2db::rest_server::run_rest_server;
use mqtt2db::service_utils::{
    handle_shutdown, init_logging, log_startup, shutdown_requested, start_ingestion,
    start_mqtt_service, start_reconciler,
};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    // Load configuration
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            init_logging("info");
            error!("Error loading configuration: {:?}", e);
            return ExitCode::FAILURE;
        }
    };
    init_logging(&config.log_level);

    let registry = match SubscriptionRegistry::open(&config.registry_db_path, config.db_pool_size) {
        Ok(registry) => Arc::new(registry),
        Err(e) => {
            error!("Failed to open subscription registry: {:?}", e);
            return ExitCode::FAILURE;
        }
    };

    let store: Arc<dyn MessageStore> =
        match SqliteStore::open(&config.store_db_path, config.db_pool_size) {
            Ok(store) => Arc::new(store),
            Err(e) => {
                error!("Failed to open message store: {:?}", e);
                return ExitCode::FAILURE;
            }
        };
    info!("Databases initialized successfully.");

    match registry.list() {
        Ok(topics) => log_startup(&config, &topics),
        Err(e) => error!("Failed to read subscription registry: {:?}", e),
    }

    let (inbound_tx, inbound_rx) = mpsc::channel(config.ingest_queue_capacity);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let session = BrokerSession::new(config.clone(), inbound_tx);
    let parser = PayloadParser::new(Arc::new(SegmentOffset::new(
        config.topic_delimiter,
        config.device_segment_offset,
    )));
    let pipeline = IngestionPipeline::new(
        parser,
        store.clone(),
        registry.clone(),
        session.clone(),
        RetryPolicy {
            attempts: config.store_retry_attempts,
            base_delay: Duration::from_millis(config.store_retry_base_ms),
        },
    );
    let bridge = Arc::new(Bridge::new(
        registry,
        store,
        session.clone(),
        pipeline.clone(),
        config.topic_template.clone(),
        config.query_timeout(),
    ));

    let ingestion_task = start_ingestion(pipeline.clone(), inbound_rx, shutdown_rx.clone());
    let reconciler_task = start_reconciler(pipeline, &session);
    let mqtt_task = start_mqtt_service(session.clone(), shutdown_rx.clone());

    let bind = config.http_bind.clone();
    let rest_shutdown = shutdown_requested(shutdown_rx);
    let rest_api_task = tokio::spawn(async move {
        if let Err(e) = run_rest_server(bridge, &bind, rest_shutdown).await {
            error!("REST API server failed: {:?}", e);
        }
    });

    handle_shutdown(shutdown_tx).await;

    let _ = tokio::join!(mqtt_task, rest_api_task);
    reconciler_task.abort();

    if let Err(e) = ingestion_task.await {
        error!("Ingestion worker ended abnormally: {:?}", e);
    }

    info!("All services shut down successfully.");
    ExitCode::SUCCESS
}
