use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, info};

use crate::bridge::{Bridge, BridgeStatus, SubscribeOutcome, TopicOutcome};
use crate::error::{BridgeError, BrokerError, StoreError};
use crate::models::{QosLevel, StoredRow};

const MAX_BODY_BYTES: usize = 64 * 1024;
const DEFAULT_HISTORY_LIMIT: usize = 10;
const MAX_HISTORY_LIMIT: usize = 1000;

#[derive(Deserialize)]
struct TopicsRequest {
    topics: Vec<String>,
}

#[derive(Deserialize)]
struct RefreshRequest {
    topics: Vec<String>,
    #[serde(default)]
    qos: QosLevel,
}

#[derive(Deserialize)]
struct PublishRequest {
    topic: String,
    message: String,
    #[serde(default)]
    qos: QosLevel,
}

#[derive(Deserialize)]
struct ItemsRequest {
    items: Vec<String>,
}

#[derive(Deserialize)]
struct LastValueQuery {
    topic: String,
    timeout_ms: Option<u64>,
}

#[derive(Deserialize)]
struct ValuesQuery {
    topic: String,
    limit: Option<usize>,
    timeout_ms: Option<u64>,
}

#[derive(Serialize)]
struct ApiResponse {
    status: String,
    message: String,
}

#[derive(Serialize)]
struct ResultsResponse {
    results: Vec<TopicOutcome>,
}

#[derive(Serialize)]
struct SubscribedTopicsResponse {
    subscribed_topics: Vec<String>,
}

/// Struct for multiple values response
#[derive(Serialize)]
struct LastValuesResponse {
    topic: String,
    values: Vec<StoredRow>,
}

/// Maps bridge failures onto HTTP status codes.
pub struct AppError(BridgeError);

impl From<BridgeError> for AppError {
    fn from(e: BridgeError) -> Self {
        AppError(e)
    }
}

impl AppError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            BridgeError::Broker(BrokerError::NotConnected) => StatusCode::SERVICE_UNAVAILABLE,
            BridgeError::Broker(_) => StatusCode::BAD_GATEWAY,
            BridgeError::Store(StoreError::Timeout(_)) => StatusCode::GATEWAY_TIMEOUT,
            BridgeError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        error!("Request failed with {}: {}", status, self.0);
        (status, Json(json!({ "status": "error", "message": self.0.to_string() }))).into_response()
    }
}

fn query_timeout(bridge: &Bridge, timeout_ms: Option<u64>) -> Duration {
    timeout_ms
        .map(Duration::from_millis)
        .unwrap_or_else(|| bridge.default_query_timeout())
}

fn history_limit(limit: Option<usize>) -> usize {
    limit.unwrap_or(DEFAULT_HISTORY_LIMIT).min(MAX_HISTORY_LIMIT)
}

/// Root handler
async fn root_handler() -> Json<ApiResponse> {
    Json(ApiResponse {
        status: "success".to_string(),
        message: "MQTT-to-DB connector is running.".to_string(),
    })
}

async fn subscribe(
    State(bridge): State<Arc<Bridge>>,
    Json(request): Json<TopicsRequest>,
) -> Result<Json<SubscribeOutcome>, AppError> {
    Ok(Json(bridge.subscribe(&request.topics).await?))
}

async fn unsubscribe(
    State(bridge): State<Arc<Bridge>>,
    Json(request): Json<TopicsRequest>,
) -> Json<ResultsResponse> {
    Json(ResultsResponse {
        results: bridge.unsubscribe(&request.topics).await,
    })
}

async fn subscribe_device_items(
    State(bridge): State<Arc<Bridge>>,
    Path(device): Path<String>,
    Json(request): Json<ItemsRequest>,
) -> Result<Json<SubscribeOutcome>, AppError> {
    Ok(Json(bridge.subscribe_device_items(&device, &request.items).await?))
}

async fn publish(
    State(bridge): State<Arc<Bridge>>,
    Json(request): Json<PublishRequest>,
) -> Result<Json<ApiResponse>, AppError> {
    bridge
        .publish(&request.topic, &request.message, request.qos)
        .await?;
    Ok(Json(ApiResponse {
        status: "success".to_string(),
        message: "Published successfully!".to_string(),
    }))
}

async fn refresh(
    State(bridge): State<Arc<Bridge>>,
    Json(request): Json<RefreshRequest>,
) -> Json<ResultsResponse> {
    Json(ResultsResponse {
        results: bridge.refresh(&request.topics, request.qos).await,
    })
}

async fn subscribed_topics(
    State(bridge): State<Arc<Bridge>>,
) -> Result<Json<SubscribedTopicsResponse>, AppError> {
    Ok(Json(SubscribedTopicsResponse {
        subscribed_topics: bridge.list_subscriptions().await?,
    }))
}

/// Get the last value of a topic
async fn last_value(
    State(bridge): State<Arc<Bridge>>,
    Query(query): Query<LastValueQuery>,
) -> Result<Response, AppError> {
    let timeout = query_timeout(&bridge, query.timeout_ms);
    match bridge.query(&query.topic, timeout).await? {
        Some(row) => Ok(Json(row).into_response()),
        None => Ok((
            StatusCode::NOT_FOUND,
            Json(json!({ "status": "error", "message": format!("no value stored for '{}'", query.topic) })),
        )
            .into_response()),
    }
}

/// Get the last `n` values of a topic
async fn last_values(
    State(bridge): State<Arc<Bridge>>,
    Query(query): Query<ValuesQuery>,
) -> Result<Json<LastValuesResponse>, AppError> {
    let timeout = query_timeout(&bridge, query.timeout_ms);
    let values = bridge
        .history(&query.topic, history_limit(query.limit), timeout)
        .await?;
    Ok(Json(LastValuesResponse {
        topic: query.topic,
        values,
    }))
}

async fn status(State(bridge): State<Arc<Bridge>>) -> Result<Json<BridgeStatus>, AppError> {
    Ok(Json(bridge.status().await?))
}

pub fn router(bridge: Arc<Bridge>) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/subscribe", post(subscribe))
        .route("/unsubscribe", post(unsubscribe))
        .route("/devices/{device}/items", post(subscribe_device_items))
        .route("/publish", post(publish))
        .route("/refresh", post(refresh))
        .route("/subscribed_topics", get(subscribed_topics))
        .route("/topics/last", get(last_value))
        .route("/topics/values", get(last_values))
        .route("/status", get(status))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(CorsLayer::permissive())
        .with_state(bridge)
}

/// Serves the HTTP adapter until `shutdown` resolves.
pub async fn run_rest_server(
    bridge: Arc<Bridge>,
    bind: &str,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!("REST API listening on {}", listener.local_addr()?);

    axum::serve(listener, router(bridge))
        .with_graceful_shutdown(shutdown)
        .await
}
