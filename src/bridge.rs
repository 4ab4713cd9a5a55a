//! Administrative operations exposed to the HTTP adapter.
//!
//! Subscribe writes intent to the registry before touching the broker, so a
//! failed or deferred broker request is still replayed on the next connect.
//! Each registry write and its broker request run under the registry's intent
//! lock, so concurrent subscribe, unsubscribe and reconcile calls for a topic
//! apply in the order their registry writes happened.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::db::{blocking, MessageStore};
use crate::error::{BridgeError, StoreError};
use crate::models::{Ack, ConnectionState, QosLevel, StoredRow};
use crate::mqtt_service::BrokerSession;
use crate::pipeline::IngestionPipeline;
use crate::registry::SubscriptionRegistry;

/// Result of one topic inside a multi-topic request.
#[derive(Debug, Serialize)]
pub struct TopicOutcome {
    pub topic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ack: Option<Ack>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TopicOutcome {
    fn from_result<T>(topic: &str, result: Result<T, BridgeError>, ack: impl FnOnce(T) -> Option<Ack>) -> Self {
        match result {
            Ok(value) => Self {
                topic: topic.to_string(),
                ack: ack(value),
                error: None,
            },
            Err(e) => Self {
                topic: topic.to_string(),
                ack: None,
                error: Some(e.to_string()),
            },
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Serialize)]
pub struct SubscribeOutcome {
    pub results: Vec<TopicOutcome>,
    pub subscribed_topics: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct BridgeStatus {
    pub connection: ConnectionState,
    pub subscriptions: usize,
    pub ingested: u64,
    pub rejected: u64,
    pub failed: u64,
    pub dropped: u64,
}

pub struct Bridge {
    registry: Arc<SubscriptionRegistry>,
    store: Arc<dyn MessageStore>,
    session: Arc<BrokerSession>,
    pipeline: Arc<IngestionPipeline>,
    topic_template: String,
    query_timeout: Duration,
}

impl Bridge {
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        store: Arc<dyn MessageStore>,
        session: Arc<BrokerSession>,
        pipeline: Arc<IngestionPipeline>,
        topic_template: impl Into<String>,
        query_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            store,
            session,
            pipeline,
            topic_template: topic_template.into(),
            query_timeout,
        }
    }

    pub fn default_query_timeout(&self) -> Duration {
        self.query_timeout
    }

    async fn subscribe_one(&self, topic: &str) -> Result<Ack, BridgeError> {
        let _intent = self.registry.lock_intent().await;
        let registry = self.registry.clone();
        let owned = topic.to_string();
        blocking(move || registry.add(&owned)).await?;
        Ok(self.session.subscribe(topic).await?)
    }

    async fn unsubscribe_one(&self, topic: &str) -> Result<Ack, BridgeError> {
        let _intent = self.registry.lock_intent().await;
        let registry = self.registry.clone();
        let owned = topic.to_string();
        blocking(move || registry.remove(&owned)).await?;
        Ok(self.session.unsubscribe(topic).await?)
    }

    /// Records intent and subscribes each topic; returns per-topic results
    /// and the full subscription list afterwards.
    pub async fn subscribe(&self, topics: &[String]) -> Result<SubscribeOutcome, BridgeError> {
        let mut results = Vec::with_capacity(topics.len());
        for topic in topics {
            let result = self.subscribe_one(topic).await;
            if let Err(e) = &result {
                warn!("Failed to subscribe to topic '{}': {}", topic, e);
            }
            results.push(TopicOutcome::from_result(topic, result, Some));
        }

        Ok(SubscribeOutcome {
            results,
            subscribed_topics: self.list_subscriptions().await?,
        })
    }

    /// Drops intent and unsubscribes each topic. Stored history is kept.
    pub async fn unsubscribe(&self, topics: &[String]) -> Vec<TopicOutcome> {
        let mut results = Vec::with_capacity(topics.len());
        for topic in topics {
            let result = self.unsubscribe_one(topic).await;
            if let Err(e) = &result {
                warn!("Failed to unsubscribe from topic '{}': {}", topic, e);
            }
            results.push(TopicOutcome::from_result(topic, result, Some));
        }
        results
    }

    /// Expands the topic template for each item of a device and subscribes.
    pub async fn subscribe_device_items(
        &self,
        device_id: &str,
        items: &[String],
    ) -> Result<SubscribeOutcome, BridgeError> {
        let topics: Vec<String> = items
            .iter()
            .map(|item| self.device_topic(device_id, item))
            .collect();
        self.subscribe(&topics).await
    }

    pub fn device_topic(&self, device_id: &str, item: &str) -> String {
        self.topic_template
            .replace("{device}", device_id)
            .replace("{item}", item)
    }

    pub async fn publish(
        &self,
        topic: &str,
        message: &str,
        qos: QosLevel,
    ) -> Result<(), BridgeError> {
        self.session
            .publish(topic, message.as_bytes().to_vec(), qos, false)
            .await?;
        Ok(())
    }

    /// Publishes an empty payload to each topic so publishers resend their current value.
    pub async fn refresh(&self, topics: &[String], qos: QosLevel) -> Vec<TopicOutcome> {
        let mut results = Vec::with_capacity(topics.len());
        for topic in topics {
            let result = self
                .session
                .publish(topic, Vec::new(), qos, false)
                .await
                .map_err(BridgeError::from);
            if result.is_ok() {
                info!("Sent refresh request for topic '{}'.", topic);
            }
            results.push(TopicOutcome::from_result(topic, result, |_| None));
        }
        results
    }

    /// Latest stored row for `topic`, bounded by `timeout`.
    pub async fn query(
        &self,
        topic: &str,
        timeout: Duration,
    ) -> Result<Option<StoredRow>, BridgeError> {
        let store = self.store.clone();
        let owned = topic.to_string();
        self.with_timeout(timeout, blocking(move || store.latest(&owned)))
            .await
    }

    /// Up to `limit` stored rows for `topic`, newest first.
    pub async fn history(
        &self,
        topic: &str,
        limit: usize,
        timeout: Duration,
    ) -> Result<Vec<StoredRow>, BridgeError> {
        let store = self.store.clone();
        let owned = topic.to_string();
        self.with_timeout(timeout, blocking(move || store.recent(&owned, limit)))
            .await
    }

    async fn with_timeout<T>(
        &self,
        timeout: Duration,
        call: impl std::future::Future<Output = Result<T, StoreError>>,
    ) -> Result<T, BridgeError> {
        match tokio::time::timeout(timeout, call).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(StoreError::Timeout(timeout).into()),
        }
    }

    pub async fn list_subscriptions(&self) -> Result<Vec<String>, BridgeError> {
        let registry = self.registry.clone();
        Ok(blocking(move || registry.list()).await?)
    }

    pub async fn status(&self) -> Result<BridgeStatus, BridgeError> {
        let stats = self.pipeline.stats();
        Ok(BridgeStatus {
            connection: self.session.state(),
            subscriptions: self.list_subscriptions().await?.len(),
            ingested: stats.ingested(),
            rejected: stats.rejected(),
            failed: stats.failed(),
            dropped: self.session.dropped_messages(),
        })
    }
}
