//! Ingestion worker and subscription reconciliation.
//!
//! A single worker drains the inbound queue, so messages are parsed and
//! written in arrival order. Store failures never leave this module: transient
//! ones are retried with exponential backoff, then the message is dropped and
//! logged.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::{mpsc, watch};
use tokio::time::Duration;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use tracing::{debug, error, info, warn};

use crate::db::{blocking, MessageStore};
use crate::error::StoreError;
use crate::models::{Ack, ConnectionState, InboundMessage, StoredRow};
use crate::mqtt_service::BrokerSession;
use crate::parser::PayloadParser;
use crate::registry::SubscriptionRegistry;

const MAX_RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the first failed attempt.
    pub attempts: usize,
    pub base_delay: Duration,
}

impl RetryPolicy {
    // Delays grow as base * 2, base * 4, ... with jitter.
    fn strategy(&self) -> impl Iterator<Item = Duration> {
        let base_ms = self.base_delay.as_millis().max(1) as u64;
        ExponentialBackoff::from_millis(2)
            .factor(base_ms)
            .max_delay(MAX_RETRY_DELAY)
            .map(jitter)
            .take(self.attempts)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Default)]
pub struct PipelineStats {
    ingested: AtomicU64,
    rejected: AtomicU64,
    failed: AtomicU64,
}

impl PipelineStats {
    pub fn ingested(&self) -> u64 {
        self.ingested.load(Ordering::Relaxed)
    }

    /// Messages discarded because they could not be parsed.
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Messages discarded because the store kept failing.
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

pub struct IngestionPipeline {
    parser: PayloadParser,
    store: Arc<dyn MessageStore>,
    registry: Arc<SubscriptionRegistry>,
    session: Arc<BrokerSession>,
    retry: RetryPolicy,
    stats: PipelineStats,
}

impl IngestionPipeline {
    pub fn new(
        parser: PayloadParser,
        store: Arc<dyn MessageStore>,
        registry: Arc<SubscriptionRegistry>,
        session: Arc<BrokerSession>,
        retry: RetryPolicy,
    ) -> Arc<Self> {
        Arc::new(Self {
            parser,
            store,
            registry,
            session,
            retry,
            stats: PipelineStats::default(),
        })
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    /// Parses and persists one message. Failures are logged and end here.
    pub async fn on_message(&self, message: InboundMessage) {
        let record = match self.parser.parse(&message.topic, &message.payload) {
            Ok(record) => record,
            Err(e) => {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(topic = %message.topic, "Discarding unparseable message: {}", e);
                return;
            }
        };

        let record = Arc::new(record);
        let outcome = RetryIf::spawn(
            self.retry.strategy(),
            || {
                let store = self.store.clone();
                let record = record.clone();
                blocking(move || store.append(&record))
            },
            |e: &StoreError| {
                let transient = e.is_transient();
                if transient {
                    warn!(topic = %record.topic, "Transient store error, retrying: {}", e);
                }
                transient
            },
        )
        .await;

        match outcome {
            Ok(row) => self.record_stored(&row, message.received_at),
            Err(e) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                error!(topic = %record.topic, "Dropping message after store failure: {}", e);
            }
        }
    }

    fn record_stored(&self, row: &StoredRow, received_at: OffsetDateTime) {
        self.stats.ingested.fetch_add(1, Ordering::Relaxed);
        debug!(
            id = row.id,
            latency = %(OffsetDateTime::now_utc() - received_at),
            device_id = %row.record.device_id,
            short_name = %row.record.short_name,
            data_item_id = %row.record.data_item_id,
            sequence = %row.record.sequence,
            value = %row.record.value,
            "Stored message."
        );
    }

    /// Drains the ingestion queue until every sender is gone or shutdown is
    /// signalled. On shutdown the queue is closed and what is already queued
    /// is still written.
    pub async fn run(
        self: Arc<Self>,
        mut inbound: mpsc::Receiver<InboundMessage>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("Ingestion worker started.");
        loop {
            tokio::select! {
                message = inbound.recv() => match message {
                    Some(message) => self.on_message(message).await,
                    None => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        inbound.close();
                        while let Some(message) = inbound.recv().await {
                            self.on_message(message).await;
                        }
                        break;
                    }
                }
            }
        }
        info!("Ingestion worker stopped.");
    }

    /// Re-subscribes every topic in the registry. Returns how many were applied.
    ///
    /// Each topic is re-checked under the registry's intent lock right before
    /// its subscribe, so a concurrent unsubscribe is never undone.
    pub async fn reconcile(&self) -> usize {
        let registry = self.registry.clone();
        let topics = match blocking(move || registry.list()).await {
            Ok(topics) => topics,
            Err(e) => {
                error!("Reconciliation could not read the subscription registry: {}", e);
                return 0;
            }
        };

        let mut applied = 0;
        for topic in &topics {
            let _intent = self.registry.lock_intent().await;

            let registry = self.registry.clone();
            let owned = topic.clone();
            match blocking(move || registry.contains(&owned)).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(topic = %topic, "Topic unsubscribed during reconciliation, skipping.");
                    continue;
                }
                Err(e) => {
                    error!("Reconciliation could not check '{}': {}", topic, e);
                    continue;
                }
            }

            match self.session.subscribe(topic).await {
                Ok(Ack::Applied) => applied += 1,
                Ok(Ack::Deferred) => debug!(topic = %topic, "Reconciliation deferred, session not connected."),
                Err(e) => error!("Reconciliation failed for '{}': {}", topic, e),
            }
        }
        info!("Reconciled {} of {} subscriptions.", applied, topics.len());
        applied
    }

    /// Reconciles each time the session becomes `Connected`.
    pub async fn run_reconciler(self: Arc<Self>, mut state: watch::Receiver<ConnectionState>) {
        loop {
            let connected = *state.borrow_and_update() == ConnectionState::Connected;
            if connected {
                self.reconcile().await;
            }
            if state.changed().await.is_err() {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteStore;
    use crate::models::ParsedRecord;
    use crate::mqtt_service::tests::{test_config, RecordingTransport};
    use std::sync::Mutex;
    use tempfile::TempDir;

    const TOPIC: &str = "X/Y/Z/Dev1/Controller/Events/Mode";

    /// Fails the first `failures` appends with the given error kind.
    struct FlakyStore {
        inner: SqliteStore,
        failures: Mutex<usize>,
        transient: bool,
        calls: AtomicU64,
    }

    impl MessageStore for FlakyStore {
        fn append(&self, record: &ParsedRecord) -> Result<StoredRow, StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut failures = self.failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                let code = if self.transient {
                    rusqlite::ffi::SQLITE_BUSY
                } else {
                    rusqlite::ffi::SQLITE_CONSTRAINT
                };
                return Err(StoreError::Sqlite(rusqlite::Error::SqliteFailure(
                    rusqlite::ffi::Error::new(code),
                    None,
                )));
            }
            self.inner.append(record)
        }

        fn latest(&self, topic: &str) -> Result<Option<StoredRow>, StoreError> {
            self.inner.latest(topic)
        }

        fn recent(&self, topic: &str, limit: usize) -> Result<Vec<StoredRow>, StoreError> {
            self.inner.recent(topic, limit)
        }
    }

    struct Fixture {
        _dir: TempDir,
        pipeline: Arc<IngestionPipeline>,
        registry: Arc<SubscriptionRegistry>,
        session: Arc<BrokerSession>,
    }

    fn fixture_with_store(build: impl FnOnce(SqliteStore) -> Arc<dyn MessageStore>) -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = SqliteStore::open(dir.path().join("messages.db"), 2).unwrap();
        let registry = Arc::new(SubscriptionRegistry::open(dir.path().join("topics.db"), 2).unwrap());
        let (tx, _rx) = mpsc::channel(16);
        let session = BrokerSession::new(test_config(), tx);
        let pipeline = IngestionPipeline::new(
            PayloadParser::default(),
            build(store),
            registry.clone(),
            session.clone(),
            RetryPolicy {
                attempts: 3,
                base_delay: Duration::from_millis(1),
            },
        );
        Fixture {
            _dir: dir,
            pipeline,
            registry,
            session,
        }
    }

    fn flaky(failures: usize, transient: bool) -> (Arc<FlakyStore>, Fixture) {
        let mut handle = None;
        let fixture = fixture_with_store(|inner| {
            let store = Arc::new(FlakyStore {
                inner,
                failures: Mutex::new(failures),
                transient,
                calls: AtomicU64::new(0),
            });
            handle = Some(store.clone());
            store as Arc<dyn MessageStore>
        });
        (handle.unwrap(), fixture)
    }

    fn payload(sequence: u64, value: &str) -> Vec<u8> {
        format!(r#"{{"sequence":"{}","value":"{}"}}"#, sequence, value).into_bytes()
    }

    #[tokio::test]
    async fn malformed_message_never_reaches_store() {
        let (store, fixture) = flaky(0, true);

        fixture
            .pipeline
            .on_message(InboundMessage::new(TOPIC, b"{not json".to_vec()))
            .await;
        fixture
            .pipeline
            .on_message(InboundMessage::new("too/short", payload(1, "x")))
            .await;

        assert_eq!(store.calls.load(Ordering::SeqCst), 0);
        assert_eq!(fixture.pipeline.stats().rejected(), 2);
        assert_eq!(fixture.pipeline.stats().ingested(), 0);
    }

    #[tokio::test]
    async fn transient_store_errors_are_retried() {
        let (store, fixture) = flaky(2, true);

        fixture
            .pipeline
            .on_message(InboundMessage::new(TOPIC, payload(1, "AUTOMATIC")))
            .await;

        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
        assert_eq!(fixture.pipeline.stats().ingested(), 1);
        assert_eq!(store.latest(TOPIC).unwrap().unwrap().record.value, "AUTOMATIC");
    }

    #[tokio::test]
    async fn exhausted_retries_drop_the_message() {
        let (store, fixture) = flaky(10, true);

        fixture
            .pipeline
            .on_message(InboundMessage::new(TOPIC, payload(1, "lost")))
            .await;

        // First attempt plus three retries.
        assert_eq!(store.calls.load(Ordering::SeqCst), 4);
        assert_eq!(fixture.pipeline.stats().failed(), 1);
        assert!(store.latest(TOPIC).unwrap().is_none());
    }

    #[tokio::test]
    async fn permanent_store_errors_are_not_retried() {
        let (store, fixture) = flaky(1, false);

        fixture
            .pipeline
            .on_message(InboundMessage::new(TOPIC, payload(1, "x")))
            .await;

        assert_eq!(store.calls.load(Ordering::SeqCst), 1);
        assert_eq!(fixture.pipeline.stats().failed(), 1);
    }

    #[tokio::test]
    async fn worker_preserves_arrival_order() {
        let (store, fixture) = flaky(0, true);
        let (tx, rx) = mpsc::channel(8);
        let (_stop_tx, stop_rx) = watch::channel(false);
        let worker = tokio::spawn(fixture.pipeline.clone().run(rx, stop_rx));

        for (seq, value) in [(1, "M1"), (2, "M2"), (3, "M3")] {
            tx.send(InboundMessage::new(TOPIC, payload(seq, value))).await.unwrap();
        }
        drop(tx);
        worker.await.unwrap();

        let rows = store.recent(TOPIC, 10).unwrap();
        let values: Vec<&str> = rows.iter().rev().map(|r| r.record.value.as_str()).collect();
        assert_eq!(values, vec!["M1", "M2", "M3"]);
        assert!(rows[0].id > rows[1].id && rows[1].id > rows[2].id);
        assert_eq!(store.latest(TOPIC).unwrap().unwrap().record.sequence, "3");
    }

    #[tokio::test]
    async fn shutdown_drains_queued_messages() {
        let (store, fixture) = flaky(0, true);
        let (tx, rx) = mpsc::channel(8);
        let (stop_tx, stop_rx) = watch::channel(false);

        for seq in 1..=4 {
            tx.send(InboundMessage::new(TOPIC, payload(seq, "queued"))).await.unwrap();
        }
        stop_tx.send(true).unwrap();
        fixture.pipeline.clone().run(rx, stop_rx).await;

        assert_eq!(store.recent(TOPIC, 10).unwrap().len(), 4);
        assert!(tx.is_closed());
    }

    #[tokio::test]
    async fn reconcile_subscribes_each_registry_topic_once() {
        let (_store, fixture) = flaky(0, true);
        fixture.registry.add("T1").unwrap();
        fixture.registry.add("T2").unwrap();
        fixture.registry.add("T1").unwrap();

        let transport = Arc::new(RecordingTransport::default());
        fixture.session.attach(transport.clone()).await;

        assert_eq!(fixture.pipeline.reconcile().await, 2);
        let mut subscribed = transport.subscribed.lock().unwrap().clone();
        subscribed.sort();
        assert_eq!(subscribed, vec!["T1", "T2"]);
    }

    #[tokio::test]
    async fn reconciler_runs_on_every_connect() {
        let (_store, fixture) = flaky(0, true);
        fixture.registry.add("T1").unwrap();
        fixture.registry.add("T2").unwrap();

        let reconciler = tokio::spawn(
            fixture
                .pipeline
                .clone()
                .run_reconciler(fixture.session.watch_state()),
        );

        let first = Arc::new(RecordingTransport::default());
        fixture.session.attach(first.clone()).await;
        wait_for(|| first.subscribed.lock().unwrap().len() == 2).await;

        fixture.session.detach().await;
        let second = Arc::new(RecordingTransport::default());
        fixture.session.attach(second.clone()).await;
        wait_for(|| second.subscribed.lock().unwrap().len() == 2).await;

        assert_eq!(first.subscribed.lock().unwrap().len(), 2);
        reconciler.abort();
    }

    async fn wait_for(condition: impl Fn() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not met in time");
    }
}
