use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{BrokerError, ConnectError, TransportError};
use crate::models::{Ack, ConnectionState, InboundMessage, QosLevel};

const MAX_RETRY_INTERVAL: Duration = Duration::from_secs(60);
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

/// Requests a live broker connection can carry out.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), TransportError>;
    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError>;
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), TransportError>;
    async fn disconnect(&self) -> Result<(), TransportError>;
}

#[async_trait]
impl Transport for AsyncClient {
    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), TransportError> {
        AsyncClient::subscribe(self, topic, qos).await?;
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        AsyncClient::unsubscribe(self, topic).await?;
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), TransportError> {
        AsyncClient::publish(self, topic, qos, retain, payload).await?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        AsyncClient::disconnect(self).await?;
        Ok(())
    }
}

/// One connection to the MQTT broker.
///
/// Inbound PUBLISH packets are forwarded to a bounded queue. When the queue is
/// full the new message is rejected, logged and counted; the event loop never
/// waits on ingestion. Connection state is published on a watch channel so the
/// reconciler can re-subscribe after every (re)connect.
pub struct BrokerSession {
    config: Config,
    state: watch::Sender<ConnectionState>,
    transport: Mutex<Option<Arc<dyn Transport>>>,
    inbound: mpsc::Sender<InboundMessage>,
    dropped: AtomicU64,
}

impl BrokerSession {
    pub fn new(config: Config, inbound: mpsc::Sender<InboundMessage>) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Arc::new(Self {
            config,
            state,
            transport: Mutex::new(None),
            inbound,
            dropped: AtomicU64::new(0),
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Messages rejected because the ingestion queue was full.
    pub fn dropped_messages(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn set_state(&self, next: ConnectionState) {
        self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                debug!("Connection state {} -> {}", current, next);
                *current = next;
                true
            }
        });
    }

    /// Installs a live transport and marks the session connected.
    ///
    /// Watchers of the connection state see the transition and reconcile.
    pub async fn attach(&self, transport: Arc<dyn Transport>) {
        {
            let mut client_lock = self.transport.lock().await;
            *client_lock = Some(transport);
        }
        self.set_state(ConnectionState::Connected);
    }

    /// Drops the live transport and marks the session disconnected.
    pub async fn detach(&self) {
        {
            let mut client_lock = self.transport.lock().await;
            *client_lock = None;
        }
        self.set_state(ConnectionState::Disconnected);
    }

    async fn live_transport(&self) -> Option<Arc<dyn Transport>> {
        if self.state() != ConnectionState::Connected {
            return None;
        }
        self.transport.lock().await.clone()
    }

    fn mqtt_options(&self) -> MqttOptions {
        let mut mqtt_options = MqttOptions::new(
            self.config.mqtt_client_id.clone(),
            self.config.mqtt_host.clone(),
            self.config.mqtt_port,
        );
        mqtt_options.set_keep_alive(Duration::from_secs(self.config.mqtt_keep_alive_secs.max(5)));
        mqtt_options.set_clean_session(true);

        if !self.config.mqtt_username.is_empty() {
            mqtt_options.set_credentials(
                self.config.mqtt_username.clone(),
                self.config.mqtt_password.clone(),
            );
        }
        mqtt_options
    }

    /// Makes one connection attempt bounded by the configured connect timeout.
    ///
    /// On CONNACK the client is attached and the session becomes `Connected`.
    /// The returned event loop must then be driven with [`Self::drive`].
    pub async fn connect(&self) -> Result<EventLoop, ConnectError> {
        let address = format!("{}:{}", self.config.mqtt_host, self.config.mqtt_port);
        debug!("Configuring MQTT broker at {}...", address);

        self.set_state(ConnectionState::Connecting);
        let (client, mut eventloop) = AsyncClient::new(self.mqtt_options(), 10);

        let handshake = async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(connack))) => {
                        return if connack.code == ConnectReturnCode::Success {
                            Ok(())
                        } else {
                            Err(ConnectError::Refused(format!("{:?}", connack.code)))
                        };
                    }
                    Ok(event) => debug!("Event before CONNACK: {:?}", event),
                    Err(e) => return Err(ConnectError::from(e)),
                }
            }
        };

        let connect_timeout = self.config.connect_timeout();
        let outcome = match timeout(connect_timeout, handshake).await {
            Ok(result) => result,
            Err(_) => Err(ConnectError::Timeout {
                address: address.clone(),
                timeout: connect_timeout,
            }),
        };

        match outcome {
            Ok(()) => {
                info!("Connected to MQTT broker at {}.", address);
                self.attach(Arc::new(client)).await;
                Ok(eventloop)
            }
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    /// Polls a connected event loop until the connection drops.
    pub async fn drive(&self, eventloop: &mut EventLoop) {
        loop {
            match eventloop.poll().await {
                Ok(event) => self.handle_event(event),
                Err(e) => {
                    error!("Error in MQTT event loop: {:?}", e);
                    break;
                }
            }
        }
        self.detach().await;
    }

    fn handle_event(&self, event: Event) {
        match event {
            Event::Incoming(Packet::Publish(publish)) => {
                self.deliver(InboundMessage::new(publish.topic, publish.payload.to_vec()));
            }
            Event::Incoming(Packet::ConnAck(_)) => {
                info!("Connected to MQTT broker.");
            }
            Event::Incoming(Packet::Disconnect) => {
                warn!("Broker sent DISCONNECT.");
            }
            Event::Outgoing(_) => {}
            _ => {
                debug!("Unhandled event: {:?}", event);
            }
        }
    }

    /// Hands an inbound message to the ingestion queue without blocking.
    pub fn deliver(&self, message: InboundMessage) {
        match self.inbound.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(message)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    topic = %message.topic,
                    dropped,
                    "Ingestion queue full, dropping message."
                );
            }
            Err(TrySendError::Closed(message)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                error!(topic = %message.topic, "Ingestion queue closed, dropping message.");
            }
        }
    }

    /// Connects and reconnects until `max_retries` consecutive failures or shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("Starting MQTT service...");

        let initial_retry_interval = self.config.retry_interval();
        let max_retries = self.config.mqtt_max_retries;
        let mut retry_interval = initial_retry_interval;
        let mut retries = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }
            if max_retries >= 0 && retries > max_retries {
                error!("Maximum number of retries ({}) reached. Stopping the service.", max_retries);
                break;
            }

            match self.connect().await {
                Ok(mut eventloop) => {
                    retries = 0;
                    retry_interval = initial_retry_interval;
                    let stopping = tokio::select! {
                        _ = self.drive(&mut eventloop) => false,
                        _ = shutdown.changed() => true,
                    };
                    if stopping {
                        self.close(&mut eventloop).await;
                        break;
                    }
                    warn!("Lost connection to MQTT broker. Retrying in {:?}...", retry_interval);
                }
                Err(e) => {
                    error!("Failed to connect to MQTT broker: {}. Retrying in {:?}...", e, retry_interval);
                }
            }

            retries += 1;
            tokio::select! {
                _ = sleep(retry_interval) => {}
                _ = shutdown.changed() => break,
            }
            retry_interval = (retry_interval * 2).min(MAX_RETRY_INTERVAL);
        }

        self.set_state(ConnectionState::Disconnected);
        info!("MQTT service stopped.");
    }

    pub async fn subscribe(&self, topic: &str) -> Result<Ack, BrokerError> {
        let Some(transport) = self.live_transport().await else {
            debug!(topic, "Not connected, subscription deferred until reconnect.");
            return Ok(Ack::Deferred);
        };

        transport
            .subscribe(topic, self.config.mqtt_subscribe_qos.into())
            .await
            .map_err(|source| BrokerError::Subscribe {
                topic: topic.to_string(),
                source,
            })?;
        info!("Subscribed to topic '{}'.", topic);
        Ok(Ack::Applied)
    }

    pub async fn unsubscribe(&self, topic: &str) -> Result<Ack, BrokerError> {
        let Some(transport) = self.live_transport().await else {
            return Ok(Ack::Deferred);
        };

        transport
            .unsubscribe(topic)
            .await
            .map_err(|source| BrokerError::Unsubscribe {
                topic: topic.to_string(),
                source,
            })?;
        info!("Unsubscribed from topic '{}'.", topic);
        Ok(Ack::Applied)
    }

    /// Hands a message to the transport. No delivery confirmation is awaited.
    pub async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QosLevel,
        retain: bool,
    ) -> Result<(), BrokerError> {
        let transport = self.live_transport().await.ok_or(BrokerError::NotConnected)?;

        transport
            .publish(topic, payload, qos.into(), retain)
            .await
            .map_err(|source| BrokerError::Publish {
                topic: topic.to_string(),
                source,
            })?;
        info!("Message published to '{}'.", topic);
        Ok(())
    }

    /// Queues a DISCONNECT on the transport and detaches it.
    pub async fn disconnect(&self) {
        self.request_disconnect().await;
        self.detach().await;
    }

    /// Queues a DISCONNECT and keeps polling `eventloop` until it has been
    /// written, the connection ends, or [`DISCONNECT_GRACE`] passes.
    pub async fn close(&self, eventloop: &mut EventLoop) {
        if self.request_disconnect().await {
            let flushed = timeout(DISCONNECT_GRACE, async {
                loop {
                    match eventloop.poll().await {
                        Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
                        Ok(event) => debug!("Event while disconnecting: {:?}", event),
                        Err(e) => {
                            debug!("Event loop ended while disconnecting: {:?}", e);
                            break;
                        }
                    }
                }
            })
            .await;
            if flushed.is_err() {
                warn!("DISCONNECT not sent within {:?}.", DISCONNECT_GRACE);
            }
        }
        self.detach().await;
    }

    async fn request_disconnect(&self) -> bool {
        let transport = self.transport.lock().await.clone();
        let Some(transport) = transport else {
            return false;
        };
        match transport.disconnect().await {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to disconnect cleanly: {}", e);
                false
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    /// Records every request instead of talking to a broker.
    #[derive(Default)]
    pub(crate) struct RecordingTransport {
        pub subscribed: StdMutex<Vec<String>>,
        pub unsubscribed: StdMutex<Vec<String>>,
        pub published: StdMutex<Vec<(String, Vec<u8>, QoS)>>,
        pub fail_topic: Option<String>,
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn subscribe(&self, topic: &str, _qos: QoS) -> Result<(), TransportError> {
            if self.fail_topic.as_deref() == Some(topic) {
                return Err(TransportError("request channel closed".into()));
            }
            self.subscribed.lock().unwrap().push(topic.to_string());
            Ok(())
        }

        async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
            self.unsubscribed.lock().unwrap().push(topic.to_string());
            Ok(())
        }

        async fn publish(
            &self,
            topic: &str,
            payload: Vec<u8>,
            qos: QoS,
            _retain: bool,
        ) -> Result<(), TransportError> {
            self.published
                .lock()
                .unwrap()
                .push((topic.to_string(), payload, qos));
            Ok(())
        }

        async fn disconnect(&self) -> Result<(), TransportError> {
            Ok(())
        }
    }

    pub(crate) fn test_config() -> Config {
        Config::from_source(|key| match key {
            "MQTT_HOST" => Some("127.0.0.1".to_string()),
            "MQTT_CONNECT_TIMEOUT_MS" => Some("200".to_string()),
            "MQTT_RETRY_INTERVAL_MS" => Some("100".to_string()),
            _ => None,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn requests_are_deferred_while_disconnected() {
        let (tx, _rx) = mpsc::channel(4);
        let session = BrokerSession::new(test_config(), tx);

        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(session.subscribe("a/b/c/d").await.unwrap(), Ack::Deferred);
        assert_eq!(session.unsubscribe("a/b/c/d").await.unwrap(), Ack::Deferred);
        assert!(matches!(
            session.publish("a/b/c/d", b"x".to_vec(), QosLevel::AtMostOnce, false).await,
            Err(BrokerError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn requests_reach_attached_transport() {
        let (tx, _rx) = mpsc::channel(4);
        let session = BrokerSession::new(test_config(), tx);
        let transport = Arc::new(RecordingTransport::default());
        session.attach(transport.clone()).await;

        assert_eq!(session.state(), ConnectionState::Connected);
        assert_eq!(session.subscribe("a/b/c/d").await.unwrap(), Ack::Applied);
        session
            .publish("a/b/c/d", b"hello".to_vec(), QosLevel::ExactlyOnce, false)
            .await
            .unwrap();

        assert_eq!(*transport.subscribed.lock().unwrap(), vec!["a/b/c/d"]);
        let published = transport.published.lock().unwrap();
        assert_eq!(published[0].1, b"hello".to_vec());
        assert_eq!(published[0].2, QoS::ExactlyOnce);
    }

    #[tokio::test]
    async fn transport_failure_is_surfaced() {
        let (tx, _rx) = mpsc::channel(4);
        let session = BrokerSession::new(test_config(), tx);
        let transport = Arc::new(RecordingTransport {
            fail_topic: Some("bad/topic/x/y".to_string()),
            ..Default::default()
        });
        session.attach(transport).await;

        let err = session.subscribe("bad/topic/x/y").await.unwrap_err();
        assert!(matches!(err, BrokerError::Subscribe { topic, .. } if topic == "bad/topic/x/y"));
    }

    #[tokio::test]
    async fn full_queue_rejects_new_messages() {
        let (tx, mut rx) = mpsc::channel(2);
        let session = BrokerSession::new(test_config(), tx);

        for n in 0..5 {
            session.deliver(InboundMessage::new("a/b/c/d", format!("{{\"sequence\":{}}}", n)));
        }

        assert_eq!(session.dropped_messages(), 3);
        assert_eq!(rx.recv().await.unwrap().payload, b"{\"sequence\":0}".to_vec());
        assert_eq!(rx.recv().await.unwrap().payload, b"{\"sequence\":1}".to_vec());
    }

    #[tokio::test]
    async fn detach_publishes_disconnected_state() {
        let (tx, _rx) = mpsc::channel(1);
        let session = BrokerSession::new(test_config(), tx);
        let mut state_rx = session.watch_state();

        session.attach(Arc::new(RecordingTransport::default())).await;
        state_rx.changed().await.unwrap();
        assert_eq!(*state_rx.borrow_and_update(), ConnectionState::Connected);

        session.detach().await;
        state_rx.changed().await.unwrap();
        assert_eq!(*state_rx.borrow_and_update(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn disconnect_detaches_transport() {
        let (tx, _rx) = mpsc::channel(1);
        let session = BrokerSession::new(test_config(), tx);
        session.attach(Arc::new(RecordingTransport::default())).await;

        session.disconnect().await;

        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(session.subscribe("a/b/c/d").await.unwrap(), Ack::Deferred);
    }

    /// Accepts one MQTT 3.1.1 client, answers CONNECT with a successful
    /// CONNACK and returns every byte the client sends afterwards.
    async fn accept_one_client(listener: tokio::net::TcpListener) -> Vec<u8> {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let (mut socket, _) = listener.accept().await.unwrap();
        let mut header = [0u8; 1];
        socket.read_exact(&mut header).await.unwrap();
        assert_eq!(header[0] >> 4, 1, "expected CONNECT");

        let mut remaining = 0usize;
        let mut shift = 0;
        loop {
            let mut byte = [0u8; 1];
            socket.read_exact(&mut byte).await.unwrap();
            remaining |= ((byte[0] & 0x7f) as usize) << shift;
            if byte[0] & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        let mut connect = vec![0u8; remaining];
        socket.read_exact(&mut connect).await.unwrap();

        socket.write_all(&[0x20, 0x02, 0x00, 0x00]).await.unwrap();

        let mut rest = Vec::new();
        let _ = socket.read_to_end(&mut rest).await;
        rest
    }

    #[tokio::test]
    async fn shutdown_sends_disconnect_to_broker() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let broker = tokio::spawn(accept_one_client(listener));

        let (tx, _rx) = mpsc::channel(1);
        let mut config = test_config();
        config.mqtt_port = port;
        config.mqtt_connect_timeout_ms = 2000;
        let session = BrokerSession::new(config, tx);
        let mut state_rx = session.watch_state();

        let (stop_tx, stop_rx) = watch::channel(false);
        let service = tokio::spawn(session.clone().run(stop_rx));

        timeout(Duration::from_secs(5), async {
            while *state_rx.borrow_and_update() != ConnectionState::Connected {
                state_rx.changed().await.unwrap();
            }
        })
        .await
        .unwrap();

        stop_tx.send(true).unwrap();
        timeout(Duration::from_secs(5), service).await.unwrap().unwrap();

        let received = timeout(Duration::from_secs(5), broker).await.unwrap().unwrap();
        assert_eq!(received.first(), Some(&0xE0), "expected DISCONNECT, got {:?}", received);
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn connect_to_unreachable_broker_fails_and_returns_to_disconnected() {
        let (tx, _rx) = mpsc::channel(1);
        let mut config = test_config();
        // Port 9 (discard) is not an MQTT broker; refusal or timeout both count.
        config.mqtt_port = 9;
        let session = BrokerSession::new(config, tx);

        assert!(session.connect().await.is_err());
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }
}
