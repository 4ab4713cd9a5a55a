//! Error types shared by the registry, store, broker session and bridge.

use std::time::Duration;
use thiserror::Error;

/// Why a single inbound message could not be turned into a record.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("payload is not a JSON object: {0}")]
    Malformed(String),
    #[error("topic '{topic}' has {found} segments, at least {required} required")]
    TopicShape {
        topic: String,
        found: usize,
        required: usize,
    },
}

/// Failure of a single connection attempt.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("connection to {address} timed out after {timeout:?}")]
    Timeout { address: String, timeout: Duration },
    #[error("broker refused connection: {0}")]
    Refused(String),
    #[error("transport error: {0}")]
    Transport(String),
}

impl From<rumqttc::ConnectionError> for ConnectError {
    fn from(e: rumqttc::ConnectionError) -> Self {
        match e {
            rumqttc::ConnectionError::ConnectionRefused(code) => {
                ConnectError::Refused(format!("{:?}", code))
            }
            other => ConnectError::Transport(other.to_string()),
        }
    }
}

/// Error returned by a [`crate::mqtt_service::Transport`] request.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct TransportError(pub String);

impl From<rumqttc::ClientError> for TransportError {
    fn from(e: rumqttc::ClientError) -> Self {
        TransportError(e.to_string())
    }
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error("failed to subscribe to '{topic}': {source}")]
    Subscribe {
        topic: String,
        source: TransportError,
    },
    #[error("failed to unsubscribe from '{topic}': {source}")]
    Unsubscribe {
        topic: String,
        source: TransportError,
    },
    #[error("failed to publish to '{topic}': {source}")]
    Publish {
        topic: String,
        source: TransportError,
    },
    #[error("not connected to the MQTT broker")]
    NotConnected,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("storage worker failed: {0}")]
    Worker(String),
    #[error("query timed out after {0:?}")]
    Timeout(Duration),
}

impl StoreError {
    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Pool(_) | StoreError::Timeout(_) => true,
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy
                    | rusqlite::ErrorCode::DatabaseLocked
                    | rusqlite::ErrorCode::SystemIoFailure
                    | rusqlite::ErrorCode::CannotOpen
            ),
            _ => false,
        }
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(e: tokio::task::JoinError) -> Self {
        StoreError::Worker(e.to_string())
    }
}

/// Error surfaced by an administrative operation.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error(transparent)]
    Store(#[from] StoreError),
}
