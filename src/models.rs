use serde::{Deserialize, Serialize};
use std::fmt;
use time::OffsetDateTime;

/// Device and short name derived from a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicIdentity {
    pub device_id: String,
    pub short_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionRecord {
    pub topic: String,
    pub created_at: String,
}

/// A PUBLISH received from the broker, handed to the ingestion worker once.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub received_at: OffsetDateTime,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            received_at: OffsetDateTime::now_utc(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParsedRecord {
    pub topic: String,
    pub device_id: String,
    pub short_name: String,
    pub data_item_id: String,
    /// Sequence exactly as the publisher sent it.
    pub sequence: String,
    pub timestamp: String,
    pub value: String,
}

/// A persisted record. `id` grows with insertion order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredRow {
    pub id: i64,
    #[serde(flatten)]
    pub record: ParsedRecord,
    pub stored_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        };
        f.write_str(s)
    }
}

/// Outcome of a subscribe/unsubscribe that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Ack {
    /// Sent to the broker on a live connection.
    Applied,
    /// Session not connected; reconciliation replays it on the next connect.
    Deferred,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum QosLevel {
    #[default]
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl TryFrom<u8> for QosLevel {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QosLevel::AtMostOnce),
            1 => Ok(QosLevel::AtLeastOnce),
            2 => Ok(QosLevel::ExactlyOnce),
            other => Err(format!("invalid QoS level {}, expected 0, 1 or 2", other)),
        }
    }
}

impl From<QosLevel> for u8 {
    fn from(qos: QosLevel) -> Self {
        match qos {
            QosLevel::AtMostOnce => 0,
            QosLevel::AtLeastOnce => 1,
            QosLevel::ExactlyOnce => 2,
        }
    }
}

impl From<QosLevel> for rumqttc::QoS {
    fn from(qos: QosLevel) -> Self {
        match qos {
            QosLevel::AtMostOnce => rumqttc::QoS::AtMostOnce,
            QosLevel::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
            QosLevel::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qos_from_wire_level() {
        assert_eq!(QosLevel::try_from(1).unwrap(), QosLevel::AtLeastOnce);
        assert!(QosLevel::try_from(3).is_err());
        let level: QosLevel = serde_json::from_str("2").unwrap();
        assert_eq!(level, QosLevel::ExactlyOnce);
    }

    #[test]
    fn stored_row_serializes_flat() {
        let row = StoredRow {
            id: 7,
            record: ParsedRecord {
                topic: "a/b/c/d".into(),
                device_id: "a".into(),
                short_name: "d".into(),
                data_item_id: "x".into(),
                sequence: "3".into(),
                timestamp: String::new(),
                value: "ON".into(),
            },
            stored_at: "2024-01-01 00:00:00".into(),
        };
        let json = serde_json::to_value(&row).unwrap();
        assert_eq!(json["id"], 7);
        assert_eq!(json["value"], "ON");
        assert_eq!(json["device_id"], "a");
        assert_eq!(json["sequence"], "3");
    }
}
