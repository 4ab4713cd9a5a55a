//! Turns raw MQTT deliveries into [`ParsedRecord`]s.
//!
//! Payloads are JSON objects carrying `timestamp`, `sequence`, `dataItemId`
//! and `value`, all kept as text. Individual fields may be absent and fall back to defaults; only
//! a payload that is not an object, or a topic that the active
//! [`TopicConvention`] cannot read, fails the message.

use serde_json::{Map, Value};
use std::sync::Arc;

use crate::error::ParseError;
use crate::models::{ParsedRecord, TopicIdentity};

/// Derives device id and short name from a topic string.
pub trait TopicConvention: Send + Sync {
    fn identify(&self, topic: &str) -> Result<TopicIdentity, ParseError>;
}

/// Device id taken a fixed number of segments from the end of the topic,
/// short name from the last segment.
///
/// With the default offset of 4, `X/Y/Z/Dev1/Controller/Events/Mode` yields
/// device `Dev1` and short name `Mode`.
#[derive(Debug, Clone)]
pub struct SegmentOffset {
    delimiter: char,
    device_offset: usize,
}

impl SegmentOffset {
    pub fn new(delimiter: char, device_offset: usize) -> Self {
        Self {
            delimiter,
            device_offset: device_offset.max(1),
        }
    }
}

impl Default for SegmentOffset {
    fn default() -> Self {
        Self::new('/', 4)
    }
}

impl TopicConvention for SegmentOffset {
    fn identify(&self, topic: &str) -> Result<TopicIdentity, ParseError> {
        let segments: Vec<&str> = topic.split(self.delimiter).collect();
        if segments.len() < self.device_offset {
            return Err(ParseError::TopicShape {
                topic: topic.to_string(),
                found: segments.len(),
                required: self.device_offset,
            });
        }

        let device_id = segments[segments.len() - self.device_offset].trim();
        let short_name = segments[segments.len() - 1].trim();

        Ok(TopicIdentity {
            device_id: device_id.to_string(),
            short_name: short_name.to_string(),
        })
    }
}

#[derive(Clone)]
pub struct PayloadParser {
    convention: Arc<dyn TopicConvention>,
}

impl PayloadParser {
    pub fn new(convention: Arc<dyn TopicConvention>) -> Self {
        Self { convention }
    }

    pub fn parse(&self, topic: &str, payload: &[u8]) -> Result<ParsedRecord, ParseError> {
        let document: Map<String, Value> =
            serde_json::from_slice(payload).map_err(|e| ParseError::Malformed(e.to_string()))?;
        let identity = self.convention.identify(topic)?;

        Ok(ParsedRecord {
            topic: topic.to_string(),
            device_id: identity.device_id,
            short_name: identity.short_name,
            data_item_id: text_field(&document, "dataItemId"),
            sequence: text_field(&document, "sequence"),
            timestamp: text_field(&document, "timestamp"),
            value: text_field(&document, "value"),
        })
    }
}

impl Default for PayloadParser {
    fn default() -> Self {
        Self::new(Arc::new(SegmentOffset::default()))
    }
}

fn text_field(document: &Map<String, Value>, key: &str) -> String {
    match document.get(key) {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}
