use dotenvy::dotenv;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::models::QosLevel;

pub const DEFAULT_TOPIC_TEMPLATE: &str = "MTConnect/Observation/{device}/Controller/Events/{item}";

#[derive(Debug, Clone)]
pub struct Config {
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: String,
    pub mqtt_password: String,
    pub mqtt_client_id: String,
    pub mqtt_keep_alive_secs: u64,
    pub mqtt_connect_timeout_ms: u64,
    pub mqtt_max_retries: i32,
    pub mqtt_retry_interval_ms: u64,
    pub mqtt_subscribe_qos: QosLevel,

    pub registry_db_path: String,
    pub store_db_path: String,
    pub db_pool_size: u32,

    pub ingest_queue_capacity: usize,
    pub store_retry_attempts: usize,
    pub store_retry_base_ms: u64,
    pub query_timeout_ms: u64,

    pub topic_delimiter: char,
    pub device_segment_offset: usize,
    pub topic_template: String,

    pub http_bind: String,
    pub log_level: String,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Environment variable {0} is missing or invalid.")]
    MissingOrInvalid(String),
    #[error("Parsing error: {0}")]
    ParsingError(String),
}

impl Config {
    /// Validate timeout values and other critical configurations.
    fn validate(&self) -> Result<(), ConfigError> {
        const MIN_TIMEOUT: u64 = 100;
        const MAX_TIMEOUT: u64 = 1_000_000;

        if !(MIN_TIMEOUT..=MAX_TIMEOUT).contains(&self.mqtt_retry_interval_ms) {
            return Err(ConfigError::ParsingError(format!(
                "MQTT_RETRY_INTERVAL_MS must be between {} and {} ms",
                MIN_TIMEOUT, MAX_TIMEOUT
            )));
        }
        if !(MIN_TIMEOUT..=MAX_TIMEOUT).contains(&self.mqtt_connect_timeout_ms) {
            return Err(ConfigError::ParsingError(format!(
                "MQTT_CONNECT_TIMEOUT_MS must be between {} and {} ms",
                MIN_TIMEOUT, MAX_TIMEOUT
            )));
        }
        if self.ingest_queue_capacity == 0 {
            return Err(ConfigError::ParsingError(
                "INGEST_QUEUE_CAPACITY must be greater than zero".to_string(),
            ));
        }
        if self.db_pool_size == 0 {
            return Err(ConfigError::ParsingError(
                "DB_POOL_SIZE must be greater than zero".to_string(),
            ));
        }
        if self.device_segment_offset == 0 {
            return Err(ConfigError::ParsingError(
                "DEVICE_SEGMENT_OFFSET must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv().ok(); // Load environment variables from .env file

        Self::from_source(|key| env::var(key).ok())
    }

    /// Builds the configuration from any key lookup, applying defaults.
    pub fn from_source<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let or_default =
            |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let config = Self {
            // MQTT Configuration
            mqtt_host: lookup("MQTT_HOST")
                .filter(|h| !h.trim().is_empty())
                .ok_or_else(|| ConfigError::MissingOrInvalid("MQTT_HOST".to_string()))?,
            mqtt_port: parse_value(&lookup, "MQTT_PORT", 1883)?,
            mqtt_username: lookup("MQTT_USERNAME").unwrap_or_default(),
            mqtt_password: lookup("MQTT_PASSWORD").unwrap_or_default(),
            mqtt_client_id: lookup("MQTT_CLIENT_ID")
                .unwrap_or_else(|| format!("mqtt2db_{}", Uuid::new_v4())),
            mqtt_keep_alive_secs: parse_value(&lookup, "MQTT_KEEP_ALIVE_SECS", 10)?,
            mqtt_connect_timeout_ms: parse_value(&lookup, "MQTT_CONNECT_TIMEOUT_MS", 5000)?,
            mqtt_max_retries: parse_value(&lookup, "MQTT_MAX_RETRIES", -1)?,
            mqtt_retry_interval_ms: parse_value(&lookup, "MQTT_RETRY_INTERVAL_MS", 5000)?,
            mqtt_subscribe_qos: {
                let level: u8 = parse_value(&lookup, "MQTT_SUBSCRIBE_QOS", 1)?;
                QosLevel::try_from(level).map_err(ConfigError::ParsingError)?
            },

            // Storage
            registry_db_path: or_default("REGISTRY_DB_PATH", "subscribed_topics.db"),
            store_db_path: or_default("STORE_DB_PATH", "messages.db"),
            db_pool_size: parse_value(&lookup, "DB_POOL_SIZE", 4)?,

            // Ingestion
            ingest_queue_capacity: parse_value(&lookup, "INGEST_QUEUE_CAPACITY", 1024)?,
            store_retry_attempts: parse_value(&lookup, "STORE_RETRY_ATTEMPTS", 3)?,
            store_retry_base_ms: parse_value(&lookup, "STORE_RETRY_BASE_MS", 100)?,
            query_timeout_ms: parse_value(&lookup, "QUERY_TIMEOUT_MS", 2000)?,

            // Topic convention
            topic_delimiter: parse_value(&lookup, "TOPIC_DELIMITER", '/')?,
            device_segment_offset: parse_value(&lookup, "DEVICE_SEGMENT_OFFSET", 4)?,
            topic_template: or_default("TOPIC_TEMPLATE", DEFAULT_TOPIC_TEMPLATE),

            http_bind: or_default("HTTP_BIND", "0.0.0.0:8000"),
            log_level: or_default("LOG_LEVEL", "info"),
        };

        config.validate()?;

        Ok(config)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.mqtt_connect_timeout_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.mqtt_retry_interval_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}

fn parse_value<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| ConfigError::ParsingError(format!("{} has an invalid value '{}'", key, raw))),
        None => Ok(default),
    }
}
