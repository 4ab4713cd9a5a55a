//! Bridges an MQTT broker to SQLite.
//!
//! Topics of interest are kept in a durable [`registry::SubscriptionRegistry`].
//! A [`mqtt_service::BrokerSession`] holds the broker connection and pushes
//! every delivery into a bounded queue that the
//! [`pipeline::IngestionPipeline`] drains: each payload is parsed into a
//! [`models::ParsedRecord`] and appended to the [`db::MessageStore`]. After
//! every (re)connect the pipeline re-subscribes all registry topics.
//! [`bridge::Bridge`] exposes the administrative operations used by the HTTP
//! adapter in [`rest_server`].

pub mod bridge;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod mqtt_service;
pub mod parser;
pub mod pipeline;
pub mod registry;
pub mod rest_server;
pub mod service_utils;
