//! Durable subscription intent.
//!
//! The registry is the single source of truth for what the bridge should be
//! subscribed to. The live broker subscription set is always rebuilt from it
//! on (re)connect, never the other way around.

use rusqlite::params;
use std::path::Path;
use std::sync::Mutex;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard};
use tracing::{debug, info};

use crate::db::{open_pool, DbPool};
use crate::error::StoreError;
use crate::models::SubscriptionRecord;

pub struct SubscriptionRegistry {
    pool: DbPool,
    // Serializes add/remove so concurrent writers on the same topic are linearizable.
    write_lock: Mutex<()>,
    // Held across a registry write and the broker request that follows it.
    intent: AsyncMutex<()>,
}

impl SubscriptionRegistry {
    pub fn new(pool: DbPool) -> Self {
        Self {
            pool,
            write_lock: Mutex::new(()),
            intent: AsyncMutex::new(()),
        }
    }

    pub fn open(db_path: impl AsRef<Path>, pool_size: u32) -> Result<Self, StoreError> {
        let registry = Self::new(open_pool(db_path, pool_size)?);
        registry.initialize_db()?;
        Ok(registry)
    }

    pub fn initialize_db(&self) -> Result<(), StoreError> {
        let conn = self.pool.get()?;
        conn.execute_batch(
            r#"
        CREATE TABLE IF NOT EXISTS topics (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            topic TEXT NOT NULL UNIQUE,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        );
        "#,
        )?;
        info!("Subscription registry schema initialized.");
        Ok(())
    }

    /// Records intent to subscribe. Returns `true` if the topic was new.
    pub fn add(&self, topic: &str) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let conn = self.pool.get()?;

        let inserted = conn.execute(
            "INSERT OR IGNORE INTO topics (topic) VALUES (?1)",
            params![topic],
        )?;
        if inserted > 0 {
            info!(topic, "Added topic to subscription registry.");
        } else {
            debug!(topic, "Topic already in subscription registry.");
        }
        Ok(inserted > 0)
    }

    /// Drops intent to subscribe. Returns `true` if the topic was present.
    pub fn remove(&self, topic: &str) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let conn = self.pool.get()?;

        let removed = conn.execute("DELETE FROM topics WHERE topic = ?1", params![topic])?;
        if removed > 0 {
            info!(topic, "Removed topic from subscription registry.");
        }
        Ok(removed > 0)
    }

    /// Exclusive right to change intent and apply it to the broker.
    ///
    /// Callers that add or remove a topic and then subscribe or unsubscribe
    /// must hold this guard across both steps; reconciliation holds it while
    /// it re-checks and re-subscribes each topic. The live subscription set
    /// then never outlives the intent behind it.
    pub async fn lock_intent(&self) -> MutexGuard<'_, ()> {
        self.intent.lock().await
    }

    pub fn contains(&self, topic: &str) -> Result<bool, StoreError> {
        let conn = self.pool.get()?;
        let found: bool = conn.query_row(
            "SELECT EXISTS (SELECT 1 FROM topics WHERE topic = ?1)",
            params![topic],
            |row| row.get(0),
        )?;
        Ok(found)
    }

    /// All intended subscriptions in insertion order.
    pub fn list(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.records()?.into_iter().map(|r| r.topic).collect())
    }

    pub fn records(&self) -> Result<Vec<SubscriptionRecord>, StoreError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare("SELECT topic, created_at FROM topics ORDER BY id ASC")?;
        let rows = stmt.query_map([], |row| {
            Ok(SubscriptionRecord {
                topic: row.get(0)?,
                created_at: row.get(1)?,
            })
        })?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }
}
