use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Row};
use std::path::Path;
use std::time::Duration;
use tracing::{error, info};

use crate::error::StoreError;
use crate::models::{ParsedRecord, StoredRow};

pub type DbPool = r2d2::Pool<SqliteConnectionManager>;

/// Durable sink for parsed records.
///
/// Implementations must surface every failure to the caller; nothing is
/// dropped silently.
pub trait MessageStore: Send + Sync {
    fn append(&self, record: &ParsedRecord) -> Result<StoredRow, StoreError>;

    /// Most recently appended row for `topic`.
    fn latest(&self, topic: &str) -> Result<Option<StoredRow>, StoreError>;

    /// Up to `limit` rows for `topic`, newest first.
    fn recent(&self, topic: &str, limit: usize) -> Result<Vec<StoredRow>, StoreError>;
}

/// Opens a pooled SQLite database in WAL mode.
pub fn open_pool(path: impl AsRef<Path>, max_size: u32) -> Result<DbPool, StoreError> {
    let manager = SqliteConnectionManager::file(path.as_ref()).with_init(|conn| {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;
        Ok(())
    });

    let pool = r2d2::Pool::builder()
        .max_size(max_size)
        .connection_timeout(Duration::from_secs(5))
        .build(manager)?;
    Ok(pool)
}

/// Runs a blocking storage call off the async runtime.
pub(crate) async fn blocking<T, F>(f: F) -> Result<T, StoreError>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await?
}

pub struct SqliteStore {
    pool: DbPool,
}

impl SqliteStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Opens the database at `db_path` and provisions the schema.
    pub fn open(db_path: impl AsRef<Path>, pool_size: u32) -> Result<Self, StoreError> {
        let store = Self::new(open_pool(db_path, pool_size)?);
        store.initialize_db()?;
        Ok(store)
    }

    /// Initializes the database schema.
    pub fn initialize_db(&self) -> Result<(), StoreError> {
        let conn = self.pool.get()?;

        info!("Initializing message store schema...");

        match conn.execute_batch(
            r#"
        CREATE TABLE IF NOT EXISTS messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            topic TEXT NOT NULL,
            device_id TEXT NOT NULL,
            short_name TEXT NOT NULL,
            data_item_id TEXT NOT NULL,
            sequence TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            value TEXT NOT NULL,
            stored_at DATETIME DEFAULT CURRENT_TIMESTAMP
        );

        CREATE INDEX IF NOT EXISTS idx_messages_topic_id ON messages (topic, id);
        "#,
        ) {
            Ok(_) => {
                info!("Message store schema initialized successfully.");
                Ok(())
            }
            Err(e) => {
                error!("Failed to initialize message store schema: {:?}", e);
                Err(e.into())
            }
        }
    }
}

fn row_to_stored(row: &Row<'_>) -> rusqlite::Result<StoredRow> {
    Ok(StoredRow {
        id: row.get("id")?,
        record: ParsedRecord {
            topic: row.get("topic")?,
            device_id: row.get("device_id")?,
            short_name: row.get("short_name")?,
            data_item_id: row.get("data_item_id")?,
            sequence: row.get("sequence")?,
            timestamp: row.get("timestamp")?,
            value: row.get("value")?,
        },
        stored_at: row.get("stored_at")?,
    })
}

const SELECT_COLUMNS: &str =
    "SELECT id, topic, device_id, short_name, data_item_id, sequence, timestamp, value, stored_at FROM messages";

impl MessageStore for SqliteStore {
    fn append(&self, record: &ParsedRecord) -> Result<StoredRow, StoreError> {
        let conn = self.pool.get()?;

        let (id, stored_at): (i64, String) = conn.query_row(
            "INSERT INTO messages (topic, device_id, short_name, data_item_id, sequence, timestamp, value)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             RETURNING id, stored_at",
            params![
                record.topic,
                record.device_id,
                record.short_name,
                record.data_item_id,
                record.sequence,
                record.timestamp,
                record.value,
            ],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        Ok(StoredRow {
            id,
            record: record.clone(),
            stored_at,
        })
    }

    fn latest(&self, topic: &str) -> Result<Option<StoredRow>, StoreError> {
        let conn = self.pool.get()?;

        let mut stmt =
            conn.prepare(&format!("{} WHERE topic = ?1 ORDER BY id DESC LIMIT 1", SELECT_COLUMNS))?;
        let mut rows = stmt.query(params![topic])?;

        match rows.next()? {
            Some(row) => Ok(Some(row_to_stored(row)?)),
            None => Ok(None),
        }
    }

    fn recent(&self, topic: &str, limit: usize) -> Result<Vec<StoredRow>, StoreError> {
        let conn = self.pool.get()?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let mut stmt =
            conn.prepare(&format!("{} WHERE topic = ?1 ORDER BY id DESC LIMIT ?2", SELECT_COLUMNS))?;
        let rows = stmt.query_map(params![topic, limit], row_to_stored)?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }

        Ok(results)
    }
}
