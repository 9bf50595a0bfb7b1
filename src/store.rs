//! ==============================================================================
//! store.rs - append-only sample store (sqlite)
//! ==============================================================================
//!
//! purpose:
//!     durable history of every accepted measurement, plus the two queries the
//!     rest of the gateway needs: "latest row" and "most recent N rows".
//!
//! design:
//!     every call opens its own connection and drops it afterwards. nothing is
//!     shared between the reader task and the http handlers, so there is no
//!     handle to hand across threads. rows are never updated or deleted here.
//!
//! relationships:
//!     - used by: gateway.rs (append), arbiter.rs (fallback), server.rs (history)
//!
//! ==============================================================================

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqliteRow};
use sqlx::{ConnectOptions, Row};
use std::path::{Path, PathBuf};

use crate::domain::{Measurement, Source, StoredRow};
use crate::error::StoreError;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS readings (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp   TEXT NOT NULL,
        temperature REAL NOT NULL,
        humidity    REAL NOT NULL,
        source      TEXT NOT NULL DEFAULT 'remote',
        raw         TEXT
    )
";

const COLUMNS: &str = "id, timestamp, temperature, humidity, source, raw";

#[derive(Debug, Clone)]
pub struct SampleStore {
    path: PathBuf,
    options: SqliteConnectOptions,
}

impl SampleStore {
    /// opens (or creates) the database file and makes sure the table exists
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .disable_statement_logging();

        let store = Self { path, options };
        let mut conn = store.connect().await?;
        sqlx::query(SCHEMA).execute(&mut conn).await?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn connect(&self) -> Result<SqliteConnection, StoreError> {
        self.options.connect().await.map_err(StoreError::Connect)
    }

    /// appends one row and returns its id
    pub async fn append(&self, m: &Measurement) -> Result<i64, StoreError> {
        let mut conn = self.connect().await?;
        let result = sqlx::query(
            "INSERT INTO readings (timestamp, temperature, humidity, source, raw) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(m.timestamp.to_rfc3339())
        .bind(m.temperature)
        .bind(m.humidity)
        .bind(m.source.as_str())
        .bind(m.raw.as_deref())
        .execute(&mut conn)
        .await?;

        Ok(result.last_insert_rowid())
    }

    pub async fn latest(&self) -> Result<Option<StoredRow>, StoreError> {
        let mut conn = self.connect().await?;
        let sql = format!("SELECT {COLUMNS} FROM readings ORDER BY id DESC LIMIT 1");
        let row = sqlx::query(&sql).fetch_optional(&mut conn).await?;
        row.as_ref().map(decode_row).transpose()
    }

    /// newest first
    pub async fn recent(&self, limit: u32) -> Result<Vec<StoredRow>, StoreError> {
        let mut conn = self.connect().await?;
        let sql = format!("SELECT {COLUMNS} FROM readings ORDER BY id DESC LIMIT ?");
        let rows = sqlx::query(&sql)
            .bind(i64::from(limit))
            .fetch_all(&mut conn)
            .await?;
        rows.iter().map(decode_row).collect()
    }

    pub async fn count(&self) -> Result<i64, StoreError> {
        let mut conn = self.connect().await?;
        let row = sqlx::query("SELECT COUNT(*) AS n FROM readings")
            .fetch_one(&mut conn)
            .await?;
        Ok(row.try_get("n")?)
    }
}

fn decode_row(row: &SqliteRow) -> Result<StoredRow, StoreError> {
    let id: i64 = row.try_get("id")?;
    let timestamp: String = row.try_get("timestamp")?;
    let source: Option<String> = row.try_get("source")?;

    let timestamp = DateTime::parse_from_rfc3339(&timestamp)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt { id, detail: format!("timestamp {timestamp:?}: {e}") })?;

    Ok(StoredRow {
        id,
        measurement: Measurement {
            temperature: row.try_get("temperature")?,
            humidity: row.try_get("humidity")?,
            timestamp,
            source: source.as_deref().map(Source::from_tag).unwrap_or(Source::Persisted),
            raw: row.try_get("raw")?,
        },
    })
}
