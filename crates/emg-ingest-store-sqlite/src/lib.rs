#![allow(clippy::missing_errors_doc)]

use std::path::Path;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use emg_ingest_core::{format_rfc3339, now_utc, parse_rfc3339_utc, EmgRecord, EmgRecordRow};
use rusqlite::{params, Connection};
use rust_decimal::Decimal;

const EMG_MIGRATION_VERSION: i64 = 1;

const SCHEMA_EMG_V1: &str = r"
CREATE TABLE IF NOT EXISTS emg_records (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  timestamp INTEGER NOT NULL,
  rawValue TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_emg_records_timestamp
  ON emg_records(timestamp);
";

/// SQLite-backed Storage Writer for EMG sample records.
///
/// One connection per store instance; callers that need per-request scoping
/// open a fresh store per call and let RAII release the connection on every
/// exit path.
pub struct SqliteEmgStore {
    conn: Connection,
}

impl SqliteEmgStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Creates the EMG schema if absent and records the migration version.
    /// Idempotent; the service runs this once before accepting traffic.
    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_EMG_V1)
            .context("failed to apply emg schema")?;

        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![EMG_MIGRATION_VERSION, now],
            )
            .context("failed to register emg schema migration")?;

        Ok(())
    }

    /// Appends a batch of records as one all-or-nothing transaction.
    ///
    /// Every record maps to exactly one row; `timestamp` and `rawValue` are
    /// copied verbatim and `created_at` is assigned here. On any failure the
    /// transaction rolls back and no rows become visible. An empty batch is
    /// an empty commit.
    pub fn append_records(&mut self, records: &[EmgRecord]) -> Result<()> {
        let created_at = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;

        let tx = self
            .conn
            .transaction()
            .context("failed to start append transaction")?;

        {
            let mut stmt = tx
                .prepare(
                    "INSERT INTO emg_records(timestamp, rawValue, created_at)
                     VALUES (?1, ?2, ?3)",
                )
                .context("failed to prepare emg insert")?;

            for record in records {
                stmt.execute(params![
                    record.timestamp,
                    record.raw_value.to_string(),
                    created_at
                ])
                .context("failed to stage emg record")?;
            }
        }

        tx.commit().context("failed to commit append transaction")?;
        Ok(())
    }

    pub fn count_records(&self) -> Result<i64> {
        self.conn
            .query_row("SELECT COUNT(*) FROM emg_records", [], |row| row.get(0))
            .context("failed to count emg records")
    }

    /// Reads back every persisted row in insertion order.
    pub fn list_records(&self) -> Result<Vec<EmgRecordRow>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, timestamp, rawValue, created_at FROM emg_records ORDER BY id ASC")
            .context("failed to prepare emg select")?;

        let mut rows = stmt.query([])?;
        let mut records = Vec::new();

        while let Some(row) = rows.next()? {
            let id: i64 = row.get(0)?;
            let timestamp: i64 = row.get(1)?;
            let raw_text: String = row.get(2)?;
            let created_text: String = row.get(3)?;

            let raw_value = Decimal::from_str(&raw_text)
                .with_context(|| format!("invalid stored rawValue for row {id}: {raw_text}"))?;
            let created_at = parse_rfc3339_utc(&created_text)
                .map_err(|err| anyhow!("invalid stored created_at for row {id}: {err}"))?;

            records.push(EmgRecordRow {
                id,
                timestamp,
                raw_value,
                created_at,
            });
        }

        Ok(records)
    }

    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}
