use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

use crate::StorageError;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    fingerprint TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    company_name TEXT NOT NULL,
    company_key TEXT NOT NULL,
    location TEXT NOT NULL,
    url TEXT NOT NULL,
    description TEXT,
    posted_at TEXT,
    source TEXT NOT NULL,
    status INTEGER NOT NULL DEFAULT 0,
    fit_category INTEGER NOT NULL DEFAULT 0,
    sustainability_matches TEXT NOT NULL DEFAULT '[]',
    keyword_score INTEGER,
    location_weight INTEGER,
    note TEXT,
    classifier_confidence REAL,
    classifier_requests INTEGER NOT NULL DEFAULT 0,
    sightings INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    classified_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
CREATE INDEX IF NOT EXISTS idx_jobs_fit_classified ON jobs(fit_category, classified_at);
CREATE INDEX IF NOT EXISTS idx_jobs_company_key ON jobs(company_key);

CREATE TABLE IF NOT EXISTS companies (
    key TEXT PRIMARY KEY,
    display_name TEXT NOT NULL,
    url TEXT,
    overview TEXT,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS usage_ledger (
    period TEXT NOT NULL,
    call_type TEXT NOT NULL,
    used INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (period, call_type)
);

CREATE TABLE IF NOT EXISTS usage_periods (
    period TEXT PRIMARY KEY,
    exhausted INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS filter_adjustments (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    created_at TEXT NOT NULL,
    previous_config TEXT NOT NULL,
    new_config TEXT NOT NULL,
    trigger_reason TEXT NOT NULL,
    reverted INTEGER NOT NULL DEFAULT 0,
    reverted_at TEXT
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_filter_adjustments_one_open
    ON filter_adjustments(reverted) WHERE reverted = 0;
"#;

/// Connection pool over the jobsift SQLite database.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Opens (creating if needed) the database at `database_url` and applies the schema.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Single-connection in-memory database; every pooled connection would
    /// otherwise see its own empty database.
    pub async fn in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<(), StorageError> {
        sqlx::query(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Fixed-width UTC timestamps so text comparison in SQL orders correctly.
pub(crate) fn ts_to_sql(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn ts_from_sql(raw: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| StorageError::Corrupt(format!("invalid timestamp {raw:?}: {e}")))
}

pub(crate) fn opt_ts_from_sql(raw: Option<String>) -> Result<Option<DateTime<Utc>>, StorageError> {
    raw.as_deref().map(ts_from_sql).transpose()
}
