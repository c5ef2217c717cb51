//! SQLite implementation of the destination store.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

use crate::dates::DateRange;
use crate::destination::DestinationStore;
use crate::model::{StoredRun, format_timestamp};

/// SQLite can bind at most 999 parameters per statement; stay well under.
const LOOKUP_CHUNK_SIZE: usize = 400;

const SCHEMA_SQL: &str = "CREATE TABLE IF NOT EXISTS runs (
    run_id TEXT PRIMARY KEY,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    status TEXT NOT NULL,
    metadata TEXT NOT NULL
)";

const INDEX_SQL: &str = "CREATE INDEX IF NOT EXISTS idx_runs_created_at ON runs (created_at)";

pub struct SqliteDestination {
    pool: SqlitePool,
}

impl SqliteDestination {
    /// Open (or create) the destination database at the given path.
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open destination database {}", path.display()))?;

        let destination = Self { pool };
        destination.init_schema().await?;
        Ok(destination)
    }

    /// In-memory database for tests. Pinned to a single connection so every
    /// query sees the same database.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .context("failed to open in-memory destination database")?;

        let destination = Self { pool };
        destination.init_schema().await?;
        Ok(destination)
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(SCHEMA_SQL)
            .execute(&self.pool)
            .await
            .context("failed to create runs table")?;
        sqlx::query(INDEX_SQL)
            .execute(&self.pool)
            .await
            .context("failed to create runs index")?;
        Ok(())
    }
}

type RunRow = (String, String, String, String, String);

fn row_to_stored(row: RunRow) -> Result<StoredRun> {
    let (run_id, created_at, updated_at, status, metadata) = row;
    Ok(StoredRun {
        created_at: parse_timestamp(&created_at, &run_id)?,
        updated_at: parse_timestamp(&updated_at, &run_id)?,
        run_id,
        status,
        metadata,
    })
}

fn parse_timestamp(value: &str, run_id: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .with_context(|| format!("invalid stored timestamp '{value}' for run {run_id}"))
}

#[async_trait]
impl DestinationStore for SqliteDestination {
    async fn fetch_existing(&self, run_ids: &[String]) -> Result<HashMap<String, StoredRun>> {
        let mut existing = HashMap::with_capacity(run_ids.len());

        for chunk in run_ids.chunks(LOOKUP_CHUNK_SIZE) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let sql = format!(
                "SELECT run_id, created_at, updated_at, status, metadata \
                 FROM runs WHERE run_id IN ({placeholders})"
            );

            let mut query = sqlx::query_as::<_, RunRow>(&sql);
            for run_id in chunk {
                query = query.bind(run_id);
            }

            let rows = query
                .fetch_all(&self.pool)
                .await
                .context("failed to query existing runs")?;

            for row in rows {
                let stored = row_to_stored(row)?;
                existing.insert(stored.run_id.clone(), stored);
            }
        }

        Ok(existing)
    }

    async fn upsert(&self, run: &StoredRun) -> Result<()> {
        sqlx::query(
            "INSERT INTO runs (run_id, created_at, updated_at, status, metadata) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(run_id) DO UPDATE SET \
                 created_at = excluded.created_at, \
                 updated_at = excluded.updated_at, \
                 status = excluded.status, \
                 metadata = excluded.metadata",
        )
        .bind(&run.run_id)
        .bind(format_timestamp(&run.created_at))
        .bind(format_timestamp(&run.updated_at))
        .bind(&run.status)
        .bind(&run.metadata)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to upsert run {}", run.run_id))?;
        Ok(())
    }

    async fn list_in_range(&self, range: &DateRange) -> Result<Vec<StoredRun>> {
        let rows = sqlx::query_as::<_, RunRow>(
            "SELECT run_id, created_at, updated_at, status, metadata \
             FROM runs WHERE date(created_at) >= ? AND date(created_at) <= ? \
             ORDER BY run_id",
        )
        .bind(range.start.to_string())
        .bind(range.end.to_string())
        .fetch_all(&self.pool)
        .await
        .context("failed to list runs in range")?;

        rows.into_iter().map(row_to_stored).collect()
    }

    async fn count(&self) -> Result<u64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM runs")
            .fetch_one(&self.pool)
            .await
            .context("failed to count runs")?;
        Ok(count as u64)
    }
}
