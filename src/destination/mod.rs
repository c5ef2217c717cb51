//! Destination store - existing-record lookup and upsert-by-run_id

pub mod sqlite;

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;

use crate::dates::DateRange;
use crate::model::StoredRun;

/// Trait for the store uploads land in.
///
/// The pipeline is both reader (dedup lookups, combined-dataset listing) and
/// writer (upserts) of this store; there is a single writer per invocation.
#[async_trait]
pub trait DestinationStore: Send + Sync {
    /// Look up already-stored rows for the given run ids.
    async fn fetch_existing(&self, run_ids: &[String]) -> Result<HashMap<String, StoredRun>>;

    /// Insert-or-update one row, keyed by `run_id`. Idempotent.
    async fn upsert(&self, run: &StoredRun) -> Result<()>;

    /// All rows whose creation date falls inside the range, ordered by
    /// `run_id`.
    async fn list_in_range(&self, range: &DateRange) -> Result<Vec<StoredRun>>;

    /// Total number of stored rows.
    async fn count(&self) -> Result<u64>;
}

pub use sqlite::SqliteDestination;
