//! Run upload stage: destination-schema transform, dedup, batched upserts.

use std::sync::Arc;

use anyhow::{Result, anyhow};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::config::{MAX_UPLOAD_ATTEMPTS, RETRY_BASE_DELAY};
use crate::dates::DateRange;
use crate::destination::DestinationStore;
use crate::model::{CombinedDataset, RunRecord, StoredRun};
use crate::telemetry::SyncEvent;

/// Why a pending record is being written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UpsertKind {
    /// Not present at the destination yet
    Insert,
    /// Present, but the fetched record is strictly newer
    Update,
}

#[derive(Debug, Clone)]
struct PendingUpsert {
    run: StoredRun,
    kind: UpsertKind,
}

/// One record that could not be written after retries were exhausted.
///
/// Collected into the sync summary instead of aborting sibling uploads.
#[derive(Debug, Clone)]
pub struct UploadFailure {
    pub run_id: String,
    pub error: String,
}

/// Aggregate result of the upload stage
#[derive(Debug, Default, Clone)]
pub struct UploadOutcome {
    pub uploaded: u64,
    pub updated: u64,
    pub skipped: u64,
    pub failed: u64,
    pub failures: Vec<UploadFailure>,
}

/// Result of writing one batch of records
#[derive(Debug, Default)]
struct BatchResult {
    uploaded: u64,
    updated: u64,
    failed: u64,
    failures: Vec<UploadFailure>,
    duration_ms: u64,
}

/// Writes new/changed runs into the destination store.
pub struct RunUploader {
    destination: Arc<dyn DestinationStore>,
    batch_size: usize,
    batch_concurrency: usize,
    telemetry_tx: mpsc::UnboundedSender<SyncEvent>,
}

impl RunUploader {
    pub fn new(
        destination: Arc<dyn DestinationStore>,
        batch_size: usize,
        batch_concurrency: usize,
        telemetry_tx: mpsc::UnboundedSender<SyncEvent>,
    ) -> Self {
        Self {
            destination,
            batch_size,
            batch_concurrency,
            telemetry_tx,
        }
    }

    /// Transform, dedup and upsert the filtered records, then read back the
    /// combined dataset for the range.
    ///
    /// Only records that are new or strictly newer than the stored copy are
    /// written; per-record failures are isolated, retried, and collected into
    /// the outcome rather than aborting the invocation.
    pub async fn upload(
        &self,
        records: Vec<RunRecord>,
        range: &DateRange,
    ) -> Result<(CombinedDataset, UploadOutcome)> {
        let mut outcome = UploadOutcome::default();

        let pending = self.classify(&records, &mut outcome).await?;
        let _ = self.telemetry_tx.send(SyncEvent::UploadPlanned {
            pending: pending.len() as u64,
        });

        info!(
            "Uploading {} runs ({} skipped as unchanged)",
            pending.len(),
            outcome.skipped
        );

        self.upload_batches(pending, &mut outcome).await?;

        // The destination is the source of truth for the combined view:
        // pre-existing in-scope rows plus everything upserted above, keyed
        // uniquely by run_id.
        let rows = self.destination.list_in_range(range).await?;
        Ok((CombinedDataset::new(rows), outcome))
    }

    /// Map records to the destination schema and decide insert/update/skip
    /// against the destination's existing index.
    async fn classify(
        &self,
        records: &[RunRecord],
        outcome: &mut UploadOutcome,
    ) -> Result<Vec<PendingUpsert>> {
        let run_ids: Vec<String> = records.iter().map(|r| r.run_id.clone()).collect();
        let existing = self.destination.fetch_existing(&run_ids).await?;

        let mut pending = Vec::new();
        for record in records {
            let stored = StoredRun::from_record(record)?;
            match existing.get(&stored.run_id) {
                None => pending.push(PendingUpsert {
                    run: stored,
                    kind: UpsertKind::Insert,
                }),
                Some(current) if stored.updated_at > current.updated_at => {
                    pending.push(PendingUpsert {
                        run: stored,
                        kind: UpsertKind::Update,
                    })
                }
                Some(_) => outcome.skipped += 1,
            }
        }

        debug!(
            "classified {} records: {} pending, {} unchanged",
            records.len(),
            pending.len(),
            outcome.skipped
        );
        Ok(pending)
    }

    /// Write pending records in batches with bounded concurrency.
    async fn upload_batches(
        &self,
        pending: Vec<PendingUpsert>,
        outcome: &mut UploadOutcome,
    ) -> Result<()> {
        let batches: Vec<Vec<PendingUpsert>> = pending
            .chunks(self.batch_size)
            .map(|chunk| chunk.to_vec())
            .collect();

        let mut join_set: JoinSet<BatchResult> = JoinSet::new();
        let mut results = Vec::new();

        for batch in batches {
            // Wait if we've reached concurrency limit
            while join_set.len() >= self.batch_concurrency {
                if let Some(result) = join_set.join_next().await {
                    match result {
                        Ok(batch_result) => {
                            self.send_batch_telemetry(&batch_result);
                            results.push(batch_result);
                        }
                        Err(e) => return Err(anyhow!("Upload task panicked: {}", e)),
                    }
                }
            }

            let destination = Arc::clone(&self.destination);
            join_set.spawn(async move { Self::write_batch(destination, batch).await });
        }

        while let Some(result) = join_set.join_next().await {
            match result {
                Ok(batch_result) => {
                    self.send_batch_telemetry(&batch_result);
                    results.push(batch_result);
                }
                Err(e) => return Err(anyhow!("Upload task panicked: {}", e)),
            }
        }

        for result in results {
            outcome.uploaded += result.uploaded;
            outcome.updated += result.updated;
            outcome.failed += result.failed;
            outcome.failures.extend(result.failures);
        }
        Ok(())
    }

    fn send_batch_telemetry(&self, result: &BatchResult) {
        let _ = self.telemetry_tx.send(SyncEvent::BatchCompleted {
            upserted: result.uploaded + result.updated,
            failed: result.failed,
            duration_ms: result.duration_ms,
        });
    }

    /// Write one batch, record by record, so a failing record cannot take
    /// its neighbors down with it. Errors are captured in the result, not
    /// returned as Err.
    async fn write_batch(
        destination: Arc<dyn DestinationStore>,
        batch: Vec<PendingUpsert>,
    ) -> BatchResult {
        let start = std::time::Instant::now();
        let mut result = BatchResult::default();

        for item in batch {
            match Self::upsert_with_retry(&destination, &item.run).await {
                Ok(()) => match item.kind {
                    UpsertKind::Insert => result.uploaded += 1,
                    UpsertKind::Update => result.updated += 1,
                },
                Err(e) => {
                    result.failed += 1;
                    result.failures.push(UploadFailure {
                        run_id: item.run.run_id.clone(),
                        error: format!("{e:#}"),
                    });
                }
            }
        }

        result.duration_ms = start.elapsed().as_millis() as u64;
        result
    }

    /// Execute a single upsert with retry logic for transient errors
    async fn upsert_with_retry(
        destination: &Arc<dyn DestinationStore>,
        run: &StoredRun,
    ) -> Result<()> {
        for attempt in 0..MAX_UPLOAD_ATTEMPTS {
            match destination.upsert(run).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    if Self::is_retryable_error(&e) && attempt < MAX_UPLOAD_ATTEMPTS - 1 {
                        let delay = RETRY_BASE_DELAY * 2u32.pow(attempt);
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    return Err(e);
                }
            }
        }

        unreachable!("Retry loop should always return");
    }

    /// Check if error is retriable (transient errors that may resolve with retry)
    ///
    /// Renders the whole error chain: destination impls wrap the underlying
    /// driver error with context, so the transient marker sits below the top.
    fn is_retryable_error(error: &anyhow::Error) -> bool {
        let error_msg = format!("{error:#}");

        error_msg.contains("database is locked")
            || error_msg.contains("busy")
            || error_msg.contains("timeout")
            || error_msg.contains("connection")
            || error_msg.contains("unavailable")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::destination::SqliteDestination;
    use crate::model::RunStatus;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use serde_json::Map;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Destination that rejects the first few writes with a transient error,
    /// then behaves normally.
    struct RecoveringDestination {
        inner: SqliteDestination,
        failures_remaining: AtomicU32,
    }

    #[async_trait]
    impl DestinationStore for RecoveringDestination {
        async fn fetch_existing(&self, run_ids: &[String]) -> Result<HashMap<String, StoredRun>> {
            self.inner.fetch_existing(run_ids).await
        }

        async fn upsert(&self, run: &StoredRun) -> Result<()> {
            if self.failures_remaining.load(Ordering::SeqCst) > 0 {
                self.failures_remaining.fetch_sub(1, Ordering::SeqCst);
                anyhow::bail!("database is locked");
            }
            self.inner.upsert(run).await
        }

        async fn list_in_range(&self, range: &DateRange) -> Result<Vec<StoredRun>> {
            self.inner.list_in_range(range).await
        }

        async fn count(&self) -> Result<u64> {
            self.inner.count().await
        }
    }

    fn record(run_id: &str, created: &str, updated: &str) -> RunRecord {
        RunRecord {
            run_id: run_id.to_string(),
            created_at: ts(created),
            updated_at: ts(updated),
            status: RunStatus::Finished,
            metadata: Map::new(),
        }
    }

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn range() -> DateRange {
        DateRange::resolve_with_today(
            Some("2024-01-01"),
            Some("2024-01-31"),
            chrono::NaiveDate::from_ymd_opt(2030, 1, 1).unwrap(),
        )
        .unwrap()
    }

    fn uploader(destination: Arc<dyn DestinationStore>) -> RunUploader {
        let (tx, _rx) = mpsc::unbounded_channel();
        RunUploader::new(destination, 2, 2, tx)
    }

    #[tokio::test]
    async fn test_upload_inserts_new_records() {
        let destination: Arc<dyn DestinationStore> =
            Arc::new(SqliteDestination::in_memory().await.unwrap());
        let uploader = uploader(Arc::clone(&destination));

        let records = vec![
            record("r-1", "2024-01-01T08:00:00Z", "2024-01-01T08:00:00Z"),
            record("r-2", "2024-01-02T08:00:00Z", "2024-01-02T08:00:00Z"),
            record("r-3", "2024-01-03T08:00:00Z", "2024-01-03T08:00:00Z"),
        ];

        let (dataset, outcome) = uploader.upload(records, &range()).await.unwrap();
        assert_eq!(outcome.uploaded, 3);
        assert_eq!(outcome.updated, 0);
        assert_eq!(outcome.skipped, 0);
        assert_eq!(outcome.failed, 0);
        assert_eq!(dataset.len(), 3);
    }

    #[tokio::test]
    async fn test_unchanged_records_are_skipped() {
        let destination: Arc<dyn DestinationStore> =
            Arc::new(SqliteDestination::in_memory().await.unwrap());
        let uploader = uploader(Arc::clone(&destination));

        let records = vec![record("r-1", "2024-01-01T08:00:00Z", "2024-01-01T08:00:00Z")];
        uploader.upload(records.clone(), &range()).await.unwrap();

        // Same record again: nothing to write
        let (dataset, outcome) = uploader.upload(records, &range()).await.unwrap();
        assert_eq!(outcome.uploaded, 0);
        assert_eq!(outcome.skipped, 1);
        assert_eq!(dataset.len(), 1);
        assert_eq!(destination.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_newer_record_updates_in_place() {
        let destination: Arc<dyn DestinationStore> =
            Arc::new(SqliteDestination::in_memory().await.unwrap());
        let uploader = uploader(Arc::clone(&destination));

        uploader
            .upload(
                vec![record("r-1", "2024-01-01T08:00:00Z", "2024-01-01T08:00:00Z")],
                &range(),
            )
            .await
            .unwrap();

        let (dataset, outcome) = uploader
            .upload(
                vec![record("r-1", "2024-01-01T08:00:00Z", "2024-01-05T08:00:00Z")],
                &range(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.updated, 1);
        assert_eq!(outcome.uploaded, 0);
        assert_eq!(dataset.len(), 1);
        assert_eq!(
            dataset.get("r-1").unwrap().updated_at,
            ts("2024-01-05T08:00:00Z")
        );
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried_until_success() {
        let recovering = Arc::new(RecoveringDestination {
            inner: SqliteDestination::in_memory().await.unwrap(),
            failures_remaining: AtomicU32::new(2),
        });
        let destination: Arc<dyn DestinationStore> = recovering.clone();
        let uploader = uploader(Arc::clone(&destination));

        let (dataset, outcome) = uploader
            .upload(
                vec![record("r-1", "2024-01-01T08:00:00Z", "2024-01-01T08:00:00Z")],
                &range(),
            )
            .await
            .unwrap();

        // Both injected failures were consumed by retries before the write
        // landed; nothing surfaces in the failure summary
        assert_eq!(recovering.failures_remaining.load(Ordering::SeqCst), 0);
        assert_eq!(outcome.uploaded, 1);
        assert_eq!(outcome.failed, 0);
        assert!(outcome.failures.is_empty());
        assert!(dataset.get("r-1").is_some());
        assert_eq!(destination.count().await.unwrap(), 1);
    }

    #[test]
    fn test_wrapped_transient_error_is_recognized() {
        // Destination impls add context on top of the driver error; the
        // retryable check must see through the wrapping
        let inner = anyhow::anyhow!("database is locked");
        let wrapped = inner.context("failed to upsert run r-1");
        assert!(RunUploader::is_retryable_error(&wrapped));

        let permanent = anyhow::anyhow!("UNIQUE constraint violated")
            .context("failed to upsert run r-1");
        assert!(!RunUploader::is_retryable_error(&permanent));
    }

    #[tokio::test]
    async fn test_stale_record_does_not_overwrite() {
        let destination: Arc<dyn DestinationStore> =
            Arc::new(SqliteDestination::in_memory().await.unwrap());
        let uploader = uploader(Arc::clone(&destination));

        uploader
            .upload(
                vec![record("r-1", "2024-01-01T08:00:00Z", "2024-01-05T08:00:00Z")],
                &range(),
            )
            .await
            .unwrap();

        let (dataset, outcome) = uploader
            .upload(
                vec![record("r-1", "2024-01-01T08:00:00Z", "2024-01-02T08:00:00Z")],
                &range(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.skipped, 1);
        assert_eq!(
            dataset.get("r-1").unwrap().updated_at,
            ts("2024-01-05T08:00:00Z")
        );
    }
}
