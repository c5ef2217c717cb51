//! Sync orchestration: fetch, exclusion filtering, upload.

pub mod uploader;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::blacklist::{Blacklist, BlacklistEntry, ExclusionPolicy};
use crate::dates::DateRange;
use crate::fetch::RunSource;
use crate::model::{CombinedDataset, RunRecord};
use crate::telemetry::SyncEvent;
use uploader::{RunUploader, UploadOutcome};

/// Drop records whose id is on the blacklist.
///
/// Pure set difference; runs in `O(|records| + |blacklist|)` since the
/// blacklist is a hash set. An empty blacklist is a no-op.
pub fn exclude_blacklisted(records: Vec<RunRecord>, blacklist: &Blacklist) -> Vec<RunRecord> {
    if blacklist.is_empty() {
        return records;
    }
    records
        .into_iter()
        .filter(|r| !blacklist.contains(&r.run_id))
        .collect()
}

/// Result of one sync invocation
#[derive(Debug)]
pub struct SyncOutcome {
    pub job_id: String,
    pub runs_fetched: u64,
    pub runs_excluded: u64,
    pub newly_blacklisted: u64,
    pub upload: UploadOutcome,
    pub dataset: CombinedDataset,
    pub duration: Duration,
}

/// The pipeline drives one fetch -> filter -> upload pass per invocation.
///
/// Strictly linear and single-pass: the full record set is materialized
/// before filtering, and no stage calls back into an earlier one.
pub struct SyncPipeline {
    source: Arc<dyn RunSource>,
    uploader: RunUploader,
    blacklist: Blacklist,
    policy: Option<Arc<dyn ExclusionPolicy>>,
    maintain_blacklist: bool,
    telemetry_tx: mpsc::UnboundedSender<SyncEvent>,
}

impl SyncPipeline {
    pub fn new(
        source: Arc<dyn RunSource>,
        uploader: RunUploader,
        blacklist: Blacklist,
        policy: Option<Arc<dyn ExclusionPolicy>>,
        maintain_blacklist: bool,
        telemetry_tx: mpsc::UnboundedSender<SyncEvent>,
    ) -> Self {
        Self {
            source,
            uploader,
            blacklist,
            policy,
            maintain_blacklist,
            telemetry_tx,
        }
    }

    /// Run the complete sync for one date range
    ///
    /// 1. Fetch all runs in the range (fatal on failure; nothing uploaded)
    /// 2. Append newly flagged runs to the blacklist (only when the
    ///    maintenance toggle is on and a policy is configured)
    /// 3. Drop blacklisted runs
    /// 4. Upsert new/changed runs and read back the combined dataset
    pub async fn run(&mut self, range: &DateRange) -> Result<SyncOutcome> {
        let start_time = Instant::now();
        let job_id = Uuid::new_v4().to_string();
        info!("Starting sync job {} for {}", job_id, range);

        let records = self
            .source
            .fetch(range)
            .await
            .context("fetch stage failed; nothing was uploaded")?;
        let runs_fetched = records.len() as u64;
        let _ = self
            .telemetry_tx
            .send(SyncEvent::FetchCompleted { runs: runs_fetched });
        info!("Fetched {} runs", runs_fetched);

        let newly_blacklisted = self.run_blacklist_maintenance(&records).await?;

        let filtered = exclude_blacklisted(records, &self.blacklist);
        let runs_excluded = runs_fetched - filtered.len() as u64;
        if runs_excluded > 0 {
            info!("Excluded {} blacklisted runs", runs_excluded);
        }

        let (dataset, upload) = self.uploader.upload(filtered, range).await?;
        if upload.failed > 0 {
            warn!(
                "{} runs failed to upload and were left out of this sync",
                upload.failed
            );
        }

        Ok(SyncOutcome {
            job_id,
            runs_fetched,
            runs_excluded,
            newly_blacklisted,
            upload,
            dataset,
            duration: start_time.elapsed(),
        })
    }

    /// Blacklist maintenance path. Dormant unless explicitly toggled on;
    /// the exclusion policy itself always comes from the caller.
    async fn run_blacklist_maintenance(&mut self, records: &[RunRecord]) -> Result<u64> {
        if !self.maintain_blacklist {
            return Ok(0);
        }
        let Some(policy) = &self.policy else {
            warn!("blacklist maintenance enabled but no exclusion policy configured");
            return Ok(0);
        };

        let entries: Vec<BlacklistEntry> = records
            .iter()
            .filter_map(|run| {
                policy
                    .flag(run)
                    .map(|reason| BlacklistEntry::new(run.run_id.clone(), Some(reason)))
            })
            .collect();

        if entries.is_empty() {
            return Ok(0);
        }

        let added = self
            .blacklist
            .record(entries)
            .await
            .context("failed to update blacklist")?;
        if added > 0 {
            info!("Blacklisted {} newly flagged runs", added);
        }
        Ok(added as u64)
    }
}
