//! High-level runner API for the run sync pipeline.
//!
//! This module provides a simplified public interface that encapsulates all
//! the internal setup of the HTTP source, blacklist, destination store and
//! progress reporting.
//!
//! This is the primary API for external users and for the CLI.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use derive_builder::Builder;
use tokio::sync::mpsc;

use crate::config::{BATCH_CONCURRENCY, UPLOAD_BATCH_SIZE};
use crate::destination::SqliteDestination;
use crate::fetch::HttpRunSource;
use crate::sync::uploader::RunUploader;
use crate::sync::SyncPipeline;
use crate::telemetry::spawn_progress_reporter;

pub use crate::blacklist::{Blacklist, BlacklistEntry, ExclusionPolicy};
pub use crate::dates::DateRange;
pub use crate::error::{DateRangeError, FetchError};
pub use crate::model::{CombinedDataset, RunRecord, RunStatus, StoredRun};
pub use crate::sync::SyncOutcome;
pub use crate::sync::uploader::{UploadFailure, UploadOutcome};

/// Options for running a sync operation
///
/// Everything the pipeline needs is passed here by construction; nothing is
/// read from process environment.
#[derive(Debug, Clone, Builder)]
pub struct SyncOptions {
    /// Base URL of the tracking service
    #[builder(setter(into))]
    pub base_url: String,

    /// API key for the tracking service. Optional; unauthenticated calls
    /// fail only if the service actually requires the credential.
    #[builder(default)]
    pub api_key: Option<String>,

    /// Projects to fetch runs from
    pub projects: Vec<String>,

    /// Local working storage for the tracking client (raw page snapshots)
    #[builder(default)]
    pub cache_dir: Option<PathBuf>,

    /// Path of the destination database uploads land in
    #[builder(setter(into))]
    pub destination_target: PathBuf,

    /// Path of the durable blacklist file
    #[builder(setter(into))]
    pub blacklist_path: PathBuf,

    /// Run the blacklist maintenance path after fetching. Requires an
    /// exclusion policy to have any effect.
    #[builder(default)]
    pub maintain_blacklist: bool,

    /// Quiet mode - no progress bar
    #[builder(default)]
    pub quiet: bool,
}

/// Run a full sync for the given date range
///
/// This is the main entry point. It handles all the internal setup:
/// - loading the blacklist from disk
/// - building the HTTP run source
/// - opening the destination database
/// - wiring telemetry to a progress reporter
///
/// # Example
///
/// ```no_run
/// use tracker_sync::runner::{DateRange, SyncOptionsBuilder, run_sync};
///
/// # async fn example() -> anyhow::Result<()> {
/// let range = DateRange::resolve(Some("2024-01-01"), Some("2024-01-02"))?;
/// let options = SyncOptionsBuilder::default()
///     .base_url("https://tracker.example.com")
///     .projects(vec!["acme/vision".to_string()])
///     .destination_target("runs.db")
///     .blacklist_path("blacklist.jsonl")
///     .build()?;
///
/// let outcome = run_sync(&range, options).await?;
/// println!("{} rows in combined dataset", outcome.dataset.len());
/// # Ok(())
/// # }
/// ```
pub async fn run_sync(range: &DateRange, options: SyncOptions) -> Result<SyncOutcome> {
    run_sync_with_policy(range, options, None).await
}

/// Same as [`run_sync`], with an exclusion policy for the blacklist
/// maintenance path. The policy decides which fetched runs get flagged; it
/// is deliberately external to this crate.
pub async fn run_sync_with_policy(
    range: &DateRange,
    options: SyncOptions,
    policy: Option<Arc<dyn ExclusionPolicy>>,
) -> Result<SyncOutcome> {
    let blacklist = Blacklist::load(&options.blacklist_path)
        .await
        .context("failed to load blacklist")?;

    let source = HttpRunSource::new(
        options.base_url,
        options.api_key,
        options.projects,
        options.cache_dir,
    )?;

    let destination = SqliteDestination::connect(&options.destination_target)
        .await
        .context("failed to open destination store")?;

    let (telemetry_tx, telemetry_rx) = mpsc::unbounded_channel();
    let progress = spawn_progress_reporter(telemetry_rx, options.quiet);

    let uploader = RunUploader::new(
        Arc::new(destination),
        UPLOAD_BATCH_SIZE,
        BATCH_CONCURRENCY,
        telemetry_tx.clone(),
    );

    let mut pipeline = SyncPipeline::new(
        Arc::new(source),
        uploader,
        blacklist,
        policy,
        options.maintain_blacklist,
        telemetry_tx,
    );

    let outcome = pipeline.run(range).await;

    // Drop the pipeline (and with it every telemetry sender) so the
    // progress task sees the channel close and finishes.
    drop(pipeline);
    if let Some(handle) = progress {
        let _ = handle.await;
    }

    outcome
}
