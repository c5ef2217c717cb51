//! Telemetry events sent from pipeline stages for progress reporting.

use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Progress events emitted while a sync runs
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// Fetch stage finished with this many runs (pre-filter)
    FetchCompleted { runs: u64 },
    /// Uploader classified the records; this many upserts are pending
    UploadPlanned { pending: u64 },
    /// One upload batch finished
    BatchCompleted {
        upserted: u64,
        failed: u64,
        duration_ms: u64,
    },
}

/// Statistics aggregated from telemetry events
#[derive(Debug, Default, Clone)]
pub struct SyncStats {
    pub runs_fetched: u64,
    pub pending_uploads: u64,
    pub runs_upserted: u64,
    pub runs_failed: u64,
    pub batch_durations_ms: Vec<u64>,
}

impl SyncStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update stats with a telemetry event
    pub fn update(&mut self, event: &SyncEvent) {
        match event {
            SyncEvent::FetchCompleted { runs } => {
                self.runs_fetched += runs;
            }
            SyncEvent::UploadPlanned { pending } => {
                self.pending_uploads += pending;
            }
            SyncEvent::BatchCompleted {
                upserted,
                failed,
                duration_ms,
            } => {
                self.runs_upserted += upserted;
                self.runs_failed += failed;
                self.batch_durations_ms.push(*duration_ms);
            }
        }
    }

    /// Calculate percentile from batch durations
    pub fn percentile(&self, p: f64) -> Option<u64> {
        if self.batch_durations_ms.is_empty() {
            return None;
        }

        let mut sorted = self.batch_durations_ms.clone();
        sorted.sort_unstable();

        let index = ((p / 100.0) * sorted.len() as f64).ceil() as usize - 1;
        let index = index.min(sorted.len() - 1);

        Some(sorted[index])
    }

    /// Get p50, p90, p99 percentiles
    pub fn get_percentiles(&self) -> (Option<u64>, Option<u64>, Option<u64>) {
        (
            self.percentile(50.0),
            self.percentile(90.0),
            self.percentile(99.0),
        )
    }
}

/// Consume telemetry events and render an upload progress bar.
///
/// Returns `None` in quiet mode; the receiver is dropped and senders fall
/// back to no-ops.
pub fn spawn_progress_reporter(
    mut rx: mpsc::UnboundedReceiver<SyncEvent>,
    quiet: bool,
) -> Option<JoinHandle<()>> {
    if quiet {
        return None;
    }

    Some(tokio::spawn(async move {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::default_bar()
                .template(
                    "[{elapsed_precise}] Uploads: [{bar:30.cyan/blue}] {pos}/{len} ({percent}%) {msg}",
                )
                .unwrap()
                .progress_chars("=>-"),
        );

        let mut stats = SyncStats::new();

        while let Some(event) = rx.recv().await {
            stats.update(&event);

            match event {
                SyncEvent::FetchCompleted { runs } => {
                    bar.set_message(format!("{runs} runs fetched"));
                }
                SyncEvent::UploadPlanned { pending } => {
                    bar.set_length(pending);
                    bar.set_message(String::new());
                }
                SyncEvent::BatchCompleted {
                    upserted, failed, ..
                } => {
                    bar.inc(upserted + failed);
                    let (p50, p90, p99) = stats.get_percentiles();
                    if let (Some(p50), Some(p90), Some(p99)) = (p50, p90, p99) {
                        bar.set_message(format!("p50: {p50}ms, p90: {p90}ms, p99: {p99}ms"));
                    }
                }
            }
        }

        bar.finish_and_clear();
    }))
}
