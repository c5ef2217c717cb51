//! Configuration constants for the sync pipeline.
//!
//! This module centralizes all tunable parameters and constants used throughout
//! the application.

use std::time::Duration;

// ============================================================================
// Tracking Service Client Configuration
// ============================================================================

pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Runs requested per page when querying the tracking service
///
/// 200 keeps individual responses well under typical API payload limits while
/// requiring few round-trips for a day of runs.
pub const FETCH_PAGE_SIZE: usize = 200;

/// Attempts per page request before the fetch fails the invocation
pub const MAX_FETCH_ATTEMPTS: u32 = 5;

// ============================================================================
// Uploader Configuration
// ============================================================================

/// Records per upload batch
pub const UPLOAD_BATCH_SIZE: usize = 100;

/// Number of upload batches in flight at once
pub const BATCH_CONCURRENCY: usize = 8;

/// Attempts per record upsert before it is counted as a permanent failure
pub const MAX_UPLOAD_ATTEMPTS: u32 = 4;

// ============================================================================
// Retry Backoff
// ============================================================================

/// First retry delay; doubled on each subsequent attempt
pub const RETRY_BASE_DELAY: Duration = Duration::from_millis(250);

/// Cap on a single backoff interval
///
/// Keeps the worst-case wait per page bounded so a flaky service does not
/// stall the invocation for minutes before failing.
pub const RETRY_MAX_INTERVAL: Duration = Duration::from_secs(8);
