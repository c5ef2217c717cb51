//! Run fetching - tracking service queries and normalization

pub mod http;

use async_trait::async_trait;

use crate::dates::DateRange;
use crate::error::FetchError;
use crate::model::RunRecord;

/// Trait for querying runs from the tracking service.
///
/// A fetch covers every project configured for the process and pages through
/// the service until exhausted; the full record set is materialized before
/// the caller sees it. Any error aborts the invocation with nothing uploaded,
/// so re-running the same range is always safe.
#[async_trait]
pub trait RunSource: Send + Sync {
    /// Fetch all runs whose creation date lies within the range (inclusive).
    async fn fetch(&self, range: &DateRange) -> Result<Vec<RunRecord>, FetchError>;
}

pub use http::HttpRunSource;
