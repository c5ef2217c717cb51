//! Error taxonomy for the sync pipeline.
//!
//! Validation and fetch errors are fatal for the whole invocation; per-record
//! upload failures are recovered locally and reported in the sync summary
//! (see `sync::uploader::UploadFailure`).

use thiserror::Error;

/// Errors produced while resolving the requested date range.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DateRangeError {
    /// Exactly one of start/end was given. Both or neither are required.
    #[error("both start-date and end-date must be provided, or neither")]
    MissingArgument,

    /// A date failed to parse, or start > end.
    #[error("invalid date format or range: {0}")]
    InvalidRange(String),
}

/// Errors produced while fetching runs from the tracking service.
///
/// Any variant aborts the invocation before anything is uploaded, so
/// re-running with the same date range is always safe.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Transport-level failure after retries were exhausted.
    #[error("request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// Non-success response from the service after retries were exhausted.
    #[error("tracking service returned {status} for {url}: {body}")]
    Status {
        url: String,
        status: u16,
        body: String,
    },

    /// The response body did not match the expected run payload shape.
    #[error("failed to decode run payload: {0}")]
    Decode(#[from] serde_json::Error),
}

impl FetchError {
    /// HTTP status code for status errors, if applicable.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            FetchError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}
