//! HTTP client for the tracking service's run query API.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use backoff::future::retry_notify;
use backoff::{Error as BackoffError, ExponentialBackoffBuilder};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::fs;
use tracing::{debug, warn};

use crate::config::{FETCH_PAGE_SIZE, MAX_FETCH_ATTEMPTS, REQUEST_TIMEOUT, RETRY_BASE_DELAY, RETRY_MAX_INTERVAL};
use crate::dates::DateRange;
use crate::error::FetchError;
use crate::fetch::RunSource;
use crate::model::{RunRecord, RunStatus};

/// One page of the run listing endpoint. A missing or null `next_cursor`
/// means the listing is exhausted.
#[derive(Debug, Deserialize)]
struct RunsPage {
    #[serde(default)]
    runs: Vec<RemoteRun>,
    #[serde(default)]
    next_cursor: Option<String>,
}

/// Wire shape of a run. Fields the normalizer does not recognize are
/// collected into `extra` and preserved under the record's metadata.
#[derive(Debug, Deserialize)]
struct RemoteRun {
    #[serde(alias = "id")]
    run_id: String,
    created_at: DateTime<Utc>,
    #[serde(default, alias = "heartbeat_at")]
    updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    state: Option<String>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

fn normalize(remote: RemoteRun, project: &str) -> RunRecord {
    let mut metadata = remote.extra;
    metadata
        .entry("project".to_string())
        .or_insert_with(|| Value::String(project.to_string()));

    RunRecord {
        run_id: remote.run_id,
        created_at: remote.created_at,
        // Runs that were never updated report only their creation time
        updated_at: remote.updated_at.unwrap_or(remote.created_at),
        status: RunStatus::from_wire(remote.state.as_deref()),
        metadata,
    }
}

/// Fetches runs over HTTP with cursor pagination and bounded retries.
pub struct HttpRunSource {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    projects: Vec<String>,
    page_size: usize,
    cache_dir: Option<PathBuf>,
    max_attempts: u32,
    retry_base_delay: Duration,
}

impl HttpRunSource {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        projects: Vec<String>,
        cache_dir: Option<PathBuf>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            projects,
            page_size: FETCH_PAGE_SIZE,
            cache_dir,
            max_attempts: MAX_FETCH_ATTEMPTS,
            retry_base_delay: RETRY_BASE_DELAY,
        })
    }

    /// Override the retry policy (attempt cap and first delay).
    pub fn with_retry_policy(mut self, max_attempts: u32, base_delay: Duration) -> Self {
        self.max_attempts = max_attempts;
        self.retry_base_delay = base_delay;
        self
    }

    fn runs_url(&self) -> String {
        format!("{}/api/v1/runs", self.base_url)
    }

    /// Fetch one page body, retrying transient failures (network errors,
    /// 5xx, 429) with exponential backoff up to the attempt cap.
    async fn fetch_page_body(
        &self,
        project: &str,
        range: &DateRange,
        cursor: Option<&str>,
    ) -> Result<String, FetchError> {
        let url = self.runs_url();

        let mut params: Vec<(&str, String)> = vec![
            ("project", project.to_string()),
            ("created_after", range.start.to_string()),
            ("created_before", range.end.to_string()),
            ("page_size", self.page_size.to_string()),
        ];
        if let Some(cursor) = cursor {
            params.push(("cursor", cursor.to_string()));
        }

        let backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(self.retry_base_delay)
            .with_multiplier(2.0)
            .with_randomization_factor(0.2)
            .with_max_interval(RETRY_MAX_INTERVAL)
            .with_max_elapsed_time(None)
            .build();

        let attempt_counter = AtomicU32::new(0);

        retry_notify(
            backoff,
            || {
                let attempt = attempt_counter.fetch_add(1, Ordering::Relaxed) + 1;
                let mut request = self.client.get(&url).query(&params);
                if let Some(key) = &self.api_key {
                    request = request.bearer_auth(key);
                }
                let url = url.clone();
                let max_attempts = self.max_attempts;

                async move {
                    match request.send().await {
                        Ok(response) => {
                            let status = response.status();
                            if status.is_success() {
                                return response.text().await.map_err(|source| {
                                    BackoffError::permanent(FetchError::Http { url, source })
                                });
                            }

                            let body = response.text().await.unwrap_or_default();
                            let error = FetchError::Status {
                                url,
                                status: status.as_u16(),
                                body,
                            };
                            let retryable = status.is_server_error() || status.as_u16() == 429;
                            if retryable && attempt < max_attempts {
                                Err(BackoffError::transient(error))
                            } else {
                                Err(BackoffError::permanent(error))
                            }
                        }
                        Err(source) => {
                            let error = FetchError::Http { url, source };
                            if attempt < max_attempts {
                                Err(BackoffError::transient(error))
                            } else {
                                Err(BackoffError::permanent(error))
                            }
                        }
                    }
                }
            },
            |err, delay| warn!("retrying run fetch after {:?}: {}", delay, err),
        )
        .await
    }

    /// Snapshot a raw page payload under the cache directory. Best-effort:
    /// cache failures are logged, never fatal.
    async fn cache_page(&self, project: &str, page_index: u32, body: &str) {
        let Some(cache_dir) = &self.cache_dir else {
            return;
        };

        let dir = cache_dir
            .join("pages")
            .join(project.replace(['/', '\\'], "_"));
        if let Err(e) = fs::create_dir_all(&dir).await {
            warn!("failed to create page cache directory {}: {}", dir.display(), e);
            return;
        }

        let path = dir.join(format!("{page_index:04}.json"));
        if let Err(e) = fs::write(&path, body).await {
            warn!("failed to cache page {}: {}", path.display(), e);
        }
    }
}

#[async_trait]
impl RunSource for HttpRunSource {
    async fn fetch(&self, range: &DateRange) -> Result<Vec<RunRecord>, FetchError> {
        let mut records = Vec::new();

        for project in &self.projects {
            let mut cursor: Option<String> = None;
            let mut page_index = 0u32;
            let mut project_runs = 0usize;

            loop {
                let body = self
                    .fetch_page_body(project, range, cursor.as_deref())
                    .await?;
                self.cache_page(project, page_index, &body).await;

                let page: RunsPage = serde_json::from_str(&body)?;
                debug!(
                    "project {}: page {} returned {} runs",
                    project,
                    page_index,
                    page.runs.len()
                );

                project_runs += page.runs.len();
                records.extend(page.runs.into_iter().map(|r| normalize(r, project)));

                cursor = page.next_cursor.filter(|c| !c.is_empty());
                page_index += 1;
                if cursor.is_none() {
                    break;
                }
            }

            debug!(
                "project {}: fetched {} runs over {} pages",
                project, project_runs, page_index
            );
        }

        Ok(records)
    }
}
