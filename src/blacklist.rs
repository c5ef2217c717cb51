//! Durable blacklist of excluded run identifiers.
//!
//! Stored as one JSON object per line so the maintenance path can append
//! without rewriting the whole set. Entries are never evicted by this
//! pipeline; membership by `run_id` is the only query the pipeline uses.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::model::RunRecord;

/// One excluded run. `reason` and `added_at` are informational.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlacklistEntry {
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub added_at: DateTime<Utc>,
}

impl BlacklistEntry {
    pub fn new(run_id: impl Into<String>, reason: Option<String>) -> Self {
        Self {
            run_id: run_id.into(),
            reason,
            added_at: Utc::now(),
        }
    }
}

/// Decides which fetched runs get blacklisted.
///
/// The policy is external configuration; the pipeline ships no heuristic of
/// its own. Returning `Some(reason)` flags the run.
pub trait ExclusionPolicy: Send + Sync {
    fn flag(&self, run: &RunRecord) -> Option<String>;
}

/// Persistent set of excluded run ids, backed by a JSON-lines file.
pub struct Blacklist {
    path: PathBuf,
    ids: HashSet<String>,
}

impl Blacklist {
    /// Load the blacklist from disk. A missing file is an empty set.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let ids = if fs::try_exists(&path)
            .await
            .with_context(|| format!("failed to check blacklist file {}", path.display()))?
        {
            let contents = fs::read_to_string(&path)
                .await
                .with_context(|| format!("failed to read blacklist file {}", path.display()))?;

            let mut ids = HashSet::new();
            for (line_no, line) in contents.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                let entry: BlacklistEntry = serde_json::from_str(line).with_context(|| {
                    format!(
                        "failed to parse blacklist entry at {}:{}",
                        path.display(),
                        line_no + 1
                    )
                })?;
                ids.insert(entry.run_id);
            }
            ids
        } else {
            HashSet::new()
        };

        Ok(Self { path, ids })
    }

    pub fn contains(&self, run_id: &str) -> bool {
        self.ids.contains(run_id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Append entries to the durable set, skipping ids already present.
    /// Returns how many entries were actually added.
    pub async fn record(&mut self, entries: Vec<BlacklistEntry>) -> Result<usize> {
        let fresh: Vec<BlacklistEntry> = entries
            .into_iter()
            .filter(|e| !self.ids.contains(&e.run_id))
            .collect();

        if fresh.is_empty() {
            return Ok(0);
        }

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create blacklist directory {}", parent.display()))?;
        }

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("failed to open blacklist file {}", self.path.display()))?;

        for entry in &fresh {
            let mut line = serde_json::to_string(entry).context("failed to serialize blacklist entry")?;
            line.push('\n');
            file.write_all(line.as_bytes())
                .await
                .context("failed to append blacklist entry")?;
        }
        file.flush().await.context("failed to flush blacklist file")?;

        let added = fresh.len();
        for entry in fresh {
            self.ids.insert(entry.run_id);
        }
        Ok(added)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let blacklist = Blacklist::load(dir.path().join("blacklist.jsonl"))
            .await
            .unwrap();
        assert!(blacklist.is_empty());
        assert!(!blacklist.contains("anything"));
    }

    #[tokio::test]
    async fn test_record_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("blacklist.jsonl");

        let mut blacklist = Blacklist::load(&path).await.unwrap();
        let added = blacklist
            .record(vec![
                BlacklistEntry::new("run-a", Some("diverged".to_string())),
                BlacklistEntry::new("run-b", None),
            ])
            .await
            .unwrap();
        assert_eq!(added, 2);
        assert!(blacklist.contains("run-a"));
        assert!(blacklist.contains("run-b"));

        // Entries survive a reload
        let reloaded = Blacklist::load(&path).await.unwrap();
        assert_eq!(reloaded.len(), 2);
        assert!(reloaded.contains("run-a"));
    }

    #[tokio::test]
    async fn test_record_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("blacklist.jsonl");

        let mut blacklist = Blacklist::load(&path).await.unwrap();
        blacklist
            .record(vec![BlacklistEntry::new("run-a", None)])
            .await
            .unwrap();

        let added = blacklist
            .record(vec![
                BlacklistEntry::new("run-a", Some("again".to_string())),
                BlacklistEntry::new("run-c", None),
            ])
            .await
            .unwrap();
        assert_eq!(added, 1);
        assert_eq!(blacklist.len(), 2);

        // Re-adding must not duplicate the durable entry either
        let reloaded = Blacklist::load(&path).await.unwrap();
        assert_eq!(reloaded.len(), 2);
    }

    #[tokio::test]
    async fn test_blank_lines_are_skipped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("blacklist.jsonl");
        tokio::fs::write(
            &path,
            "{\"run_id\":\"run-x\",\"added_at\":\"2024-01-01T00:00:00Z\"}\n\n",
        )
        .await
        .unwrap();

        let blacklist = Blacklist::load(&path).await.unwrap();
        assert_eq!(blacklist.len(), 1);
        assert!(blacklist.contains("run-x"));
    }
}
