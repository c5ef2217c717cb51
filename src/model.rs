//! Shared data model for the sync pipeline.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};

/// Lifecycle state reported by the tracking service for a run.
///
/// Informational only; never used as a filtering criterion. The service may
/// grow new states, so unrecognized values are preserved verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Finished,
    Failed,
    Crashed,
    Other(String),
}

impl RunStatus {
    /// Parse the wire representation, falling back to `Other` for states
    /// this version does not know about.
    pub fn from_wire(state: Option<&str>) -> Self {
        match state {
            Some(s) => match s.to_ascii_lowercase().as_str() {
                "running" => RunStatus::Running,
                "finished" => RunStatus::Finished,
                "failed" => RunStatus::Failed,
                "crashed" => RunStatus::Crashed,
                _ => RunStatus::Other(s.to_string()),
            },
            None => RunStatus::Other("unknown".to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Finished => "finished",
            RunStatus::Failed => "failed",
            RunStatus::Crashed => "crashed",
            RunStatus::Other(s) => s,
        }
    }
}

/// One experiment run as fetched from the tracking service.
///
/// Ephemeral: lives for a single pipeline invocation and is either dropped
/// (blacklisted), upserted into the destination (new/changed), or left
/// untouched (already stored, unchanged).
#[derive(Debug, Clone)]
pub struct RunRecord {
    /// Opaque identifier assigned by the remote service. Primary key.
    pub run_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: RunStatus,
    /// Open key-value payload (hyperparameters, metrics, tags). Fields the
    /// normalizer does not recognize land here unchanged.
    pub metadata: Map<String, Value>,
}

/// A run row in the destination schema.
///
/// Timestamps are kept as-is; `metadata` is serialized to a single JSON text
/// column so the open schema survives the destination round-trip losslessly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRun {
    pub run_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: String,
    pub metadata: String,
}

impl StoredRun {
    /// Transform a fetched record into the destination schema.
    pub fn from_record(record: &RunRecord) -> Result<Self> {
        let metadata = serde_json::to_string(&record.metadata)
            .with_context(|| format!("failed to serialize metadata for run {}", record.run_id))?;
        Ok(Self {
            run_id: record.run_id.clone(),
            created_at: record.created_at,
            updated_at: record.updated_at,
            status: record.status.as_str().to_string(),
            metadata,
        })
    }
}

/// Render a timestamp the way the destination and CSV output store it.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// The final output table: union of pre-existing destination records in the
/// range scope and newly upserted records, keyed uniquely by `run_id`.
#[derive(Debug, Clone)]
pub struct CombinedDataset {
    rows: Vec<StoredRun>,
}

impl CombinedDataset {
    /// Build from destination rows. Callers are expected to pass rows keyed
    /// uniquely by `run_id` (the destination enforces this).
    pub fn new(rows: Vec<StoredRun>) -> Self {
        Self { rows }
    }

    pub fn rows(&self) -> &[StoredRun] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Look up a row by run id.
    pub fn get(&self, run_id: &str) -> Option<&StoredRun> {
        self.rows.iter().find(|r| r.run_id == run_id)
    }

    /// Write the dataset as CSV with fixed columns; `metadata` is one JSON
    /// cell per row.
    pub fn write_csv<W: std::io::Write>(&self, writer: W) -> Result<()> {
        let mut csv = csv::Writer::from_writer(writer);
        csv.write_record(["run_id", "created_at", "updated_at", "status", "metadata"])
            .context("failed to write CSV header")?;
        for row in &self.rows {
            let created_at = format_timestamp(&row.created_at);
            let updated_at = format_timestamp(&row.updated_at);
            csv.write_record([
                row.run_id.as_str(),
                created_at.as_str(),
                updated_at.as_str(),
                row.status.as_str(),
                row.metadata.as_str(),
            ])
            .with_context(|| format!("failed to write CSV row for run {}", row.run_id))?;
        }
        csv.flush().context("failed to flush CSV output")?;
        Ok(())
    }

    pub fn write_csv_file(&self, path: &Path) -> Result<()> {
        let file = std::fs::File::create(path)
            .with_context(|| format!("failed to create output file {}", path.display()))?;
        self.write_csv(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_status_from_wire() {
        assert_eq!(RunStatus::from_wire(Some("finished")), RunStatus::Finished);
        assert_eq!(RunStatus::from_wire(Some("CRASHED")), RunStatus::Crashed);
        assert_eq!(
            RunStatus::from_wire(Some("preempted")),
            RunStatus::Other("preempted".to_string())
        );
        assert_eq!(
            RunStatus::from_wire(None),
            RunStatus::Other("unknown".to_string())
        );
    }

    #[test]
    fn test_stored_run_preserves_metadata() {
        let mut metadata = Map::new();
        metadata.insert("lr".to_string(), json!(0.001));
        metadata.insert("tags".to_string(), json!(["baseline", "v2"]));

        let record = RunRecord {
            run_id: "r-1".to_string(),
            created_at: ts("2024-01-01T10:00:00Z"),
            updated_at: ts("2024-01-02T10:00:00Z"),
            status: RunStatus::Finished,
            metadata,
        };

        let stored = StoredRun::from_record(&record).unwrap();
        assert_eq!(stored.run_id, "r-1");
        assert_eq!(stored.status, "finished");

        let round_trip: Map<String, Value> = serde_json::from_str(&stored.metadata).unwrap();
        assert_eq!(round_trip.get("lr"), Some(&json!(0.001)));
        assert_eq!(round_trip.get("tags"), Some(&json!(["baseline", "v2"])));
    }

    #[test]
    fn test_csv_output_shape() {
        let dataset = CombinedDataset::new(vec![StoredRun {
            run_id: "r-1".to_string(),
            created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            updated_at: Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap(),
            status: "finished".to_string(),
            metadata: r#"{"lr":0.001}"#.to_string(),
        }]);

        let mut buf = Vec::new();
        dataset.write_csv(&mut buf).unwrap();
        let out = String::from_utf8(buf).unwrap();

        let mut lines = out.lines();
        assert_eq!(
            lines.next().unwrap(),
            "run_id,created_at,updated_at,status,metadata"
        );
        let row = lines.next().unwrap();
        assert!(row.starts_with("r-1,2024-01-01T00:00:00Z,2024-01-02T00:00:00Z,finished,"));
        // JSON cell must come back out of the CSV layer intact
        let mut reader = csv::Reader::from_reader(out.as_bytes());
        let rec = reader.records().next().unwrap().unwrap();
        assert_eq!(&rec[4], r#"{"lr":0.001}"#);
    }
}
