use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracker_sync::runner::{DateRange, SyncOptionsBuilder, SyncOutcome, run_sync};

#[derive(Parser, Clone)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Subcommand)]
enum Command {
    Sync {
        /// Tracking service API key (overrides the config file)
        #[arg(short, long)]
        api: Option<String>,

        /// Start date for data fetch (YYYY-MM-DD)
        #[arg(short, long)]
        start_date: Option<String>,

        /// End date for data fetch (YYYY-MM-DD)
        #[arg(short, long)]
        end_date: Option<String>,

        /// Path to the YAML config file
        #[arg(short, long, default_value = "config.yaml")]
        config: PathBuf,

        /// Output CSV path (overrides the config file)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Quiet mode - minimal output, only show summary
        #[arg(short, long)]
        quiet: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match args.command {
        Command::Sync {
            api,
            start_date,
            end_date,
            config,
            output,
            quiet,
        } => {
            run_syncer(api, start_date, end_date, config, output, quiet).await?;
        }
    }
    Ok(())
}

async fn run_syncer(
    api: Option<String>,
    start_date: Option<String>,
    end_date: Option<String>,
    config_path: PathBuf,
    output: Option<PathBuf>,
    quiet: bool,
) -> anyhow::Result<()> {
    // Initialize tracing based on quiet mode
    use tracing_subscriber::{EnvFilter, FmtSubscriber};
    let filter = if quiet {
        EnvFilter::new("tracker_sync=warn,sqlx=off")
    } else {
        EnvFilter::new("tracker_sync=info,sqlx=off")
    };
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    // Validate the requested range before any I/O
    let range = DateRange::resolve(start_date.as_deref(), end_date.as_deref())?;

    let config = cli::load_config(&config_path)?;

    let api_key = api.or(config.api_key);
    if api_key.is_none() {
        tracing::warn!("Tracking service API key not provided. Some features may not work.");
    }
    if config.projects.is_empty() {
        tracing::warn!("No projects configured; the fetch will return no runs.");
    }

    let base_url = config.base_url.ok_or_else(|| {
        anyhow::anyhow!(
            "No base_url configured.\n\
             Set base_url in {} to the tracking service endpoint.",
            config_path.display()
        )
    })?;

    let output_path = output
        .or(config.output_path)
        .unwrap_or_else(|| PathBuf::from(cli::DEFAULT_OUTPUT_PATH));

    if !quiet {
        println!("Experiment Run Sync");
        println!("===================");
        println!("Service: {}", base_url);
        println!("Projects: {}", config.projects.join(", "));
        println!("Destination: {}", config.destination_target.display());
        println!("Fetching data from {} to {}", range.start, range.end);
        println!();
    }

    let options = SyncOptionsBuilder::default()
        .base_url(base_url)
        .api_key(api_key)
        .projects(config.projects)
        .cache_dir(config.cache_dir)
        .destination_target(config.destination_target)
        .blacklist_path(config.blacklist_path)
        .maintain_blacklist(config.maintain_blacklist)
        .quiet(quiet)
        .build()?;

    let outcome = run_sync(&range, options).await?;

    outcome.dataset.write_csv_file(&output_path)?;

    print_summary(&outcome);
    println!("Combined dataset written to {}", output_path.display());

    Ok(())
}

fn print_summary(outcome: &SyncOutcome) {
    println!();
    println!("Sync Summary");
    println!("============");
    println!("Job ID: {}", outcome.job_id);
    println!("Runs fetched: {}", outcome.runs_fetched);
    println!("Runs excluded (blacklist): {}", outcome.runs_excluded);
    if outcome.newly_blacklisted > 0 {
        println!("Runs newly blacklisted: {}", outcome.newly_blacklisted);
    }
    println!("Runs uploaded: {}", outcome.upload.uploaded);
    println!("Runs updated: {}", outcome.upload.updated);
    println!("Runs unchanged: {}", outcome.upload.skipped);
    println!("Runs failed: {}", outcome.upload.failed);
    println!("Combined dataset rows: {}", outcome.dataset.len());
    println!("Duration: {:.2}s", outcome.duration.as_secs_f64());

    if !outcome.upload.failures.is_empty() {
        println!();
        println!("Upload failures:");
        for failure in &outcome.upload.failures {
            println!("  {}: {}", failure.run_id, failure.error);
        }
    }
}

/// CLI utility functions for loading the process configuration
mod cli {
    use anyhow::{Context, Result};
    use serde::Deserialize;
    use std::path::{Path, PathBuf};

    pub const DEFAULT_OUTPUT_PATH: &str = "combined_runs_data.csv";

    fn default_destination_target() -> PathBuf {
        PathBuf::from("runs.db")
    }

    fn default_blacklist_path() -> PathBuf {
        PathBuf::from("blacklist.jsonl")
    }

    /// Process configuration as read from the YAML config file
    #[derive(Debug, Clone, Deserialize)]
    #[serde(deny_unknown_fields)]
    pub struct FileConfig {
        #[serde(default)]
        pub api_key: Option<String>,
        #[serde(default)]
        pub base_url: Option<String>,
        #[serde(default)]
        pub projects: Vec<String>,
        #[serde(default)]
        pub cache_dir: Option<PathBuf>,
        #[serde(default = "default_destination_target")]
        pub destination_target: PathBuf,
        #[serde(default = "default_blacklist_path")]
        pub blacklist_path: PathBuf,
        #[serde(default)]
        pub maintain_blacklist: bool,
        #[serde(default)]
        pub output_path: Option<PathBuf>,
    }

    impl Default for FileConfig {
        fn default() -> Self {
            Self {
                api_key: None,
                base_url: None,
                projects: Vec::new(),
                cache_dir: None,
                destination_target: default_destination_target(),
                blacklist_path: default_blacklist_path(),
                maintain_blacklist: false,
                output_path: None,
            }
        }
    }

    /// Load the config file; a missing file falls back to defaults.
    pub fn load_config(path: &Path) -> Result<FileConfig> {
        if !path.exists() {
            tracing::warn!(
                "Config file {} not found, using defaults",
                path.display()
            );
            return Ok(FileConfig::default());
        }

        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        serde_yaml::from_str(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_parse_full_config() {
            let yaml = "\
api_key: secret
base_url: https://tracker.example.com
projects:
  - acme/vision
  - acme/nlp
cache_dir: /tmp/tracker-sync
destination_target: /data/runs.db
blacklist_path: /data/blacklist.jsonl
maintain_blacklist: true
output_path: /data/combined.csv
";
            let config: FileConfig = serde_yaml::from_str(yaml).unwrap();
            assert_eq!(config.api_key.as_deref(), Some("secret"));
            assert_eq!(config.base_url.as_deref(), Some("https://tracker.example.com"));
            assert_eq!(config.projects.len(), 2);
            assert!(config.maintain_blacklist);
            assert_eq!(config.destination_target, PathBuf::from("/data/runs.db"));
        }

        #[test]
        fn test_minimal_config_uses_defaults() {
            let yaml = "base_url: https://tracker.example.com\n";
            let config: FileConfig = serde_yaml::from_str(yaml).unwrap();
            assert!(config.api_key.is_none());
            assert!(config.projects.is_empty());
            assert!(!config.maintain_blacklist);
            assert_eq!(config.destination_target, PathBuf::from("runs.db"));
            assert_eq!(config.blacklist_path, PathBuf::from("blacklist.jsonl"));
        }

        #[test]
        fn test_unknown_keys_are_rejected() {
            let yaml = "bse_url: typo\n";
            assert!(serde_yaml::from_str::<FileConfig>(yaml).is_err());
        }

        #[test]
        fn test_missing_file_falls_back_to_defaults() {
            let config = load_config(Path::new("/nonexistent/config.yaml")).unwrap();
            assert!(config.base_url.is_none());
        }
    }
}
