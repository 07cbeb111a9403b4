//! Report Sync CLI
//!
//! Reconcile a record file against the remote store and write a grouped report.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use report_sync::{build_runtime, io, run_sync, Config, SyncOptions};

#[derive(Parser)]
#[command(name = "report-sync")]
#[command(
    about = "Synchronize bulk record uploads against a remote reconciliation store",
    long_about = None
)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml", global = true)]
    config: PathBuf,

    /// Input record file (.json or .csv)
    #[arg(short, long, global = true)]
    input: Option<PathBuf>,

    /// Override concurrency level
    #[arg(long, global = true)]
    concurrency: Option<usize>,

    /// Override chunk size
    #[arg(long, global = true)]
    chunk_size: Option<usize>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the synchronization (default if no command specified)
    Run,

    /// Show the partition plan without contacting the remote service
    Plan,

    /// Validate configuration
    Validate,

    /// Generate a sample configuration file
    GenerateConfig {
        /// Output path for configuration file
        #[arg(short, long, default_value = "config.yaml")]
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        None | Some(Commands::Run) => {
            let config = load_config(&cli.config, cli.concurrency, cli.chunk_size)?;
            run_command(config, cli.input)?;
        }

        Some(Commands::Plan) => {
            let config = load_config(&cli.config, cli.concurrency, cli.chunk_size)?;
            plan_command(&config, cli.input)?;
        }

        Some(Commands::Validate) => {
            validate_command(cli.config)?;
        }

        Some(Commands::GenerateConfig { output }) => {
            generate_config_command(output)?;
        }
    }

    Ok(())
}

fn load_config(
    path: &PathBuf,
    concurrency: Option<usize>,
    chunk_size: Option<usize>,
) -> Result<Config> {
    let mut config = Config::from_file(path)
        .with_context(|| format!("Failed to load config from {}", path.display()))?;

    // Apply overrides
    if let Some(c) = concurrency {
        config.processing.concurrency = Some(c);
    }
    if let Some(c) = chunk_size {
        config.processing.chunk_size = Some(c);
    }

    config.validate()?;
    Ok(config)
}

fn require_input(input: Option<PathBuf>) -> Result<PathBuf> {
    input.ok_or_else(|| anyhow::anyhow!("--input <FILE> is required"))
}

fn run_command(config: Config, input: Option<PathBuf>) -> Result<()> {
    let input = require_input(input)?;

    let runtime = build_runtime(config.processing.worker_threads)?;
    let report = runtime.block_on(async { run_sync(config, &input).await })?;

    println!("\n=== Report ===");
    for group in report.groups.values() {
        println!("{:<24} {}", group.group, group.counts);
    }
    println!("{:<24} {}", "TOTAL", report.totals);

    Ok(())
}

fn plan_command(config: &Config, input: Option<PathBuf>) -> Result<()> {
    let input = require_input(input)?;
    let records = io::read_records(&input, &config.input.key_field)?;
    let options = SyncOptions::from(config);
    let plan = options.plan(records.len());

    println!("\n=== Sync Plan ===");
    println!("Records: {}", plan.total_records);
    println!("Chunk size: {}", plan.chunk_size);
    println!("Chunks: {}", plan.chunks);
    println!("Dispatch concurrency: {}", plan.concurrency);
    println!(
        "Retry: {} attempts, {}ms initial delay, x{} backoff",
        options.retry.max_attempts,
        options.retry.delay.as_millis(),
        options.retry.backoff
    );
    println!("Poll interval: {}ms", options.poll_interval.as_millis());
    println!("Minimum duration from pacing: {:.1}s", plan.min_duration.as_secs_f64());
    println!("=================\n");

    Ok(())
}

fn validate_command(config_path: PathBuf) -> Result<()> {
    let config = Config::from_file(&config_path)?;
    config.validate()?;
    println!("Configuration is valid");
    Ok(())
}

const SAMPLE_CONFIG: &str = r#"# Report Sync Configuration

# === REMOTE: Reconciliation service ===
remote:
  # Base URL of the reconciliation API
  base_url: "http://localhost:8080/api"

  # Per-request timeout in seconds
  request_timeout_secs: 30

  # Bearer token sent with every request
  # api_token: "changeme"

# === INPUT: Record file layout ===
input:
  # Column holding each record's unique key
  key_field: "serial"

  # Column holding the owning group, used when the store returns none
  # group_field: "agent"

# === PROCESSING: Throughput and pacing ===
processing:
  # Records per chunk (omit for adaptive: 1000 / 500 / 250 / 100 by dataset size)
  # chunk_size: 500

  # Simultaneous dispatch calls (omit for adaptive: 5 / 3 / 2 by dataset size)
  # concurrency: 3

  # Retry configuration for transient remote failures
  retry:
    max_attempts: 3
    delay_ms: 1000
    backoff_multiplier: 2.0
    max_delay_ms: 10000

  # Pacing sleep between starting two dispatches
  pause_between_chunks_ms: 100

  # Minimum time between two status polls of the same task
  poll_interval_ms: 2000

  # Give up on a task after this many seconds of polling
  # task_timeout_secs: 600

  # Tokio async worker threads (null = num CPUs)
  # worker_threads: 4

  # Print throughput metrics during the run
  enable_metrics: true

  # Metrics reporting interval in seconds
  metrics_interval_secs: 10

  # metrics_output_path: "metrics.json"

# === OUTPUT ===
output:
  # Merged report (.json or .csv); omit to only print the summary
  report_path: "report.csv"
"#;

fn generate_config_command(output: PathBuf) -> Result<()> {
    std::fs::write(&output, SAMPLE_CONFIG)?;
    println!("Generated sample configuration at: {}", output.display());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_default() {
        // No subcommand - should default to Run
        let cli = Cli::try_parse_from(["report-sync"]);
        assert!(cli.is_ok());
        assert!(cli.unwrap().command.is_none());
    }

    #[test]
    fn test_cli_parse_with_config() {
        let cli =
            Cli::try_parse_from(["report-sync", "-c", "other.yaml", "-i", "sales.csv"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("other.yaml"));
        assert_eq!(cli.input, Some(PathBuf::from("sales.csv")));
    }

    #[test]
    fn test_cli_parse_validate() {
        let cli = Cli::try_parse_from(["report-sync", "validate", "-c", "test.json"]);
        assert!(cli.is_ok());
    }

    #[test]
    fn test_cli_parse_plan_with_overrides() {
        let cli = Cli::try_parse_from([
            "report-sync",
            "plan",
            "--input",
            "sales.json",
            "--chunk-size",
            "100",
            "--concurrency",
            "3",
        ])
        .unwrap();
        assert!(matches!(cli.command, Some(Commands::Plan)));
        assert_eq!(cli.chunk_size, Some(100));
        assert_eq!(cli.concurrency, Some(3));
    }

    #[test]
    fn test_sample_config_is_valid() {
        let config = Config::from_yaml(SAMPLE_CONFIG).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.output.report_path.as_deref(), Some("report.csv"));
    }

    #[test]
    fn test_overrides_applied_before_validation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, SAMPLE_CONFIG).unwrap();

        let config = load_config(&path, Some(7), Some(250)).unwrap();
        assert_eq!(config.processing.concurrency, Some(7));
        assert_eq!(config.processing.chunk_size, Some(250));

        assert!(load_config(&path, Some(0), None).is_err());
    }
}
