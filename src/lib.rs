//! Report Sync Pipeline
//!
//! Reconciles large uploaded record sets against a remote authoritative store
//! without overwhelming it, and produces a report grouped by owning entity.
//!
//! # Architecture
//!
//! The pipeline consists of:
//!
//! - **Partitioning**: adaptive chunking of the ordered input
//! - **Dispatch**: bounded-concurrency chunk submission with retry
//! - **Polling**: paced status polling of every accepted task
//! - **Progress**: one monotonic percentage with ETA across all chunks
//! - **Report**: key-based merge of the reconciled records into groups
//!
//! Runs can be paused, resumed and aborted through a [`RunHandle`].
//!
//! # Usage
//!
//! ```no_run
//! use report_sync::{run_sync, Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_file(&"config.yaml".into())?;
//!     let report = run_sync(config, "sales.csv".as_ref()).await?;
//!     println!("{}", report);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod io;
pub mod model;
pub mod pipeline;
pub mod remote;
pub mod report;

pub use config::Config;
pub use error::{ChunkFailure, PartialFailure, PipelineError, SyncError};
pub use model::{Chunk, ReconciledRecord, Record, Task, TaskId, TaskStatus};
pub use pipeline::{
    LogProgress, Metrics, ProcessingProgress, ProgressSink, ProgressStatus, RunHandle, RunPhase,
    SyncOptions, SyncPipeline,
};
pub use remote::{HttpSyncService, InMemorySyncService, SyncService};
pub use report::MergedReport;

use anyhow::Result;
use pipeline::MetricsReporter;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Read records from `input`, synchronize them against the configured remote
/// service and write the merged report.
///
/// Ctrl-C aborts the run.
pub async fn run_sync(config: Config, input: &Path) -> Result<MergedReport> {
    config.validate()?;

    tracing::info!("Starting report synchronization");
    let records = io::read_records(input, &config.input.key_field)?;

    let service: Arc<dyn SyncService> = Arc::new(HttpSyncService::new(&config.remote)?);
    let options = SyncOptions::from(&config);
    let plan = options.plan(records.len());
    tracing::info!("Work estimate: {}", plan);

    let metrics = Metrics::new();
    let pipeline = SyncPipeline::new(service, options).with_metrics(metrics.clone());

    // Start metrics reporter
    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
    let reporter_handle = if config.processing.enable_metrics {
        let reporter = MetricsReporter::new(
            metrics.clone(),
            config.processing.metrics_interval_secs,
            plan.chunks as u64,
        );
        Some(tokio::spawn(reporter.run(shutdown_rx)))
    } else {
        None
    };

    let handle = RunHandle::new();
    let interrupt = {
        let handle = handle.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupt received, aborting run");
                handle.abort();
            }
        })
    };

    let result = pipeline
        .run(&records, handle, Box::new(LogProgress::default()))
        .await;
    interrupt.abort();

    // Stop reporter
    if let Some(handle) = reporter_handle {
        let _ = shutdown_tx.send(()).await;
        let _ = handle.await;
    }

    if config.processing.enable_metrics {
        MetricsReporter::new(metrics.clone(), 1, plan.chunks as u64).print_summary();
    }
    if let Some(path) = &config.processing.metrics_output_path {
        metrics.snapshot().save_to_file(path)?;
    }

    let report = match result {
        Ok(report) => report,
        Err(PipelineError::PartialFailure(failure)) => {
            for failed in &failure.failed {
                tracing::error!("Failed {}", failed);
            }
            tracing::error!(
                "{} records in failed chunks can be resubmitted; {} records succeeded",
                failure.failed_keys().len(),
                failure.succeeded_keys.len()
            );
            return Err(PipelineError::PartialFailure(failure).into());
        }
        Err(e) => return Err(e.into()),
    };

    for group in report.groups.values() {
        tracing::info!("Group {}: {}", group.group, group.counts);
    }
    tracing::info!("Total: {}", report.totals);

    if let Some(path) = &config.output.report_path {
        io::write_report(Path::new(path), &report, &config.input.key_field)?;
    }

    Ok(report)
}

/// Build a Tokio runtime with the specified configuration.
pub fn build_runtime(worker_threads: Option<usize>) -> Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();

    if let Some(threads) = worker_threads {
        builder.worker_threads(threads);
    }

    builder.enable_all();

    Ok(builder.build()?)
}
