//! Run counters and periodic metrics reporting.

use serde::{Serialize, Serializer};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::interval;

fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Metrics for a synchronization run.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Chunks accepted by the remote service
    pub chunks_dispatched: AtomicU64,

    /// Chunks that failed dispatch or whose task failed (includes `tasks_failed`)
    pub chunks_failed: AtomicU64,

    /// Dispatch attempts that were retried
    pub dispatch_retries: AtomicU64,

    /// Status requests sent while polling
    pub polls_issued: AtomicU64,

    pub tasks_completed: AtomicU64,
    pub tasks_failed: AtomicU64,

    /// Records sent in accepted chunks
    pub records_submitted: AtomicU64,

    /// Reconciled records returned by the fetch
    pub records_fetched: AtomicU64,

    start_time: Option<Instant>,

    // Time spent in remote calls (microseconds, summed across tasks)
    pub dispatch_us: AtomicU64,
    pub poll_us: AtomicU64,
    pub fetch_us: AtomicU64,
}

impl Metrics {
    /// Create new metrics.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        })
    }

    /// Record an accepted chunk and its record count.
    pub fn add_chunk_dispatched(&self, records: u64) {
        self.chunks_dispatched.fetch_add(1, Ordering::Relaxed);
        self.records_submitted.fetch_add(records, Ordering::Relaxed);
    }

    pub fn add_chunk_failed(&self) {
        self.chunks_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_dispatch_retry(&self) {
        self.dispatch_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_poll(&self) {
        self.polls_issued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_task_completed(&self) {
        self.tasks_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_task_failed(&self) {
        self.tasks_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_records_fetched(&self, count: u64) {
        self.records_fetched.fetch_add(count, Ordering::Relaxed);
    }

    /// Record time spent dispatching (in microseconds).
    pub fn add_dispatch_time(&self, duration: Duration) {
        self.dispatch_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// Record time spent in status requests (in microseconds).
    pub fn add_poll_time(&self, duration: Duration) {
        self.poll_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// Record time spent fetching reconciled records (in microseconds).
    pub fn add_fetch_time(&self, duration: Duration) {
        self.fetch_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// Get elapsed time since start.
    pub fn elapsed(&self) -> Duration {
        self.start_time.map_or(Duration::ZERO, |t| t.elapsed())
    }

    /// Records per second across accepted chunks.
    pub fn records_per_second(&self) -> f64 {
        let records = self.records_submitted.load(Ordering::Relaxed);
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            records as f64 / elapsed
        } else {
            0.0
        }
    }

    /// Get a snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let micros = |v: &AtomicU64| v.load(Ordering::Relaxed) as f64 / 1_000_000.0;

        MetricsSnapshot {
            chunks_dispatched: self.chunks_dispatched.load(Ordering::Relaxed),
            chunks_failed: self.chunks_failed.load(Ordering::Relaxed),
            dispatch_retries: self.dispatch_retries.load(Ordering::Relaxed),
            polls_issued: self.polls_issued.load(Ordering::Relaxed),
            tasks_completed: self.tasks_completed.load(Ordering::Relaxed),
            tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
            records_submitted: self.records_submitted.load(Ordering::Relaxed),
            records_fetched: self.records_fetched.load(Ordering::Relaxed),
            elapsed: self.elapsed(),
            records_per_second: self.records_per_second(),
            dispatch_secs: micros(&self.dispatch_us),
            poll_secs: micros(&self.poll_us),
            fetch_secs: micros(&self.fetch_us),
        }
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub chunks_dispatched: u64,
    pub chunks_failed: u64,
    pub dispatch_retries: u64,
    pub polls_issued: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub records_submitted: u64,
    pub records_fetched: u64,
    #[serde(serialize_with = "serialize_duration")]
    pub elapsed: Duration,
    pub records_per_second: f64,
    /// Time in dispatch calls (seconds, summed across tasks)
    pub dispatch_secs: f64,
    /// Time in status requests (seconds, summed across tasks)
    pub poll_secs: f64,
    pub fetch_secs: f64,
}

impl MetricsSnapshot {
    /// Save metrics to a JSON file.
    pub fn save_to_file(&self, path: &str) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        tracing::info!("Metrics saved to {}", path);
        Ok(())
    }
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let remote_time = self.dispatch_secs + self.poll_secs + self.fetch_secs;
        let (dispatch_pct, poll_pct, fetch_pct) = if remote_time > 0.0 {
            (
                self.dispatch_secs / remote_time * 100.0,
                self.poll_secs / remote_time * 100.0,
                self.fetch_secs / remote_time * 100.0,
            )
        } else {
            (0.0, 0.0, 0.0)
        };

        write!(
            f,
            "Chunks: {} dispatched, {} failed ({} retries) | \
             Tasks: {} completed, {} failed | Polls: {} | \
             Records: {} sent, {} fetched @ {:.1}/s | Elapsed: {:.1}s | \
             Time: dispatch {:.0}% poll {:.0}% fetch {:.0}%",
            self.chunks_dispatched,
            self.chunks_failed,
            self.dispatch_retries,
            self.tasks_completed,
            self.tasks_failed,
            self.polls_issued,
            self.records_submitted,
            self.records_fetched,
            self.records_per_second,
            self.elapsed.as_secs_f64(),
            dispatch_pct,
            poll_pct,
            fetch_pct,
        )
    }
}

/// Periodic metrics reporter.
pub struct MetricsReporter {
    metrics: Arc<Metrics>,
    interval_secs: u64,
    total_chunks: u64,
}

impl MetricsReporter {
    /// Create a new metrics reporter.
    pub fn new(metrics: Arc<Metrics>, interval_secs: u64, total_chunks: u64) -> Self {
        Self {
            metrics,
            interval_secs: interval_secs.max(1),
            total_chunks,
        }
    }

    /// Start the periodic reporter.
    pub async fn run(self, mut shutdown: mpsc::Receiver<()>) {
        let mut ticker = interval(Duration::from_secs(self.interval_secs));

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let snapshot = self.metrics.snapshot();
                    tracing::info!(
                        "[{:.1}% tasks settled] {}",
                        self.settled_percent(&snapshot),
                        snapshot
                    );
                }
                _ = shutdown.recv() => {
                    let snapshot = self.metrics.snapshot();
                    tracing::info!("Final: {}", snapshot);
                    break;
                }
            }
        }
    }

    fn settled_percent(&self, snapshot: &MetricsSnapshot) -> f64 {
        if self.total_chunks > 0 {
            (snapshot.tasks_completed + snapshot.chunks_failed) as f64
                / self.total_chunks as f64
                * 100.0
        } else {
            0.0
        }
    }

    /// Print a final summary.
    pub fn print_summary(&self) {
        let snapshot = self.metrics.snapshot();

        println!("\n=== Sync Summary ===");
        println!("Total time: {:.1}s", snapshot.elapsed.as_secs_f64());
        println!("Chunks dispatched: {}", snapshot.chunks_dispatched);
        println!("Chunks failed: {}", snapshot.chunks_failed);
        println!("Dispatch retries: {}", snapshot.dispatch_retries);
        println!("Tasks completed: {}", snapshot.tasks_completed);
        println!("Tasks failed: {}", snapshot.tasks_failed);
        println!("Status polls: {}", snapshot.polls_issued);
        println!("Records sent: {}", snapshot.records_submitted);
        println!("Records fetched: {}", snapshot.records_fetched);
        println!("Rate: {:.1} records/s", snapshot.records_per_second);

        let remote_time = snapshot.dispatch_secs + snapshot.poll_secs + snapshot.fetch_secs;
        if remote_time > 0.0 {
            println!("\n--- Remote Time Breakdown ---");
            let share = |secs: f64| secs / remote_time * 100.0;
            println!(
                "Dispatch: {:>7.1}s ({:>5.1}%)",
                snapshot.dispatch_secs,
                share(snapshot.dispatch_secs)
            );
            println!(
                "Poll:     {:>7.1}s ({:>5.1}%)",
                snapshot.poll_secs,
                share(snapshot.poll_secs)
            );
            println!(
                "Fetch:    {:>7.1}s ({:>5.1}%)",
                snapshot.fetch_secs,
                share(snapshot.fetch_secs)
            );
        }
        println!("====================\n");
    }
}
