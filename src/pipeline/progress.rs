//! Progress aggregation across chunks.
//!
//! Every chunk owns a slice of the 5-80% band proportional to its record
//! count. A dispatched chunk sits at 20% of its slice; the remote task's own
//! progress scalar fills the remaining 80%. Fetching starts at 80%, merging at
//! 90%, completion is 100%.
//!
//! The overall percentage only ever goes up: task progress that arrives out
//! of order or regresses between polls is clamped to the previous maximum.
//! Snapshots are published to the sink while the aggregator lock is held, so
//! the caller sees them one at a time and in order.

use crate::pipeline::state::RunPhase;
use serde::{Serialize, Serializer};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::watch;

const DISPATCH_START: f64 = 5.0;
const SYNC_END: f64 = 80.0;
const FETCH_START: f64 = 80.0;
const MERGE_START: f64 = 90.0;
const DISPATCHED_SHARE: f64 = 0.2;

fn serialize_eta<S>(eta: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match eta {
        Some(d) => serializer.serialize_some(&d.as_secs_f64()),
        None => serializer.serialize_none(),
    }
}

/// Caller-facing status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressStatus {
    Idle,
    Processing,
    Paused,
    Completed,
    Failed,
    Aborted,
}

impl ProgressStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ProgressStatus::Completed | ProgressStatus::Failed | ProgressStatus::Aborted
        )
    }
}

/// Snapshot of run progress. For display only.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessingProgress {
    /// Overall percentage (0-100), non-decreasing within a run
    pub percentage: f64,
    /// Chunks that reached a terminal outcome
    pub current_chunk: usize,
    pub total_chunks: usize,
    /// Records in chunks whose tasks completed
    pub processed_records: usize,
    pub total_records: usize,
    pub status: ProgressStatus,
    pub phase: RunPhase,
    #[serde(serialize_with = "serialize_eta")]
    pub eta: Option<Duration>,
}

impl ProcessingProgress {
    fn idle(total_chunks: usize, total_records: usize) -> Self {
        Self {
            percentage: 0.0,
            current_chunk: 0,
            total_chunks,
            processed_records: 0,
            total_records,
            status: ProgressStatus::Idle,
            phase: RunPhase::Idle,
            eta: None,
        }
    }
}

/// Receives progress snapshots.
pub trait ProgressSink: Send + Sync {
    fn publish(&self, progress: &ProcessingProgress);
}

impl<F> ProgressSink for F
where
    F: Fn(&ProcessingProgress) + Send + Sync,
{
    fn publish(&self, progress: &ProcessingProgress) {
        self(progress)
    }
}

/// Sink that keeps only the latest snapshot in a watch channel.
pub fn watch_sink(tx: watch::Sender<ProcessingProgress>) -> impl ProgressSink {
    move |progress: &ProcessingProgress| {
        tx.send_replace(progress.clone());
    }
}

/// Sink that logs whenever the whole-number percentage or the phase changes.
#[derive(Debug, Default)]
pub struct LogProgress {
    last: AtomicU64,
}

impl ProgressSink for LogProgress {
    fn publish(&self, progress: &ProcessingProgress) {
        // Low byte: phase, rest: whole percent
        let key = ((progress.percentage.floor() as u64) << 8) | progress.phase as u64;
        if self.last.swap(key, Ordering::Relaxed) == key && !progress.status.is_terminal() {
            return;
        }

        match progress.eta {
            Some(eta) => tracing::info!(
                "[{:.0}%] {} | chunks {}/{} | records {}/{} | ETA {:.0}s",
                progress.percentage,
                progress.phase,
                progress.current_chunk,
                progress.total_chunks,
                progress.processed_records,
                progress.total_records,
                eta.as_secs_f64()
            ),
            None => tracing::info!(
                "[{:.0}%] {} | chunks {}/{} | records {}/{}",
                progress.percentage,
                progress.phase,
                progress.current_chunk,
                progress.total_chunks,
                progress.processed_records,
                progress.total_records
            ),
        }
    }
}

struct AggregatorState {
    chunk_records: Vec<usize>,
    total_records: usize,
    /// Per-chunk progress within its slice (0-1), max observed
    chunk_local: Vec<f64>,
    chunk_done: Vec<bool>,
    paused: bool,
    current: ProcessingProgress,
}

impl AggregatorState {
    fn sync_fraction(&self) -> f64 {
        if self.total_records == 0 {
            return 0.0;
        }
        self.chunk_records
            .iter()
            .zip(&self.chunk_local)
            .map(|(&n, &local)| n as f64 * local)
            .sum::<f64>()
            / self.total_records as f64
    }
}

/// Merges per-chunk progress into one monotonic stream.
pub struct ProgressAggregator {
    state: Mutex<AggregatorState>,
    sink: Box<dyn ProgressSink>,
    started: Instant,
}

impl ProgressAggregator {
    /// Create an aggregator for chunks with the given record counts.
    pub fn new(chunk_records: Vec<usize>, sink: Box<dyn ProgressSink>) -> Self {
        let total_records = chunk_records.iter().sum();
        let chunks = chunk_records.len();
        Self {
            state: Mutex::new(AggregatorState {
                chunk_local: vec![0.0; chunks],
                chunk_done: vec![false; chunks],
                paused: false,
                current: ProcessingProgress::idle(chunks, total_records),
                chunk_records,
                total_records,
            }),
            sink,
            started: Instant::now(),
        }
    }

    /// Latest snapshot.
    pub fn snapshot(&self) -> ProcessingProgress {
        self.lock().current.clone()
    }

    /// Record a phase change. Idle and partitioning are not published.
    pub fn enter_phase(&self, phase: RunPhase) {
        let mut state = self.lock();
        if state.current.status.is_terminal() {
            return;
        }

        let (floor, status) = match phase {
            RunPhase::Idle | RunPhase::Partitioning => {
                state.current.phase = phase;
                return;
            }
            RunPhase::Dispatching => (DISPATCH_START, None),
            RunPhase::Polling => (0.0, None),
            RunPhase::Fetching => (FETCH_START, None),
            RunPhase::Merging => (MERGE_START, None),
            RunPhase::Completed => (100.0, Some(ProgressStatus::Completed)),
            RunPhase::Failed => (0.0, Some(ProgressStatus::Failed)),
            RunPhase::Aborted => (0.0, Some(ProgressStatus::Aborted)),
        };

        let status = status.unwrap_or(if state.paused {
            ProgressStatus::Paused
        } else {
            ProgressStatus::Processing
        });
        self.update(&mut state, floor, Some(phase), Some(status));
    }

    /// A chunk was accepted by the remote service.
    pub fn chunk_dispatched(&self, index: usize) {
        let mut state = self.lock();
        if let Some(local) = state.chunk_local.get_mut(index) {
            *local = local.max(DISPATCHED_SHARE);
        }
        self.update(&mut state, 0.0, None, None);
    }

    /// The remote task for a chunk reported `remote_progress` (0-100).
    pub fn task_progress(&self, index: usize, remote_progress: f64) {
        let mut state = self.lock();
        let mapped = DISPATCHED_SHARE
            + (1.0 - DISPATCHED_SHARE) * (remote_progress.clamp(0.0, 100.0) / 100.0);
        if let Some(local) = state.chunk_local.get_mut(index) {
            *local = local.max(mapped);
        }
        self.update(&mut state, 0.0, None, None);
    }

    /// A chunk reached a terminal outcome.
    pub fn chunk_finished(&self, index: usize, succeeded: bool) {
        let mut state = self.lock();
        let already = match state.chunk_done.get_mut(index) {
            Some(done) => std::mem::replace(done, true),
            None => return,
        };
        if !already {
            let records = state.chunk_records[index];
            state.chunk_local[index] = 1.0;
            state.current.current_chunk += 1;
            if succeeded {
                state.current.processed_records += records;
            }
        }
        self.update(&mut state, 0.0, None, None);
    }

    /// Reflect pause/resume in the published status.
    pub fn set_paused(&self, paused: bool) {
        let mut state = self.lock();
        state.paused = paused;
        let status = match state.current.status {
            s if s.is_terminal() || s == ProgressStatus::Idle => return,
            _ if paused => ProgressStatus::Paused,
            _ => ProgressStatus::Processing,
        };
        self.update(&mut state, 0.0, None, Some(status));
    }

    fn update(
        &self,
        state: &mut AggregatorState,
        floor: f64,
        phase: Option<RunPhase>,
        status: Option<ProgressStatus>,
    ) {
        if state.current.status.is_terminal() {
            return;
        }

        let phase = phase.unwrap_or(state.current.phase);
        let status = status.unwrap_or(state.current.status);

        let computed = match phase {
            RunPhase::Dispatching | RunPhase::Polling => {
                DISPATCH_START + (SYNC_END - DISPATCH_START) * state.sync_fraction()
            }
            _ => 0.0,
        };
        let percentage = state
            .current
            .percentage
            .max(computed)
            .max(floor)
            .min(100.0);

        let advanced = percentage > state.current.percentage + f64::EPSILON;
        let changed = status != state.current.status || phase != state.current.phase;
        if !advanced && !changed {
            return;
        }

        state.current.percentage = percentage;
        state.current.phase = phase;
        state.current.status = status;
        state.current.eta = self.estimate_remaining(percentage, status);

        self.sink.publish(&state.current);
    }

    fn estimate_remaining(&self, percentage: f64, status: ProgressStatus) -> Option<Duration> {
        if status == ProgressStatus::Completed {
            return Some(Duration::ZERO);
        }
        if status.is_terminal() {
            return None;
        }
        // Need at least one point of real progress past the dispatch anchor
        let done = percentage - DISPATCH_START;
        if done < 1.0 {
            return None;
        }
        let remaining = 100.0 - percentage;
        Some(self.started.elapsed().mul_f64(remaining / done))
    }

    fn lock(&self) -> MutexGuard<'_, AggregatorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
