//! End-to-end run orchestration.
//!
//! A run moves through `partitioning → dispatching → polling → fetching →
//! merging → completed`. Dispatch goes through a per-run concurrency limiter
//! and retry policy; polling of accepted tasks is paced by the poll interval
//! only. A chunk that fails does not stop the others: the run finishes
//! outstanding work and then reports a partial failure listing every failed
//! chunk next to the ones that succeeded.

use crate::config::Config;
use crate::error::{ChunkFailure, PartialFailure, PipelineError, SyncError};
use crate::model::{ReconciledRecord, Record, Task, TaskStatus};
use crate::pipeline::limiter::{adaptive_concurrency, ConcurrencyLimiter};
use crate::pipeline::partition::{adaptive_chunk_size, partition, verify_coverage};
use crate::pipeline::{
    Dispatcher, Metrics, ProgressAggregator, ProgressSink, RetryPolicy, RunHandle, RunPhase,
    RunState, TaskPoller,
};
use crate::remote::SyncService;
use crate::report::MergedReport;
use futures::stream::{self, StreamExt};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::{JoinHandle, JoinSet};

/// Tuning options for one run.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Records per chunk; adaptive when `None`
    pub chunk_size: Option<usize>,
    /// Simultaneous dispatch calls; adaptive when `None`
    pub concurrency: Option<usize>,
    pub retry: RetryPolicy,
    /// Pacing sleep between starting two dispatches
    pub pause_between_chunks: Duration,
    /// Minimum time between two polls of the same task
    pub poll_interval: Duration,
    pub task_timeout: Option<Duration>,
    /// Record field holding the owning group, used when the store has none
    pub group_field: Option<String>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            chunk_size: None,
            concurrency: None,
            retry: RetryPolicy::default(),
            pause_between_chunks: Duration::from_millis(100),
            poll_interval: Duration::from_millis(2000),
            task_timeout: None,
            group_field: None,
        }
    }
}

impl From<&Config> for SyncOptions {
    fn from(config: &Config) -> Self {
        let processing = &config.processing;
        Self {
            chunk_size: processing.chunk_size,
            concurrency: processing.concurrency,
            retry: RetryPolicy {
                max_attempts: processing.retry.max_attempts,
                delay: Duration::from_millis(processing.retry.delay_ms),
                backoff: processing.retry.backoff_multiplier,
                max_delay: Duration::from_millis(processing.retry.max_delay_ms),
            },
            pause_between_chunks: Duration::from_millis(processing.pause_between_chunks_ms),
            poll_interval: Duration::from_millis(processing.poll_interval_ms),
            task_timeout: processing.task_timeout_secs.map(Duration::from_secs),
            group_field: config.input.group_field.clone(),
        }
    }
}

impl SyncOptions {
    /// Resolve adaptive settings for a dataset of `total_records`.
    pub fn plan(&self, total_records: usize) -> SyncPlan {
        let chunk_size = self
            .chunk_size
            .unwrap_or_else(|| adaptive_chunk_size(total_records))
            .max(1);
        let concurrency = self
            .concurrency
            .unwrap_or_else(|| adaptive_concurrency(total_records))
            .max(1);
        let chunks = total_records.div_ceil(chunk_size);

        // Dispatches start one pacing sleep apart; each task needs at least one poll
        let min_duration = if chunks == 0 {
            Duration::ZERO
        } else {
            let gaps = u32::try_from(chunks - 1).unwrap_or(u32::MAX);
            self.pause_between_chunks
                .saturating_mul(gaps)
                .saturating_add(self.poll_interval)
        };

        SyncPlan {
            total_records,
            chunk_size,
            chunks,
            concurrency,
            min_duration,
        }
    }
}

/// Resolved partition and concurrency plan.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncPlan {
    pub total_records: usize,
    pub chunk_size: usize,
    pub chunks: usize,
    pub concurrency: usize,
    /// Lower bound on wall-clock time imposed by pacing alone
    pub min_duration: Duration,
}

impl fmt::Display for SyncPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} records in {} chunks of up to {} | concurrency {} | at least {:.1}s",
            self.total_records,
            self.chunks,
            self.chunk_size,
            self.concurrency,
            self.min_duration.as_secs_f64()
        )
    }
}

/// Clears the active flag when a run ends, on every exit path.
struct ActiveRun(Arc<AtomicBool>);

impl Drop for ActiveRun {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn mirror_pause(handle: RunHandle, progress: Arc<ProgressAggregator>) {
    let mut paused = handle.subscribe_paused();
    let initial = *paused.borrow_and_update();
    if initial {
        progress.set_paused(true);
    }
    while paused.changed().await.is_ok() {
        let now = *paused.borrow_and_update();
        progress.set_paused(now);
    }
}

fn aborted(_: SyncError) -> PipelineError {
    PipelineError::Aborted
}

/// Runs synchronizations against one remote service, one at a time.
#[derive(Clone)]
pub struct SyncPipeline {
    service: Arc<dyn SyncService>,
    options: SyncOptions,
    metrics: Arc<Metrics>,
    active: Arc<AtomicBool>,
}

impl SyncPipeline {
    pub fn new(service: Arc<dyn SyncService>, options: SyncOptions) -> Self {
        Self {
            service,
            options,
            metrics: Metrics::new(),
            active: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Use externally owned metrics (e.g. shared with a reporter).
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    pub fn is_running(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Synchronize `records` and build the merged report.
    ///
    /// Progress snapshots go to `sink`; `handle` pauses, resumes or aborts the
    /// run. Only one run per pipeline may be active at a time.
    pub async fn run(
        &self,
        records: &[Record],
        handle: RunHandle,
        sink: Box<dyn ProgressSink>,
    ) -> Result<MergedReport, PipelineError> {
        let _active = self.begin()?;
        let mut state = RunState::new(handle.clone());

        let plan = self.options.plan(records.len());
        state.transition(RunPhase::Partitioning)?;
        tracing::info!("Plan: {}", plan);

        let chunks = partition(records, plan.chunk_size);
        verify_coverage(&chunks, records.len()).map_err(PipelineError::Invariant)?;
        state.chunks = chunks.into_iter().map(Arc::new).collect();

        let progress = Arc::new(ProgressAggregator::new(
            state.chunks.iter().map(|c| c.len()).collect(),
            sink,
        ));
        progress.enter_phase(RunPhase::Partitioning);

        if state.chunks.is_empty() {
            state.transition(RunPhase::Completed)?;
            progress.enter_phase(RunPhase::Completed);
            return Ok(MergedReport::empty());
        }

        let _pause_mirror = AbortOnDrop(tokio::spawn(mirror_pause(handle, progress.clone())));
        let limiter = ConcurrencyLimiter::new(plan.concurrency);

        let result = self.drive(&mut state, records, &limiter, &progress).await;

        let terminal = match &result {
            Ok(_) => RunPhase::Completed,
            Err(PipelineError::Aborted) => RunPhase::Aborted,
            Err(_) => RunPhase::Failed,
        };
        state.transition(terminal)?;
        progress.enter_phase(terminal);

        match &result {
            Ok(report) => tracing::info!("Run complete: {}", report),
            Err(PipelineError::Aborted) => tracing::warn!("Run aborted"),
            Err(e) => tracing::error!("Run failed: {}", e),
        }
        result
    }

    fn begin(&self) -> Result<ActiveRun, PipelineError> {
        self.active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| PipelineError::AlreadyRunning)?;
        Ok(ActiveRun(self.active.clone()))
    }

    async fn drive(
        &self,
        state: &mut RunState,
        records: &[Record],
        limiter: &ConcurrencyLimiter,
        progress: &Arc<ProgressAggregator>,
    ) -> Result<MergedReport, PipelineError> {
        enter(state, progress, RunPhase::Dispatching)?;
        self.dispatch_all(state, limiter, progress).await?;

        enter(state, progress, RunPhase::Polling)?;
        self.poll_all(state, progress).await?;

        if !state.failures.is_empty() {
            return Err(PipelineError::PartialFailure(partial_failure(state)));
        }

        enter(state, progress, RunPhase::Fetching)?;
        let reconciled = self.fetch(state, records, limiter).await?;

        enter(state, progress, RunPhase::Merging)?;
        let report = MergedReport::build(records, reconciled, self.options.group_field.as_deref());
        if report.total_records() != records.len() {
            return Err(PipelineError::Invariant(format!(
                "report holds {} records, input had {}",
                report.total_records(),
                records.len()
            )));
        }
        Ok(report)
    }

    /// Dispatch every chunk in partition order, at most `limiter.max()` at once.
    async fn dispatch_all(
        &self,
        state: &mut RunState,
        limiter: &ConcurrencyLimiter,
        progress: &Arc<ProgressAggregator>,
    ) -> Result<(), PipelineError> {
        let handle = state.handle.clone();
        let dispatcher = Dispatcher::new(
            self.service.clone(),
            self.options.retry.clone(),
            self.metrics.clone(),
        );
        let pause = self.options.pause_between_chunks;
        let mut set: JoinSet<(usize, Result<Task, SyncError>)> = JoinSet::new();
        let mut results = Vec::with_capacity(state.chunks.len());

        let outcome: Result<(), PipelineError> = async {
            for chunk in &state.chunks {
                if chunk.index > 0 && !pause.is_zero() {
                    handle.sleep(pause).await.map_err(aborted)?;
                }
                handle.wait_if_paused().await.map_err(aborted)?;

                let permit = tokio::select! {
                    _ = handle.cancelled() => return Err(PipelineError::Aborted),
                    permit = limiter.acquire() => permit.map_err(aborted)?,
                };

                let chunk = chunk.clone();
                let dispatcher = dispatcher.clone();
                let progress = progress.clone();
                let handle = handle.clone();
                set.spawn(async move {
                    let result = dispatcher.dispatch(&chunk, &handle).await;
                    drop(permit);
                    if result.is_ok() {
                        progress.chunk_dispatched(chunk.index);
                    }
                    (chunk.index, result)
                });
            }

            loop {
                let joined = tokio::select! {
                    _ = handle.cancelled() => return Err(PipelineError::Aborted),
                    joined = set.join_next() => joined,
                };
                match joined {
                    Some(Ok(result)) => results.push(result),
                    Some(Err(e)) => {
                        return Err(PipelineError::Invariant(format!("dispatch task failed: {}", e)))
                    }
                    None => return Ok(()),
                }
            }
        }
        .await;

        if let Err(e) = outcome {
            limiter.close();
            set.shutdown().await;
            return Err(e);
        }

        results.sort_by_key(|(index, _)| *index);
        for (index, result) in results {
            match result {
                Ok(task) => state.tasks.push(task),
                Err(error) => {
                    tracing::warn!("Chunk {} not dispatched: {}", index, error);
                    self.metrics.add_chunk_failed();
                    progress.chunk_finished(index, false);
                    state.failures.push(ChunkFailure {
                        chunk_index: index,
                        task_id: None,
                        keys: state.chunks[index].keys(),
                        error,
                    });
                }
            }
        }

        tracing::info!(
            "Dispatched {} of {} chunks (peak {} concurrent)",
            state.tasks.len(),
            state.chunks.len(),
            limiter.peak()
        );
        Ok(())
    }

    /// Poll every accepted task until it reaches a terminal status.
    async fn poll_all(
        &self,
        state: &mut RunState,
        progress: &Arc<ProgressAggregator>,
    ) -> Result<(), PipelineError> {
        let handle = state.handle.clone();
        let poller = TaskPoller::new(
            self.service.clone(),
            self.options.retry.clone(),
            self.options.poll_interval,
            self.options.task_timeout,
            self.metrics.clone(),
        );
        // Polls are paced by the interval only, so every task is in flight at once
        let in_flight = state.tasks.len().max(1);
        let polls = stream::iter(state.tasks.clone())
            .map(|task| {
                let poller = poller.clone();
                let handle = handle.clone();
                let progress = progress.clone();
                async move {
                    let index = task.chunk_index;
                    (index, poller.poll_to_completion(task, &handle, &progress).await)
                }
            })
            .buffer_unordered(in_flight)
            .collect::<Vec<_>>();

        // Dropping the stream on abort cancels every outstanding poll
        let mut results = tokio::select! {
            _ = handle.cancelled() => return Err(PipelineError::Aborted),
            results = polls => results,
        };
        if results
            .iter()
            .any(|(_, result)| matches!(result, Err(SyncError::Aborted)))
        {
            return Err(PipelineError::Aborted);
        }

        results.sort_by_key(|(index, _)| *index);
        for (index, result) in results {
            match result {
                Ok(done) => {
                    self.metrics.add_task_completed();
                    progress.chunk_finished(index, true);
                    if let Some(task) = state.tasks.iter_mut().find(|t| t.chunk_index == index) {
                        *task = done;
                    }
                }
                Err(error) => {
                    tracing::warn!("Chunk {} failed: {}", index, error);
                    self.metrics.add_task_failed();
                    self.metrics.add_chunk_failed();
                    progress.chunk_finished(index, false);
                    let task_id = state
                        .tasks
                        .iter()
                        .find(|t| t.chunk_index == index)
                        .map(|t| t.id.to_string());
                    state.failures.push(ChunkFailure {
                        chunk_index: index,
                        task_id,
                        keys: state.chunks[index].keys(),
                        error,
                    });
                }
            }
        }
        state.failures.sort_by_key(|f| f.chunk_index);
        Ok(())
    }

    /// Fetch reconciled records for every input key.
    async fn fetch(
        &self,
        state: &RunState,
        records: &[Record],
        limiter: &ConcurrencyLimiter,
    ) -> Result<Vec<ReconciledRecord>, PipelineError> {
        let handle = &state.handle;
        handle.wait_if_paused().await.map_err(aborted)?;

        let keys: Vec<String> = records.iter().map(|r| r.key.clone()).collect();
        let start = Instant::now();

        let result = tokio::select! {
            _ = handle.cancelled() => return Err(PipelineError::Aborted),
            result = limiter.execute(|| {
                self.options.retry.run_with_handle(
                    "Fetch of reconciled records",
                    handle,
                    || self.service.fetch_by_keys(&keys),
                    |_, _| {},
                )
            }) => result,
        };
        self.metrics.add_fetch_time(start.elapsed());

        match result {
            Ok(reconciled) => {
                self.metrics.add_records_fetched(reconciled.len() as u64);
                tracing::info!(
                    "Fetched {} reconciled records for {} keys",
                    reconciled.len(),
                    keys.len()
                );
                Ok(reconciled)
            }
            Err(SyncError::Aborted) => Err(PipelineError::Aborted),
            Err(e) => Err(PipelineError::Fetch(e)),
        }
    }
}

fn enter(
    state: &mut RunState,
    progress: &ProgressAggregator,
    phase: RunPhase,
) -> Result<(), PipelineError> {
    state.transition(phase)?;
    progress.enter_phase(phase);
    Ok(())
}

fn partial_failure(state: &RunState) -> PartialFailure {
    let succeeded: Vec<&Task> = state
        .tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Completed)
        .collect();

    PartialFailure {
        failed: state.failures.clone(),
        succeeded_chunks: succeeded.iter().map(|t| t.chunk_index).collect(),
        succeeded_keys: succeeded
            .iter()
            .flat_map(|t| state.chunks[t.chunk_index].keys())
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_adaptive() {
        let options = SyncOptions::default();

        let plan = options.plan(10_000);
        assert_eq!(plan.chunk_size, 500);
        assert_eq!(plan.chunks, 20);
        assert_eq!(plan.concurrency, 5);

        let plan = options.plan(100_000);
        assert_eq!(plan.chunk_size, 100);
        assert_eq!(plan.chunks, 1000);
        assert_eq!(plan.concurrency, 2);
    }

    #[test]
    fn test_plan_explicit_and_empty() {
        let options = SyncOptions {
            chunk_size: Some(100),
            concurrency: Some(3),
            ..Default::default()
        };
        let plan = options.plan(1_001);
        assert_eq!(plan.chunks, 11);
        assert_eq!(plan.concurrency, 3);
        assert_eq!(
            plan.min_duration,
            Duration::from_millis(100) * 10 + Duration::from_millis(2000)
        );

        let empty = options.plan(0);
        assert_eq!(empty.chunks, 0);
        assert_eq!(empty.min_duration, Duration::ZERO);
    }

    #[test]
    fn test_plan_saturates_on_huge_pause() {
        let options = SyncOptions {
            chunk_size: Some(1),
            pause_between_chunks: Duration::from_millis(u64::MAX),
            ..Default::default()
        };
        let plan = options.plan(1_000);
        assert_eq!(plan.chunks, 1_000);
        assert_eq!(plan.min_duration, Duration::MAX);
    }

    #[test]
    fn test_options_from_config() {
        let mut config = Config::with_base_url("http://localhost");
        config.processing.retry.max_attempts = 5;
        config.processing.retry.backoff_multiplier = 1.0;
        config.processing.task_timeout_secs = Some(30);
        config.input.group_field = Some("agent".into());

        let options = SyncOptions::from(&config);
        assert_eq!(options.retry.max_attempts, 5);
        assert_eq!(options.retry.backoff, 1.0);
        assert_eq!(options.task_timeout, Some(Duration::from_secs(30)));
        assert_eq!(options.group_field.as_deref(), Some("agent"));
        assert_eq!(options.poll_interval, Duration::from_millis(2000));
    }
}
