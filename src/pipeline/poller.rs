//! Task polling until a terminal status.

use crate::error::SyncError;
use crate::model::{Task, TaskStatus};
use crate::pipeline::{Metrics, ProgressAggregator, RetryPolicy, RunHandle};
use crate::remote::SyncService;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Polls one remote task at a fixed interval.
///
/// Transport errors are retried up to the retry policy's attempt budget. The
/// wait before a retried poll is the policy's delay, but never shorter than
/// the poll interval. Other errors end the poll immediately, as does an
/// unrecognized status string.
#[derive(Clone)]
pub struct TaskPoller {
    service: Arc<dyn SyncService>,
    retry: RetryPolicy,
    interval: Duration,
    timeout: Option<Duration>,
    metrics: Arc<Metrics>,
}

impl TaskPoller {
    pub fn new(
        service: Arc<dyn SyncService>,
        retry: RetryPolicy,
        interval: Duration,
        timeout: Option<Duration>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            service,
            retry,
            interval,
            timeout,
            metrics,
        }
    }

    /// Poll `task` until it completes or fails.
    ///
    /// Every request is preceded by at least one interval, so the first status
    /// check happens an interval after dispatch. While the run is paused no
    /// request is issued and the timeout clock stops; an abort ends the loop
    /// with [`SyncError::Aborted`].
    pub async fn poll_to_completion(
        &self,
        mut task: Task,
        handle: &RunHandle,
        progress: &ProgressAggregator,
    ) -> Result<Task, SyncError> {
        let started = Instant::now();
        let max_attempts = self.retry.max_attempts.max(1);
        let mut paused_for = Duration::ZERO;
        let mut failures = 0;
        let mut wait = self.interval;

        loop {
            handle.sleep(wait).await?;
            let pause_start = Instant::now();
            handle.wait_if_paused().await?;
            paused_for += pause_start.elapsed();

            if let Some(limit) = self.timeout {
                let elapsed = started.elapsed().saturating_sub(paused_for);
                if elapsed >= limit {
                    tracing::warn!("Task {} did not finish within {:?}", task.id, limit);
                    return Err(SyncError::Timeout {
                        task_id: task.id.to_string(),
                        elapsed,
                    });
                }
            }

            self.metrics.add_poll();
            let request_start = Instant::now();
            let poll = tokio::select! {
                _ = handle.cancelled() => return Err(SyncError::Aborted),
                result = self.service.poll_once(&task.id) => result,
            };
            self.metrics.add_poll_time(request_start.elapsed());

            let poll = match poll {
                Ok(poll) => {
                    failures = 0;
                    wait = self.interval;
                    poll
                }
                Err(e) if e.is_retryable() => {
                    failures += 1;
                    if failures >= max_attempts {
                        tracing::error!(
                            "Status check of task {} failed after {} attempts: {}",
                            task.id,
                            failures,
                            e
                        );
                        return Err(e);
                    }
                    wait = self.retry.delay_after(failures).max(self.interval);
                    tracing::warn!(
                        "Status check of task {} attempt {} failed: {}, retrying in {}ms",
                        task.id,
                        failures,
                        e,
                        wait.as_millis()
                    );
                    continue;
                }
                Err(e) => {
                    tracing::warn!("Status check of task {} failed: {}", task.id, e);
                    return Err(e);
                }
            };

            let status = TaskStatus::parse(&poll.status)?;
            if task.observe(status, poll.progress, poll.error) {
                tracing::debug!(
                    "Task {} (chunk {}): {:?} {:.0}%",
                    task.id,
                    task.chunk_index,
                    task.status,
                    task.progress
                );
            }
            progress.task_progress(task.chunk_index, task.progress);

            match task.status {
                TaskStatus::Completed => return Ok(task),
                TaskStatus::Failed => {
                    let message = task
                        .error
                        .clone()
                        .unwrap_or_else(|| "remote task failed".to_string());
                    return Err(SyncError::TaskFailed {
                        task_id: task.id.to_string(),
                        message,
                    });
                }
                TaskStatus::Pending | TaskStatus::Running => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Record, TaskId};
    use crate::remote::InMemorySyncService;
    use std::sync::atomic::Ordering;

    fn quiet_aggregator() -> ProgressAggregator {
        ProgressAggregator::new(vec![1], Box::new(|_: &crate::pipeline::ProcessingProgress| {}))
    }

    fn poller(
        service: Arc<InMemorySyncService>,
        timeout: Option<Duration>,
    ) -> (TaskPoller, Arc<Metrics>) {
        paced_poller(service, Duration::from_millis(1), timeout)
    }

    fn paced_poller(
        service: Arc<InMemorySyncService>,
        interval: Duration,
        timeout: Option<Duration>,
    ) -> (TaskPoller, Arc<Metrics>) {
        let metrics = Metrics::new();
        let poller = TaskPoller::new(
            service,
            RetryPolicy::fixed(3, Duration::from_millis(1)),
            interval,
            timeout,
            metrics.clone(),
        );
        (poller, metrics)
    }

    async fn submit(service: &InMemorySyncService, key: &str) -> Task {
        let id = service.submit(&[Record::new(key)]).await.unwrap();
        Task::new(id, 0)
    }

    #[tokio::test]
    async fn test_polls_until_completed() {
        let service = Arc::new(InMemorySyncService::new());
        let task = submit(&service, "a").await;
        let (poller, metrics) = poller(service.clone(), None);

        let done = poller
            .poll_to_completion(task, &RunHandle::new(), &quiet_aggregator())
            .await
            .unwrap();

        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.progress, 100.0);
        assert_eq!(service.poll_calls(), 3);
        assert_eq!(metrics.polls_issued.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn test_failed_task_carries_remote_message() {
        let service = Arc::new(InMemorySyncService::new().fail_task("a", "duplicate serials"));
        let task = submit(&service, "a").await;
        let (poller, _) = poller(service, None);

        let err = poller
            .poll_to_completion(task, &RunHandle::new(), &quiet_aggregator())
            .await
            .unwrap_err();

        match err {
            SyncError::TaskFailed { message, .. } => assert_eq!(message, "duplicate serials"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_status_is_protocol_error() {
        let service = Arc::new(InMemorySyncService::new().with_poll_script(&[("queued", 0.0)]));
        let task = submit(&service, "a").await;
        let (poller, _) = poller(service.clone(), None);

        let err = poller
            .poll_to_completion(task, &RunHandle::new(), &quiet_aggregator())
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::Protocol(_)));
        assert_eq!(service.poll_calls(), 1);
    }

    #[tokio::test]
    async fn test_timeout() {
        let service = Arc::new(InMemorySyncService::new().with_poll_script(&[("running", 10.0)]));
        let task = submit(&service, "a").await;
        let (poller, _) = poller(service, Some(Duration::from_millis(20)));

        let err = poller
            .poll_to_completion(task, &RunHandle::new(), &quiet_aggregator())
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_abort_stops_polling() {
        let service = Arc::new(InMemorySyncService::new().with_poll_script(&[("running", 10.0)]));
        let task = submit(&service, "a").await;
        let (poller, _) = poller(service.clone(), None);
        let handle = RunHandle::new();

        let aborter = {
            let handle = handle.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                handle.abort();
            })
        };

        let err = poller
            .poll_to_completion(task, &handle, &quiet_aggregator())
            .await
            .unwrap_err();
        aborter.await.unwrap();
        assert_eq!(err, SyncError::Aborted);

        let calls = service.poll_calls();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(service.poll_calls(), calls);
    }

    #[tokio::test]
    async fn test_unknown_task_is_not_retried() {
        let service = Arc::new(InMemorySyncService::new());
        let (poller, _) = poller(service.clone(), None);

        let err = poller
            .poll_to_completion(
                Task::new(TaskId::from("missing"), 0),
                &RunHandle::new(),
                &quiet_aggregator(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::Rejected { status: 404, .. }));
        assert_eq!(service.poll_calls(), 1);
    }

    #[tokio::test]
    async fn test_transport_errors_retried_at_poll_interval() {
        let service = Arc::new(InMemorySyncService::new().fail_poll(
            "a",
            2,
            SyncError::Transport("reset".into()),
        ));
        let task = submit(&service, "a").await;
        let interval = Duration::from_millis(20);
        let (poller, metrics) = paced_poller(service.clone(), interval, None);

        let done = poller
            .poll_to_completion(task, &RunHandle::new(), &quiet_aggregator())
            .await
            .unwrap();

        assert_eq!(done.status, TaskStatus::Completed);
        // Two failed polls, then the three scripted observations
        assert_eq!(service.poll_calls(), 5);
        assert_eq!(metrics.polls_issued.load(Ordering::Relaxed), 5);

        // Retry delay is 1ms; the interval still governs
        let times = service.poll_times();
        for pair in times.windows(2) {
            assert!(pair[1] - pair[0] >= interval, "gap {:?}", pair[1] - pair[0]);
        }
    }

    #[tokio::test]
    async fn test_transport_errors_exhaust_attempts() {
        let service = Arc::new(InMemorySyncService::new().fail_poll(
            "a",
            3,
            SyncError::Transport("reset".into()),
        ));
        let task = submit(&service, "a").await;
        let (poller, _) = poller(service.clone(), None);

        let err = poller
            .poll_to_completion(task, &RunHandle::new(), &quiet_aggregator())
            .await
            .unwrap_err();

        assert_eq!(err, SyncError::Transport("reset".into()));
        assert_eq!(service.poll_calls(), 3);
    }

    #[tokio::test]
    async fn test_paused_time_does_not_count_toward_timeout() {
        let service = Arc::new(InMemorySyncService::new());
        let task = submit(&service, "a").await;
        let (poller, _) = paced_poller(
            service.clone(),
            Duration::from_millis(5),
            Some(Duration::from_millis(50)),
        );
        let handle = RunHandle::new();
        handle.pause();

        let resumer = {
            let handle = handle.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(120)).await;
                handle.resume();
            })
        };

        let done = poller
            .poll_to_completion(task, &handle, &quiet_aggregator())
            .await
            .unwrap();
        resumer.await.unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
    }
}
