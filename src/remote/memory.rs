//! In-memory stand-in for the remote reconciliation service.
//!
//! Tasks follow a scripted sequence of poll observations. Submit and poll
//! failures, latency and odd status values can be injected per chunk (chunks are identified by
//! the key of their first record). Call counters make concurrency and polling
//! behavior observable from tests.

use super::{SyncService, TaskPoll};
use crate::error::SyncError;
use crate::model::{ReconciledRecord, Record, TaskId};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

type Reconciler = Box<dyn Fn(&str) -> Option<ReconciledRecord> + Send + Sync>;

struct FakeTask {
    script: VecDeque<TaskPoll>,
    last: TaskPoll,
    /// Polls still to fail before the script is consulted
    failures: Option<(usize, SyncError)>,
}

#[derive(Default)]
struct FakeState {
    next_id: usize,
    tasks: HashMap<TaskId, FakeTask>,
    chunk_scripts: HashMap<String, Vec<TaskPoll>>,
    submit_failures: HashMap<String, (usize, SyncError)>,
    poll_failures: HashMap<String, (usize, SyncError)>,
    fetch_failures: usize,
    submitted: Vec<String>,
    poll_times: Vec<Instant>,
}

/// Scriptable in-memory [`SyncService`].
pub struct InMemorySyncService {
    state: Mutex<FakeState>,
    default_script: Vec<TaskPoll>,
    submit_latency: Duration,
    poll_latency: Duration,
    reconciler: Reconciler,
    submits_in_flight: AtomicUsize,
    peak_submits: AtomicUsize,
    submit_calls: AtomicUsize,
    poll_calls: AtomicUsize,
    fetch_calls: AtomicUsize,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn poll(status: &str, progress: f64, error: Option<&str>) -> TaskPoll {
    TaskPoll {
        status: status.to_string(),
        progress,
        error: error.map(str::to_string),
    }
}

fn script(steps: &[(&str, f64)]) -> Vec<TaskPoll> {
    steps.iter().map(|(s, p)| poll(s, *p, None)).collect()
}

/// Reconciliation outcome derived from the key, so results are stable
/// across runs: roughly one key in seven is unknown to the store.
pub fn default_reconciliation(key: &str) -> Option<ReconciledRecord> {
    let sum: u32 = key.bytes().map(u32::from).sum();
    if sum % 7 == 0 {
        return None;
    }
    let matched = sum % 3 != 0;
    Some(ReconciledRecord {
        key: key.to_string(),
        matched,
        quality: matched && sum % 2 == 0,
        group: Some(format!("group-{}", sum % 4)),
        attributes: Default::default(),
    })
}

impl Default for InMemorySyncService {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemorySyncService {
    /// Tasks go pending → running 50% → completed.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState::default()),
            default_script: script(&[("pending", 0.0), ("running", 50.0), ("completed", 100.0)]),
            submit_latency: Duration::ZERO,
            poll_latency: Duration::ZERO,
            reconciler: Box::new(default_reconciliation),
            submits_in_flight: AtomicUsize::new(0),
            peak_submits: AtomicUsize::new(0),
            submit_calls: AtomicUsize::new(0),
            poll_calls: AtomicUsize::new(0),
            fetch_calls: AtomicUsize::new(0),
        }
    }

    /// Replace the poll sequence every task follows. The last step repeats.
    pub fn with_poll_script(mut self, steps: &[(&str, f64)]) -> Self {
        if !steps.is_empty() {
            self.default_script = script(steps);
        }
        self
    }

    /// Poll sequence for the chunk starting with `first_key`.
    pub fn with_chunk_script(self, first_key: &str, steps: &[(&str, f64)]) -> Self {
        self.lock().chunk_scripts.insert(first_key.to_string(), script(steps));
        self
    }

    /// The task for the chunk starting with `first_key` ends in `failed`.
    pub fn fail_task(self, first_key: &str, message: &str) -> Self {
        let steps = vec![
            poll("running", 30.0, None),
            poll("failed", 30.0, Some(message)),
        ];
        self.lock().chunk_scripts.insert(first_key.to_string(), steps);
        self
    }

    /// The next `times` submissions of the chunk starting with `first_key` fail.
    pub fn fail_submit(self, first_key: &str, times: usize, error: SyncError) -> Self {
        self.lock()
            .submit_failures
            .insert(first_key.to_string(), (times, error));
        self
    }

    /// The first `times` polls of the task for the chunk starting with
    /// `first_key` fail with `error`.
    pub fn fail_poll(self, first_key: &str, times: usize, error: SyncError) -> Self {
        self.lock()
            .poll_failures
            .insert(first_key.to_string(), (times, error));
        self
    }

    /// The next `times` fetch calls fail with a transport error.
    pub fn fail_fetch(self, times: usize) -> Self {
        self.lock().fetch_failures = times;
        self
    }

    pub fn with_submit_latency(mut self, latency: Duration) -> Self {
        self.submit_latency = latency;
        self
    }

    pub fn with_poll_latency(mut self, latency: Duration) -> Self {
        self.poll_latency = latency;
        self
    }

    pub fn with_reconciler<F>(mut self, reconciler: F) -> Self
    where
        F: Fn(&str) -> Option<ReconciledRecord> + Send + Sync + 'static,
    {
        self.reconciler = Box::new(reconciler);
        self
    }

    /// Number of `submit` calls, including failed ones.
    pub fn submit_calls(&self) -> usize {
        self.submit_calls.load(Ordering::SeqCst)
    }

    pub fn poll_calls(&self) -> usize {
        self.poll_calls.load(Ordering::SeqCst)
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    /// Highest number of `submit` calls observed in flight at once.
    pub fn peak_concurrent_submits(&self) -> usize {
        self.peak_submits.load(Ordering::SeqCst)
    }

    /// When each `poll_once` call arrived, in call order.
    pub fn poll_times(&self) -> Vec<Instant> {
        self.lock().poll_times.clone()
    }

    /// Keys of every record accepted by `submit`, in acceptance order.
    pub fn submitted_keys(&self) -> Vec<String> {
        self.lock().submitted.clone()
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl SyncService for InMemorySyncService {
    async fn submit(&self, records: &[Record]) -> Result<TaskId, SyncError> {
        self.submit_calls.fetch_add(1, Ordering::SeqCst);
        let now = self.submits_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_submits.fetch_max(now, Ordering::SeqCst);
        let _in_flight = InFlight(&self.submits_in_flight);

        if !self.submit_latency.is_zero() {
            tokio::time::sleep(self.submit_latency).await;
        }

        let first_key = records
            .first()
            .map(|r| r.key.clone())
            .ok_or_else(|| SyncError::Payload("empty chunk".into()))?;

        let mut state = self.lock();

        if let Some((remaining, error)) = state.submit_failures.get_mut(&first_key) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(error.clone());
            }
        }

        state.next_id += 1;
        let id = TaskId(format!("task-{}", state.next_id));
        let steps = state
            .chunk_scripts
            .get(&first_key)
            .cloned()
            .unwrap_or_else(|| self.default_script.clone());
        let last = steps
            .last()
            .cloned()
            .unwrap_or_else(|| poll("completed", 100.0, None));

        let failures = state.poll_failures.remove(&first_key);
        state.tasks.insert(
            id.clone(),
            FakeTask {
                script: steps.into(),
                last,
                failures,
            },
        );
        state.submitted.extend(records.iter().map(|r| r.key.clone()));

        Ok(id)
    }

    async fn poll_once(&self, task_id: &TaskId) -> Result<TaskPoll, SyncError> {
        self.poll_calls.fetch_add(1, Ordering::SeqCst);

        if !self.poll_latency.is_zero() {
            tokio::time::sleep(self.poll_latency).await;
        }

        let mut state = self.lock();
        state.poll_times.push(Instant::now());
        let task = state
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| SyncError::Rejected {
                status: 404,
                message: format!("unknown task {}", task_id),
            })?;

        if let Some((remaining, error)) = task.failures.as_mut() {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(error.clone());
            }
        }

        Ok(task.script.pop_front().unwrap_or_else(|| task.last.clone()))
    }

    async fn fetch_by_keys(&self, keys: &[String]) -> Result<Vec<ReconciledRecord>, SyncError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);

        {
            let mut state = self.lock();
            if state.fetch_failures > 0 {
                state.fetch_failures -= 1;
                return Err(SyncError::Transport("connection reset".into()));
            }
        }

        Ok(keys.iter().filter_map(|k| (self.reconciler)(k)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_default_script_progression() {
        let service = InMemorySyncService::new();
        let id = service.submit(&[Record::new("a")]).await.unwrap();

        let statuses: Vec<String> = {
            let mut out = Vec::new();
            for _ in 0..4 {
                out.push(service.poll_once(&id).await.unwrap().status);
            }
            out
        };
        assert_eq!(statuses, vec!["pending", "running", "completed", "completed"]);
        assert_eq!(service.poll_calls(), 4);
    }

    #[tokio::test]
    async fn test_submit_failure_injection() {
        let service = InMemorySyncService::new().fail_submit(
            "a",
            2,
            SyncError::Transport("down".into()),
        );

        assert!(service.submit(&[Record::new("a")]).await.is_err());
        assert!(service.submit(&[Record::new("a")]).await.is_err());
        assert!(service.submit(&[Record::new("a")]).await.is_ok());
        assert!(service.submit(&[Record::new("b")]).await.is_ok());
        assert_eq!(service.submit_calls(), 4);
        assert_eq!(service.submitted_keys(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_fail_task_reports_message() {
        let service = InMemorySyncService::new().fail_task("x", "bad rows");
        let id = service.submit(&[Record::new("x")]).await.unwrap();

        service.poll_once(&id).await.unwrap();
        let last = service.poll_once(&id).await.unwrap();
        assert_eq!(last.status, "failed");
        assert_eq!(last.error.as_deref(), Some("bad rows"));
    }

    #[tokio::test]
    async fn test_poll_failure_injection() {
        let service = InMemorySyncService::new().fail_poll(
            "a",
            2,
            SyncError::Transport("reset".into()),
        );
        let id = service.submit(&[Record::new("a")]).await.unwrap();

        assert!(service.poll_once(&id).await.is_err());
        assert!(service.poll_once(&id).await.is_err());
        // Failed polls do not consume the script
        assert_eq!(service.poll_once(&id).await.unwrap().status, "pending");
        assert_eq!(service.poll_calls(), 3);
        assert_eq!(service.poll_times().len(), 3);
    }

    #[tokio::test]
    async fn test_unknown_task_is_rejected() {
        let service = InMemorySyncService::new();
        let err = service.poll_once(&TaskId::from("nope")).await.unwrap_err();
        assert!(matches!(err, SyncError::Rejected { status: 404, .. }));
    }

    #[tokio::test]
    async fn test_fetch_uses_reconciler() {
        let service = InMemorySyncService::new().fail_fetch(1).with_reconciler(|key| {
            Some(ReconciledRecord {
                key: key.to_string(),
                matched: true,
                quality: false,
                group: None,
                attributes: Default::default(),
            })
        });

        let keys = vec!["a".to_string(), "b".to_string()];
        assert!(service.fetch_by_keys(&keys).await.is_err());
        let records = service.fetch_by_keys(&keys).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(service.fetch_calls(), 2);
    }
}
