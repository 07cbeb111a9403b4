//! Error types for the synchronization pipeline.
//!
//! `SyncError` describes one unit of remote work going wrong (a dispatch, a
//! poll, the final fetch). `PipelineError` describes how a whole run ended.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Failure of a single remote operation.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SyncError {
    /// Network or transport failure. Safe to retry.
    #[error("transport error: {0}")]
    Transport(String),

    /// Payload was malformed or too large for the remote service.
    #[error("payload rejected: {0}")]
    Payload(String),

    /// The remote service refused the request.
    #[error("request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// The remote answered with something this pipeline does not understand.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The remote task finished in the failed state.
    #[error("task {task_id} failed: {message}")]
    TaskFailed { task_id: String, message: String },

    /// The task did not reach a terminal state within the configured limit.
    #[error("task {task_id} timed out after {:.1}s", elapsed.as_secs_f64())]
    Timeout { task_id: String, elapsed: Duration },

    /// The run was aborted through its handle.
    #[error("aborted")]
    Aborted,
}

impl SyncError {
    /// Only transport errors are retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Transport(_))
    }
}

/// A chunk that did not make it through dispatch or polling.
#[derive(Debug, Clone)]
pub struct ChunkFailure {
    /// Index of the chunk in partition order.
    pub chunk_index: usize,
    /// Remote task id, if the chunk was dispatched before failing.
    pub task_id: Option<String>,
    /// Keys of the records in the chunk, for resubmission.
    pub keys: Vec<String>,
    pub error: SyncError,
}

impl fmt::Display for ChunkFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.task_id {
            Some(task_id) => write!(
                f,
                "chunk {} (task {}, {} records): {}",
                self.chunk_index,
                task_id,
                self.keys.len(),
                self.error
            ),
            None => write!(
                f,
                "chunk {} ({} records): {}",
                self.chunk_index,
                self.keys.len(),
                self.error
            ),
        }
    }
}

/// Outcome of a run where some chunks failed while others succeeded.
#[derive(Debug, Clone, Default)]
pub struct PartialFailure {
    pub failed: Vec<ChunkFailure>,
    /// Chunk indices whose tasks completed.
    pub succeeded_chunks: Vec<usize>,
    /// Record keys covered by the completed chunks.
    pub succeeded_keys: Vec<String>,
}

impl PartialFailure {
    /// Keys of every record in a failed chunk.
    pub fn failed_keys(&self) -> Vec<String> {
        self.failed
            .iter()
            .flat_map(|f| f.keys.iter().cloned())
            .collect()
    }
}

impl fmt::Display for PartialFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} of {} chunks failed",
            self.failed.len(),
            self.failed.len() + self.succeeded_chunks.len()
        )?;
        for failure in &self.failed {
            write!(f, "; {}", failure)?;
        }
        Ok(())
    }
}

/// Terminal error of a pipeline run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("a synchronization run is already active")]
    AlreadyRunning,

    #[error("run aborted")]
    Aborted,

    #[error("run failed: {0}")]
    PartialFailure(PartialFailure),

    #[error("fetching reconciled records failed: {0}")]
    Fetch(SyncError),

    /// Internal consistency check failed. Never retried.
    #[error("invariant violated: {0}")]
    Invariant(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transport_is_retryable() {
        assert!(SyncError::Transport("reset".into()).is_retryable());
        assert!(!SyncError::Payload("too big".into()).is_retryable());
        assert!(!SyncError::Rejected { status: 403, message: "no".into() }.is_retryable());
        assert!(!SyncError::Protocol("bad status".into()).is_retryable());
        assert!(!SyncError::Aborted.is_retryable());
    }

    #[test]
    fn test_partial_failure_display_and_keys() {
        let failure = PartialFailure {
            failed: vec![ChunkFailure {
                chunk_index: 3,
                task_id: Some("t-3".into()),
                keys: vec!["a".into(), "b".into()],
                error: SyncError::TaskFailed {
                    task_id: "t-3".into(),
                    message: "boom".into(),
                },
            }],
            succeeded_chunks: vec![0, 1, 2],
            succeeded_keys: vec!["c".into()],
        };

        let display = failure.to_string();
        assert!(display.contains("1 of 4 chunks failed"));
        assert!(display.contains("chunk 3"));
        assert!(display.contains("boom"));
        assert_eq!(failure.failed_keys(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_timeout_display() {
        let err = SyncError::Timeout {
            task_id: "t-1".into(),
            elapsed: Duration::from_millis(1500),
        };
        assert_eq!(err.to_string(), "task t-1 timed out after 1.5s");
    }
}
