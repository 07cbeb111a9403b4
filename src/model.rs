//! Core data types shared by the pipeline stages.

use crate::error::SyncError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// One business entity to reconcile, identified by its unique serial key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Unique serial key
    pub key: String,

    /// Remaining columns as read from the input source
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Record {
    /// Create a record with no extra fields.
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            fields: Map::new(),
        }
    }

    /// Add a field, builder style.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }
}

/// A contiguous slice of the input tagged with its position in the run.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk<T = Record> {
    /// Position in partition order (0-based)
    pub index: usize,
    /// Number of chunks in the run
    pub total: usize,
    pub records: Vec<T>,
}

impl<T> Chunk<T> {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Chunk<Record> {
    /// Keys of the records in this chunk, in order.
    pub fn keys(&self) -> Vec<String> {
        self.records.iter().map(|r| r.key.clone()).collect()
    }
}

/// Opaque identifier assigned by the remote service to an accepted chunk.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        TaskId(s.to_string())
    }
}

/// Remote task status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    /// Parse a status string reported by the remote service.
    ///
    /// Anything outside the four known states is a protocol error.
    pub fn parse(raw: &str) -> Result<Self, SyncError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(SyncError::Protocol(format!(
                "unrecognized task status '{}'",
                other
            ))),
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    fn rank(self) -> u8 {
        match self {
            TaskStatus::Pending => 0,
            TaskStatus::Running => 1,
            TaskStatus::Completed | TaskStatus::Failed => 2,
        }
    }
}

/// Handle for one in-flight remote reconciliation of a chunk.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub chunk_index: usize,
    pub status: TaskStatus,
    /// Highest progress reported so far (0-100)
    pub progress: f64,
    pub error: Option<String>,
}

impl Task {
    /// A freshly dispatched task.
    pub fn new(id: TaskId, chunk_index: usize) -> Self {
        Self {
            id,
            chunk_index,
            status: TaskStatus::Pending,
            progress: 0.0,
            error: None,
        }
    }

    /// Apply one poll observation.
    ///
    /// Status only moves forward: a regression (e.g. running back to pending)
    /// is ignored, and terminal tasks never change again. Progress is clamped
    /// to 0-100 and never decreases. Returns true if anything changed.
    pub fn observe(&mut self, status: TaskStatus, progress: f64, error: Option<String>) -> bool {
        if self.status.is_terminal() {
            return false;
        }

        let mut changed = false;
        if status.rank() > self.status.rank() {
            self.status = status;
            changed = true;
        } else if status != self.status {
            tracing::debug!(
                "Task {} reported {:?} after {:?}, keeping current status",
                self.id,
                status,
                self.status
            );
        }

        let progress = if self.status == TaskStatus::Completed {
            100.0
        } else {
            progress.clamp(0.0, 100.0)
        };
        if progress > self.progress {
            self.progress = progress;
            changed = true;
        }

        if self.status == TaskStatus::Failed {
            self.error = Some(error.unwrap_or_else(|| "remote task failed".to_string()));
        }

        changed
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Authoritative reconciled state of one record, as held by the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciledRecord {
    pub key: String,

    /// Whether the store found a matching sale for this record
    #[serde(default)]
    pub matched: bool,

    /// Quality flag attached by the store
    #[serde(default)]
    pub quality: bool,

    /// Owning group (e.g. the agent or branch the record belongs to)
    #[serde(default)]
    pub group: Option<String>,

    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub attributes: Map<String, Value>,
}
