//! Remote reconciliation service.
//!
//! The pipeline only talks to the remote store through [`SyncService`]:
//! submit a chunk, poll a task, fetch reconciled records by key.

mod http;
pub mod memory;

pub use http::HttpSyncService;
pub use memory::InMemorySyncService;

use crate::error::SyncError;
use crate::model::{ReconciledRecord, Record, TaskId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Dispatch request body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest<'a> {
    pub action: &'a str,
    pub chunk_records: &'a [Record],
}

impl<'a> SubmitRequest<'a> {
    pub fn sync(chunk_records: &'a [Record]) -> Self {
        Self {
            action: "sync",
            chunk_records,
        }
    }
}

/// Dispatch response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub task_id: TaskId,
}

/// One status observation of a remote task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskPoll {
    /// Raw status string; parsed by the poller
    pub status: String,
    /// Remote progress scalar (0-100)
    #[serde(default)]
    pub progress: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Fetch request body.
#[derive(Debug, Clone, Serialize)]
pub struct FetchRequest<'a> {
    pub keys: &'a [String],
}

/// Fetch response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchResponse {
    pub records: Vec<ReconciledRecord>,
}

/// Narrow interface to the remote reconciliation service.
#[async_trait]
pub trait SyncService: Send + Sync {
    /// Submit one chunk; returns once the remote has accepted it.
    async fn submit(&self, records: &[Record]) -> Result<TaskId, SyncError>;

    /// Query a task's status once.
    async fn poll_once(&self, task_id: &TaskId) -> Result<TaskPoll, SyncError>;

    /// Fetch the authoritative reconciled records for `keys`.
    async fn fetch_by_keys(&self, keys: &[String]) -> Result<Vec<ReconciledRecord>, SyncError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submit_request_wire_format() {
        let records = vec![Record::new("k1")];
        let json = serde_json::to_value(SubmitRequest::sync(&records)).unwrap();
        assert_eq!(json["action"], "sync");
        assert_eq!(json["chunkRecords"][0]["key"], "k1");
    }

    #[test]
    fn test_submit_response_wire_format() {
        let response: SubmitResponse = serde_json::from_str(r#"{"taskId":"abc"}"#).unwrap();
        assert_eq!(response.task_id, TaskId::from("abc"));
    }

    #[test]
    fn test_task_poll_defaults() {
        let poll: TaskPoll = serde_json::from_str(r#"{"status":"pending"}"#).unwrap();
        assert_eq!(poll.progress, 0.0);
        assert!(poll.error.is_none());
    }
}
