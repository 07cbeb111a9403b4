//! Dispatch of chunks to the remote service.

use crate::error::SyncError;
use crate::model::{Chunk, Task};
use crate::pipeline::{Metrics, RetryPolicy, RunHandle};
use crate::remote::SyncService;
use std::sync::Arc;
use std::time::Instant;

/// Submits chunks, retrying transport failures per the retry policy.
#[derive(Clone)]
pub struct Dispatcher {
    service: Arc<dyn SyncService>,
    retry: RetryPolicy,
    metrics: Arc<Metrics>,
}

impl Dispatcher {
    pub fn new(service: Arc<dyn SyncService>, retry: RetryPolicy, metrics: Arc<Metrics>) -> Self {
        Self {
            service,
            retry,
            metrics,
        }
    }

    /// Submit one chunk and return its task in the `pending` state.
    ///
    /// The caller must hold a limiter permit for the whole call. Retries wait
    /// while `handle` is paused.
    pub async fn dispatch(&self, chunk: &Chunk, handle: &RunHandle) -> Result<Task, SyncError> {
        if chunk.is_empty() {
            return Err(SyncError::Payload(format!("chunk {} is empty", chunk.index)));
        }

        let label = format!("Dispatch of chunk {}/{}", chunk.index + 1, chunk.total);
        let start = Instant::now();

        let result = self
            .retry
            .run_with_handle(
                &label,
                handle,
                || self.service.submit(&chunk.records),
                |_, _| self.metrics.add_dispatch_retry(),
            )
            .await;

        self.metrics.add_dispatch_time(start.elapsed());

        let task_id = result?;
        self.metrics.add_chunk_dispatched(chunk.len() as u64);
        tracing::debug!(
            "Chunk {}/{} ({} records) accepted as task {}",
            chunk.index + 1,
            chunk.total,
            chunk.len(),
            task_id
        );

        Ok(Task::new(task_id, chunk.index))
    }
}
