//! Run phases and the per-run state owned by the controller.

use crate::error::{ChunkFailure, PipelineError};
use crate::model::{Chunk, Task};
use crate::pipeline::cancel::RunHandle;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// Phase of a synchronization run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunPhase {
    Idle,
    Partitioning,
    Dispatching,
    Polling,
    Fetching,
    Merging,
    Completed,
    Failed,
    Aborted,
}

impl RunPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunPhase::Completed | RunPhase::Failed | RunPhase::Aborted)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: RunPhase) -> bool {
        use RunPhase::*;

        if self.is_terminal() {
            return false;
        }
        if matches!(next, Failed | Aborted) {
            return true;
        }
        matches!(
            (self, next),
            (Idle, Partitioning)
                | (Partitioning, Dispatching)
                | (Partitioning, Completed)
                | (Dispatching, Polling)
                | (Polling, Fetching)
                | (Fetching, Merging)
                | (Merging, Completed)
        )
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunPhase::Idle => "idle",
            RunPhase::Partitioning => "partitioning",
            RunPhase::Dispatching => "dispatching",
            RunPhase::Polling => "polling",
            RunPhase::Fetching => "fetching",
            RunPhase::Merging => "merging",
            RunPhase::Completed => "completed",
            RunPhase::Failed => "failed",
            RunPhase::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// State of one invocation. Created at start, dropped at a terminal phase.
pub struct RunState {
    pub phase: RunPhase,
    pub chunks: Vec<Arc<Chunk>>,
    /// Tasks for successfully dispatched chunks
    pub tasks: Vec<Task>,
    /// Chunks that failed dispatch or whose task failed
    pub failures: Vec<ChunkFailure>,
    pub handle: RunHandle,
}

impl RunState {
    pub fn new(handle: RunHandle) -> Self {
        Self {
            phase: RunPhase::Idle,
            chunks: Vec::new(),
            tasks: Vec::new(),
            failures: Vec::new(),
            handle,
        }
    }

    /// Move to `next`, rejecting transitions the state machine does not allow.
    pub fn transition(&mut self, next: RunPhase) -> Result<(), PipelineError> {
        if !self.phase.can_transition_to(next) {
            return Err(PipelineError::Invariant(format!(
                "illegal phase transition {} -> {}",
                self.phase, next
            )));
        }
        tracing::info!("Run phase: {} -> {}", self.phase, next);
        self.phase = next;
        Ok(())
    }
}
