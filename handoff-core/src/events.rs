//! Engine notifications (to observers) and worker reports (to the orchestrator).

use crate::protocol::TransferRequest;
use crate::task::{BatchId, TaskId, TransferTask};

/// Broadcast to every subscriber. Slow subscribers may lag and miss events.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A task was created or changed; carries the new snapshot.
    TaskUpdated(TransferTask),
    TaskRemoved(TaskId),
    /// An incoming request from a non-trusted peer awaits `respond_to_request`.
    ApprovalRequested(TransferRequest),
    /// A proposed outgoing batch was answered or timed out.
    BatchResolved { batch_id: BatchId, accepted: bool },
}

/// Report from a sender or receiver worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerEvent {
    pub task_id: TaskId,
    pub kind: WorkerEventKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEventKind {
    Progress { bytes: u64 },
    Completed { bytes: u64 },
    Failed { message: String },
    /// The worker was told to stop and left nothing behind.
    Stopped,
}

impl WorkerEvent {
    pub fn progress(task_id: &TaskId, bytes: u64) -> Self {
        Self {
            task_id: task_id.clone(),
            kind: WorkerEventKind::Progress { bytes },
        }
    }

    pub fn completed(task_id: &TaskId, bytes: u64) -> Self {
        Self {
            task_id: task_id.clone(),
            kind: WorkerEventKind::Completed { bytes },
        }
    }

    pub fn stopped(task_id: &TaskId) -> Self {
        Self {
            task_id: task_id.clone(),
            kind: WorkerEventKind::Stopped,
        }
    }

    pub fn failed(task_id: &TaskId, message: impl Into<String>) -> Self {
        Self {
            task_id: task_id.clone(),
            kind: WorkerEventKind::Failed {
                message: message.into(),
            },
        }
    }
}
