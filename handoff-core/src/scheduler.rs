//! Admission scheduler: which pending outgoing tasks may start transferring.

use crate::task::{TaskId, TransferStatus, TransferTask};

/// Pending outgoing tasks to promote, in registry order, so that at most `max_concurrent`
/// outgoing tasks are transferring. Incoming tasks are not counted against the cap.
pub fn admit_next<'a>(
    tasks: impl IntoIterator<Item = &'a TransferTask>,
    max_concurrent: usize,
) -> Vec<TaskId> {
    let mut active = 0usize;
    let mut pending = Vec::new();
    for task in tasks {
        if !task.is_outgoing() {
            continue;
        }
        match task.status {
            TransferStatus::Transferring => active += 1,
            TransferStatus::Pending => pending.push(task.id.clone()),
            _ => {}
        }
    }
    let free = max_concurrent.saturating_sub(active);
    pending.truncate(free);
    pending
}
