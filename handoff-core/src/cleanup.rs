//! Retention: removal of terminal tasks after a delay, and startup recovery.

use std::time::Duration;

use tokio::sync::mpsc;

use crate::config::{CleanupPolicy, StartupPurge};
use crate::task::{TaskId, TerminationOrigin, TransferStatus, TransferTask};

/// Message used when a task was live while the previous process exited.
pub const INTERRUPTED: &str = "interrupted by restart";

/// Whether `task` should be removed after the cleanup delay.
///
/// Failed, cancelled and rejected tasks are removed only when the peer or the system
/// ended them; whatever the local user ended stays until cleared explicitly.
pub fn should_cleanup(policy: &CleanupPolicy, task: &TransferTask) -> bool {
    let caused_elsewhere = task.termination != Some(TerminationOrigin::User);
    match task.status {
        TransferStatus::Completed => policy.completed,
        TransferStatus::Cancelled | TransferStatus::Rejected => policy.cancelled && caused_elsewhere,
        TransferStatus::Failed => policy.failed && caused_elsewhere,
        _ => false,
    }
}

/// Deliver `message` on `tx` once `delay` has elapsed.
pub fn schedule_cleanup<T: Send + 'static>(delay: Duration, tx: mpsc::UnboundedSender<T>, message: T) {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let _ = tx.send(message);
    });
}

/// Tasks loaded from the store that were mid-flight when the last process stopped.
pub fn interrupted<'a>(tasks: impl IntoIterator<Item = &'a TransferTask>) -> Vec<TaskId> {
    tasks
        .into_iter()
        .filter(|t| !t.status.is_terminal())
        .map(|t| t.id.clone())
        .collect()
}

/// Tasks to delete at startup under `purge`.
pub fn purge_targets<'a>(
    purge: StartupPurge,
    tasks: impl IntoIterator<Item = &'a TransferTask>,
) -> Vec<TaskId> {
    tasks
        .into_iter()
        .filter(|t| match purge {
            StartupPurge::None => false,
            StartupPurge::NonCompleted => t.status != TransferStatus::Completed,
            StartupPurge::All => true,
        })
        .map(|t| t.id.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::identity::PeerId;
    use crate::task::BatchId;

    fn ended(status: TransferStatus, origin: TerminationOrigin) -> TransferTask {
        let mut t = TransferTask::outgoing(
            BatchId::from("b"),
            PathBuf::from("f"),
            "f".into(),
            1,
            PeerId::from("p"),
            "P".into(),
        );
        if status == TransferStatus::Completed {
            t.transition(TransferStatus::Transferring).unwrap();
        }
        t.terminate(status, origin, None).unwrap();
        t
    }

    fn all_on() -> CleanupPolicy {
        CleanupPolicy {
            completed: true,
            cancelled: true,
            failed: true,
            delay_secs: 0,
        }
    }

    #[test]
    fn user_terminations_are_kept() {
        let policy = all_on();
        assert!(!should_cleanup(&policy, &ended(TransferStatus::Cancelled, TerminationOrigin::User)));
        assert!(!should_cleanup(&policy, &ended(TransferStatus::Failed, TerminationOrigin::User)));
        assert!(should_cleanup(&policy, &ended(TransferStatus::Cancelled, TerminationOrigin::Peer)));
        assert!(should_cleanup(&policy, &ended(TransferStatus::Rejected, TerminationOrigin::Peer)));
        assert!(should_cleanup(&policy, &ended(TransferStatus::Failed, TerminationOrigin::System)));
        assert!(should_cleanup(&policy, &ended(TransferStatus::Completed, TerminationOrigin::System)));
    }

    #[test]
    fn policies_are_independent() {
        let policy = CleanupPolicy {
            completed: true,
            ..CleanupPolicy::default()
        };
        assert!(should_cleanup(&policy, &ended(TransferStatus::Completed, TerminationOrigin::System)));
        assert!(!should_cleanup(&policy, &ended(TransferStatus::Failed, TerminationOrigin::System)));
        assert!(!should_cleanup(&policy, &ended(TransferStatus::Cancelled, TerminationOrigin::Peer)));
    }

    #[test]
    fn startup_purge_selection() {
        let tasks = vec![
            ended(TransferStatus::Completed, TerminationOrigin::System),
            ended(TransferStatus::Failed, TerminationOrigin::System),
        ];
        assert!(purge_targets(StartupPurge::None, &tasks).is_empty());
        assert_eq!(purge_targets(StartupPurge::NonCompleted, &tasks), vec![tasks[1].id.clone()]);
        assert_eq!(purge_targets(StartupPurge::All, &tasks).len(), 2);
        assert!(interrupted(&tasks).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_fires_after_delay() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        schedule_cleanup(Duration::from_secs(5), tx, 7u32);
        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(rx.recv().await, Some(7));
    }
}
