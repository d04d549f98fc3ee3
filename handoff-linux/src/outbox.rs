//! Outbox watcher: files under `<outbox>/<peer-id>/` are offered to that peer, then filed
//! under `sent/` or `failed/` once their task ends.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use handoff_core::receiver::unique_destination;
use handoff_core::{EngineEvent, PeerId, TransferEngine, TransferStatus, TransferTask};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const SCAN_INTERVAL: Duration = Duration::from_secs(2);
const SENT_DIR: &str = "sent";
const FAILED_DIR: &str = "failed";

/// A proposal whose outcome arrived: the files offered and whether the call itself failed.
struct Proposed {
    files: Vec<PathBuf>,
    failed: bool,
}

pub async fn run(engine: TransferEngine, root: PathBuf, peers: Vec<PeerId>, encrypt: bool) {
    let mut events = engine.subscribe();
    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<Proposed>();
    let mut claimed: HashSet<PathBuf> = HashSet::new();
    let mut tick = tokio::time::interval(SCAN_INTERVAL);
    info!(root = %root.display(), peers = peers.len(), "outbox watching");

    loop {
        tokio::select! {
            _ = tick.tick() => {
                for peer in &peers {
                    let files = match scan(&root.join(peer.as_str()), &claimed).await {
                        Ok(files) => files,
                        Err(e) => {
                            warn!(peer = %peer, error = %e, "outbox scan failed");
                            continue;
                        }
                    };
                    if files.is_empty() {
                        continue;
                    }
                    info!(peer = %peer, files = files.len(), "offering outbox files");
                    claimed.extend(files.iter().cloned());
                    let engine = engine.clone();
                    let peer = peer.clone();
                    let done = done_tx.clone();
                    tokio::spawn(async move {
                        let result = engine.propose_batch(&peer, files.clone(), encrypt).await;
                        if let Err(e) = &result {
                            warn!(peer = %peer, error = %e, "outbox batch not proposed");
                        }
                        let _ = done.send(Proposed { files, failed: result.is_err() });
                    });
                }
            }
            Some(proposed) = done_rx.recv() => {
                if proposed.failed {
                    for file in proposed.files {
                        claimed.remove(&file);
                        file_away(&file, FAILED_DIR).await;
                    }
                }
            }
            event = events.recv() => match event {
                Ok(EngineEvent::TaskUpdated(task)) => settle(&task, &mut claimed).await,
                Ok(_) => {}
                Err(RecvError::Lagged(missed)) => {
                    debug!(missed, "outbox resyncing after lag");
                    if let Ok(tasks) = engine.tasks().await {
                        for task in &tasks {
                            settle(task, &mut claimed).await;
                        }
                    }
                }
                Err(RecvError::Closed) => break,
            },
        }
    }
}

/// Move a claimed file out of the outbox once its task is terminal.
async fn settle(task: &TransferTask, claimed: &mut HashSet<PathBuf>) {
    if !task.is_outgoing() || !task.status.is_terminal() {
        return;
    }
    let Some(source) = &task.source_path else {
        return;
    };
    if !claimed.remove(source) {
        return;
    }
    let target = if task.status == TransferStatus::Completed {
        SENT_DIR
    } else {
        FAILED_DIR
    };
    file_away(source, target).await;
}

async fn file_away(file: &Path, sub: &str) {
    let (Some(dir), Some(name)) = (file.parent(), file.file_name()) else {
        return;
    };
    let dest_dir = dir.join(sub);
    if let Err(e) = tokio::fs::create_dir_all(&dest_dir).await {
        warn!(dir = %dest_dir.display(), error = %e, "cannot create outbox folder");
        return;
    }
    let dest = unique_destination(&dest_dir, &name.to_string_lossy(), |p| p.exists());
    match tokio::fs::rename(file, &dest).await {
        Ok(()) => debug!(from = %file.display(), to = %dest.display(), "outbox file moved"),
        Err(e) => warn!(file = %file.display(), error = %e, "cannot move outbox file"),
    }
}

/// Regular files directly in `dir` that are not already in flight, in name order.
async fn scan(dir: &Path, claimed: &HashSet<PathBuf>) -> std::io::Result<Vec<PathBuf>> {
    tokio::fs::create_dir_all(dir).await?;
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let hidden = entry.file_name().to_string_lossy().starts_with('.');
        if hidden || claimed.contains(&path) || !entry.file_type().await?.is_file() {
            continue;
        }
        files.push(path);
    }
    files.sort();
    Ok(files)
}
