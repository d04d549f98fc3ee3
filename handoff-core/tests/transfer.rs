//! End-to-end transfers: chunk streaming, cancellation, tampering and scheduling.

mod common;

use std::collections::HashSet;
use std::sync::Arc;

use common::{eventually, paired, settings, wait_for, write_file, Network};
use handoff_core::protocol::MessageKind;
use handoff_core::receiver::partial_path;
use handoff_core::registry::TaskStore;
use handoff_core::{
    EncryptionType, EngineEvent, LocalPeer, MemoryTaskStore, PeerId, StaticPeerDirectory,
    TerminationOrigin, TransferEngine, TransferStatus, TransferTask,
};
use tempfile::TempDir;
use tokio::sync::broadcast::error::RecvError;

fn fixed_chunks(dir: &std::path::Path, size: u64) -> handoff_core::Settings {
    handoff_core::Settings {
        min_chunk_size: size,
        initial_chunk_size: size,
        max_chunk_size: size,
        ..settings(dir)
    }
}

fn completed(tasks: &[TransferTask]) -> bool {
    !tasks.is_empty() && tasks.iter().all(|t| t.status == TransferStatus::Completed)
}

#[tokio::test]
async fn trusted_peer_receives_eight_chunks() {
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    let net = Network::new();
    let a = net.join("a", fixed_chunks(src.path(), 4096), paired("b", true)).await;
    let b = net.join("b", settings(dst.path()), paired("a", true)).await;

    let (path, data) = write_file(src.path(), "archive.tar", 8 * 4096);
    assert!(a.propose_batch(&PeerId::from("b"), vec![path], false).await.unwrap());

    let tasks = wait_for(&b, "receiver completion", completed).await;
    let received = &tasks[0];
    assert_eq!(received.file_size, data.len() as u64);
    assert_eq!(received.transferred_bytes, data.len() as u64);
    assert_eq!(received.peer_id, PeerId::from("a"));
    assert_eq!(net.count("a", MessageKind::DataChunk), 8);

    let save = received.save_path.clone().unwrap();
    assert_eq!(save, dst.path().join("archive.tar"));
    assert_eq!(std::fs::read(&save).unwrap(), data);
    assert!(!partial_path(&save).exists());
    wait_for(&a, "sender completion", completed).await;
}

async fn exact_copy(encrypt: bool, encryption: EncryptionType, len: usize) {
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    let net = Network::new();
    let mut sender = settings(src.path());
    sender.encryption = encryption;
    sender.pipeline_depth = 3;
    sender.flush_interval_bytes = 10_000;
    let a = net.join("a", sender, paired("b", true)).await;
    let b = net.join("b", settings(dst.path()), paired("a", true)).await;
    let mut events = b.subscribe();

    let (path, data) = write_file(src.path(), "payload.bin", len);
    assert!(a.propose_batch(&PeerId::from("b"), vec![path], encrypt).await.unwrap());
    let tasks = wait_for(&b, "receiver completion", completed).await;
    let save = tasks[0].save_path.clone().unwrap();
    assert_eq!(std::fs::read(save).unwrap(), data);

    let sent = a.tasks().await.unwrap();
    let expected = if encrypt { encryption } else { EncryptionType::None };
    assert_eq!(sent[0].encryption, expected);

    // Receiver progress never goes backwards or past the size.
    let mut last = 0;
    loop {
        match events.try_recv() {
            Ok(EngineEvent::TaskUpdated(task)) => {
                assert!(task.transferred_bytes >= last);
                assert!(task.transferred_bytes <= task.file_size);
                last = task.transferred_bytes;
            }
            Ok(_) | Err(tokio::sync::broadcast::error::TryRecvError::Lagged(_)) => {}
            Err(_) => break,
        }
    }
    assert_eq!(last, len as u64);
}

#[tokio::test]
async fn plain_transfer_is_byte_exact() {
    exact_copy(false, EncryptionType::ChaCha20Poly1305, 150_001).await;
}

#[tokio::test]
async fn chacha_transfer_is_byte_exact() {
    exact_copy(true, EncryptionType::ChaCha20Poly1305, 150_001).await;
}

#[tokio::test]
async fn aes_gcm_transfer_is_byte_exact() {
    exact_copy(true, EncryptionType::AesGcm, 70_000).await;
}

#[tokio::test]
async fn empty_file_is_delivered() {
    exact_copy(true, EncryptionType::ChaCha20Poly1305, 0).await;
}

#[tokio::test]
async fn crossing_encrypted_batches_both_arrive() {
    let (src_a, dst_a) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let (src_b, dst_b) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let net = Network::new();
    let a = net.join("a", settings(dst_a.path()), paired("b", true)).await;
    let b = net.join("b", settings(dst_b.path()), paired("a", true)).await;

    let (to_b, for_b) = write_file(src_a.path(), "from-a.bin", 40_000);
    let (to_a, for_a) = write_file(src_b.path(), "from-b.bin", 50_000);
    let peer_b = PeerId::from("b");
    let peer_a = PeerId::from("a");
    let (sent_a, sent_b) = tokio::join!(
        a.propose_batch(&peer_b, vec![to_b], true),
        b.propose_batch(&peer_a, vec![to_a], true),
    );
    assert!(sent_a.unwrap());
    assert!(sent_b.unwrap());

    let both_done = |t: &[TransferTask]| t.len() == 2 && t.iter().all(|t| t.status.is_terminal());
    for (engine, dst, name, data) in [
        (&a, &dst_a, "from-b.bin", &for_a),
        (&b, &dst_b, "from-a.bin", &for_b),
    ] {
        let tasks = wait_for(engine, "both directions", both_done).await;
        assert!(
            tasks.iter().all(|t| t.status == TransferStatus::Completed),
            "{tasks:?}"
        );
        let sent = tasks.iter().find(|t| t.is_outgoing()).unwrap();
        assert_ne!(sent.encryption, EncryptionType::None);
        assert_eq!(std::fs::read(dst.path().join(name)).unwrap(), *data);
    }
}

#[tokio::test]
async fn sender_cancel_discards_partial_file() {
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    let net = Network::new();
    net.hold_chunks_after(3);
    let a = net.join("a", settings(src.path()), paired("b", true)).await;
    let b = net.join("b", settings(dst.path()), paired("a", true)).await;

    let (path, _) = write_file(src.path(), "movie.mkv", 200_000);
    assert!(a.propose_batch(&PeerId::from("b"), vec![path], false).await.unwrap());
    let tasks = wait_for(&b, "incoming task", |t| !t.is_empty()).await;
    let save = tasks[0].save_path.clone().unwrap();
    let partial = partial_path(&save);
    eventually("partial file", || partial.exists()).await;

    let outgoing = a.tasks().await.unwrap()[0].id.clone();
    a.cancel(&outgoing).await.unwrap();

    let tasks = wait_for(&b, "receiver cancel", |t| t[0].status == TransferStatus::Cancelled).await;
    assert!(tasks[0]
        .error_message
        .as_deref()
        .unwrap()
        .contains("cancelled by sender"));
    assert_eq!(tasks[0].termination, Some(TerminationOrigin::Peer));
    eventually("partial removal", || !partial.exists()).await;
    assert!(!save.exists());

    let sent = a.task(&outgoing).await.unwrap().unwrap();
    assert_eq!(sent.status, TransferStatus::Cancelled);
    assert_eq!(sent.termination, Some(TerminationOrigin::User));
}

#[tokio::test]
async fn repeated_cancel_notifies_peer_once() {
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    let net = Network::new();
    net.hold_chunks_after(2);
    let a = net.join("a", settings(src.path()), paired("b", true)).await;
    let b = net.join("b", settings(dst.path()), paired("a", true)).await;

    let (path, _) = write_file(src.path(), "big.bin", 100_000);
    assert!(a.propose_batch(&PeerId::from("b"), vec![path], false).await.unwrap());
    wait_for(&b, "incoming task", |t| !t.is_empty()).await;

    let id = a.tasks().await.unwrap()[0].id.clone();
    a.cancel(&id).await.unwrap();
    let first = a.task(&id).await.unwrap().unwrap();
    a.cancel(&id).await.unwrap();
    let second = a.task(&id).await.unwrap().unwrap();

    assert_eq!(first.status, TransferStatus::Cancelled);
    assert_eq!(first.status, second.status);
    assert_eq!(first.completed_at, second.completed_at);
    wait_for(&b, "receiver cancel", |t| t[0].status == TransferStatus::Cancelled).await;
    assert_eq!(net.count("a", MessageKind::DataTransferCancel), 1);
    assert_eq!(net.count("b", MessageKind::DataTransferCancel), 0);
}

#[tokio::test]
async fn receiver_cancel_stops_the_sender() {
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    let net = Network::new();
    net.hold_chunks_after(2);
    let a = net.join("a", settings(src.path()), paired("b", true)).await;
    let b = net.join("b", settings(dst.path()), paired("a", true)).await;

    let (path, _) = write_file(src.path(), "big.bin", 100_000);
    assert!(a.propose_batch(&PeerId::from("b"), vec![path], false).await.unwrap());
    let incoming = wait_for(&b, "incoming task", |t| !t.is_empty()).await[0].id.clone();
    b.cancel(&incoming).await.unwrap();

    let tasks = wait_for(&a, "sender cancel", |t| t[0].status == TransferStatus::Cancelled).await;
    assert_eq!(tasks[0].error_message.as_deref(), Some("cancelled by receiver"));
}

#[tokio::test]
async fn tampered_chunk_fails_before_writing() {
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    let net = Network::new();
    net.tamper_chunk(0);
    let a = net.join("a", settings(src.path()), paired("b", true)).await;
    let b = net.join("b", settings(dst.path()), paired("a", true)).await;

    let (path, _) = write_file(src.path(), "secret.db", 20_000);
    assert!(a.propose_batch(&PeerId::from("b"), vec![path], true).await.unwrap());

    let tasks = wait_for(&b, "receiver failure", |t| {
        t.first().is_some_and(|t| t.status == TransferStatus::Failed)
    })
    .await;
    assert_eq!(tasks[0].transferred_bytes, 0);
    let save = tasks[0].save_path.clone().unwrap();
    eventually("partial removal", || !partial_path(&save).exists()).await;
    assert!(!save.exists());

    // The sender hears about it.
    wait_for(&a, "sender stop", |t| t[0].status.is_terminal()).await;
}

#[tokio::test]
async fn concurrency_cap_is_respected() {
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    let net = Network::new();
    let mut sender = settings(src.path());
    sender.max_concurrent_tasks = 2;
    let a = net.join("a", sender, paired("b", true)).await;
    let _b = net.join("b", settings(dst.path()), paired("a", true)).await;
    let mut events = a.subscribe();

    let files = (0..5)
        .map(|i| write_file(src.path(), &format!("part{i}.bin"), 30_000).0)
        .collect();
    assert!(a.propose_batch(&PeerId::from("b"), files, false).await.unwrap());

    let mut active = HashSet::new();
    let mut finished = HashSet::new();
    let mut peak = 0;
    while finished.len() < 5 {
        let event = tokio::time::timeout(std::time::Duration::from_secs(10), events.recv())
            .await
            .expect("event stream stalled");
        let task = match event {
            Ok(EngineEvent::TaskUpdated(task)) => task,
            Ok(_) => continue,
            Err(RecvError::Lagged(n)) => panic!("lagged by {n} events"),
            Err(RecvError::Closed) => break,
        };
        if task.status == TransferStatus::Transferring {
            active.insert(task.id.clone());
        } else {
            active.remove(&task.id);
        }
        if task.status == TransferStatus::Completed {
            finished.insert(task.id.clone());
        }
        peak = peak.max(active.len());
    }
    assert!(peak >= 1);
    assert!(peak <= 2, "{peak} tasks transferring at once");
}

#[tokio::test]
async fn cleared_and_purged_tasks_disappear() {
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    let net = Network::new();
    let a = net.join("a", settings(src.path()), paired("b", true)).await;
    let mut receiver = settings(dst.path());
    receiver.cleanup.completed = true;
    receiver.cleanup.delay_secs = 0;
    let b = net.join("b", receiver, paired("a", true)).await;

    let (path, data) = write_file(src.path(), "note.txt", 500);
    assert!(a.propose_batch(&PeerId::from("b"), vec![path], false).await.unwrap());
    wait_for(&a, "sender completion", completed).await;
    // Receiver retention removes the task but keeps the file.
    wait_for(&b, "receiver cleanup", |t| t.is_empty()).await;
    assert_eq!(std::fs::read(dst.path().join("note.txt")).unwrap(), data);

    assert_eq!(a.clear_finished().await.unwrap(), 1);
    assert!(a.tasks().await.unwrap().is_empty());
}

#[tokio::test]
async fn name_collisions_get_numbered() {
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    std::fs::write(dst.path().join("report.txt"), b"old").unwrap();
    let net = Network::new();
    let a = net.join("a", settings(src.path()), paired("b", true)).await;
    let b = net.join("b", settings(dst.path()), paired("a", true)).await;

    let (path, data) = write_file(src.path(), "report.txt", 64);
    assert!(a.propose_batch(&PeerId::from("b"), vec![path], false).await.unwrap());
    let tasks = wait_for(&b, "receiver completion", completed).await;
    assert_eq!(tasks[0].save_path.as_deref(), Some(dst.path().join("report (1).txt").as_path()));
    assert_eq!(std::fs::read(dst.path().join("report (1).txt")).unwrap(), data);
    assert_eq!(std::fs::read(dst.path().join("report.txt")).unwrap(), b"old");
}

#[tokio::test]
async fn restart_fails_interrupted_tasks() {
    let dst = TempDir::new().unwrap();
    let save = dst.path().join("half.bin");
    std::fs::write(partial_path(&save), b"partial").unwrap();
    let store = Arc::new(MemoryTaskStore::new());
    let stale = TransferTask::incoming(
        "t-1".into(),
        "half.bin".into(),
        100,
        save.clone(),
        PeerId::from("a"),
        "A".into(),
        Default::default(),
    );
    store.put_task(&stale).await.unwrap();

    let engine = TransferEngine::start(
        LocalPeer::new("b", "B"),
        settings(dst.path()),
        Arc::new(NoTransport),
        Arc::new(StaticPeerDirectory::new()),
        store.clone(),
    )
    .await
    .unwrap();

    let task = engine.task(&stale.id).await.unwrap().unwrap();
    assert_eq!(task.status, TransferStatus::Failed);
    assert_eq!(task.error_message.as_deref(), Some("interrupted by restart"));
    assert!(!partial_path(&save).exists());
    let stored = store.query_tasks_all().await.unwrap();
    assert_eq!(stored[0].status, TransferStatus::Failed);
    engine.shutdown().await.unwrap();
}

struct NoTransport;

#[async_trait::async_trait]
impl handoff_core::PeerMessenger for NoTransport {
    fn send_to_peer(&self, _peer: &PeerId, _envelope: handoff_core::Envelope) -> handoff_core::Delivery {
        handoff_core::Delivery::ready(false)
    }

    async fn reconnect(&self, _peer: &PeerId) -> bool {
        false
    }
}
