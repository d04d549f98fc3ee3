//! In-memory network connecting engines in one process.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use handoff_core::protocol::MessageKind;
use handoff_core::{
    Delivery, DeliveryHandle, Envelope, LocalPeer, MemoryTaskStore, Message, PeerEntry, PeerId,
    PeerMessenger, Settings, StaticPeerDirectory, TransferEngine, TransferTask,
};
use tokio::time::Instant;

const WAIT_LIMIT: Duration = Duration::from_secs(10);

/// Every envelope that entered the network: (from, to, kind).
pub type Log = Vec<(PeerId, PeerId, MessageKind)>;

#[derive(Default)]
pub struct Network {
    engines: Mutex<HashMap<PeerId, TransferEngine>>,
    log: Mutex<Log>,
    chunks: Mutex<usize>,
    /// Data chunks past this count are accepted but never delivered.
    hold_after: Mutex<Option<usize>>,
    held: Mutex<Vec<DeliveryHandle>>,
    /// Index of the data chunk whose authentication tag is corrupted in transit.
    tamper_at: Mutex<Option<usize>>,
}

impl Network {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn hold_chunks_after(&self, count: usize) {
        *self.hold_after.lock().unwrap() = Some(count);
    }

    pub fn tamper_chunk(&self, index: usize) {
        *self.tamper_at.lock().unwrap() = Some(index);
    }

    pub fn log(&self) -> Log {
        self.log.lock().unwrap().clone()
    }

    pub fn count(&self, from: &str, kind: MessageKind) -> usize {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|(f, _, k)| f.as_str() == from && *k == kind)
            .count()
    }

    /// Start an engine for `id` and attach it to the network.
    pub async fn join(
        self: &Arc<Self>,
        id: &str,
        settings: Settings,
        peers: StaticPeerDirectory,
    ) -> TransferEngine {
        let engine = TransferEngine::start(
            LocalPeer::new(id, id.to_uppercase()),
            settings,
            Arc::new(Loopback { net: self.clone() }),
            Arc::new(peers),
            Arc::new(MemoryTaskStore::new()),
        )
        .await
        .unwrap();
        self.engines
            .lock()
            .unwrap()
            .insert(PeerId::from(id), engine.clone());
        engine
    }

    fn deliver(&self, peer: &PeerId, mut envelope: Envelope) -> Delivery {
        self.log.lock().unwrap().push((
            envelope.from_id.clone(),
            envelope.to_id.clone(),
            envelope.kind,
        ));
        if envelope.kind == MessageKind::DataChunk {
            let index = {
                let mut chunks = self.chunks.lock().unwrap();
                *chunks += 1;
                *chunks - 1
            };
            if self.hold_after.lock().unwrap().is_some_and(|limit| index >= limit) {
                let (handle, delivery) = Delivery::pending();
                self.held.lock().unwrap().push(handle);
                return delivery;
            }
            if *self.tamper_at.lock().unwrap() == Some(index) {
                envelope = corrupt_tag(envelope);
            }
        }
        let engine = self.engines.lock().unwrap().get(peer).cloned();
        match engine {
            Some(engine) => Delivery::ready(engine.handle_message(envelope).is_ok()),
            None => Delivery::ready(false),
        }
    }
}

fn corrupt_tag(envelope: Envelope) -> Envelope {
    let Ok(Message::DataChunk(mut chunk)) = envelope.message() else {
        return envelope;
    };
    if let Some(tag) = chunk.tag.as_mut() {
        let first = if tag.starts_with('A') { "B" } else { "A" };
        tag.replace_range(0..1, first);
    }
    Envelope::new(&envelope.from_id, &envelope.to_id, &Message::DataChunk(chunk)).unwrap()
}

struct Loopback {
    net: Arc<Network>,
}

#[async_trait]
impl PeerMessenger for Loopback {
    fn send_to_peer(&self, peer: &PeerId, envelope: Envelope) -> Delivery {
        self.net.deliver(peer, envelope)
    }

    async fn reconnect(&self, _peer: &PeerId) -> bool {
        true
    }
}

pub fn paired(peer: &str, trusted: bool) -> StaticPeerDirectory {
    StaticPeerDirectory::new().with_peer(
        peer,
        PeerEntry {
            name: peer.to_uppercase(),
            trusted,
            blocked: false,
        },
    )
}

/// Small fixed-size chunks so tests exercise many of them.
pub fn settings(download: &Path) -> Settings {
    Settings {
        download_path: download.to_path_buf(),
        min_chunk_size: 1024,
        initial_chunk_size: 4 * 1024,
        max_chunk_size: 16 * 1024,
        ..Settings::default()
    }
}

/// Poll `engine` until `done` holds for its task list.
pub async fn wait_for(
    engine: &TransferEngine,
    what: &str,
    mut done: impl FnMut(&[TransferTask]) -> bool,
) -> Vec<TransferTask> {
    let deadline = Instant::now() + WAIT_LIMIT;
    loop {
        let tasks = engine.tasks().await.unwrap();
        if done(&tasks) {
            return tasks;
        }
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT_LIMIT;
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn write_file(dir: &Path, name: &str, len: usize) -> (std::path::PathBuf, Vec<u8>) {
    let data: Vec<u8> = (0..len).map(|i| (i * 31 % 251) as u8).collect();
    let path = dir.join(name);
    std::fs::write(&path, &data).unwrap();
    (path, data)
}
