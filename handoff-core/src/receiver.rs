//! Chunk receiver: routes inbound chunks to per-task workers and streams them to disk.
//!
//! The first chunk for an unknown task id claims the route (`Offer::Create`); chunks that
//! arrive before the orchestrator has created the task are buffered on the route and
//! replayed in arrival order when it opens. Each worker is the only writer of its file,
//! so writes for a task are append-only and strictly ordered.

use std::collections::{HashMap, HashSet};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::fs::{self, File};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chunk::ProgressThrottle;
use crate::cipher::{self, CipherError, EncryptionType};
use crate::events::WorkerEvent;
use crate::identity::{PeerId, SessionKey};
use crate::protocol::{ChunkPayload, DataChunk, Metadata, ProtocolError};
use crate::session::SessionKeyManager;
use crate::task::TaskId;

/// Suffix of the in-progress file next to its destination.
pub const PARTIAL_SUFFIX: &str = ".handoff-part";
/// A task that receives nothing for this long fails.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(120);
const WRITE_BUFFER: usize = 1024 * 1024;

/// Header fields from the first chunk of a task.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingHeader {
    pub task_id: TaskId,
    pub file_name: String,
    pub file_size: u64,
    pub metadata: Metadata,
}

impl IncomingHeader {
    fn from_chunk(chunk: &DataChunk) -> Option<Self> {
        Some(Self {
            task_id: chunk.task_id.clone(),
            file_name: chunk.file_name.clone()?,
            file_size: chunk.file_size?,
            metadata: chunk.metadata.clone().unwrap_or_default(),
        })
    }
}

#[derive(Debug, PartialEq)]
pub enum Offer {
    /// First chunk of an unknown task: the caller must have the task created.
    Create(IncomingHeader),
    Delivered,
    /// Held until the task's route opens.
    Buffered,
    Dropped,
}

enum Route {
    Creating {
        peer: PeerId,
        buffered: Vec<DataChunk>,
    },
    Open {
        peer: PeerId,
        tx: mpsc::UnboundedSender<DataChunk>,
    },
}

#[derive(Default)]
struct RouterState {
    routes: HashMap<TaskId, Route>,
    /// Tasks whose route was closed; late chunks for them are dropped.
    closed: HashSet<TaskId>,
}

/// Chunk demultiplexer shared by the protocol entry point and the orchestrator.
#[derive(Default)]
pub struct InboundRouter {
    state: Mutex<RouterState>,
}

impl InboundRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn offer(&self, from: &PeerId, chunk: DataChunk) -> Offer {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.closed.contains(&chunk.task_id) {
            return Offer::Dropped;
        }
        match state.routes.get_mut(&chunk.task_id) {
            Some(Route::Open { peer, tx }) => {
                if peer != from {
                    warn!(task = %chunk.task_id, from = %from, "chunk from foreign peer dropped");
                    return Offer::Dropped;
                }
                match tx.send(chunk) {
                    Ok(()) => Offer::Delivered,
                    Err(_) => Offer::Dropped,
                }
            }
            Some(Route::Creating { peer, buffered }) => {
                if peer != from {
                    return Offer::Dropped;
                }
                buffered.push(chunk);
                Offer::Buffered
            }
            None => {
                let Some(header) = IncomingHeader::from_chunk(&chunk) else {
                    debug!(task = %chunk.task_id, "chunk for unknown task without header dropped");
                    return Offer::Dropped;
                };
                state.routes.insert(
                    chunk.task_id.clone(),
                    Route::Creating {
                        peer: from.clone(),
                        buffered: vec![chunk],
                    },
                );
                Offer::Create(header)
            }
        }
    }

    /// Attach the worker channel and replay buffered chunks. False if the route was closed meanwhile.
    pub fn open(&self, task_id: &TaskId, tx: mpsc::UnboundedSender<DataChunk>) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(Route::Creating { peer, buffered }) = state.routes.remove(task_id) else {
            return false;
        };
        let replayed = buffered.len();
        for chunk in buffered {
            if tx.send(chunk).is_err() {
                break;
            }
        }
        debug!(task = %task_id, replayed, "route open");
        state
            .routes
            .insert(task_id.clone(), Route::Open { peer, tx });
        true
    }

    /// Stop routing chunks for `task_id`. Drops the worker's sender, which ends its stream.
    pub fn close(&self, task_id: &TaskId) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.routes.remove(task_id);
        state.closed.insert(task_id.clone());
    }

    pub fn close_all(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let ids: Vec<TaskId> = state.routes.drain().map(|(id, _)| id).collect();
        state.closed.extend(ids);
    }

    /// Drop the tombstone of a removed task.
    pub fn forget(&self, task_id: &TaskId) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.closed.remove(task_id);
    }
}

/// Turns chunk payloads into plaintext.
#[derive(Clone)]
pub struct ChunkDecoder {
    keys: Arc<SessionKeyManager>,
    legacy: Option<SessionKey>,
}

impl ChunkDecoder {
    pub fn new(keys: Arc<SessionKeyManager>, legacy: Option<SessionKey>) -> Self {
        Self { keys, legacy }
    }

    /// `aes-gcm` uses the peer's session key, else the legacy shared key;
    /// `chacha20-poly1305` requires the session key.
    pub fn decode(&self, peer: &PeerId, chunk: &DataChunk) -> Result<Vec<u8>, ReceiveError> {
        match chunk.payload()? {
            ChunkPayload::Plain(bytes) => Ok(bytes),
            ChunkPayload::Sealed(kind, sealed) => {
                let key = match kind {
                    EncryptionType::AesGcm => self.keys.get(peer).or(self.legacy),
                    _ => self.keys.get(peer),
                }
                .ok_or(ReceiveError::MissingKey(kind))?;
                Ok(cipher::open(
                    kind,
                    &key,
                    chunk.task_id.as_str().as_bytes(),
                    sealed,
                )?)
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReceiveError {
    #[error("malformed chunk: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("chunk rejected: {0}")]
    Cipher(#[from] CipherError),
    #[error("no key for {0:?} chunk")]
    MissingKey(EncryptionType),
    #[error("write failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("missing data: expected offset {expected}, got {got}")]
    Gap { expected: u64, got: u64 },
    #[error("timed out waiting for data")]
    Idle,
}

/// `<dest>.handoff-part`
pub fn partial_path(destination: &Path) -> PathBuf {
    let mut name: OsString = destination.as_os_str().to_owned();
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}

/// Reduce a peer-supplied name to a single path component.
pub fn sanitize_file_name(name: &str) -> String {
    let last = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim()
        .trim_matches(char::from(0));
    match last {
        "" | "." | ".." => "file".to_string(),
        other => other.to_string(),
    }
}

/// First of `name`, `stem (1).ext`, `stem (2).ext`, ... in `dir` for which `taken` is false.
pub fn unique_destination(dir: &Path, name: &str, taken: impl Fn(&Path) -> bool) -> PathBuf {
    let first = dir.join(name);
    if !taken(&first) {
        return first;
    }
    let path = Path::new(name);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string());
    let ext = path.extension().map(|e| e.to_string_lossy().into_owned());
    let mut n = 1u32;
    loop {
        let candidate = match &ext {
            Some(ext) => dir.join(format!("{stem} ({n}).{ext}")),
            None => dir.join(format!("{stem} ({n})")),
        };
        if !taken(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

/// One incoming file, consumed by [`ReceiveJob::run`].
pub struct ReceiveJob {
    pub task_id: TaskId,
    pub peer: PeerId,
    pub destination: PathBuf,
    pub declared_size: u64,
    pub decoder: ChunkDecoder,
    pub events: mpsc::UnboundedSender<WorkerEvent>,
    /// Checked before every chunk and before the final rename. Chunks still queued
    /// when it fires are discarded.
    pub stop: CancellationToken,
}

enum Outcome {
    Completed(u64),
    /// Stop requested or route closed before the file was moved into place.
    Stopped,
}

impl ReceiveJob {
    pub async fn run(self, chunks: mpsc::UnboundedReceiver<DataChunk>) {
        let partial = partial_path(&self.destination);
        let outcome = self.receive(&partial, chunks).await;
        let event = match outcome {
            Ok(Outcome::Completed(bytes)) => {
                if bytes != self.declared_size {
                    warn!(
                        task = %self.task_id,
                        declared = self.declared_size,
                        actual = bytes,
                        "size mismatch; keeping received file"
                    );
                }
                info!(task = %self.task_id, path = %self.destination.display(), bytes, "file received");
                WorkerEvent::completed(&self.task_id, bytes)
            }
            Ok(Outcome::Stopped) => {
                debug!(task = %self.task_id, "receive stopped");
                remove_partial(&partial).await;
                WorkerEvent::stopped(&self.task_id)
            }
            Err(e) => {
                remove_partial(&partial).await;
                WorkerEvent::failed(&self.task_id, e.to_string())
            }
        };
        let _ = self.events.send(event);
    }

    async fn receive(
        &self,
        partial: &Path,
        mut chunks: mpsc::UnboundedReceiver<DataChunk>,
    ) -> Result<Outcome, ReceiveError> {
        if let Some(parent) = partial.parent() {
            fs::create_dir_all(parent).await?;
        }
        let file = File::create(partial).await?;
        let mut writer = BufWriter::with_capacity(WRITE_BUFFER, file);
        let mut written = 0u64;
        let mut throttle = ProgressThrottle::new(self.declared_size);
        loop {
            let chunk = tokio::select! {
                biased;
                _ = self.stop.cancelled() => return Ok(Outcome::Stopped),
                next = tokio::time::timeout(IDLE_TIMEOUT, chunks.recv()) => match next {
                    Ok(Some(chunk)) => chunk,
                    Ok(None) => return Ok(Outcome::Stopped),
                    Err(_) => return Err(ReceiveError::Idle),
                },
            };
            // Authenticate before touching the file.
            let data = self.decoder.decode(&self.peer, &chunk)?;
            let fresh = match chunk.offset {
                Some(offset) if offset > written => {
                    return Err(ReceiveError::Gap {
                        expected: written,
                        got: offset,
                    })
                }
                Some(offset) => {
                    let skip = (written - offset).min(data.len() as u64) as usize;
                    &data[skip..]
                }
                None => &data[..],
            };
            if fresh.len() < data.len() {
                debug!(task = %self.task_id, offset = ?chunk.offset, "re-delivered bytes skipped");
            }
            writer.write_all(fresh).await?;
            written += fresh.len() as u64;
            if chunk.is_last {
                writer.flush().await?;
                let file = writer.into_inner();
                file.sync_all().await?;
                drop(file);
                if self.stop.is_cancelled() {
                    return Ok(Outcome::Stopped);
                }
                fs::rename(partial, &self.destination).await?;
                return Ok(Outcome::Completed(written));
            }
            if throttle.should_emit(written, false) {
                let _ = self.events.send(WorkerEvent::progress(&self.task_id, written));
            }
        }
    }
}

async fn remove_partial(partial: &Path) {
    if let Err(e) = fs::remove_file(partial).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %partial.display(), error = %e, "failed to remove partial file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::WorkerEventKind;
    use crate::identity::random_session_key;

    fn alice() -> PeerId {
        PeerId::from("alice")
    }

    fn first(task: &str) -> DataChunk {
        DataChunk::plain(TaskId::from(task), b"a", false).with_header("f.txt", 3, &Metadata::new())
    }

    #[test]
    fn single_creation_and_ordered_replay() {
        let router = InboundRouter::new();
        let id = TaskId::from("t");
        assert!(matches!(router.offer(&alice(), first("t")), Offer::Create(_)));
        // Even a header-bearing chunk must not trigger a second creation.
        assert_eq!(router.offer(&alice(), first("t")), Offer::Buffered);
        assert_eq!(
            router.offer(&alice(), DataChunk::plain(id.clone(), b"c", true)),
            Offer::Buffered
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        assert!(router.open(&id, tx));
        assert_eq!(
            router.offer(&alice(), DataChunk::plain(id.clone(), b"d", false)),
            Offer::Delivered
        );
        let mut got = Vec::new();
        while let Ok(c) = rx.try_recv() {
            got.push(c.data.unwrap());
        }
        assert_eq!(got, ["YQ==", "YQ==", "Yw==", "ZA=="]);
    }

    #[test]
    fn closed_route_drops_late_chunks() {
        let router = InboundRouter::new();
        let id = TaskId::from("t");
        let _ = router.offer(&alice(), first("t"));
        router.close(&id);
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(!router.open(&id, tx));
        assert_eq!(router.offer(&alice(), first("t")), Offer::Dropped);
        router.forget(&id);
        assert!(matches!(router.offer(&alice(), first("t")), Offer::Create(_)));
    }

    #[test]
    fn headerless_unknown_and_foreign_chunks_dropped() {
        let router = InboundRouter::new();
        assert_eq!(
            router.offer(&alice(), DataChunk::plain(TaskId::from("x"), b"", false)),
            Offer::Dropped
        );
        let _ = router.offer(&alice(), first("t"));
        assert_eq!(
            router.offer(&PeerId::from("eve"), first("t")),
            Offer::Dropped
        );
    }

    #[test]
    fn file_names() {
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("C:\\Users\\a\\doc.pdf"), "doc.pdf");
        assert_eq!(sanitize_file_name(".."), "file");
        assert_eq!(sanitize_file_name("dir/"), "file");

        let dir = Path::new("/dl");
        let taken = [PathBuf::from("/dl/a.txt"), PathBuf::from("/dl/a (1).txt")];
        assert_eq!(
            unique_destination(dir, "a.txt", |p| taken.iter().any(|t| t == p)),
            PathBuf::from("/dl/a (2).txt")
        );
        assert_eq!(
            unique_destination(dir, "README", |p| p == Path::new("/dl/README")),
            PathBuf::from("/dl/README (1)")
        );
        assert_eq!(
            partial_path(Path::new("/dl/a.txt")),
            PathBuf::from("/dl/a.txt.handoff-part")
        );
    }

    #[test]
    fn decoder_key_dispatch() {
        let keys = Arc::new(SessionKeyManager::new());
        let legacy = random_session_key();
        let decoder = ChunkDecoder::new(keys.clone(), Some(legacy));
        let id = TaskId::from("t");
        let aes = cipher::seal(EncryptionType::AesGcm, &legacy, b"t", b"hi".to_vec()).unwrap();
        let chunk = DataChunk::sealed(id.clone(), EncryptionType::AesGcm, &aes, false);
        assert_eq!(decoder.decode(&alice(), &chunk).unwrap(), b"hi");

        let chacha =
            cipher::seal(EncryptionType::ChaCha20Poly1305, &legacy, b"t", b"hi".to_vec()).unwrap();
        let chunk = DataChunk::sealed(id.clone(), EncryptionType::ChaCha20Poly1305, &chacha, false);
        assert!(matches!(
            decoder.decode(&alice(), &chunk),
            Err(ReceiveError::MissingKey(EncryptionType::ChaCha20Poly1305))
        ));

        let session = keys.get_or_create(&alice());
        let sealed =
            cipher::seal(EncryptionType::ChaCha20Poly1305, &session, b"other", b"hi".to_vec())
                .unwrap();
        let chunk = DataChunk::sealed(id, EncryptionType::ChaCha20Poly1305, &sealed, false);
        assert!(matches!(
            decoder.decode(&alice(), &chunk),
            Err(ReceiveError::Cipher(CipherError::Decrypt))
        ));
    }

    fn job(dir: &Path, declared: u64) -> (ReceiveJob, mpsc::UnboundedReceiver<WorkerEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let job = ReceiveJob {
            task_id: TaskId::from("t"),
            peer: alice(),
            destination: dir.join("out.bin"),
            declared_size: declared,
            decoder: ChunkDecoder::new(Arc::new(SessionKeyManager::new()), None),
            events,
            stop: CancellationToken::new(),
        };
        (job, rx)
    }

    async fn last_event(rx: &mut mpsc::UnboundedReceiver<WorkerEvent>) -> WorkerEventKind {
        let mut last = None;
        while let Some(e) = rx.recv().await {
            last = Some(e.kind);
        }
        last.unwrap()
    }

    #[tokio::test]
    async fn writes_in_order_and_skips_redelivery() {
        let dir = tempfile::tempdir().unwrap();
        let (job, mut events) = job(dir.path(), 6);
        let (tx, rx) = mpsc::unbounded_channel();
        let id = TaskId::from("t");
        tx.send(DataChunk::plain(id.clone(), b"abc", false).with_offset(0)).unwrap();
        tx.send(DataChunk::plain(id.clone(), b"bcd", false).with_offset(1)).unwrap();
        tx.send(DataChunk::plain(id.clone(), b"ef", true).with_offset(4)).unwrap();
        drop(tx);
        job.run(rx).await;
        assert_eq!(last_event(&mut events).await, WorkerEventKind::Completed { bytes: 6 });
        assert_eq!(std::fs::read(dir.path().join("out.bin")).unwrap(), b"abcdef");
        assert!(!partial_path(&dir.path().join("out.bin")).exists());
    }

    #[tokio::test]
    async fn size_mismatch_still_completes() {
        let dir = tempfile::tempdir().unwrap();
        let (job, mut events) = job(dir.path(), 100);
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(DataChunk::plain(TaskId::from("t"), b"abc", true)).unwrap();
        drop(tx);
        job.run(rx).await;
        assert_eq!(last_event(&mut events).await, WorkerEventKind::Completed { bytes: 3 });
    }

    #[tokio::test]
    async fn gap_fails_and_discards_partial() {
        let dir = tempfile::tempdir().unwrap();
        let (job, mut events) = job(dir.path(), 6);
        let (tx, rx) = mpsc::unbounded_channel();
        let id = TaskId::from("t");
        tx.send(DataChunk::plain(id.clone(), b"abc", false).with_offset(0)).unwrap();
        tx.send(DataChunk::plain(id, b"ef", true).with_offset(4)).unwrap();
        drop(tx);
        job.run(rx).await;
        assert!(matches!(
            last_event(&mut events).await,
            WorkerEventKind::Failed { .. }
        ));
        assert!(!dir.path().join("out.bin").exists());
        assert!(!partial_path(&dir.path().join("out.bin")).exists());
    }

    #[tokio::test]
    async fn closed_stream_removes_partial() {
        let dir = tempfile::tempdir().unwrap();
        let (job, mut events) = job(dir.path(), 6);
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(DataChunk::plain(TaskId::from("t"), b"abc", false)).unwrap();
        drop(tx);
        job.run(rx).await;
        assert_eq!(last_event(&mut events).await, WorkerEventKind::Stopped);
        assert!(!partial_path(&dir.path().join("out.bin")).exists());
    }

    #[tokio::test]
    async fn stop_discards_queued_last_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let (job, mut events) = job(dir.path(), 11);
        let (tx, rx) = mpsc::unbounded_channel();
        let id = TaskId::from("t");
        tx.send(DataChunk::plain(id.clone(), b"hello ", false)).unwrap();
        tx.send(DataChunk::plain(id, b"world", true)).unwrap();
        job.stop.cancel();
        job.run(rx).await;
        assert_eq!(last_event(&mut events).await, WorkerEventKind::Stopped);
        assert!(!dir.path().join("out.bin").exists());
        assert!(!partial_path(&dir.path().join("out.bin")).exists());
        drop(tx);
    }
}
