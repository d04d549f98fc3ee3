//! Chunk sender: streams one file to a peer with bounded pipelining.
//!
//! Chunks are queued on the messenger without waiting for earlier ones; at most
//! `pipeline_depth` deliveries are outstanding. A failed delivery drains the pipeline,
//! shrinks the chunk size, reconnects once and resumes from the first unconfirmed offset.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::chunk::{ChunkSizer, ProgressThrottle};
use crate::cipher::{self, CipherError, EncryptionType};
use crate::config::Settings;
use crate::events::WorkerEvent;
use crate::identity::{PeerId, SessionKey};
use crate::peer::{Delivery, PeerMessenger};
use crate::protocol::{DataChunk, Envelope, Message, Metadata, ProtocolError};
use crate::task::TaskId;

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("cannot read source file: {0}")]
    Source(#[from] std::io::Error),
    #[error("source file shrank during transfer")]
    SourceChanged,
    #[error("encryption failed: {0}")]
    Cipher(#[from] CipherError),
    #[error("encode failed: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("connection to peer lost")]
    Transport,
}

/// Everything a sender worker needs; owned by the worker.
pub struct SendJob {
    pub task_id: TaskId,
    pub local: PeerId,
    pub peer: PeerId,
    pub source: PathBuf,
    pub file_name: String,
    pub file_size: u64,
    pub metadata: Metadata,
    pub encryption: EncryptionType,
    pub key: Option<SessionKey>,
    pub settings: Arc<Settings>,
    pub messenger: Arc<dyn PeerMessenger>,
    pub events: mpsc::UnboundedSender<WorkerEvent>,
}

struct InFlight {
    /// Where to resume if this delivery fails.
    offset: u64,
    /// Payload bytes; 0 for a flush.
    len: u64,
    delivery: Delivery,
}

impl SendJob {
    /// Run to completion and report the outcome to the orchestrator.
    pub async fn run(self) {
        let event = match self.stream().await {
            Ok(bytes) => {
                info!(task = %self.task_id, peer = %self.peer, bytes, "file sent");
                WorkerEvent::completed(&self.task_id, bytes)
            }
            Err(e) => {
                warn!(task = %self.task_id, peer = %self.peer, error = %e, "send failed");
                WorkerEvent::failed(&self.task_id, e.to_string())
            }
        };
        let _ = self.events.send(event);
    }

    async fn stream(&self) -> Result<u64, SendError> {
        let mut file = File::open(&self.source).await?;
        let total = file.metadata().await?.len();
        if total != self.file_size {
            warn!(task = %self.task_id, declared = self.file_size, actual = total, "source size changed since negotiation");
        }
        let depth = self.settings.pipeline_depth.max(1);
        let flush_every = self.settings.flush_interval_bytes.max(1);
        let mut sizer = ChunkSizer::from_settings(&self.settings);
        let mut throttle = ProgressThrottle::new(total);
        let mut inflight: VecDeque<InFlight> = VecDeque::with_capacity(depth + 1);
        let mut next = 0u64;
        let mut since_flush = 0u64;
        let mut last_queued = false;
        let mut reconnected = false;

        loop {
            while !last_queued && inflight.len() < depth {
                let want = sizer.current().min(total - next);
                let mut data = vec![0u8; want as usize];
                file.read_exact(&mut data).await.map_err(|e| {
                    if e.kind() == std::io::ErrorKind::UnexpectedEof {
                        SendError::SourceChanged
                    } else {
                        SendError::Source(e)
                    }
                })?;
                let is_last = next + want >= total;
                let envelope = self.chunk_envelope(next, data, is_last)?;
                debug!(task = %self.task_id, offset = next, len = want, is_last, "chunk queued");
                inflight.push_back(InFlight {
                    offset: next,
                    len: want,
                    delivery: self.messenger.send_to_peer(&self.peer, envelope),
                });
                next += want;
                since_flush += want;
                if is_last || since_flush >= flush_every {
                    inflight.push_back(InFlight {
                        offset: next,
                        len: 0,
                        delivery: self.messenger.flush(&self.peer),
                    });
                    since_flush = 0;
                }
                last_queued = is_last;
            }

            let Some(front) = inflight.pop_front() else {
                break;
            };
            if front.delivery.await {
                if front.len > 0 {
                    sizer.on_success();
                    let acked = front.offset + front.len;
                    if acked < total && throttle.should_emit(acked, false) {
                        let _ = self.events.send(WorkerEvent::progress(&self.task_id, acked));
                    }
                }
                continue;
            }

            if reconnected {
                return Err(SendError::Transport);
            }
            reconnected = true;
            inflight.clear();
            sizer.on_failure();
            warn!(task = %self.task_id, peer = %self.peer, offset = front.offset, "delivery failed; reconnecting");
            if !self.messenger.reconnect(&self.peer).await {
                return Err(SendError::Transport);
            }
            next = front.offset;
            file.seek(SeekFrom::Start(next)).await?;
            since_flush = 0;
            last_queued = false;
        }
        Ok(total)
    }

    fn chunk_envelope(
        &self,
        offset: u64,
        data: Vec<u8>,
        is_last: bool,
    ) -> Result<Envelope, SendError> {
        let chunk = match self.key {
            Some(key) if !self.encryption.is_none() => {
                let sealed =
                    cipher::seal(self.encryption, &key, self.task_id.as_str().as_bytes(), data)?;
                DataChunk::sealed(self.task_id.clone(), self.encryption, &sealed, is_last)
            }
            _ => DataChunk::plain(self.task_id.clone(), &data, is_last),
        };
        let chunk = if offset == 0 {
            chunk.with_header(&self.file_name, self.file_size, &self.metadata)
        } else {
            chunk
        };
        Ok(Envelope::new(
            &self.local,
            &self.peer,
            &Message::DataChunk(chunk.with_offset(offset)),
        )?)
    }
}
