//! Public entry point: a cloneable handle to the transfer orchestrator.
//!
//! Every operation is a message to the orchestrator task, which is the only writer of the
//! task registry. Inbound data chunks bypass it once their task exists.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::cleanup;
use crate::config::Settings;
use crate::events::EngineEvent;
use crate::identity::{LocalPeer, PeerId};
use crate::orchestrator::Orchestrator;
use crate::peer::{PeerDirectory, PeerMessenger};
use crate::protocol::{Envelope, Message, TransferRequest};
use crate::receiver::{partial_path, IncomingHeader, InboundRouter, Offer};
use crate::registry::{StoreError, TaskRegistry, TaskStore};
use crate::session::SessionKeyManager;
use crate::task::{RequestId, TaskId, TerminationOrigin, TransferStatus, TransferTask};

const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("engine stopped")]
    Stopped,
    #[error("unknown task {0}")]
    UnknownTask(TaskId),
    #[error("unknown request {0}")]
    UnknownRequest(RequestId),
    #[error("peer {0} is not paired")]
    NotPaired(PeerId),
    #[error("no files to send")]
    EmptyBatch,
    #[error("cannot read {}: {source}", .path.display())]
    Source {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("task store: {0}")]
    Store(#[from] StoreError),
}

/// A local file offered in a batch.
#[derive(Debug, Clone)]
pub(crate) struct OutgoingFile {
    pub path: PathBuf,
    pub name: String,
    pub size: u64,
}

pub(crate) enum Command {
    Propose {
        peer: PeerId,
        files: Vec<OutgoingFile>,
        encrypt: bool,
        reply: oneshot::Sender<Result<bool, EngineError>>,
    },
    Respond {
        request_id: RequestId,
        accept: bool,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Cancel {
        id: TaskId,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Clear {
        id: TaskId,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    ClearFinished {
        reply: oneshot::Sender<usize>,
    },
    Tasks {
        reply: oneshot::Sender<Vec<TransferTask>>,
    },
    Task {
        id: TaskId,
        reply: oneshot::Sender<Option<TransferTask>>,
    },
    PendingApprovals {
        reply: oneshot::Sender<Vec<TransferRequest>>,
    },
    UpdateSettings(Settings),
    /// Negotiation and cancel messages from a peer.
    Inbound {
        from: PeerId,
        message: Message,
    },
    /// First chunk of an unknown task; its route is buffering.
    OpenIncoming {
        from: PeerId,
        header: IncomingHeader,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to a running engine. Cheap to clone; the engine stops when every handle is dropped
/// or [`TransferEngine::shutdown`] is called.
#[derive(Clone)]
pub struct TransferEngine {
    local: LocalPeer,
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<EngineEvent>,
    router: Arc<InboundRouter>,
    keys: Arc<SessionKeyManager>,
}

impl TransferEngine {
    /// Load persisted tasks, settle the ones a previous run left behind, and spawn the orchestrator.
    pub async fn start(
        local: LocalPeer,
        settings: Settings,
        messenger: Arc<dyn PeerMessenger>,
        directory: Arc<dyn PeerDirectory>,
        store: Arc<dyn TaskStore>,
    ) -> Result<Self, EngineError> {
        let mut registry = TaskRegistry::new(store);
        let loaded = registry.load().await?;
        recover(&mut registry, &settings).await;
        info!(peer = %local.id, loaded, kept = registry.len(), "transfer engine starting");

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let router = Arc::new(InboundRouter::new());
        let keys = Arc::new(SessionKeyManager::new());
        let orchestrator = Orchestrator::new(
            local.clone(),
            settings,
            messenger,
            directory,
            registry,
            keys.clone(),
            router.clone(),
            events.clone(),
        );
        tokio::spawn(orchestrator.run(command_rx));
        Ok(Self {
            local,
            commands,
            events,
            router,
            keys,
        })
    }

    pub fn local(&self) -> &LocalPeer {
        &self.local
    }

    /// Offer `files` to `peer` as one batch. Resolves once the peer answered or the
    /// response timeout elapsed: `true` if accepted.
    pub async fn propose_batch(
        &self,
        peer: &PeerId,
        files: Vec<PathBuf>,
        encrypt: bool,
    ) -> Result<bool, EngineError> {
        if files.is_empty() {
            return Err(EngineError::EmptyBatch);
        }
        let mut outgoing = Vec::with_capacity(files.len());
        for path in files {
            let meta = match tokio::fs::metadata(&path).await {
                Ok(meta) if meta.is_file() => meta,
                Ok(_) => {
                    return Err(EngineError::Source {
                        path,
                        source: std::io::Error::new(
                            std::io::ErrorKind::InvalidInput,
                            "not a regular file",
                        ),
                    })
                }
                Err(source) => return Err(EngineError::Source { path, source }),
            };
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "file".to_string());
            outgoing.push(OutgoingFile {
                path,
                name,
                size: meta.len(),
            });
        }
        self.call(|reply| Command::Propose {
            peer: peer.clone(),
            files: outgoing,
            encrypt,
            reply,
        })
        .await?
    }

    /// Answer a request that is waiting for approval.
    pub async fn respond_to_request(
        &self,
        request_id: &RequestId,
        accept: bool,
    ) -> Result<(), EngineError> {
        self.call(|reply| Command::Respond {
            request_id: request_id.clone(),
            accept,
            reply,
        })
        .await?
    }

    /// Cancel a task and tell the peer. A no-op for terminal tasks.
    pub async fn cancel(&self, id: &TaskId) -> Result<(), EngineError> {
        self.call(|reply| Command::Cancel {
            id: id.clone(),
            reply,
        })
        .await?
    }

    /// Remove a task, cancelling it first if it is still active.
    pub async fn clear(&self, id: &TaskId) -> Result<(), EngineError> {
        self.call(|reply| Command::Clear {
            id: id.clone(),
            reply,
        })
        .await?
    }

    /// Remove every terminal task. Returns how many were removed.
    pub async fn clear_finished(&self) -> Result<usize, EngineError> {
        self.call(|reply| Command::ClearFinished { reply }).await
    }

    pub async fn tasks(&self) -> Result<Vec<TransferTask>, EngineError> {
        self.call(|reply| Command::Tasks { reply }).await
    }

    pub async fn task(&self, id: &TaskId) -> Result<Option<TransferTask>, EngineError> {
        self.call(|reply| Command::Task {
            id: id.clone(),
            reply,
        })
        .await
    }

    pub async fn pending_approvals(&self) -> Result<Vec<TransferRequest>, EngineError> {
        self.call(|reply| Command::PendingApprovals { reply }).await
    }

    /// Replace the settings. Running workers keep the snapshot they started with.
    pub fn update_settings(&self, settings: Settings) -> Result<(), EngineError> {
        self.send(Command::UpdateSettings(settings))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn session_keys(&self) -> Arc<SessionKeyManager> {
        self.keys.clone()
    }

    /// Entry point for every envelope the transport receives. Chunks are routed in call
    /// order, so a transport must call this sequentially per connection.
    pub fn handle_message(&self, envelope: Envelope) -> Result<(), EngineError> {
        if envelope.to_id != self.local.id {
            warn!(to = %envelope.to_id, from = %envelope.from_id, "message for another peer dropped");
            return Ok(());
        }
        let from = envelope.from_id.clone();
        let message = match envelope.into_message() {
            Ok(message) => message,
            Err(e) => {
                warn!(from = %from, error = %e, "malformed message dropped");
                return Ok(());
            }
        };
        match message {
            Message::DataChunk(chunk) => {
                let task_id = chunk.task_id.clone();
                match self.router.offer(&from, chunk) {
                    Offer::Create(header) => self.send(Command::OpenIncoming { from, header }),
                    Offer::Delivered | Offer::Buffered => Ok(()),
                    Offer::Dropped => {
                        debug!(task = %task_id, from = %from, "chunk dropped");
                        Ok(())
                    }
                }
            }
            message => self.send(Command::Inbound { from, message }),
        }
    }

    /// Stop workers and the orchestrator. Active tasks are left as they are and will be
    /// marked interrupted on the next start.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        self.call(|reply| Command::Shutdown { reply }).await
    }

    fn send(&self, command: Command) -> Result<(), EngineError> {
        self.commands.send(command).map_err(|_| EngineError::Stopped)
    }

    async fn call<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.send(command(tx))?;
        rx.await.map_err(|_| EngineError::Stopped)
    }
}

/// Fail tasks that were live when the previous process stopped, then apply the startup purge.
async fn recover(registry: &mut TaskRegistry, settings: &Settings) {
    for id in cleanup::interrupted(registry.iter()) {
        match registry
            .terminate(
                &id,
                TransferStatus::Failed,
                TerminationOrigin::System,
                Some(cleanup::INTERRUPTED.to_string()),
            )
            .await
        {
            Ok(task) => {
                if let Some(save_path) = &task.save_path {
                    let _ = tokio::fs::remove_file(partial_path(save_path)).await;
                }
                info!(task = %id, "marked interrupted");
            }
            Err(e) => warn!(task = %id, error = %e, "cannot settle stale task"),
        }
    }
    for id in cleanup::purge_targets(settings.startup_purge, registry.iter()) {
        registry.remove(&id).await;
    }
}
