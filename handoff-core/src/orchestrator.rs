//! The orchestrator task: sole owner of the registry, negotiation state and workers.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cipher::EncryptionType;
use crate::cleanup;
use crate::config::Settings;
use crate::engine::{Command, EngineError, OutgoingFile};
use crate::events::{EngineEvent, WorkerEvent, WorkerEventKind};
use crate::identity::{EphemeralKeypair, LocalPeer, PeerId};
use crate::negotiation;
use crate::peer::{PeerDirectory, PeerMessenger};
use crate::protocol::{
    Envelope, FileEntry, Message, RejectReason, TransferCancel, TransferRequest, TransferResponse,
};
use crate::receiver::{
    partial_path, sanitize_file_name, unique_destination, ChunkDecoder, IncomingHeader,
    InboundRouter, ReceiveJob,
};
use crate::registry::TaskRegistry;
use crate::scheduler;
use crate::sender::SendJob;
use crate::session::SessionKeyManager;
use crate::task::{
    BatchId, KnownMetadata, RequestId, TaskId, TerminationOrigin, TransferStatus, TransferTask,
};

/// An accepted batch that sees no new file for this long, with no transfer running
/// from its peer, is forgotten.
const INCOMING_BATCH_IDLE: Duration = Duration::from_secs(600);
/// How long chunks for a refused task id keep being dropped silently.
const REFUSED_ROUTE_GRACE: Duration = Duration::from_secs(30);

/// Deferred work, delivered back to the loop by timer tasks.
#[derive(Debug)]
enum Timer {
    ResponseTimeout(BatchId),
    ApprovalTimeout(RequestId),
    /// The transfer request never reached the peer.
    Undelivered(BatchId),
    Cleanup(TaskId),
    IncomingIdle(BatchId),
    ForgetRoute(TaskId),
}

enum Worker {
    Send(AbortHandle),
    /// Kept until the worker reports, even after a stop request.
    Receive {
        stop: CancellationToken,
        destination: PathBuf,
    },
}

impl Worker {
    fn stop(&self) {
        match self {
            Worker::Send(handle) => handle.abort(),
            Worker::Receive { stop, .. } => stop.cancel(),
        }
    }
}

/// Sender side of a negotiation that has not been answered yet.
struct OutgoingBatch {
    peer: PeerId,
    request_id: RequestId,
    tasks: Vec<TaskId>,
    keypair: Option<EphemeralKeypair>,
    encryption: EncryptionType,
    reply: oneshot::Sender<Result<bool, EngineError>>,
}

/// Receiver side of an accepted batch.
struct IncomingBatch {
    peer: PeerId,
    dir: PathBuf,
    expected: usize,
    finished: usize,
    /// Last time a file of this batch started or ended.
    touched: Instant,
}

struct PendingApproval {
    from: PeerId,
    request: TransferRequest,
}

pub(crate) struct Orchestrator {
    local: LocalPeer,
    settings: Arc<Settings>,
    messenger: Arc<dyn PeerMessenger>,
    directory: Arc<dyn PeerDirectory>,
    registry: TaskRegistry,
    keys: Arc<SessionKeyManager>,
    router: Arc<InboundRouter>,
    events: broadcast::Sender<EngineEvent>,
    worker_tx: mpsc::UnboundedSender<WorkerEvent>,
    worker_rx: mpsc::UnboundedReceiver<WorkerEvent>,
    timer_tx: mpsc::UnboundedSender<Timer>,
    timer_rx: mpsc::UnboundedReceiver<Timer>,
    workers: HashMap<TaskId, Worker>,
    outgoing: HashMap<BatchId, OutgoingBatch>,
    incoming: HashMap<BatchId, IncomingBatch>,
    latest_incoming: HashMap<PeerId, BatchId>,
    approvals: Vec<PendingApproval>,
    /// Destinations handed to live incoming tasks.
    reserved: HashSet<PathBuf>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        local: LocalPeer,
        settings: Settings,
        messenger: Arc<dyn PeerMessenger>,
        directory: Arc<dyn PeerDirectory>,
        registry: TaskRegistry,
        keys: Arc<SessionKeyManager>,
        router: Arc<InboundRouter>,
        events: broadcast::Sender<EngineEvent>,
    ) -> Self {
        let (worker_tx, worker_rx) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        Self {
            local,
            settings: Arc::new(settings),
            messenger,
            directory,
            registry,
            keys,
            router,
            events,
            worker_tx,
            worker_rx,
            timer_tx,
            timer_rx,
            workers: HashMap::new(),
            outgoing: HashMap::new(),
            incoming: HashMap::new(),
            latest_incoming: HashMap::new(),
            approvals: Vec::new(),
            reserved: HashSet::new(),
        }
    }

    pub(crate) async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.stop_all();
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.on_command(command).await,
                    None => {
                        self.stop_all();
                        break;
                    }
                },
                Some(event) = self.worker_rx.recv() => self.on_worker_event(event).await,
                Some(timer) = self.timer_rx.recv() => self.on_timer(timer).await,
            }
        }
        info!(peer = %self.local.id, "transfer engine stopped");
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Propose {
                peer,
                files,
                encrypt,
                reply,
            } => self.on_propose(peer, files, encrypt, reply).await,
            Command::Respond {
                request_id,
                accept,
                reply,
            } => {
                let result = self.on_respond(&request_id, accept).await;
                let _ = reply.send(result);
            }
            Command::Cancel { id, reply } => {
                let result = self.cancel_task(&id).await;
                let _ = reply.send(result);
            }
            Command::Clear { id, reply } => {
                let result = self.clear_task(&id).await;
                let _ = reply.send(result);
            }
            Command::ClearFinished { reply } => {
                let ids: Vec<TaskId> = self
                    .registry
                    .query(|t| t.status.is_terminal())
                    .into_iter()
                    .map(|t| t.id.clone())
                    .collect();
                for id in &ids {
                    self.remove_task(id).await;
                }
                let _ = reply.send(ids.len());
            }
            Command::Tasks { reply } => {
                let _ = reply.send(self.registry.iter().cloned().collect());
            }
            Command::Task { id, reply } => {
                let _ = reply.send(self.registry.get(&id).cloned());
            }
            Command::PendingApprovals { reply } => {
                let _ = reply.send(self.approvals.iter().map(|a| a.request.clone()).collect());
            }
            Command::UpdateSettings(settings) => {
                info!("settings updated");
                self.settings = Arc::new(settings);
                self.admit().await;
            }
            Command::Inbound { from, message } => match message {
                Message::TransferRequest(request) => self.on_transfer_request(from, request).await,
                Message::TransferResponse(response) => {
                    self.on_transfer_response(from, response).await
                }
                Message::Cancel(TransferCancel { task_id }) => {
                    self.on_peer_cancel(&from, &task_id).await
                }
                Message::DataChunk(chunk) => {
                    warn!(task = %chunk.task_id, "chunk reached orchestrator; dropped")
                }
            },
            Command::OpenIncoming { from, header } => self.on_first_chunk(from, header).await,
            Command::Shutdown { .. } => {}
        }
    }

    // ---- negotiation, sending side ----

    async fn on_propose(
        &mut self,
        peer: PeerId,
        files: Vec<OutgoingFile>,
        encrypt: bool,
        reply: oneshot::Sender<Result<bool, EngineError>>,
    ) {
        if !self.directory.is_paired(&peer) || self.directory.is_blocked(&peer) {
            let _ = reply.send(Err(EngineError::NotPaired(peer)));
            return;
        }
        let batch_id = BatchId::generate();
        let peer_name = self
            .directory
            .display_name(&peer)
            .unwrap_or_else(|| peer.to_string());
        let entries = files
            .iter()
            .map(|f| FileEntry {
                name: f.name.clone(),
                size: f.size,
            })
            .collect();
        let (request, keypair) = negotiation::build_request(
            &self.local.id,
            &self.local.name,
            batch_id.clone(),
            entries,
            &self.settings,
            encrypt,
        );
        let mut tasks = Vec::with_capacity(files.len());
        for file in files {
            let task = TransferTask::outgoing(
                batch_id.clone(),
                file.path,
                file.name,
                file.size,
                peer.clone(),
                peer_name.clone(),
            );
            tasks.push(task.id.clone());
            if self.registry.insert_if_absent(task.clone()).await {
                self.emit(EngineEvent::TaskUpdated(task));
            }
        }
        info!(
            peer = %peer,
            batch = %batch_id,
            files = tasks.len(),
            total = request.total_size,
            encrypt,
            "proposing batch"
        );
        let encryption = if encrypt {
            self.settings.encryption.or_aead()
        } else {
            EncryptionType::None
        };
        let request_id = request.request_id.clone();
        self.send_control(
            &peer,
            Message::TransferRequest(request),
            Some(Timer::Undelivered(batch_id.clone())),
        );
        self.after(
            self.settings.response_timeout(),
            Timer::ResponseTimeout(batch_id.clone()),
        );
        self.outgoing.insert(
            batch_id,
            OutgoingBatch {
                peer,
                request_id,
                tasks,
                keypair,
                encryption,
                reply,
            },
        );
    }

    async fn on_transfer_response(&mut self, from: PeerId, response: TransferResponse) {
        let batch = match self.outgoing.remove(&response.batch_id) {
            Some(b) if b.peer == from && b.request_id == response.request_id => b,
            Some(b) => {
                warn!(peer = %from, batch = %response.batch_id, "response does not match request");
                self.outgoing.insert(response.batch_id, b);
                return;
            }
            None => {
                debug!(peer = %from, batch = %response.batch_id, "response for unknown batch");
                return;
            }
        };

        if !response.accepted {
            let reason = response.reject_reason.unwrap_or(RejectReason::Unknown);
            let message = response
                .reject_message
                .clone()
                .unwrap_or_else(|| reason.describe().to_string());
            info!(peer = %from, batch = %response.batch_id, ?reason, "batch rejected");
            for id in &batch.tasks {
                self.finish(id, TransferStatus::Rejected, TerminationOrigin::Peer, Some(message.clone()))
                    .await;
            }
            self.resolve(batch, response.batch_id, false);
            return;
        }

        if !batch.encryption.is_none() {
            match response.session_key_b64.as_deref() {
                Some(material) => {
                    match negotiation::accept_session_key(batch.keypair.as_ref(), material) {
                        Ok(key) => self.keys.set_outbound(from.clone(), key),
                        Err(e) => warn!(peer = %from, error = %e, "unusable session key material"),
                    }
                }
                None => warn!(peer = %from, "peer accepted without a session key"),
            }
        }
        let encryption = if self.keys.outbound(&from).is_some() {
            batch.encryption
        } else {
            EncryptionType::None
        };
        info!(peer = %from, batch = %response.batch_id, ?encryption, "batch accepted");
        for id in &batch.tasks {
            self.registry.update(id, |t| t.encryption = encryption).await;
            match self.registry.transition(id, TransferStatus::Pending).await {
                Ok(task) => self.emit(EngineEvent::TaskUpdated(task)),
                Err(e) => debug!(task = %id, error = %e, "task left before acceptance"),
            }
        }
        self.resolve(batch, response.batch_id, true);
        self.admit().await;
    }

    async fn on_batch_expired(&mut self, batch_id: BatchId, status: TransferStatus, reason: &str) {
        let Some(batch) = self.outgoing.remove(&batch_id) else {
            return;
        };
        warn!(peer = %batch.peer, batch = %batch_id, reason, "batch abandoned");
        for id in &batch.tasks {
            self.finish(id, status, TerminationOrigin::System, Some(reason.to_string()))
                .await;
        }
        self.resolve(batch, batch_id, false);
    }

    fn resolve(&self, batch: OutgoingBatch, batch_id: BatchId, accepted: bool) {
        let _ = batch.reply.send(Ok(accepted));
        self.emit(EngineEvent::BatchResolved { batch_id, accepted });
    }

    // ---- negotiation, receiving side ----

    async fn on_transfer_request(&mut self, from: PeerId, request: TransferRequest) {
        if request.from_id != from {
            warn!(peer = %from, claimed = %request.from_id, "request sender mismatch; using transport identity");
        }
        if self
            .approvals
            .iter()
            .any(|a| a.request.request_id == request.request_id)
        {
            debug!(request = %request.request_id, "duplicate request ignored");
            return;
        }
        if let Err(reason) =
            negotiation::validate_request(&from, &request, &self.settings, self.directory.as_ref())
        {
            info!(peer = %from, request = %request.request_id, ?reason, "request rejected");
            self.send_control(
                &from,
                Message::TransferResponse(negotiation::reject(&request, reason)),
                None,
            );
            return;
        }
        if self.directory.is_trusted(&from) {
            self.accept_request(from, request).await;
            return;
        }
        info!(peer = %from, request = %request.request_id, files = request.files.len(), "request awaiting approval");
        self.after(
            self.settings.approval_timeout(),
            Timer::ApprovalTimeout(request.request_id.clone()),
        );
        self.approvals.push(PendingApproval {
            from,
            request: request.clone(),
        });
        self.emit(EngineEvent::ApprovalRequested(request));
    }

    async fn on_respond(&mut self, request_id: &RequestId, accept: bool) -> Result<(), EngineError> {
        let pos = self
            .approvals
            .iter()
            .position(|a| &a.request.request_id == request_id)
            .ok_or_else(|| EngineError::UnknownRequest(request_id.clone()))?;
        let approval = self.approvals.remove(pos);
        if accept {
            self.accept_request(approval.from, approval.request).await;
        } else {
            info!(peer = %approval.from, request = %request_id, "request declined by user");
            self.send_control(
                &approval.from,
                Message::TransferResponse(negotiation::reject(
                    &approval.request,
                    RejectReason::UserRejected,
                )),
                None,
            );
        }
        Ok(())
    }

    async fn accept_request(&mut self, from: PeerId, request: TransferRequest) {
        let peer_name = self
            .directory
            .display_name(&from)
            .unwrap_or_else(|| request.from_name.clone());
        let dir = negotiation::destination_dir(&self.settings, &from, &peer_name);
        let response = match negotiation::prepare_destination(&dir).await {
            Err(reason) => negotiation::reject(&request, reason),
            Ok(()) => {
                let material = if request.use_encryption {
                    negotiation::session_key_material(
                        &self.keys,
                        &from,
                        request.public_key_b64.as_deref(),
                    )
                    .map(Some)
                } else {
                    Ok(None)
                };
                match material {
                    Ok(material) => {
                        self.incoming.insert(
                            request.batch_id.clone(),
                            IncomingBatch {
                                peer: from.clone(),
                                dir: dir.clone(),
                                expected: request.files.len(),
                                finished: 0,
                                touched: Instant::now(),
                            },
                        );
                        self.latest_incoming
                            .insert(from.clone(), request.batch_id.clone());
                        self.after(
                            INCOMING_BATCH_IDLE,
                            Timer::IncomingIdle(request.batch_id.clone()),
                        );
                        info!(peer = %from, batch = %request.batch_id, dir = %dir.display(), "request accepted");
                        negotiation::accept(&request, &dir, material)
                    }
                    Err(e) => {
                        warn!(peer = %from, error = %e, "session key exchange failed");
                        negotiation::reject(&request, RejectReason::Unknown)
                    }
                }
            }
        };
        self.send_control(&from, Message::TransferResponse(response), None);
    }

    async fn on_approval_timeout(&mut self, request_id: RequestId) {
        let Some(pos) = self
            .approvals
            .iter()
            .position(|a| a.request.request_id == request_id)
        else {
            return;
        };
        let approval = self.approvals.remove(pos);
        info!(peer = %approval.from, request = %request_id, "approval timed out");
        self.send_control(
            &approval.from,
            Message::TransferResponse(negotiation::reject(&approval.request, RejectReason::Timeout)),
            None,
        );
    }

    // ---- incoming data ----

    async fn on_first_chunk(&mut self, from: PeerId, header: IncomingHeader) {
        let id = header.task_id.clone();
        if self.registry.contains(&id) {
            debug!(task = %id, "chunk header for a known task; route closed");
            self.router.close(&id);
            return;
        }
        if !self.directory.is_paired(&from) || self.directory.is_blocked(&from) {
            warn!(task = %id, peer = %from, "data from unpaired or blocked peer refused");
            self.refuse(&id);
            return;
        }
        let known = KnownMetadata::parse(&header.metadata);
        let peer_name = self
            .directory
            .display_name(&from)
            .unwrap_or_else(|| from.to_string());
        let batch_dir = match self
            .negotiated_batch(&from, known.batch_id.as_ref())
            .and_then(|b| self.incoming.get_mut(&b))
        {
            Some(batch) => {
                batch.touched = Instant::now();
                batch.dir.clone()
            }
            None => {
                let dir = negotiation::destination_dir(&self.settings, &from, &peer_name);
                if negotiation::prepare_destination(&dir).await.is_err() {
                    self.refuse(&id);
                    return;
                }
                dir
            }
        };
        let file_name = sanitize_file_name(&header.file_name);
        let (dir, name) = match &known.sync_file_path {
            Some(rel) => {
                let target = batch_dir.join(rel);
                let name = target
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| file_name.clone());
                let dir = target
                    .parent()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| batch_dir.clone());
                (dir, name)
            }
            None => (batch_dir, file_name.clone()),
        };
        let reserved = &self.reserved;
        let destination = unique_destination(&dir, &name, |p| {
            reserved.contains(p) || p.exists() || partial_path(p).exists()
        });
        let task = TransferTask::incoming(
            id.clone(),
            file_name,
            header.file_size,
            destination.clone(),
            from.clone(),
            peer_name,
            header.metadata,
        );
        if !self.registry.insert_if_absent(task.clone()).await {
            self.router.close(&id);
            return;
        }
        self.reserved.insert(destination.clone());
        info!(task = %id, peer = %from, path = %destination.display(), size = header.file_size, "incoming file");
        self.emit(EngineEvent::TaskUpdated(task));

        let (tx, rx) = mpsc::unbounded_channel();
        let stop = CancellationToken::new();
        let job = ReceiveJob {
            task_id: id.clone(),
            peer: from,
            destination: destination.clone(),
            declared_size: header.file_size,
            decoder: ChunkDecoder::new(self.keys.clone(), self.settings.legacy_key()),
            events: self.worker_tx.clone(),
            stop: stop.clone(),
        };
        tokio::spawn(job.run(rx));
        self.workers
            .insert(id.clone(), Worker::Receive { stop, destination });
        if !self.router.open(&id, tx) {
            self.stop_worker(&id);
            self.finish(
                &id,
                TransferStatus::Cancelled,
                TerminationOrigin::Peer,
                Some("cancelled by sender".to_string()),
            )
            .await;
        }
    }

    /// Accepted batch a chunk belongs to, falling back to the peer's latest batch.
    fn negotiated_batch(&self, from: &PeerId, batch_id: Option<&BatchId>) -> Option<BatchId> {
        batch_id
            .filter(|b| self.incoming.get(*b).is_some_and(|batch| &batch.peer == from))
            .or_else(|| self.latest_incoming.get(from))
            .filter(|b| self.incoming.contains_key(*b))
            .cloned()
    }

    /// Refuse a task before it exists. Its tombstone outlives the chunks already in flight.
    fn refuse(&self, id: &TaskId) {
        self.router.close(id);
        self.after(REFUSED_ROUTE_GRACE, Timer::ForgetRoute(id.clone()));
    }

    // ---- cancellation and removal ----

    async fn cancel_task(&mut self, id: &TaskId) -> Result<(), EngineError> {
        let task = self
            .registry
            .get(id)
            .ok_or_else(|| EngineError::UnknownTask(id.clone()))?;
        if task.status.is_terminal() {
            return Ok(());
        }
        let peer = task.peer_id.clone();
        self.stop_worker(id);
        self.send_control(
            &peer,
            Message::Cancel(TransferCancel {
                task_id: id.clone(),
            }),
            None,
        );
        self.finish(
            id,
            TransferStatus::Cancelled,
            TerminationOrigin::User,
            Some("cancelled by user".to_string()),
        )
        .await;
        Ok(())
    }

    async fn on_peer_cancel(&mut self, from: &PeerId, id: &TaskId) {
        let Some(task) = self.registry.get(id) else {
            debug!(task = %id, peer = %from, "cancel for unknown task");
            return;
        };
        if &task.peer_id != from || task.status.is_terminal() {
            return;
        }
        let message = if task.is_outgoing() {
            "cancelled by receiver"
        } else {
            "cancelled by sender"
        };
        self.stop_worker(id);
        self.finish(
            id,
            TransferStatus::Cancelled,
            TerminationOrigin::Peer,
            Some(message.to_string()),
        )
        .await;
    }

    async fn clear_task(&mut self, id: &TaskId) -> Result<(), EngineError> {
        self.cancel_task(id).await?;
        self.remove_task(id).await;
        Ok(())
    }

    async fn remove_task(&mut self, id: &TaskId) {
        if let Some(task) = self.registry.remove(id).await {
            self.router.forget(id);
            if let Some(path) = &task.save_path {
                self.reserved.remove(path);
            }
            debug!(task = %id, "task removed");
            self.emit(EngineEvent::TaskRemoved(id.clone()));
        }
    }

    /// Outgoing workers are aborted. Incoming ones discard queued chunks and their partial file.
    fn stop_worker(&mut self, id: &TaskId) {
        if let Some(worker) = self.workers.get(id) {
            worker.stop();
        }
        if self.registry.get(id).is_some_and(|t| t.is_outgoing()) {
            self.workers.remove(id);
        } else {
            self.router.close(id);
        }
    }

    fn stop_all(&mut self) {
        self.router.close_all();
        for (_, worker) in self.workers.drain() {
            worker.stop();
        }
    }

    // ---- workers ----

    async fn on_worker_event(&mut self, event: WorkerEvent) {
        let id = event.task_id;
        match event.kind {
            WorkerEventKind::Progress { bytes } => {
                if let Some(task) = self.registry.record_progress(&id, bytes) {
                    self.emit(EngineEvent::TaskUpdated(task));
                }
            }
            WorkerEventKind::Stopped => {
                self.workers.remove(&id);
            }
            WorkerEventKind::Completed { bytes } => {
                let worker = self.workers.remove(&id);
                if !self.is_transferring(&id) {
                    // Finished after its task was stopped: the file must not stay.
                    if let Some(Worker::Receive { destination, .. }) = worker {
                        discard_late_file(&id, &destination).await;
                    }
                    return;
                }
                self.registry
                    .update(&id, |t| {
                        t.file_size = bytes;
                        t.transferred_bytes = bytes;
                    })
                    .await;
                self.finish(&id, TransferStatus::Completed, TerminationOrigin::System, None)
                    .await;
            }
            WorkerEventKind::Failed { message } => {
                self.workers.remove(&id);
                let Some(task) = self.registry.get(&id) else {
                    return;
                };
                if task.status != TransferStatus::Transferring {
                    return;
                }
                error!(task = %id, peer = %task.peer_id, error = %message, "transfer failed");
                let peer = task.peer_id.clone();
                self.send_control(
                    &peer,
                    Message::Cancel(TransferCancel {
                        task_id: id.clone(),
                    }),
                    None,
                );
                self.finish(
                    &id,
                    TransferStatus::Failed,
                    TerminationOrigin::System,
                    Some(message),
                )
                .await;
            }
        }
    }

    fn is_transferring(&self, id: &TaskId) -> bool {
        self.registry
            .get(id)
            .is_some_and(|t| t.status == TransferStatus::Transferring)
    }

    /// Promote pending outgoing tasks up to the concurrency cap.
    async fn admit(&mut self) {
        let admitted = scheduler::admit_next(self.registry.iter(), self.settings.max_concurrent());
        for id in admitted {
            match self.registry.transition(&id, TransferStatus::Transferring).await {
                Ok(task) => {
                    debug!(task = %id, "admitted");
                    self.emit(EngineEvent::TaskUpdated(task.clone()));
                    self.spawn_sender(task);
                }
                Err(e) => warn!(task = %id, error = %e, "cannot admit task"),
            }
        }
    }

    fn spawn_sender(&mut self, task: TransferTask) {
        let Some(source) = task.source_path.clone() else {
            let _ = self
                .worker_tx
                .send(WorkerEvent::failed(&task.id, "task has no source file"));
            return;
        };
        let key = if task.encryption.is_none() {
            None
        } else {
            self.keys.outbound(&task.peer_id)
        };
        let job = SendJob {
            task_id: task.id.clone(),
            local: self.local.id.clone(),
            peer: task.peer_id,
            source,
            file_name: task.file_name,
            file_size: task.file_size,
            metadata: task.metadata,
            encryption: task.encryption,
            key,
            settings: self.settings.clone(),
            messenger: self.messenger.clone(),
            events: self.worker_tx.clone(),
        };
        let handle = tokio::spawn(job.run());
        self.workers
            .insert(task.id, Worker::Send(handle.abort_handle()));
    }

    /// Terminal transition with its side effects: route and path release, batch
    /// bookkeeping, events, cleanup scheduling and admission of queued tasks.
    async fn finish(
        &mut self,
        id: &TaskId,
        status: TransferStatus,
        origin: TerminationOrigin,
        message: Option<String>,
    ) {
        let task = match self.registry.terminate(id, status, origin, message).await {
            Ok(task) => task,
            Err(e) => {
                debug!(task = %id, error = %e, "already settled");
                return;
            }
        };
        info!(task = %id, peer = %task.peer_id, status = ?task.status, ?origin, "task finished");
        if !task.is_outgoing() {
            self.router.close(id);
            if let Some(path) = &task.save_path {
                self.reserved.remove(path);
            }
            self.note_incoming_finished(&task);
        }
        if cleanup::should_cleanup(&self.settings.cleanup, &task) {
            cleanup::schedule_cleanup(
                self.settings.cleanup.delay(),
                self.timer_tx.clone(),
                Timer::Cleanup(id.clone()),
            );
        }
        let outgoing = task.is_outgoing();
        self.emit(EngineEvent::TaskUpdated(task));
        if outgoing {
            self.admit().await;
        }
    }

    fn note_incoming_finished(&mut self, task: &TransferTask) {
        let Some(batch_id) = &task.batch_id else {
            return;
        };
        let Some(batch) = self.incoming.get_mut(batch_id) else {
            return;
        };
        batch.finished += 1;
        batch.touched = Instant::now();
        if batch.finished >= batch.expected {
            debug!(batch = %batch_id, peer = %batch.peer, "incoming batch complete");
            self.forget_incoming(batch_id);
        }
    }

    fn forget_incoming(&mut self, batch_id: &BatchId) {
        if let Some(batch) = self.incoming.remove(batch_id) {
            if self.latest_incoming.get(&batch.peer) == Some(batch_id) {
                self.latest_incoming.remove(&batch.peer);
            }
        }
    }

    /// Forget an accepted batch whose remaining files never arrived, e.g. because the
    /// sender cancelled them before they started.
    fn on_incoming_idle(&mut self, batch_id: BatchId) {
        let Some(batch) = self.incoming.get(&batch_id) else {
            return;
        };
        let busy = self.registry.iter().any(|t| {
            !t.is_outgoing() && t.peer_id == batch.peer && t.status == TransferStatus::Transferring
        });
        let idle = batch.touched.elapsed();
        if busy || idle < INCOMING_BATCH_IDLE {
            let wait = if busy {
                INCOMING_BATCH_IDLE
            } else {
                INCOMING_BATCH_IDLE - idle
            };
            self.after(wait, Timer::IncomingIdle(batch_id));
            return;
        }
        info!(batch = %batch_id, peer = %batch.peer, received = batch.finished, expected = batch.expected, "incoming batch expired");
        self.forget_incoming(&batch_id);
    }

    // ---- timers and messaging ----

    async fn on_timer(&mut self, timer: Timer) {
        match timer {
            Timer::ResponseTimeout(batch_id) => {
                self.on_batch_expired(
                    batch_id,
                    TransferStatus::Cancelled,
                    RejectReason::Timeout.describe(),
                )
                .await
            }
            Timer::Undelivered(batch_id) => {
                self.on_batch_expired(batch_id, TransferStatus::Failed, "peer unreachable")
                    .await
            }
            Timer::ApprovalTimeout(request_id) => self.on_approval_timeout(request_id).await,
            Timer::Cleanup(id) => {
                if self
                    .registry
                    .get(&id)
                    .is_some_and(|t| t.status.is_terminal())
                {
                    self.remove_task(&id).await;
                }
            }
            Timer::IncomingIdle(batch_id) => self.on_incoming_idle(batch_id),
            Timer::ForgetRoute(id) => {
                if !self.registry.contains(&id) {
                    self.router.forget(&id);
                }
            }
        }
    }

    fn after(&self, delay: Duration, timer: Timer) {
        let timers = self.timer_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = timers.send(timer);
        });
    }

    /// Queue a negotiation or cancel message. `on_failure` is delivered if the transport drops it.
    fn send_control(&self, peer: &PeerId, message: Message, on_failure: Option<Timer>) {
        let kind = message.kind();
        let envelope = match Envelope::new(&self.local.id, peer, &message) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!(peer = %peer, ?kind, error = %e, "cannot encode message");
                return;
            }
        };
        let delivery = self.messenger.send_to_peer(peer, envelope);
        let timers = self.timer_tx.clone();
        let peer = peer.clone();
        tokio::spawn(async move {
            if !delivery.await {
                warn!(peer = %peer, ?kind, "message not delivered");
                if let Some(timer) = on_failure {
                    let _ = timers.send(timer);
                }
            }
        });
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }
}

async fn discard_late_file(id: &TaskId, path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => info!(task = %id, path = %path.display(), "file of a stopped task removed"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(task = %id, path = %path.display(), error = %e, "cannot remove file of a stopped task"),
    }
}
