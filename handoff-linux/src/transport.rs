//! TCP transport: hello line, then length-prefixed JSON frames. One writer queue per peer.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use handoff_core::wire::{decode_frame, encode_frame, frame_len, FrameDecodeError};
use handoff_core::{Delivery, DeliveryHandle, Envelope, PeerId, PeerMessenger, TransferEngine};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const HELLO_PREFIX: &str = "HANDOFF ";
const HELLO_MAX: u64 = 256;
const LEN_SIZE: usize = 4;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const WRITE_BUFFER: usize = 256 * 1024;

enum Outgoing {
    Frame(Vec<u8>, DeliveryHandle),
    /// Resolves once everything queued before it reached the socket.
    Flush(DeliveryHandle),
}

type Queue = mpsc::UnboundedSender<Outgoing>;

struct Shared {
    local: PeerId,
    /// Known peers; only these may connect. Peers without an address are never dialed.
    peers: HashMap<PeerId, Option<SocketAddr>>,
    writers: Mutex<HashMap<PeerId, Queue>>,
    engine: OnceLock<TransferEngine>,
}

#[derive(Clone)]
pub struct TcpTransport {
    shared: Arc<Shared>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl TcpTransport {
    pub fn new(local: PeerId, peers: HashMap<PeerId, Option<SocketAddr>>) -> Self {
        Self {
            shared: Arc::new(Shared {
                local,
                peers,
                writers: Mutex::new(HashMap::new()),
                engine: OnceLock::new(),
            }),
        }
    }

    /// Route inbound frames to `engine`. Frames arriving before this are dropped.
    pub fn attach(&self, engine: TransferEngine) {
        if self.shared.engine.set(engine).is_err() {
            warn!("engine already attached");
        }
    }

    /// Accept inbound connections until the listener fails.
    pub async fn listen(self, port: u16) -> std::io::Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        info!(port, "transport listening");
        loop {
            let (stream, addr) = listener.accept().await?;
            let shared = self.shared.clone();
            tokio::spawn(async move {
                if let Err(e) = accept(shared, stream).await {
                    debug!(%addr, error = %e, "inbound connection closed");
                }
            });
        }
    }

    /// Live queue for `peer`, dialing lazily when there is none.
    fn queue(&self, peer: &PeerId) -> Queue {
        let mut writers = lock(&self.shared.writers);
        if let Some(tx) = writers.get(peer).filter(|tx| !tx.is_closed()) {
            return tx.clone();
        }
        let (tx, rx) = mpsc::unbounded_channel();
        writers.insert(peer.clone(), tx.clone());
        tokio::spawn(dial(self.shared.clone(), peer.clone(), rx));
        tx
    }
}

#[async_trait]
impl PeerMessenger for TcpTransport {
    fn send_to_peer(&self, peer: &PeerId, envelope: Envelope) -> Delivery {
        let frame = match encode_frame(&envelope) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(peer = %peer, error = %e, "cannot frame message");
                return Delivery::ready(false);
            }
        };
        let (handle, delivery) = Delivery::pending();
        // A rejected item drops its handle, which fails the delivery.
        let _ = self.queue(peer).send(Outgoing::Frame(frame, handle));
        delivery
    }

    fn flush(&self, peer: &PeerId) -> Delivery {
        let (handle, delivery) = Delivery::pending();
        let _ = self.queue(peer).send(Outgoing::Flush(handle));
        delivery
    }

    async fn reconnect(&self, peer: &PeerId) -> bool {
        lock(&self.shared.writers).remove(peer);
        let Some(addr) = self.shared.peers.get(peer).copied().flatten() else {
            return false;
        };
        match connect(&self.shared.local, addr).await {
            Ok((reader, writer)) => {
                let (tx, rx) = mpsc::unbounded_channel();
                lock(&self.shared.writers).insert(peer.clone(), tx);
                spawn_reader(self.shared.clone(), peer.clone(), reader);
                tokio::spawn(write_loop(peer.clone(), writer, rx));
                info!(peer = %peer, %addr, "reconnected");
                true
            }
            Err(e) => {
                warn!(peer = %peer, %addr, error = %e, "reconnect failed");
                false
            }
        }
    }
}

async fn dial(shared: Arc<Shared>, peer: PeerId, rx: mpsc::UnboundedReceiver<Outgoing>) {
    let Some(addr) = shared.peers.get(&peer).copied().flatten() else {
        warn!(peer = %peer, "no address for peer; messages dropped");
        return;
    };
    match connect(&shared.local, addr).await {
        Ok((reader, writer)) => {
            debug!(peer = %peer, %addr, "connected");
            spawn_reader(shared.clone(), peer.clone(), reader);
            write_loop(peer, writer, rx).await;
        }
        Err(e) => warn!(peer = %peer, %addr, error = %e, "connect failed"),
    }
}

async fn connect(
    local: &PeerId,
    addr: SocketAddr,
) -> std::io::Result<(BufReader<OwnedReadHalf>, OwnedWriteHalf)> {
    let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"))??;
    stream.set_nodelay(true)?;
    let (reader, mut writer) = stream.into_split();
    writer
        .write_all(format!("{HELLO_PREFIX}{local}\n").as_bytes())
        .await?;
    Ok((BufReader::new(reader), writer))
}

async fn accept(shared: Arc<Shared>, stream: TcpStream) -> std::io::Result<()> {
    stream.set_nodelay(true)?;
    let (reader, writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    (&mut reader).take(HELLO_MAX).read_line(&mut line).await?;
    let peer = line
        .trim_end()
        .strip_prefix(HELLO_PREFIX)
        .filter(|id| !id.is_empty())
        .map(PeerId::from)
        .ok_or_else(|| invalid("bad hello"))?;
    if !shared.peers.contains_key(&peer) {
        return Err(invalid(&format!("unknown peer {peer}")));
    }
    info!(peer = %peer, "peer connected");

    // Reuse the connection for replies unless a live queue already exists.
    let rx = {
        let mut writers = lock(&shared.writers);
        match writers.get(&peer) {
            Some(tx) if !tx.is_closed() => None,
            _ => {
                let (tx, rx) = mpsc::unbounded_channel();
                writers.insert(peer.clone(), tx);
                Some(rx)
            }
        }
    };
    if let Some(rx) = rx {
        tokio::spawn(write_loop(peer.clone(), writer, rx));
    }
    read_loop(&shared, &peer, reader).await
}

fn spawn_reader(shared: Arc<Shared>, peer: PeerId, reader: BufReader<OwnedReadHalf>) {
    tokio::spawn(async move {
        if let Err(e) = read_loop(&shared, &peer, reader).await {
            debug!(peer = %peer, error = %e, "read side closed");
        }
    });
}

async fn read_loop(
    shared: &Shared,
    peer: &PeerId,
    mut reader: BufReader<OwnedReadHalf>,
) -> std::io::Result<()> {
    loop {
        let mut header = [0u8; LEN_SIZE];
        match reader.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        }
        let len = frame_len(header).map_err(|e| invalid(&e.to_string()))?;
        let mut frame = vec![0u8; LEN_SIZE + len];
        frame[..LEN_SIZE].copy_from_slice(&header);
        reader.read_exact(&mut frame[LEN_SIZE..]).await?;
        let envelope = match decode_frame(&frame) {
            Ok((envelope, _)) => envelope,
            Err(FrameDecodeError::Decode(e)) => {
                warn!(peer = %peer, error = %e, "undecodable frame skipped");
                continue;
            }
            Err(e) => return Err(invalid(&e.to_string())),
        };
        if &envelope.from_id != peer {
            warn!(peer = %peer, claimed = %envelope.from_id, "frame with foreign sender dropped");
            continue;
        }
        let Some(engine) = shared.engine.get() else {
            debug!(peer = %peer, "engine not attached; frame dropped");
            continue;
        };
        if engine.handle_message(envelope).is_err() {
            return Ok(());
        }
    }
}

async fn write_loop(peer: PeerId, writer: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Outgoing>) {
    let mut out = BufWriter::with_capacity(WRITE_BUFFER, writer);
    while let Some(item) = rx.recv().await {
        let mut ok = match item {
            Outgoing::Frame(frame, done) => {
                let ok = out.write_all(&frame).await.is_ok();
                done.resolve(ok);
                ok
            }
            Outgoing::Flush(done) => {
                let ok = out.flush().await.is_ok();
                done.resolve(ok);
                ok
            }
        };
        if ok && rx.is_empty() {
            ok = out.flush().await.is_ok();
        }
        if !ok {
            warn!(peer = %peer, "connection lost");
            break;
        }
    }
    debug!(peer = %peer, "writer stopped");
}

fn invalid(msg: &str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, msg.to_string())
}
