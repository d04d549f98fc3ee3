//! Interfaces to the collaborators around the engine: message delivery and the peer directory.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::oneshot;

use crate::identity::PeerId;
use crate::protocol::Envelope;

/// Outcome of one queued send: resolves to `true` once the transport wrote the message.
pub struct Delivery(DeliveryState);

enum DeliveryState {
    Ready(bool),
    Waiting(oneshot::Receiver<bool>),
}

impl Delivery {
    pub fn ready(ok: bool) -> Self {
        Delivery(DeliveryState::Ready(ok))
    }

    /// A pending delivery and the handle the transport resolves it with.
    /// Dropping the handle resolves the delivery as failed.
    pub fn pending() -> (DeliveryHandle, Self) {
        let (tx, rx) = oneshot::channel();
        (DeliveryHandle(tx), Delivery(DeliveryState::Waiting(rx)))
    }
}

impl Future for Delivery {
    type Output = bool;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<bool> {
        match &mut self.0 {
            DeliveryState::Ready(ok) => Poll::Ready(*ok),
            DeliveryState::Waiting(rx) => Pin::new(rx).poll(cx).map(|r| r.unwrap_or(false)),
        }
    }
}

pub struct DeliveryHandle(oneshot::Sender<bool>);

impl DeliveryHandle {
    pub fn resolve(self, ok: bool) {
        let _ = self.0.send(ok);
    }
}

/// Message transport to paired peers.
///
/// Envelopes queued for one peer must be written in the order `send_to_peer` was called;
/// the engine pipelines chunk sends on that guarantee.
#[async_trait]
pub trait PeerMessenger: Send + Sync {
    fn send_to_peer(&self, peer: &PeerId, envelope: Envelope) -> Delivery;

    /// Push buffered data for `peer` onto the wire. Resolves after everything queued before it.
    fn flush(&self, peer: &PeerId) -> Delivery {
        let _ = peer;
        Delivery::ready(true)
    }

    /// Drop and re-establish the connection to `peer`.
    async fn reconnect(&self, peer: &PeerId) -> bool;
}

/// Pairing and trust state, owned by the pairing layer.
pub trait PeerDirectory: Send + Sync {
    fn is_paired(&self, peer: &PeerId) -> bool;
    fn is_blocked(&self, peer: &PeerId) -> bool;
    fn is_trusted(&self, peer: &PeerId) -> bool;
    fn display_name(&self, peer: &PeerId) -> Option<String>;
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PeerEntry {
    pub name: String,
    pub trusted: bool,
    pub blocked: bool,
}

/// Fixed peer list, e.g. loaded from a config file.
#[derive(Debug, Clone, Default)]
pub struct StaticPeerDirectory {
    peers: HashMap<PeerId, PeerEntry>,
}

impl StaticPeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_peer(mut self, id: impl Into<PeerId>, entry: PeerEntry) -> Self {
        self.insert(id.into(), entry);
        self
    }

    pub fn insert(&mut self, id: PeerId, entry: PeerEntry) {
        self.peers.insert(id, entry);
    }
}

impl PeerDirectory for StaticPeerDirectory {
    fn is_paired(&self, peer: &PeerId) -> bool {
        self.peers.contains_key(peer)
    }

    fn is_blocked(&self, peer: &PeerId) -> bool {
        self.peers.get(peer).is_some_and(|p| p.blocked)
    }

    fn is_trusted(&self, peer: &PeerId) -> bool {
        self.peers.get(peer).is_some_and(|p| p.trusted && !p.blocked)
    }

    fn display_name(&self, peer: &PeerId) -> Option<String> {
        self.peers
            .get(peer)
            .map(|p| p.name.clone())
            .filter(|n| !n.is_empty())
    }
}
