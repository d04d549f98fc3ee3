//! In-memory per-peer session keys. Never persisted; lost on restart.
//!
//! Each peer has up to two keys: the one this side issued while accepting the peer's
//! requests (the peer encrypts to us with it) and the one the peer issued while accepting
//! ours (we encrypt to the peer with it). Keeping them apart lets both peers send
//! encrypted batches to each other at the same time.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use crate::identity::{random_session_key, PeerId, SessionKey};

type KeyMap = RwLock<HashMap<PeerId, SessionKey>>;

#[derive(Debug, Default)]
pub struct SessionKeyManager {
    inbound: KeyMap,
    outbound: KeyMap,
}

impl SessionKeyManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Key this side issued to `peer`, generated on first use.
    pub fn get_or_create(&self, peer: &PeerId) -> SessionKey {
        let mut keys = self.inbound.write().unwrap_or_else(PoisonError::into_inner);
        *keys.entry(peer.clone()).or_insert_with(random_session_key)
    }

    /// Key this side issued to `peer`; decrypts what `peer` sends.
    pub fn get(&self, peer: &PeerId) -> Option<SessionKey> {
        read(&self.inbound, peer)
    }

    /// Store the key `peer` issued through a key exchange.
    pub fn set_outbound(&self, peer: PeerId, key: SessionKey) {
        self.outbound
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(peer, key);
    }

    /// Key `peer` issued to this side; encrypts what we send to `peer`.
    pub fn outbound(&self, peer: &PeerId) -> Option<SessionKey> {
        read(&self.outbound, peer)
    }

    pub fn clear(&self, peer: &PeerId) {
        for map in [&self.inbound, &self.outbound] {
            map.write()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(peer);
        }
    }

    pub fn clear_all(&self) {
        for map in [&self.inbound, &self.outbound] {
            map.write().unwrap_or_else(PoisonError::into_inner).clear();
        }
    }
}

fn read(map: &KeyMap, peer: &PeerId) -> Option<SessionKey> {
    map.read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(peer)
        .copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_or_create_reuses_key() {
        let keys = SessionKeyManager::new();
        let peer = PeerId::from("alice");
        assert_eq!(keys.get(&peer), None);
        let k1 = keys.get_or_create(&peer);
        assert_eq!(keys.get_or_create(&peer), k1);
        assert_eq!(keys.get(&peer), Some(k1));
    }

    #[test]
    fn keys_are_per_peer() {
        let keys = SessionKeyManager::new();
        let a = keys.get_or_create(&PeerId::from("a"));
        let b = keys.get_or_create(&PeerId::from("b"));
        assert_ne!(a, b);
    }

    #[test]
    fn received_key_does_not_replace_issued_key() {
        let keys = SessionKeyManager::new();
        let peer = PeerId::from("a");
        let issued = keys.get_or_create(&peer);
        keys.set_outbound(peer.clone(), [9u8; 32]);
        assert_eq!(keys.get(&peer), Some(issued));
        assert_eq!(keys.outbound(&peer), Some([9u8; 32]));
    }

    #[test]
    fn clear_and_clear_all() {
        let keys = SessionKeyManager::new();
        let a = PeerId::from("a");
        let b = PeerId::from("b");
        keys.get_or_create(&a);
        keys.set_outbound(a.clone(), [1u8; 32]);
        keys.set_outbound(b.clone(), [2u8; 32]);
        keys.clear(&a);
        assert_eq!(keys.get(&a), None);
        assert_eq!(keys.outbound(&a), None);
        assert_eq!(keys.outbound(&b), Some([2u8; 32]));
        keys.clear_all();
        assert_eq!(keys.outbound(&b), None);
    }
}
