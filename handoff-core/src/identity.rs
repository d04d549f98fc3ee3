//! Peer identity and key agreement: peer ids, ephemeral X25519 keypairs, session key wrapping.

use std::fmt;

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::ChaCha20Poly1305;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

use crate::cipher::{CipherError, KEY_LEN, NONCE_LEN};

/// Symmetric key used to seal chunk payloads for one peer.
pub type SessionKey = [u8; KEY_LEN];

const PUBLIC_LEN: usize = 32;
const WRAP_TAG_LEN: usize = 16;

/// Length of wrapped key material: ephemeral public key + nonce + sealed key.
pub const WRAPPED_KEY_LEN: usize = PUBLIC_LEN + NONCE_LEN + KEY_LEN + WRAP_TAG_LEN;

/// Opaque peer identifier, supplied by the pairing layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        PeerId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        PeerId(s.to_string())
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        PeerId(s)
    }
}

/// The local end of a transfer: id and the display name sent with requests.
#[derive(Debug, Clone)]
pub struct LocalPeer {
    pub id: PeerId,
    pub name: String,
}

impl LocalPeer {
    pub fn new(id: impl Into<PeerId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// One-shot X25519 keypair used for a single key exchange.
pub struct EphemeralKeypair {
    secret: StaticSecret,
    public: [u8; PUBLIC_LEN],
}

impl EphemeralKeypair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = X25519PublicKey::from(&secret).to_bytes();
        Self { secret, public }
    }

    pub fn public_bytes(&self) -> [u8; PUBLIC_LEN] {
        self.public
    }

    /// Diffie-Hellman with the other side's public key.
    pub fn shared_secret(&self, other_public: &[u8; PUBLIC_LEN]) -> [u8; 32] {
        let other = X25519PublicKey::from(*other_public);
        self.secret.diffie_hellman(&other).to_bytes()
    }
}

impl fmt::Debug for EphemeralKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EphemeralKeypair")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

/// Derive the key-wrapping key from an X25519 shared secret.
pub fn derive_session_key(shared_secret: &[u8; 32]) -> SessionKey {
    let mut hasher = Sha256::new();
    hasher.update(b"handoff-session-wrap-v1");
    hasher.update(shared_secret);
    hasher.finalize().into()
}

/// Fresh random session key.
pub fn random_session_key() -> SessionKey {
    let mut key = [0u8; KEY_LEN];
    OsRng.fill_bytes(&mut key);
    key
}

/// Seal `session_key` for the holder of the secret behind `their_public`.
/// Output layout: our ephemeral public key ‖ nonce ‖ ChaCha20-Poly1305 ciphertext.
pub fn wrap_session_key(
    session_key: &SessionKey,
    their_public: &[u8; PUBLIC_LEN],
) -> Result<Vec<u8>, CipherError> {
    let ours = EphemeralKeypair::generate();
    let wrap_key = derive_session_key(&ours.shared_secret(their_public));
    let cipher = ChaCha20Poly1305::new_from_slice(&wrap_key).map_err(|_| CipherError::Key)?;
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let sealed = cipher
        .encrypt(
            chacha20poly1305::aead::Nonce::<ChaCha20Poly1305>::from_slice(&nonce),
            session_key.as_slice(),
        )
        .map_err(|_| CipherError::Encrypt)?;
    let mut out = Vec::with_capacity(WRAPPED_KEY_LEN);
    out.extend_from_slice(&ours.public_bytes());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Recover a session key wrapped with [`wrap_session_key`] for `ours`.
pub fn unwrap_session_key(
    ours: &EphemeralKeypair,
    material: &[u8],
) -> Result<SessionKey, CipherError> {
    if material.len() != WRAPPED_KEY_LEN {
        return Err(CipherError::Material);
    }
    let (their_public, rest) = material.split_at(PUBLIC_LEN);
    let (nonce, sealed) = rest.split_at(NONCE_LEN);
    let their_public: [u8; PUBLIC_LEN] =
        their_public.try_into().map_err(|_| CipherError::Material)?;
    let wrap_key = derive_session_key(&ours.shared_secret(&their_public));
    let cipher = ChaCha20Poly1305::new_from_slice(&wrap_key).map_err(|_| CipherError::Key)?;
    let plain = cipher
        .decrypt(
            chacha20poly1305::aead::Nonce::<ChaCha20Poly1305>::from_slice(nonce),
            sealed,
        )
        .map_err(|_| CipherError::Decrypt)?;
    plain.try_into().map_err(|_| CipherError::Material)
}
