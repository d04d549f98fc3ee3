//! Per-chunk authenticated encryption: AES-256-GCM and ChaCha20-Poly1305.

use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::Aes256Gcm;
use chacha20poly1305::ChaCha20Poly1305;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::identity::SessionKey;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// Chunk encryption scheme. The wire tag travels with every chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum EncryptionType {
    #[serde(rename = "none")]
    None,
    #[serde(rename = "aes-gcm")]
    AesGcm,
    #[default]
    #[serde(rename = "chacha20-poly1305")]
    ChaCha20Poly1305,
}

impl EncryptionType {
    pub fn is_none(self) -> bool {
        self == EncryptionType::None
    }

    /// Scheme to use when the peer asked for encryption; `None` falls back to ChaCha20-Poly1305.
    pub fn or_aead(self) -> Self {
        match self {
            EncryptionType::None => EncryptionType::ChaCha20Poly1305,
            other => other,
        }
    }
}

/// Ciphertext with its detached nonce and authentication tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedChunk {
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; NONCE_LEN],
    pub tag: [u8; TAG_LEN],
}

/// Encrypt `plaintext` under `key`. `aad` binds the ciphertext to its task.
pub fn seal(
    kind: EncryptionType,
    key: &SessionKey,
    aad: &[u8],
    plaintext: Vec<u8>,
) -> Result<SealedChunk, CipherError> {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let mut buffer = plaintext;
    let tag = match kind {
        EncryptionType::AesGcm => {
            let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CipherError::Key)?;
            cipher
                .encrypt_in_place_detached(
                    aes_gcm::aead::Nonce::<Aes256Gcm>::from_slice(&nonce),
                    aad,
                    &mut buffer,
                )
                .map_err(|_| CipherError::Encrypt)?
        }
        EncryptionType::ChaCha20Poly1305 => {
            let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|_| CipherError::Key)?;
            cipher
                .encrypt_in_place_detached(
                    chacha20poly1305::aead::Nonce::<ChaCha20Poly1305>::from_slice(&nonce),
                    aad,
                    &mut buffer,
                )
                .map_err(|_| CipherError::Encrypt)?
        }
        EncryptionType::None => return Err(CipherError::Unsupported),
    };
    let mut tag_bytes = [0u8; TAG_LEN];
    tag_bytes.copy_from_slice(tag.as_slice());
    Ok(SealedChunk {
        ciphertext: buffer,
        nonce,
        tag: tag_bytes,
    })
}

/// Decrypt and authenticate. A tag mismatch yields [`CipherError::Decrypt`] and no plaintext.
pub fn open(
    kind: EncryptionType,
    key: &SessionKey,
    aad: &[u8],
    sealed: SealedChunk,
) -> Result<Vec<u8>, CipherError> {
    let mut buffer = sealed.ciphertext;
    match kind {
        EncryptionType::AesGcm => {
            let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CipherError::Key)?;
            cipher
                .decrypt_in_place_detached(
                    aes_gcm::aead::Nonce::<Aes256Gcm>::from_slice(&sealed.nonce),
                    aad,
                    &mut buffer,
                    aes_gcm::aead::Tag::<Aes256Gcm>::from_slice(&sealed.tag),
                )
                .map_err(|_| CipherError::Decrypt)?;
        }
        EncryptionType::ChaCha20Poly1305 => {
            let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|_| CipherError::Key)?;
            cipher
                .decrypt_in_place_detached(
                    chacha20poly1305::aead::Nonce::<ChaCha20Poly1305>::from_slice(&sealed.nonce),
                    aad,
                    &mut buffer,
                    chacha20poly1305::aead::Tag::<ChaCha20Poly1305>::from_slice(&sealed.tag),
                )
                .map_err(|_| CipherError::Decrypt)?;
        }
        EncryptionType::None => return Err(CipherError::Unsupported),
    }
    Ok(buffer)
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum CipherError {
    #[error("invalid key")]
    Key,
    #[error("encryption failed")]
    Encrypt,
    #[error("authentication failed")]
    Decrypt,
    #[error("malformed key material")]
    Material,
    #[error("no cipher for encryption type none")]
    Unsupported,
}
