//! Transfer negotiation: request validation, destination policy and the session key handshake.

use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::Local;
use tracing::{debug, warn};

use crate::cipher::CipherError;
use crate::config::{FolderPolicy, Settings, DEFAULT_DOWNLOAD_DIR};
use crate::identity::{
    unwrap_session_key, wrap_session_key, EphemeralKeypair, PeerId, SessionKey, WRAPPED_KEY_LEN,
};
use crate::peer::PeerDirectory;
use crate::protocol::{FileEntry, RejectReason, TransferRequest, TransferResponse, PROTOCOL_NAME};
use crate::receiver::sanitize_file_name;
use crate::session::SessionKeyManager;
use crate::task::{BatchId, RequestId};
use crate::wire::MAX_CHUNK_LEN;

/// Checks that do not involve the user. The first failing rule decides the reason.
pub fn validate_request(
    from: &PeerId,
    request: &TransferRequest,
    settings: &Settings,
    directory: &dyn PeerDirectory,
) -> Result<(), RejectReason> {
    if !directory.is_paired(from) {
        return Err(RejectReason::Unknown);
    }
    if directory.is_blocked(from) {
        return Err(RejectReason::UserRejected);
    }
    if request.files.is_empty() {
        return Err(RejectReason::Unknown);
    }
    if settings.max_file_size > 0 && request.files.iter().any(|f| f.size > settings.max_file_size)
    {
        return Err(RejectReason::FileSizeExceeded);
    }
    let total = request.computed_total().max(request.total_size);
    if settings.max_total_receive_size > 0 && total > settings.max_total_receive_size {
        return Err(RejectReason::TotalSizeExceeded);
    }
    if request
        .files
        .iter()
        .any(|f| settings.is_blocked_extension(&f.name))
    {
        return Err(RejectReason::UnsupportedFileType);
    }
    Ok(())
}

/// Directory for an accepted batch, per the peer's folder policy. Not created here.
pub fn destination_dir(settings: &Settings, peer: &PeerId, peer_name: &str) -> PathBuf {
    let root = if settings.download_path.as_os_str().is_empty() {
        PathBuf::from(DEFAULT_DOWNLOAD_DIR)
    } else {
        settings.download_path.clone()
    };
    match settings.folder_policy(peer) {
        FolderPolicy::SenderFolder => {
            let label = if peer_name.trim().is_empty() {
                peer.as_str()
            } else {
                peer_name
            };
            root.join(sanitize_file_name(label))
        }
        FolderPolicy::DateFolder => root.join(Local::now().format("%Y-%m-%d").to_string()),
        FolderPolicy::Flat => root,
    }
}

/// Create the batch directory. Failure maps to `storageInsufficient`.
pub async fn prepare_destination(dir: &Path) -> Result<(), RejectReason> {
    tokio::fs::create_dir_all(dir).await.map_err(|e| {
        warn!(dir = %dir.display(), error = %e, "cannot create download directory");
        RejectReason::StorageInsufficient
    })
}

/// Build the outgoing request. With encryption, the returned keypair must be kept until the response.
pub fn build_request(
    from: &PeerId,
    from_name: &str,
    batch_id: BatchId,
    files: Vec<FileEntry>,
    settings: &Settings,
    use_encryption: bool,
) -> (TransferRequest, Option<EphemeralKeypair>) {
    let keypair = use_encryption.then(EphemeralKeypair::generate);
    let total_size = files.iter().fold(0u64, |acc, f| acc.saturating_add(f.size));
    let request = TransferRequest {
        request_id: RequestId::generate(),
        batch_id,
        from_id: from.clone(),
        from_name: from_name.to_string(),
        files,
        total_size,
        protocol: PROTOCOL_NAME.to_string(),
        max_chunk_size: settings.max_chunk_size.min(MAX_CHUNK_LEN),
        use_encryption,
        public_key_b64: keypair.as_ref().map(|k| STANDARD.encode(k.public_bytes())),
    };
    (request, keypair)
}

pub fn accept(
    request: &TransferRequest,
    download_path: &Path,
    session_key_b64: Option<String>,
) -> TransferResponse {
    TransferResponse {
        request_id: request.request_id.clone(),
        batch_id: request.batch_id.clone(),
        accepted: true,
        reject_reason: None,
        reject_message: None,
        download_path: Some(download_path.to_string_lossy().into_owned()),
        session_key_b64,
    }
}

pub fn reject(request: &TransferRequest, reason: RejectReason) -> TransferResponse {
    TransferResponse {
        request_id: request.request_id.clone(),
        batch_id: request.batch_id.clone(),
        accepted: false,
        reject_reason: Some(reason),
        reject_message: Some(reason.describe().to_string()),
        download_path: None,
        session_key_b64: None,
    }
}

/// Receiver side: session key for `peer`, wrapped for the requester's ephemeral key when one was sent.
pub fn session_key_material(
    keys: &SessionKeyManager,
    peer: &PeerId,
    public_key_b64: Option<&str>,
) -> Result<String, CipherError> {
    let key = keys.get_or_create(peer);
    let Some(encoded) = public_key_b64 else {
        debug!(peer = %peer, "legacy requester; returning raw session key");
        return Ok(STANDARD.encode(key));
    };
    let public: [u8; 32] = STANDARD
        .decode(encoded.trim())
        .map_err(|_| CipherError::Material)?
        .try_into()
        .map_err(|_| CipherError::Material)?;
    let wrapped = wrap_session_key(&key, &public)?;
    Ok(STANDARD.encode(wrapped))
}

/// Sender side: recover the session key from `sessionKeyB64`.
pub fn accept_session_key(
    ours: Option<&EphemeralKeypair>,
    material_b64: &str,
) -> Result<SessionKey, CipherError> {
    let material = STANDARD
        .decode(material_b64.trim())
        .map_err(|_| CipherError::Material)?;
    match ours {
        Some(keypair) if material.len() == WRAPPED_KEY_LEN => unwrap_session_key(keypair, &material),
        _ => material.try_into().map_err(|_| CipherError::Material),
    }
}
