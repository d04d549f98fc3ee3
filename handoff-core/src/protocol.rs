//! Handoff wire protocol: envelope, message types and payloads.
//!
//! Envelopes are JSON objects `{type, fromId, toId, payload, timestamp}`; payload keys are
//! camelCase and binary fields are standard base64.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::cipher::{EncryptionType, SealedChunk, NONCE_LEN, TAG_LEN};
use crate::identity::PeerId;
use crate::task::{BatchId, RequestId, TaskId};

/// Transport name advertised in transfer requests.
pub const PROTOCOL_NAME: &str = "tcp";

/// Message discriminator carried in the envelope `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    TransferRequest,
    TransferResponse,
    DataChunk,
    DataTransferCancel,
}

/// Routing envelope around every message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub from_id: PeerId,
    pub to_id: PeerId,
    pub payload: serde_json::Value,
    /// Unix milliseconds.
    pub timestamp: i64,
}

impl Envelope {
    pub fn new(from: &PeerId, to: &PeerId, message: &Message) -> Result<Self, ProtocolError> {
        let payload = match message {
            Message::TransferRequest(m) => serde_json::to_value(m),
            Message::TransferResponse(m) => serde_json::to_value(m),
            Message::DataChunk(m) => serde_json::to_value(m),
            Message::Cancel(m) => serde_json::to_value(m),
        }
        .map_err(ProtocolError::Json)?;
        Ok(Self {
            kind: message.kind(),
            from_id: from.clone(),
            to_id: to.clone(),
            payload,
            timestamp: chrono::Utc::now().timestamp_millis(),
        })
    }

    /// Decode the payload according to `kind`.
    pub fn message(&self) -> Result<Message, ProtocolError> {
        self.clone().into_message()
    }

    pub fn into_message(self) -> Result<Message, ProtocolError> {
        let payload = self.payload;
        let message = match self.kind {
            MessageKind::TransferRequest => Message::TransferRequest(
                serde_json::from_value(payload).map_err(ProtocolError::Json)?,
            ),
            MessageKind::TransferResponse => Message::TransferResponse(
                serde_json::from_value(payload).map_err(ProtocolError::Json)?,
            ),
            MessageKind::DataChunk => {
                Message::DataChunk(serde_json::from_value(payload).map_err(ProtocolError::Json)?)
            }
            MessageKind::DataTransferCancel => {
                Message::Cancel(serde_json::from_value(payload).map_err(ProtocolError::Json)?)
            }
        };
        Ok(message)
    }

    pub fn to_json(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(ProtocolError::Json)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(bytes).map_err(ProtocolError::Json)
    }
}

/// All wire message types.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    TransferRequest(TransferRequest),
    TransferResponse(TransferResponse),
    DataChunk(DataChunk),
    Cancel(TransferCancel),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::TransferRequest(_) => MessageKind::TransferRequest,
            Message::TransferResponse(_) => MessageKind::TransferResponse,
            Message::DataChunk(_) => MessageKind::DataChunk,
            Message::Cancel(_) => MessageKind::DataTransferCancel,
        }
    }
}

/// One file offered in a transfer request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    pub size: u64,
}

/// Negotiation envelope from the sending side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRequest {
    pub request_id: RequestId,
    pub batch_id: BatchId,
    pub from_id: PeerId,
    pub from_name: String,
    pub files: Vec<FileEntry>,
    pub total_size: u64,
    pub protocol: String,
    pub max_chunk_size: u64,
    pub use_encryption: bool,
    /// Sender's ephemeral X25519 public key, base64.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key_b64: Option<String>,
}

impl TransferRequest {
    /// Sum of the declared file sizes; the authoritative total for quota checks.
    pub fn computed_total(&self) -> u64 {
        self.files
            .iter()
            .fold(0u64, |acc, f| acc.saturating_add(f.size))
    }
}

/// Why a transfer request was declined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RejectReason {
    UserRejected,
    Timeout,
    FileSizeExceeded,
    TotalSizeExceeded,
    StorageInsufficient,
    UnsupportedFileType,
    Unknown,
}

impl RejectReason {
    pub fn describe(self) -> &'static str {
        match self {
            RejectReason::UserRejected => "rejected by receiver",
            RejectReason::Timeout => "no response from receiver",
            RejectReason::FileSizeExceeded => "file exceeds receiver size limit",
            RejectReason::TotalSizeExceeded => "batch exceeds receiver size limit",
            RejectReason::StorageInsufficient => "insufficient storage on receiver",
            RejectReason::UnsupportedFileType => "file type not accepted by receiver",
            RejectReason::Unknown => "transfer declined",
        }
    }
}

/// Negotiation reply from the receiving side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferResponse {
    pub request_id: RequestId,
    pub batch_id: BatchId,
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reject_reason: Option<RejectReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reject_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_key_b64: Option<String>,
}

/// Primitive metadata value carried opaquely from sender to receiver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

pub type Metadata = BTreeMap<String, MetadataValue>;

/// One file fragment. The first chunk of a task also carries name, size and metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataChunk {
    pub task_id: TaskId,
    pub is_last: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
    pub enc: EncryptionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ct: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iv: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    /// Byte offset of this chunk within the file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
}

/// Decoded chunk body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkPayload {
    Plain(Vec<u8>),
    Sealed(EncryptionType, SealedChunk),
}

impl DataChunk {
    pub fn plain(task_id: TaskId, bytes: &[u8], is_last: bool) -> Self {
        let mut chunk = Self::empty(task_id, EncryptionType::None, is_last);
        chunk.data = Some(STANDARD.encode(bytes));
        chunk
    }

    pub fn sealed(task_id: TaskId, kind: EncryptionType, sealed: &SealedChunk, is_last: bool) -> Self {
        let mut chunk = Self::empty(task_id, kind, is_last);
        chunk.ct = Some(STANDARD.encode(&sealed.ciphertext));
        let nonce = Some(STANDARD.encode(sealed.nonce));
        if kind == EncryptionType::AesGcm {
            chunk.iv = nonce;
        } else {
            chunk.nonce = nonce;
        }
        chunk.tag = Some(STANDARD.encode(sealed.tag));
        chunk
    }

    fn empty(task_id: TaskId, enc: EncryptionType, is_last: bool) -> Self {
        Self {
            task_id,
            is_last,
            file_name: None,
            file_size: None,
            metadata: None,
            enc,
            data: None,
            ct: None,
            iv: None,
            nonce: None,
            tag: None,
            offset: None,
        }
    }

    /// First-chunk framing: lets the receiver materialize the task.
    pub fn with_header(mut self, file_name: &str, file_size: u64, metadata: &Metadata) -> Self {
        self.file_name = Some(file_name.to_string());
        self.file_size = Some(file_size);
        if !metadata.is_empty() {
            self.metadata = Some(metadata.clone());
        }
        self
    }

    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn payload(&self) -> Result<ChunkPayload, ProtocolError> {
        match self.enc {
            EncryptionType::None => {
                let data = self.data.as_deref().ok_or(ProtocolError::Missing("data"))?;
                Ok(ChunkPayload::Plain(decode_b64(data)?))
            }
            kind => {
                let ct = self.ct.as_deref().ok_or(ProtocolError::Missing("ct"))?;
                let nonce_field = if kind == EncryptionType::AesGcm {
                    self.iv.as_deref().or(self.nonce.as_deref())
                } else {
                    self.nonce.as_deref().or(self.iv.as_deref())
                };
                let nonce = nonce_field.ok_or(ProtocolError::Missing("nonce"))?;
                let tag = self.tag.as_deref().ok_or(ProtocolError::Missing("tag"))?;
                Ok(ChunkPayload::Sealed(
                    kind,
                    SealedChunk {
                        ciphertext: decode_b64(ct)?,
                        nonce: fixed::<NONCE_LEN>(decode_b64(nonce)?, "nonce")?,
                        tag: fixed::<TAG_LEN>(decode_b64(tag)?, "tag")?,
                    },
                ))
            }
        }
    }
}

fn decode_b64(s: &str) -> Result<Vec<u8>, ProtocolError> {
    STANDARD.decode(s).map_err(ProtocolError::Base64)
}

fn fixed<const N: usize>(bytes: Vec<u8>, field: &'static str) -> Result<[u8; N], ProtocolError> {
    bytes.try_into().map_err(|_| ProtocolError::Length(field))
}

/// Cooperative cancel for one task, sent by either side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferCancel {
    pub task_id: TaskId,
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("base64 error: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("missing field {0}")]
    Missing(&'static str),
    #[error("bad length for {0}")]
    Length(&'static str),
}
