//! Transfer tasks: identity, status state machine and the metadata the engine interprets.

use std::fmt;
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cipher::EncryptionType;
use crate::identity::PeerId;
use crate::protocol::{Metadata, MetadataValue};

macro_rules! string_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Fresh random (UUID v4) id.
            pub fn generate() -> Self {
                $name(uuid::Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                $name(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                $name(s)
            }
        }
    };
}

string_id!(
    /// Globally unique id of one file movement.
    TaskId
);
string_id!(
    /// Groups the tasks of one negotiated request.
    BatchId
);
string_id!(
    /// Id of one negotiation round trip.
    RequestId
);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Direction {
    Outgoing,
    Incoming,
}

/// Task status. Terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransferStatus {
    Pending,
    WaitingForApproval,
    Transferring,
    Completed,
    Failed,
    Cancelled,
    Rejected,
}

impl TransferStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferStatus::Completed
                | TransferStatus::Failed
                | TransferStatus::Cancelled
                | TransferStatus::Rejected
        )
    }

    pub fn can_transition_to(self, next: TransferStatus) -> bool {
        use TransferStatus::*;
        match self {
            Pending => matches!(next, WaitingForApproval | Transferring | Cancelled | Failed),
            WaitingForApproval => {
                matches!(next, Pending | Transferring | Rejected | Cancelled | Failed)
            }
            Transferring => matches!(next, Completed | Failed | Cancelled),
            Completed | Failed | Cancelled | Rejected => false,
        }
    }
}

/// Who drove a task into its terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TerminationOrigin {
    /// Local user action.
    User,
    /// The remote peer (reject, cancel).
    Peer,
    /// Timeouts, I/O and protocol failures.
    System,
}

/// One file movement between this process and a peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferTask {
    pub id: TaskId,
    pub batch_id: Option<BatchId>,
    pub file_name: String,
    /// Source file (outgoing only).
    pub source_path: Option<PathBuf>,
    /// Final destination file (incoming only).
    pub save_path: Option<PathBuf>,
    pub file_size: u64,
    pub transferred_bytes: u64,
    pub direction: Direction,
    pub peer_id: PeerId,
    pub peer_name: String,
    pub status: TransferStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub encryption: EncryptionType,
    #[serde(default)]
    pub termination: Option<TerminationOrigin>,
}

impl TransferTask {
    /// Outgoing task, created when a batch is proposed.
    pub fn outgoing(
        batch_id: BatchId,
        source: PathBuf,
        file_name: String,
        file_size: u64,
        peer_id: PeerId,
        peer_name: String,
    ) -> Self {
        let mut metadata = Metadata::new();
        KnownMetadata {
            batch_id: Some(batch_id.clone()),
            sync_file_path: None,
        }
        .apply(&mut metadata);
        Self {
            id: TaskId::generate(),
            batch_id: Some(batch_id),
            file_name,
            source_path: Some(source),
            save_path: None,
            file_size,
            transferred_bytes: 0,
            direction: Direction::Outgoing,
            peer_id,
            peer_name,
            status: TransferStatus::WaitingForApproval,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error_message: None,
            metadata,
            encryption: EncryptionType::None,
            termination: None,
        }
    }

    /// Incoming task, materialized from the first chunk of an unknown task id.
    pub fn incoming(
        id: TaskId,
        file_name: String,
        file_size: u64,
        save_path: PathBuf,
        peer_id: PeerId,
        peer_name: String,
        metadata: Metadata,
    ) -> Self {
        let now = Utc::now();
        let batch_id = KnownMetadata::parse(&metadata).batch_id;
        Self {
            id,
            batch_id,
            file_name,
            source_path: None,
            save_path: Some(save_path),
            file_size,
            transferred_bytes: 0,
            direction: Direction::Incoming,
            peer_id,
            peer_name,
            status: TransferStatus::Transferring,
            created_at: now,
            started_at: Some(now),
            completed_at: None,
            error_message: None,
            metadata,
            encryption: EncryptionType::None,
            termination: None,
        }
    }

    pub fn is_outgoing(&self) -> bool {
        self.direction == Direction::Outgoing
    }

    pub fn progress_fraction(&self) -> f64 {
        if self.file_size == 0 {
            return if self.status == TransferStatus::Completed {
                1.0
            } else {
                0.0
            };
        }
        self.transferred_bytes as f64 / self.file_size as f64
    }

    /// Record progress. Never moves backwards and never exceeds the file size.
    pub fn record_progress(&mut self, bytes: u64) {
        self.transferred_bytes = self.transferred_bytes.max(bytes.min(self.file_size));
    }

    /// Move along the state machine, stamping timestamps.
    pub fn transition(&mut self, next: TransferStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError {
                from: self.status,
                to: next,
            });
        }
        let now = Utc::now();
        if next == TransferStatus::Transferring {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.completed_at = Some(now);
        }
        self.status = next;
        Ok(())
    }

    /// Terminal transition carrying its cause and an optional message.
    pub fn terminate(
        &mut self,
        next: TransferStatus,
        origin: TerminationOrigin,
        message: Option<String>,
    ) -> Result<(), TransitionError> {
        self.transition(next)?;
        self.termination = Some(origin);
        if message.is_some() {
            self.error_message = message;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid status transition {from:?} -> {to:?}")]
pub struct TransitionError {
    pub from: TransferStatus,
    pub to: TransferStatus,
}

pub const BATCH_ID_KEY: &str = "batchId";
pub const SYNC_FILE_PATH_KEY: &str = "syncFilePath";

/// The metadata keys the engine itself interprets. Everything else passes through untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KnownMetadata {
    pub batch_id: Option<BatchId>,
    /// Relative location below the batch directory.
    pub sync_file_path: Option<PathBuf>,
}

impl KnownMetadata {
    /// Extract and validate known keys; malformed values are ignored.
    pub fn parse(metadata: &Metadata) -> Self {
        let batch_id = match metadata.get(BATCH_ID_KEY) {
            Some(MetadataValue::Text(s)) if !s.trim().is_empty() => Some(BatchId::from(s.as_str())),
            _ => None,
        };
        let sync_file_path = match metadata.get(SYNC_FILE_PATH_KEY) {
            Some(MetadataValue::Text(s)) if is_safe_relative(Path::new(s)) => Some(PathBuf::from(s)),
            _ => None,
        };
        Self {
            batch_id,
            sync_file_path,
        }
    }

    pub fn apply(&self, metadata: &mut Metadata) {
        if let Some(b) = &self.batch_id {
            metadata.insert(BATCH_ID_KEY.into(), MetadataValue::Text(b.to_string()));
        }
        if let Some(p) = &self.sync_file_path {
            metadata.insert(
                SYNC_FILE_PATH_KEY.into(),
                MetadataValue::Text(p.to_string_lossy().into_owned()),
            );
        }
    }
}

/// Relative path made only of normal components.
pub fn is_safe_relative(path: &Path) -> bool {
    !path.as_os_str().is_empty() && path.components().all(|c| matches!(c, Component::Normal(_)))
}
