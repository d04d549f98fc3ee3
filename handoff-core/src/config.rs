//! Engine settings. Every field is defaulted so a partial settings file is valid.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::cipher::EncryptionType;
use crate::identity::{PeerId, SessionKey};

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * KIB;
/// Used when `download_path` is left empty.
pub const DEFAULT_DOWNLOAD_DIR: &str = "downloads";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Root directory for incoming files.
    pub download_path: PathBuf,
    /// Per-file receive ceiling in bytes; 0 disables the check.
    pub max_file_size: u64,
    /// Per-batch receive ceiling in bytes; 0 disables the check.
    pub max_total_receive_size: u64,
    /// Cap on simultaneously transferring outgoing tasks.
    pub max_concurrent_tasks: usize,
    pub min_chunk_size: u64,
    pub initial_chunk_size: u64,
    pub max_chunk_size: u64,
    /// Chunk sends in flight per task.
    pub pipeline_depth: usize,
    /// Flush the transport after this many bytes.
    pub flush_interval_bytes: u64,
    pub encryption: EncryptionType,
    /// Base64 32-byte key for `aes-gcm` chunks from peers without a session key.
    pub legacy_shared_key: Option<String>,
    pub create_sender_folder: bool,
    pub create_date_folder: bool,
    /// Per-peer overrides of the folder toggles.
    pub peer_folders: HashMap<PeerId, PeerFolderSettings>,
    /// Lower-case extensions (without dot) refused as unsupported.
    pub blocked_extensions: Vec<String>,
    pub response_timeout_secs: u64,
    pub approval_timeout_secs: u64,
    pub cleanup: CleanupPolicy,
    pub startup_purge: StartupPurge,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            download_path: PathBuf::from(DEFAULT_DOWNLOAD_DIR),
            max_file_size: 0,
            max_total_receive_size: 0,
            max_concurrent_tasks: 3,
            min_chunk_size: 64 * KIB,
            initial_chunk_size: 2 * MIB,
            max_chunk_size: 16 * MIB,
            pipeline_depth: 4,
            flush_interval_bytes: MIB,
            encryption: EncryptionType::ChaCha20Poly1305,
            legacy_shared_key: None,
            create_sender_folder: false,
            create_date_folder: false,
            peer_folders: HashMap::new(),
            blocked_extensions: Vec::new(),
            response_timeout_secs: 65,
            approval_timeout_secs: 60,
            cleanup: CleanupPolicy::default(),
            startup_purge: StartupPurge::None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerFolderSettings {
    pub create_sender_folder: bool,
    pub create_date_folder: bool,
}

/// Where an accepted batch lands below the download root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FolderPolicy {
    SenderFolder,
    DateFolder,
    Flat,
}

/// Removal of terminal tasks after `delay_secs`, per outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupPolicy {
    pub completed: bool,
    pub cancelled: bool,
    pub failed: bool,
    pub delay_secs: u64,
}

impl Default for CleanupPolicy {
    fn default() -> Self {
        Self {
            completed: false,
            cancelled: false,
            failed: false,
            delay_secs: 5,
        }
    }
}

impl CleanupPolicy {
    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.delay_secs)
    }
}

/// What to drop from the store when the engine starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartupPurge {
    #[default]
    None,
    NonCompleted,
    All,
}

impl Settings {
    /// Sender folder wins over date folder; both are per-peer overridable.
    pub fn folder_policy(&self, peer: &PeerId) -> FolderPolicy {
        let (sender, date) = match self.peer_folders.get(peer) {
            Some(p) => (p.create_sender_folder, p.create_date_folder),
            None => (self.create_sender_folder, self.create_date_folder),
        };
        if sender {
            FolderPolicy::SenderFolder
        } else if date {
            FolderPolicy::DateFolder
        } else {
            FolderPolicy::Flat
        }
    }

    pub fn legacy_key(&self) -> Option<SessionKey> {
        let encoded = self.legacy_shared_key.as_deref()?;
        let bytes = STANDARD.decode(encoded.trim()).ok()?;
        bytes.try_into().ok()
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.response_timeout_secs)
    }

    pub fn approval_timeout(&self) -> Duration {
        Duration::from_secs(self.approval_timeout_secs)
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent_tasks.max(1)
    }

    pub fn is_blocked_extension(&self, file_name: &str) -> bool {
        let Some((_, ext)) = file_name.rsplit_once('.') else {
            return false;
        };
        let ext = ext.to_ascii_lowercase();
        self.blocked_extensions
            .iter()
            .any(|b| b.trim_start_matches('.').eq_ignore_ascii_case(&ext))
    }
}
