//! Handoff transfer engine.
//! Negotiates file batches with paired peers and streams them as (optionally encrypted)
//! chunks. The host supplies transport, pairing state and persistence through traits.

pub mod identity;
pub mod cipher;
pub mod protocol;
pub mod wire;
pub mod task;
pub mod config;
pub mod session;
pub mod peer;
pub mod registry;
pub mod events;

pub mod chunk;
pub mod scheduler;
pub mod negotiation;
pub mod sender;
pub mod receiver;
pub mod cleanup;

mod engine;
mod orchestrator;

pub use cipher::EncryptionType;
pub use config::{CleanupPolicy, PeerFolderSettings, Settings, StartupPurge};
pub use engine::{EngineError, TransferEngine};
pub use events::EngineEvent;
pub use identity::{LocalPeer, PeerId};
pub use peer::{Delivery, DeliveryHandle, PeerDirectory, PeerEntry, PeerMessenger, StaticPeerDirectory};
pub use protocol::{Envelope, Message};
pub use registry::{MemoryTaskStore, StoreError, TaskStore};
pub use task::{BatchId, Direction, RequestId, TaskId, TerminationOrigin, TransferStatus, TransferTask};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
