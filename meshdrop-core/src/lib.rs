//! Meshdrop protocol core: star-mesh file exchange.
//! Host-driven: no I/O; host passes events and receives actions.

pub mod catalog;
pub mod chunk;
pub mod cipher;
pub mod config;
pub mod control;
pub mod core;
pub mod identity;
pub mod link;
pub mod protocol;
pub mod session;
pub mod transfer;
pub mod wire;

pub use crate::core::{Action, LinkId, MeshCore, Notification};
pub use cipher::{CipherError, CipherKey};
pub use config::Config;
pub use control::{MeshRole, NameError};
pub use identity::{Fingerprint, PeerId};
pub use link::LinkState;
pub use protocol::{FileRecord, LinkTag, Message, PeerStatus, PROTOCOL_VERSION};
pub use session::{
    CancelReason, FileSource, MemorySink, Role, Sink, TransferKey, TransferSession, TransferState,
};
pub use transfer::TransferError;
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
