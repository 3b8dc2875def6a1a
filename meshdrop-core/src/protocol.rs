//! Meshdrop wire protocol: message kinds, link tags, file records.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::cipher::{CipherKey, NONCE_LEN};
use crate::identity::{Fingerprint, PeerId};

/// Current protocol version. Carried in the transport handshake.
pub const PROTOCOL_VERSION: u8 = 1;

/// What a link is for. Given when the link is opened so the accepting side can route it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkTag {
    /// Persistent per-peer signaling link.
    Control,
    /// Ephemeral link carrying the bytes of one file.
    Download { fingerprint: Fingerprint },
}

/// Link status as seen by the local node, and as relayed in the roster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeerStatus {
    Disconnected,
    Connecting,
    Connected,
}

impl PeerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeerStatus::Disconnected => "disconnected",
            PeerStatus::Connecting => "connecting",
            PeerStatus::Connected => "connected",
        }
    }
}

/// History entry for one shared file, replicated to every participant.
/// Immutable once broadcast; removed everywhere by `FileDelete`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub fingerprint: Fingerprint,
    pub name: String,
    pub size: u64,
    pub sender: PeerId,
    pub sender_name: String,
    pub encrypted: bool,
    /// Sent in the clear: whoever can read the control link can decrypt the file.
    pub key: Option<CipherKey>,
}

/// All wire message types. Encoding is bincode; framing is length-prefix (see wire module).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    // Control link.
    /// Coordinator binds a display name to a peer id.
    IdentityAssign { peer: PeerId, name: String },
    /// A peer announces its chosen display name.
    IdentityAnnounce { peer: PeerId, name: String },
    /// Full membership snapshot from the coordinator. Replaces, never merges.
    Roster {
        names: BTreeMap<PeerId, String>,
        statuses: BTreeMap<PeerId, PeerStatus>,
    },
    /// Replay of known file records for a newly linked peer.
    History { files: Vec<FileRecord> },
    /// A new shared file.
    FileAnnounce(FileRecord),
    /// Remove a shared file everywhere.
    FileDelete { fingerprint: Fingerprint },
    /// Best-effort notice that the sender is leaving.
    Goodbye { peer: PeerId },
    /// Liveness probe; answered with `Pong`.
    Ping,
    Pong,

    // Download link.
    /// Receiver asks for the file this link was opened for.
    FileRequest { fingerprint: Fingerprint },
    /// Sender accepts the request.
    FileStart { file_size: u64 },
    /// One encrypted slice of the file.
    FileChunk {
        chunk_id: u64,
        ciphertext: Vec<u8>,
        nonce: [u8; NONCE_LEN],
    },
    /// Cumulative: every chunk up to and including `chunk_id` is written.
    ChunkAck { chunk_id: u64 },
    /// Sender has sent every chunk.
    FileEnd,
    /// Sender aborted (missing file, retry exhaustion, read failure).
    FileError { error: String },
    /// Either side canceled.
    FileCancel,
}

impl Message {
    /// Short kind name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::IdentityAssign { .. } => "identity-assign",
            Message::IdentityAnnounce { .. } => "identity-announce",
            Message::Roster { .. } => "roster",
            Message::History { .. } => "history",
            Message::FileAnnounce(_) => "file-announce",
            Message::FileDelete { .. } => "file-delete",
            Message::Goodbye { .. } => "goodbye",
            Message::Ping => "ping",
            Message::Pong => "pong",
            Message::FileRequest { .. } => "file-request",
            Message::FileStart { .. } => "file-start",
            Message::FileChunk { .. } => "file-chunk",
            Message::ChunkAck { .. } => "chunk-ack",
            Message::FileEnd => "file-end",
            Message::FileError { .. } => "file-error",
            Message::FileCancel => "file-cancel",
        }
    }

    /// Messages that only make sense on a download link.
    pub fn is_transfer(&self) -> bool {
        matches!(
            self,
            Message::FileRequest { .. }
                | Message::FileStart { .. }
                | Message::FileChunk { .. }
                | Message::ChunkAck { .. }
                | Message::FileEnd
                | Message::FileError { .. }
                | Message::FileCancel
        )
    }
}
