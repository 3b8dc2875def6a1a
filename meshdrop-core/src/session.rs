//! Transfer sessions: per-file, per-peer-pair state for one side of a transfer.

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::chunk;
use crate::cipher::CipherKey;
use crate::core::LinkId;
use crate::identity::{Fingerprint, PeerId};
use crate::protocol::{FileRecord, Message};

/// Registry key of a session. See [`TransferEngine`](crate::transfer::TransferEngine) for which peer goes here.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransferKey {
    pub fingerprint: Fingerprint,
    pub peer: PeerId,
}

impl TransferKey {
    pub fn new(fingerprint: Fingerprint, peer: PeerId) -> Self {
        Self { fingerprint, peer }
    }
}

impl fmt::Display for TransferKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.fingerprint, self.peer)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Sender,
    Receiver,
}

/// Why a session ended in `Canceled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The local user canceled (or left the mesh).
    User,
    /// The other side sent `FileCancel` or `FileError`.
    Remote,
    /// The download link closed or went quiet.
    Connection,
    /// A received chunk could not be decrypted or written.
    Error,
}

impl CancelReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CancelReason::User => "user",
            CancelReason::Remote => "remote",
            CancelReason::Connection => "connection",
            CancelReason::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferState {
    Ready,
    Transferring,
    Completed,
    Canceled(CancelReason),
    Failed(String),
}

impl TransferState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferState::Completed | TransferState::Canceled(_) | TransferState::Failed(_)
        )
    }
}

/// Random-access byte source for a shared file.
pub trait FileSource: Send + Sync {
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read up to `len` bytes at `offset`. Short reads only at end of file.
    fn read_at(&self, offset: u64, len: usize) -> io::Result<Vec<u8>>;
}

impl FileSource for Vec<u8> {
    fn len(&self) -> u64 {
        self.as_slice().len() as u64
    }

    fn read_at(&self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        let start = usize::try_from(offset)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "offset out of range"))?
            .min(self.as_slice().len());
        let end = start.saturating_add(len).min(self.as_slice().len());
        Ok(self[start..end].to_vec())
    }
}

/// Destination for downloaded bytes. Written strictly in order.
pub trait Sink: Send {
    fn write(&mut self, bytes: &[u8]) -> io::Result<()>;
    /// All bytes arrived; make the output durable.
    fn close(&mut self) -> io::Result<()>;
    /// Transfer did not complete; discard partial output.
    fn abort(&mut self);
}

/// What a [`MemorySink`] has seen. Shared so the caller can inspect it after the core owns the sink.
#[derive(Debug, Default)]
pub struct MemoryOutput {
    pub bytes: Vec<u8>,
    pub closed: bool,
    pub aborted: bool,
}

/// In-memory sink for embedding and tests.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    output: Arc<Mutex<MemoryOutput>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn output(&self) -> Arc<Mutex<MemoryOutput>> {
        Arc::clone(&self.output)
    }

    fn with<R>(&self, f: impl FnOnce(&mut MemoryOutput) -> R) -> io::Result<R> {
        let mut out = self
            .output
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "memory sink poisoned"))?;
        Ok(f(&mut out))
    }
}

impl Sink for MemorySink {
    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.with(|o| o.bytes.extend_from_slice(bytes))
    }

    fn close(&mut self) -> io::Result<()> {
        self.with(|o| o.closed = true)
    }

    fn abort(&mut self) {
        let _ = self.with(|o| o.aborted = true);
    }
}

/// A chunk sent but not yet covered by a cumulative ack.
#[derive(Debug, Clone)]
pub(crate) struct InFlight {
    /// Stored frame; a retry resends it unchanged.
    pub message: Message,
    pub sent_at: Instant,
    pub retries: u32,
}

pub(crate) struct SenderSide {
    pub source: Arc<dyn FileSource>,
    pub offset: u64,
    pub next_chunk_id: u64,
    pub last_acked: Option<u64>,
    pub in_flight: BTreeMap<u64, InFlight>,
    /// Last host-reported outbound buffer of the download link, plus what we queued since.
    /// Acks never lower it; only a drain report does.
    pub buffered: usize,
    pub eof_sent: bool,
    pub chunk_size: usize,
    pub total_chunks: u64,
}

impl SenderSide {
    fn new(source: Arc<dyn FileSource>, chunk_size: usize) -> Self {
        let total_chunks = chunk::chunk_count(source.len(), chunk_size);
        Self {
            source,
            offset: 0,
            next_chunk_id: 0,
            last_acked: None,
            in_flight: BTreeMap::new(),
            buffered: 0,
            eof_sent: false,
            chunk_size,
            total_chunks,
        }
    }

    /// Every chunk has been sent and the last one acknowledged.
    pub fn fully_acked(&self) -> bool {
        self.eof_sent
            && (self.total_chunks == 0
                || self.last_acked.map_or(false, |a| a + 1 >= self.total_chunks))
    }
}

pub(crate) struct ReceiverSide {
    pub sink: Option<Box<dyn Sink>>,
    pub bytes_received: u64,
    pub expected_bytes: u64,
    pub last_chunk_id: Option<u64>,
    /// `FileEnd` arrived; completion waits until every byte is written.
    pub end_seen: bool,
    /// Inactivity deadline, pushed forward by every inbound transfer message.
    pub deadline: Option<Instant>,
}

impl ReceiverSide {
    /// Id of the next chunk that may be written.
    pub fn expected_chunk(&self) -> u64 {
        self.last_chunk_id.map_or(0, |id| id + 1)
    }
}

pub(crate) enum Side {
    Sender(SenderSide),
    Receiver(ReceiverSide),
}

/// One side of one file transfer. Exclusively owns its source or sink and its key.
pub struct TransferSession {
    pub(crate) key: TransferKey,
    pub(crate) name: String,
    pub(crate) size: u64,
    pub(crate) encrypted: bool,
    pub(crate) cipher: Option<CipherKey>,
    pub(crate) state: TransferState,
    pub(crate) link: Option<LinkId>,
    pub(crate) side: Side,
}

impl TransferSession {
    /// The sender's standing offer: ready until deleted, cloned into one upload per request.
    pub(crate) fn offer(
        key: TransferKey,
        name: String,
        source: Arc<dyn FileSource>,
        cipher: CipherKey,
        chunk_size: usize,
    ) -> Self {
        let size = source.len();
        Self {
            key,
            name,
            size,
            encrypted: true,
            cipher: Some(cipher),
            state: TransferState::Ready,
            link: None,
            side: Side::Sender(SenderSide::new(source, chunk_size)),
        }
    }

    /// An upload to one requester, started from `offer`.
    pub(crate) fn upload(offer: &TransferSession, requester: PeerId, link: LinkId) -> Option<Self> {
        let Side::Sender(side) = &offer.side else {
            return None;
        };
        Some(Self {
            key: TransferKey::new(offer.key.fingerprint.clone(), requester),
            name: offer.name.clone(),
            size: offer.size,
            encrypted: offer.encrypted,
            cipher: offer.cipher.clone(),
            state: TransferState::Transferring,
            link: Some(link),
            side: Side::Sender(SenderSide::new(Arc::clone(&side.source), side.chunk_size)),
        })
    }

    /// Receiver record, created when the file's announcement arrives.
    pub(crate) fn receiver(record: &FileRecord) -> Self {
        Self {
            key: TransferKey::new(record.fingerprint.clone(), record.sender.clone()),
            name: record.name.clone(),
            size: record.size,
            encrypted: record.encrypted,
            cipher: record.key.clone(),
            state: TransferState::Ready,
            link: None,
            side: Side::Receiver(ReceiverSide {
                sink: None,
                bytes_received: 0,
                expected_bytes: record.size,
                last_chunk_id: None,
                end_seen: false,
                deadline: None,
            }),
        }
    }

    /// A fresh ready receiver for the same file, used once a download ends.
    pub(crate) fn reset_receiver(&self) -> Self {
        Self {
            key: self.key.clone(),
            name: self.name.clone(),
            size: self.size,
            encrypted: self.encrypted,
            cipher: self.cipher.clone(),
            state: TransferState::Ready,
            link: None,
            side: Side::Receiver(ReceiverSide {
                sink: None,
                bytes_received: 0,
                expected_bytes: self.size,
                last_chunk_id: None,
                end_seen: false,
                deadline: None,
            }),
        }
    }

    pub fn key(&self) -> &TransferKey {
        &self.key
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn state(&self) -> &TransferState {
        &self.state
    }

    pub fn link(&self) -> Option<LinkId> {
        self.link
    }

    pub fn role(&self) -> Role {
        match self.side {
            Side::Sender(_) => Role::Sender,
            Side::Receiver(_) => Role::Receiver,
        }
    }

    /// Bytes acknowledged (sender) or written (receiver).
    pub fn bytes_transferred(&self) -> u64 {
        match &self.side {
            Side::Sender(s) => s
                .last_acked
                .map_or(0, |id| (id + 1).saturating_mul(s.chunk_size as u64).min(self.size)),
            Side::Receiver(r) => r.bytes_received,
        }
    }

    /// Highest cumulative ack seen (sender only).
    pub fn last_acked(&self) -> Option<u64> {
        match &self.side {
            Side::Sender(s) => s.last_acked,
            Side::Receiver(_) => None,
        }
    }

    /// Chunks sent and not yet acknowledged (sender only).
    pub fn in_flight(&self) -> usize {
        match &self.side {
            Side::Sender(s) => s.in_flight.len(),
            Side::Receiver(_) => 0,
        }
    }
}

impl fmt::Debug for TransferSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferSession")
            .field("key", &self.key)
            .field("role", &self.role())
            .field("state", &self.state)
            .field("link", &self.link)
            .field("bytes", &self.bytes_transferred())
            .finish()
    }
}
