//! Chunked transfer engine: windowed, encrypted, acknowledged file transfer over a dedicated link.
//!
//! Session keys: the sender's standing offer and the receiver's record are keyed by
//! `(fingerprint, sender)`. An upload in progress is keyed by `(fingerprint, requester)`,
//! so one offer can serve several receivers at once without shared state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::chunk::{self, SealedChunk};
use crate::cipher::{self, CipherKey, NONCE_LEN};
use crate::config::Config;
use crate::core::{Action, LinkId, LinkIds, Notification};
use crate::identity::{Fingerprint, PeerId};
use crate::protocol::{FileRecord, LinkTag, Message};
use crate::session::{
    CancelReason, FileSource, InFlight, Role, Side, Sink, TransferKey, TransferSession,
    TransferState,
};

/// Message sent when a request names a file this node does not offer.
pub const FILE_NOT_FOUND: &str = "File not found locally";

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("unknown file {0}")]
    UnknownFile(Fingerprint),
    #[error("no key for encrypted file {0}")]
    MissingKey(Fingerprint),
    #[error("transfer of {0} already in progress")]
    AlreadyActive(Fingerprint),
}

/// How a finishing session's link goes away.
enum LinkExit {
    /// Close after a delay so trailing messages still arrive.
    After(Duration),
    Now,
    /// The link is already gone.
    Closed,
}

/// Result of one sender step.
enum Step {
    Sent,
    Paused,
    Finish(TransferState, Option<Message>),
}

pub struct TransferEngine {
    local: PeerId,
    config: Config,
    sessions: HashMap<TransferKey, TransferSession>,
    by_link: HashMap<LinkId, TransferKey>,
    pending_closes: Vec<(Instant, LinkId)>,
}

impl TransferEngine {
    pub fn new(local: PeerId, config: Config) -> Self {
        Self {
            local,
            config,
            sessions: HashMap::new(),
            by_link: HashMap::new(),
            pending_closes: Vec::new(),
        }
    }

    pub fn session(&self, key: &TransferKey) -> Option<&TransferSession> {
        self.sessions.get(key)
    }

    pub fn sessions(&self) -> impl Iterator<Item = &TransferSession> {
        self.sessions.values()
    }

    /// Whether `link` carries a transfer (or is waiting for its request).
    pub fn owns(&self, link: LinkId) -> bool {
        self.by_link.contains_key(&link)
    }

    /// Register a local file as a ready offer.
    pub fn offer(
        &mut self,
        fingerprint: Fingerprint,
        name: String,
        source: Arc<dyn FileSource>,
        cipher: CipherKey,
    ) {
        let key = TransferKey::new(fingerprint, self.local.clone());
        let session = TransferSession::offer(key.clone(), name, source, cipher, self.config.chunk_size);
        self.sessions.insert(key, session);
    }

    /// A record announced by another peer becomes a ready receiver session.
    pub fn on_record_added(&mut self, record: &FileRecord) {
        if record.sender == self.local {
            return;
        }
        let key = TransferKey::new(record.fingerprint.clone(), record.sender.clone());
        self.sessions
            .entry(key)
            .or_insert_with(|| TransferSession::receiver(record));
    }

    /// Drop idle sessions of a deleted file. Transfers already running finish on their own.
    pub fn on_record_removed(&mut self, fingerprint: &Fingerprint) {
        self.sessions.retain(|key, s| {
            &key.fingerprint != fingerprint || s.state == TransferState::Transferring
        });
    }

    /// Start downloading `fingerprint` into `sink`: opens a dedicated link to the sender.
    pub fn request(
        &mut self,
        fingerprint: &Fingerprint,
        sink: Box<dyn Sink>,
        ids: &mut LinkIds,
        now: Instant,
        out: &mut Vec<Action>,
    ) -> Result<(), TransferError> {
        let receive_timeout = self.config.receive_timeout();
        let session = self
            .sessions
            .values_mut()
            .find(|s| &s.key.fingerprint == fingerprint && s.role() == Role::Receiver)
            .ok_or_else(|| TransferError::UnknownFile(fingerprint.clone()))?;
        if session.state == TransferState::Transferring {
            return Err(TransferError::AlreadyActive(fingerprint.clone()));
        }
        if session.encrypted && session.cipher.is_none() {
            return Err(TransferError::MissingKey(fingerprint.clone()));
        }
        let Side::Receiver(side) = &mut session.side else {
            return Err(TransferError::UnknownFile(fingerprint.clone()));
        };
        side.sink = Some(sink);
        side.deadline = Some(now + receive_timeout);
        let link = ids.allocate();
        session.state = TransferState::Transferring;
        session.link = Some(link);
        let key = session.key.clone();
        info!(event = "download_requested", fingerprint = %fingerprint, sender = %key.peer, link = link.0, "Opening download link");
        out.push(Action::Open {
            link,
            peer: key.peer.clone(),
            tag: LinkTag::Download {
                fingerprint: fingerprint.clone(),
            },
        });
        self.by_link.insert(link, key.clone());
        self.notify(&key, out);
        Ok(())
    }

    /// The requester opened a download link to us.
    pub fn accept(&mut self, link: LinkId, peer: PeerId, fingerprint: Fingerprint) {
        debug!(event = "download_link_accepted", peer = %peer, fingerprint = %fingerprint, link = link.0, "Download link accepted");
        self.by_link
            .insert(link, TransferKey::new(fingerprint, peer));
    }

    /// A download link we opened is ready: ask for the file.
    pub fn on_link_open(&mut self, link: LinkId, out: &mut Vec<Action>) {
        let Some(key) = self.by_link.get(&link) else {
            return;
        };
        let Some(session) = self.sessions.get(key) else {
            return;
        };
        if session.role() == Role::Receiver && session.state == TransferState::Transferring {
            out.push(Action::Send {
                link,
                message: Message::FileRequest {
                    fingerprint: key.fingerprint.clone(),
                },
            });
        }
    }

    pub fn on_link_closed(&mut self, link: LinkId, now: Instant, out: &mut Vec<Action>) {
        self.pending_closes.retain(|(_, l)| *l != link);
        let Some(key) = self.by_link.remove(&link) else {
            return;
        };
        let active = self
            .sessions
            .get(&key)
            .map_or(false, |s| s.state == TransferState::Transferring && s.link == Some(link));
        if active {
            warn!(event = "download_link_lost", key = %key, link = link.0, "Download link closed mid-transfer");
            self.finish(
                &key,
                TransferState::Canceled(CancelReason::Connection),
                None,
                LinkExit::Closed,
                now,
                out,
            );
        }
    }

    /// Host reports the download link's outbound buffer level.
    pub fn on_link_drained(
        &mut self,
        link: LinkId,
        buffered: usize,
        now: Instant,
        out: &mut Vec<Action>,
    ) {
        let Some(key) = self.by_link.get(&link).cloned() else {
            return;
        };
        if let Some(TransferSession {
            side: Side::Sender(side),
            ..
        }) = self.sessions.get_mut(&key)
        {
            side.buffered = buffered;
        }
        self.pump(&key, now, out);
    }

    pub fn on_message(&mut self, link: LinkId, message: Message, now: Instant, out: &mut Vec<Action>) {
        let Some(key) = self.by_link.get(&link).cloned() else {
            debug!(event = "stray_transfer_message", link = link.0, kind = message.kind(), "No transfer on link");
            return;
        };
        if let Message::FileRequest { fingerprint } = message {
            self.on_request(link, key, fingerprint, now, out);
            return;
        }
        let Some(session) = self.sessions.get(&key) else {
            return;
        };
        if session.state != TransferState::Transferring {
            return;
        }
        match session.role() {
            Role::Sender => self.on_sender_message(&key, message, now, out),
            Role::Receiver => self.on_receiver_message(&key, message, now, out),
        }
    }

    /// User cancel of every running transfer of `fingerprint`. Returns whether any was running.
    pub fn cancel(&mut self, fingerprint: &Fingerprint, now: Instant, out: &mut Vec<Action>) -> bool {
        let keys: Vec<TransferKey> = self
            .sessions
            .iter()
            .filter(|(k, s)| &k.fingerprint == fingerprint && s.state == TransferState::Transferring)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &keys {
            let delay = self.close_delay(key);
            info!(event = "transfer_canceled", key = %key, "Transfer canceled by user");
            self.finish(
                key,
                TransferState::Canceled(CancelReason::User),
                Some(Message::FileCancel),
                LinkExit::After(delay),
                now,
                out,
            );
        }
        !keys.is_empty()
    }

    /// Local teardown: cancel everything and close every transfer link now.
    pub fn cancel_all(&mut self, now: Instant, out: &mut Vec<Action>) {
        let keys: Vec<TransferKey> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.state == TransferState::Transferring)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &keys {
            self.finish(
                key,
                TransferState::Canceled(CancelReason::User),
                Some(Message::FileCancel),
                LinkExit::Now,
                now,
                out,
            );
        }
        for (_, link) in self.pending_closes.drain(..) {
            out.push(Action::Close { link });
        }
        for (link, _) in self.by_link.drain() {
            out.push(Action::Close { link });
        }
    }

    /// Chunk retries, receive timeouts and delayed link closes.
    pub fn tick(&mut self, now: Instant, out: &mut Vec<Action>) {
        let keys: Vec<TransferKey> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.state == TransferState::Transferring)
            .map(|(k, _)| k.clone())
            .collect();
        for key in keys {
            self.check_timers(&key, now, out);
        }
        let (due, rest): (Vec<_>, Vec<_>) = self
            .pending_closes
            .drain(..)
            .partition(|(at, _)| *at <= now);
        self.pending_closes = rest;
        for (_, link) in due {
            debug!(event = "download_link_closed", link = link.0, "Closing finished download link");
            out.push(Action::Close { link });
        }
    }

    /// Earliest retry, receive deadline or delayed close.
    pub fn next_deadline(&self) -> Option<Instant> {
        let retry = self.config.chunk_retry();
        let session_deadlines = self
            .sessions
            .values()
            .filter(|s| s.state == TransferState::Transferring)
            .filter_map(|s| match &s.side {
                Side::Sender(side) => side.in_flight.values().map(|f| f.sent_at + retry).min(),
                Side::Receiver(side) => side.deadline,
            });
        session_deadlines
            .chain(self.pending_closes.iter().map(|(at, _)| *at))
            .min()
    }

    fn on_request(
        &mut self,
        link: LinkId,
        key: TransferKey,
        fingerprint: Fingerprint,
        now: Instant,
        out: &mut Vec<Action>,
    ) {
        if self.sessions.contains_key(&key) {
            debug!(event = "duplicate_request", key = %key, "Request already being served");
            return;
        }
        let offer_key = TransferKey::new(fingerprint.clone(), self.local.clone());
        let upload = if fingerprint == key.fingerprint {
            self.sessions
                .get(&offer_key)
                .and_then(|offer| TransferSession::upload(offer, key.peer.clone(), link))
        } else {
            None
        };
        let Some(upload) = upload else {
            warn!(event = "request_unknown_file", fingerprint = %fingerprint, requester = %key.peer, "Requested file is not offered here");
            out.push(Action::Send {
                link,
                message: Message::FileError {
                    error: FILE_NOT_FOUND.to_string(),
                },
            });
            self.by_link.remove(&link);
            self.pending_closes
                .push((now + self.config.close_grace(), link));
            return;
        };
        info!(event = "upload_started", key = %key, size = upload.size, link = link.0, "Serving file request");
        out.push(Action::Send {
            link,
            message: Message::FileStart {
                file_size: upload.size,
            },
        });
        self.sessions.insert(key.clone(), upload);
        self.notify(&key, out);
        self.pump(&key, now, out);
    }

    fn on_sender_message(
        &mut self,
        key: &TransferKey,
        message: Message,
        now: Instant,
        out: &mut Vec<Action>,
    ) {
        match message {
            Message::ChunkAck { chunk_id } => {
                let Some(TransferSession {
                    side: Side::Sender(side),
                    ..
                }) = self.sessions.get_mut(key)
                else {
                    return;
                };
                if chunk_id >= side.next_chunk_id {
                    debug!(event = "ack_ahead", key = %key, chunk_id, "Ack for a chunk not yet sent");
                    return;
                }
                let acked = side.last_acked.map_or(chunk_id, |prev| prev.max(chunk_id));
                side.last_acked = Some(acked);
                side.in_flight = side.in_flight.split_off(&(acked + 1));
                let done = side.fully_acked();
                if done {
                    self.finish(
                        key,
                        TransferState::Completed,
                        None,
                        LinkExit::After(self.config.close_grace()),
                        now,
                        out,
                    );
                } else {
                    self.notify(key, out);
                    self.pump(key, now, out);
                }
            }
            Message::FileCancel => {
                info!(event = "transfer_canceled", key = %key, "Receiver canceled");
                self.finish(
                    key,
                    TransferState::Canceled(CancelReason::Remote),
                    None,
                    LinkExit::After(self.config.close_grace()),
                    now,
                    out,
                );
            }
            other => {
                debug!(event = "ignored_transfer", key = %key, kind = other.kind(), "Unexpected message on upload link");
            }
        }
    }

    /// Produce chunks until a gate closes or the file ends.
    fn pump(&mut self, key: &TransferKey, now: Instant, out: &mut Vec<Action>) {
        loop {
            match self.step(key, now, out) {
                Step::Sent => continue,
                Step::Paused => return,
                Step::Finish(state, notice) => {
                    self.finish(
                        key,
                        state,
                        notice,
                        LinkExit::After(self.config.close_grace()),
                        now,
                        out,
                    );
                    return;
                }
            }
        }
    }

    fn step(&mut self, key: &TransferKey, now: Instant, out: &mut Vec<Action>) -> Step {
        let high_water = self.config.high_water_bytes;
        let window = self.config.window_size;
        let Some(session) = self.sessions.get_mut(key) else {
            return Step::Paused;
        };
        if session.state != TransferState::Transferring {
            return Step::Paused;
        }
        let (Some(link), Side::Sender(side)) = (session.link, &mut session.side) else {
            return Step::Paused;
        };
        if side.eof_sent {
            return Step::Paused;
        }
        if side.buffered > high_water {
            debug!(event = "backpressure", key = %key, buffered = side.buffered, "Outbound buffer above high-water mark");
            return Step::Paused;
        }
        if side.next_chunk_id == side.total_chunks {
            out.push(Action::Send {
                link,
                message: Message::FileEnd,
            });
            side.eof_sent = true;
            if side.fully_acked() {
                return Step::Finish(TransferState::Completed, None);
            }
            return Step::Paused;
        }
        if side.in_flight.len() as u64 >= window {
            return Step::Paused;
        }

        let chunk_id = side.next_chunk_id;
        let (start, end) = chunk::chunk_range(chunk_id, session.size, side.chunk_size);
        let plaintext = match side.source.read_at(start, (end - start) as usize) {
            Ok(bytes) if bytes.len() as u64 == end - start => bytes,
            Ok(bytes) => {
                let error = format!("short read at {}: {} of {} bytes", start, bytes.len(), end - start);
                return Step::Finish(TransferState::Failed(error.clone()), Some(Message::FileError { error }));
            }
            Err(e) => {
                let error = format!("read failed: {}", e);
                return Step::Finish(TransferState::Failed(error.clone()), Some(Message::FileError { error }));
            }
        };
        let sealed = match &session.cipher {
            Some(cipher) => match SealedChunk::seal(cipher, chunk_id, &plaintext) {
                Ok(sealed) => sealed,
                Err(e) => {
                    let error = format!("encryption failed: {}", e);
                    return Step::Finish(TransferState::Failed(error.clone()), Some(Message::FileError { error }));
                }
            },
            None => SealedChunk {
                chunk_id,
                ciphertext: plaintext,
                nonce: [0u8; NONCE_LEN],
            },
        };
        let wire_len = sealed.wire_len();
        let message = sealed.to_message();
        out.push(Action::Send {
            link,
            message: message.clone(),
        });
        side.in_flight.insert(
            chunk_id,
            InFlight {
                message,
                sent_at: now,
                retries: 0,
            },
        );
        side.buffered += wire_len;
        side.next_chunk_id += 1;
        side.offset = end;
        Step::Sent
    }

    fn on_receiver_message(
        &mut self,
        key: &TransferKey,
        message: Message,
        now: Instant,
        out: &mut Vec<Action>,
    ) {
        let receive_timeout = self.config.receive_timeout();
        let ack_interval = self.config.ack_interval;
        let close_delay = self.config.receiver_close_delay();
        let Some(session) = self.sessions.get_mut(key) else {
            return;
        };
        let (Some(link), Side::Receiver(side)) = (session.link, &mut session.side) else {
            return;
        };
        side.deadline = Some(now + receive_timeout);

        match message {
            Message::FileStart { file_size } => {
                debug!(event = "download_started", key = %key, file_size, "Sender accepted request");
                side.expected_bytes = file_size;
            }
            Message::FileChunk {
                chunk_id,
                ciphertext,
                nonce,
            } => {
                let expected = side.expected_chunk();
                if chunk_id < expected {
                    if let Some(last) = side.last_chunk_id {
                        out.push(Action::Send {
                            link,
                            message: Message::ChunkAck { chunk_id: last },
                        });
                    }
                    return;
                }
                if chunk_id > expected {
                    debug!(event = "chunk_gap", key = %key, chunk_id, expected, "Ignoring out-of-order chunk");
                    return;
                }
                let plaintext = match &session.cipher {
                    Some(cipher) => match cipher::open_chunk(cipher, &nonce, &ciphertext) {
                        Ok(p) => p,
                        Err(e) => {
                            warn!(event = "decrypt_failed", key = %key, chunk_id, error = %e, "Chunk failed authentication");
                            let state = TransferState::Canceled(CancelReason::Error);
                            self.finish(key, state, Some(Message::FileCancel), LinkExit::After(close_delay), now, out);
                            return;
                        }
                    },
                    None => ciphertext,
                };
                let written = match side.sink.as_mut() {
                    Some(sink) => sink.write(&plaintext),
                    None => Ok(()),
                };
                if let Err(e) = written {
                    warn!(event = "sink_write_failed", key = %key, chunk_id, error = %e, "Cannot write chunk");
                    let state = TransferState::Canceled(CancelReason::Error);
                    self.finish(key, state, Some(Message::FileCancel), LinkExit::After(close_delay), now, out);
                    return;
                }
                side.bytes_received += plaintext.len() as u64;
                side.last_chunk_id = Some(chunk_id);
                if chunk::is_ack_point(chunk_id, ack_interval) {
                    out.push(Action::Send {
                        link,
                        message: Message::ChunkAck { chunk_id },
                    });
                    self.notify(key, out);
                }
                self.try_complete(key, now, out);
            }
            Message::FileEnd => {
                side.end_seen = true;
                self.try_complete(key, now, out);
            }
            Message::FileError { error } => {
                warn!(event = "sender_error", key = %key, error = %error, "Sender aborted transfer");
                self.finish(
                    key,
                    TransferState::Canceled(CancelReason::Remote),
                    None,
                    LinkExit::After(close_delay),
                    now,
                    out,
                );
            }
            Message::FileCancel => {
                info!(event = "transfer_canceled", key = %key, "Sender canceled");
                self.finish(
                    key,
                    TransferState::Canceled(CancelReason::Remote),
                    None,
                    LinkExit::After(close_delay),
                    now,
                    out,
                );
            }
            other => {
                debug!(event = "ignored_transfer", key = %key, kind = other.kind(), "Unexpected message on download link");
            }
        }
    }

    /// Receiver: after end-of-file, once every byte is written, final ack and close the sink.
    fn try_complete(&mut self, key: &TransferKey, now: Instant, out: &mut Vec<Action>) {
        let close_delay = self.config.receiver_close_delay();
        let Some(session) = self.sessions.get_mut(key) else {
            return;
        };
        let (Some(link), Side::Receiver(side)) = (session.link, &mut session.side) else {
            return;
        };
        if !side.end_seen || side.bytes_received < side.expected_bytes {
            return;
        }
        if let Some(last) = side.last_chunk_id {
            out.push(Action::Send {
                link,
                message: Message::ChunkAck { chunk_id: last },
            });
        }
        let closed = match side.sink.take() {
            Some(mut sink) => {
                let result = sink.close();
                if result.is_err() {
                    sink.abort();
                }
                result
            }
            None => Ok(()),
        };
        let state = match closed {
            Ok(()) => TransferState::Completed,
            Err(e) => {
                warn!(event = "sink_close_failed", key = %key, error = %e, "Cannot finalize download");
                TransferState::Canceled(CancelReason::Error)
            }
        };
        self.finish(key, state, None, LinkExit::After(close_delay), now, out);
    }

    fn check_timers(&mut self, key: &TransferKey, now: Instant, out: &mut Vec<Action>) {
        let high_water = self.config.high_water_bytes;
        let retry = self.config.chunk_retry();
        let max_retries = self.config.max_chunk_retries;
        let Some(session) = self.sessions.get_mut(key) else {
            return;
        };
        let Some(link) = session.link else {
            return;
        };
        match &mut session.side {
            Side::Sender(side) => {
                // Chunks still sitting in our own outbound buffer are not lost; their clock
                // restarts once the buffer drains.
                if side.buffered > high_water {
                    for flight in side.in_flight.values_mut() {
                        flight.sent_at = now;
                    }
                    return;
                }
                let mut exhausted = None;
                for (id, flight) in side.in_flight.iter_mut() {
                    if flight.sent_at + retry > now {
                        continue;
                    }
                    if flight.retries >= max_retries {
                        exhausted = Some(*id);
                        break;
                    }
                    flight.retries += 1;
                    flight.sent_at = now;
                    debug!(event = "chunk_retry", key = %key, chunk_id = *id, attempt = flight.retries, "Resending unacknowledged chunk");
                    out.push(Action::Send {
                        link,
                        message: flight.message.clone(),
                    });
                }
                if let Some(id) = exhausted {
                    let error = format!("chunk {} unacknowledged after {} retries", id, max_retries);
                    warn!(event = "retries_exhausted", key = %key, chunk_id = id, "Giving up on transfer");
                    self.finish(
                        key,
                        TransferState::Failed(error.clone()),
                        Some(Message::FileError { error }),
                        LinkExit::After(self.config.close_grace()),
                        now,
                        out,
                    );
                }
            }
            Side::Receiver(side) => {
                if side.deadline.map_or(false, |d| d <= now) {
                    warn!(event = "receive_timeout", key = %key, "No data within receive timeout");
                    self.finish(
                        key,
                        TransferState::Canceled(CancelReason::Connection),
                        Some(Message::FileCancel),
                        LinkExit::After(self.config.receiver_close_delay()),
                        now,
                        out,
                    );
                }
            }
        }
    }

    fn close_delay(&self, key: &TransferKey) -> Duration {
        match self.sessions.get(key).map(TransferSession::role) {
            Some(Role::Receiver) => self.config.receiver_close_delay(),
            _ => self.config.close_grace(),
        }
    }

    /// Move a session to a terminal state: notice, notification, link teardown, registry removal.
    fn finish(
        &mut self,
        key: &TransferKey,
        state: TransferState,
        notice: Option<Message>,
        exit: LinkExit,
        now: Instant,
        out: &mut Vec<Action>,
    ) {
        let Some(mut session) = self.sessions.remove(key) else {
            return;
        };
        if let Some(link) = session.link {
            self.by_link.remove(&link);
            if !matches!(exit, LinkExit::Closed) {
                if let Some(message) = notice {
                    out.push(Action::Send { link, message });
                }
            }
            match exit {
                LinkExit::After(delay) => self.pending_closes.push((now + delay, link)),
                LinkExit::Now => out.push(Action::Close { link }),
                LinkExit::Closed => {}
            }
        }
        if let Side::Receiver(side) = &mut session.side {
            if let Some(mut sink) = side.sink.take() {
                sink.abort();
            }
        }
        match &state {
            TransferState::Completed => {
                info!(event = "transfer_completed", key = %key, bytes = session.size, "Transfer completed")
            }
            other => warn!(event = "transfer_ended", key = %key, state = ?other, "Transfer did not complete"),
        }
        let bytes = session.bytes_transferred();
        out.push(Action::Notify(Notification::Transfer {
            key: key.clone(),
            role: session.role(),
            state: state.clone(),
            bytes,
            size: session.size,
        }));
        if session.role() == Role::Receiver {
            self.sessions.insert(key.clone(), session.reset_receiver());
        }
    }

    fn notify(&self, key: &TransferKey, out: &mut Vec<Action>) {
        if let Some(s) = self.sessions.get(key) {
            out.push(Action::Notify(Notification::Transfer {
                key: key.clone(),
                role: s.role(),
                state: s.state.clone(),
                bytes: s.bytes_transferred(),
                size: s.size,
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::*;
    use crate::session::MemorySink;

    const SENDER_LINK: LinkId = LinkId(900);

    struct Pair {
        sender: TransferEngine,
        receiver: TransferEngine,
        ids: LinkIds,
        receiver_link: LinkId,
        record: FileRecord,
        sink: MemorySink,
        acks: Vec<u64>,
    }

    fn config() -> Config {
        Config {
            chunk_size: 4,
            window_size: 2,
            ack_interval: 2,
            ..Config::default()
        }
    }

    fn pair(data: Vec<u8>, config: Config) -> Pair {
        let alice = PeerId::new("alice");
        let bob = PeerId::new("bob");
        let mut sender = TransferEngine::new(alice.clone(), config.clone());
        let mut receiver = TransferEngine::new(bob, config);
        let key = CipherKey::generate();
        let fp = Fingerprint::new("alice-1-00000a");
        let record = FileRecord {
            fingerprint: fp.clone(),
            name: "data.bin".into(),
            size: data.len() as u64,
            sender: alice,
            sender_name: "Host".into(),
            encrypted: true,
            key: Some(key.clone()),
        };
        sender.offer(fp, "data.bin".into(), Arc::new(data), key);
        receiver.on_record_added(&record);
        Pair {
            sender,
            receiver,
            ids: LinkIds::default(),
            receiver_link: LinkId(0),
            record,
            sink: MemorySink::new(),
            acks: Vec::new(),
        }
    }

    fn messages(out: &[Action], link: LinkId) -> Vec<Message> {
        out.iter()
            .filter_map(|a| match a {
                Action::Send { link: l, message } if *l == link => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    fn chunk_ids(msgs: &[Message]) -> Vec<u64> {
        msgs.iter()
            .filter_map(|m| match m {
                Message::FileChunk { chunk_id, .. } => Some(*chunk_id),
                _ => None,
            })
            .collect()
    }

    fn transfer_states(out: &[Action]) -> Vec<TransferState> {
        out.iter()
            .filter_map(|a| match a {
                Action::Notify(Notification::Transfer { state, .. }) => Some(state.clone()),
                _ => None,
            })
            .collect()
    }

    impl Pair {
        /// Request the download and deliver the request. Returns the sender's first output.
        fn start(&mut self, now: Instant) -> Vec<Action> {
            let sink = Box::new(self.sink.clone());
            self.start_with(sink, now)
        }

        fn start_with(&mut self, sink: Box<dyn Sink>, now: Instant) -> Vec<Action> {
            let mut out = Vec::new();
            let fp = self.record.fingerprint.clone();
            self.receiver
                .request(&fp, sink, &mut self.ids, now, &mut out)
                .unwrap();
            self.receiver_link = match out.iter().find(|a| matches!(a, Action::Open { .. })) {
                Some(Action::Open { link, .. }) => *link,
                _ => panic!("no Open"),
            };
            self.sender
                .accept(SENDER_LINK, PeerId::new("bob"), fp);
            out.clear();
            self.receiver.on_link_open(self.receiver_link, &mut out);
            let mut sender_out = Vec::new();
            for m in messages(&out, self.receiver_link) {
                self.sender.on_message(SENDER_LINK, m, now, &mut sender_out);
            }
            sender_out
        }

        fn to_receiver(&mut self, msgs: Vec<Message>, now: Instant) -> Vec<Action> {
            let mut out = Vec::new();
            for m in msgs {
                self.receiver
                    .on_message(self.receiver_link, m, now, &mut out);
            }
            out
        }

        fn to_sender(&mut self, msgs: Vec<Message>, now: Instant) -> Vec<Action> {
            let mut out = Vec::new();
            for m in msgs {
                if let Message::ChunkAck { chunk_id } = m {
                    self.acks.push(chunk_id);
                }
                self.sender.on_message(SENDER_LINK, m, now, &mut out);
            }
            out
        }

        fn upload_key(&self) -> TransferKey {
            TransferKey::new(self.record.fingerprint.clone(), PeerId::new("bob"))
        }
    }

    #[test]
    fn five_chunks_window_two_ack_two() {
        let data: Vec<u8> = (0u8..20).collect();
        let mut p = pair(data.clone(), config());
        let now = Instant::now();

        let out = p.start(now);
        let msgs = messages(&out, SENDER_LINK);
        assert!(matches!(msgs[0], Message::FileStart { file_size: 20 }));
        assert_eq!(chunk_ids(&msgs), vec![0, 1]);

        let out = p.to_receiver(msgs, now);
        let acks = messages(&out, p.receiver_link);
        assert!(matches!(acks[..], [Message::ChunkAck { chunk_id: 1 }]));

        let out = p.to_sender(acks, now);
        let msgs = messages(&out, SENDER_LINK);
        assert_eq!(chunk_ids(&msgs), vec![2, 3]);

        let out = p.to_receiver(msgs, now);
        let acks = messages(&out, p.receiver_link);
        assert!(matches!(acks[..], [Message::ChunkAck { chunk_id: 3 }]));

        let out = p.to_sender(acks, now);
        let msgs = messages(&out, SENDER_LINK);
        assert_eq!(chunk_ids(&msgs), vec![4]);
        assert!(matches!(msgs.last(), Some(Message::FileEnd)));

        let out = p.to_receiver(msgs, now);
        assert!(transfer_states(&out).contains(&TransferState::Completed));
        let acks = messages(&out, p.receiver_link);
        assert!(matches!(acks[..], [Message::ChunkAck { chunk_id: 4 }]));

        let out = p.to_sender(acks, now);
        assert!(transfer_states(&out).contains(&TransferState::Completed));
        assert!(p.sender.session(&p.upload_key()).is_none());
        assert_eq!(p.acks, vec![1, 3, 4]);

        let output = p.sink.output();
        let o = output.lock().unwrap();
        assert_eq!(o.bytes, data);
        assert!(o.closed);
        assert!(!o.aborted);

        // The record is ready again for another download.
        let rk = TransferKey::new(p.record.fingerprint.clone(), PeerId::new("alice"));
        assert_eq!(p.receiver.session(&rk).unwrap().state(), &TransferState::Ready);
    }

    #[test]
    fn sender_closes_link_after_grace() {
        let data: Vec<u8> = (0u8..8).collect();
        let mut p = pair(data, config());
        let now = Instant::now();
        let msgs = messages(&p.start(now), SENDER_LINK);
        let acks = messages(&p.to_receiver(msgs, now), p.receiver_link);
        let out = p.to_sender(acks, now);
        let tail = messages(&out, SENDER_LINK);
        let acks = messages(&p.to_receiver(tail, now), p.receiver_link);
        p.to_sender(acks, now);

        let mut out = Vec::new();
        p.sender.tick(now + Duration::from_millis(4_999), &mut out);
        assert!(!out.iter().any(|a| matches!(a, Action::Close { .. })));
        p.sender.tick(now + Duration::from_secs(5), &mut out);
        assert!(out
            .iter()
            .any(|a| matches!(a, Action::Close { link } if *link == SENDER_LINK)));
    }

    #[test]
    fn receiver_cancel_stops_sender() {
        let data: Vec<u8> = (0u8..40).collect();
        let mut p = pair(data, config());
        let now = Instant::now();
        let msgs = messages(&p.start(now), SENDER_LINK);
        p.to_receiver(msgs, now);

        let mut out = Vec::new();
        assert!(p.receiver.cancel(&p.record.fingerprint, now, &mut out));
        assert!(transfer_states(&out).contains(&TransferState::Canceled(CancelReason::User)));
        let notices = messages(&out, p.receiver_link);
        assert!(matches!(notices[..], [Message::FileCancel]));
        assert!(p.sink.output().lock().unwrap().aborted);

        let out = p.to_sender(notices, now);
        assert!(transfer_states(&out).contains(&TransferState::Canceled(CancelReason::Remote)));
        assert!(chunk_ids(&messages(&out, SENDER_LINK)).is_empty());

        // Late acks produce nothing.
        let out = p.to_sender(vec![Message::ChunkAck { chunk_id: 1 }], now);
        assert!(out.is_empty());

        let mut out = Vec::new();
        p.sender.tick(now + Duration::from_secs(5), &mut out);
        assert!(out
            .iter()
            .any(|a| matches!(a, Action::Close { link } if *link == SENDER_LINK)));
        assert!(chunk_ids(&messages(&out, SENDER_LINK)).is_empty());
    }

    #[test]
    fn tampered_chunk_cancels_receiver_with_error() {
        let data: Vec<u8> = (0u8..20).collect();
        let mut p = pair(data, config());
        let now = Instant::now();
        let mut msgs = messages(&p.start(now), SENDER_LINK);
        for m in msgs.iter_mut() {
            if let Message::FileChunk { ciphertext, .. } = m {
                ciphertext[0] ^= 0x01;
            }
        }
        let out = p.to_receiver(msgs, now);
        assert_eq!(
            transfer_states(&out),
            vec![TransferState::Canceled(CancelReason::Error)]
        );
        let notices = messages(&out, p.receiver_link);
        assert!(matches!(notices[..], [Message::FileCancel]));
        {
            let o = p.sink.output();
            let o = o.lock().unwrap();
            assert!(o.aborted);
            assert!(o.bytes.is_empty());
        }

        // The sender hears about it and stops.
        let out = p.to_sender(notices, now);
        assert!(transfer_states(&out).contains(&TransferState::Canceled(CancelReason::Remote)));
    }

    struct FullDisk;

    impl Sink for FullDisk {
        fn write(&mut self, _: &[u8]) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::Other, "no space left"))
        }

        fn close(&mut self) -> io::Result<()> {
            Ok(())
        }

        fn abort(&mut self) {}
    }

    #[test]
    fn sink_write_failure_cancels_with_error() {
        let mut p = pair((0u8..20).collect(), config());
        let now = Instant::now();
        let msgs = messages(&p.start_with(Box::new(FullDisk), now), SENDER_LINK);
        let out = p.to_receiver(msgs, now);
        assert_eq!(
            transfer_states(&out),
            vec![TransferState::Canceled(CancelReason::Error)]
        );
        assert!(matches!(
            messages(&out, p.receiver_link)[..],
            [Message::FileCancel]
        ));
    }

    #[test]
    fn duplicate_chunk_is_reacked_and_gap_ignored() {
        let data: Vec<u8> = (0u8..20).collect();
        let mut p = pair(data, config());
        let now = Instant::now();
        let msgs = messages(&p.start(now), SENDER_LINK);
        let first_two = msgs.clone();
        p.to_receiver(msgs, now);

        let out = p.to_receiver(first_two, now);
        let acks = messages(&out, p.receiver_link);
        assert!(acks
            .iter()
            .all(|m| matches!(m, Message::ChunkAck { chunk_id: 1 })));
        assert_eq!(acks.len(), 2);

        let out = p.to_receiver(
            vec![Message::FileChunk {
                chunk_id: 3,
                ciphertext: vec![1, 2, 3],
                nonce: [0u8; NONCE_LEN],
            }],
            now,
        );
        assert!(out.is_empty());
        assert_eq!(p.sink.output().lock().unwrap().bytes.len(), 8);
    }

    #[test]
    fn retries_then_fails() {
        let data: Vec<u8> = (0u8..20).collect();
        let mut p = pair(data, config());
        let t0 = Instant::now();
        p.start(t0);

        let mut now = t0;
        for attempt in 1..=5 {
            now += Duration::from_secs(5);
            let mut out = Vec::new();
            p.sender.tick(now, &mut out);
            let resent = chunk_ids(&messages(&out, SENDER_LINK));
            assert_eq!(resent, vec![0, 1], "attempt {}", attempt);
        }
        now += Duration::from_secs(5);
        let mut out = Vec::new();
        p.sender.tick(now, &mut out);
        assert!(transfer_states(&out)
            .iter()
            .any(|s| matches!(s, TransferState::Failed(_))));
        assert!(matches!(
            messages(&out, SENDER_LINK)[..],
            [Message::FileError { .. }]
        ));
    }

    #[test]
    fn slow_link_does_not_count_as_lost_chunks() {
        let cfg = Config {
            window_size: 1,
            high_water_bytes: 30,
            ..config()
        };
        let mut p = pair((0u8..40).collect(), cfg);
        let key = p.upload_key();
        let t0 = Instant::now();
        assert_eq!(chunk_ids(&messages(&p.start(t0), SENDER_LINK)), vec![0]);

        // The chunk sits in our own outbound buffer for a minute.
        let mut now = t0;
        for _ in 0..12 {
            now += Duration::from_secs(5);
            let mut out = Vec::new();
            p.sender.on_link_drained(SENDER_LINK, 40, now, &mut out);
            p.sender.tick(now, &mut out);
            assert!(chunk_ids(&messages(&out, SENDER_LINK)).is_empty());
            assert!(transfer_states(&out).is_empty());
        }
        assert_eq!(
            *p.sender.session(&key).unwrap().state(),
            TransferState::Transferring
        );

        // Once written out, the retry clock starts from there.
        let mut out = Vec::new();
        p.sender.on_link_drained(SENDER_LINK, 0, now, &mut out);
        p.sender.tick(now + Duration::from_secs(4), &mut out);
        assert!(chunk_ids(&messages(&out, SENDER_LINK)).is_empty());
        p.sender.tick(now + Duration::from_secs(5), &mut out);
        assert_eq!(chunk_ids(&messages(&out, SENDER_LINK)), vec![0]);
    }

    #[test]
    fn ack_leaves_buffer_level_to_drain_reports() {
        let cfg = Config {
            window_size: 100,
            high_water_bytes: 30,
            ..config()
        };
        let mut p = pair((0u8..40).collect(), cfg);
        let now = Instant::now();
        let msgs = messages(&p.start(now), SENDER_LINK);
        assert_eq!(chunk_ids(&msgs), vec![0]);
        p.to_receiver(msgs, now);
        // Even a covering ack does not free buffer space the host has not reported.
        let out = p.to_sender(vec![Message::ChunkAck { chunk_id: 0 }], now);
        assert!(chunk_ids(&messages(&out, SENDER_LINK)).is_empty());
        let mut out = Vec::new();
        p.sender.on_link_drained(SENDER_LINK, 0, now, &mut out);
        assert_eq!(chunk_ids(&messages(&out, SENDER_LINK)), vec![1]);
    }

    #[test]
    fn retry_resends_identical_frame() {
        let data: Vec<u8> = (0u8..20).collect();
        let mut p = pair(data, config());
        let t0 = Instant::now();
        let first = messages(&p.start(t0), SENDER_LINK);
        let mut out = Vec::new();
        p.sender.tick(t0 + Duration::from_secs(5), &mut out);
        let resent = messages(&out, SENDER_LINK);
        match (&first[1], &resent[0]) {
            (
                Message::FileChunk {
                    ciphertext: a,
                    nonce: na,
                    ..
                },
                Message::FileChunk {
                    ciphertext: b,
                    nonce: nb,
                    ..
                },
            ) => {
                assert_eq!(a, b);
                assert_eq!(na, nb);
            }
            _ => panic!("expected chunks"),
        }
    }

    #[test]
    fn receiver_times_out() {
        let mut p = pair(vec![7u8; 20], config());
        let t0 = Instant::now();
        p.start(t0);
        let mut out = Vec::new();
        p.receiver.tick(t0 + Duration::from_secs(29), &mut out);
        assert!(transfer_states(&out).is_empty());
        p.receiver.tick(t0 + Duration::from_secs(30), &mut out);
        assert!(transfer_states(&out).contains(&TransferState::Canceled(CancelReason::Connection)));
    }

    #[test]
    fn missing_file_answers_error() {
        let mut engine = TransferEngine::new(PeerId::new("alice"), config());
        let now = Instant::now();
        engine.accept(SENDER_LINK, PeerId::new("bob"), Fingerprint::new("nope"));
        let mut out = Vec::new();
        engine.on_message(
            SENDER_LINK,
            Message::FileRequest {
                fingerprint: Fingerprint::new("nope"),
            },
            now,
            &mut out,
        );
        match &messages(&out, SENDER_LINK)[..] {
            [Message::FileError { error }] => assert_eq!(error, FILE_NOT_FOUND),
            other => panic!("unexpected {:?}", other),
        }
        let mut out = Vec::new();
        engine.tick(now + Duration::from_secs(5), &mut out);
        assert!(out.iter().any(|a| matches!(a, Action::Close { .. })));
    }

    #[test]
    fn link_loss_cancels_both_sides() {
        let mut p = pair(vec![1u8; 40], config());
        let now = Instant::now();
        p.start(now);
        let mut out = Vec::new();
        p.sender.on_link_closed(SENDER_LINK, now, &mut out);
        p.receiver.on_link_closed(p.receiver_link, now, &mut out);
        let states = transfer_states(&out);
        assert_eq!(
            states,
            vec![
                TransferState::Canceled(CancelReason::Connection),
                TransferState::Canceled(CancelReason::Connection)
            ]
        );
        assert!(!out.iter().any(|a| matches!(a, Action::Close { .. })));
    }

    #[test]
    fn backpressure_waits_for_drain() {
        let cfg = Config {
            window_size: 100,
            high_water_bytes: 30,
            ..config()
        };
        let mut p = pair((0u8..40).collect(), cfg);
        let now = Instant::now();
        let sent = chunk_ids(&messages(&p.start(now), SENDER_LINK));
        // Each sealed 4-byte chunk costs 4 + 16 tag + 12 nonce + 8 bytes.
        assert_eq!(sent, vec![0]);

        let mut out = Vec::new();
        p.sender.on_link_drained(SENDER_LINK, 0, now, &mut out);
        assert_eq!(chunk_ids(&messages(&out, SENDER_LINK)), vec![1]);
    }

    #[test]
    fn window_bounds_in_flight() {
        let mut p = pair((0u8..200).collect(), config());
        let now = Instant::now();
        p.start(now);
        let key = p.upload_key();
        assert_eq!(p.sender.session(&key).unwrap().in_flight(), 2);
        let mut out = Vec::new();
        p.sender.on_link_drained(SENDER_LINK, 0, now, &mut out);
        assert_eq!(p.sender.session(&key).unwrap().in_flight(), 2);
        assert!(chunk_ids(&messages(&out, SENDER_LINK)).is_empty());
    }

    #[test]
    fn stale_ack_never_regresses() {
        let mut p = pair((0u8..40).collect(), config());
        let now = Instant::now();
        let msgs = messages(&p.start(now), SENDER_LINK);
        let acks = messages(&p.to_receiver(msgs, now), p.receiver_link);
        p.to_sender(acks, now);
        p.to_sender(vec![Message::ChunkAck { chunk_id: 0 }], now);
        let key = p.upload_key();
        assert_eq!(p.sender.session(&key).unwrap().last_acked(), Some(1));
    }

    #[test]
    fn empty_file_completes_on_end() {
        let mut p = pair(Vec::new(), config());
        let now = Instant::now();
        let out = p.start(now);
        assert!(transfer_states(&out).contains(&TransferState::Completed));
        let msgs = messages(&out, SENDER_LINK);
        let out = p.to_receiver(msgs, now);
        assert!(transfer_states(&out).contains(&TransferState::Completed));
        assert!(p.sink.output().lock().unwrap().closed);
    }

    #[test]
    fn request_errors() {
        let mut p = pair(vec![1u8; 4], config());
        let now = Instant::now();
        let mut out = Vec::new();
        let unknown = p.receiver.request(
            &Fingerprint::new("missing"),
            Box::new(MemorySink::new()),
            &mut p.ids,
            now,
            &mut out,
        );
        assert!(matches!(unknown, Err(TransferError::UnknownFile(_))));

        p.start(now);
        let again = p.receiver.request(
            &p.record.fingerprint.clone(),
            Box::new(MemorySink::new()),
            &mut p.ids,
            now,
            &mut out,
        );
        assert!(matches!(again, Err(TransferError::AlreadyActive(_))));
    }

    #[test]
    fn encrypted_record_without_key_is_rejected() {
        let mut engine = TransferEngine::new(PeerId::new("bob"), config());
        let record = FileRecord {
            fingerprint: Fingerprint::new("alice-1-00000b"),
            name: "secret.bin".into(),
            size: 10,
            sender: PeerId::new("alice"),
            sender_name: "Host".into(),
            encrypted: true,
            key: None,
        };
        engine.on_record_added(&record);
        let mut out = Vec::new();
        let result = engine.request(
            &record.fingerprint,
            Box::new(MemorySink::new()),
            &mut LinkIds::default(),
            Instant::now(),
            &mut out,
        );
        assert!(matches!(result, Err(TransferError::MissingKey(_))));
        assert!(out.is_empty());
    }

    #[test]
    fn plaintext_record_writes_chunks_verbatim() {
        let mut engine = TransferEngine::new(PeerId::new("bob"), config());
        let record = FileRecord {
            fingerprint: Fingerprint::new("carol-1-00000c"),
            name: "plain.txt".into(),
            size: 3,
            sender: PeerId::new("carol"),
            sender_name: "Participant 2".into(),
            encrypted: false,
            key: None,
        };
        engine.on_record_added(&record);
        let sink = MemorySink::new();
        let now = Instant::now();
        let mut ids = LinkIds::default();
        let mut out = Vec::new();
        engine
            .request(&record.fingerprint, Box::new(sink.clone()), &mut ids, now, &mut out)
            .unwrap();
        let link = LinkId(0);
        for m in [
            Message::FileStart { file_size: 3 },
            Message::FileChunk {
                chunk_id: 0,
                ciphertext: vec![1, 2, 3],
                nonce: [0u8; NONCE_LEN],
            },
            Message::FileEnd,
        ] {
            engine.on_message(link, m, now, &mut out);
        }
        assert!(transfer_states(&out).contains(&TransferState::Completed));
        assert_eq!(sink.output().lock().unwrap().bytes, vec![1, 2, 3]);
    }
}
