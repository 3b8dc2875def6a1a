//! TCP transport: carries core actions over real sockets.
//!
//! Every link is one TCP connection. The dialing side sends a `Hello` naming itself and
//! the link's purpose, the accepting side answers with its own `Hello`, then both sides
//! exchange length-prefixed envelopes until either closes.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use meshdrop_core::wire::{decode_payload, encode_frame, frame_len, LEN_SIZE};
use meshdrop_core::{
    Action, FileSource, Fingerprint, LinkId, LinkTag, MeshCore, Message, Notification, PeerId,
    TransferState, PROTOCOL_VERSION,
};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

use crate::files::DiskSink;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// Upper bound on how long the tick loop sleeps when no deadline is near.
const MAX_TICK_SLEEP: Duration = Duration::from_secs(1);

/// What travels on a TCP link. Core messages are wrapped so the transport can add its own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Envelope {
    /// First frame in each direction.
    Hello {
        version: u8,
        peer: PeerId,
        listen_port: u16,
        tag: LinkTag,
    },
    /// Coordinator tells participants where everyone listens, so download links can be dialed directly.
    Directory(Vec<(PeerId, SocketAddr)>),
    Message(Message),
}

/// Host-side state of one link.
struct LinkHandle {
    peer: PeerId,
    tag: LinkTag,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    queued: Arc<AtomicUsize>,
    task: Option<AbortHandle>,
}

/// Node-level knobs that live outside the core.
#[derive(Debug, Clone)]
pub struct NodeOptions {
    pub listen_port: u16,
    pub download_dir: PathBuf,
    pub auto_download: bool,
}

/// One running mesh node: the core plus every socket it drives.
pub struct Node {
    core: Mutex<MeshCore>,
    local: PeerId,
    coordinator: bool,
    options: NodeOptions,
    directory: Mutex<HashMap<PeerId, SocketAddr>>,
    links: Mutex<HashMap<LinkId, LinkHandle>>,
    actions: mpsc::UnboundedSender<Vec<Action>>,
    pending: Mutex<Option<mpsc::UnboundedReceiver<Vec<Action>>>>,
    ended: Notify,
}

impl Node {
    pub fn new(core: MeshCore, options: NodeOptions) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            local: core.local_id().clone(),
            coordinator: core.is_coordinator(),
            core: Mutex::new(core),
            options,
            directory: Mutex::new(HashMap::new()),
            links: Mutex::new(HashMap::new()),
            actions: tx,
            pending: Mutex::new(Some(rx)),
            ended: Notify::new(),
        })
    }

    /// Spawn the accept loop, action executor and timer loop.
    pub async fn start(self: &Arc<Self>, listener: TcpListener) -> io::Result<()> {
        let rx = self
            .pending
            .lock()
            .await
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "node already started"))?;
        info!(
            event = "node_started",
            peer = %self.local,
            addr = %listener.local_addr()?,
            coordinator = self.coordinator,
            "Node listening"
        );
        tokio::spawn(self.clone().run_executor(rx));
        tokio::spawn(self.clone().run_ticker());
        tokio::spawn(self.clone().run_listener(listener));
        Ok(())
    }

    /// Remember where `peer` listens.
    pub async fn add_peer(&self, peer: PeerId, addr: SocketAddr) {
        self.directory.lock().await.insert(peer, addr);
    }

    pub async fn connect(&self, peer: &PeerId) {
        let actions = self.core.lock().await.connect(peer, Instant::now());
        self.dispatch(actions);
    }

    pub async fn share(&self, name: &str, source: Arc<dyn FileSource>) -> Fingerprint {
        let (fingerprint, actions) = self.core.lock().await.share_file(name, source);
        self.dispatch(actions);
        fingerprint
    }

    pub async fn set_display_name(&self, name: &str) {
        match self.core.lock().await.set_display_name(name) {
            Ok(actions) => self.dispatch(actions),
            Err(e) => warn!(event = "name_rejected", error = %e, "Display name rejected"),
        }
    }

    /// Run `f` against the core under its lock.
    #[cfg(test)]
    pub async fn with_core<R>(&self, f: impl FnOnce(&MeshCore) -> R) -> R {
        f(&*self.core.lock().await)
    }

    /// Resolves once the coordinator ended the session.
    pub async fn session_ended(&self) {
        self.ended.notified().await
    }

    /// Say goodbye, cancel transfers and close every link.
    pub async fn shutdown(&self) {
        let actions = self.core.lock().await.leave(Instant::now());
        self.dispatch(actions);
    }

    fn dispatch(&self, actions: Vec<Action>) {
        if !actions.is_empty() && self.actions.send(actions).is_err() {
            debug!(event = "executor_gone", "Dropping actions after executor stopped");
        }
    }

    async fn run_executor(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<Vec<Action>>) {
        while let Some(batch) = rx.recv().await {
            let mut work: VecDeque<Action> = batch.into();
            while let Some(action) = work.pop_front() {
                match action {
                    Action::Open { link, peer, tag } => self.open(link, peer, tag).await,
                    Action::Send { link, message } => {
                        self.send(link, &Envelope::Message(message)).await;
                    }
                    Action::Close { link } => self.close(link).await,
                    Action::Notify(n) => work.extend(self.on_notification(n).await),
                }
            }
        }
    }

    async fn run_ticker(self: Arc<Self>) {
        loop {
            let deadline = self.core.lock().await.next_deadline();
            let now = Instant::now();
            let sleep = deadline
                .map(|d| d.saturating_duration_since(now))
                .unwrap_or(MAX_TICK_SLEEP)
                .min(MAX_TICK_SLEEP);
            tokio::time::sleep(sleep).await;
            let actions = self.core.lock().await.tick(Instant::now());
            self.dispatch(actions);
        }
    }

    async fn run_listener(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, remote)) => {
                    let node = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = node.accept(stream, remote).await {
                            debug!(event = "accept_failure", remote = %remote, error = %e, "Incoming link rejected");
                        }
                    });
                }
                Err(e) => {
                    error!(event = "listener_failure", error = %e, "Listener stopped");
                    break;
                }
            }
        }
    }

    fn hello(&self, tag: LinkTag) -> Envelope {
        Envelope::Hello {
            version: PROTOCOL_VERSION,
            peer: self.local.clone(),
            listen_port: self.options.listen_port,
            tag,
        }
    }

    async fn accept(self: Arc<Self>, mut stream: TcpStream, remote: SocketAddr) -> io::Result<()> {
        stream.set_nodelay(true)?;
        let (peer, listen_port, tag) = tokio::time::timeout(
            HANDSHAKE_TIMEOUT,
            handshake_accept(&mut stream, |tag| self.hello(tag)),
        )
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "handshake timed out"))??;
        if peer == self.local {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "connected to self"));
        }
        self.directory
            .lock()
            .await
            .insert(peer.clone(), SocketAddr::new(remote.ip(), listen_port));

        let (tx, rx) = mpsc::unbounded_channel();
        let queued = Arc::new(AtomicUsize::new(0));
        let uploads = matches!(tag, LinkTag::Download { .. });
        let control = tag == LinkTag::Control;
        let (link, actions) = {
            let mut core = self.core.lock().await;
            let now = Instant::now();
            let (link, mut actions) = core.accept_link(&peer, tag.clone(), now);
            self.links.lock().await.insert(
                link,
                LinkHandle {
                    peer: peer.clone(),
                    tag,
                    tx,
                    queued: queued.clone(),
                    task: None,
                },
            );
            actions.extend(core.on_link_open(link, now));
            (link, actions)
        };
        info!(event = "link_accepted", peer = %peer, link = link.0, remote = %remote, "Accepted link");
        if control && self.coordinator {
            self.push_directory().await;
        }
        self.dispatch(actions);

        let node = self.clone();
        let task = tokio::spawn(async move { node.run_link(link, stream, rx, queued, uploads).await });
        if let Some(handle) = self.links.lock().await.get_mut(&link) {
            handle.task = Some(task.abort_handle());
        }
        Ok(())
    }

    async fn open(self: &Arc<Self>, link: LinkId, peer: PeerId, tag: LinkTag) {
        let Some(addr) = self.directory.lock().await.get(&peer).copied() else {
            warn!(event = "no_address", peer = %peer, link = link.0, "No known address for peer");
            let actions = self.core.lock().await.on_link_error(link, Instant::now());
            self.dispatch(actions);
            return;
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let queued = Arc::new(AtomicUsize::new(0));
        let mut links = self.links.lock().await;
        let node = self.clone();
        let hello = self.hello(tag.clone());
        let dial_peer = peer.clone();
        let dial_queued = queued.clone();
        let task = tokio::spawn(async move {
            node.dial(link, dial_peer, addr, hello, rx, dial_queued).await
        });
        debug!(event = "dialing", peer = %peer, link = link.0, addr = %addr, "Opening link");
        links.insert(
            link,
            LinkHandle {
                peer,
                tag,
                tx,
                queued,
                task: Some(task.abort_handle()),
            },
        );
    }

    async fn dial(
        self: Arc<Self>,
        link: LinkId,
        peer: PeerId,
        addr: SocketAddr,
        hello: Envelope,
        rx: mpsc::UnboundedReceiver<Vec<u8>>,
        queued: Arc<AtomicUsize>,
    ) {
        let connected = tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
            let mut stream = TcpStream::connect(addr).await?;
            stream.set_nodelay(true)?;
            handshake_dial(&mut stream, &hello, &peer).await?;
            Ok::<_, io::Error>(stream)
        })
        .await
        .unwrap_or_else(|_| Err(io::Error::new(io::ErrorKind::TimedOut, "handshake timed out")));
        match connected {
            Ok(stream) => {
                info!(event = "link_opened", peer = %peer, link = link.0, addr = %addr, "Link open");
                let actions = self.core.lock().await.on_link_open(link, Instant::now());
                self.dispatch(actions);
                self.run_link(link, stream, rx, queued, false).await;
            }
            Err(e) => {
                warn!(event = "dial_failure", peer = %peer, link = link.0, addr = %addr, error = %e, "Could not open link");
                let removed = self.links.lock().await.remove(&link);
                if removed.is_some() {
                    let actions = self.core.lock().await.on_link_error(link, Instant::now());
                    self.dispatch(actions);
                }
            }
        }
    }

    /// Read envelopes until the socket ends. The writer runs alongside and reports drained bytes for uploads.
    async fn run_link(
        self: Arc<Self>,
        link: LinkId,
        stream: TcpStream,
        rx: mpsc::UnboundedReceiver<Vec<u8>>,
        queued: Arc<AtomicUsize>,
        reports_drain: bool,
    ) {
        let (mut reader, writer) = stream.into_split();
        tokio::spawn(self.clone().write_loop(link, writer, rx, queued, reports_drain));
        loop {
            let payload = match read_frame(&mut reader).await {
                Ok(p) => p,
                Err(e) => {
                    debug!(event = "link_read_end", link = link.0, error = %e, "Link read ended");
                    break;
                }
            };
            match decode_payload::<Envelope>(&payload) {
                Ok(Envelope::Message(message)) => {
                    let actions = self
                        .core
                        .lock()
                        .await
                        .on_message(link, message, Instant::now());
                    self.dispatch(actions);
                }
                Ok(Envelope::Directory(entries)) => self.merge_directory(entries).await,
                Ok(Envelope::Hello { .. }) => {
                    debug!(event = "late_hello", link = link.0, "Ignoring hello after handshake")
                }
                Err(e) => {
                    warn!(event = "malformed_frame", link = link.0, error = %e, "Skipping undecodable frame")
                }
            }
        }
        let removed = self.links.lock().await.remove(&link);
        if let Some(handle) = removed {
            info!(event = "link_closed", peer = %handle.peer, link = link.0, "Link closed by remote");
            let actions = self.core.lock().await.on_link_closed(link, Instant::now());
            self.dispatch(actions);
        }
    }

    async fn write_loop(
        self: Arc<Self>,
        link: LinkId,
        mut writer: OwnedWriteHalf,
        mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
        queued: Arc<AtomicUsize>,
        reports_drain: bool,
    ) {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = writer.write_all(&frame).await {
                debug!(event = "link_write_failure", link = link.0, error = %e, "Write failed");
                break;
            }
            let left = queued
                .fetch_sub(frame.len(), Ordering::SeqCst)
                .saturating_sub(frame.len());
            if reports_drain {
                let actions = self
                    .core
                    .lock()
                    .await
                    .on_link_drained(link, left, Instant::now());
                self.dispatch(actions);
            }
        }
        let _ = writer.shutdown().await;
    }

    async fn send(&self, link: LinkId, envelope: &Envelope) {
        let frame = match encode_frame(envelope) {
            Ok(f) => f,
            Err(e) => {
                error!(event = "encode_failure", link = link.0, error = %e, "Could not encode frame");
                return;
            }
        };
        let links = self.links.lock().await;
        let Some(handle) = links.get(&link) else {
            debug!(event = "send_on_unknown_link", link = link.0, "Dropping frame for closed link");
            return;
        };
        handle.queued.fetch_add(frame.len(), Ordering::SeqCst);
        if handle.tx.send(frame).is_err() {
            debug!(event = "writer_gone", link = link.0, "Writer already stopped");
        }
    }

    async fn close(&self, link: LinkId) {
        // Dropping the sender lets the writer flush what is queued, then shut the socket down.
        if let Some(handle) = self.links.lock().await.remove(&link) {
            debug!(event = "link_close", peer = %handle.peer, link = link.0, "Closing link");
            if let Some(task) = handle.task {
                task.abort();
            }
        }
    }

    async fn push_directory(&self) {
        let entries: Vec<(PeerId, SocketAddr)> = self
            .directory
            .lock()
            .await
            .iter()
            .map(|(p, a)| (p.clone(), *a))
            .collect();
        let control: Vec<LinkId> = self
            .links
            .lock()
            .await
            .iter()
            .filter(|(_, h)| h.tag == LinkTag::Control)
            .map(|(l, _)| *l)
            .collect();
        let envelope = Envelope::Directory(entries);
        for link in control {
            self.send(link, &envelope).await;
        }
    }

    async fn merge_directory(&self, entries: Vec<(PeerId, SocketAddr)>) {
        let mut directory = self.directory.lock().await;
        for (peer, addr) in entries {
            if peer != self.local {
                directory.insert(peer, addr);
            }
        }
        debug!(event = "directory_updated", peers = directory.len(), "Peer directory updated");
    }

    /// Surface a notification; returns follow-up actions (auto-download requests).
    async fn on_notification(&self, notification: Notification) -> Vec<Action> {
        match notification {
            Notification::PeerStatus { peer, status } => {
                info!(event = "peer_status", peer = %peer, status = status.as_str(), "Peer status changed");
            }
            Notification::RosterChanged { names } => {
                let names: Vec<&str> = names.values().map(String::as_str).collect();
                info!(event = "roster", members = ?names, "Roster updated");
            }
            Notification::NameAssigned { name } => {
                info!(event = "name_assigned", name = %name, "Display name set");
            }
            Notification::FileAdded(record) => {
                info!(
                    event = "file_added",
                    fingerprint = %record.fingerprint,
                    name = %record.name,
                    size = record.size,
                    from = %record.sender_name,
                    "File available"
                );
                if self.options.auto_download && record.sender != self.local {
                    return self.download(&record.fingerprint, &record.name).await;
                }
            }
            Notification::FileRemoved { fingerprint } => {
                info!(event = "file_removed", fingerprint = %fingerprint, "File withdrawn");
            }
            Notification::Transfer {
                key,
                role,
                state,
                bytes,
                size,
            } => match state {
                TransferState::Transferring | TransferState::Ready => {
                    debug!(event = "transfer_progress", key = %key, role = ?role, bytes, size, "Transfer progress")
                }
                TransferState::Completed => {
                    info!(event = "transfer_done", key = %key, role = ?role, size, "Transfer finished")
                }
                TransferState::Canceled(reason) => {
                    warn!(event = "transfer_canceled", key = %key, role = ?role, reason = reason.as_str(), bytes, "Transfer canceled")
                }
                TransferState::Failed(error) => {
                    warn!(event = "transfer_failed", key = %key, role = ?role, error = %error, bytes, "Transfer failed")
                }
            },
            Notification::SessionEnded => {
                warn!(event = "session_ended", "Coordinator ended the session");
                self.ended.notify_one();
            }
        }
        Vec::new()
    }

    async fn download(&self, fingerprint: &Fingerprint, name: &str) -> Vec<Action> {
        let sink = match DiskSink::create(&self.options.download_dir, name, fingerprint.as_str()) {
            Ok(s) => s,
            Err(e) => {
                error!(event = "sink_failure", fingerprint = %fingerprint, error = %e, "Cannot create download file");
                return Vec::new();
            }
        };
        debug!(event = "download_requested", fingerprint = %fingerprint, part = %sink.part_path().display(), "Requesting download");
        match self
            .core
            .lock()
            .await
            .request_download(fingerprint, Box::new(sink), Instant::now())
        {
            Ok(actions) => actions,
            Err(e) => {
                warn!(event = "download_refused", fingerprint = %fingerprint, error = %e, "Download not started");
                Vec::new()
            }
        }
    }
}

/// Read one length-prefixed payload.
async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> io::Result<Vec<u8>> {
    let mut prefix = [0u8; LEN_SIZE];
    r.read_exact(&mut prefix).await?;
    let len = frame_len(prefix).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload).await?;
    Ok(payload)
}

async fn write_envelope<W: AsyncWrite + Unpin>(w: &mut W, envelope: &Envelope) -> io::Result<()> {
    let frame = encode_frame(envelope).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    w.write_all(&frame).await?;
    w.flush().await
}

async fn read_hello<R: AsyncRead + Unpin>(r: &mut R) -> io::Result<(PeerId, u16, LinkTag)> {
    let payload = read_frame(r).await?;
    match decode_payload::<Envelope>(&payload) {
        Ok(Envelope::Hello {
            version,
            peer,
            listen_port,
            tag,
        }) => {
            if version != PROTOCOL_VERSION {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "unsupported protocol version",
                ));
            }
            Ok((peer, listen_port, tag))
        }
        Ok(_) => Err(io::Error::new(io::ErrorKind::InvalidData, "expected hello")),
        Err(e) => Err(io::Error::new(io::ErrorKind::InvalidData, e)),
    }
}

/// Accepting side: read the dialer's hello, answer with ours for the same tag.
async fn handshake_accept<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    hello: impl FnOnce(LinkTag) -> Envelope,
) -> io::Result<(PeerId, u16, LinkTag)> {
    let (peer, listen_port, tag) = read_hello(stream).await?;
    write_envelope(stream, &hello(tag.clone())).await?;
    Ok((peer, listen_port, tag))
}

/// Dialing side: send our hello, check the answer comes from the peer we meant to reach.
async fn handshake_dial<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    hello: &Envelope,
    expected: &PeerId,
) -> io::Result<()> {
    write_envelope(stream, hello).await?;
    let (peer, _, _) = read_hello(stream).await?;
    if &peer != expected {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("expected peer {}, reached {}", expected, peer),
        ));
    }
    Ok(())
}
