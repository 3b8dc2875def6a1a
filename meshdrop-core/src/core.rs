//! Host-driven API: MeshCore receives events from host, returns actions.
//!
//! One composed handler owns every link entry and transfer session. Control links
//! and download links are told apart by who owns the link id.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info};

use crate::cipher::CipherKey;
use crate::config::Config;
use crate::control::{CatalogChange, Control, MeshRole, NameError};
use crate::identity::{Fingerprint, PeerId};
use crate::link::LinkManager;
use crate::protocol::{FileRecord, LinkTag, Message, PeerStatus};
use crate::session::{
    FileSource, Role, Sink, TransferKey, TransferSession, TransferState,
};
use crate::transfer::{TransferEngine, TransferError};

/// Host-side handle of one link. Allocated by the core, for both directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(pub u64);

/// Link id allocator.
#[derive(Debug, Default)]
pub struct LinkIds {
    next: u64,
}

impl LinkIds {
    pub fn allocate(&mut self) -> LinkId {
        let id = LinkId(self.next);
        self.next += 1;
        id
    }
}

/// Action for host to perform.
#[derive(Debug, Clone)]
pub enum Action {
    /// Open a link to `peer`. Report `on_link_open` or `on_link_error` for `link` later.
    Open {
        link: LinkId,
        peer: PeerId,
        tag: LinkTag,
    },
    Send {
        link: LinkId,
        message: Message,
    },
    Close {
        link: LinkId,
    },
    Notify(Notification),
}

/// Events for the user-facing side of the host.
#[derive(Debug, Clone)]
pub enum Notification {
    PeerStatus {
        peer: PeerId,
        status: PeerStatus,
    },
    RosterChanged {
        names: BTreeMap<PeerId, String>,
    },
    /// The local display name changed.
    NameAssigned {
        name: String,
    },
    FileAdded(FileRecord),
    FileRemoved {
        fingerprint: Fingerprint,
    },
    Transfer {
        key: TransferKey,
        role: Role,
        state: TransferState,
        bytes: u64,
        size: u64,
    },
    /// The coordinator said goodbye.
    SessionEnded,
}

/// Main coordinator of one node. Host passes events; core returns actions.
pub struct MeshCore {
    local: PeerId,
    config: Config,
    ids: LinkIds,
    links: LinkManager,
    control: Control,
    transfers: TransferEngine,
}

impl MeshCore {
    /// A node that hosts the session.
    pub fn coordinator(local: PeerId, config: Config) -> Self {
        Self::with_role(local, MeshRole::Coordinator, config)
    }

    /// A node that joins the session hosted by `coordinator`.
    pub fn participant(local: PeerId, coordinator: PeerId, config: Config) -> Self {
        Self::with_role(local, MeshRole::Participant { coordinator }, config)
    }

    fn with_role(local: PeerId, role: MeshRole, config: Config) -> Self {
        let config = config.sanitized();
        Self {
            links: LinkManager::new(local.clone(), config.clone()),
            control: Control::new(local.clone(), role, config.max_name_len),
            transfers: TransferEngine::new(local.clone(), config.clone()),
            ids: LinkIds::default(),
            local,
            config,
        }
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn role(&self) -> &MeshRole {
        self.control.role()
    }

    pub fn is_coordinator(&self) -> bool {
        self.control.is_coordinator()
    }

    pub fn display_name(&self) -> Option<&str> {
        self.control.local_name()
    }

    pub fn roster(&self) -> &BTreeMap<PeerId, String> {
        self.control.names()
    }

    pub fn files(&self) -> &[FileRecord] {
        self.control.catalog().records()
    }

    pub fn session(&self, key: &TransferKey) -> Option<&TransferSession> {
        self.transfers.session(key)
    }

    pub fn sessions(&self) -> impl Iterator<Item = &TransferSession> {
        self.transfers.sessions()
    }

    pub fn links(&self) -> &LinkManager {
        &self.links
    }

    /// The coordinator ended the session with `goodbye`; cleared by reconnecting.
    pub fn session_ended(&self) -> bool {
        self.control.session_ended()
    }

    pub fn peer_status(&self, peer: &PeerId) -> PeerStatus {
        self.control.peer_status(peer, &self.links)
    }

    /// Earliest instant at which `tick` has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        [self.links.next_deadline(), self.transfers.next_deadline()]
            .into_iter()
            .flatten()
            .min()
    }

    /// Start or keep up the control link to `peer`.
    pub fn connect(&mut self, peer: &PeerId, now: Instant) -> Vec<Action> {
        let mut out = Vec::new();
        self.links.connect(peer, &mut self.ids, now, &mut out);
        self.finish(out)
    }

    /// Manual reconnect: resets backoff and lifts a goodbye suspension.
    pub fn reconnect(&mut self, peer: &PeerId, now: Instant) -> Vec<Action> {
        let mut out = Vec::new();
        self.links.reconnect(peer, &mut self.ids, now, &mut out);
        self.finish(out)
    }

    /// Offer a local file to the mesh. The announcement waits for the first control link if needed.
    pub fn share_file(
        &mut self,
        name: &str,
        source: Arc<dyn FileSource>,
    ) -> (Fingerprint, Vec<Action>) {
        let fingerprint = Fingerprint::generate(&self.local);
        let key = CipherKey::generate();
        let record = FileRecord {
            fingerprint: fingerprint.clone(),
            name: name.to_string(),
            size: source.len(),
            sender: self.local.clone(),
            sender_name: self
                .control
                .local_name()
                .map(str::to_string)
                .unwrap_or_else(|| self.local.to_string()),
            encrypted: true,
            key: Some(key.clone()),
        };
        info!(event = "file_shared", fingerprint = %fingerprint, name = %name, size = record.size, "Sharing file");
        self.transfers
            .offer(fingerprint.clone(), name.to_string(), source, key);
        let mut out = Vec::new();
        self.control.share(record, &self.links, &mut out);
        (fingerprint, self.finish(out))
    }

    /// Withdraw a file everywhere.
    pub fn delete_file(&mut self, fingerprint: &Fingerprint) -> Vec<Action> {
        let mut out = Vec::new();
        if self.control.delete(fingerprint, &self.links, &mut out) {
            self.transfers.on_record_removed(fingerprint);
        }
        self.finish(out)
    }

    /// Download a file announced by another peer into `sink`.
    pub fn request_download(
        &mut self,
        fingerprint: &Fingerprint,
        sink: Box<dyn Sink>,
        now: Instant,
    ) -> Result<Vec<Action>, TransferError> {
        let mut out = Vec::new();
        self.transfers
            .request(fingerprint, sink, &mut self.ids, now, &mut out)?;
        Ok(self.finish(out))
    }

    /// Cancel every running transfer of `fingerprint` and tell the other side.
    pub fn cancel_transfer(&mut self, fingerprint: &Fingerprint, now: Instant) -> Vec<Action> {
        let mut out = Vec::new();
        self.transfers.cancel(fingerprint, now, &mut out);
        self.finish(out)
    }

    pub fn set_display_name(&mut self, name: &str) -> Result<Vec<Action>, NameError> {
        let mut out = Vec::new();
        self.control.set_display_name(name, &self.links, &mut out)?;
        Ok(self.finish(out))
    }

    /// Local teardown: goodbye to everyone, cancel transfers, close every link, stop retrying.
    pub fn leave(&mut self, now: Instant) -> Vec<Action> {
        let mut out = Vec::new();
        info!(event = "leaving", peer = %self.local, "Leaving mesh");
        for (_, link) in self.links.connected() {
            out.push(Action::Send {
                link,
                message: Message::Goodbye {
                    peer: self.local.clone(),
                },
            });
        }
        self.transfers.cancel_all(now, &mut out);
        self.links.close_all(&mut out);
        self.finish(out)
    }

    /// The remote side opened a link to us. Returns the id the host must use for it.
    pub fn accept_link(&mut self, peer: &PeerId, tag: LinkTag, now: Instant) -> (LinkId, Vec<Action>) {
        let link = self.ids.allocate();
        let mut out = Vec::new();
        match tag {
            LinkTag::Control => {
                self.links.accept(peer, link, now, &mut out);
            }
            LinkTag::Download { fingerprint } => {
                self.transfers.accept(link, peer.clone(), fingerprint)
            }
        }
        (link, self.finish(out))
    }

    pub fn on_link_open(&mut self, link: LinkId, now: Instant) -> Vec<Action> {
        let mut out = Vec::new();
        if let Some(peer) = self.links.on_open(link, now, &mut out) {
            self.control.on_link_open(&peer, &self.links, &mut out);
        } else {
            self.transfers.on_link_open(link, &mut out);
        }
        self.finish(out)
    }

    pub fn on_link_closed(&mut self, link: LinkId, now: Instant) -> Vec<Action> {
        let mut out = Vec::new();
        if self.links.on_closed(link, now, &mut out).is_none() {
            self.transfers.on_link_closed(link, now, &mut out);
        }
        self.finish(out)
    }

    /// Errors and closes resolve the same way: a scheduled retry, or a canceled transfer.
    pub fn on_link_error(&mut self, link: LinkId, now: Instant) -> Vec<Action> {
        debug!(event = "link_error", link = link.0, "Link reported error");
        self.on_link_closed(link, now)
    }

    /// Host reports the outbound buffer of `link` fell to `buffered` bytes.
    pub fn on_link_drained(&mut self, link: LinkId, buffered: usize, now: Instant) -> Vec<Action> {
        let mut out = Vec::new();
        self.transfers
            .on_link_drained(link, buffered, now, &mut out);
        self.finish(out)
    }

    /// Process one message received on `link`.
    pub fn on_message(&mut self, link: LinkId, message: Message, now: Instant) -> Vec<Action> {
        let mut out = Vec::new();
        if let Some(peer) = self.links.owner(link).cloned() {
            self.on_control_message(link, peer, message, now, &mut out);
        } else {
            self.transfers.on_message(link, message, now, &mut out);
        }
        self.finish(out)
    }

    fn on_control_message(
        &mut self,
        link: LinkId,
        peer: PeerId,
        message: Message,
        now: Instant,
        out: &mut Vec<Action>,
    ) {
        self.links.on_inbound(&peer, now);
        match message {
            Message::Ping => out.push(Action::Send {
                link,
                message: Message::Pong,
            }),
            Message::Pong => {}
            Message::Goodbye { .. } => {
                self.links.depart(&peer, out);
                if self.control.on_goodbye(&peer) {
                    info!(event = "session_ended", coordinator = %peer, "Coordinator ended the session");
                    out.push(Action::Notify(Notification::SessionEnded));
                }
            }
            m if m.is_transfer() => {
                debug!(event = "ignored_control", kind = m.kind(), peer = %peer, "Transfer message on control link");
            }
            m => {
                for change in self.control.on_message(&peer, m, &self.links, out) {
                    match change {
                        CatalogChange::Added(record) => self.transfers.on_record_added(&record),
                        CatalogChange::Removed(fingerprint) => {
                            self.transfers.on_record_removed(&fingerprint)
                        }
                    }
                }
            }
        }
    }

    /// Drive every timer: watchdogs, reconnects, heartbeat, chunk retries, receive timeouts, delayed closes.
    pub fn tick(&mut self, now: Instant) -> Vec<Action> {
        let mut out = Vec::new();
        self.links.tick(&mut self.ids, now, &mut out);
        self.transfers.tick(now, &mut out);
        self.finish(out)
    }

    /// Rebroadcast the roster when any link status changed.
    fn finish(&mut self, mut out: Vec<Action>) -> Vec<Action> {
        if self.links.take_dirty() {
            self.control.broadcast_roster(&self.links, &mut out);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn sent(actions: &[Action]) -> Vec<(LinkId, &Message)> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Send { link, message } => Some((*link, message)),
                _ => None,
            })
            .collect()
    }

    fn opened(actions: &[Action]) -> LinkId {
        actions
            .iter()
            .find_map(|a| match a {
                Action::Open { link, .. } => Some(*link),
                _ => None,
            })
            .expect("no Open action")
    }

    #[test]
    fn ping_answered_with_pong() {
        let mut host = MeshCore::coordinator(PeerId::new("host"), Config::default());
        let now = Instant::now();
        let (link, _) = host.accept_link(&PeerId::new("p1"), LinkTag::Control, now);
        host.on_link_open(link, now);
        let out = host.on_message(link, Message::Ping, now);
        assert!(matches!(sent(&out)[..], [(l, Message::Pong)] if l == link));
    }

    #[test]
    fn participant_open_announces_chosen_name() {
        let mut p = MeshCore::participant(PeerId::new("p1"), PeerId::new("host"), Config::default());
        let now = Instant::now();
        p.set_display_name("Kim").unwrap();
        let link = opened(&p.connect(&PeerId::new("host"), now));
        let out = p.on_link_open(link, now);
        assert!(sent(&out)
            .iter()
            .any(|(_, m)| matches!(m, Message::IdentityAnnounce { name, .. } if name == "Kim")));
        assert_eq!(p.peer_status(&PeerId::new("host")), PeerStatus::Connected);
    }

    #[test]
    fn coordinator_goodbye_ends_session_without_retry() {
        let host = PeerId::new("host");
        let mut p = MeshCore::participant(PeerId::new("p1"), host.clone(), Config::default());
        let now = Instant::now();
        let link = opened(&p.connect(&host, now));
        p.on_link_open(link, now);

        let out = p.on_message(link, Message::Goodbye { peer: host.clone() }, now);
        assert!(p.session_ended());
        assert!(out
            .iter()
            .any(|a| matches!(a, Action::Notify(Notification::SessionEnded))));
        assert!(out
            .iter()
            .any(|a| matches!(a, Action::Close { link: l } if *l == link)));
        assert_eq!(p.peer_status(&host), PeerStatus::Disconnected);

        let out = p.tick(now + Duration::from_secs(120));
        assert!(!out.iter().any(|a| matches!(a, Action::Open { .. })));

        let out = p.reconnect(&host, now + Duration::from_secs(121));
        let link = opened(&out);
        p.on_link_open(link, now + Duration::from_secs(121));
        assert!(!p.session_ended());
    }

    #[test]
    fn coordinator_rebroadcasts_roster_on_status_change() {
        let mut host = MeshCore::coordinator(PeerId::new("host"), Config::default());
        let now = Instant::now();
        let (l1, _) = host.accept_link(&PeerId::new("p1"), LinkTag::Control, now);
        host.on_link_open(l1, now);
        let (l2, _) = host.accept_link(&PeerId::new("p2"), LinkTag::Control, now);
        host.on_link_open(l2, now);

        let out = host.on_link_closed(l2, now);
        let rosters: Vec<_> = sent(&out)
            .into_iter()
            .filter(|(_, m)| matches!(m, Message::Roster { .. }))
            .collect();
        assert_eq!(rosters.len(), 1);
        match rosters[0] {
            (link, Message::Roster { statuses, .. }) => {
                assert_eq!(link, l1);
                assert_eq!(statuses[&PeerId::new("p2")], PeerStatus::Disconnected);
                assert_eq!(statuses[&PeerId::new("host")], PeerStatus::Connected);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn link_open_sends_one_roster_per_member() {
        let mut host = MeshCore::coordinator(PeerId::new("host"), Config::default());
        let now = Instant::now();
        let (l1, _) = host.accept_link(&PeerId::new("p1"), LinkTag::Control, now);
        host.on_link_open(l1, now);
        let (l2, _) = host.accept_link(&PeerId::new("p2"), LinkTag::Control, now);

        let out = host.on_link_open(l2, now);
        let rosters: Vec<LinkId> = sent(&out)
            .into_iter()
            .filter(|(_, m)| matches!(m, Message::Roster { .. }))
            .map(|(l, _)| l)
            .collect();
        assert_eq!(rosters.len(), 2);
        assert!(rosters.contains(&l1));
        assert!(rosters.contains(&l2));
        let kinds: Vec<&str> = sent(&out)
            .into_iter()
            .filter(|(l, _)| *l == l2)
            .map(|(_, m)| m.kind())
            .collect();
        assert_eq!(kinds, vec!["identity-assign", "history", "roster"]);
    }

    #[test]
    fn leave_says_goodbye_and_suspends() {
        let mut host = MeshCore::coordinator(PeerId::new("host"), Config::default());
        let now = Instant::now();
        let (l1, _) = host.accept_link(&PeerId::new("p1"), LinkTag::Control, now);
        host.on_link_open(l1, now);

        let out = host.leave(now);
        let goodbye = out.iter().position(
            |a| matches!(a, Action::Send { message: Message::Goodbye { .. }, link } if *link == l1),
        );
        let close = out
            .iter()
            .position(|a| matches!(a, Action::Close { link } if *link == l1));
        assert!(goodbye.unwrap() < close.unwrap());

        let out = host.tick(now + Duration::from_secs(60));
        assert!(!out.iter().any(|a| matches!(a, Action::Open { .. })));
    }

    #[test]
    fn transfer_messages_on_control_link_are_ignored() {
        let mut host = MeshCore::coordinator(PeerId::new("host"), Config::default());
        let now = Instant::now();
        let (link, _) = host.accept_link(&PeerId::new("p1"), LinkTag::Control, now);
        host.on_link_open(link, now);
        let out = host.on_message(link, Message::FileEnd, now);
        assert!(out.is_empty());
    }

    #[test]
    fn request_of_unknown_file_is_an_error() {
        let mut p = MeshCore::participant(PeerId::new("p1"), PeerId::new("host"), Config::default());
        let r = p.request_download(
            &Fingerprint::new("nothing"),
            Box::new(crate::session::MemorySink::new()),
            Instant::now(),
        );
        assert!(matches!(r, Err(TransferError::UnknownFile(_))));
    }

    #[test]
    fn next_deadline_covers_links_and_transfers() {
        let mut p = MeshCore::participant(PeerId::new("p1"), PeerId::new("host"), Config::default());
        let now = Instant::now();
        assert!(p.next_deadline().is_none());
        p.connect(&PeerId::new("host"), now);
        assert_eq!(p.next_deadline(), Some(now + Duration::from_secs(15)));
    }
}
