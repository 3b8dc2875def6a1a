//! Control channel: identities, roster, file history and metadata broadcast.

use std::collections::BTreeMap;

use tracing::{debug, info};

use crate::catalog::FileCatalog;
use crate::core::{Action, Notification};
use crate::identity::{self, Fingerprint, PeerId};
use crate::link::LinkManager;
use crate::protocol::{FileRecord, Message, PeerStatus};

/// Which side of the star this node is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshRole {
    Coordinator,
    Participant { coordinator: PeerId },
}

/// Catalog effect of an inbound control message, for the transfer engine to follow.
#[derive(Debug, Clone)]
pub enum CatalogChange {
    Added(FileRecord),
    Removed(Fingerprint),
}

#[derive(Debug, thiserror::Error)]
pub enum NameError {
    #[error("display name is empty")]
    Empty,
}

pub struct Control {
    local: PeerId,
    role: MeshRole,
    max_name_len: usize,
    names: BTreeMap<PeerId, String>,
    /// Last roster statuses from the coordinator (participant only).
    roster_statuses: BTreeMap<PeerId, PeerStatus>,
    next_participant: u32,
    /// Set once the local user picks a name; assignments from the coordinator are then ignored.
    name_chosen: bool,
    catalog: FileCatalog,
    /// Local shares made while no control link was up.
    pending: Vec<FileRecord>,
    session_ended: bool,
}

impl Control {
    pub fn new(local: PeerId, role: MeshRole, max_name_len: usize) -> Self {
        let mut names = BTreeMap::new();
        if role == MeshRole::Coordinator {
            names.insert(local.clone(), identity::COORDINATOR_NAME.to_string());
        }
        Self {
            local,
            role,
            max_name_len,
            names,
            roster_statuses: BTreeMap::new(),
            next_participant: 1,
            name_chosen: false,
            catalog: FileCatalog::new(),
            pending: Vec::new(),
            session_ended: false,
        }
    }

    pub fn role(&self) -> &MeshRole {
        &self.role
    }

    pub fn is_coordinator(&self) -> bool {
        self.role == MeshRole::Coordinator
    }

    fn coordinator(&self) -> Option<&PeerId> {
        match &self.role {
            MeshRole::Coordinator => None,
            MeshRole::Participant { coordinator } => Some(coordinator),
        }
    }

    pub fn local_name(&self) -> Option<&str> {
        self.names.get(&self.local).map(String::as_str)
    }

    pub fn names(&self) -> &BTreeMap<PeerId, String> {
        &self.names
    }

    pub fn catalog(&self) -> &FileCatalog {
        &self.catalog
    }

    pub fn pending(&self) -> &[FileRecord] {
        &self.pending
    }

    pub fn session_ended(&self) -> bool {
        self.session_ended
    }

    /// Record a local share and announce it, or queue it until a control link opens.
    pub fn share(&mut self, record: FileRecord, links: &LinkManager, out: &mut Vec<Action>) {
        if !self.catalog.insert(record.clone()) {
            return;
        }
        out.push(Action::Notify(Notification::FileAdded(record.clone())));
        let connected = links.connected();
        if connected.is_empty() {
            debug!(event = "announce_queued", fingerprint = %record.fingerprint, "No control link yet; queueing announcement");
            self.pending.push(record);
            return;
        }
        for (_, link) in connected {
            out.push(Action::Send {
                link,
                message: Message::FileAnnounce(record.clone()),
            });
        }
    }

    /// Remove a record everywhere. Returns whether it was known.
    pub fn delete(
        &mut self,
        fingerprint: &Fingerprint,
        links: &LinkManager,
        out: &mut Vec<Action>,
    ) -> bool {
        self.pending.retain(|r| &r.fingerprint != fingerprint);
        if self.catalog.remove(fingerprint).is_none() {
            return false;
        }
        out.push(Action::Notify(Notification::FileRemoved {
            fingerprint: fingerprint.clone(),
        }));
        for (_, link) in links.connected() {
            out.push(Action::Send {
                link,
                message: Message::FileDelete {
                    fingerprint: fingerprint.clone(),
                },
            });
        }
        true
    }

    /// A control link to `peer` just opened.
    pub fn on_link_open(&mut self, peer: &PeerId, links: &LinkManager, out: &mut Vec<Action>) {
        let Some(link) = links.entry(peer).and_then(|e| e.channel()) else {
            return;
        };
        match self.role.clone() {
            MeshRole::Coordinator => {
                let name = match self.names.get(peer) {
                    Some(name) => name.clone(),
                    None => {
                        let name = identity::participant_name(self.next_participant);
                        self.next_participant += 1;
                        self.names.insert(peer.clone(), name.clone());
                        name
                    }
                };
                info!(event = "identity_assigned", peer = %peer, name = %name, "Assigned display name");
                out.push(Action::Send {
                    link,
                    message: Message::IdentityAssign {
                        peer: peer.clone(),
                        name,
                    },
                });
                self.flush_pending(links, out);
                out.push(Action::Send {
                    link,
                    message: Message::History {
                        files: self.catalog.records().to_vec(),
                    },
                });
            }
            MeshRole::Participant { coordinator } => {
                if *peer == coordinator {
                    self.session_ended = false;
                    if self.name_chosen {
                        if let Some(name) = self.local_name() {
                            out.push(Action::Send {
                                link,
                                message: Message::IdentityAnnounce {
                                    peer: self.local.clone(),
                                    name: name.to_string(),
                                },
                            });
                        }
                    }
                }
                self.flush_pending(links, out);
            }
        }
    }

    fn flush_pending(&mut self, links: &LinkManager, out: &mut Vec<Action>) {
        if self.pending.is_empty() {
            return;
        }
        let connected = links.connected();
        for record in self.pending.drain(..) {
            info!(event = "announce_flushed", fingerprint = %record.fingerprint, "Announcing queued file");
            for (_, link) in &connected {
                out.push(Action::Send {
                    link: *link,
                    message: Message::FileAnnounce(record.clone()),
                });
            }
        }
    }

    /// Set the local display name. The coordinator rebroadcasts; a participant announces.
    pub fn set_display_name(
        &mut self,
        raw: &str,
        links: &LinkManager,
        out: &mut Vec<Action>,
    ) -> Result<String, NameError> {
        let name = identity::clean_display_name(raw, self.max_name_len).ok_or(NameError::Empty)?;
        self.name_chosen = true;
        self.names.insert(self.local.clone(), name.clone());
        out.push(Action::Notify(Notification::NameAssigned { name: name.clone() }));
        match self.coordinator().cloned() {
            None => self.broadcast_roster(links, out),
            Some(coordinator) => {
                if let Some((_, link)) = links.connected().into_iter().find(|(p, _)| *p == coordinator) {
                    out.push(Action::Send {
                        link,
                        message: Message::IdentityAnnounce {
                            peer: self.local.clone(),
                            name: name.clone(),
                        },
                    });
                }
            }
        }
        Ok(name)
    }

    /// Coordinator only: send the full roster to every connected participant.
    pub fn broadcast_roster(&self, links: &LinkManager, out: &mut Vec<Action>) {
        if !self.is_coordinator() {
            return;
        }
        let statuses: BTreeMap<PeerId, PeerStatus> = self
            .names
            .keys()
            .map(|peer| (peer.clone(), self.peer_status(peer, links)))
            .collect();
        for (_, link) in links.connected() {
            out.push(Action::Send {
                link,
                message: Message::Roster {
                    names: self.names.clone(),
                    statuses: statuses.clone(),
                },
            });
        }
        out.push(Action::Notify(Notification::RosterChanged {
            names: self.names.clone(),
        }));
    }

    /// Handle one control message from `from`. Returns the catalog changes it caused.
    pub fn on_message(
        &mut self,
        from: &PeerId,
        message: Message,
        links: &LinkManager,
        out: &mut Vec<Action>,
    ) -> Vec<CatalogChange> {
        let mut changes = Vec::new();
        match message {
            Message::IdentityAssign { peer, name } => {
                if self.coordinator() != Some(from) {
                    debug!(event = "ignored_assign", from = %from, "Identity assignment from non-coordinator");
                    return changes;
                }
                if peer == self.local {
                    if self.name_chosen {
                        debug!(event = "ignored_assign", name = %name, "Keeping explicitly chosen name");
                    } else if self.names.get(&self.local) != Some(&name) {
                        self.names.insert(peer, name.clone());
                        out.push(Action::Notify(Notification::NameAssigned { name }));
                    }
                } else {
                    self.names.insert(peer, name);
                }
            }
            Message::IdentityAnnounce { peer, name } => {
                let Some(name) = identity::clean_display_name(&name, self.max_name_len) else {
                    return changes;
                };
                if peer != *from {
                    debug!(event = "announce_mismatch", from = %from, claimed = %peer, "Using link owner for identity announce");
                }
                info!(event = "identity_announced", peer = %from, name = %name, "Peer renamed");
                self.names.insert(from.clone(), name);
                self.broadcast_roster(links, out);
            }
            Message::Roster { names, statuses } => {
                if self.coordinator() != Some(from) {
                    return changes;
                }
                let own = self.names.get(&self.local).cloned();
                self.names = names;
                match own {
                    Some(name) if self.name_chosen => {
                        self.names.insert(self.local.clone(), name);
                    }
                    _ => {}
                }
                self.roster_statuses = statuses;
                out.push(Action::Notify(Notification::RosterChanged {
                    names: self.names.clone(),
                }));
            }
            Message::History { files } => {
                for record in files {
                    if self.catalog.insert(record.clone()) {
                        out.push(Action::Notify(Notification::FileAdded(record.clone())));
                        changes.push(CatalogChange::Added(record));
                    }
                }
            }
            Message::FileAnnounce(record) => {
                if !self.catalog.insert(record.clone()) {
                    return changes;
                }
                info!(event = "file_announced", fingerprint = %record.fingerprint, sender = %record.sender, name = %record.name, "New shared file");
                out.push(Action::Notify(Notification::FileAdded(record.clone())));
                self.relay(from, Some(&record.sender), &Message::FileAnnounce(record.clone()), links, out);
                changes.push(CatalogChange::Added(record));
            }
            Message::FileDelete { fingerprint } => {
                if self.catalog.remove(&fingerprint).is_none() {
                    return changes;
                }
                info!(event = "file_deleted", fingerprint = %fingerprint, "Shared file removed");
                out.push(Action::Notify(Notification::FileRemoved {
                    fingerprint: fingerprint.clone(),
                }));
                self.relay(
                    from,
                    None,
                    &Message::FileDelete {
                        fingerprint: fingerprint.clone(),
                    },
                    links,
                    out,
                );
                changes.push(CatalogChange::Removed(fingerprint));
            }
            other => {
                debug!(event = "ignored_control", kind = other.kind(), from = %from, "Unhandled control message");
            }
        }
        changes
    }

    /// Coordinator forwards metadata to every other connected participant.
    fn relay(
        &self,
        from: &PeerId,
        origin: Option<&PeerId>,
        message: &Message,
        links: &LinkManager,
        out: &mut Vec<Action>,
    ) {
        if !self.is_coordinator() {
            return;
        }
        for (peer, link) in links.connected() {
            if &peer == from || Some(&peer) == origin {
                continue;
            }
            out.push(Action::Send {
                link,
                message: message.clone(),
            });
        }
    }

    /// `goodbye` arrived from `from`. Returns whether it ended the session.
    pub fn on_goodbye(&mut self, from: &PeerId) -> bool {
        if self.coordinator() == Some(from) {
            self.session_ended = true;
            return true;
        }
        false
    }

    /// Status of `peer` as this node should present it.
    pub fn peer_status(&self, peer: &PeerId, links: &LinkManager) -> PeerStatus {
        if *peer == self.local {
            return PeerStatus::Connected;
        }
        match self.coordinator() {
            None => links.status(peer),
            Some(coordinator) => {
                if links.status(coordinator) == PeerStatus::Connected {
                    self.roster_statuses
                        .get(peer)
                        .copied()
                        .unwrap_or_else(|| links.status(peer))
                } else {
                    links.status(peer)
                }
            }
        }
    }
}
