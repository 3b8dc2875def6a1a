//! Link lifecycle: one entry per remote peer, connect watchdog, reconnect backoff, heartbeat.
//!
//! Each entry's timer is part of its state, so a `connecting` entry always owns
//! exactly one watchdog and never a reconnect timer, and a `disconnected` entry
//! owns at most one reconnect timer and never a watchdog.
//!
//! Only the side that opened the current channel retries it automatically. When
//! both sides dial at once, the attempt from the lower peer id wins.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::Config;
use crate::core::{Action, LinkId, LinkIds, Notification};
use crate::identity::PeerId;
use crate::protocol::{LinkTag, Message, PeerStatus};

/// Connection phase of one peer, with the single timer that phase may own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected { reconnect_at: Option<Instant> },
    Connecting { link: LinkId, watchdog_at: Instant },
    Connected { link: LinkId },
}

/// Per-peer connection bookkeeping.
#[derive(Debug, Clone)]
pub struct LinkEntry {
    state: LinkState,
    backoff: Duration,
    last_heartbeat_at: Instant,
    /// Set by a graceful departure; automatic retry stays off until manual action.
    suspended: bool,
    /// We opened the current (or last) channel, so recovery is ours to drive.
    outgoing: bool,
}

impl LinkEntry {
    fn new(base: Duration, now: Instant) -> Self {
        Self {
            state: LinkState::Disconnected { reconnect_at: None },
            backoff: base,
            last_heartbeat_at: now,
            suspended: false,
            outgoing: false,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn status(&self) -> PeerStatus {
        match self.state {
            LinkState::Disconnected { .. } => PeerStatus::Disconnected,
            LinkState::Connecting { .. } => PeerStatus::Connecting,
            LinkState::Connected { .. } => PeerStatus::Connected,
        }
    }

    pub fn backoff(&self) -> Duration {
        self.backoff
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    pub fn is_outgoing(&self) -> bool {
        self.outgoing
    }

    pub fn has_watchdog(&self) -> bool {
        matches!(self.state, LinkState::Connecting { .. })
    }

    pub fn has_reconnect_timer(&self) -> bool {
        matches!(
            self.state,
            LinkState::Disconnected {
                reconnect_at: Some(_)
            }
        )
    }

    /// The channel this entry currently owns, open or not.
    pub fn channel(&self) -> Option<LinkId> {
        match self.state {
            LinkState::Connecting { link, .. } | LinkState::Connected { link } => Some(link),
            LinkState::Disconnected { .. } => None,
        }
    }
}

/// Owns every [`LinkEntry`] and the map from channel to peer.
pub struct LinkManager {
    local: PeerId,
    config: Config,
    entries: HashMap<PeerId, LinkEntry>,
    by_link: HashMap<LinkId, PeerId>,
    next_heartbeat_at: Option<Instant>,
    /// Set on every status change; the composed handler drains it to rebroadcast the roster.
    dirty: bool,
}

impl LinkManager {
    pub fn new(local: PeerId, config: Config) -> Self {
        Self {
            local,
            config,
            entries: HashMap::new(),
            by_link: HashMap::new(),
            next_heartbeat_at: None,
            dirty: false,
        }
    }

    pub fn entry(&self, peer: &PeerId) -> Option<&LinkEntry> {
        self.entries.get(peer)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&PeerId, &LinkEntry)> {
        self.entries.iter()
    }

    pub fn status(&self, peer: &PeerId) -> PeerStatus {
        self.entries
            .get(peer)
            .map(LinkEntry::status)
            .unwrap_or(PeerStatus::Disconnected)
    }

    /// Peer owning `link`, if it is a live control channel.
    pub fn owner(&self, link: LinkId) -> Option<&PeerId> {
        self.by_link.get(&link)
    }

    /// Open control links, with their peers.
    pub fn connected(&self) -> Vec<(PeerId, LinkId)> {
        self.entries
            .iter()
            .filter_map(|(peer, e)| match e.state {
                LinkState::Connected { link } => Some((peer.clone(), link)),
                _ => None,
            })
            .collect()
    }

    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    /// Start a connection attempt. No-op when connected, already connecting, or aimed at ourselves.
    pub fn connect(
        &mut self,
        peer: &PeerId,
        ids: &mut LinkIds,
        now: Instant,
        out: &mut Vec<Action>,
    ) {
        if *peer == self.local {
            return;
        }
        let base = self.config.reconnect_base();
        let entry = self
            .entries
            .entry(peer.clone())
            .or_insert_with(|| LinkEntry::new(base, now));
        match entry.state {
            LinkState::Connected { .. } => return,
            // The running watchdog already protects this attempt.
            LinkState::Connecting { .. } => return,
            LinkState::Disconnected { .. } => {}
        }
        let link = ids.allocate();
        info!(
            event = "link_connecting",
            peer = %peer,
            link = link.0,
            backoff_ms = entry.backoff.as_millis() as u64,
            "Attempting control link"
        );
        entry.state = LinkState::Connecting {
            link,
            watchdog_at: now + self.config.connect_timeout(),
        };
        entry.outgoing = true;
        self.by_link.insert(link, peer.clone());
        out.push(Action::Open {
            link,
            peer: peer.clone(),
            tag: LinkTag::Control,
        });
        self.status_changed(peer, PeerStatus::Connecting, out);
    }

    /// Manual re-initiation: lift suspension, reset backoff, connect now.
    pub fn reconnect(
        &mut self,
        peer: &PeerId,
        ids: &mut LinkIds,
        now: Instant,
        out: &mut Vec<Action>,
    ) {
        let base = self.config.reconnect_base();
        if let Some(entry) = self.entries.get_mut(peer) {
            entry.suspended = false;
            entry.backoff = base;
            if let LinkState::Disconnected { reconnect_at } = &mut entry.state {
                *reconnect_at = None;
            }
        }
        self.connect(peer, ids, now, out);
    }

    /// The remote side opened a control link to us. Replaces whatever channel the entry held,
    /// unless that channel is our own attempt and our id is the lower one; then the incoming
    /// link is closed and `false` returned.
    pub fn accept(&mut self, peer: &PeerId, link: LinkId, now: Instant, out: &mut Vec<Action>) -> bool {
        let base = self.config.reconnect_base();
        let entry = self
            .entries
            .entry(peer.clone())
            .or_insert_with(|| LinkEntry::new(base, now));
        if entry.outgoing && entry.channel().is_some() && self.local < *peer {
            debug!(event = "link_rejected", peer = %peer, link = link.0, "Keeping our own attempt over incoming link");
            out.push(Action::Close { link });
            return false;
        }
        if let Some(old) = entry.channel() {
            debug!(event = "link_replaced", peer = %peer, old = old.0, new = link.0, "Incoming link supersedes existing channel");
            self.by_link.remove(&old);
            out.push(Action::Close { link: old });
        }
        entry.suspended = false;
        entry.outgoing = false;
        entry.backoff = base;
        entry.state = LinkState::Connecting {
            link,
            watchdog_at: now + self.config.connect_timeout(),
        };
        self.by_link.insert(link, peer.clone());
        self.status_changed(peer, PeerStatus::Connecting, out);
        true
    }

    /// Channel reported open. Returns the peer when this made the entry `connected`.
    pub fn on_open(&mut self, link: LinkId, now: Instant, out: &mut Vec<Action>) -> Option<PeerId> {
        let peer = self.by_link.get(&link)?.clone();
        let base = self.config.reconnect_base();
        let entry = self.entries.get_mut(&peer)?;
        match entry.state {
            LinkState::Connecting { link: l, .. } if l == link => {}
            _ => return None,
        }
        entry.state = LinkState::Connected { link };
        entry.backoff = base;
        entry.last_heartbeat_at = now;
        info!(event = "link_connected", peer = %peer, link = link.0, "Control link open");
        self.status_changed(&peer, PeerStatus::Connected, out);
        Some(peer)
    }

    /// Channel closed or errored, from either side. Returns the peer when the entry owned it.
    pub fn on_closed(&mut self, link: LinkId, now: Instant, out: &mut Vec<Action>) -> Option<PeerId> {
        let peer = self.by_link.remove(&link)?;
        let entry = self.entries.get_mut(&peer)?;
        if entry.channel() != Some(link) {
            return None;
        }
        warn!(event = "link_lost", peer = %peer, link = link.0, "Control link closed");
        entry.state = LinkState::Disconnected { reconnect_at: None };
        self.status_changed(&peer, PeerStatus::Disconnected, out);
        self.schedule_reconnect(&peer, now);
        Some(peer)
    }

    /// Any inbound traffic counts as a heartbeat.
    pub fn on_inbound(&mut self, peer: &PeerId, now: Instant) {
        if let Some(entry) = self.entries.get_mut(peer) {
            entry.last_heartbeat_at = now;
        }
    }

    /// Graceful departure of `peer`: drop its channel and stop retrying until manual action.
    pub fn depart(&mut self, peer: &PeerId, out: &mut Vec<Action>) {
        let Some(entry) = self.entries.get_mut(peer) else {
            return;
        };
        entry.suspended = true;
        if let Some(link) = entry.channel() {
            self.by_link.remove(&link);
            out.push(Action::Close { link });
        }
        let was = entry.status();
        entry.state = LinkState::Disconnected { reconnect_at: None };
        info!(event = "peer_departed", peer = %peer, "Peer said goodbye; automatic reconnect suspended");
        if was != PeerStatus::Disconnected {
            self.status_changed(peer, PeerStatus::Disconnected, out);
        }
    }

    /// Local teardown: close every channel and suspend every entry.
    pub fn close_all(&mut self, out: &mut Vec<Action>) {
        let peers: Vec<PeerId> = self.entries.keys().cloned().collect();
        for peer in peers {
            self.depart(&peer, out);
        }
    }

    /// Arm the reconnect timer. No-op while one is pending, while suspended, when not
    /// disconnected, or when the remote opened the lost channel and will redial itself.
    pub fn schedule_reconnect(&mut self, peer: &PeerId, now: Instant) {
        let Some(entry) = self.entries.get_mut(peer) else {
            return;
        };
        if entry.suspended || !entry.outgoing {
            return;
        }
        let LinkState::Disconnected { reconnect_at } = &mut entry.state else {
            return;
        };
        if reconnect_at.is_some() {
            return;
        }
        entry.backoff = self.config.next_backoff(entry.backoff);
        *reconnect_at = Some(now + entry.backoff);
        debug!(
            event = "reconnect_scheduled",
            peer = %peer,
            delay_ms = entry.backoff.as_millis() as u64,
            "Scheduling reconnect"
        );
    }

    /// Fire due watchdogs and reconnect timers, and run the heartbeat sweep when it is due.
    pub fn tick(&mut self, ids: &mut LinkIds, now: Instant, out: &mut Vec<Action>) {
        let mut timed_out = Vec::new();
        let mut due = Vec::new();
        for (peer, entry) in &self.entries {
            match entry.state {
                LinkState::Connecting { link, watchdog_at } if watchdog_at <= now => {
                    timed_out.push((peer.clone(), link))
                }
                LinkState::Disconnected {
                    reconnect_at: Some(at),
                } if at <= now => due.push(peer.clone()),
                _ => {}
            }
        }

        for (peer, link) in timed_out {
            warn!(event = "connect_watchdog", peer = %peer, link = link.0, "Connection attempt timed out");
            self.drop_channel(&peer, link, out);
            self.schedule_reconnect(&peer, now);
        }

        for peer in due {
            if let Some(entry) = self.entries.get_mut(&peer) {
                // Clear the handle first: connect's guard must not see a stale timer.
                entry.state = LinkState::Disconnected { reconnect_at: None };
            }
            self.connect(&peer, ids, now, out);
        }

        let heartbeat_due = self.next_heartbeat_at.map_or(true, |at| at <= now);
        if heartbeat_due {
            self.heartbeat(now, out);
            self.next_heartbeat_at = Some(now + self.config.heartbeat_interval());
        }
    }

    /// Earliest pending timer, including the next heartbeat sweep.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries
            .values()
            .filter_map(|e| match e.state {
                LinkState::Connecting { watchdog_at, .. } => Some(watchdog_at),
                LinkState::Disconnected { reconnect_at } => reconnect_at,
                LinkState::Connected { .. } => None,
            })
            .chain(self.next_heartbeat_at)
            .min()
    }

    /// Ping every connected link; declare links stale when nothing arrived within the timeout.
    fn heartbeat(&mut self, now: Instant, out: &mut Vec<Action>) {
        let timeout = self.config.heartbeat_timeout();
        let mut stale = Vec::new();
        for (peer, entry) in &self.entries {
            if let LinkState::Connected { link } = entry.state {
                if now.saturating_duration_since(entry.last_heartbeat_at) > timeout {
                    stale.push((peer.clone(), link));
                } else {
                    out.push(Action::Send {
                        link,
                        message: Message::Ping,
                    });
                }
            }
        }
        for (peer, link) in stale {
            warn!(event = "heartbeat_timeout", peer = %peer, link = link.0, "No traffic within heartbeat timeout; link is stale");
            self.drop_channel(&peer, link, out);
            self.schedule_reconnect(&peer, now);
        }
    }

    /// Close `link` and forget it; the entry becomes disconnected with no timer.
    fn drop_channel(&mut self, peer: &PeerId, link: LinkId, out: &mut Vec<Action>) {
        self.by_link.remove(&link);
        out.push(Action::Close { link });
        if let Some(entry) = self.entries.get_mut(peer) {
            entry.state = LinkState::Disconnected { reconnect_at: None };
        }
        self.status_changed(peer, PeerStatus::Disconnected, out);
    }

    fn status_changed(&mut self, peer: &PeerId, status: PeerStatus, out: &mut Vec<Action>) {
        self.dirty = true;
        out.push(Action::Notify(Notification::PeerStatus {
            peer: peer.clone(),
            status,
        }));
    }
}
