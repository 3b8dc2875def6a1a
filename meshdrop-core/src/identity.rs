//! Peer and file identity: peer ids, file fingerprints, display names.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Opaque, stable id of a mesh participant. Assigned by the transport (or generated once per run).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        PeerId(id.into())
    }

    /// Fresh random id (uuid v4, simple form).
    pub fn generate() -> Self {
        PeerId(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        PeerId(s.to_string())
    }
}

/// Globally unique handle of one shared file: `{senderId}-{unixMillis}-{random}`.
/// Every later reference (request, chunk, ack, cancel, delete) uses it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Generate a fingerprint for a file offered by `sender`.
    pub fn generate(sender: &PeerId) -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let random: u32 = rand::thread_rng().gen_range(0..0x0100_0000);
        Fingerprint(format!("{}-{}-{:06x}", sender, millis, random))
    }

    pub fn new(id: impl Into<String>) -> Self {
        Fingerprint(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Name the coordinator gives itself.
pub const COORDINATOR_NAME: &str = "Host";

/// Default name for the n-th participant a coordinator sees.
pub fn participant_name(n: u32) -> String {
    format!("Participant {}", n)
}

/// Trim and truncate a free-text display name to `max_len` characters.
/// Returns None when nothing is left.
pub fn clean_display_name(raw: &str, max_len: usize) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let cut: String = trimmed.chars().take(max_len).collect();
    let cut = cut.trim_end();
    (!cut.is_empty()).then(|| cut.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_embeds_sender() {
        let peer = PeerId::new("alice");
        let fp = Fingerprint::generate(&peer);
        assert!(fp.as_str().starts_with("alice-"));
        assert_eq!(fp.as_str().split('-').count(), 3);
    }

    #[test]
    fn fingerprints_do_not_collide() {
        let peer = PeerId::new("alice");
        let a = Fingerprint::generate(&peer);
        let b = Fingerprint::generate(&peer);
        // Same millisecond is likely; the random suffix keeps them apart.
        assert_ne!(a, b);
    }

    #[test]
    fn generated_peer_ids_differ() {
        assert_ne!(PeerId::generate(), PeerId::generate());
    }

    #[test]
    fn display_name_truncated() {
        let name = clean_display_name("  a very long display name indeed  ", 20).unwrap();
        assert_eq!(name.chars().count(), 19);
        assert_eq!(name, "a very long display");
        let name = clean_display_name("abcdefghij", 4).unwrap();
        assert_eq!(name, "abcd");
    }

    #[test]
    fn display_name_empty_rejected() {
        assert!(clean_display_name("   ", 20).is_none());
    }

    #[test]
    fn display_name_counts_chars_not_bytes() {
        let name = clean_display_name("ééééé", 3).unwrap();
        assert_eq!(name, "ééé");
    }
}
