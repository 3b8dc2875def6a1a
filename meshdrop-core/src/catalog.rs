//! Replicated file history: every known FileRecord, in arrival order, unique by fingerprint.

use std::collections::HashSet;

use crate::identity::Fingerprint;
use crate::protocol::FileRecord;

#[derive(Debug, Default)]
pub struct FileCatalog {
    records: Vec<FileRecord>,
    seen: HashSet<Fingerprint>,
}

impl FileCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a record unless its fingerprint is already known. Returns whether it was new.
    pub fn insert(&mut self, record: FileRecord) -> bool {
        if !self.seen.insert(record.fingerprint.clone()) {
            return false;
        }
        self.records.push(record);
        true
    }

    pub fn remove(&mut self, fingerprint: &Fingerprint) -> Option<FileRecord> {
        if !self.seen.remove(fingerprint) {
            return None;
        }
        let idx = self
            .records
            .iter()
            .position(|r| &r.fingerprint == fingerprint)?;
        Some(self.records.remove(idx))
    }

    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.seen.contains(fingerprint)
    }

    pub fn records(&self) -> &[FileRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
