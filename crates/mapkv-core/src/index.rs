//! In-memory key index
//!
//! Maps each key to the location of its newest record inside the container.
//! Entries hold offsets only, so remapping the container never invalidates
//! them; compaction and clear move records and force a rebuild.

use hashbrown::HashMap;
use tracing::{debug, warn};

use crate::container::Container;
use crate::expiry::is_expired;
use crate::format::{decode, Record, HEADER_SIZE};

/// Location of a key's current record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    /// Offset of the record from the start of the container
    pub offset: u64,
    /// Encoded record length
    pub record_len: u32,
    /// Offset of the value bytes
    pub value_offset: u64,
    pub value_len: u32,
    pub expire_at: Option<u64>,
}

impl IndexEntry {
    fn from_record(offset: u64, record_len: usize, record: &Record<'_>) -> Self {
        Self {
            offset,
            record_len: record_len as u32,
            value_offset: record.value_offset as u64,
            value_len: record.value.len() as u32,
            expire_at: record.expire_at,
        }
    }

    pub fn is_expired(&self, now: u64) -> bool {
        is_expired(self.expire_at, now)
    }
}

/// Summary of one replay pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayOutcome {
    /// Records applied
    pub records: usize,
    /// Offset just past the last valid record
    pub end: u64,
}

/// Key to newest-record map plus byte accounting for the compaction trigger.
#[derive(Debug)]
pub struct KeyIndex {
    entries: HashMap<String, IndexEntry>,
    /// Bytes of records the index currently points at
    live_bytes: u64,
    /// Bytes of superseded records and tombstones
    dead_bytes: u64,
    /// Offset up to which the container has been applied
    replayed_end: u64,
}

impl KeyIndex {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            live_bytes: 0,
            dead_bytes: 0,
            replayed_end: HEADER_SIZE as u64,
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.live_bytes = 0;
        self.dead_bytes = 0;
        self.replayed_end = HEADER_SIZE as u64;
    }

    /// Discard the index and replay the whole container.
    pub fn rebuild(&mut self, container: &Container) -> ReplayOutcome {
        self.clear();
        let outcome = self.replay_from(container, HEADER_SIZE as u64);
        debug!(
            path = %container.path().display(),
            records = outcome.records,
            keys = self.entries.len(),
            "rebuilt key index"
        );
        outcome
    }

    /// Apply records from `start` up to the container's logical length.
    ///
    /// Last writer wins; a tombstone drops the key. Replay stops at the first
    /// corrupt or torn record, which becomes the logical end of data.
    pub fn replay_from(&mut self, container: &Container, start: u64) -> ReplayOutcome {
        let bytes = container.committed();
        let mut offset = start as usize;
        let mut records = 0;

        while offset < bytes.len() {
            match decode(bytes, offset) {
                Ok((record, consumed)) => {
                    self.apply(offset as u64, consumed, &record);
                    offset += consumed;
                    records += 1;
                }
                Err(err) => {
                    warn!(path = %container.path().display(), "replay stopped: {}", err);
                    break;
                }
            }
        }

        self.replayed_end = offset as u64;
        ReplayOutcome { records, end: offset as u64 }
    }

    fn apply(&mut self, offset: u64, consumed: usize, record: &Record<'_>) {
        if record.tombstone {
            self.record_tombstone(record.key, consumed);
        } else {
            self.upsert(record.key.to_owned(), IndexEntry::from_record(offset, consumed, record));
        }
    }

    /// Point `key` at a freshly appended record. Returns the superseded entry.
    pub fn upsert(&mut self, key: String, entry: IndexEntry) -> Option<IndexEntry> {
        self.live_bytes += entry.record_len as u64;
        let old = self.entries.insert(key, entry);
        if let Some(old) = &old {
            self.live_bytes -= old.record_len as u64;
            self.dead_bytes += old.record_len as u64;
        }
        old
    }

    /// Drop `key` from the index.
    pub fn delete(&mut self, key: &str) -> Option<IndexEntry> {
        let old = self.entries.remove(key);
        if let Some(old) = &old {
            self.live_bytes -= old.record_len as u64;
            self.dead_bytes += old.record_len as u64;
        }
        old
    }

    /// Drop `key` after its tombstone of `tombstone_len` bytes was appended.
    pub fn record_tombstone(&mut self, key: &str, tombstone_len: usize) -> Option<IndexEntry> {
        self.dead_bytes += tombstone_len as u64;
        self.delete(key)
    }

    /// Note that records up to `end` were appended by this handle.
    pub fn mark_replayed(&mut self, end: u64) {
        self.replayed_end = end;
    }

    pub fn replayed_end(&self) -> u64 {
        self.replayed_end
    }

    /// Entry for `key`, expired or not.
    pub fn lookup(&self, key: &str) -> Option<&IndexEntry> {
        self.entries.get(key)
    }

    /// Entry for `key` unless it has expired at `now`.
    pub fn lookup_live(&self, key: &str, now: u64) -> Option<&IndexEntry> {
        self.entries.get(key).filter(|entry| !entry.is_expired(now))
    }

    /// Keys in the index, including expired ones awaiting compaction.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn live_len(&self, now: u64) -> usize {
        self.entries.values().filter(|e| !e.is_expired(now)).count()
    }

    pub fn live_keys(&self, now: u64) -> impl Iterator<Item = &str> + '_ {
        self.entries
            .iter()
            .filter(move |(_, e)| !e.is_expired(now))
            .map(|(k, _)| k.as_str())
    }

    /// Live entries in container order.
    pub fn live_entries_by_offset(&self, now: u64) -> Vec<(&str, &IndexEntry)> {
        let mut live: Vec<(&str, &IndexEntry)> = self
            .entries
            .iter()
            .filter(|(_, e)| !e.is_expired(now))
            .map(|(k, e)| (k.as_str(), e))
            .collect();
        live.sort_by_key(|(_, e)| e.offset);
        live
    }

    pub fn live_bytes(&self) -> u64 {
        self.live_bytes
    }

    pub fn dead_bytes(&self) -> u64 {
        self.dead_bytes
    }

    /// Bytes held by records that have expired at `now`.
    pub fn expired_bytes(&self, now: u64) -> u64 {
        self.entries
            .values()
            .filter(|e| e.is_expired(now))
            .map(|e| e.record_len as u64)
            .sum()
    }
}

impl Default for KeyIndex {
    fn default() -> Self { Self::new() }
}
