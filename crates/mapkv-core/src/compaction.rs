//! Compaction: dead space reclamation inside the container
//!
//! Over time the container accumulates tombstones, overwritten values, and
//! expired records. Compaction copies the live records into a fresh image and
//! installs it in place, keeping the file (and every sibling's mapping) intact.
//!
//! Crash safety comes from a journal written before the container is touched:
//! 1. Build the compacted image (header + live records) in memory
//! 2. Write it to `<container>.compact` and durable_sync file and directory
//! 3. Copy the records into the mapping, publish the header (generation + 1)
//! 4. Flush the mapping
//! 5. Remove the journal
//!
//! If the process crashes:
//! - Before step 2 completes: the journal fails validation and is discarded
//! - During step 3: the header still carries the old generation, the journal is re-applied
//! - After step 3: the generation matches the journal, which is just removed

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::container::Container;
use crate::error::{KvError, KvResult};
use crate::format::{valid_prefix_end, FileHeader, HeaderCheck, FORMAT_VERSION, HEADER_SIZE};
use crate::index::KeyIndex;
use crate::platform_durability::{durable_sync, sync_directory};

/// Result of a compaction operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionResult {
    /// Logical length before compaction
    pub original_bytes: u64,
    /// Logical length after compaction
    pub compacted_bytes: u64,
    /// Records carried over
    pub live_entries: usize,
    /// Expired keys dropped from the index
    pub expired_entries: usize,
}

impl CompactionResult {
    /// Fraction of the original record bytes that were dead.
    pub fn dead_space_ratio(&self) -> f64 {
        let used = self.original_bytes.saturating_sub(HEADER_SIZE as u64);
        if used == 0 {
            return 0.0;
        }
        self.bytes_saved() as f64 / used as f64
    }

    /// Space saved in bytes.
    pub fn bytes_saved(&self) -> u64 {
        self.original_bytes.saturating_sub(self.compacted_bytes)
    }
}

/// Suffix appended to a container's file name to form its journal.
pub const JOURNAL_SUFFIX: &str = ".compact";

/// Path of the compaction journal for a container.
pub fn journal_path(container_path: &Path) -> PathBuf {
    let mut name = container_path.as_os_str().to_owned();
    name.push(JOURNAL_SUFFIX);
    PathBuf::from(name)
}

/// Whether dead bytes (superseded, removed, or expired records) make up at
/// least `threshold` of the record area.
pub fn needs_compaction(index: &KeyIndex, container: &Container, now: u64, threshold: f64) -> bool {
    let used = container.logical_len().saturating_sub(HEADER_SIZE as u64);
    if used == 0 {
        return false;
    }
    let live = index.live_bytes().saturating_sub(index.expired_bytes(now));
    let dead = used.saturating_sub(live);
    dead as f64 / used as f64 >= threshold
}

/// Rewrite the container with only the live, unexpired records, then rebuild
/// the index against the new offsets.
///
/// The caller must hold the exclusive coordinator lock.
pub fn compact(container: &mut Container, index: &mut KeyIndex, now: u64) -> KvResult<CompactionResult> {
    let original_bytes = container.logical_len();

    let live = index.live_entries_by_offset(now);
    let live_entries = live.len();
    let expired_entries = index.len() - live_entries;

    let total: usize = live.iter().map(|(_, e)| e.record_len as usize).sum();
    let mut records = Vec::with_capacity(total);
    for (_, entry) in &live {
        records.extend_from_slice(container.slice(entry.offset, entry.record_len as usize));
    }

    let journal = journal_path(container.path());
    write_journal(&journal, container, &records)?;

    container.rewrite(&records)?;
    container.flush()?;
    remove_journal(&journal)?;

    index.rebuild(container);

    let result = CompactionResult {
        original_bytes,
        compacted_bytes: container.logical_len(),
        live_entries,
        expired_entries,
    };
    info!(
        path = %container.path().display(),
        live = live_entries,
        expired = expired_entries,
        saved = result.bytes_saved(),
        "compacted container"
    );
    Ok(result)
}

fn write_journal(journal: &Path, container: &Container, records: &[u8]) -> KvResult<()> {
    let current = container.header();
    let header = FileHeader {
        version: FORMAT_VERSION,
        allocated: container.allocated_size(),
        logical_len: (HEADER_SIZE + records.len()) as u64,
        sequence: current.sequence.wrapping_add(1),
        generation: current.generation.wrapping_add(1),
    };

    let mut file = fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(journal)
        .map_err(|e| KvError::io(journal, e, "Failed to create compaction journal"))?;
    file.write_all(&header.to_bytes())
        .map_err(|e| KvError::io(journal, e, "Failed to write journal header"))?;
    file.write_all(records)
        .map_err(|e| KvError::io(journal, e, "Failed to write journal records"))?;
    durable_sync(&file).map_err(|e| KvError::io(journal, e, "Failed to sync compaction journal"))?;

    if let Some(parent) = journal.parent() {
        sync_directory(parent).map_err(|e| KvError::io(parent, e, "Failed to sync directory after journal write"))?;
    }
    Ok(())
}

fn remove_journal(journal: &Path) -> KvResult<()> {
    match fs::remove_file(journal) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(KvError::io(journal, e, "Failed to remove compaction journal")),
    }
}

/// Finish or discard a compaction interrupted by a crash.
///
/// Returns true when the journal was applied to the container. The caller
/// must hold the exclusive coordinator lock, have the container's header
/// reloaded from the mapping, and rebuild its index afterwards.
pub fn recover_journal(container: &mut Container) -> KvResult<bool> {
    let journal = journal_path(container.path());
    let bytes = match fs::read(&journal) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(KvError::io(&journal, e, "Failed to read compaction journal")),
    };

    let applied = match FileHeader::parse(&bytes) {
        HeaderCheck::Valid(header) if journal_is_complete(&header, &bytes) => {
            if header.generation == container.header().generation.wrapping_add(1) {
                let end = header.logical_len as usize;
                container.rewrite(&bytes[HEADER_SIZE..end])?;
                container.flush()?;
                info!(path = %journal.display(), "re-applied interrupted compaction");
                true
            } else {
                // Generation already published: the rewrite finished before the crash
                false
            }
        }
        _ => {
            warn!(path = %journal.display(), "discarding incomplete compaction journal");
            false
        }
    };

    remove_journal(&journal)?;
    Ok(applied)
}

fn journal_is_complete(header: &FileHeader, bytes: &[u8]) -> bool {
    let end = header.logical_len as usize;
    end >= HEADER_SIZE && end <= bytes.len() && valid_prefix_end(&bytes[..end], HEADER_SIZE) == end
}
