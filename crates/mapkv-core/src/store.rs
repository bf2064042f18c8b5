//! Store facade: the public operation surface of mapkv.
//!
//! A `MapKv` handle owns one container, its key index, and a process
//! coordinator. Every operation runs under the coordinator:
//!
//! **Read path**: mutex (+ shared file lock), revalidate, serve from the mapping
//! **Write path**: mutex (+ exclusive file lock), revalidate, append, update index
//!
//! Revalidation only happens in multi-process mode: the handle compares the
//! header's sequence and generation with what it last observed and replays
//! whatever a sibling process wrote in between.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::compaction::{self, journal_path, needs_compaction, CompactionResult, JOURNAL_SUFFIX};
use crate::config::Config;
use crate::container::Container;
use crate::coordinator::{Access, CoordinatorGuard, FileLock, ProcessCoordinator, ProcessMode, LOCK_SUFFIX};
use crate::cursor::KeyCursor;
use crate::error::{KvError, KvResult};
use crate::expiry::{now_secs, stamp_after, ExpirePolicy};
use crate::format::{self, RECORD_HEADER_SIZE};
use crate::index::{IndexEntry, KeyIndex};
use crate::init::{ensure_initialized, page_size};

/// Outcome of copying a value into a caller-provided buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// The value was copied; holds its length
    Copied(usize),
    NotFound,
    /// Nothing was copied; retry with at least `required` bytes
    BufferTooSmall { required: usize },
}

impl ReadStatus {
    /// `1` copied, `0` not found, `-required` when the buffer is too small.
    pub fn code(&self) -> i64 {
        match *self {
            ReadStatus::Copied(_) => 1,
            ReadStatus::NotFound => 0,
            ReadStatus::BufferTooSmall { required } => -(required as i64),
        }
    }

    fn copy(value: Option<&[u8]>, buf: &mut [u8]) -> Self {
        match value {
            None => ReadStatus::NotFound,
            Some(value) if value.len() > buf.len() => {
                ReadStatus::BufferTooSmall { required: value.len() }
            }
            Some(value) => {
                buf[..value.len()].copy_from_slice(value);
                ReadStatus::Copied(value.len())
            }
        }
    }
}

/// Header fields this handle last saw.
#[derive(Debug, Clone, Copy, Default)]
struct Observed {
    sequence: u64,
    generation: u64,
}

/// Everything guarded by the coordinator.
struct StoreState {
    container: Container,
    index: KeyIndex,
    expiry: ExpirePolicy,
    observed: Observed,
}

impl StoreState {
    /// Open the container, finish any interrupted compaction, and replay.
    /// Runs under the exclusive file lock in multi-process mode.
    fn load(path: &Path, min_size: u64) -> KvResult<Self> {
        let mut container = Container::open(path, min_size)?;
        compaction::recover_journal(&mut container)?;

        let mut index = KeyIndex::new();
        let outcome = index.rebuild(&container);

        let mut state = Self {
            container,
            index,
            expiry: ExpirePolicy::default(),
            observed: Observed::default(),
        };
        state.observe();
        state.truncate_after_corruption();

        if outcome.records > 0 {
            info!(
                path = %path.display(),
                records = outcome.records,
                keys = state.index.len(),
                "replayed container"
            );
        }
        Ok(state)
    }

    fn observe(&mut self) {
        let header = self.container.header();
        self.observed = Observed {
            sequence: header.sequence,
            generation: header.generation,
        };
    }

    /// Cut the logical length back to where replay stopped, so new records
    /// are never appended behind a corrupt one.
    fn truncate_after_corruption(&mut self) {
        let end = self.index.replayed_end();
        if end < self.container.logical_len() {
            warn!(
                path = %self.container.path().display(),
                from = self.container.logical_len(),
                to = end,
                "truncating container after corrupt record"
            );
            self.container.set_logical_len(end);
            self.observe();
        }
    }

    /// Catch up with writes made by sibling processes.
    fn revalidate(&mut self, journal: &Path, access: Access) -> KvResult<()> {
        // Journal recovery compares generations, so it needs the published header
        self.container.remap_if_grown()?;
        if access == Access::Write && journal.exists() {
            compaction::recover_journal(&mut self.container)?;
        }
        let header = *self.container.header();

        if header.generation != self.observed.generation {
            debug!(path = %self.container.path().display(), "container rewritten externally, rebuilding index");
            self.index.rebuild(&self.container);
        } else if header.sequence != self.observed.sequence {
            let from = self.index.replayed_end();
            if header.logical_len < from {
                self.index.rebuild(&self.container);
            } else {
                self.index.replay_from(&self.container, from);
            }
        }
        self.observe();

        if access == Access::Write {
            self.truncate_after_corruption();
        }
        Ok(())
    }

    fn live_value(&self, key: &str, now: u64) -> Option<&[u8]> {
        self.index
            .lookup_live(key, now)
            .map(|entry| self.container.slice(entry.value_offset, entry.value_len as usize))
    }

    /// Make room for `len` more bytes, compacting first when enough is dead.
    fn reserve(&mut self, len: u64, now: u64, config: &Config) -> KvResult<()> {
        if self.container.has_room(len) {
            return Ok(());
        }
        if needs_compaction(&self.index, &self.container, now, config.compaction_trigger_ratio) {
            compaction::compact(&mut self.container, &mut self.index, now)?;
        }
        self.container.ensure_capacity(len, config.growth_factor)?;
        Ok(())
    }

    fn write_value(
        &mut self,
        key: &str,
        value: &[u8],
        expire_at: Option<u64>,
        now: u64,
        config: &Config,
    ) -> KvResult<()> {
        let record = format::encode(key, value, expire_at)?;
        self.reserve(record.len() as u64, now, config)?;

        let offset = self.container.append(&record)?;
        let entry = IndexEntry {
            offset,
            record_len: record.len() as u32,
            value_offset: offset + (RECORD_HEADER_SIZE + key.len()) as u64,
            value_len: value.len() as u32,
            expire_at,
        };
        self.index.upsert(key.to_owned(), entry);
        self.index.mark_replayed(self.container.logical_len());
        self.observe();
        Ok(())
    }

    fn write_tombstone(&mut self, key: &str, now: u64, config: &Config) -> KvResult<()> {
        let record = format::encode_tombstone(key)?;
        self.reserve(record.len() as u64, now, config)?;

        self.container.append(&record)?;
        self.index.record_tombstone(key, record.len());
        self.index.mark_replayed(self.container.logical_len());
        self.observe();
        Ok(())
    }
}

/// An open key-value container.
///
/// All methods take `&self`; share a handle between threads with `Arc`.
/// Opening the same container twice in one process yields independent
/// handles, which is only coherent in multi-process mode.
pub struct MapKv {
    map_id: String,
    path: PathBuf,
    journal: PathBuf,
    config: Config,
    coordinator: ProcessCoordinator<StoreState>,
}

impl MapKv {
    /// Open or create container `map_id` inside `dir` with the default config.
    pub fn open<P: AsRef<Path>>(map_id: &str, dir: P, mode: ProcessMode) -> KvResult<Self> {
        Self::open_with_config(map_id, dir, mode, Config::default())
    }

    /// Open or create container `map_id` inside `dir`.
    ///
    /// The container lives at `dir/map_id`; multi-process mode also uses
    /// `dir/map_id.lock` for the inter-process lock.
    pub fn open_with_config<P: AsRef<Path>>(
        map_id: &str,
        dir: P,
        mode: ProcessMode,
        config: Config,
    ) -> KvResult<Self> {
        ensure_initialized();
        validate_map_id(map_id)?;
        config.validate()?;

        let dir = dir.as_ref();
        if dir.as_os_str().is_empty() {
            return Err(KvError::invalid("dir", "directory path must not be empty"));
        }
        fs::create_dir_all(dir).map_err(|e| KvError::io(dir, e, "Failed to create store directory"))?;

        let path = dir.join(map_id);
        let min_size = if config.initial_size == 0 { page_size() } else { config.initial_size };

        let file_lock = match mode {
            ProcessMode::MultiProcess => Some(FileLock::open(&dir.join(format!("{}{}", map_id, LOCK_SUFFIX)))?),
            ProcessMode::SingleProcess => None,
        };

        let state = {
            let _exclusive = match &file_lock {
                Some(lock) => Some(lock.acquire(Access::Write)?),
                None => None,
            };
            StoreState::load(&path, min_size)?
        };

        debug!(map_id, path = %path.display(), ?mode, "opened container");
        Ok(Self {
            map_id: map_id.to_string(),
            journal: journal_path(&path),
            path,
            config,
            coordinator: ProcessCoordinator::new(state, file_lock),
        })
    }

    /// Flush and release the handle.
    pub fn close(self) -> KvResult<()> {
        let state = self.coordinator.into_inner();
        state.container.flush()?;
        debug!(map_id = %self.map_id, "closed container");
        Ok(())
    }

    pub fn map_id(&self) -> &str {
        &self.map_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> ProcessMode {
        self.coordinator.mode()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn begin(&self, access: Access) -> KvResult<CoordinatorGuard<'_, StoreState>> {
        let mut guard = self.coordinator.acquire(access)?;
        if self.mode() == ProcessMode::MultiProcess {
            let mut access = access;
            // A leftover journal means a sibling died mid-compaction; fixing
            // it needs the exclusive lock.
            if access == Access::Read && self.journal.exists() {
                drop(guard);
                guard = self.coordinator.acquire(Access::Write)?;
                access = Access::Write;
            }
            guard.revalidate(&self.journal, access)?;
        }
        Ok(guard)
    }

    fn finish(&self, state: &StoreState) -> KvResult<()> {
        if self.config.sync_writes {
            state.container.flush()?;
        }
        Ok(())
    }

    fn validate_key(&self, key: &str) -> KvResult<()> {
        if key.is_empty() {
            return Err(KvError::invalid("key", "key must not be empty"));
        }
        if key.len() > self.config.max_key_size {
            return Err(KvError::OversizedEntry {
                entry_size: key.len() as u64,
                max_size: self.config.max_key_size as u64,
                component: "key",
            });
        }
        Ok(())
    }

    fn validate_value(&self, value: &[u8]) -> KvResult<()> {
        if value.is_empty() {
            return Err(KvError::invalid("value", "value must not be empty"));
        }
        if value.len() > self.config.max_value_size {
            return Err(KvError::OversizedEntry {
                entry_size: value.len() as u64,
                max_size: self.config.max_value_size as u64,
                component: "value",
            });
        }
        Ok(())
    }

    /// Store `value` under `key`, stamped with the auto-expire duration if enabled.
    pub fn set(&self, key: &str, value: &[u8]) -> KvResult<()> {
        self.validate_key(key)?;
        self.validate_value(value)?;

        let mut state = self.begin(Access::Write)?;
        let now = now_secs();
        let expire_at = state.expiry.stamp(now);
        state.write_value(key, value, expire_at, now, &self.config)?;
        self.finish(&state)
    }

    /// Store `value` under `key`, expiring after `seconds` (0 = never)
    /// regardless of the handle's auto-expire setting.
    pub fn set_with_expire(&self, key: &str, value: &[u8], seconds: u32) -> KvResult<()> {
        self.validate_key(key)?;
        self.validate_value(value)?;

        let mut state = self.begin(Access::Write)?;
        let now = now_secs();
        state.write_value(key, value, stamp_after(seconds, now), now, &self.config)?;
        self.finish(&state)
    }

    pub fn get(&self, key: &str) -> KvResult<Option<Vec<u8>>> {
        self.validate_key(key)?;
        let state = self.begin(Access::Read)?;
        Ok(state.live_value(key, now_secs()).map(<[u8]>::to_vec))
    }

    /// Copy the value for `key` into `buf`.
    pub fn get_into(&self, key: &str, buf: &mut [u8]) -> KvResult<ReadStatus> {
        self.validate_key(key)?;
        let state = self.begin(Access::Read)?;
        Ok(ReadStatus::copy(state.live_value(key, now_secs()), buf))
    }

    /// Remove `key`, returning the value it held.
    pub fn remove(&self, key: &str) -> KvResult<Option<Vec<u8>>> {
        self.validate_key(key)?;
        let mut state = self.begin(Access::Write)?;
        let now = now_secs();

        let value = match state.live_value(key, now) {
            Some(value) => value.to_vec(),
            None => return Ok(None),
        };
        state.write_tombstone(key, now, &self.config)?;
        self.finish(&state)?;
        Ok(Some(value))
    }

    /// Copy the value for `key` into `buf`, removing the key only if the copy succeeded.
    pub fn remove_into(&self, key: &str, buf: &mut [u8]) -> KvResult<ReadStatus> {
        self.validate_key(key)?;
        let mut state = self.begin(Access::Write)?;
        let now = now_secs();

        let status = ReadStatus::copy(state.live_value(key, now), buf);
        if let ReadStatus::Copied(_) = status {
            state.write_tombstone(key, now, &self.config)?;
            self.finish(&state)?;
        }
        Ok(status)
    }

    pub fn contains(&self, key: &str) -> KvResult<bool> {
        self.validate_key(key)?;
        let state = self.begin(Access::Read)?;
        Ok(state.index.lookup_live(key, now_secs()).is_some())
    }

    /// Number of keys with an unexpired value.
    pub fn count(&self) -> KvResult<usize> {
        let state = self.begin(Access::Read)?;
        Ok(state.index.live_len(now_secs()))
    }

    /// Number of keys in the index, counting expired ones not yet compacted away.
    pub fn count_including_expired(&self) -> KvResult<usize> {
        let state = self.begin(Access::Read)?;
        Ok(state.index.len())
    }

    /// Bytes of backing storage allocated for the container.
    pub fn total_size(&self) -> KvResult<u64> {
        let state = self.begin(Access::Read)?;
        Ok(state.container.allocated_size())
    }

    /// Bytes in use: header plus every record up to the logical end.
    pub fn actual_size(&self) -> KvResult<u64> {
        let state = self.begin(Access::Read)?;
        Ok(state.container.logical_len())
    }

    /// All unexpired keys, sorted.
    pub fn all_keys(&self) -> KvResult<Vec<String>> {
        let state = self.begin(Access::Read)?;
        let mut keys: Vec<String> = state.index.live_keys(now_secs()).map(str::to_owned).collect();
        keys.sort_unstable();
        Ok(keys)
    }

    /// Cursor over a snapshot of `all_keys()`.
    pub fn key_cursor(&self) -> KvResult<KeyCursor> {
        Ok(KeyCursor::new(self.all_keys()?))
    }

    /// Compact away overwritten, removed, and expired records.
    ///
    /// Live data is untouched and the allocated size is kept.
    pub fn trim(&self) -> KvResult<CompactionResult> {
        let mut state = self.begin(Access::Write)?;
        let now = now_secs();
        let StoreState { container, index, .. } = &mut *state;
        let result = compaction::compact(container, index, now)?;
        state.observe();
        self.finish(&state)?;
        Ok(result)
    }

    /// Remove every key and shrink the file to its minimum size.
    pub fn clear(&self) -> KvResult<()> {
        let mut state = self.begin(Access::Write)?;
        match fs::remove_file(&self.journal) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(KvError::io(&self.journal, e, "Failed to remove compaction journal")),
        }

        state.container.truncate_to_header()?;
        state.index.clear();
        state.observe();
        info!(map_id = %self.map_id, "cleared container");
        self.finish(&state)
    }

    /// Stamp every later write with an expiration `seconds` from its write time.
    ///
    /// `0` enables expiration with nothing stamped (never expire).
    pub fn enable_auto_expire(&self, seconds: u32) -> KvResult<()> {
        self.coordinator.local().expiry.enable(seconds);
        debug!(map_id = %self.map_id, seconds, "auto-expire enabled");
        Ok(())
    }

    /// Stop stamping new writes. Records already stamped keep their expiration.
    pub fn disable_auto_expire(&self) -> KvResult<()> {
        self.coordinator.local().expiry.disable();
        debug!(map_id = %self.map_id, "auto-expire disabled");
        Ok(())
    }

    pub fn expire_policy(&self) -> ExpirePolicy {
        self.coordinator.local().expiry
    }

    /// msync the mapping to storage.
    pub fn flush(&self) -> KvResult<()> {
        self.coordinator.local().container.flush()
    }
}

fn validate_map_id(map_id: &str) -> KvResult<()> {
    if map_id.is_empty() {
        return Err(KvError::invalid("map_id", "map id must not be empty"));
    }
    if map_id == "." || map_id == ".." || map_id.contains(['/', '\\', '\0']) {
        return Err(KvError::invalid("map_id", format!("`{}` is not a plain file name", map_id)));
    }
    // Sidecar files live next to the container under these suffixes
    for suffix in [JOURNAL_SUFFIX, LOCK_SUFFIX] {
        if map_id.ends_with(suffix) {
            return Err(KvError::invalid("map_id", format!("`{}` ends with reserved suffix `{}`", map_id, suffix)));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> MapKv {
        MapKv::open("test", dir.path(), ProcessMode::SingleProcess).unwrap()
    }

    #[test]
    fn test_open_empty() {
        let dir = TempDir::new().unwrap();
        let kv = open(&dir);
        assert_eq!(kv.count().unwrap(), 0);
        assert_eq!(kv.total_size().unwrap(), page_size());
        assert_eq!(kv.mode(), ProcessMode::SingleProcess);
        assert!(kv.path().ends_with("test"));
    }

    #[test]
    fn test_invalid_arguments() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            MapKv::open("", dir.path(), ProcessMode::SingleProcess),
            Err(KvError::InvalidArgument { argument: "map_id", .. })
        ));
        assert!(MapKv::open("a/b", dir.path(), ProcessMode::SingleProcess).is_err());
        assert!(MapKv::open("..", dir.path(), ProcessMode::SingleProcess).is_err());
        assert!(MapKv::open("a.compact", dir.path(), ProcessMode::SingleProcess).is_err());
        assert!(MapKv::open("a.lock", dir.path(), ProcessMode::SingleProcess).is_err());
        assert!(MapKv::open("a.locked", dir.path(), ProcessMode::SingleProcess).is_ok());
        assert!(MapKv::open("ok", "", ProcessMode::SingleProcess).is_err());

        let kv = open(&dir);
        assert!(matches!(kv.set("", b"v"), Err(KvError::InvalidArgument { argument: "key", .. })));
        assert!(matches!(kv.set("k", b""), Err(KvError::InvalidArgument { argument: "value", .. })));
        assert_eq!(kv.actual_size().unwrap(), format::HEADER_SIZE as u64);
    }

    #[test]
    fn test_set_get_overwrite() {
        let dir = TempDir::new().unwrap();
        let kv = open(&dir);
        kv.set("k", b"v1").unwrap();
        kv.set("k", b"v2").unwrap();
        assert_eq!(kv.get("k").unwrap(), Some(b"v2".to_vec()));
        assert_eq!(kv.count().unwrap(), 1);
        assert_eq!(kv.get("missing").unwrap(), None);
    }

    #[test]
    fn test_oversized_key_rejected_by_config() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.max_key_size = 4;
        let kv = MapKv::open_with_config("t", dir.path(), ProcessMode::SingleProcess, config).unwrap();
        assert!(matches!(kv.set("toolong", b"v"), Err(KvError::OversizedEntry { component: "key", .. })));
    }

    #[test]
    fn test_read_status_codes() {
        let mut buf = [0u8; 4];
        assert_eq!(ReadStatus::copy(None, &mut buf).code(), 0);
        assert_eq!(ReadStatus::copy(Some(&b"abcdef"[..]), &mut buf).code(), -6);
        let status = ReadStatus::copy(Some(&b"abcd"[..]), &mut buf);
        assert_eq!(status, ReadStatus::Copied(4));
        assert_eq!(status.code(), 1);
        assert_eq!(&buf, b"abcd");
    }

    #[test]
    fn test_remove_into_keeps_key_when_buffer_small() {
        let dir = TempDir::new().unwrap();
        let kv = open(&dir);
        kv.set("k", b"twelve bytes").unwrap();

        let mut small = [0u8; 4];
        assert_eq!(kv.remove_into("k", &mut small).unwrap(), ReadStatus::BufferTooSmall { required: 12 });
        assert!(kv.contains("k").unwrap());

        let mut exact = [0u8; 12];
        assert_eq!(kv.remove_into("k", &mut exact).unwrap(), ReadStatus::Copied(12));
        assert_eq!(&exact, b"twelve bytes");
        assert!(!kv.contains("k").unwrap());
        assert_eq!(kv.remove_into("k", &mut exact).unwrap(), ReadStatus::NotFound);
    }

    #[test]
    fn test_reopen_replays() {
        let dir = TempDir::new().unwrap();
        {
            let kv = open(&dir);
            kv.set("survive1", b"yes").unwrap();
            kv.set("survive2", b"also_yes").unwrap();
            kv.set("doomed", b"temp").unwrap();
            kv.remove("doomed").unwrap();
            kv.close().unwrap();
        }
        let kv = open(&dir);
        assert_eq!(kv.get("survive1").unwrap(), Some(b"yes".to_vec()));
        assert_eq!(kv.get("survive2").unwrap(), Some(b"also_yes".to_vec()));
        assert_eq!(kv.get("doomed").unwrap(), None);
        assert_eq!(kv.count().unwrap(), 2);
    }

    #[test]
    fn test_growth_triggers_compaction_when_mostly_dead() {
        let dir = TempDir::new().unwrap();
        let kv = open(&dir);
        let value = vec![b'x'; 256];
        // Rewriting one key fills the page with dead records
        for _ in 0..64 {
            kv.set("hot", &value).unwrap();
        }
        assert_eq!(kv.total_size().unwrap(), page_size());
        assert_eq!(kv.count().unwrap(), 1);
        assert_eq!(kv.get("hot").unwrap(), Some(value));
    }

    #[test]
    fn test_growth_when_live() {
        let dir = TempDir::new().unwrap();
        let kv = open(&dir);
        let value = vec![b'y'; 512];
        for i in 0..32 {
            kv.set(&format!("key{:02}", i), &value).unwrap();
        }
        assert!(kv.total_size().unwrap() > page_size());
        assert_eq!(kv.total_size().unwrap() % page_size(), 0);
        for i in 0..32 {
            assert_eq!(kv.get(&format!("key{:02}", i)).unwrap().as_deref(), Some(&value[..]));
        }
    }

    #[test]
    fn test_trim_reports_reclaimed_space() {
        let dir = TempDir::new().unwrap();
        let kv = open(&dir);
        kv.set("a", b"1").unwrap();
        kv.set("a", b"2").unwrap();
        kv.set("b", b"3").unwrap();
        kv.remove("b").unwrap();

        let allocated = kv.total_size().unwrap();
        let result = kv.trim().unwrap();
        assert_eq!(result.live_entries, 1);
        assert!(result.bytes_saved() > 0);
        assert_eq!(kv.total_size().unwrap(), allocated);
        assert_eq!(kv.get("a").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn test_clear_removes_everything() {
        let dir = TempDir::new().unwrap();
        let kv = open(&dir);
        for i in 0..100 {
            kv.set(&format!("k{}", i), &[7u8; 200]).unwrap();
        }
        assert!(kv.total_size().unwrap() > page_size());

        kv.clear().unwrap();
        assert_eq!(kv.count().unwrap(), 0);
        assert_eq!(kv.total_size().unwrap(), page_size());
        assert!(kv.all_keys().unwrap().is_empty());

        kv.set("after", b"clear").unwrap();
        assert_eq!(kv.get("after").unwrap(), Some(b"clear".to_vec()));
    }

    #[test]
    fn test_expire_policy_toggles() {
        let dir = TempDir::new().unwrap();
        let kv = open(&dir);
        assert_eq!(kv.expire_policy(), ExpirePolicy::Disabled);
        kv.enable_auto_expire(60).unwrap();
        assert_eq!(kv.expire_policy(), ExpirePolicy::After(60));
        kv.set("k", b"v").unwrap();
        kv.disable_auto_expire().unwrap();
        assert_eq!(kv.expire_policy(), ExpirePolicy::Disabled);

        let state = kv.coordinator.local();
        let stamped = state.index.lookup("k").unwrap().expire_at.unwrap();
        assert!(stamped >= now_secs() + 59);
    }

    #[test]
    fn test_set_with_expire_overrides_policy() {
        let dir = TempDir::new().unwrap();
        let kv = open(&dir);
        kv.enable_auto_expire(60).unwrap();
        kv.set_with_expire("forever", b"v", 0).unwrap();
        let state = kv.coordinator.local();
        assert_eq!(state.index.lookup("forever").unwrap().expire_at, None);
    }

    #[test]
    fn test_concurrent_writers() {
        let dir = TempDir::new().unwrap();
        let kv = Arc::new(open(&dir));

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let kv = Arc::clone(&kv);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        kv.set(&format!("t{}-{}", t, i), format!("v{}", i).as_bytes()).unwrap();
                    }
                })
            })
            .collect();
        for h in handles { h.join().unwrap(); }

        assert_eq!(kv.count().unwrap(), 200);
        assert_eq!(kv.get("t3-49").unwrap(), Some(b"v49".to_vec()));
    }

    #[test]
    fn test_corrupt_tail_truncated_on_open() {
        let dir = TempDir::new().unwrap();
        let path;
        let good_end;
        {
            let kv = open(&dir);
            kv.set("good", b"1").unwrap();
            good_end = kv.actual_size().unwrap();
            kv.set("bad", b"2").unwrap();
            path = kv.path().to_path_buf();
            kv.close().unwrap();
        }
        let mut bytes = fs::read(&path).unwrap();
        bytes[good_end as usize + RECORD_HEADER_SIZE] ^= 0xFF;
        fs::write(&path, bytes).unwrap();

        let kv = open(&dir);
        assert_eq!(kv.get("good").unwrap(), Some(b"1".to_vec()));
        assert_eq!(kv.get("bad").unwrap(), None);
        assert_eq!(kv.actual_size().unwrap(), good_end);

        kv.set("next", b"3").unwrap();
        drop(kv);
        let kv = open(&dir);
        assert_eq!(kv.get("next").unwrap(), Some(b"3".to_vec()));
    }
}
