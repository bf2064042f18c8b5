//! mapkv Core: Memory-Mapped Key-Value Store
//!
//! An embedded key-value store whose working set lives in a single
//! memory-mapped container file. Writes append records to the mapping, an
//! in-memory index points at each key's newest record, and the OS pages the
//! data to disk.
//!
//! # Architecture
//!
//! - **Read path**: index lookup, then a copy out of the mapping
//! - **Write path**: append a checksummed record, publish the header, update the index
//! - **Compaction**: rewrite live records in place when dead space dominates
//! - **Multi-process**: an advisory file lock plus header counters keep
//!   handles in several processes coherent
//!
//! ```no_run
//! use mapkv_core::{MapKv, ProcessMode};
//!
//! let kv = MapKv::open("settings", "/tmp/mapkv", ProcessMode::SingleProcess)?;
//! kv.set("theme", b"dark")?;
//! assert_eq!(kv.get("theme")?, Some(b"dark".to_vec()));
//! # Ok::<(), mapkv_core::KvError>(())
//! ```

pub mod compaction;
pub mod config;
pub mod container;
pub mod coordinator;
pub mod cursor;
pub mod error;
pub mod expiry;
pub mod format;
pub mod index;
pub mod init;
pub mod platform_durability;
pub mod store;

// Re-export key types for convenience
pub use compaction::CompactionResult;
pub use config::Config;
pub use coordinator::ProcessMode;
pub use cursor::KeyCursor;
pub use error::{KvError, KvResult};
pub use expiry::ExpirePolicy;
pub use init::ensure_initialized;
pub use store::{MapKv, ReadStatus};
