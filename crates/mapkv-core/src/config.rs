//! Configuration for mapkv containers
//!
//! Provides presets for the common durability trade-offs and a
//! validation pass run at open time.

use crate::error::{KvError, KvResult};
use crate::format::{MAX_KEY_SIZE, MAX_VALUE_SIZE};

/// Per-handle configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Minimum (and empty) container size in bytes; 0 means one system page
    pub initial_size: u64,
    /// Multiplier applied to the allocated size when the container grows
    pub growth_factor: u64,
    /// Compact instead of growing when dead record bytes reach this fraction
    pub compaction_trigger_ratio: f64,
    /// Maximum key size in bytes
    pub max_key_size: usize,
    /// Maximum value size in bytes
    pub max_value_size: usize,
    /// msync the mapping after every mutation
    pub sync_writes: bool,
}

impl Config {
    /// Leave flushing of dirty pages to the OS.
    pub fn standard() -> Self {
        Self {
            initial_size: 0,
            growth_factor: 2,
            compaction_trigger_ratio: 0.5,
            max_key_size: 4096,
            max_value_size: 64 * 1024 * 1024,
            sync_writes: false,
        }
    }

    /// Flush the mapping to storage before every mutation returns.
    pub fn durable() -> Self {
        Self { sync_writes: true, ..Self::standard() }
    }

    /// Validate all configuration parameters
    pub fn validate(&self) -> KvResult<()> {
        if self.growth_factor < 2 {
            return Err(KvError::InvalidConfig("growth_factor must be >= 2".into()));
        }
        if self.compaction_trigger_ratio <= 0.0 || self.compaction_trigger_ratio >= 1.0 {
            return Err(KvError::InvalidConfig("compaction_trigger_ratio must be in (0.0, 1.0)".into()));
        }
        if self.max_key_size == 0 || self.max_key_size > MAX_KEY_SIZE {
            return Err(KvError::InvalidConfig(format!("max_key_size must be in [1, {}]", MAX_KEY_SIZE)));
        }
        if self.max_value_size == 0 || self.max_value_size > MAX_VALUE_SIZE {
            return Err(KvError::InvalidConfig(format!("max_value_size must be in [1, {}]", MAX_VALUE_SIZE)));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self { Self::standard() }
}
