//! Lazy per-record expiration
//!
//! Records carry an optional absolute expiration time. Nothing sweeps them in
//! the background: reads, counts, key listings, and compaction filter expired
//! records at access time, and only compaction reclaims their bytes.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current time in unix seconds.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Whether a record stamped with `expire_at` is gone at `now`.
///
/// `now` is truncated to whole seconds, so a record lives through the whole
/// second named by its stamp and never for less than its duration.
pub fn is_expired(expire_at: Option<u64>, now: u64) -> bool {
    matches!(expire_at, Some(at) if at < now)
}

/// Auto-expiration setting of one handle.
///
/// Disabling stops stamping new writes; records already stamped keep their
/// expiration time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExpirePolicy {
    #[default]
    Disabled,
    /// Enabled; `0` stamps nothing (never expire)
    After(u32),
}

impl ExpirePolicy {
    pub fn enable(&mut self, seconds: u32) {
        *self = ExpirePolicy::After(seconds);
    }

    pub fn disable(&mut self) {
        *self = ExpirePolicy::Disabled;
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self, ExpirePolicy::After(_))
    }

    /// Expiration time for a record written at `now` under this policy.
    pub fn stamp(&self, now: u64) -> Option<u64> {
        match *self {
            ExpirePolicy::After(seconds) => stamp_after(seconds, now),
            ExpirePolicy::Disabled => None,
        }
    }
}

/// Expiration time `seconds` after `now`; `0` means never.
pub fn stamp_after(seconds: u32, now: u64) -> Option<u64> {
    if seconds == 0 {
        None
    } else {
        Some(now.saturating_add(seconds as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_policy_stamps_nothing() {
        let policy = ExpirePolicy::default();
        assert!(!policy.is_enabled());
        assert_eq!(policy.stamp(1000), None);
    }

    #[test]
    fn test_enabled_policy_stamps_duration() {
        let mut policy = ExpirePolicy::default();
        policy.enable(30);
        assert_eq!(policy.stamp(1000), Some(1030));

        policy.enable(0);
        assert!(policy.is_enabled());
        assert_eq!(policy.stamp(1000), None);

        policy.disable();
        assert_eq!(policy.stamp(1000), None);
    }

    #[test]
    fn test_expiry_boundary() {
        assert!(!is_expired(None, u64::MAX));
        assert!(!is_expired(Some(1001), 1000));
        assert!(!is_expired(Some(1000), 1000));
        assert!(is_expired(Some(999), 1000));
    }

    #[test]
    fn test_one_second_duration_survives_second_boundary() {
        // Written at 100.99 (truncated to 100), read at 101.00
        let stamped = stamp_after(1, 100);
        assert!(!is_expired(stamped, 101));
        assert!(is_expired(stamped, 102));
    }

    #[test]
    fn test_stamp_saturates() {
        assert_eq!(stamp_after(10, u64::MAX - 1), Some(u64::MAX));
    }
}
