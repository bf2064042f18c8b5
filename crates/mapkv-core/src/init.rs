//! Process-wide one-time initialization.
//!
//! `ensure_initialized()` runs global setup exactly once. The first caller
//! moves the token Uninitialized -> Initializing, runs setup, and publishes
//! Initialized; concurrent callers wait until setup is published.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

const UNINITIALIZED: u8 = 0;
const INITIALIZING: u8 = 1;
const INITIALIZED: u8 = 2;

/// Page size used when the platform cannot report one.
const FALLBACK_PAGE_SIZE: u64 = 4096;

/// One-time initialization token. Transitions are irreversible.
pub struct OnceToken {
    state: AtomicU8,
}

impl OnceToken {
    pub const fn new() -> Self {
        Self { state: AtomicU8::new(UNINITIALIZED) }
    }

    /// Run `setup` if no other caller has; otherwise wait for it to finish.
    pub fn call_once(&self, setup: impl FnOnce()) {
        match self.state.compare_exchange(
            UNINITIALIZED,
            INITIALIZING,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                let reset = ResetOnUnwind { state: &self.state };
                setup();
                std::mem::forget(reset);
                self.state.store(INITIALIZED, Ordering::Release);
            }
            Err(_) => loop {
                match self.state.load(Ordering::Acquire) {
                    INITIALIZED => return,
                    // The running setup panicked; take over
                    UNINITIALIZED => return self.call_once(setup),
                    _ => std::thread::yield_now(),
                }
            },
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.state.load(Ordering::Acquire) == INITIALIZED
    }
}

/// Puts the token back to Uninitialized if setup panics.
struct ResetOnUnwind<'a> {
    state: &'a AtomicU8,
}

impl Drop for ResetOnUnwind<'_> {
    fn drop(&mut self) {
        self.state.store(UNINITIALIZED, Ordering::Release);
    }
}

impl Default for OnceToken {
    fn default() -> Self { Self::new() }
}

static GLOBAL_INIT: OnceToken = OnceToken::new();
static PAGE_SIZE: AtomicU64 = AtomicU64::new(0);

/// Perform global library setup. Safe to call from any thread, any number of times.
pub fn ensure_initialized() {
    GLOBAL_INIT.call_once(|| {
        let size = system_page_size();
        PAGE_SIZE.store(size, Ordering::Release);
        tracing::debug!(page_size = size, "mapkv initialized");
    });
}

/// System page size; containers are always a multiple of it.
pub fn page_size() -> u64 {
    ensure_initialized();
    PAGE_SIZE.load(Ordering::Acquire)
}

fn system_page_size() -> u64 {
    #[cfg(unix)]
    {
        // SAFETY: sysconf has no preconditions and only reads system configuration.
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 {
            return size as u64;
        }
    }
    FALLBACK_PAGE_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn test_page_size_is_power_of_two() {
        let size = page_size();
        assert!(size >= 512);
        assert!(size.is_power_of_two());
        assert!(GLOBAL_INIT.is_initialized());
    }

    #[test]
    fn test_setup_runs_once_across_threads() {
        let token = Arc::new(OnceToken::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let token = Arc::clone(&token);
                let runs = Arc::clone(&runs);
                std::thread::spawn(move || {
                    token.call_once(|| {
                        std::thread::sleep(std::time::Duration::from_millis(20));
                        runs.fetch_add(1, Ordering::SeqCst);
                    });
                    // Every caller returns only after setup is published
                    assert!(token.is_initialized());
                })
            })
            .collect();
        for h in handles { h.join().unwrap(); }

        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_later_calls_are_noops() {
        let token = OnceToken::new();
        let mut count = 0;
        token.call_once(|| count += 1);
        token.call_once(|| count += 1);
        assert_eq!(count, 1);
    }

    #[test]
    fn test_panicking_setup_can_be_retried() {
        let token = OnceToken::new();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            token.call_once(|| panic!("setup failed"));
        }));
        assert!(result.is_err());
        assert!(!token.is_initialized());

        let mut ran = false;
        token.call_once(|| ran = true);
        assert!(ran);
        assert!(token.is_initialized());
    }
}
