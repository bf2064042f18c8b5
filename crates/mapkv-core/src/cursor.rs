//! Releasable cursor over a snapshot of keys.
//!
//! The cursor owns its key list; walking it needs no store lock. Reaching the
//! end or asking for early reclamation frees the list, and every later call
//! reports the end of the sequence.

/// One-pass cursor over the keys present when it was created.
#[derive(Debug, Default)]
pub struct KeyCursor {
    keys: Vec<String>,
    position: usize,
    released: bool,
}

impl KeyCursor {
    pub fn new(keys: Vec<String>) -> Self {
        Self { keys, position: 0, released: false }
    }

    /// Next key, or `None` at the end.
    ///
    /// `reclaim_now` releases the cursor immediately and returns `None`.
    pub fn next_key(&mut self, reclaim_now: bool) -> Option<String> {
        if self.released {
            return None;
        }
        if reclaim_now || self.position >= self.keys.len() {
            self.release();
            return None;
        }
        let key = std::mem::take(&mut self.keys[self.position]);
        self.position += 1;
        Some(key)
    }

    /// Free the key list; the cursor then reports end of sequence forever.
    pub fn release(&mut self) {
        self.keys = Vec::new();
        self.position = 0;
        self.released = true;
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    pub fn remaining(&self) -> usize {
        self.keys.len() - self.position
    }
}

impl Iterator for KeyCursor {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        self.next_key(false)
    }
}
