//! Pessimistic key locks.
//!
//! Committers lock every written (and for-update) key before validation.
//! Callers must present keys in canonical order (sorted raw bytes); with a
//! total acquisition order there is no cycle to detect, so there is no
//! deadlock machinery. A waiter that exceeds the configured bound fails with
//! `Timeout` and releases everything it took.

use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use themis_core::{Result, ThemisError};

/// Table of exclusive key locks, keyed by owner transaction id.
pub struct LockTable {
    held: Mutex<HashMap<Vec<u8>, u64>>,
    released: Condvar,
}

impl Default for LockTable {
    fn default() -> Self {
        Self::new()
    }
}

impl LockTable {
    /// Empty table.
    pub fn new() -> Self {
        LockTable {
            held: Mutex::new(HashMap::new()),
            released: Condvar::new(),
        }
    }

    /// Acquire every key for `owner`, in the order given.
    ///
    /// Keys must be sorted ascending and deduplicated; this is the canonical
    /// order that makes the acquisition deadlock-free. Re-acquiring a key the
    /// owner already holds is a no-op, so retried commits are safe.
    ///
    /// On timeout, all keys taken by this call are released before the error
    /// returns.
    pub fn acquire_all(&self, owner: u64, keys: &[Vec<u8>], timeout: Duration) -> Result<()> {
        debug_assert!(keys.windows(2).all(|w| w[0] < w[1]), "keys not canonical");
        let deadline = Instant::now() + timeout;
        let mut held = self.held.lock();
        let mut taken: Vec<&Vec<u8>> = Vec::with_capacity(keys.len());
        for key in keys {
            loop {
                match held.get(key) {
                    None => {
                        held.insert(key.clone(), owner);
                        taken.push(key);
                        break;
                    }
                    Some(&holder) if holder == owner => break,
                    Some(_) => {
                        let now = Instant::now();
                        if now >= deadline {
                            for k in taken {
                                held.remove(k);
                            }
                            self.released.notify_all();
                            return Err(ThemisError::timeout(
                                String::from_utf8_lossy(key),
                                timeout.as_millis() as u64,
                            ));
                        }
                        let wait = self.released.wait_until(&mut held, deadline);
                        if wait.timed_out() && held.contains_key(key) {
                            for k in taken {
                                held.remove(k);
                            }
                            self.released.notify_all();
                            return Err(ThemisError::timeout(
                                String::from_utf8_lossy(key),
                                timeout.as_millis() as u64,
                            ));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Release every key held by `owner` among `keys`.
    pub fn release_all(&self, owner: u64, keys: &[Vec<u8>]) {
        let mut held = self.held.lock();
        for key in keys {
            if held.get(key) == Some(&owner) {
                held.remove(key);
            }
        }
        drop(held);
        self.released.notify_all();
    }

    /// Number of keys currently locked. Test hook.
    pub fn held_count(&self) -> usize {
        self.held.lock().len()
    }
}
