//! Client-side cache store: string and list entries held under lease, with
//! expiry on access, revocation, and in-flight-grant poisoning.
//!
//! Poisoning closes a wire race: a revocation can reach the client after
//! the server granted a lease but before the granting reply itself arrives.
//! An entry must never be installed from a reply whose key was revoked
//! while the request was in flight.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::time::{Duration, Instant};

/// One cached entry with its expiry instant.
#[derive(Debug, Clone)]
struct CacheSlot<T> {
    value: T,
    expires_at: Instant,
}

impl<T> CacheSlot<T> {
    fn live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Bookkeeping for lease-requesting reads currently in flight on a key.
#[derive(Debug, Default)]
struct InflightLease {
    /// Number of outstanding lease-requesting reads.
    waiting: usize,

    /// Set when a revocation arrived while reads were outstanding; their
    /// replies must not be installed.
    poisoned: bool,
}

/// Process-wide cache shared by application readers, the revocation
/// endpoint, and the background sweeper. All sections are short;
/// lock order is always inflight before the entry maps.
#[derive(Debug, Default)]
pub(crate) struct CacheStore {
    /// String-valued entries.
    strings: Mutex<HashMap<String, CacheSlot<String>>>,

    /// List-valued entries.
    lists: Mutex<HashMap<String, CacheSlot<Vec<String>>>>,

    /// In-flight lease-requesting reads per key.
    inflight: Mutex<HashMap<String, InflightLease>>,
}

impl CacheStore {
    /// Creates an empty cache.
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Returns the live cached string for `key`, discarding it if expired.
    pub(crate) fn get_str(&self, key: &str) -> Option<String> {
        let mut strings = self.strings.lock().unwrap();
        match strings.get(key) {
            Some(slot) if slot.live(Instant::now()) => {
                Some(slot.value.clone())
            }
            Some(_) => {
                strings.remove(key);
                None
            }
            None => None,
        }
    }

    /// Returns the live cached list for `key`, discarding it if expired.
    pub(crate) fn get_list(&self, key: &str) -> Option<Vec<String>> {
        let mut lists = self.lists.lock().unwrap();
        match lists.get(key) {
            Some(slot) if slot.live(Instant::now()) => {
                Some(slot.value.clone())
            }
            Some(_) => {
                lists.remove(key);
                None
            }
            None => None,
        }
    }

    /// Marks a lease-requesting read on `key` as in flight. Must be paired
    /// with exactly one `install_*` or `abandon_lease_request`.
    pub(crate) fn note_lease_request(&self, key: &str) {
        self.inflight
            .lock()
            .unwrap()
            .entry(key.to_owned())
            .or_default()
            .waiting += 1;
    }

    /// Concludes an in-flight read without installing (no grant, error
    /// reply, or transport failure).
    pub(crate) fn abandon_lease_request(&self, key: &str) {
        let mut inflight = self.inflight.lock().unwrap();
        self.conclude(&mut inflight, key);
    }

    /// Installs a granted string entry unless the key was revoked while
    /// the read was in flight. Returns whether the entry was installed.
    pub(crate) fn install_str(
        &self,
        key: &str,
        value: String,
        valid: Duration,
    ) -> bool {
        let mut inflight = self.inflight.lock().unwrap();
        if self.conclude(&mut inflight, key) {
            return false;
        }
        // inflight stays locked through the insert so a racing revocation
        // cannot slip between the poison check and the entry landing
        self.strings.lock().unwrap().insert(
            key.to_owned(),
            CacheSlot {
                value,
                expires_at: Instant::now() + valid,
            },
        );
        true
    }

    /// Installs a granted list entry unless the key was revoked while the
    /// read was in flight. Returns whether the entry was installed.
    pub(crate) fn install_list(
        &self,
        key: &str,
        items: Vec<String>,
        valid: Duration,
    ) -> bool {
        let mut inflight = self.inflight.lock().unwrap();
        if self.conclude(&mut inflight, key) {
            return false;
        }
        self.lists.lock().unwrap().insert(
            key.to_owned(),
            CacheSlot {
                value: items,
                expires_at: Instant::now() + valid,
            },
        );
        true
    }

    /// Drops `key` from both entry maps and poisons any in-flight reads.
    /// Returns whether a cached entry was actually removed (the callback
    /// reply status distinguishes the two cases).
    pub(crate) fn revoke(&self, key: &str) -> bool {
        let mut inflight = self.inflight.lock().unwrap();
        if let Some(pending) = inflight.get_mut(key) {
            if pending.waiting > 0 {
                pending.poisoned = true;
            }
        }
        let removed_str = self.strings.lock().unwrap().remove(key).is_some();
        let removed_list = self.lists.lock().unwrap().remove(key).is_some();
        removed_str || removed_list
    }

    /// Removes every expired entry from both maps. Run periodically so
    /// abandoned keys do not pin memory until their next access.
    pub(crate) fn sweep_expired(&self) {
        let now = Instant::now();
        self.strings
            .lock()
            .unwrap()
            .retain(|_, slot| slot.live(now));
        self.lists.lock().unwrap().retain(|_, slot| slot.live(now));
    }

    /// Decrements `key`'s in-flight count, returning whether this read was
    /// poisoned. The poison mark clears once the last read concludes.
    fn conclude(
        &self,
        inflight: &mut HashMap<String, InflightLease>,
        key: &str,
    ) -> bool {
        match inflight.get_mut(key) {
            Some(pending) => {
                let poisoned = pending.poisoned;
                pending.waiting = pending.waiting.saturating_sub(1);
                if pending.waiting == 0 {
                    inflight.remove(key);
                }
                poisoned
            }
            None => false,
        }
    }

    /// Number of resident string entries, live or not.
    #[cfg(test)]
    pub(crate) fn resident_strs(&self) -> usize {
        self.strings.lock().unwrap().len()
    }

    /// Number of resident list entries, live or not.
    #[cfg(test)]
    pub(crate) fn resident_lists(&self) -> usize {
        self.lists.lock().unwrap().len()
    }
}
