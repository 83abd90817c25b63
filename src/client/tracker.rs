//! Read-rate tracker deciding when a key is hot enough to lease.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use tokio::time::{Duration, Instant};

/// Rolling window over which reads of a key are counted.
pub const QUERY_WINDOW_SECS: u64 = 10;

/// Reads within the window at which the next read requests a lease.
pub const QUERY_THRESHOLD: usize = 3;

/// Per-key sliding windows of recent read instants.
#[derive(Debug)]
pub(crate) struct QueryTracker {
    /// Window length.
    window: Duration,

    /// Read instants per key, oldest first, pruned to the window.
    reads: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl QueryTracker {
    /// Creates a tracker with the given window.
    pub(crate) fn new(window: Duration) -> Self {
        QueryTracker {
            window,
            reads: Mutex::new(HashMap::new()),
        }
    }

    /// Records a read of `key` happening now and returns how many reads
    /// (including this one) fall within the window.
    pub(crate) fn observe(&self, key: &str) -> usize {
        let now = Instant::now();
        let mut reads = self.reads.lock().unwrap();
        let stamps = reads.entry(key.to_owned()).or_default();
        while let Some(&oldest) = stamps.front() {
            if now.duration_since(oldest) >= self.window {
                stamps.pop_front();
            } else {
                break;
            }
        }
        stamps.push_back(now);
        stamps.len()
    }

    /// Drops keys whose every recorded read has aged out of the window,
    /// so abandoned keys do not pin tracker memory.
    pub(crate) fn sweep_stale(&self) {
        let now = Instant::now();
        self.reads.lock().unwrap().retain(|_, stamps| {
            stamps
                .back()
                .is_some_and(|&newest| now.duration_since(newest) < self.window)
        });
    }

    /// Number of keys with recorded reads.
    #[cfg(test)]
    fn tracked_keys(&self) -> usize {
        self.reads.lock().unwrap().len()
    }
}
