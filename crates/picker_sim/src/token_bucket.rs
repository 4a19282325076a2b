use std::sync::atomic::{AtomicU64, Ordering};

use swarm_picker::TokenDispenser;

/// A bucket of bytes the simulation tops up once per tick.
#[derive(Debug, Default)]
pub struct TokenBucket {
    available: AtomicU64,
}

impl TokenBucket {
    pub fn new(initial: u64) -> Self {
        Self {
            available: AtomicU64::new(initial),
        }
    }

    /// Reset the balance to one tick's worth of the limit. Unspent bytes don't carry over.
    pub fn set(&self, bytes: u64) {
        self.available.store(bytes, Ordering::Relaxed);
    }
}

impl TokenDispenser for TokenBucket {
    fn peek(&self) -> u64 {
        self.available.load(Ordering::Relaxed)
    }

    fn dispense(&self, wanted: u64) -> u64 {
        let mut granted = 0;
        let _ = self
            .available
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |cur| {
                granted = cur.min(wanted);
                Some(cur - granted)
            });
        granted
    }

    fn return_unused(&self, bytes: u64) {
        self.available.fetch_add(bytes, Ordering::Relaxed);
    }
}
