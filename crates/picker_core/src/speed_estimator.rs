use std::{
    collections::VecDeque,
    sync::atomic::{AtomicU64, Ordering},
    time::Instant,
};

use parking_lot::Mutex;

#[derive(Clone, Copy)]
struct ProgressSnapshot {
    progress_bytes: u64,
    instant: Instant,
}

/// Smoothed transfer rate over a sliding window of progress snapshots.
///
/// Feed it the cumulative byte counter once in a while (roughly once per second),
/// read the smoothed rate with [`SpeedEstimator::bps`].
pub struct SpeedEstimator {
    snapshots: Mutex<VecDeque<ProgressSnapshot>>,
    window: usize,
    bytes_per_second: AtomicU64,
}

impl SpeedEstimator {
    pub fn new(window: usize) -> Self {
        assert!(window > 1);
        Self {
            snapshots: Mutex::new(VecDeque::with_capacity(window)),
            window,
            bytes_per_second: Default::default(),
        }
    }

    pub fn bps(&self) -> u64 {
        self.bytes_per_second.load(Ordering::Relaxed)
    }

    /// Whether at least two snapshots were taken, i.e. the rate means something.
    pub fn is_sampled(&self) -> bool {
        self.snapshots.lock().len() > 1
    }

    pub fn add_snapshot(&self, progress_bytes: u64, instant: Instant) {
        let first = {
            let mut g = self.snapshots.lock();
            let current = ProgressSnapshot {
                progress_bytes,
                instant,
            };
            if g.len() == self.window {
                g.pop_front();
            }
            g.push_back(current);
            match g.front() {
                Some(first) if g.len() > 1 => *first,
                _ => return,
            }
        };

        let diff = progress_bytes.saturating_sub(first.progress_bytes);
        let elapsed = instant.saturating_duration_since(first.instant);
        if elapsed.is_zero() {
            return;
        }
        let bps = diff as f64 / elapsed.as_secs_f64();
        self.bytes_per_second.store(bps as u64, Ordering::Relaxed);
    }

    pub fn reset(&self) {
        self.snapshots.lock().clear();
        self.bytes_per_second.store(0, Ordering::Relaxed);
    }
}
