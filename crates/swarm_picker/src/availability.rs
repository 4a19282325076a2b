//! Per-piece replica counts across connected peers.
//!
//! Have/connect/disconnect events mutate a shadow array under the availability lock.
//! The scheduler publishes the shadow at most once per refresh interval, and replaces
//! it with a full recount when decrements drifted or the rebuild interval elapsed.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::{Mutex, MutexGuard};
use picker_core::{Lengths, ValidPieceIndex};
use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::{config::SchedulerConfig, haves::PeerHaves};

/// The incrementally maintained counts. Only reachable through [`AvailabilityTracker::lock`].
pub struct AvailabilityShadow {
    counts: Vec<u32>,
    drift: u64,
}

impl AvailabilityShadow {
    pub fn add_piece(&mut self, piece: ValidPieceIndex) {
        if let Some(c) = self.counts.get_mut(piece.as_usize()) {
            *c += 1;
        }
    }

    pub fn remove_piece(&mut self, piece: ValidPieceIndex) {
        self.decrement(piece.as_usize());
    }

    pub fn add_haves(&mut self, haves: &PeerHaves) {
        for idx in haves.iter() {
            if let Some(c) = self.counts.get_mut(idx as usize) {
                *c += 1;
            }
        }
    }

    pub fn remove_haves(&mut self, haves: &PeerHaves) {
        for idx in haves.iter() {
            self.decrement(idx as usize);
        }
    }

    fn decrement(&mut self, idx: usize) {
        match self.counts.get_mut(idx) {
            Some(c) if *c > 0 => *c -= 1,
            Some(_) => {
                trace!(piece = idx, "availability decrement below zero");
                self.drift += 1;
            }
            None => {}
        }
    }

    pub fn drift(&self) -> u64 {
        self.drift
    }
}

struct Published {
    counts: Arc<Vec<u32>>,
    last_refresh: Option<Instant>,
    last_rebuild: Option<Instant>,
    rebuilds: u64,
    drift_corrections: u64,
}

pub struct AvailabilityTracker {
    shadow: Mutex<AvailabilityShadow>,
    published: Mutex<Published>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshKind {
    Skipped,
    Published,
    Rebuilt,
}

impl AvailabilityTracker {
    pub fn new(total_pieces: u32) -> Self {
        let counts = vec![0; total_pieces as usize];
        Self {
            published: Mutex::new(Published {
                counts: Arc::new(counts.clone()),
                last_refresh: None,
                last_rebuild: None,
                rebuilds: 0,
                drift_corrections: 0,
            }),
            shadow: Mutex::new(AvailabilityShadow { counts, drift: 0 }),
        }
    }

    /// The availability lock. Peer registry updates that must agree with the counts
    /// happen while this is held.
    pub fn lock(&self) -> MutexGuard<'_, AvailabilityShadow> {
        self.shadow.lock()
    }

    /// The counts as of the last refresh.
    pub fn snapshot(&self) -> Arc<Vec<u32>> {
        self.published.lock().counts.clone()
    }

    pub fn get(&self, piece: ValidPieceIndex) -> u32 {
        self.published
            .lock()
            .counts
            .get(piece.as_usize())
            .copied()
            .unwrap_or(0)
    }

    /// Publish the shadow counts if due, or rebuild them from scratch.
    ///
    /// `recount` fills a zeroed array with the true counts (transferring peers'
    /// haves plus local done pieces). It runs with the availability lock held, but
    /// not the published counts, which are a leaf lock.
    pub fn refresh(
        &self,
        now: Instant,
        config: &SchedulerConfig,
        recount: impl FnOnce(&mut [u32]),
    ) -> RefreshKind {
        let mut shadow = self.shadow.lock();
        let (rebuild_due, refresh_due) = {
            let published = self.published.lock();
            let due = |last: Option<Instant>, every: Duration| {
                last.is_none_or(|t| now.saturating_duration_since(t) >= every)
            };
            (
                due(published.last_rebuild, config.availability_rebuild_interval),
                due(published.last_refresh, config.availability_refresh_interval),
            )
        };

        if shadow.drift > 0 || rebuild_due {
            let mut fresh = vec![0u32; shadow.counts.len()];
            recount(&mut fresh);
            let drifted = shadow.drift > 0;
            if drifted {
                warn!(drift = shadow.drift, "availability drifted, rebuilt from peers");
            } else if shadow.counts != fresh {
                debug!("periodic availability rebuild corrected counts");
            }
            shadow.counts = fresh;
            shadow.drift = 0;
            let mut published = self.published.lock();
            published.counts = Arc::new(shadow.counts.clone());
            published.last_rebuild = Some(now);
            published.last_refresh = Some(now);
            published.rebuilds += 1;
            if drifted {
                published.drift_corrections += 1;
            }
            return RefreshKind::Rebuilt;
        }

        if refresh_due {
            let mut published = self.published.lock();
            if published.counts.as_slice() != shadow.counts.as_slice() {
                published.counts = Arc::new(shadow.counts.clone());
            }
            published.last_refresh = Some(now);
            return RefreshKind::Published;
        }
        RefreshKind::Skipped
    }

    pub fn rebuilds(&self) -> u64 {
        self.published.lock().rebuilds
    }

    pub fn drift_corrections(&self) -> u64 {
        self.published.lock().drift_corrections
    }
}

/// Figures derived from the counts after each refresh.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct AvailabilitySummary {
    pub global_min: u32,
    pub global_max: u32,
    /// Rarest level among pieces still worth starting: downloadable, not fully in
    /// flight, and held by at least one peer. 0 if there is none.
    pub global_min_others: u32,
    /// `global_min` plus the fraction of pieces above it.
    pub global_avail: f64,
    pub bytes_unavailable: u64,
}

impl AvailabilitySummary {
    pub fn compute(
        counts: &[u32],
        lengths: &Lengths,
        mut startable: impl FnMut(usize) -> bool,
    ) -> Self {
        if counts.is_empty() {
            return Self::default();
        }
        let mut min = u32::MAX;
        let mut max = 0;
        let mut min_others: Option<u32> = None;
        let mut bytes_unavailable = 0u64;
        for (idx, &c) in counts.iter().enumerate() {
            min = min.min(c);
            max = max.max(c);
            if c == 0 {
                if let Some(p) = lengths.validate_piece_index(idx as u32) {
                    bytes_unavailable += lengths.piece_length(p) as u64;
                }
            } else if startable(idx) {
                min_others = Some(min_others.map_or(c, |m| m.min(c)));
            }
        }
        let above = counts.iter().filter(|c| **c > min).count();
        Self {
            global_min: min,
            global_max: max,
            global_min_others: min_others.unwrap_or(0),
            global_avail: min as f64 + above as f64 / counts.len() as f64,
            bytes_unavailable,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn idx(l: &Lengths, i: u32) -> ValidPieceIndex {
        l.validate_piece_index(i).unwrap()
    }

    #[test]
    fn test_publish_is_rate_limited() {
        let cfg = SchedulerConfig::default();
        let t = AvailabilityTracker::new(4);
        let now = Instant::now();
        assert_eq!(t.refresh(now, &cfg, |_| {}), RefreshKind::Rebuilt);

        t.lock().add_haves(&PeerHaves::from_indices(4, [0, 2]));
        assert_eq!(
            t.refresh(now + Duration::from_millis(10), &cfg, |_| {}),
            RefreshKind::Skipped
        );
        assert_eq!(t.snapshot().as_slice(), &[0, 0, 0, 0]);

        assert_eq!(
            t.refresh(now + Duration::from_secs(1), &cfg, |_| {}),
            RefreshKind::Published
        );
        assert_eq!(t.snapshot().as_slice(), &[1, 0, 1, 0]);
    }

    #[test]
    fn test_negative_decrement_becomes_drift() {
        let cfg = SchedulerConfig::default();
        let l = Lengths::new(4 * 16384, 16384, None).unwrap();
        let t = AvailabilityTracker::new(4);
        let now = Instant::now();
        t.refresh(now, &cfg, |_| {});

        {
            let mut g = t.lock();
            g.add_piece(idx(&l, 1));
            g.remove_piece(idx(&l, 1));
            g.remove_piece(idx(&l, 1));
            assert_eq!(g.drift(), 1);
        }
        assert!(t.snapshot().iter().all(|c| *c == 0));

        // Drift forces a rebuild on the very next refresh.
        let kind = t.refresh(now + Duration::from_millis(1), &cfg, |counts| {
            counts[3] = 2;
        });
        assert_eq!(kind, RefreshKind::Rebuilt);
        assert_eq!(t.snapshot().as_slice(), &[0, 0, 0, 2]);
        assert_eq!(t.drift_corrections(), 1);
        assert_eq!(t.lock().drift(), 0);
    }

    #[test]
    fn test_periodic_rebuild() {
        let cfg = SchedulerConfig::default();
        let t = AvailabilityTracker::new(2);
        let now = Instant::now();
        t.refresh(now, &cfg, |_| {});
        t.lock().add_haves(&PeerHaves::full(2));
        let later = now + cfg.availability_rebuild_interval;
        assert_eq!(
            t.refresh(later, &cfg, |c| c.fill(3)),
            RefreshKind::Rebuilt
        );
        assert_eq!(t.snapshot().as_slice(), &[3, 3]);
        assert_eq!(t.rebuilds(), 2);
    }

    #[test]
    fn test_counters_readable_during_recount() {
        let cfg = SchedulerConfig::default();
        let t = AvailabilityTracker::new(3);
        let kind = t.refresh(Instant::now(), &cfg, |counts| {
            // Would deadlock if the published counts were held here.
            assert_eq!(t.rebuilds(), 0);
            assert_eq!(t.snapshot().as_slice(), &[0, 0, 0]);
            counts[1] = 1;
        });
        assert_eq!(kind, RefreshKind::Rebuilt);
        assert_eq!(t.rebuilds(), 1);
        assert_eq!(t.get(idx(&Lengths::new(3 * 16384, 16384, None).unwrap(), 1)), 1);
    }

    #[test]
    fn test_summary() {
        let l = Lengths::new(4 * 16384 + 100, 16384, None).unwrap();
        let counts = [0, 3, 1, 2, 0];
        let s = AvailabilitySummary::compute(&counts, &l, |i| i != 2);
        assert_eq!(s.global_min, 0);
        assert_eq!(s.global_max, 3);
        assert_eq!(s.global_min_others, 2);
        assert_eq!(s.bytes_unavailable, 16384 + 100);
        assert!((s.global_avail - 0.6).abs() < 1e-9);
    }
}
