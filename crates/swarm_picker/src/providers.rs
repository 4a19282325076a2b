use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Instant,
};

use parking_lot::RwLock;
use tracing::warn;

use crate::type_aliases::Score;

/// Supplies per-piece deadlines for streaming playback.
pub trait RealTimeProvider: Send + Sync {
    /// A full-length array, `None` where the piece has no deadline.
    fn piece_deadlines(&self, total_pieces: u32) -> Vec<Option<Instant>>;
}

/// Supplies per-piece additions to the piece score.
pub trait PriorityProvider: Send + Sync {
    /// A full-length array of deltas, 0 for "no opinion".
    fn piece_priority_deltas(&self, total_pieces: u32) -> Vec<Score>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProviderId(u64);

/// What all registered providers say about the pieces, combined.
#[derive(Debug, Default, Clone)]
pub struct ProviderInputs {
    /// Earliest deadline per piece across real-time providers. Empty if there are none.
    pub deadlines: Vec<Option<Instant>>,
    /// Summed delta per piece across priority providers. Empty if there are none.
    pub deltas: Vec<Score>,
}

impl ProviderInputs {
    pub fn deadline(&self, piece: usize) -> Option<Instant> {
        self.deadlines.get(piece).copied().flatten()
    }

    pub fn delta(&self, piece: usize) -> Score {
        self.deltas.get(piece).copied().unwrap_or(0)
    }
}

#[derive(Default)]
struct Registered {
    realtime: Vec<(ProviderId, Arc<dyn RealTimeProvider>)>,
    priority: Vec<(ProviderId, Arc<dyn PriorityProvider>)>,
}

/// Register/unregister pluggable providers. Every change bumps [`Self::version`].
#[derive(Default)]
pub struct ProviderRegistry {
    inner: RwLock<Registered>,
    next_id: AtomicU64,
    version: AtomicU64,
}

impl ProviderRegistry {
    fn next_id(&self) -> ProviderId {
        ProviderId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn bump(&self) {
        self.version.fetch_add(1, Ordering::Release);
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    pub fn register_real_time(&self, p: Arc<dyn RealTimeProvider>) -> ProviderId {
        let id = self.next_id();
        self.inner.write().realtime.push((id, p));
        self.bump();
        id
    }

    pub fn register_priority(&self, p: Arc<dyn PriorityProvider>) -> ProviderId {
        let id = self.next_id();
        self.inner.write().priority.push((id, p));
        self.bump();
        id
    }

    /// Returns false if nothing was registered under this id.
    pub fn unregister(&self, id: ProviderId) -> bool {
        let mut g = self.inner.write();
        let before = g.realtime.len() + g.priority.len();
        g.realtime.retain(|(i, _)| *i != id);
        g.priority.retain(|(i, _)| *i != id);
        let removed = g.realtime.len() + g.priority.len() != before;
        drop(g);
        if removed {
            self.bump();
        }
        removed
    }

    pub fn has_real_time(&self) -> bool {
        !self.inner.read().realtime.is_empty()
    }

    /// Ask every provider for its current view and combine: minimum deadline,
    /// summed delta. Arrays of the wrong length are ignored.
    pub fn collect(&self, total_pieces: u32) -> ProviderInputs {
        // Clone the handles out so providers run without our lock held.
        let (rt, prio) = {
            let g = self.inner.read();
            (
                g.realtime.iter().map(|(_, p)| p.clone()).collect::<Vec<_>>(),
                g.priority.iter().map(|(_, p)| p.clone()).collect::<Vec<_>>(),
            )
        };
        let total = total_pieces as usize;
        let mut out = ProviderInputs::default();

        for p in rt {
            let d = p.piece_deadlines(total_pieces);
            if d.len() != total {
                warn!(got = d.len(), expected = total, "ignoring real-time provider output");
                continue;
            }
            if out.deadlines.is_empty() {
                out.deadlines = d;
                continue;
            }
            for (acc, new) in out.deadlines.iter_mut().zip(d) {
                *acc = match (*acc, new) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (a, b) => a.or(b),
                };
            }
        }

        for p in prio {
            let d = p.piece_priority_deltas(total_pieces);
            if d.len() != total {
                warn!(got = d.len(), expected = total, "ignoring priority provider output");
                continue;
            }
            if out.deltas.is_empty() {
                out.deltas = d;
                continue;
            }
            for (acc, new) in out.deltas.iter_mut().zip(d) {
                *acc = acc.saturating_add(new);
            }
        }
        out
    }
}
