//! Deadline-aware allocation for pieces a real-time provider asked for.
//!
//! Peers are walked in ascending order of the time until their next block would
//! arrive. For a block nobody requested yet, the first peer able to deliver before the
//! deadline gets it; if nobody can, the fastest uploader gets it anyway. A block that
//! is already racing only gets another request when every racer is late and the
//! candidate would be strictly earlier than the best of them.

use std::time::{Duration, Instant};

use crate::{active_piece::RealTimeRequest, type_aliases::PeerHandle};

/// A peer as the allocator sees it during one pass.
#[derive(Debug, Clone, Copy)]
pub struct RealTimePeer {
    pub handle: PeerHandle,
    pub receive_rate: u64,
    /// Requests outstanding, including the ones issued earlier in this pass.
    pub outstanding: u32,
    /// Pass-scoped random tie breaker.
    pub tie: u64,
    /// Caller's index for this peer.
    pub slot: usize,
}

impl RealTimePeer {
    /// How long until a block requested now would be fully received.
    pub fn time_to_next_block(&self, block_len: u32) -> Option<Duration> {
        if self.receive_rate == 0 {
            return None;
        }
        let bytes = (self.outstanding as u64 + 1) * block_len as u64;
        Some(Duration::from_secs_f64(bytes as f64 / self.receive_rate as f64))
    }

    pub fn eta(&self, now: Instant, block_len: u32) -> Option<Instant> {
        self.time_to_next_block(block_len).map(|d| now + d)
    }
}

/// Sort in place: soonest next block first, unmeasurable peers last.
pub fn order_peers(peers: &mut [RealTimePeer], block_len: u32) {
    peers.sort_by_cached_key(|p| {
        let ttnb = p.time_to_next_block(block_len);
        (ttnb.is_none(), ttnb.unwrap_or_default(), p.tie)
    });
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RealTimeChoice {
    /// Request from this peer (an index into the ordered slice).
    Request { peer: usize, eta: Option<Instant> },
    /// Nobody could make the deadline, request from the best uploader anyway.
    Forced { peer: usize, eta: Option<Instant> },
}

impl RealTimeChoice {
    pub fn peer(&self) -> usize {
        match self {
            RealTimeChoice::Request { peer, .. } | RealTimeChoice::Forced { peer, .. } => *peer,
        }
    }

    pub fn eta(&self) -> Option<Instant> {
        match self {
            RealTimeChoice::Request { eta, .. } | RealTimeChoice::Forced { eta, .. } => *eta,
        }
    }
}

/// Pick a peer for one block of a real-time piece.
///
/// `peers` must be ordered with [`order_peers`]. `eligible` filters out peers that
/// don't have the piece or have no budget left.
pub fn choose_for_block(
    peers: &[RealTimePeer],
    racers: &[RealTimeRequest],
    deadline: Instant,
    now: Instant,
    block_len: u32,
    mut eligible: impl FnMut(usize) -> bool,
) -> Option<RealTimeChoice> {
    if racers.is_empty() {
        let mut best_uploader: Option<usize> = None;
        for (i, p) in peers.iter().enumerate() {
            if !eligible(i) {
                continue;
            }
            let eta = p.eta(now, block_len);
            if matches!(eta, Some(eta) if eta <= deadline) {
                return Some(RealTimeChoice::Request { peer: i, eta });
            }
            if best_uploader.is_none_or(|b| peers[b].receive_rate < p.receive_rate) {
                best_uploader = Some(i);
            }
        }
        return best_uploader.map(|i| RealTimeChoice::Forced {
            peer: i,
            eta: peers[i].eta(now, block_len),
        });
    }

    let best = racers.iter().filter_map(|r| r.eta).min();
    if matches!(best, Some(b) if b <= deadline) {
        return None;
    }
    for (i, p) in peers.iter().enumerate() {
        if racers.iter().any(|r| r.peer == p.handle) || !eligible(i) {
            continue;
        }
        let Some(eta) = p.eta(now, block_len) else {
            continue;
        };
        if best.is_none_or(|b| eta < b) {
            return Some(RealTimeChoice::Request {
                peer: i,
                eta: Some(eta),
            });
        }
    }
    None
}
