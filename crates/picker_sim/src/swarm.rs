use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use rand::{Rng, rngs::SmallRng};
use swarm_picker::{
    BlockInfo, BlockMarkingResult, Clock, Lengths, PeerConnection, PeerHandle, PeerHaves,
    PeerSnapshot, PeerState, RealTimeProvider, RequestError, RequestHandle, Scheduler,
    SpeedEstimator,
};
use tracing::{debug, trace};

/// Requests a simulated peer queues before it starts refusing more.
const MAX_QUEUED: usize = 250;
const SNUB_AFTER: Duration = Duration::from_secs(30);
const DROP_AFTER: Duration = Duration::from_secs(60);
const UNCHOKE_WINDOW: Duration = Duration::from_secs(10);

struct SimPeerState {
    state: PeerState,
    choked: bool,
    unchoked_at: Option<Instant>,
    queue: VecDeque<BlockInfo>,
    last_delivery: Option<Instant>,
}

/// A remote peer uploading to us at a fixed rate.
pub struct SimPeer {
    pub handle: PeerHandle,
    clock: Arc<dyn Clock>,
    upload_bps: u64,
    lan_local: bool,
    received: AtomicU64,
    speed: SpeedEstimator,
    next_handle: AtomicU64,
    inner: Mutex<SimPeerState>,
}

impl SimPeer {
    pub fn new(
        handle: PeerHandle,
        clock: Arc<dyn Clock>,
        upload_bps: u64,
        lan_local: bool,
        choked: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            handle,
            clock,
            upload_bps,
            lan_local,
            received: AtomicU64::new(0),
            speed: SpeedEstimator::new(5),
            next_handle: AtomicU64::new(0),
            inner: Mutex::new(SimPeerState {
                state: PeerState::Connecting,
                choked,
                unchoked_at: None,
                queue: VecDeque::new(),
                last_delivery: None,
            }),
        })
    }

    pub fn state(&self) -> PeerState {
        self.inner.lock().state
    }

    pub fn set_state(&self, state: PeerState) {
        self.inner.lock().state = state;
    }

    pub fn unchoke(&self, now: Instant) {
        let mut g = self.inner.lock();
        if g.choked {
            g.choked = false;
            g.unchoked_at = Some(now);
        }
    }

    pub fn received_bytes(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    /// How long the peer sat on outstanding requests without delivering anything.
    pub fn stalled_for(&self, now: Instant) -> Option<Duration> {
        let g = self.inner.lock();
        if g.queue.is_empty() {
            return None;
        }
        g.last_delivery
            .or(g.unchoked_at)
            .map(|t| now.saturating_duration_since(t))
    }

    pub fn should_drop(&self, now: Instant) -> bool {
        self.stalled_for(now).is_some_and(|d| d >= DROP_AFTER)
    }

    /// Pop whatever the peer manages to upload in `elapsed`.
    fn upload(&self, elapsed: Duration, now: Instant) -> Vec<BlockInfo> {
        let mut budget = (self.upload_bps as f64 * elapsed.as_secs_f64()) as u64;
        let mut out = Vec::new();
        let mut g = self.inner.lock();
        if g.choked || g.state != PeerState::Transferring {
            return out;
        }
        while let Some(b) = g.queue.front().copied() {
            if b.size as u64 > budget {
                break;
            }
            budget -= b.size as u64;
            g.queue.pop_front();
            out.push(b);
        }
        if !out.is_empty() {
            g.last_delivery = Some(now);
        }
        out
    }

    pub fn reset(&self) {
        let mut g = self.inner.lock();
        g.queue.clear();
        g.last_delivery = None;
        self.speed.reset();
    }
}

impl PeerConnection for SimPeer {
    fn snapshot(&self) -> PeerSnapshot {
        let now = self.clock.now();
        let snubbed = self.stalled_for(now).is_some_and(|d| d >= SNUB_AFTER);
        let g = self.inner.lock();
        PeerSnapshot {
            state: g.state,
            receive_rate: self.speed.bps(),
            rate_sampled: self.speed.is_sampled(),
            snubbed,
            lan_local: self.lan_local,
            choked: g.choked,
            recently_unchoked: g
                .unchoked_at
                .is_some_and(|t| now.saturating_duration_since(t) < UNCHOKE_WINDOW),
            ..Default::default()
        }
    }

    fn request(&self, block: &BlockInfo, _realtime: bool) -> Result<RequestHandle, RequestError> {
        let mut g = self.inner.lock();
        if g.state != PeerState::Transferring {
            return Err(RequestError::Closed);
        }
        if g.choked {
            return Err(RequestError::Choked);
        }
        if g.queue.len() >= MAX_QUEUED {
            return Err(RequestError::QueueFull);
        }
        g.queue.push_back(*block);
        Ok(RequestHandle(self.next_handle.fetch_add(1, Ordering::Relaxed)))
    }

    fn cancel(&self, block: &BlockInfo) {
        let mut g = self.inner.lock();
        g.queue
            .retain(|b| !(b.piece_index == block.piece_index && b.block_index == block.block_index));
    }
}

/// Deadlines for a player reading the file front to back at a fixed bitrate.
pub struct Playback {
    pub clock: Arc<dyn Clock>,
    pub started: Instant,
    pub lengths: Lengths,
    pub bytes_per_second: u64,
    pub lookahead: u32,
}

impl RealTimeProvider for Playback {
    fn piece_deadlines(&self, total_pieces: u32) -> Vec<Option<Instant>> {
        let mut out = vec![None; total_pieces as usize];
        let rate = self.bytes_per_second.max(1) as f64;
        let elapsed = self.clock.now().saturating_duration_since(self.started);
        let position = (elapsed.as_secs_f64() * rate) as u64;
        let Some(current) = self.lengths.piece_at_offset(position) else {
            return out;
        };
        let end = (current.get() + self.lookahead).min(total_pieces);
        for idx in current.get()..end {
            let Some(piece) = self.lengths.validate_piece_index(idx) else {
                continue;
            };
            let at = self.lengths.piece_offset(piece) as f64 / rate;
            out[idx as usize] = Some(self.started + Duration::from_secs_f64(at));
        }
        out
    }
}

/// Every simulated peer plus the bookkeeping to run them tick by tick.
pub struct Swarm {
    pub peers: Vec<(Arc<SimPeer>, PeerHaves)>,
    pub connect_at: Vec<u64>,
    pub corrupt_ratio: f64,
    pub have_ratio: f64,
    pub pieces_failed: u64,
}

impl Swarm {
    /// Advance the swarm by one tick: connect, deliver, gossip new pieces, drop stalled peers.
    pub fn step(
        &mut self,
        tick: u64,
        elapsed: Duration,
        now: Instant,
        scheduler: &Scheduler,
        rng: &mut SmallRng,
    ) -> anyhow::Result<()> {
        let total = scheduler.lengths().total_pieces();
        for (i, (peer, haves)) in self.peers.iter_mut().enumerate() {
            match peer.state() {
                PeerState::Connecting if tick >= self.connect_at[i] => {
                    peer.set_state(PeerState::Handshaking);
                    scheduler.add_peer(peer.handle, peer.clone(), Some(haves.clone()))?;
                    debug!(peer = %peer.handle, "connected");
                }
                PeerState::Handshaking => peer.set_state(PeerState::Transferring),
                PeerState::Transferring => {
                    if rng.random_bool(0.1) {
                        peer.unchoke(now);
                    }
                    if peer.should_drop(now) {
                        debug!(peer = %peer.handle, "dropping stalled peer");
                        peer.set_state(PeerState::Disconnected);
                        peer.reset();
                        scheduler.remove_peer(peer.handle)?;
                        continue;
                    }
                    if !haves.is_seed() && rng.random_bool(self.have_ratio) {
                        let piece = rng.random_range(0..total);
                        if let Some(p) = scheduler.lengths().validate_piece_index(piece) {
                            if haves.set(p) {
                                scheduler.on_have(peer.handle, piece)?;
                            }
                        }
                    }
                }
                PeerState::Disconnected => {
                    // Reconnect later with whatever it had.
                    self.connect_at[i] = tick + rng.random_range(5..20);
                    peer.set_state(PeerState::Connecting);
                }
                _ => {}
            }
        }

        for (peer, _) in &self.peers {
            let blocks = peer.upload(elapsed, now);
            for b in blocks {
                let piece = b.piece_index.get();
                peer.received.fetch_add(b.size as u64, Ordering::Relaxed);
                trace!(peer = %peer.handle, piece, block = b.block_index, "block received");
                let r = scheduler.on_block_written(Some(peer.handle), piece, b.block_index)?;
                if r != BlockMarkingResult::AllWritten {
                    continue;
                }
                if rng.random_bool(self.corrupt_ratio) {
                    self.pieces_failed += 1;
                    scheduler.on_piece_failed(piece)?;
                } else {
                    scheduler.on_piece_done(piece)?;
                }
            }
            peer.speed.add_snapshot(peer.received_bytes(), now);
        }
        Ok(())
    }
}
