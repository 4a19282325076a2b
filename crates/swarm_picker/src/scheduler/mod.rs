// The request scheduler: which peer gets asked for which block.
//
// ## Architecture
// Peer I/O contexts push events in (connect/disconnect, have, bitfield, block
// written, request rejected) concurrently. An external loop calls `schedule()`
// periodically; one pass at a time per transfer.
//
// ### Shared state
// - `peers`: a sharded map (DashMap) with each peer's connection handle and its
//   advertised pieces.
// - `availability`: per-piece replica counts, behind their own lock. A peer counts
//   from the moment it is added until a pass sees it in a state other than
//   transferring; each pass brings the counts in line with the peers' states.
// - `locked`: everything else. Piece and block states, active pieces, per-peer
//   bookkeeping, the end-game queue, forced pieces, sequential mode.
//
// > NOTE: deadlock notice:
// > always lock in this order: availability, then a peers shard, then `locked`.
// > Never touch `peers` or `availability` while `locked` is held. The published
// > availability counts are a leaf: nothing else is locked while they are held.
// >
// > `PeerConnection` methods are only called with no lock held, so connections may
// > call back into the scheduler from inside `request`/`cancel`.
//
// ## A pass
// 1. Refresh availability and priorities, bail out if nothing is schedulable.
// 2. Under `locked`, pick candidate peers, size their budgets, and mark blocks as
//    requested: real-time pieces first, then the normal resume/start selection, then
//    the end-game queue.
// 3. Release the lock, send the requests.
// 4. Re-lock and roll back the marks of requests that failed to send.

mod candidate;
mod pass;
mod peer_order;

use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Instant,
};

use arc_swap::ArcSwap;
use dashmap::DashMap;
use itertools::Itertools;
use parking_lot::Mutex;
use picker_core::{BlockInfo, Lengths, ValidPieceIndex};
use rand::{SeedableRng, rngs::SmallRng};
use tracing::{debug, info, trace, warn};

use crate::{
    active_piece::ActivePiece,
    availability::{AvailabilitySummary, AvailabilityTracker},
    clock::{Clock, MonotonicClock},
    config::SchedulerConfig,
    disk::DiskLayer,
    endgame::{EndGameController, EndGameState},
    error::{Error, Result},
    files::FileTable,
    haves::PeerHaves,
    peer::{PeerConnection, RequestHint},
    pieces::{BlockMarkingResult, PieceStates},
    priority::{PriorityEngine, Sequential},
    providers::{PriorityProvider, ProviderId, ProviderRegistry, RealTimeProvider},
    stats::{AtomicStats, RequestCounters, SchedulerStats},
    tokens::{TokenDispenser, Unlimited},
    type_aliases::{BF, PeerHandle, Score},
};

#[derive(Default)]
pub struct SchedulerOptions {
    pub config: SchedulerConfig,
    /// Defaults to [`MonotonicClock`].
    pub clock: Option<Arc<dyn Clock>>,
    /// Defaults to [`Unlimited`].
    pub tokens: Option<Arc<dyn TokenDispenser>>,
}

struct PeerEntry {
    conn: Arc<dyn PeerConnection>,
    haves: Arc<PeerHaves>,
    // Whether `haves` is included in the availability counts. Changed only with the
    // availability lock held.
    counted: bool,
}

/// Scheduler-side bookkeeping for one peer.
#[derive(Default, Debug)]
pub(crate) struct PeerSched {
    pub last_piece: Option<ValidPieceIndex>,
    pub consecutive_no_requests: u32,
    pub next_eligible_tick: u64,
    /// Blocks we asked this peer for that didn't arrive yet.
    pub inflight: HashSet<(ValidPieceIndex, u32)>,
    pub reserved: BTreeSet<ValidPieceIndex>,
}

pub(crate) struct SchedulerLocked {
    pub pieces: PieceStates,
    pub files: FileTable,
    pub priority: PriorityEngine,
    pub active: BTreeMap<ValidPieceIndex, ActivePiece>,
    pub peers: HashMap<PeerHandle, PeerSched>,
    pub end_game: EndGameController,
    pub forced: BF,
    pub forced_count: u32,
    pub sequential: Option<Sequential>,
    pub global_hint: Option<RequestHint>,
    pub summary: AvailabilitySummary,
    pub rarest_allowed: u32,
    pub rng: SmallRng,
    pub tick: u64,
    pub started_at: Instant,
}

impl SchedulerLocked {
    /// Forget that `peer` has anything outstanding for this block, on every path.
    /// Returns the other peers that still had it outstanding.
    fn clear_block_holders(
        &mut self,
        piece: ValidPieceIndex,
        block: u32,
        except: Option<PeerHandle>,
    ) -> Vec<PeerHandle> {
        let mut others = Vec::new();
        for (handle, sched) in self.peers.iter_mut() {
            if sched.inflight.remove(&(piece, block)) && Some(*handle) != except {
                others.push(*handle);
            }
        }
        others
    }

    /// Drop an active piece along with every reservation and outstanding request on it.
    fn drop_active_piece(&mut self, piece: ValidPieceIndex) -> Vec<(PeerHandle, u32)> {
        let mut holders = Vec::new();
        if self.active.remove(&piece).is_none() {
            return holders;
        }
        for (handle, sched) in self.peers.iter_mut() {
            sched.reserved.remove(&piece);
            sched.inflight.retain(|(p, b)| {
                if *p == piece {
                    holders.push((*handle, *b));
                    false
                } else {
                    true
                }
            });
        }
        holders
    }
}

pub struct Scheduler {
    lengths: Lengths,
    config: ArcSwap<SchedulerConfig>,
    config_version: AtomicU64,
    clock: Arc<dyn Clock>,
    tokens: Arc<dyn TokenDispenser>,
    providers: ProviderRegistry,

    peers: DashMap<PeerHandle, PeerEntry>,
    availability: AvailabilityTracker,
    locked: Mutex<SchedulerLocked>,

    stats: AtomicStats,
}

impl Scheduler {
    pub fn new(disk: &dyn DiskLayer, options: SchedulerOptions) -> Result<Self> {
        let lengths = disk.lengths();
        let files = disk.files().map_err(Error::Disk)?;
        let pieces = PieceStates::from_disk(disk);

        let mut files = FileTable::new(files, lengths);
        // The disk's per-file counters are replaced by our own, derived from done pieces.
        let done: Vec<_> = pieces
            .done_bits()
            .iter_ones()
            .filter_map(|i| lengths.validate_piece_index(i as u32))
            .collect();
        files.reset_downloaded();
        for p in done {
            files.on_piece_done(p);
        }

        let clock = options.clock.unwrap_or_else(|| Arc::new(MonotonicClock));
        let tokens = options.tokens.unwrap_or_else(|| Arc::new(Unlimited));
        let rng = match options.config.rng_seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_os_rng(),
        };
        let total = lengths.total_pieces();
        let now = clock.now();

        let availability = AvailabilityTracker::new(total);
        {
            let mut shadow = availability.lock();
            for p in pieces.done_bits().iter_ones() {
                if let Some(p) = lengths.validate_piece_index(p as u32) {
                    shadow.add_piece(p);
                }
            }
        }

        debug!(
            total_pieces = total,
            done = pieces.done_count(),
            files = files.len(),
            "created scheduler"
        );

        Ok(Self {
            lengths,
            config: ArcSwap::from_pointee(options.config),
            config_version: AtomicU64::new(0),
            clock,
            tokens,
            providers: ProviderRegistry::default(),
            peers: DashMap::new(),
            availability,
            locked: Mutex::new(SchedulerLocked {
                pieces,
                files,
                priority: PriorityEngine::new(total),
                active: BTreeMap::new(),
                peers: HashMap::new(),
                end_game: EndGameController::new(),
                forced: BF::repeat(false, total as usize),
                forced_count: 0,
                sequential: None,
                global_hint: None,
                summary: AvailabilitySummary::default(),
                rarest_allowed: 0,
                rng,
                tick: 0,
                started_at: now,
            }),
            stats: AtomicStats::default(),
        })
    }

    pub fn lengths(&self) -> &Lengths {
        &self.lengths
    }

    pub fn config(&self) -> Arc<SchedulerConfig> {
        self.config.load_full()
    }

    pub fn config_version(&self) -> u64 {
        self.config_version.load(Ordering::Acquire)
    }

    /// Replace the configuration. The next pass recomputes priorities.
    pub fn reconfigure(&self, config: SchedulerConfig) {
        self.config.store(Arc::new(config));
        let v = self.config_version.fetch_add(1, Ordering::AcqRel) + 1;
        info!(version = v, "scheduler reconfigured");
    }

    fn validate_piece(&self, index: u32) -> Result<ValidPieceIndex> {
        self.lengths
            .validate_piece_index(index)
            .ok_or(Error::InvalidPieceIndex {
                index,
                total: self.lengths.total_pieces(),
            })
    }

    fn validate_block(&self, piece: ValidPieceIndex, block: u32) -> Result<BlockInfo> {
        self.lengths
            .block_info(piece, block)
            .ok_or(Error::InvalidRange {
                piece: piece.get(),
                offset: block.saturating_mul(self.lengths.default_block_length()),
                length: self.lengths.default_block_length(),
                piece_length: self.lengths.piece_length(piece),
            })
    }

    fn conn(&self, handle: PeerHandle) -> Option<Arc<dyn PeerConnection>> {
        self.peers.get(&handle).map(|e| e.conn.clone())
    }

    fn send_cancels(&self, cancels: Vec<(PeerHandle, BlockInfo)>) {
        for (handle, block) in cancels {
            let Some(conn) = self.conn(handle) else {
                continue;
            };
            trace!(peer = %handle, piece = %block.piece_index, block = block.block_index, "cancelling redundant request");
            conn.cancel(&block);
            AtomicStats::inc(&self.stats.cancels_sent);
        }
    }

    // ## Peer events

    pub fn add_peer(
        &self,
        handle: PeerHandle,
        conn: Arc<dyn PeerConnection>,
        haves: Option<PeerHaves>,
    ) -> Result<()> {
        let total = self.lengths.total_pieces();
        let haves = haves.unwrap_or_else(|| PeerHaves::empty(total));
        if haves.len() != total as usize {
            return Err(Error::BitfieldLength {
                got: haves.len().div_ceil(8),
                expected: self.lengths.piece_bitfield_bytes(),
            });
        }
        {
            use dashmap::mapref::entry::Entry;
            let mut shadow = self.availability.lock();
            match self.peers.entry(handle) {
                Entry::Occupied(_) => return Err(Error::PeerAlreadyRegistered(handle)),
                Entry::Vacant(v) => {
                    shadow.add_haves(&haves);
                    v.insert(PeerEntry {
                        conn,
                        haves: Arc::new(haves),
                        counted: true,
                    });
                }
            }
        }
        let mut g = self.locked.lock();
        g.peers.insert(handle, PeerSched::default());
        g.priority.mark_dirty();
        debug!(peer = %handle, "peer added");
        Ok(())
    }

    /// Remove a peer, releasing everything it had claimed.
    pub fn remove_peer(&self, handle: PeerHandle) -> Result<()> {
        {
            let mut shadow = self.availability.lock();
            let (_, entry) = self
                .peers
                .remove(&handle)
                .ok_or(Error::UnknownPeer(handle))?;
            if entry.counted {
                shadow.remove_haves(&entry.haves);
            }
        }
        let mut g = self.locked.lock();
        g.peers.remove(&handle);
        let mut released = 0;
        for ap in g.active.values_mut() {
            released += ap.release_peer(handle).len();
        }
        g.end_game.on_peer_removed(handle);
        debug!(peer = %handle, released, "peer removed");
        Ok(())
    }

    /// The peer sent its full bitfield. Replaces whatever it advertised before.
    pub fn on_bitfield(&self, handle: PeerHandle, bitfield: &[u8]) -> Result<()> {
        let haves = PeerHaves::from_bytes(bitfield, self.lengths.total_pieces())?;
        let mut shadow = self.availability.lock();
        let mut entry = self
            .peers
            .get_mut(&handle)
            .ok_or(Error::UnknownPeer(handle))?;
        if entry.counted {
            shadow.remove_haves(&entry.haves);
            shadow.add_haves(&haves);
        }
        entry.haves = Arc::new(haves);
        Ok(())
    }

    pub fn on_have(&self, handle: PeerHandle, piece: u32) -> Result<()> {
        let piece = self.validate_piece(piece)?;
        let mut shadow = self.availability.lock();
        let mut entry = self
            .peers
            .get_mut(&handle)
            .ok_or(Error::UnknownPeer(handle))?;
        if Arc::make_mut(&mut entry.haves).set(piece) && entry.counted {
            shadow.add_piece(piece);
        }
        Ok(())
    }

    /// A block reached storage. `peer` is who delivered it, if known. Every other
    /// peer still waiting on the same block gets a cancel.
    pub fn on_block_written(
        &self,
        peer: Option<PeerHandle>,
        piece: u32,
        block: u32,
    ) -> Result<BlockMarkingResult> {
        let piece = self.validate_piece(piece)?;
        let info = self.validate_block(piece, block)?;
        let now = self.clock.now();
        let (result, cancels) = {
            let mut g = self.locked.lock();
            let result = g.pieces.mark_block_written(piece, block);
            if let Some(ap) = g.active.get_mut(&piece) {
                ap.mark_written(block, now);
                if let Some(rt) = ap.realtime.as_mut() {
                    rt.take(block);
                }
            }
            g.end_game.on_block_written(piece, block);
            let others = g.clear_block_holders(piece, block, peer);
            (result, others)
        };
        AtomicStats::inc(&self.stats.blocks_written);
        self.send_cancels(cancels.into_iter().map(|h| (h, info)).collect());
        Ok(result)
    }

    /// The peer refused (or dropped) a request. The block becomes claimable again.
    pub fn on_request_rejected(&self, handle: PeerHandle, piece: u32, block: u32) -> Result<()> {
        let piece = self.validate_piece(piece)?;
        self.validate_block(piece, block)?;
        let mut g = self.locked.lock();
        let sched = g.peers.get_mut(&handle).ok_or(Error::UnknownPeer(handle))?;
        if !sched.inflight.remove(&(piece, block)) {
            return Ok(());
        }
        if let Some(ap) = g.active.get_mut(&piece) {
            ap.unmark_requested(block, handle);
            ap.remove_racer(block, handle);
        }
        g.end_game.on_send_failed(piece, block, handle);
        AtomicStats::inc(&self.stats.requests_rejected);
        trace!(peer = %handle, %piece, block, "request rejected");
        Ok(())
    }

    /// The piece verified. Returns false if it was already done.
    pub fn on_piece_done(&self, piece: u32) -> Result<bool> {
        let piece = self.validate_piece(piece)?;
        let holders = {
            let mut shadow = self.availability.lock();
            let mut g = self.locked.lock();
            if !g.pieces.mark_done(piece) {
                return Ok(false);
            }
            shadow.add_piece(piece);
            g.files.on_piece_done(piece);
            g.priority.on_piece_done(piece);
            g.end_game.on_piece_done(piece);
            g.drop_active_piece(piece)
        };
        AtomicStats::inc(&self.stats.pieces_done);
        debug!(%piece, "piece done");
        let cancels = holders
            .into_iter()
            .filter_map(|(h, b)| Some((h, self.lengths.block_info(piece, b)?)))
            .collect();
        self.send_cancels(cancels);
        Ok(true)
    }

    /// The piece failed verification: it has to be downloaded again.
    pub fn on_piece_failed(&self, piece: u32) -> Result<()> {
        let piece = self.validate_piece(piece)?;
        let mut g = self.locked.lock();
        if !g.pieces.mark_failed(piece) {
            return Ok(());
        }
        g.drop_active_piece(piece);
        if g.end_game.is_active() {
            let blocks = self.lengths.blocks_per_piece(piece);
            g.end_game.add_chunks((0..blocks).map(|b| (piece, b)));
        }
        g.priority.mark_dirty();
        AtomicStats::inc(&self.stats.pieces_failed);
        warn!(%piece, "piece failed verification, will re-download");
        Ok(())
    }

    // ## Control surface

    pub fn set_force_piece(&self, piece: u32, forced: bool) -> Result<()> {
        let piece = self.validate_piece(piece)?;
        let mut g = self.locked.lock();
        if g.forced.replace(piece.as_usize(), forced) != forced {
            if forced {
                g.forced_count += 1;
            } else {
                g.forced_count -= 1;
            }
            g.priority.mark_dirty();
        }
        Ok(())
    }

    pub fn is_forced(&self, piece: u32) -> Result<bool> {
        let piece = self.validate_piece(piece)?;
        Ok(self.locked.lock().forced[piece.as_usize()])
    }

    fn set_sequential(&self, sequential: Option<Sequential>) {
        let mut g = self.locked.lock();
        if g.sequential != sequential {
            g.sequential = sequential;
            g.priority.mark_dirty();
            debug!(?sequential, "sequential mode changed");
        }
    }

    pub fn set_sequential_ascending_from(&self, start: u32) -> Result<()> {
        self.validate_piece(start)?;
        self.set_sequential(Some(Sequential {
            start,
            descending: false,
        }));
        Ok(())
    }

    pub fn set_sequential_descending_from(&self, start: u32) -> Result<()> {
        self.validate_piece(start)?;
        self.set_sequential(Some(Sequential {
            start,
            descending: true,
        }));
        Ok(())
    }

    pub fn clear_sequential(&self) {
        self.set_sequential(None);
    }

    pub fn set_global_request_hint(&self, piece: u32, offset: u32, length: u32) -> Result<()> {
        let hint = RequestHint {
            piece,
            offset,
            length,
        };
        let p = self.validate_piece(piece)?;
        if hint.resolve(&self.lengths).is_none() {
            return Err(Error::InvalidRange {
                piece,
                offset,
                length,
                piece_length: self.lengths.piece_length(p),
            });
        }
        self.locked.lock().global_hint = Some(hint);
        Ok(())
    }

    pub fn clear_global_request_hint(&self) {
        self.locked.lock().global_hint = None;
    }

    pub fn global_request_hint(&self) -> Option<RequestHint> {
        self.locked.lock().global_hint
    }

    pub fn set_file_priority(&self, file: usize, priority: i32) -> Result<()> {
        let mut g = self.locked.lock();
        if g.files.set_priority(file, priority)? {
            g.priority.mark_dirty();
        }
        Ok(())
    }

    pub fn set_file_skipped(&self, file: usize, skipped: bool) -> Result<()> {
        let mut g = self.locked.lock();
        if g.files.set_skipped(file, skipped)? {
            g.priority.mark_dirty();
        }
        Ok(())
    }

    /// Registering a real-time provider turns end-game off for good.
    pub fn register_real_time_provider(&self, provider: Arc<dyn RealTimeProvider>) -> ProviderId {
        let id = self.providers.register_real_time(provider);
        self.locked.lock().end_game.disable();
        id
    }

    pub fn register_priority_provider(&self, provider: Arc<dyn PriorityProvider>) -> ProviderId {
        self.providers.register_priority(provider)
    }

    /// Returns false if the id is unknown.
    pub fn unregister_provider(&self, id: ProviderId) -> bool {
        self.providers.unregister(id)
    }

    /// Availability figures as of the last pass.
    pub fn availability(&self) -> AvailabilitySummary {
        self.locked.lock().summary
    }

    pub fn piece_availability(&self, piece: u32) -> Result<u32> {
        let piece = self.validate_piece(piece)?;
        Ok(self.availability.get(piece))
    }

    pub fn end_game_state(&self) -> EndGameState {
        self.locked.lock().end_game.state()
    }

    pub fn piece_score(&self, piece: u32) -> Result<Score> {
        let piece = self.validate_piece(piece)?;
        Ok(self.locked.lock().priority.score(piece))
    }

    pub fn piece_diagnostic(&self, piece: u32) -> Result<String> {
        let piece = self.validate_piece(piece)?;
        let avail = self.availability.get(piece);
        let g = self.locked.lock();
        let mut s = format!(
            "piece={} score={} avail={} forced={} done={} needed={}",
            piece,
            g.priority.score(piece),
            avail,
            g.forced[piece.as_usize()],
            g.pieces.is_done(piece),
            g.priority.is_needed(piece),
        );
        if let Some(ap) = g.active.get(&piece) {
            s.push_str(&format!(
                " active(unrequested={} written={}/{} speed={}",
                ap.unrequested_count(),
                ap.written_count(),
                ap.block_count(),
                ap.speed,
            ));
            if let Some(r) = ap.reserved_by {
                s.push_str(&format!(" reserved_by={r}"));
            }
            s.push(')');
        }
        if let Some(d) = g.priority.deadline(piece) {
            let now = self.clock.now();
            s.push_str(&format!(
                " deadline_in={:?}",
                d.saturating_duration_since(now)
            ));
        }
        Ok(s)
    }

    /// Whether any piece is still needed. When false, `schedule` does nothing.
    pub fn is_schedulable(&self) -> bool {
        self.locked.lock().priority.has_needed()
    }

    pub fn is_complete(&self) -> bool {
        self.locked.lock().pieces.is_complete()
    }

    pub fn stats(&self) -> SchedulerStats {
        let s = &self.stats;
        let availability_rebuilds = self.availability.rebuilds();
        let availability_drift_corrections = self.availability.drift_corrections();
        let g = self.locked.lock();
        SchedulerStats {
            ticks: AtomicStats::get(&s.ticks),
            idle_ticks: AtomicStats::get(&s.idle_ticks),
            requests: RequestCounters::from(s),
            blocks_written: AtomicStats::get(&s.blocks_written),
            pieces_done: AtomicStats::get(&s.pieces_done),
            pieces_failed: AtomicStats::get(&s.pieces_failed),
            total_pieces: self.lengths.total_pieces(),
            done_pieces: g.pieces.done_count(),
            active_pieces: g.active.len(),
            peers: g.peers.len(),
            end_game: g.end_game.state(),
            end_game_queue: g.end_game.queue_len(),
            end_game_entries: g.end_game.entries(),
            availability: g.summary,
            availability_rebuilds,
            availability_drift_corrections,
            schedulable: g.priority.has_needed(),
            needed_change_count: g.priority.needed_change_count(),
            config_version: self.config_version(),
        }
    }

    /// Blocks currently outstanding to a peer.
    pub fn outstanding_requests(&self, handle: PeerHandle) -> Result<Vec<(u32, u32)>> {
        let g = self.locked.lock();
        let sched = g.peers.get(&handle).ok_or(Error::UnknownPeer(handle))?;
        Ok(sched
            .inflight
            .iter()
            .map(|(p, b)| (p.get(), *b))
            .sorted_unstable()
            .collect())
    }
}
