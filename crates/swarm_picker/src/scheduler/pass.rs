use std::{collections::HashMap, sync::Arc, time::Instant};

use picker_core::{BlockInfo, ValidPieceIndex};
use rand::Rng;
use tracing::{debug, debug_span, field, trace};

use super::{
    Scheduler, SchedulerLocked,
    candidate::{CandidateKind, PassCtx},
    peer_order::{PeerSortKey, backoff_ticks, max_requests, wants_more},
};
use crate::{
    active_piece::{ActivePiece, BlockState, RealTimeRequest},
    availability::{AvailabilitySummary, RefreshKind},
    config::SchedulerConfig,
    endgame::{EndGameEntryCheck, EndGameState},
    haves::PeerHaves,
    peer::{PeerConnection, PeerSnapshot, PeerState, PeerView},
    priority::PriorityInputs,
    providers::ProviderRegistry,
    realtime::{RealTimeChoice, RealTimePeer, choose_for_block, order_peers},
    stats::{AtomicStats, TickReport},
    tokens::TokenDispenser,
    type_aliases::PeerHandle,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestPath {
    Normal,
    RealTime,
    EndGame,
}

type PeerEntryRef = (PeerHandle, Arc<dyn PeerConnection>, Arc<PeerHaves>);

struct PassPeer {
    view: PeerView,
    conn: Arc<dyn PeerConnection>,
    budget: u32,
    issued: u32,
    // Bytes taken from the dispenser for this peer, and bytes of requests planned.
    granted: u64,
    spent: u64,
}

impl PassPeer {
    fn remaining(&self) -> u32 {
        self.budget.saturating_sub(self.issued)
    }

    fn token_limited(&self) -> bool {
        !self.view.snapshot.lan_local
    }

    fn plan(&mut self, block: BlockInfo, path: RequestPath, out: &mut Vec<PlannedRequest>) {
        self.issued += 1;
        self.view.outstanding += 1;
        self.spent += block.size as u64;
        out.push(PlannedRequest {
            handle: self.view.handle,
            conn: self.conn.clone(),
            block,
            path,
            token_limited: self.token_limited(),
        });
    }
}

struct PlannedRequest {
    handle: PeerHandle,
    conn: Arc<dyn PeerConnection>,
    block: BlockInfo,
    path: RequestPath,
    token_limited: bool,
}

#[derive(Default)]
struct Plan {
    tick: u64,
    idle: bool,
    peers_considered: usize,
    requests: Vec<PlannedRequest>,
    unused_tokens: u64,
}

struct Versions {
    config: u64,
    providers: u64,
}

impl SchedulerLocked {
    fn activate(&mut self, ctx: &PassCtx<'_>, piece: ValidPieceIndex) -> &mut ActivePiece {
        let pieces = &self.pieces;
        self.active.entry(piece).or_insert_with(|| {
            trace!(%piece, "activating piece");
            ActivePiece::new(
                piece,
                ctx.lengths.blocks_per_piece(piece),
                |b| pieces.is_block_written(piece, b),
                ctx.now,
                ctx.avail(piece),
            )
        })
    }

    fn refresh_summary(&mut self, ctx: &PassCtx<'_>) {
        let (priority, active) = (&self.priority, &self.active);
        self.summary = AvailabilitySummary::compute(ctx.counts, ctx.lengths, |idx| {
            let Some(piece) = ctx.lengths.validate_piece_index(idx as u32) else {
                return false;
            };
            priority.is_needed(piece)
                && active
                    .get(&piece)
                    .is_none_or(|ap| ap.has_unrequested() && ap.reserved_by.is_none())
        });
        self.rarest_allowed = self.calc_rarest_allowed(ctx);
    }

    // Providers are called with the picker lock held and must not call back into the
    // scheduler. Returns true if the scores were recomputed.
    fn refresh_priorities(
        &mut self,
        ctx: &PassCtx<'_>,
        providers: &ProviderRegistry,
        peer_count: u32,
        versions: &Versions,
    ) -> bool {
        if !self
            .priority
            .needs_refresh(ctx.now, ctx.config, versions.config, versions.providers)
        {
            return false;
        }
        let provided = providers.collect(ctx.lengths.total_pieces());
        let inputs = PriorityInputs {
            config: ctx.config,
            pieces: &self.pieces,
            files: &self.files,
            availability: ctx.counts,
            summary: &self.summary,
            peer_count,
            rarest_allowed: self.rarest_allowed > 0,
            providers: &provided,
            forced: &self.forced,
            sequential: self.sequential,
        };
        self.priority
            .recompute(&inputs, ctx.now, versions.config, versions.providers);
        true
    }

    /// Candidate peers in request order, with their budgets for this pass.
    fn pass_peers(
        &mut self,
        ctx: &PassCtx<'_>,
        entries: &[PeerEntryRef],
        snapshots: &HashMap<PeerHandle, PeerSnapshot>,
        tokens: &dyn TokenDispenser,
    ) -> Vec<PassPeer> {
        let mut keyed = Vec::with_capacity(entries.len());
        for (handle, conn, haves) in entries {
            // Registered in the peer map but not here yet: a concurrent add_peer.
            let Some(sched) = self.peers.get(handle) else {
                continue;
            };
            if self.tick < sched.next_eligible_tick {
                continue;
            }
            let Some(snapshot) = snapshots.get(handle) else {
                continue;
            };
            let view = PeerView {
                handle: *handle,
                snapshot: snapshot.clone(),
                haves: haves.clone(),
                last_piece: sched.last_piece,
                consecutive_no_requests: sched.consecutive_no_requests,
                outstanding: sched.inflight.len() as u32,
            };
            if !view.is_candidate() {
                continue;
            }
            let tie: u64 = self.rng.random();
            keyed.push((PeerSortKey::new(&view, tie), view, conn.clone()));
        }
        keyed.sort_by(|a, b| a.0.cmp(&b.0));

        let block_len = ctx.lengths.default_block_length() as u64;
        keyed
            .into_iter()
            .map(|(_, view, conn)| {
                let (budget, granted) = budget_for(&view, ctx.config, tokens, block_len);
                PassPeer {
                    view,
                    conn,
                    budget,
                    issued: 0,
                    granted,
                    spent: 0,
                }
            })
            .collect()
    }

    fn plan_realtime(
        &mut self,
        ctx: &PassCtx<'_>,
        peers: &mut [PassPeer],
        out: &mut Vec<PlannedRequest>,
    ) {
        let block_len = ctx.lengths.default_block_length();
        let mut due: Vec<(Instant, ValidPieceIndex)> = self
            .priority
            .iter_needed()
            .filter_map(|idx| ctx.lengths.validate_piece_index(idx as u32))
            .filter_map(|p| Some((self.priority.deadline(p)?, p)))
            .collect();
        if due.is_empty() {
            return;
        }
        due.sort_unstable();

        let mut rt_peers: Vec<RealTimePeer> = peers
            .iter()
            .enumerate()
            .map(|(slot, p)| RealTimePeer {
                handle: p.view.handle,
                receive_rate: p.view.snapshot.receive_rate,
                outstanding: p.view.outstanding,
                tie: self.rng.random(),
                slot,
            })
            .collect();
        order_peers(&mut rt_peers, block_len);

        for (deadline, piece) in due {
            for block in 0..ctx.lengths.blocks_per_piece(piece) {
                let racers = match self.active.get(&piece) {
                    Some(ap) => {
                        if ap.block_state(block) == Some(BlockState::Written)
                            || ap.owner(block).is_some()
                        {
                            continue;
                        }
                        ap.realtime
                            .as_ref()
                            .map(|rt| rt.racers(block).to_vec())
                            .unwrap_or_default()
                    }
                    None if self.pieces.is_block_written(piece, block) => continue,
                    None => Vec::new(),
                };
                let choice = choose_for_block(
                    &rt_peers,
                    &racers,
                    deadline,
                    ctx.now,
                    block_len,
                    |i| {
                        let p = &peers[rt_peers[i].slot];
                        p.remaining() > 0 && p.view.haves.has(piece)
                    },
                );
                let Some(choice) = choice else {
                    continue;
                };
                let Some(info) = ctx.lengths.block_info(piece, block) else {
                    continue;
                };
                let chosen = rt_peers[choice.peer()];
                if let RealTimeChoice::Forced { .. } = choice {
                    debug!(%piece, block, peer = %chosen.handle, "no peer makes the deadline, using the best uploader");
                }
                self.activate(ctx, piece).mark_realtime_requested(
                    block,
                    RealTimeRequest {
                        peer: chosen.handle,
                        eta: choice.eta(),
                    },
                    ctx.now,
                );
                if let Some(sched) = self.peers.get_mut(&chosen.handle) {
                    sched.inflight.insert((piece, block));
                    sched.last_piece = Some(piece);
                }
                trace!(%piece, block, peer = %chosen.handle, racers = racers.len(), "real-time request");
                peers[chosen.slot].plan(info, RequestPath::RealTime, out);
                rt_peers[choice.peer()].outstanding += 1;
                order_peers(&mut rt_peers, block_len);
            }
        }
    }

    fn plan_normal(
        &mut self,
        ctx: &PassCtx<'_>,
        peers: &mut [PassPeer],
        out: &mut Vec<PlannedRequest>,
    ) {
        let block_len = ctx.lengths.default_block_length();
        for p in peers.iter_mut() {
            while p.remaining() > 0 {
                let Some(c) = self.get_request_candidate(ctx, &p.view) else {
                    break;
                };
                let handle = p.view.handle;
                let peer_speed = p.view.block_speed(block_len);
                let snapshot = &p.view.snapshot;
                let reserve = c.kind == CandidateKind::Start
                    && snapshot.rate_sampled
                    && snapshot.receive_rate < ctx.config.reserve_below_bps;

                let ap = self.activate(ctx, c.piece);
                if reserve && ap.reserved_by.is_none() {
                    ap.reserved_by = Some(handle);
                }
                let Some(first) = ap.next_unrequested(c.from_block) else {
                    break;
                };
                let blocks: Vec<u32> = ap
                    .contiguous_unrequested(first)
                    .take(p.remaining() as usize)
                    .collect();
                for b in &blocks {
                    ap.mark_requested(*b, handle, peer_speed, ctx.now);
                }
                let reserved = ap.reserved_by == Some(handle);

                if let Some(sched) = self.peers.get_mut(&handle) {
                    if reserved {
                        sched.reserved.insert(c.piece);
                    }
                    sched.inflight.extend(blocks.iter().map(|b| (c.piece, *b)));
                    sched.last_piece = Some(c.piece);
                }
                p.view.last_piece = Some(c.piece);
                trace!(peer = %handle, piece = %c.piece, first, count = blocks.len(), kind = ?c.kind, "requesting");
                for b in blocks {
                    if let Some(info) = ctx.lengths.block_info(c.piece, b) {
                        p.plan(info, RequestPath::Normal, out);
                    }
                }
            }
        }
    }

    fn maybe_enter_end_game(&mut self, ctx: &PassCtx<'_>, peer_count: usize) {
        if self.end_game.is_disabled() || self.end_game.state() != EndGameState::Normal {
            return;
        }
        let mut all_requested = true;
        let mut remaining_bytes = 0u64;
        for idx in self.priority.iter_needed() {
            let Some(piece) = ctx.lengths.validate_piece_index(idx as u32) else {
                continue;
            };
            match self.active.get(&piece) {
                Some(ap) if !ap.has_unrequested() || ap.reserved_by.is_some() => {
                    remaining_bytes += ap
                        .iter_unwritten()
                        .filter_map(|b| ctx.lengths.block_size(piece, b))
                        .map(u64::from)
                        .sum::<u64>();
                }
                _ => {
                    all_requested = false;
                    break;
                }
            }
        }
        let check = EndGameEntryCheck {
            peers: peer_count,
            all_requested,
            remaining_bytes,
            playback_active: self.sequential.is_some() || self.forced_count > 0,
        };
        let (active, priority) = (&self.active, &self.priority);
        self.end_game.try_enter(ctx.config, &check, ctx.now, || {
            active
                .iter()
                .filter(|(p, _)| priority.is_needed(**p))
                .flat_map(|(p, ap)| ap.iter_unwritten().map(move |b| (*p, b)))
                .collect()
        });
    }

    fn plan_end_game(
        &mut self,
        ctx: &PassCtx<'_>,
        peers: &mut [PassPeer],
        out: &mut Vec<PlannedRequest>,
    ) {
        if !self.end_game.is_active() {
            return;
        }
        let snubbed_peers = peers.iter().filter(|p| p.view.snapshot.snubbed).count() as u32;
        for p in peers.iter_mut() {
            let handle = p.view.handle;
            let snubbed = p.view.snapshot.snubbed;
            while p.remaining() > 0 {
                let (pieces, haves) = (&self.pieces, &p.view.haves);
                let inflight = self.peers.get(&handle).map(|s| &s.inflight);
                let chunk = self.end_game.next_for_peer(handle, |c| {
                    haves.has(c.piece)
                        && !pieces.is_block_written(c.piece, c.block)
                        && inflight.is_none_or(|i| !i.contains(&(c.piece, c.block)))
                        && (!snubbed || ctx.avail(c.piece) <= snubbed_peers)
                });
                let Some(chunk) = chunk else {
                    break;
                };
                let Some(info) = ctx.lengths.block_info(chunk.piece, chunk.block) else {
                    break;
                };
                if let Some(sched) = self.peers.get_mut(&handle) {
                    sched.inflight.insert((chunk.piece, chunk.block));
                }
                trace!(peer = %handle, piece = %chunk.piece, block = chunk.block, copies = chunk.requests, "end-game request");
                p.plan(info, RequestPath::EndGame, out);
            }
        }
    }

    /// Update back-off counters. Returns the dispensed bytes nobody used.
    fn finish_peers(&mut self, config: &SchedulerConfig, peers: &[PassPeer]) -> u64 {
        let mut unused = 0;
        for p in peers {
            unused += p.granted.saturating_sub(p.spent);
            let Some(sched) = self.peers.get_mut(&p.view.handle) else {
                continue;
            };
            if p.issued > 0 {
                sched.consecutive_no_requests = 0;
            } else if p.budget > 0 {
                sched.consecutive_no_requests =
                    (sched.consecutive_no_requests + 1).min(config.no_request_backoff_cap);
                sched.next_eligible_tick =
                    self.tick + backoff_ticks(sched.consecutive_no_requests);
            }
        }
        unused
    }

    fn plan_pass(
        &mut self,
        ctx: &PassCtx<'_>,
        entries: &[PeerEntryRef],
        snapshots: &HashMap<PeerHandle, PeerSnapshot>,
        providers: &ProviderRegistry,
        tokens: &dyn TokenDispenser,
        versions: &Versions,
    ) -> Plan {
        self.tick += 1;
        let mut plan = Plan {
            tick: self.tick,
            ..Default::default()
        };
        let transferring = snapshots
            .values()
            .filter(|s| s.state == PeerState::Transferring)
            .count();

        self.refresh_summary(ctx);
        if self.refresh_priorities(ctx, providers, transferring as u32, versions) {
            // The summary depends on which pieces are needed.
            self.refresh_summary(ctx);
        }
        if !self.priority.has_needed() {
            plan.idle = true;
            return plan;
        }
        self.end_game.check_timeout(ctx.config, ctx.now);

        let mut peers = self.pass_peers(ctx, entries, snapshots, tokens);
        plan.peers_considered = peers.len();

        if ctx.realtime_active && self.priority.realtime_count() > 0 {
            self.plan_realtime(ctx, &mut peers, &mut plan.requests);
        }
        self.plan_normal(ctx, &mut peers, &mut plan.requests);
        self.maybe_enter_end_game(ctx, transferring);
        self.plan_end_game(ctx, &mut peers, &mut plan.requests);

        plan.unused_tokens = self.finish_peers(ctx.config, &peers);
        plan
    }
}

fn budget_for(
    view: &PeerView,
    config: &SchedulerConfig,
    tokens: &dyn TokenDispenser,
    block_len: u64,
) -> (u32, u64) {
    let max = max_requests(view, config);
    if !wants_more(view, max, config) {
        return (0, 0);
    }
    let budget = max.saturating_sub(view.outstanding);
    if view.snapshot.lan_local || budget == 0 {
        return (budget, 0);
    }
    if tokens.peek() == 0 {
        return (0, 0);
    }
    let granted = tokens.dispense(budget as u64 * block_len);
    let by_tokens = granted.div_ceil(block_len.max(1)).min(u32::MAX as u64) as u32;
    (budget.min(by_tokens), granted)
}

impl Scheduler {
    /// Run one allocation pass and send the resulting requests.
    ///
    /// Must not be called concurrently with itself for the same scheduler. Peer events
    /// may arrive from other threads at any time.
    pub fn schedule(&self) -> TickReport {
        let span = debug_span!("schedule", tick = field::Empty);
        let _entered = span.enter();
        let now = self.clock.now();
        let config = self.config.load_full();
        let versions = Versions {
            config: self.config_version(),
            providers: self.providers.version(),
        };
        AtomicStats::inc(&self.stats.ticks);

        let mut entries: Vec<PeerEntryRef> = self
            .peers
            .iter()
            .map(|e| (*e.key(), e.conn.clone(), e.haves.clone()))
            .collect();
        // Map iteration order is random; keep passes reproducible under a fixed seed.
        entries.sort_unstable_by_key(|(handle, _, _)| *handle);
        let snapshots: HashMap<PeerHandle, PeerSnapshot> = entries
            .iter()
            .map(|(handle, conn, _)| (*handle, conn.snapshot()))
            .collect();

        self.refresh_availability(now, &config, &snapshots);
        let counts = self.availability.snapshot();
        let ctx = PassCtx {
            config: &config,
            lengths: &self.lengths,
            counts: &counts,
            now,
            realtime_active: self.providers.has_real_time(),
        };

        let plan = {
            let mut g = self.locked.lock();
            g.plan_pass(
                &ctx,
                &entries,
                &snapshots,
                &self.providers,
                self.tokens.as_ref(),
                &versions,
            )
        };
        span.record("tick", plan.tick);
        if plan.unused_tokens > 0 {
            self.tokens.return_unused(plan.unused_tokens);
        }

        let mut report = TickReport {
            tick: plan.tick,
            idle: plan.idle,
            peers_considered: plan.peers_considered,
            ..Default::default()
        };
        if plan.idle {
            AtomicStats::inc(&self.stats.idle_ticks);
            trace!("nothing to schedule");
            return report;
        }

        let mut failed = Vec::new();
        for req in plan.requests {
            match req.conn.request(&req.block, req.path == RequestPath::RealTime) {
                Ok(_) => {
                    let counter = match req.path {
                        RequestPath::Normal => &mut report.normal_requests,
                        RequestPath::RealTime => &mut report.realtime_requests,
                        RequestPath::EndGame => &mut report.end_game_requests,
                    };
                    *counter += 1;
                }
                Err(e) => {
                    debug!(peer = %req.handle, piece = %req.block.piece_index, block = req.block.block_index, "error sending request: {e:#}");
                    failed.push(req);
                }
            }
        }

        let s = &self.stats;
        AtomicStats::add(&s.requests_issued, report.total_requests() as u64);
        AtomicStats::add(&s.realtime_requests, report.realtime_requests as u64);
        AtomicStats::add(&s.end_game_requests, report.end_game_requests as u64);
        if !failed.is_empty() {
            report.failed_requests = failed.len() as u32;
            AtomicStats::add(&s.requests_failed, failed.len() as u64);
            self.roll_back(&failed);
        }

        debug!(
            peers = report.peers_considered,
            normal = report.normal_requests,
            realtime = report.realtime_requests,
            end_game = report.end_game_requests,
            failed = report.failed_requests,
            "pass finished"
        );
        report
    }

    fn refresh_availability(
        &self,
        now: Instant,
        config: &SchedulerConfig,
        snapshots: &HashMap<PeerHandle, PeerSnapshot>,
    ) {
        {
            let mut shadow = self.availability.lock();
            for mut e in self.peers.iter_mut() {
                let Some(s) = snapshots.get(e.key()) else {
                    continue;
                };
                let transferring = s.state == PeerState::Transferring;
                if e.counted == transferring {
                    continue;
                }
                if transferring {
                    shadow.add_haves(&e.haves);
                } else {
                    shadow.remove_haves(&e.haves);
                }
                trace!(peer = %e.key(), state = %s.state, "availability contribution changed");
                e.counted = transferring;
            }
        }
        let kind = self.availability.refresh(now, config, |counts| {
            for e in self.peers.iter().filter(|e| e.counted) {
                for idx in e.haves.iter() {
                    if let Some(c) = counts.get_mut(idx as usize) {
                        *c += 1;
                    }
                }
            }
            let g = self.locked.lock();
            for idx in g.pieces.done_bits().iter_ones() {
                if let Some(c) = counts.get_mut(idx) {
                    *c += 1;
                }
            }
        });
        if kind == RefreshKind::Rebuilt {
            trace!("availability rebuilt");
        }
    }

    fn roll_back(&self, failed: &[PlannedRequest]) {
        let mut tokens = 0;
        {
            let mut g = self.locked.lock();
            for req in failed {
                let (piece, block) = (req.block.piece_index, req.block.block_index);
                if let Some(sched) = g.peers.get_mut(&req.handle) {
                    sched.inflight.remove(&(piece, block));
                }
                match req.path {
                    RequestPath::Normal => {
                        if let Some(ap) = g.active.get_mut(&piece) {
                            ap.unmark_requested(block, req.handle);
                        }
                    }
                    RequestPath::RealTime => {
                        if let Some(ap) = g.active.get_mut(&piece) {
                            ap.remove_racer(block, req.handle);
                        }
                    }
                    RequestPath::EndGame => g.end_game.on_send_failed(piece, block, req.handle),
                }
                if req.token_limited {
                    tokens += req.block.size as u64;
                }
            }
        }
        if tokens > 0 {
            self.tokens.return_unused(tokens);
        }
    }
}
