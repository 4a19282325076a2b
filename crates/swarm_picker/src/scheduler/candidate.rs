use std::{cmp::Ordering, time::Instant};

use picker_core::{Lengths, ValidPieceIndex};
use rand::Rng;
use tracing::trace;

use super::SchedulerLocked;
use crate::{
    active_piece::ActivePiece,
    config::SchedulerConfig,
    peer::PeerView,
    priority::PRIORITY_OVERRIDES_RAREST,
    type_aliases::Score,
};

/// Read-only inputs shared by every selection in one pass.
pub(crate) struct PassCtx<'a> {
    pub config: &'a SchedulerConfig,
    pub lengths: &'a Lengths,
    pub counts: &'a [u32],
    pub now: Instant,
    /// A real-time provider is registered: deadline pieces belong to the real-time pass.
    pub realtime_active: bool,
}

impl PassCtx<'_> {
    pub fn avail(&self, piece: ValidPieceIndex) -> u32 {
        self.counts.get(piece.as_usize()).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CandidateKind {
    Reserved,
    Hint,
    Resume,
    Start,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Candidate {
    pub piece: ValidPieceIndex,
    /// Start looking for unrequested blocks here.
    pub from_block: u32,
    pub kind: CandidateKind,
}

struct ResumeChoice {
    piece: ValidPieceIndex,
    avail: u32,
    adjusted: Score,
}

// Bigger is better. The first element puts scores that override rarest-first on top.
type StartKey = (u8, Score, Score);

impl SchedulerLocked {
    /// How many more rarest-tier pieces may be started right now.
    pub(crate) fn calc_rarest_allowed(&self, ctx: &PassCtx<'_>) -> u32 {
        let cfg = ctx.config;
        let level = self.summary.global_min_others;
        if self.pieces.done_count() < cfg.rarest_min_pieces_done
            || ctx.now.saturating_duration_since(self.started_at) < cfg.startup_grace
            || level == 0
        {
            return 0;
        }
        let allowed: u32 = match level {
            1 => 4,
            2..=3 => 3,
            4..=7 => 2,
            _ => 1,
        };
        let in_flight = self
            .active
            .keys()
            .filter(|p| {
                let a = ctx.avail(**p);
                a > 0 && a <= level
            })
            .count() as u32;
        allowed.saturating_sub(in_flight)
    }

    fn is_schedulable_piece(&self, ctx: &PassCtx<'_>, piece: ValidPieceIndex) -> bool {
        if !self.priority.is_needed(piece) {
            return false;
        }
        !(ctx.realtime_active && self.priority.deadline(piece).is_some())
    }

    /// Whether `view` may continue an active piece someone else may be driving.
    fn fits(&self, ctx: &PassCtx<'_>, view: &PeerView, ap: &ActivePiece) -> bool {
        if view.last_piece == Some(ap.piece) {
            return true;
        }
        let cfg = ctx.config;
        if view.snapshot.snubbed {
            let idle = ctx.now.saturating_duration_since(ap.last_activity);
            return idle >= cfg.snubbed_resume_idle
                && ctx.avail(ap.piece) <= self.summary.global_min_others;
        }
        let peer_speed = view.block_speed(ctx.lengths.default_block_length());
        ap.speed == 0 || peer_speed.saturating_mul(cfg.fit_slower_factor) >= ap.speed
    }

    fn resume_score(&self, ctx: &PassCtx<'_>, view: &PeerView, ap: &ActivePiece) -> Score {
        let cfg = ctx.config;
        let mut s = self.priority.score(ap.piece) + view.priority_offset(ap.piece);
        s += ap.speed as Score;
        if view.last_piece == Some(ap.piece) {
            s += cfg.same_piece_bonus;
        }
        let idle = ctx.now.saturating_duration_since(ap.last_activity);
        let ramp = cfg.staleness_ramp.as_secs_f64();
        let staleness = if ramp > 0. {
            (idle.as_secs_f64() / ramp).min(1.)
        } else {
            1.
        };
        s += (cfg.staleness_bonus as f64 * staleness) as Score;
        s += (cfg.near_completion_bonus as f64 * ap.written_fraction()) as Score;
        s
    }

    fn start_key(&self, score: Score, avail: u32) -> StartKey {
        if score >= PRIORITY_OVERRIDES_RAREST {
            (2, score, -(avail as Score))
        } else if self.rarest_allowed > 0 {
            (1, -(avail as Score), score)
        } else {
            (1, score, -(avail as Score))
        }
    }

    /// The reservation, hint or resume/start choice for the next blocks of `view`.
    pub(crate) fn get_request_candidate(
        &mut self,
        ctx: &PassCtx<'_>,
        view: &PeerView,
    ) -> Option<Candidate> {
        if let Some(c) = self.reserved_candidate(view) {
            return Some(c);
        }
        if let Some(c) = self.hint_candidate(ctx, view) {
            return Some(c);
        }

        let mut best_resume: Option<ResumeChoice> = None;
        let mut second_choice: Option<ResumeChoice> = None;
        let mut start_key: Option<StartKey> = None;
        let mut start_set: Vec<ValidPieceIndex> = Vec::new();

        for idx in view.haves.iter() {
            let Some(piece) = ctx.lengths.validate_piece_index(idx) else {
                continue;
            };
            if !self.is_schedulable_piece(ctx, piece) {
                continue;
            }
            let avail = ctx.avail(piece);

            if let Some(ap) = self.active.get(&piece) {
                if ap.is_reserved_for_other(view.handle) || !ap.has_unrequested() {
                    continue;
                }
                let choice = ResumeChoice {
                    piece,
                    avail,
                    adjusted: self.resume_score(ctx, view, ap),
                };
                if self.fits(ctx, view, ap) {
                    let better = match &best_resume {
                        None => true,
                        Some(b) => match avail.cmp(&b.avail) {
                            Ordering::Less => true,
                            Ordering::Equal => choice.adjusted > b.adjusted,
                            Ordering::Greater => false,
                        },
                    };
                    if better {
                        best_resume = Some(choice);
                    }
                } else if second_choice.as_ref().is_none_or(|s| avail > s.avail) {
                    second_choice = Some(choice);
                }
                continue;
            }

            let score = self.priority.score(piece) + view.priority_offset(piece);
            let key = self.start_key(score, avail);
            match start_key.map(|k| key.cmp(&k)) {
                None | Some(Ordering::Greater) => {
                    start_key = Some(key);
                    start_set.clear();
                    start_set.push(piece);
                }
                Some(Ordering::Equal) => start_set.push(piece),
                Some(Ordering::Less) => {}
            }
        }

        let start = self.pick_start(&start_set);
        let resume = match (best_resume, start) {
            (Some(r), _) => Some(r),
            (None, None) => second_choice,
            (None, Some(_)) => None,
        };

        let choose_resume = match (&resume, start) {
            (None, None) => return None,
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (Some(r), Some(s)) => {
                if r.avail <= self.summary.global_min_others {
                    true
                } else if self.active.len() > ctx.config.resume_ratio_active_threshold {
                    let start_score = self.priority.score(s) + view.priority_offset(s);
                    let resume_ratio = r.adjusted as f64 / r.avail.max(1) as f64;
                    let start_ratio =
                        start_score as f64 / self.summary.global_min_others.max(1) as f64;
                    resume_ratio >= start_ratio
                } else {
                    false
                }
            }
        };

        let c = match (choose_resume, resume, start) {
            (true, Some(r), _) => Candidate {
                piece: r.piece,
                from_block: 0,
                kind: CandidateKind::Resume,
            },
            (_, _, Some(s)) => Candidate {
                piece: s,
                from_block: 0,
                kind: CandidateKind::Start,
            },
            _ => return None,
        };
        trace!(peer = %view.handle, piece = %c.piece, kind = ?c.kind, "request candidate");
        Some(c)
    }

    fn pick_start(&mut self, set: &[ValidPieceIndex]) -> Option<ValidPieceIndex> {
        if set.is_empty() {
            return None;
        }
        match self.sequential {
            Some(seq) if seq.descending => set.iter().max().copied(),
            Some(_) => set.iter().min().copied(),
            None => Some(set[self.rng.random_range(0..set.len())]),
        }
    }

    fn reserved_candidate(&mut self, view: &PeerView) -> Option<Candidate> {
        let sched = self.peers.get_mut(&view.handle)?;
        let mut found = None;
        let mut stale = Vec::new();
        for piece in sched.reserved.iter().copied() {
            let valid = self.priority.is_needed(piece)
                && self.active.get(&piece).is_some_and(|ap| {
                    ap.reserved_by == Some(view.handle) && ap.has_unrequested()
                });
            if !valid {
                stale.push(piece);
            } else if found.is_none() {
                found = Some(piece);
            }
        }
        for piece in stale {
            sched.reserved.remove(&piece);
            if let Some(ap) = self.active.get_mut(&piece) {
                if ap.reserved_by == Some(view.handle) {
                    ap.reserved_by = None;
                }
            }
        }
        found.map(|piece| Candidate {
            piece,
            from_block: 0,
            kind: CandidateKind::Reserved,
        })
    }

    fn hint_candidate(&self, ctx: &PassCtx<'_>, view: &PeerView) -> Option<Candidate> {
        let hint = view.snapshot.request_hint.or(self.global_hint)?;
        let (piece, block) = hint.resolve(ctx.lengths)?;
        if !view.haves.has(piece) || !self.is_schedulable_piece(ctx, piece) {
            return None;
        }
        if let Some(ap) = self.active.get(&piece) {
            if ap.is_reserved_for_other(view.handle) || !ap.has_unrequested() {
                return None;
            }
        }
        Some(Candidate {
            piece,
            from_block: block,
            kind: CandidateKind::Hint,
        })
    }
}
