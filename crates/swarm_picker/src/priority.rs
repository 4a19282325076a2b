//! Per-piece scores.
//!
//! A piece's score is built from the files it overlaps (user priority band, edge and
//! completion boosts), then rarity, then at most one override tier. The tiers are
//! numerically separated so that comparing two scores is enough to rank pieces:
//!
//! ```text
//!   file bands + boosts + rarity   <  PRIORITY_OVERRIDES_RAREST
//!   sequential                     in [PRIORITY_SEQUENTIAL_BASE, PRIORITY_FORCED)
//!   forced (+ provider deltas)     in [PRIORITY_FORCED, PRIORITY_REALTIME)
//!   deadline from a provider       == PRIORITY_REALTIME
//! ```

use std::time::Instant;

use picker_core::ValidPieceIndex;
use tracing::{debug, trace};

use crate::{
    availability::AvailabilitySummary, config::SchedulerConfig, files::FileTable,
    pieces::PieceStates, providers::ProviderInputs, type_aliases::{BF, Score},
};

pub const PRIORITY_W_FILE_BASE: Score = 1_000;
pub const PRIORITY_W_FILE_RANGE: Score = 100_000;
pub const PRIORITY_W_EDGE_BAND: Score = 50_000;
pub const PRIORITY_W_FIRSTLAST: Score = 999;
pub const MAX_FILE_PRIORITY: i32 = 64;
pub const PRIORITY_W_COMPLETION: Score = 2_000;
pub const PRIORITY_W_RARE: Score = 1_300;
pub const PRIORITY_RARITY_CAP: Score = 10_000;
/// Scores at or above this rank pieces by score alone, ignoring rarest-first.
pub const PRIORITY_OVERRIDES_RAREST: Score = 10_000_000;
pub const PRIORITY_SEQUENTIAL_BASE: Score = 1_000_000_000;
pub const PRIORITY_FORCED: Score = 100_000_000_000;
pub const PRIORITY_REALTIME: Score = 1_000_000_000_000_000;

pub const NOT_NEEDED: Score = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sequential {
    pub start: u32,
    pub descending: bool,
}

impl Sequential {
    /// How far along the walk the piece is, `None` if the walk never reaches it.
    pub fn distance(&self, piece: u32) -> Option<u32> {
        if self.descending {
            self.start.checked_sub(piece)
        } else {
            piece.checked_sub(self.start)
        }
    }
}

pub struct PriorityInputs<'a> {
    pub config: &'a SchedulerConfig,
    pub pieces: &'a PieceStates,
    pub files: &'a FileTable,
    pub availability: &'a [u32],
    pub summary: &'a AvailabilitySummary,
    pub peer_count: u32,
    pub rarest_allowed: bool,
    pub providers: &'a ProviderInputs,
    pub forced: &'a BF,
    pub sequential: Option<Sequential>,
}

pub struct PriorityEngine {
    scores: Vec<Score>,
    needed: BF,
    deadlines: Vec<Option<Instant>>,
    has_needed: bool,
    needed_change_count: u64,
    realtime_count: u32,

    dirty: bool,
    last_refresh: Option<Instant>,
    seen_config_version: u64,
    seen_provider_version: u64,
}

impl PriorityEngine {
    pub fn new(total_pieces: u32) -> Self {
        let n = total_pieces as usize;
        Self {
            scores: vec![NOT_NEEDED; n],
            needed: BF::repeat(false, n),
            deadlines: vec![None; n],
            has_needed: false,
            needed_change_count: 0,
            realtime_count: 0,
            dirty: true,
            last_refresh: None,
            seen_config_version: 0,
            seen_provider_version: 0,
        }
    }

    /// Force a recomputation on the next refresh.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn needs_refresh(
        &self,
        now: Instant,
        config: &SchedulerConfig,
        config_version: u64,
        provider_version: u64,
    ) -> bool {
        if self.dirty
            || config_version != self.seen_config_version
            || provider_version != self.seen_provider_version
        {
            return true;
        }
        match self.last_refresh {
            None => true,
            Some(t) => now.saturating_duration_since(t) >= config.priority_refresh_interval,
        }
    }

    pub fn recompute(
        &mut self,
        inputs: &PriorityInputs<'_>,
        now: Instant,
        config_version: u64,
        provider_version: u64,
    ) {
        let lengths = *inputs.pieces.lengths();
        let mut needed = BF::repeat(false, self.scores.len());
        let mut realtime_count = 0;

        for info in lengths.iter_piece_infos() {
            let piece = info.piece_index;
            let idx = piece.as_usize();
            self.deadlines[idx] = None;
            let score = if inputs.pieces.is_done(piece) {
                NOT_NEEDED
            } else {
                self.piece_score(inputs, piece)
            };
            if score >= 0 {
                needed.set(idx, true);
                if score == PRIORITY_REALTIME {
                    self.deadlines[idx] = inputs.providers.deadline(idx);
                    realtime_count += 1;
                }
            }
            self.scores[idx] = score;
        }

        let has_needed = needed.any();
        if needed != self.needed {
            self.needed_change_count += 1;
            if has_needed != self.has_needed {
                debug!(has_needed, "schedulable state changed");
            }
        }
        self.needed = needed;
        self.has_needed = has_needed;
        self.realtime_count = realtime_count;
        self.dirty = false;
        self.last_refresh = Some(now);
        self.seen_config_version = config_version;
        self.seen_provider_version = provider_version;
        trace!(realtime_count, "recomputed piece priorities");
    }

    fn base_score(inputs: &PriorityInputs<'_>, piece: ValidPieceIndex) -> Score {
        let cfg = inputs.config;
        let total_length = inputs.pieces.lengths().total_length().max(1);
        let k = cfg.edge_pieces as Score;
        let mut best = NOT_NEEDED;
        for f in inputs.files.files_for_piece(piece) {
            if f.is_skipped() || f.is_complete() {
                continue;
            }
            let prio = f.priority.min(MAX_FILE_PRIORITY) as Score;
            let mut s = PRIORITY_W_FILE_BASE + prio * PRIORITY_W_FILE_RANGE;

            if cfg.first_last_boost && k > 0 && f.piece_count() > cfg.edge_min_file_pieces {
                let p = piece.get();
                let d = (p - f.first_piece).min(f.last_piece - p) as Score;
                if d < k {
                    s += PRIORITY_W_EDGE_BAND + PRIORITY_W_FIRSTLAST * (k - d) / k;
                }
            }

            if f.downloaded as f64 >= f.length as f64 * cfg.completion_boost_threshold {
                let share = (PRIORITY_W_COMPLETION as u128 * f.length as u128
                    / total_length as u128) as Score;
                s += share.max(1);
            }
            best = best.max(s);
        }
        best
    }

    fn piece_score(&self, inputs: &PriorityInputs<'_>, piece: ValidPieceIndex) -> Score {
        let idx = piece.as_usize();
        let mut s = Self::base_score(inputs, piece);
        if s < 0 {
            return NOT_NEEDED;
        }

        let avail = inputs.availability.get(idx).copied().unwrap_or(0);
        if inputs.peer_count > avail {
            s += ((inputs.peer_count - avail) as Score).min(PRIORITY_RARITY_CAP);
        }
        if inputs.rarest_allowed && avail > 0 && avail <= inputs.summary.global_min_others {
            s += PRIORITY_W_RARE;
        }

        let forced = inputs.forced.get(idx).map(|b| *b).unwrap_or(false);
        let delta = inputs.providers.delta(idx);
        if inputs.providers.deadline(idx).is_some() {
            return PRIORITY_REALTIME;
        }
        if delta != 0 {
            return if forced {
                (PRIORITY_FORCED + s)
                    .saturating_add(delta)
                    .clamp(PRIORITY_FORCED, PRIORITY_REALTIME - 1)
            } else {
                s.saturating_add(delta).clamp(0, PRIORITY_FORCED - 1)
            };
        }
        if forced {
            return PRIORITY_FORCED + s;
        }
        if let Some(distance) = inputs.sequential.and_then(|seq| seq.distance(piece.get())) {
            let total = inputs.pieces.lengths().total_pieces() as Score;
            return PRIORITY_SEQUENTIAL_BASE + (total - distance as Score);
        }
        s
    }

    pub fn score(&self, piece: ValidPieceIndex) -> Score {
        self.scores.get(piece.as_usize()).copied().unwrap_or(NOT_NEEDED)
    }

    pub fn scores(&self) -> &[Score] {
        &self.scores
    }

    /// Needed and not done.
    pub fn is_needed(&self, piece: ValidPieceIndex) -> bool {
        self.needed.get(piece.as_usize()).map(|b| *b).unwrap_or(false)
    }

    pub fn deadline(&self, piece: ValidPieceIndex) -> Option<Instant> {
        self.deadlines.get(piece.as_usize()).copied().flatten()
    }

    pub fn has_needed(&self) -> bool {
        self.has_needed
    }

    pub fn needed_change_count(&self) -> u64 {
        self.needed_change_count
    }

    pub fn realtime_count(&self) -> u32 {
        self.realtime_count
    }

    pub fn iter_needed(&self) -> impl Iterator<Item = usize> + '_ {
        self.needed.iter_ones()
    }

    /// Forget a piece right away, without waiting for the next recomputation.
    pub fn on_piece_done(&mut self, piece: ValidPieceIndex) {
        let idx = piece.as_usize();
        if let Some(s) = self.scores.get_mut(idx) {
            *s = NOT_NEEDED;
        }
        if self.needed.get(idx).map(|b| *b).unwrap_or(false) {
            self.needed.set(idx, false);
            self.needed_change_count += 1;
            self.has_needed = self.needed.any();
        }
        self.deadlines[idx] = None;
        self.dirty = true;
    }
}
