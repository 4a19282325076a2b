use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::{availability::AvailabilitySummary, endgame::EndGameState};

#[derive(Default, Debug)]
pub(crate) struct AtomicStats {
    pub ticks: AtomicU64,
    pub idle_ticks: AtomicU64,
    pub requests_issued: AtomicU64,
    pub requests_failed: AtomicU64,
    pub realtime_requests: AtomicU64,
    pub end_game_requests: AtomicU64,
    pub requests_rejected: AtomicU64,
    pub cancels_sent: AtomicU64,
    pub blocks_written: AtomicU64,
    pub pieces_done: AtomicU64,
    pub pieces_failed: AtomicU64,
}

impl AtomicStats {
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, value: u64) {
        counter.fetch_add(value, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RequestCounters {
    pub issued: u64,
    pub failed: u64,
    pub realtime: u64,
    pub end_game: u64,
    pub rejected: u64,
    pub cancels_sent: u64,
}

impl From<&AtomicStats> for RequestCounters {
    fn from(s: &AtomicStats) -> Self {
        Self {
            issued: AtomicStats::get(&s.requests_issued),
            failed: AtomicStats::get(&s.requests_failed),
            realtime: AtomicStats::get(&s.realtime_requests),
            end_game: AtomicStats::get(&s.end_game_requests),
            rejected: AtomicStats::get(&s.requests_rejected),
            cancels_sent: AtomicStats::get(&s.cancels_sent),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStats {
    pub ticks: u64,
    pub idle_ticks: u64,
    pub requests: RequestCounters,
    pub blocks_written: u64,
    pub pieces_done: u64,
    pub pieces_failed: u64,
    pub total_pieces: u32,
    pub done_pieces: u32,
    pub active_pieces: usize,
    pub peers: usize,
    pub end_game: EndGameState,
    pub end_game_queue: usize,
    /// Times end-game was entered.
    pub end_game_entries: u64,
    pub availability: AvailabilitySummary,
    pub availability_rebuilds: u64,
    pub availability_drift_corrections: u64,
    pub schedulable: bool,
    pub needed_change_count: u64,
    pub config_version: u64,
}

/// What one call to [`crate::Scheduler::schedule`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub tick: u64,
    /// Nothing was schedulable, the pass did no selection.
    pub idle: bool,
    pub peers_considered: usize,
    pub normal_requests: u32,
    pub realtime_requests: u32,
    pub end_game_requests: u32,
    pub failed_requests: u32,
}

impl TickReport {
    pub fn total_requests(&self) -> u32 {
        self.normal_requests + self.realtime_requests + self.end_game_requests
    }
}
