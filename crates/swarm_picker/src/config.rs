use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_with::serde_as;

use crate::type_aliases::Score;

/// Every tunable of the scheduler.
///
/// The value is immutable once handed to the scheduler. To change parameters build a
/// new one and pass it to [`crate::Scheduler::reconfigure`], which bumps the config
/// version and forces the next priority recomputation.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Boost the first and last pieces of every file.
    pub first_last_boost: bool,
    /// How many pieces at each end of a file get the edge boost.
    pub edge_pieces: u32,
    /// Files with this many pieces or fewer get no edge boost.
    pub edge_min_file_pieces: u32,
    /// Fraction of a file that must be downloaded before the completion boost kicks in.
    pub completion_boost_threshold: f64,

    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    pub availability_refresh_interval: Duration,
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    pub availability_rebuild_interval: Duration,
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    pub priority_refresh_interval: Duration,

    /// Base request budget for peers that unchoked us recently.
    pub requests_min_unchoked: u32,
    /// Base request budget for everyone else.
    pub requests_min: u32,
    pub requests_max: u32,
    /// One extra outstanding request per this many bytes/s of receive rate.
    pub requests_slope_bps: u64,
    pub requests_snubbed: u32,
    /// A peer is topped up only once its outstanding count drops below this fraction of its budget.
    pub batch_locality: f64,
    pub no_request_backoff_cap: u32,

    /// Above this many active pieces, resume and start candidates are compared by
    /// score/availability ratio.
    pub resume_ratio_active_threshold: usize,
    pub rarest_min_pieces_done: u32,
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    pub startup_grace: Duration,

    /// A peer this many times slower than the one driving a piece may not resume it.
    pub fit_slower_factor: u32,
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    pub snubbed_resume_idle: Duration,
    /// Pieces started by peers slower than this are reserved to them.
    pub reserve_below_bps: u64,

    pub same_piece_bonus: Score,
    pub staleness_bonus: Score,
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    pub staleness_ramp: Duration,
    pub near_completion_bonus: Score,

    pub end_game_enabled: bool,
    pub end_game_min_peers: usize,
    pub end_game_size_trigger: u64,
    /// Trigger used while playback-style ordering (sequential or forced pieces) is active.
    pub end_game_reduced_trigger: u64,
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    pub end_game_timeout: Duration,

    /// Seed for tie-breaking randomness. Random if not set.
    pub rng_seed: Option<u64>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            first_last_boost: true,
            edge_pieces: 2,
            edge_min_file_pieces: 4,
            completion_boost_threshold: 0.9,

            availability_refresh_interval: Duration::from_secs(1),
            availability_rebuild_interval: Duration::from_secs(5 * 60),
            priority_refresh_interval: Duration::from_secs(1),

            requests_min_unchoked: 2,
            requests_min: 8,
            requests_max: 256,
            requests_slope_bps: 4096,
            requests_snubbed: 2,
            batch_locality: 0.6,
            no_request_backoff_cap: 8,

            resume_ratio_active_threshold: 32,
            rarest_min_pieces_done: 4,
            startup_grace: Duration::from_secs(10),

            fit_slower_factor: 4,
            snubbed_resume_idle: Duration::from_secs(10),
            reserve_below_bps: 8 * 1024,

            same_piece_bonus: 700,
            staleness_bonus: 900,
            staleness_ramp: Duration::from_secs(60),
            near_completion_bonus: 900,

            end_game_enabled: true,
            end_game_min_peers: 3,
            end_game_size_trigger: 20 * 1024 * 1024,
            end_game_reduced_trigger: 5 * 1024 * 1024,
            end_game_timeout: Duration::from_secs(120),

            rng_seed: None,
        }
    }
}
