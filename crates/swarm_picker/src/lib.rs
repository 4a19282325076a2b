//! Block and piece request scheduling for a swarm download.
//!
//! For every connected peer, on every pass, the [`Scheduler`] decides which piece and
//! which block of it to request next. It balances piece rarity across the swarm, user
//! file priorities, first/last-piece and completion boosts, forced and sequential
//! overrides, end-game redundancy and deadline-driven requests for streaming.
//!
//! # Quick usage example
//!
//! ```no_run
//! use std::sync::Arc;
//! use swarm_picker::*;
//!
//! # fn conn() -> Arc<dyn PeerConnection> { unimplemented!() }
//! let lengths = Lengths::new(10 * 262144, 262144, None).unwrap();
//! let disk = StaticDisk::new(lengths, &[10 * 262144]);
//! let scheduler = Scheduler::new(&disk, SchedulerOptions::default()).unwrap();
//!
//! let peer: PeerHandle = "10.0.0.2:6881".parse().unwrap();
//! scheduler.add_peer(peer, conn(), Some(PeerHaves::full(10))).unwrap();
//! let report = scheduler.schedule();
//! println!("issued {} requests", report.total_requests());
//! ```
//!
//! # Overview
//! Peer I/O reports events through [`Scheduler::add_peer`], [`Scheduler::on_have`],
//! [`Scheduler::on_block_written`] and friends, from any thread. A single loop calls
//! [`Scheduler::schedule`] periodically; requests go out through
//! [`PeerConnection::request`].

mod active_piece;
mod availability;
mod clock;
mod config;
mod disk;
mod endgame;
mod error;
mod files;
mod haves;
mod peer;
mod pieces;
mod priority;
mod providers;
mod realtime;
mod scheduler;
mod stats;
mod tokens;
mod type_aliases;

#[cfg(test)]
mod tests;

pub use availability::AvailabilitySummary;
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::SchedulerConfig;
pub use disk::{DiskLayer, FileEntry, PRIORITY_BASELINE, StaticDisk};
pub use endgame::EndGameState;
pub use error::{Error, Result};
pub use haves::PeerHaves;
pub use peer::{
    PeerConnection, PeerSnapshot, PeerState, RequestError, RequestHandle, RequestHint,
};
pub use pieces::BlockMarkingResult;
pub use priority::{
    NOT_NEEDED, PRIORITY_FORCED, PRIORITY_OVERRIDES_RAREST, PRIORITY_REALTIME,
    PRIORITY_SEQUENTIAL_BASE,
};
pub use providers::{PriorityProvider, ProviderId, RealTimeProvider};
pub use scheduler::{Scheduler, SchedulerOptions};
pub use stats::{RequestCounters, SchedulerStats, TickReport};
pub use tokens::{TokenDispenser, Unlimited};
pub use type_aliases::{PeerHandle, Score};

pub use picker_core::{BlockInfo, Lengths, ValidPieceIndex, speed_estimator::SpeedEstimator};

/// The cargo version of swarm-picker.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
