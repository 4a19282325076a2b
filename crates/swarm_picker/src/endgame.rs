//! Redundant requesting for the tail of a transfer.
//!
//! ```text
//!   Normal --try_enter--> EndGame --queue empty--> Normal
//!                            |
//!                            +------timeout------> Abandoned (terminal)
//! ```

use std::{collections::VecDeque, time::Instant};

use picker_core::ValidPieceIndex;
use serde::Serialize;
use tracing::info;

use crate::{config::SchedulerConfig, type_aliases::PeerHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EndGameState {
    Normal,
    EndGame,
    Abandoned,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndGameChunk {
    pub piece: ValidPieceIndex,
    pub block: u32,
    /// How many times the chunk was handed out.
    pub requests: u32,
    /// Peers it was handed out to.
    pub peers: Vec<PeerHandle>,
}

pub struct EndGameController {
    state: EndGameState,
    queue: VecDeque<EndGameChunk>,
    entered_at: Option<Instant>,
    // Set once a real-time provider shows up, end-game never runs afterwards.
    disabled: bool,
    entries: u64,
}

/// What [`EndGameController::try_enter`] needs to know about the rest of the transfer.
pub struct EndGameEntryCheck {
    pub peers: usize,
    /// Every downloadable piece is active with no unrequested blocks, or reserved.
    pub all_requested: bool,
    /// Bytes of downloadable pieces not written yet.
    pub remaining_bytes: u64,
    /// Sequential ordering or forced pieces are in effect.
    pub playback_active: bool,
}

impl Default for EndGameController {
    fn default() -> Self {
        Self::new()
    }
}

impl EndGameController {
    pub fn new() -> Self {
        Self {
            state: EndGameState::Normal,
            queue: VecDeque::new(),
            entered_at: None,
            disabled: false,
            entries: 0,
        }
    }

    pub fn state(&self) -> EndGameState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == EndGameState::EndGame
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn entries(&self) -> u64 {
        self.entries
    }

    pub fn disable(&mut self) {
        if !self.disabled {
            info!("end-game disabled for the rest of the transfer");
        }
        self.disabled = true;
        if self.state == EndGameState::EndGame {
            self.queue.clear();
            self.entered_at = None;
            self.state = EndGameState::Normal;
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    /// Enter end-game with the given chunks if the conditions hold.
    pub fn try_enter(
        &mut self,
        config: &SchedulerConfig,
        check: &EndGameEntryCheck,
        now: Instant,
        chunks: impl FnOnce() -> Vec<(ValidPieceIndex, u32)>,
    ) -> bool {
        if self.state != EndGameState::Normal
            || self.disabled
            || !config.end_game_enabled
            || check.peers < config.end_game_min_peers
            || !check.all_requested
        {
            return false;
        }
        let trigger = if check.playback_active {
            config.end_game_reduced_trigger
        } else {
            config.end_game_size_trigger
        };
        if check.remaining_bytes >= trigger {
            return false;
        }
        let chunks = chunks();
        if chunks.is_empty() {
            return false;
        }
        self.queue = chunks
            .into_iter()
            .map(|(piece, block)| EndGameChunk {
                piece,
                block,
                requests: 0,
                peers: Vec::new(),
            })
            .collect();
        self.state = EndGameState::EndGame;
        self.entered_at = Some(now);
        self.entries += 1;
        info!(
            chunks = self.queue.len(),
            remaining_bytes = check.remaining_bytes,
            "entering end-game"
        );
        true
    }

    /// Give up on end-game if it ran for too long. Returns true on the transition.
    pub fn check_timeout(&mut self, config: &SchedulerConfig, now: Instant) -> bool {
        if self.state != EndGameState::EndGame {
            return false;
        }
        let Some(entered) = self.entered_at else {
            return false;
        };
        if now.saturating_duration_since(entered) < config.end_game_timeout {
            return false;
        }
        info!(
            remaining_chunks = self.queue.len(),
            "end-game timed out, abandoning"
        );
        self.queue.clear();
        self.state = EndGameState::Abandoned;
        true
    }

    /// Rotate through the queue and hand out the first chunk `accept` takes.
    ///
    /// The chunk moves to the tail whether or not it was taken, so redundancy spreads
    /// round-robin across the queue.
    pub fn next_for_peer(
        &mut self,
        peer: PeerHandle,
        mut accept: impl FnMut(&EndGameChunk) -> bool,
    ) -> Option<EndGameChunk> {
        if self.state != EndGameState::EndGame {
            return None;
        }
        for _ in 0..self.queue.len() {
            let mut chunk = self.queue.pop_front()?;
            let take = !chunk.peers.contains(&peer) && accept(&chunk);
            if take {
                chunk.requests += 1;
                chunk.peers.push(peer);
            }
            let out = take.then(|| chunk.clone());
            self.queue.push_back(chunk);
            if out.is_some() {
                return out;
            }
        }
        None
    }

    /// A request handed out by `next_for_peer` failed to send.
    pub fn on_send_failed(&mut self, piece: ValidPieceIndex, block: u32, peer: PeerHandle) {
        if let Some(c) = self
            .queue
            .iter_mut()
            .find(|c| c.piece == piece && c.block == block)
        {
            c.peers.retain(|p| *p != peer);
        }
    }

    /// Peers that still have the chunk outstanding, if it was queued.
    pub fn on_block_written(&mut self, piece: ValidPieceIndex, block: u32) -> Vec<PeerHandle> {
        let Some(pos) = self
            .queue
            .iter()
            .position(|c| c.piece == piece && c.block == block)
        else {
            return Vec::new();
        };
        let chunk = self.queue.remove(pos).map(|c| c.peers).unwrap_or_default();
        self.maybe_leave();
        chunk
    }

    pub fn on_piece_done(&mut self, piece: ValidPieceIndex) {
        self.queue.retain(|c| c.piece != piece);
        self.maybe_leave();
    }

    pub fn on_peer_removed(&mut self, peer: PeerHandle) {
        for c in self.queue.iter_mut() {
            c.peers.retain(|p| *p != peer);
        }
    }

    /// Queue more chunks (e.g. a piece failed verification and needs re-downloading).
    pub fn add_chunks(&mut self, chunks: impl IntoIterator<Item = (ValidPieceIndex, u32)>) {
        if self.state != EndGameState::EndGame {
            return;
        }
        for (piece, block) in chunks {
            if self
                .queue
                .iter()
                .any(|c| c.piece == piece && c.block == block)
            {
                continue;
            }
            self.queue.push_back(EndGameChunk {
                piece,
                block,
                requests: 0,
                peers: Vec::new(),
            });
        }
    }

    fn maybe_leave(&mut self) {
        if self.state == EndGameState::EndGame && self.queue.is_empty() {
            info!("end-game queue drained, back to normal");
            self.state = EndGameState::Normal;
            self.entered_at = None;
        }
    }
}
