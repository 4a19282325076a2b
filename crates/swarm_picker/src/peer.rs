use std::sync::Arc;

use picker_core::{BlockInfo, Lengths, ValidPieceIndex};
use serde::Serialize;

use crate::{
    haves::PeerHaves,
    type_aliases::{PeerHandle, Score},
};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PeerState {
    #[default]
    Connecting,
    Handshaking,
    Transferring,
    Closing,
    Disconnected,
}

impl PeerState {
    pub fn name(&self) -> &'static str {
        match self {
            PeerState::Connecting => "connecting",
            PeerState::Handshaking => "handshaking",
            PeerState::Transferring => "transferring",
            PeerState::Closing => "closing",
            PeerState::Disconnected => "disconnected",
        }
    }
}

impl std::fmt::Display for PeerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A byte range the caller would like fetched next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RequestHint {
    pub piece: u32,
    pub offset: u32,
    pub length: u32,
}

impl RequestHint {
    /// Returns the piece and the block the hint starts at, if the hint fits the geometry.
    pub fn resolve(&self, lengths: &Lengths) -> Option<(ValidPieceIndex, u32)> {
        let piece = lengths.validate_piece_index(self.piece)?;
        let piece_length = lengths.piece_length(piece);
        if self.length == 0 || self.offset.checked_add(self.length)? > piece_length {
            return None;
        }
        Some((piece, lengths.block_index_at(piece, self.offset)?))
    }
}

/// What a connection reports about itself once per scheduling pass.
#[derive(Debug, Clone, Default)]
pub struct PeerSnapshot {
    pub state: PeerState,
    /// Smoothed receive rate from this peer, bytes per second.
    pub receive_rate: u64,
    /// Smoothed send rate to this peer, bytes per second.
    pub send_rate: u64,
    /// Whether the receive rate was ever measured.
    pub rate_sampled: bool,
    pub snubbed: bool,
    pub lan_local: bool,
    /// The remote side is choking us.
    pub choked: bool,
    pub recently_unchoked: bool,
    /// Request queue depth the peer asked for, if any.
    pub advertised_max_requests: Option<u32>,
    /// Per-piece additions to the piece score, full length when present.
    pub priority_offsets: Option<Arc<[Score]>>,
    pub request_hint: Option<RequestHint>,
}

/// Opaque token identifying a request that went out on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestHandle(pub u64);

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    #[error("peer connection closed")]
    Closed,
    #[error("peer is choking us")]
    Choked,
    #[error("request queue full")]
    QueueFull,
    #[error("{0}")]
    Other(String),
}

/// The transport side of one remote peer.
///
/// `request` must not block: it either queues the request and returns a handle, or
/// fails right away.
pub trait PeerConnection: Send + Sync {
    fn snapshot(&self) -> PeerSnapshot;
    fn request(
        &self,
        block: &BlockInfo,
        realtime: bool,
    ) -> std::result::Result<RequestHandle, RequestError>;
    /// A redundant request became useless because another peer delivered the block.
    fn cancel(&self, _block: &BlockInfo) {}
}

/// Per-pass view of a peer: the connection snapshot plus the scheduler's own
/// bookkeeping, frozen for the duration of one pass.
#[derive(Clone)]
pub struct PeerView {
    pub handle: PeerHandle,
    pub snapshot: PeerSnapshot,
    pub haves: Arc<PeerHaves>,
    pub last_piece: Option<ValidPieceIndex>,
    pub consecutive_no_requests: u32,
    pub outstanding: u32,
}

impl PeerView {
    pub fn is_candidate(&self) -> bool {
        self.snapshot.state == PeerState::Transferring && !self.snapshot.choked
    }

    /// Receive rate in blocks per second.
    pub fn block_speed(&self, block_length: u32) -> u32 {
        (self.snapshot.receive_rate / block_length.max(1) as u64).min(u32::MAX as u64) as u32
    }

    pub fn priority_offset(&self, piece: ValidPieceIndex) -> Score {
        self.snapshot
            .priority_offsets
            .as_ref()
            .and_then(|o| o.get(piece.as_usize()).copied())
            .unwrap_or(0)
    }
}
