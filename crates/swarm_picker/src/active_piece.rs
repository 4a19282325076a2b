use std::time::Instant;

use picker_core::ValidPieceIndex;

use crate::type_aliases::PeerHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    Unrequested,
    Requested,
    Written,
}

/// One peer racing for a block of a deadline-bound piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RealTimeRequest {
    pub peer: PeerHandle,
    /// When the block is expected, `None` if the peer had no measurable rate.
    pub eta: Option<Instant>,
}

#[derive(Debug, Clone, Default)]
pub struct RealTimeData {
    racers: Vec<Vec<RealTimeRequest>>,
}

impl RealTimeData {
    fn new(blocks: u32) -> Self {
        Self {
            racers: vec![Vec::new(); blocks as usize],
        }
    }

    pub fn racers(&self, block: u32) -> &[RealTimeRequest] {
        self.racers
            .get(block as usize)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn add(&mut self, block: u32, req: RealTimeRequest) {
        if let Some(v) = self.racers.get_mut(block as usize) {
            v.push(req);
        }
    }

    pub fn remove_peer(&mut self, block: u32, peer: PeerHandle) -> bool {
        match self.racers.get_mut(block as usize) {
            Some(v) => {
                let before = v.len();
                v.retain(|r| r.peer != peer);
                v.len() != before
            }
            None => false,
        }
    }

    /// Drop every racer of a block, returning them.
    pub fn take(&mut self, block: u32) -> Vec<RealTimeRequest> {
        self.racers
            .get_mut(block as usize)
            .map(std::mem::take)
            .unwrap_or_default()
    }
}

/// A piece that has had at least one block requested and is not done yet.
#[derive(Debug, Clone)]
pub struct ActivePiece {
    pub piece: ValidPieceIndex,
    blocks: Vec<BlockState>,
    // Who holds each requested block on the normal path.
    owners: Vec<Option<PeerHandle>>,
    pub reserved_by: Option<PeerHandle>,
    /// Blocks per second of the fastest peer driving the piece, 0 if unknown.
    pub speed: u32,
    pub created: Instant,
    pub last_activity: Instant,
    pub availability_at_creation: u32,
    pub realtime: Option<RealTimeData>,
}

impl ActivePiece {
    pub fn new(
        piece: ValidPieceIndex,
        block_count: u32,
        is_written: impl Fn(u32) -> bool,
        now: Instant,
        availability: u32,
    ) -> Self {
        let blocks = (0..block_count)
            .map(|b| {
                if is_written(b) {
                    BlockState::Written
                } else {
                    BlockState::Unrequested
                }
            })
            .collect();
        Self {
            piece,
            blocks,
            owners: vec![None; block_count as usize],
            reserved_by: None,
            speed: 0,
            created: now,
            last_activity: now,
            availability_at_creation: availability,
            realtime: None,
        }
    }

    pub fn block_count(&self) -> u32 {
        self.blocks.len() as u32
    }

    pub fn block_state(&self, block: u32) -> Option<BlockState> {
        self.blocks.get(block as usize).copied()
    }

    pub fn owner(&self, block: u32) -> Option<PeerHandle> {
        self.owners.get(block as usize).copied().flatten()
    }

    pub fn realtime_mut(&mut self) -> &mut RealTimeData {
        let n = self.block_count();
        self.realtime.get_or_insert_with(|| RealTimeData::new(n))
    }

    /// First unrequested block at or after `from`, wrapping around.
    pub fn next_unrequested(&self, from: u32) -> Option<u32> {
        let n = self.blocks.len();
        let from = (from as usize).min(n);
        (from..n)
            .chain(0..from)
            .find(|b| self.blocks[*b] == BlockState::Unrequested)
            .map(|b| b as u32)
    }

    /// Unrequested blocks starting at `from`, stopping at the first one that isn't.
    pub fn contiguous_unrequested(&self, from: u32) -> impl Iterator<Item = u32> + '_ {
        self.blocks[(from as usize).min(self.blocks.len())..]
            .iter()
            .take_while(|s| **s == BlockState::Unrequested)
            .enumerate()
            .map(move |(i, _)| from + i as u32)
    }

    pub fn has_unrequested(&self) -> bool {
        self.blocks.contains(&BlockState::Unrequested)
    }

    pub fn unrequested_count(&self) -> u32 {
        self.blocks
            .iter()
            .filter(|s| **s == BlockState::Unrequested)
            .count() as u32
    }

    pub fn written_count(&self) -> u32 {
        self.blocks
            .iter()
            .filter(|s| **s == BlockState::Written)
            .count() as u32
    }

    pub fn written_fraction(&self) -> f64 {
        if self.blocks.is_empty() {
            return 0.;
        }
        self.written_count() as f64 / self.blocks.len() as f64
    }

    pub fn iter_unwritten(&self) -> impl Iterator<Item = u32> + '_ {
        self.blocks
            .iter()
            .enumerate()
            .filter(|(_, s)| **s != BlockState::Written)
            .map(|(i, _)| i as u32)
    }

    /// Claim an unrequested block. Returns false if someone else has it.
    pub fn mark_requested(
        &mut self,
        block: u32,
        peer: PeerHandle,
        peer_speed: u32,
        now: Instant,
    ) -> bool {
        match self.blocks.get_mut(block as usize) {
            Some(s @ BlockState::Unrequested) => {
                *s = BlockState::Requested;
                self.owners[block as usize] = Some(peer);
                self.speed = self.speed.max(peer_speed);
                self.last_activity = now;
                true
            }
            _ => false,
        }
    }

    /// Undo a claim, if it is still `peer`'s. Returns true if the block went back to
    /// unrequested.
    pub fn unmark_requested(&mut self, block: u32, peer: PeerHandle) -> bool {
        let i = block as usize;
        if self.blocks.get(i) != Some(&BlockState::Requested) {
            return false;
        }
        let racing = self
            .realtime
            .as_ref()
            .map(|rt| !rt.racers(block).is_empty())
            .unwrap_or(false);
        if self.owners[i] == Some(peer) || (self.owners[i].is_none() && !racing) {
            self.blocks[i] = BlockState::Unrequested;
            self.owners[i] = None;
            return true;
        }
        false
    }

    /// Record a real-time request. The block becomes requested if it wasn't.
    pub fn mark_realtime_requested(&mut self, block: u32, req: RealTimeRequest, now: Instant) {
        let i = block as usize;
        if let Some(s) = self.blocks.get_mut(i) {
            if *s == BlockState::Unrequested {
                *s = BlockState::Requested;
            }
            self.last_activity = now;
            self.realtime_mut().add(block, req);
        }
    }

    /// Remove a racer; the block goes back to unrequested when nobody races for it anymore.
    pub fn remove_racer(&mut self, block: u32, peer: PeerHandle) -> bool {
        let Some(rt) = self.realtime.as_mut() else {
            return false;
        };
        if !rt.remove_peer(block, peer) {
            return false;
        }
        let i = block as usize;
        if rt.racers(block).is_empty()
            && self.owners[i].is_none()
            && self.blocks[i] == BlockState::Requested
        {
            self.blocks[i] = BlockState::Unrequested;
        }
        true
    }

    pub fn mark_written(&mut self, block: u32, now: Instant) -> bool {
        match self.blocks.get_mut(block as usize) {
            Some(BlockState::Written) | None => false,
            Some(s) => {
                *s = BlockState::Written;
                self.owners[block as usize] = None;
                self.last_activity = now;
                true
            }
        }
    }

    /// Release everything `peer` holds in this piece. Returns the released blocks.
    pub fn release_peer(&mut self, peer: PeerHandle) -> Vec<u32> {
        let mut released = Vec::new();
        for i in 0..self.blocks.len() {
            let b = i as u32;
            if self.owners[i] == Some(peer) && self.unmark_requested(b, peer) {
                released.push(b);
            }
            if self.remove_racer(b, peer) && self.blocks[i] == BlockState::Unrequested {
                released.push(b);
            }
        }
        if self.reserved_by == Some(peer) {
            self.reserved_by = None;
        }
        if !released.is_empty() {
            self.speed = 0;
        }
        released
    }

    pub fn is_reserved_for_other(&self, peer: PeerHandle) -> bool {
        matches!(self.reserved_by, Some(r) if r != peer)
    }
}
