use std::ops::Range;

use picker_core::{Lengths, ValidPieceIndex};
use tracing::debug;

use crate::{disk::DiskLayer, type_aliases::BF};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockMarkingResult {
    PreviouslyCompleted,
    NotCompleted,
    /// All blocks of the piece are written, the piece awaits verification.
    AllWritten,
}

/// Local state of every piece: verified pieces and written blocks.
pub struct PieceStates {
    // Pieces fully downloaded and verified.
    done: BF,

    // One bit per block, `default_max_blocks_per_piece` bits reserved for every piece.
    // A written block is not necessarily valid yet.
    written: BF,

    done_count: u32,
    lengths: Lengths,
}

impl PieceStates {
    pub fn new(lengths: Lengths) -> Self {
        let total_blocks =
            lengths.total_pieces() as usize * lengths.default_max_blocks_per_piece() as usize;
        Self {
            done: BF::repeat(false, lengths.total_pieces() as usize),
            written: BF::repeat(false, total_blocks),
            done_count: 0,
            lengths,
        }
    }

    pub fn from_disk(disk: &dyn DiskLayer) -> Self {
        let lengths = disk.lengths();
        let mut s = Self::new(lengths);
        for info in lengths.iter_piece_infos() {
            let piece = info.piece_index;
            if disk.is_piece_done(piece) {
                s.mark_done(piece);
                continue;
            }
            for block in 0..lengths.blocks_per_piece(piece) {
                if disk.is_block_written(piece, block) {
                    s.mark_block_written(piece, block);
                }
            }
        }
        s
    }

    pub fn lengths(&self) -> &Lengths {
        &self.lengths
    }

    fn block_range(&self, piece: ValidPieceIndex) -> Range<usize> {
        let start = piece.as_usize() * self.lengths.default_max_blocks_per_piece() as usize;
        start..start + self.lengths.blocks_per_piece(piece) as usize
    }

    pub fn is_done(&self, piece: ValidPieceIndex) -> bool {
        self.done.get(piece.as_usize()).map(|b| *b).unwrap_or(false)
    }

    pub fn done_count(&self) -> u32 {
        self.done_count
    }

    pub fn done_bits(&self) -> &BF {
        &self.done
    }

    pub fn is_block_written(&self, piece: ValidPieceIndex, block: u32) -> bool {
        let r = self.block_range(piece);
        let idx = r.start + block as usize;
        idx < r.end && self.written.get(idx).map(|b| *b).unwrap_or(false)
    }

    pub fn mark_block_written(&mut self, piece: ValidPieceIndex, block: u32) -> BlockMarkingResult {
        if self.is_done(piece) {
            return BlockMarkingResult::PreviouslyCompleted;
        }
        let r = self.block_range(piece);
        let idx = r.start + block as usize;
        if idx < r.end {
            self.written.set(idx, true);
        }
        match self.written.get(r) {
            Some(s) if s.all() => BlockMarkingResult::AllWritten,
            _ => BlockMarkingResult::NotCompleted,
        }
    }

    /// Returns true only the first time the piece becomes done.
    pub fn mark_done(&mut self, piece: ValidPieceIndex) -> bool {
        if self.done.replace(piece.as_usize(), true) {
            return false;
        }
        self.done_count += 1;
        let r = self.block_range(piece);
        if let Some(s) = self.written.get_mut(r) {
            s.fill(true);
        }
        true
    }

    /// Verification failed: forget the piece's written blocks.
    pub fn mark_failed(&mut self, piece: ValidPieceIndex) -> bool {
        if self.is_done(piece) {
            return false;
        }
        debug!(%piece, "clearing written blocks of failed piece");
        let r = self.block_range(piece);
        if let Some(s) = self.written.get_mut(r) {
            s.fill(false);
        }
        true
    }

    pub fn is_complete(&self) -> bool {
        self.done_count == self.lengths.total_pieces()
    }
}
