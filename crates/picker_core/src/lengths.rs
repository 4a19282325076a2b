use serde::Serialize;

use crate::constants::BLOCK_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PieceInfo {
    pub piece_index: ValidPieceIndex,
    pub len: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    pub piece_index: ValidPieceIndex,
    pub block_index: u32,
    pub size: u32,
    pub offset: u32,
}

/// Geometry of a transfer: how the content splits into pieces and pieces into blocks.
#[derive(Debug, Clone, Copy)]
pub struct Lengths {
    block_length: u32,
    total_length: u64,
    piece_length: u32,
    last_piece_id: u32,
    last_piece_length: u32,
    max_blocks_per_piece: u32,
}

/// A piece index that was checked against [`Lengths`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ValidPieceIndex(u32);

impl std::fmt::Display for ValidPieceIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Debug for ValidPieceIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

impl ValidPieceIndex {
    pub const fn get(&self) -> u32 {
        self.0
    }

    pub const fn as_usize(&self) -> usize {
        self.0 as usize
    }
}

impl Lengths {
    pub fn new(
        total_length: u64,
        piece_length: u32,
        block_length: Option<u32>,
    ) -> anyhow::Result<Self> {
        let block_length = block_length.unwrap_or(BLOCK_SIZE);
        if !block_length.is_power_of_two() {
            anyhow::bail!("block length {block_length} is not a power of 2");
        }
        if block_length > piece_length {
            anyhow::bail!("block length {block_length} is larger than piece length {piece_length}");
        }
        if total_length == 0 {
            anyhow::bail!("nothing to transfer");
        }
        let total_pieces = total_length.div_ceil(piece_length as u64);
        let Ok(total_pieces) = u32::try_from(total_pieces) else {
            anyhow::bail!("{total_pieces} pieces don't fit in a u32 index");
        };
        let last_piece_length = match total_length % piece_length as u64 {
            0 => piece_length,
            rem => rem as u32,
        };
        Ok(Self {
            block_length,
            piece_length,
            total_length,
            max_blocks_per_piece: piece_length.div_ceil(block_length),
            last_piece_id: total_pieces - 1,
            last_piece_length,
        })
    }

    /// Size of a wire bitfield covering every piece.
    pub const fn piece_bitfield_bytes(&self) -> usize {
        self.total_pieces().div_ceil(8) as usize
    }
    pub const fn total_length(&self) -> u64 {
        self.total_length
    }
    pub const fn validate_piece_index(&self, index: u32) -> Option<ValidPieceIndex> {
        if index > self.last_piece_id {
            return None;
        }
        Some(ValidPieceIndex(index))
    }
    pub const fn default_piece_length(&self) -> u32 {
        self.piece_length
    }
    pub const fn default_block_length(&self) -> u32 {
        self.block_length
    }
    pub const fn default_max_blocks_per_piece(&self) -> u32 {
        self.max_blocks_per_piece
    }
    pub const fn last_piece_id(&self) -> ValidPieceIndex {
        ValidPieceIndex(self.last_piece_id)
    }
    pub const fn total_pieces(&self) -> u32 {
        self.last_piece_id + 1
    }
    pub const fn piece_length(&self, index: ValidPieceIndex) -> u32 {
        if index.0 == self.last_piece_id {
            return self.last_piece_length;
        }
        self.piece_length
    }
    pub const fn piece_offset(&self, index: ValidPieceIndex) -> u64 {
        index.0 as u64 * self.piece_length as u64
    }

    /// Which piece holds the byte at `offset` of the whole transfer.
    pub const fn piece_at_offset(&self, offset: u64) -> Option<ValidPieceIndex> {
        if offset >= self.total_length {
            return None;
        }
        Some(ValidPieceIndex((offset / self.piece_length as u64) as u32))
    }

    pub fn iter_piece_infos(&self) -> impl Iterator<Item = PieceInfo> + use<> {
        let last_id = self.last_piece_id;
        let last_len = self.last_piece_length;
        let pl = self.piece_length;
        (0..self.total_pieces()).map(move |idx| PieceInfo {
            piece_index: ValidPieceIndex(idx),
            len: if idx == last_id { last_len } else { pl },
        })
    }

    pub const fn blocks_per_piece(&self, index: ValidPieceIndex) -> u32 {
        if index.0 == self.last_piece_id {
            return self.last_piece_length.div_ceil(self.block_length);
        }
        self.max_blocks_per_piece
    }

    /// Size of a block; the last block of the last piece may be short.
    pub fn block_size(&self, piece_index: ValidPieceIndex, block_index: u32) -> Option<u32> {
        self.block_info(piece_index, block_index).map(|b| b.size)
    }

    pub fn block_info(&self, piece_index: ValidPieceIndex, block_index: u32) -> Option<BlockInfo> {
        if block_index >= self.blocks_per_piece(piece_index) {
            return None;
        }
        let offset = block_index * self.block_length;
        let size = (self.piece_length(piece_index) - offset).min(self.block_length);
        Some(BlockInfo {
            piece_index,
            block_index,
            size,
            offset,
        })
    }

    /// The block containing byte `offset` of a piece.
    pub fn block_index_at(&self, piece_index: ValidPieceIndex, offset: u32) -> Option<u32> {
        if offset >= self.piece_length(piece_index) {
            return None;
        }
        Some(offset / self.block_length)
    }
}
