use bitvec::{order::Msb0, slice::BitSlice};
use picker_core::ValidPieceIndex;

use crate::{
    error::{Error, Result},
    type_aliases::BF,
};

/// The set of pieces a remote peer advertised.
///
/// A fixed-size bitset that caches the number of set bits and the first/last set
/// index, so iteration only walks the populated span.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerHaves {
    bits: BF,
    count: u32,
    first: Option<u32>,
    last: Option<u32>,
}

impl PeerHaves {
    pub fn empty(total_pieces: u32) -> Self {
        Self {
            bits: BF::repeat(false, total_pieces as usize),
            count: 0,
            first: None,
            last: None,
        }
    }

    pub fn full(total_pieces: u32) -> Self {
        Self {
            bits: BF::repeat(true, total_pieces as usize),
            count: total_pieces,
            first: total_pieces.checked_sub(1).map(|_| 0),
            last: total_pieces.checked_sub(1),
        }
    }

    /// Build from a wire bitfield. Spare bits in the last byte are ignored.
    pub fn from_bytes(bytes: &[u8], total_pieces: u32) -> Result<Self> {
        let expected = (total_pieces as usize).div_ceil(8);
        if bytes.len() != expected {
            return Err(Error::BitfieldLength {
                got: bytes.len(),
                expected,
            });
        }
        let slice = BitSlice::<u8, Msb0>::from_slice(bytes);
        Ok(Self::from_bits(&slice[..total_pieces as usize]))
    }

    pub fn from_bits(bits: &BitSlice<u8, Msb0>) -> Self {
        let bits: BF = bits.to_bitvec();
        Self {
            count: bits.count_ones() as u32,
            first: bits.first_one().map(|i| i as u32),
            last: bits.last_one().map(|i| i as u32),
            bits,
        }
    }

    pub fn from_indices(total_pieces: u32, indices: impl IntoIterator<Item = u32>) -> Self {
        let mut h = Self::empty(total_pieces);
        for idx in indices {
            if (idx as usize) < h.bits.len() {
                h.set_index(idx);
            }
        }
        h
    }

    /// Returns true if the piece was not set before.
    pub fn set(&mut self, piece: ValidPieceIndex) -> bool {
        self.set_index(piece.get())
    }

    fn set_index(&mut self, idx: u32) -> bool {
        if self.bits.replace(idx as usize, true) {
            return false;
        }
        self.count += 1;
        self.first = Some(self.first.map_or(idx, |f| f.min(idx)));
        self.last = Some(self.last.map_or(idx, |l| l.max(idx)));
        true
    }

    pub fn has(&self, piece: ValidPieceIndex) -> bool {
        self.has_index(piece.as_usize())
    }

    pub fn has_index(&self, idx: usize) -> bool {
        self.bits.get(idx).map(|b| *b).unwrap_or(false)
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn is_seed(&self) -> bool {
        self.count as usize == self.bits.len()
    }

    pub fn first(&self) -> Option<u32> {
        self.first
    }

    pub fn last(&self) -> Option<u32> {
        self.last
    }

    /// Iterate over set piece indices in ascending order. Every call starts over.
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        let (first, last) = match (self.first, self.last) {
            (Some(f), Some(l)) => (f as usize, l as usize),
            _ => (0, 0),
        };
        let span = if self.count == 0 {
            &self.bits[0..0]
        } else {
            &self.bits[first..=last]
        };
        span.iter_ones().map(move |i| (i + first) as u32)
    }
}
