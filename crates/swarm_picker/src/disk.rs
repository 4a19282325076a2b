use picker_core::{Lengths, ValidPieceIndex};
use serde::Serialize;

use crate::type_aliases::BF;

/// User priority of a file that downloads normally. Anything below means "skip".
pub const PRIORITY_BASELINE: i32 = 0;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileEntry {
    pub index: usize,
    pub offset: u64,
    pub length: u64,
    pub first_piece: u32,
    pub last_piece: u32,
    pub priority: i32,
    pub downloaded: u64,
    pub skipped: bool,
}

impl FileEntry {
    pub fn new(index: usize, offset: u64, length: u64, lengths: &Lengths) -> Self {
        let last_id = lengths.last_piece_id().get();
        let pl = lengths.default_piece_length() as u64;
        let first_piece = ((offset / pl) as u32).min(last_id);
        let last_piece = if length == 0 {
            first_piece
        } else {
            (((offset + length - 1) / pl) as u32).min(last_id)
        };
        Self {
            index,
            offset,
            length,
            first_piece,
            last_piece,
            priority: PRIORITY_BASELINE,
            downloaded: 0,
            skipped: false,
        }
    }

    pub fn piece_count(&self) -> u32 {
        self.last_piece - self.first_piece + 1
    }

    pub fn is_complete(&self) -> bool {
        self.downloaded >= self.length
    }

    pub fn is_skipped(&self) -> bool {
        self.skipped || self.priority < PRIORITY_BASELINE
    }

    pub fn contains_piece(&self, piece: u32) -> bool {
        self.length > 0 && self.first_piece <= piece && piece <= self.last_piece
    }

    /// How many bytes of this file live in the given piece.
    pub fn overlap_with_piece(&self, lengths: &Lengths, piece: ValidPieceIndex) -> u64 {
        let piece_start = lengths.piece_offset(piece);
        let piece_end = piece_start + lengths.piece_length(piece) as u64;
        let start = self.offset.max(piece_start);
        let end = (self.offset + self.length).min(piece_end);
        end.saturating_sub(start)
    }
}

/// Read side of the storage layer, consulted when the scheduler is built.
///
/// After construction the storage layer pushes changes in through the scheduler's
/// notification methods (`on_block_written`, `on_piece_done`, `set_file_priority` ...).
pub trait DiskLayer: Send + Sync {
    fn lengths(&self) -> Lengths;
    fn files(&self) -> anyhow::Result<Vec<FileEntry>>;
    fn is_piece_done(&self, piece: ValidPieceIndex) -> bool;
    fn is_block_written(&self, piece: ValidPieceIndex, block: u32) -> bool;
}

/// A storage snapshot kept entirely in memory.
#[derive(Clone)]
pub struct StaticDisk {
    lengths: Lengths,
    files: Vec<FileEntry>,
    done: BF,
    written: Vec<(ValidPieceIndex, u32)>,
}

impl StaticDisk {
    pub fn new(lengths: Lengths, file_lengths: &[u64]) -> Self {
        let mut offset = 0;
        let files = file_lengths
            .iter()
            .enumerate()
            .map(|(index, len)| {
                let f = FileEntry::new(index, offset, *len, &lengths);
                offset += len;
                f
            })
            .collect();
        Self {
            done: BF::repeat(false, lengths.total_pieces() as usize),
            lengths,
            files,
            written: Vec::new(),
        }
    }

    pub fn single_file(lengths: Lengths) -> Self {
        let total = lengths.total_length();
        Self::new(lengths, &[total])
    }

    pub fn with_done(mut self, piece: ValidPieceIndex) -> Self {
        self.done.set(piece.as_usize(), true);
        for f in self.files.iter_mut() {
            f.downloaded += f.overlap_with_piece(&self.lengths, piece);
        }
        self
    }

    pub fn with_written_block(mut self, piece: ValidPieceIndex, block: u32) -> Self {
        self.written.push((piece, block));
        self
    }

    pub fn with_file_priority(mut self, file: usize, priority: i32) -> Self {
        if let Some(f) = self.files.get_mut(file) {
            f.priority = priority;
        }
        self
    }
}

impl DiskLayer for StaticDisk {
    fn lengths(&self) -> Lengths {
        self.lengths
    }

    fn files(&self) -> anyhow::Result<Vec<FileEntry>> {
        Ok(self.files.clone())
    }

    fn is_piece_done(&self, piece: ValidPieceIndex) -> bool {
        self.done.get(piece.as_usize()).map(|b| *b).unwrap_or(false)
    }

    fn is_block_written(&self, piece: ValidPieceIndex, block: u32) -> bool {
        self.is_piece_done(piece) || self.written.contains(&(piece, block))
    }
}
