use std::ops::Range;

use picker_core::{Lengths, ValidPieceIndex};

use crate::{
    disk::FileEntry,
    error::{Error, Result},
};

/// The files of a transfer, with a piece -> files index.
pub struct FileTable {
    files: Vec<FileEntry>,
    // For every piece, the range of file indices overlapping it.
    piece_files: Vec<Range<usize>>,
    lengths: Lengths,
}

impl FileTable {
    pub fn new(mut files: Vec<FileEntry>, lengths: Lengths) -> Self {
        files.sort_by_key(|f| (f.offset, f.index));
        let mut piece_files = Vec::with_capacity(lengths.total_pieces() as usize);
        let mut start = 0;
        for piece in 0..lengths.total_pieces() {
            while start < files.len()
                && (files[start].length == 0 || files[start].last_piece < piece)
            {
                start += 1;
            }
            let mut end = start;
            while end < files.len() && files[end].first_piece <= piece {
                end += 1;
            }
            piece_files.push(start..end);
        }
        Self {
            files,
            piece_files,
            lengths,
        }
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FileEntry> {
        self.files.iter()
    }

    pub fn get(&self, index: usize) -> Result<&FileEntry> {
        self.files
            .iter()
            .find(|f| f.index == index)
            .ok_or(Error::InvalidFileIndex {
                index,
                total: self.files.len(),
            })
    }

    fn get_mut(&mut self, index: usize) -> Result<&mut FileEntry> {
        let total = self.files.len();
        self.files
            .iter_mut()
            .find(|f| f.index == index)
            .ok_or(Error::InvalidFileIndex { index, total })
    }

    /// Non-empty files that have bytes in this piece.
    pub fn files_for_piece(&self, piece: ValidPieceIndex) -> impl Iterator<Item = &FileEntry> {
        let r = self
            .piece_files
            .get(piece.as_usize())
            .cloned()
            .unwrap_or(0..0);
        self.files[r]
            .iter()
            .filter(move |f| f.contains_piece(piece.get()))
    }

    /// Credit every overlapping file with the bytes of a completed piece.
    pub fn on_piece_done(&mut self, piece: ValidPieceIndex) {
        let r = self
            .piece_files
            .get(piece.as_usize())
            .cloned()
            .unwrap_or(0..0);
        let lengths = self.lengths;
        for f in &mut self.files[r] {
            if f.contains_piece(piece.get()) {
                f.downloaded = (f.downloaded + f.overlap_with_piece(&lengths, piece)).min(f.length);
            }
        }
    }

    pub fn reset_downloaded(&mut self) {
        for f in self.files.iter_mut() {
            f.downloaded = 0;
        }
    }

    /// Returns true if the value changed.
    pub fn set_priority(&mut self, index: usize, priority: i32) -> Result<bool> {
        let f = self.get_mut(index)?;
        let changed = f.priority != priority;
        f.priority = priority;
        Ok(changed)
    }

    /// Returns true if the value changed.
    pub fn set_skipped(&mut self, index: usize, skipped: bool) -> Result<bool> {
        let f = self.get_mut(index)?;
        let changed = f.skipped != skipped;
        f.skipped = skipped;
        Ok(changed)
    }
}
