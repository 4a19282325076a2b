use crate::peer::RequestError;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid piece index {index}, transfer has {total} pieces")]
    InvalidPieceIndex { index: u32, total: u32 },

    #[error("invalid file index {index}, transfer has {total} files")]
    InvalidFileIndex { index: usize, total: usize },

    #[error("invalid range offset={offset} length={length} for piece {piece} of length {piece_length}")]
    InvalidRange {
        piece: u32,
        offset: u32,
        length: u32,
        piece_length: u32,
    },

    #[error("bitfield has {got} bytes, expected {expected}")]
    BitfieldLength { got: usize, expected: usize },

    #[error("peer {0} is not registered")]
    UnknownPeer(crate::type_aliases::PeerHandle),

    #[error("peer {0} is already registered")]
    PeerAlreadyRegistered(crate::type_aliases::PeerHandle),

    #[error("provider returned {got} entries, expected {expected}")]
    ProviderLength { got: usize, expected: usize },

    #[error("error sending request: {0:#}")]
    Request(
        #[from]
        #[source]
        RequestError,
    ),

    #[error("error reading disk layer: {0:#}")]
    Disk(#[source] anyhow::Error),
}

pub type Result<T> = core::result::Result<T, Error>;
