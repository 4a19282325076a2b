use std::net::SocketAddr;

pub type BF = bitvec::vec::BitVec<u8, bitvec::order::Msb0>;

pub type PeerHandle = SocketAddr;

/// A piece score. Negative means the piece is not needed.
pub type Score = i64;
