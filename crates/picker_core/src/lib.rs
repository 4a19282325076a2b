pub mod constants;
pub mod lengths;
pub mod speed_estimator;

pub use lengths::{BlockInfo, Lengths, PieceInfo, ValidPieceIndex};
