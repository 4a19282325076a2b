/// The default size of a block (the smallest requestable unit of a piece).
pub const BLOCK_SIZE: u32 = 16384;
