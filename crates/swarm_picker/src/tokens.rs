/// A shared byte budget that paces outgoing requests.
///
/// Replenishment belongs to whoever owns the dispenser. The scheduler only reads the
/// current balance, takes what it is about to request, and hands back what it did
/// not use.
pub trait TokenDispenser: Send + Sync {
    fn peek(&self) -> u64;
    /// Take up to `wanted` bytes, returns how many were granted.
    fn dispense(&self, wanted: u64) -> u64;
    fn return_unused(&self, bytes: u64);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Unlimited;

impl TokenDispenser for Unlimited {
    fn peek(&self) -> u64 {
        u64::MAX
    }

    fn dispense(&self, wanted: u64) -> u64 {
        wanted
    }

    fn return_unused(&self, _bytes: u64) {}
}
