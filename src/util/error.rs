use crate::util::Address;
use thiserror::Error;

/// Failures while bringing up or tearing down a collector component. Any of these is fatal for
/// GC startup; nothing at this layer retries.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InitError {
    #[error("invalid value {value:?} for option {name}")]
    InvalidOption { name: String, value: String },
    #[error("heap range {low}..{high} is empty, inverted or not card aligned")]
    BadHeapRange { low: Address, high: Address },
    #[error("heap range {low}..{high} is not covered by the card table")]
    UncoveredHeapRange { low: Address, high: Address },
    #[error("failed to allocate {cards} card table entries")]
    CardTableAllocation { cards: usize },
    #[error("lock torn down while still held (state {state:#x})")]
    LockHeld { state: u32 },
}
