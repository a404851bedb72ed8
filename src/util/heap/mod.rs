//! Heap-side collaborators: the card table and the notification trait through which the heap
//! tells collector components that it grew or shrank.

pub mod card_table;

use crate::util::error::InitError;
use crate::util::Address;

/// Receives heap range add/remove notifications and resizes whatever backing storage it keeps
/// per heap byte.
pub trait HeapRangeListener: Send + Sync {
    /// `[low, high)` was added to the heap. `under_concurrent_collection` is set if the range
    /// belongs to a region that is already being collected concurrently.
    fn heap_add_range(
        &self,
        low: Address,
        high: Address,
        under_concurrent_collection: bool,
    ) -> Result<(), InitError>;

    /// `[low, high)` was removed from the heap.
    fn heap_remove_range(&self, low: Address, high: Address) -> Result<(), InitError>;
}
