/// log2 of the number of bytes in a kilobyte
pub const LOG_BYTES_IN_KBYTE: u8 = 10;

#[cfg(target_pointer_width = "32")]
/// log2 of the number of bytes in an address
pub const LOG_BYTES_IN_ADDRESS: u8 = 2;
#[cfg(target_pointer_width = "64")]
/// log2 of the number of bytes in an address
pub const LOG_BYTES_IN_ADDRESS: u8 = 3;
/// The number of bytes in an address
pub const BYTES_IN_ADDRESS: usize = 1 << LOG_BYTES_IN_ADDRESS;

/// log2 of the number of heap bytes covered by one card
pub const LOG_BYTES_IN_CARD: u8 = 9;
/// The number of heap bytes covered by one card
pub const BYTES_IN_CARD: usize = 1 << LOG_BYTES_IN_CARD;

/// A card value meaning the card holds no unprocessed mutations.
pub const CARD_CLEAN: u8 = 0;
/// A card value meaning a mutator may have stored a reference into the card.
pub const CARD_DIRTY: u8 = 1;

/// Number of slots a worker must scan before it reports a sample to the throttle tracker.
pub const SLOTS_SCANNED_PER_THREAD_UPDATE: u64 = 512;
/// Number of thread samples aggregated into one published (major) update.
pub const THREAD_UPDATES_PER_MAJOR_UPDATE: u64 = 32;
/// Number of records in the throttle tracker's rolling history.
pub const UPDATE_HISTORY_SIZE: usize = 16;

/// Default copy/scan buffer size bounds.
pub const DEFAULT_MIN_CACHE_SIZE: usize = 8 << LOG_BYTES_IN_KBYTE;
pub const DEFAULT_MAX_CACHE_SIZE: usize = 128 << LOG_BYTES_IN_KBYTE;

/// Default number of entries in one remembered-set fragment.
pub const DEFAULT_SATB_FRAGMENT_SIZE: usize = 32;
/// Heap bytes that entitle the remembered set to one more pooled fragment.
pub const LOG_HEAP_BYTES_PER_POOLED_FRAGMENT: u8 = 16;
/// The remembered-set pool never shrinks below this many fragments.
pub const MIN_POOLED_FRAGMENTS: usize = 64;
