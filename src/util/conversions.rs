use crate::util::constants::*;
use crate::util::Address;

/* Alignment */

pub fn card_align_down(address: Address) -> Address {
    address.align_down(BYTES_IN_CARD)
}

pub fn card_align_up(address: Address) -> Address {
    address.align_up(BYTES_IN_CARD)
}

pub const fn raw_align_up(val: usize, align: usize) -> usize {
    // See https://github.com/rust-lang/rust/blob/e620d0f337d0643c757bab791fc7d88d63217704/src/libcore/alloc.rs#L192
    val.wrapping_add(align).wrapping_sub(1) & !align.wrapping_sub(1)
}

pub const fn raw_align_down(val: usize, align: usize) -> usize {
    val & !align.wrapping_sub(1)
}

pub const fn raw_is_aligned(val: usize, align: usize) -> bool {
    val & align.wrapping_sub(1) == 0
}

/// Round `val` up to the nearest multiple of `granule`. Unlike [`raw_align_up`], the granule
/// need not be a power of two.
pub const fn round_to_ceiling_u64(granule: u64, val: u64) -> u64 {
    val.div_ceil(granule) * granule
}

/* Conversion */

pub fn bytes_to_cards_up(bytes: usize) -> usize {
    (bytes + BYTES_IN_CARD - 1) >> LOG_BYTES_IN_CARD
}
