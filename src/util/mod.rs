//! Utilities shared by the collector components: address arithmetic, options, logging, the
//! reader/writer spin lock, copy/scan buffers and the card table.

pub mod address;
pub mod constants;
pub mod conversions;
pub mod copy;
pub mod error;
pub mod heap;
pub mod logger;
#[macro_use]
pub mod options;
pub mod rw_spinlock;

#[cfg(any(test, feature = "test_private"))]
pub mod test_util;

pub use self::address::Address;
pub use self::address::ByteOffset;
pub use self::address::ByteSize;
