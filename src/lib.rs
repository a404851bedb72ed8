//! concgc is the work-distribution and coordination core of a parallel, generational copying
//! garbage collector. It does not allocate heap memory or trace object graphs itself: a runtime
//! plugs it in between its heap layout and its object scanner.
//!
//! The crate provides:
//!
//! * [`CopyScanBuffer`](util::copy::CopyScanBuffer): the copy/scan work buffer a GC worker owns
//!   while it evacuates objects, and a lock-free [pool](util::copy::pool::CopyScanBufferPool) that
//!   transfers buffers between workers.
//! * [`AdaptiveThrottleTracker`](util::copy::throttle::AdaptiveThrottleTracker): a lock-free,
//!   sampled aggregator that turns per-worker copy/scan/stall counts into a scaling factor for
//!   copy/scan buffer sizes.
//! * [`RwSpinlock`](util::rw_spinlock::RwSpinlock): a writer-priority reader/writer spin lock.
//! * [`IncrementalUpdateCardMarker`](plan::concurrent::incremental_update::IncrementalUpdateCardMarker):
//!   the card-table protocol used with an incremental-update barrier during concurrent marking.
//! * [`RememberedSetFragmentManager`](plan::concurrent::satb::RememberedSetFragmentManager):
//!   fragment-based remembered set for a snapshot-at-the-beginning barrier, with O(1)
//!   enable/disable.
//!
//! Options are read from `CONCGC_`-prefixed environment variables, see [`util::options`].

#[macro_use]
extern crate log;
#[cfg_attr(any(test, feature = "test_private"), macro_use)]
extern crate lazy_static;
#[macro_use]
extern crate static_assertions;

#[macro_use]
pub mod util;
pub mod plan;
pub mod scheduler;

pub use crate::plan::concurrent::incremental_update::IncrementalUpdateCardMarker;
pub use crate::plan::concurrent::satb::{RememberedSetFragment, RememberedSetFragmentManager};
pub use crate::plan::concurrent::{BarrierSelector, MutatorBarrier};
pub use crate::scheduler::{CopyScanWorker, CycleState};
pub use crate::util::copy::pool::CopyScanBufferPool;
pub use crate::util::copy::throttle::AdaptiveThrottleTracker;
pub use crate::util::copy::{CopyScanBuffer, HomeSpace};
pub use crate::util::error::InitError;
pub use crate::util::options::Options;
pub use crate::util::rw_spinlock::RwSpinlock;
pub use crate::util::Address;
