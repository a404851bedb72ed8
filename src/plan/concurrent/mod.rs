//! Barrier strategies that keep concurrent marking correct while the mutator runs.
//!
//! A collector uses exactly one of them, picked by [`Options::concurrent_barrier`]:
//!
//! * [`IncrementalUpdateCardMarker`]: the barrier dirties the card of every slot written during
//!   concurrent marking, and the collector re-cleans dirty cards.
//! * [`RememberedSetFragmentManager`]: the barrier records the overwritten referent in a
//!   thread-local fragment (snapshot-at-the-beginning).

pub mod incremental_update;
pub mod satb;

use self::incremental_update::IncrementalUpdateCardMarker;
use self::satb::{RememberedSetFragment, RememberedSetFragmentManager};
use crate::util::heap::HeapRangeListener;
use crate::util::options::Options;
use crate::util::Address;
use std::sync::Arc;
use strum_macros::{Display, EnumString};

/// Which concurrent barrier a collector runs with.
#[derive(Copy, Clone, Debug, PartialEq, Eq, EnumString, Display)]
pub enum BarrierSelector {
    IncrementalUpdate,
    Satb,
}

/// The barrier shared by all mutators of one collector.
#[derive(Clone)]
pub enum MutatorBarrier {
    IncrementalUpdate(Arc<IncrementalUpdateCardMarker>),
    Satb(Arc<RememberedSetFragmentManager>),
}

impl MutatorBarrier {
    pub fn new(options: &Options) -> Self {
        let barrier = match options.concurrent_barrier {
            BarrierSelector::IncrementalUpdate => {
                MutatorBarrier::IncrementalUpdate(IncrementalUpdateCardMarker::new(options))
            }
            BarrierSelector::Satb => {
                MutatorBarrier::Satb(Arc::new(RememberedSetFragmentManager::new(options)))
            }
        };
        info!("Concurrent barrier: {}", barrier.selector());
        barrier
    }

    pub fn selector(&self) -> BarrierSelector {
        match self {
            MutatorBarrier::IncrementalUpdate(_) => BarrierSelector::IncrementalUpdate,
            MutatorBarrier::Satb(_) => BarrierSelector::Satb,
        }
    }

    /// The component that has to follow heap growth and shrinkage.
    pub fn heap_range_listener(&self) -> &dyn HeapRangeListener {
        match self {
            MutatorBarrier::IncrementalUpdate(marker) => marker.as_ref(),
            MutatorBarrier::Satb(manager) => manager.as_ref(),
        }
    }

    /// The barrier action for a reference store into `slot` that overwrites `old`.
    /// `fragment` is the storing thread's remembered-set fragment.
    pub fn object_reference_write(
        &self,
        fragment: &mut RememberedSetFragment,
        slot: Address,
        old: Option<Address>,
    ) {
        match self {
            MutatorBarrier::IncrementalUpdate(marker) => marker.mark_card_dirty(slot),
            MutatorBarrier::Satb(manager) => {
                if let Some(old) = old {
                    manager.store_in_fragment(fragment, old);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn selector_parses() {
        assert_eq!(
            BarrierSelector::from_str("Satb"),
            Ok(BarrierSelector::Satb)
        );
        assert!(BarrierSelector::from_str("satb_but_wrong").is_err());
        assert_eq!(BarrierSelector::IncrementalUpdate.to_string(), "IncrementalUpdate");
    }

    #[test]
    fn barrier_follows_options() {
        let mut options = Options::builtin();
        assert_eq!(
            MutatorBarrier::new(&options).selector(),
            BarrierSelector::IncrementalUpdate
        );
        options.concurrent_barrier = BarrierSelector::Satb;
        assert_eq!(MutatorBarrier::new(&options).selector(), BarrierSelector::Satb);
    }

    #[test]
    fn incremental_update_write_dirties_card() {
        let options = Options::builtin();
        let barrier = MutatorBarrier::new(&options);
        let low = Address::from_usize(0x100_0000);
        barrier
            .heap_range_listener()
            .heap_add_range(low, low + 0x1000usize, false)
            .unwrap();
        let mut fragment = RememberedSetFragment::new();
        barrier.object_reference_write(&mut fragment, low + 0x208usize, None);
        match &barrier {
            MutatorBarrier::IncrementalUpdate(marker) => {
                assert!(marker.card_table().is_card_dirty(low + 0x200usize));
                assert_eq!(marker.card_table().dirty_card_count(), 1);
            }
            MutatorBarrier::Satb(_) => unreachable!(),
        }
        assert!(fragment.is_empty());
    }

    #[test]
    fn satb_write_records_old_referent() {
        let mut options = Options::builtin();
        options.concurrent_barrier = BarrierSelector::Satb;
        let barrier = MutatorBarrier::new(&options);
        let mut fragment = RememberedSetFragment::new();
        let old = Address::from_usize(0x4000);
        let MutatorBarrier::Satb(manager) = &barrier else {
            unreachable!()
        };
        // Disabled outside of concurrent marking.
        barrier.object_reference_write(&mut fragment, Address::from_usize(0x8), Some(old));
        assert!(fragment.is_empty());

        manager.enable();
        barrier.object_reference_write(&mut fragment, Address::from_usize(0x8), Some(old));
        barrier.object_reference_write(&mut fragment, Address::from_usize(0x10), None);
        assert_eq!(fragment.entries(), &[old]);
    }
}
