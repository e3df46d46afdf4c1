//! Property-Based Tests for the Stripe Lifecycle
//!
//! # Test Properties
//!
//! 1. **Remaining monotonicity**: `blks_remaining` never increases
//! 2. **Refer/Derefer balance**: balanced sequences restore the count
//! 3. **Tail consumption**: consuming the tail yields exactly the unwritten
//!    range once, then nothing

#![cfg(test)]

use std::sync::Arc;

use proptest::prelude::*;

use crate::address::{VirtualBlkAddr, UNMAP_OFFSET, UNMAP_VSA};
use crate::config::AddressInfo;
use crate::mock::{
    CompletingFlushDispatcher, CountingQos, InMemoryStripeMap, InlineEventScheduler,
    RecordingReverseMap, RecordingStripeIoBackend, StaticVolumeInfo,
};

use super::context::AllocatorContext;
use super::stripe::Stripe;
use super::wb_stripe_manager::WbStripeManager;

const BLKS_PER_STRIPE: u32 = 64;

fn test_manager() -> WbStripeManager {
    let addr_info = AddressInfo {
        num_wb_stripes: 4,
        blks_per_stripe: BLKS_PER_STRIPE,
        chunks_per_stripe: 2,
        num_volumes: 4,
        ..Default::default()
    };
    let alloc_ctx = Arc::new(AllocatorContext::new(
        addr_info.num_volumes,
        addr_info.num_wb_stripes,
    ));
    WbStripeManager::new(
        addr_info,
        "prop-array",
        0,
        Arc::new(InMemoryStripeMap::new()),
        Arc::new(RecordingReverseMap::new()),
        Arc::new(StaticVolumeInfo::new(1 << 30)),
        alloc_ctx,
        Arc::new(InlineEventScheduler::new()),
        Arc::new(CompletingFlushDispatcher::new()),
        Arc::new(RecordingStripeIoBackend::new()),
        Arc::new(CountingQos::new()),
    )
}

fn test_stripe() -> Stripe {
    Stripe::new(BLKS_PER_STRIPE, Arc::new(InlineEventScheduler::new()))
}

/// Decrease amounts whose sum stays within one stripe.
fn decrease_seq_strategy() -> impl Strategy<Value = Vec<u32>> {
    prop::collection::vec(0u32..=8, 0..32).prop_map(|mut v| {
        let mut budget = BLKS_PER_STRIPE;
        for step in v.iter_mut() {
            *step = (*step).min(budget);
            budget -= *step;
        }
        v
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn remaining_never_increases(steps in decrease_seq_strategy()) {
        let stripe = test_stripe();
        let mut last = stripe.blks_remaining();
        let mut consumed = 0u32;

        for step in steps {
            let now = stripe.decrease_blks_remaining(step);
            consumed += step;
            prop_assert!(now <= last);
            last = now;
        }

        prop_assert_eq!(stripe.blks_remaining(), BLKS_PER_STRIPE - consumed);
    }

    #[test]
    fn refer_derefer_balances(counts in prop::collection::vec(1u32..=4, 0..16)) {
        let stripe = test_stripe();

        for &count in &counts {
            for _ in 0..count {
                stripe.refer();
            }
        }
        for &count in &counts {
            stripe.derefer(count);
        }

        prop_assert_eq!(stripe.ref_count(), 0);
    }

    #[test]
    fn remaining_blocks_respects_guards(offset in 0u64..=(BLKS_PER_STRIPE as u64 + 8)) {
        let manager = test_manager();
        let tail = VirtualBlkAddr::new(7, offset);
        let range = manager.remaining_blocks(tail);

        let blks = u64::from(BLKS_PER_STRIPE);
        if offset > blks {
            prop_assert!(range.is_empty());
            prop_assert_eq!(range.num_blks, 0);
        } else if offset == blks {
            prop_assert!(range.is_empty());
            prop_assert_eq!(range.num_blks, 0);
        } else {
            prop_assert_eq!(range.start_vsa, tail);
            prop_assert_eq!(u64::from(range.num_blks), blks - offset);
        }
    }

    #[test]
    fn unmap_offset_yields_empty_range(stripe_id in 0u32..100) {
        let manager = test_manager();
        let tail = VirtualBlkAddr::new(stripe_id, UNMAP_OFFSET);
        let range = manager.remaining_blocks(tail);
        prop_assert!(range.is_empty());
        prop_assert_eq!(range.num_blks, 0);
    }

    #[test]
    fn tail_is_consumed_exactly_once(offset in 1u64..(BLKS_PER_STRIPE as u64)) {
        let manager = test_manager();
        let ctx = AllocatorContext::new(1, 4);
        let tail = VirtualBlkAddr::new(3, offset);
        ctx.set_active_stripe_tail(0, tail);

        // First consume: the unwritten range, tail cleared under the lock.
        let first = {
            let mut guard = ctx.tail_lock(0).lock();
            let range = manager.remaining_blocks(*guard);
            *guard = UNMAP_VSA;
            range
        };
        prop_assert_eq!(first.start_vsa, tail);
        prop_assert_eq!(u64::from(first.num_blks), u64::from(BLKS_PER_STRIPE) - offset);

        // Second consume: nothing left.
        let second = {
            let mut guard = ctx.tail_lock(0).lock();
            let range = manager.remaining_blocks(*guard);
            *guard = UNMAP_VSA;
            range
        };
        prop_assert!(second.is_empty());
        prop_assert_eq!(second.num_blks, 0);
    }
}
