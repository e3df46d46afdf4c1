//! Stripe Lifecycle Integration Tests
//!
//! End-to-end coverage of the write-buffer stripe manager:
//! - fill-and-flush of a complete stripe
//! - forced close of a partially written active stripe
//! - slot reclamation and its invariants
//! - replay reconstruction and the pending-stripe flush sweep
//! - restaging resident stripes into the write buffer

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use nvmlog::address::{
    StripeAddr, StripeLoc, VirtualBlkAddr, INVALID_RBA, UNMAP_STRIPE,
};
use nvmlog::allocator::{
    AllocatorContext, FlushDispatcher, FlushIo, Stripe, WbStripeManager,
};
use nvmlog::config::AddressInfo;
use nvmlog::error::Error;
use nvmlog::event::EventScheduler;
use nvmlog::mock::{
    CollectingFlushDispatcher, CompletingFlushDispatcher, CountingQos, InMemoryStripeMap,
    InlineEventScheduler, RecordingReverseMap, RecordingStripeIoBackend, RejectingEventScheduler,
    StaticVolumeInfo, StripeIoKind,
};
use nvmlog::volume::VolumeMountStatus;

const BLKS_PER_STRIPE: u32 = 4;
const NUM_WB_STRIPES: u32 = 2;
const VOLUME_SIZE_BYTES: u64 = 1 << 30; // 1 GiB
const BLOCK_SIZE: usize = 4096;

struct Harness {
    manager: WbStripeManager,
    stripe_map: Arc<InMemoryStripeMap>,
    reverse_map: Arc<RecordingReverseMap>,
    volume_info: Arc<StaticVolumeInfo>,
    alloc_ctx: Arc<AllocatorContext>,
    scheduler: Arc<dyn EventScheduler>,
    backend: Arc<RecordingStripeIoBackend>,
    qos: Arc<CountingQos>,
}

impl Harness {
    fn new(dispatcher: Arc<dyn FlushDispatcher>) -> Self {
        Self::with_scheduler(dispatcher, Arc::new(InlineEventScheduler::new()))
    }

    fn with_scheduler(
        dispatcher: Arc<dyn FlushDispatcher>,
        scheduler: Arc<dyn EventScheduler>,
    ) -> Self {
        let addr_info = AddressInfo {
            num_wb_stripes: NUM_WB_STRIPES,
            blks_per_stripe: BLKS_PER_STRIPE,
            chunks_per_stripe: 2,
            chunk_size: 4096,
            block_size: BLOCK_SIZE,
            num_volumes: 2,
        };
        let stripe_map = Arc::new(InMemoryStripeMap::new());
        let reverse_map = Arc::new(RecordingReverseMap::new());
        let volume_info = Arc::new(StaticVolumeInfo::new(VOLUME_SIZE_BYTES));
        let alloc_ctx = Arc::new(AllocatorContext::new(
            addr_info.num_volumes,
            addr_info.num_wb_stripes,
        ));
        let backend = Arc::new(RecordingStripeIoBackend::new());
        let qos = Arc::new(CountingQos::new());

        let manager = WbStripeManager::new(
            addr_info,
            "array-0",
            0,
            stripe_map.clone(),
            reverse_map.clone(),
            volume_info.clone(),
            alloc_ctx.clone(),
            scheduler.clone(),
            dispatcher,
            backend.clone(),
            qos.clone(),
        );

        Self {
            manager,
            stripe_map,
            reverse_map,
            volume_info,
            alloc_ctx,
            scheduler,
            backend,
            qos,
        }
    }

    /// Front-end role: take a wbLsid, create and install a stripe, and
    /// register its write-buffer location in the stripe map.
    fn open_stripe(&self, vsid: u32, volume_id: u32) -> Arc<Stripe> {
        let wb_lsid = self
            .alloc_ctx
            .allocate_wb_stripe()
            .expect("write buffer full");
        let stripe = Arc::new(Stripe::new(BLKS_PER_STRIPE, self.scheduler.clone()));
        stripe.assign(vsid, wb_lsid, vsid, volume_id);
        self.manager.assign_stripe(stripe.clone());
        self.stripe_map.set_lsa(vsid, StripeAddr::wb(wb_lsid));
        stripe
    }
}

// =============================================================================
// S1: fill and flush
// =============================================================================

#[test]
fn full_stripe_closes_flushes_and_frees() {
    let dispatcher = Arc::new(CompletingFlushDispatcher::new());
    let h = Harness::new(dispatcher.clone());

    let stripe = h.open_stripe(10, 1);
    assert_eq!(stripe.wb_lsid(), 0);

    // Simulate four appended blocks with real reverse-map entries.
    for offset in 0..4 {
        stripe.update_reverse_map_entry(offset, 100 + offset, 1);
    }
    stripe.decrease_blks_remaining(4);

    h.manager.finish_stripe(0, VirtualBlkAddr::new(10, 4));

    // The tail was already at the end: no entry was overwritten.
    for offset in 0..4 {
        assert_eq!(stripe.rev_map_pack().entry(offset).rba, 100 + offset);
    }
    assert!(stripe.is_active_flush_target());
    assert_eq!(stripe.blks_remaining(), 0);
    assert!(!stripe.is_finished());

    // finish_stripe leaves submission to the sweep.
    assert!(dispatcher.completed().is_empty());
    h.manager.flush_all_pending_stripes().unwrap();
    assert_eq!(dispatcher.completed(), vec![10]);
    assert!(stripe.is_finished());

    h.manager.free_wb_stripe_id(0);
    assert!(h.manager.get_stripe(0).is_none());
    assert_eq!(h.qos.decrements(), 1);
    assert_eq!(h.alloc_ctx.free_wb_stripe_count(), 2);
}

// =============================================================================
// S2: partial close of the active stripe
// =============================================================================

#[test]
fn partial_active_stripe_is_backfilled_and_flushed() {
    let dispatcher = Arc::new(CompletingFlushDispatcher::new());
    let h = Harness::new(dispatcher.clone());

    let stripe = h.open_stripe(10, 1);
    stripe.update_reverse_map_entry(0, 500, 1);
    stripe.decrease_blks_remaining(1);
    h.alloc_ctx
        .set_active_stripe_tail(1, VirtualBlkAddr::new(10, 1));

    h.manager.flush_all_pending_stripes_in_volume(1);

    // Tail consumed to the sentinel.
    assert!(h.alloc_ctx.get_active_stripe_tail(1).is_unmapped());

    // Offsets 1..4 stamped invalid, offset 0 untouched.
    assert_eq!(stripe.rev_map_pack().entry(0).rba, 500);
    for offset in 1..4 {
        assert_eq!(stripe.rev_map_pack().entry(offset).rba, INVALID_RBA);
    }
    assert!(stripe.is_active_flush_target());
    assert_eq!(stripe.blks_remaining(), 0);

    // Flush went straight through the pipeline and drained.
    assert_eq!(dispatcher.completed(), vec![10]);
    assert!(stripe.is_finished());
}

#[test]
fn finalize_without_active_stripe_is_a_noop() {
    let dispatcher = Arc::new(CompletingFlushDispatcher::new());
    let h = Harness::new(dispatcher.clone());

    // No tail set at all.
    h.manager.flush_all_pending_stripes_in_volume(0);
    assert!(dispatcher.completed().is_empty());
}

#[test]
fn finalize_leaves_the_tail_of_a_migrated_stripe() {
    let dispatcher = Arc::new(CompletingFlushDispatcher::new());
    let h = Harness::new(dispatcher.clone());

    // Tail still points at a stripe the map says already migrated: the
    // finalize bails out before consuming the tail.
    let stripe = h.open_stripe(30, 0);
    stripe.decrease_blks_remaining(4);
    h.stripe_map.set_lsa(30, StripeAddr::user(30));
    let tail = VirtualBlkAddr::new(30, 2);
    h.alloc_ctx.set_active_stripe_tail(0, tail);

    h.manager
        .flush_all_pending_stripes_in_volume_with_barrier(0, Arc::new(FlushIo::new()));

    assert!(dispatcher.completed().is_empty());
    assert_eq!(h.alloc_ctx.get_active_stripe_tail(0), tail);
    assert!(!stripe.is_active_flush_target());
}

// =============================================================================
// S3: slot reclamation invariants
// =============================================================================

#[test]
#[should_panic(expected = "released twice")]
fn double_free_is_refused() {
    let h = Harness::new(Arc::new(CompletingFlushDispatcher::new()));
    let stripe = h.open_stripe(10, 1);
    stripe.decrease_blks_remaining(4);
    stripe.complete_flush();

    h.manager.free_wb_stripe_id(0);
    h.manager.free_wb_stripe_id(0);
}

#[test]
#[should_panic(expected = "unmapped stripe sentinel")]
fn freeing_the_sentinel_is_refused() {
    let h = Harness::new(Arc::new(CompletingFlushDispatcher::new()));
    h.manager.free_wb_stripe_id(UNMAP_STRIPE);
}

#[test]
#[should_panic(expected = "occupied")]
fn assigning_into_an_occupied_slot_is_refused() {
    let h = Harness::new(Arc::new(CompletingFlushDispatcher::new()));
    h.open_stripe(10, 1);

    let intruder = Arc::new(Stripe::new(BLKS_PER_STRIPE, h.scheduler.clone()));
    intruder.assign(11, 0, 11, 1);
    h.manager.assign_stripe(intruder);
}

#[test]
fn slot_is_reusable_after_free() {
    let h = Harness::new(Arc::new(CompletingFlushDispatcher::new()));
    let first = h.open_stripe(10, 1);
    first.decrease_blks_remaining(4);
    first.complete_flush();
    h.manager.free_wb_stripe_id(0);
    assert!(h.manager.get_stripe(0).is_none());

    // A fresh stripe may claim the freed slot.
    let second = Arc::new(Stripe::new(BLKS_PER_STRIPE, h.scheduler.clone()));
    second.assign(11, 0, 11, 1);
    h.manager.assign_stripe(second.clone());
    assert!(Arc::ptr_eq(&h.manager.get_stripe(0).unwrap(), &second));
}

// =============================================================================
// Read-path residency
// =============================================================================

#[test]
fn refer_and_derefer_track_wb_residents_only() {
    let h = Harness::new(Arc::new(CompletingFlushDispatcher::new()));
    let stripe = h.open_stripe(10, 1);

    let wb_addr = StripeAddr::wb(0);
    assert!(h.manager.refer_lsid_cnt(wb_addr));
    assert!(h.manager.refer_lsid_cnt(wb_addr));
    assert_eq!(stripe.ref_count(), 2);

    h.manager.derefer_lsid_cnt(wb_addr, 2);
    assert_eq!(stripe.ref_count(), 0);

    // User-area addresses never pin anything.
    assert!(!h.manager.refer_lsid_cnt(StripeAddr::user(10)));

    // Empty slots neither.
    assert!(!h.manager.refer_lsid_cnt(StripeAddr::wb(1)));
    h.manager.derefer_lsid_cnt(StripeAddr::wb(1), 1);
}

// =============================================================================
// Volume barrier and shutdown drains
// =============================================================================

#[test]
fn volume_barrier_attaches_to_live_stripes_of_that_volume() {
    let dispatcher = Arc::new(CollectingFlushDispatcher::new());
    let h = Harness::new(dispatcher.clone());

    let mine = h.open_stripe(10, 1);
    let other = h.open_stripe(20, 0);

    let barrier = Arc::new(FlushIo::new());
    h.manager
        .flush_all_pending_stripes_in_volume_with_barrier(1, barrier.clone());

    assert_eq!(barrier.pending(), 1);
    assert!(!barrier.is_completed());

    mine.decrease_blks_remaining(4);
    mine.complete_flush();
    assert!(barrier.is_completed());

    // The other volume's stripe was never touched.
    assert_eq!(other.ref_count(), 0);
    assert!(!other.is_active_flush_target());
}

#[test]
fn barrier_skips_unmounted_volumes() {
    let dispatcher = Arc::new(CollectingFlushDispatcher::new());
    let h = Harness::new(dispatcher.clone());

    h.open_stripe(10, 1);
    h.volume_info
        .set_mount_status(1, VolumeMountStatus::Unmounted);

    let barrier = Arc::new(FlushIo::new());
    h.manager
        .flush_all_pending_stripes_in_volume_with_barrier(1, barrier.clone());
    assert!(barrier.is_completed());
}

#[test]
fn shutdown_flush_waits_for_every_resident_stripe() {
    let dispatcher = Arc::new(CollectingFlushDispatcher::new());
    let h = Harness::new(dispatcher.clone());

    let a = h.open_stripe(10, 0);
    let b = h.open_stripe(20, 1);
    // Two and three blocks written respectively; the tails sit behind them.
    a.decrease_blks_remaining(2);
    b.decrease_blks_remaining(3);
    h.alloc_ctx
        .set_active_stripe_tail(0, VirtualBlkAddr::new(10, 2));
    h.alloc_ctx
        .set_active_stripe_tail(1, VirtualBlkAddr::new(20, 3));

    // The flush pipeline completes on another thread after a delay, the
    // way back-end completions arrive in production.
    let pending_side = dispatcher.clone();
    let completer = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(50));
        let mut completed = 0;
        while completed < 2 {
            for stripe in pending_side.take_pending() {
                stripe.complete_flush();
                completed += 1;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    });

    h.manager.flush_all_wb_stripes();
    completer.join().unwrap();

    assert!(a.is_finished());
    assert!(b.is_finished());
    assert_eq!(a.blks_remaining(), 0);
    assert_eq!(b.blks_remaining(), 0);
}

// =============================================================================
// S4: replay reconstruction
// =============================================================================

#[test]
fn reconstruct_installs_stripe_and_rebuilds_reverse_map() {
    let h = Harness::new(Arc::new(CompletingFlushDispatcher::new()));

    let mut infos = BTreeMap::new();
    infos.insert(0u64, 100u64);
    infos.insert(1u64, 101u64);

    let tail = VirtualBlkAddr::new(20, 2);
    h.manager
        .reconstruct_active_stripe(1, 0, tail, &infos)
        .unwrap();

    let stripe = h.manager.get_stripe(0).expect("stripe installed");
    assert_eq!(stripe.vsid(), 20);
    assert_eq!(stripe.user_lsid(), 20);
    assert_eq!(stripe.volume_id(), 1);
    assert_eq!(stripe.blks_remaining(), BLKS_PER_STRIPE - 2);

    let calls = h.reverse_map.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].volume_id, 1);
    assert_eq!(calls[0].wb_lsid, 0);
    assert_eq!(calls[0].vsid, 20);
    assert_eq!(calls[0].offset, 2);
    assert_eq!(calls[0].num_infos, 2);
    assert_eq!(
        calls[0].total_rba_num,
        VOLUME_SIZE_BYTES / BLOCK_SIZE as u64
    );
}

#[test]
fn reconstruct_with_zero_tail_offset_is_refused() {
    let h = Harness::new(Arc::new(CompletingFlushDispatcher::new()));

    let result =
        h.manager
            .reconstruct_active_stripe(1, 0, VirtualBlkAddr::new(20, 0), &BTreeMap::new());

    assert!(matches!(
        result,
        Err(Error::WrongBlockCount { block_count: 0 })
    ));
    // Refused before any state changed.
    assert!(h.manager.get_stripe(0).is_none());
    assert!(h.reverse_map.calls().is_empty());
}

#[test]
fn reconstruct_past_stripe_end_is_refused() {
    let h = Harness::new(Arc::new(CompletingFlushDispatcher::new()));

    let offset = u64::from(BLKS_PER_STRIPE) + 1;
    let result = h.manager.reconstruct_active_stripe(
        1,
        0,
        VirtualBlkAddr::new(20, offset),
        &BTreeMap::new(),
    );
    assert!(matches!(result, Err(Error::WrongBlockCount { .. })));
    assert!(h.manager.get_stripe(0).is_none());
}

// =============================================================================
// S5: replay flush-all sweep
// =============================================================================

#[test]
fn sweep_submits_every_complete_unfinished_stripe() {
    let dispatcher = Arc::new(CompletingFlushDispatcher::new());
    let h = Harness::new(dispatcher.clone());

    for (vsid, volume) in [(10, 0), (20, 1)] {
        let stripe = h.open_stripe(vsid, volume);
        stripe.decrease_blks_remaining(BLKS_PER_STRIPE);
    }

    h.manager.flush_all_pending_stripes().unwrap();

    let mut completed = dispatcher.completed();
    completed.sort_unstable();
    assert_eq!(completed, vec![10, 20]);
}

#[test]
fn sweep_skips_incomplete_and_finished_stripes() {
    let dispatcher = Arc::new(CompletingFlushDispatcher::new());
    let h = Harness::new(dispatcher.clone());

    // Incomplete: still has blocks remaining.
    h.open_stripe(10, 0).decrease_blks_remaining(1);

    // Already finished.
    let done = h.open_stripe(20, 1);
    done.decrease_blks_remaining(BLKS_PER_STRIPE);
    done.complete_flush();

    h.manager.flush_all_pending_stripes().unwrap();
    assert!(dispatcher.completed().is_empty());
}

#[test]
fn sweep_attempts_all_and_reports_the_last_failure() {
    let h = Harness::with_scheduler(
        Arc::new(CompletingFlushDispatcher::new()),
        Arc::new(RejectingEventScheduler),
    );

    for (vsid, volume) in [(10, 0), (20, 1)] {
        let stripe = h.open_stripe(vsid, volume);
        stripe.decrease_blks_remaining(BLKS_PER_STRIPE);
    }

    let err = h.manager.flush_all_pending_stripes().unwrap_err();
    // Both slots were attempted; the error reflects the last one.
    match err {
        Error::FlushSubmissionFailed { vsid, wb_lsid } => {
            assert_eq!(vsid, 20);
            assert_eq!(wb_lsid, 1);
        }
        other => panic!("unexpected error: {other}"),
    }
}

// =============================================================================
// Replay restage
// =============================================================================

#[test]
fn reload_copies_wb_resident_stripes_and_recycles_buffers() {
    let h = Harness::new(Arc::new(CompletingFlushDispatcher::new()));
    h.manager.init().unwrap();
    let pool_capacity = h.manager.buffer_pool_available().unwrap();

    // vsid 10 still lives in the write buffer: must be restaged.
    h.open_stripe(10, 0);
    // vsid 20 already migrated to the user area: must be skipped.
    h.open_stripe(20, 1);
    h.stripe_map.set_lsa(20, StripeAddr::user(20));

    h.manager.load_pending_stripes_to_write_buffer().unwrap();

    let ops = h.backend.ops();
    assert_eq!(ops.len(), 2);
    assert_eq!(ops[0], (StripeIoKind::Read, StripeAddr::user(10)));
    assert_eq!(ops[1].0, StripeIoKind::Write);
    assert_eq!(ops[1].1.stripe_loc, StripeLoc::InWriteBufferArea);
    assert_eq!(ops[1].1.stripe_id, 0);

    // Fan-in closed and every chunk returned to the pool.
    assert!(h.manager.load_status().is_done());
    assert_eq!(h.manager.buffer_pool_available(), Some(pool_capacity));
}

#[test]
fn reload_with_nothing_resident_returns_immediately() {
    let h = Harness::new(Arc::new(CompletingFlushDispatcher::new()));
    h.manager.init().unwrap();

    h.manager.load_pending_stripes_to_write_buffer().unwrap();
    assert!(h.backend.ops().is_empty());
}

// =============================================================================
// finish_stripe boundary
// =============================================================================

#[test]
fn finish_stripe_beyond_the_table_is_ignored() {
    let dispatcher = Arc::new(CompletingFlushDispatcher::new());
    let h = Harness::new(dispatcher.clone());
    h.open_stripe(10, 1);

    // Past the guard bound: logged and dropped, no stripe touched.
    h.manager
        .finish_stripe(NUM_WB_STRIPES + 1, VirtualBlkAddr::new(10, 4));
    assert!(dispatcher.completed().is_empty());
    assert!(!h.manager.get_stripe(0).unwrap().is_active_flush_target());
}

#[test]
#[should_panic(expected = "no stripe at write buffer slot")]
fn finish_stripe_on_an_empty_slot_is_fatal() {
    let h = Harness::new(Arc::new(CompletingFlushDispatcher::new()));
    h.manager.finish_stripe(1, VirtualBlkAddr::new(10, 4));
}

#[test]
fn dispose_clears_the_table() {
    let h = Harness::new(Arc::new(CompletingFlushDispatcher::new()));
    h.manager.init().unwrap();
    h.open_stripe(10, 1);

    h.manager.dispose();
    assert!(h.manager.get_stripe(0).is_none());
    assert_eq!(h.manager.buffer_pool_available(), None);
}
