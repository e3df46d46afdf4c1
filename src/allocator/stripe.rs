//! Per-stripe state.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::address::{BlkAddr, BlkOffset, StripeId, INVALID_VOLUME_ID, UNMAP_STRIPE};
use crate::error::Result;
use crate::event::{EventPtr, EventScheduler};
use crate::mapper::ReverseMapPack;

use super::flush::FlushIo;

/// One write-buffer stripe.
///
/// A stripe is created empty, assigned its identity once, filled by
/// front-end writers, flushed to the user area, and finally dropped from
/// the table when flushed and unreferenced. Several parties hold the same
/// stripe at once (the table, read callbacks, the pending flush event), so
/// all state is interiorly synchronized.
pub struct Stripe {
    vsid: AtomicU32,
    wb_lsid: AtomicU32,
    user_lsid: AtomicU32,
    volume_id: AtomicU32,

    /// Blocks not yet accounted for; starts at `blks_per_stripe` and only
    /// ever decreases. Zero means the stripe content is complete.
    blks_remaining: AtomicU32,

    /// Readers currently holding the stripe resident.
    ref_count: AtomicU32,

    /// Set once flush has made data and reverse map durable.
    finished: AtomicBool,

    /// Set once the stripe is scheduled (or eligible) for flush; such a
    /// stripe accepts no new VSA assignments.
    active_flush_target: AtomicBool,

    rev_map_pack: ReverseMapPack,

    /// Optional external barrier to notify when the stripe drains.
    flush_io: Mutex<Option<Arc<FlushIo>>>,

    /// Back-end pipeline that executes flush submissions.
    flush_pipeline: Arc<dyn EventScheduler>,
}

impl Stripe {
    pub fn new(blks_per_stripe: u32, flush_pipeline: Arc<dyn EventScheduler>) -> Self {
        Self {
            vsid: AtomicU32::new(UNMAP_STRIPE),
            wb_lsid: AtomicU32::new(UNMAP_STRIPE),
            user_lsid: AtomicU32::new(UNMAP_STRIPE),
            volume_id: AtomicU32::new(INVALID_VOLUME_ID),
            blks_remaining: AtomicU32::new(blks_per_stripe),
            ref_count: AtomicU32::new(0),
            finished: AtomicBool::new(false),
            active_flush_target: AtomicBool::new(false),
            rev_map_pack: ReverseMapPack::new(blks_per_stripe),
            flush_io: Mutex::new(None),
            flush_pipeline,
        }
    }

    /// One-time identity assignment.
    pub fn assign(&self, vsid: StripeId, wb_lsid: StripeId, user_lsid: StripeId, volume_id: u32) {
        debug_assert_eq!(
            self.vsid.load(Ordering::Acquire),
            UNMAP_STRIPE,
            "stripe assigned twice"
        );
        self.vsid.store(vsid, Ordering::Release);
        self.wb_lsid.store(wb_lsid, Ordering::Release);
        self.user_lsid.store(user_lsid, Ordering::Release);
        self.volume_id.store(volume_id, Ordering::Release);
    }

    /// Record the reverse mapping of one block.
    pub fn update_reverse_map_entry(&self, offset: BlkOffset, rba: BlkAddr, volume_id: u32) {
        self.rev_map_pack.update_entry(offset, rba, volume_id);
    }

    /// Account `count` blocks as written; returns the new remaining count.
    ///
    /// # Panics
    ///
    /// Panics if `count` exceeds the current remaining count.
    pub fn decrease_blks_remaining(&self, count: u32) -> u32 {
        let mut cur = self.blks_remaining.load(Ordering::Acquire);
        loop {
            assert!(
                count <= cur,
                "blks_remaining underflow: remaining {}, decrease {}",
                cur,
                count
            );
            match self.blks_remaining.compare_exchange_weak(
                cur,
                cur - count,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return cur - count,
                Err(actual) => cur = actual,
            }
        }
    }

    /// Take a read-path reference keeping the stripe resident.
    pub fn refer(&self) {
        self.ref_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop `count` read-path references.
    ///
    /// # Panics
    ///
    /// Panics if `count` exceeds the current reference count.
    pub fn derefer(&self, count: u32) {
        let mut cur = self.ref_count.load(Ordering::Acquire);
        loop {
            assert!(
                count <= cur,
                "ref_count underflow: held {}, dropped {}",
                cur,
                count
            );
            match self.ref_count.compare_exchange_weak(
                cur,
                cur - count,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => cur = actual,
            }
        }
    }

    /// Mark the stripe as scheduled/eligible for flush. Idempotent.
    pub fn set_active_flush_target(&self) {
        self.active_flush_target.store(true, Ordering::Release);
    }

    /// Hand the stripe to the back-end flush pipeline.
    pub fn flush(&self, callback: EventPtr) -> Result<()> {
        self.flush_pipeline.enqueue_event(callback)
    }

    /// Attach an external drain barrier. A stripe that already finished has
    /// nothing left to signal and ignores the barrier.
    pub fn update_flush_io(&self, io: Arc<FlushIo>) {
        if self.is_finished() {
            return;
        }
        let mut slot = self.flush_io.lock();
        io.add_pending();
        *slot = Some(io);
    }

    /// Flush-completion callback: data and reverse map are durable.
    ///
    /// # Panics
    ///
    /// Panics if blocks are still outstanding or if invoked twice.
    pub fn complete_flush(&self) {
        assert_eq!(
            self.blks_remaining(),
            0,
            "flush completed with blocks remaining"
        );
        let was_finished = self.finished.swap(true, Ordering::AcqRel);
        assert!(!was_finished, "stripe flush completed twice");

        if let Some(io) = self.flush_io.lock().take() {
            io.complete_one();
        }
    }

    pub fn blks_remaining(&self) -> u32 {
        self.blks_remaining.load(Ordering::Acquire)
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::Acquire)
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub fn is_active_flush_target(&self) -> bool {
        self.active_flush_target.load(Ordering::Acquire)
    }

    pub fn vsid(&self) -> StripeId {
        self.vsid.load(Ordering::Acquire)
    }

    pub fn wb_lsid(&self) -> StripeId {
        self.wb_lsid.load(Ordering::Acquire)
    }

    pub fn user_lsid(&self) -> StripeId {
        self.user_lsid.load(Ordering::Acquire)
    }

    pub fn volume_id(&self) -> u32 {
        self.volume_id.load(Ordering::Acquire)
    }

    pub fn rev_map_pack(&self) -> &ReverseMapPack {
        &self.rev_map_pack
    }
}

impl std::fmt::Debug for Stripe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stripe")
            .field("vsid", &self.vsid())
            .field("wb_lsid", &self.wb_lsid())
            .field("user_lsid", &self.user_lsid())
            .field("volume_id", &self.volume_id())
            .field("blks_remaining", &self.blks_remaining())
            .field("ref_count", &self.ref_count())
            .field("finished", &self.is_finished())
            .field("active_flush_target", &self.is_active_flush_target())
            .finish()
    }
}
