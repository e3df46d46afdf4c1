//! The write-buffer stripe manager.
//!
//! Owns the write-buffer stripe table, finalizes per-volume active stripes,
//! submits flushes, answers read-path residency queries, and reconstructs
//! and restages stripes during replay.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, error, info};

use crate::address::{
    is_unmap_stripe, vsid_to_user_lsid, BlkAddr, BlkOffset, StripeAddr, StripeId, StripeLoc,
    TailArrayIdx, VirtualBlkAddr, VirtualBlks, INVALID_RBA, INVALID_VOLUME_ID, UNMAP_OFFSET,
    UNMAP_VSA,
};
use crate::config::AddressInfo;
use crate::error::{Error, Result};
use crate::event::EventScheduler;
use crate::mapper::{ReverseMap, StripeMap};
use crate::mem::BufferPool;
use crate::qos::QosManager;
use crate::volume::{VolumeInfoManager, VolumeMountStatus};

use super::context::AllocatorContext;
use super::flush::{FlushDispatcher, FlushIo, FlushSubmission};
use super::load_status::StripeLoadStatus;
use super::reload::{
    ReadStripe, ReadStripeCompletion, StripeIoBackend, StripeLoadBuffers, WriteStripeCompletion,
};
use super::stripe::Stripe;

/// Poll granularity of the drain waits.
const DRAIN_POLL: Duration = Duration::from_micros(1);

/// Lifecycle manager for the stripes resident in the NVM write buffer.
///
/// The slot table indexed by write-buffer LSID is the single source of
/// truth for residency: a slot is either empty or owned by exactly one live
/// stripe, and is cleared only after the stripe has finished flushing and
/// its readers are gone.
pub struct WbStripeManager {
    addr_info: AddressInfo,
    array_name: String,
    array_id: u32,

    table: Vec<RwLock<Option<Arc<Stripe>>>>,
    buffer_pool: RwLock<Option<Arc<BufferPool>>>,
    load_status: Arc<StripeLoadStatus>,

    stripe_map: Arc<dyn StripeMap>,
    reverse_map: Arc<dyn ReverseMap>,
    volume_info: Arc<dyn VolumeInfoManager>,
    alloc_ctx: Arc<AllocatorContext>,
    event_scheduler: Arc<dyn EventScheduler>,
    flush_dispatcher: Arc<dyn FlushDispatcher>,
    io_backend: Arc<dyn StripeIoBackend>,
    qos: Arc<dyn QosManager>,
}

impl WbStripeManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        addr_info: AddressInfo,
        array_name: impl Into<String>,
        array_id: u32,
        stripe_map: Arc<dyn StripeMap>,
        reverse_map: Arc<dyn ReverseMap>,
        volume_info: Arc<dyn VolumeInfoManager>,
        alloc_ctx: Arc<AllocatorContext>,
        event_scheduler: Arc<dyn EventScheduler>,
        flush_dispatcher: Arc<dyn FlushDispatcher>,
        io_backend: Arc<dyn StripeIoBackend>,
        qos: Arc<dyn QosManager>,
    ) -> Self {
        let table = (0..addr_info.num_wb_stripes)
            .map(|_| RwLock::new(None))
            .collect();
        Self {
            addr_info,
            array_name: array_name.into(),
            array_id,
            table,
            buffer_pool: RwLock::new(None),
            load_status: Arc::new(StripeLoadStatus::new()),
            stripe_map,
            reverse_map,
            volume_info,
            alloc_ctx,
            event_scheduler,
            flush_dispatcher,
            io_backend,
            qos,
        }
    }

    /// Acquire the reload buffer pool. The pool holds one chunk per
    /// resident stripe chunk so that replay can restage every stripe at
    /// once.
    pub fn init(&self) -> Result<()> {
        let size = self.addr_info.chunk_size;
        let count = self.addr_info.total_pool_chunks();
        match BufferPool::new(size, count) {
            Ok(pool) => {
                *self.buffer_pool.write() = Some(Arc::new(pool));
                Ok(())
            }
            Err(_) => {
                error!(
                    "failed to create stripe buffer pool (size {}, count {})",
                    size, count
                );
                Err(Error::BufferPoolCreation { size, count })
            }
        }
    }

    /// Release the buffer pool and drop every table entry.
    pub fn dispose(&self) {
        for slot in &self.table {
            slot.write().take();
        }
        self.buffer_pool.write().take();
        self.load_status.reset();
    }

    // =========================================================================
    // Table access
    // =========================================================================

    /// Install a stripe at its write-buffer slot.
    ///
    /// # Panics
    ///
    /// Panics if the slot is occupied.
    pub fn assign_stripe(&self, stripe: Arc<Stripe>) {
        let wb_lsid = stripe.wb_lsid();
        let mut slot = self.table[wb_lsid as usize].write();
        assert!(
            slot.is_none(),
            "assign into occupied write buffer slot {}",
            wb_lsid
        );
        *slot = Some(stripe);
    }

    /// Current occupant of a slot, if any.
    pub fn get_stripe(&self, wb_lsid: StripeId) -> Option<Arc<Stripe>> {
        self.table[wb_lsid as usize].read().clone()
    }

    /// Release a write-buffer LSID: hand the slot id back to the allocator,
    /// give the QoS budget back, and clear the table entry.
    ///
    /// # Panics
    ///
    /// Panics on the unmapped sentinel or an already-empty slot.
    pub fn free_wb_stripe_id(&self, wb_lsid: StripeId) {
        assert!(
            !is_unmap_stripe(wb_lsid),
            "freeing the unmapped stripe sentinel"
        );
        self.alloc_ctx.release_wb_stripe(wb_lsid);
        self.qos.decrease_used_stripe_cnt(&self.array_name);

        let prev = self.table[wb_lsid as usize].write().take();
        assert!(prev.is_some(), "double free of write buffer slot {}", wb_lsid);
    }

    // =========================================================================
    // Read-path residency
    // =========================================================================

    /// Pin the stripe behind a write-buffer LSA. Returns false when the LSA
    /// points at the user area or an empty slot.
    pub fn refer_lsid_cnt(&self, lsa: StripeAddr) -> bool {
        match self.stripe_at(lsa) {
            Some(stripe) => {
                stripe.refer();
                true
            }
            None => false,
        }
    }

    /// Unpin `block_count` references from the stripe behind `lsa`.
    pub fn derefer_lsid_cnt(&self, lsa: StripeAddr, block_count: u32) {
        if let Some(stripe) = self.stripe_at(lsa) {
            stripe.derefer(block_count);
        }
    }

    fn stripe_at(&self, lsa: StripeAddr) -> Option<Arc<Stripe>> {
        if self.stripe_map.is_in_user_data_area(lsa) {
            return None;
        }
        self.table
            .get(lsa.stripe_id as usize)
            .and_then(|slot| slot.read().clone())
    }

    // =========================================================================
    // Finalization and flush
    // =========================================================================

    /// Close a partially written stripe whose tail the front end already
    /// consumed. The trailing blocks are stamped invalid in the reverse map
    /// and the stripe becomes a flush target; the flush itself is submitted
    /// by the subsequent pending-stripe sweep.
    pub fn finish_stripe(&self, wb_lsid: StripeId, tail: VirtualBlkAddr) {
        if wb_lsid > self.addr_info.num_wb_stripes {
            error!("requested to finish stripe with wrong wb lsid {}", wb_lsid);
            return;
        }

        let stripe = self
            .table
            .get(wb_lsid as usize)
            .and_then(|slot| slot.read().clone());
        let Some(stripe) = stripe else {
            panic!("finish_stripe: no stripe at write buffer slot {}", wb_lsid);
        };

        let remaining = self.remaining_blocks(tail);
        let flush_required = Self::fill_blocks_to_stripe(
            &stripe,
            remaining.start_vsa.offset,
            remaining.num_blks,
        );
        if flush_required {
            // Submitted by the concurrent flush_all_pending_stripes sweep.
            info!("stripe is ready to be flushed, wbLsid {}", wb_lsid);
        }
    }

    /// Finalize the active stripe of every volume, then wait until every
    /// resident stripe has drained. Clean-shutdown path.
    pub fn flush_all_wb_stripes(&self) {
        for volume_id in 0..self.addr_info.num_volumes {
            self.finish_active_stripe(volume_id as TailArrayIdx);
        }

        for slot in &self.table {
            let stripe = slot.read().clone();
            if let Some(stripe) = stripe {
                self.wait_for_stripe_flush_complete(&stripe);
            }
        }
    }

    /// Finalize the volume's active stripe and wait for each of its
    /// resident stripes to drain.
    pub fn flush_all_pending_stripes_in_volume(&self, volume_id: u32) {
        self.finish_active_stripe(volume_id as TailArrayIdx);

        for slot in &self.table {
            let stripe = slot.read().clone();
            if let Some(stripe) = stripe {
                if stripe.volume_id() == volume_id {
                    self.wait_for_stripe_flush_complete(&stripe);
                }
            }
        }
    }

    /// Non-blocking variant: finalize the volume's active stripe and attach
    /// `flush_io` to every resident stripe of the volume so the caller can
    /// observe the drain. Unmounted volumes are a no-op.
    pub fn flush_all_pending_stripes_in_volume_with_barrier(
        &self,
        volume_id: u32,
        flush_io: Arc<FlushIo>,
    ) {
        if self.volume_info.mount_status(volume_id) != VolumeMountStatus::Mounted {
            return;
        }

        if let Some(active) = self.finish_active_stripe(volume_id as TailArrayIdx) {
            info!(
                "picked active stripe: volumeId {} wbLsid {} vsid {} remaining {}",
                volume_id,
                active.wb_lsid(),
                active.vsid(),
                active.blks_remaining()
            );
        }

        for slot in &self.table {
            let stripe = slot.read().clone();
            if let Some(stripe) = stripe {
                if stripe.volume_id() == volume_id {
                    stripe.update_flush_io(Arc::clone(&flush_io));
                }
            }
        }
    }

    /// Replay-only sweep: submit a flush for every stripe whose content is
    /// complete but which never entered the pipeline (flush is suppressed
    /// while the array replays). Every candidate is attempted; the last
    /// failure is returned.
    pub fn flush_all_pending_stripes(&self) -> Result<()> {
        let mut result = Ok(());

        for slot in &self.table {
            let stripe = slot.read().clone();
            let Some(stripe) = stripe else { continue };
            if stripe.blks_remaining() == 0 && !stripe.is_finished() {
                match self.request_stripe_flush(&stripe) {
                    Ok(()) => {
                        debug!(
                            "requested stripe flush, vsid {} lsid {} remaining {}",
                            stripe.vsid(),
                            stripe.wb_lsid(),
                            stripe.blks_remaining()
                        );
                    }
                    Err(e) => {
                        error!(
                            "request stripe flush failed, vsid {} lsid {} remaining {}: {}",
                            stripe.vsid(),
                            stripe.wb_lsid(),
                            stripe.blks_remaining(),
                            e
                        );
                        result = Err(e);
                    }
                }
            }
        }

        result
    }

    // =========================================================================
    // Replay reconstruction
    // =========================================================================

    /// Rebuild a stripe that was resident in the write buffer at crash
    /// time. The blocks up to `tail_vsa.offset` are taken as already
    /// written; the reverse-map subsystem rebuilds their entries from the
    /// journal-recovered `rev_map_infos`.
    pub fn reconstruct_active_stripe(
        &self,
        volume_id: u32,
        wb_lsid: StripeId,
        tail_vsa: VirtualBlkAddr,
        rev_map_infos: &BTreeMap<u64, BlkAddr>,
    ) -> Result<()> {
        if tail_vsa.offset == 0 || tail_vsa.offset > u64::from(self.addr_info.blks_per_stripe) {
            error!("wrong block count {} reconstructing stripe", tail_vsa.offset);
            return Err(Error::WrongBlockCount {
                block_count: tail_vsa.offset,
            });
        }

        let vsid = tail_vsa.stripe_id;
        let user_lsid = vsid_to_user_lsid(vsid);
        let stripe = Arc::new(Stripe::new(
            self.addr_info.blks_per_stripe,
            Arc::clone(&self.event_scheduler),
        ));
        stripe.assign(vsid, wb_lsid, user_lsid, volume_id);
        self.assign_stripe(Arc::clone(&stripe));

        debug!(
            "stripe (vsid {}, wbLsid {}, blockCount {}) is reconstructed",
            vsid, wb_lsid, tail_vsa.offset
        );
        let remaining = stripe.decrease_blks_remaining(tail_vsa.offset as u32);
        if remaining == 0 {
            debug!(
                "stripe (vsid {}, wbLsid {}) is waiting to be flushed",
                vsid, wb_lsid
            );
        }

        let volume_bytes =
            self.volume_info
                .volume_size(volume_id)
                .map_err(|_| Error::VolumeSizeUnavailable { volume_id })?;
        let total_rba_num = volume_bytes.div_ceil(self.addr_info.block_size as u64);

        self.reverse_map
            .reconstruct_reverse_map(
                volume_id,
                total_rba_num,
                wb_lsid,
                vsid,
                tail_vsa.offset,
                rev_map_infos,
                stripe.rev_map_pack(),
            )
            .map_err(|e| Error::ReverseMapReconstruction {
                volume_id,
                reason: e.to_string(),
            })
    }

    /// Restage every stripe still mapped to the write buffer: read its data
    /// from the user area and write it back into its write-buffer slot.
    /// Blocks until every issued reload has landed.
    pub fn load_pending_stripes_to_write_buffer(&self) -> Result<()> {
        self.load_status.reset();

        for slot in &self.table {
            let stripe = slot.read().clone();
            let Some(stripe) = stripe else { continue };

            let addr = self.stripe_map.get_lsa(stripe.vsid());
            if addr.is_unmapped() {
                continue;
            }

            if addr.stripe_loc == StripeLoc::InWriteBufferArea {
                let from = StripeAddr::user(stripe.user_lsid());
                let to = StripeAddr::wb(stripe.wb_lsid());

                self.load_status.stripe_load_started();
                self.load_stripe(from, to)?;

                info!(
                    "start loading stripe, vsid {}, wbLsid {}, userLsid {}",
                    stripe.vsid(),
                    stripe.wb_lsid(),
                    stripe.user_lsid()
                );
            }
        }

        while !self.load_status.is_done() {
            std::thread::sleep(DRAIN_POLL);
        }

        Ok(())
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn addr_info(&self) -> &AddressInfo {
        &self.addr_info
    }

    pub fn load_status(&self) -> &Arc<StripeLoadStatus> {
        &self.load_status
    }

    /// Available chunks in the reload buffer pool; `None` before `init`.
    pub fn buffer_pool_available(&self) -> Option<usize> {
        self.buffer_pool.read().as_ref().map(|p| p.available())
    }

    // =========================================================================
    // Internals
    // =========================================================================

    /// Finalize the active stripe at `index`, if one is open.
    ///
    /// The tail is read and cleared to unmapped inside one critical section
    /// of the per-index lock, so a concurrent appender observes either the
    /// old tail or the sentinel.
    fn finish_active_stripe(&self, index: TailArrayIdx) -> Option<Arc<Stripe>> {
        let mut tail_guard = self.alloc_ctx.tail_lock(index).lock();

        let current_tail = *tail_guard;
        if current_tail.is_unmapped() {
            debug!("no active stripe for index {}", index);
            return None;
        }

        let stripe_addr = self.stripe_map.get_lsa(current_tail.stripe_id);
        if stripe_addr.stripe_loc == StripeLoc::InUserArea || stripe_addr.is_unmapped() {
            debug!("no active stripe for index {}", index);
            return None;
        }
        let wb_lsid = stripe_addr.stripe_id;

        let remaining = self.allocate_remaining_blocks(&mut tail_guard);
        drop(tail_guard);

        if remaining.is_empty() {
            debug!("no active stripe for index {}", index);
            return None;
        }

        debug!(
            "finish active stripe, index {}, wbLsid {}, start offset {}, numBlks {}",
            index, wb_lsid, remaining.start_vsa.offset, remaining.num_blks
        );
        Some(self.finish_remaining_blocks(wb_lsid, remaining.start_vsa.offset, remaining.num_blks))
    }

    /// Atomically consume the tail: compute the unwritten range and clear
    /// the tail to unmapped. Must run under the per-index tail lock.
    fn allocate_remaining_blocks(&self, tail: &mut VirtualBlkAddr) -> VirtualBlks {
        let remaining = self.remaining_blocks(*tail);
        *tail = UNMAP_VSA;
        remaining
    }

    /// The still-unwritten range of a stripe whose tail is `tail`.
    pub(crate) fn remaining_blocks(&self, tail: VirtualBlkAddr) -> VirtualBlks {
        let blks_per_stripe = u64::from(self.addr_info.blks_per_stripe);

        if tail.offset == UNMAP_OFFSET {
            return VirtualBlks::empty();
        }
        if tail.offset > blks_per_stripe {
            error!(
                "offset in tail {} > blksPerStripe {}",
                tail.offset, blks_per_stripe
            );
            return VirtualBlks::empty();
        }

        let num_blks = (blks_per_stripe - tail.offset) as u32;
        if num_blks == 0 {
            // Fully written stripe: nothing to back-fill, unmapped start.
            VirtualBlks {
                start_vsa: UNMAP_VSA,
                num_blks: 0,
            }
        } else {
            VirtualBlks {
                start_vsa: tail,
                num_blks,
            }
        }
    }

    /// Stamp the unwritten tail range invalid in the reverse map, mark the
    /// stripe as a flush target, and account the range as written. Returns
    /// true when the stripe is thereby complete.
    fn fill_blocks_to_stripe(stripe: &Arc<Stripe>, start_offset: BlkOffset, num_blks: u32) -> bool {
        for block in 0..u64::from(num_blks) {
            stripe.update_reverse_map_entry(start_offset + block, INVALID_RBA, INVALID_VOLUME_ID);
        }
        stripe.set_active_flush_target();
        stripe.decrease_blks_remaining(num_blks) == 0
    }

    /// Close out the consumed tail range and submit the flush if the
    /// stripe is now complete.
    fn finish_remaining_blocks(
        &self,
        wb_lsid: StripeId,
        start_offset: BlkOffset,
        num_blks: u32,
    ) -> Arc<Stripe> {
        let stripe = self
            .get_stripe(wb_lsid)
            .unwrap_or_else(|| panic!("no stripe at write buffer slot {}", wb_lsid));

        let flush_required = Self::fill_blocks_to_stripe(&stripe, start_offset, num_blks);
        if flush_required {
            match self.request_stripe_flush(&stripe) {
                Ok(()) => {
                    debug!("flush stripe (vsid {}, wbLsid {})", stripe.vsid(), wb_lsid);
                }
                Err(e) => {
                    error!(
                        "request stripe flush failed (vsid {}, wbLsid {}): {}",
                        stripe.vsid(),
                        wb_lsid,
                        e
                    );
                }
            }
        }

        stripe
    }

    /// Hand one complete stripe to the flush pipeline.
    fn request_stripe_flush(&self, stripe: &Arc<Stripe>) -> Result<()> {
        let submission = Arc::new(FlushSubmission::new(
            Arc::clone(stripe),
            self.array_id,
            Arc::clone(&self.flush_dispatcher),
        ));
        stripe
            .flush(submission)
            .map_err(|_| Error::FlushSubmissionFailed {
                vsid: stripe.vsid(),
                wb_lsid: stripe.wb_lsid(),
            })
    }

    /// Spin until the stripe's content is complete and its flush has
    /// finished. The flush pipeline makes progress on other threads.
    fn wait_for_stripe_flush_complete(&self, stripe: &Arc<Stripe>) {
        while stripe.blks_remaining() > 0 {
            std::thread::sleep(DRAIN_POLL);
        }
        while !stripe.is_finished() {
            std::thread::sleep(DRAIN_POLL);
        }
    }

    /// Issue one user-area → write-buffer copy through the event chain.
    fn load_stripe(&self, from: StripeAddr, to: StripeAddr) -> Result<()> {
        let pool = self
            .buffer_pool
            .read()
            .clone()
            .expect("stripe buffer pool not initialized; init() must precede replay");

        let mut chunks = Vec::with_capacity(self.addr_info.chunks_per_stripe as usize);
        for _ in 0..self.addr_info.chunks_per_stripe {
            match pool.try_get() {
                Some(chunk) => chunks.push(chunk),
                // The pool is provisioned for every resident stripe, so
                // exhaustion here is unrecoverable accounting damage.
                None => panic!("stripe buffer pool exhausted during stripe load"),
            }
        }

        let buffers = Arc::new(StripeLoadBuffers::new(chunks));
        let write_completion = Arc::new(WriteStripeCompletion::new(
            Arc::clone(&pool),
            Arc::clone(&buffers),
            Arc::clone(&self.load_status),
        ));
        let read_completion = Arc::new(ReadStripeCompletion::new(
            to,
            Arc::clone(&buffers),
            write_completion,
            Arc::clone(&self.io_backend),
        ));
        let read = Arc::new(ReadStripe::new(
            from,
            buffers,
            read_completion,
            Arc::clone(&self.io_backend),
        ));

        self.event_scheduler.enqueue_event(read)
    }
}
