//! In-memory collaborator implementations.
//!
//! The stripe manager talks to the rest of the engine through traits; the
//! implementations here back those traits with plain maps and inline
//! execution so the lifecycle can be exercised hermetically. They are used
//! by this crate's own tests and are suitable for any embedding that wants
//! a single-process harness.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use crate::address::{BlkAddr, BlkOffset, StripeAddr, StripeId, UNMAP_STRIPE};
use crate::allocator::{FlushDispatcher, StripeIoBackend, StripeLoadBuffers};
use crate::allocator::Stripe;
use crate::error::{Error, Result};
use crate::event::{Event, EventPtr, EventScheduler};
use crate::mapper::{ReverseMap, ReverseMapPack, StripeMap};
use crate::qos::QosManager;
use crate::telemetry::{Metric, TelemetryPublisher};
use crate::volume::{VolumeInfoManager, VolumeMountStatus};

// =============================================================================
// Event scheduling
// =============================================================================

/// Executes events synchronously on the caller's thread.
#[derive(Default)]
pub struct InlineEventScheduler {
    executed: AtomicU64,
}

impl InlineEventScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Events run so far.
    pub fn executed(&self) -> u64 {
        self.executed.load(Ordering::Acquire)
    }
}

impl EventScheduler for InlineEventScheduler {
    fn enqueue_event(&self, event: EventPtr) -> Result<()> {
        self.executed.fetch_add(1, Ordering::AcqRel);
        if !event.execute() {
            warn!("inline event {} reported failure", event.name());
        }
        Ok(())
    }
}

/// Refuses every event; exercises submission-failure paths.
#[derive(Default)]
pub struct RejectingEventScheduler;

impl EventScheduler for RejectingEventScheduler {
    fn enqueue_event(&self, _event: EventPtr) -> Result<()> {
        Err(Error::EventSchedulerUnavailable {
            reason: "scheduler rejects all events".into(),
        })
    }
}

// =============================================================================
// Mapping
// =============================================================================

/// Stripe map backed by a hash map; unknown vsids report unmapped.
#[derive(Default)]
pub struct InMemoryStripeMap {
    map: Mutex<HashMap<StripeId, StripeAddr>>,
}

impl InMemoryStripeMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_lsa(&self, vsid: StripeId, addr: StripeAddr) {
        self.map.lock().insert(vsid, addr);
    }

    pub fn unmap(&self, vsid: StripeId) {
        self.map.lock().remove(&vsid);
    }
}

impl StripeMap for InMemoryStripeMap {
    fn get_lsa(&self, vsid: StripeId) -> StripeAddr {
        self.map
            .lock()
            .get(&vsid)
            .copied()
            .unwrap_or(StripeAddr::user(UNMAP_STRIPE))
    }
}

/// Arguments of one recorded reverse-map reconstruction.
#[derive(Debug, Clone)]
pub struct ReconstructCall {
    pub volume_id: u32,
    pub total_rba_num: u64,
    pub wb_lsid: StripeId,
    pub vsid: StripeId,
    pub offset: BlkOffset,
    pub num_infos: usize,
}

/// Reverse map that records reconstruction requests and succeeds.
#[derive(Default)]
pub struct RecordingReverseMap {
    calls: Mutex<Vec<ReconstructCall>>,
}

impl RecordingReverseMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<ReconstructCall> {
        self.calls.lock().clone()
    }
}

impl ReverseMap for RecordingReverseMap {
    fn reconstruct_reverse_map(
        &self,
        volume_id: u32,
        total_rba_num: u64,
        wb_lsid: StripeId,
        vsid: StripeId,
        offset: BlkOffset,
        rev_map_infos: &std::collections::BTreeMap<u64, BlkAddr>,
        _pack: &ReverseMapPack,
    ) -> Result<()> {
        self.calls.lock().push(ReconstructCall {
            volume_id,
            total_rba_num,
            wb_lsid,
            vsid,
            offset,
            num_infos: rev_map_infos.len(),
        });
        Ok(())
    }
}

// =============================================================================
// Volumes and QoS
// =============================================================================

/// Volume info with a fixed size and per-volume mount overrides
/// (everything defaults to mounted).
pub struct StaticVolumeInfo {
    size_bytes: u64,
    overrides: Mutex<HashMap<u32, VolumeMountStatus>>,
}

impl StaticVolumeInfo {
    pub fn new(size_bytes: u64) -> Self {
        Self {
            size_bytes,
            overrides: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_mount_status(&self, volume_id: u32, status: VolumeMountStatus) {
        self.overrides.lock().insert(volume_id, status);
    }
}

impl VolumeInfoManager for StaticVolumeInfo {
    fn mount_status(&self, volume_id: u32) -> VolumeMountStatus {
        self.overrides
            .lock()
            .get(&volume_id)
            .copied()
            .unwrap_or(VolumeMountStatus::Mounted)
    }

    fn volume_size(&self, _volume_id: u32) -> Result<u64> {
        Ok(self.size_bytes)
    }
}

/// Counts stripe-budget returns.
#[derive(Default)]
pub struct CountingQos {
    decrements: AtomicU64,
}

impl CountingQos {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decrements(&self) -> u64 {
        self.decrements.load(Ordering::Acquire)
    }
}

impl QosManager for CountingQos {
    fn decrease_used_stripe_cnt(&self, _array_name: &str) {
        self.decrements.fetch_add(1, Ordering::AcqRel);
    }
}

// =============================================================================
// Flush pipeline
// =============================================================================

/// Flush pipeline that completes every stripe immediately.
#[derive(Default)]
pub struct CompletingFlushDispatcher {
    completed: Mutex<Vec<StripeId>>,
}

impl CompletingFlushDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Vsids completed so far, in dispatch order.
    pub fn completed(&self) -> Vec<StripeId> {
        self.completed.lock().clone()
    }
}

impl FlushDispatcher for CompletingFlushDispatcher {
    fn dispatch(&self, stripe: Arc<Stripe>, _array_id: u32) -> Result<()> {
        stripe.complete_flush();
        self.completed.lock().push(stripe.vsid());
        Ok(())
    }
}

/// Flush pipeline that parks stripes for the test to complete later.
#[derive(Default)]
pub struct CollectingFlushDispatcher {
    pending: Mutex<Vec<Arc<Stripe>>>,
}

impl CollectingFlushDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Hand the parked stripes to the caller.
    pub fn take_pending(&self) -> Vec<Arc<Stripe>> {
        std::mem::take(&mut *self.pending.lock())
    }
}

impl FlushDispatcher for CollectingFlushDispatcher {
    fn dispatch(&self, stripe: Arc<Stripe>, _array_id: u32) -> Result<()> {
        self.pending.lock().push(stripe);
        Ok(())
    }
}

// =============================================================================
// Stripe I/O
// =============================================================================

/// Direction of a recorded stripe transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StripeIoKind {
    Read,
    Write,
}

/// Stripe I/O backend that records submissions and completes them inline.
#[derive(Default)]
pub struct RecordingStripeIoBackend {
    ops: Mutex<Vec<(StripeIoKind, StripeAddr)>>,
}

impl RecordingStripeIoBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ops(&self) -> Vec<(StripeIoKind, StripeAddr)> {
        self.ops.lock().clone()
    }
}

impl StripeIoBackend for RecordingStripeIoBackend {
    fn submit_read(
        &self,
        from: StripeAddr,
        _buffers: Arc<StripeLoadBuffers>,
        completion: EventPtr,
    ) -> Result<()> {
        self.ops.lock().push((StripeIoKind::Read, from));
        completion.execute();
        Ok(())
    }

    fn submit_write(
        &self,
        to: StripeAddr,
        _buffers: Arc<StripeLoadBuffers>,
        completion: EventPtr,
    ) -> Result<()> {
        self.ops.lock().push((StripeIoKind::Write, to));
        completion.execute();
        Ok(())
    }
}

// =============================================================================
// Telemetry
// =============================================================================

/// Captures published metric batches.
#[derive(Default)]
pub struct CapturingTelemetry {
    batches: Mutex<Vec<Vec<Metric>>>,
}

impl CapturingTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batch_count(&self) -> usize {
        self.batches.lock().len()
    }

    pub fn batches(&self) -> Vec<Vec<Metric>> {
        self.batches.lock().clone()
    }
}

impl TelemetryPublisher for CapturingTelemetry {
    fn publish_metric_list(&self, metrics: Vec<Metric>) {
        self.batches.lock().push(metrics);
    }
}
