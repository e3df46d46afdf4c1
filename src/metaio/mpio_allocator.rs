//! Pooled allocation of mpios.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::mpio::{MetaIoOpcode, Mpio, MpioIoInfo, MpioTimestampStage};

/// How long a released write mpio may sit in the reuse cache before the
/// pump's eviction hook moves it back to the free list.
const CACHE_TTL: Duration = Duration::from_millis(100);

/// Write mpios kept warm for partial-write coalescing.
const CACHE_CAPACITY: usize = 32;

/// Fixed pool of mpios, one free list per direction.
///
/// Released write mpios pass through a small bounded cache so a partial
/// write landing soon after can reuse a warm descriptor; the pump calls
/// [`MpioAllocator::try_release_the_oldest_cache`] each pass to age them
/// out.
pub struct MpioAllocator {
    free: [Mutex<Vec<Arc<Mpio>>>; 2],
    release_cache: Mutex<VecDeque<(Instant, Arc<Mpio>)>>,
    capacity_per_type: usize,
}

impl MpioAllocator {
    /// Pre-create `capacity_per_type` mpios per direction.
    pub fn new(capacity_per_type: usize) -> Self {
        let make_pool = |opcode: MetaIoOpcode| {
            Mutex::new(
                (0..capacity_per_type)
                    .map(|_| {
                        Arc::new(Mpio::new(MpioIoInfo {
                            opcode,
                            ..Default::default()
                        }))
                    })
                    .collect::<Vec<_>>(),
            )
        };
        Self {
            free: [make_pool(MetaIoOpcode::Write), make_pool(MetaIoOpcode::Read)],
            release_cache: Mutex::new(VecDeque::new()),
            capacity_per_type,
        }
    }

    /// Take an mpio for the given I/O, or `None` when the direction's pool
    /// is exhausted. The descriptor is re-armed and stamped `Allocate`.
    pub fn try_alloc(&self, io: MpioIoInfo) -> Option<Arc<Mpio>> {
        let mpio = self.free[io.opcode.index()].lock().pop()?;
        mpio.reuse(io);
        mpio.store_timestamp(MpioTimestampStage::Allocate);
        Some(mpio)
    }

    /// Return a completed mpio. Writes detour through the reuse cache;
    /// reads go straight back to their free list.
    pub fn release(&self, mpio: Arc<Mpio>) {
        match mpio.opcode() {
            MetaIoOpcode::Write => {
                let mut cache = self.release_cache.lock();
                if cache.len() >= CACHE_CAPACITY {
                    if let Some((_, oldest)) = cache.pop_front() {
                        self.free[MetaIoOpcode::Write.index()].lock().push(oldest);
                    }
                }
                cache.push_back((Instant::now(), mpio));
            }
            MetaIoOpcode::Read => {
                self.free[MetaIoOpcode::Read.index()].lock().push(mpio);
            }
        }
    }

    /// Age out at most one cached write mpio. Bounded eviction hook run by
    /// the pump on every pass.
    pub fn try_release_the_oldest_cache(&self) {
        let mut cache = self.release_cache.lock();
        let expired = matches!(cache.front(), Some((since, _)) if since.elapsed() >= CACHE_TTL);
        if expired {
            if let Some((_, oldest)) = cache.pop_front() {
                self.free[MetaIoOpcode::Write.index()].lock().push(oldest);
            }
        }
    }

    /// Mpios immediately allocatable for a direction.
    pub fn free_count(&self, opcode: MetaIoOpcode) -> usize {
        self.free[opcode.index()].lock().len()
    }

    /// Write mpios currently parked in the reuse cache.
    pub fn cached_count(&self) -> usize {
        self.release_cache.lock().len()
    }

    pub fn capacity_per_type(&self) -> usize {
        self.capacity_per_type
    }
}
