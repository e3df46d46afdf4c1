//! Replay-time stripe reload: copy a flushed stripe's data from the user
//! area back into its write-buffer slot.
//!
//! The copy is a chain of three events. `ReadStripe` issues the user-area
//! read; its completion issues the write-buffer write; the write completion
//! returns the chunk buffers to the pool and reports to the load status:
//!
//! ```text
//! ReadStripe ──▶ ReadStripeCompletion ──▶ WriteStripeCompletion
//!   (read from        (write to               (release buffers,
//!    user area)        write buffer)           fan-in decrement)
//! ```

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing::error;

use crate::address::StripeAddr;
use crate::error::Result;
use crate::event::{Event, EventPtr};
use crate::mem::{BufferPool, ChunkBuf};

use super::load_status::StripeLoadStatus;

/// The chunk buffers staging one stripe through the reload copy.
#[derive(Debug)]
pub struct StripeLoadBuffers {
    chunks: Mutex<Vec<ChunkBuf>>,
}

impl StripeLoadBuffers {
    pub fn new(chunks: Vec<ChunkBuf>) -> Self {
        Self {
            chunks: Mutex::new(chunks),
        }
    }

    /// Borrow the chunks for an I/O submission.
    pub fn lock_chunks(&self) -> MutexGuard<'_, Vec<ChunkBuf>> {
        self.chunks.lock()
    }

    fn take_all(&self) -> Vec<ChunkBuf> {
        std::mem::take(&mut *self.chunks.lock())
    }
}

/// Back-end I/O contract for whole-stripe transfers.
///
/// Implementations invoke `completion` once the transfer has finished;
/// submission errors surface in the returned result.
pub trait StripeIoBackend: Send + Sync {
    fn submit_read(
        &self,
        from: StripeAddr,
        buffers: Arc<StripeLoadBuffers>,
        completion: EventPtr,
    ) -> Result<()>;

    fn submit_write(
        &self,
        to: StripeAddr,
        buffers: Arc<StripeLoadBuffers>,
        completion: EventPtr,
    ) -> Result<()>;
}

// =============================================================================
// Event chain
// =============================================================================

/// Head of the reload chain: read the stripe out of the user area.
pub struct ReadStripe {
    from: StripeAddr,
    buffers: Arc<StripeLoadBuffers>,
    next: EventPtr,
    backend: Arc<dyn StripeIoBackend>,
}

impl ReadStripe {
    pub fn new(
        from: StripeAddr,
        buffers: Arc<StripeLoadBuffers>,
        next: EventPtr,
        backend: Arc<dyn StripeIoBackend>,
    ) -> Self {
        Self {
            from,
            buffers,
            next,
            backend,
        }
    }
}

impl Event for ReadStripe {
    fn execute(&self) -> bool {
        match self.backend.submit_read(
            self.from,
            Arc::clone(&self.buffers),
            Arc::clone(&self.next),
        ) {
            Ok(()) => true,
            Err(e) => {
                error!(
                    "stripe reload read submission failed (userLsid {}): {}",
                    self.from.stripe_id, e
                );
                false
            }
        }
    }

    fn name(&self) -> &'static str {
        "read_stripe"
    }
}

/// Read landed: push the data into the write-buffer slot.
pub struct ReadStripeCompletion {
    to: StripeAddr,
    buffers: Arc<StripeLoadBuffers>,
    next: EventPtr,
    backend: Arc<dyn StripeIoBackend>,
}

impl ReadStripeCompletion {
    pub fn new(
        to: StripeAddr,
        buffers: Arc<StripeLoadBuffers>,
        next: EventPtr,
        backend: Arc<dyn StripeIoBackend>,
    ) -> Self {
        Self {
            to,
            buffers,
            next,
            backend,
        }
    }
}

impl Event for ReadStripeCompletion {
    fn execute(&self) -> bool {
        match self
            .backend
            .submit_write(self.to, Arc::clone(&self.buffers), Arc::clone(&self.next))
        {
            Ok(()) => true,
            Err(e) => {
                error!(
                    "stripe reload write submission failed (wbLsid {}): {}",
                    self.to.stripe_id, e
                );
                false
            }
        }
    }

    fn name(&self) -> &'static str {
        "read_stripe_completion"
    }
}

/// Write landed: recycle the buffers and close the fan-in.
pub struct WriteStripeCompletion {
    pool: Arc<BufferPool>,
    buffers: Arc<StripeLoadBuffers>,
    status: Arc<StripeLoadStatus>,
}

impl WriteStripeCompletion {
    pub fn new(
        pool: Arc<BufferPool>,
        buffers: Arc<StripeLoadBuffers>,
        status: Arc<StripeLoadStatus>,
    ) -> Self {
        Self {
            pool,
            buffers,
            status,
        }
    }
}

impl Event for WriteStripeCompletion {
    fn execute(&self) -> bool {
        for chunk in self.buffers.take_all() {
            self.pool.put(chunk);
        }
        self.status.stripe_load_finished();
        true
    }

    fn name(&self) -> &'static str {
        "write_stripe_completion"
    }
}
