//! Flush submission into the back-end pipeline.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tracing::error;

use crate::error::Result;
use crate::event::Event;

use super::stripe::Stripe;

// =============================================================================
// FlushIo barrier
// =============================================================================

/// Barrier attached to live stripes when an external flush command wants to
/// know when a volume's write-buffer content has drained.
///
/// Each stripe that accepts the barrier adds one pending unit and completes
/// it when its own flush finishes.
#[derive(Debug, Default)]
pub struct FlushIo {
    pending: AtomicU32,
}

impl FlushIo {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add_pending(&self) {
        self.pending.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn complete_one(&self) {
        let prev = self.pending.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "flush barrier completed more stripes than attached");
    }

    /// Number of stripes still holding the barrier open.
    pub fn pending(&self) -> u32 {
        self.pending.load(Ordering::Acquire)
    }

    /// True once every attached stripe has drained.
    pub fn is_completed(&self) -> bool {
        self.pending() == 0
    }
}

// =============================================================================
// Flush submission
// =============================================================================

/// Back-end flush pipeline contract.
///
/// `dispatch` queues the stripe's data and reverse map for writing to the
/// user area. The pipeline calls [`Stripe::complete_flush`] once both are
/// durable.
pub trait FlushDispatcher: Send + Sync {
    fn dispatch(&self, stripe: Arc<Stripe>, array_id: u32) -> Result<()>;
}

/// Event carrying one stripe into the flush pipeline.
pub struct FlushSubmission {
    stripe: Arc<Stripe>,
    array_id: u32,
    dispatcher: Arc<dyn FlushDispatcher>,
}

impl FlushSubmission {
    pub fn new(stripe: Arc<Stripe>, array_id: u32, dispatcher: Arc<dyn FlushDispatcher>) -> Self {
        Self {
            stripe,
            array_id,
            dispatcher,
        }
    }
}

impl Event for FlushSubmission {
    fn execute(&self) -> bool {
        match self
            .dispatcher
            .dispatch(Arc::clone(&self.stripe), self.array_id)
        {
            Ok(()) => true,
            Err(e) => {
                error!(
                    "flush dispatch failed for stripe (vsid {}, wbLsid {}): {}",
                    self.stripe.vsid(),
                    self.stripe.wb_lsid(),
                    e
                );
                false
            }
        }
    }

    fn name(&self) -> &'static str {
        "flush_submission"
    }
}
