//! Back-end event execution contracts.
//!
//! The stripe manager never runs back-end work inline; it packages the work
//! as an [`Event`] and hands it to an [`EventScheduler`]. The shipped
//! scheduler dispatches onto a tokio runtime's blocking pool; tests use the
//! inline scheduler from [`crate::mock`].

use std::sync::Arc;

use tracing::warn;

use crate::error::Result;

/// A unit of back-end work.
///
/// `execute` returns `true` on success. A `false` return means the event
/// could not make progress and should be redriven.
pub trait Event: Send + Sync {
    fn execute(&self) -> bool;

    /// Short name used in logs.
    fn name(&self) -> &'static str {
        "event"
    }
}

pub type EventPtr = Arc<dyn Event>;

/// Executes events asynchronously with at-least-once semantics: once
/// `enqueue_event` returns `Ok`, the event will eventually run (and be
/// redriven until it reports success).
pub trait EventScheduler: Send + Sync {
    fn enqueue_event(&self, event: EventPtr) -> Result<()>;
}

/// Event scheduler backed by a tokio runtime's blocking pool.
pub struct TokioEventScheduler {
    handle: tokio::runtime::Handle,
}

impl TokioEventScheduler {
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }
}

impl EventScheduler for TokioEventScheduler {
    fn enqueue_event(&self, event: EventPtr) -> Result<()> {
        self.handle.spawn_blocking(move || {
            while !event.execute() {
                warn!("event {} did not complete, redriving", event.name());
                std::thread::sleep(std::time::Duration::from_millis(1));
            }
        });
        Ok(())
    }
}
