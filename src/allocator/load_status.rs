//! Fan-in counter for in-flight stripe reloads during replay.

use std::sync::atomic::{AtomicU32, Ordering};

/// Counts outstanding stripe reloads.
///
/// The replay driver increments once per issued reload and the write
/// completion decrements; `is_done` holds once everything issued has
/// landed. Release/acquire on the counter is the only ordering offered.
#[derive(Debug, Default)]
pub struct StripeLoadStatus {
    outstanding: AtomicU32,
}

impl StripeLoadStatus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Zero the counter before a replay pass.
    pub fn reset(&self) {
        self.outstanding.store(0, Ordering::Release);
    }

    pub fn stripe_load_started(&self) {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
    }

    /// # Panics
    ///
    /// Panics if no load is outstanding; a completion without a matching
    /// start is an accounting bug.
    pub fn stripe_load_finished(&self) {
        let prev = self.outstanding.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "stripe load finished with none outstanding");
    }

    pub fn is_done(&self) -> bool {
        self.outstanding.load(Ordering::Acquire) == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_done_and_tracks_fan_in() {
        let status = StripeLoadStatus::new();
        assert!(status.is_done());

        status.reset();
        status.stripe_load_started();
        status.stripe_load_started();
        assert!(!status.is_done());

        status.stripe_load_finished();
        assert!(!status.is_done());
        status.stripe_load_finished();
        assert!(status.is_done());
    }

    #[test]
    #[should_panic(expected = "none outstanding")]
    fn unbalanced_finish_panics() {
        let status = StripeLoadStatus::new();
        status.stripe_load_finished();
    }
}
