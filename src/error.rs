//! Error types for the write-buffer stripe subsystem.

use thiserror::Error;

use crate::address::StripeId;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the stripe manager and its collaborators.
///
/// Invariant violations (double free, assignment into an occupied slot,
/// buffer-pool underflow during reload) are not represented here; they are
/// asserted and handled by the process-level supervisor.
#[derive(Error, Debug)]
pub enum Error {
    /// Stripe reconstruction was asked to replay an impossible block count.
    #[error("wrong block count: {block_count}")]
    WrongBlockCount { block_count: u64 },

    /// Handing a stripe to the flush pipeline failed.
    #[error("flush submission failed for stripe (vsid {vsid}, wbLsid {wb_lsid})")]
    FlushSubmissionFailed { vsid: StripeId, wb_lsid: StripeId },

    /// The stripe buffer pool could not be created at init.
    #[error("failed to create stripe buffer pool ({count} chunks of {size} bytes)")]
    BufferPoolCreation { size: usize, count: usize },

    /// The volume service could not report a volume's size.
    #[error("volume size unavailable for volume {volume_id}")]
    VolumeSizeUnavailable { volume_id: u32 },

    /// The event scheduler refused an event.
    #[error("event scheduler rejected event: {reason}")]
    EventSchedulerUnavailable { reason: String },

    /// Reverse-map reconstruction failed.
    #[error("reverse map reconstruction failed for volume {volume_id}: {reason}")]
    ReverseMapReconstruction { volume_id: u32, reason: String },

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
