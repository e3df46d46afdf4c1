//! Write-buffer stripe lifecycle: the stripe state machine, the per-volume
//! active-stripe tails, and the manager that owns the write-buffer stripe
//! table.

mod context;
mod flush;
mod load_status;
mod reload;
mod stripe;
mod wb_stripe_manager;

mod proptest;

pub use context::AllocatorContext;
pub use flush::{FlushDispatcher, FlushIo, FlushSubmission};
pub use load_status::StripeLoadStatus;
pub use reload::{
    ReadStripe, ReadStripeCompletion, StripeIoBackend, StripeLoadBuffers, WriteStripeCompletion,
};
pub use stripe::Stripe;
pub use wb_stripe_manager::WbStripeManager;
