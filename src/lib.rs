//! nvmlog - Write-Buffer Stripe Subsystem
//!
//! The core of a log-structured block-storage engine that fronts a
//! persistent array with a faster NVM write buffer. Application writes
//! accumulate into fixed-size stripes in the write buffer; when a stripe
//! fills (or is forcibly closed) it is flushed to the user data area, its
//! reverse map is persisted, and its write-buffer slot is reclaimed. On
//! restart, stripes that were still resident at crash time are
//! reconstructed and restaged before normal I/O resumes.
//!
//! # Architecture
//!
//! ```text
//! front-end writers ──▶ WbStripeManager ──▶ flush pipeline (events)
//!        │                    │  ▲
//!        ▼                    ▼  │
//!  AllocatorContext     stripe table        replay driver
//!  (active tails)      (wbLsid slots)   (reconstruct + reload)
//! ```
//!
//! An independent pipeline, the [`metaio`] completion pump, drains
//! completed meta-file I/O fragments from a weighted round-robin queue with
//! the same pool-release discipline.
//!
//! # Modules
//!
//! - [`address`] - stripe/block address types and sentinels
//! - [`allocator`] - stripe lifecycle: table, tails, flush, replay reload
//! - [`config`] - geometry and meta-I/O configuration
//! - [`error`] - error types
//! - [`event`] - back-end event execution contracts
//! - [`mapper`] - stripe-map and reverse-map collaborator contracts
//! - [`mem`] - aligned chunk buffers and the reload buffer pool
//! - [`metaio`] - mpio descriptors, WRR done-queue, completion pump
//! - [`mock`] - in-memory collaborators for hermetic harnesses
//! - [`qos`] - QoS accounting contract
//! - [`telemetry`] - push-metric value model
//! - [`volume`] - volume-metadata contract

pub mod address;
pub mod allocator;
pub mod config;
pub mod error;
pub mod event;
pub mod mapper;
pub mod mem;
pub mod metaio;
pub mod mock;
pub mod qos;
pub mod telemetry;
pub mod volume;

// Re-export commonly used types
pub use address::{StripeAddr, StripeLoc, VirtualBlkAddr, VirtualBlks};
pub use allocator::{
    AllocatorContext, FlushDispatcher, FlushIo, Stripe, StripeLoadStatus, WbStripeManager,
};
pub use config::{AddressInfo, MetaIoConfig};
pub use error::{Error, Result};
pub use metaio::{MpioAllocator, MpioCompletionPump};
