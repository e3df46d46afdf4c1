//! Block and stripe addressing types.
//!
//! Two address spaces coexist in the engine:
//!
//! - **Virtual** addresses (`VirtualBlkAddr`) name a block by its virtual
//!   stripe id (VSID) and offset within the stripe.
//! - **Logical** addresses (`StripeAddr`) name where a stripe currently
//!   lives: a slot in the NVM write buffer or a slot in the user data area.
//!
//! Sentinel values follow the convention of the surrounding engine: the
//! all-ones pattern means "unmapped".

use serde::{Deserialize, Serialize};

/// Identifier of a stripe (virtual or logical, depending on context).
pub type StripeId = u32;

/// Block offset within a stripe.
pub type BlkOffset = u64;

/// Volume-relative block address used by the reverse map.
pub type BlkAddr = u64;

/// Index into the active-stripe tail array.
pub type TailArrayIdx = u32;

/// Sentinel stripe id: no stripe.
pub const UNMAP_STRIPE: StripeId = StripeId::MAX;

/// Sentinel block offset: no offset.
pub const UNMAP_OFFSET: BlkOffset = BlkOffset::MAX;

/// Sentinel reverse-map address written for never-written blocks.
pub const INVALID_RBA: BlkAddr = BlkAddr::MAX;

/// Sentinel volume id used with [`INVALID_RBA`] entries.
pub const INVALID_VOLUME_ID: u32 = u32::MAX;

/// Returns true if `stripe_id` is the unmapped sentinel.
#[inline]
pub fn is_unmap_stripe(stripe_id: StripeId) -> bool {
    stripe_id == UNMAP_STRIPE
}

// =============================================================================
// Virtual addresses
// =============================================================================

/// A block address in the virtual stripe space: `(vsid, offset)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualBlkAddr {
    pub stripe_id: StripeId,
    pub offset: BlkOffset,
}

/// The unmapped virtual block address.
pub const UNMAP_VSA: VirtualBlkAddr = VirtualBlkAddr {
    stripe_id: UNMAP_STRIPE,
    offset: UNMAP_OFFSET,
};

impl VirtualBlkAddr {
    pub fn new(stripe_id: StripeId, offset: BlkOffset) -> Self {
        Self { stripe_id, offset }
    }

    /// Returns true if this address is the unmapped sentinel.
    #[inline]
    pub fn is_unmapped(&self) -> bool {
        self.stripe_id == UNMAP_STRIPE && self.offset == UNMAP_OFFSET
    }
}

/// A contiguous run of virtual blocks starting at `start_vsa`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtualBlks {
    pub start_vsa: VirtualBlkAddr,
    pub num_blks: u32,
}

impl VirtualBlks {
    /// The empty run, anchored at the unmapped address.
    pub const fn empty() -> Self {
        Self {
            start_vsa: UNMAP_VSA,
            num_blks: 0,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.start_vsa.is_unmapped()
    }
}

// =============================================================================
// Logical addresses
// =============================================================================

/// Which area of the array a logical stripe address points into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StripeLoc {
    /// The NVM write buffer.
    InWriteBufferArea,
    /// The persistent user data area.
    InUserArea,
}

/// A logical stripe address: area discriminator plus slot id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StripeAddr {
    pub stripe_loc: StripeLoc,
    pub stripe_id: StripeId,
}

impl StripeAddr {
    pub fn wb(stripe_id: StripeId) -> Self {
        Self {
            stripe_loc: StripeLoc::InWriteBufferArea,
            stripe_id,
        }
    }

    pub fn user(stripe_id: StripeId) -> Self {
        Self {
            stripe_loc: StripeLoc::InUserArea,
            stripe_id,
        }
    }

    #[inline]
    pub fn is_unmapped(&self) -> bool {
        is_unmap_stripe(self.stripe_id)
    }
}

/// Maps a virtual stripe id to its destination slot in the user data area.
///
/// The user area is laid out so that slot ids coincide with virtual stripe
/// ids; the translation exists to keep call sites honest about which space
/// they are in.
#[inline]
pub fn vsid_to_user_lsid(vsid: StripeId) -> StripeId {
    vsid
}
