//! Contracts of the mapping subsystems.
//!
//! The stripe manager consults the logical-to-physical stripe map to decide
//! where a stripe currently lives, and delegates reverse-map persistence to
//! the reverse-map subsystem. Both live outside this crate; only their
//! contracts and the in-memory per-stripe reverse-map pack are defined here.

use std::collections::BTreeMap;

use parking_lot::Mutex;

use crate::address::{BlkAddr, BlkOffset, StripeAddr, StripeId, StripeLoc, INVALID_RBA,
    INVALID_VOLUME_ID};
use crate::error::Result;

/// Logical-to-physical stripe map.
pub trait StripeMap: Send + Sync {
    /// Current logical address of the given virtual stripe.
    fn get_lsa(&self, vsid: StripeId) -> StripeAddr;

    /// Whether the logical address points into the user data area.
    fn is_in_user_data_area(&self, lsa: StripeAddr) -> bool {
        lsa.stripe_loc == StripeLoc::InUserArea
    }
}

/// Reverse-map persistence subsystem.
pub trait ReverseMap: Send + Sync {
    /// Rebuild the reverse-map entries of a reconstructed stripe.
    ///
    /// `rev_map_infos` maps stripe offsets to the RBAs recovered from the
    /// journal; `total_rba_num` bounds the volume's address space in blocks.
    #[allow(clippy::too_many_arguments)]
    fn reconstruct_reverse_map(
        &self,
        volume_id: u32,
        total_rba_num: u64,
        wb_lsid: StripeId,
        vsid: StripeId,
        offset: BlkOffset,
        rev_map_infos: &BTreeMap<u64, BlkAddr>,
        pack: &ReverseMapPack,
    ) -> Result<()>;
}

// =============================================================================
// ReverseMapPack
// =============================================================================

/// One reverse-map entry: which volume block a stripe offset holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RevMapEntry {
    pub rba: BlkAddr,
    pub volume_id: u32,
}

impl RevMapEntry {
    /// Entry written for blocks that never received data.
    pub const INVALID: Self = Self {
        rba: INVALID_RBA,
        volume_id: INVALID_VOLUME_ID,
    };
}

/// In-memory reverse map of one stripe, one entry per block.
///
/// The pack is persisted alongside the stripe by the flush pipeline; until
/// then it is mutated concurrently by front-end writers recording their
/// block addresses.
#[derive(Debug)]
pub struct ReverseMapPack {
    entries: Mutex<Vec<RevMapEntry>>,
}

impl ReverseMapPack {
    /// Create a pack sized for `blks_per_stripe`, all entries invalid.
    pub fn new(blks_per_stripe: u32) -> Self {
        Self {
            entries: Mutex::new(vec![RevMapEntry::INVALID; blks_per_stripe as usize]),
        }
    }

    /// Record the reverse mapping of one block.
    ///
    /// # Panics
    ///
    /// Panics if `offset` is outside the stripe.
    pub fn update_entry(&self, offset: BlkOffset, rba: BlkAddr, volume_id: u32) {
        let mut entries = self.entries.lock();
        let len = entries.len();
        assert!(
            (offset as usize) < len,
            "reverse map offset {} out of range (blks_per_stripe {})",
            offset,
            len
        );
        entries[offset as usize] = RevMapEntry { rba, volume_id };
    }

    /// Read one entry back.
    pub fn entry(&self, offset: BlkOffset) -> RevMapEntry {
        self.entries.lock()[offset as usize]
    }

    /// Number of blocks covered by this pack.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Count of entries still holding the invalid sentinel.
    pub fn invalid_entries(&self) -> usize {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.rba == INVALID_RBA)
            .count()
    }
}
