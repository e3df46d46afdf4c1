//! Configuration for the stripe manager and the meta-I/O completion pump.
//!
//! The structs here are the deserialization targets for the outer config
//! loader; the library itself never reads files.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::metaio::NUM_FILE_TYPES;

/// Default chunk size handed out by the stripe buffer pool (256 KiB).
pub const DEFAULT_CHUNK_SIZE: usize = 256 * 1024;

/// Default logical block size (4 KiB).
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

// =============================================================================
// Address geometry
// =============================================================================

/// Geometry of the write buffer and the stripes it holds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddressInfo {
    /// Number of slots in the write-buffer stripe table.
    pub num_wb_stripes: u32,

    /// Blocks per stripe.
    pub blks_per_stripe: u32,

    /// Chunks per stripe; sizes the reload buffer pool.
    pub chunks_per_stripe: u32,

    /// Bytes per chunk.
    pub chunk_size: usize,

    /// Bytes per logical block.
    pub block_size: usize,

    /// Number of volumes the array serves.
    pub num_volumes: u32,
}

impl Default for AddressInfo {
    fn default() -> Self {
        Self {
            num_wb_stripes: 64,
            blks_per_stripe: 64,
            chunks_per_stripe: 4,
            chunk_size: DEFAULT_CHUNK_SIZE,
            block_size: DEFAULT_BLOCK_SIZE,
            num_volumes: 256,
        }
    }
}

impl AddressInfo {
    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.num_wb_stripes == 0 {
            return Err(Error::InvalidConfig("num_wb_stripes must be > 0".into()));
        }
        if self.blks_per_stripe == 0 {
            return Err(Error::InvalidConfig("blks_per_stripe must be > 0".into()));
        }
        if self.chunks_per_stripe == 0 {
            return Err(Error::InvalidConfig("chunks_per_stripe must be > 0".into()));
        }
        if self.chunk_size == 0 || !self.chunk_size.is_power_of_two() {
            return Err(Error::InvalidConfig(
                "chunk_size must be a nonzero power of 2".into(),
            ));
        }
        if self.block_size == 0 || !self.block_size.is_power_of_two() {
            return Err(Error::InvalidConfig(
                "block_size must be a nonzero power of 2".into(),
            ));
        }
        Ok(())
    }

    /// Total chunk count the reload buffer pool is sized for.
    ///
    /// Every resident stripe may be reloaded concurrently, so the pool holds
    /// the worst case.
    pub fn total_pool_chunks(&self) -> usize {
        self.num_wb_stripes as usize * self.chunks_per_stripe as usize
    }
}

// =============================================================================
// Meta-I/O pump
// =============================================================================

/// Configuration for the meta-I/O completion pump.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaIoConfig {
    /// Weighted round-robin weight per meta file type, indexed by
    /// [`crate::metaio::MetaFileType`].
    pub wrr_weights: [u32; NUM_FILE_TYPES],

    /// Every n-th completed write mpio contributes latency samples.
    pub sampling_skip_count: u64,

    /// Minimum gap between two telemetry publications.
    pub metric_interval: Duration,
}

impl Default for MetaIoConfig {
    fn default() -> Self {
        Self {
            // Journal completions are latency critical and get the largest share.
            wrr_weights: [1, 3, 1, 1],
            sampling_skip_count: 100,
            metric_interval: Duration::from_secs(5),
        }
    }
}

impl MetaIoConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.wrr_weights.iter().any(|&w| w == 0) {
            return Err(Error::InvalidConfig(
                "wrr_weights must all be > 0 (a zero weight starves its class)".into(),
            ));
        }
        if self.sampling_skip_count == 0 {
            return Err(Error::InvalidConfig(
                "sampling_skip_count must be > 0".into(),
            ));
        }
        Ok(())
    }
}
