//! # vtex Core
//!
//! Cache core of the vtex virtual texture streaming system.
//!
//! This crate provides the pieces of the tile cache that involve no GPU or I/O:
//! - **Tiles**: Packed tile identifiers, sorting keys and packed mip tail math
//! - **Allocator**: Fixed pool of heap blocks with free/stale/in-use tracking
//! - **Feedback**: Readback decoding, compaction reference and mip fallback expansion
//! - **Upload**: Linear staging memory for tile copies

pub mod allocator;
pub mod feedback;
pub mod tile;
pub mod upload;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use allocator::{
    AllocatedBlock, AllocatorStats, Block, BlockAllocation, BlockAllocator, BlockPartition,
    BlockState,
};
pub use feedback::{
    ExpansionStats, FEEDBACK_HEADER_SIZE, FeedbackHeader, FeedbackReadback, compact_feedback,
    decode_feedback, encode_feedback, expand_mip_fallback, sort_and_dedup,
};
pub use tile::{
    GpuTileId, MAX_MIP_LEVELS, PackedMipInfo, TILE_BYTE_SIZE, TextureId, TextureLayout, TileId,
    packed_mip_start,
};
pub use upload::{LinearUploadHeap, UploadHeap, UploadReservation, UploadStats};

/// Core errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type for core operations
pub type CoreResult<T> = Result<T, CoreError>;

/// Streaming cache configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Size of the GPU tile heap in bytes
    pub cache_size_bytes: u64,
    /// Size of one heap block in bytes, equal to the tile payload size
    pub block_size_bytes: u64,
    /// Size of the feedback readback buffer in bytes
    pub readback_buffer_size: usize,
    /// Maximum feedback records processed per update
    pub max_requests_per_update: usize,
    /// Maximum blocks bound per update
    pub allocation_budget: usize,
    /// Idle updates before an in-use block becomes stale
    pub stale_frame_threshold: u32,
    /// Worker threads for update tasks (0 = one per core)
    pub worker_threads: usize,
    /// Feedback render target size in texels
    pub feedback_target_size: [u32; 2],
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            cache_size_bytes: 64 * 1024 * 1024,
            block_size_bytes: TILE_BYTE_SIZE as u64,
            readback_buffer_size: 2 * 1024 * 1024,
            max_requests_per_update: 2048,
            allocation_budget: 128,
            stale_frame_threshold: 120,
            worker_threads: 0,
            feedback_target_size: [128, 128],
        }
    }
}

impl StreamingConfig {
    /// Check the configuration for values the cache cannot run with
    pub fn validate(&self) -> CoreResult<()> {
        if self.block_size_bytes != TILE_BYTE_SIZE as u64 {
            return Err(CoreError::InvalidConfig(format!(
                "block size {} does not match the {TILE_BYTE_SIZE} byte tile size",
                self.block_size_bytes
            )));
        }
        if self.cache_size_bytes < self.block_size_bytes {
            return Err(CoreError::InvalidConfig(format!(
                "cache size {} is smaller than one block",
                self.cache_size_bytes
            )));
        }
        if self.cache_size_bytes % self.block_size_bytes != 0 {
            return Err(CoreError::InvalidConfig(format!(
                "cache size {} is not a multiple of block size {}",
                self.cache_size_bytes, self.block_size_bytes
            )));
        }
        if self.block_count() > u32::MAX as u64 {
            return Err(CoreError::InvalidConfig("too many blocks".into()));
        }
        if self.max_requests_per_update == 0 {
            return Err(CoreError::InvalidConfig("request cap is zero".into()));
        }
        if self.readback_buffer_size < FEEDBACK_HEADER_SIZE {
            return Err(CoreError::InvalidConfig(format!(
                "readback buffer of {} bytes cannot hold the header",
                self.readback_buffer_size
            )));
        }
        Ok(())
    }

    /// Number of heap blocks
    pub fn block_count(&self) -> u64 {
        self.cache_size_bytes / self.block_size_bytes.max(1)
    }

    /// Worker thread count with the default resolved
    pub fn resolved_worker_threads(&self) -> usize {
        if self.worker_threads == 0 {
            rayon::current_num_threads()
        } else {
            self.worker_threads
        }
    }

    /// Create an allocator sized by this configuration
    pub fn create_allocator(&self) -> BlockAllocator {
        BlockAllocator::new(
            self.block_count() as u32,
            self.block_size_bytes,
            self.stale_frame_threshold,
        )
    }
}
