//! # vtex Assets
//!
//! Texture assets for the vtex streaming system.
//!
//! ## Features
//! - Content- and path-addressed asset handles
//! - Block-compressed format table with per-format tile shapes
//! - Texture container with a bincode header and a full mip chain
//! - Memory and file backed asset stores
//! - Tile content source producing upload payloads per tile or per level

pub mod container;
pub mod decoder;
pub mod format;
pub mod store;

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use vtex_core::TileId;
use vtex_platform::PlatformError;

pub use container::{TextureAssetHeader, build_synthetic_texture, full_mip_count};
pub use decoder::{LevelUpload, TextureDecoder, TextureStreamContext};
pub use format::TextureFormat;
pub use store::{AssetStore, FileAssetStore, MemoryAssetStore};

/// Asset errors
#[derive(Error, Debug)]
pub enum AssetError {
    #[error("Asset not found: {0}")]
    NotFound(AssetHandle),

    #[error("Invalid texture header: {0}")]
    InvalidHeader(String),

    #[error("Unsupported texture format: {0}")]
    UnsupportedFormat(String),

    #[error("Mip level {level} out of range for {mip_count} levels")]
    MipOutOfRange { level: u32, mip_count: u32 },

    #[error("Tile {0:?} outside the level")]
    TileOutOfRange(TileId),

    #[error("Read of {len} bytes at offset {offset} exceeds asset {asset}")]
    OutOfBounds {
        asset: AssetHandle,
        offset: u64,
        len: usize,
    },

    #[error("Upload heap cannot fit {size} bytes")]
    UploadHeapExhausted { size: usize },

    #[error("No level is open")]
    NotOpen,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),
}

/// Result type for asset operations
pub type AssetResult<T> = Result<T, AssetError>;

/// Handle of a streamable asset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AssetHandle(pub u64);

impl AssetHandle {
    /// Create a handle from content bytes
    pub fn from_content(content: &[u8]) -> Self {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        content.hash(&mut hasher);
        Self(hasher.finish())
    }

    /// Create a handle from a path
    pub fn from_path(path: &Path) -> Self {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        path.hash(&mut hasher);
        Self(hasher.finish())
    }

    /// Get the raw handle value
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for AssetHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}
