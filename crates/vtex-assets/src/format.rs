//! Block-Compressed Formats
//!
//! Per-format block sizes and the texel shape of one 64 KiB tile.

use std::str::FromStr;

use glam::UVec2;
use serde::{Deserialize, Serialize};
use vtex_core::TILE_BYTE_SIZE;

use crate::AssetError;

/// Texel edge length of one compression block
pub const BLOCK_DIM: u32 = 4;

/// Block-compressed texture formats that can be streamed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TextureFormat {
    Bc1,
    Bc2,
    Bc3,
    Bc4,
    Bc5,
    Bc6H,
    Bc7,
}

impl TextureFormat {
    /// All streamable formats
    pub const ALL: [Self; 7] = [
        Self::Bc1,
        Self::Bc2,
        Self::Bc3,
        Self::Bc4,
        Self::Bc5,
        Self::Bc6H,
        Self::Bc7,
    ];

    /// Bytes per 4x4 block
    pub fn block_byte_size(&self) -> u32 {
        match self {
            Self::Bc1 | Self::Bc4 => 8,
            Self::Bc2 | Self::Bc3 | Self::Bc5 | Self::Bc6H | Self::Bc7 => 16,
        }
    }

    /// Texel dimensions of one tile
    ///
    /// 64-bit block formats tile as 512x256, 128-bit formats as 256x256.
    pub fn tile_texels(&self) -> UVec2 {
        match self.block_byte_size() {
            8 => UVec2::new(512, 256),
            _ => UVec2::new(256, 256),
        }
    }

    /// Block dimensions of one tile
    pub fn tile_blocks(&self) -> UVec2 {
        self.tile_texels() / BLOCK_DIM
    }

    /// Block grid covering a level of `wh` texels
    pub fn level_blocks(&self, wh: UVec2) -> UVec2 {
        UVec2::new(
            wh.x.max(1).div_ceil(BLOCK_DIM),
            wh.y.max(1).div_ceil(BLOCK_DIM),
        )
    }

    /// Byte size of a level of `wh` texels
    pub fn level_byte_size(&self, wh: UVec2) -> u64 {
        let blocks = self.level_blocks(wh);
        blocks.x as u64 * blocks.y as u64 * self.block_byte_size() as u64
    }

    /// Short lowercase name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Bc1 => "bc1",
            Self::Bc2 => "bc2",
            Self::Bc3 => "bc3",
            Self::Bc4 => "bc4",
            Self::Bc5 => "bc5",
            Self::Bc6H => "bc6h",
            Self::Bc7 => "bc7",
        }
    }
}

impl std::fmt::Display for TextureFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for TextureFormat {
    type Err = AssetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|format| format.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| AssetError::UnsupportedFormat(s.to_string()))
    }
}

/// Check that a format's tile shape fills exactly one tile
pub fn tile_fills_block(format: TextureFormat) -> bool {
    let blocks = format.tile_blocks();
    (blocks.x * blocks.y * format.block_byte_size()) as usize == TILE_BYTE_SIZE
}
