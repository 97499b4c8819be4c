//! Tile Identifiers
//!
//! Compact tile addressing for streamed textures:
//! - `TileId`: packed (mip, x, y, packed-flag) in 32 bits, the layout the feedback shaders write
//! - `GpuTileId`: (texture, tile) pair as it appears in the readback buffer
//! - Sorting keys and the priority order used by the block allocator
//! - Packed mip tail math for a texture's dimensions

use std::cmp::Ordering;

use bytemuck::{Pod, Zeroable};
use glam::UVec2;
use serde::{Deserialize, Serialize};

/// Mip levels addressable by a tile ID
pub const MAX_MIP_LEVELS: u32 = 16;

/// Largest tile coordinate representable in a tile ID
pub const MAX_TILE_COORD: u32 = 0xfff;

/// Byte size of one GPU memory tile (the D3D/Vulkan standard sparse tile size)
pub const TILE_BYTE_SIZE: usize = 64 * 1024;

const Y_SHIFT: u32 = 0;
const X_SHIFT: u32 = 12;
const MIP_SHIFT: u32 = 24;
const PACKED_SHIFT: u32 = 31;
const COORD_MASK: u32 = 0xfff;
const MIP_MASK: u32 = 0x7f;

/// Identifier of a streamed texture resource as seen by the GPU
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Pod, Zeroable, Serialize, Deserialize)]
#[repr(transparent)]
pub struct TextureId(pub u32);

impl TextureId {
    /// Invalid texture marker
    pub const INVALID: Self = Self(u32::MAX);

    /// Check if this ID refers to a texture
    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }

    /// Get the raw ID value
    pub fn value(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for TextureId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tex#{}", self.0)
    }
}

/// Packed tile address within one texture
///
/// Bit layout: `y[0..12] | x[12..24] | mip[24..31] | packed[31]`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Pod, Zeroable, Serialize, Deserialize)]
#[repr(transparent)]
pub struct TileId(u32);

impl TileId {
    /// Invalid tile marker (all bits set)
    pub const INVALID: Self = Self(u32::MAX);

    /// Create a tile ID for an individually tiled mip level
    ///
    /// Panics if the mip level or coordinates do not fit the encoding.
    pub fn new(x: u32, y: u32, mip_level: u32) -> Self {
        assert!(
            mip_level < MAX_MIP_LEVELS,
            "mip level {mip_level} out of range"
        );
        assert!(
            x <= MAX_TILE_COORD && y <= MAX_TILE_COORD,
            "tile coordinate ({x}, {y}) out of range"
        );

        Self((mip_level << MIP_SHIFT) | (x << X_SHIFT) | (y << Y_SHIFT))
    }

    /// Create the tile ID of a texture's packed mip tail starting at `mip_level`
    pub fn packed(mip_level: u32) -> Self {
        assert!(
            mip_level < MAX_MIP_LEVELS,
            "mip level {mip_level} out of range"
        );

        Self((1 << PACKED_SHIFT) | (mip_level << MIP_SHIFT))
    }

    /// Reinterpret raw bits (as written by the GPU)
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Get the raw bits
    pub const fn bits(&self) -> u32 {
        self.0
    }

    /// Tile column
    pub fn x(&self) -> u32 {
        (self.0 >> X_SHIFT) & COORD_MASK
    }

    /// Tile row
    pub fn y(&self) -> u32 {
        (self.0 >> Y_SHIFT) & COORD_MASK
    }

    /// Mip level of the tile (first level of the tail for packed tiles)
    pub fn mip_level(&self) -> u32 {
        (self.0 >> MIP_SHIFT) & MIP_MASK
    }

    /// Whether this tile addresses the packed mip tail
    pub fn is_packed(&self) -> bool {
        (self.0 >> PACKED_SHIFT) & 0x01 != 0
    }

    /// Whether the encoded fields describe an addressable tile
    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID && self.mip_level() < MAX_MIP_LEVELS
    }

    /// The tile one level coarser that covers this one
    pub fn parent(&self) -> Self {
        Self::new(self.x() >> 1, self.y() >> 1, self.mip_level() + 1)
    }
}

impl std::fmt::Debug for TileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if *self == Self::INVALID {
            write!(f, "TileId(invalid)")
        } else if self.is_packed() {
            write!(f, "TileId(packed, mip {})", self.mip_level())
        } else {
            write!(
                f,
                "TileId(mip {}, {}, {})",
                self.mip_level(),
                self.x(),
                self.y()
            )
        }
    }
}

/// Tile request record as written by the feedback pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Pod, Zeroable, Serialize, Deserialize)]
#[repr(C)]
pub struct GpuTileId {
    /// Texture the tile belongs to
    pub texture: TextureId,
    /// Tile within the texture
    pub tile: TileId,
}

impl GpuTileId {
    /// Create a new GPU tile ID
    pub fn new(texture: TextureId, tile: TileId) -> Self {
        Self { texture, tile }
    }

    /// Whether the record names a valid texture and tile
    pub fn is_valid(&self) -> bool {
        self.texture.is_valid() && self.tile.is_valid()
    }

    /// Whether the record addresses a packed mip tail
    pub fn is_packed(&self) -> bool {
        self.tile.is_packed()
    }

    /// Total-order key: texture, then mip, x, y and finally the packed flag
    ///
    /// Dropping the low bit and shifting the coordinate fields right by one yields the key of
    /// the parent tile's coordinates, which keeps a tile's ancestors adjacent after sorting.
    pub fn sorting_key(&self) -> u64 {
        let tile = &self.tile;
        let local = (tile.mip_level() << 25)
            | (tile.x() << 13)
            | (tile.y() << 1)
            | tile.is_packed() as u32;

        ((self.texture.0 as u64) << 32) | local as u64
    }

    /// Allocation priority order: finer mips first, then sorting key
    pub fn priority_cmp(&self, rhs: &Self) -> Ordering {
        self.tile
            .mip_level()
            .cmp(&rhs.tile.mip_level())
            .then_with(|| self.sorting_key().cmp(&rhs.sorting_key()))
    }
}

impl PartialOrd for GpuTileId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for GpuTileId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sorting_key().cmp(&other.sorting_key())
    }
}

/// First mip level of the packed tail for a texture of `wh` texels
///
/// `log2(min(wh)) - log2(min(tile)) + 1`, clamped at zero.
pub fn packed_mip_start(wh: UVec2, tile_texels: UVec2) -> u32 {
    let min_wh = wh.x.min(wh.y).max(1);
    let min_tile = tile_texels.x.min(tile_texels.y).max(1);
    let start = min_wh.ilog2() as i64 - min_tile.ilog2() as i64 + 1;

    start.max(0) as u32
}

/// Packed mip tail range of a texture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackedMipInfo {
    /// First packed level
    pub starting_level: u32,
    /// One past the last packed level
    pub ending_level: u32,
}

impl PackedMipInfo {
    /// Whether the level lies in the tail
    pub fn contains(&self, mip_level: u32) -> bool {
        mip_level >= self.starting_level && mip_level < self.ending_level
    }

    /// Number of packed levels
    pub fn level_count(&self) -> u32 {
        self.ending_level.saturating_sub(self.starting_level)
    }
}

/// Streaming-relevant shape of one texture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextureLayout {
    /// Mip 0 dimensions in texels
    pub wh: UVec2,
    /// Number of mip levels
    pub mip_count: u32,
    /// Texel dimensions of one 64 KiB tile for the texture's format
    pub tile_texels: UVec2,
}

impl TextureLayout {
    /// Create a new layout description
    pub fn new(wh: UVec2, mip_count: u32, tile_texels: UVec2) -> Self {
        Self {
            wh,
            mip_count,
            tile_texels,
        }
    }

    /// Dimensions of a mip level in texels
    pub fn level_wh(&self, mip_level: u32) -> UVec2 {
        UVec2::new(
            (self.wh.x >> mip_level).max(1),
            (self.wh.y >> mip_level).max(1),
        )
    }

    /// Packed mip tail range
    pub fn packed_info(&self) -> PackedMipInfo {
        let start = packed_mip_start(self.wh, self.tile_texels).min(self.mip_count);

        PackedMipInfo {
            starting_level: start,
            ending_level: self.mip_count,
        }
    }

    /// Whether a mip level is streamed per tile
    pub fn is_tiled_level(&self, mip_level: u32) -> bool {
        mip_level < self.packed_info().starting_level
    }

    /// Tile grid of a mip level (zero for packed levels)
    pub fn tile_grid(&self, mip_level: u32) -> UVec2 {
        if !self.is_tiled_level(mip_level) {
            return UVec2::ZERO;
        }

        let wh = self.level_wh(mip_level);
        UVec2::new(
            wh.x.div_ceil(self.tile_texels.x.max(1)),
            wh.y.div_ceil(self.tile_texels.y.max(1)),
        )
    }

    /// Whether a tile ID addresses a tile that exists in this texture
    pub fn contains(&self, tile: TileId) -> bool {
        if !tile.is_valid() {
            return false;
        }

        if tile.is_packed() {
            let packed = self.packed_info();
            return packed.level_count() > 0 && tile.mip_level() == packed.starting_level;
        }

        let grid = self.tile_grid(tile.mip_level());
        tile.x() < grid.x && tile.y() < grid.y
    }

    /// Tile ID of this texture's packed tail
    pub fn packed_tile(&self) -> TileId {
        TileId::packed(self.packed_info().starting_level)
    }
}
