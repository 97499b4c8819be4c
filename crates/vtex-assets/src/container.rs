//! Texture Asset Container
//!
//! On-disk layout of a streamable texture: a bincode header followed by the mip chain,
//! finest level first, each level stored as row-major compression blocks.

use glam::UVec2;
use serde::{Deserialize, Serialize};
use vtex_core::{MAX_MIP_LEVELS, TextureLayout};

use crate::format::TextureFormat;
use crate::store::AssetStore;
use crate::{AssetError, AssetHandle, AssetResult};

/// Magic bytes at the start of every texture asset
pub const TEXTURE_MAGIC: [u8; 4] = *b"VTX1";

/// Upper bound on the encoded header size
const HEADER_PREFIX_SIZE: u64 = 512;

/// Header of a texture asset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextureAssetHeader {
    /// Magic bytes
    pub magic: [u8; 4],
    /// Block-compressed format
    pub format: TextureFormat,
    /// Mip 0 width in texels
    pub width: u32,
    /// Mip 0 height in texels
    pub height: u32,
    /// Level start offsets relative to the data section, plus one end offset
    pub mip_offsets: Vec<u64>,
}

impl TextureAssetHeader {
    /// Build a header for a full mip chain of `mip_count` levels
    pub fn new(format: TextureFormat, wh: UVec2, mip_count: u32) -> AssetResult<Self> {
        if wh.x == 0 || wh.y == 0 {
            return Err(AssetError::InvalidHeader("zero-sized texture".into()));
        }
        if mip_count == 0 || mip_count > MAX_MIP_LEVELS {
            return Err(AssetError::InvalidHeader(format!(
                "mip count {mip_count} out of range"
            )));
        }

        let mut mip_offsets = Vec::with_capacity(mip_count as usize + 1);
        let mut offset = 0;
        mip_offsets.push(offset);
        for level in 0..mip_count {
            offset += format.level_byte_size(level_wh(wh, level));
            mip_offsets.push(offset);
        }

        Ok(Self {
            magic: TEXTURE_MAGIC,
            format,
            width: wh.x,
            height: wh.y,
            mip_offsets,
        })
    }

    /// Read and validate the header of an asset, returning it with the data section offset
    pub fn read(store: &dyn AssetStore, asset: AssetHandle) -> AssetResult<(Self, u64)> {
        let size = store.size(asset)?;
        let mut prefix = vec![0u8; size.min(HEADER_PREFIX_SIZE) as usize];
        store.read(asset, 0, &mut prefix)?;

        let header: Self = bincode::deserialize(&prefix)
            .map_err(|e| AssetError::InvalidHeader(e.to_string()))?;
        header.validate()?;

        let data_offset = header.encoded_size()?;
        if data_offset + header.data_size() > size {
            return Err(AssetError::InvalidHeader(format!(
                "asset {asset} is truncated: {size} bytes"
            )));
        }

        Ok((header, data_offset))
    }

    fn validate(&self) -> AssetResult<()> {
        if self.magic != TEXTURE_MAGIC {
            return Err(AssetError::InvalidHeader("bad magic".into()));
        }
        let mip_count = self.mip_count();
        if mip_count == 0 || mip_count > MAX_MIP_LEVELS {
            return Err(AssetError::InvalidHeader(format!(
                "mip count {mip_count} out of range"
            )));
        }
        if self.width == 0 || self.height == 0 {
            return Err(AssetError::InvalidHeader("zero-sized texture".into()));
        }
        if self.mip_offsets.first() != Some(&0) {
            return Err(AssetError::InvalidHeader("mip chain does not start at zero".into()));
        }
        for (level, offsets) in self.mip_offsets.windows(2).enumerate() {
            let level = level as u32;
            let expected = self.format.level_byte_size(self.level_wh(level));
            if offsets[1].checked_sub(offsets[0]) != Some(expected) {
                return Err(AssetError::InvalidHeader(format!(
                    "level {level} spans {}..{}, expected {expected} bytes",
                    offsets[0], offsets[1]
                )));
            }
        }
        Ok(())
    }

    /// Byte size of the encoded header
    pub fn encoded_size(&self) -> AssetResult<u64> {
        bincode::serialized_size(self).map_err(|e| AssetError::InvalidHeader(e.to_string()))
    }

    /// Encode the header
    pub fn to_bytes(&self) -> AssetResult<Vec<u8>> {
        bincode::serialize(self).map_err(|e| AssetError::InvalidHeader(e.to_string()))
    }

    /// Mip 0 dimensions
    pub fn wh(&self) -> UVec2 {
        UVec2::new(self.width, self.height)
    }

    /// Number of mip levels
    pub fn mip_count(&self) -> u32 {
        self.mip_offsets.len().saturating_sub(1) as u32
    }

    /// Dimensions of a level
    pub fn level_wh(&self, level: u32) -> UVec2 {
        level_wh(self.wh(), level)
    }

    /// Offset of a level relative to the data section
    pub fn level_offset(&self, level: u32) -> AssetResult<u64> {
        self.mip_offsets
            .get(level as usize)
            .copied()
            .filter(|_| level < self.mip_count())
            .ok_or(AssetError::MipOutOfRange {
                level,
                mip_count: self.mip_count(),
            })
    }

    /// Byte size of a level
    pub fn level_size(&self, level: u32) -> AssetResult<u64> {
        let start = self.level_offset(level)?;
        Ok(self.mip_offsets[level as usize + 1] - start)
    }

    /// Byte size of the data section
    pub fn data_size(&self) -> u64 {
        self.mip_offsets.last().copied().unwrap_or(0)
    }

    /// Streaming layout of the texture
    pub fn layout(&self) -> TextureLayout {
        TextureLayout::new(self.wh(), self.mip_count(), self.format.tile_texels())
    }
}

/// Dimensions of `level` for a texture of `wh`
pub fn level_wh(wh: UVec2, level: u32) -> UVec2 {
    UVec2::new((wh.x >> level).max(1), (wh.y >> level).max(1))
}

/// Number of levels in a full mip chain
pub fn full_mip_count(wh: UVec2) -> u32 {
    (wh.x.max(wh.y).max(1).ilog2() + 1).min(MAX_MIP_LEVELS)
}

/// Byte pattern of one synthetic block, recognisable by level and block coordinate
pub fn synthetic_block(level: u32, bx: u32, by: u32, out: &mut [u8]) {
    let tag = [
        level as u8,
        (bx & 0xff) as u8,
        (bx >> 8) as u8,
        (by & 0xff) as u8,
        (by >> 8) as u8,
    ];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = tag.get(i).copied().unwrap_or(0xa5 ^ i as u8);
    }
}

/// Build a complete asset with synthetic block contents
pub fn build_synthetic_texture(format: TextureFormat, wh: UVec2, mip_count: u32) -> AssetResult<Vec<u8>> {
    let header = TextureAssetHeader::new(format, wh, mip_count)?;
    let mut bytes = header.to_bytes()?;
    bytes.reserve(header.data_size() as usize);

    let block_size = format.block_byte_size() as usize;
    let mut block = vec![0u8; block_size];
    for level in 0..mip_count {
        let blocks = format.level_blocks(header.level_wh(level));
        for by in 0..blocks.y {
            for bx in 0..blocks.x {
                synthetic_block(level, bx, by, &mut block);
                bytes.extend_from_slice(&block);
            }
        }
    }

    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryAssetStore;

    #[test]
    fn test_header_offsets() {
        let header = TextureAssetHeader::new(TextureFormat::Bc7, UVec2::new(512, 512), 10).unwrap();
        assert_eq!(header.mip_count(), 10);
        assert_eq!(header.level_size(0).unwrap(), 4 * 64 * 1024);
        assert_eq!(header.level_offset(1).unwrap(), 4 * 64 * 1024);
        assert_eq!(header.level_size(9).unwrap(), 16);
        assert!(header.level_offset(10).is_err());
    }

    #[test]
    fn test_header_read_back() {
        let store = MemoryAssetStore::new();
        let bytes = build_synthetic_texture(TextureFormat::Bc1, UVec2::new(1024, 512), 11).unwrap();
        let handle = store.insert(bytes);

        let (header, data_offset) = TextureAssetHeader::read(&store, handle).unwrap();
        assert_eq!(header.format, TextureFormat::Bc1);
        assert_eq!(header.wh(), UVec2::new(1024, 512));
        assert_eq!(data_offset, header.encoded_size().unwrap());
        assert_eq!(header.layout().tile_texels, UVec2::new(512, 256));
    }

    #[test]
    fn test_truncated_asset_rejected() {
        let store = MemoryAssetStore::new();
        let mut bytes = build_synthetic_texture(TextureFormat::Bc7, UVec2::new(256, 256), 9).unwrap();
        bytes.truncate(bytes.len() - 10);
        let handle = store.insert(bytes);

        assert!(matches!(
            TextureAssetHeader::read(&store, handle),
            Err(AssetError::InvalidHeader(_))
        ));
    }

    #[test]
    fn test_level_sizes_must_match_format() {
        let store = MemoryAssetStore::new();
        let mut header = TextureAssetHeader::new(TextureFormat::Bc7, UVec2::new(64, 64), 2).unwrap();
        assert_eq!(header.mip_offsets, vec![0, 4096, 5120]);
        header.mip_offsets = vec![0, 4096, 4100];
        let mut bytes = header.to_bytes().unwrap();
        bytes.resize(bytes.len() + 4100, 0);
        let handle = store.insert(bytes);

        assert!(matches!(
            TextureAssetHeader::read(&store, handle),
            Err(AssetError::InvalidHeader(_))
        ));
    }

    #[test]
    fn test_garbage_rejected() {
        let store = MemoryAssetStore::new();
        let handle = store.insert(vec![0xff; 64]);
        assert!(TextureAssetHeader::read(&store, handle).is_err());
    }

    #[test]
    fn test_full_mip_count() {
        assert_eq!(full_mip_count(UVec2::new(8192, 8192)), 14);
        assert_eq!(full_mip_count(UVec2::new(1, 1)), 1);
        assert_eq!(full_mip_count(UVec2::new(1024, 16)), 11);
    }

    #[test]
    fn test_synthetic_block_tag() {
        let mut block = [0u8; 16];
        synthetic_block(3, 258, 7, &mut block);
        assert_eq!(&block[..5], &[3, 2, 1, 7, 0]);
    }
}
