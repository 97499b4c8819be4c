//! Tile Content Source
//!
//! Produces upload payloads for streamed tiles:
//! - `TextureDecoder` reads one mip level of one asset, caching levels below one tile in size
//! - `TextureStreamContext` keeps the current decoder and reopens only when the level changes

use std::sync::Arc;

use glam::UVec2;
use log::{error, trace};
use vtex_core::{TILE_BYTE_SIZE, TileId, UploadHeap, UploadReservation};

use crate::container::TextureAssetHeader;
use crate::format::TextureFormat;
use crate::store::AssetStore;
use crate::{AssetError, AssetHandle, AssetResult};

/// Alignment of tile payloads in upload memory
pub const TILE_UPLOAD_ALIGNMENT: usize = 512;

/// Row pitch alignment for whole-level copies
pub const ROW_PITCH_ALIGNMENT: usize = 256;

/// Alignment of whole-level payloads in upload memory
pub const LEVEL_UPLOAD_ALIGNMENT: usize = 512;

/// Upload payload of a whole mip level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelUpload {
    /// Reserved upload memory
    pub reservation: UploadReservation,
    /// Bytes between block rows in the reservation
    pub row_pitch: usize,
    /// Number of block rows
    pub rows: u32,
    /// Level dimensions in texels
    pub wh: UVec2,
}

/// Reader for one mip level of a block-compressed texture asset
pub struct TextureDecoder {
    store: Arc<dyn AssetStore>,
    asset: AssetHandle,
    level: u32,
    format: TextureFormat,
    wh: UVec2,
    level_offset: u64,
    level_size: u64,
    cached: Option<Vec<u8>>,
}

impl TextureDecoder {
    /// Open `level` of `asset`, loading it eagerly when smaller than one tile
    pub fn open(store: Arc<dyn AssetStore>, asset: AssetHandle, level: u32) -> AssetResult<Self> {
        let (header, data_offset) = TextureAssetHeader::read(store.as_ref(), asset)?;
        let level_offset = data_offset + header.level_offset(level)?;
        let level_size = header.level_size(level)?;

        let cached = if level_size < TILE_BYTE_SIZE as u64 {
            let mut buffer = vec![0u8; level_size as usize];
            store.read(asset, level_offset, &mut buffer)?;
            Some(buffer)
        } else {
            None
        };

        Ok(Self {
            store,
            asset,
            level,
            format: header.format,
            wh: header.wh(),
            level_offset,
            level_size,
            cached,
        })
    }

    /// Asset being read
    pub fn asset(&self) -> AssetHandle {
        self.asset
    }

    /// Mip level being read
    pub fn level(&self) -> u32 {
        self.level
    }

    /// Texture format
    pub fn format(&self) -> TextureFormat {
        self.format
    }

    /// Mip 0 dimensions of the texture
    pub fn texture_wh(&self) -> UVec2 {
        self.wh
    }

    /// Dimensions of the open level
    pub fn level_wh(&self) -> UVec2 {
        crate::container::level_wh(self.wh, self.level)
    }

    /// Whether the level was loaded eagerly
    pub fn is_cached(&self) -> bool {
        self.cached.is_some()
    }

    fn read_bytes(&self, offset: u64, out: &mut [u8]) -> AssetResult<()> {
        match &self.cached {
            Some(buffer) => {
                let start = offset as usize;
                let source = buffer.get(start..start + out.len()).ok_or(AssetError::OutOfBounds {
                    asset: self.asset,
                    offset,
                    len: out.len(),
                })?;
                out.copy_from_slice(source);
                Ok(())
            }
            None => self.store.read(self.asset, self.level_offset + offset, out),
        }
    }

    /// Copy one tile's blocks into a fresh 64 KiB upload reservation
    ///
    /// Tile rows are packed at the tile's own row pitch. Blocks past the level edge are zeroed.
    pub fn read_tile(&self, tile: TileId, heap: &mut dyn UploadHeap) -> AssetResult<UploadReservation> {
        let block_size = self.format.block_byte_size() as usize;
        let tile_blocks = self.format.tile_blocks();
        let level_blocks = self.format.level_blocks(self.level_wh());

        let origin = UVec2::new(tile.x(), tile.y()) * tile_blocks;
        if tile.is_packed() || origin.x >= level_blocks.x || origin.y >= level_blocks.y {
            return Err(AssetError::TileOutOfRange(tile));
        }

        let columns = tile_blocks.x.min(level_blocks.x - origin.x) as usize;
        let rows = tile_blocks.y.min(level_blocks.y - origin.y) as usize;
        let local_row_pitch = tile_blocks.x as usize * block_size;
        let source_row_pitch = level_blocks.x as u64 * block_size as u64;

        let reservation = heap
            .reserve(TILE_BYTE_SIZE, TILE_UPLOAD_ALIGNMENT)
            .ok_or(AssetError::UploadHeapExhausted {
                size: TILE_BYTE_SIZE,
            })?;
        let destination = heap.bytes_mut(&reservation);
        destination.fill(0);

        for row in 0..rows {
            let source = (origin.y as u64 + row as u64) * source_row_pitch
                + origin.x as u64 * block_size as u64;
            let start = row * local_row_pitch;
            self.read_bytes(source, &mut destination[start..start + columns * block_size])?;
        }

        trace!("Read tile {tile:?} of {} level {}", self.asset, self.level);
        Ok(reservation)
    }

    /// Copy the whole level into upload memory at a 256-byte aligned row pitch
    pub fn read(&self, heap: &mut dyn UploadHeap) -> AssetResult<LevelUpload> {
        let block_size = self.format.block_byte_size() as usize;
        let wh = self.level_wh();
        let blocks = self.format.level_blocks(wh);
        let source_row_pitch = blocks.x as usize * block_size;
        let row_pitch = source_row_pitch.next_multiple_of(ROW_PITCH_ALIGNMENT);
        let size = row_pitch * blocks.y as usize;
        if (source_row_pitch * blocks.y as usize) as u64 != self.level_size {
            return Err(AssetError::InvalidHeader(format!(
                "level {} holds {} bytes",
                self.level, self.level_size
            )));
        }

        let reservation = heap
            .reserve(size, LEVEL_UPLOAD_ALIGNMENT)
            .ok_or(AssetError::UploadHeapExhausted { size })?;
        let destination = heap.bytes_mut(&reservation);
        destination.fill(0);

        for row in 0..blocks.y as usize {
            let start = row * row_pitch;
            self.read_bytes(
                (row * source_row_pitch) as u64,
                &mut destination[start..start + source_row_pitch],
            )?;
        }

        Ok(LevelUpload {
            reservation,
            row_pitch,
            rows: blocks.y,
            wh,
        })
    }
}

/// Per-task reader that switches between (asset, level) pairs
pub struct TextureStreamContext {
    store: Arc<dyn AssetStore>,
    decoder: Option<TextureDecoder>,
}

impl TextureStreamContext {
    /// Create a context reading from `store`
    pub fn new(store: Arc<dyn AssetStore>) -> Self {
        Self {
            store,
            decoder: None,
        }
    }

    /// Make `level` of `asset` current, returning false if it cannot be read
    ///
    /// Reopening the pair that is already current is a no-op.
    pub fn open(&mut self, level: u32, asset: AssetHandle) -> bool {
        if let Some(decoder) = &self.decoder {
            if decoder.asset() == asset && decoder.level() == level {
                return true;
            }
        }

        self.decoder = None;
        match TextureDecoder::open(self.store.clone(), asset, level) {
            Ok(decoder) => {
                self.decoder = Some(decoder);
                true
            }
            Err(e) => {
                error!("Failed to open {asset} level {level}: {e}");
                false
            }
        }
    }

    /// Release the current level
    pub fn close(&mut self) {
        self.decoder = None;
    }

    fn current(&self) -> AssetResult<&TextureDecoder> {
        self.decoder.as_ref().ok_or(AssetError::NotOpen)
    }

    /// Read one tile of the current level
    pub fn read_tile(&self, tile: TileId, heap: &mut dyn UploadHeap) -> AssetResult<UploadReservation> {
        self.current()?.read_tile(tile, heap)
    }

    /// Read the whole current level
    pub fn read(&self, heap: &mut dyn UploadHeap) -> AssetResult<LevelUpload> {
        self.current()?.read(heap)
    }

    /// Mip 0 dimensions of the current texture
    pub fn wh(&self) -> Option<UVec2> {
        self.decoder.as_ref().map(TextureDecoder::texture_wh)
    }

    /// Format of the current texture
    pub fn format(&self) -> Option<TextureFormat> {
        self.decoder.as_ref().map(TextureDecoder::format)
    }

    /// Current (asset, level) pair
    pub fn current_level(&self) -> Option<(AssetHandle, u32)> {
        self.decoder.as_ref().map(|d| (d.asset(), d.level()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::build_synthetic_texture;
    use crate::store::MemoryAssetStore;
    use vtex_core::LinearUploadHeap;

    fn store_with(format: TextureFormat, size: u32) -> (Arc<MemoryAssetStore>, AssetHandle) {
        let store = Arc::new(MemoryAssetStore::new());
        let wh = UVec2::splat(size);
        let bytes = build_synthetic_texture(format, wh, crate::container::full_mip_count(wh)).unwrap();
        let handle = store.insert(bytes);
        (store, handle)
    }

    #[test]
    fn test_open_rejects_mismatched_level_sizes() {
        let store = Arc::new(MemoryAssetStore::new());
        let mut header = TextureAssetHeader::new(TextureFormat::Bc7, UVec2::splat(64), 1).unwrap();
        header.mip_offsets = vec![0, 100];
        let mut bytes = header.to_bytes().unwrap();
        bytes.resize(bytes.len() + 100, 0);
        let asset = store.insert(bytes);

        assert!(TextureDecoder::open(store.clone(), asset, 0).is_err());
        let mut context = TextureStreamContext::new(store);
        assert!(!context.open(0, asset));
        assert!(context.current_level().is_none());
    }

    #[test]
    fn test_read_tile_picks_tile_blocks() {
        let (store, asset) = store_with(TextureFormat::Bc7, 1024);
        let decoder = TextureDecoder::open(store, asset, 0).unwrap();
        assert!(!decoder.is_cached());

        let mut heap = LinearUploadHeap::new(1 << 20);
        let reservation = decoder.read_tile(TileId::new(2, 1, 0), &mut heap).unwrap();
        let bytes = heap.bytes(&reservation);
        assert_eq!(bytes.len(), TILE_BYTE_SIZE);

        // First block of the tile is block (128, 64) of level 0
        assert_eq!(&bytes[..5], &[0, 128, 0, 64, 0]);
        // Second row starts at block (128, 65)
        let row_pitch = 64 * 16;
        assert_eq!(&bytes[row_pitch..row_pitch + 5], &[0, 128, 0, 65, 0]);
        // Last block of the first row is block (191, 64)
        assert_eq!(&bytes[row_pitch - 16..row_pitch - 11], &[0, 191, 0, 64, 0]);
    }

    #[test]
    fn test_read_tile_bc1_shape() {
        let (store, asset) = store_with(TextureFormat::Bc1, 1024);
        let decoder = TextureDecoder::open(store, asset, 1).unwrap();
        let mut heap = LinearUploadHeap::new(1 << 20);

        let reservation = decoder.read_tile(TileId::new(0, 1, 1), &mut heap).unwrap();
        let bytes = heap.bytes(&reservation);
        assert_eq!(&bytes[..5], &[1, 0, 0, 64, 0]);
        assert!(decoder.read_tile(TileId::new(1, 0, 1), &mut heap).is_err());
    }

    #[test]
    fn test_read_tile_out_of_range() {
        let (store, asset) = store_with(TextureFormat::Bc7, 512);
        let decoder = TextureDecoder::open(store, asset, 0).unwrap();
        let mut heap = LinearUploadHeap::new(1 << 20);

        assert!(matches!(
            decoder.read_tile(TileId::new(2, 0, 0), &mut heap),
            Err(AssetError::TileOutOfRange(_))
        ));
    }

    #[test]
    fn test_small_levels_are_cached() {
        let (store, asset) = store_with(TextureFormat::Bc7, 1024);
        let decoder = TextureDecoder::open(store.clone(), asset, 3).unwrap();
        assert!(decoder.is_cached());

        store.remove(asset);
        let mut heap = LinearUploadHeap::new(1 << 20);
        let upload = decoder.read(&mut heap).unwrap();
        assert_eq!(upload.wh, UVec2::new(128, 128));
        assert_eq!(upload.row_pitch, 32 * 16);
        assert_eq!(upload.rows, 32);
    }

    #[test]
    fn test_read_level_pads_row_pitch() {
        let (store, asset) = store_with(TextureFormat::Bc7, 256);
        let decoder = TextureDecoder::open(store, asset, 4).unwrap();
        let mut heap = LinearUploadHeap::new(1 << 20);

        let upload = decoder.read(&mut heap).unwrap();
        assert_eq!(upload.wh, UVec2::new(16, 16));
        assert_eq!(upload.row_pitch, 256);
        assert_eq!(upload.reservation.offset % LEVEL_UPLOAD_ALIGNMENT, 0);

        let bytes = heap.bytes(&upload.reservation);
        assert_eq!(&bytes[256..261], &[4, 0, 0, 1, 0]);
        assert_eq!(bytes[64], 0);
    }

    #[test]
    fn test_upload_exhaustion_is_reported() {
        let (store, asset) = store_with(TextureFormat::Bc7, 512);
        let decoder = TextureDecoder::open(store, asset, 0).unwrap();
        let mut heap = LinearUploadHeap::new(1024);

        assert!(matches!(
            decoder.read_tile(TileId::new(0, 0, 0), &mut heap),
            Err(AssetError::UploadHeapExhausted { .. })
        ));
    }

    #[test]
    fn test_stream_context_reopen() {
        let (store, asset) = store_with(TextureFormat::Bc7, 512);
        let mut context = TextureStreamContext::new(store.clone());

        assert!(context.open(0, asset));
        assert_eq!(context.current_level(), Some((asset, 0)));

        // Same pair stays open even after the asset disappears
        store.remove(asset);
        assert!(context.open(0, asset));

        assert!(!context.open(1, asset));
        assert!(context.current_level().is_none());

        let mut heap = LinearUploadHeap::new(1 << 20);
        assert!(matches!(
            context.read_tile(TileId::new(0, 0, 0), &mut heap),
            Err(AssetError::NotOpen)
        ));
    }

    #[test]
    fn test_stream_context_reports_texture() {
        let (store, asset) = store_with(TextureFormat::Bc1, 512);
        let mut context = TextureStreamContext::new(store);
        assert!(context.wh().is_none());

        assert!(context.open(2, asset));
        assert_eq!(context.wh(), Some(UVec2::splat(512)));
        assert_eq!(context.format(), Some(TextureFormat::Bc1));
    }
}
