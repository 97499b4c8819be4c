//! Asset Stores
//!
//! Random-access byte sources addressed by asset handle.

use std::path::Path;
use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::RwLock;
use vtex_platform::{FileHandle, FileMode};

use crate::{AssetError, AssetHandle, AssetResult};

/// Random-access reads of asset bytes
pub trait AssetStore: Send + Sync {
    /// Fill `buf` with the asset's bytes starting at `offset`
    fn read(&self, asset: AssetHandle, offset: u64, buf: &mut [u8]) -> AssetResult<()>;

    /// Total byte size of an asset
    fn size(&self, asset: AssetHandle) -> AssetResult<u64>;

    /// Whether the store knows the asset
    fn contains(&self, asset: AssetHandle) -> bool {
        self.size(asset).is_ok()
    }
}

/// Asset store backed by in-memory buffers
#[derive(Default)]
pub struct MemoryAssetStore {
    assets: RwLock<AHashMap<AssetHandle, Arc<[u8]>>>,
}

impl MemoryAssetStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an asset under its content handle
    pub fn insert(&self, bytes: Vec<u8>) -> AssetHandle {
        let handle = AssetHandle::from_content(&bytes);
        self.insert_with_handle(handle, bytes);
        handle
    }

    /// Add or replace an asset under an explicit handle
    pub fn insert_with_handle(&self, handle: AssetHandle, bytes: Vec<u8>) {
        self.assets.write().insert(handle, bytes.into());
    }

    /// Remove an asset
    pub fn remove(&self, handle: AssetHandle) -> bool {
        self.assets.write().remove(&handle).is_some()
    }

    /// Number of assets
    pub fn len(&self) -> usize {
        self.assets.read().len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.assets.read().is_empty()
    }

    fn get(&self, asset: AssetHandle) -> AssetResult<Arc<[u8]>> {
        self.assets
            .read()
            .get(&asset)
            .cloned()
            .ok_or(AssetError::NotFound(asset))
    }
}

impl AssetStore for MemoryAssetStore {
    fn read(&self, asset: AssetHandle, offset: u64, buf: &mut [u8]) -> AssetResult<()> {
        let bytes = self.get(asset)?;
        let start = offset as usize;
        let end = start.saturating_add(buf.len());
        if end > bytes.len() {
            return Err(AssetError::OutOfBounds {
                asset,
                offset,
                len: buf.len(),
            });
        }

        buf.copy_from_slice(&bytes[start..end]);
        Ok(())
    }

    fn size(&self, asset: AssetHandle) -> AssetResult<u64> {
        Ok(self.get(asset)?.len() as u64)
    }
}

/// Asset store backed by files on disk
#[derive(Default)]
pub struct FileAssetStore {
    files: RwLock<AHashMap<AssetHandle, Arc<FileHandle>>>,
}

impl FileAssetStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a file and register it under its path handle
    pub fn mount(&self, path: impl AsRef<Path>) -> AssetResult<AssetHandle> {
        let path = path.as_ref();
        let handle = AssetHandle::from_path(path);
        let file = FileHandle::open(path, FileMode::Read)?;
        self.files.write().insert(handle, Arc::new(file));
        Ok(handle)
    }

    fn get(&self, asset: AssetHandle) -> AssetResult<Arc<FileHandle>> {
        self.files
            .read()
            .get(&asset)
            .cloned()
            .ok_or(AssetError::NotFound(asset))
    }
}

impl AssetStore for FileAssetStore {
    fn read(&self, asset: AssetHandle, offset: u64, buf: &mut [u8]) -> AssetResult<()> {
        Ok(self.get(asset)?.read_at(offset, buf)?)
    }

    fn size(&self, asset: AssetHandle) -> AssetResult<u64> {
        Ok(self.get(asset)?.size())
    }
}
