//! Graphics Device Abstraction
//!
//! The operations the streaming engine needs from a GPU backend: tiled resource mapping,
//! copy queue uploads, barrier submission and buffer readback.

use std::any::Any;
use std::sync::Arc;

use bitflags::bitflags;
use glam::UVec2;
use serde::{Deserialize, Serialize};
use vtex_assets::{LevelUpload, TextureFormat};
use vtex_core::{TextureId, TextureLayout, TileId, UploadHeap, UploadReservation};

use crate::RendererResult;
use crate::frame_graph::{PassCommand, QueueType};

/// Handle of a GPU memory heap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HeapHandle(pub u32);

/// Handle of a host-readable readback buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReadbackHandle(pub u32);

/// Point on a queue timeline another submission can wait for
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SyncPoint(pub u64);

bitflags! {
    /// Resource usage states
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ResourceStates: u32 {
        const COMMON = 0;
        const PIXEL_SHADER_RESOURCE = 1 << 0;
        const NON_PIXEL_SHADER_RESOURCE = 1 << 1;
        const UNORDERED_ACCESS = 1 << 2;
        const COPY_SOURCE = 1 << 3;
        const COPY_DEST = 1 << 4;
        const RENDER_TARGET = 1 << 5;
        const SHADER_RESOURCE = Self::PIXEL_SHADER_RESOURCE.bits() | Self::NON_PIXEL_SHADER_RESOURCE.bits();
    }
}

impl ResourceStates {
    /// Whether the copy queue can write a resource in this state
    pub fn is_copy_writable(&self) -> bool {
        *self == Self::COMMON || *self == Self::COPY_DEST
    }
}

/// State change of one resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceTransition {
    /// Texture to transition
    pub resource: TextureId,
    /// Current state
    pub before: ResourceStates,
    /// Target state
    pub after: ResourceStates,
}

/// Binding state of one tile mapping update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TileMappingState {
    /// Unmap the tile
    Null,
    /// Map the tile to new content
    Updated,
    /// Mapping is live
    InUse,
}

/// Tile mapping update for a tiled texture
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileMapping {
    /// Tile being remapped
    pub tile: TileId,
    /// Heap backing the tile
    pub heap: HeapHandle,
    /// Binding state
    pub state: TileMappingState,
    /// Byte offset of the backing block in the heap
    pub heap_offset: u64,
}

/// Description of a streamed texture resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextureInfo {
    /// Mip 0 dimensions
    pub wh: UVec2,
    /// Number of mip levels
    pub mip_count: u32,
    /// Block-compressed format
    pub format: TextureFormat,
}

impl TextureInfo {
    /// Streaming layout derived from the format's tile shape
    pub fn layout(&self) -> TextureLayout {
        TextureLayout::new(self.wh, self.mip_count, self.format.tile_texels())
    }
}

/// Callback fired when a readback buffer holds finished GPU results
pub type ReadbackCallback = Arc<dyn Fn(ReadbackHandle) + Send + Sync>;

/// Command list on the copy queue with its own upload memory
pub trait CopyContext: Send {
    /// Upload memory owned by this context
    fn upload_heap(&mut self) -> &mut dyn UploadHeap;

    /// Copy one 64 KiB tile from upload memory into a tiled texture
    fn copy_tile(&mut self, resource: TextureId, tile: TileId, source: UploadReservation);

    /// Copy a whole mip level from upload memory into a texture
    fn copy_texture_region(&mut self, resource: TextureId, level: u32, source: &LevelUpload);

    /// Convert into the backend's concrete type on submission
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;
}

/// GPU device operations used by the streaming engine
///
/// Implementations take `&self` and synchronise internally; the engine calls in from both the
/// render thread and the update worker.
pub trait Device: Send + Sync {
    /// Create a heap for tile backing memory
    fn create_heap(&self, size: u64) -> RendererResult<HeapHandle>;

    /// Create a host-readable buffer
    fn create_readback_buffer(&self, size: usize) -> RendererResult<ReadbackHandle>;

    /// Release a readback buffer
    fn release_readback(&self, readback: ReadbackHandle);

    /// Set or clear the completion callback of a readback buffer
    fn set_readback_callback(&self, readback: ReadbackHandle, callback: Option<ReadbackCallback>);

    /// Map a readback buffer and pass its contents to `f`, returning false if it cannot be mapped
    fn map_readback(&self, readback: ReadbackHandle, f: &mut dyn FnMut(&[u8])) -> bool;

    /// Description of a texture resource
    fn texture_info(&self, resource: TextureId) -> Option<TextureInfo>;

    /// Current state of a texture resource
    fn resource_state(&self, resource: TextureId) -> Option<ResourceStates>;

    /// Submit transitions on the graphics queue, returning the point the copy queue can wait on
    fn submit_barriers(&self, transitions: &[ResourceTransition]) -> SyncPoint;

    /// Open a copy command list
    fn open_copy_context(&self) -> Box<dyn CopyContext>;

    /// Submit a copy command list, optionally waiting for a sync point first
    fn submit_copy_context(&self, context: Box<dyn CopyContext>, wait: Option<SyncPoint>) -> SyncPoint;

    /// Queue tile mapping updates for a texture
    fn update_tile_mappings(&self, resource: TextureId, mappings: &[TileMapping]);

    /// Apply queued tile mapping updates of the given textures
    fn submit_tile_mappings(&self, resources: &[TextureId]);

    /// Record the commands of one frame graph pass
    fn record_pass(&self, name: &str, queue: QueueType, commands: &[PassCommand]);

    /// Ticks per second of GPU timestamps
    fn timestamp_frequency(&self) -> u64;

    /// Block until all submitted GPU work finished
    fn wait_for_gpu(&self);

    /// Complete all queued readbacks
    fn flush_pending_readbacks(&self);
}
