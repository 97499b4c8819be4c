//! Headless Device
//!
//! CPU implementation of `Device`. Heaps are byte arrays, tile mappings are tables, and the
//! feedback pass is emulated with the reference compaction from `vtex_core::feedback`.
//! Readback callbacks fire in submission order when `process_readbacks` is polled.

use std::any::Any;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use ahash::{AHashMap, AHashSet};
use log::{debug, trace, warn};
use parking_lot::Mutex;
use vtex_assets::LevelUpload;
use vtex_core::feedback::{compress_groups, exclusive_prefix_sum, group_sizes, merge_groups};
use vtex_core::{
    FeedbackHeader, GpuTileId, LinearUploadHeap, TILE_BYTE_SIZE, TextureId, TileId, UploadHeap,
    UploadReservation, encode_feedback,
};

use crate::device::{
    CopyContext, Device, HeapHandle, ReadbackCallback, ReadbackHandle, ResourceStates,
    ResourceTransition, SyncPoint, TextureInfo, TileMapping, TileMappingState,
};
use crate::frame_graph::{ComputeKernel, PassCommand, QueueType};
use crate::{RendererError, RendererResult};

/// Default upload memory of one copy context
pub const DEFAULT_UPLOAD_CAPACITY: usize = 8 * 1024 * 1024;

/// Ticks per second of the emulated GPU clock
pub const TIMESTAMP_FREQUENCY: u64 = 1_000_000;

/// Something the device did, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// Barrier list submitted on the graphics queue
    Barriers { resources: Vec<TextureId>, signal: SyncPoint },
    /// Queued tile mappings applied
    TileMappings { resources: Vec<TextureId> },
    /// Copy command list executed
    Copy {
        tiles: usize,
        levels: usize,
        wait: Option<SyncPoint>,
    },
    /// Frame graph pass recorded
    Pass { name: String, queue: QueueType },
    /// Readback buffer queued for the host
    ReadbackQueued(ReadbackHandle),
    /// Readback callback fired
    ReadbackCompleted(ReadbackHandle),
}

struct HeadlessTexture {
    info: TextureInfo,
    state: ResourceStates,
    mappings: AHashMap<TileId, (HeapHandle, u64)>,
    pending: Vec<TileMapping>,
    packed_levels: BTreeMap<u32, Vec<u8>>,
}

struct ReadbackBuffer {
    bytes: Vec<u8>,
    callback: Option<ReadbackCallback>,
    mappable: bool,
}

#[derive(Default)]
struct FeedbackEmulation {
    staged: Vec<GpuTileId>,
    raw: Vec<GpuTileId>,
    groups: Vec<Vec<GpuTileId>>,
    sizes: Vec<u32>,
    offsets: Vec<u32>,
    compacted: Vec<GpuTileId>,
    max_records: usize,
    timestamp_begin: u64,
    timestamp_end: u64,
}

enum CopyOp {
    Tile {
        resource: TextureId,
        tile: TileId,
        source: UploadReservation,
    },
    Level {
        resource: TextureId,
        level: u32,
        source: LevelUpload,
    },
}

/// Copy context of the headless device
pub struct HeadlessCopyContext {
    heap: LinearUploadHeap,
    ops: Vec<CopyOp>,
}

impl HeadlessCopyContext {
    fn new(capacity: usize) -> Self {
        Self {
            heap: LinearUploadHeap::new(capacity),
            ops: Vec::new(),
        }
    }
}

impl CopyContext for HeadlessCopyContext {
    fn upload_heap(&mut self) -> &mut dyn UploadHeap {
        &mut self.heap
    }

    fn copy_tile(&mut self, resource: TextureId, tile: TileId, source: UploadReservation) {
        self.ops.push(CopyOp::Tile { resource, tile, source });
    }

    fn copy_texture_region(&mut self, resource: TextureId, level: u32, source: &LevelUpload) {
        self.ops.push(CopyOp::Level {
            resource,
            level,
            source: *source,
        });
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

/// CPU-only device
pub struct HeadlessDevice {
    textures: Mutex<AHashMap<TextureId, HeadlessTexture>>,
    heaps: Mutex<Vec<Vec<u8>>>,
    readbacks: Mutex<Vec<Option<ReadbackBuffer>>>,
    ready: Mutex<VecDeque<ReadbackHandle>>,
    feedback: Mutex<FeedbackEmulation>,
    events: Mutex<Vec<DeviceEvent>>,
    next_texture: AtomicU64,
    sync_counter: AtomicU64,
    clock: AtomicU64,
    upload_capacity: usize,
}

impl HeadlessDevice {
    /// Create a device with the default copy context upload memory
    pub fn new() -> Self {
        Self::with_upload_capacity(DEFAULT_UPLOAD_CAPACITY)
    }

    /// Create a device whose copy contexts hold `capacity` bytes of upload memory
    pub fn with_upload_capacity(capacity: usize) -> Self {
        Self {
            textures: Mutex::new(AHashMap::new()),
            heaps: Mutex::new(Vec::new()),
            readbacks: Mutex::new(Vec::new()),
            ready: Mutex::new(VecDeque::new()),
            feedback: Mutex::new(FeedbackEmulation::default()),
            events: Mutex::new(Vec::new()),
            next_texture: AtomicU64::new(0),
            sync_counter: AtomicU64::new(0),
            clock: AtomicU64::new(0),
            upload_capacity: capacity,
        }
    }

    /// Create a tiled texture, initially in the shader resource state
    pub fn create_texture(&self, info: TextureInfo) -> TextureId {
        let id = TextureId(self.next_texture.fetch_add(1, Ordering::Relaxed) as u32);
        self.textures.lock().insert(
            id,
            HeadlessTexture {
                info,
                state: ResourceStates::PIXEL_SHADER_RESOURCE,
                mappings: AHashMap::new(),
                pending: Vec::new(),
                packed_levels: BTreeMap::new(),
            },
        );
        id
    }

    /// Force the state of a texture
    pub fn set_resource_state(&self, resource: TextureId, state: ResourceStates) {
        if let Some(texture) = self.textures.lock().get_mut(&resource) {
            texture.state = state;
        }
    }

    /// Set the tiles the next feedback draws sample, replacing any previous set
    pub fn stage_samples(&self, samples: &[GpuTileId]) {
        let mut feedback = self.feedback.lock();
        feedback.staged.clear();
        feedback.staged.extend_from_slice(samples);
    }

    /// Make a readback buffer fail or succeed to map
    pub fn set_readback_mappable(&self, readback: ReadbackHandle, mappable: bool) {
        if let Some(Some(buffer)) = self.readbacks.lock().get_mut(readback.0 as usize) {
            buffer.mappable = mappable;
        }
    }

    /// Overwrite the contents of a readback buffer
    pub fn write_readback(&self, readback: ReadbackHandle, bytes: &[u8]) -> bool {
        match self.readbacks.lock().get_mut(readback.0 as usize) {
            Some(Some(buffer)) if bytes.len() <= buffer.bytes.len() => {
                buffer.bytes[..bytes.len()].copy_from_slice(bytes);
                true
            }
            _ => false,
        }
    }

    /// Queue a readback as if a feedback pass had finished
    pub fn queue_readback(&self, readback: ReadbackHandle) {
        self.ready.lock().push_back(readback);
        self.log(DeviceEvent::ReadbackQueued(readback));
    }

    /// Fire the callbacks of queued readbacks in submission order, returning how many fired
    pub fn process_readbacks(&self) -> usize {
        let mut fired = 0;
        loop {
            let Some(readback) = self.ready.lock().pop_front() else {
                break;
            };

            let callback = self
                .readbacks
                .lock()
                .get(readback.0 as usize)
                .and_then(|b| b.as_ref())
                .and_then(|b| b.callback.clone());

            self.log(DeviceEvent::ReadbackCompleted(readback));
            if let Some(callback) = callback {
                callback(readback);
            }
            fired += 1;
        }
        fired
    }

    /// Number of readbacks waiting for `process_readbacks`
    pub fn pending_readbacks(&self) -> usize {
        self.ready.lock().len()
    }

    /// Bytes of the block a tile is mapped to
    pub fn tile_contents(&self, resource: TextureId, tile: TileId) -> Option<Vec<u8>> {
        let (heap, offset) = *self.textures.lock().get(&resource)?.mappings.get(&tile)?;
        let heaps = self.heaps.lock();
        let memory = heaps.get(heap.0 as usize)?;
        let start = offset as usize;
        memory.get(start..start + TILE_BYTE_SIZE).map(<[u8]>::to_vec)
    }

    /// Tiles currently mapped in a texture
    pub fn mapped_tiles(&self, resource: TextureId) -> Vec<TileId> {
        let textures = self.textures.lock();
        let mut tiles: Vec<_> = textures
            .get(&resource)
            .map(|t| t.mappings.keys().copied().collect())
            .unwrap_or_default();
        tiles.sort_unstable_by_key(|t| t.bits());
        tiles
    }

    /// Whether a tile is mapped
    pub fn is_mapped(&self, resource: TextureId, tile: TileId) -> bool {
        self.textures
            .lock()
            .get(&resource)
            .is_some_and(|t| t.mappings.contains_key(&tile))
    }

    /// Uploaded bytes of a packed mip level, without row padding
    pub fn packed_level(&self, resource: TextureId, level: u32) -> Option<Vec<u8>> {
        self.textures
            .lock()
            .get(&resource)?
            .packed_levels
            .get(&level)
            .cloned()
    }

    /// Events so far
    pub fn events(&self) -> Vec<DeviceEvent> {
        self.events.lock().clone()
    }

    /// Drop the recorded events
    pub fn clear_events(&self) {
        self.events.lock().clear();
    }

    fn log(&self, event: DeviceEvent) {
        self.events.lock().push(event);
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(250, Ordering::Relaxed) + 250
    }

    fn next_sync_point(&self) -> SyncPoint {
        SyncPoint(self.sync_counter.fetch_add(1, Ordering::Relaxed) + 1)
    }

    fn execute(&self, command: &PassCommand) {
        match command {
            PassCommand::ClearFeedback { max_records } => {
                let mut feedback = self.feedback.lock();
                feedback.raw.clear();
                feedback.groups.clear();
                feedback.sizes.clear();
                feedback.offsets.clear();
                feedback.compacted.clear();
                feedback.max_records = *max_records as usize;
            }
            PassCommand::BeginTimestamp => {
                let now = self.tick();
                self.feedback.lock().timestamp_begin = now;
            }
            PassCommand::EndTimestamp => {
                let now = self.tick();
                self.feedback.lock().timestamp_end = now;
            }
            PassCommand::Draw(draw) => {
                let mut feedback = self.feedback.lock();
                let FeedbackEmulation { staged, raw, .. } = &mut *feedback;
                raw.extend(staged.iter().filter(|s| draw.textures.contains(&s.texture)));
            }
            PassCommand::Dispatch { kernel, .. } => {
                let mut feedback = self.feedback.lock();
                match kernel {
                    ComputeKernel::CompressFeedback => feedback.groups = compress_groups(&feedback.raw),
                    ComputeKernel::SetBlockSizes => feedback.sizes = group_sizes(&feedback.groups),
                    ComputeKernel::PrefixSumBlocks => {
                        feedback.offsets = exclusive_prefix_sum(&feedback.sizes)
                    }
                    ComputeKernel::MergeBlocks => {
                        feedback.compacted =
                            merge_groups(&feedback.groups, &feedback.offsets, feedback.max_records)
                    }
                }
            }
            PassCommand::CopyToReadback { readback, max_records } => {
                let feedback = self.feedback.lock();
                let count = feedback.compacted.len().min(*max_records as usize);
                let header = FeedbackHeader::new(count as u32, feedback.timestamp_begin, feedback.timestamp_end);

                let mut readbacks = self.readbacks.lock();
                match readbacks.get_mut(readback.0 as usize) {
                    Some(Some(buffer)) => {
                        let written = encode_feedback(&header, &feedback.compacted[..count], &mut buffer.bytes);
                        trace!("Copied {written} feedback records to readback {}", readback.0);
                    }
                    _ => warn!("Feedback copy to missing readback {}", readback.0),
                }
            }
            PassCommand::QueueReadback { readback } => {
                self.feedback.lock().staged.clear();
                self.queue_readback(*readback);
            }
        }
    }

    fn apply_copy(&self, context: HeadlessCopyContext) -> (usize, usize) {
        let mut textures = self.textures.lock();
        let mut heaps = self.heaps.lock();
        let (mut tiles, mut levels) = (0, 0);

        for op in &context.ops {
            match op {
                CopyOp::Tile { resource, tile, source } => {
                    let Some(&(heap, offset)) = textures.get(resource).and_then(|t| t.mappings.get(tile)) else {
                        warn!("Copy into unmapped tile {tile:?} of {resource}");
                        continue;
                    };
                    let Some(memory) = heaps.get_mut(heap.0 as usize) else {
                        continue;
                    };
                    let start = offset as usize;
                    let bytes = context.heap.bytes(source);
                    if let Some(destination) = memory.get_mut(start..start + bytes.len()) {
                        destination.copy_from_slice(bytes);
                        tiles += 1;
                    }
                }
                CopyOp::Level { resource, level, source } => {
                    let Some(texture) = textures.get_mut(resource) else {
                        continue;
                    };
                    let bytes = context.heap.bytes(&source.reservation);
                    let row_bytes = texture.info.format.level_byte_size(source.wh) as usize / source.rows.max(1) as usize;
                    let mut packed = Vec::with_capacity(row_bytes * source.rows as usize);
                    for row in bytes.chunks(source.row_pitch).take(source.rows as usize) {
                        packed.extend_from_slice(&row[..row_bytes.min(row.len())]);
                    }
                    texture.packed_levels.insert(*level, packed);
                    levels += 1;
                }
            }
        }
        (tiles, levels)
    }
}

impl Default for HeadlessDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl Device for HeadlessDevice {
    fn create_heap(&self, size: u64) -> RendererResult<HeapHandle> {
        let size = usize::try_from(size).map_err(|_| RendererError::OutOfMemory)?;
        let mut heaps = self.heaps.lock();
        heaps.push(vec![0; size]);
        Ok(HeapHandle(heaps.len() as u32 - 1))
    }

    fn create_readback_buffer(&self, size: usize) -> RendererResult<ReadbackHandle> {
        let mut readbacks = self.readbacks.lock();
        readbacks.push(Some(ReadbackBuffer {
            bytes: vec![0; size],
            callback: None,
            mappable: true,
        }));
        Ok(ReadbackHandle(readbacks.len() as u32 - 1))
    }

    fn release_readback(&self, readback: ReadbackHandle) {
        if let Some(slot) = self.readbacks.lock().get_mut(readback.0 as usize) {
            *slot = None;
        }
    }

    fn set_readback_callback(&self, readback: ReadbackHandle, callback: Option<ReadbackCallback>) {
        if let Some(Some(buffer)) = self.readbacks.lock().get_mut(readback.0 as usize) {
            buffer.callback = callback;
        }
    }

    fn map_readback(&self, readback: ReadbackHandle, f: &mut dyn FnMut(&[u8])) -> bool {
        match self.readbacks.lock().get(readback.0 as usize) {
            Some(Some(buffer)) if buffer.mappable => {
                f(&buffer.bytes);
                true
            }
            _ => false,
        }
    }

    fn texture_info(&self, resource: TextureId) -> Option<TextureInfo> {
        self.textures.lock().get(&resource).map(|t| t.info)
    }

    fn resource_state(&self, resource: TextureId) -> Option<ResourceStates> {
        self.textures.lock().get(&resource).map(|t| t.state)
    }

    fn submit_barriers(&self, transitions: &[ResourceTransition]) -> SyncPoint {
        let mut textures = self.textures.lock();
        for transition in transitions {
            if let Some(texture) = textures.get_mut(&transition.resource) {
                debug_assert_eq!(texture.state, transition.before);
                texture.state = transition.after;
            }
        }
        drop(textures);

        let signal = self.next_sync_point();
        self.log(DeviceEvent::Barriers {
            resources: transitions.iter().map(|t| t.resource).collect(),
            signal,
        });
        signal
    }

    fn open_copy_context(&self) -> Box<dyn CopyContext> {
        Box::new(HeadlessCopyContext::new(self.upload_capacity))
    }

    fn submit_copy_context(&self, context: Box<dyn CopyContext>, wait: Option<SyncPoint>) -> SyncPoint {
        let (tiles, levels) = match context.into_any().downcast::<HeadlessCopyContext>() {
            Ok(context) => {
                let touched: AHashSet<TextureId> = context
                    .ops
                    .iter()
                    .map(|op| match op {
                        CopyOp::Tile { resource, .. } | CopyOp::Level { resource, .. } => *resource,
                    })
                    .collect();
                let counts = self.apply_copy(*context);

                // Copy queue access decays resources back to common
                let mut textures = self.textures.lock();
                for resource in touched {
                    if let Some(texture) = textures.get_mut(&resource) {
                        texture.state = ResourceStates::COMMON;
                    }
                }
                counts
            }
            Err(_) => {
                warn!("Foreign copy context submitted to headless device");
                (0, 0)
            }
        };

        debug!("Copy submission: {tiles} tiles, {levels} levels");
        self.log(DeviceEvent::Copy { tiles, levels, wait });
        self.next_sync_point()
    }

    fn update_tile_mappings(&self, resource: TextureId, mappings: &[TileMapping]) {
        match self.textures.lock().get_mut(&resource) {
            Some(texture) => texture.pending.extend_from_slice(mappings),
            None => warn!("Tile mappings for unknown {resource}"),
        }
    }

    fn submit_tile_mappings(&self, resources: &[TextureId]) {
        let mut textures = self.textures.lock();
        for resource in resources {
            let Some(texture) = textures.get_mut(resource) else {
                continue;
            };
            for mapping in std::mem::take(&mut texture.pending) {
                match mapping.state {
                    TileMappingState::Null => {
                        texture.mappings.remove(&mapping.tile);
                        if mapping.tile.is_packed() {
                            texture.packed_levels.clear();
                        }
                    }
                    TileMappingState::Updated | TileMappingState::InUse => {
                        texture.mappings.insert(mapping.tile, (mapping.heap, mapping.heap_offset));
                    }
                }
            }
        }
        drop(textures);

        self.log(DeviceEvent::TileMappings {
            resources: resources.to_vec(),
        });
    }

    fn record_pass(&self, name: &str, queue: QueueType, commands: &[PassCommand]) {
        self.log(DeviceEvent::Pass {
            name: name.to_string(),
            queue,
        });
        for command in commands {
            self.execute(command);
        }
    }

    fn timestamp_frequency(&self) -> u64 {
        TIMESTAMP_FREQUENCY
    }

    fn wait_for_gpu(&self) {}

    fn flush_pending_readbacks(&self) {
        self.process_readbacks();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame_graph::DrawCommand;
    use glam::UVec2;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use vtex_assets::TextureFormat;
    use vtex_core::decode_feedback;

    fn info() -> TextureInfo {
        TextureInfo {
            wh: UVec2::splat(1024),
            mip_count: 11,
            format: TextureFormat::Bc7,
        }
    }

    fn draw(textures: &[TextureId]) -> PassCommand {
        PassCommand::Draw(DrawCommand {
            draw_id: 0,
            textures: textures.iter().copied().collect(),
            constants: UploadReservation { offset: 0, size: 96 },
            vertices: None,
        })
    }

    #[test]
    fn test_tile_mapping_lifecycle() {
        let device = HeadlessDevice::new();
        let texture = device.create_texture(info());
        let heap = device.create_heap(4 * TILE_BYTE_SIZE as u64).unwrap();
        let tile = TileId::new(1, 1, 0);

        device.update_tile_mappings(
            texture,
            &[TileMapping {
                tile,
                heap,
                state: TileMappingState::Updated,
                heap_offset: TILE_BYTE_SIZE as u64,
            }],
        );
        assert!(!device.is_mapped(texture, tile));
        device.submit_tile_mappings(&[texture]);
        assert!(device.is_mapped(texture, tile));

        let mut context = device.open_copy_context();
        let reservation = context.upload_heap().reserve(TILE_BYTE_SIZE, 512).unwrap();
        context.upload_heap().bytes_mut(&reservation).fill(0x5a);
        context.copy_tile(texture, tile, reservation);
        device.submit_copy_context(context, None);

        let contents = device.tile_contents(texture, tile).unwrap();
        assert!(contents.iter().all(|&b| b == 0x5a));
        assert_eq!(device.resource_state(texture), Some(ResourceStates::COMMON));

        device.update_tile_mappings(
            texture,
            &[TileMapping {
                tile,
                heap,
                state: TileMappingState::Null,
                heap_offset: 0,
            }],
        );
        device.submit_tile_mappings(&[texture]);
        assert!(device.tile_contents(texture, tile).is_none());
    }

    #[test]
    fn test_barriers_change_state() {
        let device = HeadlessDevice::new();
        let texture = device.create_texture(info());
        assert_eq!(device.resource_state(texture), Some(ResourceStates::PIXEL_SHADER_RESOURCE));

        let signal = device.submit_barriers(&[ResourceTransition {
            resource: texture,
            before: ResourceStates::PIXEL_SHADER_RESOURCE,
            after: ResourceStates::COPY_DEST,
        }]);
        assert_eq!(device.resource_state(texture), Some(ResourceStates::COPY_DEST));
        assert!(matches!(
            device.events().last(),
            Some(DeviceEvent::Barriers { signal: s, .. }) if *s == signal
        ));
    }

    #[test]
    fn test_emulated_feedback_pass() {
        let device = HeadlessDevice::new();
        let readback = device.create_readback_buffer(4096).unwrap();
        let a = TextureId(0);
        let b = TextureId(1);
        let tile = |t, x| GpuTileId::new(t, TileId::new(x, 0, 0));

        device.stage_samples(&[tile(a, 1), tile(a, 0), tile(a, 1), tile(b, 2)]);
        let commands = [
            PassCommand::ClearFeedback { max_records: 16 },
            PassCommand::BeginTimestamp,
            draw(&[a]),
            PassCommand::Dispatch { kernel: ComputeKernel::CompressFeedback, groups: [1, 1, 1] },
            PassCommand::Dispatch { kernel: ComputeKernel::SetBlockSizes, groups: [1, 1, 1] },
            PassCommand::Dispatch { kernel: ComputeKernel::PrefixSumBlocks, groups: [1, 1, 1] },
            PassCommand::Dispatch { kernel: ComputeKernel::MergeBlocks, groups: [1, 1, 1] },
            PassCommand::EndTimestamp,
            PassCommand::CopyToReadback { readback, max_records: 16 },
            PassCommand::QueueReadback { readback },
        ];
        device.record_pass("Feedback", QueueType::Graphics, &commands);
        assert_eq!(device.pending_readbacks(), 1);

        let mut decoded = None;
        assert!(device.map_readback(readback, &mut |bytes| decoded = decode_feedback(bytes, 16)));
        let decoded = decoded.unwrap();
        assert_eq!(decoded.requests, vec![tile(a, 0), tile(a, 1)]);
        assert!(decoded.header.gpu_time_ms(TIMESTAMP_FREQUENCY) > 0.0);
    }

    #[test]
    fn test_readback_callbacks_in_order() {
        let device = HeadlessDevice::new();
        let first = device.create_readback_buffer(128).unwrap();
        let second = device.create_readback_buffer(128).unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        for readback in [first, second] {
            let order = order.clone();
            device.set_readback_callback(readback, Some(Arc::new(move |h: ReadbackHandle| order.lock().push(h))));
        }

        device.queue_readback(second);
        device.queue_readback(first);
        assert_eq!(device.process_readbacks(), 2);
        assert_eq!(*order.lock(), vec![second, first]);
    }

    #[test]
    fn test_released_readback_cannot_map() {
        let device = HeadlessDevice::new();
        let readback = device.create_readback_buffer(128).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        device.set_readback_callback(
            readback,
            Some(Arc::new(move |_: ReadbackHandle| {
                counter.fetch_add(1, Ordering::Relaxed);
            })),
        );

        device.set_readback_mappable(readback, false);
        assert!(!device.map_readback(readback, &mut |_| {}));
        device.set_readback_mappable(readback, true);
        assert!(device.map_readback(readback, &mut |_| {}));

        device.release_readback(readback);
        assert!(!device.map_readback(readback, &mut |_| {}));
        device.queue_readback(readback);
        device.process_readbacks();
        assert_eq!(calls.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_packed_level_copy_strips_padding() {
        let device = HeadlessDevice::new();
        let texture = device.create_texture(info());

        let mut context = device.open_copy_context();
        let reservation = context.upload_heap().reserve(2 * 256, 512).unwrap();
        let bytes = context.upload_heap().bytes_mut(&reservation);
        bytes[..64].fill(1);
        bytes[256..320].fill(2);
        let upload = LevelUpload {
            reservation,
            row_pitch: 256,
            rows: 2,
            wh: UVec2::new(16, 8),
        };
        context.copy_texture_region(texture, 6, &upload);
        device.submit_copy_context(context, None);

        let level = device.packed_level(texture, 6).unwrap();
        assert_eq!(level.len(), 128);
        assert!(level[..64].iter().all(|&b| b == 1));
        assert!(level[64..].iter().all(|&b| b == 2));
    }

    #[test]
    fn test_draw_collects_only_its_textures() {
        let device = HeadlessDevice::new();
        device.stage_samples(&[GpuTileId::new(TextureId(4), TileId::new(0, 0, 0))]);
        device.record_pass(
            "Draw",
            QueueType::Graphics,
            &[PassCommand::ClearFeedback { max_records: 4 }, draw(&[TextureId(3)])],
        );
        assert!(device.feedback.lock().raw.is_empty());
    }
}
