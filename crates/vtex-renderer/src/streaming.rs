//! Texture Streaming Engine
//!
//! Owns the tile heap, the block allocator and the feedback readback buffer. Each frame the
//! render thread may issue a feedback pass; its readback completion schedules one update task
//! on the worker pool, which reconciles the decoded demand against the cache and submits the
//! resulting uploads and mapping changes.
//!
//! The allocator and stream context live in an `ExclusiveSlot`. The feedback pass takes the
//! lease and the update task releases it, so at most one update is in flight and the next
//! feedback pass is skipped until it finishes.

use std::sync::Arc;
use std::time::Duration;

use glam::UVec2;
use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use vtex_assets::{AssetHandle, AssetStore, TextureStreamContext};
use vtex_core::{
    BlockAllocator, GpuTileId, StreamingConfig, TextureId, UploadHeap, decode_feedback,
    expand_mip_fallback, sort_and_dedup,
};
use vtex_platform::{ExclusiveSlot, RollingTimer, ScopedTimer, SlotLease, ThreadPool};

use crate::device::{Device, HeapHandle, ReadbackHandle};
use crate::feedback_pass::{Camera, FeedbackDraw, FeedbackPassDesc, record_feedback_pass};
use crate::frame_graph::FrameGraph;
use crate::submission::{SubmissionReport, post_updated_tiles};
use crate::{StreamError, StreamResult};

/// Samples kept by the rolling update timer
const UPDATE_TIMER_WINDOW: usize = 64;

/// Streaming counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamingStats {
    /// Feedback passes recorded
    pub feedback_passes: u64,
    /// Feedback passes skipped because an update was in flight
    pub feedback_passes_skipped: u64,
    /// Update tasks that ran to completion
    pub updates_completed: u64,
    /// Update tasks that aborted
    pub updates_aborted: u64,
    /// Records decoded from readbacks
    pub tiles_requested: u64,
    /// Requests after mip fallback expansion
    pub expanded_requests: u64,
    /// Records dropped as malformed
    pub dropped_requests: u64,
    /// Blocks bound to tiles
    pub allocations: u64,
    /// Blocks taken from other tiles
    pub reallocations: u64,
    /// Blocks bound to packed mip tails
    pub packed_allocations: u64,
    /// Tiles uploaded
    pub tiles_copied: u64,
    /// Copies skipped for textures without an asset
    pub skipped_unbound: u64,
    /// Duration of the last update in milliseconds
    pub last_update_ms: f64,
    /// Rolling average update duration in milliseconds
    pub average_update_ms: f64,
    /// GPU time of the last feedback pass in milliseconds
    pub last_gpu_feedback_ms: f64,
    /// Free blocks after the last update
    pub free_blocks: usize,
    /// Stale blocks after the last update
    pub stale_blocks: usize,
    /// In-use blocks after the last update
    pub in_use_blocks: usize,
}

/// Outcome of one update task
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateReport {
    /// Records decoded from the readback
    pub decoded: usize,
    /// Requests after expansion
    pub expanded: usize,
    /// Records dropped as malformed
    pub dropped: usize,
    /// Blocks bound to tiles
    pub allocations: usize,
    /// Blocks taken from other tiles
    pub reallocations: usize,
    /// Blocks bound to packed mip tails
    pub packed_allocations: usize,
    /// GPU submission outcome
    pub submission: SubmissionReport,
    /// GPU time of the feedback pass in milliseconds
    pub gpu_feedback_ms: f64,
}

/// State owned by whoever holds the update lease
struct StreamState {
    allocator: BlockAllocator,
    stream_context: TextureStreamContext,
    update_timer: RollingTimer,
}

/// Registration of an asset as the content of a texture
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MappedAsset {
    texture: TextureId,
    asset: AssetHandle,
}

/// Texture to asset bindings, sorted by texture
#[derive(Debug, Default)]
struct MappedAssets {
    entries: RwLock<Vec<MappedAsset>>,
}

impl MappedAssets {
    fn bind(&self, asset: AssetHandle, texture: TextureId) -> Option<AssetHandle> {
        let mut entries = self.entries.write();
        match entries.binary_search_by_key(&texture, |e| e.texture) {
            Ok(index) => Some(std::mem::replace(&mut entries[index].asset, asset)),
            Err(index) => {
                entries.insert(index, MappedAsset { texture, asset });
                None
            }
        }
    }

    fn get(&self, texture: TextureId) -> Option<AssetHandle> {
        let entries = self.entries.read();
        entries
            .binary_search_by_key(&texture, |e| e.texture)
            .ok()
            .map(|index| entries[index].asset)
    }

    fn len(&self) -> usize {
        self.entries.read().len()
    }
}

/// Everything the update task needs besides its lease
struct EngineShared {
    device: Arc<dyn Device>,
    config: StreamingConfig,
    heap: HeapHandle,
    readback: ReadbackHandle,
    assets: MappedAssets,
    slot: ExclusiveSlot<StreamState>,
    pending: Mutex<Option<SlotLease<StreamState>>>,
    stats: Mutex<StreamingStats>,
}

impl EngineShared {
    /// Start the update for a finished readback on the worker pool
    fn on_readback(self: &Arc<Self>, pool: &ThreadPool, readback: ReadbackHandle) {
        if readback != self.readback {
            return;
        }
        let Some(lease) = self.pending.lock().take() else {
            warn!("Feedback readback completed with no update pending");
            return;
        };

        let shared = self.clone();
        let submitted = pool.submit(move || {
            let mut lease = lease;
            let result = shared.run_update(&mut lease);
            shared.finish_update(&lease, result);
        });
        if let Err(e) = submitted {
            // The lease went down with the rejected task, releasing the slot
            error!("Failed to schedule stream update: {e}");
            self.stats.lock().updates_aborted += 1;
        }
    }

    /// Decode the readback and reconcile it against the cache
    fn run_update(&self, state: &mut StreamState) -> StreamResult<UpdateReport> {
        let mut elapsed = Duration::ZERO;
        let report = {
            let _timer = ScopedTimer::new("stream_update", |_, duration| elapsed = duration);
            self.update(state)?
        };
        state.update_timer.record(elapsed);
        Ok(report)
    }

    fn update(&self, state: &mut StreamState) -> StreamResult<UpdateReport> {
        let mut decoded = None;
        let mapped = self.device.map_readback(self.readback, &mut |bytes: &[u8]| {
            decoded = decode_feedback(bytes, self.config.max_requests_per_update);
        });
        if !mapped {
            return Err(StreamError::ReadbackUnavailable);
        }
        let readback = decoded.ok_or(StreamError::MalformedReadback)?;

        let mut requests = readback.requests;
        let decoded_count = requests.len();
        sort_and_dedup(&mut requests);

        let device = self.device.as_ref();
        let (expanded, expansion) =
            expand_mip_fallback(&requests, |texture| device.texture_info(texture).map(|i| i.layout()));

        let allocation = state
            .allocator
            .reconcile(&expanded, self.config.allocation_budget);
        let submission = post_updated_tiles(
            device,
            self.heap,
            |texture| self.assets.get(texture),
            &mut state.stream_context,
            &allocation,
        );

        Ok(UpdateReport {
            decoded: decoded_count,
            expanded: expanded.len(),
            dropped: expansion.dropped,
            allocations: allocation.allocations.len(),
            reallocations: allocation.reallocations.len(),
            packed_allocations: allocation.packed_allocations.len(),
            submission,
            gpu_feedback_ms: readback.header.gpu_time_ms(device.timestamp_frequency()),
        })
    }

    fn finish_update(&self, state: &StreamState, result: StreamResult<UpdateReport>) {
        let partition = state.allocator.partition();
        let mut stats = self.stats.lock();
        stats.free_blocks = partition.free;
        stats.stale_blocks = partition.stale;
        stats.in_use_blocks = partition.in_use;

        match result {
            Ok(report) => {
                debug!(
                    "Stream update: {} requests, {} expanded, {} allocations, {} reallocations, {} packed",
                    report.decoded,
                    report.expanded,
                    report.allocations,
                    report.reallocations,
                    report.packed_allocations
                );
                stats.updates_completed += 1;
                stats.tiles_requested += report.decoded as u64;
                stats.expanded_requests += report.expanded as u64;
                stats.dropped_requests += report.dropped as u64;
                stats.allocations += report.allocations as u64;
                stats.reallocations += report.reallocations as u64;
                stats.packed_allocations += report.packed_allocations as u64;
                stats.tiles_copied += report.submission.tiles_copied as u64;
                stats.skipped_unbound += report.submission.skipped_unbound as u64;
                stats.last_gpu_feedback_ms = report.gpu_feedback_ms;
                stats.last_update_ms = state.update_timer.last_ms();
                stats.average_update_ms = state.update_timer.average_ms();
            }
            Err(e) => {
                warn!("Stream update aborted: {e}");
                stats.updates_aborted += 1;
            }
        }
    }
}

/// Feedback-driven tile streaming for a set of tiled textures
pub struct TextureStreamingEngine {
    shared: Arc<EngineShared>,
    pool: Arc<ThreadPool>,
}

impl TextureStreamingEngine {
    /// Create an engine with a heap of `config.cache_size_bytes` on `device`
    pub fn new(
        device: Arc<dyn Device>,
        store: Arc<dyn AssetStore>,
        config: StreamingConfig,
    ) -> StreamResult<Self> {
        config.validate()?;

        let heap = device.create_heap(config.cache_size_bytes)?;
        let readback = device.create_readback_buffer(config.readback_buffer_size)?;
        let pool = Arc::new(ThreadPool::new("vtex-stream", config.resolved_worker_threads())?);

        let state = StreamState {
            allocator: config.create_allocator(),
            stream_context: TextureStreamContext::new(store),
            update_timer: RollingTimer::new(UPDATE_TIMER_WINDOW),
        };

        info!(
            "Texture streaming: {} blocks of {} bytes, readback {} bytes",
            config.block_count(),
            config.block_size_bytes,
            config.readback_buffer_size
        );

        let shared = Arc::new(EngineShared {
            device: device.clone(),
            config,
            heap,
            readback,
            assets: MappedAssets::default(),
            slot: ExclusiveSlot::new(state),
            pending: Mutex::new(None),
            stats: Mutex::new(StreamingStats::default()),
        });

        let callback_shared = shared.clone();
        let callback_pool = pool.clone();
        device.set_readback_callback(
            readback,
            Some(Arc::new(move |handle: ReadbackHandle| {
                callback_shared.on_readback(&callback_pool, handle)
            })),
        );

        Ok(Self { shared, pool })
    }

    /// Streaming configuration
    pub fn config(&self) -> &StreamingConfig {
        &self.shared.config
    }

    /// Heap backing the streamed tiles
    pub fn heap(&self) -> HeapHandle {
        self.shared.heap
    }

    /// Readback buffer receiving feedback
    pub fn readback(&self) -> ReadbackHandle {
        self.shared.readback
    }

    /// Register `asset` as the content of `texture`, replacing any previous binding
    pub fn bind_asset(&self, asset: AssetHandle, texture: TextureId) {
        if let Some(previous) = self.shared.assets.bind(asset, texture) {
            debug!("Rebound {texture} from {previous} to {asset}");
        }
    }

    /// Asset bound to a texture
    pub fn get_resource_asset(&self, texture: TextureId) -> Option<AssetHandle> {
        self.shared.assets.get(texture)
    }

    /// Number of bound textures
    pub fn bound_textures(&self) -> usize {
        self.shared.assets.len()
    }

    /// Record this frame's feedback pass and run it on the device
    ///
    /// Returns `Ok(false)` without recording anything while an update is in flight.
    pub fn texture_feedback_pass(
        &self,
        camera: &Camera,
        render_target_size: UVec2,
        draws: &[FeedbackDraw],
        constants: &mut dyn UploadHeap,
        vertices: &mut dyn UploadHeap,
    ) -> StreamResult<bool> {
        let shared = &self.shared;
        let Some(lease) = shared.slot.try_acquire() else {
            shared.stats.lock().feedback_passes_skipped += 1;
            return Ok(false);
        };

        let mut graph = FrameGraph::new();
        let max_records = vtex_core::feedback::readback_capacity(shared.config.readback_buffer_size)
            .min(shared.config.max_requests_per_update) as u32;
        let desc = FeedbackPassDesc {
            camera,
            render_target_size,
            feedback_target_size: UVec2::from_array(shared.config.feedback_target_size),
            draws,
            readback: shared.readback,
            max_records,
        };
        record_feedback_pass(&mut graph, &desc, constants, vertices);

        // The readback may complete as soon as the graph runs
        *shared.pending.lock() = Some(lease);
        if let Err(e) = graph.execute(shared.device.as_ref()) {
            shared.pending.lock().take();
            return Err(e.into());
        }

        shared.stats.lock().feedback_passes += 1;
        Ok(true)
    }

    /// Allocate and upload the packed mip tail of `texture` right away
    pub fn load_lowest_level(&self, texture: TextureId) -> StreamResult<SubmissionReport> {
        let shared = &self.shared;
        let mut lease = shared.slot.try_acquire().ok_or(StreamError::UpdateInFlight)?;
        let info = shared
            .device
            .texture_info(texture)
            .ok_or(StreamError::UnknownTexture(texture))?;

        let layout = info.layout();
        if layout.packed_info().level_count() == 0 {
            debug!("{texture} has no packed mip tail to load");
            return Ok(SubmissionReport::default());
        }

        let request = GpuTileId::new(texture, layout.packed_tile());
        let state = &mut *lease;
        let allocation = state
            .allocator
            .allocate_blocks(&[request], shared.config.allocation_budget);
        let report = post_updated_tiles(
            shared.device.as_ref(),
            shared.heap,
            |texture| shared.assets.get(texture),
            &mut state.stream_context,
            &allocation,
        );

        let mut stats = shared.stats.lock();
        stats.packed_allocations += allocation.packed_allocations.len() as u64;
        stats.reallocations += allocation.reallocations.len() as u64;
        Ok(report)
    }

    /// Whether an update holds the cache
    pub fn is_update_in_flight(&self) -> bool {
        self.shared.slot.is_in_flight()
    }

    /// Block until no update is in flight
    pub fn wait_idle(&self) {
        self.shared.slot.wait_idle();
    }

    /// Block until no update is in flight or the timeout elapses
    pub fn wait_idle_for(&self, timeout: Duration) -> bool {
        self.shared.slot.wait_idle_for(timeout)
    }

    /// Snapshot of the streaming counters
    pub fn stats(&self) -> StreamingStats {
        self.shared.stats.lock().clone()
    }

    /// Run `f` on the allocator when no update is in flight
    pub fn with_allocator<R>(&self, f: impl FnOnce(&BlockAllocator) -> R) -> Option<R> {
        let lease = self.shared.slot.try_acquire()?;
        Some(f(&lease.allocator))
    }
}

impl Drop for TextureStreamingEngine {
    fn drop(&mut self) {
        let shared = &self.shared;
        shared.device.set_readback_callback(shared.readback, None);
        // A queued readback that never completes still holds the lease
        shared.pending.lock().take();
        shared.slot.wait_idle();

        shared.device.wait_for_gpu();
        shared.device.flush_pending_readbacks();
        shared.device.release_readback(shared.readback);
        self.pool.wait_all();
        debug!("Texture streaming engine shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::TextureInfo;
    use crate::headless::HeadlessDevice;
    use vtex_assets::container::{build_synthetic_texture, full_mip_count};
    use vtex_assets::{MemoryAssetStore, TextureFormat};
    use vtex_core::{FeedbackHeader, LinearUploadHeap, TILE_BYTE_SIZE, TileId, encode_feedback};

    struct Harness {
        device: Arc<HeadlessDevice>,
        store: Arc<MemoryAssetStore>,
        engine: TextureStreamingEngine,
    }

    fn harness(blocks: u64) -> Harness {
        let device = Arc::new(HeadlessDevice::new());
        let store = Arc::new(MemoryAssetStore::new());
        let config = StreamingConfig {
            cache_size_bytes: blocks * TILE_BYTE_SIZE as u64,
            worker_threads: 2,
            ..Default::default()
        };
        let engine = TextureStreamingEngine::new(device.clone(), store.clone(), config).unwrap();
        Harness { device, store, engine }
    }

    impl Harness {
        fn add_texture(&self, size: u32, format: TextureFormat) -> TextureId {
            self.add_texture_with_mips(size, format, full_mip_count(UVec2::splat(size)))
        }

        fn add_texture_with_mips(&self, size: u32, format: TextureFormat, mip_count: u32) -> TextureId {
            let wh = UVec2::splat(size);
            let texture = self.device.create_texture(TextureInfo { wh, mip_count, format });
            let asset = self
                .store
                .insert(build_synthetic_texture(format, wh, mip_count).unwrap());
            self.engine.bind_asset(asset, texture);
            texture
        }

        fn frame(&self, samples: &[GpuTileId], textures: &[TextureId]) -> bool {
            let mut constants = LinearUploadHeap::new(64 * 1024);
            let mut vertices = LinearUploadHeap::new(64 * 1024);
            self.device.stage_samples(samples);
            let draws = [FeedbackDraw::new(0, textures.iter().copied())];
            let issued = self
                .engine
                .texture_feedback_pass(
                    &Camera::default(),
                    UVec2::new(1024, 1024),
                    &draws,
                    &mut constants,
                    &mut vertices,
                )
                .unwrap();
            self.device.process_readbacks();
            issued
        }

        fn settle(&self) {
            assert!(self.engine.wait_idle_for(Duration::from_secs(10)));
        }
    }

    #[test]
    fn test_bind_and_rebind_asset() {
        let h = harness(8);
        let texture = TextureId(5);
        assert!(h.engine.get_resource_asset(texture).is_none());

        h.engine.bind_asset(AssetHandle(1), texture);
        h.engine.bind_asset(AssetHandle(2), TextureId(1));
        assert_eq!(h.engine.get_resource_asset(texture), Some(AssetHandle(1)));

        h.engine.bind_asset(AssetHandle(3), texture);
        assert_eq!(h.engine.get_resource_asset(texture), Some(AssetHandle(3)));
        assert_eq!(h.engine.bound_textures(), 2);
    }

    #[test]
    fn test_feedback_drives_uploads() {
        let h = harness(32);
        let texture = h.add_texture(1024, TextureFormat::Bc7);
        let leaf = GpuTileId::new(texture, TileId::new(3, 2, 0));

        assert!(h.frame(&[leaf], &[texture]));
        h.settle();

        // Leaf, its two tiled ancestors and the packed tail
        assert!(h.device.is_mapped(texture, TileId::new(3, 2, 0)));
        assert!(h.device.is_mapped(texture, TileId::new(1, 1, 1)));
        assert!(h.device.is_mapped(texture, TileId::new(0, 0, 2)));
        assert!(h.device.is_mapped(texture, TileId::packed(3)));

        let contents = h.device.tile_contents(texture, TileId::new(3, 2, 0)).unwrap();
        assert_eq!(&contents[..5], &[0, 192, 0, 128, 0]);

        let stats = h.engine.stats();
        assert_eq!(stats.updates_completed, 1);
        assert_eq!(stats.tiles_requested, 1);
        assert_eq!(stats.allocations, 3);
        assert_eq!(stats.packed_allocations, 1);
        assert_eq!(stats.in_use_blocks, 4);
        assert_eq!(stats.free_blocks, 28);
    }

    #[test]
    fn test_feedback_pass_skipped_while_update_pending() {
        let h = harness(8);
        let texture = h.add_texture(512, TextureFormat::Bc7);
        let mut constants = LinearUploadHeap::new(64 * 1024);
        let mut vertices = LinearUploadHeap::new(64 * 1024);
        let draws = [FeedbackDraw::new(0, [texture])];
        let camera = Camera::default();

        let mut pass = || {
            h.engine
                .texture_feedback_pass(&camera, UVec2::splat(512), &draws, &mut constants, &mut vertices)
                .unwrap()
        };
        assert!(pass());
        assert!(h.engine.is_update_in_flight());
        assert!(!pass());
        assert!(!pass());
        assert_eq!(h.device.pending_readbacks(), 1);

        h.device.process_readbacks();
        h.settle();
        assert!(!h.engine.is_update_in_flight());
        assert!(pass());

        let stats = h.engine.stats();
        assert_eq!(stats.feedback_passes, 2);
        assert_eq!(stats.feedback_passes_skipped, 2);
    }

    #[test]
    fn test_unmappable_readback_aborts_cleanly() {
        let h = harness(8);
        let texture = h.add_texture(512, TextureFormat::Bc7);
        h.device.set_readback_mappable(h.engine.readback(), false);

        assert!(h.frame(&[GpuTileId::new(texture, TileId::new(0, 0, 0))], &[texture]));
        h.settle();

        let stats = h.engine.stats();
        assert_eq!(stats.updates_aborted, 1);
        assert_eq!(stats.updates_completed, 0);
        assert!(h.device.mapped_tiles(texture).is_empty());
        assert_eq!(h.engine.with_allocator(|a| a.partition().free), Some(8));
    }

    #[test]
    fn test_request_cap_bounds_processing() {
        let device = Arc::new(HeadlessDevice::new());
        let store = Arc::new(MemoryAssetStore::new());
        let config = StreamingConfig {
            cache_size_bytes: 64 * TILE_BYTE_SIZE as u64,
            max_requests_per_update: 2,
            worker_threads: 1,
            ..Default::default()
        };
        let engine = TextureStreamingEngine::new(device.clone(), store.clone(), config).unwrap();
        let wh = UVec2::splat(2048);
        let texture = device.create_texture(TextureInfo {
            wh,
            mip_count: full_mip_count(wh),
            format: TextureFormat::Bc7,
        });
        engine.bind_asset(store.insert(build_synthetic_texture(TextureFormat::Bc7, wh, 12).unwrap()), texture);

        // Forge a readback with more records than the cap
        let requests: Vec<_> = (0..6).map(|x| GpuTileId::new(texture, TileId::new(x, 0, 0))).collect();
        let mut bytes = vec![0u8; 4096];
        encode_feedback(&FeedbackHeader::new(6, 0, 0), &requests, &mut bytes);

        let mut constants = LinearUploadHeap::new(4096);
        let mut vertices = LinearUploadHeap::new(4096);
        assert!(engine
            .texture_feedback_pass(&Camera::default(), UVec2::splat(512), &[], &mut constants, &mut vertices)
            .unwrap());
        assert!(device.write_readback(engine.readback(), &bytes));
        device.process_readbacks();
        assert!(engine.wait_idle_for(Duration::from_secs(10)));

        assert_eq!(engine.stats().tiles_requested, 2);
    }

    #[test]
    fn test_load_lowest_level() {
        let h = harness(8);
        let texture = h.add_texture(1024, TextureFormat::Bc1);

        let report = h.engine.load_lowest_level(texture).unwrap();
        assert_eq!(report.packed_mapped, 1);
        assert!(report.packed_levels_copied > 0);

        let info = h.device.texture_info(texture).unwrap();
        let packed = info.layout().packed_tile();
        assert!(h.device.is_mapped(texture, packed));

        // Loading again finds the tail resident
        let again = h.engine.load_lowest_level(texture).unwrap();
        assert_eq!(again.packed_mapped, 0);

        assert!(matches!(
            h.engine.load_lowest_level(TextureId(99)),
            Err(StreamError::UnknownTexture(_))
        ));
    }

    #[test]
    fn test_load_lowest_level_without_packed_tail() {
        let h = harness(8);
        let texture = h.add_texture_with_mips(2048, TextureFormat::Bc7, 3);

        let report = h.engine.load_lowest_level(texture).unwrap();
        assert_eq!(report, SubmissionReport::default());
        assert_eq!(h.engine.with_allocator(|a| a.partition().in_use), Some(0));
    }

    #[test]
    fn test_load_lowest_level_rejected_during_update() {
        let h = harness(8);
        let texture = h.add_texture(512, TextureFormat::Bc7);
        let mut constants = LinearUploadHeap::new(4096);
        let mut vertices = LinearUploadHeap::new(4096);

        assert!(h
            .engine
            .texture_feedback_pass(&Camera::default(), UVec2::splat(512), &[], &mut constants, &mut vertices)
            .unwrap());
        assert!(matches!(h.engine.load_lowest_level(texture), Err(StreamError::UpdateInFlight)));

        h.device.process_readbacks();
        h.settle();
        assert!(h.engine.load_lowest_level(texture).is_ok());
    }

    #[test]
    fn test_cache_exhaustion_degrades() {
        let h = harness(1);
        let texture = h.add_texture(4096, TextureFormat::Bc7);
        let samples: Vec<_> = (0..10).map(|x| GpuTileId::new(texture, TileId::new(x, 0, 0))).collect();

        for _ in 0..3 {
            assert!(h.frame(&samples, &[texture]));
            h.settle();
            let stats = h.engine.stats();
            assert_eq!(stats.in_use_blocks + stats.stale_blocks + stats.free_blocks, 1);
        }
        assert_eq!(h.engine.stats().updates_completed, 3);
        assert_eq!(h.engine.stats().updates_aborted, 0);
    }

    #[test]
    fn test_unknown_texture_requests_dropped() {
        let h = harness(8);
        let texture = h.add_texture(512, TextureFormat::Bc7);
        let ghost = GpuTileId::new(TextureId(77), TileId::new(0, 0, 0));

        assert!(h.frame(&[ghost], &[texture, TextureId(77)]));
        h.settle();

        let stats = h.engine.stats();
        assert_eq!(stats.dropped_requests, 1);
        assert_eq!(stats.allocations, 0);
    }

    #[test]
    fn test_shutdown_with_pending_readback() {
        let h = harness(8);
        let texture = h.add_texture(512, TextureFormat::Bc7);
        let mut constants = LinearUploadHeap::new(4096);
        let mut vertices = LinearUploadHeap::new(4096);
        let draws = [FeedbackDraw::new(0, [texture])];

        assert!(h
            .engine
            .texture_feedback_pass(&Camera::default(), UVec2::splat(512), &draws, &mut constants, &mut vertices)
            .unwrap());

        let readback = h.engine.readback();
        drop(h.engine);
        assert!(!h.device.map_readback(readback, &mut |_| {}));
    }
}
