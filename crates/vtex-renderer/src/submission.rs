//! Tile Mapping Submission
//!
//! Turns a `BlockAllocation` into GPU work: unmaps reallocated tiles, uploads and maps newly
//! allocated tiles and packed mip tails, and batches mapping updates per texture.

use std::cmp::Reverse;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use vtex_assets::{AssetError, AssetHandle, AssetResult, TextureStreamContext};
use vtex_core::{AllocatedBlock, BlockAllocation, TextureId, UploadHeap};

use crate::device::{
    CopyContext, Device, HeapHandle, ResourceStates, ResourceTransition, SyncPoint, TileMapping,
    TileMappingState,
};

/// Outcome of one submission
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionReport {
    /// Tiles unmapped for reallocation
    pub unmapped: usize,
    /// Tiles uploaded and mapped
    pub tiles_copied: usize,
    /// Packed mip levels uploaded
    pub packed_levels_copied: usize,
    /// Packed tails mapped
    pub packed_mapped: usize,
    /// Blocks whose texture has no bound asset
    pub skipped_unbound: usize,
    /// Blocks whose content could not be read
    pub skipped_failed: usize,
    /// Textures transitioned before copying
    pub barriers: usize,
    /// Copy command lists submitted
    pub copy_submissions: usize,
}

/// Copy context plus the mapping updates that must land before it executes
struct SubmissionBatch<'a> {
    device: &'a dyn Device,
    context: Option<Box<dyn CopyContext>>,
    mappings: Vec<(TextureId, TileMapping)>,
    wait: Option<SyncPoint>,
    has_copies: bool,
    submissions: usize,
}

impl<'a> SubmissionBatch<'a> {
    fn new(device: &'a dyn Device, wait: Option<SyncPoint>) -> Self {
        Self {
            device,
            context: None,
            mappings: Vec::new(),
            wait,
            has_copies: false,
            submissions: 0,
        }
    }

    fn context(&mut self) -> &mut dyn CopyContext {
        self.context
            .get_or_insert_with(|| self.device.open_copy_context())
            .as_mut()
    }

    fn map(&mut self, texture: TextureId, mapping: TileMapping) {
        self.mappings.push((texture, mapping));
    }

    fn flush_mappings(&mut self) {
        if self.mappings.is_empty() {
            return;
        }

        // Stable sort keeps unmaps ahead of maps within a texture
        self.mappings.sort_by_key(|(texture, _)| *texture);
        let mut resources = Vec::new();
        for chunk in self.mappings.chunk_by(|a, b| a.0 == b.0) {
            let texture = chunk[0].0;
            let mappings: Vec<TileMapping> = chunk.iter().map(|(_, m)| *m).collect();
            self.device.update_tile_mappings(texture, &mappings);
            resources.push(texture);
        }
        self.device.submit_tile_mappings(&resources);
        self.mappings.clear();
    }

    /// Apply pending mappings, then execute the copies recorded so far
    fn submit(&mut self) {
        self.flush_mappings();
        let Some(context) = self.context.take() else {
            return;
        };
        if !self.has_copies {
            return;
        }

        self.device.submit_copy_context(context, self.wait.take());
        self.has_copies = false;
        self.submissions += 1;
    }

    /// Run a read into upload memory, submitting and retrying once if the memory is exhausted
    fn read<T>(
        &mut self,
        mut read: impl FnMut(&mut dyn UploadHeap) -> AssetResult<T>,
    ) -> AssetResult<T> {
        match read(self.context().upload_heap()) {
            Err(AssetError::UploadHeapExhausted { .. }) if self.has_copies => {
                debug!("Upload memory exhausted, submitting copy batch early");
                self.submit();
                read(self.context().upload_heap())
            }
            result => result,
        }
    }
}

fn transition_for_copy(device: &dyn Device, allocation: &BlockAllocation) -> Vec<ResourceTransition> {
    let mut textures: Vec<TextureId> = allocation
        .allocations
        .iter()
        .chain(&allocation.packed_allocations)
        .map(|block| block.texture)
        .collect();
    textures.sort_unstable();
    textures.dedup();

    textures
        .into_iter()
        .filter_map(|resource| {
            let before = device.resource_state(resource)?;
            (!before.is_copy_writable()).then_some(ResourceTransition {
                resource,
                before,
                after: ResourceStates::COPY_DEST,
            })
        })
        .collect()
}

/// Submit the GPU work of one allocation
///
/// Missing asset bindings and unreadable content skip the affected block with a log message.
/// Such blocks stay bound in the allocator and their tiles stay unmapped.
pub fn post_updated_tiles<F>(
    device: &dyn Device,
    heap: HeapHandle,
    asset_of: F,
    stream: &mut TextureStreamContext,
    allocation: &BlockAllocation,
) -> SubmissionReport
where
    F: Fn(TextureId) -> Option<AssetHandle>,
{
    let mut report = SubmissionReport::default();
    if allocation.is_empty() {
        return report;
    }

    let transitions = transition_for_copy(device, allocation);
    let wait = if transitions.is_empty() {
        None
    } else {
        report.barriers = transitions.len();
        Some(device.submit_barriers(&transitions))
    };

    let mut batch = SubmissionBatch::new(device, wait);

    for block in &allocation.reallocations {
        batch.map(
            block.texture,
            TileMapping {
                tile: block.tile,
                heap,
                state: TileMappingState::Null,
                heap_offset: block.heap_offset,
            },
        );
        report.unmapped += 1;
    }

    // Coarse levels first so fallbacks land before the tiles that rely on them
    let mut allocations: Vec<&AllocatedBlock> = allocation.allocations.iter().collect();
    allocations.sort_by_key(|b| (b.texture, Reverse(b.tile.mip_level()), b.tile.y(), b.tile.x()));

    for block in allocations {
        let Some(asset) = asset_of(block.texture) else {
            warn!("No asset bound to {}, skipping tile {:?}", block.texture, block.tile);
            report.skipped_unbound += 1;
            continue;
        };
        if !stream.open(block.tile.mip_level(), asset) {
            report.skipped_failed += 1;
            continue;
        }

        match batch.read(|upload| stream.read_tile(block.tile, upload)) {
            Ok(reservation) => {
                batch.map(
                    block.texture,
                    TileMapping {
                        tile: block.tile,
                        heap,
                        state: TileMappingState::Updated,
                        heap_offset: block.heap_offset,
                    },
                );
                batch.context().copy_tile(block.texture, block.tile, reservation);
                batch.has_copies = true;
                report.tiles_copied += 1;
            }
            Err(e) => {
                warn!("Failed to read tile {:?} of {}: {e}", block.tile, block.texture);
                report.skipped_failed += 1;
            }
        }
    }

    for block in &allocation.packed_allocations {
        let Some(asset) = asset_of(block.texture) else {
            warn!("No asset bound to {}, skipping packed tail", block.texture);
            report.skipped_unbound += 1;
            continue;
        };
        let Some(info) = device.texture_info(block.texture) else {
            warn!("Packed allocation for unknown {}", block.texture);
            report.skipped_failed += 1;
            continue;
        };

        let packed = info.layout().packed_info();
        let mut copied = 0;
        for level in packed.starting_level..packed.ending_level {
            if !stream.open(level, asset) {
                report.skipped_failed += 1;
                continue;
            }
            match batch.read(|upload| stream.read(upload)) {
                Ok(upload) => {
                    batch.context().copy_texture_region(block.texture, level, &upload);
                    batch.has_copies = true;
                    copied += 1;
                }
                Err(e) => {
                    warn!("Failed to read level {level} of {}: {e}", block.texture);
                    report.skipped_failed += 1;
                }
            }
        }
        if copied == 0 {
            warn!("No packed levels of {} were copied, leaving its tail unmapped", block.texture);
            continue;
        }

        batch.map(
            block.texture,
            TileMapping {
                tile: block.tile,
                heap,
                state: TileMappingState::Updated,
                heap_offset: block.heap_offset,
            },
        );
        report.packed_levels_copied += copied;
        report.packed_mapped += 1;
    }

    batch.submit();
    report.copy_submissions = batch.submissions;
    debug!(
        "Submitted {} tiles, {} packed levels, {} unmaps",
        report.tiles_copied, report.packed_levels_copied, report.unmapped
    );
    report
}
