//! Block Allocator
//!
//! Fixed pool of equally sized GPU heap blocks backing the tile cache:
//! - Free / stale / in-use partition with a per-block idle counter
//! - O(1) residency lookup by (texture, tile)
//! - Priority-ordered allocation with a per-update budget
//! - Reallocation records carrying the previous binding for unmapping

use std::cmp::Reverse;

use ahash::AHashMap;
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};

use crate::tile::{GpuTileId, MAX_MIP_LEVELS, TextureId, TileId};

/// Occupancy state of one block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlockState {
    /// Never bound, or reclaimed
    Free,
    /// Bound but not requested for longer than the stale threshold
    Stale,
    /// Bound and recently requested
    InUse,
}

/// One fixed-size slot in the GPU heap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    /// Current (texture, tile) binding
    pub binding: Option<GpuTileId>,
    /// Occupancy state
    pub state: BlockState,
    /// Updates since the binding was last requested
    pub idle_frames: u32,
    /// Fixed slot index in the heap
    pub index: u32,
}

impl Block {
    fn new(index: u32) -> Self {
        Self {
            binding: None,
            state: BlockState::Free,
            idle_frames: 0,
            index,
        }
    }
}

/// A tile bound to a heap block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocatedBlock {
    /// Texture owning the tile
    pub texture: TextureId,
    /// Bound tile
    pub tile: TileId,
    /// Byte offset of the block in the heap
    pub heap_offset: u64,
    /// Block index in the heap
    pub tile_index: u32,
}

impl AllocatedBlock {
    /// The (texture, tile) pair of this record
    pub fn gpu_tile(&self) -> GpuTileId {
        GpuTileId::new(self.texture, self.tile)
    }
}

/// Result of one allocator invocation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockAllocation {
    /// Previous bindings of reused blocks, to be unmapped
    pub reallocations: Vec<AllocatedBlock>,
    /// New bindings of individually tiled mips
    pub allocations: Vec<AllocatedBlock>,
    /// New bindings of packed mip tails
    pub packed_allocations: Vec<AllocatedBlock>,
}

impl BlockAllocation {
    /// Whether the invocation changed nothing
    pub fn is_empty(&self) -> bool {
        self.reallocations.is_empty()
            && self.allocations.is_empty()
            && self.packed_allocations.is_empty()
    }

    /// Number of blocks that received a new binding
    pub fn bound_count(&self) -> usize {
        self.allocations.len() + self.packed_allocations.len()
    }
}

/// Block counts per state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockPartition {
    /// Free blocks
    pub free: usize,
    /// Stale blocks
    pub stale: usize,
    /// In-use blocks
    pub in_use: usize,
}

impl BlockPartition {
    /// Sum of all states
    pub fn total(&self) -> usize {
        self.free + self.stale + self.in_use
    }
}

/// Lifetime counters of an allocator
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocatorStats {
    /// Requests found resident
    pub hits: u64,
    /// Requests not resident
    pub misses: u64,
    /// Blocks bound
    pub allocations: u64,
    /// Blocks taken from another binding
    pub reallocations: u64,
    /// In-use blocks evicted under pressure
    pub evictions: u64,
    /// Needed tiles left unserved by a batch
    pub deferred: u64,
    /// Blocks demoted to stale
    pub demotions: u64,
}

/// Tile cache block allocator
///
/// Owns the block table exclusively. Callers hand it the decoded demand of one update and get
/// back the binding changes to submit.
pub struct BlockAllocator {
    blocks: Vec<Block>,
    /// Free slots, lowest index on top
    free: Vec<u32>,
    stale: IndexSet<u32>,
    in_use: IndexSet<u32>,
    resident: AHashMap<GpuTileId, u32>,
    block_size: u64,
    stale_threshold: u32,
    stats: AllocatorStats,
}

impl BlockAllocator {
    /// Create an allocator over `block_count` blocks of `block_size` bytes
    pub fn new(block_count: u32, block_size: u64, stale_threshold: u32) -> Self {
        let blocks = (0..block_count).map(Block::new).collect();
        let free = (0..block_count).rev().collect();

        Self {
            blocks,
            free,
            stale: IndexSet::new(),
            in_use: IndexSet::new(),
            resident: AHashMap::with_capacity(block_count as usize),
            block_size,
            stale_threshold,
            stats: AllocatorStats::default(),
        }
    }

    /// Number of blocks in the pool
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Byte size of one block
    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Idle updates after which an in-use block becomes stale
    pub fn stale_threshold(&self) -> u32 {
        self.stale_threshold
    }

    /// Get a block by index
    pub fn block(&self, index: u32) -> Option<&Block> {
        self.blocks.get(index as usize)
    }

    /// Iterate over all blocks
    pub fn blocks(&self) -> impl Iterator<Item = &Block> {
        self.blocks.iter()
    }

    /// Find the block bound to a tile
    pub fn lookup(&self, tile: &GpuTileId) -> Option<&Block> {
        self.resident
            .get(tile)
            .map(|&index| &self.blocks[index as usize])
    }

    /// Whether a tile is currently bound
    pub fn is_resident(&self, tile: &GpuTileId) -> bool {
        self.resident.contains_key(tile)
    }

    /// Block counts per state
    pub fn partition(&self) -> BlockPartition {
        BlockPartition {
            free: self.free.len(),
            stale: self.stale.len(),
            in_use: self.in_use.len(),
        }
    }

    /// Lifetime counters
    pub fn stats(&self) -> &AllocatorStats {
        &self.stats
    }

    /// Check that free, stale and in-use partition the block table and agree with the bindings
    pub fn check_partition(&self) -> bool {
        if self.partition().total() != self.blocks.len() {
            return false;
        }

        let mut seen = vec![false; self.blocks.len()];
        let sets = [
            (BlockState::Free, self.free.iter().collect::<Vec<_>>()),
            (BlockState::Stale, self.stale.iter().collect()),
            (BlockState::InUse, self.in_use.iter().collect()),
        ];
        for (state, indices) in sets {
            for &index in indices {
                let Some(block) = self.blocks.get(index as usize) else {
                    return false;
                };
                if seen[index as usize] || block.state != state {
                    return false;
                }
                seen[index as usize] = true;
            }
        }

        let bound = self.blocks.iter().filter(|b| b.binding.is_some()).count();
        bound == self.resident.len()
            && self.resident.iter().all(|(tile, &index)| {
                self.blocks[index as usize].binding == Some(*tile)
            })
    }

    /// Age the pool against this update's requests and return the unsatisfied tiles
    ///
    /// Resident requests reset their block's idle counter (promoting stale blocks back to
    /// in-use). In-use blocks idle for longer than the threshold are demoted to stale. The
    /// result is deduplicated and sorted by priority, finest mips first.
    pub fn update_tile_states(&mut self, requests: &[GpuTileId]) -> Vec<GpuTileId> {
        for &index in self.in_use.iter().chain(self.stale.iter()) {
            let block = &mut self.blocks[index as usize];
            block.idle_frames = block.idle_frames.saturating_add(1);
        }

        let mut needed = Vec::new();
        for request in requests {
            if !request.is_valid() {
                continue;
            }

            match self.resident.get(request) {
                Some(&index) => {
                    let block = &mut self.blocks[index as usize];
                    // Every resident block was aged above, so a zero counter marks a repeat
                    if block.idle_frames > 0 {
                        self.stats.hits += 1;
                    }
                    block.idle_frames = 0;
                    if block.state == BlockState::Stale {
                        block.state = BlockState::InUse;
                        self.stale.swap_remove(&index);
                        self.in_use.insert(index);
                    }
                }
                None => needed.push(*request),
            }
        }

        let threshold = self.stale_threshold;
        let demoted: Vec<u32> = self
            .in_use
            .iter()
            .copied()
            .filter(|&index| self.blocks[index as usize].idle_frames > threshold)
            .collect();
        for index in demoted {
            self.in_use.swap_remove(&index);
            self.stale.insert(index);
            self.blocks[index as usize].state = BlockState::Stale;
            self.stats.demotions += 1;
        }

        needed.sort_unstable_by(GpuTileId::priority_cmp);
        needed.dedup();
        self.stats.misses += needed.len() as u64;
        needed
    }

    /// Bind blocks to `needed` tiles in order, at most `budget` of them
    ///
    /// Free blocks are used first, then the longest-idle stale block, then the longest-idle
    /// in-use block bound to a strictly coarser unpacked tile that was not requested this
    /// update. Stops at the first request no block can serve.
    pub fn allocate_blocks(&mut self, needed: &[GpuTileId], budget: usize) -> BlockAllocation {
        let mut allocation = BlockAllocation::default();
        let mut taken = 0;

        for (position, request) in needed.iter().enumerate() {
            if taken >= budget {
                self.stats.deferred += (needed.len() - position) as u64;
                break;
            }

            assert!(
                request.tile.mip_level() < MAX_MIP_LEVELS,
                "mip level {} out of range",
                request.tile.mip_level()
            );
            if !request.texture.is_valid() || self.resident.contains_key(request) {
                continue;
            }

            let index = if let Some(index) = self.free.pop() {
                index
            } else if let Some(index) = self.take_stale() {
                allocation.reallocations.push(self.unbind(index));
                index
            } else if let Some(index) = self.take_evictable(request.tile) {
                allocation.reallocations.push(self.unbind(index));
                self.stats.evictions += 1;
                index
            } else {
                self.stats.deferred += (needed.len() - position) as u64;
                break;
            };

            let block = self.bind(index, *request);
            taken += 1;
            if request.is_packed() {
                allocation.packed_allocations.push(block);
            } else {
                allocation.allocations.push(block);
            }
        }

        self.stats.allocations += allocation.bound_count() as u64;
        self.stats.reallocations += allocation.reallocations.len() as u64;
        allocation
    }

    /// Run one full reconciliation: age, classify and allocate
    pub fn reconcile(&mut self, requests: &[GpuTileId], budget: usize) -> BlockAllocation {
        let needed = self.update_tile_states(requests);
        self.allocate_blocks(&needed, budget)
    }

    fn take_stale(&mut self) -> Option<u32> {
        let index = self
            .stale
            .iter()
            .copied()
            .max_by_key(|&index| (self.blocks[index as usize].idle_frames, Reverse(index)))?;
        self.stale.swap_remove(&index);
        Some(index)
    }

    fn take_evictable(&mut self, requested: TileId) -> Option<u32> {
        let index = self
            .in_use
            .iter()
            .copied()
            .filter(|&index| {
                let block = &self.blocks[index as usize];
                block.idle_frames > 0
                    && block.binding.is_some_and(|bound| {
                        !bound.is_packed() && bound.tile.mip_level() > requested.mip_level()
                    })
            })
            .max_by_key(|&index| {
                let block = &self.blocks[index as usize];
                let mip = block.binding.map_or(0, |b| b.tile.mip_level());
                (block.idle_frames, mip, Reverse(index))
            })?;
        self.in_use.swap_remove(&index);
        Some(index)
    }

    fn unbind(&mut self, index: u32) -> AllocatedBlock {
        let block = &mut self.blocks[index as usize];
        let previous = block.binding.take().unwrap_or(GpuTileId::new(
            TextureId::INVALID,
            TileId::INVALID,
        ));
        block.state = BlockState::Free;
        self.resident.remove(&previous);

        AllocatedBlock {
            texture: previous.texture,
            tile: previous.tile,
            heap_offset: index as u64 * self.block_size,
            tile_index: index,
        }
    }

    fn bind(&mut self, index: u32, tile: GpuTileId) -> AllocatedBlock {
        let block = &mut self.blocks[index as usize];
        block.binding = Some(tile);
        block.state = BlockState::InUse;
        block.idle_frames = 0;
        self.in_use.insert(index);
        self.resident.insert(tile, index);

        AllocatedBlock {
            texture: tile.texture,
            tile: tile.tile,
            heap_offset: index as u64 * self.block_size,
            tile_index: index,
        }
    }
}

impl std::fmt::Debug for BlockAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockAllocator")
            .field("block_count", &self.blocks.len())
            .field("block_size", &self.block_size)
            .field("partition", &self.partition())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLOCK: u64 = 64 * 1024;

    fn tile(texture: u32, x: u32, y: u32, mip: u32) -> GpuTileId {
        GpuTileId::new(TextureId(texture), TileId::new(x, y, mip))
    }

    #[test]
    fn test_new_allocator_is_all_free() {
        let allocator = BlockAllocator::new(8, BLOCK, 120);
        assert_eq!(allocator.partition(), BlockPartition { free: 8, stale: 0, in_use: 0 });
        assert!(allocator.check_partition());
    }

    #[test]
    fn test_allocation_uses_free_blocks_in_order() {
        let mut allocator = BlockAllocator::new(4, BLOCK, 120);
        let result = allocator.reconcile(&[tile(1, 0, 0, 0), tile(1, 1, 0, 0)], 128);

        assert_eq!(result.allocations.len(), 2);
        assert!(result.reallocations.is_empty());
        assert_eq!(result.allocations[0].tile_index, 0);
        assert_eq!(result.allocations[1].heap_offset, BLOCK);
        assert!(allocator.is_resident(&tile(1, 1, 0, 0)));
        assert!(allocator.check_partition());
    }

    #[test]
    fn test_resident_request_is_a_hit() {
        let mut allocator = BlockAllocator::new(4, BLOCK, 120);
        allocator.reconcile(&[tile(1, 0, 0, 0)], 128);
        let result = allocator.reconcile(&[tile(1, 0, 0, 0)], 128);

        assert!(result.is_empty());
        assert_eq!(allocator.stats().hits, 1);
        assert_eq!(allocator.lookup(&tile(1, 0, 0, 0)).map(|b| b.idle_frames), Some(0));
    }

    #[test]
    fn test_duplicate_requests_allocate_once() {
        let mut allocator = BlockAllocator::new(4, BLOCK, 120);
        let t = tile(3, 2, 2, 1);
        let result = allocator.reconcile(&[t, t, t], 128);

        assert_eq!(result.allocations.len(), 1);
        assert_eq!(allocator.partition().in_use, 1);
        assert_eq!(allocator.stats().misses, 1);

        allocator.reconcile(&[t, t], 128);
        assert_eq!(allocator.stats().hits, 1);
        assert_eq!(allocator.stats().misses, 1);
    }

    #[test]
    fn test_packed_requests_are_classified() {
        let mut allocator = BlockAllocator::new(4, BLOCK, 120);
        let packed = GpuTileId::new(TextureId(1), TileId::packed(6));
        let result = allocator.reconcile(&[packed, tile(1, 0, 0, 0)], 128);

        assert_eq!(result.allocations.len(), 1);
        assert_eq!(result.packed_allocations.len(), 1);
        assert_eq!(result.packed_allocations[0].tile, TileId::packed(6));
    }

    #[test]
    fn test_invalid_requests_are_ignored() {
        let mut allocator = BlockAllocator::new(2, BLOCK, 120);
        let invalid = GpuTileId::new(TextureId::INVALID, TileId::new(0, 0, 0));
        let result = allocator.reconcile(&[invalid], 128);

        assert!(result.is_empty());
        assert_eq!(allocator.partition().free, 2);
    }

    #[test]
    fn test_budget_caps_allocations() {
        let mut allocator = BlockAllocator::new(16, BLOCK, 120);
        let requests: Vec<_> = (0..10).map(|x| tile(1, x, 0, 0)).collect();
        let result = allocator.reconcile(&requests, 4);

        assert_eq!(result.allocations.len(), 4);
        assert_eq!(allocator.stats().deferred, 6);

        let result = allocator.reconcile(&requests, 4);
        assert_eq!(result.allocations.len(), 4);
    }

    #[test]
    fn test_blocks_demote_after_threshold() {
        let mut allocator = BlockAllocator::new(2, BLOCK, 3);
        allocator.reconcile(&[tile(1, 0, 0, 0)], 128);

        for _ in 0..3 {
            allocator.reconcile(&[], 128);
        }
        assert_eq!(allocator.partition().in_use, 1);

        allocator.reconcile(&[], 128);
        assert_eq!(allocator.partition().stale, 1);
        assert_eq!(allocator.lookup(&tile(1, 0, 0, 0)).map(|b| b.state), Some(BlockState::Stale));
    }

    #[test]
    fn test_stale_block_is_promoted_on_request() {
        let mut allocator = BlockAllocator::new(2, BLOCK, 1);
        allocator.reconcile(&[tile(1, 0, 0, 0)], 128);
        allocator.reconcile(&[], 128);
        allocator.reconcile(&[], 128);
        assert_eq!(allocator.partition().stale, 1);

        let result = allocator.reconcile(&[tile(1, 0, 0, 0)], 128);
        assert!(result.is_empty());
        assert_eq!(allocator.partition().in_use, 1);
        assert_eq!(allocator.partition().stale, 0);
        assert!(allocator.check_partition());
    }

    #[test]
    fn test_stale_reuse_reports_previous_binding() {
        let mut allocator = BlockAllocator::new(1, BLOCK, 1);
        let old = tile(1, 0, 0, 0);
        let new = tile(2, 5, 5, 0);
        allocator.reconcile(&[old], 128);
        allocator.reconcile(&[], 128);
        allocator.reconcile(&[], 128);

        let result = allocator.reconcile(&[new], 128);
        assert_eq!(result.reallocations.len(), 1);
        assert_eq!(result.reallocations[0].gpu_tile(), old);
        assert_eq!(result.allocations[0].gpu_tile(), new);
        assert_eq!(result.reallocations[0].heap_offset, result.allocations[0].heap_offset);
        assert!(!allocator.is_resident(&old));
        assert!(allocator.check_partition());
    }

    #[test]
    fn test_longest_idle_stale_block_is_reused_first() {
        let mut allocator = BlockAllocator::new(2, BLOCK, 0);
        allocator.reconcile(&[tile(1, 0, 0, 0)], 128);
        allocator.reconcile(&[tile(1, 1, 0, 0)], 128);
        allocator.reconcile(&[], 128);
        assert_eq!(allocator.partition().stale, 2);

        let result = allocator.reconcile(&[tile(2, 0, 0, 0)], 128);
        assert_eq!(result.reallocations[0].gpu_tile(), tile(1, 0, 0, 0));
    }

    #[test]
    fn test_priority_finer_mip_wins_eviction() {
        let mut allocator = BlockAllocator::new(1, BLOCK, 120);
        allocator.reconcile(&[tile(1, 0, 0, 3)], 128);

        let fine = tile(2, 0, 0, 0);
        let coarse = tile(2, 0, 0, 2);
        let result = allocator.reconcile(&[coarse, fine], 128);

        assert_eq!(result.allocations.len(), 1);
        assert_eq!(result.allocations[0].gpu_tile(), fine);
        assert_eq!(result.reallocations[0].gpu_tile(), tile(1, 0, 0, 3));
        assert!(!allocator.is_resident(&coarse));
    }

    #[test]
    fn test_never_evicts_finer_or_equal_tiles() {
        let mut allocator = BlockAllocator::new(1, BLOCK, 120);
        allocator.reconcile(&[tile(1, 0, 0, 1)], 128);

        let result = allocator.reconcile(&[tile(2, 0, 0, 1), tile(2, 0, 0, 2)], 128);
        assert!(result.is_empty());
        assert!(allocator.is_resident(&tile(1, 0, 0, 1)));
    }

    #[test]
    fn test_never_evicts_tiles_requested_this_update() {
        let mut allocator = BlockAllocator::new(1, BLOCK, 120);
        let coarse = tile(1, 0, 0, 4);
        allocator.reconcile(&[coarse], 128);

        let result = allocator.reconcile(&[coarse, tile(1, 0, 0, 0)], 128);
        assert!(result.is_empty());
        assert!(allocator.is_resident(&coarse));
    }

    #[test]
    fn test_exhausted_cache_degrades() {
        let mut allocator = BlockAllocator::new(1, BLOCK, 120);
        let requests: Vec<_> = (0..10).map(|x| tile(1, x, 0, 0)).collect();

        let result = allocator.reconcile(&requests, 128);
        assert_eq!(result.bound_count(), 1);

        let result = allocator.reconcile(&requests, 128);
        assert_eq!(result.bound_count(), 0);
        assert!(allocator.check_partition());
    }

    #[test]
    fn test_end_to_end_aging_scenario() {
        let mut allocator = BlockAllocator::new(4, BLOCK, 120);
        let (t1, t2, t3) = (tile(1, 0, 0, 0), tile(1, 1, 0, 0), tile(2, 0, 0, 0));

        let result = allocator.reconcile(&[t1, t2], 128);
        assert_eq!(result.allocations.len(), 2);
        assert!(result.reallocations.is_empty());
        assert_eq!(allocator.partition(), BlockPartition { free: 2, stale: 0, in_use: 2 });

        for _ in 0..120 {
            allocator.reconcile(&[], 128);
        }
        assert_eq!(allocator.partition().in_use, 2);

        let result = allocator.reconcile(&[t3], 128);
        assert_eq!(result.allocations.len(), 1);
        assert!(result.reallocations.is_empty());
        assert_eq!(result.allocations[0].gpu_tile(), t3);
        assert_eq!(allocator.partition(), BlockPartition { free: 1, stale: 2, in_use: 1 });
        assert!(allocator.check_partition());
    }

    #[test]
    #[should_panic]
    fn test_out_of_range_mip_is_a_contract_violation() {
        let mut allocator = BlockAllocator::new(1, BLOCK, 120);
        let bad = GpuTileId::new(TextureId(1), TileId::from_bits(20 << 24));
        allocator.allocate_blocks(&[bad], 128);
    }

    #[test]
    fn test_partition_holds_under_churn() {
        let mut allocator = BlockAllocator::new(8, BLOCK, 2);
        for frame in 0..50u32 {
            let requests: Vec<_> = (0..6)
                .map(|i| tile(frame % 5, (frame + i) % 7, i % 3, i % 4))
                .collect();
            allocator.reconcile(&requests, 3);
            assert!(allocator.check_partition());
            assert_eq!(allocator.partition().total(), 8);
        }
    }
}
