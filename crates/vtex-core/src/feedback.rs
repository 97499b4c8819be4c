//! Feedback Decoding
//!
//! CPU side of the tile feedback loop:
//! - Readback buffer layout (64-byte header followed by tile records)
//! - Reference implementation of the GPU compaction passes
//! - Sort/dedup and mip fallback expansion of decoded requests

use bytemuck::{Pod, Zeroable};
use log::warn;
use rayon::prelude::*;

use crate::tile::{GpuTileId, MAX_MIP_LEVELS, TextureId, TextureLayout, TileId};

/// Byte size of the readback header
pub const FEEDBACK_HEADER_SIZE: usize = 64;

/// Byte size of one request record
pub const FEEDBACK_ENTRY_SIZE: usize = std::mem::size_of::<GpuTileId>();

/// Records deduplicated together by one compression dispatch group
pub const COMPACTION_GROUP_SIZE: usize = 1024;

/// Header at the start of the feedback readback buffer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct FeedbackHeader {
    /// Number of records following the header
    pub request_count: u32,
    /// Padding
    pub padding: u32,
    /// GPU timestamp before the feedback draws
    pub timestamp_begin: u64,
    /// GPU timestamp after the compaction passes
    pub timestamp_end: u64,
    /// Reserved up to the 64-byte record alignment
    pub reserved: [u64; 5],
}

impl FeedbackHeader {
    /// Create a header for `request_count` records
    pub fn new(request_count: u32, timestamp_begin: u64, timestamp_end: u64) -> Self {
        Self {
            request_count,
            timestamp_begin,
            timestamp_end,
            ..Self::default()
        }
    }

    /// GPU time between the two timestamps in milliseconds
    pub fn gpu_time_ms(&self, timestamp_frequency: u64) -> f64 {
        if timestamp_frequency == 0 {
            return 0.0;
        }

        let ticks = self.timestamp_end.saturating_sub(self.timestamp_begin);
        ticks as f64 * 1000.0 / timestamp_frequency as f64
    }
}

/// Decoded contents of a feedback readback
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedbackReadback {
    /// Header as written by the GPU
    pub header: FeedbackHeader,
    /// Request records, capped
    pub requests: Vec<GpuTileId>,
}

/// Number of records a readback buffer of `buffer_size` bytes can carry
pub fn readback_capacity(buffer_size: usize) -> usize {
    buffer_size.saturating_sub(FEEDBACK_HEADER_SIZE) / FEEDBACK_ENTRY_SIZE
}

/// Decode a readback buffer, copying at most `max_requests` records out of it
///
/// Returns `None` when the buffer cannot hold a header.
pub fn decode_feedback(bytes: &[u8], max_requests: usize) -> Option<FeedbackReadback> {
    if bytes.len() < FEEDBACK_HEADER_SIZE {
        return None;
    }

    let header: FeedbackHeader = bytemuck::pod_read_unaligned(&bytes[..FEEDBACK_HEADER_SIZE]);
    let count = (header.request_count as usize)
        .min(max_requests)
        .min(readback_capacity(bytes.len()));
    let body = &bytes[FEEDBACK_HEADER_SIZE..FEEDBACK_HEADER_SIZE + count * FEEDBACK_ENTRY_SIZE];

    Some(FeedbackReadback {
        header,
        requests: body
            .chunks_exact(FEEDBACK_ENTRY_SIZE)
            .map(bytemuck::pod_read_unaligned)
            .collect(),
    })
}

/// Write a header and as many records as fit into `out`, returning the record count written
pub fn encode_feedback(header: &FeedbackHeader, requests: &[GpuTileId], out: &mut [u8]) -> usize {
    if out.len() < FEEDBACK_HEADER_SIZE {
        return 0;
    }

    let count = requests.len().min(readback_capacity(out.len()));
    let header = FeedbackHeader {
        request_count: count as u32,
        ..*header
    };
    out[..FEEDBACK_HEADER_SIZE].copy_from_slice(bytemuck::bytes_of(&header));

    let body: &[u8] = bytemuck::cast_slice(&requests[..count]);
    out[FEEDBACK_HEADER_SIZE..FEEDBACK_HEADER_SIZE + body.len()].copy_from_slice(body);
    count
}

/// Exclusive prefix sum of group sizes
pub fn exclusive_prefix_sum(sizes: &[u32]) -> Vec<u32> {
    sizes
        .iter()
        .scan(0u32, |sum, &size| {
            let offset = *sum;
            *sum += size;
            Some(offset)
        })
        .collect()
}

/// Compress pass: sort and deduplicate each group of raw records on its own
///
/// Invalid records are discarded.
pub fn compress_groups(raw: &[GpuTileId]) -> Vec<Vec<GpuTileId>> {
    raw.par_chunks(COMPACTION_GROUP_SIZE)
        .map(|chunk| {
            let mut group: Vec<GpuTileId> =
                chunk.iter().copied().filter(GpuTileId::is_valid).collect();
            group.sort_unstable();
            group.dedup();
            group
        })
        .collect()
}

/// Block-size pass: record count of each compressed group
pub fn group_sizes(groups: &[Vec<GpuTileId>]) -> Vec<u32> {
    groups.iter().map(|g| g.len() as u32).collect()
}

/// Merge pass: scatter groups to their prefix-summed offsets, truncated to `max_records`
pub fn merge_groups(groups: &[Vec<GpuTileId>], offsets: &[u32], max_records: usize) -> Vec<GpuTileId> {
    let total = groups
        .iter()
        .zip(offsets)
        .map(|(group, &offset)| offset as usize + group.len())
        .max()
        .unwrap_or(0);

    let mut merged = vec![GpuTileId::zeroed(); total];
    for (group, &offset) in groups.iter().zip(offsets) {
        let offset = offset as usize;
        merged[offset..offset + group.len()].copy_from_slice(group);
    }

    merged.truncate(max_records);
    merged
}

/// CPU rendition of the compress / prefix-sum / merge compute passes
///
/// Duplicates that straddle groups survive, as they do on the GPU.
pub fn compact_feedback(raw: &[GpuTileId], max_records: usize) -> Vec<GpuTileId> {
    let groups = compress_groups(raw);
    let offsets = exclusive_prefix_sum(&group_sizes(&groups));
    merge_groups(&groups, &offsets, max_records)
}

/// Sort requests by sorting key and remove exact duplicates
pub fn sort_and_dedup(requests: &mut Vec<GpuTileId>) {
    requests.par_sort_unstable();
    requests.dedup();
}

/// Tally of one mip fallback expansion
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExpansionStats {
    /// Records received
    pub input: usize,
    /// Records dropped for an unknown texture or an out-of-grid tile
    pub dropped: usize,
    /// Records after expansion and dedup
    pub output: usize,
}

/// Add each request's ancestor chain and its texture's packed tail request
///
/// For a tiled request at mip `m`, the parents at `m + 1`, `m + 2`, ... are added while they are
/// still individually tiled, followed by one packed request at the tail's first level. Requests
/// whose level already lies in the tail become packed requests. The output is sorted and
/// deduplicated.
pub fn expand_mip_fallback<F>(requests: &[GpuTileId], layout_of: F) -> (Vec<GpuTileId>, ExpansionStats)
where
    F: Fn(TextureId) -> Option<TextureLayout>,
{
    let mut expanded = Vec::with_capacity(requests.len() * 4);
    let mut stats = ExpansionStats {
        input: requests.len(),
        ..Default::default()
    };
    let mut cached: Option<(TextureId, Option<TextureLayout>)> = None;

    for request in requests {
        if !request.is_valid() {
            stats.dropped += 1;
            continue;
        }

        let layout = match cached {
            Some((texture, layout)) if texture == request.texture => layout,
            _ => {
                let layout = layout_of(request.texture);
                cached = Some((request.texture, layout));
                layout
            }
        };
        let Some(layout) = layout else {
            stats.dropped += 1;
            continue;
        };

        let packed_info = layout.packed_info();
        let packed_start = packed_info.starting_level;
        // Mip chains that end above the tail threshold have no packed slot
        let packed = (packed_info.level_count() > 0).then(|| {
            GpuTileId::new(request.texture, TileId::packed(packed_start.min(MAX_MIP_LEVELS - 1)))
        });
        let tile = request.tile;

        if tile.is_packed() || tile.mip_level() >= packed_start {
            match packed {
                Some(packed) => expanded.push(packed),
                None => stats.dropped += 1,
            }
            continue;
        }
        if !layout.contains(tile) {
            stats.dropped += 1;
            continue;
        }

        expanded.push(*request);
        let mut current = tile;
        while current.mip_level() + 1 < packed_start {
            current = current.parent();
            expanded.push(GpuTileId::new(request.texture, current));
        }
        expanded.extend(packed);
    }

    sort_and_dedup(&mut expanded);
    stats.output = expanded.len();
    if stats.dropped > 0 {
        warn!("Dropped {} malformed feedback records", stats.dropped);
    }

    (expanded, stats)
}
