//! Texture Feedback Pass
//!
//! Records the GPU work that produces one frame of tile feedback:
//! - Clears the low resolution feedback target and the record buffer
//! - Draws static and animated geometry, writing one record per sampled tile
//! - Compacts the records with per-group dedup, a prefix sum of group sizes and a merge
//! - Copies header, timestamps and compacted records into the readback buffer

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, UVec2, Vec3};
use log::warn;
use smallvec::SmallVec;
use vtex_core::feedback::COMPACTION_GROUP_SIZE;
use vtex_core::{TextureId, UploadHeap, UploadReservation};

use crate::device::ReadbackHandle;
use crate::frame_graph::{ComputeKernel, DrawCommand, FrameGraph, PassCommand, QueueType};

/// Field of view widening of the feedback camera
pub const FEEDBACK_FOV_SCALE: f32 = 1.2;

/// Alignment of per-draw constants in upload memory
pub const CONSTANTS_ALIGNMENT: usize = 256;

/// Alignment of skinned vertex data in upload memory
pub const VERTEX_ALIGNMENT: usize = 16;

/// Camera the feedback pass renders from
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Camera {
    /// World to view transform
    pub view: Mat4,
    /// Vertical field of view in radians
    pub fov_y: f32,
    /// Width over height
    pub aspect: f32,
    /// Near plane distance
    pub near: f32,
    /// Far plane distance
    pub far: f32,
    /// World space position
    pub position: Vec3,
}

impl Camera {
    /// Camera at `position` looking at `target`
    pub fn look_at(position: Vec3, target: Vec3, fov_y: f32, aspect: f32) -> Self {
        Self {
            view: Mat4::look_at_rh(position, target, Vec3::Y),
            fov_y,
            aspect,
            near: 0.1,
            far: 1000.0,
            position,
        }
    }

    /// Projection with the widened feedback field of view
    pub fn feedback_projection(&self) -> Mat4 {
        let fov = (self.fov_y * FEEDBACK_FOV_SCALE).min(std::f32::consts::PI * 0.95);
        Mat4::perspective_rh(fov, self.aspect, self.near, self.far)
    }

    /// View projection used by the feedback draws
    pub fn feedback_view_projection(&self) -> Mat4 {
        self.feedback_projection() * self.view
    }
}

impl Default for Camera {
    fn default() -> Self {
        Self::look_at(Vec3::new(0.0, 0.0, 5.0), Vec3::ZERO, 60f32.to_radians(), 16.0 / 9.0)
    }
}

/// Mip bias that makes the small feedback target pick the levels the full target samples
pub fn feedback_mip_bias(feedback_width: u32, render_width: u32) -> f32 {
    if feedback_width == 0 || render_width == 0 {
        return 0.0;
    }
    (feedback_width as f32 / render_width as f32).log2()
}

/// Constants of one feedback draw
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct FeedbackConstants {
    /// Feedback view projection, column major
    pub view_projection: [[f32; 4]; 4],
    /// Camera position
    pub camera_position: [f32; 3],
    /// Sampling mip bias
    pub mip_bias: f32,
    /// Feedback target size in texels
    pub target_size: [u32; 2],
    /// Draw identifier
    pub draw_id: u32,
    /// Record buffer capacity
    pub max_records: u32,
}

/// Geometry submitted to the feedback pass
#[derive(Debug, Clone, PartialEq)]
pub struct FeedbackDraw {
    /// Caller-side draw identifier
    pub draw_id: u32,
    /// Streamed textures the material samples
    pub textures: SmallVec<[TextureId; 4]>,
    /// Byte size of skinned vertex data, zero for static geometry
    pub skinned_vertex_bytes: usize,
}

impl FeedbackDraw {
    /// Static draw sampling `textures`
    pub fn new(draw_id: u32, textures: impl IntoIterator<Item = TextureId>) -> Self {
        Self {
            draw_id,
            textures: textures.into_iter().collect(),
            skinned_vertex_bytes: 0,
        }
    }

    /// Mark the draw as animated with `bytes` of skinned vertices
    pub fn with_skinning(mut self, bytes: usize) -> Self {
        self.skinned_vertex_bytes = bytes;
        self
    }

    /// Whether the draw needs skinned vertices
    pub fn is_animated(&self) -> bool {
        self.skinned_vertex_bytes > 0
    }
}

/// Inputs of one feedback pass
#[derive(Debug, Clone, Copy)]
pub struct FeedbackPassDesc<'a> {
    /// Camera of the frame
    pub camera: &'a Camera,
    /// Size of the frame's real render target
    pub render_target_size: UVec2,
    /// Size of the feedback depth target
    pub feedback_target_size: UVec2,
    /// Draws of the frame
    pub draws: &'a [FeedbackDraw],
    /// Readback buffer receiving the compacted records
    pub readback: ReadbackHandle,
    /// Maximum records copied to the readback buffer
    pub max_records: u32,
}

/// What a recorded feedback pass contains
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeedbackPassSummary {
    /// Static draws recorded
    pub static_draws: usize,
    /// Animated draws recorded
    pub animated_draws: usize,
    /// Draws skipped because upload memory ran out
    pub skipped_draws: usize,
    /// Dispatch groups of the compaction kernels
    pub compaction_groups: u32,
}

fn write_constants(heap: &mut dyn UploadHeap, constants: &FeedbackConstants) -> Option<UploadReservation> {
    let bytes = bytemuck::bytes_of(constants);
    let reservation = heap.reserve(bytes.len(), CONSTANTS_ALIGNMENT)?;
    heap.bytes_mut(&reservation).copy_from_slice(bytes);
    Some(reservation)
}

/// Record the feedback passes of one frame into `graph`
pub fn record_feedback_pass(
    graph: &mut FrameGraph,
    desc: &FeedbackPassDesc<'_>,
    constants_heap: &mut dyn UploadHeap,
    vertex_heap: &mut dyn UploadHeap,
) -> FeedbackPassSummary {
    let target = desc.feedback_target_size;
    let view_projection = desc.camera.feedback_view_projection();
    let mip_bias = feedback_mip_bias(target.x, desc.render_target_size.x);

    let depth = graph.create_depth_target("Feedback Depth", target.x, target.y);
    let records = graph.create_buffer("Feedback Records");
    let group_buffer = graph.create_buffer("Feedback Groups");
    let offsets = graph.create_buffer("Feedback Group Offsets");
    let compacted = graph.create_buffer("Feedback Compacted");
    let readback = graph.import_readback("Feedback Readback", desc.readback);

    graph
        .add_pass("Feedback Clear")
        .write(depth)
        .write(records)
        .command(PassCommand::ClearFeedback {
            max_records: desc.max_records,
        })
        .command(PassCommand::BeginTimestamp)
        .build();

    let mut summary = FeedbackPassSummary::default();
    let mut static_draws = Vec::new();
    let mut animated_draws = Vec::new();

    for draw in desc.draws {
        if draw.textures.is_empty() {
            continue;
        }

        let constants = FeedbackConstants {
            view_projection: view_projection.to_cols_array_2d(),
            camera_position: desc.camera.position.to_array(),
            mip_bias,
            target_size: target.to_array(),
            draw_id: draw.draw_id,
            max_records: desc.max_records,
        };
        let Some(constants) = write_constants(constants_heap, &constants) else {
            summary.skipped_draws += 1;
            continue;
        };

        let vertices = if draw.is_animated() {
            match vertex_heap.reserve(draw.skinned_vertex_bytes, VERTEX_ALIGNMENT) {
                Some(reservation) => Some(reservation),
                None => {
                    summary.skipped_draws += 1;
                    continue;
                }
            }
        } else {
            None
        };

        let command = PassCommand::Draw(DrawCommand {
            draw_id: draw.draw_id,
            textures: draw.textures.clone(),
            constants,
            vertices,
        });
        if vertices.is_some() {
            animated_draws.push(command);
        } else {
            static_draws.push(command);
        }
    }

    if summary.skipped_draws > 0 {
        warn!("Feedback pass skipped {} draws, upload memory exhausted", summary.skipped_draws);
    }
    summary.static_draws = static_draws.len();
    summary.animated_draws = animated_draws.len();

    graph
        .add_pass("Feedback Static Draws")
        .read(depth)
        .write(depth)
        .write(records)
        .commands(static_draws)
        .build();

    graph
        .add_pass("Feedback Animated Draws")
        .read(depth)
        .write(depth)
        .write(records)
        .commands(animated_draws)
        .build();

    let groups = (desc.max_records as usize).div_ceil(COMPACTION_GROUP_SIZE).max(1) as u32;
    summary.compaction_groups = groups;

    graph
        .add_pass("Feedback Compress")
        .read(records)
        .write(group_buffer)
        .on_queue(QueueType::Compute)
        .command(PassCommand::Dispatch {
            kernel: ComputeKernel::CompressFeedback,
            groups: [groups, 1, 1],
        })
        .build();

    graph
        .add_pass("Feedback Prefix Sum")
        .read(group_buffer)
        .write(offsets)
        .on_queue(QueueType::Compute)
        .command(PassCommand::Dispatch {
            kernel: ComputeKernel::SetBlockSizes,
            groups: [groups, 1, 1],
        })
        .command(PassCommand::Dispatch {
            kernel: ComputeKernel::PrefixSumBlocks,
            groups: [1, 1, 1],
        })
        .build();

    graph
        .add_pass("Feedback Merge")
        .read(group_buffer)
        .read(offsets)
        .write(compacted)
        .on_queue(QueueType::Compute)
        .command(PassCommand::Dispatch {
            kernel: ComputeKernel::MergeBlocks,
            groups: [groups, 1, 1],
        })
        .build();

    graph
        .add_pass("Feedback Readback")
        .read(compacted)
        .write(readback)
        .command(PassCommand::EndTimestamp)
        .command(PassCommand::CopyToReadback {
            readback: desc.readback,
            max_records: desc.max_records,
        })
        .command(PassCommand::QueueReadback {
            readback: desc.readback,
        })
        .build();

    summary
}
