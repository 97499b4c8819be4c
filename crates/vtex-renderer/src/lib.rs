//! # vtex Renderer
//!
//! GPU side of the vtex virtual texture streaming system.
//!
//! ## Features
//! - Device abstraction for tiled resources, copy queues and readback
//! - Frame Graph for pass scheduling
//! - Texture feedback pass with GPU compaction of tile records
//! - Texture streaming engine driving allocation, upload and tile mapping
//! - Headless device for tools and tests

pub mod device;
pub mod feedback_pass;
pub mod frame_graph;
pub mod headless;
pub mod streaming;
pub mod submission;

pub use device::{
    CopyContext, Device, HeapHandle, ReadbackCallback, ReadbackHandle, ResourceStates,
    ResourceTransition, SyncPoint, TextureInfo, TileMapping, TileMappingState,
};
pub use feedback_pass::{Camera, FeedbackDraw, FeedbackPassDesc, FeedbackPassSummary, record_feedback_pass};
pub use frame_graph::{FrameGraph, PassCommand, QueueType, RenderPass, RenderResource};
pub use headless::{DeviceEvent, HeadlessDevice};
pub use streaming::{StreamingStats, TextureStreamingEngine, UpdateReport};
pub use submission::{SubmissionReport, post_updated_tiles};

use thiserror::Error;
use vtex_assets::AssetError;
use vtex_core::{CoreError, TextureId};
use vtex_platform::PlatformError;

/// Renderer errors
#[derive(Error, Debug)]
pub enum RendererError {
    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("Invalid frame graph: {0}")]
    InvalidGraph(String),

    #[error("Out of GPU memory")]
    OutOfMemory,
}

/// Result type for renderer operations
pub type RendererResult<T> = Result<T, RendererError>;

/// Texture streaming errors
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("Feedback readback buffer could not be mapped")]
    ReadbackUnavailable,

    #[error("Feedback readback is too small for its header")]
    MalformedReadback,

    #[error("A stream update is in flight")]
    UpdateInFlight,

    #[error("Unknown texture {0}")]
    UnknownTexture(TextureId),

    #[error("Configuration error: {0}")]
    Config(#[from] CoreError),

    #[error("Asset error: {0}")]
    Asset(#[from] AssetError),

    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),

    #[error("Renderer error: {0}")]
    Renderer(#[from] RendererError),
}

/// Result type for streaming operations
pub type StreamResult<T> = Result<T, StreamError>;
