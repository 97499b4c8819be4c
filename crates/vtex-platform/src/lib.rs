//! # vtex Platform
//!
//! Platform layer for the vtex streaming system.
//!
//! This crate provides:
//! - **Threading**: Worker thread pool and the exclusive in-flight slot
//! - **FileSystem**: Random-access file reads for asset stores
//! - **Timers**: Scoped and rolling timers for diagnostics

pub mod filesystem;
pub mod threading;
pub mod timer;

pub use filesystem::{FileHandle, FileMode};
pub use threading::{ExclusiveSlot, SlotLease, ThreadPool};
pub use timer::{RollingTimer, ScopedTimer};

use thiserror::Error;

/// Platform-specific errors
#[derive(Error, Debug)]
pub enum PlatformError {
    #[error("File I/O error: {0}")]
    FileIO(#[from] std::io::Error),

    #[error("Read of {len} bytes at offset {offset} exceeds file size {size}")]
    OutOfBounds { offset: u64, len: usize, size: u64 },

    #[error("Thread pool is shut down")]
    PoolShutdown,
}

/// Result type for platform operations
pub type PlatformResult<T> = Result<T, PlatformError>;

/// Logical CPU count, at least one
pub fn available_cores() -> usize {
    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(1)
}
