//! File System Abstraction
//!
//! File handles shared between the streaming worker and loader threads.

use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::{PlatformError, PlatformResult};

/// File open mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    /// Read only
    Read,
    /// Write only (creates or truncates)
    Write,
    /// Read and write
    ReadWrite,
}

/// File handle supporting positioned reads from any thread
pub struct FileHandle {
    path: PathBuf,
    file: Mutex<std::fs::File>,
    mode: FileMode,
    size: u64,
}

impl FileHandle {
    /// Open a file with the specified mode
    pub fn open(path: impl AsRef<Path>, mode: FileMode) -> PlatformResult<Self> {
        let path = path.as_ref().to_path_buf();

        let file = match mode {
            FileMode::Read => std::fs::File::open(&path)?,
            FileMode::Write => std::fs::File::create(&path)?,
            FileMode::ReadWrite => std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)?,
        };
        let size = file.metadata()?.len();

        Ok(Self {
            path,
            file: Mutex::new(file),
            mode,
            size,
        })
    }

    /// Get the file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get the file mode
    pub fn mode(&self) -> FileMode {
        self.mode
    }

    /// Get the file size
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Fill `buf` with the bytes starting at `offset`
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> PlatformResult<()> {
        let end = offset.saturating_add(buf.len() as u64);
        if end > self.size {
            return Err(PlatformError::OutOfBounds {
                offset,
                len: buf.len(),
                size: self.size,
            });
        }

        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)?;
        Ok(())
    }

    /// Read the entire file contents
    pub fn read_all(&self) -> PlatformResult<Vec<u8>> {
        let mut buffer = Vec::with_capacity(self.size as usize);
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(0))?;
        file.read_to_end(&mut buffer)?;
        Ok(buffer)
    }

    /// Write all of `data` at the current position
    pub fn write_all(&mut self, data: &[u8]) -> PlatformResult<()> {
        let file = self.file.get_mut();
        file.write_all(data)?;
        self.size = file.metadata()?.len();
        Ok(())
    }

    /// Flush the file buffer
    pub fn flush(&mut self) -> PlatformResult<()> {
        self.file.get_mut().flush()?;
        Ok(())
    }
}

impl std::fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileHandle")
            .field("path", &self.path)
            .field("mode", &self.mode)
            .field("size", &self.size)
            .finish()
    }
}
