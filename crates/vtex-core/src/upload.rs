//! Upload Memory
//!
//! Staging memory for tile uploads:
//! - `UploadHeap` trait implemented by copy contexts
//! - Linear allocator with per-reservation alignment, reset once per submission
//! - Usage statistics

use serde::{Deserialize, Serialize};

/// A reserved range of upload memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadReservation {
    /// Byte offset into the upload heap
    pub offset: usize,
    /// Size in bytes
    pub size: usize,
}

/// Upload memory statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadStats {
    /// Bytes currently reserved
    pub allocated: usize,
    /// Peak bytes reserved since creation
    pub peak: usize,
    /// Number of reservations since the last reset
    pub allocation_count: usize,
}

impl UploadStats {
    fn record_alloc(&mut self, new_offset: usize) {
        self.allocated = new_offset;
        self.peak = self.peak.max(new_offset);
        self.allocation_count += 1;
    }
}

/// Host memory that copy commands read from
pub trait UploadHeap {
    /// Reserve `size` bytes at the given power-of-two alignment
    fn reserve(&mut self, size: usize, alignment: usize) -> Option<UploadReservation>;

    /// Writable bytes of a reservation
    fn bytes_mut(&mut self, reservation: &UploadReservation) -> &mut [u8];

    /// Bytes of a reservation
    fn bytes(&self, reservation: &UploadReservation) -> &[u8];
}

/// Linear upload allocator
///
/// Reservations are bump-allocated from one buffer and released together by `reset`.
pub struct LinearUploadHeap {
    buffer: Vec<u8>,
    offset: usize,
    stats: UploadStats,
}

impl LinearUploadHeap {
    /// Create a new heap with the given capacity
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: vec![0; capacity],
            offset: 0,
            stats: UploadStats::default(),
        }
    }

    /// Release all reservations
    pub fn reset(&mut self) {
        self.offset = 0;
        self.stats.allocated = 0;
        self.stats.allocation_count = 0;
    }

    /// Get the current usage
    pub fn used(&self) -> usize {
        self.offset
    }

    /// Get the capacity
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Get remaining space
    pub fn remaining(&self) -> usize {
        self.capacity() - self.used()
    }

    /// Get usage statistics
    pub fn stats(&self) -> &UploadStats {
        &self.stats
    }
}

impl UploadHeap for LinearUploadHeap {
    fn reserve(&mut self, size: usize, alignment: usize) -> Option<UploadReservation> {
        let align = alignment.max(1);
        debug_assert!(align.is_power_of_two());

        let aligned_offset = (self.offset + align - 1) & !(align - 1);
        let new_offset = aligned_offset.checked_add(size)?;
        if new_offset > self.capacity() {
            return None;
        }

        self.offset = new_offset;
        self.stats.record_alloc(new_offset);
        Some(UploadReservation {
            offset: aligned_offset,
            size,
        })
    }

    fn bytes_mut(&mut self, reservation: &UploadReservation) -> &mut [u8] {
        &mut self.buffer[reservation.offset..reservation.offset + reservation.size]
    }

    fn bytes(&self, reservation: &UploadReservation) -> &[u8] {
        &self.buffer[reservation.offset..reservation.offset + reservation.size]
    }
}

impl std::fmt::Debug for LinearUploadHeap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinearUploadHeap")
            .field("capacity", &self.capacity())
            .field("used", &self.offset)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_aligns() {
        let mut heap = LinearUploadHeap::new(4096);
        let a = heap.reserve(10, 1).unwrap();
        let b = heap.reserve(16, 512).unwrap();

        assert_eq!(a.offset, 0);
        assert_eq!(b.offset, 512);
        assert_eq!(heap.used(), 528);
    }

    #[test]
    fn test_reserve_fails_when_full() {
        let mut heap = LinearUploadHeap::new(1024);
        assert!(heap.reserve(1000, 16).is_some());
        assert!(heap.reserve(100, 16).is_none());
        assert_eq!(heap.remaining(), 24);
    }

    #[test]
    fn test_reset_and_stats() {
        let mut heap = LinearUploadHeap::new(1024);
        heap.reserve(256, 256).unwrap();
        heap.reserve(256, 256).unwrap();
        assert_eq!(heap.stats().allocation_count, 2);

        heap.reset();
        assert_eq!(heap.used(), 0);
        assert_eq!(heap.stats().peak, 512);
        assert!(heap.reserve(1024, 1).is_some());
    }

    #[test]
    fn test_bytes_round_trip() {
        let mut heap = LinearUploadHeap::new(64);
        let res = heap.reserve(4, 4).unwrap();
        heap.bytes_mut(&res).copy_from_slice(&[1, 2, 3, 4]);
        assert_eq!(heap.bytes(&res), &[1, 2, 3, 4]);
    }
}
