//! The growable byte buffer that every container lives in.
//!
//! Containers never allocate memory themselves. They ask the host buffer to resize to an exact
//! byte length computed by the [layout](crate::layout) code and then reinterpret the bytes. The
//! host may move the storage on every resize, so containers re-derive all views from
//! [`GrowableBuffer::bytes`] or [`GrowableBuffer::bytes_mut`] on every access.
use bytemuck::{Pod, Zeroable};
use core::fmt;

use crate::error::{Result, StorageError};

/// Alignment guaranteed for the start of a host buffer's bytes.
pub const BUFFER_ALIGN: usize = 16;

/// A contiguous, byte addressable block whose length can change.
///
/// Implementations must return slices whose start is aligned to [`BUFFER_ALIGN`] and whose length
/// equals [`len`][Self::len]. The contents of bytes added by a resize are unspecified, while bytes
/// below the old length must be preserved.
pub trait GrowableBuffer {
    /// Returns the current length in bytes.
    fn len(&self) -> usize;

    /// Returns `true` when the buffer holds no bytes.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resizes the buffer to exactly `new_len` bytes, possibly moving it.
    fn resize_uninitialized(&mut self, new_len: usize) -> Result<()>;

    /// Returns the buffer contents.
    fn bytes(&self) -> &[u8];

    /// Returns the buffer contents for modification.
    fn bytes_mut(&mut self) -> &mut [u8];
}

#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C, align(16))]
struct Block([u8; BUFFER_ALIGN]);

/// A heap allocated [`GrowableBuffer`].
///
/// Growth reserves memory fallibly, so running out of memory is reported as
/// [`StorageError::AllocationFailed`]. An optional byte limit makes the same failure reproducible.
#[derive(Clone, Default)]
pub struct AlignedBuffer {
    blocks: Vec<Block>,
    len: usize,
    limit: Option<usize>,
}

impl fmt::Debug for AlignedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlignedBuffer")
            .field("len", &self.len)
            .field("reserved", &(self.blocks.capacity() * BUFFER_ALIGN))
            .field("limit", &self.limit)
            .finish()
    }
}

impl AlignedBuffer {
    /// Returns an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns an empty buffer that refuses to grow beyond `limit` bytes.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }
}

impl GrowableBuffer for AlignedBuffer {
    fn len(&self) -> usize {
        self.len
    }

    fn resize_uninitialized(&mut self, new_len: usize) -> Result<()> {
        if self.limit.is_some_and(|limit| new_len > limit) {
            return Err(StorageError::AllocationFailed { requested: new_len });
        }

        if new_len == 0 {
            self.blocks = Vec::new();
            self.len = 0;
            return Ok(());
        }

        let blocks = new_len.div_ceil(BUFFER_ALIGN);
        if let Some(additional) = blocks.checked_sub(self.blocks.len()) {
            self.blocks
                .try_reserve_exact(additional)
                .map_err(|_| StorageError::AllocationFailed { requested: new_len })?;
        }
        self.blocks.resize(blocks, Block::zeroed());
        self.len = new_len;
        Ok(())
    }

    fn bytes(&self) -> &[u8] {
        &bytemuck::cast_slice::<Block, u8>(&self.blocks)[..self.len]
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        &mut bytemuck::cast_slice_mut::<Block, u8>(&mut self.blocks)[..self.len]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resize_preserves_prefix() {
        let mut buf = AlignedBuffer::new();
        assert!(buf.is_empty());
        buf.resize_uninitialized(5).unwrap();
        buf.bytes_mut().copy_from_slice(&[1, 2, 3, 4, 5]);
        buf.resize_uninitialized(1000).unwrap();
        assert_eq!(buf.len(), 1000);
        assert_eq!(&buf.bytes()[..5], &[1, 2, 3, 4, 5]);
        assert_eq!(buf.bytes().as_ptr() as usize % BUFFER_ALIGN, 0);
        buf.resize_uninitialized(3).unwrap();
        assert_eq!(buf.bytes(), &[1, 2, 3]);
    }

    #[test]
    fn limit_reports_allocation_failure() {
        let mut buf = AlignedBuffer::with_limit(64);
        buf.resize_uninitialized(64).unwrap();
        assert_eq!(
            buf.resize_uninitialized(65),
            Err(StorageError::AllocationFailed { requested: 65 })
        );
        assert_eq!(buf.len(), 64);
    }

    #[test]
    fn resize_to_zero_releases_storage() {
        let mut buf = AlignedBuffer::new();
        buf.resize_uninitialized(4096).unwrap();
        buf.resize_uninitialized(0).unwrap();
        assert!(buf.is_empty());
        assert!(buf.bytes().is_empty());
    }
}
