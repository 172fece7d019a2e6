//! Byte layout of the parallel arrays that make up a container.
//!
//! A container is a header followed by arrays that are either slot indexed (length `capacity`) or
//! bucket indexed (length `bucket_capacity`), optionally followed by a value arena. Each container
//! describes this with a layout struct of [`Segment`]s built by a [`LayoutBuilder`]. The same
//! `compute` function is used when materializing, resizing and accessing a container, so the
//! offsets used to read the old layout and write the new one during a migration always agree.
use std::{
    mem::{align_of, size_of},
    ops::Range,
};

use bytemuck::Pod;
use dynbuf_util::pow2::{align_up, ceil_pow2};

use crate::{
    error::{Result, StorageError},
    host::{GrowableBuffer, BUFFER_ALIGN},
};

/// Alignment of the value arena, sufficient for every storable type.
pub const ARENA_ALIGN: usize = 16;

/// Sentinel used in `next` and `buckets` arrays for "no slot".
pub const NIL: i32 = -1;

/// Largest supported slot capacity.
///
/// Slot indices are stored as `i32` and bucket capacities are twice the slot capacity, so both
/// must stay representable.
pub const MAX_CAPACITY: usize = 1 << 29;

/// A byte range within the host buffer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Segment {
    /// Offset of the first byte.
    pub offset: usize,
    /// Length in bytes.
    pub len: usize,
}

impl Segment {
    /// Returns the offset one past the last byte.
    pub fn end(&self) -> usize {
        self.offset + self.len
    }

    /// Returns the byte range covered by this segment.
    pub fn range(&self) -> Range<usize> {
        self.offset..self.end()
    }
}

/// Places segments one after another, aligning each to the requirement of its element type.
#[derive(Debug, Default)]
pub struct LayoutBuilder {
    cursor: usize,
}

impl LayoutBuilder {
    /// Starts a layout at offset zero.
    pub fn new() -> Self {
        Self::default()
    }

    fn place(&mut self, len: usize, align: usize) -> Result<Segment> {
        let offset = align_up(self.cursor, align).ok_or(StorageError::overflow("layout size"))?;
        let end = offset
            .checked_add(len)
            .ok_or(StorageError::overflow("layout size"))?;
        self.cursor = end;
        Ok(Segment { offset, len })
    }

    /// Places an array of `count` elements of type `T`.
    pub fn array<T: Pod>(&mut self, count: usize) -> Result<Segment> {
        self.array_of(count, size_of::<T>(), align_of::<T>())
    }

    /// Places an array of `count` elements of `size` bytes each, aligned to `align`.
    pub fn array_of(&mut self, count: usize, size: usize, align: usize) -> Result<Segment> {
        assert!(
            align <= BUFFER_ALIGN,
            "element alignment {align} exceeds buffer alignment {BUFFER_ALIGN}"
        );
        let len = count
            .checked_mul(size)
            .ok_or(StorageError::overflow("array size"))?;
        self.place(len, align)
    }

    /// Places a value arena of `len` bytes.
    pub fn arena(&mut self, len: usize) -> Result<Segment> {
        self.place(len, ARENA_ALIGN)
    }

    /// Returns the total number of bytes used by the layout.
    pub fn finish(self) -> usize {
        self.cursor
    }
}

/// Returns the number of hash buckets used for a slot capacity.
pub fn bucket_capacity_for(capacity: usize) -> Result<usize> {
    capacity
        .checked_mul(2)
        .and_then(ceil_pow2)
        .ok_or(StorageError::overflow("bucket capacity"))
}

fn min_growth(log2_min_growth: u32) -> Result<usize> {
    1usize
        .checked_shl(log2_min_growth)
        .ok_or(StorageError::overflow("minimal growth"))
}

/// Returns the power-of-two capacity to use when at least `count` and `capacity` slots are needed.
///
/// The result is never below the minimal growth step `1 << log2_min_growth`.
pub fn grown_capacity(count: usize, capacity: usize, log2_min_growth: u32) -> Result<usize> {
    let min_growth = min_growth(log2_min_growth)?;
    let capacity = ceil_pow2(count.max(capacity).max(min_growth))
        .ok_or(StorageError::overflow("slot capacity"))?;
    if capacity > MAX_CAPACITY {
        return Err(StorageError::overflow("slot capacity"));
    }
    Ok(capacity)
}

/// Returns the capacity to grow to when a container with `count` entries and `capacity` slots runs
/// out of slots.
pub fn next_capacity(count: usize, capacity: usize, log2_min_growth: u32) -> Result<usize> {
    let grown = capacity
        .checked_add(min_growth(log2_min_growth)?)
        .ok_or(StorageError::overflow("slot capacity"))?;
    grown_capacity(count, grown, log2_min_growth)
}

/// Returns the arena capacity to grow to so that at least `required` units fit.
///
/// Grows in steps of the minimal growth, rounding to a power of two after each step.
pub fn grown_data_capacity(current: usize, required: usize, log2_min_growth: u32) -> Result<usize> {
    let mut capacity = current;
    while capacity < required {
        let stepped = capacity
            .checked_add(min_growth(log2_min_growth)?)
            .ok_or(StorageError::overflow("arena capacity"))?;
        capacity = grown_capacity(0, stepped, log2_min_growth)
            .map_err(|_| StorageError::overflow("arena capacity"))?;
    }
    Ok(capacity)
}

/// Converts a size or count into the `u32` used in headers.
pub fn to_u32(value: usize, what: &'static str) -> Result<u32> {
    u32::try_from(value).map_err(|_| StorageError::overflow(what))
}

/// Reads a header of type `H` from the start of `bytes`.
///
/// Panics if `bytes` is too short to hold a header.
pub fn header<H: Pod>(bytes: &[u8]) -> &H {
    bytemuck::from_bytes(&bytes[..size_of::<H>()])
}

/// Returns a typed view of a segment.
pub fn view<T: Pod>(bytes: &[u8], segment: Segment) -> &[T] {
    bytemuck::cast_slice(&bytes[segment.range()])
}

/// Splits a byte slice into disjoint mutable segments, taken in order of increasing offset.
#[derive(Debug)]
pub struct Carver<'a> {
    rest: &'a mut [u8],
    pos: usize,
}

impl<'a> Carver<'a> {
    /// Starts carving `bytes` from offset zero.
    pub fn new(bytes: &'a mut [u8]) -> Self {
        Self { rest: bytes, pos: 0 }
    }

    /// Returns the bytes of `segment`, skipping everything before it.
    ///
    /// Panics if `segment` starts before the end of the previously taken one.
    pub fn take(&mut self, segment: Segment) -> &'a mut [u8] {
        assert!(segment.offset >= self.pos, "overlapping segments");
        let rest = std::mem::take(&mut self.rest);
        let (_, rest) = rest.split_at_mut(segment.offset - self.pos);
        let (this, rest) = rest.split_at_mut(segment.len);
        self.rest = rest;
        self.pos = segment.end();
        this
    }
}

/// Splits `bytes` into disjoint mutable slices, one per segment.
///
/// Segments must be sorted by offset and must not overlap.
pub fn carve_mut<const N: usize>(bytes: &mut [u8], segments: [Segment; N]) -> [&mut [u8]; N] {
    let mut carver = Carver::new(bytes);
    segments.map(|segment| carver.take(segment))
}

/// Resizes the host buffer and moves the contents of segments from an old to a new layout.
///
/// Each pair is `(old, new)`. The old contents are copied to the start of the new segment, which
/// must be at least as long. Bytes of new segments beyond the copied prefix are unspecified. When
/// the host fails to resize, the buffer is left as it was.
pub fn relocate<B: GrowableBuffer + ?Sized>(
    buffer: &mut B,
    moves: &[(Segment, Segment)],
    new_len: usize,
) -> Result<()> {
    let saved: Vec<Vec<u8>> = moves
        .iter()
        .map(|(old, _)| buffer.bytes()[old.range()].to_vec())
        .collect();

    buffer.resize_uninitialized(new_len)?;

    let bytes = buffer.bytes_mut();
    for ((_, new), saved) in moves.iter().zip(saved) {
        assert!(saved.len() <= new.len);
        bytes[new.offset..new.offset + saved.len()].copy_from_slice(&saved);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arrays_are_aligned_and_disjoint() {
        let mut builder = LayoutBuilder::new();
        let header = builder.array::<[u32; 3]>(1).unwrap();
        let shorts = builder.array::<u16>(3).unwrap();
        let longs = builder.array::<u64>(2).unwrap();
        let arena = builder.arena(5).unwrap();
        let total = builder.finish();

        assert_eq!(header, Segment { offset: 0, len: 12 });
        assert_eq!(shorts, Segment { offset: 12, len: 6 });
        assert_eq!(longs, Segment { offset: 24, len: 16 });
        assert_eq!(arena, Segment { offset: 48, len: 5 });
        assert_eq!(total, 53);
    }

    #[test]
    fn growth_policy() {
        assert_eq!(grown_capacity(0, 0, 8).unwrap(), 256);
        assert_eq!(grown_capacity(300, 0, 8).unwrap(), 512);
        assert_eq!(grown_capacity(0, 3, 0).unwrap(), 4);
        assert_eq!(next_capacity(256, 256, 8).unwrap(), 512);
        assert_eq!(next_capacity(4, 4, 2).unwrap(), 8);
        assert_eq!(bucket_capacity_for(256).unwrap(), 512);
        assert_eq!(bucket_capacity_for(3).unwrap(), 8);
        assert!(grown_capacity(MAX_CAPACITY + 1, 0, 0).is_err());
    }

    #[test]
    fn data_growth_steps_until_requirement() {
        assert_eq!(grown_data_capacity(0, 1, 4).unwrap(), 16);
        assert_eq!(grown_data_capacity(16, 16, 4).unwrap(), 16);
        assert_eq!(grown_data_capacity(16, 40, 4).unwrap(), 64);
        assert_eq!(grown_data_capacity(0, 0, 4).unwrap(), 0);
    }

    #[test]
    fn carve_skips_gaps() {
        let mut bytes = [0u8; 16];
        let [a, b] = carve_mut(
            &mut bytes,
            [
                Segment { offset: 2, len: 3 },
                Segment { offset: 8, len: 4 },
            ],
        );
        a.fill(1);
        b.fill(2);
        assert_eq!(bytes, [0, 0, 1, 1, 1, 0, 0, 0, 2, 2, 2, 2, 0, 0, 0, 0]);
    }

    #[test]
    fn untyped_arrays_use_given_alignment() {
        let mut builder = LayoutBuilder::new();
        builder.array::<u8>(3).unwrap();
        assert_eq!(
            builder.array_of(2, 6, 2).unwrap(),
            Segment { offset: 4, len: 12 }
        );
        assert_eq!(builder.finish(), 16);
    }

    #[test]
    #[should_panic(expected = "overlapping segments")]
    fn carve_rejects_overlap() {
        let mut bytes = [0u8; 16];
        carve_mut(
            &mut bytes,
            [
                Segment { offset: 0, len: 8 },
                Segment { offset: 4, len: 4 },
            ],
        );
    }
}
