//! Storage for type-erased values of varying size.
//!
//! Every slot owns one 4-byte word. Values that fit into a word are stored inline. Larger values
//! are stored in a trailing arena and the slot's word holds their offset into the arena, counted
//! in words. The arena is a bump allocator: space is only reclaimed by clearing the container.
use std::mem::size_of;

use bytemuck::Pod;
use dynbuf_util::pow2::align_up;

use crate::layout::ARENA_ALIGN;

/// Size in bytes of a slot's value word and the arena's allocation unit.
pub const WORD: usize = 4;

/// Returns `true` if a value of `size` bytes must be stored in the arena.
#[inline]
pub fn is_large(size: usize) -> bool {
    size > WORD
}

/// Returns the number of arena words needed for `size` bytes.
#[inline]
pub fn words_for(size: usize) -> usize {
    size.div_ceil(WORD)
}

/// An arena allocation, in words.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArenaAllocation {
    /// First word of the value.
    pub offset: usize,
    /// New allocation cursor after the value.
    pub end: usize,
}

/// Plans the arena allocation for `size` bytes aligned to `align` bytes, given the current
/// allocation cursor.
///
/// Returns `None` on overflow.
pub fn plan_allocation(allocated: usize, size: usize, align: usize) -> Option<ArenaAllocation> {
    let align_words = (align / WORD).max(1);
    let offset = align_up(allocated, align_words)?;
    let end = offset.checked_add(words_for(size))?;
    Some(ArenaAllocation { offset, end })
}

/// Returns `true` if a value at the arena word `offset` is aligned to `align` bytes.
#[inline]
pub fn is_aligned(offset: u32, align: usize) -> bool {
    (offset as usize * WORD) % align == 0
}

/// Returns the alignment for `size` bytes of a value whose type is only known by its tag.
///
/// The size of every type is a multiple of its alignment, so this satisfies any type of that size
/// that the arena can hold.
pub fn erased_align(size: usize) -> usize {
    1usize
        .checked_shl(size.trailing_zeros())
        .unwrap_or(ARENA_ALIGN)
        .clamp(WORD, ARENA_ALIGN)
}

/// Read access to the value words and arena of a container.
#[derive(Clone, Copy, Debug)]
pub struct ValueSlots<'a> {
    /// One word per slot.
    pub values: &'a [u32],
    /// The value arena, starting at a 16-byte aligned address.
    pub arena: &'a [u8],
}

impl<'a> ValueSlots<'a> {
    /// Returns the `size` bytes of the value stored in `slot`.
    pub fn bytes(self, slot: usize, size: usize) -> &'a [u8] {
        let values = self.values;
        if is_large(size) {
            let offset = values[slot] as usize * WORD;
            &self.arena[offset..offset + size]
        } else {
            &bytemuck::bytes_of(&values[slot])[..size]
        }
    }

    /// Reinterprets the value stored in `slot` as `T`.
    ///
    /// The caller is responsible for checking the slot's type tag.
    pub fn read<T: Pod>(self, slot: usize) -> &'a T {
        bytemuck::from_bytes(self.bytes(slot, size_of::<T>()))
    }
}

/// Write access to the value words and arena of a container.
#[derive(Debug)]
pub struct ValueSlotsMut<'a> {
    /// One word per slot.
    pub values: &'a mut [u32],
    /// The value arena, starting at a 16-byte aligned address.
    pub arena: &'a mut [u8],
}

impl<'a> ValueSlotsMut<'a> {
    /// Returns the `size` bytes of the value stored in `slot` for modification.
    pub fn into_bytes(self, slot: usize, size: usize) -> &'a mut [u8] {
        if is_large(size) {
            let offset = self.values[slot] as usize * WORD;
            &mut self.arena[offset..offset + size]
        } else {
            &mut bytemuck::bytes_of_mut(&mut self.values[slot])[..size]
        }
    }

    /// Reinterprets the value stored in `slot` as a mutable `T`.
    pub fn into_mut<T: Pod>(self, slot: usize) -> &'a mut T {
        bytemuck::from_bytes_mut(self.into_bytes(slot, size_of::<T>()))
    }

    /// Stores the bytes of a small value inline in `slot`, zeroing the rest of its word.
    pub fn write_inline(&mut self, slot: usize, bytes: &[u8]) {
        debug_assert!(!is_large(bytes.len()));
        self.values[slot] = 0;
        bytemuck::bytes_of_mut(&mut self.values[slot])[..bytes.len()].copy_from_slice(bytes);
    }

    /// Stores the bytes of a large value at the arena word `offset` and records the offset in
    /// `slot`.
    pub fn write_large(&mut self, slot: usize, offset: u32, bytes: &[u8]) {
        debug_assert!(is_large(bytes.len()));
        self.values[slot] = offset;
        let start = offset as usize * WORD;
        self.arena[start..start + bytes.len()].copy_from_slice(bytes);
    }

    /// Overwrites the value already stored in `slot`, reusing its storage.
    pub fn overwrite(&mut self, slot: usize, bytes: &[u8]) {
        let reborrowed = ValueSlotsMut {
            values: &mut *self.values,
            arena: &mut *self.arena,
        };
        reborrowed.into_bytes(slot, bytes.len()).copy_from_slice(bytes);
    }
}
