//! An append-only sequence of values of arbitrary [`Pod`] types.
//!
//! Element `i` is described by its byte offset into the trailing arena, its size, its
//! [`TypeTag`] and its required alignment. Elements are packed into the arena in index order,
//! each aligned to at least 4 bytes and at least its type's alignment.
//! [`remove_at`][UntypedSeq::remove_at] repacks all elements following the removed one using the
//! same rule, so the arena never has gaps beyond alignment padding.
use std::{
    fmt,
    mem::{align_of, size_of},
};

use bytemuck::{Pod, Zeroable};
use dynbuf_util::pow2::align_up;

use crate::{
    config::ContainerConfig,
    error::{Result, StorageError},
    host::GrowableBuffer,
    layout::{self, LayoutBuilder, Segment},
    type_tag::{assert_storable, check_type, TypeTag},
};

const MAGIC: u32 = u32::from_le_bytes(*b"DUSB");

/// Minimal alignment of every element in the arena.
pub const MIN_ELEMENT_ALIGN: usize = 4;

#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
struct Header {
    magic: u32,
    count: u32,
    capacity: u32,
    /// In bytes.
    data_capacity: u32,
    /// In bytes.
    data_allocated: u32,
    log2_min_growth: u32,
    reserved: [u32; 2],
}

/// Byte layout of an [`UntypedSeq`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SequenceLayout {
    /// Container header.
    pub header: Segment,
    /// Arena offset of each element.
    pub offsets: Segment,
    /// Byte size of each element.
    pub sizes: Segment,
    /// Type tag of each element.
    pub types: Segment,
    /// Required alignment of each element.
    pub aligns: Segment,
    /// Element bytes.
    pub data: Segment,
    /// Total byte length.
    pub total: usize,
}

impl SequenceLayout {
    /// Computes the layout, with `data_capacity` counted in bytes.
    pub fn compute(capacity: usize, data_capacity: usize) -> Result<Self> {
        let mut builder = LayoutBuilder::new();
        let header = builder.array::<Header>(1)?;
        let offsets = builder.array::<u32>(capacity)?;
        let sizes = builder.array::<u32>(capacity)?;
        let types = builder.array::<TypeTag>(capacity)?;
        let aligns = builder.array::<u32>(capacity)?;
        let data = builder.arena(data_capacity)?;
        Ok(Self {
            header,
            offsets,
            sizes,
            types,
            aligns,
            data,
            total: builder.finish(),
        })
    }

    fn of(header: &Header) -> Self {
        Self::compute(header.capacity as usize, header.data_capacity as usize)
            .expect("layout was valid when the container was sized")
    }
}

struct Parts<'a> {
    header: &'a Header,
    offsets: &'a [u32],
    sizes: &'a [u32],
    types: &'a [TypeTag],
    data: &'a [u8],
}

struct PartsMut<'a> {
    header: &'a mut Header,
    offsets: &'a mut [u32],
    sizes: &'a mut [u32],
    types: &'a mut [TypeTag],
    aligns: &'a mut [u32],
    data: &'a mut [u8],
}

/// Handle to an untyped sequence buffer stored in a host buffer.
pub struct UntypedSeq<'buf, B: GrowableBuffer + ?Sized> {
    buffer: &'buf mut B,
}

impl<B: GrowableBuffer + ?Sized> fmt::Debug for UntypedSeq<'_, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts = self.parts();
        let count = parts.header.count as usize;
        f.debug_struct("UntypedSeq")
            .field("len", &count)
            .field("capacity", &parts.header.capacity)
            .field("data_allocated", &parts.header.data_allocated)
            .field("data_capacity", &parts.header.data_capacity)
            .field("types", &&parts.types[..count])
            .finish()
    }
}

impl<'buf, B: GrowableBuffer + ?Sized> UntypedSeq<'buf, B> {
    /// Materializes an empty sequence in an empty host buffer.
    ///
    /// Panics if the buffer already holds data.
    pub fn init(buffer: &'buf mut B, config: ContainerConfig) -> Result<Self> {
        assert!(
            buffer.is_empty(),
            "cannot initialize a sequence in a buffer of {} bytes",
            buffer.len()
        );
        let log2_min_growth = config.log2_min_growth();
        let capacity = layout::grown_capacity(0, config.capacity, log2_min_growth)?;
        let data_capacity = if config.data_capacity == 0 {
            0
        } else {
            layout::grown_capacity(0, config.data_capacity, log2_min_growth)?
        };
        let new = SequenceLayout::compute(capacity, data_capacity)?;
        let header = Header {
            magic: MAGIC,
            count: 0,
            capacity: layout::to_u32(capacity, "slot capacity")?,
            data_capacity: layout::to_u32(data_capacity, "arena capacity")?,
            data_allocated: 0,
            log2_min_growth,
            reserved: [0; 2],
        };

        buffer.resize_uninitialized(new.total)?;
        let mut seq = Self { buffer };
        *seq.header_mut() = header;
        Ok(seq)
    }

    /// Attaches to a sequence previously materialized in `buffer`.
    ///
    /// Panics if the buffer does not hold an untyped sequence.
    pub fn open(buffer: &'buf mut B) -> Self {
        assert!(
            buffer.len() >= size_of::<Header>(),
            "buffer of {} bytes does not hold an untyped sequence",
            buffer.len()
        );
        let header: &Header = layout::header(buffer.bytes());
        assert_eq!(header.magic, MAGIC, "buffer does not hold an untyped sequence");
        assert!(SequenceLayout::of(header).total <= buffer.len());
        Self { buffer }
    }

    fn header(&self) -> &Header {
        layout::header(self.buffer.bytes())
    }

    fn header_mut(&mut self) -> &mut Header {
        bytemuck::from_bytes_mut(&mut self.buffer.bytes_mut()[..size_of::<Header>()])
    }

    fn parts(&self) -> Parts<'_> {
        let bytes = self.buffer.bytes();
        let header: &Header = layout::header(bytes);
        let at = SequenceLayout::of(header);
        Parts {
            header,
            offsets: layout::view(bytes, at.offsets),
            sizes: layout::view(bytes, at.sizes),
            types: layout::view(bytes, at.types),
            data: &bytes[at.data.range()],
        }
    }

    fn parts_mut(&mut self) -> PartsMut<'_> {
        let at = SequenceLayout::of(self.header());
        let [header, offsets, sizes, types, aligns, data] = layout::carve_mut(
            self.buffer.bytes_mut(),
            [
                at.header, at.offsets, at.sizes, at.types, at.aligns, at.data,
            ],
        );
        PartsMut {
            header: bytemuck::from_bytes_mut(header),
            offsets: bytemuck::cast_slice_mut(offsets),
            sizes: bytemuck::cast_slice_mut(sizes),
            types: bytemuck::cast_slice_mut(types),
            aligns: bytemuck::cast_slice_mut(aligns),
            data,
        }
    }

    /// Returns the number of elements.
    pub fn len(&self) -> usize {
        self.header().count as usize
    }

    /// Returns `true` if the sequence holds no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the number of element slots.
    pub fn capacity(&self) -> usize {
        self.header().capacity as usize
    }

    /// Returns the number of arena bytes in use, including alignment padding.
    pub fn data_len(&self) -> usize {
        self.header().data_allocated as usize
    }

    /// Returns the arena capacity in bytes.
    pub fn data_capacity(&self) -> usize {
        self.header().data_capacity as usize
    }

    /// Grows the sequence to hold at least `capacity` elements.
    ///
    /// Requests below the current capacity are ignored.
    pub fn set_capacity(&mut self, capacity: usize) -> Result<()> {
        let header = *self.header();
        if capacity <= header.capacity as usize {
            return Ok(());
        }
        let capacity =
            layout::grown_capacity(header.count as usize, capacity, header.log2_min_growth)?;
        self.grow(capacity)
    }

    fn check_index(&self, index: usize) {
        let count = self.len();
        assert!(
            index < count,
            "index {index} is out of range for a sequence of length {count}"
        );
    }

    /// Returns the type tag of the element at `index`.
    ///
    /// Panics if `index` is out of range.
    pub fn type_tag_at(&self, index: usize) -> TypeTag {
        self.check_index(index);
        self.parts().types[index]
    }

    /// Returns the byte size of the element at `index`.
    ///
    /// Panics if `index` is out of range.
    pub fn size_at(&self, index: usize) -> usize {
        self.check_index(index);
        self.parts().sizes[index] as usize
    }

    /// Appends `value` and returns its index.
    pub fn add<T: Pod>(&mut self, value: T) -> Result<usize> {
        assert_storable::<T>();
        let header = *self.header();
        let align = align_of::<T>().max(MIN_ELEMENT_ALIGN);
        let offset = align_up(header.data_allocated as usize, align)
            .ok_or(StorageError::overflow("arena size"))?;
        let end = offset
            .checked_add(size_of::<T>())
            .ok_or(StorageError::overflow("arena size"))?;
        let offset_u32 = layout::to_u32(offset, "arena size")?;
        let end_u32 = layout::to_u32(end, "arena size")?;

        if header.count == header.capacity {
            let capacity = layout::next_capacity(
                header.count as usize,
                header.capacity as usize,
                header.log2_min_growth,
            )?;
            self.grow(capacity)?;
        }
        self.ensure_data(end)?;

        let parts = self.parts_mut();
        let index = parts.header.count as usize;
        parts.offsets[index] = offset_u32;
        parts.sizes[index] = size_of::<T>() as u32;
        parts.types[index] = TypeTag::of::<T>();
        parts.aligns[index] = align as u32;
        parts.data[offset..end].copy_from_slice(bytemuck::bytes_of(&value));
        parts.header.data_allocated = end_u32;
        parts.header.count += 1;
        Ok(index)
    }

    /// Returns a mutable reference to the element at `index`.
    ///
    /// Panics if `index` is out of range or the element is not of type `T`.
    pub fn element_at<T: Pod>(&mut self, index: usize) -> &mut T {
        self.check_index(index);
        let parts = self.parts_mut();
        let size = parts.sizes[index] as usize;
        check_type::<T>(parts.types[index], size, format_args!("index {index}"));
        let offset = parts.offsets[index] as usize;
        bytemuck::from_bytes_mut(&mut parts.data[offset..offset + size])
    }

    /// Returns a reference to the element at `index`.
    ///
    /// Panics if `index` is out of range or the element is not of type `T`.
    pub fn element_at_ro<T: Pod>(&self, index: usize) -> &T {
        self.check_index(index);
        let parts = self.parts();
        let size = parts.sizes[index] as usize;
        check_type::<T>(parts.types[index], size, format_args!("index {index}"));
        let offset = parts.offsets[index] as usize;
        let data = parts.data;
        bytemuck::from_bytes(&data[offset..offset + size])
    }

    /// Overwrites the element at `index`.
    ///
    /// Panics if `index` is out of range or the element is not of type `T`.
    pub fn set<T: Pod>(&mut self, index: usize, value: T) {
        *self.element_at(index) = value;
    }

    /// Returns the type tag and the raw bytes of the element at `index`.
    ///
    /// Panics if `index` is out of range.
    pub fn bytes_at(&self, index: usize) -> (TypeTag, &[u8]) {
        self.check_index(index);
        let parts = self.parts();
        let offset = parts.offsets[index] as usize;
        let size = parts.sizes[index] as usize;
        let data = parts.data;
        (parts.types[index], &data[offset..offset + size])
    }

    /// Removes the element at `index`, moving all following elements down by one.
    ///
    /// Panics if `index` is out of range.
    pub fn remove_at(&mut self, index: usize) {
        self.check_index(index);
        let parts = self.parts_mut();
        let count = parts.header.count as usize;
        parts.offsets.copy_within(index + 1..count, index);
        parts.sizes.copy_within(index + 1..count, index);
        parts.types.copy_within(index + 1..count, index);
        parts.aligns.copy_within(index + 1..count, index);
        let count = count - 1;

        let mut cursor = if index == 0 {
            0
        } else {
            (parts.offsets[index - 1] + parts.sizes[index - 1]) as usize
        };
        for i in index..count {
            let old = parts.offsets[i] as usize;
            let size = parts.sizes[i] as usize;
            // Repacked offsets never exceed the old ones, as the arena only lost bytes.
            let new = align_up(cursor, parts.aligns[i] as usize).unwrap_or(old);
            debug_assert!(new <= old);
            parts.data.copy_within(old..old + size, new);
            parts.offsets[i] = new as u32;
            cursor = new + size;
        }

        parts.header.count = count as u32;
        parts.header.data_allocated = cursor as u32;
        log::trace!("removed element {index}, arena compacted to {cursor} bytes");
    }

    /// Removes all elements, keeping the allocated capacities.
    pub fn clear(&mut self) {
        let header = self.header_mut();
        header.count = 0;
        header.data_allocated = 0;
    }

    /// Releases the host buffer's storage.
    pub fn dispose(self) -> Result<()> {
        self.buffer.resize_uninitialized(0)
    }

    fn ensure_data(&mut self, required: usize) -> Result<()> {
        let header = *self.header();
        let current = header.data_capacity as usize;
        if required <= current {
            return Ok(());
        }
        let data_capacity =
            layout::grown_data_capacity(current, required, header.log2_min_growth)?;
        let data_capacity_u32 = layout::to_u32(data_capacity, "arena capacity")?;
        let new = SequenceLayout::compute(header.capacity as usize, data_capacity)?;

        // The arena is the last segment, so growing the buffer keeps every other array in place.
        self.buffer.resize_uninitialized(new.total)?;
        self.header_mut().data_capacity = data_capacity_u32;
        log::debug!("untyped sequence arena grows from {current} to {data_capacity} bytes");
        Ok(())
    }

    fn grow(&mut self, capacity: usize) -> Result<()> {
        let header = *self.header();
        let old_capacity = header.capacity as usize;
        debug_assert!(capacity > old_capacity);
        let capacity_u32 = layout::to_u32(capacity, "slot capacity")?;

        let old = SequenceLayout::of(&header);
        let new = SequenceLayout::compute(capacity, header.data_capacity as usize)?;
        layout::relocate(
            &mut *self.buffer,
            &[
                (old.header, new.header),
                (old.offsets, new.offsets),
                (old.sizes, new.sizes),
                (old.types, new.types),
                (old.aligns, new.aligns),
                (old.data, new.data),
            ],
            new.total,
        )?;
        self.header_mut().capacity = capacity_u32;

        log::debug!("untyped sequence grows from {old_capacity} to {capacity} elements");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::AlignedBuffer;

    #[test]
    fn elements_are_packed_with_padding() {
        let mut buffer = AlignedBuffer::new();
        let mut seq = UntypedSeq::init(&mut buffer, ContainerConfig::new().with_min_growth(4))
            .unwrap();
        assert_eq!(seq.add(1u8).unwrap(), 0);
        assert_eq!(seq.add(2u64).unwrap(), 1);
        assert_eq!(seq.add(3u16).unwrap(), 2);
        assert_eq!(seq.data_len(), 8 + 8 + 2);
        assert_eq!(seq.size_at(1), 8);
        assert_eq!(seq.type_tag_at(2), TypeTag::of::<u16>());

        seq.remove_at(0);
        assert_eq!(*seq.element_at_ro::<u64>(0), 2);
        assert_eq!(*seq.element_at_ro::<u16>(1), 3);
        assert_eq!(seq.data_len(), 8 + 2);
    }

    #[test]
    #[should_panic(expected = "index 3 is out of range")]
    fn index_out_of_range() {
        let mut buffer = AlignedBuffer::new();
        let mut seq = UntypedSeq::init(&mut buffer, ContainerConfig::new()).unwrap();
        seq.add(1u32).unwrap();
        seq.element_at_ro::<u32>(3);
    }
}
