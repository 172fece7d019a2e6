//! A hash map from a fixed key type to values of arbitrary [`Pod`] types.
//!
//! Every slot records the [`TypeTag`] and byte size of its value, which are checked on each typed
//! access. Values of up to 4 bytes are stored inline, larger values are placed in a trailing arena
//! (see [`value_store`](crate::value_store)).
//!
//! The map does not support removal, so the live slots are always `0..len`.
use std::{
    any::type_name,
    fmt,
    hash::Hash,
    marker::PhantomData,
    mem::{align_of, size_of},
};

use bytemuck::{Pod, Zeroable};

use crate::{
    chain::{ChainView, ChainViewMut},
    config::ContainerConfig,
    error::{Result, StorageError},
    host::GrowableBuffer,
    layout::{self, LayoutBuilder, Segment, NIL},
    type_tag::{assert_storable, assert_storable_bytes, check_type, TypeTag},
    value_store::{
        erased_align, is_aligned, is_large, plan_allocation, ValueSlots, ValueSlotsMut, WORD,
    },
};

const MAGIC: u32 = u32::from_le_bytes(*b"DUHM");

#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
struct Header {
    magic: u32,
    count: u32,
    capacity: u32,
    bucket_capacity: u32,
    /// In words.
    data_capacity: u32,
    /// In words.
    data_allocated: u32,
    log2_min_growth: u32,
    key_size: u32,
}

/// Byte layout of an [`UntypedHashMap`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UntypedMapLayout {
    /// Container header.
    pub header: Segment,
    /// One value word per slot.
    pub values: Segment,
    /// One key per slot.
    pub keys: Segment,
    /// Chain links.
    pub next: Segment,
    /// Bucket heads.
    pub buckets: Segment,
    /// Type tag per slot.
    pub types: Segment,
    /// Value size per slot.
    pub sizes: Segment,
    /// Arena for values larger than a word.
    pub data: Segment,
    /// Total byte length.
    pub total: usize,
}

impl UntypedMapLayout {
    /// Computes the layout for keys of type `K`, with `data_capacity` counted in words.
    pub fn compute<K: Pod>(
        capacity: usize,
        bucket_capacity: usize,
        data_capacity: usize,
    ) -> Result<Self> {
        let mut builder = LayoutBuilder::new();
        let header = builder.array::<Header>(1)?;
        let values = builder.array::<u32>(capacity)?;
        let keys = builder.array::<K>(capacity)?;
        let next = builder.array::<i32>(capacity)?;
        let buckets = builder.array::<i32>(bucket_capacity)?;
        let types = builder.array::<TypeTag>(capacity)?;
        let sizes = builder.array::<u16>(capacity)?;
        let data_len = data_capacity
            .checked_mul(WORD)
            .ok_or(StorageError::overflow("arena size"))?;
        let data = builder.arena(data_len)?;
        Ok(Self {
            header,
            values,
            keys,
            next,
            buckets,
            types,
            sizes,
            data,
            total: builder.finish(),
        })
    }

    fn of<K: Pod>(header: &Header) -> Self {
        Self::compute::<K>(
            header.capacity as usize,
            header.bucket_capacity as usize,
            header.data_capacity as usize,
        )
        .expect("layout was valid when the container was sized")
    }
}

struct Parts<'a, K> {
    header: &'a Header,
    chain: ChainView<'a, K>,
    values: ValueSlots<'a>,
    types: &'a [TypeTag],
    sizes: &'a [u16],
}

struct PartsMut<'a, K> {
    header: &'a mut Header,
    chain: ChainViewMut<'a, K>,
    values: ValueSlotsMut<'a>,
    types: &'a mut [TypeTag],
    sizes: &'a mut [u16],
}

/// Handle to an untyped hash map stored in a host buffer.
///
/// The handle borrows the buffer for its whole lifetime. Any operation that can grow the map takes
/// `&mut self`, so references obtained from the map cannot outlive a relocation of the buffer.
pub struct UntypedHashMap<'buf, K, B: GrowableBuffer + ?Sized> {
    buffer: &'buf mut B,
    _phantom: PhantomData<K>,
}

impl<K, B: GrowableBuffer + ?Sized> fmt::Debug for UntypedHashMap<'_, K, B>
where
    K: Pod + Eq + Hash + fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let header = self.header();
        f.debug_struct("UntypedHashMap")
            .field("len", &header.count)
            .field("capacity", &header.capacity)
            .field("data_allocated", &header.data_allocated)
            .field("data_capacity", &header.data_capacity)
            .field("keys", &self.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<'buf, K, B> UntypedHashMap<'buf, K, B>
where
    K: Pod + Eq + Hash,
    B: GrowableBuffer + ?Sized,
{
    /// Materializes an empty map in an empty host buffer.
    ///
    /// Panics if the buffer already holds data.
    pub fn init(buffer: &'buf mut B, config: ContainerConfig) -> Result<Self> {
        assert!(
            buffer.is_empty(),
            "cannot initialize a map in a buffer of {} bytes",
            buffer.len()
        );
        let log2_min_growth = config.log2_min_growth();
        let capacity = layout::grown_capacity(0, config.capacity, log2_min_growth)?;
        let bucket_capacity = layout::bucket_capacity_for(capacity)?;
        let data_capacity = if config.data_capacity == 0 {
            0
        } else {
            layout::grown_capacity(0, config.data_capacity, log2_min_growth)?
        };
        let new = UntypedMapLayout::compute::<K>(capacity, bucket_capacity, data_capacity)?;
        let header = Header {
            magic: MAGIC,
            count: 0,
            capacity: layout::to_u32(capacity, "slot capacity")?,
            bucket_capacity: layout::to_u32(bucket_capacity, "bucket capacity")?,
            data_capacity: layout::to_u32(data_capacity, "arena capacity")?,
            data_allocated: 0,
            log2_min_growth,
            key_size: layout::to_u32(size_of::<K>(), "key size")?,
        };

        buffer.resize_uninitialized(new.total)?;
        let mut map = Self {
            buffer,
            _phantom: PhantomData,
        };
        *map.header_mut() = header;
        map.parts_mut().chain.clear();
        Ok(map)
    }

    /// Attaches to a map previously materialized in `buffer`.
    ///
    /// Panics if the buffer does not hold a map with keys of type `K`.
    pub fn open(buffer: &'buf mut B) -> Self {
        assert!(
            buffer.len() >= size_of::<Header>(),
            "buffer of {} bytes does not hold an untyped map",
            buffer.len()
        );
        let header: &Header = layout::header(buffer.bytes());
        assert_eq!(header.magic, MAGIC, "buffer does not hold an untyped map");
        assert_eq!(
            header.key_size as usize,
            size_of::<K>(),
            "untyped map was created with a different key type than {}",
            type_name::<K>()
        );
        assert!(UntypedMapLayout::of::<K>(header).total <= buffer.len());
        Self {
            buffer,
            _phantom: PhantomData,
        }
    }

    fn header(&self) -> &Header {
        layout::header(self.buffer.bytes())
    }

    fn header_mut(&mut self) -> &mut Header {
        bytemuck::from_bytes_mut(&mut self.buffer.bytes_mut()[..size_of::<Header>()])
    }

    fn parts(&self) -> Parts<'_, K> {
        let bytes = self.buffer.bytes();
        let header: &Header = layout::header(bytes);
        let at = UntypedMapLayout::of::<K>(header);
        Parts {
            header,
            chain: ChainView {
                keys: layout::view(bytes, at.keys),
                next: layout::view(bytes, at.next),
                buckets: layout::view(bytes, at.buckets),
            },
            values: ValueSlots {
                values: layout::view(bytes, at.values),
                arena: &bytes[at.data.range()],
            },
            types: layout::view(bytes, at.types),
            sizes: layout::view(bytes, at.sizes),
        }
    }

    fn parts_mut(&mut self) -> PartsMut<'_, K> {
        let at = UntypedMapLayout::of::<K>(self.header());
        let [header, values, keys, next, buckets, types, sizes, data] = layout::carve_mut(
            self.buffer.bytes_mut(),
            [
                at.header, at.values, at.keys, at.next, at.buckets, at.types, at.sizes, at.data,
            ],
        );
        PartsMut {
            header: bytemuck::from_bytes_mut(header),
            chain: ChainViewMut {
                keys: bytemuck::cast_slice_mut(keys),
                next: bytemuck::cast_slice_mut(next),
                buckets: bytemuck::cast_slice_mut(buckets),
            },
            values: ValueSlotsMut {
                values: bytemuck::cast_slice_mut(values),
                arena: data,
            },
            types: bytemuck::cast_slice_mut(types),
            sizes: bytemuck::cast_slice_mut(sizes),
        }
    }

    /// Returns the number of entries.
    pub fn len(&self) -> usize {
        self.header().count as usize
    }

    /// Returns `true` if the map holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the number of slots.
    pub fn capacity(&self) -> usize {
        self.header().capacity as usize
    }

    /// Returns the arena capacity in 4-byte words.
    pub fn data_capacity(&self) -> usize {
        self.header().data_capacity as usize
    }

    /// Returns the number of arena words in use.
    pub fn data_len(&self) -> usize {
        self.header().data_allocated as usize
    }

    /// Returns the slot of `key`.
    pub fn find(&self, key: &K) -> Option<usize> {
        self.parts().chain.find(key)
    }

    /// Returns `true` if the map holds `key`.
    pub fn contains_key(&self, key: &K) -> bool {
        self.find(key).is_some()
    }

    /// Grows the map to hold at least `capacity` slots.
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

    /// Makes sure that at least `additional` more arena words can be allocated without growing.
    ///
    /// Alignment padding of future values is not accounted for.
    pub fn reserve_data(&mut self, additional: usize) -> Result<()> {
        let header = *self.header();
        let required = (header.data_allocated as usize)
            .checked_add(additional)
            .ok_or(StorageError::overflow("arena capacity"))?;
        self.ensure_data(required)
    }

    /// Stores `value` for `key`, inserting the key if it is not present.
    ///
    /// An existing value may be replaced by a value of a different type only if both have the same
    /// size. Panics otherwise. The new value reuses the old storage unless that storage is not
    /// aligned for `T`, in which case it moves to a fresh arena allocation.
    pub fn add_or_set<T: Pod>(&mut self, key: K, value: T) -> Result<()> {
        assert_storable::<T>();
        self.store(
            key,
            TypeTag::of::<T>(),
            bytemuck::bytes_of(&value),
            align_of::<T>(),
            type_name::<T>(),
        )
    }

    /// Inserts `key` with `value` and returns the slot it was stored in.
    ///
    /// Panics if the key is already present.
    pub fn add<T: Pod>(&mut self, key: K, value: T) -> Result<usize> {
        assert_storable::<T>();
        assert!(
            !self.contains_key(&key),
            "an item with the same key has already been added"
        );
        self.insert_new(key, TypeTag::of::<T>(), bytemuck::bytes_of(&value), align_of::<T>())
    }

    /// Stores the raw bytes of a value of the type `tag` stands for, inserting the key if it is
    /// not present.
    ///
    /// This is the write side of [`try_get_bytes`](Self::try_get_bytes). Large values are aligned
    /// for any type of their size, so they can be read back as the tagged type. Replacing an
    /// existing value follows the size rule of [`add_or_set`](Self::add_or_set).
    pub fn add_or_set_bytes(&mut self, key: K, tag: TypeTag, bytes: &[u8]) -> Result<()> {
        assert_storable_bytes(bytes);
        self.store(key, tag, bytes, erased_align(bytes.len()), "the new value")
    }

    /// Inserts `key` with the raw bytes of a value of the type `tag` stands for and returns the
    /// slot it was stored in.
    ///
    /// Panics if the key is already present.
    pub fn add_bytes(&mut self, key: K, tag: TypeTag, bytes: &[u8]) -> Result<usize> {
        assert_storable_bytes(bytes);
        assert!(
            !self.contains_key(&key),
            "an item with the same key has already been added"
        );
        self.insert_new(key, tag, bytes, erased_align(bytes.len()))
    }

    /// Returns a reference to the value of `key`, inserting `default` if the key is not present.
    ///
    /// Panics if the key is present with a value of a type other than `T`.
    pub fn get_or_add_ref<T: Pod>(&mut self, key: K, default: T) -> Result<&mut T> {
        assert_storable::<T>();
        let slot = match self.find(&key) {
            Some(slot) => slot,
            None => self.insert_new(
                key,
                TypeTag::of::<T>(),
                bytemuck::bytes_of(&default),
                align_of::<T>(),
            )?,
        };
        Ok(self.slot_mut(slot))
    }

    /// Returns a copy of the value of `key`.
    ///
    /// Panics if the key is present with a value of a type other than `T`.
    pub fn try_get_value<T: Pod>(&self, key: &K) -> Option<T> {
        self.get_ref(key).copied()
    }

    /// Returns a reference to the value of `key`.
    ///
    /// Panics if the key is present with a value of a type other than `T`.
    pub fn get_ref<T: Pod>(&self, key: &K) -> Option<&T> {
        let parts = self.parts();
        let slot = parts.chain.find(key)?;
        check_type::<T>(
            parts.types[slot],
            parts.sizes[slot] as usize,
            format_args!("slot {slot}"),
        );
        Some(parts.values.read(slot))
    }

    /// Returns a mutable reference to the value of `key`.
    ///
    /// Panics if the key is present with a value of a type other than `T`.
    pub fn get_mut<T: Pod>(&mut self, key: &K) -> Option<&mut T> {
        let slot = self.find(key)?;
        Some(self.slot_mut(slot))
    }

    /// Returns the type tag and the raw bytes of the value of `key`.
    pub fn try_get_bytes(&self, key: &K) -> Option<(TypeTag, &[u8])> {
        let parts = self.parts();
        let slot = parts.chain.find(key)?;
        let bytes = parts.values.bytes(slot, parts.sizes[slot] as usize);
        Some((parts.types[slot], bytes))
    }

    /// Returns an iterator over all keys in insertion order.
    pub fn keys(&self) -> impl Iterator<Item = K> + '_ {
        let parts = self.parts();
        let keys = parts.chain.keys;
        keys[..parts.header.count as usize].iter().copied()
    }

    /// Removes all entries, keeping the allocated capacities.
    pub fn clear(&mut self) {
        let parts = self.parts_mut();
        parts.header.count = 0;
        parts.header.data_allocated = 0;
        let mut chain = parts.chain;
        chain.clear();
    }

    /// Releases the host buffer's storage.
    pub fn dispose(self) -> Result<()> {
        self.buffer.resize_uninitialized(0)
    }

    fn slot_mut<T: Pod>(&mut self, slot: usize) -> &mut T {
        let parts = self.parts_mut();
        check_type::<T>(
            parts.types[slot],
            parts.sizes[slot] as usize,
            format_args!("slot {slot}"),
        );
        parts.values.into_mut(slot)
    }

    fn store(
        &mut self,
        key: K,
        tag: TypeTag,
        bytes: &[u8],
        align: usize,
        what: &str,
    ) -> Result<()> {
        let Some(slot) = self.find(&key) else {
            self.insert_new(key, tag, bytes, align)?;
            return Ok(());
        };
        let parts = self.parts();
        let stored_size = parts.sizes[slot] as usize;
        assert_eq!(
            stored_size,
            bytes.len(),
            "size mismatch at slot {slot}: stored value has {stored_size} bytes, {what} has {}",
            bytes.len(),
        );
        let stored_offset = parts.values.values[slot];
        let moved_to = if is_large(bytes.len()) && !is_aligned(stored_offset, align) {
            Some(self.allocate(bytes.len(), align)?)
        } else {
            None
        };

        let parts = self.parts_mut();
        parts.types[slot] = tag;
        let mut values = parts.values;
        match moved_to {
            Some(offset) => {
                log::trace!("realigned value at slot {slot} to arena word {offset}");
                values.write_large(slot, offset, bytes);
            }
            None => values.overwrite(slot, bytes),
        }
        Ok(())
    }

    fn insert_new(&mut self, key: K, tag: TypeTag, bytes: &[u8], align: usize) -> Result<usize> {
        let size = bytes.len();
        assert!(
            size <= u16::MAX as usize,
            "value of {size} bytes is too large for an untyped map"
        );

        let header = *self.header();
        if header.count == header.capacity {
            let capacity = layout::next_capacity(
                header.count as usize,
                header.capacity as usize,
                header.log2_min_growth,
            )?;
            self.grow(capacity)?;
        }
        let offset = if is_large(size) {
            Some(self.allocate(size, align)?)
        } else {
            None
        };

        let parts = self.parts_mut();
        let slot = parts.header.count as usize;
        let mut chain = parts.chain;
        let mut values = parts.values;
        chain.insert(slot, key);
        parts.types[slot] = tag;
        parts.sizes[slot] = size as u16;
        match offset {
            Some(offset) => values.write_large(slot, offset, bytes),
            None => values.write_inline(slot, bytes),
        }
        parts.header.count += 1;
        Ok(slot)
    }

    /// Reserves arena space for `size` bytes aligned to `align` and returns its word offset.
    fn allocate(&mut self, size: usize, align: usize) -> Result<u32> {
        let allocated = self.header().data_allocated as usize;
        let allocation = plan_allocation(allocated, size, align)
            .ok_or(StorageError::overflow("arena capacity"))?;
        let offset = layout::to_u32(allocation.offset, "arena offset")?;
        let end = layout::to_u32(allocation.end, "arena offset")?;
        self.ensure_data(allocation.end)?;
        self.header_mut().data_allocated = end;
        Ok(offset)
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
        let new = UntypedMapLayout::compute::<K>(
            header.capacity as usize,
            header.bucket_capacity as usize,
            data_capacity,
        )?;

        // The arena is the last segment, so growing the buffer keeps every other array in place.
        self.buffer.resize_uninitialized(new.total)?;
        self.header_mut().data_capacity = data_capacity_u32;
        log::debug!("untyped map arena grows from {current} to {data_capacity} words");
        Ok(())
    }

    fn grow(&mut self, capacity: usize) -> Result<()> {
        let header = *self.header();
        let old_capacity = header.capacity as usize;
        debug_assert!(capacity > old_capacity);
        let bucket_capacity = layout::bucket_capacity_for(capacity)?;
        let capacity_u32 = layout::to_u32(capacity, "slot capacity")?;
        let bucket_capacity_u32 = layout::to_u32(bucket_capacity, "bucket capacity")?;

        let old = UntypedMapLayout::of::<K>(&header);
        let new = UntypedMapLayout::compute::<K>(
            capacity,
            bucket_capacity,
            header.data_capacity as usize,
        )?;
        let old_buckets: Vec<i32> = layout::view(self.buffer.bytes(), old.buckets).to_vec();

        layout::relocate(
            &mut *self.buffer,
            &[
                (old.header, new.header),
                (old.values, new.values),
                (old.keys, new.keys),
                (old.next, new.next),
                (old.types, new.types),
                (old.sizes, new.sizes),
                (old.data, new.data),
            ],
            new.total,
        )?;

        let header = self.header_mut();
        header.capacity = capacity_u32;
        header.bucket_capacity = bucket_capacity_u32;

        let mut chain = self.parts_mut().chain;
        chain.next[old_capacity..].fill(NIL);
        chain.rehash_from(&old_buckets);

        log::debug!("untyped map grows from {old_capacity} to {capacity} slots");
        log::trace!(
            "rehashed {} buckets into {bucket_capacity} buckets",
            old_buckets.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::AlignedBuffer;

    #[test]
    fn layout_places_arena_last() {
        let at = UntypedMapLayout::compute::<u64>(4, 8, 3).unwrap();
        assert_eq!(at.header, Segment { offset: 0, len: 32 });
        assert_eq!(at.values, Segment { offset: 32, len: 16 });
        assert_eq!(at.keys, Segment { offset: 48, len: 32 });
        assert_eq!(at.next, Segment { offset: 80, len: 16 });
        assert_eq!(at.buckets, Segment { offset: 96, len: 32 });
        assert_eq!(at.types, Segment { offset: 128, len: 16 });
        assert_eq!(at.sizes, Segment { offset: 144, len: 8 });
        assert_eq!(at.data, Segment { offset: 160, len: 12 });
        assert_eq!(at.total, 172);
    }

    #[test]
    fn growth_keeps_entries() {
        let mut buffer = AlignedBuffer::new();
        let mut map =
            UntypedHashMap::<u32, _>::init(&mut buffer, ContainerConfig::new().with_min_growth(4))
                .unwrap();
        assert_eq!(map.capacity(), 4);
        for key in 0..40u32 {
            if key % 2 == 0 {
                map.add(key, key as u16).unwrap();
            } else {
                map.add(key, [key as u64; 3]).unwrap();
            }
        }
        assert_eq!(map.len(), 40);
        assert!(map.capacity() >= 40);
        for key in 0..40u32 {
            if key % 2 == 0 {
                assert_eq!(map.try_get_value::<u16>(&key), Some(key as u16));
            } else {
                assert_eq!(map.try_get_value::<[u64; 3]>(&key), Some([key as u64; 3]));
            }
        }
        assert_eq!(map.data_len(), 20 * 6);
    }
}
