//! Slot storage shared by the indexed maps.
//!
//! A row table is a header, one value per slot and `N` hash dimensions over the same slot index
//! space (see [`chain`](crate::chain)). Dimension 0 holds the unique keys and its `next` array
//! doubles as the [`FreeList`] of removed slots. The table hands out and frees slots, and grows,
//! compacts and shifts all dimensions at once. Only the maps know the key types, so storing and
//! looking up keys is left to them, while the table reaches each dimension through its
//! [`DimensionKind`].
use std::{
    any::type_name,
    fmt,
    hash::Hash,
    iter,
    marker::PhantomData,
    mem::{align_of, size_of},
};

use bytemuck::{Pod, Zeroable};

use crate::{
    chain::{ChainView, ChainViewMut},
    config::ContainerConfig,
    error::Result,
    free_list::FreeList,
    host::GrowableBuffer,
    layout::{self, Carver, LayoutBuilder, Segment, NIL},
};

#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
struct Header {
    magic: u32,
    count: u32,
    capacity: u32,
    bucket_capacity: u32,
    allocated_index: u32,
    first_free: i32,
    log2_min_growth: u32,
    row_size: u32,
}

/// The key type of one hash dimension, reduced to what slot management needs.
#[derive(Clone, Copy)]
pub struct DimensionKind {
    size: usize,
    align: usize,
    name: &'static str,
    unlink: fn(&mut DimensionBytes<'_>, usize) -> bool,
    rehash_from: fn(&mut DimensionBytes<'_>, &[i32]),
    shift_down: fn(&mut DimensionBytes<'_>, usize, usize, usize),
}

impl DimensionKind {
    /// Returns the kind of a dimension with keys of type `K`.
    pub fn of<K: Pod + Eq + Hash>() -> Self {
        Self {
            size: size_of::<K>(),
            align: align_of::<K>(),
            name: type_name::<K>(),
            unlink: |dimension, slot| dimension.chain::<K>().unlink(slot),
            rehash_from: |dimension, old_buckets| dimension.chain::<K>().rehash_from(old_buckets),
            shift_down: |dimension, start, len, count| {
                dimension
                    .chain::<K>()
                    .remove_range_shift_down(start, len, count)
            },
        }
    }
}

impl fmt::Debug for DimensionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DimensionKind")
            .field("key", &self.name)
            .field("size", &self.size)
            .field("align", &self.align)
            .finish()
    }
}

/// Byte layout of the arrays of one hash dimension.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DimensionLayout {
    /// Key of each slot.
    pub keys: Segment,
    /// Chain links.
    pub next: Segment,
    /// Bucket heads.
    pub buckets: Segment,
}

impl DimensionLayout {
    fn place(
        builder: &mut LayoutBuilder,
        kind: &DimensionKind,
        capacity: usize,
        bucket_capacity: usize,
    ) -> Result<Self> {
        Ok(Self {
            keys: builder.array_of(capacity, kind.size, kind.align)?,
            next: builder.array::<i32>(capacity)?,
            buckets: builder.array::<i32>(bucket_capacity)?,
        })
    }

    fn view<'a, K: Pod>(&self, bytes: &'a [u8]) -> ChainView<'a, K> {
        ChainView {
            keys: layout::view(bytes, self.keys),
            next: layout::view(bytes, self.next),
            buckets: layout::view(bytes, self.buckets),
        }
    }
}

/// Byte layout of an indexed map with `N` hash dimensions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RowTableLayout<const N: usize> {
    /// Container header.
    pub header: Segment,
    /// Value of each slot.
    pub values: Segment,
    /// The key dimension followed by one dimension per index.
    pub dimensions: [DimensionLayout; N],
    /// Total byte length.
    pub total: usize,
}

impl<const N: usize> RowTableLayout<N> {
    /// Computes the layout for values of type `V` and dimensions of the given kinds.
    pub fn compute<V: Pod>(
        kinds: &[DimensionKind; N],
        capacity: usize,
        bucket_capacity: usize,
    ) -> Result<Self> {
        let mut builder = LayoutBuilder::new();
        let header = builder.array::<Header>(1)?;
        let values = builder.array::<V>(capacity)?;
        let mut dimensions = [DimensionLayout::default(); N];
        for (dimension, kind) in dimensions.iter_mut().zip(kinds) {
            *dimension = DimensionLayout::place(&mut builder, kind, capacity, bucket_capacity)?;
        }
        Ok(Self {
            header,
            values,
            dimensions,
            total: builder.finish(),
        })
    }

    /// Segments that keep their contents when the slot capacity grows.
    fn slot_moves(&self, new: &Self) -> Vec<(Segment, Segment)> {
        let mut moves = vec![(self.header, new.header), (self.values, new.values)];
        for (old, new) in self.dimensions.iter().zip(&new.dimensions) {
            moves.push((old.keys, new.keys));
            moves.push((old.next, new.next));
        }
        moves
    }
}

/// The arrays of one hash dimension as raw bytes.
pub(crate) struct DimensionBytes<'a> {
    keys: &'a mut [u8],
    next: &'a mut [u8],
    buckets: &'a mut [u8],
}

impl DimensionBytes<'_> {
    /// Returns a typed view. `K` must be the key type this dimension was laid out for.
    pub(crate) fn chain<K: Pod>(&mut self) -> ChainViewMut<'_, K> {
        ChainViewMut {
            keys: bytemuck::cast_slice_mut(&mut *self.keys),
            next: bytemuck::cast_slice_mut(&mut *self.next),
            buckets: bytemuck::cast_slice_mut(&mut *self.buckets),
        }
    }

    fn next(&mut self) -> &mut [i32] {
        bytemuck::cast_slice_mut(&mut *self.next)
    }

    fn clear(&mut self) {
        self.next().fill(NIL);
        bytemuck::cast_slice_mut::<u8, i32>(&mut *self.buckets).fill(NIL);
    }
}

/// Shared view of a row table's arrays.
pub(crate) struct Rows<'a, V, const N: usize> {
    header: &'a Header,
    pub(crate) values: &'a [V],
    bytes: &'a [u8],
    layout: RowTableLayout<N>,
}

impl<V, const N: usize> Clone for Rows<'_, V, N> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<V, const N: usize> Copy for Rows<'_, V, N> {}

impl<'a, V, const N: usize> Rows<'a, V, N> {
    /// Returns a typed view of a dimension. `K` must be the dimension's key type.
    pub(crate) fn chain<K: Pod>(&self, dimension: usize) -> ChainView<'a, K> {
        self.layout.dimensions[dimension].view(self.bytes)
    }

    /// Returns `true` if `slot` holds a row. `K` is the key type of dimension 0.
    pub(crate) fn is_live<K: Pod + Eq + Hash>(&self, slot: usize) -> bool {
        if slot >= self.header.allocated_index as usize {
            return false;
        }
        let key = self.chain::<K>(0);
        key.find(&key.keys[slot]) == Some(slot)
    }

    /// Returns an iterator over all slots linked into dimension 0, in bucket order.
    pub(crate) fn slots<K: Pod + Eq + Hash>(&self) -> impl Iterator<Item = usize> + 'a {
        self.chain::<K>(0).bucket_order()
    }

    /// Returns an iterator over the slots holding `index` in `dimension`.
    pub(crate) fn matching<I: Pod + Eq + Hash>(
        &self,
        dimension: usize,
        index: I,
    ) -> impl Iterator<Item = usize> + 'a {
        let chain = self.chain::<I>(dimension);
        let mut cursor = IndexCursor::new(index);
        iter::from_fn(move || cursor.advance(chain))
    }
}

/// Mutable view of a row table's values and dimensions.
pub(crate) struct RowsMut<'a, V, const N: usize> {
    pub(crate) values: &'a mut [V],
    pub(crate) dimensions: [DimensionBytes<'a>; N],
}

/// Position of a walk over all rows sharing one index value.
///
/// Obtained together with the first row from one of the indexed maps' `try_get_first_value*`
/// methods and advanced by the matching `try_get_next_value*` method. The cursor stays valid as
/// long as the map is not modified.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexCursor<I> {
    index: I,
    slot: i32,
}

impl<I: Eq + Hash> IndexCursor<I> {
    pub(crate) fn new(index: I) -> Self {
        Self { index, slot: NIL }
    }

    /// Returns the index value being walked.
    pub fn index(&self) -> &I {
        &self.index
    }

    /// Returns the slot of the row returned last.
    pub fn slot(&self) -> Option<usize> {
        (self.slot != NIL).then_some(self.slot as usize)
    }

    /// Moves to the next slot holding the index and returns it.
    ///
    /// Once the walk is exhausted, the cursor stays on the last slot found.
    pub(crate) fn advance(&mut self, chain: ChainView<'_, I>) -> Option<usize> {
        let found = match self.slot() {
            None => chain.first_match(&self.index),
            Some(slot) => chain.next_match(slot, &self.index),
        }?;
        self.slot = found as i32;
        Some(found)
    }
}

/// Handle to the slot storage of an indexed map.
pub(crate) struct RowTable<'buf, V, B: GrowableBuffer + ?Sized, const N: usize> {
    buffer: &'buf mut B,
    kinds: [DimensionKind; N],
    _phantom: PhantomData<V>,
}

impl<'buf, V: Pod, B: GrowableBuffer + ?Sized, const N: usize> RowTable<'buf, V, B, N> {
    fn row_size(kinds: &[DimensionKind; N]) -> usize {
        size_of::<V>() + kinds.iter().map(|kind| kind.size).sum::<usize>()
    }

    /// Materializes an empty table in an empty host buffer.
    pub(crate) fn init(
        buffer: &'buf mut B,
        config: ContainerConfig,
        magic: u32,
        kinds: [DimensionKind; N],
    ) -> Result<Self> {
        assert!(
            buffer.is_empty(),
            "cannot initialize a map in a buffer of {} bytes",
            buffer.len()
        );
        let log2_min_growth = config.log2_min_growth();
        let capacity = layout::grown_capacity(0, config.capacity, log2_min_growth)?;
        let bucket_capacity = layout::bucket_capacity_for(capacity)?;
        let new = RowTableLayout::compute::<V>(&kinds, capacity, bucket_capacity)?;
        let header = Header {
            magic,
            count: 0,
            capacity: layout::to_u32(capacity, "slot capacity")?,
            bucket_capacity: layout::to_u32(bucket_capacity, "bucket capacity")?,
            allocated_index: 0,
            first_free: NIL,
            log2_min_growth,
            row_size: layout::to_u32(Self::row_size(&kinds), "row size")?,
        };

        buffer.resize_uninitialized(new.total)?;
        let mut table = Self {
            buffer,
            kinds,
            _phantom: PhantomData,
        };
        *table.header_mut() = header;
        table.clear();
        Ok(table)
    }

    /// Attaches to a table previously materialized in `buffer`.
    pub(crate) fn open(buffer: &'buf mut B, magic: u32, kinds: [DimensionKind; N]) -> Self {
        assert!(
            buffer.len() >= size_of::<Header>(),
            "buffer of {} bytes does not hold an indexed map",
            buffer.len()
        );
        let header: &Header = layout::header(buffer.bytes());
        assert_eq!(header.magic, magic, "buffer does not hold an indexed map");
        assert_eq!(
            header.row_size as usize,
            Self::row_size(&kinds),
            "indexed map was created with different row types"
        );
        let table = Self {
            buffer,
            kinds,
            _phantom: PhantomData,
        };
        assert!(table.layout().total <= table.buffer.len());
        table
    }

    fn layout_of(&self, header: &Header) -> RowTableLayout<N> {
        RowTableLayout::compute::<V>(
            &self.kinds,
            header.capacity as usize,
            header.bucket_capacity as usize,
        )
        .expect("layout was valid when the container was sized")
    }

    fn layout(&self) -> RowTableLayout<N> {
        self.layout_of(self.header())
    }

    fn header(&self) -> &Header {
        layout::header(self.buffer.bytes())
    }

    fn header_mut(&mut self) -> &mut Header {
        bytemuck::from_bytes_mut(&mut self.buffer.bytes_mut()[..size_of::<Header>()])
    }

    pub(crate) fn rows(&self) -> Rows<'_, V, N> {
        let bytes = self.buffer.bytes();
        let header: &Header = layout::header(bytes);
        let at = self.layout_of(header);
        Rows {
            header,
            values: layout::view(bytes, at.values),
            bytes,
            layout: at,
        }
    }

    pub(crate) fn rows_mut(&mut self) -> RowsMut<'_, V, N> {
        self.carve().1
    }

    fn carve(&mut self) -> (&mut Header, RowsMut<'_, V, N>) {
        let at = self.layout();
        let mut carver = Carver::new(self.buffer.bytes_mut());
        let header = bytemuck::from_bytes_mut(carver.take(at.header));
        let values = bytemuck::cast_slice_mut(carver.take(at.values));
        let dimensions = at.dimensions.map(|dimension| DimensionBytes {
            keys: carver.take(dimension.keys),
            next: carver.take(dimension.next),
            buckets: carver.take(dimension.buckets),
        });
        (header, RowsMut { values, dimensions })
    }

    pub(crate) fn len(&self) -> usize {
        self.header().count as usize
    }

    pub(crate) fn capacity(&self) -> usize {
        self.header().capacity as usize
    }

    pub(crate) fn allocated_index(&self) -> usize {
        self.header().allocated_index as usize
    }

    pub(crate) fn has_holes(&self) -> bool {
        self.header().first_free != NIL
    }

    /// Grows the table to hold at least `capacity` slots. Smaller requests are ignored.
    pub(crate) fn set_capacity(&mut self, capacity: usize) -> Result<()> {
        let header = *self.header();
        if capacity <= header.capacity as usize {
            return Ok(());
        }
        let capacity =
            layout::grown_capacity(header.count as usize, capacity, header.log2_min_growth)?;
        self.grow(capacity)
    }

    /// Hands out a slot for a new row, reusing the most recently freed one.
    ///
    /// The row counts as live right away, so the caller must store it and link it into every
    /// dimension.
    pub(crate) fn allocate_slot(&mut self) -> Result<usize> {
        let header = *self.header();
        if header.first_free == NIL && header.allocated_index == header.capacity {
            let capacity = layout::next_capacity(
                header.count as usize,
                header.capacity as usize,
                header.log2_min_growth,
            )?;
            self.grow(capacity)?;
        }

        let (header, mut rows) = self.carve();
        let mut free = FreeList {
            head: &mut header.first_free,
            next: rows.dimensions[0].next(),
        };
        let slot = match free.pop() {
            Some(slot) => slot,
            None => {
                let slot = header.allocated_index as usize;
                header.allocated_index += 1;
                slot
            }
        };
        header.count += 1;
        Ok(slot)
    }

    /// Unlinks the row in `slot` from every dimension and puts the slot on the free list.
    pub(crate) fn remove_slot(&mut self, slot: usize) {
        let kinds = self.kinds;
        let (header, mut rows) = self.carve();
        for (dimension, kind) in rows.dimensions.iter_mut().zip(&kinds) {
            let unlinked = (kind.unlink)(dimension, slot);
            debug_assert!(unlinked, "slot {slot} was not linked by {}", kind.name);
        }
        let mut free = FreeList {
            head: &mut header.first_free,
            next: rows.dimensions[0].next(),
        };
        free.push(slot);
        header.count -= 1;
    }

    pub(crate) fn clear(&mut self) {
        let (header, mut rows) = self.carve();
        header.count = 0;
        header.allocated_index = 0;
        header.first_free = NIL;
        for dimension in &mut rows.dimensions {
            dimension.clear();
        }
    }

    /// Resizes the table to the smallest capacity for its `len()` rows and empties it, keeping
    /// slots `0..len()` allocated.
    ///
    /// The caller must have saved the rows beforehand and must store and link one row per slot.
    pub(crate) fn compact(&mut self) -> Result<RowsMut<'_, V, N>> {
        let header = *self.header();
        let len = header.count as usize;
        let free_slots = {
            let (header, mut rows) = self.carve();
            FreeList {
                head: &mut header.first_free,
                next: rows.dimensions[0].next(),
            }
            .count()
        };
        debug_assert_eq!(len + free_slots, header.allocated_index as usize);

        let capacity = layout::grown_capacity(len, len, header.log2_min_growth)?;
        let bucket_capacity = layout::bucket_capacity_for(capacity)?;
        let capacity_u32 = layout::to_u32(capacity, "slot capacity")?;
        let bucket_capacity_u32 = layout::to_u32(bucket_capacity, "bucket capacity")?;
        let new = RowTableLayout::compute::<V>(&self.kinds, capacity, bucket_capacity)?;

        self.buffer.resize_uninitialized(new.total)?;
        let header = self.header_mut();
        header.capacity = capacity_u32;
        header.bucket_capacity = bucket_capacity_u32;
        self.clear();

        log::debug!(
            "flattened indexed map with {len} rows and {free_slots} holes into {capacity} slots"
        );
        let (header, rows) = self.carve();
        header.count = len as u32;
        header.allocated_index = len as u32;
        Ok(rows)
    }

    /// Removes the rows in slots `start..start + len` by moving all following rows down.
    pub(crate) fn remove_range_shift_down(&mut self, start: usize, len: usize) {
        assert!(
            !self.has_holes(),
            "cannot shift rows of an indexed map with holes, flatten it first"
        );
        let count = self.len();
        assert!(
            start <= count && len <= count - start,
            "range {start}..{} is out of bounds for an indexed map with {count} rows",
            start.saturating_add(len)
        );
        if len == 0 {
            return;
        }

        let kinds = self.kinds;
        let (header, mut rows) = self.carve();
        rows.values.copy_within(start + len..count, start);
        for (dimension, kind) in rows.dimensions.iter_mut().zip(&kinds) {
            (kind.shift_down)(dimension, start, len, count);
        }
        let new_count = (count - len) as u32;
        header.count = new_count;
        header.allocated_index = new_count;

        log::debug!("shifted {len} rows out of an indexed map at slot {start}");
    }

    pub(crate) fn dispose(self) -> Result<()> {
        self.buffer.resize_uninitialized(0)
    }

    fn grow(&mut self, capacity: usize) -> Result<()> {
        let header = *self.header();
        let old_capacity = header.capacity as usize;
        debug_assert!(capacity > old_capacity);
        let bucket_capacity = layout::bucket_capacity_for(capacity)?;
        let capacity_u32 = layout::to_u32(capacity, "slot capacity")?;
        let bucket_capacity_u32 = layout::to_u32(bucket_capacity, "bucket capacity")?;

        let old = self.layout_of(&header);
        let new = RowTableLayout::compute::<V>(&self.kinds, capacity, bucket_capacity)?;
        let bytes = self.buffer.bytes();
        let old_buckets: Vec<Vec<i32>> = old
            .dimensions
            .iter()
            .map(|dimension| layout::view::<i32>(bytes, dimension.buckets).to_vec())
            .collect();

        layout::relocate(&mut *self.buffer, &old.slot_moves(&new), new.total)?;
        let header_mut = self.header_mut();
        header_mut.capacity = capacity_u32;
        header_mut.bucket_capacity = bucket_capacity_u32;

        let kinds = self.kinds;
        let mut rows = self.rows_mut();
        for ((dimension, kind), old_buckets) in
            rows.dimensions.iter_mut().zip(&kinds).zip(&old_buckets)
        {
            dimension.next()[old_capacity..].fill(NIL);
            (kind.rehash_from)(dimension, old_buckets);
        }

        log::debug!("indexed map grows from {old_capacity} to {capacity} slots");
        log::trace!(
            "rehashed {} dimensions of {} buckets into {bucket_capacity} buckets",
            N,
            header.bucket_capacity
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::AlignedBuffer;

    const MAGIC: u32 = u32::from_le_bytes(*b"TEST");

    fn kinds() -> [DimensionKind; 2] {
        [DimensionKind::of::<u32>(), DimensionKind::of::<u16>()]
    }

    #[test]
    fn layout_orders_dimensions() {
        let at = RowTableLayout::compute::<u64>(&kinds(), 4, 8).unwrap();
        assert_eq!(at.header, Segment { offset: 0, len: 32 });
        assert_eq!(at.values, Segment { offset: 32, len: 32 });
        let [key, index] = at.dimensions;
        assert_eq!(key.keys, Segment { offset: 64, len: 16 });
        assert_eq!(key.next, Segment { offset: 80, len: 16 });
        assert_eq!(key.buckets, Segment { offset: 96, len: 32 });
        assert_eq!(index.keys, Segment { offset: 128, len: 8 });
        assert_eq!(index.next, Segment { offset: 136, len: 16 });
        assert_eq!(index.buckets, Segment { offset: 152, len: 32 });
        assert_eq!(at.total, 184);
    }

    #[test]
    fn slots_survive_growth_and_compaction() {
        let mut buffer = AlignedBuffer::new();
        let config = ContainerConfig::new().with_min_growth(2);
        let mut table = RowTable::<u64, _, 2>::init(&mut buffer, config, MAGIC, kinds()).unwrap();
        for key in 0..10u32 {
            let slot = table.allocate_slot().unwrap();
            assert_eq!(slot, key as usize);
            let mut rows = table.rows_mut();
            rows.values[slot] = key as u64 * 100;
            rows.dimensions[0].chain::<u32>().insert(slot, key);
            rows.dimensions[1].chain::<u16>().insert(slot, (key % 2) as u16);
        }
        assert_eq!(table.capacity(), 16);
        table.remove_slot(3);
        table.remove_slot(6);
        assert!(table.has_holes());
        assert_eq!(table.len(), 8);

        let rows = table.rows();
        assert!(!rows.is_live::<u32>(3));
        assert!(rows.is_live::<u32>(4));
        let mut even: Vec<usize> = rows.matching(1, 0u16).collect();
        even.sort_unstable();
        assert_eq!(even, vec![0, 2, 4, 8]);

        let saved: Vec<(u32, u16, u64)> = rows
            .slots::<u32>()
            .map(|slot| {
                let key = rows.chain::<u32>(0).keys[slot];
                (key, rows.chain::<u16>(1).keys[slot], rows.values[slot])
            })
            .collect();
        let mut rows = table.compact().unwrap();
        for (slot, &(key, index, value)) in saved.iter().enumerate() {
            rows.values[slot] = value;
            rows.dimensions[0].chain::<u32>().insert(slot, key);
            rows.dimensions[1].chain::<u16>().insert(slot, index);
        }
        assert!(!table.has_holes());
        assert_eq!(table.capacity(), 8);
        assert_eq!(table.allocated_index(), 8);
        let rows = table.rows();
        assert_eq!(rows.matching(1, 1u16).count(), 4);
        assert_eq!(rows.chain::<u32>(0).find(&9).map(|slot| rows.values[slot]), Some(900));
    }

    #[test]
    fn cursor_stays_exhausted() {
        let mut buffer = AlignedBuffer::new();
        let mut table =
            RowTable::<u64, _, 2>::init(&mut buffer, ContainerConfig::new(), MAGIC, kinds())
                .unwrap();
        for key in 0..3u32 {
            let slot = table.allocate_slot().unwrap();
            let mut rows = table.rows_mut();
            rows.dimensions[0].chain::<u32>().insert(slot, key);
            rows.dimensions[1].chain::<u16>().insert(slot, 7);
        }
        let rows = table.rows();
        let mut cursor = IndexCursor::new(7u16);
        let mut walked = vec![];
        while let Some(slot) = cursor.advance(rows.chain(1)) {
            walked.push(slot);
        }
        // most recently linked first
        assert_eq!(walked, vec![2, 1, 0]);
        assert_eq!(cursor.slot(), Some(0));
        assert_eq!(cursor.advance(rows.chain(1)), None);

        let mut missing = IndexCursor::new(8u16);
        assert_eq!(missing.advance(rows.chain(1)), None);
        assert_eq!(missing.slot(), None);
    }

    #[test]
    #[should_panic(expected = "indexed map was created with different row types")]
    fn open_checks_row_size() {
        let mut buffer = AlignedBuffer::new();
        RowTable::<u64, _, 2>::init(&mut buffer, ContainerConfig::new(), MAGIC, kinds()).unwrap();
        RowTable::<u32, _, 2>::open(&mut buffer, MAGIC, kinds());
    }
}
