//! A map from a unique key to a value, additionally indexed by two non-unique secondary indices.
//!
//! Rows are stored in the slots of a [`row_table`](crate::row_table) with three hash dimensions:
//! the key dimension, which enforces uniqueness, and one dimension per index, which may contain
//! repeated index values. Removing a row leaves a hole that is put on a free list and reused by the
//! next insertion. Holes are eliminated by [`flatten`][Indexed2Map::flatten], after which the map
//! supports the bulk removal [`remove_range_shift_down`][Indexed2Map::remove_range_shift_down].
use std::{fmt, hash::Hash, marker::PhantomData};

use bytemuck::Pod;

use crate::{
    config::ContainerConfig,
    error::Result,
    host::GrowableBuffer,
    row_table::{DimensionKind, IndexCursor, RowTable, Rows, RowsMut},
};

const MAGIC: u32 = u32::from_le_bytes(*b"DIM2");

const KEY: usize = 0;
const INDEX1: usize = 1;
const INDEX2: usize = 2;

/// A row of an [`Indexed2Map`] together with the slot it is stored in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Indexed2Entry<K, I1, I2, V> {
    /// Slot of the row.
    pub slot: usize,
    /// Unique key.
    pub key: K,
    /// First index.
    pub index1: I1,
    /// Second index.
    pub index2: I2,
    /// Value.
    pub value: V,
}

/// Handle to an [`Indexed2Map`] stored in a host buffer.
pub struct Indexed2Map<'buf, K, I1, I2, V, B: GrowableBuffer + ?Sized> {
    table: RowTable<'buf, V, B, 3>,
    _phantom: PhantomData<(K, I1, I2)>,
}

impl<K, I1, I2, V, B> fmt::Debug for Indexed2Map<'_, K, I1, I2, V, B>
where
    K: Pod + Eq + Hash + fmt::Debug,
    I1: Pod + Eq + Hash + fmt::Debug,
    I2: Pod + Eq + Hash + fmt::Debug,
    V: Pod + fmt::Debug,
    B: GrowableBuffer + ?Sized,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

impl<'buf, K, I1, I2, V, B> Indexed2Map<'buf, K, I1, I2, V, B>
where
    K: Pod + Eq + Hash,
    I1: Pod + Eq + Hash,
    I2: Pod + Eq + Hash,
    V: Pod,
    B: GrowableBuffer + ?Sized,
{
    fn kinds() -> [DimensionKind; 3] {
        [
            DimensionKind::of::<K>(),
            DimensionKind::of::<I1>(),
            DimensionKind::of::<I2>(),
        ]
    }

    /// Materializes an empty map in an empty host buffer.
    ///
    /// Panics if the buffer already holds data.
    pub fn init(buffer: &'buf mut B, config: ContainerConfig) -> Result<Self> {
        let table = RowTable::init(buffer, config, MAGIC, Self::kinds())?;
        Ok(Self {
            table,
            _phantom: PhantomData,
        })
    }

    /// Attaches to a map previously materialized in `buffer`.
    ///
    /// Panics if the buffer does not hold an indexed map with the same row types.
    pub fn open(buffer: &'buf mut B) -> Self {
        Self {
            table: RowTable::open(buffer, MAGIC, Self::kinds()),
            _phantom: PhantomData,
        }
    }

    /// Returns the number of rows.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Returns `true` if the map holds no rows.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the number of slots.
    pub fn capacity(&self) -> usize {
        self.table.capacity()
    }

    /// Returns the number of slots that were ever handed out since the last compaction.
    ///
    /// Slots in `0..allocated_index()` are either live or on the free list.
    pub fn allocated_index(&self) -> usize {
        self.table.allocated_index()
    }

    /// Returns `true` if removals left free slots below [`allocated_index`][Self::allocated_index].
    pub fn has_holes(&self) -> bool {
        self.table.has_holes()
    }

    /// Grows the map to hold at least `capacity` slots.
    ///
    /// Requests below the current capacity are ignored. Use [`flatten`][Self::flatten] to shrink.
    pub fn set_capacity(&mut self, capacity: usize) -> Result<()> {
        self.table.set_capacity(capacity)
    }

    /// Returns the slot of `key`.
    pub fn find(&self, key: &K) -> Option<usize> {
        self.table.rows().chain::<K>(KEY).find(key)
    }

    /// Returns `true` if the map holds a row with `key`.
    pub fn contains_key(&self, key: &K) -> bool {
        self.find(key).is_some()
    }

    /// Inserts a row unless `key` is already present.
    ///
    /// Returns `false` and leaves the map unchanged if the key is present.
    pub fn try_add(&mut self, key: K, index1: I1, index2: I2, value: V) -> Result<bool> {
        if self.contains_key(&key) {
            return Ok(false);
        }
        self.insert_new(key, index1, index2, value)?;
        Ok(true)
    }

    /// Inserts a row and returns its slot.
    ///
    /// Panics if `key` is already present.
    pub fn add(&mut self, key: K, index1: I1, index2: I2, value: V) -> Result<usize> {
        assert!(
            !self.contains_key(&key),
            "an item with the same key has already been added"
        );
        self.insert_new(key, index1, index2, value)
    }

    /// Removes the row with `key`, returning whether it was present.
    pub fn remove(&mut self, key: &K) -> bool {
        let Some(slot) = self.find(key) else {
            return false;
        };
        self.table.remove_slot(slot);
        true
    }

    /// Returns the indices and the value of the row with `key`.
    pub fn try_get_value(&self, key: &K) -> Option<(I1, I2, V)> {
        let rows = self.table.rows();
        let slot = rows.chain::<K>(KEY).find(key)?;
        let row = Self::entry(&rows, slot);
        Some((row.index1, row.index2, row.value))
    }

    /// Returns a mutable reference to the value of the row with `key`.
    pub fn get_value_mut(&mut self, key: &K) -> Option<&mut V> {
        let slot = self.find(key)?;
        let values = self.table.rows_mut().values;
        Some(&mut values[slot])
    }

    /// Returns the row stored in `slot`, if the slot is live.
    pub fn entry_at(&self, slot: usize) -> Option<Indexed2Entry<K, I1, I2, V>> {
        let rows = self.table.rows();
        rows.is_live::<K>(slot).then(|| Self::entry(&rows, slot))
    }

    /// Returns a row with the first index `index` and a cursor for the remaining ones.
    pub fn try_get_first_value_by_index1(
        &self,
        index: I1,
    ) -> Option<(Indexed2Entry<K, I1, I2, V>, IndexCursor<I1>)> {
        let mut cursor = IndexCursor::new(index);
        let first = self.try_get_next_value_by_index1(&mut cursor)?;
        Some((first, cursor))
    }

    /// Advances `cursor` to the next row with the same first index and returns it.
    pub fn try_get_next_value_by_index1(
        &self,
        cursor: &mut IndexCursor<I1>,
    ) -> Option<Indexed2Entry<K, I1, I2, V>> {
        let rows = self.table.rows();
        let slot = cursor.advance(rows.chain(INDEX1))?;
        Some(Self::entry(&rows, slot))
    }

    /// Returns a row with the second index `index` and a cursor for the remaining ones.
    pub fn try_get_first_value_by_index2(
        &self,
        index: I2,
    ) -> Option<(Indexed2Entry<K, I1, I2, V>, IndexCursor<I2>)> {
        let mut cursor = IndexCursor::new(index);
        let first = self.try_get_next_value_by_index2(&mut cursor)?;
        Some((first, cursor))
    }

    /// Advances `cursor` to the next row with the same second index and returns it.
    pub fn try_get_next_value_by_index2(
        &self,
        cursor: &mut IndexCursor<I2>,
    ) -> Option<Indexed2Entry<K, I1, I2, V>> {
        let rows = self.table.rows();
        let slot = cursor.advance(rows.chain(INDEX2))?;
        Some(Self::entry(&rows, slot))
    }

    /// Returns an iterator over all rows with the first index `index`.
    pub fn entries_for_index1(
        &self,
        index: I1,
    ) -> impl Iterator<Item = Indexed2Entry<K, I1, I2, V>> + '_ {
        let rows = self.table.rows();
        rows.matching(INDEX1, index).map(move |slot| Self::entry(&rows, slot))
    }

    /// Returns an iterator over all rows with the second index `index`.
    pub fn entries_for_index2(
        &self,
        index: I2,
    ) -> impl Iterator<Item = Indexed2Entry<K, I1, I2, V>> + '_ {
        let rows = self.table.rows();
        rows.matching(INDEX2, index).map(move |slot| Self::entry(&rows, slot))
    }

    /// Returns an iterator over the values of all rows with the first index `index`.
    pub fn values_for_index1(&self, index: I1) -> impl Iterator<Item = V> + '_ {
        self.entries_for_index1(index).map(|entry| entry.value)
    }

    /// Returns an iterator over the values of all rows with the second index `index`.
    pub fn values_for_index2(&self, index: I2) -> impl Iterator<Item = V> + '_ {
        self.entries_for_index2(index).map(|entry| entry.value)
    }

    /// Returns an iterator over all rows, in the order of the key dimension's buckets.
    pub fn iter(&self) -> impl Iterator<Item = Indexed2Entry<K, I1, I2, V>> + '_ {
        let rows = self.table.rows();
        rows.slots::<K>().map(move |slot| Self::entry(&rows, slot))
    }

    /// Removes all rows, keeping the allocated capacity.
    pub fn clear(&mut self) {
        self.table.clear();
    }

    /// Compacts the map so that the rows occupy the slots `0..len()`.
    ///
    /// The capacity is reduced to the smallest power of two that holds all rows, respecting the
    /// minimal growth. Rows are renumbered in the order of [`iter`][Self::iter].
    pub fn flatten(&mut self) -> Result<()> {
        let saved: Vec<Indexed2Entry<K, I1, I2, V>> = self.iter().collect();
        let mut rows = self.table.compact()?;
        for (slot, row) in saved.into_iter().enumerate() {
            Self::store(&mut rows, Indexed2Entry { slot, ..row });
        }
        Ok(())
    }

    /// Removes the rows in slots `start..start + len` by moving all following rows down.
    ///
    /// All three dimensions are rebuilt afterwards. Panics if the map has holes, see
    /// [`flatten`][Self::flatten], or if the range is out of bounds.
    pub fn remove_range_shift_down(&mut self, start: usize, len: usize) {
        self.table.remove_range_shift_down(start, len);
    }

    /// Releases the host buffer's storage.
    pub fn dispose(self) -> Result<()> {
        self.table.dispose()
    }

    fn insert_new(&mut self, key: K, index1: I1, index2: I2, value: V) -> Result<usize> {
        let slot = self.table.allocate_slot()?;
        let row = Indexed2Entry {
            slot,
            key,
            index1,
            index2,
            value,
        };
        Self::store(&mut self.table.rows_mut(), row);
        Ok(slot)
    }

    fn entry(rows: &Rows<'_, V, 3>, slot: usize) -> Indexed2Entry<K, I1, I2, V> {
        Indexed2Entry {
            slot,
            key: rows.chain::<K>(KEY).keys[slot],
            index1: rows.chain::<I1>(INDEX1).keys[slot],
            index2: rows.chain::<I2>(INDEX2).keys[slot],
            value: rows.values[slot],
        }
    }

    fn store(rows: &mut RowsMut<'_, V, 3>, row: Indexed2Entry<K, I1, I2, V>) {
        rows.values[row.slot] = row.value;
        rows.dimensions[KEY].chain::<K>().insert(row.slot, row.key);
        rows.dimensions[INDEX1].chain::<I1>().insert(row.slot, row.index1);
        rows.dimensions[INDEX2].chain::<I2>().insert(row.slot, row.index2);
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::AlignedBuffer;

    type Map<'a> = Indexed2Map<'a, u32, u16, u8, u64, AlignedBuffer>;

    fn small() -> ContainerConfig {
        ContainerConfig::new().with_min_growth(4)
    }

    #[test]
    fn freed_slots_are_reused() {
        let mut buffer = AlignedBuffer::new();
        let mut map = Map::init(&mut buffer, small()).unwrap();
        for key in 0..4 {
            assert_eq!(map.add(key, 0, 0, key as u64).unwrap(), key as usize);
        }
        assert!(map.remove(&1));
        assert!(map.remove(&2));
        assert!(map.has_holes());
        assert_eq!(map.add(10, 0, 0, 10).unwrap(), 2);
        assert_eq!(map.add(11, 0, 0, 11).unwrap(), 1);
        assert!(!map.has_holes());
        assert_eq!(map.capacity(), 4);
        assert_eq!(map.allocated_index(), 4);
    }

    #[test]
    fn cursor_walks_only_matching_index() {
        let mut buffer = AlignedBuffer::new();
        let mut map = Map::init(&mut buffer, small()).unwrap();
        for key in 0..20u32 {
            map.add(key, (key % 3) as u16, (key % 2) as u8, key as u64 * 10)
                .unwrap();
        }
        let (first, mut cursor) = map.try_get_first_value_by_index1(1).unwrap();
        let mut rows = vec![first];
        while let Some(row) = map.try_get_next_value_by_index1(&mut cursor) {
            rows.push(row);
        }
        for row in &rows {
            assert_eq!(row.index1, 1);
            assert_eq!(row.index2, (row.key % 2) as u8);
            assert_eq!(row.value, row.key as u64 * 10);
            assert_eq!(map.entry_at(row.slot), Some(*row));
        }
        let mut keys: Vec<u32> = rows.iter().map(|row| row.key).collect();
        keys.sort_unstable();
        assert_eq!(keys, vec![1, 4, 7, 10, 13, 16, 19]);
        assert_eq!(*cursor.index(), 1);
        assert_eq!(cursor.slot(), rows.last().map(|row| row.slot));

        assert_eq!(map.values_for_index2(0).count(), 10);
        assert!(map.try_get_first_value_by_index2(5).is_none());
    }
}
