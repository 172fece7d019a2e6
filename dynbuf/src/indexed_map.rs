//! A map from a unique key to a value, additionally indexed by one non-unique secondary index.
//!
//! This is the single index variant of [`Indexed2Map`](crate::Indexed2Map) and uses the same
//! [`row_table`](crate::row_table) with two dimensions: removal leaves holes on a free list,
//! [`flatten`][IndexedMap::flatten] compacts and
//! [`remove_range_shift_down`][IndexedMap::remove_range_shift_down] removes a range of a compact
//! map.
use std::{fmt, hash::Hash, marker::PhantomData};

use bytemuck::Pod;

use crate::{
    config::ContainerConfig,
    error::Result,
    host::GrowableBuffer,
    row_table::{DimensionKind, IndexCursor, RowTable, Rows, RowsMut},
};

const MAGIC: u32 = u32::from_le_bytes(*b"DIM1");

const KEY: usize = 0;
const INDEX: usize = 1;

/// A row of an [`IndexedMap`] together with the slot it is stored in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexedEntry<K, I, V> {
    /// Slot of the row.
    pub slot: usize,
    /// Unique key.
    pub key: K,
    /// Secondary index.
    pub index: I,
    /// Value.
    pub value: V,
}

/// Handle to an [`IndexedMap`] stored in a host buffer.
pub struct IndexedMap<'buf, K, I, V, B: GrowableBuffer + ?Sized> {
    table: RowTable<'buf, V, B, 2>,
    _phantom: PhantomData<(K, I)>,
}

impl<K, I, V, B> fmt::Debug for IndexedMap<'_, K, I, V, B>
where
    K: Pod + Eq + Hash + fmt::Debug,
    I: Pod + Eq + Hash + fmt::Debug,
    V: Pod + fmt::Debug,
    B: GrowableBuffer + ?Sized,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

impl<'buf, K, I, V, B> IndexedMap<'buf, K, I, V, B>
where
    K: Pod + Eq + Hash,
    I: Pod + Eq + Hash,
    V: Pod,
    B: GrowableBuffer + ?Sized,
{
    fn kinds() -> [DimensionKind; 2] {
        [DimensionKind::of::<K>(), DimensionKind::of::<I>()]
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
    pub fn allocated_index(&self) -> usize {
        self.table.allocated_index()
    }

    /// Returns `true` if removals left free slots below [`allocated_index`][Self::allocated_index].
    pub fn has_holes(&self) -> bool {
        self.table.has_holes()
    }

    /// Grows the map to hold at least `capacity` slots.
    ///
    /// Requests below the current capacity are ignored.
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
    pub fn try_add(&mut self, key: K, index: I, value: V) -> Result<bool> {
        if self.contains_key(&key) {
            return Ok(false);
        }
        self.insert_new(key, index, value)?;
        Ok(true)
    }

    /// Inserts a row and returns its slot.
    ///
    /// Panics if `key` is already present.
    pub fn add(&mut self, key: K, index: I, value: V) -> Result<usize> {
        assert!(
            !self.contains_key(&key),
            "an item with the same key has already been added"
        );
        self.insert_new(key, index, value)
    }

    /// Removes the row with `key`, returning whether it was present.
    pub fn remove(&mut self, key: &K) -> bool {
        let Some(slot) = self.find(key) else {
            return false;
        };
        self.table.remove_slot(slot);
        true
    }

    /// Returns the index and the value of the row with `key`.
    pub fn try_get_value(&self, key: &K) -> Option<(I, V)> {
        let rows = self.table.rows();
        let slot = rows.chain::<K>(KEY).find(key)?;
        Some((rows.chain::<I>(INDEX).keys[slot], rows.values[slot]))
    }

    /// Returns a mutable reference to the value of the row with `key`.
    pub fn get_value_mut(&mut self, key: &K) -> Option<&mut V> {
        let slot = self.find(key)?;
        let values = self.table.rows_mut().values;
        Some(&mut values[slot])
    }

    /// Returns the row stored in `slot`, if the slot is live.
    pub fn entry_at(&self, slot: usize) -> Option<IndexedEntry<K, I, V>> {
        let rows = self.table.rows();
        rows.is_live::<K>(slot).then(|| Self::entry(&rows, slot))
    }

    /// Returns a row with `index` and a cursor for the remaining ones.
    pub fn try_get_first_value(
        &self,
        index: I,
    ) -> Option<(IndexedEntry<K, I, V>, IndexCursor<I>)> {
        let mut cursor = IndexCursor::new(index);
        let first = self.try_get_next_value(&mut cursor)?;
        Some((first, cursor))
    }

    /// Advances `cursor` to the next row with the same index and returns it.
    pub fn try_get_next_value(&self, cursor: &mut IndexCursor<I>) -> Option<IndexedEntry<K, I, V>> {
        let rows = self.table.rows();
        let slot = cursor.advance(rows.chain(INDEX))?;
        Some(Self::entry(&rows, slot))
    }

    /// Returns an iterator over all rows with `index`.
    pub fn entries_for_index(&self, index: I) -> impl Iterator<Item = IndexedEntry<K, I, V>> + '_ {
        let rows = self.table.rows();
        rows.matching(INDEX, index).map(move |slot| Self::entry(&rows, slot))
    }

    /// Returns an iterator over the values of all rows with `index`.
    pub fn values_for_index(&self, index: I) -> impl Iterator<Item = V> + '_ {
        self.entries_for_index(index).map(|entry| entry.value)
    }

    /// Returns an iterator over all rows, in the order of the key dimension's buckets.
    pub fn iter(&self) -> impl Iterator<Item = IndexedEntry<K, I, V>> + '_ {
        let rows = self.table.rows();
        rows.slots::<K>().map(move |slot| Self::entry(&rows, slot))
    }

    /// Removes all rows, keeping the allocated capacity.
    pub fn clear(&mut self) {
        self.table.clear();
    }

    /// Compacts the map so that the rows occupy the slots `0..len()`.
    ///
    /// Rows are renumbered in the order of [`iter`][Self::iter].
    pub fn flatten(&mut self) -> Result<()> {
        let saved: Vec<IndexedEntry<K, I, V>> = self.iter().collect();
        let mut rows = self.table.compact()?;
        for (slot, row) in saved.into_iter().enumerate() {
            Self::store(&mut rows, IndexedEntry { slot, ..row });
        }
        Ok(())
    }

    /// Removes the rows in slots `start..start + len` by moving all following rows down.
    ///
    /// Panics if the map has holes or if the range is out of bounds.
    pub fn remove_range_shift_down(&mut self, start: usize, len: usize) {
        self.table.remove_range_shift_down(start, len);
    }

    /// Releases the host buffer's storage.
    pub fn dispose(self) -> Result<()> {
        self.table.dispose()
    }

    fn insert_new(&mut self, key: K, index: I, value: V) -> Result<usize> {
        let slot = self.table.allocate_slot()?;
        let row = IndexedEntry {
            slot,
            key,
            index,
            value,
        };
        Self::store(&mut self.table.rows_mut(), row);
        Ok(slot)
    }

    fn entry(rows: &Rows<'_, V, 2>, slot: usize) -> IndexedEntry<K, I, V> {
        IndexedEntry {
            slot,
            key: rows.chain::<K>(KEY).keys[slot],
            index: rows.chain::<I>(INDEX).keys[slot],
            value: rows.values[slot],
        }
    }

    fn store(rows: &mut RowsMut<'_, V, 2>, row: IndexedEntry<K, I, V>) {
        rows.values[row.slot] = row.value;
        rows.dimensions[KEY].chain::<K>().insert(row.slot, row.key);
        rows.dimensions[INDEX].chain::<I>().insert(row.slot, row.index);
    }
}
