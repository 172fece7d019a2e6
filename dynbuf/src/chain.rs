//! Separate chaining hash tables over parallel slot arrays.
//!
//! A hash dimension consists of three arrays living in the host buffer: `keys[capacity]`,
//! `next[capacity]` and `buckets[bucket_capacity]`. Each bucket holds the first slot of a singly
//! linked chain that continues through `next`, terminated by [`NIL`]. Several dimensions can share
//! one slot index space, which is how the indexed maps reach the same row by key and by index.
//!
//! These views only manipulate chains. Allocating slots, counting entries and resizing the
//! underlying arrays is up to the containers.
use std::hash::Hash;

use dynbuf_util::hash::{fold_to_u32, hash_ref};

use crate::layout::NIL;

/// Returns the bucket of `key` for a table with `bucket_mask + 1` buckets.
#[inline]
pub fn bucket_of<K: Hash>(key: &K, bucket_mask: usize) -> usize {
    fold_to_u32(hash_ref(key)) as usize & bucket_mask
}

/// Shared view of one hash dimension.
#[derive(Debug)]
pub struct ChainView<'a, K> {
    /// Key of each slot.
    pub keys: &'a [K],
    /// Chain successor of each slot.
    pub next: &'a [i32],
    /// First slot of each bucket chain.
    pub buckets: &'a [i32],
}

impl<K> Clone for ChainView<'_, K> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K> Copy for ChainView<'_, K> {}

impl<'a, K: Eq + Hash> ChainView<'a, K> {
    #[inline]
    fn bucket_mask(&self) -> usize {
        self.buckets.len() - 1
    }

    /// Returns the head of the chain that `key` would be stored in.
    #[inline]
    pub fn chain_head(&self, key: &K) -> i32 {
        self.buckets[bucket_of(key, self.bucket_mask())]
    }

    /// Walks the chain starting at `from` and returns the first slot whose key equals `key`.
    pub fn seek(&self, mut from: i32, key: &K) -> Option<usize> {
        while from != NIL {
            let slot = from as usize;
            if self.keys[slot] == *key {
                return Some(slot);
            }
            from = self.next[slot];
        }
        None
    }

    /// Returns the slot holding `key`.
    ///
    /// For dimensions that allow repeated keys, this is the most recently linked slot with that
    /// key.
    #[inline]
    pub fn find(&self, key: &K) -> Option<usize> {
        self.seek(self.chain_head(key), key)
    }

    /// Starts a walk over all slots holding `key` in a dimension that allows repeated keys.
    ///
    /// Continue the walk with [`next_match`][Self::next_match].
    #[inline]
    pub fn first_match(&self, key: &K) -> Option<usize> {
        self.find(key)
    }

    /// Returns the next slot after `slot` in its chain that holds `key`.
    #[inline]
    pub fn next_match(&self, slot: usize, key: &K) -> Option<usize> {
        self.seek(self.next[slot], key)
    }

    /// Returns an iterator over all linked slots in bucket order.
    pub fn bucket_order(&self) -> BucketOrder<'a> {
        bucket_order(self.next, self.buckets)
    }
}

/// Mutable view of one hash dimension.
#[derive(Debug)]
pub struct ChainViewMut<'a, K> {
    /// Key of each slot.
    pub keys: &'a mut [K],
    /// Chain successor of each slot.
    pub next: &'a mut [i32],
    /// First slot of each bucket chain.
    pub buckets: &'a mut [i32],
}

impl<'a, K: Eq + Hash + Copy> ChainViewMut<'a, K> {
    /// Reborrows this as a shared view.
    pub fn as_view(&self) -> ChainView<'_, K> {
        ChainView {
            keys: &*self.keys,
            next: &*self.next,
            buckets: &*self.buckets,
        }
    }

    #[inline]
    fn bucket_mask(&self) -> usize {
        self.buckets.len() - 1
    }

    /// Empties all buckets and chains.
    pub fn clear(&mut self) {
        self.buckets.fill(NIL);
        self.next.fill(NIL);
    }

    /// Pushes `slot` onto the front of the chain for its current key.
    #[inline]
    pub fn link(&mut self, slot: usize) {
        let bucket = bucket_of(&self.keys[slot], self.bucket_mask());
        self.next[slot] = self.buckets[bucket];
        self.buckets[bucket] = slot as i32;
    }

    /// Stores `key` in `slot` and links the slot.
    ///
    /// The slot must not be linked already.
    #[inline]
    pub fn insert(&mut self, slot: usize, key: K) {
        self.keys[slot] = key;
        self.link(slot);
    }

    /// Removes `slot` from its chain.
    ///
    /// The predecessor is found by walking the chain, so this works for dimensions with repeated
    /// keys. Returns `false` when the slot was not linked. The `next` entry of the unlinked slot is
    /// left unchanged.
    pub fn unlink(&mut self, slot: usize) -> bool {
        let bucket = bucket_of(&self.keys[slot], self.bucket_mask());

        let mut prev = NIL;
        let mut current = self.buckets[bucket];
        while current != NIL {
            if current as usize == slot {
                let successor = self.next[slot];
                if prev == NIL {
                    self.buckets[bucket] = successor;
                } else {
                    self.next[prev as usize] = successor;
                }
                return true;
            }
            prev = current;
            current = self.next[current as usize];
        }
        false
    }

    /// Relinks every slot reachable from `old_buckets` into the current buckets.
    ///
    /// Used after the bucket count changed. The `next` array must still hold the old chains, which
    /// are consumed in the process. Slots not reachable from `old_buckets` keep their `next`
    /// entries, which preserves any free list threaded through them.
    pub fn rehash_from(&mut self, old_buckets: &[i32]) {
        self.buckets.fill(NIL);
        for &head in old_buckets {
            let mut current = head;
            while current != NIL {
                let slot = current as usize;
                current = self.next[slot];
                self.link(slot);
            }
        }
    }

    /// Rebuilds all chains from scratch, linking exactly the given slots.
    pub fn rebuild(&mut self, slots: impl IntoIterator<Item = usize>) {
        self.buckets.fill(NIL);
        for slot in slots {
            self.link(slot);
        }
    }

    /// Removes the keys of slots `start..start + len` from a dense dimension holding `count`
    /// entries by moving the following keys down, then rebuilds all chains.
    pub fn remove_range_shift_down(&mut self, start: usize, len: usize, count: usize) {
        self.keys.copy_within(start + len..count, start);
        let new_count = count - len;
        self.next[new_count..count].fill(NIL);
        self.rebuild(0..new_count);
    }
}

fn bucket_order<'a>(next: &'a [i32], buckets: &'a [i32]) -> BucketOrder<'a> {
    BucketOrder {
        next,
        buckets,
        bucket: 0,
        current: NIL,
    }
}

/// Iterator returned by [`ChainView::bucket_order`].
#[derive(Clone, Debug)]
pub struct BucketOrder<'a> {
    next: &'a [i32],
    buckets: &'a [i32],
    bucket: usize,
    current: i32,
}

impl Iterator for BucketOrder<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        loop {
            if self.current != NIL {
                let slot = self.current as usize;
                self.current = self.next[slot];
                return Some(slot);
            }
            self.current = *self.buckets.get(self.bucket)?;
            self.bucket += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Table {
        keys: Vec<u32>,
        next: Vec<i32>,
        buckets: Vec<i32>,
    }

    impl Table {
        fn new(capacity: usize, buckets: usize) -> Self {
            Self {
                keys: vec![0; capacity],
                next: vec![NIL; capacity],
                buckets: vec![NIL; buckets],
            }
        }

        fn view(&mut self) -> ChainViewMut<'_, u32> {
            ChainViewMut {
                keys: &mut self.keys,
                next: &mut self.next,
                buckets: &mut self.buckets,
            }
        }
    }

    #[test]
    fn insert_find_unlink() {
        // two buckets force collisions
        let mut table = Table::new(8, 2);
        let mut view = table.view();
        for (slot, key) in [10, 11, 12, 13, 14].into_iter().enumerate() {
            view.insert(slot, key);
        }
        for (slot, key) in [10, 11, 12, 13, 14].into_iter().enumerate() {
            assert_eq!(view.as_view().find(&key), Some(slot));
        }
        assert_eq!(view.as_view().find(&15), None);

        assert!(view.unlink(2));
        assert_eq!(view.as_view().find(&12), None);
        assert!(!view.unlink(2));
        for key in [10, 11, 13, 14] {
            assert!(view.as_view().find(&key).is_some());
        }

        let mut order: Vec<usize> = view.as_view().bucket_order().collect();
        order.sort_unstable();
        assert_eq!(order, vec![0, 1, 3, 4]);
    }

    #[test]
    fn repeated_keys_walk_all_matches() {
        let mut table = Table::new(8, 4);
        let mut view = table.view();
        view.insert(0, 7);
        view.insert(1, 8);
        view.insert(2, 7);
        view.insert(3, 7);

        let chain = view.as_view();
        let mut found = vec![];
        let mut current = chain.first_match(&7);
        while let Some(slot) = current {
            found.push(slot);
            current = chain.next_match(slot, &7);
        }
        assert_eq!(found, vec![3, 2, 0]);

        assert!(view.unlink(2));
        assert!(!view.unlink(2));
        let chain = view.as_view();
        assert_eq!(chain.find(&7), Some(3));
        assert_eq!(chain.next_match(3, &7), Some(0));
    }

    #[test]
    fn rehash_into_more_buckets() {
        let mut table = Table::new(4, 2);
        {
            let mut view = table.view();
            for slot in 0..4 {
                view.insert(slot, slot as u32 * 3);
            }
        }
        let old_buckets = table.buckets.clone();
        table.buckets = vec![NIL; 16];
        let mut view = table.view();
        view.rehash_from(&old_buckets);
        for slot in 0..4 {
            assert_eq!(view.as_view().find(&(slot as u32 * 3)), Some(slot));
        }
        assert_eq!(view.as_view().bucket_order().count(), 4);
    }

    #[test]
    fn shift_down_keeps_remaining_keys() {
        let mut table = Table::new(8, 16);
        let mut view = table.view();
        for slot in 0..6 {
            view.insert(slot, 100 + slot as u32);
        }
        view.remove_range_shift_down(1, 2, 6);
        assert_eq!(&view.keys[..4], &[100, 103, 104, 105]);
        for (slot, key) in [100, 103, 104, 105].into_iter().enumerate() {
            assert_eq!(view.as_view().find(&key), Some(slot));
        }
        assert_eq!(view.as_view().find(&101), None);
        assert_eq!(&view.next[4..6], &[NIL, NIL]);
    }
}
