//! Free slot list threaded through a `next` array.
//!
//! Removed slots of the indexed maps are kept in a LIFO list that reuses the key dimension's
//! `next` array for its links, so removal does not need any extra storage.
use crate::layout::NIL;

/// Mutable access to a free list whose head is stored in a container header.
#[derive(Debug)]
pub struct FreeList<'a> {
    /// First free slot, or [`NIL`].
    pub head: &'a mut i32,
    /// Link array shared with a key dimension.
    pub next: &'a mut [i32],
}

impl FreeList<'_> {
    /// Returns `true` when no slot is free.
    #[inline]
    pub fn is_empty(&self) -> bool {
        *self.head == NIL
    }

    /// Adds `slot` to the list.
    ///
    /// The slot must not be linked into any chain that uses the same `next` array.
    #[inline]
    pub fn push(&mut self, slot: usize) {
        self.next[slot] = *self.head;
        *self.head = slot as i32;
    }

    /// Takes the most recently freed slot.
    #[inline]
    pub fn pop(&mut self) -> Option<usize> {
        if self.is_empty() {
            return None;
        }
        let slot = *self.head as usize;
        *self.head = self.next[slot];
        self.next[slot] = NIL;
        Some(slot)
    }

    /// Returns the number of free slots by walking the list.
    pub fn count(&self) -> usize {
        let mut count = 0;
        let mut current = *self.head;
        while current != NIL {
            count += 1;
            current = self.next[current as usize];
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_freed_is_reused_first() {
        let mut head = NIL;
        let mut next = vec![NIL; 4];
        let mut list = FreeList {
            head: &mut head,
            next: &mut next,
        };
        assert!(list.is_empty());
        list.push(1);
        list.push(3);
        assert_eq!(list.count(), 2);
        assert_eq!(list.pop(), Some(3));
        assert_eq!(list.pop(), Some(1));
        assert_eq!(list.pop(), None);
        assert_eq!(head, NIL);
    }
}
