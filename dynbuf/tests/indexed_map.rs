#![allow(missing_docs)] // test only
use dynbuf::{
    AlignedBuffer, ContainerConfig, GrowableBuffer, IndexedEntry, IndexedMap, UntypedSeq,
};
use dynbuf_util::hash::BuildHasherDefaultZwo;
use hashbrown::HashMap;
use rand::{rngs::SmallRng, Rng, SeedableRng};

type Map<'a> = IndexedMap<'a, u32, u16, u64, AlignedBuffer>;

struct TestIndexedMap {
    buffer: AlignedBuffer,
    spec: HashMap<u32, (u16, u64), BuildHasherDefaultZwo>,
}

impl TestIndexedMap {
    fn new(config: ContainerConfig) -> Self {
        let mut buffer = AlignedBuffer::new();
        Map::init(&mut buffer, config).unwrap();
        Self {
            buffer,
            spec: HashMap::default(),
        }
    }

    fn map(&mut self) -> Map<'_> {
        Map::open(&mut self.buffer)
    }

    fn try_add(&mut self, key: u32, index: u16, value: u64) {
        let added = Map::open(&mut self.buffer)
            .try_add(key, index, value)
            .unwrap();
        assert_eq!(added, !self.spec.contains_key(&key));
        self.spec.entry(key).or_insert((index, value));
    }

    fn remove(&mut self, key: u32) {
        let removed = Map::open(&mut self.buffer).remove(&key);
        assert_eq!(removed, self.spec.remove(&key).is_some());
    }

    fn update(&mut self, key: u32, value: u64) {
        let mut map = Map::open(&mut self.buffer);
        if let Some(stored) = map.get_value_mut(&key) {
            *stored = value;
        }
        if let Some(expected) = self.spec.get_mut(&key) {
            expected.1 = value;
        }
    }

    fn check_index(&mut self, index: u16) {
        let map = Map::open(&mut self.buffer);
        let mut found: Vec<u64> = map.values_for_index(index).collect();
        let mut walked = vec![];
        if let Some((first, mut cursor)) = map.try_get_first_value(index) {
            assert_eq!(*cursor.index(), index);
            walked.push(first);
            while let Some(entry) = map.try_get_next_value(&mut cursor) {
                assert_eq!(cursor.slot(), Some(entry.slot));
                walked.push(entry);
            }
        }
        assert_eq!(walked, map.entries_for_index(index).collect::<Vec<_>>());
        for entry in &walked {
            assert_eq!(entry.index, index);
            assert_eq!(self.spec.get(&entry.key), Some(&(entry.index, entry.value)));
        }
        let walked: Vec<u64> = walked.iter().map(|entry| entry.value).collect();
        assert_eq!(found, walked);

        let mut expected: Vec<u64> = self
            .spec
            .values()
            .filter(|row| row.0 == index)
            .map(|row| row.1)
            .collect();
        found.sort_unstable();
        expected.sort_unstable();
        assert_eq!(found, expected);
    }

    fn check_all(&mut self) {
        let map = Map::open(&mut self.buffer);
        assert_eq!(map.len(), self.spec.len());
        assert!(map.allocated_index() <= map.capacity());
        for (key, row) in &self.spec {
            assert_eq!(map.try_get_value(key), Some(*row));
        }
        let mut rows = 0;
        for entry in map.iter() {
            assert_eq!(self.spec.get(&entry.key), Some(&(entry.index, entry.value)));
            assert_eq!(map.entry_at(entry.slot), Some(entry));
            assert_eq!(map.find(&entry.key), Some(entry.slot));
            rows += 1;
        }
        assert_eq!(rows, self.spec.len());
    }
}

#[test]
fn test_random_workload() {
    for seed in 0..4 {
        let mut rng = SmallRng::seed_from_u64(seed);
        let mut map = TestIndexedMap::new(ContainerConfig::new().with_min_growth(4));
        for step in 0..4000 {
            let key = rng.gen_range(0..400);
            match rng.gen_range(0..10) {
                0..=4 => map.try_add(key, rng.gen_range(0..16), rng.gen()),
                5..=6 => map.remove(key),
                7 => map.update(key, rng.gen()),
                _ => map.check_index(rng.gen_range(0..16)),
            }
            if step % 1000 == 999 {
                map.check_all();
                map.map().flatten().unwrap();
                assert!(!map.map().has_holes());
                map.check_all();
            }
        }
    }
}

#[test]
fn test_remove_then_reuse_slot() {
    let mut buffer = AlignedBuffer::new();
    let mut map = Map::init(&mut buffer, ContainerConfig::new().with_min_growth(4)).unwrap();
    for key in 0..4 {
        assert_eq!(map.add(key, 1, key as u64).unwrap(), key as usize);
    }
    assert!(map.remove(&2));
    assert!(map.remove(&0));
    assert!(map.has_holes());
    assert_eq!(map.values_for_index(1).count(), 2);

    // the most recently freed slot comes back first
    assert_eq!(map.add(10, 2, 10).unwrap(), 0);
    assert_eq!(map.add(11, 2, 11).unwrap(), 2);
    assert!(!map.has_holes());
    assert_eq!(map.capacity(), 4);
    assert_eq!(map.add(12, 2, 12).unwrap(), 4);
    assert_eq!(map.capacity(), 8);

    let mut by_index: Vec<u64> = map.values_for_index(2).collect();
    by_index.sort_unstable();
    assert_eq!(by_index, vec![10, 11, 12]);
}

#[test]
fn test_flatten_renumbers_in_iteration_order() {
    let mut buffer = AlignedBuffer::new();
    let mut map = Map::init(&mut buffer, ContainerConfig::new().with_min_growth(4)).unwrap();
    for key in 0..32u32 {
        map.add(key * 7, (key % 3) as u16, key as u64).unwrap();
    }
    for key in 0..24u32 {
        map.remove(&(key * 7));
    }
    let rows: Vec<IndexedEntry<u32, u16, u64>> = map.iter().collect();
    assert_eq!(rows.len(), 8);

    map.flatten().unwrap();
    assert_eq!(map.capacity(), 8);
    assert_eq!(map.allocated_index(), 8);
    for (slot, row) in rows.iter().enumerate() {
        assert_eq!(
            map.entry_at(slot),
            Some(IndexedEntry {
                slot,
                ..*row
            })
        );
    }
    assert_eq!(map.values_for_index(0).count(), 3);
}

#[test]
fn test_shift_down() {
    let mut buffer = AlignedBuffer::new();
    let mut map = Map::init(&mut buffer, ContainerConfig::new()).unwrap();
    for key in 0..8u32 {
        map.add(key + 100, (key % 2) as u16, key as u64).unwrap();
    }
    map.remove_range_shift_down(0, 2);
    map.remove_range_shift_down(4, 2);
    map.remove_range_shift_down(1, 0);
    assert_eq!(map.len(), 4);

    let keys: Vec<u32> = (0..map.len())
        .map(|slot| map.entry_at(slot).unwrap().key)
        .collect();
    assert_eq!(keys, vec![102, 103, 104, 105]);
    for key in [100, 101, 106, 107] {
        assert!(!map.contains_key(&key));
    }
    let mut odd: Vec<u64> = map.values_for_index(1).collect();
    odd.sort_unstable();
    assert_eq!(odd, vec![3, 5]);
    assert_eq!(map.entry_at(4), None);
}

#[test]
fn test_set_capacity_keeps_rows() {
    let mut buffer = AlignedBuffer::new();
    let mut map = Map::init(&mut buffer, ContainerConfig::new().with_min_growth(4)).unwrap();
    for key in 0..6u32 {
        map.add(key, 0, key as u64).unwrap();
    }
    map.set_capacity(100).unwrap();
    assert!(map.capacity() >= 100);
    let capacity = map.capacity();
    map.set_capacity(10).unwrap();
    assert_eq!(map.capacity(), capacity);
    for key in 0..6u32 {
        assert_eq!(map.try_get_value(&key), Some((0, key as u64)));
    }
    assert_eq!(map.values_for_index(0).count(), 6);
}

#[test]
fn test_dispose_and_reinit() {
    let mut buffer = AlignedBuffer::new();
    let mut map = Map::init(&mut buffer, ContainerConfig::new()).unwrap();
    map.add(1, 1, 1).unwrap();
    map.dispose().unwrap();
    assert!(buffer.is_empty());
    let map = Map::init(&mut buffer, ContainerConfig::new()).unwrap();
    assert!(map.is_empty());
}

#[test]
#[should_panic(expected = "buffer does not hold an indexed map")]
fn test_open_sequence_as_map() {
    let mut buffer = AlignedBuffer::new();
    UntypedSeq::init(&mut buffer, ContainerConfig::new()).unwrap();
    Map::open(&mut buffer);
}

#[test]
#[should_panic(expected = "an item with the same key has already been added")]
fn test_duplicate_add() {
    let mut buffer = AlignedBuffer::new();
    let mut map = Map::init(&mut buffer, ContainerConfig::new()).unwrap();
    map.add(5, 0, 0).unwrap();
    map.add(5, 0, 0).unwrap();
}

#[test]
#[should_panic(expected = "flatten it first")]
fn test_shift_down_with_holes() {
    let mut buffer = AlignedBuffer::new();
    let mut map = Map::init(&mut buffer, ContainerConfig::new()).unwrap();
    map.add(0, 0, 0).unwrap();
    map.add(1, 0, 0).unwrap();
    map.remove(&0);
    map.remove_range_shift_down(1, 1);
}
