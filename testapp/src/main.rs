#![allow(missing_docs)]

use std::time::Instant;

use clap::{Parser, ValueEnum};
use color_eyre::eyre::{ensure, eyre};
use dynbuf::{
    AlignedBuffer, ContainerConfig, GrowableBuffer, Indexed2Map, IndexedMap, TypeTag,
    UntypedHashMap, UntypedSeq,
};
use dynbuf_util::hash::BuildHasherDefaultZwo;
use hashbrown::HashMap;
use rand::{rngs::SmallRng, Rng, SeedableRng};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Container {
    UntypedMap,
    IndexedMap,
    Indexed2Map,
    Seq,
    All,
}

/// Runs randomized workloads against the containers and cross-checks them with std collections.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Number of operations per workload.
    #[arg(long, default_value_t = 100_000)]
    ops: usize,
    /// Seed for the operation generator.
    #[arg(long, default_value_t = 0)]
    seed: u64,
    /// Minimal growth step of the containers.
    #[arg(long, default_value_t = dynbuf::DEFAULT_MIN_GROWTH)]
    min_growth: usize,
    /// Range of keys used by the workloads.
    #[arg(long, default_value_t = 10_000)]
    keys: u32,
    /// Which container to exercise.
    #[arg(long, value_enum, default_value_t = Container::All)]
    container: Container,
}

type Model<K, V> = HashMap<K, V, BuildHasherDefaultZwo>;

/// Runs one workload and returns the final size of its host buffer.
type Workload = fn(&Args, ContainerConfig, &mut SmallRng) -> color_eyre::Result<usize>;

fn main() -> color_eyre::Result<()> {
    let args = Args::parse();

    color_eyre::install()?;
    dynbuf_logger::setup();

    ensure!(args.keys > 0, "--keys must be positive");

    let config = ContainerConfig::new().with_min_growth(args.min_growth);
    let mut rng = SmallRng::seed_from_u64(args.seed);

    let workloads: [(Container, Workload); 4] = [
        (Container::UntypedMap, untyped_map_workload),
        (Container::IndexedMap, indexed_map_workload),
        (Container::Indexed2Map, indexed2_map_workload),
        (Container::Seq, seq_workload),
    ];

    for (container, workload) in workloads {
        if args.container != Container::All && args.container != container {
            continue;
        }
        let start = Instant::now();
        let buffer_len = workload(&args, config, &mut rng)?;
        log::info!(
            "{container:?}: {} ops in {:.2?}, final buffer {buffer_len} bytes",
            args.ops,
            start.elapsed()
        );
    }

    Ok(())
}

fn untyped_map_workload(
    args: &Args,
    config: ContainerConfig,
    rng: &mut SmallRng,
) -> color_eyre::Result<usize> {
    let mut buffer = AlignedBuffer::new();
    let mut model: Model<u32, (TypeTag, Vec<u8>)> = Model::default();
    UntypedHashMap::<u32, _>::init(&mut buffer, config)?;

    for _ in 0..args.ops {
        let key = rng.gen_range(0..args.keys);
        let mut map = UntypedHashMap::<u32, _>::open(&mut buffer);
        let stored_tag = model.get(&key).map(|(tag, _)| *tag);
        match (rng.gen_range(0..4), stored_tag) {
            (0, Some(tag)) if tag == TypeTag::of::<u64>() => {
                let value: u64 = rng.gen();
                map.add_or_set(key, value)?;
                model.insert(key, (tag, value.to_ne_bytes().to_vec()));
            }
            (1, Some(tag)) => {
                let mut bytes = model.get(&key).map(|(_, bytes)| bytes.clone()).unwrap_or_default();
                rng.fill(bytes.as_mut_slice());
                map.add_or_set_bytes(key, tag, &bytes)?;
                model.insert(key, (tag, bytes));
            }
            (0 | 1, None) => {
                if rng.gen() {
                    let value: u64 = rng.gen();
                    map.add(key, value)?;
                    model.insert(key, (TypeTag::of::<u64>(), value.to_ne_bytes().to_vec()));
                } else {
                    let value: [u16; 3] = rng.gen();
                    map.add(key, value)?;
                    let bytes = bytemuck::bytes_of(&value).to_vec();
                    model.insert(key, (TypeTag::of::<[u16; 3]>(), bytes));
                }
            }
            _ => {
                let found = map.try_get_bytes(&key);
                let expected = model.get(&key);
                let agrees = match (found, expected) {
                    (Some((tag, bytes)), Some((expected_tag, expected_bytes))) => {
                        tag == *expected_tag && bytes == expected_bytes.as_slice()
                    }
                    (None, None) => true,
                    _ => false,
                };
                ensure!(agrees, "untyped map disagrees on key {key}");
            }
        }
    }

    let map = UntypedHashMap::<u32, _>::open(&mut buffer);
    ensure!(map.len() == model.len(), "untyped map lost entries");
    log::debug!(
        "untyped map: {} entries, {} slots, {} of {} arena words",
        map.len(),
        map.capacity(),
        map.data_len(),
        map.data_capacity()
    );
    Ok(buffer.len())
}

fn indexed_map_workload(
    args: &Args,
    config: ContainerConfig,
    rng: &mut SmallRng,
) -> color_eyre::Result<usize> {
    let mut buffer = AlignedBuffer::new();
    let mut model: Model<u32, (u32, u64)> = Model::default();
    let index_range = (args.keys / 16).max(1);
    let mut map = IndexedMap::<u32, u32, u64, _>::init(&mut buffer, config)?;

    for step in 0..args.ops {
        let key = rng.gen_range(0..args.keys);
        match rng.gen_range(0..8) {
            0..=3 => {
                let (index, value) = (rng.gen_range(0..index_range), rng.gen());
                if map.try_add(key, index, value)? {
                    model.insert(key, (index, value));
                }
            }
            4 | 5 => {
                ensure!(
                    map.remove(&key) == model.remove(&key).is_some(),
                    "indexed map disagrees on removal of {key}"
                );
            }
            6 => {
                let index = rng.gen_range(0..index_range);
                let mut found: Vec<u64> = map.values_for_index(index).collect();
                let mut expected: Vec<u64> = model
                    .values()
                    .filter(|row| row.0 == index)
                    .map(|row| row.1)
                    .collect();
                found.sort_unstable();
                expected.sort_unstable();
                ensure!(found == expected, "indexed map disagrees on index {index}");
            }
            _ => {
                ensure!(
                    map.try_get_value(&key) == model.get(&key).copied(),
                    "indexed map disagrees on key {key}"
                );
            }
        }
        if step % 10_000 == 9_999 {
            map.flatten()?;
        }
    }

    ensure!(map.len() == model.len(), "indexed map lost rows");
    log::debug!(
        "indexed map: {} rows, {} slots, holes: {}",
        map.len(),
        map.capacity(),
        map.has_holes()
    );
    drop(map);
    Ok(buffer.len())
}

fn indexed2_map_workload(
    args: &Args,
    config: ContainerConfig,
    rng: &mut SmallRng,
) -> color_eyre::Result<usize> {
    let mut buffer = AlignedBuffer::new();
    let mut model: Model<u32, (u16, u16, u32)> = Model::default();
    let mut map = Indexed2Map::<u32, u16, u16, u32, _>::init(&mut buffer, config)?;

    for _ in 0..args.ops {
        let key = rng.gen_range(0..args.keys);
        match rng.gen_range(0..8) {
            0..=3 => {
                let row = (rng.gen_range(0..64), rng.gen_range(0..8), rng.gen());
                if map.try_add(key, row.0, row.1, row.2)? {
                    model.insert(key, row);
                }
            }
            4 | 5 => {
                ensure!(
                    map.remove(&key) == model.remove(&key).is_some(),
                    "indexed2 map disagrees on removal of {key}"
                );
            }
            6 => {
                let index2 = rng.gen_range(0..8);
                let found = map.values_for_index2(index2).count();
                let expected = model.values().filter(|row| row.1 == index2).count();
                ensure!(found == expected, "indexed2 map disagrees on index2 {index2}");
            }
            _ => {
                ensure!(
                    map.try_get_value(&key) == model.get(&key).copied(),
                    "indexed2 map disagrees on key {key}"
                );
            }
        }
    }

    ensure!(map.len() == model.len(), "indexed2 map lost rows");
    drop(map);
    Ok(buffer.len())
}

fn seq_workload(
    args: &Args,
    config: ContainerConfig,
    rng: &mut SmallRng,
) -> color_eyre::Result<usize> {
    let mut buffer = AlignedBuffer::new();
    let mut model: Vec<(TypeTag, Vec<u8>)> = vec![];
    let mut seq = UntypedSeq::init(&mut buffer, config)?;
    let limit = args.keys as usize;

    for _ in 0..args.ops {
        if model.len() >= limit || (!model.is_empty() && rng.gen_range(0..3) == 0) {
            let index = rng.gen_range(0..model.len());
            seq.remove_at(index);
            model.remove(index);
            continue;
        }
        match rng.gen_range(0..3) {
            0 => {
                let value: u8 = rng.gen();
                seq.add(value)?;
                model.push((TypeTag::of::<u8>(), vec![value]));
            }
            1 => {
                let value: [u32; 3] = rng.gen();
                seq.add(value)?;
                model.push((TypeTag::of::<[u32; 3]>(), bytemuck::bytes_of(&value).to_vec()));
            }
            _ => {
                let value: u64 = rng.gen();
                seq.add(value)?;
                model.push((TypeTag::of::<u64>(), value.to_ne_bytes().to_vec()));
            }
        }
    }

    ensure!(seq.len() == model.len(), "sequence lost elements");
    for (index, (tag, bytes)) in model.iter().enumerate() {
        let (found_tag, found_bytes) = seq.bytes_at(index);
        if found_tag != *tag || found_bytes != bytes.as_slice() {
            return Err(eyre!("sequence disagrees at index {index}"));
        }
    }
    log::debug!(
        "sequence: {} elements, {} of {} arena bytes",
        seq.len(),
        seq.data_len(),
        seq.data_capacity()
    );
    drop(seq);
    Ok(buffer.len())
}
