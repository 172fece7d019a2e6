//! Utilities for computing hashes.
use std::hash::{BuildHasher, BuildHasherDefault};

use zwohash::ZwoHasher;

/// The default [`BuildHasher`] used by all buffer containers.
pub type BuildHasherDefaultZwo = BuildHasherDefault<ZwoHasher>;

/// Computes the hash of a value using the default hasher.
#[inline]
pub fn hash_value<T: std::hash::Hash>(value: T) -> u64 {
    BuildHasherDefaultZwo::default().hash_one(value)
}

/// Computes the hash of a reference using the default hasher.
///
/// This forwards to [`hash_value`]. Restricting the argument to be a reference is occasionally
/// useful for type inference or for avoiding warnings.
#[inline]
pub fn hash_ref<T: std::hash::Hash>(value: &T) -> u64 {
    hash_value(value)
}

/// Folds a 64-bit hash into 32 bits, keeping entropy from both halves.
#[inline]
pub fn fold_to_u32(hash: u64) -> u32 {
    (hash ^ (hash >> 32)) as u32
}
