//! Construction parameters shared by all containers.

use dynbuf_util::pow2::ceil_log2;

/// Default minimal growth step, in slots for the hash tables and in arena units for the value
/// arenas.
pub const DEFAULT_MIN_GROWTH: usize = 256;

/// Initial capacities and growth policy used when materializing a container in an empty buffer.
///
/// All values are rounded: capacities up to a power of two no smaller than `min_growth`, and
/// `min_growth` itself up to a power of two.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ContainerConfig {
    /// Initial number of slots.
    pub capacity: usize,
    /// Initial arena size, for containers that have an arena.
    ///
    /// The untyped hash map counts this in 4-byte words, the sequence buffer in bytes.
    pub data_capacity: usize,
    /// Minimal number of slots (or arena units) added whenever the container grows.
    pub min_growth: usize,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            capacity: 0,
            data_capacity: 0,
            min_growth: DEFAULT_MIN_GROWTH,
        }
    }
}

impl ContainerConfig {
    /// Returns the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the initial number of slots.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Sets the initial arena size.
    pub fn with_data_capacity(mut self, data_capacity: usize) -> Self {
        self.data_capacity = data_capacity;
        self
    }

    /// Sets the minimal growth step.
    pub fn with_min_growth(mut self, min_growth: usize) -> Self {
        self.min_growth = min_growth;
        self
    }

    /// Returns `ceil(log2(min_growth))`, the form in which the growth step is stored in headers.
    pub fn log2_min_growth(&self) -> u32 {
        ceil_log2(self.min_growth)
    }
}
