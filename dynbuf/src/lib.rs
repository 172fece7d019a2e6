//! Relocatable buffer containers - Type-erased hash maps and sequences in a growable byte buffer
//!
//! Every container in this crate lives entirely inside one [`GrowableBuffer`]: a header followed
//! by parallel arrays and an optional value arena, laid out by the [`layout`] module. The buffer
//! may move whenever a container grows, so container handles never cache views into it. Instead
//! each handle borrows the buffer and re-derives its views on every call, which lets the borrow
//! checker reject any reference held across a growing operation.
//!
//! The containers are
//!
//! * [`UntypedHashMap`], mapping keys to values of arbitrary [`Pod`](bytemuck::Pod) types checked
//!   by a per-slot [`TypeTag`],
//! * [`IndexedMap`] and [`Indexed2Map`], mapping unique keys to values with one or two
//!   non-unique secondary indices, and
//! * [`UntypedSeq`], an append-only sequence of values of arbitrary types.
//!
//! Misuse, such as reading a value as the wrong type, panics. Failing to grow the host buffer is
//! reported as a [`StorageError`].
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(clippy::undocumented_unsafe_blocks)]
#![warn(missing_docs)]

pub mod chain;
pub mod config;
pub mod error;
pub mod free_list;
pub mod host;
pub mod indexed2_map;
pub mod indexed_map;
pub mod layout;
pub mod row_table;
pub mod type_tag;
pub mod untyped_map;
pub mod untyped_seq;
pub mod value_store;

pub use config::{ContainerConfig, DEFAULT_MIN_GROWTH};
pub use error::{Result, StorageError};
pub use host::{AlignedBuffer, GrowableBuffer};
pub use indexed2_map::{Indexed2Entry, Indexed2Map};
pub use indexed_map::{IndexedEntry, IndexedMap};
pub use row_table::IndexCursor;
pub use type_tag::TypeTag;
pub use untyped_map::UntypedHashMap;
pub use untyped_seq::UntypedSeq;
