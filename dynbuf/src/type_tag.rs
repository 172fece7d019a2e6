//! Runtime type identities for values stored without static types.
use std::{
    any::{type_name, TypeId},
    fmt,
    mem::{align_of, size_of},
};

use bytemuck::{Pod, Zeroable};
use dynbuf_util::hash::{fold_to_u32, hash_value};

use crate::host::BUFFER_ALIGN;

/// A 32-bit identity of a Rust type, stored next to every untyped value.
///
/// Tags are derived from [`TypeId`] and are only meaningful within one build of a program. Two
/// distinct types may in principle share a tag, so typed access checks the stored size as well.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Pod, Zeroable)]
#[repr(transparent)]
pub struct TypeTag(u32);

impl TypeTag {
    /// Returns the tag of `T`.
    pub fn of<T: 'static>() -> Self {
        Self(fold_to_u32(hash_value(TypeId::of::<T>())))
    }
}

impl fmt::Debug for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeTag({:08x})", self.0)
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// Panics unless `T` can be stored as an untyped value.
pub(crate) fn assert_storable<T: Pod>() {
    assert!(
        align_of::<T>() <= BUFFER_ALIGN,
        "type {} has alignment {}, at most {BUFFER_ALIGN} is supported",
        type_name::<T>(),
        align_of::<T>(),
    );
    assert!(
        size_of::<T>() > 0,
        "zero sized type {} cannot be stored",
        type_name::<T>(),
    );
}

/// Panics unless `bytes` can be stored as an untyped value.
pub(crate) fn assert_storable_bytes(bytes: &[u8]) {
    assert!(!bytes.is_empty(), "an empty value cannot be stored");
}

/// Panics unless the value stored at `index` with `tag` and `size` has type `T`.
pub(crate) fn check_type<T: 'static>(tag: TypeTag, size: usize, index: impl fmt::Display) {
    assert!(
        tag == TypeTag::of::<T>() && size == size_of::<T>(),
        "type mismatch at {index}: stored value has tag {tag} and size {size}, accessed as {} \
        with size {}",
        type_name::<T>(),
        size_of::<T>(),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_distinguish_types() {
        assert_eq!(TypeTag::of::<u32>(), TypeTag::of::<u32>());
        assert_ne!(TypeTag::of::<u32>(), TypeTag::of::<i32>());
        assert_ne!(TypeTag::of::<[f32; 3]>(), TypeTag::of::<[u32; 3]>());
    }

    #[test]
    fn check_type_accepts_matching_type() {
        check_type::<u64>(TypeTag::of::<u64>(), 8, "slot 0");
    }

    #[test]
    #[should_panic(expected = "type mismatch")]
    fn check_type_rejects_other_type() {
        check_type::<f32>(TypeTag::of::<u32>(), 4, "slot 0");
    }
}
