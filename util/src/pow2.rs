//! Power-of-two and alignment arithmetic.

/// Returns the smallest power of two that is `>= value`, treating `0` as `1`.
///
/// Returns `None` on overflow.
#[inline]
pub fn ceil_pow2(value: usize) -> Option<usize> {
    value.max(1).checked_next_power_of_two()
}

/// Returns `ceil(log2(value))`, treating `0` as `1`.
#[inline]
pub fn ceil_log2(value: usize) -> u32 {
    let value = value.max(1);
    usize::BITS - (value - 1).leading_zeros()
}

/// Rounds `value` up to the next multiple of `align`, which must be a power of two.
///
/// Returns `None` on overflow.
#[inline]
pub fn align_up(value: usize, align: usize) -> Option<usize> {
    debug_assert!(align.is_power_of_two());
    Some(value.checked_add(align - 1)? & !(align - 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ceil_pow2_rounds_up() {
        assert_eq!(ceil_pow2(0), Some(1));
        assert_eq!(ceil_pow2(1), Some(1));
        assert_eq!(ceil_pow2(3), Some(4));
        assert_eq!(ceil_pow2(256), Some(256));
        assert_eq!(ceil_pow2(257), Some(512));
        assert_eq!(ceil_pow2(usize::MAX), None);
    }

    #[test]
    fn ceil_log2_matches_pow2() {
        assert_eq!(ceil_log2(0), 0);
        assert_eq!(ceil_log2(1), 0);
        assert_eq!(ceil_log2(2), 1);
        assert_eq!(ceil_log2(3), 2);
        assert_eq!(ceil_log2(256), 8);
        assert_eq!(ceil_log2(257), 9);
    }

    #[test]
    fn align_up_rounds_to_multiple() {
        assert_eq!(align_up(0, 16), Some(0));
        assert_eq!(align_up(1, 16), Some(16));
        assert_eq!(align_up(12, 4), Some(12));
        assert_eq!(align_up(13, 8), Some(16));
        assert_eq!(align_up(usize::MAX, 16), None);
    }
}
