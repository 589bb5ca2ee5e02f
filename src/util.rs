//! Small helpers shared by the ring and pool hot paths.

#[cold]
#[inline(never)]
fn cold_path() {}

/// Branch hint for conditions that hold on the fast path.
#[inline(always)]
pub fn likely(condition: bool) -> bool {
    if !condition {
        cold_path();
    }
    condition
}

/// Branch hint for error and exhaustion checks.
#[inline(always)]
pub fn unlikely(condition: bool) -> bool {
    if condition {
        cold_path();
    }
    condition
}

/// Rounds `value` up to a multiple of `alignment`, a power of two.
#[inline]
pub fn align_up(value: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}
