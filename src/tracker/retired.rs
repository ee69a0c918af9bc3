//! Record types for retired objects awaiting their safety proof.
//!
//! Every scheme keeps per-thread `Vec`s of these records and sweeps them
//! during its *empty* phase: records whose safety predicate holds are freed
//! in place, the rest are retained for the next attempt.

use core::ptr::NonNull;

////////////////////////////////////////////////////////////////////////////////////////////////////
// record types
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A retired object of a pointer-based scheme (no epoch information).
#[derive(Debug)]
pub(crate) struct Retired<T> {
    pub ptr: NonNull<T>,
}

/// A retired object stamped with the epoch current at retirement.
#[derive(Debug)]
pub(crate) struct RetiredEpoch<T> {
    pub ptr: NonNull<T>,
    pub epoch: u64,
}

/// A retired object carrying its full lifetime interval.
#[derive(Debug)]
pub(crate) struct RetiredInterval<T> {
    pub ptr: NonNull<T>,
    pub birth_epoch: u64,
    pub retire_epoch: u64,
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// sweep
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Sweeps `trash`, freeing every record for which `is_unsafe` returns
/// `false` and retaining the rest. Returns the number of freed records.
#[inline]
pub(crate) fn sweep<R>(
    trash: &mut Vec<R>,
    mut is_unsafe: impl FnMut(&R) -> bool,
    mut free: impl FnMut(&R),
) -> u64 {
    let before = trash.len();
    trash.retain(|record| {
        if is_unsafe(record) {
            true
        } else {
            free(record);
            false
        }
    });

    (before - trash.len()) as u64
}
