//! The hazard pointer scheme.
//!
//! Every thread owns a small fixed number of slots in a shared table of
//! atomic pointers. A safe load publishes the (untagged) pointer in one of
//! the caller's slots and re-loads the source until both loads agree, which
//! proves the reservation was visible before the pointer could have been
//! retired. A retired record may be freed once a scan of the entire table
//! finds no slot referencing it.

use core::ptr::{self, NonNull};
use core::sync::atomic::{
    fence, AtomicPtr,
    Ordering::{Acquire, Relaxed, Release, SeqCst},
};

use crate::primitives::{unmarked, Padded, PerThread};
use crate::tracker::block::Block;
use crate::tracker::retired::{sweep, Retired};
use crate::tracker::{RetiredCounts, Tracker};

////////////////////////////////////////////////////////////////////////////////////////////////////
// HazardTracker
////////////////////////////////////////////////////////////////////////////////////////////////////

pub(crate) struct HazardTracker<T> {
    slots_per_thread: usize,
    empty_freq: u64,
    collect: bool,
    /// The `task_num * slots_per_thread` slot table.
    slots: Box<[Padded<AtomicPtr<T>>]>,
    cntrs: PerThread<u64>,
    retired: PerThread<Vec<Retired<T>>>,
    counts: RetiredCounts,
}

/********** impl Send + Sync **********************************************************************/

unsafe impl<T: Send> Send for HazardTracker<T> {}
unsafe impl<T: Send> Sync for HazardTracker<T> {}

/********** impl inherent *************************************************************************/

impl<T> HazardTracker<T> {
    #[inline]
    pub fn new(task_num: usize, slots_per_thread: usize, empty_freq: u64, collect: bool) -> Self {
        Self {
            slots_per_thread,
            empty_freq,
            collect,
            slots: (0..task_num * slots_per_thread)
                .map(|_| Padded::new(AtomicPtr::new(ptr::null_mut())))
                .collect(),
            cntrs: PerThread::new(task_num, || 0),
            retired: PerThread::new(task_num, Vec::new),
            counts: RetiredCounts::new(task_num),
        }
    }

    #[inline]
    fn slot(&self, idx: usize, tid: usize) -> &AtomicPtr<T> {
        &self.slots[tid * self.slots_per_thread + idx]
    }

    /// Returns `true` if any slot in the table references `ptr`.
    #[inline]
    fn is_protected(&self, ptr: *mut T) -> bool {
        self.slots.iter().any(|slot| slot.load(Relaxed) == ptr)
    }

    /// Frees every retiree of `tid` that no slot references.
    fn empty(&self, tid: usize) {
        // (HAZ:1) this `SeqCst` fence synchronizes-with the `SeqCst` slot
        // stores (HAZ:2); all reservations published before the fence are
        // visible to the scan below
        fence(SeqCst);

        let trash = unsafe { self.retired.get(tid) };
        let freed = sweep(
            trash,
            |retired| self.is_protected(retired.ptr.as_ptr()),
            |retired| unsafe { Block::reclaim(retired.ptr) },
        );
        self.counts.sub(tid, freed);
    }
}

/********** impl Tracker **************************************************************************/

impl<T> Tracker<T> for HazardTracker<T> {
    #[inline]
    fn counts(&self) -> &RetiredCounts {
        &self.counts
    }

    #[inline]
    fn read(&self, src: &AtomicPtr<T>, idx: usize, tid: usize) -> *mut T {
        loop {
            let ptr = src.load(Acquire);
            self.reserve(unmarked(ptr), idx, tid);
            if src.load(Acquire) == ptr {
                // the tagged pointer is returned, the untagged one reserved
                return ptr;
            }
        }
    }

    #[inline]
    fn reserve(&self, ptr: *mut T, idx: usize, tid: usize) {
        // (HAZ:2) this `SeqCst` store synchronizes-with the fence (HAZ:1)
        self.slot(idx, tid).store(ptr, SeqCst);
    }

    #[inline]
    fn release(&self, idx: usize, tid: usize) {
        self.slot(idx, tid).store(ptr::null_mut(), Release);
    }

    #[inline]
    fn clear_all(&self, tid: usize) {
        for idx in 0..self.slots_per_thread {
            self.slot(idx, tid).store(ptr::null_mut(), Release);
        }
    }

    unsafe fn retire(&self, obj: NonNull<T>, tid: usize) {
        self.retired.get(tid).push(Retired { ptr: obj });

        let cntr = self.cntrs.get(tid);
        *cntr += 1;
        if self.collect && *cntr == self.empty_freq {
            *cntr = 0;
            self.empty(tid);
        }
    }

    #[inline]
    fn retired_count(&self, tid: usize) -> usize {
        unsafe { self.retired.get(tid).len() }
    }

    #[inline]
    fn check_reservation(&self, ptr: *mut T, idx: usize, tid: usize) -> bool {
        self.slot(idx, tid).load(Acquire) == ptr
    }
}

/********** impl Drop *****************************************************************************/

impl<T> Drop for HazardTracker<T> {
    fn drop(&mut self) {
        for trash in self.retired.iter_mut() {
            for retired in trash.drain(..) {
                unsafe { Block::reclaim(retired.ptr) };
            }
        }
    }
}
