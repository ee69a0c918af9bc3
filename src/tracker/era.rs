//! The hazard era scheme.
//!
//! Combines the per-object `[birth, retire]` interval of the epoch based
//! schemes with a small per-thread table of *era slots*. A safe load
//! publishes the current era in the caller's slot and retries until the era
//! is stable across the load; any object observable during a published era
//! has `birth <= era <= retire`, so a retired object may be freed only once
//! no published era falls within its interval.

use core::ptr::NonNull;
use core::sync::atomic::{
    AtomicPtr, AtomicU64,
    Ordering::{AcqRel, Acquire, Release, SeqCst},
};

use crate::config::Config;
use crate::primitives::{Padded, PerThread};
use crate::tracker::block::Block;
use crate::tracker::retired::{sweep, RetiredInterval};
use crate::tracker::{RetiredCounts, Tracker, INACTIVE};

////////////////////////////////////////////////////////////////////////////////////////////////////
// EraTracker
////////////////////////////////////////////////////////////////////////////////////////////////////

pub(crate) struct EraTracker<T> {
    task_num: usize,
    slots_per_thread: usize,
    epoch_freq: u64,
    empty_freq: u64,
    collect: bool,
    /// The `task_num * slots_per_thread` era slot table, `INACTIVE` marks an
    /// idle slot.
    eras: Box<[Padded<AtomicU64>]>,
    retire_counters: PerThread<u64>,
    alloc_counters: PerThread<u64>,
    retired: PerThread<Vec<RetiredInterval<T>>>,
    epoch: AtomicU64,
    counts: RetiredCounts,
}

/********** impl Send + Sync **********************************************************************/

unsafe impl<T: Send> Send for EraTracker<T> {}
unsafe impl<T: Send> Sync for EraTracker<T> {}

/********** impl inherent *************************************************************************/

impl<T> EraTracker<T> {
    #[inline]
    pub fn new(task_num: usize, config: Config) -> Self {
        Self {
            task_num,
            slots_per_thread: config.slot_num(),
            epoch_freq: config.epoch_freq(),
            empty_freq: config.empty_freq(),
            collect: config.collect(),
            eras: (0..task_num * config.slot_num())
                .map(|_| Padded::new(AtomicU64::new(INACTIVE)))
                .collect(),
            retire_counters: PerThread::new(task_num, || 0),
            alloc_counters: PerThread::new(task_num, || 0),
            retired: PerThread::new(task_num, Vec::new),
            epoch: AtomicU64::new(0),
            counts: RetiredCounts::new(task_num),
        }
    }

    #[inline]
    fn current_era(&self) -> u64 {
        self.epoch.load(Acquire)
    }

    #[inline]
    fn slot(&self, idx: usize, tid: usize) -> &AtomicU64 {
        &self.eras[tid * self.slots_per_thread + idx]
    }

    /// Returns `true` if any published era falls within
    /// `[birth_epoch, retire_epoch]`.
    #[inline]
    fn conflict(eras: &[u64], birth_epoch: u64, retire_epoch: u64) -> bool {
        eras.iter().any(|&era| era >= birth_epoch && era <= retire_epoch)
    }

    fn empty(&self, tid: usize) {
        let snapshot: Vec<u64> = self.eras.iter().map(|era| era.load(Acquire)).collect();

        let trash = unsafe { self.retired.get(tid) };
        let freed = sweep(
            trash,
            |retired| Self::conflict(&snapshot, retired.birth_epoch, retired.retire_epoch),
            |retired| unsafe { Block::reclaim(retired.ptr) },
        );
        self.counts.sub(tid, freed);
    }
}

/********** impl Tracker **************************************************************************/

impl<T> Tracker<T> for EraTracker<T> {
    #[inline]
    fn counts(&self) -> &RetiredCounts {
        &self.counts
    }

    fn alloc(&self, tid: usize) -> Option<NonNull<T>> {
        let cntr = unsafe { self.alloc_counters.get(tid) };
        *cntr += 1;
        if *cntr % (self.epoch_freq * self.task_num as u64) == 0 {
            self.epoch.fetch_add(1, AcqRel);
        }

        Block::alloc(self.current_era())
    }

    #[inline]
    fn read(&self, src: &AtomicPtr<T>, idx: usize, tid: usize) -> *mut T {
        let slot = self.slot(idx, tid);
        let mut prev_era = slot.load(Acquire);
        loop {
            let ptr = src.load(Acquire);
            let curr_era = self.current_era();
            if curr_era == prev_era {
                return ptr;
            }
            // (ERA:1) this `SeqCst` store synchronizes-with the `Acquire`
            // era loads in `empty`
            slot.store(curr_era, SeqCst);
            prev_era = curr_era;
        }
    }

    #[inline]
    fn reserve(&self, ptr: *mut T, idx: usize, tid: usize) {
        // reserving a known pointer publishes the current era for it
        let _ = ptr;
        self.slot(idx, tid).store(self.current_era(), SeqCst);
    }

    #[inline]
    fn release(&self, idx: usize, tid: usize) {
        self.slot(idx, tid).store(INACTIVE, Release);
    }

    #[inline]
    fn clear_all(&self, tid: usize) {
        for idx in 0..self.slots_per_thread {
            self.slot(idx, tid).store(INACTIVE, Release);
        }
    }

    #[inline]
    fn end_op(&self, tid: usize) {
        self.clear_all(tid);
    }

    unsafe fn retire(&self, obj: NonNull<T>, tid: usize) {
        let birth_epoch = Block::birth_epoch(obj);
        let retire_epoch = self.current_era();
        self.retired.get(tid).push(RetiredInterval { ptr: obj, birth_epoch, retire_epoch });

        let cntr = self.retire_counters.get(tid);
        *cntr += 1;
        if self.collect && *cntr % self.empty_freq == 0 {
            self.empty(tid);
        }
    }

    #[inline]
    fn retired_count(&self, tid: usize) -> usize {
        unsafe { self.retired.get(tid).len() }
    }
}

/********** impl Drop *****************************************************************************/

impl<T> Drop for EraTracker<T> {
    fn drop(&mut self) {
        for trash in self.retired.iter_mut() {
            for retired in trash.drain(..) {
                unsafe { Block::reclaim(retired.ptr) };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use core::sync::atomic::{AtomicPtr, Ordering};

    use crate::config::ConfigBuilder;
    use crate::tracker::{Tracker, INACTIVE};

    use super::EraTracker;

    #[test]
    fn read_publishes_current_era() {
        let config = ConfigBuilder::new().epoch_freq(1_000).empty_freq(100).build();
        let tracker: EraTracker<u64> = EraTracker::new(1, config);

        let obj = tracker.alloc(0).unwrap();
        unsafe { obj.as_ptr().write(3) };
        let src = AtomicPtr::new(obj.as_ptr());

        tracker.epoch.store(5, Ordering::Release);
        let loaded = tracker.read(&src, 0, 0);
        assert_eq!(loaded, obj.as_ptr());
        assert_eq!(tracker.slot(0, 0).load(Ordering::Relaxed), 5);

        tracker.end_op(0);
        assert_eq!(tracker.slot(0, 0).load(Ordering::Relaxed), INACTIVE);

        unsafe { tracker.retire(obj, 0) };
    }

    #[test]
    fn published_era_pins_interval() {
        let config = ConfigBuilder::new().epoch_freq(1_000).empty_freq(2).build();
        let tracker: EraTracker<u64> = EraTracker::new(2, config);

        // thread 1 publishes era 0 in one of its slots
        tracker.reserve(core::ptr::null_mut(), 0, 1);

        for key in 0..8 {
            let obj = tracker.alloc(0).unwrap();
            unsafe {
                obj.as_ptr().write(key);
                tracker.retire(obj, 0);
            }
        }
        assert_eq!(tracker.retired_count(0), 8);

        tracker.clear_all(1);
        for key in 0..4 {
            let obj = tracker.alloc(0).unwrap();
            unsafe {
                obj.as_ptr().write(key);
                tracker.retire(obj, 0);
            }
        }
        assert_eq!(tracker.retired_count(0), 0);
    }
}
