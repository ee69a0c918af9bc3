//! Range based reclamation with a `(lower, upper)` reservation pair.
//!
//! The reservation is the closed interval of epochs a thread may still
//! observe: `start_op` publishes `(e, e)` and every safe load widens the
//! upper bound to the then-current epoch before the loaded pointer may be
//! used. A retired object is safe once its `[birth, retire]` interval is
//! disjoint from every thread's reservation interval.

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
// RangeTracker
////////////////////////////////////////////////////////////////////////////////////////////////////

pub(crate) struct RangeTracker<T> {
    task_num: usize,
    epoch_freq: u64,
    empty_freq: u64,
    collect: bool,
    upper_reservs: Box<[Padded<AtomicU64>]>,
    lower_reservs: Box<[Padded<AtomicU64>]>,
    retire_counters: PerThread<u64>,
    alloc_counters: PerThread<u64>,
    retired: PerThread<Vec<RetiredInterval<T>>>,
    epoch: AtomicU64,
    counts: RetiredCounts,
}

/********** impl Send + Sync **********************************************************************/

unsafe impl<T: Send> Send for RangeTracker<T> {}
unsafe impl<T: Send> Sync for RangeTracker<T> {}

/********** impl inherent *************************************************************************/

impl<T> RangeTracker<T> {
    #[inline]
    pub fn new(task_num: usize, config: Config) -> Self {
        Self {
            task_num,
            epoch_freq: config.epoch_freq(),
            empty_freq: config.empty_freq(),
            collect: config.collect(),
            upper_reservs: (0..task_num)
                .map(|_| Padded::new(AtomicU64::new(INACTIVE)))
                .collect(),
            lower_reservs: (0..task_num)
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
    fn current_epoch(&self) -> u64 {
        self.epoch.load(Acquire)
    }

    /// Returns `true` if any reservation interval of the snapshot overlaps
    /// `[birth_epoch, retire_epoch]`.
    #[inline]
    fn conflict(lower: &[u64], upper: &[u64], birth_epoch: u64, retire_epoch: u64) -> bool {
        lower
            .iter()
            .zip(upper)
            .any(|(&lo, &up)| up >= birth_epoch && lo <= retire_epoch)
    }

    fn empty(&self, tid: usize) {
        let mut lower = Vec::with_capacity(self.task_num);
        let mut upper = Vec::with_capacity(self.task_num);
        for i in 0..self.task_num {
            // lower before upper: a racing `read` only ever widens upper,
            // so this order cannot shrink an observed interval
            lower.push(self.lower_reservs[i].load(Acquire));
            upper.push(self.upper_reservs[i].load(Acquire));
        }

        let trash = unsafe { self.retired.get(tid) };
        let freed = sweep(
            trash,
            |retired| Self::conflict(&lower, &upper, retired.birth_epoch, retired.retire_epoch),
            |retired| unsafe { Block::reclaim(retired.ptr) },
        );
        self.counts.sub(tid, freed);
    }
}

/********** impl Tracker **************************************************************************/

impl<T> Tracker<T> for RangeTracker<T> {
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

        Block::alloc(self.current_epoch())
    }

    #[inline]
    fn start_op(&self, tid: usize) {
        let epoch = self.current_epoch();
        // (RAN:1) these `SeqCst` stores synchronize-with the `Acquire`
        // reservation loads in `empty`
        self.lower_reservs[tid].store(epoch, SeqCst);
        self.upper_reservs[tid].store(epoch, SeqCst);
    }

    #[inline]
    fn end_op(&self, tid: usize) {
        self.upper_reservs[tid].store(INACTIVE, Release);
        self.lower_reservs[tid].store(INACTIVE, Release);
    }

    #[inline]
    fn read(&self, src: &AtomicPtr<T>, _idx: usize, tid: usize) -> *mut T {
        let mut prev_epoch = self.upper_reservs[tid].load(Acquire);
        loop {
            let ptr = src.load(Acquire);
            let curr_epoch = self.current_epoch();
            if curr_epoch == prev_epoch {
                return ptr;
            }
            // (RAN:2) this `SeqCst` store synchronizes-with the `Acquire`
            // reservation loads in `empty`; a conflicting retiree published
            // under `curr_epoch` cannot be missed
            self.upper_reservs[tid].store(curr_epoch, SeqCst);
            prev_epoch = curr_epoch;
        }
    }

    unsafe fn retire(&self, obj: NonNull<T>, tid: usize) {
        let birth_epoch = Block::birth_epoch(obj);
        let retire_epoch = self.current_epoch();
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

impl<T> Drop for RangeTracker<T> {
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
    use crate::tracker::Tracker;

    use super::RangeTracker;

    #[test]
    fn conflict_predicate() {
        // reservation [4, 6] vs interval [5, 9]
        assert!(RangeTracker::<u64>::conflict(&[4], &[6], 5, 9));
        // reservation [7, 8] inside [5, 9]
        assert!(RangeTracker::<u64>::conflict(&[7], &[8], 5, 9));
        // disjoint below and above
        assert!(!RangeTracker::<u64>::conflict(&[1], &[4], 5, 9));
        assert!(!RangeTracker::<u64>::conflict(&[10], &[12], 5, 9));
        // inactive reservations never conflict
        let max = u64::max_value();
        assert!(!RangeTracker::<u64>::conflict(&[max], &[max], 5, 9));
    }

    #[test]
    fn read_widens_upper_reservation() {
        let config = ConfigBuilder::new().epoch_freq(1).empty_freq(100).build();
        let tracker: RangeTracker<u64> = RangeTracker::new(1, config);

        tracker.start_op(0);
        assert_eq!(tracker.upper_reservs[0].load(Ordering::Relaxed), 0);

        // advance the epoch behind the reader's back
        let obj = tracker.alloc(0).unwrap();
        unsafe { obj.as_ptr().write(1) };
        tracker.epoch.store(17, Ordering::Release);

        let src = AtomicPtr::new(obj.as_ptr());
        let loaded = tracker.read(&src, 0, 0);
        assert_eq!(loaded, obj.as_ptr());
        assert_eq!(tracker.upper_reservs[0].load(Ordering::Relaxed), 17);
        assert_eq!(tracker.lower_reservs[0].load(Ordering::Relaxed), 0);

        tracker.end_op(0);
        unsafe { tracker.retire(obj, 0) };
    }

    #[test]
    fn overlap_pins_disjoint_frees() {
        let config = ConfigBuilder::new().epoch_freq(1_000).empty_freq(2).build();
        let tracker: RangeTracker<u64> = RangeTracker::new(2, config);

        tracker.start_op(1);
        for key in 0..16 {
            let obj = tracker.alloc(0).unwrap();
            unsafe {
                obj.as_ptr().write(key);
                tracker.retire(obj, 0);
            }
        }
        assert_eq!(tracker.retired_count(0), 16);

        tracker.end_op(1);
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
