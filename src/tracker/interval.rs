//! Interval based reclamation with a single reserved epoch per thread.
//!
//! Every object carries its birth epoch in the block trailer and is stamped
//! with a retire epoch on retirement. A thread's reservation is the single
//! epoch it entered its operation under; a retired object is safe once no
//! reservation lies within its `[birth, retire]` interval.

use core::ptr::NonNull;
use core::sync::atomic::{
    AtomicU64,
    Ordering::{AcqRel, Acquire, SeqCst},
};

use crate::config::Config;
use crate::primitives::{Padded, PerThread};
use crate::tracker::block::Block;
use crate::tracker::retired::{sweep, RetiredInterval};
use crate::tracker::{RetiredCounts, Tracker, INACTIVE};

////////////////////////////////////////////////////////////////////////////////////////////////////
// IntervalTracker
////////////////////////////////////////////////////////////////////////////////////////////////////

pub(crate) struct IntervalTracker<T> {
    task_num: usize,
    epoch_freq: u64,
    empty_freq: u64,
    collect: bool,
    reservations: Box<[Padded<AtomicU64>]>,
    retire_counters: PerThread<u64>,
    alloc_counters: PerThread<u64>,
    retired: PerThread<Vec<RetiredInterval<T>>>,
    epoch: AtomicU64,
    counts: RetiredCounts,
}

/********** impl Send + Sync **********************************************************************/

unsafe impl<T: Send> Send for IntervalTracker<T> {}
unsafe impl<T: Send> Sync for IntervalTracker<T> {}

/********** impl inherent *************************************************************************/

impl<T> IntervalTracker<T> {
    #[inline]
    pub fn new(task_num: usize, config: Config) -> Self {
        Self {
            task_num,
            epoch_freq: config.epoch_freq(),
            empty_freq: config.empty_freq(),
            collect: config.collect(),
            reservations: (0..task_num)
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

    /// Returns `true` if any of the reservation snapshot lies within
    /// `[birth_epoch, retire_epoch]`.
    #[inline]
    fn conflict(reservations: &[u64], birth_epoch: u64, retire_epoch: u64) -> bool {
        reservations
            .iter()
            .any(|&epoch| epoch >= birth_epoch && epoch <= retire_epoch)
    }

    fn empty(&self, tid: usize) {
        let snapshot: Vec<u64> =
            self.reservations.iter().map(|r| r.load(Acquire)).collect();

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

impl<T> Tracker<T> for IntervalTracker<T> {
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
        self.reservations[tid].store(epoch, SeqCst);
    }

    #[inline]
    fn end_op(&self, tid: usize) {
        self.reservations[tid].store(INACTIVE, SeqCst);
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

impl<T> Drop for IntervalTracker<T> {
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
    use crate::config::ConfigBuilder;
    use crate::tracker::Tracker;

    use super::IntervalTracker;

    #[test]
    fn conflict_predicate() {
        assert!(IntervalTracker::<u64>::conflict(&[5], 3, 7));
        assert!(IntervalTracker::<u64>::conflict(&[3], 3, 7));
        assert!(IntervalTracker::<u64>::conflict(&[7], 3, 7));
        assert!(!IntervalTracker::<u64>::conflict(&[2], 3, 7));
        assert!(!IntervalTracker::<u64>::conflict(&[8], 3, 7));
        // inactive reservations never conflict
        assert!(!IntervalTracker::<u64>::conflict(&[u64::max_value()], 3, 7));
    }

    #[test]
    fn overlapping_reservation_pins_interval() {
        // the epoch never advances here, so all intervals are [0, 0]
        let config = ConfigBuilder::new().epoch_freq(1_000).empty_freq(2).build();
        let tracker: IntervalTracker<u64> = IntervalTracker::new(2, config);

        tracker.start_op(1);
        for key in 0..32 {
            let obj = tracker.alloc(0).unwrap();
            unsafe {
                obj.as_ptr().write(key);
                tracker.retire(obj, 0);
            }
        }
        // thread 1's reservation epoch lies inside every retiree's interval
        assert_eq!(tracker.retired_count(0), 32);

        tracker.end_op(1);
        for key in 0..4 {
            let obj = tracker.alloc(0).unwrap();
            unsafe {
                obj.as_ptr().write(key);
                tracker.retire(obj, 0);
            }
        }
        assert!(tracker.retired_count(0) < 4);
    }
}
