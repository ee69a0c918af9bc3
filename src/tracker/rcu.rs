//! Epoch based reclamation (RCU flavour) and its quiescent-state variant.
//!
//! A single global epoch advances on an allocation-count threshold. Each
//! operation publishes the epoch it entered under; a retired record is
//! stamped with the epoch current at retirement and may be freed once the
//! minimum published reservation exceeds that stamp.
//!
//! In QSBR mode threads stay "on-line" between operations: `end_op`
//! re-publishes the then-current epoch instead of clearing the reservation,
//! so every thread must keep completing operations for reclamation to make
//! progress.

use core::ptr::NonNull;
use core::sync::atomic::{
    AtomicU64,
    Ordering::{AcqRel, Acquire, SeqCst},
};

use crate::config::Config;
use crate::primitives::{Padded, PerThread};
use crate::tracker::block::Block;
use crate::tracker::retired::{sweep, RetiredEpoch};
use crate::tracker::{RetiredCounts, Tracker, INACTIVE};

////////////////////////////////////////////////////////////////////////////////////////////////////
// RcuKind
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum RcuKind {
    Rcu,
    Qsbr,
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// RcuTracker
////////////////////////////////////////////////////////////////////////////////////////////////////

pub(crate) struct RcuTracker<T> {
    task_num: usize,
    epoch_freq: u64,
    empty_freq: u64,
    collect: bool,
    kind: RcuKind,
    reservations: Box<[Padded<AtomicU64>]>,
    retire_counters: PerThread<u64>,
    alloc_counters: PerThread<u64>,
    retired: PerThread<Vec<RetiredEpoch<T>>>,
    epoch: AtomicU64,
    counts: RetiredCounts,
}

/********** impl Send + Sync **********************************************************************/

unsafe impl<T: Send> Send for RcuTracker<T> {}
unsafe impl<T: Send> Sync for RcuTracker<T> {}

/********** impl inherent *************************************************************************/

impl<T> RcuTracker<T> {
    #[inline]
    pub fn new(task_num: usize, config: Config, kind: RcuKind) -> Self {
        Self {
            task_num,
            epoch_freq: config.epoch_freq(),
            empty_freq: config.empty_freq(),
            collect: config.collect(),
            kind,
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

    /// Frees every retiree of `tid` stamped before the oldest reservation.
    fn empty(&self, tid: usize) {
        let mut min_epoch = INACTIVE;
        for reservation in self.reservations.iter() {
            let epoch = reservation.load(Acquire);
            if epoch < min_epoch {
                min_epoch = epoch;
            }
        }

        let trash = unsafe { self.retired.get(tid) };
        let freed = sweep(
            trash,
            |retired| retired.epoch >= min_epoch,
            |retired| unsafe { Block::reclaim(retired.ptr) },
        );
        self.counts.sub(tid, freed);
    }
}

/********** impl Tracker **************************************************************************/

impl<T> Tracker<T> for RcuTracker<T> {
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
        if self.kind == RcuKind::Rcu {
            let epoch = self.current_epoch();
            // (RCU:1) this `SeqCst` store synchronizes-with the `Acquire`
            // reservation loads in `empty`; a reclaimer scanning after this
            // store cannot miss the reservation
            self.reservations[tid].store(epoch, SeqCst);
        }
    }

    #[inline]
    fn end_op(&self, tid: usize) {
        match self.kind {
            RcuKind::Rcu => self.reservations[tid].store(INACTIVE, SeqCst),
            // QSBR: passing through `end_op` is the quiescent state
            RcuKind::Qsbr => self.reservations[tid].store(self.current_epoch(), SeqCst),
        }
    }

    unsafe fn retire(&self, obj: NonNull<T>, tid: usize) {
        let epoch = self.current_epoch();
        self.retired.get(tid).push(RetiredEpoch { ptr: obj, epoch });

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

impl<T> Drop for RcuTracker<T> {
    fn drop(&mut self) {
        for trash in self.retired.iter_mut() {
            for retired in trash.drain(..) {
                unsafe { Block::reclaim(retired.ptr) };
            }
        }
    }
}
