//! The reclamation scheme contract and the policy selecting facade.
//!
//! # Contract
//!
//! Every scheme implements the [`Tracker`] trait. Its default method bodies
//! are the behaviour of the [`Policy::Nil`](crate::Policy::Nil) scheme:
//! plain acquire loads, no reservations and retirement that merely leaks.
//! Each scheme overrides exactly the operations it gives meaning to.
//!
//! # Facade
//!
//! [`MemoryTracker`] selects one scheme at construction and presents the
//! uniform per-thread operation interface on top of it. Dispatch is a single
//! tag check on a sealed sum of scheme variants.
//!
//! The facade additionally maintains a small per-thread permutation of slot
//! indices. Callers address slots by *logical* index; the permutation maps
//! them to physical slots, which lets [`transfer`](MemoryTracker::transfer)
//! rotate a reservation between two logical indices in O(1) without
//! re-issuing a fence.

pub(crate) mod block;

mod boa;
mod era;
mod hazard;
mod interval;
mod oa;
mod range;
mod rcu;
mod retired;

pub use self::boa::{Forecaster, MinuteSample, RatioForecaster};

use core::fmt;
use core::marker::PhantomData;
use core::ptr::NonNull;
use core::sync::atomic::{
    AtomicPtr, AtomicU64,
    Ordering::{Acquire, Relaxed},
};

use arrayvec::ArrayVec;

use crate::config::{Config, Policy, MAX_SLOTS};
use crate::primitives::{unmarked, Padded, PerThread};

use self::block::Block;
use self::boa::BoaTracker;
use self::era::EraTracker;
use self::hazard::HazardTracker;
use self::interval::IntervalTracker;
use self::oa::OaTracker;
use self::range::RangeTracker;
use self::rcu::{RcuKind, RcuTracker};

/// The reserved epoch value marking a reservation (or trailer field) as
/// inactive.
pub(crate) const INACTIVE: u64 = u64::max_value();

////////////////////////////////////////////////////////////////////////////////////////////////////
// Tracker (trait)
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The operation contract shared by all reclamation schemes.
///
/// All operations take the caller's thread id; ids must be in
/// `[0, task_num)` and exclusive to one thread at a time. This is asserted
/// in debug builds and undefined behaviour otherwise.
pub(crate) trait Tracker<T> {
    /// Returns the per-thread retired counters.
    fn counts(&self) -> &RetiredCounts;

    /// Allocates storage for one object and returns the payload pointer
    /// (uninitialized), or `None` if the host allocator fails.
    ///
    /// May internally trigger an epoch advance or a reclamation pass.
    #[inline]
    fn alloc(&self, _tid: usize) -> Option<NonNull<T>> {
        Block::alloc(0)
    }

    /// Records the thread's entry into an operation.
    #[inline]
    fn start_op(&self, _tid: usize) {}

    /// Releases the thread's per-operation reservation state.
    #[inline]
    fn end_op(&self, _tid: usize) {}

    /// Performs a safe load of `src`: the returned pointer remains valid
    /// until the used slot is cleared or the thread's epoch window closes.
    #[inline]
    fn read(&self, src: &AtomicPtr<T>, _idx: usize, _tid: usize) -> *mut T {
        src.load(Acquire)
    }

    /// Publishes `ptr` in the physical slot `idx` of thread `tid`.
    #[inline]
    fn reserve(&self, _ptr: *mut T, _idx: usize, _tid: usize) {}

    /// Clears the physical slot `idx` of thread `tid`.
    #[inline]
    fn release(&self, _idx: usize, _tid: usize) {}

    /// Clears every slot of thread `tid`.
    #[inline]
    fn clear_all(&self, _tid: usize) {}

    /// Hands a logically removed object over to the tracker for deferred
    /// physical reclamation.
    ///
    /// # Safety
    ///
    /// `obj` must be a payload pointer obtained from [`Tracker::alloc`]
    /// that has been unlinked from the structure and is retired only once.
    #[inline]
    unsafe fn retire(&self, _obj: NonNull<T>, _tid: usize) {}

    /// Returns a thread-local object that was never published to the
    /// structure.
    ///
    /// # Safety
    ///
    /// `obj` must be a payload pointer obtained from [`Tracker::alloc`]
    /// with an initialized payload that no other thread can observe.
    #[inline]
    unsafe fn reclaim(&self, obj: NonNull<T>, _tid: usize) {
        Block::reclaim(obj);
    }

    /// Returns `true` if a concurrent recycling pass may have invalidated
    /// pointers privately held by thread `tid`.
    #[inline]
    fn check_warning(&self, _tid: usize) -> bool {
        false
    }

    /// Clears the warning bit of thread `tid`.
    #[inline]
    fn reset_warning(&self, _tid: usize) {}

    /// Optimistic load: publishes the stripped pointer read from `src`
    /// without the stability re-load of [`Tracker::read`].
    #[inline]
    fn oa_read(&self, _src: &AtomicPtr<T>, _idx: usize, _tid: usize) {}

    /// Optimistic reservation of an already loaded pointer.
    #[inline]
    fn oa_reserve(&self, _ptr: *mut T, _idx: usize, _tid: usize) {}

    /// Clears the optimistic slots of thread `tid`.
    #[inline]
    fn oa_clear(&self, _tid: usize) {}

    /// Returns the number of not yet reclaimed retirees of thread `tid`.
    #[inline]
    fn retired_count(&self, _tid: usize) -> usize {
        0
    }

    /// Returns `true` if the physical slot `idx` of `tid` holds `ptr`.
    #[inline]
    fn check_reservation(&self, _ptr: *mut T, _idx: usize, _tid: usize) -> bool {
        false
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// RetiredCounts
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Per-thread counters of retired records, shared bookkeeping of all
/// schemes.
///
/// Counters are written by their owning thread and may be read from any
/// thread, so they are (relaxed) atomics rather than plain cells.
#[derive(Debug)]
pub(crate) struct RetiredCounts {
    cells: Box<[Padded<AtomicU64>]>,
}

/********** impl inherent *************************************************************************/

impl RetiredCounts {
    #[inline]
    pub fn new(task_num: usize) -> Self {
        Self { cells: (0..task_num).map(|_| Padded::new(AtomicU64::new(0))).collect() }
    }

    #[inline]
    pub fn inc(&self, tid: usize) {
        self.cells[tid].fetch_add(1, Relaxed);
    }

    #[inline]
    pub fn sub(&self, tid: usize, freed: u64) {
        self.cells[tid].fetch_sub(freed, Relaxed);
    }

    #[inline]
    pub fn get(&self, tid: usize) -> u64 {
        self.cells[tid].load(Relaxed)
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// NilTracker
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The no-op scheme: every operation keeps its contract default, retired
/// records are leaked.
#[derive(Debug)]
pub(crate) struct NilTracker<T> {
    counts: RetiredCounts,
    _marker: PhantomData<fn(T)>,
}

/********** impl inherent *************************************************************************/

impl<T> NilTracker<T> {
    #[inline]
    pub fn new(task_num: usize) -> Self {
        Self { counts: RetiredCounts::new(task_num), _marker: PhantomData }
    }
}

/********** impl Tracker **************************************************************************/

impl<T> Tracker<T> for NilTracker<T> {
    #[inline]
    fn counts(&self) -> &RetiredCounts {
        &self.counts
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Scheme
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The sealed sum of all constructible schemes.
enum Scheme<T> {
    Nil(NilTracker<T>),
    Hazard(HazardTracker<T>),
    Rcu(RcuTracker<T>),
    Interval(IntervalTracker<T>),
    Range(RangeTracker<T>),
    Era(EraTracker<T>),
    Oa(OaTracker<T>),
    Boa(BoaTracker<T>),
}

macro_rules! dispatch {
    ($self:ident, $method:ident($($arg:expr),*)) => {
        match &$self.scheme {
            Scheme::Nil(tracker) => tracker.$method($($arg),*),
            Scheme::Hazard(tracker) => tracker.$method($($arg),*),
            Scheme::Rcu(tracker) => tracker.$method($($arg),*),
            Scheme::Interval(tracker) => tracker.$method($($arg),*),
            Scheme::Range(tracker) => tracker.$method($($arg),*),
            Scheme::Era(tracker) => tracker.$method($($arg),*),
            Scheme::Oa(tracker) => tracker.$method($($arg),*),
            Scheme::Boa(tracker) => tracker.$method($($arg),*),
        }
    };
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// MemoryTracker
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The policy selecting facade presenting the uniform per-thread operation
/// interface of the reclamation library.
pub struct MemoryTracker<T> {
    task_num: usize,
    policy: Policy,
    slot_num: usize,
    scheme: Scheme<T>,
    renamers: PerThread<ArrayVec<[usize; MAX_SLOTS]>>,
}

/********** impl inherent *************************************************************************/

impl<T> MemoryTracker<T> {
    /// Creates a tracker for `task_num` threads with the default
    /// [`Config`].
    ///
    /// # Panics
    ///
    /// Panics if `task_num` is 0 or `policy` is not supported.
    #[inline]
    pub fn new(task_num: usize, policy: Policy) -> Self {
        Self::with_config(task_num, policy, Config::default())
    }

    /// Creates a tracker for `task_num` threads with the given `config`.
    ///
    /// # Panics
    ///
    /// Panics if `task_num` is 0 or `policy` is not supported.
    pub fn with_config(task_num: usize, policy: Policy, config: Config) -> Self {
        assert!(task_num > 0, "thread count must be greater than 0");
        assert!(policy.is_supported(), "unsupported reclamation policy: {}", policy);

        let scheme = match policy {
            Policy::Nil => Scheme::Nil(NilTracker::new(task_num)),
            Policy::Hazard => Scheme::Hazard(HazardTracker::new(
                task_num,
                config.slot_num(),
                config.empty_freq(),
                config.collect(),
            )),
            Policy::Rcu => Scheme::Rcu(RcuTracker::new(task_num, config, RcuKind::Rcu)),
            Policy::Qsbr => Scheme::Rcu(RcuTracker::new(task_num, config, RcuKind::Qsbr)),
            Policy::Interval => Scheme::Interval(IntervalTracker::new(task_num, config)),
            Policy::Range | Policy::RangeNew => {
                Scheme::Range(RangeTracker::new(task_num, config))
            }
            Policy::He => Scheme::Era(EraTracker::new(task_num, config)),
            Policy::Oa => Scheme::Oa(OaTracker::new(task_num, config)),
            Policy::Boa => Scheme::Boa(BoaTracker::new(task_num, config)),
            Policy::HazardDynamic | Policy::RangeTp => unreachable!(),
        };

        let slot_num = config.slot_num();
        Self {
            task_num,
            policy,
            slot_num,
            scheme,
            renamers: PerThread::new(task_num, || (0..slot_num).collect()),
        }
    }

    /// Returns the number of threads the tracker was constructed for.
    #[inline]
    pub fn task_num(&self) -> usize {
        self.task_num
    }

    /// Returns the selected reclamation policy.
    #[inline]
    pub fn policy(&self) -> Policy {
        self.policy
    }

    /// Maps a logical slot index through the thread's permutation.
    #[inline]
    fn renamed(&self, idx: usize, tid: usize) -> usize {
        debug_assert!(idx < self.slot_num, "slot index out of range");
        unsafe { self.renamers.get(tid)[idx] }
    }

    /// Allocates storage for one object, see [`Tracker::alloc`].
    #[inline]
    pub fn alloc(&self, tid: usize) -> Option<NonNull<T>> {
        debug_assert!(tid < self.task_num, "thread id out of range");
        dispatch!(self, alloc(tid))
    }

    /// Records the thread's entry into an operation.
    #[inline]
    pub fn start_op(&self, tid: usize) {
        debug_assert!(tid < self.task_num, "thread id out of range");
        dispatch!(self, start_op(tid))
    }

    /// Releases the thread's per-operation reservation state.
    #[inline]
    pub fn end_op(&self, tid: usize) {
        dispatch!(self, end_op(tid))
    }

    /// Performs a safe load of `src` using the logical slot `idx`.
    ///
    /// The pointer based schemes return the *tagged* pointer but reserve
    /// the *untagged* one; callers must strip the mark before dereferencing.
    #[inline]
    pub fn read(&self, src: &AtomicPtr<T>, idx: usize, tid: usize) -> *mut T {
        let idx = self.renamed(idx, tid);
        dispatch!(self, read(src, idx, tid))
    }

    /// Swaps the physical slots behind the logical indices `src_idx` and
    /// `dst_idx` in O(1).
    #[inline]
    pub fn transfer(&self, src_idx: usize, dst_idx: usize, tid: usize) {
        debug_assert!(src_idx < self.slot_num && dst_idx < self.slot_num);
        unsafe { self.renamers.get(tid).swap(src_idx, dst_idx) };
    }

    /// Clears the logical slot `idx`.
    #[inline]
    pub fn release(&self, idx: usize, tid: usize) {
        let idx = self.renamed(idx, tid);
        dispatch!(self, release(idx, tid))
    }

    /// Clears every slot of thread `tid`.
    #[inline]
    pub fn clear_all(&self, tid: usize) {
        dispatch!(self, clear_all(tid))
    }

    /// Hands a logically removed object over for deferred reclamation, see
    /// [`Tracker::retire`].
    ///
    /// # Safety
    ///
    /// `obj` must be a payload pointer obtained from
    /// [`alloc`](MemoryTracker::alloc) that has been unlinked from the
    /// structure and is retired only once.
    #[inline]
    pub unsafe fn retire(&self, obj: NonNull<T>, tid: usize) {
        dispatch!(self, counts()).inc(tid);
        dispatch!(self, retire(obj, tid))
    }

    /// Returns a thread-local, never published object, see
    /// [`Tracker::reclaim`].
    ///
    /// # Safety
    ///
    /// `obj` must be a payload pointer obtained from
    /// [`alloc`](MemoryTracker::alloc) with an initialized payload that no
    /// other thread can observe.
    #[inline]
    pub unsafe fn reclaim(&self, obj: NonNull<T>, tid: usize) {
        dispatch!(self, reclaim(obj, tid))
    }

    /// Returns the number of records thread `tid` has retired and not yet
    /// seen reclaimed.
    #[inline]
    pub fn retired_cnt(&self, tid: usize) -> u64 {
        match self.policy {
            Policy::Nil => 0,
            _ => dispatch!(self, counts()).get(tid),
        }
    }

    /// Returns `true` if a concurrent recycling pass may have invalidated
    /// pointers privately held by thread `tid`.
    #[inline]
    pub fn check_warning(&self, tid: usize) -> bool {
        dispatch!(self, check_warning(tid))
    }

    /// Clears the warning bit of thread `tid`.
    #[inline]
    pub fn reset_warning(&self, tid: usize) {
        dispatch!(self, reset_warning(tid))
    }

    /// Optimistic load through the logical slot `idx`, see
    /// [`Tracker::oa_read`].
    #[inline]
    pub fn oa_read(&self, src: &AtomicPtr<T>, idx: usize, tid: usize) {
        let idx = self.renamed(idx, tid);
        dispatch!(self, oa_read(src, idx, tid))
    }

    /// Optimistic reservation of an already loaded pointer.
    #[inline]
    pub fn oa_reserve(&self, ptr: *mut T, idx: usize, tid: usize) {
        let idx = self.renamed(idx, tid);
        let ptr = unmarked(ptr);
        dispatch!(self, oa_reserve(ptr, idx, tid))
    }

    /// Clears the optimistic slots of thread `tid`.
    #[inline]
    pub fn oa_clear(&self, tid: usize) {
        dispatch!(self, oa_clear(tid))
    }

    /// Returns the number of not yet reclaimed retirees of thread `tid`
    /// (introspection, approximate under concurrency).
    #[inline]
    pub(crate) fn retired_count(&self, tid: usize) -> usize {
        dispatch!(self, retired_count(tid))
    }

    /// Returns the physical slot a logical index currently maps to
    /// (introspection).
    #[inline]
    pub(crate) fn slot_renamer(&self, tid: usize, idx: usize) -> usize {
        self.renamed(idx, tid)
    }

    /// Returns `true` if the logical slot `idx` of `tid` holds `ptr`
    /// (introspection).
    #[inline]
    pub(crate) fn check_reservation(&self, ptr: *mut T, idx: usize, tid: usize) -> bool {
        let idx = self.renamed(idx, tid);
        dispatch!(self, check_reservation(ptr, idx, tid))
    }
}

/********** impl Debug ****************************************************************************/

impl<T> fmt::Debug for MemoryTracker<T> {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MemoryTracker")
            .field("task_num", &self.task_num)
            .field("policy", &self.policy)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use core::ptr::NonNull;
    use core::sync::atomic::AtomicPtr;

    use matches::assert_matches;

    use crate::config::{ConfigBuilder, Policy};

    use super::MemoryTracker;

    fn alloc_retired(tracker: &MemoryTracker<u64>, tid: usize, key: u64) -> NonNull<u64> {
        let obj = tracker.alloc(tid).unwrap();
        unsafe { obj.as_ptr().write(key) };
        obj
    }

    #[test]
    fn nil_reports_zero() {
        let tracker: MemoryTracker<u64> = MemoryTracker::new(2, Policy::Nil);
        assert_eq!(tracker.retired_cnt(0), 0);
        assert_eq!(tracker.retired_cnt(1), 0);
        assert_matches!(tracker.policy(), Policy::Nil);
    }

    #[test]
    fn slot_renaming() {
        let tracker: MemoryTracker<u64> = MemoryTracker::new(2, Policy::Hazard);
        assert_eq!(tracker.slot_renamer(0, 0), 0);
        assert_eq!(tracker.slot_renamer(0, 2), 2);

        tracker.transfer(0, 2, 0);
        assert_eq!(tracker.slot_renamer(0, 0), 2);
        assert_eq!(tracker.slot_renamer(0, 2), 0);
        // other threads are unaffected
        assert_eq!(tracker.slot_renamer(1, 0), 0);
    }

    #[test]
    fn renamed_read_targets_previous_slot() {
        let tracker: MemoryTracker<u64> = MemoryTracker::new(1, Policy::Hazard);
        let obj = alloc_retired(&tracker, 0, 1);
        let src = AtomicPtr::new(obj.as_ptr());

        tracker.transfer(0, 1, 0);
        let loaded = tracker.read(&src, 0, 0);
        assert_eq!(loaded, obj.as_ptr());

        // logical slot 0 now writes to physical slot 1
        assert!(tracker.check_reservation(loaded, 0, 0));
        assert_eq!(tracker.slot_renamer(0, 0), 1);

        unsafe { tracker.reclaim(obj, 0) };
    }

    #[test]
    fn hazard_residual_below_empty_freq() {
        let config = ConfigBuilder::new().empty_freq(30).slot_num(3).build();
        let tracker: MemoryTracker<u64> = MemoryTracker::with_config(2, Policy::Hazard, config);

        // no reservations are held, so every empty pass frees everything
        for key in 0..10_000 {
            let obj = alloc_retired(&tracker, 0, key);
            unsafe { tracker.retire(obj, 0) };
        }

        assert!(tracker.retired_count(0) < 30);
        assert_eq!(tracker.retired_cnt(0), tracker.retired_count(0) as u64);
    }

    #[test]
    fn collect_disabled_grows_without_bound() {
        let config = ConfigBuilder::new().collect(false).build();
        let tracker: MemoryTracker<u64> = MemoryTracker::with_config(1, Policy::Rcu, config);

        for key in 0..1_000 {
            let obj = alloc_retired(&tracker, 0, key);
            unsafe { tracker.retire(obj, 0) };
        }

        // nothing is freed until the tracker is dropped
        assert_eq!(tracker.retired_count(0), 1_000);
        assert_eq!(tracker.retired_cnt(0), 1_000);
    }

    #[test]
    #[should_panic]
    fn unsupported_policy() {
        let _: MemoryTracker<u64> = MemoryTracker::new(1, Policy::RangeTp);
    }

    #[test]
    fn epoch_trackers_free_quiescent_garbage() {
        for &policy in &[Policy::Rcu, Policy::Qsbr, Policy::Interval, Policy::RangeNew, Policy::He]
        {
            let config = ConfigBuilder::new().epoch_freq(1).empty_freq(10).build();
            let tracker: MemoryTracker<u64> = MemoryTracker::with_config(1, policy, config);

            for key in 0..1_000 {
                let obj = alloc_retired(&tracker, 0, key);
                unsafe { tracker.retire(obj, 0) };
            }

            // with no thread inside an operation, everything but the most
            // recent batch must have been freed
            assert!(
                tracker.retired_count(0) < 20,
                "{} left {} retirees",
                policy,
                tracker.retired_count(0)
            );
        }
    }
}
