//! The optimistic scheme with a shared, versioned free-list pool triple.
//!
//! Retired blocks flow through three lock-free stacks shared by all
//! threads: `retired -> processing -> ready`. A reclaiming thread *rotates*
//! the pools by bumping the version embedded in the retired pool's head
//! word; concurrent helpers observing the bumped version agree on the phase
//! and skip work that is already done. Before the processing pool is
//! drained, every thread's warning bit is raised: readers holding private
//! pointers must restart their operation, since the memory behind those
//! pointers may be handed out again.
//!
//! The head of each pool packs a 48-bit block address and a 16-bit wrapping
//! version into a single atomic word, so pointer and version always change
//! together under one CAS.

use core::marker::PhantomData;
use core::ptr::{self, NonNull};
use core::sync::atomic::{
    fence, AtomicBool, AtomicPtr, AtomicU64,
    Ordering::{AcqRel, Acquire, Relaxed, Release, SeqCst},
};

use crate::config::Config;
use crate::primitives::{unmarked, Padded, PerThread};
use crate::tracker::block::Block;
use crate::tracker::{RetiredCounts, Tracker};

/// The number of blocks the ready pool is seeded with at construction.
const READY_SEED: usize = 10_000;

const ADDR_BITS: u32 = 48;
const ADDR_MASK: u64 = (1 << ADDR_BITS) - 1;

/// Returns `true` if version `a` is (wrapping) newer than `b`.
#[inline]
fn version_newer(a: u16, b: u16) -> bool {
    (a.wrapping_sub(b) as i16) > 0
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Snapshot
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A decoded copy of a pool head word.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
struct Snapshot(u64);

/********** impl inherent *************************************************************************/

impl Snapshot {
    #[inline]
    fn new<T>(ptr: *mut T, version: u16) -> Self {
        let addr = ptr as u64;
        debug_assert_eq!(addr >> ADDR_BITS, 0, "block address exceeds 48 bits");
        Self(addr | (u64::from(version) << ADDR_BITS))
    }

    #[inline]
    fn null(version: u16) -> Self {
        Self::new(ptr::null_mut::<()>(), version)
    }

    #[inline]
    fn ptr<T>(self) -> *mut T {
        (self.0 & ADDR_MASK) as *mut T
    }

    #[inline]
    fn version(self) -> u16 {
        (self.0 >> ADDR_BITS) as u16
    }

    #[inline]
    fn with_version(self, version: u16) -> Self {
        Self((self.0 & ADDR_MASK) | (u64::from(version) << ADDR_BITS))
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// FreeStack
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A lock-free stack of free blocks with a versioned head.
///
/// The link word of a pooled block lives in its (otherwise unused) epoch
/// trailer, so the stack needs no storage of its own.
struct FreeStack<T> {
    head: AtomicU64,
    _marker: PhantomData<*mut T>,
}

/********** impl inherent *************************************************************************/

impl<T> FreeStack<T> {
    #[inline]
    fn new() -> Self {
        Self { head: AtomicU64::new(Snapshot::null(0).0), _marker: PhantomData }
    }

    #[inline]
    fn snapshot(&self) -> Snapshot {
        Snapshot(self.head.load(Acquire))
    }

    #[inline]
    fn cas(&self, old: Snapshot, new: Snapshot) -> Result<(), Snapshot> {
        match self.head.compare_exchange(old.0, new.0, AcqRel, Acquire) {
            Ok(_) => Ok(()),
            Err(current) => Err(Snapshot(current)),
        }
    }

    /// Pushes `obj`, keeping whatever version the head currently has.
    ///
    /// # Safety
    ///
    /// `obj` must be an unaliased block payload pointer.
    unsafe fn push(&self, obj: NonNull<T>) {
        let mut old = self.snapshot();
        loop {
            Block::set_pool_link(obj, old.ptr::<T>() as u64);
            match self.cas(old, Snapshot::new(obj.as_ptr(), old.version())) {
                Ok(()) => return,
                Err(current) => old = current,
            }
        }
    }

    /// Pushes `obj` while the head version still equals `version`; fails
    /// out instead of spinning once the pool has been rotated away.
    ///
    /// # Safety
    ///
    /// `obj` must be an unaliased block payload pointer.
    unsafe fn push_versioned(&self, obj: NonNull<T>, version: u16) -> bool {
        let mut old = self.snapshot();
        loop {
            if old.version() != version {
                return false;
            }
            Block::set_pool_link(obj, old.ptr::<T>() as u64);
            match self.cas(old, Snapshot::new(obj.as_ptr(), version)) {
                Ok(()) => return true,
                Err(current) => old = current,
            }
        }
    }

    /// Pops the most recently pushed block, if any.
    ///
    /// # Safety
    ///
    /// All pushed pointers must be valid pooled blocks.
    unsafe fn pop(&self) -> Option<NonNull<T>> {
        let mut old = self.snapshot();
        loop {
            let ptr = old.ptr::<T>();
            let obj = NonNull::new(ptr)?;
            let next = Block::pool_link(obj) as *mut T;
            match self.cas(old, Snapshot::new(next, old.version())) {
                Ok(()) => return Some(obj),
                Err(current) => old = current,
            }
        }
    }

    /// Releases the storage of every pooled block (exclusive access).
    fn free_all(&mut self) {
        let mut curr = Snapshot(*self.head.get_mut()).ptr::<T>();
        while let Some(obj) = NonNull::new(curr) {
            unsafe {
                curr = Block::pool_link(obj) as *mut T;
                Block::free_raw(obj);
            }
        }
        *self.head.get_mut() = Snapshot::null(0).0;
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// OaTracker
////////////////////////////////////////////////////////////////////////////////////////////////////

pub(crate) struct OaTracker<T> {
    slots_per_thread: usize,
    collect: bool,
    warnings: Box<[Padded<AtomicBool>]>,
    /// Hazard slots guarding against recycling of privately held pointers.
    slots: Box<[Padded<AtomicPtr<T>>]>,
    /// The even rotation version each thread believes it is helping with.
    local_vers: PerThread<u16>,
    retired_pool: FreeStack<T>,
    processing_pool: FreeStack<T>,
    ready_pool: FreeStack<T>,
    counts: RetiredCounts,
}

/********** impl Send + Sync **********************************************************************/

unsafe impl<T: Send> Send for OaTracker<T> {}
unsafe impl<T: Send> Sync for OaTracker<T> {}

/********** impl inherent *************************************************************************/

impl<T> OaTracker<T> {
    pub fn new(task_num: usize, config: Config) -> Self {
        let tracker = Self {
            slots_per_thread: config.slot_num(),
            collect: config.collect(),
            warnings: (0..task_num).map(|_| Padded::new(AtomicBool::new(false))).collect(),
            slots: (0..task_num * config.slot_num())
                .map(|_| Padded::new(AtomicPtr::new(ptr::null_mut())))
                .collect(),
            local_vers: PerThread::new(task_num, || 0),
            retired_pool: FreeStack::new(),
            processing_pool: FreeStack::new(),
            ready_pool: FreeStack::new(),
            counts: RetiredCounts::new(task_num),
        };

        for _ in 0..READY_SEED {
            if let Some(block) = Block::alloc(0) {
                unsafe { tracker.ready_pool.push(block) };
            }
        }

        tracker
    }

    #[inline]
    fn slot(&self, idx: usize, tid: usize) -> &AtomicPtr<T> {
        &self.slots[tid * self.slots_per_thread + idx]
    }

    /// Returns `true` if any hazard slot references `ptr`.
    #[inline]
    fn check_hazard(&self, ptr: *mut T) -> bool {
        self.slots.iter().any(|slot| slot.load(Relaxed) == ptr)
    }

    /// Rotates the pool triple and recycles every drained block that no
    /// hazard slot references.
    fn empty(&self, tid: usize) {
        if !self.collect {
            return;
        }
        let local_ver = unsafe { self.local_vers.get(tid) };

        // stage 1: claim the rotation by bumping the retired pool version
        let mut local_retire = self.retired_pool.snapshot();
        let local_processing = self.processing_pool.snapshot();
        while local_retire.version() == *local_ver {
            let claimed = local_retire.with_version(local_ver.wrapping_add(1));
            match self.retired_pool.cas(local_retire, claimed) {
                Ok(()) => break,
                Err(current) => local_retire = current,
            }
        }

        // stage 2: move the claimed batch into the processing pool and
        // leave the retired pool empty at the next even version
        local_retire = self.retired_pool.snapshot();
        if local_retire.version() == local_ver.wrapping_add(1) {
            let moved = local_retire.with_version(local_ver.wrapping_add(2));
            let _ = self.processing_pool.cas(local_processing, moved);
            let emptied = Snapshot::null(local_ver.wrapping_add(2));
            let _ = self.retired_pool.cas(local_retire, emptied);
        }

        *local_ver = local_ver.wrapping_add(2);

        // a helper may have completed this phase already
        if version_newer(self.retired_pool.snapshot().version(), *local_ver) {
            return;
        }

        // stage 3: force every active reader to restart
        for warning in self.warnings.iter() {
            warning.store(true, Release);
        }
        // (OPT:1) this `SeqCst` fence orders the warning stores before the
        // hazard scan below; a reader that does not observe its warning has
        // published its reservation before the fence and is seen by
        // `check_hazard`
        fence(SeqCst);

        // stage 4: drain the processing pool
        loop {
            match unsafe { self.processing_pool.pop() } {
                None => return,
                Some(obj) => unsafe {
                    if !self.check_hazard(obj.as_ptr()) {
                        self.ready_pool.push(obj);
                    } else {
                        // still referenced, queue for the next rotation
                        self.retired_pool.push(obj);
                    }
                },
            }
        }
    }
}

/********** impl Tracker **************************************************************************/

impl<T> Tracker<T> for OaTracker<T> {
    #[inline]
    fn counts(&self) -> &RetiredCounts {
        &self.counts
    }

    fn alloc(&self, tid: usize) -> Option<NonNull<T>> {
        let mut rotations = 0;
        loop {
            if let Some(obj) = unsafe { self.ready_pool.pop() } {
                return Some(obj);
            }
            if !self.collect || rotations == 2 {
                // nothing reclaimable, grow by a fresh block instead
                return Block::alloc(0);
            }
            self.empty(tid);
            rotations += 1;
        }
    }

    unsafe fn retire(&self, obj: NonNull<T>, tid: usize) {
        if !self.collect {
            self.retired_pool.push(obj);
            return;
        }
        loop {
            let version = *self.local_vers.get(tid);
            if self.retired_pool.push_versioned(obj, version) {
                return;
            }
            // the pools have rotated under us, help finish the phase and
            // retry with the refreshed version
            self.empty(tid);
        }
    }

    #[inline]
    unsafe fn reclaim(&self, obj: NonNull<T>, tid: usize) {
        self.retire(obj, tid);
    }

    #[inline]
    fn check_warning(&self, tid: usize) -> bool {
        self.warnings[tid].load(Acquire)
    }

    #[inline]
    fn reset_warning(&self, tid: usize) {
        self.warnings[tid].store(false, Relaxed);
    }

    #[inline]
    fn oa_read(&self, src: &AtomicPtr<T>, idx: usize, tid: usize) {
        let ptr = src.load(Acquire);
        // (OPT:2) this `SeqCst` store synchronizes-with the fence (OPT:1)
        self.slot(idx, tid).store(unmarked(ptr), SeqCst);
    }

    #[inline]
    fn oa_reserve(&self, ptr: *mut T, idx: usize, tid: usize) {
        self.slot(idx, tid).store(unmarked(ptr), SeqCst);
    }

    #[inline]
    fn oa_clear(&self, tid: usize) {
        for idx in 0..self.slots_per_thread {
            self.slot(idx, tid).store(ptr::null_mut(), Release);
        }
    }

    #[inline]
    fn reserve(&self, ptr: *mut T, idx: usize, tid: usize) {
        self.slot(idx, tid).store(unmarked(ptr), SeqCst);
    }

    #[inline]
    fn release(&self, idx: usize, tid: usize) {
        self.slot(idx, tid).store(ptr::null_mut(), Release);
    }

    #[inline]
    fn clear_all(&self, tid: usize) {
        self.oa_clear(tid);
    }
}

/********** impl Drop *****************************************************************************/

impl<T> Drop for OaTracker<T> {
    fn drop(&mut self) {
        // pooled blocks are recycled storage, payload destructors do not run
        self.retired_pool.free_all();
        self.processing_pool.free_all();
        self.ready_pool.free_all();
    }
}

#[cfg(test)]
mod tests {
    use core::ptr::NonNull;

    use crate::config::ConfigBuilder;
    use crate::tracker::block::Block;
    use crate::tracker::Tracker;

    use super::{version_newer, OaTracker, Snapshot};

    fn drained(tracker: &OaTracker<u64>) {
        while let Some(block) = unsafe { tracker.ready_pool.pop() } {
            unsafe { Block::free_raw(block) };
        }
    }

    fn fresh(key: u64) -> NonNull<u64> {
        let obj: NonNull<u64> = Block::alloc(0).unwrap();
        unsafe { obj.as_ptr().write(key) };
        obj
    }

    #[test]
    fn snapshot_packing() {
        let ptr = 0x7fff_1234_5678 as *mut u64;
        let snap = Snapshot::new(ptr, 513);
        assert_eq!(snap.ptr::<u64>(), ptr);
        assert_eq!(snap.version(), 513);
        assert_eq!(snap.with_version(2).version(), 2);
        assert_eq!(snap.with_version(2).ptr::<u64>(), ptr);

        assert!(version_newer(1, 0));
        assert!(version_newer(0, u16::max_value()));
        assert!(!version_newer(3, 3));
        assert!(!version_newer(0, 2));
    }

    #[test]
    fn empty_recycles_unprotected() {
        let config = ConfigBuilder::new().build();
        let tracker: OaTracker<u64> = OaTracker::new(2, config);
        drained(&tracker);

        let obj = fresh(5);
        unsafe { tracker.retire(obj, 0) };
        tracker.empty(0);

        // the rotation warns every thread
        assert!(tracker.check_warning(0));
        assert!(tracker.check_warning(1));
        tracker.reset_warning(0);
        assert!(!tracker.check_warning(0));

        let recycled = unsafe { tracker.ready_pool.pop() }.unwrap();
        assert_eq!(recycled, obj);
        assert!(unsafe { tracker.ready_pool.pop() }.is_none());

        unsafe { Block::free_raw(recycled) };
    }

    #[test]
    fn empty_keeps_protected() {
        let config = ConfigBuilder::new().build();
        let tracker: OaTracker<u64> = OaTracker::new(2, config);
        drained(&tracker);

        let obj = fresh(7);
        tracker.oa_reserve(obj.as_ptr(), 0, 1);
        unsafe { tracker.retire(obj, 0) };

        tracker.empty(0);
        assert!(unsafe { tracker.ready_pool.pop() }.is_none());

        // once the reservation is gone the next rotation recycles it
        tracker.oa_clear(1);
        tracker.empty(0);
        let recycled = unsafe { tracker.ready_pool.pop() }.unwrap();
        assert_eq!(recycled, obj);

        unsafe { Block::free_raw(recycled) };
    }

    #[test]
    fn alloc_falls_back_to_fresh_blocks() {
        let config = ConfigBuilder::new().build();
        let tracker: OaTracker<u64> = OaTracker::new(1, config);
        drained(&tracker);

        // nothing is retired, so alloc must not spin in empty forever
        let obj = tracker.alloc(0).unwrap();
        unsafe {
            obj.as_ptr().write(1);
            Block::reclaim(obj);
        }
    }
}
