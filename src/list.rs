//! A lock-free sorted linked list (ordered set) built directly on top of
//! the reclamation facade.
//!
//! The list is keyed by `T` with its total order and keeps its live keys
//! strictly increasing behind a permanent head sentinel. The lowest bit of
//! every `next` pointer is the delete mark: marking a node's `next` is the
//! logical deletion, unlinking it afterwards is physical. Traversals help
//! unlink marked nodes they encounter and hand them to the tracker, which
//! defers the physical free until no thread can still hold the pointer.

use core::ptr::{self, NonNull};
use core::sync::atomic::{
    AtomicPtr, AtomicU64, AtomicUsize,
    Ordering::{AcqRel, Acquire, Relaxed, Release},
};

use crate::config::{Config, Policy};
use crate::primitives::{compose, is_marked, marked, unmarked, Padded};
use crate::tracker::MemoryTracker;

////////////////////////////////////////////////////////////////////////////////////////////////////
// OrderedList
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A concurrent linked-list based ordered set with tracker-managed memory
/// reclamation.
///
/// Every operation takes the caller's thread id, which must lie in
/// `[0, task_num)` and be used by only one thread at a time.
pub struct OrderedList<T> {
    head: Padded<MarkPtr<T>>,
    size: AtomicUsize,
    tracker: MemoryTracker<Node<T>>,
    monitor: RetiredMonitor,
}

/********** impl Send + Sync **********************************************************************/

unsafe impl<T: Send> Send for OrderedList<T> {}
unsafe impl<T: Send + Sync> Sync for OrderedList<T> {}

/********** impl inherent *************************************************************************/

impl<T> OrderedList<T>
where
    T: Ord + Clone,
{
    /// Creates an empty list for `task_num` threads using the reclamation
    /// `policy` with its default configuration.
    ///
    /// # Panics
    ///
    /// Panics if `task_num` is 0 or `policy` is not supported.
    #[inline]
    pub fn new(task_num: usize, policy: Policy) -> Self {
        Self::with_config(task_num, policy, Config::default())
    }

    /// Creates an empty list with an explicit tracker configuration.
    ///
    /// # Panics
    ///
    /// Panics if `task_num` is 0 or `policy` is not supported.
    #[inline]
    pub fn with_config(task_num: usize, policy: Policy, config: Config) -> Self {
        Self {
            head: Padded::new(MarkPtr::null()),
            size: AtomicUsize::new(0),
            tracker: MemoryTracker::with_config(task_num, policy, config),
            monitor: RetiredMonitor::new(task_num),
        }
    }

    /// Inserts `value` and returns `true` if it was not present before.
    ///
    /// Returns `false` without modifying the list if the value already
    /// exists or the host allocator cannot supply a node.
    pub fn insert(&self, value: T, tid: usize) -> bool {
        let node = match self.tracker.alloc(tid) {
            Some(node) => node,
            None => return false,
        };
        unsafe { node.as_ptr().write(Node { data: value, next: MarkPtr::null() }) };

        self.monitor.collect(self.tracker.retired_cnt(tid), tid);
        self.tracker.start_op(tid);

        let result = loop {
            let pos = self.search(unsafe { &(*node.as_ptr()).data }, tid);
            if pos.found {
                // already present, the fresh node was never published
                unsafe { self.tracker.reclaim(node, tid) };
                break false;
            }

            self.tracker.oa_read(unsafe { pos.prev.as_ref() }.as_atomic(), 0, tid);
            self.tracker.oa_reserve(pos.cur, 1, tid);

            unsafe { (*node.as_ptr()).next.store(pos.cur, Release) };
            // (LIS:1) this `AcqRel` CAS synchronizes-with the `Acquire`
            // loads of any traversal passing the new node
            if unsafe { pos.prev.as_ref() }.cas(pos.cur, node.as_ptr()) {
                self.size.fetch_add(1, Relaxed);
                break true;
            }
        };

        self.tracker.end_op(tid);
        self.tracker.oa_clear(tid);
        self.tracker.clear_all(tid);

        result
    }

    /// Removes `value` and returns `true` if it was present.
    pub fn delete(&self, value: &T, tid: usize) -> bool {
        self.monitor.collect(self.tracker.retired_cnt(tid), tid);
        self.tracker.start_op(tid);

        let result = loop {
            let pos = self.search(value, tid);
            if !pos.found {
                break false;
            }

            self.tracker.oa_read(unsafe { pos.prev.as_ref() }.as_atomic(), 0, tid);
            self.tracker.oa_reserve(pos.cur, 1, tid);
            self.tracker.oa_reserve(pos.next, 2, tid);

            if self.tracker.check_warning(tid) {
                // a concurrent recycling pass may have fed us stale
                // pointers, drop them and start over
                self.tracker.reset_warning(tid);
                self.tracker.oa_clear(tid);
                continue;
            }

            // logical delete: set the mark on cur's next pointer
            let cur = unsafe { &*pos.cur };
            if cur.next.cas(pos.next, marked(pos.next)) {
                self.size.fetch_sub(1, Relaxed);
            } else {
                continue;
            }

            // physical unlink; on failure a traversal helps out
            if unsafe { pos.prev.as_ref() }.cas(pos.cur, pos.next) {
                unsafe { self.tracker.retire(NonNull::new_unchecked(pos.cur), tid) };
            } else {
                let _ = self.search(value, tid);
            }
            break true;
        };

        self.tracker.end_op(tid);
        self.tracker.clear_all(tid);
        self.tracker.oa_clear(tid);

        result
    }

    /// Returns `true` if `value` is in the list.
    pub fn find(&self, value: &T, tid: usize) -> bool {
        self.monitor.collect(self.tracker.retired_cnt(tid), tid);
        self.tracker.start_op(tid);

        let found = self.search(value, tid).found;

        self.tracker.clear_all(tid);
        self.tracker.end_op(tid);

        found
    }

    /// Returns the number of elements in the list.
    ///
    /// The counter is advisory while operations are in flight and exact at
    /// quiescence.
    #[inline]
    pub fn size(&self) -> usize {
        self.size.load(Relaxed)
    }

    /// Returns the accumulated retired-count samples of thread `tid`.
    #[inline]
    pub fn report_retired(&self, tid: usize) -> u64 {
        self.monitor.report(tid)
    }

    /// Locates the first node with `key >= data`.
    ///
    /// On return `prev` references the link that led to `cur`; `cur` and
    /// `next` are protected by the slots 1/2 and 0 respectively. Marked
    /// nodes encountered on the way are unlinked and retired.
    fn search(&self, key: &T, tid: usize) -> Position<T> {
        'retry: loop {
            let mut prev = NonNull::from(&*self.head);
            let mut cur =
                unmarked(self.tracker.read(unsafe { prev.as_ref() }.as_atomic(), 1, tid));

            loop {
                if cur.is_null() {
                    return Position { found: false, prev, cur, next: ptr::null_mut() };
                }

                let next_raw =
                    self.tracker.read(unsafe { &(*cur).next }.as_atomic(), 0, tid);
                if self.tracker.check_warning(tid) {
                    self.tracker.reset_warning(tid);
                    continue 'retry;
                }

                let cmark = is_marked(next_raw);
                let next = unmarked(next_raw);

                // consistency: cur's link must not have changed since the
                // first load
                if compose(next, cmark)
                    != self.tracker.read(unsafe { &(*cur).next }.as_atomic(), 1, tid)
                {
                    continue 'retry;
                }

                let cur_data = unsafe { (*cur).data.clone() };

                // prev must still lead to cur, otherwise cur_data may be
                // stale
                if self.tracker.read(unsafe { prev.as_ref() }.as_atomic(), 2, tid) != cur {
                    continue 'retry;
                }

                if !cmark {
                    if cur_data >= *key {
                        return Position { found: cur_data == *key, prev, cur, next };
                    }
                    prev = unsafe { NonNull::from(&(*cur).next) };
                } else {
                    // help unlink the logically deleted node
                    if unsafe { prev.as_ref() }.cas(cur, next) {
                        unsafe { self.tracker.retire(NonNull::new_unchecked(cur), tid) };
                    } else {
                        continue 'retry;
                    }
                }

                cur = next;
            }
        }
    }
}

/********** impl Drop *****************************************************************************/

impl<T> Drop for OrderedList<T> {
    fn drop(&mut self) {
        let mut cur = unmarked(self.head.load(Relaxed));
        while !cur.is_null() {
            let next = unmarked(unsafe { (*cur).next.load(Relaxed) });
            unsafe { crate::tracker::block::Block::reclaim(NonNull::new_unchecked(cur)) };
            cur = next;
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// MarkPtr
////////////////////////////////////////////////////////////////////////////////////////////////////

/// An atomic node pointer whose lowest bit is the delete mark.
struct MarkPtr<T>(AtomicPtr<Node<T>>);

/********** impl inherent *************************************************************************/

impl<T> MarkPtr<T> {
    #[inline]
    fn null() -> Self {
        Self(AtomicPtr::new(ptr::null_mut()))
    }

    #[inline]
    fn as_atomic(&self) -> &AtomicPtr<Node<T>> {
        &self.0
    }

    #[inline]
    fn load(&self, order: core::sync::atomic::Ordering) -> *mut Node<T> {
        self.0.load(order)
    }

    #[inline]
    fn store(&self, ptr: *mut Node<T>, order: core::sync::atomic::Ordering) {
        self.0.store(ptr, order)
    }

    #[inline]
    fn cas(&self, current: *mut Node<T>, new: *mut Node<T>) -> bool {
        self.0.compare_exchange(current, new, AcqRel, Acquire).is_ok()
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Node
////////////////////////////////////////////////////////////////////////////////////////////////////

struct Node<T> {
    data: T,
    next: MarkPtr<T>,
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Position
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The result of a search: the link that led to `cur` plus the protected
/// `cur` and `next` pointers.
struct Position<T> {
    found: bool,
    prev: NonNull<MarkPtr<T>>,
    cur: *mut Node<T>,
    next: *mut Node<T>,
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// RetiredMonitor
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Accumulates per-thread samples of the tracker's outstanding retired
/// counts, taken at the start of every operation.
struct RetiredMonitor {
    cells: Box<[Padded<AtomicU64>]>,
}

/********** impl inherent *************************************************************************/

impl RetiredMonitor {
    #[inline]
    fn new(task_num: usize) -> Self {
        Self { cells: (0..task_num).map(|_| Padded::new(AtomicU64::new(0))).collect() }
    }

    #[inline]
    fn collect(&self, outstanding: u64, tid: usize) {
        self.cells[tid].fetch_add(outstanding, Relaxed);
    }

    #[inline]
    fn report(&self, tid: usize) -> u64 {
        self.cells[tid].load(Relaxed)
    }
}
