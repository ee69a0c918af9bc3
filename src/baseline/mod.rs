//! The baseline ordered list: the same lock-free algorithm as the tracked
//! list, but with a minimal embedded hazard pointer domain instead of a
//! configurable tracker.
//!
//! Kept as a reference point; operations take no thread id, threads simply
//! acquire hazard slots from the shared domain on demand.

mod hazard;

use core::ptr::{self, NonNull};
use core::sync::atomic::{
    AtomicPtr, AtomicUsize,
    Ordering::{Acquire, Relaxed, Release},
};

use crate::primitives::{is_marked, marked, unmarked};

use self::hazard::{Guard, HazardDomain};

////////////////////////////////////////////////////////////////////////////////////////////////////
// OrderedList
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A concurrent linked-list based ordered set with embedded hazard pointer
/// reclamation.
pub struct OrderedList<T> {
    head: AtomicPtr<Node<T>>,
    size: AtomicUsize,
    domain: HazardDomain,
}

/********** impl Send + Sync **********************************************************************/

unsafe impl<T: Send> Send for OrderedList<T> {}
unsafe impl<T: Send + Sync> Sync for OrderedList<T> {}

/********** impl Default **************************************************************************/

impl<T: Ord> Default for OrderedList<T> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

/********** impl inherent *************************************************************************/

impl<T> OrderedList<T>
where
    T: Ord,
{
    /// Creates an empty list.
    #[inline]
    pub fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            size: AtomicUsize::new(0),
            domain: HazardDomain::new(),
        }
    }

    /// Inserts `value` and returns `true` if it was not present before.
    pub fn insert(&self, value: T) -> bool {
        let node = Box::into_raw(Box::new(Node { data: value, next: AtomicPtr::default() }));
        let mut guards = Guards::new(&self.domain);

        loop {
            let pos = self.search(unsafe { &(*node).data }, &mut guards);
            if pos.found {
                // already present, the new node was never published
                drop(unsafe { Box::from_raw(node) });
                return false;
            }

            unsafe { (*node).next.store(pos.cur, Release) };
            let prev = unsafe { pos.prev.as_ref() };
            if prev.compare_exchange_weak(pos.cur, node, Release, Relaxed).is_ok() {
                self.size.fetch_add(1, Relaxed);
                return true;
            }
        }
    }

    /// Removes `value` and returns `true` if it was present.
    pub fn delete(&self, value: &T) -> bool {
        let mut guards = Guards::new(&self.domain);

        let (pos, next) = loop {
            let pos = self.search(value, &mut guards);
            if !pos.found {
                return false;
            }

            let next = unsafe { (*pos.cur).next.load(Acquire) };
            if is_marked(next) {
                // another deleter won the race, retry from the search
                continue;
            }

            // logical delete: set the mark on cur's next pointer
            let cur_next = unsafe { &(*pos.cur).next };
            if cur_next.compare_exchange_weak(next, marked(next), Release, Relaxed).is_ok() {
                break (pos, next);
            }
        };

        // physical unlink; on failure a traversal helps out
        let prev = unsafe { pos.prev.as_ref() };
        if prev.compare_exchange(pos.cur, next, Release, Relaxed).is_ok() {
            self.size.fetch_sub(1, Relaxed);
            unsafe { self.domain.retire(NonNull::new_unchecked(pos.cur).cast(), drop_node::<T>) };
        } else {
            guards.clear();
            let _ = self.search(value, &mut guards);
        }
        true
    }

    /// Returns `true` if `value` is in the list.
    #[inline]
    pub fn find(&self, value: &T) -> bool {
        let mut guards = Guards::new(&self.domain);
        self.search(value, &mut guards).found
    }

    /// Returns the number of elements in the list.
    #[inline]
    pub fn size(&self) -> usize {
        self.size.load(Relaxed)
    }

    /// Locates the first node with `key >= data`, helping to unlink marked
    /// nodes on the way. `guards.cur` protects the returned node, and
    /// `guards.prev` the node owning the link that leads to it.
    fn search(&self, key: &T, guards: &mut Guards) -> Position<T> {
        'retry: loop {
            let mut prev = NonNull::from(&self.head);
            let mut cur = unsafe { prev.as_ref() }.load(Acquire);

            loop {
                let cur_node = unmarked(cur);
                guards.cur.protect(cur_node as *mut ());

                // cur must still be prev's successor, otherwise the
                // protection may have come too late
                if unsafe { prev.as_ref() }.load(Acquire) != cur {
                    continue 'retry;
                }

                if cur_node.is_null() {
                    return Position { found: false, prev, cur: cur_node };
                }

                let next = unsafe { (*cur_node).next.load(Acquire) };
                if is_marked(next) {
                    // help unlink the logically deleted node
                    let prev_ref = unsafe { prev.as_ref() };
                    if prev_ref.compare_exchange(cur, unmarked(next), Release, Relaxed).is_err()
                    {
                        continue 'retry;
                    }

                    unsafe {
                        self.domain
                            .retire(NonNull::new_unchecked(cur_node).cast(), drop_node::<T>)
                    };
                    self.size.fetch_sub(1, Relaxed);
                    cur = unmarked(next);
                    continue;
                }

                let cur_data = unsafe { &(*cur_node).data };
                // prev must still lead to cur, otherwise cur_data may
                // belong to an already unlinked node
                if unsafe { prev.as_ref() }.load(Acquire) != cur {
                    continue 'retry;
                }

                if *cur_data >= *key {
                    return Position { found: *cur_data == *key, prev, cur: cur_node };
                }

                // keep the node owning the next link protected
                guards.swap();
                prev = unsafe { NonNull::from(&(*cur_node).next) };
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
            let node = unsafe { Box::from_raw(cur) };
            cur = unmarked(node.next.load(Relaxed));
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Node
////////////////////////////////////////////////////////////////////////////////////////////////////

struct Node<T> {
    data: T,
    next: AtomicPtr<Node<T>>,
}

unsafe fn drop_node<T>(ptr: *mut ()) {
    drop(Box::from_raw(ptr as *mut Node<T>));
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Guards
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The two hazard slots a traversal needs.
struct Guards<'d> {
    prev: Guard<'d>,
    cur: Guard<'d>,
}

/********** impl inherent *************************************************************************/

impl<'d> Guards<'d> {
    #[inline]
    fn new(domain: &'d HazardDomain) -> Self {
        Self { prev: domain.acquire(), cur: domain.acquire() }
    }

    #[inline]
    fn swap(&mut self) {
        core::mem::swap(&mut self.prev, &mut self.cur);
    }

    #[inline]
    fn clear(&mut self) {
        self.prev.clear();
        self.cur.clear();
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Position
////////////////////////////////////////////////////////////////////////////////////////////////////

struct Position<T> {
    found: bool,
    prev: NonNull<AtomicPtr<Node<T>>>,
    cur: *mut Node<T>,
}
