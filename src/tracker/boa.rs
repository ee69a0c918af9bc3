//! The bounded optimistic scheme with forecast-driven pool sizing.
//!
//! Like the optimistic scheme, retired blocks flow through a
//! `retired -> processing -> ready` pool triple guarded by per-thread
//! warning bits, but the triple is per-thread and entirely free of
//! inter-thread CAS. Safety against recycling under a reader's feet comes
//! from the `(lower, upper)` interval reservations of the range scheme: a
//! drained block is only recycled (or released) once its `[birth, retire]`
//! interval is disjoint from every reservation.
//!
//! The size of the ready pool is steered by a demand forecast over the
//! per-minute allocation history. The forecasting model itself is a
//! replaceable strategy behind the [`Forecaster`] trait; correctness never
//! depends on its accuracy, only the number of pre-allocated blocks does.

use core::mem;
use core::ptr::NonNull;
use core::sync::atomic::{
    fence, AtomicBool, AtomicPtr, AtomicU64,
    Ordering::{AcqRel, Acquire, Relaxed, Release, SeqCst},
};

use std::time::Instant;

use arrayvec::ArrayVec;

use crate::config::Config;
use crate::primitives::{Padded, PerThread};
use crate::tracker::block::Block;
use crate::tracker::{RetiredCounts, Tracker, INACTIVE};

/// The number of blocks each thread's ready pool is seeded with.
const READY_SEED: usize = 2_000;

/// The number of one-minute samples fed into the forecast.
const RESERVE_WINDOW: usize = 5;

/// The number of forecast runs averaged into the reserve estimate.
const MODEL_RUNS: usize = 5;

/// Upper bound on the reserve estimate; forecasts are advisory and must
/// not grow the pool without bound.
const RESERVE_CAP: u64 = 4_096;

////////////////////////////////////////////////////////////////////////////////////////////////////
// MinuteSample
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Allocation and deallocation counts of one wall-clock minute.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct MinuteSample {
    /// Blocks handed out during the minute.
    pub allocs: u64,
    /// Blocks retired during the minute.
    pub deallocs: u64,
}

/********** impl inherent *************************************************************************/

impl MinuteSample {
    /// Returns the net demand of the minute.
    #[inline]
    pub fn diff(&self) -> i64 {
        self.allocs as i64 - self.deallocs as i64
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Forecaster (trait)
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A replaceable demand prediction strategy.
///
/// The tracker requests up to [`MODEL_RUNS`] forecasts per reclamation pass
/// and averages them. Returning `None` signals an empty model; the tracker
/// then falls back to the most recent sample and stops requesting further
/// runs.
pub trait Forecaster: Send {
    /// Produces one forecast of the net block demand over `window`, the
    /// most recent per-minute samples (oldest first). `run` is the index of
    /// the forecast within the current pass.
    fn forecast(&mut self, window: &[MinuteSample], run: usize) -> Option<i64>;
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// RatioForecaster
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The default forecasting strategy: a naive allocation/deallocation ratio
/// extrapolation.
#[derive(Copy, Clone, Debug, Default)]
pub struct RatioForecaster;

/********** impl Forecaster ***********************************************************************/

impl Forecaster for RatioForecaster {
    #[inline]
    fn forecast(&mut self, window: &[MinuteSample], _run: usize) -> Option<i64> {
        let allocs: u64 = window.iter().map(|sample| sample.allocs).sum();
        let deallocs: u64 = window.iter().map(|sample| sample.deallocs).sum();

        let demand = (allocs / (deallocs + 1)).saturating_mul(2).saturating_mul(allocs);
        Some(demand.min(i64::max_value() as u64) as i64)
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// ThreadState
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The single-threaded pool triple and allocation history of one thread.
struct ThreadState<T> {
    retired: Vec<NonNull<T>>,
    processing: Vec<NonNull<T>>,
    ready: Vec<NonNull<T>>,
    window: ArrayVec<[(u64, MinuteSample); RESERVE_WINDOW]>,
    forecaster: Box<dyn Forecaster>,
    alloc_counter: u64,
}

/********** impl inherent *************************************************************************/

impl<T> ThreadState<T> {
    fn new() -> Self {
        let mut ready = Vec::with_capacity(READY_SEED);
        for _ in 0..READY_SEED {
            if let Some(block) = Block::alloc(INACTIVE) {
                ready.push(block);
            }
        }

        Self {
            retired: Vec::new(),
            processing: Vec::new(),
            ready,
            window: ArrayVec::new(),
            forecaster: Box::new(RatioForecaster),
            alloc_counter: 0,
        }
    }

    /// Returns the sample of `minute`, evicting the oldest entry if the
    /// window is full.
    fn sample(&mut self, minute: u64) -> &mut MinuteSample {
        let stale = match self.window.last() {
            Some(&(last, _)) => last != minute,
            None => true,
        };
        if stale {
            if self.window.is_full() {
                self.window.remove(0);
            }
            self.window.push((minute, MinuteSample::default()));
        }

        let last = self.window.len() - 1;
        &mut self.window[last].1
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// BoaTracker
////////////////////////////////////////////////////////////////////////////////////////////////////

pub(crate) struct BoaTracker<T> {
    task_num: usize,
    epoch_freq: u64,
    collect: bool,
    warnings: Box<[Padded<AtomicBool>]>,
    upper_reservs: Box<[Padded<AtomicU64>]>,
    lower_reservs: Box<[Padded<AtomicU64>]>,
    epoch: AtomicU64,
    start: Instant,
    threads: PerThread<ThreadState<T>>,
    counts: RetiredCounts,
}

/********** impl Send + Sync **********************************************************************/

unsafe impl<T: Send> Send for BoaTracker<T> {}
unsafe impl<T: Send> Sync for BoaTracker<T> {}

/********** impl inherent *************************************************************************/

impl<T> BoaTracker<T> {
    #[inline]
    pub fn new(task_num: usize, config: Config) -> Self {
        Self {
            task_num,
            epoch_freq: config.epoch_freq(),
            collect: config.collect(),
            warnings: (0..task_num).map(|_| Padded::new(AtomicBool::new(false))).collect(),
            upper_reservs: (0..task_num)
                .map(|_| Padded::new(AtomicU64::new(INACTIVE)))
                .collect(),
            lower_reservs: (0..task_num)
                .map(|_| Padded::new(AtomicU64::new(INACTIVE)))
                .collect(),
            epoch: AtomicU64::new(0),
            start: Instant::now(),
            threads: PerThread::new(task_num, ThreadState::new),
            counts: RetiredCounts::new(task_num),
        }
    }

    #[inline]
    fn current_epoch(&self) -> u64 {
        self.epoch.load(Acquire)
    }

    #[inline]
    fn minute(&self) -> u64 {
        self.start.elapsed().as_secs() / 60
    }

    /// Returns `true` if any reservation interval overlaps the lifetime
    /// interval recorded in the block trailer of `obj`.
    fn check_conflict(&self, obj: NonNull<T>) -> bool {
        let (birth_epoch, retire_epoch) =
            unsafe { (Block::birth_epoch(obj), Block::retire_epoch(obj)) };

        for i in 0..self.task_num {
            let upper = self.upper_reservs[i].load(Acquire);
            let lower = self.lower_reservs[i].load(Acquire);
            if upper >= birth_epoch && lower <= retire_epoch {
                return true;
            }
        }
        false
    }

    /// Averages up to [`MODEL_RUNS`] forecasts into a bounded reserve
    /// estimate for the ready pool.
    fn handle_reserve(state: &mut ThreadState<T>) -> u64 {
        let window: ArrayVec<[MinuteSample; RESERVE_WINDOW]> =
            state.window.iter().map(|&(_, sample)| sample).collect();
        if window.is_empty() {
            return 0;
        }

        let mut sum = 0i64;
        let mut runs = 0i64;
        for run in 0..MODEL_RUNS {
            match state.forecaster.forecast(&window, run) {
                Some(prediction) => {
                    sum = sum.saturating_add(prediction);
                    runs += 1;
                }
                None => {
                    // empty model, fall back to the most recent sample
                    sum = sum.saturating_add(window[window.len() - 1].diff());
                    runs += 1;
                    break;
                }
            }
        }

        let average = (sum as f64 / runs as f64).round() as i64;
        if average <= 0 {
            0
        } else {
            (average as u64).min(RESERVE_CAP)
        }
    }

    /// Rotates the thread's pool triple, recycling drained blocks up to the
    /// forecast demand and releasing the surplus.
    fn empty(&self, tid: usize) {
        if !self.collect {
            return;
        }
        let state = unsafe { self.threads.get(tid) };

        // 1. size the ready pool against forecast demand
        let mut reserve_cnt = Self::handle_reserve(state);

        // 2. rotate; no CAS, the pools are owned by this thread
        mem::swap(&mut state.retired, &mut state.processing);

        // 3. force every active reader to restart
        for warning in self.warnings.iter() {
            warning.store(true, Release);
        }
        // (BOA:1) this `SeqCst` fence orders the warning stores before the
        // conflict checks below; a reader that does not observe its warning
        // has published its reservation interval before the fence
        fence(SeqCst);

        // 4. drain the processing pool
        while let Some(obj) = state.processing.pop() {
            if !self.check_conflict(obj) {
                if reserve_cnt > 0 {
                    state.ready.push(obj);
                    reserve_cnt -= 1;
                } else {
                    // over the forecast, hand the storage back
                    unsafe { Block::free_raw(obj) };
                }
            } else {
                state.retired.push(obj);
            }
        }

        // 5. meet the remaining forecast with fresh blocks
        while reserve_cnt > 0 {
            match Block::alloc(INACTIVE) {
                Some(fresh) => state.ready.push(fresh),
                None => break,
            }
            reserve_cnt -= 1;
        }
    }
}

/********** impl Tracker **************************************************************************/

impl<T> Tracker<T> for BoaTracker<T> {
    #[inline]
    fn counts(&self) -> &RetiredCounts {
        &self.counts
    }

    fn alloc(&self, tid: usize) -> Option<NonNull<T>> {
        let minute = self.minute();
        {
            let state = unsafe { self.threads.get(tid) };
            state.alloc_counter += 1;
            if state.alloc_counter % (self.epoch_freq * self.task_num as u64) == 0 {
                self.epoch.fetch_add(1, AcqRel);
            }
            state.sample(minute).allocs += 1;
        }

        let mut rotations = 0;
        loop {
            let popped = unsafe { self.threads.get(tid).ready.pop() };
            match popped {
                Some(obj) => {
                    unsafe {
                        Block::set_birth_epoch(obj, self.current_epoch());
                        Block::set_retire_epoch(obj, INACTIVE);
                    }
                    return Some(obj);
                }
                None => {
                    if !self.collect {
                        return Block::alloc(self.current_epoch());
                    }
                    self.empty(tid);
                    rotations += 1;
                    if rotations == 2 {
                        // the garbage cannot be recycled, grow the pool by
                        // one so the allocation is bounded
                        let fresh = Block::alloc(INACTIVE)?;
                        unsafe { self.threads.get(tid).ready.push(fresh) };
                    }
                }
            }
        }
    }

    #[inline]
    fn start_op(&self, tid: usize) {
        let epoch = self.current_epoch();
        // (BOA:2) these `SeqCst` stores synchronize-with the `Acquire`
        // reservation loads in `check_conflict`
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
            // (BOA:3) see (BOA:2)
            self.upper_reservs[tid].store(curr_epoch, SeqCst);
            prev_epoch = curr_epoch;
        }
    }

    unsafe fn retire(&self, obj: NonNull<T>, tid: usize) {
        Block::set_retire_epoch(obj, self.current_epoch());

        let minute = self.minute();
        let state = self.threads.get(tid);
        state.retired.push(obj);
        state.sample(minute).deallocs += 1;
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
    fn retired_count(&self, tid: usize) -> usize {
        let state = unsafe { self.threads.get(tid) };
        state.retired.len() + state.processing.len()
    }
}

/********** impl Drop *****************************************************************************/

impl<T> Drop for BoaTracker<T> {
    fn drop(&mut self) {
        // pooled blocks are recycled storage, payload destructors do not run
        for state in self.threads.iter_mut() {
            for obj in state.retired.drain(..) {
                unsafe { Block::free_raw(obj) };
            }
            for obj in state.processing.drain(..) {
                unsafe { Block::free_raw(obj) };
            }
            for obj in state.ready.drain(..) {
                unsafe { Block::free_raw(obj) };
            }
        }
    }
}
