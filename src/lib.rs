//! A library of interchangeable safe memory reclamation (SMR) schemes for
//! lock-free data structures, together with a reference lock-free ordered
//! set built on top of them.
//!
//! # Trackers
//!
//! The [`MemoryTracker`] facade selects one reclamation [`Policy`] at
//! construction and presents a uniform per-thread operation interface:
//! operations are bracketed by `start_op`/`end_op`, pointer loads go
//! through `read` (which publishes hazard slots or widens epoch
//! reservations, depending on the scheme), and removed objects are handed
//! over with `retire`. Physical reclamation happens lazily, either
//! throttled at retire time or when an allocation finds its free pool
//! empty.
//!
//! Threads are pre-enumerated: every instance is constructed for a fixed
//! `task_num` and each caller passes its stable thread id in
//! `[0, task_num)`. Passing an out-of-range id or sharing one id between
//! threads violates the caller contract; this is asserted in debug builds.
//!
//! # Ordered Set
//!
//! [`OrderedList`] is a sorted singly-linked list with a marked-pointer
//! logical-delete bit, implemented directly on the tracker facade. The
//! [`baseline`] module keeps a thin variant of the same algorithm with a
//! built-in hazard pointer domain instead of a tracker.

pub mod baseline;

mod config;
mod list;
mod primitives;
mod tracker;

pub use crate::config::{Config, ConfigBuilder, Policy, MAX_SLOTS};
pub use crate::list::OrderedList;
pub use crate::tracker::{Forecaster, MemoryTracker, MinuteSample, RatioForecaster};
