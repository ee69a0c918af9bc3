//! Policy selection and one-time configuration of the runtime parameters
//! used by the reclamation schemes.

use core::fmt;

cfg_if::cfg_if! {
    if #[cfg(feature = "no-gc")] {
        const DEFAULT_COLLECT: bool = false;
    } else {
        const DEFAULT_COLLECT: bool = true;
    }
}

/// The maximum number of logical slots per thread the facade can rename.
pub const MAX_SLOTS: usize = 8;

const DEFAULT_EPOCH_FREQ: u64 = 150;
const DEFAULT_EMPTY_FREQ: u64 = 30;
const DEFAULT_SLOT_NUM: usize = 3;

////////////////////////////////////////////////////////////////////////////////////////////////////
// Policy
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The reclamation policy tags.
///
/// The numeric values are stable identifiers and must not be changed.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
#[repr(i32)]
pub enum Policy {
    /// No reclamation at all, retired records are leaked.
    Nil = 0,
    /// Hazard pointers with a fixed per-thread slot table.
    Hazard = 1,
    /// Epoch based reclamation with per-operation reservations.
    Rcu = 2,
    /// Hazard pointers with dynamic slot acquisition (unsupported).
    HazardDynamic = 3,
    /// Interval based reclamation with a single reserved epoch per thread.
    Interval = 4,
    /// Hazard eras, combining era intervals with per-thread era slots.
    He = 5,
    /// Legacy tag for range based reclamation.
    Range = 6,
    /// Range based reclamation with a `(lower, upper)` reservation pair.
    RangeNew = 8,
    /// Quiescent state based reclamation (threads stay on-line between
    /// operations).
    Qsbr = 10,
    /// Range tracker variant for 32-bit hosts (unsupported).
    RangeTp = 12,
    /// Optimistic access with a shared, versioned free-list pool triple.
    Oa = 20,
    /// Bounded optimistic access with per-thread pools and a reserve
    /// forecast.
    Boa = 21,
}

/********** impl inherent *************************************************************************/

impl Policy {
    /// Returns the stable numeric identifier of the policy.
    #[inline]
    pub fn tag(self) -> i32 {
        self as i32
    }

    /// Returns `true` if a tracker can be constructed for this policy.
    #[inline]
    pub fn is_supported(self) -> bool {
        !matches!(self, Policy::HazardDynamic | Policy::RangeTp)
    }
}

/********** impl Display **************************************************************************/

impl fmt::Display for Policy {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Config
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Runtime configuration parameters shared by all reclamation schemes.
#[derive(Copy, Clone, Debug)]
pub struct Config {
    epoch_freq: u64,
    empty_freq: u64,
    slot_num: usize,
    collect: bool,
}

/********** impl Default **************************************************************************/

impl Default for Config {
    #[inline]
    fn default() -> Self {
        ConfigBuilder::new().build()
    }
}

/********** impl inherent *************************************************************************/

impl Config {
    /// Creates a new [`Config`] with the given parameters.
    ///
    /// # Panics
    ///
    /// This function panics if `epoch_freq` or `empty_freq` is 0 or if
    /// `slot_num` is 0 or exceeds [`MAX_SLOTS`].
    #[inline]
    pub fn with_params(epoch_freq: u64, empty_freq: u64, slot_num: usize, collect: bool) -> Self {
        assert!(epoch_freq > 0, "epoch frequency must be greater than 0");
        assert!(empty_freq > 0, "empty frequency must be greater than 0");
        assert!(
            slot_num > 0 && slot_num <= MAX_SLOTS,
            "slot count must be in range 1..={}",
            MAX_SLOTS
        );
        Self { epoch_freq, empty_freq, slot_num, collect }
    }

    /// Returns the number of per-thread allocations between global epoch
    /// advances (scaled by the thread count).
    #[inline]
    pub fn epoch_freq(&self) -> u64 {
        self.epoch_freq
    }

    /// Returns the number of retired records between reclamation attempts.
    #[inline]
    pub fn empty_freq(&self) -> u64 {
        self.empty_freq
    }

    /// Returns the number of logical hazard slots per thread.
    #[inline]
    pub fn slot_num(&self) -> usize {
        self.slot_num
    }

    /// Returns `true` if physical reclamation is enabled.
    ///
    /// With `collect` disabled, retired records accumulate until the tracker
    /// is dropped. The default is `true` unless the `no-gc` feature is
    /// enabled.
    #[inline]
    pub fn collect(&self) -> bool {
        self.collect
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// ConfigBuilder
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A builder type for gradually initializing a [`Config`].
#[derive(Copy, Clone, Debug, Default)]
pub struct ConfigBuilder {
    epoch_freq: Option<u64>,
    empty_freq: Option<u64>,
    slot_num: Option<usize>,
    collect: Option<bool>,
}

impl ConfigBuilder {
    /// Creates a new [`ConfigBuilder`] with default values.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the epoch advance frequency.
    #[inline]
    pub fn epoch_freq(mut self, epoch_freq: u64) -> Self {
        self.epoch_freq = Some(epoch_freq);
        self
    }

    /// Sets the reclamation attempt frequency.
    #[inline]
    pub fn empty_freq(mut self, empty_freq: u64) -> Self {
        self.empty_freq = Some(empty_freq);
        self
    }

    /// Sets the number of logical hazard slots per thread.
    #[inline]
    pub fn slot_num(mut self, slot_num: usize) -> Self {
        self.slot_num = Some(slot_num);
        self
    }

    /// Enables or disables physical reclamation.
    #[inline]
    pub fn collect(mut self, collect: bool) -> Self {
        self.collect = Some(collect);
        self
    }

    /// Consumes the [`ConfigBuilder`] and returns an initialized [`Config`].
    ///
    /// Unspecified parameters are initialized with their default values.
    #[inline]
    pub fn build(self) -> Config {
        Config::with_params(
            self.epoch_freq.unwrap_or(DEFAULT_EPOCH_FREQ),
            self.empty_freq.unwrap_or(DEFAULT_EMPTY_FREQ),
            self.slot_num.unwrap_or(DEFAULT_SLOT_NUM),
            self.collect.unwrap_or(DEFAULT_COLLECT),
        )
    }
}
