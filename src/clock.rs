use std::fmt::{Debug, Display};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// An instant on a [`Clock`], measured in nanoseconds since the clock's
/// origin.
///
/// All arithmetic on `Nanos` saturates; the accounting in this crate never
/// overflows, it pins at the representable extreme instead.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Nanos(u64);

impl Nanos {
    pub const ZERO: Nanos = Nanos(0);

    pub const fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    pub const fn as_nanos(&self) -> u64 {
        self.0
    }

    pub fn as_secs_f64(&self) -> f64 {
        self.0 as f64 / 1_000_000_000.0
    }

    pub(crate) const fn saturating_add_nanos(self, nanos: u64) -> Self {
        Self(self.0.saturating_add(nanos))
    }

    pub fn saturating_add(self, duration: Duration) -> Self {
        self.saturating_add_nanos(clamp_nanos(duration.as_nanos()))
    }

    /// Nanoseconds elapsed since `earlier`, or `None` if `earlier` is in
    /// the future (the clock appeared to go backward).
    pub(crate) const fn checked_since(self, earlier: Nanos) -> Option<u64> {
        self.0.checked_sub(earlier.0)
    }

    /// Duration from `earlier` until `self`; zero if already reached.
    pub fn saturating_since(self, earlier: Nanos) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(earlier.0))
    }
}

pub(crate) const fn clamp_nanos(nanos: u128) -> u64 {
    if nanos > u64::MAX as u128 {
        u64::MAX
    } else {
        nanos as u64
    }
}

impl Debug for Nanos {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(&Duration::from_nanos(self.0), f)
    }
}

impl Display for Nanos {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(&Duration::from_nanos(self.0), f)
    }
}

impl From<Duration> for Nanos {
    fn from(duration: Duration) -> Self {
        Nanos(clamp_nanos(duration.as_nanos()))
    }
}

/// Trait for monotonic clock implementations used by admission nodes.
///
/// Implementations must provide time that never goes backwards. A stale
/// reading is tolerated by the refill arithmetic (it becomes a no-op), but
/// a clock that jumps backward repeatedly will starve refills.
///
/// Every public operation on a node reads the clock exactly once at entry;
/// the same instant is used for the whole critical section.
pub trait Clock: Send + Sync {
    /// Returns the current time as nanoseconds since an arbitrary origin.
    fn now(&self) -> Nanos;
}

/// Standard clock implementation using [`std::time::Instant`].
///
/// This provides high precision timing but pays a system call per reading.
/// Enable the `quanta` feature and use [`QuantaClock`] when clock overhead
/// shows up in profiles.
///
/// # Examples
///
/// ```rust
/// use std::num::NonZeroU64;
/// use std::time::Duration;
/// use tollgate::{Bucket, Limit};
///
/// let limit = Limit::new(NonZeroU64::new(100).unwrap(), Duration::from_secs(1));
/// // Bucket::new uses StdClock
/// let bucket = Bucket::new(vec![limit]).unwrap();
/// ```
#[derive(Clone)]
pub struct StdClock {
    origin: std::time::Instant,
}

impl Default for StdClock {
    fn default() -> Self {
        Self {
            origin: std::time::Instant::now(),
        }
    }
}

impl Clock for StdClock {
    fn now(&self) -> Nanos {
        Nanos(clamp_nanos(self.origin.elapsed().as_nanos()))
    }
}

/// High-precision clock implementation using the `quanta` crate.
///
/// Cheaper per reading than [`StdClock`] on most platforms. Requires the
/// "quanta" feature to be enabled.
#[cfg(feature = "quanta")]
#[derive(Clone)]
pub struct QuantaClock {
    origin: quanta::Instant,
}

#[cfg(feature = "quanta")]
impl Default for QuantaClock {
    fn default() -> Self {
        Self::new(quanta::Clock::new())
    }
}

#[cfg(feature = "quanta")]
impl QuantaClock {
    /// Creates a new `QuantaClock` from a `quanta::Clock` instance.
    pub fn new(clock: quanta::Clock) -> Self {
        let origin = clock.now();
        Self { origin }
    }
}

#[cfg(feature = "quanta")]
impl Clock for QuantaClock {
    fn now(&self) -> Nanos {
        Nanos(clamp_nanos(self.origin.elapsed().as_nanos()))
    }
}

/// Manual clock implementation for testing and simulation.
///
/// Allows precise control over time progression, making it ideal for unit
/// tests and deterministic simulations of admission behavior.
///
/// # Examples
///
/// ```rust
/// use std::num::NonZeroU64;
/// use std::sync::Arc;
/// use std::time::Duration;
/// use tollgate::{AdmissionControl, Bucket, Limit, ManualClock, Nanos};
///
/// let clock = Arc::new(ManualClock::new(Nanos::ZERO));
/// let limit = Limit::new(NonZeroU64::new(10).unwrap(), Duration::from_secs(1))
///     .with_initial_tokens(0);
/// let bucket = Bucket::with_clock(vec![limit], clock.clone()).unwrap();
///
/// // initially empty
/// assert!(!bucket.try_consume(NonZeroU64::new(1).unwrap()).unwrap().is_granted());
///
/// // one second later the full per-period amount has accrued
/// clock.advance(Duration::from_secs(1));
/// assert!(bucket.try_consume(NonZeroU64::new(10).unwrap()).unwrap().is_granted());
/// ```
pub struct ManualClock {
    now: AtomicU64,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Nanos::ZERO)
    }
}

impl ManualClock {
    /// Creates a new manual clock starting at the specified instant.
    pub fn new(now: Nanos) -> Self {
        Self {
            now: AtomicU64::new(now.as_nanos()),
        }
    }

    /// Sets the current time to the specified instant.
    pub fn set(&self, now: Nanos) {
        self.now.store(now.as_nanos(), Ordering::Release);
    }

    /// Advances the current time by the specified duration.
    pub fn advance(&self, delta: Duration) {
        self.now
            .fetch_add(clamp_nanos(delta.as_nanos()), Ordering::AcqRel);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Nanos {
        Nanos(self.now.load(Ordering::Acquire))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nanos_saturate() {
        let near_max = Nanos::from_nanos(u64::MAX - 10);
        assert_eq!(
            near_max.saturating_add_nanos(100),
            Nanos::from_nanos(u64::MAX)
        );
        assert_eq!(Nanos::ZERO.saturating_since(near_max), Duration::ZERO);
    }

    #[test]
    fn nanos_since() {
        let a = Nanos::from_nanos(5);
        let b = Nanos::from_nanos(12);
        assert_eq!(b.checked_since(a), Some(7));
        assert_eq!(a.checked_since(b), None);
        assert_eq!(b.saturating_since(a), Duration::from_nanos(7));
    }

    #[test]
    fn manual_clock() {
        let clock = ManualClock::default();
        assert_eq!(clock.now(), Nanos::ZERO);
        clock.advance(Duration::from_millis(1500));
        assert_eq!(clock.now(), Nanos::from_nanos(1_500_000_000));
        clock.set(Nanos::from_nanos(42));
        assert_eq!(clock.now(), Nanos::from_nanos(42));
    }

    #[test]
    fn std_clock_monotonic() {
        let clock = StdClock::default();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }
}
