use std::any::Any;
use std::fmt::{Debug, Formatter};
use std::num::NonZeroU64;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::{Nanos, clamp_nanos};
use crate::error::ConfigError;
use crate::node::NodeId;

/// A single replenishing counter: `tokens_per_period` tokens accrue every
/// `period`, up to a ceiling of `max_tokens`, in batches of at least
/// `min_to_refill`.
///
/// A limit has no lifecycle of its own; it is built, handed to a
/// [`Bucket`](crate::Bucket), and from then on only mutated through that
/// bucket's consumption path or its [`update`](crate::Bucket::update)
/// transaction.
///
/// The refill arithmetic is integer-exact. Elapsed time is accounted in
/// whole per-token units and the fractional remainder is carried forward,
/// never rounded away, so polling a limit of 9 tokens per 10 seconds every
/// second yields exactly 9 tokens over the period. All additions saturate
/// instead of overflowing.
///
/// # Examples
///
/// ```rust
/// use std::num::NonZeroU64;
/// use std::time::Duration;
/// use tollgate::Limit;
///
/// // 100 tokens per second, ceiling of 500, refilled in batches of 10
/// let limit = Limit::new(NonZeroU64::new(100).unwrap(), Duration::from_secs(1))
///     .with_max_tokens(500)
///     .with_min_to_refill(NonZeroU64::new(10).unwrap());
/// ```
#[derive(Clone)]
pub struct Limit {
    tokens_per_period: NonZeroU64,
    period: Duration,
    max_tokens: u64,
    min_to_refill: NonZeroU64,
    available: i64,
    last_refilled_at: Nanos,
    user_data: Option<Arc<dyn Any + Send + Sync>>,
}

impl Debug for Limit {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Limit")
            .field("tokens_per_period", &self.tokens_per_period)
            .field("period", &self.period)
            .field("max_tokens", &self.max_tokens)
            .field("min_to_refill", &self.min_to_refill)
            .field("available", &self.available)
            .field("last_refilled_at", &self.last_refilled_at)
            .finish_non_exhaustive()
    }
}

pub(crate) struct Simulation {
    pub(crate) grant: u64,
    pub(crate) available_at: Nanos,
}

impl Limit {
    /// Creates a limit accruing `tokens_per_period` tokens every `period`.
    ///
    /// The ceiling defaults to `tokens_per_period`, the limit starts full,
    /// and refill batching is off (`min_to_refill` of 1). Invariants are
    /// validated when the limit is handed to a bucket, not here.
    pub fn new(tokens_per_period: NonZeroU64, period: Duration) -> Self {
        Self {
            tokens_per_period,
            period,
            max_tokens: tokens_per_period.get(),
            min_to_refill: NonZeroU64::MIN,
            available: tokens_per_period.get().min(i64::MAX as u64) as i64,
            last_refilled_at: Nanos::ZERO,
            user_data: None,
        }
    }

    /// Sets the ceiling the counter can accrue to.
    pub fn with_max_tokens(mut self, max_tokens: u64) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Sets the starting balance, overriding the start-full default.
    pub fn with_initial_tokens(mut self, tokens: u64) -> Self {
        self.available = tokens.min(i64::MAX as u64) as i64;
        self
    }

    /// Sets the refill batch threshold: accrued tokens are only credited
    /// once at least this many whole tokens are pending, which keeps
    /// high-frequency polling from turning into a stream of tiny updates.
    pub fn with_min_to_refill(mut self, min_to_refill: NonZeroU64) -> Self {
        self.min_to_refill = min_to_refill;
        self
    }

    /// Attaches an opaque payload for the caller's own bookkeeping.
    pub fn with_user_data(mut self, user_data: Arc<dyn Any + Send + Sync>) -> Self {
        self.user_data = Some(user_data);
        self
    }

    pub fn tokens_per_period(&self) -> NonZeroU64 {
        self.tokens_per_period
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn max_tokens(&self) -> u64 {
        self.max_tokens
    }

    pub fn min_to_refill(&self) -> NonZeroU64 {
        self.min_to_refill
    }

    /// Current balance. Negative only after an explicit
    /// [`set_available`](Self::set_available) override.
    pub fn available(&self) -> i64 {
        self.available
    }

    pub fn user_data(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.user_data.clone()
    }

    /// Refill rate in tokens per second.
    pub fn rate(&self) -> f64 {
        self.tokens_per_period.get() as f64 / self.period.as_secs_f64()
    }

    /// Replaces the refill amount per period.
    pub fn set_tokens_per_period(&mut self, tokens_per_period: NonZeroU64) {
        self.tokens_per_period = tokens_per_period;
    }

    /// Replaces the refill period.
    pub fn set_period(&mut self, period: Duration) {
        self.period = period;
    }

    /// Replaces the ceiling.
    pub fn set_max_tokens(&mut self, max_tokens: u64) {
        self.max_tokens = max_tokens;
    }

    /// Replaces the refill batch threshold.
    pub fn set_min_to_refill(&mut self, min_to_refill: NonZeroU64) {
        self.min_to_refill = min_to_refill;
    }

    /// Administrative override of the balance.
    ///
    /// This is the only write path that may drive the balance negative;
    /// organic refill/consume arithmetic never does. A negative balance
    /// penalizes the counter: consumption stays blocked until refills work
    /// the debt back above zero.
    pub fn set_available(&mut self, available: i64) {
        self.available = available;
    }

    /// Replaces the opaque payload.
    pub fn set_user_data(&mut self, user_data: Option<Arc<dyn Any + Send + Sync>>) {
        self.user_data = user_data;
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.period.is_zero() {
            return Err(ConfigError::ZeroPeriod);
        }
        if self.max_tokens > i64::MAX as u64 {
            return Err(ConfigError::CapacityOverflow(self.max_tokens));
        }
        if self.max_tokens < self.tokens_per_period.get() {
            return Err(ConfigError::MaxBelowRate {
                maximum: self.max_tokens,
                rate: self.tokens_per_period.get(),
            });
        }
        if self.available > self.max_tokens as i64 {
            return Err(ConfigError::AvailableAboveMax {
                available: self.available,
                maximum: self.max_tokens,
            });
        }
        Ok(())
    }

    pub(crate) fn stamp(&mut self, at: Nanos) {
        self.last_refilled_at = at;
    }

    /// Duration of one whole token in nanoseconds, floored, and clamped to
    /// at least 1ns so rates above one token per nanosecond stay defined.
    fn unit_nanos(&self) -> u64 {
        clamp_nanos(self.period.as_nanos() / self.tokens_per_period.get() as u128).max(1)
    }

    /// Tokens accrued between `last_refilled_at` and `at`, with the instant
    /// the accounting would advance to. Returns `None` when nothing is
    /// credited: a backward/stale reading, or fewer whole tokens pending
    /// than the batch threshold.
    fn pending_refill(&self, at: Nanos) -> Option<(u64, Nanos)> {
        let elapsed = at.checked_since(self.last_refilled_at)?;
        let unit = self.unit_nanos();
        let to_add = elapsed / unit;
        if to_add < self.min_to_refill.get() {
            return None;
        }
        // advance by whole units only, never snap to `at`: the fractional
        // remainder belongs to the next refill
        let advanced = self
            .last_refilled_at
            .saturating_add_nanos(unit.saturating_mul(to_add));
        Some((to_add, advanced))
    }

    /// Credits accrued tokens up to `at`. A backward clock reading is a
    /// no-op, not an error.
    pub(crate) fn refill(&mut self, at: Nanos) {
        if let Some((to_add, advanced)) = self.pending_refill(at) {
            self.last_refilled_at = advanced;
            self.available = self
                .available
                .saturating_add(to_add.min(i64::MAX as u64) as i64)
                .min(self.max_tokens as i64);
        }
    }

    /// Decides what this limit would grant for a `[min, max]` request at
    /// `at`, without committing anything.
    ///
    /// Grants the whole positive balance capped at `max` when that covers
    /// `min`; otherwise grants nothing and projects the instant the missing
    /// tokens will have accrued. The projection rounds periods up: granting
    /// too early is the defect, waiting out a partial period is not.
    pub(crate) fn simulate(&self, min: u64, max: u64, at: Nanos) -> Simulation {
        let grantable = self.available.clamp(0, max.min(i64::MAX as u64) as i64) as u64;
        if grantable >= min {
            return Simulation {
                grant: grantable,
                available_at: at,
            };
        }
        let needed = (min as i128 - self.available as i128) as u128;
        let periods = needed.div_ceil(self.tokens_per_period.get() as u128);
        let wait = clamp_nanos(self.period.as_nanos().saturating_mul(periods));
        Simulation {
            grant: 0,
            available_at: at.saturating_add_nanos(wait),
        }
    }

    /// Debits a granted amount. The caller's simulate-then-commit protocol
    /// guarantees coverage; this is asserted, not re-validated.
    pub(crate) fn consume(&mut self, tokens: u64) {
        debug_assert!(tokens as i64 <= self.available.max(0));
        self.available -= tokens as i64;
    }

    pub(crate) fn snapshot(&self, bucket: NodeId, index: usize) -> LimitSnapshot {
        LimitSnapshot {
            bucket,
            index,
            tokens_per_period: self.tokens_per_period,
            period: self.period,
            max_tokens: self.max_tokens,
            min_to_refill: self.min_to_refill,
            available: self.available,
        }
    }
}

/// Immutable copy of a [`Limit`]'s configuration and balance, taken at a
/// decision instant. Identified by the owning bucket and the limit's
/// position in it.
#[derive(Debug, Clone)]
pub struct LimitSnapshot {
    bucket: NodeId,
    index: usize,
    tokens_per_period: NonZeroU64,
    period: Duration,
    max_tokens: u64,
    min_to_refill: NonZeroU64,
    available: i64,
}

impl LimitSnapshot {
    /// Id of the bucket owning the limit.
    pub fn bucket(&self) -> NodeId {
        self.bucket
    }

    /// Position of the limit within its bucket.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn tokens_per_period(&self) -> NonZeroU64 {
        self.tokens_per_period
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn max_tokens(&self) -> u64 {
        self.max_tokens
    }

    pub fn min_to_refill(&self) -> NonZeroU64 {
        self.min_to_refill
    }

    /// Balance at the instant the snapshot was taken.
    pub fn available(&self) -> i64 {
        self.available
    }

    pub fn rate(&self) -> f64 {
        self.tokens_per_period.get() as f64 / self.period.as_secs_f64()
    }
}
