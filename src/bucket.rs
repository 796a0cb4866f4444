use std::sync::Arc;

use likely_stable::unlikely;
use parking_lot::RwLockWriteGuard;
use tracing::debug;

use crate::clock::{Clock, Nanos, StdClock};
use crate::error::{ConfigError, Error};
use crate::limit::{Limit, LimitSnapshot};
use crate::node::AdmissionControl;
use crate::node::ops::{NodeCore, NodeOps, Probe};
use crate::outcome::Outcome;
use crate::sync::NodeLock;

/// A leaf admission node AND-combining one or more [`Limit`]s.
///
/// A request succeeds only if every limit can supply it, and the commit is
/// atomic: all limits are debited by the same granted amount within one
/// critical section, never a subset. The limit whose projected availability
/// is furthest away is reported as the bottleneck on denial.
///
/// A bucket exclusively owns its limits; they are only reachable through
/// the bucket's snapshots and its [`update`](Bucket::update) transaction.
///
/// # Examples
///
/// ```rust
/// use std::num::NonZeroU64;
/// use std::time::Duration;
/// use tollgate::{AdmissionControl, Bucket, Limit};
///
/// // 100 requests/s and 10_000 requests/hour must both hold
/// let bucket = Bucket::new(vec![
///     Limit::new(NonZeroU64::new(100).unwrap(), Duration::from_secs(1)),
///     Limit::new(NonZeroU64::new(10_000).unwrap(), Duration::from_secs(3600)),
/// ])
/// .unwrap();
///
/// let outcome = bucket.try_consume(NonZeroU64::new(5).unwrap()).unwrap();
/// assert!(outcome.is_granted());
/// assert_eq!(outcome.granted(), 5);
/// ```
pub struct Bucket {
    core: NodeCore,
    state: NodeLock<BucketState>,
}

struct BucketState {
    limits: Vec<Limit>,
}

impl std::fmt::Debug for Bucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bucket")
            .field("id", &self.core.id())
            .finish_non_exhaustive()
    }
}

impl Bucket {
    /// Creates a bucket over `limits` using the standard clock.
    pub fn new(limits: Vec<Limit>) -> Result<Arc<Self>, ConfigError> {
        Self::with_clock(limits, Arc::new(StdClock::default()))
    }

    /// Creates a bucket over `limits` with an injected clock.
    ///
    /// Refill accounting for every limit starts at the clock's current
    /// reading.
    pub fn with_clock(
        mut limits: Vec<Limit>,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<Self>, ConfigError> {
        if limits.is_empty() {
            return Err(ConfigError::NoLimits);
        }
        for limit in &limits {
            limit.validate()?;
        }
        let core = NodeCore::new(clock);
        let now = core.now();
        for limit in &mut limits {
            limit.stamp(now);
        }
        Ok(Arc::new(Self {
            core,
            state: NodeLock::new(BucketState { limits }),
        }))
    }

    /// Consistent snapshot of the bucket's limits, in order.
    pub fn limits(&self) -> Vec<LimitSnapshot> {
        let state = self.state.read_fast();
        let id = self.core.id();
        state
            .limits
            .iter()
            .enumerate()
            .map(|(index, limit)| limit.snapshot(id, index))
            .collect()
    }

    /// The limit replenishing slowest, ranked by tokens per second; ties
    /// keep the earliest position.
    pub fn limit_with_lowest_refill_rate(&self) -> LimitSnapshot {
        let state = self.state.read_fast();
        let mut best = 0;
        for index in 1..state.limits.len() {
            if state.limits[index].rate() < state.limits[best].rate() {
                best = index;
            }
        }
        state.limits[best].snapshot(self.core.id(), best)
    }

    /// Opens a configuration transaction on this bucket's limit list.
    ///
    /// The transaction holds exclusive access to the bucket: consumers and
    /// readers block until it is resolved, so keep it short. Staged changes
    /// are applied atomically by [`commit`](BucketUpdate::commit); dropping
    /// the guard without committing discards them.
    pub fn update(&self) -> BucketUpdate<'_> {
        let guard = self.state.write();
        let staged = guard.limits.clone();
        BucketUpdate {
            bucket: self,
            guard,
            staged,
        }
    }
}

impl NodeOps for Bucket {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn structural_max(&self) -> u64 {
        let state = self.state.read_fast();
        state.limits.iter().map(Limit::max_tokens).min().unwrap_or(0)
    }

    fn try_consume_at(
        &self,
        min: u64,
        max: u64,
        requested_at: Nanos,
        now: Nanos,
    ) -> Result<Outcome, Error> {
        let id = self.core.id();
        let mut residue_left = false;
        let outcome = {
            let mut state = self.state.write();

            // a minimum no limit can ever hold fails fast, it never blocks
            let maximum = state.limits.iter().map(Limit::max_tokens).min().unwrap_or(0);
            if unlikely(min > maximum) {
                return Err(Error::BeyondCapacity {
                    requested: min,
                    maximum,
                });
            }

            for limit in &mut state.limits {
                limit.refill(now);
            }

            let mut grant = u64::MAX;
            let mut bottleneck = 0;
            let mut available_at = now;
            for (index, limit) in state.limits.iter().enumerate() {
                let sim = limit.simulate(min, max, now);
                grant = grant.min(sim.grant);
                if sim.available_at > available_at {
                    available_at = sim.available_at;
                    bottleneck = index;
                }
            }

            if grant > 0 {
                let mut remaining = i64::MAX;
                for limit in &mut state.limits {
                    limit.consume(grant);
                    remaining = remaining.min(limit.available());
                    residue_left |= limit.available() > 0;
                }
                Outcome::grant(id, min, max, grant, requested_at, now, remaining)
            } else {
                let limit = &state.limits[bottleneck];
                Outcome::denied(
                    id,
                    min,
                    max,
                    requested_at,
                    now,
                    available_at,
                    limit.available(),
                    vec![limit.snapshot(id, bottleneck)],
                )
            }
        };
        if residue_left {
            // whoever is blocked might be satisfied by what is left over;
            // consumption is not fair, so any positive residue is worth a
            // wakeup
            self.core.notify_waiters();
        }
        Ok(outcome)
    }

    fn probe_at(&self, min: u64, at: Nanos) -> Probe {
        let state = self.state.read_fast();
        let id = self.core.id();
        let mut available = i64::MAX;
        let mut available_at = at;
        let mut bottleneck = Vec::new();
        for (index, limit) in state.limits.iter().enumerate() {
            let mut projected = limit.clone();
            projected.refill(at);
            available = available.min(projected.available());
            let sim = projected.simulate(min, min, at);
            if sim.grant == 0 && sim.available_at > available_at {
                available_at = sim.available_at;
                bottleneck = vec![projected.snapshot(id, index)];
            }
        }
        Probe {
            available,
            available_at,
            bottleneck,
        }
    }
}

impl AdmissionControl for Bucket {}

/// An open configuration transaction on a [`Bucket`].
///
/// Exposes a staged copy of the limit list; nothing is visible to
/// consumers until [`commit`](Self::commit).
pub struct BucketUpdate<'a> {
    bucket: &'a Bucket,
    guard: RwLockWriteGuard<'a, BucketState>,
    staged: Vec<Limit>,
}

impl BucketUpdate<'_> {
    /// The staged limit list.
    pub fn limits(&self) -> &[Limit] {
        &self.staged
    }

    /// Mutable access to one staged limit.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds for the staged list.
    pub fn limit_mut(&mut self, index: usize) -> &mut Limit {
        &mut self.staged[index]
    }

    /// Appends a limit; its refill accounting starts at commit time.
    pub fn add_limit(&mut self, mut limit: Limit) {
        limit.stamp(self.bucket.core.now());
        self.staged.push(limit);
    }

    /// Removes and returns the limit at `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds for the staged list.
    pub fn remove_limit(&mut self, index: usize) -> Limit {
        self.staged.remove(index)
    }

    /// Validates the staged list and atomically replaces the live one.
    ///
    /// Wakes blocked consumers on this bucket and its ancestors when the
    /// change could let them succeed (a raised balance or ceiling, a faster
    /// rate, a lowered refill batch, a removed limit); a change that can
    /// only make things harder or identical wakes nobody. On error the
    /// transaction is discarded and the live configuration is untouched.
    pub fn commit(self) -> Result<(), ConfigError> {
        let BucketUpdate {
            bucket,
            mut guard,
            staged,
        } = self;
        if staged.is_empty() {
            return Err(ConfigError::NoLimits);
        }
        for limit in &staged {
            limit.validate()?;
        }
        let may_unblock = could_unblock(&guard.limits, &staged);
        guard.limits = staged;
        drop(guard);

        debug!(node = %bucket.core.id(), may_unblock, "bucket configuration committed");
        if may_unblock {
            bucket.core.notify_waiters_up();
        }
        if let Some(parent) = bucket.core.parent() {
            parent.child_updated();
        }
        Ok(())
    }
}

fn could_unblock(old: &[Limit], new: &[Limit]) -> bool {
    if new.len() < old.len() {
        return true;
    }
    old.iter().zip(new).any(|(before, after)| {
        after.available() > before.available()
            || after.max_tokens() > before.max_tokens()
            || after.rate() > before.rate()
            || after.min_to_refill() < before.min_to_refill()
    })
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU64;
    use std::time::Duration;

    use nonzero_ext::nonzero;

    use super::*;
    use crate::clock::ManualClock;

    fn manual() -> Arc<ManualClock> {
        Arc::new(ManualClock::default())
    }

    fn limit(rate: u64, period_secs: u64) -> Limit {
        Limit::new(
            NonZeroU64::new(rate).unwrap(),
            Duration::from_secs(period_secs),
        )
    }

    #[test]
    fn grants_within_range() {
        let clock = manual();
        let bucket = Bucket::with_clock(
            vec![limit(10, 1).with_max_tokens(20).with_initial_tokens(7)],
            clock,
        )
        .unwrap();
        // grants the whole positive balance capped at max
        let outcome = bucket
            .try_consume_range(nonzero!(5u64), nonzero!(100u64))
            .unwrap();
        assert!(outcome.is_granted());
        assert_eq!(outcome.granted(), 7);
        assert_eq!(outcome.remaining(), 0);
        assert_eq!(bucket.available_tokens(), 0);
    }

    #[test]
    fn atomic_commit_across_limits() {
        let clock = manual();
        let bucket = Bucket::with_clock(
            vec![
                limit(10, 1),
                limit(100, 1),
            ],
            clock,
        )
        .unwrap();
        // the tighter limit bounds the grant, and both are debited by it
        let outcome = bucket
            .try_consume_range(nonzero!(1u64), nonzero!(1000u64))
            .unwrap();
        assert_eq!(outcome.granted(), 10);
        let limits = bucket.limits();
        assert_eq!(limits[0].available(), 0);
        assert_eq!(limits[1].available(), 90);
    }

    #[test]
    fn impossible_request_rejected_not_blocked() {
        let clock = manual();
        let bucket = Bucket::with_clock(vec![limit(10, 1)], clock).unwrap();
        let err = bucket
            .try_consume_range(nonzero!(11u64), nonzero!(20u64))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::BeyondCapacity {
                requested: 11,
                maximum: 10
            }
        ));
        // the blocking path rejects identically instead of parking forever
        let err = bucket
            .consume_range(nonzero!(11u64), nonzero!(20u64))
            .unwrap_err();
        assert!(matches!(err, Error::BeyondCapacity { .. }));
    }

    #[test]
    fn inverted_range_rejected() {
        let bucket = Bucket::new(vec![limit(10, 1)]).unwrap();
        let err = bucket
            .try_consume_range(nonzero!(5u64), nonzero!(2u64))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRange { min: 5, max: 2 }));
    }

    #[test]
    fn denial_names_the_slowest_limit() {
        let clock = manual();
        let bucket = Bucket::with_clock(
            vec![
                limit(100, 1).with_initial_tokens(0),
                // one token per 10s: the latest projected availability
                limit(1, 10).with_max_tokens(100).with_initial_tokens(0),
            ],
            clock.clone(),
        )
        .unwrap();
        let outcome = bucket.try_consume(nonzero!(1u64)).unwrap();
        assert!(!outcome.is_granted());
        assert_eq!(outcome.bottleneck().len(), 1);
        assert_eq!(outcome.bottleneck()[0].index(), 1);
        assert_eq!(outcome.bottleneck()[0].bucket(), bucket.id());
        assert_eq!(outcome.retry_delay(clock.now()), Duration::from_secs(10));
    }

    #[test]
    fn refill_is_visible_without_consuming() {
        let clock = manual();
        let bucket = Bucket::with_clock(
            vec![limit(10, 1).with_max_tokens(30).with_initial_tokens(0)],
            clock.clone(),
        )
        .unwrap();
        assert_eq!(bucket.available_tokens(), 0);
        clock.advance(Duration::from_secs(2));
        assert_eq!(bucket.available_tokens(), 20);
        assert_eq!(bucket.maximum_tokens(), 30);
    }

    #[test]
    fn lowest_refill_rate_ranks_by_real_rate() {
        let bucket = Bucket::new(vec![
            limit(30, 60),  // 0.5/s
            limit(2, 10),   // 0.2/s <- slowest
            limit(100, 1),  // 100/s
        ])
        .unwrap();
        assert_eq!(bucket.limit_with_lowest_refill_rate().index(), 1);
    }

    #[test]
    fn lowest_refill_rate_ties_keep_first() {
        let bucket = Bucket::new(vec![limit(1, 2), limit(5, 10), limit(3, 6)]).unwrap();
        assert_eq!(bucket.limit_with_lowest_refill_rate().index(), 0);
    }

    #[test]
    fn empty_limits_rejected() {
        assert_eq!(Bucket::new(vec![]).unwrap_err(), ConfigError::NoLimits);
    }

    #[test]
    fn update_commit_applies_atomically() {
        let clock = manual();
        let bucket = Bucket::with_clock(vec![limit(10, 1)], clock).unwrap();
        let mut tx = bucket.update();
        tx.limit_mut(0).set_max_tokens(50);
        tx.limit_mut(0).set_available(42);
        tx.add_limit(limit(5, 1));
        tx.commit().unwrap();

        let limits = bucket.limits();
        assert_eq!(limits.len(), 2);
        assert_eq!(limits[0].max_tokens(), 50);
        assert_eq!(limits[0].available(), 42);
        assert_eq!(bucket.maximum_tokens(), 5);
    }

    #[test]
    fn update_discarded_on_drop() {
        let bucket = Bucket::new(vec![limit(10, 1)]).unwrap();
        {
            let mut tx = bucket.update();
            tx.limit_mut(0).set_max_tokens(99);
        }
        assert_eq!(bucket.limits()[0].max_tokens(), 10);
    }

    #[test]
    fn update_rejects_invalid_staging() {
        let bucket = Bucket::new(vec![limit(10, 1)]).unwrap();
        let mut tx = bucket.update();
        tx.limit_mut(0).set_max_tokens(3);
        assert_eq!(
            tx.commit(),
            Err(ConfigError::MaxBelowRate {
                maximum: 3,
                rate: 10
            })
        );
        // live configuration untouched
        assert_eq!(bucket.limits()[0].max_tokens(), 10);

        let mut tx = bucket.update();
        tx.remove_limit(0);
        assert_eq!(tx.commit(), Err(ConfigError::NoLimits));
    }

    #[test]
    fn override_can_penalize_into_debt() {
        let clock = manual();
        let bucket =
            Bucket::with_clock(vec![limit(10, 1).with_initial_tokens(10)], clock.clone()).unwrap();
        let mut tx = bucket.update();
        tx.limit_mut(0).set_available(-25);
        tx.commit().unwrap();
        assert_eq!(bucket.available_tokens(), -25);
        // organic arithmetic only works the debt back, it never deepens it
        let outcome = bucket.try_consume(nonzero!(1u64)).unwrap();
        assert!(!outcome.is_granted());
        clock.advance(Duration::from_secs(2));
        assert_eq!(bucket.available_tokens(), -5);
        clock.advance(Duration::from_secs(2));
        // capped at max_tokens as usual
        assert_eq!(bucket.available_tokens(), 10);
    }

    #[test]
    fn commit_wakes_blocked_consumer() {
        let clock = manual();
        // one token per hour, empty: the waiter would otherwise sleep ~1h
        let bucket = Bucket::with_clock(
            vec![limit(1, 3600).with_max_tokens(10).with_initial_tokens(0)],
            clock,
        )
        .unwrap();
        std::thread::scope(|s| {
            let waiter = {
                let bucket = Arc::clone(&bucket);
                s.spawn(move || bucket.consume(nonzero!(3u64)))
            };
            // let the waiter reach its wait
            std::thread::sleep(Duration::from_millis(50));
            let mut tx = bucket.update();
            tx.limit_mut(0).set_available(5);
            tx.commit().unwrap();
            let outcome = waiter.join().unwrap().unwrap();
            assert_eq!(outcome.granted(), 3);
        });
        assert_eq!(bucket.available_tokens(), 2);
    }

    #[test]
    fn concurrent_consumers_never_over_grant() {
        let clock = manual();
        // fixed budget: no refill will happen during the run
        let bucket = Bucket::with_clock(
            vec![
                limit(1000, 1)
                    .with_max_tokens(1000)
                    .with_initial_tokens(1000),
            ],
            clock,
        )
        .unwrap();
        let granted: u64 = std::thread::scope(|s| {
            let workers: Vec<_> = (0..8)
                .map(|_| {
                    let bucket = Arc::clone(&bucket);
                    s.spawn(move || {
                        let mut granted = 0u64;
                        for _ in 0..500 {
                            let outcome = bucket.try_consume(nonzero!(1u64)).unwrap();
                            granted += outcome.granted();
                        }
                        granted
                    })
                })
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).sum()
        });
        assert_eq!(granted, 1000);
        assert_eq!(bucket.available_tokens(), 0);
    }
}
