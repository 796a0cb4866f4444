use std::any::Any;
use std::fmt::{Display, Formatter};
use std::num::NonZeroU64;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::clock::Nanos;
use crate::error::Error;
use crate::limit::LimitSnapshot;
use crate::outcome::Outcome;
use crate::sync::CancelToken;

/// Stable identity of an admission node, unique within the process.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct NodeId(u64);

static NEXT_NODE_ID: AtomicU64 = AtomicU64::new(1);

impl NodeId {
    pub(crate) fn next() -> Self {
        Self(NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What a blocking caller is about to wait for.
///
/// Handed to [`ConsumeListener::before_wait`] for every node on the path
/// from the tree root down to the node being consumed from.
#[derive(Debug, Clone)]
pub struct WaitEvent {
    node: NodeId,
    min_requested: u64,
    max_requested: u64,
    requested_at: Nanos,
    available_at: Nanos,
    bottleneck: Vec<LimitSnapshot>,
}

impl WaitEvent {
    /// Node the caller is blocked on.
    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn min_requested(&self) -> u64 {
        self.min_requested
    }

    pub fn max_requested(&self) -> u64 {
        self.max_requested
    }

    pub fn requested_at(&self) -> Nanos {
        self.requested_at
    }

    /// Projected instant at which the request becomes satisfiable.
    pub fn available_at(&self) -> Nanos {
        self.available_at
    }

    /// Limits the request is blocked on.
    pub fn bottleneck(&self) -> &[LimitSnapshot] {
        &self.bottleneck
    }
}

/// Hook invoked immediately before a blocking caller goes to sleep.
///
/// Listeners registered on a node fire for waits on that node and on any
/// node below it, root first. They run on the consuming caller's thread
/// with no node locks held; keep them short and do not block in them.
///
/// Returning [`ControlFlow::Break`] cancels the wait: the consume call
/// returns [`Error::Cancelled`]. This is the only way a listener may abort
/// a consumption; panicking in a hook is a bug in the listener.
pub trait ConsumeListener: Send + Sync {
    fn before_wait(&self, event: &WaitEvent) -> ControlFlow<()>;
}

pub(crate) mod ops {
    use parking_lot::Mutex;
    use tracing::trace;

    use super::*;
    use crate::clock::Clock;
    use crate::composite::Composite;
    use crate::sync::Signal;
    use std::sync::Weak;

    /// Identity, clock, signaling and listener plumbing shared by both node
    /// kinds.
    pub struct NodeCore {
        id: NodeId,
        clock: Arc<dyn Clock>,
        signal: Arc<Signal>,
        parent: Mutex<Option<Weak<Composite>>>,
        listeners: Mutex<Vec<Arc<dyn ConsumeListener>>>,
        user_data: Mutex<Option<Arc<dyn Any + Send + Sync>>>,
    }

    impl NodeCore {
        pub fn new(clock: Arc<dyn Clock>) -> Self {
            Self {
                id: NodeId::next(),
                clock,
                signal: Arc::new(Signal::new()),
                parent: Mutex::new(None),
                listeners: Mutex::new(Vec::new()),
                user_data: Mutex::new(None),
            }
        }

        pub fn id(&self) -> NodeId {
            self.id
        }

        pub fn now(&self) -> Nanos {
            self.clock.now()
        }

        pub fn signal(&self) -> &Arc<Signal> {
            &self.signal
        }

        pub fn parent(&self) -> Option<Arc<Composite>> {
            self.parent.lock().as_ref().and_then(Weak::upgrade)
        }

        pub fn set_parent(&self, parent: Option<Weak<Composite>>) {
            *self.parent.lock() = parent;
        }

        pub fn add_listener(&self, listener: Arc<dyn ConsumeListener>) {
            self.listeners.lock().push(listener);
        }

        pub fn listener_snapshot(&self) -> Vec<Arc<dyn ConsumeListener>> {
            self.listeners.lock().clone()
        }

        pub fn user_data(&self) -> Option<Arc<dyn Any + Send + Sync>> {
            self.user_data.lock().clone()
        }

        pub fn set_user_data(&self, user_data: Option<Arc<dyn Any + Send + Sync>>) {
            *self.user_data.lock() = user_data;
        }

        /// Chain of ancestor composites, tree root first.
        pub fn ancestors_root_first(&self) -> Vec<Arc<Composite>> {
            let mut chain = Vec::new();
            let mut current = self.parent();
            while let Some(node) = current {
                current = node.core().parent();
                chain.push(node);
            }
            chain.reverse();
            chain
        }

        pub fn notify_waiters(&self) {
            self.signal.notify_all();
        }

        /// Wakes waiters on this node and on every ancestor. Used after a
        /// configuration change that could let blocked consumers succeed.
        pub fn notify_waiters_up(&self) {
            self.notify_waiters();
            for ancestor in self.ancestors_root_first() {
                ancestor.core().notify_waiters();
            }
        }
    }

    /// Read-only projection of a node's state for a `[min, min]` request,
    /// used by consume-from-all aggregation and capacity reads. Commits
    /// nothing, and accounts pending refills without applying them.
    pub struct Probe {
        /// Projected balance: the minimum across the node's internal
        /// resources (for consume-from-one composites, the best single
        /// child).
        pub available: i64,
        /// Instant at which `min` becomes satisfiable; the probe instant
        /// itself when the request is satisfiable now.
        pub available_at: Nanos,
        /// Minimal set of limits blocking `min`; empty when satisfiable.
        pub bottleneck: Vec<LimitSnapshot>,
    }

    impl Probe {
        pub fn satisfiable(&self) -> bool {
            self.bottleneck.is_empty()
        }
    }

    /// Internal node contract shared by [`Bucket`](crate::Bucket) and
    /// [`Composite`]. Sealed: the cooperating types live in this crate and
    /// the trait is not nameable outside it.
    pub trait NodeOps: Send + Sync {
        fn core(&self) -> &NodeCore;

        /// Ceiling the node can ever hold; requests with `min` above it are
        /// rejected instead of blocking.
        fn structural_max(&self) -> u64;

        /// One refill/simulate/commit critical section. Grants atomically
        /// across all internal resources or not at all.
        fn try_consume_at(
            &self,
            min: u64,
            max: u64,
            requested_at: Nanos,
            now: Nanos,
        ) -> Result<Outcome, Error>;

        /// Read-only availability projection for a `[min, min]` request.
        fn probe_at(&self, min: u64, at: Nanos) -> Probe;
    }

    pub fn validated(min: NonZeroU64, max: NonZeroU64) -> Result<(u64, u64), Error> {
        if likely_stable::unlikely(min > max) {
            return Err(Error::InvalidRange {
                min: min.get(),
                max: max.get(),
            });
        }
        Ok((min.get(), max.get()))
    }

    /// The blocking consume loop: attempt, and on failure wait out the
    /// projected shortfall (bounded by the deadline) before recomputing
    /// from scratch. There is no stored waiting state; every retry is a
    /// fresh attempt, and no wakeup is trusted without rechecking.
    pub fn blocking_consume<N>(
        node: &N,
        min: u64,
        max: u64,
        timeout: Option<Duration>,
        cancel: &CancelToken,
    ) -> Result<Outcome, Error>
    where
        N: NodeOps + ?Sized,
    {
        let requested_at = node.core().now();
        let deadline = timeout.map(|t| requested_at.saturating_add(t));
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            // snapshot before the attempt so a wakeup between a failed
            // attempt and the wait below is not lost
            let seen = node.core().signal().generation();
            let now = node.core().now();
            let outcome = node.try_consume_at(min, max, requested_at, now)?;
            if outcome.is_granted() {
                return Ok(outcome);
            }
            let mut wait = outcome.available_at().saturating_since(now);
            if let Some(deadline) = deadline {
                let budget = deadline.saturating_since(now);
                if budget.is_zero() {
                    return Err(Error::TimedOut { outcome });
                }
                wait = wait.min(budget);
            }
            if wait.is_zero() {
                // the projected instant has already passed
                continue;
            }

            let mut hooks: Vec<Arc<dyn ConsumeListener>> = Vec::new();
            for ancestor in node.core().ancestors_root_first() {
                hooks.extend(ancestor.core().listener_snapshot());
            }
            hooks.extend(node.core().listener_snapshot());
            if !hooks.is_empty() {
                let event = WaitEvent {
                    node: node.core().id(),
                    min_requested: min,
                    max_requested: max,
                    requested_at,
                    available_at: outcome.available_at(),
                    bottleneck: outcome.bottleneck().to_vec(),
                };
                for hook in hooks {
                    if hook.before_wait(&event).is_break() {
                        return Err(Error::Cancelled);
                    }
                }
            }

            trace!(
                node = %node.core().id(),
                min,
                max,
                wait_micros = wait.as_micros() as u64,
                "tokens unavailable; waiting"
            );
            let signal = node.core().signal();
            cancel.register(signal);
            // a cancel between the loop-top check and the registration
            // above would otherwise be missed
            if cancel.is_cancelled() {
                cancel.unregister(signal);
                return Err(Error::Cancelled);
            }
            signal.wait_past(seen, wait);
            cancel.unregister(signal);
        }
    }
}

/// The admission capability shared by [`Bucket`](crate::Bucket) leaves and
/// [`Composite`](crate::Composite) nodes.
///
/// Requests carry a `[min, max]` token range: the node grants some amount
/// within the range (all internal resources debited atomically), or grants
/// nothing and reports which limits are the bottleneck and when to retry.
///
/// Validation failures — an inverted range, or a `min` the node could
/// structurally never satisfy — surface as synchronous [`Error`]s from both
/// the blocking and non-blocking entry points; they never block.
pub trait AdmissionControl: ops::NodeOps {
    /// Stable identity of this node.
    fn id(&self) -> NodeId {
        self.core().id()
    }

    /// Tokens currently available: the minimum across this node's internal
    /// resources (for consume-from-one composites, the best single child).
    /// Negative only when an administrative override drove a limit into
    /// debt.
    fn available_tokens(&self) -> i64 {
        self.probe_at(1, self.core().now()).available
    }

    /// Ceiling this node can ever hold.
    fn maximum_tokens(&self) -> u64 {
        self.structural_max()
    }

    /// Attempts to consume exactly `tokens`, deciding immediately.
    fn try_consume(&self, tokens: NonZeroU64) -> Result<Outcome, Error> {
        self.try_consume_range(tokens, tokens)
    }

    /// Attempts to consume between `min` and `max` tokens, deciding
    /// immediately. Grants as much of the range as the tightest internal
    /// resource allows, or nothing.
    fn try_consume_range(&self, min: NonZeroU64, max: NonZeroU64) -> Result<Outcome, Error> {
        let (min, max) = ops::validated(min, max)?;
        let now = self.core().now();
        self.try_consume_at(min, max, now, now)
    }

    /// Consumes exactly `tokens`, blocking until they accrue.
    fn consume(&self, tokens: NonZeroU64) -> Result<Outcome, Error> {
        self.consume_range(tokens, tokens)
    }

    /// Consumes between `min` and `max` tokens, blocking until at least
    /// `min` accrue.
    fn consume_range(&self, min: NonZeroU64, max: NonZeroU64) -> Result<Outcome, Error> {
        self.consume_range_cancellable(min, max, None, &CancelToken::new())
    }

    /// Like [`consume`](Self::consume), giving up with
    /// [`Error::TimedOut`] after `timeout`.
    fn consume_timeout(&self, tokens: NonZeroU64, timeout: Duration) -> Result<Outcome, Error> {
        self.consume_range_timeout(tokens, tokens, timeout)
    }

    /// Like [`consume_range`](Self::consume_range), giving up with
    /// [`Error::TimedOut`] after `timeout`.
    fn consume_range_timeout(
        &self,
        min: NonZeroU64,
        max: NonZeroU64,
        timeout: Duration,
    ) -> Result<Outcome, Error> {
        self.consume_range_cancellable(min, max, Some(timeout), &CancelToken::new())
    }

    /// The full blocking primitive: optional timeout, cooperative
    /// cancellation. Blocked callers are woken by commits that leave
    /// residual tokens, by helpful configuration changes, by the projected
    /// accrual instant passing, or by cancellation — and always re-attempt
    /// from scratch. No fairness among waiters is guaranteed.
    fn consume_range_cancellable(
        &self,
        min: NonZeroU64,
        max: NonZeroU64,
        timeout: Option<Duration>,
        cancel: &CancelToken,
    ) -> Result<Outcome, Error> {
        let (min, max) = ops::validated(min, max)?;
        ops::blocking_consume(self, min, max, timeout, cancel)
    }

    /// Registers a hook that fires before any blocking caller sleeps on
    /// this node or a node below it.
    fn add_listener(&self, listener: Arc<dyn ConsumeListener>) {
        self.core().add_listener(listener);
    }

    /// Opaque payload attached to this node.
    fn user_data(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.core().user_data()
    }

    /// Replaces the opaque payload.
    fn set_user_data(&self, user_data: Option<Arc<dyn Any + Send + Sync>>) {
        self.core().set_user_data(user_data);
    }
}
