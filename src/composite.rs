use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use likely_stable::unlikely;
use parking_lot::RwLockWriteGuard;
use tracing::debug;

use crate::clock::{Clock, Nanos, StdClock};
use crate::error::{ConfigError, Error};
use crate::node::AdmissionControl;
use crate::node::ops::{NodeCore, NodeOps, Probe};
use crate::outcome::Outcome;
use crate::policy::{ConsumptionPolicy, SelectionPolicy};
use crate::sync::NodeLock;

/// An admission node delegating to an ordered list of children — buckets
/// or nested composites — through a [`ConsumptionPolicy`].
///
/// The tree owns downward: a composite holds strong references to its
/// children, while each child keeps only a weak back-reference to its
/// parent for upward propagation. A node has at most one parent, and
/// attaching walks the prospective parent's ancestor chain first so the
/// tree can never contain a cycle.
///
/// # Examples
///
/// ```rust
/// use std::num::NonZeroU64;
/// use std::sync::Arc;
/// use std::time::Duration;
/// use tollgate::{AdmissionControl, Bucket, Composite, ConsumptionPolicy, Limit};
///
/// let primary = Bucket::new(vec![Limit::new(
///     NonZeroU64::new(100).unwrap(),
///     Duration::from_secs(1),
/// )])
/// .unwrap();
/// let fallback = Bucket::new(vec![Limit::new(
///     NonZeroU64::new(50).unwrap(),
///     Duration::from_secs(1),
/// )])
/// .unwrap();
///
/// let pool = Composite::new(
///     vec![primary, fallback],
///     ConsumptionPolicy::round_robin(),
/// )
/// .unwrap();
/// assert!(pool.try_consume(NonZeroU64::new(10).unwrap()).unwrap().is_granted());
/// ```
pub struct Composite {
    core: NodeCore,
    state: NodeLock<CompositeState>,
    // recomputed through child_updated() whenever the subtree changes
    cached_max: AtomicU64,
}

struct CompositeState {
    children: Vec<Arc<dyn AdmissionControl>>,
    policy: ConsumptionPolicy,
}

impl std::fmt::Debug for Composite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Composite")
            .field("id", &self.core.id())
            .finish_non_exhaustive()
    }
}

impl Composite {
    /// Creates a composite over `children` using the standard clock.
    pub fn new(
        children: Vec<Arc<dyn AdmissionControl>>,
        policy: ConsumptionPolicy,
    ) -> Result<Arc<Self>, ConfigError> {
        Self::with_clock(children, policy, Arc::new(StdClock::default()))
    }

    /// Creates a composite over `children` with an injected clock.
    ///
    /// Every child must be unattached; each becomes exclusively owned by
    /// this composite.
    pub fn with_clock(
        children: Vec<Arc<dyn AdmissionControl>>,
        policy: ConsumptionPolicy,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<Self>, ConfigError> {
        if children.is_empty() {
            return Err(ConfigError::NoChildren);
        }
        for (index, child) in children.iter().enumerate() {
            let id = child.core().id();
            if child.core().parent().is_some() {
                return Err(ConfigError::AlreadyAttached(id));
            }
            if children[..index].iter().any(|c| c.core().id() == id) {
                return Err(ConfigError::AlreadyAttached(id));
            }
        }
        let node = Arc::new(Self {
            core: NodeCore::new(clock),
            state: NodeLock::new(CompositeState {
                children: children.clone(),
                policy,
            }),
            cached_max: AtomicU64::new(0),
        });
        for child in &children {
            child.core().set_parent(Some(Arc::downgrade(&node)));
        }
        node.refresh_capacity();
        Ok(node)
    }

    /// The child list, in order.
    pub fn children(&self) -> Vec<Arc<dyn AdmissionControl>> {
        self.state.read_fast().children.clone()
    }

    fn refresh_capacity(&self) {
        let max = {
            let state = self.state.read_fast();
            let maxes = state.children.iter().map(|c| c.maximum_tokens());
            if state.policy.is_from_all() {
                maxes.min().unwrap_or(0)
            } else {
                maxes.max().unwrap_or(0)
            }
        };
        self.cached_max.store(max, Ordering::Release);
    }

    /// Recomputes the cached capacity after a child's configuration
    /// changed, and propagates the recomputation up the ancestor chain.
    pub(crate) fn child_updated(&self) {
        self.refresh_capacity();
        if let Some(parent) = self.core.parent() {
            parent.child_updated();
        }
    }

    /// Opens a configuration transaction on this composite's child list
    /// and policy.
    ///
    /// The transaction holds exclusive access to the composite; staged
    /// changes are applied atomically by
    /// [`commit`](CompositeUpdate::commit), and dropping the guard without
    /// committing discards them. Children untouched by the transaction
    /// keep their order and identity.
    pub fn update(self: &Arc<Self>) -> CompositeUpdate<'_> {
        let guard = self.state.write();
        let staged_children = guard.children.clone();
        let staged_policy = guard.policy.clone();
        CompositeUpdate {
            composite: self,
            guard,
            staged_children,
            staged_policy,
        }
    }
}

impl NodeOps for Composite {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn structural_max(&self) -> u64 {
        self.cached_max.load(Ordering::Acquire)
    }

    fn try_consume_at(
        &self,
        min: u64,
        max: u64,
        requested_at: Nanos,
        now: Nanos,
    ) -> Result<Outcome, Error> {
        let result = {
            let mut state = self.state.write();
            let state = &mut *state;
            match &mut state.policy {
                ConsumptionPolicy::ConsumeFromOne(selection) => consume_from_one(
                    self,
                    &state.children,
                    selection,
                    min,
                    max,
                    requested_at,
                    now,
                ),
                ConsumptionPolicy::ConsumeFromAll => {
                    consume_from_all(self, &state.children, min, max, requested_at, now)
                }
            }
        };
        if let Ok(outcome) = &result {
            if outcome.is_granted() && outcome.remaining() > 0 {
                self.core.notify_waiters();
            }
        }
        result
    }

    fn probe_at(&self, min: u64, at: Nanos) -> Probe {
        let state = self.state.read_fast();
        if state.policy.is_from_all() {
            let mut available = i64::MAX;
            let mut available_at = at;
            let mut bottleneck = Vec::new();
            for child in &state.children {
                let probe = child.probe_at(min, at);
                available = available.min(probe.available);
                if !probe.satisfiable() {
                    // all children must be ready before the request is
                    available_at = available_at.max(probe.available_at);
                    bottleneck.extend(probe.bottleneck);
                }
            }
            Probe {
                available,
                available_at,
                bottleneck,
            }
        } else {
            // one child will serve the whole request: report the best
            let mut available = i64::MIN;
            let mut satisfiable = false;
            let mut earliest: Option<Probe> = None;
            for child in &state.children {
                if child.maximum_tokens() < min {
                    continue;
                }
                let probe = child.probe_at(min, at);
                available = available.max(probe.available);
                if probe.satisfiable() {
                    satisfiable = true;
                } else if earliest
                    .as_ref()
                    .is_none_or(|e| probe.available_at < e.available_at)
                {
                    earliest = Some(probe);
                }
            }
            match (satisfiable, earliest) {
                (false, Some(probe)) => Probe {
                    available,
                    available_at: probe.available_at,
                    bottleneck: probe.bottleneck,
                },
                _ => {
                    // every capable child was skipped only when min exceeds
                    // this node's capacity, which callers pre-check
                    Probe {
                        available: available.max(0),
                        available_at: at,
                        bottleneck: Vec::new(),
                    }
                }
            }
        }
    }
}

impl AdmissionControl for Composite {}

fn consume_from_one(
    composite: &Composite,
    children: &[Arc<dyn AdmissionControl>],
    selection: &mut SelectionPolicy,
    min: u64,
    max: u64,
    requested_at: Nanos,
    now: Nanos,
) -> Result<Outcome, Error> {
    let len = children.len();
    let start = selection.first_child(len);
    let mut earliest: Option<Outcome> = None;
    for k in 0..len {
        let child = &children[(start + k) % len];
        // a child that could never hold `min` cannot help this request
        if child.maximum_tokens() < min {
            continue;
        }
        match child.try_consume_at(min, max, requested_at, now) {
            Ok(outcome) if outcome.is_granted() => return Ok(outcome),
            Ok(outcome) => {
                if earliest
                    .as_ref()
                    .is_none_or(|e| outcome.available_at() < e.available_at())
                {
                    earliest = Some(outcome);
                }
            }
            // the child shrank below `min` between the capacity check and
            // the attempt; treat it as skipped
            Err(Error::BeyondCapacity { .. }) => continue,
            Err(err) => return Err(err),
        }
    }
    match earliest {
        // a full rotation failed: report the soonest retry among attempts
        Some(outcome) => Ok(outcome),
        // every child was structurally incapable
        None => Err(Error::BeyondCapacity {
            requested: min,
            maximum: composite.structural_max(),
        }),
    }
}

fn consume_from_all(
    composite: &Composite,
    children: &[Arc<dyn AdmissionControl>],
    min: u64,
    max: u64,
    requested_at: Nanos,
    now: Nanos,
) -> Result<Outcome, Error> {
    let id = composite.core().id();
    let maximum = children.iter().map(|c| c.maximum_tokens()).min().unwrap_or(0);
    if unlikely(min > maximum) {
        return Err(Error::BeyondCapacity {
            requested: min,
            maximum,
        });
    }

    let probes: Vec<Probe> = children.iter().map(|c| c.probe_at(min, now)).collect();
    let available = probes.iter().map(|p| p.available).min().unwrap_or(0);
    let grant = available.clamp(0, max.min(i64::MAX as u64) as i64) as u64;

    if grant < min {
        let mut available_at = now;
        let mut bottleneck = Vec::new();
        for probe in probes {
            if !probe.satisfiable() {
                // every short child is reported, each through its own
                // minimal insufficient set
                available_at = available_at.max(probe.available_at);
                bottleneck.extend(probe.bottleneck);
            }
        }
        return Ok(Outcome::denied(
            id,
            min,
            max,
            requested_at,
            now,
            available_at,
            available,
            bottleneck,
        ));
    }

    // the availability check above, under this composite's critical
    // section, guarantees every child covers `grant`; the commit is
    // all-or-nothing
    for child in children {
        let committed = child.try_consume_at(grant, grant, requested_at, now);
        debug_assert!(matches!(&committed, Ok(outcome) if outcome.is_granted()));
    }
    Ok(Outcome::grant(
        id,
        min,
        max,
        grant,
        requested_at,
        now,
        available - grant as i64,
    ))
}

/// An open configuration transaction on a [`Composite`].
pub struct CompositeUpdate<'a> {
    composite: &'a Arc<Composite>,
    guard: RwLockWriteGuard<'a, CompositeState>,
    staged_children: Vec<Arc<dyn AdmissionControl>>,
    staged_policy: ConsumptionPolicy,
}

impl CompositeUpdate<'_> {
    /// The staged child list.
    pub fn children(&self) -> &[Arc<dyn AdmissionControl>] {
        &self.staged_children
    }

    /// Stages a child for attachment.
    ///
    /// Rejects a child that is this composite or one of its ancestors
    /// (cycle), is already staged, or is attached to some other parent.
    /// Moving a child within the tree in one transaction is allowed:
    /// remove it, then add it here.
    pub fn add_child(&mut self, child: Arc<dyn AdmissionControl>) -> Result<(), ConfigError> {
        let id = child.core().id();
        let self_id = self.composite.core().id();
        if id == self_id
            || self
                .composite
                .core()
                .ancestors_root_first()
                .iter()
                .any(|ancestor| ancestor.core().id() == id)
        {
            return Err(ConfigError::CycleDetected(id));
        }
        if self.staged_children.iter().any(|c| c.core().id() == id) {
            return Err(ConfigError::AlreadyAttached(id));
        }
        // a child attached to us but no longer staged is being moved
        // within this transaction, which is fine
        if let Some(parent) = child.core().parent() {
            if parent.core().id() != self_id {
                return Err(ConfigError::AlreadyAttached(id));
            }
        }
        self.staged_children.push(child);
        Ok(())
    }

    /// Removes and returns the staged child at `index`. The detachment
    /// becomes effective at commit.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds for the staged list.
    pub fn remove_child(&mut self, index: usize) -> Arc<dyn AdmissionControl> {
        self.staged_children.remove(index)
    }

    /// Replaces the consumption policy.
    pub fn set_policy(&mut self, policy: ConsumptionPolicy) {
        self.staged_policy = policy;
    }

    /// Atomically replaces the live child list and policy.
    ///
    /// Removed children are detached, added children attached; untouched
    /// children keep their order and identity. Every ancestor's cached
    /// capacity is recomputed, and blocked consumers are woken when the
    /// change could let them succeed (a removed constraint under
    /// consume-from-all, a new delegate under consume-from-one, a policy
    /// switch).
    pub fn commit(self) -> Result<(), ConfigError> {
        let CompositeUpdate {
            composite,
            mut guard,
            staged_children,
            staged_policy,
        } = self;
        if staged_children.is_empty() {
            return Err(ConfigError::NoChildren);
        }
        let may_unblock =
            could_unblock(&guard.children, &staged_children, &guard.policy, &staged_policy);
        for old in &guard.children {
            if !staged_children
                .iter()
                .any(|new| new.core().id() == old.core().id())
            {
                old.core().set_parent(None);
            }
        }
        for new in &staged_children {
            if !guard
                .children
                .iter()
                .any(|old| old.core().id() == new.core().id())
            {
                new.core().set_parent(Some(Arc::downgrade(composite)));
            }
        }
        guard.children = staged_children;
        guard.policy = staged_policy;
        drop(guard);

        debug!(node = %composite.core().id(), may_unblock, "composite configuration committed");
        composite.refresh_capacity();
        if may_unblock {
            composite.core().notify_waiters_up();
        }
        if let Some(parent) = composite.core().parent() {
            parent.child_updated();
        }
        Ok(())
    }
}

fn could_unblock(
    old: &[Arc<dyn AdmissionControl>],
    new: &[Arc<dyn AdmissionControl>],
    old_policy: &ConsumptionPolicy,
    new_policy: &ConsumptionPolicy,
) -> bool {
    if old_policy.is_from_all() != new_policy.is_from_all() {
        return true;
    }
    if new_policy.is_from_all() {
        // a removed child is one constraint fewer
        old.iter()
            .any(|o| !new.iter().any(|n| n.core().id() == o.core().id()))
    } else {
        // an added child is one more delegate that might serve
        new.iter()
            .any(|n| !old.iter().any(|o| o.core().id() == n.core().id()))
    }
}
