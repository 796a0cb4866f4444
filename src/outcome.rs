use std::time::Duration;

use crate::clock::Nanos;
use crate::limit::LimitSnapshot;
use crate::node::NodeId;

/// Immutable record of one consumption attempt.
///
/// A granted outcome carries the amount actually debited (somewhere in the
/// requested `[min, max]` range) and an empty bottleneck list. A denied
/// outcome carries a zero grant, the snapshots of the limits that caused
/// the denial, and the instant at which the request is projected to become
/// satisfiable.
#[derive(Debug, Clone)]
pub struct Outcome {
    origin: NodeId,
    min_requested: u64,
    max_requested: u64,
    granted: u64,
    requested_at: Nanos,
    decided_at: Nanos,
    available_at: Nanos,
    remaining: i64,
    bottleneck: Vec<LimitSnapshot>,
}

impl Outcome {
    pub(crate) fn grant(
        origin: NodeId,
        min_requested: u64,
        max_requested: u64,
        granted: u64,
        requested_at: Nanos,
        decided_at: Nanos,
        remaining: i64,
    ) -> Self {
        debug_assert!(granted >= min_requested && granted <= max_requested);
        Self {
            origin,
            min_requested,
            max_requested,
            granted,
            requested_at,
            decided_at,
            available_at: decided_at,
            remaining,
            bottleneck: Vec::new(),
        }
    }

    pub(crate) fn denied(
        origin: NodeId,
        min_requested: u64,
        max_requested: u64,
        requested_at: Nanos,
        decided_at: Nanos,
        available_at: Nanos,
        remaining: i64,
        bottleneck: Vec<LimitSnapshot>,
    ) -> Self {
        // a denial must always be attributable to at least one limit
        debug_assert!(!bottleneck.is_empty());
        Self {
            origin,
            min_requested,
            max_requested,
            granted: 0,
            requested_at,
            decided_at,
            available_at,
            remaining,
            bottleneck,
        }
    }

    /// Node that decided the attempt. For consume-from-one composites this
    /// is the child that served the request.
    pub fn origin(&self) -> NodeId {
        self.origin
    }

    pub fn min_requested(&self) -> u64 {
        self.min_requested
    }

    pub fn max_requested(&self) -> u64 {
        self.max_requested
    }

    /// Tokens actually debited; zero when the attempt was denied.
    pub fn granted(&self) -> u64 {
        self.granted
    }

    pub fn is_granted(&self) -> bool {
        self.granted > 0
    }

    /// Instant the caller first asked (for blocking calls, the start of the
    /// whole consume loop, not of the final retry).
    pub fn requested_at(&self) -> Nanos {
        self.requested_at
    }

    /// Instant the decision was made.
    pub fn decided_at(&self) -> Nanos {
        self.decided_at
    }

    /// Instant at which the request is projected to become satisfiable.
    /// Equals [`decided_at`](Self::decided_at) for granted outcomes.
    pub fn available_at(&self) -> Nanos {
        self.available_at
    }

    /// Balance left on the limiting resource after the decision.
    pub fn remaining(&self) -> i64 {
        self.remaining
    }

    /// Limits that caused the denial; empty iff the attempt was granted.
    pub fn bottleneck(&self) -> &[LimitSnapshot] {
        &self.bottleneck
    }

    /// Suggested wait before retrying, as seen from `now`.
    pub fn retry_delay(&self, now: Nanos) -> Duration {
        self.available_at.saturating_since(now)
    }
}
