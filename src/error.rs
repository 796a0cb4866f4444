use thiserror::Error;

use crate::node::NodeId;
use crate::outcome::Outcome;

/// Failures of a consumption attempt.
///
/// Validation failures are synchronous and never turn into a blocking wait;
/// a structurally impossible request fails fast instead of parking the
/// caller forever.
#[derive(Debug, Error)]
pub enum Error {
    /// The requested range is inverted.
    #[error("invalid token range: min {min} exceeds max {max}")]
    InvalidRange { min: u64, max: u64 },

    /// The minimum requested amount exceeds what the node could ever hold,
    /// so no amount of waiting would satisfy the request.
    #[error("requesting {requested} tokens can never succeed; node capacity is {maximum}")]
    BeyondCapacity { requested: u64, maximum: u64 },

    /// A blocking call exceeded its timeout. Carries the outcome of the
    /// last failed attempt, including the projected availability instant.
    #[error("timed out before the requested tokens became available")]
    TimedOut { outcome: Outcome },

    /// The wait was cancelled, either through a
    /// [`CancelToken`](crate::CancelToken) or by a listener breaking out of
    /// [`before_wait`](crate::ConsumeListener::before_wait).
    #[error("consumption cancelled while waiting")]
    Cancelled,
}

/// Failures of node construction and configuration transactions.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("a bucket requires at least one limit")]
    NoLimits,

    #[error("a composite requires at least one child")]
    NoChildren,

    #[error("refill period must be non-zero")]
    ZeroPeriod,

    #[error("maximum of {maximum} tokens is below the refill amount of {rate} per period")]
    MaxBelowRate { maximum: u64, rate: u64 },

    #[error("{available} available tokens exceed the maximum of {maximum}")]
    AvailableAboveMax { available: i64, maximum: u64 },

    #[error("a capacity of {0} tokens exceeds the supported accounting range")]
    CapacityOverflow(u64),

    #[error("node {0} is already attached to a parent")]
    AlreadyAttached(NodeId),

    #[error("attaching node {0} would form a cycle")]
    CycleDetected(NodeId),
}
