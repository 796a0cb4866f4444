/// How a [`Composite`](crate::Composite) node answers a request.
#[derive(Debug, Clone)]
pub enum ConsumptionPolicy {
    /// Delegate the whole request to exactly one child, picked by the
    /// selection policy; children that could never satisfy the minimum are
    /// skipped.
    ConsumeFromOne(SelectionPolicy),
    /// Require every child to supply the granted amount simultaneously.
    /// The commit is atomic across all children: all of them are debited,
    /// or none.
    ConsumeFromAll,
}

impl ConsumptionPolicy {
    /// Round-robin delegation, the common consume-from-one configuration.
    pub fn round_robin() -> Self {
        Self::ConsumeFromOne(SelectionPolicy::round_robin())
    }

    pub(crate) fn is_from_all(&self) -> bool {
        matches!(self, Self::ConsumeFromAll)
    }
}

/// Which child a consume-from-one composite tries first.
///
/// Each variant carries its own state; the round-robin cursor lives here,
/// not in the composite.
#[derive(Debug, Clone)]
pub enum SelectionPolicy {
    /// Rotate the starting child by one position on every call.
    RoundRobin { cursor: usize },
    /// Always start from the first child, falling through in list order.
    InOrder,
}

impl SelectionPolicy {
    pub fn round_robin() -> Self {
        Self::RoundRobin { cursor: 0 }
    }

    /// Index of the child to try first, advancing any rotation state. The
    /// child list length is taken at call time; the cursor survives
    /// structural changes and is simply wrapped into the current bounds.
    pub(crate) fn first_child(&mut self, len: usize) -> usize {
        debug_assert!(len > 0);
        match self {
            Self::RoundRobin { cursor } => {
                let start = *cursor % len;
                *cursor = (start + 1) % len;
                start
            }
            Self::InOrder => 0,
        }
    }
}
