use tokio::time::Instant;

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ActionStatus<E> {
    /// The action is still running. It should be updated again no later than `next_update`;
    ///  `None` means that only new input can make progress.
    Pending { next_update: Option<Instant> },
    Failed(E),
    Stopped,
}

impl <E> ActionStatus<E> {
    pub fn is_pending(&self) -> bool {
        matches!(self, ActionStatus::Pending { .. })
    }

    pub fn next_update(&self) -> Option<Instant> {
        match self {
            ActionStatus::Pending { next_update } => *next_update,
            _ => None,
        }
    }
}

/// A state machine that is driven by periodic calls from a single-threaded executor loop. Actions
///  never read the clock themselves: the current time is passed in, which keeps them
///  deterministic.
pub trait Action {
    type Error;

    fn update(&mut self, now: Instant) -> ActionStatus<Self::Error>;
}

/// the earlier of two optional deadlines
pub fn earliest(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}
