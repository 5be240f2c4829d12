use crate::state::FailoverState;
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DwellOutcome {
    /// Enough time has been spent in the committed state.
    Permitted,
    /// Either side of the transition is an exception state.
    PermittedByException,
    /// The committed state is too young to leave.
    Blocked {
        in_state: Duration,
        required: Duration,
    },
}

impl DwellOutcome {
    pub fn is_permitted(self) -> bool {
        !matches!(self, DwellOutcome::Blocked { .. })
    }
}

/// Minimum time-in-state gate. A transition out of a committed state is only
/// allowed once `min_dwell` has elapsed, unless either the committed state or
/// the candidate is in the exception set (emergency states move immediately).
#[derive(Debug)]
pub struct DwellGate {
    min_dwell: Duration,
    exceptions: Vec<FailoverState>,
}

impl DwellGate {
    pub fn new(min_dwell: Duration, exceptions: Vec<FailoverState>) -> Self {
        Self {
            min_dwell,
            exceptions,
        }
    }

    pub fn min_dwell(&self) -> Duration {
        self.min_dwell
    }

    pub fn is_exception(&self, state: FailoverState) -> bool {
        self.exceptions.contains(&state)
    }

    pub fn evaluate(
        &self,
        committed: FailoverState,
        committed_since: Instant,
        candidate: FailoverState,
        now: Instant,
    ) -> DwellOutcome {
        if candidate == committed {
            return DwellOutcome::Permitted;
        }
        if self.is_exception(committed) || self.is_exception(candidate) {
            return DwellOutcome::PermittedByException;
        }
        let in_state = now.saturating_duration_since(committed_since);
        // Boundary is inclusive: exactly min_dwell permits the transition.
        if in_state >= self.min_dwell {
            DwellOutcome::Permitted
        } else {
            DwellOutcome::Blocked {
                in_state,
                required: self.min_dwell,
            }
        }
    }
}
