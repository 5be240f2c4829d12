use crate::state::FailoverState;

/// Outcome of the consecutive-observation gate for one tick.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VerificationOutcome {
    Accepted,
    Pending {
        state: FailoverState,
        count: u32,
        threshold: u32,
    },
}

/// Requires N consecutive observations of an impaired state (2, 3 or 4)
/// before it may be committed. Only one counter is ever active: observing a
/// different raw state resets it.
#[derive(Debug)]
pub struct VerificationGate {
    state_2_threshold: u32,
    state_3_threshold: u32,
    state_4_threshold: u32,
    counter: Option<(FailoverState, u32)>,
}

impl VerificationGate {
    pub fn new(state_2_threshold: u32, state_3_threshold: u32, state_4_threshold: u32) -> Self {
        Self {
            state_2_threshold: state_2_threshold.max(1),
            state_3_threshold: state_3_threshold.max(1),
            state_4_threshold: state_4_threshold.max(1),
            counter: None,
        }
    }

    fn threshold_for(&self, state: FailoverState) -> u32 {
        match state {
            FailoverState::LocalImpaired => self.state_2_threshold,
            FailoverState::RemoteImpaired => self.state_3_threshold,
            FailoverState::DualImpaired => self.state_4_threshold,
            _ => 1,
        }
    }

    /// Feeds one raw observation through the gate. Non-verifiable states and
    /// observations matching the committed state reset the counter and pass.
    pub fn observe(
        &mut self,
        raw: FailoverState,
        committed: FailoverState,
    ) -> VerificationOutcome {
        if !raw.is_verifiable() || raw == committed {
            self.counter = None;
            return VerificationOutcome::Accepted;
        }

        let count = match self.counter {
            Some((state, count)) if state == raw => count + 1,
            _ => 1,
        };
        let threshold = self.threshold_for(raw);

        if count >= threshold {
            self.counter = None;
            VerificationOutcome::Accepted
        } else {
            self.counter = Some((raw, count));
            VerificationOutcome::Pending {
                state: raw,
                count,
                threshold,
            }
        }
    }

    /// The active counter, if a verification is in progress.
    pub fn pending(&self) -> Option<(FailoverState, u32)> {
        self.counter
    }
}
