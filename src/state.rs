use crate::health::Health;
use serde::Serialize;

/// Routing posture derived from the smoothed health of both regions and the
/// remote BGP session. The numeric codes are load-bearing: they appear in
/// configuration (`DWELL_TIME_EXCEPTION_STATES`) and in every emitted event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(into = "u8")]
pub enum FailoverState {
    /// Failsafe: health data is unreliable or the combination is unexpected.
    /// No route changes are made while holding.
    Hold,
    /// Both regions healthy, remote BGP up.
    Nominal,
    /// Local region unhealthy, remote healthy, BGP up: withdraw local paths.
    LocalImpaired,
    /// Remote region unhealthy, local healthy, BGP up: advertise both paths.
    RemoteImpaired,
    /// Both regions unhealthy, BGP up: emergency posture.
    DualImpaired,
    /// Remote BGP down and local unhealthy: fall back to local transit only.
    PeeringLostLocalImpaired,
    /// Remote BGP down with both regions healthy: advertise both paths.
    PeeringLost,
}

impl FailoverState {
    pub fn code(self) -> u8 {
        match self {
            FailoverState::Hold => 0,
            FailoverState::Nominal => 1,
            FailoverState::LocalImpaired => 2,
            FailoverState::RemoteImpaired => 3,
            FailoverState::DualImpaired => 4,
            FailoverState::PeeringLostLocalImpaired => 5,
            FailoverState::PeeringLost => 6,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(FailoverState::Hold),
            1 => Some(FailoverState::Nominal),
            2 => Some(FailoverState::LocalImpaired),
            3 => Some(FailoverState::RemoteImpaired),
            4 => Some(FailoverState::DualImpaired),
            5 => Some(FailoverState::PeeringLostLocalImpaired),
            6 => Some(FailoverState::PeeringLost),
            _ => None,
        }
    }

    /// States that require consecutive-observation verification before they
    /// may be committed.
    pub fn is_verifiable(self) -> bool {
        matches!(
            self,
            FailoverState::LocalImpaired
                | FailoverState::RemoteImpaired
                | FailoverState::DualImpaired
        )
    }

    /// Whether the local region is considered healthy while committed to this
    /// state. Used by the asymmetric hysteresis mode to pick its direction.
    pub fn local_considered_healthy(self) -> bool {
        matches!(
            self,
            FailoverState::Nominal | FailoverState::RemoteImpaired | FailoverState::PeeringLost
        )
    }

    pub fn remote_considered_healthy(self) -> bool {
        matches!(
            self,
            FailoverState::Nominal | FailoverState::LocalImpaired | FailoverState::PeeringLost
        )
    }
}

impl From<FailoverState> for u8 {
    fn from(state: FailoverState) -> u8 {
        state.code()
    }
}

impl std::fmt::Display for FailoverState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Collapses the three smoothed channel signals into a state code.
///
/// Any Unknown forces `Hold`: monitoring-plane failures must not drive
/// data-plane change. Combinations outside the table (for example local
/// healthy, remote unhealthy, BGP down) also fall back to `Hold`.
pub fn reduce(local: Health, remote: Health, bgp: Health) -> FailoverState {
    let (Some(local_healthy), Some(remote_healthy), Some(bgp_up)) =
        (local.as_flag(), remote.as_flag(), bgp.as_flag())
    else {
        return FailoverState::Hold;
    };

    match (local_healthy, remote_healthy, bgp_up) {
        (true, true, true) => FailoverState::Nominal,
        (false, true, true) => FailoverState::LocalImpaired,
        (true, false, true) => FailoverState::RemoteImpaired,
        (false, false, true) => FailoverState::DualImpaired,
        (false, true, false) => FailoverState::PeeringLostLocalImpaired,
        (true, true, false) => FailoverState::PeeringLost,
        _ => FailoverState::Hold,
    }
}
