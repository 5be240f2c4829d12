use crate::state::FailoverState;
use serde::Serialize;

/// Which of the two configured transit priorities a plan selects.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitPriority {
    Primary,
    Secondary,
}

/// Per-tick actuation intent. `None` means "do not touch this surface at
/// all" and never reaches the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct ActionPlan {
    pub advertise_primary: Option<bool>,
    pub advertise_secondary: Option<bool>,
    pub transit_priority: Option<TransitPriority>,
}

impl ActionPlan {
    pub const fn noop() -> Self {
        Self {
            advertise_primary: None,
            advertise_secondary: None,
            transit_priority: None,
        }
    }

    pub fn is_noop(&self) -> bool {
        self.advertise_primary.is_none()
            && self.advertise_secondary.is_none()
            && self.transit_priority.is_none()
    }
}

/// Maps a committed state to its deterministic plan.
///
/// The transit priority follows the local region: states in which the local
/// region is healthy route through the primary priority, the rest demote to
/// the secondary one. `Hold` plans nothing.
pub fn plan_for(state: FailoverState) -> ActionPlan {
    use TransitPriority::{Primary, Secondary};
    match state {
        FailoverState::Hold => ActionPlan::noop(),
        FailoverState::Nominal => plan(true, false, Primary),
        FailoverState::LocalImpaired => plan(false, false, Secondary),
        FailoverState::RemoteImpaired => plan(true, true, Primary),
        FailoverState::DualImpaired => plan(true, false, Secondary),
        FailoverState::PeeringLostLocalImpaired => plan(true, false, Secondary),
        FailoverState::PeeringLost => plan(true, true, Primary),
    }
}

const fn plan(primary: bool, secondary: bool, priority: TransitPriority) -> ActionPlan {
    ActionPlan {
        advertise_primary: Some(primary),
        advertise_secondary: Some(secondary),
        transit_priority: Some(priority),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::FailoverState::*;

    #[test]
    fn hold_plans_nothing() {
        assert!(plan_for(Hold).is_noop());
    }

    #[test]
    fn plans_match_action_table() {
        let cases = [
            (Nominal, Some(true), Some(false), Some(TransitPriority::Primary)),
            (
                LocalImpaired,
                Some(false),
                Some(false),
                Some(TransitPriority::Secondary),
            ),
            (
                RemoteImpaired,
                Some(true),
                Some(true),
                Some(TransitPriority::Primary),
            ),
            (
                DualImpaired,
                Some(true),
                Some(false),
                Some(TransitPriority::Secondary),
            ),
            (
                PeeringLostLocalImpaired,
                Some(true),
                Some(false),
                Some(TransitPriority::Secondary),
            ),
            (
                PeeringLost,
                Some(true),
                Some(true),
                Some(TransitPriority::Primary),
            ),
        ];
        for (state, primary, secondary, priority) in cases {
            let plan = plan_for(state);
            assert_eq!(plan.advertise_primary, primary, "state {state}");
            assert_eq!(plan.advertise_secondary, secondary, "state {state}");
            assert_eq!(plan.transit_priority, priority, "state {state}");
        }
    }

    #[test]
    fn planning_is_deterministic() {
        for code in 0..=6 {
            let state = FailoverState::from_code(code).unwrap();
            assert_eq!(plan_for(state), plan_for(state));
        }
    }
}
