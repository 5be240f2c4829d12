pub mod dwell;
pub mod hysteresis;
pub mod verification;

pub use dwell::{DwellGate, DwellOutcome};
pub use hysteresis::{HysteresisMode, HysteresisWindow};
pub use verification::{VerificationGate, VerificationOutcome};

use crate::config::DaemonConfig;
use crate::health::Health;
use crate::state::{reduce, FailoverState};
use std::time::{Duration, Instant};

/// The three channel signals for one tick, either raw or smoothed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChannelHealths {
    pub local: Health,
    pub remote: Health,
    pub bgp: Health,
}

impl ChannelHealths {
    pub fn any_unknown(&self) -> bool {
        !(self.local.is_known() && self.remote.is_known() && self.bgp.is_known())
    }
}

/// How the gates disposed of this tick's raw state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GateDisposition {
    /// A new state was committed.
    Committed {
        from: FailoverState,
        via_exception: bool,
    },
    /// Raw state matches the committed state; nothing to do.
    Unchanged,
    /// The failsafe state was observed (monitoring unreliable or an
    /// unexpected combination). Verification counters reset; the committed
    /// state is held.
    Failsafe,
    /// An impaired state was observed but has not yet met its consecutive
    /// observation threshold.
    PendingVerification {
        state: FailoverState,
        count: u32,
        threshold: u32,
    },
    /// The transition passed verification but the committed state is too
    /// young to leave.
    DwellBlocked {
        attempted: FailoverState,
        in_state: Duration,
        required: Duration,
    },
}

/// Occupancy of the smoothing windows, reported in the cycle summary event.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WindowStats {
    pub local_size: usize,
    pub local_healthy: usize,
    pub remote_size: usize,
    pub remote_healthy: usize,
}

/// Everything the control loop needs to know about one tick.
#[derive(Clone, Copy, Debug)]
pub struct TickObservation {
    pub raw: ChannelHealths,
    pub smoothed: ChannelHealths,
    pub raw_state: FailoverState,
    pub committed: FailoverState,
    pub committed_since: Instant,
    pub disposition: GateDisposition,
    pub windows: WindowStats,
}

impl TickObservation {
    /// Failsafe ticks (raw state 0, whatever the cause) must never actuate.
    pub fn is_failsafe(&self) -> bool {
        self.raw_state == FailoverState::Hold
    }
}

/// Owns all cross-tick memory of the flap-protection pipeline: the hysteresis
/// windows, the verification counter, and the committed-state record. The
/// control loop feeds it one observation per tick; everything else observes
/// via events.
pub struct StabilityPipeline {
    local_window: HysteresisWindow,
    remote_window: HysteresisWindow,
    verification: VerificationGate,
    dwell: DwellGate,
    committed: FailoverState,
    committed_since: Instant,
    // False until the first real commit. The boot placeholder carries no
    // tenure, so leaving it is never dwell-blocked.
    has_committed: bool,
}

impl StabilityPipeline {
    pub fn new(config: &DaemonConfig, now: Instant) -> Self {
        let mode = if config.asymmetric_hysteresis {
            HysteresisMode::Asymmetric
        } else {
            HysteresisMode::Symmetric {
                threshold: config.health_check_threshold,
            }
        };
        Self {
            local_window: HysteresisWindow::new(config.health_check_window, mode),
            remote_window: HysteresisWindow::new(config.health_check_window, mode),
            verification: VerificationGate::new(
                config.state_2_verification_threshold,
                config.state_3_verification_threshold,
                config.state_4_verification_threshold,
            ),
            dwell: DwellGate::new(config.min_dwell(), config.dwell_exception_states()),
            committed: FailoverState::Hold,
            committed_since: now,
            has_committed: false,
        }
    }

    pub fn committed(&self) -> FailoverState {
        self.committed
    }

    pub fn committed_since(&self) -> Instant {
        self.committed_since
    }

    pub fn verification_pending(&self) -> Option<(FailoverState, u32)> {
        self.verification.pending()
    }

    fn window_stats(&self) -> WindowStats {
        WindowStats {
            local_size: self.local_window.len(),
            local_healthy: self.local_window.healthy_count(),
            remote_size: self.remote_window.len(),
            remote_healthy: self.remote_window.healthy_count(),
        }
    }

    /// Runs one tick's raw channel healths through smoothing and the gates.
    pub fn observe(
        &mut self,
        local: Health,
        remote: Health,
        bgp: Health,
        now: Instant,
    ) -> TickObservation {
        let raw = ChannelHealths { local, remote, bgp };

        // A monitoring-plane failure bypasses smoothing entirely: the windows
        // keep their history and the tick degrades to the failsafe state.
        let smoothed = if raw.any_unknown() {
            ChannelHealths {
                local: Health::Unknown,
                remote: Health::Unknown,
                bgp: Health::Unknown,
            }
        } else {
            let local_flag = local.as_flag().unwrap_or(false);
            let remote_flag = remote.as_flag().unwrap_or(false);
            self.local_window.record(local_flag);
            self.remote_window.record(remote_flag);
            ChannelHealths {
                local: Health::from_flag(
                    self.local_window
                        .classify(local_flag, self.committed.local_considered_healthy()),
                ),
                remote: Health::from_flag(
                    self.remote_window
                        .classify(remote_flag, self.committed.remote_considered_healthy()),
                ),
                bgp,
            }
        };

        let raw_state = reduce(smoothed.local, smoothed.remote, smoothed.bgp);
        let disposition = self.gate(raw_state, now);

        TickObservation {
            raw,
            smoothed,
            raw_state,
            committed: self.committed,
            committed_since: self.committed_since,
            disposition,
            windows: self.window_stats(),
        }
    }

    fn gate(&mut self, raw_state: FailoverState, now: Instant) -> GateDisposition {
        if raw_state == self.committed {
            self.verification.observe(raw_state, self.committed);
            return GateDisposition::Unchanged;
        }

        // The failsafe state is a per-tick posture, never a commitment: it
        // resets verification progress and holds whatever is committed.
        if raw_state == FailoverState::Hold {
            self.verification.observe(raw_state, self.committed);
            return GateDisposition::Failsafe;
        }

        match self.verification.observe(raw_state, self.committed) {
            VerificationOutcome::Pending {
                state,
                count,
                threshold,
            } => GateDisposition::PendingVerification {
                state,
                count,
                threshold,
            },
            VerificationOutcome::Accepted => {
                let mut outcome =
                    self.dwell
                        .evaluate(self.committed, self.committed_since, raw_state, now);
                if !self.has_committed {
                    if let DwellOutcome::Blocked { .. } = outcome {
                        outcome = DwellOutcome::Permitted;
                    }
                }
                match outcome {
                    DwellOutcome::Blocked { in_state, required } => {
                        GateDisposition::DwellBlocked {
                            attempted: raw_state,
                            in_state,
                            required,
                        }
                    }
                    outcome => {
                        let from = self.committed;
                        self.committed = raw_state;
                        self.committed_since = now;
                        self.has_committed = true;
                        GateDisposition::Committed {
                            from,
                            via_exception: outcome == DwellOutcome::PermittedByException,
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::Health::{Healthy, Unhealthy, Unknown};
    use crate::state::FailoverState::*;

    fn config(vars: &[(&str, &str)]) -> DaemonConfig {
        DaemonConfig::from_env_map(vars.iter().copied()).unwrap()
    }

    fn pipeline(vars: &[(&str, &str)]) -> (StabilityPipeline, Instant) {
        let start = Instant::now();
        (StabilityPipeline::new(&config(vars), start), start)
    }

    /// Drives the pipeline to a committed Nominal state with warm windows.
    fn warm_nominal(pipeline: &mut StabilityPipeline, start: Instant) {
        for i in 0..5u64 {
            pipeline.observe(
                Healthy,
                Healthy,
                Healthy,
                start + Duration::from_secs(60 * i),
            );
        }
        assert_eq!(pipeline.committed(), Nominal);
    }

    #[test]
    fn first_healthy_tick_commits_nominal_via_exception() {
        let (mut pipeline, start) = pipeline(&[]);
        let tick = pipeline.observe(Healthy, Healthy, Healthy, start + Duration::from_secs(1));
        assert_eq!(
            tick.disposition,
            GateDisposition::Committed {
                from: Hold,
                via_exception: true
            }
        );
        assert_eq!(pipeline.committed(), Nominal);
    }

    #[test]
    fn transient_blip_is_absorbed_by_hysteresis() {
        let (mut pipeline, start) = pipeline(&[]);
        warm_nominal(&mut pipeline, start);

        let t = start + Duration::from_secs(600);
        let blip = pipeline.observe(Unhealthy, Healthy, Healthy, t);
        assert_eq!(blip.smoothed.local, Healthy);
        assert_eq!(blip.raw_state, Nominal);
        assert_eq!(blip.disposition, GateDisposition::Unchanged);

        let recovered = pipeline.observe(Healthy, Healthy, Healthy, t + Duration::from_secs(60));
        assert_eq!(recovered.disposition, GateDisposition::Unchanged);
        assert_eq!(pipeline.committed(), Nominal);
    }

    #[test]
    fn unknown_probe_forces_failsafe_and_leaves_windows_alone() {
        let (mut pipeline, start) = pipeline(&[]);
        warm_nominal(&mut pipeline, start);
        let stats_before = pipeline.window_stats();

        let t = start + Duration::from_secs(600);
        let tick = pipeline.observe(Unknown, Healthy, Healthy, t);
        assert!(tick.is_failsafe());
        assert_eq!(tick.disposition, GateDisposition::Failsafe);
        assert_eq!(tick.windows, stats_before);
        // Monitoring failures never displace a committed state.
        assert_eq!(pipeline.committed(), Nominal);
    }

    #[test]
    fn failsafe_tick_resets_verification_progress() {
        let (mut pipeline, start) = pipeline(&[
            ("HEALTH_CHECK_WINDOW", "3"),
            ("HEALTH_CHECK_THRESHOLD", "2"),
            ("STATE_2_VERIFICATION_THRESHOLD", "3"),
        ]);
        let mut t = start;
        let mut observe = |p: &mut StabilityPipeline, l, r, t| p.observe(l, r, Healthy, t);

        // One tick of pending state 2 progress.
        let tick = observe(&mut pipeline, Unhealthy, Healthy, t);
        assert!(matches!(
            tick.disposition,
            GateDisposition::PendingVerification { count: 1, .. }
        ));
        t += Duration::from_secs(60);

        // A monitoring outage discards that progress.
        pipeline.observe(Unknown, Healthy, Healthy, t);
        assert_eq!(pipeline.verification_pending(), None);
        t += Duration::from_secs(60);

        let tick = observe(&mut pipeline, Unhealthy, Healthy, t);
        assert!(matches!(
            tick.disposition,
            GateDisposition::PendingVerification { count: 1, .. }
        ));
    }

    #[test]
    fn dual_impairment_requires_verification_then_commits() {
        let (mut pipeline, start) = pipeline(&[]);
        warm_nominal(&mut pipeline, start);

        // Five unhealthy ticks flip both symmetric windows (3-of-5 healthy
        // fails once three failures accumulate); run until raw state is 4.
        let mut t = start + Duration::from_secs(600);
        let mut pending_seen = false;
        for _ in 0..6 {
            let tick = pipeline.observe(Unhealthy, Unhealthy, Healthy, t);
            t += Duration::from_secs(60);
            match tick.disposition {
                GateDisposition::PendingVerification {
                    state,
                    count,
                    threshold,
                } => {
                    assert_eq!(state, DualImpaired);
                    assert_eq!(threshold, 2);
                    assert_eq!(count, 1);
                    pending_seen = true;
                }
                GateDisposition::Committed { .. } => break,
                _ => {}
            }
        }
        assert!(pending_seen);
        assert_eq!(pipeline.committed(), DualImpaired);
    }

    #[test]
    fn dwell_blocks_until_boundary_then_commits() {
        let (mut pipeline, start) = pipeline(&[
            ("STATE_3_VERIFICATION_THRESHOLD", "1"),
            ("HEALTH_CHECK_WINDOW", "3"),
            ("HEALTH_CHECK_THRESHOLD", "2"),
        ]);

        // Commit state 2 by warming windows with local unhealthy.
        let mut t = start;
        for _ in 0..4 {
            pipeline.observe(Unhealthy, Healthy, Healthy, t);
            t += Duration::from_secs(1);
        }
        assert_eq!(pipeline.committed(), LocalImpaired);
        let committed_at = pipeline.committed_since();

        // Remote decays; raw state flips to 3 well inside the dwell window.
        for _ in 0..3 {
            pipeline.observe(Healthy, Unhealthy, Healthy, t);
            t += Duration::from_secs(1);
        }
        let early = pipeline.observe(
            Healthy,
            Unhealthy,
            Healthy,
            committed_at + Duration::from_secs(30),
        );
        assert!(matches!(
            early.disposition,
            GateDisposition::DwellBlocked {
                attempted: RemoteImpaired,
                ..
            }
        ));
        assert_eq!(pipeline.committed(), LocalImpaired);

        let at_boundary = pipeline.observe(
            Healthy,
            Unhealthy,
            Healthy,
            committed_at + Duration::from_secs(120),
        );
        assert!(matches!(
            at_boundary.disposition,
            GateDisposition::Committed {
                from: LocalImpaired,
                via_exception: false
            }
        ));
        assert_eq!(pipeline.committed(), RemoteImpaired);
    }

    #[test]
    fn exception_candidate_bypasses_dwell() {
        let (mut pipeline, start) = pipeline(&[
            ("STATE_4_VERIFICATION_THRESHOLD", "1"),
            ("HEALTH_CHECK_WINDOW", "3"),
            ("HEALTH_CHECK_THRESHOLD", "2"),
        ]);

        let mut t = start;
        for _ in 0..4 {
            pipeline.observe(Unhealthy, Healthy, Healthy, t);
            t += Duration::from_secs(1);
        }
        assert_eq!(pipeline.committed(), LocalImpaired);

        // Remote follows local down; state 4 is in the exception set and
        // commits seconds after the previous transition.
        pipeline.observe(Unhealthy, Unhealthy, Healthy, t);
        t += Duration::from_secs(1);
        let tick = pipeline.observe(Unhealthy, Unhealthy, Healthy, t);
        assert_eq!(
            tick.disposition,
            GateDisposition::Committed {
                from: LocalImpaired,
                via_exception: true
            }
        );
        assert_eq!(pipeline.committed(), DualImpaired);
    }
}
