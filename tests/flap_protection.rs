mod support;

use routewarden::events::ActionResult;
use routewarden::health::Health;
use routewarden::monitor::MonitorError;
use routewarden::state::FailoverState;
use support::{
    build_daemon, drain_events, events_of_type, test_config, FakeControlPlane, LOCAL_REGION,
    PRIMARY_PREFIX, REMOTE_REGION, SECONDARY_PREFIX,
};

/// Drives enough healthy ticks to fill both hysteresis windows and commit
/// the nominal state.
async fn warm_to_nominal(daemon: &mut routewarden::daemon::Daemon) {
    for _ in 0..5 {
        daemon.tick_once().await;
    }
    assert_eq!(daemon.committed_state(), FailoverState::Nominal);
}

#[tokio::test]
async fn transient_blip_is_absorbed_without_route_changes() {
    let plane = FakeControlPlane::healthy();
    let config = test_config(&[]);
    let (mut daemon, mut rx) = build_daemon(config, &plane);

    warm_to_nominal(&mut daemon).await;
    let advertised_before = plane.advertised();
    let priority_before = plane.priority();
    drain_events(&mut rx);

    // One unhealthy observation inside a 5-wide window with threshold 3.
    plane.push_backend(LOCAL_REGION, Ok(Health::Unhealthy));
    let blip_result = daemon.tick_once().await;
    let recovery_result = daemon.tick_once().await;

    assert_eq!(daemon.committed_state(), FailoverState::Nominal);
    assert_eq!(plane.advertised(), advertised_before);
    assert_eq!(plane.priority(), priority_before);
    assert_eq!(blip_result, ActionResult::Success);
    assert_eq!(recovery_result, ActionResult::Success);

    // Nothing mutated, so every actuation reported no_change.
    let events = drain_events(&mut rx);
    for cycle in events_of_type(&events, "health_check_cycle") {
        let ops = &cycle.details["operation_results"];
        assert_eq!(ops["primary_advertisement"], "no_change");
        assert_eq!(ops["secondary_advertisement"], "no_change");
        assert_eq!(ops["transit_update"], "no_change");
    }
}

#[tokio::test]
async fn dual_impairment_verifies_then_fails_over() {
    let plane = FakeControlPlane::healthy();
    let config = test_config(&[]);
    let (mut daemon, mut rx) = build_daemon(config, &plane);

    warm_to_nominal(&mut daemon).await;

    plane.set_backend_steady(LOCAL_REGION, Health::Unhealthy);
    plane.set_backend_steady(REMOTE_REGION, Health::Unhealthy);

    // Two ticks of decay before the 3-of-5 windows flip.
    daemon.tick_once().await;
    daemon.tick_once().await;
    assert_eq!(daemon.committed_state(), FailoverState::Nominal);
    drain_events(&mut rx);

    // First dual-impaired observation: pending verification, no writes.
    let writes_before = plane.write_invocations();
    let pending_result = daemon.tick_once().await;
    assert_eq!(pending_result, ActionResult::Skipped);
    assert_eq!(daemon.committed_state(), FailoverState::Nominal);
    assert_eq!(plane.write_invocations(), writes_before);

    let events = drain_events(&mut rx);
    let pending = events_of_type(&events, "pending_verification");
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].details["state_code"], 4);
    assert_eq!(pending[0].details["consecutive_count"], 1);
    assert_eq!(pending[0].details["threshold"], 2);

    // Second consecutive observation commits the emergency state: the
    // primary prefix stays advertised, the secondary stays withdrawn, and
    // the transit priority demotes to the secondary value.
    let commit_result = daemon.tick_once().await;
    assert_eq!(commit_result, ActionResult::Success);
    assert_eq!(daemon.committed_state(), FailoverState::DualImpaired);
    assert!(plane.advertised().contains(PRIMARY_PREFIX));
    assert!(!plane.advertised().contains(SECONDARY_PREFIX));
    assert_eq!(plane.priority(), Some(200));

    let events = drain_events(&mut rx);
    let transitions = events_of_type(&events, "state_transition");
    assert_eq!(transitions.len(), 1);
    assert_eq!(transitions[0].details["old_state_code"], 1);
    assert_eq!(transitions[0].details["new_state_code"], 4);
    // States 1 and 4 are both dwell exceptions, so the commit bypassed dwell.
    assert_eq!(transitions[0].details["dwell_exception_bypass"], true);
}

#[tokio::test]
async fn unclassified_probe_error_blocks_all_actuation() {
    let plane = FakeControlPlane::healthy();
    let config = test_config(&[]);
    let (mut daemon, mut rx) = build_daemon(config, &plane);

    warm_to_nominal(&mut daemon).await;
    drain_events(&mut rx);
    let writes_before = plane.write_invocations();
    let advertised_before = plane.advertised();

    // An unrecognized HTTP status maps to unknown health, not unhealthy.
    plane.push_backend(
        LOCAL_REGION,
        Err(MonitorError::from_status(432, "weird upstream response")),
    );
    let result = daemon.tick_once().await;

    assert_eq!(result, ActionResult::Skipped);
    assert_eq!(daemon.committed_state(), FailoverState::Nominal);
    assert_eq!(plane.write_invocations(), writes_before);
    assert_eq!(plane.advertised(), advertised_before);

    let events = drain_events(&mut rx);
    let probes = events_of_type(&events, "health_check_result");
    let unknown_probe = probes
        .iter()
        .find(|event| event.details["detail"]["cause"] == "unclassified")
        .expect("unknown probe event");
    assert_eq!(unknown_probe.details["detail"]["error_code"], 432);

    let cycles = events_of_type(&events, "health_check_cycle");
    assert_eq!(cycles.len(), 1);
    assert_eq!(cycles[0].details["raw_state_code"], 0);
    assert_eq!(cycles[0].details["state_code"], 1);
    assert_eq!(
        cycles[0].details["state_verification"]["skip_reason"],
        "failsafe"
    );
}

#[tokio::test]
async fn peering_loss_with_healthy_regions_advertises_both_prefixes() {
    let plane = FakeControlPlane::healthy();
    let config = test_config(&[]);
    let (mut daemon, _rx) = build_daemon(config, &plane);

    warm_to_nominal(&mut daemon).await;
    assert_eq!(plane.priority(), Some(100));

    plane.set_bgp_steady(Health::Unhealthy);
    daemon.tick_once().await;

    // State 6 needs no verification and leaves an exception state.
    assert_eq!(daemon.committed_state(), FailoverState::PeeringLost);
    assert!(plane.advertised().contains(PRIMARY_PREFIX));
    assert!(plane.advertised().contains(SECONDARY_PREFIX));
    assert_eq!(plane.priority(), Some(100));
}

#[tokio::test]
async fn local_failover_withdraws_primary_and_demotes_priority() {
    let plane = FakeControlPlane::healthy();
    let config = test_config(&[("STATE_2_VERIFICATION_THRESHOLD", "1")]);
    let (mut daemon, _rx) = build_daemon(config, &plane);

    warm_to_nominal(&mut daemon).await;

    plane.set_backend_steady(LOCAL_REGION, Health::Unhealthy);
    for _ in 0..3 {
        daemon.tick_once().await;
    }

    assert_eq!(daemon.committed_state(), FailoverState::LocalImpaired);
    assert!(!plane.advertised().contains(PRIMARY_PREFIX));
    assert!(!plane.advertised().contains(SECONDARY_PREFIX));
    assert_eq!(plane.priority(), Some(200));
}
