use crate::actuator::{Actuator, ActuationTargets};
use crate::clients::{ComputeRouteClient, TransitApiClient};
use crate::config::DaemonConfig;
use crate::error::Result;
use crate::events::{ActionResult, EventEmitter};
use crate::health::Health;
use crate::monitor::{ErrorClass, MonitorError, RegionMonitor, TransitRouteClient};
use crate::planner::{plan_for, ActionPlan};
use crate::resilience::{retry_with_backoff, BreakerError, CircuitBreaker, RetryPolicy};
use crate::stability::{GateDisposition, StabilityPipeline, TickObservation};
use crate::state::FailoverState;
use crate::telemetry::runtime_counters;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// The daemon exits once this many consecutive cycles fail, rather than
/// looping forever against a broken control plane.
const MAX_CONSECUTIVE_ERRORS: u32 = 10;
/// Shortened sleep after a failed cycle.
const ERROR_RETRY_SLEEP: Duration = Duration::from_secs(30);
const CLIENT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Sleeps for a duration but aborts early if the shutdown token fires.
/// Returns `true` if shutdown occurred during the wait.
pub async fn sleep_with_shutdown(duration: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => true,
        _ = sleep(duration) => false,
    }
}

fn new_correlation_id() -> String {
    let random = Uuid::new_v4().simple().to_string();
    format!("hc-{}-{}", chrono::Utc::now().timestamp(), &random[..8])
}

/// The control loop: one tick per `check_interval`, each tick flowing
/// probes -> classification -> smoothing -> reduction -> gates -> plan ->
/// actuation -> cycle event.
pub struct Daemon {
    config: DaemonConfig,
    monitor: Arc<dyn RegionMonitor>,
    actuator: Actuator,
    pipeline: StabilityPipeline,
    health_breaker: Arc<CircuitBreaker>,
    bgp_breaker: Arc<CircuitBreaker>,
    health_retry: RetryPolicy,
    bgp_retry: RetryPolicy,
    emitter: EventEmitter,
    consecutive_errors: u32,
}

impl Daemon {
    /// Wires the daemon from pre-built clients. Tests inject fakes here;
    /// production goes through [`Daemon::startup`].
    pub fn new(
        config: DaemonConfig,
        monitor: Arc<dyn RegionMonitor>,
        transit: Arc<dyn TransitRouteClient>,
        emitter: EventEmitter,
    ) -> Self {
        let threshold = config.circuit_breaker_threshold;
        let breaker_timeout = config.breaker_timeout();
        let health_breaker = Arc::new(
            CircuitBreaker::new("backend_health", threshold, breaker_timeout)
                .with_emitter(emitter.clone()),
        );
        let bgp_breaker = Arc::new(
            CircuitBreaker::new("bgp_session", threshold, breaker_timeout)
                .with_emitter(emitter.clone()),
        );
        let advertisement_breaker = Arc::new(
            CircuitBreaker::new("bgp_advertisement", threshold, breaker_timeout)
                .with_emitter(emitter.clone()),
        );
        let transit_breaker = Arc::new(
            CircuitBreaker::new("transit_routes", threshold, breaker_timeout)
                .with_emitter(emitter.clone()),
        );

        let initial = config.initial_backoff();
        let max = config.max_backoff();
        let health_retry = RetryPolicy::new(config.health_check_retries(), initial, max);
        let bgp_retry = RetryPolicy::new(config.bgp_check_retries(), initial, max);
        let advertisement_retry = RetryPolicy::new(config.bgp_update_retries(), initial, max);
        let transit_retry = RetryPolicy::new(config.transit_retries(), initial, max);

        let actuator = Actuator::new(
            Arc::clone(&monitor),
            transit,
            ActuationTargets::from_config(&config),
            advertisement_breaker,
            transit_breaker,
            advertisement_retry,
            transit_retry,
            emitter.clone(),
            config.run_passive,
        );
        let pipeline = StabilityPipeline::new(&config, Instant::now());

        Self {
            config,
            monitor,
            actuator,
            pipeline,
            health_breaker,
            bgp_breaker,
            health_retry,
            bgp_retry,
            emitter,
            consecutive_errors: 0,
        }
    }

    /// Validates the configuration, builds the real API clients, and proves
    /// connectivity to both control planes before the loop starts. Any
    /// failure here is fatal.
    pub async fn startup(config: DaemonConfig, emitter: EventEmitter) -> Result<Self> {
        config.validate()?;

        let http = reqwest::Client::builder()
            .connect_timeout(CLIENT_CONNECT_TIMEOUT)
            .build()?;
        let compute = ComputeRouteClient::new(
            http.clone(),
            &config,
            crate::clients::compute::TokenSource::metadata_server(),
        );
        let transit = TransitApiClient::new(http, &config);

        for region in [&config.local_gcp_region, &config.remote_gcp_region] {
            match compute.backend_health(region).await {
                Ok(health) => {
                    info!(region = %region, health = %health, "compute connectivity validated");
                    emitter.emit_connectivity_test(
                        "compute",
                        ActionResult::Success,
                        json!({ "project": config.gcp_project, "region": region }),
                        None,
                    );
                }
                Err(err) => {
                    error!(region = %region, error = %err, "compute connectivity validation failed");
                    emitter.emit_connectivity_test(
                        "compute",
                        ActionResult::Failure,
                        json!({ "project": config.gcp_project, "region": region }),
                        Some(err.to_string()),
                    );
                    return Err(crate::err!(
                        "compute connectivity validation failed for region {region}: {err}"
                    ));
                }
            }
        }

        match transit.list_routes(&config.cloudflare_account_id).await {
            Ok(routes) => {
                info!(routes = routes.len(), "transit connectivity validated");
                emitter.emit_connectivity_test(
                    "transit",
                    ActionResult::Success,
                    json!({
                        "account_id": config.cloudflare_account_id,
                        "description_filter": config.description_substring,
                        "routes_visible": routes.len(),
                    }),
                    None,
                );
            }
            Err(err) => {
                error!(error = %err, "transit connectivity validation failed");
                emitter.emit_connectivity_test(
                    "transit",
                    ActionResult::Failure,
                    json!({ "account_id": config.cloudflare_account_id }),
                    Some(err.to_string()),
                );
                return Err(crate::err!("transit connectivity validation failed: {err}"));
            }
        }

        Ok(Self::new(config, Arc::new(compute), Arc::new(transit), emitter))
    }

    pub fn committed_state(&self) -> FailoverState {
        self.pipeline.committed()
    }

    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        let interval = self.config.check_interval();
        info!(
            interval_seconds = interval.as_secs(),
            passive = self.config.run_passive,
            local_region = %self.config.local_gcp_region,
            remote_region = %self.config.remote_gcp_region,
            "daemon main loop starting"
        );
        self.emitter.emit_lifecycle(
            "startup",
            ActionResult::Success,
            json!({
                "check_interval": self.config.check_interval_seconds,
                "passive_mode": self.config.run_passive,
                "local_region": self.config.local_gcp_region,
                "remote_region": self.config.remote_gcp_region,
                "primary_prefix": self.config.primary_prefix,
                "secondary_prefix": self.config.secondary_prefix,
                "circuit_breaker_threshold": self.config.circuit_breaker_threshold,
                "circuit_breaker_timeout": self.config.circuit_breaker_timeout_seconds,
                "hysteresis": {
                    "window": self.config.health_check_window,
                    "threshold": self.config.health_check_threshold,
                    "asymmetric": self.config.asymmetric_hysteresis,
                },
                "verification_thresholds": {
                    "state_2": self.config.state_2_verification_threshold,
                    "state_3": self.config.state_3_verification_threshold,
                    "state_4": self.config.state_4_verification_threshold,
                },
                "dwell": {
                    "minimum_seconds": self.config.min_state_dwell_time,
                    "exception_states": self.config.dwell_time_exception_states,
                },
            }),
        );

        let mut exit_reason = "graceful_shutdown";
        while !shutdown.is_cancelled() {
            let loop_start = Instant::now();
            let result = self.tick_once().await;

            if self.consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                error!(
                    consecutive_errors = self.consecutive_errors,
                    "maximum consecutive cycle failures reached, exiting"
                );
                exit_reason = "max_errors_exceeded";
                break;
            }

            let elapsed = loop_start.elapsed();
            let sleep_time = if result == ActionResult::Failure {
                ERROR_RETRY_SLEEP.min(interval)
            } else {
                interval.saturating_sub(elapsed)
            };
            if elapsed > interval {
                warn!(
                    cycle_seconds = elapsed.as_secs(),
                    interval_seconds = interval.as_secs(),
                    "cycle ran longer than the check interval"
                );
            }
            if sleep_with_shutdown(sleep_time, &shutdown).await {
                info!("shutdown signal received during sleep, exiting main loop");
                break;
            }
        }

        self.emitter.emit_lifecycle(
            "shutdown",
            ActionResult::Success,
            json!({
                "reason": exit_reason,
                "consecutive_errors": self.consecutive_errors,
                "final_state_code": self.pipeline.committed(),
            }),
        );
        info!("daemon main loop exited");
        Ok(())
    }

    /// Runs exactly one tick under a fresh correlation id.
    pub async fn tick_once(&mut self) -> ActionResult {
        let correlation_id = new_correlation_id();
        self.emitter.set_correlation_id(&correlation_id);
        info!(correlation_id = %correlation_id, "starting health check cycle");

        let tick_start = Instant::now();

        // Probes fan out; gating below is strictly sequential.
        let (local, remote, bgp) = tokio::join!(
            self.probe_backend(&self.config.local_gcp_region),
            self.probe_backend(&self.config.remote_gcp_region),
            self.probe_bgp(),
        );
        info!(
            local = %local,
            remote = %remote,
            bgp = %bgp,
            "health status"
        );

        let now = Instant::now();
        let observation = self.pipeline.observe(local, remote, bgp, now);
        let committed = observation.committed;

        let skip_reason = self.report_disposition(&observation);
        let plan = match skip_reason {
            Some(_) => ActionPlan::noop(),
            None => plan_for(committed),
        };

        if let Some(reason) = skip_reason {
            info!(
                state = %observation.raw_state,
                reason,
                "route updates withheld this cycle"
            );
        }

        let report = self.actuator.apply(&plan).await;

        let result = if report.any_failure() {
            ActionResult::Failure
        } else if report.all_skipped() {
            ActionResult::Skipped
        } else {
            ActionResult::Success
        };
        if result == ActionResult::Failure {
            self.consecutive_errors += 1;
            warn!(
                consecutive_errors = self.consecutive_errors,
                max = MAX_CONSECUTIVE_ERRORS,
                "health check cycle had failures"
            );
        } else {
            self.consecutive_errors = 0;
        }

        let duration_ms = tick_start.elapsed().as_millis() as u64;
        let pending = self.pipeline.verification_pending();
        let skipped = plan.is_noop() || self.actuator.is_passive();
        self.emitter.emit_cycle(
            result,
            duration_ms,
            json!({
                "cycle_duration_ms": duration_ms,
                "state_code": committed,
                "raw_state_code": observation.raw_state,
                "time_in_state_seconds":
                    now.saturating_duration_since(observation.committed_since).as_secs(),
                "health_status": {
                    "local": observation.smoothed.local,
                    "remote": observation.smoothed.remote,
                    "bgp": observation.smoothed.bgp,
                    "raw_local": observation.raw.local,
                    "raw_remote": observation.raw.remote,
                    "raw_bgp": observation.raw.bgp,
                },
                "hysteresis": {
                    "local_window_size": observation.windows.local_size,
                    "local_healthy_count": observation.windows.local_healthy,
                    "remote_window_size": observation.windows.remote_size,
                    "remote_healthy_count": observation.windows.remote_healthy,
                    "window": self.config.health_check_window,
                    "asymmetric": self.config.asymmetric_hysteresis,
                },
                "state_verification": {
                    "pending_state": pending.map(|(state, _)| state),
                    "consecutive_count": pending.map(|(_, count)| count),
                    "skip_reason": skip_reason,
                },
                "operation_results": {
                    "primary_advertisement": report.primary,
                    "secondary_advertisement": report.secondary,
                    "transit_update": report.transit,
                    "bgp_updates_skipped": skipped,
                    "cloudflare_updates_skipped": skipped,
                },
                "error_tracking": {
                    "consecutive_errors": self.consecutive_errors,
                    "max_consecutive_errors": MAX_CONSECUTIVE_ERRORS,
                },
                "configuration": {
                    "passive_mode": self.config.run_passive,
                    "planned_primary_advertisement": plan.advertise_primary,
                    "planned_secondary_advertisement": plan.advertise_secondary,
                    "planned_transit_priority": plan.transit_priority,
                },
            }),
        );
        runtime_counters().inc_cycles_completed();
        result
    }

    /// Emits disposition events and decides whether actuation is withheld.
    fn report_disposition(&self, observation: &TickObservation) -> Option<&'static str> {
        match observation.disposition {
            GateDisposition::Committed {
                from,
                via_exception,
            } => {
                info!(
                    from = %from,
                    to = %observation.committed,
                    via_exception,
                    "state transition committed"
                );
                self.emitter.emit_state_transition(
                    from,
                    observation.committed,
                    observation.smoothed.local,
                    observation.smoothed.remote,
                    observation.smoothed.bgp,
                    &plan_for(observation.committed),
                    via_exception,
                );
            }
            GateDisposition::PendingVerification {
                state,
                count,
                threshold,
            } => {
                warn!(
                    state = %state,
                    count,
                    threshold,
                    "state requires verification, withholding route updates"
                );
                self.emitter.emit_custom(
                    "pending_verification",
                    json!({
                        "state_code": state,
                        "consecutive_count": count,
                        "threshold": threshold,
                        "result": "pending_verification",
                    }),
                );
                return Some("verification_pending");
            }
            GateDisposition::DwellBlocked {
                attempted,
                in_state,
                required,
            } => {
                warn!(
                    committed = %observation.committed,
                    attempted = %attempted,
                    in_state_seconds = in_state.as_secs(),
                    required_seconds = required.as_secs(),
                    "state transition blocked by dwell time"
                );
                self.emitter.emit_custom(
                    "dwell_blocked",
                    json!({
                        "attempted_transition":
                            format!("{} -> {}", observation.committed, attempted),
                        "time_in_state_seconds": in_state.as_secs(),
                        "minimum_required_seconds": required.as_secs(),
                    }),
                );
            }
            GateDisposition::Unchanged => {
                debug!(state = %observation.committed, "state unchanged");
            }
            GateDisposition::Failsafe => {
                info!(
                    committed = %observation.committed,
                    "failsafe state observed, holding committed state and withholding updates"
                );
            }
        }

        if observation.is_failsafe() {
            return Some("failsafe");
        }
        None
    }

    async fn probe_backend(&self, region: &str) -> Health {
        let started = Instant::now();
        let outcome = self
            .health_breaker
            .call(|| {
                retry_with_backoff(&self.health_retry, "backend_health", || {
                    self.monitor.backend_health(region)
                })
            })
            .await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(health) => {
                self.emitter
                    .emit_health_check(region, "backend_services", health, duration_ms, json!({}));
                health
            }
            Err(err) => {
                let health = Health::Unknown;
                self.emitter.emit_health_check(
                    region,
                    "backend_services",
                    health,
                    duration_ms,
                    probe_error_details(&err),
                );
                log_probe_error(region, "backend_services", &err);
                runtime_counters().inc_probes_unknown();
                health
            }
        }
    }

    async fn probe_bgp(&self) -> Health {
        let region = &self.config.remote_bgp_region;
        let router = &self.config.remote_bgp_router;
        let started = Instant::now();
        let outcome = self
            .bgp_breaker
            .call(|| {
                retry_with_backoff(&self.bgp_retry, "bgp_session_health", || {
                    self.monitor.bgp_session_health(region, router)
                })
            })
            .await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(health) => {
                self.emitter.emit_health_check(
                    region,
                    "bgp_sessions",
                    health,
                    duration_ms,
                    json!({ "router": router }),
                );
                health
            }
            Err(err) => {
                let health = Health::Unknown;
                self.emitter.emit_health_check(
                    region,
                    "bgp_sessions",
                    health,
                    duration_ms,
                    probe_error_details(&err),
                );
                log_probe_error(region, "bgp_sessions", &err);
                runtime_counters().inc_probes_unknown();
                health
            }
        }
    }
}

fn probe_error_details(err: &BreakerError<MonitorError>) -> serde_json::Value {
    match err {
        BreakerError::Open { retry_in } => json!({
            "cause": "circuit_breaker_open",
            "retry_in_seconds": retry_in.as_secs(),
        }),
        BreakerError::Inner(inner) => json!({
            "cause": inner.class().as_str(),
            "error_code": inner.status(),
            "error_message": inner.to_string(),
        }),
    }
}

fn log_probe_error(region: &str, service_type: &str, err: &BreakerError<MonitorError>) {
    match err {
        BreakerError::Open { retry_in } => warn!(
            region,
            service_type,
            retry_in_seconds = retry_in.as_secs(),
            "probe rejected by open circuit breaker, health unknown"
        ),
        BreakerError::Inner(inner) => match inner.class() {
            // Permanent errors point at missing permissions or bad names and
            // deserve immediate attention, but never abort the tick.
            ErrorClass::Permanent => error!(
                region,
                service_type,
                error = %inner,
                "permanent probe error, check credentials and resource names"
            ),
            ErrorClass::Transient => warn!(
                region,
                service_type,
                error = %inner,
                "transient probe error after retries, health unknown"
            ),
            ErrorClass::Unclassified => warn!(
                region,
                service_type,
                error_code = inner.status(),
                error = %inner,
                "unclassified probe error, health unknown"
            ),
        },
    }
}
