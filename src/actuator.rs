use crate::config::DaemonConfig;
use crate::events::{ActionResult, EventEmitter};
use crate::monitor::{RegionMonitor, TransitRouteClient, WriteOutcome};
use crate::planner::{ActionPlan, TransitPriority};
use crate::resilience::{retry_with_backoff, BreakerError, CircuitBreaker, RetryPolicy};
use crate::telemetry::runtime_counters;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Static actuation coordinates resolved from configuration once at startup.
#[derive(Clone, Debug)]
pub struct ActuationTargets {
    pub bgp_region: String,
    pub bgp_router: String,
    pub primary_prefix: String,
    pub secondary_prefix: String,
    pub transit_account: String,
    pub transit_selector: String,
    pub primary_priority: u32,
    pub secondary_priority: u32,
}

impl ActuationTargets {
    /// Both prefixes are managed on the local router only; the remote router
    /// is monitored but never mutated.
    pub fn from_config(config: &DaemonConfig) -> Self {
        Self {
            bgp_region: config.local_bgp_region.clone(),
            bgp_router: config.local_bgp_router.clone(),
            primary_prefix: config.primary_prefix.clone(),
            secondary_prefix: config.secondary_prefix.clone(),
            transit_account: config.cloudflare_account_id.clone(),
            transit_selector: config.description_substring.clone(),
            primary_priority: config.cloudflare_primary_priority,
            secondary_priority: config.cloudflare_secondary_priority,
        }
    }

    fn priority_value(&self, priority: TransitPriority) -> u32 {
        match priority {
            TransitPriority::Primary => self.primary_priority,
            TransitPriority::Secondary => self.secondary_priority,
        }
    }
}

/// Per-operation results of applying one plan.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ActuationReport {
    pub primary: ActionResult,
    pub secondary: ActionResult,
    pub transit: ActionResult,
}

impl ActuationReport {
    pub fn any_failure(&self) -> bool {
        [self.primary, self.secondary, self.transit]
            .iter()
            .any(|result| *result == ActionResult::Failure)
    }

    pub fn all_skipped(&self) -> bool {
        [self.primary, self.secondary, self.transit]
            .iter()
            .all(|result| *result == ActionResult::Skipped)
    }
}

/// Applies action plans to the data plane. Every write goes through its
/// service breaker and retry policy; writes are independent, so one failure
/// never cancels the others. In passive mode no write operation is ever
/// invoked, whatever the plan says.
pub struct Actuator {
    monitor: Arc<dyn RegionMonitor>,
    transit: Arc<dyn TransitRouteClient>,
    targets: ActuationTargets,
    advertisement_breaker: Arc<CircuitBreaker>,
    transit_breaker: Arc<CircuitBreaker>,
    advertisement_retry: RetryPolicy,
    transit_retry: RetryPolicy,
    emitter: EventEmitter,
    passive: bool,
}

impl Actuator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        monitor: Arc<dyn RegionMonitor>,
        transit: Arc<dyn TransitRouteClient>,
        targets: ActuationTargets,
        advertisement_breaker: Arc<CircuitBreaker>,
        transit_breaker: Arc<CircuitBreaker>,
        advertisement_retry: RetryPolicy,
        transit_retry: RetryPolicy,
        emitter: EventEmitter,
        passive: bool,
    ) -> Self {
        Self {
            monitor,
            transit,
            targets,
            advertisement_breaker,
            transit_breaker,
            advertisement_retry,
            transit_retry,
            emitter,
            passive,
        }
    }

    pub fn is_passive(&self) -> bool {
        self.passive
    }

    pub async fn apply(&self, plan: &ActionPlan) -> ActuationReport {
        let primary = self
            .apply_advertisement(&self.targets.primary_prefix, plan.advertise_primary)
            .await;
        let secondary = self
            .apply_advertisement(&self.targets.secondary_prefix, plan.advertise_secondary)
            .await;
        let transit = self.apply_transit(plan.transit_priority).await;

        ActuationReport {
            primary,
            secondary,
            transit,
        }
    }

    async fn apply_advertisement(&self, prefix: &str, desired: Option<bool>) -> ActionResult {
        let Some(advertise) = desired else {
            runtime_counters().inc_writes_skipped();
            return ActionResult::Skipped;
        };

        if self.passive {
            runtime_counters().inc_writes_skipped();
            self.emitter.emit_bgp_advertisement(
                &self.targets.bgp_region,
                &self.targets.bgp_router,
                prefix,
                advertise,
                ActionResult::Skipped,
                0,
                None,
            );
            return ActionResult::Skipped;
        }

        let started = Instant::now();
        let outcome = self
            .advertisement_breaker
            .call(|| {
                retry_with_backoff(&self.advertisement_retry, "bgp_advertisement", || {
                    self.monitor.set_advertisement(
                        &self.targets.bgp_region,
                        &self.targets.bgp_router,
                        prefix,
                        advertise,
                    )
                })
            })
            .await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let (result, error_message) = summarize(outcome);
        self.emitter.emit_bgp_advertisement(
            &self.targets.bgp_region,
            &self.targets.bgp_router,
            prefix,
            advertise,
            result,
            duration_ms,
            error_message.clone(),
        );
        match result {
            ActionResult::Failure => warn!(
                prefix,
                advertise,
                error = error_message.as_deref().unwrap_or("unknown"),
                "bgp advertisement update failed"
            ),
            _ => info!(prefix, advertise, result = result.as_str(), "bgp advertisement update"),
        }
        result
    }

    async fn apply_transit(&self, desired: Option<TransitPriority>) -> ActionResult {
        let Some(priority) = desired else {
            runtime_counters().inc_writes_skipped();
            return ActionResult::Skipped;
        };
        let value = self.targets.priority_value(priority);

        if self.passive {
            runtime_counters().inc_writes_skipped();
            self.emitter.emit_transit_update(
                &self.targets.transit_account,
                &self.targets.transit_selector,
                Some(value),
                ActionResult::Skipped,
                0,
                None,
            );
            return ActionResult::Skipped;
        }

        let started = Instant::now();
        let outcome = self
            .transit_breaker
            .call(|| {
                retry_with_backoff(&self.transit_retry, "transit_priority", || {
                    self.transit.set_priority(
                        &self.targets.transit_account,
                        &self.targets.transit_selector,
                        value,
                    )
                })
            })
            .await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let (result, error_message) = summarize(outcome);
        self.emitter.emit_transit_update(
            &self.targets.transit_account,
            &self.targets.transit_selector,
            Some(value),
            result,
            duration_ms,
            error_message.clone(),
        );
        match result {
            ActionResult::Failure => warn!(
                priority = value,
                error = error_message.as_deref().unwrap_or("unknown"),
                "transit priority update failed"
            ),
            _ => info!(priority = value, result = result.as_str(), "transit priority update"),
        }
        result
    }
}

fn summarize(
    outcome: Result<WriteOutcome, BreakerError<crate::monitor::MonitorError>>,
) -> (ActionResult, Option<String>) {
    match outcome {
        Ok(WriteOutcome::Applied) => {
            runtime_counters().inc_writes_applied();
            (ActionResult::Success, None)
        }
        Ok(WriteOutcome::NoChange) => {
            runtime_counters().inc_writes_no_change();
            (ActionResult::NoChange, None)
        }
        Err(err) => {
            runtime_counters().inc_writes_failed();
            let reason = if err.is_open() {
                format!("rejected: {err}")
            } else {
                err.to_string()
            };
            (ActionResult::Failure, Some(reason))
        }
    }
}
