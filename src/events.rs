use crate::health::Health;
use crate::planner::ActionPlan;
use crate::state::FailoverState;
use crate::telemetry::runtime_counters;
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{json, Value as JsonValue};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventType {
    HealthCheckCycle,
    StateTransition,
    BgpAdvertisementChange,
    CloudflareRouteUpdate,
    CircuitBreakerEvent,
    ConnectivityTest,
    HealthCheckResult,
    DaemonLifecycle,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::HealthCheckCycle => "health_check_cycle",
            EventType::StateTransition => "state_transition",
            EventType::BgpAdvertisementChange => "bgp_advertisement_change",
            EventType::CloudflareRouteUpdate => "cloudflare_route_update",
            EventType::CircuitBreakerEvent => "circuit_breaker_event",
            EventType::ConnectivityTest => "connectivity_test",
            EventType::HealthCheckResult => "health_check_result",
            EventType::DaemonLifecycle => "daemon_lifecycle",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionResult {
    Success,
    Failure,
    NoChange,
    Skipped,
}

impl ActionResult {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionResult::Success => "success",
            ActionResult::Failure => "failure",
            ActionResult::NoChange => "no_change",
            ActionResult::Skipped => "skipped",
        }
    }
}

/// One structured observability record. Serialized to JSON on the sink side.
#[derive(Clone, Debug, Serialize)]
pub struct StructuredEvent {
    pub event_type: String,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub component: String,
    pub operation: String,
    pub result: ActionResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub details: JsonValue,
}

/// Hands typed events to a bounded sink without ever blocking the control
/// loop: when the channel is full the event is dropped and counted.
#[derive(Clone)]
pub struct EventEmitter {
    tx: mpsc::Sender<StructuredEvent>,
    correlation: Arc<Mutex<Option<String>>>,
}

impl EventEmitter {
    /// Creates an emitter plus the raw receiving side. Tests drain the
    /// receiver directly; production code uses [`EventEmitter::spawn`].
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<StructuredEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                tx,
                correlation: Arc::new(Mutex::new(None)),
            },
            rx,
        )
    }

    /// Creates an emitter backed by a sink task that writes each event as a
    /// JSON log line.
    pub fn spawn(capacity: usize) -> (Self, JoinHandle<()>) {
        let (emitter, mut rx) = Self::channel(capacity);
        let sink = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                write_event(&event);
            }
        });
        (emitter, sink)
    }

    pub fn set_correlation_id(&self, correlation_id: impl Into<String>) {
        let mut guard = self.correlation.lock().expect("correlation lock poisoned");
        *guard = Some(correlation_id.into());
    }

    fn current_correlation(&self) -> Option<String> {
        self.correlation
            .lock()
            .expect("correlation lock poisoned")
            .clone()
    }

    pub fn emit(&self, mut event: StructuredEvent) {
        if event.correlation_id.is_none() {
            event.correlation_id = self.current_correlation();
        }
        if self.tx.try_send(event).is_err() {
            runtime_counters().inc_events_dropped();
            debug!("event sink full, dropping event");
        }
    }

    fn build(
        &self,
        event_type: &str,
        component: &str,
        operation: impl Into<String>,
        result: ActionResult,
        details: JsonValue,
    ) -> StructuredEvent {
        StructuredEvent {
            event_type: event_type.to_string(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            correlation_id: None,
            component: component.to_string(),
            operation: operation.into(),
            result,
            duration_ms: None,
            error_message: None,
            details,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn emit_bgp_advertisement(
        &self,
        region: &str,
        router: &str,
        prefix: &str,
        advertise: bool,
        result: ActionResult,
        duration_ms: u64,
        error_message: Option<String>,
    ) {
        let action = if advertise { "advertise" } else { "withdraw" };
        let mut event = self.build(
            EventType::BgpAdvertisementChange.as_str(),
            "bgp",
            format!("{action}_prefix"),
            result,
            json!({
                "region": region,
                "router": router,
                "ip_prefix": prefix,
                "action": action,
            }),
        );
        event.duration_ms = Some(duration_ms);
        event.error_message = error_message;
        self.emit(event);
    }

    pub fn emit_transit_update(
        &self,
        account: &str,
        selector: &str,
        priority: Option<u32>,
        result: ActionResult,
        duration_ms: u64,
        error_message: Option<String>,
    ) {
        let mut event = self.build(
            EventType::CloudflareRouteUpdate.as_str(),
            "transit",
            "update_route_priorities",
            result,
            json!({
                "account_id": account,
                "description_filter": selector,
                "desired_priority": priority,
            }),
        );
        event.duration_ms = Some(duration_ms);
        event.error_message = error_message;
        self.emit(event);
    }

    pub fn emit_health_check(
        &self,
        region: &str,
        service_type: &str,
        health: Health,
        duration_ms: u64,
        details: JsonValue,
    ) {
        let result = match health {
            Health::Healthy => ActionResult::Success,
            Health::Unhealthy => ActionResult::Failure,
            Health::Unknown => ActionResult::Skipped,
        };
        let mut event = self.build(
            EventType::HealthCheckResult.as_str(),
            "health_check",
            format!("check_{service_type}"),
            result,
            json!({
                "region": region,
                "service_type": service_type,
                "health": health,
                "detail": details,
            }),
        );
        event.duration_ms = Some(duration_ms);
        self.emit(event);
    }

    #[allow(clippy::too_many_arguments)]
    pub fn emit_state_transition(
        &self,
        old_state: FailoverState,
        new_state: FailoverState,
        local: Health,
        remote: Health,
        bgp: Health,
        plan: &ActionPlan,
        via_exception: bool,
    ) {
        let event = self.build(
            EventType::StateTransition.as_str(),
            "state_machine",
            "state_transition",
            ActionResult::Success,
            json!({
                "old_state_code": old_state,
                "new_state_code": new_state,
                "local_health": local,
                "remote_health": remote,
                "bgp_health": bgp,
                "planned_primary_advertisement": plan.advertise_primary,
                "planned_secondary_advertisement": plan.advertise_secondary,
                "dwell_exception_bypass": via_exception,
            }),
        );
        self.emit(event);
    }

    pub fn emit_circuit_breaker(
        &self,
        service: &str,
        event_name: &str,
        failure_count: u32,
        error_message: Option<String>,
    ) {
        let mut event = self.build(
            EventType::CircuitBreakerEvent.as_str(),
            "circuit_breaker",
            event_name,
            ActionResult::Success,
            json!({
                "service": service,
                "failure_count": failure_count,
            }),
        );
        event.error_message = error_message;
        self.emit(event);
    }

    pub fn emit_connectivity_test(
        &self,
        component: &str,
        result: ActionResult,
        details: JsonValue,
        error_message: Option<String>,
    ) {
        let mut event = self.build(
            EventType::ConnectivityTest.as_str(),
            component,
            "connectivity_validation",
            result,
            details,
        );
        event.error_message = error_message;
        self.emit(event);
    }

    pub fn emit_lifecycle(&self, operation: &str, result: ActionResult, details: JsonValue) {
        let event = self.build(
            EventType::DaemonLifecycle.as_str(),
            "daemon",
            operation,
            result,
            details,
        );
        self.emit(event);
    }

    pub fn emit_cycle(&self, result: ActionResult, duration_ms: u64, details: JsonValue) {
        let mut event = self.build(
            EventType::HealthCheckCycle.as_str(),
            "daemon",
            "health_check_cycle",
            result,
            details,
        );
        event.duration_ms = Some(duration_ms);
        self.emit(event);
    }

    /// Free-form events outside the fixed taxonomy (`dwell_blocked`,
    /// `pending_verification`).
    pub fn emit_custom(&self, name: &str, details: JsonValue) {
        let event = self.build(name, "state_machine", name, ActionResult::Skipped, details);
        self.emit(event);
    }
}

fn write_event(event: &StructuredEvent) {
    let payload = match serde_json::to_string(event) {
        Ok(payload) => payload,
        Err(err) => {
            error!(error = %err, "failed to serialize structured event");
            return;
        }
    };
    match event.result {
        ActionResult::Failure => {
            error!(target: "routewarden::events", event_type = %event.event_type, "{payload}")
        }
        ActionResult::NoChange => {
            debug!(target: "routewarden::events", event_type = %event.event_type, "{payload}")
        }
        _ => info!(target: "routewarden::events", event_type = %event.event_type, "{payload}"),
    }
}
