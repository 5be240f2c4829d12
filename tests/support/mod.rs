#![allow(dead_code)]

use async_trait::async_trait;
use routewarden::config::DaemonConfig;
use routewarden::daemon::Daemon;
use routewarden::events::{EventEmitter, StructuredEvent};
use routewarden::health::Health;
use routewarden::monitor::{MonitorError, RegionMonitor, TransitRouteClient, WriteOutcome};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

pub const LOCAL_REGION: &str = "us-west1";
pub const REMOTE_REGION: &str = "us-east1";
pub const PRIMARY_PREFIX: &str = "10.137.245.0/25";
pub const SECONDARY_PREFIX: &str = "10.137.245.128/25";

/// Environment for a fully valid configuration; tests append overrides.
pub fn base_env() -> Vec<(&'static str, &'static str)> {
    vec![
        ("GCP_PROJECT", "svc-monitoring"),
        ("BGP_PEER_PROJECT", "svc-network"),
        ("LOCAL_GCP_REGION", LOCAL_REGION),
        ("REMOTE_GCP_REGION", REMOTE_REGION),
        ("LOCAL_BGP_ROUTER", "router-west"),
        ("REMOTE_BGP_ROUTER", "router-east"),
        ("LOCAL_BGP_REGION", LOCAL_REGION),
        ("REMOTE_BGP_REGION", REMOTE_REGION),
        ("PRIMARY_PREFIX", PRIMARY_PREFIX),
        ("SECONDARY_PREFIX", SECONDARY_PREFIX),
        ("CLOUDFLARE_ACCOUNT_ID", "acct-1234"),
        ("CLOUDFLARE_API_TOKEN", "token-abcd"),
        ("DESCRIPTION_SUBSTRING", "radius"),
    ]
}

pub fn test_config(overrides: &[(&'static str, &'static str)]) -> DaemonConfig {
    let mut vars = base_env();
    vars.extend_from_slice(overrides);
    let config = DaemonConfig::from_env_map(vars).expect("test config must deserialize");
    config.validate().expect("test config must validate");
    config
}

struct ProbeScript {
    queued: VecDeque<Result<Health, MonitorError>>,
    steady: Health,
}

impl ProbeScript {
    fn new(steady: Health) -> Self {
        Self {
            queued: VecDeque::new(),
            steady,
        }
    }

    fn next(&mut self) -> Result<Health, MonitorError> {
        self.queued.pop_front().unwrap_or(Ok(self.steady))
    }
}

#[derive(Default)]
struct ControlPlaneState {
    backends: HashMap<String, ProbeScript>,
    bgp: Option<ProbeScript>,
    advertised: BTreeSet<String>,
    priority: Option<u32>,
    advertisement_invocations: u64,
    priority_invocations: u64,
    advertisement_failure: Option<MonitorError>,
    priority_failure: Option<MonitorError>,
}

/// In-memory stand-in for both the compute/routing plane and the transit
/// provider. Probe results are scripted per region; writes mutate a tiny
/// model of the advertised set and route priority so idempotence behaves
/// like the real clients.
#[derive(Clone)]
pub struct FakeControlPlane {
    inner: Arc<Mutex<ControlPlaneState>>,
}

impl FakeControlPlane {
    pub fn healthy() -> Self {
        let mut state = ControlPlaneState::default();
        state
            .backends
            .insert(LOCAL_REGION.to_string(), ProbeScript::new(Health::Healthy));
        state
            .backends
            .insert(REMOTE_REGION.to_string(), ProbeScript::new(Health::Healthy));
        state.bgp = Some(ProbeScript::new(Health::Healthy));
        Self {
            inner: Arc::new(Mutex::new(state)),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ControlPlaneState> {
        self.inner.lock().expect("control plane state poisoned")
    }

    pub fn set_backend_steady(&self, region: &str, health: Health) {
        let mut state = self.lock();
        state
            .backends
            .entry(region.to_string())
            .or_insert_with(|| ProbeScript::new(health))
            .steady = health;
    }

    pub fn push_backend(&self, region: &str, result: Result<Health, MonitorError>) {
        let mut state = self.lock();
        state
            .backends
            .entry(region.to_string())
            .or_insert_with(|| ProbeScript::new(Health::Healthy))
            .queued
            .push_back(result);
    }

    pub fn set_bgp_steady(&self, health: Health) {
        let mut state = self.lock();
        match state.bgp.as_mut() {
            Some(script) => script.steady = health,
            None => state.bgp = Some(ProbeScript::new(health)),
        }
    }

    pub fn push_bgp(&self, result: Result<Health, MonitorError>) {
        let mut state = self.lock();
        state
            .bgp
            .get_or_insert_with(|| ProbeScript::new(Health::Healthy))
            .queued
            .push_back(result);
    }

    pub fn fail_advertisements_with(&self, error: MonitorError) {
        self.lock().advertisement_failure = Some(error);
    }

    pub fn fail_priority_with(&self, error: MonitorError) {
        self.lock().priority_failure = Some(error);
    }

    pub fn seed_advertised(&self, prefix: &str) {
        self.lock().advertised.insert(prefix.to_string());
    }

    pub fn seed_priority(&self, priority: u32) {
        self.lock().priority = Some(priority);
    }

    pub fn advertised(&self) -> BTreeSet<String> {
        self.lock().advertised.clone()
    }

    pub fn priority(&self) -> Option<u32> {
        self.lock().priority
    }

    /// Total write calls that reached the fake (idempotent no-ops included).
    pub fn write_invocations(&self) -> u64 {
        let state = self.lock();
        state.advertisement_invocations + state.priority_invocations
    }
}

#[async_trait]
impl RegionMonitor for FakeControlPlane {
    async fn backend_health(&self, region: &str) -> Result<Health, MonitorError> {
        let mut state = self.lock();
        state
            .backends
            .get_mut(region)
            .map(ProbeScript::next)
            .unwrap_or(Ok(Health::Unhealthy))
    }

    async fn bgp_session_health(
        &self,
        _region: &str,
        _router: &str,
    ) -> Result<Health, MonitorError> {
        let mut state = self.lock();
        state
            .bgp
            .as_mut()
            .map(ProbeScript::next)
            .unwrap_or(Ok(Health::Unhealthy))
    }

    async fn set_advertisement(
        &self,
        _region: &str,
        _router: &str,
        prefix: &str,
        advertise: bool,
    ) -> Result<WriteOutcome, MonitorError> {
        let mut state = self.lock();
        state.advertisement_invocations += 1;
        if let Some(error) = state.advertisement_failure.clone() {
            return Err(error);
        }
        let currently = state.advertised.contains(prefix);
        if currently == advertise {
            return Ok(WriteOutcome::NoChange);
        }
        if advertise {
            state.advertised.insert(prefix.to_string());
        } else {
            state.advertised.remove(prefix);
        }
        Ok(WriteOutcome::Applied)
    }
}

#[async_trait]
impl TransitRouteClient for FakeControlPlane {
    async fn set_priority(
        &self,
        _account: &str,
        _selector: &str,
        priority: u32,
    ) -> Result<WriteOutcome, MonitorError> {
        let mut state = self.lock();
        state.priority_invocations += 1;
        if let Some(error) = state.priority_failure.clone() {
            return Err(error);
        }
        if state.priority == Some(priority) {
            return Ok(WriteOutcome::NoChange);
        }
        state.priority = Some(priority);
        Ok(WriteOutcome::Applied)
    }
}

/// Daemon wired to a fake control plane, with the raw event stream exposed.
pub fn build_daemon(
    config: DaemonConfig,
    plane: &FakeControlPlane,
) -> (Daemon, mpsc::Receiver<StructuredEvent>) {
    let (emitter, rx) = EventEmitter::channel(1024);
    let daemon = Daemon::new(
        config,
        Arc::new(plane.clone()),
        Arc::new(plane.clone()),
        emitter,
    );
    (daemon, rx)
}

pub fn drain_events(rx: &mut mpsc::Receiver<StructuredEvent>) -> Vec<StructuredEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

pub fn events_of_type<'a>(
    events: &'a [StructuredEvent],
    event_type: &str,
) -> Vec<&'a StructuredEvent> {
    events
        .iter()
        .filter(|event| event.event_type == event_type)
        .collect()
}
