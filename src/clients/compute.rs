use super::transport_error;
use crate::config::DaemonConfig;
use crate::health::Health;
use crate::monitor::{MonitorError, RegionMonitor, WriteOutcome};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

const DEFAULT_BASE_URL: &str = "https://compute.googleapis.com/compute/v1";
const METADATA_TOKEN_PATH: &str =
    "/computeMetadata/v1/instance/service-accounts/default/token";
const HEALTHY_STATE: &str = "HEALTHY";
const BGP_SESSION_UP: &str = "UP";
// Refresh the cached token comfortably before its real expiry.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(120);

/// Where the client obtains its bearer token.
pub enum TokenSource {
    /// Fixed token, used by tests and short-lived tooling.
    Static(String),
    /// GCE/GKE metadata server (application default credentials).
    MetadataServer { base_url: String },
}

impl TokenSource {
    pub fn metadata_server() -> Self {
        let host = std::env::var("GCE_METADATA_HOST")
            .unwrap_or_else(|_| "metadata.google.internal".to_string());
        TokenSource::MetadataServer {
            base_url: format!("http://{host}"),
        }
    }
}

#[derive(Deserialize)]
struct MetadataToken {
    access_token: String,
    expires_in: u64,
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

/// REST client for the cloud compute/routing plane: regional backend service
/// health, cloud router BGP session status, and custom route advertisements.
pub struct ComputeRouteClient {
    http: reqwest::Client,
    base_url: String,
    project: String,
    peer_project: String,
    token_source: TokenSource,
    token_cache: Mutex<Option<CachedToken>>,
    backend_health_timeout: Duration,
    bgp_operation_timeout: Duration,
    api_timeout: Duration,
}

impl ComputeRouteClient {
    pub fn new(http: reqwest::Client, config: &DaemonConfig, token_source: TokenSource) -> Self {
        Self {
            http,
            base_url: DEFAULT_BASE_URL.to_string(),
            project: config.gcp_project.clone(),
            peer_project: config.bgp_peer_project.clone(),
            token_source,
            token_cache: Mutex::new(None),
            backend_health_timeout: Duration::from_secs(config.gcp_backend_health_timeout),
            bgp_operation_timeout: Duration::from_secs(config.gcp_bgp_operation_timeout),
            api_timeout: Duration::from_secs(config.gcp_api_timeout),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    async fn bearer(&self) -> Result<String, MonitorError> {
        match &self.token_source {
            TokenSource::Static(token) => Ok(token.clone()),
            TokenSource::MetadataServer { base_url } => {
                let mut cache = self.token_cache.lock().await;
                if let Some(cached) = cache.as_ref() {
                    if Instant::now() < cached.expires_at {
                        return Ok(cached.value.clone());
                    }
                }
                let token = self.fetch_metadata_token(base_url).await?;
                let value = token.access_token.clone();
                *cache = Some(CachedToken {
                    value: token.access_token,
                    expires_at: Instant::now()
                        + Duration::from_secs(token.expires_in).saturating_sub(TOKEN_EXPIRY_MARGIN),
                });
                Ok(value)
            }
        }
    }

    async fn fetch_metadata_token(&self, base_url: &str) -> Result<MetadataToken, MonitorError> {
        let response = self
            .http
            .get(format!("{base_url}{METADATA_TOKEN_PATH}"))
            .header("Metadata-Flavor", "Google")
            .timeout(self.api_timeout)
            .send()
            .await
            .map_err(|err| transport_error(err, "metadata token"))?;
        let status = response.status().as_u16();
        if !response.status().is_success() {
            return Err(MonitorError::from_status(
                status,
                "metadata server refused token request",
            ));
        }
        response
            .json::<MetadataToken>()
            .await
            .map_err(|err| transport_error(err, "metadata token decode"))
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(
        &self,
        url: &str,
        timeout: Duration,
        operation: &str,
    ) -> Result<T, MonitorError> {
        let token = self.bearer().await?;
        let response = self
            .http
            .get(url)
            .bearer_auth(token)
            .timeout(timeout)
            .send()
            .await
            .map_err(|err| transport_error(err, operation))?;
        decode_response(response, operation).await
    }

    /// Checks every backend of every regional backend service. A region with
    /// no backend services counts as healthy.
    async fn region_backends_healthy(&self, region: &str) -> Result<Health, MonitorError> {
        let url = format!(
            "{}/projects/{}/regions/{}/backendServices",
            self.base_url, self.project, region
        );
        let services: BackendServiceList = self
            .get_json(&url, self.backend_health_timeout, "list backend services")
            .await?;

        if services.items.is_empty() {
            debug!(region, "no backend services found, treating region as healthy");
            return Ok(Health::Healthy);
        }

        let token = self.bearer().await?;
        let mut healthy = true;
        for service in &services.items {
            for backend in &service.backends {
                let health_url = format!(
                    "{}/projects/{}/regions/{}/backendServices/{}/getHealth",
                    self.base_url, self.project, region, service.name
                );
                let response = self
                    .http
                    .post(&health_url)
                    .bearer_auth(&token)
                    .timeout(self.backend_health_timeout)
                    .json(&json!({ "group": backend.group }))
                    .send()
                    .await
                    .map_err(|err| transport_error(err, "backend getHealth"))?;
                let health: BackendHealthResponse =
                    decode_response(response, "backend getHealth").await?;

                if health.health_status.is_empty() {
                    warn!(
                        region,
                        service = %service.name,
                        backend = %backend.group,
                        "no health status reported for backend"
                    );
                    healthy = false;
                    continue;
                }
                for status in &health.health_status {
                    let state = status.health_state.as_deref().unwrap_or("UNKNOWN");
                    if state != HEALTHY_STATE {
                        warn!(
                            region,
                            service = %service.name,
                            backend = %backend.group,
                            state,
                            "unhealthy backend instance"
                        );
                        healthy = false;
                    }
                }
            }
        }
        Ok(Health::from_flag(healthy))
    }
}

#[async_trait]
impl RegionMonitor for ComputeRouteClient {
    async fn backend_health(&self, region: &str) -> Result<Health, MonitorError> {
        self.region_backends_healthy(region).await
    }

    async fn bgp_session_health(
        &self,
        region: &str,
        router: &str,
    ) -> Result<Health, MonitorError> {
        let url = format!(
            "{}/projects/{}/regions/{}/routers/{}/getRouterStatus",
            self.base_url, self.peer_project, region, router
        );
        let status: RouterStatusResponse = self
            .get_json(&url, self.api_timeout, "router status")
            .await?;

        let peers = status
            .result
            .map(|result| result.bgp_peer_status)
            .unwrap_or_default();
        let all_up = peers.iter().all(|peer| {
            let up = peer.status.as_deref() == Some(BGP_SESSION_UP);
            if !up {
                warn!(
                    router,
                    peer = %peer.name,
                    status = peer.status.as_deref().unwrap_or("UNKNOWN"),
                    "bgp session not established"
                );
            }
            up
        });
        Ok(Health::from_flag(all_up))
    }

    async fn set_advertisement(
        &self,
        region: &str,
        router: &str,
        prefix: &str,
        advertise: bool,
    ) -> Result<WriteOutcome, MonitorError> {
        let url = format!(
            "{}/projects/{}/regions/{}/routers/{}",
            self.base_url, self.peer_project, region, router
        );
        let resource: RouterResource = self
            .get_json(&url, self.bgp_operation_timeout, "read router")
            .await?;

        let mut ranges: Vec<String> = resource
            .bgp
            .map(|bgp| bgp.advertised_ip_ranges)
            .unwrap_or_default()
            .into_iter()
            .map(|range| range.range)
            .collect();
        let currently_advertised = ranges.iter().any(|range| range == prefix);

        if currently_advertised == advertise {
            debug!(router, prefix, advertise, "advertisement already in desired state");
            return Ok(WriteOutcome::NoChange);
        }

        if advertise {
            ranges.push(prefix.to_string());
        } else {
            ranges.retain(|range| range != prefix);
        }
        let body = json!({
            "bgp": {
                "advertisedIpRanges": ranges
                    .iter()
                    .map(|range| json!({ "range": range }))
                    .collect::<Vec<_>>(),
            }
        });

        let token = self.bearer().await?;
        let response = self
            .http
            .patch(&url)
            .bearer_auth(token)
            .timeout(self.bgp_operation_timeout)
            .json(&body)
            .send()
            .await
            .map_err(|err| transport_error(err, "patch router"))?;
        let status = response.status().as_u16();
        if !response.status().is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(MonitorError::from_status(status, message));
        }
        Ok(WriteOutcome::Applied)
    }
}

async fn decode_response<T: for<'de> Deserialize<'de>>(
    response: reqwest::Response,
    operation: &str,
) -> Result<T, MonitorError> {
    let status = response.status().as_u16();
    if !response.status().is_success() {
        let message = response.text().await.unwrap_or_default();
        return Err(MonitorError::from_status(
            status,
            format!("{operation}: {message}"),
        ));
    }
    response
        .json::<T>()
        .await
        .map_err(|err| transport_error(err, operation))
}

#[derive(Deserialize)]
struct BackendServiceList {
    #[serde(default)]
    items: Vec<BackendService>,
}

#[derive(Deserialize)]
struct BackendService {
    name: String,
    #[serde(default)]
    backends: Vec<Backend>,
}

#[derive(Deserialize)]
struct Backend {
    group: String,
}

#[derive(Deserialize)]
struct BackendHealthResponse {
    #[serde(default, rename = "healthStatus")]
    health_status: Vec<BackendHealthStatus>,
}

#[derive(Deserialize)]
struct BackendHealthStatus {
    #[serde(rename = "healthState")]
    health_state: Option<String>,
}

#[derive(Deserialize)]
struct RouterStatusResponse {
    result: Option<RouterStatus>,
}

#[derive(Deserialize)]
struct RouterStatus {
    #[serde(default, rename = "bgpPeerStatus")]
    bgp_peer_status: Vec<BgpPeerStatus>,
}

#[derive(Deserialize)]
struct BgpPeerStatus {
    #[serde(default)]
    name: String,
    status: Option<String>,
}

#[derive(Deserialize)]
struct RouterResource {
    bgp: Option<RouterBgp>,
}

#[derive(Deserialize)]
struct RouterBgp {
    #[serde(default, rename = "advertisedIpRanges")]
    advertised_ip_ranges: Vec<AdvertisedRange>,
}

#[derive(Deserialize)]
struct AdvertisedRange {
    range: String,
}
