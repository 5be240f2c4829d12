use super::transport_error;
use crate::config::DaemonConfig;
use crate::monitor::{MonitorError, TransitRouteClient, WriteOutcome};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info};

const DEFAULT_BASE_URL: &str = "https://api.cloudflare.com/client/v4";

/// REST client for the transit provider's route table. Priority changes are
/// applied as one bulk update covering every route matched by the
/// description selector.
pub struct TransitApiClient {
    http: reqwest::Client,
    base_url: String,
    api_token: String,
    api_timeout: Duration,
    bulk_timeout: Duration,
}

impl TransitApiClient {
    pub fn new(http: reqwest::Client, config: &DaemonConfig) -> Self {
        Self {
            http,
            base_url: DEFAULT_BASE_URL.to_string(),
            api_token: config.cloudflare_api_token.clone(),
            api_timeout: Duration::from_secs(config.cloudflare_api_timeout),
            bulk_timeout: Duration::from_secs(config.cloudflare_bulk_timeout),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Startup connectivity check: listing routes exercises both the token
    /// and the account scope.
    pub async fn list_routes(&self, account: &str) -> Result<Vec<TransitRoute>, MonitorError> {
        let url = format!("{}/accounts/{}/magic/routes", self.base_url, account);
        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.api_token)
            .timeout(self.api_timeout)
            .send()
            .await
            .map_err(|err| transport_error(err, "list transit routes"))?;

        let envelope: Envelope<RouteList> = decode(response, "list transit routes").await?;
        Ok(envelope.result.map(|list| list.routes).unwrap_or_default())
    }
}

#[async_trait]
impl TransitRouteClient for TransitApiClient {
    async fn set_priority(
        &self,
        account: &str,
        selector: &str,
        priority: u32,
    ) -> Result<WriteOutcome, MonitorError> {
        let routes = self.list_routes(account).await?;

        // Case-sensitive substring match on the route description.
        let stale: Vec<&TransitRoute> = routes
            .iter()
            .filter(|route| route.description.contains(selector))
            .filter(|route| route.priority != priority)
            .collect();

        if stale.is_empty() {
            debug!(selector, priority, "all matched transit routes already at priority");
            return Ok(WriteOutcome::NoChange);
        }

        let updated: Vec<_> = stale
            .iter()
            .map(|route| {
                json!({
                    "id": route.id,
                    "prefix": route.prefix,
                    "nexthop": route.nexthop,
                    "description": route.description,
                    "priority": priority,
                })
            })
            .collect();

        let url = format!("{}/accounts/{}/magic/routes", self.base_url, account);
        let response = self
            .http
            .put(&url)
            .bearer_auth(&self.api_token)
            .timeout(self.bulk_timeout)
            .json(&json!({ "routes": updated }))
            .send()
            .await
            .map_err(|err| transport_error(err, "bulk update transit routes"))?;

        let _: Envelope<serde_json::Value> = decode(response, "bulk update transit routes").await?;
        info!(
            selector,
            priority,
            modified = stale.len(),
            "transit route priorities updated"
        );
        Ok(WriteOutcome::Applied)
    }
}

async fn decode<T: for<'de> Deserialize<'de>>(
    response: reqwest::Response,
    operation: &str,
) -> Result<Envelope<T>, MonitorError> {
    let status = response.status().as_u16();
    if !response.status().is_success() {
        let message = response.text().await.unwrap_or_default();
        return Err(MonitorError::from_status(
            status,
            format!("{operation}: {message}"),
        ));
    }
    let envelope: Envelope<T> = response
        .json()
        .await
        .map_err(|err| transport_error(err, operation))?;
    if !envelope.success {
        let detail = envelope
            .errors
            .iter()
            .map(|err| err.message.as_str())
            .collect::<Vec<_>>()
            .join("; ");
        return Err(MonitorError::Unclassified {
            status,
            message: format!("{operation}: API reported failure: {detail}"),
        });
    }
    Ok(envelope)
}

#[derive(Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    errors: Vec<ApiError>,
    result: Option<T>,
}

#[derive(Deserialize)]
struct ApiError {
    #[serde(default)]
    message: String,
}

#[derive(Deserialize)]
struct RouteList {
    #[serde(default)]
    routes: Vec<TransitRoute>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TransitRoute {
    pub id: String,
    pub prefix: String,
    pub nexthop: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: u32,
}
