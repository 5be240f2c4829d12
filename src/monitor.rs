use crate::health::Health;
use async_trait::async_trait;
use thiserror::Error;

/// HTTP statuses that indicate misconfiguration rather than a flaky upstream.
pub const PERMANENT_HTTP_STATUSES: [u16; 2] = [403, 404];
/// HTTP statuses worth retrying before declaring the monitoring plane down.
pub const TRANSIENT_HTTP_STATUSES: [u16; 6] = [408, 429, 500, 502, 503, 504];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    Permanent,
    Transient,
    Unclassified,
}

impl ErrorClass {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorClass::Permanent => "permanent",
            ErrorClass::Transient => "transient",
            ErrorClass::Unclassified => "unclassified",
        }
    }
}

/// Failure surfaced by a monitor client call.
///
/// Permanent errors (authorization denied, resource not found) point at
/// misconfiguration and must not be retried. Transient errors are retried by
/// the caller; once retries are exhausted the probe result degrades to
/// `Health::Unknown`. Unclassified errors take the safe default and also map
/// to Unknown without retrying.
#[derive(Clone, Debug, Error)]
pub enum MonitorError {
    #[error("permanent API error (status {status}): {message}")]
    Permanent { status: u16, message: String },
    #[error("transient API error (status {status:?}): {message}")]
    Transient { status: Option<u16>, message: String },
    #[error("request timed out")]
    Timeout,
    #[error("unclassified API error (status {status}): {message}")]
    Unclassified { status: u16, message: String },
}

impl MonitorError {
    /// Buckets an HTTP status into the three error classes.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        if PERMANENT_HTTP_STATUSES.contains(&status) {
            MonitorError::Permanent { status, message }
        } else if TRANSIENT_HTTP_STATUSES.contains(&status) {
            MonitorError::Transient {
                status: Some(status),
                message,
            }
        } else {
            MonitorError::Unclassified { status, message }
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        MonitorError::Transient {
            status: None,
            message: message.into(),
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            MonitorError::Permanent { .. } => ErrorClass::Permanent,
            MonitorError::Transient { .. } | MonitorError::Timeout => ErrorClass::Transient,
            MonitorError::Unclassified { .. } => ErrorClass::Unclassified,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self.class(), ErrorClass::Transient)
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            MonitorError::Permanent { status, .. } | MonitorError::Unclassified { status, .. } => {
                Some(*status)
            }
            MonitorError::Transient { status, .. } => *status,
            MonitorError::Timeout => None,
        }
    }
}

/// Result of an idempotent write against an external control surface.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    /// A mutation was issued and acknowledged.
    Applied,
    /// The desired value was already in place; no mutation was issued.
    NoChange,
}

/// Read and write capabilities against the cloud compute/routing plane.
///
/// Real implementations wrap the vendor REST API; tests supply in-memory
/// fakes. Writes must be idempotent: when the current advertisement set
/// already matches the request, return `NoChange` without mutating.
#[async_trait]
pub trait RegionMonitor: Send + Sync {
    /// Healthy iff every backend in the region reports a known-good status.
    async fn backend_health(&self, region: &str) -> Result<Health, MonitorError>;

    /// Healthy iff all BGP sessions on the router are established.
    async fn bgp_session_health(&self, region: &str, router: &str)
        -> Result<Health, MonitorError>;

    /// Adds or removes `prefix` from the router's advertised set.
    async fn set_advertisement(
        &self,
        region: &str,
        router: &str,
        prefix: &str,
        advertise: bool,
    ) -> Result<WriteOutcome, MonitorError>;
}

/// Bulk priority control over the transit provider's route table.
#[async_trait]
pub trait TransitRouteClient: Send + Sync {
    /// Sets `priority` on every route whose description contains `selector`
    /// (case-sensitive). Routes already at the requested priority are left
    /// untouched; returns `NoChange` when nothing differed.
    async fn set_priority(
        &self,
        account: &str,
        selector: &str,
        priority: u32,
    ) -> Result<WriteOutcome, MonitorError>;
}
