use crate::state::FailoverState;
use config::{Config, ConfigError, Environment};
use serde::Deserialize;
use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;

/// Immutable runtime configuration, populated from the environment.
///
/// Every option is environment-driven; the daemon takes no command-line
/// arguments. `validate` reports every problem at once so a misconfigured
/// unit fails fast with a complete picture.
#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    // Control loop and retry settings
    #[serde(default = "default_check_interval")]
    pub check_interval_seconds: u64,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub max_retries_health_check: Option<u32>,
    #[serde(default)]
    pub max_retries_bgp_check: Option<u32>,
    #[serde(default)]
    pub max_retries_bgp_update: Option<u32>,
    #[serde(default)]
    pub max_retries_cloudflare: Option<u32>,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_seconds: f64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_seconds: f64,
    #[serde(default = "default_breaker_threshold")]
    pub circuit_breaker_threshold: u32,
    #[serde(default = "default_breaker_timeout")]
    pub circuit_breaker_timeout_seconds: u64,

    // Hysteresis smoothing
    #[serde(default = "default_health_window")]
    pub health_check_window: usize,
    #[serde(default = "default_health_threshold")]
    pub health_check_threshold: usize,
    #[serde(default)]
    pub asymmetric_hysteresis: bool,

    // Consecutive-observation verification
    #[serde(default = "default_verification_threshold")]
    pub state_2_verification_threshold: u32,
    #[serde(default = "default_verification_threshold")]
    pub state_3_verification_threshold: u32,
    #[serde(default = "default_verification_threshold")]
    pub state_4_verification_threshold: u32,

    // Dwell-time gate
    #[serde(default = "default_min_dwell")]
    pub min_state_dwell_time: u64,
    #[serde(default = "default_dwell_exceptions")]
    pub dwell_time_exception_states: String,

    // Passive mode: observe and log, never actuate
    #[serde(default)]
    pub run_passive: bool,

    // Per-API timeouts (seconds)
    #[serde(default = "default_gcp_api_timeout")]
    pub gcp_api_timeout: u64,
    #[serde(default = "default_backend_health_timeout")]
    pub gcp_backend_health_timeout: u64,
    #[serde(default = "default_bgp_operation_timeout")]
    pub gcp_bgp_operation_timeout: u64,
    #[serde(default = "default_cloudflare_api_timeout")]
    pub cloudflare_api_timeout: u64,
    #[serde(default = "default_cloudflare_bulk_timeout")]
    pub cloudflare_bulk_timeout: u64,

    // Topology
    #[serde(default)]
    pub gcp_project: String,
    #[serde(default)]
    pub bgp_peer_project: String,
    #[serde(default)]
    pub local_gcp_region: String,
    #[serde(default)]
    pub remote_gcp_region: String,
    #[serde(default)]
    pub local_bgp_router: String,
    #[serde(default)]
    pub remote_bgp_router: String,
    #[serde(default)]
    pub local_bgp_region: String,
    #[serde(default)]
    pub remote_bgp_region: String,
    #[serde(default)]
    pub primary_prefix: String,
    #[serde(default)]
    pub secondary_prefix: String,

    // Transit provider
    #[serde(default)]
    pub cloudflare_account_id: String,
    #[serde(default)]
    pub cloudflare_api_token: String,
    #[serde(default)]
    pub description_substring: String,
    #[serde(default = "default_primary_priority")]
    pub cloudflare_primary_priority: u32,
    #[serde(default = "default_secondary_priority")]
    pub cloudflare_secondary_priority: u32,
}

const fn default_check_interval() -> u64 {
    60
}
const fn default_initial_backoff() -> f64 {
    1.0
}
const fn default_max_backoff() -> f64 {
    60.0
}
const fn default_breaker_threshold() -> u32 {
    5
}
const fn default_breaker_timeout() -> u64 {
    300
}
const fn default_health_window() -> usize {
    5
}
const fn default_health_threshold() -> usize {
    3
}
const fn default_verification_threshold() -> u32 {
    2
}
const fn default_min_dwell() -> u64 {
    120
}
fn default_dwell_exceptions() -> String {
    "1,4".to_string()
}
const fn default_gcp_api_timeout() -> u64 {
    30
}
const fn default_backend_health_timeout() -> u64 {
    45
}
const fn default_bgp_operation_timeout() -> u64 {
    60
}
const fn default_cloudflare_api_timeout() -> u64 {
    10
}
const fn default_cloudflare_bulk_timeout() -> u64 {
    60
}
const fn default_primary_priority() -> u32 {
    100
}
const fn default_secondary_priority() -> u32 {
    200
}

impl DaemonConfig {
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_source(Environment::default().try_parsing(true))
    }

    /// Builds a configuration from an explicit key/value set instead of the
    /// process environment. Used by tests so they never mutate global state.
    pub fn from_env_map<'a, I>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut source = config::Map::new();
        for (key, value) in vars {
            source.insert(key.to_string(), value.to_string());
        }
        Self::from_source(Environment::default().try_parsing(true).source(Some(source)))
    }

    fn from_source(env: Environment) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(env)
            .build()?
            .try_deserialize()
    }

    // Retry budgets fall back to the legacy MAX_RETRIES value when the
    // per-service variable is unset, then to the per-service default.
    pub fn health_check_retries(&self) -> u32 {
        self.max_retries_health_check
            .or(self.max_retries)
            .unwrap_or(5)
    }

    pub fn bgp_check_retries(&self) -> u32 {
        self.max_retries_bgp_check.or(self.max_retries).unwrap_or(4)
    }

    pub fn bgp_update_retries(&self) -> u32 {
        self.max_retries_bgp_update
            .or(self.max_retries)
            .unwrap_or(2)
    }

    pub fn transit_retries(&self) -> u32 {
        self.max_retries_cloudflare
            .or(self.max_retries)
            .unwrap_or(3)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_seconds)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_secs_f64(self.initial_backoff_seconds.max(0.0))
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs_f64(self.max_backoff_seconds.max(0.0))
    }

    pub fn breaker_timeout(&self) -> Duration {
        Duration::from_secs(self.circuit_breaker_timeout_seconds)
    }

    pub fn min_dwell(&self) -> Duration {
        Duration::from_secs(self.min_state_dwell_time)
    }

    pub fn verification_threshold(&self, state: FailoverState) -> u32 {
        match state {
            FailoverState::LocalImpaired => self.state_2_verification_threshold,
            FailoverState::RemoteImpaired => self.state_3_verification_threshold,
            FailoverState::DualImpaired => self.state_4_verification_threshold,
            _ => 1,
        }
    }

    /// Parses `DWELL_TIME_EXCEPTION_STATES`; entries that fail to parse are
    /// reported by `validate` and ignored here.
    pub fn dwell_exception_states(&self) -> Vec<FailoverState> {
        self.dwell_time_exception_states
            .split(',')
            .filter_map(|entry| entry.trim().parse::<u8>().ok())
            .filter_map(FailoverState::from_code)
            .collect()
    }

    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        let mut errors = Vec::new();

        let required = [
            ("GCP_PROJECT", &self.gcp_project),
            ("LOCAL_GCP_REGION", &self.local_gcp_region),
            ("REMOTE_GCP_REGION", &self.remote_gcp_region),
            ("LOCAL_BGP_ROUTER", &self.local_bgp_router),
            ("REMOTE_BGP_ROUTER", &self.remote_bgp_router),
            ("LOCAL_BGP_REGION", &self.local_bgp_region),
            ("REMOTE_BGP_REGION", &self.remote_bgp_region),
            ("BGP_PEER_PROJECT", &self.bgp_peer_project),
            ("PRIMARY_PREFIX", &self.primary_prefix),
            ("SECONDARY_PREFIX", &self.secondary_prefix),
            ("CLOUDFLARE_ACCOUNT_ID", &self.cloudflare_account_id),
            ("CLOUDFLARE_API_TOKEN", &self.cloudflare_api_token),
            ("DESCRIPTION_SUBSTRING", &self.description_substring),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                errors.push(format!("missing required environment variable: {name}"));
            }
        }

        for (name, value) in [
            ("PRIMARY_PREFIX", &self.primary_prefix),
            ("SECONDARY_PREFIX", &self.secondary_prefix),
        ] {
            if !value.trim().is_empty() {
                if let Err(reason) = parse_ip_prefix(value) {
                    errors.push(format!("invalid {name} `{value}`: {reason}"));
                }
            }
        }

        check_range(
            &mut errors,
            "CHECK_INTERVAL_SECONDS",
            self.check_interval_seconds,
            1,
            3600,
        );
        for (name, value) in [
            ("MAX_RETRIES", self.max_retries),
            ("MAX_RETRIES_HEALTH_CHECK", self.max_retries_health_check),
            ("MAX_RETRIES_BGP_CHECK", self.max_retries_bgp_check),
            ("MAX_RETRIES_BGP_UPDATE", self.max_retries_bgp_update),
            ("MAX_RETRIES_CLOUDFLARE", self.max_retries_cloudflare),
        ] {
            if let Some(value) = value {
                check_range(&mut errors, name, u64::from(value), 1, 10);
            }
        }
        if !(0.1..=60.0).contains(&self.initial_backoff_seconds) {
            errors.push(format!(
                "INITIAL_BACKOFF_SECONDS must be between 0.1 and 60, got {}",
                self.initial_backoff_seconds
            ));
        }
        if !(1.0..=600.0).contains(&self.max_backoff_seconds) {
            errors.push(format!(
                "MAX_BACKOFF_SECONDS must be between 1 and 600, got {}",
                self.max_backoff_seconds
            ));
        }
        check_range(
            &mut errors,
            "CIRCUIT_BREAKER_THRESHOLD",
            u64::from(self.circuit_breaker_threshold),
            1,
            20,
        );
        check_range(
            &mut errors,
            "CIRCUIT_BREAKER_TIMEOUT_SECONDS",
            self.circuit_breaker_timeout_seconds,
            30,
            3600,
        );
        check_range(
            &mut errors,
            "HEALTH_CHECK_WINDOW",
            self.health_check_window as u64,
            3,
            10,
        );
        if self.health_check_threshold < 1 || self.health_check_threshold > self.health_check_window
        {
            errors.push(format!(
                "HEALTH_CHECK_THRESHOLD ({}) must be between 1 and HEALTH_CHECK_WINDOW ({})",
                self.health_check_threshold, self.health_check_window
            ));
        }
        for (name, value) in [
            (
                "STATE_2_VERIFICATION_THRESHOLD",
                self.state_2_verification_threshold,
            ),
            (
                "STATE_3_VERIFICATION_THRESHOLD",
                self.state_3_verification_threshold,
            ),
            (
                "STATE_4_VERIFICATION_THRESHOLD",
                self.state_4_verification_threshold,
            ),
        ] {
            check_range(&mut errors, name, u64::from(value), 1, 10);
        }
        check_range(
            &mut errors,
            "MIN_STATE_DWELL_TIME",
            self.min_state_dwell_time,
            30,
            600,
        );
        for entry in self.dwell_time_exception_states.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            match entry.parse::<u8>() {
                Ok(code) if FailoverState::from_code(code).is_some() => {}
                _ => errors.push(format!(
                    "DWELL_TIME_EXCEPTION_STATES entry `{entry}` is not a state code in 0..=6"
                )),
            }
        }
        for (name, value) in [
            ("GCP_API_TIMEOUT", self.gcp_api_timeout),
            ("GCP_BACKEND_HEALTH_TIMEOUT", self.gcp_backend_health_timeout),
            ("GCP_BGP_OPERATION_TIMEOUT", self.gcp_bgp_operation_timeout),
            ("CLOUDFLARE_API_TIMEOUT", self.cloudflare_api_timeout),
            ("CLOUDFLARE_BULK_TIMEOUT", self.cloudflare_bulk_timeout),
        ] {
            check_range(&mut errors, name, value, 5, 300);
        }
        for (name, value) in [
            (
                "CLOUDFLARE_PRIMARY_PRIORITY",
                self.cloudflare_primary_priority,
            ),
            (
                "CLOUDFLARE_SECONDARY_PRIORITY",
                self.cloudflare_secondary_priority,
            ),
        ] {
            check_range(&mut errors, name, u64::from(value), 1, 1000);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigValidationError::new(errors))
        }
    }
}

fn check_range(errors: &mut Vec<String>, name: &str, value: u64, min: u64, max: u64) {
    if value < min || value > max {
        errors.push(format!("{name} must be between {min} and {max}, got {value}"));
    }
}

fn parse_ip_prefix(value: &str) -> Result<(), String> {
    let (address, length) = value
        .trim()
        .split_once('/')
        .ok_or_else(|| "expected CIDR notation, e.g. 10.0.0.0/24".to_string())?;
    let address: IpAddr = address
        .parse()
        .map_err(|err| format!("bad address: {err}"))?;
    let length: u8 = length
        .parse()
        .map_err(|err| format!("bad prefix length: {err}"))?;
    let max_length = if address.is_ipv4() { 32 } else { 128 };
    if length > max_length {
        return Err(format!(
            "prefix length {length} exceeds maximum {max_length}"
        ));
    }
    Ok(())
}

#[derive(Debug, Error)]
#[error("configuration validation failed:\n{rendered}")]
pub struct ConfigValidationError {
    messages: Vec<String>,
    rendered: String,
}

impl ConfigValidationError {
    pub fn new(messages: Vec<String>) -> Self {
        let rendered = messages
            .iter()
            .map(|msg| format!("- {msg}"))
            .collect::<Vec<_>>()
            .join("\n");
        Self { messages, rendered }
    }

    pub fn messages(&self) -> &[String] {
        &self.messages
    }
}
