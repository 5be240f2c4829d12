use serde::Serialize;

/// Tri-valued health signal produced by the monitoring plane.
///
/// `Unknown` is distinct from both healthy and unhealthy: it means the
/// monitoring plane could not decide (transient API failure, unclassified
/// error code, breaker open). Unknown observations must never drive a
/// data-plane change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    Healthy,
    Unhealthy,
    Unknown,
}

impl Health {
    pub fn from_flag(healthy: bool) -> Self {
        if healthy {
            Health::Healthy
        } else {
            Health::Unhealthy
        }
    }

    /// Returns the boolean value for known observations, `None` for Unknown.
    pub fn as_flag(self) -> Option<bool> {
        match self {
            Health::Healthy => Some(true),
            Health::Unhealthy => Some(false),
            Health::Unknown => None,
        }
    }

    pub fn is_known(self) -> bool {
        !matches!(self, Health::Unknown)
    }

    pub fn is_healthy(self) -> bool {
        matches!(self, Health::Healthy)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Health::Healthy => "healthy",
            Health::Unhealthy => "unhealthy",
            Health::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for Health {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
