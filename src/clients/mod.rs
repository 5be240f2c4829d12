pub mod compute;
pub mod transit;

pub use compute::ComputeRouteClient;
pub use transit::TransitApiClient;

use crate::monitor::MonitorError;

/// Folds a reqwest transport failure into the monitor error taxonomy.
/// Timeouts are their own class so probes can report them distinctly.
pub(crate) fn transport_error(err: reqwest::Error, operation: &str) -> MonitorError {
    if err.is_timeout() {
        MonitorError::Timeout
    } else {
        MonitorError::transport(format!("{operation}: {err}"))
    }
}
