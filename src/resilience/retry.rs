use crate::monitor::MonitorError;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Exponential backoff parameters for one service category.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    max_retries: u32,
    initial: Duration,
    max: Duration,
    factor: f64,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, initial: Duration, max: Duration) -> Self {
        Self {
            max_retries,
            initial,
            max: max.max(initial),
            factor: 2.0,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Base delay before the retry following `attempt` (0-based), capped at
    /// the configured maximum.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let scaled = self.initial.as_secs_f64() * self.factor.powi(attempt as i32);
        Duration::from_secs_f64(scaled.min(self.max.as_secs_f64()))
    }

    /// Adds uniform jitter in [0, delay/2] so synchronized clients spread out.
    pub fn jittered(&self, delay: Duration) -> Duration {
        let half = delay.as_secs_f64() / 2.0;
        if half <= 0.0 {
            return delay;
        }
        let mut rng = rand::thread_rng();
        delay + Duration::from_secs_f64(rng.gen::<f64>() * half)
    }
}

/// Retries `op` on transient failures with exponential backoff.
///
/// Permanent and unclassified errors terminate immediately; on exhaustion the
/// last error is surfaced.
pub async fn retry_with_backoff<F, Fut, T>(
    policy: &RetryPolicy,
    operation: &str,
    mut op: F,
) -> Result<T, MonitorError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, MonitorError>>,
{
    let attempts = policy.max_retries + 1;
    let mut last_error = None;

    for attempt in 0..attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if !err.is_retryable() => {
                debug!(operation, attempt, error = %err, "non-retryable failure");
                return Err(err);
            }
            Err(err) => {
                if attempt + 1 == attempts {
                    warn!(
                        operation,
                        attempts,
                        error = %err,
                        "all retry attempts exhausted"
                    );
                    return Err(err);
                }
                let delay = policy.jittered(policy.delay_for(attempt));
                debug!(
                    operation,
                    attempt = attempt + 1,
                    attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient failure, backing off"
                );
                last_error = Some(err);
                tokio::time::sleep(delay).await;
            }
        }
    }

    // Unreachable: the loop always returns on the final attempt.
    Err(last_error.unwrap_or(MonitorError::Timeout))
}
