use crate::events::EventEmitter;
use crate::telemetry::runtime_counters;
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BreakerMode {
    Closed,
    Open,
}

#[derive(Debug)]
struct BreakerState {
    mode: BreakerMode,
    failures: u32,
    opened_at: Option<Instant>,
}

/// Fail-fast guard around one external service.
///
/// Starts closed. Consecutive failures open the circuit; while open, calls
/// are rejected until the timeout elapses, after which a single attempt is
/// admitted as a probe: success closes the circuit, failure keeps it open and
/// restarts the timeout. There is no separate half-open mode.
pub struct CircuitBreaker {
    service: String,
    threshold: u32,
    timeout: Duration,
    emitter: Option<EventEmitter>,
    state: Mutex<BreakerState>,
}

#[derive(Debug, Error)]
pub enum BreakerError<E: std::error::Error> {
    #[error("circuit breaker open, retry in {}s", retry_in.as_secs())]
    Open { retry_in: Duration },
    #[error(transparent)]
    Inner(E),
}

impl<E: std::error::Error> BreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, BreakerError::Open { .. })
    }
}

impl CircuitBreaker {
    pub fn new(service: impl Into<String>, threshold: u32, timeout: Duration) -> Self {
        Self {
            service: service.into(),
            threshold: threshold.max(1),
            timeout,
            emitter: None,
            state: Mutex::new(BreakerState {
                mode: BreakerMode::Closed,
                failures: 0,
                opened_at: None,
            }),
        }
    }

    pub fn with_emitter(mut self, emitter: EventEmitter) -> Self {
        self.emitter = Some(emitter);
        self
    }

    pub fn mode(&self) -> BreakerMode {
        self.state.lock().expect("breaker lock poisoned").mode
    }

    pub fn failure_count(&self) -> u32 {
        self.state.lock().expect("breaker lock poisoned").failures
    }

    /// Admits the call, or reports how long until the next probe is allowed.
    pub fn try_admit(&self, now: Instant) -> Result<(), Duration> {
        let guard = self.state.lock().expect("breaker lock poisoned");
        match guard.mode {
            BreakerMode::Closed => Ok(()),
            BreakerMode::Open => {
                let opened_at = guard.opened_at.unwrap_or(now);
                let elapsed = now.saturating_duration_since(opened_at);
                if elapsed >= self.timeout {
                    Ok(())
                } else {
                    Err(self.timeout - elapsed)
                }
            }
        }
    }

    pub fn record_success(&self) {
        let recovered = {
            let mut guard = self.state.lock().expect("breaker lock poisoned");
            let recovered = guard.mode == BreakerMode::Open;
            let previous_failures = guard.failures;
            guard.mode = BreakerMode::Closed;
            guard.failures = 0;
            guard.opened_at = None;
            recovered.then_some(previous_failures)
        };

        if let Some(failures) = recovered {
            info!(
                service = %self.service,
                failures,
                "circuit breaker closed, service recovered"
            );
            if let Some(emitter) = &self.emitter {
                emitter.emit_circuit_breaker(&self.service, "closed", failures, None);
            }
        }
    }

    pub fn record_failure(&self, now: Instant, error_message: &str) {
        let (opened, failures) = {
            let mut guard = self.state.lock().expect("breaker lock poisoned");
            guard.failures += 1;
            let opened = match guard.mode {
                BreakerMode::Closed if guard.failures >= self.threshold => {
                    guard.mode = BreakerMode::Open;
                    guard.opened_at = Some(now);
                    true
                }
                BreakerMode::Open => {
                    // Failed probe: restart the open interval.
                    guard.opened_at = Some(now);
                    false
                }
                BreakerMode::Closed => false,
            };
            (opened, guard.failures)
        };

        if opened {
            warn!(
                service = %self.service,
                failures,
                "circuit breaker opened"
            );
            runtime_counters().inc_breaker_opened();
            if let Some(emitter) = &self.emitter {
                emitter.emit_circuit_breaker(
                    &self.service,
                    "opened",
                    failures,
                    Some(error_message.to_string()),
                );
            }
        } else {
            debug!(
                service = %self.service,
                failures,
                threshold = self.threshold,
                "circuit breaker failure recorded"
            );
            if let Some(emitter) = &self.emitter {
                emitter.emit_circuit_breaker(
                    &self.service,
                    "failure_recorded",
                    failures,
                    Some(error_message.to_string()),
                );
            }
        }
    }

    /// Runs `op` under the breaker. Rejected calls never invoke `op`.
    pub async fn call<F, Fut, T, E>(&self, op: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + std::fmt::Display,
    {
        if let Err(retry_in) = self.try_admit(Instant::now()) {
            if let Some(emitter) = &self.emitter {
                emitter.emit_circuit_breaker(
                    &self.service,
                    "call_blocked",
                    self.failure_count(),
                    Some(format!("circuit breaker open, {}s remaining", retry_in.as_secs())),
                );
            }
            return Err(BreakerError::Open { retry_in });
        }

        match op().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                self.record_failure(Instant::now(), &err.to_string());
                Err(BreakerError::Inner(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::MonitorError;

    fn probe_failure() -> Result<(), MonitorError> {
        Err(MonitorError::from_status(503, "unavailable"))
    }

    #[tokio::test]
    async fn opens_after_threshold_and_blocks_without_invoking() {
        let breaker = CircuitBreaker::new("health", 5, Duration::from_secs(300));

        for _ in 0..5 {
            let result = breaker.call(|| async { probe_failure() }).await;
            assert!(matches!(result, Err(BreakerError::Inner(_))));
        }
        assert_eq!(breaker.mode(), BreakerMode::Open);

        let mut invoked = false;
        let result = breaker
            .call(|| {
                invoked = true;
                async { probe_failure() }
            })
            .await;
        assert!(matches!(result, Err(BreakerError::Open { .. })));
        assert!(!invoked, "blocked call must not reach the client");
    }

    #[tokio::test]
    async fn probe_after_timeout_closes_on_success() {
        let breaker = CircuitBreaker::new("health", 1, Duration::from_millis(20));
        breaker.record_failure(Instant::now(), "boom");
        assert_eq!(breaker.mode(), BreakerMode::Open);
        assert!(breaker.try_admit(Instant::now()).is_err());

        tokio::time::sleep(Duration::from_millis(30)).await;
        let result: Result<u32, BreakerError<MonitorError>> =
            breaker.call(|| async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(breaker.mode(), BreakerMode::Closed);
        assert_eq!(breaker.failure_count(), 0);
    }

    #[test]
    fn failed_probe_extends_open_interval() {
        let breaker = CircuitBreaker::new("health", 1, Duration::from_secs(10));
        let start = Instant::now();
        breaker.record_failure(start, "boom");

        let probe_time = start + Duration::from_secs(11);
        assert!(breaker.try_admit(probe_time).is_ok());
        breaker.record_failure(probe_time, "still down");

        // Open interval restarts from the failed probe, not the first failure.
        assert!(breaker.try_admit(probe_time + Duration::from_secs(9)).is_err());
        assert!(breaker.try_admit(probe_time + Duration::from_secs(10)).is_ok());
    }

    #[test]
    fn success_resets_failure_count() {
        let breaker = CircuitBreaker::new("health", 3, Duration::from_secs(10));
        breaker.record_failure(Instant::now(), "a");
        breaker.record_failure(Instant::now(), "b");
        assert_eq!(breaker.failure_count(), 2);

        breaker.record_success();
        assert_eq!(breaker.failure_count(), 0);
        assert_eq!(breaker.mode(), BreakerMode::Closed);
    }
}
