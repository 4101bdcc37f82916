use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::time::Instant;

use crate::backend::{BackendTransport, CallDescriptor};
use crate::config::{CircuitBreakerConfig, ServiceConfig};
use crate::error::BackendFailure;

/// Circuit state for one (service, method) pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: CircuitState,
    /// Rolling window of call outcomes, `true` = success.
    window: VecDeque<bool>,
    opened_at: Option<Instant>,
    half_open_in_flight: u32,
}

impl CircuitBreaker {
    fn new(config: CircuitBreakerConfig) -> Self {
        CircuitBreaker {
            config,
            state: CircuitState::Closed,
            window: VecDeque::new(),
            opened_at: None,
            half_open_in_flight: 0,
        }
    }

    /// Admission decision. Runs as a single read-modify-write under the
    /// circuit table lock so concurrent callers cannot lose a transition.
    fn try_acquire(&mut self, now: Instant) -> Result<(), ()> {
        match self.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let cooled_down = self
                    .opened_at
                    .map(|at| now.duration_since(at).as_millis() as u64 >= self.config.cooldown_ms)
                    .unwrap_or(true);
                if !cooled_down {
                    return Err(());
                }
                self.state = CircuitState::HalfOpen;
                self.half_open_in_flight = 1;
                Ok(())
            }
            CircuitState::HalfOpen => {
                if self.half_open_in_flight < self.config.half_open_probes {
                    self.half_open_in_flight += 1;
                    Ok(())
                } else {
                    Err(())
                }
            }
        }
    }

    fn record(&mut self, success: bool, now: Instant) {
        match self.state {
            CircuitState::HalfOpen => {
                self.half_open_in_flight = self.half_open_in_flight.saturating_sub(1);
                if success {
                    self.state = CircuitState::Closed;
                    self.window.clear();
                    self.opened_at = None;
                } else {
                    self.state = CircuitState::Open;
                    self.opened_at = Some(now);
                }
            }
            CircuitState::Closed => {
                self.window.push_back(success);
                while self.window.len() > self.config.window {
                    self.window.pop_front();
                }
                if self.should_trip() {
                    self.state = CircuitState::Open;
                    self.opened_at = Some(now);
                }
            }
            // A drained call finishing after the circuit tripped; its
            // outcome is discarded.
            CircuitState::Open => {}
        }
    }

    fn should_trip(&self) -> bool {
        if self.window.len() < self.config.min_samples {
            return false;
        }
        let failures = self.window.iter().filter(|ok| !**ok).count();
        failures as f64 / self.window.len() as f64 > self.config.failure_ratio
    }
}

/// Wraps every backend call with a deadline, a per-(service, method)
/// circuit breaker, and an optional single retry for idempotent calls.
///
/// The circuit table is shared across all concurrent requests; every state
/// transition happens under one mutex acquisition.
pub struct ResilientBackend {
    transport: Arc<dyn BackendTransport>,
    circuits: Mutex<HashMap<(String, String), CircuitBreaker>>,
    services: HashMap<String, ServiceConfig>,
}

impl ResilientBackend {
    pub fn new(transport: Arc<dyn BackendTransport>, services: HashMap<String, ServiceConfig>) -> Self {
        ResilientBackend {
            transport,
            circuits: Mutex::new(HashMap::new()),
            services,
        }
    }

    /// Executes one logical backend call. Idempotent calls on services with
    /// `retry_reads` get at most one extra attempt, and only for transient
    /// failures; mutating calls are never auto-retried. That last rule is an
    /// invariant, not configuration: a retried mutation could double-apply.
    pub async fn invoke(&self, descriptor: &CallDescriptor) -> Result<Value, BackendFailure> {
        let retry_allowed = descriptor.idempotent
            && self
                .services
                .get(&descriptor.service)
                .map(|s| s.retry_reads)
                .unwrap_or(false);

        match self.attempt(descriptor).await {
            Err(failure) if retry_allowed && failure.is_transient() => {
                tracing::debug!(
                    service = %descriptor.service,
                    method = %descriptor.method,
                    failure = %failure,
                    "retrying idempotent call"
                );
                self.attempt(&descriptor.retry_attempt()).await
            }
            outcome => outcome,
        }
    }

    /// Current state snapshot, for tests and the metrics surface.
    pub fn circuit_state(&self, service: &str, method: &str) -> CircuitState {
        let circuits = self
            .circuits
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        circuits
            .get(&(service.to_string(), method.to_string()))
            .map(|c| c.state)
            .unwrap_or(CircuitState::Closed)
    }

    async fn attempt(&self, descriptor: &CallDescriptor) -> Result<Value, BackendFailure> {
        self.acquire(descriptor)?;

        let outcome =
            match tokio::time::timeout(descriptor.deadline, self.transport.call(descriptor)).await {
                Ok(result) => result,
                Err(_) => Err(BackendFailure::Timeout(
                    descriptor.deadline.as_millis() as u64
                )),
            };

        // Well-formed backend errors are responses, not infrastructure
        // failures; only timeouts, transport faults, and malformed replies
        // count against the circuit.
        let infrastructure_ok = match &outcome {
            Ok(_) | Err(BackendFailure::Backend(_)) => true,
            Err(_) => false,
        };
        self.record(descriptor, infrastructure_ok);

        outcome
    }

    fn acquire(&self, descriptor: &CallDescriptor) -> Result<(), BackendFailure> {
        let now = Instant::now();
        let mut circuits = self
            .circuits
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let breaker = circuits
            .entry((descriptor.service.clone(), descriptor.method.clone()))
            .or_insert_with(|| CircuitBreaker::new(self.breaker_config(&descriptor.service)));

        let before = breaker.state;
        let admitted = breaker.try_acquire(now);
        let after = breaker.state;
        drop(circuits);

        if before != after {
            tracing::warn!(
                service = %descriptor.service,
                method = %descriptor.method,
                from = ?before,
                to = ?after,
                "circuit transition"
            );
        }

        admitted.map_err(|_| BackendFailure::CircuitOpen {
            service: descriptor.service.clone(),
            method: descriptor.method.clone(),
        })
    }

    fn record(&self, descriptor: &CallDescriptor, success: bool) {
        let now = Instant::now();
        let mut circuits = self
            .circuits
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(breaker) = circuits.get_mut(&(
            descriptor.service.clone(),
            descriptor.method.clone(),
        )) else {
            return;
        };

        let before = breaker.state;
        breaker.record(success, now);
        let after = breaker.state;
        drop(circuits);

        if before != after {
            tracing::warn!(
                service = %descriptor.service,
                method = %descriptor.method,
                from = ?before,
                to = ?after,
                "circuit transition"
            );
        }
    }

    fn breaker_config(&self, service: &str) -> CircuitBreakerConfig {
        self.services
            .get(service)
            .map(|s| s.circuit_breaker.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::TraceContext;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Scripted transport: fails the first `fail_first` calls, succeeds
    /// afterwards, and counts how often the backend was actually contacted.
    struct ScriptedTransport {
        calls: AtomicUsize,
        fail_first: usize,
        failure: BackendFailure,
        hang: bool,
    }

    impl ScriptedTransport {
        fn failing(fail_first: usize, failure: BackendFailure) -> Self {
            ScriptedTransport {
                calls: AtomicUsize::new(0),
                fail_first,
                failure,
                hang: false,
            }
        }

        fn hanging() -> Self {
            ScriptedTransport {
                calls: AtomicUsize::new(0),
                fail_first: 0,
                failure: BackendFailure::Unavailable("unused".into()),
                hang: true,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl BackendTransport for ScriptedTransport {
        async fn call(&self, _descriptor: &CallDescriptor) -> Result<Value, BackendFailure> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.hang {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            if n < self.fail_first {
                Err(self.failure.clone())
            } else {
                Ok(json!({"ok": true}))
            }
        }
    }

    fn descriptor(idempotent: bool) -> CallDescriptor {
        CallDescriptor {
            service: "inventory".to_string(),
            method: "GetStock".to_string(),
            payload: json!({"productId": "P1"}),
            deadline: Duration::from_millis(800),
            trace: TraceContext::new(),
            idempotent,
        }
    }

    fn service_config(retry_reads: bool, breaker: CircuitBreakerConfig) -> HashMap<String, ServiceConfig> {
        let mut services = HashMap::new();
        services.insert(
            "inventory".to_string(),
            ServiceConfig {
                url: "http://unused".to_string(),
                deadline_ms: 800,
                retry_reads,
                circuit_breaker: breaker,
            },
        );
        services
    }

    fn tight_breaker() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_ratio: 0.5,
            min_samples: 4,
            window: 8,
            cooldown_ms: 5_000,
            half_open_probes: 1,
        }
    }

    #[tokio::test]
    async fn success_passes_through() {
        let transport = Arc::new(ScriptedTransport::failing(0, BackendFailure::Unavailable("x".into())));
        let backend = ResilientBackend::new(transport.clone(), service_config(false, tight_breaker()));

        let value = backend.invoke(&descriptor(true)).await.unwrap();
        assert_eq!(value, json!({"ok": true}));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_overrun_yields_timeout() {
        let transport = Arc::new(ScriptedTransport::hanging());
        let backend = ResilientBackend::new(transport, service_config(false, tight_breaker()));

        let result = backend.invoke(&descriptor(false)).await;
        assert_eq!(result, Err(BackendFailure::Timeout(800)));
    }

    #[tokio::test]
    async fn idempotent_call_retries_once_on_transient_failure() {
        let transport = Arc::new(ScriptedTransport::failing(
            1,
            BackendFailure::Unavailable("connection refused".into()),
        ));
        let backend = ResilientBackend::new(transport.clone(), service_config(true, tight_breaker()));

        let value = backend.invoke(&descriptor(true)).await.unwrap();
        assert_eq!(value, json!({"ok": true}));
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn mutating_call_is_never_retried() {
        let transport = Arc::new(ScriptedTransport::failing(
            1,
            BackendFailure::Unavailable("connection refused".into()),
        ));
        let backend = ResilientBackend::new(transport.clone(), service_config(true, tight_breaker()));

        let result = backend.invoke(&descriptor(false)).await;
        assert!(matches!(result, Err(BackendFailure::Unavailable(_))));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn backend_error_is_not_retried() {
        let transport = Arc::new(ScriptedTransport::failing(
            1,
            BackendFailure::Backend("no such product".into()),
        ));
        let backend = ResilientBackend::new(transport.clone(), service_config(true, tight_breaker()));

        let result = backend.invoke(&descriptor(true)).await;
        assert!(matches!(result, Err(BackendFailure::Backend(_))));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn breaker_opens_probes_and_recloses() {
        let transport = Arc::new(ScriptedTransport::failing(
            4,
            BackendFailure::Unavailable("connection refused".into()),
        ));
        let backend = ResilientBackend::new(transport.clone(), service_config(false, tight_breaker()));
        let call = descriptor(true);

        // Fill the window with failures up to the threshold.
        for _ in 0..4 {
            let _ = backend.invoke(&call).await;
        }
        assert_eq!(backend.circuit_state("inventory", "GetStock"), CircuitState::Open);
        assert_eq!(transport.calls(), 4);

        // Open circuit rejects without contacting the backend.
        let result = backend.invoke(&call).await;
        assert!(matches!(result, Err(BackendFailure::CircuitOpen { .. })));
        assert_eq!(transport.calls(), 4);

        // After the cooldown a single probe is admitted; it succeeds and the
        // circuit closes again.
        tokio::time::advance(Duration::from_millis(5_001)).await;
        let value = backend.invoke(&call).await.unwrap();
        assert_eq!(value, json!({"ok": true}));
        assert_eq!(transport.calls(), 5);
        assert_eq!(backend.circuit_state("inventory", "GetStock"), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_probe_reopens_the_circuit() {
        let transport = Arc::new(ScriptedTransport::failing(
            8,
            BackendFailure::Unavailable("connection refused".into()),
        ));
        let backend = ResilientBackend::new(transport.clone(), service_config(false, tight_breaker()));
        let call = descriptor(true);

        for _ in 0..4 {
            let _ = backend.invoke(&call).await;
        }
        assert_eq!(backend.circuit_state("inventory", "GetStock"), CircuitState::Open);

        tokio::time::advance(Duration::from_millis(5_001)).await;
        let result = backend.invoke(&call).await;
        assert!(matches!(result, Err(BackendFailure::Unavailable(_))));
        assert_eq!(backend.circuit_state("inventory", "GetStock"), CircuitState::Open);

        // Still rejecting during the fresh cooldown.
        let result = backend.invoke(&call).await;
        assert!(matches!(result, Err(BackendFailure::CircuitOpen { .. })));
    }

    #[tokio::test]
    async fn well_formed_backend_errors_do_not_trip_the_breaker() {
        let transport = Arc::new(ScriptedTransport::failing(
            8,
            BackendFailure::Backend("no such product".into()),
        ));
        let backend = ResilientBackend::new(transport.clone(), service_config(false, tight_breaker()));
        let call = descriptor(true);

        for _ in 0..8 {
            let _ = backend.invoke(&call).await;
        }
        assert_eq!(backend.circuit_state("inventory", "GetStock"), CircuitState::Closed);
        assert_eq!(transport.calls(), 8);
    }
}
