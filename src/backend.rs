use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

use crate::config::ServiceConfig;
use crate::error::{BackendFailure, ConfigError};
use crate::trace::TraceContext;

/// Immutable description of a single backend RPC attempt. A retry builds a
/// fresh descriptor; an existing one is never mutated.
#[derive(Clone, Debug)]
pub struct CallDescriptor {
    pub service: String,
    pub method: String,
    pub payload: Value,
    pub deadline: Duration,
    pub trace: TraceContext,
    pub idempotent: bool,
}

impl CallDescriptor {
    /// Fresh attempt of the same call: new deadline window, child span.
    pub fn retry_attempt(&self) -> Self {
        let mut attempt = self.clone();
        attempt.trace = self.trace.child();
        attempt
    }
}

/// The abstract backend RPC contract: a typed request message in, a typed
/// response message out, deadline and trace metadata attached. The engine
/// depends only on this seam; tests substitute it.
#[async_trait]
pub trait BackendTransport: Send + Sync {
    async fn call(&self, descriptor: &CallDescriptor) -> Result<Value, BackendFailure>;
}

struct ServiceStub {
    base_url: String,
}

/// Connection handling for every backend service: one shared keep-alive
/// HTTP client (connections are pooled across concurrent requests, never
/// per-request), plus the address of each service stub.
pub struct ClientPool {
    client: reqwest::Client,
    stubs: HashMap<String, ServiceStub>,
}

impl ClientPool {
    pub fn new(services: &HashMap<String, ServiceConfig>) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| ConfigError::HttpClient(e.to_string()))?;

        let stubs = services
            .iter()
            .map(|(name, service)| {
                (
                    name.clone(),
                    ServiceStub {
                        base_url: service.url.trim_end_matches('/').to_string(),
                    },
                )
            })
            .collect();

        Ok(ClientPool { client, stubs })
    }
}

#[async_trait]
impl BackendTransport for ClientPool {
    async fn call(&self, descriptor: &CallDescriptor) -> Result<Value, BackendFailure> {
        let stub = self.stubs.get(&descriptor.service).ok_or_else(|| {
            BackendFailure::Unavailable(format!("unknown service '{}'", descriptor.service))
        })?;

        let url = format!("{}/{}", stub.base_url, descriptor.method);

        let response = self
            .client
            .post(&url)
            .header("content-type", "application/json")
            .header(
                "x-deadline-ms",
                descriptor.deadline.as_millis().to_string(),
            )
            .header("traceparent", descriptor.trace.traceparent())
            .json(&descriptor.payload)
            .send()
            .await
            .map_err(|e| {
                // Connection-level failures count toward the circuit breaker.
                BackendFailure::Unavailable(format!("{}: {e}", descriptor.service))
            })?;

        let status = response.status();
        if status.is_success() {
            return response.json::<Value>().await.map_err(|e| {
                BackendFailure::Malformed(format!("{}.{}: {e}", descriptor.service, descriptor.method))
            });
        }

        let body: Value = response.json().await.unwrap_or(Value::Null);
        let message = body
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("{} returned HTTP {status}", descriptor.service));

        if status == reqwest::StatusCode::SERVICE_UNAVAILABLE {
            Err(BackendFailure::Unavailable(message))
        } else {
            Err(BackendFailure::Backend(message))
        }
    }
}
