use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::{fs, net::Ipv4Addr};

use crate::error::ConfigError;

// Default tuning values, overridable per entry in the config file.
const DEFAULT_PORT: u16 = 4000;
const DEFAULT_REQUEST_DEADLINE_MS: u64 = 10_000;
const DEFAULT_CALL_DEADLINE_MS: u64 = 800;
const DEFAULT_FAILURE_RATIO: f64 = 0.5;
const DEFAULT_MIN_SAMPLES: usize = 10;
const DEFAULT_WINDOW: usize = 32;
const DEFAULT_COOLDOWN_MS: u64 = 5_000;
const DEFAULT_HALF_OPEN_PROBES: u32 = 1;
const DEFAULT_JWT_LEEWAY_SECS: u64 = 30;

/// Top-level gateway configuration, loaded once at startup from YAML.
#[derive(Debug, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// Whole-request deadline; in-flight plan branches are cancelled when it
    /// elapses.
    #[serde(default = "default_request_deadline")]
    pub request_deadline_ms: u64,

    /// SDL file describing the client-facing graph, relative to this config
    /// file.
    pub schema_file: PathBuf,

    pub auth: AuthConfig,

    /// Scope required to run a root operation at all, checked before plan
    /// construction. Field-level scopes in the bindings may be stricter.
    #[serde(default)]
    pub operation_scopes: OperationScopes,

    pub services: HashMap<String, ServiceConfig>,

    /// Resolver bindings keyed by `Type.field`.
    pub bindings: HashMap<String, BindingConfig>,

    /// Directory the config file was loaded from; used to resolve relative
    /// paths. Not part of the file itself.
    #[serde(skip)]
    base_dir: PathBuf,
}

fn default_listen() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT))
}

fn default_request_deadline() -> u64 {
    DEFAULT_REQUEST_DEADLINE_MS
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct OperationScopes {
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub mutation: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    pub issuer: String,

    /// RS256 public key PEM, relative to the config file. The production
    /// deployment points this at the identity provider's published key.
    #[serde(default)]
    pub public_key_file: Option<PathBuf>,

    /// HS256 shared secret, for development and tests.
    #[serde(default)]
    pub hs256_secret: Option<String>,

    #[serde(default = "default_leeway")]
    pub leeway_secs: u64,
}

fn default_leeway() -> u64 {
    DEFAULT_JWT_LEEWAY_SECS
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    pub url: String,

    /// Per-call deadline propagated to the backend.
    #[serde(default = "default_call_deadline")]
    pub deadline_ms: u64,

    /// Allow one retry of idempotent calls on timeout or transport failure.
    #[serde(default)]
    pub retry_reads: bool,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
}

fn default_call_deadline() -> u64 {
    DEFAULT_CALL_DEADLINE_MS
}

#[derive(Debug, Deserialize, Clone)]
pub struct CircuitBreakerConfig {
    /// Failure ratio over the rolling window that trips the breaker.
    #[serde(default = "default_failure_ratio")]
    pub failure_ratio: f64,

    /// Outcomes required in the window before the ratio is considered.
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,

    /// Rolling window size, in call outcomes.
    #[serde(default = "default_window")]
    pub window: usize,

    /// How long an open circuit rejects calls before probing.
    #[serde(default = "default_cooldown")]
    pub cooldown_ms: u64,

    /// Probe calls allowed through while half-open.
    #[serde(default = "default_probes")]
    pub half_open_probes: u32,
}

fn default_failure_ratio() -> f64 {
    DEFAULT_FAILURE_RATIO
}

fn default_min_samples() -> usize {
    DEFAULT_MIN_SAMPLES
}

fn default_window() -> usize {
    DEFAULT_WINDOW
}

fn default_cooldown() -> u64 {
    DEFAULT_COOLDOWN_MS
}

fn default_probes() -> u32 {
    DEFAULT_HALF_OPEN_PROBES
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        CircuitBreakerConfig {
            failure_ratio: DEFAULT_FAILURE_RATIO,
            min_samples: DEFAULT_MIN_SAMPLES,
            window: DEFAULT_WINDOW,
            cooldown_ms: DEFAULT_COOLDOWN_MS,
            half_open_probes: DEFAULT_HALF_OPEN_PROBES,
        }
    }
}

/// Resolvers that read request state instead of calling a backend.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LocalResolver {
    /// Projects the authenticated subject (`Query.me`).
    CurrentUser,
}

/// How one graph field maps onto a backend call. Validated against the SDL
/// and the service table at startup; see `schema::Schema::build`.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct BindingConfig {
    #[serde(default)]
    pub resolver: Option<LocalResolver>,

    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub method: Option<String>,

    /// Batch variant of `method`, taking `{"keys": [...]}` and returning
    /// `{"items": [{"key", "value"}]}`. Enables per-plan coalescing.
    #[serde(default)]
    pub batch_method: Option<String>,

    /// GraphQL argument whose value is the call key.
    #[serde(default)]
    pub key_arg: Option<String>,

    /// Parent payload field whose value is the call key (nested fields).
    #[serde(default)]
    pub parent_key: Option<String>,

    /// Request message field the key is written to. Defaults to `key_arg`
    /// or `parent_key`.
    #[serde(default)]
    pub key_field: Option<String>,

    /// Request message field populated with the authenticated subject.
    #[serde(default)]
    pub subject_field: Option<String>,

    /// Project a single field of the response message as the field value.
    #[serde(default)]
    pub response_field: Option<String>,

    /// Scope required to resolve this field.
    #[serde(default)]
    pub scope: Option<String>,

    /// Require an authenticated (non-anonymous) subject.
    #[serde(default)]
    pub authenticated: bool,

    /// Marks the call side-effect free; only idempotent calls are ever
    /// retried.
    #[serde(default)]
    pub idempotent: bool,

    /// Static degraded value used instead of an error when the call fails
    /// with a timeout, open circuit, or transport failure.
    #[serde(default)]
    pub fallback: Option<Value>,
}

impl GatewayConfig {
    pub fn load(path: &Path) -> Result<GatewayConfig, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        let mut config: GatewayConfig = serde_yaml::from_str(&contents)?;
        config.base_dir = path.parent().unwrap_or_else(|| Path::new("")).to_path_buf();
        Ok(config)
    }

    pub fn from_yaml(contents: &str, base_dir: &Path) -> Result<GatewayConfig, ConfigError> {
        let mut config: GatewayConfig = serde_yaml::from_str(contents)?;
        config.base_dir = base_dir.to_path_buf();
        Ok(config)
    }

    /// Reads the SDL named by `schema_file`, resolved against the config
    /// file's directory.
    pub fn read_sdl(&self) -> Result<String, ConfigError> {
        let full_path = self.base_dir.join(&self.schema_file);
        fs::read_to_string(&full_path).map_err(|e| ConfigError::Io {
            path: full_path.display().to_string(),
            source: e,
        })
    }

    pub fn resolve_path(&self, relative: &Path) -> PathBuf {
        self.base_dir.join(relative)
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }
}
