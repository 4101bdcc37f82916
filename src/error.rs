use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Machine-readable error codes surfaced to the client under
/// `errors[].extensions.code`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    ValidationError,
    Unauthenticated,
    Unauthorized,
    Timeout,
    CircuitOpen,
    Unavailable,
    BackendError,
    InternalError,
}

/// Path from the response root to a field, mixing field names and list
/// indices, e.g. `["products", "products", 2, "stockLevel"]`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResponsePath(Vec<Value>);

impl ResponsePath {
    pub fn root() -> Self {
        ResponsePath(Vec::new())
    }

    pub fn field(&self, name: &str) -> Self {
        let mut segments = self.0.clone();
        segments.push(Value::String(name.to_string()));
        ResponsePath(segments)
    }

    pub fn index(&self, i: usize) -> Self {
        let mut segments = self.0.clone();
        segments.push(Value::from(i));
        ResponsePath(segments)
    }

    pub fn segments(&self) -> &[Value] {
        &self.0
    }
}

/// A single entry of the response's `errors` list.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GraphQLError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub path: Vec<Value>,
    #[serde(default)]
    pub extensions: Map<String, Value>,
}

impl GraphQLError {
    pub fn new(code: ErrorCode, message: impl Into<String>, path: &ResponsePath) -> Self {
        let mut extensions = Map::new();
        extensions.insert(
            "code".to_string(),
            serde_json::to_value(code).unwrap_or(Value::Null),
        );
        GraphQLError {
            message: message.into(),
            path: path.segments().to_vec(),
            extensions,
        }
    }

    /// Error without a field path (validation and whole-request failures).
    pub fn request_level(code: ErrorCode, message: impl Into<String>) -> Self {
        GraphQLError::new(code, message, &ResponsePath::root())
    }
}

/// Failure of one backend call, before it has been attributed to a field.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum BackendFailure {
    #[error("backend call exceeded its {0}ms deadline")]
    Timeout(u64),

    #[error("circuit open for {service}.{method}")]
    CircuitOpen { service: String, method: String },

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("backend returned an error: {0}")]
    Backend(String),

    #[error("backend response was malformed: {0}")]
    Malformed(String),
}

impl BackendFailure {
    pub fn code(&self) -> ErrorCode {
        match self {
            BackendFailure::Timeout(_) => ErrorCode::Timeout,
            BackendFailure::CircuitOpen { .. } => ErrorCode::CircuitOpen,
            BackendFailure::Unavailable(_) => ErrorCode::Unavailable,
            BackendFailure::Backend(_) | BackendFailure::Malformed(_) => ErrorCode::BackendError,
        }
    }

    /// Timeouts and transport failures are the only outcomes a fresh attempt
    /// could change; backend-level errors are deterministic.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BackendFailure::Timeout(_) | BackendFailure::Unavailable(_)
        )
    }
}

/// Authentication failures. The underlying reason stays in the server log;
/// the client only sees the variant.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum AuthError {
    #[error("invalid or expired credential")]
    Unauthenticated,

    #[error("missing required scope '{0}'")]
    Unauthorized(String),
}

impl AuthError {
    pub fn code(&self) -> ErrorCode {
        match self {
            AuthError::Unauthenticated => ErrorCode::Unauthenticated,
            AuthError::Unauthorized(_) => ErrorCode::Unauthorized,
        }
    }
}

/// A failure recorded against one resolution node. Converted into a
/// `GraphQLError` when the response is assembled.
#[derive(Clone, Debug, PartialEq)]
pub struct FieldError {
    pub code: ErrorCode,
    pub message: String,
    pub path: ResponsePath,
}

impl FieldError {
    pub fn new(code: ErrorCode, message: impl Into<String>, path: ResponsePath) -> Self {
        FieldError {
            code,
            message: message.into(),
            path,
        }
    }

    pub fn from_backend(failure: &BackendFailure, path: ResponsePath) -> Self {
        FieldError::new(failure.code(), failure.to_string(), path)
    }

    pub fn to_graphql_error(&self) -> GraphQLError {
        GraphQLError::new(self.code, self.message.clone(), &self.path)
    }
}

/// Faults that abort the whole request before (or outside) plan execution.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("query validation failed")]
    Validation(Vec<GraphQLError>),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("request deadline exceeded")]
    DeadlineExceeded,

    /// Detail is logged server-side and never leaked to the client.
    #[error("internal error")]
    Internal(String),
}

/// Startup-time configuration and schema problems.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("failed to parse schema: {0}")]
    SchemaParse(String),

    #[error("invalid resolver binding for {field}: {reason}")]
    Binding { field: String, reason: String },

    #[error("invalid auth configuration: {0}")]
    Auth(String),

    #[error("failed to build http client: {0}")]
    HttpClient(String),
}
