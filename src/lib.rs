pub mod auth;
pub mod backend;
pub mod config;
pub mod error;
pub mod executor;
pub mod gateway;
pub mod plan;
pub mod resilience;
pub mod schema;
pub mod trace;

pub use auth::{AuthContext, AuthGuard};
pub use backend::{BackendTransport, ClientPool};
pub use config::GatewayConfig;
pub use gateway::Gateway;
pub use schema::Schema;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::GraphQLError;

/// The `POST /graphql` request body.
#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct GraphQLRequest {
    pub query: String,
    #[serde(default)]
    pub variables: Option<Value>,
    #[serde(default)]
    pub operation_name: Option<String>,
}

/// The unified `{data, errors}` response envelope.
#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct GraphQLResponse {
    pub data: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<GraphQLError>,
}

impl GraphQLResponse {
    pub fn new(data: Value, errors: Vec<GraphQLError>) -> Self {
        GraphQLResponse { data, errors }
    }

    /// All-or-nothing failure: no data, a single error list.
    pub fn failure(errors: Vec<GraphQLError>) -> Self {
        GraphQLResponse {
            data: Value::Null,
            errors,
        }
    }
}
