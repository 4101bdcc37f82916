use std::sync::Arc;
use std::time::Duration;

use crate::auth::AuthGuard;
use crate::config::{GatewayConfig, OperationScopes};
use crate::error::{ErrorCode, GraphQLError};
use crate::executor::Executor;
use crate::plan::{OperationKind, build_plan};
use crate::resilience::ResilientBackend;
use crate::schema::Schema;
use crate::trace::TraceContext;
use crate::{GraphQLRequest, GraphQLResponse};

/// The request pipeline: authenticate, validate and plan, gate the root
/// operation, execute, envelope. One instance is shared across connections.
pub struct Gateway {
    schema: Schema,
    auth: Arc<AuthGuard>,
    executor: Executor,
    operation_scopes: OperationScopes,
    request_deadline: Duration,
}

impl Gateway {
    pub fn new(
        schema: Schema,
        auth: Arc<AuthGuard>,
        backend: Arc<ResilientBackend>,
        config: &GatewayConfig,
    ) -> Self {
        Gateway {
            schema,
            auth,
            executor: Executor::new(backend, &config.services),
            operation_scopes: config.operation_scopes.clone(),
            request_deadline: Duration::from_millis(config.request_deadline_ms),
        }
    }

    /// Handles one GraphQL request end to end. Every failure mode comes back
    /// as a well-formed `{data, errors}` envelope; the transport layer always
    /// answers 200 for requests that reach this point.
    pub async fn process_request(
        &self,
        request: GraphQLRequest,
        bearer: Option<&str>,
        traceparent: Option<&str>,
    ) -> GraphQLResponse {
        let trace = TraceContext::continue_or_start(traceparent);
        tracing::debug!(
            trace_id = %trace.trace_id,
            operation = request.operation_name.as_deref().unwrap_or("<anonymous>"),
            "processing request"
        );

        // A presented-but-invalid credential fails the whole request. An
        // absent one yields an anonymous context; field checks decide later.
        let auth = match self.auth.authenticate(bearer) {
            Ok(auth) => auth,
            Err(error) => {
                return GraphQLResponse::failure(vec![GraphQLError::request_level(
                    error.code(),
                    error.to_string(),
                )]);
            }
        };

        let plan = match build_plan(
            &self.schema,
            &request.query,
            request.variables.as_ref(),
            request.operation_name.as_deref(),
        ) {
            Ok(plan) => plan,
            Err(errors) => return GraphQLResponse::failure(errors),
        };

        // Root-operation gate, before any backend is contacted.
        let root_scope = match plan.operation {
            OperationKind::Query => self.operation_scopes.query.as_deref(),
            OperationKind::Mutation => self.operation_scopes.mutation.as_deref(),
        };
        if let Err(error) = auth.check_root(root_scope) {
            return GraphQLResponse::failure(vec![GraphQLError::request_level(
                error.code(),
                error.to_string(),
            )]);
        }

        match tokio::time::timeout(
            self.request_deadline,
            self.executor.execute(&plan, &auth, &trace),
        )
        .await
        {
            Ok((data, errors)) => GraphQLResponse::new(data, errors),
            Err(_) => {
                tracing::warn!(
                    trace_id = %trace.trace_id,
                    deadline_ms = self.request_deadline.as_millis() as u64,
                    "request deadline exceeded, cancelling in-flight branches"
                );
                GraphQLResponse::failure(vec![GraphQLError::request_level(
                    ErrorCode::Timeout,
                    "request deadline exceeded",
                )])
            }
        }
    }
}
