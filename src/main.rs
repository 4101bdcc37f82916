use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use clap::Parser;
use http_body_util::{BodyExt, Full, combinators::BoxBody};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use serendib_gateway::error::{ErrorCode, GraphQLError};
use serendib_gateway::resilience::ResilientBackend;
use serendib_gateway::{
    AuthGuard, ClientPool, Gateway, GatewayConfig, GraphQLRequest, GraphQLResponse, Schema,
};

#[derive(Parser, Debug)]
#[command(name = "serendib-gateway", about = "GraphQL BFF gateway for the SerendibMall services")]
struct Args {
    /// Path to the gateway configuration file.
    #[arg(short, long, default_value = "config/gateway.yaml")]
    config: PathBuf,
}

fn full<T: Into<Bytes>>(value: T) -> BoxBody<Bytes, hyper::Error> {
    Full::new(value.into())
        .map_err(|never| match never {})
        .boxed()
}

fn json_response(status: StatusCode, body: String) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("Access-Control-Allow-Origin", "*")
        .body(full(body))
        .unwrap_or_else(|_| internal_server_error())
}

fn internal_server_error() -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(StatusCode::INTERNAL_SERVER_ERROR)
        .body(full("Internal Server Error"))
        .unwrap()
}

fn header_value<'r>(req: &'r Request<Incoming>, name: &str) -> Option<&'r str> {
    req.headers().get(name).and_then(|v| v.to_str().ok())
}

/// The credential from the `Authorization` header, without the scheme.
fn extract_bearer(req: &Request<Incoming>) -> Option<String> {
    header_value(req, "authorization")
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
}

async fn handle_request(
    req: Request<Incoming>,
    gateway: Arc<Gateway>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, Infallible> {
    let result = match (req.method(), req.uri().path()) {
        (&Method::POST, "/graphql") => {
            let bearer = extract_bearer(&req);
            let traceparent = header_value(&req, "traceparent").map(str::to_string);

            let body_bytes = match req.collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(_) => {
                    return Ok(Response::builder()
                        .status(StatusCode::BAD_REQUEST)
                        .body(full("Failed to read request body"))
                        .unwrap_or_else(|_| internal_server_error()));
                }
            };

            match serde_json::from_slice::<GraphQLRequest>(&body_bytes) {
                Ok(graphql_req) => {
                    let response = gateway
                        .process_request(graphql_req, bearer.as_deref(), traceparent.as_deref())
                        .await;
                    let json = serde_json::to_string(&response).unwrap_or_default();
                    json_response(StatusCode::OK, json)
                }
                Err(e) => {
                    let envelope = GraphQLResponse::failure(vec![GraphQLError::request_level(
                        ErrorCode::ValidationError,
                        format!("invalid request body: {e}"),
                    )]);
                    let json = serde_json::to_string(&envelope).unwrap_or_default();
                    json_response(StatusCode::BAD_REQUEST, json)
                }
            }
        }

        (&Method::GET, "/health") => json_response(StatusCode::OK, r#"{"status":"UP"}"#.to_string()),

        (&Method::OPTIONS, _) => Response::builder()
            .header("Access-Control-Allow-Origin", "*")
            .header("Access-Control-Allow-Methods", "GET, POST, OPTIONS")
            .header(
                "Access-Control-Allow-Headers",
                "Content-Type, Authorization, traceparent",
            )
            .body(full(""))
            .unwrap_or_else(|_| internal_server_error()),

        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .header("Access-Control-Allow-Origin", "*")
            .body(full("Not Found"))
            .unwrap_or_else(|_| internal_server_error()),
    };

    Ok(result)
}

#[derive(Clone)]
pub struct TokioExecutor;

impl<F> hyper::rt::Executor<F> for TokioExecutor
where
    F: std::future::Future + Send + 'static,
    F::Output: Send + 'static,
{
    fn execute(&self, fut: F) {
        tokio::task::spawn(fut);
    }
}

fn build_gateway(config: &GatewayConfig) -> Result<Gateway, Box<dyn std::error::Error>> {
    let sdl = config.read_sdl()?;
    let schema = Schema::build(&sdl, &config.bindings, &config.services)?;
    let auth = Arc::new(AuthGuard::from_config(&config.auth, config.base_dir())?);
    let transport = Arc::new(ClientPool::new(&config.services)?);
    let backend = Arc::new(ResilientBackend::new(transport, config.services.clone()));
    Ok(Gateway::new(schema, auth, backend, config))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "serendib_gateway=info,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = GatewayConfig::load(&args.config)?;
    let addr = config.listen;
    let gateway = Arc::new(build_gateway(&config)?);

    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "gateway listening");

    loop {
        let (stream, _addr) = listener.accept().await?;
        let io = TokioIo::new(stream);

        let gateway_clone = Arc::clone(&gateway);

        tokio::task::spawn(async move {
            let service = service_fn(move |req| {
                let gateway = gateway_clone.clone();
                handle_request(req, gateway)
            });

            if let Err(e) = hyper_util::server::conn::auto::Builder::new(TokioExecutor)
                .serve_connection(io, service)
                .await
            {
                tracing::debug!(error = %e, "connection closed with error");
            }
        });
    }
}
