//! HTTP surface: routing, error mapping and server lifecycle

use crate::auth::{require_bearer, JwtVerifier};
use crate::config::ServerConfig;
use crate::gateway::{CommandGateway, CommandRequest, GatewayError};
use crate::platform::Platform;
use crate::policy::{AllowlistError, RejectionReason};
use crate::runner::ProcessRunner;
use crate::service::{ServiceError, ServiceOps};
use crate::status::StatusAggregator;
use anyhow::Context;
use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{middleware, Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::any::Any;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

/// Largest accepted request body
pub const MAX_BODY_BYTES: usize = 64 * 1024;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<CommandGateway>,
    pub services: Arc<ServiceOps>,
    pub status: Arc<StatusAggregator>,

    /// Cancelled on shutdown; every in-flight execution derives from it
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Production wiring: the current platform's launcher, real processes, sysinfo probes
    pub fn from_config(config: &ServerConfig) -> Result<Self, AllowlistError> {
        let allowlist = Arc::new(config.load_allowlist()?);
        let launcher = Platform::current().launcher();
        let runner = Arc::new(ProcessRunner::new());

        let gateway = CommandGateway::new(allowlist, launcher.clone(), runner.clone())
            .with_timeout(config.exec_timeout())
            .with_max_output_bytes(config.max_output_bytes);

        let services = ServiceOps::new(launcher, runner)
            .with_timeout(config.service_timeout())
            .with_max_output_bytes(config.max_output_bytes);

        Ok(Self {
            gateway: Arc::new(gateway),
            services: Arc::new(services),
            status: Arc::new(StatusAggregator::default()),
            shutdown: CancellationToken::new(),
        })
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let message = self.to_string();
        match self {
            GatewayError::Rejected(RejectionReason::VerbNotAllowed) => {
                (StatusCode::FORBIDDEN, Json(json!({ "error": message }))).into_response()
            }
            GatewayError::Rejected(_) => {
                (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
            }
            GatewayError::Timeout(_) => (
                StatusCode::REQUEST_TIMEOUT,
                Json(json!({ "success": false, "output": "", "error": message })),
            )
                .into_response(),
            GatewayError::Cancelled => (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "success": false, "output": "", "error": message })),
            )
                .into_response(),
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = match self {
            ServiceError::InvalidName | ServiceError::InvalidLines => StatusCode::BAD_REQUEST,
            ServiceError::RestartFailed(_) | ServiceError::LogsFailed(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Build the application router; `auth` of `None` leaves every route open
pub fn build_router(state: AppState, auth: Option<Arc<JwtVerifier>>) -> Router {
    let mut api = Router::new()
        .route("/exec", post(handle_exec))
        .route("/service/:name/restart", post(handle_restart))
        .route("/service/:name/logs", get(handle_logs))
        .route("/status", get(handle_status));

    if let Some(verifier) = auth {
        api = api.route_layer(middleware::from_fn_with_state(verifier, require_bearer));
    }

    Router::new()
        .nest("/api/v1", api)
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .layer(CatchPanicLayer::custom(handle_panic))
                .layer(DefaultBodyLimit::max(MAX_BODY_BYTES)),
        )
}

async fn handle_exec(
    State(state): State<AppState>,
    payload: Result<Json<CommandRequest>, JsonRejection>,
) -> Response {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => {
            let status = match rejection.status() {
                StatusCode::PAYLOAD_TOO_LARGE => StatusCode::PAYLOAD_TOO_LARGE,
                _ => StatusCode::BAD_REQUEST,
            };
            return (
                status,
                Json(json!({
                    "error": "Invalid request body format",
                    "detail": rejection.body_text(),
                })),
            )
                .into_response();
        }
    };

    match state.gateway.execute(&request, &state.shutdown).await {
        Ok(result) => Json(result).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn handle_restart(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Response, ServiceError> {
    let report = state.services.restart(&name, &state.shutdown).await?;
    Ok(Json(report).into_response())
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    lines: Option<String>,
}

async fn handle_logs(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<Response, ServiceError> {
    let logs = state
        .services
        .logs(&name, query.lines.as_deref(), &state.shutdown)
        .await?;
    Ok(Json(logs).into_response())
}

async fn handle_status(State(state): State<AppState>) -> Response {
    Json(state.status.collect().await).into_response()
}

fn handle_panic(panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");

    error!(detail, "Handler panicked");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "Internal server error" })),
    )
        .into_response()
}

/// Resolves on Ctrl-C or SIGTERM, then cancels in-flight work
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, cancelling in-flight executions");
    token.cancel();
}

/// Validate the config, bind and serve until a shutdown signal arrives
pub async fn run_server(config: ServerConfig) -> anyhow::Result<()> {
    config.validate().context("invalid server configuration")?;

    let state = AppState::from_config(&config).context("failed to load allowlist")?;
    let auth = if config.require_auth {
        Some(Arc::new(JwtVerifier::new(&config.jwt_secret)))
    } else {
        warn!("Starting without authentication");
        None
    };

    let bind_address = config.bind_address();
    let listener = TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("failed to bind {}", bind_address))?;
    let local_addr = listener
        .local_addr()
        .context("failed to resolve listen address")?;

    info!(
        addr = %local_addr,
        platform = Platform::current().name(),
        auth = config.require_auth,
        verbs = ?state.gateway.allowlist().verbs(),
        "remote-admin listening"
    );

    let shutdown = state.shutdown.clone();
    let app = build_router(state, auth);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await
        .context("server exited unexpectedly")?;

    info!("Server stopped");
    Ok(())
}
