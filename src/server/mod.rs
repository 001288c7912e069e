use crate::config::Presets;
use crate::environment::ExecOptions;
use crate::error::RolloutError;
use crate::runner::Runner;
use crate::stats::{RunnerStats, StatsFilter};
use anyhow::{Context, Result};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::future::Future;
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

pub mod api;

use api::{
    CloseInstanceRequest, ErrorResponse, ExecuteCommandRequest, ExecuteCommandResponse,
    StartInstanceRequest, StartInstanceResponse, StatusResponse, STATUS_SUCCESS,
};

pub struct AppState {
    pub runner: Arc<Runner>,
    pub presets: Presets,
}

/// Error body `{"detail": ...}` with the status mapped from the runner error
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    detail: String,
}

impl ApiError {
    fn bad_request(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            detail: detail.into(),
        }
    }
}

impl From<RolloutError> for ApiError {
    fn from(err: RolloutError) -> Self {
        let status =
            StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        Self {
            status,
            detail: err.to_string(),
        }
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(err: tokio::task::JoinError) -> Self {
        error!(error = %err, "Runner task aborted");
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            detail: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorResponse { detail: self.detail })).into_response()
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/start_instance", post(start_instance))
        .route("/execute_command", post(execute_command))
        .route("/close_instance", post(close_instance))
        .route("/get_available_resources", get(get_available_resources))
        .route("/stats", get(stats))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve on `host:port` until `shutdown` resolves
pub async fn start_server<F>(host: &str, port: u16, state: Arc<AppState>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", host, port))?;
    let listener =
        TcpListener::bind(addr).with_context(|| format!("failed to bind {}", addr))?;
    serve(listener, state, shutdown).await
}

/// Serve on an already-bound listener; tests bind port 0 and read it back
pub async fn serve<F>(listener: TcpListener, state: Arc<AppState>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    listener.set_nonblocking(true)?;
    let addr = listener.local_addr()?;
    info!(addr = %addr, presets = state.presets.len(), "Rollout API listening");

    axum::Server::from_tcp(listener)?
        .serve(router(state).into_make_service())
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

// Runner calls run on their own task so a client hanging up mid-request
// cannot interrupt provisioning or teardown halfway.

async fn start_instance(
    State(state): State<Arc<AppState>>,
    Json(req): Json<StartInstanceRequest>,
) -> Result<Json<StartInstanceResponse>, ApiError> {
    let config = state
        .presets
        .resolve(&req.container_name, req.environment_config)?;

    let runner = state.runner.clone();
    let instance_id = tokio::spawn(async move {
        runner
            .start(&req.run_id, &req.container_name, config)
            .await
    })
    .await??;

    Ok(Json(StartInstanceResponse {
        status: STATUS_SUCCESS.to_string(),
        instance_id,
    }))
}

/// Seconds from a request body as a `Duration`. Zero, negative and
/// unrepresentable values are rejected.
fn command_timeout(secs: f64) -> Result<Duration, ApiError> {
    let invalid = || {
        ApiError::bad_request(format!(
            "timeout must be a positive number of seconds, got {}",
            secs
        ))
    };
    if secs <= 0.0 {
        return Err(invalid());
    }
    Duration::try_from_secs_f64(secs).map_err(|_| invalid())
}

async fn execute_command(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ExecuteCommandRequest>,
) -> Result<Json<ExecuteCommandResponse>, ApiError> {
    let opts = ExecOptions {
        cwd: req.cwd,
        timeout: req.timeout.map(command_timeout).transpose()?,
    };

    let runner = state.runner.clone();
    let result =
        tokio::spawn(async move { runner.execute(&req.run_id, &req.cmd, &opts).await }).await??;

    Ok(Json(ExecuteCommandResponse {
        status: STATUS_SUCCESS.to_string(),
        result,
    }))
}

async fn close_instance(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CloseInstanceRequest>,
) -> Result<Json<StatusResponse>, ApiError> {
    let runner = state.runner.clone();
    tokio::spawn(async move { runner.close(&req.run_id).await }).await??;
    Ok(Json(StatusResponse::success()))
}

async fn get_available_resources(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.runner.available())
}

async fn stats(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<StatsFilter>,
) -> Json<RunnerStats> {
    Json(state.runner.stats(&filter))
}

async fn health() -> Json<StatusResponse> {
    Json(StatusResponse {
        status: "ok".to_string(),
    })
}
