//! ---
//! vsub_section: "04-external-interfaces"
//! vsub_subsection: "module"
//! vsub_type: "source"
//! vsub_scope: "code"
//! vsub_description: "REST surface used by control panels, the device and operators."
//! vsub_version: "v0.1.0"
//! vsub_owner: "tbd"
//! ---
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use vsub_core::{CommandError, Coordinator, RunError, RunReport, SimulationStatus, StatusFrame};
use vsub_metrics::{encode_text, SharedRegistry};

use crate::websocket;

/// Payload accepted by `/api/command`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandRequest {
    /// Wire command name, e.g. `updateCurrent`.
    pub command: String,
    /// Command arguments; empty for argument-less commands.
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Successful `/api/command` response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandResponse {
    /// Always `true`; failures use an error status instead.
    pub success: bool,
    /// Mirror status after the command was applied.
    pub data: SimulationStatus,
}

/// Read side of the coordinator exposed to HTTP and WebSocket observers.
pub trait StatusProvider: Send + Sync + 'static {
    /// Current simulated setpoints, polled by the device-under-test.
    fn simulation(&self) -> SimulationStatus;
    /// Combined mirror, device and run-phase snapshot.
    fn status(&self) -> StatusFrame;
    /// Stream of frames published by the status hub.
    fn subscribe(&self) -> broadcast::Receiver<StatusFrame>;
}

/// Write side of the coordinator.
#[async_trait]
pub trait CommandHandler: Send + Sync + 'static {
    /// Apply one external command to the state mirror.
    async fn handle_command(
        &self,
        request: CommandRequest,
    ) -> Result<SimulationStatus, CommandError>;

    /// Execute the protection test battery to completion.
    async fn run_tests(&self) -> Result<RunReport, RunError>;
}

impl StatusProvider for Coordinator {
    fn simulation(&self) -> SimulationStatus {
        Coordinator::simulation(self)
    }

    fn status(&self) -> StatusFrame {
        Coordinator::status(self)
    }

    fn subscribe(&self) -> broadcast::Receiver<StatusFrame> {
        Coordinator::subscribe(self)
    }
}

#[async_trait]
impl CommandHandler for Coordinator {
    async fn handle_command(
        &self,
        request: CommandRequest,
    ) -> Result<SimulationStatus, CommandError> {
        self.command(&request.command, &request.data).await
    }

    async fn run_tests(&self) -> Result<RunReport, RunError> {
        self.run_battery().await
    }
}

/// Shared state injected into the axum handlers.
pub(crate) struct ApiState {
    pub(crate) provider: Arc<dyn StatusProvider>,
    handler: Arc<dyn CommandHandler>,
    metrics: Option<SharedRegistry>,
}

/// Builder used to configure and spawn the API server.
#[derive(Clone)]
pub struct RestApiBuilder {
    listen: SocketAddr,
    provider: Arc<dyn StatusProvider>,
    handler: Arc<dyn CommandHandler>,
    metrics: Option<SharedRegistry>,
}

impl RestApiBuilder {
    /// Construct a new builder from mandatory components.
    pub fn new(
        listen: SocketAddr,
        provider: Arc<dyn StatusProvider>,
        handler: Arc<dyn CommandHandler>,
    ) -> Self {
        Self {
            listen,
            provider,
            handler,
            metrics: None,
        }
    }

    /// Convenience constructor wiring both seams to one coordinator.
    pub fn for_coordinator(listen: SocketAddr, coordinator: Arc<Coordinator>) -> Self {
        Self::new(listen, coordinator.clone(), coordinator)
    }

    /// Attach a Prometheus registry exposed at `/metrics`.
    pub fn with_metrics_registry(mut self, registry: SharedRegistry) -> Self {
        self.metrics = Some(registry);
        self
    }

    /// Spawn the API server and return a handle that can be awaited for shutdown.
    pub async fn spawn(self) -> anyhow::Result<RestApiHandle> {
        let listener = TcpListener::bind(self.listen).await?;
        let local_addr = listener.local_addr()?;
        info!(address = %local_addr, "api listening");

        let state = ApiState {
            provider: self.provider,
            handler: self.handler,
            metrics: self.metrics,
        };
        let router = Router::new()
            .route("/api/simulation-data", get(get_simulation))
            .route("/api/command", post(post_command))
            .route("/api/run-tests", post(post_run_tests))
            .route("/api/status", get(get_status))
            .route("/metrics", get(get_metrics))
            .route("/ws", get(websocket::upgrade_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(Arc::new(state));

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let server = axum::serve(listener, router).with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
        });
        let task = tokio::spawn(async move {
            if let Err(err) = server.await {
                warn!(error = %err, "api server exited with error");
            }
        });

        Ok(RestApiHandle {
            address: local_addr,
            task,
            shutdown: shutdown_tx,
        })
    }
}

/// Handle returned from [`RestApiBuilder::spawn`].
pub struct RestApiHandle {
    address: SocketAddr,
    task: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

impl RestApiHandle {
    /// Retrieve the socket address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.address
    }

    /// Request graceful shutdown and wait for the server task to finish.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        let _ = self.shutdown.send(true);
        match self.task.await {
            Ok(()) => Ok(()),
            Err(join) => Err(anyhow::anyhow!(join)),
        }
    }
}

async fn get_simulation(State(state): State<Arc<ApiState>>) -> Json<SimulationStatus> {
    Json(state.provider.simulation())
}

async fn get_status(State(state): State<Arc<ApiState>>) -> Json<StatusFrame> {
    Json(state.provider.status())
}

async fn get_metrics(State(state): State<Arc<ApiState>>) -> Response {
    let Some(registry) = &state.metrics else {
        return (StatusCode::SERVICE_UNAVAILABLE, "metrics disabled").into_response();
    };
    match encode_text(registry) {
        Some(body) => (StatusCode::OK, body).into_response(),
        None => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

async fn post_command(
    State(state): State<Arc<ApiState>>,
    payload: Result<Json<CommandRequest>, JsonRejection>,
) -> Response {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => return command_failure(StatusCode::BAD_REQUEST, rejection.body_text()),
    };

    match state.handler.handle_command(request).await {
        Ok(status) => (
            StatusCode::OK,
            Json(CommandResponse {
                success: true,
                data: status,
            }),
        )
            .into_response(),
        Err(err @ (CommandError::UnknownCommand(_) | CommandError::InvalidPayload(_))) => {
            command_failure(StatusCode::BAD_REQUEST, err.to_string())
        }
        Err(err @ CommandError::Busy) => command_failure(StatusCode::CONFLICT, err.to_string()),
        Err(err @ CommandError::Mirror(_)) => {
            warn!(error = %err, "command dropped; state mirror unavailable");
            command_failure(StatusCode::SERVICE_UNAVAILABLE, err.to_string())
        }
    }
}

fn command_failure(status: StatusCode, error: String) -> Response {
    (status, Json(json!({ "success": false, "error": error }))).into_response()
}

async fn post_run_tests(State(state): State<Arc<ApiState>>) -> Response {
    // a dropped client connection must not cancel a run halfway through
    let handler = state.handler.clone();
    let outcome = match tokio::spawn(async move { handler.run_tests().await }).await {
        Ok(outcome) => outcome,
        Err(join) => {
            warn!(error = %join, "test run task failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "ok": false, "error": join.to_string(), "kind": "run_fault" })),
            )
                .into_response();
        }
    };

    match outcome {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(err @ RunError::AlreadyRunning) => (
            StatusCode::CONFLICT,
            Json(json!({ "ok": false, "error": err.to_string(), "kind": err.kind() })),
        )
            .into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "ok": false,
                "error": err.to_string(),
                "kind": "run_fault",
                "cause": err.kind(),
            })),
        )
            .into_response(),
    }
}
