use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use async_stream::stream;
use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::StatusCode;
use axum::http::request::Parts;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use futures_util::Stream;
use ontos_events::{AuditQuery, InAppMessage};
use ontos_hotel::HotelPlugin;
use ontos_kernel::{KernelBuilder, KernelConfig, OntosKernel};
use ontos_protocol::{
    ActionContext, ActionResult, AuditRecord, DomainEvent, OntosError, SchemaExport, SessionId, SnapshotId,
    UserContext,
};
use ontos_runtime::{SessionContext, TurnResponse};
use ontos_snapshot::UndoOutcome;
use serde::Deserialize;
use serde_json::{Value, json};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "ontos-api")]
#[command(about = "ontos hotel HTTP API")]
struct Cli {
    /// JSON kernel configuration; defaults plus ONTOS_* overrides when absent.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long, default_value = "127.0.0.1:8787")]
    listen: SocketAddr,
    /// Start with an empty property instead of the demo data.
    #[arg(long)]
    empty: bool,
}

#[derive(Clone)]
struct AppState {
    kernel: OntosKernel,
}

/// Caller identity from `x-user-id`, `x-role` and the optional `x-branch`.
/// Authentication happens in front of this service.
struct Caller(UserContext);

impl<S: Send + Sync> FromRequestParts<S> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_owned)
        };
        let (Some(user_id), Some(role)) = (header("x-user-id"), header("x-role")) else {
            return Err(ApiError::new(StatusCode::UNAUTHORIZED, "UNAUTHENTICATED", "x-user-id and x-role are required"));
        };
        let mut user = UserContext::new(user_id, role);
        if let Some(branch) = header("x-branch") {
            user = user.in_scope(branch);
        }
        Ok(Self(user))
    }
}

#[derive(Debug, Deserialize)]
struct TurnRequest {
    text: String,
    session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UndoRequest {
    #[serde(default)]
    cascade: bool,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    code: String,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
        }
    }
}

fn status_for(code: &str) -> StatusCode {
    match code {
        "VALIDATION_ERROR" => StatusCode::BAD_REQUEST,
        "PERMISSION_DENIED" | "ATTRIBUTE_ACCESS_DENIED" => StatusCode::FORBIDDEN,
        "UNKNOWN_ACTION" | "NOT_FOUND" | "SNAPSHOT_NOT_FOUND" => StatusCode::NOT_FOUND,
        "SNAPSHOT_EXPIRED" => StatusCode::GONE,
        "CONSTRAINT_VIOLATION" | "INVALID_TRANSITION" | "SNAPSHOT_ALREADY_UNDONE" | "UNDO_CONFLICT" => {
            StatusCode::CONFLICT
        }
        "UPSTREAM_UNAVAILABLE" => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<OntosError> for ApiError {
    fn from(error: OntosError) -> Self {
        let code = error.error_code();
        Self::new(status_for(code), code, error.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.code, "message": self.message }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();

    let cli = Cli::parse();
    let config = KernelConfig::load(cli.config.as_deref())?;
    let plugin = if cli.empty { HotelPlugin::new() } else { HotelPlugin::new().with_demo_data() };
    let kernel = KernelBuilder::new(config).plugin(plugin).build().await?;

    let app = router(AppState { kernel })
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(cli.listen).await?;
    info!(listen = %cli.listen, "ontos-api listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/schema", get(schema))
        .route("/actions/{name}", post(dispatch_action))
        .route("/turns", post(process_turn))
        .route("/snapshots/{snapshot_id}/undo", post(undo_snapshot))
        .route("/audit", get(audit))
        .route("/notifications/{recipient}", get(notifications))
        .route("/events", get(stream_events))
        .with_state(state)
}

async fn healthz() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "ontos-api"
    }))
}

async fn schema(State(state): State<AppState>) -> Json<SchemaExport> {
    Json(state.kernel.export_schema())
}

/// Business failures come back with the failed `ActionResult` as the body.
async fn dispatch_action(
    Path(name): Path<String>,
    State(state): State<AppState>,
    Caller(user): Caller,
    Json(params): Json<Value>,
) -> ApiResult<(StatusCode, Json<ActionResult>)> {
    let result = state
        .kernel
        .dispatch(&name, params, &ActionContext::new(user))
        .await?;
    let status = match (&result.success, result.error_code.as_deref()) {
        (true, _) => StatusCode::OK,
        (false, Some(code)) => status_for(code),
        (false, None) => StatusCode::UNPROCESSABLE_ENTITY,
    };
    Ok((status, Json(result)))
}

async fn process_turn(
    State(state): State<AppState>,
    Caller(user): Caller,
    Json(request): Json<TurnRequest>,
) -> ApiResult<Json<TurnResponse>> {
    let session_id = request
        .session_id
        .map(SessionId::from)
        .unwrap_or_else(SessionId::new_uuid);
    let session = SessionContext::new(session_id, user);
    Ok(Json(state.kernel.process_turn(&request.text, &session).await?))
}

async fn undo_snapshot(
    Path(snapshot_id): Path<String>,
    State(state): State<AppState>,
    Caller(user): Caller,
    request: Option<Json<UndoRequest>>,
) -> ApiResult<Json<UndoOutcome>> {
    let id = SnapshotId::from(snapshot_id);
    let cascade = request.is_some_and(|Json(r)| r.cascade);
    let outcome = if cascade {
        state.kernel.undo_cascade(&id, &user).await?
    } else {
        state.kernel.undo(&id, &user).await?
    };
    Ok(Json(outcome))
}

/// Audit trail for management only.
async fn audit(
    State(state): State<AppState>,
    Caller(user): Caller,
    Query(query): Query<AuditQuery>,
) -> ApiResult<Json<Vec<AuditRecord>>> {
    if !matches!(user.role.as_str(), "manager" | "admin") {
        return Err(ApiError::new(StatusCode::FORBIDDEN, "PERMISSION_DENIED", "audit trail is management only"));
    }
    Ok(Json(state.kernel.audit_trail(&query).await?))
}

async fn notifications(
    Path(recipient): Path<String>,
    State(state): State<AppState>,
    Caller(_user): Caller,
) -> Json<Vec<InAppMessage>> {
    Json(state.kernel.in_app().messages_for(&recipient))
}

async fn stream_events(
    State(state): State<AppState>,
    Caller(user): Caller,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut subscription = state.kernel.subscribe_events();
    info!(user_id = %user.user_id, "event stream opened");
    let stream = stream! {
        loop {
            match subscription.recv().await {
                Ok(event) => yield Ok(as_sse_event(&event)),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    let lag_payload = json!({ "skipped": skipped }).to_string();
                    yield Ok(Event::default().event("stream.lagged").data(lag_payload));
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    )
}

fn as_sse_event(event: &DomainEvent) -> Event {
    let payload = serde_json::to_string(event)
        .unwrap_or_else(|error| json!({ "error": error.to_string() }).to_string());
    Event::default()
        .id(event.event_id.to_string())
        .event(event.name.as_str())
        .data(payload)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::error!(%error, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    {
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(error) => {
                    tracing::error!(%error, "failed to install SIGTERM handler");
                }
            }
        };

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_errors_map_to_client_statuses() {
        assert_eq!(status_for("PERMISSION_DENIED"), StatusCode::FORBIDDEN);
        assert_eq!(status_for("CONSTRAINT_VIOLATION"), StatusCode::CONFLICT);
        assert_eq!(status_for("SNAPSHOT_EXPIRED"), StatusCode::GONE);
        assert_eq!(status_for("STORE_ERROR"), StatusCode::INTERNAL_SERVER_ERROR);

        let error = ApiError::from(OntosError::UnknownAction("fly".into()));
        assert_eq!(error.status, StatusCode::NOT_FOUND);
        assert_eq!(error.code, "UNKNOWN_ACTION");
    }
}
