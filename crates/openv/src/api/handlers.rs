//! API request handlers.

use axum::{
    Json,
    extract::{
        Path, State, WebSocketUpgrade,
        ws::{CloseFrame, Message, WebSocket, close_code},
    },
    http::{HeaderMap, StatusCode, Uri},
    response::Response,
};
use futures::StreamExt;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::auth::{CurrentUser, request_token};
use crate::sandbox::ContainerStats;
use crate::session::{CreateSessionRequest, ExecRequest, ExecResponse, SessionRecord};
use crate::terminal::{BridgeExit, run_bridge};

use super::error::{ApiError, ApiResult};
use super::state::AppState;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Health check endpoint.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Create a project session record for the caller.
#[instrument(skip(state, request), fields(tenant = user.tenant_id()))]
pub async fn create_project(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(request): Json<CreateSessionRequest>,
) -> ApiResult<(StatusCode, Json<SessionRecord>)> {
    let record = state
        .sessions
        .create_session(user.tenant_id(), &request.name)
        .await?;
    info!(session_id = record.id, "Created project session");
    Ok((StatusCode::CREATED, Json(record)))
}

pub async fn list_projects(
    State(state): State<AppState>,
    user: CurrentUser,
) -> ApiResult<Json<Vec<SessionRecord>>> {
    Ok(Json(state.sessions.list_sessions(user.tenant_id()).await?))
}

pub async fn get_project(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<i64>,
) -> ApiResult<Json<SessionRecord>> {
    Ok(Json(state.sessions.get_owned(user.tenant_id(), id).await?))
}

#[instrument(skip(state), fields(tenant = user.tenant_id()))]
pub async fn start_project(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<i64>,
) -> ApiResult<Json<SessionRecord>> {
    Ok(Json(state.sessions.start_session(user.tenant_id(), id).await?))
}

#[instrument(skip(state), fields(tenant = user.tenant_id()))]
pub async fn stop_project(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<i64>,
) -> ApiResult<Json<SessionRecord>> {
    Ok(Json(state.sessions.stop_session(user.tenant_id(), id).await?))
}

pub async fn project_stats(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<i64>,
) -> ApiResult<Json<ContainerStats>> {
    Ok(Json(state.sessions.stats(user.tenant_id(), id).await?))
}

#[instrument(skip(state, request), fields(tenant = user.tenant_id()))]
pub async fn exec_project(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<i64>,
    Json(request): Json<ExecRequest>,
) -> ApiResult<Json<ExecResponse>> {
    if request.command.trim().is_empty() {
        return Err(ApiError::bad_request("command must be non-empty"));
    }
    let output = state
        .sessions
        .exec(user.tenant_id(), id, &request.command)
        .await?;
    Ok(Json(ExecResponse { output }))
}

/// Why a terminal upgrade was refused.
enum TerminalRejection {
    /// Closed with 1008.
    Policy(String),
    /// Closed with 1011.
    Internal(String),
}

/// Token, ownership and running-state checks for a terminal connection.
async fn authorize_terminal(
    state: &AppState,
    raw_id: &str,
    headers: &HeaderMap,
    uri: &Uri,
) -> Result<(i64, String), TerminalRejection> {
    let tenant_id = request_token(headers, uri)
        .and_then(|token| state.auth.authenticate(&token))
        .map_err(|e| TerminalRejection::Policy(e.to_string()))?;

    let id = raw_id
        .parse::<i64>()
        .map_err(|_| TerminalRejection::Policy(format!("invalid project id: {}", raw_id)))?;

    match state.sessions.authorize_terminal(tenant_id, id).await {
        Ok(handle) => Ok((id, handle)),
        Err(e) => match ApiError::from_anyhow(e) {
            ApiError::NotFound(msg) | ApiError::BadRequest(msg) => {
                Err(TerminalRejection::Policy(msg))
            }
            other => Err(TerminalRejection::Internal(other.to_string())),
        },
    }
}

async fn close_socket(mut socket: WebSocket, code: u16, reason: String) {
    let frame = CloseFrame {
        code,
        reason: reason.into(),
    };
    if let Err(e) = socket.send(Message::Close(Some(frame))).await {
        debug!("failed to send terminal close frame: {}", e);
    }
}

/// Interactive terminal into a running project sandbox.
///
/// Authorization happens once, before anything is attached. A refused
/// connection is upgraded and immediately closed with 1008 so browser
/// clients see the reason.
pub async fn terminal_ws(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
    headers: HeaderMap,
    uri: Uri,
    ws: WebSocketUpgrade,
) -> Response {
    let authorized = authorize_terminal(&state, &raw_id, &headers, &uri).await;

    ws.on_upgrade(move |socket| async move {
        let (id, handle) = match authorized {
            Ok(target) => target,
            Err(TerminalRejection::Policy(reason)) => {
                info!(project = %raw_id, %reason, "Refusing terminal connection");
                close_socket(socket, close_code::POLICY, reason).await;
                return;
            }
            Err(TerminalRejection::Internal(reason)) => {
                warn!(project = %raw_id, %reason, "Terminal authorization failed");
                close_socket(socket, close_code::ERROR, reason).await;
                return;
            }
        };

        let channel = match state.sessions.open_terminal(&handle).await {
            Ok(channel) => channel,
            Err(e) => {
                warn!(session_id = id, "Failed to open terminal: {:#}", e);
                close_socket(socket, close_code::ERROR, "failed to open terminal".to_string())
                    .await;
                return;
            }
        };

        info!(session_id = id, container = %handle, "Terminal attached");
        let recorder = state.sessions.activity_recorder(id);
        let (client_tx, client_rx) = socket.split();
        let exit = run_bridge(client_tx, client_rx, channel, &recorder, state.heartbeat).await;

        match exit {
            BridgeExit::ClientClosed | BridgeExit::ChannelClosed => {
                info!(session_id = id, ?exit, "Terminal detached");
            }
            BridgeExit::HeartbeatFailed(_) | BridgeExit::Error(_) => {
                warn!(session_id = id, ?exit, "Terminal ended with error");
            }
        }
    })
}
