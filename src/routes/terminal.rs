//! Interactive terminal endpoints.
//!
//! Opening a terminal is two requests:
//!
//! 1. `POST /api/terminal {server_id}` creates the audit session and the
//!    stream, then asks the agent to open its side. The response carries
//!    the stream id as `session_id`.
//! 2. `GET /ws/terminal/{session_id}` upgrades the browser socket, attaches
//!    it as the user side and pumps until either side goes away.
//!
//! Browser frames are forwarded untouched. By convention the first byte
//! tags the frame: `0x00` stdin bytes, `0x01` a `{"cols","rows"}` resize.

use std::time::Duration;

use axum::{
    extract::{ws::WebSocket, Path, State, WebSocketUpgrade},
    response::Response,
    Extension, Json,
};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::auth::Caller;
use crate::error::{ok, ApiError, ApiResult};
use crate::store::StoreError;
use crate::streams::websocket_transport;
use crate::task::{Dispatcher, TaskEnvelope, TaskKind, TerminalTask};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct OpenTerminal {
    pub server_id: u64,
}

/// `POST /api/terminal`
pub async fn open_terminal(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Json(body): Json<OpenTerminal>,
) -> ApiResult {
    if !caller.can_access(body.server_id) {
        return Err(ApiError::forbidden("no access to this server"));
    }
    if !state.hub.is_connected(body.server_id).await {
        return Err(ApiError::BadGateway("server not found or not connected".into()));
    }
    let server = match state.store.get_server(body.server_id).await {
        Ok(server) => server,
        Err(StoreError::NotFound(_)) => return Err(ApiError::not_found("server not found")),
        Err(e) => return Err(e.into()),
    };

    let stream_id = Uuid::new_v4().to_string();
    let session = state.audit.open_session(&caller, &server, &stream_id).await?;
    state.streams.create_stream(&stream_id).await?;

    let task = TerminalTask {
        stream_id: stream_id.clone(),
        record: session.recording_enabled,
    };
    let dispatched = match TaskEnvelope::new(TaskKind::TerminalStream, &task) {
        Ok(envelope) => state.hub.dispatch(server.id, envelope).await,
        Err(e) => Err(e.into()),
    };
    if let Err(e) = dispatched {
        state.streams.close_stream(&stream_id).await;
        if let Err(seal_err) = state.audit.seal_session(&stream_id).await {
            warn!(stream_id = %stream_id, "Failed to seal session: {seal_err}");
        }
        return Err(e.into());
    }

    info!(
        stream_id = %stream_id,
        server_id = server.id,
        "{} opened a terminal on {}",
        caller.username,
        server.name
    );
    Ok(ok(json!({
        "session_id": stream_id,
        "server_id": server.id,
        "server_name": server.name,
    })))
}

/// `GET /ws/terminal/{session_id}`
///
/// Only the user who opened the terminal (or an admin) may attach.
pub async fn terminal_ws(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(stream_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    state.streams.get_stream(&stream_id).await?;
    let session = state.store.session_by_stream(&stream_id).await?;
    if !caller.admin && session.user_id != caller.user_id {
        return Err(ApiError::forbidden("terminal belongs to another user"));
    }
    let span = info_span!("terminal", stream_id = %stream_id);
    Ok(ws.on_upgrade(move |socket| handle_terminal_ws(socket, state, stream_id).instrument(span)))
}

async fn handle_terminal_ws(socket: WebSocket, state: AppState, stream_id: String) {
    let server = &state.config.server;
    let ping = Duration::from_secs(server.ping_interval_secs);
    let idle = Duration::from_secs(server.terminal_idle_timeout_secs);

    let transport = websocket_transport(socket, Some(ping));
    if let Err(e) = state.streams.user_connected(&stream_id, transport).await {
        // A second browser must not tear down the first one's session.
        warn!("Terminal attach failed: {e}");
        return;
    }
    if let Err(e) = state.streams.start_stream(&stream_id, idle).await {
        info!("Terminal stream ended: {e}");
    }

    state.streams.close_stream(&stream_id).await;
    if let Err(e) = state.audit.seal_session(&stream_id).await {
        warn!("Failed to seal terminal session: {e}");
    }
}
