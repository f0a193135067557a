//! Agent-facing WebSocket endpoints.
//!
//! - `GET /api/agent/connect?server_id=&name=&token=`: the agent's task
//!   channel. Text frames carry [`TaskEnvelope`] JSON in both directions.
//! - `GET /api/agent/stream/{stream_id}?token=`: the agent's side of a
//!   terminal stream. Frames are opaque bytes pumped by the stream registry.
//!
//! Both sit behind [`crate::auth::require_agent`].

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    response::{IntoResponse, Response},
    Json,
};
use base64::Engine;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::error::{ok, ApiError};
use crate::hub::AgentConnection;
use crate::store::Server;
use crate::streams::websocket_transport;
use crate::task::{
    AgentReport, CommandCheckReply, CommandCheckRequest, Dispatcher, RecordingUpload,
    RecordingUploadReply, TaskEnvelope, TaskKind,
};
use crate::AppState;

#[derive(Deserialize)]
pub struct ConnectQuery {
    server_id: u64,
    #[serde(default)]
    name: String,
}

/// `GET /api/agent/connect`: register an agent's task channel.
pub async fn agent_connect(
    State(state): State<AppState>,
    Query(query): Query<ConnectQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    if query.server_id == 0 {
        return Err(ApiError::bad_request("server_id is required"));
    }
    let server_id = query.server_id;
    let name = if query.name.is_empty() {
        format!("server-{server_id}")
    } else {
        query.name
    };
    info!(server_id, "Agent connecting...");

    Ok(ws.on_upgrade(move |socket| {
        handle_agent_ws(socket, state, server_id, name)
            .instrument(info_span!("agent", server_id))
    }))
}

async fn handle_agent_ws(socket: WebSocket, state: AppState, server_id: u64, name: String) {
    let server = Server {
        id: server_id,
        name: name.clone(),
        last_seen: Some(Utc::now()),
    };
    if let Err(e) = state.store.upsert_server(server).await {
        warn!("Failed to record server {server_id}: {e}");
    }

    let mut conn = state.hub.register(server_id, &name).await;
    let (mut ws_sink, mut ws_stream) = socket.split();

    // Re-dispatch enabled tunnels once the channel is live.
    let tunnels = state.tunnels.clone();
    tokio::spawn(async move { tunnels.resume_server(server_id).await });

    loop {
        let msg = tokio::select! {
            msg = ws_stream.next() => {
                let Some(Ok(msg)) = msg else { break };
                msg
            }
            task = conn.tasks.recv() => {
                let Some(envelope) = task else { break };
                if ws_sink.send(Message::Text(envelope.to_json().into())).await.is_err() {
                    break;
                }
                continue;
            }
            _ = conn.shutdown.changed() => {
                info!("Agent handler shutting down (replaced or evicted)");
                break;
            }
        };
        conn.touch();
        match msg {
            Message::Text(text) => match TaskEnvelope::from_json(text.as_str()) {
                Ok(envelope) => handle_report(&state, &conn, &envelope).await,
                Err(e) => warn!("Malformed envelope from agent: {e}"),
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    state.hub.unregister(&conn).await;
    let _ = ws_sink.close().await;
}

async fn handle_report(state: &AppState, conn: &AgentConnection, envelope: &TaskEnvelope) {
    let report = match AgentReport::decode(envelope) {
        Ok(report) => report,
        Err(e) => {
            warn!(kind = envelope.kind, "Undecodable payload from agent: {e}");
            return;
        }
    };
    let server_id = conn.server_id;
    match report {
        AgentReport::Keepalive => {}
        AgentReport::CommandCheck(req) => {
            let state = state.clone();
            tokio::spawn(async move { reply_command_check(&state, server_id, req).await });
        }
        AgentReport::CommandRecord(req) => state.audit.record_command(req),
        AgentReport::RecordingUpload(upload) => {
            let state = state.clone();
            tokio::spawn(async move { reply_recording_upload(&state, server_id, upload).await });
        }
        AgentReport::TunnelStatus(report) => {
            state.tunnels.apply_status_report(server_id, &report).await;
        }
        AgentReport::Unknown(kind) => debug!(kind, "Ignoring unknown task kind from agent"),
    }
}

async fn reply_command_check(state: &AppState, server_id: u64, req: CommandCheckRequest) {
    let response = state.audit.check_command(&req).await;
    let Some(request_id) = req.request_id else {
        return;
    };
    let reply = CommandCheckReply {
        request_id,
        response,
    };
    match TaskEnvelope::new(TaskKind::CommandCheck, &reply) {
        Ok(envelope) => {
            if let Err(e) = state.hub.dispatch(server_id, envelope).await {
                debug!("Command check reply not delivered: {e}");
            }
        }
        Err(e) => warn!("Failed to encode command check reply: {e}"),
    }
}

async fn reply_recording_upload(state: &AppState, server_id: u64, upload: RecordingUpload) {
    let result = match base64::engine::general_purpose::STANDARD.decode(upload.data.as_bytes()) {
        Ok(bytes) => state
            .audit
            .save_recording(&upload.stream_id, &bytes)
            .await
            .map(|_| ())
            .map_err(|e| e.to_string()),
        Err(e) => Err(format!("invalid base64: {e}")),
    };
    if let Err(e) = &result {
        warn!(stream_id = %upload.stream_id, "Recording upload rejected: {e}");
    }
    let reply = RecordingUploadReply {
        stream_id: upload.stream_id,
        success: result.is_ok(),
        error: result.err(),
    };
    match TaskEnvelope::new(TaskKind::RecordingUpload, &reply) {
        Ok(envelope) => {
            if let Err(e) = state.hub.dispatch(server_id, envelope).await {
                debug!("Recording upload reply not delivered: {e}");
            }
        }
        Err(e) => warn!("Failed to encode recording upload reply: {e}"),
    }
}

/// `GET /api/agent/stream/{stream_id}`: attach the agent side of a stream.
pub async fn agent_stream(
    State(state): State<AppState>,
    Path(stream_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    state.streams.get_stream(&stream_id).await?;
    Ok(ws
        .on_upgrade(move |socket| async move {
            let transport = websocket_transport(socket, None);
            if let Err(e) = state.streams.agent_connected(&stream_id, transport).await {
                warn!(stream_id = %stream_id, "Agent stream attach failed: {e}");
            }
        })
        .into_response())
}

/// `GET /api/agents`: connected agents.
pub async fn list_agents(State(state): State<AppState>) -> Json<Value> {
    ok(state.hub.list().await)
}
