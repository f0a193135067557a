//! Command audit endpoints under `/api/v1/terminal`.
//!
//! Agent-facing (agent secret): `check-command`, `record-command`,
//! `upload-recording`. Everything else is user-facing; non-admins only ever
//! see their own sessions and commands, and only admins edit the blacklist.

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::header,
    response::{IntoResponse, Response},
    Extension, Json,
};
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use tokio_util::io::ReaderStream;

use crate::audit::model::{RuleForm, RulePatch};
use crate::auth::Caller;
use crate::error::{ok, ApiError, ApiResult};
use crate::store::{CommandFilter, Page, SessionFilter};
use crate::task::{CommandCheckRequest, CommandRecordRequest, RecordingUpload};
use crate::AppState;

const SESSION_PAGE_SIZE: u32 = 20;
const COMMAND_PAGE_SIZE: u32 = 50;

// ─── Agent-facing ────────────────────────────────────────────────────────────

/// `POST /api/v1/terminal/check-command`
pub async fn check_command(
    State(state): State<AppState>,
    Json(req): Json<CommandCheckRequest>,
) -> ApiResult {
    Ok(ok(state.audit.check_command(&req).await))
}

/// `POST /api/v1/terminal/record-command`: queued, always succeeds.
pub async fn record_command(
    State(state): State<AppState>,
    Json(req): Json<CommandRecordRequest>,
) -> ApiResult {
    state.audit.record_command(req);
    Ok(ok(serde_json::Value::Null))
}

/// `POST /api/v1/terminal/upload-recording {stream_id, data: base64}`
pub async fn upload_recording(
    State(state): State<AppState>,
    Json(upload): Json<RecordingUpload>,
) -> ApiResult {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(upload.data.as_bytes())
        .map_err(|e| ApiError::bad_request(format!("invalid base64: {e}")))?;
    state.audit.save_recording(&upload.stream_id, &bytes).await?;
    Ok(ok(json!({"stream_id": upload.stream_id})))
}

// ─── Listings ────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct SessionQuery {
    page: Option<u32>,
    page_size: Option<u32>,
    user_id: Option<u64>,
    server_id: Option<u64>,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
}

/// `GET /api/v1/terminal/sessions`
pub async fn list_sessions(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Query(query): Query<SessionQuery>,
) -> ApiResult {
    let filter = SessionFilter {
        user_id: if caller.admin { query.user_id } else { Some(caller.user_id) },
        server_id: query.server_id,
        from: query.from,
        to: query.to,
    };
    let page = Page::new(query.page, query.page_size, SESSION_PAGE_SIZE);
    Ok(ok(state.audit.list_sessions(&filter, page).await?))
}

#[derive(Debug, Default, Deserialize)]
pub struct CommandQuery {
    page: Option<u32>,
    page_size: Option<u32>,
    session_id: Option<u64>,
    user_id: Option<u64>,
    server_id: Option<u64>,
    command: Option<String>,
    blocked: Option<bool>,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
}

/// `GET /api/v1/terminal/commands`
pub async fn list_commands(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Query(query): Query<CommandQuery>,
) -> ApiResult {
    let filter = CommandFilter {
        session_id: query.session_id,
        user_id: if caller.admin { query.user_id } else { Some(caller.user_id) },
        server_id: query.server_id,
        command: query.command,
        blocked: query.blocked,
        from: query.from,
        to: query.to,
    };
    let page = Page::new(query.page, query.page_size, COMMAND_PAGE_SIZE);
    Ok(ok(state.audit.list_commands(&filter, page).await?))
}

// ─── Recordings ──────────────────────────────────────────────────────────────

/// `GET /api/v1/terminal/recording/{session_id}`: streams the gzip file.
pub async fn recording(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(session_id): Path<u64>,
) -> Result<Response, ApiError> {
    let (session, path) = state.audit.recording_file(session_id).await?;
    if !caller.admin && session.user_id != caller.user_id {
        return Err(ApiError::not_found(format!("session {session_id} not found")));
    }
    let file = tokio::fs::File::open(&path)
        .await
        .map_err(|e| ApiError::Internal(format!("failed to open recording: {e}")))?;
    let filename = format!("{}.cast.gz", session.stream_id);
    Ok((
        [
            (header::CONTENT_TYPE, "application/gzip".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            ),
        ],
        Body::from_stream(ReaderStream::new(file)),
    )
        .into_response())
}

/// `GET /api/v1/terminal/recording-url/{session_id}`
pub async fn recording_url(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(session_id): Path<u64>,
) -> ApiResult {
    let (session, _) = state.audit.recording_file(session_id).await?;
    if !caller.admin && session.user_id != caller.user_id {
        return Err(ApiError::not_found(format!("session {session_id} not found")));
    }
    Ok(ok(json!({
        "url": format!("/api/v1/terminal/recording/{session_id}"),
    })))
}

// ─── Blacklist ───────────────────────────────────────────────────────────────

fn require_admin(caller: &Caller) -> Result<(), ApiError> {
    if caller.admin {
        Ok(())
    } else {
        Err(ApiError::forbidden("admin only"))
    }
}

/// `GET /api/v1/terminal/blacklist`
pub async fn list_rules(State(state): State<AppState>) -> ApiResult {
    Ok(ok(state.audit.list_rules().await?))
}

/// `POST /api/v1/terminal/blacklist`
pub async fn create_rule(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Json(form): Json<RuleForm>,
) -> ApiResult {
    require_admin(&caller)?;
    Ok(ok(state.audit.create_rule(caller.user_id, &form).await?))
}

/// `PATCH /api/v1/terminal/blacklist/{id}`
pub async fn update_rule(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<u64>,
    Json(patch): Json<RulePatch>,
) -> ApiResult {
    require_admin(&caller)?;
    Ok(ok(state.audit.update_rule(id, &patch).await?))
}

/// `DELETE /api/v1/terminal/blacklist/{id}`
pub async fn delete_rule(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<u64>,
) -> ApiResult {
    require_admin(&caller)?;
    state.audit.delete_rule(id).await?;
    Ok(ok(json!({"id": id})))
}
