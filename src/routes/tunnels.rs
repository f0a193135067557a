//! Port mapping management.
//!
//! Non-admin callers see and touch only mappings on servers they may access;
//! a mapping outside that set answers 404 as if it did not exist.

use axum::{
    extract::{Path, State},
    Extension, Json,
};

use crate::auth::Caller;
use crate::error::{ok, ApiError, ApiResult};
use crate::tunnels::model::{TunnelForm, TunnelMapping};
use crate::tunnels::TunnelError;
use crate::AppState;

async fn visible(state: &AppState, caller: &Caller, id: u64) -> Result<TunnelMapping, ApiError> {
    let mapping = state.tunnels.get(id).await?;
    if !caller.can_access(mapping.server_id) {
        return Err(TunnelError::NotFound(id).into());
    }
    Ok(mapping)
}

/// `GET /api/v1/tunnels`
pub async fn list(State(state): State<AppState>, Extension(caller): Extension<Caller>) -> ApiResult {
    let mappings = if caller.admin {
        state.tunnels.list().await
    } else {
        state.tunnels.list_for_servers(caller.servers()).await
    };
    Ok(ok(mappings))
}

/// `POST /api/v1/tunnels`
pub async fn create(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Json(form): Json<TunnelForm>,
) -> ApiResult {
    if !caller.can_access(form.server_id) {
        return Err(ApiError::forbidden("no access to this server"));
    }
    Ok(ok(state.tunnels.create(caller.user_id, &form).await?))
}

/// `PATCH /api/v1/tunnels/{id}`
pub async fn update(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<u64>,
    Json(form): Json<TunnelForm>,
) -> ApiResult {
    visible(&state, &caller, id).await?;
    if !caller.can_access(form.server_id) {
        return Err(ApiError::forbidden("no access to this server"));
    }
    Ok(ok(state.tunnels.update(id, &form).await?))
}

/// `POST /api/v1/tunnels/{id}/start`
pub async fn start(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<u64>,
) -> ApiResult {
    visible(&state, &caller, id).await?;
    Ok(ok(state.tunnels.start(id).await?))
}

/// `POST /api/v1/tunnels/{id}/stop`
pub async fn stop(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<u64>,
) -> ApiResult {
    visible(&state, &caller, id).await?;
    Ok(ok(state.tunnels.stop(id).await?))
}

/// `POST /api/v1/batch-delete/tunnels` with a JSON array of ids.
pub async fn batch_delete(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Json(ids): Json<Vec<u64>>,
) -> ApiResult {
    let mut allowed = Vec::with_capacity(ids.len());
    for id in ids {
        if visible(&state, &caller, id).await.is_ok() {
            allowed.push(id);
        }
    }
    let deleted = state.tunnels.delete_batch(&allowed).await?;
    Ok(ok(serde_json::json!({"deleted": deleted})))
}
