//! HTTP error mapping.
//!
//! Handlers return `Result<_, ApiError>`. Domain errors convert through the
//! `From` impls below; the response body is always
//! `{"success": false, "error": "<message>"}`.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, error};

use crate::audit::AuditError;
use crate::store::StoreError;
use crate::streams::StreamError;
use crate::task::DispatchError;
use crate::tunnels::TunnelError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    BadGateway(String),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::BadGateway(_) => StatusCode::BAD_GATEWAY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = self.to_string();
        if status.is_server_error() {
            error!(status = status.as_u16(), "API error: {message}");
        } else {
            debug!(status = status.as_u16(), "Client error: {message}");
        }
        (status, Json(json!({"success": false, "error": message}))).into_response()
    }
}

/// `{"success": true, "data": ...}`
pub fn ok<T: Serialize>(data: T) -> Json<serde_json::Value> {
    Json(json!({"success": true, "data": data}))
}

pub type ApiResult<T = Json<serde_json::Value>> = Result<T, ApiError>;

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(_) => Self::NotFound(err.to_string()),
            StoreError::Backend(_) => Self::Internal(err.to_string()),
        }
    }
}

impl From<DispatchError> for ApiError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::Unreachable(_) => Self::BadGateway(err.to_string()),
            DispatchError::Encode(_) => Self::Internal(err.to_string()),
        }
    }
}

impl From<StreamError> for ApiError {
    fn from(err: StreamError) -> Self {
        match err {
            StreamError::NotFound => Self::NotFound(err.to_string()),
            StreamError::DuplicateId
            | StreamError::AlreadyAttached(_)
            | StreamError::AlreadyStarted => Self::Conflict(err.to_string()),
            StreamError::Timeout | StreamError::Closed | StreamError::TransportClosed => {
                Self::Internal(err.to_string())
            }
        }
    }
}

impl From<TunnelError> for ApiError {
    fn from(err: TunnelError) -> Self {
        match err {
            TunnelError::NotFound(_) => Self::NotFound(err.to_string()),
            TunnelError::Conflict { .. } => Self::Conflict(err.to_string()),
            TunnelError::Invalid(_) => Self::BadRequest(err.to_string()),
            TunnelError::Dispatch(e) => e.into(),
            TunnelError::Store(e) => e.into(),
        }
    }
}

impl From<AuditError> for ApiError {
    fn from(err: AuditError) -> Self {
        match err {
            AuditError::NotFound(_) => Self::NotFound(err.to_string()),
            AuditError::InvalidPattern(_) | AuditError::Invalid(_) => {
                Self::BadRequest(err.to_string())
            }
            AuditError::Store(e) => e.into(),
            AuditError::Io(_) => Self::Internal(err.to_string()),
        }
    }
}
