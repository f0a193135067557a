//! HTTP client for the dashboard's audit endpoints.
//!
//! [`AuditClient`] wraps `reqwest::Client` with typed methods for
//! `check-command`, `record-command` and `upload-recording`. All calls
//! authenticate with the agent's bearer token.
//!
//! ## Error handling
//!
//! Non-2xx responses are parsed for an `error` field in the JSON body. If
//! parsing fails, the raw response body is returned as the error message.
//! Callers on the interactive path use the fail-open wrappers, which never
//! return an error.

use std::path::Path;
use std::time::Duration;

use base64::Engine;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::task::{CommandCheckRequest, CommandCheckResponse, CommandRecordRequest, RecordingUpload};

/// Errors returned by [`AuditClient`] methods.
#[derive(Debug, Error)]
pub enum ClientError {
    /// HTTP transport error (connection refused, timeout, DNS failure, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),
    /// The dashboard returned a non-2xx HTTP status.
    #[error("Dashboard error (HTTP {status}): {message}")]
    Dashboard { status: u16, message: String },
    /// The response body was not the expected JSON.
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("recording io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Cheap to clone; clones share the connection pool.
#[derive(Clone)]
pub struct AuditClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl AuditClient {
    pub fn new(base_url: &str, token: &str, timeout: Duration) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            http,
            // Strip trailing slash for consistent URL construction
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `POST /api/v1/terminal/check-command`
    pub async fn check_command(
        &self,
        req: &CommandCheckRequest,
    ) -> Result<CommandCheckResponse, ClientError> {
        self.post("/api/v1/terminal/check-command", req).await
    }

    /// Like [`check_command`](Self::check_command), but any failure allows the command.
    pub async fn check_command_fail_open(&self, req: &CommandCheckRequest) -> CommandCheckResponse {
        match self.check_command(req).await {
            Ok(resp) => resp,
            Err(e) => {
                warn!(stream_id = %req.stream_id, "Command check failed, allowing: {e}");
                CommandCheckResponse::allow()
            }
        }
    }

    /// `POST /api/v1/terminal/record-command`
    pub async fn record_command(&self, req: &CommandRecordRequest) -> Result<(), ClientError> {
        self.post::<_, serde_json::Value>("/api/v1/terminal/record-command", req)
            .await
            .map(|_| ())
    }

    /// Send a record from a detached task. Failures are logged at debug and dropped.
    pub fn record_command_detached(&self, req: CommandRecordRequest) {
        let client = self.clone();
        tokio::spawn(async move {
            if let Err(e) = client.record_command(&req).await {
                debug!(stream_id = %req.stream_id, "Command record dropped: {e}");
            }
        });
    }

    /// `POST /api/v1/terminal/upload-recording`. Deletes the file once the
    /// dashboard accepts it; on failure the file stays where it is.
    pub async fn upload_recording(&self, stream_id: &str, path: &Path) -> Result<(), ClientError> {
        let bytes = tokio::fs::read(path).await?;
        let upload = RecordingUpload {
            stream_id: stream_id.to_string(),
            data: base64::engine::general_purpose::STANDARD.encode(&bytes),
        };
        self.post::<_, serde_json::Value>("/api/v1/terminal/upload-recording", &upload)
            .await?;
        tokio::fs::remove_file(path).await?;
        info!(stream_id, "Uploaded recording ({} bytes)", bytes.len());
        Ok(())
    }

    async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ClientError> {
        let resp = self
            .http
            .post(format!("{}{path}", self.base_url))
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await?;
        Self::handle_response(resp).await
    }

    /// Unwrap `{"success": true, "data": ...}` or turn the failure into a [`ClientError`].
    async fn handle_response<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, ClientError> {
        let status = resp.status();
        let body = resp.text().await?;

        if status.is_success() {
            let mut value: serde_json::Value = serde_json::from_str(&body)
                .map_err(|e| ClientError::Protocol(format!("Invalid JSON from dashboard: {e}")))?;
            serde_json::from_value(value["data"].take())
                .map_err(|e| ClientError::Protocol(format!("Unexpected response shape: {e}")))
        } else {
            let message = serde_json::from_str::<serde_json::Value>(&body)
                .ok()
                .and_then(|v| v["error"].as_str().map(String::from))
                .unwrap_or(body);
            Err(ClientError::Dashboard {
                status: status.as_u16(),
                message,
            })
        }
    }
}
