//! Loopback audit relay.
//!
//! The shell wrapper inside an audited terminal calls this relay instead of
//! the dashboard, so the shell never holds dashboard credentials. The relay
//! listens on `127.0.0.1` with an ephemeral port and forwards through
//! [`AuditClient`]:
//!
//! - `POST /check-command` → `{"success": true, "data": {blocked, reason, action}}`
//! - `POST /record-command` → `{"success": true}` immediately; the record is
//!   sent from a detached task.

use std::net::SocketAddr;

use axum::{extract::State, routing::post, Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::client::AuditClient;
use crate::task::{CommandCheckRequest, CommandRecordRequest};

/// A running relay. The listener stops when the shutdown token fires.
pub struct AuditRelay {
    addr: SocketAddr,
    task: JoinHandle<()>,
}

impl AuditRelay {
    /// Bind `127.0.0.1:0` and serve until `shutdown` is cancelled.
    pub async fn start(client: AuditClient, shutdown: CancellationToken) -> std::io::Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let addr = listener.local_addr()?;
        let app = router(client);
        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await
            {
                warn!("Audit relay stopped: {e}");
            }
        });
        info!("Audit relay listening on {addr}");
        Ok(Self { addr, task })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Base URL handed to shells as `FLEETCTL_AUDIT_URL`.
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

fn router(client: AuditClient) -> Router {
    Router::new()
        .route("/check-command", post(check_command))
        .route("/record-command", post(record_command))
        .with_state(client)
}

async fn check_command(
    State(client): State<AuditClient>,
    Json(req): Json<CommandCheckRequest>,
) -> Json<Value> {
    let resp = client.check_command_fail_open(&req).await;
    Json(json!({"success": true, "data": resp}))
}

async fn record_command(
    State(client): State<AuditClient>,
    Json(req): Json<CommandRecordRequest>,
) -> Json<Value> {
    client.record_command_detached(req);
    Json(json!({"success": true}))
}
