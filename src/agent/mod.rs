//! Agent daemon (`fleetctl agent`).
//!
//! Keeps one outbound WebSocket to the dashboard's task channel with
//! exponential-backoff reconnect and a keepalive heartbeat. Tasks arriving on
//! the channel fan out to:
//!
//! - [`terminal`]: one sub-stream WebSocket plus PTY per terminal task
//! - [`forward`]: one supervised `ssh` child per started mapping
//!
//! When `audit_enabled` is set, a loopback [`audit::AuditRelay`] is started
//! and bash terminals load the audit hook from [`audit::wrapper`].

pub mod audit;
pub mod forward;
pub mod terminal;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use reqwest::Url;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use self::audit::{wrapper, AuditClient, AuditRelay, ClientError};
use self::forward::ForwardSupervisor;
use crate::config::AgentConfig;
use crate::task::{Task, TaskEnvelope, TaskKind};

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("invalid agent config: {0}")]
    Config(String),
    #[error(transparent)]
    Audit(#[from] ClientError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything a spawned terminal needs. Cheap to clone.
#[derive(Clone)]
pub struct AgentContext {
    pub config: Arc<AgentConfig>,
    pub audit: AuditClient,
    /// Loopback relay URL handed to audited shells.
    pub relay_url: Option<String>,
    /// Installed hook script for bash.
    pub wrapper: Option<PathBuf>,
}

impl AgentContext {
    /// `ws(s)://…/api/agent/connect?server_id=&name=&token=`
    pub fn connect_url(&self) -> Result<Url, AgentError> {
        ws_url(
            &self.config.dashboard_url,
            "/api/agent/connect",
            &[
                ("server_id", self.config.server_id.to_string()),
                ("name", self.config.name.clone()),
                ("token", self.config.secret.clone()),
            ],
        )
    }

    /// `ws(s)://…/api/agent/stream/{id}?server_id=&token=`
    pub fn stream_url(&self, stream_id: &str) -> Result<Url, AgentError> {
        ws_url(
            &self.config.dashboard_url,
            &format!("/api/agent/stream/{stream_id}"),
            &[
                ("server_id", self.config.server_id.to_string()),
                ("token", self.config.secret.clone()),
            ],
        )
    }
}

/// Turn the dashboard's HTTP base URL into a WebSocket URL for `path`.
fn ws_url(base: &str, path: &str, query: &[(&str, String)]) -> Result<Url, AgentError> {
    let mut url = Url::parse(base)
        .map_err(|e| AgentError::Config(format!("dashboard_url {base:?}: {e}")))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(AgentError::Config(format!(
                "dashboard_url scheme {other:?} is not http(s)"
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|()| AgentError::Config(format!("cannot use {scheme} for {base:?}")))?;
    let prefix = url.path().trim_end_matches('/').to_string();
    url.set_path(&format!("{prefix}{path}"));
    url.query_pairs_mut()
        .clear()
        .extend_pairs(query.iter().map(|(k, v)| (*k, v.as_str())));
    Ok(url)
}

/// Run the agent until `shutdown` fires.
pub async fn run(config: AgentConfig, shutdown: CancellationToken) -> Result<(), AgentError> {
    if config.dashboard_url.is_empty() {
        return Err(AgentError::Config("agent.dashboard_url is required".into()));
    }
    if config.server_id == 0 {
        return Err(AgentError::Config("agent.server_id is required".into()));
    }
    let config = Arc::new(config);
    let audit = AuditClient::new(
        config.audit_url(),
        config.audit_token(),
        Duration::from_secs(config.audit_timeout_secs),
    )?;

    let (relay, hook) = if config.audit_enabled {
        let relay = AuditRelay::start(audit.clone(), shutdown.clone()).await?;
        let hook = wrapper::install(&std::env::temp_dir())?;
        info!("Command audit enabled (hook {})", hook.display());
        (Some(relay), Some(hook))
    } else {
        (None, None)
    };

    let ctx = AgentContext {
        config: config.clone(),
        audit,
        relay_url: relay.as_ref().map(AuditRelay::url),
        wrapper: hook.clone(),
    };
    ctx.connect_url()?;

    let (reports_tx, mut reports_rx) = mpsc::channel(64);
    let forwards = ForwardSupervisor::new(&config.ssh_binary, reports_tx);

    let initial_delay = Duration::from_secs(config.reconnect_delay_secs);
    let max_delay = Duration::from_secs(config.reconnect_max_delay_secs);
    let mut delay = initial_delay;

    loop {
        info!("Connecting to dashboard at {}", config.dashboard_url);
        match connect_and_run(&ctx, &forwards, &mut reports_rx, &shutdown).await {
            Ok(Disconnect::Shutdown) => break,
            Ok(Disconnect::Clean) => {
                info!("Task channel closed, reconnecting...");
                delay = initial_delay;
            }
            Err(e) => {
                warn!("Task channel error: {e}, reconnecting in {}s", delay.as_secs());
            }
        }
        let running = forwards.running().await;
        if !running.is_empty() {
            info!("Keeping {} forwards up across reconnect: {running:?}", running.len());
        }
        if relay.as_ref().is_some_and(|r| !r.is_running()) {
            warn!("Audit relay is down; audited shells will fail open");
        }
        tokio::select! {
            () = shutdown.cancelled() => break,
            () = tokio::time::sleep(delay) => {}
        }
        delay = (delay * 2).min(max_delay);
    }

    forwards.stop_all().await;
    if let Some(hook) = hook {
        let _ = std::fs::remove_file(hook);
    }
    info!("Agent stopped");
    Ok(())
}

/// Why a channel connection ended without error.
enum Disconnect {
    /// Close frame or EOF from the dashboard.
    Clean,
    /// Local shutdown; do not reconnect.
    Shutdown,
}

async fn connect_and_run(
    ctx: &AgentContext,
    forwards: &ForwardSupervisor,
    reports: &mut mpsc::Receiver<TaskEnvelope>,
    shutdown: &CancellationToken,
) -> Result<Disconnect, Box<dyn std::error::Error + Send + Sync>> {
    let url = ctx.connect_url()?;
    let (ws, _response) = tokio_tungstenite::connect_async(url.as_str()).await?;
    let (mut sink, mut stream) = ws.split();
    info!("Connected to dashboard as server {}", ctx.config.server_id);

    let period = Duration::from_secs(ctx.config.heartbeat_interval_secs.max(1));
    let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

    loop {
        tokio::select! {
            msg = stream.next() => {
                let Some(msg) = msg else { return Ok(Disconnect::Clean) };
                match msg? {
                    Message::Text(text) => handle_task(ctx, forwards, text.as_str()).await,
                    Message::Close(_) => return Ok(Disconnect::Clean),
                    _ => {}
                }
            }
            Some(report) = reports.recv() => {
                sink.send(Message::Text(report.to_json().into())).await?;
            }
            _ = heartbeat.tick() => {
                let keepalive = TaskEnvelope::empty(TaskKind::Keepalive);
                sink.send(Message::Text(keepalive.to_json().into())).await?;
            }
            () = shutdown.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                return Ok(Disconnect::Shutdown);
            }
        }
    }
}

async fn handle_task(ctx: &AgentContext, forwards: &ForwardSupervisor, text: &str) {
    let envelope = match TaskEnvelope::from_json(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!("Malformed envelope on task channel: {e}");
            return;
        }
    };
    match Task::decode(&envelope) {
        Ok(Task::TerminalStream(task)) => {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                let stream_id = task.stream_id.clone();
                if let Err(e) = terminal::run(ctx, task).await {
                    warn!(stream_id = %stream_id, "Terminal failed: {e}");
                }
            });
        }
        Ok(Task::Tunnel(task)) => forwards.handle(task).await,
        Ok(Task::CommandCheckReply(reply)) => {
            debug!(request_id = %reply.request_id, blocked = reply.response.blocked, "Command check reply");
        }
        Ok(Task::RecordingUploadReply(reply)) => {
            if reply.success {
                debug!(stream_id = %reply.stream_id, "Recording upload acknowledged");
            } else {
                warn!(stream_id = %reply.stream_id, "Recording upload rejected: {:?}", reply.error);
            }
        }
        Ok(Task::Unknown(kind)) => debug!("Ignoring task kind {kind}"),
        Err(e) => warn!("Bad payload for task kind {}: {e}", envelope.kind),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{TunnelAction, TunnelStatusReport, TunnelTask};
    use crate::tunnels::model::TunnelStatus;
    use axum::extract::ws::{Message as AxumMessage, WebSocketUpgrade};
    use axum::{routing::get, Router};

    fn ctx(base: &str) -> AgentContext {
        let config = AgentConfig {
            dashboard_url: base.to_string(),
            server_id: 3,
            name: "edge 3".into(),
            secret: "s&cret".into(),
            ..AgentConfig::default()
        };
        AgentContext {
            audit: AuditClient::new(base, "t", Duration::from_secs(1)).unwrap(),
            config: Arc::new(config),
            relay_url: None,
            wrapper: None,
        }
    }

    #[test]
    fn connect_url_maps_scheme_and_encodes_query() {
        let url = ctx("https://dash.example.com").connect_url().unwrap();
        assert_eq!(
            url.as_str(),
            "wss://dash.example.com/api/agent/connect?server_id=3&name=edge+3&token=s%26cret"
        );
        let url = ctx("http://10.0.0.1:8008/").connect_url().unwrap();
        assert!(url.as_str().starts_with("ws://10.0.0.1:8008/api/agent/connect?"));
    }

    #[test]
    fn stream_url_keeps_base_path() {
        let url = ctx("http://host/fleet").stream_url("abc").unwrap();
        assert_eq!(url.as_str(), "ws://host/fleet/api/agent/stream/abc?server_id=3&token=s%26cret");
    }

    #[test]
    fn non_http_dashboard_is_rejected() {
        assert!(matches!(ctx("ftp://host").connect_url(), Err(AgentError::Config(_))));
    }

    #[tokio::test]
    async fn missing_server_id_fails_fast() {
        let config = AgentConfig {
            dashboard_url: "http://127.0.0.1:1".into(),
            ..AgentConfig::default()
        };
        assert!(matches!(
            run(config, CancellationToken::new()).await,
            Err(AgentError::Config(_))
        ));
    }

    #[tokio::test]
    async fn channel_answers_tunnel_status_and_sends_keepalives() {
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel::<TaskEnvelope>();
        let app = Router::new().route(
            "/api/agent/connect",
            get(move |ws: WebSocketUpgrade| {
                let seen = seen_tx.clone();
                async move {
                    ws.on_upgrade(move |mut socket| async move {
                        let task = TaskEnvelope::new(
                            TaskKind::Tunnel,
                            &TunnelTask {
                                action: TunnelAction::Status,
                                ..TunnelTask::stop(5)
                            },
                        )
                        .unwrap();
                        socket.send(AxumMessage::Text(task.to_json().into())).await.unwrap();
                        while let Some(Ok(msg)) = socket.recv().await {
                            if let AxumMessage::Text(text) = msg {
                                let _ = seen.send(TaskEnvelope::from_json(text.as_str()).unwrap());
                            }
                        }
                    })
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let config = AgentConfig {
            dashboard_url: format!("http://{addr}"),
            server_id: 5,
            secret: "s".into(),
            heartbeat_interval_secs: 1,
            ..AgentConfig::default()
        };
        let shutdown = CancellationToken::new();
        let agent = tokio::spawn(run(config, shutdown.clone()));

        let (mut status, mut keepalive) = (None, false);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while status.is_none() || !keepalive {
            let env = tokio::time::timeout_at(deadline, seen_rx.recv())
                .await
                .unwrap()
                .unwrap();
            if env.kind == TaskKind::Keepalive.code() {
                keepalive = true;
            } else if env.kind == TaskKind::TunnelStatus.code() {
                status = Some(serde_json::from_str::<TunnelStatusReport>(&env.data).unwrap());
            }
        }
        let status = status.unwrap();
        assert_eq!((status.mapping_id, status.status), (5, TunnelStatus::Stopped));

        shutdown.cancel();
        agent.await.unwrap().unwrap();
    }
}
