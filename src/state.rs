//! Shared application state passed to every handler via Axum's `State` extractor.

use std::sync::Arc;
use std::time::Instant;

use crate::audit::AuditService;
use crate::auth::Accounts;
use crate::config::Config;
use crate::hub::AgentHub;
use crate::store::Store;
use crate::streams::StreamRegistry;
use crate::tunnels::{TunnelError, TunnelService};

/// Shared application state for the dashboard.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
    pub store: Arc<dyn Store>,
    /// Live agent task channels.
    pub hub: AgentHub,
    /// Terminal stream rendezvous.
    pub streams: StreamRegistry,
    pub tunnels: TunnelService,
    pub audit: AuditService,
    /// Token table for the auth middlewares.
    pub accounts: Arc<Accounts>,
}

impl AppState {
    /// Wire the services together over `store`. Needs a tokio runtime.
    pub async fn build(config: Config, store: Arc<dyn Store>) -> Result<Self, TunnelError> {
        let hub = AgentHub::new(config.server.agent_heartbeat_timeout_secs);
        let tunnels = TunnelService::load(
            Arc::clone(&store),
            Arc::new(hub.clone()),
            config.tunnel.clone(),
        )
        .await?;
        let audit = AuditService::new(
            Arc::clone(&store),
            config.audit.clone(),
            config.server.recordings_dir(),
        );
        let accounts = Arc::new(Accounts::from_config(&config.auth));
        Ok(Self {
            config: Arc::new(config),
            start_time: Instant::now(),
            store,
            hub,
            streams: StreamRegistry::new(),
            tunnels,
            audit,
            accounts,
        })
    }
}
