//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables**: `FLEETCTL_LISTEN`, `FLEETCTL_AGENT_SECRET`,
//!    `FLEETCTL_DASHBOARD_URL`, `FLEETCTL_SERVER_ID`, `FLEETCTL_AUDIT_TOKEN`
//! 2. **Config file**: path via `--config <path>`, or `fleetctl.toml` in CWD
//! 3. **Compiled defaults**: see each field's default value below
//!
//! The same file serves both the dashboard (`fleetctl serve`) and the agent
//! (`fleetctl agent`); each reads only the sections it needs.
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:8008"
//! data_dir = "/var/lib/fleetctl"
//! terminal_idle_timeout_secs = 300
//!
//! [auth]
//! agent_secret = "shared-agent-secret"
//!
//! [[auth.users]]
//! id = 1
//! username = "admin"
//! token = "admin-token"
//! admin = true
//!
//! [[auth.users]]
//! id = 2
//! username = "ops"
//! token = "ops-token"
//! servers = [3, 4]
//!
//! [audit]
//! recording_enabled = true
//! recording_servers = []      # empty = every server
//! retention_days = 90         # negative = keep forever
//!
//! [tunnel]
//! gateway_host = "tunnel@gw.example.com:2222"
//!
//! [agent]
//! dashboard_url = "https://dash.example.com"
//! server_id = 3
//! name = "edge-3"
//! secret = "shared-agent-secret"
//! audit_enabled = true
//!
//! [logging]
//! level = "info"
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
}

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub tunnel: TunnelConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Dashboard HTTP server and stream registry settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:8008`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Directory for persistent data (default `/var/lib/fleetctl`).
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// Where uploaded recordings are kept. Defaults to `<data_dir>/recordings`.
    pub recordings_dir: Option<String>,
    /// Idle bound for terminal streams, both waiting and pumping (default 300).
    #[serde(default = "default_terminal_idle_timeout")]
    pub terminal_idle_timeout_secs: u64,
    /// Keep-alive ping period on stream sockets (default 10).
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
    /// Streams that never start pumping are swept after this long (default 120).
    #[serde(default = "default_stream_max_pending")]
    pub stream_max_pending_secs: u64,
    /// Period of the stream and agent sweeps (default 30).
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    /// Agents silent for this long are evicted (default 90).
    #[serde(default = "default_agent_heartbeat_timeout")]
    pub agent_heartbeat_timeout_secs: u64,
}

impl ServerConfig {
    pub fn recordings_dir(&self) -> PathBuf {
        self.recordings_dir.as_ref().map_or_else(
            || Path::new(&self.data_dir).join("recordings"),
            PathBuf::from,
        )
    }

    pub fn store_path(&self) -> PathBuf {
        Path::new(&self.data_dir).join("fleetctl.json")
    }
}

/// Authentication settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    /// Secret agents present when connecting. Override with `FLEETCTL_AGENT_SECRET`.
    #[serde(default)]
    pub agent_secret: String,
    /// Dashboard users and their bearer tokens.
    #[serde(default)]
    pub users: Vec<UserConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserConfig {
    pub id: u64,
    pub username: String,
    pub token: String,
    #[serde(default)]
    pub admin: bool,
    /// Servers a non-admin user may access.
    #[serde(default)]
    pub servers: Vec<u64>,
}

/// Command audit and recording policy.
#[derive(Debug, Clone, Deserialize)]
pub struct AuditConfig {
    /// Record terminal sessions (default false).
    #[serde(default)]
    pub recording_enabled: bool,
    /// Restrict recording to these servers; empty means all.
    #[serde(default)]
    pub recording_servers: Vec<u64>,
    /// Days to keep sessions and commands. 0 means the default of 90,
    /// negative keeps forever.
    #[serde(default)]
    pub retention_days: i64,
    /// Agent-side timeout for command checks (default 10).
    #[serde(default = "default_check_timeout")]
    pub check_timeout_secs: u64,
}

impl AuditConfig {
    /// Effective retention in days; `None` keeps forever.
    pub fn retention(&self) -> Option<i64> {
        match self.retention_days {
            d if d < 0 => None,
            0 => Some(DEFAULT_RETENTION_DAYS),
            d => Some(d),
        }
    }

    pub fn recording_enabled_for(&self, server_id: u64) -> bool {
        self.recording_enabled
            && (self.recording_servers.is_empty() || self.recording_servers.contains(&server_id))
    }
}

pub const DEFAULT_RETENTION_DAYS: i64 = 90;

/// Parameters the dashboard hands to agents when starting a forward.
#[derive(Debug, Clone, Deserialize)]
pub struct TunnelConfig {
    /// Gateway the agent's ssh connects to, `user@host[:port]`.
    #[serde(default)]
    pub gateway_host: String,
    #[serde(default = "default_server_alive_interval")]
    pub server_alive_interval: u32,
    #[serde(default = "default_server_alive_count_max")]
    pub server_alive_count_max: u32,
}

impl TunnelConfig {
    /// Keep-alive options sent with every start.
    pub fn ssh_options(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (
                "ServerAliveInterval".to_string(),
                self.server_alive_interval.to_string(),
            ),
            (
                "ServerAliveCountMax".to_string(),
                self.server_alive_count_max.to_string(),
            ),
        ])
    }
}

/// Agent daemon settings (`fleetctl agent`).
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Dashboard base URL (`http(s)://host[:port]`). Override with `FLEETCTL_DASHBOARD_URL`.
    #[serde(default)]
    pub dashboard_url: String,
    /// This host's server id. Override with `FLEETCTL_SERVER_ID`.
    #[serde(default)]
    pub server_id: u64,
    #[serde(default = "default_agent_name")]
    pub name: String,
    /// Must match the dashboard's `auth.agent_secret`.
    #[serde(default)]
    pub secret: String,
    /// Initial reconnect backoff (default 5).
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
    /// Max reconnect backoff (default 60).
    #[serde(default = "default_reconnect_max_delay")]
    pub reconnect_max_delay_secs: u64,
    /// Keepalive period on the task channel (default 30).
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    /// Run shells through the audit wrapper (default false).
    #[serde(default)]
    pub audit_enabled: bool,
    /// Where command checks go; defaults to `dashboard_url`.
    pub audit_dashboard_url: Option<String>,
    /// Bearer token for audit calls; defaults to `secret`. Override with `FLEETCTL_AUDIT_TOKEN`.
    pub audit_token: Option<String>,
    /// Timeout for audit calls (default 10).
    #[serde(default = "default_check_timeout")]
    pub audit_timeout_secs: u64,
    /// Local scratch directory for recordings awaiting upload.
    #[serde(default = "default_agent_recordings_dir")]
    pub recordings_dir: String,
    /// Shell for terminals; `$SHELL` or a probed default when unset.
    pub shell: Option<String>,
    /// Working directory for terminals (default `$HOME`, else `/`).
    pub working_dir: Option<String>,
    /// ssh binary used for forwards (default `ssh`).
    #[serde(default = "default_ssh_binary")]
    pub ssh_binary: String,
}

impl AgentConfig {
    pub fn audit_url(&self) -> &str {
        self.audit_dashboard_url
            .as_deref()
            .filter(|u| !u.is_empty())
            .unwrap_or(&self.dashboard_url)
    }

    pub fn audit_token(&self) -> &str {
        self.audit_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .unwrap_or(&self.secret)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "0.0.0.0:8008".to_string()
}
fn default_data_dir() -> String {
    "/var/lib/fleetctl".to_string()
}
fn default_terminal_idle_timeout() -> u64 {
    300
}
fn default_ping_interval() -> u64 {
    10
}
fn default_stream_max_pending() -> u64 {
    120
}
fn default_sweep_interval() -> u64 {
    30
}
fn default_agent_heartbeat_timeout() -> u64 {
    90
}
fn default_check_timeout() -> u64 {
    10
}
fn default_server_alive_interval() -> u32 {
    30
}
fn default_server_alive_count_max() -> u32 {
    3
}
fn default_agent_name() -> String {
    "fleetctl-agent".to_string()
}
fn default_reconnect_delay() -> u64 {
    5
}
fn default_reconnect_max_delay() -> u64 {
    60
}
fn default_heartbeat_interval() -> u64 {
    30
}
fn default_agent_recordings_dir() -> String {
    std::env::temp_dir()
        .join("fleetctl-recordings")
        .to_string_lossy()
        .into_owned()
}
fn default_ssh_binary() -> String {
    "ssh".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            data_dir: default_data_dir(),
            recordings_dir: None,
            terminal_idle_timeout_secs: default_terminal_idle_timeout(),
            ping_interval_secs: default_ping_interval(),
            stream_max_pending_secs: default_stream_max_pending(),
            sweep_interval_secs: default_sweep_interval(),
            agent_heartbeat_timeout_secs: default_agent_heartbeat_timeout(),
        }
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            recording_enabled: false,
            recording_servers: Vec::new(),
            retention_days: 0,
            check_timeout_secs: default_check_timeout(),
        }
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            gateway_host: String::new(),
            server_alive_interval: default_server_alive_interval(),
            server_alive_count_max: default_server_alive_count_max(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            dashboard_url: String::new(),
            server_id: 0,
            name: default_agent_name(),
            secret: String::new(),
            reconnect_delay_secs: default_reconnect_delay(),
            reconnect_max_delay_secs: default_reconnect_max_delay(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            audit_enabled: false,
            audit_dashboard_url: None,
            audit_token: None,
            audit_timeout_secs: default_check_timeout(),
            recordings_dir: default_agent_recordings_dir(),
            shell: None,
            working_dir: None,
            ssh_binary: default_ssh_binary(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some` the file must exist. Otherwise `fleetctl.toml` in
    /// the current directory is used when present.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new("fleetctl.toml").exists() => Self::from_file("fleetctl.toml")?,
            None => Config::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Self::parse(&content).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(listen) = var("FLEETCTL_LISTEN") {
            self.server.listen = listen;
        }
        if let Some(secret) = var("FLEETCTL_AGENT_SECRET") {
            self.auth.agent_secret.clone_from(&secret);
            self.agent.secret = secret;
        }
        if let Some(url) = var("FLEETCTL_DASHBOARD_URL") {
            self.agent.dashboard_url = url;
        }
        if let Some(id) = var("FLEETCTL_SERVER_ID").and_then(|v| v.parse().ok()) {
            self.agent.server_id = id;
        }
        if let Some(token) = var("FLEETCTL_AUDIT_TOKEN") {
            self.agent.audit_token = Some(token);
        }
    }
}
