#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # fleetctl
//!
//! Control plane for a fleet of Linux hosts. One binary, three roles:
//!
//! - `fleetctl serve`: the dashboard. Holds each agent's task channel,
//!   pairs browser terminals with agent sub-streams, manages port-forward
//!   tunnels and keeps the command audit trail.
//! - `fleetctl agent`: runs on a managed host. Dials the dashboard, serves
//!   terminals on local PTYs and supervises `ssh` forwards.
//! - `fleetctl replay FILE`: plays a terminal recording to stdout.
//!
//! ## API surface (dashboard)
//!
//! | Method | Path                                      | Auth  | Description                      |
//! |--------|-------------------------------------------|-------|----------------------------------|
//! | GET    | `/api/health`                             | No    | Liveness probe                   |
//! | POST   | `/api/terminal`                           | User  | Open a terminal on a server      |
//! | GET    | `/ws/terminal/{id}`                       | User* | Browser side of a terminal       |
//! | GET    | `/api/agents`                             | User  | Connected agents                 |
//! | GET    | `/api/v1/tunnels`                         | User  | List port mappings               |
//! | POST   | `/api/v1/tunnels`                         | User  | Create a mapping                 |
//! | PATCH  | `/api/v1/tunnels/{id}`                    | User  | Edit a mapping                   |
//! | POST   | `/api/v1/tunnels/{id}/start`              | User  | Start a forward                  |
//! | POST   | `/api/v1/tunnels/{id}/stop`               | User  | Stop a forward                   |
//! | POST   | `/api/v1/batch-delete/tunnels`            | User  | Delete mappings                  |
//! | GET    | `/api/v1/terminal/sessions`               | User  | Audited terminal sessions        |
//! | GET    | `/api/v1/terminal/commands`               | User  | Audited commands                 |
//! | GET    | `/api/v1/terminal/recording/{id}`         | User  | Download a recording             |
//! | GET    | `/api/v1/terminal/recording-url/{id}`     | User  | Recording download URL           |
//! | *      | `/api/v1/terminal/blacklist[/{id}]`       | User  | Blacklist rules (writes: admin)  |
//! | GET    | `/api/agent/connect`                      | Agent*| Agent task channel               |
//! | GET    | `/api/agent/stream/{id}`                  | Agent*| Agent side of a terminal         |
//! | POST   | `/api/v1/terminal/check-command`          | Agent | Pre-execution command check      |
//! | POST   | `/api/v1/terminal/record-command`         | Agent | Post-execution command record    |
//! | POST   | `/api/v1/terminal/upload-recording`       | Agent | Finished recording upload        |
//!
//! *WebSocket auth is via `?token=` (no `Authorization` header during the
//! upgrade handshake).

use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

use fleetctl::audit::until_next_purge;
use fleetctl::config::{Config, LoggingConfig};
use fleetctl::recording::{EventKind, RecordingReader};
use fleetctl::store::MemoryStore;
use fleetctl::{agent, routes, AppState};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Fleet control plane: dashboard, agent and recording player.
#[derive(Parser)]
#[command(name = "fleetctl", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the dashboard.
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
    /// Run the agent on a managed host.
    Agent {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
    /// Play a recording to stdout with its original timing.
    Replay {
        /// A `.cast.gz` recording.
        file: String,
        /// Playback speed multiplier.
        #[arg(long, default_value_t = 1.0)]
        speed: f64,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Serve { config } => match load_config(config.as_deref()) {
            Ok(config) => run_server(config).await,
            Err(e) => Err(e),
        },
        Commands::Agent { config } => match load_config(config.as_deref()) {
            Ok(config) => run_agent(config).await,
            Err(e) => Err(e),
        },
        Commands::Replay { file, speed } => replay(Path::new(&file), speed).await,
    };

    if let Err(e) = result {
        error!("{e}");
        eprintln!("fleetctl: {e}");
        std::process::exit(1);
    }
}

fn load_config(path: Option<&str>) -> Result<Config, BoxError> {
    let config = Config::load(path)?;
    init_tracing(&config.logging);
    Ok(config)
}

fn init_tracing(logging: &LoggingConfig) {
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = ctrl_c => info!("Received SIGINT"),
                _ = sigterm.recv() => info!("Received SIGTERM"),
            }
        }
        Err(e) => {
            warn!("Failed to register SIGTERM handler: {e}");
            let _ = ctrl_c.await;
            info!("Received SIGINT");
        }
    }
}

async fn run_server(config: Config) -> Result<(), BoxError> {
    info!("fleetctl v{} starting", env!("CARGO_PKG_VERSION"));
    if config.auth.agent_secret.is_empty() {
        warn!("auth.agent_secret is empty; no agent will be able to connect");
    }
    if config.auth.users.is_empty() {
        warn!("No [[auth.users]] configured; user endpoints will reject every token");
    }

    let store = MemoryStore::open(&config.server.store_path()).await?;
    let state = AppState::build(config, Arc::new(store)).await?;
    let server = &state.config.server;

    let app = routes::router(state.clone()).layer(CorsLayer::permissive());
    let listener = TcpListener::bind(&server.listen).await?;
    info!("Listening on {}", server.listen);

    // Periodic sweep: pending streams nobody opened, and silent agents
    let sweep_state = state.clone();
    let sweep_task = tokio::spawn(async move {
        let period = Duration::from_secs(sweep_state.config.server.sweep_interval_secs.max(1));
        let max_pending = Duration::from_secs(sweep_state.config.server.stream_max_pending_secs);
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            for stream_id in sweep_state.streams.sweep_pending(max_pending).await {
                if let Err(e) = sweep_state.audit.seal_session(&stream_id).await {
                    warn!(stream_id = %stream_id, "Failed to seal swept session: {e}");
                }
            }
            sweep_state.hub.sweep_dead_agents().await;
        }
    });

    // Daily retention purge at PURGE_HOUR local time
    let audit = state.audit.clone();
    let retention_task = tokio::spawn(async move {
        loop {
            tokio::time::sleep(until_next_purge()).await;
            if let Err(e) = audit.purge_expired(Utc::now()).await {
                warn!("Retention purge failed: {e}");
            }
        }
    });

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down...");
    sweep_task.abort();
    retention_task.abort();
    state.hub.disconnect_all().await;
    info!("Goodbye");
    Ok(())
}

async fn run_agent(config: Config) -> Result<(), BoxError> {
    info!(
        "fleetctl agent v{} starting (server {})",
        env!("CARGO_PKG_VERSION"),
        config.agent.server_id
    );
    let shutdown = CancellationToken::new();
    let mut agent = tokio::spawn(agent::run(config.agent, shutdown.clone()));
    tokio::select! {
        () = shutdown_signal() => {
            shutdown.cancel();
            (&mut agent).await??;
        }
        result = &mut agent => result??,
    }
    Ok(())
}

async fn replay(path: &Path, speed: f64) -> Result<(), BoxError> {
    if !(speed.is_finite() && speed > 0.0) {
        return Err("--speed must be a positive number".into());
    }
    let reader = RecordingReader::open(path)?;
    let mut stdout = std::io::stdout().lock();
    let mut last = 0.0_f64;
    for event in reader {
        let event = event?;
        if event.kind != EventKind::Output {
            continue;
        }
        let gap = (event.elapsed - last).max(0.0) / speed;
        last = event.elapsed;
        if gap > 0.0 {
            stdout.flush()?;
            tokio::time::sleep(Duration::from_secs_f64(gap)).await;
        }
        stdout.write_all(event.data.as_bytes())?;
    }
    stdout.flush()?;
    Ok(())
}
