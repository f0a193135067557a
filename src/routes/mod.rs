//! HTTP route handlers and router assembly.
//!
//! Three groups, each behind its own auth layer:
//!
//! - public: [`health`]
//! - user: terminal open/attach, agent listing, tunnels, audit browsing and
//!   blacklist management ([`crate::auth::require_user`])
//! - agent: the task channel, stream sub-sockets and the audit calls agents
//!   make ([`crate::auth::require_agent`])

pub mod agents;
pub mod audit;
pub mod health;
pub mod terminal;
pub mod tunnels;

use axum::{
    middleware,
    routing::{get, patch, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::auth::{require_agent, require_user};
use crate::AppState;

/// Build the dashboard router with state applied.
pub fn router(state: AppState) -> Router {
    let public_routes = Router::new().route("/api/health", get(health::health));

    let user_routes = Router::new()
        .route("/api/terminal", post(terminal::open_terminal))
        .route("/ws/terminal/{stream_id}", get(terminal::terminal_ws))
        .route("/api/agents", get(agents::list_agents))
        .route("/api/v1/tunnels", get(tunnels::list).post(tunnels::create))
        .route("/api/v1/tunnels/{id}", patch(tunnels::update))
        .route("/api/v1/tunnels/{id}/start", post(tunnels::start))
        .route("/api/v1/tunnels/{id}/stop", post(tunnels::stop))
        .route("/api/v1/batch-delete/tunnels", post(tunnels::batch_delete))
        .route("/api/v1/terminal/sessions", get(audit::list_sessions))
        .route("/api/v1/terminal/commands", get(audit::list_commands))
        .route("/api/v1/terminal/recording/{session_id}", get(audit::recording))
        .route(
            "/api/v1/terminal/recording-url/{session_id}",
            get(audit::recording_url),
        )
        .route(
            "/api/v1/terminal/blacklist",
            get(audit::list_rules).post(audit::create_rule),
        )
        .route(
            "/api/v1/terminal/blacklist/{id}",
            patch(audit::update_rule).delete(audit::delete_rule),
        )
        .layer(middleware::from_fn_with_state(
            state.accounts.clone(),
            require_user,
        ));

    let agent_routes = Router::new()
        .route("/api/agent/connect", get(agents::agent_connect))
        .route("/api/agent/stream/{stream_id}", get(agents::agent_stream))
        .route("/api/v1/terminal/check-command", post(audit::check_command))
        .route("/api/v1/terminal/record-command", post(audit::record_command))
        .route(
            "/api/v1/terminal/upload-recording",
            post(audit::upload_recording),
        )
        .layer(middleware::from_fn_with_state(
            state.accounts.clone(),
            require_agent,
        ));

    Router::new()
        .merge(public_routes)
        .merge(user_routes)
        .merge(agent_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
