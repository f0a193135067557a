//! Bearer-token authentication.
//!
//! Two kinds of caller reach the dashboard:
//!
//! - **Users** present a per-user token from `[[auth.users]]`. The
//!   [`require_user`] middleware resolves it to a [`Caller`] and stores it as a
//!   request extension.
//! - **Agents** present the shared `auth.agent_secret` ([`require_agent`]).
//!
//! Tokens come from `Authorization: Bearer <token>`, or from a `?token=`
//! query parameter for WebSocket upgrades (browsers can't set headers there).

use std::collections::HashSet;
use std::sync::Arc;

use axum::{
    extract::{Query, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;

use crate::config::{AuthConfig, UserConfig};

/// An authenticated dashboard user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub user_id: u64,
    pub username: String,
    pub admin: bool,
    servers: HashSet<u64>,
}

impl Caller {
    pub fn new(user_id: u64, username: &str, admin: bool, servers: impl IntoIterator<Item = u64>) -> Self {
        Self {
            user_id,
            username: username.to_string(),
            admin,
            servers: servers.into_iter().collect(),
        }
    }

    /// Admins reach every server; everyone else only their granted ones.
    pub fn can_access(&self, server_id: u64) -> bool {
        self.admin || self.servers.contains(&server_id)
    }

    pub fn servers(&self) -> &HashSet<u64> {
        &self.servers
    }
}

impl From<&UserConfig> for Caller {
    fn from(user: &UserConfig) -> Self {
        Self::new(user.id, &user.username, user.admin, user.servers.iter().copied())
    }
}

/// Token table built from config.
#[derive(Debug, Clone)]
pub struct Accounts {
    users: Vec<UserConfig>,
    agent_secret: String,
}

impl Accounts {
    pub fn from_config(auth: &AuthConfig) -> Self {
        Self {
            users: auth.users.clone(),
            agent_secret: auth.agent_secret.clone(),
        }
    }

    /// Resolve a user token. Compares against every user so timing does not
    /// reveal which entry matched.
    pub fn authenticate(&self, token: &str) -> Option<Caller> {
        let mut found = None;
        for user in &self.users {
            if constant_time_eq(user.token.as_bytes(), token.as_bytes()) && !user.token.is_empty() {
                found = Some(Caller::from(user));
            }
        }
        found
    }

    /// Whether `token` is the agent secret. An unset secret matches nothing.
    pub fn is_agent_secret(&self, token: &str) -> bool {
        !self.agent_secret.is_empty()
            && constant_time_eq(self.agent_secret.as_bytes(), token.as_bytes())
    }
}

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

/// Token from the Authorization header, else from `?token=`.
pub fn request_token(headers: &HeaderMap, uri: &axum::http::Uri) -> Option<String> {
    let header = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "));
    if let Some(token) = header {
        return Some(token.to_string());
    }
    Query::<TokenQuery>::try_from_uri(uri)
        .ok()
        .and_then(|Query(q)| q.token)
}

fn reject(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({"success": false, "error": message}))).into_response()
}

/// Middleware for user-facing routes. Inserts the [`Caller`] extension.
///
/// # Error responses
///
/// - `401 Unauthorized`: no token
/// - `403 Forbidden`: token unknown
pub async fn require_user(
    State(accounts): State<Arc<Accounts>>,
    mut request: Request,
    next: Next,
) -> Response {
    let Some(token) = request_token(request.headers(), request.uri()) else {
        return reject(StatusCode::UNAUTHORIZED, "Missing or invalid Authorization header");
    };
    let Some(caller) = accounts.authenticate(&token) else {
        return reject(StatusCode::FORBIDDEN, "Invalid token");
    };
    request.extensions_mut().insert(caller);
    next.run(request).await
}

/// Middleware for agent-facing routes.
pub async fn require_agent(
    State(accounts): State<Arc<Accounts>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(token) = request_token(request.headers(), request.uri()) else {
        return reject(StatusCode::UNAUTHORIZED, "Missing or invalid Authorization header");
    };
    if !accounts.is_agent_secret(&token) {
        return reject(StatusCode::FORBIDDEN, "Invalid agent secret");
    }
    next.run(request).await
}

/// Constant-time byte comparison to prevent timing side-channel attacks.
///
/// Always iterates over the full length of `expected` regardless of `provided`
/// length, so an attacker cannot determine the key length from response times.
pub fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    let mut diff = u8::from(expected.len() != provided.len());
    for (i, e) in expected.iter().enumerate() {
        let p = provided.get(i).copied().unwrap_or(0xff);
        diff |= e ^ p;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accounts() -> Accounts {
        Accounts::from_config(&AuthConfig {
            agent_secret: "agent-s".into(),
            users: vec![
                UserConfig {
                    id: 1,
                    username: "admin".into(),
                    token: "root-token".into(),
                    admin: true,
                    servers: vec![],
                },
                UserConfig {
                    id: 2,
                    username: "ops".into(),
                    token: "ops-token".into(),
                    admin: false,
                    servers: vec![3],
                },
            ],
        })
    }

    #[test]
    fn constant_time_eq_basics() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"ab"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
    }

    #[test]
    fn authenticate_resolves_users() {
        let a = accounts();
        let admin = a.authenticate("root-token").unwrap();
        assert!(admin.admin);
        assert!(admin.can_access(99));
        let ops = a.authenticate("ops-token").unwrap();
        assert!(ops.can_access(3));
        assert!(!ops.can_access(4));
        assert!(a.authenticate("nope").is_none());
        assert!(a.authenticate("").is_none());
    }

    #[test]
    fn agent_secret_must_be_set() {
        assert!(accounts().is_agent_secret("agent-s"));
        assert!(!accounts().is_agent_secret("root-token"));
        let empty = Accounts::from_config(&AuthConfig::default());
        assert!(!empty.is_agent_secret(""));
    }

    #[test]
    fn token_from_header_or_query() {
        let mut headers = HeaderMap::new();
        let uri: axum::http::Uri = "/ws/terminal/x?token=q-token".parse().unwrap();
        assert_eq!(request_token(&headers, &uri).as_deref(), Some("q-token"));
        headers.insert("authorization", "Bearer h-token".parse().unwrap());
        assert_eq!(request_token(&headers, &uri).as_deref(), Some("h-token"));
        let bare: axum::http::Uri = "/api/health".parse().unwrap();
        assert_eq!(request_token(&HeaderMap::new(), &bare), None);
    }
}
