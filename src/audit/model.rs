//! Audit records: terminal sessions, executed commands and blacklist rules.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What happens when a blacklist rule matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    /// Refuse the command and stop evaluating.
    Block,
    /// Allow the command, tell the user, stop evaluating.
    Warn,
    /// Allow the command silently and keep evaluating later rules.
    Log,
}

impl RuleAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Block => "block",
            Self::Warn => "warn",
            Self::Log => "log",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlacklistRule {
    pub id: u64,
    pub pattern: String,
    pub description: String,
    pub action: RuleAction,
    pub enabled: bool,
    pub created_by: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RuleForm {
    pub pattern: String,
    #[serde(default)]
    pub description: String,
    pub action: RuleAction,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// Partial rule edit; absent fields keep their value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RulePatch {
    pub pattern: Option<String>,
    pub description: Option<String>,
    pub action: Option<RuleAction>,
    pub enabled: Option<bool>,
}

impl BlacklistRule {
    pub fn apply(&mut self, patch: &RulePatch) {
        if let Some(pattern) = &patch.pattern {
            self.pattern.clone_from(pattern);
        }
        if let Some(description) = &patch.description {
            self.description.clone_from(description);
        }
        if let Some(action) = patch.action {
            self.action = action;
        }
        if let Some(enabled) = patch.enabled {
            self.enabled = enabled;
        }
    }
}

/// One interactive terminal session, opened when the user asks for a terminal
/// and sealed when the stream ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSession {
    pub id: u64,
    pub user_id: u64,
    pub username: String,
    pub server_id: u64,
    pub server_name: String,
    pub stream_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Whole seconds between start and end; 0 while open.
    pub duration_secs: i64,
    pub command_count: u64,
    pub recording_enabled: bool,
    pub recording_path: Option<String>,
}

impl TerminalSession {
    /// Stamp the end time and duration. A no-op on an already sealed session.
    pub fn seal(&mut self, now: DateTime<Utc>) -> bool {
        if self.ended_at.is_some() {
            return false;
        }
        self.ended_at = Some(now);
        self.duration_secs = (now - self.started_at).num_seconds().max(0);
        true
    }
}

/// One command line observed in a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRecord {
    pub id: u64,
    pub session_id: u64,
    pub user_id: u64,
    pub server_id: u64,
    pub command: String,
    pub working_dir: String,
    pub executed_at: DateTime<Utc>,
    pub exit_code: i32,
    pub blocked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn seal_computes_duration_once() {
        let start = Utc::now();
        let mut s = TerminalSession {
            id: 1,
            user_id: 1,
            username: "root".into(),
            server_id: 1,
            server_name: "edge".into(),
            stream_id: "s".into(),
            started_at: start,
            ended_at: None,
            duration_secs: 0,
            command_count: 0,
            recording_enabled: false,
            recording_path: None,
        };
        assert!(s.seal(start + Duration::seconds(42)));
        assert_eq!(s.duration_secs, 42);
        assert!(!s.seal(start + Duration::seconds(99)));
        assert_eq!(s.duration_secs, 42);
    }

    #[test]
    fn rule_form_defaults_enabled() {
        let f: RuleForm = serde_json::from_str(r#"{"pattern":"rm","action":"warn"}"#).unwrap();
        assert!(f.enabled);
        assert_eq!(f.action, RuleAction::Warn);
    }
}
