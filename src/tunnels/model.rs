//! Port mapping records and the admin form used to create/edit them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Direction of a forward.
///
/// `local`: a port on the agent forwards through the gateway to a target.
/// `remote`: a port on the gateway forwards back through the agent to a target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MappingType {
    #[default]
    Local,
    Remote,
}

impl MappingType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelStatus {
    #[default]
    Stopped,
    Running,
    Error,
}

/// A persisted port-forward definition plus its last known runtime status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelMapping {
    pub id: u64,
    pub name: String,
    pub server_id: u64,
    pub mapping_type: MappingType,
    pub source_port: u16,
    pub target_host: String,
    pub target_port: u16,
    pub enabled: bool,
    pub status: TunnelStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_error: String,
    pub last_start_at: Option<DateTime<Utc>>,
    /// User that created the mapping.
    pub user_id: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TunnelMapping {
    /// Whether `form` changes anything the running forward depends on.
    pub fn forward_differs(&self, form: &TunnelForm) -> bool {
        self.server_id != form.server_id
            || self.mapping_type != form.mapping_type
            || self.source_port != form.source_port
            || self.target_host != form.target_host
            || self.target_port != form.target_port
    }

    pub fn apply(&mut self, form: &TunnelForm) {
        self.name.clone_from(&form.name);
        self.server_id = form.server_id;
        self.mapping_type = form.mapping_type;
        self.source_port = form.source_port;
        self.target_host.clone_from(&form.target_host);
        self.target_port = form.target_port;
        self.enabled = form.enabled;
    }
}

/// Create/update payload for a mapping.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TunnelForm {
    #[serde(default)]
    pub name: String,
    pub server_id: u64,
    #[serde(default)]
    pub mapping_type: MappingType,
    pub source_port: u16,
    #[serde(default = "default_target_host")]
    pub target_host: String,
    pub target_port: u16,
    #[serde(default)]
    pub enabled: bool,
}

fn default_target_host() -> String {
    "127.0.0.1".to_string()
}

impl TunnelForm {
    /// Reject forms that could never produce a working forward.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("name is required".into());
        }
        if self.name.chars().count() > 250 {
            return Err("name must be at most 250 characters".into());
        }
        if self.server_id == 0 {
            return Err("server_id is required".into());
        }
        if self.source_port == 0 {
            return Err("source_port must be between 1 and 65535".into());
        }
        if self.target_port == 0 {
            return Err("target_port must be between 1 and 65535".into());
        }
        let host = self.target_host.trim();
        if host.is_empty() {
            return Err("target_host is required".into());
        }
        let bracketed = host.starts_with('[') && host.ends_with(']');
        if host.len() > 255 || host.chars().any(|c| c.is_whitespace() || (c == ':' && !bracketed)) {
            return Err(format!("invalid target_host '{host}'"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn form() -> TunnelForm {
        TunnelForm {
            name: "db".into(),
            server_id: 1,
            mapping_type: MappingType::Local,
            source_port: 15432,
            target_host: "127.0.0.1".into(),
            target_port: 5432,
            enabled: true,
        }
    }

    #[test]
    fn valid_form_passes() {
        assert!(form().validate().is_ok());
    }

    #[test]
    fn zero_ports_rejected() {
        let mut f = form();
        f.source_port = 0;
        assert!(f.validate().is_err());
        let mut f = form();
        f.target_port = 0;
        assert!(f.validate().is_err());
    }

    #[test]
    fn bad_target_host_rejected() {
        let mut f = form();
        f.target_host = "  ".into();
        assert!(f.validate().is_err());
        f.target_host = "evil host".into();
        assert!(f.validate().is_err());
        f.target_host = "[::1]".into();
        assert!(f.validate().is_ok());
    }

    #[test]
    fn form_defaults() {
        let f: TunnelForm =
            serde_json::from_str(r#"{"server_id":2,"source_port":80,"target_port":8080}"#).unwrap();
        assert_eq!(f.mapping_type, MappingType::Local);
        assert_eq!(f.target_host, "127.0.0.1");
        assert!(!f.enabled);
    }

    #[test]
    fn forward_differs_ignores_name_and_enabled() {
        let now = Utc::now();
        let f = form();
        let mut m = TunnelMapping {
            id: 1,
            name: String::new(),
            server_id: 0,
            mapping_type: MappingType::Remote,
            source_port: 0,
            target_host: String::new(),
            target_port: 0,
            enabled: false,
            status: TunnelStatus::Stopped,
            last_error: String::new(),
            last_start_at: None,
            user_id: 1,
            created_at: now,
            updated_at: now,
        };
        m.apply(&f);
        assert!(!m.forward_differs(&f));
        let mut renamed = f.clone();
        renamed.name = "other".into();
        renamed.enabled = false;
        assert!(!m.forward_differs(&renamed));
        let mut moved = f;
        moved.source_port = 1;
        assert!(m.forward_differs(&moved));
    }
}
