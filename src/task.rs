//! Task envelope: the one message shape carried by an agent's task channel.
//!
//! An envelope is `{"type": <int>, "data": <string>}`. `type` selects the
//! payload shape and `data` holds that payload as a JSON document. The envelope
//! itself never looks inside `data`; [`Task::decode`] (dashboard → agent) and
//! [`AgentReport::decode`] (agent → dashboard) do, and both map kinds they do
//! not interpret to an `Unknown` variant instead of failing, so dashboards and
//! agents of different versions keep talking.
//!
//! ## Kind catalog
//!
//! | Code | Kind                | Direction          | Payload                       |
//! |------|---------------------|--------------------|-------------------------------|
//! | 7    | keepalive           | agent → dashboard  | empty                         |
//! | 8    | terminal-stream     | dashboard → agent  | [`TerminalTask`]              |
//! | 14   | tunnel-control      | dashboard → agent  | [`TunnelTask`]                |
//! | 15   | command-check       | both               | [`CommandCheckRequest`] / [`CommandCheckReply`] |
//! | 16   | command-record      | agent → dashboard  | [`CommandRecordRequest`]      |
//! | 17   | recording-upload    | both               | [`RecordingUpload`] / [`RecordingUploadReply`] |
//! | 18   | tunnel-status       | agent → dashboard  | [`TunnelStatusReport`]        |
//!
//! The remaining codes (1-6, 9-13) belong to agent features this crate does
//! not drive; they are reserved so numbering stays stable on the wire.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

use crate::audit::model::RuleAction;
use crate::tunnels::model::{MappingType, TunnelMapping, TunnelStatus};

/// Numeric task kinds. The discriminants are the wire codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u64)]
pub enum TaskKind {
    HttpGet = 1,
    IcmpPing = 2,
    TcpPing = 3,
    Command = 4,
    Terminal = 5,
    Upgrade = 6,
    Keepalive = 7,
    TerminalStream = 8,
    Nat = 9,
    ReportHostInfo = 10,
    FileManager = 11,
    ReportConfig = 12,
    ApplyConfig = 13,
    Tunnel = 14,
    CommandCheck = 15,
    CommandRecord = 16,
    RecordingUpload = 17,
    TunnelStatus = 18,
}

impl TaskKind {
    /// Map a wire code to a known kind. `None` for codes this build has never heard of.
    pub fn from_code(code: u64) -> Option<Self> {
        let kind = match code {
            1 => Self::HttpGet,
            2 => Self::IcmpPing,
            3 => Self::TcpPing,
            4 => Self::Command,
            5 => Self::Terminal,
            6 => Self::Upgrade,
            7 => Self::Keepalive,
            8 => Self::TerminalStream,
            9 => Self::Nat,
            10 => Self::ReportHostInfo,
            11 => Self::FileManager,
            12 => Self::ReportConfig,
            13 => Self::ApplyConfig,
            14 => Self::Tunnel,
            15 => Self::CommandCheck,
            16 => Self::CommandRecord,
            17 => Self::RecordingUpload,
            18 => Self::TunnelStatus,
            _ => return None,
        };
        Some(kind)
    }

    pub fn code(self) -> u64 {
        self as u64
    }
}

/// The tagged message sent over an agent's task channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    #[serde(rename = "type")]
    pub kind: u64,
    #[serde(default)]
    pub data: String,
}

impl TaskEnvelope {
    /// Build an envelope by serializing `payload` as the `data` document.
    pub fn new<T: Serialize>(kind: TaskKind, payload: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            kind: kind.code(),
            data: serde_json::to_string(payload)?,
        })
    }

    /// An envelope with no payload (keepalive).
    pub fn empty(kind: TaskKind) -> Self {
        Self {
            kind: kind.code(),
            data: String::new(),
        }
    }

    /// Parse one text frame from the channel.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Serialize for the channel.
    pub fn to_json(&self) -> String {
        // A struct of a u64 and a String always serializes.
        serde_json::to_string(self).unwrap_or_default()
    }

    fn payload<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(&self.data)
    }
}

// ─── Payloads ────────────────────────────────────────────────────────────────

/// Ask the agent to open its side of an interactive terminal stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalTask {
    pub stream_id: String,
    /// Whether the agent should record the session.
    #[serde(default)]
    pub record: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelAction {
    Start,
    Stop,
    Status,
}

/// Start, stop or query one port mapping on the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelTask {
    pub action: TunnelAction,
    pub mapping_id: u64,
    #[serde(default)]
    pub mapping_type: MappingType,
    #[serde(default)]
    pub source_port: u16,
    #[serde(default)]
    pub target_host: String,
    #[serde(default)]
    pub target_port: u16,
    /// Tunnel gateway the agent forwards through, `user@host[:port]`.
    #[serde(default)]
    pub gateway_host: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, String>,
}

impl TunnelTask {
    pub fn start(
        mapping: &TunnelMapping,
        gateway_host: &str,
        options: BTreeMap<String, String>,
    ) -> Self {
        Self {
            action: TunnelAction::Start,
            mapping_id: mapping.id,
            mapping_type: mapping.mapping_type,
            source_port: mapping.source_port,
            target_host: mapping.target_host.clone(),
            target_port: mapping.target_port,
            gateway_host: gateway_host.to_string(),
            options,
        }
    }

    pub fn stop(mapping_id: u64) -> Self {
        Self {
            action: TunnelAction::Stop,
            mapping_id,
            mapping_type: MappingType::default(),
            source_port: 0,
            target_host: String::new(),
            target_port: 0,
            gateway_host: String::new(),
            options: BTreeMap::new(),
        }
    }
}

/// Pre-execution check of a shell command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandCheckRequest {
    pub stream_id: String,
    pub command: String,
    #[serde(default)]
    pub working_dir: String,
    /// Correlates a channel reply; absent on the HTTP path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

/// Outcome of a command check.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandCheckResponse {
    pub blocked: bool,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub action: Option<RuleAction>,
}

impl CommandCheckResponse {
    /// Not blocked, nothing to say. The fail-open answer.
    pub fn allow() -> Self {
        Self::default()
    }
}

/// Channel reply to a [`CommandCheckRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandCheckReply {
    pub request_id: String,
    #[serde(flatten)]
    pub response: CommandCheckResponse,
}

/// Post-execution record of a shell command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRecordRequest {
    pub stream_id: String,
    pub command: String,
    #[serde(default)]
    pub working_dir: String,
    #[serde(default)]
    pub exit_code: i32,
}

/// A finished recording, base64-encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordingUpload {
    pub stream_id: String,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordingUploadReply {
    pub stream_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Agent-side outcome of a tunnel start/stop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelStatusReport {
    pub mapping_id: u64,
    pub status: TunnelStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

// ─── Decoding ────────────────────────────────────────────────────────────────

/// A task as seen by the agent (dashboard → agent direction).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Task {
    TerminalStream(TerminalTask),
    Tunnel(TunnelTask),
    CommandCheckReply(CommandCheckReply),
    RecordingUploadReply(RecordingUploadReply),
    /// Any kind this side does not act on.
    Unknown(u64),
}

impl Task {
    /// Decode an envelope received by the agent.
    ///
    /// Unknown kinds decode to [`Task::Unknown`]; only a known kind with a
    /// malformed payload is an error.
    pub fn decode(envelope: &TaskEnvelope) -> Result<Self, serde_json::Error> {
        Ok(match TaskKind::from_code(envelope.kind) {
            Some(TaskKind::TerminalStream) => Self::TerminalStream(envelope.payload()?),
            Some(TaskKind::Tunnel) => Self::Tunnel(envelope.payload()?),
            Some(TaskKind::CommandCheck) => Self::CommandCheckReply(envelope.payload()?),
            Some(TaskKind::RecordingUpload) => Self::RecordingUploadReply(envelope.payload()?),
            _ => Self::Unknown(envelope.kind),
        })
    }
}

/// A message as seen by the dashboard (agent → dashboard direction).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentReport {
    Keepalive,
    CommandCheck(CommandCheckRequest),
    CommandRecord(CommandRecordRequest),
    RecordingUpload(RecordingUpload),
    TunnelStatus(TunnelStatusReport),
    Unknown(u64),
}

impl AgentReport {
    pub fn decode(envelope: &TaskEnvelope) -> Result<Self, serde_json::Error> {
        Ok(match TaskKind::from_code(envelope.kind) {
            Some(TaskKind::Keepalive) => Self::Keepalive,
            Some(TaskKind::CommandCheck) => Self::CommandCheck(envelope.payload()?),
            Some(TaskKind::CommandRecord) => Self::CommandRecord(envelope.payload()?),
            Some(TaskKind::RecordingUpload) => Self::RecordingUpload(envelope.payload()?),
            Some(TaskKind::TunnelStatus) => Self::TunnelStatus(envelope.payload()?),
            _ => Self::Unknown(envelope.kind),
        })
    }
}

// ─── Dispatch ────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum DispatchError {
    /// No live task channel for the agent. Not retried.
    #[error("agent {0} is not connected")]
    Unreachable(u64),
    #[error("failed to encode task payload: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Sends one envelope to one agent.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, server_id: u64, envelope: TaskEnvelope) -> Result<(), DispatchError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_wire_shape() {
        let env = TaskEnvelope::new(
            TaskKind::TerminalStream,
            &TerminalTask {
                stream_id: "abc".into(),
                record: true,
            },
        )
        .unwrap();
        let v: serde_json::Value = serde_json::from_str(&env.to_json()).unwrap();
        assert_eq!(v["type"], 8);
        assert!(v["data"].is_string());
        let inner: serde_json::Value = serde_json::from_str(v["data"].as_str().unwrap()).unwrap();
        assert_eq!(inner["stream_id"], "abc");
        assert_eq!(inner["record"], true);
    }

    #[test]
    fn unknown_kind_is_ignored_not_an_error() {
        let env = TaskEnvelope {
            kind: 999,
            data: "not even json".into(),
        };
        assert_eq!(Task::decode(&env).unwrap(), Task::Unknown(999));
        assert_eq!(AgentReport::decode(&env).unwrap(), AgentReport::Unknown(999));
    }

    #[test]
    fn reserved_kinds_decode_as_unknown() {
        let env = TaskEnvelope {
            kind: TaskKind::HttpGet.code(),
            data: "{}".into(),
        };
        assert_eq!(Task::decode(&env).unwrap(), Task::Unknown(1));
    }

    #[test]
    fn known_kind_with_bad_payload_is_an_error() {
        let env = TaskEnvelope {
            kind: TaskKind::Tunnel.code(),
            data: "{".into(),
        };
        assert!(Task::decode(&env).is_err());
    }

    #[test]
    fn tunnel_stop_payload_is_minimal() {
        let env = TaskEnvelope::new(TaskKind::Tunnel, &TunnelTask::stop(7)).unwrap();
        let task = Task::decode(&env).unwrap();
        let Task::Tunnel(t) = task else {
            panic!("expected tunnel task");
        };
        assert_eq!(t.action, TunnelAction::Stop);
        assert_eq!(t.mapping_id, 7);
        assert!(!env.data.contains("options"));
    }

    #[test]
    fn keepalive_has_empty_payload() {
        let env = TaskEnvelope::from_json(r#"{"type":7}"#).unwrap();
        assert_eq!(AgentReport::decode(&env).unwrap(), AgentReport::Keepalive);
    }

    #[test]
    fn check_reply_flattens_response() {
        let reply = CommandCheckReply {
            request_id: "r1".into(),
            response: CommandCheckResponse {
                blocked: true,
                reason: "no".into(),
                action: Some(RuleAction::Block),
            },
        };
        let v = serde_json::to_value(&reply).unwrap();
        assert_eq!(v["request_id"], "r1");
        assert_eq!(v["blocked"], true);
        assert_eq!(v["action"], "block");
    }
}
