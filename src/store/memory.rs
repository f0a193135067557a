//! In-process [`Store`] with optional JSON snapshot persistence.
//!
//! All tables live behind one `RwLock`. When a snapshot path is configured the
//! whole dataset is rewritten (temp file + rename) after every mutation, while
//! the write lock is still held, so the file never lags or reorders writes.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::RwLock;
use tracing::info;

use super::{
    CommandFilter, Page, Paged, PurgeReport, Server, SessionFilter, Store, StoreError,
    StoreResult,
};
use crate::audit::model::{BlacklistRule, CommandRecord, TerminalSession};
use crate::tunnels::model::{MappingType, TunnelMapping};

#[derive(Debug, Default, Serialize, Deserialize)]
struct Tables {
    #[serde(default)]
    next_id: u64,
    #[serde(default)]
    servers: BTreeMap<u64, Server>,
    #[serde(default)]
    mappings: BTreeMap<u64, TunnelMapping>,
    #[serde(default)]
    sessions: BTreeMap<u64, TerminalSession>,
    #[serde(default)]
    commands: BTreeMap<u64, CommandRecord>,
    #[serde(default)]
    rules: BTreeMap<u64, BlacklistRule>,
}

impl Tables {
    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

pub struct MemoryStore {
    tables: RwLock<Tables>,
    snapshot: Option<PathBuf>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Volatile store; everything is lost on exit.
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            snapshot: None,
        }
    }

    /// Store backed by a JSON snapshot at `path`, loading it if present.
    pub async fn open(path: &Path) -> StoreResult<Self> {
        let tables = match fs::read(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| StoreError::Backend(format!("parse {}: {e}", path.display())))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Tables::default(),
            Err(e) => return Err(StoreError::Backend(format!("read {}: {e}", path.display()))),
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::Backend(format!("create {}: {e}", parent.display())))?;
        }
        info!(
            "Loaded store snapshot {} ({} mappings, {} sessions, {} rules)",
            path.display(),
            tables.mappings.len(),
            tables.sessions.len(),
            tables.rules.len()
        );
        Ok(Self {
            tables: RwLock::new(tables),
            snapshot: Some(path.to_path_buf()),
        })
    }

    async fn persist(&self, tables: &Tables) -> StoreResult<()> {
        let Some(path) = &self.snapshot else {
            return Ok(());
        };
        let bytes = serde_json::to_vec(tables).map_err(|e| StoreError::Backend(e.to_string()))?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, &bytes)
            .await
            .map_err(|e| StoreError::Backend(format!("write {}: {e}", tmp.display())))?;
        fs::rename(&tmp, path)
            .await
            .map_err(|e| StoreError::Backend(format!("rename {}: {e}", path.display())))
    }
}

fn not_found(what: &str, id: impl std::fmt::Display) -> StoreError {
    StoreError::NotFound(format!("{what} {id}"))
}

#[async_trait]
impl Store for MemoryStore {
    async fn upsert_server(&self, server: Server) -> StoreResult<()> {
        let mut t = self.tables.write().await;
        t.servers.insert(server.id, server);
        self.persist(&t).await
    }

    async fn get_server(&self, id: u64) -> StoreResult<Server> {
        let t = self.tables.read().await;
        t.servers.get(&id).cloned().ok_or_else(|| not_found("server", id))
    }

    async fn list_servers(&self) -> StoreResult<Vec<Server>> {
        Ok(self.tables.read().await.servers.values().cloned().collect())
    }

    async fn list_mappings(&self) -> StoreResult<Vec<TunnelMapping>> {
        Ok(self.tables.read().await.mappings.values().cloned().collect())
    }

    async fn insert_mapping(&self, mut mapping: TunnelMapping) -> StoreResult<TunnelMapping> {
        let mut t = self.tables.write().await;
        mapping.id = t.allocate_id();
        t.mappings.insert(mapping.id, mapping.clone());
        self.persist(&t).await?;
        Ok(mapping)
    }

    async fn save_mapping(&self, mapping: &TunnelMapping) -> StoreResult<()> {
        let mut t = self.tables.write().await;
        let slot = t
            .mappings
            .get_mut(&mapping.id)
            .ok_or_else(|| not_found("mapping", mapping.id))?;
        *slot = mapping.clone();
        self.persist(&t).await
    }

    async fn delete_mappings(&self, ids: &[u64]) -> StoreResult<u64> {
        let mut t = self.tables.write().await;
        let removed = ids
            .iter()
            .filter(|id| t.mappings.remove(*id).is_some())
            .count() as u64;
        self.persist(&t).await?;
        Ok(removed)
    }

    async fn count_port_conflicts(
        &self,
        server_id: u64,
        mapping_type: MappingType,
        source_port: u16,
        exclude: Option<u64>,
    ) -> StoreResult<u64> {
        let t = self.tables.read().await;
        Ok(t.mappings
            .values()
            .filter(|m| {
                Some(m.id) != exclude
                    && m.server_id == server_id
                    && m.mapping_type == mapping_type
                    && m.source_port == source_port
            })
            .count() as u64)
    }

    async fn insert_session(&self, mut session: TerminalSession) -> StoreResult<TerminalSession> {
        let mut t = self.tables.write().await;
        session.id = t.allocate_id();
        t.sessions.insert(session.id, session.clone());
        self.persist(&t).await?;
        Ok(session)
    }

    async fn get_session(&self, id: u64) -> StoreResult<TerminalSession> {
        let t = self.tables.read().await;
        t.sessions.get(&id).cloned().ok_or_else(|| not_found("session", id))
    }

    async fn session_by_stream(&self, stream_id: &str) -> StoreResult<TerminalSession> {
        let t = self.tables.read().await;
        t.sessions
            .values()
            .find(|s| s.stream_id == stream_id)
            .cloned()
            .ok_or_else(|| not_found("session for stream", stream_id))
    }

    async fn save_session(&self, session: &TerminalSession) -> StoreResult<()> {
        let mut t = self.tables.write().await;
        let slot = t
            .sessions
            .get_mut(&session.id)
            .ok_or_else(|| not_found("session", session.id))?;
        *slot = session.clone();
        self.persist(&t).await
    }

    async fn list_sessions(
        &self,
        filter: &SessionFilter,
        page: Page,
    ) -> StoreResult<Paged<TerminalSession>> {
        let t = self.tables.read().await;
        let mut rows: Vec<_> = t.sessions.values().filter(|s| filter.matches(s)).cloned().collect();
        rows.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(b.id.cmp(&a.id)));
        Ok(page.apply(rows))
    }

    async fn insert_command(&self, mut record: CommandRecord) -> StoreResult<CommandRecord> {
        let mut t = self.tables.write().await;
        record.id = t.allocate_id();
        t.commands.insert(record.id, record.clone());
        self.persist(&t).await?;
        Ok(record)
    }

    async fn bump_command_count(&self, session_id: u64) -> StoreResult<()> {
        let mut t = self.tables.write().await;
        let session = t
            .sessions
            .get_mut(&session_id)
            .ok_or_else(|| not_found("session", session_id))?;
        session.command_count += 1;
        self.persist(&t).await
    }

    async fn list_commands(
        &self,
        filter: &CommandFilter,
        page: Page,
    ) -> StoreResult<Paged<CommandRecord>> {
        let t = self.tables.read().await;
        let mut rows: Vec<_> = t.commands.values().filter(|c| filter.matches(c)).cloned().collect();
        rows.sort_by(|a, b| b.executed_at.cmp(&a.executed_at).then(b.id.cmp(&a.id)));
        Ok(page.apply(rows))
    }

    async fn list_rules(&self) -> StoreResult<Vec<BlacklistRule>> {
        Ok(self.tables.read().await.rules.values().cloned().collect())
    }

    async fn get_rule(&self, id: u64) -> StoreResult<BlacklistRule> {
        let t = self.tables.read().await;
        t.rules.get(&id).cloned().ok_or_else(|| not_found("rule", id))
    }

    async fn insert_rule(&self, mut rule: BlacklistRule) -> StoreResult<BlacklistRule> {
        let mut t = self.tables.write().await;
        rule.id = t.allocate_id();
        t.rules.insert(rule.id, rule.clone());
        self.persist(&t).await?;
        Ok(rule)
    }

    async fn save_rule(&self, rule: &BlacklistRule) -> StoreResult<()> {
        let mut t = self.tables.write().await;
        let slot = t.rules.get_mut(&rule.id).ok_or_else(|| not_found("rule", rule.id))?;
        *slot = rule.clone();
        self.persist(&t).await
    }

    async fn delete_rule(&self, id: u64) -> StoreResult<()> {
        let mut t = self.tables.write().await;
        t.rules.remove(&id).ok_or_else(|| not_found("rule", id))?;
        self.persist(&t).await
    }

    async fn purge_sessions_before(&self, cutoff: DateTime<Utc>) -> StoreResult<PurgeReport> {
        let mut t = self.tables.write().await;
        let expired: Vec<u64> = t
            .sessions
            .values()
            .filter(|s| s.started_at < cutoff)
            .map(|s| s.id)
            .collect();
        if expired.is_empty() && t.commands.values().all(|c| c.executed_at >= cutoff) {
            return Ok(PurgeReport::default());
        }

        let mut report = PurgeReport::default();
        for id in &expired {
            if let Some(session) = t.sessions.remove(id) {
                report.sessions += 1;
                if let Some(path) = session.recording_path {
                    report.recordings.push(path);
                }
            }
        }
        let before = t.commands.len();
        t.commands
            .retain(|_, c| !expired.contains(&c.session_id) && c.executed_at >= cutoff);
        report.commands = (before - t.commands.len()) as u64;

        self.persist(&t).await?;
        Ok(report)
    }
}
