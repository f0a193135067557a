//! Persistence seam.
//!
//! Everything the control plane keeps across restarts goes through [`Store`]:
//! known servers, port mappings, terminal sessions, command records and
//! blacklist rules. [`MemoryStore`] is the bundled implementation; it can
//! optionally snapshot itself to a JSON file after every write.

mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::audit::model::{BlacklistRule, CommandRecord, TerminalSession};
use crate::tunnels::model::{MappingType, TunnelMapping};

pub use memory::MemoryStore;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("backend error: {0}")]
    Backend(String),
}

/// A managed server (one agent). Rows are upserted when an agent connects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    pub id: u64,
    pub name: String,
    pub last_seen: Option<DateTime<Utc>>,
}

/// 1-based page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub page: u32,
    pub page_size: u32,
}

impl Page {
    pub const MAX_PAGE_SIZE: u32 = 200;

    /// Normalize user-supplied paging; zero or missing values take defaults.
    pub fn new(page: Option<u32>, page_size: Option<u32>, default_size: u32) -> Self {
        let page = page.filter(|p| *p > 0).unwrap_or(1);
        let page_size = page_size
            .filter(|s| *s > 0)
            .unwrap_or(default_size)
            .min(Self::MAX_PAGE_SIZE);
        Self { page, page_size }
    }

    fn offset(self) -> usize {
        (self.page as usize - 1) * self.page_size as usize
    }

    /// Slice an already ordered result set.
    pub fn apply<T>(self, items: Vec<T>) -> Paged<T> {
        let total = items.len() as u64;
        let items = items
            .into_iter()
            .skip(self.offset())
            .take(self.page_size as usize)
            .collect();
        Paged {
            items,
            total,
            page: self.page,
            page_size: self.page_size,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Paged<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionFilter {
    pub user_id: Option<u64>,
    pub server_id: Option<u64>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl SessionFilter {
    pub fn matches(&self, s: &TerminalSession) -> bool {
        self.user_id.is_none_or(|id| s.user_id == id)
            && self.server_id.is_none_or(|id| s.server_id == id)
            && self.from.is_none_or(|t| s.started_at >= t)
            && self.to.is_none_or(|t| s.started_at <= t)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CommandFilter {
    pub session_id: Option<u64>,
    pub user_id: Option<u64>,
    pub server_id: Option<u64>,
    /// Substring match on the command text.
    pub command: Option<String>,
    pub blocked: Option<bool>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl CommandFilter {
    pub fn matches(&self, c: &CommandRecord) -> bool {
        self.session_id.is_none_or(|id| c.session_id == id)
            && self.user_id.is_none_or(|id| c.user_id == id)
            && self.server_id.is_none_or(|id| c.server_id == id)
            && self
                .command
                .as_deref()
                .is_none_or(|needle| needle.is_empty() || c.command.contains(needle))
            && self.blocked.is_none_or(|b| c.blocked == b)
            && self.from.is_none_or(|t| c.executed_at >= t)
            && self.to.is_none_or(|t| c.executed_at <= t)
    }
}

/// What a retention purge removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub sessions: u64,
    pub commands: u64,
    /// Recording files referenced by purged sessions; the caller deletes them.
    pub recordings: Vec<String>,
}

#[async_trait]
pub trait Store: Send + Sync {
    // Servers
    async fn upsert_server(&self, server: Server) -> StoreResult<()>;
    async fn get_server(&self, id: u64) -> StoreResult<Server>;
    async fn list_servers(&self) -> StoreResult<Vec<Server>>;

    // Port mappings
    /// All mappings, ordered by id.
    async fn list_mappings(&self) -> StoreResult<Vec<TunnelMapping>>;
    /// Insert and return the row with its assigned id.
    async fn insert_mapping(&self, mapping: TunnelMapping) -> StoreResult<TunnelMapping>;
    async fn save_mapping(&self, mapping: &TunnelMapping) -> StoreResult<()>;
    async fn delete_mappings(&self, ids: &[u64]) -> StoreResult<u64>;
    /// Mappings on the same server using the same type and source port,
    /// ignoring `exclude`.
    async fn count_port_conflicts(
        &self,
        server_id: u64,
        mapping_type: MappingType,
        source_port: u16,
        exclude: Option<u64>,
    ) -> StoreResult<u64>;

    // Terminal sessions
    async fn insert_session(&self, session: TerminalSession) -> StoreResult<TerminalSession>;
    async fn get_session(&self, id: u64) -> StoreResult<TerminalSession>;
    async fn session_by_stream(&self, stream_id: &str) -> StoreResult<TerminalSession>;
    async fn save_session(&self, session: &TerminalSession) -> StoreResult<()>;
    /// Newest first.
    async fn list_sessions(
        &self,
        filter: &SessionFilter,
        page: Page,
    ) -> StoreResult<Paged<TerminalSession>>;

    // Commands
    async fn insert_command(&self, record: CommandRecord) -> StoreResult<CommandRecord>;
    /// Count one executed command against a session.
    async fn bump_command_count(&self, session_id: u64) -> StoreResult<()>;
    /// Newest first.
    async fn list_commands(
        &self,
        filter: &CommandFilter,
        page: Page,
    ) -> StoreResult<Paged<CommandRecord>>;

    // Blacklist rules
    /// All rules in creation order.
    async fn list_rules(&self) -> StoreResult<Vec<BlacklistRule>>;
    async fn get_rule(&self, id: u64) -> StoreResult<BlacklistRule>;
    async fn insert_rule(&self, rule: BlacklistRule) -> StoreResult<BlacklistRule>;
    async fn save_rule(&self, rule: &BlacklistRule) -> StoreResult<()>;
    async fn delete_rule(&self, id: u64) -> StoreResult<()>;

    // Retention
    /// Remove sessions started before `cutoff` with their commands, and any
    /// other command executed before `cutoff`.
    async fn purge_sessions_before(&self, cutoff: DateTime<Utc>) -> StoreResult<PurgeReport>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_defaults_and_clamps() {
        assert_eq!(Page::new(None, None, 20), Page { page: 1, page_size: 20 });
        assert_eq!(Page::new(Some(0), Some(0), 50), Page { page: 1, page_size: 50 });
        assert_eq!(Page::new(Some(3), Some(10_000), 20).page_size, Page::MAX_PAGE_SIZE);
    }

    #[test]
    fn page_slices() {
        let paged = Page::new(Some(2), Some(3), 20).apply((1..=8).collect::<Vec<_>>());
        assert_eq!(paged.items, vec![4, 5, 6]);
        assert_eq!(paged.total, 8);
        let past_end = Page::new(Some(5), Some(3), 20).apply((1..=8).collect::<Vec<_>>());
        assert!(past_end.items.is_empty());
    }
}
