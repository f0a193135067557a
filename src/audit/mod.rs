//! Command audit.
//!
//! [`AuditService`] is the dashboard half of the audit pipeline:
//!
//! - terminal sessions are opened when a terminal is requested and sealed
//!   when its stream ends;
//! - `check_command` evaluates the blacklist before a command runs and
//!   records every rule hit;
//! - `record_command` queues an executed command for a background worker and
//!   returns immediately. Queued records are lost if the process dies;
//! - uploaded recordings are stored next to each other under the recordings
//!   directory and linked from their session;
//! - `purge_expired` enforces the retention window.
//!
//! Everything on the interactive path fails open: a check that cannot be
//! evaluated allows the command, a record that cannot be stored is dropped.

pub mod model;
pub mod rules;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Days, Duration, Local, NaiveTime, TimeZone, Utc};
use regex::Regex;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use crate::auth::Caller;
use crate::config::AuditConfig;
use crate::recording::RECORDING_EXT;
use crate::store::{
    CommandFilter, Page, Paged, PurgeReport, Server, SessionFilter, Store, StoreError,
};
use crate::task::{CommandCheckRequest, CommandCheckResponse, CommandRecordRequest};
use model::{BlacklistRule, CommandRecord, RuleAction, RuleForm, RulePatch, TerminalSession};
use rules::CompiledRule;

/// gzip magic bytes; uploads must start with them.
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("invalid pattern: {0}")]
    InvalidPattern(String),

    #[error("{0}")]
    Invalid(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("recording io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Cloneable; all clones share the rule cache and the record queue.
#[derive(Clone)]
pub struct AuditService {
    store: Arc<dyn Store>,
    /// Compiled enabled rules; `None` until first use or after an edit.
    rules: Arc<RwLock<Option<Arc<Vec<CompiledRule>>>>>,
    records: mpsc::UnboundedSender<CommandRecordRequest>,
    config: AuditConfig,
    recordings_dir: PathBuf,
}

impl AuditService {
    /// Build the service and spawn its record worker. Needs a tokio runtime.
    pub fn new(store: Arc<dyn Store>, config: AuditConfig, recordings_dir: PathBuf) -> Self {
        let (records, rx) = mpsc::unbounded_channel();
        let service = Self {
            store,
            rules: Arc::new(RwLock::new(None)),
            records,
            config,
            recordings_dir,
        };
        tokio::spawn(service.clone().drain_records(rx));
        service
    }

    async fn drain_records(self, mut rx: mpsc::UnboundedReceiver<CommandRecordRequest>) {
        while let Some(req) = rx.recv().await {
            self.persist_command(&req).await;
        }
    }

    pub fn recording_enabled_for(&self, server_id: u64) -> bool {
        self.config.recording_enabled_for(server_id)
    }

    pub fn recordings_dir(&self) -> &Path {
        &self.recordings_dir
    }

    // ─── Sessions ────────────────────────────────────────────────────────────

    /// Create the audit row for a terminal about to be opened.
    pub async fn open_session(
        &self,
        caller: &Caller,
        server: &Server,
        stream_id: &str,
    ) -> Result<TerminalSession, AuditError> {
        let session = TerminalSession {
            id: 0,
            user_id: caller.user_id,
            username: caller.username.clone(),
            server_id: server.id,
            server_name: server.name.clone(),
            stream_id: stream_id.to_string(),
            started_at: Utc::now(),
            ended_at: None,
            duration_secs: 0,
            command_count: 0,
            recording_enabled: self.recording_enabled_for(server.id),
            recording_path: None,
        };
        let session = self.store.insert_session(session).await?;
        info!(
            stream_id,
            server_id = server.id,
            "Opened terminal session {} for {}",
            session.id,
            caller.username
        );
        Ok(session)
    }

    /// Stamp end time and duration. Sealing twice is harmless.
    pub async fn seal_session(&self, stream_id: &str) -> Result<(), AuditError> {
        let mut session = self.session(stream_id).await?;
        if session.seal(Utc::now()) {
            self.store.save_session(&session).await?;
            info!(
                stream_id,
                "Closed terminal session {} after {}s, {} commands",
                session.id,
                session.duration_secs,
                session.command_count
            );
        }
        Ok(())
    }

    async fn session(&self, stream_id: &str) -> Result<TerminalSession, AuditError> {
        match self.store.session_by_stream(stream_id).await {
            Ok(s) => Ok(s),
            Err(StoreError::NotFound(_)) => Err(AuditError::NotFound(format!("session {stream_id}"))),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn list_sessions(
        &self,
        filter: &SessionFilter,
        page: Page,
    ) -> Result<Paged<TerminalSession>, AuditError> {
        Ok(self.store.list_sessions(filter, page).await?)
    }

    pub async fn list_commands(
        &self,
        filter: &CommandFilter,
        page: Page,
    ) -> Result<Paged<CommandRecord>, AuditError> {
        Ok(self.store.list_commands(filter, page).await?)
    }

    // ─── Check / record ──────────────────────────────────────────────────────

    /// Evaluate a command against the blacklist.
    ///
    /// Unknown streams and store failures allow the command.
    pub async fn check_command(&self, req: &CommandCheckRequest) -> CommandCheckResponse {
        let session = match self.session(&req.stream_id).await {
            Ok(s) => s,
            Err(e) => {
                debug!(stream_id = %req.stream_id, "Command check without session: {e}");
                return CommandCheckResponse::allow();
            }
        };
        let rules = match self.compiled_rules().await {
            Ok(rules) => rules,
            Err(e) => {
                warn!("Failed to load blacklist rules, allowing command: {e}");
                return CommandCheckResponse::allow();
            }
        };

        let eval = rules::evaluate(&rules, &req.command);
        for hit in &eval.hits {
            let blocked = hit.action == RuleAction::Block;
            let record = CommandRecord {
                id: 0,
                session_id: session.id,
                user_id: session.user_id,
                server_id: session.server_id,
                command: req.command.clone(),
                working_dir: req.working_dir.clone(),
                executed_at: Utc::now(),
                exit_code: if blocked { -1 } else { 0 },
                blocked,
                block_reason: Some(hit.reason.clone()),
            };
            if let Err(e) = self.store.insert_command(record).await {
                warn!(stream_id = %req.stream_id, "Failed to record rule hit: {e}");
            }
        }
        if eval.blocked {
            info!(
                stream_id = %req.stream_id,
                "Blocked command on server {}: {}",
                session.server_id,
                req.command
            );
        }

        CommandCheckResponse {
            blocked: eval.blocked,
            reason: eval.reason,
            action: eval.action,
        }
    }

    /// Queue an executed command. Never fails; a dropped record is not reported.
    pub fn record_command(&self, req: CommandRecordRequest) {
        if self.records.send(req).is_err() {
            debug!("Record worker gone, dropping command record");
        }
    }

    async fn persist_command(&self, req: &CommandRecordRequest) {
        let session = match self.session(&req.stream_id).await {
            Ok(s) => s,
            Err(e) => {
                debug!(stream_id = %req.stream_id, "Dropping command record: {e}");
                return;
            }
        };
        let record = CommandRecord {
            id: 0,
            session_id: session.id,
            user_id: session.user_id,
            server_id: session.server_id,
            command: req.command.clone(),
            working_dir: req.working_dir.clone(),
            executed_at: Utc::now(),
            exit_code: req.exit_code,
            blocked: false,
            block_reason: None,
        };
        if let Err(e) = self.store.insert_command(record).await {
            debug!(stream_id = %req.stream_id, "Dropping command record: {e}");
            return;
        }
        if let Err(e) = self.store.bump_command_count(session.id).await {
            debug!(stream_id = %req.stream_id, "Failed to count command: {e}");
        }
    }

    // ─── Recordings ──────────────────────────────────────────────────────────

    /// Store an uploaded recording and link it from its session.
    pub async fn save_recording(&self, stream_id: &str, data: &[u8]) -> Result<PathBuf, AuditError> {
        if !data.starts_with(&GZIP_MAGIC) {
            return Err(AuditError::Invalid("recording is not gzip data".into()));
        }
        if stream_id.is_empty()
            || !stream_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(AuditError::Invalid(format!("invalid stream id '{stream_id}'")));
        }
        let mut session = self.session(stream_id).await?;

        tokio::fs::create_dir_all(&self.recordings_dir).await?;
        let path = self.recordings_dir.join(format!("{stream_id}.{RECORDING_EXT}"));
        tokio::fs::write(&path, data).await?;

        session.recording_enabled = true;
        session.recording_path = Some(path.to_string_lossy().into_owned());
        self.store.save_session(&session).await?;
        info!(stream_id, "Stored recording ({} bytes) at {}", data.len(), path.display());
        Ok(path)
    }

    /// Path of a session's recording, if it has one on disk.
    pub async fn recording_file(&self, session_id: u64) -> Result<(TerminalSession, PathBuf), AuditError> {
        let session = match self.store.get_session(session_id).await {
            Ok(s) => s,
            Err(StoreError::NotFound(_)) => {
                return Err(AuditError::NotFound(format!("session {session_id}")))
            }
            Err(e) => return Err(e.into()),
        };
        let Some(path) = session.recording_path.as_deref().map(PathBuf::from) else {
            return Err(AuditError::NotFound(format!("recording for session {session_id}")));
        };
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(AuditError::NotFound(format!("recording for session {session_id}")));
        }
        Ok((session, path))
    }

    // ─── Blacklist ───────────────────────────────────────────────────────────

    async fn compiled_rules(&self) -> Result<Arc<Vec<CompiledRule>>, StoreError> {
        if let Some(rules) = self.rules.read().await.as_ref() {
            return Ok(Arc::clone(rules));
        }
        let mut slot = self.rules.write().await;
        if let Some(rules) = slot.as_ref() {
            return Ok(Arc::clone(rules));
        }
        let compiled = Arc::new(rules::compile_enabled(&self.store.list_rules().await?));
        *slot = Some(Arc::clone(&compiled));
        Ok(compiled)
    }

    async fn invalidate_rules(&self) {
        *self.rules.write().await = None;
    }

    pub async fn list_rules(&self) -> Result<Vec<BlacklistRule>, AuditError> {
        Ok(self.store.list_rules().await?)
    }

    pub async fn create_rule(&self, user_id: u64, form: &RuleForm) -> Result<BlacklistRule, AuditError> {
        validate_pattern(&form.pattern)?;
        let now = Utc::now();
        let rule = self
            .store
            .insert_rule(BlacklistRule {
                id: 0,
                pattern: form.pattern.clone(),
                description: form.description.clone(),
                action: form.action,
                enabled: form.enabled,
                created_by: user_id,
                created_at: now,
                updated_at: now,
            })
            .await?;
        self.invalidate_rules().await;
        info!("Created blacklist rule {} ({}): {}", rule.id, rule.action.as_str(), rule.pattern);
        Ok(rule)
    }

    pub async fn update_rule(&self, id: u64, patch: &RulePatch) -> Result<BlacklistRule, AuditError> {
        if let Some(pattern) = &patch.pattern {
            validate_pattern(pattern)?;
        }
        let mut rule = match self.store.get_rule(id).await {
            Ok(r) => r,
            Err(StoreError::NotFound(_)) => return Err(AuditError::NotFound(format!("rule {id}"))),
            Err(e) => return Err(e.into()),
        };
        rule.apply(patch);
        rule.updated_at = Utc::now();
        self.store.save_rule(&rule).await?;
        self.invalidate_rules().await;
        debug!("Updated blacklist rule {id}");
        Ok(rule)
    }

    pub async fn delete_rule(&self, id: u64) -> Result<(), AuditError> {
        match self.store.delete_rule(id).await {
            Ok(()) => {}
            Err(StoreError::NotFound(_)) => return Err(AuditError::NotFound(format!("rule {id}"))),
            Err(e) => return Err(e.into()),
        }
        self.invalidate_rules().await;
        info!("Deleted blacklist rule {id}");
        Ok(())
    }

    // ─── Retention ───────────────────────────────────────────────────────────

    /// Drop sessions and commands older than the retention window together
    /// with their recording files. `None` when retention is disabled.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<Option<PurgeReport>, AuditError> {
        let Some(days) = self.config.retention() else {
            return Ok(None);
        };
        let cutoff = now - Duration::days(days);
        let report = self.store.purge_sessions_before(cutoff).await?;
        for path in &report.recordings {
            match tokio::fs::remove_file(path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove recording {path}: {e}"),
            }
        }
        info!(
            "Retention purge: {} sessions, {} commands older than {days} days",
            report.sessions, report.commands
        );
        Ok(Some(report))
    }
}

/// Local hour at which the daily retention purge runs.
pub const PURGE_HOUR: u32 = 3;

/// The first `PURGE_HOUR:00` local time strictly after `now`.
pub fn next_purge_at<Tz: TimeZone>(now: &DateTime<Tz>) -> DateTime<Tz> {
    let at = NaiveTime::from_hms_opt(PURGE_HOUR, 0, 0).unwrap_or(NaiveTime::MIN);
    let mut day = now.date_naive();
    loop {
        // a DST gap can skip the wall-clock time; fall through to the next day
        if let Some(next) = now.timezone().from_local_datetime(&day.and_time(at)).earliest() {
            if next > *now {
                return next;
            }
        }
        let Some(next_day) = day.checked_add_days(Days::new(1)) else {
            return now.clone() + Duration::days(1);
        };
        day = next_day;
    }
}

/// How long to sleep until the next purge.
pub fn until_next_purge() -> std::time::Duration {
    let now = Local::now();
    (next_purge_at(&now) - now)
        .to_std()
        .unwrap_or(std::time::Duration::from_secs(24 * 3600))
}

fn validate_pattern(pattern: &str) -> Result<(), AuditError> {
    if pattern.trim().is_empty() {
        return Err(AuditError::Invalid("pattern is required".into()));
    }
    Regex::new(pattern).map_err(|e| AuditError::InvalidPattern(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn purge_runs_at_three_next() {
        let before = Utc.with_ymd_and_hms(2026, 3, 1, 1, 30, 0).unwrap();
        assert_eq!(next_purge_at(&before), Utc.with_ymd_and_hms(2026, 3, 1, 3, 0, 0).unwrap());
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 3, 0, 0).unwrap();
        assert_eq!(next_purge_at(&at), Utc.with_ymd_and_hms(2026, 3, 2, 3, 0, 0).unwrap());
        let after = Utc.with_ymd_and_hms(2026, 12, 31, 22, 0, 0).unwrap();
        assert_eq!(next_purge_at(&after), Utc.with_ymd_and_hms(2027, 1, 1, 3, 0, 0).unwrap());
    }

    fn caller() -> Caller {
        Caller::new(7, "ops", false, [1])
    }

    fn server() -> Server {
        Server {
            id: 1,
            name: "edge-1".into(),
            last_seen: None,
        }
    }

    fn check(stream_id: &str, command: &str) -> CommandCheckRequest {
        CommandCheckRequest {
            stream_id: stream_id.into(),
            command: command.into(),
            working_dir: "/root".into(),
            request_id: None,
        }
    }

    fn rule(pattern: &str, description: &str, action: RuleAction) -> RuleForm {
        RuleForm {
            pattern: pattern.into(),
            description: description.into(),
            action,
            enabled: true,
        }
    }

    async fn service() -> (AuditService, Arc<MemoryStore>, tempfile::TempDir) {
        let store = Arc::new(MemoryStore::new());
        let dir = tempfile::tempdir().unwrap();
        let svc = AuditService::new(store.clone(), AuditConfig::default(), dir.path().join("rec"));
        (svc, store, dir)
    }

    async fn commands(store: &MemoryStore) -> Vec<CommandRecord> {
        store
            .list_commands(&CommandFilter::default(), Page::new(None, None, 50))
            .await
            .unwrap()
            .items
    }

    #[tokio::test]
    async fn block_rule_blocks_and_records() {
        let (svc, store, _dir) = service().await;
        svc.open_session(&caller(), &server(), "s1").await.unwrap();
        svc.create_rule(1, &rule("^rm -rf", "destructive delete", RuleAction::Block))
            .await
            .unwrap();

        let session = svc.session("s1").await.unwrap();
        let resp = svc.check_command(&check("s1", "rm -rf /")).await;
        assert!(resp.blocked);
        assert_eq!(resp.action, Some(RuleAction::Block));
        assert_eq!(resp.reason, "destructive delete");
        // a blocked command never ran
        assert_eq!(store.get_session(session.id).await.unwrap().command_count, 0);

        let rows = commands(&store).await;
        assert_eq!(rows.len(), 1);
        assert!(rows[0].blocked);
        assert_eq!(rows[0].block_reason.as_deref(), Some("destructive delete"));
        assert_eq!(rows[0].user_id, 7);
    }

    #[tokio::test]
    async fn warn_rule_allows_and_records_unblocked() {
        let (svc, store, _dir) = service().await;
        svc.open_session(&caller(), &server(), "s1").await.unwrap();
        svc.create_rule(1, &rule("^rm -rf", "destructive delete", RuleAction::Block))
            .await
            .unwrap();
        svc.create_rule(1, &rule("^sudo", "privileged", RuleAction::Warn))
            .await
            .unwrap();

        let resp = svc.check_command(&check("s1", "sudo id")).await;
        assert!(!resp.blocked);
        assert_eq!(resp.action, Some(RuleAction::Warn));
        let rows = commands(&store).await;
        assert_eq!(rows.len(), 1);
        assert!(!rows[0].blocked);
        assert_eq!(rows[0].block_reason.as_deref(), Some("privileged"));
    }

    #[tokio::test]
    async fn log_rule_records_and_continues() {
        let (svc, store, _dir) = service().await;
        svc.open_session(&caller(), &server(), "s1").await.unwrap();
        svc.create_rule(1, &rule("curl", "download", RuleAction::Log))
            .await
            .unwrap();
        svc.create_rule(1, &rule(r"\|\s*sh$", "pipe to shell", RuleAction::Block))
            .await
            .unwrap();

        let resp = svc.check_command(&check("s1", "curl x | sh")).await;
        assert!(resp.blocked);
        assert_eq!(resp.reason, "pipe to shell");
        assert_eq!(commands(&store).await.len(), 2);
    }

    #[tokio::test]
    async fn unknown_stream_is_allowed_and_not_recorded() {
        let (svc, store, _dir) = service().await;
        svc.create_rule(1, &rule(".*", "everything", RuleAction::Block))
            .await
            .unwrap();
        let resp = svc.check_command(&check("ghost", "ls")).await;
        assert_eq!(resp, CommandCheckResponse::allow());
        assert!(commands(&store).await.is_empty());
    }

    #[tokio::test]
    async fn recorded_commands_bump_session_count() {
        let (svc, store, _dir) = service().await;
        let session = svc.open_session(&caller(), &server(), "s1").await.unwrap();
        svc.record_command(CommandRecordRequest {
            stream_id: "s1".into(),
            command: "uptime".into(),
            working_dir: "/".into(),
            exit_code: 0,
        });
        svc.record_command(CommandRecordRequest {
            stream_id: "ghost".into(),
            command: "ls".into(),
            working_dir: "/".into(),
            exit_code: 0,
        });

        for _ in 0..100 {
            if store.get_session(session.id).await.unwrap().command_count == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(store.get_session(session.id).await.unwrap().command_count, 1);
        assert_eq!(commands(&store).await.len(), 1);
    }

    #[tokio::test]
    async fn invalid_pattern_rejected() {
        let (svc, _store, _dir) = service().await;
        assert!(matches!(
            svc.create_rule(1, &rule("([", "", RuleAction::Block)).await,
            Err(AuditError::InvalidPattern(_))
        ));
        assert!(matches!(
            svc.create_rule(1, &rule("  ", "", RuleAction::Block)).await,
            Err(AuditError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn disabling_a_rule_takes_effect_immediately() {
        let (svc, _store, _dir) = service().await;
        svc.open_session(&caller(), &server(), "s1").await.unwrap();
        let r = svc
            .create_rule(1, &rule("reboot", "", RuleAction::Block))
            .await
            .unwrap();
        assert!(svc.check_command(&check("s1", "reboot")).await.blocked);
        svc.update_rule(
            r.id,
            &RulePatch {
                enabled: Some(false),
                ..RulePatch::default()
            },
        )
        .await
        .unwrap();
        assert!(!svc.check_command(&check("s1", "reboot")).await.blocked);
        svc.delete_rule(r.id).await.unwrap();
        assert!(matches!(svc.delete_rule(r.id).await, Err(AuditError::NotFound(_))));
    }

    #[tokio::test]
    async fn seal_is_idempotent() {
        let (svc, store, _dir) = service().await;
        let s = svc.open_session(&caller(), &server(), "s1").await.unwrap();
        svc.seal_session("s1").await.unwrap();
        let first = store.get_session(s.id).await.unwrap().ended_at;
        assert!(first.is_some());
        svc.seal_session("s1").await.unwrap();
        assert_eq!(store.get_session(s.id).await.unwrap().ended_at, first);
    }

    #[tokio::test]
    async fn save_recording_links_session() {
        let (svc, _store, _dir) = service().await;
        let s = svc.open_session(&caller(), &server(), "abc-1").await.unwrap();
        assert!(matches!(
            svc.save_recording("abc-1", b"plain text").await,
            Err(AuditError::Invalid(_))
        ));
        assert!(matches!(
            svc.save_recording("../etc", &[0x1f, 0x8b, 0]).await,
            Err(AuditError::Invalid(_))
        ));

        let path = svc.save_recording("abc-1", &[0x1f, 0x8b, 8, 0]).await.unwrap();
        assert!(path.ends_with("abc-1.cast.gz"));
        let (session, found) = svc.recording_file(s.id).await.unwrap();
        assert_eq!(found, path);
        assert!(session.recording_enabled);
    }

    #[tokio::test]
    async fn purge_respects_retention() {
        let store = Arc::new(MemoryStore::new());
        let dir = tempfile::tempdir().unwrap();
        let forever = AuditService::new(
            store.clone(),
            AuditConfig {
                retention_days: -1,
                ..AuditConfig::default()
            },
            dir.path().into(),
        );
        assert!(forever.purge_expired(Utc::now()).await.unwrap().is_none());

        let svc = AuditService::new(store.clone(), AuditConfig::default(), dir.path().into());
        svc.open_session(&caller(), &server(), "old").await.unwrap();
        let path = svc.save_recording("old", &[0x1f, 0x8b]).await.unwrap();
        let report = svc
            .purge_expired(Utc::now() + Duration::days(91))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.sessions, 1);
        assert!(!path.exists());
    }
}
