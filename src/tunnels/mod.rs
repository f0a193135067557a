//! Port-forward tunnel manager.
//!
//! [`TunnelService`] owns the set of [`TunnelMapping`]s. Every mapping lives
//! in the store and in an id-ordered in-memory cache; the cache is updated
//! under the same write lock as the store write, so readers never see a row
//! the store does not have.
//!
//! Starting and stopping a mapping is a task dispatched to the owning agent
//! over the hub. Dispatch is awaited synchronously, and the outcome (or the
//! agent's later [`TunnelStatusReport`]) is written back as the mapping's
//! status:
//!
//! - start, agent reachable → `running`
//! - start, agent unreachable → `error` ("server not found or not connected")
//! - stop → always `stopped`, reachable or not
//!
//! Administrative operations are serialized by a single mutex so the port
//! conflict check and the write that follows it cannot interleave with
//! another edit.

pub mod model;

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::TunnelConfig;
use crate::store::{Store, StoreError};
use crate::task::{DispatchError, Dispatcher, TaskEnvelope, TaskKind, TunnelStatusReport, TunnelTask};
use model::{MappingType, TunnelForm, TunnelMapping, TunnelStatus};

const UNREACHABLE_MESSAGE: &str = "server not found or not connected";

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("mapping {0} not found")]
    NotFound(u64),

    #[error("{mapping_type} port {source_port} is already mapped on server {server_id}")]
    Conflict {
        server_id: u64,
        mapping_type: &'static str,
        source_port: u16,
    },

    #[error("invalid mapping: {0}")]
    Invalid(String),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Cloneable; all clones share the same cache.
#[derive(Clone)]
pub struct TunnelService {
    store: Arc<dyn Store>,
    dispatcher: Arc<dyn Dispatcher>,
    cache: Arc<RwLock<BTreeMap<u64, TunnelMapping>>>,
    ops: Arc<Mutex<()>>,
    config: TunnelConfig,
}

impl TunnelService {
    /// Build the service and warm the cache from the store.
    pub async fn load(
        store: Arc<dyn Store>,
        dispatcher: Arc<dyn Dispatcher>,
        config: TunnelConfig,
    ) -> Result<Self, TunnelError> {
        let rows = store.list_mappings().await?;
        let cache: BTreeMap<u64, TunnelMapping> = rows.into_iter().map(|m| (m.id, m)).collect();
        info!("Loaded {} tunnel mappings", cache.len());
        Ok(Self {
            store,
            dispatcher,
            cache: Arc::new(RwLock::new(cache)),
            ops: Arc::new(Mutex::new(())),
            config,
        })
    }

    /// All mappings ordered by id.
    pub async fn list(&self) -> Vec<TunnelMapping> {
        self.cache.read().await.values().cloned().collect()
    }

    /// Mappings on servers in `servers`, ordered by id.
    pub async fn list_for_servers(&self, servers: &HashSet<u64>) -> Vec<TunnelMapping> {
        self.cache
            .read()
            .await
            .values()
            .filter(|m| servers.contains(&m.server_id))
            .cloned()
            .collect()
    }

    pub async fn get(&self, id: u64) -> Result<TunnelMapping, TunnelError> {
        self.cache
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(TunnelError::NotFound(id))
    }

    /// Create a mapping in `stopped` state; start it right away if enabled.
    ///
    /// A failed start does not fail the create; it shows up as `error` status.
    pub async fn create(&self, user_id: u64, form: &TunnelForm) -> Result<TunnelMapping, TunnelError> {
        form.validate().map_err(TunnelError::Invalid)?;
        let _ops = self.ops.lock().await;
        self.check_conflict(form, None).await?;

        let now = Utc::now();
        let draft = TunnelMapping {
            id: 0,
            name: form.name.clone(),
            server_id: form.server_id,
            mapping_type: form.mapping_type,
            source_port: form.source_port,
            target_host: form.target_host.trim().to_string(),
            target_port: form.target_port,
            enabled: form.enabled,
            status: TunnelStatus::Stopped,
            last_error: String::new(),
            last_start_at: None,
            user_id,
            created_at: now,
            updated_at: now,
        };
        let mapping = {
            let mut cache = self.cache.write().await;
            let mapping = self.store.insert_mapping(draft).await?;
            cache.insert(mapping.id, mapping.clone());
            mapping
        };
        info!(
            "Created tunnel {} ({} {} -> {}:{}) on server {}",
            mapping.id,
            mapping.mapping_type.as_str(),
            mapping.source_port,
            mapping.target_host,
            mapping.target_port,
            mapping.server_id
        );

        if mapping.enabled {
            return Ok(self.start_locked(&mapping).await.unwrap_or_else(|(m, _)| m));
        }
        Ok(mapping)
    }

    /// Edit a mapping.
    ///
    /// If the mapping was enabled and the edit moves the forward (server,
    /// type, port or target) or disables it, the old forward is stopped
    /// first. The new definition is started when it is enabled and either
    /// changed or not already running.
    pub async fn update(&self, id: u64, form: &TunnelForm) -> Result<TunnelMapping, TunnelError> {
        form.validate().map_err(TunnelError::Invalid)?;
        let _ops = self.ops.lock().await;
        let existing = self.get(id).await?;
        self.check_conflict(form, Some(id)).await?;

        let moved = existing.forward_differs(form);
        if existing.enabled && (moved || !form.enabled) {
            self.stop_locked(&existing).await?;
        }

        let mut updated = self.get(id).await?;
        updated.apply(form);
        updated.target_host = updated.target_host.trim().to_string();
        updated.updated_at = Utc::now();
        self.persist(&updated).await?;
        debug!("Updated tunnel {id}");

        if updated.enabled && (moved || updated.status != TunnelStatus::Running) {
            return Ok(self.start_locked(&updated).await.unwrap_or_else(|(m, _)| m));
        }
        Ok(updated)
    }

    /// Delete several mappings, stopping enabled ones first. Unknown ids are skipped.
    pub async fn delete_batch(&self, ids: &[u64]) -> Result<u64, TunnelError> {
        let _ops = self.ops.lock().await;
        for id in ids {
            let Ok(mapping) = self.get(*id).await else {
                continue;
            };
            if mapping.enabled || mapping.status == TunnelStatus::Running {
                self.stop_locked(&mapping).await?;
            }
        }
        let removed = {
            let mut cache = self.cache.write().await;
            let removed = self.store.delete_mappings(ids).await?;
            for id in ids {
                cache.remove(id);
            }
            removed
        };
        info!("Deleted {removed} tunnel mappings");
        Ok(removed)
    }

    /// Dispatch a start. Fails with `Dispatch(Unreachable)` after recording
    /// `error` status when the agent has no live channel.
    pub async fn start(&self, id: u64) -> Result<TunnelMapping, TunnelError> {
        let _ops = self.ops.lock().await;
        let mapping = self.get(id).await?;
        self.start_locked(&mapping).await.map_err(|(_, e)| e)
    }

    /// Dispatch a stop. Status ends `stopped` whether or not the agent is reachable.
    pub async fn stop(&self, id: u64) -> Result<TunnelMapping, TunnelError> {
        let _ops = self.ops.lock().await;
        let mapping = self.get(id).await?;
        self.stop_locked(&mapping).await
    }

    /// Apply a status reported by the agent. Reports for unknown mappings are dropped.
    ///
    /// Serialized with edits so an in-flight update cannot overwrite the report.
    pub async fn apply_status_report(&self, server_id: u64, report: &TunnelStatusReport) {
        let _ops = self.ops.lock().await;
        let Ok(mapping) = self.get(report.mapping_id).await else {
            debug!("Status report for unknown tunnel {}", report.mapping_id);
            return;
        };
        if mapping.server_id != server_id {
            warn!(
                "Server {server_id} reported status for tunnel {} owned by server {}",
                report.mapping_id, mapping.server_id
            );
            return;
        }
        if let Err(e) = self
            .set_status(report.mapping_id, report.status, &report.error)
            .await
        {
            warn!("Failed to apply status report for tunnel {}: {e}", report.mapping_id);
        }
    }

    /// Re-dispatch every enabled mapping for a server (agent reconnect).
    pub async fn resume_server(&self, server_id: u64) {
        let _ops = self.ops.lock().await;
        let enabled: Vec<TunnelMapping> = self
            .cache
            .read()
            .await
            .values()
            .filter(|m| m.server_id == server_id && m.enabled)
            .cloned()
            .collect();
        for mapping in enabled {
            if let Err((_, e)) = self.start_locked(&mapping).await {
                warn!("Failed to resume tunnel {} on server {server_id}: {e}", mapping.id);
            }
        }
    }

    async fn check_conflict(&self, form: &TunnelForm, exclude: Option<u64>) -> Result<(), TunnelError> {
        let conflicts = self
            .store
            .count_port_conflicts(form.server_id, form.mapping_type, form.source_port, exclude)
            .await?;
        if conflicts > 0 {
            return Err(TunnelError::Conflict {
                server_id: form.server_id,
                mapping_type: MappingType::as_str(form.mapping_type),
                source_port: form.source_port,
            });
        }
        Ok(())
    }

    /// On failure the error comes back together with the mapping as persisted.
    async fn start_locked(
        &self,
        mapping: &TunnelMapping,
    ) -> Result<TunnelMapping, (TunnelMapping, TunnelError)> {
        let task = TunnelTask::start(mapping, &self.config.gateway_host, self.config.ssh_options());
        let sent = match TaskEnvelope::new(TaskKind::Tunnel, &task) {
            Ok(envelope) => self.dispatcher.dispatch(mapping.server_id, envelope).await,
            Err(e) => Err(DispatchError::Encode(e)),
        };

        match sent {
            Ok(()) => {
                info!("Started tunnel {} on server {}", mapping.id, mapping.server_id);
                self.set_status(mapping.id, TunnelStatus::Running, "")
                    .await
                    .map_err(|e| (mapping.clone(), e))
            }
            Err(dispatch_err) => {
                let message = match &dispatch_err {
                    DispatchError::Unreachable(_) => UNREACHABLE_MESSAGE.to_string(),
                    DispatchError::Encode(e) => e.to_string(),
                };
                warn!("Failed to start tunnel {}: {message}", mapping.id);
                let current = self
                    .set_status(mapping.id, TunnelStatus::Error, &message)
                    .await
                    .map_err(|e| (mapping.clone(), e))?;
                Err((current, dispatch_err.into()))
            }
        }
    }

    async fn stop_locked(&self, mapping: &TunnelMapping) -> Result<TunnelMapping, TunnelError> {
        match TaskEnvelope::new(TaskKind::Tunnel, &TunnelTask::stop(mapping.id)) {
            Ok(envelope) => {
                if let Err(e) = self.dispatcher.dispatch(mapping.server_id, envelope).await {
                    debug!("Stop for tunnel {} not delivered: {e}", mapping.id);
                }
            }
            Err(e) => warn!("Failed to encode stop for tunnel {}: {e}", mapping.id),
        }
        info!("Stopped tunnel {}", mapping.id);
        self.set_status(mapping.id, TunnelStatus::Stopped, "").await
    }

    async fn set_status(
        &self,
        id: u64,
        status: TunnelStatus,
        error: &str,
    ) -> Result<TunnelMapping, TunnelError> {
        let mut cache = self.cache.write().await;
        let mut mapping = cache.get(&id).cloned().ok_or(TunnelError::NotFound(id))?;
        mapping.status = status;
        mapping.last_error = error.to_string();
        let now = Utc::now();
        if status == TunnelStatus::Running {
            mapping.last_start_at = Some(now);
        }
        mapping.updated_at = now;
        self.store.save_mapping(&mapping).await?;
        cache.insert(id, mapping.clone());
        Ok(mapping)
    }

    async fn persist(&self, mapping: &TunnelMapping) -> Result<(), TunnelError> {
        let mut cache = self.cache.write().await;
        self.store.save_mapping(mapping).await?;
        cache.insert(mapping.id, mapping.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::AgentHub;
    use crate::store::MemoryStore;
    use crate::task::{Task, TunnelAction};

    fn form(server_id: u64, port: u16, enabled: bool) -> TunnelForm {
        TunnelForm {
            name: format!("fwd-{port}"),
            server_id,
            mapping_type: MappingType::Local,
            source_port: port,
            target_host: "127.0.0.1".into(),
            target_port: 22,
            enabled,
        }
    }

    async fn service(hub: &AgentHub) -> (TunnelService, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let svc = TunnelService::load(
            store.clone(),
            Arc::new(hub.clone()),
            TunnelConfig::default(),
        )
        .await
        .unwrap();
        (svc, store)
    }

    #[tokio::test]
    async fn conflict_then_port_change_frees_the_slot() {
        let hub = AgentHub::new(90);
        let (svc, _store) = service(&hub).await;
        let a = svc.create(1, &form(1, 8080, false)).await.unwrap();
        assert!(matches!(
            svc.create(1, &form(1, 8080, false)).await,
            Err(TunnelError::Conflict { source_port: 8080, .. })
        ));
        // same port on a different server is fine
        svc.create(1, &form(2, 8080, false)).await.unwrap();

        svc.update(a.id, &form(1, 8081, false)).await.unwrap();
        svc.create(1, &form(1, 8080, false)).await.unwrap();
    }

    #[tokio::test]
    async fn editing_a_mapping_does_not_conflict_with_itself() {
        let hub = AgentHub::new(90);
        let (svc, _store) = service(&hub).await;
        let a = svc.create(1, &form(1, 9000, false)).await.unwrap();
        let mut renamed = form(1, 9000, false);
        renamed.name = "renamed".into();
        let updated = svc.update(a.id, &renamed).await.unwrap();
        assert_eq!(updated.name, "renamed");
    }

    #[tokio::test]
    async fn enabled_create_without_agent_records_error() {
        let hub = AgentHub::new(90);
        let (svc, store) = service(&hub).await;
        let m = svc.create(1, &form(5, 2222, true)).await.unwrap();
        assert_eq!(m.status, TunnelStatus::Error);
        assert_eq!(m.last_error, UNREACHABLE_MESSAGE);
        // cache and store agree
        let stored = store.list_mappings().await.unwrap();
        assert_eq!(stored[0], svc.get(m.id).await.unwrap());
    }

    #[tokio::test]
    async fn start_without_agent_fails_unreachable() {
        let hub = AgentHub::new(90);
        let (svc, _store) = service(&hub).await;
        let m = svc.create(1, &form(5, 2222, false)).await.unwrap();
        assert!(matches!(
            svc.start(m.id).await,
            Err(TunnelError::Dispatch(DispatchError::Unreachable(5)))
        ));
        assert_eq!(svc.get(m.id).await.unwrap().status, TunnelStatus::Error);
    }

    #[tokio::test]
    async fn stop_without_agent_still_stops() {
        let hub = AgentHub::new(90);
        let (svc, _store) = service(&hub).await;
        let m = svc.create(1, &form(5, 2222, true)).await.unwrap();
        let stopped = svc.stop(m.id).await.unwrap();
        assert_eq!(stopped.status, TunnelStatus::Stopped);
        assert!(stopped.last_error.is_empty());
    }

    #[tokio::test]
    async fn start_with_agent_dispatches_and_runs() {
        let hub = AgentHub::new(90);
        let mut conn = hub.register(3, "edge").await;
        let (svc, _store) = service(&hub).await;
        let m = svc.create(1, &form(3, 8443, true)).await.unwrap();
        assert_eq!(m.status, TunnelStatus::Running);
        assert!(m.last_start_at.is_some());

        let env = conn.tasks.recv().await.unwrap();
        let Task::Tunnel(task) = Task::decode(&env).unwrap() else {
            panic!("expected tunnel task");
        };
        assert_eq!(task.action, TunnelAction::Start);
        assert_eq!(task.source_port, 8443);
        assert_eq!(task.options.get("ServerAliveInterval").map(String::as_str), Some("30"));
        assert_eq!(task.options.get("ServerAliveCountMax").map(String::as_str), Some("3"));
    }

    #[tokio::test]
    async fn moving_an_enabled_mapping_stops_then_starts() {
        let hub = AgentHub::new(90);
        let mut conn = hub.register(3, "edge").await;
        let (svc, _store) = service(&hub).await;
        let m = svc.create(1, &form(3, 8000, true)).await.unwrap();
        let _start = conn.tasks.recv().await.unwrap();

        let updated = svc.update(m.id, &form(3, 8001, true)).await.unwrap();
        assert_eq!(updated.status, TunnelStatus::Running);
        assert_eq!(updated.source_port, 8001);

        let actions: Vec<TunnelAction> = [conn.tasks.recv().await.unwrap(), conn.tasks.recv().await.unwrap()]
            .iter()
            .map(|env| match Task::decode(env).unwrap() {
                Task::Tunnel(t) => t.action,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(actions, vec![TunnelAction::Stop, TunnelAction::Start]);
    }

    #[tokio::test]
    async fn batch_delete_stops_enabled_first() {
        let hub = AgentHub::new(90);
        let mut conn = hub.register(3, "edge").await;
        let (svc, store) = service(&hub).await;
        let a = svc.create(1, &form(3, 7000, true)).await.unwrap();
        let b = svc.create(1, &form(3, 7001, false)).await.unwrap();
        let _start = conn.tasks.recv().await.unwrap();

        let removed = svc.delete_batch(&[a.id, b.id, 999]).await.unwrap();
        assert_eq!(removed, 2);
        let Task::Tunnel(stop) = Task::decode(&conn.tasks.recv().await.unwrap()).unwrap() else {
            panic!("expected stop");
        };
        assert_eq!(stop.action, TunnelAction::Stop);
        assert_eq!(stop.mapping_id, a.id);
        assert!(svc.list().await.is_empty());
        assert!(store.list_mappings().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn status_report_updates_mapping() {
        let hub = AgentHub::new(90);
        let _conn = hub.register(3, "edge").await;
        let (svc, _store) = service(&hub).await;
        let m = svc.create(1, &form(3, 7100, true)).await.unwrap();

        let report = TunnelStatusReport {
            mapping_id: m.id,
            status: TunnelStatus::Error,
            error: "bind: address in use".into(),
            pid: None,
        };
        // a report from the wrong server is ignored
        svc.apply_status_report(4, &report).await;
        assert_eq!(svc.get(m.id).await.unwrap().status, TunnelStatus::Running);

        svc.apply_status_report(3, &report).await;
        let after = svc.get(m.id).await.unwrap();
        assert_eq!(after.status, TunnelStatus::Error);
        assert_eq!(after.last_error, "bind: address in use");
    }

    /// Each dispatch consumes one permit and waits for it.
    struct GatedDispatcher {
        permits: tokio::sync::Semaphore,
    }

    #[async_trait::async_trait]
    impl Dispatcher for GatedDispatcher {
        async fn dispatch(&self, _server_id: u64, _envelope: TaskEnvelope) -> Result<(), DispatchError> {
            if let Ok(permit) = self.permits.acquire().await {
                permit.forget();
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn status_report_waits_for_inflight_edit() {
        let gate = Arc::new(GatedDispatcher {
            permits: tokio::sync::Semaphore::new(1),
        });
        let svc = TunnelService::load(Arc::new(MemoryStore::new()), gate.clone(), TunnelConfig::default())
            .await
            .unwrap();
        let m = svc.create(1, &form(3, 7200, true)).await.unwrap();
        assert_eq!(m.status, TunnelStatus::Running);

        // disabling sends a stop that sits in the dispatcher
        let edit = {
            let svc = svc.clone();
            let mut disabled = form(3, 7200, false);
            disabled.name = "renamed".into();
            tokio::spawn(async move { svc.update(m.id, &disabled).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let report = TunnelStatusReport {
            mapping_id: m.id,
            status: TunnelStatus::Error,
            error: "ssh exited (255)".into(),
            pid: None,
        };
        let late = {
            let svc = svc.clone();
            tokio::spawn(async move { svc.apply_status_report(3, &report).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!late.is_finished());

        gate.permits.add_permits(1);
        edit.await.unwrap().unwrap();
        late.await.unwrap();
        let after = svc.get(m.id).await.unwrap();
        assert_eq!(after.name, "renamed");
        assert_eq!(after.status, TunnelStatus::Error);
        assert_eq!(after.last_error, "ssh exited (255)");
    }

    #[tokio::test]
    async fn list_is_ordered_by_id_and_filterable() {
        let hub = AgentHub::new(90);
        let (svc, _store) = service(&hub).await;
        let a = svc.create(1, &form(2, 1000, false)).await.unwrap();
        let b = svc.create(1, &form(1, 1001, false)).await.unwrap();
        let ids: Vec<u64> = svc.list().await.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![a.id, b.id]);
        let only_one = svc.list_for_servers(&HashSet::from([1])).await;
        assert_eq!(only_one.len(), 1);
        assert_eq!(only_one[0].id, b.id);
    }

    #[tokio::test]
    async fn invalid_form_rejected_before_any_write() {
        let hub = AgentHub::new(90);
        let (svc, store) = service(&hub).await;
        assert!(matches!(
            svc.create(1, &form(1, 0, false)).await,
            Err(TunnelError::Invalid(_))
        ));
        assert!(store.list_mappings().await.unwrap().is_empty());
    }
}
