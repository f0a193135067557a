//! Agent hub: the table of live agent task channels.
//!
//! Every agent holds one long-lived WebSocket to the dashboard
//! (`/api/agent/connect`). The connection handler registers it here and gets
//! back an [`AgentConnection`] whose receiver feeds the socket. Everything
//! else in the dashboard reaches an agent through [`Dispatcher::dispatch`],
//! which is a non-blocking enqueue onto that channel.
//!
//! A reconnecting agent replaces its previous registration; the stale
//! handler is told to shut down through its `watch` channel. Agents that stop
//! sending anything for `heartbeat_timeout_secs` are evicted by
//! [`AgentHub::sweep_dead_agents`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{info, warn};

use crate::task::{DispatchError, Dispatcher, TaskEnvelope};

/// Depth of each agent's outbound task queue.
const TASK_QUEUE_DEPTH: usize = 256;

struct ConnectedAgent {
    name: String,
    connection_id: u64,
    task_tx: mpsc::Sender<TaskEnvelope>,
    /// Last inbound traffic as ms since hub epoch (lock-free).
    last_heartbeat_ms: Arc<AtomicU64>,
    connected_since: Instant,
    shutdown_tx: watch::Sender<bool>,
}

/// Handle given to the connection handler of one registered agent.
pub struct AgentConnection {
    pub server_id: u64,
    pub connection_id: u64,
    /// Tasks to write to the agent's socket.
    pub tasks: mpsc::Receiver<TaskEnvelope>,
    /// Flips to `true` when this registration is replaced or evicted.
    pub shutdown: watch::Receiver<bool>,
    heartbeat_ms: Arc<AtomicU64>,
    epoch: Instant,
}

impl AgentConnection {
    /// Record inbound traffic from the agent.
    pub fn touch(&self) {
        self.heartbeat_ms.store(ms_since(self.epoch), Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentInfo {
    pub server_id: u64,
    pub name: String,
    pub connected_secs: u64,
    pub last_heartbeat_ago_ms: u64,
}

#[allow(clippy::cast_possible_truncation)]
fn ms_since(epoch: Instant) -> u64 {
    epoch.elapsed().as_millis() as u64
}

/// Cloneable; all clones share the same agent table.
#[derive(Clone)]
pub struct AgentHub {
    agents: Arc<RwLock<HashMap<u64, ConnectedAgent>>>,
    heartbeat_timeout_secs: u64,
    epoch: Instant,
    next_connection_id: Arc<AtomicU64>,
}

impl AgentHub {
    pub fn new(heartbeat_timeout_secs: u64) -> Self {
        Self {
            agents: Arc::new(RwLock::new(HashMap::new())),
            heartbeat_timeout_secs,
            epoch: Instant::now(),
            next_connection_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Register a freshly connected agent, replacing any previous connection.
    pub async fn register(&self, server_id: u64, name: &str) -> AgentConnection {
        let (task_tx, tasks) = mpsc::channel(TASK_QUEUE_DEPTH);
        let (shutdown_tx, shutdown) = watch::channel(false);
        let heartbeat_ms = Arc::new(AtomicU64::new(ms_since(self.epoch)));
        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);

        let agent = ConnectedAgent {
            name: name.to_string(),
            connection_id,
            task_tx,
            last_heartbeat_ms: Arc::clone(&heartbeat_ms),
            connected_since: Instant::now(),
            shutdown_tx,
        };

        {
            let mut agents = self.agents.write().await;
            if let Some(old) = agents.insert(server_id, agent) {
                warn!(server_id, "Agent reconnected while stale connection exists, evicting old");
                let _ = old.shutdown_tx.send(true);
            }
        }
        info!(server_id, name, "Agent registered");

        AgentConnection {
            server_id,
            connection_id,
            tasks,
            shutdown,
            heartbeat_ms,
            epoch: self.epoch,
        }
    }

    /// Drop a registration when its handler exits. A newer connection for the
    /// same server is left alone.
    pub async fn unregister(&self, conn: &AgentConnection) {
        let mut agents = self.agents.write().await;
        if agents
            .get(&conn.server_id)
            .is_some_and(|a| a.connection_id == conn.connection_id)
        {
            agents.remove(&conn.server_id);
            info!(server_id = conn.server_id, "Agent disconnected");
        }
    }

    pub async fn is_connected(&self, server_id: u64) -> bool {
        self.agents.read().await.contains_key(&server_id)
    }

    pub async fn list(&self) -> Vec<AgentInfo> {
        let now_ms = ms_since(self.epoch);
        let agents = self.agents.read().await;
        let mut list: Vec<AgentInfo> = agents
            .iter()
            .map(|(id, a)| AgentInfo {
                server_id: *id,
                name: a.name.clone(),
                connected_secs: a.connected_since.elapsed().as_secs(),
                last_heartbeat_ago_ms: now_ms
                    .saturating_sub(a.last_heartbeat_ms.load(Ordering::Relaxed)),
            })
            .collect();
        list.sort_by_key(|a| a.server_id);
        list
    }

    /// Evict agents silent for longer than the heartbeat timeout.
    ///
    /// Single write-lock pass so a heartbeat landing mid-sweep is not lost.
    pub async fn sweep_dead_agents(&self) -> Vec<u64> {
        let timeout_ms = self.heartbeat_timeout_secs * 1000;
        let now_ms = ms_since(self.epoch);

        let mut agents = self.agents.write().await;
        let dead: Vec<u64> = agents
            .iter()
            .filter(|(_, a)| {
                now_ms.saturating_sub(a.last_heartbeat_ms.load(Ordering::Relaxed)) > timeout_ms
            })
            .map(|(id, _)| *id)
            .collect();
        for id in &dead {
            if let Some(agent) = agents.remove(id) {
                let _ = agent.shutdown_tx.send(true);
                warn!(server_id = id, "Evicted agent (heartbeat timeout)");
            }
        }
        dead
    }

    /// Ask every connected handler to close (server shutdown).
    pub async fn disconnect_all(&self) {
        let mut agents = self.agents.write().await;
        for (id, agent) in agents.drain() {
            let _ = agent.shutdown_tx.send(true);
            info!(server_id = id, "Disconnected agent for shutdown");
        }
    }
}

#[async_trait]
impl Dispatcher for AgentHub {
    async fn dispatch(&self, server_id: u64, envelope: TaskEnvelope) -> Result<(), DispatchError> {
        let tx = {
            let agents = self.agents.read().await;
            agents
                .get(&server_id)
                .map(|a| a.task_tx.clone())
                .ok_or(DispatchError::Unreachable(server_id))?
        };
        tx.try_send(envelope).map_err(|e| {
            warn!(server_id, "Dropping task for agent: {e}");
            DispatchError::Unreachable(server_id)
        })
    }
}
