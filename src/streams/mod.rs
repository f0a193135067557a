//! Stream registry: the rendezvous point for interactive terminal streams.
//!
//! A stream is created when a user asks for a terminal. Two independent
//! connections then attach to it, the user's browser and the agent, in either
//! order. [`StreamRegistry::start_stream`] waits for both sides and pumps
//! bytes between them until one side closes, the stream goes idle, or someone
//! calls [`StreamRegistry::close_stream`].
//!
//! ## Lifecycle
//!
//! ```text
//! create ──► pending ──(both attached)──► pumping ──► closed
//!               │                                       ▲
//!               └──────────(timeout / close)────────────┘
//! ```
//!
//! Closed ids are remembered for the life of the process, so a closed
//! stream can never be recreated or attached to again.
//!
//! ## Concurrency
//!
//! The id → session map sits behind an `RwLock`; lookups take the read lock,
//! create and close take the write lock. Each session guards its two
//! attachment slots with a short `std::sync::Mutex` that is never held
//! across an `.await`. Cancellation of a pending or pumping stream goes
//! through the session's `CancellationToken`.

mod transport;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Notify, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub use transport::{websocket_transport, ChannelTransport, StreamTransport};

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("stream not found")]
    NotFound,

    #[error("stream id already used")]
    DuplicateId,

    #[error("{0} side already attached")]
    AlreadyAttached(Side),

    #[error("stream already started")]
    AlreadyStarted,

    #[error("stream timed out")]
    Timeout,

    #[error("stream closed")]
    Closed,

    #[error("transport closed")]
    TransportClosed,
}

/// Which end of the stream a transport belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    User,
    Agent,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Side::User => "user",
            Side::Agent => "agent",
        })
    }
}

type BoxTransport = Box<dyn StreamTransport>;

#[derive(Default)]
struct Slots {
    user: Option<BoxTransport>,
    agent: Option<BoxTransport>,
    user_attached: bool,
    agent_attached: bool,
}

/// One pending or pumping stream.
pub struct StreamSession {
    id: String,
    created: Instant,
    slots: Mutex<Slots>,
    attached: Notify,
    cancel: CancellationToken,
    started: AtomicBool,
}

impl StreamSession {
    fn new(id: String) -> Self {
        Self {
            id,
            created: Instant::now(),
            slots: Mutex::new(Slots::default()),
            attached: Notify::new(),
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// `(user_attached, agent_attached)`.
    pub fn attached_sides(&self) -> (bool, bool) {
        self.slots
            .lock()
            .map(|s| (s.user_attached, s.agent_attached))
            .unwrap_or((false, false))
    }

    fn attach(&self, side: Side, transport: BoxTransport) -> Result<(), StreamError> {
        let mut guard = self.slots.lock().map_err(|_| StreamError::Closed)?;
        if self.cancel.is_cancelled() {
            return Err(StreamError::Closed);
        }
        let slots = &mut *guard;
        let (flag, slot) = match side {
            Side::User => (&mut slots.user_attached, &mut slots.user),
            Side::Agent => (&mut slots.agent_attached, &mut slots.agent),
        };
        if *flag {
            return Err(StreamError::AlreadyAttached(side));
        }
        *flag = true;
        *slot = Some(transport);
        drop(guard);
        self.attached.notify_one();
        Ok(())
    }

    /// Both transports, if both are present.
    fn take_pair(&self) -> Option<(BoxTransport, BoxTransport)> {
        let mut slots = self.slots.lock().ok()?;
        if slots.user.is_some() && slots.agent.is_some() {
            Some((slots.user.take()?, slots.agent.take()?))
        } else {
            None
        }
    }

    fn take_all(&self) -> Vec<BoxTransport> {
        let Ok(mut slots) = self.slots.lock() else {
            return Vec::new();
        };
        [slots.user.take(), slots.agent.take()]
            .into_iter()
            .flatten()
            .collect()
    }
}

#[derive(Default)]
struct RegistryInner {
    streams: HashMap<String, Arc<StreamSession>>,
    /// Ids that were closed and may never be reused.
    retired: HashSet<String>,
}

/// Process-wide table of stream sessions.
///
/// Cloneable; all clones share the same table.
#[derive(Clone, Default)]
pub struct StreamRegistry {
    inner: Arc<RwLock<RegistryInner>>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new pending stream.
    pub async fn create_stream(&self, id: &str) -> Result<(), StreamError> {
        let mut inner = self.inner.write().await;
        if inner.streams.contains_key(id) || inner.retired.contains(id) {
            return Err(StreamError::DuplicateId);
        }
        inner
            .streams
            .insert(id.to_string(), Arc::new(StreamSession::new(id.to_string())));
        info!("Created stream {id}");
        Ok(())
    }

    pub async fn get_stream(&self, id: &str) -> Result<Arc<StreamSession>, StreamError> {
        self.inner
            .read()
            .await
            .streams
            .get(id)
            .cloned()
            .ok_or(StreamError::NotFound)
    }

    /// Attach the user's side.
    pub async fn user_connected(
        &self,
        id: &str,
        transport: impl StreamTransport + 'static,
    ) -> Result<(), StreamError> {
        self.attach(id, Side::User, Box::new(transport)).await
    }

    /// Attach the agent's side.
    pub async fn agent_connected(
        &self,
        id: &str,
        transport: impl StreamTransport + 'static,
    ) -> Result<(), StreamError> {
        self.attach(id, Side::Agent, Box::new(transport)).await
    }

    async fn attach(&self, id: &str, side: Side, transport: BoxTransport) -> Result<(), StreamError> {
        let session = self.get_stream(id).await?;
        session.attach(side, transport)?;
        debug!("Stream {id}: {side} side attached");
        Ok(())
    }

    /// Wait for both sides, then pump until one side ends.
    ///
    /// `idle` bounds both the wait for the second side and any gap without
    /// traffic once pumping. Whatever the outcome, the stream is closed when
    /// this returns.
    pub async fn start_stream(&self, id: &str, idle: Duration) -> Result<(), StreamError> {
        let session = self.get_stream(id).await?;
        if session.is_closed() {
            return Err(StreamError::Closed);
        }
        if session.started.swap(true, Ordering::SeqCst) {
            return Err(StreamError::AlreadyStarted);
        }

        let result = self.run(&session, idle).await;
        self.close_stream(id).await;
        match &result {
            Ok(()) => info!("Stream {id} finished"),
            Err(e) => info!("Stream {id} ended: {e}"),
        }
        result
    }

    async fn run(&self, session: &StreamSession, idle: Duration) -> Result<(), StreamError> {
        let deadline = Instant::now() + idle;
        let (mut user, mut agent) = loop {
            if let Some(pair) = session.take_pair() {
                break pair;
            }
            tokio::select! {
                () = session.attached.notified() => {}
                () = tokio::time::sleep_until(deadline) => return Err(StreamError::Timeout),
                () = session.cancel.cancelled() => return Err(StreamError::Closed),
            }
        };
        debug!("Stream {}: both sides attached, pumping", session.id);

        let result = pump(session, user.as_mut(), agent.as_mut(), idle).await;
        user.close().await;
        agent.close().await;
        result
    }

    /// Close a stream. Idempotent; unknown ids are ignored.
    pub async fn close_stream(&self, id: &str) {
        let session = {
            let mut inner = self.inner.write().await;
            let session = inner.streams.remove(id);
            if session.is_some() {
                inner.retired.insert(id.to_string());
            }
            session
        };
        let Some(session) = session else {
            return;
        };
        session.cancel.cancel();
        for mut transport in session.take_all() {
            transport.close().await;
        }
        debug!("Closed stream {id}");
    }

    /// Close streams whose pump never started within `max_pending`.
    pub async fn sweep_pending(&self, max_pending: Duration) -> Vec<String> {
        let stale: Vec<String> = {
            let inner = self.inner.read().await;
            inner
                .streams
                .values()
                .filter(|s| !s.is_started() && s.age() > max_pending)
                .map(|s| s.id.clone())
                .collect()
        };
        for id in &stale {
            info!("Sweeping stale stream {id}");
            self.close_stream(id).await;
        }
        stale
    }

    /// Number of live (pending or pumping) streams.
    pub async fn len(&self) -> usize {
        self.inner.read().await.streams.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

async fn pump(
    session: &StreamSession,
    user: &mut dyn StreamTransport,
    agent: &mut dyn StreamTransport,
    idle: Duration,
) -> Result<(), StreamError> {
    let mut idle_deadline = Instant::now() + idle;
    loop {
        let (data, to) = tokio::select! {
            () = session.cancel.cancelled() => return Err(StreamError::Closed),
            () = tokio::time::sleep_until(idle_deadline) => return Err(StreamError::Timeout),
            chunk = user.recv() => match chunk {
                Some(data) => (data, Side::Agent),
                None => return Ok(()),
            },
            chunk = agent.recv() => match chunk {
                Some(data) => (data, Side::User),
                None => return Ok(()),
            },
        };
        idle_deadline = Instant::now() + idle;
        let peer: &mut dyn StreamTransport = match to {
            Side::User => &mut *user,
            Side::Agent => &mut *agent,
        };
        // A peer that stops reading must not pin the pump past close or idle.
        let sent = tokio::select! {
            () = session.cancel.cancelled() => return Err(StreamError::Closed),
            () = tokio::time::sleep_until(idle_deadline) => return Err(StreamError::Timeout),
            sent = peer.send(data) => sent,
        };
        if sent.is_err() {
            return Ok(());
        }
    }
}
