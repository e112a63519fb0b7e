use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::WebSocketError;
use crate::websocket::connection::{SessionState, SharedState};

/// Process-unique connection identifier, assigned at accept time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for ConnectionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Instruction for a connection's writer task.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// Already-encoded bytes, shared between recipients of a broadcast.
    Frame(Arc<[u8]>),
    /// Shut the transport down after flushing what is queued.
    Shutdown,
}

/// Cheap, cloneable reference to a live session's outbound queue.
///
/// The queue is bounded. A peer that stops reading until its queue is
/// full gets evicted: its connection task is told to drop it.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: ConnectionId,
    tx: mpsc::Sender<Outbound>,
    state: SharedState,
    evict: Arc<Notify>,
}

impl SessionHandle {
    pub fn new(id: ConnectionId, tx: mpsc::Sender<Outbound>, state: SharedState) -> Self {
        Self {
            id,
            tx,
            state,
            evict: Arc::new(Notify::new()),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    pub fn is_open(&self) -> bool {
        self.state() == SessionState::Open && !self.tx.is_closed()
    }

    pub fn send(&self, bytes: Arc<[u8]>) -> Result<(), WebSocketError> {
        match self.tx.try_send(Outbound::Frame(bytes)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!("Outbound queue of connection {} is full; evicting", self.id);
                self.evict.notify_one();
                Err(WebSocketError::SendError(format!(
                    "connection {} is not keeping up",
                    self.id
                )))
            }
            Err(TrySendError::Closed(_)) => Err(WebSocketError::SendError(format!(
                "connection {} is gone",
                self.id
            ))),
        }
    }

    /// Ask the owning connection task to close the connection.
    pub fn shutdown(&self) {
        self.evict.notify_one();
    }

    /// Resolves once [`shutdown`](Self::shutdown) was called or the queue
    /// overflowed. A request made before anyone waits is not lost.
    pub async fn evicted(&self) {
        self.evict.notified().await;
    }
}

/// Sessions that completed the handshake and have not closed yet.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    sessions: RwLock<HashMap<ConnectionId, SessionHandle>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, handle: SessionHandle) {
        let id = handle.id();
        if self.sessions.write().await.insert(id, handle).is_some() {
            warn!("Connection {} was already registered; replaced", id);
        } else {
            info!("Added connection {} to registry", id);
        }
    }

    /// Removing an id that is not present is a no-op.
    pub async fn remove(&self, id: &ConnectionId) -> Option<SessionHandle> {
        let removed = self.sessions.write().await.remove(id);
        if removed.is_some() {
            info!("Removed connection {} from registry", id);
        }
        removed
    }

    pub async fn get(&self, id: &ConnectionId) -> Option<SessionHandle> {
        self.sessions.read().await.get(id).cloned()
    }

    pub async fn contains(&self, id: &ConnectionId) -> bool {
        self.sessions.read().await.contains_key(id)
    }

    /// Copy of the current entries; the lock is released before returning,
    /// so callers may iterate while sessions come and go.
    pub async fn snapshot(&self) -> Vec<SessionHandle> {
        self.sessions.read().await.values().cloned().collect()
    }

    pub async fn ids(&self) -> Vec<ConnectionId> {
        self.sessions.read().await.keys().copied().collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    pub async fn clear(&self) -> Vec<SessionHandle> {
        self.sessions.write().await.drain().map(|(_, handle)| handle).collect()
    }
}
