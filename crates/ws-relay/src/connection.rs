use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::envelope::{Reply, RequestId};

/// Unique identifier for one accepted WebSocket connection.
pub type ConnectionId = uuid::Uuid;

/// Frames queued for a connection's writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    /// Liveness ping.
    Ping,
    /// Send a close frame and stop writing.
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("outbound queue is full")]
    Full,
    #[error("connection writer has shut down")]
    Closed,
}

/// The role a connection registered as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Unregistered,
    Provider,
    Consumer,
}

#[derive(Debug)]
enum Session {
    Unregistered,
    Provider {
        identity: String,
    },
    Consumer {
        target: String,
        secret: String,
        pending: HashSet<RequestId>,
    },
}

/// Returned when a connection that already holds a role tries to register
/// again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("connection already registered as {0:?}")]
pub struct AlreadyRegistered(pub Role);

/// Handle to one live peer connection.
///
/// The session (role, identity or binding, pending requests) is set exactly
/// once at registration and is discarded together with the handle when the
/// connection closes. All mutation goes through a per-handle mutex that is
/// never held across an await point.
pub struct Connection {
    id: ConnectionId,
    remote_addr: SocketAddr,
    outbound: mpsc::Sender<Outbound>,
    session: Mutex<Session>,
    alive: AtomicBool,
    terminate: CancellationToken,
}

impl Connection {
    /// Create a handle with an outbound queue of `queue` frames. The returned
    /// receiver is drained by the connection's writer task.
    pub fn new(remote_addr: SocketAddr, queue: usize) -> (Arc<Self>, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(queue.max(1));
        let conn = Arc::new(Self {
            id: uuid::Uuid::new_v4(),
            remote_addr,
            outbound: tx,
            session: Mutex::new(Session::Unregistered),
            alive: AtomicBool::new(true),
            terminate: CancellationToken::new(),
        });
        (conn, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    fn enqueue(&self, frame: Outbound) -> Result<(), SendError> {
        self.outbound.try_send(frame).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => SendError::Full,
            mpsc::error::TrySendError::Closed(_) => SendError::Closed,
        })
    }

    /// Queue a text frame without waiting.
    pub fn send_text(&self, text: impl Into<String>) -> Result<(), SendError> {
        self.enqueue(Outbound::Text(text.into()))
    }

    pub fn reply(&self, reply: Reply) -> Result<(), SendError> {
        self.send_text(reply.to_string())
    }

    pub fn ping(&self) -> Result<(), SendError> {
        self.enqueue(Outbound::Ping)
    }

    /// Queue a graceful close. Frames queued earlier are still written.
    pub fn close(&self) -> Result<(), SendError> {
        self.enqueue(Outbound::Close)
    }

    /// Drop the connection without a close handshake.
    pub fn terminate(&self) {
        self.terminate.cancel();
    }

    pub fn is_terminated(&self) -> bool {
        self.terminate.is_cancelled()
    }

    /// Resolves once [`terminate`](Self::terminate) has been called.
    pub fn terminated(&self) -> WaitForCancellationFuture<'_> {
        self.terminate.cancelled()
    }

    // ------------------------------------------------------------------
    // Liveness
    // ------------------------------------------------------------------

    pub fn mark_alive(&self) {
        self.alive.store(true, Ordering::Release);
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Clear the liveness flag, returning whether it was set.
    pub(crate) fn take_alive(&self) -> bool {
        self.alive.swap(false, Ordering::AcqRel)
    }

    // ------------------------------------------------------------------
    // Session
    // ------------------------------------------------------------------

    pub fn role(&self) -> Role {
        match *self.session.lock() {
            Session::Unregistered => Role::Unregistered,
            Session::Provider { .. } => Role::Provider,
            Session::Consumer { .. } => Role::Consumer,
        }
    }

    /// The identity this connection registered under, if it is a provider.
    pub fn provider_identity(&self) -> Option<String> {
        match &*self.session.lock() {
            Session::Provider { identity } => Some(identity.clone()),
            _ => None,
        }
    }

    /// The `(target, secret)` pair this connection is bound to, if it is a
    /// consumer.
    pub fn consumer_binding(&self) -> Option<(String, String)> {
        match &*self.session.lock() {
            Session::Consumer { target, secret, .. } => Some((target.clone(), secret.clone())),
            _ => None,
        }
    }

    pub fn pending_requests(&self) -> usize {
        match &*self.session.lock() {
            Session::Consumer { pending, .. } => pending.len(),
            _ => 0,
        }
    }

    pub(crate) fn become_provider(&self, identity: &str) -> Result<(), AlreadyRegistered> {
        self.transition(Session::Provider {
            identity: identity.to_string(),
        })
    }

    pub(crate) fn become_consumer(&self, target: &str, secret: &str) -> Result<(), AlreadyRegistered> {
        self.transition(Session::Consumer {
            target: target.to_string(),
            secret: secret.to_string(),
            pending: HashSet::new(),
        })
    }

    fn transition(&self, next: Session) -> Result<(), AlreadyRegistered> {
        let mut session = self.session.lock();
        match *session {
            Session::Unregistered => {
                *session = next;
                Ok(())
            }
            Session::Provider { .. } => Err(AlreadyRegistered(Role::Provider)),
            Session::Consumer { .. } => Err(AlreadyRegistered(Role::Consumer)),
        }
    }

    /// Record an outstanding request. Returns `false` if this is not a
    /// consumer.
    pub(crate) fn track_request(&self, req_id: &str) -> bool {
        match &mut *self.session.lock() {
            Session::Consumer { pending, .. } => {
                pending.insert(req_id.to_string());
                true
            }
            _ => false,
        }
    }

    /// If this is a consumer bound to `provider` that is waiting on
    /// `req_id`, clear the entry and return `true`.
    pub(crate) fn resolve_request(&self, provider: &str, req_id: &str) -> bool {
        match &mut *self.session.lock() {
            Session::Consumer {
                target, pending, ..
            } if target.as_str() == provider => pending.remove(req_id),
            _ => false,
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("role", &self.role())
            .field("alive", &self.is_alive())
            .finish()
    }
}

/// Every currently connected handle, keyed by connection id.
#[derive(Default)]
pub struct ConnectionTable {
    inner: DashMap<ConnectionId, Arc<Connection>>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, conn: Arc<Connection>) {
        self.inner.insert(conn.id(), conn);
    }

    pub fn remove(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.inner.remove(id).map(|(_, conn)| conn)
    }

    pub fn get(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.inner.get(id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Iterate over the handles currently in the table. Shard locks are held
    /// while the iterator is alive, so callers must not await inside the loop.
    pub fn iter(&self) -> impl Iterator<Item = Arc<Connection>> + '_ {
        self.inner.iter().map(|entry| Arc::clone(entry.value()))
    }
}
