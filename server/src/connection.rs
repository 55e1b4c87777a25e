//! Live connections and the registry that owns them.
//!
//! A `Connection` is created when a socket is accepted and dropped when it
//! disconnects; ids are never reused. Handlers and the world tick talk to
//! the socket only through the connection's `Outbound` queue, which a
//! writer task drains.

use crate::throttle::{Admission, Rejection};
use log::info;
use shared::{FrameError, MapKey, Payload};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

#[derive(Debug)]
pub enum SendError {
    Closed,
    Encode(FrameError),
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::Closed => write!(f, "connection closed"),
            SendError::Encode(e) => write!(f, "failed to encode frame: {}", e),
        }
    }
}

impl std::error::Error for SendError {}

impl From<FrameError> for SendError {
    fn from(e: FrameError) -> Self {
        SendError::Encode(e)
    }
}

/// Queue of encoded frames waiting for a connection's writer task.
#[derive(Debug, Clone)]
pub struct Outbound {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl Outbound {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn send<P: Payload>(&self, payload: &P) -> Result<(), SendError> {
        self.send_bytes(payload.to_frame()?)
    }

    pub fn send_bytes(&self, bytes: Vec<u8>) -> Result<(), SendError> {
        self.tx.send(bytes).map_err(|_| SendError::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Whether both handles feed the same writer.
    pub fn same_channel(&self, other: &Outbound) -> bool {
        self.tx.same_channel(&other.tx)
    }
}

/// Where a connection's avatar currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionBinding {
    pub avatar_id: u32,
    pub map: MapKey,
}

#[derive(Debug, Default)]
pub struct ConnectionState {
    pub handshake: u16,
    pub account_id: Option<u32>,
    pub session: Option<SessionBinding>,
    pub quitting: bool,
}

#[derive(Debug)]
pub struct Connection {
    pub id: u32,
    pub remote: SocketAddr,
    pub outbound: Outbound,
    state: Mutex<ConnectionState>,
}

impl Connection {
    pub fn new(id: u32, remote: SocketAddr, outbound: Outbound, handshake: u16) -> Self {
        Self {
            id,
            remote,
            outbound,
            state: Mutex::new(ConnectionState {
                handshake,
                ..ConnectionState::default()
            }),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, ConnectionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn handshake(&self) -> u16 {
        self.state().handshake
    }

    pub fn set_handshake(&self, token: u16) {
        self.state().handshake = token;
    }

    pub fn account_id(&self) -> Option<u32> {
        self.state().account_id
    }

    pub fn bind_account(&self, account_id: u32) {
        self.state().account_id = Some(account_id);
    }

    pub fn session(&self) -> Option<SessionBinding> {
        self.state().session
    }

    pub fn bind_session(&self, binding: SessionBinding) {
        self.state().session = Some(binding);
    }

    pub fn unbind_session(&self) -> Option<SessionBinding> {
        self.state().session.take()
    }

    pub fn mark_quitting(&self) {
        self.state().quitting = true;
    }

    pub fn is_quitting(&self) -> bool {
        self.state().quitting
    }

    pub fn send<P: Payload>(&self, payload: &P) -> Result<(), SendError> {
        self.outbound.send(payload)
    }
}

/// Active connections of one host, with a hard cap.
#[derive(Debug)]
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<u32, Arc<Connection>>>,
    next_id: AtomicU32,
    max_connections: usize,
}

impl ConnectionRegistry {
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(1),
            max_connections,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u32, Arc<Connection>>> {
        self.connections.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn next_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn is_full(&self) -> bool {
        self.lock().len() >= self.max_connections
    }

    /// Admits a connection. Returns false when the host is at capacity.
    pub fn add(&self, connection: Arc<Connection>) -> bool {
        self.admit(connection, || Admission::Accept) == Admission::Accept
    }

    /// Checks the cap, asks `admission`, and inserts, all under the registry
    /// lock. `admission` is not called when the host is full, so a refused
    /// connection never reaches the throttle.
    pub fn admit<F>(&self, connection: Arc<Connection>, admission: F) -> Admission
    where
        F: FnOnce() -> Admission,
    {
        let mut connections = self.lock();
        if connections.len() >= self.max_connections {
            return Admission::Reject(Rejection::Full);
        }
        if let Admission::Reject(reason) = admission() {
            return Admission::Reject(reason);
        }
        info!("Connection {} accepted from {}", connection.id, connection.remote);
        connections.insert(connection.id, connection);
        Admission::Accept
    }

    pub fn remove(&self, id: u32) -> Option<Arc<Connection>> {
        let removed = self.lock().remove(&id);
        if let Some(connection) = &removed {
            info!("Connection {} from {} removed", id, connection.remote);
        }
        removed
    }

    pub fn get(&self, id: u32) -> Option<Arc<Connection>> {
        self.lock().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn find_by_account(&self, account_id: u32) -> Option<Arc<Connection>> {
        self.lock()
            .values()
            .find(|c| c.account_id() == Some(account_id))
            .cloned()
    }
}
