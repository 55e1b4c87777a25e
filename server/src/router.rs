//! Packet-type dispatch.
//!
//! Each host builds its `Router` once at startup from an explicit handler
//! list. `dispatch` never fails: handler errors are logged here and the
//! connection carries on.

use crate::connection::{Connection, SendError};
use crate::store::StoreError;
use crate::utils::{token_from_secs, unix_seconds};
use crate::world::WorldError;
use log::{debug, warn};
use shared::packets::{HandshakeAck, HandshakeRequest};
use shared::{types, Frame, FrameError, Payload};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;

pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + 'a>>;

/// Handles one packet type. `S` is the host's shared services.
pub trait Handler<S>: Send + Sync {
    fn packet_type(&self) -> u16;

    fn handle<'a>(&'a self, conn: &'a Connection, services: &'a S, frame: Frame)
        -> HandlerFuture<'a>;
}

#[derive(Debug)]
pub enum HandlerError {
    Decode(FrameError),
    Send(SendError),
    Store(StoreError),
    World(WorldError),
    NotAuthenticated,
    NoSession,
    Rejected(String),
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerError::Decode(e) => write!(f, "{}", e),
            HandlerError::Send(e) => write!(f, "{}", e),
            HandlerError::Store(e) => write!(f, "{}", e),
            HandlerError::World(e) => write!(f, "{}", e),
            HandlerError::NotAuthenticated => write!(f, "connection is not authenticated"),
            HandlerError::NoSession => write!(f, "connection has no avatar in the world"),
            HandlerError::Rejected(reason) => write!(f, "rejected: {}", reason),
        }
    }
}

impl std::error::Error for HandlerError {}

impl From<FrameError> for HandlerError {
    fn from(e: FrameError) -> Self {
        HandlerError::Decode(e)
    }
}

impl From<SendError> for HandlerError {
    fn from(e: SendError) -> Self {
        HandlerError::Send(e)
    }
}

impl From<StoreError> for HandlerError {
    fn from(e: StoreError) -> Self {
        HandlerError::Store(e)
    }
}

impl From<WorldError> for HandlerError {
    fn from(e: WorldError) -> Self {
        HandlerError::World(e)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterError {
    Duplicate(u16),
}

impl fmt::Display for RouterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouterError::Duplicate(t) => write!(f, "packet type {:#06x} registered twice", t),
        }
    }
}

impl std::error::Error for RouterError {}

/// What `dispatch` did with a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Handled,
    Handshake,
    KeepAlive,
    Unhandled,
    Failed,
}

pub struct Router<S> {
    handlers: HashMap<u16, Box<dyn Handler<S>>>,
}

impl<S> Default for Router<S> {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }
}

impl<S: Send + Sync> Router<S> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_handlers(handlers: Vec<Box<dyn Handler<S>>>) -> Result<Self, RouterError> {
        let mut router = Self::new();
        for handler in handlers {
            router.register(handler)?;
        }
        Ok(router)
    }

    pub fn register(&mut self, handler: Box<dyn Handler<S>>) -> Result<(), RouterError> {
        let packet_type = handler.packet_type();
        if self.handlers.contains_key(&packet_type) {
            return Err(RouterError::Duplicate(packet_type));
        }
        self.handlers.insert(packet_type, handler);
        Ok(())
    }

    pub fn handles(&self, packet_type: u16) -> bool {
        self.handlers.contains_key(&packet_type)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub async fn dispatch(&self, conn: &Connection, services: &S, frame: Frame) -> Dispatch {
        let packet_type = frame.packet_type;

        if let Some(handler) = self.handlers.get(&packet_type) {
            return match handler.handle(conn, services, frame).await {
                Ok(()) => Dispatch::Handled,
                Err(e) => {
                    warn!(
                        "Handler for type {:#06x} failed for {}: {}",
                        packet_type, conn.remote, e
                    );
                    Dispatch::Failed
                }
            };
        }

        match packet_type {
            types::HANDSHAKE => {
                if let Err(e) = respond_handshake(conn, &frame) {
                    warn!("Handshake reply to {} failed: {}", conn.remote, e);
                    return Dispatch::Failed;
                }
                Dispatch::Handshake
            }
            types::KEEP_ALIVE => {
                debug!("Keep-alive from {}", conn.remote);
                Dispatch::KeepAlive
            }
            _ => {
                warn!(
                    "No handler for packet type {:#06x} from {}",
                    packet_type, conn.remote
                );
                Dispatch::Unhandled
            }
        }
    }
}

/// Default handshake responder: issues a fresh token whatever the request
/// contained.
pub fn respond_handshake(conn: &Connection, frame: &Frame) -> Result<u16, SendError> {
    match HandshakeRequest::from_frame(frame) {
        Ok(request) if !frame.malformed => {
            debug!(
                "Handshake from {} (client {}, stamp {})",
                conn.remote, request.client_id, request.timestamp
            );
        }
        _ => debug!(
            "Unreadable handshake from {} ({} payload bytes)",
            conn.remote,
            frame.payload.len()
        ),
    }

    let now = unix_seconds();
    let token = token_from_secs(now);
    conn.set_handshake(token);
    conn.send(&HandshakeAck {
        token,
        server_time: now as u32,
    })?;
    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Outbound;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Counter {
        calls: AtomicUsize,
    }

    struct Count;

    impl Handler<Counter> for Count {
        fn packet_type(&self) -> u16 {
            0x0100
        }

        fn handle<'a>(
            &'a self,
            _conn: &'a Connection,
            services: &'a Counter,
            _frame: Frame,
        ) -> HandlerFuture<'a> {
            Box::pin(async move {
                services.calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }
    }

    struct Fail;

    impl Handler<Counter> for Fail {
        fn packet_type(&self) -> u16 {
            0x0101
        }

        fn handle<'a>(
            &'a self,
            _conn: &'a Connection,
            _services: &'a Counter,
            _frame: Frame,
        ) -> HandlerFuture<'a> {
            Box::pin(async move { Err(HandlerError::Rejected("always".to_string())) })
        }
    }

    fn setup() -> (Router<Counter>, Counter, Connection, UnboundedReceiver<Vec<u8>>) {
        let router = Router::with_handlers(vec![Box::new(Count), Box::new(Fail)]).unwrap();
        let (outbound, rx) = Outbound::channel();
        let conn = Connection::new(1, SocketAddr::from(([127, 0, 0, 1], 4000)), outbound, 0);
        let counter = Counter {
            calls: AtomicUsize::new(0),
        };
        (router, counter, conn, rx)
    }

    fn frame(packet_type: u16, payload: &[u8]) -> Frame {
        Frame::decode(&Frame::encode(packet_type, payload).unwrap()).unwrap()
    }

    #[test]
    fn test_duplicate_registration() {
        let mut router: Router<Counter> = Router::new();
        router.register(Box::new(Count)).unwrap();
        assert_eq!(
            router.register(Box::new(Count)),
            Err(RouterError::Duplicate(0x0100))
        );
        assert_eq!(router.len(), 1);
        assert!(router.handles(0x0100));
    }

    #[tokio::test]
    async fn test_dispatch_to_handler() {
        let (router, counter, conn, _rx) = setup();
        let outcome = router.dispatch(&conn, &counter, frame(0x0100, &[])).await;
        assert_eq!(outcome, Dispatch::Handled);
        assert_eq!(counter.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_handler_error_is_contained() {
        let (router, counter, conn, _rx) = setup();
        assert_eq!(
            router.dispatch(&conn, &counter, frame(0x0101, &[])).await,
            Dispatch::Failed
        );
        assert!(!conn.is_quitting());
        assert_eq!(
            router.dispatch(&conn, &counter, frame(0x0100, &[])).await,
            Dispatch::Handled
        );
    }

    #[tokio::test]
    async fn test_unknown_type_is_dropped() {
        let (router, counter, conn, mut rx) = setup();
        assert_eq!(
            router.dispatch(&conn, &counter, frame(0x4242, &[1, 2])).await,
            Dispatch::Unhandled
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_builtin_handshake_issues_token() {
        let (router, counter, conn, mut rx) = setup();
        // Handshakes skip the checksum, so the trailer is left zeroed.
        let handshake = Frame::decode(&[10, 0, 1, 0, 1, 2, 3, 4, 0, 0]).unwrap();

        assert_eq!(
            router.dispatch(&conn, &counter, handshake).await,
            Dispatch::Handshake
        );
        let reply = Frame::decode(&rx.try_recv().unwrap()).unwrap();
        let ack = HandshakeAck::from_frame(&reply).unwrap();
        assert_eq!(ack.token, conn.handshake());
        assert_eq!(ack.token, token_from_secs(u64::from(ack.server_time)));
    }

    #[tokio::test]
    async fn test_keep_alive_is_quiet() {
        let (router, counter, conn, mut rx) = setup();
        assert_eq!(
            router.dispatch(&conn, &counter, frame(types::KEEP_ALIVE, &[])).await,
            Dispatch::KeepAlive
        );
        assert!(rx.try_recv().is_err());
    }
}
