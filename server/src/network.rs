//! TCP host shared by the account and game servers.
//!
//! Each accepted socket gets a reader task that cuts reads into frames and
//! hands them to the host's `HostEvents`, plus a writer task that drains the
//! connection's outbound queue. The host itself knows nothing about packet
//! contents.

use crate::capture::CaptureSink;
use crate::config::HostConfig;
use crate::connection::{Connection, ConnectionRegistry, Outbound, SendError};
use crate::throttle::{Admission, Rejection};
use crate::utils::handshake_token;
use log::{debug, error, info, warn};
use shared::{
    split_frames, types, Frame, FrameError, Payload, MAX_FRAME_LEN, MIN_FRAME_LEN,
    THROTTLE_NOTICE,
};
use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::mpsc::UnboundedReceiver;

pub type EventFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Callbacks a host drives for its connections.
pub trait HostEvents: Send + Sync + 'static {
    /// Runs before a socket is admitted.
    fn on_connect(&self, _remote: SocketAddr) -> Admission {
        Admission::Accept
    }

    fn on_data_received<'a>(&'a self, conn: &'a Connection, frame: Frame) -> EventFuture<'a>;

    /// Runs once per admitted connection, after it left the registry.
    fn on_disconnect<'a>(&'a self, conn: &'a Connection, reason: DisconnectReason)
        -> EventFuture<'a>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    Closed,
    ReadFailed,
    WriteFailed,
    BadFrame,
    Quit,
    Panicked,
    Aborted,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            DisconnectReason::Closed => "closed by peer",
            DisconnectReason::ReadFailed => "read failed",
            DisconnectReason::WriteFailed => "write failed",
            DisconnectReason::BadFrame => "bad frame",
            DisconnectReason::Quit => "quit",
            DisconnectReason::Panicked => "receive loop panicked",
            DisconnectReason::Aborted => "aborted",
        };
        f.write_str(text)
    }
}

pub struct TcpHost<E: HostEvents> {
    name: &'static str,
    listener: TcpListener,
    events: Arc<E>,
    registry: Arc<ConnectionRegistry>,
    capture: CaptureSink,
}

/// Cloneable view of a running host for pushing packets to its connections.
#[derive(Clone)]
pub struct HostHandle {
    registry: Arc<ConnectionRegistry>,
}

impl HostHandle {
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn send<P: Payload>(&self, connection_id: u32, payload: &P) -> Result<(), SendError> {
        match self.registry.get(connection_id) {
            Some(conn) => conn.send(payload),
            None => Err(SendError::Closed),
        }
    }
}

impl<E: HostEvents> TcpHost<E> {
    /// Binds and starts listening with the configured backlog.
    pub async fn listen(
        name: &'static str,
        config: &HostConfig,
        events: Arc<E>,
        capture: CaptureSink,
    ) -> io::Result<Self> {
        let addr = tokio::net::lookup_host((config.address.as_str(), config.port))
            .await?
            .next()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("no address for {}:{}", config.address, config.port),
                )
            })?;

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        let listener = socket.listen(config.backlog)?;
        info!("{} host listening on {}", name, listener.local_addr()?);

        Ok(Self {
            name,
            listener,
            events,
            registry: Arc::new(ConnectionRegistry::new(config.max_connections)),
            capture,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn handle(&self) -> HostHandle {
        HostHandle {
            registry: Arc::clone(&self.registry),
        }
    }

    /// Accept loop. Only returns if the task is dropped.
    pub async fn run(self) {
        loop {
            let (stream, remote) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("{} accept failed: {}", self.name, e);
                    continue;
                }
            };
            self.admit(stream, remote);
        }
    }

    fn admit(&self, stream: TcpStream, remote: SocketAddr) {
        let (outbound, rx) = Outbound::channel();
        let conn = Arc::new(Connection::new(
            self.registry.next_id(),
            remote,
            outbound,
            handshake_token(),
        ));
        // A full host never touches throttle state.
        match self
            .registry
            .admit(Arc::clone(&conn), || self.events.on_connect(remote))
        {
            Admission::Accept => {}
            Admission::Reject(Rejection::Full) => {
                info!("{} refusing {}: {}", self.name, remote, Rejection::Full);
                tokio::spawn(reject_socket(stream, None));
                return;
            }
            Admission::Reject(reason) => {
                info!("{} refusing {}: {}", self.name, remote, reason);
                tokio::spawn(reject_socket(stream, Some(THROTTLE_NOTICE)));
                return;
            }
        }

        tokio::spawn(serve_connection(
            stream,
            conn,
            rx,
            Arc::clone(&self.events),
            Arc::clone(&self.registry),
            self.capture.clone(),
        ));
    }
}

/// Writes the optional notice, then closes the socket.
pub async fn reject_socket<W: AsyncWrite + Unpin>(mut socket: W, notice: Option<&str>) {
    if let Some(notice) = notice {
        if let Err(e) = socket.write_all(notice.as_bytes()).await {
            debug!("Rejection notice not delivered: {}", e);
            return;
        }
    }
    let _ = socket.shutdown().await;
}

async fn serve_connection<E: HostEvents>(
    stream: TcpStream,
    conn: Arc<Connection>,
    rx: UnboundedReceiver<Vec<u8>>,
    events: Arc<E>,
    registry: Arc<ConnectionRegistry>,
    capture: CaptureSink,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("set_nodelay failed for {}: {}", conn.remote, e);
    }
    let (reader, writer) = stream.into_split();
    let last_read = Arc::new(Mutex::new(Vec::new()));

    let mut writer_task = tokio::spawn(run_writer(writer, rx));
    let mut reader_task = {
        let conn = Arc::clone(&conn);
        let events = Arc::clone(&events);
        let last_read = Arc::clone(&last_read);
        tokio::spawn(async move {
            run_receive_loop(reader, &conn, events.as_ref(), &last_read).await
        })
    };

    let outcome = tokio::select! {
        joined = &mut reader_task => {
            writer_task.abort();
            match joined {
                Ok(outcome) => outcome,
                Err(e) if e.is_panic() => {
                    error!("Receive loop for {} panicked", conn.remote);
                    ReceiveOutcome::fatal(DisconnectReason::Panicked, take_last_read(&last_read))
                }
                Err(_) => ReceiveOutcome::new(DisconnectReason::Aborted),
            }
        }
        written = &mut writer_task => {
            reader_task.abort();
            if let Ok(Err(e)) = &written {
                debug!("Write to {} failed: {}", conn.remote, e);
            }
            ReceiveOutcome::new(DisconnectReason::WriteFailed)
        }
    };

    conn.mark_quitting();
    registry.remove(conn.id);
    info!("Connection {} from {} ended: {}", conn.id, conn.remote, outcome.reason);
    events.on_disconnect(&conn, outcome.reason).await;

    if let Some(bytes) = outcome.offending {
        capture.capture(conn.account_id(), &bytes).await;
    }
}

fn take_last_read(last_read: &Mutex<Vec<u8>>) -> Vec<u8> {
    std::mem::take(&mut *last_read.lock().unwrap_or_else(|e| e.into_inner()))
}

#[derive(Debug, PartialEq, Eq)]
pub struct ReceiveOutcome {
    pub reason: DisconnectReason,
    /// The read that killed the connection, kept for capture.
    pub offending: Option<Vec<u8>>,
}

impl ReceiveOutcome {
    fn new(reason: DisconnectReason) -> Self {
        Self {
            reason,
            offending: None,
        }
    }

    fn fatal(reason: DisconnectReason, bytes: Vec<u8>) -> Self {
        Self {
            reason,
            offending: Some(bytes),
        }
    }
}

/// Reads until the peer goes away, a frame error ends the connection, or a
/// handler marks it as quitting. `last_read` always holds the read being
/// processed so a panic can still be captured.
pub async fn run_receive_loop<R, E>(
    mut reader: R,
    conn: &Connection,
    events: &E,
    last_read: &Mutex<Vec<u8>>,
) -> ReceiveOutcome
where
    R: AsyncRead + Unpin,
    E: HostEvents + ?Sized,
{
    let mut buf = vec![0u8; MAX_FRAME_LEN];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => return ReceiveOutcome::new(DisconnectReason::Closed),
            Ok(n) => n,
            Err(e) => {
                debug!("Read from {} failed: {}", conn.remote, e);
                return ReceiveOutcome::new(DisconnectReason::ReadFailed);
            }
        };
        let data = &buf[..n];
        {
            let mut last = last_read.lock().unwrap_or_else(|e| e.into_inner());
            last.clear();
            last.extend_from_slice(data);
        }

        if let Err(e) = process_read(data, conn, events).await {
            warn!("Dropping {} after {}", conn.remote, e);
            return ReceiveOutcome::fatal(DisconnectReason::BadFrame, data.to_vec());
        }
        if conn.is_quitting() {
            return ReceiveOutcome::new(DisconnectReason::Quit);
        }
    }
}

/// Dispatches every frame in one read, in order. Returns how many frames
/// were delivered.
///
/// A frame too short to decode abandons the rest of the read. A malformed
/// or badly checksummed frame is returned as an error.
pub async fn process_read<E>(data: &[u8], conn: &Connection, events: &E) -> Result<usize, FrameError>
where
    E: HostEvents + ?Sized,
{
    if let Some(frame) = loose_handshake(data) {
        debug!("Handshake from {} with an unusable length", conn.remote);
        events.on_data_received(conn, frame).await;
        return Ok(1);
    }

    let mut frames = split_frames(data);
    let mut delivered = 0;
    for raw in &mut frames {
        match Frame::decode(raw) {
            Ok(frame) => {
                events.on_data_received(conn, frame).await;
                delivered += 1;
            }
            Err(FrameError::TooShort { got }) => {
                debug!("{}-byte frame from {}, dropping rest of read", got, conn.remote);
                break;
            }
            Err(e) => return Err(e),
        }
        if conn.is_quitting() {
            break;
        }
    }
    if frames.abandoned() > 0 {
        debug!(
            "Abandoned {} trailing bytes from {}",
            frames.abandoned(),
            conn.remote
        );
    }
    Ok(delivered)
}

/// A handshake whose length field does not describe the read is still
/// handed over as a whole.
fn loose_handshake(data: &[u8]) -> Option<Frame> {
    if data.len() < MIN_FRAME_LEN {
        return None;
    }
    let declared = u16::from_le_bytes([data[0], data[1]]) as usize;
    let packet_type = u16::from_le_bytes([data[2], data[3]]);
    if packet_type != types::HANDSHAKE || (MIN_FRAME_LEN..=data.len()).contains(&declared) {
        return None;
    }
    Frame::decode(data).ok()
}

/// Drains the outbound queue into the socket.
pub async fn run_writer<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut rx: UnboundedReceiver<Vec<u8>>,
) -> io::Result<()> {
    while let Some(bytes) = rx.recv().await {
        writer.write_all(&bytes).await?;
    }
    writer.shutdown().await
}
