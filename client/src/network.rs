use log::{debug, info, warn};
use shared::packets::{HandshakeAck, HandshakeRequest, Login, LoginResult};
use shared::{types, Frame, FrameError, Payload, MAX_FRAME_LEN, MIN_FRAME_LEN};
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::time::{sleep, timeout};

#[derive(Debug)]
pub enum ClientError {
    Io(io::Error),
    Frame(FrameError),
    /// The server closed the connection.
    Closed,
    /// Nothing of the awaited type arrived in time.
    Timeout(u16),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::Io(e) => write!(f, "{}", e),
            ClientError::Frame(e) => write!(f, "{}", e),
            ClientError::Closed => write!(f, "connection closed by server"),
            ClientError::Timeout(t) => write!(f, "timed out waiting for type {:#06x}", t),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<io::Error> for ClientError {
    fn from(e: io::Error) -> Self {
        ClientError::Io(e)
    }
}

impl From<FrameError> for ClientError {
    fn from(e: FrameError) -> Self {
        ClientError::Frame(e)
    }
}

/// One TCP connection to an account or game host.
///
/// Unlike the server, the client keeps partial frames across reads so it can
/// sit on a plain byte stream.
pub struct GameClient {
    stream: TcpStream,
    buffer: Vec<u8>,
    frames: VecDeque<Frame>,
    token: Option<u16>,
    fake_ping_ms: u64,
}

impl GameClient {
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        debug!("Connected to {}", stream.peer_addr()?);
        Ok(Self {
            stream,
            buffer: Vec::with_capacity(MAX_FRAME_LEN),
            frames: VecDeque::new(),
            token: None,
            fake_ping_ms: 0,
        })
    }

    /// Delays every send by half of `ms`.
    pub fn with_fake_ping(mut self, ms: u64) -> Self {
        self.fake_ping_ms = ms;
        self
    }

    pub fn token(&self) -> Option<u16> {
        self.token
    }

    pub async fn send<P: Payload>(&mut self, payload: &P) -> Result<(), ClientError> {
        let bytes = payload.to_frame()?;
        self.send_raw(&bytes).await
    }

    /// Writes bytes as they are, framed or not.
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<(), ClientError> {
        if self.fake_ping_ms > 0 {
            sleep(Duration::from_millis(self.fake_ping_ms / 2)).await;
        }
        self.stream.write_all(bytes).await?;
        Ok(())
    }

    /// Next complete frame, reading more from the socket as needed.
    pub async fn recv_frame(&mut self) -> Result<Frame, ClientError> {
        loop {
            if let Some(frame) = self.frames.pop_front() {
                return Ok(frame);
            }

            let mut chunk = [0u8; 4096];
            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(ClientError::Closed);
            }
            self.buffer.extend_from_slice(&chunk[..n]);
            self.drain_buffer()?;
        }
    }

    fn drain_buffer(&mut self) -> Result<(), ClientError> {
        while self.buffer.len() >= 2 {
            let len = u16::from_le_bytes([self.buffer[0], self.buffer[1]]) as usize;
            if !(MIN_FRAME_LEN..=MAX_FRAME_LEN).contains(&len) {
                return Err(FrameError::Malformed {
                    packet_type: 0,
                    declared: len,
                    available: self.buffer.len(),
                }
                .into());
            }
            if self.buffer.len() < len {
                break;
            }
            let raw: Vec<u8> = self.buffer.drain(..len).collect();
            self.frames.push_back(Frame::decode(&raw)?);
        }
        Ok(())
    }

    /// Waits for a frame of `packet_type`, dropping anything else that
    /// arrives first.
    pub async fn recv_until(
        &mut self,
        packet_type: u16,
        wait: Duration,
    ) -> Result<Frame, ClientError> {
        let found = timeout(wait, async {
            loop {
                let frame = self.recv_frame().await?;
                if frame.packet_type == packet_type {
                    return Ok(frame);
                }
                debug!("Skipping type {:#06x}", frame.packet_type);
            }
        })
        .await;
        match found {
            Ok(result) => result,
            Err(_) => Err(ClientError::Timeout(packet_type)),
        }
    }

    pub async fn expect<P: Payload>(&mut self, wait: Duration) -> Result<P, ClientError> {
        let frame = self.recv_until(P::TYPE, wait).await?;
        Ok(P::from_frame(&frame)?)
    }

    /// Sends a handshake and keeps the token the server hands back.
    pub async fn handshake(&mut self) -> Result<u16, ClientError> {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::from_secs(0))
            .as_secs() as u32;
        self.send(&HandshakeRequest {
            mac: [0; 8],
            timestamp,
            word: 0,
            client_id: std::process::id(),
            flag_a: 0,
            flag_b: 0,
        })
        .await?;

        let ack: HandshakeAck = self.expect(Duration::from_secs(5)).await?;
        info!("Handshake token {:#06x}", ack.token);
        self.token = Some(ack.token);
        Ok(ack.token)
    }

    /// Logs in with the stored handshake token, handshaking first if needed.
    pub async fn login(
        &mut self,
        username: &str,
        password: &str,
    ) -> Result<LoginResult, ClientError> {
        let handshake = match self.token {
            Some(token) => token,
            None => self.handshake().await?,
        };
        self.send(&Login {
            handshake,
            username: username.to_string(),
            password: password.to_string(),
        })
        .await?;

        let result: LoginResult = self.expect(Duration::from_secs(5)).await?;
        info!("Login as '{}': {:?}", username, result.code);
        Ok(result)
    }

    pub async fn keep_alive(&mut self) -> Result<(), ClientError> {
        let bytes = Frame::encode(types::KEEP_ALIVE, &[])?;
        self.send_raw(&bytes).await
    }

    /// Reads whatever the server writes until it closes the socket. Used for
    /// the plaintext notice sent to refused clients.
    pub async fn read_notice(&mut self, wait: Duration) -> Result<String, ClientError> {
        let mut out = std::mem::take(&mut self.buffer);
        match timeout(wait, self.stream.read_to_end(&mut out)).await {
            Ok(result) => {
                result?;
            }
            Err(_) => {
                warn!("Server kept the socket open");
                return Err(ClientError::Timeout(0));
            }
        }
        Ok(String::from_utf8_lossy(&out).into_owned())
    }

    /// True once the server has closed its side.
    pub async fn wait_closed(&mut self, wait: Duration) -> bool {
        let closed = timeout(wait, async {
            loop {
                match self.recv_frame().await {
                    Ok(_) => continue,
                    Err(_) => return,
                }
            }
        })
        .await;
        closed.is_ok()
    }
}
