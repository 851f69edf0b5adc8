//! Client side of the relay protocol
//!
//! [`ProtocolEngine`] owns the write half of the connection and the queues
//! the rest of the client reads from. The receive loop feeds the queues;
//! the bridge and chat loops drain them and send through the engine, which
//! serializes all writes so frames never interleave on the wire.

use crate::config::ClientConfig;
use log::{debug, info, warn};
use parking_lot::Mutex;
use shared::payload::{decode_text, encode_text};
use shared::{
    read_frame, write_frame, BoundedQueue, ClientHandshake, ClientMessageKind, ProtocolError,
    RawFrame, ServerHandshake, ServerMessageKind, SettingsPayload, MAX_FRAME_LENGTH,
    MAX_SCREENSHOT_BYTES, MAX_TEXT_MESSAGE_QUEUE, NET_PROTOCOL_VERSION, PROGRAM_VERSION,
};
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

/// Update cadence assumed until the server sends its settings
pub const DEFAULT_UPDATE_INTERVAL: u32 = 500;
/// Relay queue bound assumed until the server sends its settings
pub const DEFAULT_MAX_QUEUED_UPDATES: u32 = 32;
pub const DEFAULT_SCREENSHOT_INTERVAL: u32 = 3000;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("could not connect to {address}: {source}")]
    Connect { address: String, source: io::Error },

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("screenshot of {size} bytes exceeds the {max} byte limit")]
    ScreenshotTooLarge { size: usize, max: usize },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// A chat line or server notice waiting to be displayed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InTextMessage {
    pub from_server: bool,
    pub message: String,
}

/// Why a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// The server turned the connection away before a slot was assigned
    Refused(String),
    /// The server speaks a different protocol version
    IncompatibleServer { protocol_version: u32 },
    /// The server closed the session with this reason
    Disconnected(String),
    ConnectionLost,
    ProtocolViolation(String),
    /// Ended locally
    Quit,
}

impl fmt::Display for SessionEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionEnd::Refused(reason) => write!(f, "Server refused connection. Reason: {}", reason),
            SessionEnd::IncompatibleServer { protocol_version } => write!(
                f,
                "Server protocol version {} is incompatible with client version {}",
                protocol_version, NET_PROTOCOL_VERSION
            ),
            SessionEnd::Disconnected(reason) => write!(f, "Disconnected by server: {}", reason),
            SessionEnd::ConnectionLost => write!(f, "Lost connection with server."),
            SessionEnd::ProtocolViolation(e) => write!(f, "Protocol error: {}", e),
            SessionEnd::Quit => write!(f, "Disconnected."),
        }
    }
}

/// Write half of the server connection
pub type EngineWriter = Box<dyn AsyncWrite + Send + Unpin>;

pub struct ProtocolEngine {
    username: String,
    writer: tokio::sync::Mutex<Option<EngineWriter>>,
    texts: Mutex<BoundedQueue<InTextMessage>>,
    relay: Mutex<BoundedQueue<Vec<u8>>>,
    settings: Mutex<SettingsPayload>,
    screenshot: Mutex<Option<Vec<u8>>>,
    server_version: Mutex<Option<String>>,
    handshaken: AtomicBool,
    shutdown: CancellationToken,
}

impl ProtocolEngine {
    pub fn new(username: &str, writer: EngineWriter) -> Self {
        Self {
            username: username.to_string(),
            writer: tokio::sync::Mutex::new(Some(writer)),
            texts: Mutex::new(BoundedQueue::new(MAX_TEXT_MESSAGE_QUEUE)),
            relay: Mutex::new(BoundedQueue::new(DEFAULT_MAX_QUEUED_UPDATES as usize)),
            settings: Mutex::new(SettingsPayload {
                update_interval: DEFAULT_UPDATE_INTERVAL,
                max_queued_updates: DEFAULT_MAX_QUEUED_UPDATES,
                screenshot_interval: DEFAULT_SCREENSHOT_INTERVAL,
            }),
            screenshot: Mutex::new(None),
            server_version: Mutex::new(None),
            handshaken: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    /// Opens a TCP connection to the configured server
    pub async fn connect(config: &ClientConfig) -> Result<(Self, OwnedReadHalf), ClientError> {
        let stream = TcpStream::connect(&config.server)
            .await
            .map_err(|source| ClientError::Connect {
                address: config.server.clone(),
                source,
            })?;
        stream.set_nodelay(true)?;
        info!("Connected to server! Handshaking...");

        let (reader, writer) = stream.into_split();
        Ok((Self::new(&config.username, Box::new(writer)), reader))
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Cancelled once the session is over
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub fn is_handshaken(&self) -> bool {
        self.handshaken.load(Ordering::SeqCst)
    }

    pub fn server_version(&self) -> Option<String> {
        self.server_version.lock().clone()
    }

    pub fn settings(&self) -> SettingsPayload {
        *self.settings.lock()
    }

    /// How long the bridge waits between polls
    pub fn update_interval(&self) -> Duration {
        Duration::from_millis(u64::from(self.settings.lock().update_interval))
    }

    pub fn take_text_messages(&self) -> Vec<InTextMessage> {
        self.texts.lock().drain()
    }

    pub fn take_relay_updates(&self) -> Vec<Vec<u8>> {
        self.relay.lock().drain()
    }

    pub fn has_relay_updates(&self) -> bool {
        !self.relay.lock().is_empty()
    }

    /// The last screenshot the server delivered, if not yet taken
    pub fn take_screenshot(&self) -> Option<Vec<u8>> {
        self.screenshot.lock().take()
    }

    /// Receives and dispatches frames until the session ends
    pub async fn run_receiver<R>(&self, mut reader: R) -> SessionEnd
    where
        R: AsyncRead + Unpin,
    {
        let end = loop {
            let frame = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break SessionEnd::Quit,
                frame = read_frame(&mut reader, MAX_FRAME_LENGTH) => frame,
            };

            match frame {
                Ok(frame) => {
                    if let Some(end) = self.handle_frame(frame).await {
                        break end;
                    }
                }
                Err(e) if e.is_disconnect() => {
                    debug!("Connection ended: {}", e);
                    break SessionEnd::ConnectionLost;
                }
                Err(e) => break SessionEnd::ProtocolViolation(e.to_string()),
            }
        };

        self.close().await;
        end
    }

    /// Applies one server frame, returning how the session ends if it does
    pub async fn handle_frame(&self, frame: RawFrame) -> Option<SessionEnd> {
        let kind = match frame.kind::<ServerMessageKind>() {
            Ok(kind) => kind,
            Err(e) => {
                warn!("Ignoring message from server: {}", e);
                return None;
            }
        };
        let payload = frame.payload;

        match kind {
            ServerMessageKind::Handshake => {
                let handshake = match ServerHandshake::decode(&payload) {
                    Ok(handshake) => handshake,
                    Err(e) => return Some(SessionEnd::ProtocolViolation(e.to_string())),
                };
                info!(
                    "Handshake received. Server is running version: {}",
                    handshake.version
                );

                if handshake.protocol_version != NET_PROTOCOL_VERSION {
                    warn!("Server version is incompatible with client version. Ending session.");
                    return Some(SessionEnd::IncompatibleServer {
                        protocol_version: handshake.protocol_version,
                    });
                }

                *self.server_version.lock() = Some(handshake.version);
                if let Err(e) = self.send_handshake().await {
                    debug!("Handshake reply failed: {}", e);
                    return Some(SessionEnd::ConnectionLost);
                }
                self.handshaken.store(true, Ordering::SeqCst);
                None
            }
            ServerMessageKind::HandshakeRefusal => {
                Some(SessionEnd::Refused(decode_text(&payload)))
            }
            ServerMessageKind::ServerMessage | ServerMessageKind::TextMessage => {
                let message = InTextMessage {
                    from_server: kind == ServerMessageKind::ServerMessage,
                    message: decode_text(&payload),
                };
                self.texts.lock().push(message);
                None
            }
            ServerMessageKind::StateUpdate => {
                if self.relay.lock().push(payload).is_some() {
                    debug!("Relay queue full, dropped oldest update");
                }
                None
            }
            ServerMessageKind::Settings => {
                match SettingsPayload::decode(&payload) {
                    Ok(settings) => self.apply_settings(settings),
                    Err(e) => warn!("Ignoring malformed settings: {}", e),
                }
                None
            }
            ServerMessageKind::ScreenshotShare => {
                debug!("Received screenshot of {} bytes", payload.len());
                *self.screenshot.lock() = Some(payload);
                None
            }
            ServerMessageKind::ConnectionEnd => Some(SessionEnd::Disconnected(decode_text(&payload))),
        }
    }

    fn apply_settings(&self, settings: SettingsPayload) {
        debug!(
            "Server settings: update interval {} ms, {} queued updates",
            settings.update_interval, settings.max_queued_updates
        );
        *self.settings.lock() = settings;
        self.relay
            .lock()
            .set_capacity(settings.max_queued_updates.max(1) as usize);
    }

    async fn send(&self, kind: ClientMessageKind, payload: &[u8]) -> Result<(), ClientError> {
        let mut writer = self.writer.lock().await;
        match writer.as_mut() {
            Some(w) => Ok(write_frame(w, kind, payload).await?),
            None => Err(ProtocolError::ConnectionClosed.into()),
        }
    }

    async fn send_handshake(&self) -> Result<(), ClientError> {
        let payload = ClientHandshake::new(self.username.as_str(), PROGRAM_VERSION).encode();
        self.send(ClientMessageKind::Handshake, &payload).await
    }

    /// Forwards an update produced by the external application
    pub async fn send_state_update(&self, update: &[u8]) -> Result<(), ClientError> {
        self.send(ClientMessageKind::StateUpdate, update).await
    }

    pub async fn send_text(&self, text: &str) -> Result<(), ClientError> {
        self.send(ClientMessageKind::TextMessage, &encode_text(text))
            .await
    }

    /// Subscribes to another user's screenshots; an empty name unsubscribes
    pub async fn send_watch_player(&self, username: &str) -> Result<(), ClientError> {
        self.send(ClientMessageKind::WatchPlayer, &encode_text(username))
            .await
    }

    pub async fn share_screenshot(&self, bytes: &[u8]) -> Result<(), ClientError> {
        if bytes.len() > MAX_SCREENSHOT_BYTES {
            return Err(ClientError::ScreenshotTooLarge {
                size: bytes.len(),
                max: MAX_SCREENSHOT_BYTES,
            });
        }
        self.send(ClientMessageKind::ScreenshotShare, bytes).await
    }

    /// Tells the server why we are leaving and ends the session
    pub async fn disconnect(&self, reason: &str) {
        if let Err(e) = self
            .send(ClientMessageKind::ConnectionEnd, &encode_text(reason))
            .await
        {
            debug!("Disconnect notice not sent: {}", e);
        }
        self.close().await;
    }

    async fn close(&self) {
        self.shutdown.cancel();
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
    }
}
