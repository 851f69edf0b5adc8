//! Protocol definitions shared by the relay server and its clients
//!
//! Holds the message-kind tables for both directions, the frame codec,
//! payload schemas, protocol constants and the drop-oldest queue used on
//! both ends of a connection.

pub mod codec;
pub mod error;
pub mod payload;
pub mod queue;

pub use codec::{read_frame, write_frame, RawFrame, MAX_FRAME_LENGTH};
pub use error::ProtocolError;
pub use payload::{ClientHandshake, ServerHandshake, SettingsPayload};
pub use queue::BoundedQueue;

/// Wire protocol version; both ends must agree exactly
pub const NET_PROTOCOL_VERSION: u32 = 3;
/// Version header of the files exchanged with the external application
pub const FILE_FORMAT_VERSION: u32 = 5;
/// Human-readable program version carried in handshakes
pub const PROGRAM_VERSION: &str = env!("CARGO_PKG_VERSION");

pub const DEFAULT_PORT: u16 = 2075;
pub const MAX_USERNAME_LENGTH: usize = 32;
pub const MAX_SCREENSHOT_BYTES: usize = 256 * 1024;
pub const MAX_TEXT_MESSAGE_QUEUE: usize = 128;

/// Messages sent from client to server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ClientMessageKind {
    Handshake = 0,
    StateUpdate = 1,
    TextMessage = 2,
    WatchPlayer = 3,
    ScreenshotShare = 4,
    ConnectionEnd = 5,
}

impl From<ClientMessageKind> for u32 {
    fn from(kind: ClientMessageKind) -> Self {
        kind as u32
    }
}

impl TryFrom<u32> for ClientMessageKind {
    type Error = ProtocolError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ClientMessageKind::Handshake),
            1 => Ok(ClientMessageKind::StateUpdate),
            2 => Ok(ClientMessageKind::TextMessage),
            3 => Ok(ClientMessageKind::WatchPlayer),
            4 => Ok(ClientMessageKind::ScreenshotShare),
            5 => Ok(ClientMessageKind::ConnectionEnd),
            other => Err(ProtocolError::UnknownKind(other)),
        }
    }
}

/// Messages sent from server to client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ServerMessageKind {
    Handshake = 0,
    HandshakeRefusal = 1,
    ServerMessage = 2,
    TextMessage = 3,
    StateUpdate = 4,
    Settings = 5,
    ScreenshotShare = 6,
    ConnectionEnd = 7,
}

impl From<ServerMessageKind> for u32 {
    fn from(kind: ServerMessageKind) -> Self {
        kind as u32
    }
}

impl TryFrom<u32> for ServerMessageKind {
    type Error = ProtocolError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ServerMessageKind::Handshake),
            1 => Ok(ServerMessageKind::HandshakeRefusal),
            2 => Ok(ServerMessageKind::ServerMessage),
            3 => Ok(ServerMessageKind::TextMessage),
            4 => Ok(ServerMessageKind::StateUpdate),
            5 => Ok(ServerMessageKind::Settings),
            6 => Ok(ServerMessageKind::ScreenshotShare),
            7 => Ok(ServerMessageKind::ConnectionEnd),
            other => Err(ProtocolError::UnknownKind(other)),
        }
    }
}

/// An outbound server message waiting in a slot's queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub kind: ServerMessageKind,
    pub payload: std::sync::Arc<[u8]>,
}

impl OutgoingMessage {
    pub fn new(kind: ServerMessageKind, payload: impl Into<std::sync::Arc<[u8]>>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }

    pub fn text(kind: ServerMessageKind, text: &str) -> Self {
        Self::new(kind, payload::encode_text(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_kind_ordinals() {
        let kinds = [
            ClientMessageKind::Handshake,
            ClientMessageKind::StateUpdate,
            ClientMessageKind::TextMessage,
            ClientMessageKind::WatchPlayer,
            ClientMessageKind::ScreenshotShare,
            ClientMessageKind::ConnectionEnd,
        ];

        for (ordinal, kind) in kinds.iter().enumerate() {
            assert_eq!(u32::from(*kind), ordinal as u32);
            assert_eq!(ClientMessageKind::try_from(ordinal as u32).unwrap(), *kind);
        }
        assert!(matches!(
            ClientMessageKind::try_from(6),
            Err(ProtocolError::UnknownKind(6))
        ));
    }

    #[test]
    fn test_server_kind_ordinals() {
        for ordinal in 0..8u32 {
            let kind = ServerMessageKind::try_from(ordinal).unwrap();
            assert_eq!(u32::from(kind), ordinal);
        }
        assert!(ServerMessageKind::try_from(8).is_err());
    }

    #[test]
    fn test_outgoing_text_message() {
        let message = OutgoingMessage::text(ServerMessageKind::ServerMessage, "hello");
        assert_eq!(message.kind, ServerMessageKind::ServerMessage);
        assert_eq!(&*message.payload, b"hello");
    }
}
