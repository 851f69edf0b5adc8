//! Payload schemas for the message kinds that carry structured data
//!
//! Text-bearing messages (chat, server notices, disconnect reasons, watch
//! requests) carry raw UTF-8 with no length prefix; see [`encode_text`] and
//! [`decode_text`].

use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};

/// Handshake sent by a client: `[u32 username length][username][version]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHandshake {
    pub username: String,
    pub version: String,
}

impl ClientHandshake {
    pub fn new(username: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            version: version.into(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let username = self.username.as_bytes();
        let mut bytes = Vec::with_capacity(4 + username.len() + self.version.len());
        bytes.extend_from_slice(&(username.len() as u32).to_le_bytes());
        bytes.extend_from_slice(username);
        bytes.extend_from_slice(self.version.as_bytes());
        bytes
    }

    /// Parses a client handshake, rejecting a username length that
    /// overruns the payload.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let username_length = read_u32(bytes, 0)
            .ok_or(ProtocolError::MalformedPayload("handshake missing username length"))?
            as usize;

        let username_end = 4usize
            .checked_add(username_length)
            .filter(|end| *end <= bytes.len())
            .ok_or(ProtocolError::MalformedPayload("handshake username overruns payload"))?;

        Ok(Self {
            username: decode_text(&bytes[4..username_end]),
            version: decode_text(&bytes[username_end..]),
        })
    }
}

/// Handshake sent by the server: `[u32 protocol version][version]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerHandshake {
    pub protocol_version: u32,
    pub version: String,
}

impl ServerHandshake {
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(4 + self.version.len());
        bytes.extend_from_slice(&self.protocol_version.to_le_bytes());
        bytes.extend_from_slice(self.version.as_bytes());
        bytes
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let protocol_version = read_u32(bytes, 0)
            .ok_or(ProtocolError::MalformedPayload("handshake missing protocol version"))?;

        Ok(Self {
            protocol_version,
            version: decode_text(&bytes[4..]),
        })
    }
}

/// Session cadence pushed by the server whenever membership changes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingsPayload {
    /// Milliseconds between state updates a client should send
    pub update_interval: u32,
    /// How many inbound updates a client keeps queued for its application
    pub max_queued_updates: u32,
    /// Milliseconds between screenshot shares
    pub screenshot_interval: u32,
}

impl SettingsPayload {
    pub const ENCODED_LENGTH: usize = 12;

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < Self::ENCODED_LENGTH {
            return Err(ProtocolError::MalformedPayload("settings payload too short"));
        }
        Ok(bincode::deserialize(&bytes[..Self::ENCODED_LENGTH])?)
    }
}

pub fn encode_text(text: &str) -> Vec<u8> {
    text.as_bytes().to_vec()
}

pub fn decode_text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

fn read_u32(bytes: &[u8], offset: usize) -> Option<u32> {
    let slice = bytes.get(offset..offset.checked_add(4)?)?;
    let mut word = [0u8; 4];
    word.copy_from_slice(slice);
    Some(u32::from_le_bytes(word))
}
