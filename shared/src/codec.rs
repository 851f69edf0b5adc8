//! Wire framing shared by client and server
//!
//! Every message on the stream is an 8 byte header followed by the payload:
//!
//! ```text
//! [u32 LE kind][u32 LE payload length][payload bytes ...]
//! ```
//!
//! The header is encoded with bincode's default fixed-int little-endian
//! layout. Payload bytes are passed through untouched; their schema belongs
//! to the layer that interprets the message kind.

use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the encoded frame header in bytes
pub const HEADER_LENGTH: usize = 8;

/// Upper bound on a declared payload length; larger frames are refused
pub const MAX_FRAME_LENGTH: u32 = 1024 * 1024;

/// Message kind tag and payload length preceding every payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    pub kind: u32,
    pub length: u32,
}

/// Implemented by the two direction-specific kind enumerations
pub trait MessageKind: Copy + fmt::Debug + Into<u32> + TryFrom<u32, Error = ProtocolError> {}

impl<K> MessageKind for K where K: Copy + fmt::Debug + Into<u32> + TryFrom<u32, Error = ProtocolError> {}

/// One decoded frame with its kind still in wire form
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub kind: u32,
    pub payload: Vec<u8>,
}

impl RawFrame {
    /// Interprets the wire kind against one of the kind enumerations
    pub fn kind<K: MessageKind>(&self) -> Result<K, ProtocolError> {
        K::try_from(self.kind)
    }
}

pub fn encode_header(kind: u32, length: u32) -> Result<[u8; HEADER_LENGTH], ProtocolError> {
    let bytes = bincode::serialize(&MessageHeader { kind, length })?;
    let mut header = [0u8; HEADER_LENGTH];
    if bytes.len() != HEADER_LENGTH {
        return Err(ProtocolError::MalformedPayload("header encoding length"));
    }
    header.copy_from_slice(&bytes);
    Ok(header)
}

pub fn decode_header(bytes: &[u8; HEADER_LENGTH]) -> Result<MessageHeader, ProtocolError> {
    Ok(bincode::deserialize(bytes)?)
}

/// Builds the complete frame (header and payload) as one buffer
pub fn encode_frame<K: MessageKind>(kind: K, payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let length = u32::try_from(payload.len()).map_err(|_| ProtocolError::FrameTooLarge {
        length: u32::MAX,
        max: MAX_FRAME_LENGTH,
    })?;
    let mut buffer = Vec::with_capacity(HEADER_LENGTH + payload.len());
    buffer.extend_from_slice(&encode_header(kind.into(), length)?);
    buffer.extend_from_slice(payload);
    Ok(buffer)
}

/// Reads exactly one frame, waiting for partial reads to accumulate
///
/// A stream that ends before or inside a frame yields
/// [`ProtocolError::ConnectionClosed`].
pub async fn read_frame<R>(reader: &mut R, max_length: u32) -> Result<RawFrame, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut header_bytes = [0u8; HEADER_LENGTH];
    read_exact_or_closed(reader, &mut header_bytes).await?;
    let header = decode_header(&header_bytes)?;

    if header.length > max_length {
        return Err(ProtocolError::FrameTooLarge {
            length: header.length,
            max: max_length,
        });
    }

    let mut payload = vec![0u8; header.length as usize];
    if !payload.is_empty() {
        read_exact_or_closed(reader, &mut payload).await?;
    }

    Ok(RawFrame {
        kind: header.kind,
        payload,
    })
}

/// Writes one frame with a single buffered write and flushes it
pub async fn write_frame<W, K>(writer: &mut W, kind: K, payload: &[u8]) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin + ?Sized,
    K: MessageKind,
{
    let frame = encode_frame(kind, payload)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_exact_or_closed<R>(reader: &mut R, buffer: &mut [u8]) -> Result<(), ProtocolError>
where
    R: AsyncRead + Unpin,
{
    match reader.read_exact(buffer).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(ProtocolError::ConnectionClosed)
        }
        Err(e) => Err(ProtocolError::Io(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ClientMessageKind, ServerMessageKind};
    use tokio::io::duplex;

    #[test]
    fn test_header_layout_is_little_endian() {
        let header = encode_header(5, 0x0102_0304).unwrap();
        assert_eq!(header, [5, 0, 0, 0, 0x04, 0x03, 0x02, 0x01]);

        let decoded = decode_header(&header).unwrap();
        assert_eq!(decoded.kind, 5);
        assert_eq!(decoded.length, 0x0102_0304);
    }

    #[tokio::test]
    async fn test_frame_roundtrip_various_lengths() {
        for length in [0usize, 1, 7, 8, 9, 255, 4096] {
            let payload: Vec<u8> = (0..length).map(|i| (i % 251) as u8).collect();
            let encoded = encode_frame(ServerMessageKind::StateUpdate, &payload).unwrap();
            assert_eq!(encoded.len(), HEADER_LENGTH + length);

            let mut reader = &encoded[..];
            let frame = read_frame(&mut reader, MAX_FRAME_LENGTH).await.unwrap();
            assert_eq!(
                frame.kind::<ServerMessageKind>().unwrap(),
                ServerMessageKind::StateUpdate
            );
            assert_eq!(frame.payload, payload);
        }
    }

    #[tokio::test]
    async fn test_partial_reads_accumulate() {
        let (mut tx, mut rx) = duplex(64);
        let frame = encode_frame(ClientMessageKind::TextMessage, b"hello there").unwrap();

        let writer = tokio::spawn(async move {
            for chunk in frame.chunks(3) {
                tx.write_all(chunk).await.unwrap();
                tokio::task::yield_now().await;
            }
            tx
        });

        let received = read_frame(&mut rx, MAX_FRAME_LENGTH).await.unwrap();
        assert_eq!(received.kind, u32::from(ClientMessageKind::TextMessage));
        assert_eq!(received.payload, b"hello there");
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn test_frame_split_across_socket_reads() {
        let frame = encode_frame(ServerMessageKind::Settings, &[9; 12]).unwrap();
        let mut socket = tokio_test::io::Builder::new()
            .read(&frame[..3])
            .read(&frame[3..10])
            .read(&frame[10..])
            .build();

        let received = read_frame(&mut socket, MAX_FRAME_LENGTH).await.unwrap();
        assert_eq!(received.kind, u32::from(ServerMessageKind::Settings));
        assert_eq!(received.payload, vec![9; 12]);
    }

    #[tokio::test]
    async fn test_write_frame_wire_bytes() {
        let mut socket = tokio_test::io::Builder::new()
            .write(&[7, 0, 0, 0, 4, 0, 0, 0, b'Q', b'u', b'i', b't'])
            .build();

        write_frame(&mut socket, ServerMessageKind::ConnectionEnd, b"Quit")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_stream_closed_mid_frame() {
        let encoded = encode_frame(ClientMessageKind::StateUpdate, &[1, 2, 3, 4, 5]).unwrap();
        let mut truncated = &encoded[..HEADER_LENGTH + 2];

        let result = read_frame(&mut truncated, MAX_FRAME_LENGTH).await;
        assert!(matches!(result, Err(ProtocolError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_stream_closed_before_header() {
        let mut empty: &[u8] = &[];
        let result = read_frame(&mut empty, MAX_FRAME_LENGTH).await;
        let err = result.unwrap_err();
        assert!(err.is_disconnect());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let header = encode_header(1, MAX_FRAME_LENGTH + 1).unwrap();
        let mut reader = &header[..];
        let result = read_frame(&mut reader, MAX_FRAME_LENGTH).await;
        assert!(matches!(result, Err(ProtocolError::FrameTooLarge { .. })));
    }

    #[tokio::test]
    async fn test_write_frame_then_read() {
        let (mut tx, mut rx) = duplex(256);
        write_frame(&mut tx, ServerMessageKind::ConnectionEnd, b"Timeout")
            .await
            .unwrap();

        let frame = read_frame(&mut rx, MAX_FRAME_LENGTH).await.unwrap();
        assert_eq!(
            frame.kind::<ServerMessageKind>().unwrap(),
            ServerMessageKind::ConnectionEnd
        );
        assert_eq!(frame.payload, b"Timeout");
    }
}
