use thiserror::Error;

/// Failures raised while reading or writing protocol frames.
///
/// Every variant is local to one connection: the owner of the stream
/// treats it as a disconnect of that peer, never as a fatal error.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("frame of {length} bytes exceeds the {max} byte limit")]
    FrameTooLarge { length: u32, max: u32 },

    #[error("unknown message kind {0}")]
    UnknownKind(u32),

    #[error("malformed payload: {0}")]
    MalformedPayload(&'static str),

    #[error("encoding error: {0}")]
    Encoding(#[from] bincode::Error),
}

impl ProtocolError {
    /// True when the peer went away rather than sent something invalid.
    pub fn is_disconnect(&self) -> bool {
        match self {
            ProtocolError::ConnectionClosed => true,
            ProtocolError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::NotConnected
            ),
            _ => false,
        }
    }
}
