use crate::close::CloseCode;
use thiserror::Error;

/// Errors produced by the signaling relay.
///
/// Every variant is scoped to a single connection; none of them is fatal to
/// the server process.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Bad or missing upgrade parameters. The connection never opens.
    #[error("handshake rejected: {0}")]
    Handshake(String),

    /// Length, mask or opcode inconsistency in a frame header.
    #[error("framing error: {0}")]
    Framing(String),

    #[error("payload too large: {len} bytes (max {max})")]
    PayloadTooLarge { len: u64, max: usize },

    /// Valid frame carrying data the relay does not handle (binary,
    /// fragmented messages).
    #[error("unsupported data: {0}")]
    UnsupportedData(String),

    /// Malformed envelope inside an otherwise valid text frame.
    #[error("envelope decode error: {0}")]
    EnvelopeDecode(String),

    #[error("room not found: {0}")]
    RoomNotFound(String),

    /// A recipient's outbound queue is full.
    #[error("recipient backpressure: connection {0} outbound queue full")]
    Backpressure(u64),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("timeout")]
    Timeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl RelayError {
    /// Close code sent to the peer when this error terminates its connection.
    pub fn close_code(&self) -> CloseCode {
        match self {
            RelayError::Framing(_) | RelayError::Handshake(_) => CloseCode::ProtocolError,
            RelayError::PayloadTooLarge { .. } => CloseCode::MessageTooBig,
            RelayError::UnsupportedData(_) => CloseCode::UnsupportedData,
            RelayError::EnvelopeDecode(_) | RelayError::RoomNotFound(_) => CloseCode::Normal,
            RelayError::Timeout | RelayError::ConnectionClosed | RelayError::Io(_) => {
                CloseCode::Abnormal
            }
            RelayError::Backpressure(_) | RelayError::RateLimited(_) | RelayError::Other(_) => {
                CloseCode::InternalError
            }
        }
    }

    /// HTTP status used when this error rejects an upgrade request.
    pub fn http_status(&self) -> u16 {
        match self {
            RelayError::Handshake(_) => 400,
            RelayError::RateLimited(_) => 429,
            _ => 500,
        }
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(e: serde_json::Error) -> Self {
        RelayError::EnvelopeDecode(e.to_string())
    }
}

pub type RelayResult<T> = Result<T, RelayError>;
