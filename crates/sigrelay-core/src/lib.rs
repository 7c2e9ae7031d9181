//! sigrelay-core: shared protocol library for the signaling relay.
//!
//! Provides the WebSocket frame codec and handshake key derivation, close
//! codes, signaling envelope types and the relay error taxonomy.

pub mod close;
pub mod codec;
pub mod envelope;
pub mod error;

// Re-export commonly used items at crate root.
pub use close::CloseCode;
pub use codec::{
    accept_key, build_close_frame, build_frame, parse_frame, Frame, FrameDecoder, Opcode, Parsed,
};
pub use envelope::{Envelope, Inbound, MessageKind};
pub use error::{RelayError, RelayResult};
