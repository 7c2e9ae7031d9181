//! WebSocket close status codes used by the relay.

use std::fmt;

/// Close codes sent or recognised by the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseCode {
    /// Normal closure, also used when a participant's connection is superseded.
    Normal,
    /// Server shutting down.
    GoingAway,
    /// Malformed frame.
    ProtocolError,
    /// Binary or fragmented data.
    UnsupportedData,
    /// Close frame carried no status code. Never sent on the wire.
    NoStatus,
    /// Socket dropped without a close handshake. Never sent on the wire.
    Abnormal,
    InvalidPayload,
    PolicyViolation,
    MessageTooBig,
    InternalError,
    /// Any other code in the registered or private ranges.
    Other(u16),
}

impl CloseCode {
    pub fn as_u16(self) -> u16 {
        match self {
            CloseCode::Normal => 1000,
            CloseCode::GoingAway => 1001,
            CloseCode::ProtocolError => 1002,
            CloseCode::UnsupportedData => 1003,
            CloseCode::NoStatus => 1005,
            CloseCode::Abnormal => 1006,
            CloseCode::InvalidPayload => 1007,
            CloseCode::PolicyViolation => 1008,
            CloseCode::MessageTooBig => 1009,
            CloseCode::InternalError => 1011,
            CloseCode::Other(code) => code,
        }
    }

    pub fn from_u16(code: u16) -> Self {
        match code {
            1000 => CloseCode::Normal,
            1001 => CloseCode::GoingAway,
            1002 => CloseCode::ProtocolError,
            1003 => CloseCode::UnsupportedData,
            1005 => CloseCode::NoStatus,
            1006 => CloseCode::Abnormal,
            1007 => CloseCode::InvalidPayload,
            1008 => CloseCode::PolicyViolation,
            1009 => CloseCode::MessageTooBig,
            1011 => CloseCode::InternalError,
            other => CloseCode::Other(other),
        }
    }

    /// Whether a peer may legally put this code in a close frame (RFC 6455 §7.4).
    pub fn is_sendable(self) -> bool {
        match self.as_u16() {
            1000..=1003 | 1007..=1011 => true,
            3000..=4999 => true,
            _ => false,
        }
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u16())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_codes_round_trip() {
        for code in [1000u16, 1001, 1002, 1003, 1009, 1011] {
            assert_eq!(CloseCode::from_u16(code).as_u16(), code);
        }
        assert_eq!(CloseCode::from_u16(4001), CloseCode::Other(4001));
    }

    #[test]
    fn reserved_codes_are_not_sendable() {
        assert!(!CloseCode::NoStatus.is_sendable());
        assert!(!CloseCode::Abnormal.is_sendable());
        assert!(!CloseCode::Other(1015).is_sendable());
        assert!(!CloseCode::Other(999).is_sendable());
        assert!(CloseCode::GoingAway.is_sendable());
        assert!(CloseCode::Other(4000).is_sendable());
    }
}
