//! Control frame handling (ping, pong, close).

use sigrelay_core::codec::{build_close_frame, build_frame, parse_close_payload};
use sigrelay_core::{CloseCode, Frame, Opcode, RelayError, RelayResult};

/// What the connection task should do after a control frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlAction {
    /// Write this pong to the peer.
    Pong(Vec<u8>),
    /// The peer answered a keepalive ping.
    PongReceived,
    /// The peer started (or answered) a close: write the acknowledgement
    /// and finish the connection.
    Close {
        code: CloseCode,
        reason: String,
        ack: Vec<u8>,
    },
}

/// Decide the response to a control frame.
///
/// A ping is answered with a pong echoing its payload. A close is
/// acknowledged with the peer's own code, or 1000 when it sent none.
/// A close payload that is not a valid status is a framing error.
pub fn handle_control(frame: &Frame) -> RelayResult<ControlAction> {
    match frame.opcode {
        Opcode::Ping => Ok(ControlAction::Pong(build_frame(Opcode::Pong, &frame.payload))),
        Opcode::Pong => Ok(ControlAction::PongReceived),
        Opcode::Close => {
            let (code, reason) = parse_close_payload(&frame.payload)?
                .unwrap_or((CloseCode::Normal, String::new()));
            Ok(ControlAction::Close {
                code,
                ack: build_close_frame(code, ""),
                reason,
            })
        }
        other => Err(RelayError::Other(format!("{other:?} is not a control frame"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sigrelay_core::FrameDecoder;

    fn control(opcode: Opcode, payload: &[u8]) -> Frame {
        Frame {
            fin: true,
            opcode,
            masked: true,
            payload: payload.to_vec(),
        }
    }

    fn decode(bytes: &[u8]) -> Frame {
        let mut decoder = FrameDecoder::client(1024);
        decoder.feed(bytes);
        decoder.next_frame().unwrap().unwrap()
    }

    #[test]
    fn ping_is_echoed() {
        let ControlAction::Pong(bytes) = handle_control(&control(Opcode::Ping, b"Hello")).unwrap() else {
            panic!("expected pong");
        };
        let pong = decode(&bytes);
        assert_eq!(pong.opcode, Opcode::Pong);
        assert_eq!(pong.payload, b"Hello");
    }

    #[test]
    fn pong_is_noted() {
        assert_eq!(
            handle_control(&control(Opcode::Pong, b"")).unwrap(),
            ControlAction::PongReceived
        );
    }

    #[test]
    fn close_is_acknowledged_with_peer_code() {
        let mut payload = 1001u16.to_be_bytes().to_vec();
        payload.extend_from_slice(b"bye");
        let ControlAction::Close { code, reason, ack } =
            handle_control(&control(Opcode::Close, &payload)).unwrap()
        else {
            panic!("expected close");
        };
        assert_eq!(code, CloseCode::GoingAway);
        assert_eq!(reason, "bye");
        assert_eq!(decode(&ack).payload, 1001u16.to_be_bytes());
    }

    #[test]
    fn empty_close_is_acknowledged_as_normal() {
        let ControlAction::Close { code, ack, .. } = handle_control(&control(Opcode::Close, b"")).unwrap() else {
            panic!("expected close");
        };
        assert_eq!(code, CloseCode::Normal);
        assert_eq!(decode(&ack).payload, 1000u16.to_be_bytes());
    }

    #[test]
    fn invalid_close_payload_is_framing_error() {
        assert!(matches!(
            handle_control(&control(Opcode::Close, &[0x03])),
            Err(RelayError::Framing(_))
        ));
        assert!(matches!(
            handle_control(&control(Opcode::Close, &1005u16.to_be_bytes())),
            Err(RelayError::Framing(_))
        ));
    }

    #[test]
    fn data_frames_are_rejected() {
        assert!(handle_control(&control(Opcode::Text, b"x")).is_err());
    }
}
