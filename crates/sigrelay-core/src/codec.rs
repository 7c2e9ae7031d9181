//! RFC 6455 frame codec and handshake key derivation.
//!
//! Wire format of one frame:
//! `[fin|rsv|opcode][mask|len7][ext len: 0, 2 or 8 bytes][mask key: 0 or 4][payload]`
//!
//! The server only ever produces single, unmasked, final frames. Inbound
//! frames from clients must be masked.

use crate::close::CloseCode;
use crate::error::{RelayError, RelayResult};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use sha1::{Digest, Sha1};

/// Fixed GUID appended to the client key during the opening handshake.
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Control frames carry at most 125 payload bytes.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Default maximum accepted payload (16 MiB).
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// Frame opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl Opcode {
    /// Parse the low nibble of the first header byte. Reserved opcodes yield `None`.
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte & 0x0F {
            0x0 => Some(Opcode::Continuation),
            0x1 => Some(Opcode::Text),
            0x2 => Some(Opcode::Binary),
            0x8 => Some(Opcode::Close),
            0x9 => Some(Opcode::Ping),
            0xA => Some(Opcode::Pong),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Opcode::Continuation => 0x0,
            Opcode::Text => 0x1,
            Opcode::Binary => 0x2,
            Opcode::Close => 0x8,
            Opcode::Ping => 0x9,
            Opcode::Pong => 0xA,
        }
    }

    pub fn is_control(self) -> bool {
        matches!(self, Opcode::Close | Opcode::Ping | Opcode::Pong)
    }
}

/// A complete decoded frame with its payload already unmasked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: Opcode,
    pub masked: bool,
    pub payload: Vec<u8>,
}

/// Outcome of [`parse_frame`].
#[derive(Debug, PartialEq, Eq)]
pub enum Parsed {
    /// A full frame and the number of buffer bytes it occupied.
    Complete { frame: Frame, consumed: usize },
    /// The buffer does not hold a full frame yet; keep it and append.
    Incomplete,
}

/// Parse one frame from the front of `buf`.
///
/// Returns [`Parsed::Incomplete`] when more bytes are needed. Header
/// inconsistencies are [`RelayError::Framing`]; a declared length above
/// `max_payload` is [`RelayError::PayloadTooLarge`] and is reported as soon as
/// the length field is readable.
pub fn parse_frame(buf: &[u8], max_payload: usize) -> RelayResult<Parsed> {
    if buf.len() < 2 {
        return Ok(Parsed::Incomplete);
    }

    let b0 = buf[0];
    let b1 = buf[1];
    let fin = b0 & 0x80 != 0;

    if b0 & 0x70 != 0 {
        return Err(RelayError::Framing("reserved bits set without an extension".into()));
    }
    let opcode = Opcode::from_u8(b0)
        .ok_or_else(|| RelayError::Framing(format!("reserved opcode 0x{:x}", b0 & 0x0F)))?;
    let masked = b1 & 0x80 != 0;

    let (declared, mut offset) = match b1 & 0x7F {
        126 => {
            if buf.len() < 4 {
                return Ok(Parsed::Incomplete);
            }
            let len = u16::from_be_bytes([buf[2], buf[3]]) as u64;
            if len < 126 {
                return Err(RelayError::Framing(format!(
                    "non-minimal 16-bit length encoding for {len} bytes"
                )));
            }
            (len, 4)
        }
        127 => {
            if buf.len() < 10 {
                return Ok(Parsed::Incomplete);
            }
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&buf[2..10]);
            let len = u64::from_be_bytes(raw);
            if len >> 63 != 0 {
                return Err(RelayError::Framing("64-bit length has its top bit set".into()));
            }
            if len <= u16::MAX as u64 {
                return Err(RelayError::Framing(format!(
                    "non-minimal 64-bit length encoding for {len} bytes"
                )));
            }
            (len, 10)
        }
        n => (n as u64, 2),
    };

    if opcode.is_control() {
        if !fin {
            return Err(RelayError::Framing("fragmented control frame".into()));
        }
        if declared > MAX_CONTROL_PAYLOAD as u64 {
            return Err(RelayError::Framing(format!(
                "control frame payload of {declared} bytes"
            )));
        }
    }

    if declared > max_payload as u64 {
        return Err(RelayError::PayloadTooLarge {
            len: declared,
            max: max_payload,
        });
    }
    let len = declared as usize;

    let mask = if masked {
        if buf.len() < offset + 4 {
            return Ok(Parsed::Incomplete);
        }
        let key = [buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]];
        offset += 4;
        Some(key)
    } else {
        None
    };

    if buf.len() < offset + len {
        return Ok(Parsed::Incomplete);
    }

    let mut payload = buf[offset..offset + len].to_vec();
    if let Some(key) = mask {
        apply_mask(&mut payload, key);
    }

    Ok(Parsed::Complete {
        frame: Frame {
            fin,
            opcode,
            masked,
            payload,
        },
        consumed: offset + len,
    })
}

/// XOR `data` with the 4-byte masking key. Masking and unmasking are the same operation.
pub fn apply_mask(data: &mut [u8], key: [u8; 4]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

/// Build a single final, unmasked frame as sent by the server.
pub fn build_frame(opcode: Opcode, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(10 + payload.len());
    frame.push(0x80 | opcode.as_u8());
    write_length(&mut frame, payload.len(), 0);
    frame.extend_from_slice(payload);
    frame
}

/// Build a masked frame the way a client must send it.
pub fn build_masked_frame(opcode: Opcode, payload: &[u8], key: [u8; 4]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(14 + payload.len());
    frame.push(0x80 | opcode.as_u8());
    write_length(&mut frame, payload.len(), 0x80);
    frame.extend_from_slice(&key);
    let start = frame.len();
    frame.extend_from_slice(payload);
    apply_mask(&mut frame[start..], key);
    frame
}

fn write_length(out: &mut Vec<u8>, len: usize, mask_bit: u8) {
    if len < 126 {
        out.push(mask_bit | len as u8);
    } else if len <= u16::MAX as usize {
        out.push(mask_bit | 126);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(mask_bit | 127);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }
}

/// Close frame payload: 2-byte big-endian code followed by a UTF-8 reason,
/// truncated so the payload fits a control frame.
pub fn close_payload(code: CloseCode, reason: &str) -> Vec<u8> {
    let mut cut = reason.len().min(MAX_CONTROL_PAYLOAD - 2);
    while !reason.is_char_boundary(cut) {
        cut -= 1;
    }
    let mut payload = Vec::with_capacity(2 + cut);
    payload.extend_from_slice(&code.as_u16().to_be_bytes());
    payload.extend_from_slice(&reason.as_bytes()[..cut]);
    payload
}

pub fn build_close_frame(code: CloseCode, reason: &str) -> Vec<u8> {
    build_frame(Opcode::Close, &close_payload(code, reason))
}

/// Decode a close frame payload. An empty payload carries no status.
pub fn parse_close_payload(payload: &[u8]) -> RelayResult<Option<(CloseCode, String)>> {
    match payload.len() {
        0 => Ok(None),
        1 => Err(RelayError::Framing("close payload of one byte".into())),
        _ => {
            let code = CloseCode::from_u16(u16::from_be_bytes([payload[0], payload[1]]));
            if !code.is_sendable() {
                return Err(RelayError::Framing(format!("invalid close code {code}")));
            }
            let reason = std::str::from_utf8(&payload[2..])
                .map_err(|_| RelayError::Framing("close reason is not UTF-8".into()))?;
            Ok(Some((code, reason.to_string())))
        }
    }
}

/// Derive `Sec-WebSocket-Accept` from the client's `Sec-WebSocket-Key`.
pub fn accept_key(client_key: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(client_key.trim().as_bytes());
    sha1.update(WS_GUID.as_bytes());
    BASE64.encode(sha1.finalize())
}

/// A client key must be the base64 encoding of 16 bytes.
pub fn is_valid_client_key(client_key: &str) -> bool {
    BASE64
        .decode(client_key.trim())
        .map(|raw| raw.len() == 16)
        .unwrap_or(false)
}

/// Which side of the connection the decoder runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Decodes client frames, which must be masked.
    Server,
    /// Decodes server frames, which must not be masked.
    Client,
}

/// Streaming frame decoder: accumulates short reads and yields complete frames.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    max_payload: usize,
    role: Role,
}

impl FrameDecoder {
    pub fn new(role: Role, max_payload: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_payload,
            role,
        }
    }

    pub fn server(max_payload: usize) -> Self {
        Self::new(Role::Server, max_payload)
    }

    pub fn client(max_payload: usize) -> Self {
        Self::new(Role::Client, max_payload)
    }

    /// Append received bytes.
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Pop the next complete frame, or `None` if more bytes are needed.
    pub fn next_frame(&mut self) -> RelayResult<Option<Frame>> {
        if self.buffer.len() >= 2 {
            let masked = self.buffer[1] & 0x80 != 0;
            match (self.role, masked) {
                (Role::Server, false) => {
                    return Err(RelayError::Framing("client frame is not masked".into()));
                }
                (Role::Client, true) => {
                    return Err(RelayError::Framing("server frame is masked".into()));
                }
                _ => {}
            }
        }

        match parse_frame(&self.buffer, self.max_payload)? {
            Parsed::Complete { frame, consumed } => {
                self.buffer.drain(..consumed);
                Ok(Some(frame))
            }
            Parsed::Incomplete => Ok(None),
        }
    }

    /// Reset internal buffer.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Number of bytes remaining in the internal buffer.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MASK: [u8; 4] = [0x37, 0xfa, 0x21, 0x3d];

    fn complete(parsed: Parsed) -> (Frame, usize) {
        match parsed {
            Parsed::Complete { frame, consumed } => (frame, consumed),
            Parsed::Incomplete => panic!("expected a complete frame"),
        }
    }

    #[test]
    fn accept_key_matches_rfc_example() {
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn client_key_validation() {
        assert!(is_valid_client_key("dGhlIHNhbXBsZSBub25jZQ=="));
        assert!(!is_valid_client_key("not base64!"));
        assert!(!is_valid_client_key("aGVsbG8="));
    }

    #[test]
    fn unmasks_known_vector() {
        // RFC 6455 §5.7: masked "Hello"
        let wire = [0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58];
        let (frame, consumed) = complete(parse_frame(&wire, 1024).unwrap());
        assert_eq!(consumed, wire.len());
        assert!(frame.fin);
        assert!(frame.masked);
        assert_eq!(frame.opcode, Opcode::Text);
        assert_eq!(frame.payload, b"Hello");
    }

    #[test]
    fn masked_ping_known_vector() {
        let wire = [0x89, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58];
        let (frame, _) = complete(parse_frame(&wire, 1024).unwrap());
        assert_eq!(frame.opcode, Opcode::Ping);
        assert_eq!(frame.payload, b"Hello");
    }

    #[test]
    fn build_uses_minimal_length_encoding() {
        assert_eq!(build_frame(Opcode::Text, b"Hello"), [0x81, 0x05, b'H', b'e', b'l', b'l', b'o']);

        let medium = build_frame(Opcode::Binary, &[0u8; 256]);
        assert_eq!(&medium[..4], &[0x82, 0x7E, 0x01, 0x00]);
        assert_eq!(medium.len(), 4 + 256);

        let large = build_frame(Opcode::Binary, &vec![0u8; 65536]);
        assert_eq!(
            &large[..10],
            &[0x82, 0x7F, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00]
        );
    }

    #[test]
    fn server_frames_parse_back_after_client_masking() {
        for len in [0usize, 125, 126, 65535, 65536] {
            let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            for opcode in [Opcode::Text, Opcode::Binary] {
                let wire = build_masked_frame(opcode, &payload, MASK);
                let (frame, consumed) = complete(parse_frame(&wire, DEFAULT_MAX_PAYLOAD).unwrap());
                assert_eq!(consumed, wire.len());
                assert_eq!(frame.opcode, opcode);
                assert_eq!(frame.payload, payload);

                let unmasked = build_frame(opcode, &payload);
                assert_eq!(unmasked[1] & 0x80, 0, "server frames must not be masked");
                let (frame, _) = complete(parse_frame(&unmasked, DEFAULT_MAX_PAYLOAD).unwrap());
                assert_eq!(frame.payload, payload);
            }
        }
    }

    #[test]
    fn short_reads_are_incomplete() {
        let wire = build_masked_frame(Opcode::Text, &[b'x'; 300], MASK);
        for cut in [0, 1, 2, 3, 5, 7, wire.len() - 1] {
            assert_eq!(parse_frame(&wire[..cut], 1024).unwrap(), Parsed::Incomplete);
        }
    }

    #[test]
    fn decoder_accumulates_byte_by_byte() {
        let wire = build_masked_frame(Opcode::Text, b"{\"type\":\"offer\"}", MASK);
        let mut decoder = FrameDecoder::server(1024);
        for byte in &wire[..wire.len() - 1] {
            decoder.feed(std::slice::from_ref(byte));
            assert!(decoder.next_frame().unwrap().is_none());
        }
        decoder.feed(&wire[wire.len() - 1..]);
        let frame = decoder.next_frame().unwrap().unwrap();
        assert_eq!(frame.payload, b"{\"type\":\"offer\"}");
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn decoder_yields_back_to_back_frames_in_order() {
        let mut wire = build_masked_frame(Opcode::Text, b"one", MASK);
        wire.extend(build_masked_frame(Opcode::Ping, b"", MASK));
        wire.extend(build_masked_frame(Opcode::Text, b"two", MASK));
        wire.extend_from_slice(&[0x81, 0x83]);

        let mut decoder = FrameDecoder::server(1024);
        decoder.feed(&wire);
        assert_eq!(decoder.next_frame().unwrap().unwrap().payload, b"one");
        assert_eq!(decoder.next_frame().unwrap().unwrap().opcode, Opcode::Ping);
        assert_eq!(decoder.next_frame().unwrap().unwrap().payload, b"two");
        assert!(decoder.next_frame().unwrap().is_none());
        assert_eq!(decoder.pending(), 2);

        decoder.reset();
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn server_decoder_rejects_unmasked_frames() {
        let mut decoder = FrameDecoder::server(1024);
        decoder.feed(&build_frame(Opcode::Text, b"hi"));
        assert!(matches!(decoder.next_frame(), Err(RelayError::Framing(_))));
    }

    #[test]
    fn client_decoder_rejects_masked_frames() {
        let mut decoder = FrameDecoder::client(1024);
        decoder.feed(&build_masked_frame(Opcode::Text, b"hi", MASK));
        assert!(matches!(decoder.next_frame(), Err(RelayError::Framing(_))));
    }

    #[test]
    fn non_minimal_lengths_are_framing_errors() {
        // 16-bit form declaring 5 bytes
        let wire = [0x81, 0xFE, 0x00, 0x05, 0, 0, 0, 0, 1, 2, 3, 4, 5];
        assert!(matches!(parse_frame(&wire, 1024), Err(RelayError::Framing(_))));

        // 64-bit form declaring 300 bytes
        let mut wire = vec![0x81, 0xFF];
        wire.extend_from_slice(&300u64.to_be_bytes());
        assert!(matches!(parse_frame(&wire, 1024), Err(RelayError::Framing(_))));

        // top bit set
        let mut wire = vec![0x81, 0xFF];
        wire.extend_from_slice(&(1u64 << 63).to_be_bytes());
        assert!(matches!(parse_frame(&wire, usize::MAX), Err(RelayError::Framing(_))));
    }

    #[test]
    fn oversized_payload_detected_from_header() {
        let mut wire = vec![0x81, 0xFF];
        wire.extend_from_slice(&(1u64 << 32).to_be_bytes());
        match parse_frame(&wire, 1 << 20) {
            Err(RelayError::PayloadTooLarge { len, max }) => {
                assert_eq!(len, 1 << 32);
                assert_eq!(max, 1 << 20);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn reserved_bits_and_opcodes_rejected() {
        assert!(matches!(
            parse_frame(&[0xC1, 0x80, 0, 0, 0, 0], 1024),
            Err(RelayError::Framing(_))
        ));
        assert!(matches!(
            parse_frame(&[0x83, 0x80, 0, 0, 0, 0], 1024),
            Err(RelayError::Framing(_))
        ));
    }

    #[test]
    fn control_frame_constraints() {
        // fragmented ping
        assert!(matches!(
            parse_frame(&[0x09, 0x80, 0, 0, 0, 0], 1024),
            Err(RelayError::Framing(_))
        ));
        // 126-byte ping
        let wire = build_masked_frame(Opcode::Ping, &[0u8; 126], MASK);
        assert!(matches!(parse_frame(&wire, 1024), Err(RelayError::Framing(_))));
    }

    #[test]
    fn close_payload_round_trip_and_truncation() {
        let payload = close_payload(CloseCode::GoingAway, "server shutting down");
        assert_eq!(
            parse_close_payload(&payload).unwrap(),
            Some((CloseCode::GoingAway, "server shutting down".to_string()))
        );

        let long = "é".repeat(100);
        let payload = close_payload(CloseCode::Normal, &long);
        assert!(payload.len() <= MAX_CONTROL_PAYLOAD);
        assert!(std::str::from_utf8(&payload[2..]).is_ok());

        assert_eq!(parse_close_payload(&[]).unwrap(), None);
        assert!(parse_close_payload(&[0x03]).is_err());
        assert!(parse_close_payload(&1005u16.to_be_bytes()).is_err());
    }

    #[test]
    fn close_frame_is_a_final_control_frame() {
        let wire = build_close_frame(CloseCode::ProtocolError, "bad frame");
        assert_eq!(wire[0], 0x88);
        let (frame, _) = complete(parse_frame(&wire, 1024).unwrap());
        assert_eq!(
            parse_close_payload(&frame.payload).unwrap().unwrap().0,
            CloseCode::ProtocolError
        );
    }
}
