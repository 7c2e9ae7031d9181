//! HTTP side of the upgrade handler.
//!
//! Reads the request head, routes it to a health report, a signaling
//! channel or a rejection, and validates the WebSocket upgrade headers and
//! identity parameters. Writes the 101 and plain HTTP responses.

use crate::connection::Channel;
use crate::health::HealthPath;
use percent_encoding::percent_decode_str;
use sigrelay_core::codec::is_valid_client_key;
use sigrelay_core::{accept_key, RelayError, RelayResult};
use tokio::io::{AsyncRead, AsyncReadExt};
use url::Url;

const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Parsed request line and headers.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    headers: Vec<(String, String)>,
}

impl RequestHead {
    /// Parse the head text (request line and headers, without the blank line).
    pub fn parse(raw: &str) -> RelayResult<Self> {
        let mut lines = raw.split("\r\n");
        let request_line = lines.next().unwrap_or_default();
        let mut parts = request_line.split(' ');
        let (Some(method), Some(target), Some(version)) = (parts.next(), parts.next(), parts.next()) else {
            return Err(RelayError::Handshake(format!("malformed request line: {request_line:?}")));
        };
        if !version.starts_with("HTTP/1.") {
            return Err(RelayError::Handshake(format!("unsupported HTTP version {version}")));
        }

        let mut headers = Vec::new();
        for line in lines.filter(|l| !l.is_empty()) {
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| RelayError::Handshake(format!("malformed header line: {line:?}")))?;
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }

        Ok(Self {
            method: method.to_string(),
            target: target.to_string(),
            headers,
        })
    }

    /// First value of a header, matched case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Whether a comma-separated header contains `token` (case-insensitive).
    fn header_has_token(&self, name: &str, token: &str) -> bool {
        self.headers
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .flat_map(|(_, v)| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    }
}

/// Read the request head from `stream`.
///
/// Returns the head and any bytes read past it, which belong to the frame
/// stream. A head larger than `max_bytes` is a handshake error; EOF before
/// the blank line is [`RelayError::ConnectionClosed`].
pub async fn read_request_head<R>(stream: &mut R, max_bytes: usize) -> RelayResult<(RequestHead, Vec<u8>)>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(RelayError::ConnectionClosed);
        }
        // Resume the search a few bytes back in case the terminator straddles reads.
        let search_from = buf.len().saturating_sub(HEAD_TERMINATOR.len() - 1);
        buf.extend_from_slice(&chunk[..n]);

        if let Some(pos) = find(&buf[search_from..], HEAD_TERMINATOR) {
            let end = search_from + pos;
            if end > max_bytes {
                break;
            }
            let text = std::str::from_utf8(&buf[..end])
                .map_err(|_| RelayError::Handshake("request head is not valid UTF-8".into()))?;
            let head = RequestHead::parse(text)?;
            let leftover = buf[end + HEAD_TERMINATOR.len()..].to_vec();
            return Ok((head, leftover));
        }
        if buf.len() > max_bytes {
            break;
        }
    }
    Err(RelayError::Handshake(format!("request head exceeds {max_bytes} bytes")))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// A validated upgrade request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeRequest {
    pub channel: Channel,
    pub room_id: String,
    pub participant_id: String,
    pub client_key: String,
}

/// Where a request head is routed.
#[derive(Debug)]
pub enum Route {
    Health(HealthPath),
    /// A signaling path; the result carries header/parameter validation.
    Upgrade(RelayResult<UpgradeRequest>),
    Reject { status: u16, reason: &'static str },
}

/// Route a request head.
pub fn classify(head: &RequestHead) -> Route {
    if !head.target.starts_with('/') {
        return Route::Upgrade(Err(RelayError::Handshake(format!(
            "request target must be an absolute path: {}",
            head.target
        ))));
    }
    let url = match Url::parse(&format!("http://relay{}", head.target)) {
        Ok(url) => url,
        Err(e) => return Route::Upgrade(Err(RelayError::Handshake(format!("bad request target: {e}")))),
    };

    if head.method != "GET" {
        return Route::Reject {
            status: 405,
            reason: "only GET is supported",
        };
    }
    if let Some(health) = HealthPath::from_path(url.path()) {
        return Route::Health(health);
    }

    let segments: Vec<&str> = url
        .path_segments()
        .map(|s| s.filter(|seg| !seg.is_empty()).collect())
        .unwrap_or_default();
    let channel = match segments.first().copied() {
        Some("call-signaling") | Some("audio-signaling") => Channel::Call,
        Some("chat-signaling") => Channel::Chat,
        _ => {
            return Route::Reject {
                status: 404,
                reason: "no such endpoint",
            }
        }
    };
    if segments.len() > 2 {
        return Route::Reject {
            status: 404,
            reason: "no such endpoint",
        };
    }

    Route::Upgrade(validate_upgrade(head, &url, channel, segments.get(1).copied()))
}

fn validate_upgrade(
    head: &RequestHead,
    url: &Url,
    channel: Channel,
    path_room: Option<&str>,
) -> RelayResult<UpgradeRequest> {
    if !head.header_has_token("Upgrade", "websocket") {
        return Err(RelayError::Handshake("missing Upgrade: websocket".into()));
    }
    if !head.header_has_token("Connection", "upgrade") {
        return Err(RelayError::Handshake("missing Connection: upgrade".into()));
    }
    match head.header("Sec-WebSocket-Version") {
        Some("13") => {}
        other => {
            return Err(RelayError::Handshake(format!(
                "unsupported Sec-WebSocket-Version {}",
                other.unwrap_or("(none)")
            )))
        }
    }
    let client_key = head
        .header("Sec-WebSocket-Key")
        .filter(|k| is_valid_client_key(k))
        .ok_or_else(|| RelayError::Handshake("missing or invalid Sec-WebSocket-Key".into()))?
        .to_string();

    let path_room = match path_room {
        Some(segment) => percent_decode_str(segment)
            .decode_utf8()
            .map_err(|_| RelayError::Handshake("room id in path is not valid UTF-8".into()))?
            .into_owned(),
        None => String::new(),
    };
    let room_id = query_param(url, &["room_id", "appointmentId"])
        .or_else(|| Some(path_room).filter(|r| !r.is_empty()))
        .ok_or_else(|| RelayError::Handshake("missing room_id".into()))?;
    let participant_id = query_param(url, &["participant_id", "userId"])
        .ok_or_else(|| RelayError::Handshake("missing participant_id".into()))?;

    Ok(UpgradeRequest {
        channel,
        room_id,
        participant_id,
        client_key,
    })
}

/// First non-empty value among `names`, in order of preference.
fn query_param(url: &Url, names: &[&str]) -> Option<String> {
    names.iter().find_map(|name| {
        url.query_pairs()
            .find(|(k, v)| k == *name && !v.is_empty())
            .map(|(_, v)| v.into_owned())
    })
}

/// The `101 Switching Protocols` response completing the handshake.
pub fn switching_protocols(client_key: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        accept_key(client_key)
    )
}

/// A complete non-upgrade response. The connection is closed after it.
pub fn http_response(status: u16, content_type: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {status} {}\r\n\
         Content-Type: {content_type}\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\r\n{body}",
        reason_phrase(status),
        body.len()
    )
}

/// JSON error response body `{"error": message}`.
pub fn error_response(status: u16, message: &str) -> String {
    let body = serde_json::json!({ "error": message }).to_string();
    http_response(status, "application/json", &body)
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        429 => "Too Many Requests",
        503 => "Service Unavailable",
        _ => "Internal Server Error",
    }
}
