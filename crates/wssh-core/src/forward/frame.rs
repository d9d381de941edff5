//! Tunnel stream framing.
//!
//! Two frame families share the tunnel stream: length-prefixed binary TCP
//! frames and JSON control frames. A frame is binary iff it is at least
//! four bytes and is not recognised as JSON; JSON recognition is exactly
//! "first non-whitespace byte is `{`" — no other heuristic.

use std::collections::HashMap;

use serde::Deserialize;

/// Upper bound on a connection id inside a binary frame.
const MAX_CONN_ID: usize = 256;

/// A JSON control frame. Unknown fields are ignored; missing fields
/// default to empty.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ControlMsg {
    #[serde(rename = "type", default)]
    pub msg_type: String,
    #[serde(default)]
    pub id: String,
    #[serde(rename = "connId", default)]
    pub conn_id: String,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: String,
}

/// The first frame the tunnel sends after the WebSocket opens.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TunnelReady {
    #[serde(rename = "type", default)]
    pub msg_type: String,
    #[serde(rename = "tunnelUrl", default)]
    pub tunnel_url: String,
    #[serde(rename = "rawPort", default)]
    pub raw_port: u16,
}

/// Does this frame start a JSON value (`{` after optional whitespace)?
pub fn is_json(data: &[u8]) -> bool {
    for &b in data {
        match b {
            b' ' | b'\t' | b'\n' | b'\r' => continue,
            b'{' => return true,
            _ => return false,
        }
    }
    false
}

/// Parse a binary TCP frame: `[4B conn-id len BE][conn-id][payload]`.
///
/// Returns `None` unless the buffer holds the 4-byte header, the declared
/// length is within `1..=256`, and the whole id fits the buffer.
pub fn parse_binary_frame(data: &[u8]) -> Option<(String, &[u8])> {
    if data.len() < 4 {
        return None;
    }
    let id_len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
    if id_len == 0 || id_len > MAX_CONN_ID || 4 + id_len > data.len() {
        return None;
    }
    let conn_id = String::from_utf8_lossy(&data[4..4 + id_len]).into_owned();
    Some((conn_id, &data[4 + id_len..]))
}

/// Build a binary TCP frame for `conn_id` carrying `payload`.
pub fn build_binary_frame(conn_id: &str, payload: &[u8]) -> Vec<u8> {
    let id = conn_id.as_bytes();
    let mut frame = Vec::with_capacity(4 + id.len() + payload.len());
    frame.extend_from_slice(&(id.len() as u32).to_be_bytes());
    frame.extend_from_slice(id);
    frame.extend_from_slice(payload);
    frame
}

/// Index of the first `\r\n\r\n` header terminator, if any.
pub fn find_header_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Header-injection guard: does the string contain a CR or LF?
pub fn contains_crlf(s: &str) -> bool {
    s.bytes().any(|b| b == b'\r' || b == b'\n')
}

/// Content types whose bodies travel as plain JSON strings; everything
/// else is base64-encoded.
pub fn is_text_content_type(content_type: &str) -> bool {
    let ct = content_type.to_ascii_lowercase();
    ct.starts_with("text/")
        || ct.contains("json")
        || ct.contains("xml")
        || ct.contains("javascript")
        || ct.contains("html")
}
