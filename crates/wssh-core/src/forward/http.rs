//! HTTP request assembly and response parsing for proxied tunnel requests.
//!
//! Requests arrive pre-parsed as JSON control frames and are replayed as
//! HTTP/1.1 over an SSH direct-tcpip channel; responses are parsed just far
//! enough to build the JSON envelope the tunnel expects. Header names and
//! values from the relay are untrusted: hop-by-hop headers are stripped and
//! anything carrying a CR or LF is dropped wholesale.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use super::frame::{contains_crlf, find_header_end, is_text_content_type};
use crate::error::{Error, Result};

/// Headers that must not be forwarded through the proxy (compared
/// case-insensitively).
const HOP_BY_HOP: &[&str] = &[
    "host",
    "connection",
    "upgrade",
    "keep-alive",
    "transfer-encoding",
    "te",
    "trailer",
    "proxy-authorization",
    "proxy-connection",
];

/// Assemble the HTTP/1.1 request to replay at the remote service.
pub fn build_http_request(
    method: &str,
    path: &str,
    remote_host: &str,
    remote_port: u16,
    headers: &HashMap<String, String>,
    body: &str,
) -> Result<String> {
    if method.is_empty()
        || method.len() > 16
        || !method.bytes().all(|b| b.is_ascii_uppercase())
    {
        return Err(Error::Validation {
            message: format!("invalid HTTP method {method:?}"),
        });
    }
    if path.is_empty() || path.bytes().any(|b| b < 0x20 || b == 0x7f) {
        return Err(Error::Validation {
            message: "invalid HTTP path".into(),
        });
    }

    let mut req = format!("{method} {path} HTTP/1.1\r\nHost: {remote_host}:{remote_port}\r\n");
    for (name, value) in headers {
        if HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h)) {
            continue;
        }
        if contains_crlf(name) || contains_crlf(value) {
            continue;
        }
        req.push_str(name);
        req.push_str(": ");
        req.push_str(value);
        req.push_str("\r\n");
    }
    if !body.is_empty() {
        req.push_str(&format!("Content-Length: {}\r\n", body.len()));
    }
    req.push_str("Connection: close\r\n\r\n");
    if !body.is_empty() {
        req.push_str(body);
    }
    Ok(req)
}

/// A parsed proxied response.
#[derive(Debug, Clone)]
pub struct HttpResponseParts {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

/// Parse status line, headers, and body out of a raw response.
///
/// Deliberately simple: find the first `\r\n\r\n`, take three status digits
/// after the first space of the first line, split remaining header lines on
/// `": "`. Anything that does not parse leaves the defaults (status 200,
/// whole input as body).
pub fn parse_http_response(raw: &[u8]) -> HttpResponseParts {
    let mut parts = HttpResponseParts {
        status: 200,
        headers: HashMap::new(),
        body: raw.to_vec(),
    };

    let Some(header_end) = find_header_end(raw).filter(|&i| i > 0) else {
        return parts;
    };

    let head = String::from_utf8_lossy(&raw[..header_end]);
    parts.body = raw[header_end + 4..].to_vec();

    let mut lines = head.split("\r\n");
    if let Some(status_line) = lines.next() {
        if let Some(space) = status_line.find(' ') {
            if let Some(digits) = status_line.get(space + 1..space + 4) {
                if let Ok(status) = digits.parse::<u16>() {
                    parts.status = status;
                }
            }
        }
    }

    for line in lines {
        if let Some(colon) = line.find(':') {
            if colon == 0 {
                continue;
            }
            let name = line[..colon].to_string();
            let value = line
                .get(colon + 2..)
                .map(|v| v.to_string())
                .unwrap_or_default();
            parts.headers.insert(name, value);
        }
    }

    parts
}

/// The JSON envelope sent back through the tunnel for one proxied request.
pub fn response_envelope(
    req_id: &str,
    status: u16,
    headers: &HashMap<String, String>,
    body: &str,
    body_encoding: Option<&str>,
) -> serde_json::Value {
    let mut envelope = serde_json::json!({
        "type": "http_response",
        "id": req_id,
        "status": status,
        "headers": headers,
        "body": body,
    });
    if let Some(encoding) = body_encoding {
        envelope["bodyEncoding"] = serde_json::json!(encoding);
    }
    envelope
}

/// Prepare the response body for the JSON envelope: plain string for text
/// content types, base64 with a `bodyEncoding` marker otherwise.
pub fn encode_body(headers: &HashMap<String, String>, body: Vec<u8>) -> (String, Option<&'static str>) {
    let content_type = headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("content-type"))
        .map(|(_, v)| v.as_str())
        .unwrap_or("");

    if !content_type.is_empty() && !is_text_content_type(content_type) {
        (BASE64.encode(&body), Some("base64"))
    } else {
        (String::from_utf8_lossy(&body).into_owned(), None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn request_line_and_host() {
        let req =
            build_http_request("GET", "/", "svc.internal", 8080, &HashMap::new(), "").unwrap();
        assert!(req.starts_with("GET / HTTP/1.1\r\nHost: svc.internal:8080\r\n"));
        assert!(req.ends_with("Connection: close\r\n\r\n"));
    }

    #[test]
    fn hop_by_hop_headers_dropped_case_insensitively() {
        let req = build_http_request(
            "GET",
            "/",
            "svc",
            80,
            &headers(&[
                ("host", "evil.example"),
                ("Connection", "keep-alive"),
                ("Transfer-Encoding", "chunked"),
                ("X-Keep", "yes"),
            ]),
            "",
        )
        .unwrap();
        assert!(!req.contains("evil.example"));
        assert!(!req.contains("keep-alive"));
        assert!(!req.contains("chunked"));
        assert!(req.contains("X-Keep: yes\r\n"));
        // Exactly one Host header: ours.
        assert_eq!(req.matches("Host:").count(), 1);
    }

    #[test]
    fn injecting_headers_are_dropped() {
        let req = build_http_request(
            "GET",
            "/",
            "svc",
            80,
            &headers(&[("X-Evil", "foo\r\nInjected: yes"), ("Ok", "fine")]),
            "",
        )
        .unwrap();
        assert!(!req.contains("Injected"));
        assert!(req.contains("Ok: fine\r\n"));
    }

    #[test]
    fn body_adds_content_length() {
        let req =
            build_http_request("POST", "/submit", "svc", 80, &HashMap::new(), "abc").unwrap();
        assert!(req.contains("Content-Length: 3\r\n"));
        assert!(req.ends_with("Connection: close\r\n\r\nabc"));
    }

    #[test]
    fn invalid_method_rejected() {
        assert!(build_http_request("get", "/", "svc", 80, &HashMap::new(), "").is_err());
        assert!(build_http_request("", "/", "svc", 80, &HashMap::new(), "").is_err());
        assert!(build_http_request("G\r\nET", "/", "svc", 80, &HashMap::new(), "").is_err());
    }

    #[test]
    fn invalid_path_rejected() {
        assert!(build_http_request("GET", "", "svc", 80, &HashMap::new(), "").is_err());
        assert!(build_http_request("GET", "/\r\n", "svc", 80, &HashMap::new(), "").is_err());
        assert!(build_http_request("GET", "/a\x01b", "svc", 80, &HashMap::new(), "").is_err());
    }

    #[test]
    fn parse_no_content_response() {
        let parts =
            parse_http_response(b"HTTP/1.1 204 No Content\r\nContent-Length: 0\r\n\r\n");
        assert_eq!(parts.status, 204);
        assert_eq!(parts.headers.get("Content-Length").unwrap(), "0");
        assert!(parts.body.is_empty());
    }

    #[test]
    fn parse_response_with_body() {
        let parts = parse_http_response(
            b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nX-Extra: v\r\n\r\nhello",
        );
        assert_eq!(parts.status, 200);
        assert_eq!(parts.headers.get("Content-Type").unwrap(), "text/plain");
        assert_eq!(parts.headers.get("X-Extra").unwrap(), "v");
        assert_eq!(parts.body, b"hello");
    }

    #[test]
    fn parse_headerless_blob_defaults() {
        let parts = parse_http_response(b"just bytes, no http here");
        assert_eq!(parts.status, 200);
        assert!(parts.headers.is_empty());
        assert_eq!(parts.body, b"just bytes, no http here");
    }

    #[test]
    fn parse_garbled_status_keeps_default() {
        let parts = parse_http_response(b"HTTP/1.1 xx OK\r\nA: b\r\n\r\n");
        assert_eq!(parts.status, 200);
    }

    #[test]
    fn text_body_stays_plain() {
        let (body, encoding) = encode_body(
            &headers(&[("Content-Type", "text/html")]),
            b"<html></html>".to_vec(),
        );
        assert_eq!(body, "<html></html>");
        assert!(encoding.is_none());
    }

    #[test]
    fn binary_body_is_base64() {
        let (body, encoding) = encode_body(
            &headers(&[("content-type", "image/png")]),
            vec![0x89, 0x50, 0x4e, 0x47],
        );
        assert_eq!(encoding, Some("base64"));
        assert_eq!(BASE64.decode(body).unwrap(), vec![0x89, 0x50, 0x4e, 0x47]);
    }

    #[test]
    fn missing_content_type_stays_plain() {
        let (body, encoding) = encode_body(&HashMap::new(), b"anything".to_vec());
        assert_eq!(body, "anything");
        assert!(encoding.is_none());
    }

    #[test]
    fn envelope_shape_for_no_content_roundtrip() {
        // The full proxied exchange for a 204: parse the upstream response,
        // encode, envelope.
        let parts =
            parse_http_response(b"HTTP/1.1 204 No Content\r\nContent-Length: 0\r\n\r\n");
        let (body, encoding) = encode_body(&parts.headers, parts.body);
        let envelope = response_envelope("r1", parts.status, &parts.headers, &body, encoding);

        assert_eq!(envelope["type"], "http_response");
        assert_eq!(envelope["id"], "r1");
        assert_eq!(envelope["status"], 204);
        assert_eq!(envelope["headers"]["Content-Length"], "0");
        assert_eq!(envelope["body"], "");
        assert!(envelope.get("bodyEncoding").is_none());
    }

    #[test]
    fn envelope_marks_base64_bodies() {
        let envelope =
            response_envelope("r2", 200, &HashMap::new(), "AAEC", Some("base64"));
        assert_eq!(envelope["bodyEncoding"], "base64");
    }
}
