//! HTTP/1.1 upgrade handshake (client role).
//!
//! Builds the upgrade request with a random 16-byte `Sec-WebSocket-Key`,
//! parses the response with `httparse`, and checks that the server's
//! `Sec-WebSocket-Accept` equals `base64(sha1(key + GUID))`.

use base64::Engine;
use bytes::{BufMut, Bytes, BytesMut};
use http::Uri;
use sha1::{Digest, Sha1};

use crate::error::{Error, Result};
use crate::mask::random_bytes;
use crate::WS_GUID;

/// Cap on the serialized upgrade exchange.
const MAX_HEADER_SIZE: usize = 8192;

/// An extra header to send with the upgrade request.
///
/// Built with [`extra_header`]. Every value within one entry is sent on
/// its own header line; a later entry with the same name (compared
/// case-insensitively) replaces an earlier one.
#[derive(Debug, Clone)]
pub struct ExtraHeader {
    pub(crate) name: String,
    pub(crate) values: Vec<String>,
}

/// Create an [`ExtraHeader`], optionally canonicalizing the name into
/// `Title-Case-Per-Segment` form.
pub fn extra_header(canonicalize: bool, name: &str, values: &[&str]) -> ExtraHeader {
    let name = if canonicalize {
        canonical_header_name(name)
    } else {
        name.to_string()
    };
    ExtraHeader {
        name,
        values: values.iter().map(|v| v.to_string()).collect(),
    }
}

/// Canonical MIME header form: first letter and every letter after a dash
/// upper-cased, the rest lowered (`sec-websocket-key` → `Sec-Websocket-Key`).
fn canonical_header_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = true;
    for ch in name.chars() {
        if upper {
            out.extend(ch.to_uppercase());
        } else {
            out.extend(ch.to_lowercase());
        }
        upper = ch == '-';
    }
    out
}

/// Generate a random 16-byte key, base64-encoded.
pub(crate) fn generate_key() -> String {
    let mut nonce = [0u8; 16];
    random_bytes(&mut nonce);
    base64::engine::general_purpose::STANDARD.encode(nonce)
}

/// Compute the expected `Sec-WebSocket-Accept` value for a key:
/// `base64(sha1(key + GUID))`.
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// Validate the server's accept value against the key we sent.
pub fn validate_accept(sent_key: &str, received_accept: &str) -> bool {
    accept_key(sent_key) == received_accept
}

/// Split a `ws://` / `wss://` URL into (host header, port, is_tls).
pub(crate) fn resolve_target(uri: &Uri) -> Result<(String, u16, bool)> {
    let tls = match uri.scheme_str() {
        Some("ws") => false,
        Some("wss") => true,
        _ => return Err(Error::InvalidAddress),
    };
    let host = uri.host().ok_or(Error::InvalidAddress)?.to_string();
    let port = uri.port_u16().unwrap_or(if tls { 443 } else { 80 });
    Ok((host, port, tls))
}

/// The upgrade request as sent, for inspection callbacks.
#[derive(Debug)]
pub struct UpgradeRequest {
    target: String,
    headers: Vec<(String, String)>,
}

impl UpgradeRequest {
    /// The request target (path and query).
    pub fn target(&self) -> &str {
        &self.target
    }

    /// First value of a header, matched case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Every value sent for a header, in order.
    pub fn header_values(&self, name: &str) -> Vec<&str> {
        self.headers
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// All header lines in send order.
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }
}

/// The upgrade response as received, for inspection callbacks.
#[derive(Debug)]
pub struct UpgradeResponse {
    status: u16,
    headers: Vec<(String, String)>,
}

impl UpgradeResponse {
    /// HTTP status code.
    pub fn status(&self) -> u16 {
        self.status
    }

    /// First value of a header, matched case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All received header lines.
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }
}

/// Serialize the upgrade request and the header list it carries.
pub(crate) fn build_request(
    uri: &Uri,
    host_header: &str,
    key: &str,
    extra: &[ExtraHeader],
) -> (Bytes, UpgradeRequest) {
    let target = match uri.path_and_query() {
        Some(pq) if !pq.as_str().is_empty() => pq.as_str().to_string(),
        _ => "/".to_string(),
    };

    let mut headers: Vec<(String, String)> = vec![
        ("Host".to_string(), host_header.to_string()),
        ("Upgrade".to_string(), "websocket".to_string()),
        ("Connection".to_string(), "Upgrade".to_string()),
        ("Sec-WebSocket-Key".to_string(), key.to_string()),
        ("Sec-WebSocket-Version".to_string(), "13".to_string()),
    ];
    // Repeated names across entries: the last entry replaces the earlier
    // one. Every value within one entry goes out on its own line.
    let mut merged: Vec<&ExtraHeader> = Vec::with_capacity(extra.len());
    for header in extra {
        match merged
            .iter_mut()
            .find(|h| h.name.eq_ignore_ascii_case(&header.name))
        {
            Some(entry) => *entry = header,
            None => merged.push(header),
        }
    }
    for header in merged {
        for value in &header.values {
            headers.push((header.name.clone(), value.clone()));
        }
    }

    let mut buf = BytesMut::with_capacity(256);
    buf.put_slice(b"GET ");
    buf.put_slice(target.as_bytes());
    buf.put_slice(b" HTTP/1.1\r\n");
    for (name, value) in &headers {
        buf.put_slice(name.as_bytes());
        buf.put_slice(b": ");
        buf.put_slice(value.as_bytes());
        buf.put_slice(b"\r\n");
    }
    buf.put_slice(b"\r\n");

    (buf.freeze(), UpgradeRequest { target, headers })
}

/// Parse an upgrade response.
///
/// Returns the parsed response and the number of bytes it consumed, or
/// `None` when more bytes are needed.
pub(crate) fn parse_response(buf: &[u8]) -> Result<Option<(UpgradeResponse, usize)>> {
    if buf.len() > MAX_HEADER_SIZE {
        return Err(Error::InvalidHttp("response too large"));
    }

    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut response = httparse::Response::new(&mut headers);

    match response.parse(buf) {
        Ok(httparse::Status::Complete(len)) => {
            let status = response.code.unwrap_or(0);
            let mut parsed = Vec::with_capacity(response.headers.len());
            for header in response.headers.iter() {
                let value = std::str::from_utf8(header.value)
                    .map_err(|_| Error::InvalidHttp("invalid header value"))?;
                parsed.push((header.name.to_string(), value.to_string()));
            }
            Ok(Some((
                UpgradeResponse {
                    status,
                    headers: parsed,
                },
                len,
            )))
        }
        Ok(httparse::Status::Partial) => Ok(None),
        Err(_) => Err(Error::InvalidHttp("failed to parse HTTP response")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accept_key_rfc_vector() {
        // Test vector from RFC 6455.
        let key = "dGhlIHNhbXBsZSBub25jZQ==";
        assert_eq!(accept_key(key), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn test_validate_accept() {
        let key = "dGhlIHNhbXBsZSBub25jZQ==";
        assert!(validate_accept(key, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));
        assert!(!validate_accept(key, "bogus"));
    }

    #[test]
    fn test_generate_key_is_16_bytes() {
        let key = generate_key();
        let raw = base64::engine::general_purpose::STANDARD
            .decode(&key)
            .unwrap();
        assert_eq!(raw.len(), 16);
        assert_ne!(generate_key(), key);
    }

    #[test]
    fn test_canonical_header_name() {
        assert_eq!(canonical_header_name("sec-websocket-key"), "Sec-Websocket-Key");
        assert_eq!(canonical_header_name("HOST"), "Host");
        assert_eq!(canonical_header_name("x-CUSTOM-header"), "X-Custom-Header");
    }

    #[test]
    fn test_resolve_target() {
        let uri: Uri = "ws://example.com/chat".parse().unwrap();
        assert_eq!(
            resolve_target(&uri).unwrap(),
            ("example.com".to_string(), 80, false)
        );

        let uri: Uri = "wss://example.com:9443/".parse().unwrap();
        assert_eq!(
            resolve_target(&uri).unwrap(),
            ("example.com".to_string(), 9443, true)
        );

        let uri: Uri = "http://example.com/".parse().unwrap();
        assert!(matches!(resolve_target(&uri), Err(Error::InvalidAddress)));

        let uri: Uri = "localhost:8081".parse().unwrap();
        assert!(matches!(resolve_target(&uri), Err(Error::InvalidAddress)));
    }

    #[test]
    fn test_build_request_headers() {
        let uri: Uri = "ws://localhost:8080/chat?x=1".parse().unwrap();
        let extra = [
            extra_header(true, "k2", &["v21", "v22"]),
            extra_header(false, "k4", &["v4"]),
        ];
        let (wire, request) = build_request(&uri, "localhost:8080", "KEY", &extra);

        let text = std::str::from_utf8(&wire).unwrap();
        assert!(text.starts_with("GET /chat?x=1 HTTP/1.1\r\n"));
        assert!(text.contains("Host: localhost:8080\r\n"));
        assert!(text.contains("Upgrade: websocket\r\n"));
        assert!(text.contains("Connection: Upgrade\r\n"));
        assert!(text.contains("Sec-WebSocket-Key: KEY\r\n"));
        assert!(text.contains("Sec-WebSocket-Version: 13\r\n"));
        assert!(text.contains("K2: v21\r\n"));
        assert!(text.contains("K2: v22\r\n"));
        assert!(text.contains("k4: v4\r\n"));
        assert!(text.ends_with("\r\n\r\n"));

        assert_eq!(request.header("upgrade"), Some("websocket"));
        assert_eq!(request.header_values("K2"), vec!["v21", "v22"]);
        assert_eq!(request.target(), "/chat?x=1");
    }

    #[test]
    fn test_build_request_repeated_name_last_entry_wins() {
        let uri: Uri = "ws://localhost:8080/".parse().unwrap();
        let extra = [
            extra_header(true, "k2", &["v21", "v22"]),
            extra_header(true, "k3", &["v31"]),
            extra_header(true, "k3", &["v32"]),
            extra_header(false, "k6", &["v61"]),
            extra_header(false, "k6", &["v62"]),
        ];
        let (wire, request) = build_request(&uri, "localhost:8080", "KEY", &extra);

        let text = std::str::from_utf8(&wire).unwrap();
        // Values from one entry all survive.
        assert!(text.contains("K2: v21\r\n"));
        assert!(text.contains("K2: v22\r\n"));
        // A repeated name only sends the last entry's values.
        assert!(!text.contains("v31"));
        assert!(text.contains("K3: v32\r\n"));
        assert!(!text.contains("v61"));
        assert!(text.contains("k6: v62\r\n"));

        assert_eq!(request.header_values("k2"), vec!["v21", "v22"]);
        assert_eq!(request.header_values("k3"), vec!["v32"]);
        assert_eq!(request.header_values("k6"), vec!["v62"]);
    }

    #[test]
    fn test_parse_response_roundtrip() {
        let raw = b"HTTP/1.1 101 Switching Protocols\r\n\
            Upgrade: websocket\r\n\
            Connection: Upgrade\r\n\
            Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n\
            \r\nleftover";

        let (response, consumed) = parse_response(raw).unwrap().unwrap();
        assert_eq!(response.status(), 101);
        assert_eq!(
            response.header("sec-websocket-accept"),
            Some("s3pPLMBiTxaQ9kYGzzhZRbK+xOo=")
        );
        assert_eq!(&raw[consumed..], b"leftover");
    }

    #[test]
    fn test_parse_response_partial() {
        let raw = b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: web";
        assert!(parse_response(raw).unwrap().is_none());
    }
}
