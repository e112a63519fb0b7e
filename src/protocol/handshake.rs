//! HTTP/1.1 upgrade negotiation.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use sha1::{Digest, Sha1};

use crate::error::HandshakeError;

/// GUID appended to the client key before hashing (RFC 6455 §1.3).
pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Derive the `Sec-WebSocket-Accept` value for a client key.
pub fn accept_token(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

/// A successfully negotiated upgrade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub key: String,
    pub accept: String,
    pub subprotocol: Option<String>,
    /// Bytes of the request, including the blank line.
    pub consumed: usize,
}

impl Handshake {
    pub fn response(&self) -> Vec<u8> {
        let mut response = format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Accept: {}\r\n",
            self.accept
        );
        if let Some(protocol) = &self.subprotocol {
            response.push_str(&format!("Sec-WebSocket-Protocol: {}\r\n", protocol));
        }
        response.push_str("\r\n");
        response.into_bytes()
    }
}

#[derive(Debug, Clone)]
pub struct HandshakeNegotiator {
    max_request_len: usize,
    subprotocol: String,
}

impl HandshakeNegotiator {
    pub fn new(max_request_len: usize, subprotocol: impl Into<String>) -> Self {
        Self {
            max_request_len,
            subprotocol: subprotocol.into(),
        }
    }

    /// Try to negotiate an upgrade from the bytes received so far.
    ///
    /// `Ok(None)` means the request has not been fully received yet. An
    /// error is only returned once the request is complete (or has grown
    /// past the size limit) and still cannot be upgraded.
    pub fn negotiate(&self, buf: &[u8]) -> Result<Option<Handshake>, HandshakeError> {
        let end = match find_subslice(buf, HEADER_TERMINATOR) {
            Some(pos) => pos + HEADER_TERMINATOR.len(),
            None if buf.len() > self.max_request_len => {
                return Err(HandshakeError::RequestTooLarge {
                    limit: self.max_request_len,
                })
            }
            None => return Ok(None),
        };
        if end > self.max_request_len {
            return Err(HandshakeError::RequestTooLarge {
                limit: self.max_request_len,
            });
        }

        let head = std::str::from_utf8(&buf[..end])
            .map_err(|_| HandshakeError::Malformed("request is not valid UTF-8".to_string()))?;
        let mut lines = head.split("\r\n");

        let request_line = lines.next().unwrap_or_default();
        let mut parts = request_line.split_whitespace();
        match (parts.next(), parts.next(), parts.next()) {
            (Some("GET"), Some(_target), Some(version)) if version.starts_with("HTTP/1.") => {}
            _ => {
                return Err(HandshakeError::Malformed(format!(
                    "unexpected request line: {:?}",
                    request_line
                )))
            }
        }

        let mut upgrade = false;
        let mut key = None;
        let mut offered_protocols = Vec::new();

        for line in lines.take_while(|line| !line.is_empty()) {
            let Some((name, value)) = line.split_once(':') else {
                return Err(HandshakeError::Malformed(format!(
                    "header without colon: {:?}",
                    line
                )));
            };
            let name = name.trim();
            let value = value.trim();

            if name.eq_ignore_ascii_case("upgrade") {
                upgrade |= has_token(value, "websocket");
            } else if name.eq_ignore_ascii_case("sec-websocket-key") {
                if !value.is_empty() {
                    key = Some(value.to_string());
                }
            } else if name.eq_ignore_ascii_case("sec-websocket-protocol") {
                offered_protocols.extend(value.split(',').map(|p| p.trim().to_string()));
            }
        }

        if !upgrade {
            return Err(HandshakeError::NotUpgrade);
        }
        let key = key.ok_or(HandshakeError::MissingKey)?;

        let subprotocol = offered_protocols
            .into_iter()
            .find(|p| p.eq_ignore_ascii_case(&self.subprotocol))
            .map(|_| self.subprotocol.clone());

        Ok(Some(Handshake {
            accept: accept_token(&key),
            key,
            subprotocol,
            consumed: end,
        }))
    }
}

fn has_token(value: &str, token: &str) -> bool {
    value
        .split(',')
        .any(|part| part.trim().eq_ignore_ascii_case(token))
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
