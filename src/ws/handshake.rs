//! RFC 6455 §1.3 opening handshake: client key generation and the server's
//! `Sec-WebSocket-Accept` derivation.

use base64::Engine;
use rand::RngCore;
use sha1::{Digest, Sha1};

use crate::http::types::HeaderMap;

/// The fixed GUID concatenated onto the client's key before hashing, per RFC 6455.
const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Generates a fresh client handshake key: 16 random bytes, base64-encoded.
pub fn client_key() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// Computes the `Sec-WebSocket-Accept` header value a server must return for a
/// given client `Sec-WebSocket-Key`.
pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// Whether a request's headers constitute a well-formed WebSocket upgrade: an
/// `Upgrade: websocket` header, a `Connection` header mentioning `upgrade`, a
/// `Sec-WebSocket-Key`, and version 13.
pub fn is_upgrade_request(headers: &HeaderMap) -> bool {
    let upgrade_ok = headers
        .get(b"upgrade")
        .map(|v| v.eq_ignore_ascii_case(b"websocket"))
        .unwrap_or(false);
    let connection_ok = headers
        .get(b"connection")
        .map(|v| {
            String::from_utf8_lossy(v)
                .split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
        })
        .unwrap_or(false);
    let has_key = headers.get(b"sec-websocket-key").is_some();
    let version_ok = headers
        .get(b"sec-websocket-version")
        .map(|v| v == b"13")
        .unwrap_or(false);
    upgrade_ok && connection_ok && has_key && version_ok
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_key_matches_rfc6455_example() {
        // RFC 6455 §1.3 worked example.
        assert_eq!(accept_key("dGhlIHNhbXBsZSBub25jZQ=="), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }
}
