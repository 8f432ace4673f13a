//! WebSocket handshake detection.
//!
//! Upgrades are served by hyper like any other request; this only tells
//! logging and metrics which requests are handshakes (the `ws` label).

use http::header::{CONNECTION, UPGRADE};
use http::HeaderMap;

/// True if the headers describe a WebSocket upgrade request.
pub fn is_ws_handshake(headers: &HeaderMap) -> bool {
    let upgrade = headers
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
    let connection = headers.get_all(CONNECTION).iter().any(|v| {
        v.to_str()
            .map(|v| v.split(',').any(|token| token.trim().eq_ignore_ascii_case("upgrade")))
            .unwrap_or(false)
    });
    upgrade && connection
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn detects_upgrade_handshakes() {
        let mut headers = HeaderMap::new();
        assert!(!is_ws_handshake(&headers));

        headers.insert(UPGRADE, HeaderValue::from_static("WebSocket"));
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive, Upgrade"));
        assert!(is_ws_handshake(&headers));

        headers.insert(CONNECTION, HeaderValue::from_static("close"));
        assert!(!is_ws_handshake(&headers));
    }
}
