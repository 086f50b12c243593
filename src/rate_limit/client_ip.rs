//! Best-effort client address for anonymous rate-limit keys.
//!
//! Proxy headers are client controlled; this is a bucketing heuristic, not an
//! identity check.

use axum::http::HeaderMap;
use std::net::SocketAddr;

const ADDRESS_HEADERS: [&str; 4] = [
    "x-forwarded-for",
    "x-real-ip",
    "proxy-client-ip",
    "wl-proxy-client-ip",
];

pub const UNKNOWN_ADDRESS: &str = "unknown";

/// First usable value from the proxy header chain, then the peer address.
#[must_use]
pub fn client_address(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    ADDRESS_HEADERS
        .iter()
        .find_map(|name| {
            headers
                .get(*name)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.split(',').next())
                .map(str::trim)
                .filter(|value| !value.is_empty() && !value.eq_ignore_ascii_case(UNKNOWN_ADDRESS))
                .map(str::to_string)
        })
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
        .unwrap_or_else(|| UNKNOWN_ADDRESS.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn peer() -> Option<SocketAddr> {
        "192.168.1.9:51000".parse().ok()
    }

    #[test]
    fn forwarded_for_takes_left_most_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static(" 203.0.113.7 , 10.0.0.2"),
        );
        headers.insert("x-real-ip", HeaderValue::from_static("198.51.100.1"));
        assert_eq!(client_address(&headers, peer()), "203.0.113.7");
    }

    #[test]
    fn skips_unknown_and_empty_values() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("unknown"));
        headers.insert("x-real-ip", HeaderValue::from_static(""));
        headers.insert("proxy-client-ip", HeaderValue::from_static("10.1.1.1"));
        assert_eq!(client_address(&headers, peer()), "10.1.1.1");

        let mut headers = HeaderMap::new();
        headers.insert("wl-proxy-client-ip", HeaderValue::from_static("10.2.2.2"));
        assert_eq!(client_address(&headers, peer()), "10.2.2.2");
    }

    #[test]
    fn falls_back_to_peer_then_unknown() {
        assert_eq!(client_address(&HeaderMap::new(), peer()), "192.168.1.9");
        assert_eq!(client_address(&HeaderMap::new(), None), UNKNOWN_ADDRESS);
    }
}
