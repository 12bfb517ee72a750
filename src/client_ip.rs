//! Client IP resolution for the edge filter
//!
//! First present wins: the trusted proxy header, then the first hop of the
//! forwarded-for chain, then the socket peer address.

use hyper::HeaderMap;
use serde::Serialize;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct ClientIpConfig {
    /// Header set by a trusted upstream proxy carrying the client address
    pub proxy_header: String,
    /// Forwarded-for chain header ("client, proxy1, proxy2")
    pub forwarded_for_header: String,
}

impl Default for ClientIpConfig {
    fn default() -> Self {
        Self {
            proxy_header: "X-Real-IP".to_string(),
            forwarded_for_header: "X-Forwarded-For".to_string(),
        }
    }
}

/// Where the client address came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum IpSource {
    ProxyHeader,
    ForwardedFor,
    Socket,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIp {
    pub ip: String,
    pub source: IpSource,
}

pub fn resolve_client_ip(headers: &HeaderMap, peer: SocketAddr, config: &ClientIpConfig) -> ClientIp {
    if let Some(ip) = header_str(headers, &config.proxy_header)
        .map(str::trim)
        .filter(|ip| is_valid_ip(ip))
    {
        return ClientIp {
            ip: ip.to_string(),
            source: IpSource::ProxyHeader,
        };
    }

    if let Some(ip) = header_str(headers, &config.forwarded_for_header)
        .and_then(extract_leftmost_ip)
        .filter(|ip| is_valid_ip(ip))
    {
        return ClientIp {
            ip,
            source: IpSource::ForwardedFor,
        };
    }

    debug!("No usable client IP header, using peer address {}", peer.ip());
    ClientIp {
        ip: peer.ip().to_string(),
        source: IpSource::Socket,
    }
}

/// First header value as text; `None` if absent or not visible ASCII
fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// "203.0.113.1, 198.51.100.2" -> "203.0.113.1"
fn extract_leftmost_ip(header_value: &str) -> Option<String> {
    header_value
        .split(',')
        .next()
        .map(|s| s.trim().to_string())
}

/// Strict check: no control characters or inner whitespace, must parse.
/// Proxies that could not determine the client write "unknown", which
/// fails here too.
fn is_valid_ip(ip: &str) -> bool {
    if ip.is_empty() || ip.chars().any(|c| c.is_control() || c.is_whitespace()) {
        return false;
    }
    IpAddr::from_str(ip).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::HeaderValue;

    fn peer() -> SocketAddr {
        "192.168.1.100:52000".parse().unwrap()
    }

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(*name, HeaderValue::from_str(value).unwrap());
        }
        map
    }

    #[test]
    fn test_proxy_header_wins() {
        let h = headers(&[
            ("X-Forwarded-For", "203.0.113.1, 198.51.100.2"),
            ("X-Real-IP", "203.0.113.5"),
        ]);
        let ip = resolve_client_ip(&h, peer(), &ClientIpConfig::default());
        assert_eq!(ip.ip, "203.0.113.5");
        assert_eq!(ip.source, IpSource::ProxyHeader);
    }

    #[test]
    fn test_forwarded_for_first_hop() {
        let h = headers(&[("X-Forwarded-For", "  203.0.113.1  , 10.0.0.1  ")]);
        let ip = resolve_client_ip(&h, peer(), &ClientIpConfig::default());
        assert_eq!(ip.ip, "203.0.113.1");
        assert_eq!(ip.source, IpSource::ForwardedFor);
    }

    #[test]
    fn test_socket_fallback() {
        let ip = resolve_client_ip(&HeaderMap::new(), peer(), &ClientIpConfig::default());
        assert_eq!(ip.ip, "192.168.1.100");
        assert_eq!(ip.source, IpSource::Socket);
    }

    #[test]
    fn test_unknown_and_malformed_values_are_skipped() {
        let h = headers(&[("X-Real-IP", "unknown"), ("X-Forwarded-For", "2001:db8::1")]);
        let ip = resolve_client_ip(&h, peer(), &ClientIpConfig::default());
        assert_eq!(ip.ip, "2001:db8::1");

        for bad in ["256.1.1.1", "192.168.1", "192.168.1.1:80", "not-an-ip", "", "192 .168.1.1"] {
            let h = headers(&[("X-Forwarded-For", bad)]);
            let ip = resolve_client_ip(&h, peer(), &ClientIpConfig::default());
            assert_eq!(ip.source, IpSource::Socket, "accepted malformed IP {:?}", bad);
        }
    }

    #[test]
    fn test_custom_header_names() {
        let config = ClientIpConfig {
            proxy_header: "CF-Connecting-IP".to_string(),
            ..Default::default()
        };
        let h = headers(&[("cf-connecting-ip", "198.51.100.77"), ("X-Real-IP", "203.0.113.5")]);
        let ip = resolve_client_ip(&h, peer(), &config);
        assert_eq!(ip.ip, "198.51.100.77");
    }
}
