//! The browsing context a pairing participant runs in.
//!
//! Storage is scoped per origin (scheme + host + port), exactly like the
//! browser's same-origin rule: a phone writing under `https://10.0.0.5:3356`
//! is invisible to a desktop reading under `http://localhost:3356`. The
//! join-URL logic in [`crate::session`] exists to keep both sides on one origin.

use std::net::{IpAddr, Ipv4Addr, UdpSocket};

use url::Url;

use crate::error::{PairingError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Origin {
    scheme: String,
    host: String,
    port: Option<u16>,
}

impl Origin {
    pub fn new(scheme: &str, host: &str, port: Option<u16>) -> Self {
        Self {
            scheme: scheme.trim_end_matches(':').to_ascii_lowercase(),
            host: host.to_ascii_lowercase(),
            port,
        }
    }

    /// Parses the origin of any absolute http(s) URL. Default ports are dropped.
    pub fn parse(input: &str) -> Result<Self> {
        let url = Url::parse(input).map_err(|e| PairingError::InvalidJoinUrl(e.to_string()))?;
        Self::from_url(&url)
    }

    pub fn from_url(url: &Url) -> Result<Self> {
        match url.scheme() {
            "http" | "https" => {}
            other => {
                return Err(PairingError::InvalidJoinUrl(format!(
                    "unsupported scheme `{}`",
                    other
                )))
            }
        }
        let host = url
            .host_str()
            .ok_or_else(|| PairingError::InvalidJoinUrl("URL has no host".to_string()))?;
        // `Url::port` already reports None for the scheme's default port.
        Ok(Self::new(url.scheme(), host.trim_matches(['[', ']']), url.port()))
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn is_secure(&self) -> bool {
        self.scheme == "https"
    }

    pub fn is_loopback(&self) -> bool {
        is_loopback_host(&self.host)
    }

    /// Explicit port, or `default` when the origin uses the scheme's implicit port.
    pub fn effective_port(&self, default: u16) -> u16 {
        self.port.unwrap_or(default)
    }

    /// Filesystem-safe identifier, used to scope stores per origin.
    /// Example: `https://10.0.0.5:3356` -> `https_10.0.0.5_3356`
    pub fn as_key(&self) -> String {
        let host: String = self
            .host
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
            .collect();
        match self.port {
            Some(port) => format!("{}_{}_{}", self.scheme, host, port),
            None => format!("{}_{}", self.scheme, host),
        }
    }
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        match self.port {
            Some(port) => write!(f, "{}://{}:{}", self.scheme, host, port),
            None => write!(f, "{}://{}", self.scheme, host),
        }
    }
}

pub fn is_loopback_host(host: &str) -> bool {
    matches!(host, "localhost" | "127.0.0.1" | "::1" | "[::1]")
}

/// True for addresses a phone on the same LAN can usually reach:
/// 10/8, 172.16/12, 192.168/16 and link-local 169.254/16.
pub fn is_private_lan_host(host: &str) -> bool {
    match host.parse::<Ipv4Addr>() {
        Ok(ip) => ip.is_private() || ip.is_link_local(),
        Err(_) => false,
    }
}

/// Finds an address the phone can use to reach this machine.
pub trait AddressDiscovery: Send + Sync {
    fn discover(&self, current: &Origin) -> Option<String>;
}

/// Discovery with a fixed answer (or none). Used in tests and when the
/// address is supplied on the command line.
#[derive(Debug, Clone, Default)]
pub struct StaticDiscovery(pub Option<String>);

impl AddressDiscovery for StaticDiscovery {
    fn discover(&self, _current: &Origin) -> Option<String> {
        self.0.clone()
    }
}

/// Asks the OS which local interface routes outward. A UDP `connect` only
/// selects a route, no packet is sent.
#[derive(Debug, Clone)]
pub struct RouteDiscovery {
    probe: String,
}

impl Default for RouteDiscovery {
    fn default() -> Self {
        Self {
            probe: "8.8.8.8:80".to_string(),
        }
    }
}

impl AddressDiscovery for RouteDiscovery {
    fn discover(&self, current: &Origin) -> Option<String> {
        if !current.is_loopback() && is_private_lan_host(current.host()) {
            return Some(current.host().to_string());
        }

        let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
        socket.connect(&self.probe).ok()?;
        match socket.local_addr().ok()?.ip() {
            IpAddr::V4(ip) if ip.is_private() || ip.is_link_local() => Some(ip.to_string()),
            other => {
                tracing::debug!(address = %other, "Route discovery found no LAN address");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_drops_default_port() {
        let origin = Origin::parse("https://verify.example.com:443/mobile?x=1").unwrap();
        assert_eq!(origin.port(), None);
        assert_eq!(origin.to_string(), "https://verify.example.com");
        assert!(origin.is_secure());
    }

    #[test]
    fn test_parse_keeps_explicit_port() {
        let origin = Origin::parse("http://192.168.1.20:3356").unwrap();
        assert_eq!(origin.port(), Some(3356));
        assert_eq!(origin.as_key(), "http_192.168.1.20_3356");
        assert!(!origin.is_secure());
    }

    #[test]
    fn test_parse_rejects_non_http() {
        assert!(Origin::parse("file:///tmp/x").is_err());
        assert!(Origin::parse("not a url").is_err());
    }

    #[test]
    fn test_loopback_detection() {
        assert!(Origin::new("http", "localhost", Some(3356)).is_loopback());
        assert!(Origin::new("http", "127.0.0.1", None).is_loopback());
        assert!(!Origin::new("http", "10.0.0.2", None).is_loopback());
    }

    #[test]
    fn test_private_lan_ranges() {
        assert!(is_private_lan_host("192.168.0.10"));
        assert!(is_private_lan_host("10.232.142.234"));
        assert!(is_private_lan_host("172.31.255.1"));
        assert!(is_private_lan_host("169.254.153.138"));
        assert!(!is_private_lan_host("172.32.0.1"));
        assert!(!is_private_lan_host("8.8.8.8"));
        assert!(!is_private_lan_host("localhost"));
    }

    #[test]
    fn test_effective_port_falls_back() {
        assert_eq!(Origin::new("http", "h", None).effective_port(3356), 3356);
        assert_eq!(Origin::new("http", "h", Some(8080)).effective_port(3356), 8080);
    }

    #[test]
    fn test_route_discovery_prefers_current_lan_host() {
        let current = Origin::new("http", "192.168.4.4", Some(3356));
        assert_eq!(
            RouteDiscovery::default().discover(&current),
            Some("192.168.4.4".to_string())
        );
    }
}
