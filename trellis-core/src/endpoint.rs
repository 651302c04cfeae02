//! Endpoint identity.
//!
//! An [`EndpointAddress`] names a reachable network endpoint. Two addresses
//! are the same endpoint when their canonical `host:port` strings match; the
//! secondary ports and the announced host are descriptive only and never take
//! part in equality or hashing.
//!
//! ```
//! use trellis_core::EndpointAddress;
//!
//! let addr: EndpointAddress = "10.0.0.1:8080".parse().unwrap();
//! assert_eq!(addr.to_string(), "10.0.0.1:8080");
//! assert_eq!(addr, EndpointAddress::new("10.0.0.1", 8080).with_http_port(80));
//! ```

use crate::error::{Result, TrellisError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::str::FromStr;

/// Identity of a network endpoint hosting one or more services.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointAddress {
    /// Host name or IP address the endpoint listens on.
    pub host: String,

    /// Primary RPC port.
    pub port: u16,

    /// WebSocket port, if the endpoint exposes one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ws_port: Option<u16>,

    /// MQTT port, if the endpoint exposes one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mqtt_port: Option<u16>,

    /// HTTP port, if the endpoint exposes one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_port: Option<u16>,

    /// Externally visible host (NAT / container setups).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub announce_host: Option<String>,
}

impl EndpointAddress {
    /// Create a new endpoint address.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ws_port: None,
            mqtt_port: None,
            http_port: None,
            announce_host: None,
        }
    }

    /// Set the WebSocket port.
    pub fn with_ws_port(mut self, port: u16) -> Self {
        self.ws_port = Some(port);
        self
    }

    /// Set the MQTT port.
    pub fn with_mqtt_port(mut self, port: u16) -> Self {
        self.mqtt_port = Some(port);
        self
    }

    /// Set the HTTP port.
    pub fn with_http_port(mut self, port: u16) -> Self {
        self.http_port = Some(port);
        self
    }

    /// Set the externally visible host.
    pub fn with_announce_host(mut self, host: impl Into<String>) -> Self {
        self.announce_host = Some(host.into());
        self
    }

    /// Canonical `host:port` key used for equality, hashing and map keys.
    pub fn key(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Host other nodes should dial: the announced host when set.
    pub fn dial_host(&self) -> &str {
        self.announce_host.as_deref().unwrap_or(&self.host)
    }

    /// Resolve to a socket address when the host is a literal IP.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        format!("{}:{}", self.dial_host(), self.port).parse().ok()
    }
}

impl PartialEq for EndpointAddress {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host && self.port == other.port
    }
}

impl Eq for EndpointAddress {}

impl Hash for EndpointAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.host.hash(state);
        self.port.hash(state);
    }
}

impl fmt::Display for EndpointAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for EndpointAddress {
    type Err = TrellisError;

    fn from_str(s: &str) -> Result<Self> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| TrellisError::invalid_address(format!("missing port in '{}'", s)))?;

        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(TrellisError::invalid_address(format!("missing host in '{}'", s)));
        }

        let port = port
            .parse::<u16>()
            .map_err(|e| TrellisError::invalid_address(format!("bad port in '{}': {}", s, e)))?;

        Ok(Self::new(host, port))
    }
}

impl From<SocketAddr> for EndpointAddress {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_equality_ignores_secondary_ports() {
        let a = EndpointAddress::new("10.0.0.1", 80).with_ws_port(96);
        let b = EndpointAddress::new("10.0.0.1", 80).with_announce_host("public.example");

        assert_eq!(a, b);

        let mut set = HashSet::new();
        set.insert(a);
        set.insert(b);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_parse() {
        let addr: EndpointAddress = "127.0.0.1:9000".parse().unwrap();
        assert_eq!(addr.host, "127.0.0.1");
        assert_eq!(addr.port, 9000);
        assert_eq!(addr.key(), "127.0.0.1:9000");

        assert!("no-port".parse::<EndpointAddress>().is_err());
        assert!(":80".parse::<EndpointAddress>().is_err());
        assert!("host:99999".parse::<EndpointAddress>().is_err());
    }

    #[test]
    fn test_dial_host_prefers_announce_host() {
        let addr = EndpointAddress::new("0.0.0.0", 80).with_announce_host("10.1.1.1");
        assert_eq!(addr.dial_host(), "10.1.1.1");
        assert_eq!(addr.socket_addr(), Some("10.1.1.1:80".parse().unwrap()));
    }

    #[test]
    fn test_serde_roundtrip_keeps_optional_fields() {
        let addr = EndpointAddress::new("svc.local", 81).with_http_port(8080);
        let json = serde_json::to_string(&addr).unwrap();
        assert!(!json.contains("ws_port"));

        let back: EndpointAddress = serde_json::from_str(&json).unwrap();
        assert_eq!(back.http_port, Some(8080));
    }
}
