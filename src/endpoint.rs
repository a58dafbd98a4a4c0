//! Network endpoint value type used throughout the control-plane protocol.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;

/// A `(host, port)` pair as carried in rendezvous messages.
///
/// Equality is structural on both fields. The server relies on it to
/// deduplicate registrations and to match a disconnecting control socket
/// back to its slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self {
            host: addr.ip().to_string(),
            port: addr.port(),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equality_requires_both_fields() {
        assert_eq!(Endpoint::new("1.2.3.4", 5000), Endpoint::new("1.2.3.4", 5000));
        assert_ne!(Endpoint::new("1.2.3.4", 5000), Endpoint::new("1.2.3.4", 5001));
        assert_ne!(Endpoint::new("1.2.3.4", 5000), Endpoint::new("9.8.7.6", 5000));
    }

    #[test]
    fn test_from_socket_addr() {
        let addr: SocketAddr = "10.1.2.3:4567".parse().expect("parse addr");
        let endpoint = Endpoint::from(addr);
        assert_eq!(endpoint, Endpoint::new("10.1.2.3", 4567));
        assert_eq!(endpoint.to_string(), "10.1.2.3:4567");
    }

    #[test]
    fn test_json_field_names() {
        let json = serde_json::to_string(&Endpoint::new("1.2.3.4", 5000)).expect("serialize");
        assert_eq!(json, r#"{"host":"1.2.3.4","port":5000}"#);
    }
}
