//! Connectable peer addresses.
//!
//! A destination is a closed set of address kinds rather than an open
//! trait hierarchy; adding a transport kind means adding a variant here.

use std::fmt;
use std::net::{IpAddr, SocketAddr, SocketAddrV4, SocketAddrV6};

use serde::{Deserialize, Serialize};

use lattice_shared::protocol::DestinationInfo;

/// An address a transport can be opened to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Destination {
    TcpV4(SocketAddrV4),
    TcpV6(SocketAddrV6),
}

impl Destination {
    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4) => Self::TcpV4(v4),
            SocketAddr::V6(v6) => Self::TcpV6(v6),
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        match self {
            Self::TcpV4(v4) => SocketAddr::V4(*v4),
            Self::TcpV6(v6) => SocketAddr::V6(*v6),
        }
    }

    /// Whether this destination is worth dialing at all.
    pub fn can_connect(&self) -> bool {
        match self {
            Self::TcpV4(v4) => v4.port() != 0 && !v4.ip().is_unspecified(),
            Self::TcpV6(v6) => v6.port() != 0 && !v6.ip().is_unspecified(),
        }
    }

    pub fn to_info(&self) -> DestinationInfo {
        let addr = self.socket_addr();
        DestinationInfo {
            address: addr.ip(),
            port: addr.port(),
        }
    }

    pub fn from_info(info: &DestinationInfo) -> Self {
        match info.address {
            IpAddr::V4(ip) => Self::TcpV4(SocketAddrV4::new(ip, info.port)),
            IpAddr::V6(ip) => Self::TcpV6(SocketAddrV6::new(ip, info.port, 0, 0)),
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TcpV4(v4) => write!(f, "tcp/{v4}"),
            Self::TcpV6(v6) => write!(f, "tcp/{v6}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_can_connect() {
        let good: Destination = Destination::TcpV4("192.0.2.1:7332".parse().unwrap());
        assert!(good.can_connect());

        let zero_port = Destination::TcpV4("192.0.2.1:0".parse().unwrap());
        assert!(!zero_port.can_connect());

        let unspecified = Destination::TcpV4("0.0.0.0:7332".parse().unwrap());
        assert!(!unspecified.can_connect());
    }

    #[test]
    fn test_info_roundtrip() {
        let dest = Destination::TcpV6("[2001:db8::1]:7332".parse().unwrap());
        let restored = Destination::from_info(&dest.to_info());
        assert_eq!(restored.socket_addr(), dest.socket_addr());
    }
}
