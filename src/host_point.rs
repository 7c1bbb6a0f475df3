//! Host Point
//!
//! Address/port pair identifying a network peer. A default-constructed value
//! is the "null" sentinel meaning "unset".

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Address + port pair; the null value means "unset"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostPoint {
    address: IpAddr,
    port: u16,
}

pub type HostPointSet = HashSet<HostPoint>;

impl HostPoint {
    pub fn new(address: IpAddr, port: u16) -> Self {
        Self { address, port }
    }

    /// The "unset" sentinel value
    pub fn null() -> Self {
        Self {
            address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 0,
        }
    }

    pub fn is_null(&self) -> bool {
        self.port == 0 && self.address == IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    }

    pub fn address(&self) -> IpAddr {
        self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn set_address(&mut self, address: IpAddr) {
        self.address = address;
    }

    pub fn set_port(&mut self, port: u16) {
        self.port = port;
    }

    pub fn to_socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

impl Default for HostPoint {
    fn default() -> Self {
        Self::null()
    }
}

impl From<SocketAddr> for HostPoint {
    fn from(addr: SocketAddr) -> Self {
        Self {
            address: addr.ip(),
            port: addr.port(),
        }
    }
}

impl fmt::Display for HostPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}
