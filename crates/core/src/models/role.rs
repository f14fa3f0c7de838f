//! Connection role resolved by group formation

use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// Which end of the session socket this device plays
///
/// Decided once per group formation: the group owner listens, the other side
/// connects to the owner's address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionRole {
    Host,
    Client(IpAddr),
}

impl ConnectionRole {
    pub fn is_host(&self) -> bool {
        matches!(self, ConnectionRole::Host)
    }

    /// Address of the host, if this side is the client
    pub fn host_addr(&self) -> Option<IpAddr> {
        match self {
            ConnectionRole::Host => None,
            ConnectionRole::Client(addr) => Some(*addr),
        }
    }
}

impl fmt::Display for ConnectionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionRole::Host => write!(f, "host"),
            ConnectionRole::Client(addr) => write!(f, "client of {}", addr),
        }
    }
}
