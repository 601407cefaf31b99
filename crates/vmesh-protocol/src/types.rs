use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;

use vmesh_transport::{TransportError, VirtualAddress};

/// Reserved virtual port of the MMCP control protocol.
///
/// Never handed out to datagram sockets: asking for port 0 means
/// "pick any free port".
pub const CONTROL_PORT: u16 = 0;

/// Default hop budget of packets originated locally.
pub const DEFAULT_MAX_HOPS: u8 = 8;

/// Ports picked when a socket binds without a preference.
pub const EPHEMERAL_PORTS: RangeInclusive<u16> = 49152..=65535;

/// A virtual address plus port.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct VirtualSocketAddr {
    pub addr: VirtualAddress,
    pub port: u16,
}

impl VirtualSocketAddr {
    pub const fn new(addr: VirtualAddress, port: u16) -> Self {
        Self { addr, port }
    }
}

impl fmt::Display for VirtualSocketAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.addr, self.port)
    }
}

impl fmt::Debug for VirtualSocketAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtualSocketAddr({self})")
    }
}

impl FromStr for VirtualSocketAddr {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, port) = s
            .rsplit_once(':')
            .ok_or_else(|| TransportError::InvalidAddress(s.to_string()))?;
        let port = port
            .parse()
            .map_err(|_| TransportError::InvalidAddress(s.to_string()))?;
        Ok(Self::new(addr.parse()?, port))
    }
}

impl From<(VirtualAddress, u16)> for VirtualSocketAddr {
    fn from((addr, port): (VirtualAddress, u16)) -> Self {
        Self::new(addr, port)
    }
}
