//! vmesh transport layer.
//!
//! Carries raw frames between two directly linked nodes. The physical link
//! (hotspot, peer group, radio pairing) is established elsewhere; this crate
//! only needs a connected byte stream per neighbor.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use vmesh_transport::{connect_link, Hello, LinkConfig, VirtualAddress};
//!
//! # async fn example() -> Result<(), vmesh_transport::TransportError> {
//! let me = Hello::new(VirtualAddress::random(), 4001);
//! let link = connect_link("192.168.49.1:4000".parse().unwrap(), me, &LinkConfig::new()).await?;
//! println!("linked to {} at {}", link.remote.address, link.peer_addr);
//! # Ok(())
//! # }
//! ```

mod config;
mod error;
mod framing;
mod handshake;
mod link;
mod listener;

pub use config::LinkConfig;
pub use error::TransportError;
pub use framing::{read_frame_into, write_frame, FRAME_LEN_PREFIX};
pub use handshake::{exchange_hello, Hello, HELLO_LEN, HELLO_MAGIC, HELLO_VERSION};
pub use link::{Link, LinkEndpoint, LinkId, StreamLink};
pub use listener::{connect_link, EstablishedLink, LinkListener, PendingLink};

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;

/// Virtual node address, a 32-bit identifier inside the mesh.
///
/// Compared as a raw integer, displayed and parsed in dotted form.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct VirtualAddress(u32);

/// 169.254.0.0/16
const LINK_LOCAL_PREFIX: u32 = 0xA9FE_0000;
const LINK_LOCAL_MASK: u32 = 0xFFFF_0000;

impl VirtualAddress {
    /// Delivered locally and flooded to every neighbor.
    pub const BROADCAST: VirtualAddress = VirtualAddress(0xFFFF_FFFF);

    /// Placeholder for "no address".
    pub const UNSPECIFIED: VirtualAddress = VirtualAddress(0);

    pub const fn new(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn from_octets(a: u8, b: u8, c: u8, d: u8) -> Self {
        Self(u32::from_be_bytes([a, b, c, d]))
    }

    /// Pick a random address in 169.254.0.0/16, avoiding .0 and .255 host bytes.
    pub fn random() -> Self {
        let mut rng = rand::rng();
        let third: u32 = rng.random_range(1..=254);
        let fourth: u32 = rng.random_range(1..=254);
        Self(LINK_LOCAL_PREFIX | (third << 8) | fourth)
    }

    pub const fn to_bits(self) -> u32 {
        self.0
    }

    /// Wire form (signed big-endian integer).
    pub const fn to_i32(self) -> i32 {
        self.0 as i32
    }

    pub const fn from_i32(raw: i32) -> Self {
        Self(raw as u32)
    }

    pub const fn octets(self) -> [u8; 4] {
        self.0.to_be_bytes()
    }

    pub const fn is_broadcast(self) -> bool {
        self.0 == Self::BROADCAST.0
    }

    pub const fn is_unspecified(self) -> bool {
        self.0 == 0
    }

    pub const fn is_link_local(self) -> bool {
        self.0 & LINK_LOCAL_MASK == LINK_LOCAL_PREFIX
    }
}

impl From<Ipv4Addr> for VirtualAddress {
    fn from(ip: Ipv4Addr) -> Self {
        Self(u32::from(ip))
    }
}

impl From<VirtualAddress> for Ipv4Addr {
    fn from(addr: VirtualAddress) -> Self {
        Ipv4Addr::from(addr.0)
    }
}

impl fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&Ipv4Addr::from(self.0), f)
    }
}

impl fmt::Debug for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtualAddress({self})")
    }
}

impl FromStr for VirtualAddress {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ip: Ipv4Addr = s
            .parse()
            .map_err(|_| TransportError::InvalidAddress(s.to_string()))?;
        Ok(Self::from(ip))
    }
}

impl serde::Serialize for VirtualAddress {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for VirtualAddress {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Current time in milliseconds since UNIX epoch.
#[inline]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dotted_display_and_parse() {
        let addr = VirtualAddress::from_octets(169, 254, 7, 42);
        assert_eq!(addr.to_string(), "169.254.7.42");
        assert_eq!("169.254.7.42".parse::<VirtualAddress>().unwrap(), addr);
        assert_eq!(format!("{addr:?}"), "VirtualAddress(169.254.7.42)");
    }

    #[test]
    fn parse_rejects_garbage() {
        let err = "not-an-address".parse::<VirtualAddress>().unwrap_err();
        assert_eq!(err.to_string(), "invalid virtual address: not-an-address");
    }

    #[test]
    fn random_stays_link_local() {
        for _ in 0..500 {
            let addr = VirtualAddress::random();
            assert!(addr.is_link_local(), "{addr} outside 169.254/16");
            let [_, _, c, d] = addr.octets();
            assert!((1..=254).contains(&c));
            assert!((1..=254).contains(&d));
        }
    }

    #[test]
    fn wire_form_preserves_high_bit() {
        let addr = VirtualAddress::from_octets(169, 254, 1, 1);
        assert!(addr.to_i32() < 0);
        assert_eq!(VirtualAddress::from_i32(addr.to_i32()), addr);
        assert!(VirtualAddress::from_i32(-1).is_broadcast());
    }

    #[test]
    fn ordering_is_numeric() {
        let low = VirtualAddress::new(43);
        let high = VirtualAddress::from_octets(169, 254, 0, 1);
        assert!(low < high);
    }

    #[test]
    fn serde_as_dotted_string() {
        let addr = VirtualAddress::from_octets(169, 254, 3, 9);
        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(json, "\"169.254.3.9\"");
        let back: VirtualAddress = serde_json::from_str(&json).unwrap();
        assert_eq!(back, addr);
    }
}
