//! Hotspot connection parameters carried inside MMCP messages.
//!
//! ```text
//! ssid:str | passphrase:str | bssid:str | port:i32 | link_local_addr:i32 |
//! hotspot_type:i8 | band:i8
//! ```
//!
//! where `str` is `len:i32` followed by UTF-8 bytes, or `len = -1` when absent.

use std::net::Ipv4Addr;

use bytes::{Buf, BufMut};
use serde::Serialize;

use crate::error::MmcpError;

/// Longest string accepted in a connect config.
pub const MAX_STRING_LEN: usize = 1024;

/// Kind of shared access point a node can bring up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum HotspotType {
    /// Let the provider choose.
    #[default]
    Any,
    /// Soft access point that neighbors join as clients.
    AccessPoint,
    /// Peer-to-peer group with this node as owner.
    PeerGroup,
}

impl HotspotType {
    pub fn to_wire(self) -> i8 {
        match self {
            HotspotType::Any => 0,
            HotspotType::AccessPoint => 1,
            HotspotType::PeerGroup => 2,
        }
    }

    pub fn from_wire(raw: i8) -> Result<Self, MmcpError> {
        match raw {
            0 => Ok(HotspotType::Any),
            1 => Ok(HotspotType::AccessPoint),
            2 => Ok(HotspotType::PeerGroup),
            other => Err(MmcpError::Malformed {
                reason: format!("unknown hotspot type {other}"),
            }),
        }
    }
}

/// Radio band preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum Band {
    #[default]
    Any,
    Ghz2_4,
    Ghz5,
}

impl Band {
    pub fn to_wire(self) -> i8 {
        match self {
            Band::Any => 0,
            Band::Ghz2_4 => 1,
            Band::Ghz5 => 2,
        }
    }

    pub fn from_wire(raw: i8) -> Result<Self, MmcpError> {
        match raw {
            0 => Ok(Band::Any),
            1 => Ok(Band::Ghz2_4),
            2 => Ok(Band::Ghz5),
            other => Err(MmcpError::Malformed {
                reason: format!("unknown band {other}"),
            }),
        }
    }
}

/// How to join a node's access point.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct ConnectConfig {
    pub ssid: Option<String>,
    pub passphrase: Option<String>,
    pub bssid: Option<String>,
    /// Port the link listener accepts on once joined.
    pub port: u16,
    /// Address of the node on the shared link, if it has one yet.
    pub link_local_addr: Option<Ipv4Addr>,
    pub hotspot_type: HotspotType,
    pub band: Band,
}

impl ConnectConfig {
    pub fn encode(&self, buf: &mut impl BufMut) {
        put_string(buf, self.ssid.as_deref());
        put_string(buf, self.passphrase.as_deref());
        put_string(buf, self.bssid.as_deref());
        buf.put_i32(i32::from(self.port));
        buf.put_u32(self.link_local_addr.map(u32::from).unwrap_or(0));
        buf.put_i8(self.hotspot_type.to_wire());
        buf.put_i8(self.band.to_wire());
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, MmcpError> {
        let ssid = get_string(buf)?;
        let passphrase = get_string(buf)?;
        let bssid = get_string(buf)?;
        need(&*buf, 10)?;
        let raw_port = buf.get_i32();
        let port = u16::try_from(raw_port).map_err(|_| MmcpError::Malformed {
            reason: format!("port {raw_port} out of range"),
        })?;
        let link_local_addr = match buf.get_u32() {
            0 => None,
            bits => Some(Ipv4Addr::from(bits)),
        };
        let hotspot_type = HotspotType::from_wire(buf.get_i8())?;
        let band = Band::from_wire(buf.get_i8())?;
        Ok(Self {
            ssid,
            passphrase,
            bssid,
            port,
            link_local_addr,
            hotspot_type,
            band,
        })
    }
}

/// Fail with `Truncated` unless `n` more bytes are available.
pub(crate) fn need(buf: &impl Buf, n: usize) -> Result<(), MmcpError> {
    if buf.remaining() < n {
        return Err(MmcpError::Truncated {
            needed: n,
            available: buf.remaining(),
        });
    }
    Ok(())
}

fn put_string(buf: &mut impl BufMut, value: Option<&str>) {
    match value {
        None => buf.put_i32(-1),
        Some(s) => {
            buf.put_i32(s.len() as i32);
            buf.put_slice(s.as_bytes());
        }
    }
}

fn get_string(buf: &mut impl Buf) -> Result<Option<String>, MmcpError> {
    need(&*buf, 4)?;
    let len = buf.get_i32();
    if len == -1 {
        return Ok(None);
    }
    let len = usize::try_from(len)
        .ok()
        .filter(|&l| l <= MAX_STRING_LEN)
        .ok_or_else(|| MmcpError::Malformed {
            reason: format!("bad string length {len}"),
        })?;
    need(&*buf, len)?;
    let bytes = buf.copy_to_bytes(len);
    String::from_utf8(bytes.to_vec())
        .map(Some)
        .map_err(|_| MmcpError::Malformed {
            reason: "string is not UTF-8".into(),
        })
}
