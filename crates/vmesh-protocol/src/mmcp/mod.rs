//! Mesh management control protocol.
//!
//! Control messages ride in ordinary virtual packets addressed to
//! [`CONTROL_PORT`](crate::CONTROL_PORT). They measure link latency
//! (ping/pong), flood originator announcements that build the routing
//! table, and negotiate hotspots between neighbors.
mod connect;
mod message;
mod service;

pub use connect::{Band, ConnectConfig, HotspotType, MAX_STRING_LEN};
pub use message::{
    HotspotRequest, HotspotResult, MmcpBody, MmcpMessage, HOTSPOT_BUSY, HOTSPOT_FAILED,
    HOTSPOT_OK, HOTSPOT_UNSUPPORTED, WHAT_ACK, WHAT_HOTSPOT_REQUEST, WHAT_HOTSPOT_RESPONSE,
    WHAT_ORIGINATOR, WHAT_PING, WHAT_PONG,
};
pub use service::{MmcpConfig, MmcpEvent, MmcpHandle, MmcpService};
