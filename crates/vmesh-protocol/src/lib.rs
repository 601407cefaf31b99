//! vmesh protocol layer.
//!
//! Virtual addressing, per-hop packet routing, the MMCP control protocol,
//! datagram sockets, NAT-style UDP forwarding and multi-hop chain sockets
//! on top of `vmesh-transport` links.
//!
//! Wire format: fixed big-endian headers, 26-byte packet header.

pub mod chain;
pub mod config;
pub mod datagram;
pub mod error;
pub mod forward;
pub mod link_quality;
pub mod mmcp;
pub mod node;
pub mod packet;
pub mod pool;
pub mod provider;
pub mod router;
pub mod stats;
pub mod types;

#[cfg(test)]
mod mock;

pub use chain::{ChainConfig, ChainSocketFactory, ChainSocketInitRequest, ChainSocketInitResponse, ChainSocketServer};
pub use config::NodeConfig;
pub use datagram::{DatagramConfig, VirtualDatagramSocket};
pub use error::{MmcpError, PacketError, VmeshError};
pub use forward::{DatagramSocket, ReturnPathFactory, UdpForwardRule, UdpReturnPath, VirtualReturnPath};
pub use link_quality::{LinkQuality, Liveness};
pub use mmcp::{
    Band, ConnectConfig, HotspotRequest, HotspotResult, HotspotType, MmcpBody, MmcpConfig,
    MmcpEvent, MmcpHandle, MmcpMessage, MmcpService,
};
pub use node::VirtualNode;
pub use packet::{VirtualPacket, VirtualPacketHeader, HEADER_SIZE};
pub use pool::{BufferPool, PooledBuffer};
pub use provider::{LinkProvider, NoLinkProvider};
pub use router::{
    DropReason, NextHop, NeighborInfo, PortLease, Protocol, RouteInfo, RouteOutcome, RouteUpdate,
    Router, RouterConfig, RoutingEntry,
};
pub use stats::{Counter, RouterStats};
pub use types::{VirtualSocketAddr, CONTROL_PORT, DEFAULT_MAX_HOPS, EPHEMERAL_PORTS};
pub use vmesh_transport::VirtualAddress;
