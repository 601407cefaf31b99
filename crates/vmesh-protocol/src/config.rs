use std::net::SocketAddr;
use std::time::Duration;

use vmesh_transport::{LinkConfig, VirtualAddress};

use crate::chain::ChainConfig;
use crate::datagram::DatagramConfig;
use crate::mmcp::MmcpConfig;
use crate::router::RouterConfig;
use crate::types::DEFAULT_MAX_HOPS;

/// Configuration for a [`VirtualNode`](crate::VirtualNode).
///
/// All fields have defaults. Use the builder pattern:
///
/// ```rust
/// use std::time::Duration;
/// use vmesh_protocol::NodeConfig;
///
/// let config = NodeConfig::new()
///     .address("169.254.7.1".parse().unwrap())
///     .originator_interval(Duration::from_secs(2));
/// ```
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Virtual address. Random in 169.254.0.0/16 when unset.
    pub(crate) address: Option<VirtualAddress>,
    pub(crate) max_hops: u8,
    pub(crate) buffer_size: usize,
    pub(crate) pool_capacity: usize,
    pub(crate) datagram_queue_depth: usize,
    pub(crate) originator_interval: Duration,
    pub(crate) ping_interval: Duration,
    pub(crate) route_timeout: Duration,
    pub(crate) neighbor_stale: Duration,
    pub(crate) neighbor_departed: Duration,
    pub(crate) route_hysteresis: Duration,
    /// Link cost before the first RTT sample.
    pub(crate) default_rtt: Duration,
    /// Where the chain relay listens. No relay when unset.
    pub(crate) chain_relay_bind: Option<SocketAddr>,
    pub(crate) chain_connect_timeout: Duration,
    pub(crate) chain_max_hops: u8,
    pub(crate) link: LinkConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeConfig {
    /// Create a new config with defaults.
    ///
    /// If the `VMESH_CHAIN_RELAY_BIND` environment variable holds a socket
    /// address, the chain relay listens there. Override with
    /// [`.chain_relay_bind()`](Self::chain_relay_bind).
    pub fn new() -> Self {
        let chain_relay_bind = std::env::var("VMESH_CHAIN_RELAY_BIND")
            .ok()
            .and_then(|s| s.parse().ok());

        Self {
            address: None,
            max_hops: DEFAULT_MAX_HOPS,
            buffer_size: 2048,
            pool_capacity: 64,
            datagram_queue_depth: 64,
            originator_interval: Duration::from_secs(5),
            ping_interval: Duration::from_secs(3),
            route_timeout: Duration::from_secs(30),
            neighbor_stale: Duration::from_secs(10),
            neighbor_departed: Duration::from_secs(30),
            route_hysteresis: Duration::from_millis(5),
            default_rtt: Duration::from_millis(50),
            chain_relay_bind,
            chain_connect_timeout: Duration::from_secs(10),
            chain_max_hops: 16,
            link: LinkConfig::new(),
        }
    }

    pub fn address(mut self, address: VirtualAddress) -> Self {
        self.address = Some(address);
        self
    }

    /// Hop budget of originated packets (default: 8).
    pub fn max_hops(mut self, hops: u8) -> Self {
        self.max_hops = hops;
        self
    }

    /// Size of pooled packet buffers (default: 2048).
    pub fn buffer_size(mut self, bytes: usize) -> Self {
        self.buffer_size = bytes;
        self
    }

    /// Buffers kept in the pool (default: 64).
    pub fn pool_capacity(mut self, buffers: usize) -> Self {
        self.pool_capacity = buffers;
        self
    }

    pub fn datagram_queue_depth(mut self, depth: usize) -> Self {
        self.datagram_queue_depth = depth;
        self
    }

    pub fn originator_interval(mut self, interval: Duration) -> Self {
        self.originator_interval = interval;
        self
    }

    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn route_timeout(mut self, timeout: Duration) -> Self {
        self.route_timeout = timeout;
        self
    }

    /// Silence after which a neighbor is stale, then departed and dropped.
    pub fn neighbor_timeouts(mut self, stale: Duration, departed: Duration) -> Self {
        self.neighbor_stale = stale;
        self.neighbor_departed = departed;
        self
    }

    /// Margin a new next hop must win by (default: 5 ms).
    pub fn route_hysteresis(mut self, margin: Duration) -> Self {
        self.route_hysteresis = margin;
        self
    }

    pub fn default_rtt(mut self, rtt: Duration) -> Self {
        self.default_rtt = rtt;
        self
    }

    pub fn chain_relay_bind(mut self, addr: SocketAddr) -> Self {
        self.chain_relay_bind = Some(addr);
        self
    }

    /// Run without a chain relay even if the environment names one.
    pub fn no_chain_relay(mut self) -> Self {
        self.chain_relay_bind = None;
        self
    }

    pub fn chain_connect_timeout(mut self, timeout: Duration) -> Self {
        self.chain_connect_timeout = timeout;
        self
    }

    pub fn chain_max_hops(mut self, hops: u8) -> Self {
        self.chain_max_hops = hops;
        self
    }

    pub fn link(mut self, link: LinkConfig) -> Self {
        self.link = link;
        self
    }

    pub fn get_address(&self) -> Option<VirtualAddress> {
        self.address
    }

    pub fn get_chain_relay_bind(&self) -> Option<SocketAddr> {
        self.chain_relay_bind
    }

    pub(crate) fn router_config(&self) -> RouterConfig {
        RouterConfig {
            route_timeout: self.route_timeout,
            route_hysteresis: self.route_hysteresis,
            default_rtt: self.default_rtt,
            neighbor_stale: self.neighbor_stale,
            neighbor_departed: self.neighbor_departed,
        }
    }

    pub(crate) fn mmcp_config(&self) -> MmcpConfig {
        MmcpConfig {
            max_hops: self.max_hops,
            originator_interval: self.originator_interval,
            ping_interval: self.ping_interval,
            ping_timeout: self.neighbor_stale.max(self.ping_interval),
            ..MmcpConfig::default()
        }
    }

    pub(crate) fn datagram_config(&self) -> DatagramConfig {
        DatagramConfig {
            queue_depth: self.datagram_queue_depth,
            max_hops: self.max_hops,
            ..DatagramConfig::default()
        }
    }

    pub(crate) fn chain_config(&self) -> ChainConfig {
        ChainConfig {
            connect_timeout: self.chain_connect_timeout,
            max_hops: self.chain_max_hops,
        }
    }
}
