/// A running mesh node.
///
/// Owns the router, the MMCP service, the optional chain relay and one
/// receive loop per link. Applications hand it links (any byte stream plus
/// the remote's hello) and open sockets on it; everything else happens in
/// background tasks tracked by the node and stopped by [`VirtualNode::shutdown`].
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use vmesh_transport::{
    connect_link, read_frame_into, EstablishedLink, Hello, Link, LinkEndpoint, LinkId,
    LinkListener, StreamLink, TransportError, VirtualAddress,
};

use crate::chain::{ChainSocketFactory, ChainSocketServer};
use crate::config::NodeConfig;
use crate::datagram::VirtualDatagramSocket;
use crate::error::VmeshError;
use crate::forward::{UdpForwardRule, UdpReturnPath, VirtualReturnPath};
use crate::mmcp::{HotspotRequest, HotspotResult, MmcpEvent, MmcpHandle, MmcpService};
use crate::packet::VirtualPacket;
use crate::pool::BufferPool;
use crate::provider::LinkProvider;
use crate::router::{NeighborInfo, RouteInfo, Router};
use crate::stats::RouterStats;
use crate::types::VirtualSocketAddr;

pub struct VirtualNode {
    router: Arc<Router>,
    config: NodeConfig,
    hello: Hello,
    mmcp: MmcpHandle,
    chain: ChainSocketFactory,
    relay: Option<ChainSocketServer>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl VirtualNode {
    /// Start a node: router, control service and, when configured, the
    /// chain relay.
    pub async fn start(config: NodeConfig, provider: Arc<dyn LinkProvider>) -> Result<Self, VmeshError> {
        let address = config.address.unwrap_or_else(VirtualAddress::random);
        let pool = BufferPool::new(config.buffer_size, config.pool_capacity);
        let router = Router::new(address, pool, config.router_config());
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();

        let chain = ChainSocketFactory::new(router.clone(), config.chain_config());
        let relay = match config.chain_relay_bind {
            Some(bind) => Some(ChainSocketServer::bind(bind, chain.clone(), cancel.child_token()).await?),
            None => None,
        };
        let hello = Hello::new(address, relay.as_ref().map_or(0, ChainSocketServer::port));

        let mmcp = MmcpService::spawn(
            router.clone(),
            provider,
            config.mmcp_config(),
            cancel.child_token(),
            &tracker,
        )?;

        tracing::info!(
            "node {address} started (chain relay: {})",
            relay
                .as_ref()
                .map_or_else(|| "off".to_string(), |r| r.local_addr().to_string())
        );
        Ok(Self {
            router,
            config,
            hello,
            mmcp,
            chain,
            relay,
            cancel,
            tracker,
        })
    }

    pub fn address(&self) -> VirtualAddress {
        self.router.local_address()
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Chain relay port, 0 without a relay.
    pub fn relay_port(&self) -> u16 {
        self.hello.relay_port
    }

    /// What this node announces when a link comes up.
    pub fn hello(&self) -> Hello {
        self.hello
    }

    // ── Links ─────────────────────────────────────────────────────────

    /// Attach a link to the mesh.
    ///
    /// `stream` is a connected byte stream to the node that announced
    /// `remote`; `ip` is where that node's chain relay and stream ports are
    /// reachable. The link replaces any earlier link to the same node.
    pub async fn add_link<S>(&self, remote: Hello, ip: IpAddr, stream: S) -> Result<LinkId, VmeshError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        if self.cancel.is_cancelled() {
            return Err(VmeshError::Closed);
        }
        self.links().attach(remote, ip, stream).await
    }

    /// Attach a TCP link that completed the hello exchange.
    pub async fn add_established(&self, link: EstablishedLink) -> Result<LinkId, VmeshError> {
        self.add_link(link.remote, link.peer_addr.ip(), link.stream).await
    }

    /// Accept TCP links on `addr` until shutdown. Returns the bound address.
    pub async fn listen(&self, addr: SocketAddr) -> Result<SocketAddr, VmeshError> {
        let listener = LinkListener::bind(addr, self.hello, self.config.link.clone()).await?;
        let local = listener.local_addr()?;
        tracing::info!("{}: accepting links on {local}", self.address());

        let links = self.links();
        let cancel = self.cancel.child_token();
        let tracker = self.tracker.clone();
        self.tracker.spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = listener.accept_pending() => accepted,
                };
                let pending = match accepted {
                    Ok(pending) => pending,
                    Err(e) => {
                        tracing::warn!("link accept failed: {e}");
                        continue;
                    }
                };
                // A peer that never sends its hello only holds up its own task.
                let links = links.clone();
                let cancel = cancel.clone();
                tracker.spawn(async move {
                    let peer = pending.peer_addr();
                    let link = tokio::select! {
                        _ = cancel.cancelled() => return,
                        link = pending.handshake() => link,
                    };
                    let result = match link {
                        Ok(link) => links.attach(link.remote, peer.ip(), link.stream).await,
                        Err(e) => Err(e.into()),
                    };
                    if let Err(e) = result {
                        tracing::warn!("link from {peer} rejected: {e}");
                    }
                });
            }
        });
        Ok(local)
    }

    /// Dial a TCP link. Returns the remote's virtual address.
    pub async fn connect(&self, addr: SocketAddr) -> Result<VirtualAddress, VmeshError> {
        let link = connect_link(addr, self.hello, &self.config.link).await?;
        let remote = link.remote.address;
        self.add_established(link).await?;
        Ok(remote)
    }

    fn links(&self) -> Links {
        Links {
            router: self.router.clone(),
            max_frame: self.config.link.get_max_frame_size(),
            cancel: self.cancel.clone(),
            tracker: self.tracker.clone(),
        }
    }

    // ── Sockets ───────────────────────────────────────────────────────

    /// Bind a datagram socket on `port`, or a random port when 0.
    pub fn bind_datagram(&self, port: u16) -> Result<VirtualDatagramSocket, VmeshError> {
        VirtualDatagramSocket::bind(self.router.clone(), port, self.config.datagram_config())
    }

    /// Open a stream to `dest:port`, relayed through chain relays when
    /// `dest` is not a neighbor.
    pub async fn chain_connect(&self, dest: VirtualAddress, port: u16) -> Result<TcpStream, VmeshError> {
        self.chain.connect(dest, port).await
    }

    /// Relay UDP datagrams arriving on `listen` to a virtual destination.
    /// Returns the bound UDP address with the running rule.
    pub async fn forward_udp(
        &self,
        listen: SocketAddr,
        target: VirtualSocketAddr,
    ) -> Result<(SocketAddr, UdpForwardRule), VmeshError> {
        let listener = UdpSocket::bind(listen).await?;
        let local = listener.local_addr()?;
        tracing::info!("forwarding udp {local} -> {target}");
        let factory = VirtualReturnPath {
            router: self.router.clone(),
            config: self.config.datagram_config(),
        };
        let rule = UdpForwardRule::start_with_cancel(listener, target, factory, self.cancel.child_token());
        Ok((local, rule))
    }

    /// Relay datagrams arriving on virtual `port` (random when 0) to a real
    /// UDP target. Returns the bound virtual address with the running rule.
    pub fn forward_virtual(
        &self,
        port: u16,
        target: SocketAddr,
    ) -> Result<(VirtualSocketAddr, UdpForwardRule), VmeshError> {
        let listener = self.bind_datagram(port)?;
        let local = listener.local_addr();
        tracing::info!("forwarding {local} -> udp {target}");
        let bind_ip = match target.ip() {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        let rule = UdpForwardRule::start_with_cancel(
            listener,
            target,
            UdpReturnPath { bind_ip },
            self.cancel.child_token(),
        );
        Ok((local, rule))
    }

    // ── Control ───────────────────────────────────────────────────────

    pub fn subscribe_events(&self) -> broadcast::Receiver<MmcpEvent> {
        self.mmcp.subscribe()
    }

    /// Ask neighbor `neighbor` to bring up a hotspot.
    pub async fn request_hotspot(
        &self,
        neighbor: VirtualAddress,
        request: HotspotRequest,
    ) -> Result<HotspotResult, VmeshError> {
        self.mmcp.request_hotspot(neighbor, request).await
    }

    pub fn stats(&self) -> &RouterStats {
        self.router.stats()
    }

    pub fn neighbors(&self) -> Vec<NeighborInfo> {
        self.router.neighbors()
    }

    pub fn routes(&self) -> Vec<RouteInfo> {
        self.router.routes()
    }

    /// Stop every task, close every link and the relay. Idempotent.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(relay) = &self.relay {
            relay.close().await;
        }
        for address in self.router.neighbor_addresses() {
            if let Some(neighbor) = self.router.neighbor(address) {
                neighbor.link.close().await;
                self.router.remove_neighbor(address, neighbor.link.id());
            }
        }
        self.tracker.close();
        self.tracker.wait().await;
        tracing::info!("node {} stopped", self.address());
    }
}

impl Drop for VirtualNode {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// What attaching a link needs, detached from the node so the accept
/// loop can own it.
#[derive(Clone)]
struct Links {
    router: Arc<Router>,
    max_frame: usize,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl Links {
    async fn attach<S>(&self, remote: Hello, ip: IpAddr, stream: S) -> Result<LinkId, VmeshError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        if remote.address == self.router.local_address() {
            return Err(TransportError::Handshake {
                reason: format!("remote claims our own address {}", remote.address),
            }
            .into());
        }

        let (reader, writer) = tokio::io::split(stream);
        let link: Arc<dyn Link> = Arc::new(StreamLink::new(remote.address, writer, self.max_frame));
        let endpoint = LinkEndpoint {
            ip,
            relay_port: remote.relay_port,
        };
        if let Some(previous) = self.router.add_neighbor(link.clone(), endpoint) {
            tracing::debug!("{}: replaced by {}", previous.link.id(), link.id());
            previous.link.close().await;
        }
        tracing::debug!("{}: receiving from {}", link.id(), remote.address);

        let id = link.id();
        self.tracker.spawn(receive_loop(
            self.router.clone(),
            link,
            reader,
            self.max_frame,
            self.cancel.child_token(),
        ));
        Ok(id)
    }
}

/// Read frames from one link and route them until the link fails.
async fn receive_loop<R>(
    router: Arc<Router>,
    link: Arc<dyn Link>,
    mut reader: R,
    max_frame: usize,
    cancel: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    let remote = link.remote();
    let id = link.id();

    loop {
        let mut buffer = router.pool().acquire();
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            read = read_frame_into(&mut reader, buffer.as_mut_vec(), max_frame) => read,
        };
        match read {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!("{id}: {remote} closed the link");
                break;
            }
            Err(TransportError::FrameTooLarge { size, max }) => {
                router.stats().dropped_malformed.inc();
                tracing::warn!("{id}: skipped {size}-byte frame from {remote} (max {max})");
                continue;
            }
            Err(e) => {
                tracing::debug!("{id}: read from {remote} failed: {e}");
                break;
            }
        }

        router.touch_neighbor(remote);
        let packet = match VirtualPacket::decode(buffer) {
            Ok(packet) => packet,
            Err(e) => {
                router.stats().dropped_malformed.inc();
                tracing::debug!("{id}: malformed packet from {remote}: {e}");
                continue;
            }
        };
        router.route(packet, Some(id)).await;
    }

    link.close().await;
    router.remove_neighbor(remote, id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::VirtualPacketHeader;
    use crate::provider::NoLinkProvider;
    use crate::types::DEFAULT_MAX_HOPS;
    use std::time::Duration;
    use vmesh_transport::{write_frame, LinkConfig};

    const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    async fn node(last: u8) -> VirtualNode {
        let config = NodeConfig::new()
            .no_chain_relay()
            .address(VirtualAddress::from_octets(169, 254, 0, last));
        VirtualNode::start(config, Arc::new(NoLinkProvider)).await.unwrap()
    }

    async fn node_with_link(last: u8, link: LinkConfig) -> VirtualNode {
        let config = NodeConfig::new()
            .no_chain_relay()
            .address(VirtualAddress::from_octets(169, 254, 0, last))
            .link(link);
        VirtualNode::start(config, Arc::new(NoLinkProvider)).await.unwrap()
    }

    async fn wait_for(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    #[tokio::test]
    async fn datagram_crosses_a_duplex_link() {
        let a = node(1).await;
        let b = node(2).await;
        let (sa, sb) = tokio::io::duplex(64 * 1024);
        a.add_link(b.hello(), LOOPBACK, sa).await.unwrap();
        b.add_link(a.hello(), LOOPBACK, sb).await.unwrap();

        let rx = b.bind_datagram(7000).unwrap();
        let tx = a.bind_datagram(0).unwrap();
        tx.send_to(b"hi b", rx.local_addr()).await.unwrap();

        let mut buf = [0u8; 16];
        let (n, from) = tokio::time::timeout(Duration::from_secs(5), rx.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"hi b");
        assert_eq!(from, tx.local_addr());
        assert_eq!(b.stats().delivered.get(), 1);

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn closed_stream_removes_neighbor() {
        let a = node(1).await;
        let b = node(2).await;
        let (sa, sb) = tokio::io::duplex(1024);
        a.add_link(b.hello(), LOOPBACK, sa).await.unwrap();
        assert!(a.router().is_neighbor(b.address()));

        drop(sb);
        wait_for(|| !a.router().is_neighbor(b.address())).await;
        a.shutdown().await;
    }

    #[tokio::test]
    async fn own_address_is_refused() {
        let a = node(1).await;
        let (sa, _sb) = tokio::io::duplex(1024);
        let err = a.add_link(a.hello(), LOOPBACK, sa).await.unwrap_err();
        assert!(matches!(err, VmeshError::Transport(TransportError::Handshake { .. })));
        a.shutdown().await;
    }

    #[tokio::test]
    async fn tcp_listen_and_connect() {
        let a = node(1).await;
        let b = node(2).await;
        let addr = a.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();

        assert_eq!(b.connect(addr).await.unwrap(), a.address());
        wait_for(|| a.router().is_neighbor(b.address())).await;
        assert_eq!(b.neighbors().len(), 1);

        a.shutdown().await;
        b.shutdown().await;
        a.shutdown().await;
        assert!(matches!(
            a.add_link(b.hello(), LOOPBACK, tokio::io::duplex(8).0).await,
            Err(VmeshError::Closed)
        ));
    }

    #[tokio::test]
    async fn silent_peers_do_not_hold_up_the_listener() {
        let a = node_with_link(1, LinkConfig::new().handshake_timeout(Duration::from_secs(10))).await;
        let b = node(2).await;
        let addr = a.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();

        // Connected, but never send a hello.
        let _silent1 = TcpStream::connect(addr).await.unwrap();
        let _silent2 = TcpStream::connect(addr).await.unwrap();

        let remote = tokio::time::timeout(Duration::from_secs(2), b.connect(addr))
            .await
            .expect("connect stalled behind silent peers")
            .unwrap();
        assert_eq!(remote, a.address());
        wait_for(|| a.router().is_neighbor(b.address())).await;

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn bad_frames_do_not_end_the_link() {
        let a = node_with_link(1, LinkConfig::new().max_frame_size(256)).await;
        let peer = VirtualAddress::from_octets(169, 254, 0, 2);
        let peer_hello = Hello {
            address: peer,
            ..a.hello()
        };
        let (sa, mut sb) = tokio::io::duplex(64 * 1024);
        a.add_link(peer_hello, LOOPBACK, sa).await.unwrap();
        let rx = a.bind_datagram(7000).unwrap();

        let mut header = VirtualPacketHeader::new(peer, 4000, a.address(), 7000, DEFAULT_MAX_HOPS);
        header.hop_count = 1;
        let mut packet = VirtualPacket::compose(&BufferPool::new(256, 1), header, b"survivor").unwrap();
        let valid = packet.wire_bytes().unwrap().into_owned();

        write_frame(&mut sb, &[0xAB; 10], 1024).await.unwrap();
        write_frame(&mut sb, &[0u8; 512], 1024).await.unwrap();
        write_frame(&mut sb, &valid, 1024).await.unwrap();

        let mut buf = [0u8; 32];
        let (n, from) = tokio::time::timeout(Duration::from_secs(5), rx.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"survivor");
        assert_eq!(from, VirtualSocketAddr::new(peer, 4000));
        assert_eq!(a.stats().dropped_malformed.get(), 2);
        assert!(a.router().is_neighbor(peer));

        a.shutdown().await;
    }
}
