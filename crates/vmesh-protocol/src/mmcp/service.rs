/// The MMCP service loop.
///
/// A single task bound to the control port. It multiplexes incoming control
/// packets, hotspot commands from the application, and three timers:
/// originator flooding, neighbor pings, and the expiry sweep.
use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use vmesh_transport::VirtualAddress;

use super::message::{HotspotRequest, HotspotResult, MmcpBody, MmcpMessage};
use super::ConnectConfig;
use crate::error::VmeshError;
use crate::packet::{VirtualPacket, VirtualPacketHeader};
use crate::provider::LinkProvider;
use crate::router::{PortLease, Protocol, RouteOutcome, RouteUpdate, Router};
use crate::types::{CONTROL_PORT, DEFAULT_MAX_HOPS};

/// Control packets queued between the router and the service.
const CONTROL_QUEUE_DEPTH: usize = 256;
const EVENT_CAPACITY: usize = 256;

// ── Configuration ─────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct MmcpConfig {
    /// Hop budget of originator floods.
    pub max_hops: u8,
    pub originator_interval: Duration,
    pub ping_interval: Duration,
    /// How often expired routes and silent neighbors are swept.
    pub sweep_interval: Duration,
    /// Unanswered pings are forgotten after this long.
    pub ping_timeout: Duration,
    /// How long `request_hotspot` waits for the response.
    pub request_timeout: Duration,
}

impl Default for MmcpConfig {
    fn default() -> Self {
        Self {
            max_hops: DEFAULT_MAX_HOPS,
            originator_interval: Duration::from_secs(5),
            ping_interval: Duration::from_secs(3),
            sweep_interval: Duration::from_secs(1),
            ping_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
        }
    }
}

// ── Events (service → app) ────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum MmcpEvent {
    RttMeasured {
        neighbor: VirtualAddress,
        rtt: Duration,
        srtt: Duration,
    },
    /// An originator announcement was accepted into the routing table.
    RouteUpdated {
        destination: VirtualAddress,
        next_hop: VirtualAddress,
        metric: u32,
        hops: u8,
        connect_config: Option<ConnectConfig>,
    },
    RouteExpired {
        destination: VirtualAddress,
    },
    /// A neighbor went silent and its link was dropped.
    NeighborDeparted {
        neighbor: VirtualAddress,
    },
    AckReceived {
        from: VirtualAddress,
        ack_of: i32,
    },
    HotspotServed {
        requester: VirtualAddress,
        error_code: i32,
    },
}

// ── Commands (app → service) ──────────────────────────────────────────

type HotspotReply = oneshot::Sender<Result<HotspotResult, VmeshError>>;

enum MmcpCommand {
    RequestHotspot {
        neighbor: VirtualAddress,
        request: HotspotRequest,
        reply: HotspotReply,
    },
}

/// Application-side handle to a running service.
#[derive(Clone)]
pub struct MmcpHandle {
    commands: mpsc::Sender<MmcpCommand>,
    events: broadcast::Sender<MmcpEvent>,
    request_timeout: Duration,
}

impl MmcpHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<MmcpEvent> {
        self.events.subscribe()
    }

    /// Ask `neighbor` to host a hotspot and wait for its answer.
    pub async fn request_hotspot(
        &self,
        neighbor: VirtualAddress,
        request: HotspotRequest,
    ) -> Result<HotspotResult, VmeshError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(MmcpCommand::RequestHotspot {
                neighbor,
                request,
                reply,
            })
            .await
            .map_err(|_| VmeshError::Closed)?;
        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(VmeshError::Closed),
            Err(_) => Err(VmeshError::Timeout(format!(
                "hotspot response from {neighbor}"
            ))),
        }
    }
}

// ── Service ───────────────────────────────────────────────────────────

pub struct MmcpService {
    router: Arc<Router>,
    provider: Arc<dyn LinkProvider>,
    config: MmcpConfig,
    events: broadcast::Sender<MmcpEvent>,
    next_id: Arc<AtomicI32>,
    /// (neighbor, message id) → when the ping left.
    pending_pings: HashMap<(VirtualAddress, i32), Instant>,
    pending_hotspots: HashMap<(VirtualAddress, i32), HotspotReply>,
    tracker: TaskTracker,
}

impl MmcpService {
    /// Bind the control port and start the service on `tracker`.
    pub fn spawn(
        router: Arc<Router>,
        provider: Arc<dyn LinkProvider>,
        config: MmcpConfig,
        cancel: CancellationToken,
        tracker: &TaskTracker,
    ) -> Result<MmcpHandle, VmeshError> {
        let (packet_tx, packet_rx) = mpsc::channel(CONTROL_QUEUE_DEPTH);
        let lease = router.allocate_port(Protocol::Control, CONTROL_PORT, packet_tx)?;
        let (command_tx, command_rx) = mpsc::channel(16);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let handle = MmcpHandle {
            commands: command_tx,
            events: events.clone(),
            request_timeout: config.request_timeout,
        };
        let service = Self {
            router,
            provider,
            config,
            events,
            next_id: Arc::new(AtomicI32::new(1)),
            pending_pings: HashMap::new(),
            pending_hotspots: HashMap::new(),
            tracker: tracker.clone(),
        };
        tracker.spawn(service.run(lease, packet_rx, command_rx, cancel));
        Ok(handle)
    }

    async fn run(
        mut self,
        _lease: PortLease,
        mut packets: mpsc::Receiver<VirtualPacket>,
        mut commands: mpsc::Receiver<MmcpCommand>,
        cancel: CancellationToken,
    ) {
        let mut originator = tokio::time::interval(self.config.originator_interval);
        let mut ping = tokio::time::interval(self.config.ping_interval);
        let mut sweep = tokio::time::interval(self.config.sweep_interval);

        // Skip the immediate first tick on all intervals
        originator.tick().await;
        ping.tick().await;
        sweep.tick().await;

        tracing::debug!("{}: mmcp service started", self.router.local_address());
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(packet) = packets.recv() => self.handle_packet(packet).await,
                Some(command) = commands.recv() => self.handle_command(command).await,
                _ = originator.tick() => self.originate().await,
                _ = ping.tick() => self.ping_neighbors().await,
                _ = sweep.tick() => self.sweep().await,
            }
        }
        tracing::debug!("{}: mmcp service stopped", self.router.local_address());
    }

    async fn handle_packet(&mut self, packet: VirtualPacket) {
        let header = *packet.header();
        let message = match MmcpMessage::decode(packet.payload()) {
            Ok(message) => message,
            Err(e) => {
                self.router.stats().dropped_malformed.inc();
                tracing::debug!("bad control message from {}: {e}", header.from);
                return;
            }
        };
        drop(packet);

        match message.body {
            MmcpBody::Ping => {
                let pong = MmcpMessage::new(
                    self.next_id(),
                    MmcpBody::Pong {
                        reply_to: message.message_id,
                    },
                );
                self.send(header.from, &pong).await;
            }
            MmcpBody::Pong { reply_to } => {
                let Some(sent) = self.pending_pings.remove(&(header.from, reply_to)) else {
                    tracing::debug!("unsolicited pong from {}", header.from);
                    return;
                };
                let rtt = sent.elapsed();
                if let Some(srtt) = self.router.record_rtt(header.from, rtt) {
                    self.emit(MmcpEvent::RttMeasured {
                        neighbor: header.from,
                        rtt,
                        srtt,
                    });
                }
            }
            MmcpBody::Ack { ack_of } => self.emit(MmcpEvent::AckReceived {
                from: header.from,
                ack_of,
            }),
            MmcpBody::Originator {
                ping_time_sum,
                connect_config,
            } => {
                self.handle_originator(header, message.message_id, ping_time_sum, connect_config)
                    .await
            }
            MmcpBody::HotspotRequest(request) => {
                self.serve_hotspot(header.from, message.message_id, request)
                    .await
            }
            MmcpBody::HotspotResponse { reply_to, result } => {
                match self.pending_hotspots.remove(&(header.from, reply_to)) {
                    Some(reply) => {
                        let _ = reply.send(Ok(result));
                    }
                    None => tracing::debug!("unexpected hotspot response from {}", header.from),
                }
            }
        }
    }

    /// Fold the cost of the arrival link into the announcement, offer the
    /// route, and pass the announcement on when it was accepted.
    async fn handle_originator(
        &mut self,
        header: VirtualPacketHeader,
        message_id: i32,
        ping_time_sum: i16,
        connect_config: Option<ConnectConfig>,
    ) {
        let originator = header.from;
        let neighbor = header.last_hop;
        if originator == self.router.local_address() || !self.router.is_neighbor(neighbor) {
            return;
        }

        let cost = self.router.link_cost(neighbor).min(i16::MAX as u32) as i16;
        let sum = ping_time_sum.saturating_add(cost);
        let update = self.router.offer_route(originator, neighbor, sum as u32);
        if !update.accepted() {
            return;
        }
        if matches!(update, RouteUpdate::Inserted | RouteUpdate::Replaced { .. }) {
            tracing::info!(
                "{}: route to {originator} via {neighbor}, metric {sum} ms, {} hop(s)",
                self.router.local_address(),
                header.hop_count
            );
        }
        self.emit(MmcpEvent::RouteUpdated {
            destination: originator,
            next_hop: neighbor,
            metric: sum as u32,
            hops: header.hop_count,
            connect_config: connect_config.clone(),
        });

        let announcement = MmcpMessage::new(
            message_id,
            MmcpBody::Originator {
                ping_time_sum: sum,
                connect_config,
            },
        )
        .encode();
        for next in self.router.neighbor_addresses() {
            if next == neighbor || next == originator {
                continue;
            }
            let mut forward = VirtualPacketHeader::new(
                originator,
                CONTROL_PORT,
                next,
                CONTROL_PORT,
                header.max_hops,
            );
            forward.hop_count = header.hop_count;
            self.route(forward, &announcement).await;
        }
    }

    async fn serve_hotspot(&mut self, requester: VirtualAddress, message_id: i32, request: HotspotRequest) {
        let ack = MmcpMessage::new(self.next_id(), MmcpBody::Ack { ack_of: message_id });
        self.send(requester, &ack).await;

        let router = self.router.clone();
        let provider = self.provider.clone();
        let next_id = self.next_id.clone();
        let events = self.events.clone();
        let max_hops = self.config.max_hops;
        self.tracker.spawn(async move {
            let result = provider.request_hotspot(requester, request).await;
            let error_code = result.error_code;
            let response = MmcpMessage::new(
                next_id.fetch_add(1, Ordering::Relaxed),
                MmcpBody::HotspotResponse {
                    reply_to: message_id,
                    result,
                },
            );
            send_control(&router, requester, max_hops, &response).await;
            let _ = events.send(MmcpEvent::HotspotServed {
                requester,
                error_code,
            });
        });
    }

    async fn handle_command(&mut self, command: MmcpCommand) {
        match command {
            MmcpCommand::RequestHotspot {
                neighbor,
                request,
                reply,
            } => {
                if !self.router.is_neighbor(neighbor) {
                    let _ = reply.send(Err(VmeshError::NotNeighbor { dest: neighbor }));
                    return;
                }
                let id = self.next_id();
                self.pending_hotspots.insert((neighbor, id), reply);
                let message = MmcpMessage::new(id, MmcpBody::HotspotRequest(request));
                self.send(neighbor, &message).await;
            }
        }
    }

    /// Announce this node to every neighbor.
    async fn originate(&mut self) {
        let neighbors = self.router.neighbor_addresses();
        if neighbors.is_empty() {
            return;
        }
        let message = MmcpMessage::new(
            self.next_id(),
            MmcpBody::Originator {
                ping_time_sum: 0,
                connect_config: self.provider.connect_config(),
            },
        );
        for neighbor in neighbors {
            self.send(neighbor, &message).await;
        }
    }

    async fn ping_neighbors(&mut self) {
        for neighbor in self.router.neighbor_addresses() {
            let id = self.next_id();
            self.pending_pings.insert((neighbor, id), Instant::now());
            self.send(neighbor, &MmcpMessage::new(id, MmcpBody::Ping)).await;
        }
    }

    async fn sweep(&mut self) {
        for destination in self.router.expire_routes() {
            tracing::info!("{}: route to {destination} expired", self.router.local_address());
            self.emit(MmcpEvent::RouteExpired { destination });
        }

        for neighbor in self.router.departed_neighbors() {
            tracing::warn!(
                "{}: neighbor {} went silent, dropping {}",
                self.router.local_address(),
                neighbor.address,
                neighbor.link.id()
            );
            neighbor.link.close().await;
            self.router
                .remove_neighbor(neighbor.address, neighbor.link.id());
            self.emit(MmcpEvent::NeighborDeparted {
                neighbor: neighbor.address,
            });
        }

        let now = Instant::now();
        let ping_timeout = self.config.ping_timeout;
        self.pending_pings
            .retain(|_, sent| now.saturating_duration_since(*sent) < ping_timeout);
        self.pending_hotspots.retain(|_, reply| !reply.is_closed());
    }

    // ── Helpers ───────────────────────────────────────────────────────

    fn next_id(&self) -> i32 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn emit(&self, event: MmcpEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    async fn send(&self, to: VirtualAddress, message: &MmcpMessage) {
        send_control(&self.router, to, self.config.max_hops, message).await;
    }

    async fn route(&self, header: VirtualPacketHeader, payload: &[u8]) {
        route_control(&self.router, header, payload).await;
    }
}

async fn send_control(router: &Router, to: VirtualAddress, max_hops: u8, message: &MmcpMessage) {
    let header = VirtualPacketHeader::new(
        router.local_address(),
        CONTROL_PORT,
        to,
        CONTROL_PORT,
        max_hops,
    );
    route_control(router, header, &message.encode()).await;
}

async fn route_control(router: &Router, header: VirtualPacketHeader, payload: &[u8]) {
    let packet = match VirtualPacket::compose(router.pool(), header, payload) {
        Ok(packet) => packet,
        Err(e) => {
            tracing::warn!("cannot build control packet for {}: {e}", header.to);
            return;
        }
    };
    if let RouteOutcome::Dropped(reason) = router.route(packet, None).await {
        tracing::debug!("control packet to {} dropped: {reason:?}", header.to);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mmcp::{HOTSPOT_UNSUPPORTED, WHAT_ACK};
    use crate::mock::MockLink;
    use crate::pool::BufferPool;
    use crate::provider::NoLinkProvider;
    use crate::router::RouterConfig;
    use std::net::{IpAddr, Ipv4Addr};
    use vmesh_transport::{Link, LinkEndpoint};

    fn addr(last: u8) -> VirtualAddress {
        VirtualAddress::from_octets(169, 254, 0, last)
    }

    fn quiet_config() -> MmcpConfig {
        MmcpConfig {
            originator_interval: Duration::from_secs(3600),
            ping_interval: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(3600),
            request_timeout: Duration::from_millis(500),
            ..MmcpConfig::default()
        }
    }

    fn router_with(local: u8, neighbors: &[u8]) -> (Arc<Router>, Vec<Arc<MockLink>>) {
        let config = RouterConfig {
            default_rtt: Duration::from_millis(10),
            ..RouterConfig::default()
        };
        let router = Router::new(addr(local), BufferPool::new(512, 16), config);
        let links = neighbors
            .iter()
            .map(|&n| {
                let link = Arc::new(MockLink::new(addr(n)));
                router.add_neighbor(
                    link.clone(),
                    LinkEndpoint {
                        ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
                        relay_port: 0,
                    },
                );
                link
            })
            .collect();
        (router, links)
    }

    fn start(router: &Arc<Router>, config: MmcpConfig) -> (MmcpHandle, CancellationToken) {
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let handle = MmcpService::spawn(
            router.clone(),
            Arc::new(NoLinkProvider),
            config,
            cancel.clone(),
            &tracker,
        )
        .unwrap();
        (handle, cancel)
    }

    /// Feed a control message into the router as if it arrived on `link`.
    async fn inject(router: &Router, link: &MockLink, header: VirtualPacketHeader, message: MmcpMessage) {
        let packet = VirtualPacket::compose(router.pool(), header, &message.encode()).unwrap();
        router.route(packet, Some(link.id())).await;
    }

    fn control_header(from: VirtualAddress, to: VirtualAddress, hops: u8) -> VirtualPacketHeader {
        let mut header = VirtualPacketHeader::new(from, CONTROL_PORT, to, CONTROL_PORT, 8);
        header.hop_count = hops;
        header
    }

    async fn wait_for_frames(link: &MockLink, count: usize) -> Vec<VirtualPacket> {
        for _ in 0..200 {
            if link.sent_frames().len() >= count {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        link.sent_packets()
    }

    #[tokio::test]
    async fn ping_gets_pong() {
        let (router, links) = router_with(1, &[2]);
        let (_handle, cancel) = start(&router, quiet_config());

        let mut header = control_header(addr(2), addr(1), 1);
        header.last_hop = addr(2);
        inject(&router, &links[0], header, MmcpMessage::new(77, MmcpBody::Ping)).await;

        let sent = wait_for_frames(&links[0], 1).await;
        assert_eq!(sent.len(), 1);
        let reply = MmcpMessage::decode(sent[0].payload()).unwrap();
        assert_eq!(reply.body, MmcpBody::Pong { reply_to: 77 });
        cancel.cancel();
    }

    #[tokio::test]
    async fn originator_adds_link_cost_and_refloods() {
        let (router, links) = router_with(2, &[1, 3, 4]);
        let (handle, cancel) = start(&router, quiet_config());
        let mut events = handle.subscribe();

        // Originated by a node five hops away, heard through neighbor 1.
        let mut header = control_header(addr(50), addr(2), 2);
        header.last_hop = addr(1);
        let message = MmcpMessage::new(
            9,
            MmcpBody::Originator {
                ping_time_sum: 40,
                connect_config: None,
            },
        );
        inject(&router, &links[0], header, message).await;

        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            event,
            MmcpEvent::RouteUpdated { destination, next_hop, metric: 50, .. }
                if destination == addr(50) && next_hop == addr(1)
        ));
        assert_eq!(router.route_to(addr(50)).unwrap().metric, 50);

        for link in &links[1..] {
            let sent = wait_for_frames(link, 1).await;
            assert_eq!(sent.len(), 1);
            let h = sent[0].header();
            assert_eq!(h.from, addr(50));
            assert_eq!(h.hop_count, 3);
            assert_eq!(h.last_hop, addr(2));
            let body = MmcpMessage::decode(sent[0].payload()).unwrap().body;
            assert!(matches!(body, MmcpBody::Originator { ping_time_sum: 50, .. }));
        }
        // Not sent back where it came from.
        assert!(links[0].sent_frames().is_empty());
        cancel.cancel();
    }

    #[tokio::test]
    async fn worse_originator_is_not_reflooded() {
        let (router, links) = router_with(2, &[1, 3]);
        router.offer_route(addr(50), addr(3), 10);
        let (_handle, cancel) = start(&router, quiet_config());

        let mut header = control_header(addr(50), addr(2), 1);
        header.last_hop = addr(1);
        let message = MmcpMessage::new(
            1,
            MmcpBody::Originator {
                ping_time_sum: 100,
                connect_config: None,
            },
        );
        inject(&router, &links[0], header, message).await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(router.route_to(addr(50)).unwrap().next_hop, addr(3));
        assert!(links[1].sent_frames().is_empty());
        cancel.cancel();
    }

    #[tokio::test]
    async fn hotspot_request_is_acked_and_answered() {
        let (router, links) = router_with(1, &[2]);
        let (handle, cancel) = start(&router, quiet_config());
        let mut events = handle.subscribe();

        let mut header = control_header(addr(2), addr(1), 1);
        header.last_hop = addr(2);
        inject(
            &router,
            &links[0],
            header,
            MmcpMessage::new(5, MmcpBody::HotspotRequest(HotspotRequest::default())),
        )
        .await;

        let sent = wait_for_frames(&links[0], 2).await;
        assert_eq!(sent.len(), 2);
        let ack = MmcpMessage::decode(sent[0].payload()).unwrap();
        assert_eq!(ack.body.what(), WHAT_ACK);
        let response = MmcpMessage::decode(sent[1].payload()).unwrap();
        assert_eq!(
            response.body,
            MmcpBody::HotspotResponse {
                reply_to: 5,
                result: HotspotResult::error(HOTSPOT_UNSUPPORTED),
            }
        );

        let served = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(served, MmcpEvent::HotspotServed { error_code: HOTSPOT_UNSUPPORTED, .. }));
        cancel.cancel();
    }

    #[tokio::test]
    async fn hotspot_request_to_stranger_fails() {
        let (router, _links) = router_with(1, &[2]);
        let (handle, cancel) = start(&router, quiet_config());
        let err = handle
            .request_hotspot(addr(99), HotspotRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, VmeshError::NotNeighbor { .. }));
        cancel.cancel();
    }

    #[tokio::test]
    async fn unanswered_hotspot_request_times_out() {
        let (router, links) = router_with(1, &[2]);
        let (handle, cancel) = start(&router, quiet_config());
        let err = handle
            .request_hotspot(addr(2), HotspotRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, VmeshError::Timeout(_)));
        // The request itself went out.
        assert_eq!(links[0].sent_frames().len(), 1);
        cancel.cancel();
    }

    #[tokio::test]
    async fn garbage_is_counted_not_fatal() {
        let (router, links) = router_with(1, &[2]);
        let (_handle, cancel) = start(&router, quiet_config());

        let mut header = control_header(addr(2), addr(1), 1);
        header.last_hop = addr(2);
        let packet = VirtualPacket::compose(router.pool(), header, &[42, 0, 0, 0, 1]).unwrap();
        router.route(packet, Some(links[0].id())).await;
        inject(&router, &links[0], header, MmcpMessage::new(3, MmcpBody::Ping)).await;

        let sent = wait_for_frames(&links[0], 1).await;
        assert_eq!(sent.len(), 1);
        assert_eq!(router.stats().dropped_malformed.get(), 1);
        cancel.cancel();
    }

    #[tokio::test]
    async fn originate_reaches_every_neighbor() {
        let (router, links) = router_with(1, &[2, 3]);
        let config = MmcpConfig {
            originator_interval: Duration::from_millis(20),
            ..quiet_config()
        };
        let (_handle, cancel) = start(&router, config);

        for link in &links {
            let sent = wait_for_frames(link, 1).await;
            assert!(!sent.is_empty());
            let h = sent[0].header();
            assert_eq!(h.from, addr(1));
            assert_eq!(h.hop_count, 1);
            let body = MmcpMessage::decode(sent[0].payload()).unwrap().body;
            assert!(matches!(body, MmcpBody::Originator { ping_time_sum: 0, .. }));
        }
        cancel.cancel();
    }
}
