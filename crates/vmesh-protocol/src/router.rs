/// Packet router for the virtual mesh.
///
/// One `Router` per node, shared as `Arc<Router>` by every receive loop,
/// the MMCP service and the local sockets. It owns the neighbor, routing
/// and port tables and decides, per packet, whether to deliver it to a
/// local port, forward it to a neighbor, fan it out, or drop it.
///
/// Tables sit behind std locks that are never held across an await.
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::{Duration, Instant};

use rand::Rng;
use serde::Serialize;
use tokio::sync::mpsc;
use vmesh_transport::{now_ms, Link, LinkEndpoint, LinkId, VirtualAddress};

use crate::error::VmeshError;
use crate::link_quality::{LinkQuality, Liveness};
use crate::packet::VirtualPacket;
use crate::pool::BufferPool;
use crate::stats::RouterStats;
use crate::types::{CONTROL_PORT, EPHEMERAL_PORTS};

/// Queue feeding a locally bound port.
pub type PacketSender = mpsc::Sender<VirtualPacket>;

// ── Configuration ─────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Routes not refreshed for this long are ignored and swept.
    pub route_timeout: Duration,
    /// A different next hop must beat the current metric by more than this.
    pub route_hysteresis: Duration,
    /// Link cost used until a neighbor has an RTT sample.
    pub default_rtt: Duration,
    pub neighbor_stale: Duration,
    pub neighbor_departed: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            route_timeout: Duration::from_secs(30),
            route_hysteresis: Duration::from_millis(5),
            default_rtt: Duration::from_millis(50),
            neighbor_stale: Duration::from_secs(10),
            neighbor_departed: Duration::from_secs(30),
        }
    }
}

// ── Tables ────────────────────────────────────────────────────────────

/// A directly linked node.
#[derive(Debug)]
pub struct Neighbor {
    pub address: VirtualAddress,
    pub link: Arc<dyn Link>,
    pub endpoint: LinkEndpoint,
    quality: Mutex<LinkQuality>,
}

impl Neighbor {
    pub fn quality(&self) -> LinkQuality {
        self.quality
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Route to a node beyond the direct neighbors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutingEntry {
    pub next_hop: VirtualAddress,
    /// Summed per-hop latency in milliseconds.
    pub metric: u32,
    pub last_updated: Instant,
}

/// Result of offering a route to the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteUpdate {
    Inserted,
    /// A different next hop took over.
    Replaced { previous: VirtualAddress },
    /// Same next hop, metric and timestamp updated.
    Refreshed,
    Rejected,
}

impl RouteUpdate {
    pub fn accepted(&self) -> bool {
        !matches!(self, RouteUpdate::Rejected)
    }
}

/// Where to open a real connection to reach a virtual destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NextHop {
    pub address: IpAddr,
    pub port: u16,
    /// `address:port` is the destination itself, not a relay.
    pub is_final_dest: bool,
    pub via: VirtualAddress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Datagram,
    Control,
}

struct PortBinding {
    protocol: Protocol,
    id: u64,
    tx: PacketSender,
}

// ── Routing decisions ─────────────────────────────────────────────────

/// What happened to a routed packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Delivered { port: u16 },
    Forwarded { next_hop: VirtualAddress },
    Broadcast { forwarded: usize, delivered: bool },
    Dropped(DropReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    NoRoute,
    HopLimit,
    UnboundPort,
    QueueFull,
    LinkError,
}

// ── Snapshots ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct NeighborInfo {
    pub address: VirtualAddress,
    pub ip: IpAddr,
    pub relay_port: u16,
    pub srtt_ms: Option<u64>,
    pub liveness: Liveness,
}

#[derive(Debug, Clone, Serialize)]
pub struct RouteInfo {
    pub destination: VirtualAddress,
    pub next_hop: VirtualAddress,
    pub metric: u32,
    pub age_ms: u64,
}

// ── Router ────────────────────────────────────────────────────────────

pub struct Router {
    local: VirtualAddress,
    pool: BufferPool,
    config: RouterConfig,
    neighbors: RwLock<HashMap<VirtualAddress, Arc<Neighbor>>>,
    routes: RwLock<HashMap<VirtualAddress, RoutingEntry>>,
    ports: Mutex<HashMap<u16, PortBinding>>,
    next_binding: AtomicU64,
    stats: RouterStats,
}

impl Router {
    pub fn new(local: VirtualAddress, pool: BufferPool, config: RouterConfig) -> Arc<Self> {
        Arc::new(Self {
            local,
            pool,
            config,
            neighbors: RwLock::new(HashMap::new()),
            routes: RwLock::new(HashMap::new()),
            ports: Mutex::new(HashMap::new()),
            next_binding: AtomicU64::new(1),
            stats: RouterStats::default(),
        })
    }

    pub fn local_address(&self) -> VirtualAddress {
        self.local
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn stats(&self) -> &RouterStats {
        &self.stats
    }

    /// Route a packet.
    ///
    /// `arrival` is the link it came in on, `None` for locally originated
    /// packets. Drops are counted and logged, never surfaced as errors.
    pub async fn route(&self, mut packet: VirtualPacket, arrival: Option<LinkId>) -> RouteOutcome {
        let header = *packet.header();

        if header.to.is_broadcast() {
            return self.broadcast(packet, arrival).await;
        }
        if header.to == self.local {
            return self.deliver(packet);
        }
        if header.hop_count >= header.max_hops {
            self.stats.dropped_hop_limit.inc();
            tracing::debug!(
                "drop {} -> {}: hop limit {} reached",
                header.from,
                header.to,
                header.max_hops
            );
            return RouteOutcome::Dropped(DropReason::HopLimit);
        }
        let Some(neighbor) = self.next_neighbor(header.to) else {
            self.stats.dropped_no_route.inc();
            tracing::debug!("drop {} -> {}: no route", header.from, header.to);
            return RouteOutcome::Dropped(DropReason::NoRoute);
        };

        packet.mark_hop(self.local);
        if self.send_via(&neighbor, &mut packet).await {
            self.stats.forwarded.inc();
            RouteOutcome::Forwarded {
                next_hop: neighbor.address,
            }
        } else {
            RouteOutcome::Dropped(DropReason::LinkError)
        }
    }

    /// Forward a copy to every neighbor except the arrival link, then
    /// deliver locally when the packet came from a link.
    async fn broadcast(&self, packet: VirtualPacket, arrival: Option<LinkId>) -> RouteOutcome {
        let header = *packet.header();
        let mut forwarded = 0;

        if header.hop_count < header.max_hops {
            let targets: Vec<Arc<Neighbor>> = self
                .read_neighbors()
                .values()
                .filter(|n| Some(n.link.id()) != arrival)
                .cloned()
                .collect();
            for neighbor in targets {
                let mut copy = packet.duplicate(&self.pool);
                copy.mark_hop(self.local);
                if self.send_via(&neighbor, &mut copy).await {
                    self.stats.forwarded.inc();
                    forwarded += 1;
                }
            }
        } else {
            self.stats.dropped_hop_limit.inc();
        }

        let delivered = arrival.is_some()
            && matches!(self.deliver(packet), RouteOutcome::Delivered { .. });
        RouteOutcome::Broadcast {
            forwarded,
            delivered,
        }
    }

    fn deliver(&self, packet: VirtualPacket) -> RouteOutcome {
        let port = packet.header().to_port;
        let tx = self
            .lock_ports()
            .get(&port)
            .map(|binding| binding.tx.clone());
        let Some(tx) = tx else {
            self.stats.dropped_unbound_port.inc();
            tracing::debug!("drop packet from {}: port {port} not bound", packet.header().from);
            return RouteOutcome::Dropped(DropReason::UnboundPort);
        };
        match tx.try_send(packet) {
            Ok(()) => {
                self.stats.delivered.inc();
                RouteOutcome::Delivered { port }
            }
            Err(_) => {
                self.stats.dropped_queue_full.inc();
                tracing::debug!("drop packet for port {port}: receive queue full or closed");
                RouteOutcome::Dropped(DropReason::QueueFull)
            }
        }
    }

    async fn send_via(&self, neighbor: &Neighbor, packet: &mut VirtualPacket) -> bool {
        let wire = match packet.wire_bytes() {
            Ok(wire) => wire,
            Err(e) => {
                self.stats.dropped_malformed.inc();
                tracing::warn!("cannot encode packet for {}: {e}", neighbor.address);
                return false;
            }
        };
        match neighbor.link.send_frame(&wire).await {
            Ok(()) => true,
            Err(e) => {
                self.stats.dropped_link_error.inc();
                tracing::warn!("send to {} over {} failed: {e}", neighbor.address, neighbor.link.id());
                false
            }
        }
    }

    /// Neighbor that packets for `dest` should be handed to.
    fn next_neighbor(&self, dest: VirtualAddress) -> Option<Arc<Neighbor>> {
        let neighbors = self.read_neighbors();
        if let Some(neighbor) = neighbors.get(&dest) {
            return Some(neighbor.clone());
        }
        let entry = self.live_route(dest, Instant::now())?;
        neighbors.get(&entry.next_hop).cloned()
    }

    fn live_route(&self, dest: VirtualAddress, now: Instant) -> Option<RoutingEntry> {
        let routes = self.routes.read().unwrap_or_else(PoisonError::into_inner);
        routes
            .get(&dest)
            .filter(|e| now.saturating_duration_since(e.last_updated) < self.config.route_timeout)
            .copied()
    }

    /// Resolve where a real stream connection for `dest:port` should go.
    ///
    /// A neighbor (or this node) is reached directly on `port`; anything
    /// further goes to the chain relay of the next hop. `None` when there
    /// is no route or the next hop does not relay.
    pub fn lookup_next_hop(&self, dest: VirtualAddress, port: u16) -> Option<NextHop> {
        if dest == self.local {
            return Some(NextHop {
                address: IpAddr::V4(Ipv4Addr::LOCALHOST),
                port,
                is_final_dest: true,
                via: self.local,
            });
        }
        let neighbors = self.read_neighbors();
        if let Some(neighbor) = neighbors.get(&dest) {
            return Some(NextHop {
                address: neighbor.endpoint.ip,
                port,
                is_final_dest: true,
                via: neighbor.address,
            });
        }
        let entry = self.live_route(dest, Instant::now())?;
        let relay = neighbors.get(&entry.next_hop)?;
        if relay.endpoint.relay_port == 0 {
            return None;
        }
        Some(NextHop {
            address: relay.endpoint.ip,
            port: relay.endpoint.relay_port,
            is_final_dest: false,
            via: relay.address,
        })
    }

    // ── Ports ─────────────────────────────────────────────────────────

    /// Bind a local port to `tx`.
    ///
    /// Datagram sockets get `preferred`, or a random free ephemeral port
    /// when it is 0. The control protocol always gets [`CONTROL_PORT`].
    pub fn allocate_port(
        self: &Arc<Self>,
        protocol: Protocol,
        preferred: u16,
        tx: PacketSender,
    ) -> Result<PortLease, VmeshError> {
        let mut ports = self.lock_ports();
        let port = match protocol {
            Protocol::Control => {
                if ports.contains_key(&CONTROL_PORT) {
                    return Err(VmeshError::PortInUse { port: CONTROL_PORT });
                }
                CONTROL_PORT
            }
            Protocol::Datagram if preferred == CONTROL_PORT => {
                pick_ephemeral(&ports).ok_or(VmeshError::NoFreePort)?
            }
            Protocol::Datagram => {
                if ports.contains_key(&preferred) {
                    return Err(VmeshError::PortInUse { port: preferred });
                }
                preferred
            }
        };
        let id = self.next_binding.fetch_add(1, Ordering::Relaxed);
        ports.insert(port, PortBinding { protocol, id, tx });
        Ok(PortLease {
            router: Arc::downgrade(self),
            protocol,
            port,
            id,
        })
    }

    /// Release `port` if it is bound for `protocol`.
    pub fn deallocate_port(&self, protocol: Protocol, port: u16) -> bool {
        let mut ports = self.lock_ports();
        match ports.get(&port) {
            Some(binding) if binding.protocol == protocol => {
                ports.remove(&port);
                true
            }
            _ => false,
        }
    }

    fn release_binding(&self, port: u16, id: u64) {
        let mut ports = self.lock_ports();
        if ports.get(&port).is_some_and(|b| b.id == id) {
            ports.remove(&port);
        }
    }

    pub fn is_port_bound(&self, port: u16) -> bool {
        self.lock_ports().contains_key(&port)
    }

    // ── Neighbors ─────────────────────────────────────────────────────

    /// Register a neighbor. Returns the entry it replaced, whose link the
    /// caller should close.
    pub fn add_neighbor(
        &self,
        link: Arc<dyn Link>,
        endpoint: LinkEndpoint,
    ) -> Option<Arc<Neighbor>> {
        let address = link.remote();
        let neighbor = Arc::new(Neighbor {
            address,
            link,
            endpoint,
            quality: Mutex::new(LinkQuality::new()),
        });
        tracing::info!("{}: neighbor {address} up at {}", self.local, endpoint.ip);
        self.neighbors
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(address, neighbor)
    }

    /// Remove `address` if its current link is `link_id`, along with every
    /// route through it.
    pub fn remove_neighbor(&self, address: VirtualAddress, link_id: LinkId) -> bool {
        {
            let mut neighbors = self.neighbors.write().unwrap_or_else(PoisonError::into_inner);
            match neighbors.get(&address) {
                Some(n) if n.link.id() == link_id => {
                    neighbors.remove(&address);
                }
                _ => return false,
            }
        }
        let mut routes = self.routes.write().unwrap_or_else(PoisonError::into_inner);
        let before = routes.len();
        routes.retain(|_, e| e.next_hop != address);
        tracing::info!(
            "{}: neighbor {address} down, {} route(s) dropped",
            self.local,
            before - routes.len()
        );
        true
    }

    pub fn neighbor(&self, address: VirtualAddress) -> Option<Arc<Neighbor>> {
        self.read_neighbors().get(&address).cloned()
    }

    pub fn is_neighbor(&self, address: VirtualAddress) -> bool {
        self.read_neighbors().contains_key(&address)
    }

    pub fn neighbor_addresses(&self) -> Vec<VirtualAddress> {
        self.read_neighbors().keys().copied().collect()
    }

    /// Note that a frame just arrived from `address`.
    pub fn touch_neighbor(&self, address: VirtualAddress) {
        if let Some(n) = self.read_neighbors().get(&address) {
            n.quality.lock().unwrap_or_else(PoisonError::into_inner).touch();
        }
    }

    /// Fold an RTT sample into the neighbor's estimate. Returns the new
    /// smoothed RTT.
    pub fn record_rtt(&self, address: VirtualAddress, rtt: Duration) -> Option<Duration> {
        let neighbors = self.read_neighbors();
        let neighbor = neighbors.get(&address)?;
        let srtt = neighbor
            .quality
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record_rtt(rtt);
        Some(srtt)
    }

    /// Cost of the link to `address` in milliseconds, at least 1.
    pub fn link_cost(&self, address: VirtualAddress) -> u32 {
        let srtt = self
            .neighbor(address)
            .and_then(|n| n.quality().srtt())
            .unwrap_or(self.config.default_rtt);
        (srtt.as_millis() as u32).max(1)
    }

    /// Neighbors not heard from for the departed threshold.
    pub fn departed_neighbors_at(&self, now: u64) -> Vec<Arc<Neighbor>> {
        self.read_neighbors()
            .values()
            .filter(|n| {
                n.quality().liveness_at(
                    now,
                    self.config.neighbor_stale,
                    self.config.neighbor_departed,
                ) == Liveness::Departed
            })
            .cloned()
            .collect()
    }

    pub fn departed_neighbors(&self) -> Vec<Arc<Neighbor>> {
        self.departed_neighbors_at(now_ms())
    }

    pub fn neighbors(&self) -> Vec<NeighborInfo> {
        let now = now_ms();
        let mut out: Vec<NeighborInfo> = self
            .read_neighbors()
            .values()
            .map(|n| {
                let quality = n.quality();
                NeighborInfo {
                    address: n.address,
                    ip: n.endpoint.ip,
                    relay_port: n.endpoint.relay_port,
                    srtt_ms: quality.srtt().map(|d| d.as_millis() as u64),
                    liveness: quality.liveness_at(
                        now,
                        self.config.neighbor_stale,
                        self.config.neighbor_departed,
                    ),
                }
            })
            .collect();
        out.sort_by_key(|n| n.address);
        out
    }

    // ── Routes ────────────────────────────────────────────────────────

    pub fn offer_route(&self, dest: VirtualAddress, next_hop: VirtualAddress, metric: u32) -> RouteUpdate {
        self.offer_route_at(dest, next_hop, metric, Instant::now())
    }

    /// Offer a route at a specific time (for testing).
    ///
    /// Accepted when there is no live entry, when it comes from the current
    /// next hop, or when it beats the current metric by more than the
    /// hysteresis.
    pub fn offer_route_at(
        &self,
        dest: VirtualAddress,
        next_hop: VirtualAddress,
        metric: u32,
        now: Instant,
    ) -> RouteUpdate {
        if dest == self.local || dest.is_broadcast() {
            return RouteUpdate::Rejected;
        }
        let fresh = RoutingEntry {
            next_hop,
            metric,
            last_updated: now,
        };
        let mut routes = self.routes.write().unwrap_or_else(PoisonError::into_inner);
        let Some(current) = routes.get_mut(&dest) else {
            routes.insert(dest, fresh);
            return RouteUpdate::Inserted;
        };

        if current.next_hop == next_hop {
            *current = fresh;
            return RouteUpdate::Refreshed;
        }
        let expired =
            now.saturating_duration_since(current.last_updated) >= self.config.route_timeout;
        let hysteresis = self.config.route_hysteresis.as_millis() as u32;
        if expired || metric.saturating_add(hysteresis) < current.metric {
            let previous = current.next_hop;
            *current = fresh;
            return RouteUpdate::Replaced { previous };
        }
        RouteUpdate::Rejected
    }

    pub fn route_to(&self, dest: VirtualAddress) -> Option<RoutingEntry> {
        self.routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&dest)
            .copied()
    }

    /// Remove routes older than the route timeout. Returns their destinations.
    pub fn expire_routes_at(&self, now: Instant) -> Vec<VirtualAddress> {
        let timeout = self.config.route_timeout;
        let mut expired = Vec::new();
        self.routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|dest, e| {
                let keep = now.saturating_duration_since(e.last_updated) < timeout;
                if !keep {
                    expired.push(*dest);
                }
                keep
            });
        expired
    }

    pub fn expire_routes(&self) -> Vec<VirtualAddress> {
        self.expire_routes_at(Instant::now())
    }

    pub fn routes(&self) -> Vec<RouteInfo> {
        let now = Instant::now();
        let mut out: Vec<RouteInfo> = self
            .routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(dest, e)| RouteInfo {
                destination: *dest,
                next_hop: e.next_hop,
                metric: e.metric,
                age_ms: now.saturating_duration_since(e.last_updated).as_millis() as u64,
            })
            .collect();
        out.sort_by_key(|r| r.destination);
        out
    }

    // ── Internals ─────────────────────────────────────────────────────

    fn read_neighbors(
        &self,
    ) -> std::sync::RwLockReadGuard<'_, HashMap<VirtualAddress, Arc<Neighbor>>> {
        self.neighbors.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_ports(&self) -> std::sync::MutexGuard<'_, HashMap<u16, PortBinding>> {
        self.ports.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("local", &self.local)
            .field("neighbors", &self.read_neighbors().len())
            .finish_non_exhaustive()
    }
}

fn pick_ephemeral(ports: &HashMap<u16, PortBinding>) -> Option<u16> {
    let (low, high) = (*EPHEMERAL_PORTS.start(), *EPHEMERAL_PORTS.end());
    let span = u32::from(high - low) + 1;
    let start = rand::rng().random_range(0..span);
    (0..span)
        .map(|i| low + ((start + i) % span) as u16)
        .find(|port| !ports.contains_key(port))
}

/// Ownership of a bound port; dropping it releases the port.
///
/// Release is keyed on the binding, so a lease never frees a port that was
/// deallocated and rebound by someone else in the meantime.
#[derive(Debug)]
pub struct PortLease {
    router: Weak<Router>,
    protocol: Protocol,
    port: u16,
    id: u64,
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        if let Some(router) = self.router.upgrade() {
            router.release_binding(self.port, self.id);
        }
    }
}
