//! Datagram sockets over virtual addresses.
//!
//! A bound socket owns a port on its node's router. Sending wraps the
//! buffer in a packet and routes it; receiving waits on the queue the router
//! delivers into. Delivery is best effort: no route, a full queue or a hop
//! limit silently lose the datagram.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::VmeshError;
use crate::packet::{VirtualPacket, VirtualPacketHeader};
use crate::router::{PortLease, Protocol, RouteOutcome, Router};
use crate::types::{VirtualSocketAddr, DEFAULT_MAX_HOPS};

#[derive(Debug, Clone)]
pub struct DatagramConfig {
    /// Datagrams buffered before new arrivals are dropped.
    pub queue_depth: usize,
    /// Hop budget of sent datagrams.
    pub max_hops: u8,
    pub max_payload: usize,
}

impl Default for DatagramConfig {
    fn default() -> Self {
        Self {
            queue_depth: 64,
            max_hops: DEFAULT_MAX_HOPS,
            max_payload: 64 * 1024,
        }
    }
}

/// A datagram socket bound to a virtual port.
#[derive(Debug)]
pub struct VirtualDatagramSocket {
    router: Arc<Router>,
    local: VirtualSocketAddr,
    config: DatagramConfig,
    rx: tokio::sync::Mutex<mpsc::Receiver<VirtualPacket>>,
    lease: Mutex<Option<PortLease>>,
    closed: CancellationToken,
}

impl VirtualDatagramSocket {
    /// Bind `port` on `router`, or a random free port when `port` is 0.
    pub fn bind(router: Arc<Router>, port: u16, config: DatagramConfig) -> Result<Self, VmeshError> {
        let (tx, rx) = mpsc::channel(config.queue_depth.max(1));
        let lease = router.allocate_port(Protocol::Datagram, port, tx)?;
        let local = VirtualSocketAddr::new(router.local_address(), lease.port());
        tracing::debug!("datagram socket bound on {local}");
        Ok(Self {
            router,
            local,
            config,
            rx: tokio::sync::Mutex::new(rx),
            lease: Mutex::new(Some(lease)),
            closed: CancellationToken::new(),
        })
    }

    pub fn local_addr(&self) -> VirtualSocketAddr {
        self.local
    }

    /// Send `buf` to `dest`. Returns the number of bytes sent.
    pub async fn send_to(&self, buf: &[u8], dest: VirtualSocketAddr) -> Result<usize, VmeshError> {
        if self.closed.is_cancelled() {
            return Err(VmeshError::Closed);
        }
        if buf.len() > self.config.max_payload {
            return Err(VmeshError::PayloadTooLarge {
                size: buf.len(),
                max: self.config.max_payload,
            });
        }
        let header = VirtualPacketHeader::new(
            self.local.addr,
            self.local.port,
            dest.addr,
            dest.port,
            self.config.max_hops,
        );
        let packet = VirtualPacket::compose(self.router.pool(), header, buf)?;
        if let RouteOutcome::Dropped(reason) = self.router.route(packet, None).await {
            tracing::debug!("datagram {} -> {dest} lost: {reason:?}", self.local);
        }
        Ok(buf.len())
    }

    /// Wait for the next datagram. Excess bytes beyond `buf` are discarded.
    pub async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, VirtualSocketAddr), VmeshError> {
        if self.closed.is_cancelled() {
            return Err(VmeshError::Closed);
        }
        let packet = tokio::select! {
            _ = self.closed.cancelled() => return Err(VmeshError::Closed),
            packet = async { self.rx.lock().await.recv().await } => packet,
        };
        let Some(packet) = packet else {
            return Err(VmeshError::Closed);
        };
        let payload = packet.payload();
        let n = payload.len().min(buf.len());
        buf[..n].copy_from_slice(&payload[..n]);
        let header = packet.header();
        Ok((n, VirtualSocketAddr::new(header.from, header.from_port)))
    }

    /// Release the port and wake pending receivers. Idempotent.
    pub fn close(&self) {
        self.closed.cancel();
        let lease = self
            .lease
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(lease) = lease {
            tracing::debug!("datagram socket {} closed", self.local);
            drop(lease);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

impl Drop for VirtualDatagramSocket {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::BufferPool;
    use crate::router::RouterConfig;
    use std::time::Duration;
    use vmesh_transport::VirtualAddress;

    fn router() -> Arc<Router> {
        Router::new(
            VirtualAddress::from_octets(169, 254, 0, 1),
            BufferPool::new(2048, 8),
            RouterConfig::default(),
        )
    }

    #[tokio::test]
    async fn loopback_delivery_keeps_source() {
        let r = router();
        let a = VirtualDatagramSocket::bind(r.clone(), 0, DatagramConfig::default()).unwrap();
        let b = VirtualDatagramSocket::bind(r.clone(), 9000, DatagramConfig::default()).unwrap();

        a.send_to(b"over the mesh", b.local_addr()).await.unwrap();
        let mut buf = [0u8; 64];
        let (n, from) = b.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"over the mesh");
        assert_eq!(from, a.local_addr());
    }

    #[tokio::test]
    async fn short_buffer_truncates() {
        let r = router();
        let a = VirtualDatagramSocket::bind(r.clone(), 9000, DatagramConfig::default()).unwrap();
        a.send_to(b"0123456789", a.local_addr()).await.unwrap();
        let mut buf = [0u8; 4];
        let (n, _) = a.recv_from(&mut buf).await.unwrap();
        assert_eq!(n, 4);
        assert_eq!(&buf, b"0123");
    }

    #[tokio::test]
    async fn close_releases_port_and_wakes_receiver() {
        let r = router();
        let socket = Arc::new(VirtualDatagramSocket::bind(r.clone(), 9000, DatagramConfig::default()).unwrap());

        let waiter = {
            let socket = socket.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 8];
                socket.recv_from(&mut buf).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        socket.close();
        socket.close();

        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(VmeshError::Closed)));
        assert!(!r.is_port_bound(9000));
        assert!(matches!(
            socket.send_to(b"x", socket.local_addr()).await,
            Err(VmeshError::Closed)
        ));
    }

    #[tokio::test]
    async fn oversized_payload_is_refused() {
        let r = router();
        let config = DatagramConfig {
            max_payload: 16,
            ..DatagramConfig::default()
        };
        let a = VirtualDatagramSocket::bind(r, 0, config).unwrap();
        let err = a.send_to(&[0u8; 17], a.local_addr()).await.unwrap_err();
        assert!(matches!(err, VmeshError::PayloadTooLarge { size: 17, max: 16 }));
    }

    #[test]
    fn double_bind_fails() {
        let r = router();
        let _a = VirtualDatagramSocket::bind(r.clone(), 9000, DatagramConfig::default()).unwrap();
        assert!(matches!(
            VirtualDatagramSocket::bind(r, 9000, DatagramConfig::default()),
            Err(VmeshError::PortInUse { port: 9000 })
        ));
    }
}
