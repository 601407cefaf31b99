/// Chain socket relay.
///
/// Accepts real stream connections, reads one init request, opens the next
/// leg toward the requested destination and answers with a status. After a
/// 200 the two streams are spliced byte for byte until either side closes.
use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::client::ChainSocketFactory;
use super::wire::{ChainSocketInitRequest, ChainSocketInitResponse};
use crate::error::VmeshError;

pub struct ChainSocketServer {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl ChainSocketServer {
    /// Bind the relay on `addr` and start accepting.
    pub async fn bind(
        addr: SocketAddr,
        factory: ChainSocketFactory,
        cancel: CancellationToken,
    ) -> Result<Self, VmeshError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| vmesh_transport::TransportError::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;
        tracing::info!("chain relay listening on {local_addr}");

        let tracker = TaskTracker::new();
        tracker.spawn(accept_loop(listener, factory, cancel.clone(), tracker.clone()));
        Ok(Self {
            local_addr,
            cancel,
            tracker,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Port advertised to neighbors in the link hello.
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Stop accepting and tear down every open splice.
    pub async fn close(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

impl Drop for ChainSocketServer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn accept_loop(
    listener: TcpListener,
    factory: ChainSocketFactory,
    cancel: CancellationToken,
    tracker: TaskTracker,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                let factory = factory.clone();
                let cancel = cancel.clone();
                tracker.spawn(async move {
                    if let Err(e) = handle_connection(stream, factory, cancel).await {
                        tracing::debug!("chain relay: {peer}: {e}");
                    }
                });
            }
            Err(e) => tracing::warn!("chain relay accept error: {e}"),
        }
    }
    tracing::debug!("chain relay stopped");
}

async fn handle_connection(
    mut inbound: TcpStream,
    factory: ChainSocketFactory,
    cancel: CancellationToken,
) -> Result<(), VmeshError> {
    inbound.set_nodelay(true)?;
    let budget = factory.config().connect_timeout;
    let request = match tokio::time::timeout(budget, ChainSocketInitRequest::read_from(&mut inbound)).await {
        Ok(request) => request?,
        Err(_) => return Err(VmeshError::Timeout("chain init request".into())),
    };

    if request.hop_count > factory.config().max_hops {
        tracing::debug!(
            "chain to {}:{} from {} exceeded {} hops",
            request.dest,
            request.dest_port,
            request.from,
            request.hop_count
        );
        return refuse(&mut inbound, ChainSocketInitResponse::LOOP_DETECTED).await;
    }

    let onward = ChainSocketInitRequest {
        hop_count: request.hop_count.saturating_add(1),
        ..request
    };
    let outbound = match factory.open(onward).await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::debug!(
                "chain to {}:{} from {} failed: {e}",
                request.dest,
                request.dest_port,
                request.from
            );
            return refuse(&mut inbound, status_for(&e)).await;
        }
    };

    ChainSocketInitResponse::new(ChainSocketInitResponse::OK)
        .write_to(&mut inbound)
        .await?;
    tracing::debug!(
        "chain {} -> {}:{} established",
        request.from,
        request.dest,
        request.dest_port
    );
    splice(inbound, outbound, cancel).await;
    Ok(())
}

async fn refuse(stream: &mut TcpStream, status: i32) -> Result<(), VmeshError> {
    ChainSocketInitResponse::new(status).write_to(stream).await?;
    stream.shutdown().await?;
    Ok(())
}

fn status_for(error: &VmeshError) -> i32 {
    match error {
        VmeshError::NoRoute { .. } => ChainSocketInitResponse::NO_ROUTE,
        VmeshError::Timeout(_) => ChainSocketInitResponse::GATEWAY_TIMEOUT,
        VmeshError::ChainInit { status } => *status,
        _ => ChainSocketInitResponse::BAD_GATEWAY,
    }
}

/// Copy bytes both ways. When either direction ends, both stop.
async fn splice<A, B>(a: A, b: B, cancel: CancellationToken)
where
    A: AsyncRead + AsyncWrite,
    B: AsyncRead + AsyncWrite,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let a_to_b = async {
        let copied = tokio::io::copy(&mut a_read, &mut b_write).await;
        let _ = b_write.shutdown().await;
        copied
    };
    let b_to_a = async {
        let copied = tokio::io::copy(&mut b_read, &mut a_write).await;
        let _ = a_write.shutdown().await;
        copied
    };

    tokio::select! {
        _ = cancel.cancelled() => {}
        r = a_to_b => tracing::trace!("chain splice closed upstream: {r:?}"),
        r = b_to_a => tracing::trace!("chain splice closed downstream: {r:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Arc;
    use std::time::Duration;

    use vmesh_transport::{LinkEndpoint, VirtualAddress};

    use crate::chain::ChainConfig;
    use crate::mock::MockLink;
    use crate::pool::BufferPool;
    use crate::router::{Router, RouterConfig};

    fn addr(last: u8) -> VirtualAddress {
        VirtualAddress::from_octets(169, 254, 9, last)
    }

    /// Relay whose only route to `addr(5)` goes through a neighbor relay
    /// listening on `next_relay`.
    async fn relay_towards(next_relay: u16, config: ChainConfig) -> ChainSocketServer {
        let router = Router::new(addr(1), BufferPool::new(256, 8), RouterConfig::default());
        router.add_neighbor(
            Arc::new(MockLink::new(addr(2))),
            LinkEndpoint {
                ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
                relay_port: next_relay,
            },
        );
        router.offer_route(addr(5), addr(2), 30);
        let factory = ChainSocketFactory::new(router, config);
        ChainSocketServer::bind("127.0.0.1:0".parse().unwrap(), factory, CancellationToken::new())
            .await
            .unwrap()
    }

    async fn ask(relay: &ChainSocketServer, hop_count: u8) -> ChainSocketInitResponse {
        let mut stream = TcpStream::connect(relay.local_addr()).await.unwrap();
        ChainSocketInitRequest {
            dest: addr(5),
            dest_port: 80,
            from: addr(9),
            hop_count,
        }
        .write_to(&mut stream)
        .await
        .unwrap();
        ChainSocketInitResponse::read_from(&mut stream).await.unwrap()
    }

    #[tokio::test]
    async fn stalled_onward_leg_reports_gateway_timeout_in_time() {
        // Accepts connections but never answers an init request.
        let silent = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = ChainConfig {
            connect_timeout: Duration::from_secs(2),
            max_hops: 16,
        };
        let relay = relay_towards(silent.local_addr().unwrap().port(), config).await;

        let response = tokio::time::timeout(Duration::from_millis(1900), ask(&relay, 1))
            .await
            .expect("relay answered after the client budget");
        assert_eq!(response.status, ChainSocketInitResponse::GATEWAY_TIMEOUT);
        relay.close().await;
    }

    #[tokio::test]
    async fn max_hops_counts_relays() {
        let config = ChainConfig {
            connect_timeout: Duration::from_secs(2),
            max_hops: 1,
        };
        let relay = relay_towards(1, config).await;

        let response = ask(&relay, 2).await;
        assert_eq!(response.status, ChainSocketInitResponse::LOOP_DETECTED);
        // Hop 1 passes the check and fails onward instead.
        let response = ask(&relay, 1).await;
        assert_ne!(response.status, ChainSocketInitResponse::LOOP_DETECTED);
        relay.close().await;
    }

    #[test]
    fn errors_map_to_statuses() {
        let dest = vmesh_transport::VirtualAddress::from_octets(169, 254, 3, 3);
        assert_eq!(status_for(&VmeshError::NoRoute { dest }), 404);
        assert_eq!(status_for(&VmeshError::Timeout("x".into())), 504);
        assert_eq!(status_for(&VmeshError::ChainInit { status: 508 }), 508);
        assert_eq!(status_for(&VmeshError::Closed), 502);
    }

    #[tokio::test]
    async fn splice_stops_when_one_side_closes() {
        use tokio::io::AsyncReadExt;

        let (near, mut near_peer) = tokio::io::duplex(64);
        let (far, mut far_peer) = tokio::io::duplex(64);
        let task = tokio::spawn(splice(near, far, CancellationToken::new()));

        near_peer.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        far_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        far_peer.write_all(b"pong").await.unwrap();
        near_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        drop(near_peer);
        tokio::time::timeout(std::time::Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
