use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use vmesh_transport::VirtualAddress;

use super::wire::{ChainSocketInitRequest, ChainSocketInitResponse};
use crate::error::VmeshError;
use crate::router::Router;

#[derive(Debug, Clone)]
pub struct ChainConfig {
    /// Budget for the whole chain set up as seen by the client. Each relay
    /// gets a smaller share for its onward leg so that an inner timeout is
    /// reported as 504 before the client gives up.
    pub connect_timeout: Duration,
    /// Relays a chain may traverse; the relay asked to be number
    /// `max_hops + 1` answers 508.
    pub max_hops: u8,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            max_hops: 16,
        }
    }
}

/// Opens stream connections to virtual destinations, through chain relays
/// when the destination is not a neighbor.
#[derive(Debug, Clone)]
pub struct ChainSocketFactory {
    router: Arc<Router>,
    config: ChainConfig,
}

impl ChainSocketFactory {
    pub fn new(router: Arc<Router>, config: ChainConfig) -> Self {
        Self { router, config }
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    /// Connect to `port` on `dest`.
    ///
    /// Once this returns, the stream carries application bytes only.
    pub async fn connect(&self, dest: VirtualAddress, port: u16) -> Result<TcpStream, VmeshError> {
        self.open(ChainSocketInitRequest {
            dest,
            dest_port: port,
            from: self.router.local_address(),
            hop_count: 1,
        })
        .await
    }

    /// Time allowed for the leg that carries `hop_count`.
    ///
    /// The client's leg (hop 1) gets the full timeout, the relay opening
    /// hop `n` gets `1/n` of it.
    pub(crate) fn leg_budget(&self, hop_count: u8) -> Duration {
        self.config.connect_timeout / u32::from(hop_count.max(1))
    }

    /// Open the next leg of a chain described by `request`.
    pub(crate) async fn open(&self, request: ChainSocketInitRequest) -> Result<TcpStream, VmeshError> {
        let next = self
            .router
            .lookup_next_hop(request.dest, request.dest_port)
            .ok_or(VmeshError::NoRoute { dest: request.dest })?;
        let addr = SocketAddr::new(next.address, next.port);
        let budget = self.leg_budget(request.hop_count);

        let handshake = async {
            let mut stream = TcpStream::connect(addr).await?;
            stream.set_nodelay(true)?;
            if next.is_final_dest {
                tracing::debug!("chain to {}:{} direct at {addr}", request.dest, request.dest_port);
                return Ok(stream);
            }
            request.write_to(&mut stream).await?;
            let response = ChainSocketInitResponse::read_from(&mut stream).await?;
            if !response.is_ok() {
                return Err(VmeshError::ChainInit {
                    status: response.status,
                });
            }
            tracing::debug!(
                "chain to {}:{} via {} (hop {})",
                request.dest,
                request.dest_port,
                next.via,
                request.hop_count
            );
            Ok(stream)
        };

        match tokio::time::timeout(budget, handshake).await {
            Ok(result) => result,
            Err(_) => Err(VmeshError::Timeout(format!(
                "chain to {}:{} via {addr}",
                request.dest, request.dest_port
            ))),
        }
    }
}
