use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};

use crate::handshake::{exchange_hello, Hello};
use crate::link::LinkEndpoint;
use crate::{LinkConfig, TransportError};

/// A TCP stream that completed the hello exchange.
#[derive(Debug)]
pub struct EstablishedLink {
    pub stream: TcpStream,
    /// What the remote announced about itself.
    pub remote: Hello,
    pub peer_addr: SocketAddr,
}

impl EstablishedLink {
    /// Real-socket endpoint of the remote node.
    pub fn endpoint(&self) -> LinkEndpoint {
        LinkEndpoint {
            ip: self.peer_addr.ip(),
            relay_port: self.remote.relay_port,
        }
    }
}

/// Accepts incoming links on a TCP port.
pub struct LinkListener {
    listener: TcpListener,
    local: Hello,
    config: LinkConfig,
}

impl LinkListener {
    pub async fn bind(
        addr: SocketAddr,
        local: Hello,
        config: LinkConfig,
    ) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| TransportError::Bind { addr, source })?;
        Ok(Self {
            listener,
            local,
            config,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept the next connection and run the hello exchange on it.
    ///
    /// A failed handshake only affects that connection; the listener
    /// stays usable. Accept loops that must not stall on a silent peer
    /// use [`accept_pending`](Self::accept_pending) instead.
    pub async fn accept(&self) -> Result<EstablishedLink, TransportError> {
        self.accept_pending().await?.handshake().await
    }

    /// Accept the next connection without waiting for its hello.
    pub async fn accept_pending(&self) -> Result<PendingLink, TransportError> {
        let (stream, peer_addr) = self.listener.accept().await?;
        let _ = stream.set_nodelay(true);
        Ok(PendingLink {
            stream,
            peer_addr,
            local: self.local,
            handshake_timeout: self.config.handshake_timeout,
        })
    }
}

/// An accepted TCP stream whose hello exchange has not run yet.
#[derive(Debug)]
pub struct PendingLink {
    stream: TcpStream,
    peer_addr: SocketAddr,
    local: Hello,
    handshake_timeout: Duration,
}

impl PendingLink {
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Run the hello exchange, bounded by the listener's handshake timeout.
    pub async fn handshake(mut self) -> Result<EstablishedLink, TransportError> {
        let remote = exchange_hello(&mut self.stream, self.local, self.handshake_timeout).await?;
        tracing::debug!("accepted link from {} ({})", remote.address, self.peer_addr);
        Ok(EstablishedLink {
            stream: self.stream,
            remote,
            peer_addr: self.peer_addr,
        })
    }
}

/// Open a link to `addr` and run the hello exchange.
pub async fn connect_link(
    addr: SocketAddr,
    local: Hello,
    config: &LinkConfig,
) -> Result<EstablishedLink, TransportError> {
    let mut stream = TcpStream::connect(addr)
        .await
        .map_err(|source| TransportError::Connect { addr, source })?;
    let _ = stream.set_nodelay(true);
    let remote = exchange_hello(&mut stream, local, config.handshake_timeout).await?;
    tracing::debug!("connected link to {} ({addr})", remote.address);
    Ok(EstablishedLink {
        stream,
        remote,
        peer_addr: addr,
    })
}
