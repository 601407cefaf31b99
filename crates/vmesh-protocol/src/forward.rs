//! NAT-style datagram forwarding.
//!
//! A forward rule listens on one datagram socket. Every distinct sender gets
//! its own return-path socket, created on first contact, which carries the
//! sender's datagrams to the target and relays the target's replies back
//! through the listener. Each return path runs its own receive loop.
//!
//! The rule is generic over [`DatagramSocket`], so the same code relays
//! plain UDP, virtual datagrams, or bridges one into the other.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::datagram::{DatagramConfig, VirtualDatagramSocket};
use crate::error::VmeshError;
use crate::router::Router;
use crate::types::VirtualSocketAddr;

/// Largest datagram relayed.
const MAX_DATAGRAM: usize = 64 * 1024;

/// A socket that sends and receives whole datagrams.
#[async_trait::async_trait]
pub trait DatagramSocket: Send + Sync + 'static {
    type Addr: Copy + Eq + Hash + fmt::Display + Send + Sync + 'static;

    async fn send_to(&self, buf: &[u8], target: Self::Addr) -> Result<usize, VmeshError>;

    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, Self::Addr), VmeshError>;
}

#[async_trait::async_trait]
impl DatagramSocket for UdpSocket {
    type Addr = SocketAddr;

    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> Result<usize, VmeshError> {
        Ok(UdpSocket::send_to(self, buf, target).await?)
    }

    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), VmeshError> {
        Ok(UdpSocket::recv_from(self, buf).await?)
    }
}

#[async_trait::async_trait]
impl DatagramSocket for VirtualDatagramSocket {
    type Addr = VirtualSocketAddr;

    async fn send_to(&self, buf: &[u8], target: VirtualSocketAddr) -> Result<usize, VmeshError> {
        VirtualDatagramSocket::send_to(self, buf, target).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, VirtualSocketAddr), VmeshError> {
        VirtualDatagramSocket::recv_from(self, buf).await
    }
}

/// Opens a fresh return-path socket for a new sender.
#[async_trait::async_trait]
pub trait ReturnPathFactory: Send + Sync + 'static {
    type Socket: DatagramSocket;

    async fn open(&self) -> Result<Self::Socket, VmeshError>;
}

/// Return paths over real UDP, bound to an ephemeral port on `bind_ip`.
#[derive(Debug, Clone, Copy)]
pub struct UdpReturnPath {
    pub bind_ip: IpAddr,
}

#[async_trait::async_trait]
impl ReturnPathFactory for UdpReturnPath {
    type Socket = UdpSocket;

    async fn open(&self) -> Result<UdpSocket, VmeshError> {
        Ok(UdpSocket::bind(SocketAddr::new(self.bind_ip, 0)).await?)
    }
}

/// Return paths over the mesh, each on a random virtual port.
#[derive(Debug, Clone)]
pub struct VirtualReturnPath {
    pub router: Arc<Router>,
    pub config: DatagramConfig,
}

#[async_trait::async_trait]
impl ReturnPathFactory for VirtualReturnPath {
    type Socket = VirtualDatagramSocket;

    async fn open(&self) -> Result<VirtualDatagramSocket, VmeshError> {
        VirtualDatagramSocket::bind(self.router.clone(), 0, self.config.clone())
    }
}

/// A running forward rule.
///
/// Return-path entries live as long as the rule.
pub struct UdpForwardRule {
    cancel: CancellationToken,
    tracker: TaskTracker,
    sessions: Arc<AtomicUsize>,
}

impl UdpForwardRule {
    /// Start relaying datagrams from `listener` to `target`.
    pub fn start<L, F>(listener: L, target: <F::Socket as DatagramSocket>::Addr, factory: F) -> Self
    where
        L: DatagramSocket,
        F: ReturnPathFactory,
    {
        Self::start_with_cancel(listener, target, factory, CancellationToken::new())
    }

    /// Like [`start`](Self::start), stopping when `cancel` fires.
    pub fn start_with_cancel<L, F>(
        listener: L,
        target: <F::Socket as DatagramSocket>::Addr,
        factory: F,
        cancel: CancellationToken,
    ) -> Self
    where
        L: DatagramSocket,
        F: ReturnPathFactory,
    {
        let tracker = TaskTracker::new();
        let sessions = Arc::new(AtomicUsize::new(0));
        tracker.spawn(listen_loop(
            Arc::new(listener),
            target,
            factory,
            cancel.clone(),
            tracker.clone(),
            sessions.clone(),
        ));
        Self {
            cancel,
            tracker,
            sessions,
        }
    }

    /// Senders seen so far.
    pub fn session_count(&self) -> usize {
        self.sessions.load(Ordering::Relaxed)
    }

    /// Stop every loop and close every socket. Idempotent.
    pub async fn close(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

impl Drop for UdpForwardRule {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn listen_loop<L, F>(
    listener: Arc<L>,
    target: <F::Socket as DatagramSocket>::Addr,
    factory: F,
    cancel: CancellationToken,
    tracker: TaskTracker,
    session_count: Arc<AtomicUsize>,
) where
    L: DatagramSocket,
    F: ReturnPathFactory,
{
    let mut sessions: HashMap<L::Addr, Arc<F::Socket>> = HashMap::new();
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            received = listener.recv_from(&mut buf) => received,
        };
        let (n, sender) = match received {
            Ok(received) => received,
            Err(VmeshError::Closed) => break,
            Err(e) => {
                tracing::warn!("forward listener receive failed: {e}");
                continue;
            }
        };

        let socket = match sessions.get(&sender) {
            Some(socket) => socket.clone(),
            None => {
                let socket = match factory.open().await {
                    Ok(socket) => Arc::new(socket),
                    Err(e) => {
                        tracing::warn!("no return path for {sender}: {e}");
                        continue;
                    }
                };
                tracing::debug!("new forward session for {sender}");
                sessions.insert(sender, socket.clone());
                session_count.store(sessions.len(), Ordering::Relaxed);
                tracker.spawn(return_loop(
                    socket.clone(),
                    listener.clone(),
                    sender,
                    cancel.clone(),
                ));
                socket
            }
        };

        if let Err(e) = socket.send_to(&buf[..n], target).await {
            tracing::debug!("forward {sender} -> {target} failed: {e}");
        }
    }
    tracing::debug!("forward rule to {target} stopped with {} session(s)", sessions.len());
}

/// Relay replies arriving on a return path back to the original sender.
async fn return_loop<S, L>(socket: Arc<S>, listener: Arc<L>, sender: L::Addr, cancel: CancellationToken)
where
    S: DatagramSocket,
    L: DatagramSocket,
{
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            received = socket.recv_from(&mut buf) => received,
        };
        match received {
            Ok((n, _)) => {
                if let Err(e) = listener.send_to(&buf[..n], sender).await {
                    tracing::debug!("reply to {sender} failed: {e}");
                }
            }
            Err(VmeshError::Closed) => break,
            Err(e) => tracing::debug!("return path for {sender} receive failed: {e}"),
        }
    }
}
