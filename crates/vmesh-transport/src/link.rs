use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::framing::write_frame;
use crate::{TransportError, VirtualAddress};

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of one opened link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(u64);

impl LinkId {
    pub fn next() -> Self {
        Self(NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link#{}", self.0)
    }
}

/// Where a neighbor can be reached with real sockets on the shared link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkEndpoint {
    /// The neighbor's IP address on the physical link.
    pub ip: IpAddr,
    /// Chain-socket relay port, 0 when the neighbor does not relay.
    pub relay_port: u16,
}

/// Sending half of an established point-to-point link.
///
/// Receiving is driven by whoever owns the read half; see
/// [`read_frame_into`](crate::read_frame_into).
#[async_trait::async_trait]
pub trait Link: Send + Sync + fmt::Debug {
    fn id(&self) -> LinkId;

    /// Virtual address of the node at the other end.
    fn remote(&self) -> VirtualAddress;

    /// Send one frame. Concurrent callers are serialized.
    async fn send_frame(&self, frame: &[u8]) -> Result<(), TransportError>;

    fn is_closed(&self) -> bool;

    /// Close the link. Idempotent.
    async fn close(&self);
}

/// A [`Link`] over the write half of any byte stream.
pub struct StreamLink<W> {
    id: LinkId,
    remote: VirtualAddress,
    writer: Mutex<W>,
    closed: AtomicBool,
    max_frame_size: usize,
}

impl<W> StreamLink<W> {
    pub fn new(remote: VirtualAddress, writer: W, max_frame_size: usize) -> Self {
        Self {
            id: LinkId::next(),
            remote,
            writer: Mutex::new(writer),
            closed: AtomicBool::new(false),
            max_frame_size,
        }
    }
}

impl<W> fmt::Debug for StreamLink<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamLink")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

#[async_trait::async_trait]
impl<W> Link for StreamLink<W>
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    fn id(&self) -> LinkId {
        self.id
    }

    fn remote(&self) -> VirtualAddress {
        self.remote
    }

    async fn send_frame(&self, frame: &[u8]) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let mut writer = self.writer.lock().await;
        match write_frame(&mut *writer, frame, self.max_frame_size).await {
            Err(TransportError::Io(e)) => {
                // Broken stream: nothing more will get through.
                self.closed.store(true, Ordering::SeqCst);
                Err(TransportError::Io(e))
            }
            other => other,
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            tracing::debug!("{}: shutdown of {} failed: {e}", self.id, self.remote);
        }
    }
}
