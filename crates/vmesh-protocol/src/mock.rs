//! In-memory link for unit tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use vmesh_transport::{Link, LinkId, TransportError, VirtualAddress};

use crate::packet::{VirtualPacket, VirtualPacketHeader};
use crate::pool::PooledBuffer;

/// Records every frame sent on it.
#[derive(Debug)]
pub struct MockLink {
    id: LinkId,
    remote: VirtualAddress,
    sent: Mutex<Vec<Vec<u8>>>,
    closed: AtomicBool,
}

impl MockLink {
    pub fn new(remote: VirtualAddress) -> Self {
        Self {
            id: LinkId::next(),
            remote,
            sent: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn sent_frames(&self) -> Vec<Vec<u8>> {
        self.sent.lock().unwrap().clone()
    }

    /// Decode every sent frame as a packet.
    pub fn sent_packets(&self) -> Vec<VirtualPacket> {
        self.sent_frames()
            .into_iter()
            .map(|frame| VirtualPacket::decode(PooledBuffer::detached(frame)).unwrap())
            .collect()
    }

    pub fn sent_headers(&self) -> Vec<VirtualPacketHeader> {
        self.sent_packets().iter().map(|p| *p.header()).collect()
    }
}

#[async_trait::async_trait]
impl Link for MockLink {
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
        self.sent.lock().unwrap().push(frame.to_vec());
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
