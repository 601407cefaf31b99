use std::io;
use std::net::SocketAddr;

/// Errors returned by the vmesh transport layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("connection to {addr} failed: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("link i/o failed: {0}")]
    Io(#[from] io::Error),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("link handshake failed: {reason}")]
    Handshake { reason: String },

    #[error("link is closed")]
    Closed,

    #[error("invalid virtual address: {0}")]
    InvalidAddress(String),
}
