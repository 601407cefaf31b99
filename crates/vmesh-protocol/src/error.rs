use std::io;

use vmesh_transport::{TransportError, VirtualAddress};

/// Packet codec errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PacketError {
    #[error("buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall { needed: usize, available: usize },

    #[error("truncated packet: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("malformed packet: {reason}")]
    Malformed { reason: String },

    #[error("payload of {size} bytes overflows buffer ({available} bytes left)")]
    PayloadOverflow { size: usize, available: usize },
}

/// MMCP control message codec errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MmcpError {
    #[error("truncated control message: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("unknown control message type {0}")]
    UnknownMessageType(u8),

    #[error("malformed control message: {reason}")]
    Malformed { reason: String },
}

/// Protocol-level errors for vmesh.
///
/// Wraps transport and codec errors and adds the failures surfaced to
/// socket callers.
#[derive(Debug, thiserror::Error)]
pub enum VmeshError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("{0}")]
    Malformed(#[from] PacketError),

    #[error("{0}")]
    Control(#[from] MmcpError),

    #[error("port {port} is already in use")]
    PortInUse { port: u16 },

    #[error("no free port left")]
    NoFreePort,

    #[error("no route to {dest}")]
    NoRoute { dest: VirtualAddress },

    #[error("{dest} is not a neighbor")]
    NotNeighbor { dest: VirtualAddress },

    #[error("chain socket setup failed with status {status}")]
    ChainInit { status: i32 },

    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("resource is closed")]
    Closed,
}
