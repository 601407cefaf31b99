//! Chain socket handshake messages.
//!
//! ```text
//! request:  dest_addr:i32 | dest_port:i32 | from_addr:i32 | hop_count:i8   (13 bytes)
//! response: status:i32                                                    (4 bytes)
//! ```

use bytes::{Buf, BufMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use vmesh_transport::VirtualAddress;

use crate::error::{PacketError, VmeshError};

pub const INIT_REQUEST_LEN: usize = 13;
pub const INIT_RESPONSE_LEN: usize = 4;

/// Sent by a client (or relay) to the next relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainSocketInitRequest {
    pub dest: VirtualAddress,
    pub dest_port: u16,
    /// Node that opened the chain.
    pub from: VirtualAddress,
    /// Relays traversed, counting the one this request is sent to.
    pub hop_count: u8,
}

impl ChainSocketInitRequest {
    pub fn to_bytes(&self) -> [u8; INIT_REQUEST_LEN] {
        let mut out = [0u8; INIT_REQUEST_LEN];
        let mut buf = &mut out[..];
        buf.put_i32(self.dest.to_i32());
        buf.put_i32(i32::from(self.dest_port));
        buf.put_i32(self.from.to_i32());
        buf.put_i8(self.hop_count.min(i8::MAX as u8) as i8);
        out
    }

    pub fn from_bytes(data: &[u8; INIT_REQUEST_LEN]) -> Result<Self, PacketError> {
        let mut buf = &data[..];
        let dest = VirtualAddress::from_i32(buf.get_i32());
        let raw_port = buf.get_i32();
        let dest_port = u16::try_from(raw_port).map_err(|_| PacketError::Malformed {
            reason: format!("chain port {raw_port} out of range"),
        })?;
        let from = VirtualAddress::from_i32(buf.get_i32());
        let hop_count = buf.get_i8();
        if hop_count < 0 {
            return Err(PacketError::Malformed {
                reason: format!("negative chain hop count {hop_count}"),
            });
        }
        Ok(Self {
            dest,
            dest_port,
            from,
            hop_count: hop_count as u8,
        })
    }

    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self, VmeshError> {
        let mut data = [0u8; INIT_REQUEST_LEN];
        reader.read_exact(&mut data).await?;
        Ok(Self::from_bytes(&data)?)
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<(), VmeshError> {
        writer.write_all(&self.to_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }
}

/// Answer to an init request. After [`OK`](Self::OK) the stream is a
/// transparent pipe to the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainSocketInitResponse {
    pub status: i32,
}

impl ChainSocketInitResponse {
    pub const OK: i32 = 200;
    /// No route to the destination from this relay.
    pub const NO_ROUTE: i32 = 404;
    /// Onward connection or handshake failed.
    pub const BAD_GATEWAY: i32 = 502;
    pub const GATEWAY_TIMEOUT: i32 = 504;
    /// Hop budget exhausted.
    pub const LOOP_DETECTED: i32 = 508;

    pub fn new(status: i32) -> Self {
        Self { status }
    }

    pub fn is_ok(&self) -> bool {
        self.status == Self::OK
    }

    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self, VmeshError> {
        let status = reader.read_i32().await?;
        Ok(Self { status })
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<(), VmeshError> {
        writer.write_i32(self.status).await?;
        writer.flush().await?;
        Ok(())
    }
}
