//! Link hello exchange.
//!
//! Each side of a fresh link writes a fixed 10-byte hello and reads the
//! remote one, so both learn who sits on the other end:
//!
//! ```text
//! magic:u16 = 0x564D | version:u8 | reserved:u8 | address:i32 | relay_port:u16
//! ```

use std::time::Duration;

use bytes::{Buf, BufMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{TransportError, VirtualAddress};

pub const HELLO_MAGIC: u16 = 0x564D;
pub const HELLO_VERSION: u8 = 1;
pub const HELLO_LEN: usize = 10;

/// What a node announces about itself when a link comes up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hello {
    pub address: VirtualAddress,
    /// Chain-socket relay port on this node, 0 when it does not relay.
    pub relay_port: u16,
}

impl Hello {
    pub fn new(address: VirtualAddress, relay_port: u16) -> Self {
        Self {
            address,
            relay_port,
        }
    }

    pub fn to_bytes(&self) -> [u8; HELLO_LEN] {
        let mut out = [0u8; HELLO_LEN];
        let mut buf = &mut out[..];
        buf.put_u16(HELLO_MAGIC);
        buf.put_u8(HELLO_VERSION);
        buf.put_u8(0);
        buf.put_i32(self.address.to_i32());
        buf.put_u16(self.relay_port);
        out
    }

    pub fn from_bytes(data: &[u8; HELLO_LEN]) -> Result<Self, TransportError> {
        let mut buf = &data[..];
        let magic = buf.get_u16();
        if magic != HELLO_MAGIC {
            return Err(TransportError::Handshake {
                reason: format!("bad magic {magic:#06x}"),
            });
        }
        let version = buf.get_u8();
        if version != HELLO_VERSION {
            return Err(TransportError::Handshake {
                reason: format!("unsupported version {version}"),
            });
        }
        let _reserved = buf.get_u8();
        let address = VirtualAddress::from_i32(buf.get_i32());
        if address.is_broadcast() || address.is_unspecified() {
            return Err(TransportError::Handshake {
                reason: format!("unusable address {address}"),
            });
        }
        let relay_port = buf.get_u16();
        Ok(Self {
            address,
            relay_port,
        })
    }
}

/// Write our hello, then read the remote hello within `timeout`.
pub async fn exchange_hello<S>(
    stream: &mut S,
    local: Hello,
    timeout: Duration,
) -> Result<Hello, TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let exchange = async {
        stream.write_all(&local.to_bytes()).await?;
        stream.flush().await?;
        let mut remote = [0u8; HELLO_LEN];
        stream.read_exact(&mut remote).await?;
        Hello::from_bytes(&remote)
    };

    let remote = tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| TransportError::Handshake {
            reason: format!("no hello within {timeout:?}"),
        })??;

    if remote.address == local.address {
        return Err(TransportError::Handshake {
            reason: format!("remote claims our own address {}", local.address),
        });
    }
    Ok(remote)
}
