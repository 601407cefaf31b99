//! Length-prefixed framing for byte-stream links.
//!
//! Each frame is `len:u32` (big-endian) followed by `len` bytes.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::TransportError;

/// Size of the frame length prefix.
pub const FRAME_LEN_PREFIX: usize = 4;

/// Write one frame and flush.
pub async fn write_frame<W>(writer: &mut W, data: &[u8], max_size: usize) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    if data.len() > max_size {
        return Err(TransportError::FrameTooLarge {
            size: data.len(),
            max: max_size,
        });
    }
    let len = (data.len() as u32).to_be_bytes();
    writer.write_all(&len).await?;
    writer.write_all(data).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame into `buf`, replacing its contents.
///
/// Returns `Ok(false)` when the stream ended cleanly before a new frame.
/// An oversized frame is skipped so the stream stays aligned, and
/// reported as [`TransportError::FrameTooLarge`]; the caller may keep reading.
pub async fn read_frame_into<R>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    max_size: usize,
) -> Result<bool, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; FRAME_LEN_PREFIX];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(false),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_size {
        let skipped = tokio::io::copy(&mut (&mut *reader).take(len as u64), &mut tokio::io::sink()).await?;
        if skipped < len as u64 {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
        }
        return Err(TransportError::FrameTooLarge {
            size: len,
            max: max_size,
        });
    }

    buf.clear();
    buf.resize(len, 0);
    reader.read_exact(buf).await?;
    Ok(true)
}
