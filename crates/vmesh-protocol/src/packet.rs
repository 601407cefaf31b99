//! Virtual packet format.
//!
//! Big-endian header, 26 bytes:
//!
//! ```text
//! to_addr:i32 | to_port:i32 | from_addr:i32 | from_port:i32 |
//! last_hop:i32 | hop_count:i8 | max_hops:i8 | payload_size:i32
//! ```
//!
//! A [`VirtualPacket`] is a view over a pooled buffer: the decoded header
//! plus the offset of the payload inside the buffer. Forwarding rewrites the
//! header in front of the payload and sends the same bytes onward.

use std::borrow::Cow;

use bytes::{Buf, BufMut};
use vmesh_transport::VirtualAddress;

use crate::error::PacketError;
use crate::pool::{BufferPool, PooledBuffer};

pub const HEADER_SIZE: usize = 26;

/// Header carried in front of every packet payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtualPacketHeader {
    pub to: VirtualAddress,
    pub to_port: u16,
    pub from: VirtualAddress,
    pub from_port: u16,
    /// Node that last put this packet on a link.
    pub last_hop: VirtualAddress,
    /// Links traversed so far.
    pub hop_count: u8,
    pub max_hops: u8,
    pub payload_size: u32,
}

impl VirtualPacketHeader {
    /// Header of a packet originated by `from`, with no hops taken yet.
    pub fn new(
        from: VirtualAddress,
        from_port: u16,
        to: VirtualAddress,
        to_port: u16,
        max_hops: u8,
    ) -> Self {
        Self {
            to,
            to_port,
            from,
            from_port,
            last_hop: from,
            hop_count: 0,
            max_hops,
            payload_size: 0,
        }
    }

    /// Write the header at `offset`.
    pub fn encode(&self, buf: &mut [u8], offset: usize) -> Result<(), PacketError> {
        let available = buf.len().saturating_sub(offset);
        if available < HEADER_SIZE {
            return Err(PacketError::BufferTooSmall {
                needed: HEADER_SIZE,
                available,
            });
        }
        if self.hop_count > i8::MAX as u8 || self.max_hops > i8::MAX as u8 {
            return Err(PacketError::Malformed {
                reason: format!("hop fields {}/{} exceed 127", self.hop_count, self.max_hops),
            });
        }
        let payload_size = i32::try_from(self.payload_size).map_err(|_| PacketError::Malformed {
            reason: format!("payload size {} exceeds i32", self.payload_size),
        })?;

        let mut out = &mut buf[offset..offset + HEADER_SIZE];
        out.put_i32(self.to.to_i32());
        out.put_i32(i32::from(self.to_port));
        out.put_i32(self.from.to_i32());
        out.put_i32(i32::from(self.from_port));
        out.put_i32(self.last_hop.to_i32());
        out.put_i8(self.hop_count as i8);
        out.put_i8(self.max_hops as i8);
        out.put_i32(payload_size);
        Ok(())
    }

    /// Read a header at `offset`.
    pub fn decode(buf: &[u8], offset: usize) -> Result<Self, PacketError> {
        let available = buf.len().saturating_sub(offset);
        if available < HEADER_SIZE {
            return Err(PacketError::Truncated {
                needed: HEADER_SIZE,
                available,
            });
        }
        let mut input = &buf[offset..offset + HEADER_SIZE];
        let to = VirtualAddress::from_i32(input.get_i32());
        let to_port = decode_port(input.get_i32())?;
        let from = VirtualAddress::from_i32(input.get_i32());
        let from_port = decode_port(input.get_i32())?;
        let last_hop = VirtualAddress::from_i32(input.get_i32());
        let hop_count = input.get_i8();
        let max_hops = input.get_i8();
        let payload_size = input.get_i32();

        if hop_count < 0 || max_hops < 0 {
            return Err(malformed(format!("negative hop field {hop_count}/{max_hops}")));
        }
        if hop_count > max_hops {
            return Err(malformed(format!("hop count {hop_count} above max {max_hops}")));
        }
        if payload_size < 0 {
            return Err(malformed(format!("negative payload size {payload_size}")));
        }

        Ok(Self {
            to,
            to_port,
            from,
            from_port,
            last_hop,
            hop_count: hop_count as u8,
            max_hops: max_hops as u8,
            payload_size: payload_size as u32,
        })
    }
}

fn decode_port(raw: i32) -> Result<u16, PacketError> {
    u16::try_from(raw).map_err(|_| malformed(format!("port {raw} out of range")))
}

fn malformed(reason: String) -> PacketError {
    PacketError::Malformed { reason }
}

/// A decoded packet over a pooled buffer.
#[derive(Debug)]
pub struct VirtualPacket {
    header: VirtualPacketHeader,
    buffer: PooledBuffer,
    payload_offset: usize,
}

impl VirtualPacket {
    /// Wrap `buffer`, whose payload starts at `payload_offset`.
    pub fn from_header_and_payload(
        header: VirtualPacketHeader,
        buffer: PooledBuffer,
        payload_offset: usize,
    ) -> Result<Self, PacketError> {
        let available = buffer.len().saturating_sub(payload_offset);
        let size = header.payload_size as usize;
        if size > available {
            return Err(PacketError::PayloadOverflow { size, available });
        }
        Ok(Self {
            header,
            buffer,
            payload_offset,
        })
    }

    /// Decode a packet received as one frame: header, then payload.
    pub fn decode(buffer: PooledBuffer) -> Result<Self, PacketError> {
        let header = VirtualPacketHeader::decode(&buffer, 0)?;
        Self::from_header_and_payload(header, buffer, HEADER_SIZE)
    }

    /// Build a packet carrying a copy of `payload`.
    ///
    /// `header.payload_size` is set from the payload.
    pub fn compose(
        pool: &BufferPool,
        mut header: VirtualPacketHeader,
        payload: &[u8],
    ) -> Result<Self, PacketError> {
        header.payload_size = u32::try_from(payload.len()).map_err(|_| PacketError::Malformed {
            reason: format!("payload of {} bytes", payload.len()),
        })?;
        let mut buffer = pool.acquire();
        let vec = buffer.as_mut_vec();
        vec.resize(HEADER_SIZE, 0);
        vec.extend_from_slice(payload);
        header.encode(&mut buffer, 0)?;
        Ok(Self {
            header,
            buffer,
            payload_offset: HEADER_SIZE,
        })
    }

    pub fn header(&self) -> &VirtualPacketHeader {
        &self.header
    }

    pub fn payload(&self) -> &[u8] {
        let end = self.payload_offset + self.header.payload_size as usize;
        &self.buffer[self.payload_offset..end]
    }

    /// Account for one more link: bump the hop count and stamp `local`
    /// as the last hop.
    pub fn mark_hop(&mut self, local: VirtualAddress) {
        self.header.hop_count = self.header.hop_count.saturating_add(1);
        self.header.last_hop = local;
    }

    /// Copy into a new pooled buffer, for fan-out.
    pub fn duplicate(&self, pool: &BufferPool) -> Self {
        let start = self.payload_offset.saturating_sub(HEADER_SIZE);
        let end = self.payload_offset + self.header.payload_size as usize;
        Self {
            header: self.header,
            buffer: pool.acquire_from(&self.buffer[start..end]),
            payload_offset: self.payload_offset - start,
        }
    }

    /// Header followed by payload, as sent on a link.
    ///
    /// The current header is written in place when the buffer has room in
    /// front of the payload, so forwarding does not copy.
    pub fn wire_bytes(&mut self) -> Result<Cow<'_, [u8]>, PacketError> {
        let end = self.payload_offset + self.header.payload_size as usize;
        if self.payload_offset >= HEADER_SIZE {
            let start = self.payload_offset - HEADER_SIZE;
            self.header.encode(&mut self.buffer, start)?;
            return Ok(Cow::Borrowed(&self.buffer[start..end]));
        }
        let mut out = vec![0u8; HEADER_SIZE];
        self.header.encode(&mut out, 0)?;
        out.extend_from_slice(&self.buffer[self.payload_offset..end]);
        Ok(Cow::Owned(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(last: u8) -> VirtualAddress {
        VirtualAddress::from_octets(169, 254, 0, last)
    }

    fn header() -> VirtualPacketHeader {
        VirtualPacketHeader {
            to: addr(2),
            to_port: 7000,
            from: addr(1),
            from_port: 50_000,
            last_hop: addr(1),
            hop_count: 1,
            max_hops: 8,
            payload_size: 5,
        }
    }

    #[test]
    fn header_layout_is_big_endian() {
        let mut buf = [0u8; HEADER_SIZE];
        header().encode(&mut buf, 0).unwrap();
        assert_eq!(&buf[0..4], &[169, 254, 0, 2]);
        assert_eq!(&buf[4..8], &7000i32.to_be_bytes());
        assert_eq!(&buf[8..12], &[169, 254, 0, 1]);
        assert_eq!(buf[20], 1);
        assert_eq!(buf[21], 8);
        assert_eq!(&buf[22..26], &5i32.to_be_bytes());
        assert_eq!(VirtualPacketHeader::decode(&buf, 0).unwrap(), header());
    }

    #[test]
    fn encode_needs_room() {
        let mut buf = [0u8; 30];
        assert!(matches!(
            header().encode(&mut buf, 10),
            Err(PacketError::BufferTooSmall { needed: 26, available: 20 })
        ));
    }

    #[test]
    fn decode_rejects_truncated() {
        let mut buf = [0u8; HEADER_SIZE];
        header().encode(&mut buf, 0).unwrap();
        assert!(matches!(
            VirtualPacketHeader::decode(&buf[..20], 0),
            Err(PacketError::Truncated { .. })
        ));
    }

    #[test]
    fn decode_rejects_hop_count_above_max() {
        let mut h = header();
        h.hop_count = 9;
        let mut buf = [0u8; HEADER_SIZE];
        h.encode(&mut buf, 0).unwrap();
        assert!(matches!(
            VirtualPacketHeader::decode(&buf, 0),
            Err(PacketError::Malformed { .. })
        ));
    }

    #[test]
    fn decode_rejects_out_of_range_port() {
        let mut buf = [0u8; HEADER_SIZE];
        header().encode(&mut buf, 0).unwrap();
        buf[4..8].copy_from_slice(&70_000i32.to_be_bytes());
        assert!(matches!(
            VirtualPacketHeader::decode(&buf, 0),
            Err(PacketError::Malformed { .. })
        ));
    }

    #[test]
    fn payload_overflow_is_rejected() {
        let mut h = header();
        h.payload_size = 100;
        let buffer = PooledBuffer::detached(vec![0u8; HEADER_SIZE + 10]);
        assert!(matches!(
            VirtualPacket::from_header_and_payload(h, buffer, HEADER_SIZE),
            Err(PacketError::PayloadOverflow { size: 100, available: 10 })
        ));
    }

    #[test]
    fn forwarding_rewrites_header_in_place() {
        let pool = BufferPool::new(128, 4);
        let mut packet = VirtualPacket::compose(&pool, header(), b"hello").unwrap();
        packet.mark_hop(addr(9));

        let wire = packet.wire_bytes().unwrap().into_owned();
        let again = VirtualPacket::decode(PooledBuffer::detached(wire)).unwrap();
        assert_eq!(again.header().hop_count, 2);
        assert_eq!(again.header().last_hop, addr(9));
        assert_eq!(again.payload(), b"hello");
    }

    #[test]
    fn wire_bytes_copies_when_no_headroom() {
        let mut h = header();
        h.payload_size = 3;
        let mut packet =
            VirtualPacket::from_header_and_payload(h, PooledBuffer::detached(b"abc".to_vec()), 0)
                .unwrap();
        let wire = packet.wire_bytes().unwrap();
        assert!(matches!(wire, Cow::Owned(_)));
        assert_eq!(wire.len(), HEADER_SIZE + 3);
        assert_eq!(&wire[HEADER_SIZE..], b"abc");
    }

    #[test]
    fn duplicate_is_independent() {
        let pool = BufferPool::new(128, 4);
        let original = VirtualPacket::compose(&pool, header(), b"fan-out").unwrap();
        let mut copy = original.duplicate(&pool);
        copy.mark_hop(addr(3));
        assert_eq!(copy.payload(), b"fan-out");
        assert_eq!(original.header().hop_count, 1);
        assert_eq!(copy.header().hop_count, 2);
    }
}
