use proptest::prelude::*;
use vmesh_protocol::{
    BufferPool, PacketError, PooledBuffer, VirtualAddress, VirtualPacket, VirtualPacketHeader,
    HEADER_SIZE,
};

fn arb_address() -> impl Strategy<Value = VirtualAddress> {
    any::<u32>().prop_map(VirtualAddress::new)
}

/// Headers whose fields all fit the wire ranges.
fn arb_header() -> impl Strategy<Value = VirtualPacketHeader> {
    (
        arb_address(),
        any::<u16>(),
        arb_address(),
        any::<u16>(),
        arb_address(),
        0..=127u8,
        0..=i32::MAX as u32,
    )
        .prop_flat_map(|(to, to_port, from, from_port, last_hop, max_hops, payload_size)| {
            (0..=max_hops).prop_map(move |hop_count| VirtualPacketHeader {
                to,
                to_port,
                from,
                from_port,
                last_hop,
                hop_count,
                max_hops,
                payload_size,
            })
        })
}

proptest! {
    /// Encoding then decoding a header at any offset yields the same header.
    #[test]
    fn header_survives_the_wire(header in arb_header(), offset in 0..64usize) {
        let mut buf = vec![0u8; offset + HEADER_SIZE];
        header.encode(&mut buf, offset).unwrap();
        prop_assert_eq!(VirtualPacketHeader::decode(&buf, offset).unwrap(), header);
    }

    /// Arbitrary bytes decode to a header or an error, never a panic, and
    /// whatever decodes is internally consistent.
    #[test]
    fn garbage_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..64)) {
        match VirtualPacketHeader::decode(&bytes, 0) {
            Ok(header) => {
                prop_assert!(bytes.len() >= HEADER_SIZE);
                prop_assert!(header.hop_count <= header.max_hops);
                prop_assert!(header.max_hops <= 127);
            }
            Err(PacketError::Truncated { .. }) => prop_assert!(bytes.len() < HEADER_SIZE),
            Err(_) => {}
        }
        let _ = VirtualPacket::decode(PooledBuffer::detached(bytes));
    }

    /// A composed packet, marked for forwarding, reaches the next node with
    /// the same payload and one more hop.
    #[test]
    fn forwarded_packet_keeps_payload(
        payload in prop::collection::vec(any::<u8>(), 0..4096),
        hops in 0..8u8,
        via in arb_address(),
    ) {
        let pool = BufferPool::new(256, 4);
        let from = VirtualAddress::from_octets(169, 254, 0, 1);
        let to = VirtualAddress::from_octets(169, 254, 0, 2);
        let mut header = VirtualPacketHeader::new(from, 1234, to, 80, 8);
        header.hop_count = hops;

        let mut packet = VirtualPacket::compose(&pool, header, &payload).unwrap();
        packet.mark_hop(via);
        let wire = packet.wire_bytes().unwrap().into_owned();
        prop_assert_eq!(wire.len(), HEADER_SIZE + payload.len());

        let received = VirtualPacket::decode(pool.acquire_from(&wire)).unwrap();
        prop_assert_eq!(received.payload(), &payload[..]);
        prop_assert_eq!(received.header().hop_count, hops + 1);
        prop_assert_eq!(received.header().last_hop, via);
        prop_assert_eq!(received.header().from, from);
    }

    /// Fields outside the wire ranges are refused.
    #[test]
    fn out_of_range_hops_refused(hop_count in 128..=255u8) {
        let mut header = VirtualPacketHeader::new(
            VirtualAddress::from_octets(169, 254, 0, 1), 1,
            VirtualAddress::from_octets(169, 254, 0, 2), 2,
            8,
        );
        header.hop_count = hop_count;
        let mut buf = [0u8; HEADER_SIZE];
        prop_assert!(header.encode(&mut buf, 0).is_err());
    }
}
