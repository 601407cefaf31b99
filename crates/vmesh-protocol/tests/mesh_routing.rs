/// Line topology A - B - C - D over in-memory links.
///
/// Originator floods build routes end to end; datagrams then cross three
/// links in both directions.
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use vmesh_protocol::{
    MmcpEvent, NoLinkProvider, NodeConfig, VirtualAddress, VirtualNode, VirtualSocketAddr,
};

fn addr(last: u8) -> VirtualAddress {
    VirtualAddress::from_octets(169, 254, 10, last)
}

async fn node(last: u8) -> VirtualNode {
    let config = NodeConfig::new()
        .no_chain_relay()
        .address(addr(last))
        .originator_interval(Duration::from_millis(50))
        // No RTT samples during the test: every link costs the default.
        .ping_interval(Duration::from_secs(3600))
        .default_rtt(Duration::from_millis(10));
    VirtualNode::start(config, Arc::new(NoLinkProvider)).await.unwrap()
}

async fn link(a: &VirtualNode, b: &VirtualNode) {
    let (sa, sb) = tokio::io::duplex(256 * 1024);
    let loopback = IpAddr::V4(Ipv4Addr::LOCALHOST);
    a.add_link(b.hello(), loopback, sa).await.unwrap();
    b.add_link(a.hello(), loopback, sb).await.unwrap();
}

async fn line() -> Vec<VirtualNode> {
    let mut nodes = Vec::new();
    for i in 1..=4 {
        nodes.push(node(i).await);
    }
    for pair in nodes.windows(2) {
        link(&pair[0], &pair[1]).await;
    }
    nodes
}

async fn wait_for_route(node: &VirtualNode, dest: VirtualAddress) -> u32 {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(entry) = node.router().route_to(dest) {
                return entry.metric;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("route never appeared")
}

async fn shutdown(nodes: Vec<VirtualNode>) {
    for node in nodes {
        node.shutdown().await;
    }
}

#[tokio::test]
async fn originator_metric_sums_link_costs() {
    let _ = tracing_subscriber::fmt().with_env_filter("warn").try_init();
    let nodes = line().await;
    let (a, b, d) = (&nodes[0], &nodes[1], &nodes[3]);

    assert_eq!(wait_for_route(d, a.address()).await, 30);
    assert_eq!(wait_for_route(a, d.address()).await, 30);
    assert_eq!(d.router().route_to(a.address()).unwrap().next_hop, addr(3));
    assert_eq!(a.router().route_to(d.address()).unwrap().next_hop, b.address());

    shutdown(nodes).await;
}

#[tokio::test]
async fn datagrams_cross_three_hops() {
    let _ = tracing_subscriber::fmt().with_env_filter("warn").try_init();
    let nodes = line().await;
    let (a, d) = (&nodes[0], &nodes[3]);
    wait_for_route(a, d.address()).await;
    wait_for_route(d, a.address()).await;

    let server = d.bind_datagram(5353).unwrap();
    let client = a.bind_datagram(0).unwrap();
    client
        .send_to(b"hello over three hops", VirtualSocketAddr::new(d.address(), 5353))
        .await
        .unwrap();

    let mut buf = [0u8; 64];
    let (n, from) = tokio::time::timeout(Duration::from_secs(5), server.recv_from(&mut buf))
        .await
        .expect("datagram lost")
        .unwrap();
    assert_eq!(&buf[..n], b"hello over three hops");
    assert_eq!(from, client.local_addr());

    server.send_to(b"and back", from).await.unwrap();
    let (n, from) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
        .await
        .expect("reply lost")
        .unwrap();
    assert_eq!(&buf[..n], b"and back");
    assert_eq!(from, server.local_addr());

    assert!(nodes[1].stats().forwarded.get() >= 2);
    shutdown(nodes).await;
}

#[tokio::test]
async fn route_events_reach_subscribers() {
    let a = node(1).await;
    let b = node(2).await;
    let mut events = b.subscribe_events();
    link(&a, &b).await;

    let event = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(MmcpEvent::RouteUpdated {
                destination, metric, ..
            }) = events.recv().await
            {
                return (destination, metric);
            }
        }
    })
    .await
    .expect("no route event");
    assert_eq!(event, (a.address(), 10));

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn broken_link_stops_routing_through_it() {
    let nodes = line().await;
    let (a, b, c) = (&nodes[0], &nodes[1], &nodes[2]);
    wait_for_route(a, nodes[3].address()).await;

    c.shutdown().await;
    tokio::time::timeout(Duration::from_secs(5), async {
        while b.router().is_neighbor(c.address()) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("neighbor not removed");
    assert!(b.router().route_to(nodes[3].address()).is_none());

    a.shutdown().await;
    b.shutdown().await;
    nodes[3].shutdown().await;
}
