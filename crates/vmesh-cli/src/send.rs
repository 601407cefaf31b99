use std::time::{Duration, Instant};

use anyhow::Context;
use vmesh_protocol::{VirtualNode, VirtualSocketAddr};

use crate::common::connect_all;
use crate::events::{emit, EventReply, EventStarted};

pub struct SendConfig {
    pub connect: Vec<std::net::SocketAddr>,
    pub to: VirtualSocketAddr,
    pub message: String,
    pub timeout: Duration,
}

pub async fn run(node: VirtualNode, config: SendConfig, start: Instant) -> anyhow::Result<()> {
    emit(&EventStarted::new(node.address().to_string(), node.relay_port(), "send"));
    connect_all(&node, &config.connect).await?;

    let result = exchange(&node, &config).await;
    node.shutdown().await;
    let reply = result?;
    tracing::debug!("send finished after {:.1}s", start.elapsed().as_secs_f64());
    emit(&reply);
    Ok(())
}

async fn exchange(node: &VirtualNode, config: &SendConfig) -> anyhow::Result<EventReply> {
    let dest = config.to.addr;
    eprintln!("Waiting for a route to {dest}...");
    tokio::time::timeout(config.timeout, async {
        while node.router().lookup_next_hop(dest, config.to.port).is_none() {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .with_context(|| format!("no route to {dest} within {:?}", config.timeout))?;

    let socket = node.bind_datagram(0)?;
    let sent_at = Instant::now();
    socket.send_to(config.message.as_bytes(), config.to).await?;
    eprintln!("Sent {} bytes {} -> {}", config.message.len(), socket.local_addr(), config.to);

    let mut buf = vec![0u8; 64 * 1024];
    let (n, from) = tokio::time::timeout(config.timeout, socket.recv_from(&mut buf))
        .await
        .with_context(|| format!("no reply from {} within {:?}", config.to, config.timeout))??;

    Ok(EventReply {
        event: "reply",
        from: from.to_string(),
        bytes: n,
        rtt_ms: sent_at.elapsed().as_secs_f64() * 1000.0,
        text: String::from_utf8_lossy(&buf[..n]).into_owned(),
    })
}
