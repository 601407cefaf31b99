use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use vmesh_protocol::{UdpForwardRule, VirtualNode, VirtualSocketAddr};

use crate::common::{connect_all, setup_ctrlc, spawn_event_monitor};
use crate::events::{emit, EventListening, EventStarted, EventStats};

pub struct RunConfig {
    pub listen: Vec<SocketAddr>,
    pub connect: Vec<SocketAddr>,
    pub forward: Vec<(SocketAddr, VirtualSocketAddr)>,
    pub expose: Vec<(u16, SocketAddr)>,
    pub echo_port: Option<u16>,
    pub stats_interval: Duration,
}

pub async fn run(node: VirtualNode, config: RunConfig, start: Instant) -> anyhow::Result<()> {
    emit(&EventStarted::new(node.address().to_string(), node.relay_port(), "run"));
    eprintln!("Node {} (chain relay port {})", node.address(), node.relay_port());
    eprintln!("Press Ctrl+C to stop.\n");

    let running = setup_ctrlc();
    spawn_event_monitor(&node, start);

    for addr in &config.listen {
        let local = node.listen(*addr).await?;
        emit(&EventListening {
            event: "listening",
            kind: "link",
            addr: local.to_string(),
            target: None,
        });
    }
    connect_all(&node, &config.connect).await?;

    let mut rules: Vec<UdpForwardRule> = Vec::new();
    for (listen, target) in &config.forward {
        let (local, rule) = node.forward_udp(*listen, *target).await?;
        emit(&EventListening {
            event: "listening",
            kind: "forward",
            addr: local.to_string(),
            target: Some(target.to_string()),
        });
        rules.push(rule);
    }
    for (port, target) in &config.expose {
        let (local, rule) = node.forward_virtual(*port, *target)?;
        emit(&EventListening {
            event: "listening",
            kind: "expose",
            addr: local.to_string(),
            target: Some(target.to_string()),
        });
        rules.push(rule);
    }

    if let Some(port) = config.echo_port {
        let socket = node.bind_datagram(port)?;
        emit(&EventListening {
            event: "listening",
            kind: "echo",
            addr: socket.local_addr().to_string(),
            target: None,
        });
        tokio::spawn(async move {
            let mut buf = vec![0u8; 64 * 1024];
            while let Ok((n, from)) = socket.recv_from(&mut buf).await {
                if let Err(e) = socket.send_to(&buf[..n], from).await {
                    tracing::debug!("echo to {from} failed: {e}");
                }
            }
        });
    }

    let mut stats = tokio::time::interval(config.stats_interval);
    // Skip the immediate first tick
    stats.tick().await;
    while running.load(Ordering::Relaxed) {
        tokio::select! {
            _ = stats.tick() => emit(&EventStats {
                event: "stats",
                elapsed_s: start.elapsed().as_secs_f64(),
                stats: node.stats(),
                neighbors: node.neighbors(),
                routes: node.routes(),
            }),
            // Short sleep so the running flag is checked
            _ = tokio::time::sleep(Duration::from_millis(500)) => {}
        }
    }

    for rule in &rules {
        rule.close().await;
    }
    node.shutdown().await;
    eprintln!("\nNode {} stopped after {:.1}s.", node.address(), start.elapsed().as_secs_f64());
    Ok(())
}
