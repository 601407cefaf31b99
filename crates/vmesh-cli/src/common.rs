use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use vmesh_protocol::{VirtualNode, VirtualSocketAddr};

use crate::events::{emit, EventMesh};

/// Setup Ctrl+C handler, returns a flag that goes false on signal.
pub fn setup_ctrlc() -> Arc<AtomicBool> {
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        eprintln!("\nCtrl+C received, shutting down...");
        r.store(false, Ordering::Relaxed);
    });
    running
}

/// Spawn a background task that emits JSONL for MMCP events.
pub fn spawn_event_monitor(node: &VirtualNode, start: Instant) {
    let mut rx = node.subscribe_events();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Some(mesh) = EventMesh::from_mmcp(&event, start.elapsed().as_secs_f64()) {
                        emit(&mesh);
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::debug!("event monitor lagged by {n}");
                }
                Err(_) => break,
            }
        }
    });
}

/// Dial every address in `peers` as a TCP link.
pub async fn connect_all(node: &VirtualNode, peers: &[SocketAddr]) -> anyhow::Result<()> {
    for peer in peers {
        let remote = node
            .connect(*peer)
            .await
            .with_context(|| format!("link to {peer} failed"))?;
        eprintln!("Linked to {remote} at {peer}");
    }
    Ok(())
}

/// Parse `udp_addr=virtual_addr:port`.
pub fn parse_forward(s: &str) -> anyhow::Result<(SocketAddr, VirtualSocketAddr)> {
    let (listen, target) = s
        .split_once('=')
        .ok_or_else(|| anyhow::anyhow!("invalid forward '{s}': expected LISTEN=VADDR:PORT"))?;
    let listen = listen
        .trim()
        .parse::<SocketAddr>()
        .with_context(|| format!("invalid listen address in '{s}'"))?;
    let target = target
        .trim()
        .parse::<VirtualSocketAddr>()
        .map_err(|e| anyhow::anyhow!("invalid virtual target in '{s}': {e}"))?;
    Ok((listen, target))
}

/// Parse `virtual_port=udp_addr`.
pub fn parse_expose(s: &str) -> anyhow::Result<(u16, SocketAddr)> {
    let (port, target) = s
        .split_once('=')
        .ok_or_else(|| anyhow::anyhow!("invalid expose '{s}': expected VPORT=HOST:PORT"))?;
    let port = port
        .trim()
        .parse::<u16>()
        .with_context(|| format!("invalid virtual port in '{s}'"))?;
    let target = target
        .trim()
        .parse::<SocketAddr>()
        .with_context(|| format!("invalid UDP target in '{s}'"))?;
    Ok((port, target))
}
