mod common;
mod events;
mod run;
mod send;

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use common::{parse_expose, parse_forward};
use vmesh_protocol::{NoLinkProvider, NodeConfig, VirtualAddress, VirtualNode, VirtualSocketAddr};

#[derive(Parser)]
#[command(name = "vmesh-cli", about = "Run a vmesh node over TCP links")]
struct Cli {
    /// Virtual address of this node (random in 169.254.0.0/16 if omitted).
    #[arg(short, long)]
    address: Option<VirtualAddress>,

    /// Chain relay bind address (default: $VMESH_CHAIN_RELAY_BIND, else no relay).
    #[arg(long)]
    relay: Option<SocketAddr>,

    /// Hop budget of originated packets.
    #[arg(long, default_value = "8")]
    max_hops: u8,

    /// Originator announcement interval in ms.
    #[arg(long, default_value = "5000")]
    originator_interval: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a node until Ctrl+C, printing mesh events and periodic stats.
    Run {
        /// Accept TCP links on this address (repeatable).
        #[arg(long)]
        listen: Vec<SocketAddr>,
        /// Dial a TCP link to this address (repeatable).
        #[arg(long)]
        connect: Vec<SocketAddr>,
        /// Forward a local UDP port to a virtual service: LISTEN=VADDR:PORT.
        #[arg(long)]
        forward: Vec<String>,
        /// Expose a real UDP service on a virtual port: VPORT=HOST:PORT.
        #[arg(long)]
        expose: Vec<String>,
        /// Echo datagrams received on this virtual port.
        #[arg(long)]
        echo: Option<u16>,
        /// Stats snapshot interval in seconds.
        #[arg(long, default_value = "10")]
        stats_interval: u64,
    },

    /// Send one datagram once a route exists and print the reply.
    Send {
        /// Dial a TCP link to this address (repeatable).
        #[arg(long)]
        connect: Vec<SocketAddr>,
        /// Destination as VADDR:PORT.
        #[arg(long)]
        to: VirtualSocketAddr,
        /// Payload text.
        #[arg(long, default_value = "Hello")]
        message: String,
        /// Seconds to wait for a route, then for the reply.
        #[arg(long, default_value = "30")]
        timeout: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let start = Instant::now();

    let mut config = NodeConfig::new()
        .max_hops(cli.max_hops)
        .originator_interval(Duration::from_millis(cli.originator_interval));
    if let Some(address) = cli.address {
        config = config.address(address);
    }
    if let Some(relay) = cli.relay {
        config = config.chain_relay_bind(relay);
    }
    let node = VirtualNode::start(config, std::sync::Arc::new(NoLinkProvider)).await?;

    eprintln!("vmesh-cli v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("Address: {}", node.address());
    eprintln!();

    match cli.command {
        Command::Run {
            listen,
            connect,
            forward,
            expose,
            echo,
            stats_interval,
        } => {
            let forward = forward
                .iter()
                .map(|s| parse_forward(s))
                .collect::<Result<Vec<_>, _>>()?;
            let expose = expose
                .iter()
                .map(|s| parse_expose(s))
                .collect::<Result<Vec<_>, _>>()?;

            run::run(
                node,
                run::RunConfig {
                    listen,
                    connect,
                    forward,
                    expose,
                    echo_port: echo,
                    stats_interval: Duration::from_secs(stats_interval.max(1)),
                },
                start,
            )
            .await?;
        }

        Command::Send {
            connect,
            to,
            message,
            timeout,
        } => {
            send::run(
                node,
                send::SendConfig {
                    connect,
                    to,
                    message,
                    timeout: Duration::from_secs(timeout),
                },
                start,
            )
            .await?;
        }
    }

    Ok(())
}
