use std::{sync::Arc, time::Duration};

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use udp_tunnel::{
    DEFAULT_TCP_PORT, DEFAULT_UDP_PORT, DefaultTunnelEnvironment, MAX_SEGMENT_SIZE, TcpConnector,
    Tunnel, TunnelOpts, UDP_RCVBUF_SEGMENTS_PER_CONNECTION, UdpTransport,
};

const STATS_INTERVAL: Duration = Duration::from_secs(10);

/// Carry a TCP service over UDP.
///
/// With --remote, runs the entry side: listens for TCP on --tcp-port and tunnels every
/// accepted stream to the remote. Without it, runs the exit side: listens for UDP on
/// --udp-port and connects every new tunnel to the local TCP service on --tcp-port.
#[derive(Debug, Parser)]
struct Args {
    /// "host:port" of the exit side.
    #[arg(long)]
    remote: Option<String>,

    #[arg(long, default_value_t = DEFAULT_TCP_PORT)]
    tcp_port: u16,
    /// UDP port to listen on. The entry side defaults to an ephemeral port.
    #[arg(long)]
    udp_port: Option<u16>,

    #[arg(long, default_value_t = 10)]
    max_connections: usize,

    /// Bytes per second, per connection.
    #[arg(long)]
    connection_upload: Option<u64>,
    #[arg(long)]
    connection_download: Option<u64>,
    /// Bytes per second, all connections together.
    #[arg(long)]
    global_upload: Option<u64>,
    #[arg(long)]
    global_download: Option<u64>,

    /// Milliseconds until a fresh data segment is sent a second time. 0 disables it.
    #[arg(long)]
    initial_retransmit_ms: Option<u64>,
    /// Milliseconds between retransmissions of an unacknowledged segment.
    #[arg(long)]
    retransmit_ms: Option<u64>,
}

fn stats_logger<T, E, C>(tunnel: Arc<Tunnel<T, E, C>>)
where
    T: udp_tunnel::Transport,
    E: udp_tunnel::TunnelEnvironment,
    C: udp_tunnel::LocalConnector,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(STATS_INTERVAL);
        loop {
            interval.tick().await;
            let stats = tunnel.stats();
            info!(
                connections = tunnel.connection_count(),
                sent = stats.sent_bytes,
                sent_unique = stats.sent_unique_bytes,
                received = stats.received_bytes,
                received_unique = stats.received_unique_bytes,
                "stats"
            );
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let rcvbuf = UDP_RCVBUF_SEGMENTS_PER_CONNECTION * MAX_SEGMENT_SIZE * args.max_connections;
    let opts = TunnelOpts {
        remote: args.remote.clone(),
        max_connections: Some(args.max_connections),
        connection_upload: args.connection_upload,
        connection_download: args.connection_download,
        global_upload: args.global_upload,
        global_download: args.global_download,
        initial_retransmit: args.initial_retransmit_ms.map(Duration::from_millis),
        retransmit: args.retransmit_ms.map(Duration::from_millis),
        ..Default::default()
    };

    match args.remote {
        Some(remote) => {
            let transport = UdpTransport::bind_dualstack(args.udp_port.unwrap_or(0), Some(rcvbuf))
                .await
                .context("error binding UDP socket")?;
            let tunnel = Tunnel::new_entry(transport, DefaultTunnelEnvironment::default(), opts)
                .context("error creating tunnel")?;
            info!(udp = ?tunnel.local_addr(), %remote, "entry side started");
            stats_logger(tunnel.clone());

            let listener = TcpListener::bind(("::", args.tcp_port))
                .await
                .with_context(|| format!("error listening on TCP port {}", args.tcp_port))?;
            loop {
                let (stream, addr) = listener.accept().await.context("error accepting")?;
                if let Err(e) = stream.set_nodelay(true) {
                    warn!(?addr, "error setting TCP_NODELAY: {e:#}");
                }
                let tunnel = tunnel.clone();
                tokio::spawn(async move {
                    match tunnel.accept_new_local_stream(stream).await {
                        Ok(id) => info!(?addr, id, "tunneling"),
                        Err(e) => warn!(?addr, "error opening tunnel: {e:#}"),
                    }
                });
            }
        }
        None => {
            let udp_port = args.udp_port.unwrap_or(DEFAULT_UDP_PORT);
            let transport = UdpTransport::bind_dualstack(udp_port, Some(rcvbuf))
                .await
                .context("error binding UDP socket")?;
            let tunnel = Tunnel::new_exit(
                transport,
                DefaultTunnelEnvironment::default(),
                opts,
                TcpConnector::new(args.tcp_port),
            )
            .context("error creating tunnel")?;
            info!(udp = ?tunnel.local_addr(), tcp_port = args.tcp_port, "exit side started");
            stats_logger(tunnel);
            std::future::pending::<()>().await;
            Ok(())
        }
    }
}
