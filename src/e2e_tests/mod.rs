mod lossy_socket;

use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use lossy_socket::LossyTransport;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpListener,
    time::timeout,
    try_join,
};
use tracing::{Instrument, error_span, info};

use crate::{
    TcpConnector, Transport, Tunnel, TunnelOpts, UdpTransport,
    test_util::setup_test_logging,
    traits::DefaultTunnelEnvironment,
};

const TIMEOUT: Duration = Duration::from_secs(30);

// Write a counter into the tunnel and expect the same counter to come back.
async fn echo_client(
    reader: impl AsyncRead + Unpin,
    writer: impl AsyncWrite + Unpin,
) -> anyhow::Result<()> {
    const MAX_COUNTER: u64 = 10_000;
    const PRINT_EVERY: u64 = 1_000;

    let reader = async move {
        let mut reader = reader;
        for expected in 0..=MAX_COUNTER {
            let current = timeout(TIMEOUT, reader.read_u64())
                .await
                .context("timeout reading")?
                .context("error reading")?;
            if current != expected {
                anyhow::bail!("expected {expected}, got {current}");
            }

            if current % PRINT_EVERY == 0 {
                info!("current counter {current}");
            }
        }
        Ok::<_, anyhow::Error>(())
    };

    let writer = async move {
        let mut writer = writer;
        for counter in 0..=MAX_COUNTER {
            timeout(TIMEOUT, writer.write_u64(counter))
                .await
                .context("timeout writing")?
                .context("error writing")?;
        }
        writer.flush().await.context("error flushing")?;
        Ok::<_, anyhow::Error>(())
    };

    try_join!(reader, writer)?;
    Ok(())
}

// A TCP echo service for the exit side to connect to.
async fn spawn_echo_server() -> u16 {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(
        async move {
            loop {
                let (stream, addr) = listener.accept().await.unwrap();
                info!(?addr, "accepted");
                tokio::spawn(async move {
                    let (mut r, mut w) = stream.into_split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        }
        .instrument(error_span!("echo_server")),
    );
    port
}

async fn test_one_echo<TE: Transport, TX: Transport>(entry_transport: TE, exit_transport: TX) {
    setup_test_logging();

    let service_port = spawn_echo_server().await;
    let exit_addr = exit_transport.bind_addr();

    let exit = Tunnel::new_exit(
        exit_transport,
        DefaultTunnelEnvironment::default(),
        TunnelOpts::default(),
        TcpConnector::new(service_port),
    )
    .unwrap();
    let entry = Tunnel::new_entry(
        entry_transport,
        DefaultTunnelEnvironment::default(),
        TunnelOpts {
            remote: Some(exit_addr.to_string()),
            ..Default::default()
        },
    )
    .unwrap();

    let (client, tunnel_side) = tokio::io::duplex(64 * 1024);
    entry.accept_new_local_stream(tunnel_side).await.unwrap();
    let (r, w) = tokio::io::split(client);
    echo_client(r, w)
        .instrument(error_span!("echo_client"))
        .await
        .unwrap();

    let entry_stats = entry.stats();
    let exit_stats = exit.stats();
    info!(?entry_stats, ?exit_stats, "done");
    assert!(entry_stats.sent_unique_packets > 0);
    assert!(exit_stats.sent_unique_packets > 0);

    entry.shutdown();
    exit.shutdown();
}

fn localhost_ipv4(port: u16) -> SocketAddr {
    (Ipv4Addr::LOCALHOST, port).into()
}

#[tokio::test]
async fn e2e_test_udp() {
    let (entry, exit) = tokio::join!(
        UdpTransport::bind(localhost_ipv4(0), None),
        UdpTransport::bind(localhost_ipv4(0), None),
    );
    test_one_echo(entry.unwrap(), exit.unwrap()).await;
}

#[tokio::test]
async fn e2e_test_udp_lossy() {
    let (entry, exit) = tokio::join!(
        UdpTransport::bind(localhost_ipv4(0), None),
        UdpTransport::bind(localhost_ipv4(0), None),
    );
    let entry = Arc::new(LossyTransport::<_, 10>::new(entry.unwrap()));
    let exit = Arc::new(LossyTransport::<_, 10>::new(exit.unwrap()));
    test_one_echo(entry.clone(), exit.clone()).await;
    info!(
        entry_sent = entry.sent(),
        entry_lost = entry.lost(),
        exit_sent = exit.sent(),
        exit_lost = exit.lost(),
        "lossy transport stats"
    );
    assert!(entry.lost() > 0);
}
