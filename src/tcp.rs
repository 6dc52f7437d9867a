use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::{connection::ConnectionId, traits::LocalConnector};

/// Connects exit-side tunnels to a TCP service on the loopback interface, IPv6 first.
#[derive(Clone, Copy, Debug)]
pub struct TcpConnector {
    port: u16,
}

impl TcpConnector {
    pub fn new(port: u16) -> Self {
        Self { port }
    }
}

impl LocalConnector for TcpConnector {
    type Stream = TcpStream;

    async fn connect(&self, id: ConnectionId) -> Option<TcpStream> {
        let candidates = [
            SocketAddr::from((Ipv6Addr::LOCALHOST, self.port)),
            SocketAddr::from((Ipv4Addr::LOCALHOST, self.port)),
        ];
        for addr in candidates {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        warn!(id, ?addr, "error setting TCP_NODELAY: {e:#}");
                    }
                    debug!(id, ?addr, "connected to local service");
                    return Some(stream);
                }
                Err(e) => debug!(id, ?addr, "error connecting to local service: {e:#}"),
            }
        }
        None
    }
}

/// Used by the entry side, which never opens local streams on its own.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoConnector;

impl LocalConnector for NoConnector {
    type Stream = TcpStream;

    async fn connect(&self, _id: ConnectionId) -> Option<TcpStream> {
        None
    }
}
