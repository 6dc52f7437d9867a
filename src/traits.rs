use std::{
    future::Future,
    net::{Ipv6Addr, SocketAddr, SocketAddrV6},
    sync::Arc,
    time::Instant,
};

use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

use crate::{Error, Result, connection::ConnectionId};

/// An abstraction for underlying transport. UDP is default, but can be swapped to a custom transport.
///
/// Tests use mock transport.
pub trait Transport: Send + Sync + Unpin + 'static {
    fn recv_from<'a>(
        &'a self,
        buf: &'a mut [u8],
    ) -> impl Future<Output = std::io::Result<(usize, SocketAddr)>> + Send + 'a;

    fn send_to<'a>(
        &'a self,
        buf: &'a [u8],
        target: SocketAddr,
    ) -> impl Future<Output = std::io::Result<usize>> + Send + 'a;

    // The local address transport is bound to. Used only for logging.
    fn bind_addr(&self) -> SocketAddr;
}

impl<T: Transport> Transport for Arc<T> {
    fn recv_from<'a>(
        &'a self,
        buf: &'a mut [u8],
    ) -> impl Future<Output = std::io::Result<(usize, SocketAddr)>> + Send + 'a {
        (**self).recv_from(buf)
    }

    fn send_to<'a>(
        &'a self,
        buf: &'a [u8],
        target: SocketAddr,
    ) -> impl Future<Output = std::io::Result<usize>> + Send + 'a {
        (**self).send_to(buf, target)
    }

    fn bind_addr(&self) -> SocketAddr {
        (**self).bind_addr()
    }
}

/// A UDP socket. If it was bound dual-stack, IPv4 targets are sent to as IPv4-mapped IPv6.
pub struct UdpTransport {
    socket: tokio::net::UdpSocket,
    dualstack: bool,
    bind_addr: SocketAddr,
}

fn try_set_udp_rcvbuf(sock: &tokio::net::UdpSocket, bufsize: usize) {
    let sock = SockRef::from(sock);
    let prev = sock.recv_buffer_size().map(|v| v as isize).unwrap_or(-1);
    match sock.set_recv_buffer_size(bufsize) {
        Ok(()) => match sock.recv_buffer_size() {
            Ok(value) if value >= bufsize => {
                debug!(prev, current = value, "successfully set UDP rcv buf size");
            }
            Ok(value) => {
                warn!(
                    prev,
                    current = value,
                    expected = bufsize,
                    "couldn't set UDP rcv buf size to requested value. There might be packet loss, try increasing rmem_max or equivalent."
                );
            }
            Err(e) => {
                warn!(prev, expected=?bufsize, "updated UDP rcv buf size, but got error reading the current value: {e:#}.")
            }
        },
        Err(e) => {
            warn!(current = prev, "error setting UDP socket rcv buf size: {e:#}");
        }
    }
}

impl UdpTransport {
    /// Bind [::]:port with IPV6_V6ONLY off, so that both IPv4 and IPv6 peers can talk to us.
    pub async fn bind_dualstack(port: u16, rcvbuf: Option<usize>) -> Result<Self> {
        let sock =
            Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP)).map_err(Error::Bind)?;
        let dualstack = match sock.set_only_v6(false) {
            Ok(()) => true,
            Err(e) => {
                warn!("error disabling IPV6_V6ONLY, IPv4 peers won't work: {e:#}");
                false
            }
        };
        sock.set_nonblocking(true).map_err(Error::Bind)?;
        let addr = SocketAddr::from((Ipv6Addr::UNSPECIFIED, port));
        sock.bind(&addr.into()).map_err(Error::Bind)?;
        let socket = tokio::net::UdpSocket::from_std(sock.into()).map_err(Error::Bind)?;
        Self::from_socket(socket, dualstack, rcvbuf)
    }

    /// Bind a plain single-stack socket.
    pub async fn bind(addr: SocketAddr, rcvbuf: Option<usize>) -> Result<Self> {
        let socket = tokio::net::UdpSocket::bind(addr)
            .await
            .map_err(Error::Bind)?;
        Self::from_socket(socket, false, rcvbuf)
    }

    fn from_socket(
        socket: tokio::net::UdpSocket,
        dualstack: bool,
        rcvbuf: Option<usize>,
    ) -> Result<Self> {
        if let Some(rcvbuf) = rcvbuf {
            try_set_udp_rcvbuf(&socket, rcvbuf);
        }
        let bind_addr = socket.local_addr().map_err(Error::Bind)?;
        Ok(Self {
            socket,
            dualstack,
            bind_addr,
        })
    }

    fn map_target(&self, target: SocketAddr) -> SocketAddr {
        match target {
            SocketAddr::V4(v4) if self.dualstack => SocketAddr::V6(SocketAddrV6::new(
                v4.ip().to_ipv6_mapped(),
                v4.port(),
                0,
                0,
            )),
            other => other,
        }
    }
}

impl Transport for UdpTransport {
    fn recv_from<'a>(
        &'a self,
        buf: &'a mut [u8],
    ) -> impl Future<Output = std::io::Result<(usize, SocketAddr)>> + Send + 'a {
        self.socket.recv_from(buf)
    }

    fn send_to<'a>(
        &'a self,
        buf: &'a [u8],
        target: SocketAddr,
    ) -> impl Future<Output = std::io::Result<usize>> + Send + 'a {
        let target = self.map_target(target);
        self.socket.send_to(buf, target)
    }

    fn bind_addr(&self) -> SocketAddr {
        self.bind_addr
    }
}

// A trait for mocking stuff in tests.
pub trait TunnelEnvironment: Send + Sync + Unpin + 'static {
    fn now(&self) -> Instant;
    fn random_u32(&self) -> u32;
}

#[derive(Default, Clone, Copy)]
pub struct DefaultTunnelEnvironment {}

impl TunnelEnvironment for DefaultTunnelEnvironment {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn random_u32(&self) -> u32 {
        rand::random()
    }
}

/// Any bidirectional byte stream standing in for a local TCP connection.
pub trait LocalStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<S: AsyncRead + AsyncWrite + Send + Unpin + 'static> LocalStream for S {}

/// Opens a local stream for a tunnel the remote side just started. Only the exit side of a
/// tunnel has one.
pub trait LocalConnector: Send + Sync + 'static {
    type Stream: LocalStream;

    /// Returns None if the local service can't be reached.
    fn connect(&self, id: ConnectionId) -> impl Future<Output = Option<Self::Stream>> + Send;
}
