use std::{
    future::poll_fn,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use parking_lot::Mutex;
use rustc_hash::FxHashMap as HashMap;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

use crate::Transport;

type Msg = (SocketAddr, Vec<u8>);

/// An in-memory "network": transports bound on the same interface can send datagrams to each
/// other by address. Datagrams to unbound addresses vanish, like UDP.
#[derive(Clone, Default)]
pub struct MockInterface {
    routes: Arc<Mutex<HashMap<SocketAddr, UnboundedSender<Msg>>>>,
}

impl MockInterface {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn bind(&self, addr: SocketAddr) -> MockTransport {
        let (tx, rx) = unbounded_channel();
        self.routes.lock().insert(addr, tx);
        MockTransport {
            addr,
            rx: Mutex::new(rx),
            interface: self.clone(),
        }
    }
}

pub struct MockTransport {
    addr: SocketAddr,
    rx: Mutex<UnboundedReceiver<Msg>>,
    interface: MockInterface,
}

impl MockTransport {
    /// A datagram that's already waiting, if any.
    pub fn try_recv(&self) -> Option<Msg> {
        self.rx.lock().try_recv().ok()
    }
}

impl Transport for MockTransport {
    async fn recv_from<'a>(&'a self, buf: &'a mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
        let msg = poll_fn(|cx| self.rx.lock().poll_recv(cx)).await;
        let Some((from, data)) = msg else {
            return Err(std::io::ErrorKind::BrokenPipe.into());
        };
        let len = data.len().min(buf.len());
        buf[..len].copy_from_slice(&data[..len]);
        Ok((len, from))
    }

    async fn send_to<'a>(&'a self, buf: &'a [u8], target: SocketAddr) -> std::io::Result<usize> {
        let tx = self.interface.routes.lock().get(&target).cloned();
        if let Some(tx) = tx {
            let _ = tx.send((self.addr, buf.to_vec()));
        }
        Ok(buf.len())
    }

    fn bind_addr(&self) -> SocketAddr {
        self.addr
    }
}

/// Records everything sent through it.
pub struct RememberingTransport<T> {
    inner: T,
    sent: Mutex<Vec<Msg>>,
}

impl<T> RememberingTransport<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            sent: Default::default(),
        }
    }

    pub fn sent(&self) -> Vec<Msg> {
        self.sent.lock().clone()
    }
}

impl<T: Transport> Transport for RememberingTransport<T> {
    async fn recv_from<'a>(&'a self, buf: &'a mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
        self.inner.recv_from(buf).await
    }

    async fn send_to<'a>(&'a self, buf: &'a [u8], target: SocketAddr) -> std::io::Result<usize> {
        self.sent.lock().push((target, buf.to_vec()));
        self.inner.send_to(buf, target).await
    }

    fn bind_addr(&self) -> SocketAddr {
        self.inner.bind_addr()
    }
}

/// Fails every send to one address, passes everything else through.
pub struct FailingTransport<T> {
    inner: T,
    unreachable: SocketAddr,
    failed: AtomicUsize,
}

impl<T> FailingTransport<T> {
    pub fn new(inner: T, unreachable: SocketAddr) -> Self {
        Self {
            inner,
            unreachable,
            failed: AtomicUsize::new(0),
        }
    }

    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::Relaxed)
    }
}

impl<T: Transport> Transport for FailingTransport<T> {
    async fn recv_from<'a>(&'a self, buf: &'a mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
        self.inner.recv_from(buf).await
    }

    async fn send_to<'a>(&'a self, buf: &'a [u8], target: SocketAddr) -> std::io::Result<usize> {
        if target == self.unreachable {
            self.failed.fetch_add(1, Ordering::Relaxed);
            return Err(std::io::ErrorKind::HostUnreachable.into());
        }
        self.inner.send_to(buf, target).await
    }

    fn bind_addr(&self) -> SocketAddr {
        self.inner.bind_addr()
    }
}
