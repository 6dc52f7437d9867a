use std::{
    net::SocketAddr,
    sync::atomic::{AtomicUsize, Ordering},
};

use rand::Rng;

use crate::Transport;

/// Drops LOSS_PCT percent of outgoing datagrams on the floor.
pub struct LossyTransport<T, const LOSS_PCT: usize> {
    inner: T,
    sent: AtomicUsize,
    lost: AtomicUsize,
}

impl<T, const LOSS_PCT: usize> LossyTransport<T, LOSS_PCT> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            sent: AtomicUsize::new(0),
            lost: AtomicUsize::new(0),
        }
    }

    fn loss(&self) -> bool {
        let loss = rand::rng().random_bool(LOSS_PCT as f64 / 100.);
        if loss {
            self.lost.fetch_add(1, Ordering::Relaxed);
        } else {
            self.sent.fetch_add(1, Ordering::Relaxed);
        }
        loss
    }

    pub fn sent(&self) -> usize {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn lost(&self) -> usize {
        self.lost.load(Ordering::Relaxed)
    }
}

impl<T: Transport, const LOSS_PCT: usize> Transport for LossyTransport<T, LOSS_PCT> {
    async fn recv_from<'a>(&'a self, buf: &'a mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
        self.inner.recv_from(buf).await
    }

    async fn send_to<'a>(&'a self, buf: &'a [u8], target: SocketAddr) -> std::io::Result<usize> {
        if self.loss() {
            return Ok(buf.len());
        }
        self.inner.send_to(buf, target).await
    }

    fn bind_addr(&self) -> SocketAddr {
        self.inner.bind_addr()
    }
}
