use std::{sync::Arc, time::Instant};

use parking_lot::{Mutex, MutexGuard};
use tracing::debug;

use crate::constants::MAX_SEGMENT_SIZE;

#[derive(Debug)]
struct BucketState {
    // bytes
    capacity: f64,
    // bytes per second
    rate: f64,
    tokens: f64,
    last_refill: Instant,
}

impl BucketState {
    // last_refill never moves backwards. An older instant from a racing caller adds nothing.
    fn refill(&mut self, now: Instant) {
        if now <= self.last_refill {
            return;
        }
        let elapsed = (now - self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).clamp(0., self.capacity);
        self.last_refill = now;
    }
}

/// A token bucket that may have a parent. Bytes taken from a bucket are also taken from
/// every ancestor, so a global limit and per-connection limits hold at the same time.
///
/// Refill is lazy: tokens are added on access based on the time passed since the previous
/// access.
#[derive(Debug)]
pub struct Bucket {
    parent: Option<Arc<Bucket>>,
    state: Mutex<BucketState>,
}

impl Bucket {
    pub fn new_root(rate: u64, capacity: u64, now: Instant) -> Arc<Self> {
        Arc::new(Self::new(None, rate, capacity, now))
    }

    pub fn new_child(parent: &Arc<Bucket>, rate: u64, capacity: u64, now: Instant) -> Arc<Self> {
        Arc::new(Self::new(Some(parent.clone()), rate, capacity, now))
    }

    fn new(parent: Option<Arc<Bucket>>, rate: u64, capacity: u64, now: Instant) -> Self {
        Self {
            parent,
            state: Mutex::new(BucketState {
                capacity: capacity as f64,
                rate: rate as f64,
                tokens: capacity as f64,
                last_refill: now,
            }),
        }
    }

    // Locks self and all ancestors, root first. Every caller takes locks in this order, so
    // chains sharing ancestors can't deadlock.
    fn lock_chain(&self) -> Vec<MutexGuard<'_, BucketState>> {
        let mut chain: Vec<&Bucket> = Vec::with_capacity(2);
        let mut current = Some(self);
        while let Some(b) = current {
            chain.push(b);
            current = b.parent.as_deref();
        }
        chain.into_iter().rev().map(|b| b.state.lock()).collect()
    }

    fn refill_and_check(chain: &mut [MutexGuard<'_, BucketState>], bytes: f64, now: Instant) -> bool {
        let mut ok = true;
        for state in chain.iter_mut() {
            state.refill(now);
            ok &= state.tokens >= bytes;
        }
        ok
    }

    /// True if this bucket and all its ancestors have at least `bytes` tokens.
    pub fn test(&self, bytes: u64, now: Instant) -> bool {
        let mut chain = self.lock_chain();
        Self::refill_and_check(&mut chain, bytes as f64, now)
    }

    /// Take `bytes` from this bucket and all its ancestors, or from none of them.
    pub fn consume(&self, bytes: u64, now: Instant) -> bool {
        let bytes = bytes as f64;
        let mut chain = self.lock_chain();
        if !Self::refill_and_check(&mut chain, bytes, now) {
            return false;
        }
        for state in chain.iter_mut() {
            state.tokens -= bytes;
        }
        true
    }

    /// Change the limits of this bucket, keeping the tokens it has accumulated.
    pub fn reconfigure(&self, rate: u64, capacity: u64) {
        let mut g = self.state.lock();
        g.rate = rate as f64;
        g.capacity = capacity as f64;
        g.tokens = g.tokens.min(g.capacity);
    }

    /// Lower the limits to the given ones, if they are stricter. Never raises anything.
    ///
    /// Capacity won't go below one full segment, otherwise nothing could ever be sent.
    pub fn limit_rate(&self, rate: u64, capacity: u64) {
        let rate = rate as f64;
        let capacity = capacity.max(MAX_SEGMENT_SIZE as u64) as f64;
        let mut g = self.state.lock();
        let (prev_rate, prev_capacity) = (g.rate, g.capacity);
        g.rate = g.rate.min(rate);
        g.capacity = g.capacity.min(capacity);
        g.tokens = g.tokens.min(g.capacity);
        if g.rate != prev_rate || g.capacity != prev_capacity {
            debug!(
                prev_rate,
                prev_capacity,
                rate = g.rate,
                capacity = g.capacity,
                "bucket limits lowered"
            );
        }
    }

    pub fn rate(&self) -> u64 {
        self.state.lock().rate as u64
    }

    pub fn capacity(&self) -> u64 {
        self.state.lock().capacity as u64
    }

    /// Tokens available in this bucket alone, after refilling it.
    pub fn tokens(&self, now: Instant) -> f64 {
        let mut g = self.state.lock();
        g.refill(now);
        g.tokens
    }
}
