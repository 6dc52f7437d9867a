use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::Mutex;

use crate::traits::TunnelEnvironment;

pub struct MockRandom {
    pub current: u32,
}

impl Default for MockRandom {
    fn default() -> Self {
        Self { current: 1 }
    }
}

impl MockRandom {
    fn next(&mut self) -> u32 {
        let current = self.current;
        self.current = self.current.wrapping_add(100);
        current
    }
}

struct MockTunnelEnvironmentInner {
    now: Instant,
    random: MockRandom,
}

#[derive(Clone)]
pub struct MockTunnelEnvironment {
    inner: Arc<Mutex<MockTunnelEnvironmentInner>>,
}

impl MockTunnelEnvironment {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MockTunnelEnvironmentInner {
                now: Instant::now(),
                random: Default::default(),
            })),
        }
    }

    pub fn increment_now(&self, dur: Duration) {
        self.inner.lock().now += dur;
    }
}

impl TunnelEnvironment for MockTunnelEnvironment {
    fn now(&self) -> Instant {
        self.inner.lock().now
    }

    fn random_u32(&self) -> u32 {
        self.inner.lock().random.next()
    }
}
