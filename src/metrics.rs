use std::sync::atomic::{AtomicU64, Ordering};

#[cfg(feature = "export-metrics")]
mod export {
    use lazy_static::lazy_static;
    use metrics::{Counter, Gauge, counter, gauge};

    pub struct Metrics {
        pub sent_packets: Counter,
        pub sent_unique_packets: Counter,
        pub sent_bytes: Counter,
        pub sent_unique_bytes: Counter,
        pub received_packets: Counter,
        pub received_unique_packets: Counter,
        pub received_bytes: Counter,
        pub received_unique_bytes: Counter,
        pub live_connections: Gauge,
    }

    impl Metrics {
        fn new() -> Self {
            Self {
                sent_packets: counter!("udp_tunnel_sent_packets"),
                sent_unique_packets: counter!("udp_tunnel_sent_unique_packets"),
                sent_bytes: counter!("udp_tunnel_sent_bytes"),
                sent_unique_bytes: counter!("udp_tunnel_sent_unique_bytes"),
                received_packets: counter!("udp_tunnel_received_packets"),
                received_unique_packets: counter!("udp_tunnel_received_unique_packets"),
                received_bytes: counter!("udp_tunnel_received_bytes"),
                received_unique_bytes: counter!("udp_tunnel_received_unique_bytes"),
                live_connections: gauge!("udp_tunnel_live_connections"),
            }
        }
    }

    lazy_static! {
        pub static ref METRICS: Metrics = Metrics::new();
    }
}

// Mirror an increment into the metrics crate, if enabled.
macro_rules! export {
    ($field:ident, $value:expr) => {
        #[cfg(feature = "export-metrics")]
        export::METRICS.$field.increment($value);
    };
}

/// Traffic counters of one tunnel.
///
/// Bytes are whole datagrams. "Unique" counts data segments the first time they are sent or
/// received, so the difference to the totals is retransmission and duplicate overhead.
#[derive(Default, Debug)]
pub struct Stats {
    sent_packets: AtomicU64,
    sent_unique_packets: AtomicU64,
    sent_bytes: AtomicU64,
    sent_unique_bytes: AtomicU64,
    received_packets: AtomicU64,
    received_unique_packets: AtomicU64,
    received_bytes: AtomicU64,
    received_unique_bytes: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub sent_packets: u64,
    pub sent_unique_packets: u64,
    pub sent_bytes: u64,
    pub sent_unique_bytes: u64,
    pub received_packets: u64,
    pub received_unique_packets: u64,
    pub received_bytes: u64,
    pub received_unique_bytes: u64,
}

fn add(counter: &AtomicU64, value: u64) {
    counter.fetch_add(value, Ordering::Relaxed);
}

impl Stats {
    pub(crate) fn on_sent(&self, len: usize, unique: bool) {
        let len = len as u64;
        add(&self.sent_packets, 1);
        add(&self.sent_bytes, len);
        export!(sent_packets, 1);
        export!(sent_bytes, len);
        if unique {
            add(&self.sent_unique_packets, 1);
            add(&self.sent_unique_bytes, len);
            export!(sent_unique_packets, 1);
            export!(sent_unique_bytes, len);
        }
    }

    pub(crate) fn on_received(&self, len: usize, unique: bool) {
        let len = len as u64;
        add(&self.received_packets, 1);
        add(&self.received_bytes, len);
        export!(received_packets, 1);
        export!(received_bytes, len);
        if unique {
            add(&self.received_unique_packets, 1);
            add(&self.received_unique_bytes, len);
            export!(received_unique_packets, 1);
            export!(received_unique_bytes, len);
        }
    }

    pub(crate) fn set_live_connections(&self, _count: usize) {
        #[cfg(feature = "export-metrics")]
        export::METRICS.live_connections.set(_count as f64);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            sent_packets: get(&self.sent_packets),
            sent_unique_packets: get(&self.sent_unique_packets),
            sent_bytes: get(&self.sent_bytes),
            sent_unique_bytes: get(&self.sent_unique_bytes),
            received_packets: get(&self.received_packets),
            received_unique_packets: get(&self.received_unique_packets),
            received_bytes: get(&self.received_bytes),
            received_unique_bytes: get(&self.received_unique_bytes),
        }
    }
}
