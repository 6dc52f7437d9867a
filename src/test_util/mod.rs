use std::net::{Ipv4Addr, SocketAddr};

pub mod env;
pub mod transport;

pub fn setup_test_logging() {
    if std::env::var("RUST_LOG").is_err() {
        // SAFETY: only tests call this, before anything reads the environment concurrently.
        unsafe { std::env::set_var("RUST_LOG", "trace") };
    }
    let _ = tracing_subscriber::fmt::try_init();
}

pub const ADDR_1: SocketAddr = SocketAddr::new(std::net::IpAddr::V4(Ipv4Addr::LOCALHOST), 1);
pub const ADDR_2: SocketAddr = SocketAddr::new(std::net::IpAddr::V4(Ipv4Addr::LOCALHOST), 2);
pub const ADDR_3: SocketAddr = SocketAddr::new(std::net::IpAddr::V4(Ipv4Addr::LOCALHOST), 3);
