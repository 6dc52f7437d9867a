// TODO: half-close. A local stream EOF tears the whole connection down right away, so bytes
// still queued for the remote are dropped. Needs a FIN-like segment type.

#[macro_use]
mod macros;

mod bucket;
mod buffer_pool;
mod connection;
mod constants;
#[cfg(test)]
mod e2e_tests;
mod error;
mod local_stream;
mod message;
mod metrics;
pub mod raw;
mod seq_nr;
mod spawn_utils;
mod tcp;
#[cfg(test)]
mod test_util;
mod traits;
mod tunnel;
mod utils;

pub use bucket::Bucket;
pub use buffer_pool::{Buffer, BufferPool};
pub use connection::ConnectionId;
pub use constants::{
    DEFAULT_TCP_PORT, DEFAULT_UDP_PORT, MAX_SEGMENT_SIZE, UDP_RCVBUF_SEGMENTS_PER_CONNECTION,
};
pub use error::{Error, Result};
pub use message::{InvalidSegment, Segment};
pub use metrics::StatsSnapshot;
pub use seq_nr::SeqNr;
pub use tcp::{NoConnector, TcpConnector};
pub use traits::{
    DefaultTunnelEnvironment, LocalConnector, LocalStream, Transport, TunnelEnvironment,
    UdpTransport,
};
pub use tunnel::{EntryTunnel, ExitTunnel, Tunnel, TunnelOpts};
