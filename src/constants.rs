use std::time::Duration;

// "DTT2"
pub const MAGIC: [u8; 4] = *b"DTT2";

pub const HEADER_SIZE: usize = 16;
pub const MAX_PAYLOAD: usize = 500;
pub const MAX_SEGMENT_SIZE: usize = HEADER_SIZE + MAX_PAYLOAD;

// Every pooled buffer can hold at least an ethernet MTU worth of bytes.
pub const BUFFER_SIZE: usize = 1500;

// Free buffers above this count are dropped instead of being kept around.
pub const POOL_HIGH_WATER: usize = 1000;

// Send-side gating amount. Production doesn't start unless a full segment payload fits.
pub const SEND_GATE_BYTES: u64 = MAX_PAYLOAD as u64;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(100);
pub const LIVENESS_TIMEOUT: Duration = Duration::from_secs(5);
pub const RATE_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(1);

// How long IDs of removed connections are remembered in exit role.
pub const TOMBSTONE_TTL: Duration = Duration::from_secs(10);

// After a failed local connect, segments for that ID are dropped for this long.
pub const CONNECT_FAILURE_BACKOFF: Duration = Duration::from_secs(1);

// Don't put more than this many unacked segments on the wire.
pub const MAX_IN_FLIGHT: u16 = 10_000;

// The TCP reader blocks once this many chunks are waiting to be segmented.
pub const MAX_UNSENT_CHUNKS: usize = 64;

pub const IDLE_WAIT: Duration = Duration::from_millis(100);

// Bucket waits are a bounded retry so the scheduler stays responsive.
pub const BUCKET_RETRY_STEP: Duration = Duration::from_millis(1);
pub const BUCKET_MAX_RETRIES: usize = 100;

// How many copies of the first heartbeat to fire at each resolved address.
pub const BOOTSTRAP_HEARTBEATS: usize = 4;

pub const DEFAULT_TCP_PORT: u16 = 25565;
pub const DEFAULT_UDP_PORT: u16 = 56552;
pub const DEFAULT_MAX_CONNECTIONS: usize = 10;
pub const DEFAULT_CONNECTION_RATE: u64 = 1024 * 1024;
pub const DEFAULT_GLOBAL_RATE: u64 = 2 * 1024 * 1024;
pub const DEFAULT_INITIAL_RETRANSMIT: Duration = Duration::from_millis(5);
pub const DEFAULT_RETRANSMIT: Duration = Duration::from_millis(100);

// Try to fit this many full segments per connection into the kernel's UDP receive buffer.
pub const UDP_RCVBUF_SEGMENTS_PER_CONNECTION: usize = 2048;
