use std::{
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::{Mutex, RwLock};
use rustc_hash::{FxHashMap as HashMap, FxHashSet as HashSet};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error_span, trace, warn};

use crate::{
    Error, Result,
    bucket::Bucket,
    buffer_pool::BufferPool,
    connection::{Connection, ConnectionId, ConnectionOpts, Received},
    constants::{
        BOOTSTRAP_HEARTBEATS, BUFFER_SIZE, CONNECT_FAILURE_BACKOFF, DEFAULT_CONNECTION_RATE,
        DEFAULT_GLOBAL_RATE, DEFAULT_INITIAL_RETRANSMIT, DEFAULT_MAX_CONNECTIONS,
        DEFAULT_RETRANSMIT, MAX_SEGMENT_SIZE,
    },
    error::OptionContext,
    local_stream::spawn_local_stream_tasks,
    message::Segment,
    metrics::{Stats, StatsSnapshot},
    spawn_utils::spawn_with_cancel,
    tcp::{NoConnector, TcpConnector},
    traits::{DefaultTunnelEnvironment, LocalConnector, LocalStream, Transport, TunnelEnvironment},
};

mod scheduler;

#[derive(Default)]
pub struct TunnelOpts {
    /// "host:port" of the other side. Only the entry side needs it.
    pub remote: Option<String>,

    /// How many connections may be open at once.
    pub max_connections: Option<usize>,

    /// Bytes per second each connection may send.
    pub connection_upload: Option<u64>,
    /// Bytes per second each connection asks the remote to stay under.
    pub connection_download: Option<u64>,
    /// Bytes per second all connections together may send.
    pub global_upload: Option<u64>,
    /// Caps what every connection announces to the remote.
    pub global_download: Option<u64>,

    /// When to send a fresh data segment the second time. Zero disables that.
    pub initial_retransmit: Option<Duration>,
    /// How often to resend a data segment until it's ACKed.
    pub retransmit: Option<Duration>,

    /// The parent span for spawned tokio tasks. If not provided, will use
    /// root span.
    pub parent_span: Option<tracing::Id>,

    /// If provided, this can be used to abruptly terminate all spawned tasks.
    pub cancellation_token: CancellationToken,
}

#[derive(Debug, Clone)]
pub(crate) struct ValidatedTunnelOpts {
    remote: Option<String>,
    max_connections: usize,
    connection_upload: u64,
    global_upload: u64,
    receive_ceiling: u32,
    retransmit: Duration,
    initial_retransmit: Option<Duration>,
}

impl TunnelOpts {
    fn validate(&self) -> Result<ValidatedTunnelOpts> {
        let rate = |name: &str, value: Option<u64>, default: u64| {
            let value = value.unwrap_or(default);
            if value < MAX_SEGMENT_SIZE as u64 {
                return Err(Error::InvalidConfig(format!(
                    "{name} = {value} is below one segment ({MAX_SEGMENT_SIZE} bytes)"
                )));
            }
            Ok(value)
        };
        let connection_upload = rate(
            "connection_upload",
            self.connection_upload,
            DEFAULT_CONNECTION_RATE,
        )?;
        let connection_download = rate(
            "connection_download",
            self.connection_download,
            DEFAULT_CONNECTION_RATE,
        )?;
        let global_upload = rate("global_upload", self.global_upload, DEFAULT_GLOBAL_RATE)?;
        let global_download = rate("global_download", self.global_download, DEFAULT_GLOBAL_RATE)?;

        let max_connections = self.max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS);
        if max_connections == 0 {
            return Err(Error::InvalidConfig("max_connections = 0".to_owned()));
        }

        let retransmit = self.retransmit.unwrap_or(DEFAULT_RETRANSMIT);
        if retransmit.is_zero() {
            return Err(Error::InvalidConfig("retransmit interval = 0".to_owned()));
        }
        let initial_retransmit =
            Some(self.initial_retransmit.unwrap_or(DEFAULT_INITIAL_RETRANSMIT))
                .filter(|d| !d.is_zero());

        // The ceiling goes on the wire as a signed 32-bit number.
        let receive_ceiling = connection_download
            .min(global_download)
            .min(i32::MAX as u64) as u32;

        Ok(ValidatedTunnelOpts {
            remote: self.remote.clone(),
            max_connections,
            connection_upload,
            global_upload,
            receive_ceiling,
            retransmit,
            initial_retransmit,
        })
    }
}

/// Carries TCP streams over one UDP socket.
///
/// The entry side ([`Tunnel::new_entry`]) gets local streams handed to it and opens tunnels
/// to the remote. The exit side ([`Tunnel::new_exit`]) opens a local stream through its
/// [`LocalConnector`] whenever the remote starts a new tunnel.
///
/// Background tasks keep the tunnel alive until [`Tunnel::shutdown`] is called or the
/// cancellation token from [`TunnelOpts`] is cancelled.
pub struct Tunnel<T, E, C> {
    transport: T,
    env: E,
    opts: ValidatedTunnelOpts,

    // Present in exit role only.
    connector: Option<C>,

    pool: Arc<BufferPool>,
    global_bucket: Arc<Bucket>,
    connections: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
    // Recently removed connection IDs, and IDs whose local connect failed, with expiry.
    // Exit role only.
    tombstones: Mutex<HashMap<ConnectionId, Instant>>,
    // IDs with a local connect in progress. Exit role only.
    connecting: Mutex<HashSet<ConnectionId>>,

    send_wakeup: Arc<Notify>,
    stats: Stats,

    span: tracing::Span,
    cancellation_token: CancellationToken,
}

pub type EntryTunnel<T, E = DefaultTunnelEnvironment> = Tunnel<T, E, NoConnector>;
pub type ExitTunnel<T, E = DefaultTunnelEnvironment, C = TcpConnector> = Tunnel<T, E, C>;

impl<T: Transport, E: TunnelEnvironment> Tunnel<T, E, NoConnector> {
    pub fn new_entry(transport: T, env: E, opts: TunnelOpts) -> Result<Arc<Self>> {
        Self::new_with_connector(transport, env, opts, None)
    }
}

impl<T: Transport, E: TunnelEnvironment, C: LocalConnector> Tunnel<T, E, C> {
    pub fn new_exit(transport: T, env: E, opts: TunnelOpts, connector: C) -> Result<Arc<Self>> {
        Self::new_with_connector(transport, env, opts, Some(connector))
    }

    fn new_with_connector(
        transport: T,
        env: E,
        opts: TunnelOpts,
        connector: Option<C>,
    ) -> Result<Arc<Self>> {
        let validated = opts.validate()?;
        let now = env.now();
        let role = if connector.is_some() { "exit" } else { "entry" };
        let span = error_span!(
            parent: opts.parent_span.clone(),
            "udp_tunnel",
            addr = ?transport.bind_addr(),
            role
        );
        debug!(parent: &span, opts = ?validated, "starting");

        let tunnel = Arc::new(Self {
            global_bucket: Bucket::new_root(validated.global_upload, validated.global_upload, now),
            transport,
            env,
            opts: validated,
            connector,
            pool: Default::default(),
            connections: Default::default(),
            tombstones: Default::default(),
            connecting: Default::default(),
            send_wakeup: Default::default(),
            stats: Default::default(),
            span: span.clone(),
            cancellation_token: opts.cancellation_token.clone(),
        });

        spawn_with_cancel(
            error_span!(parent: &span, "recv_loop"),
            tunnel.cancellation_token.clone(),
            tunnel.clone().run_recv_loop(),
        );
        spawn_with_cancel(
            error_span!(parent: &span, "send_loop"),
            tunnel.cancellation_token.clone(),
            tunnel.clone().run_send_loop(),
        );
        Ok(tunnel)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.transport.bind_addr()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    /// Stop all tasks and close all connections.
    pub fn shutdown(&self) {
        self.cancellation_token.cancel();
        let connections = std::mem::take(&mut *self.connections.write());
        for conn in connections.into_values() {
            conn.close("tunnel shut down");
        }
        self.stats.set_live_connections(0);
    }

    /// Open a tunnel for a local stream (entry role).
    ///
    /// Resolves the remote and fires a few heartbeats at every address it resolved to. The
    /// first one to answer becomes the peer.
    pub async fn accept_new_local_stream<S: LocalStream>(&self, stream: S) -> Result<ConnectionId> {
        if self.connector.is_some() {
            return Err(Error::WrongRole { expected: "entry" });
        }
        if self.cancellation_token.is_cancelled() {
            return Err(Error::TunnelShutDown);
        }
        let remote = self.opts.remote.as_deref().ok_or(Error::NoRemoteConfigured)?;
        let addrs = tokio::net::lookup_host(remote)
            .await
            .map_err(|source| Error::Resolve {
                remote: remote.to_owned(),
                source,
            })?
            .collect::<Vec<_>>();
        if addrs.is_empty() {
            return Err(Error::ResolvedNothing(remote.to_owned()));
        }

        let id = self.next_connection_id();
        let conn = self.register_connection(id, None, stream)?;

        let mut heartbeat = [0u8; MAX_SEGMENT_SIZE];
        let len = conn.serialize_heartbeat(&mut heartbeat)?;
        let mut last_error = None;
        let mut sent_any = false;
        for addr in addrs {
            debug!(parent: &self.span, id, ?addr, "sending bootstrap heartbeats");
            for _ in 0..BOOTSTRAP_HEARTBEATS {
                match self.transport.send_to(&heartbeat[..len], addr).await {
                    Ok(_) => sent_any = true,
                    Err(e) => {
                        warn!(parent: &self.span, id, ?addr, "error sending bootstrap heartbeat: {e:#}");
                        last_error = Some(e);
                        break;
                    }
                }
            }
        }

        match last_error {
            Some(e) if !sent_any => {
                conn.close("bootstrap failed");
                self.connections.write().remove(&id);
                Err(Error::Send(e))
            }
            _ => Ok(id),
        }
    }

    fn next_connection_id(&self) -> ConnectionId {
        let connections = self.connections.read();
        loop {
            let id = self.env.random_u32();
            if id != 0 && !connections.contains_key(&id) {
                return id;
            }
        }
    }

    fn register_connection<S: LocalStream>(
        &self,
        id: ConnectionId,
        peer: Option<SocketAddr>,
        stream: S,
    ) -> Result<Arc<Connection>> {
        let now = self.env.now();
        let mut connections = self.connections.write();
        if connections.len() >= self.opts.max_connections {
            return Err(Error::TooManyConnections {
                max: self.opts.max_connections,
            });
        }

        let bucket = Bucket::new_child(
            &self.global_bucket,
            self.opts.connection_upload,
            self.opts.connection_upload,
            now,
        );
        let (conn, delivered) = Connection::new(
            id,
            peer,
            ConnectionOpts {
                retransmit: self.opts.retransmit,
                initial_retransmit: self.opts.initial_retransmit,
                receive_ceiling: self.opts.receive_ceiling,
            },
            bucket,
            self.pool.clone(),
            self.cancellation_token.child_token(),
            now,
        );
        connections.insert(id, conn.clone());
        let count = connections.len();
        drop(connections);
        self.stats.set_live_connections(count);
        debug!(parent: &self.span, id, ?peer, count, "connection created");

        spawn_local_stream_tasks(
            &error_span!(parent: &self.span, "conn", id),
            conn.clone(),
            stream,
            delivered,
            self.pool.clone(),
            self.send_wakeup.clone(),
        );
        self.send_wakeup.notify_one();
        Ok(conn)
    }

    fn is_tombstoned(&self, id: ConnectionId, now: Instant) -> bool {
        self.tombstones
            .lock()
            .get(&id)
            .is_some_and(|until| now < *until)
    }

    async fn run_recv_loop(self: Arc<Self>) -> Result<()> {
        let mut buf = vec![0u8; BUFFER_SIZE];
        loop {
            let (len, addr) = match self.transport.recv_from(&mut buf).await {
                Ok(r) => r,
                Err(e) if is_fatal_recv_error(&e) => return Err(Error::Recv(e)),
                Err(e) => {
                    warn_every_ms!(1000, "error receiving: {e:#}");
                    continue;
                }
            };
            self.on_datagram(&buf[..len], addr);
        }
    }

    fn on_datagram(self: &Arc<Self>, datagram: &[u8], addr: SocketAddr) {
        let segment = match Segment::deserialize(datagram) {
            Ok(s) => s,
            Err(e) => {
                debug_every_ms!(1000, ?addr, len = datagram.len(), "dropping datagram: {e}");
                return;
            }
        };
        trace!(?addr, ?segment, "received");

        let id = segment.header.connection_id;
        let existing = self.connections.read().get(&id).cloned();
        match existing {
            Some(conn) => self.process_segment(&conn, &segment, datagram.len(), addr),
            None => {
                if !self.open_for_unknown(id, addr, datagram) {
                    self.stats.on_received(datagram.len(), false);
                }
            }
        }
    }

    fn process_segment(
        &self,
        conn: &Connection,
        segment: &Segment<'_>,
        len: usize,
        addr: SocketAddr,
    ) {
        let now = self.env.now();
        match conn.on_segment(&segment.header, segment.payload, addr, now) {
            Ok(received) => {
                if let Received::Delivered(count) = received {
                    trace!(id = conn.id(), count, "delivered to local stream");
                }
                self.stats.on_received(len, received.is_unique_data());
            }
            Err(e) => {
                self.stats.on_received(len, false);
                conn.close(format_args!("error processing segment: {e:#}"));
                debug_assert!(!e.is_bug(), "{e:#}");
                self.send_wakeup.notify_one();
            }
        }
    }

    // A segment for an ID we don't know. Exit role opens a local stream for it in the
    // background, unless it was recently removed or failed to connect. The segment is
    // processed once the connection exists. Returns false if the segment was dropped.
    fn open_for_unknown(
        self: &Arc<Self>,
        id: ConnectionId,
        addr: SocketAddr,
        datagram: &[u8],
    ) -> bool {
        if self.connector.is_none() {
            debug_every_ms!(1000, id, ?addr, "dropping segment for unknown connection");
            return false;
        }
        if self.is_tombstoned(id, self.env.now()) {
            trace!(id, ?addr, "dropping segment for removed connection");
            return false;
        }

        let mut connecting = self.connecting.lock();
        if connecting.contains(&id) {
            trace!(id, ?addr, "still connecting, dropping segment");
            return false;
        }
        if self.connection_count() + connecting.len() >= self.opts.max_connections {
            debug_every_ms!(1000, id, ?addr, "too many connections, dropping segment");
            return false;
        }
        connecting.insert(id);
        drop(connecting);

        spawn_with_cancel(
            error_span!(parent: &self.span, "connect", id),
            self.cancellation_token.clone(),
            self.clone().connect_local(id, addr, datagram.to_vec()),
        );
        true
    }

    async fn connect_local(
        self: Arc<Self>,
        id: ConnectionId,
        addr: SocketAddr,
        datagram: Vec<u8>,
    ) -> Result<()> {
        let connector = self.connector.as_ref().context("connecting without a connector")?;
        let conn = match connector.connect(id).await {
            Some(stream) => self
                .register_connection(id, Some(addr), stream)
                .inspect_err(|e| debug!(id, "error registering connection: {e:#}"))
                .ok(),
            None => {
                warn!(id, "could not open local stream for new connection, is the service down?");
                self.tombstones
                    .lock()
                    .insert(id, self.env.now() + CONNECT_FAILURE_BACKOFF);
                None
            }
        };
        // Only now, so that segments arriving meanwhile don't start a second connect.
        self.connecting.lock().remove(&id);

        match (conn, Segment::deserialize(&datagram)) {
            (Some(conn), Ok(segment)) => self.process_segment(&conn, &segment, datagram.len(), addr),
            _ => self.stats.on_received(datagram.len(), false),
        }
        Ok(())
    }
}

// Errors from which the socket won't recover. Others, like ICMP-triggered resets, are
// per-datagram.
fn is_fatal_recv_error(e: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    matches!(
        e.kind(),
        ErrorKind::BrokenPipe | ErrorKind::NotConnected | ErrorKind::InvalidInput
    )
}
